//! Live player state and the per-tick recency buffers.

use crate::error::{Result, ServerError};
use log::info;
use shared::PlayerState;
use std::collections::HashMap;
use tokio::sync::RwLock;

/// Identities that changed since the last drain. Only membership matters.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct Recents {
    pub connects: Vec<String>,
    pub disconnects: Vec<String>,
    pub updates: Vec<String>,
}

impl Recents {
    pub fn is_empty(&self) -> bool {
        self.connects.is_empty() && self.disconnects.is_empty() && self.updates.is_empty()
    }
}

#[derive(Debug, Default)]
struct PlayerList {
    players: HashMap<String, PlayerState>,
    recents: Recents,
}

/// Owns the identity → state map of connected players.
///
/// The tracker records every change in the recency buffers without
/// deduplicating; coalescing happens when a snapshot is built.
#[derive(Debug, Default)]
pub struct PlayerTracker {
    inner: RwLock<PlayerList>,
}

impl PlayerTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add_player(&self, username: &str, state: PlayerState) -> Result<()> {
        let mut list = self.inner.write().await;
        if list.players.contains_key(username) {
            return Err(ServerError::AlreadyExists(username.to_string()));
        }

        list.players.insert(username.to_string(), state);
        list.recents.connects.push(username.to_string());
        info!("Added player {} at ({}, {})", username, state.position.x, state.position.y);
        Ok(())
    }

    /// Returns true if the player was removed, false if it was not in the list.
    pub async fn remove_player(&self, username: &str) -> bool {
        let mut list = self.inner.write().await;
        if list.players.remove(username).is_none() {
            return false;
        }

        list.recents.disconnects.push(username.to_string());
        info!("Removed player {}", username);
        true
    }

    /// Overwrites position and velocity. No plausibility checks happen here.
    pub async fn update_player(&self, username: &str, state: PlayerState) -> Result<()> {
        let mut list = self.inner.write().await;
        match list.players.get_mut(username) {
            Some(current) => *current = state,
            None => return Err(ServerError::NotFound(format!("player {}", username))),
        }

        list.recents.updates.push(username.to_string());
        Ok(())
    }

    pub async fn get(&self, username: &str) -> Option<PlayerState> {
        self.inner.read().await.players.get(username).copied()
    }

    /// Copy of the current player map.
    pub async fn snapshot(&self) -> HashMap<String, PlayerState> {
        self.inner.read().await.players.clone()
    }

    /// Takes the recency buffers, leaving them empty.
    pub async fn drain_recents(&self) -> Recents {
        std::mem::take(&mut self.inner.write().await.recents)
    }

    /// Drains the recency buffers and copies the player map under one lock,
    /// so the states match the drained events exactly.
    pub async fn drain_with_snapshot(&self) -> (Recents, HashMap<String, PlayerState>) {
        let mut list = self.inner.write().await;
        let recents = std::mem::take(&mut list.recents);
        (recents, list.players.clone())
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.players.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.players.is_empty()
    }
}
