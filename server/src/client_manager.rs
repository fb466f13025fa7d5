//! Live session bookkeeping for connected players
//!
//! The ClientManager maps each player identity to the outbound half of its
//! session and owns the liveness monitor that probes it. It is the only place
//! a session is torn down, so every cancellation path ends in the same cleanup:
//! - the session leaves the registry
//! - the player leaves the tracker (recorded as a disconnect)
//! - the liveness monitor and session task are cancelled
//!
//! Outbound traffic never touches the network while a lock is held. A
//! [`SessionHandle`] is a bounded in-memory channel drained by the session's
//! writer task; a full channel means the client is not keeping up.

use crate::error::{Result, ServerError};
use crate::players::PlayerTracker;
use bytes::Bytes;
use log::{debug, error, info, warn};
use parking_lot::RwLock;
use shared::wire::encode_packet;
use shared::{GameState, ServerPacket};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendError {
    /// The session's writer task is gone; the stream ended.
    Closed,
    /// The outbound buffer is full.
    Lagging,
}

/// Outbound half of a session. Frames are encoded packets.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    tx: mpsc::Sender<Bytes>,
}

impl SessionHandle {
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<Bytes>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }

    /// Queues a frame without waiting.
    pub fn send_frame(&self, frame: Bytes) -> Result<(), SendError> {
        self.tx.try_send(frame).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => SendError::Lagging,
            mpsc::error::TrySendError::Closed(_) => SendError::Closed,
        })
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

#[derive(Debug)]
struct Session {
    id: u64,
    handle: SessionHandle,
    cancel: CancellationToken,
}

/// Returned to whoever registered a session. The token fires when the
/// registry ends the session for any reason.
#[derive(Debug, Clone)]
pub struct SessionTicket {
    pub id: u64,
    pub cancel: CancellationToken,
}

pub struct ClientManager {
    sessions: RwLock<HashMap<String, Session>>,
    players: Arc<PlayerTracker>,
    heartbeat_interval: Duration,
    next_session_id: AtomicU64,
}

impl ClientManager {
    pub fn new(players: Arc<PlayerTracker>, heartbeat_interval: Duration) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            players,
            heartbeat_interval,
            next_session_id: AtomicU64::new(1),
        }
    }

    /// Stores the session and starts its liveness monitor.
    ///
    /// Fails with `AlreadyConnected` if `username` already has a session; the
    /// existing one is left untouched.
    pub fn register(
        self: &Arc<Self>,
        username: &str,
        handle: SessionHandle,
    ) -> Result<SessionTicket> {
        let ticket = {
            let mut sessions = self.sessions.write();
            if sessions.contains_key(username) {
                return Err(ServerError::AlreadyConnected(username.to_string()));
            }

            let ticket = SessionTicket {
                id: self.next_session_id.fetch_add(1, Ordering::Relaxed),
                cancel: CancellationToken::new(),
            };
            sessions.insert(
                username.to_string(),
                Session {
                    id: ticket.id,
                    handle: handle.clone(),
                    cancel: ticket.cancel.clone(),
                },
            );
            ticket
        };

        tokio::spawn(Arc::clone(self).monitor(
            username.to_string(),
            ticket.id,
            handle,
            ticket.cancel.clone(),
        ));

        info!("Session {} registered for {}", ticket.id, username);
        Ok(ticket)
    }

    /// Ends whatever session `username` has. Returns false if there was none.
    pub async fn unregister(&self, username: &str) -> bool {
        let removed = self.sessions.write().remove(username);
        match removed {
            Some(session) => {
                self.teardown(username, session).await;
                true
            }
            None => false,
        }
    }

    /// Ends the session only if `session_id` is still the one registered
    /// under `username`. A newer session for the same player survives.
    pub async fn end_session(&self, username: &str, session_id: u64) -> bool {
        let removed = {
            let mut sessions = self.sessions.write();
            match sessions.get(username) {
                Some(session) if session.id == session_id => sessions.remove(username),
                _ => None,
            }
        };

        match removed {
            Some(session) => {
                self.teardown(username, session).await;
                true
            }
            None => false,
        }
    }

    async fn teardown(&self, username: &str, session: Session) {
        // The player is gone before the session task sees the cancellation
        self.players.remove_player(username).await;
        session.cancel.cancel();
        info!("Session {} for {} ended", session.id, username);
    }

    pub fn lookup(&self, username: &str) -> Option<SessionHandle> {
        self.sessions
            .read()
            .get(username)
            .map(|session| session.handle.clone())
    }

    /// Sends `snapshot` to every session and returns how many accepted it.
    ///
    /// The packet is encoded once. Sessions that fail are collected under the
    /// read lock and ended afterwards, so one bad client never holds up the
    /// rest.
    pub async fn broadcast(&self, snapshot: GameState) -> usize {
        let frame = match encode_packet(&ServerPacket::GameState(snapshot)) {
            Ok(frame) => frame,
            Err(e) => {
                error!("Failed to encode snapshot: {}", e);
                return 0;
            }
        };

        let mut delivered = 0;
        let mut failed = Vec::new();
        {
            let sessions = self.sessions.read();
            for (username, session) in sessions.iter() {
                match session.handle.send_frame(frame.clone()) {
                    Ok(()) => delivered += 1,
                    Err(e) => {
                        warn!("Dropping {} after failed send: {:?}", username, e);
                        failed.push((username.clone(), session.id));
                    }
                }
            }
        }

        for (username, id) in failed {
            self.end_session(&username, id).await;
        }
        delivered
    }

    async fn monitor(
        self: Arc<Self>,
        username: String,
        session_id: u64,
        handle: SessionHandle,
        cancel: CancellationToken,
    ) {
        let probe = match encode_packet(&ServerPacket::GameState(GameState::default())) {
            Ok(frame) => frame,
            Err(e) => {
                error!("Failed to encode keep-alive probe: {}", e);
                return;
            }
        };

        let mut ticker = interval_at(
            Instant::now() + self.heartbeat_interval,
            self.heartbeat_interval,
        );
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => match handle.send_frame(probe.clone()) {
                    Ok(()) => {}
                    // Session task saw the end of the stream and cleans up itself
                    Err(SendError::Closed) => break,
                    Err(SendError::Lagging) => {
                        warn!("Keep-alive to {} failed, ending session", username);
                        self.end_session(&username, session_id).await;
                        break;
                    }
                },
            }
        }
        debug!("Liveness monitor for session {} stopped", session_id);
    }

    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.read().is_empty()
    }

    /// Identities with a live session, sorted.
    pub fn connected_players(&self) -> Vec<String> {
        let mut names: Vec<String> = self.sessions.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Ends every session.
    pub async fn shutdown(&self) {
        let sessions: Vec<(String, Session)> = self.sessions.write().drain().collect();
        for (username, session) in sessions {
            self.teardown(&username, session).await;
        }
    }
}
