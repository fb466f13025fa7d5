//! Fixed-rate broadcast of coalesced player and tile changes.

use crate::client_manager::ClientManager;
use crate::players::{PlayerTracker, Recents};
use crate::tile_queue::TileUpdateQueue;
use log::{debug, info};
use shared::{GameState, PlayerEvent, PlayerEventType, PlayerState, TileUpdate};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

/// Builds one tick's snapshot from drained recency buffers.
///
/// Each identity yields at most one event. Connects and disconnects are
/// handled first; their type follows whether the player is still present,
/// so a connect and disconnect in the same tick collapse into one event.
/// Updates for identities already covered are skipped and the scan
/// continues. Tile updates are attached in drain order.
pub fn build_game_state(
    players: &HashMap<String, PlayerState>,
    recents: Recents,
    tile_updates: Vec<TileUpdate>,
) -> GameState {
    let mut seen = HashSet::new();
    let mut events = Vec::new();

    for username in recents.connects.into_iter().chain(recents.disconnects) {
        if !seen.insert(username.clone()) {
            continue;
        }

        let state = players.get(&username).copied();
        let event_type = match state {
            Some(_) => PlayerEventType::Connect,
            None => PlayerEventType::Disconnect,
        };
        events.push(PlayerEvent {
            username,
            event_type,
            state,
        });
    }

    for username in recents.updates {
        if seen.contains(&username) {
            continue;
        }
        let Some(state) = players.get(&username).copied() else {
            continue;
        };

        seen.insert(username.clone());
        events.push(PlayerEvent {
            username,
            event_type: PlayerEventType::Update,
            state: Some(state),
        });
    }

    GameState {
        players: events,
        tile_updates,
    }
}

pub struct BroadcastScheduler {
    players: Arc<PlayerTracker>,
    tiles: Arc<TileUpdateQueue>,
    clients: Arc<ClientManager>,
    tick_duration: Duration,
    tick: u64,
}

impl BroadcastScheduler {
    pub fn new(
        players: Arc<PlayerTracker>,
        tiles: Arc<TileUpdateQueue>,
        clients: Arc<ClientManager>,
        tick_rate: u32,
    ) -> Self {
        Self {
            players,
            tiles,
            clients,
            tick_duration: Duration::from_secs_f64(1.0 / tick_rate.max(1) as f64),
            tick: 0,
        }
    }

    pub fn tick_duration(&self) -> Duration {
        self.tick_duration
    }

    /// Runs one tick. Returns the number of sessions reached, or `None` when
    /// there was nothing to send.
    pub async fn tick(&mut self) -> Option<usize> {
        self.tick += 1;

        let (recents, players) = self.players.drain_with_snapshot().await;
        let tile_updates = self.tiles.drain_all();

        let snapshot = build_game_state(&players, recents, tile_updates);
        if snapshot.is_empty() {
            return None;
        }

        let (player_events, tile_events) = (snapshot.players.len(), snapshot.tile_updates.len());
        let delivered = self.clients.broadcast(snapshot).await;
        debug!(
            "Tick {}: {} player events, {} tile updates, sent to {} sessions",
            self.tick, player_events, tile_events, delivered
        );
        Some(delivered)
    }

    /// Ticks until `shutdown` fires. Ticks missed under load are dropped.
    pub async fn run(mut self, shutdown: CancellationToken) {
        let mut ticker = interval(self.tick_duration);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        info!(
            "Broadcasting every {:.2}ms",
            self.tick_duration.as_secs_f64() * 1000.0
        );

        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    self.tick().await;
                }
            }
        }

        info!("Broadcast scheduler stopped after {} ticks", self.tick);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client_manager::SessionHandle;
    use bytes::Bytes;
    use shared::wire::decode_packet;
    use shared::{ChunkCoord, ServerPacket, TileCoord, Vector2};

    fn state(x: f32) -> PlayerState {
        PlayerState::new(Vector2::new(x, 0.0), Vector2::default())
    }

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    fn tile(n: u32) -> TileUpdate {
        TileUpdate {
            chunk: ChunkCoord::new(0, 0),
            tile: TileCoord::new(n, n),
            tile_data: vec![n as u8],
        }
    }

    #[test]
    fn test_connect_absorbs_updates() {
        let players = HashMap::from([
            ("alice".to_string(), state(3.0)),
            ("bob".to_string(), state(7.0)),
        ]);
        let recents = Recents {
            connects: names(&["alice"]),
            disconnects: vec![],
            updates: names(&["alice", "alice", "bob", "alice"]),
        };

        let snapshot = build_game_state(&players, recents, vec![]);

        assert_eq!(
            snapshot.players,
            vec![
                PlayerEvent {
                    username: "alice".into(),
                    event_type: PlayerEventType::Connect,
                    state: Some(state(3.0)),
                },
                PlayerEvent {
                    username: "bob".into(),
                    event_type: PlayerEventType::Update,
                    state: Some(state(7.0)),
                },
            ]
        );
    }

    #[test]
    fn test_repeated_updates_collapse_to_latest() {
        let players = HashMap::from([("bob".to_string(), state(9.0))]);
        let recents = Recents {
            connects: vec![],
            disconnects: vec![],
            updates: names(&["bob", "bob", "bob"]),
        };

        let snapshot = build_game_state(&players, recents, vec![]);
        assert_eq!(snapshot.players.len(), 1);
        assert_eq!(snapshot.players[0].state, Some(state(9.0)));
    }

    #[test]
    fn test_connect_and_disconnect_follow_presence() {
        let players = HashMap::from([("back".to_string(), state(1.0))]);
        let recents = Recents {
            connects: names(&["gone", "back"]),
            disconnects: names(&["gone", "back"]),
            updates: names(&["gone"]),
        };

        let snapshot = build_game_state(&players, recents, vec![]);

        assert_eq!(snapshot.players.len(), 2);
        assert_eq!(snapshot.players[0].username, "gone");
        assert_eq!(snapshot.players[0].event_type, PlayerEventType::Disconnect);
        assert_eq!(snapshot.players[0].state, None);
        assert_eq!(snapshot.players[1].username, "back");
        assert_eq!(snapshot.players[1].event_type, PlayerEventType::Connect);
        assert_eq!(snapshot.players[1].state, Some(state(1.0)));
    }

    #[test]
    fn test_tile_updates_keep_drain_order() {
        let snapshot = build_game_state(
            &HashMap::new(),
            Recents::default(),
            vec![tile(2), tile(0), tile(1)],
        );

        assert!(snapshot.players.is_empty());
        assert_eq!(snapshot.tile_updates, vec![tile(2), tile(0), tile(1)]);
    }

    fn scheduler() -> (
        BroadcastScheduler,
        Arc<PlayerTracker>,
        Arc<TileUpdateQueue>,
        Arc<ClientManager>,
    ) {
        let players = Arc::new(PlayerTracker::new());
        let tiles = Arc::new(TileUpdateQueue::new());
        let clients = Arc::new(ClientManager::new(
            Arc::clone(&players),
            Duration::from_secs(3600),
        ));
        let scheduler = BroadcastScheduler::new(
            Arc::clone(&players),
            Arc::clone(&tiles),
            Arc::clone(&clients),
            60,
        );
        (scheduler, players, tiles, clients)
    }

    fn decode_state(frame: &Bytes) -> GameState {
        match decode_packet(frame).unwrap() {
            ServerPacket::GameState(state) => state,
            other => panic!("expected a snapshot, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_empty_tick_sends_nothing() {
        let (mut scheduler, _, _, clients) = scheduler();
        let (handle, mut rx) = SessionHandle::channel(8);
        clients.register("alice", handle).unwrap();

        assert_eq!(scheduler.tick().await, None);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_tick_broadcasts_and_drains() {
        let (mut scheduler, players, tiles, clients) = scheduler();
        let (handle, mut rx) = SessionHandle::channel(8);
        players.add_player("alice", state(0.0)).await.unwrap();
        clients.register("alice", handle).unwrap();
        players.update_player("alice", state(5.0)).await.unwrap();
        tiles.push(tile(1));

        assert_eq!(scheduler.tick().await, Some(1));

        let snapshot = decode_state(&rx.recv().await.unwrap());
        assert_eq!(snapshot.players.len(), 1);
        assert_eq!(snapshot.players[0].event_type, PlayerEventType::Connect);
        assert_eq!(snapshot.players[0].state, Some(state(5.0)));
        assert_eq!(snapshot.tile_updates, vec![tile(1)]);

        // Everything was consumed by the first tick
        assert_eq!(scheduler.tick().await, None);
        assert!(tiles.is_empty());
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let (scheduler, players, _, clients) = scheduler();
        let (handle, mut rx) = SessionHandle::channel(8);
        players.add_player("alice", state(0.0)).await.unwrap();
        clients.register("alice", handle).unwrap();

        let shutdown = CancellationToken::new();
        let task = tokio::spawn(scheduler.run(shutdown.clone()));

        let frame = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(decode_state(&frame).players[0].username, "alice");

        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .unwrap()
            .unwrap();
    }
}
