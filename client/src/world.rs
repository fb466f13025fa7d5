use log::debug;
use shared::{ChunkCoord, ChunkData, GameState, PlayerEventType, PlayerState, Tile};
use std::collections::HashMap;

/// Client-side mirror of what the server has told us so far.
#[derive(Debug, Default)]
pub struct WorldView {
    players: HashMap<String, PlayerState>,
    chunks: HashMap<ChunkCoord, ChunkData>,
}

impl WorldView {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_chunk(&mut self, chunk: ChunkData) {
        self.chunks.insert(chunk.coord, chunk);
    }

    pub fn chunk(&self, coord: ChunkCoord) -> Option<&ChunkData> {
        self.chunks.get(&coord)
    }

    pub fn player(&self, username: &str) -> Option<&PlayerState> {
        self.players.get(username)
    }

    pub fn player_count(&self) -> usize {
        self.players.len()
    }

    /// Applies a snapshot. Tile updates for chunks we never loaded are
    /// ignored; undecodable tiles are skipped.
    pub fn apply(&mut self, state: &GameState) {
        for event in &state.players {
            match (event.event_type, event.state) {
                (PlayerEventType::Disconnect, _) => {
                    self.players.remove(&event.username);
                }
                (_, Some(player)) => {
                    self.players.insert(event.username.clone(), player);
                }
                (_, None) => {}
            }
        }

        for update in &state.tile_updates {
            let Some(chunk) = self.chunks.get_mut(&update.chunk) else {
                continue;
            };
            match Tile::from_bytes(&update.tile_data) {
                Ok(tile) => {
                    chunk.replace_tile(update.tile, tile);
                }
                Err(e) => debug!("Skipping tile update for chunk {}: {}", update.chunk, e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::{PlayerEvent, TileCoord, TileKind, TileUpdate, Vector2};

    fn event(name: &str, event_type: PlayerEventType, x: Option<f32>) -> PlayerEvent {
        PlayerEvent {
            username: name.to_string(),
            event_type,
            state: x.map(|x| PlayerState::new(Vector2::new(x, 0.0), Vector2::default())),
        }
    }

    #[test]
    fn test_player_events() {
        let mut view = WorldView::new();
        view.apply(&GameState {
            players: vec![
                event("alice", PlayerEventType::Connect, Some(0.0)),
                event("bob", PlayerEventType::Connect, Some(1.0)),
            ],
            tile_updates: vec![],
        });
        view.apply(&GameState {
            players: vec![
                event("alice", PlayerEventType::Update, Some(4.0)),
                event("bob", PlayerEventType::Disconnect, None),
            ],
            tile_updates: vec![],
        });

        assert_eq!(view.player_count(), 1);
        assert_eq!(view.player("alice").unwrap().position.x, 4.0);
        assert!(view.player("bob").is_none());
    }

    #[test]
    fn test_tile_updates_touch_loaded_chunks_only() {
        let loaded = ChunkCoord::new(0, 0);
        let mut view = WorldView::new();
        view.insert_chunk(ChunkData::filled(loaded, 4, TileKind::Grass));

        let water = Tile::new(TileKind::Water).to_bytes().unwrap();
        view.apply(&GameState {
            players: vec![],
            tile_updates: vec![
                TileUpdate {
                    chunk: loaded,
                    tile: TileCoord::new(1, 2),
                    tile_data: water.clone(),
                },
                TileUpdate {
                    chunk: ChunkCoord::new(9, 9),
                    tile: TileCoord::new(0, 0),
                    tile_data: water,
                },
            ],
        });

        let chunk = view.chunk(loaded).unwrap();
        assert_eq!(chunk.tile(TileCoord::new(1, 2)).unwrap().kind, TileKind::Water);
        assert!(view.chunk(ChunkCoord::new(9, 9)).is_none());
    }
}
