use serde::{Deserialize, Serialize};
use std::fmt;

pub mod wire;

pub const DEFAULT_TICK_RATE: u32 = 60;
pub const DEFAULT_CHUNK_SIZE: usize = 16;
pub const HEARTBEAT_INTERVAL_MS: u64 = 1000;
pub const TOKEN_TTL_SECS: u64 = 24 * 60 * 60;
pub const MAX_FRAME_LENGTH: usize = 1024 * 1024;

#[derive(Debug, Serialize, Deserialize, Clone, Copy, Default, PartialEq)]
pub struct Vector2 {
    pub x: f32,
    pub y: f32,
}

impl Vector2 {
    pub fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }
}

/// Position and velocity of a connected player.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, Default, PartialEq)]
pub struct PlayerState {
    pub position: Vector2,
    pub velocity: Vector2,
}

impl PlayerState {
    pub fn new(position: Vector2, velocity: Vector2) -> Self {
        Self { position, velocity }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct ChunkCoord {
    pub x: i32,
    pub y: i32,
}

impl ChunkCoord {
    pub fn new(x: i32, y: i32) -> Self {
        Self { x, y }
    }
}

impl fmt::Display for ChunkCoord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({},{})", self.x, self.y)
    }
}

/// Tile position inside a chunk.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct TileCoord {
    pub x: u32,
    pub y: u32,
}

impl TileCoord {
    pub fn new(x: u32, y: u32) -> Self {
        Self { x, y }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum TileKind {
    #[default]
    Grass,
    Dirt,
    Sand,
    Water,
    Stone,
}

/// A single tile. `chunk` points back at the owning chunk and is restored
/// whenever the tile is placed into (or decoded as part of) a chunk.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
pub struct Tile {
    pub kind: TileKind,
    #[serde(skip)]
    pub chunk: ChunkCoord,
}

impl Tile {
    pub fn new(kind: TileKind) -> Self {
        Self {
            kind,
            chunk: ChunkCoord::default(),
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, bincode::Error> {
        bincode::serialize(self)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, bincode::Error> {
        bincode::deserialize(bytes)
    }
}

/// Square grid of tiles, stored row-major.
///
/// The encoded form is used both for persistence and for sending a chunk to a
/// client, so it must stay deterministic: the same tiles always produce the
/// same bytes.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct ChunkData {
    pub coord: ChunkCoord,
    pub size: usize,
    tiles: Vec<Tile>,
}

impl ChunkData {
    pub fn filled(coord: ChunkCoord, size: usize, kind: TileKind) -> Self {
        let tile = Tile {
            kind,
            chunk: coord,
        };
        Self {
            coord,
            size,
            tiles: vec![tile; size * size],
        }
    }

    /// Builds a chunk from row-major tiles. Returns `None` if the tile count
    /// does not match `size * size`.
    pub fn from_tiles(coord: ChunkCoord, size: usize, mut tiles: Vec<Tile>) -> Option<Self> {
        if tiles.len() != size * size {
            return None;
        }
        for tile in &mut tiles {
            tile.chunk = coord;
        }
        Some(Self { coord, size, tiles })
    }

    fn index(&self, at: TileCoord) -> Option<usize> {
        let (x, y) = (at.x as usize, at.y as usize);
        if x < self.size && y < self.size {
            Some(y * self.size + x)
        } else {
            None
        }
    }

    pub fn contains(&self, at: TileCoord) -> bool {
        self.index(at).is_some()
    }

    pub fn tile(&self, at: TileCoord) -> Option<&Tile> {
        self.index(at).map(|i| &self.tiles[i])
    }

    pub fn tiles(&self) -> &[Tile] {
        &self.tiles
    }

    /// Replaces the tile at `at`, returning the previous one. Out-of-range
    /// coordinates leave the chunk untouched and return `None`.
    pub fn replace_tile(&mut self, at: TileCoord, mut tile: Tile) -> Option<Tile> {
        let index = self.index(at)?;
        tile.chunk = self.coord;
        Some(std::mem::replace(&mut self.tiles[index], tile))
    }

    pub fn encode(&self) -> Result<Vec<u8>, bincode::Error> {
        bincode::serialize(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, bincode::Error> {
        let chunk: ChunkData = bincode::deserialize(bytes)?;
        let ChunkData { coord, size, tiles } = chunk;
        let found = tiles.len();
        Self::from_tiles(coord, size, tiles).ok_or_else(|| {
            Box::new(bincode::ErrorKind::Custom(format!(
                "chunk {} holds {} tiles, expected {}",
                coord,
                found,
                size * size
            )))
        })
    }
}

/// A tile mutation waiting to be broadcast.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct TileUpdate {
    pub chunk: ChunkCoord,
    pub tile: TileCoord,
    pub tile_data: Vec<u8>,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
pub enum PlayerEventType {
    Connect,
    Disconnect,
    Update,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct PlayerEvent {
    pub username: String,
    pub event_type: PlayerEventType,
    pub state: Option<PlayerState>,
}

/// Snapshot pushed to every session once per tick.
#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
pub struct GameState {
    pub players: Vec<PlayerEvent>,
    pub tile_updates: Vec<TileUpdate>,
}

impl GameState {
    pub fn is_empty(&self) -> bool {
        self.players.is_empty() && self.tile_updates.is_empty()
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub enum ClientPacket {
    Register {
        username: String,
        password: String,
        email: String,
    },
    Login {
        username: String,
        password: String,
    },
    Connect {
        token: String,
    },
    OpenPlayerUpdates {
        token: String,
    },
    PlayerUpdate {
        state: PlayerState,
    },
    ClosePlayerUpdates,
    LoadChunk {
        coord: ChunkCoord,
    },
    UpdateTile(TileUpdate),
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub enum ServerPacket {
    LoginResponse {
        username: String,
        token: String,
    },
    Ack,
    Chunk {
        coord: ChunkCoord,
        chunk_data: Vec<u8>,
    },
    GameState(GameState),
    Error(RpcError),
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    ValidationFailed,
    UsernameTaken,
    InvalidCredentials,
    AlreadyConnected,
    AlreadyExists,
    NotFound,
    Unauthenticated,
    TokenExpired,
    Storage,
    Internal,
}

/// Error returned to a client in place of a response.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct RpcError {
    pub kind: ErrorKind,
    pub message: String,
}

impl RpcError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl fmt::Display for RpcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.message)
    }
}

impl std::error::Error for RpcError {}
