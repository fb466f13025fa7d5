//! Chunked tile world backed by the game database.
//!
//! Chunks are created lazily: the first access loads a persisted chunk or,
//! failing that, asks the [`WorldGenerator`] for a fresh one and persists it
//! before anyone can observe it. Each coordinate owns a once-cell slot so
//! concurrent first accesses agree on a single instance.
//!
//! Every method here may block on disk I/O.

use crate::error::{Result, ServerError, StorageError};
use crate::storage::{chunk_key, get_record, put_record, GameDatabase, WORLD_SEED_KEY};
use log::{debug, info, warn};
use once_cell::sync::OnceCell;
use parking_lot::{Mutex, RwLock};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use shared::{ChunkCoord, ChunkData, Tile, TileCoord, TileKind};
use std::collections::HashMap;
use std::sync::Arc;

/// Picks the seed for this world. A seed already stored wins over the
/// configured one, so a world keeps its terrain across restarts. Without
/// either a random seed is drawn and stored.
pub fn resolve_world_seed(db: &dyn GameDatabase, configured: Option<u64>) -> Result<u64> {
    if let Some(stored) = get_record::<u64>(db, WORLD_SEED_KEY)? {
        if configured.is_some_and(|seed| seed != stored) {
            warn!("Ignoring configured seed, world already uses {}", stored);
        }
        return Ok(stored);
    }

    let seed = configured.unwrap_or_else(rand::random);
    put_record(db, WORLD_SEED_KEY, &seed)?;
    info!("New world seed {}", seed);
    Ok(seed)
}

pub trait WorldGenerator: Send + Sync {
    fn generate(&self, coord: ChunkCoord, size: usize) -> ChunkData;
}

/// Scatters tile kinds with an RNG derived from the world seed and the chunk
/// coordinates, so a chunk always regenerates identically.
pub struct SeededGenerator {
    seed: u64,
}

impl SeededGenerator {
    pub fn new(seed: u64) -> Self {
        Self { seed }
    }

    pub fn seed(&self) -> u64 {
        self.seed
    }

    fn chunk_seed(&self, coord: ChunkCoord) -> u64 {
        self.seed
            ^ (coord.x as i64 as u64).wrapping_mul(0x9E37_79B9_7F4A_7C15)
            ^ (coord.y as i64 as u64).wrapping_mul(0xC2B2_AE3D_27D4_EB4F)
    }

    fn pick_kind(roll: u32) -> TileKind {
        match roll {
            0..=54 => TileKind::Grass,
            55..=69 => TileKind::Dirt,
            70..=79 => TileKind::Sand,
            80..=91 => TileKind::Water,
            _ => TileKind::Stone,
        }
    }
}

impl WorldGenerator for SeededGenerator {
    fn generate(&self, coord: ChunkCoord, size: usize) -> ChunkData {
        let mut rng = StdRng::seed_from_u64(self.chunk_seed(coord));
        let mut chunk = ChunkData::filled(coord, size, TileKind::Grass);

        for y in 0..size as u32 {
            for x in 0..size as u32 {
                let kind = Self::pick_kind(rng.gen_range(0..100));
                chunk.replace_tile(TileCoord::new(x, y), Tile::new(kind));
            }
        }
        chunk
    }
}

/// A loaded chunk. The mutex guards both in-memory edits and the write of
/// the edited chunk to disk, so persisted versions never go backwards.
#[derive(Debug)]
pub struct Chunk {
    coord: ChunkCoord,
    data: Mutex<ChunkData>,
}

impl Chunk {
    fn new(data: ChunkData) -> Self {
        Self {
            coord: data.coord,
            data: Mutex::new(data),
        }
    }

    pub fn coord(&self) -> ChunkCoord {
        self.coord
    }

    pub fn tile(&self, at: TileCoord) -> Option<Tile> {
        self.data.lock().tile(at).copied()
    }

    pub fn data(&self) -> ChunkData {
        self.data.lock().clone()
    }

    pub fn encode(&self) -> Result<Vec<u8>, bincode::Error> {
        self.data.lock().encode()
    }
}

type ChunkSlot = Arc<OnceCell<Arc<Chunk>>>;

pub struct ChunkStore {
    db: Arc<dyn GameDatabase>,
    generator: Box<dyn WorldGenerator>,
    chunk_size: usize,
    chunks: RwLock<HashMap<ChunkCoord, ChunkSlot>>,
}

impl ChunkStore {
    pub fn new(
        db: Arc<dyn GameDatabase>,
        generator: Box<dyn WorldGenerator>,
        chunk_size: usize,
    ) -> Self {
        Self {
            db,
            generator,
            chunk_size,
            chunks: RwLock::new(HashMap::new()),
        }
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Returns the chunk only if it is already in memory.
    pub fn get_chunk(&self, coord: ChunkCoord) -> Option<Arc<Chunk>> {
        self.chunks
            .read()
            .get(&coord)
            .and_then(|slot| slot.get().cloned())
    }

    pub fn load_or_create_chunk(&self, coord: ChunkCoord) -> Result<Arc<Chunk>> {
        if let Some(chunk) = self.get_chunk(coord) {
            return Ok(chunk);
        }

        let slot = {
            let mut chunks = self.chunks.write();
            Arc::clone(chunks.entry(coord).or_default())
        };

        // Only one caller runs the initializer; the rest block until it is
        // done. A failed initializer leaves the slot empty for the next try.
        let chunk = slot.get_or_try_init(|| self.load_or_generate(coord).map(Arc::new))?;
        Ok(Arc::clone(chunk))
    }

    fn load_or_generate(&self, coord: ChunkCoord) -> Result<Chunk> {
        let key = chunk_key(coord);

        if let Some(bytes) = self.db.get(&key)? {
            let data = ChunkData::decode(&bytes)
                .map_err(|source| StorageError::Corrupt { key, source })?;
            debug!("Loaded chunk {} from disk", coord);
            return Ok(Chunk::new(data));
        }

        let data = self.generator.generate(coord, self.chunk_size);
        self.write(&data)?;
        info!("Generated chunk {}", coord);
        Ok(Chunk::new(data))
    }

    fn write(&self, data: &ChunkData) -> Result<()> {
        let bytes = data.encode().map_err(StorageError::Encode)?;
        self.db.put(&chunk_key(data.coord), &bytes)?;
        Ok(())
    }

    /// Writes the chunk's current contents to disk.
    pub fn persist_to_disk(&self, chunk: &Chunk) -> Result<()> {
        let data = chunk.data.lock();
        self.write(&data)
    }

    /// Replaces one tile and persists the chunk before returning. If the
    /// write fails the in-memory tile is restored and the error surfaced.
    pub fn replace_tile(&self, coord: ChunkCoord, at: TileCoord, tile: Tile) -> Result<()> {
        let chunk = self.load_or_create_chunk(coord)?;
        let mut data = chunk.data.lock();

        let previous = data.replace_tile(at, tile).ok_or_else(|| {
            ServerError::Validation(format!(
                "tile ({},{}) is outside chunk {} of size {}",
                at.x, at.y, coord, self.chunk_size
            ))
        })?;

        if let Err(e) = self.write(&data) {
            data.replace_tile(at, previous);
            return Err(e);
        }
        Ok(())
    }

    /// Number of chunks currently held in memory.
    pub fn loaded_chunks(&self) -> usize {
        self.chunks
            .read()
            .values()
            .filter(|slot| slot.get().is_some())
            .count()
    }

    pub fn flush(&self) -> Result<()> {
        Ok(self.db.flush()?)
    }
}
