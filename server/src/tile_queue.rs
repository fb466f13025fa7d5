use parking_lot::Mutex;
use shared::TileUpdate;

/// Unbounded FIFO of tile updates awaiting the next broadcast.
///
/// Any number of handlers may push concurrently. `drain_all` swaps the whole
/// buffer out under the lock, so every pushed event lands in exactly one drain.
#[derive(Debug, Default)]
pub struct TileUpdateQueue {
    pending: Mutex<Vec<TileUpdate>>,
}

impl TileUpdateQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, update: TileUpdate) {
        self.pending.lock().push(update);
    }

    pub fn drain_all(&self) -> Vec<TileUpdate> {
        std::mem::take(&mut *self.pending.lock())
    }

    pub fn len(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.lock().is_empty()
    }
}
