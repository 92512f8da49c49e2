//! Process-wide object pools that damp allocation pressure under bursty
//! load (spec §4.3). Buses borrow from these pools; they never hoard.

use multibus_core::{Event, Metadata};
use once_cell::sync::Lazy;
use parking_lot::Mutex;

const MAX_POOLED_BUFFERS: usize = 64;
const MAX_POOLED_MAPS: usize = 256;

/// Pool of reusable `Vec<Event>` buffers used to drain a bus's queue into a
/// batch. A buffer handed to the worker pool must not be returned here
/// until dispatch of every entry has been submitted (spec §4.3).
pub struct EventBufferPool {
    free: Mutex<Vec<Vec<Event>>>,
}

impl EventBufferPool {
    fn new() -> Self {
        Self {
            free: Mutex::new(Vec::new()),
        }
    }

    /// Returns a buffer of length 0 with capacity at least `n`. Falls back
    /// to a fresh allocation if no pooled buffer is large enough.
    pub fn get_with_capacity(&self, n: usize) -> Vec<Event> {
        let mut free = self.free.lock();
        if let Some(pos) = free.iter().position(|b| b.capacity() >= n) {
            let buf = free.swap_remove(pos);
            debug_assert!(buf.is_empty());
            return buf;
        }
        Vec::with_capacity(n)
    }

    /// Resets length to 0 and returns the buffer to the pool.
    pub fn put(&self, mut buf: Vec<Event>) {
        buf.clear();
        let mut free = self.free.lock();
        if free.len() < MAX_POOLED_BUFFERS {
            free.push(buf);
        }
    }

    #[cfg(test)]
    fn reset(&self) {
        self.free.lock().clear();
    }
}

/// Pool of reusable metadata maps, primarily for the DLQ emission path
/// which otherwise allocates a fresh map per emission (spec §9).
pub struct MetadataPool {
    free: Mutex<Vec<Metadata>>,
}

impl MetadataPool {
    fn new() -> Self {
        Self {
            free: Mutex::new(Vec::new()),
        }
    }

    pub fn get(&self) -> Metadata {
        self.free.lock().pop().unwrap_or_default()
    }

    /// Deletes all keys before returning the map to the pool.
    pub fn put(&self, mut map: Metadata) {
        map.clear();
        let mut free = self.free.lock();
        if free.len() < MAX_POOLED_MAPS {
            free.push(map);
        }
    }

    #[cfg(test)]
    fn reset(&self) {
        self.free.lock().clear();
    }
}

pub static EVENT_BUFFER_POOL: Lazy<EventBufferPool> = Lazy::new(EventBufferPool::new);
pub static METADATA_POOL: Lazy<MetadataPool> = Lazy::new(MetadataPool::new);
