//! Size-classed reusable byte buffers for the codec read/write paths.

use bytes::BytesMut;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// Size classes in bytes. `acquire` above the largest class allocates fresh.
const CLASSES: [usize; 7] = [1024, 2048, 4096, 8192, 16_384, 32_768, 65_536];

/// Maximum buffers retained per class; beyond this, released buffers drop.
const CLASS_CAP: usize = 64;

#[derive(Debug, Default)]
pub struct BufferPoolStats {
    pub hits: u64,
    pub misses: u64,
    pub in_use: usize,
    pub per_class: [usize; 7],
}

pub struct BufferPool {
    classes: [Mutex<Vec<BytesMut>>; 7],
    hits: AtomicU64,
    misses: AtomicU64,
    in_use: AtomicUsize,
}

impl Default for BufferPool {
    fn default() -> Self {
        Self {
            classes: Default::default(),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            in_use: AtomicUsize::new(0),
        }
    }
}

impl BufferPool {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Take a buffer with capacity >= `n` from the smallest fitting class,
    /// or allocate fresh above the largest class.
    pub fn acquire(self: &Arc<Self>, n: usize) -> PooledBuf {
        self.in_use.fetch_add(1, Ordering::Relaxed);
        match class_index(n) {
            Some(idx) => {
                let reused = self.classes[idx].lock().unwrap().pop();
                match reused {
                    Some(buf) => {
                        self.hits.fetch_add(1, Ordering::Relaxed);
                        PooledBuf {
                            buf,
                            class: Some(idx),
                            pool: self.clone(),
                        }
                    }
                    None => {
                        self.misses.fetch_add(1, Ordering::Relaxed);
                        PooledBuf {
                            buf: BytesMut::with_capacity(CLASSES[idx]),
                            class: Some(idx),
                            pool: self.clone(),
                        }
                    }
                }
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                PooledBuf {
                    buf: BytesMut::with_capacity(n),
                    class: None,
                    pool: self.clone(),
                }
            }
        }
    }

    fn release(&self, mut buf: BytesMut, class: Option<usize>) {
        self.in_use.fetch_sub(1, Ordering::Relaxed);
        let Some(idx) = class else {
            return; // oversized: drop
        };
        // Zero the contents before reuse.
        let cap = buf.capacity();
        buf.clear();
        buf.resize(cap, 0);
        buf.clear();

        let mut slot = self.classes[idx].lock().unwrap();
        if slot.len() < CLASS_CAP {
            slot.push(buf);
        }
    }

    pub fn stats(&self) -> BufferPoolStats {
        let mut per_class = [0usize; 7];
        for (i, slot) in self.classes.iter().enumerate() {
            per_class[i] = slot.lock().unwrap().len();
        }
        BufferPoolStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            in_use: self.in_use.load(Ordering::Relaxed),
            per_class,
        }
    }
}

fn class_index(n: usize) -> Option<usize> {
    CLASSES.iter().position(|&c| c >= n)
}

/// A buffer checked out of the pool; returned to its class on drop.
pub struct PooledBuf {
    buf: BytesMut,
    class: Option<usize>,
    pool: Arc<BufferPool>,
}

impl PooledBuf {
    pub fn capacity(&self) -> usize {
        self.buf.capacity()
    }
}

impl std::ops::Deref for PooledBuf {
    type Target = BytesMut;

    fn deref(&self) -> &BytesMut {
        &self.buf
    }
}

impl std::ops::DerefMut for PooledBuf {
    fn deref_mut(&mut self) -> &mut BytesMut {
        &mut self.buf
    }
}

impl Drop for PooledBuf {
    fn drop(&mut self) {
        let buf = std::mem::take(&mut self.buf);
        self.pool.release(buf, self.class);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_smallest_fitting_class() {
        let pool = BufferPool::new();
        assert_eq!(pool.acquire(1).capacity(), 1024);
        assert_eq!(pool.acquire(1024).capacity(), 1024);
        assert_eq!(pool.acquire(1025).capacity(), 2048);
        assert_eq!(pool.acquire(65_536).capacity(), 65_536);
    }

    #[test]
    fn test_oversized_allocates_fresh() {
        let pool = BufferPool::new();
        let buf = pool.acquire(100_000);
        assert!(buf.capacity() >= 100_000);
        drop(buf);
        // Oversized buffers are not retained.
        let stats = pool.stats();
        assert_eq!(stats.per_class.iter().sum::<usize>(), 0);
    }

    #[test]
    fn test_reuse_hits() {
        let pool = BufferPool::new();
        drop(pool.acquire(4096));
        let stats = pool.stats();
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.per_class[2], 1);

        let buf = pool.acquire(4096);
        assert_eq!(pool.stats().hits, 1);
        drop(buf);
    }

    #[test]
    fn test_released_buffer_comes_back_empty() {
        let pool = BufferPool::new();
        {
            let mut buf = pool.acquire(1024);
            buf.extend_from_slice(b"sensitive");
        }
        let retained = pool.classes[0].lock().unwrap();
        assert_eq!(retained.len(), 1);
        assert!(retained[0].is_empty());
        assert_eq!(retained[0].capacity(), 1024);
    }

    #[test]
    fn test_in_use_accounting() {
        let pool = BufferPool::new();
        let a = pool.acquire(1024);
        let b = pool.acquire(2048);
        assert_eq!(pool.stats().in_use, 2);
        drop(a);
        drop(b);
        assert_eq!(pool.stats().in_use, 0);
    }
}
