//! Size-classed chunk pool backing connection buffers.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use thiserror::Error;

/// Chunk capacity classes, smallest to largest.
pub const CHUNK_SIZES: [usize; 6] = [
    4 * 1024,
    16 * 1024,
    64 * 1024,
    256 * 1024,
    1024 * 1024,
    4 * 1024 * 1024,
];

/// Default total in-use byte budget: 128 MiB.
pub const DEFAULT_MAX_POOL_BYTES: usize = 128 * 1024 * 1024;

/// Chunks kept warm per class at construction.
const PREALLOCATED: [usize; 6] = [200, 50, 20, 10, 5, 2];

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("allocation of {0} bytes exceeds the largest chunk class")]
    Oversized(usize),
    #[error("chunk pool exhausted: allocation would exceed the byte budget")]
    Exhausted,
}

/// A pooled backing buffer. The usable data is `data[head .. head + len]`.
pub struct Chunk {
    data: Box<[u8]>,
    head: usize,
    len: usize,
}

impl Chunk {
    fn new(capacity: usize) -> Chunk {
        Chunk {
            data: vec![0u8; capacity].into_boxed_slice(),
            head: 0,
            len: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn head(&self) -> usize {
        self.head
    }

    pub fn bytes(&self) -> &[u8] {
        &self.data[self.head..self.head + self.len]
    }

    /// Writable space after the live bytes.
    pub fn available(&self) -> usize {
        self.capacity() - self.head - self.len
    }

    /// The writable tail. Call [`advance`](Chunk::advance) after filling it.
    pub fn spare_mut(&mut self) -> &mut [u8] {
        let start = self.head + self.len;
        &mut self.data[start..]
    }

    /// Marks `n` bytes of the spare region as live.
    pub fn advance(&mut self, n: usize) {
        debug_assert!(self.head + self.len + n <= self.capacity());
        self.len += n;
    }

    /// Copies `src` into the spare region. The caller ensures it fits.
    pub fn extend_from_slice(&mut self, src: &[u8]) {
        let start = self.head + self.len;
        self.data[start..start + src.len()].copy_from_slice(src);
        self.len += src.len();
    }

    /// Drops `n` bytes from the front.
    pub fn pop(&mut self, n: usize) {
        if n >= self.len {
            self.head = 0;
            self.len = 0;
        } else {
            self.head += n;
            self.len -= n;
        }
    }

    /// Moves the live bytes to offset 0, eliminating the head gap.
    pub fn adjust(&mut self) {
        if self.head != 0 {
            if self.len != 0 {
                self.data.copy_within(self.head..self.head + self.len, 0);
            }
            self.head = 0;
        }
    }

    /// Replaces this chunk's contents with `other`'s live bytes, compacted
    /// to offset 0. The caller ensures the capacity suffices.
    pub fn copy_from(&mut self, other: &Chunk) {
        debug_assert!(other.len <= self.capacity());
        self.data[..other.len].copy_from_slice(other.bytes());
        self.head = 0;
        self.len = other.len;
    }

    pub fn clear(&mut self) {
        self.head = 0;
        self.len = 0;
    }
}

/// Point-in-time pool counters.
#[derive(Debug, Default, Clone, Copy)]
pub struct PoolStats {
    pub total_allocations: usize,
    pub total_deallocations: usize,
    pub allocation_failures: usize,
    pub current_usage_bytes: usize,
    pub peak_usage_bytes: usize,
}

/// Size-classed slab allocator with a global in-use byte budget.
///
/// Free chunks sit on per-class lists behind short per-class locks. The
/// budget is a single atomic counter: allocation reserves bytes with a
/// `fetch_add` and rolls back when the reservation would overflow the cap,
/// so no lock is held while the backing memory is allocated.
pub struct BufferPool {
    free: [Mutex<Vec<Chunk>>; 6],
    max_bytes: usize,
    in_use: AtomicUsize,
    allocations: AtomicUsize,
    deallocations: AtomicUsize,
    failures: AtomicUsize,
    peak: AtomicUsize,
}

impl BufferPool {
    pub fn new(max_bytes: usize) -> BufferPool {
        let pool = BufferPool {
            free: std::array::from_fn(|_| Mutex::new(Vec::new())),
            max_bytes,
            in_use: AtomicUsize::new(0),
            allocations: AtomicUsize::new(0),
            deallocations: AtomicUsize::new(0),
            failures: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        };
        for (class, &count) in PREALLOCATED.iter().enumerate() {
            let capacity = CHUNK_SIZES[class];
            let mut list = pool.free[class].lock().unwrap();
            list.extend((0..count).map(|_| Chunk::new(capacity)));
        }
        pool
    }

    pub fn with_defaults() -> BufferPool {
        BufferPool::new(DEFAULT_MAX_POOL_BYTES)
    }

    fn class_for(n: usize) -> Option<usize> {
        CHUNK_SIZES.iter().position(|&size| n <= size)
    }

    /// Returns a chunk from the smallest class whose capacity is at least
    /// `n`. Fails with [`PoolError::Exhausted`] when the reservation would
    /// exceed the byte budget.
    pub fn alloc(&self, n: usize) -> Result<Chunk, PoolError> {
        let class = match Self::class_for(n) {
            Some(class) => class,
            None => {
                self.failures.fetch_add(1, Ordering::Relaxed);
                return Err(PoolError::Oversized(n));
            }
        };
        let capacity = CHUNK_SIZES[class];

        let previous = self.in_use.fetch_add(capacity, Ordering::AcqRel);
        if previous + capacity > self.max_bytes {
            self.in_use.fetch_sub(capacity, Ordering::AcqRel);
            self.failures.fetch_add(1, Ordering::Relaxed);
            return Err(PoolError::Exhausted);
        }

        self.allocations.fetch_add(1, Ordering::Relaxed);
        self.peak.fetch_max(previous + capacity, Ordering::Relaxed);

        let recycled = self.free[class].lock().unwrap().pop();
        Ok(match recycled {
            Some(mut chunk) => {
                chunk.clear();
                chunk
            }
            None => Chunk::new(capacity),
        })
    }

    /// Returns a chunk to its class free list. Chunks of a capacity that is
    /// not a class size are dropped outright.
    pub fn retrieve(&self, mut chunk: Chunk) {
        let capacity = chunk.capacity();
        match CHUNK_SIZES.iter().position(|&size| size == capacity) {
            Some(class) => {
                chunk.clear();
                self.free[class].lock().unwrap().push(chunk);
                self.in_use.fetch_sub(capacity, Ordering::AcqRel);
                self.deallocations.fetch_add(1, Ordering::Relaxed);
            }
            None => drop(chunk),
        }
    }

    pub fn current_usage(&self) -> usize {
        self.in_use.load(Ordering::Acquire)
    }

    pub fn max_capacity(&self) -> usize {
        self.max_bytes
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            total_allocations: self.allocations.load(Ordering::Relaxed),
            total_deallocations: self.deallocations.load(Ordering::Relaxed),
            allocation_failures: self.failures.load(Ordering::Relaxed),
            current_usage_bytes: self.in_use.load(Ordering::Acquire),
            peak_usage_bytes: self.peak.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_class_rounding() {
        let pool = BufferPool::with_defaults();
        assert_eq!(pool.alloc(1).unwrap().capacity(), 4 * 1024);
        assert_eq!(pool.alloc(4096).unwrap().capacity(), 4 * 1024);
        assert_eq!(pool.alloc(4097).unwrap().capacity(), 16 * 1024);
        assert_eq!(pool.alloc(100_000).unwrap().capacity(), 256 * 1024);
        assert_eq!(pool.alloc(4 * 1024 * 1024).unwrap().capacity(), 4 * 1024 * 1024);
    }

    #[test]
    fn test_oversized_rejected() {
        let pool = BufferPool::with_defaults();
        assert!(matches!(
            pool.alloc(4 * 1024 * 1024 + 1),
            Err(PoolError::Oversized(_))
        ));
    }

    #[test]
    fn test_budget_enforced() {
        let pool = BufferPool::new(8 * 1024);
        let first = pool.alloc(4096).unwrap();
        let second = pool.alloc(4096).unwrap();
        assert!(matches!(pool.alloc(1), Err(PoolError::Exhausted)));
        assert_eq!(pool.current_usage(), 8 * 1024);

        pool.retrieve(first);
        pool.retrieve(second);
        assert_eq!(pool.current_usage(), 0);
        assert!(pool.alloc(1).is_ok());
    }

    #[test]
    fn test_usage_tracks_live_chunks() {
        let pool = BufferPool::with_defaults();
        let a = pool.alloc(10_000).unwrap();
        let b = pool.alloc(100).unwrap();
        assert_eq!(pool.current_usage(), a.capacity() + b.capacity());
        pool.retrieve(a);
        pool.retrieve(b);
        assert_eq!(pool.current_usage(), 0);

        let stats = pool.stats();
        assert_eq!(stats.total_allocations, 2);
        assert_eq!(stats.total_deallocations, 2);
        assert!(stats.peak_usage_bytes >= 16 * 1024);
    }

    #[test]
    fn test_chunk_pop_and_adjust() {
        let mut chunk = Chunk::new(64);
        chunk.extend_from_slice(b"hello world");
        chunk.pop(6);
        assert_eq!(chunk.bytes(), b"world");
        assert_eq!(chunk.head(), 6);

        chunk.adjust();
        assert_eq!(chunk.head(), 0);
        assert_eq!(chunk.bytes(), b"world");

        chunk.pop(5);
        assert!(chunk.is_empty());
        assert_eq!(chunk.head(), 0);
    }
}
