//! Bump-arena pool backing the columnar access store.
//!
//! The loader materialises tens of millions of word-sized address slots in
//! variable-length per-run groups. A vector per run would pay a heap
//! header and capacity slack for every run; the pool hands out flat
//! sub-slices of large chunks instead, with no per-element free. Handles
//! are chunk/offset indices rather than pointers, so the pool can be moved
//! and grown freely while handles stay valid.

/// Elements per standard chunk.
const CHUNK_LEN: usize = 4096;

/// Allocations at least this large get a dedicated chunk, leaving the
/// current bump chunk in place for further small allocations.
const LARGE_LEN: usize = 128;

/// Index-based handle to a pool allocation.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct PoolSlice {
    chunk: u32,
    start: u32,
    len: u32,
}

impl PoolSlice {
    /// Handle for a zero-length allocation.
    pub const EMPTY: PoolSlice = PoolSlice {
        chunk: 0,
        start: 0,
        len: 0,
    };

    /// Number of elements covered by this handle.
    pub fn len(&self) -> usize {
        self.len as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// A pool of `T` slots carved from chained bump arenas.
pub struct Pool<T> {
    chunks: Vec<Vec<T>>,
    /// Chunk currently accepting small allocations.
    current: usize,
    total: usize,
}

impl<T: Copy + Default> Pool<T> {
    pub fn new() -> Self {
        Self {
            chunks: Vec::new(),
            current: 0,
            total: 0,
        }
    }

    /// Allocate `n` default-initialised slots and return their handle.
    pub fn alloc(&mut self, n: usize) -> PoolSlice {
        if n == 0 {
            return PoolSlice::EMPTY;
        }
        self.total += n;

        let spare = self
            .chunks
            .get(self.current)
            .map(|c| c.capacity() - c.len())
            .unwrap_or(0);
        if n > spare {
            if n >= LARGE_LEN {
                // Dedicated chunk sized to the request; the current bump
                // chunk keeps accepting small allocations.
                let mut chunk = Vec::with_capacity(n);
                chunk.resize(n, T::default());
                self.chunks.push(chunk);
                return PoolSlice {
                    chunk: (self.chunks.len() - 1) as u32,
                    start: 0,
                    len: n as u32,
                };
            }
            self.chunks.push(Vec::with_capacity(CHUNK_LEN));
            self.current = self.chunks.len() - 1;
        }

        let chunk = &mut self.chunks[self.current];
        let start = chunk.len();
        chunk.resize(start + n, T::default());
        PoolSlice {
            chunk: self.current as u32,
            start: start as u32,
            len: n as u32,
        }
    }

    pub fn get(&self, slice: PoolSlice) -> &[T] {
        if slice.is_empty() {
            return &[];
        }
        let chunk = &self.chunks[slice.chunk as usize];
        &chunk[slice.start as usize..slice.start as usize + slice.len as usize]
    }

    pub fn get_mut(&mut self, slice: PoolSlice) -> &mut [T] {
        if slice.is_empty() {
            return &mut [];
        }
        let chunk = &mut self.chunks[slice.chunk as usize];
        &mut chunk[slice.start as usize..slice.start as usize + slice.len as usize]
    }

    /// Total elements allocated.
    pub fn len(&self) -> usize {
        self.total
    }

    pub fn is_empty(&self) -> bool {
        self.total == 0
    }

    /// Release spare capacity once loading is complete.
    pub fn shrink_to_fit(&mut self) {
        for chunk in &mut self.chunks {
            chunk.shrink_to_fit();
        }
    }
}

impl<T: Copy + Default> Default for Pool<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn small_allocations_share_a_chunk() {
        let mut pool: Pool<u64> = Pool::new();
        let a = pool.alloc(3);
        let b = pool.alloc(5);
        pool.get_mut(a).copy_from_slice(&[1, 2, 3]);
        pool.get_mut(b).copy_from_slice(&[4, 5, 6, 7, 8]);
        assert_eq!(pool.get(a), &[1, 2, 3]);
        assert_eq!(pool.get(b), &[4, 5, 6, 7, 8]);
        assert_eq!(pool.len(), 8);
        assert_eq!(pool.chunks.len(), 1);
    }

    #[test]
    fn large_allocation_gets_dedicated_chunk() {
        let mut pool: Pool<u64> = Pool::new();
        let small = pool.alloc(10);
        let large = pool.alloc(LARGE_LEN);
        let after = pool.alloc(10);
        assert_eq!(pool.get(large).len(), LARGE_LEN);
        // The small allocations land in the same bump chunk around the
        // dedicated one.
        assert_eq!(small.chunk, after.chunk);
        assert_ne!(small.chunk, large.chunk);
    }

    #[test]
    fn full_chunk_rolls_over() {
        let mut pool: Pool<u8> = Pool::new();
        let mut handles = Vec::new();
        for i in 0..CHUNK_LEN + 10 {
            let h = pool.alloc(1);
            pool.get_mut(h)[0] = (i % 251) as u8;
            handles.push(h);
        }
        assert!(pool.chunks.len() >= 2);
        for (i, h) in handles.iter().enumerate() {
            assert_eq!(pool.get(*h)[0], (i % 251) as u8);
        }
    }

    #[test]
    fn zero_length_allocation_is_empty() {
        let mut pool: Pool<u64> = Pool::new();
        let h = pool.alloc(0);
        assert!(pool.get(h).is_empty());
        assert!(pool.is_empty());
    }
}
