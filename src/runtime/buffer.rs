//! Frame buffer pool.
//!
//! One fixed-size buffer per live connection, allocated at accept and
//! reclaimed at close. Replaces per-operation heap allocation with a pool
//! keyed by connection: a buffer is owned by exactly one connection (and,
//! under the completion backend, by at most one in-flight operation) at a
//! time.

pub struct BufferPool {
    /// Actual buffer storage.
    buffers: Vec<Vec<u8>>,
    /// Stack of available buffer indices (LIFO for cache locality).
    free_list: Vec<usize>,
    /// Size of each buffer.
    buffer_size: usize,
}

impl BufferPool {
    /// Create a pool of `count` buffers of `size` bytes each.
    pub fn new(count: usize, size: usize) -> Self {
        let mut buffers = Vec::with_capacity(count);
        let mut free_list = Vec::with_capacity(count);

        for i in 0..count {
            buffers.push(vec![0u8; size]);
            free_list.push(i);
        }

        Self {
            buffers,
            free_list,
            buffer_size: size,
        }
    }

    /// Allocate a buffer, or `None` if the pool is exhausted.
    pub fn alloc(&mut self) -> Option<usize> {
        self.free_list.pop()
    }

    /// Return a buffer to the pool.
    pub fn free(&mut self, idx: usize) {
        debug_assert!(idx < self.buffers.len(), "buffer index out of bounds");
        self.free_list.push(idx);
    }

    pub fn get(&self, idx: usize) -> &[u8] {
        &self.buffers[idx]
    }

    pub fn get_mut(&mut self, idx: usize) -> &mut [u8] {
        &mut self.buffers[idx]
    }

    /// Get a mutable pointer to a buffer for submission to the kernel.
    ///
    /// # Safety
    /// Caller must ensure the buffer is not accessed through other
    /// references while an operation referencing the pointer is in flight.
    pub fn get_ptr(&mut self, idx: usize) -> *mut u8 {
        self.buffers[idx].as_mut_ptr()
    }

    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    pub fn capacity(&self) -> usize {
        self.buffers.len()
    }

    pub fn available(&self) -> usize {
        self.free_list.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alloc_free_reuse() {
        let mut pool = BufferPool::new(2, 256);

        assert_eq!(pool.capacity(), 2);
        assert_eq!(pool.buffer_size(), 256);

        let a = pool.alloc().unwrap();
        let b = pool.alloc().unwrap();
        assert_eq!(pool.available(), 0);
        assert!(pool.alloc().is_none());

        pool.get_mut(a)[0] = 42;
        assert_eq!(pool.get(a)[0], 42);

        pool.free(a);
        let c = pool.alloc().unwrap();
        assert_eq!(c, a); // LIFO reuse

        pool.free(b);
        pool.free(c);
        assert_eq!(pool.available(), 2);
    }
}
