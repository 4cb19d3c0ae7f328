//! Recyclable packet buffers
//!
//! The data path reuses fixed-capacity buffers instead of allocating per
//! packet. Buffers are acquired at batch boundaries and must be returned
//! on every exit path: delivered, dropped by policy, or failed.

use std::sync::Mutex;

/// Pool of reusable packet buffers
pub struct BufferPool {
    free: Mutex<Vec<Vec<u8>>>,
    capacity: usize,
    max_held: usize,
}

impl BufferPool {
    /// `capacity` is the size each buffer is allocated with; `max_held`
    /// bounds how many idle buffers the pool retains.
    pub fn new(capacity: usize, max_held: usize) -> Self {
        Self {
            free: Mutex::new(Vec::new()),
            capacity,
            max_held,
        }
    }

    /// Take a cleared buffer with the pool's capacity
    pub fn get(&self) -> Vec<u8> {
        if let Some(buf) = self.free.lock().expect("pool lock").pop() {
            return buf;
        }
        Vec::with_capacity(self.capacity)
    }

    /// Return a buffer. Oversized pools drop the buffer instead.
    pub fn put(&self, mut buf: Vec<u8>) {
        buf.clear();
        if buf.capacity() < self.capacity {
            return;
        }
        let mut free = self.free.lock().expect("pool lock");
        if free.len() < self.max_held {
            free.push(buf);
        }
    }

    #[cfg(test)]
    fn idle(&self) -> usize {
        self.free.lock().unwrap().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buffers_are_recycled() {
        let pool = BufferPool::new(1024, 4);
        let mut buf = pool.get();
        buf.extend_from_slice(&[1, 2, 3]);
        let ptr = buf.as_ptr();
        pool.put(buf);
        assert_eq!(pool.idle(), 1);

        let buf = pool.get();
        assert!(buf.is_empty());
        assert_eq!(buf.as_ptr(), ptr);
        assert_eq!(pool.idle(), 0);
    }

    #[test]
    fn pool_is_bounded() {
        let pool = BufferPool::new(64, 2);
        let bufs: Vec<_> = (0..5).map(|_| pool.get()).collect();
        for buf in bufs {
            pool.put(buf);
        }
        assert_eq!(pool.idle(), 2);
    }

    #[test]
    fn undersized_buffers_are_not_retained() {
        let pool = BufferPool::new(1024, 4);
        pool.put(Vec::with_capacity(16));
        assert_eq!(pool.idle(), 0);
    }
}
