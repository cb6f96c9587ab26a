use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex};

pub const RELAY_BUFFER_SIZE: usize = 20 * 1024;

/// Fixed-size byte buffers handed out to one task at a time.
pub struct BufferPool {
    size: usize,
    max_idle: usize,
    free: Mutex<Vec<Vec<u8>>>,
}

impl BufferPool {
    pub fn new(size: usize, max_idle: usize) -> Arc<Self> {
        Arc::new(BufferPool {
            size,
            max_idle,
            free: Mutex::new(Vec::new()),
        })
    }

    pub fn relay() -> Arc<Self> {
        Self::new(RELAY_BUFFER_SIZE, 256)
    }

    pub fn get(self: &Arc<Self>) -> PooledBuf {
        let buf = self
            .free
            .lock()
            .ok()
            .and_then(|mut free| free.pop())
            .unwrap_or_else(|| vec![0u8; self.size]);
        PooledBuf {
            buf,
            pool: self.clone(),
        }
    }

    fn put(&self, buf: Vec<u8>) {
        if let Ok(mut free) = self.free.lock() {
            if free.len() < self.max_idle {
                free.push(buf);
            }
        }
    }

    pub fn idle(&self) -> usize {
        self.free.lock().map(|f| f.len()).unwrap_or(0)
    }
}

pub struct PooledBuf {
    buf: Vec<u8>,
    pool: Arc<BufferPool>,
}

impl Deref for PooledBuf {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.buf
    }
}

impl DerefMut for PooledBuf {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.buf
    }
}

impl Drop for PooledBuf {
    fn drop(&mut self) {
        self.pool.put(std::mem::take(&mut self.buf));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buffers_are_reused() {
        let pool = BufferPool::new(16, 2);
        {
            let mut a = pool.get();
            a[0] = 7;
            assert_eq!(a.len(), 16);
        }
        assert_eq!(pool.idle(), 1);
        let b = pool.get();
        assert_eq!(b.len(), 16);
        assert_eq!(pool.idle(), 0);
    }

    #[test]
    fn idle_list_is_bounded() {
        let pool = BufferPool::new(4, 1);
        let a = pool.get();
        let b = pool.get();
        drop(a);
        drop(b);
        assert_eq!(pool.idle(), 1);
    }
}
