//! Buffer pool shared by all relay sessions
//!
//! Buffers are checked out for a single read/write cycle and go back to the
//! pool when the guard drops.

use std::collections::VecDeque;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::BytesMut;
use parking_lot::Mutex;

/// Configuration for buffer pool
#[derive(Debug, Clone)]
pub struct BufferPoolConfig {
    /// Size of each buffer
    pub buffer_size: usize,
    /// Maximum number of idle buffers kept in the pool
    pub max_pooled: usize,
}

impl Default for BufferPoolConfig {
    fn default() -> Self {
        Self {
            buffer_size: 32 * 1024,
            max_pooled: 64,
        }
    }
}

/// A thread-safe pool of reusable fixed-size buffers
#[derive(Clone)]
pub struct BufferPool {
    inner: Arc<BufferPoolInner>,
}

struct BufferPoolInner {
    buffers: Mutex<VecDeque<BytesMut>>,
    config: BufferPoolConfig,
    allocated: AtomicU64,
}

impl BufferPool {
    pub fn new(config: BufferPoolConfig) -> Self {
        Self {
            inner: Arc::new(BufferPoolInner {
                buffers: Mutex::new(VecDeque::with_capacity(config.max_pooled)),
                config,
                allocated: AtomicU64::new(0),
            }),
        }
    }

    pub fn with_buffer_size(buffer_size: usize) -> Self {
        Self::new(BufferPoolConfig {
            buffer_size,
            ..Default::default()
        })
    }

    /// Size of one pool unit
    pub fn buffer_size(&self) -> usize {
        self.inner.config.buffer_size
    }

    /// Check out an empty buffer, allocating when the pool is dry
    pub fn acquire(&self) -> PooledBuffer {
        let pooled = self.inner.buffers.lock().pop_front();
        let buf = match pooled {
            Some(buf) => buf,
            None => {
                self.inner.allocated.fetch_add(1, Ordering::Relaxed);
                BytesMut::with_capacity(self.inner.config.buffer_size)
            }
        };
        PooledBuffer {
            buf,
            pool: self.clone(),
        }
    }

    fn release(&self, mut buf: BytesMut) {
        buf.clear();
        // A buffer that grew past its unit size is not a pool unit anymore
        if buf.capacity() < self.inner.config.buffer_size
            || buf.capacity() > self.inner.config.buffer_size * 2
        {
            return;
        }
        let mut buffers = self.inner.buffers.lock();
        if buffers.len() < self.inner.config.max_pooled {
            buffers.push_back(buf);
        }
    }

    /// Idle buffers currently in the pool
    pub fn count(&self) -> usize {
        self.inner.buffers.lock().len()
    }

    /// Total buffers ever allocated by this pool
    pub fn allocated(&self) -> u64 {
        self.inner.allocated.load(Ordering::Relaxed)
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new(BufferPoolConfig::default())
    }
}

/// Buffer checked out of a [`BufferPool`]; returned on drop
pub struct PooledBuffer {
    buf: BytesMut,
    pool: BufferPool,
}

impl Deref for PooledBuffer {
    type Target = BytesMut;

    fn deref(&self) -> &BytesMut {
        &self.buf
    }
}

impl DerefMut for PooledBuffer {
    fn deref_mut(&mut self) -> &mut BytesMut {
        &mut self.buf
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        let buf = std::mem::take(&mut self.buf);
        self.pool.release(buf);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_buffer_pool_reuse() {
        let pool = BufferPool::with_buffer_size(4096);

        {
            let mut buf = pool.acquire();
            buf.extend_from_slice(b"test data");
            assert_eq!(buf.len(), 9);
        }
        assert_eq!(pool.count(), 1);

        let buf = pool.acquire();
        assert!(buf.is_empty());
        assert!(buf.capacity() >= 4096);
        assert_eq!(pool.count(), 0);
        assert_eq!(pool.allocated(), 1);
    }

    #[test]
    fn test_pool_is_bounded() {
        let pool = BufferPool::new(BufferPoolConfig {
            buffer_size: 1024,
            max_pooled: 2,
        });
        let bufs: Vec<_> = (0..4).map(|_| pool.acquire()).collect();
        assert_eq!(pool.allocated(), 4);
        drop(bufs);
        assert_eq!(pool.count(), 2);
    }

    #[test]
    fn test_oversized_buffer_not_returned() {
        let pool = BufferPool::with_buffer_size(1024);
        {
            let mut buf = pool.acquire();
            buf.extend_from_slice(&vec![0u8; 8192]);
        }
        assert_eq!(pool.count(), 0);
    }

    #[test]
    fn test_concurrent_acquire_release() {
        let pool = BufferPool::with_buffer_size(1024);
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let pool = pool.clone();
                std::thread::spawn(move || {
                    for _ in 0..100 {
                        let mut buf = pool.acquire();
                        buf.extend_from_slice(b"x");
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert!(pool.count() <= 8);
        assert!(pool.allocated() <= 8);
    }
}
