//! Bounded packet buffer pool.
//!
//! Packet-path buffers are MTU-sized (plus the TUN header prefix where one
//! applies) and drawn from a bounded pool. A buffer is owned by exactly one
//! task at a time and returns to the pool on drop. When the pool is empty,
//! `acquire` parks the caller: exhaustion is backpressure, not an error.

use std::sync::{Arc, Mutex};

use tokio::sync::Semaphore;

struct PoolInner {
    buf_len: usize,
    free: Mutex<Vec<Vec<u8>>>,
    available: Semaphore,
}

/// Shared pool of fixed-size packet buffers.
#[derive(Clone)]
pub struct PacketPool {
    inner: Arc<PoolInner>,
}

impl PacketPool {
    /// Create a pool of `capacity` buffers of `buf_len` bytes each.
    ///
    /// Buffers are allocated lazily on first acquisition.
    pub fn new(capacity: usize, buf_len: usize) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                buf_len,
                free: Mutex::new(Vec::with_capacity(capacity)),
                available: Semaphore::new(capacity),
            }),
        }
    }

    /// Acquire a buffer, waiting until one is available.
    pub async fn acquire(&self) -> PooledBuf {
        // The semaphore is never closed
        let permit = self
            .inner
            .available
            .acquire()
            .await
            .expect("packet pool semaphore closed");
        permit.forget();
        self.take_buf()
    }

    /// Acquire a buffer without waiting.
    pub fn try_acquire(&self) -> Option<PooledBuf> {
        let permit = self.inner.available.try_acquire().ok()?;
        permit.forget();
        Some(self.take_buf())
    }

    fn take_buf(&self) -> PooledBuf {
        let data = {
            let mut free = self.inner.free.lock().expect("pool lock poisoned");
            free.pop()
        }
        .unwrap_or_else(|| vec![0u8; self.inner.buf_len]);

        PooledBuf {
            data,
            len: 0,
            pool: Some(Arc::clone(&self.inner)),
        }
    }

    /// Size of each buffer in this pool.
    pub fn buf_len(&self) -> usize {
        self.inner.buf_len
    }

    /// Number of buffers currently available.
    pub fn available(&self) -> usize {
        self.inner.available.available_permits()
    }
}

/// A packet buffer with single ownership.
///
/// `packet()` exposes the first `len` bytes written via `set_len`. Pooled
/// buffers return to their pool on drop; detached buffers (ICMP replies and
/// test packets) are plain allocations.
pub struct PooledBuf {
    data: Vec<u8>,
    len: usize,
    pool: Option<Arc<PoolInner>>,
}

impl PooledBuf {
    /// Wrap an owned allocation that does not belong to any pool.
    pub fn detached(data: Vec<u8>) -> Self {
        let len = data.len();
        Self {
            data,
            len,
            pool: None,
        }
    }

    /// Full backing buffer for reads from a device.
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// Record how many bytes of the backing buffer hold the packet.
    /// Clamped to the buffer capacity.
    pub fn set_len(&mut self, len: usize) {
        self.len = len.min(self.data.len());
    }

    /// The packet bytes.
    pub fn packet(&self) -> &[u8] {
        &self.data[..self.len]
    }

    /// Packet length in bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl Drop for PooledBuf {
    fn drop(&mut self) {
        if let Some(pool) = self.pool.take() {
            let data = std::mem::take(&mut self.data);
            if let Ok(mut free) = pool.free.lock() {
                free.push(data);
            }
            pool.available.add_permits(1);
        }
    }
}

impl std::fmt::Debug for PooledBuf {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledBuf")
            .field("len", &self.len)
            .field("pooled", &self.pool.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn acquire_and_release() {
        let pool = PacketPool::new(2, 1500);
        assert_eq!(pool.available(), 2);

        let mut buf = pool.acquire().await;
        assert_eq!(pool.available(), 1);
        assert_eq!(buf.as_mut_slice().len(), 1500);

        buf.as_mut_slice()[..4].copy_from_slice(&[1, 2, 3, 4]);
        buf.set_len(4);
        assert_eq!(buf.packet(), &[1, 2, 3, 4]);

        drop(buf);
        assert_eq!(pool.available(), 2);
    }

    #[tokio::test]
    async fn exhaustion_parks_until_return() {
        let pool = PacketPool::new(1, 64);
        let held = pool.acquire().await;
        assert!(pool.try_acquire().is_none());

        let pool2 = pool.clone();
        let waiter = tokio::spawn(async move { pool2.acquire().await });

        // The waiter cannot complete while the buffer is held
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        drop(held);
        let buf = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter should be released")
            .expect("waiter task panicked");
        assert_eq!(buf.packet().len(), 0);
    }

    #[tokio::test]
    async fn buffers_are_reused() {
        let pool = PacketPool::new(1, 32);
        let mut buf = pool.acquire().await;
        buf.as_mut_slice()[0] = 0xaa;
        buf.set_len(1);
        drop(buf);

        // Same backing allocation comes back; contents are overwritten by
        // the next reader, not cleared by the pool
        let buf = pool.acquire().await;
        assert_eq!(pool.available(), 0);
        drop(buf);
        assert_eq!(pool.available(), 1);
    }

    #[test]
    fn detached_buf_does_not_touch_pool() {
        let buf = PooledBuf::detached(vec![9, 8, 7]);
        assert_eq!(buf.packet(), &[9, 8, 7]);
        assert_eq!(buf.len(), 3);
        drop(buf);
    }

    #[tokio::test]
    async fn set_len_clamps_to_capacity() {
        let pool = PacketPool::new(1, 8);
        let mut buf = pool.acquire().await;
        buf.set_len(1000);
        assert_eq!(buf.len(), 8);
    }
}
