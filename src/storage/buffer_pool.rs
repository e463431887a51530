use crate::constants::BUFFER_POOL_PIECES;
use bytes::BytesMut;
use crossbeam::queue::ArrayQueue;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;

/// Pool of piece-sized scratch buffers used for slot moves and hashing.
///
/// Buffers are handed out as [`PooledBuffer`] guards which go back to the
/// pool when dropped. When the pool is empty a fresh buffer is allocated;
/// when it is full a returned buffer is simply freed.
pub struct BufferPool {
    buffers: ArrayQueue<BytesMut>,
}

impl BufferPool {
    pub fn new() -> Arc<Self> {
        Self::with_capacity(BUFFER_POOL_PIECES)
    }

    pub fn with_capacity(count: usize) -> Arc<Self> {
        Arc::new(Self {
            buffers: ArrayQueue::new(count.max(1)),
        })
    }

    /// Returns a zeroed buffer of exactly `size` bytes.
    pub fn get(self: &Arc<Self>, size: usize) -> PooledBuffer {
        let mut buf = self
            .buffers
            .pop()
            .unwrap_or_else(|| BytesMut::with_capacity(size));
        buf.clear();
        buf.resize(size, 0);
        PooledBuffer {
            buf,
            pool: Arc::clone(self),
        }
    }

    pub fn available(&self) -> usize {
        self.buffers.len()
    }

    fn recycle(&self, mut buf: BytesMut) {
        buf.clear();
        let _ = self.buffers.push(buf);
    }
}

impl std::fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferPool")
            .field("available", &self.buffers.len())
            .field("capacity", &self.buffers.capacity())
            .finish()
    }
}

pub struct PooledBuffer {
    buf: BytesMut,
    pool: Arc<BufferPool>,
}

impl PooledBuffer {
    /// Shrinks or grows the buffer, zero-filling any new bytes.
    pub fn resize(&mut self, size: usize) {
        self.buf.resize(size, 0);
    }
}

impl Deref for PooledBuffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.buf
    }
}

impl DerefMut for PooledBuffer {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.buf
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        let buf = std::mem::take(&mut self.buf);
        self.pool.recycle(buf);
    }
}
