//! Pooled I/O buffers
//!
//! Checksum computation and file copies stream through fixed-size buffers
//! drawn from a small free list instead of allocating per call.

use parking_lot::Mutex;

/// Default buffer size for streaming reads
pub const DEFAULT_BUF_SIZE: usize = 128 * 1024;

/// Cap on retained free buffers
const MAX_FREE: usize = 32;

/// A trivial fixed-size buffer pool
pub struct BufferPool {
    free: Mutex<Vec<Vec<u8>>>,
    buf_size: usize,
}

impl BufferPool {
    #[must_use]
    pub fn new(buf_size: usize) -> Self {
        Self {
            free: Mutex::new(Vec::new()),
            buf_size,
        }
    }

    /// Take a zero-initialized buffer from the pool, allocating on miss
    #[must_use]
    pub fn get(&self) -> Vec<u8> {
        if let Some(buf) = self.free.lock().pop() {
            return buf;
        }
        vec![0u8; self.buf_size]
    }

    /// Return a buffer; oversupply is dropped
    pub fn put(&self, buf: Vec<u8>) {
        if buf.len() != self.buf_size {
            return;
        }
        let mut free = self.free.lock();
        if free.len() < MAX_FREE {
            free.push(buf);
        }
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new(DEFAULT_BUF_SIZE)
    }
}
