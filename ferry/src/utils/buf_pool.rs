//! A bounded free list of transfer buffers.
//!
//! The copy pumps churn through identically-sized buffers; recycling them
//! avoids repeated large allocations under connection load. Returns beyond
//! the free-list cap are simply dropped.

use parking_lot::Mutex;

use super::allocate_vec;

pub const BUF_SIZE: usize = 16 * 1024;

const MAX_POOLED: usize = 64;

static POOL: Mutex<Vec<Vec<u8>>> = Mutex::new(Vec::new());

/// A pooled buffer that returns itself to the free list on drop.
pub struct PooledBuf {
    buf: Vec<u8>,
}

impl PooledBuf {
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.buf
    }
}

impl Drop for PooledBuf {
    fn drop(&mut self) {
        let buf = std::mem::take(&mut self.buf);
        let mut pool = POOL.lock();
        if pool.len() < MAX_POOLED {
            pool.push(buf);
        }
    }
}

pub fn get_buf() -> PooledBuf {
    let buf = POOL.lock().pop().unwrap_or_else(|| allocate_vec(BUF_SIZE));
    PooledBuf { buf }
}
