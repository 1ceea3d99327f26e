//! Endpoint buffer pools.
//!
//! Both pools are fixed-capacity and endpoint-local. TX buffers recycle
//! through the send path; RX buffers are leased out inside events and come
//! back through `return_event`. Exhaustion is the flow-control signal: a TX
//! miss fails the send with `NoBufferSpace`, an RX miss NACKs the sender.

use crate::status::{Result, Status};

/// A receive buffer leased to at most one holder at a time.
#[derive(Debug)]
pub struct RxBuffer {
    data: Vec<u8>,
    len: usize,
    endpoint_id: u32,
}

impl RxBuffer {
    fn new(capacity: usize, endpoint_id: u32) -> Self {
        Self {
            data: vec![0; capacity],
            len: 0,
            endpoint_id,
        }
    }

    /// The valid bytes of the buffer.
    #[inline]
    pub fn bytes(&self) -> &[u8] {
        &self.data[..self.len]
    }

    /// Fill the buffer from `src`, which must fit.
    pub(crate) fn fill(&mut self, src: &[u8]) {
        debug_assert!(src.len() <= self.data.len());
        self.data[..src.len()].copy_from_slice(src);
        self.len = src.len();
    }

    #[inline]
    pub(crate) fn endpoint_id(&self) -> u32 {
        self.endpoint_id
    }
}

/// Pool of pre-allocated receive buffers.
pub struct RxPool {
    free: Vec<RxBuffer>,
    capacity: usize,
    buf_size: usize,
    endpoint_id: u32,
}

impl RxPool {
    pub fn new(count: usize, buf_size: usize, endpoint_id: u32) -> Self {
        Self {
            free: (0..count).map(|_| RxBuffer::new(buf_size, endpoint_id)).collect(),
            capacity: count,
            buf_size,
            endpoint_id,
        }
    }

    /// Lease a buffer out of the pool.
    pub fn take(&mut self) -> Option<RxBuffer> {
        self.free.pop()
    }

    /// Return a leased buffer.
    ///
    /// The buffer must have been taken from this pool; foreign buffers are
    /// rejected with `Invalid`.
    pub fn put(&mut self, mut buf: RxBuffer) -> Result<()> {
        if buf.endpoint_id != self.endpoint_id || self.free.len() >= self.capacity {
            return Err(Status::Invalid);
        }
        buf.len = 0;
        self.free.push(buf);
        Ok(())
    }

    #[inline]
    pub fn available(&self) -> usize {
        self.free.len()
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Change the pool size. Only legal while every buffer is idle.
    pub fn resize(&mut self, count: usize) -> Result<()> {
        if self.free.len() != self.capacity {
            return Err(Status::Busy);
        }
        self.free.clear();
        self.free
            .extend((0..count).map(|_| RxBuffer::new(self.buf_size, self.endpoint_id)));
        self.capacity = count;
        Ok(())
    }
}

/// Pool of pre-sized send buffers.
pub struct TxPool {
    free: Vec<Vec<u8>>,
    capacity: usize,
    buf_size: usize,
}

impl TxPool {
    pub fn new(count: usize, buf_size: usize) -> Self {
        Self {
            free: (0..count).map(|_| Vec::with_capacity(buf_size)).collect(),
            capacity: count,
            buf_size,
        }
    }

    /// Take an empty send buffer; `None` means the pool is exhausted.
    pub fn take(&mut self) -> Option<Vec<u8>> {
        self.free.pop()
    }

    /// Recycle a send buffer.
    pub fn put(&mut self, mut buf: Vec<u8>) {
        if self.free.len() < self.capacity {
            buf.clear();
            self.free.push(buf);
        }
    }

    #[inline]
    pub fn available(&self) -> usize {
        self.free.len()
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Change the pool size. Only legal while every buffer is idle.
    pub fn resize(&mut self, count: usize) -> Result<()> {
        if self.free.len() != self.capacity {
            return Err(Status::Busy);
        }
        self.free.clear();
        self.free
            .extend((0..count).map(|_| Vec::with_capacity(self.buf_size)));
        self.capacity = count;
        Ok(())
    }
}

/// Snapshot of both pools, observable through the public API.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferCounts {
    pub tx_free: usize,
    pub tx_total: usize,
    pub rx_free: usize,
    pub rx_total: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rx_pool_lease_and_return() {
        let mut pool = RxPool::new(2, 64, 7);
        let mut a = pool.take().unwrap();
        let b = pool.take().unwrap();
        assert!(pool.take().is_none());
        assert_eq!(pool.available(), 0);

        a.fill(b"hello");
        assert_eq!(a.bytes(), b"hello");

        pool.put(a).unwrap();
        pool.put(b).unwrap();
        assert_eq!(pool.available(), 2);
    }

    #[test]
    fn test_rx_pool_rejects_foreign_buffer() {
        let mut pool_a = RxPool::new(1, 64, 1);
        let mut pool_b = RxPool::new(1, 64, 2);
        let buf = pool_b.take().unwrap();
        assert_eq!(pool_a.put(buf), Err(Status::Invalid));
    }

    #[test]
    fn test_rx_pool_resize_requires_idle() {
        let mut pool = RxPool::new(2, 64, 1);
        let buf = pool.take().unwrap();
        assert_eq!(pool.resize(4), Err(Status::Busy));
        pool.put(buf).unwrap();
        pool.resize(4).unwrap();
        assert_eq!(pool.capacity(), 4);
        assert_eq!(pool.available(), 4);
    }

    #[test]
    fn test_tx_pool_exhaustion() {
        let mut pool = TxPool::new(2, 128);
        let a = pool.take().unwrap();
        let _b = pool.take().unwrap();
        assert!(pool.take().is_none());
        pool.put(a);
        assert!(pool.take().is_some());
    }

    #[test]
    fn test_tx_pool_put_clears() {
        let mut pool = TxPool::new(1, 128);
        let mut buf = pool.take().unwrap();
        buf.extend_from_slice(&[1, 2, 3]);
        pool.put(buf);
        assert!(pool.take().unwrap().is_empty());
    }
}
