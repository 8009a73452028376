//! Buffer descriptor (bd) and buffer pool.
//!
//! Buffer descriptors live in an index-based arena rather than a pointer
//! graph: a `Pool` owns a fixed `Vec<Buffer>` and hands out/reclaims arena
//! indices, so a "dangling bd" is not representable.

use std::sync::Mutex;

/// One buffer descriptor. `true_len` is the immutable allocation size;
/// `data_off`/`length` express the unconsumed window within it, advanced as
/// a consumer drains the buffer.
pub struct Buffer {
    storage: Vec<u8>,
    true_len: usize,
    data_off: usize,
    length: usize,
    /// Interface id a TX buffer is tagged with before posting; unused for
    /// RX buffers until a descriptor resolves one on consumption.
    pub iface: u16,
}

impl Buffer {
    fn new(fragment_size: usize) -> Self {
        // Rounded up to cache-line size (64 bytes).
        let true_len = (fragment_size + 63) & !63;
        Self {
            storage: vec![0u8; true_len],
            true_len,
            data_off: 0,
            length: 0,
            iface: 0,
        }
    }

    pub fn true_len(&self) -> usize {
        self.true_len
    }

    pub fn window(&self) -> &[u8] {
        &self.storage[self.data_off..self.data_off + self.length]
    }

    pub fn window_mut(&mut self) -> &mut [u8] {
        &mut self.storage[self.data_off..self.data_off + self.length]
    }

    pub fn as_ptr(&self) -> *const u8 {
        self.storage.as_ptr()
    }

    /// Full backing allocation, for writing fresh content before
    /// `set_window` establishes the unconsumed range.
    pub fn storage_mut(&mut self) -> &mut [u8] {
        &mut self.storage
    }

    pub fn set_window(&mut self, data_off: usize, length: usize) {
        self.data_off = data_off;
        self.length = length;
    }

    /// Advances the cursor by `n` bytes (consumed from the front).
    pub fn advance(&mut self, n: usize) {
        self.data_off += n;
        self.length -= n;
    }

    pub fn remaining(&self) -> usize {
        self.length
    }
}

struct Inner {
    arena: Vec<Buffer>,
    free: Vec<usize>,
}

/// A mutex-guarded pool of fixed-size buffers (§3 "Buffer pool / queue").
/// Two exist per device (TX, RX); invariant: `free.len()` plus
/// ring-occupied plus interface-queued buffers equals `capacity` at all
/// times (§8 property 2).
pub struct Pool {
    inner: Mutex<Inner>,
    capacity: usize,
    fragment_size: usize,
}

impl Pool {
    /// `bytes_per_pool` is rounded up to a whole number of `fragment_size`
    /// buffers (§4.6.2).
    pub fn new(bytes_per_pool: usize, fragment_size: usize) -> Self {
        let capacity = bytes_per_pool.div_ceil(fragment_size).max(1);
        let arena: Vec<Buffer> = (0..capacity).map(|_| Buffer::new(fragment_size)).collect();
        let free = (0..capacity).collect();

        Self {
            inner: Mutex::new(Inner { arena, free }),
            capacity,
            fragment_size,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn fragment_size(&self) -> usize {
        self.fragment_size
    }

    /// Leases a buffer out of the pool, or `None` if exhausted
    /// (backpressure, §4.6.2/§4.6.4).
    pub fn alloc(&self) -> Option<usize> {
        self.inner.lock().unwrap().free.pop()
    }

    /// Returns a buffer to the pool, resetting its cursor window.
    pub fn free(&self, idx: usize) {
        let mut inner = self.inner.lock().unwrap();
        inner.arena[idx].set_window(0, 0);
        inner.free.push(idx);
    }

    pub fn free_count(&self) -> usize {
        self.inner.lock().unwrap().free.len()
    }

    pub fn data_ptr(&self, idx: usize) -> *const u8 {
        self.inner.lock().unwrap().arena[idx].as_ptr()
    }

    pub fn with_buffer_mut<R>(&self, idx: usize, f: impl FnOnce(&mut Buffer) -> R) -> R {
        let mut inner = self.inner.lock().unwrap();
        f(&mut inner.arena[idx])
    }

    pub fn with_buffer<R>(&self, idx: usize, f: impl FnOnce(&Buffer) -> R) -> R {
        let inner = self.inner.lock().unwrap();
        f(&inner.arena[idx])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alloc_free_conserves_capacity() {
        let pool = Pool::new(4 * 16, 16);
        assert_eq!(pool.capacity(), 4);
        assert_eq!(pool.free_count(), 4);

        let a = pool.alloc().unwrap();
        let b = pool.alloc().unwrap();
        assert_eq!(pool.free_count(), 2);

        pool.free(a);
        pool.free(b);
        assert_eq!(pool.free_count(), 4);
    }

    #[test]
    fn exhausted_pool_returns_none() {
        let pool = Pool::new(2 * 16, 16);
        let _a = pool.alloc().unwrap();
        let _b = pool.alloc().unwrap();
        assert!(pool.alloc().is_none());
    }

    #[test]
    fn buffer_window_advance_tracks_remaining() {
        let pool = Pool::new(16, 16);
        let idx = pool.alloc().unwrap();
        pool.with_buffer_mut(idx, |buf| {
            buf.window_mut()[..4].copy_from_slice(b"data");
            buf.set_window(0, 4);
        });
        pool.with_buffer_mut(idx, |buf| {
            assert_eq!(buf.remaining(), 4);
            buf.advance(2);
            assert_eq!(buf.remaining(), 2);
            assert_eq!(buf.window(), b"ta");
        });
    }
}
