//! Interface multiplexer (C7, §4.7). Each interface owns a read queue, a
//! single `partial_read` slot, and separate read/write mutexes so consumer
//! calls serialize without blocking the other direction.

use std::collections::VecDeque;
use std::sync::Mutex;

/// One logical endpoint multiplexed over the physical link. `id` is the
/// 16-bit value every RX descriptor carries.
pub struct Interface {
    pub id: u16,
    read_queue: Mutex<VecDeque<usize>>,
    partial_read: Mutex<Option<usize>>,
    pub read_lock: Mutex<()>,
    pub write_lock: Mutex<()>,
}

impl Interface {
    pub fn new(id: u16) -> Self {
        Self {
            id,
            read_queue: Mutex::new(VecDeque::new()),
            partial_read: Mutex::new(None),
            read_lock: Mutex::new(()),
            write_lock: Mutex::new(()),
        }
    }

    /// Called by the RX worker once a buffer's interface id is resolved.
    pub fn push_read(&self, buf_idx: usize) {
        self.read_queue.lock().unwrap().push_back(buf_idx);
    }

    /// Pops the next buffer to drain: the carried-over `partial_read` first,
    /// then the read queue head (§4.7 invariant: only one partial read per
    /// interface).
    pub fn next_read_buffer(&self) -> Option<usize> {
        if let Some(idx) = self.partial_read.lock().unwrap().take() {
            return Some(idx);
        }
        self.read_queue.lock().unwrap().pop_front()
    }

    /// Retains a buffer as the carried-over fragment for the next read call.
    pub fn retain_partial(&self, buf_idx: usize) {
        let mut partial = self.partial_read.lock().unwrap();
        debug_assert!(partial.is_none(), "only one partial_read per interface");
        *partial = Some(buf_idx);
    }

    pub fn read_queue_len(&self) -> usize {
        self.read_queue.lock().unwrap().len()
    }

    pub fn has_partial(&self) -> bool {
        self.partial_read.lock().unwrap().is_some()
    }
}
