//! C8 — VPU command queue, built to sketch depth only (§4.8). Not a full VPU
//! driver: demonstrates the fixed-slot/free-list/reply-channel pattern named
//! alongside the ring transport, nothing more.

use std::collections::HashMap;
use std::sync::Mutex;

use crossbeam_channel::{bounded, Receiver, Sender};

use crate::error::{CanFail, Error};

/// One in-flight command's reply, delivered exactly once.
#[derive(Debug, Clone)]
pub struct Reply {
    pub payload: Vec<u8>,
}

struct Inflight {
    reply_tx: Sender<Reply>,
}

struct Inner {
    free: Vec<u16>,
    inflight: HashMap<u32, Inflight>,
    seqno: u32,
}

/// Fixed-size command-slot pool with O(1) reply-to-callback lookup via the
/// id's embedded slot position.
pub struct CommandQueue {
    inner: Mutex<Inner>,
    capacity: u16,
}

impl CommandQueue {
    pub fn new(capacity: u16) -> Self {
        Self {
            inner: Mutex::new(Inner {
                free: (0..capacity).collect(),
                inflight: HashMap::new(),
                seqno: 0,
            }),
            capacity,
        }
    }

    pub fn capacity(&self) -> u16 {
        self.capacity
    }

    /// Draws a free slot and rounds `payload` up to a 32-bit multiple,
    /// returning the encoded id and a receiver for the eventual reply.
    pub fn push(&self, payload: &[u8]) -> CanFail<(u32, Receiver<Reply>, Vec<u8>)> {
        let mut inner = self.inner.lock().unwrap();
        let position = inner.free.pop().ok_or(Error::NoSpace("command queue exhausted"))?;

        inner.seqno = inner.seqno.wrapping_add(1);
        let id = (inner.seqno << 16) | position as u32;

        let (reply_tx, reply_rx) = bounded(1);
        inner.inflight.insert(id, Inflight { reply_tx });

        let rounded = (payload.len() + 3) & !3;
        let mut padded = payload.to_vec();
        padded.resize(rounded, 0);

        Ok((id, reply_rx, padded))
    }

    /// Delivers `reply` to the command's waiter exactly once and frees its
    /// slot. A second `complete` for the same id (a duplicate reply racing a
    /// queue-wide flush) is silently ignored.
    pub fn complete(&self, id: u32, reply: Reply) {
        let position = (id & 0xFFFF) as u16;
        let mut inner = self.inner.lock().unwrap();

        if let Some(entry) = inner.inflight.remove(&id) {
            let _ = entry.reply_tx.send(reply);
            inner.free.push(position);
        }
    }

    /// Flushes every in-flight command with `reply`, for async
    /// preempt/reset handling (§4.8). Each waiter still receives exactly one
    /// reply even if an ordinary `complete` races this call, because
    /// whichever removes the entry from `inflight` first wins.
    pub fn flush(&self, reply: Reply) {
        let mut inner = self.inner.lock().unwrap();
        let ids: Vec<u32> = inner.inflight.keys().copied().collect();
        for id in ids {
            if let Some(entry) = inner.inflight.remove(&id) {
                let _ = entry.reply_tx.send(reply.clone());
                inner.free.push((id & 0xFFFF) as u16);
            }
        }
    }

    pub fn outstanding(&self) -> usize {
        self.inner.lock().unwrap().inflight.len()
    }
}
