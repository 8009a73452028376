//! C3 — event dispatcher.
//!
//! Allocates exactly one (simulated) MSI vector and decodes a single
//! "identity" MMIO word into a set of work items, coalescing re-entrant
//! notifications so at most one worker is ever active per device. The
//! `crossbeam-channel` bounded(1) notification channel is what provides the
//! coalescing: a second `try_send` while a notification is already pending
//! is simply dropped, the same way `queue_work` refuses to double-queue a
//! `work_struct` that is already pending.

use std::marker::PhantomData;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use log::{debug, trace};

use crate::mmio::MmioRegion;

/// A set of event kinds decoded from one device's identity register. Each
/// kind occupies one bit of the identity/pending word (bits not covered by
/// any `EventKind::ALL` entry are tolerated and simply cleared, per §4.3).
pub trait EventKind: Copy + Eq + std::fmt::Debug + Send + Sync + 'static {
    const ALL: &'static [Self];

    fn bit(self) -> u32;
}

/// BL event kinds (§4.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlEvent {
    StatusUpdate,
}

impl EventKind for BlEvent {
    const ALL: &'static [Self] = &[BlEvent::StatusUpdate];

    fn bit(self) -> u32 {
        match self {
            BlEvent::StatusUpdate => 0,
        }
    }
}

/// LK event kinds (§4.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LkEvent {
    RxReady,
    TxReady,
    Doorbell,
}

impl EventKind for LkEvent {
    const ALL: &'static [Self] = &[LkEvent::RxReady, LkEvent::TxReady, LkEvent::Doorbell];

    fn bit(self) -> u32 {
        match self {
            LkEvent::RxReady => 0,
            LkEvent::TxReady => 1,
            LkEvent::Doorbell => 2,
        }
    }
}

/// VPU event kinds (§4.3), included for completeness alongside the §4.8
/// command-queue sketch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VpuEvent {
    CmdqReply,
    DmaqReply,
    CmdqPreempted,
    DmaqPreempted,
    StatusUpdate,
}

impl EventKind for VpuEvent {
    const ALL: &'static [Self] = &[
        VpuEvent::CmdqReply,
        VpuEvent::DmaqReply,
        VpuEvent::CmdqPreempted,
        VpuEvent::DmaqPreempted,
        VpuEvent::StatusUpdate,
    ];

    fn bit(self) -> u32 {
        match self {
            VpuEvent::CmdqReply => 0,
            VpuEvent::DmaqReply => 1,
            VpuEvent::CmdqPreempted => 2,
            VpuEvent::DmaqPreempted => 3,
            VpuEvent::StatusUpdate => 4,
        }
    }
}

/// Per-device deferred-work dispatcher for one identity register.
pub struct EventDispatcher<K: EventKind> {
    pending: Arc<AtomicU32>,
    notify_tx: Sender<()>,
    worker: Option<JoinHandle<()>>,
    _marker: PhantomData<K>,
}

impl<K: EventKind> EventDispatcher<K> {
    /// Spawns the worker thread. `handler` runs on the worker thread, once
    /// per set bit, in ascending bit order (the dispatcher's FIFO contract
    /// for a single identity word).
    pub fn new<F>(handler: F) -> Self
    where
        F: Fn(K) + Send + Sync + 'static,
    {
        let pending = Arc::new(AtomicU32::new(0));
        let (notify_tx, notify_rx): (Sender<()>, Receiver<()>) = bounded(1);
        let handler = Arc::new(handler);

        let worker_pending = pending.clone();
        let worker = std::thread::spawn(move || {
            Self::worker_loop(worker_pending, notify_rx, handler);
        });

        Self {
            pending,
            notify_tx,
            worker: Some(worker),
            _marker: PhantomData,
        }
    }

    fn worker_loop(pending: Arc<AtomicU32>, notify_rx: Receiver<()>, handler: Arc<dyn Fn(K) + Send + Sync>) {
        while notify_rx.recv().is_ok() {
            loop {
                let mask = pending.swap(0, Ordering::AcqRel);
                if mask == 0 {
                    break;
                }
                for kind in K::ALL {
                    if mask & (1 << kind.bit()) != 0 {
                        trace!("event dispatcher: handling {:?}", kind);
                        handler(*kind);
                    }
                }
            }
        }
    }

    /// Reads the identity word from `region` at `identity_offset`, posts a
    /// work item per set bit matching a known [`EventKind`], then
    /// acknowledges by writing zero back. Intended to be called from the
    /// (simulated) ISR context.
    pub fn on_interrupt(&self, region: &dyn MmioRegion, identity_offset: usize) {
        let identity = region.read_u32(identity_offset);
        region.write_u32(identity_offset, 0);

        if identity == 0 {
            return;
        }

        let known_mask: u32 = K::ALL.iter().fold(0, |acc, k| acc | (1 << k.bit()));
        let unknown = identity & !known_mask;
        if unknown != 0 {
            debug!("event dispatcher: tolerating unknown identity bits {:#x}", unknown);
        }

        self.pending.fetch_or(identity & known_mask, Ordering::AcqRel);
        match self.notify_tx.try_send(()) {
            Ok(()) | Err(TrySendError::Full(())) => {}
            Err(TrySendError::Disconnected(())) => {}
        }
    }

    /// Synchronously cancels in-flight work and joins the worker thread.
    /// Must precede IRQ release (§4.3); this is also performed by `Drop`.
    pub fn shutdown(&mut self) {
        drop(std::mem::replace(&mut self.notify_tx, bounded(0).0));
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

impl<K: EventKind> Drop for EventDispatcher<K> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mmio::SimRegion;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    #[test]
    fn dispatch_clears_identity_and_runs_handler() {
        let region = SimRegion::new(16);
        region.write_u32(0x30, 1 << LkEvent::RxReady.bit());

        let seen = Arc::new(AtomicUsize::new(0));
        let seen_clone = seen.clone();
        let mut dispatcher = EventDispatcher::<LkEvent>::new(move |kind| {
            assert_eq!(kind, LkEvent::RxReady);
            seen_clone.fetch_add(1, Ordering::SeqCst);
        });

        dispatcher.on_interrupt(&region, 0x30);
        std::thread::sleep(Duration::from_millis(20));

        assert_eq!(region.read_u32(0x30), 0);
        assert_eq!(seen.load(Ordering::SeqCst), 1);
        dispatcher.shutdown();
    }

    #[test]
    fn unknown_bits_are_tolerated_and_cleared() {
        let region = SimRegion::new(16);
        region.write_u32(0x30, 1 << 30);

        let mut dispatcher = EventDispatcher::<LkEvent>::new(|_| {});
        dispatcher.on_interrupt(&region, 0x30);
        std::thread::sleep(Duration::from_millis(10));
        assert_eq!(region.read_u32(0x30), 0);
        dispatcher.shutdown();
    }

    #[test]
    fn reentrant_notifications_coalesce() {
        let count = Arc::new(AtomicUsize::new(0));
        let count_clone = count.clone();
        let mut dispatcher = EventDispatcher::<BlEvent>::new(move |_| {
            count_clone.fetch_add(1, Ordering::SeqCst);
            std::thread::sleep(Duration::from_millis(30));
        });

        let region = SimRegion::new(16);
        region.write_u32(0x30, 1);
        dispatcher.on_interrupt(&region, 0x30);
        region.write_u32(0x30, 1);
        dispatcher.on_interrupt(&region, 0x30);
        region.write_u32(0x30, 1);
        dispatcher.on_interrupt(&region, 0x30);

        std::thread::sleep(Duration::from_millis(150));
        dispatcher.shutdown();

        // At most one worker is ever active; re-queuing while busy coalesces,
        // so the handler is expected to run far fewer times than it was
        // signalled.
        assert!(count.load(Ordering::SeqCst) >= 1);
        assert!(count.load(Ordering::SeqCst) <= 3);
    }
}
