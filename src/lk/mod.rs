//! C6 (ring transport) and C7 (interface multiplexer): the serial/link
//! core. One `LkCore` owns the paired TX/RX rings, their buffer pools, the
//! write-pending queue, and the fixed set of multiplexed interfaces.

pub mod iface;
pub mod pool;
pub mod ring;

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::{error, info, warn};

use crate::dma::{DmaDirection, DmaMapper};
use crate::error::{CanFail, Error};
use crate::events::{EventDispatcher, LkEvent};
use crate::pci::{self, PciSession};
use iface::Interface;
use pool::Pool;
use ring::{Descriptor, Ring};

/// Installation-dependent sizing/topology knobs for the serial/link core.
pub struct LkConfig {
    /// Offset of the capability linked list anchor (§4.6.1).
    pub capability_anchor_offset: usize,
    pub tx_pool_bytes: usize,
    pub rx_pool_bytes: usize,
    /// Fixed set of interfaces, equal between host and device (§4.7).
    pub interface_count: u16,
}

impl Default for LkConfig {
    fn default() -> Self {
        Self {
            capability_anchor_offset: 0x00,
            tx_pool_bytes: 256 * 1024,
            rx_pool_bytes: 256 * 1024,
            interface_count: 4,
        }
    }
}

struct TxStream {
    ring: Ring,
    shadow: Vec<Option<(usize, crate::dma::DmaMapping)>>,
    /// Last slot whose completion has been reaped (§3 Stream `pipe.old`).
    old: u32,
    /// Last tail value published to the device.
    tail_local: u32,
}

struct RxStream {
    ring: Ring,
    shadow: Vec<Option<(usize, crate::dma::DmaMapping)>>,
    /// Last head value published to the device (§3 Stream `pipe.old`).
    head_local: u32,
}

struct LkCoreInner {
    session: PciSession,
    tx: Mutex<TxStream>,
    rx: Mutex<RxStream>,
    tx_pool: Pool,
    rx_pool: Pool,
    write_pending: Mutex<VecDeque<usize>>,
    interfaces: Vec<Interface>,
    dma: Arc<dyn DmaMapper>,
    doorbell_count: AtomicU64,
    opened: AtomicBool,
    dispatcher: Mutex<Option<EventDispatcher<LkEvent>>>,
}

/// An initialized serial/link core. Cheaply cloneable (the handle is an
/// `Arc`); dropping the last clone tears down the event dispatcher.
#[derive(Clone)]
pub struct LkCore(Arc<LkCoreInner>);

impl LkCore {
    /// Runs the full init sequence: capability negotiation, ring/pool
    /// construction, RX ring pre-population, MSI settle, and the closing
    /// doorbell kick that tells the device the host is ready.
    pub fn open(session: PciSession, dma: Arc<dyn DmaMapper>, config: &LkConfig) -> CanFail<Self> {
        let region = session.bar2_arc();
        let cap = ring::discover_txrx(&*region, config.capability_anchor_offset)?;

        let tx_pool = Pool::new(config.tx_pool_bytes, cap.fragment_size);
        let rx_pool = Pool::new(config.rx_pool_bytes, cap.fragment_size);

        let tx_ring = Ring::new(region.clone(), cap.tx_ring_offset, cap.tx_head_cell, cap.tx_tail_cell, cap.tx_count);
        let rx_ring = Ring::new(region.clone(), cap.rx_ring_offset, cap.rx_head_cell, cap.rx_tail_cell, cap.rx_count);

        let tx_shadow = (0..cap.tx_count).map(|_| None).collect();
        let rx_shadow = (0..cap.rx_count).map(|_| None).collect();

        let tx = TxStream {
            old: tx_ring.head(),
            tail_local: tx_ring.tail(),
            ring: tx_ring,
            shadow: tx_shadow,
        };
        let mut rx = RxStream {
            head_local: rx_ring.head(),
            ring: rx_ring,
            shadow: rx_shadow,
        };

        // Pre-populate every RX slot with a mapped buffer (§4.6.2).
        for slot in 0..cap.rx_count {
            let buf_idx = rx_pool
                .alloc()
                .ok_or(Error::NoSpace("rx pool too small for ring capacity"))?;
            let ptr = rx_pool.data_ptr(buf_idx);
            let mapping = dma.map(ptr, rx_pool.fragment_size(), DmaDirection::FromDevice)?;
            rx.ring.write_descriptor(
                slot,
                Descriptor {
                    addr: mapping.addr,
                    length: rx_pool.fragment_size() as u32,
                    iface: 0,
                    status: ring::STATUS_PENDING,
                },
            );
            rx.shadow[slot as usize] = Some((buf_idx, mapping));
        }

        let interfaces = (0..config.interface_count).map(Interface::new).collect();

        let inner = Arc::new(LkCoreInner {
            session,
            tx: Mutex::new(tx),
            rx: Mutex::new(rx),
            tx_pool,
            rx_pool,
            write_pending: Mutex::new(VecDeque::new()),
            interfaces,
            dma,
            doorbell_count: AtomicU64::new(0),
            opened: AtomicBool::new(false),
            dispatcher: Mutex::new(None),
        });

        inner.session.msi_enable(true)?;
        std::thread::sleep(Duration::from_millis(50));

        let weak = Arc::downgrade(&inner);
        let dispatcher = EventDispatcher::<LkEvent>::new(move |event| {
            let Some(core) = weak.upgrade() else { return };
            match event {
                LkEvent::RxReady => rx_worker(core),
                LkEvent::TxReady => tx_worker(&core),
                LkEvent::Doorbell => {
                    info!("lk: doorbell-ack event observed");
                }
            }
        });
        *inner.dispatcher.lock().unwrap() = Some(dispatcher);

        doorbell(&inner, pci::DOORBELL_MAGIC_LK);

        Ok(Self(inner))
    }

    /// Simple opened-flag guard, matching the `mxlk_core_open`/`_close`
    /// contract: opening an already-open core is an error, not a no-op.
    pub fn core_open(&self) -> CanFail<()> {
        if self.0.opened.swap(true, Ordering::SeqCst) {
            return Err(Error::DeviceBusy("link core already open"));
        }
        Ok(())
    }

    pub fn core_close(&self) {
        self.0.opened.store(false, Ordering::SeqCst);
    }

    pub fn interface(&self, id: u16) -> Option<LkInterface> {
        if (id as usize) >= self.0.interfaces.len() {
            return None;
        }
        Some(LkInterface {
            core: self.0.clone(),
            id: id as usize,
        })
    }

    pub fn doorbell_count(&self) -> u64 {
        self.0.doorbell_count.load(Ordering::SeqCst)
    }

    pub fn tx_pool_free(&self) -> usize {
        self.0.tx_pool.free_count()
    }

    pub fn rx_pool_free(&self) -> usize {
        self.0.rx_pool.free_count()
    }

    pub fn tx_pool_capacity(&self) -> usize {
        self.0.tx_pool.capacity()
    }

    pub fn rx_pool_capacity(&self) -> usize {
        self.0.rx_pool.capacity()
    }

    /// Test/diagnostic hook: simulates the MSI that would follow the device
    /// producing RX descriptors or consuming TX ones.
    pub fn simulate_interrupt(&self, identity_bits: u32) {
        if let Some(dispatcher) = self.0.dispatcher.lock().unwrap().as_ref() {
            let region = self.0.session.bar2();
            // The LK identity register shares BL's offset convention; the
            // simulated device writes the bits the dispatcher then decodes.
            region.write_u32(crate::bl::reg::INT_IDENTITY, identity_bits);
            dispatcher.on_interrupt(region, crate::bl::reg::INT_IDENTITY);
        }
    }
}

impl Drop for LkCoreInner {
    fn drop(&mut self) {
        if let Some(mut dispatcher) = self.dispatcher.lock().unwrap().take() {
            dispatcher.shutdown();
        }
    }
}

fn doorbell(core: &LkCoreInner, magic: u32) {
    core.session.config().write_u32(pci::offset::DOORBELL, magic);
    core.doorbell_count.fetch_add(1, Ordering::SeqCst);
}

/// TX worker (§4.6.3): reap completions, then drain the write-pending queue
/// into fresh descriptors, publishing tail and a coalesced doorbell once.
fn tx_worker(core: &Arc<LkCoreInner>) {
    let mut tx = core.tx.lock().unwrap();

    let device_head = tx.ring.head();
    while tx.old != device_head {
        let slot = tx.old;
        let desc = tx.ring.descriptor(slot);
        if desc.status != ring::STATUS_SUCCESS {
            warn!("lk: tx descriptor {slot} completed with error status {:#x}", desc.status);
        }
        if let Some((buf_idx, mapping)) = tx.shadow[slot as usize].take() {
            core.dma.unmap(mapping);
            core.tx_pool.free(buf_idx);
        }
        tx.old = (slot + 1) % tx.ring.capacity();
    }

    let mut tail = tx.tail_local;
    let mut moved = false;
    loop {
        let device_head = tx.ring.head();
        let next_tail = (tail + 1) % tx.ring.capacity();
        if next_tail == device_head {
            break;
        }
        let Some(buf_idx) = core.write_pending.lock().unwrap().pop_front() else {
            break;
        };

        let (len, iface) = core.tx_pool.with_buffer(buf_idx, |b| (b.remaining(), b.iface));
        let ptr = core.tx_pool.data_ptr(buf_idx);

        match core.dma.map(ptr, len, DmaDirection::ToDevice) {
            Ok(mapping) => {
                tx.ring.write_descriptor(
                    tail,
                    Descriptor {
                        addr: mapping.addr,
                        length: len as u32,
                        iface,
                        status: ring::STATUS_PENDING,
                    },
                );
                tx.shadow[tail as usize] = Some((buf_idx, mapping));
                tail = next_tail;
                moved = true;
            }
            Err(e) => {
                error!("lk: failed to map tx buffer: {e}");
                core.tx_pool.free(buf_idx);
                break;
            }
        }
    }

    if moved {
        tx.tail_local = tail;
        tx.ring.set_tail(tail);
    }
    drop(tx);

    if moved {
        doorbell(core, pci::DOORBELL_MAGIC_LK);
    }
}

/// RX worker (§4.6.4): reserve replacements, deliver completed buffers to
/// their interface's read queue, and reschedule after 5ms on backpressure.
fn rx_worker(core: Arc<LkCoreInner>) {
    let (advanced, restart) = {
        let mut rx = core.rx.lock().unwrap();
        let mut cursor = rx.head_local;
        let device_tail = rx.ring.tail();
        let mut advanced = false;
        let mut restart = false;

        while cursor != device_tail {
            let Some(replacement) = core.rx_pool.alloc() else {
                restart = true;
                break;
            };

            let slot = cursor;
            let desc = rx.ring.descriptor(slot);
            if let Some((buf_idx, mapping)) = rx.shadow[slot as usize].take() {
                core.dma.unmap(mapping);
                if desc.status == ring::STATUS_SUCCESS {
                    core.rx_pool.with_buffer_mut(buf_idx, |b| b.set_window(0, desc.length as usize));
                    let iface_idx = desc.iface as usize;
                    if iface_idx < core.interfaces.len() {
                        core.interfaces[iface_idx].push_read(buf_idx);
                    } else {
                        warn!("lk: rx descriptor names unknown interface {}", desc.iface);
                        core.rx_pool.free(buf_idx);
                    }
                } else {
                    warn!("lk: rx descriptor {slot} completed with error status {:#x}", desc.status);
                    core.rx_pool.free(buf_idx);
                }
            }

            let ptr = core.rx_pool.data_ptr(replacement);
            match core.dma.map(ptr, core.rx_pool.fragment_size(), DmaDirection::FromDevice) {
                Ok(mapping) => {
                    rx.ring.write_descriptor(
                        slot,
                        Descriptor {
                            addr: mapping.addr,
                            length: core.rx_pool.fragment_size() as u32,
                            iface: 0,
                            status: ring::STATUS_PENDING,
                        },
                    );
                    rx.shadow[slot as usize] = Some((replacement, mapping));
                }
                Err(e) => {
                    error!("lk: failed to remap rx buffer: {e}");
                    core.rx_pool.free(replacement);
                    restart = true;
                    break;
                }
            }

            cursor = (cursor + 1) % rx.ring.capacity();
            advanced = true;
        }

        if advanced {
            rx.head_local = cursor;
            rx.ring.set_head(cursor);
        }

        (advanced, restart)
    };

    if advanced {
        doorbell(&core, pci::DOORBELL_MAGIC_LK);
    }

    if restart {
        let core = core.clone();
        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(5));
            rx_worker(core);
        });
    }
}

/// Public handle to one multiplexed interface (§4.7).
pub struct LkInterface {
    core: Arc<LkCoreInner>,
    id: usize,
}

impl LkInterface {
    /// Drains available RX data into `dst`, returning the number of bytes
    /// actually transferred. Zero is a legitimate, non-error result.
    pub fn read(&self, dst: &mut [u8]) -> usize {
        let iface = &self.core.interfaces[self.id];
        let _guard = iface.read_lock.lock().unwrap();

        let mut written = 0;
        while written < dst.len() {
            let Some(buf_idx) = iface.next_read_buffer() else {
                break;
            };

            let (copied, exhausted) = self.core.rx_pool.with_buffer_mut(buf_idx, |b| {
                let n = (dst.len() - written).min(b.remaining());
                dst[written..written + n].copy_from_slice(&b.window()[..n]);
                b.advance(n);
                (n, b.remaining() == 0)
            });

            written += copied;

            if exhausted {
                self.core.rx_pool.free(buf_idx);
            } else {
                iface.retain_partial(buf_idx);
                break;
            }
        }
        written
    }

    /// Copies `src` into TX buffers and posts them for transmission,
    /// returning the number of bytes actually queued (a short count if the
    /// TX pool is exhausted mid-call).
    pub fn write(&self, src: &[u8]) -> usize {
        let iface = &self.core.interfaces[self.id];
        let _guard = iface.write_lock.lock().unwrap();

        let fragment = self.core.tx_pool.fragment_size();
        let mut copied = 0;
        let mut chain = Vec::new();

        while copied < src.len() {
            let Some(buf_idx) = self.core.tx_pool.alloc() else {
                break;
            };
            let n = (src.len() - copied).min(fragment);
            self.core.tx_pool.with_buffer_mut(buf_idx, |b| {
                b.storage_mut()[..n].copy_from_slice(&src[copied..copied + n]);
                b.set_window(0, n);
                b.iface = iface.id;
            });
            chain.push(buf_idx);
            copied += n;
        }

        if !chain.is_empty() {
            self.core.write_pending.lock().unwrap().extend(chain);
            tx_worker(&self.core);
        }

        copied
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dma::SimDmaMapper;
    use crate::mmio::SimRegion;
    use crate::pci::backend::SimConfigSpace;

    fn write_capability(region: &SimRegion, anchor: usize, tx_count: u32, rx_count: u32, fragment: usize) {
        region.write_u16(anchor, 0x0001); // CAP_ID_TXRX
        region.write_u16(anchor + 2, ring::EXPECTED_VERSION);
        region.write_u32(anchor + 4, 0); // next = null

        let body = anchor + 8;
        region.write_u32(body, 0x1000); // tx ring offset
        region.write_u32(body + 4, tx_count);
        region.write_u32(body + 8, 0x40); // tx head cell
        region.write_u32(body + 12, 0x44); // tx tail cell
        region.write_u32(body + 16, 0x2000); // rx ring offset
        region.write_u32(body + 20, rx_count);
        region.write_u32(body + 24, 0x48); // rx head cell
        region.write_u32(body + 28, 0x4C); // rx tail cell
        region.write_u32(body + 32, fragment as u32);
    }

    fn open_core(tx_count: u32, rx_count: u32, fragment: usize, pool_bufs: usize, ifaces: u16) -> LkCore {
        let cfg = Arc::new(SimConfigSpace::new_myriad_x());
        let region = Arc::new(SimRegion::new(0x10000));
        write_capability(&region, 0x00, tx_count, rx_count, fragment);

        let session = PciSession::open(cfg, region, None).unwrap();
        let dma = Arc::new(SimDmaMapper::new());
        let config = LkConfig {
            capability_anchor_offset: 0x00,
            tx_pool_bytes: pool_bufs * fragment,
            rx_pool_bytes: pool_bufs * fragment,
            interface_count: ifaces,
        };

        LkCore::open(session, dma, &config).unwrap()
    }

    #[test]
    fn open_prepopulates_rx_ring_and_sends_init_doorbell() {
        let core = open_core(8, 8, 256, 16, 2);
        assert_eq!(core.doorbell_count(), 1);
        assert_eq!(core.rx_pool_free(), core.rx_pool_capacity() - 7);
    }

    #[test]
    fn write_short_count_when_tx_pool_exhausted() {
        let core = open_core(8, 8, 64, 2, 1);
        let iface = core.interface(0).unwrap();

        let data = vec![0xAAu8; 64 * 10];
        let written = iface.write(&data);
        assert!(written < data.len());
        assert_eq!(written % 64, 0);
    }

    #[test]
    fn read_returns_zero_when_no_data_available() {
        let core = open_core(4, 4, 64, 4, 1);
        let iface = core.interface(0).unwrap();
        let mut buf = [0u8; 32];
        assert_eq!(iface.read(&mut buf), 0);
    }

    #[test]
    fn partial_read_is_retained_across_calls() {
        let core = open_core(4, 4, 64, 4, 1);
        let iface_handle = core.interface(0).unwrap();

        // Hand-deliver one RX buffer with 10 bytes of payload directly to
        // the interface's read queue, bypassing the ring/MSI path, to
        // exercise the partial_read carry-over in isolation.
        let buf_idx = core.0.rx_pool.alloc().unwrap();
        core.0.rx_pool.with_buffer_mut(buf_idx, |b| {
            b.storage_mut()[..10].copy_from_slice(b"0123456789");
            b.set_window(0, 10);
        });
        core.0.interfaces[0].push_read(buf_idx);

        let mut first = [0u8; 4];
        assert_eq!(iface_handle.read(&mut first), 4);
        assert_eq!(&first, b"0123");
        assert!(core.0.interfaces[0].has_partial());

        let mut second = [0u8; 10];
        assert_eq!(iface_handle.read(&mut second), 6);
        assert_eq!(&second[..6], b"456789");
        assert!(!core.0.interfaces[0].has_partial());
    }

    #[test]
    fn write_then_tx_worker_reap_returns_buffer_to_pool() {
        let core = open_core(4, 4, 64, 4, 1);
        let iface = core.interface(0).unwrap();

        let before = core.tx_pool_free();
        iface.write(b"hello");
        assert!(core.tx_pool_free() < before);

        // Simulate the device consuming the one posted descriptor: mark it
        // successful and advance the TX ring's head.
        {
            let mut tx = core.0.tx.lock().unwrap();
            let slot = tx.old;
            let mut desc = tx.ring.descriptor(slot);
            desc.status = ring::STATUS_SUCCESS;
            tx.ring.write_descriptor(slot, desc);
            let next = (slot + 1) % tx.ring.capacity();
            tx.ring.set_head(next);
        }

        tx_worker(&core.0);
        assert_eq!(core.tx_pool_free(), before);
    }
}
