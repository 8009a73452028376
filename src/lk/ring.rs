//! Descriptor ring (§4.6.2) and capability negotiation (§4.6.1).

use std::sync::atomic::{fence, Ordering};
use std::sync::Arc;

use crate::error::{CanFail, Error};
use crate::mmio::MmioRegion;

pub const SLOT_SIZE: usize = 16;

pub const STATUS_SUCCESS: u16 = 0x0000;
/// Error sentinel a TX descriptor is initialized with before the device
/// overwrites it on completion (§4.6.3 step 2): if the device never
/// touches the slot, it reads back as an error rather than a false success.
pub const STATUS_PENDING: u16 = 0xFFFF;

#[derive(Debug, Clone, Copy, Default)]
pub struct Descriptor {
    pub addr: u64,
    pub length: u32,
    pub iface: u16,
    pub status: u16,
}

/// One descriptor ring living in MMIO, plus the head/tail cells that gate
/// it. Head and tail are plain monotone-modulo-N cells (§4.6.5): no wrap
/// counter, one slot permanently reserved to disambiguate empty from full.
pub struct Ring {
    region: Arc<dyn MmioRegion + Send + Sync>,
    base_offset: usize,
    head_cell: usize,
    tail_cell: usize,
    capacity: u32,
}

impl Ring {
    pub fn new(
        region: Arc<dyn MmioRegion + Send + Sync>,
        base_offset: usize,
        head_cell: usize,
        tail_cell: usize,
        capacity: u32,
    ) -> Self {
        Self {
            region,
            base_offset,
            head_cell,
            tail_cell,
            capacity,
        }
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    pub fn head(&self) -> u32 {
        self.region.read_u32(self.head_cell)
    }

    pub fn tail(&self) -> u32 {
        self.region.read_u32(self.tail_cell)
    }

    /// Publishes a new head value. Callers must have already published any
    /// descriptor fields for slots up to (but not including) this value —
    /// the fence enforces that program order is also memory order (§4.6.5).
    pub fn set_head(&self, value: u32) {
        fence(Ordering::Release);
        self.region.write_u32(self.head_cell, value);
    }

    /// Publishes a new tail value; same ordering contract as `set_head`.
    pub fn set_tail(&self, value: u32) {
        fence(Ordering::Release);
        self.region.write_u32(self.tail_cell, value);
    }

    fn slot_offset(&self, slot: u32) -> usize {
        self.base_offset + slot as usize * SLOT_SIZE
    }

    pub fn descriptor(&self, slot: u32) -> Descriptor {
        let off = self.slot_offset(slot);
        Descriptor {
            addr: self.region.read_u64(off),
            length: self.region.read_u32(off + 8),
            iface: self.region.read_u16(off + 12),
            status: self.region.read_u16(off + 14),
        }
    }

    /// Writes the descriptor's address/length/interface/status fields.
    /// Does not publish head/tail — callers advance those explicitly once
    /// per worker pass (§4.6.3/§4.6.4).
    pub fn write_descriptor(&self, slot: u32, desc: Descriptor) {
        let off = self.slot_offset(slot);
        self.region.write_u64(off, desc.addr);
        self.region.write_u32(off + 8, desc.length);
        self.region.write_u16(off + 12, desc.iface);
        self.region.write_u16(off + 14, desc.status);
    }
}

/// `CAP_TXRX` descriptor contents (§4.6.1, §6).
#[derive(Debug, Clone, Copy)]
pub struct TxRxCapability {
    pub tx_ring_offset: usize,
    pub tx_count: u32,
    pub tx_head_cell: usize,
    pub tx_tail_cell: usize,
    pub rx_ring_offset: usize,
    pub rx_count: u32,
    pub rx_head_cell: usize,
    pub rx_tail_cell: usize,
    pub fragment_size: usize,
}

const CAP_ID_TXRX: u16 = 0x0001;
const CAP_HEADER_SIZE: usize = 8;

/// Expected major/minor version; mismatches abort with `IoError` (§4.6.1).
pub const EXPECTED_VERSION: u16 = 0x0100;

/// Walks the capability linked list anchored at `anchor_offset`, looking for
/// the TX/RX capability. Each record is `{id: u16, version: u16, next: u32}`
/// followed by type-specific fields; walking stops on a null `next`.
pub fn discover_txrx(region: &dyn MmioRegion, anchor_offset: usize) -> CanFail<TxRxCapability> {
    let mut offset = anchor_offset;
    let mut guard = 0;

    loop {
        if offset == 0 || guard > 64 {
            return Err(Error::Unsupported("CAP_TXRX not found in capability list"));
        }
        guard += 1;

        let id = region.read_u16(offset);
        let version = region.read_u16(offset + 2);
        let next = region.read_u32(offset + 4) as usize;

        if id == CAP_ID_TXRX {
            if version != EXPECTED_VERSION {
                return Err(Error::IoError("CAP_TXRX version mismatch"));
            }

            let body = offset + CAP_HEADER_SIZE;
            return Ok(TxRxCapability {
                tx_ring_offset: region.read_u32(body) as usize,
                tx_count: region.read_u32(body + 4),
                tx_head_cell: region.read_u32(body + 8) as usize,
                tx_tail_cell: region.read_u32(body + 12) as usize,
                rx_ring_offset: region.read_u32(body + 16) as usize,
                rx_count: region.read_u32(body + 20),
                rx_head_cell: region.read_u32(body + 24) as usize,
                rx_tail_cell: region.read_u32(body + 28) as usize,
                fragment_size: region.read_u32(body + 32) as usize,
            });
        }

        offset = next;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mmio::SimRegion;
    use std::sync::Arc;

    #[test]
    fn ring_empty_full_discriminator() {
        let region: Arc<dyn MmioRegion + Send + Sync> = Arc::new(SimRegion::new(0x1000));
        let ring = Ring::new(region, 0x100, 0x10, 0x14, 4);

        assert_eq!(ring.head(), 0);
        assert_eq!(ring.tail(), 0);

        ring.set_tail(1);
        assert_ne!(ring.head(), ring.tail());

        ring.set_tail(3);
        // (tail + 1) % capacity == head -> full
        assert_eq!((ring.tail() + 1) % ring.capacity(), ring.head());
    }

    #[test]
    fn descriptor_roundtrip() {
        let region: Arc<dyn MmioRegion + Send + Sync> = Arc::new(SimRegion::new(0x1000));
        let ring = Ring::new(region, 0x100, 0x10, 0x14, 4);

        let desc = Descriptor {
            addr: 0xDEAD_BEEF_0000,
            length: 4096,
            iface: 2,
            status: STATUS_PENDING,
        };
        ring.write_descriptor(1, desc);
        let read_back = ring.descriptor(1);
        assert_eq!(read_back.addr, desc.addr);
        assert_eq!(read_back.length, desc.length);
        assert_eq!(read_back.iface, desc.iface);
        assert_eq!(read_back.status, desc.status);
    }

    #[test]
    fn discover_txrx_walks_capability_list_and_checks_version() {
        let region = SimRegion::new(0x200);
        // A preceding, uninteresting capability at 0x00.
        region.write_u16(0x00, 0xBEEF);
        region.write_u16(0x02, EXPECTED_VERSION);
        region.write_u32(0x04, 0x20);

        region.write_u16(0x20, CAP_ID_TXRX);
        region.write_u16(0x22, EXPECTED_VERSION);
        region.write_u32(0x24, 0);
        let body = 0x28;
        region.write_u32(body, 0x1000);
        region.write_u32(body + 4, 32);
        region.write_u32(body + 8, 0x40);
        region.write_u32(body + 12, 0x44);
        region.write_u32(body + 16, 0x2000);
        region.write_u32(body + 20, 32);
        region.write_u32(body + 24, 0x48);
        region.write_u32(body + 28, 0x4C);
        region.write_u32(body + 32, 16384);

        let cap = discover_txrx(&region, 0x00).unwrap();
        assert_eq!(cap.tx_ring_offset, 0x1000);
        assert_eq!(cap.rx_count, 32);
        assert_eq!(cap.fragment_size, 16384);
    }
}
