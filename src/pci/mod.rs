//! C2 — PCI session.
//!
//! Enables the device, maps its BARs, negotiates a DMA mask, configures
//! ASPM, and saves/restores configuration state across a reset. One
//! `PciSession` type serves both the bootloader and serial/link cores, which
//! otherwise differ only in how the PCIe capability offset is located; this
//! runtime keeps a single capability-walk implementation for both.

pub mod backend;

use crate::error::{CanFail, Error};
use crate::mmio::MmioRegion;
use backend::ConfigSpace;
use std::sync::Arc;

/// Vendor id the driver matches against (Intel).
pub const VENDOR_ID_INTEL: u16 = 0x8086;

/// Myriad-X PCI device id the driver matches against.
pub const DEVICE_ID_MYRIAD_X: u16 = 0x6200;

/// Standard PCI config-space offsets this runtime touches.
pub mod offset {
    pub const VENDOR_ID: u32 = 0x00;
    pub const DEVICE_ID: u32 = 0x02;
    pub const COMMAND: u32 = 0x04;
    pub const STATUS: u32 = 0x06;

    /// Vendor-specific DLLP register; writing [`super::RESET_MAGIC`] here
    /// triggers the non-standard reset (§4.4).
    pub const RESET_TRIGGER: u32 = 0x704;
    /// DMA read-engine enable.
    pub const DMA_READ_ENGINE_ENABLE: u32 = 0x99C;
    /// DMA viewport select.
    pub const DMA_VIEWPORT_SELECT: u32 = 0xA6C;
    /// DMA channel control 1 (local-interrupt-on-completion enable).
    pub const DMA_CHAN_CTRL1: u32 = 0xA70;
    /// Doorbell register: 32-bit write of a magic pattern.
    pub const DOORBELL: u32 = 0xFF0;
}

/// Non-standard reset magic value (§4.4).
pub const RESET_MAGIC: u32 = 0xDEAD_DEAD;

/// Doorbell magic pattern for the serial/link core.
pub const DOORBELL_MAGIC_LK: u32 = u32::from_le_bytes(*b"RING");
/// Doorbell magic pattern for the VPU command queue.
pub const DOORBELL_MAGIC_VPU: u32 = u32::from_le_bytes(*b"NCMD");

/// Command-register bits this runtime manipulates directly.
pub mod command_bits {
    pub const IO_SPACE: u16 = 1 << 0;
    pub const MEM_SPACE: u16 = 1 << 1;
    pub const BUS_MASTER: u16 = 1 << 2;
    pub const INTX_DISABLE: u16 = 1 << 10;
}

/// Number of 32-bit words in the standard PCI configuration header that are
/// saved/restored across a reset.
pub const HEADER_WORDS: usize = 16;

/// The seven PCIe capability control words saved/restored across a reset, in
/// the order §3 names them: DEVCTL, LNKCTL, SLTCTL, RTCTL, DEVCTL2, LNKCTL2,
/// SLTCTL2. Offsets are relative to the start of the PCIe capability
/// structure, located by [`backend::ConfigSpace::find_pcie_capability`].
pub mod pcie_cap_offset {
    pub const DEVCTL: u32 = 0x08;
    pub const LNKCTL: u32 = 0x10;
    pub const SLTCTL: u32 = 0x18;
    pub const RTCTL: u32 = 0x1C;
    pub const DEVCTL2: u32 = 0x28;
    pub const LNKCTL2: u32 = 0x30;
    pub const SLTCTL2: u32 = 0x38;

    pub const ALL: [u32; 7] = [DEVCTL, LNKCTL, SLTCTL, RTCTL, DEVCTL2, LNKCTL2, SLTCTL2];
}

/// PCIe LNKCTL "Retrain Link" bit.
pub const LNKCTL_RETRAIN_LINK: u16 = 1 << 5;
/// PCIe LNKSTA "Link Training" bit (busy while training).
pub const LNKSTA_LINK_TRAINING: u16 = 1 << 11;
/// MSI enable bit, within the MSI capability's message-control word.
pub const MSI_ENABLE_BIT: u16 = 1 << 0;

/// Snapshot of configuration state captured before a reset and replayed
/// after the device reappears. Owned by the device handle (not a process
/// singleton, per §9): each [`PciSession`] owns exactly one.
#[derive(Debug, Clone, Default)]
pub struct SavedContext {
    pub header: [u32; HEADER_WORDS],
    pub pcie_ctl: [u16; 7],
}

/// An open PCI session: enabled device, mapped BAR2 (and optionally BAR4),
/// negotiated DMA mask, bus-mastering active.
pub struct PciSession {
    cfg: Arc<dyn ConfigSpace>,
    bar2: Arc<dyn MmioRegion + Send + Sync>,
    bar4: Option<Arc<dyn MmioRegion + Send + Sync>>,
    pcie_cap_offset: u32,
    msi_cap_offset: Option<u32>,
    dma_mask_bits: u8,
}

impl PciSession {
    /// Opens a session against an already-located device. `map_bar4`
    /// requests the optional direct-access VPU DDR window.
    pub fn open(
        cfg: Arc<dyn ConfigSpace>,
        bar2: Arc<dyn MmioRegion + Send + Sync>,
        bar4: Option<Arc<dyn MmioRegion + Send + Sync>>,
    ) -> CanFail<Self> {
        if bar2.len() == 0 {
            return Err(Error::MappingFailed("BAR2 region is empty"));
        }

        let pcie_cap_offset = cfg
            .find_capability(backend::CAP_ID_PCI_EXPRESS)
            .ok_or(Error::Unsupported("no PCIe capability structure"))?;
        let msi_cap_offset = cfg.find_capability(backend::CAP_ID_MSI);

        let dma_mask_bits = if cfg.supports_dma_mask(64) {
            64
        } else if cfg.supports_dma_mask(32) {
            32
        } else {
            return Err(Error::Unsupported("no compatible DMA mask"));
        };

        let mut command = cfg.read_u16(offset::COMMAND);
        command |= command_bits::MEM_SPACE | command_bits::BUS_MASTER;
        command &= !command_bits::INTX_DISABLE;
        cfg.write_u16(offset::COMMAND, command);

        Ok(Self {
            cfg,
            bar2,
            bar4,
            pcie_cap_offset,
            msi_cap_offset,
            dma_mask_bits,
        })
    }

    pub fn bar2(&self) -> &(dyn MmioRegion + Send + Sync) {
        &*self.bar2
    }

    pub fn bar4(&self) -> Option<&(dyn MmioRegion + Send + Sync)> {
        self.bar4.as_deref()
    }

    pub fn bar2_arc(&self) -> Arc<dyn MmioRegion + Send + Sync> {
        self.bar2.clone()
    }

    pub fn bar4_arc(&self) -> Option<Arc<dyn MmioRegion + Send + Sync>> {
        self.bar4.clone()
    }

    pub fn dma_mask_bits(&self) -> u8 {
        self.dma_mask_bits
    }

    pub fn config(&self) -> &dyn ConfigSpace {
        &*self.cfg
    }

    /// Idempotent teardown: disables the device and drops the region
    /// handles. Safe to call after a partially-failed `open`.
    pub fn close(&self) {
        let mut command = self.cfg.read_u16(offset::COMMAND);
        command &= !(command_bits::MEM_SPACE | command_bits::BUS_MASTER);
        self.cfg.write_u16(offset::COMMAND, command);
    }

    /// Reads vendor/device id and compares against the expected constants.
    pub fn device_id_valid(&self) -> bool {
        self.cfg.read_u16(offset::VENDOR_ID) == VENDOR_ID_INTEL
            && self.cfg.read_u16(offset::DEVICE_ID) == DEVICE_ID_MYRIAD_X
    }

    /// Toggles MSI-enable via the MSI capability's message-control word, if
    /// present.
    pub fn msi_enable(&self, on: bool) -> CanFail<()> {
        let cap = self
            .msi_cap_offset
            .ok_or(Error::Unsupported("no MSI capability"))?;
        let ctl_offset = cap + 2;
        let mut ctl = self.cfg.read_u16(ctl_offset);
        if on {
            ctl |= MSI_ENABLE_BIT;
        } else {
            ctl &= !MSI_ENABLE_BIT;
        }
        self.cfg.write_u16(ctl_offset, ctl);
        Ok(())
    }

    /// Snapshots the standard header and the seven PCIe control words.
    pub fn save_context(&self) -> SavedContext {
        let mut header = [0u32; HEADER_WORDS];
        for (i, word) in header.iter_mut().enumerate() {
            *word = self.cfg.read_u32((i * 4) as u32);
        }

        let mut pcie_ctl = [0u16; 7];
        for (i, off) in pcie_cap_offset::ALL.iter().enumerate() {
            pcie_ctl[i] = self.cfg.read_u16(self.pcie_cap_offset + off);
        }

        SavedContext { header, pcie_ctl }
    }

    /// Disables the device and masks INTx, leaving it unable to interfere
    /// with the bus for the duration of a reset.
    pub fn quiesce_for_reset(&self) {
        let mut command = self.cfg.read_u16(offset::COMMAND);
        command &= !(command_bits::MEM_SPACE | command_bits::BUS_MASTER);
        command |= command_bits::INTX_DISABLE;
        self.cfg.write_u16(offset::COMMAND, command);
    }

    /// Restores a previously saved context. Order matters (§4.2): PCIe
    /// control words first, then header words 4.., then header words 0..3
    /// last, so the command register (word 1) is written only once
    /// everything else is back in place.
    pub fn restore_context(&self, ctx: &SavedContext) {
        for (i, off) in pcie_cap_offset::ALL.iter().enumerate() {
            self.cfg.write_u16(self.pcie_cap_offset + off, ctx.pcie_ctl[i]);
        }

        for i in 4..HEADER_WORDS {
            self.cfg.write_u32((i * 4) as u32, ctx.header[i]);
        }

        for i in 0..4 {
            self.cfg.write_u32((i * 4) as u32, ctx.header[i]);
        }
    }

    pub fn pcie_cap_offset(&self) -> u32 {
        self.pcie_cap_offset
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use backend::SimConfigSpace;

    fn session() -> (PciSession, Arc<SimConfigSpace>) {
        let cfg = Arc::new(SimConfigSpace::new_myriad_x());
        let bar2: Arc<dyn MmioRegion + Send + Sync> = Arc::new(crate::mmio::SimRegion::new(0x1000));
        let session = PciSession::open(cfg.clone(), bar2, None).unwrap();
        (session, cfg)
    }

    #[test]
    fn open_enables_mem_and_bus_master() {
        let (session, cfg) = session();
        let command = cfg.read_u16(offset::COMMAND);
        assert_ne!(command & command_bits::MEM_SPACE, 0);
        assert_ne!(command & command_bits::BUS_MASTER, 0);
        let _ = session;
    }

    #[test]
    fn device_id_valid_matches_constants() {
        let (session, _cfg) = session();
        assert!(session.device_id_valid());
    }

    #[test]
    fn save_restore_roundtrips_bit_identical() {
        let (session, cfg) = session();
        let before = session.save_context();

        cfg.write_u16(offset::COMMAND, 0xBEEF);
        cfg.write_u16(session.pcie_cap_offset() + pcie_cap_offset::LNKCTL, 0xABCD);

        session.restore_context(&before);
        let after = session.save_context();
        assert_eq!(before.header, after.header);
        assert_eq!(before.pcie_ctl, after.pcie_ctl);
    }

    #[test]
    fn close_then_reopen_is_idempotent_to_other_devices() {
        let (session, cfg) = session();
        session.close();
        session.close();
        let command = cfg.read_u16(offset::COMMAND);
        assert_eq!(command & command_bits::BUS_MASTER, 0);
    }
}
