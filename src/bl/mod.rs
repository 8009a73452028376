//! C5 — bootloader state machine.
//!
//! Collapses what used to be two near-duplicate bootloader-core variants
//! into one module: mode discovery, the DMA read-engine reapply sequence,
//! the reset-on-not-boot probe branch, and the first-stage
//! transfer/completion-poll protocol.

pub mod timing;

use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{info, warn};

use crate::dma::{DmaDirection, DmaMapper};
use crate::error::{CanFail, Error};
use crate::events::{BlEvent, EventDispatcher};
use crate::mmio::MmioRegion;
use crate::pci::{offset, PciSession};
use crate::registry::{Registry, UnitId};
use crate::reset::{self, ResetPolicy};

/// BL MMIO register offsets (§6).
pub mod reg {
    pub const MAIN_MAGIC: usize = 0x00;
    pub const MF_READY: usize = 0x10;
    pub const MF_LENGTH: usize = 0x14;
    pub const MF_START: usize = 0x20;
    pub const INT_ENABLE: usize = 0x28;
    pub const INT_MASK: usize = 0x2C;
    pub const INT_IDENTITY: usize = 0x30;
}

const MAGIC_LEN: usize = 16;

fn magic(bytes: &[u8]) -> [u8; MAGIC_LEN] {
    let mut buf = [0u8; MAGIC_LEN];
    buf[..bytes.len()].copy_from_slice(bytes);
    buf
}

/// Operating mode, determined by reading [`reg::MAIN_MAGIC`] and matching
/// against three fixed literals (§3). Never cached: the device transitions
/// autonomously.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperatingMode {
    Boot,
    Loader,
    Application,
    Unknown,
}

impl OperatingMode {
    pub fn read(region: &dyn MmioRegion) -> Self {
        let mut buf = [0u8; MAGIC_LEN];
        region.read_buf(reg::MAIN_MAGIC, &mut buf);

        if buf == magic(b"VPUBOOT") {
            OperatingMode::Boot
        } else if buf == magic(b"VPULOADER") {
            OperatingMode::Loader
        } else if buf == magic(b"VPUMAIN") {
            OperatingMode::Application
        } else {
            OperatingMode::Unknown
        }
    }
}

/// `MF_READY` handshake states (§4.5).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MfReady {
    Ready,
    Pending,
    Starting,
    DmaError,
    Invalid,
}

impl MfReady {
    pub fn read(region: &dyn MmioRegion) -> Self {
        Self::from(region.read_u32(reg::MF_READY))
    }
}

impl From<u32> for MfReady {
    fn from(value: u32) -> Self {
        match value {
            0x0000_0000 => MfReady::Ready,
            0xFFFF_FFFF => MfReady::Pending,
            0x5555_5555 => MfReady::Starting,
            0xDEAD_AAAA => MfReady::DmaError,
            0xDEAD_FFFF => MfReady::Invalid,
            other => {
                warn!("bl: unrecognized MF_READY value {:#x}, treating as Invalid", other);
                MfReady::Invalid
            }
        }
    }
}

/// A probed bootloader-core device handle. Owns its PCI session, event
/// dispatcher, and unit slot; created by [`probe`], destroyed on drop.
pub struct Device {
    session: PciSession,
    dispatcher: Option<EventDispatcher<BlEvent>>,
    unit: UnitId,
    dma: Arc<dyn DmaMapper>,
}

impl Device {
    pub fn mode(&self) -> OperatingMode {
        OperatingMode::read(self.session.bar2())
    }

    pub fn session(&self) -> &PciSession {
        &self.session
    }

    /// Runs the §4.5.1 DMA read-engine reapply sequence.
    pub fn reapply_dma_read_engine(&self) {
        let cfg = self.session.config();
        cfg.write_u32(offset::DMA_VIEWPORT_SELECT, dma_reapply::VIEWPORT_READ_CHANNEL0);
        cfg.write_u32(offset::DMA_CHAN_CTRL1, dma_reapply::LOCAL_IRQ_ON_COMPLETION);
        cfg.write_u32(offset::DMA_READ_ENGINE_ENABLE, dma_reapply::READ_ENGINE_ENABLE);
        info!("bl: reapplied DMA read-engine settings");
    }

    /// Transfers a first-stage image to the device and waits for it to
    /// leave `Boot` mode (§4.5 transfer flow).
    pub fn first_stage_transfer(&self, image: &[u8]) -> CanFail<()> {
        if self.mode() != OperatingMode::Boot {
            return Err(Error::PermissionDenied("first_stage_transfer requires Boot mode"));
        }
        if MfReady::read(self.session.bar2()) != MfReady::Ready {
            return Err(Error::IoError("MF_READY is not Ready"));
        }

        let mapping = self.dma.map(image.as_ptr(), image.len(), DmaDirection::ToDevice)?;

        let region = self.session.bar2();
        region.write_u64(reg::MF_START, mapping.addr);
        region.write_u32(reg::MF_LENGTH, mapping.len as u32);
        region.write_u32(reg::MF_READY, 0xFFFF_FFFF);

        let result = self.poll_completion();

        self.dma.unmap(mapping);
        result
    }

    fn poll_completion(&self) -> CanFail<()> {
        let start = Instant::now();
        let region = self.session.bar2();

        loop {
            let state = MfReady::read(region);
            let elapsed = start.elapsed();

            match state {
                MfReady::Pending => {
                    if elapsed > timing::PENDING_BUDGET {
                        return Err(Error::TimedOut(elapsed));
                    }
                }
                MfReady::Starting => {
                    if elapsed > timing::PENDING_BUDGET + timing::STARTING_BUDGET {
                        return Err(Error::TimedOut(elapsed));
                    }
                }
                MfReady::DmaError | MfReady::Invalid => {
                    return Err(Error::ProtocolError("device reported MF_READY error state"));
                }
                MfReady::Ready => {
                    // Only possible before the device has observed the
                    // write; keep polling until it progresses or a mode
                    // change is observed below.
                }
            }

            if OperatingMode::read(region) != OperatingMode::Boot {
                return Ok(());
            }

            std::thread::sleep(Duration::from_millis(1));
        }
    }
}

/// DMA read-engine reapply constants (§4.5.1).
mod dma_reapply {
    pub const VIEWPORT_READ_CHANNEL0: u32 = 0x0000_0000;
    pub const LOCAL_IRQ_ON_COMPLETION: u32 = 0x0000_0001;
    pub const READ_ENGINE_ENABLE: u32 = 0x0000_0001;
}

/// Runs the §4.5 probe flow and returns an owned [`Device`] handle.
pub fn probe(
    session: PciSession,
    registry: &Registry,
    reset_policy: &ResetPolicy,
    dma: Arc<dyn DmaMapper>,
) -> CanFail<Device> {
    let mut dispatcher = Some(EventDispatcher::<BlEvent>::new(|event| {
        info!("bl: event dispatched: {:?}", event);
    }));

    let mode = OperatingMode::read(session.bar2());

    if mode == OperatingMode::Boot {
        let device = Device {
            session,
            dispatcher: dispatcher.take(),
            unit: registry.register()?,
            dma,
        };
        device.reapply_dma_read_engine();
        return Ok(device);
    }

    // Not in Boot mode: tear down events, reset, re-init events, re-check.
    if let Some(mut d) = dispatcher.take() {
        d.shutdown();
    }

    reset::execute(&session, reset_policy, || {
        OperatingMode::read(session.bar2()) == OperatingMode::Boot
    })?;

    let dispatcher = EventDispatcher::<BlEvent>::new(|event| {
        info!("bl: event dispatched: {:?}", event);
    });

    if OperatingMode::read(session.bar2()) != OperatingMode::Boot {
        return Err(Error::ResetIncomplete);
    }

    Ok(Device {
        session,
        dispatcher: Some(dispatcher),
        unit: registry.register()?,
        dma,
    })
}

impl Device {
    pub fn unit(&self) -> UnitId {
        self.unit
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        if let Some(mut dispatcher) = self.dispatcher.take() {
            dispatcher.shutdown();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dma::SimDmaMapper;
    use crate::mmio::SimRegion;
    use crate::pci::backend::SimConfigSpace;
    use std::sync::Arc;

    fn make_session(magic_bytes: &[u8]) -> (PciSession, Arc<SimRegion>) {
        let cfg = Arc::new(SimConfigSpace::new_myriad_x());
        let bar2 = Arc::new(SimRegion::new(0x1000));
        bar2.write_buf(reg::MAIN_MAGIC, &magic(magic_bytes));
        let session = PciSession::open(cfg, bar2.clone(), None).unwrap();
        (session, bar2)
    }

    #[test]
    fn mode_reads_match_fixed_literals() {
        let (_session, bar2) = make_session(b"VPUBOOT");
        assert_eq!(OperatingMode::read(&*bar2), OperatingMode::Boot);

        bar2.write_buf(reg::MAIN_MAGIC, &magic(b"VPULOADER"));
        assert_eq!(OperatingMode::read(&*bar2), OperatingMode::Loader);

        bar2.write_buf(reg::MAIN_MAGIC, &magic(b"VPUMAIN"));
        assert_eq!(OperatingMode::read(&*bar2), OperatingMode::Application);

        bar2.write_buf(reg::MAIN_MAGIC, &magic(b"garbage"));
        assert_eq!(OperatingMode::read(&*bar2), OperatingMode::Unknown);
    }

    #[test]
    fn cold_probe_in_boot_mode_reapplies_dma_settings() {
        let (session, _bar2) = make_session(b"VPUBOOT");
        let registry = Registry::default();
        let dma = Arc::new(SimDmaMapper::new());

        let device = probe(session, &registry, &ResetPolicy::default(), dma).unwrap();
        let cfg = device.session().config();
        assert_eq!(cfg.read_u32(offset::DMA_READ_ENGINE_ENABLE), dma_reapply::READ_ENGINE_ENABLE);
    }

    #[test]
    fn first_stage_transfer_happy_path() {
        let (session, bar2) = make_session(b"VPUBOOT");
        let registry = Registry::default();
        let dma = Arc::new(SimDmaMapper::new());
        let device = probe(session, &registry, &ResetPolicy::default(), dma.clone()).unwrap();

        // Simulate the device: once MF_READY goes Pending, flip the magic
        // to Application to signal the mode has left Boot.
        let bar2_clone = bar2.clone();
        std::thread::spawn(move || loop {
            if MfReady::read(&*bar2_clone) == MfReady::Pending {
                bar2_clone.write_buf(reg::MAIN_MAGIC, &magic(b"VPUMAIN"));
                break;
            }
            std::thread::sleep(Duration::from_millis(1));
        });

        let image = vec![0xABu8; 1024];
        let result = device.first_stage_transfer(&image);
        assert!(result.is_ok());
        assert_eq!(dma.outstanding_count(), 0);
    }

    #[test]
    fn first_stage_transfer_dma_error_unmaps_before_return() {
        let (session, bar2) = make_session(b"VPUBOOT");
        let registry = Registry::default();
        let dma = Arc::new(SimDmaMapper::new());
        let device = probe(session, &registry, &ResetPolicy::default(), dma.clone()).unwrap();

        let bar2_clone = bar2.clone();
        std::thread::spawn(move || loop {
            if MfReady::read(&*bar2_clone) == MfReady::Pending {
                bar2_clone.write_u32(reg::MF_READY, 0xDEAD_AAAA);
                break;
            }
            std::thread::sleep(Duration::from_millis(1));
        });

        let image = vec![0xABu8; 64];
        let result = device.first_stage_transfer(&image);
        assert!(matches!(result, Err(Error::ProtocolError(_))));
        assert_eq!(dma.outstanding_count(), 0);
    }

    #[test]
    fn transfer_outside_boot_mode_is_permission_denied() {
        let (session, bar2) = make_session(b"VPUBOOT");
        let registry = Registry::default();
        let dma = Arc::new(SimDmaMapper::new());
        let device = probe(session, &registry, &ResetPolicy::default(), dma).unwrap();

        bar2.write_buf(reg::MAIN_MAGIC, &magic(b"VPUMAIN"));

        let image = vec![0u8; 16];
        let result = device.first_stage_transfer(&image);
        assert!(matches!(result, Err(Error::PermissionDenied(_))));
    }
}
