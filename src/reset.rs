//! C4 — reset engine.
//!
//! The device has no standard PCI Function-Level Reset; it is reset by
//! writing a vendor-specific magic value to a DLLP register in config
//! space (§4.4). The upstream-switch link-retrain step is an open question
//! (§9): it is modeled as an optional platform hook (`ResetPolicy::retrain`)
//! defaulting to "not invoked" rather than guessed at.

use std::sync::Arc;
use std::time::Duration;

use log::{info, warn};

use crate::error::{CanFail, Error};
use crate::pci::backend::ConfigSpace;
use crate::pci::{offset, PciSession, LNKCTL_RETRAIN_LINK, LNKSTA_LINK_TRAINING, RESET_MAGIC};

/// Platform hook for the upstream-switch link retrain named in §9. Default
/// is `None` ("not invoked") until a specific platform is shown to need it.
#[derive(Clone)]
pub struct RetrainConfig {
    /// Config-space handles for the upstream switch ports to retrain.
    pub ports: Vec<Arc<dyn ConfigSpace>>,
    /// PCIe capability offset within each port's config space.
    pub pcie_cap_offset: u32,
    pub retries: u32,
    pub retry_delay: Duration,
}

impl Default for RetrainConfig {
    fn default() -> Self {
        Self {
            ports: Vec::new(),
            pcie_cap_offset: 0x40,
            retries: 100,
            retry_delay: Duration::from_millis(10),
        }
    }
}

#[derive(Clone, Default)]
pub struct ResetPolicy {
    pub retrain: Option<RetrainConfig>,
}

/// Post-reset grace window before the device must be back in a readable
/// state (§4.4 step 5).
pub const RESET_GRACE: Duration = Duration::from_millis(1000);
/// Time allowed for any in-flight transaction to drain before the magic
/// write (§4.4 step 1).
const QUIESCE_DRAIN: Duration = Duration::from_millis(1);

/// Runs the full reset sequence (§4.4). `is_boot_mode` is polled at the end
/// of the grace window to confirm the device came back in `Boot` mode;
/// callers pass a closure rather than an `OperatingMode` dependency so this
/// module stays independent of the bootloader state machine.
pub fn execute(
    session: &PciSession,
    policy: &ResetPolicy,
    is_boot_mode: impl Fn() -> bool,
) -> CanFail<()> {
    let ctx = session.save_context();
    session.quiesce_for_reset();
    std::thread::sleep(QUIESCE_DRAIN);

    info!("reset engine: writing magic {:#x} to config offset {:#x}", RESET_MAGIC, offset::RESET_TRIGGER);
    session.config().write_u32(offset::RESET_TRIGGER, RESET_MAGIC);

    if let Some(retrain) = &policy.retrain {
        retrain_upstream_ports(retrain);
    }

    if !session.device_id_valid() {
        return Err(Error::DeviceGone);
    }

    session.restore_context(&ctx);
    session.msi_enable(true)?;

    std::thread::sleep(RESET_GRACE);

    if !is_boot_mode() {
        return Err(Error::ResetIncomplete);
    }

    Ok(())
}

fn retrain_upstream_ports(cfg: &RetrainConfig) {
    for port in &cfg.ports {
        let lnkctl_off = cfg.pcie_cap_offset + crate::pci::pcie_cap_offset::LNKCTL;
        let lnksta_off = lnkctl_off + 2;

        let mut lnkctl = port.read_u16(lnkctl_off);
        lnkctl |= LNKCTL_RETRAIN_LINK;
        port.write_u16(lnkctl_off, lnkctl);

        let mut trained = false;
        for _ in 0..cfg.retries {
            std::thread::sleep(cfg.retry_delay);
            let lnksta = port.read_u16(lnksta_off);
            if lnksta & LNKSTA_LINK_TRAINING == 0 {
                trained = true;
                break;
            }
        }

        if !trained {
            warn!("reset engine: upstream port link retrain did not complete within budget");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mmio::SimRegion;
    use crate::pci::backend::SimConfigSpace;
    use std::sync::Arc;

    #[test]
    fn reset_fails_with_device_gone_when_id_mismatches() {
        let cfg = Arc::new(SimConfigSpace::new_myriad_x());
        let bar2: Arc<dyn crate::mmio::MmioRegion + Send + Sync> = Arc::new(SimRegion::new(0x100));
        let session = PciSession::open(cfg.clone(), bar2, None).unwrap();

        cfg.write_u16(crate::pci::offset::DEVICE_ID, 0xFFFF);

        let result = execute(&session, &ResetPolicy::default(), || true);
        assert!(matches!(result, Err(Error::DeviceGone)));
    }

    #[test]
    fn reset_fails_with_reset_incomplete_when_not_boot() {
        let cfg = Arc::new(SimConfigSpace::new_myriad_x());
        let bar2: Arc<dyn crate::mmio::MmioRegion + Send + Sync> = Arc::new(SimRegion::new(0x100));
        let session = PciSession::open(cfg, bar2, None).unwrap();

        let result = execute(&session, &ResetPolicy::default(), || false);
        assert!(matches!(result, Err(Error::ResetIncomplete)));
    }

    #[test]
    fn reset_writes_magic_and_succeeds_when_boot_confirmed() {
        let cfg = Arc::new(SimConfigSpace::new_myriad_x());
        let bar2: Arc<dyn crate::mmio::MmioRegion + Send + Sync> = Arc::new(SimRegion::new(0x100));
        let session = PciSession::open(cfg.clone(), bar2, None).unwrap();

        let result = execute(&session, &ResetPolicy::default(), || true);
        assert!(result.is_ok());
        assert_eq!(cfg.read_u32(offset::RESET_TRIGGER), RESET_MAGIC);
    }
}
