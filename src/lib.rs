//! Host-side PCIe runtime for the Myriad-X bootloader and serial/link cores.
//!
//! Layered bottom-up: [`mmio`] and [`pci`] are the device-access primitives;
//! [`events`], [`dma`], and [`registry`] are the shared runtime services
//! every core builds on; [`reset`] implements the non-standard device reset;
//! [`bl`] and [`lk`] are the two cores named in the component table, and
//! [`vpu_cmdq`] is the command-queue pattern sketch named alongside them.

pub mod dma;
pub mod error;
pub mod events;
pub mod mmio;
pub mod pci;
pub mod registry;
pub mod reset;

pub mod bl;
pub mod lk;
pub mod vpu_cmdq;

pub use error::{CanFail, Error};
