//! Backend abstraction (§10.1): the trait the rest of C2 is written against,
//! plus an in-memory simulation used by every test in this crate, plus a
//! real sysfs-backed implementation sketch gated behind the `real` feature.

use std::sync::Mutex;

/// PCI capability ids this runtime looks up via [`ConfigSpace::find_capability`].
pub const CAP_ID_MSI: u8 = 0x05;
pub const CAP_ID_PCI_EXPRESS: u8 = 0x10;

/// Config-space access, independent of whether it is backed by a real
/// `/sys/bus/pci/devices/<bdf>/config` file or an in-memory byte buffer.
pub trait ConfigSpace: Send + Sync {
    fn read_u16(&self, offset: u32) -> u16;
    fn read_u32(&self, offset: u32) -> u32;
    fn write_u16(&self, offset: u32, value: u16);
    fn write_u32(&self, offset: u32, value: u32);

    /// Walks the capability linked list (starting at the standard
    /// `CAPABILITIES_POINTER` at offset 0x34) looking for `cap_id`. Returns
    /// the byte offset of the capability structure, or `None`.
    fn find_capability(&self, cap_id: u8) -> Option<u32>;

    /// Reports whether the device accepts a DMA mask of the given width (32
    /// or 64). The real backend queries the platform IOMMU/DMA API; the
    /// simulation backend is configured up front.
    fn supports_dma_mask(&self, bits: u8) -> bool;
}

/// In-memory [`ConfigSpace`] used by tests. Holds a byte buffer plus a
/// pre-populated capability list so [`ConfigSpace::find_capability`] behaves
/// like a real device's.
pub struct SimConfigSpace {
    buf: Mutex<Vec<u8>>,
    capabilities: Vec<(u8, u32)>,
    dma_masks: Vec<u8>,
}

impl SimConfigSpace {
    /// Builds a simulated config space identifying as the Myriad-X device,
    /// with a PCIe capability at 0x40 and an MSI capability at 0x50, and
    /// supporting both 32- and 64-bit DMA masks.
    pub fn new_myriad_x() -> Self {
        let mut buf = vec![0u8; 0x1000];
        buf[0..2].copy_from_slice(&super::VENDOR_ID_INTEL.to_le_bytes());
        buf[2..4].copy_from_slice(&super::DEVICE_ID_MYRIAD_X.to_le_bytes());

        Self {
            buf: Mutex::new(buf),
            capabilities: vec![(CAP_ID_PCI_EXPRESS, 0x40), (CAP_ID_MSI, 0x50)],
            dma_masks: vec![32, 64],
        }
    }

    pub fn with_dma_masks(mut self, masks: Vec<u8>) -> Self {
        self.dma_masks = masks;
        self
    }
}

impl ConfigSpace for SimConfigSpace {
    fn read_u16(&self, offset: u32) -> u16 {
        let buf = self.buf.lock().unwrap();
        let o = offset as usize;
        u16::from_le_bytes(buf[o..o + 2].try_into().unwrap())
    }

    fn read_u32(&self, offset: u32) -> u32 {
        let buf = self.buf.lock().unwrap();
        let o = offset as usize;
        u32::from_le_bytes(buf[o..o + 4].try_into().unwrap())
    }

    fn write_u16(&self, offset: u32, value: u16) {
        let mut buf = self.buf.lock().unwrap();
        let o = offset as usize;
        buf[o..o + 2].copy_from_slice(&value.to_le_bytes());
    }

    fn write_u32(&self, offset: u32, value: u32) {
        let mut buf = self.buf.lock().unwrap();
        let o = offset as usize;
        buf[o..o + 4].copy_from_slice(&value.to_le_bytes());
    }

    fn find_capability(&self, cap_id: u8) -> Option<u32> {
        self.capabilities
            .iter()
            .find(|(id, _)| *id == cap_id)
            .map(|(_, off)| *off)
    }

    fn supports_dma_mask(&self, bits: u8) -> bool {
        self.dma_masks.contains(&bits)
    }
}

#[cfg(feature = "real")]
pub mod real {
    //! Real PCI backend: maps a BAR via `mmap` over its sysfs resource file
    //! and reads/writes config space via the sysfs `config` file. Kept
    //! deliberately small — this is the seam an embedder replaces with a
    //! VFIO-based implementation if finer-grained control (interrupts,
    //! IOMMU groups) is required.

    use super::ConfigSpace;
    use crate::error::{CanFail, Error};
    use crate::mmio::MmioRegion;
    use std::fs::{File, OpenOptions};
    use std::io::{Read, Seek, SeekFrom, Write};
    use std::os::unix::io::AsRawFd;
    use std::sync::Mutex;

    pub struct RealConfigSpace {
        file: Mutex<File>,
    }

    impl RealConfigSpace {
        pub fn open(bdf: &str) -> CanFail<Self> {
            let path = format!("/sys/bus/pci/devices/{bdf}/config");
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .open(&path)
                .map_err(|_| Error::MappingFailed("could not open PCI config space"))?;
            Ok(Self {
                file: Mutex::new(file),
            })
        }
    }

    impl ConfigSpace for RealConfigSpace {
        fn read_u16(&self, offset: u32) -> u16 {
            let mut buf = [0u8; 2];
            let mut file = self.file.lock().unwrap();
            file.seek(SeekFrom::Start(offset as u64)).unwrap();
            file.read_exact(&mut buf).unwrap();
            u16::from_le_bytes(buf)
        }

        fn read_u32(&self, offset: u32) -> u32 {
            let mut buf = [0u8; 4];
            let mut file = self.file.lock().unwrap();
            file.seek(SeekFrom::Start(offset as u64)).unwrap();
            file.read_exact(&mut buf).unwrap();
            u32::from_le_bytes(buf)
        }

        fn write_u16(&self, offset: u32, value: u16) {
            let mut file = self.file.lock().unwrap();
            file.seek(SeekFrom::Start(offset as u64)).unwrap();
            file.write_all(&value.to_le_bytes()).unwrap();
        }

        fn write_u32(&self, offset: u32, value: u32) {
            let mut file = self.file.lock().unwrap();
            file.seek(SeekFrom::Start(offset as u64)).unwrap();
            file.write_all(&value.to_le_bytes()).unwrap();
        }

        fn find_capability(&self, cap_id: u8) -> Option<u32> {
            let mut ptr = self.read_u16(0x34) as u32 & 0xFC;
            let mut guard = 0;
            while ptr != 0 && guard < 64 {
                let header = self.read_u16(ptr);
                if (header & 0xFF) as u8 == cap_id {
                    return Some(ptr);
                }
                ptr = ((header >> 8) & 0xFC) as u32;
                guard += 1;
            }
            None
        }

        fn supports_dma_mask(&self, _bits: u8) -> bool {
            // The real backend defers DMA-mask negotiation to the host
            // platform's IOMMU setup; by the time a session is opened the
            // mask has already been fixed by whoever bound the device.
            true
        }
    }

    /// Memory-mapped BAR backed by the device's sysfs `resourceN` file.
    pub struct RealMmioRegion {
        base: *mut u8,
        len: usize,
    }

    unsafe impl Send for RealMmioRegion {}
    unsafe impl Sync for RealMmioRegion {}

    impl RealMmioRegion {
        pub fn map(bdf: &str, bar: u8, len: usize) -> CanFail<Self> {
            let path = format!("/sys/bus/pci/devices/{bdf}/resource{bar}");
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .open(&path)
                .map_err(|_| Error::MappingFailed("could not open BAR resource file"))?;

            let base = unsafe {
                libc::mmap(
                    std::ptr::null_mut(),
                    len,
                    libc::PROT_READ | libc::PROT_WRITE,
                    libc::MAP_SHARED,
                    file.as_raw_fd(),
                    0,
                )
            };

            if base == libc::MAP_FAILED {
                return Err(Error::MappingFailed("mmap of BAR resource failed"));
            }

            Ok(Self {
                base: base as *mut u8,
                len,
            })
        }
    }

    impl Drop for RealMmioRegion {
        fn drop(&mut self) {
            unsafe {
                libc::munmap(self.base as *mut libc::c_void, self.len);
            }
        }
    }

    impl MmioRegion for RealMmioRegion {
        fn len(&self) -> usize {
            self.len
        }

        fn read_u8(&self, offset: usize) -> u8 {
            unsafe { std::ptr::read_volatile(self.base.add(offset)) }
        }

        fn read_u16(&self, offset: usize) -> u16 {
            unsafe { std::ptr::read_volatile(self.base.add(offset) as *const u16) }
        }

        fn read_u32(&self, offset: usize) -> u32 {
            unsafe { std::ptr::read_volatile(self.base.add(offset) as *const u32) }
        }

        fn write_u8(&self, offset: usize, value: u8) {
            unsafe { std::ptr::write_volatile(self.base.add(offset), value) }
        }

        fn write_u16(&self, offset: usize, value: u16) {
            unsafe { std::ptr::write_volatile(self.base.add(offset) as *mut u16, value) }
        }

        fn write_u32(&self, offset: usize, value: u32) {
            unsafe { std::ptr::write_volatile(self.base.add(offset) as *mut u32, value) }
        }

        fn read_buf(&self, offset: usize, dst: &mut [u8]) {
            for (i, b) in dst.iter_mut().enumerate() {
                *b = self.read_u8(offset + i);
            }
        }

        fn write_buf(&self, offset: usize, src: &[u8]) {
            for (i, b) in src.iter().enumerate() {
                self.write_u8(offset + i, *b);
            }
        }
    }
}
