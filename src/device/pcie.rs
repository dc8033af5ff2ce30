//! PCI-level abstractions: bus addresses, the peer device trait and
//! mapped register windows.

use std::fmt;

use tracing::info;

use crate::error::{DriverError, DriverResult, PciError};

/// Bit positions of the packed bus-device-function identifier
const PCI_SHIFT_BUS: u32 = 12;
const PCI_SHIFT_DEV: u32 = 4;

/// Topological position of a device on the PCI bus
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PciAddress {
    pub bus: u8,
    pub device: u8,
    pub function: u8,
}

impl PciAddress {
    pub fn new(bus: u8, device: u8, function: u8) -> Self {
        Self {
            bus,
            device,
            function,
        }
    }

    /// Packed (bus, device, function) identifier, printed as 5 hex digits
    pub fn bdf(&self) -> u32 {
        (u32::from(self.bus) << PCI_SHIFT_BUS)
            | (u32::from(self.device) << PCI_SHIFT_DEV)
            | u32::from(self.function)
    }
}

impl fmt::Display for PciAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02x}:{:02x}.{:02x}", self.bus, self.device, self.function)
    }
}

/// A register window mapped into process-addressable memory.
///
/// Offsets are in bytes and must be 4-byte aligned; accesses are 32-bit
/// wide, matching the hardware register width.
pub trait MappedRegion: Send + Sync {
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn read32(&self, offset: usize) -> u32;

    fn write32(&self, offset: usize, value: u32);
}

/// The peer identity: one physical bus-attached device.
///
/// Implementations wrap whatever bus access mechanism is in use (VFIO,
/// sysfs, a simulator). The driver compares peers by `Arc` identity and
/// never copies them.
pub trait PciDevice: Send + Sync {
    fn address(&self) -> PciAddress;

    fn vendor_id(&self) -> u16;

    fn device_id(&self) -> u16;

    /// Reserve exclusive access to the device's memory regions
    fn request_regions(&self, owner: &str) -> Result<(), PciError>;

    fn release_regions(&self);

    /// Activate the device at the bus level
    fn enable(&self) -> Result<(), PciError>;

    fn disable(&self);

    /// Bus-level performance hint; best effort, never fails
    fn enable_relaxed_ordering(&self);

    fn set_bus_master(&self);

    /// Commit to a DMA addressing width; returns false if unsupported
    fn set_dma_mask(&self, bits: u32) -> bool;

    /// Addressing width used for descriptor (consistent) allocations
    fn set_consistent_dma_mask(&self, bits: u32) -> bool;

    /// Byte length of a BAR region, 0 if the BAR is not implemented
    fn region_len(&self, bar: usize) -> usize;

    /// Map a BAR region; `None` when the mapping is rejected
    fn map_region(&self, bar: usize, len: usize) -> Option<Box<dyn MappedRegion>>;
}

/// Select and commit a DMA addressing width for the device.
///
/// Prefers 64-bit addressing with 32-bit descriptors, falls back to
/// 32-bit for everything, fails if neither can be set.
pub(crate) fn set_dma_masks(pdev: &dyn PciDevice) -> DriverResult<u32> {
    if pdev.set_dma_mask(64) {
        pdev.set_consistent_dma_mask(32);
        Ok(64)
    } else if pdev.set_dma_mask(32) {
        pdev.set_consistent_dma_mask(32);
        info!(pdev = %pdev.address(), "Using a 32-bit DMA mask");
        Ok(32)
    } else {
        info!(pdev = %pdev.address(), "No suitable DMA possible");
        Err(DriverError::DmaMaskUnsupported)
    }
}

#[cfg(test)]
pub(crate) mod fake {
    //! In-memory PCI device used across the driver's unit tests.

    use std::sync::{Arc, Mutex};

    use super::*;
    use crate::device::bars;

    /// Word-backed register window shared between the fake device and
    /// the regions it hands out, so tests can preload and inspect it.
    #[derive(Clone)]
    pub(crate) struct FakeBar {
        words: Arc<Mutex<Vec<u32>>>,
    }

    impl FakeBar {
        pub(crate) fn new(len_bytes: usize) -> Self {
            Self {
                words: Arc::new(Mutex::new(vec![0u32; len_bytes / 4])),
            }
        }

        pub(crate) fn poke(&self, offset: usize, value: u32) {
            self.words.lock().unwrap()[offset / 4] = value;
        }

        pub(crate) fn peek(&self, offset: usize) -> u32 {
            self.words.lock().unwrap()[offset / 4]
        }

        fn len(&self) -> usize {
            self.words.lock().unwrap().len() * 4
        }
    }

    struct FakeRegion {
        bar: FakeBar,
        len: usize,
    }

    impl MappedRegion for FakeRegion {
        fn len(&self) -> usize {
            self.len
        }

        fn read32(&self, offset: usize) -> u32 {
            self.bar.peek(offset)
        }

        fn write32(&self, offset: usize, value: u32) {
            self.bar.poke(offset, value);
        }
    }

    #[derive(Default)]
    pub(crate) struct FakeState {
        pub enabled: bool,
        pub region_owner: Option<String>,
        pub bus_master: bool,
        pub relaxed_ordering: bool,
        pub dma_mask: Option<u32>,
        pub consistent_mask: Option<u32>,
        pub map_count: usize,
    }

    pub(crate) struct FakePci {
        addr: PciAddress,
        vendor_id: u16,
        device_id: u16,
        bars: [Option<FakeBar>; 6],
        fail_map: [bool; 6],
        fail_enable: bool,
        fail_regions: bool,
        dma_widths: Vec<u32>,
        pub(crate) state: Mutex<FakeState>,
    }

    impl FakePci {
        /// A well-behaved non-STM device with a valid config BAR signature.
        pub(crate) fn new(bus: u8, device: u8, function: u8) -> Self {
            let config = FakeBar::new(0x1000);
            config.poke(0, bars::DMA_FAMILY_SIGNATURE);
            let mut bar_set: [Option<FakeBar>; 6] = Default::default();
            bar_set[bars::CONFIG_BAR] = Some(config);
            Self {
                addr: PciAddress::new(bus, device, function),
                vendor_id: 0x10ee,
                device_id: 0x9034,
                bars: bar_set,
                fail_map: [false; 6],
                fail_enable: false,
                fail_regions: false,
                dma_widths: vec![64, 32],
                state: Mutex::new(FakeState::default()),
            }
        }

        /// An STM-capable device with a valid revision word preloaded.
        pub(crate) fn new_stm(bus: u8, device: u8, function: u8) -> Self {
            let mut pci = Self::new(bus, device, function);
            pci.device_id = bars::STM_ENABLED_DEVICE;
            let stm = FakeBar::new(0x1000);
            stm.poke(
                bars::STM_REG_BASE + bars::STM_REG_REV,
                u32::from_be_bytes([b'S', b'T', b'M', bars::STM_SUPPORTED_REV]),
            );
            pci.bars[bars::STM_BAR] = Some(stm);
            pci
        }

        pub(crate) fn with_identity(self, id: u32) -> Self {
            self.bar(bars::CONFIG_BAR).poke(0, id);
            self
        }

        pub(crate) fn with_stm_rev(self, rev: u32) -> Self {
            self.bar(bars::STM_BAR)
                .poke(bars::STM_REG_BASE + bars::STM_REG_REV, rev);
            self
        }

        pub(crate) fn failing_map(mut self, bar: usize) -> Self {
            self.fail_map[bar] = true;
            self
        }

        pub(crate) fn failing_enable(mut self) -> Self {
            self.fail_enable = true;
            self
        }

        pub(crate) fn failing_regions(mut self) -> Self {
            self.fail_regions = true;
            self
        }

        pub(crate) fn with_dma_widths(mut self, widths: &[u32]) -> Self {
            self.dma_widths = widths.to_vec();
            self
        }

        pub(crate) fn bar(&self, bar: usize) -> FakeBar {
            self.bars[bar].clone().expect("fake BAR not present")
        }
    }

    impl PciDevice for FakePci {
        fn address(&self) -> PciAddress {
            self.addr
        }

        fn vendor_id(&self) -> u16 {
            self.vendor_id
        }

        fn device_id(&self) -> u16 {
            self.device_id
        }

        fn request_regions(&self, owner: &str) -> Result<(), PciError> {
            if self.fail_regions {
                return Err(PciError::ResourcesBusy);
            }
            self.state.lock().unwrap().region_owner = Some(owner.to_string());
            Ok(())
        }

        fn release_regions(&self) {
            self.state.lock().unwrap().region_owner = None;
        }

        fn enable(&self) -> Result<(), PciError> {
            if self.fail_enable {
                return Err(PciError::EnableFailed);
            }
            self.state.lock().unwrap().enabled = true;
            Ok(())
        }

        fn disable(&self) {
            self.state.lock().unwrap().enabled = false;
        }

        fn enable_relaxed_ordering(&self) {
            self.state.lock().unwrap().relaxed_ordering = true;
        }

        fn set_bus_master(&self) {
            self.state.lock().unwrap().bus_master = true;
        }

        fn set_dma_mask(&self, bits: u32) -> bool {
            if self.dma_widths.contains(&bits) {
                self.state.lock().unwrap().dma_mask = Some(bits);
                true
            } else {
                false
            }
        }

        fn set_consistent_dma_mask(&self, bits: u32) -> bool {
            if self.dma_widths.contains(&bits) {
                self.state.lock().unwrap().consistent_mask = Some(bits);
                true
            } else {
                false
            }
        }

        fn region_len(&self, bar: usize) -> usize {
            self.bars[bar].as_ref().map_or(0, FakeBar::len)
        }

        fn map_region(&self, bar: usize, len: usize) -> Option<Box<dyn MappedRegion>> {
            if self.fail_map[bar] {
                return None;
            }
            let backing = self.bars[bar].clone()?;
            self.state.lock().unwrap().map_count += 1;
            Some(Box::new(FakeRegion { bar: backing, len }))
        }
    }
}
