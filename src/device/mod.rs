//! Device abstraction for the DMA accelerator driver

pub mod bars;
pub mod manager;
pub mod pcie;
pub mod registry;

pub use manager::DeviceManager;
pub use pcie::{MappedRegion, PciAddress, PciDevice};
pub use registry::DeviceRegistry;

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};

use bitflags::bitflags;
use num_derive::{FromPrimitive, ToPrimitive};
use num_traits::FromPrimitive;

use crate::engine::DeviceAttributes;

/// How queue configuration for a device was established
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, FromPrimitive, ToPrimitive)]
pub enum ConfigState {
    /// No configuration applied yet; stamped at registration
    Unconfigured = 0,

    /// Configured by the driver's initial defaults
    Driver = 1,

    /// Configured explicitly by the user
    User = 2,
}

impl ConfigState {
    /// Convert from a raw value, rejecting anything above the maximum
    /// defined tag.
    pub fn from_raw(value: u32) -> Option<Self> {
        Self::from_u32(value)
    }
}

/// Whether this driver instance manages a physical or a virtual function.
///
/// Selected once at `DeviceManager` construction; it decides signature
/// checking, attribute probing, SR-IOV handling and sibling grouping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FunctionMode {
    Physical,
    Virtual,
}

bitflags! {
    /// Runtime flags on an attached device
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct DeviceFlags: u32 {
        /// Data-plane operations must not proceed
        const OFFLINE = 1 << 0;
    }
}

/// Caller-supplied device configuration, snapshotted into the record at
/// attach and refreshed on explicit get/set calls.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceConfig {
    /// Maximum number of queue sets to configure
    pub qsets_max: u32,

    /// Maximum number of virtual functions to enable (physical function)
    pub vf_max: u32,

    /// Poll for completions instead of using interrupts
    pub poll_mode: bool,

    /// BAR carrying the DMA config registers; assigned during attach
    pub bar_num_config: Option<usize>,

    /// BAR exposed to user logic; assigned during attach when present
    pub bar_num_user: Option<usize>,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            qsets_max: 2048,
            vf_max: 0,
            poll_mode: false,
            bar_num_config: None,
            bar_num_user: None,
        }
    }
}

/// Opaque caller-held reference to an attached device record.
///
/// Registry-assigned slot plus a monotonically incrementing generation;
/// a handle never validates again once its record is removed, even if a
/// later record reuses the slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeviceHandle {
    slot: u32,
    generation: u32,
}

impl DeviceHandle {
    pub(crate) fn new(slot: u32, generation: u32) -> Self {
        Self { slot, generation }
    }
}

/// Hardware capabilities detected during attach
#[derive(Debug, Clone, Copy)]
pub(crate) struct Capabilities {
    pub stm_en: bool,
    pub stm_rev: u8,
    pub mm_mode_en: bool,
    pub st_mode_en: bool,
    pub mm_channel_max: u8,
    pub flr_present: bool,
}

impl Default for Capabilities {
    // Everything enabled until the attribute probe narrows it down
    fn default() -> Self {
        Self {
            stm_en: false,
            stm_rev: 0,
            mm_mode_en: true,
            st_mode_en: true,
            mm_channel_max: 1,
            flr_present: true,
        }
    }
}

/// Mapped register windows owned exclusively by the record
#[derive(Default)]
pub(crate) struct RegionSet {
    /// Primary DMA config window
    pub regs: Option<Box<dyn MappedRegion>>,

    /// Optional STM capability window
    pub stm_regs: Option<Box<dyn MappedRegion>>,
}

/// One attached accelerator device.
///
/// Created by the registry at insertion, reachable from it for exactly as
/// long as the device stays attached, and dropped after removal once the
/// last caller lets go of its `Arc`.
pub struct DeviceRecord {
    peer: Arc<dyn PciDevice>,
    handle: DeviceHandle,
    bdf: u32,
    ordinal: AtomicU32,
    name: OnceLock<String>,
    flags: AtomicU32,
    caps: Mutex<Capabilities>,
    regions: Mutex<RegionSet>,
    state: Mutex<RecordState>,
}

pub(crate) struct RecordState {
    pub config: DeviceConfig,
    pub cfg_state: ConfigState,
}

impl std::fmt::Debug for DeviceRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceRecord")
            .field("bdf", &self.bdf)
            .finish_non_exhaustive()
    }
}

impl DeviceRecord {
    pub(crate) fn new(
        peer: Arc<dyn PciDevice>,
        handle: DeviceHandle,
        bdf: u32,
        config: DeviceConfig,
    ) -> Self {
        Self {
            peer,
            handle,
            bdf,
            ordinal: AtomicU32::new(0),
            name: OnceLock::new(),
            flags: AtomicU32::new(DeviceFlags::empty().bits()),
            caps: Mutex::new(Capabilities::default()),
            regions: Mutex::new(RegionSet::default()),
            state: Mutex::new(RecordState {
                config,
                cfg_state: ConfigState::Unconfigured,
            }),
        }
    }

    pub fn peer(&self) -> &Arc<dyn PciDevice> {
        &self.peer
    }

    pub fn handle(&self) -> DeviceHandle {
        self.handle
    }

    /// Packed (bus, device, function) identifier, fixed at registration
    pub fn bdf(&self) -> u32 {
        self.bdf
    }

    /// 1-based rank among siblings on the same card; recomputed on every
    /// registry insertion
    pub fn ordinal(&self) -> u32 {
        self.ordinal.load(Ordering::Relaxed)
    }

    pub(crate) fn set_ordinal(&self, ordinal: u32) {
        self.ordinal.store(ordinal, Ordering::Relaxed);
    }

    /// Human-readable name, e.g. `dma01020-mod`; empty until attach
    /// finishes deriving it
    pub fn name(&self) -> &str {
        self.name.get().map_or("", String::as_str)
    }

    pub(crate) fn set_name(&self, name: String) {
        // First write wins; the name is immutable after construction
        let _ = self.name.set(name);
    }

    pub fn is_offline(&self) -> bool {
        self.test_flag(DeviceFlags::OFFLINE)
    }

    pub(crate) fn set_flag(&self, flag: DeviceFlags) {
        self.flags.fetch_or(flag.bits(), Ordering::SeqCst);
    }

    pub(crate) fn clear_flag(&self, flag: DeviceFlags) {
        self.flags.fetch_and(!flag.bits(), Ordering::SeqCst);
    }

    pub(crate) fn test_flag(&self, flag: DeviceFlags) -> bool {
        self.flags.load(Ordering::SeqCst) & flag.bits() != 0
    }

    /// Value copy of the current configuration snapshot
    pub fn config(&self) -> DeviceConfig {
        self.state.lock().unwrap().config.clone()
    }

    pub(crate) fn set_config(&self, config: DeviceConfig) {
        self.state.lock().unwrap().config = config;
    }

    pub(crate) fn update_config(&self, f: impl FnOnce(&mut DeviceConfig)) {
        f(&mut self.state.lock().unwrap().config);
    }

    pub fn config_state(&self) -> ConfigState {
        self.state.lock().unwrap().cfg_state
    }

    pub(crate) fn set_config_state(&self, cfg_state: ConfigState) {
        self.state.lock().unwrap().cfg_state = cfg_state;
    }

    /// Whether the STM capability block was found and validated
    pub fn stm_enabled(&self) -> bool {
        self.caps.lock().unwrap().stm_en
    }

    /// Detected STM protocol revision; meaningful only when enabled
    pub fn stm_revision(&self) -> u8 {
        self.caps.lock().unwrap().stm_rev
    }

    pub(crate) fn set_stm(&self, enabled: bool, rev: u8) {
        let mut caps = self.caps.lock().unwrap();
        caps.stm_en = enabled;
        caps.stm_rev = rev;
    }

    pub fn mm_mode_enabled(&self) -> bool {
        self.caps.lock().unwrap().mm_mode_en
    }

    pub fn st_mode_enabled(&self) -> bool {
        self.caps.lock().unwrap().st_mode_en
    }

    pub fn mm_channel_max(&self) -> u8 {
        self.caps.lock().unwrap().mm_channel_max
    }

    /// Whether function-level reset is available
    pub fn flr_present(&self) -> bool {
        self.caps.lock().unwrap().flr_present
    }

    pub(crate) fn apply_attributes(&self, attrs: DeviceAttributes) {
        let mut caps = self.caps.lock().unwrap();
        caps.mm_mode_en = attrs.mm_mode_en;
        caps.st_mode_en = attrs.st_mode_en;
        caps.mm_channel_max = attrs.mm_channel_max;
        caps.flr_present = attrs.flr_present;
    }

    pub(crate) fn regions(&self) -> MutexGuard<'_, RegionSet> {
        self.regions.lock().unwrap()
    }
}
