//! DMA Engine PCIe Accelerator Device Driver
//!
//! Manages the attach/detach lifecycle of PCIe accelerator devices that
//! expose a DMA engine, and keeps a registry of currently-attached
//! devices. Queue bring-up, mailbox messaging and SR-IOV internals live
//! behind the [`engine::DmaEngine`] trait; this crate covers the
//! orchestration and resource safety around them.

// Expose public modules
pub mod device;
pub mod engine;
pub mod error;

// Prelude for convenient imports
pub mod prelude {
    pub use crate::device::{
        ConfigState, DeviceConfig, DeviceHandle, DeviceManager, DeviceRecord, DeviceRegistry,
        FunctionMode, MappedRegion, PciAddress, PciDevice,
    };
    pub use crate::engine::{DeviceAttributes, DmaEngine};
    pub use crate::error::{DriverError, DriverResult};
}

// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
