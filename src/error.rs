//! Error handling for the DMA accelerator driver

use thiserror::Error;

use crate::device::pcie::PciAddress;

/// Comprehensive error enum for the DMA accelerator driver
#[derive(Debug, Error)]
pub enum DriverError {
    /// Caller passed an unusable argument
    #[error("Invalid input: {0}")]
    InvalidInput(&'static str),

    /// No PCI device was supplied where one is required
    #[error("PCI device is null")]
    PciDeviceNull,

    /// A live record already exists for this peer
    #[error("Device {0} already attached")]
    AlreadyAttached(PciAddress),

    /// Neither memory-mapped nor streaming interface is enabled in hardware
    #[error("None of the modes (ST or MM) are enabled in the device")]
    InterfaceNotEnabled,

    /// Handle validation failed: stale, mismatched or forged handle
    #[error("Invalid device handle")]
    InvalidHandle,

    /// A register region could not be mapped
    #[error("Unable to map BAR {bar}")]
    BarMapFailed { bar: usize },

    /// The mapped primary region does not carry the DMA config signature
    #[error("No DMA config BAR found, id {id:#010x}")]
    WrongDeviceType { id: u32 },

    /// The STM capability block reports an unsupported revision word
    #[error("Unsupported STM revision found, rev {rev:#010x}")]
    UnsupportedStmRevision { rev: u32 },

    /// No DMA addressing width could be committed
    #[error("No suitable DMA mask possible")]
    DmaMaskUnsupported,

    /// Bus-level resource acquisition errors
    #[error(transparent)]
    Pci(#[from] PciError),

    /// Failures surfaced by the external DMA engine collaborator
    #[error(transparent)]
    Engine(#[from] EngineError),
}

/// Errors raised by the bus-level `PciDevice` operations
#[derive(Debug, Error)]
pub enum PciError {
    /// The exclusive-access region reservation was refused
    #[error("Cannot obtain PCI resources")]
    ResourcesBusy,

    /// The device could not be activated at the bus level
    #[error("Cannot enable PCI device")]
    EnableFailed,
}

/// Errors raised by the external DMA engine / mailbox / SR-IOV collaborators
#[derive(Debug, Error)]
pub enum EngineError {
    /// Queue-engine initialization failed
    #[error("DMA engine init failed: {0}")]
    InitFailed(String),

    /// Virtual-function bring-up failed
    #[error("SR-IOV error: {0}")]
    Sriov(String),
}

/// Error extension trait for additional error handling capabilities
pub trait ErrorExt {
    /// Caller-input errors are rejected before any side effect
    fn is_caller_error(&self) -> bool;

    /// Handle errors are rejected by the validator before any mutation
    fn is_handle_error(&self) -> bool;
}

impl ErrorExt for DriverError {
    fn is_caller_error(&self) -> bool {
        matches!(
            self,
            DriverError::InvalidInput(_)
                | DriverError::PciDeviceNull
                | DriverError::AlreadyAttached(_)
        )
    }

    fn is_handle_error(&self) -> bool {
        matches!(self, DriverError::InvalidHandle)
    }
}

/// Convenience result type using DriverError
pub type DriverResult<T> = Result<T, DriverError>;
