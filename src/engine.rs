//! External collaborator seam: DMA queue engine, inter-processor mailbox
//! and SR-IOV control.
//!
//! The lifecycle state machine calls into this trait at defined points but
//! never looks inside; queue bring-up, descriptor programming and mailbox
//! protocol live behind it.

use crate::device::DeviceRecord;
use crate::error::EngineError;

/// Hardware attributes probed from a physical function after the register
/// windows are mapped.
#[derive(Debug, Clone, Copy)]
pub struct DeviceAttributes {
    pub mm_mode_en: bool,
    pub st_mode_en: bool,
    pub mm_channel_max: u8,
    pub flr_present: bool,
}

impl Default for DeviceAttributes {
    fn default() -> Self {
        Self {
            mm_mode_en: true,
            st_mode_en: true,
            mm_channel_max: 1,
            flr_present: true,
        }
    }
}

/// DMA engine, mailbox and SR-IOV operations invoked by the lifecycle
/// state machine. Every call is expected to return promptly or fail.
pub trait DmaEngine: Send + Sync {
    /// Initialize the queue engine for an attached device
    fn device_init(&self, dev: &DeviceRecord) -> Result<(), EngineError>;

    /// Tear down the queue engine; must be idempotent
    fn device_cleanup(&self, dev: &DeviceRecord);

    fn mbox_init(&self, dev: &DeviceRecord);

    fn mbox_start(&self, dev: &DeviceRecord);

    /// Must be idempotent
    fn mbox_cleanup(&self, dev: &DeviceRecord);

    /// Enable up to `vf_max` virtual functions (physical-function mode)
    fn sriov_enable(&self, dev: &DeviceRecord, vf_max: u32) -> Result<(), EngineError>;

    fn sriov_disable(&self, dev: &DeviceRecord);

    /// Announce a virtual function as online (virtual-function mode)
    fn vf_online(&self, dev: &DeviceRecord, func: u32) -> Result<(), EngineError>;

    fn vf_offline(&self, dev: &DeviceRecord, func: u32);

    /// Probe queue/channel capabilities from the mapped registers
    fn probe_attributes(&self, dev: &DeviceRecord) -> DeviceAttributes;
}
