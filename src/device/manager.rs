//! Lifecycle state machine: attach, online, offline, detach.
//!
//! Every public entry point re-validates the caller's handle before
//! touching registry state, and every attach failure unwinds strictly in
//! reverse construction order.

use std::sync::Arc;

use tracing::{error, info, warn};

use crate::device::{
    bars, pcie, ConfigState, DeviceConfig, DeviceFlags, DeviceHandle, DeviceRecord,
    DeviceRegistry, FunctionMode, PciDevice,
};
use crate::engine::DmaEngine;
use crate::error::{DriverError, DriverResult};

/// Orchestrates the attach/detach lifecycle and owns the registry of
/// attached devices.
///
/// One manager per driver instance; pass it by shared reference. The
/// physical/virtual function mode and the DMA engine collaborator are
/// fixed at construction.
pub struct DeviceManager {
    registry: DeviceRegistry,
    engine: Arc<dyn DmaEngine>,
    mode: FunctionMode,
}

impl DeviceManager {
    pub fn new(mode: FunctionMode, engine: Arc<dyn DmaEngine>) -> Self {
        Self {
            registry: DeviceRegistry::new(mode),
            engine,
            mode,
        }
    }

    pub fn registry(&self) -> &DeviceRegistry {
        &self.registry
    }

    pub fn mode(&self) -> FunctionMode {
        self.mode
    }

    /// Attach a device and drive it online.
    ///
    /// On success the caller's `conf` is refreshed with the finalized
    /// configuration and the returned handle identifies the record at
    /// every other entry point. On failure everything built so far is
    /// torn down in reverse order and the registry is left unchanged.
    pub fn open(
        &self,
        mod_name: &str,
        pdev: Arc<dyn PciDevice>,
        conf: &mut DeviceConfig,
    ) -> DriverResult<DeviceHandle> {
        if mod_name.is_empty() {
            info!("open: mod_name is empty");
            return Err(DriverError::InvalidInput("mod_name"));
        }

        conf.bar_num_config = None;
        conf.bar_num_user = None;

        let addr = pdev.address();
        info!(
            mod_name,
            pdev = %addr,
            vendor = format_args!("{:#06x}", pdev.vendor_id()),
            device = format_args!("{:#06x}", pdev.device_id()),
            "opening device"
        );

        if self.registry.find_by_peer(&pdev).is_some() {
            warn!(mod_name, pdev = %addr, "device already attached");
            return Err(DriverError::AlreadyAttached(addr));
        }

        // Some other driver may have claimed the device, so this is not
        // necessarily our error to shout about.
        if let Err(e) = pdev.request_regions(mod_name) {
            info!(pdev = %addr, "cannot obtain PCI resources");
            return Err(e.into());
        }

        if let Err(e) = pdev.enable() {
            error!(pdev = %addr, "cannot enable PCI device");
            pdev.release_regions();
            return Err(e.into());
        }

        pdev.enable_relaxed_ordering();
        pdev.set_bus_master();

        if let Err(e) = pcie::set_dma_masks(pdev.as_ref()) {
            pdev.disable();
            pdev.release_regions();
            return Err(e);
        }

        // registration assigns the bus address, slot ordinal and handle
        let xdev = match self.registry.insert(Arc::clone(&pdev), conf.clone()) {
            Ok(xdev) => xdev,
            Err(e) => {
                pdev.disable();
                pdev.release_regions();
                return Err(e);
            }
        };
        xdev.set_flag(DeviceFlags::OFFLINE);
        xdev.set_name(format!("dma{:05x}-{}", xdev.bdf(), mod_name));

        if let Err(e) = self.attach_resources(&xdev, conf) {
            bars::unmap_bars(&xdev);
            self.registry.remove(&xdev);
            pdev.disable();
            pdev.release_regions();
            return Err(e);
        }

        let handle = xdev.handle();
        if let Err(e) = self.online(&pdev, handle) {
            self.offline(&pdev, handle);
            bars::unmap_bars(&xdev);
            self.registry.remove(&xdev);
            pdev.disable();
            pdev.release_regions();
            return Err(e);
        }

        info!(
            dev = %xdev.name(),
            bdf = format_args!("{:05x}", xdev.bdf()),
            channels = xdev.mm_channel_max(),
            qsets = conf.qsets_max,
            vfs = conf.vf_max,
            "device attached"
        );
        Ok(handle)
    }

    /// Map register windows, program the STM port map, probe attributes
    /// and hand the finalized configuration back to the caller.
    fn attach_resources(&self, xdev: &Arc<DeviceRecord>, conf: &mut DeviceConfig) -> DriverResult<()> {
        bars::map_bars(xdev, self.mode)?;

        if xdev.stm_enabled() {
            let regions = xdev.regions();
            if let Some(stm_regs) = regions.stm_regs.as_ref() {
                let off = bars::STM_REG_BASE + bars::STM_REG_H2C_MODE;
                let v = (stm_regs.read32(off) & 0x0000_FFFF) | (bars::STM_PORT_MAP << 16);
                stm_regs.write32(off, v);
            }
        }

        if self.mode == FunctionMode::Physical {
            let attrs = self.engine.probe_attributes(xdev);
            xdev.apply_attributes(attrs);
            if !xdev.mm_mode_enabled() && !xdev.st_mode_enabled() {
                info!(dev = %xdev.name(), "none of the modes (ST or MM) are enabled");
                return Err(DriverError::InterfaceNotEnabled);
            }
        }

        *conf = xdev.config();
        Ok(())
    }

    /// Bring an attached device online: initialize the DMA engine, clear
    /// the offline flag and start the mailbox / SR-IOV machinery.
    pub fn online(&self, pdev: &Arc<dyn PciDevice>, handle: DeviceHandle) -> DriverResult<()> {
        let xdev = self.check_handle("online", Some(pdev), handle)?;

        if let Err(e) = self.engine.device_init(&xdev) {
            warn!(dev = %xdev.name(), err = %e, "dma engine init failed");
            self.engine.device_cleanup(&xdev);
            return Err(e.into());
        }
        xdev.clear_flag(DeviceFlags::OFFLINE);
        self.engine.mbox_init(&xdev);

        match self.mode {
            FunctionMode::Virtual => {
                // the physical function's mailbox only starts once a VF
                // announces itself
                self.engine.mbox_start(&xdev);
                if let Err(e) = self.engine.vf_online(&xdev, 0) {
                    self.engine.device_cleanup(&xdev);
                    return Err(e.into());
                }
            }
            FunctionMode::Physical => {
                let vf_max = xdev.config().vf_max;
                if vf_max > 0 {
                    if let Err(e) = self.engine.sriov_enable(&xdev, vf_max) {
                        self.engine.device_cleanup(&xdev);
                        return Err(e.into());
                    }
                }
            }
        }
        Ok(())
    }

    /// Take an attached device offline. Silently ignores invalid
    /// handles; safe to call repeatedly, the collaborator cleanups are
    /// idempotent.
    pub fn offline(&self, pdev: &Arc<dyn PciDevice>, handle: DeviceHandle) {
        let Ok(xdev) = self.check_handle("offline", Some(pdev), handle) else {
            return;
        };

        xdev.set_flag(DeviceFlags::OFFLINE);

        match self.mode {
            FunctionMode::Virtual => self.engine.vf_offline(&xdev, 0),
            FunctionMode::Physical => self.engine.sriov_disable(&xdev),
        }

        self.engine.device_cleanup(&xdev);
        self.engine.mbox_cleanup(&xdev);
    }

    /// Detach a device: offline, unmap, release the bus claim, then drop
    /// the record from the registry. Symmetric to `open` in reverse.
    pub fn close(&self, pdev: &Arc<dyn PciDevice>, handle: DeviceHandle) {
        let Ok(xdev) = self.check_handle("close", Some(pdev), handle) else {
            return;
        };

        self.offline(pdev, handle);

        bars::unmap_bars(&xdev);

        pdev.release_regions();
        pdev.disable();

        self.registry.remove(&xdev);
    }

    /// Value copy of the device's current configuration
    pub fn get_config(&self, handle: DeviceHandle) -> DriverResult<DeviceConfig> {
        let xdev = self.record_for_handle("get_config", handle)?;
        Ok(xdev.config())
    }

    /// Replace the device's configuration snapshot
    pub fn set_config(&self, handle: DeviceHandle, conf: &DeviceConfig) -> DriverResult<()> {
        let xdev = self.record_for_handle("set_config", handle)?;
        xdev.set_config(conf.clone());
        Ok(())
    }

    pub fn set_config_state(&self, handle: DeviceHandle, state: ConfigState) -> DriverResult<()> {
        let xdev = self.record_for_handle("set_config_state", handle)?;
        xdev.set_config_state(state);
        Ok(())
    }

    /// Raw-value variant of [`set_config_state`](Self::set_config_state)
    /// for callers bridging from untyped interfaces; values above the
    /// maximum defined tag are rejected.
    pub fn set_config_state_raw(&self, handle: DeviceHandle, state: u32) -> DriverResult<()> {
        let Some(state) = ConfigState::from_raw(state) else {
            return Err(DriverError::InvalidInput("config state"));
        };
        self.set_config_state(handle, state)
    }

    /// Bounded text dump of the attached-device listing
    pub fn dump(&self, buf: &mut [u8]) -> usize {
        self.registry.dump(buf)
    }

    /// Validate a caller-supplied handle against the live registry.
    ///
    /// Rejects a missing peer, a peer with no record, a handle that does
    /// not match the found record and a record whose stored peer is not
    /// the supplied one. Failures are logged with the caller's name and
    /// never retried.
    fn check_handle(
        &self,
        fname: &str,
        peer: Option<&Arc<dyn PciDevice>>,
        handle: DeviceHandle,
    ) -> DriverResult<Arc<DeviceRecord>> {
        let Some(pdev) = peer else {
            info!(caller = fname, ?handle, "pci device null");
            return Err(DriverError::PciDeviceNull);
        };

        let Some(xdev) = self.registry.find_by_peer(pdev) else {
            info!(caller = fname, pdev = %pdev.address(), ?handle, "no match found");
            return Err(DriverError::InvalidHandle);
        };

        if xdev.handle() != handle {
            info!(
                caller = fname,
                pdev = %pdev.address(),
                ?handle,
                found = ?xdev.handle(),
                "handle mismatch"
            );
            return Err(DriverError::InvalidHandle);
        }

        if !Arc::ptr_eq(xdev.peer(), pdev) {
            info!(caller = fname, pdev = %pdev.address(), "pci device mismatch");
            return Err(DriverError::InvalidHandle);
        }

        Ok(xdev)
    }

    /// Resolve a handle without a caller-supplied peer, cross-validating
    /// against the record's own stored peer.
    fn record_for_handle(&self, fname: &str, handle: DeviceHandle) -> DriverResult<Arc<DeviceRecord>> {
        let Some(xdev) = self.registry.find_by_handle(handle) else {
            info!(caller = fname, ?handle, "no match found");
            return Err(DriverError::InvalidHandle);
        };
        let peer = Arc::clone(xdev.peer());
        self.check_handle(fname, Some(&peer), handle)?;
        Ok(xdev)
    }
}
