//! Process-wide registry of attached devices.
//!
//! A single mutex serializes every mutation and scan; the critical
//! sections only chase pointers, so the lock is never held across I/O,
//! hardware access or allocation.

use std::sync::{Arc, Mutex};

use crate::device::{
    ConfigState, DeviceConfig, DeviceHandle, DeviceRecord, FunctionMode, PciDevice,
};
use crate::error::{DriverError, DriverResult};

struct Inner {
    devices: Vec<Arc<DeviceRecord>>,
    next_generation: u32,
}

/// Ordered collection of currently-attached devices.
///
/// Owned by the `DeviceManager` and shared by reference; it tracks
/// membership only and never owns the records' hardware resources.
pub struct DeviceRegistry {
    mode: FunctionMode,
    inner: Mutex<Inner>,
}

impl DeviceRegistry {
    pub fn new(mode: FunctionMode) -> Self {
        Self {
            mode,
            inner: Mutex::new(Inner {
                devices: Vec::new(),
                next_generation: 0,
            }),
        }
    }

    /// Register a fully constructed record for this peer.
    ///
    /// Assigns the derived bus address and a fresh generation-checked
    /// handle, appends at the tail, recomputes every record's slot
    /// ordinal and stamps the new record as unconfigured. Fails closed
    /// if a record for the same peer identity already exists.
    pub fn insert(
        &self,
        peer: Arc<dyn PciDevice>,
        config: DeviceConfig,
    ) -> DriverResult<Arc<DeviceRecord>> {
        let mut inner = self.inner.lock().unwrap();

        if inner
            .devices
            .iter()
            .any(|dev| Arc::ptr_eq(dev.peer(), &peer))
        {
            return Err(DriverError::AlreadyAttached(peer.address()));
        }

        let bdf = peer.address().bdf();
        let handle = DeviceHandle::new(inner.devices.len() as u32, inner.next_generation);
        inner.next_generation = inner.next_generation.wrapping_add(1);

        let record = Arc::new(DeviceRecord::new(peer, handle, bdf, config));
        record.set_config_state(ConfigState::Unconfigured);
        inner.devices.push(Arc::clone(&record));

        // Ordinals depend on the full sibling set at insertion time, so
        // every record is renumbered, not just the new one.
        renumber_ordinals(&inner.devices, self.mode);

        Ok(record)
    }

    /// Unlink a record.
    ///
    /// Remaining siblings keep their ordinals; renumbering happens only
    /// on insertion.
    pub fn remove(&self, record: &Arc<DeviceRecord>) {
        let mut inner = self.inner.lock().unwrap();
        inner.devices.retain(|dev| !Arc::ptr_eq(dev, record));
    }

    /// Linear scan for the record owning this peer identity
    pub fn find_by_peer(&self, peer: &Arc<dyn PciDevice>) -> Option<Arc<DeviceRecord>> {
        let inner = self.inner.lock().unwrap();
        inner
            .devices
            .iter()
            .find(|dev| Arc::ptr_eq(dev.peer(), peer))
            .cloned()
    }

    /// Linear scan comparing derived bus addresses
    pub fn find_by_bdf(&self, bdf: u32) -> Option<Arc<DeviceRecord>> {
        let inner = self.inner.lock().unwrap();
        inner.devices.iter().find(|dev| dev.bdf() == bdf).cloned()
    }

    /// Linear scan comparing generation-checked handles
    pub fn find_by_handle(&self, handle: DeviceHandle) -> Option<Arc<DeviceRecord>> {
        let inner = self.inner.lock().unwrap();
        inner
            .devices
            .iter()
            .find(|dev| dev.handle() == handle)
            .cloned()
    }

    /// First record in insertion order
    pub fn first(&self) -> Option<Arc<DeviceRecord>> {
        let inner = self.inner.lock().unwrap();
        inner.devices.first().cloned()
    }

    /// Record following `current` in insertion order.
    ///
    /// Returns a value clone; a concurrent removal between calls can make
    /// the walk skip or end early, which callers must tolerate.
    pub fn next(&self, current: &Arc<DeviceRecord>) -> Option<Arc<DeviceRecord>> {
        let inner = self.inner.lock().unwrap();
        let pos = inner
            .devices
            .iter()
            .position(|dev| Arc::ptr_eq(dev, current))?;
        inner.devices.get(pos + 1).cloned()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().unwrap().devices.is_empty()
    }

    /// Render one line per record into `buf`, stopping before the
    /// listing would overflow; the result is NUL-terminated within
    /// capacity. Returns the number of bytes written before the NUL.
    pub fn dump(&self, buf: &mut [u8]) -> usize {
        let devices = self.inner.lock().unwrap().devices.clone();

        let mut len = 0;
        for dev in &devices {
            let addr = dev.peer().address();
            let line = format!(
                "dma{:05x}\t{:02x}:{:02x}.{:02x}\n",
                dev.bdf(),
                addr.bus,
                addr.device,
                addr.function
            );
            let bytes = line.as_bytes();
            // keep one byte for the terminator
            if len + bytes.len() >= buf.len() {
                break;
            }
            buf[len..len + bytes.len()].copy_from_slice(bytes);
            len += bytes.len();
        }
        if !buf.is_empty() {
            buf[len] = 0;
        }
        len
    }
}

/// Walk the list in insertion order, resetting the ordinal to 1 whenever
/// the bus (and, for physical functions, the device number) differs from
/// the previous record visited. Virtual functions of one card share a bus
/// but not a device number, so virtual mode compares the bus alone.
fn renumber_ordinals(devices: &[Arc<DeviceRecord>], mode: FunctionMode) {
    let mut last: Option<(u8, u8)> = None;
    let mut ordinal = 0u32;

    for dev in devices {
        let addr = dev.peer().address();
        let same_card = last.is_some_and(|(bus, device)| {
            bus == addr.bus && (mode == FunctionMode::Virtual || device == addr.device)
        });
        if !same_card {
            ordinal = 0;
        }
        ordinal += 1;
        dev.set_ordinal(ordinal);
        last = Some((addr.bus, addr.device));
    }
}
