//! Resource Mapper: maps the device register windows into addressable
//! memory and validates them against the hardware signatures.

use tracing::{error, info, warn};

use crate::device::{DeviceRecord, FunctionMode};
use crate::error::{DriverError, DriverResult};

/// BAR carrying the DMA config registers; fixed by the hardware design
pub const CONFIG_BAR: usize = 0;

/// Upper bound on how much of the config BAR gets mapped
pub const MAX_BAR_LEN_MAPPED: usize = 0x0400_0000;

/// Identity word at offset 0 of the config BAR: top 16 bits of the
/// device family signature
pub const DMA_FAMILY_SIGNATURE: u32 = 0x1FD3_0000;
pub const DMA_FAMILY_MASK: u32 = 0xFFFF_0000;

/// Device id of the variant that exposes the STM capability block
pub const STM_ENABLED_DEVICE: u16 = 0x6AA0;

/// BAR carrying the STM capability block
pub const STM_BAR: usize = 2;

pub const STM_REG_BASE: usize = 0x0200;
pub const STM_REG_REV: usize = 0x00;
pub const STM_REG_H2C_MODE: usize = 0x30;

/// Value written into the upper 16 bits of the H2C mode register
pub const STM_PORT_MAP: u32 = 0xE1E1;

/// Highest STM protocol revision this driver understands
pub const STM_SUPPORTED_REV: u8 = 4;

/// Revision word layout: byte0 'S', byte1 'T', byte2 'M', byte3 revision
fn stm_revision_supported(rev: u32) -> bool {
    (rev >> 24) == u32::from(b'S')
        && ((rev >> 16) & 0xFF) == u32::from(b'T')
        && ((rev >> 8) & 0xFF) == u32::from(b'M')
        && (rev & 0xFF) <= u32::from(STM_SUPPORTED_REV)
}

/// Map the device register windows and verify their signatures.
///
/// The primary config window is mandatory; in physical-function mode its
/// identity word must carry the DMA family signature. Devices of the STM
/// variant additionally get the capability window mapped and its revision
/// word checked.
pub(crate) fn map_bars(xdev: &DeviceRecord, mode: FunctionMode) -> DriverResult<()> {
    let pdev = xdev.peer();

    xdev.update_config(|conf| conf.bar_num_config = Some(CONFIG_BAR));

    let mut map_len = pdev.region_len(CONFIG_BAR);
    if map_len > MAX_BAR_LEN_MAPPED {
        map_len = MAX_BAR_LEN_MAPPED;
    }

    let Some(regs) = pdev.map_region(CONFIG_BAR, map_len) else {
        error!(dev = %xdev.name(), bar = CONFIG_BAR, "unable to map config bar");
        return Err(DriverError::BarMapFailed { bar: CONFIG_BAR });
    };

    if mode == FunctionMode::Physical {
        // check that this really is the dma control BAR
        let id = regs.read32(0);
        if id & DMA_FAMILY_MASK != DMA_FAMILY_SIGNATURE {
            info!(dev = %xdev.name(), id = format_args!("{id:#010x}"), "no DMA config bar found");
            // unwind; dropping `regs` unmaps the one window we did map
            return Err(DriverError::WrongDeviceType { id });
        }
    }
    xdev.regions().regs = Some(regs);

    if pdev.device_id() == STM_ENABLED_DEVICE {
        let map_len = pdev.region_len(STM_BAR);
        let Some(stm_regs) = pdev.map_region(STM_BAR, map_len) else {
            warn!(dev = %xdev.name(), bar = STM_BAR, "unable to map bar");
            // The primary window stays mapped on this path; only a
            // revision mismatch below unmaps both. Kept as is, do not
            // symmetrize without confirming intent.
            return Err(DriverError::BarMapFailed { bar: STM_BAR });
        };

        let rev = stm_regs.read32(STM_REG_BASE + STM_REG_REV);
        if !stm_revision_supported(rev) {
            error!(dev = %xdev.name(), rev = format_args!("{rev:#010x}"), "unsupported STM rev found");
            drop(stm_regs);
            unmap_bars(xdev);
            return Err(DriverError::UnsupportedStmRevision { rev });
        }

        xdev.regions().stm_regs = Some(stm_regs);
        xdev.set_stm(true, (rev & 0xFF) as u8);
    } else {
        xdev.set_stm(false, 0);
    }

    Ok(())
}

/// Release whatever windows are currently mapped; safe to call multiple
/// times or on a partially-mapped record.
pub(crate) fn unmap_bars(xdev: &DeviceRecord) {
    let mut regions = xdev.regions();
    regions.regs = None;
    regions.stm_regs = None;
}
