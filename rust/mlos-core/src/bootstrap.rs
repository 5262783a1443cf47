//! One-time initialization of the standard regions.
//!
//! Whoever creates a region stamps its header and embedded structures;
//! everyone who opens it afterwards validates instead. The global region
//! always comes first, because the channels' sync blocks and the
//! directory dictionary live inside it.

use std::io;

use mlos_primitives::{CreateDisposition, Region, SharedMemoryMap};
use mlos_primitives::sync::Ordering;

use crate::dictionary::{DEFAULT_SLOT_COUNT, SharedConfigDictionary};
use crate::error::Error;
use crate::layout::{
    CHANNEL_BUFFER_OFFSET, GLOBAL_DICTIONARY_OFFSET, GlobalMemoryRegion, MemoryRegionId,
    RegionType, SHARED_CONFIG_DICTIONARY_OFFSET, region_type_index,
};

/// Index of the standard shared-config region; further config regions a
/// component creates take indices from `total_region_count`.
pub const SHARED_CONFIG_REGION_INDEX: u32 = 1;

fn bad_region(reason: &'static str) -> Error {
    tracing::error!(reason, "attached region failed validation");
    Error::Io(io::Error::new(io::ErrorKind::InvalidData, reason))
}

/// Reference to the global structure at offset 0 of the global region.
///
/// # Safety
///
/// The region must hold an initialized `GlobalMemoryRegion` and outlive
/// the returned reference.
pub unsafe fn global_memory_region<'a>(region: Region) -> &'a GlobalMemoryRegion {
    unsafe { &*(region.offset(0) as *const GlobalMemoryRegion) }
}

/// Stamp or validate the global region; returns the directory dictionary.
pub fn setup_global_region(
    map: &SharedMemoryMap,
    disposition: CreateDisposition,
) -> Result<SharedConfigDictionary, Error> {
    let region = map.region();
    let id = MemoryRegionId::new(RegionType::Global, 0);

    match disposition {
        CreateDisposition::CreatedNew => {
            let global = unsafe { region.get_mut::<GlobalMemoryRegion>(0) };
            unsafe {
                global.header.init(
                    map.len() as u64,
                    id,
                    region_type_index::GLOBAL_MEMORY_REGION,
                )
            };
            // The global region itself is region 0.
            global.total_region_count.store(1, Ordering::Release);
            // Assembly 0 is the core's own settings.
            global
                .registered_settings_assembly_count
                .store(1, Ordering::Release);

            let dictionary = unsafe {
                SharedConfigDictionary::init(
                    region,
                    GLOBAL_DICTIONARY_OFFSET as u32,
                    map.len() as u32,
                    DEFAULT_SLOT_COUNT,
                )
            }?;
            tracing::info!(size = map.len(), "initialized global memory region");
            Ok(dictionary)
        }
        CreateDisposition::OpenedExisting => {
            let global = unsafe { region.get::<GlobalMemoryRegion>(0) };
            global.header.validate(id).map_err(bad_region)?;
            Ok(unsafe {
                SharedConfigDictionary::attach(region, GLOBAL_DICTIONARY_OFFSET as u32)
            })
        }
    }
}

/// Stamp or validate a channel region; returns the ring buffer span.
pub fn setup_channel_region(
    map: &SharedMemoryMap,
    region_type: RegionType,
    disposition: CreateDisposition,
) -> Result<Region, Error> {
    debug_assert!(matches!(
        region_type,
        RegionType::ControlChannel | RegionType::FeedbackChannel
    ));
    let region = map.region();
    let id = MemoryRegionId::new(region_type, 0);

    match disposition {
        CreateDisposition::CreatedNew => {
            let header = unsafe { region.get_mut::<crate::layout::MemoryRegionHeader>(0) };
            unsafe { header.init(map.len() as u64, id, region_type_index::CHANNEL_BUFFER) };
            tracing::info!(?region_type, size = map.len(), "initialized channel region");
        }
        CreateDisposition::OpenedExisting => {
            let header = unsafe { region.get::<crate::layout::MemoryRegionHeader>(0) };
            header.validate(id).map_err(bad_region)?;
        }
    }

    Ok(region.slice(
        CHANNEL_BUFFER_OFFSET,
        map.len() - CHANNEL_BUFFER_OFFSET,
    ))
}

/// Total map size needed for a channel whose ring holds `buffer_size`
/// bytes.
pub fn channel_region_size(buffer_size: usize) -> usize {
    CHANNEL_BUFFER_OFFSET + buffer_size
}

/// Stamp or validate the shared-config region; returns its dictionary.
pub fn setup_shared_config_region(
    map: &SharedMemoryMap,
    disposition: CreateDisposition,
) -> Result<SharedConfigDictionary, Error> {
    let region = map.region();
    let id = MemoryRegionId::new(RegionType::SharedConfig, SHARED_CONFIG_REGION_INDEX);

    match disposition {
        CreateDisposition::CreatedNew => {
            let header = unsafe { region.get_mut::<crate::layout::MemoryRegionHeader>(0) };
            unsafe {
                header.init(
                    map.len() as u64,
                    id,
                    region_type_index::SHARED_CONFIG_MEMORY_REGION,
                )
            };
            let dictionary = unsafe {
                SharedConfigDictionary::init(
                    region,
                    SHARED_CONFIG_DICTIONARY_OFFSET as u32,
                    map.len() as u32,
                    DEFAULT_SLOT_COUNT,
                )
            }?;
            tracing::info!(size = map.len(), "initialized shared-config region");
            Ok(dictionary)
        }
        CreateDisposition::OpenedExisting => {
            let header = unsafe { region.get::<crate::layout::MemoryRegionHeader>(0) };
            header.validate(id).map_err(bad_region)?;
            Ok(unsafe {
                SharedConfigDictionary::attach(region, SHARED_CONFIG_DICTIONARY_OFFSET as u32)
            })
        }
    }
}
