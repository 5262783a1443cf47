//! Region headers, ids, and the global region layout.
//!
//! Every standard region starts with a [`MemoryRegionHeader`] written
//! exactly once at creation. The global region additionally carries the
//! cross-process bookkeeping: attach counters, the two channels'
//! [`ChannelSync`] blocks, and a dictionary acting as the directory of
//! what exists and where.

use mlos_primitives::sync::AtomicU32;

use crate::channel::ChannelSync;
use crate::dictionary::DictionaryHeader;

/// Signature stamped into every region header.
pub const REGION_SIGNATURE: u32 = 0x6767_6767;

// ── object names (§external interfaces) ────────────────────────────────────

pub const GLOBAL_MEMORY_MAP_NAME: &str = "Host_Mlos.GlobalMemory";
pub const CONTROL_CHANNEL_MAP_NAME: &str = "Host_Mlos.ControlChannel";
pub const FEEDBACK_CHANNEL_MAP_NAME: &str = "Host_Mlos.FeedbackChannel";
pub const SHARED_CONFIG_MAP_NAME: &str = "Host_Mlos.Config.SharedMemory";

/// Global-region name used by in-process test contexts.
pub const TEST_GLOBAL_MEMORY_MAP_NAME: &str = "Test_Mlos.GlobalMemory";

pub const CONTROL_CHANNEL_EVENT_NAME: &str = "mlos_control_channel_event";
pub const FEEDBACK_CHANNEL_EVENT_NAME: &str = "mlos_feedback_channel_event";

pub const DEFAULT_SOCKET_PATH: &str = "/var/tmp/mlos/mlos.sock";
pub const DEFAULT_WATCH_DIRECTORY: &str = "/var/tmp/mlos";
pub const WATCH_FILE_NAME: &str = "mlos.opened";

/// Default size of each standard region's usable payload.
pub const DEFAULT_REGION_SIZE: usize = 64 * 1024;

/// Channel regions place the ring after a 64-byte header block so the
/// ring itself keeps a power-of-two size.
pub const CHANNEL_BUFFER_OFFSET: usize = 64;

// ── region identity ────────────────────────────────────────────────────────

/// Kinds of standard regions.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegionType {
    Global = 1,
    ControlChannel = 2,
    FeedbackChannel = 3,
    SharedConfig = 4,
}

impl RegionType {
    pub fn from_u32(v: u32) -> Option<Self> {
        match v {
            1 => Some(RegionType::Global),
            2 => Some(RegionType::ControlChannel),
            3 => Some(RegionType::FeedbackChannel),
            4 => Some(RegionType::SharedConfig),
            _ => None,
        }
    }
}

/// Identity of one region instance.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryRegionId {
    pub region_type: u32,
    pub index: u32,
}

impl MemoryRegionId {
    pub fn new(region_type: RegionType, index: u32) -> Self {
        Self {
            region_type: region_type as u32,
            index,
        }
    }
}

/// Header at offset 0 of every standard region.
///
/// The signature and size are written once at creation and never
/// mutated.
#[repr(C)]
pub struct MemoryRegionHeader {
    pub signature: u32,
    _pad0: u32,
    pub region_size: u64,
    pub region_id: MemoryRegionId,
    /// Codegen type index of the structure following this header.
    pub codegen_type_index: u32,
    _pad1: u32,
}

const _: () = assert!(core::mem::size_of::<MemoryRegionHeader>() == 32);

impl MemoryRegionHeader {
    /// Stamp a fresh header.
    ///
    /// # Safety
    ///
    /// `self` must reference exclusively-owned, zeroed region memory.
    pub unsafe fn init(&mut self, region_size: u64, region_id: MemoryRegionId, type_index: u32) {
        self.signature = REGION_SIGNATURE;
        self._pad0 = 0;
        self.region_size = region_size;
        self.region_id = region_id;
        self.codegen_type_index = type_index;
        self._pad1 = 0;
    }

    /// Check an attached region looks like what we expect.
    pub fn validate(&self, expected: MemoryRegionId) -> Result<(), &'static str> {
        if self.signature != REGION_SIGNATURE {
            return Err("bad region signature");
        }
        if self.region_size == 0 {
            return Err("zero region size");
        }
        if self.region_id != expected {
            return Err("region id mismatch");
        }
        Ok(())
    }
}

/// Codegen type indices for the structures standard regions embed.
pub mod region_type_index {
    pub const GLOBAL_MEMORY_REGION: u32 = 1;
    pub const CHANNEL_BUFFER: u32 = 2;
    pub const SHARED_CONFIG_MEMORY_REGION: u32 = 3;
}

// ── global region ──────────────────────────────────────────────────────────

/// The structure at offset 0 of the global region.
///
/// The embedded dictionary serves as the directory of registered
/// settings assemblies and named objects; its arena covers the rest of
/// the region.
#[repr(C)]
pub struct GlobalMemoryRegion {
    pub header: MemoryRegionHeader,

    /// Processes currently attached; the last detacher unlinks the OS
    /// objects.
    pub attached_process_count: AtomicU32,
    /// Regions registered so far; source of new region indices.
    pub total_region_count: AtomicU32,
    /// Settings assemblies registered so far. Starts at 1: the core's
    /// own settings are implicitly assembly 0.
    pub registered_settings_assembly_count: AtomicU32,
    _pad: [u8; 20],

    pub control_channel_sync: ChannelSync,
    pub feedback_channel_sync: ChannelSync,

    pub dictionary: DictionaryHeader,
}

#[cfg(not(loom))]
const _: () = assert!(core::mem::size_of::<GlobalMemoryRegion>() == 256);

/// Offset of the global directory dictionary within the global region.
pub const GLOBAL_DICTIONARY_OFFSET: usize = core::mem::offset_of!(GlobalMemoryRegion, dictionary);

/// Offset of the dictionary embedded in a shared-config region
/// (first 64-byte boundary past the region header).
pub const SHARED_CONFIG_DICTIONARY_OFFSET: usize = 64;

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;

    #[test]
    fn header_layout_is_stable() {
        assert_eq!(core::mem::size_of::<MemoryRegionHeader>(), 32);
        assert_eq!(core::mem::size_of::<GlobalMemoryRegion>(), 256);
        assert_eq!(
            core::mem::offset_of!(GlobalMemoryRegion, control_channel_sync),
            64
        );
        assert_eq!(
            core::mem::offset_of!(GlobalMemoryRegion, feedback_channel_sync),
            128
        );
        assert_eq!(GLOBAL_DICTIONARY_OFFSET, 192);
    }

    #[test]
    fn validation_checks_signature_and_identity() {
        let mut header = unsafe { core::mem::zeroed::<MemoryRegionHeader>() };
        let id = MemoryRegionId::new(RegionType::Global, 0);
        unsafe { header.init(65536, id, region_type_index::GLOBAL_MEMORY_REGION) };

        assert!(header.validate(id).is_ok());
        assert!(
            header
                .validate(MemoryRegionId::new(RegionType::SharedConfig, 1))
                .is_err()
        );

        header.signature = 0xDEAD_BEEF;
        assert!(header.validate(id).is_err());
    }
}
