//! Message identities and the control messages the fabric itself emits.
//!
//! Real applications get their message types from code generation; the
//! core only needs the shape: a fixed type index into the dispatch table,
//! a content hash the reader verifies, and a serializer writing
//! little-endian bytes into a frame payload. The handful of types below
//! are the fabric's own (assembly 0) messages and config records.

use crate::hash::fnv1a64;
use crate::layout::MemoryRegionId;

/// A message that can travel through a shared channel.
pub trait ShmMessage {
    /// 1-based index into the dispatch table. 0 is reserved for filler
    /// frames and never belongs to a real message.
    const TYPE_INDEX: u32;
    /// Content hash of the codegen type; checked by the reader before the
    /// handler runs.
    const TYPE_HASH: u64;

    /// Exact payload size in bytes.
    fn serialized_size(&self) -> usize;

    /// Write the payload; `payload.len() == self.serialized_size()`.
    fn serialize(&self, payload: &mut [u8]);
}

/// Number of dispatch-table slots the core's own messages occupy.
/// Application assemblies hand this to `register_settings_assembly` as
/// their dispatch-table base index.
pub const CORE_DISPATCH_TABLE_SIZE: u32 = 3;

// ── control messages (target → agent) ──────────────────────────────────────

/// Tells the agent to load the settings assembly registered under
/// `assembly_index` in the global dictionary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegisterSettingsAssemblyRequest {
    pub assembly_index: u32,
}

impl ShmMessage for RegisterSettingsAssemblyRequest {
    const TYPE_INDEX: u32 = 1;
    const TYPE_HASH: u64 = fnv1a64(b"Mlos.Core.RegisterSettingsAssemblyRequest");

    fn serialized_size(&self) -> usize {
        4
    }

    fn serialize(&self, payload: &mut [u8]) {
        payload[0..4].copy_from_slice(&self.assembly_index.to_le_bytes());
    }
}

impl RegisterSettingsAssemblyRequest {
    /// Decode a payload produced by `serialize`.
    pub fn deserialize(payload: &[u8]) -> Option<Self> {
        Some(Self {
            assembly_index: u32::from_le_bytes(payload.get(0..4)?.try_into().ok()?),
        })
    }
}

/// Announces a shared-config memory region to the agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegisterSharedConfigMemoryRegionRequest {
    pub region_id: MemoryRegionId,
}

impl ShmMessage for RegisterSharedConfigMemoryRegionRequest {
    const TYPE_INDEX: u32 = 2;
    const TYPE_HASH: u64 = fnv1a64(b"Mlos.Core.RegisterSharedConfigMemoryRegionRequest");

    fn serialized_size(&self) -> usize {
        8
    }

    fn serialize(&self, payload: &mut [u8]) {
        payload[0..4].copy_from_slice(&self.region_id.region_type.to_le_bytes());
        payload[4..8].copy_from_slice(&self.region_id.index.to_le_bytes());
    }
}

impl RegisterSharedConfigMemoryRegionRequest {
    pub fn deserialize(payload: &[u8]) -> Option<Self> {
        Some(Self {
            region_id: MemoryRegionId {
                region_type: u32::from_le_bytes(payload.get(0..4)?.try_into().ok()?),
                index: u32::from_le_bytes(payload.get(4..8)?.try_into().ok()?),
            },
        })
    }
}

/// Sent on each channel during shutdown so readers blocked on the
/// semaphore wake up and observe the terminate flag.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TerminateReaderThreadRequest;

impl ShmMessage for TerminateReaderThreadRequest {
    const TYPE_INDEX: u32 = 3;
    const TYPE_HASH: u64 = fnv1a64(b"Mlos.Core.TerminateReaderThreadRequest");

    fn serialized_size(&self) -> usize {
        0
    }

    fn serialize(&self, _payload: &mut [u8]) {}
}
