//! The fabric's own config records, published in the global directory.
//!
//! These are the entries the agent walks to discover what the target has
//! set up: which settings assemblies exist, and which named shared-memory
//! objects and events back each region. Their layouts play the role
//! code generation plays for application records.

use crate::config::ConfigRecord;
use crate::hash::{fnv1a64, fnv1a64_seeded};
use crate::layout::MemoryRegionId;

fn read_u32(payload: &[u8], at: usize) -> u32 {
    u32::from_le_bytes(payload[at..at + 4].try_into().unwrap())
}

fn write_u32(payload: &mut [u8], at: usize, value: u32) {
    payload[at..at + 4].copy_from_slice(&value.to_le_bytes());
}

fn read_string(payload: &[u8], at: usize) -> String {
    let len = read_u32(payload, at) as usize;
    String::from_utf8_lossy(&payload[at + 4..at + 4 + len]).into_owned()
}

fn write_string(payload: &mut [u8], at: usize, value: &str) {
    write_u32(payload, at, value.len() as u32);
    payload[at + 4..at + 4 + value.len()].copy_from_slice(value.as_bytes());
}

fn key_seed(type_index: u32) -> u64 {
    fnv1a64(&type_index.to_le_bytes())
}

// ── registered settings assembly ───────────────────────────────────────────

/// One settings assembly the target registered, keyed by its index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisteredSettingsAssemblyConfig {
    pub assembly_index: u32,
    /// Where this assembly's message types start in the dispatch table.
    pub dispatch_table_base_index: u32,
    pub assembly_file_name: String,
}

impl ConfigRecord for RegisteredSettingsAssemblyConfig {
    const TYPE_INDEX: u32 = 4;

    fn key_hash(&self) -> u64 {
        fnv1a64_seeded(key_seed(Self::TYPE_INDEX), &self.assembly_index.to_le_bytes())
    }

    fn compare_key(&self, shared_payload: &[u8]) -> bool {
        read_u32(shared_payload, 0) == self.assembly_index
    }

    fn serialized_size(&self) -> usize {
        4 + 4 + 4 + self.assembly_file_name.len()
    }

    fn serialize(&self, payload: &mut [u8]) {
        write_u32(payload, 0, self.assembly_index);
        write_u32(payload, 4, self.dispatch_table_base_index);
        write_string(payload, 8, &self.assembly_file_name);
    }

    fn update_from(&mut self, shared_payload: &[u8]) {
        self.assembly_index = read_u32(shared_payload, 0);
        self.dispatch_table_base_index = read_u32(shared_payload, 4);
        self.assembly_file_name = read_string(shared_payload, 8);
    }
}

// ── registered memory region ───────────────────────────────────────────────

/// Maps a region id to the shared-memory object name backing it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisteredMemoryRegionConfig {
    pub region_id: MemoryRegionId,
    pub shared_memory_map_name: String,
}

impl ConfigRecord for RegisteredMemoryRegionConfig {
    const TYPE_INDEX: u32 = 5;

    fn key_hash(&self) -> u64 {
        let seed = fnv1a64_seeded(
            key_seed(Self::TYPE_INDEX),
            &self.region_id.region_type.to_le_bytes(),
        );
        fnv1a64_seeded(seed, &self.region_id.index.to_le_bytes())
    }

    fn compare_key(&self, shared_payload: &[u8]) -> bool {
        read_u32(shared_payload, 0) == self.region_id.region_type
            && read_u32(shared_payload, 4) == self.region_id.index
    }

    fn serialized_size(&self) -> usize {
        4 + 4 + 4 + self.shared_memory_map_name.len()
    }

    fn serialize(&self, payload: &mut [u8]) {
        write_u32(payload, 0, self.region_id.region_type);
        write_u32(payload, 4, self.region_id.index);
        write_string(payload, 8, &self.shared_memory_map_name);
    }

    fn update_from(&mut self, shared_payload: &[u8]) {
        self.region_id = MemoryRegionId {
            region_type: read_u32(shared_payload, 0),
            index: read_u32(shared_payload, 4),
        };
        self.shared_memory_map_name = read_string(shared_payload, 8);
    }
}

// ── registered named event ─────────────────────────────────────────────────

/// Maps a channel region id to the named semaphore waking its readers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisteredNamedEventConfig {
    pub region_id: MemoryRegionId,
    pub event_name: String,
}

impl ConfigRecord for RegisteredNamedEventConfig {
    const TYPE_INDEX: u32 = 6;

    fn key_hash(&self) -> u64 {
        let seed = fnv1a64_seeded(
            key_seed(Self::TYPE_INDEX),
            &self.region_id.region_type.to_le_bytes(),
        );
        fnv1a64_seeded(seed, &self.region_id.index.to_le_bytes())
    }

    fn compare_key(&self, shared_payload: &[u8]) -> bool {
        read_u32(shared_payload, 0) == self.region_id.region_type
            && read_u32(shared_payload, 4) == self.region_id.index
    }

    fn serialized_size(&self) -> usize {
        4 + 4 + 4 + self.event_name.len()
    }

    fn serialize(&self, payload: &mut [u8]) {
        write_u32(payload, 0, self.region_id.region_type);
        write_u32(payload, 4, self.region_id.index);
        write_string(payload, 8, &self.event_name);
    }

    fn update_from(&mut self, shared_payload: &[u8]) {
        self.region_id = MemoryRegionId {
            region_type: read_u32(shared_payload, 0),
            index: read_u32(shared_payload, 4),
        };
        self.event_name = read_string(shared_payload, 8);
    }
}
