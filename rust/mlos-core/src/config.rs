//! Local handles over published config records.
//!
//! A [`ComponentConfig`] pairs a mutable local copy of a record with a
//! `(region, offset)` binding to the shared copy once registered. The
//! handle is plain data: sending telemetry tagged with a config goes
//! through the owning `MlosContext`, not through the handle.

use mlos_primitives::Region;
use mlos_primitives::sync::{Ordering, spin_loop};

use crate::dictionary::{SHARED_CONFIG_HEADER_SIZE, SharedConfigHeader};

/// A record type that can live in a shared-config dictionary.
///
/// Real record layouts come from code generation; this trait captures the
/// shape the dictionary needs: a stable type index, a hashable key view,
/// key equality against serialized bytes, and (de)serialization of the
/// full record payload.
pub trait ConfigRecord {
    /// Codegen type index identifying the record layout.
    const TYPE_INDEX: u32;

    /// Hash of the record's key view; both processes must agree on it.
    fn key_hash(&self) -> u64;

    /// True if `shared_payload` holds a record with the same key.
    fn compare_key(&self, shared_payload: &[u8]) -> bool;

    /// Exact payload size of this record when serialized.
    fn serialized_size(&self) -> usize;

    /// Write the record; `payload.len() == self.serialized_size()`.
    fn serialize(&self, payload: &mut [u8]);

    /// Refresh all fields from serialized bytes.
    fn update_from(&mut self, shared_payload: &[u8]);
}

#[derive(Clone, Copy)]
struct Binding {
    region: Region,
    record_offset: u32,
}

/// Mutable local copy of a config record plus its shared binding.
pub struct ComponentConfig<T: ConfigRecord> {
    local: T,
    binding: Option<Binding>,
}

impl<T: ConfigRecord> ComponentConfig<T> {
    pub fn new(initial: T) -> Self {
        Self {
            local: initial,
            binding: None,
        }
    }

    /// The local copy.
    #[inline]
    pub fn local(&self) -> &T {
        &self.local
    }

    /// Mutable access to the local copy. Shared state is untouched until
    /// the record is (re)published.
    #[inline]
    pub fn local_mut(&mut self) -> &mut T {
        &mut self.local
    }

    /// True once the config is bound to a shared record.
    #[inline]
    pub fn is_bound(&self) -> bool {
        self.binding.is_some()
    }

    pub(crate) fn bind(&mut self, region: Region, record_offset: u32) {
        self.binding = Some(Binding {
            region,
            record_offset,
        });
    }

    /// Copy the shared record into the local copy.
    ///
    /// A record whose `config_id` still reads 0 is mid-publication;
    /// spin until the writer's final release store lands.
    pub fn update(&mut self) {
        let Some(binding) = self.binding else {
            return;
        };

        let header = unsafe {
            binding
                .region
                .get::<SharedConfigHeader>(binding.record_offset as usize)
        };
        while header.config_id.load(Ordering::Acquire) == 0 {
            spin_loop();
        }

        let payload = unsafe {
            binding.region.bytes(
                binding.record_offset as usize + SHARED_CONFIG_HEADER_SIZE as usize,
                header.payload_size as usize,
            )
        };
        self.local.update_from(payload);
    }
}
