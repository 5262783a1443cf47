//! Open-addressed dictionary of shared config records.
//!
//! The dictionary is a fixed `UIntArray` of slots, each holding the
//! region-relative offset of a record allocated from the embedded arena
//! (0 = empty). Probing is linear over the FNV-1a hash of the record's
//! key view. Records are created once and never deleted; publication is
//! a release store of `config_id`, and readers treat `config_id == 0` as
//! "serialization still in flight".
//!
//! Writes are not internally synchronized: each key is registered from at
//! most one thread (the target's registration path), while the agent only
//! reads.

use core::mem::size_of;

use mlos_primitives::Region;
use mlos_primitives::sync::{AtomicU32, Ordering};

use crate::arena::{Arena, ArenaHeader};
use crate::config::{ComponentConfig, ConfigRecord};
use crate::error::Error;

/// Slots in a freshly created dictionary.
pub const DEFAULT_SLOT_COUNT: u32 = 2048;

/// Bytes of [`SharedConfigHeader`] preceding every record payload.
pub const SHARED_CONFIG_HEADER_SIZE: u32 = 32;

/// Header of every record in the dictionary.
///
/// `config_id` doubles as the publication flag: it is stored (release)
/// last, after the payload, and stays at its creation value of 1 for the
/// rest of the run.
#[repr(C)]
pub struct SharedConfigHeader {
    pub config_id: AtomicU32,
    pub codegen_type_index: u32,
    pub payload_size: u32,
    _reserved: [u32; 5],
}

#[cfg(not(loom))]
const _: () = assert!(
    core::mem::size_of::<SharedConfigHeader>() == SHARED_CONFIG_HEADER_SIZE as usize
);

/// Dictionary bookkeeping embedded in a region: the arena it allocates
/// from, then the offset of its slot array.
#[repr(C)]
pub struct DictionaryHeader {
    pub allocator: ArenaHeader,
    pub offset_to_slot_array: u32,
}

const _: () = assert!(core::mem::size_of::<DictionaryHeader>() == 24);

/// Outcome of `create_or_update`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigDisposition {
    /// No record with this key existed; the default was published.
    Created,
    /// A record existed; the local copy was refreshed from it.
    Existing,
}

/// Handle to a dictionary living inside `region` at `dict_offset`.
#[derive(Clone, Copy)]
pub struct SharedConfigDictionary {
    region: Region,
    dict_offset: u32,
}

impl SharedConfigDictionary {
    /// Initialize a fresh dictionary whose arena may allocate up to
    /// `end_offset`.
    ///
    /// # Safety
    ///
    /// The bytes from `dict_offset` to `end_offset` must be exclusively
    /// owned and zeroed.
    pub unsafe fn init(
        region: Region,
        dict_offset: u32,
        end_offset: u32,
        slot_count: u32,
    ) -> Result<Self, Error> {
        let arena = unsafe {
            Arena::init(
                region,
                dict_offset,
                dict_offset + size_of::<DictionaryHeader>() as u32,
                end_offset,
            )
        };

        // UIntArray { count, elems[count] }.
        let array_offset = arena.allocate(4 + slot_count as usize * 4)?;
        unsafe { *region.get_mut::<u32>(array_offset as usize) = slot_count };

        let header = unsafe { region.get_mut::<DictionaryHeader>(dict_offset as usize) };
        header.offset_to_slot_array = array_offset;

        Ok(Self {
            region,
            dict_offset,
        })
    }

    /// Attach to a dictionary some process already initialized.
    ///
    /// # Safety
    ///
    /// A valid `DictionaryHeader` must live at `dict_offset`.
    pub unsafe fn attach(region: Region, dict_offset: u32) -> Self {
        Self {
            region,
            dict_offset,
        }
    }

    fn arena(&self) -> Arena {
        unsafe { Arena::attach(self.region, self.dict_offset) }
    }

    fn header(&self) -> &DictionaryHeader {
        unsafe { self.region.get::<DictionaryHeader>(self.dict_offset as usize) }
    }

    fn slots(&self) -> &[AtomicU32] {
        let array_offset = self.header().offset_to_slot_array as usize;
        let count = unsafe { *self.region.get::<u32>(array_offset) } as usize;
        unsafe {
            core::slice::from_raw_parts(self.region.offset(array_offset + 4) as *const AtomicU32, count)
        }
    }

    /// Number of slots holding a record offset.
    pub fn occupied_slots(&self) -> usize {
        self.slots()
            .iter()
            .filter(|slot| slot.load(Ordering::Acquire) != 0)
            .count()
    }

    /// Bind `config` to the record with its key, publishing the local
    /// copy as the record if none exists yet. When a record exists, the
    /// stored value wins: the local copy is refreshed from shared memory.
    pub fn create_or_update<T: ConfigRecord>(
        &self,
        config: &mut ComponentConfig<T>,
    ) -> Result<ConfigDisposition, Error> {
        match self.probe(config)? {
            ProbeResult::Found => Ok(ConfigDisposition::Existing),
            ProbeResult::Empty(slot_index) => {
                let record_offset = self.publish(config)?;
                self.slots()[slot_index].store(record_offset, Ordering::Release);
                config.bind(self.region, record_offset);
                Ok(ConfigDisposition::Created)
            }
        }
    }

    /// Bind `config` to an existing record; `NotFound` without mutation
    /// when no record with its key exists.
    pub fn lookup<T: ConfigRecord>(&self, config: &mut ComponentConfig<T>) -> Result<(), Error> {
        match self.probe(config)? {
            ProbeResult::Found => Ok(()),
            ProbeResult::Empty(_) => Err(Error::NotFound),
        }
    }

    fn probe<T: ConfigRecord>(
        &self,
        config: &mut ComponentConfig<T>,
    ) -> Result<ProbeResult, Error> {
        let slots = self.slots();
        let slot_count = slots.len() as u64;
        let key_hash = config.local().key_hash();

        for probe in 0..slot_count {
            let slot_index = ((key_hash.wrapping_add(probe)) % slot_count) as usize;

            let record_offset = slots[slot_index].load(Ordering::Acquire);
            if record_offset == 0 {
                return Ok(ProbeResult::Empty(slot_index));
            }

            let header = unsafe {
                self.region
                    .get::<SharedConfigHeader>(record_offset as usize)
            };
            if header.codegen_type_index == T::TYPE_INDEX {
                let payload = unsafe {
                    self.region.bytes(
                        record_offset as usize + SHARED_CONFIG_HEADER_SIZE as usize,
                        header.payload_size as usize,
                    )
                };
                if config.local().compare_key(payload) {
                    config.bind(self.region, record_offset);
                    config.update();
                    return Ok(ProbeResult::Found);
                }
            }
        }

        // Every slot occupied by other keys.
        Err(Error::OutOfMemory)
    }

    /// Allocate and serialize a record, publishing it with the final
    /// `config_id` store.
    fn publish<T: ConfigRecord>(&self, config: &ComponentConfig<T>) -> Result<u32, Error> {
        let payload_size = config.local().serialized_size();
        let record_offset = self
            .arena()
            .allocate(SHARED_CONFIG_HEADER_SIZE as usize + payload_size)?;

        let payload = unsafe {
            self.region.bytes_mut(
                record_offset as usize + SHARED_CONFIG_HEADER_SIZE as usize,
                payload_size,
            )
        };
        config.local().serialize(payload);

        let header = unsafe {
            self.region
                .get_mut::<SharedConfigHeader>(record_offset as usize)
        };
        header.codegen_type_index = T::TYPE_INDEX;
        header.payload_size = payload_size as u32;
        // Publish: readers retry while config_id is 0.
        header.config_id.store(1, Ordering::Release);

        Ok(record_offset)
    }
}

enum ProbeResult {
    Found,
    Empty(usize),
}
