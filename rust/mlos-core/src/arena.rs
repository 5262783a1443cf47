//! Bump allocator embedded in a shared memory region.
//!
//! The allocator never frees. Each allocation is prefixed by an
//! [`AllocationEntry`] linking it to its neighbors, so the set of live
//! allocations is walkable from either end for diagnostics. All offsets
//! are region-relative and 64-byte aligned; offset 0 means "none" (the
//! region header lives there, never an allocation).
//!
//! Not thread safe: the dictionary is the only caller and registration is
//! serialized (see DESIGN.md).

use core::mem::size_of;

use mlos_primitives::Region;
use mlos_primitives::position::align64;

use crate::error::Error;

/// Allocator bookkeeping, stored inside the region it allocates from.
#[repr(C)]
pub struct ArenaHeader {
    /// Offset from the region start to this header.
    pub offset_to_allocator: u32,
    /// End of the allocatable range (the region size).
    pub end_offset: u32,
    /// Next free offset.
    pub free_offset: u32,
    /// Number of allocations made.
    pub allocation_count: u32,
    /// Offset of the most recent allocation's entry header, 0 if none.
    pub last_allocation_offset: u32,
}

const _: () = assert!(core::mem::size_of::<ArenaHeader>() == 20);

/// Chain link prefixed to every allocation.
#[repr(C)]
pub struct AllocationEntry {
    pub prev_offset: u32,
    pub next_offset: u32,
}

const _: () = assert!(core::mem::size_of::<AllocationEntry>() == 8);

/// Handle to an arena living inside `region` at `header_offset`.
#[derive(Clone, Copy)]
pub struct Arena {
    region: Region,
    header_offset: u32,
}

impl Arena {
    /// Initialize a fresh arena.
    ///
    /// # Safety
    ///
    /// The header bytes at `header_offset` must be exclusively owned and
    /// zeroed; `first_allocation_offset..end_offset` must lie within the
    /// region and not overlap any live structure.
    pub unsafe fn init(
        region: Region,
        header_offset: u32,
        first_allocation_offset: u32,
        end_offset: u32,
    ) -> Self {
        debug_assert!(end_offset as usize <= region.len());

        let header = unsafe { region.get_mut::<ArenaHeader>(header_offset as usize) };
        header.offset_to_allocator = header_offset;
        header.end_offset = end_offset;
        header.free_offset = align64(first_allocation_offset);
        header.allocation_count = 0;
        header.last_allocation_offset = 0;

        Self {
            region,
            header_offset,
        }
    }

    /// Attach to an arena some process already initialized.
    ///
    /// # Safety
    ///
    /// A valid `ArenaHeader` must live at `header_offset`.
    pub unsafe fn attach(region: Region, header_offset: u32) -> Self {
        debug_assert!(
            unsafe { region.get::<ArenaHeader>(header_offset as usize) }.offset_to_allocator
                == header_offset
        );
        Self {
            region,
            header_offset,
        }
    }

    #[inline]
    pub fn header(&self) -> &ArenaHeader {
        unsafe { self.region.get::<ArenaHeader>(self.header_offset as usize) }
    }

    #[inline]
    #[allow(clippy::mut_from_ref)]
    fn header_mut(&self) -> &mut ArenaHeader {
        unsafe { self.region.get_mut::<ArenaHeader>(self.header_offset as usize) }
    }

    /// Allocate `size` bytes; returns the region-relative offset of the
    /// usable bytes (just past the chain entry).
    pub fn allocate(&self, size: usize) -> Result<u32, Error> {
        let rounded = align64(size as u32 + size_of::<AllocationEntry>() as u32);

        let header = self.header_mut();
        if header.free_offset + rounded > header.end_offset {
            return Err(Error::OutOfMemory);
        }

        let entry_offset = header.free_offset;
        header.free_offset += rounded;
        header.allocation_count += 1;

        if header.last_allocation_offset != 0 {
            let previous = unsafe {
                self.region
                    .get_mut::<AllocationEntry>(header.last_allocation_offset as usize)
            };
            previous.next_offset = entry_offset;
        }

        let entry = unsafe { self.region.get_mut::<AllocationEntry>(entry_offset as usize) };
        entry.prev_offset = header.last_allocation_offset;
        entry.next_offset = 0;

        header.last_allocation_offset = entry_offset;

        Ok(entry_offset + size_of::<AllocationEntry>() as u32)
    }

    /// The chain entry at `entry_offset`.
    pub fn entry(&self, entry_offset: u32) -> &AllocationEntry {
        unsafe { self.region.get::<AllocationEntry>(entry_offset as usize) }
    }

    /// Walk the allocation chain backward from the most recent entry.
    pub fn walk_back(&self) -> impl Iterator<Item = u32> + '_ {
        let mut current = self.header().last_allocation_offset;
        core::iter::from_fn(move || {
            if current == 0 {
                return None;
            }
            let offset = current;
            current = self.entry(offset).prev_offset;
            Some(offset)
        })
    }
}
