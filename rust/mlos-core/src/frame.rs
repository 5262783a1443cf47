//! Frame layout and the single-word state protocol.
//!
//! A frame's entire lifecycle is encoded in the sign and low bit of its
//! signed 32-bit length, so one release-store publishes it:
//!
//! | sign | low bit | meaning                                   |
//! |------|---------|-------------------------------------------|
//! |  +   |   1     | writer mid-write; payload not yet valid   |
//! |  +   |   0     | complete; available for a reader to claim |
//! |  −   |   0     | dispatched; available for reclamation     |
//! |  0   |   —     | virgin slot                               |
//!
//! Reads go through [`FrameState`]; writes go back as the raw integer
//! encoding via the `mark_*` helpers.
//!
//! Frames start at 4-byte-aligned ring offsets, so only the length word
//! is accessed through a reference; the type fields (whose natural
//! alignment is wider) go through unaligned reads and writes.

use mlos_primitives::sync::{AtomicI32, Ordering};

/// Bytes occupied by a frame header at the start of every frame.
pub const FRAME_HEADER_SIZE: u32 = 16;

/// On-the-wire layout of a frame header (little-endian):
///
/// ```text
/// [length: i32][codegen_type_index: u32][codegen_type_hash: u64][payload…]
/// ```
///
/// `codegen_type_index` and `codegen_type_hash` are plain data: the
/// writer owns them exclusively between the mid-write store and the
/// completing release-store on `length`, and readers only look after
/// the matching acquire load.
#[repr(C)]
pub struct FrameHeader {
    pub length: i32,
    pub codegen_type_index: u32,
    pub codegen_type_hash: u64,
}

const _: () = assert!(core::mem::size_of::<FrameHeader>() == FRAME_HEADER_SIZE as usize);

/// Byte offset of `codegen_type_index` within a frame.
const TYPE_INDEX_OFFSET: usize = 4;
/// Byte offset of `codegen_type_hash` within a frame.
const TYPE_HASH_OFFSET: usize = 8;

/// Decoded view of a frame's length word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameState {
    /// Slot never written since region initialization.
    Virgin,
    /// A writer reserved the frame but has not published it.
    MidWrite { length: u32 },
    /// Published and waiting for a reader to claim it.
    Complete { length: u32 },
    /// Dispatched; the free-reclaim pass may advance past it.
    Reclaimable { length: u32 },
}

impl FrameState {
    /// Decode a raw length word.
    #[inline]
    pub fn from_raw(raw: i32) -> Self {
        if raw == 0 {
            FrameState::Virgin
        } else if raw < 0 {
            FrameState::Reclaimable {
                length: raw.unsigned_abs(),
            }
        } else if raw & 1 == 1 {
            FrameState::MidWrite {
                length: (raw & !1) as u32,
            }
        } else {
            FrameState::Complete { length: raw as u32 }
        }
    }
}

/// Reserve a frame: `virgin → mid-write`.
#[inline]
pub fn mark_in_progress(length: &AtomicI32, frame_len: i32) {
    length.store(frame_len | 1, Ordering::Release);
}

/// Publish a frame to readers: `mid-write → complete`.
#[inline]
pub fn mark_ready(length: &AtomicI32, frame_len: i32) {
    length.store(frame_len, Ordering::Release);
}

/// Release a frame for reclamation: `complete → reclaim-ready`.
#[inline]
pub fn mark_for_cleanup(length: &AtomicI32, frame_len: i32) {
    length.store(-frame_len, Ordering::Release);
}

/// Write the type identity fields of a frame under construction.
///
/// # Safety
///
/// `frame` must point at the start of a frame the calling writer
/// currently owns (between `mark_in_progress` and `mark_ready`), with
/// at least [`FRAME_HEADER_SIZE`] addressable bytes.
#[inline]
pub unsafe fn write_type(frame: *mut u8, type_index: u32, type_hash: u64) {
    unsafe {
        (frame.add(TYPE_INDEX_OFFSET) as *mut u32).write_unaligned(type_index.to_le());
        (frame.add(TYPE_HASH_OFFSET) as *mut u64).write_unaligned(type_hash.to_le());
    }
}

/// Read the type identity fields of a claimed frame.
///
/// # Safety
///
/// `frame` must point at the start of a frame the calling reader has
/// claimed via the read-position CAS after observing a complete length.
#[inline]
pub unsafe fn read_type(frame: *const u8) -> (u32, u64) {
    unsafe {
        (
            u32::from_le((frame.add(TYPE_INDEX_OFFSET) as *const u32).read_unaligned()),
            u64::from_le((frame.add(TYPE_HASH_OFFSET) as *const u64).read_unaligned()),
        )
    }
}
