//! Building blocks for the MLOS shared-memory fabric.
//!
//! The crate is split into two layers:
//!
//! - address-space-neutral views (`region`, `position`, `sync`) that work
//!   over any byte range, shared or not;
//! - OS-level owners (`shmem`, `semaphore`) that wrap POSIX shared memory
//!   objects and named semaphores with explicit lifecycle control.
//!
//! Nothing in here knows about frames, channels, or dictionaries; those
//! live in `mlos-core`.

pub mod position;
pub mod region;
pub mod semaphore;
pub mod shmem;
pub mod sync;

pub use region::{HeapRegion, Region};
pub use semaphore::NamedSemaphore;
pub use shmem::{CreateDisposition, SharedMemoryMap};
