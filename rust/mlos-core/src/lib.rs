//! Inter-process telemetry and control fabric over shared memory.
//!
//! An instrumented application (the *target*) and an out-of-process
//! *agent* exchange typed messages through lock-free ring buffers living
//! in memory regions both processes have mapped. Messages carry
//! self-describing type indices and hashes, so the receiving side
//! dispatches them through a plain handler table without any RPC
//! framework.
//!
//! The pieces, bottom up:
//!
//! - [`arena`] — bump allocator embedded in a shared region;
//! - [`dictionary`] — open-addressed hash table of published config
//!   records, backed by the arena;
//! - [`layout`] — region headers, ids, names, and the global region;
//! - [`frame`] / [`channel`] — the ring-buffer frame protocol and the
//!   multi-producer/multi-consumer channel built on it;
//! - [`wake`] — how readers sleep and writers wake them;
//! - [`context`] — the composition root owning the standard regions, the
//!   control and feedback channels, and the shared-config dictionary.

pub mod arena;
pub mod bootstrap;
pub mod channel;
pub mod config;
pub mod context;
pub mod dictionary;
pub mod dispatch;
pub mod error;
pub mod frame;
pub mod hash;
pub mod layout;
pub mod messages;
pub mod records;
pub mod wake;

pub use channel::{ChannelSync, SendStatus, SharedChannel};
pub use config::{ComponentConfig, ConfigRecord};
pub use context::MlosContext;
pub use dictionary::{ConfigDisposition, SharedConfigDictionary};
pub use dispatch::DispatchEntry;
pub use error::Error;
pub use messages::ShmMessage;
pub use wake::{ChannelWake, InProcessWake, SemaphoreWake, WakePolicy};
