//! Descriptor plumbing between the target process and the agent.
//!
//! Anonymous shared-memory regions have no filesystem name, so the only
//! way for the agent to map them is to receive their file descriptors
//! over a Unix domain socket (`SCM_RIGHTS`). Two pieces cooperate:
//!
//! - [`exchange`] — the request/response protocol that carries a region
//!   name as payload and at most one descriptor as ancillary data;
//! - [`watch`] — an inotify sentinel file the agent opens on startup,
//!   telling the target "the agent is up, (re)send your descriptors".
//!
//! A missing agent is never fatal: the target keeps running with its
//! anonymous regions and retries on the next watch event.

pub mod exchange;
pub mod watch;

pub use exchange::{FdExchangeClient, FdExchangeListener, FdRegistry};
pub use watch::WatchFile;
