//! Handler tables for message dispatch.
//!
//! The reader indexes the table with `codegen_type_index - 1`, checks the
//! entry's expected type hash against the frame, and hands the payload to
//! the handler. Handlers return `false` when variable-length verification
//! fails, which the channel treats like any other invalid frame. The table
//! is a plain value passed into `process_messages`; nothing is registered
//! globally.

use crate::messages::ShmMessage;

/// Handler invoked with a claimed frame's payload bytes.
pub type HandlerFn = Box<dyn Fn(&[u8]) -> bool + Send + Sync>;

/// One dispatch-table slot.
pub struct DispatchEntry {
    /// Content hash of the codegen type this slot accepts.
    pub expected_hash: u64,
    /// Payload handler; returns false if the payload fails verification.
    pub handler: HandlerFn,
}

impl DispatchEntry {
    pub fn new(expected_hash: u64, handler: HandlerFn) -> Self {
        Self {
            expected_hash,
            handler,
        }
    }

    /// Entry accepting message type `M`, placed at index `M::TYPE_INDEX - 1`.
    pub fn for_message<M, F>(handler: F) -> Self
    where
        M: ShmMessage,
        F: Fn(&[u8]) -> bool + Send + Sync + 'static,
    {
        Self::new(M::TYPE_HASH, Box::new(handler))
    }

    /// Entry that accepts nothing; fills unused indices in a table.
    pub fn unused() -> Self {
        Self::new(0, Box::new(|_| false))
    }
}
