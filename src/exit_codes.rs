//! Exit code constants and error mapping for the overseer CLI
//!
//! The client surface uses three codes so scripts can distinguish "blocked on
//! a human" from failure: 0 success, 1 operational error, 2 waiting on a
//! pending checkpoint.

use crate::error::HarnessError;

pub mod codes {
    /// Operation completed successfully
    pub const SUCCESS: i32 = 0;

    /// Operational error (schema, invariant, external, protocol)
    pub const OPERATIONAL: i32 = 1;

    /// The agent is suspended on a pending checkpoint
    pub const WAITING_CHECKPOINT: i32 = 2;
}

/// Map a library error to the CLI exit code.
///
/// Every error class is an operational failure from the client's point of
/// view; `WAITING_CHECKPOINT` is not an error and is produced directly by the
/// commands that observe a pending gate.
#[must_use]
pub const fn exit_code_for(_error: &HarnessError) -> i32 {
    codes::OPERATIONAL
}
