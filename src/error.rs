//! Crate-wide error type.
//!
//! Every public operation in this crate returns [`Result`]. The variants mirror the
//! error kinds a workflow caller can observe, per the error-handling design: invalid
//! arguments, an unexpected queue/state shutdown, a per-run timeout, and a peer (process
//! or adapter) disappearing. Ambient I/O and join failures are wrapped rather than
//! swallowed so their root cause survives in logs.

use thiserror::Error;

/// Errors surfaced by this crate's public API.
#[derive(Debug, Error)]
pub enum Error {
    /// A workflow was asked to operate on an input or corpus that cannot satisfy its
    /// precondition (e.g. `minimize`/`cleanse` on an input that does not trigger a fault,
    /// or `merge` with a faulting seed input).
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// An internal queue closed, or state transitioned, in a way no workflow expects.
    #[error("bad state: {0}")]
    BadState(String),

    /// A per-run deadline elapsed before every process proxy responded.
    #[error("run timed out")]
    Timeout,

    /// A target process or the target adapter disconnected unexpectedly.
    #[error("peer closed (target_id={0:#x})")]
    PeerClosed(u64),

    /// The running workflow was asked to stop and did so cleanly.
    #[error("stopped")]
    Stopped,

    /// Ambient I/O failure (corpus load, shared-memory mapping, process spawn, ...).
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// A spawned task failed to join.
    #[error("task join failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// Convenience alias used throughout this crate.
pub type Result<T> = std::result::Result<T, Error>;
