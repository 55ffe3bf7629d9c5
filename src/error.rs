//! Error taxonomy for the engine's public surface.
//!
//! Synchronous command handlers (§6/§7) return [`EngineError`] so callers can
//! pattern-match on the taxonomy. Internal plumbing that never crosses the
//! public boundary uses `anyhow::Result` with `.context(..)`, same as the
//! rest of the crate's ambient style.

use thiserror::Error;

/// Errors surfaced from the engine's public command and query methods.
///
/// Mirrors the taxonomy in the error-handling design: validation and
/// not-found/authorization failures are fatal to the call but never mutate
/// state; conflicting committed/blocked windows are returned as data from
/// `Engine::declare_availability` rather than raised as an error; transient
/// and fatal errors are reserved for internal plumbing that chooses to
/// bubble up instead of swallowing (timers and event handlers swallow
/// instead, see `scheduler.rs`).
#[derive(Debug, Error)]
pub enum EngineError {
    /// Caller supplied invalid input. No state was mutated.
    #[error("validation failed: {0}")]
    Validation(String),

    /// Referenced binding, event, or participant does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// Caller is not authorized to perform the requested action.
    #[error("forbidden: {0}")]
    Forbidden(String),

    /// A persistence write or notification render failed. Retried on the
    /// owning loop's natural cadence; never propagated out of presence-event
    /// handling.
    #[error("transient failure: {0}")]
    Transient(#[source] anyhow::Error),

    /// Unrecoverable, process is shutting down.
    #[error("fatal: {0}")]
    Fatal(#[source] anyhow::Error),
}

impl EngineError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn forbidden(msg: impl Into<String>) -> Self {
        Self::Forbidden(msg.into())
    }

    /// Single-line cause chain, for logging at the top-level event handler.
    pub fn oneliner(&self) -> String {
        match self {
            Self::Transient(e) | Self::Fatal(e) => e
                .chain()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join(": "),
            other => other.to_string(),
        }
    }
}

pub type EngineResult<T> = Result<T, EngineError>;
