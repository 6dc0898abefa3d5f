//! Sweep-level failures
//!
//! Per-source problems never show up here: they are folded into that source's
//! terminal event. Only input and transport failures abort a sweep.

use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum SweepError {
    /// Rejected before any fetch starts.
    #[error("Invalid address: {0}")]
    InvalidAddress(String),
    /// The push channel itself broke.
    #[error("Stream transport failed: {0}")]
    Transport(String),
    /// The synchronous full sweep failed too. Safe to retry.
    #[error("Valuation sweep failed, please retry: {0}")]
    FallbackFailed(String),
}
