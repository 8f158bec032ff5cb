//! Error types for fqdn-identity.

use thiserror::Error;

/// Errors that can occur while turning DNS observations into identities.
#[derive(Debug, Error)]
pub enum FqdnError {
    /// Identity allocation failed.
    #[error("Identity allocation failed: {0}")]
    Allocator(#[from] AllocatorError),

    /// Selector could not be compiled into a matcher.
    #[error("Invalid FQDN selector {selector}: {reason}")]
    InvalidSelector {
        /// Selector as given by the policy layer.
        selector: String,
        /// Why it was rejected.
        reason: String,
    },

    /// DNS message could not be decoded or carried no usable question.
    #[error("Malformed DNS message: {0}")]
    MalformedMessage(String),

    /// The caller's deadline passed before the message was fully processed.
    #[error("Deadline exceeded while processing DNS response")]
    DeadlineExceeded,

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    Config(String),
}

/// Errors reported by an identity allocator.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AllocatorError {
    /// Every identity in the local range is in use.
    #[error("identity range exhausted ({size} identities starting at {start})")]
    Exhausted {
        /// First identity of the range.
        start: u32,
        /// Number of identities in the range.
        size: u32,
    },

    /// Allocator backend is not reachable.
    #[error("allocator unavailable: {0}")]
    Unavailable(String),
}
