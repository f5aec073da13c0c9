//! Discriminated error kinds shared across the barrier (spec §7).
//!
//! Every error produced by the core carries one of these kinds. Service
//! layers wrap with additional context but never downgrade severity, and no
//! variant embeds key material, pepper bytes, or share contents.

use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BarrierError {
    /// No unseal key could open the active root. Fatal at boot.
    Sealed(String),
    /// Referenced kid does not exist.
    NotFound(String),
    /// JWE integrity tag mismatch.
    Corruption(String),
    /// Concurrent rotation lost the race.
    Conflict(String),
    /// Malformed input, banned algorithm, invalid realm name, etc.
    Invalid(String),
    /// Hash verification mismatch or token validation failure.
    Unauthorized(String),
    /// Transient DB or pool exhaustion; retryable with backoff.
    Unavailable(String),
    /// Invariant violation; caller should trigger process shutdown.
    Fatal(String),
}

impl BarrierError {
    pub fn sealed(msg: impl Into<String>) -> Self {
        Self::Sealed(msg.into())
    }
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }
    pub fn corruption(msg: impl Into<String>) -> Self {
        Self::Corruption(msg.into())
    }
    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }
    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::Invalid(msg.into())
    }
    pub fn unauthorized(msg: impl Into<String>) -> Self {
        Self::Unauthorized(msg.into())
    }
    pub fn unavailable(msg: impl Into<String>) -> Self {
        Self::Unavailable(msg.into())
    }
    pub fn fatal(msg: impl Into<String>) -> Self {
        Self::Fatal(msg.into())
    }

    /// Short kind tag, safe to log or export as a metric label.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Sealed(_) => "sealed",
            Self::NotFound(_) => "not_found",
            Self::Corruption(_) => "corruption",
            Self::Conflict(_) => "conflict",
            Self::Invalid(_) => "invalid",
            Self::Unauthorized(_) => "unauthorized",
            Self::Unavailable(_) => "unavailable",
            Self::Fatal(_) => "fatal",
        }
    }
}

impl fmt::Display for BarrierError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Sealed(m) => write!(f, "sealed: {}", m),
            Self::NotFound(m) => write!(f, "not found: {}", m),
            Self::Corruption(m) => write!(f, "corruption: {}", m),
            Self::Conflict(m) => write!(f, "conflict: {}", m),
            Self::Invalid(m) => write!(f, "invalid: {}", m),
            Self::Unauthorized(m) => write!(f, "unauthorized: {}", m),
            Self::Unavailable(m) => write!(f, "unavailable: {}", m),
            Self::Fatal(m) => write!(f, "fatal: {}", m),
        }
    }
}

impl std::error::Error for BarrierError {}

pub type BarrierResult<T> = Result<T, BarrierError>;
