//! Error types for the escrow engine
//!
//! One variant per failure class: validation, authorization, state,
//! conflict, external service, expiry, plus storage/crypto/config
//! infrastructure errors.

use thiserror::Error;

/// Main error type for escrow operations
#[derive(Error, Debug)]
pub enum EscrowError {
    /// Malformed or missing input
    #[error("Validation error: {0}")]
    Validation(String),

    /// Caller is not a participant or not the required role
    #[error("Authorization error: {0}")]
    Authorization(String),

    /// Action is invalid for the escrow's current status
    #[error("Invalid state: escrow {escrow_id} is {status}: {reason}")]
    State {
        escrow_id: u64,
        status: String,
        reason: String,
    },

    /// Duplicate vote, duplicate payout, or role slot already filled
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Settlement network unavailable or reported failure
    #[error("Settlement network error: {0}")]
    ExternalService(String),

    /// Escrow passed its deadline
    #[error("Escrow {0} has expired")]
    Expired(u64),

    /// Rate limit exceeded for an identity
    #[error("Rate limited: {0}")]
    RateLimited(String),

    /// Requested escrow does not exist
    #[error("Escrow {0} not found")]
    NotFound(u64),

    /// Ledger storage errors
    #[error("Storage error: {0}")]
    Storage(String),

    /// Secret vault encryption/decryption errors
    #[error("Crypto error: {0}")]
    Crypto(String),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// General internal errors
    #[error("Internal error: {0}")]
    Internal(String),
}

impl EscrowError {
    /// Create a validation error
    pub fn validation<S: Into<String>>(msg: S) -> Self {
        Self::Validation(msg.into())
    }

    /// Create an authorization error
    pub fn authorization<S: Into<String>>(msg: S) -> Self {
        Self::Authorization(msg.into())
    }

    /// Create a state error
    pub fn state<S: Into<String>>(escrow_id: u64, status: S, reason: S) -> Self {
        Self::State {
            escrow_id,
            status: status.into(),
            reason: reason.into(),
        }
    }

    /// Create a conflict error
    pub fn conflict<S: Into<String>>(msg: S) -> Self {
        Self::Conflict(msg.into())
    }

    /// Create an external service error
    pub fn external<S: Into<String>>(msg: S) -> Self {
        Self::ExternalService(msg.into())
    }

    /// Create a storage error
    pub fn storage<S: Into<String>>(msg: S) -> Self {
        Self::Storage(msg.into())
    }

    /// Create a crypto error
    pub fn crypto<S: Into<String>>(msg: S) -> Self {
        Self::Crypto(msg.into())
    }

    /// Create a configuration error
    pub fn config<S: Into<String>>(msg: S) -> Self {
        Self::Config(msg.into())
    }

    /// Create an internal error
    pub fn internal<S: Into<String>>(msg: S) -> Self {
        Self::Internal(msg.into())
    }
}

impl From<heed::Error> for EscrowError {
    fn from(e: heed::Error) -> Self {
        Self::Storage(e.to_string())
    }
}

impl From<bincode::Error> for EscrowError {
    fn from(e: bincode::Error) -> Self {
        Self::Storage(e.to_string())
    }
}
