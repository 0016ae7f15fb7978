//! Error types for the dispersal engine

use thiserror::Error;

/// Main error type for the disperser
#[derive(Error, Debug)]
pub enum DisperserError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Intent not found: {intent_id}")]
    IntentNotFound { intent_id: String },

    #[error("Chain configuration not found for chain {chain_id}")]
    ChainNotFound { chain_id: u64 },

    #[error("Intent {intent_id} has no allocation for chain {chain_id}")]
    UnknownChain { intent_id: String, chain_id: u64 },

    #[error("Chain connection error for chain {chain_id}: {message}")]
    ChainConnection { chain_id: u64, message: String },

    #[error("Dispatch failed on chain {chain_id}: {reason}")]
    Dispatch { chain_id: u64, reason: String },

    #[error("Timed out after {timeout_secs}s waiting for {tx_hash} on chain {chain_id}")]
    ConfirmationTimeout {
        chain_id: u64,
        tx_hash: String,
        timeout_secs: u64,
    },

    #[error("Transaction {tx_hash} reverted on chain {chain_id} in block {block_number}")]
    TransactionReverted {
        chain_id: u64,
        tx_hash: String,
        block_number: u64,
    },

    #[error("Concurrent update conflict on intent {intent_id} after {attempts} attempts")]
    StoreConflict { intent_id: String, attempts: u32 },

    #[error("Internal error: {0}")]
    Internal(String),
}

impl DisperserError {
    /// Check if error is retryable
    pub fn is_retryable(&self) -> bool {
        match self {
            DisperserError::StoreConflict { .. } | DisperserError::ChainConnection { .. } => true,
            DisperserError::Database(e) => matches!(
                e,
                sqlx::Error::PoolTimedOut | sqlx::Error::Io(_) | sqlx::Error::Protocol(_)
            ),
            _ => false,
        }
    }

    /// Errors that no amount of retrying will clear
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            DisperserError::IntentNotFound { .. }
                | DisperserError::UnknownChain { .. }
                | DisperserError::Validation(_)
        )
    }

    /// Check if error should trigger an alert
    ///
    /// Both cases mean funds already left escrow but the outcome is unknown
    /// or negative, so an operator has to look at it.
    pub fn should_alert(&self) -> bool {
        matches!(
            self,
            DisperserError::TransactionReverted { .. } | DisperserError::ConfirmationTimeout { .. }
        )
    }

    /// Stable machine-readable code used by the API error body
    pub fn code(&self) -> &'static str {
        match self {
            DisperserError::Validation(_) => "VALIDATION_ERROR",
            DisperserError::IntentNotFound { .. } => "NOT_FOUND",
            DisperserError::StoreConflict { .. } => "CONFLICT",
            _ => "INTERNAL_ERROR",
        }
    }
}

/// Result type for disperser operations
pub type DisperserResult<T> = Result<T, DisperserError>;
