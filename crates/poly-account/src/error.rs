//! Error types for the account service.

use poly_common::StoreError;
use poly_market::VenueError;
use thiserror::Error;

/// Failures surfaced to callers that require authenticated access.
///
/// Best-effort read paths never return these; they degrade to `None`.
#[derive(Debug, Error)]
pub enum AccountError {
    #[error("Authenticated access unavailable: {0}")]
    MissingCredentials(String),

    #[error("Venue error: {0}")]
    Venue(#[from] VenueError),

    #[error("Storage error: {0}")]
    Store(#[from] StoreError),

    #[error("Invalid private key: {0}")]
    InvalidPrivateKey(String),
}

pub type AccountResult<T> = Result<T, AccountError>;
