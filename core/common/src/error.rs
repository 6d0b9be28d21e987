//! Common error types for Driveline.

use thiserror::Error;

/// Top-level error type for Driveline operations.
#[derive(Debug, Error)]
pub enum Error {
    /// The subject never completed the authorization flow.
    #[error("No credential stored for {0}; run the authorization flow")]
    NoCredential(String),

    /// The stored credential expired and cannot be renewed.
    #[error("No refresh token stored for {0}; repeat the consent flow")]
    NoRefreshToken(String),

    /// The provider rejected a refresh; the grant is stale or revoked.
    #[error("Token refresh failed for {subject}: {reason}")]
    RefreshFailed { subject: String, reason: String },

    /// The static service credential could not be established at startup.
    #[error("Service identity unavailable: {0}")]
    ServiceIdentityUnavailable(String),

    /// The authorization-code exchange failed.
    #[error("Provider code exchange failed: {0}")]
    ProviderExchange(String),

    /// A storage provider call failed.
    #[error("Storage backend error: {0}")]
    Storage(String),

    /// The storage provider reported that the object does not exist.
    #[error("Remote object not found: {0}")]
    RemoteNotFound(String),

    /// No local metadata exists for the referenced object.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Invalid input provided.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Local database operation failed.
    #[error("Database error: {0}")]
    Database(String),

    /// Serialization or deserialization failed.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// I/O operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Whether the caller has to send the subject through the consent flow
    /// again before any further call can succeed.
    pub fn requires_reauthorization(&self) -> bool {
        matches!(
            self,
            Error::NoCredential(_) | Error::NoRefreshToken(_) | Error::RefreshFailed { .. }
        )
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

/// Result type alias using the common Error.
pub type Result<T> = std::result::Result<T, Error>;
