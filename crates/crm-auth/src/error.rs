//! Error types for token persistence and refresh

/// Errors from the token store and token refresher.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The backing medium could not be read or written.
    #[error("token store unavailable: {0}")]
    StoreUnavailable(String),

    /// The identity provider did not issue a new token pair.
    #[error("token refresh failed: {0}")]
    RefreshFailed(String),
}

/// Result alias for auth operations.
pub type Result<T> = std::result::Result<T, Error>;
