//! Errors surfaced by `RpcClient::call`

/// Failure of a logical CRM call.
///
/// An expired access token never appears here: it is resolved by the single
/// refresh-and-retry cycle, and whatever that cycle ends in is reported
/// instead.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// No token set is stored; the install flow has to run first.
    #[error("application is not installed")]
    NotInstalled,

    /// The refresh token was rejected or the token endpoint was unreachable.
    /// Requires reauthorization.
    #[error("token refresh failed: {0}")]
    RefreshFailed(String),

    /// The CRM rejected the call for a reason other than token expiry.
    #[error("CRM API error {code}: {description}")]
    Api { code: String, description: String },

    /// No response was received from the CRM.
    #[error("transport error: {0}")]
    Transport(String),

    #[error("token store unavailable: {0}")]
    StoreUnavailable(String),

    /// The method name would leave the `/rest/` path. Nothing was sent.
    #[error("invalid REST method: {0:?}")]
    InvalidMethod(String),
}

impl Error {
    /// Stable label for metrics and logs.
    pub fn label(&self) -> &'static str {
        match self {
            Error::NotInstalled => "not_installed",
            Error::RefreshFailed(_) => "refresh_failed",
            Error::Api { .. } => "api_error",
            Error::Transport(_) => "transport_error",
            Error::StoreUnavailable(_) => "store_unavailable",
            Error::InvalidMethod(_) => "invalid_method",
        }
    }
}

impl From<crm_auth::Error> for Error {
    fn from(err: crm_auth::Error) -> Self {
        match err {
            crm_auth::Error::StoreUnavailable(msg) => Error::StoreUnavailable(msg),
            crm_auth::Error::RefreshFailed(msg) => Error::RefreshFailed(msg),
        }
    }
}

/// Result alias for RPC operations.
pub type Result<T> = std::result::Result<T, Error>;
