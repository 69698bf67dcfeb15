//! Token lifecycle for the CRM gateway
//!
//! Persists the tenant's single OAuth `TokenSet` and exchanges refresh tokens
//! for new ones. The RPC layer composes the two:
//! 1. `TokenStore::load()` before every call
//! 2. `TokenRefresher::refresh()` when the CRM reports an expired token
//! 3. `TokenStore::save()` with the refreshed set before the single retry

pub mod constants;
pub mod error;
pub mod refresh;
pub mod store;

pub use constants::*;
pub use error::{Error, Result};
pub use refresh::{OAuthRefresher, TokenRefresher, TokenResponse};
pub use store::{FileTokenStore, MemoryTokenStore, TokenSet, TokenStore};
