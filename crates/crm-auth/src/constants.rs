//! CRM OAuth constants
//!
//! Endpoint and wire vocabulary of the CRM's identity provider. The client
//! credentials themselves come from process configuration, never from here.

/// Default token endpoint for refresh-token grants
pub const TOKEN_ENDPOINT: &str = "https://oauth.bitrix.info/oauth/token/";

/// Key under which the single TokenSet record is persisted
pub const TOKEN_STORE_KEY: &str = "tokens";

/// Grant type sent on every refresh request
pub const REFRESH_GRANT_TYPE: &str = "refresh_token";
