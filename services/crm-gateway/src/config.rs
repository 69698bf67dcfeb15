//! Configuration types and loading
//!
//! Config precedence: CLI args > env vars > config file > defaults.
//! The client secret is loaded from CRM_CLIENT_SECRET or client_secret_file,
//! never stored in the TOML directly to avoid leaking secrets.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use common::Secret;
use crm_rpc::Placement;
use serde::Deserialize;

/// Root configuration
#[derive(Debug, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub oauth: OAuthConfig,
    pub store: StoreConfig,
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub placements: Vec<Placement>,
}

/// HTTP listener settings
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    pub listen_addr: SocketAddr,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
}

/// OAuth application credentials
#[derive(Debug, Deserialize)]
pub struct OAuthConfig {
    #[serde(default)]
    pub client_id: String,
    #[serde(skip)]
    pub client_secret: Option<Secret<String>>,
    /// Path to a file containing the client secret (alternative to CRM_CLIENT_SECRET)
    #[serde(default)]
    pub client_secret_file: Option<PathBuf>,
    #[serde(default = "default_token_endpoint")]
    pub token_endpoint: String,
}

/// Token persistence settings
#[derive(Debug, Deserialize)]
pub struct StoreConfig {
    pub path: PathBuf,
}

/// Tenant API settings
#[derive(Debug, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_scheme")]
    pub scheme: String,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            scheme: default_scheme(),
        }
    }
}

fn default_max_connections() -> usize {
    256
}

fn default_token_endpoint() -> String {
    crm_auth::TOKEN_ENDPOINT.to_string()
}

fn default_scheme() -> String {
    "https".to_string()
}

impl Config {
    /// Load configuration from a TOML file, then overlay environment variables.
    ///
    /// Client id: CRM_CLIENT_ID env var, then `oauth.client_id`.
    /// Client secret: CRM_CLIENT_SECRET env var, then `oauth.client_secret_file`.
    pub fn load(path: &Path) -> common::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let mut config: Config = toml::from_str(&contents)?;

        if let Ok(id) = std::env::var("CRM_CLIENT_ID") {
            config.oauth.client_id = id;
        }

        if let Ok(secret) = std::env::var("CRM_CLIENT_SECRET") {
            config.oauth.client_secret = Some(Secret::new(secret));
        } else if let Some(ref secret_file) = config.oauth.client_secret_file {
            let secret = std::fs::read_to_string(secret_file).map_err(|e| {
                common::Error::Config(format!(
                    "failed to read client_secret_file {}: {e}",
                    secret_file.display()
                ))
            })?;
            let secret = secret.trim().to_owned();
            if !secret.is_empty() {
                config.oauth.client_secret = Some(Secret::new(secret));
            }
        }

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> common::Result<()> {
        if self.oauth.client_id.trim().is_empty() {
            return Err(common::Error::Missing("oauth.client_id"));
        }

        match &self.oauth.client_secret {
            Some(secret) if !secret.is_blank() => {}
            _ => return Err(common::Error::Missing("oauth.client_secret")),
        }

        if !self.oauth.token_endpoint.starts_with("http://")
            && !self.oauth.token_endpoint.starts_with("https://")
        {
            return Err(common::Error::Config(format!(
                "token_endpoint must start with http:// or https://, got: {}",
                self.oauth.token_endpoint
            )));
        }

        if self.api.scheme != "http" && self.api.scheme != "https" {
            return Err(common::Error::Config(format!(
                "api.scheme must be http or https, got: {}",
                self.api.scheme
            )));
        }

        if self.server.max_connections == 0 {
            return Err(common::Error::Config(
                "max_connections must be greater than 0".into(),
            ));
        }

        for placement in &self.placements {
            if placement.placement.is_empty() || placement.handler.is_empty() {
                return Err(common::Error::Config(
                    "placements need both placement and handler".into(),
                ));
            }
        }

        Ok(())
    }

    /// Resolve config file path from CLI arg or CONFIG_PATH env var.
    pub fn resolve_path(cli_path: Option<&str>) -> PathBuf {
        if let Some(p) = cli_path {
            return PathBuf::from(p);
        }
        if let Ok(p) = std::env::var("CONFIG_PATH") {
            return PathBuf::from(p);
        }
        PathBuf::from("crm-gateway.toml")
    }
}
