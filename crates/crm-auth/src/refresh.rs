//! OAuth refresh-token grant
//!
//! One POST to the identity provider's token endpoint per refresh. Any
//! failure (transport, non-2xx, OAuth error body, incomplete token pair) is
//! `RefreshFailed`: the caller's in-flight call cannot recover and the tenant
//! has to reauthorize out of band.

use std::future::Future;
use std::pin::Pin;

use common::Secret;
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::constants::{REFRESH_GRANT_TYPE, TOKEN_ENDPOINT};
use crate::error::{Error, Result};
use crate::store::TokenSet;

/// Token endpoint response. Every field is optional on the wire so a
/// half-filled body can be reported precisely instead of as a parse error.
#[derive(Debug, Default, Deserialize)]
pub struct TokenResponse {
    #[serde(default)]
    pub access_token: Option<String>,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub domain: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub error_description: Option<String>,
}

impl TokenResponse {
    /// Turn a response into a `TokenSet`, rejecting error bodies and
    /// incomplete pairs.
    pub fn into_token_set(self) -> Result<TokenSet> {
        if let Some(code) = self.error {
            return Err(Error::RefreshFailed(describe(
                &code,
                self.error_description.as_deref(),
            )));
        }

        let access_token = non_empty(self.access_token, "access_token")?;
        let refresh_token = non_empty(self.refresh_token, "refresh_token")?;
        let domain = non_empty(self.domain, "domain")?;

        Ok(TokenSet {
            access_token,
            refresh_token,
            domain,
        })
    }
}

fn non_empty(value: Option<String>, field: &str) -> Result<String> {
    match value {
        Some(v) if !v.trim().is_empty() => Ok(v),
        _ => Err(Error::RefreshFailed(format!(
            "token response missing {field}"
        ))),
    }
}

fn describe(code: &str, description: Option<&str>) -> String {
    match description {
        Some(d) if !d.is_empty() => format!("{code}: {d}"),
        _ => code.to_string(),
    }
}

/// Exchanges a refresh token for a new `TokenSet`.
pub trait TokenRefresher: Send + Sync {
    fn refresh<'a>(
        &'a self,
        refresh_token: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<TokenSet>> + Send + 'a>>;
}

/// Refresher for the CRM's OAuth server, holding the app's client credentials.
pub struct OAuthRefresher {
    client: reqwest::Client,
    endpoint: String,
    client_id: String,
    client_secret: Secret<String>,
}

impl OAuthRefresher {
    /// Refresher against the default `TOKEN_ENDPOINT`.
    pub fn new(client: reqwest::Client, client_id: String, client_secret: Secret<String>) -> Self {
        Self::with_endpoint(client, TOKEN_ENDPOINT.to_string(), client_id, client_secret)
    }

    pub fn with_endpoint(
        client: reqwest::Client,
        endpoint: String,
        client_id: String,
        client_secret: Secret<String>,
    ) -> Self {
        Self {
            client,
            endpoint,
            client_id,
            client_secret,
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn request(&self, refresh_token: &str) -> Result<TokenSet> {
        debug!(endpoint = %self.endpoint, "requesting token refresh");

        let response = self
            .client
            .post(&self.endpoint)
            .form(&[
                ("grant_type", REFRESH_GRANT_TYPE),
                ("client_id", self.client_id.as_str()),
                ("client_secret", self.client_secret.expose().as_str()),
                ("refresh_token", refresh_token),
            ])
            .send()
            .await
            .map_err(|e| Error::RefreshFailed(format!("token refresh request failed: {e}")))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| Error::RefreshFailed(format!("reading refresh response: {e}")))?;

        if !status.is_success() {
            // OAuth servers answer 400/401 with {"error": ..., "error_description": ...}
            let detail = match serde_json::from_str::<TokenResponse>(&body) {
                Ok(TokenResponse {
                    error: Some(code),
                    error_description,
                    ..
                }) => describe(&code, error_description.as_deref()),
                _ => format!("token endpoint returned {status}: {body}"),
            };
            return Err(Error::RefreshFailed(detail));
        }

        serde_json::from_str::<TokenResponse>(&body)
            .map_err(|e| Error::RefreshFailed(format!("invalid refresh response: {e}")))?
            .into_token_set()
    }
}

impl TokenRefresher for OAuthRefresher {
    fn refresh<'a>(
        &'a self,
        refresh_token: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<TokenSet>> + Send + 'a>> {
        Box::pin(async move {
            match self.request(refresh_token).await {
                Ok(tokens) => {
                    info!(domain = %tokens.domain, "token refresh succeeded");
                    Ok(tokens)
                }
                Err(e) => {
                    warn!(error = %e, "token refresh failed");
                    Err(e)
                }
            }
        })
    }
}
