//! Authenticated CRM REST calls with one-shot token recovery
//!
//! Per call:
//!
//! ```text
//! Start -> Initial call -> Success
//!                       -> ExpiredToken -> Refreshing -> Refreshed -> Retry call -> Success | failure
//!                                                     -> RefreshFailed
//!                       -> other API error | transport error
//! ```
//!
//! At most one refresh and two CRM requests per logical call. The client
//! holds no token state of its own; every call starts from `TokenStore::load`.

use std::collections::BTreeMap;
use std::sync::Arc;

use crm_auth::{TokenRefresher, TokenSet, TokenStore};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::classify::{self, ErrorKind, Outcome};
use crate::error::{Error, Result};
use crate::metrics;

/// Form field carrying the access token on every REST call.
const AUTH_PARAM: &str = "auth";

/// Which of the (at most two) requests of a call is being issued.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Attempt {
    Initial,
    Retry,
}

impl Attempt {
    fn label(self) -> &'static str {
        match self {
            Attempt::Initial => "initial",
            Attempt::Retry => "retry",
        }
    }
}

/// REST client for the installed tenant.
pub struct RpcClient {
    http: reqwest::Client,
    store: Arc<dyn TokenStore>,
    refresher: Arc<dyn TokenRefresher>,
    scheme: String,
}

impl RpcClient {
    pub fn new(
        http: reqwest::Client,
        store: Arc<dyn TokenStore>,
        refresher: Arc<dyn TokenRefresher>,
    ) -> Self {
        Self {
            http,
            store,
            refresher,
            scheme: "https".to_string(),
        }
    }

    /// Override the URL scheme used to reach the tenant host.
    pub fn with_scheme(mut self, scheme: impl Into<String>) -> Self {
        self.scheme = scheme.into();
        self
    }

    pub fn store(&self) -> &Arc<dyn TokenStore> {
        &self.store
    }

    /// `{scheme}://{domain}/rest/{method}`
    pub fn endpoint(&self, domain: &str, method: &str) -> String {
        format!("{}://{}/rest/{}", self.scheme, domain, method)
    }

    /// Call a REST method as the installed tenant.
    ///
    /// Returns the decoded response body verbatim. An expired access token is
    /// refreshed, persisted and the request reissued exactly once; the
    /// retry's outcome is final.
    pub async fn call(&self, method: &str, params: &BTreeMap<String, String>) -> Result<Value> {
        let result = self.run(method, params).await;
        match &result {
            Ok(_) => metrics::record_call("success"),
            Err(e) => {
                debug!(method, outcome = e.label(), error = %e, "call failed");
                metrics::record_call(e.label());
            }
        }
        result
    }

    async fn run(&self, method: &str, params: &BTreeMap<String, String>) -> Result<Value> {
        validate_method(method)?;
        let tokens = self.store.load().await?.ok_or(Error::NotInstalled)?;

        let failure = match self.send(Attempt::Initial, &tokens, method, params).await? {
            Outcome::Success(body) => return Ok(body),
            Outcome::Failed(failure) => failure,
        };

        if failure.kind() != ErrorKind::ExpiredToken {
            return Err(failure.into());
        }

        warn!(method, domain = %tokens.domain, "access token expired, refreshing");
        let refreshed = self.refresh(&tokens).await?;

        match self.send(Attempt::Retry, &refreshed, method, params).await? {
            Outcome::Success(body) => Ok(body),
            Outcome::Failed(failure) => Err(failure.into()),
        }
    }

    /// Exchange the stored refresh token and persist the new set before it
    /// is used. On failure the stored set is left untouched.
    async fn refresh(&self, current: &TokenSet) -> Result<TokenSet> {
        let refreshed = match self.refresher.refresh(&current.refresh_token).await {
            Ok(tokens) => {
                metrics::record_refresh(true);
                tokens
            }
            Err(e) => {
                metrics::record_refresh(false);
                return Err(e.into());
            }
        };

        if refreshed.domain != current.domain {
            info!(
                previous = %current.domain,
                domain = %refreshed.domain,
                "refresh response moved tenant domain"
            );
        }

        if let Err(e) = self.store.save(&refreshed).await {
            warn!(
                domain = %refreshed.domain,
                error = %e,
                "refreshed tokens could not be saved; the rotated refresh token is lost and the app must be reinstalled"
            );
            return Err(e.into());
        }
        Ok(refreshed)
    }

    /// Issue one POST with `params` plus `auth` as a form body.
    async fn send(
        &self,
        attempt: Attempt,
        tokens: &TokenSet,
        method: &str,
        params: &BTreeMap<String, String>,
    ) -> Result<Outcome> {
        let url = self.endpoint(&tokens.domain, method);

        let mut form: Vec<(&str, &str)> = params
            .iter()
            .filter(|(key, _)| key.as_str() != AUTH_PARAM)
            .map(|(key, value)| (key.as_str(), value.as_str()))
            .collect();
        form.push((AUTH_PARAM, tokens.access_token.as_str()));

        debug!(method, attempt = attempt.label(), params = params.len(), "calling CRM");

        let response = self
            .http
            .post(&url)
            .form(&form)
            .send()
            .await
            .map_err(|e| Error::Transport(format!("{method}: {e}")))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| Error::Transport(format!("{method}: reading response: {e}")))?;

        let outcome = classify::decode(status, &body);
        if let Outcome::Failed(failure) = &outcome {
            debug!(
                method,
                attempt = attempt.label(),
                status = status.as_u16(),
                code = %failure.code,
                "CRM reported error"
            );
        }
        Ok(outcome)
    }
}

/// REST method names are dotted identifiers (`crm.deal.get`). Anything else
/// could move the request, and the access token with it, off `/rest/`.
fn validate_method(method: &str) -> Result<()> {
    let valid = !method.is_empty()
        && !method.starts_with('.')
        && method
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '_');
    if valid {
        Ok(())
    } else {
        Err(Error::InvalidMethod(method.to_string()))
    }
}
