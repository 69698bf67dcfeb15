//! Installation: initial token persistence and placement rebinding
//!
//! The CRM calls the app's install handler with the first token pair. After
//! storing it, every configured placement is rebound: a best-effort
//! `placement.unbind` (a fresh portal has nothing to unbind, so its failure
//! is logged and dropped) followed by a `placement.bind` whose failure is
//! returned to the caller.

use std::collections::BTreeMap;

use crm_auth::{TokenSet, TokenStore};
use serde::Deserialize;
use tracing::{info, warn};

use crate::client::RpcClient;
use crate::error::Result;

/// A CRM UI extension point bound to one of the app's handler URLs.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Placement {
    /// Placement code, e.g. `CRM_DEAL_DETAIL_TAB`
    pub placement: String,
    /// URL the CRM opens for this placement
    pub handler: String,
    #[serde(default)]
    pub title: String,
}

impl Placement {
    fn unbind_params(&self) -> BTreeMap<String, String> {
        BTreeMap::from([
            ("PLACEMENT".to_string(), self.placement.clone()),
            ("HANDLER".to_string(), self.handler.clone()),
        ])
    }

    fn bind_params(&self) -> BTreeMap<String, String> {
        let mut params = self.unbind_params();
        params.insert("TITLE".to_string(), self.title.clone());
        params
    }
}

/// Persist the token set delivered by the install callback, replacing any
/// previous installation.
pub async fn install(store: &dyn TokenStore, tokens: &TokenSet) -> Result<()> {
    store.save(tokens).await?;
    info!(domain = %tokens.domain, "application installed");
    Ok(())
}

/// Rebind every placement. Returns how many were bound.
pub async fn rebind_placements(client: &RpcClient, placements: &[Placement]) -> Result<usize> {
    for placement in placements {
        unbind_ignoring_failure(client, placement).await;
        client.call("placement.bind", &placement.bind_params()).await?;
        info!(placement = %placement.placement, handler = %placement.handler, "placement bound");
    }
    Ok(placements.len())
}

/// Install then rebind placements.
pub async fn complete_install(
    store: &dyn TokenStore,
    client: &RpcClient,
    tokens: &TokenSet,
    placements: &[Placement],
) -> Result<usize> {
    install(store, tokens).await?;
    rebind_placements(client, placements).await
}

/// Remove a previous binding. Never fails: the outcome is only logged.
async fn unbind_ignoring_failure(client: &RpcClient, placement: &Placement) {
    match client.call("placement.unbind", &placement.unbind_params()).await {
        Ok(_) => {
            info!(placement = %placement.placement, "previous placement binding removed");
        }
        Err(e) => {
            warn!(
                placement = %placement.placement,
                error = %e,
                "placement unbind failed, continuing with bind"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::future::Future;
    use std::pin::Pin;
    use std::sync::{Arc, Mutex};

    use axum::extract::{Form, Path};
    use axum::http::StatusCode;
    use axum::response::IntoResponse;
    use crm_auth::{MemoryTokenStore, TokenRefresher};
    use serde_json::json;
    use tokio::net::TcpListener;

    use crate::error::Error;

    type Seen = Arc<Mutex<Vec<(String, HashMap<String, String>)>>>;

    struct NoRefresh;

    impl TokenRefresher for NoRefresh {
        fn refresh<'a>(
            &'a self,
            _refresh_token: &'a str,
        ) -> Pin<Box<dyn Future<Output = crm_auth::Result<TokenSet>> + Send + 'a>> {
            Box::pin(async { Err(crm_auth::Error::RefreshFailed("not expected".into())) })
        }
    }

    /// Mock CRM: `placement.unbind` fails with `unbind_status`, `placement.bind`
    /// fails with `bind_status` (200 means success).
    async fn start_crm(unbind_status: StatusCode, bind_status: StatusCode) -> (String, Seen) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let domain = listener.local_addr().unwrap().to_string();
        let seen: Seen = Arc::new(Mutex::new(Vec::new()));

        let log = seen.clone();
        let app = axum::Router::new().route(
            "/rest/{method}",
            axum::routing::post(
                move |Path(method): Path<String>, Form(form): Form<HashMap<String, String>>| {
                    let log = log.clone();
                    async move {
                        let status = if method == "placement.unbind" {
                            unbind_status
                        } else {
                            bind_status
                        };
                        log.lock().unwrap().push((method, form));
                        if status.is_success() {
                            (status, axum::Json(json!({"result": true}))).into_response()
                        } else {
                            (
                                status,
                                axum::Json(json!({
                                    "error": "ERROR_PLACEMENT_HANDLER_NOT_FOUND",
                                    "error_description": "Handler not found"
                                })),
                            )
                                .into_response()
                        }
                    }
                },
            ),
        );
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        (domain, seen)
    }

    fn deal_tab() -> Placement {
        Placement {
            placement: "CRM_DEAL_DETAIL_TAB".into(),
            handler: "https://app.example/placement/deal".into(),
            title: "Documents".into(),
        }
    }

    fn client_for(store: Arc<MemoryTokenStore>) -> RpcClient {
        RpcClient::new(reqwest::Client::new(), store, Arc::new(NoRefresh)).with_scheme("http")
    }

    #[tokio::test]
    async fn install_persists_initial_tokens() {
        let store = MemoryTokenStore::new();
        let tokens = TokenSet::new("A1", "R1", "x.example");

        install(&store, &tokens).await.unwrap();

        assert_eq!(store.snapshot().await, Some(tokens));
        assert_eq!(store.writes(), 1);
    }

    #[tokio::test]
    async fn complete_install_unbinds_then_binds() {
        let (domain, seen) = start_crm(StatusCode::OK, StatusCode::OK).await;
        let store = Arc::new(MemoryTokenStore::new());
        let client = client_for(store.clone());
        let tokens = TokenSet::new("A1", "R1", &domain);

        let bound = complete_install(&*store, &client, &tokens, &[deal_tab()])
            .await
            .unwrap();

        assert_eq!(bound, 1);
        let requests = seen.lock().unwrap();
        let methods: Vec<&str> = requests.iter().map(|(m, _)| m.as_str()).collect();
        assert_eq!(methods, vec!["placement.unbind", "placement.bind"]);

        let bind = &requests[1].1;
        assert_eq!(bind["PLACEMENT"], "CRM_DEAL_DETAIL_TAB");
        assert_eq!(bind["HANDLER"], "https://app.example/placement/deal");
        assert_eq!(bind["TITLE"], "Documents");
        assert_eq!(bind["auth"], "A1");
        assert!(!requests[0].1.contains_key("TITLE"));
    }

    #[tokio::test]
    async fn unbind_failure_is_ignored() {
        let (domain, seen) = start_crm(StatusCode::BAD_REQUEST, StatusCode::OK).await;
        let store = Arc::new(MemoryTokenStore::with_tokens(TokenSet::new("A1", "R1", &domain)));
        let client = client_for(store);

        let bound = rebind_placements(&client, &[deal_tab()]).await.unwrap();

        assert_eq!(bound, 1);
        assert_eq!(seen.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn bind_failure_propagates() {
        let (domain, _) = start_crm(StatusCode::OK, StatusCode::BAD_REQUEST).await;
        let store = Arc::new(MemoryTokenStore::with_tokens(TokenSet::new("A1", "R1", &domain)));
        let client = client_for(store);

        let err = rebind_placements(&client, &[deal_tab()]).await.unwrap_err();

        assert!(
            matches!(err, Error::Api { ref code, .. } if code == "ERROR_PLACEMENT_HANDLER_NOT_FOUND"),
            "got {err:?}"
        );
    }

    #[tokio::test]
    async fn no_placements_is_a_noop() {
        let store = Arc::new(MemoryTokenStore::new());
        let client = client_for(store);

        assert_eq!(rebind_placements(&client, &[]).await.unwrap(), 0);
    }

    #[test]
    fn placement_title_defaults_to_empty() {
        let placement: Placement = serde_json::from_value(json!({
            "placement": "CRM_CONTACT_DETAIL_TAB",
            "handler": "https://app.example/c"
        }))
        .unwrap();
        assert_eq!(placement.title, "");
    }
}
