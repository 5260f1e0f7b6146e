//! JSON-over-HTTP binding of the tool surface.
//!
//! Thin axum routes over [`Tools::dispatch`]: each route maps to one
//! catalog operation, so the HTTP API and the stdio tool protocol expose
//! exactly the same behavior. Errors answer with the status code the
//! operation's error kind maps to and a `{"error": ...}` body.

use axum::extract::Query;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Extension, Json, Router};
use serde_json::{Value, json};
use std::collections::HashMap;
use std::sync::Arc;

use crate::tools::{ToolError, Tools, catalog};

impl IntoResponse for ToolError {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.status_code())
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        tracing::warn!(status = %status, error = %self, "Tool call failed");
        (status, Json(json!({"error": self.to_string()}))).into_response()
    }
}

type ToolsExt = Extension<Arc<Tools>>;

/// Build the API router. Layers (tracing, CORS) are applied by the caller.
pub fn router(tools: Arc<Tools>) -> Router {
    Router::new()
        .route("/", get(liveness))
        .route("/api/config", get(|t: ToolsExt| call_empty(t, "config")))
        .route("/api/tools", get(list_tools))
        .route("/api/wallets", get(|t: ToolsExt| call_empty(t, "listWallets")))
        .route(
            "/api/wallets",
            post(|t: ToolsExt, b: Json<Value>| call(t, "createWallet", b)),
        )
        .route(
            "/api/wallets/switch",
            post(|t: ToolsExt, b: Json<Value>| call(t, "switchWallet", b)),
        )
        .route(
            "/api/wallets/rename",
            post(|t: ToolsExt, b: Json<Value>| call(t, "renameWallet", b)),
        )
        .route(
            "/api/wallets/remove",
            post(|t: ToolsExt, b: Json<Value>| call(t, "removeWallet", b)),
        )
        .route("/api/wallet", get(|t: ToolsExt| call_empty(t, "getWallet")))
        // Legacy single-wallet endpoint, kept as an alias for createWallet.
        .route(
            "/api/wallet",
            post(|t: ToolsExt, b: Json<Value>| call(t, "createWallet", b)),
        )
        .route("/api/network", get(|t: ToolsExt| call_empty(t, "getNetwork")))
        .route(
            "/api/network",
            post(|t: ToolsExt, b: Json<Value>| call(t, "setNetwork", b)),
        )
        .route("/api/balance", get(balance))
        .route("/api/rules", get(|t: ToolsExt| call_empty(t, "getRules")))
        .route(
            "/api/rules",
            post(|t: ToolsExt, b: Json<Value>| call(t, "setRules", b)),
        )
        .route("/api/transactions", get(transactions))
        .route("/api/spent-today", get(|t: ToolsExt| call_empty(t, "todaySpent")))
        .route(
            "/api/agent-identity",
            get(|t: ToolsExt| call_empty(t, "getAgentIdentity")),
        )
        .route(
            "/api/agent-identity",
            post(|t: ToolsExt, b: Json<Value>| call(t, "setAgentIdentity", b)),
        )
        .route("/api/pay", post(|t: ToolsExt, b: Json<Value>| call(t, "pay", b)))
        .route(
            "/api/pay/prepare",
            post(|t: ToolsExt, b: Json<Value>| call(t, "payPrepare", b)),
        )
        .route(
            "/api/pay/complete",
            post(|t: ToolsExt, b: Json<Value>| call(t, "payComplete", b)),
        )
        .route("/api/freeze", post(|t: ToolsExt| call_empty(t, "freeze")))
        .route("/api/unfreeze", post(|t: ToolsExt| call_empty(t, "unfreeze")))
        .layer(Extension(tools))
}

async fn liveness() -> &'static str {
    "clawlet payment broker"
}

async fn list_tools(Extension(_tools): Extension<Arc<Tools>>) -> Json<Value> {
    Json(json!({"tools": catalog()}))
}

async fn call(
    Extension(tools): Extension<Arc<Tools>>,
    tool: &'static str,
    Json(params): Json<Value>,
) -> Result<Json<Value>, ToolError> {
    Ok(Json(tools.dispatch(tool, params).await?))
}

async fn call_empty(
    Extension(tools): Extension<Arc<Tools>>,
    tool: &'static str,
) -> Result<Json<Value>, ToolError> {
    Ok(Json(tools.dispatch(tool, Value::Null).await?))
}

async fn balance(
    Extension(tools): Extension<Arc<Tools>>,
    Query(query): Query<HashMap<String, String>>,
) -> Result<Json<Value>, ToolError> {
    let params = match query.get("network") {
        Some(network) => json!({"network": network}),
        None => Value::Null,
    };
    Ok(Json(tools.dispatch("getBalance", params).await?))
}

async fn transactions(
    Extension(tools): Extension<Arc<Tools>>,
    Query(query): Query<HashMap<String, String>>,
) -> Result<Json<Value>, ToolError> {
    let params = match query.get("limit").and_then(|limit| limit.parse::<usize>().ok()) {
        Some(limit) => json!({"limit": limit}),
        None => Value::Null,
    };
    Ok(Json(tools.dispatch("listTransactions", params).await?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::PaymentBroker;
    use crate::manager::WalletManager;
    use crate::store::StateStore;

    async fn serve(demo_mode: bool) -> (tempfile::TempDir, String) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(StateStore::open(dir.path()).unwrap());
        let manager = Arc::new(WalletManager::new(store.clone()));
        let broker = Arc::new(PaymentBroker::new(store.clone(), manager.clone()));
        let tools = Arc::new(Tools::new(store, manager, broker, demo_mode));

        let app = router(tools);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (dir, format!("http://{addr}"))
    }

    #[tokio::test]
    async fn wallet_roundtrip_over_http() {
        let (_dir, base) = serve(false).await;
        let client = reqwest::Client::new();

        let config: Value = client
            .get(format!("{base}/api/config"))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(config["demoMode"], false);

        let created: Value = client
            .post(format!("{base}/api/wallets"))
            .json(&json!({"adapter": "local-key", "label": "HTTP wallet"}))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(created["label"], "HTTP wallet");

        let network = client
            .post(format!("{base}/api/network"))
            .json(&json!({"network": "base-sepolia"}))
            .send()
            .await
            .unwrap();
        assert_eq!(network.status().as_u16(), 200);

        let bad_network = client
            .post(format!("{base}/api/network"))
            .json(&json!({"network": "dogecoin"}))
            .send()
            .await
            .unwrap();
        assert_eq!(bad_network.status().as_u16(), 400);

        let wallets: Value = client
            .get(format!("{base}/api/wallets"))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(wallets["wallets"].as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn demo_mode_maps_to_403() {
        let (_dir, base) = serve(true).await;
        let client = reqwest::Client::new();

        let response = client
            .post(format!("{base}/api/wallets"))
            .json(&json!({"adapter": "local-key"}))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status().as_u16(), 403);
        let body: Value = response.json().await.unwrap();
        assert!(body["error"].as_str().unwrap().contains("Demo mode"));

        // Reads stay open.
        let response = client
            .get(format!("{base}/api/wallets"))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status().as_u16(), 200);
    }

    #[tokio::test]
    async fn legacy_wallet_post_aliases_create() {
        let (_dir, base) = serve(false).await;
        let client = reqwest::Client::new();

        let created: Value = client
            .post(format!("{base}/api/wallet"))
            .json(&json!({"adapter": "local-key"}))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(created["adapter"], "local-key");

        let wallet: Value = client
            .get(format!("{base}/api/wallet"))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(wallet["wallet"]["id"], created["id"]);
    }
}
