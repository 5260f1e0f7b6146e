//! Line-delimited JSON-RPC binding of the tool surface.
//!
//! An agent runtime launches the broker with the `stdio` argument and
//! mounts the catalog as tools: `tools/list` enumerates operations,
//! `tools/call` invokes one by name. One request per line, one response
//! per line, JSON-RPC 2.0 framing.

use serde::Deserialize;
use serde_json::{Value, json};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

use crate::tools::{Tools, catalog};

const PARSE_ERROR: i64 = -32700;
const METHOD_NOT_FOUND: i64 = -32601;
const INVALID_PARAMS: i64 = -32602;
const TOOL_ERROR: i64 = -32000;

#[derive(Debug, Deserialize)]
struct RpcRequest {
    #[serde(default)]
    id: Value,
    method: String,
    #[serde(default)]
    params: Value,
}

#[derive(Debug, Deserialize)]
struct CallParams {
    name: String,
    #[serde(default)]
    arguments: Value,
}

/// Serve the tool protocol over stdin/stdout until EOF.
pub async fn run(tools: Arc<Tools>) -> std::io::Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();
    tracing::info!("Serving tool protocol on stdio");

    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let response = handle_line(&tools, &line).await;
        let mut bytes = serde_json::to_vec(&response).unwrap_or_default();
        bytes.push(b'\n');
        stdout.write_all(&bytes).await?;
        stdout.flush().await?;
    }
    Ok(())
}

/// Handle one request line and produce the response value.
pub async fn handle_line(tools: &Tools, line: &str) -> Value {
    let request: RpcRequest = match serde_json::from_str(line) {
        Ok(request) => request,
        Err(error) => {
            return error_response(Value::Null, PARSE_ERROR, &error.to_string());
        }
    };

    match request.method.as_str() {
        "tools/list" => json!({
            "jsonrpc": "2.0",
            "id": request.id,
            "result": {"tools": catalog()},
        }),
        "tools/call" => {
            let params: CallParams = match serde_json::from_value(request.params) {
                Ok(params) => params,
                Err(error) => {
                    return error_response(request.id, INVALID_PARAMS, &error.to_string());
                }
            };
            match tools.dispatch(&params.name, params.arguments).await {
                Ok(result) => json!({
                    "jsonrpc": "2.0",
                    "id": request.id,
                    "result": result,
                }),
                Err(error) => error_response(request.id, TOOL_ERROR, &error.to_string()),
            }
        }
        other => error_response(
            request.id,
            METHOD_NOT_FOUND,
            &format!("unknown method {other:?}"),
        ),
    }
}

fn error_response(id: Value, code: i64, message: &str) -> Value {
    json!({
        "jsonrpc": "2.0",
        "id": id,
        "error": {"code": code, "message": message},
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::PaymentBroker;
    use crate::manager::WalletManager;
    use crate::store::StateStore;

    async fn tools() -> (tempfile::TempDir, Tools) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(StateStore::open(dir.path()).unwrap());
        let manager = Arc::new(WalletManager::new(store.clone()));
        let broker = Arc::new(PaymentBroker::new(store.clone(), manager.clone()));
        (dir, Tools::new(store, manager, broker, false))
    }

    #[tokio::test]
    async fn lists_and_calls_tools() {
        let (_dir, tools) = tools().await;

        let response = handle_line(
            &tools,
            r#"{"jsonrpc":"2.0","id":1,"method":"tools/list"}"#,
        )
        .await;
        assert_eq!(response["id"], 1);
        let names: Vec<&str> = response["result"]["tools"]
            .as_array()
            .unwrap()
            .iter()
            .map(|tool| tool["name"].as_str().unwrap())
            .collect();
        assert!(names.contains(&"pay"));
        assert!(names.contains(&"payPrepare"));

        let response = handle_line(
            &tools,
            r#"{"jsonrpc":"2.0","id":2,"method":"tools/call","params":{"name":"getNetwork"}}"#,
        )
        .await;
        assert_eq!(response["result"]["network"], "base");
    }

    #[tokio::test]
    async fn error_framing() {
        let (_dir, tools) = tools().await;

        let response = handle_line(&tools, "not json").await;
        assert_eq!(response["error"]["code"], PARSE_ERROR);

        let response = handle_line(
            &tools,
            r#"{"jsonrpc":"2.0","id":3,"method":"resources/read"}"#,
        )
        .await;
        assert_eq!(response["error"]["code"], METHOD_NOT_FOUND);

        let response = handle_line(
            &tools,
            r#"{"jsonrpc":"2.0","id":4,"method":"tools/call","params":{"name":"switchWallet","arguments":{"walletId":"ffff"}}}"#,
        )
        .await;
        assert_eq!(response["error"]["code"], TOOL_ERROR);
        assert_eq!(response["id"], 4);
    }
}
