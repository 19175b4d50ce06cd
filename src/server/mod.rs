//! Unix socket JSON-RPC server for local consumers.
//!
//! Listens on ~/.feewatch/feewatch.sock for newline-delimited JSON-RPC 2.0
//! requests. All communication is local-only, no TCP exposure.
//!
//! Every domain result is wrapped in `{ success, data?, error? }`, so an
//! upstream outage reaches the caller as `success: false`, never as a
//! protocol error. JSON-RPC error codes are reserved for malformed requests.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixListener;
use tracing::{debug, info, warn};

use crate::chain_tip::ChainTip;
use crate::orchestrator::FeeOrchestrator;
use crate::poller::Poller;
use crate::store::KeyValueStore;

// ── JSON-RPC Types ──────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct JsonRpcRequest {
    #[allow(dead_code)]
    jsonrpc: String,
    method: String,
    params: Option<Value>,
    id: Option<Value>,
}

#[derive(Debug, Serialize)]
struct JsonRpcResponse {
    jsonrpc: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<JsonRpcError>,
    id: Option<Value>,
}

#[derive(Debug, Serialize)]
struct JsonRpcError {
    code: i32,
    message: String,
}

impl JsonRpcResponse {
    fn success(id: Option<Value>, result: Value) -> Self {
        Self { jsonrpc: "2.0".into(), result: Some(result), error: None, id }
    }
    fn error(id: Option<Value>, code: i32, message: String) -> Self {
        Self { jsonrpc: "2.0".into(), result: None, error: Some(JsonRpcError { code, message }), id }
    }
    fn invalid_params(id: Option<Value>, message: impl Into<String>) -> Self {
        Self::error(id, -32602, format!("Invalid params: {}", message.into()))
    }
    fn envelope(id: Option<Value>, envelope: Envelope) -> Self {
        let value = serde_json::to_value(envelope).unwrap_or(Value::Null);
        Self::success(id, value)
    }
}

/// Uniform result descriptor handed to consumers.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Envelope {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Envelope {
    pub fn ok<T: Serialize>(data: T) -> Self {
        match serde_json::to_value(data) {
            Ok(v) => Self { success: true, data: Some(v), error: None },
            Err(e) => Self::failure(e.to_string()),
        }
    }

    pub fn failure(message: impl Into<String>) -> Self {
        Self { success: false, data: None, error: Some(message.into()) }
    }
}

// ── Server ──────────────────────────────────────────────────────────

/// Everything a request handler can reach.
pub struct Services {
    pub orchestrator: Arc<FeeOrchestrator>,
    pub chain_tip: Arc<ChainTip>,
    pub fee_poller: Poller<FeeOrchestrator>,
    pub height_poller: Poller<ChainTip>,
    pub store: Arc<dyn KeyValueStore>,
}

pub struct Server {
    socket_path: PathBuf,
    services: Arc<Services>,
}

impl Server {
    pub fn new(socket_path: PathBuf, services: Arc<Services>) -> Self {
        Self { socket_path, services }
    }

    pub async fn run(&self) -> Result<()> {
        // Remove stale socket file
        if self.socket_path.exists() {
            std::fs::remove_file(&self.socket_path)
                .with_context(|| format!("Failed to remove stale socket {}", self.socket_path.display()))?;
        }

        if let Some(parent) = self.socket_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let listener = UnixListener::bind(&self.socket_path)
            .with_context(|| format!("Failed to bind {}", self.socket_path.display()))?;

        // Restrict socket permissions (owner-only)
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&self.socket_path, std::fs::Permissions::from_mode(0o600))?;
        }

        info!(socket = %self.socket_path.display(), "feewatch server listening");

        loop {
            let (stream, _) = listener.accept().await?;
            let services = Arc::clone(&self.services);

            tokio::spawn(async move {
                let (reader, mut writer) = stream.into_split();
                // Bound reads to 1 MB
                const MAX_REQUEST_BYTES: u64 = 1_048_576;
                let bounded = reader.take(MAX_REQUEST_BYTES);
                let mut reader = BufReader::new(bounded);
                let mut line = String::new();

                loop {
                    line.clear();
                    match reader.read_line(&mut line).await {
                        Ok(0) => break, // EOF
                        Ok(_) => {
                            if line.trim().is_empty() {
                                continue;
                            }
                            let response = handle_request(&line, &services).await;
                            let resp_json = serde_json::to_string(&response).unwrap_or_default();
                            if writer.write_all(resp_json.as_bytes()).await.is_err() { break; }
                            if writer.write_all(b"\n").await.is_err() { break; }
                        }
                        Err(e) => {
                            debug!("Connection read failed: {}", e);
                            break;
                        }
                    }
                }
            });
        }
    }
}

// ── Request Handling ────────────────────────────────────────────────

async fn handle_request(raw: &str, services: &Services) -> JsonRpcResponse {
    let req: JsonRpcRequest = match serde_json::from_str(raw) {
        Ok(r) => r,
        Err(e) => return JsonRpcResponse::error(None, -32700, format!("Parse error: {}", e)),
    };

    debug!(method = %req.method, "RPC request");
    let params = req.params.unwrap_or(Value::Null);

    match req.method.as_str() {
        "fee.recommended" | "getRecommendedFee" => {
            let quote = services.orchestrator.recommended_fee().await;
            JsonRpcResponse::envelope(req.id, Envelope::ok(quote))
        }
        "chain.blockHeight" | "getLatestBlockHeight" => handle_block_height(req.id, services).await,
        "poll.status" => handle_poll_status(req.id, services),
        "poll.refetch" => handle_refetch(req.id, params, services),
        "poll.setActive" => handle_set_active(req.id, params, services),
        "store.get" => handle_store_get(req.id, params, services),
        "store.set" => handle_store_set(req.id, params, services),
        "store.remove" => handle_store_remove(req.id, params, services),
        "store.keys" => match services.store.keys() {
            Ok(keys) => JsonRpcResponse::envelope(req.id, Envelope::ok(keys)),
            Err(e) => JsonRpcResponse::envelope(req.id, Envelope::failure(e.to_string())),
        },
        _ => JsonRpcResponse::error(req.id, -32601, format!("Unknown method: {}", req.method)),
    }
}

async fn handle_block_height(id: Option<Value>, services: &Services) -> JsonRpcResponse {
    match services.chain_tip.latest_block_height().await {
        Ok(reading) => JsonRpcResponse::envelope(id, Envelope::ok(reading)),
        Err(e) => {
            warn!(kind = %e.kind, "Block height unavailable: {}", e);
            JsonRpcResponse::envelope(id, Envelope::failure(e.message))
        }
    }
}

fn handle_poll_status(id: Option<Value>, services: &Services) -> JsonRpcResponse {
    JsonRpcResponse::envelope(
        id,
        Envelope::ok(serde_json::json!({
            "fee": services.fee_poller.state(),
            "fee_quote": services.orchestrator.cached_fee(),
            "block_height": services.height_poller.state(),
            "height_regressions": services.chain_tip.regressions_total(),
        })),
    )
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Target {
    Fee,
    BlockHeight,
}

fn parse_target(params: &Value) -> Result<Target, String> {
    match params.get("target").and_then(|v| v.as_str()) {
        Some("fee") => Ok(Target::Fee),
        Some("block_height") | Some("blockHeight") => Ok(Target::BlockHeight),
        Some(other) => Err(format!("unknown target '{}'", other)),
        None => Err("missing 'target'".into()),
    }
}

fn handle_refetch(id: Option<Value>, params: Value, services: &Services) -> JsonRpcResponse {
    let target = match parse_target(&params) {
        Ok(t) => t,
        Err(e) => return JsonRpcResponse::invalid_params(id, e),
    };
    let (issued, active) = match target {
        Target::Fee => (services.fee_poller.refetch(), services.fee_poller.is_active()),
        Target::BlockHeight => (services.height_poller.refetch(), services.height_poller.is_active()),
    };
    if !active {
        return JsonRpcResponse::envelope(id, Envelope::failure("polling is not active"));
    }
    JsonRpcResponse::envelope(id, Envelope::ok(serde_json::json!({ "issued": issued })))
}

fn handle_set_active(id: Option<Value>, params: Value, services: &Services) -> JsonRpcResponse {
    let target = match parse_target(&params) {
        Ok(t) => t,
        Err(e) => return JsonRpcResponse::invalid_params(id, e),
    };
    let Some(active) = params.get("active").and_then(|v| v.as_bool()) else {
        return JsonRpcResponse::invalid_params(id, "missing boolean 'active'");
    };

    let changed = match (target, active) {
        (Target::Fee, true) => services.fee_poller.activate(),
        (Target::Fee, false) => services.fee_poller.deactivate(),
        (Target::BlockHeight, true) => services.height_poller.activate(),
        (Target::BlockHeight, false) => services.height_poller.deactivate(),
    };
    JsonRpcResponse::envelope(id, Envelope::ok(serde_json::json!({ "active": active, "changed": changed })))
}

fn store_key(params: &Value) -> Option<&str> {
    params.get("key").and_then(|v| v.as_str())
}

fn handle_store_get(id: Option<Value>, params: Value, services: &Services) -> JsonRpcResponse {
    let Some(key) = store_key(&params) else {
        return JsonRpcResponse::invalid_params(id, "missing 'key'");
    };
    match services.store.get(key) {
        Ok(value) => JsonRpcResponse::envelope(id, Envelope::ok(value)),
        Err(e) => JsonRpcResponse::envelope(id, Envelope::failure(e.to_string())),
    }
}

fn handle_store_set(id: Option<Value>, params: Value, services: &Services) -> JsonRpcResponse {
    let Some(key) = store_key(&params) else {
        return JsonRpcResponse::invalid_params(id, "missing 'key'");
    };
    let Some(value) = params.get("value").cloned() else {
        return JsonRpcResponse::invalid_params(id, "missing 'value'");
    };
    match services.store.set(key, value) {
        Ok(()) => JsonRpcResponse::envelope(id, Envelope::ok(Value::Null)),
        Err(e) => JsonRpcResponse::envelope(id, Envelope::failure(e.to_string())),
    }
}

fn handle_store_remove(id: Option<Value>, params: Value, services: &Services) -> JsonRpcResponse {
    let Some(key) = store_key(&params) else {
        return JsonRpcResponse::invalid_params(id, "missing 'key'");
    };
    match services.store.remove(key) {
        Ok(existed) => JsonRpcResponse::envelope(id, Envelope::ok(serde_json::json!({ "removed": existed }))),
        Err(e) => JsonRpcResponse::envelope(id, Envelope::failure(e.to_string())),
    }
}
