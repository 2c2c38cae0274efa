//! JSON-RPC control endpoint: warm-up status, `getinfo` and `stop`.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use dualchain_chainstate::interrupt::InterruptToken;
use dualchain_chainstate::params::Network;
use dualchain_chainstate::validation::BlockValidator;
use dualchain_primitives::hash_to_hex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;

use crate::phase::ShutdownRequest;

const MAX_REQUEST_BYTES: usize = 64 * 1024;

pub const RPC_IN_WARMUP: i32 = -28;
pub const RPC_METHOD_NOT_FOUND: i32 = -32601;
pub const RPC_PARSE_ERROR: i32 = -32700;
pub const RPC_INVALID_REQUEST: i32 = -32600;

#[derive(Debug, Deserialize)]
struct JsonRpcRequest {
    method: String,
    #[serde(default)]
    params: Option<Value>,
    #[serde(default)]
    id: Option<Value>,
}

#[derive(Debug, Serialize)]
struct JsonRpcResponse {
    result: Option<Value>,
    error: Option<JsonRpcError>,
    id: Option<Value>,
}

#[derive(Debug, Serialize)]
struct JsonRpcError {
    code: i32,
    message: String,
}

/// The latest init message while the node is warming up. `None` once startup is done.
pub struct WarmupStatus {
    message: Mutex<Option<String>>,
}

impl Default for WarmupStatus {
    fn default() -> Self {
        Self::new()
    }
}

impl WarmupStatus {
    pub fn new() -> Self {
        Self {
            message: Mutex::new(Some("RPC server started".to_string())),
        }
    }

    pub fn set(&self, text: &str) {
        let mut message = self.lock();
        if message.is_some() {
            *message = Some(text.to_string());
        }
    }

    pub fn finish(&self) {
        *self.lock() = None;
    }

    pub fn current(&self) -> Option<String> {
        self.lock().clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Option<String>> {
        self.message
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

pub struct RpcState {
    warmup: Arc<WarmupStatus>,
    shutdown: ShutdownRequest,
    validator: Mutex<Option<Arc<dyn BlockValidator>>>,
    network: Network,
}

impl RpcState {
    pub fn new(warmup: Arc<WarmupStatus>, shutdown: ShutdownRequest, network: Network) -> Self {
        Self {
            warmup,
            shutdown,
            validator: Mutex::new(None),
            network,
        }
    }

    /// Chain queries answer once the store is loaded.
    pub fn attach_validator(&self, validator: Arc<dyn BlockValidator>) {
        *self
            .validator
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(validator);
    }

    fn validator(&self) -> Option<Arc<dyn BlockValidator>> {
        self.validator
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

/// Handles one JSON-RPC request body and returns the response body.
pub fn handle_request(state: &RpcState, body: &[u8]) -> String {
    let request: JsonRpcRequest = match serde_json::from_slice::<Value>(body) {
        Ok(value) => match serde_json::from_value(value) {
            Ok(request) => request,
            Err(err) => {
                return error_body(RPC_INVALID_REQUEST, &format!("Invalid request: {err}"))
            }
        },
        Err(err) => return error_body(RPC_PARSE_ERROR, &format!("Parse error: {err}")),
    };
    log_debug!("RPC request: method={}", request.method);

    let result = dispatch(state, &request.method, request.params.as_ref());
    let response = match result {
        Ok(value) => JsonRpcResponse {
            result: Some(value),
            error: None,
            id: request.id,
        },
        Err((code, message)) => JsonRpcResponse {
            result: None,
            error: Some(JsonRpcError { code, message }),
            id: request.id,
        },
    };
    serde_json::to_string(&response).unwrap_or_else(|err| {
        log_error!("failed to serialize RPC response: {err}");
        error_body(-32603, "Internal error")
    })
}

/// `stop` is honored even while warming up so a slow load can be cancelled.
fn dispatch(state: &RpcState, method: &str, _params: Option<&Value>) -> Result<Value, (i32, String)> {
    if method == "stop" {
        log_info!("RPC stop requested");
        state.shutdown.request();
        return Ok(Value::String("dualchain server stopping".to_string()));
    }
    if let Some(status) = state.warmup.current() {
        return Err((RPC_IN_WARMUP, status));
    }
    match method {
        "getinfo" => {
            let tip = state.validator().and_then(|validator| validator.chain_tip());
            Ok(json!({
                "version": env!("CARGO_PKG_VERSION"),
                "blocks": tip.map(|tip| tip.height),
                "bestblockhash": tip.map(|tip| hash_to_hex(&tip.hash)),
                "network": state.network.as_str(),
            }))
        }
        _ => Err((RPC_METHOD_NOT_FOUND, "Method not found".to_string())),
    }
}

fn error_body(code: i32, message: &str) -> String {
    json!({
        "result": Value::Null,
        "error": { "code": code, "message": message },
        "id": Value::Null,
    })
    .to_string()
}

pub async fn bind_rpc(addr: SocketAddr) -> Result<TcpListener, String> {
    TcpListener::bind(addr)
        .await
        .map_err(|err| format!("Unable to bind RPC server to {addr}: {err}"))
}

/// Accepts until `interrupt` is raised. At most `workers` requests run at once.
pub async fn serve_rpc(
    listener: TcpListener,
    state: Arc<RpcState>,
    workers: usize,
    mut interrupt: InterruptToken,
) {
    if let Ok(addr) = listener.local_addr() {
        log_info!("RPC server listening on {addr}");
    }
    let permits = Arc::new(Semaphore::new(workers.max(1)));
    loop {
        let accepted = tokio::select! {
            _ = interrupt.interrupted() => break,
            accepted = listener.accept() => accepted,
        };
        let (stream, _) = match accepted {
            Ok(accepted) => accepted,
            Err(err) => {
                log_warn!("RPC accept failed: {err}");
                continue;
            }
        };
        let permits = Arc::clone(&permits);
        let state = Arc::clone(&state);
        tokio::spawn(async move {
            let Ok(_permit) = permits.acquire_owned().await else {
                return;
            };
            if let Err(err) = handle_connection(stream, &state).await {
                log_warn!("RPC connection error: {err}");
            }
        });
    }
    log_info!("RPC server stopped");
}

async fn handle_connection(mut stream: TcpStream, state: &RpcState) -> Result<(), String> {
    let mut buffer = Vec::with_capacity(4096);
    let mut chunk = [0u8; 4096];
    let (header_len, content_len) = loop {
        let read = stream
            .read(&mut chunk)
            .await
            .map_err(|err| err.to_string())?;
        if read == 0 {
            return Ok(());
        }
        buffer.extend_from_slice(&chunk[..read]);
        if let Some(parsed) = parse_head(&buffer) {
            break parsed;
        }
        if buffer.len() > MAX_REQUEST_BYTES {
            return write_response(&mut stream, "413 Payload Too Large", "").await;
        }
    };
    if header_len + content_len > MAX_REQUEST_BYTES {
        return write_response(&mut stream, "413 Payload Too Large", "").await;
    }
    while buffer.len() < header_len + content_len {
        let read = stream
            .read(&mut chunk)
            .await
            .map_err(|err| err.to_string())?;
        if read == 0 {
            return Err("connection closed mid-request".to_string());
        }
        buffer.extend_from_slice(&chunk[..read]);
    }

    let head = String::from_utf8_lossy(&buffer[..header_len]);
    let method = head.split_whitespace().next().unwrap_or_default();
    if method != "POST" {
        return write_response(&mut stream, "405 Method Not Allowed", "").await;
    }
    let body = handle_request(state, &buffer[header_len..header_len + content_len]);
    write_response(&mut stream, "200 OK", &body).await
}

/// Returns the header length (including the blank line) and the declared body length.
fn parse_head(buffer: &[u8]) -> Option<(usize, usize)> {
    let end = buffer.windows(4).position(|window| window == b"\r\n\r\n")? + 4;
    let head = String::from_utf8_lossy(&buffer[..end]);
    let content_len = head
        .lines()
        .filter_map(|line| line.split_once(':'))
        .find(|(name, _)| name.trim().eq_ignore_ascii_case("content-length"))
        .and_then(|(_, value)| value.trim().parse().ok())
        .unwrap_or(0);
    Some((end, content_len))
}

async fn write_response(stream: &mut TcpStream, status: &str, body: &str) -> Result<(), String> {
    stream
        .write_all(&build_response(status, body))
        .await
        .map_err(|err| err.to_string())?;
    stream.shutdown().await.map_err(|err| err.to_string())?;
    Ok(())
}

fn build_response(status: &str, body: &str) -> Vec<u8> {
    let mut response = String::new();
    response.push_str("HTTP/1.1 ");
    response.push_str(status);
    response.push_str("\r\nContent-Type: application/json\r\nConnection: close\r\nContent-Length: ");
    response.push_str(&body.len().to_string());
    response.push_str("\r\n\r\n");
    let mut bytes = response.into_bytes();
    bytes.extend_from_slice(body.as_bytes());
    bytes
}

#[cfg(test)]
mod tests {
    use super::*;
    use dualchain_chainstate::interrupt::interrupt_channel;

    fn state() -> RpcState {
        RpcState::new(
            Arc::new(WarmupStatus::new()),
            ShutdownRequest::new(),
            Network::Regtest,
        )
    }

    fn call(state: &RpcState, body: &str) -> Value {
        serde_json::from_str(&handle_request(state, body.as_bytes())).expect("json")
    }

    #[test]
    fn warmup_reports_the_latest_init_message() {
        let state = state();
        state.warmup.set("Loading block index...");
        let response = call(&state, r#"{"method":"getinfo","id":1}"#);
        assert_eq!(response["error"]["code"], RPC_IN_WARMUP);
        assert_eq!(response["error"]["message"], "Loading block index...");
        assert_eq!(response["id"], 1);

        state.warmup.finish();
        state.warmup.set("ignored after warm-up");
        let response = call(&state, r#"{"method":"getinfo","id":2}"#);
        assert!(response["error"].is_null());
        assert_eq!(response["result"]["network"], "regtest");
        assert!(response["result"]["blocks"].is_null());
    }

    #[test]
    fn stop_works_during_warmup() {
        let state = state();
        let response = call(&state, r#"{"method":"stop","id":"x"}"#);
        assert_eq!(response["result"], "dualchain server stopping");
        assert!(state.shutdown.is_requested());
    }

    #[test]
    fn malformed_and_unknown_requests_are_rejected() {
        let state = state();
        state.warmup.finish();
        assert_eq!(call(&state, "{not json")["error"]["code"], RPC_PARSE_ERROR);
        assert_eq!(call(&state, r#"{"id":3}"#)["error"]["code"], RPC_INVALID_REQUEST);
        assert_eq!(
            call(&state, r#"{"method":"getblock","id":4}"#)["error"]["code"],
            RPC_METHOD_NOT_FOUND
        );
    }

    #[test]
    fn head_parsing_finds_the_body_length() {
        let request = b"POST / HTTP/1.1\r\nHost: x\r\nContent-Length: 12\r\n\r\n{\"method\":1}";
        assert_eq!(parse_head(request), Some((48, 12)));
        assert_eq!(parse_head(b"POST / HTTP/1.1\r\n"), None);
    }

    #[tokio::test]
    async fn serves_over_http_until_interrupted() {
        let listener = bind_rpc("127.0.0.1:0".parse().expect("addr"))
            .await
            .expect("bind");
        let addr = listener.local_addr().expect("addr");
        let state = Arc::new(state());
        let (source, token) = interrupt_channel();
        let server = tokio::spawn(serve_rpc(listener, Arc::clone(&state), 2, token));

        let body = r#"{"method":"stop","id":1}"#;
        let mut stream = TcpStream::connect(addr).await.expect("connect");
        let request = format!(
            "POST / HTTP/1.1\r\nHost: localhost\r\nContent-Length: {}\r\n\r\n{body}",
            body.len()
        );
        stream.write_all(request.as_bytes()).await.expect("write");
        let mut response = String::new();
        stream.read_to_string(&mut response).await.expect("read");
        assert!(response.starts_with("HTTP/1.1 200 OK"));
        assert!(response.contains("dualchain server stopping"));
        assert!(state.shutdown.is_requested());

        source.interrupt();
        server.await.expect("server task");
    }
}
