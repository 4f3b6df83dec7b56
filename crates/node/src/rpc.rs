//! Minimal JSON-RPC over HTTP/1.1.
//!
//! Each request opens a fresh connection with `Connection: close`, writes one
//! POST and reads the response to EOF. Both the native daemons and the EVM
//! node answer on loopback, so nothing here pools connections.

use std::fmt;
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::time::Duration;

use serde_json::{json, Value};

pub const DEFAULT_RPC_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum RpcError {
    /// Target refused, reset or never answered. Pollers treat this as "not
    /// ready yet".
    Unreachable(String),
    Http { status: String },
    Remote { code: i64, message: String },
    InvalidResponse(String),
}

impl RpcError {
    pub fn is_transient(&self) -> bool {
        matches!(self, RpcError::Unreachable(_))
    }

    /// Case-insensitive search in the remote error message.
    pub fn remote_message_contains(&self, needle: &str) -> bool {
        match self {
            RpcError::Remote { message, .. } => message
                .to_ascii_lowercase()
                .contains(&needle.to_ascii_lowercase()),
            _ => false,
        }
    }
}

impl fmt::Display for RpcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RpcError::Unreachable(message) => write!(f, "rpc unreachable: {message}"),
            RpcError::Http { status } => write!(f, "rpc returned '{status}'"),
            RpcError::Remote { code, message } => write!(f, "rpc error {code}: {message}"),
            RpcError::InvalidResponse(message) => write!(f, "invalid rpc response: {message}"),
        }
    }
}

impl std::error::Error for RpcError {}

#[derive(Clone, Debug)]
pub struct JsonRpcClient {
    host: String,
    port: u16,
    timeout: Duration,
}

impl JsonRpcClient {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            timeout: DEFAULT_RPC_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// JSON-RPC call on the daemon's `/json_rpc` path. Returns `result`.
    pub fn call(&self, method: &str, params: Value) -> Result<Value, RpcError> {
        let envelope = self.request("/json_rpc", method, params)?;
        result_of(envelope)
    }

    /// Full response envelope, including any `error` member.
    pub fn request(&self, path: &str, method: &str, params: Value) -> Result<Value, RpcError> {
        let body = json!({
            "jsonrpc": "2.0",
            "id": "0",
            "method": method,
            "params": params,
        });
        self.post(path, &body)
    }

    /// Plain POST of a JSON body, used for the daemon's non-JSON-RPC endpoints.
    pub fn post(&self, path: &str, body: &Value) -> Result<Value, RpcError> {
        if !path.starts_with('/') {
            return Err(RpcError::InvalidResponse(format!("invalid path '{path}'")));
        }
        let payload = serde_json::to_vec(body)
            .map_err(|err| RpcError::InvalidResponse(format!("encode request: {err}")))?;
        let addr = self.resolve()?;
        let mut stream = TcpStream::connect_timeout(&addr, self.timeout)
            .map_err(|err| RpcError::Unreachable(format!("connect {addr}: {err}")))?;
        let _ = stream.set_read_timeout(Some(self.timeout));
        let _ = stream.set_write_timeout(Some(self.timeout));

        let head = format!(
            "POST {path} HTTP/1.1\r\nHost: {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
            self.endpoint(),
            payload.len()
        );
        stream
            .write_all(head.as_bytes())
            .and_then(|_| stream.write_all(&payload))
            .map_err(|err| RpcError::Unreachable(format!("write request to {addr}: {err}")))?;
        let mut response = Vec::new();
        stream
            .read_to_end(&mut response)
            .map_err(|err| RpcError::Unreachable(format!("read response from {addr}: {err}")))?;

        let body = parse_http_response(&response)?;
        serde_json::from_slice(&body)
            .map_err(|err| RpcError::InvalidResponse(format!("invalid json: {err}")))
    }

    fn resolve(&self) -> Result<SocketAddr, RpcError> {
        (self.host.as_str(), self.port)
            .to_socket_addrs()
            .map_err(|err| RpcError::Unreachable(format!("resolve {}: {err}", self.endpoint())))?
            .next()
            .ok_or_else(|| RpcError::Unreachable(format!("no address for {}", self.endpoint())))
    }
}

fn result_of(mut envelope: Value) -> Result<Value, RpcError> {
    if let Some(error) = envelope.get("error").filter(|error| !error.is_null()) {
        return Err(RpcError::Remote {
            code: error.get("code").and_then(Value::as_i64).unwrap_or(0),
            message: error
                .get("message")
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_else(|| error.to_string()),
        });
    }
    match envelope.get_mut("result") {
        Some(result) => Ok(result.take()),
        None => Err(RpcError::InvalidResponse(
            "response has neither result nor error".to_string(),
        )),
    }
}

fn parse_http_response(raw: &[u8]) -> Result<Vec<u8>, RpcError> {
    let split = find(raw, b"\r\n\r\n")
        .ok_or_else(|| RpcError::InvalidResponse("invalid http response".to_string()))?;
    let head = std::str::from_utf8(&raw[..split])
        .map_err(|_| RpcError::InvalidResponse("http head is not utf-8".to_string()))?;
    let body = &raw[split + 4..];

    let mut lines = head.lines();
    let status_line = lines.next().unwrap_or_default();
    let status_ok = status_line
        .split_whitespace()
        .nth(1)
        .is_some_and(|code| code == "200");
    if !status_ok {
        return Err(RpcError::Http {
            status: status_line.to_string(),
        });
    }

    let chunked = lines.any(|line| {
        let line = line.to_ascii_lowercase();
        line.starts_with("transfer-encoding:") && line.contains("chunked")
    });
    if chunked {
        decode_chunked(body)
    } else {
        Ok(body.to_vec())
    }
}

fn decode_chunked(mut body: &[u8]) -> Result<Vec<u8>, RpcError> {
    let truncated = || RpcError::InvalidResponse("truncated chunked body".to_string());
    let mut out = Vec::new();
    loop {
        let line_end = find(body, b"\r\n").ok_or_else(truncated)?;
        let size_line = std::str::from_utf8(&body[..line_end])
            .map_err(|_| RpcError::InvalidResponse("chunk size is not utf-8".to_string()))?;
        let size_hex = size_line.split(';').next().unwrap_or_default().trim();
        let size = usize::from_str_radix(size_hex, 16)
            .map_err(|_| RpcError::InvalidResponse(format!("invalid chunk size '{size_hex}'")))?;
        body = &body[line_end + 2..];
        if size == 0 {
            return Ok(out);
        }
        if body.len() < size {
            return Err(truncated());
        }
        out.extend_from_slice(&body[..size]);
        body = &body[size..];
        body = body.strip_prefix(b"\r\n").unwrap_or(body);
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}
