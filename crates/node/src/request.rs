//! `sndevnet request`: one JSON-RPC call against a running devnet.

use std::path::Path;

use serde_json::Value;

use crate::artifact::RuntimeConfig;
use crate::error::DevnetError;
use crate::rpc::JsonRpcClient;

pub const DEFAULT_METHOD: &str = "bls_merkle_request";

pub fn parse_params(raw: Option<&str>) -> Result<Value, DevnetError> {
    let Some(raw) = raw else {
        return Ok(Value::Object(Default::default()));
    };
    let params: Value = serde_json::from_str(raw)
        .map_err(|err| DevnetError::Config(format!("invalid request params '{raw}': {err}")))?;
    if !params.is_object() && !params.is_array() {
        return Err(DevnetError::Config(format!(
            "request params must be a JSON object or array, got '{raw}'"
        )));
    }
    Ok(params)
}

/// Sends `method` to the daemon recorded in the data directory and returns
/// the full response envelope, errors included.
pub fn send(data_dir: &Path, method: &str, params: Value) -> Result<Value, DevnetError> {
    let config = RuntimeConfig::load(data_dir)?;
    let client = JsonRpcClient::new(config.listen_ip, config.listen_port);
    log_debug!("requesting {method} from {}", client.endpoint());
    Ok(client.request("/json_rpc", method, params)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn params_default_to_empty_object() {
        assert_eq!(parse_params(None).unwrap(), json!({}));
        assert_eq!(
            parse_params(Some(r#"{"address":"ab"}"#)).unwrap(),
            json!({"address": "ab"})
        );
        assert!(parse_params(Some("42")).is_err());
        assert!(parse_params(Some("{")).is_err());
    }

    #[test]
    fn missing_artifact_is_a_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = send(dir.path(), DEFAULT_METHOD, json!({})).unwrap_err();
        assert!(matches!(err, DevnetError::Config(_)));
    }
}
