//! Wallet RPC processes and the handle the workflows fund and spend through.

use std::net::Ipv4Addr;
use std::path::Path;
use std::sync::{Arc, Mutex};

use serde_json::{json, Value};
use sndevnet_consensus::{format_coins, Amount};

use crate::rpc::{JsonRpcClient, RpcError};
use crate::supervisor::{PortAllocator, ProcessHandle};

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct Balance {
    pub total: Amount,
    pub unlocked: Amount,
}

pub trait WalletApi: Send + Sync {
    /// Answers as soon as the RPC server is up, before any wallet is open.
    fn version(&self) -> Result<u64, RpcError>;
    fn create_wallet(&self, filename: &str) -> Result<(), RpcError>;
    fn address(&self) -> Result<String, RpcError>;
    fn refresh(&self) -> Result<(), RpcError>;
    fn balance(&self) -> Result<Balance, RpcError>;
    /// Returns the transaction hash.
    fn transfer(&self, destination: &str, amount: Amount) -> Result<String, RpcError>;
    fn register_service_node(&self, registration_cmd: &str) -> Result<(), RpcError>;
    fn stake(
        &self,
        service_node_key: &str,
        destination: &str,
        amount: Amount,
    ) -> Result<(), RpcError>;
}

pub struct RpcWallet {
    client: JsonRpcClient,
}

impl RpcWallet {
    pub fn new(client: JsonRpcClient) -> Self {
        Self { client }
    }
}

fn expect_str(value: &Value, field: &str, method: &str) -> Result<String, RpcError> {
    value
        .get(field)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| RpcError::InvalidResponse(format!("{method} without {field}")))
}

impl WalletApi for RpcWallet {
    fn version(&self) -> Result<u64, RpcError> {
        let result = self.client.call("get_version", json!({}))?;
        result
            .get("version")
            .and_then(Value::as_u64)
            .ok_or_else(|| RpcError::InvalidResponse("get_version without version".to_string()))
    }

    fn create_wallet(&self, filename: &str) -> Result<(), RpcError> {
        self.client
            .call(
                "create_wallet",
                json!({ "filename": filename, "password": "", "language": "English" }),
            )
            .map(|_| ())
    }

    fn address(&self) -> Result<String, RpcError> {
        let result = self
            .client
            .call("get_address", json!({ "account_index": 0 }))?;
        expect_str(&result, "address", "get_address")
    }

    fn refresh(&self) -> Result<(), RpcError> {
        self.client.call("refresh", json!({})).map(|_| ())
    }

    fn balance(&self) -> Result<Balance, RpcError> {
        let result = self
            .client
            .call("get_balance", json!({ "account_index": 0 }))?;
        Ok(Balance {
            total: result.get("balance").and_then(Value::as_u64).unwrap_or(0),
            unlocked: result
                .get("unlocked_balance")
                .and_then(Value::as_u64)
                .unwrap_or(0),
        })
    }

    fn transfer(&self, destination: &str, amount: Amount) -> Result<String, RpcError> {
        let result = self.client.call(
            "transfer",
            json!({
                "destinations": [{ "address": destination, "amount": amount }],
                "priority": 1,
            }),
        )?;
        expect_str(&result, "tx_hash", "transfer")
    }

    fn register_service_node(&self, registration_cmd: &str) -> Result<(), RpcError> {
        let result = self.client.call(
            "register_service_node",
            json!({ "register_service_node_str": registration_cmd }),
        )?;
        reject_failed_status(&result, "register_service_node")
    }

    fn stake(
        &self,
        service_node_key: &str,
        destination: &str,
        amount: Amount,
    ) -> Result<(), RpcError> {
        let result = self.client.call(
            "stake",
            json!({
                "destination": destination,
                "amount": amount,
                "service_node_key": service_node_key,
            }),
        )?;
        reject_failed_status(&result, "stake")
    }
}

// Staking calls report failures in the result body rather than as RPC errors.
fn reject_failed_status(result: &Value, method: &str) -> Result<(), RpcError> {
    match result.get("status").and_then(Value::as_str) {
        Some(status) if !status.eq_ignore_ascii_case("ok") => Err(RpcError::Remote {
            code: 0,
            message: format!(
                "{method}: {status} {}",
                result
                    .get("error_msg")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
            )
            .trim_end()
            .to_string(),
        }),
        _ => Ok(()),
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct WalletEndpoint {
    pub ip: Ipv4Addr,
    pub rpc_port: u16,
}

impl WalletEndpoint {
    pub fn allocate(ports: &PortAllocator) -> Self {
        Self {
            ip: ports.random_loopback_ip(),
            rpc_port: ports.next_port(),
        }
    }
}

pub fn wallet_args(
    endpoint: &WalletEndpoint,
    daemon_rpc_addr: &str,
    wallet_dir: &Path,
    log_file: &Path,
) -> Vec<String> {
    vec![
        "--disable-rpc-login".to_string(),
        "--non-interactive".to_string(),
        format!("--rpc-bind-ip={}", endpoint.ip),
        format!("--rpc-bind-port={}", endpoint.rpc_port),
        format!("--daemon-address={daemon_rpc_addr}"),
        format!("--wallet-dir={}", wallet_dir.display()),
        format!("--log-file={}", log_file.display()),
    ]
}

/// A wallet RPC process bound to one daemon (by index into the network's node
/// list). The address is fetched once and cached until a new wallet file is
/// created.
pub struct Wallet {
    name: String,
    node: usize,
    endpoint: WalletEndpoint,
    process: Option<ProcessHandle>,
    api: Arc<dyn WalletApi>,
    address: Mutex<Option<String>>,
    generation: Mutex<u32>,
}

impl Wallet {
    pub fn new(
        name: impl Into<String>,
        node: usize,
        endpoint: WalletEndpoint,
        api: Arc<dyn WalletApi>,
    ) -> Self {
        Self {
            name: name.into(),
            node,
            endpoint,
            process: None,
            api,
            address: Mutex::new(None),
            generation: Mutex::new(0),
        }
    }

    pub fn with_process(mut self, process: ProcessHandle) -> Self {
        self.process = Some(process);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn node(&self) -> usize {
        self.node
    }

    pub fn endpoint(&self) -> &WalletEndpoint {
        &self.endpoint
    }

    pub fn process(&self) -> Option<ProcessHandle> {
        self.process
    }

    pub fn api(&self) -> &dyn WalletApi {
        self.api.as_ref()
    }

    pub fn address(&self) -> Result<String, RpcError> {
        let mut cached = self
            .address
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(address) = cached.as_ref() {
            return Ok(address.clone());
        }
        let address = self.api.address()?;
        *cached = Some(address.clone());
        Ok(address)
    }

    /// Creates the wallet file named after the wallet and caches its address.
    pub fn ready(&self) -> Result<String, RpcError> {
        self.api.create_wallet(&self.name)?;
        self.clear_address();
        self.address()
    }

    /// Switches to a freshly created wallet file.
    pub fn new_wallet(&self) -> Result<String, RpcError> {
        let generation = {
            let mut generation = self
                .generation
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            *generation += 1;
            *generation
        };
        self.api
            .create_wallet(&format!("{}-{generation}", self.name))?;
        self.clear_address();
        self.address()
    }

    fn clear_address(&self) {
        *self
            .address
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = None;
    }

    pub fn refresh(&self) -> Result<(), RpcError> {
        self.api.refresh()
    }

    /// Refreshes, then reads the balance. The snapshot is only meaningful
    /// until the next block or transaction.
    pub fn balances(&self) -> Result<Balance, RpcError> {
        self.api.refresh()?;
        self.api.balance()
    }

    pub fn describe_balance(&self, balance: &Balance) -> String {
        format!(
            "{:<14} {} (total) with {} (unlocked)",
            self.name,
            format_coins(balance.total),
            format_coins(balance.unlocked)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct CountingWallet {
        created: Mutex<Vec<String>>,
        address_calls: AtomicUsize,
    }

    impl WalletApi for CountingWallet {
        fn version(&self) -> Result<u64, RpcError> {
            Ok(1)
        }
        fn create_wallet(&self, filename: &str) -> Result<(), RpcError> {
            self.created.lock().unwrap().push(filename.to_string());
            Ok(())
        }
        fn address(&self) -> Result<String, RpcError> {
            let n = self.address_calls.fetch_add(1, Ordering::SeqCst);
            let created = self.created.lock().unwrap();
            Ok(format!("addr-{}-{n}", created.last().cloned().unwrap_or_default()))
        }
        fn refresh(&self) -> Result<(), RpcError> {
            Ok(())
        }
        fn balance(&self) -> Result<Balance, RpcError> {
            Ok(Balance::default())
        }
        fn transfer(&self, _: &str, _: Amount) -> Result<String, RpcError> {
            Ok(String::new())
        }
        fn register_service_node(&self, _: &str) -> Result<(), RpcError> {
            Ok(())
        }
        fn stake(&self, _: &str, _: &str, _: Amount) -> Result<(), RpcError> {
            Ok(())
        }
    }

    fn wallet(api: Arc<CountingWallet>) -> Wallet {
        Wallet::new(
            "Alice",
            0,
            WalletEndpoint {
                ip: Ipv4Addr::LOCALHOST,
                rpc_port: 1200,
            },
            api,
        )
    }

    #[test]
    fn address_is_cached_until_new_wallet() {
        let api = Arc::new(CountingWallet::default());
        let alice = wallet(api.clone());
        let first = alice.ready().unwrap();
        assert_eq!(alice.address().unwrap(), first);
        assert_eq!(api.address_calls.load(Ordering::SeqCst), 1);

        let second = alice.new_wallet().unwrap();
        assert_ne!(first, second);
        assert_eq!(
            *api.created.lock().unwrap(),
            vec!["Alice".to_string(), "Alice-1".to_string()]
        );
    }

    #[test]
    fn failed_stake_status_is_an_error() {
        let err = reject_failed_status(
            &json!({ "status": "Failed", "error_msg": "not enough unlocked balance" }),
            "stake",
        )
        .unwrap_err();
        assert!(err.remote_message_contains("unlocked balance"));
        assert!(reject_failed_status(&json!({ "status": "OK" }), "stake").is_ok());
        assert!(reject_failed_status(&json!({}), "stake").is_ok());
    }
}
