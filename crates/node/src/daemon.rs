//! Native-chain daemons: RPC surface, process arguments, and the per-node
//! handle the workflows operate on.

use std::net::Ipv4Addr;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::Deserialize;
use serde_json::{json, Value};
use sndevnet_consensus::Amount;
use sndevnet_primitives::bls::hex_words;
use sndevnet_primitives::contracts::ServiceNodeParams;
use sndevnet_primitives::{Address, BlsPublicKey, BlsSignature, HexWordsError, ServiceNodeRewards};
use sndevnet_servicenode::RewardsClaim;

use crate::rpc::{JsonRpcClient, RpcError};
use crate::supervisor::{PortAllocator, ProcessHandle};
use crate::topology::exclusive_node_args;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum NodeRole {
    ServiceNode,
    Plain,
    /// Service node kept out of native registration and added later through
    /// the rewards contract.
    Bridge,
}

impl NodeRole {
    pub fn is_service_node(self) -> bool {
        !matches!(self, NodeRole::Plain)
    }

    pub fn name_prefix(self) -> &'static str {
        match self {
            NodeRole::ServiceNode => "sn",
            NodeRole::Plain => "node",
            NodeRole::Bridge => "ethsn",
        }
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct NodeEndpoint {
    pub ip: Ipv4Addr,
    pub p2p_port: u16,
    pub rpc_port: u16,
    pub qnet_port: u16,
    pub storage_port: u16,
}

impl NodeEndpoint {
    pub fn allocate(ports: &PortAllocator) -> Self {
        Self {
            ip: ports.random_loopback_ip(),
            p2p_port: ports.next_port(),
            rpc_port: ports.next_port(),
            qnet_port: ports.next_port(),
            storage_port: ports.next_port(),
        }
    }

    pub fn p2p_addr(&self) -> String {
        format!("{}:{}", self.ip, self.p2p_port)
    }

    pub fn rpc_addr(&self) -> String {
        format!("{}:{}", self.ip, self.rpc_port)
    }
}

#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq)]
pub struct ServiceKeys {
    #[serde(rename = "service_node_pubkey")]
    pub pubkey: String,
    #[serde(rename = "service_node_ed25519_pubkey", default)]
    pub ed25519: String,
    #[serde(rename = "service_node_bls_pubkey", default)]
    pub bls_pubkey: String,
}

/// One row of the network-wide service-node list.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq)]
pub struct ServiceNodeEntry {
    #[serde(default)]
    pub service_node_pubkey: String,
    #[serde(default)]
    pub quorumnet_port: i64,
    #[serde(default)]
    pub pubkey_bls: Option<String>,
}

impl ServiceNodeEntry {
    /// Uptime proof received: a reachable quorumnet port and a BLS key.
    pub fn is_proofed(&self) -> bool {
        self.quorumnet_port > 0
            && self
                .pubkey_bls
                .as_deref()
                .is_some_and(|key| !key.trim().is_empty())
    }
}

#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
pub struct ContributorState {
    pub address: String,
    pub amount: Amount,
}

/// A daemon's view of its own registration.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq)]
pub struct ServiceNodeState {
    #[serde(default)]
    pub service_node_pubkey: String,
    #[serde(default)]
    pub operator_address: Option<String>,
    #[serde(default)]
    pub staking_requirement: Amount,
    #[serde(default)]
    pub total_contributed: Amount,
    #[serde(default)]
    pub contributors: Vec<ContributorState>,
}

impl ServiceNodeState {
    pub fn is_fully_staked(&self) -> bool {
        self.staking_requirement > 0 && self.total_contributed >= self.staking_requirement
    }
}

/// Self-signed arguments for adding a node through the rewards contract.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
pub struct BlsRegistrationArgs {
    #[serde(default)]
    pub address: String,
    pub bls_pubkey: String,
    pub proof_of_possession: String,
    pub service_node_pubkey: String,
    pub service_node_signature: String,
}

impl BlsRegistrationArgs {
    pub fn contract_call(
        &self,
        fee: u16,
    ) -> Result<ServiceNodeRewards::addBLSPublicKeyCall, HexWordsError> {
        let pubkey = BlsPublicKey::from_hex(&self.bls_pubkey)?;
        let proof = BlsSignature::from_hex(&self.proof_of_possession)?;
        let [sn_pubkey] = hex_words::<1>(&self.service_node_pubkey)?;
        let [sig1, sig2] = hex_words::<2>(&self.service_node_signature)?;
        Ok(ServiceNodeRewards::addBLSPublicKeyCall {
            blsPubkey: pubkey.to_point(),
            blsSignature: proof.to_params(),
            serviceNodeParams: ServiceNodeParams {
                serviceNodePubkey: sn_pubkey,
                serviceNodeSignature1: sig1,
                serviceNodeSignature2: sig2,
                fee,
            },
        })
    }

    pub fn bls_public_key(&self) -> Result<BlsPublicKey, HexWordsError> {
        BlsPublicKey::from_hex(&self.bls_pubkey)
    }
}

#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
pub struct RewardsResponse {
    pub address: String,
    pub amount: u64,
    #[serde(default)]
    pub height: u64,
    pub signature: String,
    #[serde(default)]
    pub non_signer_indices: Vec<u64>,
}

impl RewardsResponse {
    pub fn into_claim(self) -> Result<RewardsClaim, String> {
        let beneficiary = self
            .address
            .parse::<Address>()
            .map_err(|err| format!("rewards address '{}': {err}", self.address))?;
        let signature = BlsSignature::from_hex(&self.signature)
            .map_err(|err| format!("rewards signature: {err}"))?;
        Ok(RewardsClaim {
            beneficiary,
            amount: sndevnet_primitives::U256::from(self.amount),
            signature,
            non_signer_indices: self.non_signer_indices,
        })
    }
}

/// Requests the workflows issue against one daemon.
pub trait DaemonApi: Send + Sync {
    fn height(&self) -> Result<u64, RpcError>;
    fn start_mining(&self, miner_address: &str, blocks: u64) -> Result<(), RpcError>;
    fn mining_active(&self) -> Result<bool, RpcError>;
    fn staking_requirement(&self) -> Result<Amount, RpcError>;
    fn service_keys(&self) -> Result<ServiceKeys, RpcError>;
    /// Every registered service node as this daemon sees it.
    fn service_node_states(&self) -> Result<Vec<ServiceNodeEntry>, RpcError>;
    /// This daemon's own registration, if any.
    fn service_node_status(&self) -> Result<Option<ServiceNodeState>, RpcError>;
    fn registration_command(
        &self,
        args: &[String],
        staking_requirement: Amount,
    ) -> Result<String, RpcError>;
    fn storage_server_ping(&self, ed25519_pubkey: &str) -> Result<(), RpcError>;
    fn lokinet_ping(&self, ed25519_pubkey: &str) -> Result<(), RpcError>;
    fn trigger_uptime_proof(&self) -> Result<(), RpcError>;
    /// Returns the reported status string (`OK` on success).
    fn flush_txpool(&self) -> Result<String, RpcError>;
    fn bls_registration_args(&self, address: &str) -> Result<BlsRegistrationArgs, RpcError>;
    fn bls_rewards(&self, address: &str) -> Result<RewardsResponse, RpcError>;
}

pub struct RpcDaemon {
    client: JsonRpcClient,
}

impl RpcDaemon {
    pub fn new(client: JsonRpcClient) -> Self {
        Self { client }
    }

    pub fn client(&self) -> &JsonRpcClient {
        &self.client
    }
}

fn decode<T: for<'de> Deserialize<'de>>(value: Value, what: &str) -> Result<T, RpcError> {
    serde_json::from_value(value).map_err(|err| RpcError::InvalidResponse(format!("{what}: {err}")))
}

// Daemons answer with `status: "OK"` on success and an explanation otherwise.
fn require_ok(value: &Value, what: &str) -> Result<(), RpcError> {
    match value.get("status").and_then(Value::as_str) {
        Some("OK") | None => Ok(()),
        Some(status) => Err(RpcError::Remote {
            code: 0,
            message: format!("{what}: {status}"),
        }),
    }
}

const FAKE_PING_VERSION: [u32; 3] = [9, 9, 9];

impl DaemonApi for RpcDaemon {
    fn height(&self) -> Result<u64, RpcError> {
        let info = self.client.call("get_info", json!({}))?;
        info.get("height")
            .and_then(Value::as_u64)
            .ok_or_else(|| RpcError::InvalidResponse("get_info without height".to_string()))
    }

    fn start_mining(&self, miner_address: &str, blocks: u64) -> Result<(), RpcError> {
        let response = self.client.post(
            "/start_mining",
            &json!({
                "miner_address": miner_address,
                "threads_count": 1,
                "num_blocks": blocks,
                "slow_mining": false,
            }),
        )?;
        require_ok(&response, "start_mining")
    }

    fn mining_active(&self) -> Result<bool, RpcError> {
        let response = self.client.post("/mining_status", &json!({}))?;
        response
            .get("active")
            .and_then(Value::as_bool)
            .ok_or_else(|| RpcError::InvalidResponse("mining_status without active".to_string()))
    }

    fn staking_requirement(&self) -> Result<Amount, RpcError> {
        let result = self.client.call("get_staking_requirement", json!({}))?;
        result
            .get("staking_requirement")
            .and_then(Value::as_u64)
            .ok_or_else(|| {
                RpcError::InvalidResponse("get_staking_requirement without amount".to_string())
            })
    }

    fn service_keys(&self) -> Result<ServiceKeys, RpcError> {
        decode(
            self.client.call("get_service_keys", json!({}))?,
            "get_service_keys",
        )
    }

    fn service_node_states(&self) -> Result<Vec<ServiceNodeEntry>, RpcError> {
        let mut result = self.client.call(
            "get_n_service_nodes",
            json!({
                "fields": {
                    "service_node_pubkey": true,
                    "quorumnet_port": true,
                    "pubkey_bls": true,
                }
            }),
        )?;
        decode(
            result
                .get_mut("service_node_states")
                .map(Value::take)
                .unwrap_or_else(|| json!([])),
            "get_n_service_nodes",
        )
    }

    fn service_node_status(&self) -> Result<Option<ServiceNodeState>, RpcError> {
        let mut result = self.client.call("get_service_node_status", json!({}))?;
        match result.get_mut("service_node_state").map(Value::take) {
            Some(Value::Null) | None => Ok(None),
            Some(state) => {
                // Unregistered nodes still report their pubkey with no stake.
                if state.get("staking_requirement").is_none() {
                    return Ok(None);
                }
                decode(state, "get_service_node_status").map(Some)
            }
        }
    }

    fn registration_command(
        &self,
        args: &[String],
        staking_requirement: Amount,
    ) -> Result<String, RpcError> {
        let result = self.client.call(
            "get_service_node_registration_cmd_raw",
            json!({
                "args": args,
                "make_friendly": false,
                "staking_requirement": staking_requirement,
            }),
        )?;
        require_ok(&result, "get_service_node_registration_cmd_raw")?;
        result
            .get("registration_cmd")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| RpcError::InvalidResponse("missing registration_cmd".to_string()))
    }

    fn storage_server_ping(&self, ed25519_pubkey: &str) -> Result<(), RpcError> {
        let result = self.client.call(
            "storage_server_ping",
            json!({
                "version": FAKE_PING_VERSION,
                "https_port": 0,
                "omq_port": 0,
                "pubkey_ed25519": ed25519_pubkey,
            }),
        )?;
        require_ok(&result, "storage_server_ping")
    }

    fn lokinet_ping(&self, ed25519_pubkey: &str) -> Result<(), RpcError> {
        let result = self.client.call(
            "lokinet_ping",
            json!({
                "version": FAKE_PING_VERSION,
                "pubkey_ed25519": ed25519_pubkey,
            }),
        )?;
        require_ok(&result, "lokinet_ping")
    }

    fn trigger_uptime_proof(&self) -> Result<(), RpcError> {
        self.client
            .call("test_trigger_uptime_proof", json!({}))
            .map(|_| ())
    }

    fn flush_txpool(&self) -> Result<String, RpcError> {
        let result = self.client.call("flush_txpool", json!({}))?;
        Ok(result
            .get("status")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string())
    }

    fn bls_registration_args(&self, address: &str) -> Result<BlsRegistrationArgs, RpcError> {
        decode(
            self.client
                .call("bls_registration_request", json!({ "address": address }))?,
            "bls_registration_request",
        )
    }

    fn bls_rewards(&self, address: &str) -> Result<RewardsResponse, RpcError> {
        decode(
            self.client
                .call("bls_rewards_request", json!({ "address": address }))?,
            "bls_rewards_request",
        )
    }
}

/// Command line for one daemon process.
pub fn daemon_args(
    data_dir: &Path,
    endpoint: &NodeEndpoint,
    role: NodeRole,
    peer_addrs: &[String],
    log_level: u8,
) -> Vec<String> {
    let mut args = vec![
        "--dev-allow-local-ips".to_string(),
        "--fixed-difficulty=1".to_string(),
        "--devnet".to_string(),
        "--non-interactive".to_string(),
        format!("--data-dir={}", data_dir.display()),
        format!("--log-level={log_level}"),
        format!("--p2p-bind-ip={}", endpoint.ip),
        format!("--p2p-bind-port={}", endpoint.p2p_port),
        format!("--rpc-admin={}", endpoint.rpc_addr()),
        format!("--quorumnet-port={}", endpoint.qnet_port),
    ];
    args.extend(exclusive_node_args(peer_addrs.iter().map(String::as_str)));
    if role.is_service_node() {
        args.push("--service-node".to_string());
        args.push(format!("--service-node-public-ip={}", endpoint.ip));
        args.push(format!("--storage-server-port={}", endpoint.storage_port));
    }
    args
}

/// A daemon owned by the network. Its height is a cached observation that
/// never moves backwards.
pub struct Node {
    name: String,
    role: NodeRole,
    endpoint: NodeEndpoint,
    peers: Vec<usize>,
    process: Option<ProcessHandle>,
    api: Arc<dyn DaemonApi>,
    height: AtomicU64,
}

impl Node {
    pub fn new(
        name: impl Into<String>,
        role: NodeRole,
        endpoint: NodeEndpoint,
        api: Arc<dyn DaemonApi>,
    ) -> Self {
        Self {
            name: name.into(),
            role,
            endpoint,
            peers: Vec::new(),
            process: None,
            api,
            height: AtomicU64::new(0),
        }
    }

    pub fn with_peers(mut self, peers: Vec<usize>) -> Self {
        self.peers = peers;
        self
    }

    pub fn with_process(mut self, process: ProcessHandle) -> Self {
        self.process = Some(process);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn role(&self) -> NodeRole {
        self.role
    }

    pub fn endpoint(&self) -> &NodeEndpoint {
        &self.endpoint
    }

    pub fn peers(&self) -> &[usize] {
        &self.peers
    }

    pub fn process(&self) -> Option<ProcessHandle> {
        self.process
    }

    pub fn api(&self) -> &dyn DaemonApi {
        self.api.as_ref()
    }

    pub fn cached_height(&self) -> u64 {
        self.height.load(Ordering::Acquire)
    }

    /// Records an observation and returns the best known height.
    pub fn observe_height(&self, height: u64) -> u64 {
        self.height.fetch_max(height, Ordering::AcqRel).max(height)
    }

    pub fn query_height(&self) -> Result<u64, RpcError> {
        let height = self.api.height()?;
        Ok(self.observe_height(height))
    }
}
