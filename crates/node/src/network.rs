//! The devnet context: every daemon and wallet of one run, created fresh or
//! reused for another round of testing.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use sndevnet_consensus::{format_coins, Amount, DevnetParams};

use crate::artifact::RuntimeConfig;
use crate::barrier::{self, SYNC_TIMEOUT};
use crate::daemon::{daemon_args, DaemonApi, Node, NodeEndpoint, NodeRole, RpcDaemon};
use crate::error::DevnetError;
use crate::poller::Readiness;
use crate::pool;
use crate::rpc::{JsonRpcClient, RpcError};
use crate::supervisor::{PortAllocator, ProcessSpec, ProcessSupervisor};
use crate::topology::peer_graph;
use crate::wallet::{wallet_args, RpcWallet, Wallet, WalletApi, WalletEndpoint};

pub const DAEMON_BIN: &str = "oxend";
pub const WALLET_BIN: &str = "oxen-wallet-rpc";
pub const NAMED_WALLETS: [&str; 3] = ["Alice", "Bob", "Mike"];
pub const DEFAULT_SERVICE_NODES: usize = 12;
pub const DEFAULT_NODES: usize = 3;
pub const DEFAULT_EXTRA_WALLETS: usize = 9;
/// Blocks mined by [`Network::attach`] to clear the mempool.
pub const ATTACH_BLOCKS: u64 = 5;
const MINE_TIMEOUT_PER_BLOCK: Duration = Duration::from_secs(5);
// Never removed when the data directory is reset.
const LOCK_FILE: &str = ".lock";

#[derive(Clone, Debug)]
pub struct NetworkConfig {
    pub bin_dir: PathBuf,
    pub data_dir: PathBuf,
    /// Service nodes registered on the native chain; the bridge node is extra.
    pub service_nodes: usize,
    pub nodes: usize,
    pub extra_wallets: usize,
    pub daemon_log_level: u8,
    pub workers: usize,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            bin_dir: PathBuf::from("../../build/bin"),
            data_dir: PathBuf::from("testdata"),
            service_nodes: DEFAULT_SERVICE_NODES,
            nodes: DEFAULT_NODES,
            extra_wallets: DEFAULT_EXTRA_WALLETS,
            daemon_log_level: 2,
            workers: pool::DEFAULT_WORKERS,
        }
    }
}

impl NetworkConfig {
    pub fn validate(&self) -> Result<(), DevnetError> {
        if self.service_nodes == 0 {
            return Err(DevnetError::Config(
                "at least one service node is required".to_string(),
            ));
        }
        if self.nodes == 0 {
            return Err(DevnetError::Config(
                "at least one plain node is required to host wallets".to_string(),
            ));
        }
        Ok(())
    }
}

/// Nodes are ordered service nodes, plain nodes, then the bridge node.
/// Wallets are Alice, Bob, Mike, then the extra contributor wallets.
pub struct Network {
    params: DevnetParams,
    supervisor: Arc<ProcessSupervisor>,
    data_dir: PathBuf,
    nodes: Vec<Node>,
    service_nodes: usize,
    plain_nodes: usize,
    wallets: Vec<Wallet>,
}

fn role_rank(role: NodeRole) -> u8 {
    match role {
        NodeRole::ServiceNode => 0,
        NodeRole::Plain => 1,
        NodeRole::Bridge => 2,
    }
}

impl Network {
    /// Assembles a context from already-running nodes and wallets.
    pub fn from_parts(
        params: DevnetParams,
        supervisor: Arc<ProcessSupervisor>,
        data_dir: impl Into<PathBuf>,
        nodes: Vec<Node>,
        wallets: Vec<Wallet>,
    ) -> Result<Self, DevnetError> {
        if nodes
            .windows(2)
            .any(|pair| role_rank(pair[0].role()) > role_rank(pair[1].role()))
        {
            return Err(DevnetError::Config(
                "nodes must be ordered service nodes, plain nodes, bridge".to_string(),
            ));
        }
        let count = |role| nodes.iter().filter(|node| node.role() == role).count();
        let service_nodes = count(NodeRole::ServiceNode);
        let plain_nodes = count(NodeRole::Plain);
        if count(NodeRole::Bridge) > 1 {
            return Err(DevnetError::Config("at most one bridge node".to_string()));
        }
        if wallets.len() < NAMED_WALLETS.len() {
            return Err(DevnetError::Config(format!(
                "expected at least {} wallets, got {}",
                NAMED_WALLETS.len(),
                wallets.len()
            )));
        }
        if let Some(wallet) = wallets.iter().find(|wallet| wallet.node() >= nodes.len()) {
            return Err(DevnetError::Config(format!(
                "wallet {} is bound to missing node {}",
                wallet.name(),
                wallet.node()
            )));
        }
        Ok(Self {
            params,
            supervisor,
            data_dir: data_dir.into(),
            nodes,
            service_nodes,
            plain_nodes,
            wallets,
        })
    }

    /// Fresh bring-up of every process. The data directory is wiped first.
    pub fn create(
        config: &NetworkConfig,
        params: DevnetParams,
        supervisor: Arc<ProcessSupervisor>,
    ) -> Result<Self, DevnetError> {
        config.validate()?;
        let started = Instant::now();
        reset_data_dir(&config.data_dir)?;
        log_info!("Using '{}' for data files and logs", config.data_dir.display());

        let ports = PortAllocator::default();
        let mut layout = Vec::new();
        let mut push_role = |role: NodeRole, count: usize| {
            for index in 0..count {
                layout.push((
                    format!("{}-{index:02}", role.name_prefix()),
                    role,
                    NodeEndpoint::allocate(&ports),
                ));
            }
        };
        push_role(NodeRole::ServiceNode, config.service_nodes);
        push_role(NodeRole::Plain, config.nodes);
        push_role(NodeRole::Bridge, 1);

        let graph = peer_graph(layout.len());
        let daemon = config.bin_dir.join(DAEMON_BIN);
        let jobs: Vec<usize> = (0..layout.len()).collect();
        log_info!("Starting {} oxend processes", layout.len());
        let nodes = pool::map(&jobs, config.workers, |&index| -> Result<Node, DevnetError> {
            let (name, role, endpoint) = &layout[index];
            let peer_addrs: Vec<String> = graph[index]
                .iter()
                .map(|&peer| layout[peer].2.p2p_addr())
                .collect();
            let node_dir = config.data_dir.join(name);
            create_dir(&node_dir)?;
            let spec = ProcessSpec::new(name.clone(), &daemon).args(daemon_args(
                &node_dir,
                endpoint,
                *role,
                &peer_addrs,
                config.daemon_log_level,
            ));
            let handle = supervisor.spawn(&spec)?;
            let api = Arc::new(RpcDaemon::new(JsonRpcClient::new(
                endpoint.ip.to_string(),
                endpoint.rpc_port,
            )));
            supervisor.wait_ready(handle, || api.height().map(|_| Readiness::Ready))?;
            progress!(" {}", endpoint.rpc_port);
            Ok(Node::new(name.clone(), *role, endpoint.clone(), api)
                .with_peers(graph[index].clone())
                .with_process(handle))
        })?;
        log_info!("All oxend processes are ready");

        let wallet_bin = config.bin_dir.join(WALLET_BIN);
        let names: Vec<String> = NAMED_WALLETS
            .iter()
            .map(|name| name.to_string())
            .chain((0..config.extra_wallets).map(|index| format!("extrawallet-{index}")))
            .collect();
        let jobs: Vec<usize> = (0..names.len()).collect();
        let wallets = pool::map(&jobs, config.workers, |&index| -> Result<Wallet, DevnetError> {
            let name = &names[index];
            let node = config.service_nodes + index % config.nodes;
            let endpoint = WalletEndpoint::allocate(&ports);
            let wallet_dir = config.data_dir.join(name);
            create_dir(&wallet_dir)?;
            log_info!(
                "Starting new RPC wallet {name} at {}:{}",
                endpoint.ip,
                endpoint.rpc_port
            );
            let spec = ProcessSpec::new(name.clone(), &wallet_bin).args(wallet_args(
                &endpoint,
                &nodes[node].endpoint().rpc_addr(),
                &wallet_dir,
                &wallet_dir.join("wallet.log"),
            ));
            let handle = supervisor.spawn(&spec)?;
            let api = Arc::new(RpcWallet::new(JsonRpcClient::new(
                endpoint.ip.to_string(),
                endpoint.rpc_port,
            )));
            supervisor.wait_ready(handle, || api.version().map(|_| Readiness::Ready))?;
            let wallet = Wallet::new(name.clone(), node, endpoint, api).with_process(handle);
            wallet.ready()?;
            Ok(wallet)
        })?;

        let network = Self::from_parts(params, supervisor, &config.data_dir, nodes, wallets)?;
        for wallet in network.wallets() {
            wallet.refresh()?;
            log_info!("Wallet {} is ready: {}", wallet.name(), wallet.address()?);
        }
        let artifact = network.runtime_config()?.write(&network.data_dir)?;
        log_info!(
            "Processes started in {:.1}s; connection details in {}",
            started.elapsed().as_secs_f64(),
            artifact.display()
        );
        Ok(network)
    }

    /// Prepares an existing network for another round: fresh wallets for
    /// Alice and Bob, empty mempools, and a few blocks mined on top.
    pub fn attach(&self) -> Result<(), DevnetError> {
        log_info!("Reusing running network");
        self.alice().new_wallet()?;
        self.bob().new_wallet()?;
        for node in &self.nodes {
            let status = node.api().flush_txpool()?;
            if status != "OK" {
                return Err(DevnetError::mismatch(
                    format!("flush_txpool on {}", node.name()),
                    "OK",
                    status,
                ));
            }
        }
        self.mine_and_sync(ATTACH_BLOCKS)?;
        self.refresh_wallets()?;
        log_info!("Alice has new wallet: {}", self.alice().address()?);
        log_info!("Bob   has new wallet: {}", self.bob().address()?);
        Ok(())
    }

    pub fn params(&self) -> &DevnetParams {
        &self.params
    }

    pub fn supervisor(&self) -> &Arc<ProcessSupervisor> {
        &self.supervisor
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn node_refs(&self) -> Vec<&Node> {
        self.nodes.iter().collect()
    }

    pub fn service_nodes(&self) -> &[Node] {
        &self.nodes[..self.service_nodes]
    }

    pub fn plain_nodes(&self) -> &[Node] {
        &self.nodes[self.service_nodes..self.service_nodes + self.plain_nodes]
    }

    pub fn bridge(&self) -> Option<&Node> {
        self.nodes
            .last()
            .filter(|node| node.role() == NodeRole::Bridge)
    }

    pub fn wallets(&self) -> &[Wallet] {
        &self.wallets
    }

    pub fn alice(&self) -> &Wallet {
        &self.wallets[0]
    }

    pub fn bob(&self) -> &Wallet {
        &self.wallets[1]
    }

    /// Mining wallet; funds every registration and transfer.
    pub fn mike(&self) -> &Wallet {
        &self.wallets[2]
    }

    pub fn extra_wallets(&self) -> &[Wallet] {
        &self.wallets[NAMED_WALLETS.len()..]
    }

    pub fn wallet_node(&self, wallet: &Wallet) -> &Node {
        &self.nodes[wallet.node()]
    }

    pub fn runtime_config(&self) -> Result<RuntimeConfig, DevnetError> {
        let first = self
            .service_nodes()
            .first()
            .ok_or_else(|| DevnetError::Config("network has no service nodes".to_string()))?;
        Ok(RuntimeConfig {
            listen_ip: first.endpoint().ip.to_string(),
            listen_port: first.endpoint().rpc_port,
            wallet_listen_ip: self.mike().endpoint().ip.to_string(),
            wallet_listen_port: self.mike().endpoint().rpc_port,
            wallet_address: self.mike().address()?,
            external_address: self.bob().address()?,
        })
    }

    /// Mines `blocks` to `wallet` on the wallet's node and returns the height
    /// read once the daemon reports mining has stopped. A daemon that stops
    /// short of the requested blocks is not an error here; callers check the
    /// heights they depend on.
    pub fn mine(&self, wallet: &Wallet, blocks: u64) -> Result<u64, DevnetError> {
        let node = self.wallet_node(wallet);
        let address = wallet.address()?;
        let start = node.query_height()?;
        let end = start + blocks;
        log_info!("Mining {blocks} blocks to wallet {}", wallet.name());
        node.api().start_mining(&address, blocks)?;

        let timeout = MINE_TIMEOUT_PER_BLOCK * u32::try_from(blocks.max(2)).unwrap_or(u32::MAX);
        let mut last = start;
        self.supervisor.poller(timeout).require(
            &format!("mining on {}", node.name()),
            || -> Result<Readiness, RpcError> {
                if !node.api().mining_active()? {
                    return Ok(Readiness::Ready);
                }
                let height = node.query_height()?;
                if height != last {
                    log_debug!("Mined {height}/{end}");
                    last = height;
                }
                Ok(Readiness::Pending)
            },
        )?;
        let height = node.query_height()?;
        if height < end {
            log_warn!("Mining on {} stopped at {height}, short of {end}", node.name());
        } else {
            log_info!("Mined {height}/{end}");
        }
        Ok(height)
    }

    /// Mines to the funding wallet, then waits for every node to catch up.
    pub fn mine_and_sync(&self, blocks: u64) -> Result<u64, DevnetError> {
        let height = self.mine(self.mike(), blocks)?;
        self.sync_nodes(Some(height), SYNC_TIMEOUT)
    }

    pub fn sync_nodes(&self, target: Option<u64>, timeout: Duration) -> Result<u64, DevnetError> {
        let nodes = self.node_refs();
        if let Some(target) = target {
            if nodes.iter().all(|node| node.cached_height() >= target) {
                log_debug!("All nodes already synced to height >= {target}");
                return Ok(target);
            }
            log_info!("Waiting for all nodes to sync to height {target}");
        }
        let reached = barrier::sync_nodes(&nodes, target, self.supervisor.poller(timeout))?;
        log_info!("All nodes synced to height {reached}");
        Ok(reached)
    }

    /// Syncs every node to the best observed height, then refreshes wallets.
    pub fn sync(&self) -> Result<u64, DevnetError> {
        let height = self.sync_nodes(None, SYNC_TIMEOUT)?;
        self.refresh_wallets()?;
        Ok(height)
    }

    pub fn refresh_wallets(&self) -> Result<(), DevnetError> {
        log_debug!("Refreshing wallets");
        for wallet in &self.wallets {
            wallet.refresh()?;
        }
        Ok(())
    }

    pub fn print_wallet_balances(&self) -> Result<(), DevnetError> {
        if !sndevnet_log::enabled(sndevnet_log::Level::Info) {
            return Ok(());
        }
        log_info!("Balances:");
        for wallet in &self.wallets {
            let balance = wallet.balances()?;
            log_info!("    {}", wallet.describe_balance(&balance));
        }
        Ok(())
    }

    pub fn transfer(&self, from: &Wallet, to: &Wallet, amount: Amount) -> Result<String, DevnetError> {
        let destination = to.address()?;
        let tx_hash = from.api().transfer(&destination, amount)?;
        log_debug!(
            "{} sent {} to {} in {tx_hash}",
            from.name(),
            format_coins(amount),
            to.name()
        );
        Ok(tx_hash)
    }
}

fn create_dir(dir: &Path) -> Result<(), DevnetError> {
    fs::create_dir_all(dir)
        .map_err(|err| DevnetError::Io(format!("failed to create {}: {err}", dir.display())))
}

/// Empties `dir` (keeping the lock file) or creates it.
pub fn reset_data_dir(dir: &Path) -> Result<(), DevnetError> {
    let io_err =
        |err: std::io::Error| DevnetError::Io(format!("failed to reset {}: {err}", dir.display()));
    if !dir.exists() {
        return create_dir(dir);
    }
    for entry in fs::read_dir(dir).map_err(io_err)? {
        let entry = entry.map_err(io_err)?;
        if entry.file_name() == LOCK_FILE {
            continue;
        }
        let path = entry.path();
        if entry.file_type().map_err(io_err)?.is_dir() {
            fs::remove_dir_all(&path).map_err(io_err)?;
        } else {
            fs::remove_file(&path).map_err(io_err)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reset_keeps_only_the_lock_file() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join(LOCK_FILE), "pid=1\n").unwrap();
        fs::create_dir_all(dir.path().join("sn-00/lmdb")).unwrap();
        fs::write(dir.path().join("config.py"), "x").unwrap();
        reset_data_dir(dir.path()).unwrap();
        let left: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .map(|entry| entry.unwrap().file_name())
            .collect();
        assert_eq!(left, vec![std::ffi::OsString::from(LOCK_FILE)]);

        let fresh = dir.path().join("fresh");
        reset_data_dir(&fresh).unwrap();
        assert!(fresh.is_dir());
    }

    #[test]
    fn config_requires_hosts_for_wallets() {
        let mut config = NetworkConfig::default();
        assert!(config.validate().is_ok());
        config.nodes = 0;
        assert!(matches!(config.validate(), Err(DevnetError::Config(_))));
    }
}
