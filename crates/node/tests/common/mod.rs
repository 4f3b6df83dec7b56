//! In-memory stand-ins for daemons, wallets and the rewards contract. All
//! nodes share one chain, so every node is always synced to the tip.

#![allow(dead_code)]

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use sndevnet::contract::{ContractAddresses, ContractServiceNode, RewardsContract, TxReceipt};
use sndevnet::daemon::{
    BlsRegistrationArgs, ContributorState, DaemonApi, Node, NodeEndpoint, NodeRole,
    RewardsResponse, ServiceKeys, ServiceNodeEntry, ServiceNodeState,
};
use sndevnet::error::DevnetError;
use sndevnet::network::Network;
use sndevnet::rpc::RpcError;
use sndevnet::supervisor::ProcessSupervisor;
use sndevnet::wallet::{Balance, Wallet, WalletApi, WalletEndpoint};
use sndevnet_consensus::{devnet_params, Amount, ContractParams, DevnetParams};
use sndevnet_primitives::{Address, BlsPublicKey, U256};
use sndevnet_servicenode::{ContractSeedEntry, RecipientBalance, RewardsClaim};

pub const REWARD_AMOUNT: u64 = 7_500;

struct Registered {
    requirement: Amount,
    contributors: Vec<(String, Amount)>,
}

struct Mining {
    address: String,
    remaining: u64,
}

#[derive(Default)]
struct ChainState {
    height: u64,
    balances: HashMap<String, Amount>,
    registrations: BTreeMap<usize, Registered>,
    proofed: BTreeSet<usize>,
    flushes: usize,
    // Gradual mining produces one block per status poll; `stop_after` caps
    // how many blocks a round produces.
    gradual: bool,
    stop_after: Option<u64>,
    mining: Option<Mining>,
    mining_polls: usize,
    rewards_address: Option<String>,
}

pub struct FakeChain {
    params: DevnetParams,
    state: Mutex<ChainState>,
    // Set once the bridge asks for registration arguments; from then on the
    // chain grows by one block per height query, standing in for pulse.
    pulsing: AtomicBool,
}

impl FakeChain {
    pub fn new(params: DevnetParams) -> Arc<Self> {
        Arc::new(Self {
            params,
            state: Mutex::new(ChainState::default()),
            pulsing: AtomicBool::new(false),
        })
    }

    fn state(&self) -> std::sync::MutexGuard<'_, ChainState> {
        self.state.lock().unwrap()
    }

    pub fn height(&self) -> u64 {
        self.state().height
    }

    pub fn set_height(&self, height: u64) {
        self.state().height = height;
    }

    pub fn balance(&self, address: &str) -> Amount {
        self.state().balances.get(address).copied().unwrap_or(0)
    }

    pub fn credit(&self, address: &str, amount: Amount) {
        *self.state().balances.entry(address.to_string()).or_default() += amount;
    }

    pub fn flushes(&self) -> usize {
        self.state().flushes
    }

    pub fn registered(&self) -> usize {
        self.state().registrations.len()
    }

    /// Mining proceeds one block per status poll instead of at once.
    pub fn mine_gradually(&self, stop_after: Option<u64>) {
        let mut state = self.state();
        state.gradual = true;
        state.stop_after = stop_after;
    }

    pub fn mining_polls(&self) -> usize {
        self.state().mining_polls
    }

    /// Rewards attestations name `address` instead of the requested one.
    pub fn report_rewards_to(&self, address: &str) {
        self.state().rewards_address = Some(address.to_string());
    }

    fn debit(&self, address: &str, amount: Amount) -> Result<(), RpcError> {
        let mut state = self.state();
        let balance = state.balances.entry(address.to_string()).or_default();
        if *balance < amount {
            return Err(RpcError::Remote {
                code: -1,
                message: "not enough outputs to use".to_string(),
            });
        }
        *balance -= amount;
        Ok(())
    }
}

pub fn pubkey_of(index: usize) -> String {
    format!("{:064x}", index + 1)
}

pub fn bls_pubkey_of(index: usize) -> String {
    format!("{:064x}{:064x}", index + 11, index + 97)
}

pub struct FakeDaemon {
    chain: Arc<FakeChain>,
    index: usize,
}

impl DaemonApi for FakeDaemon {
    fn height(&self) -> Result<u64, RpcError> {
        let mut state = self.chain.state();
        if self.chain.pulsing.load(Ordering::SeqCst) {
            state.height += 1;
        }
        Ok(state.height)
    }

    fn start_mining(&self, miner_address: &str, blocks: u64) -> Result<(), RpcError> {
        let reward = self.chain.params.block_reward;
        let mut state = self.chain.state();
        if state.gradual {
            let remaining = state.stop_after.map_or(blocks, |cap| cap.min(blocks));
            state.mining = Some(Mining {
                address: miner_address.to_string(),
                remaining,
            });
            return Ok(());
        }
        state.height += blocks;
        *state.balances.entry(miner_address.to_string()).or_default() += reward * blocks;
        Ok(())
    }

    fn mining_active(&self) -> Result<bool, RpcError> {
        let reward = self.chain.params.block_reward;
        let mut state = self.chain.state();
        state.mining_polls += 1;
        let Some(mining) = state.mining.as_mut() else {
            return Ok(false);
        };
        if mining.remaining == 0 {
            state.mining = None;
            return Ok(false);
        }
        mining.remaining -= 1;
        let address = mining.address.clone();
        state.height += 1;
        *state.balances.entry(address).or_default() += reward;
        Ok(true)
    }

    fn staking_requirement(&self) -> Result<Amount, RpcError> {
        Ok(self.chain.params.staking_requirement)
    }

    fn service_keys(&self) -> Result<ServiceKeys, RpcError> {
        Ok(ServiceKeys {
            pubkey: pubkey_of(self.index),
            ed25519: format!("ed-{}", self.index),
            bls_pubkey: bls_pubkey_of(self.index),
        })
    }

    fn service_node_states(&self) -> Result<Vec<ServiceNodeEntry>, RpcError> {
        let state = self.chain.state();
        Ok(state
            .registrations
            .keys()
            .map(|&index| {
                let proofed = state.proofed.contains(&index);
                ServiceNodeEntry {
                    service_node_pubkey: pubkey_of(index),
                    quorumnet_port: if proofed { 2000 + index as i64 } else { 0 },
                    pubkey_bls: proofed.then(|| bls_pubkey_of(index)),
                }
            })
            .collect())
    }

    fn service_node_status(&self) -> Result<Option<ServiceNodeState>, RpcError> {
        let state = self.chain.state();
        Ok(state.registrations.get(&self.index).map(|registered| {
            ServiceNodeState {
                service_node_pubkey: pubkey_of(self.index),
                operator_address: registered
                    .contributors
                    .first()
                    .map(|(address, _)| address.clone()),
                staking_requirement: registered.requirement,
                total_contributed: registered.contributors.iter().map(|(_, amount)| amount).sum(),
                contributors: registered
                    .contributors
                    .iter()
                    .map(|(address, amount)| ContributorState {
                        address: address.clone(),
                        amount: *amount,
                    })
                    .collect(),
            }
        }))
    }

    fn registration_command(
        &self,
        args: &[String],
        staking_requirement: Amount,
    ) -> Result<String, RpcError> {
        Ok(format!(
            "register_service_node {} {staking_requirement} {}",
            self.index,
            args.join(" ")
        ))
    }

    fn storage_server_ping(&self, _ed25519_pubkey: &str) -> Result<(), RpcError> {
        Ok(())
    }

    fn lokinet_ping(&self, _ed25519_pubkey: &str) -> Result<(), RpcError> {
        Ok(())
    }

    fn trigger_uptime_proof(&self) -> Result<(), RpcError> {
        let mut state = self.chain.state();
        if state.registrations.contains_key(&self.index) {
            state.proofed.insert(self.index);
        }
        Ok(())
    }

    fn flush_txpool(&self) -> Result<String, RpcError> {
        self.chain.state().flushes += 1;
        Ok("OK".to_string())
    }

    fn bls_registration_args(&self, address: &str) -> Result<BlsRegistrationArgs, RpcError> {
        self.chain.pulsing.store(true, Ordering::SeqCst);
        Ok(BlsRegistrationArgs {
            address: address.to_string(),
            bls_pubkey: bls_pubkey_of(self.index),
            proof_of_possession: "ab".repeat(128),
            service_node_pubkey: pubkey_of(self.index),
            service_node_signature: "cd".repeat(64),
        })
    }

    fn bls_rewards(&self, address: &str) -> Result<RewardsResponse, RpcError> {
        let reported = self.chain.state().rewards_address.clone();
        Ok(RewardsResponse {
            address: reported.unwrap_or_else(|| address.to_string()),
            amount: REWARD_AMOUNT,
            height: self.chain.height(),
            signature: "ef".repeat(128),
            non_signer_indices: Vec::new(),
        })
    }
}

pub struct FakeWallet {
    chain: Arc<FakeChain>,
    address: Mutex<String>,
}

impl FakeWallet {
    fn current(&self) -> String {
        self.address.lock().unwrap().clone()
    }
}

impl WalletApi for FakeWallet {
    fn version(&self) -> Result<u64, RpcError> {
        Ok(1)
    }

    fn create_wallet(&self, filename: &str) -> Result<(), RpcError> {
        *self.address.lock().unwrap() = format!("addr-{filename}");
        Ok(())
    }

    fn address(&self) -> Result<String, RpcError> {
        Ok(self.current())
    }

    fn refresh(&self) -> Result<(), RpcError> {
        Ok(())
    }

    fn balance(&self) -> Result<Balance, RpcError> {
        let amount = self.chain.balance(&self.current());
        Ok(Balance {
            total: amount,
            unlocked: amount,
        })
    }

    fn transfer(&self, destination: &str, amount: Amount) -> Result<String, RpcError> {
        self.chain.debit(&self.current(), amount)?;
        self.chain.credit(destination, amount);
        Ok(format!("tx-{destination}-{amount}"))
    }

    fn register_service_node(&self, registration_cmd: &str) -> Result<(), RpcError> {
        let parts: Vec<&str> = registration_cmd.split_whitespace().collect();
        let bad = || RpcError::InvalidResponse(format!("bad command '{registration_cmd}'"));
        let index: usize = parts.get(1).and_then(|raw| raw.parse().ok()).ok_or_else(bad)?;
        let requirement: Amount = parts.get(2).and_then(|raw| raw.parse().ok()).ok_or_else(bad)?;
        // parts[3] is the operator cut; address/amount pairs follow.
        let contributors: Vec<(String, Amount)> = parts
            .get(4..)
            .ok_or_else(bad)?
            .chunks(2)
            .map(|pair| -> Result<(String, Amount), RpcError> {
                Ok((pair[0].to_string(), pair[1].parse().map_err(|_| bad())?))
            })
            .collect::<Result<_, _>>()?;
        let own = self.current();
        let stake: Amount = contributors
            .iter()
            .filter(|(address, _)| *address == own)
            .map(|(_, amount)| amount)
            .sum();
        self.chain.debit(&own, stake)?;
        self.chain.state().registrations.insert(
            index,
            Registered {
                requirement,
                // Only the operator's stake is locked at registration.
                contributors: contributors
                    .into_iter()
                    .filter(|(address, _)| *address == own)
                    .collect(),
            },
        );
        Ok(())
    }

    fn stake(
        &self,
        service_node_key: &str,
        destination: &str,
        amount: Amount,
    ) -> Result<(), RpcError> {
        let index = (0..64)
            .find(|&index| pubkey_of(index) == service_node_key)
            .ok_or_else(|| RpcError::Remote {
                code: -1,
                message: format!("unknown service node {service_node_key}"),
            })?;
        self.chain.debit(&self.current(), amount)?;
        let mut state = self.chain.state();
        let registered = state.registrations.get_mut(&index).ok_or_else(|| RpcError::Remote {
            code: -1,
            message: "service node is not registered".to_string(),
        })?;
        registered.contributors.push((destination.to_string(), amount));
        Ok(())
    }
}

#[derive(Default)]
struct ContractState {
    keys: Vec<BlsPublicKey>,
    seeded: Vec<ContractSeedEntry>,
    started: bool,
    advanced: usize,
    rewards_balance: U256,
    tokens: HashMap<Address, U256>,
    recipients: HashMap<Address, RecipientBalance>,
}

/// Ways the fake contract departs from a well-behaved deployment.
#[derive(Clone, Debug, Default)]
pub struct ContractFaults {
    /// Node count reported once seeding is done.
    pub seeded_count: Option<u64>,
    /// `addBLSPublicKey` succeeds without adding the node.
    pub drop_key_registration: bool,
    /// Amount a claim leaves behind as still available.
    pub claim_shortfall: U256,
    /// Rewards credited again right after a claim.
    pub claim_topup: U256,
}

pub struct FakeContract {
    addresses: ContractAddresses,
    account: Address,
    requirement: U256,
    faults: ContractFaults,
    state: Mutex<ContractState>,
    block: Mutex<u64>,
}

impl FakeContract {
    pub fn new() -> Self {
        Self::with_faults(ContractFaults::default())
    }

    pub fn with_faults(faults: ContractFaults) -> Self {
        Self {
            addresses: ContractAddresses::from_params(&ContractParams::default()).unwrap(),
            account: "0xf39Fd6e51aad88F6F4ce6aB8827279cffFb92266".parse().unwrap(),
            requirement: U256::from(120u64) * U256::from(10u64).pow(U256::from(18u64)),
            faults,
            state: Mutex::new(ContractState::default()),
            block: Mutex::new(0),
        }
    }

    pub fn contract_requirement(&self) -> U256 {
        self.requirement
    }

    pub fn seeded_entries(&self) -> Vec<ContractSeedEntry> {
        self.state.lock().unwrap().seeded.clone()
    }

    pub fn is_started(&self) -> bool {
        self.state.lock().unwrap().started
    }

    pub fn advanced(&self) -> usize {
        self.state.lock().unwrap().advanced
    }

    pub fn token_balance(&self, address: &Address) -> U256 {
        self.state
            .lock()
            .unwrap()
            .tokens
            .get(address)
            .copied()
            .unwrap_or_default()
    }

    fn receipt(&self) -> TxReceipt {
        let mut block = self.block.lock().unwrap();
        *block += 1;
        TxReceipt {
            hash: format!("0x{:064x}", *block),
            success: true,
            block_number: *block,
        }
    }
}

impl RewardsContract for FakeContract {
    fn addresses(&self) -> &ContractAddresses {
        &self.addresses
    }

    fn funding_account(&self) -> Address {
        self.account
    }

    fn staking_requirement(&self) -> Result<U256, DevnetError> {
        Ok(self.requirement)
    }

    fn total_nodes(&self) -> Result<u64, DevnetError> {
        let state = self.state.lock().unwrap();
        let count = state.keys.len() as u64;
        Ok(match self.faults.seeded_count {
            Some(reported) if !state.seeded.is_empty() && count == state.seeded.len() as u64 => {
                reported
            }
            _ => count,
        })
    }

    fn service_node(&self, id: u64) -> Result<ContractServiceNode, DevnetError> {
        let state = self.state.lock().unwrap();
        let count = state.keys.len() as u64;
        let next = if id < count { id + 1 } else { 0 };
        let prev = if id == 0 { count } else { id - 1 };
        let pubkey = match id {
            0 => BlsPublicKey {
                x: U256::ZERO,
                y: U256::ZERO,
            },
            id => *state
                .keys
                .get(id as usize - 1)
                .ok_or_else(|| DevnetError::mismatch("service node id", "listed", id))?,
        };
        Ok(ContractServiceNode {
            id,
            next,
            prev,
            operator: self.account,
            pubkey,
        })
    }

    fn seed_public_key_list(&self, entries: &[ContractSeedEntry]) -> Result<TxReceipt, DevnetError> {
        {
            let mut state = self.state.lock().unwrap();
            state.keys.extend(entries.iter().map(|entry| entry.bls_pubkey));
            state.seeded.extend_from_slice(entries);
        }
        Ok(self.receipt())
    }

    fn start(&self) -> Result<TxReceipt, DevnetError> {
        self.state.lock().unwrap().started = true;
        Ok(self.receipt())
    }

    fn add_bls_public_key(&self, args: &BlsRegistrationArgs) -> Result<TxReceipt, DevnetError> {
        let key = args
            .bls_public_key()
            .map_err(|err| DevnetError::mismatch("bls key", "hex", err))?;
        if !self.faults.drop_key_registration {
            self.state.lock().unwrap().keys.push(key);
        }
        Ok(self.receipt())
    }

    fn advance_blocks(&self, count: usize) -> Result<(), DevnetError> {
        self.state.lock().unwrap().advanced += count;
        *self.block.lock().unwrap() += count as u64;
        Ok(())
    }

    fn recipient(&self, address: &Address) -> Result<RecipientBalance, DevnetError> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .recipients
            .get(address)
            .copied()
            .unwrap_or_default())
    }

    fn erc20_balance(&self, address: &Address) -> Result<U256, DevnetError> {
        if *address == self.addresses.rewards {
            return Ok(self.state.lock().unwrap().rewards_balance);
        }
        Ok(self.token_balance(address))
    }

    fn fund_rewards(&self, amount: U256) -> Result<TxReceipt, DevnetError> {
        self.state.lock().unwrap().rewards_balance += amount;
        Ok(self.receipt())
    }

    fn payout_released(&self) -> Result<U256, DevnetError> {
        Ok(U256::ZERO)
    }

    fn update_rewards_balance(&self, claim: &RewardsClaim) -> Result<TxReceipt, DevnetError> {
        self.state
            .lock()
            .unwrap()
            .recipients
            .entry(claim.beneficiary)
            .or_default()
            .rewards = claim.amount;
        Ok(self.receipt())
    }

    fn claim_rewards(&self) -> Result<TxReceipt, DevnetError> {
        {
            let mut state = self.state.lock().unwrap();
            let available = state
                .recipients
                .get(&self.account)
                .map(RecipientBalance::available)
                .unwrap_or_default();
            if state.rewards_balance < available {
                return Err(DevnetError::mismatch("contract funds", available, state.rewards_balance));
            }
            let paid = available.saturating_sub(self.faults.claim_shortfall);
            state.rewards_balance -= paid;
            *state.tokens.entry(self.account).or_default() += paid;
            let recipient = state.recipients.entry(self.account).or_default();
            recipient.claimed += paid;
            recipient.rewards += self.faults.claim_topup;
        }
        Ok(self.receipt())
    }
}

/// A network of fake processes laid out like a real bring-up.
pub struct Harness {
    pub chain: Arc<FakeChain>,
    pub network: Network,
    pub data_dir: tempfile::TempDir,
}

pub fn harness(service_nodes: usize, plain_nodes: usize, extra_wallets: usize) -> Harness {
    harness_with(devnet_params(), service_nodes, plain_nodes, extra_wallets)
}

pub fn harness_with(
    params: DevnetParams,
    service_nodes: usize,
    plain_nodes: usize,
    extra_wallets: usize,
) -> Harness {
    let chain = FakeChain::new(params.clone());
    let mut nodes = Vec::new();
    let layout = std::iter::repeat(NodeRole::ServiceNode)
        .take(service_nodes)
        .chain(std::iter::repeat(NodeRole::Plain).take(plain_nodes))
        .chain(std::iter::once(NodeRole::Bridge));
    let mut per_role: HashMap<NodeRole, usize> = HashMap::new();
    for (index, role) in layout.enumerate() {
        let ordinal = per_role.entry(role).or_default();
        let name = format!("{}-{:02}", role.name_prefix(), *ordinal);
        *ordinal += 1;
        let endpoint = NodeEndpoint {
            ip: Ipv4Addr::new(127, 0, 0, 1),
            p2p_port: 3000 + index as u16 * 4,
            rpc_port: 3001 + index as u16 * 4,
            qnet_port: 3002 + index as u16 * 4,
            storage_port: 3003 + index as u16 * 4,
        };
        let api = Arc::new(FakeDaemon {
            chain: Arc::clone(&chain),
            index,
        });
        nodes.push(Node::new(name, role, endpoint, api));
    }

    let names = ["Alice", "Bob", "Mike"]
        .iter()
        .map(|name| name.to_string())
        .chain((0..extra_wallets).map(|index| format!("extrawallet-{index}")));
    let wallets = names
        .enumerate()
        .map(|(index, name)| {
            let api = Arc::new(FakeWallet {
                chain: Arc::clone(&chain),
                address: Mutex::new(format!("addr-{name}")),
            });
            let endpoint = WalletEndpoint {
                ip: Ipv4Addr::new(127, 0, 0, 1),
                rpc_port: 5000 + index as u16,
            };
            Wallet::new(name, service_nodes + index % plain_nodes, endpoint, api)
        })
        .collect();

    let data_dir = tempfile::tempdir().unwrap();
    let network = Network::from_parts(
        params,
        Arc::new(ProcessSupervisor::new()),
        data_dir.path(),
        nodes,
        wallets,
    )
    .unwrap();
    Harness {
        chain,
        network,
        data_dir,
    }
}
