//! Native-chain service-node registration.
//!
//! Mining funds the operator wallet, registrations are submitted once its
//! coinbase outputs can be spent, and the nodes are then pinged and made to
//! send uptime proofs so every daemon learns every BLS key.

use std::collections::{BTreeSet, HashMap};
use std::time::Duration;

use sndevnet_consensus::{format_coins, min_registration_height, Amount, COIN};
use sndevnet_servicenode::{NodeStage, ServiceNodeRegistration};

use crate::daemon::Node;
use crate::error::DevnetError;
use crate::network::Network;
use crate::poller::Readiness;
use crate::rpc::RpcError;
use crate::wallet::Wallet;

pub const PROOF_TIMEOUT: Duration = Duration::from_secs(120);
pub const REGISTRATION_TIMEOUT: Duration = Duration::from_secs(120);
/// Blocks mined past the minimum registration height before the first round.
pub const MATURITY_MARGIN: u64 = 6;
/// Blocks mined per service node before the second registration round.
pub const BLOCKS_PER_LATE_REGISTRATION: u64 = 6;
pub const NAMED_WALLET_FUNDING: Amount = 150 * COIN;
/// Fee headroom sent to each contributor on top of its contribution.
pub const CONTRIBUTOR_FEE_MARGIN: Amount = 3 * COIN;
/// Blocks mined after the second round so the registrations clear the
/// quorum lag before funds move again.
pub const SETTLE_BLOCKS: u64 = 29;
/// Blocks mined after the open registration so contributor funds unlock.
pub const CONTRIBUTION_UNLOCK_BLOCKS: u64 = 21;
pub const OPEN_OPERATOR_CUT: u8 = 10;
pub const OPEN_OPERATOR_SHARE_PERCENT: u64 = 28;

const OUTPUTS_ERROR: &str = "not enough outputs";

fn wallet_error(wallet: &Wallet, err: RpcError) -> DevnetError {
    if err.remote_message_contains(OUTPUTS_ERROR) {
        DevnetError::InsufficientOutputs {
            wallet: wallet.name().to_string(),
            detail: err.to_string(),
        }
    } else {
        DevnetError::Rpc(err)
    }
}

/// How the open registration's remaining stake is split between the
/// contributor wallets: equal shares, the last one absorbing the remainder.
pub fn contribution_plan(requirement: Amount, contributors: usize) -> (Amount, Vec<Amount>) {
    if contributors == 0 {
        return (requirement, Vec::new());
    }
    let operator = requirement / 100 * OPEN_OPERATOR_SHARE_PERCENT;
    let remaining = requirement - operator;
    let share = remaining / contributors as u64;
    let mut shares = vec![share; contributors];
    if let Some(last) = shares.last_mut() {
        *last += remaining - share * contributors as u64;
    }
    (operator, shares)
}

pub struct RegistrationWorkflow<'a> {
    network: &'a Network,
    stages: Vec<NodeStage>,
    registrations: Vec<Option<ServiceNodeRegistration>>,
    // Solo registrations submitted per wallet name; each one consumes
    // another batch of coinbase outputs.
    solo_counts: HashMap<String, u64>,
}

impl<'a> RegistrationWorkflow<'a> {
    pub fn new(network: &'a Network) -> Self {
        let count = network.service_nodes().len();
        Self {
            network,
            stages: vec![NodeStage::Unfunded; count],
            registrations: vec![None; count],
            solo_counts: HashMap::new(),
        }
    }

    pub fn stage(&self, index: usize) -> Option<NodeStage> {
        self.stages.get(index).copied()
    }

    pub fn stages(&self) -> &[NodeStage] {
        &self.stages
    }

    pub fn registration(&self, index: usize) -> Option<&ServiceNodeRegistration> {
        self.registrations.get(index).and_then(Option::as_ref)
    }

    fn service_node(&self, index: usize) -> Result<&'a Node, DevnetError> {
        self.network
            .service_nodes()
            .get(index)
            .ok_or_else(|| DevnetError::Config(format!("no service node #{index}")))
    }

    fn advance(&mut self, index: usize, to: NodeStage) -> Result<(), DevnetError> {
        let name = self.service_node(index)?.name().to_string();
        self.stages[index]
            .advance(to)
            .map_err(|err| DevnetError::mismatch(format!("{name} stage"), to, err))
    }

    fn staking_requirement(&self) -> Result<Amount, DevnetError> {
        let first = self.service_node(0)?;
        Ok(first.api().staking_requirement()?)
    }

    /// Full native-chain bring-up, leaving every service node registered and
    /// proofed.
    pub fn run(&mut self) -> Result<(), DevnetError> {
        let network = self.network;
        let params = network.params();
        let mike = network.mike();
        let total = network.service_nodes().len();
        let first_round = params.first_round_registrations.min(total);
        // With more nodes than the first round, the last one is staked by Bob
        // and the extra wallets together.
        let open_node = (total > first_round).then(|| total - 1);
        let solo_end = open_node.unwrap_or(total);

        let initial = min_registration_height(params, first_round as u64) + MATURITY_MARGIN;
        network.mine_and_sync(initial)?;
        log_info!("Submitting first round of service node registrations");
        mike.refresh()?;
        for index in 0..first_round {
            self.register_solo(mike, index)?;
            progress!(".");
        }
        sndevnet_log::progress_end();

        if let Some(open_node) = open_node {
            log_info!("Going back to mining");
            network.mine(mike, BLOCKS_PER_LATE_REGISTRATION * total as u64)?;
            network.print_wallet_balances()?;
            network.transfer(mike, network.alice(), NAMED_WALLET_FUNDING)?;
            network.transfer(mike, network.bob(), NAMED_WALLET_FUNDING)?;
            log_info!("Submitting more service node registrations");
            mike.refresh()?;
            for index in first_round..solo_end {
                self.register_solo(mike, index)?;
                progress!(".");
            }
            sndevnet_log::progress_end();
            network.print_wallet_balances()?;

            let requirement = self.staking_requirement()?;
            let (operator_amount, shares) =
                contribution_plan(requirement, network.extra_wallets().len());
            network.mine_and_sync(SETTLE_BLOCKS)?;
            for (wallet, share) in network.extra_wallets().iter().zip(&shares) {
                network.transfer(mike, wallet, share + CONTRIBUTOR_FEE_MARGIN)?;
            }
            network.mine_and_sync(1)?;
            network.print_wallet_balances()?;

            self.register_open(network.bob(), open_node, OPEN_OPERATOR_CUT, operator_amount)?;
            network.mine_and_sync(CONTRIBUTION_UNLOCK_BLOCKS)?;
            network.refresh_wallets()?;
            network.print_wallet_balances()?;
            for (wallet, share) in network.extra_wallets().iter().zip(&shares) {
                self.contribute(wallet, open_node, *share)?;
            }
        }

        network.mine_and_sync(1)?;
        for index in 0..total {
            self.wait_registered(index)?;
        }
        self.propagate_proofs()?;
        network.mine_and_sync(1)?;
        Ok(())
    }

    /// Registers `index` with `wallet` staking the whole requirement. Fails
    /// with `InsufficientOutputs` when the wallet's node is below the height
    /// at which this many registrations can be funded from mined outputs.
    pub fn register_solo(&mut self, wallet: &Wallet, index: usize) -> Result<(), DevnetError> {
        let node = self.service_node(index)?;
        let registrations = self.solo_counts.get(wallet.name()).copied().unwrap_or(0) + 1;
        let required = min_registration_height(self.network.params(), registrations);
        let height = self.network.wallet_node(wallet).query_height()?;
        if height < required {
            return Err(DevnetError::InsufficientOutputs {
                wallet: wallet.name().to_string(),
                detail: format!(
                    "registration #{registrations} needs height {required}, chain is at {height}"
                ),
            });
        }
        let requirement = self.staking_requirement()?;
        let registration =
            ServiceNodeRegistration::solo(wallet.name(), &wallet.address()?, requirement);
        self.submit(wallet, index, node, registration)?;
        self.solo_counts
            .insert(wallet.name().to_string(), registrations);
        Ok(())
    }

    /// Registers `index` with `wallet` reserving `operator_amount` and
    /// leaving the rest open to contributors.
    pub fn register_open(
        &mut self,
        wallet: &Wallet,
        index: usize,
        cut_percent: u8,
        operator_amount: Amount,
    ) -> Result<(), DevnetError> {
        let node = self.service_node(index)?;
        let requirement = self.staking_requirement()?;
        let registration = ServiceNodeRegistration::open(
            wallet.name(),
            &wallet.address()?,
            cut_percent,
            operator_amount,
            requirement,
        )
        .map_err(|err| DevnetError::Config(format!("{}: {err}", node.name())))?;
        log_info!(
            "{} opens {} for contributions with {} staked and a {cut_percent}% cut",
            wallet.name(),
            node.name(),
            format_coins(operator_amount)
        );
        self.submit(wallet, index, node, registration)
    }

    fn submit(
        &mut self,
        wallet: &Wallet,
        index: usize,
        node: &Node,
        registration: ServiceNodeRegistration,
    ) -> Result<(), DevnetError> {
        if self.stages[index] != NodeStage::Unfunded {
            return Err(DevnetError::mismatch(
                format!("{} registration", node.name()),
                NodeStage::Unfunded,
                self.stages[index],
            ));
        }
        let command = node
            .api()
            .registration_command(&registration.command_args(), registration.staking_requirement)?;
        wallet
            .api()
            .register_service_node(&command)
            .map_err(|err| wallet_error(wallet, err))?;
        log_debug!(
            "{} submitted registration for {} ({} staked)",
            wallet.name(),
            node.name(),
            format_coins(registration.total())
        );
        self.registrations[index] = Some(registration);
        self.advance(index, NodeStage::AwaitingMaturity)
    }

    /// Stakes `amount` from `wallet` into the open registration of `index`.
    pub fn contribute(
        &mut self,
        wallet: &Wallet,
        index: usize,
        amount: Amount,
    ) -> Result<(), DevnetError> {
        let node = self.service_node(index)?;
        let max_contributors = self.network.params().max_contributors;
        let address = wallet.address()?;
        let Some(registration) = self.registrations[index].as_mut() else {
            return Err(DevnetError::mismatch(
                format!("contribution to {}", node.name()),
                "an open registration",
                "none",
            ));
        };
        let balance = wallet.balances()?;
        if balance.unlocked < amount {
            return Err(DevnetError::InsufficientOutputs {
                wallet: wallet.name().to_string(),
                detail: format!(
                    "contribution of {} exceeds unlocked balance {}",
                    format_coins(amount),
                    format_coins(balance.unlocked)
                ),
            });
        }
        let mut staged = registration.clone();
        staged
            .add_contribution(&address, amount, max_contributors)
            .map_err(|err| DevnetError::Config(format!("{}: {err}", node.name())))?;
        let keys = node.api().service_keys()?;
        wallet
            .api()
            .stake(&keys.pubkey, &address, amount)
            .map_err(|err| wallet_error(wallet, err))?;
        log_debug!(
            "{} contributed {} to {}",
            wallet.name(),
            format_coins(amount),
            node.name()
        );
        *registration = staged;
        Ok(())
    }

    /// Waits until the daemon of `index` reports itself fully staked.
    pub fn wait_registered(&mut self, index: usize) -> Result<(), DevnetError> {
        let node = self.service_node(index)?;
        match self.stages[index] {
            NodeStage::AwaitingMaturity => {}
            NodeStage::Registered => return Ok(()),
            other => {
                return Err(DevnetError::mismatch(
                    format!("{} registration", node.name()),
                    NodeStage::AwaitingMaturity,
                    other,
                ))
            }
        }
        self.network.supervisor().poller(REGISTRATION_TIMEOUT).require(
            &format!("{} registration", node.name()),
            || -> Result<Readiness, RpcError> {
                let status = node.api().service_node_status()?;
                Ok(status.is_some_and(|state| state.is_fully_staked()).into())
            },
        )?;
        self.advance(index, NodeStage::Registered)
    }

    /// Fake storage-server and lokinet pings, uptime proofs, then waits until
    /// every service node's view lists every registered node as proofed.
    pub fn propagate_proofs(&mut self) -> Result<(), DevnetError> {
        let nodes = self.network.service_nodes();
        log_info!("Sending fake lokinet/ss pings");
        let mut keys = BTreeSet::new();
        for node in nodes {
            let service_keys = node.api().service_keys()?;
            node.api().storage_server_ping(&service_keys.ed25519)?;
            node.api().lokinet_ping(&service_keys.ed25519)?;
            keys.insert(service_keys.pubkey);
        }
        log_info!("Sending uptime proofs to propagate BLS public keys");
        for node in nodes {
            node.api().trigger_uptime_proof()?;
        }

        log_info!("Waiting for proofs to propagate");
        for node in nodes {
            self.network.supervisor().poller(PROOF_TIMEOUT).require(
                &format!("uptime proofs on {}", node.name()),
                || -> Result<Readiness, RpcError> {
                    let states = node.api().service_node_states()?;
                    let proofed: BTreeSet<&str> = states
                        .iter()
                        .filter(|entry| entry.is_proofed())
                        .map(|entry| entry.service_node_pubkey.as_str())
                        .collect();
                    log_trace!("{}: {}/{} proofed", node.name(), proofed.len(), keys.len());
                    Ok(keys.iter().all(|key| proofed.contains(key.as_str())).into())
                },
            )?;
            progress!(".");
        }
        sndevnet_log::progress_end();
        for index in 0..nodes.len() {
            self.advance(index, NodeStage::ProofPropagated)?;
        }
        Ok(())
    }
}
