//! Cross-chain half of the bring-up: seed the rewards contract with the
//! natively registered nodes, add the bridge node through the contract, and
//! claim the rewards the network attests to.

use std::time::Duration;

use sndevnet_consensus::constants::{CLAIM_FUNDING_MARGIN, SECONDARY_CHAIN_ADVANCE_BLOCKS};
use sndevnet_primitives::{Address, BlsPublicKey, U256};
use sndevnet_servicenode::{
    BridgeStage, ContractSeedEntry, Contributor, RecipientBalance, RewardsClaim,
};

use crate::barrier;
use crate::contract::{ContractServiceNode, RewardsContract};
use crate::daemon::Node;
use crate::error::DevnetError;
use crate::network::Network;

/// Native blocks to wait for after the key registration so a pulse quorum
/// has signed over the new state.
pub const PULSE_BLOCKS: u64 = 2;
pub const PULSE_TIMEOUT: Duration = Duration::from_secs(300);

/// Seed entry for one natively registered node: its BLS key and contributor
/// stakes converted into contract units, all owned by `account`.
pub fn seed_entry_for(
    node: &Node,
    native_requirement: u64,
    contract_requirement: U256,
    account: Address,
) -> Result<ContractSeedEntry, DevnetError> {
    let keys = node.api().service_keys()?;
    let bls_pubkey = BlsPublicKey::from_hex(&keys.bls_pubkey).map_err(|err| {
        DevnetError::mismatch(format!("{} BLS key", node.name()), "64 bytes of hex", err)
    })?;
    let state = node.api().service_node_status()?.ok_or_else(|| {
        DevnetError::mismatch(format!("{} status", node.name()), "registered", "unregistered")
    })?;
    let contributors: Vec<Contributor> = state
        .contributors
        .iter()
        .map(|entry| Contributor {
            address: entry.address.clone(),
            amount: entry.amount,
        })
        .collect();
    ContractSeedEntry::build(
        bls_pubkey,
        &contributors,
        state.operator_address.as_deref(),
        native_requirement,
        contract_requirement,
        account,
    )
    .map_err(|err| {
        DevnetError::mismatch(
            format!("{} stake conversion", node.name()),
            "convertible stakes",
            err,
        )
    })
}

pub struct CrossChainBridge<'a> {
    network: &'a Network,
    contract: &'a dyn RewardsContract,
    bridge: &'a Node,
    beneficiary: Address,
    stage: BridgeStage,
    seeded: u64,
    claim: Option<RewardsClaim>,
}

impl<'a> CrossChainBridge<'a> {
    pub fn new(network: &'a Network, contract: &'a dyn RewardsContract) -> Result<Self, DevnetError> {
        let bridge = network
            .bridge()
            .ok_or_else(|| DevnetError::Config("network has no bridge node".to_string()))?;
        Ok(Self {
            network,
            contract,
            bridge,
            beneficiary: contract.funding_account(),
            stage: BridgeStage::Unseeded,
            seeded: 0,
            claim: None,
        })
    }

    pub fn stage(&self) -> BridgeStage {
        self.stage
    }

    pub fn seeded(&self) -> u64 {
        self.seeded
    }

    pub fn claim(&self) -> Option<&RewardsClaim> {
        self.claim.as_ref()
    }

    fn require(&self, stage: BridgeStage) -> Result<(), DevnetError> {
        self.stage
            .expect(stage)
            .map_err(|err| DevnetError::mismatch("bridge stage", stage, err))
    }

    fn advance(&mut self, to: BridgeStage) -> Result<(), DevnetError> {
        self.stage
            .advance(to)
            .map_err(|err| DevnetError::mismatch("bridge stage", to, err))
    }

    pub fn run(&mut self) -> Result<(), DevnetError> {
        self.seed()?;
        self.register_key()?;
        self.wait_pulse()?;
        self.request_rewards()?;
        self.claim_rewards().map(|_| ())
    }

    /// Seeds every natively registered service node, then starts the
    /// contract.
    pub fn seed(&mut self) -> Result<(), DevnetError> {
        self.require(BridgeStage::Unseeded)?;
        let nodes = self.network.service_nodes();
        let native_requirement = nodes
            .first()
            .ok_or_else(|| DevnetError::Config("no service nodes to seed".to_string()))?
            .api()
            .staking_requirement()?;
        let contract_requirement = self.contract.staking_requirement()?;
        let account = self.contract.funding_account();
        let entries = nodes
            .iter()
            .map(|node| seed_entry_for(node, native_requirement, contract_requirement, account))
            .collect::<Result<Vec<_>, _>>()?;

        self.contract.seed_public_key_list(&entries)?;
        let submitted = entries.len() as u64;
        let reported = self.contract.total_nodes()?;
        if reported != submitted {
            return Err(DevnetError::SeedMismatch {
                submitted,
                reported,
            });
        }
        log_info!("Seeded BLS public keys into contract. Contract has {reported} SNs");
        self.contract.start()?;
        self.seeded = reported;
        self.advance(BridgeStage::Seeded)
    }

    /// Registers the bridge node through the contract with arguments the
    /// node signs for the beneficiary.
    pub fn register_key(&mut self) -> Result<(), DevnetError> {
        self.require(BridgeStage::Seeded)?;
        let address = hex::encode(self.beneficiary);
        let args = self.bridge.api().bls_registration_args(&address)?;
        let keys = self.bridge.api().service_keys()?;
        log_info!(
            "Submitting contract registration for {} ({}) with address {}",
            self.bridge.name(),
            keys.pubkey,
            self.beneficiary
        );
        let receipt = self.contract.add_bls_public_key(&args)?;
        log_debug!("addBLSPublicKey confirmed in block {}", receipt.block_number);
        // The native chain only observes the event once it is buried.
        self.contract.advance_blocks(SECONDARY_CHAIN_ADVANCE_BLOCKS)?;

        let count = self.contract.total_nodes()?;
        log_info!(
            "Added node via contract. Contract has {count} SNs\n{}",
            self.dump_node_list(count)?
        );
        let expected = self.seeded + 1;
        if count != expected {
            return Err(DevnetError::mismatch("contract service node count", expected, count));
        }
        self.advance(BridgeStage::KeyRegistered)
    }

    /// Renders the contract's linked node list, starting at the sentinel.
    pub fn dump_node_list(&self, count: u64) -> Result<String, DevnetError> {
        let mut out = String::new();
        let mut id = 0;
        // The sentinel plus every node; a corrupt list cannot loop forever.
        for _ in 0..=count {
            let node: ContractServiceNode = self.contract.service_node(id)?;
            out.push_str(&format!(
                "  SN ID {} next={} prev={} operator={} pubkey=({:#x}, {:#x})\n",
                node.id, node.next, node.prev, node.operator, node.pubkey.x, node.pubkey.y
            ));
            id = node.next;
            if id == 0 {
                break;
            }
        }
        Ok(out)
    }

    /// Waits for the native chain to grow by [`PULSE_BLOCKS`].
    pub fn wait_pulse(&mut self) -> Result<(), DevnetError> {
        self.require(BridgeStage::KeyRegistered)?;
        let height = self.bridge.query_height()?;
        let target = height + PULSE_BLOCKS;
        log_info!("Awaiting pulse quorum to produce blocks, height is {height}");
        barrier::sync_nodes(
            &[self.bridge],
            Some(target),
            self.network.supervisor().poller(PULSE_TIMEOUT),
        )?;
        log_info!("Chain reached height {}", self.bridge.cached_height());
        self.advance(BridgeStage::PulseObserved)
    }

    /// Asks the bridge node for the aggregated rewards attestation.
    pub fn request_rewards(&mut self) -> Result<&RewardsClaim, DevnetError> {
        self.require(BridgeStage::PulseObserved)?;
        let address = hex::encode(self.beneficiary);
        let response = self.bridge.api().bls_rewards(&address)?;
        log_info!("Rewards attestation: {response:?}");
        let reported = response.address.clone();
        let claim = response.into_claim().map_err(|err| {
            DevnetError::mismatch("rewards attestation", "decodable response", err)
        })?;
        if !claim.is_for(&self.beneficiary) {
            return Err(DevnetError::mismatch(
                "rewards address",
                address.to_ascii_lowercase(),
                reported.to_ascii_lowercase(),
            ));
        }
        self.log_recipient("before update")?;
        self.advance(BridgeStage::RewardsAvailable)?;
        Ok(&*self.claim.insert(claim))
    }

    fn log_recipient(&self, when: &str) -> Result<RecipientBalance, DevnetError> {
        let balance = self.contract.recipient(&self.beneficiary)?;
        log_info!(
            "Contract rewards {when}: available {} claimed {} for {}",
            balance.available(),
            balance.claimed,
            self.beneficiary
        );
        Ok(balance)
    }

    /// Funds the contract, submits the attestation and claims. The claimed
    /// total must grow by exactly what the update made available.
    pub fn claim_rewards(&mut self) -> Result<RecipientBalance, DevnetError> {
        self.require(BridgeStage::RewardsAvailable)?;
        let claim = self
            .claim
            .clone()
            .ok_or_else(|| DevnetError::mismatch("rewards claim", "attestation", "none"))?;
        let addresses = self.contract.addresses().clone();

        // The pool is not wired to the contract on a devnet, so the funding
        // account tops the contract up directly.
        self.contract
            .fund_rewards(claim.amount + U256::from(CLAIM_FUNDING_MARGIN))?;
        let released = self.contract.payout_released()?;
        log_info!("Foundation pool released payout {released}");
        log_info!(
            "Foundation pool balance: {}",
            self.contract.erc20_balance(&addresses.foundation_pool)?
        );
        log_info!(
            "Rewards contract balance: {}",
            self.contract.erc20_balance(&addresses.rewards)?
        );

        self.contract.update_rewards_balance(&claim)?;
        let updated = self.log_recipient("after update")?;
        log_info!(
            "Balance for {} before claim {}",
            self.beneficiary,
            self.contract.erc20_balance(&self.beneficiary)?
        );

        self.contract.claim_rewards()?;
        let claimed = self.log_recipient("after claim")?;
        log_info!(
            "Balance for {} after claim {}",
            self.beneficiary,
            self.contract.erc20_balance(&self.beneficiary)?
        );
        let expected = updated.claimed + updated.available();
        if claimed.claimed != expected {
            return Err(DevnetError::mismatch("claimed rewards", expected, claimed.claimed));
        }
        if !claimed.available().is_zero() {
            return Err(DevnetError::mismatch(
                "available rewards after claim",
                0,
                claimed.available(),
            ));
        }
        self.advance(BridgeStage::RewardsClaimed)?;
        Ok(claimed)
    }
}
