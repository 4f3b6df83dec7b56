//! Devnet parameter definitions.

use crate::constants::{
    COINBASE_UNLOCK_WINDOW, LOCAL_EVM_CHAIN_ID, MAX_CONTRIBUTORS, MIN_RING_OUTPUTS,
    TRANSFER_UNLOCK_BLOCKS,
};
use crate::money::{Amount, COIN};

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DevnetParams {
    /// Stake required to fully register one service node.
    pub staking_requirement: Amount,
    /// Value of the single coinbase output produced by each mined block.
    pub block_reward: Amount,
    pub coinbase_unlock_window: u64,
    pub transfer_unlock_blocks: u64,
    pub min_ring_outputs: u64,
    pub max_contributors: usize,
    /// Service nodes registered in the first round, before mining resumes.
    pub first_round_registrations: usize,
    pub contract: ContractParams,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ContractParams {
    pub chain_id: u64,
    pub rpc_url: String,
    pub rewards_contract: String,
    pub erc20_contract: String,
    pub foundation_pool_contract: String,
}

impl Default for ContractParams {
    fn default() -> Self {
        // Deterministic addresses of a `deploy-local` run against a fresh
        // node using the first dev account.
        Self {
            chain_id: LOCAL_EVM_CHAIN_ID,
            rpc_url: "http://127.0.0.1:8545".to_string(),
            rewards_contract: "0x5FC8d32690cc91D4c39d9d3abcBD16989F875707".to_string(),
            erc20_contract: "0x5FbDB2315678afecb367f032d93F642f64180aa3".to_string(),
            foundation_pool_contract: "0x9fE46736679d2D9a65F0992F2272dE9f3c7fa6e0".to_string(),
        }
    }
}

pub fn devnet_params() -> DevnetParams {
    DevnetParams {
        staking_requirement: 100 * COIN,
        block_reward: 50 * COIN,
        coinbase_unlock_window: COINBASE_UNLOCK_WINDOW,
        transfer_unlock_blocks: TRANSFER_UNLOCK_BLOCKS,
        min_ring_outputs: MIN_RING_OUTPUTS,
        max_contributors: MAX_CONTRIBUTORS,
        first_round_registrations: 5,
        contract: ContractParams::default(),
    }
}
