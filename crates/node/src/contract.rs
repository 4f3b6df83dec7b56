//! Secondary-chain access: an alloy provider driven from the blocking
//! bring-up thread, and the rewards contract calls the bridge workflow makes.
//!
//! Transactions are sent from an account the EVM node holds unlocked
//! (`eth_sendTransaction`), so nothing here signs.

use std::future::IntoFuture;
use std::sync::Arc;
use std::time::Duration;

use alloy::network::ReceiptResponse;
use alloy::primitives::{address, Bytes, B256};
use alloy::providers::{DynProvider, Provider, ProviderBuilder};
use alloy::rpc::types::TransactionRequest;
use alloy::transports::TransportError;
use sndevnet_consensus::ContractParams;
use sndevnet_primitives::contracts::ServiceNode;
use sndevnet_primitives::{
    Address, BlsPublicKey, FoundationPool, ServiceNodeRewards, SolCall, ERC20, U256,
};
use sndevnet_servicenode::{ContractSeedEntry, RecipientBalance, RewardsClaim};
use tokio::runtime::Handle;

use crate::daemon::BlsRegistrationArgs;
use crate::error::DevnetError;
use crate::poller::{Poller, Readiness};
use crate::rpc::RpcError;
use crate::supervisor::ProcessSupervisor;

/// First account of a local dev chain started with the default mnemonic.
pub const DEV_ACCOUNT: Address = address!("f39Fd6e51aad88F6F4ce6aB8827279cffFb92266");
pub const RECEIPT_TIMEOUT: Duration = Duration::from_secs(30);
const GAS_LIMIT: u64 = 15_000_000;

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TxReceipt {
    pub hash: String,
    pub success: bool,
    pub block_number: u64,
}

/// Connection failures stay transient so readiness checks keep polling.
pub fn evm_error(err: TransportError) -> RpcError {
    if err.is_transport_error() {
        return RpcError::Unreachable(err.to_string());
    }
    match err.as_error_resp() {
        Some(payload) => RpcError::Remote {
            code: payload.code,
            message: payload.message.to_string(),
        },
        None => RpcError::InvalidResponse(err.to_string()),
    }
}

#[derive(Clone)]
pub struct EvmClient {
    provider: DynProvider,
    runtime: Handle,
    endpoint: String,
}

impl EvmClient {
    /// Must be called from a thread inside the tokio runtime, which includes
    /// `spawn_blocking` workers.
    pub fn from_url(url: &str) -> Result<Self, DevnetError> {
        let runtime = Handle::try_current()
            .map_err(|err| DevnetError::Config(format!("EVM client needs a runtime: {err}")))?;
        let provider = runtime
            .block_on(ProviderBuilder::new().connect(url))
            .map_err(|err| DevnetError::Config(format!("EVM endpoint '{url}': {err}")))?
            .erased();
        Ok(Self {
            provider,
            runtime,
            endpoint: url.to_string(),
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn block_on<F: IntoFuture>(&self, fut: F) -> F::Output {
        self.runtime.block_on(fut.into_future())
    }

    pub fn chain_id(&self) -> Result<u64, RpcError> {
        self.block_on(self.provider.get_chain_id()).map_err(evm_error)
    }

    pub fn block_number(&self) -> Result<u64, RpcError> {
        self.block_on(self.provider.get_block_number())
            .map_err(evm_error)
    }

    pub fn accounts(&self) -> Result<Vec<Address>, RpcError> {
        self.block_on(self.provider.get_accounts()).map_err(evm_error)
    }

    pub fn call(&self, to: Address, data: Vec<u8>) -> Result<Bytes, RpcError> {
        let tx = TransactionRequest::default().to(to).input(data.into());
        self.block_on(self.provider.call(tx)).map_err(evm_error)
    }

    pub fn send_transaction(
        &self,
        from: Address,
        to: Address,
        data: Vec<u8>,
    ) -> Result<B256, RpcError> {
        let tx = TransactionRequest::default()
            .from(from)
            .to(to)
            .input(data.into())
            .gas_limit(GAS_LIMIT);
        let pending = self
            .block_on(self.provider.send_transaction(tx))
            .map_err(evm_error)?;
        Ok(*pending.tx_hash())
    }

    pub fn receipt(&self, hash: B256) -> Result<Option<TxReceipt>, RpcError> {
        let receipt = self
            .block_on(self.provider.get_transaction_receipt(hash))
            .map_err(evm_error)?;
        Ok(receipt.map(|receipt| TxReceipt {
            hash: hash.to_string(),
            success: ReceiptResponse::status(&receipt),
            block_number: ReceiptResponse::block_number(&receipt).unwrap_or(0),
        }))
    }

    /// `evm_mine` is a dev-node extension, so it goes out as a raw request.
    pub fn mine_block(&self) -> Result<(), RpcError> {
        self.block_on(
            self.provider
                .raw_request::<_, serde_json::Value>("evm_mine".into(), ()),
        )
        .map(|_| ())
        .map_err(evm_error)
    }
}

/// Verifies the EVM node reports `expected` within a few quick attempts.
pub fn verify_chain_id(evm: &EvmClient, expected: u64, attempts: u32) -> Result<(), DevnetError> {
    let mut last_err = None;
    for attempt in 0..attempts.max(1) {
        match evm.chain_id() {
            Ok(id) if id == expected => return Ok(()),
            Ok(id) => {
                return Err(DevnetError::Config(format!(
                    "EVM node at {} reports chain id {id}, expected {expected}",
                    evm.endpoint()
                )))
            }
            Err(err) => {
                log_debug!("chain id attempt {} failed: {err}", attempt + 1);
                last_err = Some(err);
                std::thread::sleep(Duration::from_millis(250));
            }
        }
    }
    Err(last_err
        .map(DevnetError::Rpc)
        .unwrap_or(DevnetError::Interrupted))
}

/// `serviceNodes(uint64)` as far as the list dump needs it.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ContractServiceNode {
    pub id: u64,
    pub next: u64,
    pub prev: u64,
    pub operator: Address,
    pub pubkey: BlsPublicKey,
}

impl ContractServiceNode {
    pub fn from_contract(id: u64, node: ServiceNode) -> Self {
        Self {
            id,
            next: node.next,
            prev: node.prev,
            operator: node.operator,
            pubkey: BlsPublicKey {
                x: node.pubkey.x,
                y: node.pubkey.y,
            },
        }
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ContractAddresses {
    pub rewards: Address,
    pub erc20: Address,
    pub foundation_pool: Address,
}

impl ContractAddresses {
    pub fn from_params(params: &ContractParams) -> Result<Self, DevnetError> {
        let parse = |label: &str, raw: &str| {
            raw.parse::<Address>()
                .map_err(|err| DevnetError::Config(format!("{label} address '{raw}': {err}")))
        };
        Ok(Self {
            rewards: parse("rewards contract", &params.rewards_contract)?,
            erc20: parse("erc20 contract", &params.erc20_contract)?,
            foundation_pool: parse("foundation pool", &params.foundation_pool_contract)?,
        })
    }
}

/// Rewards-contract operations used by the bridge workflow. Mutating calls
/// return once their receipt confirms success; a revert is an error.
pub trait RewardsContract: Send + Sync {
    fn addresses(&self) -> &ContractAddresses;
    /// Account that funds, registers, and claims.
    fn funding_account(&self) -> Address;
    fn staking_requirement(&self) -> Result<U256, DevnetError>;
    fn total_nodes(&self) -> Result<u64, DevnetError>;
    fn service_node(&self, id: u64) -> Result<ContractServiceNode, DevnetError>;
    fn seed_public_key_list(&self, entries: &[ContractSeedEntry]) -> Result<TxReceipt, DevnetError>;
    fn start(&self) -> Result<TxReceipt, DevnetError>;
    fn add_bls_public_key(&self, args: &BlsRegistrationArgs) -> Result<TxReceipt, DevnetError>;
    fn advance_blocks(&self, count: usize) -> Result<(), DevnetError>;
    fn recipient(&self, address: &Address) -> Result<RecipientBalance, DevnetError>;
    fn erc20_balance(&self, address: &Address) -> Result<U256, DevnetError>;
    /// ERC20 transfer from the funding account to the rewards contract.
    fn fund_rewards(&self, amount: U256) -> Result<TxReceipt, DevnetError>;
    fn payout_released(&self) -> Result<U256, DevnetError>;
    fn update_rewards_balance(&self, claim: &RewardsClaim) -> Result<TxReceipt, DevnetError>;
    fn claim_rewards(&self) -> Result<TxReceipt, DevnetError>;
}

pub struct RpcRewardsContract {
    evm: EvmClient,
    addresses: ContractAddresses,
    account: Address,
    supervisor: Option<Arc<ProcessSupervisor>>,
}

impl RpcRewardsContract {
    /// Uses the node's first unlocked account, falling back to the default
    /// dev account when the node does not list any.
    pub fn connect(evm: EvmClient, addresses: ContractAddresses) -> Self {
        let account = match evm.accounts() {
            Ok(accounts) => accounts.first().copied().unwrap_or(DEV_ACCOUNT),
            Err(err) => {
                log_warn!("eth_accounts failed ({err}); using {DEV_ACCOUNT}");
                DEV_ACCOUNT
            }
        };
        Self {
            evm,
            addresses,
            account,
            supervisor: None,
        }
    }

    /// Receipt waits stop when the supervisor is cancelled.
    pub fn with_supervisor(mut self, supervisor: Arc<ProcessSupervisor>) -> Self {
        self.supervisor = Some(supervisor);
        self
    }

    fn view<C: SolCall>(&self, to: Address, call: &C) -> Result<C::Return, DevnetError> {
        let data = self.evm.call(to, call.abi_encode())?;
        C::abi_decode_returns(&data).map_err(|err| decode_error(C::SIGNATURE, err))
    }

    fn transact<C: SolCall>(&self, to: Address, call: &C) -> Result<TxReceipt, DevnetError> {
        let signature = C::SIGNATURE;
        let hash = self
            .evm
            .send_transaction(self.account, to, call.abi_encode())?;
        log_debug!("sent {signature} as {hash}");
        let mut receipt = None;
        let poller = match self.supervisor.as_deref() {
            Some(supervisor) => supervisor.poller(RECEIPT_TIMEOUT),
            None => Poller::new(RECEIPT_TIMEOUT),
        };
        poller.require(
            &format!("receipt of {signature}"),
            || -> Result<Readiness, RpcError> {
                receipt = self.evm.receipt(hash)?;
                Ok(receipt.is_some().into())
            },
        )?;
        let receipt = receipt.ok_or(DevnetError::Interrupted)?;
        if !receipt.success {
            return Err(DevnetError::mismatch(
                format!("{signature} transaction {hash}"),
                "success",
                "revert",
            ));
        }
        Ok(receipt)
    }
}

fn decode_error(what: &str, err: impl std::fmt::Display) -> DevnetError {
    DevnetError::Rpc(RpcError::InvalidResponse(format!("{what}: {err}")))
}

impl RewardsContract for RpcRewardsContract {
    fn addresses(&self) -> &ContractAddresses {
        &self.addresses
    }

    fn funding_account(&self) -> Address {
        self.account
    }

    fn staking_requirement(&self) -> Result<U256, DevnetError> {
        self.view(
            self.addresses.rewards,
            &ServiceNodeRewards::stakingRequirementCall {},
        )
    }

    fn total_nodes(&self) -> Result<u64, DevnetError> {
        let value = self.view(self.addresses.rewards, &ServiceNodeRewards::totalNodesCall {})?;
        u64::try_from(value).map_err(|_| decode_error("totalNodes()", "count exceeds u64"))
    }

    fn service_node(&self, id: u64) -> Result<ContractServiceNode, DevnetError> {
        let node = self.view(
            self.addresses.rewards,
            &ServiceNodeRewards::serviceNodesCall { serviceNodeID: id },
        )?;
        Ok(ContractServiceNode::from_contract(id, node))
    }

    fn seed_public_key_list(&self, entries: &[ContractSeedEntry]) -> Result<TxReceipt, DevnetError> {
        let call = ServiceNodeRewards::seedPublicKeyListCall {
            nodes: entries.iter().map(ContractSeedEntry::to_contract).collect(),
        };
        self.transact(self.addresses.rewards, &call)
    }

    fn start(&self) -> Result<TxReceipt, DevnetError> {
        self.transact(self.addresses.rewards, &ServiceNodeRewards::startCall {})
    }

    fn add_bls_public_key(&self, args: &BlsRegistrationArgs) -> Result<TxReceipt, DevnetError> {
        let call = args.contract_call(0).map_err(|err| {
            DevnetError::Rpc(RpcError::InvalidResponse(format!(
                "bls registration arguments: {err}"
            )))
        })?;
        self.transact(self.addresses.rewards, &call)
    }

    fn advance_blocks(&self, count: usize) -> Result<(), DevnetError> {
        for _ in 0..count {
            self.evm.mine_block()?;
        }
        Ok(())
    }

    fn recipient(&self, address: &Address) -> Result<RecipientBalance, DevnetError> {
        let stored = self.view(
            self.addresses.rewards,
            &ServiceNodeRewards::recipientsCall {
                recipient: *address,
            },
        )?;
        Ok(RecipientBalance {
            rewards: stored.rewards,
            claimed: stored.claimed,
        })
    }

    fn erc20_balance(&self, address: &Address) -> Result<U256, DevnetError> {
        self.view(
            self.addresses.erc20,
            &ERC20::balanceOfCall { account: *address },
        )
    }

    fn fund_rewards(&self, amount: U256) -> Result<TxReceipt, DevnetError> {
        let call = ERC20::transferCall {
            to: self.addresses.rewards,
            amount,
        };
        self.transact(self.addresses.erc20, &call)
    }

    fn payout_released(&self) -> Result<U256, DevnetError> {
        self.view(
            self.addresses.foundation_pool,
            &FoundationPool::payoutReleasedCall {},
        )
    }

    fn update_rewards_balance(&self, claim: &RewardsClaim) -> Result<TxReceipt, DevnetError> {
        self.transact(self.addresses.rewards, &claim.update_call())
    }

    fn claim_rewards(&self) -> Result<TxReceipt, DevnetError> {
        self.transact(self.addresses.rewards, &ServiceNodeRewards::claimRewardsCall {})
    }
}
