//! Devnet-wide constants shared by the registration and bridge workflows.

/// Coinbase outputs can only be spent after this many further blocks.
pub const COINBASE_UNLOCK_WINDOW: u64 = 30;
/// Regular transfers unlock after this many confirmations.
pub const TRANSFER_UNLOCK_BLOCKS: u64 = 10;
/// Distinct spendable outputs that must exist on chain before a wallet can
/// build a ring for any spend.
pub const MIN_RING_OUTPUTS: u64 = 10;
/// Maximum number of contributors (operator included) on one service node.
pub const MAX_CONTRIBUTORS: usize = 10;
/// Operator cut is expressed in whole percent.
pub const MAX_OPERATOR_CUT_PERCENT: u8 = 100;
/// Chain id reported by a local private EVM node.
pub const LOCAL_EVM_CHAIN_ID: u64 = 31_337;
/// Blocks the secondary chain is advanced after a contract registration so the
/// native chain's tracker observes the event.
pub const SECONDARY_CHAIN_ADVANCE_BLOCKS: usize = 3;
/// Extra ERC20 units sent on top of a claim amount when funding the contract.
pub const CLAIM_FUNDING_MARGIN: u64 = 100;
