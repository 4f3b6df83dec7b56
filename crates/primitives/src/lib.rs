//! Secondary-chain primitives: contract bindings and the hex-packed BLS
//! values exchanged with the native chain.

pub mod bls;
pub mod contracts;

pub use alloy_primitives::{Address, U256};
pub use alloy_sol_types::{SolCall, SolValue};
pub use bls::{BlsPublicKey, BlsSignature, HexWordsError};
pub use contracts::{ERC20, FoundationPool, ServiceNodeRewards};
