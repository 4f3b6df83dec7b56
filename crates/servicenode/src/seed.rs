//! Conversion of native-chain stakes into rewards-contract seed entries.
//!
//! Every native contribution is scaled by
//! `contract_requirement / native_requirement` with integer arithmetic. The
//! truncation remainder goes to the operator so that each entry stakes the
//! contract requirement exactly.

use std::fmt;

use sndevnet_consensus::Amount;
use sndevnet_primitives::contracts;
use sndevnet_primitives::{Address, BlsPublicKey, U256};

use crate::registration::Contributor;

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ConversionError {
    NoContributors,
    ZeroRequirement,
    Overstaked { total: Amount, requirement: Amount },
}

impl fmt::Display for ConversionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConversionError::NoContributors => write!(f, "service node has no contributors"),
            ConversionError::ZeroRequirement => write!(f, "native staking requirement is zero"),
            ConversionError::Overstaked { total, requirement } => write!(
                f,
                "native contributions {total} exceed the staking requirement {requirement}"
            ),
        }
    }
}

impl std::error::Error for ConversionError {}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ContractContributor {
    pub address: Address,
    pub staked_amount: U256,
}

impl ContractContributor {
    pub fn to_contract(&self) -> contracts::Contributor {
        contracts::Contributor {
            addr: self.address,
            stakedAmount: self.staked_amount,
        }
    }
}

/// Scales `contributors` into contract units. Returns the converted list (same
/// order) and the index of the contributor that absorbed the remainder.
///
/// The operator is the contributor whose address equals `operator_address`;
/// when none matches (or no operator is known) the first contributor is used.
pub fn convert_stakes(
    contributors: &[Contributor],
    operator_address: Option<&str>,
    native_requirement: Amount,
    contract_requirement: U256,
    contract_address: Address,
) -> Result<(Vec<ContractContributor>, usize), ConversionError> {
    if contributors.is_empty() {
        return Err(ConversionError::NoContributors);
    }
    if native_requirement == 0 {
        return Err(ConversionError::ZeroRequirement);
    }
    let native_total = contributors
        .iter()
        .fold(0u64, |acc, contributor| acc.saturating_add(contributor.amount));
    if native_total > native_requirement {
        return Err(ConversionError::Overstaked {
            total: native_total,
            requirement: native_requirement,
        });
    }

    let native_requirement = U256::from(native_requirement);
    let mut converted: Vec<ContractContributor> = contributors
        .iter()
        .map(|contributor| {
            // amount <= native_requirement, so the product fits whenever the
            // contract requirement leaves 64 bits of headroom; fall back to
            // dividing first otherwise.
            let amount = U256::from(contributor.amount);
            let staked_amount = match amount.checked_mul(contract_requirement) {
                Some(product) => product / native_requirement,
                None => contract_requirement / native_requirement * amount,
            };
            ContractContributor {
                address: contract_address,
                staked_amount,
            }
        })
        .collect();

    let operator_index = operator_address
        .and_then(|operator| {
            contributors
                .iter()
                .position(|contributor| contributor.address == operator)
        })
        .unwrap_or(0);

    let total = converted
        .iter()
        .fold(U256::ZERO, |acc, entry| acc + entry.staked_amount);
    if total < contract_requirement {
        converted[operator_index].staked_amount += contract_requirement - total;
    }
    Ok((converted, operator_index))
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ContractSeedEntry {
    pub bls_pubkey: BlsPublicKey,
    pub contributors: Vec<ContractContributor>,
}

impl ContractSeedEntry {
    pub fn build(
        bls_pubkey: BlsPublicKey,
        contributors: &[Contributor],
        operator_address: Option<&str>,
        native_requirement: Amount,
        contract_requirement: U256,
        contract_address: Address,
    ) -> Result<Self, ConversionError> {
        let (contributors, _) = convert_stakes(
            contributors,
            operator_address,
            native_requirement,
            contract_requirement,
            contract_address,
        )?;
        Ok(Self {
            bls_pubkey,
            contributors,
        })
    }

    pub fn total_staked(&self) -> U256 {
        self.contributors
            .iter()
            .fold(U256::ZERO, |acc, entry| acc + entry.staked_amount)
    }

    pub fn to_contract(&self) -> contracts::SeedServiceNode {
        contracts::SeedServiceNode {
            pubkey: self.bls_pubkey.to_point(),
            contributors: self
                .contributors
                .iter()
                .map(ContractContributor::to_contract)
                .collect(),
        }
    }
}
