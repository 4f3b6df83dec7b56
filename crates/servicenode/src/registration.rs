//! Native-chain service-node registrations.

use std::fmt;

use sndevnet_consensus::constants::MAX_OPERATOR_CUT_PERCENT;
use sndevnet_consensus::{format_coins, min_contribution, Amount};

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Contributor {
    pub address: String,
    pub amount: Amount,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum RegistrationError {
    InvalidCut(u8),
    EmptyStake,
    Overstaked { total: Amount, requirement: Amount },
    BelowMinimum { amount: Amount, minimum: Amount },
    SlotsExhausted { max: usize },
    AlreadyFull,
}

impl fmt::Display for RegistrationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RegistrationError::InvalidCut(cut) => write!(f, "operator cut {cut}% exceeds 100%"),
            RegistrationError::EmptyStake => write!(f, "registration carries no stake"),
            RegistrationError::Overstaked { total, requirement } => write!(
                f,
                "contributions total {} exceeding the staking requirement {}",
                format_coins(*total),
                format_coins(*requirement)
            ),
            RegistrationError::BelowMinimum { amount, minimum } => write!(
                f,
                "contribution {} is below the minimum {}",
                format_coins(*amount),
                format_coins(*minimum)
            ),
            RegistrationError::SlotsExhausted { max } => {
                write!(f, "all {max} contributor slots are taken")
            }
            RegistrationError::AlreadyFull => write!(f, "service node is already fully staked"),
        }
    }
}

impl std::error::Error for RegistrationError {}

/// One service node's stake as submitted on the native chain. The operator is
/// always `contributors[0]`.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ServiceNodeRegistration {
    pub operator_wallet: String,
    pub contributors: Vec<Contributor>,
    pub cut_percent: u8,
    pub staking_requirement: Amount,
}

impl ServiceNodeRegistration {
    /// Operator stakes the full requirement alone and keeps all rewards.
    pub fn solo(operator_wallet: &str, operator_address: &str, staking_requirement: Amount) -> Self {
        Self {
            operator_wallet: operator_wallet.to_string(),
            contributors: vec![Contributor {
                address: operator_address.to_string(),
                amount: staking_requirement,
            }],
            cut_percent: MAX_OPERATOR_CUT_PERCENT,
            staking_requirement,
        }
    }

    /// Operator reserves `operator_amount` and leaves the rest open to
    /// contributors, keeping `cut_percent` of rewards.
    pub fn open(
        operator_wallet: &str,
        operator_address: &str,
        cut_percent: u8,
        operator_amount: Amount,
        staking_requirement: Amount,
    ) -> Result<Self, RegistrationError> {
        let registration = Self {
            operator_wallet: operator_wallet.to_string(),
            contributors: vec![Contributor {
                address: operator_address.to_string(),
                amount: operator_amount,
            }],
            cut_percent,
            staking_requirement,
        };
        registration.validate()?;
        Ok(registration)
    }

    pub fn operator_address(&self) -> &str {
        self.contributors
            .first()
            .map(|contributor| contributor.address.as_str())
            .unwrap_or_default()
    }

    pub fn total(&self) -> Amount {
        self.contributors
            .iter()
            .map(|contributor| contributor.amount)
            .sum()
    }

    pub fn remaining(&self) -> Amount {
        self.staking_requirement.saturating_sub(self.total())
    }

    pub fn is_full(&self) -> bool {
        self.total() >= self.staking_requirement
    }

    pub fn validate(&self) -> Result<(), RegistrationError> {
        if self.cut_percent > MAX_OPERATOR_CUT_PERCENT {
            return Err(RegistrationError::InvalidCut(self.cut_percent));
        }
        if self.contributors.is_empty() || self.total() == 0 {
            return Err(RegistrationError::EmptyStake);
        }
        let total = self.total();
        if total > self.staking_requirement {
            return Err(RegistrationError::Overstaked {
                total,
                requirement: self.staking_requirement,
            });
        }
        Ok(())
    }

    /// Lowest amount the next contributor may stake, or `None` once the node
    /// is full or out of slots.
    pub fn next_minimum(&self, max_contributors: usize) -> Option<Amount> {
        min_contribution(
            self.staking_requirement,
            self.total(),
            self.contributors.len(),
            max_contributors,
        )
    }

    pub fn add_contribution(
        &mut self,
        address: &str,
        amount: Amount,
        max_contributors: usize,
    ) -> Result<(), RegistrationError> {
        if self.is_full() {
            return Err(RegistrationError::AlreadyFull);
        }
        if self.contributors.len() >= max_contributors {
            return Err(RegistrationError::SlotsExhausted {
                max: max_contributors,
            });
        }
        if let Some(minimum) = self.next_minimum(max_contributors) {
            if amount < minimum && amount < self.remaining() {
                return Err(RegistrationError::BelowMinimum { amount, minimum });
            }
        }
        let total = self.total().saturating_add(amount);
        if total > self.staking_requirement {
            return Err(RegistrationError::Overstaked {
                total,
                requirement: self.staking_requirement,
            });
        }
        self.contributors.push(Contributor {
            address: address.to_string(),
            amount,
        });
        Ok(())
    }

    /// Positional arguments for the daemon's registration command builder:
    /// operator cut followed by address/amount pairs.
    pub fn command_args(&self) -> Vec<String> {
        let mut args = Vec::with_capacity(1 + self.contributors.len() * 2);
        args.push(self.cut_percent.to_string());
        for contributor in &self.contributors {
            args.push(contributor.address.clone());
            args.push(contributor.amount.to_string());
        }
        args
    }
}
