//! Native-chain amounts, devnet parameters, and registration maturity rules.

pub mod constants;
pub mod maturity;
pub mod money;
pub mod params;

pub use maturity::{inputs_per_registration, min_contribution, min_registration_height};
pub use money::{coins, format_coins, Amount, COIN};
pub use params::{devnet_params, ContractParams, DevnetParams};
