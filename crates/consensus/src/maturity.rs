//! Coinbase maturity and contribution arithmetic.
//!
//! A wallet funded only by mining owns one coinbase output per mined block.
//! Each registration spends `inputs_per_registration` of them, and none can be
//! spent before the unlock window has passed or before the chain holds enough
//! outputs to build rings from.

use crate::money::Amount;
use crate::params::DevnetParams;

pub fn inputs_per_registration(params: &DevnetParams) -> u64 {
    if params.block_reward == 0 {
        return u64::MAX;
    }
    params.staking_requirement.div_ceil(params.block_reward)
}

/// Lowest chain height at which a mining-funded wallet can submit its
/// `registrations`-th solo registration.
pub fn min_registration_height(params: &DevnetParams, registrations: u64) -> u64 {
    let spendable = registrations.saturating_mul(inputs_per_registration(params));
    params
        .coinbase_unlock_window
        .saturating_add(spendable.max(params.min_ring_outputs))
}

/// Smallest contribution the next contributor may make once `reserved` has
/// been committed across `reserved_slots` contributors.
pub fn min_contribution(
    staking_requirement: Amount,
    reserved: Amount,
    reserved_slots: usize,
    max_contributors: usize,
) -> Option<Amount> {
    let remaining = staking_requirement.checked_sub(reserved)?;
    let open_slots = max_contributors.checked_sub(reserved_slots)?;
    if remaining == 0 || open_slots == 0 {
        return None;
    }
    Some(remaining / open_slots as u64)
}
