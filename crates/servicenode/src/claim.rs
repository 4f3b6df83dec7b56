use sndevnet_primitives::{Address, BlsSignature, ServiceNodeRewards, U256};

/// Aggregated rewards attestation returned by the native chain for one
/// beneficiary.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RewardsClaim {
    pub beneficiary: Address,
    pub amount: U256,
    pub signature: BlsSignature,
    pub non_signer_indices: Vec<u64>,
}

impl RewardsClaim {
    /// Addresses compare on bytes, so checksummed and lowercase renderings of
    /// the same account match.
    pub fn is_for(&self, address: &Address) -> bool {
        self.beneficiary == *address
    }

    pub fn update_call(&self) -> ServiceNodeRewards::updateRewardsBalanceCall {
        ServiceNodeRewards::updateRewardsBalanceCall {
            recipientAddress: self.beneficiary,
            recipientRewards: self.amount,
            blsSignature: self.signature.to_params(),
            ids: self.non_signer_indices.clone(),
        }
    }
}

/// `recipients(address)` as stored by the rewards contract.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct RecipientBalance {
    pub rewards: U256,
    pub claimed: U256,
}

impl RecipientBalance {
    pub fn available(&self) -> U256 {
        self.rewards.saturating_sub(self.claimed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matches_beneficiary_regardless_of_case() {
        let claim = RewardsClaim {
            beneficiary: "0xf39Fd6e51aad88F6F4ce6aB8827279cffFb92266".parse().unwrap(),
            amount: U256::from(5u64),
            signature: BlsSignature([U256::ZERO; 4]),
            non_signer_indices: vec![3, 9],
        };
        let lower: Address = "f39fd6e51aad88f6f4ce6ab8827279cfffb92266".parse().unwrap();
        assert!(claim.is_for(&lower));
        assert!(!claim.is_for(&Address::repeat_byte(0x22)));

        let call = claim.update_call();
        assert_eq!(call.recipientAddress, lower);
        assert_eq!(call.ids, vec![3, 9]);
    }

    #[test]
    fn available_never_underflows() {
        let balance = RecipientBalance {
            rewards: U256::from(10u64),
            claimed: U256::from(4u64),
        };
        assert_eq!(balance.available(), U256::from(6u64));
        let odd = RecipientBalance {
            rewards: U256::from(1u64),
            claimed: U256::from(2u64),
        };
        assert_eq!(odd.available(), U256::ZERO);
    }
}
