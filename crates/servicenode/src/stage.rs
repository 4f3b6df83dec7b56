//! Lifecycle stages for a single service node and for the cross-chain bridge.
//!
//! Both move strictly forward one step at a time. Skipping a step or moving
//! backwards is reported as a [`StageError`].

use std::fmt;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum NodeStage {
    Unfunded,
    AwaitingMaturity,
    Registered,
    ProofPropagated,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum BridgeStage {
    Unseeded,
    Seeded,
    KeyRegistered,
    /// The native chain has produced blocks since the key registration.
    PulseObserved,
    RewardsAvailable,
    RewardsClaimed,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct StageError {
    pub from: &'static str,
    pub to: &'static str,
}

impl fmt::Display for StageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cannot move from {} to {}", self.from, self.to)
    }
}

impl std::error::Error for StageError {}

impl NodeStage {
    pub fn as_str(self) -> &'static str {
        match self {
            NodeStage::Unfunded => "unfunded",
            NodeStage::AwaitingMaturity => "awaiting-maturity",
            NodeStage::Registered => "registered",
            NodeStage::ProofPropagated => "proof-propagated",
        }
    }

    pub fn next(self) -> Option<Self> {
        match self {
            NodeStage::Unfunded => Some(NodeStage::AwaitingMaturity),
            NodeStage::AwaitingMaturity => Some(NodeStage::Registered),
            NodeStage::Registered => Some(NodeStage::ProofPropagated),
            NodeStage::ProofPropagated => None,
        }
    }

    pub fn advance(&mut self, to: NodeStage) -> Result<(), StageError> {
        if self.next() != Some(to) {
            return Err(StageError {
                from: self.as_str(),
                to: to.as_str(),
            });
        }
        *self = to;
        Ok(())
    }
}

impl BridgeStage {
    pub fn as_str(self) -> &'static str {
        match self {
            BridgeStage::Unseeded => "unseeded",
            BridgeStage::Seeded => "seeded",
            BridgeStage::KeyRegistered => "key-registered",
            BridgeStage::PulseObserved => "pulse-observed",
            BridgeStage::RewardsAvailable => "rewards-available",
            BridgeStage::RewardsClaimed => "rewards-claimed",
        }
    }

    pub fn next(self) -> Option<Self> {
        match self {
            BridgeStage::Unseeded => Some(BridgeStage::Seeded),
            BridgeStage::Seeded => Some(BridgeStage::KeyRegistered),
            BridgeStage::KeyRegistered => Some(BridgeStage::PulseObserved),
            BridgeStage::PulseObserved => Some(BridgeStage::RewardsAvailable),
            BridgeStage::RewardsAvailable => Some(BridgeStage::RewardsClaimed),
            BridgeStage::RewardsClaimed => None,
        }
    }

    /// Errors unless the bridge currently sits at `stage`.
    pub fn expect(self, stage: BridgeStage) -> Result<(), StageError> {
        if self != stage {
            return Err(StageError {
                from: self.as_str(),
                to: stage.next().map(BridgeStage::as_str).unwrap_or("done"),
            });
        }
        Ok(())
    }

    pub fn advance(&mut self, to: BridgeStage) -> Result<(), StageError> {
        if self.next() != Some(to) {
            return Err(StageError {
                from: self.as_str(),
                to: to.as_str(),
            });
        }
        *self = to;
        Ok(())
    }
}

impl fmt::Display for NodeStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl fmt::Display for BridgeStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
