//! Service-node registration records, stake conversion into contract units,
//! reward claims, and the stage machines both workflows advance through.

pub mod claim;
pub mod registration;
pub mod seed;
pub mod stage;

pub use claim::{RecipientBalance, RewardsClaim};
pub use registration::{Contributor, RegistrationError, ServiceNodeRegistration};
pub use seed::{convert_stakes, ContractContributor, ContractSeedEntry, ConversionError};
pub use stage::{BridgeStage, NodeStage, StageError};
