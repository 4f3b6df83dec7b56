//! Secondary-chain setup: an optional local EVM node and contract
//! deployment, both finished before any native process starts.

use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::Arc;

use sndevnet_consensus::ContractParams;

use crate::contract::{verify_chain_id, ContractAddresses, EvmClient, RpcRewardsContract};
use crate::error::DevnetError;
use crate::supervisor::{ProcessHandle, ProcessSpec, ProcessSupervisor};

pub const CHAIN_ID_ATTEMPTS: u32 = 4;
pub const DEPLOY_TARGET: &str = "deploy-local";

#[derive(Clone, Debug, Default)]
pub struct ChainConfig {
    /// EVM node binary to launch; when absent a node must already be running.
    pub anvil_path: Option<PathBuf>,
    /// Contracts checkout deployed with `make deploy-local`.
    pub contracts_dir: Option<PathBuf>,
    pub contract: ContractParams,
}

impl ChainConfig {
    /// Checks paths before anything is spawned.
    pub fn validate(&self) -> Result<(), DevnetError> {
        if self.anvil_path.is_some() && self.contracts_dir.is_none() {
            return Err(DevnetError::Config(
                "--eth-sn-contracts-dir must be specified when --anvil-path is set".to_string(),
            ));
        }
        if let Some(path) = self.anvil_path.as_ref() {
            if !path.exists() {
                return Err(DevnetError::Config(format!(
                    "anvil path '{}' does not exist",
                    path.display()
                )));
            }
        }
        if let Some(dir) = self.contracts_dir.as_ref() {
            let makefile = dir.join("Makefile");
            if !makefile.exists() {
                return Err(DevnetError::Config(format!(
                    "expected '{}' to exist",
                    makefile.display()
                )));
            }
        }
        Ok(())
    }
}

pub struct SecondaryChain {
    pub evm: EvmClient,
    pub process: Option<ProcessHandle>,
}

impl SecondaryChain {
    /// Starts the EVM node if configured, verifies the chain id, and deploys
    /// contracts if configured.
    pub fn prepare(
        config: &ChainConfig,
        supervisor: &ProcessSupervisor,
    ) -> Result<Self, DevnetError> {
        config.validate()?;
        let evm = EvmClient::from_url(&config.contract.rpc_url)?;
        let process = match config.anvil_path.as_ref() {
            Some(path) => {
                let handle = supervisor.spawn(&ProcessSpec::new("anvil", path))?;
                log_info!("Started local EVM node from {}", path.display());
                supervisor.wait_ready(handle, || evm.block_number().map(|_| true.into()))?;
                Some(handle)
            }
            None => None,
        };
        verify_chain_id(&evm, config.contract.chain_id, CHAIN_ID_ATTEMPTS)?;
        log_info!(
            "EVM node at {} reports chain id {}",
            evm.endpoint(),
            config.contract.chain_id
        );
        if let Some(dir) = config.contracts_dir.as_ref() {
            deploy_contracts(dir)?;
        }
        Ok(Self { evm, process })
    }

    pub fn rewards_contract(
        &self,
        params: &ContractParams,
        supervisor: Arc<ProcessSupervisor>,
    ) -> Result<RpcRewardsContract, DevnetError> {
        let addresses = ContractAddresses::from_params(params)?;
        Ok(RpcRewardsContract::connect(self.evm.clone(), addresses).with_supervisor(supervisor))
    }
}

/// Runs `make deploy-local` in `dir`. Output is inherited so build failures
/// stay visible.
pub fn deploy_contracts(dir: &Path) -> Result<(), DevnetError> {
    log_info!("Deploying contracts from {}", dir.display());
    let status = Command::new("make")
        .arg(DEPLOY_TARGET)
        .current_dir(dir)
        .stdin(Stdio::null())
        .status()
        .map_err(|err| DevnetError::Process(format!("failed to run make: {err}")))?;
    if !status.success() {
        return Err(DevnetError::Process(format!(
            "make {DEPLOY_TARGET} in {} failed ({status})",
            dir.display()
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn anvil_requires_contracts_dir() {
        let config = ChainConfig {
            anvil_path: Some(PathBuf::from("/bin/sh")),
            ..ChainConfig::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("--eth-sn-contracts-dir"));
    }

    #[test]
    fn contracts_dir_needs_a_makefile() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = ChainConfig {
            contracts_dir: Some(dir.path().to_path_buf()),
            ..ChainConfig::default()
        };
        assert!(matches!(config.validate(), Err(DevnetError::Config(_))));
        fs::write(dir.path().join("Makefile"), "deploy-local:\n\t@true\n").unwrap();
        assert!(config.validate().is_ok());
        config.anvil_path = Some(dir.path().join("missing-anvil"));
        assert!(config.validate().is_err());
    }
}
