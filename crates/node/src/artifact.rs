//! Runtime connection details left in the data directory for helper scripts.
//!
//! The file is a list of `key="value"` lines preceded by a script header, so
//! the same file can be imported by Python tooling and read back here.

use std::fs;
use std::path::{Path, PathBuf};

use crate::error::DevnetError;

pub const RUNTIME_CONFIG_FILE: &str = "config.py";
const HEADER: &str = "#!/usr/bin/python3\n# -*- coding: utf-8 -*-\n";

#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct RuntimeConfig {
    /// First service node's RPC listener.
    pub listen_ip: String,
    pub listen_port: u16,
    /// Funding wallet's RPC listener and address.
    pub wallet_listen_ip: String,
    pub wallet_listen_port: u16,
    pub wallet_address: String,
    pub external_address: String,
}

impl RuntimeConfig {
    pub fn render(&self) -> String {
        let mut out = String::from(HEADER);
        for (key, value) in [
            ("listen_ip", self.listen_ip.clone()),
            ("listen_port", self.listen_port.to_string()),
            ("wallet_listen_ip", self.wallet_listen_ip.clone()),
            ("wallet_listen_port", self.wallet_listen_port.to_string()),
            ("wallet_address", self.wallet_address.clone()),
            ("external_address", self.external_address.clone()),
        ] {
            out.push_str(&format!("{key}=\"{value}\"\n"));
        }
        out
    }

    pub fn path_in(data_dir: &Path) -> PathBuf {
        data_dir.join(RUNTIME_CONFIG_FILE)
    }

    pub fn write(&self, data_dir: &Path) -> Result<PathBuf, DevnetError> {
        let path = Self::path_in(data_dir);
        fs::write(&path, self.render())
            .map_err(|err| DevnetError::Io(format!("failed to write {}: {err}", path.display())))?;
        Ok(path)
    }

    pub fn load(data_dir: &Path) -> Result<Self, DevnetError> {
        let path = Self::path_in(data_dir);
        let contents = fs::read_to_string(&path).map_err(|err| {
            DevnetError::Config(format!(
                "failed to read {} (is a devnet running?): {err}",
                path.display()
            ))
        })?;
        Self::parse(&contents)
            .map_err(|err| DevnetError::Config(format!("{}: {err}", path.display())))
    }

    pub fn parse(contents: &str) -> Result<Self, String> {
        let mut config = RuntimeConfig::default();
        let mut seen_port = false;
        for (line_no, raw_line) in contents.lines().enumerate() {
            let line = raw_line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let Some((key, value)) = line.split_once('=') else {
                return Err(format!("line {}: expected key=\"value\"", line_no + 1));
            };
            let value = value.trim();
            let value = value
                .strip_prefix('"')
                .and_then(|value| value.strip_suffix('"'))
                .unwrap_or(value);
            let port = |value: &str| {
                value
                    .parse::<u16>()
                    .map_err(|_| format!("line {}: invalid port '{value}'", line_no + 1))
            };
            match key.trim() {
                "listen_ip" => config.listen_ip = value.to_string(),
                "listen_port" => {
                    config.listen_port = port(value)?;
                    seen_port = true;
                }
                "wallet_listen_ip" => config.wallet_listen_ip = value.to_string(),
                "wallet_listen_port" => config.wallet_listen_port = port(value)?,
                "wallet_address" => config.wallet_address = value.to_string(),
                "external_address" => config.external_address = value.to_string(),
                _ => {}
            }
        }
        if config.listen_ip.is_empty() || !seen_port {
            return Err("missing listen_ip/listen_port".to_string());
        }
        Ok(config)
    }
}
