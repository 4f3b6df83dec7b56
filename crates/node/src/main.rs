use sndevnet_log as logging;

macro_rules! log_at {
    ($level:expr, $($arg:tt)*) => {{
        if crate::logging::enabled($level) {
            crate::logging::log($level, module_path!(), format_args!($($arg)*));
        }
    }};
}

macro_rules! log_error {
    ($($arg:tt)*) => {{
        log_at!(crate::logging::Level::Error, $($arg)*);
    }};
}

macro_rules! log_warn {
    ($($arg:tt)*) => {{
        log_at!(crate::logging::Level::Warn, $($arg)*);
    }};
}

macro_rules! log_info {
    ($($arg:tt)*) => {{
        log_at!(crate::logging::Level::Info, $($arg)*);
    }};
}

macro_rules! log_debug {
    ($($arg:tt)*) => {{
        log_at!(crate::logging::Level::Debug, $($arg)*);
    }};
}

#[allow(unused_macros)]
macro_rules! log_trace {
    ($($arg:tt)*) => {{
        log_at!(crate::logging::Level::Trace, $($arg)*);
    }};
}

macro_rules! progress {
    ($($arg:tt)*) => {{
        crate::logging::progress(module_path!(), format_args!($($arg)*));
    }};
}

pub mod artifact;
pub mod barrier;
pub mod bridge;
pub mod chain;
pub mod contract;
pub mod daemon;
pub mod error;
pub mod network;
pub mod poller;
pub mod pool;
pub mod registration;
pub mod request;
pub mod rpc;
pub mod supervisor;
pub mod topology;
pub mod wallet;

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::Instant;

use fs2::FileExt;
use serde_json::Value;
use sndevnet_consensus::devnet_params;
use tokio::sync::{mpsc, watch};

use crate::bridge::CrossChainBridge;
use crate::chain::{ChainConfig, SecondaryChain};
use crate::error::DevnetError;
use crate::network::{Network, NetworkConfig};
use crate::registration::RegistrationWorkflow;
use crate::supervisor::{ProcessSupervisor, SupervisorGuard};

const DATA_DIR_LOCK_FILE_NAME: &str = ".lock";
const DEFAULT_CONF_FILE: &str = "sndevnet.conf";

#[derive(Clone, Debug)]
pub struct Config {
    pub network: NetworkConfig,
    pub chain: ChainConfig,
    pub log: logging::LogConfig,
    pub conf_path: PathBuf,
}

#[derive(Debug)]
pub enum CliAction {
    Run(Box<Config>),
    PrintHelp,
    PrintVersion,
    Request {
        data_dir: PathBuf,
        method: String,
        params: Value,
    },
}

#[derive(Debug)]
struct DataDirLock {
    _file: File,
}

fn lock_data_dir(data_dir: &Path) -> Result<DataDirLock, String> {
    fs::create_dir_all(data_dir).map_err(|err| {
        format!("failed to create data dir {}: {err}", data_dir.display())
    })?;
    let lock_path = data_dir.join(DATA_DIR_LOCK_FILE_NAME);
    let mut file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(&lock_path)
        .map_err(|err| format!("failed to open lock file {}: {err}", lock_path.display()))?;

    match file.try_lock_exclusive() {
        Ok(()) => {
            let _ = file.set_len(0);
            let _ = file.seek(SeekFrom::Start(0));
            let _ = writeln!(file, "pid={}", std::process::id());
            let _ = file.flush();
            Ok(DataDirLock { _file: file })
        }
        Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
            let mut holder = String::new();
            let _ =
                File::open(&lock_path).and_then(|mut reader| reader.read_to_string(&mut holder));
            let holder = holder.trim();
            let suffix = if holder.is_empty() {
                String::new()
            } else {
                format!(" ({holder})")
            };
            Err(format!(
                "data dir {} is in use by another devnet; lock file {}{suffix}",
                data_dir.display(),
                lock_path.display()
            ))
        }
        Err(err) => Err(format!(
            "failed to lock data dir {} (lock file {}): {err}",
            data_dir.display(),
            lock_path.display()
        )),
    }
}

pub async fn run_entry() -> Result<(), String> {
    match parse_args()? {
        CliAction::PrintHelp => {
            println!("{}", usage());
            Ok(())
        }
        CliAction::PrintVersion => {
            println!("sndevnet {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        CliAction::Request {
            data_dir,
            method,
            params,
        } => {
            let join = tokio::task::spawn_blocking(move || {
                request::send(&data_dir, &method, params)
            });
            let response = match join.await {
                Ok(result) => result.map_err(|err| err.to_string())?,
                Err(err) => return Err(format!("request task failed: {err}")),
            };
            let rendered =
                serde_json::to_string_pretty(&response).map_err(|err| err.to_string())?;
            println!("{rendered}");
            Ok(())
        }
        CliAction::Run(config) => run_with_config(*config).await,
    }
}

async fn run_with_config(config: Config) -> Result<(), String> {
    logging::init(config.log);
    let start_time = Instant::now();
    config.network.validate().map_err(|err| err.to_string())?;
    config.chain.validate().map_err(|err| err.to_string())?;
    let _lock = lock_data_dir(&config.network.data_dir)?;

    let supervisor = Arc::new(ProcessSupervisor::new());
    let guard = SupervisorGuard::new(Arc::clone(&supervisor));
    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
    spawn_signal_handler(Arc::clone(&supervisor), shutdown_tx);

    let mut params = devnet_params();
    params.contract = config.chain.contract.clone();
    let bring_up = {
        let supervisor = Arc::clone(&supervisor);
        tokio::task::spawn_blocking(move || -> Result<Network, DevnetError> {
            let chain = SecondaryChain::prepare(&config.chain, &supervisor)?;
            let network = Network::create(&config.network, params.clone(), Arc::clone(&supervisor))?;
            RegistrationWorkflow::new(&network).run()?;
            let contract = chain.rewards_contract(&params.contract, Arc::clone(&supervisor))?;
            CrossChainBridge::new(&network, &contract)?.run()?;
            Ok(network)
        })
    };
    let network = match bring_up.await {
        Ok(Ok(network)) => Arc::new(network),
        Ok(Err(err)) if err.is_interrupted() => {
            log_warn!("Bring-up interrupted");
            return Ok(());
        }
        Ok(Err(err)) => {
            log_error!("Bring-up failed: {err}");
            return Err(err.to_string());
        }
        Err(err) => return Err(format!("bring-up task failed: {err}")),
    };
    log_info!(
        "Devnet is ready after {:.1}s. Type 'reset' to prepare it for another round, Ctrl+C to stop.",
        start_time.elapsed().as_secs_f64()
    );

    let mut commands = spawn_stdin_reader();
    let mut stdin_open = true;
    loop {
        tokio::select! {
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    break;
                }
            }
            line = commands.recv(), if stdin_open => {
                let Some(line) = line else {
                    log_debug!("stdin closed; waiting for a signal");
                    stdin_open = false;
                    continue;
                };
                match line.trim() {
                    "" => {}
                    "reset" => reset_network(&network).await,
                    "quit" | "exit" => break,
                    other => log_warn!("Unknown command '{other}'; expected 'reset' or 'quit'"),
                }
            }
        }
    }

    drop(guard);
    log_info!("Devnet stopped");
    Ok(())
}

async fn reset_network(network: &Arc<Network>) {
    let network = Arc::clone(network);
    let join = tokio::task::spawn_blocking(move || network.attach());
    match join.await {
        Ok(Ok(())) => log_info!("Network ready for another round"),
        Ok(Err(err)) => log_error!("Reset failed: {err}"),
        Err(err) => log_error!("reset task failed: {err}"),
    }
}

fn spawn_signal_handler(supervisor: Arc<ProcessSupervisor>, shutdown_tx: watch::Sender<bool>) {
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            match signal(SignalKind::terminate()) {
                Ok(mut sigterm) => {
                    tokio::select! {
                        _ = tokio::signal::ctrl_c() => {},
                        _ = sigterm.recv() => {},
                    }
                }
                Err(err) => {
                    log_warn!("failed to install SIGTERM handler: {err}");
                    let _ = tokio::signal::ctrl_c().await;
                }
            }
        }
        #[cfg(not(unix))]
        {
            let _ = tokio::signal::ctrl_c().await;
        }

        log_info!("Signal received; stopping devnet processes");
        supervisor.cancel();
        supervisor.terminate_all();
        let _ = shutdown_tx.send(true);
    });
}

fn spawn_stdin_reader() -> mpsc::Receiver<String> {
    let (tx, rx) = mpsc::channel(8);
    let spawned = thread::Builder::new()
        .name("stdin".to_string())
        .spawn(move || {
            let stdin = std::io::stdin();
            for line in stdin.lock().lines() {
                let Ok(line) = line else {
                    break;
                };
                if tx.blocking_send(line).is_err() {
                    break;
                }
            }
        });
    if let Err(err) = spawned {
        log_warn!("failed to start stdin reader: {err}");
    }
    rx
}

fn parse_args() -> Result<CliAction, String> {
    parse_args_from(std::env::args().skip(1))
}

fn parse_value<T: std::str::FromStr>(flag: &str, value: &str) -> Result<T, String> {
    value
        .trim()
        .parse::<T>()
        .map_err(|_| format!("invalid value '{value}' for {flag}\n{}", usage()))
}

fn parse_args_from<I>(raw_args: I) -> Result<CliAction, String>
where
    I: IntoIterator<Item = String>,
{
    let mut network = NetworkConfig::default();
    let mut chain = ChainConfig::default();
    let mut log = logging::LogConfig::default();
    let mut conf_path: Option<PathBuf> = None;

    let mut bin_dir_set = false;
    let mut data_dir_set = false;
    let mut service_nodes_set = false;
    let mut nodes_set = false;
    let mut workers_set = false;
    let mut anvil_set = false;
    let mut contracts_dir_set = false;
    let mut log_level_set = false;
    let mut log_format_set = false;
    let mut log_timestamps_set = false;
    let mut rewards_set = false;
    let mut erc20_set = false;
    let mut pool_set = false;
    let mut eth_rpc_set = false;

    let mut args = raw_args.into_iter().peekable();
    match args.peek().map(String::as_str) {
        Some("help") => return Ok(CliAction::PrintHelp),
        Some("version") => return Ok(CliAction::PrintVersion),
        Some("request") => {
            args.next();
            return parse_request_args(args);
        }
        _ => {}
    }

    while let Some(arg) = args.next() {
        let mut value_for = |flag: &str| {
            args.next()
                .ok_or_else(|| format!("missing value for {flag}\n{}", usage()))
        };
        match arg.as_str() {
            "--help" | "-h" => return Ok(CliAction::PrintHelp),
            "--version" | "-V" => return Ok(CliAction::PrintVersion),
            "--oxen-bin-dir" => {
                network.bin_dir = PathBuf::from(value_for("--oxen-bin-dir")?);
                bin_dir_set = true;
            }
            "--anvil-path" => {
                chain.anvil_path = Some(PathBuf::from(value_for("--anvil-path")?));
                anvil_set = true;
            }
            "--eth-sn-contracts-dir" => {
                chain.contracts_dir = Some(PathBuf::from(value_for("--eth-sn-contracts-dir")?));
                contracts_dir_set = true;
            }
            "--data-dir" => {
                network.data_dir = PathBuf::from(value_for("--data-dir")?);
                data_dir_set = true;
            }
            "--conf" => {
                conf_path = Some(PathBuf::from(value_for("--conf")?));
            }
            "--service-nodes" => {
                network.service_nodes =
                    parse_value("--service-nodes", &value_for("--service-nodes")?)?;
                service_nodes_set = true;
            }
            "--nodes" => {
                network.nodes = parse_value("--nodes", &value_for("--nodes")?)?;
                nodes_set = true;
            }
            "--workers" => {
                network.workers = parse_value("--workers", &value_for("--workers")?)?;
                workers_set = true;
            }
            "--log-level" => {
                let value = value_for("--log-level")?;
                log.level = logging::Level::parse(&value)
                    .ok_or_else(|| format!("invalid log level '{value}'\n{}", usage()))?;
                log_level_set = true;
            }
            "--log-format" => {
                let value = value_for("--log-format")?;
                log.format = logging::Format::parse(&value)
                    .ok_or_else(|| format!("invalid log format '{value}'\n{}", usage()))?;
                log_format_set = true;
            }
            "--no-log-timestamps" => {
                log.timestamps = false;
                log_timestamps_set = true;
            }
            "--rewards-contract" => {
                chain.contract.rewards_contract = value_for("--rewards-contract")?;
                rewards_set = true;
            }
            "--erc20-contract" => {
                chain.contract.erc20_contract = value_for("--erc20-contract")?;
                erc20_set = true;
            }
            "--pool-contract" => {
                chain.contract.foundation_pool_contract = value_for("--pool-contract")?;
                pool_set = true;
            }
            "--eth-rpc" => {
                chain.contract.rpc_url = value_for("--eth-rpc")?;
                eth_rpc_set = true;
            }
            other => return Err(format!("unknown argument '{other}'\n{}", usage())),
        }
    }

    let conf_path_explicit = conf_path.is_some();
    let conf_path = conf_path.unwrap_or_else(|| PathBuf::from(DEFAULT_CONF_FILE));
    let conf = load_devnet_conf(&conf_path)?;
    if conf.is_none() && conf_path_explicit {
        return Err(format!("config file {} not found", conf_path.display()));
    }

    if let Some(conf) = conf.as_ref() {
        let last = |key: &str| conf.get(key).and_then(|values| values.last()).map(String::as_str);
        let conf_err = |key: &str, value: &str| {
            format!("invalid {key} '{value}' in {}", conf_path.display())
        };
        if !bin_dir_set {
            if let Some(value) = last("oxen-bin-dir") {
                network.bin_dir = PathBuf::from(value);
            }
        }
        if !data_dir_set {
            if let Some(value) = last("data-dir") {
                network.data_dir = PathBuf::from(value);
            }
        }
        if !anvil_set {
            if let Some(value) = last("anvil-path") {
                chain.anvil_path = Some(PathBuf::from(value));
            }
        }
        if !contracts_dir_set {
            if let Some(value) = last("eth-sn-contracts-dir") {
                chain.contracts_dir = Some(PathBuf::from(value));
            }
        }
        if !service_nodes_set {
            if let Some(value) = last("service-nodes") {
                network.service_nodes =
                    value.parse().map_err(|_| conf_err("service-nodes", value))?;
            }
        }
        if !nodes_set {
            if let Some(value) = last("nodes") {
                network.nodes = value.parse().map_err(|_| conf_err("nodes", value))?;
            }
        }
        if !workers_set {
            if let Some(value) = last("workers") {
                network.workers = value.parse().map_err(|_| conf_err("workers", value))?;
            }
        }
        if !log_level_set {
            if let Some(value) = last("log-level") {
                log.level = logging::Level::parse(value).ok_or_else(|| conf_err("log-level", value))?;
            }
        }
        if !log_format_set {
            if let Some(value) = last("log-format") {
                log.format =
                    logging::Format::parse(value).ok_or_else(|| conf_err("log-format", value))?;
            }
        }
        if !log_timestamps_set {
            if let Some(value) = last("log-timestamps") {
                log.timestamps =
                    parse_conf_bool(value).ok_or_else(|| conf_err("log-timestamps", value))?;
            }
        }
        if !rewards_set {
            if let Some(value) = last("rewards-contract") {
                chain.contract.rewards_contract = value.to_string();
            }
        }
        if !erc20_set {
            if let Some(value) = last("erc20-contract") {
                chain.contract.erc20_contract = value.to_string();
            }
        }
        if !pool_set {
            if let Some(value) = last("pool-contract") {
                chain.contract.foundation_pool_contract = value.to_string();
            }
        }
        if !eth_rpc_set {
            if let Some(value) = last("eth-rpc") {
                chain.contract.rpc_url = value.to_string();
            }
        }
    }

    if network.workers == 0 {
        return Err(format!("--workers must be at least 1\n{}", usage()));
    }

    Ok(CliAction::Run(Box::new(Config {
        network,
        chain,
        log,
        conf_path,
    })))
}

fn parse_request_args<I>(mut args: I) -> Result<CliAction, String>
where
    I: Iterator<Item = String>,
{
    let mut data_dir = NetworkConfig::default().data_dir;
    let mut positional: Vec<String> = Vec::new();
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--data-dir" => {
                data_dir = PathBuf::from(
                    args.next()
                        .ok_or_else(|| format!("missing value for --data-dir\n{}", usage()))?,
                );
            }
            "--help" | "-h" => return Ok(CliAction::PrintHelp),
            _ => positional.push(arg),
        }
    }
    if positional.len() > 2 {
        return Err(format!(
            "request takes at most a method and a JSON params value\n{}",
            usage()
        ));
    }
    let mut positional = positional.into_iter();
    let method = positional
        .next()
        .unwrap_or_else(|| request::DEFAULT_METHOD.to_string());
    let params = request::parse_params(positional.next().as_deref()).map_err(|err| err.to_string())?;
    Ok(CliAction::Request {
        data_dir,
        method,
        params,
    })
}

fn load_devnet_conf(path: &Path) -> Result<Option<HashMap<String, Vec<String>>>, String> {
    let contents = match fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(format!("failed to read {}: {err}", path.display())),
    };

    let mut out: HashMap<String, Vec<String>> = HashMap::new();
    for raw_line in contents.lines() {
        let mut line = raw_line.trim();
        if line.starts_with('#') || line.starts_with(';') {
            continue;
        }
        if let Some(idx) = line.find(['#', ';']) {
            line = &line[..idx];
        }
        line = line.trim();
        if line.is_empty() {
            continue;
        }
        let (key, value) = match line.split_once('=') {
            Some((key, value)) => (key.trim(), value.trim()),
            None => (line, "1"),
        };
        if key.is_empty() {
            continue;
        }
        out.entry(key.to_ascii_lowercase())
            .or_default()
            .push(value.to_string());
    }
    Ok(Some(out))
}

fn parse_conf_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "" | "1" | "true" | "yes" => Some(true),
        "0" | "false" | "no" => Some(false),
        _ => None,
    }
}

fn usage() -> String {
    [
        "Usage:",
        "  sndevnet [options]",
        "  sndevnet request [method] [json-params] [--data-dir <dir>]",
        "",
        "Commands:",
        "  help       Print this help and exit",
        "  version    Print version and exit",
        "  request    Send one JSON-RPC request to the devnet recorded in the data dir",
        "             (default method: bls_merkle_request)",
        "",
        "Options:",
        "  --help, -h  Print this help and exit",
        "  --version, -V  Print version and exit",
        "  --oxen-bin-dir <dir>  Directory holding oxend and oxen-wallet-rpc (default: ../../build/bin)",
        "  --anvil-path <path>  Start a local EVM node from this binary",
        "  --eth-sn-contracts-dir <dir>  Contracts checkout to deploy with `make deploy-local`",
        "                                (required with --anvil-path)",
        "  --data-dir <dir>  Data directory, wiped on start (default: testdata)",
        "  --conf <path>  Config file of key=value lines (default: ./sndevnet.conf if present)",
        "  --service-nodes <n>  Service nodes registered on the native chain (default: 12)",
        "  --nodes <n>  Plain nodes hosting wallets (default: 3)",
        "  --workers <n>  Parallel process start-up workers (default: 8)",
        "  --log-level <level>  error|warn|info|debug|trace (default: info)",
        "  --log-format <format>  text|json (default: text)",
        "  --no-log-timestamps  Omit timestamps from log lines",
        "  --rewards-contract <addr>  Rewards contract address",
        "  --erc20-contract <addr>  Reward token contract address",
        "  --pool-contract <addr>  Foundation pool contract address",
        "  --eth-rpc <url>  EVM JSON-RPC endpoint (default: http://127.0.0.1:8545)",
        "",
        "While running, type 'reset' to reuse the network for another round or 'quit' to stop.",
    ]
    .join("\n")
}
