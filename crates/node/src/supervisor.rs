//! Ownership of every child process spawned during a run.
//!
//! Children are kept in a table keyed by [`ProcessHandle`]. Termination takes
//! the child out of the table before killing it, so each process is killed
//! and reaped at most once no matter how many paths race to tear it down.

use std::collections::BTreeMap;
use std::fmt;
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use rand::Rng;

use crate::error::DevnetError;
use crate::poller::{Poller, Readiness, DEFAULT_READY_TIMEOUT};

pub const FIRST_PORT: u16 = 1100;

#[derive(Clone, Debug)]
pub struct ProcessSpec {
    pub label: String,
    pub program: PathBuf,
    pub args: Vec<String>,
    pub current_dir: Option<PathBuf>,
}

impl ProcessSpec {
    pub fn new(label: impl Into<String>, program: impl Into<PathBuf>) -> Self {
        Self {
            label: label.into(),
            program: program.into(),
            args: Vec::new(),
            current_dir: None,
        }
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct ProcessHandle(u64);

impl fmt::Display for ProcessHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

struct OwnedChild {
    label: String,
    child: Child,
}

pub struct ProcessSupervisor {
    children: Mutex<BTreeMap<ProcessHandle, OwnedChild>>,
    next_id: AtomicU64,
    cancelled: AtomicBool,
    ready_timeout: Duration,
}

impl Default for ProcessSupervisor {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessSupervisor {
    pub fn new() -> Self {
        Self {
            children: Mutex::new(BTreeMap::new()),
            next_id: AtomicU64::new(1),
            cancelled: AtomicBool::new(false),
            ready_timeout: DEFAULT_READY_TIMEOUT,
        }
    }

    pub fn with_ready_timeout(mut self, timeout: Duration) -> Self {
        self.ready_timeout = timeout;
        self
    }

    fn table(&self) -> MutexGuard<'_, BTreeMap<ProcessHandle, OwnedChild>> {
        // A panic while holding the lock must not stop teardown.
        self.children
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn spawn(&self, spec: &ProcessSpec) -> Result<ProcessHandle, DevnetError> {
        if self.is_cancelled() {
            return Err(DevnetError::Interrupted);
        }
        let mut command = Command::new(&spec.program);
        command
            .args(&spec.args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        if let Some(dir) = spec.current_dir.as_ref() {
            command.current_dir(dir);
        }
        let child = command.spawn().map_err(|err| {
            DevnetError::Process(format!(
                "failed to spawn {} ({}): {err}",
                spec.label,
                spec.program.display()
            ))
        })?;
        let handle = ProcessHandle(self.next_id.fetch_add(1, Ordering::Relaxed));
        log_debug!(
            "spawned {} pid {} as {handle}: {} {}",
            spec.label,
            child.id(),
            spec.program.display(),
            spec.args.join(" ")
        );
        self.table().insert(
            handle,
            OwnedChild {
                label: spec.label.clone(),
                child,
            },
        );
        // Teardown may have run between the check above and the insert.
        if self.is_cancelled() {
            self.terminate(handle);
            return Err(DevnetError::Interrupted);
        }
        Ok(handle)
    }

    pub fn label(&self, handle: ProcessHandle) -> Option<String> {
        self.table().get(&handle).map(|owned| owned.label.clone())
    }

    /// Whether the child is still owned and has not exited.
    pub fn is_running(&self, handle: ProcessHandle) -> bool {
        match self.table().get_mut(&handle) {
            Some(owned) => matches!(owned.child.try_wait(), Ok(None)),
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.table().len()
    }

    pub fn is_empty(&self) -> bool {
        self.table().is_empty()
    }

    /// Kills and reaps the child. Unknown handles, repeated calls, and
    /// children that already exited are all no-ops.
    pub fn terminate(&self, handle: ProcessHandle) {
        let owned = self.table().remove(&handle);
        if let Some(owned) = owned {
            stop_child(owned);
        }
    }

    /// Terminates every owned child. Returns how many were still owned.
    pub fn terminate_all(&self) -> usize {
        let drained = std::mem::take(&mut *self.table());
        let count = drained.len();
        for (_, owned) in drained.into_iter().rev() {
            stop_child(owned);
        }
        if count > 0 {
            log_info!("Terminated {count} devnet processes");
        }
        count
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    pub fn cancel_flag(&self) -> &AtomicBool {
        &self.cancelled
    }

    /// Poller bound to this supervisor's cancel flag.
    pub fn poller(&self, timeout: Duration) -> Poller<'_> {
        Poller::new(timeout).with_cancel(&self.cancelled)
    }

    /// Waits with the default readiness timeout. A child that exits while
    /// being waited on fails immediately.
    pub fn wait_ready<F, E>(&self, handle: ProcessHandle, mut check: F) -> Result<(), DevnetError>
    where
        F: FnMut() -> Result<Readiness, E>,
        E: fmt::Display,
    {
        let label = self
            .label(handle)
            .unwrap_or_else(|| format!("process {handle}"));
        let mut exited = false;
        let outcome = self.poller(self.ready_timeout).wait_for(&label, || {
            if !self.is_running(handle) {
                exited = true;
                return Ok(Readiness::Ready);
            }
            check().map_err(|err| err.to_string())
        });
        if exited {
            return Err(DevnetError::Process(format!(
                "{label} exited before becoming ready"
            )));
        }
        outcome.into_result(&label, self.ready_timeout)
    }
}

fn stop_child(mut owned: OwnedChild) {
    match owned.child.try_wait() {
        Ok(Some(status)) => {
            log_debug!("{} already exited ({status})", owned.label);
            return;
        }
        Ok(None) => {}
        Err(err) => log_debug!("{}: status check failed: {err}", owned.label),
    }
    if let Err(err) = owned.child.kill() {
        log_debug!("{}: kill failed: {err}", owned.label);
    }
    match owned.child.wait() {
        Ok(status) => log_debug!("{} stopped ({status})", owned.label),
        Err(err) => log_warn!("{}: failed to reap: {err}", owned.label),
    }
}

/// Terminates every child of the supervisor when dropped.
pub struct SupervisorGuard {
    supervisor: Arc<ProcessSupervisor>,
}

impl SupervisorGuard {
    pub fn new(supervisor: Arc<ProcessSupervisor>) -> Self {
        Self { supervisor }
    }

    pub fn supervisor(&self) -> &Arc<ProcessSupervisor> {
        &self.supervisor
    }
}

impl Drop for SupervisorGuard {
    fn drop(&mut self) {
        self.supervisor.cancel();
        self.supervisor.terminate_all();
    }
}

/// Hands out loopback listen addresses. Each process gets its own random
/// `127.x.y.z` address; ports increase monotonically across the run.
#[derive(Debug)]
pub struct PortAllocator {
    next: AtomicU16,
}

impl Default for PortAllocator {
    fn default() -> Self {
        Self::new(FIRST_PORT)
    }
}

impl PortAllocator {
    pub fn new(first: u16) -> Self {
        Self {
            next: AtomicU16::new(first),
        }
    }

    pub fn next_port(&self) -> u16 {
        self.next.fetch_add(1, Ordering::Relaxed)
    }

    pub fn random_loopback_ip(&self) -> Ipv4Addr {
        let mut rng = rand::thread_rng();
        Ipv4Addr::new(
            127,
            rng.gen_range(1..=254),
            rng.gen_range(1..=254),
            rng.gen_range(1..=254),
        )
    }
}
