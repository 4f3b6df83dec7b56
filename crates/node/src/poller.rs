//! Fixed-interval retry combinator.
//!
//! A check is called until it reports [`Readiness::Ready`], the deadline
//! passes, or the shared cancel flag is raised. Check errors count as "not
//! ready yet" and are only logged at trace level.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use crate::error::DevnetError;

pub const DEFAULT_INTERVAL: Duration = Duration::from_millis(250);
pub const CLOSE_INTERVAL: Duration = Duration::from_millis(50);
pub const DEFAULT_READY_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Readiness {
    Ready,
    /// Not ready, but expected to be shortly; polls at the tighter interval.
    Close,
    Pending,
}

impl From<bool> for Readiness {
    fn from(ready: bool) -> Self {
        if ready {
            Readiness::Ready
        } else {
            Readiness::Pending
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PollOutcome {
    Ready,
    TimedOut,
    Cancelled,
}

impl PollOutcome {
    pub fn into_result(self, what: &str, timeout: Duration) -> Result<(), DevnetError> {
        match self {
            PollOutcome::Ready => Ok(()),
            PollOutcome::TimedOut => Err(DevnetError::Timeout {
                what: what.to_string(),
                after: timeout,
            }),
            PollOutcome::Cancelled => Err(DevnetError::Interrupted),
        }
    }
}

#[derive(Clone, Copy, Debug)]
pub struct Poller<'a> {
    timeout: Duration,
    interval: Duration,
    close_interval: Duration,
    cancel: Option<&'a AtomicBool>,
}

impl<'a> Poller<'a> {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            interval: DEFAULT_INTERVAL,
            close_interval: CLOSE_INTERVAL,
            cancel: None,
        }
    }

    pub fn with_interval(mut self, interval: Duration, close_interval: Duration) -> Self {
        self.interval = interval;
        self.close_interval = close_interval;
        self
    }

    pub fn with_cancel(mut self, cancel: &'a AtomicBool) -> Self {
        self.cancel = Some(cancel);
        self
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    fn cancelled(&self) -> bool {
        self.cancel
            .is_some_and(|flag| flag.load(Ordering::SeqCst))
    }

    /// Runs `check` until it is ready. The check is always attempted at least
    /// once, even with a zero timeout.
    pub fn wait_for<F, E>(&self, what: &str, mut check: F) -> PollOutcome
    where
        F: FnMut() -> Result<Readiness, E>,
        E: fmt::Display,
    {
        let deadline = Instant::now() + self.timeout;
        loop {
            if self.cancelled() {
                return PollOutcome::Cancelled;
            }
            let pause = match check() {
                Ok(Readiness::Ready) => return PollOutcome::Ready,
                Ok(Readiness::Close) => self.close_interval,
                Ok(Readiness::Pending) => self.interval,
                Err(err) => {
                    log_trace!("{what}: not ready ({err})");
                    self.interval
                }
            };
            let now = Instant::now();
            if now >= deadline {
                return PollOutcome::TimedOut;
            }
            thread::sleep(pause.min(deadline - now));
        }
    }

    /// [`Poller::wait_for`] for plain boolean checks.
    pub fn wait_until<F, E>(&self, what: &str, mut check: F) -> PollOutcome
    where
        F: FnMut() -> Result<bool, E>,
        E: fmt::Display,
    {
        self.wait_for(what, || check().map(Readiness::from))
    }

    /// Waits and converts a non-ready outcome into a [`DevnetError`].
    pub fn require<F, E>(&self, what: &str, check: F) -> Result<(), DevnetError>
    where
        F: FnMut() -> Result<Readiness, E>,
        E: fmt::Display,
    {
        self.wait_for(what, check).into_result(what, self.timeout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errors_are_swallowed_until_ready() {
        let mut attempts = 0;
        let outcome = Poller::new(Duration::from_secs(5))
            .with_interval(Duration::from_millis(1), Duration::from_millis(1))
            .wait_for("flaky", || {
                attempts += 1;
                if attempts < 3 {
                    Err("connection refused")
                } else {
                    Ok(Readiness::Ready)
                }
            });
        assert_eq!(outcome, PollOutcome::Ready);
        assert_eq!(attempts, 3);
    }

    #[test]
    fn zero_timeout_still_checks_once() {
        let mut attempts = 0;
        let outcome = Poller::new(Duration::ZERO).wait_until("never", || {
            attempts += 1;
            Ok::<_, String>(false)
        });
        assert_eq!(outcome, PollOutcome::TimedOut);
        assert_eq!(attempts, 1);
    }

    #[test]
    fn timeout_maps_to_error() {
        let poller = Poller::new(Duration::from_millis(20))
            .with_interval(Duration::from_millis(5), Duration::from_millis(5));
        let err = poller
            .require("rpc on 127.0.0.1:1100", || Ok::<_, String>(Readiness::Pending))
            .unwrap_err();
        assert!(matches!(err, DevnetError::Timeout { .. }));
        assert!(err.to_string().contains("rpc on 127.0.0.1:1100"));
    }

    #[test]
    fn cancel_flag_stops_polling() {
        let flag = AtomicBool::new(false);
        let mut attempts = 0;
        let outcome = Poller::new(Duration::from_secs(30))
            .with_interval(Duration::from_millis(1), Duration::from_millis(1))
            .with_cancel(&flag)
            .wait_until("mining", || {
                attempts += 1;
                if attempts == 2 {
                    flag.store(true, Ordering::SeqCst);
                }
                Ok::<_, String>(false)
            });
        assert_eq!(outcome, PollOutcome::Cancelled);
        assert_eq!(attempts, 2);
        assert!(matches!(
            outcome.into_result("mining", Duration::ZERO),
            Err(DevnetError::Interrupted)
        ));
    }

    #[test]
    fn close_uses_the_tight_interval() {
        let mut attempts = 0;
        let started = Instant::now();
        let outcome = Poller::new(Duration::from_secs(5))
            .with_interval(Duration::from_secs(2), Duration::from_millis(1))
            .wait_for("close", || {
                attempts += 1;
                Ok::<_, String>(if attempts < 4 {
                    Readiness::Close
                } else {
                    Readiness::Ready
                })
            });
        assert_eq!(outcome, PollOutcome::Ready);
        assert!(started.elapsed() < Duration::from_secs(1));
    }
}
