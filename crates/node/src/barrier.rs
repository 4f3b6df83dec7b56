//! Height barrier across a set of nodes.

use std::time::Duration;

use crate::daemon::Node;
use crate::error::DevnetError;
use crate::poller::{Poller, Readiness};
use crate::rpc::RpcError;

pub const SYNC_TIMEOUT: Duration = Duration::from_secs(120);
pub const SYNC_INTERVAL: Duration = Duration::from_millis(100);

/// Blocks until every node reports at least `target`, defaulting to the
/// highest height any of them reports right now. Returns the target reached.
///
/// A node that is unreachable during that first scan contributes its cached
/// height and is polled like any other pending node afterwards.
///
/// Each tick re-queries only the node with the lowest known height; nodes
/// drop out of the pending set once they reach the target.
pub fn sync_nodes(
    nodes: &[&Node],
    target: Option<u64>,
    poller: Poller<'_>,
) -> Result<u64, DevnetError> {
    if nodes.is_empty() {
        return Ok(target.unwrap_or(0));
    }
    let target = match target {
        Some(target) => target,
        None => {
            let mut best = 0;
            for node in nodes {
                let height = match node.query_height() {
                    Ok(height) => height,
                    Err(err) if err.is_transient() => {
                        log_debug!("{} not answering yet: {err}", node.name());
                        node.cached_height()
                    }
                    Err(err) => return Err(err.into()),
                };
                best = best.max(height);
            }
            best
        }
    };
    // A node that just reached the target lets the next one be checked
    // without waiting out the interval.
    let poller = poller.with_interval(SYNC_INTERVAL, Duration::ZERO);
    let mut pending: Vec<&Node> = nodes.to_vec();
    let outcome = poller.wait_for("node sync", || -> Result<Readiness, RpcError> {
        let Some(slot) = lowest(&pending) else {
            return Ok(Readiness::Ready);
        };
        let height = pending[slot].query_height()?;
        if height < target {
            return Ok(Readiness::Pending);
        }
        pending.swap_remove(slot);
        Ok(if pending.is_empty() {
            Readiness::Ready
        } else {
            Readiness::Close
        })
    });
    match outcome.into_result("node sync", poller.timeout()) {
        Ok(()) => {
            log_debug!("{} nodes synced to height {target}", nodes.len());
            Ok(target)
        }
        Err(DevnetError::Timeout { .. }) => {
            let laggard = lowest(&pending).map_or(nodes[0], |slot| pending[slot]);
            Err(DevnetError::SyncTimeout {
                node: laggard.name().to_string(),
                height: laggard.cached_height(),
                target,
            })
        }
        Err(err) => Err(err),
    }
}

fn lowest(pending: &[&Node]) -> Option<usize> {
    pending
        .iter()
        .enumerate()
        .min_by_key(|(_, node)| node.cached_height())
        .map(|(slot, _)| slot)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::daemon::{
        BlsRegistrationArgs, DaemonApi, NodeEndpoint, NodeRole, RewardsResponse, ServiceKeys,
        ServiceNodeEntry, ServiceNodeState,
    };
    use sndevnet_consensus::Amount;
    use std::net::Ipv4Addr;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Arc;

    /// Height climbs by `step` on every query until it reaches `cap`. The
    /// first `failures` queries find the daemon unreachable.
    struct Climbing {
        height: AtomicU64,
        step: u64,
        cap: u64,
        failures: AtomicU64,
    }

    impl DaemonApi for Climbing {
        fn height(&self) -> Result<u64, RpcError> {
            if self
                .failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
                .is_ok()
            {
                return Err(RpcError::Unreachable("connection refused".to_string()));
            }
            let now = self.height.load(Ordering::SeqCst);
            let next = (now + self.step).min(self.cap);
            self.height.store(next, Ordering::SeqCst);
            Ok(now)
        }
        fn start_mining(&self, _: &str, _: u64) -> Result<(), RpcError> {
            Ok(())
        }
        fn mining_active(&self) -> Result<bool, RpcError> {
            Ok(false)
        }
        fn staking_requirement(&self) -> Result<Amount, RpcError> {
            Ok(0)
        }
        fn service_keys(&self) -> Result<ServiceKeys, RpcError> {
            Ok(ServiceKeys::default())
        }
        fn service_node_states(&self) -> Result<Vec<ServiceNodeEntry>, RpcError> {
            Ok(Vec::new())
        }
        fn service_node_status(&self) -> Result<Option<ServiceNodeState>, RpcError> {
            Ok(None)
        }
        fn registration_command(&self, _: &[String], _: Amount) -> Result<String, RpcError> {
            Ok(String::new())
        }
        fn storage_server_ping(&self, _: &str) -> Result<(), RpcError> {
            Ok(())
        }
        fn lokinet_ping(&self, _: &str) -> Result<(), RpcError> {
            Ok(())
        }
        fn trigger_uptime_proof(&self) -> Result<(), RpcError> {
            Ok(())
        }
        fn flush_txpool(&self) -> Result<String, RpcError> {
            Ok("OK".to_string())
        }
        fn bls_registration_args(&self, _: &str) -> Result<BlsRegistrationArgs, RpcError> {
            Err(RpcError::Unreachable("unused".to_string()))
        }
        fn bls_rewards(&self, _: &str) -> Result<RewardsResponse, RpcError> {
            Err(RpcError::Unreachable("unused".to_string()))
        }
    }

    fn node(name: &str, start: u64, step: u64, cap: u64) -> Node {
        flaky_node(name, start, step, cap, 0)
    }

    fn flaky_node(name: &str, start: u64, step: u64, cap: u64, failures: u64) -> Node {
        Node::new(
            name,
            NodeRole::Plain,
            NodeEndpoint {
                ip: Ipv4Addr::LOCALHOST,
                p2p_port: 1,
                rpc_port: 2,
                qnet_port: 3,
                storage_port: 4,
            },
            Arc::new(Climbing {
                height: AtomicU64::new(start),
                step,
                cap,
                failures: AtomicU64::new(failures),
            }),
        )
    }

    #[test]
    fn waits_for_the_slowest_node() {
        let a = node("a", 10, 0, 10);
        let b = node("b", 7, 1, 100);
        let reached = sync_nodes(&[&a, &b], None, Poller::new(Duration::from_secs(5))).unwrap();
        assert_eq!(reached, 10);
        assert!(b.cached_height() >= 10);
    }

    #[test]
    fn unreachable_node_does_not_fail_the_default_target() {
        let a = node("a", 10, 0, 10);
        let b = flaky_node("b", 7, 1, 100, 2);
        let reached = sync_nodes(&[&b, &a], None, Poller::new(Duration::from_secs(5))).unwrap();
        assert_eq!(reached, 10);
        assert!(b.cached_height() >= 10);
    }

    #[test]
    fn stuck_node_is_named_in_timeout() {
        let a = node("a", 12, 0, 12);
        let stuck = node("stuck", 3, 0, 3);
        let err = sync_nodes(
            &[&a, &stuck],
            Some(12),
            Poller::new(Duration::from_millis(250)),
        )
        .unwrap_err();
        match err {
            DevnetError::SyncTimeout {
                node,
                height,
                target,
            } => {
                assert_eq!(node, "stuck");
                assert_eq!(height, 3);
                assert_eq!(target, 12);
            }
            other => panic!("unexpected error {other}"),
        }
    }

    #[test]
    fn empty_set_is_trivially_synced() {
        assert_eq!(
            sync_nodes(&[], Some(4), Poller::new(Duration::ZERO)).unwrap(),
            4
        );
    }
}
