//! Deterministic peer graph.
//!
//! Node `i` peers with `(i + s) mod n` for each stride `s`. With prime strides
//! every node gets a handful of peers and the graph stays connected without
//! a full mesh.

pub const PEER_STRIDES: [usize; 5] = [2, 3, 5, 7, 11];

pub fn peer_graph(node_count: usize) -> Vec<Vec<usize>> {
    (0..node_count)
        .map(|index| peers_of(index, node_count))
        .collect()
}

pub fn peers_of(index: usize, node_count: usize) -> Vec<usize> {
    let mut peers = Vec::with_capacity(PEER_STRIDES.len());
    if node_count == 0 {
        return peers;
    }
    for stride in PEER_STRIDES {
        let peer = (index + stride) % node_count;
        if peer != index && !peers.contains(&peer) {
            peers.push(peer);
        }
    }
    peers
}

/// `--add-exclusive-node=ip:port` arguments for a node's peers.
pub fn exclusive_node_args<'a, I>(peer_addrs: I) -> Vec<String>
where
    I: IntoIterator<Item = &'a str>,
{
    peer_addrs
        .into_iter()
        .map(|addr| format!("--add-exclusive-node={addr}"))
        .collect()
}
