//! Node mapper (design 4.7), grounded on `ldn_node_mapper.cpp`'s
//! `LdnNodeMapper`: the fixed eight-slot entry array, the unassigned-local-id
//! sentinel (`0xFF`), the atomic `UpdateFromNetworkInfo` replace, and the
//! `ShouldRouteToNode` predicate are carried over directly.

use std::sync::Mutex;

use ryu_protocol::node::{BROADCAST_NODE_ID, MAX_NODES, VirtualIpv4};

/// Sentinel meaning "no local node id has been assigned yet".
pub const LOCAL_NODE_UNASSIGNED: u8 = 0xFF;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeEntry {
    pub node_id: u8,
    pub ipv4: VirtualIpv4,
    pub connected: bool,
}

struct Inner {
    local_node_id: u8,
    nodes: [NodeEntry; MAX_NODES as usize],
}

impl Inner {
    fn fresh() -> Self {
        let nodes = std::array::from_fn(|i| NodeEntry {
            node_id: i as u8,
            ipv4: VirtualIpv4(0),
            connected: false,
        });
        Self { local_node_id: LOCAL_NODE_UNASSIGNED, nodes }
    }
}

/// Maps node ids to virtual IPv4 addresses and connectedness, and answers
/// the routing predicate every proxy frame is checked against.
pub struct NodeMapper {
    inner: Mutex<Inner>,
}

impl NodeMapper {
    pub fn new() -> Self {
        Self { inner: Mutex::new(Inner::fresh()) }
    }

    pub fn set_local_node_id(&self, node_id: u8) {
        self.inner.lock().unwrap().local_node_id = node_id;
    }

    pub fn local_node_id(&self) -> u8 {
        self.inner.lock().unwrap().local_node_id
    }

    pub fn add_node(&self, node_id: u8, ipv4: VirtualIpv4) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(entry) = (node_id < MAX_NODES).then(|| &mut inner.nodes[node_id as usize]) {
            entry.ipv4 = ipv4;
            entry.connected = true;
        }
    }

    pub fn remove_node(&self, node_id: u8) {
        let mut inner = self.inner.lock().unwrap();
        if node_id < MAX_NODES {
            inner.nodes[node_id as usize].connected = false;
        }
    }

    pub fn is_node_connected(&self, node_id: u8) -> bool {
        let inner = self.inner.lock().unwrap();
        node_id < MAX_NODES && inner.nodes[node_id as usize].connected
    }

    pub fn node_ip(&self, node_id: u8) -> Option<VirtualIpv4> {
        let inner = self.inner.lock().unwrap();
        (node_id < MAX_NODES && inner.nodes[node_id as usize].connected)
            .then(|| inner.nodes[node_id as usize].ipv4)
    }

    pub fn connected_count(&self) -> usize {
        self.inner.lock().unwrap().nodes.iter().filter(|n| n.connected).count()
    }

    /// Resets every slot and the local node id sentinel.
    pub fn clear(&self) {
        *self.inner.lock().unwrap() = Inner::fresh();
    }

    /// Replaces every entry from `snapshot` under a single lock acquisition
    /// so `should_route` never observes a partial update (design 4.7 and
    /// §5's ordering guarantee).
    pub fn update_from_network_info(&self, snapshot: &[NodeEntry]) {
        let mut inner = self.inner.lock().unwrap();
        for entry in inner.nodes.iter_mut() {
            entry.connected = false;
        }
        for incoming in snapshot {
            if incoming.connected && incoming.node_id < MAX_NODES {
                inner.nodes[incoming.node_id as usize] = *incoming;
            }
        }
    }

    /// `should_route(dest, source, target)`:
    /// - `target` not connected → false
    /// - `dest == broadcast` → `target != source`
    /// - else → `dest == target`
    pub fn should_route(&self, dest: u32, source: u32, target: u8) -> bool {
        if target >= MAX_NODES {
            return false;
        }
        if !self.is_node_connected(target) {
            return false;
        }
        if dest == BROADCAST_NODE_ID {
            return u32::from(target) != source;
        }
        dest == u32::from(target)
    }
}

impl Default for NodeMapper {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn should_route_rejects_disconnected_target_for_any_dest_or_source() {
        let mapper = NodeMapper::new();
        assert!(!mapper.should_route(BROADCAST_NODE_ID, 1, 0));
        assert!(!mapper.should_route(0, 1, 0));
    }

    #[test]
    fn broadcast_reaches_every_connected_node_except_source_exactly_once() {
        let mapper = NodeMapper::new();
        mapper.add_node(0, VirtualIpv4::for_node(0));
        mapper.add_node(1, VirtualIpv4::for_node(1));
        mapper.add_node(2, VirtualIpv4::for_node(2));

        let source = 1u32;
        let routed: Vec<u8> = (0..MAX_NODES)
            .filter(|&target| mapper.should_route(BROADCAST_NODE_ID, source, target))
            .collect();
        assert_eq!(routed, vec![0, 2]);
    }

    #[test]
    fn unicast_only_routes_to_exact_match() {
        let mapper = NodeMapper::new();
        mapper.add_node(0, VirtualIpv4::for_node(0));
        mapper.add_node(1, VirtualIpv4::for_node(1));
        assert!(mapper.should_route(1, 0, 1));
        assert!(!mapper.should_route(1, 0, 0));
    }

    #[test]
    fn update_from_network_info_replaces_all_entries_atomically() {
        let mapper = NodeMapper::new();
        mapper.add_node(3, VirtualIpv4::for_node(3));
        assert!(mapper.is_node_connected(3));

        let snapshot = vec![
            NodeEntry { node_id: 0, ipv4: VirtualIpv4::for_node(0), connected: true },
            NodeEntry { node_id: 1, ipv4: VirtualIpv4::for_node(1), connected: true },
        ];
        mapper.update_from_network_info(&snapshot);
        assert!(!mapper.is_node_connected(3));
        assert!(mapper.is_node_connected(0));
        assert!(mapper.is_node_connected(1));
        assert_eq!(mapper.connected_count(), 2);
    }

    #[test]
    fn clear_resets_local_node_id_sentinel() {
        let mapper = NodeMapper::new();
        mapper.set_local_node_id(0);
        mapper.clear();
        assert_eq!(mapper.local_node_id(), LOCAL_NODE_UNASSIGNED);
    }
}
