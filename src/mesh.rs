//! Server side of the topology: hands out node slots and tells every node
//! where its peers are.

use std::net::SocketAddr;

use tracing::{debug, warn};

use crate::config::TopologyConfig;
use crate::error::RudpError;
use crate::link::NodeId;
use crate::processor::PacketParser;
use crate::protocol::{MeshMessage, NodeRequest, CONTROL_HEADER_SIZE, UPDATE_SLOT_SIZE};
use crate::stats::LinkState;
use crate::topology::Topology;

/// Slot ids travel as a single byte
pub const MAX_MESH_NODES: usize = 255;

#[derive(Debug)]
pub struct Mesh {
    topology: Topology,
    max_nodes: usize,
    send_accumulator: f32,
    timed_out: Vec<NodeId>,
}

impl Mesh {
    pub fn new(config: TopologyConfig, max_nodes: usize) -> Result<Self, RudpError> {
        config.validate()?;
        if !(1..=MAX_MESH_NODES).contains(&max_nodes) {
            return Err(RudpError::Config {
                message: format!("mesh supports 1 to {} nodes, got {}", MAX_MESH_NODES, max_nodes),
            });
        }
        let update_size = CONTROL_HEADER_SIZE + UPDATE_SLOT_SIZE * max_nodes;
        if update_size > config.max_packet_size {
            return Err(RudpError::Config {
                message: format!(
                    "max packet size {} can't hold an update for {} nodes ({} bytes)",
                    config.max_packet_size, max_nodes, update_size
                ),
            });
        }

        let mut topology = Topology::new("mesh", config);
        topology.reserve(max_nodes);
        Ok(Self {
            topology,
            max_nodes,
            send_accumulator: 0.0,
            timed_out: Vec::new(),
        })
    }

    pub async fn start(&mut self, bind_addr: SocketAddr) -> Result<(), RudpError> {
        self.topology.start(bind_addr).await
    }

    pub fn stop(&mut self) {
        self.topology.stop();
        self.clear_data();
    }

    pub fn is_running(&self) -> bool {
        self.topology.is_running()
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.topology.local_addr()
    }

    pub fn max_nodes(&self) -> usize {
        self.max_nodes
    }

    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    /// Number of slots currently connecting or connected
    pub fn num_active_nodes(&self) -> usize {
        self.topology
            .links()
            .iter()
            .filter(|link| link.current_state != LinkState::Disconnected)
            .count()
    }

    /// Slots freed by timeouts since the last call
    pub fn drain_timed_out(&mut self) -> Vec<NodeId> {
        std::mem::take(&mut self.timed_out)
    }

    /// Links, then inbound control traffic, then timeouts, then outbound updates.
    pub async fn update(&mut self, delta_time: f32) -> Result<(), RudpError> {
        if !self.is_running() {
            return Ok(());
        }
        self.topology.update_links(delta_time)?;
        self.receive_packets().await?;
        self.check_for_timeouts(delta_time);
        self.send_packets(delta_time).await;
        Ok(())
    }

    fn find_first_unreserved(&self) -> Option<NodeId> {
        self.topology
            .links()
            .iter()
            .position(|link| link.current_state == LinkState::Disconnected)
    }

    async fn receive_packets(&mut self) -> Result<(), RudpError> {
        while let Some(packet) = self.topology.receive_packet().await? {
            if let Some(node_id) = self.topology.node_id_from_address(&packet.from) {
                if let Some(link) = self.topology.link_mut(node_id) {
                    let payload_len = packet.payload.len();
                    Topology::acknowledge(&mut link.reliability, &packet.header, payload_len)?;
                }
            }
            if !self.parse_packet(packet.from, &packet.payload) {
                warn!(from = %packet.from, "mesh ignored unrecognized packet");
            }
        }
        Ok(())
    }

    fn check_for_timeouts(&mut self, delta_time: f32) {
        let timeout = self.topology.config().timeout;
        for node_id in 0..self.topology.num_links() {
            let Some(link) = self.topology.link_mut(node_id) else {
                continue;
            };
            if link.current_state == LinkState::Disconnected {
                continue;
            }
            link.timeout_accumulator += delta_time;
            if link.timeout_accumulator > timeout {
                debug!(node_id, "mesh timed out node");
                self.topology.release(node_id);
                self.timed_out.push(node_id);
            }
        }
    }

    fn update_message(&self) -> MeshMessage {
        let slots = self
            .topology
            .links()
            .iter()
            .map(|link| match link.address {
                Some(SocketAddr::V4(address)) => Some(address),
                _ => None,
            })
            .collect();
        MeshMessage::Update { slots }
    }

    async fn send_packets(&mut self, delta_time: f32) {
        let protocol_id = self.topology.config().protocol_id;
        let send_interval = self.topology.config().send_interval;

        self.send_accumulator += delta_time;
        while self.send_accumulator > send_interval {
            let update = self.update_message().serialize(protocol_id);
            for node_id in 0..self.topology.num_links() {
                let packet = match self.topology.node_state(node_id) {
                    LinkState::Connecting => MeshMessage::ConnectionAccepted {
                        node_id: node_id as u8,
                        num_nodes: self.topology.num_links() as u8,
                    }
                    .serialize(protocol_id),
                    LinkState::Connected => update.clone(),
                    LinkState::Disconnected => continue,
                };
                if let Err(e) = self.topology.send_to_node(node_id, &packet).await {
                    warn!(node_id, error = %e, "mesh failed to send control packet");
                }
            }
            self.send_accumulator -= send_interval;
        }
    }

    fn clear_data(&mut self) {
        self.topology.clear();
        self.topology.reserve(self.max_nodes);
        self.send_accumulator = 0.0;
        self.timed_out.clear();
    }
}

impl PacketParser for Mesh {
    fn parse_packet(&mut self, sender: SocketAddr, data: &[u8]) -> bool {
        let protocol_id = self.topology.config().protocol_id;
        let Some(request) = NodeRequest::parse(data, protocol_id) else {
            return false;
        };

        match request {
            NodeRequest::ConnectRequest => {
                if let Some(node_id) = self.topology.node_id_from_address(&sender) {
                    if let Some(link) = self.topology.link_mut(node_id) {
                        if link.current_state == LinkState::Connecting {
                            link.timeout_accumulator = 0.0;
                        }
                    }
                } else if !sender.is_ipv4() {
                    warn!(%sender, "mesh only accepts IPv4 nodes");
                } else if let Some(free_slot) = self.find_first_unreserved() {
                    debug!(%sender, node_id = free_slot, "mesh reserves node");
                    if let Err(e) = self.topology.assign(free_slot, sender, LinkState::Connecting) {
                        warn!(error = %e, "mesh failed to reserve slot");
                    }
                } else {
                    debug!(%sender, "mesh is full");
                }
            }
            NodeRequest::KeepAlive => {
                if let Some(node_id) = self.topology.node_id_from_address(&sender) {
                    if let Some(link) = self.topology.link_mut(node_id) {
                        if link.current_state == LinkState::Connecting {
                            link.current_state = LinkState::Connected;
                            debug!(node_id, "mesh completes connection of node");
                        }
                        link.timeout_accumulator = 0.0;
                    }
                }
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::{assert_err, assert_ok};

    const PROTOCOL_ID: u32 = 0x4d45_5348;

    fn mesh(max_nodes: usize) -> Mesh {
        let config = TopologyConfig {
            timeout: 2.0,
            ..TopologyConfig::default().with_protocol_id(PROTOCOL_ID)
        };
        Mesh::new(config, max_nodes).unwrap()
    }

    fn node(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    fn connect_request() -> Vec<u8> {
        NodeRequest::ConnectRequest.serialize(PROTOCOL_ID)
    }

    fn keep_alive() -> Vec<u8> {
        NodeRequest::KeepAlive.serialize(PROTOCOL_ID)
    }

    #[test]
    fn test_rejects_bad_node_counts() {
        assert_err!(Mesh::new(TopologyConfig::default(), 0));
        assert_err!(Mesh::new(TopologyConfig::default(), 256));
        // 255 slots need a 1535 byte update
        assert_err!(Mesh::new(TopologyConfig::default(), 255));
        let config = TopologyConfig { max_packet_size: 1600, ..TopologyConfig::default() };
        assert_ok!(Mesh::new(config, 255));
    }

    #[test]
    fn test_connect_request_reserves_first_free_slot() {
        let mut mesh = mesh(2);
        assert!(mesh.parse_packet(node(1000), &connect_request()));
        assert!(mesh.parse_packet(node(1001), &connect_request()));
        assert_eq!(mesh.topology().node_id_from_address(&node(1000)), Some(0));
        assert_eq!(mesh.topology().node_id_from_address(&node(1001)), Some(1));
        assert_eq!(mesh.num_active_nodes(), 2);

        // full
        assert!(mesh.parse_packet(node(1002), &connect_request()));
        assert_eq!(mesh.topology().node_id_from_address(&node(1002)), None);
    }

    #[test]
    fn test_keep_alive_completes_connection() {
        let mut mesh = mesh(2);
        mesh.parse_packet(node(1000), &connect_request());
        assert_eq!(mesh.topology().node_state(0), LinkState::Connecting);
        mesh.parse_packet(node(1000), &keep_alive());
        assert_eq!(mesh.topology().node_state(0), LinkState::Connected);
    }

    #[test]
    fn test_ipv6_sender_is_ignored() {
        let mut mesh = mesh(2);
        let sender: SocketAddr = "[::1]:1000".parse().unwrap();
        assert!(mesh.parse_packet(sender, &connect_request()));
        assert_eq!(mesh.num_active_nodes(), 0);
    }

    #[test]
    fn test_foreign_packets_are_not_parsed() {
        let mut mesh = mesh(2);
        assert!(!mesh.parse_packet(node(1000), &NodeRequest::ConnectRequest.serialize(1)));
        assert!(!mesh.parse_packet(node(1000), &[0x4d, 0x45, 0x53, 0x48, 7]));
        assert_eq!(mesh.num_active_nodes(), 0);
    }

    #[test]
    fn test_silent_nodes_time_out() {
        let mut mesh = mesh(2);
        mesh.parse_packet(node(1000), &connect_request());
        mesh.parse_packet(node(1001), &connect_request());
        mesh.parse_packet(node(1001), &keep_alive());

        for _ in 0..15 {
            mesh.check_for_timeouts(0.1);
        }
        // the keep-alive resets node 1's clock
        mesh.parse_packet(node(1001), &keep_alive());
        for _ in 0..6 {
            mesh.check_for_timeouts(0.1);
        }

        assert_eq!(mesh.topology().node_state(0), LinkState::Disconnected);
        assert_eq!(mesh.topology().node_state(1), LinkState::Connected);
        assert_eq!(mesh.drain_timed_out(), vec![0]);
        assert!(mesh.drain_timed_out().is_empty());

        // the freed slot is handed out again
        mesh.parse_packet(node(1002), &connect_request());
        assert_eq!(mesh.topology().node_id_from_address(&node(1002)), Some(0));
    }

    #[test]
    fn test_update_message_lists_every_slot() {
        let mut mesh = mesh(3);
        mesh.parse_packet(node(1000), &connect_request());
        mesh.parse_packet(node(1002), &connect_request());
        match mesh.update_message() {
            MeshMessage::Update { slots } => {
                assert_eq!(slots.len(), 3);
                assert_eq!(slots[0].map(|a| a.port()), Some(1000));
                assert_eq!(slots[1].map(|a| a.port()), Some(1002));
                assert_eq!(slots[2], None);
            }
            other => panic!("unexpected message {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_update_without_socket_is_a_no_op() {
        let mut mesh = mesh(2);
        assert_ok!(mesh.update(1.0).await);
        assert!(!mesh.is_running());
    }

    #[tokio::test]
    async fn test_stop_clears_slots() {
        let mut mesh = mesh(2);
        assert_ok!(mesh.start(node(0)).await);
        mesh.parse_packet(node(1000), &connect_request());
        mesh.stop();
        assert!(!mesh.is_running());
        assert_eq!(mesh.num_active_nodes(), 0);
        assert_eq!(mesh.topology().num_links(), 2);
    }
}
