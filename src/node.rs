//! Client side of the topology: joins a mesh, keeps one link per peer node
//! and moves application traffic over those links.

use std::collections::VecDeque;
use std::net::SocketAddr;

use tracing::{debug, trace, warn};

use crate::config::TopologyConfig;
use crate::error::RudpError;
use crate::link::NodeId;
use crate::processor::PacketParser;
use crate::protocol::{Channel, MeshMessage, NodeRequest, CHANNEL_TAG_SIZE};
use crate::reliability::ReliabilitySystem;
use crate::stats::LinkStats;
use crate::topology::Topology;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NodeState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    /// The mesh never answered
    ConnectFail,
}

pub struct Node {
    topology: Topology,
    state: NodeState,
    previous_state: NodeState,
    mesh_address: Option<SocketAddr>,
    mesh_reliability: ReliabilitySystem,
    local_node_id: Option<NodeId>,
    send_accumulator: f32,
    timeout_accumulator: f32,
    received: VecDeque<(NodeId, Vec<u8>)>,
}

impl Node {
    pub fn new(config: TopologyConfig) -> Result<Self, RudpError> {
        config.validate()?;
        let mesh_reliability = ReliabilitySystem::new(config.max_sequence);
        Ok(Self {
            topology: Topology::new("node", config),
            state: NodeState::Disconnected,
            previous_state: NodeState::Disconnected,
            mesh_address: None,
            mesh_reliability,
            local_node_id: None,
            send_accumulator: 0.0,
            timeout_accumulator: 0.0,
            received: VecDeque::new(),
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

    /// Starts (or restarts) joining the mesh at `mesh_address`
    pub fn connect(&mut self, mesh_address: SocketAddr) {
        debug!(%mesh_address, "node connecting");
        self.clear_data();
        self.state = NodeState::Connecting;
        self.mesh_address = Some(mesh_address);
    }

    pub fn state(&self) -> NodeState {
        self.state
    }

    pub fn previous_state(&self) -> NodeState {
        self.previous_state
    }

    pub fn is_connected(&self) -> bool {
        self.state == NodeState::Connected
    }

    pub fn just_connected(&self) -> bool {
        self.state == NodeState::Connected && self.previous_state != NodeState::Connected
    }

    pub fn just_disconnected(&self) -> bool {
        self.state != NodeState::Connected && self.previous_state == NodeState::Connected
    }

    pub fn local_node_id(&self) -> Option<NodeId> {
        self.local_node_id
    }

    pub fn mesh_address(&self) -> Option<SocketAddr> {
        self.mesh_address
    }

    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    /// Number of slots the mesh told this node about
    pub fn num_nodes(&self) -> usize {
        self.topology.num_links()
    }

    pub fn is_node_connected(&self, node_id: NodeId) -> bool {
        self.topology.is_node_connected(node_id)
    }

    pub fn node_just_connected(&self, node_id: NodeId) -> bool {
        self.topology.node_just_connected(node_id)
    }

    pub fn node_just_disconnected(&self, node_id: NodeId) -> bool {
        self.topology.node_just_disconnected(node_id)
    }

    pub fn node_address(&self, node_id: NodeId) -> Option<SocketAddr> {
        self.topology.node_address(node_id)
    }

    pub fn disconnect_node(&mut self, node_id: NodeId) {
        self.topology.disconnect_node(node_id);
    }

    pub fn stats(&self, node_id: NodeId) -> Option<LinkStats> {
        self.topology.link(node_id).map(|link| link.stats())
    }

    /// Sends `data` to a peer once, with no delivery guarantee
    pub async fn send_packet(&mut self, node_id: NodeId, data: &[u8]) -> Result<(), RudpError> {
        self.check_peer(node_id)?;
        self.topology
            .send_to_node(node_id, &Channel::Unreliable.frame(data))
            .await
    }

    /// Queues `payload` for exactly-once, in-order delivery to a peer
    pub fn send_guaranteed(&mut self, node_id: NodeId, payload: &[u8]) -> Result<(), RudpError> {
        self.check_peer(node_id)?;
        let max = self.topology.config().max_guaranteed_payload_size();
        if payload.len() > max {
            return Err(RudpError::BufferTooLarge { size: payload.len(), max });
        }
        let link = self
            .topology
            .link_mut(node_id)
            .ok_or(RudpError::InvalidNode { node_id })?;
        link.guaranteed.queue_outgoing(payload);
        Ok(())
    }

    /// Next unreliable payload from any peer
    pub fn receive_packet(&mut self) -> Option<(NodeId, Vec<u8>)> {
        self.received.pop_front()
    }

    /// Next in-order guaranteed payload from `node_id`
    pub fn receive_guaranteed(&mut self, node_id: NodeId) -> Option<Vec<u8>> {
        self.topology
            .link_mut(node_id)
            .and_then(|link| link.guaranteed.dequeue_deliverable())
    }

    fn check_peer(&self, node_id: NodeId) -> Result<(), RudpError> {
        if !self.is_running() {
            return Err(RudpError::NotRunning);
        }
        if !self.topology.is_node_connected(node_id) {
            return Err(RudpError::InvalidNode { node_id });
        }
        Ok(())
    }

    pub async fn update(&mut self, delta_time: f32) -> Result<(), RudpError> {
        self.previous_state = self.state;

        if !self.is_running() {
            self.state = NodeState::Disconnected;
            return Ok(());
        }

        // slots dropped last tick have had a tick to be observed, now free them
        for node_id in 0..self.topology.num_links() {
            if self.topology.node_just_disconnected(node_id) {
                self.topology.release(node_id);
            }
        }

        self.topology.update_links(delta_time)?;
        self.mesh_reliability.update(delta_time)?;
        self.receive_packets().await?;
        self.send_packets(delta_time).await;
        self.send_link_packets(delta_time).await;
        self.check_for_timeout(delta_time);
        Ok(())
    }

    async fn receive_packets(&mut self) -> Result<(), RudpError> {
        while let Some(packet) = self.topology.receive_packet().await? {
            let payload_len = packet.payload.len();
            if Some(packet.from) == self.mesh_address {
                Topology::acknowledge(&mut self.mesh_reliability, &packet.header, payload_len)?;
            } else if let Some(node_id) = self.topology.node_id_from_address(&packet.from) {
                if let Some(link) = self.topology.link_mut(node_id) {
                    Topology::acknowledge(&mut link.reliability, &packet.header, payload_len)?;
                }
            }

            if !self.parse_packet(packet.from, &packet.payload) {
                trace!(from = %packet.from, "node ignored packet");
            }
        }
        Ok(())
    }

    async fn send_packets(&mut self, delta_time: f32) {
        let Some(mesh_address) = self.mesh_address else {
            return;
        };
        let protocol_id = self.topology.config().protocol_id;
        let send_interval = self.topology.config().send_interval;

        self.send_accumulator += delta_time;
        while self.send_accumulator > send_interval {
            let request = match self.state {
                NodeState::Connecting => Some(NodeRequest::ConnectRequest),
                NodeState::Connected => Some(NodeRequest::KeepAlive),
                _ => None,
            };
            if let Some(request) = request {
                let packet = request.serialize(protocol_id);
                if let Err(e) = self
                    .topology
                    .send_packet(mesh_address, &mut self.mesh_reliability, &packet)
                    .await
                {
                    warn!(%mesh_address, error = %e, "node failed to reach mesh");
                }
            }
            self.send_accumulator -= send_interval;
        }
    }

    /// Paces each peer link at its flow-control rate. Every paced packet carries the
    /// next guaranteed envelope when one fits, otherwise just acks.
    async fn send_link_packets(&mut self, delta_time: f32) {
        let max_envelope = self.topology.config().max_packet_size - CHANNEL_TAG_SIZE;

        for node_id in 0..self.topology.num_links() {
            if Some(node_id) == self.local_node_id || !self.topology.is_node_connected(node_id) {
                continue;
            }
            let Some(link) = self.topology.link_mut(node_id) else {
                continue;
            };

            link.transmission_accumulator += delta_time;
            let interval = 1.0 / link.flow_control.send_rate();
            if link.transmission_accumulator < interval {
                continue;
            }
            // at most one packet per tick; a long tick doesn't turn into a burst later
            link.transmission_accumulator =
                (link.transmission_accumulator - interval).min(interval);

            let transport_sequence = link.reliability.local_sequence();
            let envelope = link.guaranteed.serialize_next(&link.reliability, max_envelope);
            let carries_envelope = envelope.is_some();
            let payload = match envelope {
                Some(envelope) => Channel::Guaranteed.frame(&envelope),
                None => Channel::AckCarrier.frame(&[]),
            };

            if let Err(e) = self.topology.send_to_node(node_id, &payload).await {
                warn!(node_id, error = %e, "node failed to send to peer");
                if carries_envelope {
                    if let Some(link) = self.topology.link_mut(node_id) {
                        link.guaranteed.restore_unsent(transport_sequence);
                    }
                }
            }
        }
    }

    fn check_for_timeout(&mut self, delta_time: f32) {
        if !matches!(self.state, NodeState::Connecting | NodeState::Connected) {
            return;
        }
        self.timeout_accumulator += delta_time;
        if self.timeout_accumulator > self.topology.config().timeout {
            if self.state == NodeState::Connecting {
                debug!("node connect failed");
                self.state = NodeState::ConnectFail;
            } else {
                debug!("node connection timed out");
                self.state = NodeState::Disconnected;
            }
            self.clear_data();
        }
    }

    fn handle_mesh_message(&mut self, message: MeshMessage) -> bool {
        match message {
            MeshMessage::ConnectionAccepted { node_id, num_nodes } => {
                if self.state == NodeState::Connecting {
                    self.local_node_id = Some(node_id as NodeId);
                    self.topology.reserve(num_nodes as usize);
                    self.state = NodeState::Connected;
                    debug!(node_id, num_nodes, "node connected to mesh");
                }
            }
            MeshMessage::Update { slots } => {
                if slots.len() != self.topology.num_links() {
                    return false;
                }
                if self.state == NodeState::Connected {
                    for (node_id, slot) in slots.into_iter().enumerate() {
                        if Some(node_id) == self.local_node_id {
                            continue;
                        }
                        match slot {
                            Some(address) => {
                                let address = SocketAddr::V4(address);
                                if let Err(e) = self.topology.connect_node(node_id, address) {
                                    warn!(node_id, error = %e, "node failed to connect peer");
                                }
                            }
                            None => self.topology.disconnect_node(node_id),
                        }
                    }
                }
            }
        }
        self.timeout_accumulator = 0.0;
        true
    }

    fn handle_peer_payload(&mut self, node_id: NodeId, data: &[u8]) -> bool {
        let Some((channel, body)) = Channel::split(data) else {
            return false;
        };
        match channel {
            Channel::Unreliable => self.received.push_back((node_id, body.to_vec())),
            Channel::Guaranteed => {
                let Some(link) = self.topology.link_mut(node_id) else {
                    return false;
                };
                if let Err(e) = link.guaranteed.deserialize_incoming(body) {
                    warn!(node_id, error = %e, "dropping malformed guaranteed envelope");
                    return false;
                }
            }
            Channel::AckCarrier => {}
        }
        true
    }

    fn clear_data(&mut self) {
        self.topology.clear();
        self.received.clear();
        self.send_accumulator = 0.0;
        self.timeout_accumulator = 0.0;
        self.local_node_id = None;
        self.mesh_address = None;
        self.mesh_reliability.reset();
    }
}

impl PacketParser for Node {
    fn parse_packet(&mut self, sender: SocketAddr, data: &[u8]) -> bool {
        if Some(sender) == self.mesh_address {
            let protocol_id = self.topology.config().protocol_id;
            return match MeshMessage::parse(data, protocol_id) {
                Some(message) => self.handle_mesh_message(message),
                None => false,
            };
        }
        match self.topology.node_id_from_address(&sender) {
            Some(node_id) => self.handle_peer_payload(node_id, data),
            None => false,
        }
    }
}
