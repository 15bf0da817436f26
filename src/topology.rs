//! Socket, link slots and reliability framing shared by the mesh and the node.

use std::io::ErrorKind;
use std::net::SocketAddr;

use fnv::FnvHashMap;
use tokio::net::UdpSocket;
use tokio::time;
use tracing::{debug, trace, warn};

use crate::config::{TopologyConfig, RECEIVE_POLL_TIMEOUT};
use crate::error::RudpError;
use crate::link::{Link, NodeId};
use crate::protocol::{ReliabilityHeader, RELIABILITY_HEADER_SIZE};
use crate::reliability::ReliabilitySystem;
use crate::stats::LinkState;

/// A datagram that passed header validation
#[derive(Debug, Clone)]
pub struct ReceivedPacket {
    pub from: SocketAddr,
    pub header: ReliabilityHeader,
    pub payload: Vec<u8>,
}

#[derive(Debug)]
pub struct Topology {
    identity: &'static str,
    config: TopologyConfig,
    socket: Option<UdpSocket>,
    links: Vec<Link>,
    address_to_node: FnvHashMap<SocketAddr, NodeId>,
}

impl Topology {
    /// `identity` only shows up in log output
    pub fn new(identity: &'static str, config: TopologyConfig) -> Self {
        Self {
            identity,
            config,
            socket: None,
            links: Vec::new(),
            address_to_node: FnvHashMap::default(),
        }
    }

    pub fn config(&self) -> &TopologyConfig {
        &self.config
    }

    pub async fn start(&mut self, bind_addr: SocketAddr) -> Result<(), RudpError> {
        if self.socket.is_some() {
            warn!(identity = self.identity, "topology already running");
            return Ok(());
        }
        let socket = UdpSocket::bind(bind_addr).await?;
        let local_addr = socket.local_addr().ok();
        debug!(identity = self.identity, ?local_addr, "topology started");
        self.socket = Some(socket);
        Ok(())
    }

    pub fn stop(&mut self) {
        if self.socket.take().is_some() {
            debug!(identity = self.identity, "topology stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.socket.is_some()
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.socket.as_ref().and_then(|socket| socket.local_addr().ok())
    }

    /// Grows or shrinks the slot arena to `num_nodes` slots
    pub fn reserve(&mut self, num_nodes: usize) {
        if num_nodes < self.links.len() {
            for link in &self.links[num_nodes..] {
                if let Some(address) = link.address {
                    self.address_to_node.remove(&address);
                }
            }
        }
        let max_sequence = self.config.max_sequence;
        self.links.resize_with(num_nodes, || Link::new(max_sequence));
    }

    /// Drops every slot and address mapping
    pub fn clear(&mut self) {
        self.links.clear();
        self.address_to_node.clear();
    }

    pub fn num_links(&self) -> usize {
        self.links.len()
    }

    pub fn links(&self) -> &[Link] {
        &self.links
    }

    pub fn link(&self, node_id: NodeId) -> Option<&Link> {
        self.links.get(node_id)
    }

    pub fn link_mut(&mut self, node_id: NodeId) -> Option<&mut Link> {
        self.links.get_mut(node_id)
    }

    /// Ticks every slot
    pub fn update_links(&mut self, delta_time: f32) -> Result<(), RudpError> {
        for link in &mut self.links {
            link.update(delta_time)?;
        }
        Ok(())
    }

    /// Binds `address` to slot `node_id` in the given state.
    pub fn assign(
        &mut self,
        node_id: NodeId,
        address: SocketAddr,
        state: LinkState,
    ) -> Result<(), RudpError> {
        let link = self
            .links
            .get_mut(node_id)
            .ok_or(RudpError::InvalidNode { node_id })?;
        if let Some(previous) = link.address.replace(address) {
            if previous != address {
                self.address_to_node.remove(&previous);
            }
        }
        link.current_state = state;
        self.address_to_node.insert(address, node_id);
        Ok(())
    }

    /// Marks a slot connected to `address`. Repeating the current address is a no-op.
    ///
    /// A slot that already belongs to a different address starts over from a fresh
    /// link, so the new peer reads as just connected and no sequence state carries over.
    pub fn connect_node(&mut self, node_id: NodeId, address: SocketAddr) -> Result<(), RudpError> {
        let link = self
            .links
            .get_mut(node_id)
            .ok_or(RudpError::InvalidNode { node_id })?;
        if link.address == Some(address) {
            return Ok(());
        }
        if let Some(previous) = link.address {
            debug!(identity = self.identity, node_id, %previous, %address, "node slot reassigned");
            self.address_to_node.remove(&previous);
            link.reset(true);
        }
        debug!(identity = self.identity, node_id, %address, "node connected");
        self.assign(node_id, address, LinkState::Connected)
    }

    /// Resets everything in the slot except its state history, so the disconnect stays observable
    pub fn disconnect_node(&mut self, node_id: NodeId) {
        let Some(link) = self.links.get_mut(node_id) else {
            return;
        };
        if link.current_state == LinkState::Disconnected {
            return;
        }
        debug!(identity = self.identity, node_id, "node disconnected");
        if let Some(address) = link.address {
            self.address_to_node.remove(&address);
        }
        link.current_state = LinkState::Disconnected;
        link.reset(false);
    }

    /// Frees a slot entirely, state included
    pub fn release(&mut self, node_id: NodeId) {
        if let Some(link) = self.links.get_mut(node_id) {
            if let Some(address) = link.address {
                self.address_to_node.remove(&address);
            }
            link.reset(true);
        }
    }

    pub fn node_address(&self, node_id: NodeId) -> Option<SocketAddr> {
        self.links.get(node_id).and_then(|link| link.address)
    }

    pub fn node_id_from_address(&self, address: &SocketAddr) -> Option<NodeId> {
        self.address_to_node.get(address).copied()
    }

    pub fn node_state(&self, node_id: NodeId) -> LinkState {
        self.links
            .get(node_id)
            .map_or(LinkState::Disconnected, |link| link.current_state)
    }

    pub fn is_node_connected(&self, node_id: NodeId) -> bool {
        self.node_state(node_id) == LinkState::Connected
    }

    pub fn was_node_connected(&self, node_id: NodeId) -> bool {
        self.links
            .get(node_id)
            .is_some_and(|link| link.previous_state == LinkState::Connected)
    }

    pub fn node_just_connected(&self, node_id: NodeId) -> bool {
        self.is_node_connected(node_id) && !self.was_node_connected(node_id)
    }

    pub fn node_just_disconnected(&self, node_id: NodeId) -> bool {
        !self.is_node_connected(node_id) && self.was_node_connected(node_id)
    }

    /// Sends `data` behind a reliability header built from `reliability`, then records the send.
    pub async fn send_packet(
        &self,
        destination: SocketAddr,
        reliability: &mut ReliabilitySystem,
        data: &[u8],
    ) -> Result<(), RudpError> {
        let socket = self.socket.as_ref().ok_or(RudpError::NotRunning)?;
        Self::send_datagram(socket, &self.config, destination, reliability, data).await
    }

    /// Sends `data` to the peer in slot `node_id` using that slot's reliability state.
    pub async fn send_to_node(&mut self, node_id: NodeId, data: &[u8]) -> Result<(), RudpError> {
        let socket = self.socket.as_ref().ok_or(RudpError::NotRunning)?;
        let link = self
            .links
            .get_mut(node_id)
            .ok_or(RudpError::InvalidNode { node_id })?;
        let destination = link.address.ok_or(RudpError::InvalidNode { node_id })?;
        Self::send_datagram(socket, &self.config, destination, &mut link.reliability, data).await
    }

    async fn send_datagram(
        socket: &UdpSocket,
        config: &TopologyConfig,
        destination: SocketAddr,
        reliability: &mut ReliabilitySystem,
        data: &[u8],
    ) -> Result<(), RudpError> {
        if data.len() > config.max_packet_size {
            return Err(RudpError::BufferTooLarge {
                size: data.len(),
                max: config.max_packet_size,
            });
        }

        // nothing goes on the wire under a sequence that can't be recorded
        reliability.check_sequence_free()?;

        let header = ReliabilityHeader {
            protocol_id: config.protocol_id,
            sequence: reliability.local_sequence(),
            ack: reliability.ack_sequence(),
            ack_bits: reliability.generate_ack_bits(),
        };
        let packet = header.write(data);
        socket.send_to(&packet, destination).await?;
        reliability.packet_sent(data.len())
    }

    /// Receives the next valid datagram, or `None` once nothing arrives within the poll timeout.
    ///
    /// Short datagrams and foreign protocol ids are dropped and the next datagram is tried.
    pub async fn receive_packet(&self) -> Result<Option<ReceivedPacket>, RudpError> {
        let socket = self.socket.as_ref().ok_or(RudpError::NotRunning)?;
        let mut buffer = vec![0u8; RELIABILITY_HEADER_SIZE + self.config.max_packet_size];

        loop {
            let received = time::timeout(RECEIVE_POLL_TIMEOUT, socket.recv_from(&mut buffer)).await;
            let (len, from) = match received {
                Ok(Ok(received)) => received,
                Ok(Err(e)) if is_icmp_error(&e) => {
                    trace!(identity = self.identity, error = %e, "ignoring ICMP error on receive");
                    continue;
                }
                Ok(Err(e)) => return Err(e.into()),
                Err(_) => return Ok(None),
            };

            match ReliabilityHeader::parse(&buffer[..len], self.config.protocol_id) {
                Ok((header, payload)) => {
                    return Ok(Some(ReceivedPacket {
                        from,
                        header,
                        payload: payload.to_vec(),
                    }));
                }
                Err(e) => {
                    warn!(identity = self.identity, %from, error = %e, "dropping datagram");
                }
            }
        }
    }

    /// Feeds an inbound header into the reliability state of whoever sent it
    pub fn acknowledge(
        reliability: &mut ReliabilitySystem,
        header: &ReliabilityHeader,
        payload_len: usize,
    ) -> Result<(), RudpError> {
        reliability.packet_received(header.sequence, payload_len)?;
        reliability.process_ack(header.ack, header.ack_bits)
    }
}

/// Unreachable-port reports from earlier sends, surfaced on some platforms as receive errors
fn is_icmp_error(error: &std::io::Error) -> bool {
    matches!(error.kind(), ErrorKind::ConnectionReset | ErrorKind::ConnectionRefused)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::{assert_err, assert_ok};

    fn address(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    #[test]
    fn test_reserve_and_lookup() {
        let mut topology = Topology::new("test", TopologyConfig::default());
        topology.reserve(4);
        assert_eq!(topology.num_links(), 4);

        assert_ok!(topology.connect_node(2, address(5000)));
        assert_eq!(topology.node_id_from_address(&address(5000)), Some(2));
        assert_eq!(topology.node_address(2), Some(address(5000)));
        assert!(topology.is_node_connected(2));
        assert!(topology.node_just_connected(2));

        topology.reserve(2);
        assert_eq!(topology.node_id_from_address(&address(5000)), None);
        assert!(!topology.is_node_connected(2));
    }

    #[test]
    fn test_connect_out_of_range_is_rejected() {
        let mut topology = Topology::new("test", TopologyConfig::default());
        topology.reserve(1);
        let err = assert_err!(topology.connect_node(3, address(5000)));
        assert!(matches!(err, RudpError::InvalidNode { node_id: 3 }));
    }

    #[test]
    fn test_reconnect_moves_address_mapping() {
        let mut topology = Topology::new("test", TopologyConfig::default());
        topology.reserve(2);
        assert_ok!(topology.connect_node(0, address(5000)));
        assert_ok!(topology.connect_node(0, address(5001)));
        assert_eq!(topology.node_id_from_address(&address(5000)), None);
        assert_eq!(topology.node_id_from_address(&address(5001)), Some(0));
    }

    #[test]
    fn test_disconnect_is_observable_for_one_tick() {
        let mut topology = Topology::new("test", TopologyConfig::default());
        topology.reserve(1);
        assert_ok!(topology.connect_node(0, address(5000)));
        assert_ok!(topology.update_links(0.1));
        assert!(topology.was_node_connected(0));

        topology.disconnect_node(0);
        assert!(topology.node_just_disconnected(0));
        assert_eq!(topology.node_address(0), None);
        assert_eq!(topology.node_id_from_address(&address(5000)), None);

        assert_ok!(topology.update_links(0.1));
        assert!(!topology.node_just_disconnected(0));
    }

    #[test]
    fn test_release_resets_state() {
        let mut topology = Topology::new("test", TopologyConfig::default());
        topology.reserve(1);
        assert_ok!(topology.assign(0, address(5000), LinkState::Connecting));
        assert_eq!(topology.node_state(0), LinkState::Connecting);
        topology.release(0);
        assert_eq!(topology.node_state(0), LinkState::Disconnected);
        assert_eq!(topology.node_id_from_address(&address(5000)), None);
    }

    #[test]
    fn test_acknowledge_feeds_reliability() {
        let mut reliability = ReliabilitySystem::default();
        reliability.packet_sent(10).unwrap();
        let header = ReliabilityHeader { protocol_id: 1, sequence: 7, ack: 0, ack_bits: 0 };
        assert_ok!(Topology::acknowledge(&mut reliability, &header, 20));
        assert_eq!(reliability.remote_sequence(), 7);
        assert_eq!(reliability.acked_packets(), 1);
    }

    #[tokio::test]
    async fn test_send_requires_running_socket() {
        let topology = Topology::new("test", TopologyConfig::default());
        let mut reliability = ReliabilitySystem::default();
        let err = assert_err!(topology.send_packet(address(5000), &mut reliability, b"x").await);
        assert!(matches!(err, RudpError::NotRunning));
    }

    #[tokio::test]
    async fn test_oversized_payload_is_rejected() {
        let mut topology = Topology::new("test", TopologyConfig::default());
        assert_ok!(topology.start(address(0)).await);
        let mut reliability = ReliabilitySystem::default();
        let data = vec![0u8; 2000];
        let err = assert_err!(topology.send_packet(address(5000), &mut reliability, &data).await);
        assert!(matches!(err, RudpError::BufferTooLarge { size: 2000, max: 1024 }));
        assert_eq!(reliability.sent_packets(), 0);
    }

    #[tokio::test]
    async fn test_send_and_receive_over_loopback() {
        let mut a = Topology::new("a", TopologyConfig::default());
        let mut b = Topology::new("b", TopologyConfig::default());
        assert_ok!(a.start(address(0)).await);
        assert_ok!(b.start(address(0)).await);
        let b_addr = b.local_addr().unwrap();

        let mut reliability = ReliabilitySystem::default();
        assert_ok!(a.send_packet(b_addr, &mut reliability, b"ping").await);
        assert_eq!(reliability.local_sequence(), 1);

        let mut received = None;
        for _ in 0..100 {
            if let Some(packet) = assert_ok!(b.receive_packet().await) {
                received = Some(packet);
                break;
            }
        }
        let packet = received.expect("datagram never arrived");
        assert_eq!(packet.from, a.local_addr().unwrap());
        assert_eq!(packet.header.sequence, 0);
        assert_eq!(packet.payload, b"ping".to_vec());
    }

    #[tokio::test]
    async fn test_foreign_protocol_is_dropped() {
        let mut a = Topology::new("a", TopologyConfig::default().with_protocol_id(1));
        let mut b = Topology::new("b", TopologyConfig::default().with_protocol_id(2));
        assert_ok!(a.start(address(0)).await);
        assert_ok!(b.start(address(0)).await);
        let b_addr = b.local_addr().unwrap();

        let mut reliability = ReliabilitySystem::default();
        assert_ok!(a.send_packet(b_addr, &mut reliability, b"ping").await);
        for _ in 0..20 {
            assert!(assert_ok!(b.receive_packet().await).is_none());
        }
    }
}
