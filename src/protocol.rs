use std::net::{Ipv4Addr, SocketAddrV4};

use crate::error::RudpError;

/// Reliability header size in bytes
/// protocol_id(4) + sequence(4) + ack(4) + ack_bits(4)
pub const RELIABILITY_HEADER_SIZE: usize = 16;

/// Control message prefix: protocol id + message type
pub const CONTROL_HEADER_SIZE: usize = 5;

/// Bytes per slot in a mesh `Update`
pub const UPDATE_SLOT_SIZE: usize = 6;

/// Channel tag in front of every node-to-node payload
pub const CHANNEL_TAG_SIZE: usize = 1;

fn read_u32(data: &[u8], offset: usize) -> u32 {
    u32::from_be_bytes([data[offset], data[offset + 1], data[offset + 2], data[offset + 3]])
}

/// Leading big-endian u32 of a payload, if there is one
pub fn peek_protocol_id(data: &[u8]) -> Option<u32> {
    if data.len() < 4 {
        return None;
    }
    Some(read_u32(data, 0))
}

/// Header in front of every datagram a topology sends
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReliabilityHeader {
    pub protocol_id: u32,
    pub sequence: u32,
    pub ack: u32,
    pub ack_bits: u32,
}

impl ReliabilityHeader {
    /// Serialize the header followed by `payload`
    pub fn write(&self, payload: &[u8]) -> Vec<u8> {
        let mut packet = Vec::with_capacity(RELIABILITY_HEADER_SIZE + payload.len());
        packet.extend_from_slice(&self.protocol_id.to_be_bytes());
        packet.extend_from_slice(&self.sequence.to_be_bytes());
        packet.extend_from_slice(&self.ack.to_be_bytes());
        packet.extend_from_slice(&self.ack_bits.to_be_bytes());
        packet.extend_from_slice(payload);
        packet
    }

    /// Parse a datagram into its header and payload.
    ///
    /// A datagram must carry at least one payload byte.
    pub fn parse(datagram: &[u8], expected_protocol_id: u32) -> Result<(Self, &[u8]), RudpError> {
        if datagram.len() <= RELIABILITY_HEADER_SIZE {
            return Err(RudpError::PacketTooSmall {
                size: datagram.len(),
                min: RELIABILITY_HEADER_SIZE + 1,
            });
        }

        let protocol_id = read_u32(datagram, 0);
        if protocol_id != expected_protocol_id {
            return Err(RudpError::ProtocolMismatch {
                expected: expected_protocol_id,
                actual: protocol_id,
            });
        }

        let header = Self {
            protocol_id,
            sequence: read_u32(datagram, 4),
            ack: read_u32(datagram, 8),
            ack_bits: read_u32(datagram, 12),
        };
        Ok((header, &datagram[RELIABILITY_HEADER_SIZE..]))
    }
}

fn control_prefix(protocol_id: u32, message_type: u8, capacity: usize) -> Vec<u8> {
    let mut packet = Vec::with_capacity(capacity);
    packet.extend_from_slice(&protocol_id.to_be_bytes());
    packet.push(message_type);
    packet
}

/// Control messages a node sends to the mesh
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeRequest {
    ConnectRequest,
    KeepAlive,
}

impl NodeRequest {
    pub fn message_type(&self) -> u8 {
        match self {
            NodeRequest::ConnectRequest => 0,
            NodeRequest::KeepAlive => 1,
        }
    }

    pub fn serialize(&self, protocol_id: u32) -> Vec<u8> {
        control_prefix(protocol_id, self.message_type(), CONTROL_HEADER_SIZE)
    }

    pub fn parse(data: &[u8], protocol_id: u32) -> Option<Self> {
        if data.len() != CONTROL_HEADER_SIZE || peek_protocol_id(data)? != protocol_id {
            return None;
        }
        match data[4] {
            0 => Some(NodeRequest::ConnectRequest),
            1 => Some(NodeRequest::KeepAlive),
            _ => None,
        }
    }
}

/// Control messages the mesh sends to a node
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MeshMessage {
    /// Slot `node_id` out of `num_nodes` has been reserved for the receiver
    ConnectionAccepted { node_id: u8, num_nodes: u8 },
    /// Address of every slot, `None` for empty ones
    Update { slots: Vec<Option<SocketAddrV4>> },
}

impl MeshMessage {
    pub fn message_type(&self) -> u8 {
        match self {
            MeshMessage::ConnectionAccepted { .. } => 0,
            MeshMessage::Update { .. } => 1,
        }
    }

    pub fn serialize(&self, protocol_id: u32) -> Vec<u8> {
        match self {
            MeshMessage::ConnectionAccepted { node_id, num_nodes } => {
                let mut packet =
                    control_prefix(protocol_id, self.message_type(), CONTROL_HEADER_SIZE + 2);
                packet.push(*node_id);
                packet.push(*num_nodes);
                packet
            }
            MeshMessage::Update { slots } => {
                let size = CONTROL_HEADER_SIZE + UPDATE_SLOT_SIZE * slots.len();
                let mut packet = control_prefix(protocol_id, self.message_type(), size);
                for slot in slots {
                    match slot {
                        Some(address) => {
                            packet.extend_from_slice(&address.ip().octets());
                            packet.extend_from_slice(&address.port().to_be_bytes());
                        }
                        None => packet.extend_from_slice(&[0u8; UPDATE_SLOT_SIZE]),
                    }
                }
                packet
            }
        }
    }

    /// Wrong protocol id, unknown type and malformed sizes all yield `None`.
    pub fn parse(data: &[u8], protocol_id: u32) -> Option<Self> {
        if data.len() < CONTROL_HEADER_SIZE || peek_protocol_id(data)? != protocol_id {
            return None;
        }
        match data[4] {
            0 => {
                if data.len() != CONTROL_HEADER_SIZE + 2 {
                    return None;
                }
                Some(MeshMessage::ConnectionAccepted {
                    node_id: data[5],
                    num_nodes: data[6],
                })
            }
            1 => {
                let body = &data[CONTROL_HEADER_SIZE..];
                if body.len() % UPDATE_SLOT_SIZE != 0 {
                    return None;
                }
                let slots = body
                    .chunks_exact(UPDATE_SLOT_SIZE)
                    .map(|chunk| {
                        let ip = Ipv4Addr::new(chunk[0], chunk[1], chunk[2], chunk[3]);
                        let port = u16::from_be_bytes([chunk[4], chunk[5]]);
                        if ip.is_unspecified() {
                            None
                        } else {
                            Some(SocketAddrV4::new(ip, port))
                        }
                    })
                    .collect();
                Some(MeshMessage::Update { slots })
            }
            _ => None,
        }
    }
}

/// What a node-to-node payload carries
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Channel {
    /// Application data with no delivery guarantee
    Unreliable = 0,
    /// One guaranteed delivery envelope
    Guaranteed = 1,
    /// Nothing but the reliability header, keeps acks flowing
    AckCarrier = 2,
}

impl Channel {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Channel::Unreliable),
            1 => Some(Channel::Guaranteed),
            2 => Some(Channel::AckCarrier),
            _ => None,
        }
    }

    /// Prefix `body` with this channel's tag
    pub fn frame(self, body: &[u8]) -> Vec<u8> {
        let mut payload = Vec::with_capacity(CHANNEL_TAG_SIZE + body.len());
        payload.push(self as u8);
        payload.extend_from_slice(body);
        payload
    }

    /// Split a node-to-node payload into its channel and body
    pub fn split(payload: &[u8]) -> Option<(Self, &[u8])> {
        let (&tag, body) = payload.split_first()?;
        Some((Self::from_u8(tag)?, body))
    }
}
