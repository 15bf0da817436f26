use std::time::Duration;

use crate::error::RudpError;
use crate::guaranteed::GUARANTEED_HEADER_SIZE;
use crate::protocol::{CHANNEL_TAG_SIZE, RELIABILITY_HEADER_SIZE};
use crate::sequence::{DEFAULT_MAX_SEQUENCE, RECEIVED_WINDOW};

/// Largest UDP payload an IPv4 datagram can carry
pub const MAX_UDP_PAYLOAD: usize = 65507;

/// How long one receive poll waits for a datagram before reporting "nothing this tick"
pub const RECEIVE_POLL_TIMEOUT: Duration = Duration::from_millis(1);

/// Settings shared by a mesh and the nodes that join it
#[derive(Debug, Clone, PartialEq)]
pub struct TopologyConfig {
    /// Leading u32 of every datagram; packets carrying any other id are dropped
    pub protocol_id: u32,

    /// Seconds between control packets (connect requests, keep-alives, updates)
    pub send_interval: f32,

    /// Seconds of silence after which a peer is considered gone
    pub timeout: f32,

    /// Largest payload a topology sends, not counting the reliability header.
    ///  Must cover the mesh `Update` for every slot (`5 + 6 * max_nodes`).
    pub max_packet_size: usize,

    /// Largest transport sequence number before wrapping to zero
    pub max_sequence: u32,
}

impl Default for TopologyConfig {
    fn default() -> Self {
        Self {
            protocol_id: 0x5255_4450,
            send_interval: 0.25,
            timeout: 10.0,
            max_packet_size: 1024,
            max_sequence: DEFAULT_MAX_SEQUENCE,
        }
    }
}

impl TopologyConfig {
    pub fn with_protocol_id(mut self, protocol_id: u32) -> Self {
        self.protocol_id = protocol_id;
        self
    }

    pub fn validate(&self) -> Result<(), RudpError> {
        if !(self.send_interval > 0.0) {
            return Err(RudpError::Config {
                message: format!("send interval must be positive, got {}", self.send_interval),
            });
        }
        if !(self.timeout > self.send_interval) {
            return Err(RudpError::Config {
                message: format!(
                    "timeout {} must be longer than the send interval {}",
                    self.timeout, self.send_interval
                ),
            });
        }
        if self.max_packet_size <= GUARANTEED_HEADER_SIZE + CHANNEL_TAG_SIZE {
            return Err(RudpError::Config {
                message: format!(
                    "max packet size {} leaves no room for payload",
                    self.max_packet_size
                ),
            });
        }
        if self.max_packet_size + RELIABILITY_HEADER_SIZE > MAX_UDP_PAYLOAD {
            return Err(RudpError::Config {
                message: format!(
                    "max packet size {} does not fit in a UDP datagram",
                    self.max_packet_size
                ),
            });
        }
        if self.max_sequence / 2 <= RECEIVED_WINDOW {
            return Err(RudpError::Config {
                message: format!(
                    "max sequence {} is too small for the ack window",
                    self.max_sequence
                ),
            });
        }
        Ok(())
    }

    /// Largest application payload one guaranteed message may carry
    pub fn max_guaranteed_payload_size(&self) -> usize {
        self.max_packet_size
            .saturating_sub(GUARANTEED_HEADER_SIZE + CHANNEL_TAG_SIZE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::{assert_err, assert_ok};

    #[test]
    fn test_default_is_valid() {
        let config = TopologyConfig::default();
        assert_ok!(config.validate());
        assert_eq!(config.max_guaranteed_payload_size(), 1024 - 9);
    }

    #[test]
    fn test_rejects_bad_timing() {
        let config = TopologyConfig { send_interval: 0.0, ..Default::default() };
        assert_err!(config.validate());

        let config = TopologyConfig { timeout: 0.1, ..Default::default() };
        assert_err!(config.validate());
    }

    #[test]
    fn test_rejects_bad_sizes() {
        let config = TopologyConfig { max_packet_size: 9, ..Default::default() };
        assert_err!(config.validate());

        let config = TopologyConfig { max_packet_size: MAX_UDP_PAYLOAD, ..Default::default() };
        assert_err!(config.validate());

        let config = TopologyConfig { max_sequence: 60, ..Default::default() };
        assert_err!(config.validate());

        let config = TopologyConfig { max_sequence: 255, ..Default::default() };
        assert_ok!(config.validate());
    }

    #[test]
    fn test_with_protocol_id() {
        let config = TopologyConfig::default().with_protocol_id(1234);
        assert_eq!(config.protocol_id, 1234);
    }
}
