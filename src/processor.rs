use std::net::SocketAddr;

use fnv::FnvHashMap;
use tracing::trace;

use crate::protocol::peek_protocol_id;

/// Handles payloads that belong to one protocol
pub trait PacketParser {
    /// Returns true if the payload was understood
    fn parse_packet(&mut self, sender: SocketAddr, data: &[u8]) -> bool;
}

/// Routes payloads to the parser registered for their leading protocol id
#[derive(Default)]
pub struct PacketProcessor {
    parsers: FnvHashMap<u32, Box<dyn PacketParser>>,
}

impl PacketProcessor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `parser` for `protocol_id`, returning the parser it replaced
    pub fn register_parser(
        &mut self,
        protocol_id: u32,
        parser: Box<dyn PacketParser>,
    ) -> Option<Box<dyn PacketParser>> {
        self.parsers.insert(protocol_id, parser)
    }

    pub fn remove_parser(&mut self, protocol_id: u32) -> Option<Box<dyn PacketParser>> {
        self.parsers.remove(&protocol_id)
    }

    pub fn has_parser(&self, protocol_id: u32) -> bool {
        self.parsers.contains_key(&protocol_id)
    }

    pub fn parser_mut(&mut self, protocol_id: u32) -> Option<&mut (dyn PacketParser + 'static)> {
        self.parsers.get_mut(&protocol_id).map(|parser| parser.as_mut())
    }

    /// Peeks the protocol id and hands the payload to its parser.
    ///
    /// Unknown ids and payloads too short to carry one are not processed.
    pub fn process_packet(&mut self, sender: SocketAddr, data: &[u8]) -> bool {
        let Some(protocol_id) = peek_protocol_id(data) else {
            return false;
        };
        match self.parsers.get_mut(&protocol_id) {
            Some(parser) => parser.parse_packet(sender, data),
            None => {
                trace!(protocol_id, %sender, "no parser registered");
                false
            }
        }
    }
}
