use std::net::SocketAddr;

use crate::error::RudpError;
use crate::flow_control::FlowControl;
use crate::guaranteed::GuaranteedDeliverySystem;
use crate::reliability::ReliabilitySystem;
use crate::stats::{LinkState, LinkStats};

/// Index of a slot in a topology
pub type NodeId = usize;

/// Everything a topology tracks about one remote peer.
///
/// Slots are reset and reused, never deallocated, when a peer goes away.
#[derive(Debug)]
pub struct Link {
    pub address: Option<SocketAddr>,
    pub previous_state: LinkState,
    pub current_state: LinkState,
    pub reliability: ReliabilitySystem,
    pub flow_control: FlowControl,
    pub guaranteed: GuaranteedDeliverySystem,
    /// Seconds since the last paced send
    pub transmission_accumulator: f32,
    /// Seconds since the peer was last heard from
    pub timeout_accumulator: f32,
}

impl Link {
    pub fn new(max_sequence: u32) -> Self {
        Self {
            address: None,
            previous_state: LinkState::Disconnected,
            current_state: LinkState::Disconnected,
            reliability: ReliabilitySystem::new(max_sequence),
            flow_control: FlowControl::new(),
            guaranteed: GuaranteedDeliverySystem::new(),
            transmission_accumulator: 0.0,
            timeout_accumulator: 0.0,
        }
    }

    /// Clears all per-peer state; `reset_state` also returns the slot to `Disconnected`.
    pub fn reset(&mut self, reset_state: bool) {
        self.address = None;
        if reset_state {
            self.previous_state = LinkState::Disconnected;
            self.current_state = LinkState::Disconnected;
        }
        self.reliability.reset();
        self.flow_control.reset();
        self.guaranteed.reset();
        self.transmission_accumulator = 0.0;
        self.timeout_accumulator = 0.0;
    }

    /// One tick of the link's subsystems, in the order the guaranteed layer depends on.
    pub fn update(&mut self, delta_time: f32) -> Result<(), RudpError> {
        self.previous_state = self.current_state;

        if self.current_state == LinkState::Connected {
            self.reliability.update(delta_time)?;
            self.guaranteed.update(&self.reliability);
            let rtt_ms = self.reliability.round_trip_time() * 1000.0;
            self.flow_control.update(delta_time, rtt_ms);
        } else {
            self.transmission_accumulator = 0.0;
        }
        Ok(())
    }

    pub fn is_connected(&self) -> bool {
        self.current_state == LinkState::Connected
    }

    pub fn stats(&self) -> LinkStats {
        LinkStats::capture(&self.reliability, &self.flow_control, &self.guaranteed)
    }
}
