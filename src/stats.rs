use crate::flow_control::{FlowControl, FlowMode};
use crate::guaranteed::GuaranteedDeliverySystem;
use crate::reliability::ReliabilitySystem;

/// Connection state of one topology slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LinkState {
    /// Slot is free
    #[default]
    Disconnected,
    /// Mesh has reserved the slot and is waiting for the first keep-alive
    Connecting,
    /// Traffic is flowing
    Connected,
}

/// Point-in-time statistics for one link
#[derive(Debug, Clone, PartialEq)]
pub struct LinkStats {
    /// Total packets sent on this link
    pub packets_sent: u64,
    /// Total packets received on this link
    pub packets_received: u64,
    /// Packets that went unacked past the RTT maximum
    pub packets_lost: u64,
    /// Packets acked by the remote side
    pub packets_acked: u64,
    /// Smoothed round-trip time in seconds
    pub round_trip_time: f32,
    /// Outgoing bandwidth in kbps
    pub sent_bandwidth: f32,
    /// Acked bandwidth in kbps
    pub acked_bandwidth: f32,
    /// Current flow-control mode
    pub flow_mode: FlowMode,
    /// Packets per second the link is paced at
    pub send_rate: f32,
    /// Guaranteed messages not yet sent
    pub guaranteed_pending_send: usize,
    /// Guaranteed messages sent and waiting for an ack
    pub guaranteed_pending_ack: usize,
}

impl LinkStats {
    pub fn capture(
        reliability: &ReliabilitySystem,
        flow_control: &FlowControl,
        guaranteed: &GuaranteedDeliverySystem,
    ) -> Self {
        Self {
            packets_sent: reliability.sent_packets(),
            packets_received: reliability.received_packets(),
            packets_lost: reliability.lost_packets(),
            packets_acked: reliability.acked_packets(),
            round_trip_time: reliability.round_trip_time(),
            sent_bandwidth: reliability.sent_bandwidth(),
            acked_bandwidth: reliability.acked_bandwidth(),
            flow_mode: flow_control.mode(),
            send_rate: flow_control.send_rate(),
            guaranteed_pending_send: guaranteed.pending_send_len(),
            guaranteed_pending_ack: guaranteed.pending_ack_len(),
        }
    }

    pub fn packet_loss_rate(&self) -> f64 {
        if self.packets_sent == 0 {
            0.0
        } else {
            self.packets_lost as f64 / self.packets_sent as f64
        }
    }
}
