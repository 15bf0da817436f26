//! Per-link acknowledgment tracking: sequence counters, selective acks,
//! RTT smoothing, loss detection and bandwidth estimates.
//!
//! The system is driven by [`ReliabilitySystem::update`] once per tick. Each
//! tick ages every queue, then prunes them, then recomputes the statistics.
//! Pruning fills the one-tick [`recently_acked`](ReliabilitySystem::recently_acked)
//! and [`recently_lost`](ReliabilitySystem::recently_lost) views that the
//! guaranteed delivery layer consumes in the same tick.

use tracing::trace;

use crate::error::RudpError;
use crate::packet_queue::{PacketQueue, PacketRecord};
use crate::sequence::{
    bit_index_for_sequence, more_recent, next_sequence, window_start, ACK_BITFIELD_WIDTH,
    DEFAULT_MAX_SEQUENCE, RECEIVED_WINDOW,
};

/// Seconds a packet may stay unacked before it counts as lost
pub const ROUND_TRIP_TIME_MAXIMUM: f32 = 1.0;

/// Weight of a new RTT sample in the smoothed estimate
pub const RTT_SMOOTHING: f32 = 0.1;

/// Slack applied to age comparisons so float accumulation doesn't delay pruning by a tick
const AGE_EPSILON: f32 = 0.001;

#[derive(Debug, Clone)]
pub struct ReliabilitySystem {
    max_sequence: u32,
    local_sequence: u32,
    remote_sequence: u32,

    sent_packets: u64,
    recv_packets: u64,
    lost_packets: u64,
    acked_packets: u64,

    sent_bandwidth: f32,
    acked_bandwidth: f32,
    round_trip_time: f32,
    round_trip_time_maximum: f32,

    sent_queue: PacketQueue,
    received_queue: PacketQueue,
    pending_ack_queue: PacketQueue,
    acked_queue: PacketQueue,

    acks: Vec<u32>,
    recently_acked: Vec<PacketRecord>,
    recently_lost: Vec<PacketRecord>,
}

impl Default for ReliabilitySystem {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_SEQUENCE)
    }
}

impl ReliabilitySystem {
    pub fn new(max_sequence: u32) -> Self {
        Self {
            max_sequence,
            local_sequence: 0,
            remote_sequence: 0,
            sent_packets: 0,
            recv_packets: 0,
            lost_packets: 0,
            acked_packets: 0,
            sent_bandwidth: 0.0,
            acked_bandwidth: 0.0,
            round_trip_time: 0.0,
            round_trip_time_maximum: ROUND_TRIP_TIME_MAXIMUM,
            sent_queue: PacketQueue::new(),
            received_queue: PacketQueue::new(),
            pending_ack_queue: PacketQueue::new(),
            acked_queue: PacketQueue::new(),
            acks: Vec::new(),
            recently_acked: Vec::new(),
            recently_lost: Vec::new(),
        }
    }

    /// Back to the freshly-constructed state, keeping the sequence space
    pub fn reset(&mut self) {
        *self = Self::new(self.max_sequence);
    }

    /// Records an outgoing packet under the current local sequence and advances it.
    pub fn packet_sent(&mut self, size: usize) -> Result<(), RudpError> {
        self.check_sequence_free()?;
        let sequence = self.local_sequence;
        let record = PacketRecord::new(sequence, size);
        self.sent_queue.push_back(record);
        self.pending_ack_queue.push_back(record);
        self.sent_packets += 1;
        self.local_sequence = next_sequence(self.local_sequence, self.max_sequence);
        Ok(())
    }

    /// Fails while the next local sequence is still tracked from its previous use.
    ///
    /// Only a small `max_sequence` sent through faster than `2 * rtt_max` can hit this.
    pub fn check_sequence_free(&self) -> Result<(), RudpError> {
        let sequence = self.local_sequence;
        if self.sent_queue.exists(sequence)
            || self.pending_ack_queue.exists(sequence)
            || self.acked_queue.exists(sequence)
        {
            return Err(RudpError::SequenceReuse { sequence });
        }
        Ok(())
    }

    /// Records an incoming packet. Duplicates and out-of-range sequences are ignored.
    pub fn packet_received(&mut self, sequence: u32, size: usize) -> Result<(), RudpError> {
        self.recv_packets += 1;
        if sequence > self.max_sequence {
            trace!(sequence, max_sequence = self.max_sequence, "ignoring out-of-range sequence");
            return Ok(());
        }
        if self.received_queue.exists(sequence) {
            trace!(sequence, "ignoring duplicate packet");
            return Ok(());
        }

        self.received_queue
            .insert_sorted(PacketRecord::new(sequence, size), self.max_sequence)?;
        if more_recent(sequence, self.remote_sequence, self.max_sequence) {
            self.remote_sequence = sequence;
        }
        Ok(())
    }

    /// Selective ack for the packets received behind `remote_sequence`
    pub fn generate_ack_bits(&self) -> u32 {
        let ack = self.remote_sequence;
        let mut ack_bits = 0u32;
        for record in self.received_queue.iter() {
            if record.sequence == ack || more_recent(record.sequence, ack, self.max_sequence) {
                break;
            }
            let bit_index = bit_index_for_sequence(record.sequence, ack, self.max_sequence);
            if bit_index < ACK_BITFIELD_WIDTH {
                ack_bits |= 1 << bit_index;
            }
        }
        ack_bits
    }

    /// Applies a remote ack to the pending-ack queue and folds acked packets into the RTT.
    pub fn process_ack(&mut self, ack: u32, ack_bits: u32) -> Result<(), RudpError> {
        let max_sequence = self.max_sequence;
        let acked = self.pending_ack_queue.extract_where(|record| {
            if record.sequence == ack {
                return true;
            }
            if more_recent(record.sequence, ack, max_sequence) {
                return false;
            }
            let bit_index = bit_index_for_sequence(record.sequence, ack, max_sequence);
            bit_index < ACK_BITFIELD_WIDTH && (ack_bits >> bit_index) & 1 == 1
        });

        for record in acked {
            self.round_trip_time += (record.age - self.round_trip_time) * RTT_SMOOTHING;
            self.acked_queue.insert_sorted(record, max_sequence)?;
            self.acks.push(record.sequence);
            self.acked_packets += 1;
        }
        Ok(())
    }

    /// One tick: age, prune, recompute statistics, then (debug builds) validate ordering.
    pub fn update(&mut self, delta_time: f32) -> Result<(), RudpError> {
        self.acks.clear();
        self.advance_queue_time(delta_time);
        self.update_queues();
        self.update_stats();
        if cfg!(debug_assertions) {
            self.validate()?;
        }
        Ok(())
    }

    /// Checks the ordering invariant of all four queues
    pub fn validate(&self) -> Result<(), RudpError> {
        let queues = [
            ("sent", &self.sent_queue),
            ("received", &self.received_queue),
            ("pending_ack", &self.pending_ack_queue),
            ("acked", &self.acked_queue),
        ];
        for (name, queue) in queues {
            if !queue.verify_sorted(self.max_sequence) {
                return Err(RudpError::UnsortedQueue { queue: name });
            }
        }
        Ok(())
    }

    fn advance_queue_time(&mut self, delta_time: f32) {
        self.sent_queue.advance_time(delta_time);
        self.received_queue.advance_time(delta_time);
        self.pending_ack_queue.advance_time(delta_time);
        self.acked_queue.advance_time(delta_time);
    }

    fn update_queues(&mut self) {
        let rtt_max = self.round_trip_time_maximum;

        while self.sent_queue.front().is_some_and(|r| r.age > rtt_max + AGE_EPSILON) {
            self.sent_queue.pop_front();
        }

        if let Some(latest) = self.received_queue.back().map(|r| r.sequence) {
            let minimum = window_start(latest, RECEIVED_WINDOW, self.max_sequence);
            while self
                .received_queue
                .front()
                .is_some_and(|r| !more_recent(r.sequence, minimum, self.max_sequence))
            {
                self.received_queue.pop_front();
            }
        }

        self.recently_acked.clear();
        while self.acked_queue.front().is_some_and(|r| r.age > rtt_max * 2.0 - AGE_EPSILON) {
            if let Some(record) = self.acked_queue.pop_front() {
                self.recently_acked.push(record);
            }
        }

        self.recently_lost.clear();
        while self.pending_ack_queue.front().is_some_and(|r| r.age > rtt_max + AGE_EPSILON) {
            if let Some(record) = self.pending_ack_queue.pop_front() {
                trace!(sequence = record.sequence, "packet lost");
                self.recently_lost.push(record);
                self.lost_packets += 1;
            }
        }
    }

    fn update_stats(&mut self) {
        let rtt_max = self.round_trip_time_maximum;
        let sent_bytes_per_second = (self.sent_queue.total_size(None) as f32 / rtt_max).trunc();
        let acked_bytes_per_second =
            (self.acked_queue.total_size(Some(rtt_max)) as f32 / rtt_max).trunc();
        self.sent_bandwidth = sent_bytes_per_second * (8.0 / 1000.0);
        self.acked_bandwidth = acked_bytes_per_second * (8.0 / 1000.0);
    }

    pub fn max_sequence(&self) -> u32 {
        self.max_sequence
    }

    /// Sequence the next outgoing packet will carry
    pub fn local_sequence(&self) -> u32 {
        self.local_sequence
    }

    /// Most recent sequence received from the remote side
    pub fn remote_sequence(&self) -> u32 {
        self.remote_sequence
    }

    /// Value for the `ack` field of the next outgoing header.
    ///
    /// Until something has been received this points just behind sequence 0, so a
    /// fresh link can't ack the peer's first packet before it arrives.
    pub fn ack_sequence(&self) -> u32 {
        if self.received_queue.is_empty() {
            self.max_sequence
        } else {
            self.remote_sequence
        }
    }

    /// Smoothed round trip time in seconds
    pub fn round_trip_time(&self) -> f32 {
        self.round_trip_time
    }

    pub fn round_trip_time_maximum(&self) -> f32 {
        self.round_trip_time_maximum
    }

    pub fn sent_packets(&self) -> u64 {
        self.sent_packets
    }

    pub fn received_packets(&self) -> u64 {
        self.recv_packets
    }

    pub fn lost_packets(&self) -> u64 {
        self.lost_packets
    }

    pub fn acked_packets(&self) -> u64 {
        self.acked_packets
    }

    /// Sent bandwidth in kbps over the trailing RTT window
    pub fn sent_bandwidth(&self) -> f32 {
        self.sent_bandwidth
    }

    /// Acked bandwidth in kbps over the trailing RTT window
    pub fn acked_bandwidth(&self) -> f32 {
        self.acked_bandwidth
    }

    /// Sequences acked since the last update
    pub fn acks(&self) -> &[u32] {
        &self.acks
    }

    /// Acked packets that aged out of the acked queue this tick
    pub fn recently_acked(&self) -> &[PacketRecord] {
        &self.recently_acked
    }

    /// Packets declared lost this tick
    pub fn recently_lost(&self) -> &[PacketRecord] {
        &self.recently_lost
    }

    pub fn sent_queue(&self) -> &PacketQueue {
        &self.sent_queue
    }

    pub fn received_queue(&self) -> &PacketQueue {
        &self.received_queue
    }

    pub fn pending_ack_queue(&self) -> &PacketQueue {
        &self.pending_ack_queue
    }

    pub fn acked_queue(&self) -> &PacketQueue {
        &self.acked_queue
    }
}
