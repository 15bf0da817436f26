//! Exactly-once, in-order delivery of selected messages on top of a link's
//! [`ReliabilitySystem`].
//!
//! Each outgoing datagram carries at most one guaranteed envelope. The
//! envelope is remembered under the transport sequence it rode on; when the
//! reliability layer reports that sequence lost, the envelope goes back to the
//! front of the send queue. Retries are unbounded.

use std::collections::VecDeque;

use tracing::trace;

use crate::error::RudpError;
use crate::packet_queue::{SequenceQueue, Sequenced};
use crate::reliability::ReliabilitySystem;
use crate::sequence::DEFAULT_MAX_SEQUENCE;

/// Envelope header: guaranteed sequence + payload length
pub const GUARANTEED_HEADER_SIZE: usize = 8;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GuaranteedMessage {
    pub sequence: u32,
    pub payload: Vec<u8>,
}

impl Sequenced for GuaranteedMessage {
    fn sequence(&self) -> u32 {
        self.sequence
    }
}

impl GuaranteedMessage {
    pub fn new(sequence: u32, payload: Vec<u8>) -> Self {
        Self { sequence, payload }
    }

    /// Bytes this message occupies on the wire
    pub fn wire_size(&self) -> usize {
        GUARANTEED_HEADER_SIZE + self.payload.len()
    }

    pub fn serialize(&self) -> Vec<u8> {
        let mut buffer = Vec::with_capacity(self.wire_size());
        buffer.extend_from_slice(&self.sequence.to_be_bytes());
        buffer.extend_from_slice(&(self.payload.len() as u32).to_be_bytes());
        buffer.extend_from_slice(&self.payload);
        buffer
    }

    /// Decodes one envelope from the start of `data`, returning it with the bytes consumed.
    pub fn deserialize(data: &[u8]) -> Result<(Self, usize), RudpError> {
        if data.len() < GUARANTEED_HEADER_SIZE {
            return Err(RudpError::PacketTooSmall {
                size: data.len(),
                min: GUARANTEED_HEADER_SIZE,
            });
        }

        let sequence = u32::from_be_bytes([data[0], data[1], data[2], data[3]]);
        let length = u32::from_be_bytes([data[4], data[5], data[6], data[7]]) as usize;
        let available = data.len() - GUARANTEED_HEADER_SIZE;
        if length > available {
            return Err(RudpError::Protocol {
                message: format!(
                    "guaranteed envelope claims {} payload bytes but only {} remain",
                    length, available
                ),
            });
        }

        let end = GUARANTEED_HEADER_SIZE + length;
        let payload = data[GUARANTEED_HEADER_SIZE..end].to_vec();
        Ok((Self { sequence, payload }, end))
    }
}

/// A sent envelope waiting for its carrying transport packet to be acked or lost
#[derive(Debug, Clone)]
struct IssuedMessage {
    transport_sequence: u32,
    message: GuaranteedMessage,
}

#[derive(Debug, Default)]
pub struct GuaranteedDeliverySystem {
    local_sequence: u32,
    remote_sequence: u32,
    pending_send: VecDeque<GuaranteedMessage>,
    pending_ack: VecDeque<IssuedMessage>,
    pending_recv: SequenceQueue<GuaranteedMessage>,
}

impl GuaranteedDeliverySystem {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drops every queued message and restarts both sequence counters
    pub fn reset(&mut self) {
        self.local_sequence = 0;
        self.remote_sequence = 0;
        self.pending_send.clear();
        self.pending_ack.clear();
        self.pending_recv.clear();
    }

    /// Copies `payload` into a new envelope at the back of the send queue.
    pub fn queue_outgoing(&mut self, payload: &[u8]) {
        let message = GuaranteedMessage::new(self.local_sequence, payload.to_vec());
        trace!(sequence = message.sequence, len = payload.len(), "queued guaranteed message");
        self.pending_send.push_back(message);
        self.local_sequence = self.local_sequence.wrapping_add(1);
    }

    /// Serializes the next queued envelope if it fits in `max_len` bytes.
    ///
    /// The envelope is recorded against `reliability`'s current local sequence, so
    /// the caller must send it in the very next transport packet.
    pub fn serialize_next(
        &mut self,
        reliability: &ReliabilitySystem,
        max_len: usize,
    ) -> Option<Vec<u8>> {
        let fits = self
            .pending_send
            .front()
            .is_some_and(|message| message.wire_size() <= max_len);
        if !fits {
            if let Some(message) = self.pending_send.front() {
                trace!(
                    sequence = message.sequence,
                    size = message.wire_size(),
                    max_len,
                    "guaranteed message does not fit yet"
                );
            }
            return None;
        }

        let message = self.pending_send.pop_front()?;
        let bytes = message.serialize();
        self.pending_ack.push_back(IssuedMessage {
            transport_sequence: reliability.local_sequence(),
            message,
        });
        Some(bytes)
    }

    /// Decodes an incoming envelope and buffers it for in-order delivery.
    ///
    /// Already-delivered and already-buffered sequences are dropped. Returns the
    /// number of bytes consumed from `data`.
    pub fn deserialize_incoming(&mut self, data: &[u8]) -> Result<usize, RudpError> {
        let (message, consumed) = GuaranteedMessage::deserialize(data)?;
        if message.sequence >= self.remote_sequence && !self.pending_recv.exists(message.sequence) {
            self.pending_recv.insert_sorted(message, DEFAULT_MAX_SEQUENCE)?;
        } else {
            trace!(sequence = message.sequence, "dropping duplicate guaranteed message");
        }
        Ok(consumed)
    }

    /// Pops the next payload if it is exactly the one the application expects.
    pub fn dequeue_deliverable(&mut self) -> Option<Vec<u8>> {
        if self.pending_recv.front()?.sequence != self.remote_sequence {
            return None;
        }
        let message = self.pending_recv.pop_front()?;
        self.remote_sequence = self.remote_sequence.wrapping_add(1);
        Some(message.payload)
    }

    /// Retires acked envelopes and requeues lost ones ahead of new sends.
    ///
    /// Must run after `reliability.update` in the same tick.
    pub fn update(&mut self, reliability: &ReliabilitySystem) {
        for record in reliability.recently_acked() {
            if let Some(index) = self.find_pending_ack(record.sequence) {
                self.pending_ack.remove(index);
            }
        }

        // newest first so the oldest lost message ends up at the very front
        for record in reliability.recently_lost().iter().rev() {
            if let Some(issued) = self
                .find_pending_ack(record.sequence)
                .and_then(|index| self.pending_ack.remove(index))
            {
                trace!(
                    sequence = issued.message.sequence,
                    transport_sequence = record.sequence,
                    "resending lost guaranteed message"
                );
                self.pending_send.push_front(issued.message);
            }
        }
    }

    /// Puts back the envelope recorded under `transport_sequence` when its packet never left.
    ///
    /// Without this the next packet sent under the same sequence would retire it on ack.
    pub fn restore_unsent(&mut self, transport_sequence: u32) {
        if let Some(issued) = self
            .find_pending_ack(transport_sequence)
            .and_then(|index| self.pending_ack.remove(index))
        {
            self.pending_send.push_front(issued.message);
        }
    }

    fn find_pending_ack(&self, transport_sequence: u32) -> Option<usize> {
        self.pending_ack
            .iter()
            .position(|issued| issued.transport_sequence == transport_sequence)
    }

    /// Next guaranteed sequence to be assigned locally
    pub fn local_sequence(&self) -> u32 {
        self.local_sequence
    }

    /// Next guaranteed sequence the application will receive
    pub fn remote_sequence(&self) -> u32 {
        self.remote_sequence
    }

    pub fn pending_send_len(&self) -> usize {
        self.pending_send.len()
    }

    pub fn pending_ack_len(&self) -> usize {
        self.pending_ack.len()
    }

    pub fn pending_recv_len(&self) -> usize {
        self.pending_recv.len()
    }

    /// Guaranteed sequences waiting to be sent, front first
    pub fn pending_send_sequences(&self) -> Vec<u32> {
        self.pending_send.iter().map(|message| message.sequence).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::{assert_err, assert_ok};

    fn send(system: &mut GuaranteedDeliverySystem, reliability: &mut ReliabilitySystem) -> Vec<u8> {
        let bytes = system.serialize_next(reliability, 1024).unwrap();
        reliability.packet_sent(bytes.len()).unwrap();
        bytes
    }

    #[test]
    fn test_envelope_round_trip() {
        let message = GuaranteedMessage::new(42, b"hello".to_vec());
        let bytes = message.serialize();
        assert_eq!(bytes.len(), 13);
        assert_eq!(&bytes[..8], &[0, 0, 0, 42, 0, 0, 0, 5]);

        let (decoded, consumed) = assert_ok!(GuaranteedMessage::deserialize(&bytes));
        assert_eq!(decoded, message);
        assert_eq!(consumed, 13);
    }

    #[test]
    fn test_truncated_envelope_is_rejected() {
        let err = assert_err!(GuaranteedMessage::deserialize(&[0, 0, 0]));
        assert!(matches!(err, RudpError::PacketTooSmall { size: 3, min: 8 }));

        let mut bytes = GuaranteedMessage::new(1, vec![7; 10]).serialize();
        bytes.truncate(12);
        let err = assert_err!(GuaranteedMessage::deserialize(&bytes));
        assert!(matches!(err, RudpError::Protocol { .. }));
    }

    #[test]
    fn test_sequences_increment_per_message() {
        let mut system = GuaranteedDeliverySystem::new();
        system.queue_outgoing(b"a");
        system.queue_outgoing(b"b");
        system.queue_outgoing(b"c");
        assert_eq!(system.local_sequence(), 3);
        assert_eq!(system.pending_send_sequences(), vec![0, 1, 2]);
    }

    #[test]
    fn test_out_of_order_arrivals_wait_for_the_gap() {
        let mut receiver = GuaranteedDeliverySystem::new();
        let second = GuaranteedMessage::new(1, b"second".to_vec()).serialize();
        let first = GuaranteedMessage::new(0, b"first".to_vec()).serialize();

        assert_ok!(receiver.deserialize_incoming(&second));
        assert_eq!(receiver.dequeue_deliverable(), None);

        assert_ok!(receiver.deserialize_incoming(&first));
        assert_eq!(receiver.dequeue_deliverable(), Some(b"first".to_vec()));
        assert_eq!(receiver.dequeue_deliverable(), Some(b"second".to_vec()));
        assert_eq!(receiver.dequeue_deliverable(), None);
        assert_eq!(receiver.remote_sequence(), 2);
    }

    #[test]
    fn test_duplicates_are_dropped() {
        let mut receiver = GuaranteedDeliverySystem::new();
        let message = GuaranteedMessage::new(0, b"once".to_vec()).serialize();
        let later = GuaranteedMessage::new(2, b"later".to_vec()).serialize();

        assert_ok!(receiver.deserialize_incoming(&later));
        assert_ok!(receiver.deserialize_incoming(&later));
        assert_eq!(receiver.pending_recv_len(), 1);

        assert_ok!(receiver.deserialize_incoming(&message));
        assert_eq!(receiver.dequeue_deliverable(), Some(b"once".to_vec()));

        // already delivered
        assert_ok!(receiver.deserialize_incoming(&message));
        assert_eq!(receiver.pending_recv_len(), 1);
        assert_eq!(receiver.dequeue_deliverable(), None);
    }

    #[test]
    fn test_serialize_records_transport_sequence() {
        let mut reliability = ReliabilitySystem::default();
        let mut system = GuaranteedDeliverySystem::new();
        reliability.packet_sent(10).unwrap();
        reliability.packet_sent(10).unwrap();

        system.queue_outgoing(b"payload");
        send(&mut system, &mut reliability);
        assert_eq!(system.pending_send_len(), 0);
        assert_eq!(system.pending_ack_len(), 1);
        assert_eq!(system.pending_ack[0].transport_sequence, 2);
    }

    #[test]
    fn test_message_too_big_waits() {
        let reliability = ReliabilitySystem::default();
        let mut system = GuaranteedDeliverySystem::new();
        system.queue_outgoing(&[0u8; 100]);
        system.queue_outgoing(b"small");

        assert_eq!(system.serialize_next(&reliability, 50), None);
        assert_eq!(system.pending_send_len(), 2);
        assert_eq!(system.pending_ack_len(), 0);

        let bytes = system.serialize_next(&reliability, 108).unwrap();
        assert_eq!(bytes.len(), 108);
    }

    #[test]
    fn test_lost_message_is_resent_first() {
        let mut reliability = ReliabilitySystem::default();
        let mut system = GuaranteedDeliverySystem::new();

        system.queue_outgoing(b"first");
        send(&mut system, &mut reliability);
        system.queue_outgoing(b"second");

        assert_ok!(reliability.update(1.1));
        assert_eq!(reliability.recently_lost().len(), 1);
        system.update(&reliability);

        assert_eq!(system.pending_ack_len(), 0);
        assert_eq!(system.pending_send_sequences(), vec![0, 1]);
        let bytes = system.serialize_next(&reliability, 1024).unwrap();
        let (message, _) = assert_ok!(GuaranteedMessage::deserialize(&bytes));
        assert_eq!(message.payload, b"first".to_vec());
    }

    #[test]
    fn test_several_lost_messages_keep_their_order() {
        let mut reliability = ReliabilitySystem::default();
        let mut system = GuaranteedDeliverySystem::new();
        for payload in [b"a", b"b", b"c"] {
            system.queue_outgoing(payload);
            send(&mut system, &mut reliability);
        }
        system.queue_outgoing(b"d");

        assert_ok!(reliability.update(1.5));
        system.update(&reliability);
        assert_eq!(system.pending_send_sequences(), vec![0, 1, 2, 3]);
    }

    #[test]
    fn test_acked_message_is_retired() {
        let mut reliability = ReliabilitySystem::default();
        let mut system = GuaranteedDeliverySystem::new();
        system.queue_outgoing(b"acked");
        send(&mut system, &mut reliability);

        assert_ok!(reliability.process_ack(0, 0));
        assert_ok!(reliability.update(0.5));
        system.update(&reliability);
        // still waiting for the ack record to age out of the acked window
        assert_eq!(system.pending_ack_len(), 1);

        assert_ok!(reliability.update(1.6));
        assert_eq!(reliability.recently_acked().len(), 1);
        system.update(&reliability);
        assert_eq!(system.pending_ack_len(), 0);
        assert_eq!(system.pending_send_len(), 0);
    }

    #[test]
    fn test_restore_unsent_envelope() {
        let reliability = ReliabilitySystem::default();
        let mut system = GuaranteedDeliverySystem::new();
        system.queue_outgoing(b"first");
        system.queue_outgoing(b"second");
        system.serialize_next(&reliability, 1024).unwrap();
        assert_eq!(system.pending_send_sequences(), vec![1]);

        system.restore_unsent(reliability.local_sequence());
        assert_eq!(system.pending_ack_len(), 0);
        assert_eq!(system.pending_send_sequences(), vec![0, 1]);

        // unknown transport sequences are ignored
        system.restore_unsent(77);
        assert_eq!(system.pending_send_len(), 2);
    }

    #[test]
    fn test_reset_discards_in_flight_messages() {
        let mut reliability = ReliabilitySystem::default();
        let mut system = GuaranteedDeliverySystem::new();
        system.queue_outgoing(b"x");
        send(&mut system, &mut reliability);
        system.queue_outgoing(b"y");
        assert_ok!(system.deserialize_incoming(&GuaranteedMessage::new(3, vec![1]).serialize()));

        system.reset();
        assert_eq!(system.local_sequence(), 0);
        assert_eq!(system.remote_sequence(), 0);
        assert_eq!(system.pending_send_len(), 0);
        assert_eq!(system.pending_ack_len(), 0);
        assert_eq!(system.pending_recv_len(), 0);
    }
}
