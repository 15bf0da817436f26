//! Wrap-aware sequence number arithmetic shared by every queue in the crate.

/// Width of the selective ack bitfield carried in every reliability header
pub const ACK_BITFIELD_WIDTH: u32 = 32;

/// Extra received slots kept past the bitfield so the oldest ackable entry survives pruning
pub const RECEIVED_WINDOW_MARGIN: u32 = 2;

/// Number of sequences kept in the received queue behind the newest one
pub const RECEIVED_WINDOW: u32 = ACK_BITFIELD_WIDTH + RECEIVED_WINDOW_MARGIN;

/// Default sequence space: the full u32 range
pub const DEFAULT_MAX_SEQUENCE: u32 = u32::MAX;

/// Returns true when `s1` is more recent than `s2` in a sequence space wrapping
/// after `max_sequence`.
///
/// Equal sequences are never more recent than each other.
#[inline]
pub fn more_recent(s1: u32, s2: u32, max_sequence: u32) -> bool {
    let half = max_sequence / 2;
    (s1 > s2 && s1 - s2 <= half) || (s2 > s1 && s2 - s1 > half)
}

/// Maps `sequence` to its bit in an ack bitfield relative to `ack`.
///
/// The caller guarantees that `sequence` is older than `ack`. Results above 31
/// are legal and simply mean the sequence can't be acked through the bitfield.
#[inline]
pub fn bit_index_for_sequence(sequence: u32, ack: u32, max_sequence: u32) -> u32 {
    debug_assert!(sequence != ack);
    debug_assert!(!more_recent(sequence, ack, max_sequence));
    if sequence > ack {
        debug_assert!(max_sequence >= sequence);
        ack + (max_sequence - sequence)
    } else {
        ack - 1 - sequence
    }
}

/// Next sequence after `sequence`, wrapping past `max_sequence` back to zero.
#[inline]
pub fn next_sequence(sequence: u32, max_sequence: u32) -> u32 {
    if sequence >= max_sequence {
        0
    } else {
        sequence + 1
    }
}

/// Oldest sequence still kept when `latest` is the newest one received.
#[inline]
pub fn window_start(latest: u32, window: u32, max_sequence: u32) -> u32 {
    if latest >= window {
        latest - window
    } else {
        max_sequence - (window - latest) + 1
    }
}
