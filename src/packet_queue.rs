use std::collections::VecDeque;

use crate::error::RudpError;
use crate::sequence::more_recent;

/// Anything kept in a [`SequenceQueue`]
pub trait Sequenced {
    fn sequence(&self) -> u32;
}

/// Bookkeeping record for one transport packet
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PacketRecord {
    /// Transport sequence number
    pub sequence: u32,
    /// Seconds since the record was created
    pub age: f32,
    /// Payload size in bytes
    pub size: usize,
}

impl PacketRecord {
    pub fn new(sequence: u32, size: usize) -> Self {
        Self { sequence, age: 0.0, size }
    }
}

impl Sequenced for PacketRecord {
    fn sequence(&self) -> u32 {
        self.sequence
    }
}

/// Deque kept sorted oldest-first in wrap-aware sequence order.
///
/// No two entries share a sequence number.
#[derive(Debug, Clone)]
pub struct SequenceQueue<T> {
    items: VecDeque<T>,
}

/// The four reliability queues hold plain packet records
pub type PacketQueue = SequenceQueue<PacketRecord>;

impl<T> Default for SequenceQueue<T> {
    fn default() -> Self {
        Self { items: VecDeque::new() }
    }
}

impl<T: Sequenced> SequenceQueue<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn clear(&mut self) {
        self.items.clear();
    }

    pub fn front(&self) -> Option<&T> {
        self.items.front()
    }

    pub fn back(&self) -> Option<&T> {
        self.items.back()
    }

    pub fn pop_front(&mut self) -> Option<T> {
        self.items.pop_front()
    }

    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.items.iter()
    }

    /// Linear scan for `sequence`
    pub fn exists(&self, sequence: u32) -> bool {
        self.items.iter().any(|item| item.sequence() == sequence)
    }

    /// Appends without an ordering check; the caller knows `item` is the most recent.
    pub fn push_back(&mut self, item: T) {
        self.items.push_back(item);
    }

    /// Inserts `item` at its wrap-aware position.
    ///
    /// Tries the front and back first since most inserts land at either end.
    pub fn insert_sorted(&mut self, item: T, max_sequence: u32) -> Result<(), RudpError> {
        let sequence = item.sequence();

        let (front, back) = match (self.items.front(), self.items.back()) {
            (Some(front), Some(back)) => (front.sequence(), back.sequence()),
            _ => {
                self.items.push_back(item);
                return Ok(());
            }
        };

        if sequence == front || sequence == back {
            return Err(RudpError::DuplicateSequence { sequence });
        }
        if more_recent(front, sequence, max_sequence) {
            self.items.push_front(item);
            return Ok(());
        }
        if more_recent(sequence, back, max_sequence) {
            self.items.push_back(item);
            return Ok(());
        }

        let mut position = self.items.len();
        for (index, existing) in self.items.iter().enumerate() {
            if existing.sequence() == sequence {
                return Err(RudpError::DuplicateSequence { sequence });
            }
            if more_recent(existing.sequence(), sequence, max_sequence) {
                position = index;
                break;
            }
        }
        self.items.insert(position, item);
        Ok(())
    }

    /// Consistency check: every sequence is in range and each entry is more recent
    /// than the one before it.
    pub fn verify_sorted(&self, max_sequence: u32) -> bool {
        if self.items.iter().any(|item| item.sequence() > max_sequence) {
            return false;
        }
        self.items
            .iter()
            .zip(self.items.iter().skip(1))
            .all(|(prev, next)| more_recent(next.sequence(), prev.sequence(), max_sequence))
    }

    /// Removes every entry matching `predicate`, returning them oldest first.
    pub fn extract_where<F>(&mut self, mut predicate: F) -> Vec<T>
    where
        F: FnMut(&T) -> bool,
    {
        let mut extracted = Vec::new();
        let mut kept = VecDeque::with_capacity(self.items.len());
        for item in self.items.drain(..) {
            if predicate(&item) {
                extracted.push(item);
            } else {
                kept.push_back(item);
            }
        }
        self.items = kept;
        extracted
    }
}

impl PacketQueue {
    /// Ages every record by `delta_time` seconds
    pub fn advance_time(&mut self, delta_time: f32) {
        for record in self.items.iter_mut() {
            record.age += delta_time;
        }
    }

    /// Sum of record sizes, optionally only counting records at least `min_age` old
    pub fn total_size(&self, min_age: Option<f32>) -> usize {
        self.items
            .iter()
            .filter(|record| min_age.map_or(true, |age| record.age >= age))
            .map(|record| record.size)
            .sum()
    }
}
