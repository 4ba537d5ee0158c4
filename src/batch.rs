//! Batch accumulation between two flush points.
use std::{
    collections::BTreeMap,
    mem,
    time::{Duration, Instant},
};

use thiserror::Error;
use uuid::Uuid;

use crate::event::{Envelope, Event};

/// Highest offset seen per partition.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PartitionOffsets(BTreeMap<i32, i64>);

impl PartitionOffsets {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn observe(&mut self, partition: i32, offset: i64) {
        let entry = self.0.entry(partition).or_insert(offset);
        if *entry < offset {
            *entry = offset;
        }
    }

    pub fn get(&self, partition: i32) -> Option<i64> {
        self.0.get(&partition).copied()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (i32, i64)> + '_ {
        self.0.iter().map(|(p, o)| (*p, *o))
    }

    pub fn merge(&mut self, other: &PartitionOffsets) {
        for (partition, offset) in other.iter() {
            self.observe(partition, offset);
        }
    }

    /// Entries of `self` strictly ahead of `base`.
    pub fn ahead_of(&self, base: &PartitionOffsets) -> PartitionOffsets {
        PartitionOffsets(
            self.iter()
                .filter(|(p, o)| base.get(*p).map_or(true, |committed| *o > committed))
                .collect(),
        )
    }
}

impl FromIterator<(i32, i64)> for PartitionOffsets {
    fn from_iter<T: IntoIterator<Item = (i32, i64)>>(iter: T) -> Self {
        let mut offsets = PartitionOffsets::new();
        for (partition, offset) in iter {
            offsets.observe(partition, offset);
        }
        offsets
    }
}

/// Validated events accumulated since the last flush, plus the offsets they cover.
///
/// `offsets` also includes records that were dead-lettered in the same window,
/// so committing them once the batch is written never skips an unaccounted record.
#[derive(Debug)]
pub struct Batch {
    id: Uuid,
    records: Vec<(Envelope, Event)>,
    offsets: PartitionOffsets,
    opened_at: Option<Instant>,
}

impl Batch {
    fn new() -> Self {
        Batch {
            id: Uuid::now_v7(),
            records: Vec::new(),
            offsets: PartitionOffsets::new(),
            opened_at: None,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn records(&self) -> &[(Envelope, Event)] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn offsets(&self) -> &PartitionOffsets {
        &self.offsets
    }

    /// Time since the first event was appended.
    pub fn age(&self, now: Instant) -> Option<Duration> {
        self.opened_at.map(|opened| now.saturating_duration_since(opened))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchState {
    Empty,
    Filling,
    Ready,
}

#[derive(Debug, Error)]
#[error("batch already holds its maximum of {max_records} records")]
pub struct BatchFull {
    pub max_records: usize,
}

/// Buffers validated events: `Empty -> Filling -> Ready -> (flush) -> Empty`.
///
/// The time threshold is only evaluated by [`BatchAccumulator::poll_completed`],
/// never by a timer.
#[derive(Debug)]
pub struct BatchAccumulator {
    batch: Batch,
    state: BatchState,
    max_records: usize,
    max_age: Duration,
}

impl BatchAccumulator {
    pub fn new(max_records: usize, max_age: Duration) -> Self {
        BatchAccumulator {
            batch: Batch::new(),
            state: BatchState::Empty,
            max_records,
            max_age,
        }
    }

    pub fn state(&self) -> BatchState {
        self.state
    }

    pub fn batch(&self) -> &Batch {
        &self.batch
    }

    pub fn len(&self) -> usize {
        self.batch.len()
    }

    pub fn is_empty(&self) -> bool {
        self.batch.is_empty()
    }

    /// Records that can still be appended before the size threshold.
    pub fn capacity(&self) -> usize {
        self.max_records.saturating_sub(self.batch.len())
    }

    pub fn push(&mut self, envelope: Envelope, event: Event) -> Result<BatchState, BatchFull> {
        if self.capacity() == 0 {
            return Err(BatchFull {
                max_records: self.max_records,
            });
        }
        if self.state == BatchState::Empty {
            self.batch.opened_at = Some(Instant::now());
            self.state = BatchState::Filling;
        }
        self.batch
            .offsets
            .observe(envelope.source_partition(), envelope.source_offset());
        self.batch.records.push((envelope, event));
        if self.batch.len() >= self.max_records {
            self.state = BatchState::Ready;
        }
        Ok(self.state)
    }

    /// Marks a dead-lettered record as accounted for.
    pub fn acknowledge(&mut self, partition: i32, offset: i64) {
        self.batch.offsets.observe(partition, offset);
    }

    /// Offsets covered by the current window, written or dead-lettered.
    pub fn pending_offsets(&self) -> &PartitionOffsets {
        &self.batch.offsets
    }

    /// Evaluates the time threshold at a poll boundary.
    pub fn poll_completed(&mut self, now: Instant) -> BatchState {
        if self.state == BatchState::Filling
            && self.batch.age(now).is_some_and(|age| age >= self.max_age)
        {
            self.state = BatchState::Ready;
        }
        self.state
    }

    /// Forces a non-empty batch ready regardless of thresholds.
    pub fn seal(&mut self) -> BatchState {
        if self.state == BatchState::Filling {
            self.state = BatchState::Ready;
        }
        self.state
    }

    /// The batch to hand to the sink writer, borrowed for the duration of the flush.
    pub fn ready_batch(&self) -> Option<&Batch> {
        (self.state == BatchState::Ready).then_some(&self.batch)
    }

    /// Starts a new window and returns the finished one.
    pub fn reset(&mut self) -> Batch {
        self.state = BatchState::Empty;
        mem::replace(&mut self.batch, Batch::new())
    }

    /// Takes the offsets of an empty window (dead-letters only).
    pub fn take_acknowledged(&mut self) -> PartitionOffsets {
        if self.state != BatchState::Empty {
            return PartitionOffsets::new();
        }
        mem::take(&mut self.batch.offsets)
    }
}
