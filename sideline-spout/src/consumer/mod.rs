// Copyright (C) 2024 Sideline, Inc.
//
// Sideline is offered under the AGPL v3.0 and as commercial software.
// For commercial licensing, contact us at hello@sideline.io.
//
// AGPL:
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as
// published by the Free Software Foundation, either version 3 of the
// License, or (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <http://www.gnu.org/licenses/>.

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use sideline_persistence::PersistenceAdapter;
use tracing::{debug, warn};

use crate::metrics::MetricsSink;
use crate::offsets::{OffsetMap, PartitionKey};

#[cfg(feature = "kafka")]
mod kafka;
mod mem;

#[cfg(feature = "kafka")]
pub use kafka::{KafkaBrokerClient, KafkaConnector};
pub use mem::{MemLog, MemLogClient};

/// A raw record pulled off the broker, before deserialization.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RawRecord {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub key: Option<Vec<u8>>,
    pub payload: Option<Vec<u8>>,
}

/// Where to start consuming a newly assigned partition.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SeekPosition {
    /// Broker-resolved default position.
    Default,
    At(i64),
}

/// Thin capability over the broker client library: partition discovery,
/// manual assignment with seeks, non-blocking polling, per-partition
/// unassignment. Offset commits do NOT go through the broker; they are
/// persisted by the [`LogConsumer`] through the persistence adapter.
#[async_trait]
pub trait BrokerClient: Send + fmt::Debug {
    async fn partitions(&self, topic: &str) -> anyhow::Result<Vec<i32>>;

    /// Replaces the assignment for `topic` with the given partitions.
    async fn assign(&mut self, topic: &str, seeks: &[(i32, SeekPosition)]) -> anyhow::Result<()>;

    /// Non-blocking. Returns the next record across any currently assigned
    /// partition; no cross-partition ordering is guaranteed.
    async fn poll(&mut self) -> anyhow::Result<Option<RawRecord>>;

    /// Returns whether the partition was part of the active assignment.
    async fn unassign(&mut self, topic: &str, partition: i32) -> anyhow::Result<bool>;
}

/// Creates broker clients, one per virtual source.
pub trait BrokerConnector: Send + Sync + fmt::Debug {
    fn connect(&self, source_id: &str) -> anyhow::Result<Box<dyn BrokerClient>>;
}

/// Per-partition acknowledgment bookkeeping. The committed floor for a
/// partition is the maximum contiguous acknowledged prefix; acks above the
/// floor are parked until the gap closes.
#[derive(Debug, Default)]
struct CommitTracker {
    claimed: BTreeSet<i32>,
    floors: HashMap<i32, i64>,
    parked: HashMap<i32, BTreeSet<i64>>,
    dirty: BTreeSet<i32>,
}

impl CommitTracker {
    fn claim(&mut self, partition: i32) {
        self.claimed.insert(partition);
    }

    fn seed(&mut self, partition: i32, floor: i64) {
        self.claimed.insert(partition);
        self.floors.insert(partition, floor);
    }

    /// Anchors the floor right below the first polled offset of a partition
    /// that was seeked to the broker-resolved default.
    fn anchor(&mut self, partition: i32, first_offset: i64) {
        self.claimed.insert(partition);
        self.floors.entry(partition).or_insert(first_offset - 1);
    }

    fn commit(&mut self, partition: i32, offset: i64) {
        let floor = self.floors.entry(partition).or_insert(offset - 1);
        if offset <= *floor {
            // Duplicate ack.
            return;
        }
        if offset == *floor + 1 {
            *floor = offset;
            if let Some(parked) = self.parked.get_mut(&partition) {
                while parked.remove(&(*floor + 1)) {
                    *floor += 1;
                }
            }
            self.dirty.insert(partition);
        } else {
            self.parked.entry(partition).or_default().insert(offset);
        }
    }

    fn floor(&self, partition: i32) -> Option<i64> {
        self.floors.get(&partition).copied()
    }

    /// Committed floors for every claimed partition. Partitions that have not
    /// seen any acknowledgment report -1 (nothing consumed yet).
    fn state(&self, topic: &str) -> OffsetMap {
        self.claimed
            .iter()
            .map(|&partition| {
                (
                    PartitionKey::new(topic, partition),
                    self.floors.get(&partition).copied().unwrap_or(-1),
                )
            })
            .collect()
    }

    fn take_dirty(&mut self) -> Vec<(i32, i64)> {
        let dirty = std::mem::take(&mut self.dirty);
        dirty
            .into_iter()
            .filter_map(|partition| self.floors.get(&partition).map(|&floor| (partition, floor)))
            .collect()
    }

    fn mark_dirty(&mut self, partition: i32) {
        self.dirty.insert(partition);
    }
}

/// Read-only view over a consumer's committed floors, snapshottable from any
/// thread under a short lock.
#[derive(Clone, Debug)]
pub struct ConsumerStateHandle {
    topic: String,
    tracker: Arc<Mutex<CommitTracker>>,
}

impl ConsumerStateHandle {
    pub fn current_state(&self) -> OffsetMap {
        self.tracker
            .lock()
            .expect("The commit tracker lock should not be poisoned.")
            .state(&self.topic)
    }
}

/// Wraps one broker client and tracks committed and pending offsets per
/// partition. Offsets are flushed through the persistence adapter at
/// `flush_offsets` cadence, not per acknowledgment.
pub struct LogConsumer {
    source_id: String,
    topic: String,
    client: Box<dyn BrokerClient>,
    persistence: Arc<dyn PersistenceAdapter>,
    metrics: Arc<dyn MetricsSink>,
    tracker: Arc<Mutex<CommitTracker>>,
    claimed: Vec<i32>,
    active: BTreeSet<i32>,
}

impl fmt::Debug for LogConsumer {
    fn fmt(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
        formatter
            .debug_struct("LogConsumer")
            .field("source_id", &self.source_id)
            .field("topic", &self.topic)
            .field("claimed", &self.claimed)
            .finish()
    }
}

impl LogConsumer {
    pub fn new(
        source_id: impl Into<String>,
        topic: impl Into<String>,
        client: Box<dyn BrokerClient>,
        persistence: Arc<dyn PersistenceAdapter>,
        metrics: Arc<dyn MetricsSink>,
    ) -> Self {
        Self {
            source_id: source_id.into(),
            topic: topic.into(),
            client,
            persistence,
            metrics,
            tracker: Arc::new(Mutex::new(CommitTracker::default())),
            claimed: Vec::new(),
            active: BTreeSet::new(),
        }
    }

    fn tracker(&self) -> MutexGuard<'_, CommitTracker> {
        self.tracker
            .lock()
            .expect("The commit tracker lock should not be poisoned.")
    }

    /// Claims the partitions `p` with `p % total_tasks == task_index` and
    /// seeks each to `floor + 1`, where the floor comes from the persisted
    /// consumer state when present, else from `starting_state`, else from the
    /// broker-resolved default.
    pub async fn open(
        &mut self,
        starting_state: &OffsetMap,
        task_index: u32,
        total_tasks: u32,
    ) -> anyhow::Result<()> {
        let all_partitions = self.client.partitions(&self.topic).await?;
        let claimed: Vec<i32> = all_partitions
            .into_iter()
            .filter(|partition| partition.rem_euclid(total_tasks as i32) == task_index as i32)
            .collect();

        let mut seeks = Vec::with_capacity(claimed.len());
        for &partition in &claimed {
            let key = PartitionKey::new(self.topic.clone(), partition);
            let persisted = self
                .persistence
                .retrieve_consumer_offset(&self.source_id, partition)
                .await?;
            match persisted.or_else(|| starting_state.get(&key)) {
                Some(floor) => {
                    self.tracker().seed(partition, floor);
                    seeks.push((partition, SeekPosition::At(floor + 1)));
                }
                None => {
                    self.tracker().claim(partition);
                    seeks.push((partition, SeekPosition::Default));
                }
            }
        }
        self.client.assign(&self.topic, &seeks).await?;
        self.active = claimed.iter().copied().collect();
        debug!(source_id = %self.source_id, topic = %self.topic, partitions = ?claimed, "Assigned partitions.");
        self.claimed = claimed;
        Ok(())
    }

    pub async fn next_record(&mut self) -> anyhow::Result<Option<RawRecord>> {
        let record = self.client.poll().await?;
        if let Some(record) = &record {
            self.tracker().anchor(record.partition, record.offset);
        }
        Ok(record)
    }

    /// Marks the offset fully processed. The persisted floor advances only
    /// over the contiguous acknowledged prefix.
    pub fn commit_offset(&self, partition: i32, offset: i64) {
        self.tracker().commit(partition, offset);
    }

    /// Persists the floors that moved since the last flush. Persistence
    /// errors are logged and counted; the in-memory floor still stands, so
    /// progress is preserved at the cost of potential replay on restart.
    pub async fn flush_offsets(&mut self) {
        let dirty = self.tracker().take_dirty();
        for (partition, floor) in dirty {
            if let Err(error) = self
                .persistence
                .persist_consumer_offset(&self.source_id, partition, floor)
                .await
            {
                warn!(
                    source_id = %self.source_id,
                    partition = %partition,
                    error = %error,
                    "Failed to persist consumer offset."
                );
                self.metrics.count(&self.source_id, "offset_persist_errors", 1);
                self.tracker().mark_dirty(partition);
            }
        }
    }

    /// Removes the partition from active polling. Idempotent.
    pub async fn unsubscribe_partition(&mut self, partition: i32) -> anyhow::Result<bool> {
        if !self.active.remove(&partition) {
            return Ok(false);
        }
        self.client.unassign(&self.topic, partition).await?;
        Ok(true)
    }

    pub async fn unsubscribe_all(&mut self) -> anyhow::Result<()> {
        let active: Vec<i32> = self.active.iter().copied().collect();
        for partition in active {
            self.unsubscribe_partition(partition).await?;
        }
        Ok(())
    }

    pub fn committed_floor(&self, partition: i32) -> Option<i64> {
        self.tracker().floor(partition)
    }

    pub fn current_state(&self) -> OffsetMap {
        self.tracker().state(&self.topic)
    }

    pub fn state_handle(&self) -> ConsumerStateHandle {
        ConsumerStateHandle {
            topic: self.topic.clone(),
            tracker: self.tracker.clone(),
        }
    }

    pub fn claimed_partitions(&self) -> &[i32] {
        &self.claimed
    }

    /// Clears the persisted offsets of this source across all claimed
    /// partitions.
    pub async fn remove_consumer_state(&mut self) {
        for &partition in &self.claimed {
            if let Err(error) = self
                .persistence
                .clear_consumer_offset(&self.source_id, partition)
                .await
            {
                warn!(
                    source_id = %self.source_id,
                    partition = %partition,
                    error = %error,
                    "Failed to clear persisted consumer offset."
                );
            }
        }
    }

    /// Releases the broker client assignment. Best effort.
    pub async fn release(&mut self) {
        if let Err(error) = self.unsubscribe_all().await {
            warn!(source_id = %self.source_id, error = %error, "Failed to release broker assignment.");
        }
    }
}
