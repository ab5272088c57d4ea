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

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;

use super::{BrokerClient, BrokerConnector, RawRecord, SeekPosition};

#[derive(Clone, Debug)]
struct MemRecord {
    key: Option<Vec<u8>>,
    payload: Option<Vec<u8>>,
}

#[derive(Debug, Default)]
struct MemLogInner {
    /// topic -> partitions -> append-only record log.
    topics: HashMap<String, Vec<Vec<MemRecord>>>,
}

/// In-memory partitioned log. Offsets are positions in the per-partition
/// vector, monotonically increasing from 0. Cloning shares the log.
#[derive(Clone, Debug, Default)]
pub struct MemLog {
    inner: Arc<Mutex<MemLogInner>>,
}

impl MemLog {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MemLogInner> {
        self.inner
            .lock()
            .expect("The in-memory log lock should not be poisoned.")
    }

    pub fn create_topic(&self, topic: &str, num_partitions: usize) {
        let mut inner = self.lock();
        let partitions = inner.topics.entry(topic.to_string()).or_default();
        if partitions.len() < num_partitions {
            partitions.resize_with(num_partitions, Vec::new);
        }
    }

    /// Appends a record and returns its offset. Unknown topics and partitions
    /// are created on the fly.
    pub fn produce(
        &self,
        topic: &str,
        partition: i32,
        key: Option<Vec<u8>>,
        payload: Option<Vec<u8>>,
    ) -> i64 {
        let mut inner = self.lock();
        let partitions = inner.topics.entry(topic.to_string()).or_default();
        let index = partition as usize;
        if partitions.len() <= index {
            partitions.resize_with(index + 1, Vec::new);
        }
        let log = &mut partitions[index];
        log.push(MemRecord { key, payload });
        (log.len() - 1) as i64
    }

    pub fn produce_json(
        &self,
        topic: &str,
        partition: i32,
        key: &str,
        value: &serde_json::Value,
    ) -> i64 {
        self.produce(
            topic,
            partition,
            Some(key.as_bytes().to_vec()),
            Some(value.to_string().into_bytes()),
        )
    }

    /// The next offset to be produced to the partition.
    pub fn end_offset(&self, topic: &str, partition: i32) -> i64 {
        self.lock()
            .topics
            .get(topic)
            .and_then(|partitions| partitions.get(partition as usize))
            .map(|log| log.len() as i64)
            .unwrap_or(0)
    }

    fn num_partitions(&self, topic: &str) -> usize {
        self.lock()
            .topics
            .get(topic)
            .map(|partitions| partitions.len())
            .unwrap_or(0)
    }

    fn record_at(&self, topic: &str, partition: i32, offset: i64) -> Option<RawRecord> {
        self.lock()
            .topics
            .get(topic)
            .and_then(|partitions| partitions.get(partition as usize))
            .and_then(|log| log.get(offset as usize))
            .map(|record| RawRecord {
                topic: topic.to_string(),
                partition,
                offset,
                key: record.key.clone(),
                payload: record.payload.clone(),
            })
    }
}

impl BrokerConnector for MemLog {
    fn connect(&self, _source_id: &str) -> anyhow::Result<Box<dyn BrokerClient>> {
        Ok(Box::new(MemLogClient::new(self.clone())))
    }
}

/// One logical consumer over a [`MemLog`] with its own cursors.
#[derive(Debug)]
pub struct MemLogClient {
    log: MemLog,
    assignment: Vec<(String, i32)>,
    cursors: HashMap<(String, i32), i64>,
    next_poll_index: usize,
}

impl MemLogClient {
    pub fn new(log: MemLog) -> Self {
        Self {
            log,
            assignment: Vec::new(),
            cursors: HashMap::new(),
            next_poll_index: 0,
        }
    }
}

#[async_trait]
impl BrokerClient for MemLogClient {
    async fn partitions(&self, topic: &str) -> anyhow::Result<Vec<i32>> {
        Ok((0..self.log.num_partitions(topic) as i32).collect())
    }

    async fn assign(&mut self, topic: &str, seeks: &[(i32, SeekPosition)]) -> anyhow::Result<()> {
        self.assignment.retain(|(assigned_topic, _)| assigned_topic != topic);
        for &(partition, seek) in seeks {
            let cursor = match seek {
                // The broker-resolved default of the in-memory log is the
                // beginning of the partition.
                SeekPosition::Default => 0,
                SeekPosition::At(offset) => offset.max(0),
            };
            self.assignment.push((topic.to_string(), partition));
            self.cursors.insert((topic.to_string(), partition), cursor);
        }
        self.next_poll_index = 0;
        Ok(())
    }

    async fn poll(&mut self) -> anyhow::Result<Option<RawRecord>> {
        if self.assignment.is_empty() {
            return Ok(None);
        }
        for step in 0..self.assignment.len() {
            let index = (self.next_poll_index + step) % self.assignment.len();
            let (topic, partition) = self.assignment[index].clone();
            let cursor = self
                .cursors
                .entry((topic.clone(), partition))
                .or_insert(0);
            if let Some(record) = self.log.record_at(&topic, partition, *cursor) {
                *cursor += 1;
                self.next_poll_index = index + 1;
                return Ok(Some(record));
            }
        }
        Ok(None)
    }

    async fn unassign(&mut self, topic: &str, partition: i32) -> anyhow::Result<bool> {
        let before = self.assignment.len();
        self.assignment
            .retain(|(assigned_topic, assigned_partition)| {
                !(assigned_topic == topic && *assigned_partition == partition)
            });
        self.next_poll_index = 0;
        Ok(self.assignment.len() != before)
    }
}
