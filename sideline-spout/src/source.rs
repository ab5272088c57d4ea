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
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde_json::json;
use sideline_persistence::PersistenceAdapter;
use tracing::{debug, info, warn};

use crate::consumer::LogConsumer;
use crate::deserializer::Deserializer;
use crate::filter::FilterChainHandle;
use crate::metrics::MetricsSink;
use crate::models::{Message, MessageId};
use crate::offsets::OffsetMap;
use crate::retry::RetryManager;
use crate::{SpoutError, SpoutResult};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SourceState {
    New,
    Running,
    /// A bounded source that consumed its whole range and requested stop.
    Completing,
    Closed,
}

impl SourceState {
    fn as_str(&self) -> &'static str {
        match self {
            SourceState::New => "NEW",
            SourceState::Running => "RUNNING",
            SourceState::Completing => "COMPLETING",
            SourceState::Closed => "CLOSED",
        }
    }
}

#[derive(Clone, Debug, Default)]
struct SourceCounters {
    num_emitted: u64,
    num_diverted: u64,
    num_invalid: u64,
    num_retries_emitted: u64,
    num_retries_exhausted: u64,
}

pub struct VirtualSourceParams {
    pub source_id: String,
    pub topic: String,
    pub consumer: LogConsumer,
    pub filter_chain: FilterChainHandle,
    pub retry_manager: Box<dyn RetryManager>,
    pub deserializer: Arc<dyn Deserializer>,
    pub persistence: Arc<dyn PersistenceAdapter>,
    pub metrics: Arc<dyn MetricsSink>,
    pub starting_state: OffsetMap,
    /// Present on bounded (replay) sources only.
    pub ending_state: Option<OffsetMap>,
    /// The sideline identifier a replay source cleans up on completion.
    pub sideline_id: Option<String>,
    pub task_index: u32,
    pub total_tasks: u32,
}

/// One logical producer of messages: a consumer, a filter chain and a retry
/// manager, with optional start/end bounds. Not internally concurrent: only
/// its worker invokes it, except `request_stop` which is safe from any
/// thread.
pub struct VirtualSource {
    source_id: String,
    topic: String,
    consumer: LogConsumer,
    filter_chain: FilterChainHandle,
    retry_manager: Box<dyn RetryManager>,
    deserializer: Arc<dyn Deserializer>,
    persistence: Arc<dyn PersistenceAdapter>,
    metrics: Arc<dyn MetricsSink>,
    starting_state: OffsetMap,
    ending_state: Option<OffsetMap>,
    sideline_id: Option<String>,
    task_index: u32,
    total_tasks: u32,
    tracked: HashMap<MessageId, Message>,
    state: SourceState,
    stop: Arc<AtomicBool>,
    counters: SourceCounters,
}

impl fmt::Debug for VirtualSource {
    fn fmt(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
        formatter
            .debug_struct("VirtualSource")
            .field("source_id", &self.source_id)
            .field("state", &self.state)
            .field("bounded", &self.ending_state.is_some())
            .finish()
    }
}

impl VirtualSource {
    pub fn new(params: VirtualSourceParams) -> Self {
        Self {
            source_id: params.source_id,
            topic: params.topic,
            consumer: params.consumer,
            filter_chain: params.filter_chain,
            retry_manager: params.retry_manager,
            deserializer: params.deserializer,
            persistence: params.persistence,
            metrics: params.metrics,
            starting_state: params.starting_state,
            ending_state: params.ending_state,
            sideline_id: params.sideline_id,
            task_index: params.task_index,
            total_tasks: params.total_tasks,
            tracked: HashMap::new(),
            state: SourceState::New,
            stop: Arc::new(AtomicBool::new(false)),
            counters: SourceCounters::default(),
        }
    }

    pub fn source_id(&self) -> &str {
        &self.source_id
    }

    pub fn state(&self) -> SourceState {
        self.state
    }

    pub fn is_bounded(&self) -> bool {
        self.ending_state.is_some()
    }

    pub fn filter_chain(&self) -> FilterChainHandle {
        self.filter_chain.clone()
    }

    pub fn consumer(&self) -> &LogConsumer {
        &self.consumer
    }

    pub fn stop_flag(&self) -> Arc<AtomicBool> {
        self.stop.clone()
    }

    pub fn request_stop(&self) {
        self.stop.store(true, Ordering::Release);
    }

    pub fn stop_requested(&self) -> bool {
        self.stop.load(Ordering::Acquire)
    }

    /// Opens the consumer. Exactly once.
    pub async fn open(&mut self) -> SpoutResult<()> {
        if self.state != SourceState::New {
            return Err(SpoutError::Precondition(format!(
                "Source `{}` is already open.",
                self.source_id
            )));
        }
        self.consumer
            .open(&self.starting_state, self.task_index, self.total_tasks)
            .await
            .map_err(SpoutError::Broker)?;
        self.state = SourceState::Running;
        info!(
            source_id = %self.source_id,
            topic = %self.topic,
            bounded = %self.is_bounded(),
            "Opened virtual source."
        );
        Ok(())
    }

    /// The next message to emit, or ⊥ when nothing is ready. Retry-eligible
    /// tracked messages take precedence over fresh records.
    pub async fn next_message(&mut self) -> anyhow::Result<Option<Message>> {
        if self.state != SourceState::Running {
            return Ok(None);
        }

        while let Some(message_id) = self.retry_manager.next_eligible() {
            if let Some(message) = self.tracked.get(&message_id) {
                let message = message.clone();
                self.counters.num_retries_emitted += 1;
                self.metrics.count(&self.source_id, "retries_emitted", 1);
                return Ok(Some(message));
            }
            // Spuriously failed: the id is not tracked, nothing to re-emit.
            debug!(source_id = %self.source_id, message_id = %message_id, "Dropping untracked retry.");
            self.retry_manager.acked(&message_id);
        }

        let record = match self.consumer.next_record().await? {
            Some(record) => record,
            None => return Ok(None),
        };
        let message_id = MessageId {
            topic: record.topic.clone(),
            partition: record.partition,
            offset: record.offset,
            source_id: self.source_id.clone(),
        };

        if let Some(ending_state) = &self.ending_state {
            let bound = ending_state.get(&message_id.partition_key()).unwrap_or(-1);
            if record.offset > bound {
                // Past the replay range: the record is discarded unacked and
                // the partition stops being polled.
                self.consumer.unsubscribe_partition(record.partition).await?;
                debug!(
                    source_id = %self.source_id,
                    partition = %record.partition,
                    offset = %record.offset,
                    "Reached the end of the replay range."
                );
                return Ok(None);
            }
        }

        let value = match self.deserializer.deserialize(
            &record.topic,
            record.partition,
            record.offset,
            record.key.as_deref(),
            record.payload.as_deref(),
        ) {
            Some(value) => value,
            None => {
                self.counters.num_invalid += 1;
                self.metrics.count(&self.source_id, "invalid_records", 1);
                self.consumer.commit_offset(record.partition, record.offset);
                return Ok(None);
            }
        };
        let message = Message {
            id: message_id,
            value,
        };

        if self.filter_chain.load().matches(&message) {
            // Diverted: self-ack so the firehose floor advances past it. The
            // record is re-delivered later by the negated replay source.
            self.counters.num_diverted += 1;
            self.metrics.count(&self.source_id, "diverted", 1);
            self.consumer.commit_offset(message.id.partition, message.id.offset);
            return Ok(None);
        }

        self.counters.num_emitted += 1;
        self.metrics.count(&self.source_id, "emitted", 1);
        self.tracked.insert(message.id.clone(), message.clone());
        Ok(Some(message))
    }

    /// Idempotent: acking an already acked message has no effect.
    pub fn ack(&mut self, message_id: &MessageId) {
        self.consumer
            .commit_offset(message_id.partition, message_id.offset);
        self.tracked.remove(message_id);
        self.retry_manager.acked(message_id);
    }

    pub fn fail(&mut self, message_id: &MessageId) {
        if !self.tracked.contains_key(message_id) {
            warn!(source_id = %self.source_id, message_id = %message_id, "Failed message is not tracked.");
            return;
        }
        if self.retry_manager.retry_further(message_id) {
            self.retry_manager.failed(message_id);
        } else {
            // Do not block progress on a poison pill: exhausted retries are
            // treated as acked.
            self.counters.num_retries_exhausted += 1;
            self.metrics.count(&self.source_id, "retries_exhausted", 1);
            self.ack(message_id);
        }
    }

    pub async fn flush(&mut self) {
        let flush_start = std::time::Instant::now();
        self.consumer.flush_offsets().await;
        self.metrics.timer(
            &self.source_id,
            "flush_millis",
            flush_start.elapsed().as_millis() as u64,
        );
        self.metrics
            .gauge(&self.source_id, "tracked_messages", self.tracked.len() as i64);
        self.attempt_complete().await;
    }

    /// A bounded source that has acked its whole range unsubscribes all
    /// partitions and requests stop.
    async fn attempt_complete(&mut self) {
        if self.state != SourceState::Running || !self.is_bounded() {
            return;
        }
        if !self.tracked.is_empty() {
            return;
        }
        let ending_state = self
            .ending_state
            .clone()
            .expect("A bounded source should hold an ending state.");
        for (key, ending_offset) in ending_state.iter() {
            if key.topic != self.topic {
                continue;
            }
            let floor = self.consumer.committed_floor(key.partition).unwrap_or(-1);
            if floor < ending_offset {
                return;
            }
        }
        if let Err(error) = self.consumer.unsubscribe_all().await {
            warn!(source_id = %self.source_id, error = %error, "Failed to unsubscribe on completion.");
        }
        self.state = SourceState::Completing;
        self.request_stop();
        info!(source_id = %self.source_id, "Replay range fully acknowledged, completing.");
    }

    /// A completing source clears its durable traces; any other source
    /// flushes its floors. The consumer is always released.
    pub async fn close(&mut self) {
        match self.state {
            SourceState::Closed => return,
            SourceState::Completing => {
                self.consumer.remove_consumer_state().await;
                if let Some(identifier) = self.sideline_id.clone() {
                    let starting_state = self.starting_state.clone();
                    for key in starting_state.partitions() {
                        if key.topic != self.topic {
                            continue;
                        }
                        if let Err(error) = self
                            .persistence
                            .clear_sideline_request(&identifier, key.partition)
                            .await
                        {
                            warn!(
                                source_id = %self.source_id,
                                identifier = %identifier,
                                partition = %key.partition,
                                error = %error,
                                "Failed to clear persisted sideline request."
                            );
                        }
                    }
                }
            }
            _ => {
                self.consumer.flush_offsets().await;
            }
        }
        self.consumer.release().await;
        self.state = SourceState::Closed;
        info!(source_id = %self.source_id, "Closed virtual source.");
    }

    pub fn observable_state(&self) -> serde_json::Value {
        let current_positions: Vec<(i32, i64)> = self
            .consumer
            .current_state()
            .iter()
            .map(|(key, offset)| (key.partition, offset))
            .collect();
        json!({
            "source_id": self.source_id,
            "topic": self.topic,
            "state": self.state.as_str(),
            "bounded": self.is_bounded(),
            "current_positions": current_positions,
            "num_tracked": self.tracked.len(),
            "num_emitted": self.counters.num_emitted,
            "num_diverted": self.counters.num_diverted,
            "num_invalid": self.counters.num_invalid,
            "num_retries_emitted": self.counters.num_retries_emitted,
            "num_retries_exhausted": self.counters.num_retries_exhausted,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::json;
    use sideline_persistence::{InMemoryAdapter, SidelineRequestRecord, SidelineRequestType};

    use super::*;
    use crate::consumer::{MemLog, MemLogClient};
    use crate::deserializer::JsonDeserializer;
    use crate::filter::{FilterChain, FilterStep};
    use crate::metrics::NoopMetricsSink;
    use crate::offsets::PartitionKey;
    use crate::retry::{ExponentialBackoffRetry, ManualClock, NeverRetry};

    struct Fixture {
        log: MemLog,
        persistence: Arc<InMemoryAdapter>,
    }

    impl Fixture {
        async fn new() -> Self {
            let log = MemLog::new();
            log.create_topic("events", 1);
            let persistence = Arc::new(InMemoryAdapter::new());
            persistence.open().await.unwrap();
            Self { log, persistence }
        }

        fn source(
            &self,
            source_id: &str,
            params_fn: impl FnOnce(&mut VirtualSourceParams),
        ) -> VirtualSource {
            let consumer = LogConsumer::new(
                source_id,
                "events",
                Box::new(MemLogClient::new(self.log.clone())),
                self.persistence.clone(),
                Arc::new(NoopMetricsSink),
            );
            let mut params = VirtualSourceParams {
                source_id: source_id.to_string(),
                topic: "events".to_string(),
                consumer,
                filter_chain: FilterChainHandle::default(),
                retry_manager: Box::new(NeverRetry),
                deserializer: Arc::new(JsonDeserializer),
                persistence: self.persistence.clone(),
                metrics: Arc::new(NoopMetricsSink),
                starting_state: OffsetMap::new(),
                ending_state: None,
                sideline_id: None,
                task_index: 0,
                total_tasks: 1,
            };
            params_fn(&mut params);
            VirtualSource::new(params)
        }
    }

    fn produce_values(log: &MemLog, values: &[i64]) {
        for (n, value) in values.iter().enumerate() {
            log.produce_json("events", 0, &n.to_string(), &json!({"v": value}));
        }
    }

    #[tokio::test]
    async fn test_double_open_is_a_precondition_error() {
        let fixture = Fixture::new().await;
        let mut source = fixture.source("firehose-0", |_| {});
        source.open().await.unwrap();
        let error = source.open().await.unwrap_err();
        assert!(matches!(error, SpoutError::Precondition(_)));
    }

    #[tokio::test]
    async fn test_firehose_pass_through() -> anyhow::Result<()> {
        let fixture = Fixture::new().await;
        produce_values(&fixture.log, &[1, 2, 3]);
        let mut source = fixture.source("firehose-0", |_| {});
        source.open().await?;

        let mut emitted = Vec::new();
        while let Some(message) = source.next_message().await? {
            emitted.push(message);
        }
        let values: Vec<&serde_json::Value> =
            emitted.iter().map(|message| &message.value["v"]).collect();
        assert_eq!(values, vec![&json!(1), &json!(2), &json!(3)]);

        for message in &emitted {
            source.ack(&message.id);
        }
        source.flush().await;
        assert_eq!(
            fixture
                .persistence
                .retrieve_consumer_offset("firehose-0", 0)
                .await?,
            Some(2)
        );
        let observed = source.observable_state();
        assert_eq!(observed["num_emitted"], json!(3));
        assert_eq!(observed["state"], json!("RUNNING"));
        assert_eq!(observed["current_positions"], json!([[0, 2]]));
        Ok(())
    }

    #[tokio::test]
    async fn test_invalid_record_is_self_acked() -> anyhow::Result<()> {
        let fixture = Fixture::new().await;
        fixture.log.produce("events", 0, None, Some(b"{broken".to_vec()));
        fixture
            .log
            .produce_json("events", 0, "k", &json!({"v": 1}));
        let mut source = fixture.source("firehose-0", |_| {});
        source.open().await?;

        // The corrupted record yields ⊥ but commits its offset.
        assert_eq!(source.next_message().await?, None);
        let message = source.next_message().await?.unwrap();
        assert_eq!(message.id.offset, 1);
        source.ack(&message.id);
        source.flush().await;
        assert_eq!(
            fixture
                .persistence
                .retrieve_consumer_offset("firehose-0", 0)
                .await?,
            Some(1)
        );
        Ok(())
    }

    #[tokio::test]
    async fn test_filter_match_diverts() -> anyhow::Result<()> {
        let fixture = Fixture::new().await;
        produce_values(&fixture.log, &[1, 2, 3]);
        let chain = {
            let mut chain = FilterChain::default();
            chain.add_steps(
                "01H",
                vec![FilterStep::Equals {
                    field: "v".to_string(),
                    value: json!(2),
                }],
            );
            FilterChainHandle::new(chain)
        };
        let mut source = fixture.source("firehose-0", |params| params.filter_chain = chain);
        source.open().await?;

        let mut emitted = Vec::new();
        while let Some(message) = source.next_message().await? {
            source.ack(&message.id);
            emitted.push(message.value["v"].clone());
        }
        assert_eq!(emitted, vec![json!(1), json!(3)]);
        // The diverted record was self-acked: the floor covers it.
        source.flush().await;
        assert_eq!(
            fixture
                .persistence
                .retrieve_consumer_offset("firehose-0", 0)
                .await?,
            Some(2)
        );
        Ok(())
    }

    #[tokio::test]
    async fn test_bounded_source_stops_at_ending_state() -> anyhow::Result<()> {
        let fixture = Fixture::new().await;
        produce_values(&fixture.log, &[1, 2, 3, 4, 5]);
        let mut ending_state = OffsetMap::new();
        ending_state.set(PartitionKey::new("events", 0), 2);
        let mut source = fixture.source("firehose-0", |params| {
            params.ending_state = Some(ending_state.clone());
        });
        source.open().await?;

        let mut emitted = Vec::new();
        while let Some(message) = source.next_message().await? {
            emitted.push(message.id.offset);
        }
        // Offsets 0..=2 are emitted; offset 3 crossed the bound and
        // unsubscribed the partition.
        assert_eq!(emitted, vec![0, 1, 2]);
        assert_eq!(source.next_message().await?, None);
        Ok(())
    }

    #[tokio::test]
    async fn test_bounded_completion_clears_durable_traces() -> anyhow::Result<()> {
        let fixture = Fixture::new().await;
        produce_values(&fixture.log, &[1, 2]);
        let record = SidelineRequestRecord {
            request_type: SidelineRequestType::Stop,
            steps_blob: b"[]".to_vec(),
            starting_offset: -1,
            ending_offset: Some(1),
        };
        fixture
            .persistence
            .persist_sideline_request("01H", 0, &record)
            .await?;

        let mut starting_state = OffsetMap::new();
        starting_state.set(PartitionKey::new("events", 0), -1);
        let mut ending_state = OffsetMap::new();
        ending_state.set(PartitionKey::new("events", 0), 1);
        let mut source = fixture.source("firehose-0_01H", |params| {
            params.starting_state = starting_state.clone();
            params.ending_state = Some(ending_state.clone());
            params.sideline_id = Some("01H".to_string());
        });
        source.open().await?;

        while let Some(message) = source.next_message().await? {
            let id = message.id.clone();
            source.ack(&id);
        }
        source.flush().await;
        assert_eq!(source.state(), SourceState::Completing);
        assert!(source.stop_requested());

        source.close().await;
        assert_eq!(source.state(), SourceState::Closed);
        assert!(fixture
            .persistence
            .list_sideline_identifiers()
            .await?
            .is_empty());
        assert_eq!(
            fixture
                .persistence
                .retrieve_consumer_offset("firehose-0_01H", 0)
                .await?,
            None
        );
        Ok(())
    }

    #[tokio::test]
    async fn test_empty_bounded_range_completes_immediately() -> anyhow::Result<()> {
        let fixture = Fixture::new().await;
        produce_values(&fixture.log, &[1, 2, 3]);
        let mut bounds = OffsetMap::new();
        bounds.set(PartitionKey::new("events", 0), 1);
        let mut source = fixture.source("firehose-0", |params| {
            params.starting_state = bounds.clone();
            params.ending_state = Some(bounds.clone());
        });
        source.open().await?;
        source.flush().await;
        assert_eq!(source.state(), SourceState::Completing);
        Ok(())
    }

    #[tokio::test]
    async fn test_retry_and_exhaustion() -> anyhow::Result<()> {
        let fixture = Fixture::new().await;
        produce_values(&fixture.log, &[1]);
        let clock = ManualClock::default();
        let retry = ExponentialBackoffRetry::new(
            2,
            Duration::from_millis(10),
            2.0,
            Arc::new(clock.clone()),
        );
        let mut source = fixture.source("firehose-0", |params| params.retry_manager = Box::new(retry));
        source.open().await?;

        let message = source.next_message().await?.unwrap();
        let id = message.id.clone();

        // First failure: replayed after 10 virtual milliseconds.
        source.fail(&id);
        assert_eq!(source.next_message().await?, None);
        clock.advance(Duration::from_millis(10));
        assert_eq!(source.next_message().await?.unwrap().id, id);

        // Second failure: replayed after 20 more.
        source.fail(&id);
        clock.advance(Duration::from_millis(20));
        assert_eq!(source.next_message().await?.unwrap().id, id);

        // Third failure exhausts the budget and self-acks.
        source.fail(&id);
        assert_eq!(source.next_message().await?, None);
        source.flush().await;
        assert_eq!(
            fixture
                .persistence
                .retrieve_consumer_offset("firehose-0", 0)
                .await?,
            Some(0)
        );
        Ok(())
    }

    #[tokio::test]
    async fn test_ack_is_idempotent() -> anyhow::Result<()> {
        let fixture = Fixture::new().await;
        produce_values(&fixture.log, &[1, 2]);
        let mut source = fixture.source("firehose-0", |_| {});
        source.open().await?;
        let first = source.next_message().await?.unwrap();
        source.ack(&first.id);
        source.ack(&first.id);
        source.flush().await;
        assert_eq!(
            fixture
                .persistence
                .retrieve_consumer_offset("firehose-0", 0)
                .await?,
            Some(0)
        );
        Ok(())
    }
}
