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

use std::fmt;
use std::sync::Arc;

use sideline_config::RetryConfig;
use sideline_persistence::{PersistenceAdapter, SidelineRequestRecord, SidelineRequestType};
use tracing::{info, warn};
use ulid::Ulid;

use crate::consumer::{BrokerConnector, ConsumerStateHandle, LogConsumer};
use crate::coordinator::Coordinator;
use crate::deserializer::Deserializer;
use crate::filter::{decode_steps, encode_steps, FilterChain, FilterChainHandle, FilterStep};
use crate::metrics::MetricsSink;
use crate::offsets::{OffsetMap, PartitionKey};
use crate::registry::retry_manager_from_config;
use crate::retry::Clock;
use crate::source::{VirtualSource, VirtualSourceParams};
use crate::{SpoutError, SpoutResult};

/// A sideline request as handed in by an external trigger: the predicate list
/// to divert (on start) or to stop diverting (on stop).
#[derive(Clone, Debug, PartialEq)]
pub struct SidelineRequest {
    pub steps: Vec<FilterStep>,
}

pub struct SidelineControllerParams {
    pub firehose_id: String,
    pub topic: String,
    pub firehose_chain: FilterChainHandle,
    pub firehose_state: ConsumerStateHandle,
    pub coordinator: Coordinator,
    pub persistence: Arc<dyn PersistenceAdapter>,
    pub broker: Arc<dyn BrokerConnector>,
    pub deserializer: Arc<dyn Deserializer>,
    pub metrics: Arc<dyn MetricsSink>,
    pub retry_config: RetryConfig,
    pub clock: Arc<dyn Clock>,
    pub task_index: u32,
    pub total_tasks: u32,
}

/// Responds to start/stop triggers: mutates the firehose filter chain,
/// persists sideline payloads, and hands bounded replay sources to the
/// coordinator. The in-memory chain is only mutated after the payload is
/// safely persisted.
pub struct SidelineController {
    firehose_id: String,
    topic: String,
    firehose_chain: FilterChainHandle,
    firehose_state: ConsumerStateHandle,
    coordinator: Coordinator,
    persistence: Arc<dyn PersistenceAdapter>,
    broker: Arc<dyn BrokerConnector>,
    deserializer: Arc<dyn Deserializer>,
    metrics: Arc<dyn MetricsSink>,
    retry_config: RetryConfig,
    clock: Arc<dyn Clock>,
    task_index: u32,
    total_tasks: u32,
}

impl fmt::Debug for SidelineController {
    fn fmt(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
        formatter
            .debug_struct("SidelineController")
            .field("firehose_id", &self.firehose_id)
            .field("topic", &self.topic)
            .finish()
    }
}

impl SidelineController {
    pub fn new(params: SidelineControllerParams) -> Self {
        Self {
            firehose_id: params.firehose_id,
            topic: params.topic,
            firehose_chain: params.firehose_chain,
            firehose_state: params.firehose_state,
            coordinator: params.coordinator,
            persistence: params.persistence,
            broker: params.broker,
            deserializer: params.deserializer,
            metrics: params.metrics,
            retry_config: params.retry_config,
            clock: params.clock,
            task_index: params.task_index,
            total_tasks: params.total_tasks,
        }
    }

    fn replay_source_id(&self, identifier: &str) -> String {
        format!("{}_{}", self.firehose_id, identifier)
    }

    /// Attaches the requested filter to the firehose, recording the attach
    /// moment per partition. Returns the fresh sideline identifier.
    pub async fn start_sideline(&self, request: SidelineRequest) -> SpoutResult<String> {
        if request.steps.is_empty() {
            return Err(SpoutError::Precondition(
                "A sideline request must carry at least one filter step.".to_string(),
            ));
        }
        let identifier = Ulid::new().to_string();
        let starting_state = self.firehose_state.current_state();
        let steps_blob = encode_steps(&request.steps);
        for (key, offset) in starting_state.iter() {
            if key.topic != self.topic {
                continue;
            }
            let record = SidelineRequestRecord {
                request_type: SidelineRequestType::Start,
                steps_blob: steps_blob.clone(),
                starting_offset: offset,
                ending_offset: None,
            };
            self.persistence
                .persist_sideline_request(&identifier, key.partition, &record)
                .await?;
        }
        self.firehose_chain.add_steps(&identifier, request.steps);
        self.metrics.count(&self.firehose_id, "sidelines_started", 1);
        info!(identifier = %identifier, starting_state = ?starting_state, "Started sideline.");
        Ok(identifier)
    }

    /// Detaches the filter matching the request and spawns the bounded
    /// replay source over the recorded offset range, with the negated steps.
    /// A stop whose predicate is not currently attached is a no-op.
    pub async fn stop_sideline(&self, request: SidelineRequest) -> SpoutResult<()> {
        let identifier = match self.firehose_chain.find_by_steps(&request.steps) {
            Some(identifier) => identifier,
            None => {
                warn!("No sideline matches the stop request, ignoring it.");
                return Ok(());
            }
        };
        let ending_snapshot = self.firehose_state.current_state();
        let steps = self
            .firehose_chain
            .remove_steps(&identifier)
            .unwrap_or_default();
        let negated_steps: Vec<FilterStep> =
            steps.iter().cloned().map(FilterStep::negated).collect();

        // The starting bound is the filter-attach moment recorded in the
        // START payload; the snapshot above is only ever the ending bound.
        let mut starting_state = OffsetMap::new();
        for partition in self
            .persistence
            .list_sideline_partitions(&identifier)
            .await?
        {
            if let Some(record) = self
                .persistence
                .retrieve_sideline_request(&identifier, partition)
                .await?
            {
                starting_state.set(
                    PartitionKey::new(self.topic.clone(), partition),
                    record.starting_offset,
                );
            }
        }
        if starting_state.is_empty() {
            warn!(identifier = %identifier, "No persisted starting state for the sideline, nothing to replay.");
        }

        let steps_blob = encode_steps(&steps);
        let mut ending_state = OffsetMap::new();
        for (key, starting_offset) in starting_state.iter() {
            let ending_offset = ending_snapshot.get(key).unwrap_or(starting_offset);
            ending_state.set(key.clone(), ending_offset);
            let record = SidelineRequestRecord {
                request_type: SidelineRequestType::Stop,
                steps_blob: steps_blob.clone(),
                starting_offset,
                ending_offset: Some(ending_offset),
            };
            self.persistence
                .persist_sideline_request(&identifier, key.partition, &record)
                .await?;
        }

        let source =
            self.build_replay_source(&identifier, starting_state, ending_state, negated_steps)?;
        self.coordinator.add_replay_source(source).await?;
        self.metrics.count(&self.firehose_id, "sidelines_stopped", 1);
        info!(identifier = %identifier, "Stopped sideline, replay source started.");
        Ok(())
    }

    /// Replays the persisted sideline requests after a restart: START
    /// payloads re-attach their filters, STOP payloads re-spawn their bounded
    /// replay sources. Converges to the in-memory state before shutdown.
    pub async fn resume(&self) -> SpoutResult<()> {
        for identifier in self.persistence.list_sideline_identifiers().await? {
            let mut records = Vec::new();
            for partition in self
                .persistence
                .list_sideline_partitions(&identifier)
                .await?
            {
                if let Some(record) = self
                    .persistence
                    .retrieve_sideline_request(&identifier, partition)
                    .await?
                {
                    records.push((partition, record));
                }
            }
            let (request_type, steps) = match reconstitute(&identifier, &records) {
                Some(reconstituted) => reconstituted,
                None => continue,
            };
            match request_type {
                SidelineRequestType::Start => {
                    info!(identifier = %identifier, "Resuming sideline, re-attaching filter.");
                    self.firehose_chain.add_steps(&identifier, steps);
                }
                SidelineRequestType::Stop => {
                    let mut starting_state = OffsetMap::new();
                    let mut ending_state = OffsetMap::new();
                    for (partition, record) in &records {
                        let key = PartitionKey::new(self.topic.clone(), *partition);
                        starting_state.set(key.clone(), record.starting_offset);
                        ending_state
                            .set(key, record.ending_offset.unwrap_or(record.starting_offset));
                    }
                    let negated_steps: Vec<FilterStep> =
                        steps.into_iter().map(FilterStep::negated).collect();
                    info!(identifier = %identifier, "Resuming sideline, re-spawning replay source.");
                    let source = self.build_replay_source(
                        &identifier,
                        starting_state,
                        ending_state,
                        negated_steps,
                    )?;
                    self.coordinator.add_replay_source(source).await?;
                }
            }
        }
        Ok(())
    }

    fn build_replay_source(
        &self,
        identifier: &str,
        starting_state: OffsetMap,
        ending_state: OffsetMap,
        negated_steps: Vec<FilterStep>,
    ) -> SpoutResult<VirtualSource> {
        let source_id = self.replay_source_id(identifier);
        let client = self
            .broker
            .connect(&source_id)
            .map_err(SpoutError::Broker)?;
        let consumer = LogConsumer::new(
            source_id.clone(),
            self.topic.clone(),
            client,
            self.persistence.clone(),
            self.metrics.clone(),
        );
        let mut chain = FilterChain::default();
        chain.add_steps(identifier, negated_steps);
        let retry_manager = retry_manager_from_config(&self.retry_config, self.clock.clone())
            .map_err(|error| SpoutError::Configuration(error.to_string()))?;
        Ok(VirtualSource::new(VirtualSourceParams {
            source_id,
            topic: self.topic.clone(),
            consumer,
            filter_chain: FilterChainHandle::new(chain),
            retry_manager,
            deserializer: self.deserializer.clone(),
            persistence: self.persistence.clone(),
            metrics: self.metrics.clone(),
            starting_state,
            ending_state: Some(ending_state),
            sideline_id: Some(identifier.to_string()),
            task_index: self.task_index,
            total_tasks: self.total_tasks,
        }))
    }
}

/// Decodes the common steps blob of a request's partition records. Corrupted
/// blobs are skipped with a warning rather than wedging the resume.
fn reconstitute(
    identifier: &str,
    records: &[(i32, SidelineRequestRecord)],
) -> Option<(SidelineRequestType, Vec<FilterStep>)> {
    let (_, first) = records.first()?;
    match decode_steps(&first.steps_blob) {
        Ok(steps) => Some((first.request_type, steps)),
        Err(error) => {
            warn!(
                identifier = %identifier,
                error = %error,
                "Failed to decode the persisted filter steps, skipping the sideline."
            );
            None
        }
    }
}
