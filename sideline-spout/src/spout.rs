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
use std::time::Duration;

use sideline_config::SpoutConfig;
use sideline_persistence::PersistenceAdapter;
use tracing::info;

use crate::consumer::{BrokerConnector, LogConsumer};
use crate::controller::{SidelineController, SidelineControllerParams};
use crate::coordinator::{Coordinator, DEFAULT_JOIN_TIMEOUT};
use crate::filter::FilterChainHandle;
use crate::metrics::default_metrics;
use crate::models::{Message, MessageId};
use crate::offsets::OffsetMap;
use crate::registry::{
    buffer_from_config, deserializer_from_key, persistence_from_config, retry_manager_from_config,
};
use crate::retry::{Clock, SystemClock};
use crate::source::{VirtualSource, VirtualSourceParams};
use crate::{SpoutError, SpoutResult};

/// Host-provided output. Called at most once per `next_tuple`.
pub trait Emitter: Send + Sync {
    fn emit(&self, stream_id: &str, message: &Message);
}

/// The host-facing spout: wires the configuration, persistence, firehose,
/// coordinator and sideline controller together. Faults never reach the
/// host; `next_tuple` simply emits nothing and diagnostics go to logs and
/// metrics.
pub struct SidelineSpout {
    coordinator: Coordinator,
    controller: Arc<SidelineController>,
    emitter: Arc<dyn Emitter>,
    output_stream_id: String,
}

impl fmt::Debug for SidelineSpout {
    fn fmt(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
        formatter
            .debug_struct("SidelineSpout")
            .field("output_stream_id", &self.output_stream_id)
            .finish()
    }
}

impl SidelineSpout {
    /// Opens the spout with the persistence adapter named by the config.
    pub async fn open(
        config: SpoutConfig,
        broker: Arc<dyn BrokerConnector>,
        emitter: Arc<dyn Emitter>,
    ) -> SpoutResult<Self> {
        let persistence = persistence_from_config(&config.persistence, &config.consumer_id_prefix)
            .map_err(|error| SpoutError::Configuration(error.to_string()))?;
        Self::open_with(config, broker, emitter, persistence).await
    }

    /// Opens the spout over a caller-provided persistence adapter. Resumes
    /// any persisted sideline requests before the firehose starts pumping.
    pub async fn open_with(
        config: SpoutConfig,
        broker: Arc<dyn BrokerConnector>,
        emitter: Arc<dyn Emitter>,
        persistence: Arc<dyn PersistenceAdapter>,
    ) -> SpoutResult<Self> {
        config
            .validate()
            .map_err(|error| SpoutError::Configuration(error.to_string()))?;
        persistence.open().await?;

        let metrics = default_metrics();
        let deserializer = deserializer_from_key(&config.deserializer)
            .map_err(|error| SpoutError::Configuration(error.to_string()))?;
        let buffer = buffer_from_config(&config.buffer)
            .map_err(|error| SpoutError::Configuration(error.to_string()))?;
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);

        let firehose_id = config.firehose_source_id();
        let client = broker
            .connect(&firehose_id)
            .map_err(SpoutError::Broker)?;
        let consumer = LogConsumer::new(
            firehose_id.clone(),
            config.broker.topic.clone(),
            client,
            persistence.clone(),
            metrics.clone(),
        );
        let firehose_chain = FilterChainHandle::default();
        let firehose_state = consumer.state_handle();
        let retry_manager = retry_manager_from_config(&config.retry, clock.clone())
            .map_err(|error| SpoutError::Configuration(error.to_string()))?;
        let firehose = VirtualSource::new(VirtualSourceParams {
            source_id: firehose_id.clone(),
            topic: config.broker.topic.clone(),
            consumer,
            filter_chain: firehose_chain.clone(),
            retry_manager,
            deserializer: deserializer.clone(),
            persistence: persistence.clone(),
            metrics: metrics.clone(),
            starting_state: OffsetMap::new(),
            ending_state: None,
            sideline_id: None,
            task_index: config.task_index,
            total_tasks: config.total_tasks,
        });

        let coordinator = Coordinator::new(
            buffer,
            Duration::from_millis(config.flush_interval_ms),
            DEFAULT_JOIN_TIMEOUT,
        );
        let controller = SidelineController::new(SidelineControllerParams {
            firehose_id: firehose_id.clone(),
            topic: config.broker.topic.clone(),
            firehose_chain,
            firehose_state,
            coordinator: coordinator.clone(),
            persistence,
            broker,
            deserializer,
            metrics,
            retry_config: config.retry.clone(),
            clock,
            task_index: config.task_index,
            total_tasks: config.total_tasks,
        });

        // Re-attach persisted filters and re-spawn pending replay sources
        // before the firehose starts pumping.
        controller.resume().await?;
        coordinator.open(firehose).await?;
        info!(firehose_id = %firehose_id, "Spout opened.");

        Ok(Self {
            coordinator,
            controller: Arc::new(controller),
            emitter,
            output_stream_id: config.output_stream_id,
        })
    }

    /// External triggers call `start_sideline`/`stop_sideline` on this.
    pub fn controller(&self) -> Arc<SidelineController> {
        self.controller.clone()
    }

    /// Emits at most one message to the emitter. Returns whether a message
    /// was emitted.
    pub fn next_tuple(&self) -> bool {
        match self.coordinator.next_message() {
            Some(message) => {
                self.emitter.emit(&self.output_stream_id, &message);
                true
            }
            None => false,
        }
    }

    pub fn ack(&self, handle: MessageId) {
        self.coordinator.ack(handle);
    }

    pub fn fail(&self, handle: MessageId) {
        self.coordinator.fail(handle);
    }

    pub async fn close(&self) {
        self.coordinator.close().await;
        info!("Spout closed.");
    }
}
