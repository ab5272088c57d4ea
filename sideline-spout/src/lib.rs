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

//! Sideline is a streaming source for partitioned, offset-addressed logs with
//! one distinguishing capability: an operator can attach a filter to the live
//! firehose to divert matching records, then detach it later and have a
//! bounded replay source re-deliver exactly the diverted offset range with the
//! negated filter. The coordinator runs the firehose and every replay source
//! on its own worker, feeding a shared fair buffer drained by the host.

mod buffer;
mod consumer;
mod coordinator;
mod controller;
mod deserializer;
mod filter;
mod metrics;
mod models;
mod offsets;
mod registry;
mod retry;
mod source;
mod spout;

pub use buffer::{FifoBuffer, MessageBuffer, RoundRobinBuffer, ThrottledRoundRobinBuffer};
pub use consumer::{
    BrokerClient, BrokerConnector, ConsumerStateHandle, LogConsumer, MemLog, MemLogClient,
    RawRecord, SeekPosition,
};
#[cfg(feature = "kafka")]
pub use consumer::{KafkaBrokerClient, KafkaConnector};
pub use coordinator::Coordinator;
pub use controller::{SidelineController, SidelineControllerParams, SidelineRequest};
pub use deserializer::{Deserializer, JsonDeserializer};
pub use filter::{decode_steps, encode_steps, FilterChain, FilterChainHandle, FilterStep};
pub use metrics::{default_metrics, MetricsSink, NoopMetricsSink, PrometheusMetricsSink};
pub use models::{Message, MessageId};
pub use offsets::{OffsetMap, PartitionKey};
pub use registry::{
    buffer_from_config, deserializer_from_key, persistence_from_config, retry_manager_from_config,
};
pub use retry::{Clock, ExponentialBackoffRetry, ManualClock, NeverRetry, RetryManager, SystemClock};
pub use source::{SourceState, VirtualSource, VirtualSourceParams};
pub use spout::{Emitter, SidelineSpout};

pub type SpoutResult<T> = Result<T, SpoutError>;

#[derive(thiserror::Error, Debug)]
pub enum SpoutError {
    /// API misuse: operations before `open`, double `open`, duplicate source
    /// ids. Fatal to the caller, never retried.
    #[error("Precondition violated: {0}")]
    Precondition(String),
    #[error("Invalid configuration: {0}")]
    Configuration(String),
    #[error("Persistence error: {0}")]
    Persistence(#[from] sideline_persistence::PersistenceError),
    #[error("Broker error: {0}")]
    Broker(#[source] anyhow::Error),
}
