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

//! Explicit plugin registry: stable string keys map to constructors. The
//! config names a key; unknown keys fail at `open` time with the list of
//! available implementations.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use regex::Regex;
use sideline_config::{BufferConfig, PersistenceConfig, RetryConfig};
use sideline_persistence::{FileBackedAdapter, InMemoryAdapter, PersistenceAdapter};

use crate::buffer::{FifoBuffer, MessageBuffer, RoundRobinBuffer, ThrottledRoundRobinBuffer};
use crate::deserializer::{Deserializer, JsonDeserializer};
use crate::retry::{Clock, ExponentialBackoffRetry, NeverRetry, RetryManager};

pub const FIFO_BUFFER: &str = "fifo";
pub const ROUND_ROBIN_BUFFER: &str = "round-robin";
pub const THROTTLED_ROUND_ROBIN_BUFFER: &str = "throttled-round-robin";

pub const NEVER_RETRY: &str = "never";
pub const EXPONENTIAL_BACKOFF_RETRY: &str = "exponential-backoff";

pub const FILE_BACKED_PERSISTENCE: &str = "file-backed";
pub const IN_MEMORY_PERSISTENCE: &str = "in-memory";

pub const JSON_DESERIALIZER: &str = "json";

pub fn buffer_from_config(config: &BufferConfig) -> anyhow::Result<Arc<dyn MessageBuffer>> {
    match config.kind.as_str() {
        FIFO_BUFFER => Ok(Arc::new(FifoBuffer::new(config.max_size))),
        ROUND_ROBIN_BUFFER => Ok(Arc::new(RoundRobinBuffer::new(config.max_size))),
        THROTTLED_ROUND_ROBIN_BUFFER => {
            let pattern = config
                .throttled_regex
                .as_deref()
                .context("`buffer.throttled_regex` is required by the throttled buffer.")?;
            let regex = Regex::new(pattern)
                .with_context(|| format!("`buffer.throttled_regex` `{pattern}` is invalid."))?;
            Ok(Arc::new(ThrottledRoundRobinBuffer::new(
                config.max_size,
                config.throttled_size,
                regex,
            )))
        }
        unknown => bail!(
            "Unknown buffer `{unknown}`. Available buffers: `{FIFO_BUFFER}`, \
             `{ROUND_ROBIN_BUFFER}`, `{THROTTLED_ROUND_ROBIN_BUFFER}`."
        ),
    }
}

pub fn retry_manager_from_config(
    config: &RetryConfig,
    clock: Arc<dyn Clock>,
) -> anyhow::Result<Box<dyn RetryManager>> {
    match config.policy.as_str() {
        NEVER_RETRY => Ok(Box::new(NeverRetry)),
        EXPONENTIAL_BACKOFF_RETRY => Ok(Box::new(ExponentialBackoffRetry::new(
            config.max_attempts,
            Duration::from_millis(config.initial_delay_ms),
            config.delay_multiplier,
            clock,
        ))),
        unknown => bail!(
            "Unknown retry policy `{unknown}`. Available policies: `{NEVER_RETRY}`, \
             `{EXPONENTIAL_BACKOFF_RETRY}`."
        ),
    }
}

pub fn persistence_from_config(
    config: &PersistenceConfig,
    prefix: &str,
) -> anyhow::Result<Arc<dyn PersistenceAdapter>> {
    match config.adapter.as_str() {
        FILE_BACKED_PERSISTENCE => Ok(Arc::new(FileBackedAdapter::new(config.root.as_str(), prefix))),
        IN_MEMORY_PERSISTENCE => Ok(Arc::new(InMemoryAdapter::new())),
        unknown => bail!(
            "Unknown persistence adapter `{unknown}`. Available adapters: \
             `{FILE_BACKED_PERSISTENCE}`, `{IN_MEMORY_PERSISTENCE}`."
        ),
    }
}

pub fn deserializer_from_key(key: &str) -> anyhow::Result<Arc<dyn Deserializer>> {
    match key {
        JSON_DESERIALIZER => Ok(Arc::new(JsonDeserializer)),
        unknown => bail!(
            "Unknown deserializer `{unknown}`. Available deserializers: `{JSON_DESERIALIZER}`."
        ),
    }
}
