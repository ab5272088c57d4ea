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

use anyhow::{bail, Context};
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::warn;

pub const DEFAULT_OUTPUT_STREAM_ID: &str = "default";

/// Longest accepted consumer ID prefix. The prefix ends up in derived source
/// ids (`<prefix>-<task_index>` for the firehose, plus a ULID suffix for
/// replay sources) which in turn feed broker group ids capped at 255 bytes,
/// so the prefix itself is kept well below that.
const MAX_CONSUMER_ID_PREFIX_LEN: usize = 200;

/// The prefix must start with an ASCII letter and may continue with ASCII
/// letters, digits, `-` and `_`: the characters that stay path-safe in the
/// coordination store and group-id-safe at the broker.
fn validate_consumer_id_prefix(prefix: &str) -> anyhow::Result<()> {
    if prefix.is_empty() {
        bail!("Consumer ID prefix must not be empty.");
    }
    if prefix.len() > MAX_CONSUMER_ID_PREFIX_LEN {
        bail!(
            "Consumer ID prefix must be at most {MAX_CONSUMER_ID_PREFIX_LEN} characters, \
             got {} characters.",
            prefix.len()
        );
    }
    if !prefix.starts_with(|first: char| first.is_ascii_alphabetic()) {
        bail!("Consumer ID prefix `{prefix}` must start with an ASCII letter.");
    }
    if let Some(unsupported) = prefix
        .chars()
        .find(|c| !c.is_ascii_alphanumeric() && *c != '-' && *c != '_')
    {
        bail!("Consumer ID prefix `{prefix}` contains the unsupported character `{unsupported}`.");
    }
    Ok(())
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct BrokerConfig {
    /// Bootstrap servers, `host:port` each.
    pub hosts: Vec<String>,
    pub topic: String,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct PersistenceConfig {
    /// Registry key of the persistence adapter (`file-backed`, `in-memory`).
    #[serde(default = "PersistenceConfig::default_adapter")]
    pub adapter: String,
    /// Base path in the coordination store.
    #[serde(default = "PersistenceConfig::default_root")]
    pub root: String,
}

impl PersistenceConfig {
    fn default_adapter() -> String {
        "file-backed".to_string()
    }

    fn default_root() -> String {
        "./sideline-state".to_string()
    }
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            adapter: Self::default_adapter(),
            root: Self::default_root(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct RetryConfig {
    /// Registry key of the retry policy (`never`, `exponential-backoff`).
    #[serde(default = "RetryConfig::default_policy")]
    pub policy: String,
    #[serde(default = "RetryConfig::default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "RetryConfig::default_initial_delay_ms")]
    pub initial_delay_ms: u64,
    #[serde(default = "RetryConfig::default_delay_multiplier")]
    pub delay_multiplier: f64,
}

impl RetryConfig {
    fn default_policy() -> String {
        "exponential-backoff".to_string()
    }

    fn default_max_attempts() -> u32 {
        10
    }

    fn default_initial_delay_ms() -> u64 {
        1_000
    }

    fn default_delay_multiplier() -> f64 {
        2.0
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            policy: Self::default_policy(),
            max_attempts: Self::default_max_attempts(),
            initial_delay_ms: Self::default_initial_delay_ms(),
            delay_multiplier: Self::default_delay_multiplier(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct BufferConfig {
    /// Registry key of the buffer implementation (`fifo`, `round-robin`,
    /// `throttled-round-robin`).
    #[serde(default = "BufferConfig::default_kind")]
    pub kind: String,
    #[serde(default = "BufferConfig::default_max_size")]
    pub max_size: usize,
    #[serde(default = "BufferConfig::default_throttled_size")]
    pub throttled_size: usize,
    /// Source ids matching this pattern are placed on the throttled lane.
    #[serde(default)]
    pub throttled_regex: Option<String>,
}

impl BufferConfig {
    fn default_kind() -> String {
        "round-robin".to_string()
    }

    fn default_max_size() -> usize {
        10_000
    }

    fn default_throttled_size() -> usize {
        100
    }
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            kind: Self::default_kind(),
            max_size: Self::default_max_size(),
            throttled_size: Self::default_throttled_size(),
            throttled_regex: None,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct SpoutConfig {
    pub broker: BrokerConfig,
    /// Firehose source id = `<consumer_id_prefix>-<task_index>`.
    pub consumer_id_prefix: String,
    /// Index of this instance among `total_tasks` parallel instances. The
    /// instance claims the partitions `p` with `p % total_tasks == task_index`.
    #[serde(default)]
    pub task_index: u32,
    #[serde(default = "SpoutConfig::default_total_tasks")]
    pub total_tasks: u32,
    #[serde(default)]
    pub persistence: PersistenceConfig,
    #[serde(default = "SpoutConfig::default_deserializer")]
    pub deserializer: String,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub buffer: BufferConfig,
    #[serde(default = "SpoutConfig::default_flush_interval_ms")]
    pub flush_interval_ms: u64,
    #[serde(default = "SpoutConfig::default_output_stream_id")]
    pub output_stream_id: String,
}

impl SpoutConfig {
    fn default_total_tasks() -> u32 {
        1
    }

    fn default_deserializer() -> String {
        "json".to_string()
    }

    fn default_flush_interval_ms() -> u64 {
        30_000
    }

    fn default_output_stream_id() -> String {
        DEFAULT_OUTPUT_STREAM_ID.to_string()
    }

    pub fn from_yaml_str(yaml: &str) -> anyhow::Result<Self> {
        let config: SpoutConfig =
            serde_yaml::from_str(yaml).context("Failed to parse spout config.")?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        validate_consumer_id_prefix(&self.consumer_id_prefix)?;

        if self.broker.hosts.is_empty() {
            bail!("Broker host list must not be empty.");
        }
        if self.broker.topic.is_empty() {
            bail!("Broker topic must not be empty.");
        }
        if self.total_tasks == 0 {
            bail!("`total_tasks` must be positive.");
        }
        if self.task_index >= self.total_tasks {
            bail!(
                "`task_index` ({}) must be lower than `total_tasks` ({}).",
                self.task_index,
                self.total_tasks
            );
        }
        if self.buffer.max_size == 0 {
            bail!("`buffer.max_size` must be positive.");
        }
        if self.buffer.throttled_size == 0 {
            bail!("`buffer.throttled_size` must be positive.");
        }
        if let Some(pattern) = &self.buffer.throttled_regex {
            Regex::new(pattern).with_context(|| {
                format!("`buffer.throttled_regex` `{pattern}` is not a valid pattern.")
            })?;
        }
        if self.flush_interval_ms == 0 {
            bail!("`flush_interval_ms` must be positive.");
        }
        if self.retry.delay_multiplier < 1.0 {
            bail!("`retry.delay_multiplier` must be >= 1.0.");
        }
        if self.persistence.adapter == "in-memory" {
            warn!("The in-memory persistence adapter does not survive restarts.");
        }
        Ok(())
    }

    /// Source id of the firehose consumer run by this instance.
    pub fn firehose_source_id(&self) -> String {
        format!("{}-{}", self.consumer_id_prefix, self.task_index)
    }

    #[doc(hidden)]
    pub fn for_test(topic: &str) -> Self {
        SpoutConfig {
            broker: BrokerConfig {
                hosts: vec!["localhost:9092".to_string()],
                topic: topic.to_string(),
            },
            consumer_id_prefix: "firehose".to_string(),
            task_index: 0,
            total_tasks: 1,
            persistence: PersistenceConfig {
                adapter: "in-memory".to_string(),
                root: "sideline".to_string(),
            },
            deserializer: Self::default_deserializer(),
            retry: RetryConfig::default(),
            buffer: BufferConfig::default(),
            flush_interval_ms: 100,
            output_stream_id: Self::default_output_stream_id(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_config_yaml() -> &'static str {
        r#"
            broker:
                hosts: ["broker-1:9092", "broker-2:9092"]
                topic: orders
            consumer_id_prefix: orders-spout
            task_index: 1
            total_tasks: 4
            persistence:
                adapter: file-backed
                root: /var/lib/sideline
            buffer:
                kind: throttled-round-robin
                max_size: 500
                throttled_size: 2
                throttled_regex: "^orders-spout-.*$"
            flush_interval_ms: 5000
        "#
    }

    #[test]
    fn test_config_from_yaml() {
        let config = SpoutConfig::from_yaml_str(sample_config_yaml()).unwrap();
        assert_eq!(config.broker.topic, "orders");
        assert_eq!(config.broker.hosts.len(), 2);
        assert_eq!(config.firehose_source_id(), "orders-spout-1");
        assert_eq!(config.buffer.kind, "throttled-round-robin");
        assert_eq!(config.buffer.throttled_size, 2);
        assert_eq!(config.flush_interval_ms, 5_000);
        // Defaulted sections.
        assert_eq!(config.retry, RetryConfig::default());
        assert_eq!(config.deserializer, "json");
        assert_eq!(config.output_stream_id, DEFAULT_OUTPUT_STREAM_ID);
    }

    #[test]
    fn test_validate_consumer_id_prefix() {
        validate_consumer_id_prefix("").unwrap_err();
        validate_consumer_id_prefix("-").unwrap_err();
        validate_consumer_id_prefix("_fo").unwrap_err();
        validate_consumer_id_prefix("0rders").unwrap_err();
        validate_consumer_id_prefix("orders spout").unwrap_err();
        validate_consumer_id_prefix(&"f".repeat(MAX_CONSUMER_ID_PREFIX_LEN + 1)).unwrap_err();

        validate_consumer_id_prefix("f").unwrap();
        validate_consumer_id_prefix("firehose").unwrap();
        validate_consumer_id_prefix("orders-spout_v2").unwrap();
        validate_consumer_id_prefix(&"f".repeat(MAX_CONSUMER_ID_PREFIX_LEN)).unwrap();

        assert_eq!(
            validate_consumer_id_prefix("foo!").unwrap_err().to_string(),
            "Consumer ID prefix `foo!` contains the unsupported character `!`."
        );
    }

    #[test]
    fn test_config_validation_rejects_bad_values() {
        let mut config = SpoutConfig::for_test("events");
        config.consumer_id_prefix = "".to_string();
        config.validate().unwrap_err();

        let mut config = SpoutConfig::for_test("events");
        config.task_index = 2;
        config.total_tasks = 2;
        config.validate().unwrap_err();

        let mut config = SpoutConfig::for_test("events");
        config.buffer.max_size = 0;
        config.validate().unwrap_err();

        let mut config = SpoutConfig::for_test("events");
        config.buffer.throttled_regex = Some("(".to_string());
        config.validate().unwrap_err();

        let mut config = SpoutConfig::for_test("events");
        config.flush_interval_ms = 0;
        config.validate().unwrap_err();
    }

    #[test]
    fn test_unknown_field_is_rejected() {
        let yaml = r#"
            broker:
                hosts: ["localhost:9092"]
                topic: events
            consumer_id_prefix: firehose
            frobnicate: true
        "#;
        SpoutConfig::from_yaml_str(yaml).unwrap_err();
    }
}
