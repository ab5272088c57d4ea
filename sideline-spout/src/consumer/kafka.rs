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
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use rdkafka::config::{ClientConfig, RDKafkaLogLevel};
use rdkafka::consumer::{BaseConsumer, Consumer, DefaultConsumerContext};
use rdkafka::error::KafkaError;
use rdkafka::message::Message as _;
use rdkafka::util::Timeout;
use rdkafka::{Offset, TopicPartitionList};
use tracing::{debug, warn};

use super::{BrokerClient, BrokerConnector, RawRecord, SeekPosition};

const METADATA_FETCH_TIMEOUT: Duration = Duration::from_secs(5);

/// Builds one rdkafka consumer per virtual source.
#[derive(Clone, Debug)]
pub struct KafkaConnector {
    hosts: Vec<String>,
}

impl KafkaConnector {
    pub fn new(hosts: Vec<String>) -> Self {
        Self { hosts }
    }
}

impl BrokerConnector for KafkaConnector {
    fn connect(&self, source_id: &str) -> anyhow::Result<Box<dyn BrokerClient>> {
        Ok(Box::new(KafkaBrokerClient::try_new(&self.hosts, source_id)?))
    }
}

pub struct KafkaBrokerClient {
    consumer: BaseConsumer<DefaultConsumerContext>,
}

impl fmt::Debug for KafkaBrokerClient {
    fn fmt(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
        formatter.debug_struct("KafkaBrokerClient").finish()
    }
}

impl KafkaBrokerClient {
    pub fn try_new(hosts: &[String], source_id: &str) -> anyhow::Result<Self> {
        // Group ID is limited to 255 characters.
        let mut group_id = format!("sideline-{source_id}");
        group_id.truncate(255);
        debug!(group_id = %group_id, "Initializing broker consumer.");

        let consumer: BaseConsumer<DefaultConsumerContext> = ClientConfig::new()
            .set("bootstrap.servers", hosts.join(","))
            .set("group.id", group_id)
            // Offsets are managed through the persistence adapter; the broker
            // never commits on our behalf.
            .set("enable.auto.commit", "false")
            .set("auto.offset.reset", "earliest")
            .set_log_level(RDKafkaLogLevel::Info)
            .create()
            .context("Failed to create broker consumer.")?;
        Ok(Self { consumer })
    }
}

#[async_trait]
impl BrokerClient for KafkaBrokerClient {
    async fn partitions(&self, topic: &str) -> anyhow::Result<Vec<i32>> {
        let metadata = self
            .consumer
            .fetch_metadata(Some(topic), Timeout::After(METADATA_FETCH_TIMEOUT))
            .with_context(|| format!("Failed to fetch metadata for topic `{topic}`."))?;
        let topic_metadata = metadata
            .topics()
            .first()
            .with_context(|| format!("Topic `{topic}` does not exist."))?;
        Ok(topic_metadata
            .partitions()
            .iter()
            .map(|partition| partition.id())
            .collect())
    }

    async fn assign(&mut self, topic: &str, seeks: &[(i32, SeekPosition)]) -> anyhow::Result<()> {
        let mut assignment = TopicPartitionList::new();
        for &(partition, seek) in seeks {
            let offset = match seek {
                // `Stored` falls back to `auto.offset.reset` when the group
                // holds no committed offset, which it never does here.
                SeekPosition::Default => Offset::Stored,
                SeekPosition::At(offset) => Offset::Offset(offset),
            };
            assignment
                .add_partition_offset(topic, partition, offset)
                .context("Failed to build the partition assignment.")?;
        }
        self.consumer
            .assign(&assignment)
            .context("Failed to assign partitions.")?;
        Ok(())
    }

    async fn poll(&mut self) -> anyhow::Result<Option<RawRecord>> {
        match self.consumer.poll(Timeout::After(Duration::ZERO)) {
            None => Ok(None),
            Some(Ok(message)) => Ok(Some(RawRecord {
                topic: message.topic().to_string(),
                partition: message.partition(),
                offset: message.offset(),
                key: message.key().map(|key| key.to_vec()),
                payload: message.payload().map(|payload| payload.to_vec()),
            })),
            Some(Err(KafkaError::PartitionEOF(partition))) => {
                debug!(partition = %partition, "Reached end of partition.");
                Ok(None)
            }
            // Transient poll errors surface as an empty poll; the worker
            // idles and retries.
            Some(Err(error)) => {
                warn!(error = %error, "Broker poll failed.");
                Ok(None)
            }
        }
    }

    async fn unassign(&mut self, topic: &str, partition: i32) -> anyhow::Result<bool> {
        let positions = self
            .consumer
            .position()
            .context("Failed to read consumer positions.")?;
        let mut next_assignment = TopicPartitionList::new();
        let mut found = false;
        for element in positions.elements() {
            if element.topic() == topic && element.partition() == partition {
                found = true;
                continue;
            }
            next_assignment
                .add_partition_offset(element.topic(), element.partition(), element.offset())
                .context("Failed to rebuild the partition assignment.")?;
        }
        if found {
            self.consumer
                .assign(&next_assignment)
                .context("Failed to shrink the partition assignment.")?;
        }
        Ok(found)
    }
}
