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

use crate::offsets::PartitionKey;

/// Opaque handle the host passes back in `ack`/`fail`. Globally unique across
/// the running process: the emitting virtual source is part of the identity.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct MessageId {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub source_id: String,
}

impl MessageId {
    pub fn partition_key(&self) -> PartitionKey {
        PartitionKey::new(self.topic.clone(), self.partition)
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
        write!(
            formatter,
            "{}/{}@{}:{}",
            self.topic, self.partition, self.offset, self.source_id
        )
    }
}

/// A deserialized record, alive from emission until it is acked or
/// permanently failed.
#[derive(Clone, Debug, PartialEq)]
pub struct Message {
    pub id: MessageId,
    pub value: serde_json::Value,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_id_identity_includes_source() {
        let live = MessageId {
            topic: "events".to_string(),
            partition: 0,
            offset: 12,
            source_id: "firehose-0".to_string(),
        };
        let mut replay = live.clone();
        replay.source_id = "firehose-0_01H".to_string();
        assert_ne!(live, replay);
        assert_eq!(live.partition_key(), replay.partition_key());
        assert_eq!(live.to_string(), "events/0@12:firehose-0");
    }
}
