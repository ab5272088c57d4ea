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

use async_trait::async_trait;

use crate::models::Message;

mod fifo;
mod round_robin;

pub use fifo::FifoBuffer;
pub use round_robin::{RoundRobinBuffer, ThrottledRoundRobinBuffer};

/// Bounded queues feeding the single spout output. `put` is the sole
/// backpressure mechanism: a worker blocks when its source's queue is full.
/// `poll` is non-blocking and fair across sources.
#[async_trait]
pub trait MessageBuffer: Send + Sync + fmt::Debug {
    fn add_source(&self, source_id: &str);

    fn remove_source(&self, source_id: &str);

    /// Blocks while the queue for the message's source is full. A message
    /// put for a source that was never added auto-adds the source.
    async fn put(&self, message: Message) {
        let mut message = message;
        loop {
            match self.put_timeout(message, Duration::from_millis(100)).await {
                Ok(()) => return,
                Err(returned) => message = returned,
            }
        }
    }

    /// Like `put`, but hands the message back instead of blocking past
    /// `timeout`, so a stopping worker is never wedged on a full queue.
    async fn put_timeout(&self, message: Message, timeout: Duration) -> Result<(), Message>;

    /// Non-blocking. Returns ⊥ once a full pass over all sources finds no
    /// message.
    fn poll(&self) -> Option<Message>;
}

#[cfg(test)]
pub(crate) mod tests {
    use serde_json::json;

    use super::*;
    use crate::models::MessageId;

    pub(crate) fn test_message(source_id: &str, offset: i64) -> Message {
        Message {
            id: MessageId {
                topic: "events".to_string(),
                partition: 0,
                offset,
                source_id: source_id.to_string(),
            },
            value: json!({"offset": offset}),
        }
    }

    pub(crate) async fn put_all(buffer: &dyn MessageBuffer, source_id: &str, offsets: &[i64]) {
        for &offset in offsets {
            buffer.put(test_message(source_id, offset)).await;
        }
    }
}
