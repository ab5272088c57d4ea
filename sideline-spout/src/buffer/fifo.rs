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

use std::collections::HashSet;
use std::fmt;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::SendTimeoutError;

use super::MessageBuffer;
use crate::models::Message;

/// One shared bounded queue across all sources. First in, first out,
/// regardless of the producing source.
pub struct FifoBuffer {
    tx: mpsc::Sender<Message>,
    rx: Mutex<mpsc::Receiver<Message>>,
    sources: Mutex<HashSet<String>>,
}

impl fmt::Debug for FifoBuffer {
    fn fmt(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
        formatter
            .debug_struct("FifoBuffer")
            .field("capacity", &self.tx.max_capacity())
            .finish()
    }
}

impl FifoBuffer {
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "Buffer capacity must be positive.");
        let (tx, rx) = mpsc::channel(capacity);
        Self {
            tx,
            rx: Mutex::new(rx),
            sources: Mutex::new(HashSet::new()),
        }
    }
}

#[async_trait]
impl MessageBuffer for FifoBuffer {
    fn add_source(&self, source_id: &str) {
        self.sources
            .lock()
            .expect("The source set lock should not be poisoned.")
            .insert(source_id.to_string());
    }

    fn remove_source(&self, source_id: &str) {
        self.sources
            .lock()
            .expect("The source set lock should not be poisoned.")
            .remove(source_id);
    }

    async fn put_timeout(&self, message: Message, timeout: Duration) -> Result<(), Message> {
        self.add_source(&message.id.source_id);
        self.tx
            .send_timeout(message, timeout)
            .await
            .map_err(|error| match error {
                SendTimeoutError::Timeout(message) => message,
                SendTimeoutError::Closed(message) => message,
            })
    }

    fn poll(&self) -> Option<Message> {
        self.rx
            .lock()
            .expect("The queue lock should not be poisoned.")
            .try_recv()
            .ok()
    }
}

#[cfg(test)]
mod tests {
    use super::super::tests::{put_all, test_message};
    use super::*;

    #[tokio::test]
    async fn test_fifo_order_across_sources() {
        let buffer = FifoBuffer::new(16);
        buffer.put(test_message("a", 0)).await;
        buffer.put(test_message("b", 0)).await;
        buffer.put(test_message("a", 1)).await;

        let drained: Vec<String> = std::iter::from_fn(|| buffer.poll())
            .map(|message| message.id.source_id)
            .collect();
        assert_eq!(drained, vec!["a", "b", "a"]);
        assert!(buffer.poll().is_none());
    }

    #[tokio::test]
    async fn test_put_timeout_returns_message_when_full() {
        let buffer = FifoBuffer::new(2);
        put_all(&buffer, "a", &[0, 1]).await;
        let rejected = buffer
            .put_timeout(test_message("a", 2), Duration::from_millis(10))
            .await
            .unwrap_err();
        assert_eq!(rejected.id.offset, 2);

        // Draining one slot unblocks the next put.
        assert!(buffer.poll().is_some());
        buffer
            .put_timeout(rejected, Duration::from_millis(10))
            .await
            .unwrap();
    }
}
