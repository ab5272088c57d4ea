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
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::SendTimeoutError;

use super::MessageBuffer;
use crate::models::Message;

struct SourceQueue {
    source_id: String,
    rx: mpsc::Receiver<Message>,
}

#[derive(Default)]
struct RoundRobinState {
    senders: HashMap<String, mpsc::Sender<Message>>,
    queues: Vec<SourceQueue>,
    cursor: usize,
}

/// Per-source bounded queues drained by a cursor that advances one source per
/// hit, so no single source can starve the others.
struct RoundRobinInner {
    state: Mutex<RoundRobinState>,
    capacity: usize,
    /// Sources matching this pattern get `throttled_capacity` instead of
    /// `capacity`.
    throttle: Option<(Regex, usize)>,
}

impl RoundRobinInner {
    fn new(capacity: usize, throttle: Option<(Regex, usize)>) -> Self {
        assert!(capacity > 0, "Buffer capacity must be positive.");
        if let Some((_, throttled_capacity)) = &throttle {
            assert!(*throttled_capacity > 0, "Buffer capacity must be positive.");
        }
        Self {
            state: Mutex::new(RoundRobinState::default()),
            capacity,
            throttle,
        }
    }

    fn lock(&self) -> MutexGuard<'_, RoundRobinState> {
        self.state
            .lock()
            .expect("The buffer state lock should not be poisoned.")
    }

    fn capacity_for(&self, source_id: &str) -> usize {
        match &self.throttle {
            Some((pattern, throttled_capacity)) if pattern.is_match(source_id) => {
                *throttled_capacity
            }
            _ => self.capacity,
        }
    }

    fn add_source_locked(&self, state: &mut RoundRobinState, source_id: &str) {
        if state.senders.contains_key(source_id) {
            return;
        }
        let (tx, rx) = mpsc::channel(self.capacity_for(source_id));
        state.senders.insert(source_id.to_string(), tx);
        state.queues.push(SourceQueue {
            source_id: source_id.to_string(),
            rx,
        });
        state.cursor = 0;
    }

    fn add_source(&self, source_id: &str) {
        let mut state = self.lock();
        self.add_source_locked(&mut state, source_id);
    }

    fn remove_source(&self, source_id: &str) {
        let mut state = self.lock();
        state.senders.remove(source_id);
        state.queues.retain(|queue| queue.source_id != source_id);
        state.cursor = 0;
    }

    async fn put_timeout(&self, message: Message, timeout: Duration) -> Result<(), Message> {
        let sender = {
            let mut state = self.lock();
            match state.senders.get(&message.id.source_id) {
                Some(sender) => sender.clone(),
                None => {
                    self.add_source_locked(&mut state, &message.id.source_id);
                    state.senders[&message.id.source_id].clone()
                }
            }
        };
        sender
            .send_timeout(message, timeout)
            .await
            .map_err(|error| match error {
                SendTimeoutError::Timeout(message) => message,
                SendTimeoutError::Closed(message) => message,
            })
    }

    fn poll(&self) -> Option<Message> {
        let mut state = self.lock();
        let num_queues = state.queues.len();
        for step in 0..num_queues {
            let index = (state.cursor + step) % num_queues;
            if let Ok(message) = state.queues[index].rx.try_recv() {
                state.cursor = (index + 1) % num_queues;
                return Some(message);
            }
        }
        None
    }
}

impl fmt::Debug for RoundRobinInner {
    fn fmt(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
        let state = self.lock();
        formatter
            .debug_struct("RoundRobin")
            .field("capacity", &self.capacity)
            .field("num_sources", &state.queues.len())
            .finish()
    }
}

#[derive(Debug)]
pub struct RoundRobinBuffer {
    inner: RoundRobinInner,
}

impl RoundRobinBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: RoundRobinInner::new(capacity, None),
        }
    }
}

#[async_trait]
impl MessageBuffer for RoundRobinBuffer {
    fn add_source(&self, source_id: &str) {
        self.inner.add_source(source_id);
    }

    fn remove_source(&self, source_id: &str) {
        self.inner.remove_source(source_id);
    }

    async fn put_timeout(&self, message: Message, timeout: Duration) -> Result<(), Message> {
        self.inner.put_timeout(message, timeout).await
    }

    fn poll(&self) -> Option<Message> {
        self.inner.poll()
    }
}

/// Round-robin buffer whose per-source capacity depends on the source id:
/// ids matching the configured pattern get the small throttled capacity, so
/// backpressure slows slow-lane producers independently.
#[derive(Debug)]
pub struct ThrottledRoundRobinBuffer {
    inner: RoundRobinInner,
}

impl ThrottledRoundRobinBuffer {
    pub fn new(capacity: usize, throttled_capacity: usize, throttled_pattern: Regex) -> Self {
        Self {
            inner: RoundRobinInner::new(capacity, Some((throttled_pattern, throttled_capacity))),
        }
    }
}

#[async_trait]
impl MessageBuffer for ThrottledRoundRobinBuffer {
    fn add_source(&self, source_id: &str) {
        self.inner.add_source(source_id);
    }

    fn remove_source(&self, source_id: &str) {
        self.inner.remove_source(source_id);
    }

    async fn put_timeout(&self, message: Message, timeout: Duration) -> Result<(), Message> {
        self.inner.put_timeout(message, timeout).await
    }

    fn poll(&self) -> Option<Message> {
        self.inner.poll()
    }
}
