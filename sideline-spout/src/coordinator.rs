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
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use itertools::Itertools;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::buffer::MessageBuffer;
use crate::models::{Message, MessageId};
use crate::source::VirtualSource;
use crate::{SpoutError, SpoutResult};

/// Idle backoff of a worker whose source has nothing to emit.
const IDLE_BACKOFF: Duration = Duration::from_millis(1);

/// A blocked `put` wakes up this often to check the stop flag and the flush
/// deadline.
const PUT_TIMEOUT: Duration = Duration::from_millis(100);

pub const DEFAULT_JOIN_TIMEOUT: Duration = Duration::from_secs(10);

enum AckEvent {
    Ack(MessageId),
    Fail(MessageId),
}

struct SourceHandle {
    ack_tx: flume::Sender<AckEvent>,
    stop: Arc<AtomicBool>,
    join: Option<JoinHandle<()>>,
}

struct CoordinatorInner {
    buffer: Arc<dyn MessageBuffer>,
    sources: Mutex<HashMap<String, SourceHandle>>,
    flush_interval: Duration,
    join_timeout: Duration,
}

impl CoordinatorInner {
    fn lock_sources(&self) -> MutexGuard<'_, HashMap<String, SourceHandle>> {
        self.sources
            .lock()
            .expect("The source map lock should not be poisoned.")
    }
}

/// Owns the firehose and every replay virtual source, runs each on its own
/// worker, and routes host acks back to the originating source. The host
/// drains all sources through `next_message`.
#[derive(Clone)]
pub struct Coordinator {
    inner: Arc<CoordinatorInner>,
}

impl fmt::Debug for Coordinator {
    fn fmt(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
        formatter
            .debug_struct("Coordinator")
            .field("num_sources", &self.inner.lock_sources().len())
            .finish()
    }
}

impl Coordinator {
    pub fn new(
        buffer: Arc<dyn MessageBuffer>,
        flush_interval: Duration,
        join_timeout: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(CoordinatorInner {
                buffer,
                sources: Mutex::new(HashMap::new()),
                flush_interval,
                join_timeout,
            }),
        }
    }

    /// Opens the firehose and starts its worker.
    pub async fn open(&self, firehose: VirtualSource) -> SpoutResult<()> {
        self.spawn_source(firehose).await
    }

    /// Registers a bounded replay source built by the sideline controller.
    /// Registering a source id twice is a precondition error.
    pub async fn add_replay_source(&self, source: VirtualSource) -> SpoutResult<()> {
        self.spawn_source(source).await
    }

    async fn spawn_source(&self, mut source: VirtualSource) -> SpoutResult<()> {
        let source_id = source.source_id().to_string();
        let (ack_tx, ack_rx) = flume::unbounded();
        let stop = source.stop_flag();
        {
            let mut sources = self.inner.lock_sources();
            if sources.contains_key(&source_id) {
                return Err(SpoutError::Precondition(format!(
                    "Source `{source_id}` is already registered."
                )));
            }
            sources.insert(
                source_id.clone(),
                SourceHandle {
                    ack_tx,
                    stop,
                    join: None,
                },
            );
        }
        if let Err(error) = source.open().await {
            self.inner.lock_sources().remove(&source_id);
            return Err(error);
        }
        self.inner.buffer.add_source(&source_id);
        let join = tokio::spawn(run_worker(source, ack_rx, self.inner.clone()));
        // The worker of an instantly completing source may already have
        // unregistered itself; its join handle is then simply detached.
        if let Some(handle) = self.inner.lock_sources().get_mut(&source_id) {
            handle.join = Some(join);
        }
        Ok(())
    }

    /// Non-blocking pop from the shared buffer.
    pub fn next_message(&self) -> Option<Message> {
        self.inner.buffer.poll()
    }

    /// Routes an ack to the originating source. An ack for a source that
    /// completed in the meantime is dropped silently.
    pub fn ack(&self, message_id: MessageId) {
        let sources = self.inner.lock_sources();
        match sources.get(&message_id.source_id) {
            Some(handle) => {
                let _ = handle.ack_tx.send(AckEvent::Ack(message_id));
            }
            None => {
                debug!(message_id = %message_id, "Dropping ack for a retired source.");
            }
        }
    }

    pub fn fail(&self, message_id: MessageId) {
        let sources = self.inner.lock_sources();
        match sources.get(&message_id.source_id) {
            Some(handle) => {
                let _ = handle.ack_tx.send(AckEvent::Fail(message_id));
            }
            None => {
                warn!(
                    message_id = %message_id,
                    known_sources = %sources.keys().join(", "),
                    "Dropping fail for an unknown source."
                );
            }
        }
    }

    pub fn num_sources(&self) -> usize {
        self.inner.lock_sources().len()
    }

    pub fn has_source(&self, source_id: &str) -> bool {
        self.inner.lock_sources().contains_key(source_id)
    }

    /// Requests stop on every source and joins the workers, each with a
    /// bounded timeout. A worker that fails to exit in time is abandoned.
    pub async fn close(&self) {
        let handles: Vec<(String, SourceHandle)> =
            self.inner.lock_sources().drain().collect();
        for (_, handle) in &handles {
            handle.stop.store(true, Ordering::Release);
        }
        for (source_id, handle) in handles {
            let join = match handle.join {
                Some(join) => join,
                None => continue,
            };
            match tokio::time::timeout(self.inner.join_timeout, join).await {
                Ok(Ok(())) => {}
                Ok(Err(join_error)) => {
                    error!(source_id = %source_id, error = %join_error, "Worker crashed.");
                }
                Err(_) => {
                    warn!(source_id = %source_id, "Worker did not exit within the timeout, abandoning it.");
                }
            }
        }
        info!("Coordinator closed.");
    }
}

/// Per-source worker loop: apply routed acks, flush on a timer, pull the next
/// message and push it into the shared buffer, backing off briefly when idle.
async fn run_worker(
    mut source: VirtualSource,
    ack_rx: flume::Receiver<AckEvent>,
    inner: Arc<CoordinatorInner>,
) {
    let source_id = source.source_id().to_string();
    let mut last_flush = Instant::now();
    loop {
        apply_ack_events(&mut source, &ack_rx);
        if last_flush.elapsed() >= inner.flush_interval {
            source.flush().await;
            last_flush = Instant::now();
        }
        if source.stop_requested() {
            break;
        }
        match source.next_message().await {
            Ok(Some(message)) => {
                let mut pending = Some(message);
                while let Some(message) = pending.take() {
                    match inner.buffer.put_timeout(message, PUT_TIMEOUT).await {
                        Ok(()) => {}
                        Err(returned) => {
                            if source.stop_requested() {
                                // The message stays tracked and uncommitted;
                                // it is re-delivered after restart.
                                break;
                            }
                            // Keep acking and flushing while blocked so a
                            // stalled downstream cannot stall completion.
                            apply_ack_events(&mut source, &ack_rx);
                            if last_flush.elapsed() >= inner.flush_interval {
                                source.flush().await;
                                last_flush = Instant::now();
                            }
                            pending = Some(returned);
                        }
                    }
                }
            }
            Ok(None) => {
                tokio::time::sleep(IDLE_BACKOFF).await;
            }
            Err(err) => {
                error!(source_id = %source_id, error = %err, "Worker failed, stopping the source.");
                source.request_stop();
            }
        }
    }
    source.close().await;
    inner.buffer.remove_source(&source_id);
    inner.lock_sources().remove(&source_id);
    debug!(source_id = %source_id, "Worker exited.");
}

fn apply_ack_events(source: &mut VirtualSource, ack_rx: &flume::Receiver<AckEvent>) {
    while let Ok(event) = ack_rx.try_recv() {
        match event {
            AckEvent::Ack(message_id) => source.ack(&message_id),
            AckEvent::Fail(message_id) => source.fail(&message_id),
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use sideline_persistence::{InMemoryAdapter, PersistenceAdapter};

    use super::*;
    use crate::buffer::RoundRobinBuffer;
    use crate::consumer::{LogConsumer, MemLog, MemLogClient};
    use crate::deserializer::JsonDeserializer;
    use crate::filter::FilterChainHandle;
    use crate::metrics::NoopMetricsSink;
    use crate::offsets::OffsetMap;
    use crate::retry::NeverRetry;
    use crate::source::VirtualSourceParams;

    fn build_source(
        source_id: &str,
        log: &MemLog,
        persistence: &Arc<InMemoryAdapter>,
    ) -> VirtualSource {
        let consumer = LogConsumer::new(
            source_id,
            "events",
            Box::new(MemLogClient::new(log.clone())),
            persistence.clone(),
            Arc::new(NoopMetricsSink),
        );
        VirtualSource::new(VirtualSourceParams {
            source_id: source_id.to_string(),
            topic: "events".to_string(),
            consumer,
            filter_chain: FilterChainHandle::default(),
            retry_manager: Box::new(NeverRetry),
            deserializer: Arc::new(JsonDeserializer),
            persistence: persistence.clone(),
            metrics: Arc::new(NoopMetricsSink),
            starting_state: OffsetMap::new(),
            ending_state: None,
            sideline_id: None,
            task_index: 0,
            total_tasks: 1,
        })
    }

    fn coordinator() -> Coordinator {
        Coordinator::new(
            Arc::new(RoundRobinBuffer::new(64)),
            Duration::from_millis(10),
            Duration::from_secs(1),
        )
    }

    async fn next_message_within(
        coordinator: &Coordinator,
        timeout: Duration,
    ) -> Option<Message> {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if let Some(message) = coordinator.next_message() {
                return Some(message);
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        None
    }

    #[tokio::test]
    async fn test_duplicate_source_id_is_a_precondition_error() -> anyhow::Result<()> {
        let log = MemLog::new();
        log.create_topic("events", 1);
        let persistence = Arc::new(InMemoryAdapter::new());
        persistence.open().await?;

        let coordinator = coordinator();
        coordinator
            .open(build_source("firehose-0", &log, &persistence))
            .await?;
        let error = coordinator
            .add_replay_source(build_source("firehose-0", &log, &persistence))
            .await
            .unwrap_err();
        assert!(matches!(error, SpoutError::Precondition(_)));
        coordinator.close().await;
        Ok(())
    }

    #[tokio::test]
    async fn test_pump_ack_and_persist() -> anyhow::Result<()> {
        let log = MemLog::new();
        log.create_topic("events", 1);
        for n in 0..3 {
            log.produce_json("events", 0, &n.to_string(), &json!({"v": n}));
        }
        let persistence = Arc::new(InMemoryAdapter::new());
        persistence.open().await?;

        let coordinator = coordinator();
        coordinator
            .open(build_source("firehose-0", &log, &persistence))
            .await?;

        let mut values = Vec::new();
        for _ in 0..3 {
            let message = next_message_within(&coordinator, Duration::from_secs(2))
                .await
                .expect("A message should arrive.");
            values.push(message.value["v"].clone());
            coordinator.ack(message.id);
        }
        assert_eq!(values, vec![json!(0), json!(1), json!(2)]);

        // The flush timer persists the acked floor without further traffic.
        let deadline = Instant::now() + Duration::from_secs(2);
        loop {
            if persistence.retrieve_consumer_offset("firehose-0", 0).await? == Some(2) {
                break;
            }
            assert!(Instant::now() < deadline, "The floor was never persisted.");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        coordinator.close().await;
        assert_eq!(coordinator.num_sources(), 0);
        Ok(())
    }

    #[tokio::test]
    async fn test_ack_for_retired_source_is_dropped_silently() {
        let coordinator = coordinator();
        coordinator.ack(MessageId {
            topic: "events".to_string(),
            partition: 0,
            offset: 0,
            source_id: "long-gone".to_string(),
        });
        coordinator.fail(MessageId {
            topic: "events".to_string(),
            partition: 0,
            offset: 0,
            source_id: "long-gone".to_string(),
        });
    }
}
