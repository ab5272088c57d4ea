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
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::models::MessageId;

/// Wall-clock capability. Injected so that retry scheduling is testable with
/// a virtual clock.
pub trait Clock: Send + Sync + fmt::Debug {
    fn now(&self) -> Instant;
}

#[derive(Clone, Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// Virtual clock advanced manually by tests.
#[derive(Clone, Debug)]
pub struct ManualClock {
    epoch: Instant,
    elapsed: Arc<Mutex<Duration>>,
}

impl Default for ManualClock {
    fn default() -> Self {
        Self {
            epoch: Instant::now(),
            elapsed: Arc::new(Mutex::new(Duration::ZERO)),
        }
    }
}

impl ManualClock {
    pub fn advance(&self, duration: Duration) {
        let mut elapsed = self
            .elapsed
            .lock()
            .expect("The manual clock lock should not be poisoned.");
        *elapsed += duration;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        let elapsed = self
            .elapsed
            .lock()
            .expect("The manual clock lock should not be poisoned.");
        self.epoch + *elapsed
    }
}

/// Decides when and whether a failed message is replayed. A virtual source
/// owns exactly one retry manager; calls are serialized by the source worker.
pub trait RetryManager: Send + fmt::Debug {
    /// Records a failure and schedules the next eligible attempt.
    fn failed(&mut self, message_id: &MessageId);

    /// Whether another attempt is permitted for this message.
    fn retry_further(&mut self, message_id: &MessageId) -> bool;

    /// The failed message whose scheduled time has passed, lowest scheduled
    /// time first, ties broken by insertion order. Non-blocking.
    fn next_eligible(&mut self) -> Option<MessageId>;

    /// Drops all tracking for this message.
    fn acked(&mut self, message_id: &MessageId);
}

/// Gives up on first failure.
#[derive(Debug, Default)]
pub struct NeverRetry;

impl RetryManager for NeverRetry {
    fn failed(&mut self, _message_id: &MessageId) {}

    fn retry_further(&mut self, _message_id: &MessageId) -> bool {
        false
    }

    fn next_eligible(&mut self) -> Option<MessageId> {
        None
    }

    fn acked(&mut self, _message_id: &MessageId) {}
}

#[derive(Debug)]
struct RetryState {
    attempts: u32,
    eligible_at: Instant,
    /// Insertion order, the tie breaker for equal schedules.
    sequence: u64,
    /// Set while the message has been handed back for re-emission and has not
    /// failed again since.
    in_flight: bool,
}

/// Replays failures with exponentially growing delays, up to `max_retries`
/// attempts. `max_retries = 0` behaves identically to [`NeverRetry`].
pub struct ExponentialBackoffRetry {
    max_retries: u32,
    initial_delay: Duration,
    multiplier: f64,
    clock: Arc<dyn Clock>,
    states: HashMap<MessageId, RetryState>,
    next_sequence: u64,
}

impl fmt::Debug for ExponentialBackoffRetry {
    fn fmt(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
        formatter
            .debug_struct("ExponentialBackoffRetry")
            .field("max_retries", &self.max_retries)
            .field("initial_delay", &self.initial_delay)
            .field("multiplier", &self.multiplier)
            .field("num_tracked", &self.states.len())
            .finish()
    }
}

impl ExponentialBackoffRetry {
    pub fn new(
        max_retries: u32,
        initial_delay: Duration,
        multiplier: f64,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            max_retries,
            initial_delay,
            multiplier,
            clock,
            states: HashMap::new(),
            next_sequence: 0,
        }
    }

    fn delay_for_attempt(&self, attempts: u32) -> Duration {
        let factor = self.multiplier.powi(attempts.saturating_sub(1) as i32);
        self.initial_delay.mul_f64(factor)
    }
}

impl RetryManager for ExponentialBackoffRetry {
    fn failed(&mut self, message_id: &MessageId) {
        let now = self.clock.now();
        let attempts = self
            .states
            .get(message_id)
            .map(|state| state.attempts)
            .unwrap_or(0)
            + 1;
        let delay = self.delay_for_attempt(attempts);
        let sequence = self.next_sequence;
        let state = self
            .states
            .entry(message_id.clone())
            .or_insert_with(|| RetryState {
                attempts: 0,
                eligible_at: now,
                sequence,
                in_flight: false,
            });
        if state.sequence == sequence {
            self.next_sequence += 1;
        }
        state.attempts = attempts;
        state.in_flight = false;
        state.eligible_at = now + delay;
    }

    fn retry_further(&mut self, message_id: &MessageId) -> bool {
        let attempts = self
            .states
            .get(message_id)
            .map(|state| state.attempts)
            .unwrap_or(0);
        attempts < self.max_retries
    }

    fn next_eligible(&mut self) -> Option<MessageId> {
        let now = self.clock.now();
        let message_id = self
            .states
            .iter()
            .filter(|(_, state)| !state.in_flight && state.eligible_at <= now)
            .min_by_key(|(_, state)| (state.eligible_at, state.sequence))
            .map(|(message_id, _)| message_id.clone())?;
        if let Some(state) = self.states.get_mut(&message_id) {
            state.in_flight = true;
        }
        Some(message_id)
    }

    fn acked(&mut self, message_id: &MessageId) {
        self.states.remove(message_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message_id(offset: i64) -> MessageId {
        MessageId {
            topic: "events".to_string(),
            partition: 0,
            offset,
            source_id: "firehose-0".to_string(),
        }
    }

    fn retry_manager(max_retries: u32, clock: &ManualClock) -> ExponentialBackoffRetry {
        ExponentialBackoffRetry::new(
            max_retries,
            Duration::from_millis(10),
            2.0,
            Arc::new(clock.clone()),
        )
    }

    #[test]
    fn test_never_retry_gives_up_immediately() {
        let mut retry = NeverRetry;
        assert!(!retry.retry_further(&message_id(0)));
        assert_eq!(retry.next_eligible(), None);
    }

    #[test]
    fn test_zero_max_retries_matches_never_retry() {
        let clock = ManualClock::default();
        let mut retry = retry_manager(0, &clock);
        assert!(!retry.retry_further(&message_id(0)));
    }

    #[test]
    fn test_backoff_schedule() {
        let clock = ManualClock::default();
        let mut retry = retry_manager(2, &clock);
        let id = message_id(5);

        // First failure: eligible after the initial delay.
        assert!(retry.retry_further(&id));
        retry.failed(&id);
        assert_eq!(retry.next_eligible(), None);
        clock.advance(Duration::from_millis(10));
        assert_eq!(retry.next_eligible(), Some(id.clone()));
        // Not yielded again while in flight.
        assert_eq!(retry.next_eligible(), None);

        // Second failure: the delay doubles.
        assert!(retry.retry_further(&id));
        retry.failed(&id);
        clock.advance(Duration::from_millis(10));
        assert_eq!(retry.next_eligible(), None);
        clock.advance(Duration::from_millis(10));
        assert_eq!(retry.next_eligible(), Some(id.clone()));

        // Third failure exhausts the budget.
        assert!(!retry.retry_further(&id));
        retry.acked(&id);
        assert_eq!(retry.next_eligible(), None);
    }

    #[test]
    fn test_eligibility_order_is_schedule_then_insertion() {
        let clock = ManualClock::default();
        let mut retry = retry_manager(5, &clock);
        let first = message_id(1);
        let second = message_id(2);
        retry.failed(&first);
        retry.failed(&second);
        clock.advance(Duration::from_millis(10));
        assert_eq!(retry.next_eligible(), Some(first));
        assert_eq!(retry.next_eligible(), Some(second));
        assert_eq!(retry.next_eligible(), None);
    }

    #[test]
    fn test_ack_drops_tracking() {
        let clock = ManualClock::default();
        let mut retry = retry_manager(5, &clock);
        let id = message_id(1);
        retry.failed(&id);
        retry.acked(&id);
        clock.advance(Duration::from_secs(1));
        assert_eq!(retry.next_eligible(), None);
        // A fresh failure starts counting from scratch.
        assert!(retry.retry_further(&id));
    }
}
