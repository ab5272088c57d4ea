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
use std::sync::Arc;

use once_cell::sync::Lazy;
use prometheus::{HistogramOpts, HistogramVec, IntCounterVec, IntGaugeVec, Opts, Registry};
use tracing::warn;

/// Best-effort metrics capability. Calls never fail the caller.
pub trait MetricsSink: Send + Sync + fmt::Debug {
    fn count(&self, scope: &str, name: &str, delta: u64);
    fn timer(&self, scope: &str, name: &str, millis: u64);
    fn gauge(&self, scope: &str, name: &str, value: i64);
}

#[derive(Debug, Default)]
pub struct NoopMetricsSink;

impl MetricsSink for NoopMetricsSink {
    fn count(&self, _scope: &str, _name: &str, _delta: u64) {}

    fn timer(&self, _scope: &str, _name: &str, _millis: u64) {}

    fn gauge(&self, _scope: &str, _name: &str, _value: i64) {}
}

/// Prometheus-backed sink. Scope and name become label values on three
/// family-level collectors.
pub struct PrometheusMetricsSink {
    registry: Registry,
    counters: IntCounterVec,
    timers: HistogramVec,
    gauges: IntGaugeVec,
}

impl fmt::Debug for PrometheusMetricsSink {
    fn fmt(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
        formatter.debug_struct("PrometheusMetricsSink").finish()
    }
}

impl PrometheusMetricsSink {
    pub fn new() -> prometheus::Result<Self> {
        let registry = Registry::new();
        let counters = IntCounterVec::new(
            Opts::new("sideline_counter", "Sideline counters."),
            &["scope", "name"],
        )?;
        let timers = HistogramVec::new(
            HistogramOpts::new("sideline_timer_millis", "Sideline timers in milliseconds."),
            &["scope", "name"],
        )?;
        let gauges = IntGaugeVec::new(
            Opts::new("sideline_gauge", "Sideline gauges."),
            &["scope", "name"],
        )?;
        registry.register(Box::new(counters.clone()))?;
        registry.register(Box::new(timers.clone()))?;
        registry.register(Box::new(gauges.clone()))?;
        Ok(Self {
            registry,
            counters,
            timers,
            gauges,
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }
}

impl MetricsSink for PrometheusMetricsSink {
    fn count(&self, scope: &str, name: &str, delta: u64) {
        self.counters.with_label_values(&[scope, name]).inc_by(delta);
    }

    fn timer(&self, scope: &str, name: &str, millis: u64) {
        self.timers
            .with_label_values(&[scope, name])
            .observe(millis as f64);
    }

    fn gauge(&self, scope: &str, name: &str, value: i64) {
        self.gauges.with_label_values(&[scope, name]).set(value);
    }
}

/// Process-wide default sink. Falls back to the no-op sink if collector
/// registration fails.
pub fn default_metrics() -> Arc<dyn MetricsSink> {
    static DEFAULT: Lazy<Arc<dyn MetricsSink>> = Lazy::new(|| match PrometheusMetricsSink::new() {
        Ok(sink) => Arc::new(sink),
        Err(error) => {
            warn!(error = %error, "Failed to build the prometheus metrics sink, metrics are dropped.");
            Arc::new(NoopMetricsSink)
        }
    });
    DEFAULT.clone()
}
