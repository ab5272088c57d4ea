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

use std::cell::RefCell;
use std::sync::Arc;

use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};

use crate::models::Message;

/// A deterministic predicate over messages. Steps are plain data so that a
/// persisted step list re-hydrates to a structurally equal predicate.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterStep {
    /// Matches when the named field of the record value equals `value`.
    Equals {
        field: String,
        value: serde_json::Value,
    },
    /// Matches when the named field is a string containing `needle`.
    Contains { field: String, needle: String },
    /// Matches when the wrapped step does not.
    Not(Box<FilterStep>),
}

impl FilterStep {
    pub fn matches(&self, message: &Message) -> bool {
        match self {
            FilterStep::Equals { field, value } => message.value.get(field) == Some(value),
            FilterStep::Contains { field, needle } => message
                .value
                .get(field)
                .and_then(|field_value| field_value.as_str())
                .map(|text| text.contains(needle.as_str()))
                .unwrap_or(false),
            FilterStep::Not(step) => !step.matches(message),
        }
    }

    /// The negation of this step. Double negation unwraps.
    pub fn negated(self) -> FilterStep {
        match self {
            FilterStep::Not(step) => *step,
            step => FilterStep::Not(Box::new(step)),
        }
    }
}

pub fn encode_steps(steps: &[FilterStep]) -> Vec<u8> {
    serde_json::to_vec(steps).expect("A filter step list should be JSON serializable.")
}

pub fn decode_steps(blob: &[u8]) -> anyhow::Result<Vec<FilterStep>> {
    let steps = serde_json::from_slice(blob)?;
    Ok(steps)
}

/// Ordered list of filter steps keyed by sideline identifier. A chain matches
/// a message iff any constituent step matches.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct FilterChain {
    entries: Vec<(String, Vec<FilterStep>)>,
}

impl FilterChain {
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn matches(&self, message: &Message) -> bool {
        self.entries
            .iter()
            .flat_map(|(_, steps)| steps)
            .any(|step| step.matches(message))
    }

    /// Attaches `steps` under `identifier`. Re-attaching an identifier
    /// replaces its previous steps, which makes the resume protocol
    /// idempotent.
    pub fn add_steps(&mut self, identifier: &str, steps: Vec<FilterStep>) {
        self.remove_steps(identifier);
        self.entries.push((identifier.to_string(), steps));
    }

    /// Detaches and returns all steps tagged with `identifier`.
    pub fn remove_steps(&mut self, identifier: &str) -> Option<Vec<FilterStep>> {
        let position = self
            .entries
            .iter()
            .position(|(entry_id, _)| entry_id == identifier)?;
        Some(self.entries.remove(position).1)
    }

    /// Looks up the identifier whose steps structurally equal `steps`.
    pub fn find_by_steps(&self, steps: &[FilterStep]) -> Option<&str> {
        self.entries
            .iter()
            .find(|(_, entry_steps)| entry_steps == steps)
            .map(|(identifier, _)| identifier.as_str())
    }

    pub fn identifiers(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(identifier, _)| identifier.as_str())
    }
}

/// Copy-on-write handle to a [`FilterChain`]. Writers swap in a new snapshot;
/// the reading worker is lock-free.
#[derive(Clone, Debug, Default)]
pub struct FilterChainHandle(Arc<ArcSwap<FilterChain>>);

impl FilterChainHandle {
    pub fn new(chain: FilterChain) -> Self {
        Self(Arc::new(ArcSwap::from_pointee(chain)))
    }

    /// Current snapshot. The returned chain is immutable.
    pub fn load(&self) -> Arc<FilterChain> {
        self.0.load_full()
    }

    pub fn add_steps(&self, identifier: &str, steps: Vec<FilterStep>) {
        self.0.rcu(|chain| {
            let mut next = FilterChain::clone(chain);
            next.add_steps(identifier, steps.clone());
            next
        });
    }

    pub fn remove_steps(&self, identifier: &str) -> Option<Vec<FilterStep>> {
        let removed = RefCell::new(None);
        self.0.rcu(|chain| {
            let mut next = FilterChain::clone(chain);
            *removed.borrow_mut() = next.remove_steps(identifier);
            next
        });
        removed.into_inner()
    }

    pub fn find_by_steps(&self, steps: &[FilterStep]) -> Option<String> {
        self.load()
            .find_by_steps(steps)
            .map(|identifier| identifier.to_string())
    }
}
