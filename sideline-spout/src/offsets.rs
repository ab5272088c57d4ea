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

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// One partition of one topic. Equality and ordering are by value.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PartitionKey {
    pub topic: String,
    pub partition: i32,
}

impl PartitionKey {
    pub fn new(topic: impl Into<String>, partition: i32) -> Self {
        Self {
            topic: topic.into(),
            partition,
        }
    }
}

/// Per-partition offset map. The stored offset for a partition is the last
/// fully acknowledged one; the next offset to consume is `stored + 1`.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OffsetMap(BTreeMap<PartitionKey, i64>);

impl OffsetMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn get(&self, key: &PartitionKey) -> Option<i64> {
        self.0.get(key).copied()
    }

    pub fn set(&mut self, key: PartitionKey, offset: i64) {
        self.0.insert(key, offset);
    }

    /// Right-biased merge: `other`'s value wins wherever both maps hold the
    /// partition.
    pub fn merge(&mut self, other: &OffsetMap) {
        for (key, offset) in &other.0 {
            self.0.insert(key.clone(), *offset);
        }
    }

    /// Per-partition lag of `self` behind `other`, for the partitions present
    /// in both maps.
    pub fn compare(&self, other: &OffsetMap) -> BTreeMap<PartitionKey, i64> {
        other
            .0
            .iter()
            .filter_map(|(key, their_offset)| {
                self.get(key)
                    .map(|our_offset| (key.clone(), their_offset - our_offset))
            })
            .collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&PartitionKey, i64)> {
        self.0.iter().map(|(key, offset)| (key, *offset))
    }

    pub fn partitions(&self) -> impl Iterator<Item = &PartitionKey> {
        self.0.keys()
    }
}

impl FromIterator<(PartitionKey, i64)> for OffsetMap {
    fn from_iter<T: IntoIterator<Item = (PartitionKey, i64)>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}
