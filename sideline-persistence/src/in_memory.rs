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
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::{
    decode_offset, decode_sideline_request, encode_sideline_request, PersistenceAdapter,
    PersistenceError, PersistenceResult, SidelineRequestRecord, CONSUMERS_NODE, REQUESTS_NODE,
};

/// In-memory adapter. Survives nothing, which is the point: tests and local
/// runs share one [`InMemoryAdapter`] across simulated restarts by cloning it.
#[derive(Clone, Debug, Default)]
pub struct InMemoryAdapter {
    entries: Arc<Mutex<BTreeMap<String, String>>>,
    opened: Arc<AtomicBool>,
}

impl InMemoryAdapter {
    pub fn new() -> Self {
        Self::default()
    }

    fn ensure_open(&self) -> PersistenceResult<()> {
        if self.opened.load(Ordering::Acquire) {
            return Ok(());
        }
        Err(PersistenceError::NotOpen)
    }

    fn consumer_key(source_id: &str, partition: i32) -> String {
        format!("{CONSUMERS_NODE}/{source_id}/{partition}")
    }

    fn request_key(identifier: &str, partition: i32) -> String {
        format!("{REQUESTS_NODE}/{identifier}/{partition}")
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, String>> {
        self.entries
            .lock()
            .expect("The persistence entry lock should not be poisoned.")
    }
}

#[async_trait]
impl PersistenceAdapter for InMemoryAdapter {
    async fn open(&self) -> PersistenceResult<()> {
        self.opened.store(true, Ordering::Release);
        Ok(())
    }

    async fn persist_consumer_offset(
        &self,
        source_id: &str,
        partition: i32,
        offset: i64,
    ) -> PersistenceResult<()> {
        self.ensure_open()?;
        self.lock()
            .insert(Self::consumer_key(source_id, partition), offset.to_string());
        Ok(())
    }

    async fn retrieve_consumer_offset(
        &self,
        source_id: &str,
        partition: i32,
    ) -> PersistenceResult<Option<i64>> {
        self.ensure_open()?;
        let key = Self::consumer_key(source_id, partition);
        match self.lock().get(&key) {
            Some(ascii) => Ok(Some(decode_offset(&key, ascii)?)),
            None => Ok(None),
        }
    }

    async fn clear_consumer_offset(
        &self,
        source_id: &str,
        partition: i32,
    ) -> PersistenceResult<()> {
        self.ensure_open()?;
        self.lock().remove(&Self::consumer_key(source_id, partition));
        Ok(())
    }

    async fn persist_sideline_request(
        &self,
        identifier: &str,
        partition: i32,
        record: &SidelineRequestRecord,
    ) -> PersistenceResult<()> {
        self.ensure_open()?;
        self.lock().insert(
            Self::request_key(identifier, partition),
            encode_sideline_request(record),
        );
        Ok(())
    }

    async fn retrieve_sideline_request(
        &self,
        identifier: &str,
        partition: i32,
    ) -> PersistenceResult<Option<SidelineRequestRecord>> {
        self.ensure_open()?;
        let key = Self::request_key(identifier, partition);
        match self.lock().get(&key) {
            Some(json) => Ok(Some(decode_sideline_request(&key, json)?)),
            None => Ok(None),
        }
    }

    async fn clear_sideline_request(
        &self,
        identifier: &str,
        partition: i32,
    ) -> PersistenceResult<()> {
        self.ensure_open()?;
        self.lock().remove(&Self::request_key(identifier, partition));
        Ok(())
    }

    async fn list_sideline_identifiers(&self) -> PersistenceResult<Vec<String>> {
        self.ensure_open()?;
        let prefix = format!("{REQUESTS_NODE}/");
        let mut identifiers: Vec<String> = self
            .lock()
            .keys()
            .filter_map(|key| key.strip_prefix(&prefix))
            .filter_map(|rest| rest.split('/').next())
            .map(|identifier| identifier.to_string())
            .collect();
        identifiers.dedup();
        Ok(identifiers)
    }

    async fn list_sideline_partitions(&self, identifier: &str) -> PersistenceResult<Vec<i32>> {
        self.ensure_open()?;
        let prefix = format!("{REQUESTS_NODE}/{identifier}/");
        let mut partitions = Vec::new();
        for key in self.lock().keys() {
            if let Some(partition_str) = key.strip_prefix(&prefix) {
                let partition = partition_str
                    .parse::<i32>()
                    .map_err(|error| PersistenceError::corrupted(key.clone(), error))?;
                partitions.push(partition);
            }
        }
        partitions.sort_unstable();
        Ok(partitions)
    }
}
