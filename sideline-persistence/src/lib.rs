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

//! Durable KV adapters for consumer offsets and sideline requests.
//!
//! The store is hierarchical. For a given adapter rooted at `<root>/<prefix>`:
//!
//! ```text
//! <root>/<prefix>/consumers/<sourceId>/<partition>   -> ASCII decimal offset
//! <root>/<prefix>/requests/<identifier>/<partition>  -> JSON request payload
//! ```
//!
//! Clearing a leaf prunes any now-empty parent directories so that listing
//! operations never surface exhausted entries.

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

mod file_backed;
mod in_memory;

pub use file_backed::FileBackedAdapter;
pub use in_memory::InMemoryAdapter;

pub const CONSUMERS_NODE: &str = "consumers";
pub const REQUESTS_NODE: &str = "requests";

pub type PersistenceResult<T> = Result<T, PersistenceError>;

#[derive(thiserror::Error, Debug)]
pub enum PersistenceError {
    /// The adapter was used before `open` or after a failed `open`.
    #[error("Persistence adapter has not been opened.")]
    NotOpen,
    #[error("Stored value at `{key}` is corrupted: {message}")]
    Corrupted { key: String, message: String },
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl PersistenceError {
    pub fn corrupted(key: impl Into<String>, message: impl ToString) -> Self {
        PersistenceError::Corrupted {
            key: key.into(),
            message: message.to_string(),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SidelineRequestType {
    Start,
    Stop,
}

/// One persisted sideline request entry, scoped to a single partition.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SidelineRequestRecord {
    pub request_type: SidelineRequestType,
    /// Opaque serialized filter steps; re-hydrated by the caller.
    pub steps_blob: Vec<u8>,
    pub starting_offset: i64,
    pub ending_offset: Option<i64>,
}

/// Stored JSON form of a [`SidelineRequestRecord`].
#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StoredSidelineRequest {
    #[serde(rename = "type")]
    request_type: SidelineRequestType,
    starting_offset: i64,
    ending_offset: Option<i64>,
    filter_chain_step: String,
}

fn encode_sideline_request(record: &SidelineRequestRecord) -> String {
    let stored = StoredSidelineRequest {
        request_type: record.request_type,
        starting_offset: record.starting_offset,
        ending_offset: record.ending_offset,
        filter_chain_step: base64::encode(&record.steps_blob),
    };
    serde_json::to_string(&stored).expect("A sideline request should be JSON serializable.")
}

fn decode_sideline_request(key: &str, json: &str) -> PersistenceResult<SidelineRequestRecord> {
    let stored: StoredSidelineRequest =
        serde_json::from_str(json).map_err(|error| PersistenceError::corrupted(key, error))?;
    let steps_blob = base64::decode(&stored.filter_chain_step)
        .map_err(|error| PersistenceError::corrupted(key, error))?;
    Ok(SidelineRequestRecord {
        request_type: stored.request_type,
        steps_blob,
        starting_offset: stored.starting_offset,
        ending_offset: stored.ending_offset,
    })
}

fn decode_offset(key: &str, ascii: &str) -> PersistenceResult<i64> {
    ascii
        .trim()
        .parse::<i64>()
        .map_err(|error| PersistenceError::corrupted(key, error))
}

/// Durable KV capability shared by every virtual source and by the sideline
/// controller. Implementations serialize concurrent mutations internally.
#[async_trait]
pub trait PersistenceAdapter: Send + Sync + fmt::Debug {
    /// Must precede any other call. Idempotent within a single process.
    async fn open(&self) -> PersistenceResult<()>;

    async fn persist_consumer_offset(
        &self,
        source_id: &str,
        partition: i32,
        offset: i64,
    ) -> PersistenceResult<()>;

    async fn retrieve_consumer_offset(
        &self,
        source_id: &str,
        partition: i32,
    ) -> PersistenceResult<Option<i64>>;

    /// Removes the leaf and any now-empty parents up to the source id node.
    async fn clear_consumer_offset(&self, source_id: &str, partition: i32)
        -> PersistenceResult<()>;

    async fn persist_sideline_request(
        &self,
        identifier: &str,
        partition: i32,
        record: &SidelineRequestRecord,
    ) -> PersistenceResult<()>;

    async fn retrieve_sideline_request(
        &self,
        identifier: &str,
        partition: i32,
    ) -> PersistenceResult<Option<SidelineRequestRecord>>;

    async fn clear_sideline_request(
        &self,
        identifier: &str,
        partition: i32,
    ) -> PersistenceResult<()>;

    async fn list_sideline_identifiers(&self) -> PersistenceResult<Vec<String>>;

    async fn list_sideline_partitions(&self, identifier: &str) -> PersistenceResult<Vec<i32>>;
}

#[cfg(any(test, feature = "testsuite"))]
pub mod test_suite {
    //! Contract tests shared by every adapter implementation.

    use super::*;

    fn sample_record(request_type: SidelineRequestType) -> SidelineRequestRecord {
        SidelineRequestRecord {
            request_type,
            steps_blob: br#"[{"equals":{"field":"user","value":"bob"}}]"#.to_vec(),
            starting_offset: 41,
            ending_offset: match request_type {
                SidelineRequestType::Start => None,
                SidelineRequestType::Stop => Some(1_312),
            },
        }
    }

    pub async fn persistence_adapter_test_suite(
        adapter: &dyn PersistenceAdapter,
    ) -> anyhow::Result<()> {
        adapter.open().await?;
        // `open` is idempotent within a process.
        adapter.open().await?;

        // Consumer offsets: persist / retrieve / overwrite / clear.
        assert_eq!(adapter.retrieve_consumer_offset("src-0", 0).await?, None);
        adapter.persist_consumer_offset("src-0", 0, 7).await?;
        adapter.persist_consumer_offset("src-0", 3, 12).await?;
        assert_eq!(adapter.retrieve_consumer_offset("src-0", 0).await?, Some(7));
        adapter.persist_consumer_offset("src-0", 0, 9).await?;
        assert_eq!(adapter.retrieve_consumer_offset("src-0", 0).await?, Some(9));
        adapter.clear_consumer_offset("src-0", 0).await?;
        assert_eq!(adapter.retrieve_consumer_offset("src-0", 0).await?, None);
        assert_eq!(
            adapter.retrieve_consumer_offset("src-0", 3).await?,
            Some(12)
        );
        adapter.clear_consumer_offset("src-0", 3).await?;
        // Clearing an absent leaf is not an error.
        adapter.clear_consumer_offset("src-0", 3).await?;

        // Sideline requests: round-trip both request types.
        let start = sample_record(SidelineRequestType::Start);
        let stop = sample_record(SidelineRequestType::Stop);
        adapter.persist_sideline_request("01H", 0, &start).await?;
        adapter.persist_sideline_request("01H", 1, &start).await?;
        adapter.persist_sideline_request("02J", 0, &stop).await?;
        assert_eq!(
            adapter.retrieve_sideline_request("01H", 0).await?,
            Some(start.clone())
        );
        assert_eq!(
            adapter.retrieve_sideline_request("02J", 0).await?,
            Some(stop.clone())
        );
        assert_eq!(adapter.retrieve_sideline_request("02J", 1).await?, None);

        let mut identifiers = adapter.list_sideline_identifiers().await?;
        identifiers.sort();
        assert_eq!(identifiers, vec!["01H".to_string(), "02J".to_string()]);
        assert_eq!(adapter.list_sideline_partitions("01H").await?, vec![0, 1]);

        // Clearing every partition entry prunes the identifier node.
        adapter.clear_sideline_request("01H", 0).await?;
        assert_eq!(adapter.list_sideline_partitions("01H").await?, vec![1]);
        adapter.clear_sideline_request("01H", 1).await?;
        assert_eq!(
            adapter.list_sideline_identifiers().await?,
            vec!["02J".to_string()]
        );
        adapter.clear_sideline_request("02J", 0).await?;
        assert!(adapter.list_sideline_identifiers().await?.is_empty());
        Ok(())
    }

    pub async fn not_open_test_suite(adapter: &dyn PersistenceAdapter) {
        assert!(matches!(
            adapter.persist_consumer_offset("src-0", 0, 7).await,
            Err(PersistenceError::NotOpen)
        ));
        assert!(matches!(
            adapter.retrieve_consumer_offset("src-0", 0).await,
            Err(PersistenceError::NotOpen)
        ));
        assert!(matches!(
            adapter.list_sideline_identifiers().await,
            Err(PersistenceError::NotOpen)
        ));
    }
}
