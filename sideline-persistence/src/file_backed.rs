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

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use std::{fmt, io};

use async_trait::async_trait;
use backoff::ExponentialBackoffBuilder;
use tokio::fs;
use tracing::warn;

use crate::{
    decode_offset, decode_sideline_request, encode_sideline_request, PersistenceAdapter,
    PersistenceError, PersistenceResult, SidelineRequestRecord, CONSUMERS_NODE, REQUESTS_NODE,
};

/// Coordination-store adapter backed by a directory tree on the local file
/// system. Keys map to paths; values are small UTF-8 files.
pub struct FileBackedAdapter {
    root: PathBuf,
    opened: AtomicBool,
}

impl fmt::Debug for FileBackedAdapter {
    fn fmt(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
        formatter
            .debug_struct("FileBackedAdapter")
            .field("root", &self.root.display())
            .finish()
    }
}

impl FileBackedAdapter {
    /// Roots the adapter at `<root>/<prefix>`.
    pub fn new(root: impl Into<PathBuf>, prefix: &str) -> Self {
        Self {
            root: root.into().join(prefix),
            opened: AtomicBool::new(false),
        }
    }

    fn ensure_open(&self) -> PersistenceResult<()> {
        if self.opened.load(Ordering::Acquire) {
            return Ok(());
        }
        Err(PersistenceError::NotOpen)
    }

    fn consumer_path(&self, source_id: &str, partition: i32) -> PathBuf {
        self.root
            .join(CONSUMERS_NODE)
            .join(source_id)
            .join(partition.to_string())
    }

    fn request_path(&self, identifier: &str, partition: i32) -> PathBuf {
        self.root
            .join(REQUESTS_NODE)
            .join(identifier)
            .join(partition.to_string())
    }

    /// Writes a leaf value, creating intermediate directories as needed.
    /// Transient failures are retried with bounded exponential backoff.
    async fn write_leaf(&self, path: &Path, payload: &str) -> PersistenceResult<()> {
        let backoff = ExponentialBackoffBuilder::new()
            .with_initial_interval(Duration::from_millis(25))
            .with_max_elapsed_time(Some(Duration::from_secs(5)))
            .build();
        backoff::future::retry(backoff, || async {
            write_file(path, payload)
                .await
                .map_err(backoff::Error::transient)
        })
        .await?;
        Ok(())
    }

    async fn read_leaf(&self, path: &Path) -> PersistenceResult<Option<String>> {
        match fs::read_to_string(path).await {
            Ok(content) => Ok(Some(content)),
            Err(error) if error.kind() == ErrorKind::NotFound => Ok(None),
            Err(error) => Err(error.into()),
        }
    }

    /// Removes a partition leaf. The store is exactly two levels deep below
    /// the `consumers`/`requests` nodes, so pruning means dropping the
    /// enclosing source/identifier directory once its last entry is gone;
    /// the fixed top-level nodes are never touched.
    async fn clear_leaf(&self, path: &Path) -> PersistenceResult<()> {
        ignore_missing(fs::remove_file(path).await)?;
        if let Some(node_dir) = path.parent() {
            if let Err(error) = prune_node_dir(node_dir).await {
                warn!(error = ?error, path = %path.display(), "Failed to prune the emptied node directory.");
            }
        }
        Ok(())
    }

    async fn list_dir(&self, dir: &Path) -> PersistenceResult<Vec<String>> {
        let mut names = Vec::new();
        let mut entries = match fs::read_dir(dir).await {
            Ok(entries) => entries,
            Err(error) if error.kind() == ErrorKind::NotFound => return Ok(names),
            Err(error) => return Err(error.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
        names.sort();
        Ok(names)
    }
}

async fn write_file(path: &Path, payload: &str) -> io::Result<()> {
    if let Some(parent_dir) = path.parent() {
        fs::create_dir_all(parent_dir).await?;
    }
    fs::write(path, payload).await
}

/// A concurrent clear may already have removed the target.
fn ignore_missing(io_result: io::Result<()>) -> io::Result<()> {
    match io_result {
        Err(error) if error.kind() == ErrorKind::NotFound => Ok(()),
        other => other,
    }
}

/// Removes a source/identifier node directory iff it holds no partition
/// entries anymore, so that listing operations never surface exhausted
/// nodes.
async fn prune_node_dir(node_dir: &Path) -> io::Result<()> {
    let mut entries = match fs::read_dir(node_dir).await {
        Ok(entries) => entries,
        Err(error) if error.kind() == ErrorKind::NotFound => return Ok(()),
        Err(error) => return Err(error),
    };
    if entries.next_entry().await?.is_some() {
        return Ok(());
    }
    ignore_missing(fs::remove_dir(node_dir).await)
}

#[async_trait]
impl PersistenceAdapter for FileBackedAdapter {
    async fn open(&self) -> PersistenceResult<()> {
        fs::create_dir_all(self.root.join(CONSUMERS_NODE)).await?;
        fs::create_dir_all(self.root.join(REQUESTS_NODE)).await?;
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
        let path = self.consumer_path(source_id, partition);
        self.write_leaf(&path, &offset.to_string()).await
    }

    async fn retrieve_consumer_offset(
        &self,
        source_id: &str,
        partition: i32,
    ) -> PersistenceResult<Option<i64>> {
        self.ensure_open()?;
        let path = self.consumer_path(source_id, partition);
        match self.read_leaf(&path).await? {
            Some(content) => Ok(Some(decode_offset(&path.to_string_lossy(), &content)?)),
            None => Ok(None),
        }
    }

    async fn clear_consumer_offset(
        &self,
        source_id: &str,
        partition: i32,
    ) -> PersistenceResult<()> {
        self.ensure_open()?;
        let path = self.consumer_path(source_id, partition);
        self.clear_leaf(&path).await
    }

    async fn persist_sideline_request(
        &self,
        identifier: &str,
        partition: i32,
        record: &SidelineRequestRecord,
    ) -> PersistenceResult<()> {
        self.ensure_open()?;
        let path = self.request_path(identifier, partition);
        self.write_leaf(&path, &encode_sideline_request(record)).await
    }

    async fn retrieve_sideline_request(
        &self,
        identifier: &str,
        partition: i32,
    ) -> PersistenceResult<Option<SidelineRequestRecord>> {
        self.ensure_open()?;
        let path = self.request_path(identifier, partition);
        match self.read_leaf(&path).await? {
            Some(content) => Ok(Some(decode_sideline_request(
                &path.to_string_lossy(),
                &content,
            )?)),
            None => Ok(None),
        }
    }

    async fn clear_sideline_request(
        &self,
        identifier: &str,
        partition: i32,
    ) -> PersistenceResult<()> {
        self.ensure_open()?;
        let path = self.request_path(identifier, partition);
        self.clear_leaf(&path).await
    }

    async fn list_sideline_identifiers(&self) -> PersistenceResult<Vec<String>> {
        self.ensure_open()?;
        self.list_dir(&self.root.join(REQUESTS_NODE)).await
    }

    async fn list_sideline_partitions(&self, identifier: &str) -> PersistenceResult<Vec<i32>> {
        self.ensure_open()?;
        let dir = self.root.join(REQUESTS_NODE).join(identifier);
        let mut partitions = Vec::new();
        for name in self.list_dir(&dir).await? {
            let partition = name
                .parse::<i32>()
                .map_err(|error| PersistenceError::corrupted(dir.to_string_lossy(), error))?;
            partitions.push(partition);
        }
        partitions.sort_unstable();
        Ok(partitions)
    }
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::*;
    use crate::test_suite::{not_open_test_suite, persistence_adapter_test_suite};
    use crate::SidelineRequestType;

    #[tokio::test]
    async fn test_file_backed_adapter() -> anyhow::Result<()> {
        let tempdir = tempdir()?;
        let adapter = FileBackedAdapter::new(tempdir.path(), "sideline");
        persistence_adapter_test_suite(&adapter).await?;
        Ok(())
    }

    #[tokio::test]
    async fn test_file_backed_adapter_not_open() {
        let tempdir = tempdir().unwrap();
        let adapter = FileBackedAdapter::new(tempdir.path(), "sideline");
        not_open_test_suite(&adapter).await;
    }

    #[tokio::test]
    async fn test_layout_on_disk() -> anyhow::Result<()> {
        let tempdir = tempdir()?;
        let adapter = FileBackedAdapter::new(tempdir.path(), "sideline");
        adapter.open().await?;

        adapter.persist_consumer_offset("firehose-0", 2, 41).await?;
        let leaf = tempdir.path().join("sideline/consumers/firehose-0/2");
        assert_eq!(std::fs::read_to_string(&leaf)?, "41");

        let record = SidelineRequestRecord {
            request_type: SidelineRequestType::Start,
            steps_blob: b"blob".to_vec(),
            starting_offset: 41,
            ending_offset: None,
        };
        adapter.persist_sideline_request("01H", 2, &record).await?;
        let leaf = tempdir.path().join("sideline/requests/01H/2");
        let json: serde_json::Value = serde_json::from_str(&std::fs::read_to_string(&leaf)?)?;
        assert_eq!(json["type"], "START");
        Ok(())
    }

    #[tokio::test]
    async fn test_clear_prunes_empty_parents() -> anyhow::Result<()> {
        let tempdir = tempdir()?;
        let adapter = FileBackedAdapter::new(tempdir.path(), "sideline");
        adapter.open().await?;

        adapter.persist_consumer_offset("firehose-0", 0, 1).await?;
        adapter.persist_consumer_offset("firehose-0", 1, 2).await?;
        let source_dir = tempdir.path().join("sideline/consumers/firehose-0");

        adapter.clear_consumer_offset("firehose-0", 0).await?;
        assert!(source_dir.exists());

        adapter.clear_consumer_offset("firehose-0", 1).await?;
        assert!(!source_dir.exists());
        // The `consumers` node itself is left in place.
        assert!(tempdir.path().join("sideline/consumers").exists());
        Ok(())
    }
}
