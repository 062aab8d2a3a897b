//! Local mirror of the chunks already stored remotely.

use std::collections::BTreeMap;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RemoteFileError {
    #[error("Duplicate upload timestamp {0}")]
    DuplicateTimestamp(u64),
}

/// A chunk already persisted in the remote folder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteFile {
    /// Remote file name, the decimal upload timestamp.
    pub name: String,
    pub remote_path: String,
    pub size: u64,
    pub last_modified: String,
    pub upload_timestamp: u64,
}

/// Remote files keyed by upload timestamp, with a running byte total.
#[derive(Debug, Default, Clone)]
pub struct RemoteFileSet {
    files: BTreeMap<u64, RemoteFile>,
    total_bytes: u64,
}

impl RemoteFileSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a file. Timestamps are unique; a repeat is rejected and leaves the
    /// set untouched.
    pub fn insert(&mut self, file: RemoteFile) -> Result<(), RemoteFileError> {
        let timestamp = file.upload_timestamp;
        if self.files.contains_key(&timestamp) {
            return Err(RemoteFileError::DuplicateTimestamp(timestamp));
        }
        self.total_bytes += file.size;
        self.files.insert(timestamp, file);
        Ok(())
    }

    pub fn get(&self, timestamp: u64) -> Option<&RemoteFile> {
        self.files.get(&timestamp)
    }

    /// Sum of `size` over every file.
    pub fn total_bytes(&self) -> u64 {
        self.total_bytes
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    /// Newest upload timestamp, if any.
    pub fn latest_timestamp(&self) -> Option<u64> {
        self.files.keys().next_back().copied()
    }

    /// Files in timestamp order.
    pub fn iter(&self) -> impl Iterator<Item = &RemoteFile> {
        self.files.values()
    }
}
