// Copyright © Aptos Foundation
// SPDX-License-Identifier: Apache-2.0

use std::{collections::BTreeMap, sync::Arc};
use uuid::Uuid;

/// Key under which the per-run execution id is recorded.
pub const EXECUTION_ID_KEY: &str = "execution.id";
/// Comma-separated list of unique tokens handed out by `ensure_unique_id`.
pub const UNIQUE_IDS_KEY: &str = "execution.unique-ids";
/// Enables the pre-evaluation rewrite rules. Defaults to on.
pub const OPTIMIZATION_KEY: &str = "execution.optimization";
/// Comma-separated list of files to be shipped alongside the job.
pub const CACHED_FILES_KEY: &str = "execution.cached-files";

/// An immutable string-keyed configuration. Setters return a new value, so
/// a config can safely serve as a cache key; sub-trees evaluated under a
/// transformed config are keyed by the transformed value.
#[derive(Clone, Debug, Default, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct JobConfig {
    entries: Arc<BTreeMap<String, String>>,
}

impl JobConfig {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries.get(key).map(String::as_str)
    }

    pub fn set(&self, key: impl Into<String>, value: impl Into<String>) -> Self {
        let mut entries = (*self.entries).clone();
        entries.insert(key.into(), value.into());
        Self {
            entries: Arc::new(entries),
        }
    }

    pub fn remove(&self, key: &str) -> Self {
        if !self.entries.contains_key(key) {
            return self.clone();
        }
        let mut entries = (*self.entries).clone();
        entries.remove(key);
        Self {
            entries: Arc::new(entries),
        }
    }

    /// Stamps the id identifying one `run` invocation.
    pub fn with_execution_id(&self, id: Uuid) -> Self {
        self.set(EXECUTION_ID_KEY, id.to_string())
    }

    pub fn execution_id(&self) -> Option<&str> {
        self.get(EXECUTION_ID_KEY)
    }

    /// Generates a fresh token, records it under [`UNIQUE_IDS_KEY`] and
    /// returns it together with the updated config.
    pub fn ensure_unique_id(&self) -> (UniqueId, JobConfig) {
        let token = UniqueId(Uuid::new_v4().simple().to_string());
        let ids = match self.get(UNIQUE_IDS_KEY) {
            Some(existing) => format!("{},{}", existing, token.0),
            None => token.0.clone(),
        };
        (token.clone(), self.set(UNIQUE_IDS_KEY, ids))
    }

    pub fn optimization_enabled(&self) -> bool {
        self.get(OPTIMIZATION_KEY) != Some("false")
    }

    pub fn with_optimization(&self, enabled: bool) -> Self {
        self.set(OPTIMIZATION_KEY, enabled.to_string())
    }

    pub fn cached_files(&self) -> Vec<&str> {
        self.get(CACHED_FILES_KEY)
            .map(|files| files.split(',').collect())
            .unwrap_or_default()
    }

    pub(crate) fn add_cached_file(&self, entry: &str) -> Self {
        let files = match self.get(CACHED_FILES_KEY) {
            Some(existing) => format!("{},{}", existing, entry),
            None => entry.to_string(),
        };
        self.set(CACHED_FILES_KEY, files)
    }
}

/// A fresh token for sub-trees that need identity-dependent configuration.
#[derive(Clone, Debug, Hash, PartialEq, Eq)]
pub struct UniqueId(String);

impl UniqueId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for UniqueId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A file shipped to the workers through the platform's file cache,
/// addressed job-side through a token-derived symlink.
#[derive(Clone, Debug, Hash, PartialEq, Eq)]
pub struct CachedFile {
    path: String,
    token: UniqueId,
}

impl CachedFile {
    pub(crate) fn new(path: String, token: UniqueId) -> Self {
        Self { path, token }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// The name the file is linked under on the workers.
    pub fn symlink_name(&self) -> String {
        let base = self.path.rsplit('/').next().unwrap_or(&self.path);
        format!("{}-{}", self.token, base)
    }

    pub(crate) fn config_entry(&self) -> String {
        format!("{}#{}", self.path, self.symlink_name())
    }
}
