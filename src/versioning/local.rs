//! Scope-local version cache
//!
//! Remembers versions observed or staged within one unit of work so they
//! are not re-read from the store. Shared with transaction staging, which
//! drops staged keys from it on commit and rollback.

use std::collections::HashMap;

use parking_lot::Mutex;

use super::version_store::Version;

#[derive(Debug, Default)]
pub struct LocalVersions {
    versions: Mutex<HashMap<String, Version>>,
}

impl LocalVersions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<Version> {
        self.versions.lock().get(key).cloned()
    }

    pub fn insert(&self, key: impl Into<String>, version: impl Into<Version>) {
        self.versions.lock().insert(key.into(), version.into());
    }

    pub fn extend(&self, entries: impl IntoIterator<Item = (String, Version)>) {
        self.versions.lock().extend(entries);
    }

    pub fn remove(&self, key: &str) -> Option<Version> {
        self.versions.lock().remove(key)
    }

    pub fn remove_all<'a>(&self, keys: impl IntoIterator<Item = &'a String>) {
        let mut versions = self.versions.lock();
        for key in keys {
            versions.remove(key);
        }
    }

    pub fn len(&self) -> usize {
        self.versions.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.versions.lock().is_empty()
    }

    pub fn clear(&self) {
        self.versions.lock().clear();
    }
}
