// src/cache/mod.rs

//! Fingerprinted result cache
//!
//! Every resolution operation (atom matching, satisfaction checks, tree
//! building) reads through a [`ResultCache`]. An entry records the
//! fingerprint components that were current when it was written; a read
//! whose components differ discards the entry and recomputes. There is no
//! way to read the store without supplying the current fingerprint.
//!
//! Entries live in memory and, when a root directory is configured, as JSON
//! blobs under `<root>/<namespace>/<key>.json` so they survive restarts.

use crate::error::Result;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use walkdir::WalkDir;

/// Kind of cached operation; keys never collide across namespaces
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CacheNamespace {
    AtomMatch,
    DependencyTree,
    Satisfaction,
    RemovalTree,
}

impl CacheNamespace {
    pub const ALL: [CacheNamespace; 4] = [
        CacheNamespace::AtomMatch,
        CacheNamespace::DependencyTree,
        CacheNamespace::Satisfaction,
        CacheNamespace::RemovalTree,
    ];

    pub fn as_str(&self) -> &str {
        match self {
            CacheNamespace::AtomMatch => "atom_match",
            CacheNamespace::DependencyTree => "dependency_tree",
            CacheNamespace::Satisfaction => "satisfaction",
            CacheNamespace::RemovalTree => "removal_tree",
        }
    }
}

/// Component name used for a repository's database checksum
pub fn repository_component(name: &str) -> String {
    format!("repo:{}", name)
}

/// Component name used for the installed database checksum
pub const INSTALLED_COMPONENT: &str = "installed";

/// The state a cached value was computed against
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fingerprint {
    components: BTreeMap<String, String>,
}

impl Fingerprint {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, component: impl Into<String>, value: impl Into<String>) {
        self.components.insert(component.into(), value.into());
    }

    pub fn with(mut self, component: impl Into<String>, value: impl Into<String>) -> Self {
        self.insert(component, value);
        self
    }

    pub fn get(&self, component: &str) -> Option<&str> {
        self.components.get(component).map(String::as_str)
    }

    /// Whether the value depended on the named repository
    pub fn mentions_repository(&self, name: &str) -> bool {
        self.components.contains_key(&repository_component(name))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct CacheEntry {
    query: String,
    fingerprint: Fingerprint,
    value: serde_json::Value,
}

/// Hit/miss counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub entries: usize,
}

/// Read-through cache shared by one resolution context
///
/// Methods take `&self`; computations may themselves consult the cache.
#[derive(Debug, Default)]
pub struct ResultCache {
    entries: RefCell<HashMap<(CacheNamespace, String), CacheEntry>>,
    root: Option<PathBuf>,
    hits: Cell<u64>,
    misses: Cell<u64>,
}

fn entry_key(namespace: CacheNamespace, query: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(namespace.as_str().as_bytes());
    hasher.update([0u8]);
    hasher.update(query.as_bytes());
    format!("{:x}", hasher.finalize())
}

impl ResultCache {
    /// A memory-only cache
    pub fn new() -> Self {
        Self::default()
    }

    /// A cache persisted under `root`
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self {
            root: Some(root.into()),
            ..Self::default()
        }
    }

    pub fn root(&self) -> Option<&Path> {
        self.root.as_deref()
    }

    fn blob_path(&self, namespace: CacheNamespace, key: &str) -> Option<PathBuf> {
        self.root
            .as_ref()
            .map(|root| root.join(namespace.as_str()).join(format!("{}.json", key)))
    }

    fn load_blob(&self, namespace: CacheNamespace, key: &str) -> Option<CacheEntry> {
        let path = self.blob_path(namespace, key)?;
        let data = fs::read(&path).ok()?;
        match serde_json::from_slice(&data) {
            Ok(entry) => Some(entry),
            Err(e) => {
                warn!("Discarding unreadable cache blob {}: {}", path.display(), e);
                let _ = fs::remove_file(&path);
                None
            }
        }
    }

    fn store_blob(&self, namespace: CacheNamespace, key: &str, entry: &CacheEntry) {
        let Some(path) = self.blob_path(namespace, key) else {
            return;
        };
        let write = || -> Result<()> {
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)?;
            }
            let tmp = path.with_extension("json.tmp");
            fs::write(&tmp, serde_json::to_vec(entry)?)?;
            fs::rename(&tmp, &path)?;
            Ok(())
        };
        if let Err(e) = write() {
            warn!("Failed to persist cache entry {}: {}", path.display(), e);
        }
    }

    fn remove_blob(&self, namespace: CacheNamespace, key: &str) {
        if let Some(path) = self.blob_path(namespace, key) {
            let _ = fs::remove_file(path);
        }
    }

    /// Return the cached value for `query`, computing it when absent or stale
    ///
    /// # Arguments
    ///
    /// * `namespace` - Operation kind
    /// * `query` - Canonical description of every input parameter
    /// * `fingerprint` - Current state of every database the value depends on
    /// * `compute` - Produces the value on a miss
    pub fn get_or_compute<T, F>(
        &self,
        namespace: CacheNamespace,
        query: &str,
        fingerprint: &Fingerprint,
        compute: F,
    ) -> Result<T>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Result<T>,
    {
        let key = entry_key(namespace, query);

        let cached = {
            let entries = self.entries.borrow();
            entries.get(&(namespace, key.clone())).cloned()
        }
        .or_else(|| self.load_blob(namespace, &key));

        if let Some(entry) = cached {
            if entry.query == query && entry.fingerprint == *fingerprint {
                match serde_json::from_value::<T>(entry.value.clone()) {
                    Ok(value) => {
                        self.hits.set(self.hits.get() + 1);
                        self.entries.borrow_mut().insert((namespace, key), entry);
                        return Ok(value);
                    }
                    Err(e) => warn!("Cached {} value unreadable: {}", namespace.as_str(), e),
                }
            } else {
                debug!("Stale {} entry for {}", namespace.as_str(), query);
            }
            self.entries.borrow_mut().remove(&(namespace, key.clone()));
            self.remove_blob(namespace, &key);
        }

        self.misses.set(self.misses.get() + 1);
        let value = compute()?;

        let entry = CacheEntry {
            query: query.to_string(),
            fingerprint: fingerprint.clone(),
            value: serde_json::to_value(&value)?,
        };
        self.store_blob(namespace, &key, &entry);
        self.entries.borrow_mut().insert((namespace, key), entry);

        Ok(value)
    }

    /// Drop every entry
    pub fn purge(&self) {
        self.entries.borrow_mut().clear();
        for namespace in CacheNamespace::ALL {
            self.purge_blobs(namespace, |_| true);
        }
        debug!("Result cache purged");
    }

    /// Drop every entry of one namespace
    pub fn purge_namespace(&self, namespace: CacheNamespace) {
        self.entries
            .borrow_mut()
            .retain(|(ns, _), _| *ns != namespace);
        self.purge_blobs(namespace, |_| true);
    }

    /// Drop every entry whose value depended on the named repository
    pub fn purge_repository(&self, name: &str) {
        self.entries
            .borrow_mut()
            .retain(|_, entry| !entry.fingerprint.mentions_repository(name));
        for namespace in CacheNamespace::ALL {
            self.purge_blobs(namespace, |entry| entry.fingerprint.mentions_repository(name));
        }
        debug!("Purged cache entries for repository {}", name);
    }

    fn purge_blobs(&self, namespace: CacheNamespace, matches: impl Fn(&CacheEntry) -> bool) {
        let Some(root) = &self.root else {
            return;
        };
        let dir = root.join(namespace.as_str());
        for item in WalkDir::new(&dir)
            .min_depth(1)
            .max_depth(1)
            .into_iter()
            .filter_map(|e| e.ok())
        {
            let path = item.path();
            if path.extension().is_none_or(|ext| ext != "json") {
                continue;
            }
            let remove = fs::read(path)
                .ok()
                .and_then(|data| serde_json::from_slice::<CacheEntry>(&data).ok())
                .is_none_or(|entry| matches(&entry));
            if remove {
                let _ = fs::remove_file(path);
            }
        }
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.get(),
            misses: self.misses.get(),
            entries: self.entries.borrow().len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn fp(repo_checksum: &str) -> Fingerprint {
        Fingerprint::new().with(repository_component("main"), repo_checksum)
    }

    #[test]
    fn test_hit_does_not_recompute() {
        let cache = ResultCache::new();
        let first: i64 = cache
            .get_or_compute(CacheNamespace::AtomMatch, "q", &fp("a"), || Ok(7))
            .unwrap();
        let second: i64 = cache
            .get_or_compute(CacheNamespace::AtomMatch, "q", &fp("a"), || {
                panic!("must not recompute")
            })
            .unwrap();
        assert_eq!(first, second);
        assert_eq!(cache.stats().hits, 1);
        assert_eq!(cache.stats().misses, 1);
    }

    #[test]
    fn test_changed_fingerprint_recomputes() {
        let cache = ResultCache::new();
        let _: i64 = cache
            .get_or_compute(CacheNamespace::AtomMatch, "q", &fp("a"), || Ok(1))
            .unwrap();
        let value: i64 = cache
            .get_or_compute(CacheNamespace::AtomMatch, "q", &fp("b"), || Ok(2))
            .unwrap();
        assert_eq!(value, 2);
    }

    #[test]
    fn test_namespaces_do_not_collide() {
        let cache = ResultCache::new();
        let _: i64 = cache
            .get_or_compute(CacheNamespace::AtomMatch, "q", &fp("a"), || Ok(1))
            .unwrap();
        let value: i64 = cache
            .get_or_compute(CacheNamespace::RemovalTree, "q", &fp("a"), || Ok(2))
            .unwrap();
        assert_eq!(value, 2);
    }

    #[test]
    fn test_nested_compute() {
        let cache = ResultCache::new();
        let outer: i64 = cache
            .get_or_compute(CacheNamespace::DependencyTree, "outer", &fp("a"), || {
                let inner: i64 = cache.get_or_compute(
                    CacheNamespace::AtomMatch,
                    "inner",
                    &fp("a"),
                    || Ok(20),
                )?;
                Ok(inner + 1)
            })
            .unwrap();
        assert_eq!(outer, 21);
        assert_eq!(cache.stats().entries, 2);
    }

    #[test]
    fn test_persists_across_instances() {
        let dir = TempDir::new().unwrap();
        {
            let cache = ResultCache::with_root(dir.path());
            let _: String = cache
                .get_or_compute(CacheNamespace::Satisfaction, "q", &fp("a"), || {
                    Ok("stored".to_string())
                })
                .unwrap();
        }

        let cache = ResultCache::with_root(dir.path());
        let value: String = cache
            .get_or_compute(CacheNamespace::Satisfaction, "q", &fp("a"), || {
                Ok("recomputed".to_string())
            })
            .unwrap();
        assert_eq!(value, "stored");
    }

    #[test]
    fn test_purge_repository() {
        let dir = TempDir::new().unwrap();
        let cache = ResultCache::with_root(dir.path());
        let other = Fingerprint::new().with(repository_component("extra"), "x");

        let _: i64 = cache
            .get_or_compute(CacheNamespace::AtomMatch, "a", &fp("a"), || Ok(1))
            .unwrap();
        let _: i64 = cache
            .get_or_compute(CacheNamespace::AtomMatch, "b", &other, || Ok(2))
            .unwrap();

        cache.purge_repository("main");
        assert_eq!(cache.stats().entries, 1);

        let reopened = ResultCache::with_root(dir.path());
        let value: i64 = reopened
            .get_or_compute(CacheNamespace::AtomMatch, "a", &fp("a"), || Ok(10))
            .unwrap();
        assert_eq!(value, 10);
        let kept: i64 = reopened
            .get_or_compute(CacheNamespace::AtomMatch, "b", &other, || Ok(20))
            .unwrap();
        assert_eq!(kept, 2);
    }

    #[test]
    fn test_purge_everything() {
        let cache = ResultCache::new();
        let _: i64 = cache
            .get_or_compute(CacheNamespace::AtomMatch, "a", &fp("a"), || Ok(1))
            .unwrap();
        cache.purge();
        assert_eq!(cache.stats().entries, 0);
    }
}
