// src/resolver/mod.rs

//! Package resolution
//!
//! A [`Resolver`] ties together the ordered repository set, the installed
//! database and a [`ResultCache`]. It provides:
//! - atom matching with multi-repository tie-breaking ([`matcher`])
//! - the satisfaction filter ([`satisfaction`])
//! - dependency trees and install queues ([`tree`])
//! - removal trees and queues ([`removal`])
//!
//! Resolution outcomes such as "not found" or "unresolved dependencies" are
//! returned as data; `Err` is reserved for failures of the databases
//! themselves.

pub mod matcher;
pub mod removal;
pub mod satisfaction;
pub mod tree;

pub use matcher::{MatchOptions, MatchResult};
pub use removal::RemovalTree;
pub use satisfaction::{Comparison, SatisfactionReport};
pub use tree::{DependencyTree, InstallQueue, RequiredPackages, TreeStatus, VisitedSet};

use crate::cache::{Fingerprint, INSTALLED_COMPONENT, ResultCache, repository_component};
use crate::db::models::Package;
use crate::db::PackageDatabase;
use crate::error::{Error, Result};
use crate::repository::RepositorySet;
use serde::{Deserialize, Serialize};
use std::cell::RefCell;
use std::collections::BTreeSet;
use std::fmt;
use tracing::warn;

/// Repository name used for matches against the installed database
pub const INSTALLED_REPOSITORY: &str = "installed";

/// Fingerprint value recorded for a repository that could not be queried
const UNAVAILABLE: &str = "unavailable";

/// A resolved package: its id inside one repository
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Match {
    pub package_id: i64,
    pub repository: String,
}

impl Match {
    pub fn new(package_id: i64, repository: impl Into<String>) -> Self {
        Self {
            package_id,
            repository: repository.into(),
        }
    }

    pub fn installed(package_id: i64) -> Self {
        Self::new(package_id, INSTALLED_REPOSITORY)
    }

    pub fn is_installed(&self) -> bool {
        self.repository == INSTALLED_REPOSITORY
    }
}

impl fmt::Display for Match {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.package_id, self.repository)
    }
}

/// Resolution context over a repository set and the installed database
pub struct Resolver<'a> {
    repos: &'a RepositorySet,
    installed: &'a dyn PackageDatabase,
    cache: &'a ResultCache,
    unavailable: RefCell<BTreeSet<String>>,
}

impl<'a> Resolver<'a> {
    pub fn new(
        repos: &'a RepositorySet,
        installed: &'a dyn PackageDatabase,
        cache: &'a ResultCache,
    ) -> Self {
        Self {
            repos,
            installed,
            cache,
            unavailable: RefCell::new(BTreeSet::new()),
        }
    }

    pub fn repositories(&self) -> &'a RepositorySet {
        self.repos
    }

    pub fn installed(&self) -> &'a dyn PackageDatabase {
        self.installed
    }

    pub fn cache(&self) -> &'a ResultCache {
        self.cache
    }

    /// Repositories skipped so far because they could not be queried
    pub fn unavailable(&self) -> Vec<String> {
        self.unavailable.borrow().iter().cloned().collect()
    }

    fn mark_unavailable(&self, name: &str) {
        if self.unavailable.borrow_mut().insert(name.to_string()) {
            warn!("Repository {} is not available, skipping", name);
        }
    }

    /// The database a match points into
    pub fn database(&self, m: &Match) -> Result<&'a dyn PackageDatabase> {
        if m.is_installed() {
            return Ok(self.installed);
        }
        let handle = self
            .repos
            .get(&m.repository)
            .ok_or_else(|| Error::NotFound(format!("repository {}", m.repository)))?;
        Ok(handle.database()?)
    }

    pub fn package(&self, m: &Match) -> Result<Package> {
        self.database(m)?.get_package(m.package_id)
    }

    /// Canonical atom string of a match
    pub fn atom_string(&self, m: &Match) -> Result<String> {
        Ok(self.package(m)?.atom())
    }

    /// Repository order as a cache query component
    fn set_identity(&self) -> String {
        self.repos.names().join(",")
    }

    /// Fingerprint components for the named repositories
    fn repository_fingerprint(&self, names: &[String]) -> Fingerprint {
        let mut fingerprint = Fingerprint::new();
        for name in names {
            let checksum = self
                .repos
                .get(name)
                .ok_or_else(|| Error::RepositoryUnavailable(name.clone()))
                .and_then(|handle| handle.database()?.checksum_fingerprint());
            match checksum {
                Ok(checksum) => fingerprint.insert(repository_component(name), checksum),
                Err(_) => {
                    self.mark_unavailable(name);
                    fingerprint.insert(repository_component(name), UNAVAILABLE);
                }
            }
        }
        fingerprint
    }

    fn installed_fingerprint(&self) -> Result<Fingerprint> {
        Ok(Fingerprint::new().with(INSTALLED_COMPONENT, self.installed.checksum_fingerprint()?))
    }

    /// Every repository plus the installed database
    fn full_fingerprint(&self) -> Result<Fingerprint> {
        let mut fingerprint = self.repository_fingerprint(&self.repos.names());
        fingerprint.insert(INSTALLED_COMPONENT, self.installed.checksum_fingerprint()?);
        Ok(fingerprint)
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    //! Fixtures shared by the resolver tests

    use crate::db::models::PackageRecord;
    use crate::db::{InstalledDatabase, SqlitePackageDb};
    use crate::repository::{RepositoryHandle, RepositorySet};

    /// Parse `cat/name-version` into a record
    pub fn record(cpv: &str) -> PackageRecord {
        let (cat, rest) = cpv.split_once('/').unwrap();
        let (name, version) = rest.rsplit_once('-').unwrap();
        PackageRecord::new(cat, name, version)
    }

    pub fn repo(name: &str, records: &[PackageRecord]) -> RepositoryHandle {
        let db = SqlitePackageDb::open_in_memory(name).unwrap();
        for r in records {
            db.add_package(r, Some(name)).unwrap();
        }
        RepositoryHandle::remote(name, &format!("https://{}.example", name), Some(db))
    }

    pub fn repo_set(repos: Vec<RepositoryHandle>) -> RepositorySet {
        let mut set = RepositorySet::new();
        for r in repos {
            set.push(r);
        }
        set
    }

    pub fn installed(records: &[PackageRecord]) -> SqlitePackageDb {
        let db = SqlitePackageDb::open_in_memory("installed").unwrap();
        for r in records {
            db.add_package(r, None).unwrap();
        }
        db
    }
}
