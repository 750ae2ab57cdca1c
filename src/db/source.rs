// src/db/source.rs

//! The package database contract
//!
//! The resolver and the transaction pipeline only talk to package
//! metadata through [`PackageDatabase`]. Repository databases are
//! read-only through it; the installed-packages database additionally
//! implements [`InstalledDatabase`].

use crate::atom::Atom;
use crate::db::models::{
    ContentKind, DependencyKind, Package, PackageRecord, load_content, load_messages,
    load_needed, load_specifiers,
};
use crate::db::{self, schema};
use crate::error::{Error, Result};
use crate::version::VersionTriple;
use rusqlite::{Connection, OptionalExtension, params};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

/// Read access to one package database
pub trait PackageDatabase {
    /// Human readable identity (repository name or `installed`)
    fn label(&self) -> &str;

    /// Package ids with the given key
    ///
    /// A key without a category matches the name in any category.
    fn resolve_candidates(
        &self,
        key: &str,
        slot: Option<&str>,
        branch: Option<&str>,
        case_sensitive: bool,
    ) -> Result<Vec<i64>>;

    fn get_package(&self, id: i64) -> Result<Package>;

    fn get_version_triple(&self, id: i64) -> Result<VersionTriple>;

    /// Declared dependency specifiers
    fn get_dependencies(&self, id: i64) -> Result<Vec<String>>;

    /// Declared conflicts, without the `!` marker
    fn get_conflicts(&self, id: i64) -> Result<Vec<String>>;

    /// Shared libraries the package links against
    fn get_linked_libraries(&self, id: i64) -> Result<BTreeSet<String>>;

    fn get_content(&self, id: i64) -> Result<BTreeMap<String, ContentKind>>;

    fn get_messages(&self, id: i64) -> Result<Vec<String>>;

    /// The complete record, suitable for copying into another database
    fn get_record(&self, id: i64) -> Result<PackageRecord>;

    fn is_protected_system_package(&self, id: i64) -> Result<bool>;

    /// Whether the database can be queried at all
    fn is_available(&self) -> bool;

    /// Packages declaring a dependency on `id`'s key (slot-aware)
    fn reverse_dependencies(&self, id: i64) -> Result<Vec<i64>>;

    /// Packages linking against `library`
    fn search_needed(&self, library: &str) -> Result<Vec<i64>>;

    /// Packages whose content manifest lists `path`
    fn owns_file(&self, path: &str) -> Result<Vec<i64>>;

    /// Digest identifying the current database contents
    fn checksum_fingerprint(&self) -> Result<String>;
}

/// Write access to the installed-packages database
pub trait InstalledDatabase: PackageDatabase {
    /// Register a package, returning its new installed id
    fn add_package(&self, record: &PackageRecord, origin: Option<&str>) -> Result<i64>;

    fn remove_package(&self, id: i64) -> Result<()>;
}

/// SQLite-backed package database
pub struct SqlitePackageDb {
    conn: Connection,
    label: String,
}

impl SqlitePackageDb {
    /// Open an existing database file
    pub fn open(path: &str, label: &str) -> Result<Self> {
        let conn = db::open(path)?;
        Ok(Self {
            conn,
            label: label.to_string(),
        })
    }

    /// Open or create a database file
    pub fn create(path: &str, label: &str) -> Result<Self> {
        let conn = db::init(path)?;
        Ok(Self {
            conn,
            label: label.to_string(),
        })
    }

    /// A private in-memory database, mainly for tests and package-file repositories
    pub fn open_in_memory(label: &str) -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute("PRAGMA foreign_keys = ON", [])?;
        schema::migrate(&conn)?;
        Ok(Self {
            conn,
            label: label.to_string(),
        })
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    fn require(&self, id: i64) -> Result<Package> {
        Package::find_by_id(&self.conn, id)?
            .ok_or_else(|| Error::NotFound(format!("package id {} in {}", id, self.label)))
    }

    fn ids(&self, sql: &str, param: &str) -> Result<Vec<i64>> {
        let mut stmt = self.conn.prepare(sql)?;
        let ids = stmt
            .query_map([param], |row| row.get(0))?
            .collect::<std::result::Result<Vec<i64>, _>>()?;
        Ok(ids)
    }
}

impl PackageDatabase for SqlitePackageDb {
    fn label(&self) -> &str {
        &self.label
    }

    fn resolve_candidates(
        &self,
        key: &str,
        slot: Option<&str>,
        branch: Option<&str>,
        case_sensitive: bool,
    ) -> Result<Vec<i64>> {
        let (category, name) = match key.split_once('/') {
            Some((cat, name)) => (Some(cat), name),
            None => (None, key),
        };

        let mut sql = String::from("SELECT id FROM packages WHERE ");
        if case_sensitive {
            sql.push_str("name = ?1");
        } else {
            sql.push_str("LOWER(name) = LOWER(?1)");
        }
        if category.is_some() {
            if case_sensitive {
                sql.push_str(" AND category = ?2");
            } else {
                sql.push_str(" AND LOWER(category) = LOWER(?2)");
            }
        } else {
            sql.push_str(" AND ?2 IS NULL");
        }
        sql.push_str(" AND (?3 IS NULL OR slot = ?3) AND (?4 IS NULL OR branch = ?4) ORDER BY id");

        let mut stmt = self.conn.prepare(&sql)?;
        let ids = stmt
            .query_map(params![name, category, slot, branch], |row| row.get(0))?
            .collect::<std::result::Result<Vec<i64>, _>>()?;

        debug!(
            "{}: {} candidate(s) for {} (slot {:?}, branch {:?})",
            self.label,
            ids.len(),
            key,
            slot,
            branch
        );
        Ok(ids)
    }

    fn get_package(&self, id: i64) -> Result<Package> {
        self.require(id)
    }

    fn get_version_triple(&self, id: i64) -> Result<VersionTriple> {
        Ok(self.require(id)?.triple())
    }

    fn get_dependencies(&self, id: i64) -> Result<Vec<String>> {
        load_specifiers(&self.conn, id, DependencyKind::Dependency)
    }

    fn get_conflicts(&self, id: i64) -> Result<Vec<String>> {
        load_specifiers(&self.conn, id, DependencyKind::Conflict)
    }

    fn get_linked_libraries(&self, id: i64) -> Result<BTreeSet<String>> {
        load_needed(&self.conn, id)
    }

    fn get_content(&self, id: i64) -> Result<BTreeMap<String, ContentKind>> {
        load_content(&self.conn, id)
    }

    fn get_messages(&self, id: i64) -> Result<Vec<String>> {
        load_messages(&self.conn, id)
    }

    fn get_record(&self, id: i64) -> Result<PackageRecord> {
        PackageRecord::load(&self.conn, id)?
            .ok_or_else(|| Error::NotFound(format!("package id {} in {}", id, self.label)))
    }

    fn is_protected_system_package(&self, id: i64) -> Result<bool> {
        Ok(self.require(id)?.system_package)
    }

    fn is_available(&self) -> bool {
        self.conn
            .query_row("SELECT revision FROM db_state WHERE id = 1", [], |row| {
                row.get::<_, i64>(0)
            })
            .is_ok()
    }

    fn reverse_dependencies(&self, id: i64) -> Result<Vec<i64>> {
        let pkg = self.require(id)?;
        let key = pkg.key();

        let mut stmt = self.conn.prepare(
            "SELECT package_id, specifier FROM package_dependencies
             WHERE kind = 'dependency' AND (dep_key = ?1 OR dep_key = ?2) AND package_id != ?3
             ORDER BY package_id",
        )?;
        let rows = stmt
            .query_map(params![key, pkg.name, id], |row| {
                Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?))
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        let mut dependents = BTreeSet::new();
        for (dependent, specifier) in rows {
            let slot_ok = match Atom::parse(&specifier) {
                Ok(atom) => atom.slot.as_deref().is_none_or(|s| s == pkg.slot),
                Err(_) => true,
            };
            if slot_ok {
                dependents.insert(dependent);
            }
        }

        Ok(dependents.into_iter().collect())
    }

    fn search_needed(&self, library: &str) -> Result<Vec<i64>> {
        self.ids(
            "SELECT package_id FROM package_needed WHERE library = ?1 ORDER BY package_id",
            library,
        )
    }

    fn owns_file(&self, path: &str) -> Result<Vec<i64>> {
        self.ids(
            "SELECT package_id FROM package_content WHERE path = ?1 ORDER BY package_id",
            path,
        )
    }

    fn checksum_fingerprint(&self) -> Result<String> {
        let state: Option<(String, i64)> = self
            .conn
            .query_row(
                "SELECT generation, revision FROM db_state WHERE id = 1",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        let (generation, revision) =
            state.ok_or_else(|| Error::RepositoryUnavailable(self.label.clone()))?;

        let mut hasher = Sha256::new();
        hasher.update(format!("{}:{}", generation, revision).as_bytes());
        Ok(format!("{:x}", hasher.finalize()))
    }
}

impl InstalledDatabase for SqlitePackageDb {
    fn add_package(&self, record: &PackageRecord, origin: Option<&str>) -> Result<i64> {
        let id = db::transaction(&self.conn, |tx| record.insert(tx, origin))?;
        debug!("{}: registered {} as id {}", self.label, record.atom(), id);
        Ok(id)
    }

    fn remove_package(&self, id: i64) -> Result<()> {
        Package::delete(&self.conn, id)?;
        debug!("{}: removed package id {}", self.label, id);
        Ok(())
    }
}
