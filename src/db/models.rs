// src/db/models.rs

//! Data models for Equo database entities
//!
//! This module defines Rust structs that correspond to database tables
//! and provides methods for creating, reading, updating, and deleting records.

use crate::atom::{key_of, package_atom};
use crate::error::{Error, Result};
use crate::version::VersionTriple;
use rusqlite::{Connection, OptionalExtension, Row, params};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::str::FromStr;

/// Kind of a content manifest entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContentKind {
    File,
    Dir,
    Symlink,
}

impl ContentKind {
    pub fn as_str(&self) -> &str {
        match self {
            ContentKind::File => "file",
            ContentKind::Dir => "dir",
            ContentKind::Symlink => "symlink",
        }
    }
}

impl FromStr for ContentKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "file" => Ok(ContentKind::File),
            "dir" => Ok(ContentKind::Dir),
            "symlink" => Ok(ContentKind::Symlink),
            _ => Err(format!("Invalid content kind: {}", s)),
        }
    }
}

/// Whether a declared relation is a dependency or a conflict
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DependencyKind {
    Dependency,
    Conflict,
}

impl DependencyKind {
    pub fn as_str(&self) -> &str {
        match self {
            DependencyKind::Dependency => "dependency",
            DependencyKind::Conflict => "conflict",
        }
    }
}

/// A row of the packages table
#[derive(Debug, Clone)]
pub struct Package {
    pub id: Option<i64>,
    pub category: String,
    pub name: String,
    pub version: String,
    pub tag: String,
    pub revision: i64,
    pub slot: String,
    pub branch: String,
    pub masked: bool,
    pub system_package: bool,
    pub download_url: String,
    pub checksum: String,
    pub size: i64,
    pub trigger_script: Option<String>,
    pub origin_repository: Option<String>,
    pub installed_at: Option<String>,
}

const PACKAGE_COLUMNS: &str = "id, category, name, version, tag, revision, slot, branch, masked, \
     system_package, download_url, checksum, size, trigger_script, origin_repository, installed_at";

impl Package {
    /// `category/name`
    pub fn key(&self) -> String {
        format!("{}/{}", self.category, self.name)
    }

    /// `category/name-version[#tag]`
    pub fn atom(&self) -> String {
        package_atom(&self.category, &self.name, &self.version, &self.tag)
    }

    pub fn triple(&self) -> VersionTriple {
        VersionTriple::new(self.version.clone(), self.tag.clone(), self.revision)
    }

    /// Find a package by ID
    pub fn find_by_id(conn: &Connection, id: i64) -> Result<Option<Self>> {
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM packages WHERE id = ?1",
            PACKAGE_COLUMNS
        ))?;

        let package = stmt.query_row([id], Self::from_row).optional()?;

        Ok(package)
    }

    /// Find packages by key (`category/name`)
    pub fn find_by_key(conn: &Connection, key: &str) -> Result<Vec<Self>> {
        let (category, name) = key.split_once('/').unwrap_or(("", key));
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM packages WHERE category = ?1 AND name = ?2 ORDER BY id",
            PACKAGE_COLUMNS
        ))?;

        let packages = stmt
            .query_map([category, name], Self::from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(packages)
    }

    /// List all packages
    pub fn list_all(conn: &Connection) -> Result<Vec<Self>> {
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM packages ORDER BY category, name, version",
            PACKAGE_COLUMNS
        ))?;

        let packages = stmt
            .query_map([], Self::from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(packages)
    }

    /// Search packages whose key contains a pattern
    pub fn search(conn: &Connection, pattern: &str) -> Result<Vec<Self>> {
        let like = format!("%{}%", pattern);
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM packages WHERE category || '/' || name LIKE ?1 ORDER BY category, name, version",
            PACKAGE_COLUMNS
        ))?;

        let packages = stmt
            .query_map([like], Self::from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(packages)
    }

    /// Delete a package by ID (dependencies, content and messages cascade)
    pub fn delete(conn: &Connection, id: i64) -> Result<()> {
        conn.execute("DELETE FROM packages WHERE id = ?1", [id])?;
        Ok(())
    }

    /// Convert a database row to a Package
    fn from_row(row: &Row) -> rusqlite::Result<Self> {
        Ok(Self {
            id: Some(row.get(0)?),
            category: row.get(1)?,
            name: row.get(2)?,
            version: row.get(3)?,
            tag: row.get(4)?,
            revision: row.get(5)?,
            slot: row.get(6)?,
            branch: row.get(7)?,
            masked: row.get(8)?,
            system_package: row.get(9)?,
            download_url: row.get(10)?,
            checksum: row.get(11)?,
            size: row.get(12)?,
            trigger_script: row.get(13)?,
            origin_repository: row.get(14)?,
            installed_at: row.get(15)?,
        })
    }
}

fn default_slot() -> String {
    "0".to_string()
}

/// Complete package metadata, as published in repository indexes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PackageRecord {
    pub category: String,
    pub name: String,
    pub version: String,
    #[serde(default)]
    pub tag: String,
    #[serde(default)]
    pub revision: i64,
    #[serde(default = "default_slot")]
    pub slot: String,
    #[serde(default)]
    pub branch: String,
    #[serde(default)]
    pub masked: bool,
    #[serde(default)]
    pub system_package: bool,
    #[serde(default)]
    pub download_url: String,
    #[serde(default)]
    pub checksum: String,
    #[serde(default)]
    pub size: i64,
    #[serde(default)]
    pub trigger_script: Option<String>,
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub conflicts: Vec<String>,
    #[serde(default)]
    pub needed: BTreeSet<String>,
    #[serde(default)]
    pub content: BTreeMap<String, ContentKind>,
    #[serde(default)]
    pub messages: Vec<String>,
}

impl PackageRecord {
    /// Create a record with defaults for everything but the identity
    pub fn new(category: &str, name: &str, version: &str) -> Self {
        Self {
            category: category.to_string(),
            name: name.to_string(),
            version: version.to_string(),
            tag: String::new(),
            revision: 0,
            slot: default_slot(),
            branch: String::new(),
            masked: false,
            system_package: false,
            download_url: String::new(),
            checksum: String::new(),
            size: 0,
            trigger_script: None,
            dependencies: Vec::new(),
            conflicts: Vec::new(),
            needed: BTreeSet::new(),
            content: BTreeMap::new(),
            messages: Vec::new(),
        }
    }

    pub fn key(&self) -> String {
        format!("{}/{}", self.category, self.name)
    }

    pub fn atom(&self) -> String {
        package_atom(&self.category, &self.name, &self.version, &self.tag)
    }

    /// Insert this record and all of its child rows
    ///
    /// Callers wanting atomicity wrap this in [`crate::db::transaction`].
    pub fn insert(&self, conn: &Connection, origin: Option<&str>) -> Result<i64> {
        conn.execute(
            "INSERT INTO packages (category, name, version, tag, revision, slot, branch, masked,
                                   system_package, download_url, checksum, size, trigger_script,
                                   origin_repository)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
            params![
                &self.category,
                &self.name,
                &self.version,
                &self.tag,
                &self.revision,
                &self.slot,
                &self.branch,
                &self.masked,
                &self.system_package,
                &self.download_url,
                &self.checksum,
                &self.size,
                &self.trigger_script,
                origin,
            ],
        )?;

        let id = conn.last_insert_rowid();

        let mut dep_stmt = conn.prepare(
            "INSERT INTO package_dependencies (package_id, specifier, dep_key, kind)
             VALUES (?1, ?2, ?3, ?4)",
        )?;
        for dep in &self.dependencies {
            dep_stmt.execute(params![
                id,
                dep,
                key_of(dep),
                DependencyKind::Dependency.as_str()
            ])?;
        }
        for conflict in &self.conflicts {
            let spec = conflict.trim_start_matches('!');
            dep_stmt.execute(params![
                id,
                spec,
                key_of(spec),
                DependencyKind::Conflict.as_str()
            ])?;
        }

        let mut needed_stmt =
            conn.prepare("INSERT INTO package_needed (package_id, library) VALUES (?1, ?2)")?;
        for library in &self.needed {
            needed_stmt.execute(params![id, library])?;
        }

        let mut content_stmt = conn
            .prepare("INSERT INTO package_content (package_id, path, kind) VALUES (?1, ?2, ?3)")?;
        for (path, kind) in &self.content {
            content_stmt.execute(params![id, path, kind.as_str()])?;
        }

        let mut msg_stmt =
            conn.prepare("INSERT INTO package_messages (package_id, message) VALUES (?1, ?2)")?;
        for message in &self.messages {
            msg_stmt.execute(params![id, message])?;
        }

        Ok(id)
    }

    /// Load the full record of a package
    pub fn load(conn: &Connection, id: i64) -> Result<Option<Self>> {
        let Some(pkg) = Package::find_by_id(conn, id)? else {
            return Ok(None);
        };

        Ok(Some(Self {
            category: pkg.category,
            name: pkg.name,
            version: pkg.version,
            tag: pkg.tag,
            revision: pkg.revision,
            slot: pkg.slot,
            branch: pkg.branch,
            masked: pkg.masked,
            system_package: pkg.system_package,
            download_url: pkg.download_url,
            checksum: pkg.checksum,
            size: pkg.size,
            trigger_script: pkg.trigger_script,
            dependencies: load_specifiers(conn, id, DependencyKind::Dependency)?,
            conflicts: load_specifiers(conn, id, DependencyKind::Conflict)?,
            needed: load_needed(conn, id)?,
            content: load_content(conn, id)?,
            messages: load_messages(conn, id)?,
        }))
    }
}

/// Declared specifiers of one kind, in declaration order
pub fn load_specifiers(conn: &Connection, id: i64, kind: DependencyKind) -> Result<Vec<String>> {
    let mut stmt = conn.prepare(
        "SELECT specifier FROM package_dependencies WHERE package_id = ?1 AND kind = ?2 ORDER BY id",
    )?;
    let specs = stmt
        .query_map(params![id, kind.as_str()], |row| row.get(0))?
        .collect::<std::result::Result<Vec<String>, _>>()?;
    Ok(specs)
}

pub fn load_needed(conn: &Connection, id: i64) -> Result<BTreeSet<String>> {
    let mut stmt = conn.prepare("SELECT library FROM package_needed WHERE package_id = ?1")?;
    let libs = stmt
        .query_map([id], |row| row.get(0))?
        .collect::<std::result::Result<BTreeSet<String>, _>>()?;
    Ok(libs)
}

pub fn load_content(conn: &Connection, id: i64) -> Result<BTreeMap<String, ContentKind>> {
    let mut stmt = conn.prepare("SELECT path, kind FROM package_content WHERE package_id = ?1")?;
    let rows = stmt
        .query_map([id], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    let mut content = BTreeMap::new();
    for (path, kind) in rows {
        let kind = kind.parse::<ContentKind>().map_err(Error::ParseError)?;
        content.insert(path, kind);
    }
    Ok(content)
}

pub fn load_messages(conn: &Connection, id: i64) -> Result<Vec<String>> {
    let mut stmt =
        conn.prepare("SELECT message FROM package_messages WHERE package_id = ?1 ORDER BY id")?;
    let messages = stmt
        .query_map([id], |row| row.get(0))?
        .collect::<std::result::Result<Vec<String>, _>>()?;
    Ok(messages)
}

/// A configured package repository
#[derive(Debug, Clone)]
pub struct Repository {
    pub id: Option<i64>,
    pub name: String,
    pub url: String,
    pub enabled: bool,
    /// Lower values are consulted first
    pub priority: i32,
    pub metadata_expire: i32,
    pub last_sync: Option<String>,
    pub created_at: Option<String>,
}

impl Repository {
    /// Create a new Repository
    pub fn new(name: String, url: String) -> Self {
        Self {
            id: None,
            name,
            url,
            enabled: true,
            priority: 0,
            metadata_expire: 3600,
            last_sync: None,
            created_at: None,
        }
    }

    /// Insert this repository into the database
    pub fn insert(&mut self, conn: &Connection) -> Result<i64> {
        conn.execute(
            "INSERT INTO repositories (name, url, enabled, priority, metadata_expire, last_sync)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                &self.name,
                &self.url,
                &self.enabled,
                &self.priority,
                &self.metadata_expire,
                &self.last_sync,
            ],
        )?;

        let id = conn.last_insert_rowid();
        self.id = Some(id);
        Ok(id)
    }

    /// Find a repository by name
    pub fn find_by_name(conn: &Connection, name: &str) -> Result<Option<Self>> {
        let mut stmt = conn.prepare(
            "SELECT id, name, url, enabled, priority, metadata_expire, last_sync, created_at
             FROM repositories WHERE name = ?1",
        )?;

        let repo = stmt.query_row([name], Self::from_row).optional()?;

        Ok(repo)
    }

    /// List all repositories in priority order
    pub fn list_all(conn: &Connection) -> Result<Vec<Self>> {
        let mut stmt = conn.prepare(
            "SELECT id, name, url, enabled, priority, metadata_expire, last_sync, created_at
             FROM repositories ORDER BY priority ASC, id ASC",
        )?;

        let repos = stmt
            .query_map([], Self::from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(repos)
    }

    /// List enabled repositories in priority order
    pub fn list_enabled(conn: &Connection) -> Result<Vec<Self>> {
        let mut stmt = conn.prepare(
            "SELECT id, name, url, enabled, priority, metadata_expire, last_sync, created_at
             FROM repositories WHERE enabled = 1 ORDER BY priority ASC, id ASC",
        )?;

        let repos = stmt
            .query_map([], Self::from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(repos)
    }

    /// Update repository settings
    pub fn update(&self, conn: &Connection) -> Result<()> {
        let id = self.id.ok_or_else(|| {
            Error::InitError("Cannot update repository without ID".to_string())
        })?;

        conn.execute(
            "UPDATE repositories SET url = ?1, enabled = ?2, priority = ?3,
                                     metadata_expire = ?4, last_sync = ?5
             WHERE id = ?6",
            params![
                &self.url,
                &self.enabled,
                &self.priority,
                &self.metadata_expire,
                &self.last_sync,
                id,
            ],
        )?;
        Ok(())
    }

    /// Delete a repository by ID
    pub fn delete(conn: &Connection, id: i64) -> Result<()> {
        conn.execute("DELETE FROM repositories WHERE id = ?1", [id])?;
        Ok(())
    }

    fn from_row(row: &Row) -> rusqlite::Result<Self> {
        Ok(Self {
            id: Some(row.get(0)?),
            name: row.get(1)?,
            url: row.get(2)?,
            enabled: row.get(3)?,
            priority: row.get(4)?,
            metadata_expire: row.get(5)?,
            last_sync: row.get(6)?,
            created_at: row.get(7)?,
        })
    }
}
