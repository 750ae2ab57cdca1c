// src/repository/mod.rs

//! Repository management and package downloading
//!
//! This module provides functionality for:
//! - Managing the repository registry
//! - Synchronizing repository metadata into per-repository databases
//! - Assembling the ordered repository set the resolver queries
//! - Downloading package files with retry support
//!
//! A repository publishes `<url>/metadata.json`, a [`RepositoryMetadata`]
//! index of full package records. `file://` URLs and plain paths are read
//! from the local filesystem.

use crate::db::models::{Package, PackageRecord, Repository};
use crate::db::{self, PackageDatabase, SqlitePackageDb};
use crate::error::{Error, Result};
use crate::packages::PackageArchive;
use crate::resolver::INSTALLED_REPOSITORY;
use crate::transaction::{FetchStatus, Fetcher};
use reqwest::blocking::Client;
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{debug, info, warn};

/// Default timeout for HTTP requests (30 seconds)
const HTTP_TIMEOUT: Duration = Duration::from_secs(30);

/// Maximum retry attempts for failed downloads
const MAX_RETRIES: u32 = 3;

/// Retry delay in milliseconds
const RETRY_DELAY_MS: u64 = 1000;

/// Name of the index file published by every repository
pub const METADATA_FILE: &str = "metadata.json";

/// Repository metadata format (simple JSON index)
#[derive(Debug, Serialize, Deserialize)]
pub struct RepositoryMetadata {
    pub name: String,
    pub version: String,
    pub packages: Vec<PackageRecord>,
}

/// Local path behind a `file://` URL or an absolute path
fn local_path(url: &str) -> Option<PathBuf> {
    if let Some(path) = url.strip_prefix("file://") {
        Some(PathBuf::from(path))
    } else if url.starts_with('/') {
        Some(PathBuf::from(url))
    } else {
        None
    }
}

fn join_url(base: &str, relative: &str) -> String {
    if base.ends_with('/') {
        format!("{}{}", base, relative)
    } else {
        format!("{}/{}", base, relative)
    }
}

/// HTTP client wrapper with retry support
pub struct RepositoryClient {
    client: Client,
    max_retries: u32,
}

impl RepositoryClient {
    /// Create a new repository client
    pub fn new() -> Result<Self> {
        let client = Client::builder()
            .timeout(HTTP_TIMEOUT)
            .build()
            .map_err(|e| Error::InitError(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            max_retries: MAX_RETRIES,
        })
    }

    /// Fetch repository metadata from URL with retry support
    pub fn fetch_metadata(&self, url: &str) -> Result<RepositoryMetadata> {
        let metadata_url = join_url(url, METADATA_FILE);

        info!("Fetching repository metadata from {}", metadata_url);

        if let Some(path) = local_path(&metadata_url) {
            let data = fs::read(&path).map_err(|e| {
                Error::DownloadError(format!("Failed to read {}: {}", path.display(), e))
            })?;
            let metadata: RepositoryMetadata = serde_json::from_slice(&data)?;
            info!("Read metadata for {} packages", metadata.packages.len());
            return Ok(metadata);
        }

        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.client.get(&metadata_url).send() {
                Ok(response) => {
                    if !response.status().is_success() {
                        return Err(Error::DownloadError(format!(
                            "HTTP {} from {}",
                            response.status(),
                            metadata_url
                        )));
                    }

                    let metadata: RepositoryMetadata = response.json().map_err(|e| {
                        Error::DownloadError(format!("Failed to parse metadata JSON: {}", e))
                    })?;

                    info!("Successfully fetched metadata for {} packages", metadata.packages.len());
                    return Ok(metadata);
                }
                Err(e) => {
                    if attempt >= self.max_retries {
                        return Err(Error::DownloadError(format!(
                            "Failed to fetch metadata after {} attempts: {}",
                            attempt, e
                        )));
                    }
                    warn!("Metadata fetch attempt {} failed: {}, retrying...", attempt, e);
                    std::thread::sleep(Duration::from_millis(RETRY_DELAY_MS * attempt as u64));
                }
            }
        }
    }

    /// Download a file to the specified path with retry support
    pub fn download_file(&self, url: &str, dest_path: &Path) -> Result<()> {
        info!("Downloading {} to {}", url, dest_path.display());

        if let Some(parent) = dest_path.parent() {
            fs::create_dir_all(parent).map_err(|e| {
                Error::IoError(format!("Failed to create directory {}: {}", parent.display(), e))
            })?;
        }

        // Write to a temporary file first, then rename into place
        let temp_path = dest_path.with_extension("tmp");

        if let Some(source) = local_path(url) {
            fs::copy(&source, &temp_path).map_err(|e| {
                Error::DownloadError(format!("Failed to copy {}: {}", source.display(), e))
            })?;
            return rename_into_place(&temp_path, dest_path);
        }

        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.client.get(url).send() {
                Ok(mut response) => {
                    if !response.status().is_success() {
                        return Err(Error::DownloadError(format!(
                            "HTTP {} from {}",
                            response.status(),
                            url
                        )));
                    }

                    let mut file = File::create(&temp_path).map_err(|e| {
                        Error::IoError(format!("Failed to create file {}: {}", temp_path.display(), e))
                    })?;

                    io::copy(&mut response, &mut file).map_err(|e| {
                        Error::IoError(format!("Failed to write downloaded data: {}", e))
                    })?;

                    return rename_into_place(&temp_path, dest_path);
                }
                Err(e) => {
                    if attempt >= self.max_retries {
                        return Err(Error::DownloadError(format!(
                            "Failed to download after {} attempts: {}",
                            attempt, e
                        )));
                    }
                    warn!("Download attempt {} failed: {}, retrying...", attempt, e);
                    std::thread::sleep(Duration::from_millis(RETRY_DELAY_MS * attempt as u64));
                }
            }
        }
    }
}

fn rename_into_place(temp_path: &Path, dest_path: &Path) -> Result<()> {
    fs::rename(temp_path, dest_path).map_err(|e| {
        Error::IoError(format!(
            "Failed to move {} to {}: {}",
            temp_path.display(),
            dest_path.display(),
            e
        ))
    })?;
    info!("Successfully downloaded to {}", dest_path.display());
    Ok(())
}

/// [`Fetcher`] backed by [`RepositoryClient`]
pub struct HttpFetcher {
    client: RepositoryClient,
}

impl HttpFetcher {
    pub fn new() -> Result<Self> {
        Ok(Self {
            client: RepositoryClient::new()?,
        })
    }
}

impl Fetcher for HttpFetcher {
    fn fetch(&self, url: &str, dest: &Path) -> FetchStatus {
        match self.client.download_file(url, dest) {
            Ok(()) => FetchStatus::Ok,
            Err(e) => FetchStatus::Failed(e.to_string()),
        }
    }
}

/// How a repository entered the repository set
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RepositoryKind {
    /// Registered and synchronized from a URL
    Remote,
    /// Injected from a standalone package file; always preferred by the matcher
    PackageFile,
}

/// One queryable repository
pub struct RepositoryHandle {
    pub name: String,
    /// Base URL, or the package file path for [`RepositoryKind::PackageFile`]
    pub url: String,
    pub kind: RepositoryKind,
    db: Option<SqlitePackageDb>,
}

impl RepositoryHandle {
    /// A synchronized repository; `db` is `None` when it was never synced
    pub fn remote(name: &str, url: &str, db: Option<SqlitePackageDb>) -> Self {
        Self {
            name: name.to_string(),
            url: url.to_string(),
            kind: RepositoryKind::Remote,
            db,
        }
    }

    /// A repository holding the single package of a package file
    pub fn package_file(path: &Path) -> Result<Self> {
        let archive = PackageArchive::open(path)?;
        let mut record = archive.read_metadata()?.ok_or_else(|| {
            Error::ParseError(format!("{} carries no package metadata", path.display()))
        })?;

        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| record.atom());
        let name = format!("file:{}", file_name);

        record.download_url = path.display().to_string();

        let db = SqlitePackageDb::open_in_memory(&name)?;
        db::transaction(db.connection(), |tx| record.insert(tx, Some(&name)))?;

        info!("Added package file {} as repository {}", path.display(), name);
        Ok(Self {
            name,
            url: path.display().to_string(),
            kind: RepositoryKind::PackageFile,
            db: Some(db),
        })
    }

    pub fn is_package_file(&self) -> bool {
        self.kind == RepositoryKind::PackageFile
    }

    /// The repository database, or `RepositoryUnavailable`
    pub fn database(&self) -> Result<&SqlitePackageDb> {
        match &self.db {
            Some(db) if db.is_available() => Ok(db),
            _ => Err(Error::RepositoryUnavailable(self.name.clone())),
        }
    }

    /// Absolute location of a package's file
    pub fn package_url(&self, download_url: &str) -> String {
        if self.is_package_file() || download_url.contains("://") || download_url.starts_with('/')
        {
            download_url.to_string()
        } else {
            join_url(&self.url, download_url)
        }
    }
}

/// Repositories in priority order
#[derive(Default)]
pub struct RepositorySet {
    repos: Vec<RepositoryHandle>,
}

impl RepositorySet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open every enabled registry entry, in priority order
    ///
    /// Repositories that were never synchronized, or whose database cannot
    /// be opened, stay in the set but report themselves unavailable.
    pub fn from_registry(conn: &Connection, repos_dir: &Path) -> Result<Self> {
        let mut set = Self::new();
        for repo in Repository::list_enabled(conn)? {
            let path = repository_db_path(repos_dir, &repo.name);
            let db = if path.exists() {
                match SqlitePackageDb::open(&path.to_string_lossy(), &repo.name) {
                    Ok(db) => Some(db),
                    Err(e) => {
                        warn!("Repository {} cannot be opened: {}", repo.name, e);
                        None
                    }
                }
            } else {
                warn!("Repository {} has not been synchronized", repo.name);
                None
            };
            set.push(RepositoryHandle::remote(&repo.name, &repo.url, db));
        }
        debug!("Loaded {} repositories", set.len());
        Ok(set)
    }

    /// Append a repository with the lowest priority
    pub fn push(&mut self, handle: RepositoryHandle) {
        self.repos.push(handle);
    }

    pub fn get(&self, name: &str) -> Option<&RepositoryHandle> {
        self.repos.iter().find(|r| r.name == name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &RepositoryHandle> {
        self.repos.iter()
    }

    pub fn names(&self) -> Vec<String> {
        self.repos.iter().map(|r| r.name.clone()).collect()
    }

    /// Position in priority order
    pub fn position(&self, name: &str) -> Option<usize> {
        self.repos.iter().position(|r| r.name == name)
    }

    pub fn len(&self) -> usize {
        self.repos.len()
    }

    pub fn is_empty(&self) -> bool {
        self.repos.is_empty()
    }
}

/// Location of a repository's package database
pub fn repository_db_path(repos_dir: &Path, name: &str) -> PathBuf {
    repos_dir.join(format!("{}.db", name))
}

/// Synchronize repository metadata into its package database
///
/// The database is rewritten inside one transaction, which also moves its
/// fingerprint so cached resolutions against it go stale.
pub fn sync_repository(conn: &Connection, repo: &mut Repository, repos_dir: &Path) -> Result<usize> {
    info!("Synchronizing repository: {}", repo.name);

    let client = RepositoryClient::new()?;
    let metadata = client.fetch_metadata(&repo.url)?;

    let path = repository_db_path(repos_dir, &repo.name);
    let repo_db = SqlitePackageDb::create(&path.to_string_lossy(), &repo.name)?;

    let count = db::transaction(repo_db.connection(), |tx| {
        tx.execute("DELETE FROM packages", [])?;
        for record in &metadata.packages {
            record.insert(tx, Some(&repo.name))?;
        }
        Ok(metadata.packages.len())
    })?;

    repo.last_sync = Some(current_timestamp());
    repo.update(conn)?;

    info!("Synchronized {} packages from repository {}", count, repo.name);
    Ok(count)
}

/// Check if repository metadata needs refresh
pub fn needs_sync(repo: &Repository) -> bool {
    match &repo.last_sync {
        None => true,
        Some(last_sync) => match parse_timestamp(last_sync) {
            Ok(last_sync_time) => {
                let now = SystemTime::now()
                    .duration_since(UNIX_EPOCH)
                    .map(|d| d.as_secs())
                    .unwrap_or(0);

                let age_seconds = now.saturating_sub(last_sync_time);
                age_seconds > repo.metadata_expire as u64
            }
            Err(_) => true,
        },
    }
}

/// Get current timestamp as ISO 8601 string
fn current_timestamp() -> String {
    chrono::Utc::now().to_rfc3339()
}

/// Parse ISO 8601 timestamp to Unix seconds
fn parse_timestamp(timestamp: &str) -> Result<u64> {
    use chrono::DateTime;

    let dt = DateTime::parse_from_rfc3339(timestamp)
        .map_err(|e| Error::ParseError(format!("Invalid timestamp: {}", e)))?;

    Ok(dt.timestamp() as u64)
}

/// Add a new repository to the registry
pub fn add_repository(
    conn: &Connection,
    name: String,
    url: String,
    enabled: bool,
    priority: i32,
) -> Result<Repository> {
    if name.contains('/') || name.starts_with("file:") || name == INSTALLED_REPOSITORY {
        return Err(Error::ConflictError(format!(
            "Invalid repository name '{}'",
            name
        )));
    }
    if Repository::find_by_name(conn, &name)?.is_some() {
        return Err(Error::ConflictError(format!(
            "Repository '{}' already exists",
            name
        )));
    }

    let mut repo = Repository::new(name, url);
    repo.enabled = enabled;
    repo.priority = priority;

    repo.insert(conn)?;

    info!("Added repository: {} ({})", repo.name, repo.url);
    Ok(repo)
}

fn require_repository(conn: &Connection, name: &str) -> Result<Repository> {
    Repository::find_by_name(conn, name)?
        .ok_or_else(|| Error::NotFound(format!("Repository '{}' not found", name)))
}

/// Remove a repository from the registry, along with its package database
pub fn remove_repository(conn: &Connection, name: &str, repos_dir: &Path) -> Result<()> {
    let repo = require_repository(conn, name)?;
    if let Some(id) = repo.id {
        Repository::delete(conn, id)?;
    }

    let path = repository_db_path(repos_dir, name);
    for suffix in ["", "-wal", "-shm"] {
        let file = PathBuf::from(format!("{}{}", path.display(), suffix));
        if file.exists() {
            fs::remove_file(&file)?;
        }
    }

    info!("Removed repository: {}", name);
    Ok(())
}

/// Enable or disable a repository
pub fn set_repository_enabled(conn: &Connection, name: &str, enabled: bool) -> Result<()> {
    let mut repo = require_repository(conn, name)?;

    repo.enabled = enabled;
    repo.update(conn)?;

    info!(
        "Repository '{}' {}",
        name,
        if enabled { "enabled" } else { "disabled" }
    );
    Ok(())
}

/// Search for packages across all available repositories
pub fn search_packages(repos: &RepositorySet, pattern: &str) -> Result<Vec<(String, Package)>> {
    let mut results = Vec::new();
    for repo in repos.iter() {
        let repo_db = match repo.database() {
            Ok(repo_db) => repo_db,
            Err(e) => {
                warn!("Skipping repository {}: {}", repo.name, e);
                continue;
            }
        };
        for pkg in Package::search(repo_db.connection(), pattern)? {
            results.push((repo.name.clone(), pkg));
        }
    }
    Ok(results)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::schema;
    use crate::packages::CompressionFormat;
    use tempfile::{NamedTempFile, TempDir};

    fn create_test_db() -> (NamedTempFile, Connection) {
        let temp_file = NamedTempFile::new().unwrap();
        let conn = Connection::open(temp_file.path()).unwrap();
        conn.execute("PRAGMA foreign_keys = ON", []).unwrap();
        schema::migrate(&conn).unwrap();
        (temp_file, conn)
    }

    fn write_local_repo(dir: &Path) {
        let mut foo = PackageRecord::new("app-misc", "foo", "1.0");
        foo.download_url = "packages/foo-1.0.tbz2".to_string();
        let metadata = RepositoryMetadata {
            name: "local".to_string(),
            version: "1".to_string(),
            packages: vec![foo, PackageRecord::new("app-misc", "bar", "2.0")],
        };
        fs::write(
            dir.join(METADATA_FILE),
            serde_json::to_vec(&metadata).unwrap(),
        )
        .unwrap();
    }

    #[test]
    fn test_add_repository() {
        let (_temp, conn) = create_test_db();

        let repo = add_repository(
            &conn,
            "test-repo".to_string(),
            "https://example.com/repo".to_string(),
            true,
            10,
        )
        .unwrap();

        assert_eq!(repo.name, "test-repo");
        assert_eq!(repo.url, "https://example.com/repo");
        assert!(repo.enabled);
        assert_eq!(repo.priority, 10);
    }

    #[test]
    fn test_add_duplicate_repository() {
        let (_temp, conn) = create_test_db();

        add_repository(
            &conn,
            "test-repo".to_string(),
            "https://example.com/repo".to_string(),
            true,
            10,
        )
        .unwrap();

        let result = add_repository(
            &conn,
            "test-repo".to_string(),
            "https://example.com/other".to_string(),
            true,
            10,
        );

        assert!(matches!(result, Err(Error::ConflictError(_))));
    }

    #[test]
    fn test_reserved_repository_names() {
        let (_temp, conn) = create_test_db();

        for name in ["installed", "file:foo.tbz2", "a/b"] {
            let result = add_repository(
                &conn,
                name.to_string(),
                "https://example.com/repo".to_string(),
                true,
                0,
            );
            assert!(matches!(result, Err(Error::ConflictError(_))), "{}", name);
        }
    }

    #[test]
    fn test_remove_repository() {
        let (_temp, conn) = create_test_db();
        let dir = TempDir::new().unwrap();

        add_repository(
            &conn,
            "test-repo".to_string(),
            "https://example.com/repo".to_string(),
            true,
            10,
        )
        .unwrap();

        remove_repository(&conn, "test-repo", dir.path()).unwrap();

        let found = Repository::find_by_name(&conn, "test-repo").unwrap();
        assert!(found.is_none());
        assert!(matches!(
            remove_repository(&conn, "test-repo", dir.path()),
            Err(Error::NotFound(_))
        ));
    }

    #[test]
    fn test_enable_disable_repository() {
        let (_temp, conn) = create_test_db();

        add_repository(
            &conn,
            "test-repo".to_string(),
            "https://example.com/repo".to_string(),
            true,
            10,
        )
        .unwrap();

        set_repository_enabled(&conn, "test-repo", false).unwrap();
        let repo = Repository::find_by_name(&conn, "test-repo").unwrap().unwrap();
        assert!(!repo.enabled);

        set_repository_enabled(&conn, "test-repo", true).unwrap();
        let repo = Repository::find_by_name(&conn, "test-repo").unwrap().unwrap();
        assert!(repo.enabled);
    }

    #[test]
    fn test_needs_sync() {
        let repo_never_synced = Repository::new("test".to_string(), "url".to_string());
        assert!(needs_sync(&repo_never_synced));

        let mut repo_recently_synced = Repository::new("test".to_string(), "url".to_string());
        repo_recently_synced.last_sync = Some(current_timestamp());
        repo_recently_synced.metadata_expire = 3600;
        assert!(!needs_sync(&repo_recently_synced));
    }

    #[test]
    fn test_timestamp_functions() {
        let ts = current_timestamp();
        let parsed = parse_timestamp(&ts).unwrap();
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_secs();

        assert!((now as i64 - parsed as i64).abs() < 5);
    }

    #[test]
    fn test_sync_local_repository() {
        let (_temp, conn) = create_test_db();
        let remote = TempDir::new().unwrap();
        let repos_dir = TempDir::new().unwrap();
        write_local_repo(remote.path());

        let mut repo = add_repository(
            &conn,
            "local".to_string(),
            format!("file://{}", remote.path().display()),
            true,
            0,
        )
        .unwrap();

        let count = sync_repository(&conn, &mut repo, repos_dir.path()).unwrap();
        assert_eq!(count, 2);
        assert!(!needs_sync(&repo));

        let set = RepositorySet::from_registry(&conn, repos_dir.path()).unwrap();
        let handle = set.get("local").unwrap();
        let repo_db = handle.database().unwrap();
        let before = repo_db.checksum_fingerprint().unwrap();
        assert_eq!(
            repo_db
                .resolve_candidates("app-misc/foo", None, None, true)
                .unwrap()
                .len(),
            1
        );
        assert_eq!(
            handle.package_url("packages/foo-1.0.tbz2"),
            format!("file://{}/packages/foo-1.0.tbz2", remote.path().display())
        );

        sync_repository(&conn, &mut repo, repos_dir.path()).unwrap();
        assert_ne!(before, repo_db.checksum_fingerprint().unwrap());

        let found = search_packages(&set, "ba").unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].1.name, "bar");
    }

    #[test]
    fn test_unsynced_repository_is_unavailable() {
        let (_temp, conn) = create_test_db();
        let repos_dir = TempDir::new().unwrap();
        add_repository(&conn, "a".to_string(), "https://a".to_string(), true, 2).unwrap();
        add_repository(&conn, "b".to_string(), "https://b".to_string(), true, 1).unwrap();

        let set = RepositorySet::from_registry(&conn, repos_dir.path()).unwrap();
        assert_eq!(set.names(), vec!["b".to_string(), "a".to_string()]);
        assert!(matches!(
            set.get("a").unwrap().database(),
            Err(Error::RepositoryUnavailable(_))
        ));
    }

    #[test]
    fn test_package_file_repository() {
        let dir = TempDir::new().unwrap();
        let image = dir.path().join("image");
        fs::create_dir_all(&image).unwrap();
        let record = PackageRecord::new("app-misc", "foo", "1.1");
        let path = dir.path().join("foo-1.1.tbz2");
        PackageArchive::create(&image, Some(&record), &path, CompressionFormat::Gzip).unwrap();

        let handle = RepositoryHandle::package_file(&path).unwrap();
        assert_eq!(handle.name, "file:foo-1.1.tbz2");
        assert!(handle.is_package_file());

        let repo_db = handle.database().unwrap();
        let ids = repo_db
            .resolve_candidates("app-misc/foo", None, None, true)
            .unwrap();
        assert_eq!(ids.len(), 1);
        let pkg = repo_db.get_package(ids[0]).unwrap();
        assert_eq!(handle.package_url(&pkg.download_url), path.display().to_string());
    }
}
