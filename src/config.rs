// src/config.rs

//! Runtime configuration
//!
//! Every path equo touches derives from two inputs: the data directory
//! holding its state and the root it installs into.

use crate::filesystem::FsPolicy;
use std::path::{Path, PathBuf};

/// Default data directory
pub const DEFAULT_DATA_DIR: &str = "/var/lib/equo";

/// Paths and protection settings for one equo instance
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Installation root (usually "/")
    pub root: PathBuf,
    pub data_dir: PathBuf,
    /// Installed-packages database, which also holds the repository registry
    pub db_path: PathBuf,
    /// One `<name>.db` per synchronized repository
    pub repos_dir: PathBuf,
    /// Persisted resolver results
    pub cache_dir: PathBuf,
    /// Downloaded package files, `<packages_dir>/<repository>/<file>`
    pub packages_dir: PathBuf,
    /// Scratch space for unpacking packages
    pub unpack_dir: PathBuf,
    pub lock_path: PathBuf,
    pub config_protect: Vec<String>,
    pub config_protect_mask: Vec<String>,
    pub collision_protect: u8,
}

impl Config {
    /// Create a config with the standard layout under `data_dir`
    pub fn new(data_dir: impl Into<PathBuf>, root: impl Into<PathBuf>) -> Self {
        let data_dir = data_dir.into();
        let policy = FsPolicy::default();
        Self {
            root: root.into(),
            db_path: data_dir.join("equo.db"),
            repos_dir: data_dir.join("repositories"),
            cache_dir: data_dir.join("cache"),
            packages_dir: data_dir.join("packages"),
            unpack_dir: data_dir.join("unpack"),
            lock_path: data_dir.join("equo.lock"),
            config_protect: policy.config_protect,
            config_protect_mask: policy.config_protect_mask,
            collision_protect: policy.collision_protect,
            data_dir,
        }
    }

    /// Filesystem rules for moving packages in and out of the root
    pub fn fs_policy(&self) -> FsPolicy {
        FsPolicy {
            config_protect: self.config_protect.clone(),
            config_protect_mask: self.config_protect_mask.clone(),
            collision_protect: self.collision_protect,
            remove_config: false,
        }
    }

    /// Where a remote repository's package file is stored
    pub fn package_path(&self, repository: &str, download_url: &str) -> PathBuf {
        let file_name = download_url
            .rsplit('/')
            .next()
            .filter(|name| !name.is_empty())
            .unwrap_or(download_url);
        self.packages_dir.join(repository).join(file_name)
    }

    pub fn db_path_str(&self) -> String {
        self.db_path.display().to_string()
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::new(DEFAULT_DATA_DIR, "/")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout() {
        let config = Config::new("/tmp/equo", "/mnt/target");
        assert_eq!(config.db_path, PathBuf::from("/tmp/equo/equo.db"));
        assert_eq!(config.repos_dir, PathBuf::from("/tmp/equo/repositories"));
        assert_eq!(config.root(), Path::new("/mnt/target"));
        assert_eq!(config.config_protect, vec!["/etc".to_string()]);
    }

    #[test]
    fn test_package_path_uses_basename() {
        let config = Config::new("/var/lib/equo", "/");
        assert_eq!(
            config.package_path("main", "packages/amd64/foo-1.0.tbz2"),
            PathBuf::from("/var/lib/equo/packages/main/foo-1.0.tbz2")
        );
        assert_eq!(
            config.package_path("main", "https://mirror/x/bar-2.tbz2"),
            PathBuf::from("/var/lib/equo/packages/main/bar-2.tbz2")
        );
    }

    #[test]
    fn test_fs_policy_follows_config() {
        let mut config = Config::default();
        config.collision_protect = 2;
        config.config_protect_mask.push("/etc/env.d".to_string());

        let policy = config.fs_policy();
        assert_eq!(policy.collision_protect, 2);
        assert!(!policy.is_protected("/etc/env.d/00basic"));
        assert!(policy.is_protected("/etc/hosts"));
    }
}
