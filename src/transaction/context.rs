// src/transaction/context.rs

//! Transaction context
//!
//! Everything a prepared transaction knows about its package. Built by
//! `prepare`, owned by exactly one [`PackageTransaction`], dropped by `kill`.
//!
//! [`PackageTransaction`]: super::PackageTransaction

use super::{Action, PrepareOptions, Step};
use crate::db::models::{ContentKind, PackageRecord};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// The installed package an install replaces
#[derive(Debug, Clone, PartialEq)]
pub struct Replacement {
    pub id: i64,
    pub record: PackageRecord,
    /// `false` for a reinstall of the identical version: the old record is
    /// dropped but no files are removed and no removal triggers run
    pub diff_removal: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TransactionContext {
    pub action: Action,
    pub options: PrepareOptions,
    pub steps: Vec<Step>,
    /// Canonical atom of the package acted on
    pub atom: String,
    /// Repository the package comes from (`None` for removals)
    pub repository: Option<String>,
    /// The package acted on: the repository record for fetch and install,
    /// the installed record for removals
    pub record: PackageRecord,
    pub download_url: String,
    /// Local package file
    pub package_path: Option<PathBuf>,
    pub unpack_dir: Option<PathBuf>,
    pub image_dir: Option<PathBuf>,
    /// Installed id being removed (removals only)
    pub remove_id: Option<i64>,
    pub replacement: Option<Replacement>,
    /// Paths the remove side of the transaction deletes: the whole content
    /// for removals, the old content minus the new for upgrades
    pub remove_content: BTreeMap<String, ContentKind>,
    /// Installed ids conflicting with the package being installed
    pub conflicts: Vec<i64>,
    /// Id of the new installed record once `install` committed it
    pub installed_id: Option<i64>,
}

impl TransactionContext {
    pub(super) fn new(action: Action, options: PrepareOptions, record: PackageRecord) -> Self {
        Self {
            action,
            options,
            steps: Vec::new(),
            atom: record.atom(),
            repository: None,
            record,
            download_url: String::new(),
            package_path: None,
            unpack_dir: None,
            image_dir: None,
            remove_id: None,
            replacement: None,
            remove_content: BTreeMap::new(),
            conflicts: Vec::new(),
            installed_id: None,
        }
    }

    /// Whether an upgrade removes files of the package it replaces
    pub fn is_diff_removal(&self) -> bool {
        self.replacement.as_ref().is_some_and(|r| r.diff_removal)
    }
}

/// `old` minus every path in `new`
pub fn content_diff(
    old: &BTreeMap<String, ContentKind>,
    new: &BTreeMap<String, ContentKind>,
) -> BTreeMap<String, ContentKind> {
    old.iter()
        .filter(|(path, _)| !new.contains_key(*path))
        .map(|(path, kind)| (path.clone(), *kind))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_content_diff() {
        let old: BTreeMap<String, ContentKind> = [
            ("/usr".to_string(), ContentKind::Dir),
            ("/usr/lib/libfoo.so.1".to_string(), ContentKind::File),
            ("/usr/lib/libfoo.so".to_string(), ContentKind::Symlink),
        ]
        .into();
        let new: BTreeMap<String, ContentKind> = [
            ("/usr".to_string(), ContentKind::Dir),
            ("/usr/lib/libfoo.so.2".to_string(), ContentKind::File),
            ("/usr/lib/libfoo.so".to_string(), ContentKind::Symlink),
        ]
        .into();

        let diff = content_diff(&old, &new);
        assert_eq!(diff.len(), 1);
        assert!(diff.contains_key("/usr/lib/libfoo.so.1"));
    }
}
