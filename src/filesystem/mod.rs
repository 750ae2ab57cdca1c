// src/filesystem/mod.rs

//! Moving package images into the root and taking them back out
//!
//! [`move_image`] merges an unpacked package image into the installation
//! root, honouring collision protection and configuration protection.
//! [`remove_content`] deletes a package's files and prunes the directories
//! left empty.
//!
//! A protected configuration file that already exists in the root is not
//! overwritten: the new version is written next to it as
//! `._cfg0000_<name>` (or the next free counter) for the administrator to
//! merge.

use crate::db::models::ContentKind;
use crate::error::{Error, Result};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::io::Read;
use std::path::{Component, Path, PathBuf};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

/// Highest `._cfgNNNN_` counter tried before giving up
const MAX_PROTECT_COUNTER: u32 = 9999;

/// File placement rules
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FsPolicy {
    /// Path prefixes whose existing files are never overwritten
    pub config_protect: Vec<String>,
    /// Prefixes exempt from `config_protect`
    pub config_protect_mask: Vec<String>,
    /// 0: off; 1: keep files owned by other packages on removal;
    /// 2: also refuse to overwrite them on install
    pub collision_protect: u8,
    /// Delete protected configuration files on removal
    pub remove_config: bool,
}

impl Default for FsPolicy {
    fn default() -> Self {
        Self {
            config_protect: vec!["/etc".to_string()],
            config_protect_mask: Vec::new(),
            collision_protect: 1,
            remove_config: false,
        }
    }
}

impl FsPolicy {
    pub fn with_remove_config(mut self, remove_config: bool) -> Self {
        self.remove_config = remove_config;
        self
    }

    /// Whether an absolute package path falls under configuration protection
    pub fn is_protected(&self, path: &str) -> bool {
        let under = |prefixes: &[String]| {
            prefixes.iter().any(|p| {
                let p = p.trim_end_matches('/');
                path == p || path.starts_with(&format!("{}/", p))
            })
        };
        under(&self.config_protect) && !under(&self.config_protect_mask)
    }
}

/// What [`move_image`] did
#[derive(Debug, Default, PartialEq, Eq)]
pub struct MoveReport {
    /// Every path of the image, as recorded in the package content
    pub content: BTreeMap<String, ContentKind>,
    /// Protected files and where their new version went
    pub protected: Vec<(String, PathBuf)>,
    /// Files skipped because another package owns them
    pub collisions: Vec<String>,
}

/// What [`remove_content`] did
#[derive(Debug, Default, PartialEq, Eq)]
pub struct RemoveReport {
    pub removed: Vec<String>,
    /// Protected configuration files left in place
    pub kept: Vec<String>,
    pub pruned_dirs: usize,
}

/// Join an untrusted absolute package path onto the root
///
/// `..` components are rejected.
pub fn safe_join(root: &Path, path: &str) -> Result<PathBuf> {
    let mut normalized = PathBuf::new();
    for component in Path::new(path.trim_start_matches('/')).components() {
        match component {
            Component::Normal(c) => normalized.push(c),
            Component::CurDir | Component::RootDir | Component::Prefix(_) => {}
            Component::ParentDir => {
                warn!("Path traversal attempt detected: {}", path);
                return Err(Error::IoError(format!("Path traversal detected: {}", path)));
            }
        }
    }
    if normalized.as_os_str().is_empty() {
        return Err(Error::IoError(format!("Empty path: '{}'", path)));
    }
    Ok(root.join(normalized))
}

/// Content an image would install, without moving anything
pub fn image_content(image_dir: &Path) -> Result<BTreeMap<String, ContentKind>> {
    let mut content = BTreeMap::new();
    for entry in WalkDir::new(image_dir).min_depth(1) {
        let entry = entry.map_err(|e| Error::IoError(format!("Failed to walk image: {}", e)))?;
        let relative = entry
            .path()
            .strip_prefix(image_dir)
            .map_err(|e| Error::IoError(e.to_string()))?;
        let kind = if entry.file_type().is_dir() {
            ContentKind::Dir
        } else if entry.file_type().is_symlink() {
            ContentKind::Symlink
        } else {
            ContentKind::File
        };
        content.insert(format!("/{}", relative.to_string_lossy()), kind);
    }
    Ok(content)
}

/// Merge an unpacked image into the root
///
/// # Arguments
///
/// * `image_dir` - Directory holding the package payload
/// * `root` - Installation root
/// * `policy` - Protection rules
/// * `owned` - Whether another installed package owns an absolute path
///
/// # Returns
///
/// The content of the image and the protection decisions taken
pub fn move_image<F>(image_dir: &Path, root: &Path, policy: &FsPolicy, owned: F) -> Result<MoveReport>
where
    F: Fn(&str) -> Result<bool>,
{
    let mut report = MoveReport::default();

    for entry in WalkDir::new(image_dir).min_depth(1).sort_by_file_name() {
        let entry = entry.map_err(|e| Error::IoError(format!("Failed to walk image: {}", e)))?;
        let relative = entry
            .path()
            .strip_prefix(image_dir)
            .map_err(|e| Error::IoError(e.to_string()))?;
        let package_path = format!("/{}", relative.to_string_lossy());
        let target = safe_join(root, &package_path)?;
        let file_type = entry.file_type();

        if file_type.is_dir() {
            if !target.is_dir() {
                if fs::symlink_metadata(&target).is_ok() {
                    fs::remove_file(&target)?;
                }
                fs::create_dir_all(&target)?;
                copy_permissions(entry.path(), &target)?;
            }
            report.content.insert(package_path, ContentKind::Dir);
            continue;
        }

        if policy.collision_protect > 1 && target.exists() && owned(&package_path)? {
            warn!("Collision found during install for {} - cannot overwrite", package_path);
            report.collisions.push(package_path);
            continue;
        }

        if file_type.is_symlink() {
            let link = fs::read_link(entry.path())?;
            clear_target(&target)?;
            make_symlink(&link, &target)?;
            report.content.insert(package_path, ContentKind::Symlink);
            continue;
        }

        let mut dest = target.clone();
        if policy.is_protected(&package_path) && target.is_file() && !same_content(entry.path(), &target)? {
            dest = allocate_protected(&target, entry.path())?;
            info!("Protecting config file: {}", package_path);
            report.protected.push((package_path.clone(), dest.clone()));
        }

        clear_target(&dest)?;
        move_file(entry.path(), &dest)?;
        report.content.insert(package_path, ContentKind::File);
    }

    debug!(
        "Moved {} paths into {} ({} protected, {} collisions)",
        report.content.len(),
        root.display(),
        report.protected.len(),
        report.collisions.len()
    );
    Ok(report)
}

/// Delete package content from the root
///
/// Files and symlinks go first. Directories listed in the content are then
/// pruned deepest first, repeating until no more of them are empty.
pub fn remove_content(
    root: &Path,
    content: &BTreeMap<String, ContentKind>,
    policy: &FsPolicy,
) -> Result<RemoveReport> {
    let mut report = RemoveReport::default();
    let mut dirs: Vec<(usize, PathBuf)> = Vec::new();

    for (path, kind) in content {
        let target = safe_join(root, path)?;

        if *kind == ContentKind::Dir {
            dirs.push((path.matches('/').count(), target));
            continue;
        }

        let Ok(meta) = fs::symlink_metadata(&target) else {
            continue;
        };
        if meta.is_dir() {
            debug!("Not removing directory {} recorded as {}", path, kind.as_str());
            continue;
        }
        if meta.is_file() && policy.is_protected(path) && !policy.remove_config {
            debug!("Keeping protected file {}", path);
            report.kept.push(path.clone());
            continue;
        }

        fs::remove_file(&target)?;
        report.removed.push(path.clone());
    }

    dirs.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| b.1.cmp(&a.1)));
    let mut gone: BTreeSet<PathBuf> = BTreeSet::new();
    loop {
        let mut changed = false;
        for (_, dir) in &dirs {
            if gone.contains(dir) || dir == root || !is_empty_dir(dir) {
                continue;
            }
            fs::remove_dir(dir)?;
            gone.insert(dir.clone());
            report.pruned_dirs += 1;
            changed = true;
        }
        if !changed {
            break;
        }
    }

    debug!(
        "Removed {} files, kept {}, pruned {} directories",
        report.removed.len(),
        report.kept.len(),
        report.pruned_dirs
    );
    Ok(report)
}

/// Name of the `counter`-th protected copy of `target`
pub fn protected_name(target: &Path, counter: u32) -> PathBuf {
    let name = target
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    target.with_file_name(format!("._cfg{:04}_{}", counter, name))
}

/// Pick where the new version of a protected file goes
///
/// An earlier pending copy with identical content is reused.
fn allocate_protected(target: &Path, source: &Path) -> Result<PathBuf> {
    for counter in 0..=MAX_PROTECT_COUNTER {
        let candidate = protected_name(target, counter);
        if !candidate.exists() {
            return Ok(candidate);
        }
        if same_content(source, &candidate)? {
            return Ok(candidate);
        }
    }
    Err(Error::ConflictError(format!(
        "Too many pending configuration updates for {}",
        target.display()
    )))
}

fn is_empty_dir(dir: &Path) -> bool {
    let is_real_dir = fs::symlink_metadata(dir).map(|m| m.is_dir()).unwrap_or(false);
    is_real_dir
        && fs::read_dir(dir)
            .map(|mut entries| entries.next().is_none())
            .unwrap_or(false)
}

fn same_content(a: &Path, b: &Path) -> Result<bool> {
    let (meta_a, meta_b) = (fs::metadata(a)?, fs::metadata(b)?);
    if meta_a.len() != meta_b.len() {
        return Ok(false);
    }
    let mut buf_a = Vec::new();
    let mut buf_b = Vec::new();
    fs::File::open(a)?.read_to_end(&mut buf_a)?;
    fs::File::open(b)?.read_to_end(&mut buf_b)?;
    Ok(buf_a == buf_b)
}

/// Remove whatever non-directory sits at `target`
fn clear_target(target: &Path) -> Result<()> {
    if let Ok(meta) = fs::symlink_metadata(target) {
        if meta.is_dir() {
            return Err(Error::ConflictError(format!(
                "{} is a directory, cannot replace it with a file",
                target.display()
            )));
        }
        fs::remove_file(target)?;
    } else if let Some(parent) = target.parent() {
        fs::create_dir_all(parent)?;
    }
    Ok(())
}

/// Rename, falling back to copy and delete across filesystems
fn move_file(source: &Path, dest: &Path) -> Result<()> {
    if fs::rename(source, dest).is_ok() {
        return Ok(());
    }
    fs::copy(source, dest)?;
    fs::remove_file(source)?;
    Ok(())
}

fn copy_permissions(source: &Path, dest: &Path) -> Result<()> {
    let perms = fs::metadata(source)?.permissions();
    fs::set_permissions(dest, perms)?;
    Ok(())
}

#[cfg(unix)]
fn make_symlink(link: &Path, target: &Path) -> Result<()> {
    std::os::unix::fs::symlink(link, target)?;
    Ok(())
}

#[cfg(not(unix))]
fn make_symlink(_link: &Path, target: &Path) -> Result<()> {
    Err(Error::IoError(format!(
        "Symlinks are not supported on this platform: {}",
        target.display()
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write(dir: &Path, rel: &str, body: &str) {
        let path = dir.join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, body).unwrap();
    }

    fn not_owned(_: &str) -> Result<bool> {
        Ok(false)
    }

    #[test]
    fn test_safe_join_rejects_traversal() {
        let root = Path::new("/tmp/root");
        assert_eq!(safe_join(root, "/usr/bin/foo").unwrap(), root.join("usr/bin/foo"));
        assert_eq!(safe_join(root, "./usr/./lib").unwrap(), root.join("usr/lib"));
        assert!(safe_join(root, "/usr/../../etc/passwd").is_err());
        assert!(safe_join(root, "/").is_err());
    }

    #[test]
    fn test_move_image_records_content() {
        let image = TempDir::new().unwrap();
        let root = TempDir::new().unwrap();
        write(image.path(), "usr/bin/foo", "binary");
        write(image.path(), "usr/share/doc/foo/README", "docs");
        #[cfg(unix)]
        std::os::unix::fs::symlink("foo", image.path().join("usr/bin/foo-link")).unwrap();

        let report = move_image(image.path(), root.path(), &FsPolicy::default(), not_owned).unwrap();

        assert_eq!(fs::read_to_string(root.path().join("usr/bin/foo")).unwrap(), "binary");
        assert_eq!(report.content.get("/usr/bin/foo"), Some(&ContentKind::File));
        assert_eq!(report.content.get("/usr/share/doc"), Some(&ContentKind::Dir));
        #[cfg(unix)]
        {
            assert_eq!(report.content.get("/usr/bin/foo-link"), Some(&ContentKind::Symlink));
            assert_eq!(
                fs::read_link(root.path().join("usr/bin/foo-link")).unwrap(),
                PathBuf::from("foo")
            );
        }
        assert!(report.protected.is_empty());
    }

    #[test]
    fn test_image_content_matches_moved_content() {
        let image = TempDir::new().unwrap();
        let root = TempDir::new().unwrap();
        write(image.path(), "usr/lib/libfoo.so.1", "elf");
        write(image.path(), "etc/foo.conf", "conf");

        let listed = image_content(image.path()).unwrap();
        let report = move_image(image.path(), root.path(), &FsPolicy::default(), not_owned).unwrap();
        assert_eq!(listed, report.content);
    }

    #[test]
    fn test_config_protection_allocates_cfg_names() {
        let root = TempDir::new().unwrap();
        write(root.path(), "etc/foo.conf", "local edits");

        let image = TempDir::new().unwrap();
        write(image.path(), "etc/foo.conf", "new defaults");
        let report = move_image(image.path(), root.path(), &FsPolicy::default(), not_owned).unwrap();

        let first = root.path().join("etc/._cfg0000_foo.conf");
        assert_eq!(report.protected, vec![("/etc/foo.conf".to_string(), first.clone())]);
        assert_eq!(fs::read_to_string(root.path().join("etc/foo.conf")).unwrap(), "local edits");
        assert_eq!(fs::read_to_string(&first).unwrap(), "new defaults");

        // A different update takes the next counter
        let image = TempDir::new().unwrap();
        write(image.path(), "etc/foo.conf", "newer defaults");
        move_image(image.path(), root.path(), &FsPolicy::default(), not_owned).unwrap();
        assert!(root.path().join("etc/._cfg0001_foo.conf").exists());

        // The same update again reuses its pending copy
        let image = TempDir::new().unwrap();
        write(image.path(), "etc/foo.conf", "new defaults");
        let report = move_image(image.path(), root.path(), &FsPolicy::default(), not_owned).unwrap();
        assert_eq!(report.protected[0].1, first);
        assert!(!root.path().join("etc/._cfg0002_foo.conf").exists());
    }

    #[test]
    fn test_identical_and_masked_config_is_overwritten() {
        let root = TempDir::new().unwrap();
        write(root.path(), "etc/same.conf", "x");
        write(root.path(), "etc/masked/a.conf", "old");

        let image = TempDir::new().unwrap();
        write(image.path(), "etc/same.conf", "x");
        write(image.path(), "etc/masked/a.conf", "new");

        let policy = FsPolicy {
            config_protect_mask: vec!["/etc/masked".to_string()],
            ..FsPolicy::default()
        };
        let report = move_image(image.path(), root.path(), &policy, not_owned).unwrap();

        assert!(report.protected.is_empty());
        assert_eq!(fs::read_to_string(root.path().join("etc/masked/a.conf")).unwrap(), "new");
    }

    #[test]
    fn test_collision_protection() {
        let root = TempDir::new().unwrap();
        write(root.path(), "usr/bin/shared", "theirs");
        let image = TempDir::new().unwrap();
        write(image.path(), "usr/bin/shared", "ours");

        let owned = |p: &str| Ok(p == "/usr/bin/shared");

        let lenient = FsPolicy::default();
        let image_copy = TempDir::new().unwrap();
        write(image_copy.path(), "usr/bin/shared", "ours");
        move_image(image_copy.path(), root.path(), &lenient, owned).unwrap();
        assert_eq!(fs::read_to_string(root.path().join("usr/bin/shared")).unwrap(), "ours");

        write(root.path(), "usr/bin/shared", "theirs");
        let strict = FsPolicy {
            collision_protect: 2,
            ..FsPolicy::default()
        };
        let report = move_image(image.path(), root.path(), &strict, owned).unwrap();
        assert_eq!(report.collisions, vec!["/usr/bin/shared".to_string()]);
        assert!(!report.content.contains_key("/usr/bin/shared"));
        assert_eq!(fs::read_to_string(root.path().join("usr/bin/shared")).unwrap(), "theirs");
    }

    #[test]
    fn test_remove_content_prunes_directories() {
        let root = TempDir::new().unwrap();
        write(root.path(), "usr/share/foo/a/b/file", "x");
        write(root.path(), "usr/share/keep", "other package");

        let content: BTreeMap<String, ContentKind> = [
            ("/usr".to_string(), ContentKind::Dir),
            ("/usr/share".to_string(), ContentKind::Dir),
            ("/usr/share/foo".to_string(), ContentKind::Dir),
            ("/usr/share/foo/a".to_string(), ContentKind::Dir),
            ("/usr/share/foo/a/b".to_string(), ContentKind::Dir),
            ("/usr/share/foo/a/b/file".to_string(), ContentKind::File),
        ]
        .into();

        let report = remove_content(root.path(), &content, &FsPolicy::default()).unwrap();
        assert_eq!(report.removed, vec!["/usr/share/foo/a/b/file".to_string()]);
        assert_eq!(report.pruned_dirs, 3);
        assert!(!root.path().join("usr/share/foo").exists());
        assert!(root.path().join("usr/share/keep").exists());
    }

    #[test]
    fn test_remove_content_keeps_config_unless_asked() {
        let root = TempDir::new().unwrap();
        write(root.path(), "etc/foo.conf", "edited");
        let content: BTreeMap<String, ContentKind> =
            [("/etc/foo.conf".to_string(), ContentKind::File)].into();

        let report = remove_content(root.path(), &content, &FsPolicy::default()).unwrap();
        assert_eq!(report.kept, vec!["/etc/foo.conf".to_string()]);
        assert!(root.path().join("etc/foo.conf").exists());

        let policy = FsPolicy::default().with_remove_config(true);
        remove_content(root.path(), &content, &policy).unwrap();
        assert!(!root.path().join("etc/foo.conf").exists());
    }

    #[test]
    fn test_remove_missing_files_is_not_an_error() {
        let root = TempDir::new().unwrap();
        let content: BTreeMap<String, ContentKind> =
            [("/usr/bin/gone".to_string(), ContentKind::File)].into();
        let report = remove_content(root.path(), &content, &FsPolicy::default()).unwrap();
        assert!(report.removed.is_empty());
    }

    #[test]
    fn test_protected_name() {
        assert_eq!(
            protected_name(Path::new("/etc/foo.conf"), 12),
            PathBuf::from("/etc/._cfg0012_foo.conf")
        );
        let policy = FsPolicy::default();
        assert!(policy.is_protected("/etc/foo.conf"));
        assert!(!policy.is_protected("/etcetera/foo"));
    }
}
