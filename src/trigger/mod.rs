// src/trigger/mod.rs

//! Package triggers
//!
//! Triggers are system maintenance actions that run around package
//! installation and removal: refreshing the linker cache after a library
//! lands, running depmod for new kernel modules, dropping stale Python
//! bytecode and so on.
//!
//! Selection is pure: [`preinstall`], [`postinstall`], [`preremove`] and
//! [`postremove`] inspect a package's [`TriggerData`] and return the set of
//! triggers that apply. Execution goes through [`TriggerExecutor`], which
//! looks each trigger up in a fixed handler table ([`handler_for`]).

use crate::cache::ResultCache;
use crate::db::models::PackageRecord;
use crate::error::{Error, Result};
use std::cell::RefCell;
use std::collections::BTreeSet;
use std::fmt;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::str::FromStr;
use std::time::{Duration, SystemTime};
use tracing::{debug, info, warn};
use wait_timeout::ChildExt;

/// Default timeout for trigger handlers (60 seconds)
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

/// The package manager's own package; installing it invalidates cached results
pub const SELF_PACKAGE: &str = "sys-apps/equo";

/// Directories searched for shared libraries when no ld.so.conf adds more
const DEFAULT_LINKER_PATHS: &[&str] = &["/lib", "/lib64", "/usr/lib", "/usr/lib64", "/usr/local/lib"];

/// Point in a transaction where triggers run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Stage {
    PreInstall,
    PostInstall,
    PreRemove,
    PostRemove,
}

impl Stage {
    pub fn as_str(&self) -> &str {
        match self {
            Stage::PreInstall => "preinstall",
            Stage::PostInstall => "postinstall",
            Stage::PreRemove => "preremove",
            Stage::PostRemove => "postremove",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Built-in trigger kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Trigger {
    /// Drop cached resolver results
    PurgeCache,
    /// Refresh mtimes of service configuration files
    ConfTouch,
    /// Regenerate kernel module dependencies
    KernelModules,
    /// Regenerate the environment from /etc/env.d
    EnvUpdate,
    /// Regenerate the dynamic linker cache
    Ldconfig,
    /// Announce newly installed services
    InitInform,
    /// Deschedule services that are going away
    InitDisable,
    /// Make sure /boot is mounted
    MountBoot,
    /// Remove compiled bytecode of removed Python modules
    CleanPython,
    /// The package's own trigger script
    External,
}

impl Trigger {
    pub const ALL: [Trigger; 10] = [
        Trigger::PurgeCache,
        Trigger::ConfTouch,
        Trigger::KernelModules,
        Trigger::EnvUpdate,
        Trigger::Ldconfig,
        Trigger::InitInform,
        Trigger::InitDisable,
        Trigger::MountBoot,
        Trigger::CleanPython,
        Trigger::External,
    ];

    pub fn as_str(&self) -> &str {
        match self {
            Trigger::PurgeCache => "purge-cache",
            Trigger::ConfTouch => "conf-touch",
            Trigger::KernelModules => "kernel-modules",
            Trigger::EnvUpdate => "env-update",
            Trigger::Ldconfig => "ldconfig",
            Trigger::InitInform => "init-inform",
            Trigger::InitDisable => "init-disable",
            Trigger::MountBoot => "mount-boot",
            Trigger::CleanPython => "clean-python",
            Trigger::External => "external",
        }
    }
}

impl fmt::Display for Trigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Trigger {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Trigger::ALL
            .iter()
            .find(|t| t.as_str() == s)
            .copied()
            .ok_or_else(|| format!("Invalid trigger: {}", s))
    }
}

/// What the selection rules and handlers know about a package
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TriggerData {
    pub category: String,
    pub name: String,
    pub version: String,
    /// Absolute paths the stage deals with
    pub content: BTreeSet<String>,
    pub trigger_script: Option<String>,
    /// Directories the dynamic linker searches, inside the target root
    pub linker_paths: Vec<String>,
}

impl TriggerData {
    /// Build trigger data for a package installed into (or removed from) `root`
    pub fn from_record(record: &PackageRecord, root: &Path) -> Self {
        Self {
            category: record.category.clone(),
            name: record.name.clone(),
            version: record.version.clone(),
            content: record.content.keys().cloned().collect(),
            trigger_script: record
                .trigger_script
                .clone()
                .filter(|s| !s.trim().is_empty()),
            linker_paths: linker_paths(root),
        }
    }

    /// Same package, restricted to the given paths
    pub fn with_content(mut self, content: BTreeSet<String>) -> Self {
        self.content = content;
        self
    }

    pub fn key(&self) -> String {
        format!("{}/{}", self.category, self.name)
    }

    fn has_prefix(&self, prefix: &str) -> bool {
        self.content.iter().any(|p| p.starts_with(prefix))
    }

    fn has_library(&self) -> bool {
        self.content.iter().any(|p| {
            p.contains(".so")
                && self
                    .linker_paths
                    .iter()
                    .any(|dir| p.starts_with(&format!("{}/", dir.trim_end_matches('/'))))
        })
    }
}

/// Linker search directories: the defaults plus `<root>/etc/ld.so.conf`
pub fn linker_paths(root: &Path) -> Vec<String> {
    let mut paths: Vec<String> = DEFAULT_LINKER_PATHS.iter().map(|p| p.to_string()).collect();

    if let Ok(conf) = fs::read_to_string(root.join("etc/ld.so.conf")) {
        for line in conf.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') || line.starts_with("include") {
                continue;
            }
            let path = line.trim_end_matches('/').to_string();
            if path.starts_with('/') && !paths.contains(&path) {
                paths.push(path);
            }
        }
    }
    paths
}

/// Triggers to run after a package's files are in place
pub fn postinstall(data: &TriggerData) -> BTreeSet<Trigger> {
    let mut triggers = BTreeSet::new();

    if data.trigger_script.is_some() {
        triggers.insert(Trigger::External);
    }
    if data.key() == SELF_PACKAGE {
        triggers.insert(Trigger::PurgeCache);
    }
    if data.has_prefix("/etc/conf.d") || data.has_prefix("/etc/init.d") {
        triggers.insert(Trigger::ConfTouch);
    }
    if data.has_prefix("/lib/modules/") {
        triggers.insert(Trigger::KernelModules);
    }
    if data.has_prefix("/etc/env.d/") {
        triggers.insert(Trigger::EnvUpdate);
    }
    if data.has_library() {
        triggers.insert(Trigger::Ldconfig);
    }
    triggers
}

/// Triggers to run before a package's files are moved in
pub fn preinstall(data: &TriggerData) -> BTreeSet<Trigger> {
    let mut triggers = BTreeSet::new();

    if data.trigger_script.is_some() {
        triggers.insert(Trigger::External);
    }
    if data.has_prefix("/etc/init.d/") {
        triggers.insert(Trigger::InitInform);
    }
    if data.has_prefix("/boot") {
        triggers.insert(Trigger::MountBoot);
    }
    triggers
}

/// Triggers to run before a package's files are deleted
pub fn preremove(data: &TriggerData) -> BTreeSet<Trigger> {
    let mut triggers = BTreeSet::new();

    if data.trigger_script.is_some() {
        triggers.insert(Trigger::External);
    }
    if data.has_prefix("/etc/init.d/") {
        triggers.insert(Trigger::InitDisable);
    }
    if data.has_prefix("/boot") {
        triggers.insert(Trigger::MountBoot);
    }
    triggers
}

/// Triggers to run after a package's files are gone
pub fn postremove(data: &TriggerData) -> BTreeSet<Trigger> {
    let mut triggers = BTreeSet::new();

    if data.trigger_script.is_some() {
        triggers.insert(Trigger::External);
    }
    if data.content.iter().any(|p| p.ends_with(".py")) {
        triggers.insert(Trigger::CleanPython);
    }
    if data.has_prefix("/etc/env.d/") {
        triggers.insert(Trigger::EnvUpdate);
    }
    if data.has_library() {
        triggers.insert(Trigger::Ldconfig);
    }
    triggers
}

/// Triggers for one stage
///
/// During an upgrade `counterpart` is the other side of the replacement:
/// the package being replaced for [`Stage::PreInstall`], the package
/// replacing it for [`Stage::PostRemove`]. Whatever the counterpart's
/// opposite stage already covers is not run twice.
pub fn select(stage: Stage, data: &TriggerData, counterpart: Option<&TriggerData>) -> BTreeSet<Trigger> {
    match (stage, counterpart) {
        (Stage::PreInstall, Some(old)) => &preinstall(data) - &preremove(old),
        (Stage::PostRemove, Some(new)) => &postremove(data) - &postinstall(new),
        (Stage::PreInstall, None) => preinstall(data),
        (Stage::PostInstall, _) => postinstall(data),
        (Stage::PreRemove, _) => preremove(data),
        (Stage::PostRemove, None) => postremove(data),
    }
}

/// What a handler did
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Ran,
    Skipped(String),
}

/// Signature shared by all trigger handlers
pub type TriggerHandler = fn(&TriggerExecutor<'_>, Stage, &TriggerData) -> Result<Outcome>;

/// Handler table
pub fn handler_for(trigger: Trigger) -> TriggerHandler {
    match trigger {
        Trigger::PurgeCache => purge_cache,
        Trigger::ConfTouch => conf_touch,
        Trigger::KernelModules => kernel_modules,
        Trigger::EnvUpdate => env_update,
        Trigger::Ldconfig => ldconfig,
        Trigger::InitInform => init_inform,
        Trigger::InitDisable => init_disable,
        Trigger::MountBoot => mount_boot,
        Trigger::CleanPython => clean_python,
        Trigger::External => external,
    }
}

/// Runs triggers against a target root
pub struct TriggerExecutor<'a> {
    root: PathBuf,
    timeout: Duration,
    dry_run: bool,
    disabled: BTreeSet<Trigger>,
    cache: Option<&'a ResultCache>,
    executed: RefCell<Vec<(Stage, Trigger)>>,
}

impl<'a> TriggerExecutor<'a> {
    /// Create an executor for the given installation root
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            timeout: DEFAULT_TIMEOUT,
            dry_run: false,
            disabled: BTreeSet::new(),
            cache: None,
            executed: RefCell::new(Vec::new()),
        }
    }

    /// Set a custom timeout for handler commands
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Log what would run without running anything
    pub fn dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    /// Never run these triggers
    pub fn with_disabled(mut self, disabled: impl IntoIterator<Item = Trigger>) -> Self {
        self.disabled.extend(disabled);
        self
    }

    /// Cache purged by [`Trigger::PurgeCache`]
    pub fn with_cache(mut self, cache: &'a ResultCache) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Whether the root is the running system
    pub fn is_live_root(&self) -> bool {
        self.root == Path::new("/")
    }

    /// Triggers run so far, in order
    pub fn executed(&self) -> Vec<(Stage, Trigger)> {
        self.executed.borrow().clone()
    }

    /// Run a set of triggers for one stage
    ///
    /// Failures are collected in the returned [`TriggerResults`] rather than
    /// stopping the remaining triggers.
    pub fn run(&self, stage: Stage, triggers: &BTreeSet<Trigger>, data: &TriggerData) -> TriggerResults {
        let mut results = TriggerResults::default();

        for &trigger in triggers {
            if self.disabled.contains(&trigger) {
                info!("[SKIP] {} {} (disabled)", stage, trigger);
                results.skipped += 1;
                continue;
            }
            if self.dry_run {
                info!("[DRY RUN] Would run {} {} for {}", stage, trigger, data.key());
                self.executed.borrow_mut().push((stage, trigger));
                results.skipped += 1;
                continue;
            }

            match handler_for(trigger)(self, stage, data) {
                Ok(Outcome::Ran) => {
                    debug!("[OK] {} {}", stage, trigger);
                    self.executed.borrow_mut().push((stage, trigger));
                    results.succeeded += 1;
                }
                Ok(Outcome::Skipped(why)) => {
                    debug!("[SKIP] {} {}: {}", stage, trigger, why);
                    results.skipped += 1;
                }
                Err(e) => {
                    warn!("[FAIL] {} {}: {}", stage, trigger, e);
                    results.failed += 1;
                    results.errors.push(format!("{}: {}", trigger, e));
                }
            }
        }
        results
    }

    /// Path of an absolute package path inside the root
    fn in_root(&self, path: &str) -> PathBuf {
        self.root.join(path.trim_start_matches('/'))
    }

    fn command_available(&self, cmd: &str) -> bool {
        if self.is_live_root() {
            handler_exists(cmd)
        } else {
            handler_exists_in_root(cmd, &self.root)
        }
    }

    /// Run a command if it is installed, waiting at most the configured timeout
    fn run_command(&self, cmd: &str, args: &[&str], envs: &[(&str, &str)]) -> Result<Outcome> {
        if !self.command_available(cmd) {
            return Ok(Outcome::Skipped(format!("{} is not installed", cmd)));
        }
        debug!("Executing: {} {:?}", cmd, args);

        let mut child = Command::new(cmd)
            .args(args)
            .envs(envs.iter().copied())
            .env("ROOT", &self.root)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| Error::TriggerError(format!("Failed to spawn '{}': {}", cmd, e)))?;

        self.wait(cmd, &mut child)
    }

    fn wait(&self, cmd: &str, child: &mut std::process::Child) -> Result<Outcome> {
        match child.wait_timeout(self.timeout)? {
            Some(status) => {
                let mut stderr = String::new();
                if let Some(mut pipe) = child.stderr.take() {
                    let _ = std::io::Read::read_to_string(&mut pipe, &mut stderr);
                }
                for line in stderr.lines() {
                    warn!("[{}] {}", cmd, line);
                }

                if status.success() {
                    Ok(Outcome::Ran)
                } else {
                    Err(Error::TriggerError(format!(
                        "'{}' failed with exit code {}: {}",
                        cmd,
                        status.code().unwrap_or(-1),
                        stderr.trim()
                    )))
                }
            }
            None => {
                let _ = child.kill();
                let _ = child.wait();
                Err(Error::TriggerError(format!(
                    "'{}' timed out after {} seconds",
                    cmd,
                    self.timeout.as_secs()
                )))
            }
        }
    }
}

fn purge_cache(executor: &TriggerExecutor<'_>, _stage: Stage, _data: &TriggerData) -> Result<Outcome> {
    match executor.cache {
        Some(cache) => {
            info!("Purging resolver cache");
            cache.purge();
            Ok(Outcome::Ran)
        }
        None => Ok(Outcome::Skipped("no cache attached".to_string())),
    }
}

fn conf_touch(executor: &TriggerExecutor<'_>, _stage: Stage, data: &TriggerData) -> Result<Outcome> {
    let now = SystemTime::now();
    for path in &data.content {
        if !(path.starts_with("/etc/conf.d") || path.starts_with("/etc/init.d")) {
            continue;
        }
        let target = executor.in_root(path);
        if target.is_file() {
            fs::File::options().write(true).open(&target)?.set_modified(now)?;
        }
    }
    Ok(Outcome::Ran)
}

fn kernel_modules(executor: &TriggerExecutor<'_>, _stage: Stage, data: &TriggerData) -> Result<Outcome> {
    // /lib/modules/<kernel version>/...
    let kernel = data
        .content
        .iter()
        .filter_map(|p| p.strip_prefix("/lib/modules/"))
        .filter_map(|rest| rest.split('/').next())
        .find(|v| !v.is_empty());

    let Some(kernel) = kernel else {
        return Ok(Outcome::Skipped("no kernel module directory".to_string()));
    };
    info!("Running depmod for kernel {}", kernel);

    let root = executor.root.to_string_lossy().to_string();
    if executor.is_live_root() {
        executor.run_command("depmod", &["-a", kernel], &[])
    } else {
        executor.run_command("depmod", &["-a", "-b", &root, kernel], &[])
    }
}

fn env_update(executor: &TriggerExecutor<'_>, _stage: Stage, _data: &TriggerData) -> Result<Outcome> {
    info!("Updating environment");
    executor.run_command("env-update", &[], &[])
}

fn ldconfig(executor: &TriggerExecutor<'_>, _stage: Stage, _data: &TriggerData) -> Result<Outcome> {
    info!("Regenerating linker cache");
    if executor.is_live_root() {
        executor.run_command("ldconfig", &[], &[])
    } else {
        let root = executor.root.to_string_lossy().to_string();
        executor.run_command("ldconfig", &["-r", &root], &[])
    }
}

fn init_inform(executor: &TriggerExecutor<'_>, _stage: Stage, data: &TriggerData) -> Result<Outcome> {
    for path in data.content.iter().filter(|p| p.starts_with("/etc/init.d/")) {
        if !executor.in_root(path).exists() {
            info!("A new service will be installed: {}", path);
        }
    }
    Ok(Outcome::Ran)
}

fn init_disable(executor: &TriggerExecutor<'_>, _stage: Stage, data: &TriggerData) -> Result<Outcome> {
    if !executor.is_live_root() {
        return Ok(Outcome::Skipped("services are only managed on the live root".to_string()));
    }
    for path in data.content.iter().filter(|p| p.starts_with("/etc/init.d/")) {
        if !executor.in_root(path).is_file() {
            continue;
        }
        if let Some(service) = Path::new(path).file_name().and_then(|n| n.to_str()) {
            info!("Removing boot service: {}", service);
            executor.run_command("rc-update", &["del", service], &[])?;
        }
    }
    Ok(Outcome::Ran)
}

fn mount_boot(executor: &TriggerExecutor<'_>, _stage: Stage, _data: &TriggerData) -> Result<Outcome> {
    if !executor.is_live_root() {
        return Ok(Outcome::Skipped("not the live root".to_string()));
    }
    let fstab = fs::read_to_string("/etc/fstab").unwrap_or_default();
    if !has_mount_point(&fstab, "/boot") {
        return Ok(Outcome::Skipped("/boot is not a separate filesystem".to_string()));
    }
    let mounts = fs::read_to_string("/proc/mounts").unwrap_or_default();
    if has_mount_point(&mounts, "/boot") {
        return Ok(Outcome::Skipped("/boot is already mounted".to_string()));
    }
    info!("Mounting /boot");
    executor.run_command("mount", &["/boot"], &[])
}

/// Whether an fstab-formatted table lists `mount_point`
fn has_mount_point(table: &str, mount_point: &str) -> bool {
    table
        .lines()
        .map(str::trim)
        .filter(|l| !l.starts_with('#'))
        .any(|l| l.split_whitespace().nth(1) == Some(mount_point))
}

fn clean_python(executor: &TriggerExecutor<'_>, _stage: Stage, data: &TriggerData) -> Result<Outcome> {
    for path in data.content.iter().filter(|p| p.ends_with(".py")) {
        for suffix in ["c", "o"] {
            let compiled = executor.in_root(&format!("{}{}", path, suffix));
            if compiled.is_file() {
                debug!("Removing {}", compiled.display());
                if let Err(e) = fs::remove_file(&compiled) {
                    warn!("Could not remove {}: {}", compiled.display(), e);
                }
            }
        }
    }
    Ok(Outcome::Ran)
}

/// Run the package's trigger script with `sh`
///
/// The script receives the stage as its first argument and the package
/// identity in `EQUO_*` environment variables.
fn external(executor: &TriggerExecutor<'_>, stage: Stage, data: &TriggerData) -> Result<Outcome> {
    let Some(script) = &data.trigger_script else {
        return Ok(Outcome::Skipped("package has no trigger script".to_string()));
    };

    let mut file = tempfile::Builder::new().prefix("equo-trigger-").tempfile()?;
    file.write_all(script.as_bytes())?;
    file.flush()?;

    let mut child = Command::new("/bin/sh")
        .arg(file.path())
        .arg(stage.as_str())
        .env("EQUO_STAGE", stage.as_str())
        .env("EQUO_ROOT", &executor.root)
        .env("EQUO_CATEGORY", &data.category)
        .env("EQUO_NAME", &data.name)
        .env("EQUO_VERSION", &data.version)
        .current_dir(&executor.root)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| Error::TriggerError(format!("Failed to spawn trigger script: {}", e)))?;

    executor.wait("trigger script", &mut child)
}

/// Check if a handler command exists on the system
fn handler_exists(cmd: &str) -> bool {
    if cmd.is_empty() {
        return false;
    }
    if cmd.starts_with('/') {
        return Path::new(cmd).exists();
    }
    if let Ok(output) = Command::new("which").arg(cmd).output() {
        return output.status.success();
    }
    false
}

/// Check if a handler command exists in a target root
///
/// For absolute paths, checks under the target root.
/// For non-absolute paths, checks common bin directories in target.
pub fn handler_exists_in_root(cmd: &str, root: &Path) -> bool {
    if cmd.is_empty() {
        return false;
    }
    if cmd.starts_with('/') {
        return root.join(cmd.trim_start_matches('/')).exists();
    }

    let search_paths = [
        "usr/bin", "usr/sbin", "bin", "sbin", "usr/local/bin", "usr/local/sbin",
    ];
    search_paths
        .iter()
        .any(|dir| root.join(dir).join(cmd).exists())
}

/// Results of trigger execution
#[derive(Debug, Default)]
pub struct TriggerResults {
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
    pub errors: Vec<String>,
}

impl TriggerResults {
    /// Check if all triggers succeeded
    pub fn all_succeeded(&self) -> bool {
        self.failed == 0
    }

    /// Total triggers processed
    pub fn total(&self) -> usize {
        self.succeeded + self.failed + self.skipped
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn data(key: &str, paths: &[&str]) -> TriggerData {
        let (category, name) = key.split_once('/').unwrap();
        TriggerData {
            category: category.to_string(),
            name: name.to_string(),
            version: "1.0".to_string(),
            content: paths.iter().map(|p| p.to_string()).collect(),
            trigger_script: None,
            linker_paths: DEFAULT_LINKER_PATHS.iter().map(|p| p.to_string()).collect(),
        }
    }

    #[test]
    fn test_postinstall_rules() {
        let d = data(
            "sys-libs/zlib",
            &["/usr/lib/libz.so.1", "/etc/env.d/50zlib", "/lib/modules/6.1.0/extra/z.ko"],
        );
        let triggers = postinstall(&d);
        assert!(triggers.contains(&Trigger::Ldconfig));
        assert!(triggers.contains(&Trigger::EnvUpdate));
        assert!(triggers.contains(&Trigger::KernelModules));
        assert!(!triggers.contains(&Trigger::External));

        assert!(postinstall(&data(SELF_PACKAGE, &[])).contains(&Trigger::PurgeCache));
        assert!(postinstall(&data("app-misc/svc", &["/etc/conf.d/svc"])).contains(&Trigger::ConfTouch));
    }

    #[test]
    fn test_library_outside_linker_paths() {
        let d = data("app-misc/plugin", &["/opt/plugin/libplug.so"]);
        assert!(!postinstall(&d).contains(&Trigger::Ldconfig));

        let mut d = d;
        d.linker_paths.push("/opt/plugin".to_string());
        assert!(postinstall(&d).contains(&Trigger::Ldconfig));
    }

    #[test]
    fn test_pre_and_post_remove_rules() {
        let d = data("app-misc/svc", &["/etc/init.d/svc", "/boot/kernel-6.1", "/usr/lib/py/mod.py"]);
        let pre = preremove(&d);
        assert!(pre.contains(&Trigger::InitDisable));
        assert!(pre.contains(&Trigger::MountBoot));

        let post = postremove(&d);
        assert!(post.contains(&Trigger::CleanPython));
        assert!(!post.contains(&Trigger::InitDisable));

        let install = preinstall(&d);
        assert!(install.contains(&Trigger::InitInform));
        assert!(install.contains(&Trigger::MountBoot));
    }

    #[test]
    fn test_trigger_script_selects_external_everywhere() {
        let mut d = data("app-misc/foo", &[]);
        d.trigger_script = Some("echo hi".to_string());
        for stage in [Stage::PreInstall, Stage::PostInstall, Stage::PreRemove, Stage::PostRemove] {
            assert!(select(stage, &d, None).contains(&Trigger::External), "{}", stage);
        }
    }

    #[test]
    fn test_upgrade_subtracts_counterpart() {
        let new = data("sys-libs/zlib", &["/boot/zlib.img", "/usr/lib/libz.so.2"]);
        let old = data("sys-libs/zlib", &["/boot/zlib.img", "/usr/lib/libz.so.1"]);

        // MountBoot already ran in the old package's preremove
        assert!(preinstall(&new).contains(&Trigger::MountBoot));
        assert!(!select(Stage::PreInstall, &new, Some(&old)).contains(&Trigger::MountBoot));

        // ldconfig already runs in the new package's postinstall
        assert!(postremove(&old).contains(&Trigger::Ldconfig));
        assert!(select(Stage::PostRemove, &old, Some(&new)).is_empty());
    }

    #[test]
    fn test_linker_paths_read_ld_so_conf() {
        let root = TempDir::new().unwrap();
        fs::create_dir_all(root.path().join("etc")).unwrap();
        fs::write(
            root.path().join("etc/ld.so.conf"),
            "# comment\n/opt/lib/\ninclude /etc/ld.so.conf.d/*.conf\n/usr/lib\n",
        )
        .unwrap();

        let paths = linker_paths(root.path());
        assert!(paths.contains(&"/opt/lib".to_string()));
        assert_eq!(paths.iter().filter(|p| p.as_str() == "/usr/lib").count(), 1);
    }

    #[test]
    fn test_trigger_names_round_trip() {
        for trigger in Trigger::ALL {
            assert_eq!(trigger.as_str().parse::<Trigger>().unwrap(), trigger);
        }
        assert!("nonsense".parse::<Trigger>().is_err());
    }

    #[test]
    fn test_missing_commands_are_skipped() {
        let root = TempDir::new().unwrap();
        let executor = TriggerExecutor::new(root.path());
        let d = data("sys-libs/zlib", &["/usr/lib/libz.so.1"]);

        let results = executor.run(Stage::PostInstall, &postinstall(&d), &d);
        assert!(results.all_succeeded());
        assert_eq!(results.skipped, 1);
        assert!(executor.executed().is_empty());
    }

    #[test]
    fn test_disabled_and_dry_run() {
        let root = TempDir::new().unwrap();
        let d = data("app-misc/foo", &["/usr/lib/py/a.py"]);
        let set: BTreeSet<Trigger> = [Trigger::CleanPython, Trigger::EnvUpdate].into();

        let executor = TriggerExecutor::new(root.path()).with_disabled([Trigger::EnvUpdate]);
        let results = executor.run(Stage::PostRemove, &set, &d);
        assert_eq!(results.succeeded, 1);
        assert_eq!(results.skipped, 1);
        assert_eq!(executor.executed(), vec![(Stage::PostRemove, Trigger::CleanPython)]);

        let dry = TriggerExecutor::new(root.path()).dry_run(true);
        let results = dry.run(Stage::PostRemove, &set, &d);
        assert_eq!(results.skipped, 2);
        assert_eq!(dry.executed().len(), 2);
    }

    #[test]
    fn test_clean_python_removes_bytecode() {
        let root = TempDir::new().unwrap();
        let dir = root.path().join("usr/lib/py");
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("mod.pyc"), b"").unwrap();
        fs::write(dir.join("mod.pyo"), b"").unwrap();

        let executor = TriggerExecutor::new(root.path());
        let d = data("dev-python/mod", &["/usr/lib/py/mod.py"]);
        let results = executor.run(Stage::PostRemove, &postremove(&d), &d);

        assert!(results.all_succeeded());
        assert!(!dir.join("mod.pyc").exists());
        assert!(!dir.join("mod.pyo").exists());
    }

    #[test]
    fn test_external_script_exit_status() {
        let root = TempDir::new().unwrap();
        let executor = TriggerExecutor::new(root.path());
        let external: BTreeSet<Trigger> = [Trigger::External].into();

        let mut ok = data("app-misc/foo", &[]);
        ok.trigger_script = Some("test \"$1\" = postinstall && touch \"$EQUO_ROOT/ran\"".to_string());
        let results = executor.run(Stage::PostInstall, &external, &ok);
        assert!(results.all_succeeded());
        assert!(root.path().join("ran").exists());

        let mut bad = data("app-misc/foo", &[]);
        bad.trigger_script = Some("exit 3".to_string());
        let results = executor.run(Stage::PostInstall, &external, &bad);
        assert_eq!(results.failed, 1);
        assert!(results.errors[0].contains("exit code 3"));
    }

    #[test]
    fn test_purge_cache_trigger() {
        let root = TempDir::new().unwrap();
        let cache = ResultCache::new();
        let executor = TriggerExecutor::new(root.path()).with_cache(&cache);
        let d = data(SELF_PACKAGE, &[]);

        let results = executor.run(Stage::PostInstall, &postinstall(&d), &d);
        assert_eq!(results.succeeded, 1);
        assert_eq!(executor.executed(), vec![(Stage::PostInstall, Trigger::PurgeCache)]);
    }

    #[test]
    fn test_handler_exists_in_root() {
        let root = TempDir::new().unwrap();
        fs::create_dir_all(root.path().join("sbin")).unwrap();
        fs::write(root.path().join("sbin/ldconfig"), b"").unwrap();

        assert!(handler_exists_in_root("ldconfig", root.path()));
        assert!(handler_exists_in_root("/sbin/ldconfig", root.path()));
        assert!(!handler_exists_in_root("depmod", root.path()));
        assert!(!handler_exists(""));
    }

    #[test]
    fn test_has_mount_point() {
        let fstab = "# /boot is separate\n/dev/sda1 /boot ext2 noauto 1 2\n/dev/sda2 / ext4 defaults 0 1\n";
        assert!(has_mount_point(fstab, "/boot"));
        assert!(!has_mount_point("/dev/sda2 / ext4 defaults 0 1", "/boot"));
    }
}
