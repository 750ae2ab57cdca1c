// src/transaction/steps.rs

//! Preparation and step implementations of [`PackageTransaction`]

use super::context::{Replacement, TransactionContext, content_diff};
use super::{Action, FetchStatus, PackageTransaction, PrepareOptions, Step};
use crate::atom::Atom;
use crate::db::models::{ContentKind, PackageRecord};
use crate::db::source::PackageDatabase;
use crate::error::{Error, Result};
use crate::filesystem;
use crate::packages::PackageArchive;
use crate::repository::RepositoryHandle;
use crate::resolver::{Match, MatchOptions, matcher::match_in_database};
use crate::trigger::{self, Stage, TriggerData, TriggerExecutor};
use crate::version::VersionTriple;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};
use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Re-downloads attempted after a checksum mismatch
const MAX_CHECKSUM_RETRIES: u32 = 5;

impl PackageTransaction<'_> {
    fn repository_record(&self, m: &Match) -> Result<(&RepositoryHandle, PackageRecord)> {
        if m.is_installed() {
            return Err(Error::NotFound(format!(
                "{} is an installed package, not a repository package",
                m
            )));
        }
        let handle = self
            .repos
            .get(&m.repository)
            .ok_or_else(|| Error::RepositoryUnavailable(m.repository.clone()))?;
        let record = handle.database()?.get_record(m.package_id)?;
        Ok((handle, record))
    }

    fn package_path(&self, handle: &RepositoryHandle, record: &PackageRecord) -> PathBuf {
        if handle.is_package_file() {
            PathBuf::from(&handle.url)
        } else {
            self.config.package_path(&handle.name, &record.download_url)
        }
    }

    pub(super) fn prepare_fetch(&self, m: &Match, options: PrepareOptions) -> Result<TransactionContext> {
        let (handle, record) = self.repository_record(m)?;
        let mut context = TransactionContext::new(Action::Fetch(m.clone()), options, record);
        context.repository = Some(handle.name.clone());
        context.download_url = handle.package_url(&context.record.download_url);
        let path = self.package_path(handle, &context.record);

        if !handle.is_package_file() {
            let size_on_disk = fs::metadata(&path)
                .ok()
                .filter(|meta| meta.is_file())
                .map(|meta| meta.len());
            // A recorded size of 0 means unknown: any existing file matches
            let size_matches = size_on_disk.is_some_and(|len| {
                context.record.size <= 0 || len == context.record.size as u64
            });

            if !size_matches {
                context.steps.push(Step::Fetch);
            }
            if options.do_checksum {
                context.steps.push(Step::Checksum);
            }
        }

        context.package_path = Some(path);
        Ok(context)
    }

    pub(super) fn prepare_install(&self, m: &Match, options: PrepareOptions) -> Result<TransactionContext> {
        let (handle, record) = self.repository_record(m)?;
        let mut context = TransactionContext::new(Action::Install(m.clone()), options, record);
        context.repository = Some(handle.name.clone());
        context.download_url = handle.package_url(&context.record.download_url);
        context.package_path = Some(self.package_path(handle, &context.record));
        context.unpack_dir = Some(
            self.config
                .unpack_dir
                .join(handle.name.replace('/', "_"))
                .join(context.atom.replace('/', "_")),
        );

        context.replacement = self.find_replacement(&context.record)?;
        if let Some(replacement) = &context.replacement
            && replacement.diff_removal
        {
            context.remove_content = content_diff(&replacement.record.content, &context.record.content);
        }
        context.conflicts = self.installed_conflicts(&context.record, context.replacement.as_ref())?;

        let diff_removal = context.is_diff_removal();
        if !context.conflicts.is_empty() {
            context.steps.push(Step::RemoveConflicts);
        }
        context.steps.extend([Step::Unpack, Step::PreInstall]);
        if diff_removal {
            context.steps.push(Step::PreRemove);
        }
        context.steps.push(Step::Install);
        if diff_removal {
            context.steps.push(Step::PostRemove);
        }
        context
            .steps
            .extend([Step::PostInstall, Step::ShowMessages, Step::Cleanup]);

        Ok(context)
    }

    pub(super) fn prepare_remove(
        &self,
        id: i64,
        action: Action,
        options: PrepareOptions,
    ) -> Result<TransactionContext> {
        let record = self.installed.get_record(id)?;
        if self.installed.is_protected_system_package(id)? {
            return Err(Error::SystemPackage(record.atom()));
        }
        let mut context = TransactionContext::new(action, options, record);
        context.remove_id = Some(id);
        context.remove_content = context.record.content.clone();
        context.steps = vec![Step::PreRemove, Step::Remove, Step::PostRemove];
        Ok(context)
    }

    /// The installed package of the same key and slot
    fn find_replacement(&self, record: &PackageRecord) -> Result<Option<Replacement>> {
        let candidates = self
            .installed
            .resolve_candidates(&record.key(), Some(&record.slot), None, true)?;
        let Some(&id) = candidates.last() else {
            return Ok(None);
        };

        let installed_triple = self.installed.get_version_triple(id)?;
        let new_triple = VersionTriple::new(record.version.clone(), record.tag.clone(), record.revision);
        let old = self.installed.get_record(id)?;
        debug!("{} replaces installed {} (id {})", record.atom(), old.atom(), id);

        Ok(Some(Replacement {
            id,
            record: old,
            diff_removal: new_triple.cmp(&installed_triple) != std::cmp::Ordering::Equal,
        }))
    }

    /// Installed packages matching the record's conflict specifiers
    fn installed_conflicts(
        &self,
        record: &PackageRecord,
        replacement: Option<&Replacement>,
    ) -> Result<Vec<i64>> {
        let mut ids = BTreeSet::new();
        for spec in &record.conflicts {
            let atom = match Atom::parse(spec) {
                Ok(atom) => atom,
                Err(e) => {
                    warn!("Ignoring malformed conflict of {}: {}", record.atom(), e);
                    continue;
                }
            };
            let options = MatchOptions {
                allow_masked: true,
                ..MatchOptions::default()
            };
            for pkg in match_in_database(self.installed, &atom, &options)? {
                if let Some(id) = pkg.id
                    && replacement.is_none_or(|r| r.id != id)
                {
                    ids.insert(id);
                }
            }
        }
        Ok(ids.into_iter().collect())
    }

    fn fetch_package(&self, context: &TransactionContext) -> Result<()> {
        let path = require_path(&context.package_path, "package file")?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        info!("Fetching {} from {}", context.atom, context.download_url);
        match self.fetcher.fetch(&context.download_url, path) {
            FetchStatus::Ok => Ok(()),
            FetchStatus::Failed(reason) => Err(Error::DownloadError(reason)),
            FetchStatus::ChecksumMismatch => Err(Error::ChecksumMismatch {
                expected: context.record.checksum.clone(),
                actual: "reported by fetcher".to_string(),
            }),
            FetchStatus::Cancelled => Err(Error::DownloadError(format!(
                "download of {} cancelled",
                context.download_url
            ))),
        }
    }

    pub(super) fn step_fetch(&self, context: &mut TransactionContext) -> Result<()> {
        self.fetch_package(context)
    }

    /// Verify the package file, re-fetching it on mismatch
    pub(super) fn step_checksum(&self, context: &mut TransactionContext) -> Result<()> {
        let expected = context.record.checksum.to_lowercase();
        if expected.is_empty() {
            warn!("No checksum recorded for {}, skipping verification", context.atom);
            return Ok(());
        }
        let path = require_path(&context.package_path, "package file")?.to_path_buf();

        let mut actual = String::from("missing");
        for attempt in 0..=MAX_CHECKSUM_RETRIES {
            if attempt > 0 && self.is_cancelled() {
                return Err(Error::Cancelled);
            }
            if path.is_file() {
                actual = sha256_file(&path)?;
                if actual == expected {
                    debug!("Checksum of {} verified", context.atom);
                    return Ok(());
                }
                warn!(
                    "Checksum mismatch for {} (attempt {}): expected {}, got {}",
                    context.atom,
                    attempt + 1,
                    expected,
                    actual
                );
            }
            if attempt == MAX_CHECKSUM_RETRIES {
                break;
            }
            self.fetch_package(context)?;
        }

        Err(Error::ChecksumMismatch { expected, actual })
    }

    /// Remove installed packages that conflict with the one being installed
    pub(super) fn step_remove_conflicts(&self, context: &mut TransactionContext) -> Result<()> {
        for &id in &context.conflicts {
            if !self.installed.get_package(id).is_ok_and(|pkg| pkg.id == Some(id)) {
                debug!("Conflicting package {} is already gone", id);
                continue;
            }

            let mut nested = PackageTransaction::new(self.repos, self.installed, self.config, self.fetcher)
                .with_progress(self.progress)
                .with_disabled_triggers(self.disabled_triggers.iter().copied())
                .with_cancel(self.cancel_token());
            if let Some(cache) = self.cache {
                nested = nested.with_cache(cache);
            }

            nested.prepare(
                Action::RemoveConflict(id),
                PrepareOptions {
                    remove_config: context.options.remove_config,
                    do_checksum: false,
                },
            )?;
            let result = nested.run();
            nested.kill();
            result?;
        }
        Ok(())
    }

    pub(super) fn step_unpack(&self, context: &mut TransactionContext) -> Result<()> {
        let path = require_path(&context.package_path, "package file")?;
        let unpack_dir = require_path(&context.unpack_dir, "unpack directory")?;

        let archive = PackageArchive::open(path)?;
        let image = archive.unpack(unpack_dir)?;
        let content = filesystem::image_content(&image)?;

        if let Some(replacement) = &context.replacement
            && replacement.diff_removal
        {
            context.remove_content = content_diff(&replacement.record.content, &content);
        }
        context.record.content = content;
        context.image_dir = Some(image);
        Ok(())
    }

    fn new_trigger_data(&self, context: &TransactionContext) -> TriggerData {
        TriggerData::from_record(&context.record, &self.config.root)
    }

    /// Trigger data of whatever the remove side deletes
    fn old_trigger_data(&self, context: &TransactionContext) -> Option<TriggerData> {
        let record = match (&context.action, &context.replacement) {
            (Action::Remove(_) | Action::RemoveConflict(_), _) => &context.record,
            (Action::Install(_), Some(replacement)) if replacement.diff_removal => &replacement.record,
            _ => return None,
        };
        let paths = context.remove_content.keys().cloned().collect();
        Some(TriggerData::from_record(record, &self.config.root).with_content(paths))
    }

    fn run_triggers(&self, stage: Stage, data: &TriggerData, counterpart: Option<&TriggerData>) -> Result<()> {
        let triggers = trigger::select(stage, data, counterpart);
        if triggers.is_empty() {
            return Ok(());
        }

        let mut executor = TriggerExecutor::new(&self.config.root)
            .with_disabled(self.disabled_triggers.iter().copied());
        if let Some(cache) = self.cache {
            executor = executor.with_cache(cache);
        }

        let results = executor.run(stage, &triggers, data);
        if results.all_succeeded() {
            Ok(())
        } else {
            Err(Error::TriggerError(results.errors.join("; ")))
        }
    }

    pub(super) fn step_preinstall(&self, context: &mut TransactionContext) -> Result<()> {
        let new = self.new_trigger_data(context);
        let old = self.old_trigger_data(context);
        self.run_triggers(Stage::PreInstall, &new, old.as_ref())
    }

    pub(super) fn step_preremove(&self, context: &mut TransactionContext) -> Result<()> {
        match self.old_trigger_data(context) {
            Some(old) => self.run_triggers(Stage::PreRemove, &old, None),
            None => Ok(()),
        }
    }

    pub(super) fn step_postremove(&self, context: &mut TransactionContext) -> Result<()> {
        let Some(old) = self.old_trigger_data(context) else {
            return Ok(());
        };
        match context.action {
            Action::Install(_) => {
                let new = self.new_trigger_data(context);
                self.run_triggers(Stage::PostRemove, &old, Some(&new))
            }
            _ => self.run_triggers(Stage::PostRemove, &old, None),
        }
    }

    pub(super) fn step_postinstall(&self, context: &mut TransactionContext) -> Result<()> {
        let new = self.new_trigger_data(context);
        self.run_triggers(Stage::PostInstall, &new, None)
    }

    /// Move the image into the root and swap the database records
    ///
    /// The new record is committed before the replaced one is dropped, so a
    /// failure in between leaves both recorded rather than neither.
    pub(super) fn step_install(&self, context: &mut TransactionContext) -> Result<()> {
        let image = require_path(&context.image_dir, "package image")?.to_path_buf();
        let replaced = context.replacement.as_ref().map(|r| r.id);
        let installed = self.installed;

        let report = filesystem::move_image(&image, &self.config.root, &self.config.fs_policy(), |path| {
            Ok(installed
                .owns_file(path)?
                .into_iter()
                .any(|owner| Some(owner) != replaced))
        })?;

        context.record.content = report.content;
        let new_id = self
            .installed
            .add_package(&context.record, context.repository.as_deref())?;
        context.installed_id = Some(new_id);
        info!("Installed {} (id {})", context.atom, new_id);

        if let Some(replacement) = &context.replacement {
            self.installed.remove_package(replacement.id)?;
            debug!("Dropped replaced record {}", replacement.id);

            if replacement.diff_removal {
                let content = self.removable_content(&context.remove_content, None)?;
                let policy = self.config.fs_policy().with_remove_config(true);
                filesystem::remove_content(&self.config.root, &content, &policy)?;
            }
        }
        Ok(())
    }

    pub(super) fn step_remove(&self, context: &mut TransactionContext) -> Result<()> {
        let id = context
            .remove_id
            .ok_or_else(|| Error::NotFound(format!("installed id of {}", context.atom)))?;

        let content = self.removable_content(&context.remove_content, Some(id))?;
        let policy = self
            .config
            .fs_policy()
            .with_remove_config(context.options.remove_config);
        let report = filesystem::remove_content(&self.config.root, &content, &policy)?;
        for kept in &report.kept {
            info!("Keeping configuration file {}", kept);
        }

        self.installed.remove_package(id)?;
        info!("Removed {} (id {})", context.atom, id);
        Ok(())
    }

    /// Content minus files other installed packages still own
    fn removable_content(
        &self,
        content: &BTreeMap<String, ContentKind>,
        owner: Option<i64>,
    ) -> Result<BTreeMap<String, ContentKind>> {
        if self.config.collision_protect == 0 {
            return Ok(content.clone());
        }

        let mut removable = BTreeMap::new();
        for (path, kind) in content {
            if *kind != ContentKind::Dir
                && self
                    .installed
                    .owns_file(path)?
                    .into_iter()
                    .any(|id| Some(id) != owner)
            {
                warn!("Collision found during remove of {} - cannot remove", path);
                continue;
            }
            removable.insert(path.clone(), *kind);
        }
        Ok(removable)
    }

    pub(super) fn step_show_messages(&self, context: &mut TransactionContext) -> Result<()> {
        for message in &context.record.messages {
            self.progress.message(&context.atom, message);
        }
        Ok(())
    }

    pub(super) fn step_cleanup(&self, context: &mut TransactionContext) -> Result<()> {
        if let Some(unpack_dir) = &context.unpack_dir
            && unpack_dir.exists()
        {
            fs::remove_dir_all(unpack_dir)?;
            debug!("Removed {}", unpack_dir.display());
        }
        context.image_dir = None;
        Ok(())
    }
}

fn require_path<'p>(path: &'p Option<PathBuf>, what: &str) -> Result<&'p Path> {
    path.as_deref()
        .ok_or_else(|| Error::IoError(format!("No {} for this transaction", what)))
}

/// Lowercase hex SHA-256 of a file
pub fn sha256_file(path: &Path) -> Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    io::copy(&mut file, &mut hasher)?;
    Ok(format!("{:x}", hasher.finalize()))
}
