// src/transaction/mod.rs

//! Step-sequenced package transactions
//!
//! A [`PackageTransaction`] executes one action on one package: fetching
//! its file, installing it or removing it. `prepare` resolves everything the
//! action needs into a [`TransactionContext`] and decides the step list;
//! `run` executes the steps strictly in order.
//!
//! ```text
//! Fetch:   fetch -> checksum
//! Install: [remove_conflicts] -> unpack -> preinstall -> [preremove] -> install
//!          -> [postremove] -> postinstall -> showmessages -> cleanup
//! Remove:  preremove -> remove -> postremove
//! ```
//!
//! The first failing step halts the pipeline. Nothing is rolled back: the
//! returned [`Error::StepFailure`] lists the steps that already completed.

mod context;
mod lock;
mod steps;

pub use context::{Replacement, TransactionContext, content_diff};
pub use lock::PidLock;
pub use steps::sha256_file;

use crate::cache::ResultCache;
use crate::config::Config;
use crate::db::InstalledDatabase;
use crate::error::{Error, Result};
use crate::repository::RepositorySet;
use crate::resolver::Match;
use crate::trigger::Trigger;
use std::fmt;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// One unit of work in a transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Step {
    Fetch,
    Checksum,
    RemoveConflicts,
    Unpack,
    PreInstall,
    PreRemove,
    Install,
    Remove,
    PostRemove,
    PostInstall,
    ShowMessages,
    Cleanup,
}

impl Step {
    pub fn as_str(&self) -> &str {
        match self {
            Step::Fetch => "fetch",
            Step::Checksum => "checksum",
            Step::RemoveConflicts => "remove_conflicts",
            Step::Unpack => "unpack",
            Step::PreInstall => "preinstall",
            Step::PreRemove => "preremove",
            Step::Install => "install",
            Step::Remove => "remove",
            Step::PostRemove => "postremove",
            Step::PostInstall => "postinstall",
            Step::ShowMessages => "showmessages",
            Step::Cleanup => "cleanup",
        }
    }

    /// Steps whose failure is logged but never halts the pipeline
    pub fn is_best_effort(&self) -> bool {
        matches!(self, Step::ShowMessages | Step::Cleanup)
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a transaction does
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Download a repository package file
    Fetch(Match),
    /// Install a repository package, replacing the installed one of its slot
    Install(Match),
    /// Remove an installed package
    Remove(i64),
    /// Remove an installed package that conflicts with one being installed
    RemoveConflict(i64),
}

impl Action {
    pub fn as_str(&self) -> &str {
        match self {
            Action::Fetch(_) => "fetch",
            Action::Install(_) => "install",
            Action::Remove(_) => "remove",
            Action::RemoveConflict(_) => "remove_conflict",
        }
    }
}

/// Options fixed at prepare time
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PrepareOptions {
    /// Also delete protected configuration files on removal
    pub remove_config: bool,
    /// Verify downloaded files against their recorded SHA-256
    pub do_checksum: bool,
}

impl Default for PrepareOptions {
    fn default() -> Self {
        Self {
            remove_config: false,
            do_checksum: true,
        }
    }
}

/// Outcome of a single download
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchStatus {
    Ok,
    Failed(String),
    ChecksumMismatch,
    Cancelled,
}

/// Downloads package files
pub trait Fetcher {
    /// Download `url` to `dest`, replacing whatever is there
    fn fetch(&self, url: &str, dest: &Path) -> FetchStatus;
}

/// Receives transaction progress
///
/// Every method has an empty default so implementations pick what they
/// care about.
pub trait ProgressReporter {
    fn step_started(&self, _step: Step, _atom: &str) {}

    fn step_finished(&self, _step: Step, _atom: &str) {}

    fn step_failed(&self, _step: Step, _atom: &str, _reason: &str) {}

    /// A package message meant for the user
    fn message(&self, _atom: &str, _text: &str) {}
}

/// Progress reporter that discards everything
#[derive(Debug, Default)]
pub struct SilentProgress;

impl ProgressReporter for SilentProgress {}

/// Progress reporter that logs to tracing at info level
#[derive(Debug, Default)]
pub struct LogProgress;

impl ProgressReporter for LogProgress {
    fn step_started(&self, step: Step, atom: &str) {
        info!("[{}] {}", step, atom);
    }

    fn step_failed(&self, step: Step, atom: &str, reason: &str) {
        warn!("[{}] {} failed: {}", step, atom, reason);
    }

    fn message(&self, atom: &str, text: &str) {
        info!("{}: {}", atom, text);
    }
}

static SILENT: SilentProgress = SilentProgress;

/// A single-package transaction
pub struct PackageTransaction<'a> {
    repos: &'a RepositorySet,
    installed: &'a dyn InstalledDatabase,
    config: &'a Config,
    fetcher: &'a dyn Fetcher,
    progress: &'a dyn ProgressReporter,
    cache: Option<&'a ResultCache>,
    disabled_triggers: Vec<Trigger>,
    cancel: Arc<AtomicBool>,
    context: Option<TransactionContext>,
}

impl<'a> PackageTransaction<'a> {
    pub fn new(
        repos: &'a RepositorySet,
        installed: &'a dyn InstalledDatabase,
        config: &'a Config,
        fetcher: &'a dyn Fetcher,
    ) -> Self {
        Self {
            repos,
            installed,
            config,
            fetcher,
            progress: &SILENT,
            cache: None,
            disabled_triggers: Vec::new(),
            cancel: Arc::new(AtomicBool::new(false)),
            context: None,
        }
    }

    pub fn with_progress(mut self, progress: &'a dyn ProgressReporter) -> Self {
        self.progress = progress;
        self
    }

    /// Cache purged when the package manager itself is installed
    pub fn with_cache(mut self, cache: &'a ResultCache) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn with_disabled_triggers(mut self, triggers: impl IntoIterator<Item = Trigger>) -> Self {
        self.disabled_triggers.extend(triggers);
        self
    }

    /// Share a cancellation flag; it is checked before every step
    pub fn with_cancel(mut self, cancel: Arc<AtomicBool>) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn cancel_token(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancel)
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.load(Ordering::Relaxed)
    }

    /// The prepared context, if any
    pub fn context(&self) -> Option<&TransactionContext> {
        self.context.as_ref()
    }

    /// Steps `run` will execute
    pub fn steps(&self) -> &[Step] {
        self.context.as_ref().map(|c| c.steps.as_slice()).unwrap_or(&[])
    }

    /// Resolve everything the action needs and plan its steps
    ///
    /// # Panics
    ///
    /// If the transaction is already prepared and not killed.
    pub fn prepare(&mut self, action: Action, options: PrepareOptions) -> Result<()> {
        assert!(
            self.context.is_none(),
            "transaction already prepared; kill() it before preparing again"
        );

        let context = match &action {
            Action::Fetch(m) => self.prepare_fetch(m, options)?,
            Action::Install(m) => self.prepare_install(m, options)?,
            Action::Remove(id) | Action::RemoveConflict(id) => {
                self.prepare_remove(*id, action.clone(), options)?
            }
        };

        debug!(
            "Prepared {} of {}: {}",
            action.as_str(),
            context.atom,
            context
                .steps
                .iter()
                .map(Step::as_str)
                .collect::<Vec<_>>()
                .join(", ")
        );
        self.context = Some(context);
        Ok(())
    }

    /// Execute the prepared steps in order
    ///
    /// # Panics
    ///
    /// If called before `prepare`.
    pub fn run(&mut self) -> Result<()> {
        assert!(self.context.is_some(), "run() called before prepare()");
        let Some(mut context) = self.context.take() else {
            return Ok(());
        };

        let result = self.run_steps(&mut context);
        self.context = Some(context);
        result
    }

    fn run_steps(&self, context: &mut TransactionContext) -> Result<()> {
        let steps = context.steps.clone();
        let mut completed = Vec::with_capacity(steps.len());

        for step in steps {
            if self.is_cancelled() {
                let reason = "cancelled".to_string();
                self.progress.step_failed(step, &context.atom, &reason);
                return Err(Error::StepFailure {
                    step,
                    completed,
                    reason,
                });
            }

            self.progress.step_started(step, &context.atom);
            match self.run_step(step, context) {
                Ok(()) => {
                    self.progress.step_finished(step, &context.atom);
                    completed.push(step);
                }
                Err(e) if step.is_best_effort() => {
                    warn!("Step {} of {} failed, continuing: {}", step, context.atom, e);
                    completed.push(step);
                }
                Err(e) => {
                    let reason = e.to_string();
                    self.progress.step_failed(step, &context.atom, &reason);
                    return Err(Error::StepFailure {
                        step,
                        completed,
                        reason,
                    });
                }
            }
        }

        info!("{} of {} finished", context.action.as_str(), context.atom);
        Ok(())
    }

    fn run_step(&self, step: Step, context: &mut TransactionContext) -> Result<()> {
        match step {
            Step::Fetch => self.step_fetch(context),
            Step::Checksum => self.step_checksum(context),
            Step::RemoveConflicts => self.step_remove_conflicts(context),
            Step::Unpack => self.step_unpack(context),
            Step::PreInstall => self.step_preinstall(context),
            Step::PreRemove => self.step_preremove(context),
            Step::Install => self.step_install(context),
            Step::Remove => self.step_remove(context),
            Step::PostRemove => self.step_postremove(context),
            Step::PostInstall => self.step_postinstall(context),
            Step::ShowMessages => self.step_show_messages(context),
            Step::Cleanup => self.step_cleanup(context),
        }
    }

    /// Drop the prepared context and its scratch files
    pub fn kill(&mut self) {
        if let Some(context) = self.context.take()
            && let Some(unpack_dir) = &context.unpack_dir
            && unpack_dir.exists()
            && let Err(e) = std::fs::remove_dir_all(unpack_dir)
        {
            warn!("Could not remove {}: {}", unpack_dir.display(), e);
        }
    }
}
