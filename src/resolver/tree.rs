// src/resolver/tree.rs

//! Dependency trees and install queues
//!
//! A tree is built with an explicit LIFO work stack seeded with the root
//! match at depth 1. Every popped specifier is processed at most once, so
//! cyclic dependency graphs terminate. Dependencies land one level below
//! their dependent; installing deepest level first yields a valid order.
//!
//! Missing dependencies do not stop the walk: the whole graph is explored
//! so every unresolvable specifier can be reported at once.

use crate::cache::CacheNamespace;
use crate::db::models::Package;
use crate::error::{Error, Result};
use crate::resolver::{Comparison, Match, MatchOptions, MatchResult, Resolver};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use tracing::{debug, info};

/// Whether a tree (or queue) is usable
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TreeStatus {
    Ok,
    /// Specifiers that resolve to nothing, sorted
    Unresolved(Vec<String>),
}

impl TreeStatus {
    pub fn is_ok(&self) -> bool {
        matches!(self, TreeStatus::Ok)
    }

    fn from_missing(missing: BTreeSet<String>) -> Self {
        if missing.is_empty() {
            TreeStatus::Ok
        } else {
            TreeStatus::Unresolved(missing.into_iter().collect())
        }
    }
}

/// A leveled dependency tree
///
/// Level 1 holds the root; conflicting installed packages are kept apart
/// in `conflicts`. An unresolved tree carries no levels.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependencyTree {
    pub levels: BTreeMap<u32, Vec<Match>>,
    pub conflicts: BTreeSet<i64>,
    pub status: TreeStatus,
}

impl DependencyTree {
    /// Matches in install order: deepest level first
    pub fn install_order(&self) -> Vec<Match> {
        self.levels
            .values()
            .rev()
            .flat_map(|level| level.iter().cloned())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.levels.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Matches already placed by an earlier root of the same resolution
///
/// Owned by the call that creates it; never reused across calls.
#[derive(Debug, Default)]
pub struct VisitedSet {
    matches: HashSet<Match>,
}

impl VisitedSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, m: &Match) -> bool {
        self.matches.contains(m)
    }

    /// Returns `false` when the match was already present
    pub fn insert(&mut self, m: Match) -> bool {
        self.matches.insert(m)
    }

    pub fn len(&self) -> usize {
        self.matches.len()
    }

    pub fn is_empty(&self) -> bool {
        self.matches.is_empty()
    }
}

/// Merged result of several trees
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequiredPackages {
    /// Install order across all roots
    pub stages: Vec<Match>,
    pub conflicts: BTreeSet<i64>,
    pub status: TreeStatus,
}

/// What to install and what to remove first
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallQueue {
    pub install: Vec<Match>,
    /// Installed package ids to remove because they conflict
    pub remove: Vec<i64>,
    pub status: TreeStatus,
}

impl InstallQueue {
    /// Turn an unresolved queue into `Error::Unresolved`
    pub fn into_result(self) -> Result<Self> {
        match &self.status {
            TreeStatus::Ok => Ok(self),
            TreeStatus::Unresolved(missing) => Err(Error::Unresolved(missing.clone())),
        }
    }
}

impl Resolver<'_> {
    /// Build the dependency tree of one match
    ///
    /// # Arguments
    ///
    /// * `root` - The resolved root package
    /// * `empty_deps` - Pull every dependency, satisfied or not
    /// * `deep_deps` - Use deep satisfaction (version and ABI identity)
    /// * `visited` - Matches placed by earlier roots; disables caching
    pub fn build_tree(
        &self,
        root: &Match,
        empty_deps: bool,
        deep_deps: bool,
        visited: Option<&mut VisitedSet>,
    ) -> Result<DependencyTree> {
        if let Some(visited) = visited {
            return self.walk_tree(root, empty_deps, deep_deps, visited);
        }

        let query = format!(
            "{}|{}|{}|{}",
            root,
            empty_deps,
            deep_deps,
            self.set_identity()
        );
        let fingerprint = self.full_fingerprint()?;
        self.cache
            .get_or_compute(CacheNamespace::DependencyTree, &query, &fingerprint, || {
                self.walk_tree(root, empty_deps, deep_deps, &mut VisitedSet::new())
            })
    }

    fn walk_tree(
        &self,
        root: &Match,
        empty_deps: bool,
        deep_deps: bool,
        visited: &mut VisitedSet,
    ) -> Result<DependencyTree> {
        let root_pkg = self.package(root)?;
        let root_atom = root_pkg.atom();
        debug!("Building dependency tree for {}", root_atom);

        let options = MatchOptions::default();
        let mut stack: Vec<(u32, String)> = vec![(1, root_atom.clone())];
        let mut processed: HashSet<String> = HashSet::new();
        let mut seen_atoms: HashSet<String> = HashSet::new();
        let mut seen_slots: HashSet<(String, String)> = HashSet::new();
        let mut comparisons: HashMap<String, Comparison> = HashMap::new();
        let mut levels: BTreeMap<u32, Vec<Match>> = BTreeMap::new();
        let mut conflicts = BTreeSet::new();
        let mut missing = BTreeSet::new();
        let mut first = true;

        while let Some((depth, spec)) = stack.pop() {
            if !processed.insert(spec.clone()) {
                continue;
            }

            if let Some(target) = spec.strip_prefix('!') {
                if let MatchResult::Found(m) = self.match_installed(target, &options)? {
                    conflicts.insert(m.package_id);
                }
                continue;
            }

            let (m, pkg) = if first {
                first = false;
                (root.clone(), root_pkg.clone())
            } else {
                match self.atom_match(&spec, &options) {
                    Ok(MatchResult::Found(m)) => {
                        let pkg = self.package(&m)?;
                        (m, pkg)
                    }
                    Ok(_) | Err(Error::InvalidAtom { .. }) => {
                        debug!("Unresolved dependency {}", spec);
                        missing.insert(spec);
                        continue;
                    }
                    Err(e) => return Err(e),
                }
            };

            let atom = pkg.atom();
            let slot_key = (pkg.slot.clone(), pkg.key());
            if seen_atoms.contains(&atom) || seen_slots.contains(&slot_key) {
                continue;
            }
            seen_atoms.insert(atom);
            seen_slots.insert(slot_key);

            if !visited.insert(m.clone()) {
                continue;
            }
            levels.entry(depth).or_default().push(m.clone());

            let db = self.database(&m)?;
            let mut deps = db.get_dependencies(m.package_id)?;
            deps.extend(
                db.get_conflicts(m.package_id)?
                    .into_iter()
                    .map(|c| format!("!{}", c)),
            );

            if !empty_deps && !deps.is_empty() {
                let report = self.filter_satisfied(&deps, deep_deps)?;
                deps.retain(|d| report.unsatisfied.contains(d));
                comparisons.extend(report.comparisons);
            }

            for dep in deps {
                if !processed.contains(&dep) {
                    stack.push((depth + 1, dep));
                }
            }

            let comparison = match comparisons.get(&spec) {
                Some(c) => *c,
                None => self.compare_with_installed(&m)?,
            };
            if comparison.is_change() {
                for dependent in self.broken_dependents(&m, &pkg)? {
                    if !processed.contains(&dependent) {
                        debug!("{} pulls {} to keep linkage intact", pkg.atom(), dependent);
                        stack.push((depth + 1, dependent));
                    }
                }
            }
        }

        if !missing.is_empty() {
            info!(
                "Dependency tree of {} has {} unresolved specifier(s)",
                root_atom,
                missing.len()
            );
            return Ok(DependencyTree {
                levels: BTreeMap::new(),
                conflicts: BTreeSet::new(),
                status: TreeStatus::from_missing(missing),
            });
        }

        Ok(DependencyTree {
            levels,
            conflicts,
            status: TreeStatus::Ok,
        })
    }

    /// `key:slot` of installed packages linking against libraries that the
    /// replacement of `candidate`'s installed counterpart no longer links
    ///
    /// Dependents no repository provides, or whose repository version is
    /// what is already installed, are left alone.
    fn broken_dependents(&self, candidate: &Match, pkg: &Package) -> Result<Vec<String>> {
        let installed = self.installed();
        let new_needed = self.database(candidate)?.get_linked_libraries(candidate.package_id)?;

        let mut dependents = BTreeSet::new();
        for installed_id in installed.resolve_candidates(&pkg.key(), Some(&pkg.slot), None, true)? {
            let old_needed = installed.get_linked_libraries(installed_id)?;
            for library in old_needed.difference(&new_needed) {
                for dependent in installed.search_needed(library)? {
                    if dependent != installed_id {
                        dependents.insert(dependent);
                    }
                }
            }
        }

        let mut specs = Vec::new();
        for dependent in dependents {
            let dep_pkg = installed.get_package(dependent)?;
            let spec = format!("{}:{}", dep_pkg.key(), dep_pkg.slot);
            let m = match self.atom_match(&spec, &MatchOptions::default()) {
                Ok(MatchResult::Found(m)) => m,
                Ok(_) | Err(Error::InvalidAtom { .. }) => {
                    debug!("{} has no repository candidate, keeping it", spec);
                    continue;
                }
                Err(e) => return Err(e),
            };
            if !self.compare_with(&m, dependent)?.is_change() {
                debug!("{} is already current, keeping it", spec);
                continue;
            }
            specs.push(spec);
        }
        specs.sort();
        specs.dedup();
        Ok(specs)
    }

    /// Merge the trees of several roots into one install order
    ///
    /// Dependencies shared between roots are placed once, by the first
    /// root that reaches them.
    pub fn required_packages(
        &self,
        matches: &[Match],
        empty_deps: bool,
        deep_deps: bool,
    ) -> Result<RequiredPackages> {
        let mut visited = VisitedSet::new();
        let mut stages = Vec::new();
        let mut conflicts = BTreeSet::new();
        let mut missing = BTreeSet::new();

        for m in matches {
            let tree = self.build_tree(m, empty_deps, deep_deps, Some(&mut visited))?;
            if let TreeStatus::Unresolved(list) = &tree.status {
                missing.extend(list.iter().cloned());
                continue;
            }
            stages.extend(tree.install_order());
            conflicts.extend(tree.conflicts.iter().copied());
        }

        Ok(RequiredPackages {
            stages,
            conflicts,
            status: TreeStatus::from_missing(missing),
        })
    }

    /// Install order plus the installed packages to remove beforehand
    ///
    /// Conflicting packages being replaced by a package of the same key
    /// and slot are left to the install step instead of the removal list.
    pub fn install_queue(
        &self,
        matches: &[Match],
        empty_deps: bool,
        deep_deps: bool,
    ) -> Result<InstallQueue> {
        let required = self.required_packages(matches, empty_deps, deep_deps)?;
        if !required.status.is_ok() {
            return Ok(InstallQueue {
                install: Vec::new(),
                remove: Vec::new(),
                status: required.status,
            });
        }

        let mut replaced = HashSet::new();
        for m in &required.stages {
            let pkg = self.package(m)?;
            replaced.insert((pkg.key(), pkg.slot));
        }

        let mut remove = Vec::new();
        for id in required.conflicts {
            let pkg = self.installed().get_package(id)?;
            if !replaced.contains(&(pkg.key(), pkg.slot.clone())) {
                remove.push(id);
            }
        }

        info!(
            "Install queue: {} to install, {} to remove",
            required.stages.len(),
            remove.len()
        );
        Ok(InstallQueue {
            install: required.stages,
            remove,
            status: TreeStatus::Ok,
        })
    }
}
