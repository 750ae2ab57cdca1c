// src/resolver/removal.rs

//! Removal trees
//!
//! The removal tree walks dependents instead of dependencies. Every edge
//! says which of two packages has to go first: a dependent before what it
//! depends on, and in deep mode a package before the orphaned dependencies
//! it pulls in. Levels are the longest path over those edges, so removing
//! deepest level first never leaves a package whose dependencies are gone.
//!
//! Protected system packages are never part of a removal tree.

use crate::cache::CacheNamespace;
use crate::error::Result;
use crate::resolver::{MatchOptions, MatchResult, Resolver};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use tracing::debug;

/// Installed package ids by depth
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemovalTree {
    pub levels: BTreeMap<u32, Vec<i64>>,
}

impl RemovalTree {
    /// Ids in removal order: deepest level first
    pub fn queue(&self) -> Vec<i64> {
        self.levels
            .values()
            .rev()
            .flat_map(|level| level.iter().copied())
            .collect()
    }

    pub fn contains(&self, id: i64) -> bool {
        self.levels.values().any(|level| level.contains(&id))
    }

    pub fn len(&self) -> usize {
        self.levels.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Level packages so that every `(kept, first)` edge puts `first` deeper
    ///
    /// Cycles are broken at the shallowest reached package, lowest id first.
    fn from_edges(nodes: &BTreeSet<i64>, edges: &BTreeSet<(i64, i64)>) -> Self {
        let mut pending: BTreeMap<i64, usize> = nodes.iter().map(|&id| (id, 0)).collect();
        let mut children: BTreeMap<i64, Vec<i64>> = BTreeMap::new();
        for &(kept, first) in edges {
            if kept == first || !nodes.contains(&kept) || !nodes.contains(&first) {
                continue;
            }
            *pending.entry(first).or_default() += 1;
            children.entry(kept).or_default().push(first);
        }

        let mut depth: BTreeMap<i64, u32> = BTreeMap::new();
        let mut done: BTreeSet<i64> = BTreeSet::new();
        let mut ready: VecDeque<i64> = pending
            .iter()
            .filter(|&(_, &count)| count == 0)
            .map(|(&id, _)| id)
            .collect();

        while done.len() < nodes.len() {
            let next = ready.pop_front().or_else(|| {
                nodes
                    .iter()
                    .filter(|id| !done.contains(*id))
                    .min_by_key(|&&id| (!depth.contains_key(&id), depth.get(&id).copied(), id))
                    .copied()
            });
            let Some(id) = next else {
                break;
            };
            if !done.insert(id) {
                continue;
            }

            let level = *depth.entry(id).or_insert(0);
            for &child in children.get(&id).into_iter().flatten() {
                if done.contains(&child) {
                    continue;
                }
                let child_level = depth.entry(child).or_insert(0);
                *child_level = (*child_level).max(level + 1);
                if let Some(count) = pending.get_mut(&child) {
                    *count = count.saturating_sub(1);
                    if *count == 0 {
                        ready.push_back(child);
                    }
                }
            }
        }

        let mut tree = RemovalTree::default();
        for (id, level) in depth {
            tree.levels.entry(level).or_default().push(id);
        }
        tree
    }
}

impl Resolver<'_> {
    /// Build the removal tree of installed packages
    ///
    /// Protected system packages are left out, and so is anything reached
    /// only through them. In deep mode every package also pulls its own
    /// dependencies that no package outside the tree needs.
    pub fn removal_tree(&self, ids: &[i64], deep: bool) -> Result<RemovalTree> {
        let roots: BTreeSet<i64> = ids.iter().copied().collect();
        let query = format!(
            "{}|{}",
            deep,
            roots
                .iter()
                .map(i64::to_string)
                .collect::<Vec<_>>()
                .join(",")
        );
        let fingerprint = self.installed_fingerprint()?;

        self.cache
            .get_or_compute(CacheNamespace::RemovalTree, &query, &fingerprint, || {
                self.walk_removal(&roots, deep)
            })
    }

    fn walk_removal(&self, roots: &BTreeSet<i64>, deep: bool) -> Result<RemovalTree> {
        let installed = self.installed();
        let mut nodes: BTreeSet<i64> = BTreeSet::new();
        let mut edges: BTreeSet<(i64, i64)> = BTreeSet::new();
        let mut stack: Vec<i64> = roots.iter().rev().copied().collect();

        while let Some(id) = stack.pop() {
            if nodes.contains(&id) {
                continue;
            }
            if installed.is_protected_system_package(id)? {
                debug!("System package {} cannot be removed", id);
                continue;
            }
            nodes.insert(id);

            for dependent in installed.reverse_dependencies(id)? {
                edges.insert((id, dependent));
                stack.push(dependent);
            }
            if deep {
                for orphan in self.orphaned_dependencies(id, &nodes)? {
                    edges.insert((orphan, id));
                    stack.push(orphan);
                }
            }
        }

        let tree = RemovalTree::from_edges(&nodes, &edges);
        debug!("Removal tree holds {} package(s)", tree.len());
        Ok(tree)
    }

    /// Installed dependencies of `id` that only packages in the tree need
    fn orphaned_dependencies(&self, id: i64, in_tree: &BTreeSet<i64>) -> Result<Vec<i64>> {
        let installed = self.installed();
        let mut orphans = Vec::new();

        for spec in installed.get_dependencies(id)? {
            let dep = match self.match_installed(&spec, &MatchOptions::default()) {
                Ok(MatchResult::Found(m)) => m.package_id,
                _ => continue,
            };
            if dep == id || installed.is_protected_system_package(dep)? {
                continue;
            }
            let needed_elsewhere = installed
                .reverse_dependencies(dep)?
                .into_iter()
                .any(|r| r != id && !in_tree.contains(&r));
            if !needed_elsewhere {
                orphans.push(dep);
            }
        }
        Ok(orphans)
    }

    /// Installed ids in removal order
    pub fn removal_queue(&self, ids: &[i64], deep: bool) -> Result<Vec<i64>> {
        Ok(self.removal_tree(ids, deep)?.queue())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::ResultCache;
    use crate::db::models::PackageRecord;
    use crate::resolver::test_support::{installed, record, repo_set};

    fn with_deps(cpv: &str, deps: &[&str]) -> PackageRecord {
        let mut r = record(cpv);
        r.dependencies = deps.iter().map(|d| d.to_string()).collect();
        r
    }

    fn id_of(resolver: &Resolver<'_>, atom: &str) -> i64 {
        resolver
            .match_installed(atom, &MatchOptions::default())
            .unwrap()
            .require(atom)
            .unwrap()
            .package_id
    }

    #[test]
    fn test_dependents_removed_first() {
        let repos = repo_set(vec![]);
        let inst = installed(&[
            record("lib/a-1.0"),
            with_deps("lib/b-1.0", &["lib/a"]),
            with_deps("app/c-1.0", &["lib/a", "lib/b"]),
        ]);
        let cache = ResultCache::new();
        let resolver = Resolver::new(&repos, &inst, &cache);

        let a = id_of(&resolver, "lib/a");
        let b = id_of(&resolver, "lib/b");
        let c = id_of(&resolver, "app/c");

        let tree = resolver.removal_tree(&[a], false).unwrap();
        assert_eq!(tree.len(), 3);
        // c is reachable at depth 1 and 2, and kept at the deepest
        assert_eq!(tree.levels.get(&2), Some(&vec![c]));
        assert_eq!(resolver.removal_queue(&[a], false).unwrap(), vec![c, b, a]);
    }

    #[test]
    fn test_dependent_stays_above_its_dependency() {
        let repos = repo_set(vec![]);
        let inst = installed(&[
            record("lib/a-1.0"),
            with_deps("app/c-1.0", &["lib/a", "lib/b"]),
            with_deps("lib/b-1.0", &["lib/a"]),
            with_deps("app/d-1.0", &["app/c"]),
        ]);
        let cache = ResultCache::new();
        let resolver = Resolver::new(&repos, &inst, &cache);

        let a = id_of(&resolver, "lib/a");
        let b = id_of(&resolver, "lib/b");
        let c = id_of(&resolver, "app/c");
        let d = id_of(&resolver, "app/d");

        // c is first reached next to b, then pushed below it; d follows c
        assert_eq!(resolver.removal_queue(&[a], false).unwrap(), vec![d, c, b, a]);
    }

    #[test]
    fn test_system_packages_are_never_removed() {
        let repos = repo_set(vec![]);
        let mut glibc = record("sys-libs/glibc-2.9");
        glibc.system_package = true;
        let inst = installed(&[glibc, with_deps("app/c-1.0", &["sys-libs/glibc"])]);
        let cache = ResultCache::new();
        let resolver = Resolver::new(&repos, &inst, &cache);

        let glibc = id_of(&resolver, "sys-libs/glibc");
        let tree = resolver.removal_tree(&[glibc], false).unwrap();
        assert!(tree.is_empty());
    }

    #[test]
    fn test_system_dependents_are_left_out() {
        let repos = repo_set(vec![]);
        let mut base = with_deps("sys-apps/base-1.0", &["lib/a"]);
        base.system_package = true;
        let inst = installed(&[record("lib/a-1.0"), base]);
        let cache = ResultCache::new();
        let resolver = Resolver::new(&repos, &inst, &cache);

        let a = id_of(&resolver, "lib/a");
        assert_eq!(resolver.removal_queue(&[a], false).unwrap(), vec![a]);
    }

    #[test]
    fn test_deep_mode_pulls_orphans() {
        let repos = repo_set(vec![]);
        let inst = installed(&[
            with_deps("app/c-1.0", &["lib/only"]),
            record("lib/only-1.0"),
            with_deps("lib/shared-1.0", &[]),
            with_deps("app/d-1.0", &["lib/shared"]),
        ]);
        let cache = ResultCache::new();
        let resolver = Resolver::new(&repos, &inst, &cache);

        let c = id_of(&resolver, "app/c");
        let only = id_of(&resolver, "lib/only");

        let shallow = resolver.removal_tree(&[c], false).unwrap();
        assert_eq!(shallow.queue(), vec![c]);

        let deep = resolver.removal_tree(&[c], true).unwrap();
        assert_eq!(deep.queue(), vec![c, only]);
        assert!(!deep.contains(id_of(&resolver, "lib/shared")));
    }

    #[test]
    fn test_deep_mode_orphans_of_package_with_dependents() {
        let repos = repo_set(vec![]);
        let inst = installed(&[
            with_deps("lib/core-1.0", &["lib/orphan"]),
            record("lib/orphan-1.0"),
            with_deps("app/e-1.0", &["lib/core"]),
        ]);
        let cache = ResultCache::new();
        let resolver = Resolver::new(&repos, &inst, &cache);

        let core = id_of(&resolver, "lib/core");
        let orphan = id_of(&resolver, "lib/orphan");
        let e = id_of(&resolver, "app/e");

        assert_eq!(resolver.removal_queue(&[core], false).unwrap(), vec![e, core]);
        assert_eq!(resolver.removal_queue(&[core], true).unwrap(), vec![e, core, orphan]);
    }

    #[test]
    fn test_cycles_terminate() {
        let repos = repo_set(vec![]);
        let inst = installed(&[
            with_deps("app/x-1.0", &["app/y"]),
            with_deps("app/y-1.0", &["app/x"]),
        ]);
        let cache = ResultCache::new();
        let resolver = Resolver::new(&repos, &inst, &cache);

        let x = id_of(&resolver, "app/x");
        let tree = resolver.removal_tree(&[x], false).unwrap();
        assert_eq!(tree.len(), 2);
    }
}
