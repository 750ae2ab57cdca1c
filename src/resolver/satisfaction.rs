// src/resolver/satisfaction.rs

//! Dependency satisfaction
//!
//! Decides whether the installed system already satisfies a specifier. In
//! deep mode an installed package only counts when it is identical to what
//! the repositories would install: same version triple and, unless the
//! installed revision is the wildcard, the same linked libraries.

use crate::atom::Atom;
use crate::cache::CacheNamespace;
use crate::error::Result;
use crate::resolver::{Match, MatchOptions, MatchResult, Resolver};
use crate::version::WILDCARD_REVISION;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

/// How a repository candidate relates to what is installed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Comparison {
    NotInstalled,
    Equal,
    /// Candidate is newer (`1`) or older (`-1`) than the installed package
    Version(i32),
    /// Same version, different linked libraries
    Abi,
}

impl Comparison {
    /// Whether installing the candidate replaces something different
    pub fn is_change(&self) -> bool {
        matches!(self, Comparison::Version(_) | Comparison::Abi)
    }
}

/// Outcome of [`Resolver::filter_satisfied`]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SatisfactionReport {
    pub unsatisfied: BTreeSet<String>,
    pub satisfied: BTreeSet<String>,
    /// Comparison of each specifier found both in a repository and installed
    pub comparisons: BTreeMap<String, Comparison>,
}

impl Resolver<'_> {
    /// Compare a repository match with an installed package
    pub fn compare_with(&self, candidate: &Match, installed_id: i64) -> Result<Comparison> {
        let repo_db = self.database(candidate)?;
        let repo_triple = repo_db.get_version_triple(candidate.package_id)?;
        let installed_triple = self.installed().get_version_triple(installed_id)?;

        let ord = repo_triple.compare_installed(&installed_triple);
        if ord != Ordering::Equal {
            return Ok(Comparison::Version(ord as i32));
        }
        if installed_triple.revision == WILDCARD_REVISION {
            return Ok(Comparison::Equal);
        }

        let repo_needed = repo_db.get_linked_libraries(candidate.package_id)?;
        let installed_needed = self.installed().get_linked_libraries(installed_id)?;
        if repo_needed != installed_needed {
            return Ok(Comparison::Abi);
        }
        Ok(Comparison::Equal)
    }

    /// Compare a match with the installed package of the same key and slot
    pub fn compare_with_installed(&self, candidate: &Match) -> Result<Comparison> {
        let pkg = self.package(candidate)?;
        let installed =
            self.installed()
                .resolve_candidates(&pkg.key(), Some(&pkg.slot), None, true)?;
        match installed.last() {
            Some(&id) => self.compare_with(candidate, id),
            None => Ok(Comparison::NotInstalled),
        }
    }

    /// Whether one specifier is satisfied by the installed system
    pub fn is_satisfied(&self, spec: &str, deep: bool) -> Result<bool> {
        let report = self.filter_satisfied(&[spec.to_string()], deep)?;
        Ok(report.satisfied.contains(spec))
    }

    /// Split specifiers into satisfied and unsatisfied ones
    ///
    /// # Arguments
    ///
    /// * `specs` - Specifiers; conflicts carry a leading `!`
    /// * `deep` - Also require version and ABI identity with the repositories
    pub fn filter_satisfied(&self, specs: &[String], deep: bool) -> Result<SatisfactionReport> {
        let batch: BTreeSet<&str> = specs.iter().map(String::as_str).collect();
        if batch.is_empty() {
            return Ok(SatisfactionReport::default());
        }

        let query = format!(
            "{}|{}|{}",
            deep,
            batch.iter().copied().collect::<Vec<_>>().join("\n"),
            self.set_identity()
        );
        let fingerprint = self.full_fingerprint()?;

        self.cache
            .get_or_compute(CacheNamespace::Satisfaction, &query, &fingerprint, || {
                let mut report = SatisfactionReport::default();
                for spec in &batch {
                    self.classify(spec, deep, &mut report)?;
                }
                debug!(
                    "{} satisfied, {} unsatisfied (deep: {})",
                    report.satisfied.len(),
                    report.unsatisfied.len(),
                    deep
                );
                Ok(report)
            })
    }

    fn classify(&self, spec: &str, deep: bool, report: &mut SatisfactionReport) -> Result<()> {
        let atom = match Atom::parse(spec) {
            Ok(atom) => atom,
            Err(e) => {
                debug!("Treating malformed specifier as unsatisfied: {}", e);
                report.unsatisfied.insert(spec.to_string());
                return Ok(());
            }
        };
        let options = MatchOptions::default();

        if atom.conflict {
            let target = atom.without_conflict();
            let installed = self.match_installed(target.as_str(), &options)?;
            if installed.is_found() {
                report.unsatisfied.insert(spec.to_string());
            } else {
                report.satisfied.insert(spec.to_string());
            }
            return Ok(());
        }

        let candidate = match self.atom_match(spec, &options)? {
            MatchResult::Found(m) => m,
            _ => {
                report.unsatisfied.insert(spec.to_string());
                return Ok(());
            }
        };

        let installed_id = match self.match_installed(spec, &options)? {
            MatchResult::Found(m) => m.package_id,
            _ => {
                report.unsatisfied.insert(spec.to_string());
                report
                    .comparisons
                    .insert(spec.to_string(), Comparison::NotInstalled);
                return Ok(());
            }
        };

        if !deep {
            report.satisfied.insert(spec.to_string());
            return Ok(());
        }

        let comparison = self.compare_with(&candidate, installed_id)?;
        report.comparisons.insert(spec.to_string(), comparison);
        if comparison == Comparison::Equal {
            report.satisfied.insert(spec.to_string());
        } else {
            report.unsatisfied.insert(spec.to_string());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::ResultCache;
    use crate::db::models::PackageRecord;
    use crate::resolver::test_support::{installed, record, repo, repo_set};

    fn with_revision(cpv: &str, revision: i64) -> PackageRecord {
        let mut r = record(cpv);
        r.revision = revision;
        r
    }

    #[test]
    fn test_shallow_and_deep() {
        let repos = repo_set(vec![repo("main", &[record("foo/bar-2.0")])]);
        let inst = installed(&[record("foo/bar-1.0")]);
        let cache = ResultCache::new();
        let resolver = Resolver::new(&repos, &inst, &cache);

        assert!(resolver.is_satisfied("foo/bar", false).unwrap());
        assert!(!resolver.is_satisfied("foo/bar", true).unwrap());

        let report = resolver
            .filter_satisfied(&["foo/bar".to_string()], true)
            .unwrap();
        assert_eq!(report.comparisons.get("foo/bar"), Some(&Comparison::Version(1)));
    }

    #[test]
    fn test_not_installed_and_unknown() {
        let repos = repo_set(vec![repo("main", &[record("foo/bar-1.0")])]);
        let inst = installed(&[]);
        let cache = ResultCache::new();
        let resolver = Resolver::new(&repos, &inst, &cache);

        let report = resolver
            .filter_satisfied(&["foo/bar".to_string(), "missing/pkg".to_string()], false)
            .unwrap();
        assert!(report.unsatisfied.contains("foo/bar"));
        assert!(report.unsatisfied.contains("missing/pkg"));
        assert_eq!(
            report.comparisons.get("foo/bar"),
            Some(&Comparison::NotInstalled)
        );
        assert!(!report.comparisons.contains_key("missing/pkg"));
    }

    #[test]
    fn test_conflicts() {
        let repos = repo_set(vec![]);
        let inst = installed(&[record("foo/bar-1.0")]);
        let cache = ResultCache::new();
        let resolver = Resolver::new(&repos, &inst, &cache);

        assert!(!resolver.is_satisfied("!foo/bar", false).unwrap());
        assert!(resolver.is_satisfied("!foo/baz", true).unwrap());
    }

    #[test]
    fn test_wildcard_revision_matches_any_repository_revision() {
        let repos = repo_set(vec![repo("main", &[with_revision("foo/bar-1.0", 7)])]);
        let mut inst_record = with_revision("foo/bar-1.0", WILDCARD_REVISION);
        inst_record.needed.insert("libold.so.1".to_string());
        let inst = installed(&[inst_record]);
        let cache = ResultCache::new();
        let resolver = Resolver::new(&repos, &inst, &cache);

        assert!(resolver.is_satisfied("foo/bar", true).unwrap());
        assert!(resolver.is_satisfied("foo/bar", false).unwrap());
    }

    #[test]
    fn test_abi_change_is_unsatisfied() {
        let mut repo_record = record("foo/bar-1.0");
        repo_record.needed.insert("libnew.so.2".to_string());
        let mut inst_record = record("foo/bar-1.0");
        inst_record.needed.insert("libnew.so.1".to_string());
        let repos = repo_set(vec![repo("main", &[repo_record])]);
        let inst = installed(&[inst_record]);
        let cache = ResultCache::new();
        let resolver = Resolver::new(&repos, &inst, &cache);

        let report = resolver
            .filter_satisfied(&["foo/bar".to_string()], true)
            .unwrap();
        assert!(report.unsatisfied.contains("foo/bar"));
        assert_eq!(report.comparisons.get("foo/bar"), Some(&Comparison::Abi));

        let candidate = resolver
            .atom_match("foo/bar", &MatchOptions::default())
            .unwrap()
            .require("foo/bar")
            .unwrap();
        assert_eq!(
            resolver.compare_with_installed(&candidate).unwrap(),
            Comparison::Abi
        );
    }
}
