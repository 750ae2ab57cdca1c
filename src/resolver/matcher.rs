// src/resolver/matcher.rs

//! Atom matching across repositories
//!
//! Each repository is asked for its best candidate (or all candidates in
//! multi-match mode). When several repositories produce one, a fixed
//! cascade picks the winner:
//!
//! 1. package-file repositories
//! 2. highest version
//! 3. the tag sorting last
//! 4. highest revision
//! 5. repository priority order
//!
//! Each step only looks at the survivors of the previous one.

use crate::atom::{Atom, Operator};
use crate::cache::CacheNamespace;
use crate::db::models::Package;
use crate::db::PackageDatabase;
use crate::error::{Error, Result};
use crate::repository::RepositoryKind;
use crate::resolver::{INSTALLED_REPOSITORY, Match, Resolver};
use crate::version::{VersionTriple, compare_versions, split_portage_revision};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use tracing::{debug, warn};

/// Knobs of [`Resolver::atom_match`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MatchOptions {
    pub case_sensitive: bool,
    /// Overrides the atom's own `:slot`
    pub slot: Option<String>,
    pub branch: Option<String>,
    /// Restrict to these repositories (priority order is kept)
    pub repositories: Option<Vec<String>>,
    pub allow_masked: bool,
    /// Return every surviving candidate instead of the best one
    pub multi_match: bool,
    /// With `multi_match`, gather candidates from every repository
    pub multi_repo: bool,
    /// Required entropy revision, unless the atom carries `~N`
    pub revision: Option<i64>,
}

impl Default for MatchOptions {
    fn default() -> Self {
        Self {
            case_sensitive: true,
            slot: None,
            branch: None,
            repositories: None,
            allow_masked: false,
            multi_match: false,
            multi_repo: false,
            revision: None,
        }
    }
}

/// Outcome of a match
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum MatchResult {
    Found(Match),
    /// Multi-match results, in repository priority order
    Multiple(Vec<Match>),
    NotFound,
}

impl MatchResult {
    pub fn is_found(&self) -> bool {
        match self {
            MatchResult::Found(_) => true,
            MatchResult::Multiple(matches) => !matches.is_empty(),
            MatchResult::NotFound => false,
        }
    }

    /// The single match, or the first of a multi-match
    pub fn first(&self) -> Option<&Match> {
        match self {
            MatchResult::Found(m) => Some(m),
            MatchResult::Multiple(matches) => matches.first(),
            MatchResult::NotFound => None,
        }
    }

    pub fn into_matches(self) -> Vec<Match> {
        match self {
            MatchResult::Found(m) => vec![m],
            MatchResult::Multiple(matches) => matches,
            MatchResult::NotFound => Vec::new(),
        }
    }

    /// Turn a miss into `Error::NotFound`
    pub fn require(self, atom: &str) -> Result<Match> {
        self.into_matches()
            .into_iter()
            .next()
            .ok_or_else(|| Error::NotFound(atom.to_string()))
    }
}

/// A repository's best candidate, as seen by the cascade
struct Contender {
    repository: String,
    kind: RepositoryKind,
    package: Package,
}

fn version_matches(atom: &Atom, version: &str, pkg: &Package) -> bool {
    match atom.effective_operator() {
        None => true,
        Some(Operator::Equal) => {
            if atom.wildcard {
                pkg.version.starts_with(version)
            } else {
                let want = version.strip_suffix("-r0").unwrap_or(version);
                let have = pkg.version.strip_suffix("-r0").unwrap_or(&pkg.version);
                compare_versions(want, have) == Ordering::Equal
            }
        }
        Some(Operator::Tilde) => {
            let (want_base, want_rev) = split_portage_revision(version);
            let (have_base, have_rev) = split_portage_revision(&pkg.version);
            want_base == have_base && have_rev >= want_rev
        }
        Some(op) => {
            let wanted = VersionTriple::new(
                version,
                atom.tag.clone().unwrap_or_else(|| pkg.tag.clone()),
                atom.revision.unwrap_or(pkg.revision),
            );
            let ord = pkg.triple().cmp(&wanted);
            match op {
                Operator::Greater => ord == Ordering::Greater,
                Operator::GreaterOrEqual => ord != Ordering::Less,
                Operator::Less => ord == Ordering::Less,
                Operator::LessOrEqual => ord != Ordering::Greater,
                Operator::Equal | Operator::Tilde => unreachable!(),
            }
        }
    }
}

/// Candidates of one database that satisfy `atom`
///
/// Returns every survivor when `options.multi_match` is set, otherwise the
/// newest one.
pub(crate) fn match_in_database(
    db: &dyn PackageDatabase,
    atom: &Atom,
    options: &MatchOptions,
) -> Result<Vec<Package>> {
    let slot = options.slot.as_deref().or(atom.slot.as_deref());
    let ids = db.resolve_candidates(
        &atom.key(),
        slot,
        options.branch.as_deref(),
        options.case_sensitive,
    )?;

    let revision = atom.revision.or(options.revision);
    let mut survivors = Vec::new();
    for id in ids {
        let pkg = db.get_package(id)?;
        if pkg.masked && !options.allow_masked {
            continue;
        }
        if let Some(tag) = &atom.tag
            && pkg.tag != *tag
        {
            continue;
        }
        if let Some(revision) = revision
            && pkg.revision != revision
        {
            continue;
        }
        if let Some(version) = &atom.version
            && !version_matches(atom, version, &pkg)
        {
            continue;
        }
        survivors.push(pkg);
    }

    if options.multi_match || survivors.len() <= 1 {
        return Ok(survivors);
    }

    let best = survivors
        .iter()
        .enumerate()
        .max_by(|(ia, a), (ib, b)| a.triple().cmp(&b.triple()).then(ib.cmp(ia)))
        .map(|(i, _)| i)
        .unwrap_or(0);
    Ok(vec![survivors.swap_remove(best)])
}

/// Apply the tie-break cascade, returning the index of the winner
fn pick_contender(contenders: &[Contender]) -> usize {
    let mut alive: Vec<usize> = (0..contenders.len()).collect();

    if alive
        .iter()
        .any(|&i| contenders[i].kind == RepositoryKind::PackageFile)
    {
        alive.retain(|&i| contenders[i].kind == RepositoryKind::PackageFile);
    }

    if alive.len() > 1 {
        let best = alive
            .iter()
            .map(|&i| contenders[i].package.version.as_str())
            .max_by(|a, b| compare_versions(a, b))
            .map(str::to_string)
            .unwrap_or_default();
        alive.retain(|&i| compare_versions(&contenders[i].package.version, &best) == Ordering::Equal);
    }

    if alive.len() > 1 {
        let best = alive
            .iter()
            .map(|&i| contenders[i].package.tag.clone())
            .max()
            .unwrap_or_default();
        alive.retain(|&i| contenders[i].package.tag == best);
    }

    if alive.len() > 1 {
        let best = alive
            .iter()
            .map(|&i| contenders[i].package.revision)
            .max()
            .unwrap_or_default();
        alive.retain(|&i| contenders[i].package.revision == best);
    }

    // Contenders are in priority order
    alive.first().copied().unwrap_or(0)
}

impl Resolver<'_> {
    /// Repositories allowed for this query, in priority order
    fn valid_repositories(&self, atom: &Atom, options: &MatchOptions) -> Vec<String> {
        self.repositories()
            .names()
            .into_iter()
            .filter(|name| {
                options
                    .repositories
                    .as_ref()
                    .is_none_or(|allowed| allowed.contains(name))
            })
            .filter(|name| {
                atom.repositories
                    .as_ref()
                    .is_none_or(|allowed| allowed.contains(name))
            })
            .collect()
    }

    /// Resolve a specifier against the repository set
    ///
    /// # Arguments
    ///
    /// * `atom` - Package specifier
    /// * `options` - Matching knobs, see [`MatchOptions`]
    ///
    /// # Returns
    ///
    /// * `Result<MatchResult>` - `NotFound` is a regular outcome; `Err` is
    ///   only returned for malformed atoms and cache failures
    pub fn atom_match(&self, atom: &str, options: &MatchOptions) -> Result<MatchResult> {
        let parsed = Atom::parse(atom)?;
        let valid = self.valid_repositories(&parsed, options);
        let fingerprint = self.repository_fingerprint(&valid);
        let query = format!(
            "{}|{}|{}",
            atom,
            serde_json::to_string(options)?,
            self.set_identity()
        );

        self.cache
            .get_or_compute(CacheNamespace::AtomMatch, &query, &fingerprint, || {
                self.match_repositories(&parsed, options, &valid)
            })
    }

    fn match_repositories(
        &self,
        atom: &Atom,
        options: &MatchOptions,
        valid: &[String],
    ) -> Result<MatchResult> {
        let mut producers: Vec<(String, RepositoryKind, Vec<Package>)> = Vec::new();

        for name in valid {
            let Some(handle) = self.repositories().get(name) else {
                continue;
            };
            let db = match handle.database() {
                Ok(db) => db,
                Err(_) => {
                    self.mark_unavailable(name);
                    continue;
                }
            };
            match match_in_database(db, atom, options) {
                Ok(found) if !found.is_empty() => {
                    producers.push((name.clone(), handle.kind, found));
                }
                Ok(_) => {}
                Err(e) => {
                    warn!("Query of repository {} failed: {}", name, e);
                    self.mark_unavailable(name);
                }
            }
        }

        if producers.is_empty() {
            debug!("No match for {}", atom);
            return Ok(MatchResult::NotFound);
        }

        if options.multi_match && options.multi_repo {
            let matches = producers
                .into_iter()
                .flat_map(|(repo, _, pkgs)| {
                    pkgs.into_iter()
                        .filter_map(move |p| p.id.map(|id| Match::new(id, repo.clone())))
                })
                .collect();
            return Ok(MatchResult::Multiple(matches));
        }

        // The cascade compares each repository's best candidate
        let contenders: Vec<Contender> = producers
            .iter()
            .filter_map(|(repo, kind, pkgs)| {
                pkgs.iter()
                    .max_by(|a, b| a.triple().cmp(&b.triple()))
                    .map(|pkg| Contender {
                        repository: repo.clone(),
                        kind: *kind,
                        package: pkg.clone(),
                    })
            })
            .collect();
        let winner = pick_contender(&contenders);

        if options.multi_match {
            let (repo, _, pkgs) = &producers[winner];
            let matches = pkgs
                .iter()
                .filter_map(|p| p.id.map(|id| Match::new(id, repo.clone())))
                .collect();
            return Ok(MatchResult::Multiple(matches));
        }

        let contender = &contenders[winner];
        let id = contender
            .package
            .id
            .ok_or_else(|| Error::NotFound(atom.to_string()))?;
        debug!(
            "{} resolved to {} in {}",
            atom,
            contender.package.atom(),
            contender.repository
        );
        Ok(MatchResult::Found(Match::new(id, contender.repository.clone())))
    }

    /// Resolve a specifier against the installed database
    pub fn match_installed(&self, atom: &str, options: &MatchOptions) -> Result<MatchResult> {
        let parsed = Atom::parse(atom)?;
        let fingerprint = self.installed_fingerprint()?;
        let query = format!(
            "{}|{}|{}",
            INSTALLED_REPOSITORY,
            atom,
            serde_json::to_string(options)?
        );

        self.cache
            .get_or_compute(CacheNamespace::AtomMatch, &query, &fingerprint, || {
                let found = match_in_database(self.installed(), &parsed, options)?;
                let mut matches: Vec<Match> = found
                    .into_iter()
                    .filter_map(|p| p.id.map(Match::installed))
                    .collect();
                Ok(match (options.multi_match, matches.len()) {
                    (_, 0) => MatchResult::NotFound,
                    (true, _) => MatchResult::Multiple(matches),
                    (false, _) => MatchResult::Found(matches.remove(0)),
                })
            })
    }
}
