// src/version/mod.rs

//! Version handling for package atoms
//!
//! Versions follow the Portage grammar:
//! `[cvs.]N(.N)*[a-z](_(alpha|beta|pre|rc|p)N*)*[-rN]`.
//!
//! On top of plain versions, packages carry a tag and a repository
//! revision. [`VersionTriple`] combines the three into a strict total order
//! used by every tie-break in the resolver.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

/// Installed revision that satisfies any repository revision
///
/// Only the satisfaction filter gives this value meaning; ordering treats
/// it as a plain number.
pub const WILDCARD_REVISION: i64 = 9999;

/// Version suffixes in ascending order of precedence
const SUFFIXES: [(&str, i32); 5] = [
    ("alpha", -4),
    ("beta", -3),
    ("pre", -2),
    ("rc", -1),
    ("p", 0),
];

/// A version string broken into its grammar components
#[derive(Debug)]
struct ParsedVersion<'a> {
    major: &'a str,
    components: Vec<&'a str>,
    letter: Option<u8>,
    suffixes: Vec<(i32, &'a str)>,
    revision: &'a str,
}

fn take_digits(s: &str) -> (&str, &str) {
    let end = s.bytes().take_while(u8::is_ascii_digit).count();
    s.split_at(end)
}

fn parse(version: &str) -> Option<ParsedVersion<'_>> {
    let mut rest = version.strip_prefix("cvs.").unwrap_or(version);

    let (major, tail) = take_digits(rest);
    if major.is_empty() {
        return None;
    }
    rest = tail;

    let mut components = Vec::new();
    while let Some(after_dot) = rest.strip_prefix('.') {
        let (digits, tail) = take_digits(after_dot);
        if digits.is_empty() {
            return None;
        }
        components.push(digits);
        rest = tail;
    }

    let mut letter = None;
    if let Some(&b) = rest.as_bytes().first() {
        if b.is_ascii_lowercase() {
            letter = Some(b);
            rest = &rest[1..];
        }
    }

    let mut suffixes = Vec::new();
    while let Some(after_us) = rest.strip_prefix('_') {
        let (name, value) = SUFFIXES
            .iter()
            .find(|(name, _)| after_us.starts_with(name))?;
        let (digits, tail) = take_digits(&after_us[name.len()..]);
        suffixes.push((*value, digits));
        rest = tail;
    }

    let mut revision = "";
    if let Some(after_r) = rest.strip_prefix("-r") {
        let (digits, tail) = take_digits(after_r);
        if digits.is_empty() {
            return None;
        }
        revision = digits;
        rest = tail;
    }

    if !rest.is_empty() {
        return None;
    }

    Some(ParsedVersion {
        major,
        components,
        letter,
        suffixes,
        revision,
    })
}

/// Compare two decimal digit strings by value without overflow
fn cmp_numeric(a: &str, b: &str) -> Ordering {
    let a = a.trim_start_matches('0');
    let b = b.trim_start_matches('0');
    a.len().cmp(&b.len()).then_with(|| a.cmp(b))
}

/// Compare two digit strings as the fractions `0.a` and `0.b`
fn cmp_fraction(a: &str, b: &str) -> Ordering {
    let width = a.len().max(b.len());
    let a = format!("{:0<width$}", a);
    let b = format!("{:0<width$}", b);
    a.cmp(&b)
}

fn cmp_suffix_number(a: &str, b: &str) -> Ordering {
    let a = if a.is_empty() { "0" } else { a };
    let b = if b.is_empty() { "0" } else { b };
    cmp_numeric(a, b)
}

fn compare_parsed(a: &ParsedVersion<'_>, b: &ParsedVersion<'_>) -> Ordering {
    let ord = cmp_numeric(a.major, b.major);
    if ord != Ordering::Equal {
        return ord;
    }

    for i in 0..a.components.len().max(b.components.len()) {
        let ord = match (a.components.get(i), b.components.get(i)) {
            // A missing component sorts below any present one: 1.0 < 1.0.0
            (None, Some(_)) => Ordering::Less,
            (Some(_), None) => Ordering::Greater,
            (Some(x), Some(y)) if x.starts_with('0') || y.starts_with('0') => cmp_fraction(x, y),
            (Some(x), Some(y)) => cmp_numeric(x, y),
            (None, None) => Ordering::Equal,
        };
        if ord != Ordering::Equal {
            return ord;
        }
    }

    let ord = a.letter.cmp(&b.letter);
    if ord != Ordering::Equal {
        return ord;
    }

    for i in 0..a.suffixes.len().max(b.suffixes.len()) {
        let (va, na) = a.suffixes.get(i).copied().unwrap_or((0, "0"));
        let (vb, nb) = b.suffixes.get(i).copied().unwrap_or((0, "0"));
        let ord = va.cmp(&vb).then_with(|| cmp_suffix_number(na, nb));
        if ord != Ordering::Equal {
            return ord;
        }
    }

    cmp_suffix_number(a.revision, b.revision)
}

/// Check whether a string is a valid package version
///
/// A trailing `*` (prefix wildcard) is accepted.
pub fn is_valid_version(version: &str) -> bool {
    parse(version.strip_suffix('*').unwrap_or(version)).is_some()
}

/// Compare two version strings
///
/// Versions that are equal by value but spelled differently (`1.0` and
/// `1.00`) are ordered lexically so the result is a strict order. Invalid
/// versions sort below valid ones.
pub fn compare_versions(a: &str, b: &str) -> Ordering {
    if a == b {
        return Ordering::Equal;
    }

    let ord = match (parse(a), parse(b)) {
        (Some(pa), Some(pb)) => compare_parsed(&pa, &pb),
        (Some(_), None) => Ordering::Greater,
        (None, Some(_)) => Ordering::Less,
        (None, None) => Ordering::Equal,
    };

    ord.then_with(|| a.cmp(b))
}

/// Split a trailing Portage revision (`-rN`) off a version
///
/// Returns the base version and the revision number, `0` when absent.
pub fn split_portage_revision(version: &str) -> (&str, u64) {
    if let Some(pos) = version.rfind("-r") {
        let digits = &version[pos + 2..];
        if !digits.is_empty() && digits.bytes().all(|b| b.is_ascii_digit()) {
            return (&version[..pos], digits.parse().unwrap_or(u64::MAX));
        }
    }
    (version, 0)
}

/// A package's (version, tag, revision) identity
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VersionTriple {
    pub version: String,
    pub tag: String,
    pub revision: i64,
}

impl VersionTriple {
    pub fn new(version: impl Into<String>, tag: impl Into<String>, revision: i64) -> Self {
        Self {
            version: version.into(),
            tag: tag.into(),
            revision,
        }
    }

    /// Compare as the satisfaction filter does
    ///
    /// An installed revision equal to [`WILDCARD_REVISION`] accepts any
    /// revision of the same version and tag.
    pub fn compare_installed(&self, installed: &VersionTriple) -> Ordering {
        if installed.revision == WILDCARD_REVISION {
            let mut candidate = self.clone();
            candidate.revision = WILDCARD_REVISION;
            return candidate.cmp(installed);
        }
        self.cmp(installed)
    }
}

impl Ord for VersionTriple {
    fn cmp(&self, other: &Self) -> Ordering {
        compare_versions(&self.version, &other.version)
            .then_with(|| self.tag.cmp(&other.tag))
            .then_with(|| self.revision.cmp(&other.revision))
    }
}

impl PartialOrd for VersionTriple {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for VersionTriple {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.version)?;
        if !self.tag.is_empty() {
            write!(f, "#{}", self.tag)?;
        }
        write!(f, "~{}", self.revision)
    }
}

/// Index of the newest triple, first one wins on equality
pub fn newest(triples: &[VersionTriple]) -> Option<usize> {
    let mut best: Option<usize> = None;
    for (i, triple) in triples.iter().enumerate() {
        match best {
            Some(b) if triples[b] >= *triple => {}
            _ => best = Some(i),
        }
    }
    best
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lt(a: &str, b: &str) {
        assert_eq!(compare_versions(a, b), Ordering::Less, "{} < {}", a, b);
        assert_eq!(compare_versions(b, a), Ordering::Greater, "{} > {}", b, a);
    }

    #[test]
    fn test_compare_versions_numeric() {
        lt("1.0", "1.1");
        lt("1.9", "1.10");
        lt("2", "10");
        lt("1.2.3", "1.2.4");
        assert_eq!(compare_versions("1.2.3", "1.2.3"), Ordering::Equal);
    }

    #[test]
    fn test_compare_versions_missing_component() {
        lt("1.0", "1.0.0");
        lt("1", "1.0");
    }

    #[test]
    fn test_compare_versions_leading_zero() {
        lt("1.02", "1.1");
        lt("1.001", "1.01");
    }

    #[test]
    fn test_compare_versions_letter() {
        lt("1.0", "1.0a");
        lt("1.0a", "1.0b");
    }

    #[test]
    fn test_compare_versions_suffixes() {
        lt("1.0_alpha", "1.0_beta");
        lt("1.0_beta", "1.0_pre");
        lt("1.0_pre", "1.0_rc1");
        lt("1.0_rc1", "1.0_rc2");
        lt("1.0_rc2", "1.0");
        lt("1.0", "1.0_p1");
    }

    #[test]
    fn test_compare_versions_portage_revision() {
        lt("1.0", "1.0-r1");
        lt("1.0-r1", "1.0-r10");
        lt("1.0-r9", "1.0.1");
    }

    #[test]
    fn test_compare_versions_textual_tie_is_strict() {
        assert_ne!(compare_versions("1.0", "1.00"), Ordering::Equal);
        assert_eq!(
            compare_versions("1.0", "1.00"),
            compare_versions("1.00", "1.0").reverse()
        );
    }

    #[test]
    fn test_invalid_versions_sort_low() {
        assert!(!is_valid_version("abc"));
        lt("abc", "0.1");
        lt("abc", "abd");
    }

    #[test]
    fn test_is_valid_version() {
        assert!(is_valid_version("1.2.3"));
        assert!(is_valid_version("2.6.23_rc1-r2"));
        assert!(is_valid_version("1.0*"));
        assert!(is_valid_version("cvs.1.0"));
        assert!(!is_valid_version("1.0-"));
        assert!(!is_valid_version("1..0"));
        assert!(!is_valid_version("name"));
    }

    #[test]
    fn test_split_portage_revision() {
        assert_eq!(split_portage_revision("1.0-r3"), ("1.0", 3));
        assert_eq!(split_portage_revision("1.0"), ("1.0", 0));
        assert_eq!(split_portage_revision("1.0-rc"), ("1.0-rc", 0));
    }

    #[test]
    fn test_triple_order_version_then_tag_then_revision() {
        let a = VersionTriple::new("1.0", "", 5);
        let b = VersionTriple::new("1.1", "", 0);
        let c = VersionTriple::new("1.1", "foo", 0);
        let d = VersionTriple::new("1.1", "foo", 3);
        assert!(a < b);
        assert!(b < c);
        assert!(c < d);
    }

    #[test]
    fn test_triple_is_strict_total_order() {
        let samples = vec![
            VersionTriple::new("1.0", "", 0),
            VersionTriple::new("1.0", "", 1),
            VersionTriple::new("1.0", "b", 0),
            VersionTriple::new("1.5", "", 0),
            VersionTriple::new("2.0", "a", 0),
            VersionTriple::new("1.00", "", 0),
            VersionTriple::new("1.0_rc1", "", 2),
            VersionTriple::new("1.0-r1", "a", 0),
        ];

        for a in &samples {
            for b in &samples {
                let ab = a.cmp(b);
                assert_eq!(ab, b.cmp(a).reverse());
                assert_eq!(ab == Ordering::Equal, a == b);
                for c in &samples {
                    if a < b && b < c {
                        assert!(a < c, "{} < {} < {} must be transitive", a, b, c);
                    }
                }
            }
        }
    }

    #[test]
    fn test_wildcard_revision_only_in_installed_compare() {
        let repo = VersionTriple::new("1.0", "", 3);
        let installed = VersionTriple::new("1.0", "", WILDCARD_REVISION);
        assert_eq!(repo.compare_installed(&installed), Ordering::Equal);
        assert_eq!(repo.cmp(&installed), Ordering::Less);

        let newer = VersionTriple::new("1.1", "", 0);
        assert_eq!(newer.compare_installed(&installed), Ordering::Greater);
    }

    #[test]
    fn test_newest() {
        let triples = vec![
            VersionTriple::new("1.0", "", 0),
            VersionTriple::new("1.2", "", 0),
            VersionTriple::new("1.2", "", 0),
            VersionTriple::new("1.1", "", 9),
        ];
        assert_eq!(newest(&triples), Some(1));
        assert_eq!(newest(&[]), None);
    }
}
