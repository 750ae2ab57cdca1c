// src/atom/mod.rs

//! Package specifier ("atom") parsing
//!
//! An atom names a package family and optionally narrows it down:
//!
//! ```text
//! [!][op][category/]name[-version[*]][:slot][[use,flags]][#tag][~revision][@repo1,repo2]
//! ```
//!
//! Operators are `>=`, `<=`, `>`, `<`, `=` and `~`. A leading `!` marks a
//! conflict. A version without an operator means `=`.

use crate::error::{Error, Result};
use crate::version::is_valid_version;
use std::fmt;
use std::str::FromStr;

/// Comparison operator carried by an atom
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operator {
    Equal,
    Greater,
    GreaterOrEqual,
    Less,
    LessOrEqual,
    /// Same version, any Portage revision at or above the given one
    Tilde,
}

impl Operator {
    pub fn as_str(&self) -> &str {
        match self {
            Operator::Equal => "=",
            Operator::Greater => ">",
            Operator::GreaterOrEqual => ">=",
            Operator::Less => "<",
            Operator::LessOrEqual => "<=",
            Operator::Tilde => "~",
        }
    }

    /// Strip a leading operator from a specifier body
    fn split_prefix(s: &str) -> (Option<Operator>, &str) {
        for (prefix, op) in [
            (">=", Operator::GreaterOrEqual),
            ("<=", Operator::LessOrEqual),
            (">", Operator::Greater),
            ("<", Operator::Less),
            ("=", Operator::Equal),
            ("~", Operator::Tilde),
        ] {
            if let Some(rest) = s.strip_prefix(prefix) {
                return (Some(op), rest);
            }
        }
        (None, s)
    }
}

/// A parsed package specifier
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Atom {
    raw: String,
    pub conflict: bool,
    pub operator: Option<Operator>,
    pub category: Option<String>,
    pub name: String,
    /// Version including any `-rN` Portage revision, without the wildcard
    pub version: Option<String>,
    /// Trailing `*`: match any version starting with `version`
    pub wildcard: bool,
    pub slot: Option<String>,
    pub tag: Option<String>,
    /// Repository (entropy) revision, `~N`
    pub revision: Option<i64>,
    pub use_flags: Vec<String>,
    /// `@repo1,repo2` restriction
    pub repositories: Option<Vec<String>>,
}

fn invalid(atom: &str, reason: &str) -> Error {
    Error::InvalidAtom {
        atom: atom.to_string(),
        reason: reason.to_string(),
    }
}

/// Split `name-version[-rN]` the way package file names are split
///
/// Returns `None` when no part verifies as a version, or when the name
/// itself contains version-looking parts.
fn split_name_version(s: &str) -> Option<(&str, &str)> {
    let parts: Vec<&str> = s.split('-').collect();
    if parts.len() < 2 || parts.iter().any(|p| p.is_empty()) {
        return None;
    }

    let last = parts[parts.len() - 1];
    let has_rev = last.len() > 1
        && last.starts_with('r')
        && last[1..].bytes().all(|b| b.is_ascii_digit());
    let ver_pos = if has_rev { parts.len() - 2 } else { parts.len() - 1 };
    if ver_pos == 0 || !is_valid_version(parts[ver_pos]) {
        return None;
    }
    if parts[..ver_pos].iter().any(|p| is_valid_version(p)) {
        return None;
    }

    let name_len = parts[..ver_pos].iter().map(|p| p.len()).sum::<usize>() + ver_pos - 1;
    Some((&s[..name_len], &s[name_len + 1..]))
}

impl Atom {
    /// Parse a specifier string
    pub fn parse(spec: &str) -> Result<Self> {
        let raw = spec.trim();
        if raw.is_empty() {
            return Err(invalid(spec, "empty specifier"));
        }

        let mut rest = raw;

        let conflict = rest.starts_with('!');
        if conflict {
            rest = &rest[1..];
        }

        let mut repositories = None;
        if let Some(pos) = rest.rfind('@') {
            let repos: Vec<String> = rest[pos + 1..]
                .split(',')
                .filter(|r| !r.is_empty())
                .map(str::to_string)
                .collect();
            if !repos.is_empty() {
                repositories = Some(repos);
            }
            rest = &rest[..pos];
        }

        let (operator, body) = Operator::split_prefix(rest);
        let mut body = body.to_string();

        let mut revision = None;
        if let Some(pos) = body.rfind('~') {
            let value = &body[pos + 1..];
            revision = Some(
                value
                    .parse::<i64>()
                    .map_err(|_| invalid(raw, "revision after '~' is not a number"))?,
            );
            body.truncate(pos);
        }

        let mut tag = None;
        if let Some(pos) = body.rfind('#') {
            let tag_part = body[pos + 1..].to_string();
            let tag_len = tag_part.find([':', '[']).unwrap_or(tag_part.len());
            if tag_len > 0 {
                tag = Some(tag_part[..tag_len].to_string());
            }
            body = format!("{}{}", &body[..pos], &tag_part[tag_len..]);
        }

        let mut use_flags = Vec::new();
        if let Some(open) = body.find('[') {
            let close = body[open..]
                .find(']')
                .map(|c| open + c)
                .ok_or_else(|| invalid(raw, "USE dependency without closing bracket"))?;
            use_flags = body[open + 1..close]
                .split(',')
                .filter(|f| !f.is_empty())
                .map(str::to_string)
                .collect();
            if use_flags.is_empty() {
                return Err(invalid(raw, "empty USE dependency"));
            }
            body = format!("{}{}", &body[..open], &body[close + 1..]);
        }

        let mut slot = None;
        if let Some(pos) = body.find(':') {
            let value = body[pos + 1..].to_string();
            if value.is_empty() {
                return Err(invalid(raw, "empty slot"));
            }
            slot = Some(value);
            body.truncate(pos);
        }

        let wildcard = body.ends_with('*');
        if wildcard {
            body.pop();
        }

        let (category, cpv) = match body.split_once('/') {
            Some((cat, cpv)) => {
                if cat.is_empty() || cat.starts_with('-') || cpv.contains('/') {
                    return Err(invalid(raw, "malformed category"));
                }
                (Some(cat.to_string()), cpv.to_string())
            }
            None => (None, body.clone()),
        };

        let (name, version) = match split_name_version(&cpv) {
            Some((name, version)) => (name.to_string(), Some(version.to_string())),
            None => (cpv, None),
        };

        if name.is_empty() {
            return Err(invalid(raw, "missing package name"));
        }
        if operator.is_some() && version.is_none() {
            return Err(invalid(raw, "operator without a version"));
        }
        if wildcard && version.is_none() {
            return Err(invalid(raw, "wildcard without a version"));
        }

        Ok(Self {
            raw: raw.to_string(),
            conflict,
            operator,
            category,
            name,
            version,
            wildcard,
            slot,
            tag,
            revision,
            use_flags,
            repositories,
        })
    }

    /// Package key: `category/name`, or bare `name` when no category was given
    pub fn key(&self) -> String {
        match &self.category {
            Some(cat) => format!("{}/{}", cat, self.name),
            None => self.name.clone(),
        }
    }

    /// Operator in effect: a bare version means `=`
    pub fn effective_operator(&self) -> Option<Operator> {
        match (self.operator, &self.version) {
            (None, Some(_)) => Some(Operator::Equal),
            (op, _) => op,
        }
    }

    pub fn has_version(&self) -> bool {
        self.version.is_some()
    }

    /// The specifier text as given
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// The same specifier without the conflict marker
    pub fn without_conflict(&self) -> Atom {
        let mut atom = self.clone();
        if atom.conflict {
            atom.conflict = false;
            atom.raw = atom.raw[1..].to_string();
        }
        atom
    }
}

impl FromStr for Atom {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Atom::parse(s)
    }
}

impl fmt::Display for Atom {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.raw)
    }
}

/// Canonical atom string of a package: `category/name-version[#tag]`
pub fn package_atom(category: &str, name: &str, version: &str, tag: &str) -> String {
    if tag.is_empty() {
        format!("{}/{}-{}", category, name, version)
    } else {
        format!("{}/{}-{}#{}", category, name, version, tag)
    }
}

/// Key of a specifier, falling back to the raw text when it does not parse
pub fn key_of(spec: &str) -> String {
    Atom::parse(spec)
        .map(|a| a.key())
        .unwrap_or_else(|_| spec.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_bare_key() {
        let atom = Atom::parse("media-libs/libpng").unwrap();
        assert_eq!(atom.category.as_deref(), Some("media-libs"));
        assert_eq!(atom.name, "libpng");
        assert_eq!(atom.version, None);
        assert_eq!(atom.operator, None);
        assert_eq!(atom.effective_operator(), None);
        assert_eq!(atom.key(), "media-libs/libpng");
    }

    #[test]
    fn test_parse_name_only() {
        let atom = Atom::parse("libpng").unwrap();
        assert_eq!(atom.category, None);
        assert_eq!(atom.key(), "libpng");
    }

    #[test]
    fn test_parse_versioned() {
        let atom = Atom::parse(">=sys-libs/zlib-1.2.3-r1").unwrap();
        assert_eq!(atom.operator, Some(Operator::GreaterOrEqual));
        assert_eq!(atom.name, "zlib");
        assert_eq!(atom.version.as_deref(), Some("1.2.3-r1"));
        assert_eq!(atom.key(), "sys-libs/zlib");
    }

    #[test]
    fn test_bare_version_means_equal() {
        let atom = Atom::parse("app-misc/foo-bar-2.0").unwrap();
        assert_eq!(atom.name, "foo-bar");
        assert_eq!(atom.version.as_deref(), Some("2.0"));
        assert_eq!(atom.effective_operator(), Some(Operator::Equal));
    }

    #[test]
    fn test_parse_all_components() {
        let atom =
            Atom::parse("!=sys-kernel/linux-sources-2.6.23*:2.6[doc,-static]#sabayon-r1~3@main,extra")
                .unwrap();
        assert!(atom.conflict);
        assert_eq!(atom.operator, Some(Operator::Equal));
        assert_eq!(atom.name, "linux-sources");
        assert_eq!(atom.version.as_deref(), Some("2.6.23"));
        assert!(atom.wildcard);
        assert_eq!(atom.slot.as_deref(), Some("2.6"));
        assert_eq!(atom.use_flags, vec!["doc".to_string(), "-static".to_string()]);
        assert_eq!(atom.tag.as_deref(), Some("sabayon-r1"));
        assert_eq!(atom.revision, Some(3));
        assert_eq!(
            atom.repositories,
            Some(vec!["main".to_string(), "extra".to_string()])
        );
    }

    #[test]
    fn test_tag_with_trailing_slot() {
        let atom = Atom::parse("sys-kernel/linux-2.6.23#sabayon:0").unwrap();
        assert_eq!(atom.tag.as_deref(), Some("sabayon"));
        assert_eq!(atom.slot.as_deref(), Some("0"));
        assert_eq!(atom.version.as_deref(), Some("2.6.23"));
    }

    #[test]
    fn test_tilde_operator_is_not_a_revision() {
        let atom = Atom::parse("~dev-lang/python-2.5").unwrap();
        assert_eq!(atom.operator, Some(Operator::Tilde));
        assert_eq!(atom.revision, None);
        assert_eq!(atom.version.as_deref(), Some("2.5"));
    }

    #[test]
    fn test_invalid_atoms() {
        assert!(Atom::parse("").is_err());
        assert!(Atom::parse(">=sys-libs/zlib").is_err());
        assert!(Atom::parse("sys-libs/zlib-1.0~x").is_err());
        assert!(Atom::parse("sys-libs/zlib[").is_err());
        assert!(Atom::parse("sys-libs/zlib:").is_err());
        assert!(matches!(
            Atom::parse("a/b/c").unwrap_err(),
            Error::InvalidAtom { .. }
        ));
    }

    #[test]
    fn test_without_conflict() {
        let atom = Atom::parse("!app-misc/foo").unwrap();
        let plain = atom.without_conflict();
        assert!(!plain.conflict);
        assert_eq!(plain.as_str(), "app-misc/foo");
    }

    #[test]
    fn test_package_atom_and_key_of() {
        assert_eq!(package_atom("a", "b", "1.0", ""), "a/b-1.0");
        assert_eq!(package_atom("a", "b", "1.0", "t"), "a/b-1.0#t");
        assert_eq!(key_of(">=a/b-1.0:2"), "a/b");
        assert_eq!(key_of("a/b-1.0#t"), "a/b");
    }
}
