//! Binary version handling for release targeting.
//!
//! Releases target a range of binary versions written in the npm range syntax
//! mobile tooling emits (`1.2.3`, `^1.2`, `~1.2.3`, `1.x`, `>=1.0 <2.0`,
//! `1.0.0 - 1.4.0`, `1.0.0 || 2.x`, `*`). Clients report a bare version which
//! may omit components (`1`, `1.2`).

use semver::{BuildMetadata, Comparator, Op, Version};
use std::str::FromStr;

const OPERATORS: [&str; 7] = [">=", "<=", ">", "<", "=", "^", "~"];

/// Completes `1` to `1.0.0` and `1.2` to `1.2.0`. Anything else is returned
/// trimmed and unchanged.
pub fn normalize(version: &str) -> String {
    let version = version.trim();
    let parts: Vec<&str> = version.split('.').collect();
    let numeric = parts
        .iter()
        .all(|p| !p.is_empty() && p.bytes().all(|b| b.is_ascii_digit()));

    match (numeric, parts.len()) {
        (true, 1) => format!("{version}.0.0"),
        (true, 2) => format!("{version}.0"),
        _ => version.to_string(),
    }
}

pub fn parse_version(version: &str) -> Option<Version> {
    Version::parse(version.trim().trim_start_matches('v')).ok()
}

#[derive(Debug, thiserror::Error, PartialEq)]
#[error("invalid app version range {range:?}: {reason}")]
pub struct RangeError {
    range: String,
    reason: String,
}

/// A disjunction of comparator sets. An empty set matches everything.
#[derive(Clone, Debug, PartialEq)]
pub struct AppVersionRange {
    alternatives: Vec<Vec<Comparator>>,
}

impl FromStr for AppVersionRange {
    type Err = RangeError;

    fn from_str(range: &str) -> Result<Self, Self::Err> {
        let error = |reason: String| RangeError {
            range: range.to_string(),
            reason,
        };

        if range.trim().is_empty() {
            return Err(error("empty range".into()));
        }

        let alternatives = range
            .split("||")
            .map(|alternative| parse_alternative(alternative).map_err(&error))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(AppVersionRange { alternatives })
    }
}

fn parse_alternative(alternative: &str) -> Result<Vec<Comparator>, String> {
    let alternative = alternative.trim();

    if let Some((low, high)) = alternative.split_once(" - ") {
        let mut set = Vec::new();
        set.extend(parse_comparator(">=", low.trim())?);
        set.extend(parse_comparator("<=", high.trim())?);
        return Ok(set);
    }

    let mut set = Vec::new();
    let mut tokens = alternative.split_whitespace();
    while let Some(token) = tokens.next() {
        let (op, version) = split_operator(token);
        // npm allows whitespace between the operator and the version.
        let version = if version.is_empty() && !op.is_empty() {
            tokens
                .next()
                .ok_or_else(|| format!("operator {op:?} without a version"))?
        } else {
            version
        };
        set.extend(parse_comparator(op, version)?);
    }
    Ok(set)
}

fn split_operator(token: &str) -> (&str, &str) {
    OPERATORS
        .iter()
        .find_map(|op| token.strip_prefix(op).map(|rest| (*op, rest)))
        .unwrap_or(("", token))
}

/// Builds a comparator from an npm operator and a possibly partial version.
/// Wildcard components truncate the version; a fully wild version matches
/// everything and yields no comparator.
fn parse_comparator(op: &str, version: &str) -> Result<Option<Comparator>, String> {
    let version = version.trim_start_matches(['v', '=']);
    let concrete: Vec<&str> = version
        .split('.')
        .take_while(|part| !matches!(*part, "x" | "X" | "*"))
        .collect();

    if concrete.is_empty() || concrete == [""] {
        return Ok(None);
    }

    // A bare version is an exact match in npm, but a caret requirement in
    // the semver crate.
    let op = if op.is_empty() { "=" } else { op };
    let text = format!("{op}{}", concrete.join("."));
    Comparator::parse(&text)
        .map(Some)
        .map_err(|e| format!("{text}: {e}"))
}

impl AppVersionRange {
    pub fn matches(&self, version: &Version) -> bool {
        self.alternatives
            .iter()
            .any(|set| set.iter().all(|c| c.matches(version)))
    }

    /// True when `version` is newer than every version the range admits.
    pub fn is_exceeded_by(&self, version: &Version) -> bool {
        self.alternatives.iter().all(|set| {
            let mut failing = set.iter().filter(|c| !c.matches(version)).peekable();
            failing.peek().is_some() && failing.all(|c| !is_below(c, version))
        })
    }
}

/// Whether a failing comparator rejected `version` for being too old.
fn is_below(comparator: &Comparator, version: &Version) -> bool {
    match comparator.op {
        Op::Greater | Op::GreaterEq => true,
        Op::Less | Op::LessEq => false,
        _ => {
            let floor = Version {
                major: comparator.major,
                minor: comparator.minor.unwrap_or(0),
                patch: comparator.patch.unwrap_or(0),
                pre: comparator.pre.clone(),
                build: BuildMetadata::EMPTY,
            };
            *version < floor
        }
    }
}

/// Whether the client `version` falls inside `range`. Unparseable input never
/// matches.
pub fn satisfies(version: &str, range: &str) -> bool {
    match (parse_version(version), range.parse::<AppVersionRange>()) {
        (Some(version), Ok(range)) => range.matches(&version),
        _ => false,
    }
}

/// Whether the client `version` is newer than everything `range` admits.
pub fn is_newer_than_range(version: &str, range: &str) -> bool {
    match (parse_version(version), range.parse::<AppVersionRange>()) {
        (Some(version), Ok(range)) => range.is_exceeded_by(&version),
        _ => false,
    }
}

/// Checks that an operator-supplied range can be used for targeting.
pub fn validate_range(range: &str) -> Result<(), RangeError> {
    range.parse::<AppVersionRange>().map(|_| ())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_partial_versions() {
        assert_eq!(normalize("1"), "1.0.0");
        assert_eq!(normalize("1.2"), "1.2.0");
        assert_eq!(normalize(" 1.2.3 "), "1.2.3");
        assert_eq!(normalize("1.2.3-beta"), "1.2.3-beta");
        assert_eq!(normalize("1.x"), "1.x");
    }

    #[test]
    fn bare_version_is_exact() {
        assert!(satisfies("1.0.0", "1.0.0"));
        assert!(!satisfies("1.0.1", "1.0.0"));
        assert!(!satisfies("1.1.0", "1.0.0"));
    }

    #[test]
    fn partial_and_wildcard_ranges() {
        assert!(satisfies("1.2.9", "1.2"));
        assert!(!satisfies("1.3.0", "1.2"));
        assert!(satisfies("1.7.0", "1.x"));
        assert!(satisfies("1.7.0", "1.*"));
        assert!(!satisfies("2.0.0", "1.x"));
        assert!(satisfies("9.9.9", "*"));
        assert!(satisfies("0.0.1", "x"));
    }

    #[test]
    fn operator_ranges() {
        assert!(satisfies("1.4.0", "^1.2.0"));
        assert!(!satisfies("2.0.0", "^1.2.0"));
        assert!(satisfies("1.2.7", "~1.2.3"));
        assert!(!satisfies("1.3.0", "~1.2.3"));
        assert!(satisfies("1.5.0", ">=1.0.0 <2.0.0"));
        assert!(satisfies("1.5.0", ">= 1.0.0 < 2.0.0"));
        assert!(!satisfies("2.0.0", ">=1.0.0 <2.0.0"));
        assert!(satisfies("1.4.0", "1.0.0 - 1.4.0"));
        assert!(!satisfies("1.4.1", "1.0.0 - 1.4.0"));
        assert!(satisfies("2.3.0", "1.0.0 || 2.x"));
        assert!(!satisfies("3.0.0", "1.0.0 || 2.x"));
    }

    #[test]
    fn invalid_input_never_matches() {
        assert!(!satisfies("banana", "1.0.0"));
        assert!(!satisfies("1.0.0", ">=apple"));
        assert!(validate_range("").is_err());
        assert!(validate_range(">=").is_err());
        assert!(validate_range("^1.2.3").is_ok());
    }

    #[test]
    fn newer_than_range() {
        assert!(is_newer_than_range("2.0.0", "1.0.0"));
        assert!(is_newer_than_range("2.0.0", "^1.2.0"));
        assert!(is_newer_than_range("2.0.0", ">=1.0.0 <2.0.0"));
        assert!(is_newer_than_range("3.0.0", "1.x || 2.x"));
        assert!(!is_newer_than_range("0.9.0", "1.0.0"));
        assert!(!is_newer_than_range("1.0.0", "1.0.0"));
        assert!(!is_newer_than_range("1.5.0", "1.x || 2.x"));
        assert!(!is_newer_than_range("0.5.0", ">=1.0.0"));
        assert!(!is_newer_than_range("5.0.0", "*"));
    }
}
