//! Version ordering shared by the resolver and the auto-version engine.
//!
//! Labels are compared as semantic versions when they parse as one (leniently:
//! `1` and `1.2` are padded to `1.0.0` and `1.2.0`). Parseable labels always
//! sort above labels that do not parse; the latter fall back to plain
//! lexicographic order among themselves.

use std::cmp::Ordering;

/// Parse a version label as semver, padding missing minor/patch components.
///
/// Returns `None` when the label is not a (possibly abbreviated) semantic version.
pub fn parse_lenient(label: &str) -> Option<semver::Version> {
    let label = label.trim();
    if let Ok(v) = semver::Version::parse(label) {
        return Some(v);
    }

    let (core, suffix) = match label.find(['-', '+']) {
        Some(idx) => label.split_at(idx),
        None => (label, ""),
    };
    let parts: Vec<&str> = core.split('.').collect();
    if parts.len() > 3
        || !parts
            .iter()
            .all(|p| !p.is_empty() && p.bytes().all(|b| b.is_ascii_digit()))
    {
        return None;
    }

    let mut padded = parts.join(".");
    for _ in parts.len()..3 {
        padded.push_str(".0");
    }
    padded.push_str(suffix);
    semver::Version::parse(&padded).ok()
}

/// Total order over version labels.
///
/// Two labels that denote the same semantic version (`1.2` and `1.2.0`)
/// compare as [`Ordering::Equal`]; callers that need a strict order break the
/// tie themselves.
pub fn compare(a: &str, b: &str) -> Ordering {
    match (parse_lenient(a), parse_lenient(b)) {
        (Some(x), Some(y)) => x.cmp(&y),
        (Some(_), None) => Ordering::Greater,
        (None, Some(_)) => Ordering::Less,
        (None, None) => a.cmp(b),
    }
}

/// Returns true if `candidate` sorts strictly above `current`.
pub fn is_newer(current: &str, candidate: &str) -> bool {
    compare(candidate, current) == Ordering::Greater
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lenient_padding() {
        assert_eq!(parse_lenient("1"), Some(semver::Version::new(1, 0, 0)));
        assert_eq!(parse_lenient("1.21"), Some(semver::Version::new(1, 21, 0)));
        assert_eq!(
            parse_lenient("1.2-rc.1").map(|v| v.pre.to_string()),
            Some("rc.1".to_string())
        );
        assert_eq!(parse_lenient("nightly"), None);
        assert_eq!(parse_lenient("1.2.3.4"), None);
    }

    #[test]
    fn test_semver_sorts_above_non_semver() {
        assert_eq!(compare("0.0.1", "zzz"), Ordering::Greater);
        assert_eq!(compare("abc", "0.0.1"), Ordering::Less);
        assert_eq!(compare("abc", "abd"), Ordering::Less);
    }

    #[test]
    fn test_numeric_not_lexical() {
        assert!(is_newer("1.9.0", "1.10.0"));
        assert!(!is_newer("1.10.0", "1.9.0"));
        assert!(is_newer("1.0.0-beta", "1.0.0"));
        assert_eq!(compare("1.2", "1.2.0"), Ordering::Equal);
    }
}
