// kiln-common/src/model/version.rs
use std::cmp::Ordering;

use semver::Version;

const ARCHIVE_SUFFIXES: [&str; 10] = [
    ".tar.gz", ".tar.bz2", ".tar.xz", ".tgz", ".tbz", ".tbz2", ".txz", ".tar", ".zip", ".gz",
];

/// Derives a version from a source url the way tag-based release urls are laid out:
/// a GitHub `releases/download/<tag>/` or `archive/refs/tags/<tag>` segment wins,
/// otherwise the trailing `-<version>` of the archive file stem. A leading `v` is dropped.
pub fn infer_from_url(url: &str) -> Option<String> {
    let path = url.split(['?', '#']).next().unwrap_or(url);
    let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();

    for (i, window) in segments.windows(2).enumerate() {
        if window == ["releases", "download"] {
            if let Some(tag) = segments.get(i + 2) {
                if let Some(v) = version_from_tag(tag) {
                    return Some(v);
                }
            }
        }
    }
    for (i, window) in segments.windows(3).enumerate() {
        if window == ["archive", "refs", "tags"] {
            if let Some(tag) = segments.get(i + 3) {
                if let Some(v) = version_from_tag(strip_archive_suffix(tag)) {
                    return Some(v);
                }
            }
        }
    }

    let stem = strip_archive_suffix(segments.last()?);
    let mut search = stem;
    while let Some(idx) = search.find('-') {
        let candidate = &search[idx + 1..];
        if let Some(v) = version_from_tag(candidate) {
            return Some(v);
        }
        search = candidate;
    }
    None
}

fn strip_archive_suffix(name: &str) -> &str {
    ARCHIVE_SUFFIXES
        .iter()
        .find_map(|suffix| name.strip_suffix(suffix))
        .unwrap_or(name)
}

fn version_from_tag(tag: &str) -> Option<String> {
    let trimmed = tag.strip_prefix('v').unwrap_or(tag);
    if trimmed.chars().next().is_some_and(|c| c.is_ascii_digit()) {
        Some(trimmed.to_string())
    } else {
        None
    }
}

/// Parses a version leniently: `1.2` is read as `1.2.0`.
pub fn parse_lenient(version: &str) -> Option<Version> {
    if let Ok(v) = Version::parse(version) {
        return Some(v);
    }
    let (core, rest) = match version.find(['-', '+']) {
        Some(idx) => version.split_at(idx),
        None => (version, ""),
    };
    let padded = match core.split('.').count() {
        1 => format!("{core}.0.0{rest}"),
        2 => format!("{core}.0{rest}"),
        _ => return None,
    };
    Version::parse(&padded).ok()
}

/// Semver order when both sides parse, `None` otherwise.
pub fn compare(a: &str, b: &str) -> Option<Ordering> {
    Some(parse_lenient(a)?.cmp(&parse_lenient(b)?))
}
