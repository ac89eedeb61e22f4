// kiln-common/src/model/history.rs
//! Append-only record of every published formula version.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::debug;

use crate::error::{KilnError, Result};
use crate::model::formula::FormulaRecord;
use crate::model::version;

#[derive(Debug, Default, Clone)]
pub struct VersionHistory {
    // Publication order is preserved per name.
    entries: BTreeMap<String, Vec<Arc<FormulaRecord>>>,
}

impl VersionHistory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a record. Re-publishing an identical `(name, version, sha256)` is a
    /// no-op that returns the stored record; the same `(name, version)` with a
    /// different digest is a conflict.
    pub fn publish(&mut self, record: FormulaRecord) -> Result<Arc<FormulaRecord>> {
        let versions = self.entries.entry(record.name.clone()).or_default();
        if let Some(existing) = versions.iter().find(|r| r.version == record.version) {
            if existing.sha256 == record.sha256 {
                debug!(
                    "{} {} already published with the same digest",
                    record.name, record.version
                );
                return Ok(Arc::clone(existing));
            }
            return Err(KilnError::VersionConflict {
                name: record.name,
                version: record.version,
                existing: existing.sha256.clone(),
                attempted: record.sha256,
            });
        }
        debug!("Publishing {} {}", record.name, record.version);
        let record = Arc::new(record);
        versions.push(Arc::clone(&record));
        Ok(record)
    }

    pub fn get(&self, name: &str, version: &str) -> Option<Arc<FormulaRecord>> {
        self.entries
            .get(name)?
            .iter()
            .find(|r| r.version == version)
            .cloned()
    }

    /// Highest semver version. When two versions cannot be compared, the more
    /// recently published one wins.
    pub fn latest(&self, name: &str) -> Option<Arc<FormulaRecord>> {
        let versions = self.entries.get(name)?;
        versions
            .iter()
            .enumerate()
            .max_by(|(ia, a), (ib, b)| {
                match version::compare(&a.version, &b.version) {
                    Some(Ordering::Equal) | None => ia.cmp(ib),
                    Some(ord) => ord,
                }
            })
            .map(|(_, r)| Arc::clone(r))
    }

    /// All versions of `name` in publication order.
    pub fn versions(&self, name: &str) -> &[Arc<FormulaRecord>] {
        self.entries.get(name).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.entries.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(version: &str, digest_byte: char) -> FormulaRecord {
        FormulaRecord {
            name: "qvm-ffmpeg".to_string(),
            version: version.to_string(),
            desc: None,
            homepage: None,
            url: format!("https://example.com/qvm-ffmpeg-v{version}.tar.gz"),
            sha256: digest_byte.to_string().repeat(64),
            build_dependencies: vec![],
            runtime_dependencies: vec![],
            install: None,
            test: None,
            caveats: None,
        }
    }

    #[test]
    fn republishing_identical_record_is_a_noop() {
        let mut history = VersionHistory::new();
        history.publish(record("0.0.0-test1-c", 'e')).unwrap();
        history.publish(record("0.0.0-test1-c", 'e')).unwrap();
        assert_eq!(history.len(), 1);
    }

    #[test]
    fn conflicting_digest_is_rejected_and_original_kept() {
        let mut history = VersionHistory::new();
        history.publish(record("0.0.0-test1-c", 'e')).unwrap();
        let err = history.publish(record("0.0.0-test1-c", 'f')).unwrap_err();
        assert!(matches!(err, KilnError::VersionConflict { .. }));
        let kept = history.get("qvm-ffmpeg", "0.0.0-test1-c").unwrap();
        assert!(kept.sha256.starts_with('e'));
    }

    #[test]
    fn latest_follows_semver_not_publication_order() {
        let mut history = VersionHistory::new();
        history.publish(record("0.0.0-test2-g", 'a')).unwrap();
        history.publish(record("0.0.0-test1-c", 'b')).unwrap();
        assert_eq!(history.latest("qvm-ffmpeg").unwrap().version, "0.0.0-test2-g");
        let order: Vec<&str> = history
            .versions("qvm-ffmpeg")
            .iter()
            .map(|r| r.version.as_str())
            .collect();
        assert_eq!(order, vec!["0.0.0-test2-g", "0.0.0-test1-c"]);
    }

    #[test]
    fn unparseable_versions_fall_back_to_publication_order() {
        let mut history = VersionHistory::new();
        history.publish(record("2024a", 'a')).unwrap();
        history.publish(record("2023z", 'b')).unwrap();
        assert_eq!(history.latest("qvm-ffmpeg").unwrap().version, "2023z");
        assert!(history.latest("missing").is_none());
    }
}
