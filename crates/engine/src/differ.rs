//! Result differ: decides whether a freshly fetched result set warrants a
//! digest.
//!
//! Records are compared in order. By default every field takes part in the
//! comparison; a detector built with identity fields only compares those,
//! so volatile columns (timestamps, row counters) can be ignored.

use digest_common::types::{Record, ResultSet};

/// Record-level comparison of two result sets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ChangeSummary {
    /// No previous snapshot existed.
    pub first_run: bool,
    /// The result set name differs (e.g. `rows` became `features`).
    pub renamed: bool,
    pub added: usize,
    pub removed: usize,
    pub changed: usize,
}

impl ChangeSummary {
    pub fn is_significant(&self) -> bool {
        self.first_run || self.renamed || self.added + self.removed + self.changed > 0
    }
}

/// Compares result sets, optionally restricted to identity fields.
#[derive(Debug, Clone, Default)]
pub struct ChangeDetector {
    identity_fields: Vec<String>,
}

impl ChangeDetector {
    /// A detector that compares every field.
    pub fn new() -> Self {
        Self::default()
    }

    /// A detector that only compares `fields`. An empty list compares every
    /// field.
    pub fn with_identity_fields(fields: Vec<String>) -> Self {
        Self {
            identity_fields: fields,
        }
    }

    /// True when `current` should produce a digest.
    ///
    /// A missing previous snapshot always counts as a change, even when
    /// `current` is empty.
    pub fn has_significant_change(&self, previous: Option<&ResultSet>, current: &ResultSet) -> bool {
        self.summarize(previous, current).is_significant()
    }

    /// Positional comparison of `previous` against `current`.
    pub fn summarize(&self, previous: Option<&ResultSet>, current: &ResultSet) -> ChangeSummary {
        let Some(previous) = previous else {
            return ChangeSummary {
                first_run: true,
                added: current.len(),
                ..Default::default()
            };
        };

        let common = previous.len().min(current.len());
        let changed = previous
            .records
            .iter()
            .zip(current.records.iter())
            .filter(|(before, after)| !self.same_record(before, after))
            .count();

        ChangeSummary {
            first_run: false,
            renamed: previous.name != current.name,
            added: current.len() - common,
            removed: previous.len() - common,
            changed,
        }
    }

    fn same_record(&self, a: &Record, b: &Record) -> bool {
        if self.identity_fields.is_empty() {
            return a == b;
        }
        self.identity_fields
            .iter()
            .all(|field| a.get(field) == b.get(field))
    }
}

/// [`ChangeDetector::has_significant_change`] comparing every field.
pub fn has_significant_change(previous: Option<&ResultSet>, current: &ResultSet) -> bool {
    ChangeDetector::new().has_significant_change(previous, current)
}
