//! Core domain model for download-count reconciliation.

use std::borrow::Borrow;
use std::fmt;
use std::hash::Hash;
use std::path::PathBuf;

use chrono::NaiveDate;
use indexmap::map::Entry;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const CRATE_NAME: &str = "dlcount-core";

/// Analytics source feeding the reconciliation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceId {
    PurchaseReport,
    SearchReferral,
    LegacyStatic,
}

impl SourceId {
    /// Sources that carry an incremental archive and a watermark.
    pub const ARCHIVED: [SourceId; 2] = [SourceId::PurchaseReport, SourceId::SearchReferral];

    pub fn as_str(&self) -> &'static str {
        match self {
            SourceId::PurchaseReport => "purchase_report",
            SourceId::SearchReferral => "search_referral",
            SourceId::LegacyStatic => "legacy_static",
        }
    }
}

impl fmt::Display for SourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Last archived date (inclusive) for one source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Watermark {
    pub end_date: NaiveDate,
}

/// Inclusive calendar-date range handed to the report clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateWindow {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl DateWindow {
    pub fn contains(&self, date: NaiveDate) -> bool {
        self.start <= date && date <= self.end
    }

    pub fn days(&self) -> i64 {
        (self.end - self.start).num_days() + 1
    }
}

impl fmt::Display for DateWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}..={}", self.start, self.end)
    }
}

/// One freshly fetched (key, value) pair. Keys are not canonical yet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawObservation {
    pub key: String,
    pub value: i64,
}

impl RawObservation {
    pub fn new(key: impl Into<String>, value: i64) -> Self {
        Self {
            key: key.into(),
            value,
        }
    }
}

/// Relative path of a catalog item, e.g. `canon/sn/sn56.11`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContentPath(String);

impl ContentPath {
    /// Returns `None` for empty paths and paths with empty, `.` or `..` segments.
    pub fn new(raw: &str) -> Option<Self> {
        let trimmed = raw.trim().trim_start_matches('/');
        if trimmed.is_empty() || trimmed.contains('\\') {
            return None;
        }
        if trimmed
            .split('/')
            .any(|segment| segment.is_empty() || segment == "." || segment == "..")
        {
            return None;
        }
        Some(Self(trimmed.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First path segment, the content bucket.
    pub fn bucket(&self) -> &str {
        self.0.split('/').next().unwrap_or_default()
    }
}

impl fmt::Display for ContentPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Borrow<str> for ContentPath {
    fn borrow(&self) -> &str {
        &self.0
    }
}

/// Outbound-link pseudo-identifier, never merged with content counts.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LinkKey(String);

impl LinkKey {
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for LinkKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Borrow<str> for LinkKey {
    fn borrow(&self) -> &str {
        &self.0
    }
}

/// Classification of a raw item identifier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NormalizedKey {
    Content(ContentPath),
    Link(LinkKey),
    /// Member `#index` of a multi-part item whose total accrues to `base`.
    Segment { base: ContentPath, index: u32 },
    /// Key that cannot be expressed as a content path.
    Rejected { raw: String, reason: &'static str },
}

/// Insertion-ordered count table. The first time a key is added fixes its row
/// position; later additions only change the value.
#[derive(Debug, Clone)]
pub struct CountTable<K: Hash + Eq> {
    rows: IndexMap<K, u64>,
}

impl<K: Hash + Eq> Default for CountTable<K> {
    fn default() -> Self {
        Self {
            rows: IndexMap::new(),
        }
    }
}

/// Equality compares totals per key, ignoring row order.
impl<K: Hash + Eq> PartialEq for CountTable<K> {
    fn eq(&self, other: &Self) -> bool {
        self.rows == other.rows
    }
}

impl<K: Hash + Eq> Eq for CountTable<K> {}

impl<K: Hash + Eq + fmt::Display> CountTable<K> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn get<Q>(&self, key: &Q) -> Option<u64>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.rows.get(key).copied()
    }

    pub fn contains_key<Q>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.rows.contains_key(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&K, u64)> {
        self.rows.iter().map(|(k, v)| (k, *v))
    }

    pub fn keys(&self) -> impl Iterator<Item = &K> {
        self.rows.keys()
    }

    /// Sum of all values. Saturates, since it is only used for reporting.
    pub fn total(&self) -> u64 {
        self.rows.values().fold(0u64, |acc, v| acc.saturating_add(*v))
    }

    /// Adds `amount` to `key`, creating the row at the end when it is new.
    pub fn add(&mut self, key: K, amount: u64) -> Result<(), InvariantViolation> {
        match self.rows.entry(key) {
            Entry::Vacant(slot) => {
                slot.insert(amount);
                Ok(())
            }
            Entry::Occupied(mut slot) => match slot.get().checked_add(amount) {
                Some(sum) => {
                    *slot.get_mut() = sum;
                    Ok(())
                }
                None => Err(InvariantViolation::CountOverflow {
                    key: slot.key().to_string(),
                }),
            },
        }
    }
}

impl<K: Hash + Eq> IntoIterator for CountTable<K> {
    type Item = (K, u64);
    type IntoIter = indexmap::map::IntoIter<K, u64>;

    fn into_iter(self) -> Self::IntoIter {
        self.rows.into_iter()
    }
}

/// Final per-run totals, split between catalog content and outbound links.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResolvedCounts {
    pub content: CountTable<ContentPath>,
    pub links: CountTable<LinkKey>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InvariantViolation {
    #[error("negative count {value} for key {key}")]
    NegativeCount { key: String, value: i64 },
    #[error("count overflow for key {key}")]
    CountOverflow { key: String },
    #[error("inverted window for {source_id}: watermark {watermark} is past the settle horizon {horizon}")]
    InvertedWindow {
        source_id: SourceId,
        watermark: NaiveDate,
        horizon: NaiveDate,
    },
    #[error("watermark for {source_id} would move backward from {current} to {proposed}")]
    WatermarkRegression {
        source_id: SourceId,
        current: NaiveDate,
        proposed: NaiveDate,
    },
    #[error("no watermark recorded for {source_id}")]
    MissingWatermark { source_id: SourceId },
    #[error("required file is missing: {}", path.display())]
    MissingArchive { path: PathBuf },
    #[error("illegal run state transition {from} -> {to}")]
    IllegalTransition { from: String, to: String },
}

/// Error taxonomy surfaced by a reconciliation run.
#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("fetch failed for {source_id}: {message}")]
    Fetch { source_id: SourceId, message: String },
    #[error(transparent)]
    Invariant(#[from] InvariantViolation),
}
