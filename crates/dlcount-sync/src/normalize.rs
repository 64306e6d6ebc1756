//! Item-identifier classification and near-duplicate merging.

use std::collections::BTreeMap;

use dlcount_core::{ContentPath, CountTable, InvariantViolation, LinkKey, NormalizedKey};
use indexmap::IndexMap;
use serde::Serialize;
use tracing::debug;

use crate::config::CatalogConfig;

/// Segments of one multi-part item seen in a batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SegmentGroup {
    pub base: ContentPath,
    pub segments: BTreeMap<u32, u64>,
    /// Whether the full-item segment was part of the batch.
    pub full_item_seen: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RejectedKey {
    pub raw: String,
    pub value: u64,
    pub reason: &'static str,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NormalizedBatch {
    pub content: CountTable<ContentPath>,
    pub links: CountTable<LinkKey>,
    pub segment_groups: Vec<SegmentGroup>,
    pub rejected: Vec<RejectedKey>,
}

impl NormalizedBatch {
    /// Groups whose batch lacked the full-item segment.
    pub fn partial_groups(&self) -> impl Iterator<Item = &SegmentGroup> {
        self.segment_groups.iter().filter(|g| !g.full_item_seen)
    }
}

#[derive(Debug, Clone)]
pub struct KeyNormalizer {
    link_prefixes: Vec<String>,
    segmented_prefixes: Vec<String>,
    full_item_segment: u32,
}

impl KeyNormalizer {
    pub fn new(
        link_prefixes: Vec<String>,
        segmented_prefixes: Vec<String>,
        full_item_segment: u32,
    ) -> Self {
        Self {
            link_prefixes,
            segmented_prefixes,
            full_item_segment,
        }
    }

    pub fn from_catalog(catalog: &CatalogConfig) -> Self {
        Self::new(
            catalog.link_prefixes.clone(),
            catalog.segmented_prefixes.clone(),
            catalog.full_item_segment,
        )
    }

    pub fn is_link(&self, raw_key: &str) -> bool {
        raw_key.contains(':') || self.link_prefixes.iter().any(|p| raw_key.starts_with(p))
    }

    fn split_segment<'a>(&self, raw_key: &'a str) -> Option<(&'a str, u32)> {
        let (base, suffix) = raw_key.rsplit_once('#')?;
        if suffix.is_empty() || !suffix.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        if !self.segmented_prefixes.iter().any(|p| base.starts_with(p)) {
            return None;
        }
        Some((base, suffix.parse().ok()?))
    }

    pub fn normalize(&self, raw_key: &str) -> NormalizedKey {
        if self.is_link(raw_key) {
            return NormalizedKey::Link(LinkKey::new(raw_key));
        }
        if let Some((base, index)) = self.split_segment(raw_key) {
            return match ContentPath::new(base) {
                Some(base) => NormalizedKey::Segment { base, index },
                None => NormalizedKey::Rejected {
                    raw: raw_key.to_string(),
                    reason: "segment base is not a valid content path",
                },
            };
        }
        match ContentPath::new(raw_key) {
            Some(path) => NormalizedKey::Content(path),
            None => NormalizedKey::Rejected {
                raw: raw_key.to_string(),
                reason: "not a valid content path",
            },
        }
    }

    /// Classifies and sums a batch of raw item rows.
    ///
    /// Every segment of a multi-part item accrues to its base path, whether or
    /// not the full-item segment is present; nothing is discarded. Row order of
    /// the result follows the first appearance of each output key.
    pub fn normalize_items<I>(&self, rows: I) -> Result<NormalizedBatch, InvariantViolation>
    where
        I: IntoIterator<Item = (String, i64)>,
    {
        let validated = rows
            .into_iter()
            .map(|(key, value)| match u64::try_from(value) {
                Ok(value) => Ok((key, value)),
                Err(_) => Err(InvariantViolation::NegativeCount { key, value }),
            })
            .collect::<Result<Vec<_>, _>>()?;
        self.normalize_counts(validated)
    }

    /// Same as [`KeyNormalizer::normalize_items`] for rows that are already
    /// non-negative, such as archive tables.
    pub fn normalize_counts<S, I>(&self, rows: I) -> Result<NormalizedBatch, InvariantViolation>
    where
        S: AsRef<str>,
        I: IntoIterator<Item = (S, u64)>,
    {
        let mut batch = NormalizedBatch::default();
        let mut groups: IndexMap<ContentPath, SegmentGroup> = IndexMap::new();

        for (raw_key, value) in rows {
            match self.normalize(raw_key.as_ref()) {
                NormalizedKey::Link(link) => batch.links.add(link, value)?,
                NormalizedKey::Content(path) => batch.content.add(path, value)?,
                NormalizedKey::Segment { base, index } => {
                    batch.content.add(base.clone(), value)?;
                    let group = groups.entry(base.clone()).or_insert_with(|| SegmentGroup {
                        base,
                        segments: BTreeMap::new(),
                        full_item_seen: false,
                    });
                    let slot = group.segments.entry(index).or_insert(0);
                    *slot = slot.saturating_add(value);
                    group.full_item_seen |= index == self.full_item_segment;
                }
                NormalizedKey::Rejected { raw, reason } => {
                    batch.rejected.push(RejectedKey { raw, value, reason });
                }
            }
        }

        batch.segment_groups = groups.into_values().collect();
        for group in batch.partial_groups() {
            debug!(
                base = %group.base,
                segments = group.segments.len(),
                "segment group without full-item row, kept as aggregate"
            );
        }
        Ok(batch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn normalizer() -> KeyNormalizer {
        KeyNormalizer::from_catalog(&CatalogConfig::default())
    }

    fn rows(items: &[(&str, i64)]) -> Vec<(String, i64)> {
        items.iter().map(|(k, v)| (k.to_string(), *v)).collect()
    }

    #[test]
    fn full_item_and_other_segments_merge_into_base() {
        let batch = normalizer()
            .normalize_items(rows(&[("av/x#10", 3), ("av/x#7", 2)]))
            .unwrap();
        assert_eq!(batch.content.get("av/x"), Some(5));
        assert_eq!(batch.content.len(), 1);
        assert!(batch.partial_groups().next().is_none());
    }

    #[test]
    fn segments_without_full_item_are_kept() {
        let batch = normalizer()
            .normalize_items(rows(&[("av/x#7", 2)]))
            .unwrap();
        assert_eq!(batch.content.get("av/x"), Some(2));
        let partial: Vec<_> = batch.partial_groups().collect();
        assert_eq!(partial.len(), 1);
        assert_eq!(partial[0].segments.get(&7), Some(&2));
    }

    #[test]
    fn bare_base_row_merges_with_its_segments() {
        let batch = normalizer()
            .normalize_items(rows(&[("av/x", 1), ("av/x#10", 4)]))
            .unwrap();
        assert_eq!(batch.content.get("av/x"), Some(5));
    }

    #[test]
    fn links_never_reach_content() {
        let batch = normalizer()
            .normalize_items(rows(&[
                ("tags/foo", 3),
                ("https://example.org/paper.pdf", 2),
                ("canon/sn1", 1),
            ]))
            .unwrap();
        assert!(!batch.content.contains_key("tags/foo"));
        assert!(!batch.content.contains_key("https://example.org/paper.pdf"));
        assert_eq!(batch.links.get("tags/foo"), Some(3));
        assert_eq!(batch.links.get("https://example.org/paper.pdf"), Some(2));
        assert_eq!(batch.content.get("canon/sn1"), Some(1));
    }

    #[test]
    fn hash_outside_segmented_prefixes_passes_through() {
        let n = normalizer();
        assert_eq!(
            n.normalize("canon/sn1#10"),
            NormalizedKey::Content(ContentPath::new("canon/sn1#10").unwrap())
        );
        assert_eq!(
            n.normalize("av/x#intro"),
            NormalizedKey::Content(ContentPath::new("av/x#intro").unwrap())
        );
    }

    #[test]
    fn first_seen_key_fixes_row_position() {
        let batch = normalizer()
            .normalize_items(rows(&[("canon/b", 1), ("av/x#3", 1), ("canon/a", 1), ("av/x#10", 1)]))
            .unwrap();
        let order: Vec<_> = batch.content.keys().map(|k| k.to_string()).collect();
        assert_eq!(order, vec!["canon/b", "av/x", "canon/a"]);
    }

    #[test]
    fn negative_values_are_rejected() {
        let err = normalizer()
            .normalize_items(rows(&[("canon/a", -1)]))
            .unwrap_err();
        assert_eq!(
            err,
            InvariantViolation::NegativeCount {
                key: "canon/a".into(),
                value: -1
            }
        );
    }

    #[test]
    fn invalid_paths_are_reported_not_counted() {
        let batch = normalizer()
            .normalize_items(rows(&[("canon/../x", 4), ("", 1)]))
            .unwrap();
        assert!(batch.content.is_empty());
        assert_eq!(batch.rejected.len(), 2);
    }

    #[test]
    fn zero_values_are_retained() {
        let batch = normalizer()
            .normalize_items(rows(&[("canon/a", 0)]))
            .unwrap();
        assert_eq!(batch.content.get("canon/a"), Some(0));
    }

    fn mixed_rows() -> impl Strategy<Value = Vec<(String, i64)>> {
        let keys = prop::sample::select(vec![
            "av/x#10",
            "av/x#7",
            "av/x",
            "av/y#3",
            "tags/t",
            "https://e.org/p",
            "canon/a",
            "canon/b",
            "canon/../bad",
        ]);
        prop::collection::vec((keys, 0i64..1_000), 0..32).prop_map(|rows| {
            rows.into_iter()
                .map(|(k, v)| (k.to_string(), v))
                .collect()
        })
    }

    fn shuffled(rows: &[(String, i64)], seed: u64) -> Vec<(String, i64)> {
        let mut out = rows.to_vec();
        let mut state = seed;
        for i in (1..out.len()).rev() {
            state = state.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
            let j = (state >> 33) as usize % (i + 1);
            out.swap(i, j);
        }
        out
    }

    type GroupsByBase = BTreeMap<String, (BTreeMap<u32, u64>, bool)>;

    fn groups_by_base(batch: &NormalizedBatch) -> GroupsByBase {
        batch
            .segment_groups
            .iter()
            .map(|g| (g.base.to_string(), (g.segments.clone(), g.full_item_seen)))
            .collect()
    }

    proptest! {
        #[test]
        fn row_order_never_changes_normalized_totals(rows in mixed_rows(), seed in any::<u64>()) {
            let n = normalizer();
            let a = n.normalize_items(rows.clone()).unwrap();
            let b = n.normalize_items(shuffled(&rows, seed)).unwrap();
            prop_assert_eq!(&a.content, &b.content);
            prop_assert_eq!(&a.links, &b.links);
            prop_assert_eq!(groups_by_base(&a), groups_by_base(&b));
            prop_assert_eq!(a.rejected.len(), b.rejected.len());
        }
    }
}
