//! Additive merge of counts across sources and data vintages.

use std::collections::BTreeMap;
use std::fmt::Display;
use std::hash::Hash;

use dlcount_core::{CountTable, InvariantViolation, ResolvedCounts};
use tracing::debug;

/// Returns `existing` plus every incoming value, keyed additively.
///
/// Incoming values are validated before anything is summed, so a negative value
/// fails the whole call. Zero values still create their row.
pub fn accumulate<K, I>(existing: &CountTable<K>, incoming: I) -> Result<CountTable<K>, InvariantViolation>
where
    K: Hash + Eq + Clone + Display,
    I: IntoIterator<Item = (K, i64)>,
{
    let incoming = incoming
        .into_iter()
        .map(|(key, value)| match u64::try_from(value) {
            Ok(value) => Ok((key, value)),
            Err(_) => Err(InvariantViolation::NegativeCount {
                key: key.to_string(),
                value,
            }),
        })
        .collect::<Result<Vec<_>, _>>()?;

    let mut merged = existing.clone();
    for (key, value) in incoming {
        merged.add(key, value)?;
    }
    Ok(merged)
}

/// Sum of two already validated tables; rows of `left` keep their positions.
pub fn merge_tables<K>(left: &CountTable<K>, right: &CountTable<K>) -> Result<CountTable<K>, InvariantViolation>
where
    K: Hash + Eq + Clone + Display,
{
    let mut merged = left.clone();
    for (key, value) in right.iter() {
        merged.add(key.clone(), value)?;
    }
    Ok(merged)
}

pub fn merge_resolved(left: &ResolvedCounts, right: &ResolvedCounts) -> Result<ResolvedCounts, InvariantViolation> {
    Ok(ResolvedCounts {
        content: merge_tables(&left.content, &right.content)?,
        links: merge_tables(&left.links, &right.links)?,
    })
}

/// Unions per-filter referral results. A URL matched by more than one filter is
/// the same measurement reported twice, so only its first value is kept.
pub fn union_referral_batches<I>(batches: I) -> Vec<(String, i64)>
where
    I: IntoIterator<Item = (String, BTreeMap<String, i64>)>,
{
    let mut seen: BTreeMap<String, String> = BTreeMap::new();
    let mut rows = Vec::new();
    for (filter, batch) in batches {
        for (url, clicks) in batch {
            if let Some(first_filter) = seen.get(&url) {
                debug!(%url, %filter, %first_filter, "url matched by several referral filters");
                continue;
            }
            seen.insert(url.clone(), filter.clone());
            rows.push((url, clicks));
        }
    }
    rows
}
