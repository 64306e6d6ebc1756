//! Search-referral URL to content-path resolution.

use std::collections::HashMap;

use anyhow::{bail, Result};
use dlcount_core::{ContentPath, CountTable, InvariantViolation};
use serde::Serialize;
use strsim::jaro_winkler;
use tracing::warn;

use crate::config::{CatalogConfig, FixedRoute, PrefixRewrite};

/// Minimum Jaro-Winkler score for a mapping key to be offered as a suggestion.
const SUGGESTION_THRESHOLD: f64 = 0.9;

/// Percent-encodes the characters the search provider leaves raw but the
/// mapping table stores encoded, then applies the alternate-prefix rewrites.
pub fn normalize_url(url: &str, rewrites: &[PrefixRewrite]) -> String {
    let mut out = String::with_capacity(url.len() + 6);
    for c in url.trim().chars() {
        match c {
            '\'' => out.push_str("%27"),
            '(' => out.push_str("%28"),
            ')' => out.push_str("%29"),
            _ => out.push(c),
        }
    }
    for rewrite in rewrites {
        if out.contains(&rewrite.from) {
            out = out.replacen(&rewrite.from, &rewrite.to, 1);
        }
    }
    out
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UnresolvedReason {
    NotInMapping,
}

/// Diagnostic for a URL that could not be attributed to any content path.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Unresolved {
    pub url: String,
    pub normalized: String,
    pub reason: UnresolvedReason,
    pub closest: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    Resolved(ContentPath),
    Unresolved(Unresolved),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UnresolvedClicks {
    #[serde(flatten)]
    pub diagnostic: Unresolved,
    pub clicks: u64,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResolvedClicks {
    pub content: CountTable<ContentPath>,
    pub unresolved: Vec<UnresolvedClicks>,
}

impl ResolvedClicks {
    pub fn unresolved_clicks(&self) -> u64 {
        self.unresolved.iter().map(|u| u.clicks).sum()
    }
}

#[derive(Debug, Clone)]
pub struct UrlResolver {
    mapping: HashMap<String, ContentPath>,
    rewrites: Vec<PrefixRewrite>,
    fixed_routes: Vec<(String, ContentPath)>,
}

impl UrlResolver {
    /// Builds the lookup from `url,path` rows. Keys go through the same URL
    /// normalization as incoming URLs.
    pub fn new(rows: Vec<(String, String)>, catalog: &CatalogConfig) -> Result<Self> {
        let rewrites = catalog.prefix_rewrites.clone();
        let mut mapping = HashMap::with_capacity(rows.len());
        for (url, path) in rows {
            let Some(target) = ContentPath::new(&path) else {
                bail!("url mapping row for {url} has invalid content path `{path}`");
            };
            mapping.insert(normalize_url(&url, &rewrites), target);
        }
        let fixed_routes = catalog
            .fixed_routes
            .iter()
            .map(|FixedRoute { contains, path }| match ContentPath::new(path) {
                Some(target) => Ok((contains.clone(), target)),
                None => bail!("fixed route for `{contains}` has invalid content path `{path}`"),
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            mapping,
            rewrites,
            fixed_routes,
        })
    }

    pub fn len(&self) -> usize {
        self.mapping.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mapping.is_empty()
    }

    pub fn resolve(&self, url: &str) -> Resolution {
        if let Some((_, target)) = self
            .fixed_routes
            .iter()
            .find(|(slug, _)| url.contains(slug.as_str()))
        {
            return Resolution::Resolved(target.clone());
        }
        let normalized = normalize_url(url, &self.rewrites);
        match self.mapping.get(&normalized) {
            Some(target) => Resolution::Resolved(target.clone()),
            None => Resolution::Unresolved(Unresolved {
                url: url.to_string(),
                closest: self.closest_key(&normalized),
                normalized,
                reason: UnresolvedReason::NotInMapping,
            }),
        }
    }

    fn closest_key(&self, normalized: &str) -> Option<String> {
        self.mapping
            .keys()
            .map(|key| (jaro_winkler(normalized, key), key))
            .filter(|(score, _)| *score >= SUGGESTION_THRESHOLD)
            .max_by(|a, b| a.0.total_cmp(&b.0).then_with(|| b.1.cmp(a.1)))
            .map(|(_, key)| key.clone())
    }

    /// Attributes every URL's clicks to its content path. Unresolved URLs are
    /// logged and collected; they contribute nothing to the content totals.
    pub fn resolve_clicks<'a, I>(&self, clicks: I) -> Result<ResolvedClicks, InvariantViolation>
    where
        I: IntoIterator<Item = (&'a String, u64)>,
    {
        let mut resolved = ResolvedClicks::default();
        for (url, value) in clicks {
            match self.resolve(url) {
                Resolution::Resolved(path) => resolved.content.add(path, value)?,
                Resolution::Unresolved(diagnostic) => {
                    warn!(
                        url = %diagnostic.url,
                        clicks = value,
                        closest = diagnostic.closest.as_deref().unwrap_or("-"),
                        "unresolved referral url; update the url mapping table"
                    );
                    resolved.unresolved.push(UnresolvedClicks {
                        diagnostic,
                        clicks: value,
                    });
                }
            }
        }
        Ok(resolved)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SITE: &str = "https://buddhistuniversity.net";

    fn resolver() -> UrlResolver {
        let rows = vec![
            (
                format!("{SITE}/content/articles/the-buddha%27s-way"),
                "articles/the-buddha's-way".to_string(),
            ),
            (
                format!("{SITE}/content/papers/jhana%28s%29"),
                "papers/jhanas".to_string(),
            ),
            (
                format!("{SITE}/content/canon/sn1"),
                "canon/sn1".to_string(),
            ),
        ];
        UrlResolver::new(rows, &CatalogConfig::default()).unwrap()
    }

    fn path(p: &str) -> Resolution {
        Resolution::Resolved(ContentPath::new(p).unwrap())
    }

    #[test]
    fn raw_quote_and_parens_resolve_like_encoded_forms() {
        let r = resolver();
        assert_eq!(
            r.resolve(&format!("{SITE}/content/articles/the-buddha's-way")),
            r.resolve(&format!("{SITE}/content/articles/the-buddha%27s-way"))
        );
        assert_eq!(
            r.resolve(&format!("{SITE}/content/papers/jhana(s)")),
            path("papers/jhanas")
        );
    }

    #[test]
    fn alternate_prefix_is_rewritten() {
        assert_eq!(
            resolver().resolve(&format!("{SITE}/smallpdfs/canon/sn1")),
            path("canon/sn1")
        );
    }

    #[test]
    fn fixed_route_wins_over_the_table() {
        assert_eq!(
            resolver().resolve(&format!("{SITE}/content/canon/dhammapada-multilingual.pdf")),
            path("canon/khuddaka/dhammapada_multilingual")
        );
    }

    #[test]
    fn unknown_url_is_unresolved_with_a_suggestion() {
        let url = format!("{SITE}/content/canon/sn2");
        match resolver().resolve(&url) {
            Resolution::Unresolved(diag) => {
                assert_eq!(diag.url, url);
                assert_eq!(diag.reason, UnresolvedReason::NotInMapping);
                assert_eq!(diag.closest, Some(format!("{SITE}/content/canon/sn1")));
            }
            other => panic!("expected unresolved, got {other:?}"),
        }
    }

    #[test]
    fn unresolved_clicks_are_dropped_from_totals_only() {
        let mut clicks = CountTable::new();
        clicks.add(format!("{SITE}/content/canon/sn1"), 5).unwrap();
        clicks.add(format!("{SITE}/nowhere"), 3).unwrap();

        let resolved = resolver().resolve_clicks(clicks.iter()).unwrap();
        assert_eq!(resolved.content.total(), 5);
        assert_eq!(resolved.unresolved_clicks(), 3);
        assert_eq!(resolved.content.total() + resolved.unresolved_clicks(), clicks.total());
    }

    #[test]
    fn invalid_mapping_target_is_an_error() {
        let rows = vec![(format!("{SITE}/x"), "../x".to_string())];
        assert!(UrlResolver::new(rows, &CatalogConfig::default()).is_err());
    }
}
