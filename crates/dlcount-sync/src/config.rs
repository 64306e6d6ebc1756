use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{NaiveDate, Utc};
use dlcount_core::ReconcileError;
use serde::{Deserialize, Serialize};
use tracing::info;

/// Run-wide settings, constructed once and handed to the pipeline.
#[derive(Debug, Clone)]
pub struct ReconcileConfig {
    pub data_dir: PathBuf,
    pub artifacts_dir: PathBuf,
    pub reports_dir: PathBuf,
    pub dest_dir: PathBuf,
    pub today: NaiveDate,
    pub archive_lag_days: u32,
    pub topup_lag_days: u32,
    pub ga4_property_id: Option<String>,
    pub search_console_site: String,
    pub access_token: Option<String>,
    pub fixtures_dir: Option<PathBuf>,
    pub user_agent: String,
    pub http_timeout_secs: u64,
}

impl ReconcileConfig {
    pub fn from_env() -> Result<Self> {
        let today = match std::env::var("DLCOUNT_TODAY") {
            Ok(raw) => NaiveDate::parse_from_str(raw.trim(), "%Y-%m-%d").map_err(|err| {
                ReconcileError::Configuration(format!("DLCOUNT_TODAY={raw} is not YYYY-MM-DD: {err}"))
            })?,
            Err(_) => Utc::now().date_naive(),
        };
        Ok(Self {
            data_dir: std::env::var("DLCOUNT_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./data")),
            artifacts_dir: std::env::var("ARTIFACTS_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./artifacts")),
            reports_dir: std::env::var("DLCOUNT_REPORTS_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./reports")),
            dest_dir: PathBuf::from("./build"),
            today,
            archive_lag_days: env_number("DLCOUNT_ARCHIVE_LAG_DAYS", 7)?,
            topup_lag_days: env_number("DLCOUNT_TOPUP_LAG_DAYS", 2)?,
            ga4_property_id: non_empty_env("GA4_PROPERTY_ID"),
            search_console_site: std::env::var("SEARCH_CONSOLE_SITE")
                .unwrap_or_else(|_| "sc-domain:buddhistuniversity.net".to_string()),
            access_token: non_empty_env("GOOGLE_ACCESS_TOKEN"),
            fixtures_dir: non_empty_env("DLCOUNT_FIXTURES_DIR").map(PathBuf::from),
            user_agent: std::env::var("DLCOUNT_USER_AGENT")
                .unwrap_or_else(|_| "dlcount/0.1".to_string()),
            http_timeout_secs: env_number("DLCOUNT_HTTP_TIMEOUT_SECS", 60)?,
        })
    }

    /// Defaults rooted in `root`, without consulting the environment.
    pub fn rooted_at(root: impl AsRef<Path>, today: NaiveDate) -> Self {
        let root = root.as_ref();
        Self {
            data_dir: root.join("data"),
            artifacts_dir: root.join("artifacts"),
            reports_dir: root.join("reports"),
            dest_dir: root.join("build"),
            today,
            archive_lag_days: 7,
            topup_lag_days: 2,
            ga4_property_id: None,
            search_console_site: "sc-domain:buddhistuniversity.net".to_string(),
            access_token: None,
            fixtures_dir: None,
            user_agent: "dlcount/0.1".to_string(),
            http_timeout_secs: 60,
        }
    }

    pub fn with_dest(mut self, dest_dir: impl Into<PathBuf>) -> Self {
        self.dest_dir = dest_dir.into();
        self
    }

    pub fn layout(&self) -> DataLayout {
        DataLayout::new(&self.data_dir)
    }

    pub fn load_catalog(&self) -> Result<CatalogConfig> {
        CatalogConfig::load(&self.layout().catalog)
    }
}

fn non_empty_env(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn env_number<T: std::str::FromStr>(name: &str, default: T) -> Result<T> {
    parse_number(name, std::env::var(name).ok().as_deref(), default)
}

/// Unset or blank means `default`; anything else must parse.
fn parse_number<T: std::str::FromStr>(name: &str, raw: Option<&str>, default: T) -> Result<T> {
    match raw.map(str::trim).filter(|v| !v.is_empty()) {
        None => Ok(default),
        Some(value) => value.parse().map_err(|_| {
            ReconcileError::Configuration(format!("{name}={value} is not a valid number")).into()
        }),
    }
}

/// File locations inside the data directory.
#[derive(Debug, Clone)]
pub struct DataLayout {
    pub root: PathBuf,
    pub watermarks: PathBuf,
    pub purchase_archive: PathBuf,
    pub referral_archive: PathBuf,
    pub url_mapping: PathBuf,
    pub catalog: PathBuf,
}

impl DataLayout {
    pub const PURCHASE_KEY: &'static str = "itemId";
    pub const PURCHASE_VALUE: &'static str = "totalPurchasers";
    pub const REFERRAL_KEY: &'static str = "url";
    pub const REFERRAL_VALUE: &'static str = "clicks";

    pub fn new(root: impl AsRef<Path>) -> Self {
        let root = root.as_ref().to_path_buf();
        Self {
            watermarks: root.join("watermarks.yaml"),
            purchase_archive: root.join("purchase_archive.csv"),
            referral_archive: root.join("referral_archive.csv"),
            url_mapping: root.join("url_mapping.csv"),
            catalog: root.join("catalog.yaml"),
            root,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrefixRewrite {
    pub from: String,
    pub to: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FixedRoute {
    pub contains: String,
    pub path: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LegacyStaticConfig {
    pub file: String,
    pub key_column: String,
    pub value_column: String,
}

impl Default for LegacyStaticConfig {
    fn default() -> Self {
        Self {
            file: "legacy_static.csv".to_string(),
            key_column: "Page".to_string(),
            value_column: "SCALED EVENTS".to_string(),
        }
    }
}

/// Catalog rules from `catalog.yaml`; every field falls back to the built-in default.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CatalogConfig {
    pub buckets: Vec<String>,
    /// Search-referral path filter, `{bucket}` is substituted per bucket.
    pub referral_filter: String,
    pub link_prefixes: Vec<String>,
    pub segmented_prefixes: Vec<String>,
    pub full_item_segment: u32,
    pub prefix_rewrites: Vec<PrefixRewrite>,
    pub fixed_routes: Vec<FixedRoute>,
    pub legacy_static: Option<LegacyStaticConfig>,
}

impl Default for CatalogConfig {
    fn default() -> Self {
        Self {
            buckets: [
                "canon",
                "articles",
                "av",
                "booklets",
                "essays",
                "excerpts",
                "monographs",
                "papers",
                "reference",
            ]
            .into_iter()
            .map(String::from)
            .collect(),
            referral_filter: "/content/{bucket}/".to_string(),
            link_prefixes: vec!["tags/".to_string()],
            segmented_prefixes: vec!["av/".to_string()],
            full_item_segment: 10,
            prefix_rewrites: vec![PrefixRewrite {
                from: "/smallpdfs/".to_string(),
                to: "/content/".to_string(),
            }],
            fixed_routes: vec![FixedRoute {
                contains: "dhammapada-multilingual".to_string(),
                path: "canon/khuddaka/dhammapada_multilingual".to_string(),
            }],
            legacy_static: Some(LegacyStaticConfig::default()),
        }
    }
}

impl CatalogConfig {
    /// Reads `path`; a missing file means built-in defaults.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            info!(path = %path.display(), "no catalog file, using built-in catalog rules");
            return Ok(Self::default());
        }
        let text =
            std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
        serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
    }

    /// One filter per bucket, plus one per alternate prefix that rewrites onto
    /// the filter, so `/smallpdfs/canon/` urls are fetched alongside `/content/canon/`.
    pub fn referral_filters(&self) -> Vec<String> {
        let mut filters: Vec<String> = Vec::new();
        for bucket in &self.buckets {
            let filter = self.referral_filter.replace("{bucket}", bucket);
            let alternates: Vec<String> = self
                .prefix_rewrites
                .iter()
                .filter(|rewrite| !rewrite.to.is_empty() && filter.contains(&rewrite.to))
                .map(|rewrite| filter.replacen(&rewrite.to, &rewrite.from, 1))
                .collect();
            for candidate in std::iter::once(filter).chain(alternates) {
                if !filters.contains(&candidate) {
                    filters.push(candidate);
                }
            }
        }
        filters
    }

    /// Legacy snapshot file and its column names, when one is configured.
    pub fn legacy_static_source(
        &self,
        layout: &DataLayout,
    ) -> Option<(PathBuf, &LegacyStaticConfig)> {
        self.legacy_static
            .as_ref()
            .map(|legacy| (layout.root.join(&legacy.file), legacy))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn partial_catalog_file_keeps_remaining_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("catalog.yaml");
        std::fs::write(&path, "buckets: [canon, papers]\nlegacy_static: null\n").unwrap();

        let catalog = CatalogConfig::load(&path).unwrap();
        assert_eq!(catalog.buckets, vec!["canon".to_string(), "papers".to_string()]);
        assert_eq!(catalog.full_item_segment, 10);
        assert_eq!(catalog.link_prefixes, vec!["tags/".to_string()]);
        assert!(catalog.legacy_static.is_none());
    }

    #[test]
    fn missing_catalog_file_means_defaults() {
        let dir = tempdir().unwrap();
        let catalog = CatalogConfig::load(&dir.path().join("catalog.yaml")).unwrap();
        assert_eq!(catalog, CatalogConfig::default());
        assert_eq!(catalog.buckets.len(), 9);
    }

    #[test]
    fn referral_filters_expand_per_bucket() {
        let catalog = CatalogConfig {
            buckets: vec!["canon".into(), "av".into()],
            ..CatalogConfig::default()
        };
        assert_eq!(
            catalog.referral_filters(),
            vec![
                "/content/canon/".to_string(),
                "/smallpdfs/canon/".to_string(),
                "/content/av/".to_string(),
                "/smallpdfs/av/".to_string(),
            ]
        );
    }

    #[test]
    fn prefix_neutral_filter_has_no_alternates() {
        let catalog = CatalogConfig {
            buckets: vec!["canon".into(), "papers".into()],
            referral_filter: "/{bucket}/".to_string(),
            ..CatalogConfig::default()
        };
        assert_eq!(
            catalog.referral_filters(),
            vec!["/canon/".to_string(), "/papers/".to_string()]
        );
    }

    #[test]
    fn legacy_source_is_resolved_inside_the_data_dir() {
        let layout = DataLayout::new("/srv/data");
        let catalog = CatalogConfig::default();
        let (path, legacy) = catalog.legacy_static_source(&layout).unwrap();
        assert_eq!(path, PathBuf::from("/srv/data/legacy_static.csv"));
        assert_eq!(legacy.value_column, "SCALED EVENTS");
    }

    #[test]
    fn numeric_settings_fall_back_only_when_unset() {
        assert_eq!(parse_number::<u32>("DLCOUNT_ARCHIVE_LAG_DAYS", None, 7).unwrap(), 7);
        assert_eq!(parse_number::<u32>("DLCOUNT_ARCHIVE_LAG_DAYS", Some(" "), 7).unwrap(), 7);
        assert_eq!(parse_number::<u32>("DLCOUNT_ARCHIVE_LAG_DAYS", Some(" 3 "), 7).unwrap(), 3);

        let err = parse_number::<u64>("DLCOUNT_HTTP_TIMEOUT_SECS", Some("sixty"), 60).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ReconcileError>(),
            Some(ReconcileError::Configuration(message)) if message.contains("DLCOUNT_HTTP_TIMEOUT_SECS=sixty")
        ));
        assert!(parse_number::<u32>("DLCOUNT_TOPUP_LAG_DAYS", Some("-2"), 2).is_err());
    }
}
