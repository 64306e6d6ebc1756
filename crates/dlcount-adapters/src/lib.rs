//! Report client contracts + GA4 / Search Console / fixture implementations.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use dlcount_core::{DateWindow, RawObservation, SourceId};
use dlcount_storage::{ArtifactStore, FetchError, HttpFetcher};
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;
use tracing::{debug, info};
use uuid::Uuid;

pub const CRATE_NAME: &str = "dlcount-adapters";

pub const GA4_DEFAULT_ENDPOINT: &str = "https://analyticsdata.googleapis.com";
pub const SEARCH_CONSOLE_DEFAULT_ENDPOINT: &str = "https://www.googleapis.com/webmasters/v3/";

/// GA4 caps a single runReport page at 250k rows.
pub const GA4_PAGE_LIMIT: u64 = 250_000;
/// Search Console caps a single query page at 25k rows; 10k keeps responses small.
pub const SEARCH_CONSOLE_ROW_LIMIT: u64 = 10_000;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchContext {
    pub run_id: Uuid,
    pub fetched_at: DateTime<Utc>,
}

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("{0}")]
    Message(String),
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("decoding provider response: {0}")]
    Decode(#[from] serde_json::Error),
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

/// Purchase-event report: item identifier -> purchaser count.
#[async_trait]
pub trait PurchaseReportClient: Send + Sync {
    async fn fetch(
        &self,
        ctx: &FetchContext,
        window: DateWindow,
    ) -> Result<Vec<RawObservation>, AdapterError>;
}

/// Search-referral report: url -> clicks, restricted to urls containing `path_filter`.
#[async_trait]
pub trait SearchReferralClient: Send + Sync {
    async fn fetch(
        &self,
        ctx: &FetchContext,
        window: DateWindow,
        path_filter: &str,
    ) -> Result<BTreeMap<String, i64>, AdapterError>;
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunReportResponse {
    #[serde(default)]
    pub dimension_headers: Vec<NamedHeader>,
    #[serde(default)]
    pub metric_headers: Vec<NamedHeader>,
    #[serde(default)]
    pub rows: Vec<RunReportRow>,
    #[serde(default)]
    pub row_count: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NamedHeader {
    pub name: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunReportRow {
    #[serde(default)]
    pub dimension_values: Vec<ReportValue>,
    #[serde(default)]
    pub metric_values: Vec<ReportValue>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReportValue {
    #[serde(default)]
    pub value: String,
}

/// Extracts `(dimension, metric)` pairs from one runReport page. A page without
/// rows is an empty report.
pub fn run_report_observations(
    report: &RunReportResponse,
    dimension: &str,
    metric: &str,
) -> Result<Vec<RawObservation>, AdapterError> {
    if report.rows.is_empty() {
        return Ok(Vec::new());
    }
    let dim_idx = report
        .dimension_headers
        .iter()
        .position(|h| h.name == dimension)
        .ok_or_else(|| AdapterError::Message(format!("report has no `{dimension}` dimension")))?;
    let metric_idx = report
        .metric_headers
        .iter()
        .position(|h| h.name == metric)
        .ok_or_else(|| AdapterError::Message(format!("report has no `{metric}` metric")))?;

    report
        .rows
        .iter()
        .map(|row| -> Result<RawObservation, AdapterError> {
            let key = row
                .dimension_values
                .get(dim_idx)
                .map(|v| v.value.clone())
                .ok_or_else(|| AdapterError::Message("row is missing its dimension value".into()))?;
            let raw = row
                .metric_values
                .get(metric_idx)
                .map(|v| v.value.as_str())
                .ok_or_else(|| AdapterError::Message(format!("row {key} is missing {metric}")))?;
            let value = raw.parse::<i64>().map_err(|_| {
                AdapterError::Message(format!("{metric} for {key} is not an integer: {raw}"))
            })?;
            Ok(RawObservation::new(key, value))
        })
        .collect()
}

/// GA4 getMetadata response.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PropertyMetadata {
    #[serde(default)]
    pub dimensions: Vec<DimensionMetadata>,
    #[serde(default)]
    pub metrics: Vec<MetricMetadata>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DimensionMetadata {
    pub api_name: String,
    pub ui_name: String,
    pub description: String,
    pub category: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MetricMetadata {
    pub api_name: String,
    pub ui_name: String,
    pub description: String,
    pub category: String,
    #[serde(rename = "type")]
    pub metric_type: String,
    pub deprecated_api_names: Vec<String>,
}

const LISTING_WIDTH: usize = 60;
const LISTING_INDENT: &str = "  ";

/// Greedy word wrap at `LISTING_WIDTH` columns, indent included. Words longer
/// than a line are kept whole.
fn wrap_description(text: &str) -> String {
    let mut lines: Vec<String> = Vec::new();
    let mut line = String::new();
    for word in text.split_whitespace() {
        if !line.is_empty() && line.len() + 1 + word.len() > LISTING_WIDTH {
            lines.push(std::mem::take(&mut line));
        }
        if line.is_empty() {
            line.push_str(LISTING_INDENT);
        } else {
            line.push(' ');
        }
        line.push_str(word);
    }
    if !line.is_empty() {
        lines.push(line);
    }
    lines.join("\n")
}

/// Plain-text listing of every metric, as written to `<property>_metrics.txt`.
pub fn render_metrics_listing(metadata: &PropertyMetadata) -> String {
    let mut out = String::from("ALL METRICS UNDERSTOOD BY THE GOOGLE ANALYTICS API\n");
    out.push_str(&"-".repeat(50));
    out.push('\n');
    for metric in &metadata.metrics {
        out.push_str(&format!("\n# {}\n", metric.ui_name));
        out.push_str(&wrap_description(&metric.description));
        out.push_str(&format!(
            "\n\n  USE: {} is a {} metric of {}\n",
            metric.api_name, metric.category, metric.metric_type
        ));
        if let Some(previous) = metric.deprecated_api_names.first() {
            out.push_str(&format!(
                "  ({} used to be known as {})\n",
                metric.api_name, previous
            ));
        }
        out.push('\n');
    }
    out
}

/// Plain-text listing of every dimension, as written to `<property>_dimensions.txt`.
pub fn render_dimensions_listing(metadata: &PropertyMetadata) -> String {
    let mut out = String::from("ALL DIMENSIONS UNDERSTOOD BY THE GOOGLE ANALYTICS API\n");
    out.push_str(&"-".repeat(53));
    out.push('\n');
    for dimension in &metadata.dimensions {
        out.push_str(&format!("\n# {}\n", dimension.ui_name));
        out.push_str(&wrap_description(&dimension.description));
        out.push_str(&format!(
            "\n\n  USE: {} is a {} dimension.\n\n",
            dimension.api_name, dimension.category
        ));
    }
    out
}

pub struct Ga4PurchaseClient {
    http: Arc<HttpFetcher>,
    endpoint: String,
    property_id: String,
    access_token: String,
    artifacts: Option<ArtifactStore>,
}

impl Ga4PurchaseClient {
    pub fn new(http: Arc<HttpFetcher>, property_id: String, access_token: String) -> Self {
        Self {
            http,
            endpoint: GA4_DEFAULT_ENDPOINT.to_string(),
            property_id,
            access_token,
            artifacts: None,
        }
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }

    pub fn with_artifacts(mut self, artifacts: ArtifactStore) -> Self {
        self.artifacts = Some(artifacts);
        self
    }

    fn report_url(&self) -> String {
        format!(
            "{}/v1beta/properties/{}:runReport",
            self.endpoint.trim_end_matches('/'),
            self.property_id
        )
    }

    fn metadata_url(&self) -> String {
        format!(
            "{}/v1beta/properties/{}/metadata",
            self.endpoint.trim_end_matches('/'),
            self.property_id
        )
    }

    pub fn property_id(&self) -> &str {
        &self.property_id
    }

    /// Dimensions and metrics the property understands.
    pub async fn metadata(&self, ctx: &FetchContext) -> Result<PropertyMetadata, AdapterError> {
        let response = self
            .http
            .get_json(
                ctx.run_id,
                SourceId::PurchaseReport,
                &self.metadata_url(),
                &self.access_token,
            )
            .await?;
        if let Some(store) = &self.artifacts {
            store
                .store_bytes(ctx.fetched_at, SourceId::PurchaseReport, "json", &response.body)
                .await?;
        }
        let metadata: PropertyMetadata = serde_json::from_slice(&response.body)?;
        info!(
            url = %response.final_url,
            metrics = metadata.metrics.len(),
            dimensions = metadata.dimensions.len(),
            "fetched property metadata"
        );
        Ok(metadata)
    }

    fn request_body(window: DateWindow, offset: u64) -> serde_json::Value {
        json!({
            "dateRanges": [{
                "startDate": window.start.to_string(),
                "endDate": window.end.to_string(),
            }],
            "dimensions": [{ "name": "itemId" }],
            "metrics": [{ "name": "totalPurchasers" }],
            "limit": GA4_PAGE_LIMIT,
            "offset": offset,
            "returnPropertyQuota": true,
        })
    }
}

#[async_trait]
impl PurchaseReportClient for Ga4PurchaseClient {
    async fn fetch(
        &self,
        ctx: &FetchContext,
        window: DateWindow,
    ) -> Result<Vec<RawObservation>, AdapterError> {
        let url = self.report_url();
        let mut observations = Vec::new();
        let mut offset = 0u64;
        loop {
            let body = Self::request_body(window, offset);
            let response = self
                .http
                .post_json(ctx.run_id, SourceId::PurchaseReport, &url, &self.access_token, &body)
                .await?;
            if let Some(store) = &self.artifacts {
                store
                    .store_bytes(ctx.fetched_at, SourceId::PurchaseReport, "json", &response.body)
                    .await?;
            }
            let page: RunReportResponse = serde_json::from_slice(&response.body)?;
            let rows = run_report_observations(&page, "itemId", "totalPurchasers")?;
            debug!(
                url = %response.final_url,
                offset,
                rows = rows.len(),
                row_count = page.row_count,
                "ga4 page"
            );
            let page_len = rows.len() as u64;
            observations.extend(rows);
            offset += page_len;
            if page_len == 0 || offset >= page.row_count {
                break;
            }
        }
        info!(%window, rows = observations.len(), "fetched purchase report");
        Ok(observations)
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SearchAnalyticsResponse {
    #[serde(default)]
    pub rows: Vec<SearchAnalyticsRow>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SearchAnalyticsRow {
    #[serde(default)]
    pub keys: Vec<String>,
    #[serde(default)]
    pub clicks: f64,
}

/// Url -> clicks for rows with at least one click.
pub fn search_analytics_clicks(response: &SearchAnalyticsResponse) -> Vec<(String, i64)> {
    response
        .rows
        .iter()
        .filter(|row| row.clicks > 0.0)
        .filter_map(|row| {
            row.keys
                .first()
                .map(|url| (url.clone(), row.clicks.round() as i64))
        })
        .collect()
}

pub struct SearchConsoleReferralClient {
    http: Arc<HttpFetcher>,
    endpoint: String,
    site_url: String,
    access_token: String,
    artifacts: Option<ArtifactStore>,
}

impl SearchConsoleReferralClient {
    pub fn new(http: Arc<HttpFetcher>, site_url: String, access_token: String) -> Self {
        Self {
            http,
            endpoint: SEARCH_CONSOLE_DEFAULT_ENDPOINT.to_string(),
            site_url,
            access_token,
            artifacts: None,
        }
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }

    pub fn with_artifacts(mut self, artifacts: ArtifactStore) -> Self {
        self.artifacts = Some(artifacts);
        self
    }

    /// `{endpoint}/sites/{site}/searchAnalytics/query`, with the site encoded as
    /// a single path segment.
    pub fn query_url(&self) -> Result<String, AdapterError> {
        let mut url = reqwest::Url::parse(&self.endpoint)
            .map_err(|err| AdapterError::Message(format!("invalid endpoint {}: {err}", self.endpoint)))?;
        url.path_segments_mut()
            .map_err(|_| AdapterError::Message(format!("endpoint {} cannot take a path", self.endpoint)))?
            .pop_if_empty()
            .extend(["sites", self.site_url.as_str(), "searchAnalytics", "query"]);
        Ok(url.to_string())
    }

    fn request_body(window: DateWindow, path_filter: &str, start_row: u64) -> serde_json::Value {
        let mut body = json!({
            "startDate": window.start.to_string(),
            "endDate": window.end.to_string(),
            "dimensions": ["page"],
            "startRow": start_row,
            "rowLimit": SEARCH_CONSOLE_ROW_LIMIT,
        });
        if !path_filter.is_empty() {
            body["dimensionFilterGroups"] = json!([{
                "groupType": "and",
                "filters": [{
                    "dimension": "page",
                    "operator": "contains",
                    "expression": path_filter,
                }],
            }]);
        }
        body
    }
}

#[async_trait]
impl SearchReferralClient for SearchConsoleReferralClient {
    async fn fetch(
        &self,
        ctx: &FetchContext,
        window: DateWindow,
        path_filter: &str,
    ) -> Result<BTreeMap<String, i64>, AdapterError> {
        let url = self.query_url()?;
        let mut clicks = BTreeMap::new();
        let mut start_row = 0u64;
        loop {
            let body = Self::request_body(window, path_filter, start_row);
            let response = self
                .http
                .post_json(ctx.run_id, SourceId::SearchReferral, &url, &self.access_token, &body)
                .await?;
            if let Some(store) = &self.artifacts {
                store
                    .store_bytes(ctx.fetched_at, SourceId::SearchReferral, "json", &response.body)
                    .await?;
            }
            let page: SearchAnalyticsResponse = serde_json::from_slice(&response.body)?;
            let page_rows = page.rows.len() as u64;
            debug!(url = %response.final_url, start_row, rows = page_rows, "search console page");
            for (page_url, value) in search_analytics_clicks(&page) {
                *clicks.entry(page_url).or_insert(0) += value;
            }
            start_row += page_rows;
            if page_rows < SEARCH_CONSOLE_ROW_LIMIT {
                break;
            }
        }
        info!(%window, path_filter, urls = clicks.len(), "fetched search referrals");
        Ok(clicks)
    }
}

/// One dated observation in a fixture report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatedObservation {
    pub date: NaiveDate,
    pub key: String,
    pub value: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FixtureReport {
    pub source_id: SourceId,
    #[serde(default)]
    pub observations: Vec<DatedObservation>,
}

pub fn load_fixture_report(path: impl AsRef<Path>) -> Result<FixtureReport> {
    let path = path.as_ref();
    let data = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&data).with_context(|| format!("parsing {}", path.display()))
}

/// Offline client answering from dated observations, for dry runs and tests.
#[derive(Debug, Clone)]
pub struct FixtureReportClient {
    report: FixtureReport,
}

impl FixtureReportClient {
    pub fn new(report: FixtureReport) -> Self {
        Self { report }
    }

    pub fn from_observations(source_id: SourceId, observations: Vec<DatedObservation>) -> Self {
        Self::new(FixtureReport {
            source_id,
            observations,
        })
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        Ok(Self::new(load_fixture_report(path)?))
    }

    fn in_window<'a>(&'a self, window: DateWindow) -> impl Iterator<Item = &'a DatedObservation> {
        self.report
            .observations
            .iter()
            .filter(move |obs| window.contains(obs.date))
    }

    fn expect_source(&self, expected: SourceId) -> Result<(), AdapterError> {
        if self.report.source_id != expected {
            return Err(AdapterError::Message(format!(
                "fixture source_id={} does not match client source_id={}",
                self.report.source_id, expected
            )));
        }
        Ok(())
    }
}

fn reject_negative(obs: &DatedObservation) -> Result<(), AdapterError> {
    if obs.value < 0 {
        return Err(AdapterError::Message(format!(
            "fixture value {} for {} on {} is negative",
            obs.value, obs.key, obs.date
        )));
    }
    Ok(())
}

fn checked_sum(key: &str, total: i64, value: i64) -> Result<i64, AdapterError> {
    total
        .checked_add(value)
        .ok_or_else(|| AdapterError::Message(format!("fixture total for {key} overflows")))
}

#[async_trait]
impl PurchaseReportClient for FixtureReportClient {
    async fn fetch(
        &self,
        _ctx: &FetchContext,
        window: DateWindow,
    ) -> Result<Vec<RawObservation>, AdapterError> {
        self.expect_source(SourceId::PurchaseReport)?;
        let mut positions: BTreeMap<&str, usize> = BTreeMap::new();
        let mut rows: Vec<RawObservation> = Vec::new();
        for obs in self.in_window(window) {
            reject_negative(obs)?;
            match positions.get(obs.key.as_str()) {
                Some(&idx) => {
                    rows[idx].value = checked_sum(&obs.key, rows[idx].value, obs.value)?
                }
                None => {
                    positions.insert(obs.key.as_str(), rows.len());
                    rows.push(RawObservation::new(obs.key.clone(), obs.value));
                }
            }
        }
        Ok(rows)
    }
}

#[async_trait]
impl SearchReferralClient for FixtureReportClient {
    async fn fetch(
        &self,
        _ctx: &FetchContext,
        window: DateWindow,
        path_filter: &str,
    ) -> Result<BTreeMap<String, i64>, AdapterError> {
        self.expect_source(SourceId::SearchReferral)?;
        let mut clicks = BTreeMap::new();
        for obs in self
            .in_window(window)
            .filter(|obs| obs.key.contains(path_filter))
        {
            reject_negative(obs)?;
            let total = clicks.entry(obs.key.clone()).or_insert(0);
            *total = checked_sum(&obs.key, *total, obs.value)?;
        }
        clicks.retain(|_, v| *v > 0);
        Ok(clicks)
    }
}

/// Fixture file locations inside a fixtures directory.
pub fn fixture_paths(dir: impl AsRef<Path>) -> (PathBuf, PathBuf) {
    let dir = dir.as_ref();
    (
        dir.join("purchase_report.json"),
        dir.join("search_referral.json"),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 5, d).unwrap()
    }

    fn ctx() -> FetchContext {
        FetchContext {
            run_id: Uuid::nil(),
            fetched_at: DateTime::parse_from_rfc3339("2024-05-20T00:00:00Z")
                .unwrap()
                .with_timezone(&Utc),
        }
    }

    #[test]
    fn run_report_rows_become_observations() {
        let page: RunReportResponse = serde_json::from_value(json!({
            "dimensionHeaders": [{ "name": "itemId" }],
            "metricHeaders": [{ "name": "totalPurchasers", "type": "TYPE_INTEGER" }],
            "rows": [
                { "dimensionValues": [{ "value": "canon/sn1" }], "metricValues": [{ "value": "12" }] },
                { "dimensionValues": [{ "value": "av/talk#10" }], "metricValues": [{ "value": "3" }] }
            ],
            "rowCount": 2
        }))
        .unwrap();

        let rows = run_report_observations(&page, "itemId", "totalPurchasers").unwrap();
        assert_eq!(
            rows,
            vec![
                RawObservation::new("canon/sn1", 12),
                RawObservation::new("av/talk#10", 3)
            ]
        );
    }

    #[test]
    fn run_report_without_rows_is_empty() {
        let page: RunReportResponse = serde_json::from_value(json!({ "rowCount": 0 })).unwrap();
        assert!(run_report_observations(&page, "itemId", "totalPurchasers")
            .unwrap()
            .is_empty());
    }

    #[test]
    fn search_analytics_without_rows_is_empty_and_zero_clicks_are_dropped() {
        let empty: SearchAnalyticsResponse = serde_json::from_value(json!({})).unwrap();
        assert!(search_analytics_clicks(&empty).is_empty());

        let page: SearchAnalyticsResponse = serde_json::from_value(json!({
            "rows": [
                { "keys": ["https://example.org/content/canon/a"], "clicks": 4.0 },
                { "keys": ["https://example.org/content/canon/b"], "clicks": 0.0 }
            ]
        }))
        .unwrap();
        assert_eq!(
            search_analytics_clicks(&page),
            vec![("https://example.org/content/canon/a".to_string(), 4)]
        );
    }

    #[test]
    fn search_console_site_is_encoded_as_one_segment() {
        let http = Arc::new(HttpFetcher::new(Default::default()).unwrap());
        let client = SearchConsoleReferralClient::new(
            http,
            "https://example.org/".to_string(),
            "token".to_string(),
        );
        assert_eq!(
            client.query_url().unwrap(),
            "https://www.googleapis.com/webmasters/v3/sites/https:%2F%2Fexample.org%2F/searchAnalytics/query"
        );
    }

    #[test]
    fn custom_endpoints_shape_request_urls() {
        let http = Arc::new(HttpFetcher::new(Default::default()).unwrap());
        let ga4 = Ga4PurchaseClient::new(http.clone(), "123".to_string(), "token".to_string())
            .with_endpoint("http://127.0.0.1:9000/");
        assert_eq!(ga4.report_url(), "http://127.0.0.1:9000/v1beta/properties/123:runReport");
        assert_eq!(ga4.metadata_url(), "http://127.0.0.1:9000/v1beta/properties/123/metadata");

        let search = SearchConsoleReferralClient::new(
            http,
            "sc-domain:example.org".to_string(),
            "token".to_string(),
        )
        .with_endpoint("http://127.0.0.1:9000/webmasters/v3");
        assert_eq!(
            search.query_url().unwrap(),
            "http://127.0.0.1:9000/webmasters/v3/sites/sc-domain:example.org/searchAnalytics/query"
        );
    }

    #[test]
    fn property_metadata_renders_wrapped_listings() {
        let metadata: PropertyMetadata = serde_json::from_value(json!({
            "name": "properties/123/metadata",
            "dimensions": [{
                "apiName": "itemId",
                "uiName": "Item ID",
                "description": "The ID of the item.",
                "category": "Ecommerce"
            }],
            "metrics": [{
                "apiName": "totalPurchasers",
                "uiName": "Total purchasers",
                "description": "The number of users that logged purchase events for the time period selected.",
                "type": "TYPE_INTEGER",
                "category": "User",
                "deprecatedApiNames": ["purchasers"]
            }]
        }))
        .unwrap();

        assert_eq!(
            render_metrics_listing(&metadata),
            "ALL METRICS UNDERSTOOD BY THE GOOGLE ANALYTICS API\n\
             --------------------------------------------------\n\
             \n# Total purchasers\n\
             \x20 The number of users that logged purchase events for the\n\
             \x20 time period selected.\n\
             \n  USE: totalPurchasers is a User metric of TYPE_INTEGER\n\
             \x20 (totalPurchasers used to be known as purchasers)\n\
             \n"
        );
        assert_eq!(
            render_dimensions_listing(&metadata),
            "ALL DIMENSIONS UNDERSTOOD BY THE GOOGLE ANALYTICS API\n\
             -----------------------------------------------------\n\
             \n# Item ID\n\
             \x20 The ID of the item.\n\
             \n  USE: itemId is a Ecommerce dimension.\n\n"
        );
    }

    #[test]
    fn long_words_are_not_split() {
        let word = "x".repeat(70);
        assert_eq!(wrap_description(&format!("a {word} b")), format!("  a\n  {word}\n  b"));
        assert_eq!(wrap_description(""), "");
    }

    #[tokio::test]
    async fn fixture_clients_reject_negative_values() {
        let purchases = FixtureReportClient::from_observations(
            SourceId::PurchaseReport,
            vec![DatedObservation { date: day(2), key: "canon/a".into(), value: -1 }],
        );
        let window = DateWindow { start: day(1), end: day(3) };
        let err = PurchaseReportClient::fetch(&purchases, &ctx(), window).await.unwrap_err();
        assert!(err.to_string().contains("negative"));

        let referrals = FixtureReportClient::from_observations(
            SourceId::SearchReferral,
            vec![
                DatedObservation { date: day(1), key: "https://x.org/content/canon/a".into(), value: 5 },
                DatedObservation { date: day(2), key: "https://x.org/content/canon/a".into(), value: -5 },
            ],
        );
        let err = SearchReferralClient::fetch(&referrals, &ctx(), window, "/content/")
            .await
            .unwrap_err();
        assert!(err.to_string().contains("negative"));
    }

    #[tokio::test]
    async fn fixture_purchase_totals_that_overflow_are_errors() {
        let client = FixtureReportClient::from_observations(
            SourceId::PurchaseReport,
            vec![
                DatedObservation { date: day(1), key: "canon/a".into(), value: i64::MAX },
                DatedObservation { date: day(2), key: "canon/a".into(), value: 1 },
            ],
        );
        let window = DateWindow { start: day(1), end: day(3) };
        let err = PurchaseReportClient::fetch(&client, &ctx(), window).await.unwrap_err();
        assert!(err.to_string().contains("overflows"));
    }

    #[tokio::test]
    async fn fixture_purchase_client_filters_by_window_and_sums_keys() {
        let client = FixtureReportClient::from_observations(
            SourceId::PurchaseReport,
            vec![
                DatedObservation { date: day(1), key: "canon/a".into(), value: 2 },
                DatedObservation { date: day(2), key: "canon/b".into(), value: 1 },
                DatedObservation { date: day(3), key: "canon/a".into(), value: 5 },
                DatedObservation { date: day(9), key: "canon/a".into(), value: 100 },
            ],
        );
        let window = DateWindow { start: day(1), end: day(3) };
        let rows = PurchaseReportClient::fetch(&client, &ctx(), window).await.unwrap();
        assert_eq!(
            rows,
            vec![RawObservation::new("canon/a", 7), RawObservation::new("canon/b", 1)]
        );
    }

    #[tokio::test]
    async fn fixture_referral_client_applies_path_filter() {
        let client = FixtureReportClient::from_observations(
            SourceId::SearchReferral,
            vec![
                DatedObservation { date: day(2), key: "https://x.org/content/canon/a".into(), value: 3 },
                DatedObservation { date: day(2), key: "https://x.org/content/papers/b".into(), value: 4 },
            ],
        );
        let window = DateWindow { start: day(1), end: day(3) };
        let clicks = SearchReferralClient::fetch(&client, &ctx(), window, "/content/canon/")
            .await
            .unwrap();
        assert_eq!(clicks.len(), 1);
        assert_eq!(clicks.get("https://x.org/content/canon/a"), Some(&3));
    }

    #[tokio::test]
    async fn fixture_client_refuses_mismatched_source() {
        let client = FixtureReportClient::from_observations(SourceId::SearchReferral, vec![]);
        let window = DateWindow { start: day(1), end: day(3) };
        let err = PurchaseReportClient::fetch(&client, &ctx(), window).await.unwrap_err();
        assert!(err.to_string().contains("does not match"));
    }
}
