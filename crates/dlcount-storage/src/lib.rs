//! File persistence (archives, watermarks, mapping table, raw responses) and the
//! retrying HTTP fetcher used by the report clients.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, Utc};
use dlcount_core::{CountTable, InvariantViolation, SourceId, Watermark};
use reqwest::StatusCode;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Semaphore;
use tracing::{debug, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "dlcount-storage";

/// Fails with [`InvariantViolation::MissingArchive`] when a required file is absent.
pub fn require_file(path: &Path) -> anyhow::Result<()> {
    if path.is_file() {
        Ok(())
    } else {
        Err(InvariantViolation::MissingArchive {
            path: path.to_path_buf(),
        }
        .into())
    }
}

async fn write_temp_sibling(final_path: &Path, bytes: &[u8]) -> anyhow::Result<PathBuf> {
    let parent = final_path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent)
        .await
        .with_context(|| format!("creating directory {}", parent.display()))?;

    let file_name = final_path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "staged".to_string());
    let temp_path = parent.join(format!(".{file_name}.{}.tmp", Uuid::new_v4()));

    let mut file = fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(&temp_path)
        .await
        .with_context(|| format!("opening temp file {}", temp_path.display()))?;
    file.write_all(bytes)
        .await
        .with_context(|| format!("writing temp file {}", temp_path.display()))?;
    file.flush()
        .await
        .with_context(|| format!("flushing temp file {}", temp_path.display()))?;
    file.sync_all()
        .await
        .with_context(|| format!("syncing temp file {}", temp_path.display()))?;
    Ok(temp_path)
}

#[derive(Debug)]
struct StagedFile {
    temp_path: PathBuf,
    final_path: PathBuf,
}

/// Multi-file write: every file is first written and synced as a temp sibling,
/// then all temps are renamed into place in staging order by [`StagedCommit::commit`].
/// Temps that were never committed are removed on drop.
#[derive(Debug, Default)]
pub struct StagedCommit {
    staged: Vec<StagedFile>,
}

impl StagedCommit {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.staged.len()
    }

    pub fn is_empty(&self) -> bool {
        self.staged.is_empty()
    }

    pub async fn stage(&mut self, path: impl Into<PathBuf>, bytes: &[u8]) -> anyhow::Result<()> {
        let final_path = path.into();
        let temp_path = write_temp_sibling(&final_path, bytes).await?;
        self.staged.push(StagedFile {
            temp_path,
            final_path,
        });
        Ok(())
    }

    /// Stages `bytes` only when they differ from the current file content.
    pub async fn stage_if_changed(
        &mut self,
        path: impl Into<PathBuf>,
        bytes: &[u8],
    ) -> anyhow::Result<bool> {
        let final_path = path.into();
        match fs::read(&final_path).await {
            Ok(existing) if existing == bytes => return Ok(false),
            Ok(_) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => {
                return Err(err).with_context(|| format!("reading {}", final_path.display()))
            }
        }
        self.stage(final_path, bytes).await?;
        Ok(true)
    }

    pub async fn commit(mut self) -> anyhow::Result<Vec<PathBuf>> {
        let staged = std::mem::take(&mut self.staged);
        let mut committed = Vec::with_capacity(staged.len());
        let mut pending = staged.into_iter();
        while let Some(file) = pending.next() {
            if let Err(err) = fs::rename(&file.temp_path, &file.final_path).await {
                // Leave the remainder to Drop so their temps get cleaned up.
                self.staged.push(file);
                self.staged.extend(pending);
                return Err(err).with_context(|| {
                    format!(
                        "committing {} after {} of {} files",
                        self.staged[0].final_path.display(),
                        committed.len(),
                        committed.len() + self.staged.len()
                    )
                });
            }
            debug!(path = %file.final_path.display(), "committed file");
            committed.push(file.final_path);
        }
        Ok(committed)
    }
}

impl Drop for StagedCommit {
    fn drop(&mut self) {
        for file in &self.staged {
            if let Err(err) = std::fs::remove_file(&file.temp_path) {
                if err.kind() != std::io::ErrorKind::NotFound {
                    warn!(path = %file.temp_path.display(), error = %err, "failed to remove staged temp file");
                }
            }
        }
    }
}

/// Writes one file via temp-file + rename.
pub async fn write_atomic(path: impl Into<PathBuf>, bytes: &[u8]) -> anyhow::Result<()> {
    let mut commit = StagedCommit::new();
    commit.stage(path, bytes).await?;
    commit.commit().await?;
    Ok(())
}

/// Reads a two-column CSV count table. Duplicate keys are summed; negative
/// values are rejected.
pub fn read_count_table(
    path: &Path,
    key_column: &str,
    value_column: &str,
) -> anyhow::Result<CountTable<String>> {
    require_file(path)?;
    let mut reader =
        csv::Reader::from_path(path).with_context(|| format!("opening {}", path.display()))?;
    let headers = reader
        .headers()
        .with_context(|| format!("reading header of {}", path.display()))?
        .clone();
    let column = |name: &str| {
        headers
            .iter()
            .position(|h| h.trim() == name)
            .with_context(|| format!("{} has no `{name}` column", path.display()))
    };
    let key_idx = column(key_column)?;
    let value_idx = column(value_column)?;

    let mut table = CountTable::new();
    for (line, record) in reader.records().enumerate() {
        let record = record.with_context(|| format!("reading row {} of {}", line + 1, path.display()))?;
        let key = record.get(key_idx).unwrap_or_default().to_string();
        let raw_value = record.get(value_idx).unwrap_or_default().trim();
        let value: i64 = raw_value.parse().with_context(|| {
            format!(
                "row {} of {}: `{raw_value}` is not an integer count",
                line + 1,
                path.display()
            )
        })?;
        let value = u64::try_from(value).map_err(|_| InvariantViolation::NegativeCount {
            key: key.clone(),
            value,
        })?;
        table.add(key, value)?;
    }
    Ok(table)
}

/// Serializes a count table as CSV, preserving row order.
pub fn encode_count_table<K>(
    table: &CountTable<K>,
    key_column: &str,
    value_column: &str,
) -> anyhow::Result<Vec<u8>>
where
    K: std::hash::Hash + Eq + std::fmt::Display,
{
    let mut writer = csv::Writer::from_writer(Vec::new());
    writer
        .write_record([key_column, value_column])
        .context("writing csv header")?;
    for (key, value) in table.iter() {
        writer
            .write_record([key.to_string(), value.to_string()])
            .with_context(|| format!("writing csv row for {key}"))?;
    }
    writer.into_inner().context("flushing csv writer")
}

/// Watermark file contents, one entry per archived source.
pub type WatermarkFile = BTreeMap<SourceId, Watermark>;

pub fn read_watermarks(path: &Path) -> anyhow::Result<WatermarkFile> {
    require_file(path)?;
    let text =
        std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
}

pub fn encode_watermarks(marks: &WatermarkFile) -> anyhow::Result<Vec<u8>> {
    let text = serde_yaml::to_string(marks).context("serializing watermarks")?;
    Ok(text.into_bytes())
}

#[derive(Debug, Clone, serde::Deserialize)]
struct MappingRow {
    url: String,
    path: String,
}

/// Reads the static `url,path` lookup table in file order.
pub fn read_url_mapping(path: &Path) -> anyhow::Result<Vec<(String, String)>> {
    require_file(path)?;
    let mut reader =
        csv::Reader::from_path(path).with_context(|| format!("opening {}", path.display()))?;
    let mut rows = Vec::new();
    for (line, row) in reader.deserialize::<MappingRow>().enumerate() {
        let row = row.with_context(|| format!("reading row {} of {}", line + 1, path.display()))?;
        rows.push((row.url, row.path));
    }
    Ok(rows)
}

#[derive(Debug, Clone)]
pub struct StoredArtifact {
    pub content_hash: String,
    pub relative_path: PathBuf,
    pub absolute_path: PathBuf,
    pub byte_size: usize,
    pub deduplicated: bool,
}

/// Append-only, content-addressed store for raw provider responses.
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    root: PathBuf,
}

impl ArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn sha256_hex(bytes: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        hex::encode(hasher.finalize())
    }

    pub fn artifact_relative_path(
        &self,
        fetched_at: DateTime<Utc>,
        source_id: SourceId,
        content_hash: &str,
        extension: &str,
    ) -> PathBuf {
        let stamp = fetched_at.format("%Y%m%d").to_string();
        let ext = extension.trim_start_matches('.').trim();
        let ext = if ext.is_empty() { "bin" } else { ext };
        PathBuf::from(stamp)
            .join(source_id.as_str())
            .join(format!("{content_hash}.{ext}"))
    }

    /// Stores bytes under their hash. An existing artifact with the same hash is
    /// never rewritten.
    pub async fn store_bytes(
        &self,
        fetched_at: DateTime<Utc>,
        source_id: SourceId,
        extension: &str,
        bytes: &[u8],
    ) -> anyhow::Result<StoredArtifact> {
        let content_hash = Self::sha256_hex(bytes);
        let relative_path =
            self.artifact_relative_path(fetched_at, source_id, &content_hash, extension);
        let absolute_path = self.root.join(&relative_path);
        let artifact = |deduplicated| StoredArtifact {
            content_hash: content_hash.clone(),
            relative_path: relative_path.clone(),
            absolute_path: absolute_path.clone(),
            byte_size: bytes.len(),
            deduplicated,
        };

        if fs::try_exists(&absolute_path)
            .await
            .with_context(|| format!("checking artifact path {}", absolute_path.display()))?
        {
            return Ok(artifact(true));
        }

        write_atomic(absolute_path.clone(), bytes).await?;
        Ok(artifact(false))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(8),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub max_concurrency: usize,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(60),
            user_agent: None,
            max_concurrency: 4,
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    /// Url after redirects.
    pub final_url: String,
    pub body: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}: {body}")]
    HttpStatus {
        status: u16,
        url: String,
        body: String,
    },
    #[error("fetcher concurrency limiter closed")]
    Closed,
}

/// JSON-over-HTTP client with a global concurrency bound and exponential backoff.
#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    limit: Arc<Semaphore>,
    backoff: BackoffPolicy,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self {
            client,
            limit: Arc::new(Semaphore::new(config.max_concurrency.max(1))),
            backoff: config.backoff,
        })
    }

    /// POSTs `body` as JSON with a bearer token, retrying transient failures.
    pub async fn post_json(
        &self,
        run_id: Uuid,
        source_id: SourceId,
        url: &str,
        bearer_token: &str,
        body: &serde_json::Value,
    ) -> Result<FetchedResponse, FetchError> {
        let _permit = self.limit.acquire().await.map_err(|_| FetchError::Closed)?;
        let span = info_span!("http_fetch", %run_id, source = %source_id, method = "POST", url);
        self.send_with_retries(|| self.client.post(url).bearer_auth(bearer_token).json(body))
            .instrument(span)
            .await
    }

    /// GETs `url` with a bearer token, retrying transient failures.
    pub async fn get_json(
        &self,
        run_id: Uuid,
        source_id: SourceId,
        url: &str,
        bearer_token: &str,
    ) -> Result<FetchedResponse, FetchError> {
        let _permit = self.limit.acquire().await.map_err(|_| FetchError::Closed)?;
        let span = info_span!("http_fetch", %run_id, source = %source_id, method = "GET", url);
        self.send_with_retries(|| self.client.get(url).bearer_auth(bearer_token))
            .instrument(span)
            .await
    }

    async fn send_with_retries<F>(&self, request: F) -> Result<FetchedResponse, FetchError>
    where
        F: Fn() -> reqwest::RequestBuilder,
    {
        let mut attempt = 0usize;
        loop {
            let result = request().send().await;
            let can_retry = attempt < self.backoff.max_retries;

            match result {
                Ok(resp) => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();

                    if status.is_success() {
                        let body = resp.bytes().await?.to_vec();
                        return Ok(FetchedResponse { final_url, body });
                    }

                    if classify_status(status) == RetryDisposition::Retryable && can_retry {
                        warn!(status = status.as_u16(), attempt, "retrying after http status");
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }

                    let text = resp.text().await.unwrap_or_default();
                    return Err(FetchError::HttpStatus {
                        status: status.as_u16(),
                        url: final_url,
                        body: text.chars().take(512).collect(),
                    });
                }
                Err(err) => {
                    if classify_reqwest_error(&err) == RetryDisposition::Retryable && can_retry {
                        warn!(error = %err, attempt, "retrying after request error");
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }
                    return Err(FetchError::Request(err));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use tempfile::tempdir;

    #[test]
    fn artifact_hashing_is_stable() {
        let hash = ArtifactStore::sha256_hex(b"hello world");
        assert_eq!(
            hash,
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[tokio::test]
    async fn raw_responses_deduplicate_by_hash_path() {
        let dir = tempdir().expect("tempdir");
        let store = ArtifactStore::new(dir.path());
        let fetched_at = DateTime::parse_from_rfc3339("2024-05-02T09:00:00Z")
            .expect("ts")
            .with_timezone(&Utc);

        let first = store
            .store_bytes(fetched_at, SourceId::PurchaseReport, "json", b"{\"rows\":[]}")
            .await
            .expect("first store");
        let second = store
            .store_bytes(fetched_at, SourceId::PurchaseReport, "json", b"{\"rows\":[]}")
            .await
            .expect("second store");

        assert!(!first.deduplicated);
        assert!(second.deduplicated);
        assert_eq!(first.relative_path, second.relative_path);
        assert!(first
            .relative_path
            .starts_with(PathBuf::from("20240502").join("purchase_report")));
        assert!(first.absolute_path.exists());
    }

    #[test]
    fn backoff_logic_is_exponential_and_capped() {
        let policy = BackoffPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
        };

        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(350));
        assert_eq!(policy.delay_for_attempt(5), Duration::from_millis(350));
    }

    #[test]
    fn count_table_csv_preserves_order_and_sums_duplicates() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("purchase_archive.csv");
        std::fs::write(
            &path,
            "itemId,totalPurchasers\ncanon/sn1,4\nav/talk#10,2\ncanon/sn1,1\n",
        )
        .unwrap();

        let table = read_count_table(&path, "itemId", "totalPurchasers").expect("read");
        assert_eq!(table.get("canon/sn1"), Some(5));
        assert_eq!(table.len(), 2);

        let bytes = encode_count_table(&table, "itemId", "totalPurchasers").expect("encode");
        assert_eq!(
            String::from_utf8(bytes).unwrap(),
            "itemId,totalPurchasers\ncanon/sn1,5\nav/talk#10,2\n"
        );
    }

    #[test]
    fn negative_archive_values_are_invariant_violations() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("referral_archive.csv");
        std::fs::write(&path, "url,clicks\nhttps://example.org/a,-3\n").unwrap();

        let err = read_count_table(&path, "url", "clicks").unwrap_err();
        assert!(matches!(
            err.downcast_ref::<InvariantViolation>(),
            Some(InvariantViolation::NegativeCount { value: -3, .. })
        ));
    }

    #[test]
    fn missing_required_file_is_reported_as_missing_archive() {
        let dir = tempdir().expect("tempdir");
        let err = read_watermarks(&dir.path().join("watermarks.yaml")).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<InvariantViolation>(),
            Some(InvariantViolation::MissingArchive { .. })
        ));
    }

    #[test]
    fn watermarks_use_iso_dates() {
        let mut marks = WatermarkFile::new();
        marks.insert(
            SourceId::PurchaseReport,
            Watermark {
                end_date: NaiveDate::from_ymd_opt(2024, 4, 30).unwrap(),
            },
        );
        let text = String::from_utf8(encode_watermarks(&marks).unwrap()).unwrap();
        assert!(text.contains("purchase_report:"));
        assert!(text.contains("end_date: 2024-04-30"));
    }

    #[tokio::test]
    async fn staged_commit_only_touches_targets_on_commit() {
        let dir = tempdir().expect("tempdir");
        let a = dir.path().join("a.csv");
        let b = dir.path().join("nested").join("b.yaml");

        let mut commit = StagedCommit::new();
        commit.stage(a.clone(), b"first").await.unwrap();
        commit.stage(b.clone(), b"second").await.unwrap();
        assert!(!a.exists());
        assert!(!b.exists());

        let committed = commit.commit().await.unwrap();
        assert_eq!(committed, vec![a.clone(), b.clone()]);
        assert_eq!(std::fs::read(&a).unwrap(), b"first");
        assert_eq!(std::fs::read(&b).unwrap(), b"second");
    }

    #[tokio::test]
    async fn dropped_commit_removes_its_temp_files() {
        let dir = tempdir().expect("tempdir");
        let target = dir.path().join("watermarks.yaml");
        {
            let mut commit = StagedCommit::new();
            commit.stage(target.clone(), b"x").await.unwrap();
        }
        assert!(!target.exists());
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn unchanged_files_are_not_restaged() {
        let dir = tempdir().expect("tempdir");
        let target = dir.path().join("canon").join("sn1.download_count");
        write_atomic(target.clone(), b"7").await.unwrap();

        let mut commit = StagedCommit::new();
        assert!(!commit.stage_if_changed(target.clone(), b"7").await.unwrap());
        assert!(commit.stage_if_changed(target.clone(), b"8").await.unwrap());
        assert_eq!(commit.len(), 1);
    }
}
