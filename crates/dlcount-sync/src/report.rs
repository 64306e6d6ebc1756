//! Per-run diagnostic reports: markdown brief, unresolved list, parquet snapshots.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use arrow_array::{RecordBatch, StringArray, UInt64Array};
use arrow_schema::{DataType, Field as ArrowField, Schema};
use chrono::{DateTime, NaiveDate, Utc};
use dlcount_core::ResolvedCounts;
use parquet::arrow::ArrowWriter;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::fs;
use uuid::Uuid;

use crate::normalize::{RejectedKey, SegmentGroup};
use crate::pipeline::{RunMode, SourceWindow};
use crate::resolve::UnresolvedClicks;

/// Everything a run report is built from.
#[derive(Debug, Clone)]
pub struct RunReport<'a> {
    pub run_id: Uuid,
    pub mode: RunMode,
    pub started_at: DateTime<Utc>,
    pub today: NaiveDate,
    pub windows: &'a [SourceWindow],
    pub counts: &'a ResolvedCounts,
    pub unresolved: &'a [UnresolvedClicks],
    pub partial_segment_groups: &'a [SegmentGroup],
    pub rejected: &'a [RejectedKey],
}

/// Machine-readable run header, `run.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRecord {
    pub run_id: Uuid,
    pub mode: RunMode,
    pub started_at: DateTime<Utc>,
    pub today: NaiveDate,
    pub windows: Vec<SourceWindow>,
    pub content_paths: usize,
    pub content_total: u64,
    pub link_keys: usize,
    pub link_total: u64,
    pub unresolved_urls: usize,
    pub unresolved_clicks: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct SnapshotManifest {
    pub schema_version: u32,
    pub files: Vec<SnapshotManifestFile>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SnapshotManifestFile {
    pub name: String,
    pub path: String,
    pub sha256: String,
    pub bytes: u64,
}

pub async fn write_run_report(reports_root: &Path, report: &RunReport<'_>) -> Result<PathBuf> {
    let report_dir = reports_root.join(report.run_id.to_string());
    let snapshot_dir = report_dir.join("snapshots");
    fs::create_dir_all(&snapshot_dir)
        .await
        .with_context(|| format!("creating {}", snapshot_dir.display()))?;

    let unresolved_clicks: u64 = report.unresolved.iter().map(|u| u.clicks).sum();
    let record = RunRecord {
        run_id: report.run_id,
        mode: report.mode,
        started_at: report.started_at,
        today: report.today,
        windows: report.windows.to_vec(),
        content_paths: report.counts.content.len(),
        content_total: report.counts.content.total(),
        link_keys: report.counts.links.len(),
        link_total: report.counts.links.total(),
        unresolved_urls: report.unresolved.len(),
        unresolved_clicks,
    };
    let record_json = serde_json::to_vec_pretty(&record).context("serializing run record")?;
    fs::write(report_dir.join("run.json"), record_json)
        .await
        .context("writing run.json")?;

    fs::write(report_dir.join("run_summary.md"), render_brief(&record))
        .await
        .context("writing run_summary.md")?;

    let diagnostics = serde_json::to_vec_pretty(&serde_json::json!({
        "run_id": report.run_id,
        "unresolved": report.unresolved,
        "partial_segment_groups": report.partial_segment_groups,
        "rejected_keys": report.rejected,
    }))
    .context("serializing diagnostics")?;
    fs::write(report_dir.join("unresolved.json"), diagnostics)
        .await
        .context("writing unresolved.json")?;

    let content_path = snapshot_dir.join("content_counts.parquet");
    let links_path = snapshot_dir.join("link_counts.parquet");
    write_content_parquet(&content_path, report.counts)?;
    write_links_parquet(&links_path, report.counts)?;

    let manifest = SnapshotManifest {
        schema_version: 1,
        files: vec![
            manifest_entry("content_counts", &report_dir, &content_path)?,
            manifest_entry("link_counts", &report_dir, &links_path)?,
        ],
    };
    let manifest_path = snapshot_dir.join("manifest.json");
    let bytes = serde_json::to_vec_pretty(&manifest).context("serializing snapshot manifest")?;
    fs::write(&manifest_path, bytes)
        .await
        .with_context(|| format!("writing {}", manifest_path.display()))?;

    Ok(report_dir)
}

fn render_brief(record: &RunRecord) -> String {
    let windows = record
        .windows
        .iter()
        .map(|w| match &w.window {
            Some(window) => format!("- {}: {} ({} rows)", w.source_id, window, w.fetched_rows),
            None => format!("- {}: nothing to fetch", w.source_id),
        })
        .collect::<Vec<_>>()
        .join("\n");
    format!(
        "# Download Count Run\n\n- Run ID: `{}`\n- Mode: {:?}\n- Started: {}\n- Today: {}\n- Content paths: {} (total {})\n- Link keys: {} (total {})\n- Unresolved urls: {} ({} clicks)\n\n## Windows\n{}\n",
        record.run_id,
        record.mode,
        record.started_at,
        record.today,
        record.content_paths,
        record.content_total,
        record.link_keys,
        record.link_total,
        record.unresolved_urls,
        record.unresolved_clicks,
        windows
    )
}

fn write_parquet(path: &Path, batch: RecordBatch) -> Result<()> {
    let file = File::create(path).with_context(|| format!("creating {}", path.display()))?;
    let mut writer = ArrowWriter::try_new(file, batch.schema(), None)
        .with_context(|| format!("opening parquet writer {}", path.display()))?;
    writer
        .write(&batch)
        .with_context(|| format!("writing record batch {}", path.display()))?;
    writer
        .close()
        .with_context(|| format!("closing parquet writer {}", path.display()))?;
    Ok(())
}

fn write_content_parquet(path: &Path, counts: &ResolvedCounts) -> Result<()> {
    let schema = Arc::new(Schema::new(vec![
        ArrowField::new("path", DataType::Utf8, false),
        ArrowField::new("bucket", DataType::Utf8, false),
        ArrowField::new("count", DataType::UInt64, false),
    ]));
    let paths = StringArray::from(
        counts
            .content
            .keys()
            .map(|p| Some(p.as_str()))
            .collect::<Vec<_>>(),
    );
    let buckets = StringArray::from(
        counts
            .content
            .keys()
            .map(|p| Some(p.bucket()))
            .collect::<Vec<_>>(),
    );
    let values = UInt64Array::from(counts.content.iter().map(|(_, v)| v).collect::<Vec<_>>());

    let batch = RecordBatch::try_new(
        schema,
        vec![Arc::new(paths), Arc::new(buckets), Arc::new(values)],
    )
    .context("building content_counts record batch")?;
    write_parquet(path, batch)
}

fn write_links_parquet(path: &Path, counts: &ResolvedCounts) -> Result<()> {
    let schema = Arc::new(Schema::new(vec![
        ArrowField::new("key", DataType::Utf8, false),
        ArrowField::new("clicks", DataType::UInt64, false),
    ]));
    let keys = StringArray::from(
        counts
            .links
            .keys()
            .map(|k| Some(k.as_str()))
            .collect::<Vec<_>>(),
    );
    let values = UInt64Array::from(counts.links.iter().map(|(_, v)| v).collect::<Vec<_>>());
    let batch = RecordBatch::try_new(schema, vec![Arc::new(keys), Arc::new(values)])
        .context("building link_counts record batch")?;
    write_parquet(path, batch)
}

fn manifest_entry(name: &str, report_dir: &Path, path: &Path) -> Result<SnapshotManifestFile> {
    let bytes = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    let sha256 = hex::encode(hasher.finalize());
    let rel = path
        .strip_prefix(report_dir)
        .unwrap_or(path)
        .display()
        .to_string();
    Ok(SnapshotManifestFile {
        name: name.to_string(),
        path: rel,
        sha256,
        bytes: bytes.len() as u64,
    })
}

/// Markdown digest of the `runs` most recent reports under `reports_root`.
pub fn report_recent_runs(runs: usize, reports_root: &Path) -> Result<String> {
    let mut dirs = std::fs::read_dir(reports_root)
        .with_context(|| format!("reading {}", reports_root.display()))?
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().map(|ft| ft.is_dir()).unwrap_or(false))
        .collect::<Vec<_>>();
    dirs.sort_by_key(|e| e.metadata().and_then(|m| m.modified()).ok());
    dirs.reverse();
    let dirs = dirs.into_iter().take(runs.max(1)).collect::<Vec<_>>();

    let mut lines = vec!["# Recent Download Count Runs".to_string(), String::new()];
    for dir in dirs {
        let record_path = dir.path().join("run.json");
        let record: RunRecord = serde_json::from_str(
            &std::fs::read_to_string(&record_path)
                .with_context(|| format!("reading {}", record_path.display()))?,
        )
        .with_context(|| format!("parsing {}", record_path.display()))?;

        lines.push(format!("## Run `{}` ({:?}, {})", record.run_id, record.mode, record.today));
        for w in &record.windows {
            match &w.window {
                Some(window) => lines.push(format!("- {}: {}", w.source_id, window)),
                None => lines.push(format!("- {}: no new window", w.source_id)),
            }
        }
        lines.push(format!(
            "- content: {} paths, {} total",
            record.content_paths, record.content_total
        ));
        lines.push(format!("- links: {} keys, {} total", record.link_keys, record.link_total));
        if record.unresolved_urls > 0 {
            lines.push(format!(
                "- unresolved: {} urls, {} clicks (`{}`)",
                record.unresolved_urls,
                record.unresolved_clicks,
                dir.path().join("unresolved.json").display()
            ));
        }
        let manifest_path = dir.path().join("snapshots").join("manifest.json");
        if manifest_path.exists() {
            lines.push(format!("- parquet manifest: `{}`", manifest_path.display()));
        }
        lines.push(String::new());
    }

    Ok(lines.join("\n"))
}
