//! The reconciliation run: windows, fetch, normalize, resolve, merge, persist.

use std::path::Path;
use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, Utc};
use dlcount_adapters::{AdapterError, FetchContext, PurchaseReportClient, SearchReferralClient};
use dlcount_core::{
    CountTable, DateWindow, InvariantViolation, RawObservation, ReconcileError, ResolvedCounts,
    SourceId,
};
use dlcount_storage::{encode_count_table, read_count_table, read_url_mapping, StagedCommit};
use serde::{Deserialize, Serialize};
use tracing::{info, info_span, Instrument};
use uuid::Uuid;

use crate::accumulate::{accumulate, merge_resolved, merge_tables, union_referral_batches};
use crate::config::{CatalogConfig, DataLayout, ReconcileConfig};
use crate::normalize::{KeyNormalizer, NormalizedBatch, RejectedKey, SegmentGroup};
use crate::report::{write_run_report, RunReport};
use crate::resolve::{ResolvedClicks, UnresolvedClicks, UrlResolver};
use crate::watermark::WatermarkStore;

pub const CONTENT_COUNT_SUFFIX: &str = "download_count";
pub const LINK_CLICKS_FILE: &str = "link_clicks.csv";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunMode {
    /// Folds settled days into the archives and advances watermarks.
    Archive,
    /// Regenerates outputs from the archives; optionally tops up with unsettled days.
    Build,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Init,
    WindowComputed,
    Fetched,
    Normalized,
    Resolved,
    Merged,
    Persisted,
    Done,
    Skipped,
}

impl RunState {
    pub fn can_advance_to(self, next: RunState) -> bool {
        use RunState::*;
        matches!(
            (self, next),
            (Init, WindowComputed)
                | (WindowComputed, Fetched)
                | (WindowComputed, Skipped)
                | (Fetched, Normalized)
                | (Normalized, Resolved)
                | (Resolved, Merged)
                | (Merged, Persisted)
                | (Persisted, Done)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, RunState::Done | RunState::Skipped)
    }
}

/// Records the state history of one run and refuses out-of-order transitions.
#[derive(Debug, Clone)]
pub struct RunTracker {
    run_id: Uuid,
    history: Vec<RunState>,
}

impl RunTracker {
    pub fn new(run_id: Uuid) -> Self {
        Self {
            run_id,
            history: vec![RunState::Init],
        }
    }

    pub fn state(&self) -> RunState {
        self.history.last().copied().unwrap_or(RunState::Init)
    }

    pub fn history(&self) -> &[RunState] {
        &self.history
    }

    pub fn advance(&mut self, next: RunState) -> Result<(), InvariantViolation> {
        let current = self.state();
        if !current.can_advance_to(next) {
            return Err(InvariantViolation::IllegalTransition {
                from: format!("{current:?}"),
                to: format!("{next:?}"),
            });
        }
        info!(run_id = %self.run_id, from = ?current, to = ?next, "run state");
        self.history.push(next);
        Ok(())
    }
}

/// Fetch window of one source in a run; `None` when nothing was fetched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceWindow {
    pub source_id: SourceId,
    pub window: Option<DateWindow>,
    pub fetched_rows: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub mode: RunMode,
    pub final_state: RunState,
    pub states: Vec<RunState>,
    pub windows: Vec<SourceWindow>,
    pub content_paths: usize,
    pub content_total: u64,
    pub link_keys: usize,
    pub link_total: u64,
    pub unresolved_urls: usize,
    pub unresolved_clicks: u64,
    pub partial_segment_groups: usize,
    pub rejected_keys: usize,
    pub files_written: usize,
    pub report_dir: Option<String>,
}

impl RunSummary {
    pub fn is_skipped(&self) -> bool {
        self.final_state == RunState::Skipped
    }
}

/// Everything read from the data directory before any fetch happens.
struct RunInputs {
    watermarks: WatermarkStore,
    purchases: CountTable<String>,
    referrals: CountTable<String>,
    legacy: CountTable<String>,
    resolver: UrlResolver,
}

#[derive(Debug, Default)]
struct FreshRows {
    purchases: Vec<RawObservation>,
    referrals: Vec<(String, i64)>,
}

/// Output of normalize + resolve over every vintage of a run.
#[derive(Debug, Default)]
struct Attributed {
    counts: ResolvedCounts,
    unresolved: Vec<UnresolvedClicks>,
    partial_segment_groups: Vec<SegmentGroup>,
    rejected: Vec<RejectedKey>,
    fresh_referrals: CountTable<String>,
}

pub struct ReconcilePipeline {
    config: ReconcileConfig,
    catalog: CatalogConfig,
    normalizer: KeyNormalizer,
    purchase_client: Option<Arc<dyn PurchaseReportClient>>,
    referral_client: Option<Arc<dyn SearchReferralClient>>,
}

impl ReconcilePipeline {
    pub fn new(config: ReconcileConfig, catalog: CatalogConfig) -> Self {
        let normalizer = KeyNormalizer::from_catalog(&catalog);
        Self {
            config,
            catalog,
            normalizer,
            purchase_client: None,
            referral_client: None,
        }
    }

    pub fn with_clients(
        mut self,
        purchases: Arc<dyn PurchaseReportClient>,
        referrals: Arc<dyn SearchReferralClient>,
    ) -> Self {
        self.purchase_client = Some(purchases);
        self.referral_client = Some(referrals);
        self
    }

    pub fn config(&self) -> &ReconcileConfig {
        &self.config
    }

    /// Fetches every settled day past the watermarks, folds it into the
    /// archives and regenerates outputs. Skips when any archived source is
    /// caught up.
    pub async fn run_archive(&self) -> Result<RunSummary> {
        let run_id = Uuid::new_v4();
        let span = info_span!("reconcile_run", %run_id, mode = "archive", today = %self.config.today);
        self.archive_inner(run_id).instrument(span).await
    }

    /// Regenerates outputs from the archives. With `topup`, days between the
    /// watermark and the shorter top-up horizon are added to the outputs
    /// without touching the archives or watermarks.
    pub async fn run_build(&self, topup: bool) -> Result<RunSummary> {
        let run_id = Uuid::new_v4();
        let span = info_span!("reconcile_run", %run_id, mode = "build", topup, today = %self.config.today);
        self.build_inner(run_id, topup).instrument(span).await
    }

    async fn archive_inner(&self, run_id: Uuid) -> Result<RunSummary> {
        let started_at = Utc::now();
        let mut tracker = RunTracker::new(run_id);
        let layout = self.config.layout();
        let mut inputs = self.load_inputs(&layout)?;

        let mut windows = Vec::with_capacity(SourceId::ARCHIVED.len());
        for source_id in SourceId::ARCHIVED {
            let state = inputs.watermarks.next_window(
                source_id,
                self.config.today,
                self.config.archive_lag_days,
            )?;
            windows.push(SourceWindow {
                source_id,
                window: state.window(),
                fetched_rows: 0,
            });
        }
        tracker.advance(RunState::WindowComputed)?;

        if windows.iter().any(|w| w.window.is_none()) {
            tracker.advance(RunState::Skipped)?;
            info!("archives are caught up to the settle horizon, nothing to do");
            return Ok(summarize(
                run_id,
                started_at,
                RunMode::Archive,
                &tracker,
                windows,
                &Attributed::default(),
                0,
                None,
            ));
        }

        let fresh = self.fetch(run_id, &mut windows).await?;
        tracker.advance(RunState::Fetched)?;

        let attributed = self.attribute(&inputs, &fresh, &mut tracker)?;

        let purchase_archive = accumulate(
            &inputs.purchases,
            fresh.purchases.iter().map(|o| (o.key.clone(), o.value)),
        )?;
        let referral_archive = merge_tables(&inputs.referrals, &attributed.fresh_referrals)?;
        for w in &windows {
            if let Some(window) = w.window {
                inputs.watermarks.advance(w.source_id, window.end)?;
            }
        }
        tracker.advance(RunState::Merged)?;

        let report_dir = self
            .write_report(run_id, RunMode::Archive, started_at, &windows, &attributed)
            .await?;

        let mut commit = StagedCommit::new();
        commit
            .stage(
                &layout.purchase_archive,
                &encode_count_table(
                    &purchase_archive,
                    DataLayout::PURCHASE_KEY,
                    DataLayout::PURCHASE_VALUE,
                )?,
            )
            .await?;
        commit
            .stage(
                &layout.referral_archive,
                &encode_count_table(
                    &referral_archive,
                    DataLayout::REFERRAL_KEY,
                    DataLayout::REFERRAL_VALUE,
                )?,
            )
            .await?;
        stage_outputs(&mut commit, &self.config.dest_dir, &attributed.counts).await?;
        commit
            .stage(inputs.watermarks.path(), &inputs.watermarks.encode()?)
            .await?;
        let written = commit.commit().await?;
        tracker.advance(RunState::Persisted)?;
        tracker.advance(RunState::Done)?;

        info!(
            files = written.len(),
            content_total = attributed.counts.content.total(),
            "archive run complete"
        );
        Ok(summarize(
            run_id,
            started_at,
            RunMode::Archive,
            &tracker,
            windows,
            &attributed,
            written.len(),
            Some(report_dir),
        ))
    }

    async fn build_inner(&self, run_id: Uuid, topup: bool) -> Result<RunSummary> {
        let started_at = Utc::now();
        let mut tracker = RunTracker::new(run_id);
        let layout = self.config.layout();
        let inputs = self.load_inputs(&layout)?;

        let mut windows = Vec::with_capacity(SourceId::ARCHIVED.len());
        for source_id in SourceId::ARCHIVED {
            let window = if topup {
                inputs
                    .watermarks
                    .next_window(source_id, self.config.today, self.config.topup_lag_days)?
                    .window()
            } else {
                None
            };
            windows.push(SourceWindow {
                source_id,
                window,
                fetched_rows: 0,
            });
        }
        tracker.advance(RunState::WindowComputed)?;

        let fresh = if windows.iter().any(|w| w.window.is_some()) {
            self.fetch(run_id, &mut windows).await?
        } else {
            FreshRows::default()
        };
        tracker.advance(RunState::Fetched)?;

        let attributed = self.attribute(&inputs, &fresh, &mut tracker)?;
        tracker.advance(RunState::Merged)?;

        let report_dir = self
            .write_report(run_id, RunMode::Build, started_at, &windows, &attributed)
            .await?;

        let mut commit = StagedCommit::new();
        stage_outputs(&mut commit, &self.config.dest_dir, &attributed.counts).await?;
        let written = commit.commit().await?;
        tracker.advance(RunState::Persisted)?;
        tracker.advance(RunState::Done)?;

        info!(files = written.len(), "build run complete");
        Ok(summarize(
            run_id,
            started_at,
            RunMode::Build,
            &tracker,
            windows,
            &attributed,
            written.len(),
            Some(report_dir),
        ))
    }

    fn load_inputs(&self, layout: &DataLayout) -> Result<RunInputs> {
        let watermarks = WatermarkStore::load(&layout.watermarks)?;
        let purchases = read_count_table(
            &layout.purchase_archive,
            DataLayout::PURCHASE_KEY,
            DataLayout::PURCHASE_VALUE,
        )?;
        let referrals = read_count_table(
            &layout.referral_archive,
            DataLayout::REFERRAL_KEY,
            DataLayout::REFERRAL_VALUE,
        )?;
        let legacy = match self.catalog.legacy_static_source(&layout) {
            Some((path, legacy)) => {
                read_count_table(&path, &legacy.key_column, &legacy.value_column)?
            }
            None => CountTable::new(),
        };
        let resolver = UrlResolver::new(read_url_mapping(&layout.url_mapping)?, &self.catalog)?;
        info!(
            purchase_rows = purchases.len(),
            referral_rows = referrals.len(),
            legacy_rows = legacy.len(),
            mapping_rows = resolver.len(),
            "loaded archives"
        );
        Ok(RunInputs {
            watermarks,
            purchases,
            referrals,
            legacy,
            resolver,
        })
    }

    async fn fetch(&self, run_id: Uuid, windows: &mut [SourceWindow]) -> Result<FreshRows> {
        let ctx = FetchContext {
            run_id,
            fetched_at: Utc::now(),
        };
        let window_of = |source_id: SourceId| {
            windows
                .iter()
                .find(|w| w.source_id == source_id)
                .and_then(|w| w.window)
        };
        let purchase_window = window_of(SourceId::PurchaseReport);
        let referral_window = window_of(SourceId::SearchReferral);
        let ctx = &ctx;

        let purchases = async {
            let Some(window) = purchase_window else {
                return Ok(Vec::new());
            };
            let client = self.purchase_client.as_ref().ok_or_else(|| {
                ReconcileError::Configuration("no purchase report client configured".into())
            })?;
            info!(%window, "fetching purchase report");
            let rows = client
                .fetch(ctx, window)
                .await
                .map_err(|err| fetch_failed(SourceId::PurchaseReport, err))?;
            Ok::<_, anyhow::Error>(rows)
        };

        let referrals = async {
            let Some(window) = referral_window else {
                return Ok(Vec::new());
            };
            let client = self.referral_client.as_ref().ok_or_else(|| {
                ReconcileError::Configuration("no search referral client configured".into())
            })?;
            let mut batches = Vec::new();
            for filter in self.catalog.referral_filters() {
                info!(%window, %filter, "fetching search referrals");
                let batch = client
                    .fetch(ctx, window, &filter)
                    .await
                    .map_err(|err| fetch_failed(SourceId::SearchReferral, err))?;
                batches.push((filter, batch));
            }
            Ok::<_, anyhow::Error>(union_referral_batches(batches))
        };

        let (purchases, referrals) = tokio::try_join!(purchases, referrals)?;
        for w in windows.iter_mut() {
            w.fetched_rows = match w.source_id {
                SourceId::PurchaseReport => purchases.len(),
                SourceId::SearchReferral => referrals.len(),
                SourceId::LegacyStatic => 0,
            };
        }
        Ok(FreshRows {
            purchases,
            referrals,
        })
    }

    /// Normalizes and resolves every vintage and sums them into one table pair.
    /// Archives are stored with raw keys, so catalog and mapping fixes apply to
    /// history on the next run.
    fn attribute(
        &self,
        inputs: &RunInputs,
        fresh: &FreshRows,
        tracker: &mut RunTracker,
    ) -> Result<Attributed> {
        let batches = [
            self.normalizer.normalize_counts(inputs.purchases.iter())?,
            self.normalizer.normalize_items(
                fresh.purchases.iter().map(|o| (o.key.clone(), o.value)),
            )?,
            self.normalizer.normalize_counts(inputs.legacy.iter())?,
        ];
        tracker.advance(RunState::Normalized)?;

        let fresh_referrals = accumulate(&CountTable::new(), fresh.referrals.iter().cloned())?;
        let clicks = [
            inputs.resolver.resolve_clicks(inputs.referrals.iter())?,
            inputs.resolver.resolve_clicks(fresh_referrals.iter())?,
        ];
        tracker.advance(RunState::Resolved)?;

        let mut attributed = Attributed {
            fresh_referrals,
            ..Attributed::default()
        };
        for NormalizedBatch {
            content,
            links,
            segment_groups,
            rejected,
        } in batches
        {
            attributed.counts = merge_resolved(&attributed.counts, &ResolvedCounts { content, links })?;
            attributed
                .partial_segment_groups
                .extend(segment_groups.into_iter().filter(|g| !g.full_item_seen));
            attributed.rejected.extend(rejected);
        }
        for ResolvedClicks {
            content,
            unresolved,
        } in clicks
        {
            attributed.counts.content = merge_tables(&attributed.counts.content, &content)?;
            attributed.unresolved.extend(unresolved);
        }
        Ok(attributed)
    }

    async fn write_report(
        &self,
        run_id: Uuid,
        mode: RunMode,
        started_at: DateTime<Utc>,
        windows: &[SourceWindow],
        attributed: &Attributed,
    ) -> Result<String> {
        let dir = write_run_report(
            &self.config.reports_dir,
            &RunReport {
                run_id,
                mode,
                started_at,
                today: self.config.today,
                windows,
                counts: &attributed.counts,
                unresolved: &attributed.unresolved,
                partial_segment_groups: &attributed.partial_segment_groups,
                rejected: &attributed.rejected,
            },
        )
        .await?;
        Ok(dir.display().to_string())
    }
}

fn fetch_failed(source_id: SourceId, err: AdapterError) -> anyhow::Error {
    ReconcileError::Fetch {
        source_id,
        message: format!("{err:#}"),
    }
    .into()
}

/// Stages `content/<path>.download_count` for every content path and the
/// link-clicks table under `dest`. Files whose bytes are unchanged are left
/// alone. Returns the number of staged files.
pub async fn stage_outputs(
    commit: &mut StagedCommit,
    dest: &Path,
    counts: &ResolvedCounts,
) -> Result<usize> {
    let content_root = dest.join("content");
    let mut staged = 0;
    for (path, value) in counts.content.iter() {
        let file = content_root.join(format!("{}.{CONTENT_COUNT_SUFFIX}", path.as_str()));
        if commit
            .stage_if_changed(file, value.to_string().as_bytes())
            .await?
        {
            staged += 1;
        }
    }
    let links = encode_count_table(&counts.links, "key", "clicks")?;
    if commit
        .stage_if_changed(dest.join(LINK_CLICKS_FILE), &links)
        .await?
    {
        staged += 1;
    }
    Ok(staged)
}

#[allow(clippy::too_many_arguments)]
fn summarize(
    run_id: Uuid,
    started_at: DateTime<Utc>,
    mode: RunMode,
    tracker: &RunTracker,
    windows: Vec<SourceWindow>,
    attributed: &Attributed,
    files_written: usize,
    report_dir: Option<String>,
) -> RunSummary {
    RunSummary {
        run_id,
        started_at,
        finished_at: Utc::now(),
        mode,
        final_state: tracker.state(),
        states: tracker.history().to_vec(),
        windows,
        content_paths: attributed.counts.content.len(),
        content_total: attributed.counts.content.total(),
        link_keys: attributed.counts.links.len(),
        link_total: attributed.counts.links.total(),
        unresolved_urls: attributed.unresolved.len(),
        unresolved_clicks: attributed.unresolved.iter().map(|u| u.clicks).sum(),
        partial_segment_groups: attributed.partial_segment_groups.len(),
        rejected_keys: attributed.rejected.len(),
        files_written,
        report_dir,
    }
}
