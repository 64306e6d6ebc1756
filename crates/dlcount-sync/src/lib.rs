use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{NaiveDate, Utc};
use dlcount_adapters::{
    fixture_paths, render_dimensions_listing, render_metrics_listing, FetchContext,
    FixtureReportClient, Ga4PurchaseClient, PropertyMetadata, PurchaseReportClient,
    SearchConsoleReferralClient, SearchReferralClient,
};
use dlcount_core::{CountTable, ReconcileError, SourceId, Watermark};
use dlcount_storage::{
    encode_count_table, encode_watermarks, ArtifactStore, HttpClientConfig, HttpFetcher,
    StagedCommit, WatermarkFile,
};
use tracing::info;
use uuid::Uuid;

pub mod accumulate;
pub mod config;
pub mod normalize;
pub mod pipeline;
pub mod report;
pub mod resolve;
pub mod watermark;

pub use config::{CatalogConfig, DataLayout, ReconcileConfig};
pub use pipeline::{ReconcilePipeline, RunMode, RunState, RunSummary, SourceWindow};
pub use report::report_recent_runs;

pub const CRATE_NAME: &str = "dlcount-sync";

/// Provider clients for a config: fixture files when `fixtures_dir` is set,
/// otherwise the live GA4 and Search Console APIs.
pub fn clients_from_config(
    config: &ReconcileConfig,
) -> Result<(Arc<dyn PurchaseReportClient>, Arc<dyn SearchReferralClient>)> {
    if let Some(dir) = &config.fixtures_dir {
        let (purchase_path, referral_path) = fixture_paths(dir);
        info!(dir = %dir.display(), "using fixture provider clients");
        let purchases: Arc<dyn PurchaseReportClient> =
            Arc::new(FixtureReportClient::from_path(purchase_path)?);
        let referrals: Arc<dyn SearchReferralClient> =
            Arc::new(FixtureReportClient::from_path(referral_path)?);
        return Ok((purchases, referrals));
    }

    let token = access_token(config)?;
    let http = http_fetcher(config)?;
    let artifacts = ArtifactStore::new(config.artifacts_dir.clone());
    let purchases: Arc<dyn PurchaseReportClient> = Arc::new(ga4_client(config, http.clone())?);
    let referrals: Arc<dyn SearchReferralClient> = Arc::new(
        SearchConsoleReferralClient::new(http, config.search_console_site.clone(), token)
            .with_artifacts(artifacts),
    );
    Ok((purchases, referrals))
}

fn access_token(config: &ReconcileConfig) -> Result<String> {
    Ok(config.access_token.clone().ok_or_else(|| {
        ReconcileError::Configuration("GOOGLE_ACCESS_TOKEN is not set".to_string())
    })?)
}

fn http_fetcher(config: &ReconcileConfig) -> Result<Arc<HttpFetcher>> {
    Ok(Arc::new(HttpFetcher::new(HttpClientConfig {
        timeout: Duration::from_secs(config.http_timeout_secs),
        user_agent: Some(config.user_agent.clone()),
        ..Default::default()
    })?))
}

fn ga4_client(config: &ReconcileConfig, http: Arc<HttpFetcher>) -> Result<Ga4PurchaseClient> {
    let property_id = config.ga4_property_id.clone().ok_or_else(|| {
        ReconcileError::Configuration("GA4_PROPERTY_ID is not set".to_string())
    })?;
    Ok(Ga4PurchaseClient::new(http, property_id, access_token(config)?)
        .with_artifacts(ArtifactStore::new(config.artifacts_dir.clone())))
}

/// Writes `<property>_metrics.txt` and `<property>_dimensions.txt` into `dir`,
/// listing what the GA4 property understands.
pub async fn write_property_metadata(config: &ReconcileConfig, dir: &Path) -> Result<Vec<PathBuf>> {
    let client = ga4_client(config, http_fetcher(config)?)?;
    let ctx = FetchContext {
        run_id: Uuid::new_v4(),
        fetched_at: Utc::now(),
    };
    let metadata = client
        .metadata(&ctx)
        .await
        .map_err(|err| ReconcileError::Fetch {
            source_id: SourceId::PurchaseReport,
            message: err.to_string(),
        })?;
    stage_metadata_listings(client.property_id(), &metadata, dir).await
}

async fn stage_metadata_listings(
    property_id: &str,
    metadata: &PropertyMetadata,
    dir: &Path,
) -> Result<Vec<PathBuf>> {
    let mut commit = StagedCommit::new();
    commit
        .stage(
            &dir.join(format!("{property_id}_metrics.txt")),
            render_metrics_listing(metadata).as_bytes(),
        )
        .await?;
    commit
        .stage(
            &dir.join(format!("{property_id}_dimensions.txt")),
            render_dimensions_listing(metadata).as_bytes(),
        )
        .await?;
    let written = commit.commit().await?;
    info!(property_id, dir = %dir.display(), "wrote property metadata listings");
    Ok(written)
}

fn config_from_env(dest: Option<PathBuf>) -> Result<ReconcileConfig> {
    let config = ReconcileConfig::from_env()?;
    Ok(match dest {
        Some(dest) => config.with_dest(dest),
        None => config,
    })
}

pub async fn run_archive_from_env(dest: Option<PathBuf>) -> Result<RunSummary> {
    let config = config_from_env(dest)?;
    let catalog = config.load_catalog()?;
    let (purchases, referrals) = clients_from_config(&config)?;
    ReconcilePipeline::new(config, catalog)
        .with_clients(purchases, referrals)
        .run_archive()
        .await
}

/// Build run. Credentials are only required when `topup` is set.
pub async fn run_build_from_env(dest: Option<PathBuf>, topup: bool) -> Result<RunSummary> {
    let config = config_from_env(dest)?;
    let catalog = config.load_catalog()?;
    let pipeline = ReconcilePipeline::new(config.clone(), catalog);
    let pipeline = if topup {
        let (purchases, referrals) = clients_from_config(&config)?;
        pipeline.with_clients(purchases, referrals)
    } else {
        pipeline
    };
    pipeline.run_build(topup).await
}

/// Creates empty archives and watermarks for a fresh data directory; the
/// first archive run then fetches from `since`. Existing files are never
/// overwritten.
pub async fn init_data_dir(config: &ReconcileConfig, since: NaiveDate) -> Result<Vec<PathBuf>> {
    let layout = config.layout();
    let watermark_date = since
        .pred_opt()
        .with_context(|| format!("no day before {since}"))?;

    let targets: [&Path; 3] = [
        &layout.watermarks,
        &layout.purchase_archive,
        &layout.referral_archive,
    ];
    if let Some(existing) = targets.iter().find(|p| p.exists()) {
        return Err(ReconcileError::Configuration(format!(
            "{} already exists; refusing to reinitialize",
            existing.display()
        ))
        .into());
    }

    let marks: WatermarkFile = SourceId::ARCHIVED
        .into_iter()
        .map(|source_id| {
            (
                source_id,
                Watermark {
                    end_date: watermark_date,
                },
            )
        })
        .collect();
    let empty = CountTable::<String>::new();

    let mut commit = StagedCommit::new();
    commit
        .stage(
            &layout.purchase_archive,
            &encode_count_table(&empty, DataLayout::PURCHASE_KEY, DataLayout::PURCHASE_VALUE)?,
        )
        .await?;
    commit
        .stage(
            &layout.referral_archive,
            &encode_count_table(&empty, DataLayout::REFERRAL_KEY, DataLayout::REFERRAL_VALUE)?,
        )
        .await?;
    commit
        .stage(&layout.watermarks, &encode_watermarks(&marks)?)
        .await?;
    let written = commit.commit().await?;
    info!(data_dir = %layout.root.display(), %since, "initialized data directory");
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[tokio::test]
    async fn init_writes_empty_archives_and_prior_day_watermarks() {
        let dir = tempdir().unwrap();
        let config = ReconcileConfig::rooted_at(dir.path(), date(2024, 6, 1));
        let written = init_data_dir(&config, date(2024, 5, 1)).await.unwrap();
        assert_eq!(written.len(), 3);

        let layout = config.layout();
        let marks = dlcount_storage::read_watermarks(&layout.watermarks).unwrap();
        assert_eq!(
            marks.get(&SourceId::PurchaseReport).map(|w| w.end_date),
            Some(date(2024, 4, 30))
        );
        assert_eq!(
            std::fs::read_to_string(&layout.purchase_archive).unwrap(),
            "itemId,totalPurchasers\n"
        );
    }

    #[tokio::test]
    async fn init_refuses_to_overwrite() {
        let dir = tempdir().unwrap();
        let config = ReconcileConfig::rooted_at(dir.path(), date(2024, 6, 1));
        init_data_dir(&config, date(2024, 5, 1)).await.unwrap();
        let err = init_data_dir(&config, date(2024, 5, 2)).await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ReconcileError>(),
            Some(ReconcileError::Configuration(_))
        ));
    }

    #[tokio::test]
    async fn metadata_listings_are_named_after_the_property() {
        let dir = tempdir().unwrap();
        let metadata: PropertyMetadata = serde_json::from_value(serde_json::json!({
            "dimensions": [{ "apiName": "itemId", "uiName": "Item ID", "category": "Ecommerce" }],
            "metrics": []
        }))
        .unwrap();
        let written = stage_metadata_listings("123", &metadata, dir.path()).await.unwrap();
        assert_eq!(
            written,
            vec![dir.path().join("123_metrics.txt"), dir.path().join("123_dimensions.txt")]
        );
        let dimensions = std::fs::read_to_string(dir.path().join("123_dimensions.txt")).unwrap();
        assert!(dimensions.contains("USE: itemId is a Ecommerce dimension."));
    }

    #[tokio::test]
    async fn metadata_needs_a_property_id() {
        let dir = tempdir().unwrap();
        let mut config = ReconcileConfig::rooted_at(dir.path(), date(2024, 6, 1));
        config.access_token = Some("token".to_string());
        let err = write_property_metadata(&config, dir.path()).await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ReconcileError>(),
            Some(ReconcileError::Configuration(_))
        ));
    }

    #[test]
    fn live_clients_need_credentials() {
        let dir = tempdir().unwrap();
        let config = ReconcileConfig::rooted_at(dir.path(), date(2024, 6, 1));
        let err = clients_from_config(&config).err().unwrap();
        assert!(matches!(
            err.downcast_ref::<ReconcileError>(),
            Some(ReconcileError::Configuration(_))
        ));
    }
}
