//! Sync pipeline orchestration: one run reconciles every selected date in ascending order.

use std::collections::BTreeSet;
use std::sync::Arc;

use anyhow::{Context, Result};
use avstat_adapters::{AvitoClient, BearerToken, ListingCatalog, MarketplaceApi};
use avstat_core::{required_columns, ListingId};
use avstat_storage::{
    AccessTokenSource, GoogleSheets, GoogleWorksheet, HttpClientConfig, HttpFetcher, ServiceAccountKey,
    Sleeper, SinkWriter, TokioSleeper, Worksheet,
};
use chrono::{DateTime, Local, NaiveDate, Utc};
use serde::Serialize;
use tracing::{info, info_span, Instrument};
use uuid::Uuid;

pub mod config;
pub mod reconcile;

pub use config::{ApiConfig, ConfigError, DateSelection, DateSpan, SyncConfig};
pub use reconcile::{DayOutcome, DayReconciler, ListingDetailCache};

pub const CRATE_NAME: &str = "avstat-sync";
pub const USER_AGENT: &str = concat!("avstat/", env!("CARGO_PKG_VERSION"));

#[derive(Debug, Clone, Serialize)]
pub struct SyncRunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    pub listings: usize,
    pub detail_lookups: usize,
    pub days: Vec<DayOutcome>,
}

impl SyncRunSummary {
    pub fn rows_written(&self) -> usize {
        self.days.iter().map(|day| day.appended).sum()
    }
}

pub struct SyncPipeline<A, W> {
    config: Arc<SyncConfig>,
    api: A,
    sheet: W,
    sleeper: Arc<dyn Sleeper>,
}

impl SyncPipeline<AvitoClient, GoogleWorksheet> {
    /// Wires the production marketplace client and spreadsheet sink.
    pub async fn connect(config: SyncConfig) -> Result<Self> {
        let key = ServiceAccountKey::from_json(&config.google_service_json)
            .context("GOOGLE_SERVICE_JSON")?;
        let http = Arc::new(
            HttpFetcher::new(HttpClientConfig {
                timeout: config.api.http_timeout,
                user_agent: Some(USER_AGENT.to_string()),
                ..Default::default()
            })
            .context("building http client")?,
        );

        let api = AvitoClient::new(http.clone(), config.api.avito_settings());
        let sheet = GoogleSheets::new(http, AccessTokenSource::ServiceAccount(key), &config.sheet_id)
            .open_worksheet(&config.worksheet, &required_columns())
            .await
            .with_context(|| format!("opening worksheet {}", config.worksheet))?;

        Ok(Self::new(config, api, sheet))
    }
}

impl<A, W> SyncPipeline<A, W>
where
    A: MarketplaceApi,
    W: Worksheet,
{
    pub fn new(config: SyncConfig, api: A, sheet: W) -> Self {
        Self {
            config: Arc::new(config),
            api,
            sheet,
            sleeper: Arc::new(TokioSleeper),
        }
    }

    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    pub fn api(&self) -> &A {
        &self.api
    }

    pub fn sheet(&self) -> &W {
        &self.sheet
    }

    pub async fn run_once(&mut self) -> Result<SyncRunSummary> {
        self.run_for(Local::now().date_naive()).await
    }

    /// Same as [`run_once`](Self::run_once) with an explicit "today" for the default date mode.
    pub async fn run_for(&mut self, today: NaiveDate) -> Result<SyncRunSummary> {
        let run_id = Uuid::new_v4();
        let span = info_span!("sync_run", %run_id);
        self.run_inner(run_id, today).instrument(span).await
    }

    async fn run_inner(&mut self, run_id: Uuid, today: NaiveDate) -> Result<SyncRunSummary> {
        let started_at = Utc::now();
        let dates = self.config.dates.resolve(today);
        info!(start = %dates.start, end = %dates.end, "sync run started");

        let token = self.api.fetch_token().await.context("acquiring marketplace token")?;
        let catalog = self.catalog(&token).await?;
        let listing_ids: Vec<ListingId> = catalog.ids.clone();

        let mut cache = ListingDetailCache::new(self.config.api.throttle, self.sleeper.clone());
        cache.seed_catalog(&catalog);

        let scope = self
            .config
            .item_ids
            .as_ref()
            .map(|ids| ids.iter().copied().collect::<BTreeSet<_>>());
        let reconciler = DayReconciler::new(SinkWriter::new(required_columns())).with_scope(scope);

        let mut days = Vec::new();
        for date in dates.days() {
            let outcome = reconciler
                .reconcile(&self.api, &token, &listing_ids, &mut cache, &mut self.sheet, date)
                .instrument(info_span!("day", %date))
                .await?;
            days.push(outcome);
        }

        let summary = SyncRunSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            start_date: dates.start,
            end_date: dates.end,
            listings: listing_ids.len(),
            detail_lookups: cache.lookups(),
            days,
        };
        info!(
            days = summary.days.len(),
            rows = summary.rows_written(),
            lookups = summary.detail_lookups,
            "sync run finished"
        );
        Ok(summary)
    }

    async fn catalog(&self, token: &BearerToken) -> Result<ListingCatalog> {
        match &self.config.item_ids {
            Some(ids) => {
                info!(listings = ids.len(), "using explicit listing ids");
                Ok(ListingCatalog::from_ids(ids.iter().copied()))
            }
            None => self
                .api
                .list_listings(token)
                .await
                .context("collecting listing directory"),
        }
    }
}

pub async fn run_sync(config: SyncConfig) -> Result<SyncRunSummary> {
    let mut pipeline = SyncPipeline::connect(config).await?;
    pipeline.run_once().await
}

/// Lists the account's listings without touching the sink.
pub async fn list_listings(config: &ApiConfig) -> Result<ListingCatalog> {
    let http = HttpFetcher::new(HttpClientConfig {
        timeout: config.http_timeout,
        user_agent: Some(USER_AGENT.to_string()),
        ..Default::default()
    })
    .context("building http client")?;
    let api = AvitoClient::new(Arc::new(http), config.avito_settings());
    let token = api.fetch_token().await.context("acquiring marketplace token")?;
    api.list_listings(&token).await.context("collecting listing directory")
}
