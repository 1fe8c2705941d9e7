//! Per-day reconciliation: fetch with tier fallback, resolve listing attributes, replace-write.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use avstat_adapters::{ApiError, BearerToken, ListingCatalog, MarketplaceApi};
use avstat_core::{format_date, DayMetrics, Listing, ListingDetail, ListingId, MetricsTier, SheetRow};
use avstat_storage::{Sleeper, SinkWriter, Worksheet};
use chrono::NaiveDate;
use serde::Serialize;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Default)]
struct CacheEntry {
    detail: ListingDetail,
    looked_up: bool,
}

/// Run-scoped memo of listing attributes. Each listing is looked up at most once per run.
#[derive(Debug)]
pub struct ListingDetailCache {
    entries: BTreeMap<ListingId, CacheEntry>,
    throttle: Duration,
    sleeper: Arc<dyn Sleeper>,
    lookups: usize,
}

impl ListingDetailCache {
    pub fn new(throttle: Duration, sleeper: Arc<dyn Sleeper>) -> Self {
        Self {
            entries: BTreeMap::new(),
            throttle,
            sleeper,
            lookups: 0,
        }
    }

    pub fn seed_catalog(&mut self, catalog: &ListingCatalog) {
        for (id, detail) in &catalog.details {
            self.seed(*id, detail);
        }
    }

    /// Records attributes learned elsewhere without counting as a lookup.
    pub fn seed(&mut self, id: ListingId, detail: &ListingDetail) {
        self.entries.entry(id).or_default().detail.fill_from(detail);
    }

    pub fn get(&self, id: ListingId) -> Option<&ListingDetail> {
        self.entries.get(&id).map(|entry| &entry.detail)
    }

    /// Number of detail requests issued so far.
    pub fn lookups(&self) -> usize {
        self.lookups
    }

    pub async fn resolve<A>(&mut self, api: &A, token: &BearerToken, id: ListingId) -> Result<Listing, ApiError>
    where
        A: MarketplaceApi + ?Sized,
    {
        let needs_lookup = self
            .entries
            .get(&id)
            .map_or(true, |entry| !entry.looked_up && !entry.detail.is_complete());

        if needs_lookup {
            if self.lookups > 0 && !self.throttle.is_zero() {
                self.sleeper.sleep(self.throttle).await;
            }
            self.lookups += 1;
            let fetched = api.fetch_listing_detail(token, id).await?;
            let entry = self.entries.entry(id).or_default();
            entry.looked_up = true;
            match fetched {
                Some(detail) => entry.detail.fill_from(&detail),
                None => debug!(listing_id = id, "no detail upstream, using blanks"),
            }
        }

        let detail = self.get(id).cloned().unwrap_or_default();
        Ok(Listing::resolve(id, &detail))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DayOutcome {
    pub date: NaiveDate,
    pub tier: MetricsTier,
    pub active: usize,
    pub deleted: usize,
    pub appended: usize,
    /// No listing was active, so the sheet was left untouched.
    pub skipped: bool,
}

#[derive(Debug, Clone)]
pub struct DayReconciler {
    writer: SinkWriter,
    scope: Option<BTreeSet<ListingId>>,
}

impl DayReconciler {
    pub fn new(writer: SinkWriter) -> Self {
        Self { writer, scope: None }
    }

    /// Restricts written rows to these listings.
    pub fn with_scope(mut self, scope: Option<BTreeSet<ListingId>>) -> Self {
        self.scope = scope;
        self
    }

    async fn fetch_day<A>(
        &self,
        api: &A,
        token: &BearerToken,
        listing_ids: &[ListingId],
        date: NaiveDate,
    ) -> Result<DayMetrics>
    where
        A: MarketplaceApi + ?Sized,
    {
        match api.fetch_profile_metrics(token, date).await {
            Ok(metrics) => Ok(metrics),
            Err(err) if err.is_tier_failure() => {
                warn!(%date, error = %err, "profile stats unavailable, falling back to legacy stats");
                api.fetch_legacy_metrics(token, listing_ids, date)
                    .await
                    .with_context(|| format!("fetching legacy stats for {date}"))
            }
            Err(err) => Err(err).with_context(|| format!("fetching profile stats for {date}")),
        }
    }

    pub async fn reconcile<A, W>(
        &self,
        api: &A,
        token: &BearerToken,
        listing_ids: &[ListingId],
        cache: &mut ListingDetailCache,
        sheet: &mut W,
        date: NaiveDate,
    ) -> Result<DayOutcome>
    where
        A: MarketplaceApi + ?Sized,
        W: Worksheet + ?Sized,
    {
        let mut metrics = self.fetch_day(api, token, listing_ids, date).await?;
        if let Some(scope) = &self.scope {
            metrics.records.retain(|id, _| scope.contains(id));
        }

        if metrics.is_empty() {
            info!(%date, tier = %metrics.tier, "no active listings, sheet left untouched");
            return Ok(DayOutcome {
                date,
                tier: metrics.tier,
                active: 0,
                deleted: 0,
                appended: 0,
                skipped: true,
            });
        }

        let mut rows = Vec::with_capacity(metrics.len());
        for (id, record) in &metrics.records {
            if record.title.is_some() {
                cache.seed(
                    *id,
                    &ListingDetail {
                        title: record.title.clone(),
                        promo: None,
                    },
                );
            }
            let listing = cache
                .resolve(api, token, *id)
                .await
                .with_context(|| format!("resolving listing {id}"))?;
            rows.push(SheetRow::build(&listing, record));
        }

        let day = format_date(date);
        let outcome = self
            .writer
            .replace_date(sheet, &day, &rows)
            .await
            .with_context(|| format!("writing rows for {day}"))?;
        info!(
            %date,
            tier = %metrics.tier,
            active = metrics.len(),
            deleted = outcome.deleted,
            appended = outcome.appended,
            "day reconciled"
        );

        Ok(DayOutcome {
            date,
            tier: metrics.tier,
            active: metrics.len(),
            deleted: outcome.deleted,
            appended: outcome.appended,
            skipped: false,
        })
    }
}
