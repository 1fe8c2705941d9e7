use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use avstat_core::{
    format_date, DayMetrics, ListingDetail, ListingId, MetricsTier, LEGACY_METRICS, PROFILE_METRICS,
};
use avstat_storage::{ApiRequest, FetchError, HttpFetcher};
use chrono::NaiveDate;
use serde_json::{json, Value as JsonValue};
use tracing::{debug, info, warn};

use crate::{
    extract_resources, parse_detail, parse_listing_resource, parse_metric_records, ApiError,
    BearerToken, ListingCatalog, MarketplaceApi, LEGACY_STATS_ADAPTERS, LISTING_PAGE_ADAPTERS,
    PROFILE_STATS_ADAPTERS,
};

pub const DEFAULT_API_BASE_URL: &str = "https://api.avito.ru";
pub const LISTING_PAGE_SIZE: usize = 100;
pub const LISTING_STATUSES: &str = "active,old,removed,blocked,rejected";
pub const PROFILE_PAGE_SIZE: usize = 1000;
pub const LEGACY_BATCH_SIZE: usize = 200;
/// Hard ceiling on pages per paginated walk.
pub const MAX_PAGES: usize = 200;

#[derive(Debug, Clone)]
pub struct AvitoSettings {
    pub client_id: String,
    pub client_secret: String,
    pub user_id: String,
    pub base_url: String,
    /// Overrides the profile stats URL; `{user_id}` is substituted.
    pub profile_stats_template: Option<String>,
    pub throttle: Duration,
    pub stats_timeout: Duration,
}

impl AvitoSettings {
    pub fn new(
        client_id: impl Into<String>,
        client_secret: impl Into<String>,
        user_id: impl Into<String>,
    ) -> Self {
        Self {
            client_id: client_id.into(),
            client_secret: client_secret.into(),
            user_id: user_id.into(),
            base_url: DEFAULT_API_BASE_URL.to_string(),
            profile_stats_template: None,
            throttle: Duration::from_millis(150),
            stats_timeout: Duration::from_secs(120),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url.trim_end_matches('/'), path)
    }

    pub fn token_url(&self) -> String {
        self.url("/token")
    }

    pub fn account_listings_url(&self) -> String {
        self.url(&format!("/core/v1/accounts/{}/items", self.user_id))
    }

    pub fn fallback_listings_url(&self) -> String {
        self.url("/core/v1/items")
    }

    pub fn listing_detail_url(&self, listing_id: ListingId) -> String {
        self.url(&format!("/core/v1/accounts/{}/items/{}/", self.user_id, listing_id))
    }

    pub fn profile_stats_url(&self) -> String {
        match &self.profile_stats_template {
            Some(template) => template.replace("{user_id}", &self.user_id),
            None => self.url(&format!("/stats/v2/accounts/{}/items", self.user_id)),
        }
    }

    pub fn legacy_stats_url(&self) -> String {
        self.url(&format!("/stats/v1/accounts/{}/items", self.user_id))
    }
}

pub struct AvitoClient {
    http: Arc<HttpFetcher>,
    settings: AvitoSettings,
}

impl AvitoClient {
    pub fn new(http: Arc<HttpFetcher>, settings: AvitoSettings) -> Self {
        Self { http, settings }
    }

    async fn listing_page(&self, token: &BearerToken, page: usize) -> Result<JsonValue, ApiError> {
        let request = |url: String| {
            ApiRequest::get(url)
                .bearer(token.secret())
                .query("per_page", LISTING_PAGE_SIZE)
                .query("page", page)
                .query("status", LISTING_STATUSES)
        };

        let response = match self
            .http
            .execute(&request(self.settings.account_listings_url()))
            .await
        {
            Ok(response) => response,
            Err(err) if err.is_not_found() => {
                debug!(page, "account listing path not found, using account-agnostic path");
                self.http
                    .execute(&request(self.settings.fallback_listings_url()))
                    .await?
            }
            Err(err) => return Err(err.into()),
        };
        Ok(response.json()?)
    }
}

#[async_trait]
impl MarketplaceApi for AvitoClient {
    async fn fetch_token(&self) -> Result<BearerToken, ApiError> {
        let form = vec![
            ("grant_type".to_string(), "client_credentials".to_string()),
            ("client_id".to_string(), self.settings.client_id.clone()),
            ("client_secret".to_string(), self.settings.client_secret.clone()),
        ];
        let response = self
            .http
            .execute(&ApiRequest::post_form(self.settings.token_url(), form))
            .await
            .map_err(|err| match err {
                FetchError::HttpStatus { status, body, .. } => {
                    ApiError::Auth(format!("token endpoint returned {status}: {body}"))
                }
                other => ApiError::Fetch(other),
            })?;
        info!(status = response.status.as_u16(), "token acquired");

        let payload: JsonValue = response.json()?;
        payload
            .get("access_token")
            .and_then(JsonValue::as_str)
            .filter(|token| !token.is_empty())
            .map(BearerToken::new)
            .ok_or_else(|| ApiError::Auth("token response has no access_token".to_string()))
    }

    async fn list_listings(&self, token: &BearerToken) -> Result<ListingCatalog, ApiError> {
        let mut catalog = ListingCatalog::default();
        let mut page = 1usize;
        loop {
            let payload = self.listing_page(token, page).await?;
            let resources = extract_resources(LISTING_PAGE_ADAPTERS, &payload, "listing page");
            if resources.is_empty() {
                break;
            }
            for resource in resources {
                if let Some((id, detail)) = parse_listing_resource(resource) {
                    catalog.insert(id, detail);
                }
            }
            info!(page, items = resources.len(), "listing page fetched");

            if resources.len() < LISTING_PAGE_SIZE {
                break;
            }
            if page >= MAX_PAGES {
                warn!(page, "listing page ceiling reached, stopping");
                break;
            }
            page += 1;
            self.http.pause(self.settings.throttle).await;
        }
        catalog.normalize();
        info!(listings = catalog.len(), "listing directory collected");
        Ok(catalog)
    }

    async fn fetch_profile_metrics(
        &self,
        token: &BearerToken,
        date: NaiveDate,
    ) -> Result<DayMetrics, ApiError> {
        let url = self.settings.profile_stats_url();
        let day = format_date(date);
        let mut metrics = DayMetrics::new(date, MetricsTier::Profile);
        let mut offset = 0usize;
        let mut pages = 0usize;
        let mut dropped = 0usize;

        loop {
            let body = json!({
                "dateFrom": day,
                "dateTo": day,
                "grouping": "item",
                "limit": PROFILE_PAGE_SIZE,
                "offset": offset,
                "metrics": PROFILE_METRICS,
            });
            let request = ApiRequest::post_json(url.clone(), body)
                .bearer(token.secret())
                .timeout(self.settings.stats_timeout);
            let payload: JsonValue = self.http.execute(&request).await?.json()?;

            let elements = extract_resources(PROFILE_STATS_ADAPTERS, &payload, "profile stats");
            for element in elements {
                for record in parse_metric_records(element, &PROFILE_METRICS) {
                    if !metrics.insert(record) {
                        dropped += 1;
                    }
                }
            }
            pages += 1;

            if elements.len() < PROFILE_PAGE_SIZE {
                break;
            }
            if pages >= MAX_PAGES {
                warn!(date = %day, pages, "profile stats page ceiling reached, stopping");
                break;
            }
            offset += PROFILE_PAGE_SIZE;
            self.http.pause(self.settings.throttle).await;
        }

        if dropped > 0 {
            debug!(date = %day, dropped, "records for other dates dropped");
        }
        info!(date = %day, listings = metrics.len(), pages, "profile stats fetched");
        Ok(metrics)
    }

    async fn fetch_legacy_metrics(
        &self,
        token: &BearerToken,
        listing_ids: &[ListingId],
        date: NaiveDate,
    ) -> Result<DayMetrics, ApiError> {
        let url = self.settings.legacy_stats_url();
        let day = format_date(date);
        let mut metrics = DayMetrics::new(date, MetricsTier::Legacy);

        for (idx, batch) in listing_ids.chunks(LEGACY_BATCH_SIZE).enumerate() {
            if idx > 0 {
                self.http.pause(self.settings.throttle).await;
            }
            let body = json!({
                "dateFrom": day,
                "dateTo": day,
                "fields": LEGACY_METRICS,
                "itemIds": batch,
                "periodGrouping": "day",
            });
            let request = ApiRequest::post_json(url.clone(), body)
                .bearer(token.secret())
                .timeout(self.settings.stats_timeout);
            let payload: JsonValue = self.http.execute(&request).await?.json()?;

            for element in extract_resources(LEGACY_STATS_ADAPTERS, &payload, "legacy stats") {
                for record in parse_metric_records(element, &LEGACY_METRICS) {
                    metrics.insert(record);
                }
            }
            debug!(date = %day, batch = idx, size = batch.len(), "legacy batch fetched");
        }

        info!(date = %day, listings = metrics.len(), "legacy stats fetched");
        Ok(metrics)
    }

    async fn fetch_listing_detail(
        &self,
        token: &BearerToken,
        listing_id: ListingId,
    ) -> Result<Option<ListingDetail>, ApiError> {
        let request = ApiRequest::get(self.settings.listing_detail_url(listing_id)).bearer(token.secret());
        match self.http.execute(&request).await {
            Ok(response) => {
                let payload: JsonValue = response.json()?;
                Ok(Some(parse_detail(&payload)))
            }
            Err(err) if err.is_not_found() => {
                info!(listing_id, "listing detail not found, skipping");
                Ok(None)
            }
            Err(err) => Err(err.into()),
        }
    }
}
