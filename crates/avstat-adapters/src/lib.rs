//! Marketplace API contract, schema adapters for drifting payloads, and the HTTP client.

use std::collections::BTreeMap;
use std::fmt;

use async_trait::async_trait;
use avstat_core::{
    DailyMetricRecord, DayMetrics, ListingDetail, ListingId, MetricValue, PromoService, PromoSnapshot,
};
use avstat_storage::FetchError;
use chrono::NaiveDate;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{debug, warn};

pub mod avito;

pub use avito::{AvitoClient, AvitoSettings};

pub const CRATE_NAME: &str = "avstat-adapters";

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("authentication failed: {0}")]
    Auth(String),
    #[error(transparent)]
    Fetch(#[from] FetchError),
}

impl ApiError {
    /// The endpoint answered with an error status (as opposed to a transport or decode failure).
    pub fn is_tier_failure(&self) -> bool {
        matches!(self, ApiError::Fetch(FetchError::HttpStatus { .. }))
    }
}

#[derive(Clone, PartialEq, Eq)]
pub struct BearerToken(String);

impl BearerToken {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn secret(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for BearerToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("BearerToken([REDACTED])")
    }
}

/// Every listing id the directory produced, plus whatever it captured along the way.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ListingCatalog {
    pub ids: Vec<ListingId>,
    pub details: BTreeMap<ListingId, ListingDetail>,
}

impl ListingCatalog {
    pub fn from_ids(ids: impl IntoIterator<Item = ListingId>) -> Self {
        let mut catalog = Self {
            ids: ids.into_iter().collect(),
            details: BTreeMap::new(),
        };
        catalog.normalize();
        catalog
    }

    pub fn insert(&mut self, id: ListingId, detail: ListingDetail) {
        self.ids.push(id);
        if detail.title.is_some() || detail.promo.is_some() {
            self.details.entry(id).or_default().fill_from(&detail);
        }
    }

    /// Sorted and deduplicated.
    pub fn normalize(&mut self) {
        self.ids.sort_unstable();
        self.ids.dedup();
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}

#[async_trait]
pub trait MarketplaceApi: Send + Sync {
    async fn fetch_token(&self) -> Result<BearerToken, ApiError>;

    async fn list_listings(&self, token: &BearerToken) -> Result<ListingCatalog, ApiError>;

    /// Richer per-item/per-day metrics. Errors are reported, never retried beyond the transport.
    async fn fetch_profile_metrics(
        &self,
        token: &BearerToken,
        date: NaiveDate,
    ) -> Result<DayMetrics, ApiError>;

    /// Two-metric fallback, batched by listing id.
    async fn fetch_legacy_metrics(
        &self,
        token: &BearerToken,
        listing_ids: &[ListingId],
        date: NaiveDate,
    ) -> Result<DayMetrics, ApiError>;

    /// `Ok(None)` when the listing is unknown upstream.
    async fn fetch_listing_detail(
        &self,
        token: &BearerToken,
        listing_id: ListingId,
    ) -> Result<Option<ListingDetail>, ApiError>;
}

/// One known payload layout: where the resource list lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchemaAdapter {
    pub name: &'static str,
    pub pointer: &'static str,
}

pub const LISTING_PAGE_ADAPTERS: &[SchemaAdapter] = &[
    SchemaAdapter { name: "resources", pointer: "/resources" },
    SchemaAdapter { name: "items", pointer: "/items" },
    SchemaAdapter { name: "result.items", pointer: "/result/items" },
];

pub const PROFILE_STATS_ADAPTERS: &[SchemaAdapter] = &[
    SchemaAdapter { name: "result.items", pointer: "/result/items" },
    SchemaAdapter { name: "result.groupings", pointer: "/result/groupings" },
    SchemaAdapter { name: "items", pointer: "/items" },
    SchemaAdapter { name: "result", pointer: "/result" },
];

pub const LEGACY_STATS_ADAPTERS: &[SchemaAdapter] = &[
    SchemaAdapter { name: "result.items", pointer: "/result/items" },
    SchemaAdapter { name: "items", pointer: "/items" },
];

#[derive(Debug, Clone, PartialEq)]
pub enum SchemaMatch<'a> {
    Matched {
        adapter: &'static str,
        resources: &'a [JsonValue],
    },
    /// A known list was present but empty.
    Empty,
    /// No known layout at all.
    Drift,
}

/// Tries adapters in order; the first non-empty list wins.
pub fn match_resources<'a>(adapters: &[SchemaAdapter], payload: &'a JsonValue) -> SchemaMatch<'a> {
    let mut saw_list = false;
    for adapter in adapters {
        if let Some(list) = payload.pointer(adapter.pointer).and_then(JsonValue::as_array) {
            if !list.is_empty() {
                return SchemaMatch::Matched {
                    adapter: adapter.name,
                    resources: list.as_slice(),
                };
            }
            saw_list = true;
        }
    }
    if saw_list {
        SchemaMatch::Empty
    } else {
        SchemaMatch::Drift
    }
}

/// Like [`match_resources`], logging the outcome; drift is treated as an empty page.
pub fn extract_resources<'a>(
    adapters: &[SchemaAdapter],
    payload: &'a JsonValue,
    context: &str,
) -> &'a [JsonValue] {
    match match_resources(adapters, payload) {
        SchemaMatch::Matched { adapter, resources } => {
            debug!(context, adapter, count = resources.len(), "schema adapter matched");
            resources
        }
        SchemaMatch::Empty => {
            debug!(context, "empty resource list");
            &[]
        }
        SchemaMatch::Drift => {
            let keys: Vec<&str> = payload
                .as_object()
                .map(|obj| obj.keys().map(String::as_str).collect())
                .unwrap_or_default();
            warn!(context, ?keys, "response matches no known schema, treating as empty");
            &[]
        }
    }
}

fn first_field<'a>(value: &'a JsonValue, keys: &[&str]) -> Option<&'a JsonValue> {
    keys.iter()
        .filter_map(|key| value.get(*key))
        .find(|v| !v.is_null())
}

fn json_text(value: &JsonValue) -> Option<String> {
    match value {
        JsonValue::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        JsonValue::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn first_text(value: &JsonValue, keys: &[&str]) -> Option<String> {
    keys.iter()
        .filter_map(|key| value.get(*key))
        .find_map(json_text)
}

pub fn listing_id_of(value: &JsonValue, keys: &[&str]) -> Option<ListingId> {
    let id = match first_field(value, keys)? {
        JsonValue::Number(n) => n.as_u64(),
        JsonValue::String(s) => s.trim().parse::<ListingId>().ok(),
        _ => None,
    }?;
    (id > 0).then_some(id)
}

/// Accepts `YYYY-MM-DD` or anything starting with it (e.g. an RFC 3339 timestamp).
pub fn date_of(value: &JsonValue) -> Option<NaiveDate> {
    let raw = first_field(value, &["date", "day", "period"])?.as_str()?;
    let head = raw.get(..10).unwrap_or(raw);
    avstat_core::parse_date(head).ok()
}

/// Promotion entries are either bare flag strings or objects.
pub fn parse_promo(value: &JsonValue) -> PromoSnapshot {
    let mut snapshot = PromoSnapshot::default();
    let Some(entries) = value.as_array() else {
        return snapshot;
    };
    for entry in entries {
        match entry {
            JsonValue::String(flag) if !flag.trim().is_empty() => {
                snapshot.flags.insert(flag.trim().to_string());
            }
            JsonValue::Object(_) => {
                let Some(kind) = first_text(entry, &["vas_id", "slug", "type", "id"]) else {
                    continue;
                };
                let next_schedule = first_field(entry, &["schedule", "next_schedule", "nextSchedule"])
                    .and_then(|v| match v {
                        JsonValue::Array(items) => items.iter().find_map(json_text),
                        other => json_text(other),
                    });
                snapshot.flags.insert(kind.clone());
                snapshot.services.push(PromoService {
                    kind,
                    finish_time: first_text(entry, &["finish_time", "finishTime", "expires_at"]),
                    next_schedule,
                });
            }
            _ => {}
        }
    }
    snapshot
}

/// A directory resource; promo is only captured when the resource carries a `vas` list.
pub fn parse_listing_resource(value: &JsonValue) -> Option<(ListingId, ListingDetail)> {
    let id = listing_id_of(value, &["id", "item_id", "itemId"])?;
    let detail = ListingDetail {
        title: first_text(value, &["title"]),
        promo: value.get("vas").filter(|v| v.is_array()).map(parse_promo),
    };
    Some((id, detail))
}

/// Detail payloads are authoritative: no `vas` means no promotions.
pub fn parse_detail(payload: &JsonValue) -> ListingDetail {
    ListingDetail {
        title: first_text(payload, &["title"]),
        promo: Some(payload.get("vas").map(parse_promo).unwrap_or_default()),
    }
}

fn collect_metrics(source: &JsonValue, metrics: &[&str]) -> BTreeMap<String, MetricValue> {
    let nested = source.get("metrics");
    metrics
        .iter()
        .map(|name| {
            let raw = source
                .get(*name)
                .or_else(|| nested.and_then(|n| nested_metric(n, name)));
            let value = raw.and_then(MetricValue::from_json).unwrap_or_else(MetricValue::zero);
            (name.to_string(), value)
        })
        .collect()
}

fn nested_metric<'a>(nested: &'a JsonValue, name: &str) -> Option<&'a JsonValue> {
    match nested {
        JsonValue::Object(map) => map.get(name),
        JsonValue::Array(entries) => entries
            .iter()
            .find(|e| e.get("slug").and_then(JsonValue::as_str) == Some(name))
            .and_then(|e| e.get("value")),
        _ => None,
    }
}

/// Normalizes one stats element into records. Elements either carry a `stats`
/// list of per-day entries or are a single per-day record themselves.
/// Elements without a listing id or date are skipped.
pub fn parse_metric_records(element: &JsonValue, metrics: &[&str]) -> Vec<DailyMetricRecord> {
    let Some(listing_id) = listing_id_of(element, &["itemId", "item_id", "id"]) else {
        debug!("stats element without listing id skipped");
        return Vec::new();
    };
    let title = first_text(element, &["title"]);

    let build = |source: &JsonValue| {
        let date = date_of(source)?;
        Some(DailyMetricRecord {
            date,
            listing_id,
            title: title.clone(),
            metrics: collect_metrics(source, metrics),
        })
    };

    match element.get("stats").and_then(JsonValue::as_array) {
        Some(entries) => entries.iter().filter_map(build).collect(),
        None => build(element).into_iter().collect(),
    }
}
