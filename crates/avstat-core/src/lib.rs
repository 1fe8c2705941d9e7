//! Core domain model for per-listing daily metrics reconciliation.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

pub const CRATE_NAME: &str = "avstat-core";

/// Marketplace listing identifier. Always positive.
pub type ListingId = u64;

pub const DATE_FORMAT: &str = "%Y-%m-%d";

pub fn format_date(date: NaiveDate) -> String {
    date.format(DATE_FORMAT).to_string()
}

pub fn parse_date(value: &str) -> Result<NaiveDate, chrono::ParseError> {
    NaiveDate::parse_from_str(value.trim(), DATE_FORMAT)
}

/// Metrics requested from the profile endpoint, in sink column order.
pub const PROFILE_METRICS: [&str; 9] = [
    "impressions",
    "views",
    "uniqViews",
    "contacts",
    "uniqContacts",
    "favorites",
    "impressionsToViewsConversion",
    "viewsToContactsConversion",
    "allSpending",
];

/// The only metrics the legacy endpoint can return.
pub const LEGACY_METRICS: [&str; 2] = ["uniqViews", "uniqContacts"];

pub mod columns {
    pub const DATE: &str = "date";
    pub const ITEM_ID: &str = "item_id";
    pub const TITLE: &str = "title";
    pub const VAS_IDS: &str = "vas_ids";
    pub const VAS_FINISH_TIME: &str = "vas_finish_time";
    pub const VAS_NEXT_SCHEDULE: &str = "vas_next_schedule";
}

/// Header every sink must contain, in the order used when it is created.
pub fn required_columns() -> Vec<String> {
    let mut out = vec![
        columns::DATE.to_string(),
        columns::ITEM_ID.to_string(),
        columns::TITLE.to_string(),
    ];
    out.extend(PROFILE_METRICS.iter().map(|m| m.to_string()));
    out.extend([
        columns::VAS_IDS.to_string(),
        columns::VAS_FINISH_TIME.to_string(),
        columns::VAS_NEXT_SCHEDULE.to_string(),
    ]);
    out
}

/// One paid promotion currently attached to a listing.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PromoService {
    pub kind: String,
    pub finish_time: Option<String>,
    pub next_schedule: Option<String>,
}

/// "As of now" promotional state. Reused for every date of a run.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PromoSnapshot {
    pub flags: BTreeSet<String>,
    pub services: Vec<PromoService>,
}

impl PromoSnapshot {
    pub fn from_services(services: Vec<PromoService>) -> Self {
        let flags = services.iter().map(|s| s.kind.clone()).collect();
        Self { flags, services }
    }

    /// Service kinds in the order the API listed them, followed by bare flags.
    pub fn ids_cell(&self) -> String {
        let mut ids: Vec<&str> = self.services.iter().map(|s| s.kind.as_str()).collect();
        for flag in &self.flags {
            if !ids.contains(&flag.as_str()) {
                ids.push(flag.as_str());
            }
        }
        ids.join(", ")
    }

    pub fn finish_time_cell(&self) -> String {
        join_present(self.services.iter().map(|s| s.finish_time.as_deref()))
    }

    pub fn next_schedule_cell(&self) -> String {
        join_present(self.services.iter().map(|s| s.next_schedule.as_deref()))
    }
}

fn join_present<'a>(values: impl Iterator<Item = Option<&'a str>>) -> String {
    values
        .flatten()
        .filter(|v| !v.trim().is_empty())
        .collect::<Vec<_>>()
        .join(", ")
}

/// Partially known listing attributes. `None` means "not captured yet".
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ListingDetail {
    pub title: Option<String>,
    pub promo: Option<PromoSnapshot>,
}

impl ListingDetail {
    pub fn is_complete(&self) -> bool {
        self.title.is_some() && self.promo.is_some()
    }

    /// Fill only the attributes still missing from `other`.
    pub fn fill_from(&mut self, other: &ListingDetail) {
        if self.title.is_none() {
            self.title = other.title.clone();
        }
        if self.promo.is_none() {
            self.promo = other.promo.clone();
        }
    }
}

/// Fully resolved listing used for row building.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Listing {
    pub id: ListingId,
    pub title: String,
    pub promo: PromoSnapshot,
}

impl Listing {
    pub fn resolve(id: ListingId, detail: &ListingDetail) -> Self {
        Self {
            id,
            title: detail.title.clone().unwrap_or_default(),
            promo: detail.promo.clone().unwrap_or_default(),
        }
    }
}

/// A metric value as reported upstream. Percentages sometimes arrive pre-rendered as text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetricValue {
    Number(f64),
    Text(String),
}

impl MetricValue {
    pub fn zero() -> Self {
        MetricValue::Number(0.0)
    }

    /// `None` for null/absent-like values, which callers treat as zero.
    pub fn from_json(value: &JsonValue) -> Option<Self> {
        match value {
            JsonValue::Null => None,
            JsonValue::Number(n) => n.as_f64().map(MetricValue::Number),
            JsonValue::String(s) => Some(MetricValue::Text(s.clone())),
            JsonValue::Bool(b) => Some(MetricValue::Number(if *b { 1.0 } else { 0.0 })),
            other => Some(MetricValue::Text(other.to_string())),
        }
    }

    /// Numbers are summed; a textual value replaces whatever was there.
    pub fn accumulate(&mut self, other: &MetricValue) {
        match (&mut *self, other) {
            (MetricValue::Number(a), MetricValue::Number(b)) => *a += b,
            (slot, other) => *slot = other.clone(),
        }
    }
}

impl fmt::Display for MetricValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MetricValue::Number(n) => write!(f, "{}", render_number(*n)),
            MetricValue::Text(s) => f.write_str(s),
        }
    }
}

fn render_number(n: f64) -> String {
    if n.fract() == 0.0 && n.abs() < 1e15 {
        format!("{}", n as i64)
    } else {
        format!("{n}")
    }
}

/// Metrics for one (date, listing) pair. Its existence alone marks the listing active.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DailyMetricRecord {
    pub date: NaiveDate,
    pub listing_id: ListingId,
    pub title: Option<String>,
    pub metrics: BTreeMap<String, MetricValue>,
}

impl DailyMetricRecord {
    pub fn new(date: NaiveDate, listing_id: ListingId) -> Self {
        Self {
            date,
            listing_id,
            title: None,
            metrics: BTreeMap::new(),
        }
    }

    pub fn with_metric(mut self, name: &str, value: MetricValue) -> Self {
        self.metrics.insert(name.to_string(), value);
        self
    }

    /// Missing metrics read as zero.
    pub fn value(&self, name: &str) -> MetricValue {
        self.metrics.get(name).cloned().unwrap_or_else(MetricValue::zero)
    }

    pub fn absorb(&mut self, other: &DailyMetricRecord) {
        for (name, value) in &other.metrics {
            self.metrics
                .entry(name.clone())
                .and_modify(|existing| existing.accumulate(value))
                .or_insert_with(|| value.clone());
        }
        if self.title.is_none() {
            self.title = other.title.clone();
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MetricsTier {
    Profile,
    Legacy,
}

impl fmt::Display for MetricsTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MetricsTier::Profile => f.write_str("profile"),
            MetricsTier::Legacy => f.write_str("legacy"),
        }
    }
}

/// Everything one tier reported for exactly one date.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DayMetrics {
    pub date: NaiveDate,
    pub tier: MetricsTier,
    pub records: BTreeMap<ListingId, DailyMetricRecord>,
}

impl DayMetrics {
    pub fn new(date: NaiveDate, tier: MetricsTier) -> Self {
        Self {
            date,
            tier,
            records: BTreeMap::new(),
        }
    }

    /// Records for other dates are dropped (range endpoints are inclusive upstream).
    /// Returns whether the record was kept.
    pub fn insert(&mut self, record: DailyMetricRecord) -> bool {
        if record.date != self.date {
            return false;
        }
        match self.records.get_mut(&record.listing_id) {
            Some(existing) => existing.absorb(&record),
            None => {
                self.records.insert(record.listing_id, record);
            }
        }
        true
    }

    pub fn active_set(&self) -> BTreeSet<ListingId> {
        self.records.keys().copied().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }
}

/// A sink cell. Numbers stay numbers so the sheet can aggregate them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Cell {
    Number(f64),
    Text(String),
}

impl Cell {
    pub fn empty() -> Self {
        Cell::Text(String::new())
    }

    pub fn text(value: impl Into<String>) -> Self {
        Cell::Text(value.into())
    }

    pub fn from_json(value: &JsonValue) -> Self {
        match value {
            JsonValue::Number(n) => n.as_f64().map(Cell::Number).unwrap_or_else(Cell::empty),
            JsonValue::String(s) => Cell::Text(s.clone()),
            JsonValue::Null => Cell::empty(),
            other => Cell::Text(other.to_string()),
        }
    }
}

impl From<&MetricValue> for Cell {
    fn from(value: &MetricValue) -> Self {
        match value {
            MetricValue::Number(n) => Cell::Number(*n),
            MetricValue::Text(s) => Cell::Text(s.clone()),
        }
    }
}

impl fmt::Display for Cell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Cell::Number(n) => write!(f, "{}", render_number(*n)),
            Cell::Text(s) => f.write_str(s),
        }
    }
}

/// Pad with empty cells or truncate so the row is exactly `width` wide.
pub fn fit_width(mut cells: Vec<Cell>, width: usize) -> Vec<Cell> {
    cells.resize(width, Cell::empty());
    cells
}

/// Row keyed by column name; laid out against whatever header the sink currently has.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SheetRow {
    cells: BTreeMap<String, Cell>,
}

impl SheetRow {
    pub fn build(listing: &Listing, record: &DailyMetricRecord) -> Self {
        let mut row = SheetRow::default();
        row.set(columns::DATE, Cell::text(format_date(record.date)));
        row.set(columns::ITEM_ID, Cell::Number(listing.id as f64));
        row.set(columns::TITLE, Cell::text(listing.title.clone()));
        for metric in PROFILE_METRICS {
            row.set(metric, Cell::from(&record.value(metric)));
        }
        row.set(columns::VAS_IDS, Cell::text(listing.promo.ids_cell()));
        row.set(columns::VAS_FINISH_TIME, Cell::text(listing.promo.finish_time_cell()));
        row.set(columns::VAS_NEXT_SCHEDULE, Cell::text(listing.promo.next_schedule_cell()));
        row
    }

    pub fn set(&mut self, column: &str, cell: Cell) {
        self.cells.insert(column.to_string(), cell);
    }

    /// One cell per header column; columns this row does not own stay empty.
    pub fn layout(&self, header: &[String]) -> Vec<Cell> {
        header
            .iter()
            .map(|col| self.cells.get(col).cloned().unwrap_or_else(Cell::empty))
            .collect()
    }
}
