use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use avstat_adapters::{ApiError, BearerToken, ListingCatalog, MarketplaceApi};
use avstat_core::{
    parse_date, Cell, DailyMetricRecord, DayMetrics, ListingDetail, ListingId, MetricValue, MetricsTier,
    PromoService, PromoSnapshot,
};
use avstat_storage::{FetchError, MemoryWorksheet, RecordingSleeper, Worksheet};
use avstat_sync::{SyncConfig, SyncPipeline};
use chrono::NaiveDate;
use pretty_assertions::assert_eq;

fn day(s: &str) -> NaiveDate {
    parse_date(s).expect("date")
}

#[derive(Default)]
struct FakeApi {
    reject_token: bool,
    listings: Vec<ListingId>,
    profile: BTreeMap<NaiveDate, Vec<DailyMetricRecord>>,
    failing_profile: BTreeSet<NaiveDate>,
    legacy: BTreeMap<NaiveDate, Vec<DailyMetricRecord>>,
    details: BTreeMap<ListingId, ListingDetail>,
    calls: Mutex<Vec<String>>,
}

impl FakeApi {
    fn log(&self, call: String) {
        self.calls.lock().expect("calls").push(call);
    }

    fn calls(&self) -> Vec<String> {
        self.calls.lock().expect("calls").clone()
    }

    fn day_metrics(records: Option<&Vec<DailyMetricRecord>>, date: NaiveDate, tier: MetricsTier) -> DayMetrics {
        let mut metrics = DayMetrics::new(date, tier);
        for record in records.into_iter().flatten() {
            metrics.insert(record.clone());
        }
        metrics
    }
}

#[async_trait]
impl MarketplaceApi for FakeApi {
    async fn fetch_token(&self) -> Result<BearerToken, ApiError> {
        self.log("token".into());
        if self.reject_token {
            return Err(ApiError::Auth("token endpoint returned 401".into()));
        }
        Ok(BearerToken::new("tok"))
    }

    async fn list_listings(&self, _token: &BearerToken) -> Result<ListingCatalog, ApiError> {
        self.log("listings".into());
        Ok(ListingCatalog::from_ids(self.listings.iter().copied()))
    }

    async fn fetch_profile_metrics(&self, _token: &BearerToken, date: NaiveDate) -> Result<DayMetrics, ApiError> {
        self.log(format!("profile {date}"));
        if self.failing_profile.contains(&date) {
            return Err(ApiError::Fetch(FetchError::HttpStatus {
                status: 404,
                url: "http://stats.test/v2".into(),
                body: "not found".into(),
            }));
        }
        Ok(Self::day_metrics(self.profile.get(&date), date, MetricsTier::Profile))
    }

    async fn fetch_legacy_metrics(
        &self,
        _token: &BearerToken,
        listing_ids: &[ListingId],
        date: NaiveDate,
    ) -> Result<DayMetrics, ApiError> {
        self.log(format!("legacy {date} {}", listing_ids.len()));
        Ok(Self::day_metrics(self.legacy.get(&date), date, MetricsTier::Legacy))
    }

    async fn fetch_listing_detail(
        &self,
        _token: &BearerToken,
        listing_id: ListingId,
    ) -> Result<Option<ListingDetail>, ApiError> {
        self.log(format!("detail {listing_id}"));
        Ok(self.details.get(&listing_id).cloned())
    }
}

fn config(extra: &[(&'static str, &'static str)]) -> SyncConfig {
    let mut vars = BTreeMap::from([
        ("AVITO_CLIENT_ID", "cid"),
        ("AVITO_CLIENT_SECRET", "secret"),
        ("AVITO_USER_ID", "42"),
        ("SHEET_ID", "sheet"),
        ("GOOGLE_SERVICE_JSON", "{}"),
    ]);
    vars.extend(extra.iter().copied());
    SyncConfig::from_lookup(|key| vars.get(key).map(|v| v.to_string())).expect("config")
}

fn profile_record(date: &str, id: ListingId, views: f64) -> DailyMetricRecord {
    DailyMetricRecord::new(day(date), id)
        .with_metric("views", MetricValue::Number(views))
        .with_metric("uniqViews", MetricValue::Number(views))
}

fn detail(title: &str) -> ListingDetail {
    ListingDetail {
        title: Some(title.into()),
        promo: Some(PromoSnapshot::from_services(vec![PromoService {
            kind: "xl".into(),
            finish_time: Some("2025-07-01T10:00:00+03:00".into()),
            next_schedule: None,
        }])),
    }
}

fn pipeline(api: FakeApi, config: SyncConfig, sheet: MemoryWorksheet) -> (SyncPipeline<FakeApi, MemoryWorksheet>, Arc<RecordingSleeper>) {
    let sleeper = Arc::new(RecordingSleeper::default());
    let pipeline = SyncPipeline::new(config, api, sheet).with_sleeper(sleeper.clone());
    (pipeline, sleeper)
}

fn column(sheet: &MemoryWorksheet, name: &str) -> usize {
    sheet
        .header_row()
        .iter()
        .position(|h| h == name)
        .unwrap_or_else(|| panic!("no column {name}"))
}

fn ids_for(sheet: &MemoryWorksheet, date: &str) -> Vec<String> {
    let idx = column(sheet, "item_id");
    sheet
        .rows_matching("date", date)
        .iter()
        .map(|row| row[idx].to_string())
        .collect()
}

#[tokio::test]
async fn rerunning_a_date_leaves_the_sheet_unchanged() {
    let mut api = FakeApi {
        listings: vec![1, 2],
        ..Default::default()
    };
    api.profile.insert(
        day("2025-06-27"),
        vec![profile_record("2025-06-27", 1, 10.0), profile_record("2025-06-27", 2, 3.0)],
    );
    api.details.insert(1, detail("Bike"));
    api.details.insert(2, detail("Lamp"));

    let (mut pipeline, _) = pipeline(api, config(&[("DATE", "2025-06-27")]), MemoryWorksheet::default());
    let first = pipeline.run_for(day("2025-06-30")).await.expect("first run");
    let after_first = pipeline.sheet().clone();
    let second = pipeline.run_for(day("2025-06-30")).await.expect("second run");

    assert_eq!(first.days[0].appended, 2);
    assert_eq!(second.days[0].deleted, 2);
    assert_eq!(pipeline.sheet(), &after_first);
    assert_eq!(ids_for(pipeline.sheet(), "2025-06-27"), vec!["1", "2"]);

    let title = column(pipeline.sheet(), "title");
    let vas = column(pipeline.sheet(), "vas_ids");
    let row = &pipeline.sheet().rows()[0];
    assert_eq!(row[title], Cell::text("Bike"));
    assert_eq!(row[vas], Cell::text("xl"));
}

#[tokio::test]
async fn active_set_includes_zero_metrics_and_excludes_absent_listings() {
    let mut api = FakeApi {
        listings: vec![1, 2, 3],
        ..Default::default()
    };
    api.profile.insert(
        day("2025-06-27"),
        vec![profile_record("2025-06-27", 1, 0.0), profile_record("2025-06-27", 3, 4.0)],
    );

    let (mut pipeline, _) = pipeline(api, config(&[("DATE", "2025-06-27")]), MemoryWorksheet::default());
    let summary = pipeline.run_for(day("2025-06-30")).await.expect("run");

    assert_eq!(summary.days[0].active, 2);
    assert_eq!(ids_for(pipeline.sheet(), "2025-06-27"), vec!["1", "3"]);
    let views = column(pipeline.sheet(), "views");
    assert_eq!(pipeline.sheet().rows()[0][views], Cell::Number(0.0));
}

#[tokio::test]
async fn legacy_fallback_is_used_only_for_the_failing_date() {
    let mut api = FakeApi {
        listings: vec![1, 2],
        ..Default::default()
    };
    for date in ["2025-06-25", "2025-06-27"] {
        api.profile.insert(day(date), vec![profile_record(date, 1, 5.0)]);
    }
    api.failing_profile.insert(day("2025-06-26"));
    api.legacy.insert(
        day("2025-06-26"),
        vec![DailyMetricRecord::new(day("2025-06-26"), 2).with_metric("uniqViews", MetricValue::Number(7.0))],
    );

    let (mut pipeline, _) = pipeline(
        api,
        config(&[("START_DATE", "2025-06-25"), ("END_DATE", "2025-06-27")]),
        MemoryWorksheet::default(),
    );
    let summary = pipeline.run_for(day("2025-06-30")).await.expect("run");

    let tiers: Vec<MetricsTier> = summary.days.iter().map(|d| d.tier).collect();
    assert_eq!(tiers, vec![MetricsTier::Profile, MetricsTier::Legacy, MetricsTier::Profile]);
    let dates: Vec<NaiveDate> = summary.days.iter().map(|d| d.date).collect();
    assert_eq!(dates, vec![day("2025-06-25"), day("2025-06-26"), day("2025-06-27")]);

    let legacy_calls: Vec<String> = pipeline_calls(&pipeline)
        .into_iter()
        .filter(|c| c.starts_with("legacy"))
        .collect();
    assert_eq!(legacy_calls, vec!["legacy 2025-06-26 2"]);

    let views = column(pipeline.sheet(), "views");
    let uniq = column(pipeline.sheet(), "uniqViews");
    let fallback_row = pipeline.sheet().rows_matching("date", "2025-06-26")[0].clone();
    assert_eq!(fallback_row[uniq], Cell::Number(7.0));
    assert_eq!(fallback_row[views], Cell::Number(0.0));
}

fn pipeline_calls(pipeline: &SyncPipeline<FakeApi, MemoryWorksheet>) -> Vec<String> {
    pipeline.api().calls()
}

#[tokio::test]
async fn empty_day_does_not_touch_existing_rows() {
    let api = FakeApi {
        listings: vec![1],
        ..Default::default()
    };
    let mut seeded = MemoryWorksheet::default();
    let header = avstat_core::required_columns();
    seeded.set_header(&header).await.expect("header");
    let mut stale = vec![Cell::empty(); header.len()];
    stale[0] = Cell::text("2025-06-27");
    stale[1] = Cell::Number(99.0);
    seeded.append_rows(&[stale]).await.expect("seed");

    let (mut pipeline, _) = pipeline(api, config(&[("DATE", "2025-06-27")]), seeded.clone());
    let summary = pipeline.run_for(day("2025-06-30")).await.expect("run");

    assert!(summary.days[0].skipped);
    assert_eq!(pipeline.sheet(), &seeded);
}

#[tokio::test]
async fn details_are_looked_up_once_per_run_and_missing_ones_are_blank() {
    let mut api = FakeApi {
        listings: vec![1, 2],
        ..Default::default()
    };
    for date in ["2025-06-26", "2025-06-27"] {
        api.profile.insert(
            day(date),
            vec![profile_record(date, 1, 1.0), profile_record(date, 2, 1.0)],
        );
    }
    api.details.insert(1, detail("Bike"));

    let (mut pipeline, sleeper) = pipeline(
        api,
        config(&[("START_DATE", "2025-06-26"), ("END_DATE", "2025-06-27")]),
        MemoryWorksheet::default(),
    );
    let summary = pipeline.run_for(day("2025-06-30")).await.expect("run");

    assert_eq!(summary.detail_lookups, 2);
    let detail_calls = pipeline_calls(&pipeline)
        .into_iter()
        .filter(|c| c.starts_with("detail"))
        .count();
    assert_eq!(detail_calls, 2);
    assert_eq!(sleeper.recorded(), vec![Duration::from_millis(150)]);

    let title = column(pipeline.sheet(), "title");
    let finish = column(pipeline.sheet(), "vas_finish_time");
    for row in pipeline.sheet().rows_matching("item_id", "2") {
        assert_eq!(row[title], Cell::empty());
        assert_eq!(row[finish], Cell::empty());
    }
    for row in pipeline.sheet().rows_matching("item_id", "1") {
        assert_eq!(row[finish], Cell::text("2025-07-01T10:00:00+03:00"));
    }
}

#[tokio::test]
async fn explicit_listing_ids_skip_the_directory_and_scope_rows() {
    let mut api = FakeApi::default();
    api.profile.insert(
        day("2025-06-27"),
        vec![profile_record("2025-06-27", 1, 1.0), profile_record("2025-06-27", 2, 1.0)],
    );

    let (mut pipeline, _) = pipeline(
        api,
        config(&[("DATE", "2025-06-27"), ("ITEM_IDS_CSV", "1")]),
        MemoryWorksheet::default(),
    );
    let summary = pipeline.run_for(day("2025-06-30")).await.expect("run");

    assert_eq!(summary.listings, 1);
    assert!(!pipeline_calls(&pipeline).contains(&"listings".to_string()));
    assert_eq!(ids_for(pipeline.sheet(), "2025-06-27"), vec!["1"]);
}

#[tokio::test]
async fn default_date_is_three_days_back() {
    let mut api = FakeApi {
        listings: vec![1],
        ..Default::default()
    };
    api.profile.insert(day("2025-06-27"), vec![profile_record("2025-06-27", 1, 1.0)]);

    let (mut pipeline, _) = pipeline(api, config(&[]), MemoryWorksheet::default());
    let summary = pipeline.run_for(day("2025-06-30")).await.expect("run");

    assert_eq!(summary.start_date, day("2025-06-27"));
    assert_eq!(summary.rows_written(), 1);
}

#[tokio::test]
async fn auth_failure_aborts_before_any_write() {
    let api = FakeApi {
        reject_token: true,
        ..Default::default()
    };

    let (mut pipeline, _) = pipeline(api, config(&[("DATE", "2025-06-27")]), MemoryWorksheet::default());
    let err = pipeline.run_for(day("2025-06-30")).await.expect_err("auth");

    assert!(format!("{err:#}").contains("authentication failed"));
    assert!(pipeline.sheet().rows().is_empty());
    assert_eq!(pipeline_calls(&pipeline), vec!["token"]);
}
