//! Run configuration: environment, optional YAML file, validated once into an immutable value.

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::time::Duration;

use avstat_adapters::avito::{AvitoSettings, DEFAULT_API_BASE_URL};
use avstat_core::{parse_date, ListingId};
use chrono::{Days, NaiveDate};
use thiserror::Error;

pub const CONFIG_FILE_VAR: &str = "AVSTAT_CONFIG";
pub const DEFAULT_WORKSHEET: &str = "data";
pub const DEFAULT_LOOKBACK_DAYS: u64 = 3;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required setting {0}")]
    Missing(&'static str),
    #[error("invalid {key}: {message}")]
    Invalid { key: &'static str, message: String },
    #[error("date range is inverted: {start} is after {end}")]
    InvertedRange { start: NaiveDate, end: NaiveDate },
    #[error("config file {path}: {message}")]
    File { path: String, message: String },
}

/// Inclusive calendar range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DateSpan {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl DateSpan {
    pub fn single(date: NaiveDate) -> Self {
        Self { start: date, end: date }
    }

    pub fn new(start: NaiveDate, end: NaiveDate) -> Result<Self, ConfigError> {
        if start > end {
            return Err(ConfigError::InvertedRange { start, end });
        }
        Ok(Self { start, end })
    }

    /// Ascending.
    pub fn days(&self) -> Vec<NaiveDate> {
        self.start
            .iter_days()
            .take_while(|day| *day <= self.end)
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DateSelection {
    /// Today minus [`DEFAULT_LOOKBACK_DAYS`], resolved at run time.
    Default,
    Single(NaiveDate),
    Range(DateSpan),
}

impl DateSelection {
    pub fn resolve(&self, today: NaiveDate) -> DateSpan {
        match self {
            DateSelection::Default => {
                let day = today
                    .checked_sub_days(Days::new(DEFAULT_LOOKBACK_DAYS))
                    .unwrap_or(today);
                DateSpan::single(day)
            }
            DateSelection::Single(day) => DateSpan::single(*day),
            DateSelection::Range(span) => *span,
        }
    }
}

/// Marketplace credentials and transport settings. Enough to talk to the API without a sink.
#[derive(Clone)]
pub struct ApiConfig {
    pub client_id: String,
    pub client_secret: String,
    pub user_id: String,
    pub profile_stats_url: Option<String>,
    pub api_base_url: String,
    pub http_timeout: Duration,
    pub throttle: Duration,
}

impl fmt::Debug for ApiConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApiConfig")
            .field("client_id", &self.client_id)
            .field("client_secret", &"[REDACTED]")
            .field("user_id", &self.user_id)
            .field("profile_stats_url", &self.profile_stats_url)
            .field("api_base_url", &self.api_base_url)
            .field("http_timeout", &self.http_timeout)
            .field("throttle", &self.throttle)
            .finish()
    }
}

impl ApiConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let file = config_file_values()?;
        Self::from_lookup(layered(&BTreeMap::new(), &file))
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| non_empty(lookup(key));
        let require = |key: &'static str| get(key).ok_or(ConfigError::Missing(key));

        let client_id = require("AVITO_CLIENT_ID")?;
        let client_secret = require("AVITO_CLIENT_SECRET")?;
        let user_id = require("AVITO_USER_ID")?;

        let http_timeout_secs = parse_number("AVITO_HTTP_TIMEOUT_SECS", get("AVITO_HTTP_TIMEOUT_SECS"), 60)?;
        if http_timeout_secs == 0 {
            return Err(ConfigError::Invalid {
                key: "AVITO_HTTP_TIMEOUT_SECS",
                message: "must be positive".into(),
            });
        }
        let throttle_ms = parse_number("AVITO_THROTTLE_MS", get("AVITO_THROTTLE_MS"), 150)?;

        Ok(Self {
            client_id,
            client_secret,
            user_id,
            profile_stats_url: get("AVITO_PROFILE_STATS_URL"),
            api_base_url: get("AVITO_API_BASE_URL").unwrap_or_else(|| DEFAULT_API_BASE_URL.to_string()),
            http_timeout: Duration::from_secs(http_timeout_secs),
            throttle: Duration::from_millis(throttle_ms),
        })
    }

    pub fn avito_settings(&self) -> AvitoSettings {
        let mut settings = AvitoSettings::new(&self.client_id, &self.client_secret, &self.user_id);
        settings.base_url = self.api_base_url.clone();
        settings.profile_stats_template = self.profile_stats_url.clone();
        settings.throttle = self.throttle;
        settings.stats_timeout = self.http_timeout.max(Duration::from_secs(120));
        settings
    }
}

#[derive(Clone)]
pub struct SyncConfig {
    pub api: ApiConfig,
    pub sheet_id: String,
    pub google_service_json: String,
    pub item_ids: Option<Vec<ListingId>>,
    pub dates: DateSelection,
    pub worksheet: String,
}

impl fmt::Debug for SyncConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncConfig")
            .field("api", &self.api)
            .field("sheet_id", &self.sheet_id)
            .field("google_service_json", &"[REDACTED]")
            .field("item_ids", &self.item_ids.as_ref().map(Vec::len))
            .field("dates", &self.dates)
            .field("worksheet", &self.worksheet)
            .finish()
    }
}

impl SyncConfig {
    /// Reads the process environment, falling back to the YAML file named by `AVSTAT_CONFIG`.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_env_with(&BTreeMap::new())
    }

    /// Like [`from_env`](Self::from_env); `overrides` (e.g. command-line flags) win over both sources.
    pub fn from_env_with(overrides: &BTreeMap<String, String>) -> Result<Self, ConfigError> {
        let file = config_file_values()?;
        Self::from_lookup(layered(overrides, &file))
    }

    /// Builds and validates a config from any key lookup. Blank values count as absent.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let api = ApiConfig::from_lookup(&lookup)?;

        let get = |key: &str| non_empty(lookup(key));
        let require = |key: &'static str| get(key).ok_or(ConfigError::Missing(key));

        let sheet_id = require("SHEET_ID")?;
        let google_service_json = require("GOOGLE_SERVICE_JSON")?;

        let item_ids = get("ITEM_IDS_CSV")
            .map(|raw| parse_listing_ids(&raw))
            .transpose()?
            .filter(|ids| !ids.is_empty());

        let dates = date_selection(
            get("DATE").as_deref(),
            get("START_DATE").as_deref(),
            get("END_DATE").as_deref(),
        )?;

        Ok(Self {
            api,
            sheet_id,
            google_service_json,
            item_ids,
            dates,
            worksheet: get("AVITO_WORKSHEET").unwrap_or_else(|| DEFAULT_WORKSHEET.to_string()),
        })
    }
}

fn config_file_values() -> Result<BTreeMap<String, String>, ConfigError> {
    match non_empty(std::env::var(CONFIG_FILE_VAR).ok()) {
        Some(path) => load_config_file(Path::new(&path)),
        None => Ok(BTreeMap::new()),
    }
}

/// Overrides, then the process environment, then the config file.
fn layered<'a>(
    overrides: &'a BTreeMap<String, String>,
    file: &'a BTreeMap<String, String>,
) -> impl Fn(&str) -> Option<String> + 'a {
    move |key| {
        overrides
            .get(key)
            .cloned()
            .or_else(|| non_empty(std::env::var(key).ok()))
            .or_else(|| file.get(key).cloned())
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn parse_number(key: &'static str, raw: Option<String>, default: u64) -> Result<u64, ConfigError> {
    match raw {
        None => Ok(default),
        Some(raw) => raw.parse().map_err(|_| ConfigError::Invalid {
            key,
            message: format!("expected a non-negative integer, got {raw:?}"),
        }),
    }
}

fn parse_day(key: &'static str, raw: &str) -> Result<NaiveDate, ConfigError> {
    parse_date(raw).map_err(|e| ConfigError::Invalid {
        key,
        message: format!("{raw:?} is not YYYY-MM-DD ({e})"),
    })
}

/// `DATE` wins; a start/end pair is a range; either one alone is a single day.
pub fn date_selection(
    date: Option<&str>,
    start: Option<&str>,
    end: Option<&str>,
) -> Result<DateSelection, ConfigError> {
    if let Some(raw) = date {
        return Ok(DateSelection::Single(parse_day("DATE", raw)?));
    }
    match (start, end) {
        (Some(start), Some(end)) => {
            let span = DateSpan::new(parse_day("START_DATE", start)?, parse_day("END_DATE", end)?)?;
            Ok(DateSelection::Range(span))
        }
        (Some(start), None) => Ok(DateSelection::Single(parse_day("START_DATE", start)?)),
        (None, Some(end)) => Ok(DateSelection::Single(parse_day("END_DATE", end)?)),
        (None, None) => Ok(DateSelection::Default),
    }
}

pub fn parse_listing_ids(raw: &str) -> Result<Vec<ListingId>, ConfigError> {
    let mut ids = raw
        .split(',')
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(|part| match part.parse::<ListingId>() {
            Ok(id) if id > 0 => Ok(id),
            _ => Err(ConfigError::Invalid {
                key: "ITEM_IDS_CSV",
                message: format!("{part:?} is not a positive listing id"),
            }),
        })
        .collect::<Result<Vec<_>, _>>()?;
    ids.sort_unstable();
    ids.dedup();
    Ok(ids)
}

/// Flat `KEY: value` YAML mapping. Scalars are stringified.
pub fn load_config_file(path: &Path) -> Result<BTreeMap<String, String>, ConfigError> {
    let file_error = |message: String| ConfigError::File {
        path: path.display().to_string(),
        message,
    };
    let text = std::fs::read_to_string(path).map_err(|e| file_error(e.to_string()))?;
    let raw: BTreeMap<String, serde_yaml::Value> =
        serde_yaml::from_str(&text).map_err(|e| file_error(e.to_string()))?;

    raw.into_iter()
        .filter_map(|(key, value)| {
            let value = match value {
                serde_yaml::Value::Null => return None,
                serde_yaml::Value::String(s) => s,
                serde_yaml::Value::Number(n) => n.to_string(),
                serde_yaml::Value::Bool(b) => b.to_string(),
                _ => return Some(Err(file_error(format!("{key} must be a scalar")))),
            };
            Some(Ok((key, value)))
        })
        .collect()
}
