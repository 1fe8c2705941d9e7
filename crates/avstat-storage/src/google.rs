//! Google Sheets implementation of the [`Worksheet`] contract (Sheets API v4).

use std::sync::Arc;

use async_trait::async_trait;
use avstat_core::Cell;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value as JsonValue};
use tracing::{debug, info};

use crate::sink::{SinkError, Worksheet};
use crate::{ApiRequest, HttpFetcher};

pub const SHEETS_SCOPE: &str = "https://www.googleapis.com/auth/spreadsheets";
pub const DEFAULT_SHEETS_BASE_URL: &str = "https://sheets.googleapis.com/v4";
const DEFAULT_TOKEN_URI: &str = "https://oauth2.googleapis.com/token";
const JWT_BEARER_GRANT: &str = "urn:ietf:params:oauth:grant-type:jwt-bearer";

const NEW_SHEET_ROWS: u32 = 100_000;
const NEW_SHEET_COLUMNS: u32 = 20;

fn default_token_uri() -> String {
    DEFAULT_TOKEN_URI.to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServiceAccountKey {
    pub client_email: String,
    pub private_key: String,
    #[serde(default = "default_token_uri")]
    pub token_uri: String,
}

impl ServiceAccountKey {
    pub fn from_json(payload: &str) -> Result<Self, SinkError> {
        serde_json::from_str(payload)
            .map_err(|e| SinkError::Credentials(format!("parsing service account json: {e}")))
    }
}

#[derive(Debug, Clone)]
pub enum AccessTokenSource {
    ServiceAccount(ServiceAccountKey),
    /// Fixed token for exercising the REST calls against a local server.
    #[cfg(test)]
    Static(String),
}

#[derive(Debug, Serialize)]
struct GrantClaims<'a> {
    iss: &'a str,
    scope: &'a str,
    aud: &'a str,
    iat: i64,
    exp: i64,
}

#[derive(Debug, Deserialize)]
struct GrantResponse {
    access_token: Option<String>,
    #[serde(default)]
    expires_in: Option<i64>,
}

#[derive(Debug, Clone)]
struct CachedToken {
    value: String,
    expires_at: DateTime<Utc>,
}

/// Spreadsheet handle: owns the sink's credentials and talks to the REST API.
#[derive(Debug)]
pub struct GoogleSheets {
    http: Arc<HttpFetcher>,
    base_url: String,
    spreadsheet_key: String,
    tokens: AccessTokenSource,
    cached: Option<CachedToken>,
}

impl GoogleSheets {
    pub fn new(http: Arc<HttpFetcher>, tokens: AccessTokenSource, spreadsheet_key: &str) -> Self {
        Self {
            http,
            base_url: DEFAULT_SHEETS_BASE_URL.to_string(),
            spreadsheet_key: spreadsheet_key.to_string(),
            tokens,
            cached: None,
        }
    }

    pub fn with_base_url(mut self, base_url: &str) -> Self {
        self.base_url = base_url.trim_end_matches('/').to_string();
        self
    }

    async fn access_token(&mut self) -> Result<String, SinkError> {
        let key = match &self.tokens {
            #[cfg(test)]
            AccessTokenSource::Static(token) => return Ok(token.clone()),
            AccessTokenSource::ServiceAccount(key) => key.clone(),
        };
        if let Some(cached) = &self.cached {
            if cached.expires_at - ChronoDuration::seconds(60) > Utc::now() {
                return Ok(cached.value.clone());
            }
        }

        let now = Utc::now();
        let claims = GrantClaims {
            iss: &key.client_email,
            scope: SHEETS_SCOPE,
            aud: &key.token_uri,
            iat: now.timestamp(),
            exp: (now + ChronoDuration::hours(1)).timestamp(),
        };
        let signing_key = EncodingKey::from_rsa_pem(key.private_key.as_bytes())
            .map_err(|e| SinkError::Credentials(format!("service account private key: {e}")))?;
        let assertion = encode(&Header::new(Algorithm::RS256), &claims, &signing_key)
            .map_err(|e| SinkError::Credentials(format!("signing grant assertion: {e}")))?;

        let response = self
            .http
            .execute(&ApiRequest::post_form(
                key.token_uri.clone(),
                vec![
                    ("grant_type".to_string(), JWT_BEARER_GRANT.to_string()),
                    ("assertion".to_string(), assertion),
                ],
            ))
            .await?;
        let grant: GrantResponse = response.json()?;
        let value = grant
            .access_token
            .ok_or_else(|| SinkError::Credentials("token response has no access_token".into()))?;
        let expires_at = now + ChronoDuration::seconds(grant.expires_in.unwrap_or(3600));
        debug!(client_email = %key.client_email, %expires_at, "sheets access token issued");
        self.cached = Some(CachedToken {
            value: value.clone(),
            expires_at,
        });
        Ok(value)
    }

    fn spreadsheet_url(&self) -> String {
        format!("{}/spreadsheets/{}", self.base_url, self.spreadsheet_key)
    }

    fn values_url(&self, range: &str) -> String {
        format!("{}/values/{}", self.spreadsheet_url(), range)
    }

    async fn send(&mut self, request: ApiRequest) -> Result<JsonValue, SinkError> {
        let token = self.access_token().await?;
        let response = self.http.execute(&request.bearer(&token)).await?;
        Ok(response.json()?)
    }

    async fn batch_update(&mut self, requests: Vec<JsonValue>) -> Result<JsonValue, SinkError> {
        let url = format!("{}:batchUpdate", self.spreadsheet_url());
        self.send(ApiRequest::post_json(url, json!({ "requests": requests })))
            .await
    }

    /// Opens the worksheet titled `title`, creating it with `initial_header` when absent.
    pub async fn open_worksheet(
        mut self,
        title: &str,
        initial_header: &[String],
    ) -> Result<GoogleWorksheet, SinkError> {
        let meta = self
            .send(ApiRequest::get(self.spreadsheet_url()).query("fields", "sheets.properties(sheetId,title)"))
            .await?;
        let existing = meta
            .get("sheets")
            .and_then(JsonValue::as_array)
            .into_iter()
            .flatten()
            .filter_map(|sheet| sheet.get("properties"))
            .find(|props| props.get("title").and_then(JsonValue::as_str) == Some(title))
            .and_then(|props| props.get("sheetId").and_then(JsonValue::as_i64));

        if let Some(sheet_id) = existing {
            debug!(title, sheet_id, "worksheet found");
            return Ok(GoogleWorksheet {
                sheets: self,
                title: title.to_string(),
                sheet_id,
            });
        }

        let reply = self
            .batch_update(vec![json!({
                "addSheet": {
                    "properties": {
                        "title": title,
                        "gridProperties": {
                            "rowCount": NEW_SHEET_ROWS,
                            "columnCount": NEW_SHEET_COLUMNS,
                        }
                    }
                }
            })])
            .await?;
        let sheet_id = reply
            .pointer("/replies/0/addSheet/properties/sheetId")
            .and_then(JsonValue::as_i64)
            .ok_or_else(|| SinkError::Unexpected("addSheet reply has no sheetId".into()))?;
        info!(title, sheet_id, "worksheet created");

        let mut worksheet = GoogleWorksheet {
            sheets: self,
            title: title.to_string(),
            sheet_id,
        };
        let header_row: Vec<Cell> = initial_header.iter().map(|h| Cell::text(h.clone())).collect();
        worksheet.append_rows(&[header_row]).await?;
        Ok(worksheet)
    }
}

/// A1 column letters for a 0-based column index.
pub fn column_letter(mut index: usize) -> String {
    let mut letters = Vec::new();
    loop {
        letters.push((b'A' + (index % 26) as u8) as char);
        if index < 26 {
            break;
        }
        index = index / 26 - 1;
    }
    letters.iter().rev().collect()
}

#[derive(Debug)]
pub struct GoogleWorksheet {
    sheets: GoogleSheets,
    title: String,
    sheet_id: i64,
}

impl GoogleWorksheet {
    fn range(&self, a1: &str) -> String {
        if self.title.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
            format!("{}!{}", self.title, a1)
        } else {
            format!("'{}'!{}", self.title.replace('\'', "''"), a1)
        }
    }
}

fn value_rows(payload: &JsonValue) -> Vec<Vec<JsonValue>> {
    payload
        .get("values")
        .and_then(JsonValue::as_array)
        .map(|rows| {
            rows.iter()
                .map(|row| row.as_array().cloned().unwrap_or_default())
                .collect()
        })
        .unwrap_or_default()
}

#[async_trait]
impl Worksheet for GoogleWorksheet {
    async fn header(&mut self) -> Result<Vec<String>, SinkError> {
        let url = self.sheets.values_url(&self.range("1:1"));
        let payload = self.sheets.send(ApiRequest::get(url)).await?;
        Ok(value_rows(&payload)
            .into_iter()
            .next()
            .unwrap_or_default()
            .iter()
            .map(|v| Cell::from_json(v).to_string())
            .collect())
    }

    async fn set_header(&mut self, header: &[String]) -> Result<(), SinkError> {
        let url = self.sheets.values_url(&self.range("A1"));
        self.sheets
            .send(ApiRequest::put_json(url, json!({ "values": [header] })).query("valueInputOption", "RAW"))
            .await?;
        Ok(())
    }

    async fn find_rows(&mut self, column: usize, value: &str) -> Result<Vec<usize>, SinkError> {
        let letter = column_letter(column);
        let url = self.sheets.values_url(&self.range(&format!("{letter}:{letter}")));
        let payload = self.sheets.send(ApiRequest::get(url)).await?;
        Ok(value_rows(&payload)
            .iter()
            .enumerate()
            .skip(1)
            .filter(|(_, row)| {
                row.first()
                    .map(|cell| Cell::from_json(cell).to_string() == value)
                    .unwrap_or(false)
            })
            .map(|(idx, _)| idx + 1)
            .collect())
    }

    async fn delete_row(&mut self, row: usize) -> Result<(), SinkError> {
        self.delete_rows(&[row]).await
    }

    /// One batchUpdate; requests are applied in order, so descending input keeps indices valid.
    async fn delete_rows(&mut self, rows: &[usize]) -> Result<(), SinkError> {
        if rows.is_empty() {
            return Ok(());
        }
        if let Some(row) = rows.iter().find(|r| **r < 2) {
            return Err(SinkError::RowOutOfRange { row: *row, rows: 0 });
        }
        let requests: Vec<JsonValue> = rows
            .iter()
            .map(|row| {
                json!({
                    "deleteDimension": {
                        "range": {
                            "sheetId": self.sheet_id,
                            "dimension": "ROWS",
                            "startIndex": row - 1,
                            "endIndex": row,
                        }
                    }
                })
            })
            .collect();
        self.sheets.batch_update(requests).await?;
        Ok(())
    }

    async fn append_rows(&mut self, rows: &[Vec<Cell>]) -> Result<(), SinkError> {
        if rows.is_empty() {
            return Ok(());
        }
        let url = format!("{}:append", self.sheets.values_url(&self.range("A1")));
        self.sheets
            .send(
                ApiRequest::post_json(url, json!({ "values": rows }))
                    .query("valueInputOption", "RAW")
                    .query("insertDataOption", "INSERT_ROWS"),
            )
            .await?;
        Ok(())
    }
}
