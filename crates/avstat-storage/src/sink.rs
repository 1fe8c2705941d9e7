//! Row-oriented sink contract and the date-scoped replace-write on top of it.

use async_trait::async_trait;
use avstat_core::{columns, fit_width, Cell, SheetRow};
use thiserror::Error;
use tracing::{debug, info};

use crate::FetchError;

#[derive(Debug, Error)]
pub enum SinkError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("service account credentials: {0}")]
    Credentials(String),
    #[error("unexpected sheets response: {0}")]
    Unexpected(String),
    #[error("row {row} is not a data row (sheet has {rows} rows)")]
    RowOutOfRange { row: usize, rows: usize },
}

/// A single worksheet. Row numbers are 1-based sheet rows; row 1 is the header.
#[async_trait]
pub trait Worksheet: Send {
    async fn header(&mut self) -> Result<Vec<String>, SinkError>;

    async fn set_header(&mut self, header: &[String]) -> Result<(), SinkError>;

    /// Rows whose cell at `column` (0-based) renders exactly as `value`. Never includes the header.
    async fn find_rows(&mut self, column: usize, value: &str) -> Result<Vec<usize>, SinkError>;

    async fn delete_row(&mut self, row: usize) -> Result<(), SinkError>;

    /// `rows` must already be in descending order.
    async fn delete_rows(&mut self, rows: &[usize]) -> Result<(), SinkError> {
        for row in rows {
            self.delete_row(*row).await?;
        }
        Ok(())
    }

    async fn append_rows(&mut self, rows: &[Vec<Cell>]) -> Result<(), SinkError>;
}

/// In-process worksheet backing the reconciler tests.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MemoryWorksheet {
    header: Vec<String>,
    rows: Vec<Vec<Cell>>,
}

impl MemoryWorksheet {
    pub fn new(header: Vec<String>) -> Self {
        Self {
            header,
            rows: Vec::new(),
        }
    }

    pub fn with_rows(mut self, rows: Vec<Vec<Cell>>) -> Self {
        self.rows = rows;
        self
    }

    pub fn header_row(&self) -> &[String] {
        &self.header
    }

    pub fn rows(&self) -> &[Vec<Cell>] {
        &self.rows
    }

    /// Data rows whose `column` cell renders as `value`.
    pub fn rows_matching(&self, column: &str, value: &str) -> Vec<&Vec<Cell>> {
        let Some(idx) = self.header.iter().position(|h| h == column) else {
            return Vec::new();
        };
        self.rows
            .iter()
            .filter(|row| row.get(idx).map(|c| c.to_string()).as_deref() == Some(value))
            .collect()
    }
}

#[async_trait]
impl Worksheet for MemoryWorksheet {
    async fn header(&mut self) -> Result<Vec<String>, SinkError> {
        Ok(self.header.clone())
    }

    async fn set_header(&mut self, header: &[String]) -> Result<(), SinkError> {
        self.header = header.to_vec();
        let width = self.header.len();
        for row in &mut self.rows {
            if row.len() < width {
                *row = fit_width(std::mem::take(row), width);
            }
        }
        Ok(())
    }

    async fn find_rows(&mut self, column: usize, value: &str) -> Result<Vec<usize>, SinkError> {
        Ok(self
            .rows
            .iter()
            .enumerate()
            .filter(|(_, row)| row.get(column).map(|c| c.to_string()).as_deref() == Some(value))
            .map(|(idx, _)| idx + 2)
            .collect())
    }

    async fn delete_row(&mut self, row: usize) -> Result<(), SinkError> {
        if row < 2 || row - 2 >= self.rows.len() {
            return Err(SinkError::RowOutOfRange {
                row,
                rows: self.rows.len() + 1,
            });
        }
        self.rows.remove(row - 2);
        Ok(())
    }

    async fn append_rows(&mut self, rows: &[Vec<Cell>]) -> Result<(), SinkError> {
        self.rows.extend(rows.iter().cloned());
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ReplaceOutcome {
    pub deleted: usize,
    pub appended: usize,
}

/// Replace-write discipline: header superset, drop the date's rows, append fresh ones.
#[derive(Debug, Clone)]
pub struct SinkWriter {
    required_columns: Vec<String>,
}

impl SinkWriter {
    pub fn new(required_columns: Vec<String>) -> Self {
        Self { required_columns }
    }

    /// Appends missing required columns after the existing ones; returns the resulting header.
    pub async fn ensure_header<W: Worksheet + ?Sized>(
        &self,
        sheet: &mut W,
    ) -> Result<Vec<String>, SinkError> {
        let mut header = sheet.header().await?;
        let missing: Vec<String> = self
            .required_columns
            .iter()
            .filter(|col| !header.contains(col))
            .cloned()
            .collect();
        if !missing.is_empty() {
            info!(?missing, "extending sink header");
            header.extend(missing);
            sheet.set_header(&header).await?;
        }
        Ok(header)
    }

    pub async fn replace_date<W: Worksheet + ?Sized>(
        &self,
        sheet: &mut W,
        date: &str,
        rows: &[SheetRow],
    ) -> Result<ReplaceOutcome, SinkError> {
        let header = self.ensure_header(sheet).await?;
        let date_column = header
            .iter()
            .position(|h| h == columns::DATE)
            .ok_or_else(|| SinkError::Unexpected(format!("header has no {} column", columns::DATE)))?;

        let mut stale = sheet.find_rows(date_column, date).await?;
        stale.sort_unstable_by(|a, b| b.cmp(a));
        stale.dedup();
        debug!(date, rows = stale.len(), "deleting stale rows");
        sheet.delete_rows(&stale).await?;

        let cells: Vec<Vec<Cell>> = rows
            .iter()
            .map(|row| fit_width(row.layout(&header), header.len()))
            .collect();
        sheet.append_rows(&cells).await?;

        Ok(ReplaceOutcome {
            deleted: stale.len(),
            appended: cells.len(),
        })
    }
}
