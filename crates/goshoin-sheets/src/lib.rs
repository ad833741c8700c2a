//! Sheet layouts, CSV export parsing, header validation and row transformation.

use std::fmt;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use goshoin_core::{normalize_address, prefecture_code, split_close_info, BookstoreRecord};
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const CRATE_NAME: &str = "goshoin-sheets";

/// Number of columns a participant row must carry.
pub const PARTICIPANT_COLUMNS: usize = 7;

/// Spreadsheet coordinates and expected layouts for both rosters.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SheetRegistry {
    pub spreadsheet_id: String,
    pub participants: SheetConfig,
    pub special_edition: SheetConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SheetConfig {
    pub name: String,
    pub gid: String,
    pub range: String,
    pub header: HeaderLayout,
}

/// How a sheet's header is laid out. New spreadsheet revisions get a new
/// variant or new parameters in `sheets.yaml`, not new validation code.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(tag = "strategy", rename_all = "snake_case")]
pub enum HeaderLayout {
    /// Labels live in the first row; data starts on the second.
    SingleRow {
        #[serde(default)]
        strip_prefix: Option<String>,
        columns: Vec<String>,
    },
    /// Labels are spread across the first `rows` rows. Each column's label is
    /// its non-empty cells joined by a single space; data starts after them.
    StackedRows {
        rows: usize,
        #[serde(default)]
        strip_prefix: Option<String>,
        columns: Vec<String>,
    },
}

#[derive(Debug, Error)]
pub enum LayoutError {
    #[error("invalid strip_prefix pattern {pattern:?}: {source}")]
    Pattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },
    #[error("stacked header must span at least one row")]
    EmptyStack,
}

/// Outcome of comparing a sheet header with its expected labels.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeaderCheck {
    pub valid: bool,
    /// `(actual, expected)` per expected column.
    pub comparisons: Vec<(String, String)>,
}

#[derive(Debug, Clone, Error)]
#[error("invalid {sheet} header: {}", format_comparisons(.comparisons))]
pub struct HeaderShapeError {
    pub sheet: String,
    pub comparisons: Vec<(String, String)>,
}

fn format_comparisons(comparisons: &[(String, String)]) -> String {
    comparisons
        .iter()
        .map(|(actual, expected)| format!("{actual:?} vs {expected:?}"))
        .collect::<Vec<_>>()
        .join(", ")
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RowError {
    #[error("row has {found} cells, expected at least {expected}")]
    TooFewCells { found: usize, expected: usize },
    #[error("registration number {0:?} is not an integer")]
    InvalidNumber(String),
}

impl SheetRegistry {
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let registry: SheetRegistry = serde_yaml::from_str(yaml).context("parsing sheet registry")?;
        for sheet in [&registry.participants, &registry.special_edition] {
            sheet
                .header
                .prefix_pattern()
                .with_context(|| format!("validating layout of sheet {}", sheet.name))?;
        }
        Ok(registry)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let yaml = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
        Self::from_yaml_str(&yaml).with_context(|| format!("loading {}", path.display()))
    }
}

impl SheetConfig {
    /// gviz CSV export URL for this sheet under `base_url`.
    pub fn export_url(&self, base_url: &str, spreadsheet_id: &str) -> String {
        format!(
            "{}/spreadsheets/d/{}/gviz/tq?tqx=out:csv&gid={}&range={}",
            base_url.trim_end_matches('/'),
            spreadsheet_id,
            self.gid,
            self.range
        )
    }
}

impl HeaderLayout {
    pub fn header_rows(&self) -> usize {
        match self {
            HeaderLayout::SingleRow { .. } => 1,
            HeaderLayout::StackedRows { rows, .. } => *rows,
        }
    }

    pub fn columns(&self) -> &[String] {
        match self {
            HeaderLayout::SingleRow { columns, .. } | HeaderLayout::StackedRows { columns, .. } => {
                columns
            }
        }
    }

    fn strip_prefix(&self) -> Option<&str> {
        match self {
            HeaderLayout::SingleRow { strip_prefix, .. }
            | HeaderLayout::StackedRows { strip_prefix, .. } => strip_prefix.as_deref(),
        }
    }

    pub fn prefix_pattern(&self) -> Result<Option<Regex>, LayoutError> {
        if self.header_rows() == 0 {
            return Err(LayoutError::EmptyStack);
        }
        self.strip_prefix()
            .map(|pattern| {
                Regex::new(pattern).map_err(|source| LayoutError::Pattern {
                    pattern: pattern.to_string(),
                    source,
                })
            })
            .transpose()
    }

    /// Builds the effective label for every column present in the header rows.
    fn labels(&self, rows: &[Vec<String>], prefix: Option<&Regex>) -> Vec<String> {
        let header = &rows[..self.header_rows().min(rows.len())];
        let width = header.iter().map(Vec::len).max().unwrap_or(0);
        (0..width)
            .map(|col| {
                let joined = header
                    .iter()
                    .filter_map(|row| row.get(col))
                    .map(|cell| cell.trim())
                    .filter(|cell| !cell.is_empty())
                    .collect::<Vec<_>>()
                    .join(" ");
                let label = match (col, prefix) {
                    (0, Some(re)) => re.replace(&joined, "").into_owned(),
                    _ => joined,
                };
                label.trim().to_string()
            })
            .collect()
    }

    /// Compares the header rows of `rows` with the expected column labels.
    pub fn check(&self, rows: &[Vec<String>]) -> Result<HeaderCheck, LayoutError> {
        let prefix = self.prefix_pattern()?;
        let labels = self.labels(rows, prefix.as_ref());
        let comparisons = self
            .columns()
            .iter()
            .enumerate()
            .map(|(idx, expected)| (labels.get(idx).cloned().unwrap_or_default(), expected.clone()))
            .collect::<Vec<_>>();
        let valid = rows.len() >= self.header_rows()
            && comparisons.iter().all(|(actual, expected)| actual == expected);
        Ok(HeaderCheck { valid, comparisons })
    }

    /// Rows after the header, with fully blank lines dropped.
    pub fn data_rows<'a>(&self, rows: &'a [Vec<String>]) -> impl Iterator<Item = &'a Vec<String>> {
        rows.iter().skip(self.header_rows()).filter(|row| !is_blank_row(row))
    }
}

/// Splits a gviz CSV export into rows of cells.
///
/// Rows split on `\n`, cells on `,`, and each cell loses one leading and one
/// trailing `"`. Quoted cells containing commas are not supported.
pub fn parse_csv(text: &str) -> Vec<Vec<String>> {
    text.split('\n')
        .map(|line| line.split(',').map(strip_quotes).collect())
        .collect()
}

fn strip_quotes(cell: &str) -> String {
    let cell = cell.strip_prefix('"').unwrap_or(cell);
    let cell = cell.strip_suffix('"').unwrap_or(cell);
    cell.to_string()
}

pub fn is_blank_row(row: &[String]) -> bool {
    row.iter().all(|cell| cell.trim().is_empty())
}

fn optional_text(cell: &str) -> Option<String> {
    if cell.is_empty() {
        None
    } else {
        Some(cell.to_string())
    }
}

/// Maps a participant row into a record; `special_edition` is resolved later.
pub fn transform_participant_row(row: &[String]) -> Result<BookstoreRecord, RowError> {
    if row.len() < PARTICIPANT_COLUMNS {
        return Err(RowError::TooFewCells {
            found: row.len(),
            expected: PARTICIPANT_COLUMNS,
        });
    }
    let number = row[0]
        .trim()
        .parse::<i32>()
        .map_err(|_| RowError::InvalidNumber(row[0].clone()))?;
    let prefecture = row[1].clone();
    let registered_name = row[3].clone();
    let (name, close_info) = split_close_info(&registered_name);

    Ok(BookstoreRecord {
        number,
        prefecture_code: prefecture_code(&prefecture),
        prefecture,
        city: row[2].clone(),
        registered_name,
        name,
        opening_hour: Some(row[4].clone()),
        establishment_year: Some(row[5].clone()),
        address: normalize_address(&row[6]),
        special_edition: false,
        close_info,
    })
}

/// One row of the special-edition roster.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpecialEditionEntry {
    pub name: String,
    pub prefecture: String,
    pub address: Option<String>,
}

impl fmt::Display for SpecialEditionEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name, self.prefecture)
    }
}

/// Rows without both a name and a prefecture cannot match anything and are dropped.
pub fn parse_special_edition_row(row: &[String]) -> Option<SpecialEditionEntry> {
    match row {
        [name, prefecture, rest @ ..] => Some(SpecialEditionEntry {
            name: name.clone(),
            prefecture: prefecture.clone(),
            address: rest.first().and_then(|a| optional_text(a)),
        }),
        _ => None,
    }
}
