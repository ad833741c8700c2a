//! Core domain model and text normalization for the bookstore directory.

use std::fmt;

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const CRATE_NAME: &str = "goshoin-core";

/// Prefecture names in JIS X 0401 order; the code is the 1-based index.
pub const PREFECTURES: [&str; 47] = [
    "北海道", "青森県", "岩手県", "宮城県", "秋田県", "山形県", "福島県",
    "茨城県", "栃木県", "群馬県", "埼玉県", "千葉県", "東京都", "神奈川県",
    "新潟県", "富山県", "石川県", "福井県", "山梨県", "長野県", "岐阜県",
    "静岡県", "愛知県", "三重県", "滋賀県", "京都府", "大阪府", "兵庫県",
    "奈良県", "和歌山県", "鳥取県", "島根県", "岡山県", "広島県", "山口県",
    "徳島県", "香川県", "愛媛県", "高知県", "福岡県", "佐賀県", "長崎県",
    "熊本県", "大分県", "宮崎県", "鹿児島県", "沖縄県",
];

const PREFECTURE_SUFFIXES: [char; 4] = ['都', '道', '府', '県'];

static CLOSE_INFO: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"【(.+?)】").expect("close info pattern is valid"));

const FULLWIDTH_DIGITS: [char; 10] = ['０', '１', '２', '３', '４', '５', '６', '７', '８', '９'];

/// Exact-match lookup into [`PREFECTURES`]. Unknown names map to 0.
pub fn prefecture_code(name: &str) -> i32 {
    PREFECTURES
        .iter()
        .position(|p| *p == name)
        .map(|idx| idx as i32 + 1)
        .unwrap_or(0)
}

/// Drops one trailing administrative suffix (都/道/府/県), if present.
pub fn trim_prefecture_suffix(prefecture: &str) -> &str {
    prefecture
        .strip_suffix(|c: char| PREFECTURE_SUFFIXES.contains(&c))
        .unwrap_or(prefecture)
}

pub fn to_fullwidth_digits(input: &str) -> String {
    input
        .chars()
        .map(|c| {
            if c.is_ascii_digit() {
                FULLWIDTH_DIGITS[(c as u8 - b'0') as usize]
            } else {
                c
            }
        })
        .collect()
}

/// Replaces the first U+2212 minus with a fullwidth hyphen-minus, then widens digits.
pub fn normalize_address(address: &str) -> String {
    to_fullwidth_digits(&address.replacen('\u{2212}', "\u{FF0D}", 1))
}

/// Splits a registered name into its display name and close annotation.
///
/// Every `【...】` span is removed from the display name; the annotation is the
/// content of the first one.
pub fn split_close_info(registered_name: &str) -> (String, Option<String>) {
    let close_info = CLOSE_INFO
        .captures(registered_name)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_string());
    let name = CLOSE_INFO.replace_all(registered_name, "").into_owned();
    (name, close_info)
}

/// Canonical bookstore row, keyed by the roster `number`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookstoreRecord {
    pub number: i32,
    pub prefecture: String,
    pub prefecture_code: i32,
    pub city: String,
    pub registered_name: String,
    pub name: String,
    pub opening_hour: Option<String>,
    pub establishment_year: Option<String>,
    pub address: String,
    pub special_edition: bool,
    pub close_info: Option<String>,
}

/// Persisted bookstore as returned by read queries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredBookstore {
    pub id: Uuid,
    #[serde(flatten)]
    pub record: BookstoreRecord,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogStatus {
    Success,
    Error,
}

impl LogStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            LogStatus::Success => "success",
            LogStatus::Error => "error",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "success" => Some(LogStatus::Success),
            "error" => Some(LogStatus::Error),
            _ => None,
        }
    }
}

impl fmt::Display for LogStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Log entry as submitted by a sync run; `id` and `created_at` are assigned by the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewUpdateLog {
    pub status: LogStatus,
    pub message: String,
    pub error_details: Option<String>,
}

impl NewUpdateLog {
    pub fn for_counts(updated: usize, errors: usize) -> Self {
        if errors == 0 {
            Self {
                status: LogStatus::Success,
                message: format!("{updated} 件の店舗を更新しました"),
                error_details: None,
            }
        } else {
            Self {
                status: LogStatus::Error,
                message: format!(
                    "{updated} 件の店舗を更新しました。{errors} 件の店舗の更新に失敗しました"
                ),
                error_details: Some(format!("{errors} 件の店舗の更新に失敗しました")),
            }
        }
    }

    pub fn for_failure(details: impl Into<String>) -> Self {
        Self {
            status: LogStatus::Error,
            message: "Failed to update bookstores".to_string(),
            error_details: Some(details.into()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateLogEntry {
    pub id: Uuid,
    pub created_at: DateTime<Utc>,
    pub status: LogStatus,
    pub message: String,
    pub error_details: Option<String>,
}

/// Result of one sync run as reported to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncOutcome {
    pub success: bool,
    pub updated_count: usize,
    pub error_count: usize,
}

impl SyncOutcome {
    pub fn aborted() -> Self {
        Self {
            success: false,
            updated_count: 0,
            error_count: 1,
        }
    }
}
