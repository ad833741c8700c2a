//! Sheet export fetching and bookstore persistence.

use std::collections::{BTreeMap, HashSet};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use goshoin_core::{BookstoreRecord, LogStatus, NewUpdateLog, StoredBookstore, UpdateLogEntry};
use serde::Deserialize;
use sqlx::migrate::Migrator;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info_span, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "goshoin-storage";

pub static MIGRATOR: Migrator = sqlx::migrate!("../../migrations");

/// Longer search strings, counted before trimming, match nothing.
pub const MAX_SEARCH_QUERY_LENGTH: usize = 100;

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
        }
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
}

/// Source of sheet exports as text.
#[async_trait]
pub trait SheetSource: Send + Sync {
    async fn fetch_text(&self, url: &str) -> Result<String, FetchError>;
}

/// Single-attempt HTTP fetcher; any transport error or non-2xx status fails the call.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self { client })
    }
}

#[async_trait]
impl SheetSource for HttpFetcher {
    async fn fetch_text(&self, url: &str) -> Result<String, FetchError> {
        let span = info_span!("sheet_fetch", url);
        async {
            let resp = self.client.get(url).send().await?;
            let status = resp.status();
            if !status.is_success() {
                return Err(FetchError::HttpStatus {
                    status: status.as_u16(),
                    url: resp.url().to_string(),
                });
            }
            let body = resp.text().await?;
            debug!(bytes = body.len(), "fetched sheet export");
            Ok::<_, FetchError>(body)
        }
        .instrument(span)
        .await
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("unknown update log status {0:?}")]
    UnknownStatus(String),
    #[error("write rejected: {0}")]
    Rejected(String),
}

/// Filters for the bookstore listing.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct BookstoreQuery {
    #[serde(default)]
    pub q: Option<String>,
    /// Only closed stores when true, only open stores otherwise.
    #[serde(default)]
    pub closed: bool,
    #[serde(default)]
    pub special_edition: bool,
}

impl BookstoreQuery {
    pub fn query_too_long(&self) -> bool {
        self.q
            .as_deref()
            .is_some_and(|q| q.chars().count() > MAX_SEARCH_QUERY_LENGTH)
    }

    fn search_term(&self) -> Option<&str> {
        self.q.as_deref().map(str::trim).filter(|q| !q.is_empty())
    }

    pub fn matches(&self, record: &BookstoreRecord) -> bool {
        if self.query_too_long() {
            return false;
        }
        if record.close_info.is_some() != self.closed {
            return false;
        }
        if self.special_edition && !record.special_edition {
            return false;
        }
        match self.search_term() {
            None => true,
            Some(term) => {
                let term = term.to_lowercase();
                [&record.name, &record.prefecture, &record.address]
                    .iter()
                    .any(|field| field.to_lowercase().contains(&term))
            }
        }
    }
}

/// Persistence seam for the sync job and the read API.
#[async_trait]
pub trait BookstoreStore: Send + Sync {
    /// Insert-or-update keyed by `number`.
    async fn upsert_bookstore(&self, record: &BookstoreRecord) -> Result<(), StoreError>;

    async fn insert_update_log(&self, log: &NewUpdateLog) -> Result<(), StoreError>;

    /// Matching bookstores ordered by `number`.
    async fn search_bookstores(&self, query: &BookstoreQuery) -> Result<Vec<StoredBookstore>, StoreError>;

    /// Newest entries first.
    async fn recent_update_logs(&self, limit: usize) -> Result<Vec<UpdateLogEntry>, StoreError>;
}

#[derive(Debug, Clone)]
pub struct PgBookstoreStore {
    pool: PgPool,
}

impl PgBookstoreStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str) -> anyhow::Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await
            .context("connecting to postgres")?;
        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn migrate(&self) -> anyhow::Result<()> {
        MIGRATOR.run(&self.pool).await.context("running migrations")?;
        Ok(())
    }
}

fn escape_like(term: &str) -> String {
    let mut out = String::with_capacity(term.len() + 2);
    out.push('%');
    for c in term.chars() {
        if matches!(c, '%' | '_' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out.push('%');
    out
}

fn bookstore_from_row(row: &PgRow) -> Result<StoredBookstore, sqlx::Error> {
    Ok(StoredBookstore {
        id: row.try_get("id")?,
        record: BookstoreRecord {
            number: row.try_get("number")?,
            prefecture: row.try_get("prefecture")?,
            prefecture_code: row.try_get("prefecture_code")?,
            city: row.try_get("city")?,
            registered_name: row.try_get("registered_name")?,
            name: row.try_get("name")?,
            opening_hour: row.try_get("opening_hour")?,
            establishment_year: row.try_get("establishment_year")?,
            address: row.try_get("address")?,
            special_edition: row.try_get("special_edition")?,
            close_info: row.try_get("close_info")?,
        },
    })
}

#[async_trait]
impl BookstoreStore for PgBookstoreStore {
    async fn upsert_bookstore(&self, record: &BookstoreRecord) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO bookstores (
                number, prefecture, prefecture_code, city, registered_name, name,
                opening_hour, establishment_year, address, special_edition, close_info
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            ON CONFLICT (number) DO UPDATE
               SET prefecture = EXCLUDED.prefecture,
                   prefecture_code = EXCLUDED.prefecture_code,
                   city = EXCLUDED.city,
                   registered_name = EXCLUDED.registered_name,
                   name = EXCLUDED.name,
                   opening_hour = EXCLUDED.opening_hour,
                   establishment_year = EXCLUDED.establishment_year,
                   address = EXCLUDED.address,
                   special_edition = EXCLUDED.special_edition,
                   close_info = EXCLUDED.close_info
            "#,
        )
        .bind(record.number)
        .bind(&record.prefecture)
        .bind(record.prefecture_code)
        .bind(&record.city)
        .bind(&record.registered_name)
        .bind(&record.name)
        .bind(&record.opening_hour)
        .bind(&record.establishment_year)
        .bind(&record.address)
        .bind(record.special_edition)
        .bind(&record.close_info)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn insert_update_log(&self, log: &NewUpdateLog) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO update_logs (status, message, error_details)
            VALUES ($1, $2, $3)
            "#,
        )
        .bind(log.status.as_str())
        .bind(&log.message)
        .bind(&log.error_details)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn search_bookstores(&self, query: &BookstoreQuery) -> Result<Vec<StoredBookstore>, StoreError> {
        if query.query_too_long() {
            return Ok(Vec::new());
        }
        let pattern = query.search_term().map(escape_like);
        let rows = sqlx::query(
            r#"
            SELECT id, number, prefecture, prefecture_code, city, registered_name, name,
                   opening_hour, establishment_year, address, special_edition, close_info
              FROM bookstores
             WHERE ($1::text IS NULL
                    OR name ILIKE $1
                    OR prefecture ILIKE $1
                    OR address ILIKE $1)
               AND (close_info IS NOT NULL) = $2
               AND (NOT $3 OR special_edition)
             ORDER BY number
            "#,
        )
        .bind(pattern)
        .bind(query.closed)
        .bind(query.special_edition)
        .fetch_all(&self.pool)
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in &rows {
            out.push(bookstore_from_row(row)?);
        }
        Ok(out)
    }

    async fn recent_update_logs(&self, limit: usize) -> Result<Vec<UpdateLogEntry>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, created_at, status, message, error_details
              FROM update_logs
             ORDER BY created_at DESC
             LIMIT $1
            "#,
        )
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let status: String = row.try_get("status")?;
            out.push(UpdateLogEntry {
                id: row.try_get("id")?,
                created_at: row.try_get("created_at")?,
                status: LogStatus::parse(&status).ok_or(StoreError::UnknownStatus(status))?,
                message: row.try_get("message")?,
                error_details: row.try_get("error_details")?,
            });
        }
        Ok(out)
    }
}

#[derive(Debug, Default)]
struct MemoryState {
    bookstores: BTreeMap<i32, StoredBookstore>,
    logs: Vec<UpdateLogEntry>,
    upsert_calls: usize,
}

/// Process-local store used by tests and database-less dry runs.
#[derive(Debug, Default)]
pub struct MemoryBookstoreStore {
    state: Mutex<MemoryState>,
    failing_numbers: HashSet<i32>,
}

impl MemoryBookstoreStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Upserts for these numbers fail with [`StoreError::Rejected`].
    pub fn with_failing_numbers(numbers: impl IntoIterator<Item = i32>) -> Self {
        Self {
            state: Mutex::default(),
            failing_numbers: numbers.into_iter().collect(),
        }
    }

    pub async fn bookstores(&self) -> Vec<BookstoreRecord> {
        let state = self.state.lock().await;
        state.bookstores.values().map(|b| b.record.clone()).collect()
    }

    pub async fn logs(&self) -> Vec<UpdateLogEntry> {
        self.state.lock().await.logs.clone()
    }

    pub async fn upsert_calls(&self) -> usize {
        self.state.lock().await.upsert_calls
    }
}

#[async_trait]
impl BookstoreStore for MemoryBookstoreStore {
    async fn upsert_bookstore(&self, record: &BookstoreRecord) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        state.upsert_calls += 1;
        if self.failing_numbers.contains(&record.number) {
            return Err(StoreError::Rejected(format!("bookstore {}", record.number)));
        }
        let id = state
            .bookstores
            .get(&record.number)
            .map(|existing| existing.id)
            .unwrap_or_else(Uuid::new_v4);
        state.bookstores.insert(
            record.number,
            StoredBookstore {
                id,
                record: record.clone(),
            },
        );
        Ok(())
    }

    async fn insert_update_log(&self, log: &NewUpdateLog) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        let created_at: DateTime<Utc> = Utc::now();
        state.logs.push(UpdateLogEntry {
            id: Uuid::new_v4(),
            created_at,
            status: log.status,
            message: log.message.clone(),
            error_details: log.error_details.clone(),
        });
        Ok(())
    }

    async fn search_bookstores(&self, query: &BookstoreQuery) -> Result<Vec<StoredBookstore>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .bookstores
            .values()
            .filter(|b| query.matches(&b.record))
            .cloned()
            .collect())
    }

    async fn recent_update_logs(&self, limit: usize) -> Result<Vec<UpdateLogEntry>, StoreError> {
        let state = self.state.lock().await;
        Ok(state.logs.iter().rev().take(limit).cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(number: i32, name: &str, close_info: Option<&str>, special: bool) -> BookstoreRecord {
        BookstoreRecord {
            number,
            prefecture: "東京都".into(),
            prefecture_code: 13,
            city: "渋谷区".into(),
            registered_name: name.into(),
            name: name.into(),
            opening_hour: None,
            establishment_year: None,
            address: "神南１".into(),
            special_edition: special,
            close_info: close_info.map(str::to_string),
        }
    }

    #[test]
    fn like_patterns_escape_wildcards() {
        assert_eq!(escape_like("本屋"), "%本屋%");
        assert_eq!(escape_like("50%_off\\"), "%50\\%\\_off\\\\%");
    }

    #[test]
    fn query_filters_follow_listing_rules() {
        let open = record(1, "Open Books", None, false);
        let closed = record(2, "Closed Books", Some("閉店"), false);
        let special = record(3, "Special Books", None, true);

        let default = BookstoreQuery::default();
        assert!(default.matches(&open));
        assert!(!default.matches(&closed));

        let closed_only = BookstoreQuery {
            closed: true,
            ..Default::default()
        };
        assert!(closed_only.matches(&closed));
        assert!(!closed_only.matches(&open));

        let special_only = BookstoreQuery {
            special_edition: true,
            ..Default::default()
        };
        assert!(special_only.matches(&special));
        assert!(!special_only.matches(&open));

        let search = BookstoreQuery {
            q: Some("  open ".into()),
            ..Default::default()
        };
        assert!(search.matches(&open));
        assert!(!search.matches(&special));

        let by_prefecture = BookstoreQuery {
            q: Some("東京".into()),
            ..Default::default()
        };
        assert!(by_prefecture.matches(&open));
    }

    #[tokio::test]
    async fn overlong_search_returns_nothing() {
        let store = MemoryBookstoreStore::new();
        store.upsert_bookstore(&record(1, "Open Books", None, false)).await.expect("insert");

        let at_limit = BookstoreQuery {
            q: Some(format!("open{}", " ".repeat(MAX_SEARCH_QUERY_LENGTH - 4))),
            ..Default::default()
        };
        assert!(!at_limit.query_too_long());
        assert_eq!(store.search_bookstores(&at_limit).await.expect("search").len(), 1);

        let over_limit = BookstoreQuery {
            q: Some(format!("open{}", " ".repeat(MAX_SEARCH_QUERY_LENGTH - 3))),
            ..Default::default()
        };
        assert!(over_limit.query_too_long());
        assert!(store.search_bookstores(&over_limit).await.expect("search").is_empty());

        let wide = BookstoreQuery {
            q: Some("本".repeat(MAX_SEARCH_QUERY_LENGTH)),
            ..Default::default()
        };
        assert!(!wide.query_too_long());
    }

    #[tokio::test]
    async fn memory_upsert_keeps_one_row_per_number() {
        let store = MemoryBookstoreStore::new();
        store.upsert_bookstore(&record(1, "First", None, false)).await.expect("insert");
        let first_id = store.search_bookstores(&BookstoreQuery::default()).await.expect("search")[0].id;
        store.upsert_bookstore(&record(1, "Renamed", None, false)).await.expect("update");

        let rows = store.search_bookstores(&BookstoreQuery::default()).await.expect("search");
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].id, first_id);
        assert_eq!(rows[0].record.name, "Renamed");
        assert_eq!(store.upsert_calls().await, 2);
    }

    #[tokio::test]
    async fn memory_store_injects_row_failures() {
        let store = MemoryBookstoreStore::with_failing_numbers([7]);
        let err = store
            .upsert_bookstore(&record(7, "Broken", None, false))
            .await
            .expect_err("rejected");
        assert!(matches!(err, StoreError::Rejected(_)));
        assert!(store.bookstores().await.is_empty());
    }

    #[tokio::test]
    async fn recent_logs_are_newest_first() {
        let store = MemoryBookstoreStore::new();
        store.insert_update_log(&NewUpdateLog::for_counts(1, 0)).await.expect("log");
        store.insert_update_log(&NewUpdateLog::for_failure("boom")).await.expect("log");

        let logs = store.recent_update_logs(1).await.expect("logs");
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].status, LogStatus::Error);
        assert_eq!(logs[0].error_details.as_deref(), Some("boom"));
    }

    /// Serves one canned HTTP response on a local port and returns its url.
    async fn serve_once(response: &'static str) -> String {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.expect("accept");
            let mut buf = [0u8; 4096];
            let _ = socket.read(&mut buf).await;
            socket.write_all(response.as_bytes()).await.expect("write");
            let _ = socket.shutdown().await;
        });
        format!("http://{addr}/export?format=csv")
    }

    #[tokio::test]
    async fn http_fetcher_maps_non_success_status() {
        let url = serve_once(
            "HTTP/1.1 503 Service Unavailable\r\ncontent-length: 0\r\nconnection: close\r\n\r\n",
        )
        .await;
        let fetcher = HttpFetcher::new(HttpClientConfig::default()).expect("client");
        let err = fetcher.fetch_text(&url).await.expect_err("503");
        match err {
            FetchError::HttpStatus { status, url: failed } => {
                assert_eq!(status, 503);
                assert_eq!(failed, url);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn http_fetcher_returns_body_text() {
        let url = serve_once(
            "HTTP/1.1 200 OK\r\ncontent-type: text/csv\r\ncontent-length: 7\r\nconnection: close\r\n\r\n\"a\",\"b\"",
        )
        .await;
        let fetcher = HttpFetcher::new(HttpClientConfig::default()).expect("client");
        assert_eq!(fetcher.fetch_text(&url).await.expect("body"), "\"a\",\"b\"");
    }
}
