//! Listing/subscriber persistence, raw page archival and HTTP fetch utilities.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hw_core::{Listing, ListingStatus, Subscriber};
use reqwest::StatusCode;
use sha2::{Digest, Sha256};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::FromRow;
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::{RwLock, Semaphore};
use tracing::{debug, info_span, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "hw-storage";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("stored listing {identity} is corrupt: {reason}")]
    Corrupt { identity: String, reason: String },
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Durable keyed storage for listings.
///
/// `upsert` replaces the whole record for an identity atomically; readers never
/// observe a partially written listing.
#[async_trait]
pub trait ListingStore: Send + Sync {
    async fn find_by_identity(&self, identity: &str) -> Result<Option<Listing>, StoreError>;

    async fn upsert(&self, listing: &Listing) -> Result<(), StoreError>;

    /// Listings with `ends_at > now`, in reporting order.
    async fn list_active(&self, now: DateTime<Utc>) -> Result<Vec<Listing>, StoreError>;

    /// All listings ordered `ends_at desc, starts_at desc, identity desc`.
    async fn list_all(&self) -> Result<Vec<Listing>, StoreError>;
}

/// Recipients of status-transition notifications.
#[async_trait]
pub trait SubscriberDirectory: Send + Sync {
    async fn list_subscribers(&self) -> Result<Vec<Subscriber>, StoreError>;

    /// Out-of-band registration; re-registering an existing contact is a no-op.
    async fn register(&self, subscriber: &Subscriber) -> Result<(), StoreError>;
}

#[derive(Debug, Default)]
pub struct MemoryListingStore {
    listings: RwLock<HashMap<String, Listing>>,
}

impl MemoryListingStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_listings(listings: impl IntoIterator<Item = Listing>) -> Self {
        Self {
            listings: RwLock::new(
                listings
                    .into_iter()
                    .map(|l| (l.identity.clone(), l))
                    .collect(),
            ),
        }
    }

    pub async fn len(&self) -> usize {
        self.listings.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.listings.read().await.is_empty()
    }
}

#[async_trait]
impl ListingStore for MemoryListingStore {
    async fn find_by_identity(&self, identity: &str) -> Result<Option<Listing>, StoreError> {
        Ok(self.listings.read().await.get(identity).cloned())
    }

    async fn upsert(&self, listing: &Listing) -> Result<(), StoreError> {
        self.listings
            .write()
            .await
            .insert(listing.identity.clone(), listing.clone());
        Ok(())
    }

    async fn list_active(&self, now: DateTime<Utc>) -> Result<Vec<Listing>, StoreError> {
        let mut rows: Vec<_> = self
            .listings
            .read()
            .await
            .values()
            .filter(|l| l.is_active_at(now))
            .cloned()
            .collect();
        rows.sort_by(Listing::reporting_order);
        Ok(rows)
    }

    async fn list_all(&self) -> Result<Vec<Listing>, StoreError> {
        let mut rows: Vec<_> = self.listings.read().await.values().cloned().collect();
        rows.sort_by(Listing::reporting_order);
        Ok(rows)
    }
}

#[derive(Debug, Default)]
pub struct MemorySubscriberDirectory {
    subscribers: RwLock<Vec<Subscriber>>,
}

impl MemorySubscriberDirectory {
    pub fn new(subscribers: impl IntoIterator<Item = Subscriber>) -> Self {
        Self {
            subscribers: RwLock::new(subscribers.into_iter().collect()),
        }
    }
}

#[async_trait]
impl SubscriberDirectory for MemorySubscriberDirectory {
    async fn list_subscribers(&self) -> Result<Vec<Subscriber>, StoreError> {
        Ok(self.subscribers.read().await.clone())
    }

    async fn register(&self, subscriber: &Subscriber) -> Result<(), StoreError> {
        let mut subscribers = self.subscribers.write().await;
        if !subscribers.contains(subscriber) {
            subscribers.push(subscriber.clone());
        }
        Ok(())
    }
}

pub async fn connect_pool(database_url: &str) -> Result<PgPool, StoreError> {
    Ok(PgPoolOptions::new()
        .max_connections(10)
        .connect(database_url)
        .await?)
}

pub async fn run_migrations(pool: &PgPool) -> Result<(), StoreError> {
    sqlx::migrate!("../../migrations").run(pool).await?;
    Ok(())
}

#[derive(Debug, FromRow)]
struct ListingRow {
    identity: String,
    status: String,
    number: i64,
    region: Option<String>,
    name: Option<String>,
    starts_at: Option<DateTime<Utc>>,
    ends_at: Option<DateTime<Utc>>,
}

impl TryFrom<ListingRow> for Listing {
    type Error = StoreError;

    fn try_from(row: ListingRow) -> Result<Self, Self::Error> {
        let status = ListingStatus::parse(&row.status).ok_or_else(|| StoreError::Corrupt {
            identity: row.identity.clone(),
            reason: format!("unknown status `{}`", row.status),
        })?;
        Ok(Listing {
            identity: row.identity,
            status,
            number: row.number,
            region: row.region,
            name: row.name,
            starts_at: row.starts_at,
            ends_at: row.ends_at,
        })
    }
}

const LISTING_COLUMNS: &str = "identity, status, number, region, name, starts_at, ends_at";

#[derive(Debug, Clone)]
pub struct PgListingStore {
    pool: PgPool,
}

impl PgListingStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn rows_to_listings(rows: Vec<ListingRow>) -> Result<Vec<Listing>, StoreError> {
        rows.into_iter().map(Listing::try_from).collect()
    }
}

#[async_trait]
impl ListingStore for PgListingStore {
    async fn find_by_identity(&self, identity: &str) -> Result<Option<Listing>, StoreError> {
        let row: Option<ListingRow> = sqlx::query_as(&format!(
            "SELECT {LISTING_COLUMNS} FROM listings WHERE identity = $1"
        ))
        .bind(identity)
        .fetch_optional(&self.pool)
        .await?;
        row.map(Listing::try_from).transpose()
    }

    async fn upsert(&self, listing: &Listing) -> Result<(), StoreError> {
        debug!(identity = %listing.identity, status = %listing.status, "upserting listing");
        // Single statement: the row is replaced as a whole or not at all.
        sqlx::query(
            r#"
            INSERT INTO listings (identity, status, number, region, name, starts_at, ends_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (identity) DO UPDATE SET
                status = EXCLUDED.status,
                number = EXCLUDED.number,
                region = EXCLUDED.region,
                name = EXCLUDED.name,
                starts_at = EXCLUDED.starts_at,
                ends_at = EXCLUDED.ends_at,
                updated_at = NOW()
            WHERE (listings.status, listings.number, listings.region, listings.name,
                   listings.starts_at, listings.ends_at)
                  IS DISTINCT FROM
                  (EXCLUDED.status, EXCLUDED.number, EXCLUDED.region, EXCLUDED.name,
                   EXCLUDED.starts_at, EXCLUDED.ends_at)
            "#,
        )
        .bind(&listing.identity)
        .bind(listing.status.as_str())
        .bind(listing.number)
        .bind(&listing.region)
        .bind(&listing.name)
        .bind(listing.starts_at)
        .bind(listing.ends_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_active(&self, now: DateTime<Utc>) -> Result<Vec<Listing>, StoreError> {
        let rows: Vec<ListingRow> = sqlx::query_as(&format!(
            "SELECT {LISTING_COLUMNS} FROM listings WHERE ends_at > $1 \
             ORDER BY ends_at DESC NULLS LAST, starts_at DESC NULLS LAST, identity DESC"
        ))
        .bind(now)
        .fetch_all(&self.pool)
        .await?;
        Self::rows_to_listings(rows)
    }

    async fn list_all(&self) -> Result<Vec<Listing>, StoreError> {
        let rows: Vec<ListingRow> = sqlx::query_as(&format!(
            "SELECT {LISTING_COLUMNS} FROM listings \
             ORDER BY ends_at DESC NULLS LAST, starts_at DESC NULLS LAST, identity DESC"
        ))
        .fetch_all(&self.pool)
        .await?;
        Self::rows_to_listings(rows)
    }
}

#[derive(Debug, Clone)]
pub struct PgSubscriberDirectory {
    pool: PgPool,
}

impl PgSubscriberDirectory {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SubscriberDirectory for PgSubscriberDirectory {
    async fn list_subscribers(&self) -> Result<Vec<Subscriber>, StoreError> {
        let rows: Vec<(String,)> =
            sqlx::query_as("SELECT contact_id FROM subscribers ORDER BY created_at, contact_id")
                .fetch_all(&self.pool)
                .await?;
        Ok(rows.into_iter().map(|(id,)| Subscriber::new(id)).collect())
    }

    async fn register(&self, subscriber: &Subscriber) -> Result<(), StoreError> {
        sqlx::query("INSERT INTO subscribers (contact_id) VALUES ($1) ON CONFLICT (contact_id) DO NOTHING")
            .bind(&subscriber.contact_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct ArchivedPage {
    pub content_hash: String,
    pub path: PathBuf,
    pub byte_size: usize,
    pub deduplicated: bool,
}

/// Immutable, content-addressed archive of raw scraped pages.
#[derive(Debug, Clone)]
pub struct PageArchive {
    root: PathBuf,
}

impl PageArchive {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn sha256_hex(bytes: &[u8]) -> String {
        hex::encode(Sha256::digest(bytes))
    }

    pub fn relative_path(fetched_at: DateTime<Utc>, page: u32, content_hash: &str, extension: &str) -> PathBuf {
        let ext = extension.trim_start_matches('.').trim();
        let ext = if ext.is_empty() { "bin" } else { ext };
        PathBuf::from(fetched_at.format("%Y%m%d").to_string())
            .join(format!("page-{page}"))
            .join(format!("{content_hash}.{ext}"))
    }

    /// Writes through a temp file and rename so a partially written page is never visible.
    pub async fn store_page(
        &self,
        fetched_at: DateTime<Utc>,
        page: u32,
        extension: &str,
        bytes: &[u8],
    ) -> anyhow::Result<ArchivedPage> {
        let content_hash = Self::sha256_hex(bytes);
        let path = self
            .root
            .join(Self::relative_path(fetched_at, page, &content_hash, extension));
        let parent = path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.root.clone());
        let archived = |deduplicated| ArchivedPage {
            content_hash: content_hash.clone(),
            path: path.clone(),
            byte_size: bytes.len(),
            deduplicated,
        };

        fs::create_dir_all(&parent)
            .await
            .with_context(|| format!("creating archive directory {}", parent.display()))?;
        if fs::try_exists(&path)
            .await
            .with_context(|| format!("checking archive path {}", path.display()))?
        {
            return Ok(archived(true));
        }

        let temp_path = parent.join(format!(".{}.tmp", Uuid::new_v4()));
        let mut file = fs::File::create(&temp_path)
            .await
            .with_context(|| format!("creating {}", temp_path.display()))?;
        file.write_all(bytes)
            .await
            .with_context(|| format!("writing {}", temp_path.display()))?;
        file.flush().await?;
        drop(file);

        if let Err(err) = fs::rename(&temp_path, &path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(err).with_context(|| format!("renaming archive into {}", path.display()));
        }
        Ok(archived(false))
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub concurrency: usize,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            concurrency: 4,
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum HttpFetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
}

/// Bounded GET client shared by the scraper sources.
///
/// Each call is a single attempt. A failed page is picked up again by the
/// next scheduled run, never retried in place.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
    limit: Arc<Semaphore>,
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

        Ok(Self {
            client,
            limit: Arc::new(Semaphore::new(config.concurrency.max(1))),
        })
    }

    pub fn client(&self) -> &reqwest::Client {
        &self.client
    }

    pub async fn fetch_bytes(&self, url: &str) -> Result<FetchedResponse, HttpFetchError> {
        // The semaphore is owned by this fetcher and never closed.
        let _permit = self.limit.acquire().await.expect("semaphore not closed");
        self.fetch_once(url).instrument(info_span!("http_fetch", url)).await
    }

    async fn fetch_once(&self, url: &str) -> Result<FetchedResponse, HttpFetchError> {
        let resp = self.client.get(url).send().await?;
        let status = resp.status();
        let final_url = resp.url().to_string();
        if !status.is_success() {
            debug!(status = status.as_u16(), url = %final_url, "page request rejected");
            return Err(HttpFetchError::HttpStatus {
                status: status.as_u16(),
                url: final_url,
            });
        }
        let body = resp.bytes().await?.to_vec();
        Ok(FetchedResponse {
            status,
            final_url,
            body,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};
    use tempfile::tempdir;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    fn listing(identity: &str, status: ListingStatus, ends_day: Option<u32>) -> Listing {
        Listing {
            identity: identity.to_string(),
            status,
            number: 3,
            region: Some("Wuhou".into()),
            name: None,
            starts_at: None,
            ends_at: ends_day.map(|d| Utc.with_ymd_and_hms(2026, 2, d, 0, 0, 0).unwrap()),
        }
    }

    #[tokio::test]
    async fn memory_upsert_replaces_record_and_is_idempotent() {
        let store = MemoryListingStore::new();
        let first = listing("a", ListingStatus::OnMarket, Some(1));
        store.upsert(&first).await.unwrap();

        let updated = listing("a", ListingStatus::Sold, Some(2));
        store.upsert(&updated).await.unwrap();
        store.upsert(&updated).await.unwrap();

        assert_eq!(store.len().await, 1);
        assert_eq!(store.find_by_identity("a").await.unwrap(), Some(updated));
        assert_eq!(store.find_by_identity("missing").await.unwrap(), None);
    }

    #[tokio::test]
    async fn memory_lists_in_reporting_order_and_filters_active() {
        let store = MemoryListingStore::with_listings([
            listing("a", ListingStatus::OnMarket, Some(3)),
            listing("b", ListingStatus::OnMarket, None),
            listing("c", ListingStatus::Sold, Some(10)),
        ]);

        let all: Vec<_> = store
            .list_all()
            .await
            .unwrap()
            .into_iter()
            .map(|l| l.identity)
            .collect();
        assert_eq!(all, ["c", "a", "b"]);

        let now = Utc.with_ymd_and_hms(2026, 2, 5, 0, 0, 0).unwrap();
        let active: Vec<_> = store
            .list_active(now)
            .await
            .unwrap()
            .into_iter()
            .map(|l| l.identity)
            .collect();
        assert_eq!(active, ["c"]);
    }

    #[tokio::test]
    async fn memory_directory_registration_is_deduplicated() {
        let directory = MemorySubscriberDirectory::new([Subscriber::new("100")]);
        directory.register(&Subscriber::new("100")).await.unwrap();
        directory.register(&Subscriber::new("200")).await.unwrap();
        let ids: Vec<_> = directory
            .list_subscribers()
            .await
            .unwrap()
            .into_iter()
            .map(|s| s.contact_id)
            .collect();
        assert_eq!(ids, ["100", "200"]);
    }

    #[test]
    fn corrupt_status_rows_are_rejected() {
        let row = ListingRow {
            identity: "x".into(),
            status: "unknown".into(),
            number: 0,
            region: None,
            name: None,
            starts_at: None,
            ends_at: None,
        };
        assert!(matches!(
            Listing::try_from(row),
            Err(StoreError::Corrupt { identity, .. }) if identity == "x"
        ));
    }

    #[test]
    fn page_hashing_is_stable() {
        assert_eq!(
            PageArchive::sha256_hex(b"hello world"),
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[tokio::test]
    async fn archive_deduplicates_identical_pages() {
        let dir = tempdir().expect("tempdir");
        let archive = PageArchive::new(dir.path());
        let fetched_at = Utc.with_ymd_and_hms(2026, 2, 24, 12, 0, 0).unwrap();

        let first = archive
            .store_page(fetched_at, 1, "json", b"[{\"uuid\":\"a\"}]")
            .await
            .expect("first store");
        let second = archive
            .store_page(fetched_at, 1, ".json", b"[{\"uuid\":\"a\"}]")
            .await
            .expect("second store");

        assert!(!first.deduplicated);
        assert!(second.deduplicated);
        assert_eq!(first.path, second.path);
        assert!(first.path.ends_with(format!("20260224/page-1/{}.json", first.content_hash)));
        assert!(first.path.exists());
    }

    /// Answers every request with `status_line` and counts the requests seen.
    async fn status_server(status_line: &'static str) -> (String, Arc<AtomicUsize>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                let mut buf = [0u8; 4096];
                let _ = socket.read(&mut buf).await;
                counter.fetch_add(1, AtomicOrdering::SeqCst);
                let response = format!(
                    "HTTP/1.1 {status_line}\r\ncontent-length: 2\r\nconnection: close\r\n\r\n[]"
                );
                let _ = socket.write_all(response.as_bytes()).await;
                let _ = socket.shutdown().await;
            }
        });
        (format!("http://{addr}/page/1"), hits)
    }

    #[tokio::test]
    async fn unavailable_upstream_is_requested_exactly_once() {
        let (url, hits) = status_server("503 Service Unavailable").await;
        let fetcher = HttpFetcher::new(HttpClientConfig::default()).unwrap();

        let err = fetcher.fetch_bytes(&url).await.unwrap_err();

        assert!(matches!(err, HttpFetchError::HttpStatus { status: 503, .. }));
        assert_eq!(hits.load(AtomicOrdering::SeqCst), 1);
    }

    #[tokio::test]
    async fn successful_fetch_returns_body() {
        let (url, hits) = status_server("200 OK").await;
        let fetcher = HttpFetcher::new(HttpClientConfig::default()).unwrap();

        let resp = fetcher.fetch_bytes(&url).await.unwrap();

        assert_eq!(resp.status, StatusCode::OK);
        assert_eq!(resp.body, b"[]");
        assert_eq!(hits.load(AtomicOrdering::SeqCst), 1);
    }
}
