//! Ingestion pipeline orchestration: change detection, notification dispatch,
//! persistence and the scheduled/on-demand triggers around them.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, FixedOffset, Utc};
use futures::future::join_all;
use hw_adapters::{
    FetchError, FixtureListingSource, HttpListingSource, ListingSource, LogTransport,
    MessageTransport, PageFormat, TelegramTransport, DEFAULT_TELEGRAM_API_BASE,
};
use hw_core::{ChangeKind, ChangeRecord, Listing, Normalizer, Subscriber, DEFAULT_SOURCE_OFFSET_HOURS};
use hw_storage::{
    connect_pool, HttpClientConfig, HttpFetcher, ListingStore, MemoryListingStore,
    MemorySubscriberDirectory, PageArchive, PgListingStore, PgSubscriberDirectory, StoreError,
    SubscriberDirectory,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "hw-sync";

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub database_url: Option<String>,
    pub scraper_url: Option<String>,
    pub scraper_format: PageFormat,
    pub fixtures_dir: PathBuf,
    pub telegram_bot_token: Option<String>,
    pub telegram_api_base: String,
    pub artifacts_dir: Option<PathBuf>,
    pub scheduler_enabled: bool,
    pub sync_cron_hourly: String,
    pub sync_cron_daily: String,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub source_utc_offset_hours: i32,
    pub workspace_root: PathBuf,
}

impl SyncConfig {
    pub fn from_env() -> Self {
        let non_empty = |key: &str| std::env::var(key).ok().filter(|v| !v.trim().is_empty());
        Self {
            database_url: non_empty("DATABASE_URL"),
            scraper_url: non_empty("SCRAPER_URL"),
            scraper_format: non_empty("SCRAPER_FORMAT")
                .and_then(|v| PageFormat::parse(&v))
                .unwrap_or(PageFormat::Json),
            fixtures_dir: non_empty("FIXTURES_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./fixtures/pages")),
            telegram_bot_token: non_empty("TELEGRAM_BOT_TOKEN"),
            telegram_api_base: non_empty("TELEGRAM_API_BASE")
                .unwrap_or_else(|| DEFAULT_TELEGRAM_API_BASE.to_string()),
            artifacts_dir: non_empty("ARTIFACTS_DIR").map(PathBuf::from),
            scheduler_enabled: std::env::var("HW_SCHEDULER_ENABLED")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false),
            sync_cron_hourly: non_empty("SYNC_CRON_HOURLY").unwrap_or_else(|| "0 0 * * * *".to_string()),
            sync_cron_daily: non_empty("SYNC_CRON_DAILY").unwrap_or_else(|| "0 0 6 * * *".to_string()),
            user_agent: non_empty("HW_USER_AGENT").unwrap_or_else(|| "house-watch/0.1".to_string()),
            http_timeout_secs: non_empty("HW_HTTP_TIMEOUT_SECS")
                .and_then(|v| v.parse().ok())
                .unwrap_or(20),
            source_utc_offset_hours: non_empty("HW_SOURCE_UTC_OFFSET_HOURS")
                .and_then(|v| v.parse().ok())
                .unwrap_or(DEFAULT_SOURCE_OFFSET_HOURS),
            workspace_root: PathBuf::from("."),
        }
    }

    pub fn normalizer(&self) -> Result<Normalizer> {
        Normalizer::from_offset_hours(self.source_utc_offset_hours).with_context(|| {
            format!("invalid source utc offset {}h", self.source_utc_offset_hours)
        })
    }
}

/// Pages visited by the scheduled jobs, read from `pages.yaml`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct PageRegistry {
    pub current_page: u32,
    #[serde(default)]
    pub pages: Vec<u32>,
}

impl Default for PageRegistry {
    fn default() -> Self {
        Self {
            current_page: 1,
            pages: vec![1],
        }
    }
}

impl PageRegistry {
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
        let mut registry: PageRegistry =
            serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;
        anyhow::ensure!(registry.current_page >= 1, "current_page must be >= 1");
        let mut seen = HashSet::new();
        registry.pages.retain(|p| *p >= 1 && seen.insert(*p));
        if registry.pages.is_empty() {
            registry.pages.push(registry.current_page);
        }
        Ok(registry)
    }
}

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("fetching page failed: {0}")]
    Fetch(#[from] FetchError),
    #[error("loading subscribers failed: {0}")]
    Subscribers(#[source] StoreError),
}

/// Classifies listings against stored state, one lookup per listing.
#[derive(Clone)]
pub struct ChangeDetector {
    store: Arc<dyn ListingStore>,
}

impl ChangeDetector {
    pub fn new(store: Arc<dyn ListingStore>) -> Self {
        Self { store }
    }

    pub async fn classify(&self, listing: Listing) -> Result<ChangeRecord, StoreError> {
        let prior = self.store.find_by_identity(&listing.identity).await?;
        Ok(ChangeRecord::from_prior(listing, prior.as_ref()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum DeliveryStatus {
    Delivered,
    Failed { reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeliveryOutcome {
    pub identity: String,
    pub contact_id: String,
    pub status: DeliveryStatus,
}

impl DeliveryOutcome {
    pub fn is_delivered(&self) -> bool {
        self.status == DeliveryStatus::Delivered
    }
}

/// Best-effort fan-out of status transitions to every subscriber.
#[derive(Clone)]
pub struct NotificationDispatcher {
    transport: Arc<dyn MessageTransport>,
    offset: FixedOffset,
}

impl NotificationDispatcher {
    pub fn new(transport: Arc<dyn MessageTransport>, offset: FixedOffset) -> Self {
        Self { transport, offset }
    }

    pub fn compose_message(&self, record: &ChangeRecord) -> String {
        let listing = &record.listing;
        let local = |ts: Option<DateTime<Utc>>| {
            ts.map(|t| t.with_timezone(&self.offset).format("%Y-%m-%d %H:%M").to_string())
                .unwrap_or_else(|| "?".to_string())
        };
        let prior = record
            .prior_status
            .map(|s| s.to_string())
            .unwrap_or_else(|| "unknown".to_string());

        let mut lines = vec![format!(
            "Listing status changed: {}",
            listing.name.as_deref().unwrap_or(&listing.identity)
        )];
        if let Some(region) = &listing.region {
            lines.push(format!("Region: {region}"));
        }
        lines.push(format!("Status: {prior} -> {}", listing.status));
        lines.push(format!("Units: {}", listing.number));
        lines.push(format!(
            "Window: {} - {}",
            local(listing.starts_at),
            local(listing.ends_at)
        ));
        lines.push(format!("ID: {}", listing.identity));
        lines.join("\n")
    }

    /// Sends to every subscriber independently; a failed delivery never stops the others.
    pub async fn notify(&self, record: &ChangeRecord, subscribers: &[Subscriber]) -> Vec<DeliveryOutcome> {
        if !record.should_notify() {
            return Vec::new();
        }
        let message = self.compose_message(record);
        let identity = &record.listing.identity;

        join_all(subscribers.iter().map(|subscriber| {
            let message = &message;
            async move {
                let status = match self.transport.send(&subscriber.contact_id, message).await {
                    Ok(()) => DeliveryStatus::Delivered,
                    Err(err) => {
                        warn!(
                            identity = %identity,
                            contact_id = %subscriber.contact_id,
                            transport = self.transport.name(),
                            error = %err,
                            "notification delivery failed"
                        );
                        DeliveryStatus::Failed {
                            reason: err.to_string(),
                        }
                    }
                };
                DeliveryOutcome {
                    identity: identity.clone(),
                    contact_id: subscriber.contact_id.clone(),
                    status,
                }
            }
        }))
        .await
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SkippedRecord {
    pub index: usize,
    pub reason: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreOperation {
    Lookup,
    Upsert,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StoreFailure {
    pub identity: String,
    pub operation: StoreOperation,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct IngestionReport {
    pub run_id: Uuid,
    pub page: u32,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub fetched: usize,
    pub new: usize,
    pub unchanged: usize,
    pub status_changed: usize,
    pub skipped: usize,
    pub notifications_sent: usize,
    pub notifications_failed: usize,
    pub store_errors: usize,
    pub persisted: usize,
    pub skips: Vec<SkippedRecord>,
    pub delivery_failures: Vec<DeliveryOutcome>,
    pub store_failures: Vec<StoreFailure>,
}

pub struct IngestionPipeline {
    source: Arc<dyn ListingSource>,
    store: Arc<dyn ListingStore>,
    directory: Arc<dyn SubscriberDirectory>,
    detector: ChangeDetector,
    dispatcher: NotificationDispatcher,
    normalizer: Normalizer,
    archive: Option<PageArchive>,
}

impl IngestionPipeline {
    pub fn new(
        source: Arc<dyn ListingSource>,
        store: Arc<dyn ListingStore>,
        directory: Arc<dyn SubscriberDirectory>,
        transport: Arc<dyn MessageTransport>,
    ) -> Self {
        let normalizer = Normalizer::default();
        Self {
            source,
            detector: ChangeDetector::new(store.clone()),
            store,
            directory,
            dispatcher: NotificationDispatcher::new(transport, normalizer.offset()),
            normalizer,
            archive: None,
        }
    }

    pub fn with_normalizer(mut self, normalizer: Normalizer) -> Self {
        self.normalizer = normalizer;
        self.dispatcher.offset = normalizer.offset();
        self
    }

    pub fn with_archive(mut self, archive: Option<PageArchive>) -> Self {
        self.archive = archive;
        self
    }

    pub fn store(&self) -> Arc<dyn ListingStore> {
        self.store.clone()
    }

    pub async fn ingest(&self, page: u32) -> Result<IngestionReport, IngestError> {
        let run_id = Uuid::new_v4();
        self.run(run_id, page)
            .instrument(info_span!("ingest", %run_id, page, source = self.source.source_name()))
            .await
    }

    async fn run(&self, run_id: Uuid, page: u32) -> Result<IngestionReport, IngestError> {
        let started_at = Utc::now();
        let fetched = self.source.take(page).await?;

        if let Some(archive) = &self.archive {
            if let Err(err) = archive
                .store_page(fetched.fetched_at, page, fetched.format.extension(), &fetched.body)
                .await
            {
                warn!(error = %err, "archiving raw page failed");
            }
        }

        let mut skips = Vec::new();
        let mut listings = Vec::with_capacity(fetched.records.len());
        for (index, raw) in fetched.records.iter().enumerate() {
            match self.normalizer.normalize(raw) {
                Ok(listing) => listings.push(listing),
                Err(err) => {
                    warn!(index, error = %err, "skipping malformed record");
                    skips.push(SkippedRecord {
                        index,
                        reason: err.to_string(),
                    });
                }
            }
        }

        // Nothing has been written yet, so bailing here leaves the store untouched.
        let subscribers = self
            .directory
            .list_subscribers()
            .await
            .map_err(IngestError::Subscribers)?;

        // Every lookup completes before the first write: classification sees the pre-batch state.
        let lookups = join_all(listings.into_iter().map(|listing| {
            let identity = listing.identity.clone();
            async move { (identity, self.detector.classify(listing).await) }
        }))
        .await;

        let mut store_failures = Vec::new();
        let mut classified = Vec::with_capacity(lookups.len());
        for (identity, result) in lookups {
            match result {
                Ok(record) => classified.push(record),
                Err(err) => {
                    warn!(identity = %identity, error = %err, "listing lookup failed");
                    store_failures.push(StoreFailure {
                        identity,
                        operation: StoreOperation::Lookup,
                        reason: err.to_string(),
                    });
                }
            }
        }
        let count = |kind: ChangeKind| classified.iter().filter(|r| r.kind == kind).count();
        let (new, unchanged, status_changed) = (
            count(ChangeKind::New),
            count(ChangeKind::Unchanged),
            count(ChangeKind::StatusChanged),
        );

        let outcomes: Vec<DeliveryOutcome> = join_all(
            classified
                .iter()
                .filter(|record| record.should_notify())
                .map(|record| self.dispatcher.notify(record, &subscribers)),
        )
        .await
        .into_iter()
        .flatten()
        .collect();
        let notifications_sent = outcomes.iter().filter(|o| o.is_delivered()).count();
        let delivery_failures: Vec<_> = outcomes.into_iter().filter(|o| !o.is_delivered()).collect();

        let writes = join_all(last_occurrences(&classified).into_iter().map(|listing| async move {
            (listing.identity.clone(), self.store.upsert(listing).await)
        }))
        .await;
        let mut persisted = 0;
        for (identity, result) in writes {
            match result {
                Ok(()) => persisted += 1,
                Err(err) => {
                    warn!(identity = %identity, error = %err, "listing upsert failed");
                    store_failures.push(StoreFailure {
                        identity,
                        operation: StoreOperation::Upsert,
                        reason: err.to_string(),
                    });
                }
            }
        }

        let report = IngestionReport {
            run_id,
            page,
            started_at,
            finished_at: Utc::now(),
            fetched: fetched.records.len(),
            new,
            unchanged,
            status_changed,
            skipped: skips.len(),
            notifications_sent,
            notifications_failed: delivery_failures.len(),
            store_errors: store_failures.len(),
            persisted,
            skips,
            delivery_failures,
            store_failures,
        };
        info!(
            fetched = report.fetched,
            new = report.new,
            unchanged = report.unchanged,
            status_changed = report.status_changed,
            skipped = report.skipped,
            notifications_sent = report.notifications_sent,
            notifications_failed = report.notifications_failed,
            store_errors = report.store_errors,
            "ingestion finished"
        );
        Ok(report)
    }
}

/// One listing per identity, the last occurrence in page order winning.
fn last_occurrences(records: &[ChangeRecord]) -> Vec<&Listing> {
    let mut latest: Vec<&Listing> = Vec::new();
    let mut slots: HashMap<&str, usize> = HashMap::new();
    for record in records {
        let listing = &record.listing;
        match slots.get(listing.identity.as_str()) {
            Some(&slot) => latest[slot] = listing,
            None => {
                slots.insert(listing.identity.as_str(), latest.len());
                latest.push(listing);
            }
        }
    }
    latest
}

/// Serializes ingestion per page; different pages may run concurrently.
pub struct IngestionService {
    pipeline: IngestionPipeline,
    registry: PageRegistry,
    page_locks: Mutex<HashMap<u32, Arc<Mutex<()>>>>,
}

impl IngestionService {
    pub fn new(pipeline: IngestionPipeline, registry: PageRegistry) -> Self {
        Self {
            pipeline,
            registry,
            page_locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn registry(&self) -> &PageRegistry {
        &self.registry
    }

    async fn page_lock(&self, page: u32) -> Arc<Mutex<()>> {
        let mut locks = self.page_locks.lock().await;
        locks.entry(page).or_default().clone()
    }

    /// Drops the page's entry once no other run holds or awaits it.
    async fn release_page_lock(&self, page: u32, lock: Arc<Mutex<()>>) {
        let mut locks = self.page_locks.lock().await;
        // One handle in the map plus ours.
        if Arc::strong_count(&lock) == 2 {
            locks.remove(&page);
        }
    }

    pub async fn ingest_page(&self, page: u32) -> Result<IngestionReport, IngestError> {
        let lock = self.page_lock(page).await;
        let result = {
            let _guard = lock.lock().await;
            self.pipeline.ingest(page).await
        };
        self.release_page_lock(page, lock).await;
        result
    }

    pub async fn ingest_current(&self) -> Result<IngestionReport, IngestError> {
        self.ingest_page(self.registry.current_page).await
    }

    /// Walks every registered page; a failed page does not stop the rest.
    pub async fn ingest_registered(&self) -> Vec<(u32, Result<IngestionReport, IngestError>)> {
        let mut results = Vec::with_capacity(self.registry.pages.len());
        for &page in &self.registry.pages {
            results.push((page, self.ingest_page(page).await));
        }
        results
    }
}

/// Stores, directory and ingestion service wired from configuration.
pub struct SyncRuntime {
    pub config: SyncConfig,
    pub store: Arc<dyn ListingStore>,
    pub directory: Arc<dyn SubscriberDirectory>,
    pub service: Arc<IngestionService>,
}

impl SyncRuntime {
    pub async fn from_config(config: SyncConfig) -> Result<Self> {
        let (store, directory): (Arc<dyn ListingStore>, Arc<dyn SubscriberDirectory>) =
            match &config.database_url {
                Some(url) => {
                    let pool = connect_pool(url).await.context("connecting to database")?;
                    (
                        Arc::new(PgListingStore::new(pool.clone())),
                        Arc::new(PgSubscriberDirectory::new(pool)),
                    )
                }
                None => {
                    warn!("DATABASE_URL not set; using in-memory stores");
                    (
                        Arc::new(MemoryListingStore::new()),
                        Arc::new(MemorySubscriberDirectory::default()),
                    )
                }
            };

        let http = HttpFetcher::new(HttpClientConfig {
            timeout: Duration::from_secs(config.http_timeout_secs),
            user_agent: Some(config.user_agent.clone()),
            ..Default::default()
        })?;

        let source: Arc<dyn ListingSource> = match &config.scraper_url {
            Some(url) => Arc::new(HttpListingSource::new(http.clone(), url.clone(), config.scraper_format)?),
            None => {
                info!(dir = %config.fixtures_dir.display(), "SCRAPER_URL not set; reading fixture pages");
                Arc::new(FixtureListingSource::new(config.fixtures_dir.clone()))
            }
        };

        let transport: Arc<dyn MessageTransport> = match &config.telegram_bot_token {
            Some(token) => Arc::new(TelegramTransport::new(
                http.client().clone(),
                config.telegram_api_base.clone(),
                token.clone(),
            )),
            None => {
                warn!("TELEGRAM_BOT_TOKEN not set; notifications are logged only");
                Arc::new(LogTransport)
            }
        };

        let registry = PageRegistry::load(&config.workspace_root.join("pages.yaml"))?;
        let pipeline = IngestionPipeline::new(source, store.clone(), directory.clone(), transport)
            .with_normalizer(config.normalizer()?)
            .with_archive(config.artifacts_dir.clone().map(PageArchive::new));

        Ok(Self {
            service: Arc::new(IngestionService::new(pipeline, registry)),
            config,
            store,
            directory,
        })
    }

    pub async fn maybe_build_scheduler(&self) -> Result<Option<JobScheduler>> {
        if !self.config.scheduler_enabled {
            return Ok(None);
        }
        let sched = JobScheduler::new().await.context("creating scheduler")?;
        for job in self.scheduled_jobs()? {
            let guid = job.guid();
            sched
                .add(job)
                .await
                .with_context(|| format!("adding scheduled job {guid}"))?;
        }
        Ok(Some(sched))
    }

    /// The hourly current-page job followed by the daily all-pages job.
    pub fn scheduled_jobs(&self) -> Result<Vec<Job>> {
        let service = self.service.clone();
        let hourly = Job::new_async(self.config.sync_cron_hourly.as_str(), move |_uuid, _l| {
            let service = service.clone();
            Box::pin(async move {
                if let Err(err) = service.ingest_current().await {
                    error!(error = %err, "scheduled ingestion of current page failed");
                }
            })
        })
        .with_context(|| format!("creating hourly job for cron {}", self.config.sync_cron_hourly))?;

        let service = self.service.clone();
        let daily = Job::new_async(self.config.sync_cron_daily.as_str(), move |_uuid, _l| {
            let service = service.clone();
            Box::pin(async move {
                for (page, result) in service.ingest_registered().await {
                    if let Err(err) = result {
                        error!(page, error = %err, "scheduled ingestion failed");
                    }
                }
            })
        })
        .with_context(|| format!("creating daily job for cron {}", self.config.sync_cron_daily))?;

        Ok(vec![hourly, daily])
    }
}

/// Ingests every registered page once.
pub async fn run_sync_once_from_env() -> Result<Vec<(u32, Result<IngestionReport, IngestError>)>> {
    let runtime = SyncRuntime::from_config(SyncConfig::from_env()).await?;
    Ok(runtime.service.ingest_registered().await)
}
