//! Axum JSON API: reporting reads over persisted listings and the on-demand pull.

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Datelike, FixedOffset, NaiveDate, Utc};
use hw_core::{Listing, Normalizer};
use hw_storage::ListingStore;
use hw_sync::{IngestError, IngestionService, SyncRuntime};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tracing::{info, warn};

pub const CRATE_NAME: &str = "hw-web";

#[derive(Clone)]
pub struct AppState {
    pub listings: Arc<dyn ListingStore>,
    pub ingestion: Option<Arc<IngestionService>>,
    pub offset: FixedOffset,
}

impl AppState {
    pub fn new(listings: Arc<dyn ListingStore>) -> Self {
        Self {
            listings,
            ingestion: None,
            offset: Normalizer::default().offset(),
        }
    }

    pub fn with_ingestion(mut self, ingestion: Arc<IngestionService>) -> Self {
        self.ingestion = Some(ingestion);
        self
    }

    pub fn with_offset(mut self, offset: FixedOffset) -> Self {
        self.offset = offset;
        self
    }

    pub fn from_runtime(runtime: &SyncRuntime) -> anyhow::Result<Self> {
        Ok(Self::new(runtime.store.clone())
            .with_ingestion(runtime.service.clone())
            .with_offset(runtime.config.normalizer()?.offset()))
    }
}

#[derive(Debug, Deserialize, Default)]
struct ListingsQuery {
    active: Option<bool>,
}

#[derive(Debug, Deserialize, Default)]
struct PullRequest {
    page: Option<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Granularity {
    Month,
    Quarter,
    Year,
}

impl Granularity {
    /// `(year, index within year)`; the index is 0 for `Year`.
    fn key(&self, date: NaiveDate) -> (i32, u32) {
        match self {
            Self::Month => (date.year(), date.month()),
            Self::Quarter => (date.year(), (date.month() - 1) / 3 + 1),
            Self::Year => (date.year(), 0),
        }
    }

    fn previous(&self, (year, index): (i32, u32)) -> (i32, u32) {
        match self {
            Self::Month if index == 1 => (year - 1, 12),
            Self::Quarter if index == 1 => (year - 1, 4),
            Self::Month | Self::Quarter => (year, index - 1),
            Self::Year => (year - 1, 0),
        }
    }

    fn label(&self, (year, index): (i32, u32)) -> String {
        match self {
            Self::Month => format!("{year}-{index:02}"),
            Self::Quarter => format!("{year}-Q{index}"),
            Self::Year => year.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PeriodStats {
    pub label: String,
    pub listings: usize,
    pub units: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PeriodComparison {
    pub granularity: Granularity,
    pub current: PeriodStats,
    pub previous: PeriodStats,
    pub listings_diff: i64,
    pub units_diff: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SeriesPoint {
    pub key: String,
    pub listings: usize,
    pub units: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Metrics {
    pub total_listings: usize,
    pub total_units: i64,
    pub comparisons: Vec<PeriodComparison>,
    pub by_month: Vec<SeriesPoint>,
    pub by_region: Vec<SeriesPoint>,
}

/// Calendar comparisons are keyed on each listing's local `starts_at` date.
pub fn compute_metrics(listings: &[Listing], now: DateTime<Utc>, offset: FixedOffset) -> Metrics {
    let local_date = |ts: DateTime<Utc>| ts.with_timezone(&offset).date_naive();
    let today = local_date(now);
    let dated: Vec<(NaiveDate, &Listing)> = listings
        .iter()
        .filter_map(|l| l.starts_at.map(|ts| (local_date(ts), l)))
        .collect();

    let stats = |granularity: Granularity, key: (i32, u32)| {
        let members: Vec<_> = dated
            .iter()
            .filter(|(date, _)| granularity.key(*date) == key)
            .collect();
        PeriodStats {
            label: granularity.label(key),
            listings: members.len(),
            units: members.iter().map(|(_, l)| l.number).sum(),
        }
    };

    let comparisons = [Granularity::Month, Granularity::Quarter, Granularity::Year]
        .into_iter()
        .map(|granularity| {
            let key = granularity.key(today);
            let current = stats(granularity, key);
            let previous = stats(granularity, granularity.previous(key));
            PeriodComparison {
                granularity,
                listings_diff: current.listings as i64 - previous.listings as i64,
                units_diff: current.units - previous.units,
                current,
                previous,
            }
        })
        .collect();

    let mut by_month: BTreeMap<String, SeriesPoint> = BTreeMap::new();
    for (date, listing) in &dated {
        let key = Granularity::Month.label(Granularity::Month.key(*date));
        add_to_series(&mut by_month, key, listing);
    }
    let mut by_region: BTreeMap<String, SeriesPoint> = BTreeMap::new();
    for listing in listings {
        let key = listing.region.clone().unwrap_or_else(|| "unknown".to_string());
        add_to_series(&mut by_region, key, listing);
    }

    Metrics {
        total_listings: listings.len(),
        total_units: listings.iter().map(|l| l.number).sum(),
        comparisons,
        by_month: by_month.into_values().collect(),
        by_region: by_region.into_values().collect(),
    }
}

fn add_to_series(series: &mut BTreeMap<String, SeriesPoint>, key: String, listing: &Listing) {
    let point = series.entry(key.clone()).or_insert(SeriesPoint {
        key,
        listings: 0,
        units: 0,
    });
    point.listings += 1;
    point.units += listing.number;
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz_handler))
        .route("/api/listings", get(listings_handler))
        .route("/api/metrics", get(metrics_handler))
        .route("/api/pull", post(pull_handler))
        .with_state(Arc::new(state))
}

pub async fn serve(state: AppState, port: u16) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "serving reporting api");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

pub fn port_from_env() -> u16 {
    std::env::var("HW_WEB_PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(8000)
}

async fn healthz_handler() -> &'static str {
    "ok"
}

async fn listings_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ListingsQuery>,
) -> Response {
    let result = if query.active.unwrap_or(false) {
        state.listings.list_active(Utc::now()).await
    } else {
        state.listings.list_all().await
    };
    match result {
        Ok(listings) => Json(listings).into_response(),
        Err(err) => error_response(StatusCode::INTERNAL_SERVER_ERROR, err),
    }
}

async fn metrics_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.listings.list_all().await {
        Ok(listings) => Json(compute_metrics(&listings, Utc::now(), state.offset)).into_response(),
        Err(err) => error_response(StatusCode::INTERNAL_SERVER_ERROR, err),
    }
}

async fn pull_handler(State(state): State<Arc<AppState>>, body: Bytes) -> Response {
    let Some(service) = &state.ingestion else {
        return error_response(StatusCode::SERVICE_UNAVAILABLE, "ingestion is not configured");
    };
    let request: PullRequest = if body.iter().all(u8::is_ascii_whitespace) {
        PullRequest::default()
    } else {
        match serde_json::from_slice(&body) {
            Ok(request) => request,
            Err(err) => return error_response(StatusCode::BAD_REQUEST, err),
        }
    };
    let page = request.page.unwrap_or(service.registry().current_page);

    match service.ingest_page(page).await {
        Ok(report) => Json(report).into_response(),
        Err(err @ IngestError::Fetch(_)) => {
            warn!(page, error = %err, "on-demand pull failed");
            error_response(StatusCode::BAD_GATEWAY, err)
        }
        Err(err) => error_response(StatusCode::INTERNAL_SERVER_ERROR, err),
    }
}

fn error_response(status: StatusCode, err: impl std::fmt::Display) -> Response {
    (status, Json(serde_json::json!({ "error": err.to_string() }))).into_response()
}
