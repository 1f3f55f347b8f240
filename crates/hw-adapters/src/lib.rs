//! Scraper and messaging collaborators: where raw listing pages come from and
//! how notifications leave the system.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{bail, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hw_core::RawListing;
use hw_storage::{HttpFetchError, HttpFetcher};
use scraper::{Html, Selector};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value as JsonValue};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::info;
use uuid::Uuid;

pub const CRATE_NAME: &str = "hw-adapters";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PageFormat {
    Json,
    Html,
}

impl PageFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            Self::Json => "json",
            Self::Html => "html",
        }
    }

    pub fn parse(input: &str) -> Option<Self> {
        match input.trim().to_ascii_lowercase().as_str() {
            "json" => Some(Self::Json),
            "html" => Some(Self::Html),
            _ => None,
        }
    }
}

/// One page as handed over by a source: the raw body plus its untyped records.
#[derive(Debug, Clone)]
pub struct FetchedPage {
    pub page: u32,
    pub fetched_at: DateTime<Utc>,
    pub format: PageFormat,
    pub body: Vec<u8>,
    pub records: Vec<RawListing>,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error(transparent)]
    Http(#[from] HttpFetchError),
    #[error("page {page} could not be decoded: {reason}")]
    Decode { page: u32, reason: String },
    #[error("reading fixture {path}: {source}")]
    Fixture {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("page {0} is not available from this source")]
    PageUnavailable(u32),
}

/// Paginated source of raw listing records.
#[async_trait]
pub trait ListingSource: Send + Sync {
    fn source_name(&self) -> &'static str;

    async fn take(&self, page: u32) -> Result<FetchedPage, FetchError>;
}

/// Top-level array, or an object wrapping the array under `data`, `list` or `items`.
///
/// Non-object entries become empty records so the normalizer rejects them
/// individually instead of failing the page.
pub fn parse_json_page(page: u32, body: &[u8]) -> Result<Vec<RawListing>, FetchError> {
    let value: JsonValue = serde_json::from_slice(body).map_err(|err| FetchError::Decode {
        page,
        reason: err.to_string(),
    })?;
    let items = match value {
        JsonValue::Array(items) => items,
        JsonValue::Object(mut map) => ["data", "list", "items"]
            .iter()
            .find_map(|key| match map.remove(*key) {
                Some(JsonValue::Array(items)) => Some(items),
                _ => None,
            })
            .ok_or_else(|| FetchError::Decode {
                page,
                reason: "no record array under data/list/items".to_string(),
            })?,
        _ => {
            return Err(FetchError::Decode {
                page,
                reason: "expected an array of records".to_string(),
            })
        }
    };
    Ok(items
        .into_iter()
        .map(|item| match item {
            JsonValue::Object(map) => map,
            _ => RawListing::new(),
        })
        .collect())
}

/// Column layout of the registry's project table.
pub const HTML_TABLE_COLUMNS: [&str; 7] = [
    "region",
    "name",
    "certificate",
    "number",
    "starts_at",
    "ends_at",
    "status",
];

/// Identity assigned at scrape time; stable for the same table row across cycles.
pub fn derive_identity(region: &str, name: &str, certificate: &str) -> String {
    let key = format!("{}|{}|{}", region.trim(), name.trim(), certificate.trim());
    Uuid::new_v5(&Uuid::NAMESPACE_URL, key.as_bytes()).to_string()
}

pub fn parse_html_page(page: u32, body: &[u8]) -> Result<Vec<RawListing>, FetchError> {
    let text = std::str::from_utf8(body).map_err(|err| FetchError::Decode {
        page,
        reason: err.to_string(),
    })?;
    let document = Html::parse_document(text);
    let row_selector = selector(page, "table tr")?;
    let cell_selector = selector(page, "td")?;

    let mut records = Vec::new();
    for row in document.select(&row_selector) {
        let cells: Vec<String> = row
            .select(&cell_selector)
            .map(|cell| cell.text().collect::<Vec<_>>().join(" ").trim().to_string())
            .collect();
        if cells.len() < HTML_TABLE_COLUMNS.len() {
            continue;
        }

        let mut record = RawListing::new();
        for (column, value) in HTML_TABLE_COLUMNS.iter().zip(&cells) {
            if !value.is_empty() {
                record.insert((*column).to_string(), json!(value));
            }
        }
        let (region, name, certificate) = (&cells[0], &cells[1], &cells[2]);
        if !name.is_empty() {
            record.insert(
                "uuid".to_string(),
                json!(derive_identity(region, name, certificate)),
            );
        }
        records.push(record);
    }
    Ok(records)
}

fn selector(page: u32, css: &str) -> Result<Selector, FetchError> {
    Selector::parse(css).map_err(|err| FetchError::Decode {
        page,
        reason: format!("invalid selector {css}: {err}"),
    })
}

pub fn parse_page(format: PageFormat, page: u32, body: &[u8]) -> Result<Vec<RawListing>, FetchError> {
    match format {
        PageFormat::Json => parse_json_page(page, body),
        PageFormat::Html => parse_html_page(page, body),
    }
}

/// Live source reading `url_template` with `{page}` substituted.
#[derive(Debug, Clone)]
pub struct HttpListingSource {
    http: HttpFetcher,
    url_template: String,
    format: PageFormat,
}

impl HttpListingSource {
    pub fn new(http: HttpFetcher, url_template: impl Into<String>, format: PageFormat) -> Result<Self> {
        let url_template = url_template.into();
        if !url_template.contains("{page}") {
            bail!("scraper url template `{url_template}` has no {{page}} placeholder");
        }
        Ok(Self {
            http,
            url_template,
            format,
        })
    }

    pub fn page_url(&self, page: u32) -> String {
        self.url_template.replace("{page}", &page.to_string())
    }
}

#[async_trait]
impl ListingSource for HttpListingSource {
    fn source_name(&self) -> &'static str {
        "http"
    }

    async fn take(&self, page: u32) -> Result<FetchedPage, FetchError> {
        let url = self.page_url(page);
        let response = self.http.fetch_bytes(&url).await?;
        let records = parse_page(self.format, page, &response.body)?;
        info!(page, url = %response.final_url, records = records.len(), "fetched listing page");
        Ok(FetchedPage {
            page,
            fetched_at: Utc::now(),
            format: self.format,
            body: response.body,
            records,
        })
    }
}

/// Offline source reading `page-<n>.json` or `page-<n>.html` from a directory.
#[derive(Debug, Clone)]
pub struct FixtureListingSource {
    dir: PathBuf,
}

impl FixtureListingSource {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn candidate_paths(&self, page: u32) -> [(PageFormat, PathBuf); 2] {
        [PageFormat::Json, PageFormat::Html]
            .map(|format| (format, self.dir.join(format!("page-{page}.{}", format.extension()))))
    }
}

#[async_trait]
impl ListingSource for FixtureListingSource {
    fn source_name(&self) -> &'static str {
        "fixture"
    }

    async fn take(&self, page: u32) -> Result<FetchedPage, FetchError> {
        for (format, path) in self.candidate_paths(page) {
            match tokio::fs::read(&path).await {
                Ok(body) => {
                    let records = parse_page(format, page, &body)?;
                    return Ok(FetchedPage {
                        page,
                        fetched_at: Utc::now(),
                        format,
                        body,
                        records,
                    });
                }
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => continue,
                Err(source) => return Err(FetchError::Fixture { path, source }),
            }
        }
        Err(FetchError::PageUnavailable(page))
    }
}

/// Source backed by pages held in memory; pages never set are unavailable.
#[derive(Debug, Default)]
pub struct InMemoryListingSource {
    pages: RwLock<HashMap<u32, Vec<RawListing>>>,
}

impl InMemoryListingSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn set_page(&self, page: u32, records: Vec<RawListing>) {
        self.pages.write().await.insert(page, records);
    }

    pub async fn remove_page(&self, page: u32) {
        self.pages.write().await.remove(&page);
    }
}

#[async_trait]
impl ListingSource for InMemoryListingSource {
    fn source_name(&self) -> &'static str {
        "memory"
    }

    async fn take(&self, page: u32) -> Result<FetchedPage, FetchError> {
        let records = self
            .pages
            .read()
            .await
            .get(&page)
            .cloned()
            .ok_or(FetchError::PageUnavailable(page))?;
        let body = serde_json::to_vec(&records).map_err(|err| FetchError::Decode {
            page,
            reason: err.to_string(),
        })?;
        Ok(FetchedPage {
            page,
            fetched_at: Utc::now(),
            format: PageFormat::Json,
            body,
            records,
        })
    }
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("transport request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("transport rejected message ({status}): {description}")]
    Rejected { status: u16, description: String },
}

/// Delivers one message to one recipient.
#[async_trait]
pub trait MessageTransport: Send + Sync {
    fn name(&self) -> &'static str;

    async fn send(&self, contact_id: &str, message: &str) -> Result<(), TransportError>;
}

pub const DEFAULT_TELEGRAM_API_BASE: &str = "https://api.telegram.org";

#[derive(Debug, Deserialize)]
struct TelegramResponse {
    ok: bool,
    #[serde(default)]
    description: Option<String>,
}

/// Telegram Bot API `sendMessage`; the contact id is the chat id.
#[derive(Debug, Clone)]
pub struct TelegramTransport {
    client: reqwest::Client,
    api_base: String,
    token: String,
}

impl TelegramTransport {
    pub fn new(client: reqwest::Client, api_base: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            client,
            api_base: api_base.into().trim_end_matches('/').to_string(),
            token: token.into(),
        }
    }

    pub fn endpoint(&self) -> String {
        format!("{}/bot{}/sendMessage", self.api_base, self.token)
    }
}

#[async_trait]
impl MessageTransport for TelegramTransport {
    fn name(&self) -> &'static str {
        "telegram"
    }

    async fn send(&self, contact_id: &str, message: &str) -> Result<(), TransportError> {
        let response = self
            .client
            .post(self.endpoint())
            .json(&json!({
                "chat_id": contact_id,
                "text": message,
                "disable_web_page_preview": true,
            }))
            .send()
            .await?;
        let status = response.status();
        let text = response.text().await?;
        let body = serde_json::from_str::<TelegramResponse>(&text).ok();
        if status.is_success() && body.as_ref().is_some_and(|b| b.ok) {
            return Ok(());
        }
        let description = body
            .and_then(|b| b.description)
            .or_else(|| Some(text.trim().to_string()).filter(|t| !t.is_empty()))
            .unwrap_or_else(|| "no description".to_string());
        Err(TransportError::Rejected {
            status: status.as_u16(),
            description,
        })
    }
}

/// Dry-run transport used when no bot token is configured.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogTransport;

#[async_trait]
impl MessageTransport for LogTransport {
    fn name(&self) -> &'static str {
        "log"
    }

    async fn send(&self, contact_id: &str, message: &str) -> Result<(), TransportError> {
        info!(contact_id, message, "notification (dry run)");
        Ok(())
    }
}
