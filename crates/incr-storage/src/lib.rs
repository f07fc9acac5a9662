//! Collection store contract plus Scrapy Cloud, directory and in-memory backends.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use incr_core::{BatchEntry, StoredEntry};
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use reqwest::{StatusCode, Url};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{info_span, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "incr-storage";

pub const DEFAULT_COLLECTIONS_URL: &str = "https://storage.scrapinghub.com";
pub const DEFAULT_READ_PAGE_SIZE: usize = 1000;

const JSON_LINES: &str = "application/x-jsonlines";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("collection {collection} not found")]
    NotFound { collection: String },
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("decoding {collection} line {line}: {source}")]
    Decode {
        collection: String,
        line: usize,
        #[source]
        source: serde_json::Error,
    },
    #[error("encoding entries for {collection}: {source}")]
    Encode {
        collection: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },
    #[error("collection store already closed")]
    Closed,
}

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

/// Remote key-value collections keyed by name. Reads and writes may block on
/// I/O; implementations own any retry policy.
#[async_trait]
pub trait CollectionStore: Send + Sync {
    /// Every entry of `collection`, or [`StoreError::NotFound`] if it was never written.
    async fn read_all(&self, collection: &str) -> Result<Vec<StoredEntry>, StoreError>;

    /// Writes one batch. Creates the collection on first use.
    async fn write(&self, collection: &str, entries: &[BatchEntry]) -> Result<(), StoreError>;

    /// Releases held connections.
    async fn close(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

/// Collections API answers overload with 429/5xx and slow writes with 408.
pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error()
        || status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
    {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[derive(Clone)]
pub struct ScrapyCloudConfig {
    pub api_key: String,
    pub project_id: String,
    pub base_url: String,
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub backoff: BackoffPolicy,
    pub page_size: usize,
}

impl ScrapyCloudConfig {
    pub fn new(api_key: impl Into<String>, project_id: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            project_id: project_id.into(),
            base_url: DEFAULT_COLLECTIONS_URL.to_string(),
            timeout: Duration::from_secs(60),
            user_agent: None,
            backoff: BackoffPolicy::default(),
            page_size: DEFAULT_READ_PAGE_SIZE,
        }
    }
}

impl fmt::Debug for ScrapyCloudConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScrapyCloudConfig")
            .field("api_key", &"<redacted>")
            .field("project_id", &self.project_id)
            .field("base_url", &self.base_url)
            .field("timeout", &self.timeout)
            .field("user_agent", &self.user_agent)
            .field("backoff", &self.backoff)
            .field("page_size", &self.page_size)
            .finish()
    }
}

/// Scrapy Cloud Collections API client (`/collections/{project}/s/{name}`).
pub struct ScrapyCloudCollections {
    client: reqwest::Client,
    base_url: Url,
    api_key: String,
    project_id: String,
    backoff: BackoffPolicy,
    page_size: usize,
    closed: AtomicBool,
}

impl fmt::Debug for ScrapyCloudCollections {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScrapyCloudCollections")
            .field("base_url", &self.base_url.as_str())
            .field("project_id", &self.project_id)
            .field("page_size", &self.page_size)
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl ScrapyCloudCollections {
    pub fn new(config: ScrapyCloudConfig) -> anyhow::Result<Self> {
        let base_url = Url::parse(&config.base_url)
            .with_context(|| format!("parsing collections url {}", config.base_url))?;
        anyhow::ensure!(
            !base_url.cannot_be_a_base(),
            "collections url {} cannot carry a path",
            config.base_url
        );

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
            base_url,
            api_key: config.api_key,
            project_id: config.project_id,
            backoff: config.backoff,
            page_size: config.page_size.max(1),
            closed: AtomicBool::new(false),
        })
    }

    pub fn collection_url(&self, collection: &str) -> Url {
        let mut url = self.base_url.clone();
        if let Ok(mut segments) = url.path_segments_mut() {
            segments
                .pop_if_empty()
                .extend(["collections", self.project_id.as_str(), "s", collection]);
        }
        url
    }

    fn ensure_open(&self) -> Result<(), StoreError> {
        if self.closed.load(Ordering::Acquire) {
            Err(StoreError::Closed)
        } else {
            Ok(())
        }
    }

    async fn send_with_retry<F>(&self, build: F) -> Result<reqwest::Response, StoreError>
    where
        F: Fn() -> reqwest::RequestBuilder,
    {
        let mut attempt = 0;
        loop {
            match build().send().await {
                Ok(resp) => {
                    let status = resp.status();
                    if status.is_success() {
                        return Ok(resp);
                    }
                    if classify_status(status) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        tracing::debug!(status = status.as_u16(), attempt, "retrying collections request");
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }
                    return Err(StoreError::HttpStatus {
                        status: status.as_u16(),
                        url: resp.url().to_string(),
                    });
                }
                Err(err) => {
                    if classify_reqwest_error(&err) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        tracing::debug!(error = %err, attempt, "retrying collections request");
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }
                    return Err(StoreError::Request(err));
                }
            }
        }
    }

    async fn read_page(
        &self,
        collection: &str,
        start_after: Option<&str>,
    ) -> Result<Vec<StoredEntry>, StoreError> {
        let url = self.collection_url(collection);
        let mut query = vec![("meta", "_key".to_string()), ("count", self.page_size.to_string())];
        if let Some(key) = start_after {
            query.push(("startafter", key.to_string()));
        }

        let resp = self
            .send_with_retry(|| {
                self.client
                    .get(url.clone())
                    .basic_auth(&self.api_key, Some(""))
                    .header(ACCEPT, JSON_LINES)
                    .query(&query)
            })
            .await
            .map_err(|err| match err {
                StoreError::HttpStatus { status: 404, .. } => StoreError::NotFound {
                    collection: collection.to_string(),
                },
                other => other,
            })?;

        let body = resp.text().await?;
        parse_json_lines(collection, &body)
    }
}

#[async_trait]
impl CollectionStore for ScrapyCloudCollections {
    async fn read_all(&self, collection: &str) -> Result<Vec<StoredEntry>, StoreError> {
        self.ensure_open()?;
        let span = info_span!("collections_read", collection, project = %self.project_id);
        async {
            let mut entries = Vec::new();
            let mut start_after: Option<String> = None;
            loop {
                let page = self.read_page(collection, start_after.as_deref()).await?;
                start_after = next_page_cursor(&page, self.page_size);
                entries.extend(page);
                if start_after.is_none() {
                    break;
                }
            }
            Ok::<_, StoreError>(entries)
        }
        .instrument(span)
        .await
    }

    async fn write(&self, collection: &str, entries: &[BatchEntry]) -> Result<(), StoreError> {
        self.ensure_open()?;
        if entries.is_empty() {
            return Ok(());
        }
        let body = encode_json_lines(collection, entries)?;
        let url = self.collection_url(collection);
        let span = info_span!("collections_write", collection, entries = entries.len());

        self.send_with_retry(|| {
            self.client
                .post(url.clone())
                .basic_auth(&self.api_key, Some(""))
                .header(CONTENT_TYPE, JSON_LINES)
                .body(body.clone())
        })
        .instrument(span)
        .await?;
        Ok(())
    }

    async fn close(&self) -> Result<(), StoreError> {
        self.closed.store(true, Ordering::Release);
        Ok(())
    }
}

/// Cursor for the next page: a full page ending in a keyed entry means more may follow.
pub fn next_page_cursor(page: &[StoredEntry], page_size: usize) -> Option<String> {
    if page.len() < page_size {
        return None;
    }
    page.last().and_then(|entry| entry.key.clone())
}

pub fn parse_json_lines(collection: &str, body: &str) -> Result<Vec<StoredEntry>, StoreError> {
    body.lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(idx, line)| {
            serde_json::from_str(line).map_err(|source| StoreError::Decode {
                collection: collection.to_string(),
                line: idx + 1,
                source,
            })
        })
        .collect()
}

fn encode_json_lines<T: serde::Serialize>(
    collection: &str,
    entries: &[T],
) -> Result<String, StoreError> {
    let mut out = String::new();
    for entry in entries {
        let line = serde_json::to_string(entry).map_err(|source| StoreError::Encode {
            collection: collection.to_string(),
            source,
        })?;
        out.push_str(&line);
        out.push('\n');
    }
    Ok(out)
}

/// Local stand-in for Scrapy Cloud: one JSON-lines file per collection.
#[derive(Debug)]
pub struct DirectoryCollectionStore {
    root: PathBuf,
    write_lock: Mutex<()>,
}

impl DirectoryCollectionStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn collection_path(&self, collection: &str) -> PathBuf {
        self.root.join(format!("{collection}.jl"))
    }

    async fn read_existing(&self, collection: &str) -> Result<Vec<StoredEntry>, StoreError> {
        let path = self.collection_path(collection);
        match fs::read_to_string(&path).await {
            Ok(text) => parse_json_lines(collection, &text),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Err(StoreError::NotFound {
                collection: collection.to_string(),
            }),
            Err(source) => Err(StoreError::Io {
                context: format!("reading {}", path.display()),
                source,
            }),
        }
    }

    /// Replaces the collection file via temp-file + rename. The temp file never
    /// outlives a failed replace.
    async fn replace_file(&self, path: &Path, contents: &str) -> Result<(), StoreError> {
        fs::create_dir_all(&self.root)
            .await
            .map_err(|source| StoreError::Io {
                context: format!("creating store directory {}", self.root.display()),
                source,
            })?;

        let temp_path = self.root.join(format!(".{}.tmp", Uuid::new_v4()));
        let result = Self::write_then_rename(&temp_path, path, contents).await;
        if result.is_err() {
            let _ = fs::remove_file(&temp_path).await;
        }
        result
    }

    async fn write_then_rename(
        temp_path: &Path,
        path: &Path,
        contents: &str,
    ) -> Result<(), StoreError> {
        let io_err =
            |context: String| move |source: std::io::Error| StoreError::Io { context, source };

        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(temp_path)
            .await
            .map_err(io_err(format!("opening temp collection file {}", temp_path.display())))?;
        file.write_all(contents.as_bytes())
            .await
            .map_err(io_err(format!("writing temp collection file {}", temp_path.display())))?;
        file.flush()
            .await
            .map_err(io_err(format!("flushing temp collection file {}", temp_path.display())))?;
        drop(file);

        fs::rename(temp_path, path).await.map_err(io_err(format!(
            "atomically renaming {} -> {}",
            temp_path.display(),
            path.display()
        )))
    }
}

#[async_trait]
impl CollectionStore for DirectoryCollectionStore {
    async fn read_all(&self, collection: &str) -> Result<Vec<StoredEntry>, StoreError> {
        self.read_existing(collection).await
    }

    async fn write(&self, collection: &str, entries: &[BatchEntry]) -> Result<(), StoreError> {
        if entries.is_empty() {
            return Ok(());
        }
        let _guard = self.write_lock.lock().await;

        let existing = match self.read_existing(collection).await {
            Ok(existing) => existing,
            Err(StoreError::NotFound { .. }) => Vec::new(),
            Err(err) => return Err(err),
        };
        let merged = merge_by_key(existing, entries);
        let contents = encode_json_lines(collection, &merged)?;
        self.replace_file(&self.collection_path(collection), &contents)
            .await
    }
}

/// Applies a batch over existing entries; a repeated `_key` overwrites its slot.
fn merge_by_key(existing: Vec<StoredEntry>, entries: &[BatchEntry]) -> Vec<StoredEntry> {
    let mut merged = existing;
    let mut slots: HashMap<String, usize> = merged
        .iter()
        .enumerate()
        .filter_map(|(idx, e)| e.key.clone().map(|k| (k, idx)))
        .collect();

    for entry in entries {
        let stored = StoredEntry::from(entry.clone());
        match slots.get(&entry.key) {
            Some(&idx) => merged[idx] = stored,
            None => {
                slots.insert(entry.key.clone(), merged.len());
                merged.push(stored);
            }
        }
    }
    merged
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreCall {
    ReadAll { collection: String },
    Write { collection: String, entries: usize },
    Close,
}

/// In-process store that records every call. Used for dry runs and tests.
#[derive(Debug, Default)]
pub struct InMemoryCollectionStore {
    collections: Mutex<HashMap<String, BTreeMap<String, StoredEntry>>>,
    calls: Mutex<Vec<StoreCall>>,
    fail_reads: bool,
    fail_writes_after: Option<usize>,
}

impl InMemoryCollectionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seeds `collection` with identifiers under fresh synthetic keys.
    pub fn with_collection<I, S>(mut self, collection: &str, item_ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let slot = self
            .collections
            .get_mut()
            .entry(collection.to_string())
            .or_default();
        for item_id in item_ids {
            let item_id: String = item_id.into();
            let entry = BatchEntry::fresh(item_id.into());
            slot.insert(entry.key.clone(), entry.into());
        }
        self
    }

    /// Every read fails with a 503, as if retries were exhausted.
    pub fn with_read_failure(mut self) -> Self {
        self.fail_reads = true;
        self
    }

    /// Writes succeed `n` times, then fail with a 503.
    pub fn with_write_failure_after(mut self, n: usize) -> Self {
        self.fail_writes_after = Some(n);
        self
    }

    pub async fn calls(&self) -> Vec<StoreCall> {
        self.calls.lock().await.clone()
    }

    /// Entry counts of each write call, in order.
    pub async fn write_sizes(&self) -> Vec<usize> {
        self.calls
            .lock()
            .await
            .iter()
            .filter_map(|call| match call {
                StoreCall::Write { entries, .. } => Some(*entries),
                _ => None,
            })
            .collect()
    }

    pub async fn entries(&self, collection: &str) -> Vec<StoredEntry> {
        self.collections
            .lock()
            .await
            .get(collection)
            .map(|slot| slot.values().cloned().collect())
            .unwrap_or_default()
    }

    fn injected_failure(collection: &str) -> StoreError {
        StoreError::HttpStatus {
            status: 503,
            url: format!("memory://{collection}"),
        }
    }
}

#[async_trait]
impl CollectionStore for InMemoryCollectionStore {
    async fn read_all(&self, collection: &str) -> Result<Vec<StoredEntry>, StoreError> {
        self.calls.lock().await.push(StoreCall::ReadAll {
            collection: collection.to_string(),
        });
        if self.fail_reads {
            return Err(Self::injected_failure(collection));
        }
        self.collections
            .lock()
            .await
            .get(collection)
            .map(|slot| slot.values().cloned().collect())
            .ok_or_else(|| StoreError::NotFound {
                collection: collection.to_string(),
            })
    }

    async fn write(&self, collection: &str, entries: &[BatchEntry]) -> Result<(), StoreError> {
        let mut calls = self.calls.lock().await;
        let prior_writes = calls
            .iter()
            .filter(|call| matches!(call, StoreCall::Write { .. }))
            .count();
        calls.push(StoreCall::Write {
            collection: collection.to_string(),
            entries: entries.len(),
        });
        drop(calls);

        if self.fail_writes_after.is_some_and(|n| prior_writes >= n) {
            return Err(Self::injected_failure(collection));
        }

        let mut collections = self.collections.lock().await;
        let slot = collections.entry(collection.to_string()).or_default();
        for entry in entries {
            slot.insert(entry.key.clone(), entry.clone().into());
        }
        Ok(())
    }

    async fn close(&self) -> Result<(), StoreError> {
        self.calls.lock().await.push(StoreCall::Close);
        Ok(())
    }
}
