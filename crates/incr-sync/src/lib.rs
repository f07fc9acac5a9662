//! Incremental run engine: loads a job's seen-before collection, filters items
//! against it, and persists newly seen identifiers in batches at run end.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, Utc};
use incr_core::{
    collection_name, extract_identifier, BatchEntry, Identifier, IdentifierSet, IncrementalJob,
    RunMode, DEFAULT_BATCH_SIZE, DEFAULT_ITEM_UNIQUE_FIELD,
};
use incr_storage::{
    CollectionStore, DirectoryCollectionStore, ScrapyCloudCollections, ScrapyCloudConfig,
    StoreError,
};
use serde::Serialize;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "incr-sync";

pub const DEFAULT_HTTP_TIMEOUT_SECS: u64 = 60;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("the setting 'SCRAPYCLOUD_API_KEY' is necessary for incremental runs")]
    MissingCredentials,
    #[error("the setting 'SCRAPYCLOUD_PROJECT_ID' is necessary for incremental runs (SHUB_JOBKEY did not name a project)")]
    MissingProjectId,
    #[error("a job name is required to derive the seen-before collection")]
    MissingJobName,
    #[error("invalid INCREMENTAL_PIPELINE_BATCH_SIZE {0:?}: expected a positive integer")]
    InvalidBatchSize(String),
    #[error("invalid INCREMENTAL_HTTP_TIMEOUT_SECS {0:?}: expected a positive number of seconds")]
    InvalidHttpTimeout(String),
}

#[derive(Debug, Error)]
pub enum RunError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("loading seen-before collection {collection}: {source}")]
    Load {
        collection: String,
        #[source]
        source: StoreError,
    },
    #[error("flushing seen-before collection {collection}: {source}")]
    Flush {
        collection: String,
        #[source]
        source: StoreError,
    },
    #[error("run is {actual:?}, expected {expected:?}")]
    InvalidState { expected: RunState, actual: RunState },
}

/// Where the seen-before collections live.
#[derive(Debug, Clone)]
pub enum StoreBackend {
    Directory(PathBuf),
    ScrapyCloud(ScrapyCloudConfig),
}

#[derive(Clone)]
pub struct IncrementalConfig {
    pub api_key: Option<String>,
    pub project_id: Option<String>,
    pub collections_url: Option<String>,
    pub store_dir: Option<PathBuf>,
    pub unique_field: String,
    pub batch_size: usize,
    pub full_crawl: bool,
    pub http_timeout_secs: u64,
}

impl std::fmt::Debug for IncrementalConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IncrementalConfig")
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .field("project_id", &self.project_id)
            .field("collections_url", &self.collections_url)
            .field("store_dir", &self.store_dir)
            .field("unique_field", &self.unique_field)
            .field("batch_size", &self.batch_size)
            .field("full_crawl", &self.full_crawl)
            .field("http_timeout_secs", &self.http_timeout_secs)
            .finish()
    }
}

impl Default for IncrementalConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            project_id: None,
            collections_url: None,
            store_dir: None,
            unique_field: DEFAULT_ITEM_UNIQUE_FIELD.to_string(),
            batch_size: DEFAULT_BATCH_SIZE,
            full_crawl: false,
            http_timeout_secs: DEFAULT_HTTP_TIMEOUT_SECS,
        }
    }
}

impl IncrementalConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the config from a key lookup. Empty values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let project_id = get("SCRAPYCLOUD_PROJECT_ID").or_else(|| {
            get("SHUB_JOBKEY").and_then(|jobkey| {
                jobkey
                    .split('/')
                    .next()
                    .filter(|p| !p.is_empty())
                    .map(str::to_string)
            })
        });

        let batch_size = match get("INCREMENTAL_PIPELINE_BATCH_SIZE") {
            Some(raw) => parse_batch_size(&raw)?,
            None => DEFAULT_BATCH_SIZE,
        };
        let http_timeout_secs = match get("INCREMENTAL_HTTP_TIMEOUT_SECS") {
            Some(raw) => parse_timeout_secs(&raw)?,
            None => DEFAULT_HTTP_TIMEOUT_SECS,
        };

        Ok(Self {
            api_key: get("SCRAPYCLOUD_API_KEY"),
            project_id,
            collections_url: get("SCRAPYCLOUD_COLLECTIONS_URL"),
            store_dir: get("INCREMENTAL_STORE_DIR").map(PathBuf::from),
            unique_field: get("INCREMENTAL_PIPELINE_ITEM_UNIQUE_FIELD")
                .unwrap_or_else(|| DEFAULT_ITEM_UNIQUE_FIELD.to_string()),
            batch_size,
            full_crawl: get("INCREMENTAL_FULL_CRAWL")
                .map(|v| parse_flag(&v))
                .unwrap_or(false),
            http_timeout_secs,
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.batch_size == 0 {
            return Err(ConfigError::InvalidBatchSize("0".to_string()));
        }
        if self.http_timeout_secs == 0 {
            return Err(ConfigError::InvalidHttpTimeout("0".to_string()));
        }
        self.store_backend().map(|_| ())
    }

    /// A local store directory wins over Scrapy Cloud and needs no credentials.
    pub fn store_backend(&self) -> Result<StoreBackend, ConfigError> {
        if let Some(dir) = &self.store_dir {
            return Ok(StoreBackend::Directory(dir.clone()));
        }
        let api_key = self.api_key.clone().ok_or(ConfigError::MissingCredentials)?;
        let project_id = self.project_id.clone().ok_or(ConfigError::MissingProjectId)?;

        let mut cloud = ScrapyCloudConfig::new(api_key, project_id);
        if let Some(url) = &self.collections_url {
            cloud.base_url = url.clone();
        }
        cloud.timeout = Duration::from_secs(self.http_timeout_secs);
        cloud.user_agent = Some(format!("incr/{}", env!("CARGO_PKG_VERSION")));
        Ok(StoreBackend::ScrapyCloud(cloud))
    }

    pub fn open_store(&self) -> anyhow::Result<Arc<dyn CollectionStore>> {
        let store: Arc<dyn CollectionStore> = match self.store_backend()? {
            StoreBackend::Directory(dir) => Arc::new(DirectoryCollectionStore::new(dir)),
            StoreBackend::ScrapyCloud(cloud) => Arc::new(
                ScrapyCloudCollections::new(cloud).context("building collections client")?,
            ),
        };
        Ok(store)
    }

    pub fn log_redacted(&self) {
        info!(
            api_key = if self.api_key.is_some() { "set" } else { "unset" },
            project_id = self.project_id.as_deref().unwrap_or("-"),
            store_dir = %self
                .store_dir
                .as_ref()
                .map(|d| d.display().to_string())
                .unwrap_or_else(|| "-".to_string()),
            unique_field = %self.unique_field,
            batch_size = self.batch_size,
            full_crawl = self.full_crawl,
            "incremental config resolved"
        );
    }
}

fn parse_batch_size(raw: &str) -> Result<usize, ConfigError> {
    match raw.trim().parse::<usize>() {
        Ok(n) if n > 0 => Ok(n),
        _ => Err(ConfigError::InvalidBatchSize(raw.to_string())),
    }
}

fn parse_timeout_secs(raw: &str) -> Result<u64, ConfigError> {
    match raw.trim().parse::<u64>() {
        Ok(n) if n > 0 => Ok(n),
        _ => Err(ConfigError::InvalidHttpTimeout(raw.to_string())),
    }
}

fn parse_flag(raw: &str) -> bool {
    matches!(raw.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on")
}

/// Per-run dedup state shared by the request filter and the item stage.
#[derive(Debug, Default)]
pub struct DedupState {
    prior_seen: IdentifierSet,
    newly_seen: IdentifierSet,
    mode: RunMode,
}

impl DedupState {
    pub fn new(mode: RunMode) -> Self {
        Self {
            mode,
            ..Self::default()
        }
    }

    /// Full-crawl runs never carry prior identifiers.
    pub fn with_prior_seen(mode: RunMode, prior_seen: IdentifierSet) -> Self {
        let prior_seen = if mode.is_full_crawl() {
            IdentifierSet::new()
        } else {
            prior_seen
        };
        Self {
            prior_seen,
            newly_seen: IdentifierSet::new(),
            mode,
        }
    }

    pub fn mode(&self) -> RunMode {
        self.mode
    }

    pub fn prior_seen(&self) -> &IdentifierSet {
        &self.prior_seen
    }

    pub fn newly_seen(&self) -> &IdentifierSet {
        &self.newly_seen
    }

    pub fn take_newly_seen(&mut self) -> IdentifierSet {
        std::mem::take(&mut self.newly_seen)
    }
}

#[derive(Debug, Clone)]
pub struct LoadedSeen {
    pub seen: IdentifierSet,
    pub first_run: bool,
    pub skipped_entries: usize,
}

/// Materializes a job's collection into the prior-seen set.
pub struct SeenBeforeLoader<'a> {
    store: &'a dyn CollectionStore,
}

impl<'a> SeenBeforeLoader<'a> {
    pub fn new(store: &'a dyn CollectionStore) -> Self {
        Self { store }
    }

    /// A missing collection is a first run, not an error. Any other store
    /// failure is returned: running without the full prior set would re-emit
    /// duplicates.
    pub async fn load(&self, job_name: &str) -> Result<LoadedSeen, StoreError> {
        let collection = collection_name(job_name);
        let entries = match self.store.read_all(&collection).await {
            Ok(entries) => entries,
            Err(StoreError::NotFound { .. }) => {
                info!(
                    job = job_name,
                    collection = %collection,
                    "collection not found; it will be created when this run flushes"
                );
                return Ok(LoadedSeen {
                    seen: IdentifierSet::new(),
                    first_run: true,
                    skipped_entries: 0,
                });
            }
            Err(err) => return Err(err),
        };

        let mut skipped_entries = 0;
        let seen: IdentifierSet = entries
            .into_iter()
            .filter_map(|entry| {
                if entry.item_id.is_none() {
                    skipped_entries += 1;
                }
                entry.item_id
            })
            .collect();
        if skipped_entries > 0 {
            warn!(
                job = job_name,
                collection = %collection,
                skipped_entries,
                "collection entries without item_id ignored"
            );
        }
        info!(job = job_name, collection = %collection, entries = seen.len(), "items found in collection");

        Ok(LoadedSeen {
            seen,
            first_run: false,
            skipped_entries,
        })
    }
}

/// Early, cheap rejection of candidates already emitted by a previous run.
#[derive(Debug, Clone, Copy)]
pub struct RecordFilter<'a> {
    state: &'a DedupState,
}

impl<'a> RecordFilter<'a> {
    pub fn new(state: &'a DedupState) -> Self {
        Self { state }
    }

    pub fn should_admit(&self, id: &str) -> bool {
        if self.state.mode.is_full_crawl() {
            return true;
        }
        let admit = !self.state.prior_seen.contains(id);
        if !admit {
            debug!(item_id = id, "request seen before; ignoring");
        }
        admit
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DropReason {
    SeenInPreviousRun,
    SeenInThisRun,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ItemOutcome {
    Passed(JsonValue),
    /// No usable identifier: passed through and never tracked.
    PassedUntracked(JsonValue),
    Dropped { item_id: Identifier, reason: DropReason },
}

impl ItemOutcome {
    pub fn into_item(self) -> Option<JsonValue> {
        match self {
            Self::Passed(item) | Self::PassedUntracked(item) => Some(item),
            Self::Dropped { .. } => None,
        }
    }

    pub fn is_dropped(&self) -> bool {
        matches!(self, Self::Dropped { .. })
    }
}

/// Authoritative dedup gate for items that reached the pipeline.
#[derive(Debug, Clone)]
pub struct DedupPipelineStage {
    unique_field: String,
}

impl DedupPipelineStage {
    pub fn new(unique_field: impl Into<String>) -> Self {
        let unique_field = unique_field.into();
        if unique_field == DEFAULT_ITEM_UNIQUE_FIELD {
            info!(
                unique_field = DEFAULT_ITEM_UNIQUE_FIELD,
                "using default item unique field as item ids"
            );
        }
        Self { unique_field }
    }

    pub fn unique_field(&self) -> &str {
        &self.unique_field
    }

    pub fn process(&self, state: &mut DedupState, item: JsonValue) -> ItemOutcome {
        let Some(item_id) = extract_identifier(&item, &self.unique_field) else {
            error!(
                unique_field = %self.unique_field,
                item = %item,
                "unique item field not found in item"
            );
            return ItemOutcome::PassedUntracked(item);
        };

        if state.mode.is_full_crawl() {
            return ItemOutcome::Passed(item);
        }

        if state.prior_seen.contains(item_id.as_str()) {
            debug!(item_id = %item_id, "item seen in a previous run; dropping");
            return ItemOutcome::Dropped {
                item_id,
                reason: DropReason::SeenInPreviousRun,
            };
        }

        if state.newly_seen.contains(item_id.as_str()) {
            debug!(item_id = %item_id, "item already seen in this run; dropping");
            return ItemOutcome::Dropped {
                item_id,
                reason: DropReason::SeenInThisRun,
            };
        }

        state.newly_seen.insert(item_id);
        ItemOutcome::Passed(item)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct FlushReport {
    pub batches: usize,
    pub entries: usize,
}

/// Writes newly seen identifiers under fresh synthetic keys, one store call per batch.
#[derive(Debug, Clone, Copy)]
pub struct BatchWriter {
    batch_size: usize,
}

impl BatchWriter {
    pub fn new(batch_size: usize) -> Self {
        Self {
            batch_size: batch_size.max(1),
        }
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Stops at the first failed batch. Batches already written stay written.
    pub async fn flush(
        &self,
        store: &dyn CollectionStore,
        job_name: &str,
        newly_seen: IdentifierSet,
    ) -> Result<FlushReport, StoreError> {
        let collection = collection_name(job_name);
        let mut report = FlushReport::default();

        for batch in newly_seen.into_batches(self.batch_size) {
            let entries: Vec<BatchEntry> = batch.into_iter().map(BatchEntry::fresh).collect();
            store.write(&collection, &entries).await?;
            report.batches += 1;
            report.entries += entries.len();
            debug!(collection = %collection, batch = report.batches, entries = entries.len(), "batch written");
        }

        info!(
            job = job_name,
            collection = %collection,
            batches = report.batches,
            entries = report.entries,
            "seen-before collection flushed"
        );
        Ok(report)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Init,
    Loading,
    Processing,
    Flushing,
    Closed,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RunCounters {
    pub passed: usize,
    pub passed_untracked: usize,
    pub dropped_previous_run: usize,
    pub dropped_this_run: usize,
    pub requests_rejected: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub job: String,
    pub collection: String,
    pub mode: RunMode,
    pub first_run: bool,
    pub prior_seen: usize,
    pub counters: RunCounters,
    pub flushed: FlushReport,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

/// One incremental run: `Init -> Loading -> Processing -> Flushing -> Closed`.
/// Loading and flushing are skipped in full-crawl mode.
pub struct IncrementalRun {
    run_id: Uuid,
    job_name: String,
    collection: String,
    store: Arc<dyn CollectionStore>,
    state: DedupState,
    run_state: RunState,
    filter_requests: bool,
    stage: DedupPipelineStage,
    writer: BatchWriter,
    counters: RunCounters,
    first_run: bool,
    prior_seen: usize,
    started_at: DateTime<Utc>,
}

impl std::fmt::Debug for IncrementalRun {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IncrementalRun")
            .field("run_id", &self.run_id)
            .field("job_name", &self.job_name)
            .field("collection", &self.collection)
            .finish_non_exhaustive()
    }
}

impl IncrementalRun {
    pub async fn open(
        job: &dyn IncrementalJob,
        config: &IncrementalConfig,
        store: Arc<dyn CollectionStore>,
    ) -> Result<Self, RunError> {
        let job_name = job.job_name().trim().to_string();
        if job_name.is_empty() {
            return Err(ConfigError::MissingJobName.into());
        }
        if config.batch_size == 0 {
            return Err(ConfigError::InvalidBatchSize("0".to_string()).into());
        }

        let mode = if config.full_crawl {
            RunMode::FullCrawl
        } else {
            job.run_mode()
        };
        let mut run = Self {
            run_id: Uuid::new_v4(),
            collection: collection_name(&job_name),
            job_name,
            store,
            state: DedupState::new(mode),
            run_state: RunState::Init,
            filter_requests: job.filters_requests(),
            stage: DedupPipelineStage::new(config.unique_field.clone()),
            writer: BatchWriter::new(config.batch_size),
            counters: RunCounters::default(),
            first_run: false,
            prior_seen: 0,
            started_at: Utc::now(),
        };

        if mode.is_full_crawl() {
            info!(
                job = %run.job_name,
                "running in full-crawl mode; previously scraped items will not be filtered"
            );
            run.run_state = RunState::Processing;
            return Ok(run);
        }

        run.run_state = RunState::Loading;
        let loaded = match SeenBeforeLoader::new(run.store.as_ref())
            .load(&run.job_name)
            .await
        {
            Ok(loaded) => loaded,
            Err(source) => {
                run.release_store().await;
                run.run_state = RunState::Closed;
                return Err(RunError::Load {
                    collection: run.collection.clone(),
                    source,
                });
            }
        };
        run.first_run = loaded.first_run;
        run.prior_seen = loaded.seen.len();
        run.state = DedupState::with_prior_seen(mode, loaded.seen);
        run.run_state = RunState::Processing;
        Ok(run)
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub fn job_name(&self) -> &str {
        &self.job_name
    }

    pub fn collection(&self) -> &str {
        &self.collection
    }

    pub fn run_state(&self) -> RunState {
        self.run_state
    }

    pub fn mode(&self) -> RunMode {
        self.state.mode()
    }

    pub fn dedup_state(&self) -> &DedupState {
        &self.state
    }

    pub fn counters(&self) -> RunCounters {
        self.counters
    }

    fn expect_state(&self, expected: RunState) -> Result<(), RunError> {
        if self.run_state == expected {
            Ok(())
        } else {
            Err(RunError::InvalidState {
                expected,
                actual: self.run_state,
            })
        }
    }

    /// Request-level screen. Jobs that opted out of request filtering admit everything.
    pub fn admit(&mut self, id: &str) -> Result<bool, RunError> {
        self.expect_state(RunState::Processing)?;
        if !self.filter_requests {
            return Ok(true);
        }
        let admitted = RecordFilter::new(&self.state).should_admit(id);
        if !admitted {
            self.counters.requests_rejected += 1;
        }
        Ok(admitted)
    }

    /// Screens a candidate record by its unique field; records without one are admitted.
    pub fn admit_record(&mut self, record: &JsonValue) -> Result<bool, RunError> {
        self.expect_state(RunState::Processing)?;
        match extract_identifier(record, self.stage.unique_field()) {
            Some(id) => self.admit(id.as_str()),
            None => Ok(true),
        }
    }

    pub fn process_item(&mut self, item: JsonValue) -> Result<ItemOutcome, RunError> {
        self.expect_state(RunState::Processing)?;
        let outcome = self.stage.process(&mut self.state, item);
        match &outcome {
            ItemOutcome::Passed(_) => self.counters.passed += 1,
            ItemOutcome::PassedUntracked(_) => self.counters.passed_untracked += 1,
            ItemOutcome::Dropped {
                reason: DropReason::SeenInPreviousRun,
                ..
            } => self.counters.dropped_previous_run += 1,
            ItemOutcome::Dropped {
                reason: DropReason::SeenInThisRun,
                ..
            } => self.counters.dropped_this_run += 1,
        }
        Ok(outcome)
    }

    /// Flushes newly seen identifiers (unless full-crawl), then releases the store.
    pub async fn close(&mut self) -> Result<RunSummary, RunError> {
        self.expect_state(RunState::Processing)?;
        self.run_state = RunState::Flushing;

        let newly_seen = self.state.take_newly_seen();
        let flushed = if self.state.mode().is_full_crawl() {
            FlushReport::default()
        } else {
            match self
                .writer
                .flush(self.store.as_ref(), &self.job_name, newly_seen)
                .await
            {
                Ok(report) => report,
                Err(source) => {
                    self.release_store().await;
                    self.run_state = RunState::Closed;
                    return Err(RunError::Flush {
                        collection: self.collection.clone(),
                        source,
                    });
                }
            }
        };

        self.release_store().await;
        self.run_state = RunState::Closed;
        Ok(self.summary(flushed))
    }

    /// Ends the run without flushing. Returns how many tracked identifiers were discarded.
    pub async fn abort(&mut self) -> usize {
        if self.run_state == RunState::Closed {
            return 0;
        }
        let lost = self.state.take_newly_seen().len();
        if lost > 0 {
            warn!(
                job = %self.job_name,
                discarded = lost,
                "run aborted; newly seen identifiers were not persisted"
            );
        }
        self.release_store().await;
        self.run_state = RunState::Closed;
        lost
    }

    async fn release_store(&self) {
        if let Err(err) = self.store.close().await {
            warn!(job = %self.job_name, error = %err, "closing collection store failed");
        }
    }

    fn summary(&self, flushed: FlushReport) -> RunSummary {
        RunSummary {
            run_id: self.run_id,
            job: self.job_name.clone(),
            collection: self.collection.clone(),
            mode: self.state.mode(),
            first_run: self.first_run,
            prior_seen: self.prior_seen,
            counters: self.counters,
            flushed,
            started_at: self.started_at,
            finished_at: Utc::now(),
        }
    }

    pub fn into_shared(self) -> SharedRun {
        SharedRun {
            inner: Arc::new(Mutex::new(self)),
        }
    }
}

/// Lock-guarded handle for hosts that keep several records in flight.
#[derive(Clone)]
pub struct SharedRun {
    inner: Arc<Mutex<IncrementalRun>>,
}

impl SharedRun {
    pub async fn admit(&self, id: &str) -> Result<bool, RunError> {
        self.inner.lock().await.admit(id)
    }

    pub async fn process_item(&self, item: JsonValue) -> Result<ItemOutcome, RunError> {
        self.inner.lock().await.process_item(item)
    }

    pub async fn close(&self) -> Result<RunSummary, RunError> {
        self.inner.lock().await.close().await
    }

    pub async fn abort(&self) -> usize {
        self.inner.lock().await.abort().await
    }
}

/// Validates `config`, opens its store and starts a run for `job`.
pub async fn open_run(
    job: &dyn IncrementalJob,
    config: &IncrementalConfig,
) -> anyhow::Result<IncrementalRun> {
    config.validate()?;
    config.log_redacted();
    let store = config.open_store()?;
    IncrementalRun::open(job, config, store)
        .await
        .with_context(|| format!("opening incremental run for {}", job.job_name()))
}

/// Opens a run for `job` with configuration and store resolved from the environment.
pub async fn open_run_from_env(job: &dyn IncrementalJob) -> anyhow::Result<IncrementalRun> {
    let config = IncrementalConfig::from_env()?;
    open_run(job, &config).await
}
