//! Incremental ingestion pipeline: checkpoint-driven fetch, extraction, merge and persistence.

use std::collections::HashSet;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use leetoffer_core::{Checkpoint, Offer, CHECKPOINT_DOCUMENT, DATASET_DOCUMENT};
use leetoffer_sources::{
    latest_posts, ExtractError, HttpPostSource, LlmConfig, LlmOfferExtractor, OfferExtractor,
    PostSource, SourceError, DEFAULT_PAGE_SIZE,
};
use leetoffer_storage::{
    BackoffPolicy, DocumentStore, GistConfig, GistStore, HttpClientConfig, HttpFetcher,
    LocalFileStore, StoreError, TieredStore, WriteOutcome, WritePolicy, DEFAULT_GIST_API_BASE,
    EPHEMERAL_ROOT,
};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "leetoffer-ingest";

/// Kept below the provider's hard daily limit of 250 calls.
pub const DEFAULT_DAILY_BUDGET: usize = 240;
pub const DEFAULT_INCREMENTAL_DEPTH: usize = 500;
pub const DEFAULT_FULL_DEPTH: usize = 2000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunLimits {
    pub daily_budget: usize,
    pub incremental_depth: usize,
    pub full_depth: usize,
    pub page_size: usize,
}

impl Default for RunLimits {
    fn default() -> Self {
        Self {
            daily_budget: DEFAULT_DAILY_BUDGET,
            incremental_depth: DEFAULT_INCREMENTAL_DEPTH,
            full_depth: DEFAULT_FULL_DEPTH,
            page_size: DEFAULT_PAGE_SIZE,
        }
    }
}

#[derive(Debug, Clone)]
pub struct IngestConfig {
    pub data_dir: PathBuf,
    pub ephemeral_fs: bool,
    pub gist_id: Option<String>,
    pub github_token: Option<String>,
    pub gist_api_base: String,
    pub posts_url: Option<String>,
    pub llm_api_key: Option<String>,
    pub llm_base_url: String,
    pub llm_model: String,
    pub limits: RunLimits,
    pub pacing: FixedPacing,
    pub scheduler_cron: String,
    pub user_agent: String,
    pub http_timeout_secs: u64,
}

fn env_opt(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn env_parse<T: FromStr>(key: &str, default: T) -> T {
    env_opt(key).and_then(|v| v.trim().parse().ok()).unwrap_or(default)
}

fn env_flag(key: &str) -> bool {
    env_opt(key)
        .map(|v| matches!(v.trim(), "1" | "true" | "TRUE" | "True" | "yes"))
        .unwrap_or(false)
}

impl IngestConfig {
    pub fn from_env() -> Self {
        let defaults = RunLimits::default();
        let pacing = FixedPacing::default();
        Self {
            data_dir: env_opt("LEETOFFER_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("apps/app/public")),
            ephemeral_fs: env_flag("LEETOFFER_EPHEMERAL_FS") || env_opt("VERCEL").is_some(),
            gist_id: env_opt("GIST_ID"),
            github_token: env_opt("GITHUB_TOKEN"),
            gist_api_base: env_opt("GIST_API_BASE")
                .unwrap_or_else(|| DEFAULT_GIST_API_BASE.to_string()),
            posts_url: env_opt("LEETOFFER_POSTS_URL"),
            llm_api_key: env_opt("LEETOFFER_LLM_API_KEY"),
            llm_base_url: env_opt("LEETOFFER_LLM_BASE_URL")
                .unwrap_or_else(|| "https://api.openai.com/v1".to_string()),
            llm_model: env_opt("LEETOFFER_LLM_MODEL").unwrap_or_else(|| "gpt-4o-mini".to_string()),
            limits: RunLimits {
                daily_budget: env_parse("LEETOFFER_DAILY_BUDGET", defaults.daily_budget),
                incremental_depth: env_parse("LEETOFFER_INCREMENTAL_DEPTH", defaults.incremental_depth),
                full_depth: env_parse("LEETOFFER_FULL_DEPTH", defaults.full_depth),
                page_size: env_parse("LEETOFFER_PAGE_SIZE", defaults.page_size),
            },
            pacing: FixedPacing {
                short: Duration::from_millis(env_parse(
                    "LEETOFFER_PACING_SHORT_MS",
                    pacing.short.as_millis() as u64,
                )),
                long: Duration::from_millis(env_parse(
                    "LEETOFFER_PACING_LONG_MS",
                    pacing.long.as_millis() as u64,
                )),
                long_every: env_parse("LEETOFFER_PACING_EVERY", pacing.long_every),
            },
            scheduler_cron: env_opt("LEETOFFER_SCHEDULER_CRON")
                .unwrap_or_else(|| "0 0 6 * * *".to_string()),
            user_agent: env_opt("LEETOFFER_USER_AGENT")
                .unwrap_or_else(|| "leetoffer-bot/0.1".to_string()),
            http_timeout_secs: env_parse("LEETOFFER_HTTP_TIMEOUT_SECS", 20),
        }
    }

    pub fn local_store(&self) -> LocalFileStore {
        if self.ephemeral_fs {
            LocalFileStore::ephemeral(EPHEMERAL_ROOT)
        } else {
            LocalFileStore::new(self.data_dir.clone())
        }
    }

    pub fn http_fetcher(&self, retry_rate_limited: bool) -> Result<HttpFetcher> {
        HttpFetcher::new(HttpClientConfig {
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: Some(self.user_agent.clone()),
            backoff: BackoffPolicy::default(),
            retry_rate_limited,
        })
    }

    pub fn remote_store(&self) -> Result<GistStore> {
        let config = GistConfig::new(self.gist_id.clone(), self.github_token.clone())
            .with_api_base(self.gist_api_base.clone());
        Ok(GistStore::new(config, self.http_fetcher(true)?))
    }
}

/// Remote first for reads; local is required on writes, remote best-effort.
pub fn ingest_tiers(local: Arc<dyn DocumentStore>, remote: Arc<dyn DocumentStore>) -> TieredStore {
    TieredStore::new()
        .with_tier(remote, WritePolicy::BestEffort)
        .with_tier(local, WritePolicy::Required)
}

/// Delay to apply before an extraction call, given how many calls were already made.
pub trait PacingPolicy: Send + Sync {
    fn delay_before_call(&self, calls_made: usize) -> Duration;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FixedPacing {
    pub short: Duration,
    pub long: Duration,
    pub long_every: usize,
}

impl Default for FixedPacing {
    fn default() -> Self {
        Self {
            short: Duration::from_millis(500),
            long: Duration::from_secs(2),
            long_every: 10,
        }
    }
}

impl PacingPolicy for FixedPacing {
    fn delay_before_call(&self, calls_made: usize) -> Duration {
        if calls_made == 0 {
            Duration::ZERO
        } else if self.long_every > 0 && calls_made % self.long_every == 0 {
            self.long
        } else {
            self.short
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoPacing;

impl PacingPolicy for NoPacing {
    fn delay_before_call(&self, _calls_made: usize) -> Duration {
        Duration::ZERO
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MergeOutcome {
    pub offers: Vec<Offer>,
    pub added: usize,
}

/// Append `incoming` offers whose identity key is not already present, keeping
/// existing order and incoming extraction order.
pub fn merge_offers(existing: Vec<Offer>, incoming: Vec<Offer>) -> MergeOutcome {
    let mut seen = existing.iter().map(Offer::identity_key).collect::<HashSet<_>>();
    let mut offers = existing;
    let before = offers.len();
    for offer in incoming {
        if seen.insert(offer.identity_key()) {
            offers.push(offer);
        }
    }
    let added = offers.len() - before;
    MergeOutcome { offers, added }
}

fn decode_offers(bytes: &[u8]) -> Result<Option<Vec<Offer>>> {
    if bytes.iter().all(u8::is_ascii_whitespace) {
        return Ok(None);
    }
    let offers: Vec<Offer> = serde_json::from_slice(bytes).context("parsing offers document")?;
    Ok((!offers.is_empty()).then_some(offers))
}

fn decode_checkpoint(bytes: &[u8]) -> Result<Option<Checkpoint>> {
    if bytes.iter().all(u8::is_ascii_whitespace) {
        return Ok(None);
    }
    let checkpoint: Checkpoint =
        serde_json::from_slice(bytes).context("parsing checkpoint document")?;
    Ok((!checkpoint.last_post_id.trim().is_empty()).then_some(checkpoint))
}

/// The offers document across the configured tiers.
#[derive(Clone)]
pub struct DatasetStore {
    tiers: TieredStore,
}

impl DatasetStore {
    pub fn new(tiers: TieredStore) -> Self {
        Self { tiers }
    }

    /// First non-empty, parseable dataset in tier order; empty when every tier is
    /// missing or blank. A document that exists but cannot be decoded is an error
    /// unless a later tier supplies a usable copy, so history is never replaced by
    /// an empty dataset.
    pub async fn load(&self) -> Result<Vec<Offer>, IngestError> {
        let mut undecodable = 0usize;
        let loaded = self
            .tiers
            .read_first(DATASET_DOCUMENT, |bytes| {
                let decoded = decode_offers(bytes);
                if decoded.is_err() {
                    undecodable += 1;
                }
                decoded
            })
            .await;
        match loaded {
            Some(loaded) => {
                info!(backend = loaded.backend, offers = loaded.value.len(), "loaded existing offers");
                Ok(loaded.value)
            }
            None if undecodable > 0 => Err(IngestError::UndecodableDataset {
                document: DATASET_DOCUMENT,
                copies: undecodable,
            }),
            None => {
                info!("no existing offers found; starting from an empty dataset");
                Ok(Vec::new())
            }
        }
    }

    pub async fn save(&self, offers: &[Offer]) -> Result<WriteOutcome, IngestError> {
        let bytes = serde_json::to_vec_pretty(offers)?;
        self.tiers
            .write_all(DATASET_DOCUMENT, &bytes)
            .await
            .map_err(|source| IngestError::LocalPersist {
                document: DATASET_DOCUMENT,
                source,
            })
    }
}

/// The checkpoint document across the configured tiers.
#[derive(Clone)]
pub struct CheckpointStore {
    tiers: TieredStore,
}

impl CheckpointStore {
    pub fn new(tiers: TieredStore) -> Self {
        Self { tiers }
    }

    pub async fn load(&self) -> Option<Checkpoint> {
        let loaded = self.tiers.read_first(CHECKPOINT_DOCUMENT, decode_checkpoint).await?;
        info!(
            backend = loaded.backend,
            last_post_id = %loaded.value.last_post_id,
            "loaded checkpoint"
        );
        Some(loaded.value)
    }

    pub async fn save(&self, checkpoint: &Checkpoint) -> Result<WriteOutcome, IngestError> {
        let bytes = serde_json::to_vec_pretty(checkpoint)?;
        self.tiers
            .write_all(CHECKPOINT_DOCUMENT, &bytes)
            .await
            .map_err(|source| IngestError::LocalPersist {
                document: CHECKPOINT_DOCUMENT,
                source,
            })
    }
}

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("failed to persist {document} to required storage")]
    LocalPersist {
        document: &'static str,
        #[source]
        source: StoreError,
    },
    #[error("{document} exists but none of its {copies} stored copies could be decoded")]
    UndecodableDataset { document: &'static str, copies: usize },
    #[error("failed to fetch posts")]
    Fetch(#[source] SourceError),
    #[error("failed to serialize document")]
    Serialize(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunMode {
    Incremental,
    Full,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    /// The source ran out of posts, hit the cursor, or hit the depth bound.
    SourceExhausted,
    BudgetExhausted,
    QuotaExceeded,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Bootstrapping,
    Fetching,
    Extracting,
    Merging,
    Persisting,
    Done,
    Aborted(StopReason),
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bootstrapping => f.write_str("bootstrapping"),
            Self::Fetching => f.write_str("fetching"),
            Self::Extracting => f.write_str("extracting"),
            Self::Merging => f.write_str("merging"),
            Self::Persisting => f.write_str("persisting"),
            Self::Done => f.write_str("done"),
            Self::Aborted(reason) => write!(f, "aborted({reason:?})"),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub mode: RunMode,
    pub stop_reason: StopReason,
    /// Posts observed by the run, including negative-vote skips and a post whose
    /// extraction hit the quota.
    pub processed: usize,
    /// Posts that yielded at least one offer.
    pub successful: usize,
    pub extraction_calls: usize,
    pub skipped_negative_votes: usize,
    pub extraction_failures: usize,
    pub existing_offers: usize,
    pub new_offers: usize,
    pub total_offers: usize,
    pub checkpoint_updated: bool,
    pub remote_synced: bool,
    pub output_path: String,
}

#[derive(Debug, Default)]
struct Tally {
    processed: usize,
    successful: usize,
    calls: usize,
    skipped_negative: usize,
    failures: usize,
    newest_post_id: Option<String>,
}

pub struct IngestPipeline {
    source: Box<dyn PostSource>,
    extractor: Box<dyn OfferExtractor>,
    pacing: Box<dyn PacingPolicy>,
    dataset: DatasetStore,
    checkpoints: CheckpointStore,
    limits: RunLimits,
    output_path: String,
}

impl IngestPipeline {
    pub fn new(
        source: Box<dyn PostSource>,
        extractor: Box<dyn OfferExtractor>,
        tiers: TieredStore,
        limits: RunLimits,
    ) -> Self {
        Self {
            source,
            extractor,
            pacing: Box::<FixedPacing>::default(),
            dataset: DatasetStore::new(tiers.clone()),
            checkpoints: CheckpointStore::new(tiers),
            limits,
            output_path: DATASET_DOCUMENT.to_string(),
        }
    }

    pub fn with_pacing(mut self, pacing: Box<dyn PacingPolicy>) -> Self {
        self.pacing = pacing;
        self
    }

    pub fn with_output_path(mut self, output_path: impl Into<String>) -> Self {
        self.output_path = output_path.into();
        self
    }

    /// Wire the HTTP post source, LLM extractor, local file store and gist store from config.
    pub fn from_config(config: &IngestConfig) -> Result<Self> {
        let api_key = config
            .llm_api_key
            .clone()
            .context("LEETOFFER_LLM_API_KEY is required for ingestion")?;
        let extractor = LlmOfferExtractor::new(
            LlmConfig::new(api_key, config.llm_base_url.clone(), config.llm_model.clone()),
            config.http_fetcher(false)?,
        )?;
        let posts_url = config
            .posts_url
            .clone()
            .context("LEETOFFER_POSTS_URL is required for ingestion")?;
        let source = HttpPostSource::new(posts_url, config.http_fetcher(true)?);

        let local = config.local_store();
        let output_path = local.path_for(DATASET_DOCUMENT).display().to_string();
        let remote = config.remote_store()?;
        if !remote.config().has_credentials() {
            warn!("GIST_ID/GITHUB_TOKEN not set; remote store writes will be skipped");
        }
        let tiers = ingest_tiers(Arc::new(local), Arc::new(remote));

        Ok(Self::new(Box::new(source), Box::new(extractor), tiers, config.limits)
            .with_pacing(Box::new(config.pacing))
            .with_output_path(output_path))
    }

    fn enter(&self, state: RunState) {
        info!(%state, "ingest state");
    }

    pub async fn run_once(&self) -> Result<RunSummary, IngestError> {
        let run_id = Uuid::new_v4();
        let span = info_span!("ingest_run", %run_id);
        self.run_inner(run_id).instrument(span).await
    }

    async fn run_inner(&self, run_id: Uuid) -> Result<RunSummary, IngestError> {
        let started_at = Utc::now();

        self.enter(RunState::Bootstrapping);
        let checkpoint = self.checkpoints.load().await;
        let existing = self.dataset.load().await?;
        let existing_offers = existing.len();
        let cursor = checkpoint.as_ref().map(|c| c.last_post_id.as_str());
        let (mode, depth) = match cursor {
            Some(_) => (RunMode::Incremental, self.limits.incremental_depth),
            None => (RunMode::Full, self.limits.full_depth),
        };
        match cursor {
            Some(id) => info!(last_post_id = id, depth, "incremental mode: fetching posts newer than checkpoint"),
            None => info!(depth, "full mode: no checkpoint found"),
        }

        self.enter(RunState::Fetching);
        let mut stream = latest_posts(self.source.as_ref(), cursor, depth, self.limits.page_size);
        let mut tally = Tally::default();
        let mut extracted = Vec::new();

        let stop_reason = loop {
            let post = match stream.next().await {
                Ok(Some(post)) => post,
                Ok(None) => break StopReason::SourceExhausted,
                Err(SourceError::RateLimited) => {
                    warn!("post source rate limit hit; stopping with partial progress");
                    break StopReason::QuotaExceeded;
                }
                Err(err) => return Err(IngestError::Fetch(err)),
            };

            if tally.calls >= self.limits.daily_budget {
                warn!(
                    calls = tally.calls,
                    budget = self.limits.daily_budget,
                    processed = tally.processed,
                    successful = tally.successful,
                    "daily extraction budget reached; remaining posts are left for the next run"
                );
                break StopReason::BudgetExhausted;
            }

            tally.processed += 1;
            tally.newest_post_id.get_or_insert_with(|| post.id.clone());
            info!(n = tally.processed, post_id = %post.id, "parsing \"{}\"", post.title);

            if post.vote_count < 0 {
                info!(post_id = %post.id, votes = post.vote_count, "skipping post with negative votes");
                tally.skipped_negative += 1;
                continue;
            }

            let delay = self.pacing.delay_before_call(tally.calls);
            if !delay.is_zero() {
                debug!(?delay, calls = tally.calls, "pacing before extraction call");
                tokio::time::sleep(delay).await;
            }

            if tally.calls == 0 {
                self.enter(RunState::Extracting);
            }
            tally.calls += 1;
            let result = self.extractor.extract(&post).await;

            match result {
                Ok(drafts) if drafts.is_empty() => {
                    debug!(post_id = %post.id, "no valid offers found");
                }
                Ok(drafts) => {
                    tally.successful += 1;
                    info!(post_id = %post.id, offers = drafts.len(), "found offers");
                    extracted.extend(drafts.into_iter().map(|draft| draft.stamp(&post)));
                }
                Err(ExtractError::QuotaExceeded) => {
                    warn!(
                        processed = tally.processed,
                        successful = tally.successful,
                        "extraction quota exceeded; stopping with partial progress"
                    );
                    break StopReason::QuotaExceeded;
                }
                Err(ExtractError::Failed(reason)) => {
                    tally.failures += 1;
                    warn!(post_id = %post.id, %reason, "error processing post, continuing");
                }
            }
        };
        if stop_reason != StopReason::SourceExhausted {
            self.enter(RunState::Aborted(stop_reason));
        }

        self.enter(RunState::Merging);
        let merged = merge_offers(existing, extracted);

        self.enter(RunState::Persisting);
        let dataset_outcome = self.dataset.save(&merged.offers).await?;
        let remote_synced = dataset_outcome.failures.is_empty();

        let checkpoint_updated = match tally.newest_post_id.take() {
            Some(post_id) => {
                let checkpoint = Checkpoint::new(post_id, Utc::now(), merged.offers.len());
                self.checkpoints.save(&checkpoint).await?;
                true
            }
            None => {
                info!("no posts observed; checkpoint left unchanged");
                false
            }
        };

        self.enter(RunState::Done);
        let summary = RunSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            mode,
            stop_reason,
            processed: tally.processed,
            successful: tally.successful,
            extraction_calls: tally.calls,
            skipped_negative_votes: tally.skipped_negative,
            extraction_failures: tally.failures,
            existing_offers,
            new_offers: merged.added,
            total_offers: merged.offers.len(),
            checkpoint_updated,
            remote_synced,
            output_path: self.output_path.clone(),
        };
        info!(
            processed = summary.processed,
            successful = summary.successful,
            new_offers = summary.new_offers,
            total_offers = summary.total_offers,
            output = %summary.output_path,
            "ingestion run complete"
        );
        Ok(summary)
    }
}

pub async fn run_ingest_once_from_env() -> Result<RunSummary> {
    let config = IngestConfig::from_env();
    let pipeline = IngestPipeline::from_config(&config)?;
    Ok(pipeline.run_once().await?)
}

/// Cron-driven runs inside one process. A tick is skipped while the previous run is
/// still active; runs in separate processes are not coordinated.
pub async fn build_scheduler(pipeline: Arc<IngestPipeline>, cron: &str) -> Result<JobScheduler> {
    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let running = Arc::new(Mutex::new(()));
    let job = Job::new_async(cron, move |_uuid, _l| {
        let pipeline = pipeline.clone();
        let running = running.clone();
        Box::pin(async move {
            let Ok(_guard) = running.try_lock() else {
                warn!("previous ingestion run still active; skipping scheduled tick");
                return;
            };
            match pipeline.run_once().await {
                Ok(summary) => info!(run_id = %summary.run_id, new_offers = summary.new_offers, "scheduled ingestion finished"),
                Err(err) => warn!(error = %format!("{:#}", anyhow::Error::from(err)), "scheduled ingestion failed"),
            }
        })
    })
    .with_context(|| format!("creating scheduler job for cron {cron}"))?;
    sched.add(job).await.context("adding scheduler job")?;
    Ok(sched)
}

pub async fn watch_from_env() -> Result<()> {
    let config = IngestConfig::from_env();
    let pipeline = Arc::new(IngestPipeline::from_config(&config)?);
    let mut sched = build_scheduler(pipeline, &config.scheduler_cron).await?;
    sched.start().await.context("starting scheduler")?;
    info!(cron = %config.scheduler_cron, "scheduler started; waiting for ctrl-c");
    tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
    sched.shutdown().await.context("stopping scheduler")?;
    Ok(())
}
