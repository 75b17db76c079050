//! Document stores (local file, remote gist, tiered) + HTTP fetch utilities for LeetOffer.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use reqwest::header::{HeaderValue, ACCEPT, AUTHORIZATION};
use reqwest::StatusCode;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "leetoffer-storage";

pub const DEFAULT_GIST_API_BASE: &str = "https://api.github.com";

/// Platform scratch directory used when the deployment filesystem is read-only.
pub const EPHEMERAL_ROOT: &str = "/tmp";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("remote store credentials missing (store id and access token are both required)")]
    MissingCredentials,
    #[error("output directory does not exist: {}", .0.display())]
    DirectoryMissing(PathBuf),
    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },
    #[error("remote store returned http {status}: {body}")]
    Remote { status: u16, body: String },
    #[error("remote store request failed: {0}")]
    Transport(#[source] reqwest::Error),
    #[error("remote store payload invalid: {0}")]
    Decode(String),
}

impl StoreError {
    fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }
}

impl From<FetchError> for StoreError {
    fn from(err: FetchError) -> Self {
        match err {
            FetchError::Request(err) => Self::Transport(err),
            FetchError::HttpStatus { status, body, .. } => Self::Remote { status, body },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteReceipt {
    pub backend: &'static str,
    pub key: String,
    pub location: String,
    pub content_hash: String,
    pub byte_size: usize,
}

impl WriteReceipt {
    fn new(backend: &'static str, key: &str, location: String, bytes: &[u8]) -> Self {
        Self {
            backend,
            key: key.to_string(),
            location,
            content_hash: sha256_hex(bytes),
            byte_size: bytes.len(),
        }
    }
}

/// A backend holding named JSON documents.
///
/// `read` returns `Ok(None)` when the document does not exist.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    fn backend(&self) -> &'static str;

    async fn read(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError>;

    async fn write(&self, key: &str, bytes: &[u8]) -> Result<WriteReceipt, StoreError>;
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

#[derive(Debug, Clone)]
pub struct LocalFileStore {
    root: PathBuf,
    ephemeral: bool,
}

impl LocalFileStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            ephemeral: false,
        }
    }

    /// Store rooted in a platform scratch area. The directory is assumed to exist,
    /// so the missing-directory check is skipped.
    pub fn ephemeral(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            ephemeral: true,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn is_ephemeral(&self) -> bool {
        self.ephemeral
    }

    pub fn path_for(&self, key: &str) -> PathBuf {
        self.root.join(key)
    }
}

#[async_trait]
impl DocumentStore for LocalFileStore {
    fn backend(&self) -> &'static str {
        "local"
    }

    async fn read(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let path = self.path_for(key);
        match fs::read(&path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(StoreError::io(format!("reading {}", path.display()), err)),
        }
    }

    /// Replace the document atomically using a temp file + rename in the same directory.
    async fn write(&self, key: &str, bytes: &[u8]) -> Result<WriteReceipt, StoreError> {
        let path = self.path_for(key);
        let parent = path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));

        if !self.ephemeral {
            let exists = fs::try_exists(&parent)
                .await
                .map_err(|e| StoreError::io(format!("checking {}", parent.display()), e))?;
            if !exists {
                return Err(StoreError::DirectoryMissing(parent));
            }
        }

        let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .map_err(|e| StoreError::io(format!("opening temp file {}", temp_path.display()), e))?;
        let written = async {
            file.write_all(bytes).await?;
            file.flush().await
        }
        .await;
        drop(file);
        if let Err(err) = written {
            let _ = fs::remove_file(&temp_path).await;
            return Err(StoreError::io(
                format!("writing temp file {}", temp_path.display()),
                err,
            ));
        }

        if let Err(err) = fs::rename(&temp_path, &path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(StoreError::io(
                format!(
                    "atomically renaming {} -> {}",
                    temp_path.display(),
                    path.display()
                ),
                err,
            ));
        }

        Ok(WriteReceipt::new(
            self.backend(),
            key,
            path.display().to_string(),
            bytes,
        ))
    }
}

#[derive(Debug, Clone, Default)]
pub struct GistConfig {
    pub api_base: String,
    pub gist_id: Option<String>,
    pub token: Option<String>,
}

impl GistConfig {
    pub fn new(gist_id: Option<String>, token: Option<String>) -> Self {
        Self {
            api_base: DEFAULT_GIST_API_BASE.to_string(),
            gist_id: gist_id.filter(|s| !s.trim().is_empty()),
            token: token.filter(|s| !s.trim().is_empty()),
        }
    }

    pub fn with_api_base(mut self, api_base: impl Into<String>) -> Self {
        self.api_base = api_base.into();
        self
    }

    pub fn has_credentials(&self) -> bool {
        self.gist_id.is_some() && self.token.is_some()
    }
}

#[derive(Debug, Deserialize)]
struct GistResponse {
    #[serde(default)]
    files: HashMap<String, GistFile>,
}

#[derive(Debug, Deserialize)]
struct GistFile {
    content: Option<String>,
    #[serde(default)]
    truncated: bool,
    raw_url: Option<String>,
}

/// Remote document store backed by a GitHub gist; each document is one gist file.
#[derive(Debug)]
pub struct GistStore {
    config: GistConfig,
    http: HttpFetcher,
}

impl GistStore {
    pub fn new(config: GistConfig, http: HttpFetcher) -> Self {
        Self { config, http }
    }

    pub fn config(&self) -> &GistConfig {
        &self.config
    }

    fn gist_url(&self, gist_id: &str) -> String {
        format!("{}/gists/{}", self.config.api_base.trim_end_matches('/'), gist_id)
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        let request = request.header(ACCEPT, HeaderValue::from_static("application/vnd.github.v3+json"));
        match &self.config.token {
            Some(token) => request.header(AUTHORIZATION, format!("token {}", token.trim())),
            None => request,
        }
    }

    async fn read_raw(&self, raw_url: &str) -> Result<Vec<u8>, StoreError> {
        let resp = self
            .http
            .send("gist-raw", raw_url, |client| self.authorize(client.get(raw_url)))
            .await?;
        Ok(resp.body)
    }
}

#[async_trait]
impl DocumentStore for GistStore {
    fn backend(&self) -> &'static str {
        "gist"
    }

    async fn read(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let Some(gist_id) = self.config.gist_id.as_deref() else {
            debug!(key, "gist id not configured; skipping remote read");
            return Ok(None);
        };
        if self.config.token.is_none() {
            debug!(key, "no gist token configured; attempting unauthenticated read");
        }

        let url = self.gist_url(gist_id);
        let resp = match self
            .http
            .send("gist", &url, |client| self.authorize(client.get(&url)))
            .await
        {
            Ok(resp) => resp,
            Err(FetchError::HttpStatus { status: 404, .. }) => return Ok(None),
            Err(err) => return Err(err.into()),
        };

        let gist: GistResponse = serde_json::from_slice(&resp.body)
            .map_err(|e| StoreError::Decode(format!("gist {gist_id}: {e}")))?;
        let Some(file) = gist.files.get(key) else {
            return Ok(None);
        };

        match (&file.content, file.truncated, &file.raw_url) {
            (_, true, Some(raw_url)) => self.read_raw(raw_url).await.map(Some),
            (Some(content), _, _) => Ok(Some(content.clone().into_bytes())),
            (None, _, Some(raw_url)) => self.read_raw(raw_url).await.map(Some),
            (None, _, None) => Ok(None),
        }
    }

    async fn write(&self, key: &str, bytes: &[u8]) -> Result<WriteReceipt, StoreError> {
        let (Some(gist_id), Some(_)) = (self.config.gist_id.as_deref(), self.config.token.as_deref())
        else {
            return Err(StoreError::MissingCredentials);
        };
        let content = std::str::from_utf8(bytes)
            .map_err(|e| StoreError::Decode(format!("document {key} is not utf-8: {e}")))?;
        let payload = serde_json::json!({
            "files": { key: { "content": content } }
        });

        let url = self.gist_url(gist_id);
        self.http
            .send("gist", &url, |client| self.authorize(client.patch(&url)).json(&payload))
            .await?;

        Ok(WriteReceipt::new(
            self.backend(),
            key,
            format!("{url}#{key}"),
            bytes,
        ))
    }
}

/// In-memory store, used for offline runs and tests. Can be switched into a failing mode.
#[derive(Debug, Default)]
pub struct MemoryStore {
    backend: &'static str,
    documents: Mutex<HashMap<String, Vec<u8>>>,
    failing: bool,
    reads: AtomicUsize,
    writes: AtomicUsize,
}

impl MemoryStore {
    pub fn new(backend: &'static str) -> Self {
        Self {
            backend,
            ..Default::default()
        }
    }

    /// Every read and write fails with a remote 503.
    pub fn failing(backend: &'static str) -> Self {
        Self {
            backend,
            failing: true,
            ..Default::default()
        }
    }

    pub fn with_document(self, key: &str, bytes: impl Into<Vec<u8>>) -> Self {
        self.insert(key, bytes);
        self
    }

    pub fn insert(&self, key: &str, bytes: impl Into<Vec<u8>>) {
        if let Ok(mut docs) = self.documents.lock() {
            docs.insert(key.to_string(), bytes.into());
        }
    }

    pub fn document(&self, key: &str) -> Option<Vec<u8>> {
        self.documents.lock().ok()?.get(key).cloned()
    }

    pub fn read_count(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }

    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    fn unavailable() -> StoreError {
        StoreError::Remote {
            status: 503,
            body: "memory store configured to fail".to_string(),
        }
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    fn backend(&self) -> &'static str {
        self.backend
    }

    async fn read(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        if self.failing {
            return Err(Self::unavailable());
        }
        Ok(self.document(key))
    }

    async fn write(&self, key: &str, bytes: &[u8]) -> Result<WriteReceipt, StoreError> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        if self.failing {
            return Err(Self::unavailable());
        }
        self.insert(key, bytes.to_vec());
        Ok(WriteReceipt::new(
            self.backend,
            key,
            format!("memory://{}/{key}", self.backend),
            bytes,
        ))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WritePolicy {
    /// Failure aborts the write and is returned to the caller.
    Required,
    /// Failure is logged and recorded in the outcome.
    BestEffort,
}

#[derive(Clone)]
pub struct Tier {
    pub store: Arc<dyn DocumentStore>,
    pub policy: WritePolicy,
}

#[derive(Debug, Clone)]
pub struct Loaded<T> {
    pub value: T,
    pub backend: &'static str,
}

#[derive(Debug, Clone, Default)]
pub struct WriteOutcome {
    pub receipts: Vec<WriteReceipt>,
    pub failures: Vec<(&'static str, String)>,
}

impl WriteOutcome {
    pub fn wrote_to(&self, backend: &str) -> bool {
        self.receipts.iter().any(|r| r.backend == backend)
    }
}

/// Ordered list of stores: reads walk tiers in order, writes go to every tier
/// (required tiers first).
#[derive(Clone, Default)]
pub struct TieredStore {
    tiers: Vec<Tier>,
}

impl TieredStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_tier(mut self, store: Arc<dyn DocumentStore>, policy: WritePolicy) -> Self {
        self.tiers.push(Tier { store, policy });
        self
    }

    pub fn tiers(&self) -> &[Tier] {
        &self.tiers
    }

    /// Return the first document that `decode` accepts. Read errors and decode errors
    /// fall through to the next tier; `Ok(None)` from `decode` also falls through.
    pub async fn read_first<T, F>(&self, key: &str, mut decode: F) -> Option<Loaded<T>>
    where
        F: FnMut(&[u8]) -> anyhow::Result<Option<T>>,
    {
        for tier in &self.tiers {
            let backend = tier.store.backend();
            match tier.store.read(key).await {
                Ok(Some(bytes)) => match decode(&bytes) {
                    Ok(Some(value)) => {
                        debug!(backend, key, "document loaded");
                        return Some(Loaded { value, backend });
                    }
                    Ok(None) => debug!(backend, key, "document present but not usable; trying next tier"),
                    Err(err) => warn!(backend, key, error = %format!("{err:#}"), "failed to decode document; trying next tier"),
                },
                Ok(None) => debug!(backend, key, "document not found"),
                Err(err) => warn!(backend, key, error = %err, "failed to read document; trying next tier"),
            }
        }
        None
    }

    pub async fn write_all(&self, key: &str, bytes: &[u8]) -> Result<WriteOutcome, StoreError> {
        let mut outcome = WriteOutcome::default();
        let ordered = self
            .tiers
            .iter()
            .filter(|t| t.policy == WritePolicy::Required)
            .chain(self.tiers.iter().filter(|t| t.policy == WritePolicy::BestEffort));

        for tier in ordered {
            let backend = tier.store.backend();
            match tier.store.write(key, bytes).await {
                Ok(receipt) => {
                    debug!(
                        backend,
                        key,
                        location = %receipt.location,
                        sha256 = %receipt.content_hash,
                        bytes = receipt.byte_size,
                        "document written"
                    );
                    outcome.receipts.push(receipt);
                }
                Err(err) if tier.policy == WritePolicy::BestEffort => {
                    warn!(backend, key, error = %err, "best-effort write failed (non-fatal)");
                    outcome.failures.push((backend, err.to_string()));
                }
                Err(err) => return Err(err),
            }
        }
        Ok(outcome)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
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
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub backoff: BackoffPolicy,
    /// When false, HTTP 429 is returned immediately instead of being retried.
    pub retry_rate_limited: bool,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            backoff: BackoffPolicy::default(),
            retry_rate_limited: true,
        }
    }
}

#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
    backoff: BackoffPolicy,
    retry_rate_limited: bool,
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String, body: String },
}

impl FetchError {
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::HttpStatus { status, .. } => Some(*status),
            Self::Request(err) => err.status().map(|s| s.as_u16()),
        }
    }
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
            backoff: config.backoff,
            retry_rate_limited: config.retry_rate_limited,
        })
    }

    /// Same client, but every request is sent exactly once: no backoff retries and
    /// 429 returned immediately.
    pub fn single_attempt(mut self) -> Self {
        self.backoff = BackoffPolicy::none();
        self.retry_rate_limited = false;
        self
    }

    fn should_retry(&self, status: StatusCode) -> bool {
        if status == StatusCode::TOO_MANY_REQUESTS && !self.retry_rate_limited {
            return false;
        }
        classify_status(status) == RetryDisposition::Retryable
    }

    /// Send a request built by `build`, retrying transient failures with backoff.
    /// `build` is invoked once per attempt.
    pub async fn send<F>(&self, target: &str, url: &str, build: F) -> Result<FetchedResponse, FetchError>
    where
        F: Fn(&reqwest::Client) -> reqwest::RequestBuilder,
    {
        let span = info_span!("http_fetch", target, url);
        async {
            let mut attempt = 0usize;
            loop {
                match build(&self.client).send().await {
                    Ok(resp) => {
                        let status = resp.status();
                        let final_url = resp.url().to_string();

                        if status.is_success() {
                            let body = resp.bytes().await?.to_vec();
                            return Ok(FetchedResponse {
                                status,
                                final_url,
                                body,
                            });
                        }

                        if self.should_retry(status) && attempt < self.backoff.max_retries {
                            debug!(%status, attempt, "retrying after http status");
                            tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                            attempt += 1;
                            continue;
                        }

                        let body = resp
                            .text()
                            .await
                            .unwrap_or_else(|_| "<body unavailable>".to_string());
                        return Err(FetchError::HttpStatus {
                            status: status.as_u16(),
                            url: final_url,
                            body,
                        });
                    }
                    Err(err) => {
                        if classify_reqwest_error(&err) == RetryDisposition::Retryable
                            && attempt < self.backoff.max_retries
                        {
                            debug!(error = %err, attempt, "retrying after request error");
                            tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                            attempt += 1;
                            continue;
                        }
                        return Err(FetchError::Request(err));
                    }
                }
            }
        }
        .instrument(span)
        .await
    }

    pub async fn get(&self, target: &str, url: &str) -> Result<FetchedResponse, FetchError> {
        self.send(target, url, |client| client.get(url)).await
    }
}
