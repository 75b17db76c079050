//! Post source + offer extractor contracts and their HTTP implementations.

use std::collections::VecDeque;
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use leetoffer_core::{OfferDraft, Post, VisaSponsorship};
use leetoffer_storage::{FetchError, HttpFetcher};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::debug;

pub const CRATE_NAME: &str = "leetoffer-sources";

pub const DEFAULT_PAGE_SIZE: usize = 50;

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("post source rate limit exhausted")]
    RateLimited,
    #[error("post source fetch failed: {0}")]
    Fetch(#[source] FetchError),
    #[error("post source returned an invalid page: {0}")]
    Decode(String),
}

impl From<FetchError> for SourceError {
    fn from(err: FetchError) -> Self {
        if err.status() == Some(429) {
            Self::RateLimited
        } else {
            Self::Fetch(err)
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PostPage {
    pub posts: Vec<Post>,
    pub has_next: bool,
}

/// Paginated, newest-first listing of forum posts.
#[async_trait]
pub trait PostSource: Send + Sync {
    async fn fetch_page(&self, skip: usize, limit: usize) -> Result<PostPage, SourceError>;
}

/// Lazy newest-first walk over a [`PostSource`].
///
/// Ends before the post whose id equals `stop_at_id`, after `max_posts` posts,
/// or when the source has no further page. Not seekable; build a new stream to restart.
pub struct PostStream<'a> {
    source: &'a dyn PostSource,
    stop_at_id: Option<String>,
    max_posts: usize,
    page_size: usize,
    buffer: VecDeque<Post>,
    skip: usize,
    yielded: usize,
    has_next: bool,
    finished: bool,
}

impl<'a> PostStream<'a> {
    pub fn new(
        source: &'a dyn PostSource,
        stop_at_id: Option<String>,
        max_posts: usize,
        page_size: usize,
    ) -> Self {
        Self {
            source,
            stop_at_id,
            max_posts,
            page_size: page_size.max(1),
            buffer: VecDeque::new(),
            skip: 0,
            yielded: 0,
            has_next: true,
            finished: false,
        }
    }

    pub fn yielded(&self) -> usize {
        self.yielded
    }

    pub async fn next(&mut self) -> Result<Option<Post>, SourceError> {
        if self.finished {
            return Ok(None);
        }
        if self.yielded >= self.max_posts {
            self.finished = true;
            return Ok(None);
        }

        if self.buffer.is_empty() {
            if !self.has_next {
                self.finished = true;
                return Ok(None);
            }
            let limit = self.page_size.min(self.max_posts - self.yielded);
            let page = self.source.fetch_page(self.skip, limit).await?;
            debug!(skip = self.skip, received = page.posts.len(), has_next = page.has_next, "fetched post page");
            self.skip += page.posts.len();
            self.has_next = page.has_next && !page.posts.is_empty();
            self.buffer.extend(page.posts);
        }

        let Some(post) = self.buffer.pop_front() else {
            self.finished = true;
            return Ok(None);
        };
        if self.stop_at_id.as_deref() == Some(post.id.as_str()) {
            debug!(post_id = %post.id, "reached checkpoint cursor");
            self.finished = true;
            return Ok(None);
        }

        self.yielded += 1;
        Ok(Some(post))
    }
}

/// Start a newest-first walk that stops at `stop_at_id` (exclusive).
pub fn latest_posts<'a>(
    source: &'a dyn PostSource,
    stop_at_id: Option<&str>,
    max_posts: usize,
    page_size: usize,
) -> PostStream<'a> {
    PostStream::new(source, stop_at_id.map(ToString::to_string), max_posts, page_size)
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum WireId {
    Text(String),
    Number(i64),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WirePost {
    id: WireId,
    title: String,
    #[serde(default)]
    content: String,
    #[serde(default)]
    vote_count: i64,
    /// Epoch seconds.
    creation_date: i64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WirePage {
    #[serde(default)]
    posts: Vec<WirePost>,
    #[serde(default)]
    has_next: bool,
}

impl WirePost {
    fn into_post(self) -> Result<Post, SourceError> {
        let creation_date = DateTime::<Utc>::from_timestamp(self.creation_date, 0).ok_or_else(|| {
            SourceError::Decode(format!("creationDate {} out of range", self.creation_date))
        })?;
        let id = match self.id {
            WireId::Text(id) => id,
            WireId::Number(id) => id.to_string(),
        };
        Ok(Post {
            id,
            title: self.title,
            content: self.content,
            vote_count: self.vote_count,
            creation_date,
        })
    }
}

fn decode_page(bytes: &[u8]) -> Result<PostPage, SourceError> {
    let wire: WirePage =
        serde_json::from_slice(bytes).map_err(|e| SourceError::Decode(e.to_string()))?;
    let posts = wire
        .posts
        .into_iter()
        .map(WirePost::into_post)
        .collect::<Result<Vec<_>, _>>()?;
    Ok(PostPage {
        posts,
        has_next: wire.has_next,
    })
}

/// Load a single page in the post API wire format from disk.
pub fn load_posts_fixture(path: impl AsRef<Path>) -> Result<Vec<Post>> {
    let path = path.as_ref();
    let data = fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    let page = decode_page(&data).with_context(|| format!("parsing {}", path.display()))?;
    Ok(page.posts)
}

/// `GET {endpoint}?skip=N&first=M` returning `{ "posts": [...], "hasNext": bool }`.
#[derive(Debug)]
pub struct HttpPostSource {
    endpoint: String,
    http: HttpFetcher,
}

impl HttpPostSource {
    pub fn new(endpoint: impl Into<String>, http: HttpFetcher) -> Self {
        Self {
            endpoint: endpoint.into(),
            http,
        }
    }
}

#[async_trait]
impl PostSource for HttpPostSource {
    async fn fetch_page(&self, skip: usize, limit: usize) -> Result<PostPage, SourceError> {
        let query = [("skip", skip.to_string()), ("first", limit.to_string())];
        let resp = self
            .http
            .send("posts", &self.endpoint, |client| {
                client.get(&self.endpoint).query(&query)
            })
            .await?;
        decode_page(&resp.body)
    }
}

/// In-memory source over a fixed newest-first list.
#[derive(Debug, Default)]
pub struct VecPostSource {
    posts: Vec<Post>,
    pages_fetched: AtomicUsize,
}

impl VecPostSource {
    pub fn new(posts: Vec<Post>) -> Self {
        Self {
            posts,
            pages_fetched: AtomicUsize::new(0),
        }
    }

    pub fn pages_fetched(&self) -> usize {
        self.pages_fetched.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PostSource for VecPostSource {
    async fn fetch_page(&self, skip: usize, limit: usize) -> Result<PostPage, SourceError> {
        self.pages_fetched.fetch_add(1, Ordering::SeqCst);
        let posts = self
            .posts
            .iter()
            .skip(skip)
            .take(limit)
            .cloned()
            .collect::<Vec<_>>();
        let has_next = skip + posts.len() < self.posts.len();
        Ok(PostPage { posts, has_next })
    }
}

#[derive(Debug, Error)]
pub enum ExtractError {
    /// The provider's daily quota is spent; the whole run must stop.
    #[error("extraction quota exceeded")]
    QuotaExceeded,
    #[error("extraction failed: {0}")]
    Failed(String),
}

/// Turns one post into zero or more offer drafts.
#[async_trait]
pub trait OfferExtractor: Send + Sync {
    async fn extract(&self, post: &Post) -> Result<Vec<OfferDraft>, ExtractError>;
}

#[derive(Debug, Clone)]
pub struct LlmConfig {
    pub api_key: String,
    pub base_url: String,
    pub model: String,
    pub max_post_chars: usize,
}

impl LlmConfig {
    pub fn new(api_key: impl Into<String>, base_url: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            base_url: base_url.into(),
            model: model.into(),
            max_post_chars: 12_000,
        }
    }
}

const EXTRACTION_INSTRUCTIONS: &str = "You extract job offers from compensation posts. \
Reply with a JSON object {\"offers\": [...]} where each offer has the keys \
company, role, yoe, base_offer, total_offer, location, visa_sponsorship. \
Amounts are yearly numbers in the post's currency units (no suffixes), yoe is years of experience, \
visa_sponsorship is \"yes\", \"no\" or null. Use null for anything the post does not state. \
Return {\"offers\": []} when the post contains no offer.";

/// Chat-completions based extractor (OpenAI-compatible endpoint, JSON-object replies).
#[derive(Debug)]
pub struct LlmOfferExtractor {
    config: LlmConfig,
    endpoint: String,
    http: HttpFetcher,
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    temperature: f32,
    response_format: ResponseFormat,
    messages: Vec<ChatMessage<'a>>,
}

#[derive(Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    kind: &'static str,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: String,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatReply,
}

#[derive(Debug, Deserialize)]
struct ChatReply {
    content: Option<String>,
}

impl LlmOfferExtractor {
    /// Each `extract` call sends exactly one provider request: `http` is switched to
    /// single-attempt mode, so retries never spend provider quota behind the call budget.
    pub fn new(config: LlmConfig, http: HttpFetcher) -> anyhow::Result<Self> {
        anyhow::ensure!(!config.api_key.trim().is_empty(), "missing extractor API key");
        anyhow::ensure!(!config.model.trim().is_empty(), "missing extractor model name");
        let endpoint = format!("{}/chat/completions", config.base_url.trim_end_matches('/'));
        Ok(Self {
            config,
            endpoint,
            http: http.single_attempt(),
        })
    }

    fn prompt_for(&self, post: &Post) -> String {
        let body = post
            .content
            .chars()
            .take(self.config.max_post_chars)
            .collect::<String>();
        format!("Title: {}\n\n{}", post.title, body)
    }
}

#[async_trait]
impl OfferExtractor for LlmOfferExtractor {
    async fn extract(&self, post: &Post) -> Result<Vec<OfferDraft>, ExtractError> {
        let request = ChatRequest {
            model: &self.config.model,
            temperature: 0.0,
            response_format: ResponseFormat {
                kind: "json_object",
            },
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: EXTRACTION_INSTRUCTIONS.to_string(),
                },
                ChatMessage {
                    role: "user",
                    content: self.prompt_for(post),
                },
            ],
        };

        let resp = self
            .http
            .send("extractor", &self.endpoint, |client| {
                client
                    .post(&self.endpoint)
                    .bearer_auth(self.config.api_key.trim())
                    .json(&request)
            })
            .await
            .map_err(|err| match err.status() {
                Some(429) => ExtractError::QuotaExceeded,
                _ => ExtractError::Failed(err.to_string()),
            })?;

        let parsed: ChatResponse = serde_json::from_slice(&resp.body)
            .map_err(|e| ExtractError::Failed(format!("invalid completion payload: {e}")))?;
        let content = parsed
            .choices
            .into_iter()
            .find_map(|c| c.message.content)
            .ok_or_else(|| ExtractError::Failed("completion missing message content".into()))?;
        parse_offer_reply(&content)
    }
}

/// Parse a model reply into drafts. Accepts a bare array, `{"offers": [...]}`,
/// and replies wrapped in markdown code fences.
pub fn parse_offer_reply(reply: &str) -> Result<Vec<OfferDraft>, ExtractError> {
    let trimmed = strip_code_fence(reply);
    let value: JsonValue = serde_json::from_str(trimmed)
        .map_err(|e| ExtractError::Failed(format!("reply is not JSON: {e}")))?;
    let items = match &value {
        JsonValue::Array(items) => items.as_slice(),
        JsonValue::Object(_) => match value.get("offers") {
            Some(JsonValue::Array(items)) => items.as_slice(),
            Some(JsonValue::Null) | None => &[],
            Some(_) => return Err(ExtractError::Failed("\"offers\" is not an array".into())),
        },
        _ => return Err(ExtractError::Failed("reply is neither an array nor an object".into())),
    };

    Ok(items
        .iter()
        .filter(|item| item.is_object())
        .map(draft_from_json)
        .filter(|draft| *draft != OfferDraft::default())
        .collect())
}

fn strip_code_fence(reply: &str) -> &str {
    let trimmed = reply.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let rest = rest.strip_prefix("json").unwrap_or(rest);
    rest.strip_suffix("```").unwrap_or(rest).trim()
}

fn draft_from_json(value: &JsonValue) -> OfferDraft {
    OfferDraft {
        company: json_text(value, "company"),
        role: json_text(value, "role"),
        yoe: json_number(value, "yoe"),
        base_offer: json_number(value, "base_offer"),
        total_offer: json_number(value, "total_offer"),
        location: json_text(value, "location"),
        visa_sponsorship: json_text(value, "visa_sponsorship")
            .and_then(|s| VisaSponsorship::parse_lenient(&s)),
    }
}

fn json_text(value: &JsonValue, key: &str) -> Option<String> {
    let text = value.get(key)?.as_str()?.trim();
    if text.is_empty() || text.eq_ignore_ascii_case("null") || text.eq_ignore_ascii_case("unknown") {
        None
    } else {
        Some(text.to_string())
    }
}

fn json_number(value: &JsonValue, key: &str) -> Option<f64> {
    let number = match value.get(key)? {
        JsonValue::Number(n) => n.as_f64(),
        JsonValue::String(s) => s.replace([',', '$', '_'], "").trim().parse::<f64>().ok(),
        _ => None,
    };
    number.filter(|n| n.is_finite())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::extract::{Query, State};
    use axum::http::{HeaderMap, StatusCode};
    use axum::routing::{get, post};
    use axum::{Json, Router};
    use chrono::TimeZone;
    use leetoffer_storage::{BackoffPolicy, HttpClientConfig};
    use std::collections::HashMap;
    use std::sync::{Arc, Mutex};
    use tokio::net::TcpListener;

    fn mk_post(id: &str, minutes_ago: i64) -> Post {
        Post {
            id: id.to_string(),
            title: format!("post {id}"),
            content: String::new(),
            vote_count: 0,
            creation_date: Utc.with_ymd_and_hms(2025, 1, 1, 12, 0, 0).single().unwrap()
                - chrono::Duration::minutes(minutes_ago),
        }
    }

    fn posts(n: usize) -> Vec<Post> {
        (0..n).map(|i| mk_post(&format!("p{i}"), i as i64)).collect()
    }

    async fn drain(stream: &mut PostStream<'_>) -> Vec<String> {
        let mut ids = Vec::new();
        while let Some(post) = stream.next().await.unwrap() {
            ids.push(post.id);
        }
        ids
    }

    async fn spawn(app: Router) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}")
    }

    fn http(retry_rate_limited: bool) -> HttpFetcher {
        HttpFetcher::new(HttpClientConfig {
            backoff: BackoffPolicy::none(),
            retry_rate_limited,
            ..Default::default()
        })
        .unwrap()
    }

    #[tokio::test]
    async fn stream_stops_before_cursor_post() {
        let source = VecPostSource::new(posts(6));
        let mut stream = latest_posts(&source, Some("p3"), 100, 2);
        assert_eq!(drain(&mut stream).await, vec!["p0", "p1", "p2"]);
        assert_eq!(stream.yielded(), 3);
        assert!(stream.next().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn stream_with_cursor_at_newest_post_is_empty() {
        let source = VecPostSource::new(posts(3));
        let mut stream = latest_posts(&source, Some("p0"), 100, 10);
        assert!(drain(&mut stream).await.is_empty());
    }

    #[tokio::test]
    async fn stream_caps_at_max_posts_and_fetches_lazily() {
        let source = VecPostSource::new(posts(50));
        let mut stream = latest_posts(&source, None, 7, 3);
        assert_eq!(drain(&mut stream).await.len(), 7);
        // 3 + 3 + 1
        assert_eq!(source.pages_fetched(), 3);

        let source = VecPostSource::new(posts(50));
        let mut stream = latest_posts(&source, None, 100, 10);
        stream.next().await.unwrap();
        assert_eq!(source.pages_fetched(), 1);
    }

    #[tokio::test]
    async fn stream_ends_when_source_is_exhausted() {
        let source = VecPostSource::new(posts(5));
        let mut stream = latest_posts(&source, Some("missing"), 100, 2);
        assert_eq!(drain(&mut stream).await.len(), 5);
        assert_eq!(source.pages_fetched(), 3);
    }

    #[tokio::test]
    async fn http_source_paginates_with_skip_and_first() {
        async fn page(Query(q): Query<HashMap<String, usize>>) -> Json<JsonValue> {
            let skip = q["skip"];
            let first = q["first"];
            let total = 5usize;
            let posts = (skip..(skip + first).min(total))
                .map(|i| {
                    serde_json::json!({
                        "id": 1000 - i,
                        "title": format!("t{i}"),
                        "content": "body",
                        "voteCount": 1,
                        "creationDate": 1_700_000_000 - (i as i64) * 60,
                    })
                })
                .collect::<Vec<_>>();
            Json(serde_json::json!({ "posts": posts, "hasNext": skip + first < total }))
        }

        let base = spawn(Router::new().route("/posts", get(page))).await;
        let source = HttpPostSource::new(format!("{base}/posts"), http(true));
        let mut stream = latest_posts(&source, Some("997"), 100, 2);
        assert_eq!(drain(&mut stream).await, vec!["1000", "999", "998"]);
    }

    #[tokio::test]
    async fn http_source_maps_rate_limit_and_failures() {
        async fn limited() -> StatusCode {
            StatusCode::TOO_MANY_REQUESTS
        }
        async fn broken() -> StatusCode {
            StatusCode::BAD_GATEWAY
        }
        async fn garbage() -> &'static str {
            "not json"
        }
        let base = spawn(
            Router::new()
                .route("/limited", get(limited))
                .route("/broken", get(broken))
                .route("/garbage", get(garbage)),
        )
        .await;

        let limited = HttpPostSource::new(format!("{base}/limited"), http(false));
        assert!(matches!(limited.fetch_page(0, 10).await, Err(SourceError::RateLimited)));

        let broken = HttpPostSource::new(format!("{base}/broken"), http(false));
        assert!(matches!(broken.fetch_page(0, 10).await, Err(SourceError::Fetch(_))));

        let garbage = HttpPostSource::new(format!("{base}/garbage"), http(false));
        assert!(matches!(garbage.fetch_page(0, 10).await, Err(SourceError::Decode(_))));
    }

    #[test]
    fn reply_parser_normalizes_fields() {
        let drafts = parse_offer_reply(
            r#"```json
{"offers": [
  {"company": "Google", "role": "L4", "yoe": "3", "base_offer": 180000, "total_offer": "$250,000",
   "location": " ", "visa_sponsorship": "Yes"},
  {"company": null, "role": null, "yoe": null, "base_offer": null, "total_offer": null,
   "location": null, "visa_sponsorship": null}
]}
```"#,
        )
        .unwrap();
        assert_eq!(drafts.len(), 1);
        let d = &drafts[0];
        assert_eq!(d.company.as_deref(), Some("Google"));
        assert_eq!(d.yoe, Some(3.0));
        assert_eq!(d.total_offer, Some(250_000.0));
        assert_eq!(d.location, None);
        assert_eq!(d.visa_sponsorship, Some(VisaSponsorship::Yes));
    }

    #[test]
    fn reply_parser_accepts_bare_arrays_and_empty_results() {
        assert_eq!(parse_offer_reply(r#"[{"company":"Meta"}]"#).unwrap().len(), 1);
        assert!(parse_offer_reply(r#"{"offers": []}"#).unwrap().is_empty());
        assert!(parse_offer_reply(r#"{}"#).unwrap().is_empty());
        assert!(matches!(parse_offer_reply("sorry"), Err(ExtractError::Failed(_))));
        assert!(matches!(parse_offer_reply(r#"{"offers": 3}"#), Err(ExtractError::Failed(_))));
    }

    #[derive(Clone, Default)]
    struct FakeLlm {
        auth: Arc<Mutex<Vec<Option<String>>>>,
        requests: Arc<Mutex<Vec<JsonValue>>>,
    }

    async fn completions(
        State(state): State<FakeLlm>,
        headers: HeaderMap,
        Json(body): Json<JsonValue>,
    ) -> Result<Json<JsonValue>, StatusCode> {
        state.auth.lock().unwrap().push(
            headers
                .get("authorization")
                .and_then(|v| v.to_str().ok())
                .map(ToString::to_string),
        );
        let user = body["messages"][1]["content"].as_str().unwrap_or_default().to_string();
        state.requests.lock().unwrap().push(body);
        if user.contains("QUOTA") {
            return Err(StatusCode::TOO_MANY_REQUESTS);
        }
        if user.contains("BROKEN") {
            return Err(StatusCode::INTERNAL_SERVER_ERROR);
        }
        let reply = if user.contains("offer") {
            r#"{"offers":[{"company":"Stripe","role":"SWE","total_offer":300000}]}"#
        } else {
            r#"{"offers":[]}"#
        };
        Ok(Json(serde_json::json!({
            "choices": [{ "message": { "role": "assistant", "content": reply } }]
        })))
    }

    async fn llm_extractor(state: FakeLlm) -> LlmOfferExtractor {
        let base = spawn(
            Router::new()
                .route("/v1/chat/completions", post(completions))
                .with_state(state),
        )
        .await;
        LlmOfferExtractor::new(LlmConfig::new("k-123", format!("{base}/v1"), "test-model"), http(false))
            .unwrap()
    }

    #[tokio::test]
    async fn llm_extractor_returns_drafts_and_sends_bearer_token() {
        let state = FakeLlm::default();
        let extractor = llm_extractor(state.clone()).await;

        let mut post = mk_post("p1", 0);
        post.title = "Stripe offer".into();
        let drafts = extractor.extract(&post).await.unwrap();
        assert_eq!(drafts.len(), 1);
        assert_eq!(drafts[0].company.as_deref(), Some("Stripe"));

        post.title = "interview experience".into();
        assert!(extractor.extract(&post).await.unwrap().is_empty());

        assert_eq!(state.auth.lock().unwrap()[0].as_deref(), Some("Bearer k-123"));
        let requests = state.requests.lock().unwrap();
        assert_eq!(requests[0]["model"], "test-model");
        assert_eq!(requests[0]["response_format"]["type"], "json_object");
    }

    #[tokio::test]
    async fn llm_extractor_distinguishes_quota_from_other_failures() {
        let extractor = llm_extractor(FakeLlm::default()).await;

        let mut post = mk_post("p1", 0);
        post.title = "QUOTA".into();
        assert!(matches!(extractor.extract(&post).await, Err(ExtractError::QuotaExceeded)));

        post.title = "BROKEN".into();
        assert!(matches!(extractor.extract(&post).await, Err(ExtractError::Failed(_))));
    }

    async fn always_unavailable(State(hits): State<Arc<Mutex<usize>>>) -> StatusCode {
        *hits.lock().unwrap() += 1;
        StatusCode::SERVICE_UNAVAILABLE
    }

    #[tokio::test]
    async fn llm_extractor_sends_one_request_per_call_even_with_retrying_client() {
        let hits = Arc::new(Mutex::new(0usize));
        let base = spawn(
            Router::new()
                .route("/v1/chat/completions", post(always_unavailable))
                .with_state(hits.clone()),
        )
        .await;
        let retrying = HttpFetcher::new(HttpClientConfig {
            backoff: BackoffPolicy {
                max_retries: 3,
                base_delay: std::time::Duration::from_millis(1),
                max_delay: std::time::Duration::from_millis(5),
            },
            ..Default::default()
        })
        .unwrap();
        let extractor =
            LlmOfferExtractor::new(LlmConfig::new("k", format!("{base}/v1"), "m"), retrying).unwrap();

        let result = extractor.extract(&mk_post("p1", 0)).await;
        assert!(matches!(result, Err(ExtractError::Failed(_))));
        assert_eq!(*hits.lock().unwrap(), 1);
    }

    #[test]
    fn llm_extractor_requires_key_and_model() {
        assert!(LlmOfferExtractor::new(LlmConfig::new(" ", "http://x", "m"), http(false)).is_err());
        assert!(LlmOfferExtractor::new(LlmConfig::new("k", "http://x", ""), http(false)).is_err());
    }
}
