//! Read-only JSON API over the offers dataset and checkpoint.

use std::sync::Arc;

use axum::{
    extract::{Query, State},
    http::StatusCode,
    routing::get,
    Json, Router,
};
use leetoffer_core::{Checkpoint, Offer};
use leetoffer_ingest::{CheckpointStore, DatasetStore, IngestConfig};
use leetoffer_storage::{DocumentStore, TieredStore, WritePolicy};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tracing::{info, warn};

pub const CRATE_NAME: &str = "leetoffer-web";

#[derive(Debug, Clone)]
pub struct WebConfig {
    pub port: u16,
    pub store: IngestConfig,
}

impl WebConfig {
    pub fn from_env() -> Self {
        let port = std::env::var("LEETOFFER_WEB_PORT")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(8000);
        Self {
            port,
            store: IngestConfig::from_env(),
        }
    }
}

#[derive(Clone)]
pub struct AppState {
    pub dataset: DatasetStore,
    pub checkpoints: CheckpointStore,
}

impl AppState {
    /// Local copy first, remote copy as fallback.
    pub fn new(local: Arc<dyn DocumentStore>, remote: Arc<dyn DocumentStore>) -> Self {
        let tiers = TieredStore::new()
            .with_tier(local, WritePolicy::Required)
            .with_tier(remote, WritePolicy::BestEffort);
        Self {
            dataset: DatasetStore::new(tiers.clone()),
            checkpoints: CheckpointStore::new(tiers),
        }
    }
}

#[derive(Debug, Deserialize, Default)]
struct OffersQuery {
    company: Option<String>,
    page: Option<usize>,
    per_page: Option<usize>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct OffersPage {
    pub offers: Vec<Offer>,
    pub total: usize,
    pub page: usize,
    pub total_pages: usize,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz_handler))
        .route("/api/offers", get(offers_handler))
        .route("/api/status", get(status_handler))
        .with_state(Arc::new(state))
}

pub async fn serve_from_env() -> anyhow::Result<()> {
    let config = WebConfig::from_env();
    let state = AppState::new(
        Arc::new(config.store.local_store()),
        Arc::new(config.store.remote_store()?),
    );
    let listener = TcpListener::bind(("0.0.0.0", config.port)).await?;
    info!(port = config.port, "serving offers api");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

async fn healthz_handler() -> &'static str {
    "ok"
}

async fn offers_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<OffersQuery>,
) -> Result<Json<OffersPage>, (StatusCode, String)> {
    let offers = state.dataset.load().await.map_err(|err| {
        warn!(error = %err, "offers dataset unreadable");
        (StatusCode::INTERNAL_SERVER_ERROR, format!("Server error: {err}"))
    })?;
    Ok(Json(filtered_paginated_offers(offers, &query)))
}

async fn status_handler(State(state): State<Arc<AppState>>) -> Json<Option<Checkpoint>> {
    Json(state.checkpoints.load().await)
}

fn filtered_paginated_offers(all: Vec<Offer>, query: &OffersQuery) -> OffersPage {
    let company = query
        .company
        .as_deref()
        .map(str::trim)
        .filter(|c| !c.is_empty())
        .map(str::to_lowercase);

    let filtered = all
        .into_iter()
        .filter(|o| match &company {
            Some(wanted) => o
                .company
                .as_deref()
                .is_some_and(|c| c.to_lowercase() == *wanted),
            None => true,
        })
        .collect::<Vec<_>>();

    let total = filtered.len();
    let per_page = query.per_page.unwrap_or(20).max(1);
    let total_pages = total.max(1).div_ceil(per_page);
    let page = query.page.unwrap_or(1).clamp(1, total_pages);
    let start = (page - 1) * per_page;
    let offers = filtered.into_iter().skip(start).take(per_page).collect();

    OffersPage {
        offers,
        total,
        page,
        total_pages,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use chrono::{TimeZone, Utc};
    use http_body_util::BodyExt;
    use leetoffer_core::{OfferDraft, Post, CHECKPOINT_DOCUMENT, DATASET_DOCUMENT};
    use leetoffer_storage::{LocalFileStore, MemoryStore};
    use tempfile::tempdir;
    use tower::ServiceExt;

    fn offers(companies: &[&str]) -> Vec<Offer> {
        let post = Post {
            id: "42".into(),
            title: "offer thread".into(),
            content: String::new(),
            vote_count: 0,
            creation_date: Utc.with_ymd_and_hms(2025, 1, 2, 3, 4, 5).single().unwrap(),
        };
        companies
            .iter()
            .enumerate()
            .map(|(i, c)| {
                OfferDraft {
                    company: Some(c.to_string()),
                    total_offer: Some(100_000.0 + i as f64),
                    ..Default::default()
                }
                .stamp(&post)
            })
            .collect()
    }

    async fn get_json(app: Router, uri: &str) -> (StatusCode, serde_json::Value) {
        let resp = app
            .oneshot(axum::http::Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = resp.status();
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        (status, serde_json::from_slice(&body).unwrap())
    }

    #[tokio::test]
    async fn healthz_returns_ok() {
        let state = AppState::new(Arc::new(MemoryStore::new("local")), Arc::new(MemoryStore::new("gist")));
        let resp = app(state)
            .oneshot(axum::http::Request::builder().uri("/healthz").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"ok");
    }

    #[tokio::test]
    async fn missing_documents_are_empty_not_errors() {
        let dir = tempdir().unwrap();
        let state = AppState::new(
            Arc::new(LocalFileStore::new(dir.path())),
            Arc::new(MemoryStore::failing("gist")),
        );
        let app = app(state);

        let (status, body) = get_json(app.clone(), "/api/offers").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["offers"], serde_json::json!([]));
        assert_eq!(body["total"], 0);
        assert_eq!(body["total_pages"], 1);

        let (status, body) = get_json(app, "/api/status").await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.is_null());
    }

    #[tokio::test]
    async fn offers_are_filtered_and_paginated_from_local_file() {
        let dir = tempdir().unwrap();
        let data = offers(&["Google", "Meta", "google", "Stripe", "Google"]);
        std::fs::write(dir.path().join(DATASET_DOCUMENT), serde_json::to_vec(&data).unwrap()).unwrap();
        let state = AppState::new(Arc::new(LocalFileStore::new(dir.path())), Arc::new(MemoryStore::new("gist")));

        let (_, body) = get_json(app(state), "/api/offers?company=GOOGLE&per_page=2&page=2").await;
        assert_eq!(body["total"], 3);
        assert_eq!(body["page"], 2);
        assert_eq!(body["total_pages"], 2);
        let page = body["offers"].as_array().unwrap();
        assert_eq!(page.len(), 1);
        assert_eq!(page[0]["company"], "Google");
        assert_eq!(page[0]["total_offer"], 100_004.0);
    }

    #[tokio::test]
    async fn corrupt_dataset_is_a_server_error() {
        let local = MemoryStore::new("local").with_document(DATASET_DOCUMENT, "not json");
        let state = AppState::new(Arc::new(local), Arc::new(MemoryStore::new("gist")));
        let resp = app(state)
            .oneshot(axum::http::Request::builder().uri("/api/offers").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[tokio::test]
    async fn remote_copy_is_used_when_local_is_absent() {
        let remote = MemoryStore::new("gist")
            .with_document(DATASET_DOCUMENT, serde_json::to_vec(&offers(&["Airbnb"])).unwrap())
            .with_document(
                CHECKPOINT_DOCUMENT,
                r#"{"lastPostId":"42","lastFetchTime":1735787045000,"totalOffers":1}"#,
            );
        let state = AppState::new(Arc::new(MemoryStore::new("local")), Arc::new(remote));
        let app = app(state);

        let (_, body) = get_json(app.clone(), "/api/offers?page=9").await;
        assert_eq!(body["page"], 1);
        assert_eq!(body["offers"][0]["company"], "Airbnb");

        let (_, body) = get_json(app, "/api/status").await;
        assert_eq!(body["lastPostId"], "42");
        assert_eq!(body["totalOffers"], 1);
    }
}
