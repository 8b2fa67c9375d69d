//! Read API over reconciled pricing data, plus the alert subscription flow.

use std::borrow::Cow;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use axum::{
    extract::{Path, Query, State},
    http::{header, StatusCode, Uri},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use gpuwatch_core::jobs::JobPayload;
use gpuwatch_core::listing::{GpuComparison, InstanceFilter, InstanceListing, InstanceSort};
use gpuwatch_core::NewAlertSubscription;
use gpuwatch_storage::{
    BackoffPolicy, CacheBackend, EnqueueOptions, JobQueue, MemoryCache, PgJobQueue, PgStore,
    ReadStore, RedisCache, StoreError, SubscriptionOutcome,
};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;
use tokio::net::TcpListener;
use tracing::{error, info, warn};

pub mod cache;
pub mod config;

pub use cache::{cache_key, CacheStatus, Cached, CachedBody, ReadThroughCache, ReadThroughError};
pub use config::WebConfig;

pub const CRATE_NAME: &str = "gpuwatch-web";

const DEFAULT_LIMIT: usize = 500;
const MAX_LIMIT: usize = 1_000;
const COMPARE_LIMIT: usize = 5_000;
const DEFAULT_HISTORY_DAYS: i64 = 30;
const MAX_HISTORY_DAYS: i64 = 365;

static EMAIL_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s]+$").expect("valid email regex"));

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn ReadStore>,
    pub cache: Arc<ReadThroughCache>,
    /// Confirmation emails are enqueued here when set.
    pub queue: Option<Arc<dyn JobQueue>>,
    pub public_url: String,
}

impl AppState {
    pub fn new(store: Arc<dyn ReadStore>, cache: Arc<ReadThroughCache>, public_url: impl Into<String>) -> Self {
        Self {
            store,
            cache,
            queue: None,
            public_url: public_url.into(),
        }
    }

    pub fn with_queue(mut self, queue: Arc<dyn JobQueue>) -> Self {
        self.queue = Some(queue);
        self
    }

    fn link(&self, path: &str) -> String {
        format!("{}{path}", self.public_url.trim_end_matches('/'))
    }
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{message}")]
    BadRequest { code: &'static str, message: String },
    #[error("{0} not found")]
    NotFound(&'static str),
    #[error("timed out after {0:?} waiting for an in-flight fetch")]
    CacheWaitTimeout(Duration),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl ApiError {
    fn bad_request(code: &'static str, message: impl Into<String>) -> Self {
        Self::BadRequest {
            code,
            message: message.into(),
        }
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        Self::Internal(err.into())
    }
}

impl From<ReadThroughError> for ApiError {
    fn from(err: ReadThroughError) -> Self {
        match err {
            ReadThroughError::WaitTimeout(waited) => Self::CacheWaitTimeout(waited),
            ReadThroughError::Origin(err) => Self::Internal(err),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, body) = match &self {
            Self::BadRequest { code, message } => (
                StatusCode::BAD_REQUEST,
                json!({ "error": code, "message": message }),
            ),
            Self::NotFound(code) => (StatusCode::NOT_FOUND, json!({ "error": code })),
            Self::CacheWaitTimeout(_) => (
                StatusCode::GATEWAY_TIMEOUT,
                json!({ "error": "cache_wait_timeout" }),
            ),
            Self::Internal(err) => {
                error!(error = %format!("{err:#}"), "request failed");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    json!({ "error": "internal_error" }),
                )
            }
        };
        (status, Json(body)).into_response()
    }
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/api/instances", get(instances_handler))
        .route("/api/instances/export.csv", get(instances_csv_handler))
        .route("/api/gpus/{slug}/compare", get(compare_handler))
        .route("/api/gpus/{slug}/history", get(history_handler))
        .route("/api/alerts", post(subscribe_handler))
        .route("/api/alerts/confirm/{token}", get(confirm_handler))
        .route("/api/alerts/unsubscribe/{token}", get(unsubscribe_handler))
        .with_state(Arc::new(state))
}

pub async fn serve(config: &WebConfig, state: AppState) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", config.port))
        .await
        .with_context(|| format!("binding port {}", config.port))?;
    info!(port = config.port, "gpuwatch web listening");
    axum::serve(listener, app(state))
        .with_graceful_shutdown(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!(error = %err, "failed to listen for shutdown signal");
            }
        })
        .await?;
    Ok(())
}

/// Builds Postgres-backed state from the environment and serves until Ctrl-C.
pub async fn serve_from_env() -> anyhow::Result<()> {
    let config = WebConfig::from_env();
    let store = PgStore::connect(&config.database_url, 10)
        .await
        .context("connecting to database")?;
    let queue = PgJobQueue::new(store.pool().clone(), BackoffPolicy::default());
    let backend: Arc<dyn CacheBackend> = match config.redis_url.as_deref() {
        Some(url) => Arc::new(RedisCache::new(url, Duration::from_millis(500)).context("connecting to redis")?),
        None => {
            info!("REDIS_URL not set, using in-process cache");
            Arc::new(MemoryCache::default())
        }
    };
    let cache = ReadThroughCache::new(
        backend,
        config.cache_ttl(),
        config.negative_cache_ttl(),
        config.cache_wait(),
    );
    let state = AppState::new(Arc::new(store), Arc::new(cache), config.public_url.clone())
        .with_queue(Arc::new(queue));
    serve(&config, state).await
}

fn request_key(uri: &Uri) -> String {
    cache_key(uri.path_and_query().map_or(uri.path(), |pq| pq.as_str()))
}

fn cached_response(cached: Cached, content_type: &'static str) -> Response {
    (
        [
            (header::CONTENT_TYPE, content_type),
            (header::HeaderName::from_static("x-cache"), cached.status.as_str()),
        ],
        cached.body,
    )
        .into_response()
}

async fn health_handler() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

#[derive(Debug, Default, Deserialize)]
struct InstancesQuery {
    gpu: Option<String>,
    provider: Option<String>,
    available: Option<bool>,
    sort: Option<String>,
    limit: Option<usize>,
}

fn slug_param(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_ascii_lowercase)
}

impl InstancesQuery {
    fn filter(&self) -> Result<InstanceFilter, ApiError> {
        let sort = match self.sort.as_deref().map(str::trim) {
            None | Some("") => InstanceSort::default(),
            Some(raw) => InstanceSort::parse(raw).ok_or_else(|| {
                ApiError::bad_request("invalid_sort", format!("unknown sort `{raw}`"))
            })?,
        };
        Ok(InstanceFilter {
            gpu_slug: slug_param(self.gpu.as_deref()),
            provider_slug: slug_param(self.provider.as_deref()),
            available_only: self.available.unwrap_or(false),
            sort,
            limit: self.limit.unwrap_or(DEFAULT_LIMIT).clamp(1, MAX_LIMIT),
        })
    }
}

async fn instances_handler(
    State(state): State<Arc<AppState>>,
    uri: Uri,
    Query(query): Query<InstancesQuery>,
) -> Result<Response, ApiError> {
    let filter = query.filter()?;
    let store = state.store.clone();
    let cached = state
        .cache
        .get_or_load(&request_key(&uri), || async move {
            let rows = store.list_instances(&filter).await?;
            Ok::<_, anyhow::Error>(CachedBody::json(&rows)?)
        })
        .await?;
    Ok(cached_response(cached, "application/json"))
}

async fn instances_csv_handler(
    State(state): State<Arc<AppState>>,
    uri: Uri,
    Query(query): Query<InstancesQuery>,
) -> Result<Response, ApiError> {
    let filter = query.filter()?;
    let store = state.store.clone();
    let cached = state
        .cache
        .get_or_load(&request_key(&uri), || async move {
            let rows = store.list_instances(&filter).await?;
            Ok::<_, anyhow::Error>(CachedBody::text(render_csv(&rows), rows.is_empty()))
        })
        .await?;
    let mut resp = cached_response(cached, "text/csv; charset=utf-8");
    resp.headers_mut().insert(
        header::CONTENT_DISPOSITION,
        header::HeaderValue::from_static("attachment; filename=\"gpuwatch-instances.csv\""),
    );
    Ok(resp)
}

const CSV_HEADER: &str = "provider,gpu,instance_type,gpu_count,price_per_hour,price_per_hour_spot,price_per_gpu_hour,regions,availability,last_scraped_at";

fn csv_field(value: &str) -> Cow<'_, str> {
    if value.contains([',', '"', '\n', '\r']) {
        Cow::Owned(format!("\"{}\"", value.replace('"', "\"\"")))
    } else {
        Cow::Borrowed(value)
    }
}

/// Same rows as `/api/instances`, one line each.
pub fn render_csv(rows: &[InstanceListing]) -> String {
    let mut out = String::with_capacity(CSV_HEADER.len() + rows.len() * 128);
    out.push_str(CSV_HEADER);
    out.push('\n');
    for row in rows {
        let spot = row
            .price_per_hour_spot
            .map(|p| p.to_string())
            .unwrap_or_default();
        let regions = row.regions.join(";");
        let fields = [
            csv_field(&row.provider_slug),
            csv_field(&row.gpu_slug),
            csv_field(&row.instance_type),
            Cow::Owned(row.gpu_count.to_string()),
            Cow::Owned(row.price_per_hour.to_string()),
            Cow::Owned(spot),
            Cow::Owned(format!("{:.4}", row.price_per_gpu_hour)),
            csv_field(&regions),
            Cow::Borrowed(row.availability_status.as_str()),
            Cow::Owned(row.last_scraped_at.to_rfc3339()),
        ];
        out.push_str(&fields.join(","));
        out.push('\n');
    }
    out
}

async fn compare_handler(
    State(state): State<Arc<AppState>>,
    uri: Uri,
    Path(slug): Path<String>,
) -> Result<Response, ApiError> {
    let store = state.store.clone();
    let slug = slug.trim().to_ascii_lowercase();
    let cached = state
        .cache
        .get_or_load(&request_key(&uri), || async move {
            // Unknown GPUs and GPUs without active offerings both serve `null`.
            let Some(gpu) = store.gpu_model_by_slug(&slug).await? else {
                return Ok(CachedBody::json(&serde_json::Value::Null)?);
            };
            let filter = InstanceFilter {
                gpu_slug: Some(slug),
                limit: COMPARE_LIMIT,
                ..InstanceFilter::default()
            };
            let listings = store.list_instances(&filter).await?;
            Ok::<_, anyhow::Error>(CachedBody::json(&GpuComparison::build(gpu, listings))?)
        })
        .await?;
    Ok(cached_response(cached, "application/json"))
}

#[derive(Debug, Default, Deserialize)]
struct HistoryQuery {
    days: Option<i64>,
}

async fn history_handler(
    State(state): State<Arc<AppState>>,
    uri: Uri,
    Path(slug): Path<String>,
    Query(query): Query<HistoryQuery>,
) -> Result<Response, ApiError> {
    let days = query
        .days
        .unwrap_or(DEFAULT_HISTORY_DAYS)
        .clamp(1, MAX_HISTORY_DAYS);
    let store = state.store.clone();
    let slug = slug.trim().to_ascii_lowercase();
    let cached = state
        .cache
        .get_or_load(&request_key(&uri), || async move {
            let Some(gpu) = store.gpu_model_by_slug(&slug).await? else {
                return Ok(CachedBody::json(&Vec::<()>::new())?);
            };
            let since = Utc::now() - chrono::Duration::days(days);
            let points = store.price_history(gpu.id, since).await?;
            Ok::<_, anyhow::Error>(CachedBody::json(&points)?)
        })
        .await?;
    Ok(cached_response(cached, "application/json"))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SubscribeRequest {
    email: String,
    gpu_slug: String,
    provider_slug: Option<String>,
    target_price_per_gpu_hour: f64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SubscribeResponse {
    status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    confirm_url: Option<String>,
}

async fn subscribe_handler(
    State(state): State<Arc<AppState>>,
    Json(req): Json<SubscribeRequest>,
) -> Result<Response, ApiError> {
    let email = req.email.trim().to_ascii_lowercase();
    if email.len() > 254 || !EMAIL_RE.is_match(&email) {
        return Err(ApiError::bad_request("invalid_email", "email address is not valid"));
    }
    let target = req.target_price_per_gpu_hour;
    if !target.is_finite() || target <= 0.0 {
        return Err(ApiError::bad_request(
            "invalid_target_price",
            "targetPricePerGpuHour must be a positive number",
        ));
    }
    let gpu_slug = req.gpu_slug.trim().to_ascii_lowercase();
    let gpu = state
        .store
        .gpu_model_by_slug(&gpu_slug)
        .await?
        .ok_or_else(|| ApiError::bad_request("unknown_gpu", format!("unknown gpu `{gpu_slug}`")))?;
    let provider_id = match slug_param(req.provider_slug.as_deref()) {
        Some(slug) => Some(
            state
                .store
                .provider_by_slug(&slug)
                .await?
                .filter(|p| p.is_active)
                .ok_or_else(|| ApiError::bad_request("unknown_provider", format!("unknown provider `{slug}`")))?
                .id,
        ),
        None => None,
    };

    let outcome = state
        .store
        .create_subscription(&NewAlertSubscription {
            email,
            gpu_model_id: gpu.id,
            provider_id,
            target_price_per_gpu_hour: target,
        })
        .await?;

    match outcome {
        SubscriptionOutcome::PendingConfirmation(sub) => {
            let confirm_url = state.link(&format!("/api/alerts/confirm/{}", sub.confirmation_token));
            if let Some(queue) = &state.queue {
                let payload = JobPayload::Email {
                    to: sub.email.clone(),
                    subject: format!("Confirm your {} price alert", gpu.name),
                    text: format!(
                        "Confirm your alert for {} at or below ${:.2}/GPU-hour:\n{confirm_url}\n",
                        gpu.name, sub.target_price_per_gpu_hour
                    ),
                };
                if let Err(err) = queue.enqueue(&payload, EnqueueOptions::default()).await {
                    warn!(subscription_id = %sub.id, error = %err, "failed to enqueue confirmation email");
                }
            }
            let body = SubscribeResponse {
                status: "pending_confirmation",
                confirm_url: Some(confirm_url),
            };
            Ok((StatusCode::CREATED, Json(body)).into_response())
        }
        SubscriptionOutcome::AlreadyConfirmed(_) => Ok(Json(SubscribeResponse {
            status: "already_confirmed",
            confirm_url: None,
        })
        .into_response()),
    }
}

async fn confirm_handler(
    State(state): State<Arc<AppState>>,
    Path(token): Path<String>,
) -> Result<Response, ApiError> {
    match state.store.confirm_subscription(&token, Utc::now()).await? {
        Some(sub) => {
            info!(subscription_id = %sub.id, "alert subscription confirmed");
            Ok(Json(json!({ "status": "confirmed" })).into_response())
        }
        None => Err(ApiError::NotFound("invalid_token")),
    }
}

async fn unsubscribe_handler(
    State(state): State<Arc<AppState>>,
    Path(token): Path<String>,
) -> Result<Response, ApiError> {
    if state.store.unsubscribe(&token).await? {
        Ok(Json(json!({ "status": "unsubscribed" })).into_response())
    } else {
        Err(ApiError::NotFound("invalid_token"))
    }
}
