//! REST API for the dispatch server
//!
//! The HTTP surface is deliberately small: the endpoints that feed the
//! scheduler (task pickup and the report fallbacks) and the ones that
//! inspect or nudge it (next-send estimate, lead retry, stuck-task reset).
//! Campaign and lead CRUD lives elsewhere; the agent's primary path is the
//! WebSocket channel in `crate::ws`.

use axum::{
    extract::{DefaultBodyLimit, Path, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use shared::api::{
    endpoints, headers, CompletionReport, FailureReport, NextSendResponse, PickupRequest,
    PickupResponse, ResetTasksResponse, RetryLeadsRequest, RetryLeadsResponse,
};
use shared::config::ServerConfig;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, error, info, warn};

use crate::registry::AgentRegistry;
use crate::scheduler::{task_payload, Scheduler};
use crate::store::Store;
use crate::{reconcile, ws};

/// Simple rate limiter per sender
///
/// Tracks request timestamps per sender and enforces rate limits based on
/// a sliding window approach. Old requests outside the time window are
/// automatically cleaned up.
pub struct AgentRateLimiter {
    /// Map of sender ID to list of request timestamps
    limits: Arc<RwLock<HashMap<String, Vec<Instant>>>>,
    /// Time window for rate limiting
    window: Duration,
    /// Maximum number of requests allowed within the window
    max_requests: usize,
}

impl AgentRateLimiter {
    pub fn new(window: Duration, max_requests: usize) -> Self {
        Self {
            limits: Arc::new(RwLock::new(HashMap::new())),
            window,
            max_requests,
        }
    }

    /// Check if a request is allowed for the given caller id.
    pub async fn check_rate_limit(&self, caller_id: &str) -> Result<(), ApiError> {
        let now = Instant::now();
        let mut limits = self.limits.write().await;

        let requests = limits.entry(caller_id.to_string()).or_insert_with(Vec::new);
        requests.retain(|&time| now.duration_since(time) < self.window);

        if requests.len() >= self.max_requests {
            warn!(
                caller_id = %caller_id,
                count = requests.len(),
                max = self.max_requests,
                "Rate limit exceeded"
            );
            return Err(ApiError::TooManyRequests);
        }

        requests.push(now);
        Ok(())
    }

    /// Remove entries from callers that haven't sent requests within the
    /// window. Prevents unbounded memory growth from one-shot callers.
    pub async fn cleanup_stale_entries(&self) {
        let mut limits = self.limits.write().await;
        let now = Instant::now();

        let before_count = limits.len();
        limits.retain(|_, timestamps| {
            timestamps.retain(|&time| now.duration_since(time) < self.window);
            !timestamps.is_empty()
        });
        let removed = before_count.saturating_sub(limits.len());

        if removed > 0 {
            debug!(
                removed_callers = removed,
                remaining_callers = limits.len(),
                "Cleaned up stale rate limiter entries"
            );
        }
    }
}

impl Clone for AgentRateLimiter {
    fn clone(&self) -> Self {
        Self {
            limits: Arc::clone(&self.limits),
            window: self.window,
            max_requests: self.max_requests,
        }
    }
}

/// Application state shared across all API handlers
#[derive(Clone)]
pub struct AppState {
    /// Server configuration
    pub config: Arc<ServerConfig>,
    /// Per-sender rate limiter
    pub rate_limiter: AgentRateLimiter,
    /// Durable store handle
    pub store: Arc<Mutex<Store>>,
    /// In-memory agent connection registry
    pub registry: AgentRegistry,
    /// Scheduler handle for estimates
    pub scheduler: Arc<Scheduler>,
}

impl AppState {
    pub fn new(
        config: Arc<ServerConfig>,
        store: Arc<Mutex<Store>>,
        registry: AgentRegistry,
        scheduler: Arc<Scheduler>,
    ) -> Self {
        let rate_limiter = AgentRateLimiter::new(
            Duration::from_secs(u64::from(config.rate_limit_window_seconds)),
            config.rate_limit_max_requests,
        );

        Self {
            config,
            rate_limiter,
            store,
            registry,
            scheduler,
        }
    }
}

/// Creates the main API router and defines all the application's routes.
pub fn create_router(state: AppState) -> Router {
    // Maximum request body size: 1MB. Reports and pickup requests are small.
    const MAX_REQUEST_SIZE: usize = 1024 * 1024;

    Router::new()
        // Unauthenticated liveness endpoint for load balancers and
        // orchestrators.
        .route("/health", get(health_check))
        .route(endpoints::AGENT_WS, get(ws::handle_agent_ws))
        .route(endpoints::TASK_PICKUP, post(handle_task_pickup))
        .route(endpoints::TASK_COMPLETE, post(handle_task_complete))
        .route(endpoints::TASK_FAIL, post(handle_task_fail))
        .route(endpoints::CAMPAIGN_NEXT_SEND, get(handle_next_send))
        .route(endpoints::CAMPAIGN_RETRY_LEADS, post(handle_retry_leads))
        .route(endpoints::ACCOUNT_RESET_TASKS, post(handle_reset_tasks))
        .layer(DefaultBodyLimit::max(MAX_REQUEST_SIZE))
        .with_state(state)
}

/// Validates the API key from request headers.
///
/// Uses constant-time comparison to prevent timing attacks that could
/// allow an attacker to deduce the API key character-by-character.
pub fn validate_api_key(headers: &HeaderMap, expected_key: &str) -> Result<(), ApiError> {
    use subtle::ConstantTimeEq;

    let provided_key = match headers.get(headers::API_KEY) {
        Some(key) => match key.to_str() {
            Ok(key_str) => key_str,
            Err(_) => {
                warn!("Invalid API key format in header");
                return Err(ApiError::Unauthorized);
            }
        },
        None => {
            warn!("Missing API key header");
            return Err(ApiError::Unauthorized);
        }
    };

    if provided_key.is_empty() {
        warn!("Empty API key provided");
        return Err(ApiError::Unauthorized);
    }

    let provided_bytes = provided_key.as_bytes();
    let expected_bytes = expected_key.as_bytes();
    let keys_match = provided_bytes.len() == expected_bytes.len()
        && bool::from(provided_bytes.ct_eq(expected_bytes));

    if !keys_match {
        warn!("Invalid API key provided");
        return Err(ApiError::Unauthorized);
    }

    Ok(())
}

/// The caller id used for rate limiting: the sender header when present,
/// otherwise a shared bucket.
fn caller_id(headers: &HeaderMap) -> String {
    headers
        .get(headers::SENDER_ID)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("anonymous")
        .to_string()
}

async fn rate_limit(state: &AppState, headers: &HeaderMap) -> Result<(), ApiError> {
    if state.config.rate_limit_enabled {
        state.rate_limiter.check_rate_limit(&caller_id(headers)).await?;
    }
    Ok(())
}

/// The handler for the `/health` endpoint.
async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "healthy",
        "service": "dispatch-server",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

/// Sender-pull path: atomically pick up the oldest pending task for the
/// account, optionally scoped to the calling sender.
async fn handle_task_pickup(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<PickupRequest>,
) -> Result<Json<PickupResponse>, ApiError> {
    validate_api_key(&headers, &state.config.api_key)?;
    rate_limit(&state, &headers).await?;

    let now = shared::current_timestamp();
    let task = {
        let mut store = state.store.lock().await;
        store
            .pickup_task(&request.account_id, request.sender_id.as_deref(), now)
            .await
            .map_err(internal)?
    };

    if let Some(task) = &task {
        info!(
            account_id = %request.account_id,
            task_id = %task.id,
            attempts = task.attempts,
            "Task picked up over REST"
        );
    }

    Ok(Json(PickupResponse {
        task: task.as_ref().map(task_payload),
    }))
}

/// HTTP fallback for a completion report.
async fn handle_task_complete(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
    Json(report): Json<CompletionReport>,
) -> Result<StatusCode, ApiError> {
    validate_api_key(&headers, &state.config.api_key)?;
    rate_limit(&state, &headers).await?;

    let now = shared::current_timestamp();
    reconcile::handle_completion(&state.store, &state.registry, &id, &report, now)
        .await
        .map_err(|e| ApiError::NotFound(e.to_string()))?;
    Ok(StatusCode::OK)
}

/// HTTP fallback for a failure report.
async fn handle_task_fail(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
    Json(report): Json<FailureReport>,
) -> Result<StatusCode, ApiError> {
    validate_api_key(&headers, &state.config.api_key)?;
    rate_limit(&state, &headers).await?;

    let now = shared::current_timestamp();
    reconcile::handle_failure(&state.store, &state.registry, &state.config, &id, &report, now)
        .await
        .map_err(|e| ApiError::NotFound(e.to_string()))?;
    Ok(StatusCode::OK)
}

/// Jitter-free next-send estimate for UI polling.
async fn handle_next_send(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<NextSendResponse>, ApiError> {
    validate_api_key(&headers, &state.config.api_key)?;
    rate_limit(&state, &headers).await?;

    let estimate = state
        .scheduler
        .estimate_next_send(&id)
        .await
        .map_err(internal)?
        .ok_or_else(|| ApiError::NotFound(format!("Unknown campaign: {}", id)))?;
    Ok(Json(estimate))
}

/// Reset failed/skipped leads back to pending, recording the failing
/// sender on each lead.
async fn handle_retry_leads(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
    Json(request): Json<RetryLeadsRequest>,
) -> Result<Json<RetryLeadsResponse>, ApiError> {
    validate_api_key(&headers, &state.config.api_key)?;
    rate_limit(&state, &headers).await?;

    if request.lead_ids.is_empty() {
        return Err(ApiError::BadRequest("lead_ids must not be empty".to_string()));
    }

    let now = shared::current_timestamp();
    let reset = {
        let mut store = state.store.lock().await;
        store
            .get_campaign(&id)
            .await
            .map_err(internal)?
            .ok_or_else(|| ApiError::NotFound(format!("Unknown campaign: {}", id)))?;
        store
            .retry_leads(&id, &request.lead_ids, now)
            .await
            .map_err(internal)?
    };

    info!(campaign_id = %id, reset, "Leads reset for retry");
    Ok(Json(RetryLeadsResponse { reset }))
}

/// Operator escape hatch: fail every non-terminal task for the account and
/// return their queued leads to pending.
async fn handle_reset_tasks(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<ResetTasksResponse>, ApiError> {
    validate_api_key(&headers, &state.config.api_key)?;
    rate_limit(&state, &headers).await?;

    let now = shared::current_timestamp();
    let reclaimed = {
        let mut store = state.store.lock().await;
        store.reset_stuck_tasks(&id, now).await.map_err(internal)?
    };

    let leads_reset = reclaimed.iter().filter(|r| r.lead_released).count();
    info!(
        account_id = %id,
        tasks_failed = reclaimed.len(),
        leads_reset,
        "Stuck tasks reset"
    );
    Ok(Json(ResetTasksResponse {
        tasks_failed: reclaimed.len(),
        leads_reset,
    }))
}

fn internal(e: anyhow::Error) -> ApiError {
    error!(error = %e, "Request failed");
    ApiError::Internal(e.to_string())
}

/// API error type mapped onto HTTP status codes.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("Unauthorized")]
    Unauthorized,

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Too many requests")]
    TooManyRequests,

    #[error("Internal error: {0}")]
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            ApiError::Unauthorized => (StatusCode::UNAUTHORIZED, self.to_string()),
            ApiError::BadRequest(_) => (StatusCode::BAD_REQUEST, self.to_string()),
            ApiError::NotFound(_) => (StatusCode::NOT_FOUND, self.to_string()),
            ApiError::TooManyRequests => (StatusCode::TOO_MANY_REQUESTS, self.to_string()),
            ApiError::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, self.to_string()),
        };

        let body = Json(serde_json::json!({
            "status": "error",
            "error": message,
        }));
        (status, body).into_response()
    }
}
