//! HTTP server with the REST API for searching, polling and the
//! per-requester profile features.

use anyhow::Result;
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::Json,
    routing::{get, post},
    Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::{net::SocketAddr, sync::Arc};
use tower_http::trace::TraceLayer;
use tracing::{debug, info, instrument, warn};

use crate::{
    cache::CacheStats,
    item::{Filters, Item},
    middleware::{create_body_limit_layer, create_cors_layer, ApiError, Requester},
    orchestrator::{Orchestrator, SubmitOutcome},
    ranker::{ContentSimilarityRanker, RankedItem, Ranker, RecommendationModels},
    refresher::PeriodicRefresher,
    registry::{StatusReport, TaskId},
    settings::Settings,
    store::{self, ClickRecord, CouponsByStore, Store, TrackedItem, WishlistEntry},
};

/// Clicks shown on the profile page.
const PROFILE_CLICK_LIMIT: usize = 20;

/// Application state shared across HTTP handlers
#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<Orchestrator>,
    pub store: Arc<dyn Store>,
    pub ranker: Arc<dyn Ranker>,
    pub models: Arc<RecommendationModels>,
    pub settings: Arc<Settings>,
    pub started_at: DateTime<Utc>,
}

impl AppState {
    pub fn new(
        orchestrator: Arc<Orchestrator>,
        store: Arc<dyn Store>,
        ranker: Arc<dyn Ranker>,
        settings: Settings,
    ) -> Self {
        Self {
            orchestrator,
            store,
            ranker,
            models: Arc::new(RecommendationModels::new(settings.ranker.max_results)),
            settings: Arc::new(settings),
            started_at: Utc::now(),
        }
    }

    /// Wire up every component from settings.
    pub fn from_settings(settings: Settings) -> Result<Self> {
        let store = store::open(&settings.store)?;
        let orchestrator = Arc::new(Orchestrator::from_settings(&settings));
        let ranker: Arc<dyn Ranker> =
            Arc::new(ContentSimilarityRanker::new(settings.ranker.max_results));
        Ok(Self::new(orchestrator, store, ranker, settings))
    }
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
    uptime_seconds: i64,
    in_flight_tasks: usize,
    oldest_task_age_ms: Option<u64>,
    sources: Vec<String>,
    cache: CacheStats,
}

#[derive(Deserialize)]
struct SearchParams {
    #[serde(default)]
    q: String,
}

#[derive(Serialize)]
#[serde(tag = "status", rename_all = "UPPERCASE")]
enum SearchResponse {
    Success {
        products: Arc<Vec<Item>>,
        filters: Filters,
        message: String,
    },
    Pending {
        task_id: TaskId,
        poll_interval_ms: u64,
    },
}

#[derive(Deserialize)]
struct RecommendParams {
    #[serde(default)]
    product_name: String,
}

#[derive(Serialize)]
struct RecommendResponse {
    similar: Vec<RankedItem>,
    ai_powered: Vec<RankedItem>,
}

#[derive(Deserialize)]
struct RemoveRequest {
    product_url: String,
}

#[derive(Serialize)]
struct ActionResponse {
    success: bool,
    message: String,
}

#[derive(Serialize)]
struct ProfileResponse {
    requester: String,
    wishlist: Vec<WishlistEntry>,
    tracked_items: Vec<TrackedItem>,
    recent_clicks: Vec<ClickRecord>,
}

/// Create the HTTP router with all endpoints and middleware
pub fn create_router(state: AppState) -> Router {
    let cors_layer = create_cors_layer(&state.settings.server);
    let body_limit_layer = create_body_limit_layer(state.settings.server.max_request_size_mb);

    let api_routes = Router::new()
        .route("/search", get(search))
        .route("/status/:task_id", get(task_status))
        .route("/recommend", get(recommend))
        .route("/wishlist/add", post(add_to_wishlist))
        .route("/wishlist/remove", post(remove_from_wishlist))
        .route("/track_price", post(track_price))
        .route("/profile", get(profile))
        .route("/coupons", get(coupons));

    Router::new()
        .route("/health", get(health_check))
        .nest("/api", api_routes)
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(cors_layer)
        .layer(body_limit_layer)
}

async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    let uptime = Utc::now() - state.started_at;
    Json(HealthResponse {
        status: "healthy",
        version: env!("CARGO_PKG_VERSION"),
        uptime_seconds: uptime.num_seconds(),
        in_flight_tasks: state.orchestrator.in_flight(),
        oldest_task_age_ms: state
            .orchestrator
            .oldest_task_age()
            .map(|age| age.as_millis() as u64),
        sources: state.orchestrator.source_names(),
        cache: state.orchestrator.context().cache.stats(),
    })
}

#[instrument(skip_all, fields(requester = %requester, query = %params.q))]
async fn search(
    State(state): State<AppState>,
    Requester(requester): Requester,
    Query(params): Query<SearchParams>,
) -> Result<Json<SearchResponse>, ApiError> {
    let query = params.q.trim();
    if query.is_empty() {
        return Err(ApiError::bad_request("query parameter 'q' is required"));
    }

    state.models.note_query(&requester, query);
    let response = match state.orchestrator.submit_query(&requester, query) {
        SubmitOutcome::Success { items, filters } => {
            train_query_model(&state, &requester).await;
            SearchResponse::Success {
                message: format!("{} products (cached)", items.len()),
                products: items,
                filters,
            }
        }
        SubmitOutcome::Pending { task_id } => SearchResponse::Pending {
            task_id,
            poll_interval_ms: state.orchestrator.poll_interval().as_millis() as u64,
        },
    };
    Ok(Json(response))
}

#[instrument(skip_all, fields(requester = %requester, task_id = %task_id))]
async fn task_status(
    State(state): State<AppState>,
    Requester(requester): Requester,
    Path(task_id): Path<String>,
) -> Result<Json<StatusReport>, ApiError> {
    // Malformed ids can never name a live task.
    let task_id: TaskId = task_id.parse().map_err(|_| ApiError {
        status: StatusCode::NOT_FOUND,
        message: format!("unknown task {task_id}"),
    })?;
    let report = state.orchestrator.poll_status_for(&requester, task_id)?;
    if let StatusReport::Success { .. } = report {
        train_query_model(&state, &requester).await;
    }
    Ok(Json(report))
}

/// Retrain the interaction model for the requester's current query from
/// everything the store has recorded so far.
async fn train_query_model(state: &AppState, requester: &str) {
    let Some(query) = state.models.query_for(requester) else {
        debug!("No query recorded for {}", requester);
        return;
    };
    match state.store.interaction_sessions().await {
        Ok(sessions) => {
            state.models.train(&query, &sessions);
        }
        Err(e) => warn!("Failed to load interaction sessions for '{}': {}", query, e),
    }
}

#[instrument(skip_all, fields(requester = %requester))]
async fn recommend(
    State(state): State<AppState>,
    Requester(requester): Requester,
    Query(params): Query<RecommendParams>,
) -> Result<Json<RecommendResponse>, ApiError> {
    let product_name = params.product_name.trim();
    if product_name.is_empty() {
        return Err(ApiError::bad_request("query parameter 'product_name' is required"));
    }

    state.store.record_click(&requester, product_name).await?;

    let Some(items) = state.orchestrator.current_items_for_requester(&requester) else {
        warn!("Requester {} asked for recommendations without a search", requester);
        return Err(ApiError::bad_request("no current search results for requester"));
    };

    let similar = state.ranker.rank(product_name, &items);
    let ai_powered = state
        .models
        .model_for_requester(&requester)
        .map(|model| model.rank(product_name, &items))
        .unwrap_or_default();
    Ok(Json(RecommendResponse { similar, ai_powered }))
}

#[instrument(skip_all, fields(requester = %requester, product_url = %item.product_url))]
async fn add_to_wishlist(
    State(state): State<AppState>,
    Requester(requester): Requester,
    Json(item): Json<Item>,
) -> Result<Json<ActionResponse>, ApiError> {
    let added = state.store.add_to_wishlist(&requester, &item).await?;
    let message = if added {
        format!("'{}' added to wishlist", item.name)
    } else {
        format!("'{}' is already in the wishlist", item.name)
    };
    Ok(Json(ActionResponse {
        success: added,
        message,
    }))
}

#[instrument(skip_all, fields(requester = %requester))]
async fn remove_from_wishlist(
    State(state): State<AppState>,
    Requester(requester): Requester,
    Json(request): Json<RemoveRequest>,
) -> Result<Json<ActionResponse>, ApiError> {
    if request.product_url.trim().is_empty() {
        return Err(ApiError::bad_request("product_url is required"));
    }
    state
        .store
        .remove_from_wishlist(&requester, &request.product_url)
        .await?;
    Ok(Json(ActionResponse {
        success: true,
        message: "removed from wishlist".to_string(),
    }))
}

#[instrument(skip_all, fields(requester = %requester, product_url = %item.product_url))]
async fn track_price(
    State(state): State<AppState>,
    Requester(requester): Requester,
    Json(item): Json<Item>,
) -> Result<Json<ActionResponse>, ApiError> {
    if item.price <= 0.0 {
        return Err(ApiError::bad_request("price must be positive"));
    }
    state.store.track_price(&requester, &item).await?;
    state.store.log_price(&item).await?;
    Ok(Json(ActionResponse {
        success: true,
        message: format!("tracking price of '{}'", item.name),
    }))
}

#[instrument(skip_all, fields(requester = %requester))]
async fn profile(
    State(state): State<AppState>,
    Requester(requester): Requester,
) -> Result<Json<ProfileResponse>, ApiError> {
    let wishlist = state.store.wishlist(&requester).await?;
    let tracked_items = state.store.tracked_items(&requester).await?;
    let recent_clicks = state
        .store
        .click_history(&requester, PROFILE_CLICK_LIMIT)
        .await?;
    Ok(Json(ProfileResponse {
        requester,
        wishlist,
        tracked_items,
        recent_clicks,
    }))
}

async fn coupons(
    State(state): State<AppState>,
    _requester: Requester,
) -> Result<Json<CouponsByStore>, ApiError> {
    Ok(Json(state.store.coupons_by_store().await?))
}

/// Start the HTTP server (and the coupon refresher when enabled) and wait
/// for a shutdown signal.
pub async fn serve(settings: Settings, addr: Option<SocketAddr>) -> Result<()> {
    let addr = match addr {
        Some(addr) => addr,
        None => format!("{}:{}", settings.server.host, settings.server.port)
            .parse()
            .map_err(|e| anyhow::anyhow!("Invalid server address: {}", e))?,
    };

    let state = AppState::from_settings(settings)?;

    let refresher = if state.settings.refresher.enabled {
        let refresher = PeriodicRefresher::from_config(&state.settings.refresher, state.store.clone());
        Some(refresher.spawn())
    } else {
        info!("Coupon refresher disabled");
        None
    };

    let app = create_router(state);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("HTTP server listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(wait_for_shutdown())
        .await?;

    if let Some(refresher) = refresher {
        refresher.shutdown().await;
    }

    info!("HTTP server shutdown complete");
    Ok(())
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM)
async fn wait_for_shutdown() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C, shutting down gracefully"),
        _ = terminate => info!("Received SIGTERM, shutting down gracefully"),
    }
}
