//! HTTP facade over the delineation core.
//!
//! A thin axum app: request validation, the result cache, and a bounded
//! dispatch of the CPU-heavy orchestrator onto blocking worker threads so
//! the event loop stays responsive. All state lives in an explicit
//! `AppState` built at startup.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use anyhow::{Context, Result};
use axum::{
    Json, Router,
    extract::{Path, Query, State, rejection::JsonRejection},
    http::{HeaderMap, HeaderValue, Method, StatusCode},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
};
use serde::Deserialize;
use serde_json::json;
use tokio::sync::Semaphore;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tracing::{error, info};

use crate::basins::{BasinIndex, basins_shapefile_path};
use crate::cache::{WatershedCache, cache_key};
use crate::config::{DEFAULT_API_DATA_DIR, ENV_CORS_ORIGINS, ENV_MERIT_DATA_DIR};
use crate::country::{CountryLookup, NoCountryLookup};
use crate::delineate::{DelineateOptions, delineate_outlet};
use crate::errors::DelineationError;
use crate::export::export_watershed;
use crate::merit::{self, BasinDataCache};
use crate::models::{DelineateRequest, ErrorResponse, ExportFormat, watershed_to_response};

/// Upper bound on concurrent heavy delineations; raster windows are large
/// and concurrent requests multiply that memory.
const MAX_CONCURRENT_DELINEATIONS: usize = 4;

/// In-process request counters surfaced by /cache/stats.
#[derive(Debug, Default)]
pub struct RequestStats {
    total_requests: AtomicU64,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
}

impl RequestStats {
    fn record(&self, hit: bool) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
        if hit {
            self.cache_hits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.cache_misses.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn snapshot(&self) -> (u64, u64, u64) {
        (
            self.total_requests.load(Ordering::Relaxed),
            self.cache_hits.load(Ordering::Relaxed),
            self.cache_misses.load(Ordering::Relaxed),
        )
    }
}

/// Basin index loaded on first use and shared for the process lifetime.
struct LazyBasinIndex {
    path: PathBuf,
    slot: Mutex<Option<Arc<BasinIndex>>>,
}

impl LazyBasinIndex {
    fn new(path: PathBuf) -> Self {
        Self { path, slot: Mutex::new(None) }
    }

    fn get(&self) -> Result<Arc<BasinIndex>, DelineationError> {
        let mut slot = self.slot.lock().expect("basin index lock poisoned");
        if let Some(index) = slot.as_ref() {
            return Ok(index.clone());
        }
        let index = Arc::new(BasinIndex::load(&self.path)?);
        *slot = Some(index.clone());
        Ok(index)
    }
}

#[derive(Clone)]
pub struct AppState {
    cache: Arc<WatershedCache>,
    basin_index: Arc<LazyBasinIndex>,
    basin_cache: Arc<BasinDataCache>,
    data_dir: PathBuf,
    country: Arc<dyn CountryLookup>,
    permits: Arc<Semaphore>,
    stats: Arc<RequestStats>,
}

impl AppState {
    /// Build the state for serving: cache database, basin locator, and the
    /// capacity-bounded basin LRU, all rooted at the MERIT data directory.
    pub fn new(data_dir: PathBuf, cache: WatershedCache) -> Self {
        Self {
            cache: Arc::new(cache),
            basin_index: Arc::new(LazyBasinIndex::new(basins_shapefile_path(&data_dir))),
            basin_cache: Arc::new(BasinDataCache::new(
                data_dir.clone(),
                BasinDataCache::DEFAULT_CAPACITY,
            )),
            data_dir,
            country: Arc::new(NoCountryLookup),
            permits: Arc::new(Semaphore::new(MAX_CONCURRENT_DELINEATIONS)),
            stats: Arc::new(RequestStats::default()),
        }
    }

    pub fn with_country(mut self, country: Arc<dyn CountryLookup>) -> Self {
        self.country = country;
        self
    }

    /// Data directory from MERIT_DATA_DIR, with the service default.
    pub fn data_dir_from_env() -> PathBuf {
        std::env::var(ENV_MERIT_DATA_DIR)
            .ok()
            .filter(|dir| !dir.trim().is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_API_DATA_DIR))
    }
}

/// CORS origins from the environment, comma separated, defaulting to
/// localhost development hosts.
fn cors_origins() -> Vec<HeaderValue> {
    let configured = std::env::var(ENV_CORS_ORIGINS).ok();
    let origins: Vec<String> = match configured {
        Some(value) if !value.trim().is_empty() => value
            .split(',')
            .map(|origin| origin.trim().to_string())
            .filter(|origin| !origin.is_empty())
            .collect(),
        _ => vec![
            "http://localhost:3000".to_string(),
            "http://127.0.0.1:3000".to_string(),
        ],
    };
    origins
        .iter()
        .filter_map(|origin| origin.parse().ok())
        .collect()
}

pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(AllowOrigin::list(cors_origins()))
        .allow_methods([Method::GET, Method::POST, Method::DELETE])
        .allow_headers(Any);

    Router::new()
        .route("/delineate", post(delineate_handler))
        .route("/health", get(health_handler))
        .route("/cache/stats", get(cache_stats_handler))
        .route("/cache/{gauge_id}", delete(delete_cache_handler))
        .route("/export/{gauge_id}", get(export_handler))
        .with_state(state)
        .layer(cors)
}

pub async fn start_web_server(interface: String, port: u16, state: AppState) -> Result<()> {
    let app = build_router(state);
    let listener = tokio::net::TcpListener::bind(format!("{interface}:{port}"))
        .await
        .with_context(|| format!("binding {interface}:{port}"))?;
    info!("Delineator API listening on http://{interface}:{port}");
    axum::serve(listener, app).await.context("serving HTTP")?;
    Ok(())
}

fn error_to_response(gauge_id: &str, err: &DelineationError) -> Response {
    let status =
        StatusCode::from_u16(err.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let body = ErrorResponse::new(gauge_id, err.error_code(), err.to_string());
    (status, Json(body)).into_response()
}

/// The structured per-request log line.
fn log_request(
    gauge_id: &str,
    lat: f64,
    lng: f64,
    started: Instant,
    cached: bool,
    error_code: Option<&str>,
) {
    let duration = started.elapsed().as_secs_f64();
    match error_code {
        None => info!("{gauge_id} | {lat}, {lng} | SUCCESS | {duration:.1}s | cached={cached}"),
        Some(code) => {
            info!("{gauge_id} | {lat}, {lng} | ERROR | {duration:.1}s | cached={cached} | {code}")
        }
    }
}

async fn delineate_handler(
    State(state): State<AppState>,
    body: Result<Json<serde_json::Value>, JsonRejection>,
) -> Response {
    let started = Instant::now();

    // Typed deserialization is the validation boundary: anything that fails
    // here is an INVALID_COORDINATES response.
    let parsed = body
        .map_err(|e| DelineationError::InvalidInput(e.body_text()))
        .and_then(|Json(value)| {
            serde_json::from_value::<DelineateRequest>(value)
                .map_err(|e| DelineationError::InvalidInput(e.to_string()))
        });
    let request = match parsed {
        Ok(request) => request,
        Err(err) => {
            log_request("", 0.0, 0.0, started, false, Some(err.error_code()));
            return error_to_response("", &err);
        }
    };

    let key = cache_key(
        request.lat,
        request.lng,
        request.force_low_res,
        request.include_rivers,
    );

    match state.cache.get(&key, &request.gauge_id) {
        Ok(Some(response)) => {
            state.stats.record(true);
            log_request(&request.gauge_id, request.lat, request.lng, started, true, None);
            return Json(response).into_response();
        }
        Ok(None) => state.stats.record(false),
        Err(e) => {
            error!("Cache read failed: {e}");
            state.stats.record(false);
        }
    }

    // Bound the number of in-flight heavy delineations.
    let permit = state
        .permits
        .clone()
        .acquire_owned()
        .await
        .expect("delineation semaphore closed");

    let worker_state = state.clone();
    let worker_request = request.clone();
    let outcome = tokio::task::spawn_blocking(move || {
        let _permit = permit;
        run_delineation(&worker_state, &worker_request)
    })
    .await;

    let result = match outcome {
        Ok(result) => result,
        Err(e) => Err(DelineationError::Failed(format!("delineation task panicked: {e}"))),
    };

    match result {
        Ok(response) => {
            if let Err(e) =
                state
                    .cache
                    .put(&key, &request.gauge_id, request.lat, request.lng, &response)
            {
                error!("Cache write failed: {e}");
            }
            log_request(&request.gauge_id, request.lat, request.lng, started, false, None);
            Json(response).into_response()
        }
        Err(err) => {
            log_request(
                &request.gauge_id,
                request.lat,
                request.lng,
                started,
                false,
                Some(err.error_code()),
            );
            error_to_response(&request.gauge_id, &err)
        }
    }
}

/// Synchronous delineation pipeline run on a worker thread.
fn run_delineation(
    state: &AppState,
    request: &DelineateRequest,
) -> Result<crate::models::DelineateResponse, DelineationError> {
    let basin_index = state.basin_index.get()?;
    let basin = basin_index
        .basin_for_point(request.lat, request.lng)?
        .ok_or(DelineationError::NoRiverFound { lat: request.lat, lng: request.lng })?;
    let basin_data = state.basin_cache.get_or_load(basin)?;

    let options = DelineateOptions {
        use_high_res: !request.force_low_res,
        include_rivers: request.include_rivers,
        ..DelineateOptions::default()
    };
    let watershed = delineate_outlet(
        &request.gauge_id,
        request.lat,
        request.lng,
        "",
        &basin_data,
        &merit::flowdir_dir(&state.data_dir),
        &merit::accum_dir(&state.data_dir),
        &options,
        state.country.as_ref(),
    )?;
    Ok(watershed_to_response(&watershed, &request.gauge_id, false))
}

async fn health_handler(State(state): State<AppState>) -> Response {
    Json(json!({
        "status": "healthy",
        "version": env!("CARGO_PKG_VERSION"),
        "data_dir": state.data_dir.display().to_string(),
    }))
    .into_response()
}

async fn cache_stats_handler(State(state): State<AppState>) -> Response {
    let (total, hits, misses) = state.stats.snapshot();
    let hit_rate = if total == 0 { 0.0 } else { hits as f64 / total as f64 };
    let cache_size = match state.cache.size() {
        Ok(size) => size,
        Err(e) => {
            error!("Cache stats failed: {e}");
            return error_to_response("", &DelineationError::Failed(e.to_string()));
        }
    };
    Json(json!({
        "total_requests": total,
        "cache_hits": hits,
        "cache_misses": misses,
        "hit_rate": hit_rate,
        "cache_size": cache_size,
    }))
    .into_response()
}

async fn delete_cache_handler(
    State(state): State<AppState>,
    Path(gauge_id): Path<String>,
) -> Response {
    match state.cache.delete_by_gauge_id(&gauge_id) {
        Ok(deleted) => {
            info!("Deleted {deleted} cache entries for {gauge_id}");
            StatusCode::NO_CONTENT.into_response()
        }
        Err(e) => {
            error!("Cache delete failed: {e}");
            error_to_response(&gauge_id, &DelineationError::Failed(e.to_string()))
        }
    }
}

#[derive(Debug, Deserialize)]
struct ExportQuery {
    format: Option<String>,
}

async fn export_handler(
    State(state): State<AppState>,
    Path(gauge_id): Path<String>,
    Query(query): Query<ExportQuery>,
) -> Response {
    let format = match query
        .format
        .as_deref()
        .unwrap_or("geojson")
        .parse::<ExportFormat>()
    {
        Ok(format) => format,
        Err(err) => return error_to_response(&gauge_id, &err),
    };

    let cached = match state.cache.get_by_gauge_id(&gauge_id) {
        Ok(Some(response)) => response,
        Ok(None) => {
            let err = DelineationError::WatershedNotFound(gauge_id.clone());
            return error_to_response(&gauge_id, &err);
        }
        Err(e) => {
            return error_to_response(&gauge_id, &DelineationError::Failed(e.to_string()));
        }
    };

    // File rendering stages shapefiles and geopackages on disk.
    let rendered =
        tokio::task::spawn_blocking(move || export_watershed(&cached, &gauge_id, format)).await;

    match rendered {
        Ok(Ok(payload)) => {
            let mut headers = HeaderMap::new();
            if let Ok(value) = payload.content_type.parse() {
                headers.insert("content-type", value);
            }
            if let Ok(value) = format!("attachment; filename=\"{}\"", payload.filename).parse() {
                headers.insert("content-disposition", value);
            }
            (StatusCode::OK, headers, payload.bytes).into_response()
        }
        Ok(Err(e)) => {
            error!("Export failed: {e}");
            error_to_response("", &DelineationError::Failed(e.to_string()))
        }
        Err(e) => error_to_response("", &DelineationError::Failed(format!("export task: {e}"))),
    }
}
