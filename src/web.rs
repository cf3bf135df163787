use axum::{
    debug_handler,
    extract::{Path, State},
    http::{header, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{delete, get, put},
    Json, Router,
};
use log::debug;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::{
    collections::{BTreeMap, HashMap},
    io,
    net::{IpAddr, Ipv4Addr, SocketAddr},
    sync::{Arc, PoisonError, RwLock},
};
use thiserror::Error;
use tokio::{net::TcpListener, sync::broadcast};
use tokio_graceful_shutdown::SubsystemHandle;

use mayara_bridge::{
    host::{ProviderRegistry, StatusReporter, StreamSink},
    Fleet, FleetStatus, RadarProvider, VERSION,
};

const STATUS_URI: &str = "/v1/api/status";
const PROVIDERS_URI: &str = "/v1/api/providers";
const RADARS_URI: &str = "/v1/api/providers/{provider_id}/radars";
const RADAR_URI: &str = "/v1/api/providers/{provider_id}/radars/{radar_id}";
const RADAR_CAPABILITIES_URI: &str = "/v1/api/providers/{provider_id}/radars/{radar_id}/capabilities";
const RADAR_STATE_URI: &str = "/v1/api/providers/{provider_id}/radars/{radar_id}/state";
const CONTROLS_URI: &str = "/v1/api/providers/{provider_id}/radars/{radar_id}/controls";
const CONTROL_VALUE_URI: &str = "/v1/api/providers/{provider_id}/radars/{radar_id}/controls/{control_id}";
const POWER_URI: &str = "/v1/api/providers/{provider_id}/radars/{radar_id}/power";
const RANGE_URI: &str = "/v1/api/providers/{provider_id}/radars/{radar_id}/range";
const GAIN_URI: &str = "/v1/api/providers/{provider_id}/radars/{radar_id}/gain";
const TARGETS_URI: &str = "/v1/api/providers/{provider_id}/radars/{radar_id}/targets";
const TARGET_URI: &str = "/v1/api/providers/{provider_id}/radars/{radar_id}/targets/{target_id}";

#[derive(Error, Debug)]
pub enum WebError {
    #[error("Socket operation failed")]
    Io(#[from] io::Error),
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
struct StreamCounters {
    frames: u64,
    bytes: u64,
}

#[derive(Default)]
struct WebInner {
    message: RwLock<Option<String>>,
    error: RwLock<Option<String>>,
    providers: RwLock<HashMap<String, Arc<RadarProvider>>>,
    streams: RwLock<HashMap<String, StreamCounters>>,
}

/// Standalone host: keeps the status strings, mounts registered providers
/// under `/v1/api/providers/{id}` and counts emitted frames.
#[derive(Clone)]
pub struct Web {
    port: u16,
    inner: Arc<WebInner>,
}

impl Web {
    pub fn new(port: u16) -> Self {
        Web {
            port,
            inner: Arc::new(WebInner::default()),
        }
    }

    fn provider(&self, provider_id: &str) -> Option<Arc<RadarProvider>> {
        self.inner
            .providers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(provider_id)
            .cloned()
    }

    fn router(self, fleet: Fleet) -> Router {
        Router::new()
            .route(STATUS_URI, get(get_status))
            .route(PROVIDERS_URI, get(get_providers))
            .route(RADARS_URI, get(get_radars))
            .route(RADAR_URI, get(get_radar_info))
            .route(RADAR_CAPABILITIES_URI, get(get_capabilities))
            .route(RADAR_STATE_URI, get(get_state))
            .route(CONTROLS_URI, put(set_controls))
            .route(CONTROL_VALUE_URI, put(set_control_value))
            .route(POWER_URI, put(set_power))
            .route(RANGE_URI, put(set_range))
            .route(GAIN_URI, put(set_gain))
            .route(TARGETS_URI, get(get_targets).post(acquire_target))
            .route(TARGET_URI, delete(cancel_target))
            .layer(middleware::from_fn(no_cache_middleware))
            .with_state(AppState { web: self, fleet })
    }

    pub async fn run(self, fleet: Fleet, subsys: SubsystemHandle) -> Result<(), WebError> {
        let port = self.port;
        let listener =
            TcpListener::bind(SocketAddr::new(IpAddr::V4(Ipv4Addr::new(0, 0, 0, 0)), port)).await?;
        let app = self.router(fleet);

        log::info!("Starting HTTP status server on port {}", port);

        let (shutdown_tx, mut shutdown_rx) = broadcast::channel(1);

        tokio::select! { biased;
            _ = subsys.on_shutdown_requested() => {
                debug!("Web: shutdown requested");
                let _ = shutdown_tx.send(());
            },
            r = axum::serve(listener, app)
                    .with_graceful_shutdown(
                        async move {
                            _ = shutdown_rx.recv().await;
                        }
                    ) => {
                return r.map_err(WebError::Io);
            }
        }
        Ok(())
    }
}

impl StreamSink for Web {
    fn emit_frame(&self, stream_key: &str, frame: &[u8]) -> bool {
        let mut streams = self.inner.streams.write().unwrap_or_else(PoisonError::into_inner);
        let counters = streams.entry(stream_key.to_string()).or_default();
        counters.frames += 1;
        counters.bytes += frame.len() as u64;
        log::trace!("{}: frame of {} bytes", stream_key, frame.len());
        false
    }
}

impl StatusReporter for Web {
    fn set_status(&self, msg: &str) {
        log::info!("Status: {}", msg);
        *self.inner.message.write().unwrap_or_else(PoisonError::into_inner) = Some(msg.to_string());
        *self.inner.error.write().unwrap_or_else(PoisonError::into_inner) = None;
    }

    fn set_error(&self, msg: &str) {
        log::warn!("Error: {}", msg);
        *self.inner.error.write().unwrap_or_else(PoisonError::into_inner) = Some(msg.to_string());
    }
}

impl ProviderRegistry for Web {
    fn register_provider(&self, provider_id: &str, provider: Arc<RadarProvider>) -> bool {
        let mut providers = self.inner.providers.write().unwrap_or_else(PoisonError::into_inner);
        if providers.contains_key(provider_id) {
            log::warn!("Provider '{}' is already registered", provider_id);
            return false;
        }
        log::info!("Registered radar provider '{}'", provider_id);
        providers.insert(provider_id.to_string(), provider);
        true
    }

    fn unregister_provider(&self, provider_id: &str) {
        let removed = self
            .inner
            .providers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(provider_id);
        if removed.is_some() {
            log::info!("Unregistered radar provider '{}'", provider_id);
        }
    }
}

#[derive(Clone)]
struct AppState {
    web: Web,
    fleet: Fleet,
}

/// Middleware to add no-cache headers to API responses
async fn no_cache_middleware(request: axum::http::Request<axum::body::Body>, next: Next) -> Response {
    let mut response = next.run(request).await;
    response.headers_mut().insert(
        header::CACHE_CONTROL,
        header::HeaderValue::from_static("no-cache, no-store, must-revalidate"),
    );
    response
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct StatusResponse {
    version: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    fleet: FleetStatus,
    streams: BTreeMap<String, StreamCounters>,
}

#[debug_handler]
async fn get_status(State(state): State<AppState>) -> Response {
    let inner = &state.web.inner;
    let response = StatusResponse {
        version: VERSION,
        message: inner.message.read().unwrap_or_else(PoisonError::into_inner).clone(),
        error: inner.error.read().unwrap_or_else(PoisonError::into_inner).clone(),
        fleet: state.fleet.status(),
        streams: inner
            .streams
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect(),
    };
    Json(response).into_response()
}

#[debug_handler]
async fn get_providers(State(state): State<AppState>) -> Response {
    let mut ids: Vec<String> = state
        .web
        .inner
        .providers
        .read()
        .unwrap_or_else(PoisonError::into_inner)
        .keys()
        .cloned()
        .collect();
    ids.sort();
    Json(ids).into_response()
}

#[derive(Deserialize)]
struct ProviderParam {
    provider_id: String,
}

#[derive(Deserialize)]
struct RadarIdParam {
    provider_id: String,
    radar_id: String,
}

#[derive(Deserialize)]
struct RadarControlIdParam {
    provider_id: String,
    radar_id: String,
    control_id: String,
}

#[derive(Deserialize)]
struct RadarTargetIdParam {
    provider_id: String,
    radar_id: String,
    target_id: String,
}

#[derive(Deserialize)]
struct SetControlRequest {
    value: Value,
}

#[derive(Deserialize)]
struct SetPowerRequest {
    state: String,
}

#[derive(Deserialize)]
struct SetRangeRequest {
    range: u32,
}

#[derive(Deserialize)]
struct SetGainRequest {
    auto: bool,
    value: Option<u8>,
}

#[derive(Deserialize)]
struct AcquireTargetRequest {
    bearing: f64,
    distance: f64,
}

fn no_such_provider(provider_id: &str) -> Response {
    (
        StatusCode::NOT_FOUND,
        format!("No such provider '{}'", provider_id),
    )
        .into_response()
}

fn optional<T: Serialize>(value: Option<T>, what: &str) -> Response {
    match value {
        Some(value) => Json(value).into_response(),
        None => (StatusCode::NOT_FOUND, format!("{} not available", what)).into_response(),
    }
}

fn success(ok: bool) -> Response {
    Json(json!({ "success": ok })).into_response()
}

#[debug_handler]
async fn get_radars(State(state): State<AppState>, Path(params): Path<ProviderParam>) -> Response {
    match state.web.provider(&params.provider_id) {
        Some(provider) => optional(provider.get_radars().await, "Radar list"),
        None => no_such_provider(&params.provider_id),
    }
}

#[debug_handler]
async fn get_radar_info(State(state): State<AppState>, Path(params): Path<RadarIdParam>) -> Response {
    debug!("Radar info request for {}", params.radar_id);
    match state.web.provider(&params.provider_id) {
        Some(provider) => optional(provider.get_radar_info(&params.radar_id).await, "Radar info"),
        None => no_such_provider(&params.provider_id),
    }
}

#[debug_handler]
async fn get_capabilities(State(state): State<AppState>, Path(params): Path<RadarIdParam>) -> Response {
    match state.web.provider(&params.provider_id) {
        Some(provider) => optional(provider.get_capabilities(&params.radar_id).await, "Capabilities"),
        None => no_such_provider(&params.provider_id),
    }
}

#[debug_handler]
async fn get_state(State(state): State<AppState>, Path(params): Path<RadarIdParam>) -> Response {
    match state.web.provider(&params.provider_id) {
        Some(provider) => optional(provider.get_state(&params.radar_id).await, "State"),
        None => no_such_provider(&params.provider_id),
    }
}

#[debug_handler]
async fn set_controls(
    State(state): State<AppState>,
    Path(params): Path<RadarIdParam>,
    Json(controls): Json<Value>,
) -> Response {
    match state.web.provider(&params.provider_id) {
        Some(provider) => success(provider.set_controls(&params.radar_id, &controls).await),
        None => no_such_provider(&params.provider_id),
    }
}

#[debug_handler]
async fn set_control_value(
    State(state): State<AppState>,
    Path(params): Path<RadarControlIdParam>,
    Json(request): Json<SetControlRequest>,
) -> Response {
    match state.web.provider(&params.provider_id) {
        Some(provider) => success(
            provider
                .set_control(&params.radar_id, &params.control_id, request.value)
                .await,
        ),
        None => no_such_provider(&params.provider_id),
    }
}

#[debug_handler]
async fn set_power(
    State(state): State<AppState>,
    Path(params): Path<RadarIdParam>,
    Json(request): Json<SetPowerRequest>,
) -> Response {
    match state.web.provider(&params.provider_id) {
        Some(provider) => success(provider.set_power(&params.radar_id, &request.state).await),
        None => no_such_provider(&params.provider_id),
    }
}

#[debug_handler]
async fn set_range(
    State(state): State<AppState>,
    Path(params): Path<RadarIdParam>,
    Json(request): Json<SetRangeRequest>,
) -> Response {
    match state.web.provider(&params.provider_id) {
        Some(provider) => success(provider.set_range(&params.radar_id, request.range).await),
        None => no_such_provider(&params.provider_id),
    }
}

#[debug_handler]
async fn set_gain(
    State(state): State<AppState>,
    Path(params): Path<RadarIdParam>,
    Json(request): Json<SetGainRequest>,
) -> Response {
    match state.web.provider(&params.provider_id) {
        Some(provider) => success(
            provider
                .set_gain(&params.radar_id, request.auto, request.value)
                .await,
        ),
        None => no_such_provider(&params.provider_id),
    }
}

#[debug_handler]
async fn get_targets(State(state): State<AppState>, Path(params): Path<RadarIdParam>) -> Response {
    match state.web.provider(&params.provider_id) {
        Some(provider) => optional(provider.get_targets(&params.radar_id).await, "Targets"),
        None => no_such_provider(&params.provider_id),
    }
}

#[debug_handler]
async fn acquire_target(
    State(state): State<AppState>,
    Path(params): Path<RadarIdParam>,
    Json(request): Json<AcquireTargetRequest>,
) -> Response {
    debug!(
        "Acquire target on {} at bearing={}, distance={}",
        params.radar_id, request.bearing, request.distance
    );
    match state.web.provider(&params.provider_id) {
        Some(provider) => Json(
            provider
                .acquire_target(&params.radar_id, request.bearing, request.distance)
                .await,
        )
        .into_response(),
        None => no_such_provider(&params.provider_id),
    }
}

#[debug_handler]
async fn cancel_target(State(state): State<AppState>, Path(params): Path<RadarTargetIdParam>) -> Response {
    match state.web.provider(&params.provider_id) {
        Some(provider) => success(
            provider
                .cancel_target(&params.radar_id, &params.target_id)
                .await,
        ),
        None => no_such_provider(&params.provider_id),
    }
}
