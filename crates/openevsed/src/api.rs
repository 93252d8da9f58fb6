use std::net::IpAddr;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::Json;
use axum::Router;
use axum::extract::Path;
use axum::extract::Query;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::response::Response;
use axum::routing::get;
use axum::routing::post;
use serde::Deserialize;
use serde::Serialize;
use serde_json::Map;
use serde_json::Value;
use serde_json::json;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;

use crate::engine::ConfigEntry;
use crate::engine::Engine;
use crate::engine::EngineError;
use crate::engine::EntityCommand;
use crate::engine::FlowSource;
use crate::engine::RequestError;
use crate::engine::ServiceCall;
use crate::engine::ServiceError;

/// Response for the /v1/ping endpoint
#[derive(Serialize)]
struct PingResponse {
    status: String,
}

/// Response for the /v1/info endpoint
#[derive(Serialize)]
struct InfoResponse {
    version: String,
    hostname: String,
}

/// Config entry as listed over the API; connection data is left out.
#[derive(Serialize)]
struct EntrySummary {
    entry_id: String,
    domain: String,
    title: String,
    unique_id: Option<String>,
    source: String,
    version: u32,
}

impl From<ConfigEntry> for EntrySummary {
    fn from(entry: ConfigEntry) -> Self {
        Self {
            entry_id: entry.entry_id,
            domain: entry.domain,
            title: entry.title,
            unique_id: entry.unique_id,
            source: entry.source,
            version: entry.version,
        }
    }
}

/// Body of POST /v1/states/{entity_id}
#[derive(Debug, Deserialize)]
struct StateUpdate {
    state: String,
    #[serde(default)]
    attributes: Map<String, Value>,
}

#[derive(Debug, Default, Deserialize)]
struct ServiceQuery {
    #[serde(default)]
    return_response: bool,
}

/// Body of POST /v1/config_flow/{domain}
#[derive(Debug, Deserialize)]
struct FlowStart {
    #[serde(default = "default_source")]
    source: FlowSource,
    entry_id: Option<String>,
    data: Option<Value>,
}

fn default_source() -> FlowSource {
    FlowSource::User
}

/// Shared application state
#[derive(Clone)]
struct AppState {
    version: &'static str,
    engine: Arc<Engine>,
}

/// Engine failures mapped onto HTTP statuses
struct ApiError(EngineError);

impl From<EngineError> for ApiError {
    fn from(e: EngineError) -> Self {
        ApiError(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            EngineError::UnknownEntity(_)
            | EngineError::UnknownIntegration(_)
            | EngineError::UnknownEntry(_)
            | EngineError::UnknownDevice(_)
            | EngineError::UnknownFlow(_)
            | EngineError::Service(ServiceError::NotFound { .. })
            | EngineError::Request(RequestError::NotFound(_)) => StatusCode::NOT_FOUND,
            EngineError::Service(_) | EngineError::Request(RequestError::Invalid(_)) => {
                StatusCode::BAD_REQUEST
            }
            EngineError::Request(RequestError::Failed(_)) => StatusCode::BAD_GATEWAY,
            EngineError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
            EngineError::NoReply(_) => StatusCode::SERVICE_UNAVAILABLE,
        };
        if status.is_server_error() {
            tracing::warn!("Request failed: {}", self.0);
        }
        (status, Json(json!({ "error": self.0.to_string() }))).into_response()
    }
}

fn bad_request(message: impl ToString) -> Response {
    (
        StatusCode::BAD_REQUEST,
        Json(json!({ "error": message.to_string() })),
    )
        .into_response()
}

/// Handler for GET /v1/ping
#[tracing::instrument]
async fn ping() -> impl IntoResponse {
    tracing::debug!("Handling /v1/ping request");
    (
        StatusCode::OK,
        Json(PingResponse {
            status: "ok".to_string(),
        }),
    )
}

/// Handler for GET /v1/info
#[tracing::instrument(skip(state))]
async fn info(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    tracing::debug!("Handling /v1/info request");

    let hostname = hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "unknown".to_string());

    (
        StatusCode::OK,
        Json(InfoResponse {
            version: state.version.to_string(),
            hostname,
        }),
    )
}

#[tracing::instrument(skip(state))]
async fn list_states(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let snapshot = state.engine.state_snapshot();
    Json(snapshot.entities.values().cloned().collect::<Vec<_>>())
}

#[tracing::instrument(skip(state))]
async fn get_state(
    State(state): State<Arc<AppState>>,
    Path(entity_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let snapshot = state.engine.state_snapshot();
    let entity = snapshot
        .get(&entity_id)
        .cloned()
        .ok_or(EngineError::UnknownEntity(entity_id))?;
    Ok(Json(entity))
}

/// Handler for POST /v1/states/{entity_id}, used to push external readings
#[tracing::instrument(skip(state, body))]
async fn set_state(
    State(state): State<Arc<AppState>>,
    Path(entity_id): Path<String>,
    Json(body): Json<StateUpdate>,
) -> impl IntoResponse {
    tracing::debug!("Setting {} to {}", entity_id, body.state);
    let new_state = state
        .engine
        .set_state(&entity_id, body.state, body.attributes);
    Json(new_state)
}

#[tracing::instrument(skip(state, body))]
async fn entity_command(
    State(state): State<Arc<AppState>>,
    Path((entity_id, command)): Path<(String, String)>,
    body: Option<Json<Value>>,
) -> Response {
    let body = body.map(|Json(v)| v).unwrap_or(Value::Null);
    let command = match EntityCommand::from_parts(&command, &body) {
        Ok(command) => command,
        Err(e) => return bad_request(e),
    };

    match state.engine.entity_command(&entity_id, command).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => ApiError(e).into_response(),
    }
}

#[tracing::instrument(skip(state))]
async fn list_services(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.engine.list_services())
}

#[tracing::instrument(skip(state, body))]
async fn call_service(
    State(state): State<Arc<AppState>>,
    Path((domain, service)): Path<(String, String)>,
    Query(query): Query<ServiceQuery>,
    body: Option<Json<Value>>,
) -> Result<impl IntoResponse, ApiError> {
    let call = ServiceCall {
        domain,
        service,
        data: body.map(|Json(v)| v).unwrap_or_else(|| json!({})),
    };
    let response = state
        .engine
        .call_service(call, query.return_response)
        .await?;
    Ok(Json(match response {
        Some(response) => json!({ "response": response }),
        None => json!({}),
    }))
}

#[tracing::instrument(skip(state))]
async fn list_devices(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let devices: Vec<_> = state
        .engine
        .devices()
        .into_iter()
        .map(|d| d.as_ref().clone())
        .collect();
    Json(devices)
}

#[tracing::instrument(skip(state))]
async fn device_diagnostics(
    State(state): State<Arc<AppState>>,
    Path(device_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.engine.device_diagnostics(&device_id).await?))
}

#[tracing::instrument(skip(state))]
async fn list_config_entries(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let entries: Vec<EntrySummary> = state
        .engine
        .config_entries()
        .into_iter()
        .map(EntrySummary::from)
        .collect();
    Json(entries)
}

#[tracing::instrument(skip(state))]
async fn remove_config_entry(
    State(state): State<Arc<AppState>>,
    Path(entry_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    state.engine.remove_config_entry(&entry_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[tracing::instrument(skip(state))]
async fn entry_diagnostics(
    State(state): State<Arc<AppState>>,
    Path(entry_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.engine.entry_diagnostics(&entry_id).await?))
}

#[tracing::instrument(skip(state, body))]
async fn start_flow(
    State(state): State<Arc<AppState>>,
    Path(domain): Path<String>,
    body: Option<Json<FlowStart>>,
) -> Result<impl IntoResponse, ApiError> {
    let start = body.map(|Json(b)| b).unwrap_or(FlowStart {
        source: FlowSource::User,
        entry_id: None,
        data: None,
    });
    let outcome = state
        .engine
        .config_flow_start(&domain, start.source, start.entry_id, start.data)
        .await?;
    Ok(Json(outcome))
}

#[tracing::instrument(skip(state, body))]
async fn continue_flow(
    State(state): State<Arc<AppState>>,
    Path(flow_id): Path<String>,
    body: Option<Json<Value>>,
) -> Result<impl IntoResponse, ApiError> {
    let data = body.map(|Json(v)| v).unwrap_or_else(|| json!({}));
    Ok(Json(state.engine.config_flow_continue(&flow_id, data).await?))
}

/// Create the API router with all endpoints
fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/v1/ping", get(ping))
        .route("/v1/info", get(info))
        .route("/v1/states", get(list_states))
        .route("/v1/states/:entity_id", get(get_state).post(set_state))
        .route("/v1/entities/:entity_id/:command", post(entity_command))
        .route("/v1/services", get(list_services))
        .route("/v1/services/:domain/:service", post(call_service))
        .route("/v1/devices", get(list_devices))
        .route("/v1/devices/:device_id/diagnostics", get(device_diagnostics))
        .route("/v1/config_entries", get(list_config_entries))
        .route(
            "/v1/config_entries/:entry_id",
            axum::routing::delete(remove_config_entry),
        )
        .route(
            "/v1/config_entries/:entry_id/diagnostics",
            get(entry_diagnostics),
        )
        .route("/v1/config_flow/:domain", post(start_flow))
        .route("/v1/config_flow/flows/:flow_id", post(continue_flow))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Start the HTTP API server
///
/// Binds to `listen:port` and serves the API until `shutdown_rx` fires.
pub async fn serve(
    engine: Arc<Engine>,
    listen: IpAddr,
    port: u16,
    shutdown_rx: tokio::sync::oneshot::Receiver<()>,
) -> Result<(), Box<dyn std::error::Error>> {
    let version = env!("CARGO_PKG_VERSION");

    let state = Arc::new(AppState { version, engine });
    let app = create_router(state);

    let addr = SocketAddr::new(listen, port);
    tracing::info!("Starting HTTP API server on {}", addr);

    let listener = TcpListener::bind(addr).await?;

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            shutdown_rx.await.ok();
            tracing::info!("HTTP API server shutting down gracefully");
        })
        .await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    use super::*;

    fn router() -> Router {
        let engine = Arc::new(Engine::default());
        let runner = engine.clone();
        tokio::spawn(async move {
            let _ = runner.run().await;
        });
        create_router(Arc::new(AppState {
            version: "test",
            engine,
        }))
    }

    async fn send(router: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let mut request = Request::builder().method(method).uri(uri);
        let body = match body {
            Some(body) => {
                request = request.header("content-type", "application/json");
                Body::from(body.to_string())
            }
            None => Body::empty(),
        };
        let response = router
            .clone()
            .oneshot(request.body(body).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, value)
    }

    #[tokio::test]
    async fn test_ping_and_info() {
        let router = router();
        let (status, body) = send(&router, "GET", "/v1/ping", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({"status": "ok"}));

        let (status, body) = send(&router, "GET", "/v1/info", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["version"], json!("test"));
    }

    #[tokio::test]
    async fn test_push_and_read_state() {
        let router = router();
        let (status, body) = send(
            &router,
            "POST",
            "/v1/states/sensor.grid_power",
            Some(json!({"state": "-1520", "attributes": {"unit_of_measurement": "W"}})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["state"], json!("-1520"));

        let (status, body) = send(&router, "GET", "/v1/states/sensor.grid_power", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["attributes"]["unit_of_measurement"], json!("W"));

        let (_, body) = send(&router, "GET", "/v1/states", None).await;
        assert_eq!(body.as_array().map(Vec::len), Some(1));

        let (status, _) = send(&router, "GET", "/v1/states/sensor.nope", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_entity_command_errors() {
        let router = router();
        let (status, _) = send(&router, "POST", "/v1/entities/light.nope/turn_off", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, body) = send(&router, "POST", "/v1/entities/light.nope/explode", None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].as_str().is_some());
    }

    #[tokio::test]
    async fn test_unknown_targets() {
        let router = router();
        let (status, body) = send(&router, "GET", "/v1/services", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!([]));

        let (status, _) = send(&router, "POST", "/v1/services/openevse/set_override", Some(json!({}))).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, _) = send(&router, "DELETE", "/v1/config_entries/01missing", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, _) = send(&router, "POST", "/v1/config_flow/openevse", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, _) = send(&router, "POST", "/v1/config_flow/flows/nope", Some(json!({}))).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (_, body) = send(&router, "GET", "/v1/config_entries", None).await;
        assert_eq!(body, json!([]));
    }
}
