use std::time::Instant;

use axum::body::Body;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Request, State};
use axum::http::{HeaderMap, HeaderValue, StatusCode, header};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Serialize;
use sokana_auth::{SignatureVerifier, unix_epoch_ms_now};
use sokana_contracts::env::StartupError;
use sokana_contracts::fields::PhiPatch;
use sokana_contracts::{
    ApiFailure, ApiSuccess, PhiData, PhiFetchRequest, PhiUpdateRequest, ServiceError,
    parse_client_id,
};
use sokana_phi_store::{PhiPool, PhiRepository, PhiStoreError};
use sokana_policy::{Decision, Denial, PhiAction};
use tracing::Instrument;
use ulid::Ulid;

use crate::config::BrokerConfig;

pub const REQUEST_ID_HEADER: &str = "x-sokana-request-id";

/// Upper bound on a buffered request body.
const MAX_BODY_BYTES: usize = 256 * 1024;

#[derive(Clone)]
pub struct AppState {
    verifier: SignatureVerifier,
    repository: PhiRepository,
    expose_internal: bool,
}

impl AppState {
    pub fn new(config: &BrokerConfig, pool: PhiPool) -> Result<Self, StartupError> {
        let verifier = SignatureVerifier::new(Some(&config.broker_secret)).map_err(|_| {
            StartupError::new("ERR_MISSING_CONFIG", "PHI_BROKER_SECRET must be set")
        })?;

        Ok(Self {
            verifier,
            repository: PhiRepository::new(pool, config.query_timeout()),
            expose_internal: config.runtime_env.is_development(),
        })
    }

    pub fn pool(&self) -> &PhiPool {
        self.repository.pool()
    }
}

type ApiError = (StatusCode, Json<ApiFailure>);

/// Builds the broker router. Applies migrations first when configured;
/// otherwise the PHI store is not contacted until the first request.
pub async fn router(config: &BrokerConfig, pool: PhiPool) -> Result<Router, StartupError> {
    if config.run_migrations {
        pool.migrate().await.map_err(|err| {
            StartupError::new(
                "ERR_PHI_STORE_UNAVAILABLE",
                format!("failed to apply PHI store migrations: {}", err),
            )
        })?;
        tracing::info!("phi_broker.migrations_applied");
    }

    Ok(router_with_state(AppState::new(config, pool)?))
}

pub fn router_with_state(state: AppState) -> Router {
    let signed = Router::new()
        .route("/v1/phi/client", post(read_phi))
        .route("/v1/phi/client/update", post(update_phi))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            require_signature,
        ));

    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .merge(signed)
        .with_state(state)
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    db: &'static str,
}

async fn health(State(state): State<AppState>) -> impl IntoResponse {
    match state.pool().health_check().await {
        Ok(()) => (
            StatusCode::OK,
            Json(HealthResponse {
                status: "healthy",
                db: "connected",
            }),
        ),
        Err(err) => {
            tracing::warn!(error = %err, "phi_broker.health_check_failed");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(HealthResponse {
                    status: "unhealthy",
                    db: "disconnected",
                }),
            )
        }
    }
}

async fn metrics() -> impl IntoResponse {
    match crate::metrics::render() {
        Ok((body, content_type)) => {
            let mut headers = HeaderMap::new();
            if let Ok(value) = HeaderValue::from_str(content_type.as_str()) {
                headers.insert(header::CONTENT_TYPE, value);
            }
            (headers, body).into_response()
        }
        Err(_) => StatusCode::INTERNAL_SERVER_ERROR.into_response(),
    }
}

/// Verifies the HMAC over the raw body before any handler or JSON parsing
/// runs, then hands the same bytes on.
async fn require_signature(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    let started = Instant::now();
    let route = request.uri().path().to_string();
    let (parts, body) = request.into_parts();

    let bytes = match axum::body::to_bytes(body, MAX_BODY_BYTES).await {
        Ok(bytes) => bytes,
        Err(_) => {
            crate::metrics::observe_http_request(&route, "POST", 400, started.elapsed());
            return invalid_body().into_response();
        }
    };

    if let Err(err) = state
        .verifier
        .verify_headers(&parts.headers, &bytes, unix_epoch_ms_now())
    {
        crate::metrics::inc_signature_rejection(err.reason());
        crate::metrics::observe_http_request(&route, "POST", 401, started.elapsed());
        return error_response(
            &ServiceError::Authentication("Invalid request signature"),
            state.expose_internal,
        )
        .into_response();
    }

    next.run(Request::from_parts(parts, Body::from(bytes))).await
}

async fn read_phi(
    State(state): State<AppState>,
    headers: HeaderMap,
    req: Result<Json<PhiFetchRequest>, JsonRejection>,
) -> Result<Json<ApiSuccess<PhiData>>, ApiError> {
    let started = Instant::now();
    let request_id = extract_request_id(&headers);

    let span = tracing::info_span!(
        "phi_broker.read",
        request_id = %request_id,
        client_id = tracing::field::Empty,
        role = tracing::field::Empty,
        latency_ms = tracing::field::Empty,
        outcome = tracing::field::Empty,
    );

    let result = async {
        let Json(req) = req.map_err(|_| invalid_body())?;
        let client_id = parse_client_id(&req.client_id).ok_or_else(invalid_client_id)?;
        tracing::Span::current().record("client_id", tracing::field::display(client_id));
        tracing::Span::current().record("role", req.requester.role.as_str());

        let (outcome, phi) = match sokana_policy::decide(&req.requester, client_id, PhiAction::Read) {
            Decision::Allow => {
                let phi = state
                    .repository
                    .get_phi_by_client_id(client_id)
                    .await
                    .map_err(|err| {
                        crate::metrics::observe_phi_access("read", "error");
                        tracing::error!(error = %err, "phi_broker.read_failed");
                        error_response(&store_error(err), state.expose_internal)
                    })?;
                tracing::info!(field_count = phi.len(), "phi_broker.read");
                ("allowed", phi)
            }
            Decision::Deny(Denial::SilentEmpty) => {
                tracing::info!("phi_broker.read_denied");
                ("denied", PhiData::new())
            }
            Decision::Deny(Denial::Forbidden) => {
                crate::metrics::observe_phi_access("read", "denied");
                return Err(forbidden(state.expose_internal));
            }
        };

        crate::metrics::observe_phi_access("read", outcome);
        tracing::Span::current().record("outcome", outcome);
        Ok::<_, ApiError>(Json(ApiSuccess::new(phi)))
    }
    .instrument(span.clone())
    .await;

    span.record("latency_ms", started.elapsed().as_millis() as u64);
    if result.is_err() {
        span.record("outcome", "error");
    }

    observe("/v1/phi/client", &result, started);
    result
}

async fn update_phi(
    State(state): State<AppState>,
    headers: HeaderMap,
    req: Result<Json<PhiUpdateRequest>, JsonRejection>,
) -> Result<Json<ApiSuccess<PhiData>>, ApiError> {
    let started = Instant::now();
    let request_id = extract_request_id(&headers);

    let span = tracing::info_span!(
        "phi_broker.update",
        request_id = %request_id,
        client_id = tracing::field::Empty,
        role = tracing::field::Empty,
        field_count = tracing::field::Empty,
        latency_ms = tracing::field::Empty,
        outcome = tracing::field::Empty,
    );

    let result = async {
        let Json(req) = req.map_err(|_| invalid_body())?;
        let client_id = parse_client_id(&req.client_id).ok_or_else(invalid_client_id)?;
        tracing::Span::current().record("client_id", tracing::field::display(client_id));
        tracing::Span::current().record("role", req.requester.role.as_str());

        let patch = PhiPatch::from_map(&req.fields)
            .map_err(|err| error_response(&ServiceError::from(err), state.expose_internal))?;
        tracing::Span::current().record("field_count", patch.len());

        match sokana_policy::decide(&req.requester, client_id, PhiAction::Write) {
            Decision::Allow => {}
            Decision::Deny(_) => {
                crate::metrics::observe_phi_access("write", "denied");
                tracing::Span::current().record("outcome", "denied");
                tracing::warn!("phi_broker.update_denied");
                return Err(forbidden(state.expose_internal));
            }
        }

        let written = state
            .repository
            .update_phi(client_id, &patch)
            .await
            .map_err(|err| {
                crate::metrics::observe_phi_access("write", "error");
                tracing::error!(error = %err, "phi_broker.update_failed");
                error_response(&store_error(err), state.expose_internal)
            })?;

        crate::metrics::observe_phi_access("write", "allowed");
        tracing::Span::current().record("outcome", "ok");
        tracing::info!(fields = ?patch.field_names(), "phi_broker.updated");
        Ok::<_, ApiError>(Json(ApiSuccess::new(written)))
    }
    .instrument(span.clone())
    .await;

    span.record("latency_ms", started.elapsed().as_millis() as u64);
    observe("/v1/phi/client/update", &result, started);
    result
}

fn observe<T>(route: &str, result: &Result<T, ApiError>, started: Instant) {
    let status = match result {
        Ok(_) => StatusCode::OK,
        Err((status, _)) => *status,
    };
    crate::metrics::observe_http_request(route, "POST", status.as_u16(), started.elapsed());
}

fn store_error(err: PhiStoreError) -> ServiceError {
    match err {
        PhiStoreError::Unavailable | PhiStoreError::Timeout => {
            ServiceError::Unavailable("PHI store unavailable")
        }
        PhiStoreError::InvalidValue { field } => {
            ServiceError::Validation(format!("Invalid value for field {}", field))
        }
        PhiStoreError::Query { .. } => ServiceError::Internal(err.to_string()),
    }
}

fn error_response(err: &ServiceError, expose_internal: bool) -> ApiError {
    let status = match err {
        ServiceError::Validation(_) => StatusCode::BAD_REQUEST,
        ServiceError::Authentication(_) => StatusCode::UNAUTHORIZED,
        ServiceError::Authorization(_) => StatusCode::FORBIDDEN,
        ServiceError::NotFound(_) => StatusCode::NOT_FOUND,
        ServiceError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        ServiceError::BadGateway(_) => StatusCode::BAD_GATEWAY,
        ServiceError::NotImplemented(_) => StatusCode::NOT_IMPLEMENTED,
        ServiceError::Configuration(_) | ServiceError::Internal(_) => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    };
    (
        status,
        Json(ApiFailure::new(
            err.public_message(expose_internal),
            Some(err.code()),
        )),
    )
}

fn forbidden(expose_internal: bool) -> ApiError {
    error_response(
        &ServiceError::Authorization("Not authorized to modify PHI for this client"),
        expose_internal,
    )
}

fn invalid_body() -> ApiError {
    error_response(
        &ServiceError::Validation("Invalid request body".to_string()),
        false,
    )
}

fn invalid_client_id() -> ApiError {
    error_response(
        &ServiceError::Validation("Invalid client ID format".to_string()),
        false,
    )
}

fn extract_request_id(headers: &HeaderMap) -> String {
    headers
        .get(REQUEST_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim())
        .filter(|v| !v.is_empty())
        .and_then(sanitize_request_id)
        .unwrap_or_else(|| Ulid::new().to_string())
}

fn sanitize_request_id(raw: &str) -> Option<String> {
    const MAX_LEN: usize = 64;
    let out: String = raw
        .chars()
        .filter(|ch| ch.is_ascii_alphanumeric() || matches!(ch, '-' | '_' | '.'))
        .take(MAX_LEN)
        .collect();
    (!out.is_empty()).then_some(out)
}
