use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, HeaderValue, StatusCode, header};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;
use serde_json::Value;
use sokana_auth::RequestSigner;
use sokana_contracts::env::StartupError;
use sokana_contracts::{ApiFailure, ApiSuccess, PhiData, Role, ServiceError};
use subtle::ConstantTimeEq;
use tracing::Instrument;
use ulid::Ulid;

use crate::broker::{PhiBrokerClient, REQUEST_ID_HEADER};
use crate::config::ApiConfig;
use crate::directory::{ClientDirectory, PgClientDirectory};
use crate::orchestrator::{Identity, PhiOrchestrator};

pub const USER_ID_HEADER: &str = "x-sokana-user-id";
pub const USER_ROLE_HEADER: &str = "x-sokana-user-role";
pub const AUTH_SECRET_HEADER: &str = "x-sokana-auth-secret";

const DIRECTORY_QUERY_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Clone)]
pub struct AppState<D> {
    orchestrator: PhiOrchestrator<D>,
    auth_shared_secret: Option<String>,
    expose_internal: bool,
}

impl<D: ClientDirectory> AppState<D> {
    pub fn new(
        orchestrator: PhiOrchestrator<D>,
        auth_shared_secret: Option<String>,
        expose_internal: bool,
    ) -> Self {
        Self {
            orchestrator,
            auth_shared_secret,
            expose_internal,
        }
    }
}

type ApiError = (StatusCode, Json<ApiFailure>);

pub async fn router(config: &ApiConfig) -> Result<Router, StartupError> {
    let directory = PgClientDirectory::connect(&config.db_url, DIRECTORY_QUERY_TIMEOUT)
        .await
        .map_err(|_| {
            StartupError::new(
                "ERR_DB_UNAVAILABLE",
                "failed to initialize operational database pool",
            )
        })?;

    let signer = RequestSigner::new(&config.broker_secret).map_err(|_| {
        StartupError::new("ERR_MISSING_CONFIG", "PHI_BROKER_SECRET must be set")
    })?;
    let broker = PhiBrokerClient::new(
        reqwest::Client::new(),
        config.broker_url.clone(),
        signer,
        config.broker_timeout(),
    );

    tracing::info!(
        phi_store_mode = config.phi_store_mode.as_str(),
        "api.phi_store_mode"
    );

    let orchestrator = PhiOrchestrator::new(directory, broker, config.phi_store_mode);
    Ok(router_with_state(AppState::new(
        orchestrator,
        config.auth_shared_secret.clone(),
        config.runtime_env.is_development(),
    )))
}

pub fn router_with_state<D: ClientDirectory>(state: AppState<D>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz::<D>))
        .route("/metrics", get(metrics))
        .route("/clients/{id}", get(get_client::<D>))
        .route(
            "/clients/{id}/phi",
            get(get_client_phi::<D>).put(put_client_phi::<D>),
        )
        .with_state(state)
}

async fn healthz() -> &'static str {
    "ok"
}

#[derive(Debug, Serialize)]
struct ReadyzResponse {
    status: &'static str,
    checks: BTreeMap<&'static str, bool>,
}

async fn readyz<D: ClientDirectory>(State(state): State<AppState<D>>) -> impl IntoResponse {
    let mut checks = BTreeMap::new();
    checks.insert(
        "operational_db",
        state.orchestrator.directory().ping().await.is_ok(),
    );
    checks.insert(
        "phi_broker",
        state.orchestrator.broker().health().await.is_ok(),
    );

    let all_ready = checks.values().all(|ok| *ok);
    let status = if all_ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        status,
        Json(ReadyzResponse {
            status: if all_ready { "ready" } else { "not_ready" },
            checks,
        }),
    )
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

async fn put_client_phi<D: ClientDirectory>(
    State(state): State<AppState<D>>,
    Path(id): Path<String>,
    headers: HeaderMap,
    body: Result<Json<Value>, JsonRejection>,
) -> Result<Json<ApiSuccess<PhiData>>, ApiError> {
    let started = Instant::now();
    let request_id = extract_request_id(&headers);

    let span = tracing::info_span!(
        "api.phi_update",
        request_id = %request_id,
        client_id = tracing::field::Empty,
        role = tracing::field::Empty,
        latency_ms = tracing::field::Empty,
        outcome = tracing::field::Empty,
    );

    let result = async {
        let identity = extract_identity(&state, &headers)?;
        tracing::Span::current().record("role", identity.role.as_str());

        let Json(body) = body.map_err(|_| {
            error_response(
                &ServiceError::Validation("Invalid JSON body".to_string()),
                false,
            )
        })?;

        let data = state
            .orchestrator
            .update_client_phi(&id, &identity, &body, &request_id)
            .await
            .map_err(|err| error_response(&err, state.expose_internal))?;

        tracing::Span::current().record("outcome", "ok");
        Ok::<_, ApiError>(Json(ApiSuccess::new(data)))
    }
    .instrument(span.clone())
    .await;

    finish(&span, "/clients/{id}/phi", "PUT", &result, started);
    result
}

async fn get_client_phi<D: ClientDirectory>(
    State(state): State<AppState<D>>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<ApiSuccess<PhiData>>, ApiError> {
    let started = Instant::now();
    let request_id = extract_request_id(&headers);

    let span = tracing::info_span!(
        "api.phi_read",
        request_id = %request_id,
        client_id = tracing::field::Empty,
        role = tracing::field::Empty,
        latency_ms = tracing::field::Empty,
        outcome = tracing::field::Empty,
    );

    let result = async {
        let identity = extract_identity(&state, &headers)?;
        tracing::Span::current().record("role", identity.role.as_str());

        let data = state
            .orchestrator
            .read_client_phi(&id, &identity, &request_id)
            .await
            .map_err(|err| error_response(&err, state.expose_internal))?;

        tracing::Span::current().record("outcome", "ok");
        Ok::<_, ApiError>(Json(ApiSuccess::new(data)))
    }
    .instrument(span.clone())
    .await;

    finish(&span, "/clients/{id}/phi", "GET", &result, started);
    result
}

async fn get_client<D: ClientDirectory>(
    State(state): State<AppState<D>>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<ApiSuccess<PhiData>>, ApiError> {
    let started = Instant::now();
    let request_id = extract_request_id(&headers);

    let span = tracing::info_span!(
        "api.client_read",
        request_id = %request_id,
        role = tracing::field::Empty,
        latency_ms = tracing::field::Empty,
        outcome = tracing::field::Empty,
    );

    let result = async {
        let identity = extract_identity(&state, &headers)?;
        tracing::Span::current().record("role", identity.role.as_str());

        let record = state
            .orchestrator
            .load_client_record(&id, &identity, &request_id)
            .await
            .map_err(|err| error_response(&err, state.expose_internal))?;

        tracing::Span::current().record("outcome", "ok");
        Ok::<_, ApiError>(Json(ApiSuccess::new(record)))
    }
    .instrument(span.clone())
    .await;

    finish(&span, "/clients/{id}", "GET", &result, started);
    result
}

fn finish<T>(
    span: &tracing::Span,
    route: &str,
    method: &str,
    result: &Result<T, ApiError>,
    started: Instant,
) {
    span.record("latency_ms", started.elapsed().as_millis() as u64);
    let status = match result {
        Ok(_) => StatusCode::OK,
        Err((status, _)) => {
            span.record("outcome", "error");
            *status
        }
    };
    crate::metrics::observe_http_request(route, method, status.as_u16(), started.elapsed());
}

fn extract_identity<D>(state: &AppState<D>, headers: &HeaderMap) -> Result<Identity, ApiError> {
    validate_auth_shared_secret(headers, state.auth_shared_secret.as_deref())?;

    let user_id = header_value(headers, USER_ID_HEADER).ok_or_else(|| {
        error_response(
            &ServiceError::Authentication("missing x-sokana-user-id header"),
            false,
        )
    })?;
    let role = header_value(headers, USER_ROLE_HEADER)
        .map(Role::from)
        .unwrap_or(Role::Other);

    Ok(Identity {
        user_id: user_id.to_string(),
        role,
    })
}

fn validate_auth_shared_secret(
    headers: &HeaderMap,
    expected_secret: Option<&str>,
) -> Result<(), ApiError> {
    let Some(expected_secret) = expected_secret else {
        return Ok(());
    };

    let provided_secret = header_value(headers, AUTH_SECRET_HEADER).ok_or_else(|| {
        error_response(
            &ServiceError::Authentication("missing auth secret"),
            false,
        )
    })?;

    if !secrets_match(provided_secret, expected_secret) {
        return Err(error_response(
            &ServiceError::Authentication("invalid auth secret"),
            false,
        ));
    }

    Ok(())
}

fn secrets_match(provided: &str, expected: &str) -> bool {
    let (provided, expected) = (provided.as_bytes(), expected.as_bytes());
    provided.len() == expected.len() && bool::from(provided.ct_eq(expected))
}

fn header_value<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim())
        .filter(|v| !v.is_empty())
}

fn extract_request_id(headers: &HeaderMap) -> String {
    header_value(headers, REQUEST_ID_HEADER)
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
