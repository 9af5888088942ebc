use std::sync::Arc;

use anyhow::Context;
use axum::{
    Json, Router,
    extract::{Path, Request, State},
    http::{HeaderValue, StatusCode, header},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::get,
};
use serde::Serialize;
use tower_http::limit::RequestBodyLimitLayer;
use tracing::{error, info, warn};

use basket_core::models::{PersistedBundle, RemoteBundle, UserProfile, validate_email};
use basket_core::remote::DocumentStore;

// Receipts carry no image bytes, so a full bundle stays well under this
const BODY_LIMIT: usize = 10 * 1024 * 1024; // 10 MB

#[derive(Clone)]
struct AppState {
    store: Arc<DocumentStore>,
    api_key: Option<String>,
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

#[derive(Serialize)]
struct ExistsResponse {
    exists: bool,
}

// --- Error handling ---

enum ApiError {
    NotFound(String),
    BadRequest(String),
    Internal(anyhow::Error),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            Self::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            Self::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            Self::Internal(err) => {
                error!("internal server error: {err:#}");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Internal server error".to_string(),
                )
            }
        };
        (status, Json(ErrorResponse { error: message })).into_response()
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        Self::Internal(err)
    }
}

fn document_key(email: &str) -> Result<String, ApiError> {
    validate_email(email).map_err(|e| ApiError::BadRequest(format!("{e}")))
}

// --- Middleware ---

async fn require_auth(State(state): State<AppState>, request: Request, next: Next) -> Response {
    if let Some(ref expected_key) = state.api_key {
        let authorized = request
            .headers()
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
            .is_some_and(|token| token == expected_key);

        if !authorized {
            return (
                StatusCode::UNAUTHORIZED,
                Json(ErrorResponse {
                    error: "Invalid or missing API key".to_string(),
                }),
            )
                .into_response();
        }
    }
    next.run(request).await
}

async fn security_headers(request: Request, next: Next) -> Response {
    let mut response = next.run(request).await;
    let headers = response.headers_mut();
    headers.insert(
        "x-content-type-options",
        HeaderValue::from_static("nosniff"),
    );
    headers.insert("x-frame-options", HeaderValue::from_static("DENY"));
    headers.insert(
        "content-security-policy",
        HeaderValue::from_static("default-src 'none'"),
    );
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-store"));
    response
}

// --- Handlers ---

async fn get_user(
    State(state): State<AppState>,
    Path(email): Path<String>,
) -> Result<Json<RemoteBundle>, ApiError> {
    let key = document_key(&email)?;
    let bundle = state.store.load(&key).context("database error")?;
    bundle
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("No document for '{key}'")))
}

/// Whole-document overwrite.
async fn put_user(
    State(state): State<AppState>,
    Path(email): Path<String>,
    Json(bundle): Json<PersistedBundle>,
) -> Result<StatusCode, ApiError> {
    let key = document_key(&email)?;
    if bundle.user.has_identity() && document_key(&bundle.user.email)? != key {
        return Err(ApiError::BadRequest(format!(
            "Document email '{}' does not match '{key}'",
            bundle.user.email
        )));
    }
    state
        .store
        .save(&key, &RemoteBundle::from(bundle))
        .context("database error")?;
    info!(email = %key, "stored document");
    Ok(StatusCode::NO_CONTENT)
}

async fn user_exists(
    State(state): State<AppState>,
    Path(email): Path<String>,
) -> Result<Json<ExistsResponse>, ApiError> {
    let key = document_key(&email)?;
    let exists = state.store.contains(&key).context("database error")?;
    Ok(Json(ExistsResponse { exists }))
}

async fn list_users(State(state): State<AppState>) -> Result<Json<Vec<UserProfile>>, ApiError> {
    let profiles = state.store.profiles().context("database error")?;
    Ok(Json(profiles))
}

// --- Router ---

fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/api/users", get(list_users))
        .route("/api/users/{email}", get(get_user).put(put_user))
        .route("/api/users/{email}/exists", get(user_exists))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_auth))
        .layer(RequestBodyLimitLayer::new(BODY_LIMIT))
        .layer(middleware::from_fn(security_headers))
        .with_state(state)
}

/// Router over an in-process store, for loopback tests of the HTTP client.
#[cfg(test)]
pub(crate) fn test_router(store: Arc<DocumentStore>, api_key: Option<String>) -> Router {
    build_router(AppState { store, api_key })
}

// --- Server startup ---

/// First and last four characters of the key, masked when it is too short
/// to show both ends.
fn key_preview(key: &str) -> String {
    let head = key.get(..4);
    let tail = key.get(key.len().saturating_sub(4)..);
    match (head, tail) {
        (Some(head), Some(tail)) if key.len() >= 8 => format!("{head}...{tail}"),
        _ => "****".to_string(),
    }
}

pub async fn start_server(
    store: DocumentStore,
    port: u16,
    bind: &str,
    api_key: Option<String>,
) -> anyhow::Result<()> {
    let state = AppState {
        store: Arc::new(store),
        api_key: api_key.clone(),
    };

    let app = build_router(state);

    if let Some(ref key) = api_key {
        eprintln!(
            "API key: {} (see api_key file in data directory)",
            key_preview(key)
        );
    } else {
        warn!("authentication disabled (--no-auth); the API is open to anyone");
    }

    if bind != "127.0.0.1" && bind != "localhost" && api_key.is_none() {
        warn!("listening on {bind} with no authentication; any device on your network can read every document");
    }

    let listener = tokio::net::TcpListener::bind(format!("{bind}:{port}"))
        .await
        .with_context(|| format!("Failed to bind {bind}:{port}"))?;
    eprintln!("Listening on http://{bind}:{port}");
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutting down");
        })
        .await?;

    Ok(())
}
