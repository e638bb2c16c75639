use std::collections::BTreeMap;
use std::time::Duration;

use axum::extract::State;
use axum::http::{HeaderMap, HeaderValue, StatusCode, header};
use axum::response::IntoResponse;
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use lexlead_contracts::{CoreError, Role, Viewer};
use lexlead_store::{CaseStore, OpError, StoreError};
use serde::Serialize;
use ulid::Ulid;

use crate::config::{GatewayConfig, StartupError};
use crate::permission_cache::PermissionCache;
use crate::rate_limit::RateLimiter;
use crate::storage::{StorageClient, StorageError};

mod cases;
mod documents;
mod hooks;
mod marketplace;

#[derive(Clone)]
pub struct AppState {
    pub config: GatewayConfig,
    store: CaseStore,
    storage: StorageClient,
    permissions: PermissionCache,
    rate_limiter: RateLimiter,
}

type ApiError = (StatusCode, Json<ErrorResponse>);

pub async fn router(config: GatewayConfig) -> Result<Router, StartupError> {
    let store = CaseStore::connect_and_migrate(
        &config.db_url,
        Duration::from_millis(config.db_write_timeout_ms),
    )
    .await
    .map_err(|err| StartupError {
        code: "ERR_STORE_UNAVAILABLE",
        message: format!("failed to initialize case store: {}", err),
    })?;

    let storage = StorageClient::new(
        config.storage_url.clone(),
        Duration::from_millis(config.storage_timeout_ms),
        config.storage_token.clone(),
    )
    .map_err(|_| StartupError {
        code: "ERR_STORAGE_UNAVAILABLE",
        message: "failed to initialize storage client".to_string(),
    })?;

    let permissions = PermissionCache::new(
        config.permission_cache_max_entries,
        Duration::from_millis(config.permission_cache_ttl_ms),
    );
    let rate_limiter = RateLimiter::new(
        Duration::from_secs(config.rate_limit_window_secs.max(1)),
        16_384,
    );

    let state = AppState {
        config,
        store,
        storage,
        permissions,
        rate_limiter,
    };

    Ok(Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/metrics", get(metrics))
        .route("/v1/hooks/intake", post(hooks::intake))
        .route("/v1/hooks/payment-succeeded", post(hooks::payment_succeeded))
        .route("/v1/hooks/payment-confirmed", post(hooks::payment_confirmed))
        .route("/v1/hooks/analysis-ready", post(hooks::analysis_ready))
        .route("/v1/cases", get(cases::list_cases))
        .route("/v1/cases/{case_id}", get(cases::get_case))
        .route("/v1/cases/{case_id}/close", post(cases::close_case))
        .route("/v1/cases/{case_id}/purchase", post(marketplace::purchase))
        .route("/v1/cases/{case_id}/assign", post(marketplace::assign))
        .route(
            "/v1/cases/{case_id}/documents",
            get(documents::list_documents),
        )
        .route(
            "/v1/cases/{case_id}/documents/{kind}",
            post(documents::upload_document),
        )
        .route(
            "/v1/documents/{kind}/{document_id}/url",
            get(documents::document_url),
        )
        .route(
            "/v1/documents/{kind}/{document_id}",
            delete(documents::delete_document),
        )
        .route("/v1/session/invalidate", post(invalidate_session))
        .with_state(state))
}

async fn healthz() -> &'static str {
    "ok"
}

#[derive(Debug, Serialize)]
struct ReadyzResponse {
    status: &'static str,
    checks: BTreeMap<&'static str, bool>,
}

async fn readyz(State(state): State<AppState>) -> impl IntoResponse {
    let mut checks = BTreeMap::new();

    let store_ready = state.store.ping().await.is_ok();
    checks.insert("store", store_ready);

    let storage_ready = state.storage.ready().await.is_ok();
    checks.insert("storage", storage_ready);

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

#[derive(Debug, Serialize)]
struct InvalidateSessionResponse {
    invalidated: bool,
}

/// Sign-out hook: drops the caller's permission cache entry so a role
/// change lands on the very next request.
async fn invalidate_session(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<InvalidateSessionResponse>, ApiError> {
    let viewer = resolve_viewer(&state, &headers).await?;
    state.permissions.invalidate(&viewer.account_id).await;
    Ok(Json(InvalidateSessionResponse { invalidated: true }))
}

// ---- viewer resolution --------------------------------------------------

/// Resolves the calling viewer: shared-secret gate (when configured), then
/// the account-id header, then the role from the permission cache or the
/// accounts table. Role claims are never read from the request.
async fn resolve_viewer(state: &AppState, headers: &HeaderMap) -> Result<Viewer, ApiError> {
    require_auth_secret(state, headers)?;

    let raw = headers
        .get("x-lexlead-account-id")
        .and_then(|value| value.to_str().ok())
        .map(|value| value.trim())
        .filter(|value| !value.is_empty())
        .ok_or_else(|| {
            json_error(
                StatusCode::UNAUTHORIZED,
                "ERR_AUTH_REQUIRED",
                "missing x-lexlead-account-id header",
                false,
            )
        })?;

    let account_id = sanitize_id(raw).ok_or_else(|| {
        json_error(
            StatusCode::UNAUTHORIZED,
            "ERR_AUTH_INVALID",
            "malformed x-lexlead-account-id header",
            false,
        )
    })?;

    let grant = match state.permissions.get(&account_id).await {
        Some(grant) => {
            crate::metrics::observe_permission_cache("hit");
            grant
        }
        None => {
            crate::metrics::observe_permission_cache("miss");
            let grant = state
                .store
                .account_grant(&account_id)
                .await
                .map_err(|err| store_error_response(&err))?
                .ok_or_else(|| {
                    json_error(
                        StatusCode::UNAUTHORIZED,
                        "ERR_AUTH_UNKNOWN_ACCOUNT",
                        "account is not registered",
                        false,
                    )
                })?;
            state.permissions.put(&account_id, grant).await;
            grant
        }
    };

    Ok(Viewer {
        account_id,
        role: grant.role,
        lawyer_tier: grant.lawyer_tier,
    })
}

fn require_auth_secret(state: &AppState, headers: &HeaderMap) -> Result<(), ApiError> {
    let Some(expected) = state.config.auth_shared_secret.as_deref() else {
        return Ok(());
    };

    let presented = headers
        .get("x-lexlead-auth-secret")
        .and_then(|value| value.to_str().ok())
        .unwrap_or("");

    if presented == expected {
        Ok(())
    } else {
        Err(json_error(
            StatusCode::UNAUTHORIZED,
            "ERR_AUTH_INVALID",
            "missing or invalid auth secret",
            false,
        ))
    }
}

fn require_hook_secret(state: &AppState, headers: &HeaderMap) -> Result<(), ApiError> {
    let presented = headers
        .get("x-lexlead-hook-secret")
        .and_then(|value| value.to_str().ok())
        .unwrap_or("");

    if presented == state.config.hook_secret {
        Ok(())
    } else {
        Err(json_error(
            StatusCode::UNAUTHORIZED,
            "ERR_AUTH_INVALID_HOOK_SECRET",
            "missing or invalid hook secret",
            false,
        ))
    }
}

fn require_role(viewer: &Viewer, role: Role) -> Result<(), ApiError> {
    if viewer.role == role {
        Ok(())
    } else {
        Err(core_error_response(&CoreError::Forbidden))
    }
}

// ---- request plumbing ---------------------------------------------------

fn extract_request_id(headers: &HeaderMap) -> String {
    headers
        .get("x-request-id")
        .and_then(|value| value.to_str().ok())
        .and_then(sanitize_id)
        .unwrap_or_else(|| Ulid::new().to_string())
}

fn sanitize_id(raw: &str) -> Option<String> {
    const MAX_LEN: usize = 64;
    let mut out = String::with_capacity(raw.len().min(MAX_LEN));

    for ch in raw.chars() {
        if out.len() >= MAX_LEN {
            break;
        }
        if ch.is_ascii_alphanumeric() || matches!(ch, '-' | '_' | '.') {
            out.push(ch);
        }
    }

    (!out.is_empty()).then_some(out)
}

// ---- error surface ------------------------------------------------------

#[derive(Debug, Serialize)]
struct ErrorResponse {
    code: String,
    message: String,
    retryable: bool,
}

fn json_error(
    status: StatusCode,
    code: impl Into<String>,
    message: impl Into<String>,
    retryable: bool,
) -> ApiError {
    (
        status,
        Json(ErrorResponse {
            code: code.into(),
            message: message.into(),
            retryable,
        }),
    )
}

fn invalid_params(message: impl Into<String>) -> ApiError {
    json_error(StatusCode::BAD_REQUEST, "ERR_INVALID_PARAMS", message, false)
}

/// One HTTP status per taxonomy value; every domain rejection surfaces its
/// stable code verbatim.
fn core_error_response(err: &CoreError) -> ApiError {
    let status = match err {
        CoreError::Forbidden => StatusCode::FORBIDDEN,
        CoreError::NotFound => StatusCode::NOT_FOUND,
        CoreError::InvalidTransition { .. }
        | CoreError::CaseNotAvailable { .. }
        | CoreError::SlotExhausted
        | CoreError::AlreadyPurchased
        | CoreError::CaseClosed => StatusCode::CONFLICT,
    };
    json_error(status, err.code(), err.to_string(), false)
}

fn store_error_response(err: &StoreError) -> ApiError {
    match err {
        StoreError::Timeout => json_error(
            StatusCode::GATEWAY_TIMEOUT,
            "ERR_SOURCE_TIMEOUT",
            "database operation timed out",
            true,
        ),
        other => {
            tracing::error!(error = %other, "store operation failed");
            json_error(
                StatusCode::SERVICE_UNAVAILABLE,
                "ERR_STORE_UNAVAILABLE",
                "database unavailable",
                true,
            )
        }
    }
}

fn op_error_response(err: &OpError) -> ApiError {
    match err {
        OpError::Domain(core) => core_error_response(core),
        OpError::Store(store) => store_error_response(store),
    }
}

fn storage_error_response(err: &StorageError) -> ApiError {
    match err {
        StorageError::Timeout => json_error(
            StatusCode::GATEWAY_TIMEOUT,
            "ERR_SOURCE_TIMEOUT",
            "storage operation timed out",
            true,
        ),
        other => {
            tracing::error!(error = %other, "storage operation failed");
            json_error(
                StatusCode::SERVICE_UNAVAILABLE,
                "ERR_STORAGE_UNAVAILABLE",
                "object storage unavailable",
                true,
            )
        }
    }
}
