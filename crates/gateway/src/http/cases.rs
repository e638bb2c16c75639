use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use lexlead_contracts::CoreError;
use lexlead_policy::CaseView;
use serde::Serialize;

use super::{ApiError, AppState, core_error_response, op_error_response, resolve_viewer, store_error_response};

#[derive(Debug, Serialize)]
pub(super) struct CaseListResponse {
    cases: Vec<CaseView>,
}

/// Role-scoped listing; every row passes through the projection so the
/// response can never contain more than the viewer's relation allows.
pub(super) async fn list_cases(
    State(state): State<AppState>,
    headers: axum::http::HeaderMap,
) -> Result<Json<CaseListResponse>, ApiError> {
    let viewer = resolve_viewer(&state, &headers).await?;

    let rows = state
        .store
        .list_cases_for_viewer(&viewer)
        .await
        .map_err(|err| store_error_response(&err))?;

    let cases = rows
        .iter()
        .filter_map(|row| lexlead_policy::project(&row.case, &viewer, &row.assignments))
        .collect();

    Ok(Json(CaseListResponse { cases }))
}

pub(super) async fn get_case(
    State(state): State<AppState>,
    Path(case_id): Path<String>,
    headers: axum::http::HeaderMap,
) -> Result<Json<CaseView>, ApiError> {
    let viewer = resolve_viewer(&state, &headers).await?;

    let case = state
        .store
        .get_case(&case_id)
        .await
        .map_err(|err| store_error_response(&err))?
        .ok_or_else(|| core_error_response(&CoreError::NotFound))?;

    let assignments = state
        .store
        .assignments_for_case(&case_id)
        .await
        .map_err(|err| store_error_response(&err))?;

    // A refused projection is indistinguishable from a missing case.
    lexlead_policy::project(&case, &viewer, &assignments)
        .map(Json)
        .ok_or_else(|| core_error_response(&CoreError::NotFound))
}

pub(super) async fn close_case(
    State(state): State<AppState>,
    Path(case_id): Path<String>,
    headers: axum::http::HeaderMap,
) -> Result<Json<CaseView>, ApiError> {
    let started = std::time::Instant::now();

    let result = async {
        let viewer = resolve_viewer(&state, &headers).await?;

        let case = state
            .store
            .close_case(&case_id, &viewer)
            .await
            .map_err(|err| op_error_response(&err))?;

        crate::metrics::observe_case_transition(case.status.as_str());

        let assignments = state
            .store
            .assignments_for_case(&case_id)
            .await
            .map_err(|err| store_error_response(&err))?;

        lexlead_policy::project(&case, &viewer, &assignments)
            .map(Json)
            .ok_or_else(|| core_error_response(&CoreError::NotFound))
    }
    .await;

    let status = match &result {
        Ok(_) => StatusCode::OK,
        Err((status, _)) => *status,
    };
    crate::metrics::observe_http_request(
        "/v1/cases/{case_id}/close",
        "POST",
        status.as_u16(),
        started.elapsed(),
    );
    result
}
