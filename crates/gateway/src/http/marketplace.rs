use std::time::Instant;

use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::Json;
use lexlead_contracts::{CoreError, Role};
use lexlead_policy::CaseView;
use serde::{Deserialize, Serialize};
use tracing::Instrument;

use super::{
    ApiError, AppState, core_error_response, extract_request_id, json_error, op_error_response,
    require_role, resolve_viewer, store_error_response,
};

#[derive(Debug, Serialize)]
pub(super) struct PurchaseResponse {
    case: CaseView,
    assignment_id: String,
    already_assigned: bool,
}

/// Lawyer claims one purchase slot. Success-equivalent on retry; every
/// rejection carries its taxonomy code.
pub(super) async fn purchase(
    State(state): State<AppState>,
    Path(case_id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<PurchaseResponse>, ApiError> {
    let started = Instant::now();
    let request_id = extract_request_id(&headers);

    let result = async {
        let viewer = resolve_viewer(&state, &headers).await?;
        require_role(&viewer, Role::Lawyer)?;

        if !state.rate_limiter.allow(
            format!("purchase:{}", viewer.account_id).as_str(),
            state.config.purchase_rate_limit,
        ) {
            return Err(json_error(
                StatusCode::TOO_MANY_REQUESTS,
                "ERR_RATE_LIMITED",
                "rate limit exceeded for purchases",
                true,
            ));
        }

        let span = tracing::info_span!(
            "marketplace.purchase",
            request_id = %request_id,
            case_id = %case_id,
            lawyer_id = %viewer.account_id,
            outcome = tracing::field::Empty,
        );

        let receipt = async {
            let receipt = state.store.purchase(&case_id, &viewer.account_id).await;
            match &receipt {
                Ok(r) if r.already_assigned => {
                    tracing::Span::current().record("outcome", "already_assigned");
                    crate::metrics::observe_purchase("already_assigned");
                }
                Ok(_) => {
                    tracing::Span::current().record("outcome", "granted");
                    crate::metrics::observe_purchase("granted");
                }
                Err(lexlead_store::OpError::Domain(core)) => {
                    tracing::Span::current().record("outcome", core.code());
                    crate::metrics::observe_purchase(core.code());
                }
                Err(_) => {
                    tracing::Span::current().record("outcome", "store_error");
                    crate::metrics::observe_purchase("store_error");
                }
            }
            receipt
        }
        .instrument(span)
        .await
        .map_err(|err| op_error_response(&err))?;

        if receipt.case.status == lexlead_contracts::CaseStatus::Exhausted
            && !receipt.already_assigned
        {
            crate::metrics::observe_case_transition(receipt.case.status.as_str());
        }

        let assignments = state
            .store
            .assignments_for_case(&case_id)
            .await
            .map_err(|err| store_error_response(&err))?;

        let case = lexlead_policy::project(&receipt.case, &viewer, &assignments)
            .ok_or_else(|| core_error_response(&CoreError::NotFound))?;

        Ok(Json(PurchaseResponse {
            case,
            assignment_id: receipt.assignment.assignment_id,
            already_assigned: receipt.already_assigned,
        }))
    }
    .await;

    let status = match &result {
        Ok(_) => StatusCode::OK,
        Err((status, _)) => *status,
    };
    crate::metrics::observe_http_request(
        "/v1/cases/{case_id}/purchase",
        "POST",
        status.as_u16(),
        started.elapsed(),
    );
    result
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub(super) struct AssignRequest {
    lawyer_id: String,
    #[serde(default)]
    notes: Option<String>,
}

#[derive(Debug, Serialize)]
pub(super) struct AssignResponse {
    case: CaseView,
    assignment_id: String,
    already_assigned: bool,
}

/// Privileged manual dispatch past the marketplace, slot count untouched.
pub(super) async fn assign(
    State(state): State<AppState>,
    Path(case_id): Path<String>,
    headers: HeaderMap,
    req: Result<Json<AssignRequest>, JsonRejection>,
) -> Result<Json<AssignResponse>, ApiError> {
    let started = Instant::now();

    let result = async {
        let viewer = resolve_viewer(&state, &headers).await?;

        let Json(req) = req.map_err(|_| {
            super::invalid_params("invalid JSON body")
        })?;

        let lawyer_id = req.lawyer_id.trim();
        if lawyer_id.is_empty() {
            return Err(super::invalid_params("lawyer_id must be non-empty"));
        }

        let receipt = state
            .store
            .assign_operator(&case_id, &viewer, lawyer_id, req.notes)
            .await
            .map_err(|err| op_error_response(&err))?;

        let assignments = state
            .store
            .assignments_for_case(&case_id)
            .await
            .map_err(|err| store_error_response(&err))?;

        let case = lexlead_policy::project(&receipt.case, &viewer, &assignments)
            .ok_or_else(|| core_error_response(&CoreError::NotFound))?;

        Ok(Json(AssignResponse {
            case,
            assignment_id: receipt.assignment.assignment_id,
            already_assigned: receipt.already_assigned,
        }))
    }
    .await;

    let status = match &result {
        Ok(_) => StatusCode::OK,
        Err((status, _)) => *status,
    };
    crate::metrics::observe_http_request(
        "/v1/cases/{case_id}/assign",
        "POST",
        status.as_u16(),
        started.elapsed(),
    );
    result
}
