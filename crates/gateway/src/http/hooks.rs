use std::time::Instant;

use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::Json;
use lexlead_contracts::{CaseStatus, DraftContact, LeadTier};
use lexlead_store::{AnalysisUpdate, NewCase};
use serde::{Deserialize, Serialize};

use super::{
    ApiError, AppState, invalid_params, op_error_response, require_hook_secret, sanitize_id,
    store_error_response,
};

#[derive(Debug, Serialize)]
pub(super) struct HookCaseResponse {
    case_id: String,
    status: CaseStatus,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub(super) struct IntakeContact {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    email: Option<String>,
    #[serde(default)]
    phone: Option<String>,
    #[serde(default)]
    city: Option<String>,
    #[serde(default)]
    company_name: Option<String>,
    #[serde(default)]
    company_role: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub(super) struct IntakeRequest {
    specialty_id: String,
    lead_tier: String,
    purchase_cost: i64,
    purchase_limit: i32,
    /// Present when the intake funnel already knows the signed-in client;
    /// links the draft immediately so the owner can attach documents
    /// before payment.
    #[serde(default)]
    account_id: Option<String>,
    #[serde(default)]
    contact: IntakeContact,
}

/// Intake funnel submitted a new matter: the case starts in `draft`,
/// anonymous, carrying only the self-reported contact sketch.
pub(super) async fn intake(
    State(state): State<AppState>,
    headers: HeaderMap,
    req: Result<Json<IntakeRequest>, JsonRejection>,
) -> Result<Json<HookCaseResponse>, ApiError> {
    let started = Instant::now();

    let result = async {
        require_hook_secret(&state, &headers)?;
        let Json(req) = req.map_err(|_| invalid_params("invalid JSON body"))?;

        let specialty_id = req.specialty_id.trim();
        if specialty_id.is_empty() {
            return Err(invalid_params("specialty_id must be non-empty"));
        }
        let lead_tier = LeadTier::parse(req.lead_tier.trim())
            .ok_or_else(|| invalid_params("lead_tier must be standard, premium or urgent"))?;
        if req.purchase_cost < 0 {
            return Err(invalid_params("purchase_cost must be >= 0"));
        }
        if req.purchase_limit < 1 {
            return Err(invalid_params("purchase_limit must be >= 1"));
        }
        let owner_id = match req.account_id.as_deref().map(str::trim) {
            None | Some("") => None,
            Some(raw) => {
                Some(sanitize_id(raw).ok_or_else(|| invalid_params("account_id is malformed"))?)
            }
        };

        let case = state
            .store
            .create_case(NewCase {
                specialty_id: specialty_id.to_string(),
                lead_tier,
                purchase_cost: req.purchase_cost,
                purchase_limit: req.purchase_limit,
                owner_id,
                draft_contact: DraftContact {
                    name: req.contact.name,
                    email: req.contact.email,
                    phone: req.contact.phone,
                    city: req.contact.city,
                    company_name: req.contact.company_name,
                    company_role: req.contact.company_role,
                },
            })
            .await
            .map_err(|err| store_error_response(&err))?;

        crate::metrics::observe_case_transition(case.status.as_str());
        tracing::info!(
            case_id = case.case_id.as_str(),
            specialty_id,
            lead_tier = case.lead_tier.as_str(),
            "case created from intake"
        );

        Ok(Json(HookCaseResponse {
            case_id: case.case_id,
            status: case.status,
        }))
    }
    .await;

    observe(&result, "/v1/hooks/intake", started);
    result
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub(super) struct PaymentSucceededRequest {
    case_id: String,
}

pub(super) async fn payment_succeeded(
    State(state): State<AppState>,
    headers: HeaderMap,
    req: Result<Json<PaymentSucceededRequest>, JsonRejection>,
) -> Result<Json<HookCaseResponse>, ApiError> {
    let started = Instant::now();

    let result = async {
        require_hook_secret(&state, &headers)?;
        let Json(req) = req.map_err(|_| invalid_params("invalid JSON body"))?;

        let case = state
            .store
            .payment_succeeded(&req.case_id)
            .await
            .map_err(|err| op_error_response(&err))?;

        crate::metrics::observe_case_transition(case.status.as_str());

        Ok(Json(HookCaseResponse {
            case_id: case.case_id,
            status: case.status,
        }))
    }
    .await;

    observe(&result, "/v1/hooks/payment-succeeded", started);
    result
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub(super) struct PaymentConfirmedRequest {
    case_id: String,
    account_id: String,
}

/// Payment cleared and the payer authenticated: the case goes on the
/// market and the draft contact backfills the account profile.
pub(super) async fn payment_confirmed(
    State(state): State<AppState>,
    headers: HeaderMap,
    req: Result<Json<PaymentConfirmedRequest>, JsonRejection>,
) -> Result<Json<HookCaseResponse>, ApiError> {
    let started = Instant::now();

    let result = async {
        require_hook_secret(&state, &headers)?;
        let Json(req) = req.map_err(|_| invalid_params("invalid JSON body"))?;

        let account_id = req.account_id.trim();
        if account_id.is_empty() {
            return Err(invalid_params("account_id must be non-empty"));
        }

        let case = state
            .store
            .payment_confirmed(&req.case_id, account_id)
            .await
            .map_err(|err| op_error_response(&err))?;

        // The backfill may have changed the account's resolved profile.
        state.permissions.invalidate(account_id).await;

        crate::metrics::observe_case_transition(case.status.as_str());
        tracing::info!(
            case_id = case.case_id.as_str(),
            owner_id = account_id,
            "case released to the marketplace"
        );

        Ok(Json(HookCaseResponse {
            case_id: case.case_id,
            status: case.status,
        }))
    }
    .await;

    observe(&result, "/v1/hooks/payment-confirmed", started);
    result
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub(super) struct AnalysisReadyRequest {
    case_id: String,
    #[serde(default)]
    summary_text: Option<String>,
    #[serde(default)]
    lawyer_guidance_text: Option<String>,
    #[serde(default)]
    structured_proposal: Option<serde_json::Value>,
}

pub(super) async fn analysis_ready(
    State(state): State<AppState>,
    headers: HeaderMap,
    req: Result<Json<AnalysisReadyRequest>, JsonRejection>,
) -> Result<Json<HookCaseResponse>, ApiError> {
    let started = Instant::now();

    let result = async {
        require_hook_secret(&state, &headers)?;
        let Json(req) = req.map_err(|_| invalid_params("invalid JSON body"))?;

        let case = state
            .store
            .analysis_ready(
                &req.case_id,
                AnalysisUpdate {
                    summary_text: req.summary_text,
                    lawyer_guidance_text: req.lawyer_guidance_text,
                    structured_proposal: req.structured_proposal,
                },
            )
            .await
            .map_err(|err| op_error_response(&err))?;

        if case.status == CaseStatus::ReadyForProposal {
            crate::metrics::observe_case_transition(case.status.as_str());
        }

        Ok(Json(HookCaseResponse {
            case_id: case.case_id,
            status: case.status,
        }))
    }
    .await;

    observe(&result, "/v1/hooks/analysis-ready", started);
    result
}

fn observe(result: &Result<Json<HookCaseResponse>, ApiError>, route: &str, started: Instant) {
    let status = match result {
        Ok(_) => StatusCode::OK,
        Err((status, _)) => *status,
    };
    crate::metrics::observe_http_request(route, "POST", status.as_u16(), started.elapsed());
}
