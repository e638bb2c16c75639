//! Role-based visibility filter and document access gate. Everything in
//! this crate is a pure function of `(case, viewer, assignment state)`;
//! ownership of client-viewed cases is assumed to have been checked by the
//! data-access layer, and the filter still refuses to project a case to a
//! client who does not own it.

use lexlead_contracts::{
    Assignment, Case, CaseStatus, CoreError, DocumentRecord, DraftContact, LeadTier, Role,
    Viewer,
};
use serde::Serialize;

mod docgate;

pub use docgate::{
    client_delete_allowed, client_read_allowed, client_upload_allowed,
    resolution_delete_allowed, resolution_read_allowed, resolution_upload_allowed,
};

/// How the viewer relates to a case. Drives every projection decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViewerRelation {
    /// Operator, or super-admin lawyer.
    Privileged,
    /// Client account owning the case.
    OwnerClient,
    /// Lawyer holding any assignment (active or historical) on the case.
    PurchasedLawyer,
    /// Regular lawyer browsing the marketplace.
    MarketLawyer,
    /// Client with no ownership; the case must not be shown at all.
    None,
}

pub fn viewer_relation(case: &Case, viewer: &Viewer, assignments: &[Assignment]) -> ViewerRelation {
    if viewer.is_privileged() {
        return ViewerRelation::Privileged;
    }
    match viewer.role {
        Role::Client => {
            if case.owner_id.as_deref() == Some(viewer.account_id.as_str()) {
                ViewerRelation::OwnerClient
            } else {
                ViewerRelation::None
            }
        }
        Role::Lawyer => {
            if assignments.iter().any(|a| a.lawyer_id == viewer.account_id) {
                ViewerRelation::PurchasedLawyer
            } else {
                ViewerRelation::MarketLawyer
            }
        }
        // Non-super-admin operators are privileged already; this arm is
        // unreachable but keeps the match total.
        Role::Operator => ViewerRelation::Privileged,
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AssignmentView {
    pub assignment_id: String,
    pub lawyer_id: String,
    pub status: lexlead_contracts::AssignmentStatus,
    pub assigned_at_epoch_ms: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

/// Redacted projection of a case. Absent fields are omitted from the JSON
/// body entirely rather than serialized as null.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CaseView {
    pub case_id: String,
    pub status: CaseStatus,
    pub specialty_id: String,
    pub lead_tier: LeadTier,
    pub created_at_epoch_ms: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub closed_at_epoch_ms: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub owner_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub purchase_cost: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub purchases_made: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub purchase_limit: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub slots_remaining: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub contact: Option<DraftContact>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary_text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lawyer_guidance_text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub structured_proposal: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub assignments: Vec<AssignmentView>,
}

/// Pure projection `(case, viewer, assignments) -> CaseView`.
///
/// Returns `None` when the viewer must not see the case at all (a client
/// who does not own it).
pub fn project(case: &Case, viewer: &Viewer, assignments: &[Assignment]) -> Option<CaseView> {
    let relation = viewer_relation(case, viewer, assignments);

    let mut view = CaseView {
        case_id: case.case_id.clone(),
        status: case.status,
        specialty_id: case.specialty_id.clone(),
        lead_tier: case.lead_tier,
        created_at_epoch_ms: case.created_at_epoch_ms,
        closed_at_epoch_ms: case.closed_at_epoch_ms,
        owner_id: None,
        purchase_cost: None,
        purchases_made: None,
        purchase_limit: None,
        slots_remaining: None,
        contact: None,
        summary_text: None,
        lawyer_guidance_text: None,
        structured_proposal: None,
        assignments: Vec::new(),
    };

    match relation {
        ViewerRelation::None => None,
        ViewerRelation::OwnerClient => {
            // Full record minus internal cost fields, lawyer guidance and
            // lawyer identities.
            view.owner_id = case.owner_id.clone();
            view.contact = Some(case.draft_contact.clone());
            view.summary_text = case.summary_text.clone();
            view.structured_proposal = case.structured_proposal.clone();
            Some(view)
        }
        ViewerRelation::MarketLawyer => {
            // A case off the market has no preview for lawyers who never
            // purchased it.
            if !case.status.is_purchasable() {
                return None;
            }
            // Only what supports a purchase decision; never the client's
            // contact details or identity.
            view.purchase_cost = Some(case.purchase_cost);
            view.purchases_made = Some(case.purchases_made);
            view.purchase_limit = Some(case.purchase_limit);
            view.slots_remaining = Some(case.slots_remaining());
            view.summary_text = case.summary_text.clone();
            Some(view)
        }
        ViewerRelation::PurchasedLawyer => {
            view.owner_id = case.owner_id.clone();
            view.purchase_cost = Some(case.purchase_cost);
            view.purchases_made = Some(case.purchases_made);
            view.purchase_limit = Some(case.purchase_limit);
            view.slots_remaining = Some(case.slots_remaining());
            view.contact = Some(case.draft_contact.clone());
            view.summary_text = case.summary_text.clone();
            view.lawyer_guidance_text = case.lawyer_guidance_text.clone();
            view.structured_proposal = case.structured_proposal.clone();
            // Own assignments only; another lawyer's notes never appear.
            view.assignments = assignments
                .iter()
                .filter(|a| a.lawyer_id == viewer.account_id)
                .map(assignment_view)
                .collect();
            Some(view)
        }
        ViewerRelation::Privileged => {
            view.owner_id = case.owner_id.clone();
            view.purchase_cost = Some(case.purchase_cost);
            view.purchases_made = Some(case.purchases_made);
            view.purchase_limit = Some(case.purchase_limit);
            view.slots_remaining = Some(case.slots_remaining());
            view.contact = Some(case.draft_contact.clone());
            view.summary_text = case.summary_text.clone();
            view.lawyer_guidance_text = case.lawyer_guidance_text.clone();
            view.structured_proposal = case.structured_proposal.clone();
            view.assignments = assignments.iter().map(assignment_view).collect();
            Some(view)
        }
    }
}

fn assignment_view(assignment: &Assignment) -> AssignmentView {
    AssignmentView {
        assignment_id: assignment.assignment_id.clone(),
        lawyer_id: assignment.lawyer_id.clone(),
        status: assignment.status,
        assigned_at_epoch_ms: assignment.assigned_at_epoch_ms,
        notes: assignment.notes.clone(),
    }
}

/// Shared helper for the gate: the case must exist and the document must
/// not be soft-deleted.
pub fn require_live_document(document: &DocumentRecord) -> Result<(), CoreError> {
    if document.is_deleted() {
        Err(CoreError::NotFound)
    } else {
        Ok(())
    }
}
