//! Document access gate decisions.
//!
//! Two disjoint collections with different rules: resolution documents are
//! produced by the assigned lawyer for the client; client documents are the
//! client's own evidence. Writes are refused on closed cases; reads stay
//! open after closure. All checks are pure; the gateway composes them with
//! the storage capability.

use lexlead_contracts::{Assignment, Case, CoreError, DocumentRecord, Role, Viewer};

use crate::require_live_document;

fn holds_active(viewer: &Viewer, active: Option<&Assignment>) -> bool {
    viewer.role == Role::Lawyer
        && active.is_some_and(|a| a.lawyer_id == viewer.account_id)
}

fn owns_case(viewer: &Viewer, case: &Case) -> bool {
    viewer.role == Role::Client
        && case.owner_id.as_deref() == Some(viewer.account_id.as_str())
}

fn require_open(case: &Case) -> Result<(), CoreError> {
    if case.status.is_terminal() {
        Err(CoreError::CaseClosed)
    } else {
        Ok(())
    }
}

/// Resolution upload: the currently assigned lawyer, or an operator.
pub fn resolution_upload_allowed(
    case: &Case,
    viewer: &Viewer,
    active: Option<&Assignment>,
) -> Result<(), CoreError> {
    if !(viewer.is_privileged() || holds_active(viewer, active)) {
        return Err(CoreError::Forbidden);
    }
    require_open(case)
}

/// Resolution delete: only the document's own uploading lawyer, or an
/// operator. Stays a write, so closed cases refuse it.
pub fn resolution_delete_allowed(
    case: &Case,
    viewer: &Viewer,
    document: &DocumentRecord,
) -> Result<(), CoreError> {
    require_live_document(document)?;
    let is_uploader = viewer.role == Role::Lawyer && document.owner_id == viewer.account_id;
    if !(viewer.is_privileged() || is_uploader) {
        return Err(CoreError::Forbidden);
    }
    require_open(case)
}

/// Resolution read: uploading lawyer, current active assignee, owning
/// client, or operator. Allowed after closure.
pub fn resolution_read_allowed(
    case: &Case,
    viewer: &Viewer,
    active: Option<&Assignment>,
    document: &DocumentRecord,
) -> Result<(), CoreError> {
    require_live_document(document)?;
    let is_uploader = viewer.role == Role::Lawyer && document.owner_id == viewer.account_id;
    if viewer.is_privileged()
        || is_uploader
        || holds_active(viewer, active)
        || owns_case(viewer, case)
    {
        Ok(())
    } else {
        Err(CoreError::Forbidden)
    }
}

/// Client-document upload: the owning client, or, while an active
/// assignment exists, the assigned lawyer acting on the client's behalf.
pub fn client_upload_allowed(
    case: &Case,
    viewer: &Viewer,
    active: Option<&Assignment>,
) -> Result<(), CoreError> {
    if !(viewer.is_privileged() || owns_case(viewer, case) || holds_active(viewer, active)) {
        return Err(CoreError::Forbidden);
    }
    require_open(case)
}

/// Client-document delete: owning client or operator only. The assigned
/// lawyer may upload on the client's behalf but may never destroy the
/// client's own uploads.
pub fn client_delete_allowed(
    case: &Case,
    viewer: &Viewer,
    document: &DocumentRecord,
) -> Result<(), CoreError> {
    require_live_document(document)?;
    if !(viewer.is_privileged() || owns_case(viewer, case)) {
        return Err(CoreError::Forbidden);
    }
    require_open(case)
}

/// Client-document read: owning client, current active assignee, or
/// operator. Allowed after closure; the minted capability is always
/// time-limited, never a permanent link.
pub fn client_read_allowed(
    case: &Case,
    viewer: &Viewer,
    active: Option<&Assignment>,
    document: &DocumentRecord,
) -> Result<(), CoreError> {
    require_live_document(document)?;
    if viewer.is_privileged() || owns_case(viewer, case) || holds_active(viewer, active) {
        Ok(())
    } else {
        Err(CoreError::Forbidden)
    }
}
