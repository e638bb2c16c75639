use std::time::{Duration, Instant};

use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::Json;
use base64::Engine;
use lexlead_contracts::{
    Assignment, Case, CoreError, DocumentKind, DocumentRecord, Viewer,
};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

use super::{
    ApiError, AppState, core_error_response, invalid_params, json_error, op_error_response,
    resolve_viewer, storage_error_response, store_error_response,
};

fn parse_kind(raw: &str) -> Result<DocumentKind, ApiError> {
    DocumentKind::parse(raw)
        .ok_or_else(|| invalid_params("document kind must be `resolution` or `client`"))
}

async fn load_case_context(
    state: &AppState,
    case_id: &str,
) -> Result<(Case, Vec<Assignment>), ApiError> {
    let case = state
        .store
        .get_case(case_id)
        .await
        .map_err(|err| store_error_response(&err))?
        .ok_or_else(|| core_error_response(&CoreError::NotFound))?;

    let assignments = state
        .store
        .assignments_for_case(case_id)
        .await
        .map_err(|err| store_error_response(&err))?;

    Ok((case, assignments))
}

fn active_assignment(assignments: &[Assignment]) -> Option<&Assignment> {
    assignments.iter().find(|a| a.is_active())
}

fn upload_allowed(
    kind: DocumentKind,
    case: &Case,
    viewer: &Viewer,
    active: Option<&Assignment>,
) -> Result<(), CoreError> {
    match kind {
        DocumentKind::Resolution => {
            lexlead_policy::resolution_upload_allowed(case, viewer, active)
        }
        DocumentKind::Client => lexlead_policy::client_upload_allowed(case, viewer, active),
    }
}

fn read_allowed(
    kind: DocumentKind,
    case: &Case,
    viewer: &Viewer,
    active: Option<&Assignment>,
    document: &DocumentRecord,
) -> Result<(), CoreError> {
    match kind {
        DocumentKind::Resolution => {
            lexlead_policy::resolution_read_allowed(case, viewer, active, document)
        }
        DocumentKind::Client => {
            lexlead_policy::client_read_allowed(case, viewer, active, document)
        }
    }
}

fn delete_allowed(
    kind: DocumentKind,
    case: &Case,
    viewer: &Viewer,
    document: &DocumentRecord,
) -> Result<(), CoreError> {
    match kind {
        DocumentKind::Resolution => {
            lexlead_policy::resolution_delete_allowed(case, viewer, document)
        }
        DocumentKind::Client => lexlead_policy::client_delete_allowed(case, viewer, document),
    }
}

/// Response shape never exposes `storage_path`; reads go through signed
/// URLs only.
#[derive(Debug, Serialize)]
pub(super) struct DocumentView {
    document_id: String,
    case_id: String,
    owner_id: String,
    file_name: String,
    uploaded_at_epoch_ms: i64,
}

fn document_view(record: &DocumentRecord) -> DocumentView {
    DocumentView {
        document_id: record.document_id.clone(),
        case_id: record.case_id.clone(),
        owner_id: record.owner_id.clone(),
        file_name: record.file_name.clone(),
        uploaded_at_epoch_ms: record.uploaded_at_epoch_ms,
    }
}

#[derive(Debug, Serialize)]
pub(super) struct DocumentListResponse {
    resolution: Vec<DocumentView>,
    client: Vec<DocumentView>,
}

pub(super) async fn list_documents(
    State(state): State<AppState>,
    Path(case_id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<DocumentListResponse>, ApiError> {
    let viewer = resolve_viewer(&state, &headers).await?;
    let (case, assignments) = load_case_context(&state, &case_id).await?;
    let active = active_assignment(&assignments);

    let mut response = DocumentListResponse {
        resolution: Vec::new(),
        client: Vec::new(),
    };

    for kind in [DocumentKind::Resolution, DocumentKind::Client] {
        let records = state
            .store
            .list_documents(&case_id, kind)
            .await
            .map_err(|err| store_error_response(&err))?;

        let visible = records
            .iter()
            .filter(|record| read_allowed(kind, &case, &viewer, active, record).is_ok())
            .map(document_view)
            .collect();

        match kind {
            DocumentKind::Resolution => response.resolution = visible,
            DocumentKind::Client => response.client = visible,
        }
    }

    Ok(Json(response))
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub(super) struct UploadRequest {
    file_name: String,
    content_base64: String,
}

#[derive(Debug, Serialize)]
pub(super) struct UploadResponse {
    document: DocumentView,
}

/// Upload order: store the object first, then the metadata INSERT; a
/// failed INSERT rolls the object back so no file survives without a
/// record.
pub(super) async fn upload_document(
    State(state): State<AppState>,
    Path((case_id, kind)): Path<(String, String)>,
    headers: HeaderMap,
    req: Result<Json<UploadRequest>, JsonRejection>,
) -> Result<Json<UploadResponse>, ApiError> {
    let started = Instant::now();
    let kind = parse_kind(&kind)?;

    let result = async {
        let viewer = resolve_viewer(&state, &headers).await?;
        let Json(req) = req.map_err(|_| invalid_params("invalid JSON body"))?;

        let file_name = sanitize_file_name(&req.file_name)
            .ok_or_else(|| invalid_params("file_name must be a plain file name"))?;

        let bytes = base64::engine::general_purpose::STANDARD
            .decode(req.content_base64.as_bytes())
            .map_err(|_| invalid_params("content_base64 is not valid base64"))?;

        if bytes.is_empty() {
            return Err(invalid_params("document content must be non-empty"));
        }
        if bytes.len() > state.config.max_upload_bytes {
            return Err(json_error(
                StatusCode::PAYLOAD_TOO_LARGE,
                "ERR_INVALID_PARAMS",
                format!(
                    "document exceeds the {} byte upload limit",
                    state.config.max_upload_bytes
                ),
                false,
            ));
        }

        let (case, assignments) = load_case_context(&state, &case_id).await?;
        let active = active_assignment(&assignments);

        upload_allowed(kind, &case, &viewer, active)
            .map_err(|err| core_error_response(&err))?;

        let storage_path = format!(
            "{}/{}/{}-{}",
            kind.as_str(),
            case_id,
            Ulid::new(),
            file_name
        );

        state
            .storage
            .put_object(&storage_path, bytes)
            .await
            .map_err(|err| storage_error_response(&err))?;

        let inserted = state
            .store
            .insert_document(kind, &case_id, &viewer.account_id, &file_name, &storage_path)
            .await;

        let record = match inserted {
            Ok(record) => record,
            Err(err) => {
                // The object must not outlive a failed metadata write.
                if let Err(cleanup) = state.storage.delete_object(&storage_path).await {
                    tracing::warn!(
                        storage_path = storage_path.as_str(),
                        error = %cleanup,
                        "orphaned object after failed metadata insert"
                    );
                }
                return Err(op_error_response(&err));
            }
        };

        tracing::info!(
            case_id = case_id.as_str(),
            document_id = record.document_id.as_str(),
            collection = kind.as_str(),
            uploader = viewer.account_id.as_str(),
            "document uploaded"
        );

        Ok(Json(UploadResponse {
            document: document_view(&record),
        }))
    }
    .await;

    let status = match &result {
        Ok(_) => StatusCode::OK,
        Err((status, _)) => *status,
    };
    crate::metrics::observe_document_op(
        kind.as_str(),
        "upload",
        if status.is_success() { "ok" } else { "error" },
    );
    crate::metrics::observe_http_request(
        "/v1/cases/{case_id}/documents/{kind}",
        "POST",
        status.as_u16(),
        started.elapsed(),
    );
    result
}

#[derive(Debug, Serialize)]
pub(super) struct DocumentUrlResponse {
    url: String,
    expires_in_secs: u64,
}

/// Mints a time-limited signed read URL; the stored object is never
/// exposed as a permanent link.
pub(super) async fn document_url(
    State(state): State<AppState>,
    Path((kind, document_id)): Path<(String, String)>,
    headers: HeaderMap,
) -> Result<Json<DocumentUrlResponse>, ApiError> {
    let kind = parse_kind(&kind)?;
    let viewer = resolve_viewer(&state, &headers).await?;

    let record = state
        .store
        .get_document(kind, &document_id)
        .await
        .map_err(|err| store_error_response(&err))?
        .ok_or_else(|| core_error_response(&CoreError::NotFound))?;

    let (case, assignments) = load_case_context(&state, &record.case_id).await?;
    let active = active_assignment(&assignments);

    read_allowed(kind, &case, &viewer, active, &record)
        .map_err(|err| core_error_response(&err))?;

    let ttl = Duration::from_secs(state.config.signed_url_ttl_secs);
    let url = state
        .storage
        .signed_get_url(&record.storage_path, ttl)
        .await
        .map_err(|err| storage_error_response(&err))?;

    crate::metrics::observe_document_op(kind.as_str(), "read", "ok");

    Ok(Json(DocumentUrlResponse {
        url,
        expires_in_secs: ttl.as_secs(),
    }))
}

/// Delete order: metadata first, stored object second. A record that
/// survives a lost object is recoverable; the reverse is an orphan.
pub(super) async fn delete_document(
    State(state): State<AppState>,
    Path((kind, document_id)): Path<(String, String)>,
    headers: HeaderMap,
) -> Result<StatusCode, ApiError> {
    let started = Instant::now();
    let kind = parse_kind(&kind)?;

    let result = async {
        let viewer = resolve_viewer(&state, &headers).await?;

        let record = state
            .store
            .get_document(kind, &document_id)
            .await
            .map_err(|err| store_error_response(&err))?
            .ok_or_else(|| core_error_response(&CoreError::NotFound))?;

        let (case, _assignments) = load_case_context(&state, &record.case_id).await?;

        delete_allowed(kind, &case, &viewer, &record)
            .map_err(|err| core_error_response(&err))?;

        let storage_path = state
            .store
            .soft_delete_document(kind, &document_id)
            .await
            .map_err(|err| op_error_response(&err))?;

        if let Err(err) = state.storage.delete_object(&storage_path).await {
            tracing::warn!(
                storage_path = storage_path.as_str(),
                error = %err,
                "stored object left behind after metadata delete"
            );
        }

        tracing::info!(
            document_id = document_id.as_str(),
            collection = kind.as_str(),
            actor = viewer.account_id.as_str(),
            "document deleted"
        );

        Ok(StatusCode::NO_CONTENT)
    }
    .await;

    let status = match &result {
        Ok(status) => *status,
        Err((status, _)) => *status,
    };
    crate::metrics::observe_document_op(
        kind.as_str(),
        "delete",
        if status.is_success() { "ok" } else { "error" },
    );
    crate::metrics::observe_http_request(
        "/v1/documents/{kind}/{document_id}",
        "DELETE",
        status.as_u16(),
        started.elapsed(),
    );
    result
}

fn sanitize_file_name(raw: &str) -> Option<String> {
    const MAX_LEN: usize = 128;
    let raw = raw.trim();
    if raw.is_empty() || raw.len() > MAX_LEN {
        return None;
    }
    if raw.contains('/') || raw.contains('\\') || raw.contains("..") {
        return None;
    }
    raw.chars()
        .all(|ch| ch.is_ascii_alphanumeric() || matches!(ch, '-' | '_' | '.' | ' '))
        .then(|| raw.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_name_rejects_traversal_and_separators() {
        assert!(sanitize_file_name("contract.pdf").is_some());
        assert!(sanitize_file_name("my scan 2.png").is_some());
        assert!(sanitize_file_name("../etc/passwd").is_none());
        assert!(sanitize_file_name("a/b.pdf").is_none());
        assert!(sanitize_file_name("a\\b.pdf").is_none());
        assert!(sanitize_file_name("").is_none());
        assert!(sanitize_file_name(&"x".repeat(200)).is_none());
    }

    #[test]
    fn kind_parses_only_known_collections() {
        assert!(parse_kind("resolution").is_ok());
        assert!(parse_kind("client").is_ok());
        assert!(parse_kind("internal").is_err());
    }
}
