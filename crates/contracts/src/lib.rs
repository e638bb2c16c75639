use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// Authoritative case lifecycle status. Transitions only move forward
/// through the graph encoded in [`CaseStatus::can_transition`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CaseStatus {
    Draft,
    AwaitingPayment,
    Available,
    Exhausted,
    ReadyForProposal,
    Closed,
}

impl CaseStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            CaseStatus::Draft => "draft",
            CaseStatus::AwaitingPayment => "awaiting_payment",
            CaseStatus::Available => "available",
            CaseStatus::Exhausted => "exhausted",
            CaseStatus::ReadyForProposal => "ready_for_proposal",
            CaseStatus::Closed => "closed",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "draft" => Some(CaseStatus::Draft),
            "awaiting_payment" => Some(CaseStatus::AwaitingPayment),
            "available" => Some(CaseStatus::Available),
            "exhausted" => Some(CaseStatus::Exhausted),
            "ready_for_proposal" => Some(CaseStatus::ReadyForProposal),
            "closed" => Some(CaseStatus::Closed),
            _ => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        self == CaseStatus::Closed
    }

    /// Whether the marketplace may still sell slots on a case in this
    /// status. `exhausted` is excluded; the slot counter is already full.
    pub fn is_purchasable(self) -> bool {
        matches!(self, CaseStatus::Available | CaseStatus::ReadyForProposal)
    }

    /// The legal forward transitions:
    ///
    /// ```text
    /// draft -> awaiting_payment -> available -> exhausted
    /// available|exhausted -> ready_for_proposal
    /// any non-terminal -> closed
    /// ```
    pub fn can_transition(self, to: CaseStatus) -> bool {
        use CaseStatus::*;
        match (self, to) {
            (Draft, AwaitingPayment) => true,
            (AwaitingPayment, Available) => true,
            (Available, Exhausted) => true,
            (Available | Exhausted, ReadyForProposal) => true,
            (from, Closed) => !from.is_terminal(),
            _ => false,
        }
    }
}

/// Pricing/priority tier of a lead in the marketplace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LeadTier {
    Standard,
    Premium,
    Urgent,
}

impl LeadTier {
    pub fn as_str(self) -> &'static str {
        match self {
            LeadTier::Standard => "standard",
            LeadTier::Premium => "premium",
            LeadTier::Urgent => "urgent",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "standard" => Some(LeadTier::Standard),
            "premium" => Some(LeadTier::Premium),
            "urgent" => Some(LeadTier::Urgent),
            _ => None,
        }
    }

    /// Marketplace sort rank; lower sorts first.
    pub fn sort_rank(self) -> i32 {
        match self {
            LeadTier::Urgent => 0,
            LeadTier::Premium => 1,
            LeadTier::Standard => 2,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Client,
    Lawyer,
    Operator,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::Client => "client",
            Role::Lawyer => "lawyer",
            Role::Operator => "operator",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "client" => Some(Role::Client),
            "lawyer" => Some(Role::Lawyer),
            "operator" => Some(Role::Operator),
            _ => None,
        }
    }
}

/// Privileged sub-role carried only by lawyer accounts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LawyerTier {
    Regular,
    SuperAdmin,
}

impl LawyerTier {
    pub fn as_str(self) -> &'static str {
        match self {
            LawyerTier::Regular => "regular",
            LawyerTier::SuperAdmin => "super_admin",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "regular" => Some(LawyerTier::Regular),
            "super_admin" => Some(LawyerTier::SuperAdmin),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssignmentStatus {
    Active,
    Completed,
}

impl AssignmentStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            AssignmentStatus::Active => "active",
            AssignmentStatus::Completed => "completed",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "active" => Some(AssignmentStatus::Active),
            "completed" => Some(AssignmentStatus::Completed),
            _ => None,
        }
    }
}

/// How an assignment came to exist. Only purchase-origin rows consume a
/// slot; operator dispatch never charges the counter, so a completed
/// dispatch must not block the same lawyer from buying in later.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssignmentOrigin {
    Purchase,
    OperatorDispatch,
}

impl AssignmentOrigin {
    pub fn as_str(self) -> &'static str {
        match self {
            AssignmentOrigin::Purchase => "purchase",
            AssignmentOrigin::OperatorDispatch => "operator_dispatch",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "purchase" => Some(AssignmentOrigin::Purchase),
            "operator_dispatch" => Some(AssignmentOrigin::OperatorDispatch),
            _ => None,
        }
    }
}

/// The two independently governed document collections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentKind {
    Resolution,
    Client,
}

impl DocumentKind {
    pub fn as_str(self) -> &'static str {
        match self {
            DocumentKind::Resolution => "resolution",
            DocumentKind::Client => "client",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "resolution" => Some(DocumentKind::Resolution),
            "client" => Some(DocumentKind::Client),
            _ => None,
        }
    }
}

/// Unverified contact/profile data captured before the owner account
/// exists; merged onto the account once payment links the case to it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DraftContact {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phone: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub city: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub company_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub company_role: Option<String>,
}

impl DraftContact {
    pub fn is_empty(&self) -> bool {
        self.name.is_none()
            && self.email.is_none()
            && self.phone.is_none()
            && self.city.is_none()
            && self.company_name.is_none()
            && self.company_role.is_none()
    }
}

/// The central entity. Never physically deleted; closure is a terminal
/// status, not removal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Case {
    pub case_id: String,
    pub status: CaseStatus,
    pub owner_id: Option<String>,
    pub specialty_id: String,
    pub lead_tier: LeadTier,
    pub purchase_cost: i64,
    pub purchases_made: i32,
    pub purchase_limit: i32,
    pub draft_contact: DraftContact,
    pub summary_text: Option<String>,
    pub lawyer_guidance_text: Option<String>,
    pub structured_proposal: Option<serde_json::Value>,
    pub created_at_epoch_ms: i64,
    pub closed_at_epoch_ms: Option<i64>,
}

impl Case {
    pub fn slots_remaining(&self) -> i32 {
        (self.purchase_limit - self.purchases_made).max(0)
    }

    pub fn validate(&self) -> Result<(), &'static str> {
        if self.purchases_made < 0 {
            return Err("purchases_made must be non-negative");
        }
        if self.purchase_limit < 0 {
            return Err("purchase_limit must be non-negative");
        }
        if self.purchases_made > self.purchase_limit {
            return Err("purchases_made exceeds purchase_limit");
        }
        if self.purchase_cost < 0 {
            return Err("purchase_cost must be non-negative");
        }
        if self.status == CaseStatus::Closed && self.closed_at_epoch_ms.is_none() {
            return Err("closed case must carry closed_at");
        }
        Ok(())
    }
}

/// Join entity linking one lawyer to one case. At most one assignment per
/// case is `active` at any instant; historical rows accumulate over
/// reassignment and are never deleted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Assignment {
    pub assignment_id: String,
    pub case_id: String,
    pub lawyer_id: String,
    pub status: AssignmentStatus,
    pub origin: AssignmentOrigin,
    pub assigned_at_epoch_ms: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

impl Assignment {
    pub fn is_active(&self) -> bool {
        self.status == AssignmentStatus::Active
    }
}

/// Per-request viewer context, resolved through the permission cache.
/// Not persisted by this core.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Viewer {
    pub account_id: String,
    pub role: Role,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lawyer_tier: Option<LawyerTier>,
}

impl Viewer {
    pub fn client(account_id: impl Into<String>) -> Self {
        Viewer {
            account_id: account_id.into(),
            role: Role::Client,
            lawyer_tier: None,
        }
    }

    pub fn lawyer(account_id: impl Into<String>) -> Self {
        Viewer {
            account_id: account_id.into(),
            role: Role::Lawyer,
            lawyer_tier: Some(LawyerTier::Regular),
        }
    }

    pub fn operator(account_id: impl Into<String>) -> Self {
        Viewer {
            account_id: account_id.into(),
            role: Role::Operator,
            lawyer_tier: None,
        }
    }

    pub fn super_admin(account_id: impl Into<String>) -> Self {
        Viewer {
            account_id: account_id.into(),
            role: Role::Lawyer,
            lawyer_tier: Some(LawyerTier::SuperAdmin),
        }
    }

    /// Operators and super-admin lawyers clear every privileged gate.
    pub fn is_privileged(&self) -> bool {
        self.role == Role::Operator || self.lawyer_tier == Some(LawyerTier::SuperAdmin)
    }
}

/// Stored document metadata. `deleted_at_epoch_ms` marks a soft delete;
/// deleted records resolve to `NotFound` at the gate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentRecord {
    pub document_id: String,
    pub case_id: String,
    pub owner_id: String,
    pub file_name: String,
    pub storage_path: String,
    pub uploaded_at_epoch_ms: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deleted_at_epoch_ms: Option<i64>,
}

impl DocumentRecord {
    pub fn is_deleted(&self) -> bool {
        self.deleted_at_epoch_ms.is_some()
    }
}

/// Terminal, user-facing rejection taxonomy. Every rejected operation
/// surfaces exactly one of these; none are retried internally.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CoreError {
    InvalidTransition { from: CaseStatus, to: CaseStatus },
    CaseNotAvailable { status: CaseStatus },
    SlotExhausted,
    AlreadyPurchased,
    Forbidden,
    NotFound,
    CaseClosed,
}

impl CoreError {
    pub fn code(&self) -> &'static str {
        match self {
            CoreError::InvalidTransition { .. } => "ERR_INVALID_TRANSITION",
            CoreError::CaseNotAvailable { .. } => "ERR_CASE_NOT_AVAILABLE",
            CoreError::SlotExhausted => "ERR_SLOT_EXHAUSTED",
            CoreError::AlreadyPurchased => "ERR_ALREADY_PURCHASED",
            CoreError::Forbidden => "ERR_FORBIDDEN",
            CoreError::NotFound => "ERR_NOT_FOUND",
            CoreError::CaseClosed => "ERR_CASE_CLOSED",
        }
    }
}

impl std::fmt::Display for CoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CoreError::InvalidTransition { from, to } => {
                write!(f, "illegal transition {} -> {}", from.as_str(), to.as_str())
            }
            CoreError::CaseNotAvailable { status } => write!(
                f,
                "case is not in the marketplace (status {})",
                status.as_str()
            ),
            CoreError::SlotExhausted => write!(f, "purchase slots are exhausted"),
            CoreError::AlreadyPurchased => write!(f, "lawyer already purchased this case"),
            CoreError::Forbidden => write!(f, "viewer has no qualifying relation to this case"),
            CoreError::NotFound => write!(f, "case, document or assignment not found"),
            CoreError::CaseClosed => write!(f, "case is closed; writes are not allowed"),
        }
    }
}

impl std::error::Error for CoreError {}

pub fn unix_epoch_ms_now() -> i64 {
    let duration = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO);
    duration.as_millis().min(i64::MAX as u128) as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_case() -> Case {
        Case {
            case_id: "case_1".to_string(),
            status: CaseStatus::Available,
            owner_id: Some("client_1".to_string()),
            specialty_id: "labor_law".to_string(),
            lead_tier: LeadTier::Standard,
            purchase_cost: 4900,
            purchases_made: 0,
            purchase_limit: 3,
            draft_contact: DraftContact::default(),
            summary_text: None,
            lawyer_guidance_text: None,
            structured_proposal: None,
            created_at_epoch_ms: 0,
            closed_at_epoch_ms: None,
        }
    }

    #[test]
    fn transition_graph_is_forward_only() {
        use CaseStatus::*;

        assert!(Draft.can_transition(AwaitingPayment));
        assert!(AwaitingPayment.can_transition(Available));
        assert!(Available.can_transition(Exhausted));
        assert!(Available.can_transition(ReadyForProposal));
        assert!(Exhausted.can_transition(ReadyForProposal));

        for from in [Draft, AwaitingPayment, Available, Exhausted, ReadyForProposal] {
            assert!(from.can_transition(Closed), "{} must close", from.as_str());
        }

        // No backward edges, no reopening.
        assert!(!AwaitingPayment.can_transition(Draft));
        assert!(!Available.can_transition(AwaitingPayment));
        assert!(!Exhausted.can_transition(Available));
        assert!(!Closed.can_transition(Available));
        assert!(!Closed.can_transition(Closed));
        assert!(!Draft.can_transition(Available));
        assert!(!Draft.can_transition(Exhausted));
    }

    #[test]
    fn status_round_trips_through_strings() {
        use CaseStatus::*;
        for status in [
            Draft,
            AwaitingPayment,
            Available,
            Exhausted,
            ReadyForProposal,
            Closed,
        ] {
            assert_eq!(CaseStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(CaseStatus::parse("reopened"), None);
    }

    #[test]
    fn assignment_origin_round_trips_through_strings() {
        for origin in [AssignmentOrigin::Purchase, AssignmentOrigin::OperatorDispatch] {
            assert_eq!(AssignmentOrigin::parse(origin.as_str()), Some(origin));
        }
        assert_eq!(AssignmentOrigin::parse("manual"), None);
    }

    #[test]
    fn validate_rejects_counter_violations() {
        let mut case = base_case();
        case.purchases_made = 4;
        assert_eq!(
            case.validate().unwrap_err(),
            "purchases_made exceeds purchase_limit"
        );

        let mut case = base_case();
        case.purchases_made = -1;
        assert!(case.validate().is_err());

        let mut case = base_case();
        case.status = CaseStatus::Closed;
        assert_eq!(
            case.validate().unwrap_err(),
            "closed case must carry closed_at"
        );
        case.closed_at_epoch_ms = Some(10);
        case.validate().expect("closed case with timestamp is valid");
    }

    #[test]
    fn lead_tier_rank_orders_urgent_first() {
        assert!(LeadTier::Urgent.sort_rank() < LeadTier::Premium.sort_rank());
        assert!(LeadTier::Premium.sort_rank() < LeadTier::Standard.sort_rank());
    }

    #[test]
    fn privileged_viewers_are_operators_and_super_admins() {
        assert!(Viewer::operator("op").is_privileged());
        assert!(Viewer::super_admin("sa").is_privileged());
        assert!(!Viewer::lawyer("lw").is_privileged());
        assert!(!Viewer::client("cl").is_privileged());
    }

    #[test]
    fn core_error_codes_are_stable() {
        assert_eq!(
            CoreError::InvalidTransition {
                from: CaseStatus::Closed,
                to: CaseStatus::Available
            }
            .code(),
            "ERR_INVALID_TRANSITION"
        );
        assert_eq!(CoreError::SlotExhausted.code(), "ERR_SLOT_EXHAUSTED");
        assert_eq!(CoreError::CaseClosed.code(), "ERR_CASE_CLOSED");
    }
}
