//! Pure decision layer for the case state machine and the purchase and
//! assignment protocol. Nothing here performs I/O; callers load the case
//! and its assignments, evaluate a decision, and apply the returned effect
//! inside their own transaction.

use lexlead_contracts::{
    Assignment, AssignmentOrigin, AssignmentStatus, Case, CaseStatus, CoreError, Viewer,
};
use ulid::Ulid;

/// Effect of a granted purchase, applied atomically with the assignment
/// insert. When the increment reaches the limit on an `available` case the
/// status flips to `exhausted` in the same effect; there is never a window
/// where the counter is full but the status still reads `available`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PurchaseEffect {
    pub new_purchases_made: i32,
    pub new_status: CaseStatus,
    /// Active assignment of another lawyer superseded by this purchase;
    /// it moves to `completed` so the one-active-per-case invariant holds.
    pub supersedes_assignment_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PurchaseDecision {
    Granted(PurchaseEffect),
    /// The same lawyer already holds the active assignment; a retried call
    /// is success-equivalent and must not increment the counter.
    AlreadyAssigned { assignment_id: String },
}

/// Slot-claim contract from §purchase: preconditions checked in order of
/// idempotency first, then marketplace status, then slot headroom.
pub fn evaluate_purchase(
    case: &Case,
    assignments: &[Assignment],
    lawyer_id: &str,
) -> Result<PurchaseDecision, CoreError> {
    let active = assignments.iter().find(|a| a.is_active());

    if let Some(own) = active.filter(|a| a.lawyer_id == lawyer_id) {
        return Ok(PurchaseDecision::AlreadyAssigned {
            assignment_id: own.assignment_id.clone(),
        });
    }

    // A completed purchase-origin assignment by the same lawyer means the
    // slot was already charged once; a fresh purchase would double-charge
    // it. Completed operator dispatches never charged a slot and do not
    // count.
    if assignments.iter().any(|a| {
        a.lawyer_id == lawyer_id
            && a.status == AssignmentStatus::Completed
            && a.origin == AssignmentOrigin::Purchase
    }) {
        return Err(CoreError::AlreadyPurchased);
    }

    match case.status {
        CaseStatus::Exhausted => return Err(CoreError::SlotExhausted),
        status if !status.is_purchasable() => {
            return Err(CoreError::CaseNotAvailable { status });
        }
        _ => {}
    }

    if case.purchases_made >= case.purchase_limit {
        return Err(CoreError::SlotExhausted);
    }

    let new_purchases_made = case.purchases_made + 1;
    let new_status = if case.status == CaseStatus::Available
        && new_purchases_made == case.purchase_limit
    {
        CaseStatus::Exhausted
    } else {
        case.status
    };

    Ok(PurchaseDecision::Granted(PurchaseEffect {
        new_purchases_made,
        new_status,
        supersedes_assignment_id: active.map(|a| a.assignment_id.clone()),
    }))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssignEffect {
    pub supersedes_assignment_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AssignDecision {
    Granted(AssignEffect),
    AlreadyAssigned { assignment_id: String },
}

/// Privileged manual dispatch: allowed regardless of slot count, never
/// touches `purchases_made`, keeps the one-active invariant by completing
/// any superseded assignment.
pub fn evaluate_operator_assign(
    case: &Case,
    assignments: &[Assignment],
    actor: &Viewer,
    lawyer_id: &str,
) -> Result<AssignDecision, CoreError> {
    if !actor.is_privileged() {
        return Err(CoreError::Forbidden);
    }
    if case.status.is_terminal() {
        return Err(CoreError::CaseClosed);
    }
    if matches!(case.status, CaseStatus::Draft | CaseStatus::AwaitingPayment) {
        return Err(CoreError::CaseNotAvailable {
            status: case.status,
        });
    }

    let active = assignments.iter().find(|a| a.is_active());

    if let Some(own) = active.filter(|a| a.lawyer_id == lawyer_id) {
        return Ok(AssignDecision::AlreadyAssigned {
            assignment_id: own.assignment_id.clone(),
        });
    }

    Ok(AssignDecision::Granted(AssignEffect {
        supersedes_assignment_id: active.map(|a| a.assignment_id.clone()),
    }))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseEffect {
    /// Active assignment flipped to `completed` alongside the close.
    pub complete_assignment_id: Option<String>,
}

/// The only role-gated transition in the machine itself: an operator, or
/// the lawyer holding the case's active assignment, may close it.
pub fn evaluate_close(
    case: &Case,
    assignments: &[Assignment],
    actor: &Viewer,
) -> Result<CloseEffect, CoreError> {
    let active = assignments.iter().find(|a| a.is_active());

    // Authorization outranks the transition check: an actor with no
    // qualifying relation sees Forbidden even on an already-closed case.
    let permitted =
        actor.is_privileged() || active.is_some_and(|a| a.lawyer_id == actor.account_id);
    if !permitted {
        return Err(CoreError::Forbidden);
    }

    if case.status.is_terminal() {
        return Err(CoreError::InvalidTransition {
            from: case.status,
            to: CaseStatus::Closed,
        });
    }

    Ok(CloseEffect {
        complete_assignment_id: active.map(|a| a.assignment_id.clone()),
    })
}

/// Payment gateway reported success on the draft checkout.
pub fn payment_succeeded(case: &Case) -> Result<CaseStatus, CoreError> {
    require_transition(case.status, CaseStatus::AwaitingPayment)
}

/// Payment confirmed and the case linked to an authenticated account; the
/// store copies the draft contact bundle onto the account in the same
/// transaction.
pub fn payment_confirmed(case: &Case) -> Result<CaseStatus, CoreError> {
    require_transition(case.status, CaseStatus::Available)
}

/// Upstream analysis delivered summary/guidance/proposal text. The status
/// advances to `ready_for_proposal` only from `available` or `exhausted`;
/// re-delivery onto a `ready_for_proposal` case updates text only.
pub fn analysis_ready(case: &Case) -> Result<Option<CaseStatus>, CoreError> {
    if case.status.is_terminal() {
        return Err(CoreError::CaseClosed);
    }
    if case.status.can_transition(CaseStatus::ReadyForProposal) {
        Ok(Some(CaseStatus::ReadyForProposal))
    } else {
        Ok(None)
    }
}

fn require_transition(from: CaseStatus, to: CaseStatus) -> Result<CaseStatus, CoreError> {
    if from.can_transition(to) {
        Ok(to)
    } else {
        Err(CoreError::InvalidTransition { from, to })
    }
}

pub fn new_assignment(
    case_id: &str,
    lawyer_id: &str,
    origin: AssignmentOrigin,
    notes: Option<String>,
    now_epoch_ms: i64,
) -> Assignment {
    Assignment {
        assignment_id: Ulid::new().to_string(),
        case_id: case_id.to_string(),
        lawyer_id: lawyer_id.to_string(),
        status: AssignmentStatus::Active,
        origin,
        assigned_at_epoch_ms: now_epoch_ms,
        notes,
    }
}

/// In-memory application of a purchase against a case and its assignment
/// list. The store mirrors this with a conditional UPDATE; tests use it to
/// drive the invariants without a database.
pub fn apply_purchase(
    case: &mut Case,
    assignments: &mut Vec<Assignment>,
    lawyer_id: &str,
    now_epoch_ms: i64,
) -> Result<PurchaseDecision, CoreError> {
    let decision = evaluate_purchase(case, assignments, lawyer_id)?;

    if let PurchaseDecision::Granted(effect) = &decision {
        case.purchases_made = effect.new_purchases_made;
        case.status = effect.new_status;
        if let Some(superseded) = &effect.supersedes_assignment_id {
            for assignment in assignments.iter_mut() {
                if assignment.assignment_id == *superseded {
                    assignment.status = AssignmentStatus::Completed;
                }
            }
        }
        assignments.push(new_assignment(
            &case.case_id,
            lawyer_id,
            AssignmentOrigin::Purchase,
            None,
            now_epoch_ms,
        ));
    }

    Ok(decision)
}

#[cfg(test)]
mod tests {
    use super::*;
    use lexlead_contracts::{DraftContact, LeadTier};

    fn market_case(purchases_made: i32, purchase_limit: i32, status: CaseStatus) -> Case {
        Case {
            case_id: "case_1".to_string(),
            status,
            owner_id: Some("client_1".to_string()),
            specialty_id: "tenancy_law".to_string(),
            lead_tier: LeadTier::Premium,
            purchase_cost: 5900,
            purchases_made,
            purchase_limit,
            draft_contact: DraftContact::default(),
            summary_text: Some("tenant dispute over deposit".to_string()),
            lawyer_guidance_text: None,
            structured_proposal: None,
            created_at_epoch_ms: 0,
            closed_at_epoch_ms: None,
        }
    }

    fn active_assignment(lawyer_id: &str) -> Assignment {
        Assignment {
            assignment_id: format!("as_{lawyer_id}"),
            case_id: "case_1".to_string(),
            lawyer_id: lawyer_id.to_string(),
            status: AssignmentStatus::Active,
            origin: AssignmentOrigin::Purchase,
            assigned_at_epoch_ms: 0,
            notes: None,
        }
    }

    #[test]
    fn purchase_burst_stops_exactly_at_the_limit() {
        // Scenario: purchase_limit = 2; two lawyers buy, the third fails
        // with SlotExhausted and the status reads exhausted.
        let mut case = market_case(0, 2, CaseStatus::Available);
        let mut assignments = Vec::new();

        for lawyer in ["lw_1", "lw_2"] {
            let decision = apply_purchase(&mut case, &mut assignments, lawyer, 10)
                .expect("purchase within the limit succeeds");
            assert!(matches!(decision, PurchaseDecision::Granted(_)));
        }

        assert_eq!(case.purchases_made, 2);
        assert_eq!(case.status, CaseStatus::Exhausted);
        case.validate().expect("invariant holds after the burst");

        let err = apply_purchase(&mut case, &mut assignments, "lw_3", 11).unwrap_err();
        assert_eq!(err, CoreError::SlotExhausted);
        assert_eq!(case.purchases_made, 2);
    }

    #[test]
    fn purchase_retry_by_assigned_lawyer_is_idempotent() {
        let mut case = market_case(0, 3, CaseStatus::Available);
        let mut assignments = Vec::new();

        apply_purchase(&mut case, &mut assignments, "lw_1", 10).expect("first call");
        let retry = apply_purchase(&mut case, &mut assignments, "lw_1", 11)
            .expect("retry is success-equivalent");

        assert!(matches!(retry, PurchaseDecision::AlreadyAssigned { .. }));
        assert_eq!(case.purchases_made, 1, "retry must not double-charge a slot");
    }

    #[test]
    fn purchase_after_supersession_is_already_purchased() {
        let mut case = market_case(0, 3, CaseStatus::Available);
        let mut assignments = Vec::new();

        apply_purchase(&mut case, &mut assignments, "lw_1", 10).expect("first purchase");
        apply_purchase(&mut case, &mut assignments, "lw_2", 11).expect("second purchase");

        // lw_1's assignment was completed by lw_2's purchase; buying again
        // would charge a second slot to the same lawyer.
        let err = evaluate_purchase(&case, &assignments, "lw_1").unwrap_err();
        assert_eq!(err, CoreError::AlreadyPurchased);
    }

    #[test]
    fn superseded_operator_dispatch_does_not_block_a_purchase() {
        // lw_1 was operator-dispatched onto the case and later superseded;
        // no slot was ever charged to them, so buying in must succeed.
        let case = market_case(0, 3, CaseStatus::Available);
        let dispatched = Assignment {
            status: AssignmentStatus::Completed,
            origin: AssignmentOrigin::OperatorDispatch,
            ..active_assignment("lw_1")
        };

        let decision = evaluate_purchase(&case, &[dispatched], "lw_1")
            .expect("completed dispatch is not a spent slot");
        match decision {
            PurchaseDecision::Granted(effect) => {
                assert_eq!(effect.new_purchases_made, 1);
                assert_eq!(effect.supersedes_assignment_id, None);
            }
            other => panic!("expected grant, got {other:?}"),
        }
    }

    #[test]
    fn purchase_keeps_one_active_assignment_per_case() {
        let mut case = market_case(0, 3, CaseStatus::Available);
        let mut assignments = Vec::new();

        for (idx, lawyer) in ["lw_1", "lw_2", "lw_3"].iter().enumerate() {
            apply_purchase(&mut case, &mut assignments, lawyer, idx as i64).expect("purchase");
            let active = assignments.iter().filter(|a| a.is_active()).count();
            assert_eq!(active, 1, "exactly one active assignment after each purchase");
        }
        assert_eq!(assignments.len(), 3);
    }

    #[test]
    fn purchase_rejects_cases_outside_the_marketplace() {
        for status in [CaseStatus::Draft, CaseStatus::AwaitingPayment, CaseStatus::Closed] {
            let case = market_case(0, 2, status);
            let err = evaluate_purchase(&case, &[], "lw_1").unwrap_err();
            assert_eq!(err, CoreError::CaseNotAvailable { status });
        }
    }

    #[test]
    fn purchase_in_ready_for_proposal_keeps_status() {
        let case = market_case(0, 3, CaseStatus::ReadyForProposal);
        let decision = evaluate_purchase(&case, &[], "lw_1").expect("still purchasable");
        match decision {
            PurchaseDecision::Granted(effect) => {
                assert_eq!(effect.new_status, CaseStatus::ReadyForProposal);
                assert_eq!(effect.new_purchases_made, 1);
            }
            other => panic!("expected grant, got {other:?}"),
        }

        // Counter full in ready_for_proposal still rejects.
        let full = market_case(3, 3, CaseStatus::ReadyForProposal);
        assert_eq!(
            evaluate_purchase(&full, &[], "lw_1").unwrap_err(),
            CoreError::SlotExhausted
        );
    }

    #[test]
    fn operator_assign_ignores_slot_count_and_counter() {
        // Scenario: operator assigns onto an already-exhausted case; the
        // counter stays put while a new active assignment appears.
        let case = market_case(2, 2, CaseStatus::Exhausted);
        let previous = active_assignment("lw_1");
        let operator = Viewer::operator("op_1");

        let decision = evaluate_operator_assign(&case, &[previous.clone()], &operator, "lw_9")
            .expect("operator dispatch succeeds on exhausted case");

        match decision {
            AssignDecision::Granted(effect) => {
                assert_eq!(
                    effect.supersedes_assignment_id,
                    Some(previous.assignment_id)
                );
            }
            other => panic!("expected grant, got {other:?}"),
        }
    }

    #[test]
    fn operator_assign_requires_privilege_and_live_case() {
        let case = market_case(0, 2, CaseStatus::Available);
        let lawyer = Viewer::lawyer("lw_1");
        assert_eq!(
            evaluate_operator_assign(&case, &[], &lawyer, "lw_2").unwrap_err(),
            CoreError::Forbidden
        );

        let super_admin = Viewer::super_admin("sa_1");
        assert!(evaluate_operator_assign(&case, &[], &super_admin, "lw_2").is_ok());

        let mut closed = market_case(0, 2, CaseStatus::Closed);
        closed.closed_at_epoch_ms = Some(5);
        assert_eq!(
            evaluate_operator_assign(&closed, &[], &super_admin, "lw_2").unwrap_err(),
            CoreError::CaseClosed
        );

        let draft = market_case(0, 2, CaseStatus::Draft);
        assert_eq!(
            evaluate_operator_assign(&draft, &[], &super_admin, "lw_2").unwrap_err(),
            CoreError::CaseNotAvailable {
                status: CaseStatus::Draft
            }
        );
    }

    #[test]
    fn operator_assign_is_idempotent_for_current_lawyer() {
        let case = market_case(1, 2, CaseStatus::Available);
        let current = active_assignment("lw_1");
        let operator = Viewer::operator("op_1");

        let decision = evaluate_operator_assign(&case, &[current.clone()], &operator, "lw_1")
            .expect("re-assigning the current lawyer is a no-op");
        assert_eq!(
            decision,
            AssignDecision::AlreadyAssigned {
                assignment_id: current.assignment_id
            }
        );
    }

    #[test]
    fn close_is_gated_to_operator_or_assigned_lawyer() {
        // Scenario: the assigned lawyer closes; an unassigned lawyer is
        // refused with Forbidden.
        let case = market_case(1, 2, CaseStatus::Available);
        let assignment = active_assignment("lw_1");

        let effect = evaluate_close(&case, &[assignment.clone()], &Viewer::lawyer("lw_1"))
            .expect("assigned lawyer may close");
        assert_eq!(
            effect.complete_assignment_id,
            Some(assignment.assignment_id.clone())
        );

        assert_eq!(
            evaluate_close(&case, &[assignment.clone()], &Viewer::lawyer("lw_2")).unwrap_err(),
            CoreError::Forbidden
        );
        assert_eq!(
            evaluate_close(&case, &[assignment.clone()], &Viewer::client("client_1"))
                .unwrap_err(),
            CoreError::Forbidden
        );

        evaluate_close(&case, &[assignment], &Viewer::operator("op_1"))
            .expect("operator may always close a live case");
    }

    #[test]
    fn closing_twice_is_an_invalid_transition() {
        let mut case = market_case(0, 2, CaseStatus::Closed);
        case.closed_at_epoch_ms = Some(5);
        let err = evaluate_close(&case, &[], &Viewer::operator("op_1")).unwrap_err();
        assert_eq!(
            err,
            CoreError::InvalidTransition {
                from: CaseStatus::Closed,
                to: CaseStatus::Closed
            }
        );
    }

    #[test]
    fn close_attempt_on_closed_case_by_stranger_is_forbidden() {
        let mut case = market_case(1, 2, CaseStatus::Available);
        let mut assignments = vec![active_assignment("lw_1")];

        let effect = evaluate_close(&case, &assignments, &Viewer::lawyer("lw_1"))
            .expect("assigned lawyer closes the case");
        case.status = CaseStatus::Closed;
        case.closed_at_epoch_ms = Some(20);
        for assignment in assignments.iter_mut() {
            if Some(&assignment.assignment_id) == effect.complete_assignment_id.as_ref() {
                assignment.status = AssignmentStatus::Completed;
            }
        }

        // An unrelated lawyer probing the closed case lacks any relation
        // to it, so the answer is Forbidden rather than InvalidTransition.
        assert_eq!(
            evaluate_close(&case, &assignments, &Viewer::lawyer("lw_2")).unwrap_err(),
            CoreError::Forbidden
        );
    }

    #[test]
    fn payment_events_follow_the_graph() {
        let draft = market_case(0, 2, CaseStatus::Draft);
        assert_eq!(payment_succeeded(&draft), Ok(CaseStatus::AwaitingPayment));
        assert_eq!(
            payment_confirmed(&draft).unwrap_err(),
            CoreError::InvalidTransition {
                from: CaseStatus::Draft,
                to: CaseStatus::Available
            }
        );

        let awaiting = market_case(0, 2, CaseStatus::AwaitingPayment);
        assert_eq!(payment_confirmed(&awaiting), Ok(CaseStatus::Available));

        // Replayed gateway callbacks do not re-run a past transition.
        let available = market_case(0, 2, CaseStatus::Available);
        assert!(payment_succeeded(&available).is_err());
    }

    #[test]
    fn analysis_ready_is_orthogonal_to_exhaustion() {
        let available = market_case(0, 2, CaseStatus::Available);
        assert_eq!(
            analysis_ready(&available),
            Ok(Some(CaseStatus::ReadyForProposal))
        );

        let exhausted = market_case(2, 2, CaseStatus::Exhausted);
        assert_eq!(
            analysis_ready(&exhausted),
            Ok(Some(CaseStatus::ReadyForProposal))
        );

        // Re-delivery updates text without a status change.
        let ready = market_case(0, 2, CaseStatus::ReadyForProposal);
        assert_eq!(analysis_ready(&ready), Ok(None));

        let draft = market_case(0, 2, CaseStatus::Draft);
        assert_eq!(analysis_ready(&draft), Ok(None));

        let mut closed = market_case(0, 2, CaseStatus::Closed);
        closed.closed_at_epoch_ms = Some(5);
        assert_eq!(analysis_ready(&closed).unwrap_err(), CoreError::CaseClosed);
    }
}
