//! Postgres persistence for the case lifecycle and lead marketplace.
//!
//! Every statement runs under a bounded write timeout. Multi-step domain
//! operations (purchase, operator assign, close, payment events) serialize
//! per case through `pg_advisory_xact_lock`, evaluate the pure decision
//! from `lexlead-marketplace` against the freshly loaded rows, and apply
//! the effect inside the same transaction. The purchase increment uses a
//! conditional UPDATE so the slot limit can never be overrun even if the
//! lock discipline were bypassed.

use std::time::Duration;

use lexlead_contracts::{
    Assignment, AssignmentOrigin, AssignmentStatus, Case, CaseStatus, CoreError, DocumentKind,
    DraftContact, LawyerTier, LeadTier, Role, Viewer, unix_epoch_ms_now,
};
use lexlead_marketplace::{AssignDecision, PurchaseDecision, new_assignment};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Postgres, Row, Transaction};
use ulid::Ulid;

#[derive(Debug)]
pub enum StoreError {
    Timeout,
    Sqlx(sqlx::Error),
    Decode(String),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::Timeout => write!(f, "store operation timed out"),
            StoreError::Sqlx(err) => write!(f, "store sql error: {}", err),
            StoreError::Decode(what) => write!(f, "store row decode error: {}", what),
        }
    }
}

impl std::error::Error for StoreError {}

impl From<sqlx::Error> for StoreError {
    fn from(value: sqlx::Error) -> Self {
        StoreError::Sqlx(value)
    }
}

/// Either a business-rule rejection (surfaced to the caller verbatim) or
/// an infrastructure failure.
#[derive(Debug)]
pub enum OpError {
    Domain(CoreError),
    Store(StoreError),
}

impl std::fmt::Display for OpError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OpError::Domain(err) => write!(f, "{}", err),
            OpError::Store(err) => write!(f, "{}", err),
        }
    }
}

impl std::error::Error for OpError {}

impl From<CoreError> for OpError {
    fn from(value: CoreError) -> Self {
        OpError::Domain(value)
    }
}

impl From<StoreError> for OpError {
    fn from(value: StoreError) -> Self {
        OpError::Store(value)
    }
}

impl From<sqlx::Error> for OpError {
    fn from(value: sqlx::Error) -> Self {
        OpError::Store(StoreError::Sqlx(value))
    }
}

#[derive(Debug, Clone)]
pub struct NewCase {
    pub specialty_id: String,
    pub lead_tier: LeadTier,
    pub purchase_cost: i64,
    pub purchase_limit: i32,
    pub owner_id: Option<String>,
    pub draft_contact: DraftContact,
}

#[derive(Debug, Clone)]
pub struct AccountRecord {
    pub account_id: String,
    pub role: Role,
    pub lawyer_tier: Option<LawyerTier>,
    pub name: Option<String>,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub city: Option<String>,
    pub company_name: Option<String>,
    pub company_role: Option<String>,
}

/// Resolved role/tier for the permission cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AccountGrant {
    pub role: Role,
    pub lawyer_tier: Option<LawyerTier>,
}

#[derive(Debug, Clone)]
pub struct AnalysisUpdate {
    pub summary_text: Option<String>,
    pub lawyer_guidance_text: Option<String>,
    pub structured_proposal: Option<serde_json::Value>,
}

#[derive(Debug, Clone)]
pub struct PurchaseReceipt {
    pub case: Case,
    pub assignment: Assignment,
    /// True when the lawyer already held the active assignment and the
    /// call was a success-equivalent retry.
    pub already_assigned: bool,
}

#[derive(Debug, Clone)]
pub struct AssignReceipt {
    pub case: Case,
    pub assignment: Assignment,
    pub already_assigned: bool,
}

#[derive(Debug, Clone)]
pub struct CaseWithAssignments {
    pub case: Case,
    pub assignments: Vec<Assignment>,
}

const CASE_COLUMNS: &str = "case_id, status, owner_id, specialty_id, lead_tier, purchase_cost, \
     purchases_made, purchase_limit, contact_name, contact_email, contact_phone, contact_city, \
     contact_company_name, contact_company_role, summary_text, lawyer_guidance_text, \
     structured_proposal, created_at_epoch_ms, closed_at_epoch_ms";

const ASSIGNMENT_COLUMNS: &str =
    "assignment_id, case_id, lawyer_id, assignment_status, origin, assigned_at_epoch_ms, notes";

const DOCUMENT_COLUMNS: &str = "document_id, case_id, owner_id, file_name, storage_path, \
     uploaded_at_epoch_ms, deleted_at_epoch_ms";

#[derive(Clone)]
pub struct CaseStore {
    pool: PgPool,
    write_timeout: Duration,
}

impl CaseStore {
    pub async fn connect(db_url: &str, write_timeout: Duration) -> Result<Self, StoreError> {
        let pool = tokio::time::timeout(
            Duration::from_secs(2),
            PgPoolOptions::new().max_connections(8).connect(db_url),
        )
        .await
        .map_err(|_| StoreError::Timeout)??;

        Ok(Self {
            pool,
            write_timeout,
        })
    }

    pub async fn connect_and_migrate(
        db_url: &str,
        write_timeout: Duration,
    ) -> Result<Self, StoreError> {
        let store = Self::connect(db_url, write_timeout).await?;
        store.migrate().await?;
        Ok(store)
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        tokio::time::timeout(Duration::from_secs(10), migrate(&self.pool))
            .await
            .map_err(|_| StoreError::Timeout)??;
        Ok(())
    }

    pub async fn ping(&self) -> Result<(), StoreError> {
        tokio::time::timeout(
            self.write_timeout.max(Duration::from_millis(50)),
            sqlx::query("SELECT 1").execute(&self.pool),
        )
        .await
        .map_err(|_| StoreError::Timeout)??;
        Ok(())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    // ---- accounts -------------------------------------------------------

    pub async fn upsert_account(&self, account: &AccountRecord) -> Result<(), StoreError> {
        tokio::time::timeout(
            self.write_timeout,
            sqlx::query(
                "INSERT INTO lexlead_accounts \
                 (account_id, role, lawyer_tier, name, email, phone, city, company_name, company_role) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9) \
                 ON CONFLICT (account_id) DO UPDATE SET \
                   role = EXCLUDED.role, \
                   lawyer_tier = EXCLUDED.lawyer_tier, \
                   name = COALESCE(lexlead_accounts.name, EXCLUDED.name), \
                   email = COALESCE(lexlead_accounts.email, EXCLUDED.email), \
                   phone = COALESCE(lexlead_accounts.phone, EXCLUDED.phone), \
                   city = COALESCE(lexlead_accounts.city, EXCLUDED.city), \
                   company_name = COALESCE(lexlead_accounts.company_name, EXCLUDED.company_name), \
                   company_role = COALESCE(lexlead_accounts.company_role, EXCLUDED.company_role)",
            )
            .bind(&account.account_id)
            .bind(account.role.as_str())
            .bind(account.lawyer_tier.map(|t| t.as_str()))
            .bind(&account.name)
            .bind(&account.email)
            .bind(&account.phone)
            .bind(&account.city)
            .bind(&account.company_name)
            .bind(&account.company_role)
            .execute(&self.pool),
        )
        .await
        .map_err(|_| StoreError::Timeout)??;
        Ok(())
    }

    /// Authoritative role lookup behind the permission cache.
    pub async fn account_grant(
        &self,
        account_id: &str,
    ) -> Result<Option<AccountGrant>, StoreError> {
        let row = tokio::time::timeout(
            self.write_timeout,
            sqlx::query("SELECT role, lawyer_tier FROM lexlead_accounts WHERE account_id = $1")
                .bind(account_id)
                .fetch_optional(&self.pool),
        )
        .await
        .map_err(|_| StoreError::Timeout)??;

        let Some(row) = row else {
            return Ok(None);
        };

        let role_raw: String = row.try_get("role")?;
        let role = Role::parse(&role_raw)
            .ok_or_else(|| StoreError::Decode(format!("unknown role `{}`", role_raw)))?;

        let tier_raw: Option<String> = row.try_get("lawyer_tier")?;
        let lawyer_tier = match tier_raw {
            None => None,
            Some(raw) => Some(
                LawyerTier::parse(&raw)
                    .ok_or_else(|| StoreError::Decode(format!("unknown lawyer tier `{}`", raw)))?,
            ),
        };

        Ok(Some(AccountGrant { role, lawyer_tier }))
    }

    // ---- case reads -----------------------------------------------------

    pub async fn get_case(&self, case_id: &str) -> Result<Option<Case>, StoreError> {
        let sql = format!("SELECT {CASE_COLUMNS} FROM lexlead_cases WHERE case_id = $1");
        let row = tokio::time::timeout(
            self.write_timeout,
            sqlx::query(&sql).bind(case_id).fetch_optional(&self.pool),
        )
        .await
        .map_err(|_| StoreError::Timeout)??;

        row.map(|r| case_from_row(&r)).transpose()
    }

    pub async fn assignments_for_case(
        &self,
        case_id: &str,
    ) -> Result<Vec<Assignment>, StoreError> {
        let sql = format!(
            "SELECT {ASSIGNMENT_COLUMNS} FROM lexlead_assignments \
             WHERE case_id = $1 ORDER BY assigned_at_epoch_ms, assignment_id"
        );
        let rows = tokio::time::timeout(
            self.write_timeout,
            sqlx::query(&sql).bind(case_id).fetch_all(&self.pool),
        )
        .await
        .map_err(|_| StoreError::Timeout)??;

        rows.iter().map(assignment_from_row).collect()
    }

    /// Role-scoped listing. Clients see their own cases; regular lawyers
    /// see the marketplace (urgent tiers first) plus everything they
    /// purchased; privileged viewers see all cases.
    pub async fn list_cases_for_viewer(
        &self,
        viewer: &Viewer,
    ) -> Result<Vec<CaseWithAssignments>, StoreError> {
        let cases = if viewer.is_privileged() {
            let sql = format!(
                "SELECT {CASE_COLUMNS} FROM lexlead_cases ORDER BY created_at_epoch_ms DESC"
            );
            tokio::time::timeout(self.write_timeout, sqlx::query(&sql).fetch_all(&self.pool))
                .await
                .map_err(|_| StoreError::Timeout)??
        } else {
            match viewer.role {
                Role::Client => {
                    let sql = format!(
                        "SELECT {CASE_COLUMNS} FROM lexlead_cases WHERE owner_id = $1 \
                         ORDER BY created_at_epoch_ms DESC"
                    );
                    tokio::time::timeout(
                        self.write_timeout,
                        sqlx::query(&sql)
                            .bind(&viewer.account_id)
                            .fetch_all(&self.pool),
                    )
                    .await
                    .map_err(|_| StoreError::Timeout)??
                }
                Role::Lawyer => {
                    let sql = format!(
                        "SELECT {CASE_COLUMNS} FROM lexlead_cases \
                         WHERE status IN ('available', 'ready_for_proposal') \
                            OR case_id IN \
                               (SELECT case_id FROM lexlead_assignments WHERE lawyer_id = $1) \
                         ORDER BY CASE lead_tier \
                                    WHEN 'urgent' THEN 0 \
                                    WHEN 'premium' THEN 1 \
                                    ELSE 2 END, \
                                  created_at_epoch_ms DESC"
                    );
                    tokio::time::timeout(
                        self.write_timeout,
                        sqlx::query(&sql)
                            .bind(&viewer.account_id)
                            .fetch_all(&self.pool),
                    )
                    .await
                    .map_err(|_| StoreError::Timeout)??
                }
                Role::Operator => Vec::new(),
            }
        };

        let cases = cases
            .iter()
            .map(case_from_row)
            .collect::<Result<Vec<_>, _>>()?;

        if cases.is_empty() {
            return Ok(Vec::new());
        }

        let case_ids = cases.iter().map(|c| c.case_id.clone()).collect::<Vec<_>>();
        let sql = format!(
            "SELECT {ASSIGNMENT_COLUMNS} FROM lexlead_assignments \
             WHERE case_id = ANY($1) ORDER BY assigned_at_epoch_ms, assignment_id"
        );
        let rows = tokio::time::timeout(
            self.write_timeout,
            sqlx::query(&sql).bind(&case_ids).fetch_all(&self.pool),
        )
        .await
        .map_err(|_| StoreError::Timeout)??;

        let all = rows
            .iter()
            .map(assignment_from_row)
            .collect::<Result<Vec<_>, _>>()?;

        Ok(cases
            .into_iter()
            .map(|case| {
                let assignments = all
                    .iter()
                    .filter(|a| a.case_id == case.case_id)
                    .cloned()
                    .collect();
                CaseWithAssignments { case, assignments }
            })
            .collect())
    }

    // ---- case writes ----------------------------------------------------

    pub async fn create_case(&self, new_case: NewCase) -> Result<Case, StoreError> {
        let case_id = Ulid::new().to_string();
        let now = unix_epoch_ms_now();

        tokio::time::timeout(self.write_timeout, async {
            // An intake submitted by a signed-in client arrives with an
            // owner. The account row must exist before the case can
            // reference it; an existing row is left untouched.
            if let Some(owner_id) = &new_case.owner_id {
                sqlx::query(
                    "INSERT INTO lexlead_accounts (account_id, role) VALUES ($1, 'client') \
                     ON CONFLICT (account_id) DO NOTHING",
                )
                .bind(owner_id)
                .execute(&self.pool)
                .await?;
            }

            sqlx::query(
                "INSERT INTO lexlead_cases \
                 (case_id, status, owner_id, specialty_id, lead_tier, purchase_cost, \
                  purchases_made, purchase_limit, contact_name, contact_email, contact_phone, \
                  contact_city, contact_company_name, contact_company_role, created_at_epoch_ms) \
                 VALUES ($1, $2, $3, $4, $5, $6, 0, $7, $8, $9, $10, $11, $12, $13, $14)",
            )
            .bind(&case_id)
            .bind(CaseStatus::Draft.as_str())
            .bind(&new_case.owner_id)
            .bind(&new_case.specialty_id)
            .bind(new_case.lead_tier.as_str())
            .bind(new_case.purchase_cost)
            .bind(new_case.purchase_limit)
            .bind(&new_case.draft_contact.name)
            .bind(&new_case.draft_contact.email)
            .bind(&new_case.draft_contact.phone)
            .bind(&new_case.draft_contact.city)
            .bind(&new_case.draft_contact.company_name)
            .bind(&new_case.draft_contact.company_role)
            .bind(now)
            .execute(&self.pool)
            .await
        })
        .await
        .map_err(|_| StoreError::Timeout)?
        .map_err(StoreError::Sqlx)?;

        Ok(Case {
            case_id,
            status: CaseStatus::Draft,
            owner_id: new_case.owner_id,
            specialty_id: new_case.specialty_id,
            lead_tier: new_case.lead_tier,
            purchase_cost: new_case.purchase_cost,
            purchases_made: 0,
            purchase_limit: new_case.purchase_limit,
            draft_contact: new_case.draft_contact,
            summary_text: None,
            lawyer_guidance_text: None,
            structured_proposal: None,
            created_at_epoch_ms: now,
            closed_at_epoch_ms: None,
        })
    }

    /// Payment gateway reported checkout success: `draft -> awaiting_payment`.
    pub async fn payment_succeeded(&self, case_id: &str) -> Result<Case, OpError> {
        tokio::time::timeout(self.write_timeout, async {
            let mut tx = self.begin_case_tx(case_id).await?;
            let case = load_case_for_update(&mut tx, case_id).await?;

            let next = lexlead_marketplace::payment_succeeded(&case)?;
            sqlx::query("UPDATE lexlead_cases SET status = $1 WHERE case_id = $2")
                .bind(next.as_str())
                .bind(case_id)
                .execute(&mut *tx)
                .await
                .map_err(StoreError::Sqlx)?;

            let case = load_case_for_update(&mut tx, case_id).await?;
            tx.commit().await.map_err(StoreError::Sqlx)?;
            Ok::<Case, OpError>(case)
        })
        .await
        .map_err(|_| OpError::Store(StoreError::Timeout))?
    }

    /// Payment confirmed and the case linked to an authenticated account:
    /// `awaiting_payment -> available`, plus the draft-contact backfill
    /// onto the account profile, in one transaction.
    pub async fn payment_confirmed(
        &self,
        case_id: &str,
        account_id: &str,
    ) -> Result<Case, OpError> {
        tokio::time::timeout(self.write_timeout, async {
            let mut tx = self.begin_case_tx(case_id).await?;
            let case = load_case_for_update(&mut tx, case_id).await?;

            let next = lexlead_marketplace::payment_confirmed(&case)?;

            // The account row must exist before the case can reference it.
            // Draft contact fields fill gaps in the profile; verified data
            // already on the account is never overwritten.
            sqlx::query(
                "INSERT INTO lexlead_accounts \
                 (account_id, role, name, email, phone, city, company_name, company_role) \
                 VALUES ($1, 'client', $2, $3, $4, $5, $6, $7) \
                 ON CONFLICT (account_id) DO UPDATE SET \
                   name = COALESCE(lexlead_accounts.name, EXCLUDED.name), \
                   email = COALESCE(lexlead_accounts.email, EXCLUDED.email), \
                   phone = COALESCE(lexlead_accounts.phone, EXCLUDED.phone), \
                   city = COALESCE(lexlead_accounts.city, EXCLUDED.city), \
                   company_name = COALESCE(lexlead_accounts.company_name, EXCLUDED.company_name), \
                   company_role = COALESCE(lexlead_accounts.company_role, EXCLUDED.company_role)",
            )
            .bind(account_id)
            .bind(&case.draft_contact.name)
            .bind(&case.draft_contact.email)
            .bind(&case.draft_contact.phone)
            .bind(&case.draft_contact.city)
            .bind(&case.draft_contact.company_name)
            .bind(&case.draft_contact.company_role)
            .execute(&mut *tx)
            .await
            .map_err(StoreError::Sqlx)?;

            sqlx::query("UPDATE lexlead_cases SET status = $1, owner_id = $2 WHERE case_id = $3")
                .bind(next.as_str())
                .bind(account_id)
                .bind(case_id)
                .execute(&mut *tx)
                .await
                .map_err(StoreError::Sqlx)?;

            let case = load_case_for_update(&mut tx, case_id).await?;
            tx.commit().await.map_err(StoreError::Sqlx)?;
            Ok::<Case, OpError>(case)
        })
        .await
        .map_err(|_| OpError::Store(StoreError::Timeout))?
    }

    /// Upstream analysis delivered case text; advances to
    /// `ready_for_proposal` when the graph allows it.
    pub async fn analysis_ready(
        &self,
        case_id: &str,
        update: AnalysisUpdate,
    ) -> Result<Case, OpError> {
        tokio::time::timeout(self.write_timeout, async {
            let mut tx = self.begin_case_tx(case_id).await?;
            let case = load_case_for_update(&mut tx, case_id).await?;

            let next = lexlead_marketplace::analysis_ready(&case)?;
            sqlx::query(
                "UPDATE lexlead_cases SET \
                   summary_text = COALESCE($1, summary_text), \
                   lawyer_guidance_text = COALESCE($2, lawyer_guidance_text), \
                   structured_proposal = COALESCE($3, structured_proposal), \
                   status = COALESCE($4, status) \
                 WHERE case_id = $5",
            )
            .bind(&update.summary_text)
            .bind(&update.lawyer_guidance_text)
            .bind(&update.structured_proposal)
            .bind(next.map(|s| s.as_str()))
            .bind(case_id)
            .execute(&mut *tx)
            .await
            .map_err(StoreError::Sqlx)?;

            let case = load_case_for_update(&mut tx, case_id).await?;
            tx.commit().await.map_err(StoreError::Sqlx)?;
            Ok::<Case, OpError>(case)
        })
        .await
        .map_err(|_| OpError::Store(StoreError::Timeout))?
    }

    /// Claim one purchase slot. The increment and the possible
    /// `available -> exhausted` flip are one conditional UPDATE; the
    /// assignment insert rides the same transaction, so two lawyers racing
    /// for the last slot cannot both succeed.
    pub async fn purchase(&self, case_id: &str, lawyer_id: &str) -> Result<PurchaseReceipt, OpError> {
        tokio::time::timeout(self.write_timeout, async {
            let mut tx = self.begin_case_tx(case_id).await?;
            let case = load_case_for_update(&mut tx, case_id).await?;
            let assignments = load_assignments_for_update(&mut tx, case_id).await?;

            let decision =
                lexlead_marketplace::evaluate_purchase(&case, &assignments, lawyer_id)?;

            match decision {
                PurchaseDecision::AlreadyAssigned { assignment_id } => {
                    let assignment = assignments
                        .into_iter()
                        .find(|a| a.assignment_id == assignment_id)
                        .ok_or(OpError::Domain(CoreError::NotFound))?;
                    tx.commit().await.map_err(StoreError::Sqlx)?;
                    Ok(PurchaseReceipt {
                        case,
                        assignment,
                        already_assigned: true,
                    })
                }
                PurchaseDecision::Granted(effect) => {
                    if let Some(superseded) = &effect.supersedes_assignment_id {
                        complete_assignment(&mut tx, superseded).await?;
                    }

                    let updated = sqlx::query(
                        "UPDATE lexlead_cases SET \
                           purchases_made = purchases_made + 1, \
                           status = CASE WHEN status = 'available' \
                                          AND purchases_made + 1 >= purchase_limit \
                                    THEN 'exhausted' ELSE status END \
                         WHERE case_id = $1 \
                           AND status IN ('available', 'ready_for_proposal') \
                           AND purchases_made < purchase_limit",
                    )
                    .bind(case_id)
                    .execute(&mut *tx)
                    .await
                    .map_err(StoreError::Sqlx)?;

                    if updated.rows_affected() == 0 {
                        return Err(OpError::Domain(CoreError::SlotExhausted));
                    }

                    let assignment = new_assignment(
                        case_id,
                        lawyer_id,
                        AssignmentOrigin::Purchase,
                        None,
                        unix_epoch_ms_now(),
                    );
                    insert_assignment(&mut tx, &assignment).await?;

                    let case = load_case_for_update(&mut tx, case_id).await?;
                    tx.commit().await.map_err(StoreError::Sqlx)?;

                    tracing::info!(
                        case_id,
                        lawyer_id,
                        purchases_made = case.purchases_made,
                        status = case.status.as_str(),
                        "lead slot purchased"
                    );

                    Ok(PurchaseReceipt {
                        case,
                        assignment,
                        already_assigned: false,
                    })
                }
            }
        })
        .await
        .map_err(|_| OpError::Store(StoreError::Timeout))?
    }

    /// Privileged manual dispatch; never touches `purchases_made`.
    pub async fn assign_operator(
        &self,
        case_id: &str,
        actor: &Viewer,
        lawyer_id: &str,
        notes: Option<String>,
    ) -> Result<AssignReceipt, OpError> {
        tokio::time::timeout(self.write_timeout, async {
            let mut tx = self.begin_case_tx(case_id).await?;
            let case = load_case_for_update(&mut tx, case_id).await?;
            let assignments = load_assignments_for_update(&mut tx, case_id).await?;

            let decision = lexlead_marketplace::evaluate_operator_assign(
                &case,
                &assignments,
                actor,
                lawyer_id,
            )?;

            match decision {
                AssignDecision::AlreadyAssigned { assignment_id } => {
                    let assignment = assignments
                        .into_iter()
                        .find(|a| a.assignment_id == assignment_id)
                        .ok_or(OpError::Domain(CoreError::NotFound))?;
                    tx.commit().await.map_err(StoreError::Sqlx)?;
                    Ok(AssignReceipt {
                        case,
                        assignment,
                        already_assigned: true,
                    })
                }
                AssignDecision::Granted(effect) => {
                    if let Some(superseded) = &effect.supersedes_assignment_id {
                        complete_assignment(&mut tx, superseded).await?;
                    }

                    let assignment = new_assignment(
                        case_id,
                        lawyer_id,
                        AssignmentOrigin::OperatorDispatch,
                        notes,
                        unix_epoch_ms_now(),
                    );
                    insert_assignment(&mut tx, &assignment).await?;

                    let case = load_case_for_update(&mut tx, case_id).await?;
                    tx.commit().await.map_err(StoreError::Sqlx)?;

                    tracing::info!(case_id, lawyer_id, "lawyer assigned by operator");

                    Ok(AssignReceipt {
                        case,
                        assignment,
                        already_assigned: false,
                    })
                }
            }
        })
        .await
        .map_err(|_| OpError::Store(StoreError::Timeout))?
    }

    /// Terminal close; completes the active assignment in the same
    /// transaction.
    pub async fn close_case(&self, case_id: &str, actor: &Viewer) -> Result<Case, OpError> {
        tokio::time::timeout(self.write_timeout, async {
            let mut tx = self.begin_case_tx(case_id).await?;
            let case = load_case_for_update(&mut tx, case_id).await?;
            let assignments = load_assignments_for_update(&mut tx, case_id).await?;

            let effect = lexlead_marketplace::evaluate_close(&case, &assignments, actor)?;

            sqlx::query(
                "UPDATE lexlead_cases SET status = 'closed', closed_at_epoch_ms = $1 \
                 WHERE case_id = $2 AND status <> 'closed'",
            )
            .bind(unix_epoch_ms_now())
            .bind(case_id)
            .execute(&mut *tx)
            .await
            .map_err(StoreError::Sqlx)?;

            if let Some(assignment_id) = &effect.complete_assignment_id {
                complete_assignment(&mut tx, assignment_id).await?;
            }

            let case = load_case_for_update(&mut tx, case_id).await?;
            tx.commit().await.map_err(StoreError::Sqlx)?;

            tracing::info!(case_id, actor = actor.account_id.as_str(), "case closed");
            Ok::<Case, OpError>(case)
        })
        .await
        .map_err(|_| OpError::Store(StoreError::Timeout))?
    }

    // ---- documents ------------------------------------------------------

    pub async fn insert_document(
        &self,
        kind: DocumentKind,
        case_id: &str,
        owner_id: &str,
        file_name: &str,
        storage_path: &str,
    ) -> Result<lexlead_contracts::DocumentRecord, OpError> {
        let document_id = Ulid::new().to_string();
        let now = unix_epoch_ms_now();
        let sql = format!(
            "INSERT INTO {} (document_id, case_id, owner_id, file_name, storage_path, \
             uploaded_at_epoch_ms) VALUES ($1, $2, $3, $4, $5, $6)",
            document_table(kind)
        );

        let result = tokio::time::timeout(
            self.write_timeout,
            sqlx::query(&sql)
                .bind(&document_id)
                .bind(case_id)
                .bind(owner_id)
                .bind(file_name)
                .bind(storage_path)
                .bind(now)
                .execute(&self.pool),
        )
        .await
        .map_err(|_| OpError::Store(StoreError::Timeout))?;

        match result {
            Ok(_) => Ok(lexlead_contracts::DocumentRecord {
                document_id,
                case_id: case_id.to_string(),
                owner_id: owner_id.to_string(),
                file_name: file_name.to_string(),
                storage_path: storage_path.to_string(),
                uploaded_at_epoch_ms: now,
                deleted_at_epoch_ms: None,
            }),
            // A dangling case reference is the caller's NotFound, not a
            // 500.
            Err(err) if is_foreign_key_violation(&err) => {
                Err(OpError::Domain(CoreError::NotFound))
            }
            Err(err) => Err(OpError::Store(StoreError::Sqlx(err))),
        }
    }

    pub async fn get_document(
        &self,
        kind: DocumentKind,
        document_id: &str,
    ) -> Result<Option<lexlead_contracts::DocumentRecord>, StoreError> {
        let sql = format!(
            "SELECT {DOCUMENT_COLUMNS} FROM {} WHERE document_id = $1",
            document_table(kind)
        );
        let row = tokio::time::timeout(
            self.write_timeout,
            sqlx::query(&sql).bind(document_id).fetch_optional(&self.pool),
        )
        .await
        .map_err(|_| StoreError::Timeout)??;

        row.map(|r| document_from_row(&r)).transpose()
    }

    /// Soft-deletes the metadata record and hands back the storage path so
    /// the caller can remove the stored object afterwards. Metadata goes
    /// first: a missing file with surviving metadata is recoverable, the
    /// reverse is an orphan.
    pub async fn soft_delete_document(
        &self,
        kind: DocumentKind,
        document_id: &str,
    ) -> Result<String, OpError> {
        let sql = format!(
            "UPDATE {} SET deleted_at_epoch_ms = $1 \
             WHERE document_id = $2 AND deleted_at_epoch_ms IS NULL \
             RETURNING storage_path",
            document_table(kind)
        );
        let row = tokio::time::timeout(
            self.write_timeout,
            sqlx::query(&sql)
                .bind(unix_epoch_ms_now())
                .bind(document_id)
                .fetch_optional(&self.pool),
        )
        .await
        .map_err(|_| OpError::Store(StoreError::Timeout))?
        .map_err(StoreError::Sqlx)?;

        let row = row.ok_or(OpError::Domain(CoreError::NotFound))?;
        let storage_path: String = row.try_get("storage_path").map_err(StoreError::Sqlx)?;
        Ok(storage_path)
    }

    /// Removes a metadata record that was written moments ago but whose
    /// stored object failed verification; upload rollback path.
    pub async fn delete_document_record(
        &self,
        kind: DocumentKind,
        document_id: &str,
    ) -> Result<(), StoreError> {
        let sql = format!(
            "DELETE FROM {} WHERE document_id = $1",
            document_table(kind)
        );
        tokio::time::timeout(
            self.write_timeout,
            sqlx::query(&sql).bind(document_id).execute(&self.pool),
        )
        .await
        .map_err(|_| StoreError::Timeout)??;
        Ok(())
    }

    pub async fn list_documents(
        &self,
        case_id: &str,
        kind: DocumentKind,
    ) -> Result<Vec<lexlead_contracts::DocumentRecord>, StoreError> {
        let sql = format!(
            "SELECT {DOCUMENT_COLUMNS} FROM {} \
             WHERE case_id = $1 AND deleted_at_epoch_ms IS NULL \
             ORDER BY uploaded_at_epoch_ms, document_id",
            document_table(kind)
        );
        let rows = tokio::time::timeout(
            self.write_timeout,
            sqlx::query(&sql).bind(case_id).fetch_all(&self.pool),
        )
        .await
        .map_err(|_| StoreError::Timeout)??;

        rows.iter().map(document_from_row).collect()
    }

    // ---- internals ------------------------------------------------------

    /// Opens a transaction serialized on the case id. Every read-modify-
    /// write against a case goes through this lock, so decision and effect
    /// cannot interleave with a concurrent writer.
    async fn begin_case_tx(
        &self,
        case_id: &str,
    ) -> Result<Transaction<'_, Postgres>, StoreError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("SELECT pg_advisory_xact_lock(hashtextextended($1, 0))")
            .bind(case_id)
            .execute(&mut *tx)
            .await?;
        Ok(tx)
    }
}

fn document_table(kind: DocumentKind) -> &'static str {
    match kind {
        DocumentKind::Resolution => "lexlead_resolution_documents",
        DocumentKind::Client => "lexlead_client_documents",
    }
}

fn is_foreign_key_violation(err: &sqlx::Error) -> bool {
    err.as_database_error()
        .is_some_and(|db| db.is_foreign_key_violation())
}

async fn load_case_for_update(
    tx: &mut Transaction<'_, Postgres>,
    case_id: &str,
) -> Result<Case, OpError> {
    let sql = format!("SELECT {CASE_COLUMNS} FROM lexlead_cases WHERE case_id = $1");
    let row = sqlx::query(&sql)
        .bind(case_id)
        .fetch_optional(&mut **tx)
        .await
        .map_err(StoreError::Sqlx)?;

    let row = row.ok_or(OpError::Domain(CoreError::NotFound))?;
    Ok(case_from_row(&row)?)
}

async fn load_assignments_for_update(
    tx: &mut Transaction<'_, Postgres>,
    case_id: &str,
) -> Result<Vec<Assignment>, OpError> {
    let sql = format!(
        "SELECT {ASSIGNMENT_COLUMNS} FROM lexlead_assignments \
         WHERE case_id = $1 ORDER BY assigned_at_epoch_ms, assignment_id"
    );
    let rows = sqlx::query(&sql)
        .bind(case_id)
        .fetch_all(&mut **tx)
        .await
        .map_err(StoreError::Sqlx)?;

    Ok(rows
        .iter()
        .map(assignment_from_row)
        .collect::<Result<Vec<_>, _>>()?)
}

async fn complete_assignment(
    tx: &mut Transaction<'_, Postgres>,
    assignment_id: &str,
) -> Result<(), OpError> {
    sqlx::query(
        "UPDATE lexlead_assignments SET assignment_status = 'completed' \
         WHERE assignment_id = $1 AND assignment_status = 'active'",
    )
    .bind(assignment_id)
    .execute(&mut **tx)
    .await
    .map_err(StoreError::Sqlx)?;
    Ok(())
}

async fn insert_assignment(
    tx: &mut Transaction<'_, Postgres>,
    assignment: &Assignment,
) -> Result<(), OpError> {
    let result = sqlx::query(
        "INSERT INTO lexlead_assignments \
         (assignment_id, case_id, lawyer_id, assignment_status, origin, \
          assigned_at_epoch_ms, notes) \
         VALUES ($1, $2, $3, $4, $5, $6, $7)",
    )
    .bind(&assignment.assignment_id)
    .bind(&assignment.case_id)
    .bind(&assignment.lawyer_id)
    .bind(assignment.status.as_str())
    .bind(assignment.origin.as_str())
    .bind(assignment.assigned_at_epoch_ms)
    .bind(&assignment.notes)
    .execute(&mut **tx)
    .await;

    match result {
        Ok(_) => Ok(()),
        // The partial unique index tripping means another active
        // assignment slipped in; surface it as the duplicate-purchase
        // taxonomy value instead of a bare constraint error.
        Err(err)
            if err
                .as_database_error()
                .is_some_and(|db| db.constraint() == Some("lexlead_assignments_one_active")) =>
        {
            Err(OpError::Domain(CoreError::AlreadyPurchased))
        }
        Err(err) => Err(OpError::Store(StoreError::Sqlx(err))),
    }
}

fn case_from_row(row: &PgRow) -> Result<Case, StoreError> {
    let status_raw: String = row.try_get("status")?;
    let status = CaseStatus::parse(&status_raw)
        .ok_or_else(|| StoreError::Decode(format!("unknown case status `{}`", status_raw)))?;

    let tier_raw: String = row.try_get("lead_tier")?;
    let lead_tier = LeadTier::parse(&tier_raw)
        .ok_or_else(|| StoreError::Decode(format!("unknown lead tier `{}`", tier_raw)))?;

    Ok(Case {
        case_id: row.try_get("case_id")?,
        status,
        owner_id: row.try_get("owner_id")?,
        specialty_id: row.try_get("specialty_id")?,
        lead_tier,
        purchase_cost: row.try_get("purchase_cost")?,
        purchases_made: row.try_get("purchases_made")?,
        purchase_limit: row.try_get("purchase_limit")?,
        draft_contact: DraftContact {
            name: row.try_get("contact_name")?,
            email: row.try_get("contact_email")?,
            phone: row.try_get("contact_phone")?,
            city: row.try_get("contact_city")?,
            company_name: row.try_get("contact_company_name")?,
            company_role: row.try_get("contact_company_role")?,
        },
        summary_text: row.try_get("summary_text")?,
        lawyer_guidance_text: row.try_get("lawyer_guidance_text")?,
        structured_proposal: row.try_get("structured_proposal")?,
        created_at_epoch_ms: row.try_get("created_at_epoch_ms")?,
        closed_at_epoch_ms: row.try_get("closed_at_epoch_ms")?,
    })
}

fn assignment_from_row(row: &PgRow) -> Result<Assignment, StoreError> {
    let status_raw: String = row.try_get("assignment_status")?;
    let status = AssignmentStatus::parse(&status_raw).ok_or_else(|| {
        StoreError::Decode(format!("unknown assignment status `{}`", status_raw))
    })?;

    let origin_raw: String = row.try_get("origin")?;
    let origin = AssignmentOrigin::parse(&origin_raw).ok_or_else(|| {
        StoreError::Decode(format!("unknown assignment origin `{}`", origin_raw))
    })?;

    Ok(Assignment {
        assignment_id: row.try_get("assignment_id")?,
        case_id: row.try_get("case_id")?,
        lawyer_id: row.try_get("lawyer_id")?,
        status,
        origin,
        assigned_at_epoch_ms: row.try_get("assigned_at_epoch_ms")?,
        notes: row.try_get("notes")?,
    })
}

fn document_from_row(row: &PgRow) -> Result<lexlead_contracts::DocumentRecord, StoreError> {
    Ok(lexlead_contracts::DocumentRecord {
        document_id: row.try_get("document_id")?,
        case_id: row.try_get("case_id")?,
        owner_id: row.try_get("owner_id")?,
        file_name: row.try_get("file_name")?,
        storage_path: row.try_get("storage_path")?,
        uploaded_at_epoch_ms: row.try_get("uploaded_at_epoch_ms")?,
        deleted_at_epoch_ms: row.try_get("deleted_at_epoch_ms")?,
    })
}

pub async fn migrate(pool: &PgPool) -> Result<(), sqlx::Error> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}
