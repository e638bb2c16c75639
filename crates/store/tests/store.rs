use std::time::Duration;

use lexlead_contracts::{
    AssignmentOrigin, AssignmentStatus, CaseStatus, CoreError, DocumentKind, DraftContact,
    LeadTier, Role, Viewer,
};
use lexlead_store::{AccountRecord, CaseStore, NewCase, OpError};
use sqlx::Row;

fn test_db_url() -> Option<String> {
    std::env::var("LEXLEAD_TEST_DB_URL")
        .ok()
        .or_else(|| std::env::var("DATABASE_URL").ok())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

fn schema_db_url(base: &str, schema: &str) -> String {
    let separator = if base.contains('?') { "&" } else { "?" };
    format!("{base}{separator}options=-csearch_path%3D{schema}")
}

async fn fresh_store(db_url: &str) -> (sqlx::PgPool, String, CaseStore) {
    let schema = format!("lexlead_test_{}", ulid::Ulid::new());
    let schema_url = schema_db_url(db_url, &schema);

    let admin_pool = sqlx::postgres::PgPoolOptions::new()
        .max_connections(1)
        .connect(db_url)
        .await
        .expect("DB connect should succeed");

    let create_schema = format!("CREATE SCHEMA {}", schema);
    sqlx::query(&create_schema)
        .execute(&admin_pool)
        .await
        .expect("create schema should succeed");

    let store = CaseStore::connect_and_migrate(&schema_url, Duration::from_secs(2))
        .await
        .expect("store init should succeed");

    (admin_pool, schema, store)
}

async fn drop_schema(admin_pool: &sqlx::PgPool, schema: &str) {
    let drop = format!("DROP SCHEMA {} CASCADE", schema);
    let _ = sqlx::query(&drop).execute(admin_pool).await;
    admin_pool.close().await;
}

fn lawyer_account(id: &str) -> AccountRecord {
    AccountRecord {
        account_id: id.to_string(),
        role: Role::Lawyer,
        lawyer_tier: Some(lexlead_contracts::LawyerTier::Regular),
        name: None,
        email: None,
        phone: None,
        city: None,
        company_name: None,
        company_role: None,
    }
}

fn draft_case(limit: i32) -> NewCase {
    NewCase {
        specialty_id: "employment".to_string(),
        lead_tier: LeadTier::Premium,
        purchase_cost: 4900,
        purchase_limit: limit,
        owner_id: None,
        draft_contact: DraftContact {
            name: Some("Ada Client".to_string()),
            email: Some("ada@example.com".to_string()),
            phone: None,
            city: Some("Berlin".to_string()),
            company_name: None,
            company_role: None,
        },
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn migrations_apply_idempotently_and_enforce_slot_bounds() {
    let Some(db_url) = test_db_url() else {
        eprintln!("skipping DB migration test; set LEXLEAD_TEST_DB_URL to enable");
        return;
    };

    let (admin_pool, schema, store) = fresh_store(&db_url).await;

    store.migrate().await.expect("migrations should be idempotent");

    // The slot-bounds CHECK refuses a counter above the limit no matter
    // what the application layer does.
    let err = sqlx::query(
        "INSERT INTO lexlead_cases \
         (case_id, status, specialty_id, lead_tier, purchase_cost, purchases_made, \
          purchase_limit, created_at_epoch_ms) \
         VALUES ('bogus', 'available', 'tax', 'standard', 100, 5, 3, 0)",
    )
    .execute(store.pool())
    .await
    .expect_err("over-limit counter must be rejected");
    assert!(
        format!("{err:?}").contains("lexlead_cases_slot_bounds"),
        "expected slot bounds violation, got: {err:?}"
    );

    store.close().await;
    drop_schema(&admin_pool, &schema).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn full_lifecycle_draft_to_closed() {
    let Some(db_url) = test_db_url() else {
        eprintln!("skipping DB lifecycle test; set LEXLEAD_TEST_DB_URL to enable");
        return;
    };

    let (admin_pool, schema, store) = fresh_store(&db_url).await;

    for id in ["law-1", "law-2", "law-3"] {
        store
            .upsert_account(&lawyer_account(id))
            .await
            .expect("lawyer account should upsert");
    }

    let case = store
        .create_case(draft_case(2))
        .await
        .expect("case create should succeed");
    assert_eq!(case.status, CaseStatus::Draft);

    let case = store
        .payment_succeeded(&case.case_id)
        .await
        .expect("payment success hook should apply");
    assert_eq!(case.status, CaseStatus::AwaitingPayment);

    let case = store
        .payment_confirmed(&case.case_id, "client-1")
        .await
        .expect("payment confirmation should apply");
    assert_eq!(case.status, CaseStatus::Available);
    assert_eq!(case.owner_id.as_deref(), Some("client-1"));

    // Contact backfill created the client account and copied draft fields.
    let grant = store
        .account_grant("client-1")
        .await
        .expect("grant lookup should succeed")
        .expect("backfilled account should exist");
    assert_eq!(grant.role, Role::Client);
    let row = sqlx::query("SELECT name, city FROM lexlead_accounts WHERE account_id = 'client-1'")
        .fetch_one(store.pool())
        .await
        .expect("account row should exist");
    assert_eq!(
        row.try_get::<Option<String>, _>("name").unwrap().as_deref(),
        Some("Ada Client")
    );
    assert_eq!(
        row.try_get::<Option<String>, _>("city").unwrap().as_deref(),
        Some("Berlin")
    );

    let first = store
        .purchase(&case.case_id, "law-1")
        .await
        .expect("first purchase should succeed");
    assert!(!first.already_assigned);
    assert_eq!(first.case.purchases_made, 1);
    assert_eq!(first.case.status, CaseStatus::Available);
    assert_eq!(first.assignment.origin, AssignmentOrigin::Purchase);

    // Retry by the active holder is a success-equivalent no-op.
    let retry = store
        .purchase(&case.case_id, "law-1")
        .await
        .expect("retry should succeed");
    assert!(retry.already_assigned);
    assert_eq!(retry.assignment.assignment_id, first.assignment.assignment_id);

    let second = store
        .purchase(&case.case_id, "law-2")
        .await
        .expect("second purchase should succeed");
    assert_eq!(second.case.purchases_made, 2);
    assert_eq!(second.case.status, CaseStatus::Exhausted);

    let err = store
        .purchase(&case.case_id, "law-3")
        .await
        .expect_err("third purchase must fail");
    assert!(matches!(err, OpError::Domain(CoreError::SlotExhausted)));

    // Manual dispatch works past exhaustion and leaves the counter alone.
    let operator = Viewer::operator("op-1");
    let assigned = store
        .assign_operator(&case.case_id, &operator, "law-3", Some("escalation".to_string()))
        .await
        .expect("operator assign should succeed");
    assert!(!assigned.already_assigned);
    assert_eq!(assigned.case.purchases_made, 2);
    assert_eq!(assigned.assignment.origin, AssignmentOrigin::OperatorDispatch);

    let assignments = store
        .assignments_for_case(&case.case_id)
        .await
        .expect("assignments should load");
    let active: Vec<_> = assignments.iter().filter(|a| a.is_active()).collect();
    assert_eq!(active.len(), 1, "exactly one active assignment at a time");
    assert_eq!(active[0].lawyer_id, "law-3");

    let closed = store
        .close_case(&case.case_id, &operator)
        .await
        .expect("close should succeed");
    assert_eq!(closed.status, CaseStatus::Closed);
    assert!(closed.closed_at_epoch_ms.is_some());

    let assignments = store
        .assignments_for_case(&case.case_id)
        .await
        .expect("assignments should load");
    assert!(
        assignments
            .iter()
            .all(|a| a.status == AssignmentStatus::Completed),
        "close completes the active assignment"
    );

    store.close().await;
    drop_schema(&admin_pool, &schema).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn superseded_operator_dispatch_does_not_spend_a_slot() {
    let Some(db_url) = test_db_url() else {
        eprintln!("skipping DB dispatch test; set LEXLEAD_TEST_DB_URL to enable");
        return;
    };

    let (admin_pool, schema, store) = fresh_store(&db_url).await;

    for id in ["law-1", "law-9"] {
        store
            .upsert_account(&lawyer_account(id))
            .await
            .expect("lawyer account should upsert");
    }

    let case = store.create_case(draft_case(2)).await.unwrap();
    store.payment_succeeded(&case.case_id).await.unwrap();
    store.payment_confirmed(&case.case_id, "client-1").await.unwrap();

    // law-9 is dispatched manually, then displaced by law-1's purchase.
    store
        .assign_operator(&case.case_id, &Viewer::operator("op-1"), "law-9", None)
        .await
        .expect("operator assign should succeed");
    let first = store
        .purchase(&case.case_id, "law-1")
        .await
        .expect("purchase past a dispatch should succeed");
    assert_eq!(first.case.purchases_made, 1);

    // law-9 never bought anything, so the completed dispatch must not
    // read as a spent slot.
    let second = store
        .purchase(&case.case_id, "law-9")
        .await
        .expect("previously dispatched lawyer may buy in");
    assert!(!second.already_assigned);
    assert_eq!(second.assignment.origin, AssignmentOrigin::Purchase);
    assert_eq!(second.case.purchases_made, 2);
    assert_eq!(second.case.status, CaseStatus::Exhausted);

    store.close().await;
    drop_schema(&admin_pool, &schema).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn intake_with_account_links_owner_on_the_draft() {
    let Some(db_url) = test_db_url() else {
        eprintln!("skipping DB intake-owner test; set LEXLEAD_TEST_DB_URL to enable");
        return;
    };

    let (admin_pool, schema, store) = fresh_store(&db_url).await;

    let mut nc = draft_case(2);
    nc.owner_id = Some("client-7".to_string());
    let case = store.create_case(nc).await.expect("owned draft should insert");
    assert_eq!(case.status, CaseStatus::Draft);
    assert_eq!(case.owner_id.as_deref(), Some("client-7"));

    // The owning account was created alongside the draft.
    let grant = store
        .account_grant("client-7")
        .await
        .expect("grant lookup should succeed")
        .expect("owner account should exist");
    assert_eq!(grant.role, Role::Client);

    // Confirmation keeps the same owner and does not disturb the role.
    store.payment_succeeded(&case.case_id).await.unwrap();
    let confirmed = store
        .payment_confirmed(&case.case_id, "client-7")
        .await
        .expect("payment confirmation should apply");
    assert_eq!(confirmed.owner_id.as_deref(), Some("client-7"));

    store.close().await;
    drop_schema(&admin_pool, &schema).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_purchase_burst_respects_slot_limit() {
    let Some(db_url) = test_db_url() else {
        eprintln!("skipping DB concurrency test; set LEXLEAD_TEST_DB_URL to enable");
        return;
    };

    let (admin_pool, schema, store) = fresh_store(&db_url).await;

    let lawyer_ids: Vec<String> = (0..6).map(|i| format!("law-{i}")).collect();
    for id in &lawyer_ids {
        store
            .upsert_account(&lawyer_account(id))
            .await
            .expect("lawyer account should upsert");
    }

    let case = store
        .create_case(draft_case(2))
        .await
        .expect("case create should succeed");
    store
        .payment_succeeded(&case.case_id)
        .await
        .expect("payment success hook should apply");
    store
        .payment_confirmed(&case.case_id, "client-1")
        .await
        .expect("payment confirmation should apply");

    let mut handles = Vec::new();
    for lawyer_id in lawyer_ids.clone() {
        let store = store.clone();
        let case_id = case.case_id.clone();
        handles.push(tokio::spawn(async move {
            store.purchase(&case_id, &lawyer_id).await
        }));
    }

    let mut granted = 0usize;
    let mut exhausted = 0usize;
    for handle in handles {
        match handle.await.expect("purchase task should not panic") {
            Ok(receipt) => {
                assert!(!receipt.already_assigned);
                granted += 1;
            }
            Err(OpError::Domain(CoreError::SlotExhausted)) => exhausted += 1,
            Err(other) => panic!("unexpected purchase outcome: {other:?}"),
        }
    }
    assert_eq!(granted, 2, "exactly purchase_limit lawyers win");
    assert_eq!(exhausted, 4);

    let case = store
        .get_case(&case.case_id)
        .await
        .expect("case should load")
        .expect("case should exist");
    assert_eq!(case.purchases_made, 2);
    assert_eq!(case.status, CaseStatus::Exhausted);

    let assignments = store
        .assignments_for_case(&case.case_id)
        .await
        .expect("assignments should load");
    assert_eq!(assignments.len(), 2);
    assert_eq!(
        assignments.iter().filter(|a| a.is_active()).count(),
        1,
        "supersession keeps one active assignment"
    );

    store.close().await;
    drop_schema(&admin_pool, &schema).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn lawyer_listing_orders_by_lead_tier_and_keeps_purchases_visible() {
    let Some(db_url) = test_db_url() else {
        eprintln!("skipping DB listing test; set LEXLEAD_TEST_DB_URL to enable");
        return;
    };

    let (admin_pool, schema, store) = fresh_store(&db_url).await;

    store
        .upsert_account(&lawyer_account("law-1"))
        .await
        .expect("lawyer account should upsert");

    let mut make = |tier: LeadTier, limit: i32| {
        let mut nc = draft_case(limit);
        nc.lead_tier = tier;
        nc
    };

    let standard = store.create_case(make(LeadTier::Standard, 1)).await.unwrap();
    let urgent = store.create_case(make(LeadTier::Urgent, 3)).await.unwrap();
    let premium = store.create_case(make(LeadTier::Premium, 3)).await.unwrap();

    for c in [&standard, &urgent, &premium] {
        store.payment_succeeded(&c.case_id).await.unwrap();
        store.payment_confirmed(&c.case_id, "client-1").await.unwrap();
    }

    // Filling the only slot takes the standard case off the market; the
    // purchaser still sees it in their listing.
    store.purchase(&standard.case_id, "law-1").await.unwrap();

    let viewer = Viewer::lawyer("law-1");
    let listed = store
        .list_cases_for_viewer(&viewer)
        .await
        .expect("listing should succeed");
    let ids: Vec<&str> = listed.iter().map(|c| c.case.case_id.as_str()).collect();
    assert_eq!(
        ids,
        vec![
            urgent.case_id.as_str(),
            premium.case_id.as_str(),
            standard.case_id.as_str()
        ],
        "urgent before premium before standard"
    );

    let stranger = Viewer::lawyer("law-9");
    let listed = store
        .list_cases_for_viewer(&stranger)
        .await
        .expect("listing should succeed");
    let ids: Vec<&str> = listed.iter().map(|c| c.case.case_id.as_str()).collect();
    assert!(
        !ids.contains(&standard.case_id.as_str()),
        "exhausted case hidden from non-purchasers"
    );

    store.close().await;
    drop_schema(&admin_pool, &schema).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn document_soft_delete_hides_record_and_returns_storage_path() {
    let Some(db_url) = test_db_url() else {
        eprintln!("skipping DB document test; set LEXLEAD_TEST_DB_URL to enable");
        return;
    };

    let (admin_pool, schema, store) = fresh_store(&db_url).await;

    let case = store.create_case(draft_case(1)).await.unwrap();

    let doc = store
        .insert_document(
            DocumentKind::Client,
            &case.case_id,
            "client-1",
            "contract.pdf",
            "client/contract.pdf",
        )
        .await
        .expect("document insert should succeed");

    let listed = store
        .list_documents(&case.case_id, DocumentKind::Client)
        .await
        .expect("listing should succeed");
    assert_eq!(listed.len(), 1);

    let path = store
        .soft_delete_document(DocumentKind::Client, &doc.document_id)
        .await
        .expect("soft delete should succeed");
    assert_eq!(path, "client/contract.pdf");

    let listed = store
        .list_documents(&case.case_id, DocumentKind::Client)
        .await
        .expect("listing should succeed");
    assert!(listed.is_empty(), "deleted documents never appear in listings");

    let fetched = store
        .get_document(DocumentKind::Client, &doc.document_id)
        .await
        .expect("lookup should succeed")
        .expect("record row survives soft delete");
    assert!(fetched.is_deleted());

    // A second delete finds nothing live.
    let err = store
        .soft_delete_document(DocumentKind::Client, &doc.document_id)
        .await
        .expect_err("double delete must fail");
    assert!(matches!(err, OpError::Domain(CoreError::NotFound)));

    // Dangling case reference maps to NotFound, not a raw SQL error.
    let err = store
        .insert_document(
            DocumentKind::Resolution,
            "no-such-case",
            "law-1",
            "resolution.pdf",
            "resolution/resolution.pdf",
        )
        .await
        .expect_err("insert against missing case must fail");
    assert!(matches!(err, OpError::Domain(CoreError::NotFound)));

    store.close().await;
    drop_schema(&admin_pool, &schema).await;
}
