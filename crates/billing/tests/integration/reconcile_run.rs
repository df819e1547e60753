//! End-to-end batch reconciliation runs against in-memory collaborators
//!
//! Drives the full BatchCoordinator pipeline: chunk resolution, one bulk
//! subscription fetch per chunk, per-account reconciliation and progress
//! reporting. The provider is a scripted fake feed; the stores are
//! in-memory fakes from `membersync_billing::testing`.

#![allow(clippy::unwrap_used)]

use std::sync::Arc;

use membersync_billing::testing::{
    record, FakeSubscriptionApi, InMemoryAccountStore, InMemoryPlanManager, InMemoryProfileStore,
    RecordingSink,
};
use membersync_billing::{
    BatchCoordinator, BatchOptions, MessageLevel, SubscriptionPage, SyncError,
};
use membersync_shared::{Account, Profile, SubscriptionStatus};
use uuid::Uuid;

// ============================================================================
// Test Utilities
// ============================================================================

fn account(uid: i64, customer_id: &str) -> Account {
    Account {
        uid,
        chargebee_customer_id: Some(customer_id.to_string()),
        chargebee_plan_id: None,
        member_payment_monthly: None,
        roles: vec!["authenticated".to_string()],
    }
}

fn profile(uid: i64) -> Profile {
    Profile {
        id: Uuid::new_v4(),
        uid,
        profile_type: "main".to_string(),
        member_payment_monthly: None,
        membership_type: None,
        member_end_date: None,
    }
}

fn page(
    entries: Vec<membersync_shared::SubscriptionRecord>,
    next_offset: Option<&str>,
) -> SubscriptionPage {
    SubscriptionPage {
        entries,
        next_offset: next_offset.map(str::to_string),
    }
}

struct Harness {
    api: Arc<FakeSubscriptionApi>,
    accounts: Arc<InMemoryAccountStore>,
    profiles: Arc<InMemoryProfileStore>,
    plans: Arc<InMemoryPlanManager>,
    sink: Arc<RecordingSink>,
    coordinator: BatchCoordinator,
}

fn harness(
    api: FakeSubscriptionApi,
    accounts: Vec<Account>,
    profiles: Vec<Profile>,
) -> Harness {
    let api = Arc::new(api);
    let accounts = Arc::new(InMemoryAccountStore::with_accounts(accounts));
    let profiles = Arc::new(InMemoryProfileStore::with_profiles(profiles));
    let plans = Arc::new(InMemoryPlanManager::default());
    let sink = Arc::new(RecordingSink::default());

    let coordinator = BatchCoordinator::new(
        api.clone(),
        accounts.clone(),
        profiles.clone(),
        Some(plans.clone()),
        sink.clone(),
    );

    Harness {
        api,
        accounts,
        profiles,
        plans,
        sink,
        coordinator,
    }
}

fn options() -> BatchOptions {
    BatchOptions {
        member_role: Some("member".to_string()),
        ..BatchOptions::default()
    }
}

// ============================================================================
// Scenarios
// ============================================================================

/// Two accounts; cust_1's feed spans two pages with the most recent record
/// (plan_new) on page 1 and a stale one (plan_old) on page 2. The batch must
/// keep plan_new for cust_1 and plan_2 for cust_2.
#[tokio::test]
async fn test_two_account_batch_with_paginated_feed() {
    let api = FakeSubscriptionApi::with_pages(vec![
        Ok(page(
            vec![record("cust_1", SubscriptionStatus::Active, Some("plan_new"))],
            Some("p2"),
        )),
        Ok(page(
            vec![
                record("cust_1", SubscriptionStatus::Cancelled, Some("plan_old")),
                record("cust_2", SubscriptionStatus::Active, Some("plan_2")),
            ],
            None,
        )),
    ]);
    let h = harness(
        api,
        vec![account(1, "cust_1"), account(2, "cust_2")],
        vec![profile(1), profile(2)],
    );

    let result = h.coordinator.run(&[1, 2], &options()).await;

    assert!(result.success);
    assert_eq!(
        h.accounts.get(1).unwrap().chargebee_plan_id.as_deref(),
        Some("plan_new")
    );
    assert_eq!(
        h.accounts.get(2).unwrap().chargebee_plan_id.as_deref(),
        Some("plan_2")
    );
    // One bulk fetch per page, single chunk
    assert_eq!(h.api.calls(), 2);
    // Both plans upserted
    assert!(h.plans.term("plan_new").is_some());
    assert!(h.plans.term("plan_2").is_some());
}

/// A 500 from the provider abandons the chunk's pagination; accounts without
/// a fetched subscription are skipped with warnings and the run still
/// reports overall success.
#[tokio::test]
async fn test_server_error_keeps_run_successful() {
    let api = FakeSubscriptionApi::with_pages(vec![Err(SyncError::RequestFailed {
        status: 500,
        message: "internal server error".to_string(),
    })]);
    let h = harness(api, vec![account(1, "cust_1")], vec![profile(1)]);

    let result = h.coordinator.run(&[1], &options()).await;

    assert!(result.success);
    // The account was skipped with a warning, nothing was written
    assert!(h.accounts.get(1).unwrap().chargebee_plan_id.is_none());
    assert!(h.accounts.saves().is_empty());
    assert!(h
        .sink
        .has_message_containing(MessageLevel::Warning, "No subscription found"));
}

/// Stored customer ids are normalized before any API use: the `was ` marker
/// and trailing ` -- ...` comment are stripped, and the map lookup happens
/// under the normalized id.
#[tokio::test]
async fn test_annotated_customer_id_is_normalized() {
    let api = FakeSubscriptionApi::with_pages(vec![Ok(page(
        vec![record("cust_123", SubscriptionStatus::Active, Some("plan_x"))],
        None,
    ))]);
    let h = harness(
        api,
        vec![account(5, "was cust_123 -- moved to new account")],
        vec![profile(5)],
    );

    let result = h.coordinator.run(&[5], &options()).await;

    assert!(result.success);
    assert_eq!(
        h.accounts.get(5).unwrap().chargebee_plan_id.as_deref(),
        Some("plan_x")
    );
}

/// Accounts without any usable customer id are skipped with a warning and
/// still counted in progress.
#[tokio::test]
async fn test_account_without_customer_id_is_skipped() {
    let api = FakeSubscriptionApi::with_pages(vec![Ok(page(
        vec![record("cust_2", SubscriptionStatus::Active, Some("plan_2"))],
        None,
    ))]);
    let mut orphan = account(9, "ignored");
    orphan.chargebee_customer_id = Some("was  -- gone".to_string());
    let h = harness(
        api,
        vec![orphan, account(2, "cust_2")],
        vec![profile(2)],
    );

    let result = h.coordinator.run(&[9, 2], &options()).await;

    assert!(result.success);
    assert!(h
        .sink
        .has_message_containing(MessageLevel::Warning, "no Chargebee customer id"));
    assert!(h
        .sink
        .has_message_containing(MessageLevel::Status, "Processed 2 of 2 accounts"));
}

/// Chunking: with chunk_size 1 and two accounts, each chunk issues its own
/// bulk fetch and progress carries across chunk boundaries.
#[tokio::test]
async fn test_chunks_fetch_independently() {
    let api = FakeSubscriptionApi::with_pages(vec![
        Ok(page(
            vec![record("cust_1", SubscriptionStatus::Active, Some("plan_1"))],
            None,
        )),
        Ok(page(
            vec![record("cust_2", SubscriptionStatus::Active, Some("plan_2"))],
            None,
        )),
    ]);
    let h = harness(
        api,
        vec![account(1, "cust_1"), account(2, "cust_2")],
        vec![profile(1), profile(2)],
    );

    let result = h
        .coordinator
        .run(
            &[1, 2],
            &BatchOptions {
                chunk_size: 1,
                ..options()
            },
        )
        .await;

    assert!(result.success);
    assert_eq!(h.api.calls(), 2);
    assert_eq!(
        h.accounts.get(2).unwrap().chargebee_plan_id.as_deref(),
        Some("plan_2")
    );
}

/// A cancelled subscription flows end-to-end into the profile end date and
/// the member role removal.
#[tokio::test]
async fn test_cancellation_end_to_end() {
    let mut cancelled = record("cust_1", SubscriptionStatus::Cancelled, None);
    cancelled.plan_amount_cents = None;
    cancelled.cancelled_at = Some(1_710_460_800); // 2024-03-15T00:00:00Z

    let api = FakeSubscriptionApi::with_pages(vec![Ok(page(vec![cancelled], None))]);
    let mut acct = account(1, "cust_1");
    acct.roles.push("member".to_string());
    let h = harness(api, vec![acct], vec![profile(1)]);

    let result = h.coordinator.run(&[1], &options()).await;

    assert!(result.success);
    let prof = h.profiles.get(1).unwrap();
    assert_eq!(prof.member_end_date.unwrap().to_string(), "2024-03-15");
    assert!(!h.accounts.get(1).unwrap().has_role("member"));
}

/// The legacy single-account test run uses the single-customer fetch path
/// but applies the same reconcile semantics as the bulk path.
#[tokio::test]
async fn test_single_account_run_uses_single_fetch() {
    let api = FakeSubscriptionApi::default();
    api.set_single(
        "cust_1",
        record("cust_1", SubscriptionStatus::Active, Some("plan_solo")),
    );
    let h = harness(api, vec![account(1, "cust_1")], vec![profile(1)]);

    let result = h.coordinator.run_single(1, &options()).await;

    assert!(result.success);
    assert_eq!(h.api.calls(), 0); // no bulk fetch on the single path
    assert_eq!(
        h.accounts.get(1).unwrap().chargebee_plan_id.as_deref(),
        Some("plan_solo")
    );
    assert_eq!(
        h.profiles.get(1).unwrap().member_payment_monthly,
        Some(29.0)
    );
}

/// Revisions carry the changed-field summary when requested.
#[tokio::test]
async fn test_revision_summary_recorded_on_save() {
    let api = FakeSubscriptionApi::with_pages(vec![Ok(page(
        vec![record("cust_1", SubscriptionStatus::Active, Some("plan_1"))],
        None,
    ))]);
    let h = harness(api, vec![account(1, "cust_1")], vec![profile(1)]);

    let result = h
        .coordinator
        .run(
            &[1],
            &BatchOptions {
                create_revision: true,
                ..options()
            },
        )
        .await;

    assert!(result.success);
    let saves = h.accounts.saves();
    assert_eq!(saves.len(), 1);
    let revision = saves[0].1.as_deref().unwrap();
    assert!(revision.starts_with("Chargebee sync: updated"));
    assert!(revision.contains("chargebee_plan_id"));
}

/// A profile save failure is reported but never blocks the rest of the
/// batch or flips the terminal status.
#[tokio::test]
async fn test_profile_save_failure_is_isolated() {
    let api = FakeSubscriptionApi::with_pages(vec![Ok(page(
        vec![
            record("cust_1", SubscriptionStatus::Active, Some("plan_1")),
            record("cust_2", SubscriptionStatus::Active, Some("plan_2")),
        ],
        None,
    ))]);
    let h = harness(
        api,
        vec![account(1, "cust_1"), account(2, "cust_2")],
        vec![profile(1), profile(2)],
    );
    h.profiles.fail_next_saves();

    let result = h.coordinator.run(&[1, 2], &options()).await;

    assert!(result.success);
    assert!(h.sink.has_message_at(MessageLevel::Error));
    // Account saves still happened for both accounts
    assert_eq!(h.accounts.saves().len(), 2);
}
