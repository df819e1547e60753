//! In-memory fakes for the collaborator traits
//!
//! Shared by unit tests and the integration suite. Compiled into the crate
//! so integration tests under `tests/` can use them too.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use uuid::Uuid;

use membersync_shared::{Account, PlanTerm, Profile, SubscriptionRecord, SubscriptionStatus};

use crate::error::{SyncError, SyncResult};
use crate::stores::{
    AccountStore, MessageLevel, MessageSink, PlanAttributes, PlanManager, ProfileStore,
    SubscriptionApi, SubscriptionPage,
};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Build a subscription record with sensible defaults for tests
pub fn record(
    customer_id: &str,
    status: SubscriptionStatus,
    plan_id: Option<&str>,
) -> SubscriptionRecord {
    SubscriptionRecord {
        customer_id: customer_id.to_string(),
        status,
        plan_amount_cents: plan_id.map(|_| 2900),
        plan_id: plan_id.map(str::to_string),
        currency_code: Some("EUR".to_string()),
        cancelled_at: None,
    }
}

// =============================================================================
// FakeSubscriptionApi
// =============================================================================

/// Scripted subscription feed: bulk pages are served in order, single-customer
/// lookups come from a keyed map.
#[derive(Default)]
pub struct FakeSubscriptionApi {
    pages: Mutex<VecDeque<SyncResult<SubscriptionPage>>>,
    singles: Mutex<HashMap<String, SubscriptionRecord>>,
    page_calls: AtomicUsize,
}

impl FakeSubscriptionApi {
    pub fn with_pages(pages: Vec<SyncResult<SubscriptionPage>>) -> Self {
        Self {
            pages: Mutex::new(pages.into()),
            ..Self::default()
        }
    }

    pub fn set_single(&self, customer_id: &str, record: SubscriptionRecord) {
        lock(&self.singles).insert(customer_id.to_string(), record);
    }

    /// Number of bulk page fetches issued
    pub fn calls(&self) -> usize {
        self.page_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SubscriptionApi for FakeSubscriptionApi {
    async fn fetch_page(
        &self,
        _customer_ids: &[String],
        _offset: Option<&str>,
    ) -> SyncResult<SubscriptionPage> {
        self.page_calls.fetch_add(1, Ordering::SeqCst);
        lock(&self.pages)
            .pop_front()
            .unwrap_or_else(|| {
                Err(SyncError::RequestFailed {
                    status: 0,
                    message: "no scripted page left".to_string(),
                })
            })
    }

    async fn fetch_latest_for_customer(
        &self,
        customer_id: &str,
    ) -> SyncResult<Option<SubscriptionRecord>> {
        Ok(lock(&self.singles).get(customer_id).cloned())
    }
}

// =============================================================================
// RecordingSink
// =============================================================================

/// Message sink that records everything for assertions
#[derive(Default)]
pub struct RecordingSink {
    messages: Mutex<Vec<(MessageLevel, String)>>,
}

impl RecordingSink {
    pub fn messages(&self) -> Vec<(MessageLevel, String)> {
        lock(&self.messages).clone()
    }

    pub fn has_message_at(&self, level: MessageLevel) -> bool {
        lock(&self.messages).iter().any(|(l, _)| *l == level)
    }

    pub fn has_message_containing(&self, level: MessageLevel, needle: &str) -> bool {
        lock(&self.messages)
            .iter()
            .any(|(l, m)| *l == level && m.contains(needle))
    }
}

impl MessageSink for RecordingSink {
    fn emit(&self, level: MessageLevel, message: &str) {
        lock(&self.messages).push((level, message.to_string()));
    }
}

// =============================================================================
// InMemoryAccountStore
// =============================================================================

#[derive(Default)]
pub struct InMemoryAccountStore {
    accounts: Mutex<HashMap<i64, Account>>,
    saves: Mutex<Vec<(i64, Option<String>)>>,
    fail_saves: Mutex<bool>,
}

impl InMemoryAccountStore {
    pub fn with_accounts(accounts: Vec<Account>) -> Self {
        let map = accounts.into_iter().map(|a| (a.uid, a)).collect();
        Self {
            accounts: Mutex::new(map),
            ..Self::default()
        }
    }

    /// Make every subsequent save fail with a database error
    pub fn fail_next_saves(&self) {
        *lock(&self.fail_saves) = true;
    }

    pub fn get(&self, uid: i64) -> Option<Account> {
        lock(&self.accounts).get(&uid).cloned()
    }

    /// Saves recorded as (uid, revision message)
    pub fn saves(&self) -> Vec<(i64, Option<String>)> {
        lock(&self.saves).clone()
    }
}

#[async_trait]
impl AccountStore for InMemoryAccountStore {
    async fn load(&self, uid: i64) -> SyncResult<Option<Account>> {
        Ok(lock(&self.accounts).get(&uid).cloned())
    }

    async fn list_linked_uids(&self, start_uid: Option<i64>) -> SyncResult<Vec<i64>> {
        let mut uids: Vec<i64> = lock(&self.accounts)
            .values()
            .filter(|a| a.chargebee_customer_id.is_some())
            .filter(|a| start_uid.map_or(true, |floor| a.uid >= floor))
            .map(|a| a.uid)
            .collect();
        uids.sort_unstable();
        Ok(uids)
    }

    async fn save(&self, account: &Account, revision: Option<&str>) -> SyncResult<()> {
        if *lock(&self.fail_saves) {
            return Err(SyncError::Database("simulated save failure".to_string()));
        }
        lock(&self.accounts).insert(account.uid, account.clone());
        lock(&self.saves)
            .push((account.uid, revision.map(str::to_string)));
        Ok(())
    }
}

// =============================================================================
// InMemoryProfileStore
// =============================================================================

#[derive(Default)]
pub struct InMemoryProfileStore {
    profiles: Mutex<HashMap<i64, Profile>>,
    saves: Mutex<Vec<(Uuid, Option<String>)>>,
    fail_saves: Mutex<bool>,
}

impl InMemoryProfileStore {
    pub fn with_profiles(profiles: Vec<Profile>) -> Self {
        let map = profiles.into_iter().map(|p| (p.uid, p)).collect();
        Self {
            profiles: Mutex::new(map),
            ..Self::default()
        }
    }

    pub fn fail_next_saves(&self) {
        *lock(&self.fail_saves) = true;
    }

    pub fn get(&self, uid: i64) -> Option<Profile> {
        lock(&self.profiles).get(&uid).cloned()
    }

    pub fn saves(&self) -> Vec<(Uuid, Option<String>)> {
        lock(&self.saves).clone()
    }
}

#[async_trait]
impl ProfileStore for InMemoryProfileStore {
    async fn find_main(&self, uid: i64) -> SyncResult<Option<Profile>> {
        Ok(lock(&self.profiles).get(&uid).cloned())
    }

    async fn save(&self, profile: &Profile, revision: Option<&str>) -> SyncResult<()> {
        if *lock(&self.fail_saves) {
            return Err(SyncError::Database("simulated save failure".to_string()));
        }
        lock(&self.profiles).insert(profile.uid, profile.clone());
        lock(&self.saves)
            .push((profile.id, revision.map(str::to_string)));
        Ok(())
    }
}

// =============================================================================
// InMemoryPlanManager
// =============================================================================

/// Plan-term upserts keyed by plan id; membership types can be pre-seeded
/// per plan to exercise the classification branch.
#[derive(Default)]
pub struct InMemoryPlanManager {
    terms: Mutex<HashMap<String, PlanTerm>>,
    membership_types: Mutex<HashMap<String, Uuid>>,
    upserts: AtomicUsize,
}

impl InMemoryPlanManager {
    pub fn seed_membership_type(&self, plan_id: &str, membership_type: Uuid) {
        lock(&self.membership_types).insert(plan_id.to_string(), membership_type);
    }

    pub fn term(&self, plan_id: &str) -> Option<PlanTerm> {
        lock(&self.terms).get(plan_id).cloned()
    }

    pub fn upserts(&self) -> usize {
        self.upserts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PlanManager for InMemoryPlanManager {
    async fn upsert_plan(&self, plan_id: &str, attrs: PlanAttributes) -> SyncResult<PlanTerm> {
        self.upserts.fetch_add(1, Ordering::SeqCst);
        let membership_type = lock(&self.membership_types).get(plan_id).copied();
        let mut terms = lock(&self.terms);
        let term = terms
            .entry(plan_id.to_string())
            .or_insert_with(|| PlanTerm {
                id: Uuid::new_v4(),
                plan_id: plan_id.to_string(),
                amount: attrs.amount,
                currency: attrs.currency.clone(),
                provider: attrs.provider.clone(),
                membership_type,
            });
        term.amount = attrs.amount;
        term.currency = attrs.currency;
        term.provider = attrs.provider;
        term.membership_type = membership_type;
        Ok(term.clone())
    }
}
