//! Injected collaborator interfaces
//!
//! The sync engine never reaches for ambient services: the billing API, the
//! account/profile stores, the plan manager and the operator message sink
//! are all passed in as trait objects. Tests swap in in-memory fakes.

use async_trait::async_trait;

use membersync_shared::{Account, PlanTerm, Profile, SubscriptionRecord};

use crate::error::SyncResult;

/// One page of the provider's subscription list feed
#[derive(Debug, Clone, Default)]
pub struct SubscriptionPage {
    pub entries: Vec<SubscriptionRecord>,
    /// Pagination cursor echoed back by the provider; absent on the last page
    pub next_offset: Option<String>,
}

/// Access to the billing provider's subscription list API
#[async_trait]
pub trait SubscriptionApi: Send + Sync {
    /// Fetch one page of subscriptions for the given customer ids, sorted by
    /// update time descending. Retry/backoff for rate limiting is owned by
    /// the implementation; a returned error means the page was abandoned.
    async fn fetch_page(
        &self,
        customer_ids: &[String],
        offset: Option<&str>,
    ) -> SyncResult<SubscriptionPage>;

    /// Legacy single-customer path: the customer's most recent active
    /// subscription, if any. Used for single-account test runs.
    async fn fetch_latest_for_customer(
        &self,
        customer_id: &str,
    ) -> SyncResult<Option<SubscriptionRecord>>;
}

/// Account persistence (load by uid, field-set + save)
#[async_trait]
pub trait AccountStore: Send + Sync {
    async fn load(&self, uid: i64) -> SyncResult<Option<Account>>;

    /// Ordered uids of accounts linked to a billing customer, optionally
    /// bounded below by a start uid (resume floor)
    async fn list_linked_uids(&self, start_uid: Option<i64>) -> SyncResult<Vec<i64>>;

    /// Persist a mutated account. When `revision` is given, a new revision
    /// is created carrying the human-readable changed-fields summary.
    async fn save(&self, account: &Account, revision: Option<&str>) -> SyncResult<()>;
}

/// Profile persistence (main profile lookup by uid + type filter)
#[async_trait]
pub trait ProfileStore: Send + Sync {
    async fn find_main(&self, uid: i64) -> SyncResult<Option<Profile>>;

    async fn save(&self, profile: &Profile, revision: Option<&str>) -> SyncResult<()>;
}

/// Attributes applied when upserting a plan term
#[derive(Debug, Clone)]
pub struct PlanAttributes {
    pub amount: f64,
    pub currency: Option<String>,
    pub provider: String,
}

/// Plan-term taxonomy management. Read-modify of the classification is owned
/// by the implementation; the engine only upserts and reads the result.
#[async_trait]
pub trait PlanManager: Send + Sync {
    /// Create the plan term if absent, update its attributes otherwise,
    /// and return the resulting term.
    async fn upsert_plan(&self, plan_id: &str, attrs: PlanAttributes) -> SyncResult<PlanTerm>;
}

/// Operator-facing message level
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageLevel {
    Status,
    Warning,
    Error,
}

/// Sink for leveled run messages (status stream or log)
pub trait MessageSink: Send + Sync {
    fn emit(&self, level: MessageLevel, message: &str);

    fn status(&self, message: &str) {
        self.emit(MessageLevel::Status, message);
    }

    fn warning(&self, message: &str) {
        self.emit(MessageLevel::Warning, message);
    }

    fn error(&self, message: &str) {
        self.emit(MessageLevel::Error, message);
    }
}
