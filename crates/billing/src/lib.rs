//! MemberSync billing reconciliation engine
//!
//! Pulls each linked customer's most recent subscription from the billing
//! provider and applies idempotent, diff-based updates to local account and
//! profile records. Runs as a chunked, resumable batch with bounded
//! retry-with-backoff on rate limiting.

pub mod client;
pub mod coordinator;
pub mod error;
pub mod reconciler;
pub mod stores;
pub mod subscription_map;
pub mod testing;

pub use client::{ChargebeeClient, ChargebeeConfig};
pub use coordinator::{BatchCoordinator, BatchOptions, BatchProgress, BatchResult};
pub use error::{SyncError, SyncResult};
pub use reconciler::{AccountReconciler, ReconcileOptions, ReconcileOutcome};
pub use stores::{
    AccountStore, MessageLevel, MessageSink, PlanAttributes, PlanManager, ProfileStore,
    SubscriptionApi, SubscriptionPage,
};
pub use subscription_map::{SubscriptionMap, SubscriptionMapBuilder};
