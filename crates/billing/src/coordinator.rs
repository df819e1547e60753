//! Chunked batch driver
//!
//! Splits the account id set into fixed-size chunks, builds one subscription
//! map per chunk, reconciles each account sequentially and reports progress
//! after every account. Control returns to the host after each chunk with an
//! explicit progress value, so a host scheduler can persist and resume
//! between chunks.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use membersync_shared::{Account, FieldCaps};

use crate::error::{SyncError, SyncResult};
use crate::reconciler::{AccountReconciler, ReconcileOptions};
use crate::stores::{AccountStore, MessageSink, PlanManager, ProfileStore, SubscriptionApi};
use crate::subscription_map::SubscriptionMapBuilder;

/// Default number of accounts per chunk (one bulk fetch each)
pub const DEFAULT_CHUNK_SIZE: usize = 50;

/// Options for a batch run
#[derive(Debug, Clone)]
pub struct BatchOptions {
    pub chunk_size: usize,
    /// Fixed pause after each account, throttling outbound request rate
    pub delay_per_account: Duration,
    pub detailed: bool,
    pub create_revision: bool,
    pub member_role: Option<String>,
    pub caps: FieldCaps,
}

impl Default for BatchOptions {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            delay_per_account: Duration::ZERO,
            detailed: false,
            create_revision: false,
            member_role: None,
            caps: FieldCaps::default(),
        }
    }
}

/// Progress state threaded through chunk calls. Serializable so a host can
/// persist it and resume at the next chunk boundary.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchProgress {
    pub processed: usize,
    pub total: usize,
    /// Accounts where at least one field was mutated
    pub changed: usize,
    pub chunks_done: usize,
    pub chunks_total: usize,
}

impl BatchProgress {
    pub fn new(total: usize, chunks_total: usize) -> Self {
        Self {
            total,
            chunks_total,
            ..Self::default()
        }
    }
}

/// Terminal outcome of a run. Per-account errors are reported through the
/// message sink only; `success` reflects solely whether a required
/// collaborator was available.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchResult {
    pub success: bool,
}

/// Drives the whole reconciliation batch
pub struct BatchCoordinator {
    api: Arc<dyn SubscriptionApi>,
    accounts: Arc<dyn AccountStore>,
    profiles: Arc<dyn ProfileStore>,
    plans: Option<Arc<dyn PlanManager>>,
    sink: Arc<dyn MessageSink>,
}

impl BatchCoordinator {
    pub fn new(
        api: Arc<dyn SubscriptionApi>,
        accounts: Arc<dyn AccountStore>,
        profiles: Arc<dyn ProfileStore>,
        plans: Option<Arc<dyn PlanManager>>,
        sink: Arc<dyn MessageSink>,
    ) -> Self {
        Self {
            api,
            accounts,
            profiles,
            plans,
            sink,
        }
    }

    /// Run the batch over the given ordered account ids.
    pub async fn run(&self, account_ids: &[i64], options: &BatchOptions) -> BatchResult {
        let chunk_size = options.chunk_size.max(1);
        let total = account_ids.len();
        let chunks_total = total.div_ceil(chunk_size);
        let mut progress = BatchProgress::new(total, chunks_total);

        self.sink.status(&format!(
            "Reconciling {total} accounts in {chunks_total} chunks"
        ));

        for chunk in account_ids.chunks(chunk_size) {
            progress = match self.run_chunk(chunk, progress, options).await {
                Ok(progress) => progress,
                Err(err) => {
                    self.sink.error(&format!("Aborting run: {err}"));
                    tracing::error!(error = %err, "Batch run aborted");
                    return BatchResult { success: false };
                }
            };
        }

        self.sink.status(&format!(
            "Reconciliation finished: {} of {} accounts processed, {} changed",
            progress.processed, progress.total, progress.changed
        ));

        BatchResult { success: true }
    }

    /// Process one chunk: resolve accounts, build the subscription map with
    /// a single bulk fetch, then reconcile each account.
    ///
    /// Only a missing required collaborator is fatal; everything else is
    /// reported through the sink and processing continues.
    pub async fn run_chunk(
        &self,
        chunk: &[i64],
        mut progress: BatchProgress,
        options: &BatchOptions,
    ) -> SyncResult<BatchProgress> {
        let plans = self.require_plan_manager()?;

        let mut accounts: Vec<Account> = Vec::with_capacity(chunk.len());
        for &uid in chunk {
            match self.accounts.load(uid).await {
                Ok(Some(account)) => accounts.push(account),
                Ok(None) => {
                    self.sink.warning(&format!("Account {uid} not found"));
                    self.advance(&mut progress);
                }
                Err(err) => {
                    self.sink
                        .error(&format!("Failed to load account {uid}: {err}"));
                    self.advance(&mut progress);
                }
            }
        }

        // Resolvable customer ids for the whole chunk, deduplicated
        let mut customer_ids: Vec<String> = Vec::with_capacity(accounts.len());
        for account in &accounts {
            if let Some(cid) = account.customer_id() {
                if !customer_ids.contains(&cid) {
                    customer_ids.push(cid);
                }
            }
        }

        let map = SubscriptionMapBuilder::new(self.api.clone(), self.sink.clone())
            .build(&customer_ids)
            .await;

        let reconciler = AccountReconciler::new(
            self.accounts.clone(),
            self.profiles.clone(),
            plans,
            self.sink.clone(),
        );
        let reconcile_options = self.reconcile_options(options);

        for mut account in accounts {
            let uid = account.uid;

            let Some(customer_id) = account.customer_id() else {
                self.sink
                    .warning(&SyncError::MissingCustomerId(uid).to_string());
                self.advance(&mut progress);
                continue;
            };

            let mut profile = match self.profiles.find_main(uid).await {
                Ok(profile) => profile,
                Err(err) => {
                    self.sink
                        .error(&format!("Failed to load profile for account {uid}: {err}"));
                    None
                }
            };

            let outcome = reconciler
                .reconcile(
                    &mut account,
                    profile.as_mut(),
                    map.get(&customer_id),
                    &reconcile_options,
                )
                .await;

            if outcome.account_changed || outcome.profile_changed {
                progress.changed += 1;
            }

            if !options.delay_per_account.is_zero() {
                tokio::time::sleep(options.delay_per_account).await;
            }

            self.advance(&mut progress);
        }

        progress.chunks_done += 1;
        Ok(progress)
    }

    /// Legacy single-account test run: one call to the single-customer
    /// endpoint instead of the bulk map, same reconcile semantics.
    pub async fn run_single(&self, uid: i64, options: &BatchOptions) -> BatchResult {
        let plans = match self.require_plan_manager() {
            Ok(plans) => plans,
            Err(err) => {
                self.sink.error(&format!("Aborting run: {err}"));
                return BatchResult { success: false };
            }
        };

        let mut account = match self.accounts.load(uid).await {
            Ok(Some(account)) => account,
            Ok(None) => {
                self.sink.warning(&format!("Account {uid} not found"));
                return BatchResult { success: true };
            }
            Err(err) => {
                self.sink
                    .error(&format!("Failed to load account {uid}: {err}"));
                return BatchResult { success: true };
            }
        };

        let Some(customer_id) = account.customer_id() else {
            self.sink
                .warning(&SyncError::MissingCustomerId(uid).to_string());
            return BatchResult { success: true };
        };

        let subscription = match self.api.fetch_latest_for_customer(&customer_id).await {
            Ok(subscription) => subscription,
            Err(err) => {
                self.sink.error(&format!(
                    "Failed to fetch subscription for customer {customer_id}: {err}"
                ));
                return BatchResult { success: true };
            }
        };

        let mut profile = match self.profiles.find_main(uid).await {
            Ok(profile) => profile,
            Err(err) => {
                self.sink
                    .error(&format!("Failed to load profile for account {uid}: {err}"));
                None
            }
        };

        let reconciler = AccountReconciler::new(
            self.accounts.clone(),
            self.profiles.clone(),
            plans,
            self.sink.clone(),
        );

        reconciler
            .reconcile(
                &mut account,
                profile.as_mut(),
                subscription.as_ref(),
                &self.reconcile_options(options),
            )
            .await;

        self.sink.status(&format!("Processed account {uid}"));
        BatchResult { success: true }
    }

    fn require_plan_manager(&self) -> SyncResult<Arc<dyn PlanManager>> {
        self.plans
            .clone()
            .ok_or(SyncError::MissingCollaborator("plan manager"))
    }

    fn reconcile_options(&self, options: &BatchOptions) -> ReconcileOptions {
        ReconcileOptions {
            member_role: options.member_role.clone(),
            create_revision: options.create_revision,
            detailed: options.detailed,
            caps: options.caps,
        }
    }

    fn advance(&self, progress: &mut BatchProgress) {
        progress.processed += 1;
        self.sink.status(&format!(
            "Processed {} of {} accounts",
            progress.processed, progress.total
        ));
    }
}
