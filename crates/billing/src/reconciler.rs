//! Per-account reconciliation
//!
//! Compares fetched subscription state against the account and its main
//! profile, applies only the field mutations that actually differ, and saves
//! each entity independently. A save failure on one entity never blocks the
//! other, and never aborts the batch.

use std::sync::Arc;

use chrono::{DateTime, NaiveDate};

use membersync_shared::{
    Account, FieldCaps, Profile, SubscriptionRecord, SubscriptionStatus, PROVIDER_CHARGEBEE,
};

use crate::error::SyncError;
use crate::stores::{AccountStore, MessageSink, PlanAttributes, PlanManager, ProfileStore};

/// Monetary comparison tolerance (amounts derive from integer cents)
const AMOUNT_EPSILON: f64 = 0.005;

/// Options controlling a reconciliation pass
#[derive(Debug, Clone, Default)]
pub struct ReconcileOptions {
    /// Role granted to members with an active-like subscription and revoked
    /// on cancellation. Role handling is disabled when unset.
    pub member_role: Option<String>,
    /// Create a revision on every save, summarising the changed fields
    pub create_revision: bool,
    /// Emit a status message per applied field
    pub detailed: bool,
    pub caps: FieldCaps,
}

/// What a reconciliation pass changed
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReconcileOutcome {
    pub account_changed: bool,
    pub profile_changed: bool,
    pub applied_fields: Vec<&'static str>,
}

/// Reconciles one account against its fetched subscription state
pub struct AccountReconciler {
    accounts: Arc<dyn AccountStore>,
    profiles: Arc<dyn ProfileStore>,
    plans: Arc<dyn PlanManager>,
    sink: Arc<dyn MessageSink>,
}

fn amounts_differ(current: Option<f64>, target: f64) -> bool {
    current.map_or(true, |value| (value - target).abs() > AMOUNT_EPSILON)
}

/// UTC calendar date for a unix epoch, day precision
fn end_date_from_epoch(epoch: i64) -> Option<NaiveDate> {
    DateTime::from_timestamp(epoch, 0).map(|dt| dt.date_naive())
}

impl AccountReconciler {
    pub fn new(
        accounts: Arc<dyn AccountStore>,
        profiles: Arc<dyn ProfileStore>,
        plans: Arc<dyn PlanManager>,
        sink: Arc<dyn MessageSink>,
    ) -> Self {
        Self {
            accounts,
            profiles,
            plans,
            sink,
        }
    }

    /// Apply subscription state to the account and profile.
    ///
    /// Mutates the passed entities in place and saves whichever changed.
    /// Issues no write when every observed value already matches the target.
    pub async fn reconcile(
        &self,
        account: &mut Account,
        mut profile: Option<&mut Profile>,
        subscription: Option<&SubscriptionRecord>,
        options: &ReconcileOptions,
    ) -> ReconcileOutcome {
        let uid = account.uid;

        let Some(subscription) = subscription else {
            let customer = account.customer_id().unwrap_or_default();
            let missing = SyncError::NoSubscriptionFound(customer.clone());
            self.sink.warning(&format!("{missing} (account {uid})"));
            tracing::warn!(uid = %uid, customer_id = %customer, "No subscription found");
            return ReconcileOutcome::default();
        };

        let caps = &options.caps;
        let mut account_fields: Vec<&'static str> = Vec::new();
        let mut profile_fields: Vec<&'static str> = Vec::new();

        // Plan/amount branch: only when both plan id and amount are present
        if subscription.has_priced_plan() {
            self.apply_priced_plan(
                account,
                profile.as_deref_mut(),
                subscription,
                options,
                &mut account_fields,
                &mut profile_fields,
            )
            .await;
        }

        if subscription.status.is_active_like() {
            // An active membership has no end date
            if caps.profile_end_date {
                if let Some(profile) = profile.as_deref_mut() {
                    if profile.member_end_date.is_some() {
                        profile.member_end_date = None;
                        profile_fields.push("member_end_date");
                    }
                }
            }
            if let Some(role) = &options.member_role {
                if account.add_role(role) {
                    account_fields.push("member_role");
                }
            }
        } else if subscription.status == SubscriptionStatus::Cancelled {
            if let Some(cancelled_at) = subscription.cancelled_at {
                match profile.as_deref_mut() {
                    Some(profile) => {
                        if caps.profile_end_date {
                            if let Some(end_date) = end_date_from_epoch(cancelled_at) {
                                if profile.member_end_date != Some(end_date) {
                                    profile.member_end_date = Some(end_date);
                                    profile_fields.push("member_end_date");
                                }
                            }
                        }
                        if let Some(role) = &options.member_role {
                            if account.remove_role(role) {
                                account_fields.push("member_role");
                            }
                        }
                    }
                    None => {
                        self.sink.warning(&format!(
                            "Account {uid} has a cancelled subscription but no main profile to record the end date"
                        ));
                        tracing::warn!(uid = %uid, "Cancelled subscription without main profile");
                    }
                }
            }
        }
        // No other status values produce mutation

        if options.detailed {
            for field in account_fields.iter().chain(profile_fields.iter()) {
                self.sink
                    .status(&format!("Account {uid}: updated {field}"));
            }
        }

        let outcome = ReconcileOutcome {
            account_changed: !account_fields.is_empty(),
            profile_changed: !profile_fields.is_empty(),
            applied_fields: account_fields
                .iter()
                .chain(profile_fields.iter())
                .copied()
                .collect(),
        };

        // Saves are independent: a failure on one entity is reported and the
        // other save still proceeds.
        if outcome.account_changed {
            let revision = options
                .create_revision
                .then(|| format!("Chargebee sync: updated {}", account_fields.join(", ")));
            if let Err(err) = self.accounts.save(account, revision.as_deref()).await {
                self.report_save_failure("account", uid.to_string(), err);
            }
        }

        if outcome.profile_changed {
            if let Some(profile) = profile.as_deref() {
                let revision = options
                    .create_revision
                    .then(|| format!("Chargebee sync: updated {}", profile_fields.join(", ")));
                if let Err(err) = self.profiles.save(profile, revision.as_deref()).await {
                    self.report_save_failure("profile", profile.id.to_string(), err);
                }
            }
        }

        outcome
    }

    /// Plan id, monthly payment and membership type updates
    async fn apply_priced_plan(
        &self,
        account: &mut Account,
        mut profile: Option<&mut Profile>,
        subscription: &SubscriptionRecord,
        options: &ReconcileOptions,
        account_fields: &mut Vec<&'static str>,
        profile_fields: &mut Vec<&'static str>,
    ) {
        let caps = &options.caps;
        // has_priced_plan() guarantees both are present
        let (Some(plan_id), Some(cents)) =
            (subscription.plan_id.as_deref(), subscription.plan_amount_cents)
        else {
            return;
        };

        let plan_amount = cents as f64 / 100.0;

        let term = match self
            .plans
            .upsert_plan(
                plan_id,
                PlanAttributes {
                    amount: plan_amount,
                    currency: subscription.currency_code.clone(),
                    provider: PROVIDER_CHARGEBEE.to_string(),
                },
            )
            .await
        {
            Ok(term) => Some(term),
            Err(err) => {
                self.sink
                    .error(&format!("Failed to upsert plan term {plan_id}: {err}"));
                tracing::error!(plan_id = %plan_id, error = %err, "Plan term upsert failed");
                None
            }
        };

        if caps.account_plan_id && account.chargebee_plan_id.as_deref() != Some(plan_id) {
            account.chargebee_plan_id = Some(plan_id.to_string());
            account_fields.push("chargebee_plan_id");
        }

        // Monthly payment lives on the account when that field exists,
        // otherwise on the profile
        if caps.account_monthly_payment {
            if amounts_differ(account.member_payment_monthly, plan_amount) {
                account.member_payment_monthly = Some(plan_amount);
                account_fields.push("member_payment_monthly");
            }
        } else if caps.profile_monthly_payment {
            if let Some(profile) = profile.as_deref_mut() {
                if amounts_differ(profile.member_payment_monthly, plan_amount) {
                    profile.member_payment_monthly = Some(plan_amount);
                    profile_fields.push("member_payment_monthly");
                }
            }
        }

        if caps.profile_membership_type {
            if let Some(membership_type) = term.as_ref().and_then(|t| t.membership_type) {
                if let Some(profile) = profile.as_deref_mut() {
                    if profile.membership_type != Some(membership_type) {
                        profile.membership_type = Some(membership_type);
                        profile_fields.push("membership_type");
                    }
                }
            }
        }
    }

    fn report_save_failure(&self, entity: &'static str, id: String, err: SyncError) {
        let err = SyncError::EntitySaveFailed {
            entity,
            id,
            message: err.to_string(),
        };
        self.sink.error(&err.to_string());
        tracing::error!(error = %err, "Entity save failed");
    }
}
