//! Common types used across MemberSync

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Profile type that carries the membership fields (at most one per account)
pub const MAIN_PROFILE_TYPE: &str = "main";

/// Billing provider identifier recorded on plan terms
pub const PROVIDER_CHARGEBEE: &str = "chargebee";

// =============================================================================
// Subscription status
// =============================================================================

/// Subscription status as reported by the billing provider
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    Active,
    InTrial,
    Future,
    NonRenewing,
    Cancelled,
    Unknown,
    /// Statuses the provider may add that we do not act on (e.g. "paused")
    #[serde(untagged)]
    Other(String),
}

impl SubscriptionStatus {
    /// Parse the provider's wire value. Unrecognised values are preserved
    /// as `Other` so they can appear verbatim in log messages.
    pub fn from_wire(value: &str) -> Self {
        match value {
            "active" => Self::Active,
            "in_trial" => Self::InTrial,
            "future" => Self::Future,
            "non_renewing" => Self::NonRenewing,
            "cancelled" => Self::Cancelled,
            "unknown" => Self::Unknown,
            other => Self::Other(other.to_string()),
        }
    }

    /// Active, in-trial, future and non-renewing subscriptions are all
    /// treated as a current membership for role and end-date purposes.
    pub fn is_active_like(&self) -> bool {
        matches!(
            self,
            Self::Active | Self::InTrial | Self::Future | Self::NonRenewing
        )
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Active => "active",
            Self::InTrial => "in_trial",
            Self::Future => "future",
            Self::NonRenewing => "non_renewing",
            Self::Cancelled => "cancelled",
            Self::Unknown => "unknown",
            Self::Other(s) => s,
        }
    }
}

// =============================================================================
// Customer identifier normalization
// =============================================================================

/// Normalize a stored Chargebee customer id before using it in any API call.
///
/// Operators annotate stale links in place, e.g. `"was cust_123 -- moved to
/// new account"`. Strip the case-insensitive leading `was ` marker and any
/// trailing ` -- ...` comment. Returns `None` when nothing usable remains.
pub fn normalize_customer_id(raw: &str) -> Option<String> {
    let mut id = raw.trim();

    // `get` rather than indexing: byte 4 may fall inside a multi-byte char.
    if let Some(head) = id.get(..4) {
        if head.eq_ignore_ascii_case("was ") {
            id = id[4..].trim_start();
        }
    }

    if let Some(pos) = id.find(" --") {
        id = id[..pos].trim_end();
    }

    if id.is_empty() {
        None
    } else {
        Some(id.to_string())
    }
}

// =============================================================================
// Subscription record
// =============================================================================

/// Subscription state derived from the provider's most recent record for a
/// customer. Built fresh on every run; never persisted as-is.
#[derive(Debug, Clone, PartialEq)]
pub struct SubscriptionRecord {
    pub customer_id: String,
    pub status: SubscriptionStatus,
    pub plan_id: Option<String>,
    pub plan_amount_cents: Option<i64>,
    pub currency_code: Option<String>,
    /// Cancellation time as a unix epoch (seconds), when status is cancelled
    pub cancelled_at: Option<i64>,
}

impl SubscriptionRecord {
    /// The plan/amount branch of reconciliation only applies when both the
    /// plan id and the plan amount are present.
    pub fn has_priced_plan(&self) -> bool {
        self.plan_id.is_some() && self.plan_amount_cents.is_some()
    }
}

// =============================================================================
// Local entities
// =============================================================================

/// Member account row as loaded from the local store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Account {
    pub uid: i64,
    pub chargebee_customer_id: Option<String>,
    pub chargebee_plan_id: Option<String>,
    pub member_payment_monthly: Option<f64>,
    pub roles: Vec<String>,
}

impl Account {
    pub fn has_role(&self, role: &str) -> bool {
        self.roles.iter().any(|r| r == role)
    }

    /// Add a role if absent. Returns true when the account changed.
    pub fn add_role(&mut self, role: &str) -> bool {
        if self.has_role(role) {
            return false;
        }
        self.roles.push(role.to_string());
        true
    }

    /// Remove a role if present. Returns true when the account changed.
    pub fn remove_role(&mut self, role: &str) -> bool {
        let before = self.roles.len();
        self.roles.retain(|r| r != role);
        self.roles.len() != before
    }

    /// Customer id normalized for API use
    pub fn customer_id(&self) -> Option<String> {
        self.chargebee_customer_id
            .as_deref()
            .and_then(normalize_customer_id)
    }
}

/// Main membership profile attached to an account (0 or 1 per account)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Profile {
    pub id: Uuid,
    pub uid: i64,
    pub profile_type: String,
    pub member_payment_monthly: Option<f64>,
    /// Reference to a plan-term classification
    pub membership_type: Option<Uuid>,
    /// Membership end date, UTC, day precision
    pub member_end_date: Option<NaiveDate>,
}

/// Plan classification keyed by the provider's plan id. Upserted once per
/// distinct plan id seen in a run; owned by the plan-manager collaborator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanTerm {
    pub id: Uuid,
    pub plan_id: String,
    pub amount: f64,
    pub currency: Option<String>,
    pub provider: String,
    pub membership_type: Option<Uuid>,
}

// =============================================================================
// Field capabilities
// =============================================================================

/// Which writable fields exist on the account and profile types.
///
/// Resolved once at startup from the store schema instead of probing per
/// field at runtime. When both the account and the profile carry a monthly
/// payment field the account takes precedence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldCaps {
    pub account_plan_id: bool,
    pub account_monthly_payment: bool,
    pub profile_monthly_payment: bool,
    pub profile_membership_type: bool,
    pub profile_end_date: bool,
}

impl Default for FieldCaps {
    fn default() -> Self {
        Self {
            account_plan_id: true,
            account_monthly_payment: false,
            profile_monthly_payment: true,
            profile_membership_type: true,
            profile_end_date: true,
        }
    }
}
