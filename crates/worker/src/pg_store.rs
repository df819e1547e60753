//! Postgres implementations of the store collaborators

use async_trait::async_trait;
use chrono::NaiveDate;
use sqlx::PgPool;
use uuid::Uuid;

use membersync_billing::{
    AccountStore, PlanAttributes, PlanManager, ProfileStore, SyncResult,
};
use membersync_shared::{Account, PlanTerm, Profile, MAIN_PROFILE_TYPE};

/// Account persistence backed by the `accounts` table
pub struct PgAccountStore {
    pool: PgPool,
}

impl PgAccountStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl AccountStore for PgAccountStore {
    async fn load(&self, uid: i64) -> SyncResult<Option<Account>> {
        let row: Option<(i64, Option<String>, Option<String>, Option<f64>, Vec<String>)> =
            sqlx::query_as(
                r#"
                SELECT uid, chargebee_customer_id, chargebee_plan_id,
                       member_payment_monthly, roles
                FROM accounts
                WHERE uid = $1
                "#,
            )
            .bind(uid)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.map(
            |(uid, chargebee_customer_id, chargebee_plan_id, member_payment_monthly, roles)| {
                Account {
                    uid,
                    chargebee_customer_id,
                    chargebee_plan_id,
                    member_payment_monthly,
                    roles,
                }
            },
        ))
    }

    async fn list_linked_uids(&self, start_uid: Option<i64>) -> SyncResult<Vec<i64>> {
        let rows: Vec<(i64,)> = sqlx::query_as(
            r#"
            SELECT uid
            FROM accounts
            WHERE chargebee_customer_id IS NOT NULL
              AND chargebee_customer_id <> ''
              AND uid >= $1
            ORDER BY uid ASC
            "#,
        )
        .bind(start_uid.unwrap_or(0))
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(|(uid,)| uid).collect())
    }

    async fn save(&self, account: &Account, revision: Option<&str>) -> SyncResult<()> {
        sqlx::query(
            r#"
            UPDATE accounts
            SET chargebee_plan_id = $1,
                member_payment_monthly = $2,
                roles = $3,
                updated_at = NOW()
            WHERE uid = $4
            "#,
        )
        .bind(&account.chargebee_plan_id)
        .bind(account.member_payment_monthly)
        .bind(&account.roles)
        .bind(account.uid)
        .execute(&self.pool)
        .await?;

        if let Some(log) = revision {
            sqlx::query(
                r#"
                INSERT INTO account_revisions (id, uid, log, created_at)
                VALUES ($1, $2, $3, NOW())
                "#,
            )
            .bind(Uuid::new_v4())
            .bind(account.uid)
            .bind(log)
            .execute(&self.pool)
            .await?;
        }

        tracing::debug!(uid = %account.uid, "Saved account");
        Ok(())
    }
}

/// Profile persistence backed by the `profiles` table
pub struct PgProfileStore {
    pool: PgPool,
}

impl PgProfileStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ProfileStore for PgProfileStore {
    async fn find_main(&self, uid: i64) -> SyncResult<Option<Profile>> {
        let row: Option<(Uuid, i64, String, Option<f64>, Option<Uuid>, Option<NaiveDate>)> =
            sqlx::query_as(
                r#"
                SELECT id, uid, profile_type, member_payment_monthly,
                       membership_type, member_end_date
                FROM profiles
                WHERE uid = $1 AND profile_type = $2
                "#,
            )
            .bind(uid)
            .bind(MAIN_PROFILE_TYPE)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.map(
            |(id, uid, profile_type, member_payment_monthly, membership_type, member_end_date)| {
                Profile {
                    id,
                    uid,
                    profile_type,
                    member_payment_monthly,
                    membership_type,
                    member_end_date,
                }
            },
        ))
    }

    async fn save(&self, profile: &Profile, revision: Option<&str>) -> SyncResult<()> {
        sqlx::query(
            r#"
            UPDATE profiles
            SET member_payment_monthly = $1,
                membership_type = $2,
                member_end_date = $3,
                updated_at = NOW()
            WHERE id = $4
            "#,
        )
        .bind(profile.member_payment_monthly)
        .bind(profile.membership_type)
        .bind(profile.member_end_date)
        .bind(profile.id)
        .execute(&self.pool)
        .await?;

        if let Some(log) = revision {
            sqlx::query(
                r#"
                INSERT INTO profile_revisions (id, profile_id, log, created_at)
                VALUES ($1, $2, $3, NOW())
                "#,
            )
            .bind(Uuid::new_v4())
            .bind(profile.id)
            .bind(log)
            .execute(&self.pool)
            .await?;
        }

        tracing::debug!(profile_id = %profile.id, uid = %profile.uid, "Saved profile");
        Ok(())
    }
}

/// Plan-term taxonomy backed by the `plan_terms` table
pub struct PgPlanManager {
    pool: PgPool,
}

impl PgPlanManager {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl PlanManager for PgPlanManager {
    async fn upsert_plan(&self, plan_id: &str, attrs: PlanAttributes) -> SyncResult<PlanTerm> {
        // Membership type assignment is curated by operators; the upsert
        // never touches it.
        let row: (Uuid, String, f64, Option<String>, String, Option<Uuid>) = sqlx::query_as(
            r#"
            INSERT INTO plan_terms (id, plan_id, amount, currency, provider)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (plan_id) DO UPDATE
            SET amount = EXCLUDED.amount,
                currency = EXCLUDED.currency,
                provider = EXCLUDED.provider
            RETURNING id, plan_id, amount, currency, provider, membership_type
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(plan_id)
        .bind(attrs.amount)
        .bind(&attrs.currency)
        .bind(&attrs.provider)
        .fetch_one(&self.pool)
        .await?;

        let (id, plan_id, amount, currency, provider, membership_type) = row;

        tracing::debug!(plan_id = %plan_id, "Upserted plan term");

        Ok(PlanTerm {
            id,
            plan_id,
            amount,
            currency,
            provider,
            membership_type,
        })
    }
}
