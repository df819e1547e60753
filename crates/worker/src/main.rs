//! MemberSync Batch Worker
//!
//! CLI entry point for the Chargebee → member database reconciliation job.
//!
//! ## Usage
//! ```bash
//! # Full batch run
//! cargo run --bin membersync-worker
//!
//! # Resume from an account id floor, throttled
//! cargo run --bin membersync-worker -- --start-uid 4200 --delay 1
//!
//! # Single-account test run with revisions and detailed logging
//! cargo run --bin membersync-worker -- --uid 17 --create-revision --detailed
//! ```
//!
//! ## Environment Variables
//! - DATABASE_URL: PostgreSQL connection string
//! - CHARGEBEE_SITE / CHARGEBEE_API_KEY: billing provider credentials
//! - CHARGEBEE_API_BASE_URL: full API base URL override (testing)
//! - MEMBER_ROLE: role granted/revoked with membership (optional)

mod pg_store;
mod sink;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tracing::info;
use tracing_subscriber::EnvFilter;

use membersync_billing::{BatchCoordinator, BatchOptions, ChargebeeClient, ChargebeeConfig};

use crate::pg_store::{PgAccountStore, PgPlanManager, PgProfileStore};
use crate::sink::TracingSink;

/// Options collected from the command line
#[derive(Debug, Default, PartialEq, Eq)]
struct CliOptions {
    /// Single-account test run
    uid: Option<i64>,
    /// Skip accounts below this uid (resume floor)
    start_uid: Option<i64>,
    /// Seconds to pause after each account
    delay_secs: u64,
    create_revision: bool,
    detailed: bool,
}

fn parse_args(mut args: impl Iterator<Item = String>) -> anyhow::Result<CliOptions> {
    let mut options = CliOptions::default();

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--uid" => {
                let value = args.next().context("--uid requires a value")?;
                options.uid = Some(value.parse().context("--uid must be an integer")?);
            }
            "--start-uid" => {
                let value = args.next().context("--start-uid requires a value")?;
                options.start_uid =
                    Some(value.parse().context("--start-uid must be an integer")?);
            }
            "--delay" => {
                let value = args.next().context("--delay requires a value")?;
                options.delay_secs = value.parse().context("--delay must be a non-negative integer")?;
            }
            "--create-revision" => options.create_revision = true,
            "--detailed" => options.detailed = true,
            other => anyhow::bail!("Unknown argument: {other}"),
        }
    }

    Ok(options)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = parse_args(std::env::args().skip(1))?;

    let database_url = std::env::var("DATABASE_URL").context("DATABASE_URL must be set")?;
    let chargebee_config = ChargebeeConfig::from_env()?;
    let member_role = std::env::var("MEMBER_ROLE").ok();

    let pool = membersync_shared::db::create_pool(&database_url)
        .await
        .context("Failed to connect to database")?;
    membersync_shared::db::run_migrations(&pool)
        .await
        .context("Failed to run migrations")?;

    let sink = Arc::new(TracingSink::default());
    let client = Arc::new(ChargebeeClient::new(chargebee_config, sink.clone())?);
    let accounts = Arc::new(PgAccountStore::new(pool.clone()));
    let profiles = Arc::new(PgProfileStore::new(pool.clone()));
    let plans = Arc::new(PgPlanManager::new(pool.clone()));

    let coordinator = BatchCoordinator::new(
        client,
        accounts.clone(),
        profiles,
        Some(plans),
        sink.clone(),
    );

    let options = BatchOptions {
        delay_per_account: Duration::from_secs(cli.delay_secs),
        detailed: cli.detailed,
        create_revision: cli.create_revision,
        member_role,
        ..BatchOptions::default()
    };

    let result = match cli.uid {
        Some(uid) => coordinator.run_single(uid, &options).await,
        None => {
            use membersync_billing::AccountStore;
            let uids = accounts.list_linked_uids(cli.start_uid).await?;
            coordinator.run(&uids, &options).await
        }
    };

    info!(
        warnings = sink.warnings(),
        errors = sink.errors(),
        success = result.success,
        "Reconciliation run finished"
    );

    if !result.success {
        anyhow::bail!("Reconciliation run failed: required collaborator unavailable");
    }

    Ok(())
}
