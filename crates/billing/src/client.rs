//! Chargebee client configuration and subscription list API

use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use tokio_retry::strategy::{ExponentialBackoff, FixedInterval};
use tokio_retry::Retry;

use membersync_shared::{SubscriptionRecord, SubscriptionStatus};

use crate::error::{SyncError, SyncResult};
use crate::stores::{MessageSink, SubscriptionApi, SubscriptionPage};

/// Page size for bulk subscription list requests
pub const PAGE_LIMIT: u32 = 100;

/// Maximum attempts for a bulk list call (initial + retries)
const BULK_MAX_ATTEMPTS: usize = 4;

/// Base backoff delay for bulk list calls (doubles per attempt: 5s, 10s, 20s)
const BULK_BASE_DELAY: Duration = Duration::from_secs(5);

/// Maximum attempts for the legacy single-customer call
const SINGLE_MAX_ATTEMPTS: usize = 3;

/// Fixed retry delay for the legacy single-customer call
const SINGLE_RETRY_DELAY: Duration = Duration::from_secs(2);

/// Timeout for provider requests
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Configuration for the Chargebee API
#[derive(Debug, Clone)]
pub struct ChargebeeConfig {
    /// Base URL of the site API, e.g. `https://acme.chargebee.com/api/v2`
    pub api_base_url: String,
    /// API key; sent as the basic-auth username with an empty password
    pub api_key: String,
}

impl ChargebeeConfig {
    /// Create config from environment variables.
    ///
    /// `CHARGEBEE_SITE` names the site (`acme` → `https://acme.chargebee.com`);
    /// `CHARGEBEE_API_BASE_URL` overrides the full base URL when set, which
    /// is how integration tests point the client at a local server.
    pub fn from_env() -> SyncResult<Self> {
        let api_base_url = match std::env::var("CHARGEBEE_API_BASE_URL") {
            Ok(url) => url,
            Err(_) => {
                let site = std::env::var("CHARGEBEE_SITE")
                    .map_err(|_| SyncError::Config("CHARGEBEE_SITE not set".to_string()))?;
                format!("https://{}.chargebee.com/api/v2", site)
            }
        };

        Ok(Self {
            api_base_url,
            api_key: std::env::var("CHARGEBEE_API_KEY")
                .map_err(|_| SyncError::Config("CHARGEBEE_API_KEY not set".to_string()))?,
        })
    }

    fn subscriptions_url(&self) -> String {
        format!("{}/subscriptions", self.api_base_url.trim_end_matches('/'))
    }
}

/// Build the provider-side `customer_id[in]` filter expression.
///
/// Identifiers are quoted individually with embedded quotes escaped, so a
/// stored id can never break out of the filter expression.
pub fn in_filter_expression(customer_ids: &[String]) -> String {
    let quoted: Vec<String> = customer_ids
        .iter()
        .map(|id| format!("\"{}\"", id.replace('\\', "\\\\").replace('"', "\\\"")))
        .collect();
    format!("[{}]", quoted.join(","))
}

/// Backoff schedule for bulk list retries: 5s, 10s, 20s
fn bulk_backoff() -> impl Iterator<Item = Duration> {
    ExponentialBackoff::from_millis(2)
        .factor(BULK_BASE_DELAY.as_millis() as u64 / 2)
        .take(BULK_MAX_ATTEMPTS - 1)
}

// =============================================================================
// Wire format
// =============================================================================

#[derive(Debug, Deserialize)]
struct ListResponse {
    #[serde(default)]
    list: Vec<ListEntry>,
    next_offset: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ListEntry {
    subscription: WireSubscription,
}

#[derive(Debug, Deserialize)]
struct WireSubscription {
    customer_id: String,
    status: Option<String>,
    plan_id: Option<String>,
    plan_amount: Option<i64>,
    currency_code: Option<String>,
    cancelled_at: Option<i64>,
}

impl From<WireSubscription> for SubscriptionRecord {
    fn from(wire: WireSubscription) -> Self {
        SubscriptionRecord {
            customer_id: wire.customer_id,
            status: wire
                .status
                .as_deref()
                .map(SubscriptionStatus::from_wire)
                .unwrap_or(SubscriptionStatus::Unknown),
            plan_id: wire.plan_id,
            plan_amount_cents: wire.plan_amount,
            currency_code: wire.currency_code,
            cancelled_at: wire.cancelled_at,
        }
    }
}

// =============================================================================
// Client
// =============================================================================

/// Chargebee subscription list client
///
/// Owns retry/backoff for rate-limited responses. Any error returned from
/// the trait methods means the request was abandoned after exhausting the
/// attempt bound (or failed with a non-retryable status).
pub struct ChargebeeClient {
    http: reqwest::Client,
    config: ChargebeeConfig,
    sink: Arc<dyn MessageSink>,
}

impl ChargebeeClient {
    pub fn new(config: ChargebeeConfig, sink: Arc<dyn MessageSink>) -> SyncResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()?;

        Ok(Self { http, config, sink })
    }

    pub fn config(&self) -> &ChargebeeConfig {
        &self.config
    }

    /// Issue one bulk list request without retrying
    async fn list_page_once(
        &self,
        customer_ids: &[String],
        offset: Option<&str>,
    ) -> SyncResult<SubscriptionPage> {
        let mut query: Vec<(&str, String)> = vec![
            ("limit", PAGE_LIMIT.to_string()),
            ("sort_by[desc]", "updated_at".to_string()),
            ("customer_id[in]", in_filter_expression(customer_ids)),
        ];
        if let Some(offset) = offset {
            query.push(("offset", offset.to_string()));
        }

        self.send_list_request(&query).await
    }

    /// Issue one single-customer request without retrying
    async fn single_page_once(&self, customer_id: &str) -> SyncResult<SubscriptionPage> {
        let query: Vec<(&str, String)> = vec![
            ("limit", "1".to_string()),
            ("sort_by[desc]", "updated_at".to_string()),
            ("customer_id[is]", customer_id.to_string()),
            ("status[is]", "active".to_string()),
        ];

        self.send_list_request(&query).await
    }

    async fn send_list_request(&self, query: &[(&str, String)]) -> SyncResult<SubscriptionPage> {
        let response = self
            .http
            .get(self.config.subscriptions_url())
            .basic_auth(&self.config.api_key, Some(""))
            .query(query)
            .send()
            .await?;

        let status = response.status();
        if status.as_u16() == 429 {
            return Err(SyncError::RateLimited);
        }
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(SyncError::RequestFailed {
                status: status.as_u16(),
                message,
            });
        }

        let body: ListResponse = response.json().await?;

        Ok(SubscriptionPage {
            entries: body
                .list
                .into_iter()
                .map(|entry| entry.subscription.into())
                .collect(),
            next_offset: body.next_offset,
        })
    }

    /// Run a request closure with retry on rate limiting.
    ///
    /// Emits a warning through the sink on every rate-limit retry and an
    /// error on a non-retryable failure. The bound-exceeded case surfaces
    /// as the final `RateLimited` error.
    async fn with_retry<F, Fut>(
        &self,
        strategy: impl Iterator<Item = Duration>,
        context: &str,
        request: F,
    ) -> SyncResult<SubscriptionPage>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = SyncResult<SubscriptionPage>>,
    {
        Retry::spawn(strategy, || async {
            let result = request().await;

            match &result {
                Ok(_) => Ok(result),
                Err(err) if err.is_retryable() => {
                    self.sink.warning(&format!(
                        "Rate limited while fetching {context}; retrying with backoff"
                    ));
                    tracing::warn!(context = %context, "Rate limited - will retry");
                    Err(result) // Return error to trigger retry
                }
                Err(err) => {
                    self.sink
                        .error(&format!("Billing API request failed for {context}: {err}"));
                    tracing::error!(context = %context, error = %err, "Request failed - will not retry");
                    Ok(result) // Return error wrapped in Ok to stop retrying
                }
            }
        })
        .await
        .unwrap_or_else(|e| e) // Extract the inner result
    }
}

#[async_trait::async_trait]
impl SubscriptionApi for ChargebeeClient {
    async fn fetch_page(
        &self,
        customer_ids: &[String],
        offset: Option<&str>,
    ) -> SyncResult<SubscriptionPage> {
        self.with_retry(bulk_backoff(), "subscription list page", || {
            self.list_page_once(customer_ids, offset)
        })
        .await
    }

    async fn fetch_latest_for_customer(
        &self,
        customer_id: &str,
    ) -> SyncResult<Option<SubscriptionRecord>> {
        let strategy =
            FixedInterval::new(SINGLE_RETRY_DELAY).take(SINGLE_MAX_ATTEMPTS - 1);

        let page = self
            .with_retry(strategy, "single-customer subscription", || {
                self.single_page_once(customer_id)
            })
            .await?;

        Ok(page.entries.into_iter().next())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_in_filter_quotes_each_id() {
        let ids = vec!["cust_1".to_string(), "cust_2".to_string()];
        assert_eq!(in_filter_expression(&ids), r#"["cust_1","cust_2"]"#);
    }

    #[test]
    fn test_in_filter_escapes_embedded_quotes() {
        let ids = vec![r#"cust"],["evil"#.to_string()];
        assert_eq!(in_filter_expression(&ids), r#"["cust\"],[\"evil"]"#);
    }

    #[test]
    fn test_bulk_backoff_schedule() {
        let delays: Vec<Duration> = bulk_backoff().collect();
        assert_eq!(
            delays,
            vec![
                Duration::from_secs(5),
                Duration::from_secs(10),
                Duration::from_secs(20),
            ]
        );
    }

    #[test]
    fn test_wire_subscription_parsing() {
        let body = r#"{
            "list": [
                {"subscription": {
                    "customer_id": "cust_1",
                    "status": "active",
                    "plan_id": "plan_pro",
                    "plan_amount": 2900,
                    "currency_code": "EUR",
                    "id": "sub_1",
                    "updated_at": 1710000000
                }}
            ],
            "next_offset": "abc123"
        }"#;

        let parsed: ListResponse = serde_json::from_str(body).unwrap();
        assert_eq!(parsed.next_offset.as_deref(), Some("abc123"));

        let record: SubscriptionRecord = parsed
            .list
            .into_iter()
            .next()
            .unwrap()
            .subscription
            .into();
        assert_eq!(record.customer_id, "cust_1");
        assert_eq!(record.status, SubscriptionStatus::Active);
        assert_eq!(record.plan_id.as_deref(), Some("plan_pro"));
        assert_eq!(record.plan_amount_cents, Some(2900));
        assert!(record.cancelled_at.is_none());
    }

    #[test]
    fn test_wire_subscription_missing_status() {
        let body = r#"{"list": [{"subscription": {"customer_id": "cust_2"}}]}"#;
        let parsed: ListResponse = serde_json::from_str(body).unwrap();
        let record: SubscriptionRecord = parsed
            .list
            .into_iter()
            .next()
            .unwrap()
            .subscription
            .into();
        assert_eq!(record.status, SubscriptionStatus::Unknown);
        assert!(record.plan_id.is_none());
        assert!(record.plan_amount_cents.is_none());
    }
}
