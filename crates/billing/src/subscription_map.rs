//! Latest-subscription-per-customer map built from the paginated list feed

use std::collections::HashMap;
use std::sync::Arc;

use membersync_shared::SubscriptionRecord;

use crate::error::SyncError;
use crate::stores::{MessageSink, SubscriptionApi};

/// At most one (the most recent) subscription per customer id
pub type SubscriptionMap = HashMap<String, SubscriptionRecord>;

/// Builds a [`SubscriptionMap`] for a chunk of customer ids with one
/// provider-side filtered query, paginating until the feed is exhausted.
pub struct SubscriptionMapBuilder {
    api: Arc<dyn SubscriptionApi>,
    sink: Arc<dyn MessageSink>,
}

impl SubscriptionMapBuilder {
    pub fn new(api: Arc<dyn SubscriptionApi>, sink: Arc<dyn MessageSink>) -> Self {
        Self { api, sink }
    }

    /// Fetch the most recent subscription for every customer in the chunk.
    ///
    /// The feed is requested sorted by update time descending, so the first
    /// record seen for a customer is its most recent one; records for that
    /// customer on later pages are stale and must never overwrite it.
    ///
    /// A page fetch abandoned by the client halts pagination immediately and
    /// whatever was accumulated so far is returned. An empty id set returns
    /// an empty map without a network call.
    pub async fn build(&self, customer_ids: &[String]) -> SubscriptionMap {
        let mut map = SubscriptionMap::new();

        if customer_ids.is_empty() {
            return map;
        }

        let mut offset: Option<String> = None;

        loop {
            let page = match self.api.fetch_page(customer_ids, offset.as_deref()).await {
                Ok(page) => page,
                Err(err) => {
                    if matches!(err, SyncError::RateLimited) {
                        // Non-retryable failures were already reported by the
                        // client; exhausted rate-limit retries were not.
                        self.sink.error(&format!(
                            "Giving up on subscription page after repeated rate limiting: {err}"
                        ));
                    }
                    tracing::warn!(
                        error = %err,
                        accumulated = map.len(),
                        "Halting subscription pagination after page failure"
                    );
                    return map;
                }
            };

            for record in page.entries {
                if !map.contains_key(&record.customer_id) {
                    map.insert(record.customer_id.clone(), record);
                }
            }

            match page.next_offset {
                Some(next) => offset = Some(next),
                None => break,
            }
        }

        tracing::debug!(
            customers = customer_ids.len(),
            resolved = map.len(),
            "Built subscription map for chunk"
        );

        map
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::stores::{MessageLevel, SubscriptionPage};
    use crate::testing::{record, FakeSubscriptionApi, RecordingSink};
    use membersync_shared::SubscriptionStatus;

    fn page(entries: Vec<SubscriptionRecord>, next_offset: Option<&str>) -> SubscriptionPage {
        SubscriptionPage {
            entries,
            next_offset: next_offset.map(str::to_string),
        }
    }

    #[tokio::test]
    async fn test_first_seen_record_wins_across_pages() {
        // cust_1 appears on page 1 (most recent, plan_new) and again on
        // page 2 with a stale plan; the page-1 record must be retained.
        let api = Arc::new(FakeSubscriptionApi::with_pages(vec![
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
        ]));
        let sink = Arc::new(RecordingSink::default());
        let builder = SubscriptionMapBuilder::new(api, sink);

        let map = builder
            .build(&["cust_1".to_string(), "cust_2".to_string()])
            .await;

        assert_eq!(map.len(), 2);
        assert_eq!(map["cust_1"].plan_id.as_deref(), Some("plan_new"));
        assert_eq!(map["cust_2"].plan_id.as_deref(), Some("plan_2"));
    }

    #[tokio::test]
    async fn test_page_failure_halts_and_returns_partial_map() {
        let api = Arc::new(FakeSubscriptionApi::with_pages(vec![
            Ok(page(
                vec![record("cust_1", SubscriptionStatus::Active, Some("plan_1"))],
                Some("p2"),
            )),
            Err(SyncError::RequestFailed {
                status: 500,
                message: "internal error".to_string(),
            }),
        ]));
        let sink = Arc::new(RecordingSink::default());
        let builder = SubscriptionMapBuilder::new(api.clone(), sink);

        let map = builder.build(&["cust_1".to_string()]).await;

        assert_eq!(map.len(), 1);
        assert!(map.contains_key("cust_1"));
        assert_eq!(api.calls(), 2);
    }

    #[tokio::test]
    async fn test_exhausted_rate_limit_reported_as_error() {
        let api = Arc::new(FakeSubscriptionApi::with_pages(vec![Err(
            SyncError::RateLimited,
        )]));
        let sink = Arc::new(RecordingSink::default());
        let builder = SubscriptionMapBuilder::new(api, sink.clone());

        let map = builder.build(&["cust_1".to_string()]).await;

        assert!(map.is_empty());
        assert!(sink.has_message_at(MessageLevel::Error));
    }

    #[tokio::test]
    async fn test_empty_id_set_makes_no_network_call() {
        let api = Arc::new(FakeSubscriptionApi::with_pages(Vec::new()));
        let sink = Arc::new(RecordingSink::default());
        let builder = SubscriptionMapBuilder::new(api.clone(), sink);

        let map = builder.build(&[]).await;

        assert!(map.is_empty());
        assert_eq!(api.calls(), 0);
    }
}
