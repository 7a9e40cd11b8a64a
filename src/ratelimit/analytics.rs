//! Best-effort recording of rate limit decisions.
//!
//! Events are aggregated into one hash per hour in the primary region's store.
//! Writes run on detached tasks and failures are only logged.

use std::sync::Arc;

use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{trace, warn};

use crate::store::AtomicStore;

const BUCKET_MS: u64 = 60 * 60 * 1000;
/// Hourly buckets are kept for a day.
const RETENTION_MS: u64 = 24 * BUCKET_MS;

/// Request metadata attached to an analytics event.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Geo {
    pub ip: Option<String>,
    pub country: Option<String>,
    pub region: Option<String>,
    pub city: Option<String>,
    pub user_agent: Option<String>,
}

/// Outcome of a decision, as recorded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    Success,
    Rejected,
}

impl Outcome {
    fn as_str(&self) -> &'static str {
        match self {
            Outcome::Success => "success",
            Outcome::Rejected => "rejected",
        }
    }
}

/// One recorded decision.
#[derive(Debug, Clone, Serialize)]
pub struct AnalyticsEvent {
    pub identifier: String,
    pub time: u64,
    pub outcome: Outcome,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub geo: Option<Geo>,
}

impl AnalyticsEvent {
    /// Hash fields this event increments.
    fn fields(&self) -> Vec<String> {
        let outcome = self.outcome.as_str();
        let mut fields = vec![format!("identifier:{}:{}", self.identifier, outcome)];
        if let Some(country) = self.geo.as_ref().and_then(|g| g.country.as_deref()) {
            fields.push(format!("country:{}:{}", country, outcome));
        }
        fields
    }
}

/// Writes decision events to a store without blocking the caller.
#[derive(Debug, Clone)]
pub struct Analytics {
    store: Arc<dyn AtomicStore>,
    prefix: String,
}

impl Analytics {
    /// Record into `store` under `<prefix>:analytics:<hour>`.
    pub fn new(store: Arc<dyn AtomicStore>, prefix: &str) -> Self {
        Self {
            store,
            prefix: prefix.to_string(),
        }
    }

    /// Key of the hash holding events for the hour containing `time`.
    pub fn bucket_key(&self, time: u64) -> String {
        format!("{}:analytics:{}", self.prefix, (time / BUCKET_MS) * BUCKET_MS)
    }

    /// Start writing `event`; the returned task never fails.
    pub fn record(&self, event: AnalyticsEvent) -> JoinHandle<()> {
        let store = self.store.clone();
        let key = self.bucket_key(event.time);

        tokio::spawn(async move {
            let fields = event.fields();
            match store.record_event(&key, &fields, RETENTION_MS).await {
                Ok(()) => trace!(key = %key, identifier = %event.identifier, "Recorded analytics event"),
                Err(e) => warn!(
                    key = %key,
                    identifier = %event.identifier,
                    error = %e,
                    "Failed to record analytics event"
                ),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::store::MemoryStore;

    #[test]
    fn test_bucket_key_floors_to_hour() {
        let analytics = Analytics::new(Arc::new(MemoryStore::new()), "@ratelimit");
        assert_eq!(analytics.bucket_key(0), "@ratelimit:analytics:0");
        assert_eq!(
            analytics.bucket_key(BUCKET_MS + 1_234),
            format!("@ratelimit:analytics:{}", BUCKET_MS)
        );
    }

    #[test]
    fn test_event_fields_include_country() {
        let event = AnalyticsEvent {
            identifier: "user".to_string(),
            time: 0,
            outcome: Outcome::Rejected,
            geo: Some(Geo {
                country: Some("DE".to_string()),
                ..Default::default()
            }),
        };
        assert_eq!(
            event.fields(),
            vec!["identifier:user:rejected".to_string(), "country:DE:rejected".to_string()]
        );
    }

    #[tokio::test]
    async fn test_record_writes_counts() {
        let clock = Arc::new(ManualClock::new(5_000));
        let store = Arc::new(MemoryStore::with_clock(clock));
        let analytics = Analytics::new(store.clone(), "p");

        for outcome in [Outcome::Success, Outcome::Success, Outcome::Rejected] {
            analytics
                .record(AnalyticsEvent {
                    identifier: "user".to_string(),
                    time: 5_000,
                    outcome,
                    geo: None,
                })
                .await
                .unwrap();
        }

        let key = analytics.bucket_key(5_000);
        assert_eq!(store.event_count(&key, "identifier:user:success"), 2);
        assert_eq!(store.event_count(&key, "identifier:user:rejected"), 1);
    }
}
