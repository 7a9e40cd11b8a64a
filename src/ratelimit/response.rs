//! Rate limit decisions as returned to callers.

use serde::Serialize;
use tokio::task::JoinHandle;

/// Why a response deviates from a plain algorithm decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Reason {
    /// The algorithm rejected the request
    RateLimit,
    /// Rejected from the ephemeral cache without asking the store
    Blacklist,
    /// The store did not answer in time; the request was let through
    Timeout,
}

/// Background work started on behalf of a decision.
///
/// Analytics writes and multi-region reconciliation run detached. Callers may
/// ignore this entirely or [`wait`](Pending::wait) for it, e.g. before a
/// short-lived process exits.
#[derive(Debug, Default)]
pub struct Pending {
    tasks: Vec<JoinHandle<()>>,
}

impl Pending {
    /// No background work.
    pub fn none() -> Self {
        Self::default()
    }

    pub(crate) fn push(&mut self, task: JoinHandle<()>) {
        self.tasks.push(task);
    }

    /// Number of tasks started.
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Whether every task has completed.
    pub fn is_finished(&self) -> bool {
        self.tasks.iter().all(|t| t.is_finished())
    }

    /// Wait for all background work. Task failures are already logged by the
    /// tasks themselves and are not reported here.
    pub async fn wait(self) {
        futures::future::join_all(self.tasks).await;
    }
}

/// Decision returned by `Ratelimiter::limit`.
#[derive(Debug, Serialize)]
pub struct RateLimitResponse {
    /// Whether the request may pass
    pub success: bool,
    /// Maximum number of requests allowed within a window
    pub limit: u64,
    /// Requests left in the current window, never above `limit`
    pub remaining: u64,
    /// Unix timestamp in milliseconds when the limit resets
    pub reset: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<Reason>,
    #[serde(skip)]
    pub pending: Pending,
}

impl RateLimitResponse {
    /// Synthetic rejection served from the ephemeral cache.
    pub(crate) fn blocked(limit: u64, reset: u64) -> Self {
        Self {
            success: false,
            limit,
            remaining: 0,
            reset,
            reason: Some(Reason::Blacklist),
            pending: Pending::none(),
        }
    }

    /// Fail-open answer when the store call did not finish in time.
    pub(crate) fn timed_out() -> Self {
        Self {
            success: true,
            limit: 0,
            remaining: 0,
            reset: 0,
            reason: Some(Reason::Timeout),
            pending: Pending::none(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_serializes_without_pending() {
        let response = RateLimitResponse::blocked(10, 5_000);
        let json = serde_json::to_value(&response).unwrap();

        assert_eq!(json["success"], false);
        assert_eq!(json["reset"], 5_000);
        assert_eq!(json["reason"], "blacklist");
        assert!(json.get("pending").is_none());
    }

    #[test]
    fn test_timed_out_sentinel() {
        let response = RateLimitResponse::timed_out();
        assert!(response.success);
        assert_eq!((response.limit, response.remaining, response.reset), (0, 0, 0));
        assert_eq!(response.reason, Some(Reason::Timeout));
    }

    #[tokio::test]
    async fn test_pending_wait() {
        let mut pending = Pending::none();
        pending.push(tokio::spawn(async {}));
        pending.push(tokio::spawn(async {}));
        assert_eq!(pending.len(), 2);

        pending.wait().await;
    }
}
