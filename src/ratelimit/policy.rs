//! Admission decisions and store failure handling.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use super::limiter::{LimitStatus, RateLimiter};
use super::store::CounterStore;

/// What to do with a request when the counter store cannot be reached.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailurePolicy {
    /// Let the request through
    #[default]
    Open,
    /// Reject the request
    Closed,
}

/// Result of [`RateLimiter::admit`].
#[derive(Debug, Clone, PartialEq)]
pub enum Admission {
    /// Under the limit; the event was recorded
    Allowed(LimitStatus),
    /// Over the limit; nothing was recorded
    Limited(LimitStatus),
    /// The store failed and the failure policy decided
    StoreFailure { allowed: bool },
}

impl Admission {
    /// Whether the caller should serve the request.
    pub fn is_allowed(&self) -> bool {
        match self {
            Admission::Allowed(_) => true,
            Admission::Limited(_) => false,
            Admission::StoreFailure { allowed } => *allowed,
        }
    }

    /// Suggested wait before retrying, if the request was limited.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Admission::Limited(status) => status.limit_duration,
            _ => None,
        }
    }

    /// The limit status behind this decision, if the store answered.
    pub fn status(&self) -> Option<&LimitStatus> {
        match self {
            Admission::Allowed(status) | Admission::Limited(status) => Some(status),
            Admission::StoreFailure { .. } => None,
        }
    }
}

impl<S: CounterStore + ?Sized> RateLimiter<S> {
    /// Check `key` and record the event only if it is admitted.
    pub async fn admit(&self, key: &str) -> Admission {
        self.admit_at(key, Utc::now()).await
    }

    /// Check and record `key` as of `now`.
    pub async fn admit_at(&self, key: &str, now: DateTime<Utc>) -> Admission {
        let status = match self.check_at(key, now).await {
            Ok(status) => status,
            Err(e) => {
                let allowed = self.failure_policy() == FailurePolicy::Open;
                warn!(
                    key = %key,
                    error = %e,
                    allowed,
                    "Rate limit check failed, applying failure policy"
                );
                return Admission::StoreFailure { allowed };
            }
        };

        if status.is_limited {
            return Admission::Limited(status);
        }

        // The request was already admitted; a lost increment only skews the estimate.
        if let Err(e) = self.inc_at(key, now).await {
            warn!(key = %key, error = %e, "Could not increment key");
        }

        Admission::Allowed(status)
    }
}
