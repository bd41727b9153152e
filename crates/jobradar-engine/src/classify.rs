use chrono::Duration;
use jobradar_core::{ErrorCategory, SourceError};

/// Failures before transient and unclassified errors start cooling a source down.
const COOLDOWN_AFTER_FAILURES: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Classification {
    pub category: ErrorCategory,
    pub cooldown: Option<Duration>,
    /// Failure count after this failure.
    pub consecutive_failures: u32,
}

impl Classification {
    pub fn cooldown_minutes(&self) -> Option<i64> {
        self.cooldown.map(|d| d.num_minutes())
    }
}

pub fn classify(err: &SourceError, consecutive_failures: u32) -> Classification {
    let failures = consecutive_failures.saturating_add(1);
    let category = err.category();
    let minutes = match category {
        ErrorCategory::Blocked | ErrorCategory::RateLimited => Some((30 * i64::from(failures)).min(120)),
        ErrorCategory::BadConfig => Some(120),
        ErrorCategory::TlsCert => Some(60),
        ErrorCategory::TransientNetwork if failures >= COOLDOWN_AFTER_FAILURES => {
            Some((5 * i64::from(failures)).min(15))
        }
        ErrorCategory::Unclassified if failures >= COOLDOWN_AFTER_FAILURES => Some(10),
        ErrorCategory::TransientNetwork | ErrorCategory::Unclassified => None,
    };
    Classification {
        category,
        cooldown: minutes.map(Duration::minutes),
        consecutive_failures: failures,
    }
}
