// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Retry and backoff policy for failed groups.
//!
//! The policy only computes numbers; it never sleeps. Delays are applied as a
//! "not eligible before" timestamp on the failed group, so re-queueing stays
//! non-blocking and re-entrant.

use crate::config::RetrySettings;

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    /// Retryable failures beyond this count leave the group permanently
    /// failed.
    pub max_retries: u32,
    /// Delay before the first retry, in seconds.
    pub initial_delay_s: f64,
    /// Ceiling on the delay, in seconds.
    pub max_delay_s: f64,
}

impl BackoffPolicy {
    pub fn new(settings: &RetrySettings) -> BackoffPolicy {
        BackoffPolicy {
            max_retries: settings.max_retries,
            initial_delay_s: settings.initial_delay_s,
            max_delay_s: settings.max_delay_s,
        }
    }

    /// The delay preceding the given attempt, where attempt 1 is the first
    /// retry. Doubles per attempt, clamped to the ceiling.
    pub fn delay_for(&self, attempt: u32) -> f64 {
        if attempt == 0 {
            return 0.0;
        }
        let exp = (attempt - 1).min(f64::MAX_EXP as u32 - 1);
        (self.initial_delay_s * 2f64.powi(exp as i32)).min(self.max_delay_s)
    }

    /// Whether a group with this retry count has budget left.
    pub fn within_budget(&self, retry_count: u32) -> bool {
        retry_count < self.max_retries
    }
}

#[cfg(test)]
mod tests {
    use approx::assert_abs_diff_eq;

    use super::*;

    fn policy() -> BackoffPolicy {
        BackoffPolicy {
            max_retries: 3,
            initial_delay_s: 2.0,
            max_delay_s: 60.0,
        }
    }

    #[test]
    fn delays_double_and_clamp() {
        let p = policy();
        assert_abs_diff_eq!(p.delay_for(0), 0.0);
        assert_abs_diff_eq!(p.delay_for(1), 2.0);
        assert_abs_diff_eq!(p.delay_for(2), 4.0);
        assert_abs_diff_eq!(p.delay_for(3), 8.0);
        assert_abs_diff_eq!(p.delay_for(10), 60.0);
        // Huge attempt counts must not overflow to infinity below the clamp.
        assert_abs_diff_eq!(p.delay_for(u32::MAX), 60.0);
    }

    #[test]
    fn budget_boundary() {
        let p = policy();
        assert!(p.within_budget(0));
        assert!(p.within_budget(2));
        assert!(!p.within_budget(3));
        assert!(!p.within_budget(4));
    }
}
