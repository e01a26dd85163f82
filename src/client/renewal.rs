//! Automatic circuit renewal policy

use std::time::Duration;

use crate::models::HttpSettings;

/// When a client should ask its Tor process for clean circuits
///
/// Checked after every request; either threshold is enough.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RenewalPolicy {
    /// Renew once this much time passed since the last renewal
    pub after: Option<Duration>,
    /// Renew when the request count is a multiple of this
    pub every: Option<u64>,
}

impl RenewalPolicy {
    pub fn from_settings(settings: &HttpSettings) -> Self {
        Self {
            after: settings
                .renew_circuits_after_secs
                .filter(|secs| *secs > 0)
                .map(Duration::from_secs),
            every: settings.renew_circuits_after_requests.filter(|n| *n > 0),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.after.is_some() || self.every.is_some()
    }

    /// `request_count` includes the request that just finished
    pub fn is_due(&self, request_count: u64, since_last_renewal: Duration) -> bool {
        let by_time = self.after.is_some_and(|after| since_last_renewal >= after);
        let by_count = self
            .every
            .is_some_and(|every| request_count > 0 && request_count % every == 0);
        by_time || by_count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disabled_by_default() {
        let policy = RenewalPolicy::from_settings(&HttpSettings::default());
        assert!(!policy.is_enabled());
        assert!(!policy.is_due(5, Duration::from_secs(3600)));
    }

    #[test]
    fn test_request_count_threshold() {
        let policy = RenewalPolicy {
            every: Some(3),
            ..RenewalPolicy::default()
        };

        let due: Vec<u64> = (1..=7)
            .filter(|n| policy.is_due(*n, Duration::ZERO))
            .collect();
        assert_eq!(due, vec![3, 6]);
    }

    #[test]
    fn test_elapsed_threshold() {
        let policy = RenewalPolicy {
            after: Some(Duration::from_secs(10)),
            ..RenewalPolicy::default()
        };

        assert!(!policy.is_due(1, Duration::from_secs(9)));
        assert!(policy.is_due(1, Duration::from_secs(10)));
    }

    #[test]
    fn test_zero_thresholds_are_ignored() {
        let settings = HttpSettings {
            renew_circuits_after_secs: Some(0),
            renew_circuits_after_requests: Some(0),
            ..HttpSettings::default()
        };
        assert!(!RenewalPolicy::from_settings(&settings).is_enabled());
    }
}
