//! Durable at-most-once alert guard and outbound rule notifications.

#![allow(missing_docs)]

use std::sync::Arc;

use crate::capabilities::Capability;
use crate::notify::{NotificationEvent, NotificationManager};
use crate::store::AlertGuardStore;

/// Target used for messages logged by rules.
pub const RULE_LOG_TARGET: &str = "fleet_rule_engine::rules";

/// Guard key for one (device, rule) pair.
#[must_use]
pub fn guard_key(imei: &str, rule: &str) -> String {
    format!("{imei}:{rule}")
}

pub struct AlertsCapability {
    guard: Arc<dyn AlertGuardStore>,
    notifier: Arc<NotificationManager>,
}

impl AlertsCapability {
    pub fn new(guard: Arc<dyn AlertGuardStore>, notifier: Arc<NotificationManager>) -> Self {
        Self { guard, notifier }
    }

    /// Durable lookup. A store failure reads as "not sent".
    pub fn is_alert_sent(&self, imei: &str, rule: &str) -> bool {
        match self.guard.is_alert_sent(imei, rule) {
            Ok(sent) => sent,
            Err(error) => {
                tracing::warn!(key = %guard_key(imei, rule), %error, "alert guard lookup failed, assuming not sent");
                false
            }
        }
    }

    /// Atomic check-and-set; `true` only for the caller that created the mark.
    ///
    /// An unreachable store counts as a win.
    pub fn mark_alert_sent(&self, imei: &str, rule: &str) -> bool {
        match self.guard.try_mark_alert_sent(imei, rule) {
            Ok(won) => {
                if !won {
                    tracing::debug!(key = %guard_key(imei, rule), "alert already marked by another worker");
                }
                won
            }
            Err(error) => {
                tracing::warn!(key = %guard_key(imei, rule), %error, "alert guard mark failed, delivering anyway");
                true
            }
        }
    }

    /// Fire-and-forget alert message to the configured channels.
    pub fn send_telegram(&self, imei: &str, rule: &str, message: &str) {
        self.notifier.notify(&NotificationEvent::RuleAlert {
            imei: imei.to_string(),
            rule: rule.to_string(),
            message: message.to_string(),
        });
    }

    pub fn log(&self, imei: &str, rule: &str, message: &str) {
        tracing::info!(target: RULE_LOG_TARGET, imei, rule, "[RULE] {message}");
    }

    pub fn notifier(&self) -> &Arc<NotificationManager> {
        &self.notifier
    }
}

impl Capability for AlertsCapability {
    fn name(&self) -> &'static str {
        "alerts"
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Barrier;
    use std::thread;

    use super::*;
    use crate::core::errors::{FreError, Result};
    use crate::store::MemoryStore;

    struct UnreachableGuard;

    impl AlertGuardStore for UnreachableGuard {
        fn is_alert_sent(&self, _imei: &str, _rule: &str) -> Result<bool> {
            Err(FreError::Sql {
                context: "test",
                details: "unable to open database file".to_string(),
            })
        }

        fn try_mark_alert_sent(&self, imei: &str, rule: &str) -> Result<bool> {
            self.is_alert_sent(imei, rule)
        }
    }

    fn alerts(guard: Arc<dyn AlertGuardStore>) -> AlertsCapability {
        AlertsCapability::new(guard, Arc::new(NotificationManager::disabled()))
    }

    #[test]
    fn key_format() {
        assert_eq!(guard_key("123", "jammer"), "123:jammer");
    }

    #[test]
    fn concurrent_marks_single_winner() {
        let cap = Arc::new(alerts(Arc::new(MemoryStore::new())));
        let barrier = Arc::new(Barrier::new(16));
        let handles: Vec<_> = (0..16)
            .map(|_| {
                let cap = Arc::clone(&cap);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    cap.mark_alert_sent("123456789012345", "jammer_detection")
                })
            })
            .collect();
        let winners = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|won| *won)
            .count();
        assert_eq!(winners, 1);
        for _ in 0..3 {
            assert!(cap.is_alert_sent("123456789012345", "jammer_detection"));
        }
    }

    #[test]
    fn unreachable_store_policy() {
        let cap = alerts(Arc::new(UnreachableGuard));
        assert!(!cap.is_alert_sent("123", "jammer"));
        assert!(cap.mark_alert_sent("123", "jammer"));
    }

    #[test]
    fn mark_is_permanent() {
        let cap = alerts(Arc::new(MemoryStore::new()));
        assert!(cap.mark_alert_sent("123", "offline"));
        for _ in 0..3 {
            assert!(!cap.mark_alert_sent("123", "offline"));
            assert!(cap.is_alert_sent("123", "offline"));
        }
        assert!(!cap.is_alert_sent("456", "offline"));
    }
}
