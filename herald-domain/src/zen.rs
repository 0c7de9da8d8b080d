//! Do Not Disturb policy.
//!
//! The pipeline consumes zen through the [`ZenModeHelper`] trait; ranking
//! applies the interception verdict to each record, the alert path honors the
//! suppressed-effects bits. [`StandardZenModeHelper`] is the in-tree policy;
//! the trait seam exists so hosts can substitute their own.

use std::sync::RwLock;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::record::{NotificationRecord, CONTACT_AFFINITY};
use crate::types::InterruptionFilter;

/// Categories with meaning to the zen policy.
pub const CATEGORY_CALL: &str = "call";
pub const CATEGORY_MESSAGE: &str = "msg";
pub const CATEGORY_ALARM: &str = "alarm";
pub const CATEGORY_REMINDER: &str = "reminder";

/// Persisted zen configuration (part of the policy document).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ZenConfig {
    #[serde(default)]
    pub interruption_filter: InterruptionFilter,
    /// Suppress lights/fullscreen while the screen is off.
    #[serde(default = "default_true")]
    pub suppress_when_screen_off: bool,
    /// Suppress peeking while the screen is on.
    #[serde(default)]
    pub suppress_when_screen_on: bool,
    /// Priority mode: let calls through.
    #[serde(default = "default_true")]
    pub allow_calls: bool,
    /// Priority mode: calls only from known contacts.
    #[serde(default)]
    pub allow_calls_from_contacts_only: bool,
    /// Priority mode: let messages through.
    #[serde(default)]
    pub allow_messages: bool,
    /// Priority mode: let reminders through.
    #[serde(default = "default_true")]
    pub allow_reminders: bool,
}

fn default_true() -> bool {
    true
}

impl Default for ZenConfig {
    fn default() -> Self {
        Self {
            interruption_filter: InterruptionFilter::All,
            suppress_when_screen_off: true,
            suppress_when_screen_on: false,
            allow_calls: true,
            allow_calls_from_contacts_only: false,
            allow_messages: false,
            allow_reminders: true,
        }
    }
}

/// Interception and suppression signals consumed by ranking and alerts.
pub trait ZenModeHelper: Send + Sync {
    fn should_intercept(&self, record: &NotificationRecord) -> bool;
    fn should_suppress_when_screen_off(&self) -> bool;
    fn should_suppress_when_screen_on(&self) -> bool;
    fn is_call(&self, record: &NotificationRecord) -> bool;
    fn interruption_filter(&self) -> InterruptionFilter;
    fn set_interruption_filter(&self, filter: InterruptionFilter);
    fn config(&self) -> ZenConfig;
    fn set_config(&self, config: ZenConfig);
}

/// The standard policy over a [`ZenConfig`].
pub struct StandardZenModeHelper {
    config: RwLock<ZenConfig>,
}

impl StandardZenModeHelper {
    pub fn new(config: ZenConfig) -> Self {
        Self {
            config: RwLock::new(config),
        }
    }

    fn read(&self) -> ZenConfig {
        match self.config.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => {
                warn!("zen config lock poisoned; using last written value");
                poisoned.into_inner().clone()
            }
        }
    }
}

impl Default for StandardZenModeHelper {
    fn default() -> Self {
        Self::new(ZenConfig::default())
    }
}

impl ZenModeHelper for StandardZenModeHelper {
    fn should_intercept(&self, record: &NotificationRecord) -> bool {
        let config = self.read();
        let category = record.sbn.notification.category.as_deref();
        match config.interruption_filter {
            InterruptionFilter::All => false,
            InterruptionFilter::None => true,
            InterruptionFilter::Alarms => {
                !(category == Some(CATEGORY_ALARM) || record.channel.bypass_dnd)
            }
            InterruptionFilter::Priority => {
                if record.channel.bypass_dnd {
                    return false;
                }
                match category {
                    Some(CATEGORY_CALL) if config.allow_calls => {
                        config.allow_calls_from_contacts_only
                            && record.contact_affinity < CONTACT_AFFINITY
                    }
                    Some(CATEGORY_MESSAGE) if config.allow_messages => false,
                    Some(CATEGORY_REMINDER) if config.allow_reminders => false,
                    Some(CATEGORY_ALARM) => false,
                    _ => true,
                }
            }
        }
    }

    fn should_suppress_when_screen_off(&self) -> bool {
        self.read().suppress_when_screen_off
    }

    fn should_suppress_when_screen_on(&self) -> bool {
        self.read().suppress_when_screen_on
    }

    fn is_call(&self, record: &NotificationRecord) -> bool {
        record.sbn.notification.category.as_deref() == Some(CATEGORY_CALL)
    }

    fn interruption_filter(&self) -> InterruptionFilter {
        self.read().interruption_filter
    }

    fn set_interruption_filter(&self, filter: InterruptionFilter) {
        if let Ok(mut guard) = self.config.write() {
            guard.interruption_filter = filter;
        }
    }

    fn config(&self) -> ZenConfig {
        self.read()
    }

    fn set_config(&self, config: ZenConfig) {
        if let Ok(mut guard) = self.config.write() {
            *guard = config;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::STARRED_CONTACT_AFFINITY;
    use crate::types::{
        Importance, Notification, NotificationChannel, PostedNotification, UserId,
    };
    use chrono::Utc;

    fn record(category: Option<&str>, bypass_dnd: bool) -> NotificationRecord {
        let sbn = PostedNotification::new(
            "com.example",
            "com.example",
            1,
            None,
            10001,
            100,
            UserId(0),
            Notification {
                category: category.map(String::from),
                ..Default::default()
            },
            Utc::now(),
        );
        let mut channel = NotificationChannel::new("c", "C", Importance::Default);
        channel.bypass_dnd = bypass_dnd;
        NotificationRecord::new(sbn, channel)
    }

    #[test]
    fn filter_all_intercepts_nothing() {
        let zen = StandardZenModeHelper::default();
        assert!(!zen.should_intercept(&record(None, false)));
    }

    #[test]
    fn filter_none_intercepts_everything() {
        let zen = StandardZenModeHelper::default();
        zen.set_interruption_filter(InterruptionFilter::None);
        assert!(zen.should_intercept(&record(Some(CATEGORY_CALL), false)));
        assert!(zen.should_intercept(&record(None, true)));
    }

    #[test]
    fn alarms_mode_lets_alarms_and_bypass_through() {
        let zen = StandardZenModeHelper::default();
        zen.set_interruption_filter(InterruptionFilter::Alarms);
        assert!(!zen.should_intercept(&record(Some(CATEGORY_ALARM), false)));
        assert!(!zen.should_intercept(&record(None, true)));
        assert!(zen.should_intercept(&record(Some(CATEGORY_MESSAGE), false)));
    }

    #[test]
    fn priority_mode_honors_call_policy() {
        let zen = StandardZenModeHelper::new(ZenConfig {
            interruption_filter: InterruptionFilter::Priority,
            allow_calls: true,
            allow_calls_from_contacts_only: true,
            ..Default::default()
        });
        let stranger = record(Some(CATEGORY_CALL), false);
        assert!(zen.should_intercept(&stranger));

        let mut friend = record(Some(CATEGORY_CALL), false);
        friend.contact_affinity = STARRED_CONTACT_AFFINITY;
        assert!(!zen.should_intercept(&friend));
    }

    #[test]
    fn priority_mode_blocks_messages_unless_allowed() {
        let zen = StandardZenModeHelper::new(ZenConfig {
            interruption_filter: InterruptionFilter::Priority,
            allow_messages: false,
            ..Default::default()
        });
        assert!(zen.should_intercept(&record(Some(CATEGORY_MESSAGE), false)));

        zen.set_config(ZenConfig {
            interruption_filter: InterruptionFilter::Priority,
            allow_messages: true,
            ..Default::default()
        });
        assert!(!zen.should_intercept(&record(Some(CATEGORY_MESSAGE), false)));
    }

    #[test]
    fn call_detection_uses_the_category() {
        let zen = StandardZenModeHelper::default();
        assert!(zen.is_call(&record(Some(CATEGORY_CALL), false)));
        assert!(!zen.is_call(&record(Some(CATEGORY_MESSAGE), false)));
    }

    #[test]
    fn config_round_trips_through_serde() {
        let config = ZenConfig {
            interruption_filter: InterruptionFilter::Priority,
            allow_messages: true,
            ..Default::default()
        };
        let raw = toml::to_string(&config).unwrap();
        let parsed: ZenConfig = toml::from_str(&raw).unwrap();
        assert_eq!(parsed, config);
    }
}
