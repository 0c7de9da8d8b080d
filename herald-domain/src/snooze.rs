//! Parking lot for snoozed notifications.
//!
//! The helper is passive storage keyed by notification key (which already
//! embeds user and package). Wake scheduling lives in the pipeline: a timed
//! snooze arms a sleep task that asks for a repost, and the presence check in
//! [`SnoozeHelper::take`] makes a stale wake harmless.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::record::NotificationRecord;
use crate::types::{NotificationKey, UserId};

/// What brings a snoozed record back.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum WakeCondition {
    /// Repost after this many milliseconds.
    TimedMs(u64),
    /// Repost when the named context criterion fires or an assistant
    /// unsnoozes the record.
    Criterion(String),
    /// No duration given; only an explicit unsnooze brings it back.
    Unspecified,
}

#[derive(Debug)]
pub struct SnoozedRecord {
    pub record: NotificationRecord,
    pub condition: WakeCondition,
}

#[derive(Debug, Default)]
pub struct SnoozeHelper {
    parked: HashMap<NotificationKey, SnoozedRecord>,
}

impl SnoozeHelper {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_snoozed(&self, key: &NotificationKey) -> bool {
        self.parked.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.parked.len()
    }

    pub fn is_empty(&self) -> bool {
        self.parked.is_empty()
    }

    pub fn park(&mut self, record: NotificationRecord, condition: WakeCondition) {
        let key = record.key().clone();
        self.parked.insert(key, SnoozedRecord { record, condition });
    }

    /// Folds an enqueue for a snoozed key into the parked copy: the payload
    /// updates in place, the wake condition is untouched, nothing posts now.
    pub fn update(&mut self, record: NotificationRecord) -> bool {
        match self.parked.get_mut(record.key()) {
            Some(parked) => {
                parked.record = record;
                true
            }
            None => false,
        }
    }

    pub fn take(&mut self, key: &NotificationKey) -> Option<SnoozedRecord> {
        self.parked.remove(key)
    }

    /// Drops a parked record without reposting (package removal, cancel-all).
    pub fn cancel(&mut self, key: &NotificationKey) -> Option<SnoozedRecord> {
        self.parked.remove(key)
    }

    /// Keys parked behind the given context criterion.
    pub fn keys_for_criterion(&self, criterion_id: &str) -> Vec<NotificationKey> {
        self.parked
            .iter()
            .filter(|(_, s)| matches!(&s.condition, WakeCondition::Criterion(id) if id == criterion_id))
            .map(|(k, _)| k.clone())
            .collect()
    }

    /// Keys of every parked record for one (user, package).
    pub fn keys_for_package(&self, user: UserId, package: &str) -> Vec<NotificationKey> {
        self.parked
            .values()
            .filter(|s| s.record.user() == user && s.record.package() == package)
            .map(|s| s.record.key().clone())
            .collect()
    }

    /// Keys of every parked record for one user, any package.
    pub fn keys_for_user(&self, user: UserId) -> Vec<NotificationKey> {
        self.parked
            .values()
            .filter(|s| user.is_all() || s.record.user() == user)
            .map(|s| s.record.key().clone())
            .collect()
    }

    /// A parked group summary for the given group key, if any. Used to bring
    /// a summary back when one of its children is enqueued again.
    pub fn parked_group_summary(
        &self,
        user: UserId,
        package: &str,
        group_key: &str,
    ) -> Option<NotificationKey> {
        self.parked
            .values()
            .filter(|s| {
                s.record.user() == user
                    && s.record.package() == package
                    && s.record.sbn.notification.is_group_summary()
                    && s.record.group_key() == group_key
            })
            .map(|s| s.record.key().clone())
            .next()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{
        Importance, Notification, NotificationChannel, PostedNotification,
    };
    use chrono::Utc;

    fn record(pkg: &str, id: i32, group: Option<&str>, summary: bool) -> NotificationRecord {
        let sbn = PostedNotification::new(
            pkg,
            pkg,
            id,
            None,
            10001,
            100,
            UserId(0),
            Notification {
                title: format!("n{id}"),
                group: group.map(String::from),
                group_summary: summary,
                ..Default::default()
            },
            Utc::now(),
        );
        NotificationRecord::new(sbn, NotificationChannel::new("c", "C", Importance::Default))
    }

    #[test]
    fn park_take_round_trip() {
        let mut helper = SnoozeHelper::new();
        let r = record("com.a", 1, None, false);
        let key = r.key().clone();
        helper.park(r, WakeCondition::TimedMs(5000));
        assert!(helper.is_snoozed(&key));
        let parked = helper.take(&key).unwrap();
        assert_eq!(parked.condition, WakeCondition::TimedMs(5000));
        assert!(!helper.is_snoozed(&key));
        assert!(helper.take(&key).is_none());
    }

    #[test]
    fn update_folds_payload_and_keeps_condition() {
        let mut helper = SnoozeHelper::new();
        let r = record("com.a", 1, None, false);
        let key = r.key().clone();
        helper.park(r, WakeCondition::Criterion("ctx".into()));

        let mut newer = record("com.a", 1, None, false);
        newer.sbn.notification.title = "updated".into();
        assert!(helper.update(newer));

        let parked = helper.take(&key).unwrap();
        assert_eq!(parked.record.sbn.notification.title, "updated");
        assert_eq!(parked.condition, WakeCondition::Criterion("ctx".into()));
    }

    #[test]
    fn update_of_unparked_key_is_a_noop() {
        let mut helper = SnoozeHelper::new();
        assert!(!helper.update(record("com.a", 9, None, false)));
    }

    #[test]
    fn criterion_lookup_finds_only_matching() {
        let mut helper = SnoozeHelper::new();
        helper.park(record("com.a", 1, None, false), WakeCondition::Criterion("drive".into()));
        helper.park(record("com.a", 2, None, false), WakeCondition::Criterion("home".into()));
        helper.park(record("com.a", 3, None, false), WakeCondition::TimedMs(100));
        let keys = helper.keys_for_criterion("drive");
        assert_eq!(keys.len(), 1);
    }

    #[test]
    fn parked_summary_lookup() {
        let mut helper = SnoozeHelper::new();
        let summary = record("com.a", 100, Some("g"), true);
        let group_key = summary.group_key();
        helper.park(summary, WakeCondition::TimedMs(100));
        helper.park(record("com.a", 1, Some("g"), false), WakeCondition::TimedMs(100));
        let found = helper.parked_group_summary(UserId(0), "com.a", &group_key);
        assert!(found.is_some());
        assert!(helper
            .parked_group_summary(UserId(0), "com.b", &group_key)
            .is_none());
    }

    #[test]
    fn package_sweep_collects_all_users_records() {
        let mut helper = SnoozeHelper::new();
        helper.park(record("com.a", 1, None, false), WakeCondition::Unspecified);
        helper.park(record("com.a", 2, None, false), WakeCondition::Unspecified);
        helper.park(record("com.b", 3, None, false), WakeCondition::Unspecified);
        assert_eq!(helper.keys_for_package(UserId(0), "com.a").len(), 2);
        assert_eq!(helper.keys_for_package(UserId(1), "com.a").len(), 0);
    }
}
