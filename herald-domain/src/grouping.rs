//! Auto-bundling of ungrouped notifications.
//!
//! Tracks how many ungrouped notifications each (user, package) has posted.
//! Once the count reaches the configured trigger, every one of them is tagged
//! with the reserved override key and a synthetic summary is requested. The
//! helper returns [`GroupAction`]s for the pipeline to execute instead of
//! calling back into it, so no reference cycle exists between the two.

use std::collections::HashMap;

use tracing::debug;

use crate::types::{NotificationFlags, NotificationKey, PostedNotification, UserId};

/// Reserved group key for synthesized bundles.
pub const AUTOGROUP_KEY: &str = "ranker_group";

/// What the pipeline must do to keep bundling consistent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GroupAction {
    /// Tag this record with the reserved override key.
    Autogroup(NotificationKey),
    /// Clear this record's override key (the app grouped it itself).
    Unautogroup(NotificationKey),
    /// Post the synthetic summary for this package if none exists yet.
    PostSummary {
        user: UserId,
        package: String,
        triggering_key: NotificationKey,
    },
    /// The last ungrouped record is gone; cancel the synthetic summary.
    CancelSummary { user: UserId, package: String },
}

#[derive(Debug)]
pub struct GroupHelper {
    autogroup_at_count: usize,
    /// Insertion-ordered ungrouped keys per (user, package).
    ungrouped: HashMap<(UserId, String), Vec<NotificationKey>>,
}

impl GroupHelper {
    pub fn new(autogroup_at_count: usize) -> Self {
        Self {
            autogroup_at_count,
            ungrouped: HashMap::new(),
        }
    }

    pub fn on_notification_posted(&mut self, sbn: &PostedNotification) -> Vec<GroupAction> {
        if sbn
            .notification
            .flags
            .contains(NotificationFlags::AUTOGROUP_SUMMARY)
        {
            // Our own synthetic summary; not a candidate for bundling.
            return Vec::new();
        }
        if sbn.is_app_group() {
            // The app grouped it; if we had bundled an earlier instance,
            // retract that.
            return self.maybe_ungroup(sbn, false);
        }

        let slot = self
            .ungrouped
            .entry((sbn.user, sbn.package.clone()))
            .or_default();
        if !slot.contains(sbn.key()) {
            slot.push(sbn.key().clone());
        }
        if slot.len() >= self.autogroup_at_count {
            debug!(
                package = %sbn.package,
                count = slot.len(),
                "ungrouped count reached autogroup trigger"
            );
            let mut actions: Vec<GroupAction> =
                slot.iter().cloned().map(GroupAction::Autogroup).collect();
            actions.push(GroupAction::PostSummary {
                user: sbn.user,
                package: sbn.package.clone(),
                triggering_key: sbn.key().clone(),
            });
            actions
        } else {
            Vec::new()
        }
    }

    pub fn on_notification_removed(&mut self, sbn: &PostedNotification) -> Vec<GroupAction> {
        if sbn
            .notification
            .flags
            .contains(NotificationFlags::AUTOGROUP_SUMMARY)
        {
            return Vec::new();
        }
        self.maybe_ungroup(sbn, true)
    }

    /// Shared teardown: the key stops being an ungrouped member, either
    /// because the notification is gone or because the app now groups it.
    fn maybe_ungroup(&mut self, sbn: &PostedNotification, notification_gone: bool) -> Vec<GroupAction> {
        let entry_key = (sbn.user, sbn.package.clone());
        let Some(slot) = self.ungrouped.get_mut(&entry_key) else {
            return Vec::new();
        };
        let mut actions = Vec::new();
        if let Some(pos) = slot.iter().position(|k| k == sbn.key()) {
            slot.remove(pos);
            if !notification_gone {
                // Still posted; strip the override we added.
                actions.push(GroupAction::Unautogroup(sbn.key().clone()));
            }
        }
        if slot.is_empty() {
            self.ungrouped.remove(&entry_key);
            actions.push(GroupAction::CancelSummary {
                user: sbn.user,
                package: sbn.package.clone(),
            });
        }
        actions
    }

    #[cfg(test)]
    fn ungrouped_count(&self, user: UserId, package: &str) -> usize {
        self.ungrouped
            .get(&(user, package.to_string()))
            .map_or(0, Vec::len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Notification;
    use chrono::Utc;
    use pretty_assertions::assert_eq;

    fn sbn(pkg: &str, id: i32, group: Option<&str>) -> PostedNotification {
        PostedNotification::new(
            pkg,
            pkg,
            id,
            None,
            10001,
            100,
            UserId(0),
            Notification {
                group: group.map(String::from),
                ..Default::default()
            },
            Utc::now(),
        )
    }

    #[test]
    fn first_ungrouped_post_does_nothing() {
        let mut helper = GroupHelper::new(2);
        assert!(helper.on_notification_posted(&sbn("com.a", 1, None)).is_empty());
        assert_eq!(helper.ungrouped_count(UserId(0), "com.a"), 1);
    }

    #[test]
    fn second_ungrouped_post_triggers_bundle() {
        let mut helper = GroupHelper::new(2);
        let first = sbn("com.a", 1, None);
        let second = sbn("com.a", 2, None);
        helper.on_notification_posted(&first);
        let actions = helper.on_notification_posted(&second);
        assert_eq!(
            actions,
            vec![
                GroupAction::Autogroup(first.key().clone()),
                GroupAction::Autogroup(second.key().clone()),
                GroupAction::PostSummary {
                    user: UserId(0),
                    package: "com.a".into(),
                    triggering_key: second.key().clone(),
                },
            ]
        );
    }

    #[test]
    fn app_grouped_posts_never_count() {
        let mut helper = GroupHelper::new(2);
        helper.on_notification_posted(&sbn("com.a", 1, Some("g")));
        helper.on_notification_posted(&sbn("com.a", 2, Some("g")));
        assert_eq!(helper.ungrouped_count(UserId(0), "com.a"), 0);
    }

    #[test]
    fn removal_keeps_summary_while_members_remain() {
        let mut helper = GroupHelper::new(2);
        let first = sbn("com.a", 1, None);
        let second = sbn("com.a", 2, None);
        helper.on_notification_posted(&first);
        helper.on_notification_posted(&second);

        let actions = helper.on_notification_removed(&first);
        assert!(actions.is_empty(), "one member remains, keep the summary");

        let actions = helper.on_notification_removed(&second);
        assert_eq!(
            actions,
            vec![GroupAction::CancelSummary {
                user: UserId(0),
                package: "com.a".into(),
            }]
        );
    }

    #[test]
    fn app_adopting_a_group_retracts_override() {
        let mut helper = GroupHelper::new(2);
        let first = sbn("com.a", 1, None);
        let second = sbn("com.a", 2, None);
        helper.on_notification_posted(&first);
        helper.on_notification_posted(&second);

        // The app updates id 1 with a real group.
        let updated = sbn("com.a", 1, Some("real"));
        let actions = helper.on_notification_posted(&updated);
        assert_eq!(actions, vec![GroupAction::Unautogroup(updated.key().clone())]);
        assert_eq!(helper.ungrouped_count(UserId(0), "com.a"), 1);
    }

    #[test]
    fn synthetic_summary_is_invisible_to_the_helper() {
        let mut helper = GroupHelper::new(2);
        let mut summary = sbn("com.a", i32::MAX, Some(AUTOGROUP_KEY));
        summary
            .notification
            .flags
            .insert(NotificationFlags::AUTOGROUP_SUMMARY);
        assert!(helper.on_notification_posted(&summary).is_empty());
        assert!(helper.on_notification_removed(&summary).is_empty());
    }

    #[test]
    fn users_are_bundled_independently() {
        let mut helper = GroupHelper::new(2);
        let user0 = sbn("com.a", 1, None);
        let mut user1 = PostedNotification::new(
            "com.a",
            "com.a",
            1,
            None,
            10001,
            100,
            UserId(10),
            Notification::default(),
            Utc::now(),
        );
        user1.notification.group = None;
        helper.on_notification_posted(&user0);
        let actions = helper.on_notification_posted(&user1);
        assert!(actions.is_empty(), "counts must not mix across users");
    }

    #[test]
    fn duplicate_post_of_same_key_counts_once() {
        let mut helper = GroupHelper::new(2);
        let n = sbn("com.a", 1, None);
        helper.on_notification_posted(&n);
        let actions = helper.on_notification_posted(&n);
        assert!(actions.is_empty());
        assert_eq!(helper.ungrouped_count(UserId(0), "com.a"), 1);
    }
}
