//! The in-memory record for one enqueued or posted notification.

use crate::types::{
    ArchivedNotification, CancelReason, Importance, LightSpec, NotificationChannel,
    NotificationKey, PostedNotification, SnoozeCriterion, SuppressedEffects, UserId, Visibility,
};

/// Affinity assigned when no contact lookup has resolved.
pub const NONE_AFFINITY: f32 = 0.0;
/// Affinity for a person found in the user's contacts.
pub const CONTACT_AFFINITY: f32 = 0.5;
/// Affinity for a starred contact.
pub const STARRED_CONTACT_AFFINITY: f32 = 1.0;

/// One (package, user, tag, id) notification instance. Replaced wholesale on
/// update; ranking fields mutate in place as extractors and assistants run.
#[derive(Debug, Clone)]
pub struct NotificationRecord {
    pub sbn: PostedNotification,
    pub channel: NotificationChannel,

    // Mutable ranking state.
    pub importance: Importance,
    pub importance_explanation: Option<String>,
    pub intercepted: bool,
    pub suppressed_effects: SuppressedEffects,
    pub visibility_override: Option<Visibility>,
    pub people_override: Vec<String>,
    pub snooze_criteria: Vec<SnoozeCriterion>,
    pub contact_affinity: f32,
    pub assistant_rank: Option<i32>,
    pub show_badge: bool,

    /// Set once a terminal cancel has claimed this record; an enqueued record
    /// with this flag set must never reach the posted list.
    pub is_canceled: bool,
    /// True when this record replaced an existing posted record.
    pub is_update: bool,
}

impl NotificationRecord {
    pub fn new(sbn: PostedNotification, channel: NotificationChannel) -> Self {
        let importance = channel.importance;
        let show_badge = channel.show_badge;
        Self {
            sbn,
            channel,
            importance,
            importance_explanation: None,
            intercepted: false,
            suppressed_effects: SuppressedEffects::default(),
            visibility_override: None,
            people_override: Vec::new(),
            snooze_criteria: Vec::new(),
            contact_affinity: NONE_AFFINITY,
            assistant_rank: None,
            show_badge,
            is_canceled: false,
            is_update: false,
        }
    }

    pub fn key(&self) -> &NotificationKey {
        self.sbn.key()
    }

    pub fn user(&self) -> UserId {
        self.sbn.user
    }

    pub fn package(&self) -> &str {
        &self.sbn.package
    }

    pub fn group_key(&self) -> String {
        self.sbn.group_key()
    }

    /// Carries forward the signals a replaced record had already earned, so
    /// an update does not flicker back to defaults while extractors rerun.
    pub fn copy_ranking_information(&mut self, old: &NotificationRecord) {
        self.contact_affinity = old.contact_affinity;
        self.intercepted = old.intercepted;
        self.visibility_override = old.visibility_override;
        self.assistant_rank = old.assistant_rank;
        self.people_override = old.people_override.clone();
        self.snooze_criteria = old.snooze_criteria.clone();
    }

    /// Channel configuration wins over the payload for effects; the payload
    /// value is a fallback for channels that never configured one.
    pub fn effective_sound(&self) -> Option<String> {
        self.channel
            .sound
            .clone()
            .or_else(|| self.sbn.notification.sound.clone())
    }

    pub fn effective_vibration(&self) -> Option<Vec<u64>> {
        self.channel
            .vibration
            .clone()
            .or_else(|| self.sbn.notification.vibration.clone())
    }

    pub fn effective_light(&self) -> Option<LightSpec> {
        self.channel.light.or(self.sbn.notification.light)
    }

    pub fn archived(&self, reason: CancelReason) -> ArchivedNotification {
        ArchivedNotification::from_posted(&self.sbn, reason)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Notification;
    use chrono::Utc;

    fn record(channel: NotificationChannel, n: Notification) -> NotificationRecord {
        let sbn = PostedNotification::new(
            "com.example",
            "com.example",
            1,
            None,
            10001,
            100,
            UserId(0),
            n,
            Utc::now(),
        );
        NotificationRecord::new(sbn, channel)
    }

    #[test]
    fn importance_seeds_from_channel() {
        let channel = NotificationChannel::new("c", "C", Importance::High);
        let r = record(channel, Notification::default());
        assert_eq!(r.importance, Importance::High);
        assert!(!r.is_canceled);
        assert!(!r.is_update);
    }

    #[test]
    fn channel_sound_wins_over_payload() {
        let mut channel = NotificationChannel::new("c", "C", Importance::Default);
        channel.sound = Some("channel.ogg".into());
        let r = record(
            channel,
            Notification {
                sound: Some("payload.ogg".into()),
                ..Default::default()
            },
        );
        assert_eq!(r.effective_sound().as_deref(), Some("channel.ogg"));
    }

    #[test]
    fn payload_sound_is_the_fallback() {
        let channel = NotificationChannel::new("c", "C", Importance::Default);
        let r = record(
            channel,
            Notification {
                sound: Some("payload.ogg".into()),
                ..Default::default()
            },
        );
        assert_eq!(r.effective_sound().as_deref(), Some("payload.ogg"));
    }

    #[test]
    fn ranking_information_carries_over() {
        let channel = NotificationChannel::new("c", "C", Importance::Default);
        let mut old = record(channel.clone(), Notification::default());
        old.contact_affinity = STARRED_CONTACT_AFFINITY;
        old.intercepted = true;
        old.assistant_rank = Some(3);
        old.people_override = vec!["contact:1".into()];

        let mut fresh = record(channel, Notification::default());
        fresh.copy_ranking_information(&old);
        assert_eq!(fresh.contact_affinity, STARRED_CONTACT_AFFINITY);
        assert!(fresh.intercepted);
        assert_eq!(fresh.assistant_rank, Some(3));
        assert_eq!(fresh.people_override, vec!["contact:1".to_string()]);
    }
}
