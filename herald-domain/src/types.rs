//! Domain types shared across the pipeline.
//!
//! Cross-references between records are expressed as string keys
//! ([`NotificationKey`], group keys), never as shared pointers; the stores in
//! [`crate::store`] are the only owners of record data.

use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A platform user. `UserId::ALL` is the cross-user wildcard used by system
/// callers broadcasting to every profile.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
pub struct UserId(pub i32);

impl UserId {
    pub const ALL: UserId = UserId(-1);

    pub fn is_all(self) -> bool {
        self == Self::ALL
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Maps users into profile groups so listener visibility can treat a work
/// profile and its parent as one audience.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProfileMap {
    groups: HashMap<UserId, u32>,
}

impl ProfileMap {
    pub fn set_group(&mut self, user: UserId, group: u32) {
        self.groups.insert(user, group);
    }

    pub fn same_profile_group(&self, a: UserId, b: UserId) -> bool {
        if a == b {
            return true;
        }
        match (self.groups.get(&a), self.groups.get(&b)) {
            (Some(ga), Some(gb)) => ga == gb,
            _ => false,
        }
    }
}

/// Stable identifier for one notification instance, derived from
/// (user, package, tag, id). Synthetic summaries reuse the scheme with the
/// reserved autogroup tag.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NotificationKey(String);

impl NotificationKey {
    pub fn for_notification(user: UserId, package: &str, tag: Option<&str>, id: i32) -> Self {
        Self(format!("{user}|{package}|{}|{id}", tag.unwrap_or("")))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NotificationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Channel/record importance, ordered weakest to strongest.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    Default,
)]
#[serde(rename_all = "kebab-case")]
pub enum Importance {
    /// Blocked: the user or the app has turned the channel off entirely.
    None,
    Min,
    Low,
    #[default]
    Default,
    High,
    Max,
}

impl Importance {
    /// Records below this never buzz, beep, or blink.
    pub fn is_interruptive(self) -> bool {
        self >= Importance::Default
    }
}

/// Lockscreen visibility.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Visibility {
    Secret,
    Private,
    Public,
}

/// Behavior flags carried on the payload. A plain bitset: the set is closed
/// and the values travel through serialization and flag-merge operations.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct NotificationFlags(pub u32);

impl NotificationFlags {
    pub const FOREGROUND_SERVICE: NotificationFlags = NotificationFlags(1 << 0);
    pub const ONGOING_EVENT: NotificationFlags = NotificationFlags(1 << 1);
    pub const NO_CLEAR: NotificationFlags = NotificationFlags(1 << 2);
    pub const ONLY_ALERT_ONCE: NotificationFlags = NotificationFlags(1 << 3);
    pub const INSISTENT: NotificationFlags = NotificationFlags(1 << 4);
    pub const AUTOGROUP_SUMMARY: NotificationFlags = NotificationFlags(1 << 5);
    pub const LOCAL_ONLY: NotificationFlags = NotificationFlags(1 << 6);

    pub fn contains(self, other: NotificationFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn insert(&mut self, other: NotificationFlags) {
        self.0 |= other.0;
    }

    pub fn remove(&mut self, other: NotificationFlags) {
        self.0 &= !other.0;
    }

    pub fn intersects(self, other: NotificationFlags) -> bool {
        self.0 & other.0 != 0
    }
}

/// Which members of a group are allowed to alert.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum GroupAlert {
    #[default]
    All,
    Summary,
    Children,
}

/// Why a record left the posted (or enqueued) state. Reported to listeners
/// with the removal event and recorded in stats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CancelReason {
    AppCancel,
    AppCancelAll,
    UserCancel,
    UserCancelAll,
    ListenerCancel,
    ListenerCancelAll,
    GroupSummaryCanceled,
    PackageRemoved,
    UserStopped,
    Error,
    Timeout,
    Snoozed,
    Unautobundled,
}

impl CancelReason {
    /// A snoozed record is expected back; everything else is a real removal.
    pub fn is_terminal(self) -> bool {
        self != CancelReason::Snoozed
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RingerMode {
    #[default]
    Normal,
    Vibrate,
    Silent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum InterruptionFilter {
    #[default]
    All,
    Priority,
    Alarms,
    None,
}

/// Hints contributed by listeners; aggregated by OR over the live set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ListenerHints(pub u32);

impl ListenerHints {
    pub const DISABLE_EFFECTS: ListenerHints = ListenerHints(1 << 0);
    pub const DISABLE_NOTIFICATION_EFFECTS: ListenerHints = ListenerHints(1 << 1);
    pub const DISABLE_CALL_EFFECTS: ListenerHints = ListenerHints(1 << 2);

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn contains(self, other: ListenerHints) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn union(self, other: ListenerHints) -> ListenerHints {
        ListenerHints(self.0 | other.0)
    }

    /// Whether the aggregate suppresses effects for `is_call` records.
    pub fn suppresses(self, is_call: bool) -> bool {
        if self.contains(Self::DISABLE_EFFECTS) {
            return true;
        }
        if is_call {
            self.contains(Self::DISABLE_CALL_EFFECTS)
        } else {
            self.contains(Self::DISABLE_NOTIFICATION_EFFECTS)
        }
    }
}

/// Visual effects zen suppresses for an intercepted record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SuppressedEffects(pub u32);

impl SuppressedEffects {
    pub const SCREEN_OFF: SuppressedEffects = SuppressedEffects(1 << 0);
    pub const SCREEN_ON: SuppressedEffects = SuppressedEffects(1 << 1);

    pub fn contains(self, other: SuppressedEffects) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn union(self, other: SuppressedEffects) -> SuppressedEffects {
        SuppressedEffects(self.0 | other.0)
    }
}

/// Payload size preference for one bound service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Trim {
    #[default]
    Full,
    Light,
}

/// A condition under which an assistant-snoozed record should reappear.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnoozeCriterion {
    pub id: String,
    pub explanation: String,
    pub confirmation: String,
}

/// Ranking signals an assistant may attach to an enqueued record during the
/// adjustment window.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Adjustment {
    pub package: String,
    pub key: Option<NotificationKey>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub explanation: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub people: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snooze_criteria: Option<Vec<SnoozeCriterion>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rank: Option<i32>,
}

/// LED request: ARGB color plus blink timing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LightSpec {
    pub color: u32,
    pub on_ms: u32,
    pub off_ms: u32,
}

/// Per-channel configuration owned by the ranking config store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationChannel {
    pub id: String,
    pub name: String,
    pub importance: Importance,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub visibility_override: Option<Visibility>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sound: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vibration: Option<Vec<u64>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub light: Option<LightSpec>,
    #[serde(default = "default_true")]
    pub show_badge: bool,
    #[serde(default)]
    pub bypass_dnd: bool,
}

fn default_true() -> bool {
    true
}

impl NotificationChannel {
    pub fn new(id: impl Into<String>, name: impl Into<String>, importance: Importance) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            importance,
            visibility_override: None,
            sound: None,
            vibration: None,
            light: None,
            show_badge: true,
            bypass_dnd: false,
        }
    }
}

/// The raw notification payload an app posts. Everything presentation-level
/// is out of scope; this carries only what policy decisions consume.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Notification {
    pub channel_id: String,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    /// Explicit group key assigned by the app.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,
    #[serde(default)]
    pub group_summary: bool,
    #[serde(default)]
    pub group_alert: GroupAlert,
    #[serde(default)]
    pub flags: NotificationFlags,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sound: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vibration: Option<Vec<u64>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub light: Option<LightSpec>,
    /// Auto-cancel after this many milliseconds once posted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_after_ms: Option<u64>,
    /// People (contact URIs) this notification is about.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub people: Vec<String>,
    /// Free-form hints passed through to listeners (sound names, image
    /// paths). The pipeline itself does not interpret them.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub hints: HashMap<String, serde_json::Value>,
    /// Opaque token reported to the delete hook sink when the user dismisses
    /// the notification.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delete_hook: Option<String>,
}

impl Notification {
    /// True when this payload claims to summarize an explicit group.
    pub fn is_group_summary(&self) -> bool {
        self.group_summary
    }

    /// Whether grouping semantics mute this record's own alert.
    pub fn suppress_alerting_due_to_grouping(&self) -> bool {
        if self.group_summary {
            self.group_alert == GroupAlert::Children
        } else {
            self.group_alert == GroupAlert::Summary
        }
    }
}

/// One posted notification instance as seen by listeners: the payload plus
/// its addressing and override state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PostedNotification {
    pub package: String,
    pub op_package: String,
    pub id: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
    pub uid: u32,
    pub pid: u32,
    pub user: UserId,
    pub notification: Notification,
    pub post_time: DateTime<Utc>,
    /// Set by auto-bundling; mutually exclusive with summary-map membership.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub override_group_key: Option<String>,
    key: NotificationKey,
}

impl PostedNotification {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        package: impl Into<String>,
        op_package: impl Into<String>,
        id: i32,
        tag: Option<String>,
        uid: u32,
        pid: u32,
        user: UserId,
        notification: Notification,
        post_time: DateTime<Utc>,
    ) -> Self {
        let package = package.into();
        let key = NotificationKey::for_notification(user, &package, tag.as_deref(), id);
        Self {
            package,
            op_package: op_package.into(),
            id,
            tag,
            uid,
            pid,
            user,
            notification,
            post_time,
            override_group_key: None,
            key,
        }
    }

    pub fn key(&self) -> &NotificationKey {
        &self.key
    }

    /// The group this record sorts and cascades under. Override (autogroup)
    /// wins over the app's explicit group; an ungrouped record forms a
    /// singleton group identified by its own key.
    pub fn group_key(&self) -> String {
        let group = self
            .override_group_key
            .as_deref()
            .or(self.notification.group.as_deref());
        match group {
            Some(g) => format!("{}|{}|g:{g}", self.user, self.package),
            None => self.key.to_string(),
        }
    }

    /// Whether this record participates in any group, app-defined or
    /// synthesized.
    pub fn is_group(&self) -> bool {
        self.notification.group.is_some() || self.override_group_key.is_some()
    }

    /// Whether the *app* grouped this record (override keys do not count).
    pub fn is_app_group(&self) -> bool {
        self.notification.group.is_some()
    }

    pub fn is_group_child(&self) -> bool {
        self.is_group() && !self.notification.is_group_summary()
    }

    /// Reduced-payload clone for listeners that asked for [`Trim::Light`]
    /// and for the removal fan-out.
    pub fn clone_light(&self) -> Self {
        let mut light = self.clone();
        light.notification.body = None;
        light.notification.people = Vec::new();
        light.notification.hints = HashMap::new();
        light
    }
}

/// What survives of a notification in the historical archive.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArchivedNotification {
    pub package: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
    pub id: i32,
    pub user: UserId,
    pub post_time: DateTime<Utc>,
    pub title: String,
    pub channel_id: String,
    pub reason: CancelReason,
}

impl ArchivedNotification {
    pub fn from_posted(sbn: &PostedNotification, reason: CancelReason) -> Self {
        Self {
            package: sbn.package.clone(),
            tag: sbn.tag.clone(),
            id: sbn.id,
            user: sbn.user,
            post_time: sbn.post_time,
            title: sbn.notification.title.clone(),
            channel_id: sbn.notification.channel_id.clone(),
            reason,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn sbn(pkg: &str, id: i32, tag: Option<&str>, n: Notification) -> PostedNotification {
        PostedNotification::new(
            pkg,
            pkg,
            id,
            tag.map(String::from),
            10001,
            1234,
            UserId(0),
            n,
            Utc::now(),
        )
    }

    #[test]
    fn key_derivation_is_stable() {
        let a = NotificationKey::for_notification(UserId(0), "com.example", Some("t"), 1);
        let b = NotificationKey::for_notification(UserId(0), "com.example", Some("t"), 1);
        assert_eq!(a, b);
        assert_eq!(a.as_str(), "0|com.example|t|1");
        let untagged = NotificationKey::for_notification(UserId(0), "com.example", None, 1);
        assert_ne!(a, untagged);
    }

    #[test]
    fn group_key_prefers_override() {
        let mut s = sbn(
            "com.example",
            1,
            None,
            Notification {
                group: Some("inbox".into()),
                ..Default::default()
            },
        );
        assert_eq!(s.group_key(), "0|com.example|g:inbox");
        s.override_group_key = Some("ranker_group".into());
        assert_eq!(s.group_key(), "0|com.example|g:ranker_group");
    }

    #[test]
    fn ungrouped_record_is_its_own_group() {
        let s = sbn("com.example", 3, None, Notification::default());
        assert_eq!(s.group_key(), s.key().to_string());
        assert!(!s.is_group());
        assert!(!s.is_app_group());
    }

    #[test]
    fn overridden_record_is_group_but_not_app_group() {
        let mut s = sbn("com.example", 3, None, Notification::default());
        s.override_group_key = Some("ranker_group".into());
        assert!(s.is_group());
        assert!(!s.is_app_group());
        assert!(s.is_group_child());
    }

    #[test]
    fn group_alert_suppression() {
        let summary = Notification {
            group: Some("g".into()),
            group_summary: true,
            group_alert: GroupAlert::Children,
            ..Default::default()
        };
        assert!(summary.suppress_alerting_due_to_grouping());
        let child = Notification {
            group: Some("g".into()),
            group_alert: GroupAlert::Summary,
            ..Default::default()
        };
        assert!(child.suppress_alerting_due_to_grouping());
        let loud_child = Notification {
            group: Some("g".into()),
            group_alert: GroupAlert::All,
            ..Default::default()
        };
        assert!(!loud_child.suppress_alerting_due_to_grouping());
    }

    #[test]
    fn flags_bit_operations() {
        let mut flags = NotificationFlags::default();
        flags.insert(NotificationFlags::FOREGROUND_SERVICE);
        flags.insert(NotificationFlags::NO_CLEAR);
        assert!(flags.contains(NotificationFlags::FOREGROUND_SERVICE));
        assert!(flags.intersects(NotificationFlags::NO_CLEAR));
        flags.remove(NotificationFlags::FOREGROUND_SERVICE);
        assert!(!flags.contains(NotificationFlags::FOREGROUND_SERVICE));
        assert!(flags.contains(NotificationFlags::NO_CLEAR));
    }

    #[test]
    fn listener_hints_suppression_matrix() {
        let none = ListenerHints::default();
        assert!(!none.suppresses(false));
        let all = ListenerHints::DISABLE_EFFECTS;
        assert!(all.suppresses(false));
        assert!(all.suppresses(true));
        let calls_only = ListenerHints::DISABLE_CALL_EFFECTS;
        assert!(calls_only.suppresses(true));
        assert!(!calls_only.suppresses(false));
    }

    #[test]
    fn light_clone_drops_heavy_fields() {
        let mut hints = HashMap::new();
        hints.insert("image-path".to_string(), serde_json::json!("/tmp/big.png"));
        let s = sbn(
            "com.example",
            1,
            None,
            Notification {
                body: Some("a very long body".into()),
                people: vec!["contact:1".into()],
                hints,
                ..Default::default()
            },
        );
        let light = s.clone_light();
        assert_eq!(light.key(), s.key());
        assert!(light.notification.body.is_none());
        assert!(light.notification.people.is_empty());
        assert!(light.notification.hints.is_empty());
    }

    #[test]
    fn profile_map_groups_users() {
        let mut map = ProfileMap::default();
        map.set_group(UserId(0), 0);
        map.set_group(UserId(10), 0);
        map.set_group(UserId(11), 1);
        assert!(map.same_profile_group(UserId(0), UserId(10)));
        assert!(!map.same_profile_group(UserId(0), UserId(11)));
        assert!(map.same_profile_group(UserId(5), UserId(5)));
    }

    #[test]
    fn importance_ordering_drives_interruptiveness() {
        assert!(Importance::High > Importance::Low);
        assert!(Importance::Default.is_interruptive());
        assert!(!Importance::Low.is_interruptive());
        assert_eq!(Importance::default(), Importance::Default);
    }
}
