//! Ranking: per-package channel configuration, the signal-extractor chain,
//! the stable sort, and the per-listener ranking snapshot.
//!
//! Extraction is synchronous; an extractor that needs slow external data
//! (contact lookups) returns a [`RankingReconsideration`] that the ranking
//! worker runs off the hot path and applies when it resolves.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::external::ContactsProvider;
use crate::record::{NotificationRecord, NONE_AFFINITY};
use crate::store::RecordStore;
use crate::types::{
    Importance, NotificationChannel, NotificationKey, SnoozeCriterion, SuppressedEffects, UserId,
    Visibility,
};

// --- configuration -----------------------------------------------------------

/// Ranking configuration for one (package, user).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PackageConfig {
    /// Package-level importance override; `Importance::None` blocks the
    /// whole package.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub importance: Option<Importance>,
    #[serde(default = "default_true")]
    pub show_badge: bool,
    #[serde(default)]
    pub channels: HashMap<String, NotificationChannel>,
}

fn default_true() -> bool {
    true
}

impl Default for PackageConfig {
    fn default() -> Self {
        Self {
            importance: None,
            show_badge: true,
            channels: HashMap::new(),
        }
    }
}

/// All per-package ranking configuration, persisted in the policy document.
/// Entries are keyed by `"user|package"` so the document stays a flat map.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RankingConfig {
    #[serde(default)]
    packages: HashMap<String, PackageConfig>,
}

impl RankingConfig {
    fn slot(package: &str, user: UserId) -> String {
        format!("{user}|{package}")
    }

    pub fn package(&self, package: &str, user: UserId) -> Option<&PackageConfig> {
        self.packages.get(&Self::slot(package, user))
    }

    pub fn package_mut(&mut self, package: &str, user: UserId) -> &mut PackageConfig {
        self.packages.entry(Self::slot(package, user)).or_default()
    }

    pub fn channel(
        &self,
        package: &str,
        user: UserId,
        channel_id: &str,
    ) -> Option<&NotificationChannel> {
        self.package(package, user)?.channels.get(channel_id)
    }

    /// Registers a channel if it does not exist yet; an existing channel is
    /// left untouched (apps cannot demote what the user configured).
    pub fn create_channel(&mut self, package: &str, user: UserId, channel: NotificationChannel) {
        self.package_mut(package, user)
            .channels
            .entry(channel.id.clone())
            .or_insert(channel);
    }

    /// Replaces a channel's configuration outright (user or privileged
    /// listener action).
    pub fn update_channel(&mut self, package: &str, user: UserId, channel: NotificationChannel) {
        self.package_mut(package, user)
            .channels
            .insert(channel.id.clone(), channel);
    }

    pub fn delete_channel(&mut self, package: &str, user: UserId, channel_id: &str) {
        if let Some(config) = self.packages.get_mut(&Self::slot(package, user)) {
            config.channels.remove(channel_id);
        }
    }

    pub fn channels_for(&self, package: &str, user: UserId) -> Vec<NotificationChannel> {
        self.package(package, user)
            .map(|c| c.channels.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn package_importance(&self, package: &str, user: UserId) -> Option<Importance> {
        self.package(package, user).and_then(|c| c.importance)
    }

    pub fn set_package_importance(
        &mut self,
        package: &str,
        user: UserId,
        importance: Option<Importance>,
    ) {
        self.package_mut(package, user).importance = importance;
    }

    pub fn show_badge(&self, package: &str, user: UserId) -> bool {
        self.package(package, user).map_or(true, |c| c.show_badge)
    }
}

// --- extraction --------------------------------------------------------------

/// Deferred re-evaluation of one record's signals. `work` runs on the ranking
/// worker with no lock held; `apply` runs under the state lock.
#[async_trait]
pub trait RankingReconsideration: Send {
    fn key(&self) -> &NotificationKey;
    async fn work(&mut self);
    fn apply(&self, record: &mut NotificationRecord);
}

/// One stage of the extraction chain. Mutates the record's ranking fields in
/// place and may hand back asynchronous follow-up work.
pub trait SignalExtractor: Send + Sync {
    fn name(&self) -> &'static str;
    fn process(
        &self,
        record: &mut NotificationRecord,
        config: &RankingConfig,
    ) -> Option<Box<dyn RankingReconsideration>>;
}

/// Applies channel and package configuration: importance, lockscreen
/// visibility, badge eligibility.
pub struct ChannelExtractor;

impl SignalExtractor for ChannelExtractor {
    fn name(&self) -> &'static str {
        "channel"
    }

    fn process(
        &self,
        record: &mut NotificationRecord,
        config: &RankingConfig,
    ) -> Option<Box<dyn RankingReconsideration>> {
        record.importance = record.channel.importance;
        record.importance_explanation = Some("channel importance".into());
        record.visibility_override = record.channel.visibility_override;
        record.show_badge =
            record.channel.show_badge && config.show_badge(record.package(), record.user());
        None
    }
}

/// Resolves contact affinity for the people a notification mentions. The
/// lookup is deferred and raced against a hard timeout; on expiry the record
/// keeps default affinity rather than blocking ranking.
pub struct PeopleExtractor {
    contacts: Arc<dyn ContactsProvider>,
    timeout: Duration,
}

impl PeopleExtractor {
    pub fn new(contacts: Arc<dyn ContactsProvider>, timeout: Duration) -> Self {
        Self { contacts, timeout }
    }
}

impl SignalExtractor for PeopleExtractor {
    fn name(&self) -> &'static str {
        "people"
    }

    fn process(
        &self,
        record: &mut NotificationRecord,
        _config: &RankingConfig,
    ) -> Option<Box<dyn RankingReconsideration>> {
        let people = if !record.people_override.is_empty() {
            record.people_override.clone()
        } else {
            record.sbn.notification.people.clone()
        };
        // Already resolved (carried over from a replaced record) or nothing
        // to resolve: no lookup. This also keeps periodic resorts from
        // re-arming lookups for settled records.
        if people.is_empty() || record.contact_affinity > NONE_AFFINITY {
            return None;
        }
        Some(Box::new(PeopleReconsideration {
            key: record.key().clone(),
            user: record.user(),
            people,
            contacts: Arc::clone(&self.contacts),
            timeout: self.timeout,
            affinity: NONE_AFFINITY,
        }))
    }
}

struct PeopleReconsideration {
    key: NotificationKey,
    user: UserId,
    people: Vec<String>,
    contacts: Arc<dyn ContactsProvider>,
    timeout: Duration,
    affinity: f32,
}

#[async_trait]
impl RankingReconsideration for PeopleReconsideration {
    fn key(&self) -> &NotificationKey {
        &self.key
    }

    async fn work(&mut self) {
        let contacts = Arc::clone(&self.contacts);
        let user = self.user;
        let people = self.people.clone();
        let lookup = async move {
            let mut best = NONE_AFFINITY;
            for uri in &people {
                if let Some(affinity) = contacts.lookup_affinity(user, uri).await {
                    if affinity > best {
                        best = affinity;
                    }
                }
            }
            best
        };
        self.affinity = match tokio::time::timeout(self.timeout, lookup).await {
            Ok(affinity) => affinity,
            Err(_) => {
                warn!(key = %self.key, "contact lookup timed out, keeping default affinity");
                NONE_AFFINITY
            }
        };
    }

    fn apply(&self, record: &mut NotificationRecord) {
        if self.affinity > record.contact_affinity {
            record.contact_affinity = self.affinity;
        }
    }
}

// --- sort --------------------------------------------------------------------

struct SortEntry {
    key: NotificationKey,
    group_key: String,
    importance: Importance,
    affinity: f32,
    assistant_rank: i32,
    post_time: chrono::DateTime<chrono::Utc>,
}

fn compare(a: &SortEntry, b: &SortEntry) -> std::cmp::Ordering {
    b.importance
        .cmp(&a.importance)
        .then_with(|| b.affinity.total_cmp(&a.affinity))
        .then_with(|| a.assistant_rank.cmp(&b.assistant_rank))
        .then_with(|| b.post_time.cmp(&a.post_time))
}

/// Owns the extractor chain and the ranking configuration; computes the total
/// order over posted records.
pub struct RankingHelper {
    pub config: RankingConfig,
    extractors: Vec<Box<dyn SignalExtractor>>,
}

impl RankingHelper {
    /// Standard chain: channel configuration, then people affinity.
    pub fn new(contacts: Arc<dyn ContactsProvider>, contacts_timeout: Duration) -> Self {
        Self {
            config: RankingConfig::default(),
            extractors: vec![
                Box::new(ChannelExtractor),
                Box::new(PeopleExtractor::new(contacts, contacts_timeout)),
            ],
        }
    }

    pub fn with_extractors(
        config: RankingConfig,
        extractors: Vec<Box<dyn SignalExtractor>>,
    ) -> Self {
        Self { config, extractors }
    }

    /// Runs the chain over one record, collecting deferred work.
    pub fn extract_signals(
        &self,
        record: &mut NotificationRecord,
    ) -> Vec<Box<dyn RankingReconsideration>> {
        let mut reconsiderations = Vec::new();
        for extractor in &self.extractors {
            if let Some(recon) = extractor.process(record, &self.config) {
                reconsiderations.push(recon);
            }
        }
        reconsiderations
    }

    /// Stable total order: importance descending, then contact affinity,
    /// then assistant rank, then recency. Group members stay adjacent,
    /// anchored where their best-ranked member lands.
    pub fn sort(&self, store: &mut RecordStore) {
        let mut entries: Vec<SortEntry> = store
            .keys_in_order()
            .into_iter()
            .filter_map(|key| {
                let Some(record) = store.get(&key) else {
                    warn!(%key, "ranked key missing from posted index, dropping from order");
                    return None;
                };
                Some(SortEntry {
                    group_key: record.group_key(),
                    importance: record.importance,
                    affinity: record.contact_affinity,
                    assistant_rank: record.assistant_rank.unwrap_or(i32::MAX),
                    post_time: record.sbn.post_time,
                    key,
                })
            })
            .collect();
        entries.sort_by(compare);

        let mut group_order: Vec<&str> = Vec::new();
        let mut members: HashMap<&str, Vec<NotificationKey>> = HashMap::new();
        for entry in &entries {
            let slot = members.entry(entry.group_key.as_str()).or_default();
            if slot.is_empty() {
                group_order.push(entry.group_key.as_str());
            }
            slot.push(entry.key.clone());
        }
        let order: Vec<NotificationKey> = group_order
            .into_iter()
            .flat_map(|g| members.remove(g).unwrap_or_default())
            .collect();
        store.set_order(order);
    }
}

// --- listener snapshots ------------------------------------------------------

/// One record's entry in a listener-scoped ranking snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RankingEntry {
    pub key: NotificationKey,
    pub rank: usize,
    pub importance: Importance,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub importance_explanation: Option<String>,
    pub intercepted: bool,
    pub suppressed_effects: SuppressedEffects,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub visibility_override: Option<Visibility>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub override_group_key: Option<String>,
    pub channel: NotificationChannel,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub people_override: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub snooze_criteria: Vec<SnoozeCriterion>,
    pub show_badge: bool,
}

impl RankingEntry {
    pub fn from_record(rank: usize, record: &NotificationRecord) -> Self {
        Self {
            key: record.key().clone(),
            rank,
            importance: record.importance,
            importance_explanation: record.importance_explanation.clone(),
            intercepted: record.intercepted,
            suppressed_effects: record.suppressed_effects,
            visibility_override: record.visibility_override,
            override_group_key: record.sbn.override_group_key.clone(),
            channel: record.channel.clone(),
            people_override: record.people_override.clone(),
            snooze_criteria: record.snooze_criteria.clone(),
            show_badge: record.show_badge,
        }
    }
}

/// A ranking snapshot over one listener's visible subset of the posted list.
/// Two listeners scoped to different profiles receive different but
/// internally consistent snapshots.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RankingUpdate {
    pub entries: Vec<RankingEntry>,
}

impl RankingUpdate {
    pub fn entry(&self, key: &NotificationKey) -> Option<&RankingEntry> {
        self.entries.iter().find(|e| &e.key == key)
    }

    pub fn position(&self, key: &NotificationKey) -> Option<usize> {
        self.entries.iter().position(|e| &e.key == key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Notification, PostedNotification};
    use chrono::{Duration as ChronoDuration, Utc};
    use pretty_assertions::assert_eq;

    struct NoContacts;

    #[async_trait]
    impl ContactsProvider for NoContacts {
        async fn lookup_affinity(&self, _user: UserId, _uri: &str) -> Option<f32> {
            None
        }
    }

    fn helper() -> RankingHelper {
        RankingHelper::new(Arc::new(NoContacts), Duration::from_secs(3))
    }

    fn record_at(
        pkg: &str,
        id: i32,
        importance: Importance,
        group: Option<&str>,
        seconds_ago: i64,
    ) -> NotificationRecord {
        let sbn = PostedNotification::new(
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
            Utc::now() - ChronoDuration::seconds(seconds_ago),
        );
        NotificationRecord::new(sbn, NotificationChannel::new("c", "C", importance))
    }

    #[test]
    fn sort_orders_by_importance_then_recency() {
        let mut store = RecordStore::new(8);
        let low = record_at("com.a", 1, Importance::Low, None, 10);
        let high = record_at("com.b", 2, Importance::High, None, 20);
        let newer_low = record_at("com.c", 3, Importance::Low, None, 1);
        let low_key = low.key().clone();
        let high_key = high.key().clone();
        let newer_key = newer_low.key().clone();
        store.insert_posted(low);
        store.insert_posted(high);
        store.insert_posted(newer_low);

        helper().sort(&mut store);
        assert_eq!(store.keys_in_order(), vec![high_key, newer_key, low_key]);
    }

    #[test]
    fn sort_is_stable_for_unchanged_records() {
        let mut store = RecordStore::new(8);
        let now = Utc::now();
        for id in 0..4 {
            let mut r = record_at("com.a", id, Importance::Default, None, 0);
            r.sbn.post_time = now;
            store.insert_posted(r);
        }
        let h = helper();
        h.sort(&mut store);
        let first = store.keys_in_order();
        h.sort(&mut store);
        assert_eq!(store.keys_in_order(), first, "re-sort must not shuffle ties");
    }

    #[test]
    fn group_members_stay_adjacent() {
        let mut store = RecordStore::new(8);
        // A high-importance group child anchors its whole group above the
        // ungrouped default record.
        let child_a = record_at("com.a", 1, Importance::High, Some("g"), 5);
        let solo = record_at("com.a", 2, Importance::Default, None, 1);
        let child_b = record_at("com.a", 3, Importance::Low, Some("g"), 2);
        let keys = (
            child_a.key().clone(),
            solo.key().clone(),
            child_b.key().clone(),
        );
        store.insert_posted(child_a);
        store.insert_posted(solo);
        store.insert_posted(child_b);

        helper().sort(&mut store);
        assert_eq!(store.keys_in_order(), vec![keys.0, keys.2, keys.1]);
    }

    #[test]
    fn assistant_rank_breaks_importance_ties() {
        let mut store = RecordStore::new(8);
        let now = Utc::now();
        let mut a = record_at("com.a", 1, Importance::Default, None, 0);
        a.sbn.post_time = now;
        a.assistant_rank = Some(5);
        let mut b = record_at("com.b", 2, Importance::Default, None, 0);
        b.sbn.post_time = now;
        b.assistant_rank = Some(1);
        let (key_a, key_b) = (a.key().clone(), b.key().clone());
        store.insert_posted(a);
        store.insert_posted(b);

        helper().sort(&mut store);
        assert_eq!(store.keys_in_order(), vec![key_b, key_a]);
    }

    #[test]
    fn channel_extractor_applies_config() {
        let mut config = RankingConfig::default();
        config.package_mut("com.a", UserId(0)).show_badge = false;
        let helper = RankingHelper::with_extractors(config, vec![Box::new(ChannelExtractor)]);
        let mut record = record_at("com.a", 1, Importance::High, None, 0);
        record.channel.visibility_override = Some(Visibility::Secret);
        let recons = helper.extract_signals(&mut record);
        assert!(recons.is_empty());
        assert_eq!(record.importance, Importance::High);
        assert_eq!(record.visibility_override, Some(Visibility::Secret));
        assert!(!record.show_badge, "package-level badge opt-out wins");
    }

    #[tokio::test]
    async fn people_extractor_resolves_best_affinity() {
        struct Fixed;
        #[async_trait]
        impl ContactsProvider for Fixed {
            async fn lookup_affinity(&self, _user: UserId, uri: &str) -> Option<f32> {
                match uri {
                    "contact:starred" => Some(1.0),
                    "contact:plain" => Some(0.5),
                    _ => None,
                }
            }
        }
        let extractor = PeopleExtractor::new(Arc::new(Fixed), Duration::from_secs(3));
        let mut record = record_at("com.a", 1, Importance::Default, None, 0);
        record.sbn.notification.people =
            vec!["contact:plain".into(), "contact:starred".into(), "x".into()];
        let mut recon = extractor
            .process(&mut record, &RankingConfig::default())
            .expect("lookup scheduled");
        recon.work().await;
        recon.apply(&mut record);
        assert_eq!(record.contact_affinity, 1.0);
    }

    #[tokio::test]
    async fn people_extractor_times_out_to_default() {
        struct Stuck;
        #[async_trait]
        impl ContactsProvider for Stuck {
            async fn lookup_affinity(&self, _user: UserId, _uri: &str) -> Option<f32> {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Some(1.0)
            }
        }
        let extractor = PeopleExtractor::new(Arc::new(Stuck), Duration::from_millis(20));
        let mut record = record_at("com.a", 1, Importance::Default, None, 0);
        record.sbn.notification.people = vec!["contact:slow".into()];
        let mut recon = extractor
            .process(&mut record, &RankingConfig::default())
            .unwrap();
        recon.work().await;
        recon.apply(&mut record);
        assert_eq!(record.contact_affinity, NONE_AFFINITY);
    }

    #[test]
    fn people_extractor_skips_resolved_records() {
        let extractor = PeopleExtractor::new(Arc::new(NoContacts), Duration::from_secs(3));
        let mut record = record_at("com.a", 1, Importance::Default, None, 0);
        record.sbn.notification.people = vec!["contact:1".into()];
        record.contact_affinity = 0.5;
        assert!(extractor
            .process(&mut record, &RankingConfig::default())
            .is_none());
    }

    #[test]
    fn channel_create_does_not_clobber_existing() {
        let mut config = RankingConfig::default();
        let original = NotificationChannel::new("c", "Original", Importance::High);
        config.create_channel("com.a", UserId(0), original.clone());
        config.create_channel(
            "com.a",
            UserId(0),
            NotificationChannel::new("c", "Replacement", Importance::Low),
        );
        assert_eq!(
            config.channel("com.a", UserId(0), "c").unwrap().name,
            "Original"
        );
        config.update_channel(
            "com.a",
            UserId(0),
            NotificationChannel::new("c", "Replacement", Importance::Low),
        );
        assert_eq!(
            config.channel("com.a", UserId(0), "c").unwrap().importance,
            Importance::Low
        );
    }

    #[test]
    fn config_serde_round_trip() {
        let mut config = RankingConfig::default();
        config.create_channel(
            "com.a",
            UserId(0),
            NotificationChannel::new("c", "C", Importance::High),
        );
        config.set_package_importance("com.b", UserId(0), Some(Importance::None));
        let raw = toml::to_string(&config).unwrap();
        let parsed: RankingConfig = toml::from_str(&raw).unwrap();
        assert_eq!(parsed, config);
    }
}
