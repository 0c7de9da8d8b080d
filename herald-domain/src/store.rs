//! Canonical record storage.
//!
//! All cross-references are string keys into these maps; no record holds a
//! pointer to another record. The store itself is not synchronized, it lives
//! inside the pipeline's coarse state lock.

use std::collections::{HashMap, VecDeque};

use crate::record::NotificationRecord;
use crate::types::{ArchivedNotification, NotificationKey, UserId};

/// Bounded ring of lightweight clones of removed notifications, oldest
/// evicted first.
#[derive(Debug)]
pub struct Archive {
    items: VecDeque<ArchivedNotification>,
    capacity: usize,
}

impl Archive {
    pub fn new(capacity: usize) -> Self {
        Self {
            items: VecDeque::with_capacity(capacity.min(64)),
            capacity,
        }
    }

    pub fn record(&mut self, item: ArchivedNotification) {
        if self.capacity == 0 {
            return;
        }
        while self.items.len() >= self.capacity {
            self.items.pop_front();
        }
        self.items.push_back(item);
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Most recent first.
    pub fn newest(&self, count: usize) -> Vec<ArchivedNotification> {
        self.items.iter().rev().take(count).cloned().collect()
    }
}

/// Owns every live record: the posted arena plus ranked key order, the
/// short-lived enqueued list, the group-summary and autobundle maps, and the
/// archive.
#[derive(Debug)]
pub struct RecordStore {
    posted: HashMap<NotificationKey, NotificationRecord>,
    /// Ranked order over the posted keys; `RankingHelper::sort` rewrites it.
    order: Vec<NotificationKey>,
    /// Records between enqueue admission and the post step.
    enqueued: Vec<NotificationRecord>,
    /// group key -> key of the record currently acting as its summary.
    summary_by_group: HashMap<String, NotificationKey>,
    /// (user, package) -> key of the synthetic autogroup summary.
    autobundled: HashMap<(UserId, String), NotificationKey>,
    archive: Archive,
}

impl RecordStore {
    pub fn new(archive_capacity: usize) -> Self {
        Self {
            posted: HashMap::new(),
            order: Vec::new(),
            enqueued: Vec::new(),
            summary_by_group: HashMap::new(),
            autobundled: HashMap::new(),
            archive: Archive::new(archive_capacity),
        }
    }

    // --- posted list ---

    pub fn get(&self, key: &NotificationKey) -> Option<&NotificationRecord> {
        self.posted.get(key)
    }

    pub fn get_mut(&mut self, key: &NotificationKey) -> Option<&mut NotificationRecord> {
        self.posted.get_mut(key)
    }

    pub fn is_posted(&self, key: &NotificationKey) -> bool {
        self.posted.contains_key(key)
    }

    pub fn posted_len(&self) -> usize {
        self.order.len()
    }

    /// Inserts or replaces the posted record for its key, returning the
    /// replaced record. A replacement keeps its slot in the ranked order
    /// until the next sort.
    pub fn insert_posted(&mut self, record: NotificationRecord) -> Option<NotificationRecord> {
        let key = record.key().clone();
        let old = self.posted.insert(key.clone(), record);
        if old.is_none() {
            self.order.push(key);
        }
        old
    }

    pub fn remove_posted(&mut self, key: &NotificationKey) -> Option<NotificationRecord> {
        let removed = self.posted.remove(key);
        if removed.is_some() {
            self.order.retain(|k| k != key);
        }
        removed
    }

    /// Current rank of a key, if posted.
    pub fn index_of(&self, key: &NotificationKey) -> Option<usize> {
        self.order.iter().position(|k| k == key)
    }

    pub fn keys_in_order(&self) -> Vec<NotificationKey> {
        self.order.clone()
    }

    pub fn set_order(&mut self, order: Vec<NotificationKey>) {
        self.order = order;
    }

    pub fn posted_in_order(&self) -> impl Iterator<Item = &NotificationRecord> {
        self.order.iter().filter_map(|k| self.posted.get(k))
    }

    /// Posted records for one (package, user), excluding `excluding` so an
    /// update does not count against its own quota.
    pub fn count_posted_for_package(
        &self,
        package: &str,
        user: UserId,
        excluding: &NotificationKey,
    ) -> usize {
        self.posted
            .values()
            .filter(|r| r.package() == package && r.user() == user && r.key() != excluding)
            .count()
    }

    // --- enqueued list ---

    pub fn push_enqueued(&mut self, record: NotificationRecord) {
        self.enqueued.push(record);
    }

    pub fn enqueued_mut(&mut self, key: &NotificationKey) -> Option<&mut NotificationRecord> {
        self.enqueued.iter_mut().find(|r| r.key() == key)
    }

    /// Removes and returns the first enqueued record for `key`.
    pub fn take_enqueued(&mut self, key: &NotificationKey) -> Option<NotificationRecord> {
        let index = self.enqueued.iter().position(|r| r.key() == key)?;
        Some(self.enqueued.remove(index))
    }

    pub fn enqueued_len(&self) -> usize {
        self.enqueued.len()
    }

    pub fn enqueued_keys(&self) -> Vec<NotificationKey> {
        self.enqueued.iter().map(|r| r.key().clone()).collect()
    }

    // --- group summary map ---

    pub fn summary_key(&self, group_key: &str) -> Option<&NotificationKey> {
        self.summary_by_group.get(group_key)
    }

    pub fn set_summary(
        &mut self,
        group_key: String,
        key: NotificationKey,
    ) -> Option<NotificationKey> {
        self.summary_by_group.insert(group_key, key)
    }

    pub fn remove_summary(&mut self, group_key: &str) -> Option<NotificationKey> {
        self.summary_by_group.remove(group_key)
    }

    /// Drops the summary mapping only if it still points at `key`; a later
    /// summary for the same group stays registered.
    pub fn remove_summary_if(&mut self, group_key: &str, key: &NotificationKey) {
        if self.summary_by_group.get(group_key) == Some(key) {
            self.summary_by_group.remove(group_key);
        }
    }

    /// Keys of posted group children (not the summary) sharing `group_key`.
    pub fn posted_children_of_group(&self, group_key: &str) -> Vec<NotificationKey> {
        self.posted_in_order()
            .filter(|r| r.sbn.is_group_child() && r.group_key() == group_key)
            .map(|r| r.key().clone())
            .collect()
    }

    /// Keys of enqueued group children sharing `group_key`.
    pub fn enqueued_children_of_group(&self, group_key: &str) -> Vec<NotificationKey> {
        self.enqueued
            .iter()
            .filter(|r| r.sbn.is_group_child() && r.group_key() == group_key)
            .map(|r| r.key().clone())
            .collect()
    }

    /// All posted members of a group, summary included, in ranked order.
    pub fn posted_members_of_group(&self, group_key: &str) -> Vec<NotificationKey> {
        self.posted_in_order()
            .filter(|r| r.sbn.is_group() && r.group_key() == group_key)
            .map(|r| r.key().clone())
            .collect()
    }

    // --- autobundle map ---

    pub fn autobundle_summary_key(&self, user: UserId, package: &str) -> Option<&NotificationKey> {
        self.autobundled.get(&(user, package.to_string()))
    }

    pub fn set_autobundle_summary(&mut self, user: UserId, package: String, key: NotificationKey) {
        self.autobundled.insert((user, package), key);
    }

    pub fn remove_autobundle_summary(&mut self, user: UserId, package: &str) -> Option<NotificationKey> {
        self.autobundled.remove(&(user, package.to_string()))
    }

    /// Drops the autobundle mapping if it points at `key` (a canceled
    /// summary must not leave a dangling entry behind).
    pub fn remove_autobundle_summary_if(&mut self, user: UserId, package: &str, key: &NotificationKey) {
        if self.autobundle_summary_key(user, package) == Some(key) {
            self.autobundled.remove(&(user, package.to_string()));
        }
    }

    // --- archive ---

    pub fn archive_mut(&mut self) -> &mut Archive {
        &mut self.archive
    }

    pub fn archive(&self) -> &Archive {
        &self.archive
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{
        CancelReason, Importance, Notification, NotificationChannel, PostedNotification,
    };
    use chrono::Utc;
    use pretty_assertions::assert_eq;

    fn record(pkg: &str, id: i32, group: Option<&str>) -> NotificationRecord {
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
            Utc::now(),
        );
        NotificationRecord::new(sbn, NotificationChannel::new("c", "C", Importance::Default))
    }

    #[test]
    fn insert_is_replace_not_duplicate() {
        let mut store = RecordStore::new(8);
        assert!(store.insert_posted(record("com.a", 1, None)).is_none());
        assert_eq!(store.posted_len(), 1);
        let old = store.insert_posted(record("com.a", 1, None));
        assert!(old.is_some());
        assert_eq!(store.posted_len(), 1);
    }

    #[test]
    fn remove_clears_order() {
        let mut store = RecordStore::new(8);
        let r = record("com.a", 1, None);
        let key = r.key().clone();
        store.insert_posted(r);
        store.insert_posted(record("com.a", 2, None));
        assert_eq!(store.index_of(&key), Some(0));
        store.remove_posted(&key);
        assert_eq!(store.posted_len(), 1);
        assert!(store.index_of(&key).is_none());
    }

    #[test]
    fn package_count_excludes_update_target() {
        let mut store = RecordStore::new(8);
        store.insert_posted(record("com.a", 1, None));
        store.insert_posted(record("com.a", 2, None));
        store.insert_posted(record("com.b", 3, None));
        let updating = record("com.a", 2, None);
        assert_eq!(
            store.count_posted_for_package("com.a", UserId(0), updating.key()),
            1
        );
    }

    #[test]
    fn enqueued_take_removes_first_match() {
        let mut store = RecordStore::new(8);
        let r = record("com.a", 1, None);
        let key = r.key().clone();
        store.push_enqueued(r);
        assert!(store.take_enqueued(&key).is_some());
        assert!(store.take_enqueued(&key).is_none());
        assert_eq!(store.enqueued_len(), 0);
    }

    #[test]
    fn group_children_lookup_skips_summary() {
        let mut store = RecordStore::new(8);
        let mut summary = record("com.a", 100, Some("g"));
        summary.sbn.notification.group_summary = true;
        let group_key = summary.group_key();
        store.insert_posted(summary);
        store.insert_posted(record("com.a", 1, Some("g")));
        store.insert_posted(record("com.a", 2, Some("g")));
        store.insert_posted(record("com.a", 3, None));
        assert_eq!(store.posted_children_of_group(&group_key).len(), 2);
        assert_eq!(store.posted_members_of_group(&group_key).len(), 3);
    }

    #[test]
    fn summary_removal_is_conditional() {
        let mut store = RecordStore::new(8);
        let first = record("com.a", 1, Some("g"));
        let second = record("com.a", 2, Some("g"));
        store.set_summary("gk".into(), first.key().clone());
        store.remove_summary_if("gk", second.key());
        assert!(store.summary_key("gk").is_some());
        store.remove_summary_if("gk", first.key());
        assert!(store.summary_key("gk").is_none());
    }

    #[test]
    fn archive_evicts_oldest_first() {
        let mut archive = Archive::new(2);
        for id in 0..4 {
            archive.record(
                record("com.a", id, None).archived(CancelReason::AppCancel),
            );
        }
        assert_eq!(archive.len(), 2);
        let newest = archive.newest(10);
        assert_eq!(newest[0].id, 3);
        assert_eq!(newest[1].id, 2);
    }
}
