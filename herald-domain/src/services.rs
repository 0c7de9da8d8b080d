//! Registry of bound remote services.
//!
//! One generic registry parameterized by a capability descriptor covers both
//! listeners and assistants; the two differ only in their connection trait
//! and capability constants, not in registration/liveness mechanics.
//!
//! Liveness is result-driven: a dispatch returning [`RemoteError::Dead`] is
//! the connection-closed event, and the pipeline reacts by deregistering the
//! service and retracting any state it contributed.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use crate::ranking::RankingUpdate;
use crate::types::{
    CancelReason, InterruptionFilter, ListenerHints, PostedNotification, ProfileMap, Trim, UserId,
};

/// Identifies a remote service implementation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ComponentName {
    pub package: String,
    pub class_name: String,
}

impl ComponentName {
    pub fn new(package: impl Into<String>, class_name: impl Into<String>) -> Self {
        Self {
            package: package.into(),
            class_name: class_name.into(),
        }
    }
}

impl fmt::Display for ComponentName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.package, self.class_name)
    }
}

/// What a registry manages: caption for logs, the permission the remote
/// service must hold, and the settings key its enablement lives under.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServiceCapability {
    pub caption: &'static str,
    pub required_permission: &'static str,
    pub setting_key: &'static str,
}

pub const LISTENER_CAPABILITY: ServiceCapability = ServiceCapability {
    caption: "notification listener",
    required_permission: "herald.permission.BIND_NOTIFICATION_LISTENER",
    setting_key: "enabled_notification_listeners",
};

pub const ASSISTANT_CAPABILITY: ServiceCapability = ServiceCapability {
    caption: "notification assistant",
    required_permission: "herald.permission.BIND_NOTIFICATION_ASSISTANT",
    setting_key: "enabled_notification_assistant",
};

/// Dispatch failure for one remote call.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RemoteError {
    /// The connection is gone for good; the service must be deregistered.
    #[error("remote service connection is dead")]
    Dead,
    /// Transient failure; the event is lost for this service only.
    #[error("remote dispatch failed: {0}")]
    Failed(String),
}

/// Passive observer of notification lifecycle events. All methods are
/// one-way from the pipeline's perspective; the `Result` only feeds
/// liveness handling.
#[async_trait]
pub trait ListenerConnection: Send + Sync {
    async fn on_notification_posted(
        &self,
        sbn: PostedNotification,
        ranking: RankingUpdate,
    ) -> Result<(), RemoteError>;

    async fn on_notification_removed(
        &self,
        sbn: PostedNotification,
        ranking: RankingUpdate,
        reason: CancelReason,
    ) -> Result<(), RemoteError>;

    async fn on_ranking_update(&self, ranking: RankingUpdate) -> Result<(), RemoteError>;

    async fn on_listener_hints_changed(&self, hints: ListenerHints) -> Result<(), RemoteError>;

    async fn on_interruption_filter_changed(
        &self,
        filter: InterruptionFilter,
    ) -> Result<(), RemoteError>;
}

/// Privileged observer that can adjust ranking signals while a notification
/// sits in the adjustment window.
#[async_trait]
pub trait AssistantConnection: Send + Sync {
    async fn on_notification_enqueued(&self, sbn: PostedNotification) -> Result<(), RemoteError>;

    async fn on_notification_snoozed(
        &self,
        sbn: PostedNotification,
        criterion_id: String,
    ) -> Result<(), RemoteError>;
}

/// One bound service: identity, audience scope, payload preference, and the
/// live connection.
pub struct ManagedServiceInfo<S: ?Sized> {
    pub id: u64,
    pub component: ComponentName,
    pub user: UserId,
    pub trim: Trim,
    pub connection: Arc<S>,
}

impl<S: ?Sized> Clone for ManagedServiceInfo<S> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            component: self.component.clone(),
            user: self.user,
            trim: self.trim,
            connection: Arc::clone(&self.connection),
        }
    }
}

impl<S: ?Sized> fmt::Debug for ManagedServiceInfo<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManagedServiceInfo")
            .field("id", &self.id)
            .field("component", &self.component)
            .field("user", &self.user)
            .field("trim", &self.trim)
            .finish()
    }
}

impl<S: ?Sized> ManagedServiceInfo<S> {
    /// Whether a record targeted at `target` is within this service's
    /// audience: exact user match, the all-users wildcard on either side, or
    /// membership in the same profile group.
    pub fn is_visible_to(&self, profiles: &ProfileMap, target: UserId) -> bool {
        self.user.is_all()
            || target.is_all()
            || self.user == target
            || profiles.same_profile_group(self.user, target)
    }
}

/// Thread-safe registry of bound services of one capability.
pub struct ManagedServiceRegistry<S: ?Sized> {
    capability: ServiceCapability,
    services: RwLock<Vec<ManagedServiceInfo<S>>>,
    next_id: AtomicU64,
}

impl<S: ?Sized> ManagedServiceRegistry<S> {
    pub fn new(capability: ServiceCapability) -> Self {
        Self {
            capability,
            services: RwLock::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn capability(&self) -> &ServiceCapability {
        &self.capability
    }

    /// Binds a service, replacing any previous binding of the same
    /// (component, user). Returns the registration id used for later calls.
    pub fn register(
        &self,
        component: ComponentName,
        user: UserId,
        trim: Trim,
        connection: Arc<S>,
    ) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let info = ManagedServiceInfo {
            id,
            component,
            user,
            trim,
            connection,
        };
        let mut services = self.services.write().unwrap_or_else(|e| e.into_inner());
        services.retain(|s| !(s.component == info.component && s.user == info.user));
        info!(capability = self.capability.caption, component = %info.component, user = %user, "service bound");
        services.push(info);
        id
    }

    pub fn unregister(&self, id: u64) -> Option<ManagedServiceInfo<S>> {
        let mut services = self.services.write().unwrap_or_else(|e| e.into_inner());
        let index = services.iter().position(|s| s.id == id)?;
        let removed = services.remove(index);
        info!(capability = self.capability.caption, component = %removed.component, "service unbound");
        Some(removed)
    }

    /// Drops every binding scoped to a removed user, returning them so the
    /// caller can retract contributed state.
    pub fn remove_user(&self, user: UserId) -> Vec<ManagedServiceInfo<S>> {
        let mut services = self.services.write().unwrap_or_else(|e| e.into_inner());
        let (removed, kept): (Vec<_>, Vec<_>) =
            services.drain(..).partition(|s| s.user == user);
        *services = kept;
        if !removed.is_empty() {
            debug!(
                capability = self.capability.caption,
                count = removed.len(),
                user = %user,
                "dropped bindings for removed user"
            );
        }
        removed
    }

    pub fn get(&self, id: u64) -> Option<ManagedServiceInfo<S>> {
        self.services
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .find(|s| s.id == id)
            .cloned()
    }

    /// Snapshot of the live set; dispatch iterates this clone outside any
    /// pipeline lock.
    pub fn services(&self) -> Vec<ManagedServiceInfo<S>> {
        self.services
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Whether any bound service is hosted by `package` (such packages are
    /// exempt from enqueue quotas).
    pub fn is_registered_package(&self, package: &str) -> bool {
        self.services
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .any(|s| s.component.package == package)
    }

    pub fn len(&self) -> usize {
        self.services.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    struct DummyConnection;

    #[async_trait]
    impl ListenerConnection for DummyConnection {
        async fn on_notification_posted(
            &self,
            _sbn: PostedNotification,
            _ranking: RankingUpdate,
        ) -> Result<(), RemoteError> {
            Ok(())
        }
        async fn on_notification_removed(
            &self,
            _sbn: PostedNotification,
            _ranking: RankingUpdate,
            _reason: CancelReason,
        ) -> Result<(), RemoteError> {
            Ok(())
        }
        async fn on_ranking_update(&self, _ranking: RankingUpdate) -> Result<(), RemoteError> {
            Ok(())
        }
        async fn on_listener_hints_changed(
            &self,
            _hints: ListenerHints,
        ) -> Result<(), RemoteError> {
            Ok(())
        }
        async fn on_interruption_filter_changed(
            &self,
            _filter: InterruptionFilter,
        ) -> Result<(), RemoteError> {
            Ok(())
        }
    }

    fn registry() -> ManagedServiceRegistry<dyn ListenerConnection> {
        ManagedServiceRegistry::new(LISTENER_CAPABILITY)
    }

    #[test]
    fn register_unregister_round_trip() {
        let registry = registry();
        let id = registry.register(
            ComponentName::new("com.listener", "Service"),
            UserId(0),
            Trim::Full,
            Arc::new(DummyConnection),
        );
        assert_eq!(registry.len(), 1);
        assert!(registry.is_registered_package("com.listener"));
        assert!(registry.get(id).is_some());
        assert!(registry.unregister(id).is_some());
        assert!(registry.is_empty());
        assert!(registry.unregister(id).is_none());
    }

    #[test]
    fn rebind_replaces_previous_binding() {
        let registry = registry();
        let component = ComponentName::new("com.listener", "Service");
        let first = registry.register(
            component.clone(),
            UserId(0),
            Trim::Full,
            Arc::new(DummyConnection),
        );
        let second = registry.register(
            component,
            UserId(0),
            Trim::Light,
            Arc::new(DummyConnection),
        );
        assert_eq!(registry.len(), 1);
        assert!(registry.get(first).is_none());
        assert_eq!(registry.get(second).unwrap().trim, Trim::Light);
    }

    #[test]
    fn same_component_different_users_coexist() {
        let registry = registry();
        let component = ComponentName::new("com.listener", "Service");
        registry.register(component.clone(), UserId(0), Trim::Full, Arc::new(DummyConnection));
        registry.register(component, UserId(10), Trim::Full, Arc::new(DummyConnection));
        assert_eq!(registry.len(), 2);
        let removed = registry.remove_user(UserId(10));
        assert_eq!(removed.len(), 1);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn visibility_scope_rules() {
        let mut profiles = ProfileMap::default();
        profiles.set_group(UserId(0), 0);
        profiles.set_group(UserId(10), 0);
        profiles.set_group(UserId(11), 1);

        let registry = registry();
        let id = registry.register(
            ComponentName::new("com.listener", "Service"),
            UserId(0),
            Trim::Full,
            Arc::new(DummyConnection),
        );
        let info = registry.get(id).unwrap();
        assert!(info.is_visible_to(&profiles, UserId(0)));
        assert!(info.is_visible_to(&profiles, UserId::ALL));
        assert!(info.is_visible_to(&profiles, UserId(10)), "same profile group");
        assert!(!info.is_visible_to(&profiles, UserId(11)));

        let wildcard = registry.register(
            ComponentName::new("com.listener", "AllUsers"),
            UserId::ALL,
            Trim::Full,
            Arc::new(DummyConnection),
        );
        let info = registry.get(wildcard).unwrap();
        assert!(info.is_visible_to(&profiles, UserId(11)));
    }
}
