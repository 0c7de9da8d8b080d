//! Collaborator seams.
//!
//! Everything the pipeline consumes from the rest of the platform is a trait
//! here: package facts, contact affinity, companion-device associations, and
//! the delete hook. Hosts inject implementations; tests inject mocks.

use async_trait::async_trait;

use crate::types::UserId;

/// Package-manager facts the admission policy depends on.
pub trait PackageOracle: Send + Sync {
    /// System and phone-process uids bypass quotas and may post on behalf of
    /// other packages.
    fn is_system_uid(&self, uid: u32) -> bool;

    /// Resolve a package's uid for a user; `None` when not installed.
    fn package_uid(&self, package: &str, user: UserId) -> Option<u32>;

    /// Suspended by a device admin.
    fn is_suspended(&self, package: &str, user: UserId) -> bool;

    /// Instant (ephemeral) apps may update system-created notifications but
    /// never create their own.
    fn is_instant_app(&self, package: &str, user: UserId) -> bool;
}

/// Contact affinity lookups for the people extractor. Callers bound each
/// lookup with a timeout; implementations may take as long as they like.
#[async_trait]
pub trait ContactsProvider: Send + Sync {
    /// Affinity in `[0.0, 1.0]` for a person URI, `None` when unknown.
    async fn lookup_affinity(&self, user: UserId, person_uri: &str) -> Option<f32>;
}

/// Companion-device associations gate privileged listener operations
/// (channel access on behalf of another package).
pub trait CompanionDeviceOracle: Send + Sync {
    fn has_association(&self, host_package: &str, user: UserId) -> bool;
}

/// Receives the opaque delete token when the user dismisses a notification
/// that carries one. Failures are the sink's problem; the pipeline fires and
/// forgets.
pub trait DeleteHookSink: Send + Sync {
    fn fire(&self, package: &str, token: &str);
}

/// Default sink that drops delete tokens.
#[derive(Debug, Default)]
pub struct NoopDeleteHookSink;

impl DeleteHookSink for NoopDeleteHookSink {
    fn fire(&self, _package: &str, _token: &str) {}
}
