//! The notification pipeline orchestrator.
//!
//! [`NotificationPipeline`] owns the two single-consumer work queues and the
//! coarse state lock, and coordinates the record store, ranking, grouping,
//! snoozing, usage stats, and listener/assistant fan-out.
//!
//! Concurrency model: every lifecycle mutation (enqueue, post, cancel,
//! timeout, snooze) is a tagged [`WorkItem`] consumed by one worker task in
//! FIFO submission order. Signal extraction and resorts run on a second,
//! independent worker so a slow contacts lookup never delays posting. The
//! state lock is never held across an await; remote fan-out always happens
//! from snapshots after the lock is released, one spawned task per service,
//! so a dead listener cannot stall the poster or its peers.
//!
//! All methods must be called from within a tokio runtime.

mod worker;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use herald_core::TuningConfig;

use crate::alerts::{self, AttentionState, NotificationLight, SoundPlayer, Vibrator};
use crate::error::NotificationError;
use crate::external::{CompanionDeviceOracle, ContactsProvider, DeleteHookSink, PackageOracle};
use crate::grouping::{GroupAction, GroupHelper, AUTOGROUP_KEY};
use crate::policy::{PolicyDocument, PolicyStore};
use crate::ranking::{
    ChannelExtractor, PeopleExtractor, RankingEntry, RankingHelper, RankingReconsideration,
    RankingUpdate,
};
use crate::record::NotificationRecord;
use crate::services::{
    AssistantConnection, ComponentName, ListenerConnection, ManagedServiceInfo,
    ManagedServiceRegistry, RemoteError, ASSISTANT_CAPABILITY, LISTENER_CAPABILITY,
};
use crate::snooze::{SnoozeHelper, WakeCondition};
use crate::stats::{PackageStats, UsageStats};
use crate::store::RecordStore;
use crate::types::{
    Adjustment, ArchivedNotification, CancelReason, GroupAlert, Importance, InterruptionFilter,
    ListenerHints, Notification, NotificationChannel, NotificationFlags, NotificationKey,
    PostedNotification, ProfileMap, RingerMode, Trim, UserId, Visibility,
};
use crate::zen::{ZenConfig, ZenModeHelper};

use worker::{CancelSpec, RankingTask, WorkItem};

fn lock<'a, T>(mutex: &'a Mutex<T>) -> MutexGuard<'a, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Everything the pipeline consumes from its host.
pub struct PipelineDeps {
    pub zen: Arc<dyn ZenModeHelper>,
    pub packages: Arc<dyn PackageOracle>,
    pub contacts: Arc<dyn ContactsProvider>,
    pub companion: Arc<dyn CompanionDeviceOracle>,
    pub sound: Arc<dyn SoundPlayer>,
    pub vibrator: Arc<dyn Vibrator>,
    pub light: Arc<dyn NotificationLight>,
    pub delete_hooks: Arc<dyn DeleteHookSink>,
}

/// Mutable pipeline state behind the coarse lock.
struct PipelineState {
    store: RecordStore,
    attention: AttentionState,
    /// Hints contributed per bound listener; the aggregate is their union.
    hints_by_service: HashMap<u64, ListenerHints>,
    /// Current timeout-arm generation per key; a fired alarm with a stale
    /// epoch is ignored.
    timeout_epochs: HashMap<NotificationKey, u64>,
    profiles: ProfileMap,
}

impl PipelineState {
    fn aggregate_hints(&self) -> ListenerHints {
        self.hints_by_service
            .values()
            .fold(ListenerHints::default(), |acc, h| acc.union(*h))
    }
}

/// A unit of remote fan-out, computed under the lock and executed outside it.
enum Fanout {
    ListenerPosted {
        info: ManagedServiceInfo<dyn ListenerConnection>,
        sbn: PostedNotification,
        update: RankingUpdate,
    },
    ListenerRemoved {
        info: ManagedServiceInfo<dyn ListenerConnection>,
        sbn: PostedNotification,
        update: RankingUpdate,
        reason: CancelReason,
    },
    ListenerRanking {
        info: ManagedServiceInfo<dyn ListenerConnection>,
        update: RankingUpdate,
    },
    ListenerHintsChanged {
        info: ManagedServiceInfo<dyn ListenerConnection>,
        hints: ListenerHints,
    },
    ListenerFilterChanged {
        info: ManagedServiceInfo<dyn ListenerConnection>,
        filter: InterruptionFilter,
    },
    AssistantEnqueued {
        info: ManagedServiceInfo<dyn AssistantConnection>,
        sbn: PostedNotification,
    },
    AssistantSnoozed {
        info: ManagedServiceInfo<dyn AssistantConnection>,
        sbn: PostedNotification,
        criterion: String,
    },
    DeleteHook {
        package: String,
        token: String,
    },
}

struct PipelineInner {
    tuning: TuningConfig,
    state: Mutex<PipelineState>,
    ranking: Mutex<RankingHelper>,
    stats: Mutex<UsageStats>,
    snoozed: Mutex<SnoozeHelper>,
    grouping: Mutex<GroupHelper>,
    listeners: ManagedServiceRegistry<dyn ListenerConnection>,
    assistants: ManagedServiceRegistry<dyn AssistantConnection>,
    deps: PipelineDeps,
    policy: PolicyStore,
    work_tx: mpsc::UnboundedSender<WorkItem>,
    ranking_tx: mpsc::UnboundedSender<RankingTask>,
    ranking_update_pending: AtomicBool,
    rt: tokio::runtime::Handle,
}

/// Public handle. Dropping it leaves the workers running; call
/// [`NotificationPipeline::shutdown`] for an orderly stop.
pub struct NotificationPipeline {
    inner: Arc<PipelineInner>,
    worker: JoinHandle<()>,
    ranking_worker: JoinHandle<()>,
}

impl NotificationPipeline {
    /// Builds the pipeline, loads the policy document, and starts both
    /// workers on the current runtime.
    pub fn start(tuning: TuningConfig, deps: PipelineDeps) -> Result<Self, NotificationError> {
        let policy = PolicyStore::new(tuning.policy_path.clone());
        let document = policy.load()?;
        deps.zen.set_config(document.zen);

        let ranking = RankingHelper::with_extractors(
            document.ranking,
            vec![
                Box::new(ChannelExtractor),
                Box::new(PeopleExtractor::new(
                    Arc::clone(&deps.contacts),
                    Duration::from_millis(tuning.contacts_timeout_ms),
                )),
            ],
        );

        let (work_tx, work_rx) = mpsc::unbounded_channel();
        let (ranking_tx, ranking_rx) = mpsc::unbounded_channel();

        let inner = Arc::new(PipelineInner {
            state: Mutex::new(PipelineState {
                store: RecordStore::new(tuning.archive_size),
                attention: AttentionState::default(),
                hints_by_service: HashMap::new(),
                timeout_epochs: HashMap::new(),
                profiles: ProfileMap::default(),
            }),
            ranking: Mutex::new(ranking),
            stats: Mutex::new(UsageStats::new()),
            snoozed: Mutex::new(SnoozeHelper::new()),
            grouping: Mutex::new(GroupHelper::new(tuning.autogroup_at_count)),
            listeners: ManagedServiceRegistry::new(LISTENER_CAPABILITY),
            assistants: ManagedServiceRegistry::new(ASSISTANT_CAPABILITY),
            deps,
            policy,
            work_tx,
            ranking_tx,
            ranking_update_pending: AtomicBool::new(false),
            rt: tokio::runtime::Handle::current(),
            tuning,
        });

        let worker = tokio::spawn(run_worker(Arc::clone(&inner), work_rx));
        let ranking_worker = tokio::spawn(run_ranking_worker(Arc::clone(&inner), ranking_rx));
        Ok(Self {
            inner,
            worker,
            ranking_worker,
        })
    }

    // --- posting and canceling ---

    /// One-way enqueue. Policy rejections are silent by design (the caller
    /// has no return channel); only hard security violations surface as
    /// errors.
    #[allow(clippy::too_many_arguments)]
    pub fn enqueue_notification(
        &self,
        package: &str,
        op_package: &str,
        calling_uid: u32,
        calling_pid: u32,
        tag: Option<String>,
        id: i32,
        notification: Notification,
        user: UserId,
    ) -> Result<(), NotificationError> {
        self.inner.enqueue_notification(
            package,
            op_package,
            calling_uid,
            calling_pid,
            tag,
            id,
            notification,
            user,
        )
    }

    /// App-initiated cancel of its own notification.
    pub fn cancel_notification(
        &self,
        package: &str,
        tag: Option<String>,
        id: i32,
        user: UserId,
    ) -> Result<(), NotificationError> {
        let mut must_not_have = NotificationFlags::default();
        must_not_have.insert(NotificationFlags::FOREGROUND_SERVICE);
        must_not_have.insert(NotificationFlags::AUTOGROUP_SUMMARY);
        self.inner.send(WorkItem::Cancel(CancelSpec {
            package: package.to_string(),
            tag,
            id,
            user,
            must_have: NotificationFlags::default(),
            must_not_have,
            send_delete: false,
            reason: CancelReason::AppCancel,
        }))
    }

    /// App-initiated cancel of all its notifications.
    pub fn cancel_all_notifications(
        &self,
        package: &str,
        user: UserId,
    ) -> Result<(), NotificationError> {
        let mut must_not_have = NotificationFlags::default();
        must_not_have.insert(NotificationFlags::FOREGROUND_SERVICE);
        self.inner.send(WorkItem::CancelAll {
            package: Some(package.to_string()),
            user,
            must_not_have,
            send_delete: false,
            reason: CancelReason::AppCancelAll,
        })
    }

    /// Listener-initiated cancel (user dismissal surfaced through a
    /// listener); fires the delete hook.
    pub fn cancel_notification_from_listener(
        &self,
        listener_id: u64,
        package: &str,
        tag: Option<String>,
        id: i32,
        user: UserId,
    ) -> Result<(), NotificationError> {
        self.inner.require_listener(listener_id)?;
        let mut must_not_have = NotificationFlags::default();
        must_not_have.insert(NotificationFlags::FOREGROUND_SERVICE);
        must_not_have.insert(NotificationFlags::AUTOGROUP_SUMMARY);
        self.inner.send(WorkItem::Cancel(CancelSpec {
            package: package.to_string(),
            tag,
            id,
            user,
            must_have: NotificationFlags::default(),
            must_not_have,
            send_delete: true,
            reason: CancelReason::ListenerCancel,
        }))
    }

    /// Listener "clear all": ongoing and no-clear notifications survive.
    pub fn cancel_all_from_listener(
        &self,
        listener_id: u64,
        user: UserId,
    ) -> Result<(), NotificationError> {
        self.inner.require_listener(listener_id)?;
        let mut must_not_have = NotificationFlags::default();
        must_not_have.insert(NotificationFlags::ONGOING_EVENT);
        must_not_have.insert(NotificationFlags::NO_CLEAR);
        self.inner.send(WorkItem::CancelAll {
            package: None,
            user,
            must_not_have,
            send_delete: true,
            reason: CancelReason::ListenerCancelAll,
        })
    }

    /// Internal surface for activity-manager-adjacent code: a stopped
    /// service's notification loses its foreground-service protection.
    pub fn remove_foreground_service_flag(
        &self,
        package: &str,
        id: i32,
        user: UserId,
    ) -> Result<(), NotificationError> {
        self.inner.remove_foreground_service_flag(package, id, user);
        Ok(())
    }

    // --- snoozing ---

    pub fn snooze_notification(
        &self,
        key: &NotificationKey,
        condition: WakeCondition,
    ) -> Result<(), NotificationError> {
        self.inner.send(WorkItem::Snooze {
            key: key.clone(),
            condition,
        })
    }

    pub fn snooze_notification_from_listener(
        &self,
        listener_id: u64,
        key: &NotificationKey,
        condition: WakeCondition,
    ) -> Result<(), NotificationError> {
        self.inner.require_listener(listener_id)?;
        self.snooze_notification(key, condition)
    }

    /// Brings a snoozed record back through the normal post path.
    pub fn unsnooze_notification(&self, key: &NotificationKey) -> Result<(), NotificationError> {
        self.inner.send(WorkItem::RepostSnoozed { key: key.clone() })
    }

    /// External context trigger: repost everything parked behind this
    /// criterion.
    pub fn fire_snooze_criterion(&self, criterion_id: &str) -> Result<(), NotificationError> {
        let keys = lock(&self.inner.snoozed).keys_for_criterion(criterion_id);
        for key in keys {
            self.inner.send(WorkItem::RepostSnoozed { key })?;
        }
        Ok(())
    }

    // --- listeners and assistants ---

    pub fn register_listener(
        &self,
        component: ComponentName,
        user: UserId,
        trim: Trim,
        connection: Arc<dyn ListenerConnection>,
    ) -> u64 {
        self.inner.listeners.register(component, user, trim, connection)
    }

    pub fn unregister_listener(&self, listener_id: u64) {
        self.inner.listener_died(listener_id);
    }

    pub fn is_listener_registered(&self, listener_id: u64) -> bool {
        self.inner.listeners.get(listener_id).is_some()
    }

    pub fn register_assistant(
        &self,
        component: ComponentName,
        user: UserId,
        connection: Arc<dyn AssistantConnection>,
    ) -> u64 {
        self.inner
            .assistants
            .register(component, user, Trim::Full, connection)
    }

    pub fn unregister_assistant(&self, assistant_id: u64) {
        self.inner.assistants.unregister(assistant_id);
    }

    /// A listener asks the host to suppress effects. Empty hints retract the
    /// listener's contribution.
    pub fn request_listener_hints(
        &self,
        listener_id: u64,
        hints: ListenerHints,
    ) -> Result<(), NotificationError> {
        self.inner.request_listener_hints(listener_id, hints)
    }

    pub fn listener_hints(&self) -> ListenerHints {
        lock(&self.inner.state).aggregate_hints()
    }

    /// Ranking signals supplied by an assistant during (or after) the
    /// adjustment window.
    pub fn apply_adjustment(&self, adjustment: Adjustment) -> Result<(), NotificationError> {
        self.inner.apply_adjustment(adjustment)
    }

    // --- zen ---

    pub fn set_interruption_filter(&self, filter: InterruptionFilter) {
        self.inner.set_interruption_filter(filter);
    }

    pub fn interruption_filter(&self) -> InterruptionFilter {
        self.inner.deps.zen.interruption_filter()
    }

    pub fn set_zen_config(&self, config: ZenConfig) {
        self.inner.deps.zen.set_config(config);
        let _ = self.inner.ranking_tx.send(RankingTask::Sort { force: true });
        self.inner.save_policy();
    }

    pub fn zen_config(&self) -> ZenConfig {
        self.inner.deps.zen.config()
    }

    // --- channels ---

    pub fn create_notification_channel(
        &self,
        package: &str,
        user: UserId,
        channel: NotificationChannel,
    ) -> Result<(), NotificationError> {
        if channel.id.is_empty() {
            return Err(NotificationError::InvalidArgument(
                "channel id must not be empty".into(),
            ));
        }
        lock(&self.inner.ranking).config.create_channel(package, user, channel);
        self.inner.save_policy();
        Ok(())
    }

    pub fn update_notification_channel(
        &self,
        package: &str,
        user: UserId,
        channel: NotificationChannel,
    ) -> Result<(), NotificationError> {
        self.inner.update_notification_channel(package, user, channel)
    }

    pub fn get_notification_channel(
        &self,
        package: &str,
        user: UserId,
        channel_id: &str,
    ) -> Option<NotificationChannel> {
        lock(&self.inner.ranking)
            .config
            .channel(package, user, channel_id)
            .cloned()
    }

    pub fn get_notification_channels(
        &self,
        package: &str,
        user: UserId,
    ) -> Vec<NotificationChannel> {
        lock(&self.inner.ranking).config.channels_for(package, user)
    }

    /// Channel read on behalf of another package; requires a
    /// companion-device association for the listener's host app.
    pub fn get_channels_from_listener(
        &self,
        listener_id: u64,
        package: &str,
        user: UserId,
    ) -> Result<Vec<NotificationChannel>, NotificationError> {
        self.inner.require_companion(listener_id, user)?;
        Ok(self.get_notification_channels(package, user))
    }

    /// Channel write on behalf of another package; same association gate.
    pub fn update_channel_from_listener(
        &self,
        listener_id: u64,
        package: &str,
        user: UserId,
        channel: NotificationChannel,
    ) -> Result<(), NotificationError> {
        self.inner.require_companion(listener_id, user)?;
        self.inner.update_notification_channel(package, user, channel)
    }

    /// Package-level block (`Importance::None`) or unblock.
    pub fn set_package_importance(
        &self,
        package: &str,
        user: UserId,
        importance: Option<Importance>,
    ) {
        lock(&self.inner.ranking)
            .config
            .set_package_importance(package, user, importance);
        let _ = self.inner.ranking_tx.send(RankingTask::Sort { force: true });
        self.inner.save_policy();
    }

    // --- reads ---

    pub fn get_active_notifications(&self) -> Vec<PostedNotification> {
        lock(&self.inner.state)
            .store
            .posted_in_order()
            .map(|r| r.sbn.clone())
            .collect()
    }

    pub fn get_historical_notifications(&self, count: usize) -> Vec<ArchivedNotification> {
        lock(&self.inner.state).store.archive().newest(count)
    }

    pub fn snoozed_count(&self) -> usize {
        lock(&self.inner.snoozed).len()
    }

    pub fn package_stats(&self, package: &str) -> PackageStats {
        lock(&self.inner.stats).snapshot(package)
    }

    /// The policy document as an opaque backup payload.
    pub fn backup_payload(&self) -> Result<Vec<u8>, NotificationError> {
        let document = self.inner.current_policy_document();
        Ok(PolicyStore::backup_payload(&document)?)
    }

    pub fn restore_payload(&self, payload: &[u8]) -> Result<(), NotificationError> {
        let document = PolicyStore::restore_payload(payload)?;
        self.inner.deps.zen.set_config(document.zen);
        lock(&self.inner.ranking).config = document.ranking;
        let _ = self.inner.ranking_tx.send(RankingTask::Sort { force: true });
        self.inner.save_policy();
        Ok(())
    }

    // --- host state ---

    pub fn set_in_call(&self, in_call: bool) {
        let mut guard = lock(&self.inner.state);
        let state = &mut *guard;
        state.attention.in_call = in_call;
        self.inner.update_lights(state);
    }

    pub fn set_screen_on(&self, screen_on: bool) {
        let mut guard = lock(&self.inner.state);
        let state = &mut *guard;
        state.attention.screen_on = screen_on;
        self.inner.update_lights(state);
    }

    pub fn set_ringer_mode(&self, mode: RingerMode) {
        lock(&self.inner.state).attention.ringer_mode = mode;
    }

    pub fn set_effects_disabled(&self, disabled: bool) {
        lock(&self.inner.state).attention.effects_disabled = disabled;
    }

    pub fn set_current_user(&self, user: UserId) {
        lock(&self.inner.state).attention.current_user = user;
    }

    pub fn set_user_profile_group(&self, user: UserId, group: u32) {
        lock(&self.inner.state).profiles.set_group(user, group);
    }

    // --- lifecycle ---

    /// Barrier over the main worker: resolves once every previously
    /// submitted work item has been processed.
    pub async fn flush(&self) -> Result<(), NotificationError> {
        let (tx, rx) = oneshot::channel();
        self.inner.send(WorkItem::Flush(tx))?;
        rx.await.map_err(|_| NotificationError::ShutDown)
    }

    /// Drains both workers until queue-chained work has landed. Items like
    /// post-ready, autogroup summary posts, and ranking follow-ups append
    /// behind a single barrier, so this runs several barrier rounds.
    pub async fn settle(&self) -> Result<(), NotificationError> {
        for _ in 0..5 {
            self.flush().await?;
            let (tx, rx) = oneshot::channel();
            self.inner
                .ranking_tx
                .send(RankingTask::Flush(tx))
                .map_err(|_| NotificationError::ShutDown)?;
            rx.await.map_err(|_| NotificationError::ShutDown)?;
        }
        self.flush().await
    }

    pub async fn shutdown(self) {
        let _ = self.flush().await;
        self.worker.abort();
        self.ranking_worker.abort();
    }
}

async fn run_worker(inner: Arc<PipelineInner>, mut rx: mpsc::UnboundedReceiver<WorkItem>) {
    while let Some(item) = rx.recv().await {
        match item {
            WorkItem::Enqueue { record } => inner.handle_enqueue(record),
            WorkItem::PostReady { key } => inner.handle_post_ready(&key),
            WorkItem::Cancel(spec) => inner.handle_cancel(spec),
            WorkItem::CancelAll {
                package,
                user,
                must_not_have,
                send_delete,
                reason,
            } => inner.handle_cancel_all(package, user, must_not_have, send_delete, reason),
            WorkItem::Timeout { key, epoch } => inner.handle_timeout(&key, epoch),
            WorkItem::Snooze { key, condition } => inner.handle_snooze(&key, condition),
            WorkItem::RepostSnoozed { key } => inner.handle_repost_snoozed(&key),
            WorkItem::SendRankingUpdate => inner.handle_send_ranking_update(),
            WorkItem::Flush(ack) => {
                let _ = ack.send(());
            }
        }
    }
}

async fn run_ranking_worker(inner: Arc<PipelineInner>, mut rx: mpsc::UnboundedReceiver<RankingTask>) {
    while let Some(task) = rx.recv().await {
        match task {
            RankingTask::Reconsider(mut recon) => {
                recon.work().await;
                inner.apply_reconsideration(recon);
            }
            RankingTask::Sort { force } => inner.handle_ranking_sort(force),
            RankingTask::Flush(ack) => {
                let _ = ack.send(());
            }
        }
    }
}

impl PipelineInner {
    fn send(&self, item: WorkItem) -> Result<(), NotificationError> {
        self.work_tx
            .send(item)
            .map_err(|_| NotificationError::ShutDown)
    }

    fn require_listener(&self, listener_id: u64) -> Result<(), NotificationError> {
        self.listeners
            .get(listener_id)
            .map(|_| ())
            .ok_or_else(|| NotificationError::ServiceNotRegistered(listener_id.to_string()))
    }

    /// Privileged listener operations require a companion-device association
    /// for the listener's host package.
    fn require_companion(&self, listener_id: u64, user: UserId) -> Result<(), NotificationError> {
        let info = self
            .listeners
            .get(listener_id)
            .ok_or_else(|| NotificationError::ServiceNotRegistered(listener_id.to_string()))?;
        if !self.deps.companion.has_association(&info.component.package, user) {
            return Err(NotificationError::Security(format!(
                "listener {} has no companion device association",
                info.component
            )));
        }
        Ok(())
    }

    // --- enqueue entry ---

    #[allow(clippy::too_many_arguments)]
    fn enqueue_notification(
        self: &Arc<Self>,
        package: &str,
        op_package: &str,
        calling_uid: u32,
        calling_pid: u32,
        tag: Option<String>,
        id: i32,
        notification: Notification,
        user: UserId,
    ) -> Result<(), NotificationError> {
        if package.is_empty() {
            warn!("dropping enqueue with empty package name");
            return Ok(());
        }
        let is_system = self.deps.packages.is_system_uid(calling_uid);
        if user.is_all() && !is_system {
            return Err(NotificationError::Security(
                "only system callers may post to all users".into(),
            ));
        }
        // System callers may post on behalf of another package; resolve the
        // owning uid so quotas and blocks land on the right app.
        let uid = if is_system && package != op_package {
            self.deps
                .packages
                .package_uid(package, user)
                .unwrap_or(calling_uid)
        } else {
            calling_uid
        };

        let channel = lock(&self.ranking)
            .config
            .channel(package, user, &notification.channel_id)
            .cloned();
        let Some(channel) = channel else {
            if self.tuning.warn_on_unknown_channel {
                warn!(
                    package,
                    channel = %notification.channel_id,
                    "no channel for posted notification, dropping"
                );
            } else {
                debug!(
                    package,
                    channel = %notification.channel_id,
                    "no channel for posted notification, dropping"
                );
            }
            return Ok(());
        };

        let sbn = PostedNotification::new(
            package,
            op_package,
            id,
            tag,
            uid,
            calling_pid,
            user,
            notification,
            Utc::now(),
        );
        let record = NotificationRecord::new(sbn, channel);
        if !self.check_disqualifying(&record, calling_uid)? {
            return Ok(());
        }
        lock(&self.stats).register_enqueued(package, Instant::now());
        self.send(WorkItem::Enqueue { record })
    }

    /// Admission policy. `Ok(false)` is a silent rejection; `Err` is a hard
    /// caller failure.
    fn check_disqualifying(
        &self,
        record: &NotificationRecord,
        calling_uid: u32,
    ) -> Result<bool, NotificationError> {
        let package = record.package().to_string();
        let user = record.user();
        let key = record.key().clone();
        let is_system = self.deps.packages.is_system_uid(calling_uid);
        let from_listener_package = self.listeners.is_registered_package(&package);

        if !is_system && !from_listener_package {
            let (is_update, posted_count) = {
                let state = lock(&self.state);
                (
                    state.store.is_posted(&key),
                    state.store.count_posted_for_package(&package, user, &key),
                )
            };
            if is_update {
                // Updates are rate limited; creating is capped by count below.
                let now = Instant::now();
                let mut stats = lock(&self.stats);
                let rate = stats.enqueue_rate(&package, now);
                if rate > self.tuning.max_package_enqueue_rate {
                    let should_log = stats.register_over_rate_quota(
                        &package,
                        now,
                        Duration::from_millis(self.tuning.over_rate_log_interval_ms),
                    );
                    if should_log {
                        error!(package = %package, rate, "package over enqueue rate, shedding events");
                    }
                    return Ok(false);
                }
            } else {
                if self.deps.packages.is_instant_app(&package, user) {
                    return Err(NotificationError::Security(format!(
                        "instant app {package} cannot create notifications"
                    )));
                }
                if posted_count >= self.tuning.max_package_notifications {
                    lock(&self.stats).register_over_count_quota(&package);
                    error!(
                        package = %package,
                        count = posted_count,
                        "package has too many posted notifications, not showing more"
                    );
                    return Ok(false);
                }
            }
        }

        // A snoozed key folds the new payload into the parked copy.
        let folded = {
            let mut snoozed = lock(&self.snoozed);
            snoozed.is_snoozed(&key) && snoozed.update(record.clone())
        };
        if folded {
            debug!(%key, "ignored enqueue for snoozed notification, payload folded in");
            lock(&self.stats).register_snoozed_enqueue(&package);
            return Ok(false);
        }

        if self.deps.packages.is_suspended(&package, user) {
            warn!(package = %package, "suppressing notification, package suspended by admin");
            lock(&self.stats).register_suspended_by_admin(&package);
            return Ok(false);
        }
        let package_blocked =
            lock(&self.ranking).config.package_importance(&package, user) == Some(Importance::None);
        if package_blocked || record.channel.importance == Importance::None {
            warn!(package = %package, "suppressing notification blocked by user");
            lock(&self.stats).register_blocked(&package);
            return Ok(false);
        }
        Ok(true)
    }

    // --- worker handlers ---

    fn handle_enqueue(self: &Arc<Self>, mut record: NotificationRecord) {
        let key = record.key().clone();
        let mut fanout = Vec::new();
        {
            let mut guard = lock(&self.state);
            let state = &mut *guard;

            // Arm the timeout; re-enqueuing bumps the epoch so an alarm for
            // the previous instance is stale when it fires.
            let epoch = {
                let slot = state.timeout_epochs.entry(key.clone()).or_insert(0);
                *slot += 1;
                *slot
            };
            if let Some(ms) = record.sbn.notification.timeout_after_ms.filter(|ms| *ms > 0) {
                let tx = self.work_tx.clone();
                let timeout_key = key.clone();
                self.rt.spawn(async move {
                    tokio::time::sleep(Duration::from_millis(ms)).await;
                    let _ = tx.send(WorkItem::Timeout {
                        key: timeout_key,
                        epoch,
                    });
                });
            }

            if let Some(old) = state.store.get(&key) {
                let old = old.clone();
                record.copy_ranking_information(&old);
            }

            self.handle_grouped_notification(state, &mut record, &mut fanout);

            // A group child brings a snoozed summary of its group back.
            if record.sbn.is_group_child() {
                let parked = lock(&self.snoozed).parked_group_summary(
                    record.user(),
                    record.package(),
                    &record.group_key(),
                );
                if let Some(summary_key) = parked {
                    let _ = self.work_tx.send(WorkItem::RepostSnoozed { key: summary_key });
                }
            }

            for recon in lock(&self.ranking).extract_signals(&mut record) {
                let _ = self.ranking_tx.send(RankingTask::Reconsider(recon));
            }

            for info in self.assistants.services() {
                if info.is_visible_to(&state.profiles, record.user()) {
                    fanout.push(Fanout::AssistantEnqueued {
                        info,
                        sbn: record.sbn.clone(),
                    });
                }
            }

            state.store.push_enqueued(record);
        }

        if self.assistants.is_empty() {
            let _ = self.work_tx.send(WorkItem::PostReady { key });
        } else {
            // Hold the record in the enqueued list for the adjustment window.
            let tx = self.work_tx.clone();
            let delay = Duration::from_millis(self.tuning.assistant_adjustment_delay_ms);
            self.rt.spawn(async move {
                tokio::time::sleep(delay).await;
                let _ = tx.send(WorkItem::PostReady { key });
            });
        }
        self.dispatch(fanout);
    }

    /// Keeps the group-summary map consistent and cascades children whose
    /// summary just went away (replaced by a non-summary or moved groups).
    fn handle_grouped_notification(
        self: &Arc<Self>,
        state: &mut PipelineState,
        record: &mut NotificationRecord,
        fanout: &mut Vec<Fanout>,
    ) {
        {
            let n = &mut record.sbn.notification;
            if n.group_summary && n.group.is_none() {
                // A summary without an app group would corrupt auto-bundling.
                n.group_summary = false;
            }
        }
        let key = record.key().clone();
        let group = record.group_key();
        let is_summary = record.sbn.notification.is_group_summary() && record.sbn.is_app_group();

        let old_info = state
            .store
            .get(&key)
            .map(|old| (old.group_key(), old.sbn.notification.is_group_summary() && old.sbn.is_app_group()));

        if let Some((old_group, true)) = &old_info {
            let removed = state.store.remove_summary(old_group);
            if removed.as_ref() != Some(&key) {
                error!(%key, "tracked group summary did not match replaced record, healing");
            }
        }
        if is_summary {
            state.store.set_summary(group.clone(), key.clone());
        }
        if let Some((old_group, old_is_summary)) = old_info {
            if old_is_summary && (!is_summary || old_group != group) {
                self.cancel_group_children(
                    state,
                    &old_group,
                    CancelReason::GroupSummaryCanceled,
                    false,
                    fanout,
                );
            }
        }
    }

    fn handle_post_ready(self: &Arc<Self>, key: &NotificationKey) {
        let mut fanout = Vec::new();
        {
            let mut guard = lock(&self.state);
            let state = &mut *guard;

            let Some(mut record) = state.store.take_enqueued(key) else {
                info!(%key, "no enqueued record to post for key");
                return;
            };
            if record.is_canceled {
                debug!(%key, "record was canceled while enqueued, never posting");
                return;
            }

            let old = state.store.get(key).cloned();
            if let Some(old_record) = &old {
                record.is_update = true;
                // A stopped foreground service keeps its protection until the
                // host explicitly removes the flag.
                if old_record
                    .sbn
                    .notification
                    .flags
                    .contains(NotificationFlags::FOREGROUND_SERVICE)
                {
                    record
                        .sbn
                        .notification
                        .flags
                        .insert(NotificationFlags::FOREGROUND_SERVICE);
                }
            }
            if record
                .sbn
                .notification
                .flags
                .contains(NotificationFlags::FOREGROUND_SERVICE)
            {
                record.sbn.notification.flags.insert(NotificationFlags::ONGOING_EVENT);
                record.sbn.notification.flags.insert(NotificationFlags::NO_CLEAR);
            }

            {
                let mut stats = lock(&self.stats);
                if record.is_update {
                    stats.register_updated(record.package());
                } else {
                    stats.register_posted(record.package());
                }
            }

            let sbn = record.sbn.clone();
            state.store.insert_posted(record);
            if let Some(posted) = state.store.get_mut(key) {
                self.apply_zen(posted);
            }
            lock(&self.ranking).sort(&mut state.store);

            self.collect_posted_dispatches(
                state,
                &sbn,
                old.as_ref().map(|o| &o.sbn),
                &mut fanout,
            );

            let actions = lock(&self.grouping).on_notification_posted(&sbn);
            self.apply_group_actions(state, actions, &mut fanout);

            self.buzz_beep_blink(state, key);
        }
        self.dispatch(fanout);
    }

    fn handle_cancel(self: &Arc<Self>, spec: CancelSpec) {
        let key =
            NotificationKey::for_notification(spec.user, &spec.package, spec.tag.as_deref(), spec.id);
        let mut fanout = Vec::new();
        {
            let mut guard = lock(&self.state);
            let state = &mut *guard;

            let posted_flags = state.store.get(&key).map(|r| r.sbn.notification.flags);
            if let Some(flags) = posted_flags {
                if !flags.contains(spec.must_have) || flags.intersects(spec.must_not_have) {
                    return;
                }
                if let Some(record) = state.store.remove_posted(&key) {
                    let is_summary = record.sbn.notification.is_group_summary();
                    let group = record.group_key();
                    self.cancel_record_locked(
                        state,
                        record,
                        spec.reason,
                        true,
                        spec.send_delete,
                        &mut fanout,
                    );
                    if is_summary && spec.reason.is_terminal() {
                        self.cancel_group_children(
                            state,
                            &group,
                            CancelReason::GroupSummaryCanceled,
                            spec.send_delete,
                            &mut fanout,
                        );
                    }
                }
            } else {
                let enqueued_flags =
                    state.store.enqueued_mut(&key).map(|r| r.sbn.notification.flags);
                if let Some(flags) = enqueued_flags {
                    if !flags.contains(spec.must_have) || flags.intersects(spec.must_not_have) {
                        return;
                    }
                    if let Some(mut record) = state.store.take_enqueued(&key) {
                        record.is_canceled = true;
                        let is_summary = record.sbn.notification.is_group_summary();
                        let group = record.group_key();
                        self.cancel_record_locked(
                            state,
                            record,
                            spec.reason,
                            false,
                            spec.send_delete,
                            &mut fanout,
                        );
                        if is_summary && spec.reason.is_terminal() {
                            self.cancel_group_children(
                                state,
                                &group,
                                CancelReason::GroupSummaryCanceled,
                                spec.send_delete,
                                &mut fanout,
                            );
                        }
                    }
                } else if lock(&self.snoozed).cancel(&key).is_some() {
                    debug!(%key, "canceled snoozed notification");
                }
            }
        }
        self.dispatch(fanout);
    }

    fn handle_cancel_all(
        self: &Arc<Self>,
        package: Option<String>,
        user: UserId,
        must_not_have: NotificationFlags,
        send_delete: bool,
        reason: CancelReason,
    ) {
        let mut fanout = Vec::new();
        {
            let mut guard = lock(&self.state);
            let state = &mut *guard;

            let posted: Vec<(NotificationKey, NotificationFlags)> = state
                .store
                .posted_in_order()
                .filter(|r| {
                    package.as_deref().map_or(true, |p| r.package() == p)
                        && (user.is_all() || r.user() == user)
                })
                .map(|r| (r.key().clone(), r.sbn.notification.flags))
                .collect();
            for (key, flags) in posted {
                if flags.intersects(must_not_have) {
                    continue;
                }
                if let Some(record) = state.store.remove_posted(&key) {
                    self.cancel_record_locked(state, record, reason, true, send_delete, &mut fanout);
                }
            }

            for key in state.store.enqueued_keys() {
                let matches = state.store.enqueued_mut(&key).map_or(false, |r| {
                    package.as_deref().map_or(true, |p| r.package() == p)
                        && (user.is_all() || r.user() == user)
                        && !r.sbn.notification.flags.intersects(must_not_have)
                });
                if !matches {
                    continue;
                }
                if let Some(mut record) = state.store.take_enqueued(&key) {
                    record.is_canceled = true;
                    self.cancel_record_locked(state, record, reason, false, send_delete, &mut fanout);
                }
            }
        }

        {
            let mut snoozed = lock(&self.snoozed);
            let keys = match &package {
                Some(p) => snoozed.keys_for_package(user, p),
                None => snoozed.keys_for_user(user),
            };
            for key in keys {
                snoozed.cancel(&key);
            }
        }
        self.dispatch(fanout);
    }

    fn handle_timeout(self: &Arc<Self>, key: &NotificationKey, epoch: u64) {
        let mut fanout = Vec::new();
        {
            let mut guard = lock(&self.state);
            let state = &mut *guard;
            if state.timeout_epochs.get(key) != Some(&epoch) {
                return; // superseded or canceled since arming
            }
            if let Some(record) = state.store.remove_posted(key) {
                let is_summary = record.sbn.notification.is_group_summary();
                let group = record.group_key();
                self.cancel_record_locked(state, record, CancelReason::Timeout, true, false, &mut fanout);
                if is_summary {
                    self.cancel_group_children(
                        state,
                        &group,
                        CancelReason::GroupSummaryCanceled,
                        false,
                        &mut fanout,
                    );
                }
            } else if let Some(mut record) = state.store.take_enqueued(key) {
                record.is_canceled = true;
                self.cancel_record_locked(state, record, CancelReason::Timeout, false, false, &mut fanout);
            }
        }
        self.dispatch(fanout);
    }

    fn handle_snooze(self: &Arc<Self>, key: &NotificationKey, condition: WakeCondition) {
        let mut fanout = Vec::new();
        {
            let mut guard = lock(&self.state);
            let state = &mut *guard;
            let Some(record) = state.store.get(key) else {
                debug!(%key, "snooze target not posted, ignoring");
                return;
            };

            let targets: Vec<NotificationKey> = if record.sbn.is_group() {
                let group = record.group_key();
                if record.sbn.notification.is_group_summary() {
                    // Snoozing a summary snoozes the whole group.
                    state.store.posted_members_of_group(&group)
                } else if state.store.summary_key(&group).is_some() {
                    let members = state.store.posted_members_of_group(&group);
                    if members.len() == 2 {
                        // Last child: take the summary along so it is not
                        // orphaned.
                        members
                    } else {
                        vec![key.clone()]
                    }
                } else {
                    vec![key.clone()]
                }
            } else {
                vec![key.clone()]
            };

            for target in targets {
                self.snooze_one(state, &target, &condition, &mut fanout);
            }
        }
        self.dispatch(fanout);
    }

    fn snooze_one(
        self: &Arc<Self>,
        state: &mut PipelineState,
        key: &NotificationKey,
        condition: &WakeCondition,
        fanout: &mut Vec<Fanout>,
    ) {
        let Some(record) = state.store.remove_posted(key) else {
            return;
        };
        let sbn = record.sbn.clone();
        self.cancel_record_locked(
            state,
            record.clone(),
            CancelReason::Snoozed,
            true,
            false,
            fanout,
        );

        if let WakeCondition::Criterion(criterion) = condition {
            for info in self.assistants.services() {
                if info.is_visible_to(&state.profiles, sbn.user) {
                    fanout.push(Fanout::AssistantSnoozed {
                        info,
                        sbn: sbn.clone(),
                        criterion: criterion.clone(),
                    });
                }
            }
        }
        if let WakeCondition::TimedMs(ms) = condition {
            let tx = self.work_tx.clone();
            let wake_key = key.clone();
            let ms = *ms;
            self.rt.spawn(async move {
                tokio::time::sleep(Duration::from_millis(ms)).await;
                let _ = tx.send(WorkItem::RepostSnoozed { key: wake_key });
            });
        }
        lock(&self.snoozed).park(record, condition.clone());
    }

    fn handle_repost_snoozed(self: &Arc<Self>, key: &NotificationKey) {
        let Some(parked) = lock(&self.snoozed).take(key) else {
            return; // superseded, unsnoozed earlier, or swept
        };
        let mut record = parked.record;
        record.is_canceled = false;
        record.is_update = false;
        // Back through the normal path; extraction reruns but resolved
        // ranking signals (affinity, assistant rank) survive on the record.
        self.handle_enqueue(record);
    }

    fn handle_send_ranking_update(self: &Arc<Self>) {
        self.ranking_update_pending.store(false, Ordering::SeqCst);
        let mut fanout = Vec::new();
        {
            let guard = lock(&self.state);
            for info in self.listeners.services() {
                let update = self.make_ranking_update(&guard, &info);
                fanout.push(Fanout::ListenerRanking { info, update });
            }
        }
        self.dispatch(fanout);
    }

    fn schedule_send_ranking_update(&self) {
        // Bursts collapse onto one pending dispatch.
        if !self.ranking_update_pending.swap(true, Ordering::SeqCst) {
            let _ = self.work_tx.send(WorkItem::SendRankingUpdate);
        }
    }

    // --- ranking worker handlers ---

    fn apply_reconsideration(self: &Arc<Self>, recon: Box<dyn RankingReconsideration>) {
        let key = recon.key().clone();
        let mut changed = false;
        {
            let mut guard = lock(&self.state);
            let state = &mut *guard;
            if !state.store.is_posted(&key) {
                return;
            }
            let index_before = state.store.index_of(&key);
            let (intercept_before, visibility_before) = state
                .store
                .get(&key)
                .map(|r| (r.intercepted, r.visibility_override))
                .unwrap_or((false, None));

            if let Some(record) = state.store.get_mut(&key) {
                recon.apply(record);
                self.apply_zen(record);
            }
            lock(&self.ranking).sort(&mut state.store);

            let index_after = state.store.index_of(&key);
            let (intercept_after, visibility_after) = state
                .store
                .get(&key)
                .map(|r| (r.intercepted, r.visibility_override))
                .unwrap_or((false, None));
            changed = index_before != index_after
                || intercept_before != intercept_after
                || visibility_before != visibility_after;
            if intercept_before && !intercept_after {
                // Interception lifted after the fact; the record may alert now.
                self.buzz_beep_blink(state, &key);
            }
        }
        if changed {
            self.schedule_send_ranking_update();
        }
    }

    fn handle_ranking_sort(self: &Arc<Self>, force: bool) {
        let mut changed = force;
        let mut deferred: Vec<Box<dyn RankingReconsideration>> = Vec::new();
        {
            let mut guard = lock(&self.state);
            let state = &mut *guard;
            let before: Vec<(NotificationKey, String, Option<Visibility>, bool)> = state
                .store
                .posted_in_order()
                .map(|r| {
                    (
                        r.key().clone(),
                        r.group_key(),
                        r.visibility_override,
                        r.show_badge,
                    )
                })
                .collect();
            {
                let ranking = lock(&self.ranking);
                for (key, ..) in &before {
                    if let Some(record) = state.store.get_mut(key) {
                        deferred.extend(ranking.extract_signals(record));
                        self.apply_zen(record);
                    }
                }
                ranking.sort(&mut state.store);
            }
            if !changed {
                let after: Vec<(NotificationKey, String, Option<Visibility>, bool)> = state
                    .store
                    .posted_in_order()
                    .map(|r| {
                        (
                            r.key().clone(),
                            r.group_key(),
                            r.visibility_override,
                            r.show_badge,
                        )
                    })
                    .collect();
                changed = before != after;
            }
        }
        for recon in deferred {
            let _ = self.ranking_tx.send(RankingTask::Reconsider(recon));
        }
        if changed {
            self.schedule_send_ranking_update();
        }
    }

    // --- shared internals (all run under the state lock) ---

    fn apply_zen(&self, record: &mut NotificationRecord) {
        record.intercepted = self.deps.zen.should_intercept(record);
        record.suppressed_effects = if record.intercepted {
            let mut suppressed = crate::types::SuppressedEffects::default();
            if self.deps.zen.should_suppress_when_screen_off() {
                suppressed = suppressed.union(crate::types::SuppressedEffects::SCREEN_OFF);
            }
            if self.deps.zen.should_suppress_when_screen_on() {
                suppressed = suppressed.union(crate::types::SuppressedEffects::SCREEN_ON);
            }
            suppressed
        } else {
            crate::types::SuppressedEffects::default()
        };
    }

    /// Ranking snapshot over this listener's visible subset.
    fn make_ranking_update(
        &self,
        state: &PipelineState,
        info: &ManagedServiceInfo<dyn ListenerConnection>,
    ) -> RankingUpdate {
        let mut entries = Vec::new();
        for record in state.store.posted_in_order() {
            if !info.is_visible_to(&state.profiles, record.user()) {
                continue;
            }
            entries.push(RankingEntry::from_record(entries.len(), record));
        }
        RankingUpdate { entries }
    }

    /// Fan-out for a freshly posted (or updated) record, honoring per-listener
    /// visibility transitions: a listener that could see the old instance but
    /// not the new one gets a synthesized removal instead.
    fn collect_posted_dispatches(
        &self,
        state: &PipelineState,
        sbn: &PostedNotification,
        old_sbn: Option<&PostedNotification>,
        fanout: &mut Vec<Fanout>,
    ) {
        for info in self.listeners.services() {
            let visible = info.is_visible_to(&state.profiles, sbn.user);
            let old_visible =
                old_sbn.map_or(false, |o| info.is_visible_to(&state.profiles, o.user));
            if !visible && !old_visible {
                continue;
            }
            let update = self.make_ranking_update(state, &info);
            if old_visible && !visible {
                if let Some(old) = old_sbn {
                    fanout.push(Fanout::ListenerRemoved {
                        info,
                        sbn: old.clone_light(),
                        update,
                        reason: CancelReason::UserStopped,
                    });
                }
                continue;
            }
            let payload = match info.trim {
                Trim::Full => sbn.clone(),
                Trim::Light => sbn.clone_light(),
            };
            fanout.push(Fanout::ListenerPosted {
                info,
                sbn: payload,
                update,
            });
        }
    }

    /// The tail of every removal: listener fan-out, effect ownership, stats,
    /// map cleanup, archiving. The record must already be out of the store.
    fn cancel_record_locked(
        self: &Arc<Self>,
        state: &mut PipelineState,
        mut record: NotificationRecord,
        reason: CancelReason,
        was_posted: bool,
        send_delete: bool,
        fanout: &mut Vec<Fanout>,
    ) {
        let key = record.key().clone();
        if reason.is_terminal() {
            record.is_canceled = true;
        }

        if send_delete {
            if let Some(token) = record.sbn.notification.delete_hook.clone() {
                fanout.push(Fanout::DeleteHook {
                    package: record.package().to_string(),
                    token,
                });
            }
        }

        if was_posted {
            let light_sbn = record.sbn.clone_light();
            for info in self.listeners.services() {
                if !info.is_visible_to(&state.profiles, record.user()) {
                    continue;
                }
                let update = self.make_ranking_update(state, &info);
                fanout.push(Fanout::ListenerRemoved {
                    info,
                    sbn: light_sbn.clone(),
                    update,
                    reason,
                });
            }

            if state.attention.sound_owner.as_ref() == Some(&key) {
                state.attention.sound_owner = None;
                if let Err(e) = self.deps.sound.stop() {
                    warn!(error = %e, "failed to stop notification sound");
                }
            }
            if state.attention.vibrate_owner.as_ref() == Some(&key) {
                state.attention.vibrate_owner = None;
                if let Err(e) = self.deps.vibrator.cancel() {
                    warn!(error = %e, "failed to cancel vibration");
                }
            }
            state.attention.light_owners.retain(|k| k != &key);
            self.update_lights(state);

            let actions = lock(&self.grouping).on_notification_removed(&record.sbn);
            self.apply_group_actions(state, actions, fanout);
        }

        lock(&self.stats).register_removed(record.package());

        let group_key = record.group_key();
        state.store.remove_summary_if(&group_key, &key);
        state
            .store
            .remove_autobundle_summary_if(record.user(), record.package(), &key);
        if reason.is_terminal() {
            state.timeout_epochs.remove(&key);
        }

        state.store.archive_mut().record(record.archived(reason));
    }

    /// Cascade removal of an explicit group's children from both lists.
    /// Foreground-service children survive.
    fn cancel_group_children(
        self: &Arc<Self>,
        state: &mut PipelineState,
        group_key: &str,
        reason: CancelReason,
        send_delete: bool,
        fanout: &mut Vec<Fanout>,
    ) {
        for key in state.store.posted_children_of_group(group_key) {
            let protected = state.store.get(&key).map_or(true, |r| {
                r.sbn
                    .notification
                    .flags
                    .contains(NotificationFlags::FOREGROUND_SERVICE)
            });
            if protected {
                continue;
            }
            if let Some(record) = state.store.remove_posted(&key) {
                self.cancel_record_locked(state, record, reason, true, send_delete, fanout);
            }
        }
        for key in state.store.enqueued_children_of_group(group_key) {
            let protected = state.store.enqueued_mut(&key).map_or(true, |r| {
                r.sbn
                    .notification
                    .flags
                    .contains(NotificationFlags::FOREGROUND_SERVICE)
            });
            if protected {
                continue;
            }
            if let Some(mut record) = state.store.take_enqueued(&key) {
                record.is_canceled = true;
                self.cancel_record_locked(state, record, reason, false, send_delete, fanout);
            }
        }
    }

    fn apply_group_actions(
        self: &Arc<Self>,
        state: &mut PipelineState,
        actions: Vec<GroupAction>,
        fanout: &mut Vec<Fanout>,
    ) {
        let mut resort = false;
        for action in actions {
            match action {
                GroupAction::Autogroup(key) => {
                    if let Some(record) = state.store.get_mut(&key) {
                        if record.sbn.override_group_key.is_none() {
                            record.sbn.override_group_key = Some(AUTOGROUP_KEY.to_string());
                            resort = true;
                        }
                    }
                }
                GroupAction::Unautogroup(key) => {
                    if let Some(record) = state.store.get_mut(&key) {
                        if record.sbn.override_group_key.as_deref() == Some(AUTOGROUP_KEY) {
                            record.sbn.override_group_key = None;
                            resort = true;
                        }
                    }
                }
                GroupAction::PostSummary {
                    user,
                    package,
                    triggering_key,
                } => {
                    self.post_autogroup_summary(state, user, package, &triggering_key);
                }
                GroupAction::CancelSummary { user, package } => {
                    if let Some(key) = state.store.remove_autobundle_summary(user, &package) {
                        if let Some(record) = state.store.remove_posted(&key) {
                            self.cancel_record_locked(
                                state,
                                record,
                                CancelReason::Unautobundled,
                                true,
                                false,
                                fanout,
                            );
                        } else if let Some(mut record) = state.store.take_enqueued(&key) {
                            record.is_canceled = true;
                            self.cancel_record_locked(
                                state,
                                record,
                                CancelReason::Unautobundled,
                                false,
                                false,
                                fanout,
                            );
                        }
                    }
                }
            }
        }
        if resort {
            let _ = self.ranking_tx.send(RankingTask::Sort { force: false });
        }
    }

    /// Synthesizes and enqueues the autogroup summary for a package. The
    /// summary rides the normal enqueue path under the reserved key.
    fn post_autogroup_summary(
        self: &Arc<Self>,
        state: &mut PipelineState,
        user: UserId,
        package: String,
        triggering_key: &NotificationKey,
    ) {
        if state.store.autobundle_summary_key(user, &package).is_some() {
            return;
        }
        let Some(trigger) = state.store.get(triggering_key) else {
            // Canceled again already; a later adjustment posts the summary.
            return;
        };
        let channel = trigger.channel.clone();
        let uid = trigger.sbn.uid;

        let mut flags = NotificationFlags::default();
        flags.insert(NotificationFlags::AUTOGROUP_SUMMARY);
        flags.insert(NotificationFlags::LOCAL_ONLY);
        let notification = Notification {
            channel_id: channel.id.clone(),
            title: package.clone(),
            group: Some(AUTOGROUP_KEY.to_string()),
            group_summary: true,
            group_alert: GroupAlert::Children,
            flags,
            ..Default::default()
        };
        let sbn = PostedNotification::new(
            package.clone(),
            "herald",
            i32::MAX,
            Some(AUTOGROUP_KEY.to_string()),
            uid,
            0,
            user,
            notification,
            Utc::now(),
        );
        let record = NotificationRecord::new(sbn, channel);
        state
            .store
            .set_autobundle_summary(user, package, record.key().clone());
        let _ = self.work_tx.send(WorkItem::Enqueue { record });
    }

    /// Evaluates and applies sound/vibration/light for one posted record.
    fn buzz_beep_blink(self: &Arc<Self>, state: &mut PipelineState, key: &NotificationKey) {
        let hints = state.aggregate_hints();
        let Some(record) = state.store.get(key) else {
            return;
        };
        let is_call = self.deps.zen.is_call(record);
        let outcome = alerts::evaluate(record, &state.attention, hints, is_call);

        if let Some(cmd) = &outcome.sound {
            state.attention.sound_owner = Some(key.clone());
            let result = if cmd.in_call {
                self.deps.sound.play_in_call_alert()
            } else {
                self.deps.sound.play(&cmd.uri, cmd.looping)
            };
            if let Err(e) = result {
                warn!(error = %e, "sound device rejected playback");
            }
        } else if outcome.stop_sound {
            state.attention.sound_owner = None;
            if let Err(e) = self.deps.sound.stop() {
                warn!(error = %e, "failed to stop notification sound");
            }
        }

        if let Some(cmd) = &outcome.vibration {
            state.attention.vibrate_owner = Some(key.clone());
            if let Err(e) = self.deps.vibrator.vibrate(&cmd.pattern, cmd.repeat) {
                warn!(error = %e, "vibrator rejected pattern");
            }
        } else if outcome.stop_vibration {
            state.attention.vibrate_owner = None;
            if let Err(e) = self.deps.vibrator.cancel() {
                warn!(error = %e, "failed to cancel vibration");
            }
        }

        state.attention.light_owners.retain(|k| k != key);
        if outcome.show_light {
            state.attention.light_owners.push(key.clone());
        }
        self.update_lights(state);
    }

    /// Drives the LED from the top live light owner, honoring call/screen
    /// state. Self-heals stale owners.
    fn update_lights(&self, state: &mut PipelineState) {
        let top = loop {
            let Some(owner) = state.attention.light_owners.last().cloned() else {
                break None;
            };
            match state.store.get(&owner) {
                Some(record) => break record.effective_light(),
                None => {
                    error!(key = %owner, "light owner missing from posted index, healing");
                    state.attention.light_owners.pop();
                }
            }
        };
        let lit = match top {
            Some(spec) if !state.attention.in_call && !state.attention.screen_on => Some(spec),
            _ => None,
        };
        let result = match lit {
            Some(spec) => self.deps.light.set(spec),
            None => self.deps.light.off(),
        };
        if let Err(e) = result {
            warn!(error = %e, "notification light unavailable");
        }
    }

    // --- listener state management ---

    fn request_listener_hints(
        self: &Arc<Self>,
        listener_id: u64,
        hints: ListenerHints,
    ) -> Result<(), NotificationError> {
        self.require_listener(listener_id)?;
        let changed = {
            let mut state = lock(&self.state);
            let before = state.aggregate_hints();
            if hints.is_empty() {
                state.hints_by_service.remove(&listener_id);
            } else {
                state.hints_by_service.insert(listener_id, hints);
            }
            state.aggregate_hints() != before
        };
        if changed {
            self.broadcast_hints();
        }
        Ok(())
    }

    fn broadcast_hints(self: &Arc<Self>) {
        let hints = lock(&self.state).aggregate_hints();
        let mut fanout = Vec::new();
        for info in self.listeners.services() {
            fanout.push(Fanout::ListenerHintsChanged { info, hints });
        }
        self.dispatch(fanout);
    }

    /// Unbinds a listener and retracts everything it contributed.
    fn listener_died(self: &Arc<Self>, listener_id: u64) {
        if self.listeners.unregister(listener_id).is_none() {
            return;
        }
        let changed = {
            let mut state = lock(&self.state);
            let before = state.aggregate_hints();
            state.hints_by_service.remove(&listener_id).is_some()
                && state.aggregate_hints() != before
        };
        if changed {
            self.broadcast_hints();
        }
    }

    fn set_interruption_filter(self: &Arc<Self>, filter: InterruptionFilter) {
        self.deps.zen.set_interruption_filter(filter);
        let _ = self.ranking_tx.send(RankingTask::Sort { force: true });
        let mut fanout = Vec::new();
        for info in self.listeners.services() {
            fanout.push(Fanout::ListenerFilterChanged { info, filter });
        }
        self.dispatch(fanout);
        self.save_policy();
    }

    fn apply_adjustment(self: &Arc<Self>, adjustment: Adjustment) -> Result<(), NotificationError> {
        let Some(key) = adjustment.key.clone() else {
            return Err(NotificationError::InvalidArgument(
                "adjustment carries no notification key".into(),
            ));
        };
        let posted = {
            let mut guard = lock(&self.state);
            let state = &mut *guard;
            let in_enqueued = state.store.enqueued_mut(&key).is_some();
            let record = if in_enqueued {
                state.store.enqueued_mut(&key)
            } else {
                state.store.get_mut(&key)
            };
            let Some(record) = record else {
                return Err(NotificationError::NotFound(key));
            };
            if let Some(people) = &adjustment.people {
                record.people_override = people.clone();
                // New people may change affinity; reset so the extractor
                // looks again on the next pass.
                record.contact_affinity = crate::record::NONE_AFFINITY;
            }
            if let Some(criteria) = &adjustment.snooze_criteria {
                record.snooze_criteria = criteria.clone();
            }
            if let Some(rank) = adjustment.rank {
                record.assistant_rank = Some(rank);
            }
            !in_enqueued
        };
        if posted {
            let _ = self.ranking_tx.send(RankingTask::Sort { force: false });
        }
        Ok(())
    }

    fn update_notification_channel(
        self: &Arc<Self>,
        package: &str,
        user: UserId,
        channel: NotificationChannel,
    ) -> Result<(), NotificationError> {
        if channel.id.is_empty() {
            return Err(NotificationError::InvalidArgument(
                "channel id must not be empty".into(),
            ));
        }
        lock(&self.ranking)
            .config
            .update_channel(package, user, channel.clone());
        // Live records carry a copy of their channel; refresh them.
        {
            let mut guard = lock(&self.state);
            let state = &mut *guard;
            let posted: Vec<NotificationKey> = state
                .store
                .posted_in_order()
                .filter(|r| {
                    r.package() == package
                        && r.user() == user
                        && r.channel.id == channel.id
                })
                .map(|r| r.key().clone())
                .collect();
            for key in posted {
                if let Some(record) = state.store.get_mut(&key) {
                    record.channel = channel.clone();
                }
            }
            for key in state.store.enqueued_keys() {
                if let Some(record) = state.store.enqueued_mut(&key) {
                    if record.package() == package
                        && record.user() == user
                        && record.channel.id == channel.id
                    {
                        record.channel = channel.clone();
                    }
                }
            }
        }
        let _ = self.ranking_tx.send(RankingTask::Sort { force: true });
        self.save_policy();
        Ok(())
    }

    fn remove_foreground_service_flag(self: &Arc<Self>, package: &str, id: i32, user: UserId) {
        let mut fanout = Vec::new();
        {
            let mut guard = lock(&self.state);
            let state = &mut *guard;
            let posted: Vec<NotificationKey> = state
                .store
                .posted_in_order()
                .filter(|r| r.package() == package && r.sbn.id == id && r.user() == user)
                .map(|r| r.key().clone())
                .collect();
            for key in &posted {
                if let Some(record) = state.store.get_mut(key) {
                    record
                        .sbn
                        .notification
                        .flags
                        .remove(NotificationFlags::FOREGROUND_SERVICE);
                }
            }
            for key in state.store.enqueued_keys() {
                if let Some(record) = state.store.enqueued_mut(&key) {
                    if record.package() == package && record.sbn.id == id && record.user() == user {
                        record
                            .sbn
                            .notification
                            .flags
                            .remove(NotificationFlags::FOREGROUND_SERVICE);
                    }
                }
            }
            if !posted.is_empty() {
                lock(&self.ranking).sort(&mut state.store);
                for key in &posted {
                    if let Some(record) = state.store.get(key) {
                        let sbn = record.sbn.clone();
                        self.collect_posted_dispatches(state, &sbn, Some(&sbn), &mut fanout);
                    }
                }
            }
        }
        self.dispatch(fanout);
    }

    fn current_policy_document(&self) -> PolicyDocument {
        PolicyDocument {
            zen: self.deps.zen.config(),
            ranking: lock(&self.ranking).config.clone(),
            ..Default::default()
        }
    }

    /// Persists the policy document. Synchronous and small; a failed write
    /// leaves the previous document intact on disk.
    fn save_policy(&self) {
        if !self.policy.is_persistent() {
            return;
        }
        let document = self.current_policy_document();
        if let Err(e) = self.policy.save(&document) {
            error!(error = %e, "policy save failed, previous document remains");
        }
    }

    // --- fan-out ---

    fn dispatch(self: &Arc<Self>, tasks: Vec<Fanout>) {
        for task in tasks {
            let inner = Arc::clone(self);
            self.rt.spawn(async move {
                inner.run_fanout(task).await;
            });
        }
    }

    async fn run_fanout(self: &Arc<Self>, task: Fanout) {
        match task {
            Fanout::ListenerPosted { info, sbn, update } => {
                let result = info.connection.on_notification_posted(sbn, update).await;
                self.note_listener_result(&info, "posted", result);
            }
            Fanout::ListenerRemoved {
                info,
                sbn,
                update,
                reason,
            } => {
                let result = info
                    .connection
                    .on_notification_removed(sbn, update, reason)
                    .await;
                self.note_listener_result(&info, "removed", result);
            }
            Fanout::ListenerRanking { info, update } => {
                let result = info.connection.on_ranking_update(update).await;
                self.note_listener_result(&info, "ranking", result);
            }
            Fanout::ListenerHintsChanged { info, hints } => {
                let result = info.connection.on_listener_hints_changed(hints).await;
                self.note_listener_result(&info, "hints", result);
            }
            Fanout::ListenerFilterChanged { info, filter } => {
                let result = info.connection.on_interruption_filter_changed(filter).await;
                self.note_listener_result(&info, "filter", result);
            }
            Fanout::AssistantEnqueued { info, sbn } => {
                let result = info.connection.on_notification_enqueued(sbn).await;
                self.note_assistant_result(&info, "enqueued", result);
            }
            Fanout::AssistantSnoozed {
                info,
                sbn,
                criterion,
            } => {
                let result = info.connection.on_notification_snoozed(sbn, criterion).await;
                self.note_assistant_result(&info, "snoozed", result);
            }
            Fanout::DeleteHook { package, token } => {
                self.deps.delete_hooks.fire(&package, &token);
            }
        }
    }

    /// One listener's failure never reaches the poster or its peers; a dead
    /// connection unbinds the listener and retracts its contributions.
    fn note_listener_result(
        self: &Arc<Self>,
        info: &ManagedServiceInfo<dyn ListenerConnection>,
        event: &str,
        result: Result<(), RemoteError>,
    ) {
        match result {
            Ok(()) => {}
            Err(RemoteError::Dead) => {
                warn!(component = %info.component, event, "listener connection dead, unbinding");
                self.listener_died(info.id);
            }
            Err(RemoteError::Failed(message)) => {
                warn!(component = %info.component, event, message = %message, "listener dispatch failed");
            }
        }
    }

    fn note_assistant_result(
        self: &Arc<Self>,
        info: &ManagedServiceInfo<dyn AssistantConnection>,
        event: &str,
        result: Result<(), RemoteError>,
    ) {
        match result {
            Ok(()) => {}
            Err(RemoteError::Dead) => {
                warn!(component = %info.component, event, "assistant connection dead, unbinding");
                self.assistants.unregister(info.id);
            }
            Err(RemoteError::Failed(message)) => {
                warn!(component = %info.component, event, message = %message, "assistant dispatch failed");
            }
        }
    }
}
