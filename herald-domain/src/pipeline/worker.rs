//! Tagged work items for the two serialized workers.
//!
//! The main queue carries every lifecycle mutation in FIFO submission order;
//! that ordering is the pipeline's primary correctness mechanism (a cancel
//! sent after an enqueue can never overtake it). The ranking queue carries
//! deferred signal work so slow extractors never stall posting.

use tokio::sync::oneshot;

use crate::record::NotificationRecord;
use crate::ranking::RankingReconsideration;
use crate::snooze::WakeCondition;
use crate::types::{CancelReason, NotificationFlags, NotificationKey, UserId};

/// Addressing and policy for a targeted cancel.
#[derive(Debug)]
pub(crate) struct CancelSpec {
    pub package: String,
    pub tag: Option<String>,
    pub id: i32,
    pub user: UserId,
    /// The record must carry all of these flags to be cancelable here.
    pub must_have: NotificationFlags,
    /// The record must carry none of these flags.
    pub must_not_have: NotificationFlags,
    /// Fire the record's delete hook (user-initiated dismissals).
    pub send_delete: bool,
    pub reason: CancelReason,
}

pub(crate) enum WorkItem {
    Enqueue {
        record: NotificationRecord,
    },
    /// The assistant window for this key elapsed; move enqueued to posted.
    PostReady {
        key: NotificationKey,
    },
    Cancel(CancelSpec),
    CancelAll {
        package: Option<String>,
        user: UserId,
        must_not_have: NotificationFlags,
        send_delete: bool,
        reason: CancelReason,
    },
    /// A timeout alarm fired. Stale epochs (the key was re-enqueued or
    /// canceled since arming) are ignored.
    Timeout {
        key: NotificationKey,
        epoch: u64,
    },
    Snooze {
        key: NotificationKey,
        condition: WakeCondition,
    },
    /// A snooze wake fired or an unsnooze was requested.
    RepostSnoozed {
        key: NotificationKey,
    },
    /// Debounced ranking-update fan-out.
    SendRankingUpdate,
    /// Barrier: acknowledged once every earlier item has been processed.
    Flush(oneshot::Sender<()>),
}

pub(crate) enum RankingTask {
    Reconsider(Box<dyn RankingReconsideration>),
    Sort { force: bool },
    Flush(oneshot::Sender<()>),
}
