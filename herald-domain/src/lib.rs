//! herald-domain: the notification lifecycle and ranking pipeline.
//!
//! The heart of the crate is [`pipeline::NotificationPipeline`], which
//! ingests untrusted cross-process post requests, applies rate-limiting and
//! blocking policy, keeps the canonical record store consistent, computes a
//! stable ranking order, and fans lifecycle events out to registered
//! listener and assistant services.
//!
//! Leaf components are usable on their own: [`store::RecordStore`],
//! [`stats::UsageStats`], [`snooze::SnoozeHelper`], [`grouping::GroupHelper`],
//! [`ranking::RankingHelper`], [`zen::StandardZenModeHelper`], and the
//! [`services::ManagedServiceRegistry`].

pub mod alerts;
pub mod error;
pub mod external;
pub mod grouping;
pub mod pipeline;
pub mod policy;
pub mod ranking;
pub mod record;
pub mod services;
pub mod snooze;
pub mod stats;
pub mod store;
pub mod types;
pub mod zen;

pub use error::NotificationError;
pub use pipeline::{NotificationPipeline, PipelineDeps};
