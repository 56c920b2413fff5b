// src/connection/mod.rs
mod backoff;
mod manager;
mod recovery;
mod sequence;
mod subscription;

pub use backoff::BackoffScheduler;
pub use manager::{ChannelManager, ConnectionState};
pub use recovery::RecoveryClient;
pub use sequence::{ConnectionSession, ReplayWindow, SequenceTracker, merge_replay};
pub use subscription::{
    EventFilter, Subscription, SubscriptionHandler, SubscriptionId, SubscriptionRegistry,
};
