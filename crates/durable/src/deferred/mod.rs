//! Deferred jobs: correlate an out-of-band callback with a waiting workflow
//!
//! This module provides:
//! - [`DeferredJob`] to subscribe, initiate and await one message with a deadline
//! - [`Subscription`] guard releasing a broker subscription exactly once
//! - [`channel_name`] for the `{phase}-{id}` channel convention

mod job;
mod subscription;

pub use job::{channel_name, DeferredJob, DeferredJobError, Initiator, Listener};
pub use subscription::Subscription;
