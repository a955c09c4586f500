//! # Durable Consent Workflows
//!
//! Persistent finite-automaton workflows and pub/sub callback correlation for
//! consent registration against external partners.
//!
//! ## Features
//!
//! - **Persistent models**: a declared automaton over a JSON state record, saved to a key-value store on request
//! - **Single-flight transitions**: one transition at a time per workflow, with `error` as the universal abort
//! - **Deferred jobs**: subscribe to a correlation channel, start an outbound call, await its callback with a deadline
//! - **Pluggable adapters**: in-memory store and broker for tests, PostgreSQL (`JSONB` + `LISTEN/NOTIFY`) for production
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     PersistentModel                          │
//! │  (transition table, in-flight marker, observers)            │
//! └─────────────────────────────────────────────────────────────┘
//!          │ persist / load                 │ handlers
//!          ▼                                ▼
//! ┌──────────────────────────┐   ┌──────────────────────────────┐
//! │      KeyValueStore       │   │         DeferredJob          │
//! │  (record under a key)    │   │  (subscribe, init, wait)     │
//! └──────────────────────────┘   └──────────────────────────────┘
//!                                               │
//!                                               ▼
//!                                ┌──────────────────────────────┐
//!                                │        MessageBroker         │
//!                                │  (channel fan-out)           │
//!                                └──────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```ignore
//! use authlink_durable::prelude::*;
//!
//! let spec: StateMachineSpec = StateMachineSpec::new()
//!     .with_initial("created")
//!     .transition("register", "created", "awaitingVerification")
//!     .on("init", |_| async { Ok(()) })
//!     .on("error", |_| async { Ok(()) })
//!     .on("register", move |ctx| {
//!         let broker = broker.clone();
//!         async move {
//!             DeferredJob::new(broker, channel_name("register", ctx.model.key()))
//!                 .init(|channel, _id| async move { send_registration(channel).await })
//!                 .job(|callback| async move { record_callback(callback).await })
//!                 .wait(Duration::from_secs(30))
//!                 .await?;
//!             Ok(())
//!         }
//!     });
//!
//! let model = PersistentModel::create(StateRecord::default(), deps, spec).await?;
//! model.transition("register").await?;
//! model.persist().await?;
//! ```

pub mod config;
pub mod deferred;
pub mod model;
pub mod persistence;
pub mod pubsub;
pub mod telemetry;

/// Prelude for common imports
pub mod prelude {
    pub use crate::config::EngineConfig;
    pub use crate::deferred::{channel_name, DeferredJob, DeferredJobError, Subscription};
    pub use crate::model::{
        FromStates, ModelDependencies, ModelError, PersistentModel, SpecError, StateMachineSpec,
        StateRecord, TransitionContext, TransitionInfo, ERROR, ERRORED, INIT, NONE,
    };
    pub use crate::persistence::{
        InMemoryKeyValueStore, KeyValueStore, PostgresKeyValueStore, StoreError,
    };
    pub use crate::pubsub::{
        BrokerError, InMemoryBroker, Message, MessageBroker, MessageHandler, PostgresBroker,
        SubscriptionId,
    };
}

// Re-export key types at crate root
pub use config::EngineConfig;
pub use deferred::{DeferredJob, DeferredJobError};
pub use model::{ModelDependencies, ModelError, PersistentModel, StateMachineSpec, StateRecord};
pub use persistence::{InMemoryKeyValueStore, KeyValueStore, PostgresKeyValueStore, StoreError};
pub use pubsub::{BrokerError, InMemoryBroker, MessageBroker, PostgresBroker, SubscriptionId};
pub use telemetry::{init_tracing, TelemetryConfig};
