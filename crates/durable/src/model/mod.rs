//! Persistent workflow model: a finite automaton over a durable state record
//!
//! This module provides:
//! - [`StateMachineSpec`] declaring transitions, handlers and observers
//! - [`StateRecord`] holding `currentState` next to the domain fields
//! - [`PersistentModel`] running transitions and persisting on request

mod persistent;
mod record;
mod spec;

pub use persistent::{
    ModelDependencies, ModelError, PersistentModel, TransitionContext, TransitionInfo,
};
pub use record::{DynamicData, StateRecord, WorkflowData};
pub use spec::{
    FromStates, Observer, SpecError, StateMachineSpec, TransitionHandler, TransitionSpec, ERROR,
    ERRORED, INIT, NONE, WILDCARD,
};
