//! Persistent workflow model
//!
//! The `PersistentModel` drives one workflow instance through its automaton:
//! - Single-flight transitions; `error` always preempts
//! - Records `currentState` in the data record after every committed transition
//! - Runs the ordered observers after the state is recorded
//! - Persists the record to the key-value store only when asked to

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{debug, error, info, instrument, warn};

use crate::persistence::{KeyValueStore, StoreError};

use super::record::{DynamicData, StateRecord, WorkflowData};
use super::spec::{
    FromStates, SpecError, StateMachineSpec, TransitionSpec, ERROR, ERRORED, INIT, NONE,
};

/// Errors from model operations
#[derive(Debug, thiserror::Error)]
pub enum ModelError {
    /// No record stored under the key
    #[error("no workflow record for key {0}")]
    NotFound(String),

    /// Another transition is still running
    #[error("cannot run {requested} while {pending} is in progress")]
    TransitionInProgress { requested: String, pending: String },

    #[error("unknown transition {0}")]
    UnknownTransition(String),

    /// The current state is not a declared source of the transition
    #[error("transition {name} is not allowed from state {state}")]
    InvalidTransition { name: String, state: String },

    /// An `error` transition took over while this one was running
    #[error("transition {name} was superseded by error")]
    Superseded { name: String },

    /// The transition handler failed; the state is unchanged
    #[error("transition {transition} failed: {source}")]
    Handler {
        transition: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("persistence error: {0}")]
    Persistence(#[from] StoreError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("invalid state machine: {0}")]
    Spec(#[from] SpecError),
}

/// What a model needs from its environment
#[derive(Clone)]
pub struct ModelDependencies {
    /// Stable key the record is persisted under
    pub key: String,
    pub kvs: Arc<dyn KeyValueStore>,
}

impl ModelDependencies {
    pub fn new(key: impl Into<String>, kvs: Arc<dyn KeyValueStore>) -> Self {
        Self {
            key: key.into(),
            kvs,
        }
    }
}

impl fmt::Debug for ModelDependencies {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModelDependencies")
            .field("key", &self.key)
            .finish_non_exhaustive()
    }
}

/// A transition as it fired
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransitionInfo {
    pub name: String,
    pub from: String,
    pub to: String,
}

/// Passed to every transition handler
pub struct TransitionContext<D = DynamicData> {
    /// Handle to the model running the transition
    pub model: PersistentModel<D>,
    pub transition: TransitionInfo,
    /// Payload given to [`PersistentModel::transition_with`], `null` otherwise
    pub payload: Value,
}

impl<D> TransitionContext<D> {
    /// Decode the payload into a typed value
    pub fn payload_as<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        T::deserialize(&self.payload)
    }
}

/// Machine status guarded by one lock; the in-flight marker lives here
struct MachineStatus {
    state: String,
    pending: Option<String>,
    /// Bumped each time a transition starts; a handler whose generation is
    /// stale when it finishes was preempted
    generation: u64,
}

/// Transition table including the engine's reserved transitions
struct TransitionTable {
    entries: Vec<TransitionSpec>,
    index: HashMap<String, usize>,
}

impl TransitionTable {
    fn build(declared: &[TransitionSpec], initial: &str) -> Self {
        let mut entries = Vec::with_capacity(declared.len() + 2);
        entries.push(TransitionSpec::new(ERROR, FromStates::Any, ERRORED));
        entries.push(TransitionSpec::new(INIT, NONE, initial));
        entries.extend(declared.iter().cloned());

        let index = entries
            .iter()
            .enumerate()
            .map(|(i, t)| (t.name.clone(), i))
            .collect();

        Self { entries, index }
    }

    fn get(&self, name: &str) -> Option<&TransitionSpec> {
        self.index.get(name).map(|&i| &self.entries[i])
    }
}

struct ModelInner<D> {
    key: String,
    kvs: Arc<dyn KeyValueStore>,
    spec: StateMachineSpec<D>,
    table: TransitionTable,
    status: Mutex<MachineStatus>,
    record: Mutex<StateRecord<D>>,
}

/// A workflow instance backed by a key-value store
///
/// Cloning is cheap and every clone drives the same instance. Locks are
/// never held across an `.await`, so an `error` transition can run while
/// another transition's handler is suspended.
///
/// # Example
///
/// ```
/// use std::sync::Arc;
/// use authlink_durable::model::{ModelDependencies, PersistentModel, StateMachineSpec, StateRecord};
/// use authlink_durable::InMemoryKeyValueStore;
///
/// # tokio_test::block_on(async {
/// let spec: StateMachineSpec = StateMachineSpec::new()
///     .with_initial("created")
///     .transition("register", "created", "registered")
///     .on("init", |_| async { Ok(()) })
///     .on("error", |_| async { Ok(()) });
///
/// let deps = ModelDependencies::new("consent-1", Arc::new(InMemoryKeyValueStore::new()));
/// let model = PersistentModel::create(StateRecord::default(), deps, spec).await.unwrap();
/// assert!(model.is("created"));
///
/// model.transition("register").await.unwrap();
/// assert_eq!(model.state(), "registered");
/// model.persist().await.unwrap();
/// # });
/// ```
pub struct PersistentModel<D = DynamicData> {
    inner: Arc<ModelInner<D>>,
}

impl<D> Clone for PersistentModel<D> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<D: WorkflowData> PersistentModel<D> {
    /// Build a model from `initial` and fire its `init` transition
    ///
    /// The initial state is the record's `currentState`, then the declared
    /// initial state, then `none`. Returns once `init` has committed.
    #[instrument(name = "workflow_create", skip_all, fields(key = %dependencies.key))]
    pub async fn create(
        initial: StateRecord<D>,
        dependencies: ModelDependencies,
        spec: StateMachineSpec<D>,
    ) -> Result<Self, ModelError> {
        spec.validate()?;

        let initial_state = initial
            .current_state
            .clone()
            .or_else(|| spec.initial().map(str::to_string))
            .unwrap_or_else(|| NONE.to_string());
        let table = TransitionTable::build(spec.transitions(), &initial_state);

        let model = Self {
            inner: Arc::new(ModelInner {
                key: dependencies.key,
                kvs: dependencies.kvs,
                spec,
                table,
                status: Mutex::new(MachineStatus {
                    state: NONE.to_string(),
                    pending: None,
                    generation: 0,
                }),
                record: Mutex::new(initial),
            }),
        };

        model.transition(INIT).await?;
        debug!(state = %initial_state, "workflow model created");
        Ok(model)
    }

    /// Rebuild a model from the record stored under `dependencies.key`
    ///
    /// Transitions taken before the record was persisted are not re-run;
    /// only the `init` handler fires.
    #[instrument(name = "workflow_load", skip_all, fields(key = %dependencies.key))]
    pub async fn load(
        dependencies: ModelDependencies,
        spec: StateMachineSpec<D>,
    ) -> Result<Self, ModelError> {
        let value = dependencies
            .kvs
            .get(&dependencies.key)
            .await?
            .ok_or_else(|| ModelError::NotFound(dependencies.key.clone()))?;
        let record = StateRecord::<D>::from_value(value)?;

        debug!(state = ?record.state(), "loaded workflow record");
        Self::create(record, dependencies, spec).await
    }

    /// Fire `name` with a `null` payload
    pub async fn transition(&self, name: &str) -> Result<(), ModelError> {
        self.transition_with(name, Value::Null).await
    }

    /// Fire `name`, handing `payload` to its handler
    ///
    /// Fails with [`ModelError::TransitionInProgress`] while another
    /// transition runs, unless `name` is `error`. On handler success the new
    /// state is recorded and observers run; on failure the state is unchanged.
    #[instrument(name = "workflow", skip(self, payload), fields(key = %self.inner.key))]
    pub async fn transition_with(&self, name: &str, payload: Value) -> Result<(), ModelError> {
        let spec = self
            .inner
            .table
            .get(name)
            .ok_or_else(|| ModelError::UnknownTransition(name.to_string()))?;

        let (from, generation) = {
            let mut status = self.inner.status.lock();
            if let Some(pending) = &status.pending {
                if name != ERROR {
                    return Err(ModelError::TransitionInProgress {
                        requested: name.to_string(),
                        pending: pending.clone(),
                    });
                }
                warn!(preempted = %pending, "error transition preempting");
            }
            if !spec.from.contains(&status.state) {
                return Err(ModelError::InvalidTransition {
                    name: name.to_string(),
                    state: status.state.clone(),
                });
            }
            status.pending = Some(name.to_string());
            status.generation += 1;
            (status.state.clone(), status.generation)
        };

        let info = TransitionInfo {
            name: name.to_string(),
            from,
            to: spec.to.clone(),
        };

        let result = match self.inner.spec.handler(name) {
            Some(handler) => {
                let ctx = TransitionContext {
                    model: self.clone(),
                    transition: info.clone(),
                    payload,
                };
                handler(ctx).await
            }
            None => Ok(()),
        };

        let snapshot = {
            let mut status = self.inner.status.lock();
            if status.generation != generation {
                if let Err(e) = &result {
                    debug!(error = %e, "superseded transition also failed");
                }
                return Err(ModelError::Superseded {
                    name: name.to_string(),
                });
            }

            status.pending = None;
            if let Err(source) = result {
                error!(transition = name, error = %source, "transition handler failed");
                return Err(ModelError::Handler {
                    transition: name.to_string(),
                    source,
                });
            }

            status.state = info.to.clone();
            let mut record = self.inner.record.lock();
            record.current_state = Some(info.to.clone());
            record.clone()
        };

        info!(
            transition = %info.name,
            from = %info.from,
            to = %info.to,
            "transition committed"
        );
        for observer in self.inner.spec.observers() {
            observer(&info, &snapshot);
        }

        Ok(())
    }

    /// Write the current record to the key-value store
    ///
    /// The in-memory model is untouched whether or not the write succeeds.
    #[instrument(name = "workflow_persist", skip(self), fields(key = %self.inner.key))]
    pub async fn persist(&self) -> Result<(), ModelError> {
        let value = self.inner.record.lock().to_value()?;

        if let Err(e) = self.inner.kvs.set(&self.inner.key, value).await {
            error!(error = %e, "failed to persist workflow record");
            return Err(e.into());
        }

        debug!(state = %self.state(), "workflow record persisted");
        Ok(())
    }
}

impl<D> PersistentModel<D> {
    pub fn key(&self) -> &str {
        &self.inner.key
    }

    /// Current automaton state
    pub fn state(&self) -> String {
        self.inner.status.lock().state.clone()
    }

    pub fn is(&self, state: &str) -> bool {
        self.inner.status.lock().state == state
    }

    /// Whether `name` could fire now
    pub fn can(&self, name: &str) -> bool {
        let Some(spec) = self.inner.table.get(name) else {
            return false;
        };
        let status = self.inner.status.lock();
        (status.pending.is_none() || name == ERROR) && spec.from.contains(&status.state)
    }

    pub fn cannot(&self, name: &str) -> bool {
        !self.can(name)
    }

    /// Transitions that could fire now, in declaration order
    pub fn available_transitions(&self) -> Vec<String> {
        let status = self.inner.status.lock();
        self.inner
            .table
            .entries
            .iter()
            .filter(|t| status.pending.is_none() || t.name == ERROR)
            .filter(|t| t.from.contains(&status.state))
            .map(|t| t.name.clone())
            .collect()
    }

    /// Every state named by the transition table
    pub fn all_states(&self) -> Vec<String> {
        let mut states: Vec<String> = Vec::new();
        let mut push = |state: &str| {
            if !states.iter().any(|s| s == state) {
                states.push(state.to_string());
            }
        };

        for t in &self.inner.table.entries {
            if let FromStates::States(from) = &t.from {
                from.iter().for_each(|s| push(s));
            }
            push(&t.to);
        }
        states
    }

    /// Every transition name, including `init` and `error`
    pub fn all_transitions(&self) -> Vec<String> {
        self.inner
            .table
            .entries
            .iter()
            .map(|t| t.name.clone())
            .collect()
    }

    /// Whether a transition is in flight
    pub fn is_pending(&self) -> bool {
        self.inner.status.lock().pending.is_some()
    }

    /// Name of the transition in flight
    pub fn pending_transition(&self) -> Option<String> {
        self.inner.status.lock().pending.clone()
    }

    /// Read the record without cloning it
    ///
    /// `f` must not call back into the model.
    pub fn with_record<R>(&self, f: impl FnOnce(&StateRecord<D>) -> R) -> R {
        f(&*self.inner.record.lock())
    }

    /// Mutate the domain payload; `currentState` stays engine-owned
    ///
    /// `f` must not call back into the model.
    pub fn update<R>(&self, f: impl FnOnce(&mut D) -> R) -> R {
        f(&mut self.inner.record.lock().data)
    }
}

impl<D: Clone> PersistentModel<D> {
    pub fn record(&self) -> StateRecord<D> {
        self.inner.record.lock().clone()
    }

    pub fn data(&self) -> D {
        self.inner.record.lock().data.clone()
    }
}

impl<D> fmt::Debug for PersistentModel<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let status = self.inner.status.lock();
        f.debug_struct("PersistentModel")
            .field("key", &self.inner.key)
            .field("state", &status.state)
            .field("pending", &status.pending)
            .finish()
    }
}
