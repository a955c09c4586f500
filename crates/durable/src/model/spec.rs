//! Automaton specification: declared transitions, handlers and observers
//!
//! A [`StateMachineSpec`] is plain data: the transition table, a handler per
//! transition name and an ordered list of observers. It is not persisted;
//! the same spec is supplied on every create and load.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};

use super::persistent::{TransitionContext, TransitionInfo};
use super::record::{DynamicData, StateRecord};

/// Startup transition, fired once by create and load
pub const INIT: &str = "init";

/// Abort transition, allowed from any state and preempting in-flight work
pub const ERROR: &str = "error";

/// Terminal state entered by [`ERROR`]
pub const ERRORED: &str = "errored";

/// State of a machine before its `init` transition
pub const NONE: &str = "none";

/// Wildcard accepted by `From<&str>` for [`FromStates::Any`]
pub const WILDCARD: &str = "*";

/// Async transition handler
pub type TransitionHandler<D> =
    Arc<dyn Fn(TransitionContext<D>) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

/// Callback run after every committed transition, in registration order
pub type Observer<D> = Arc<dyn Fn(&TransitionInfo, &StateRecord<D>) + Send + Sync>;

/// Source states a transition may fire from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FromStates {
    Any,
    States(Vec<String>),
}

impl FromStates {
    pub fn contains(&self, state: &str) -> bool {
        match self {
            Self::Any => true,
            Self::States(states) => states.iter().any(|s| s == state),
        }
    }
}

impl From<&str> for FromStates {
    fn from(state: &str) -> Self {
        if state == WILDCARD {
            Self::Any
        } else {
            Self::States(vec![state.to_string()])
        }
    }
}

impl From<String> for FromStates {
    fn from(state: String) -> Self {
        Self::from(state.as_str())
    }
}

impl<const N: usize> From<[&str; N]> for FromStates {
    fn from(states: [&str; N]) -> Self {
        Self::States(states.iter().map(|s| s.to_string()).collect())
    }
}

impl From<Vec<String>> for FromStates {
    fn from(states: Vec<String>) -> Self {
        Self::States(states)
    }
}

/// One declared transition
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransitionSpec {
    pub name: String,
    pub from: FromStates,
    pub to: String,
}

impl TransitionSpec {
    pub fn new(name: impl Into<String>, from: impl Into<FromStates>, to: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            from: from.into(),
            to: to.into(),
        }
    }
}

/// Errors from spec validation
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SpecError {
    /// `init` and `error` must both have handlers
    #[error("missing handler for reserved transition {0}")]
    MissingHandler(&'static str),

    #[error("transition {0} declared more than once")]
    DuplicateTransition(String),

    /// `init` and `error` are added by the engine
    #[error("transition name {0} is reserved")]
    ReservedTransition(String),

    #[error("handler registered for undeclared transition {0}")]
    UnknownHandler(String),

    #[error("transition and state names must not be empty")]
    EmptyName,
}

/// Declarative automaton specification
///
/// # Example
///
/// ```
/// use authlink_durable::model::StateMachineSpec;
///
/// let spec: StateMachineSpec = StateMachineSpec::new()
///     .with_initial("created")
///     .transition("register", "created", "awaitingVerification")
///     .transition("verify", "awaitingVerification", "verified")
///     .on("init", |_ctx| async { Ok(()) })
///     .on("error", |_ctx| async { Ok(()) });
///
/// assert!(spec.validate().is_ok());
/// ```
pub struct StateMachineSpec<D = DynamicData> {
    initial: Option<String>,
    transitions: Vec<TransitionSpec>,
    handlers: HashMap<String, TransitionHandler<D>>,
    observers: Vec<Observer<D>>,
}

impl<D> StateMachineSpec<D> {
    pub fn new() -> Self {
        Self {
            initial: None,
            transitions: Vec::new(),
            handlers: HashMap::new(),
            observers: Vec::new(),
        }
    }

    /// Initial state used when the record carries none
    pub fn with_initial(mut self, state: impl Into<String>) -> Self {
        self.initial = Some(state.into());
        self
    }

    /// Declare a transition; `"*"` as source means any state
    pub fn transition(
        mut self,
        name: impl Into<String>,
        from: impl Into<FromStates>,
        to: impl Into<String>,
    ) -> Self {
        self.transitions.push(TransitionSpec::new(name, from, to));
        self
    }

    /// Register the handler for `name`, replacing any earlier one
    pub fn on<F, Fut>(mut self, name: impl Into<String>, handler: F) -> Self
    where
        F: Fn(TransitionContext<D>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let handler: TransitionHandler<D> = Arc::new(
            move |ctx: TransitionContext<D>| -> BoxFuture<'static, anyhow::Result<()>> {
                Box::pin(handler(ctx))
            },
        );
        self.handlers.insert(name.into(), handler);
        self
    }

    /// Append an observer run after every committed transition
    pub fn observe<F>(mut self, observer: F) -> Self
    where
        F: Fn(&TransitionInfo, &StateRecord<D>) + Send + Sync + 'static,
    {
        self.observers.push(Arc::new(observer));
        self
    }

    pub fn initial(&self) -> Option<&str> {
        self.initial.as_deref()
    }

    /// Transitions declared by the caller, without the reserved ones
    pub fn transitions(&self) -> &[TransitionSpec] {
        &self.transitions
    }

    pub(crate) fn handler(&self, name: &str) -> Option<&TransitionHandler<D>> {
        self.handlers.get(name)
    }

    pub(crate) fn observers(&self) -> &[Observer<D>] {
        &self.observers
    }

    /// Check the declaration is usable before a model is built from it
    pub fn validate(&self) -> Result<(), SpecError> {
        if self.initial.as_deref() == Some("") {
            return Err(SpecError::EmptyName);
        }

        let mut seen = HashSet::new();
        for t in &self.transitions {
            let empty_source = match &t.from {
                FromStates::Any => false,
                FromStates::States(states) => states.is_empty() || states.iter().any(String::is_empty),
            };
            if t.name.is_empty() || t.to.is_empty() || empty_source {
                return Err(SpecError::EmptyName);
            }
            if t.name == INIT || t.name == ERROR {
                return Err(SpecError::ReservedTransition(t.name.clone()));
            }
            if !seen.insert(t.name.as_str()) {
                return Err(SpecError::DuplicateTransition(t.name.clone()));
            }
        }

        for reserved in [INIT, ERROR] {
            if !self.handlers.contains_key(reserved) {
                return Err(SpecError::MissingHandler(reserved));
            }
        }

        for name in self.handlers.keys() {
            if name != INIT && name != ERROR && !seen.contains(name.as_str()) {
                return Err(SpecError::UnknownHandler(name.clone()));
            }
        }

        Ok(())
    }
}

impl<D> Default for StateMachineSpec<D> {
    fn default() -> Self {
        Self::new()
    }
}

impl<D> fmt::Debug for StateMachineSpec<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut handlers: Vec<&String> = self.handlers.keys().collect();
        handlers.sort();
        f.debug_struct("StateMachineSpec")
            .field("initial", &self.initial)
            .field("transitions", &self.transitions)
            .field("handlers", &handlers)
            .field("observers", &self.observers.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> StateMachineSpec {
        StateMachineSpec::new()
            .with_initial("created")
            .transition("register", "created", "registered")
            .on(INIT, |_| async { Ok(()) })
            .on(ERROR, |_| async { Ok(()) })
    }

    #[test]
    fn test_from_states() {
        assert_eq!(FromStates::from("*"), FromStates::Any);
        assert!(FromStates::Any.contains("anything"));

        let from = FromStates::from(["created", "registered"]);
        assert!(from.contains("registered"));
        assert!(!from.contains("verified"));
    }

    #[test]
    fn test_valid_spec() {
        let spec = base().on("register", |_| async { Ok(()) });
        assert!(spec.validate().is_ok());
        assert_eq!(spec.initial(), Some("created"));
        assert_eq!(spec.transitions().len(), 1);
    }

    #[test]
    fn test_requires_reserved_handlers() {
        let spec: StateMachineSpec = StateMachineSpec::new().on(INIT, |_| async { Ok(()) });
        assert_eq!(spec.validate(), Err(SpecError::MissingHandler(ERROR)));

        let spec: StateMachineSpec = StateMachineSpec::new().on(ERROR, |_| async { Ok(()) });
        assert_eq!(spec.validate(), Err(SpecError::MissingHandler(INIT)));
    }

    #[test]
    fn test_rejects_duplicates_and_reserved_names() {
        let spec = base().transition("register", "registered", "created");
        assert_eq!(
            spec.validate(),
            Err(SpecError::DuplicateTransition("register".into()))
        );

        let spec = base().transition(ERROR, "*", "failed");
        assert_eq!(
            spec.validate(),
            Err(SpecError::ReservedTransition(ERROR.into()))
        );
    }

    #[test]
    fn test_rejects_empty_names_and_stray_handlers() {
        let spec = base().transition("", "created", "registered");
        assert_eq!(spec.validate(), Err(SpecError::EmptyName));

        let spec = base().transition("verify", "registered", "");
        assert_eq!(spec.validate(), Err(SpecError::EmptyName));

        let spec = base().on("revoke", |_| async { Ok(()) });
        assert_eq!(
            spec.validate(),
            Err(SpecError::UnknownHandler("revoke".into()))
        );
    }
}
