//! Persisted workflow state record

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::{Map, Value};

/// Domain payload for workflows that keep fully dynamic records
pub type DynamicData = Map<String, Value>;

/// Bounds required of a workflow's domain payload
pub trait WorkflowData: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {}

impl<T> WorkflowData for T where T: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {}

/// Workflow state record: the automaton's current state plus domain fields
///
/// Serialized as one flat JSON object, with the state under `currentState`:
///
/// ```
/// use authlink_durable::model::StateRecord;
/// use serde_json::json;
///
/// let record: StateRecord = serde_json::from_value(json!({
///     "currentState": "awaitingVerification",
///     "consentId": "c-1",
/// }))
/// .unwrap();
///
/// assert_eq!(record.state(), Some("awaitingVerification"));
/// assert_eq!(record.data["consentId"], "c-1");
/// ```
///
/// The engine is the only writer of `current_state`. Domain payloads must
/// serialize as a map and must not declare their own `currentState` field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(bound(
    serialize = "D: Serialize",
    deserialize = "D: DeserializeOwned"
))]
pub struct StateRecord<D = DynamicData> {
    #[serde(
        rename = "currentState",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub current_state: Option<String>,

    #[serde(flatten)]
    pub data: D,
}

impl<D> StateRecord<D> {
    /// Record with no state yet; the machine's initial state applies
    pub fn new(data: D) -> Self {
        Self {
            current_state: None,
            data,
        }
    }

    /// Record resuming from `state`
    pub fn with_state(state: impl Into<String>, data: D) -> Self {
        Self {
            current_state: Some(state.into()),
            data,
        }
    }

    pub fn state(&self) -> Option<&str> {
        self.current_state.as_deref()
    }
}

impl<D: Default> Default for StateRecord<D> {
    fn default() -> Self {
        Self::new(D::default())
    }
}

impl<D: Serialize> StateRecord<D> {
    /// Encode as the JSON document stored in the key-value store
    pub fn to_value(&self) -> Result<Value, serde_json::Error> {
        serde_json::to_value(self)
    }
}

impl<D: DeserializeOwned> StateRecord<D> {
    /// Decode a JSON document read from the key-value store
    pub fn from_value(value: Value) -> Result<Self, serde_json::Error> {
        serde_json::from_value(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    #[serde(rename_all = "camelCase")]
    struct Consent {
        consent_id: String,
        attempts: u32,
    }

    #[test]
    fn test_typed_record_is_flat() {
        let record = StateRecord::with_state(
            "registered",
            Consent {
                consent_id: "c-1".into(),
                attempts: 2,
            },
        );

        let value = record.to_value().unwrap();
        assert_eq!(
            value,
            json!({"currentState": "registered", "consentId": "c-1", "attempts": 2})
        );

        let back: StateRecord<Consent> = StateRecord::from_value(value).unwrap();
        assert_eq!(back, record);
    }

    #[test]
    fn test_missing_state_is_none() {
        let record: StateRecord = StateRecord::from_value(json!({"consentId": "c-2"})).unwrap();

        assert_eq!(record.state(), None);
        assert_eq!(record.data.get("consentId"), Some(&json!("c-2")));
        assert!(!record.to_value().unwrap().as_object().unwrap().contains_key("currentState"));
    }

    #[test]
    fn test_dynamic_record_does_not_duplicate_state() {
        let record: StateRecord =
            StateRecord::from_value(json!({"currentState": "errored", "reason": "timeout"}))
                .unwrap();

        assert_eq!(record.state(), Some("errored"));
        assert!(!record.data.contains_key("currentState"));
    }
}
