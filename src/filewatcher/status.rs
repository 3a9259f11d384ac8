//! Watch progress carried between activations.
//!
//! The status lives in the message body under `filewatcher-status`, so a
//! redelivered or duplicated message resumes from the same point on any
//! worker.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::FilewatcherError;
use crate::constants::body;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct WatchStatus {
    pub seen_count: u64,
    /// Epoch seconds of the first activation
    pub start_time: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_seen: Option<f64>,
    /// Number of frames in the HDF5 master file
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_count: Option<u64>,
}

impl WatchStatus {
    pub fn new(now: f64) -> Self {
        Self {
            seen_count: 0,
            start_time: now,
            last_seen: None,
            image_count: None,
        }
    }

    /// Status embedded in a message payload, if any
    ///
    /// The payload must be an object (or null) so the status can be carried
    /// alongside it.
    pub fn from_payload(payload: &Value) -> Result<Option<Self>, FilewatcherError> {
        fields(payload)?;
        match payload.get(body::FILEWATCHER_STATUS) {
            None | Some(Value::Null) => Ok(None),
            Some(status) => serde_json::from_value(status.clone())
                .map(Some)
                .map_err(|e| FilewatcherError::InvalidStatus {
                    reason: e.to_string(),
                }),
        }
    }

    /// A copy of `payload` carrying this status
    pub fn embed_in(&self, payload: &Value) -> Result<Value, FilewatcherError> {
        let mut object = fields(payload)?;
        let status = serde_json::to_value(self).map_err(|e| FilewatcherError::InvalidStatus {
            reason: e.to_string(),
        })?;
        object.insert(body::FILEWATCHER_STATUS.to_string(), status);
        Ok(Value::Object(object))
    }
}

fn fields(payload: &Value) -> Result<Map<String, Value>, FilewatcherError> {
    match payload {
        Value::Object(map) => Ok(map.clone()),
        Value::Null => Ok(Map::new()),
        Value::Array(_) => Err(FilewatcherError::invalid_payload("array")),
        Value::String(_) => Err(FilewatcherError::invalid_payload("string")),
        Value::Number(_) => Err(FilewatcherError::invalid_payload("number")),
        Value::Bool(_) => Err(FilewatcherError::invalid_payload("boolean")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_status_survives_a_checkpoint() {
        let mut status = WatchStatus::new(100.0);
        status.seen_count = 4;
        status.last_seen = Some(105.5);

        let payload = status.embed_in(&json!({"dcid": 7})).unwrap();
        assert_eq!(payload["dcid"], 7);
        assert_eq!(payload["filewatcher-status"]["seen-count"], 4);
        assert!(payload["filewatcher-status"].get("image-count").is_none());

        assert_eq!(WatchStatus::from_payload(&payload).unwrap(), Some(status));
    }

    #[test]
    fn test_missing_and_invalid_status() {
        assert_eq!(WatchStatus::from_payload(&json!({})).unwrap(), None);
        assert!(WatchStatus::from_payload(&json!({"filewatcher-status": "x"})).is_err());
    }

    #[test]
    fn test_non_object_payload_is_rejected_not_dropped() {
        let status = WatchStatus::new(0.0);
        let err = status.embed_in(&json!(["A", "B"])).unwrap_err();
        assert!(err.is_malformed());
        assert!(WatchStatus::from_payload(&json!(12)).unwrap_err().is_malformed());

        let from_null = status.embed_in(&Value::Null).unwrap();
        assert_eq!(from_null["filewatcher-status"]["seen-count"], 0);
    }
}
