//! JSON-safe snapshots of the store, for handing server-rendered state to a
//! client.
//!
//! # Wire Shape
//! ```text
//! { type: { key: { data, error: {name, message, stack} | null, loading,
//!               expiresAt, accessedAt: null, promise: null } } }
//! ```
//! `expiresAt` survives only on slices holding a non-timeout error.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::resources::slice::{ResourceError, ResourceSlice, TIMEOUT_ERROR_NAME};
use crate::resources::state::SliceMap;

/// `type → key → slice`
pub type SerializedData = BTreeMap<String, BTreeMap<String, SerializedSlice>>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SerializedError {
    pub name: String,
    pub message: String,
    #[serde(default)]
    pub stack: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SerializedSlice {
    #[serde(default)]
    pub data: Option<Value>,
    #[serde(default)]
    pub error: Option<SerializedError>,
    #[serde(default)]
    pub loading: bool,
    #[serde(default)]
    pub expires_at: Option<u64>,
    #[serde(default)]
    pub accessed_at: Option<u64>,
    /// Always null on the wire.
    #[serde(default)]
    pub promise: Option<()>,
}

/// Server-rendered state to seed a store with.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HydrationState {
    #[serde(default)]
    pub resource_data: SerializedData,
    #[serde(default)]
    pub resource_context: Option<Value>,
}

impl ResourceError {
    pub fn to_serialized(&self) -> SerializedError {
        match self {
            Self::Fetch { name, message, stack } => SerializedError {
                name: name.clone(),
                message: message.clone(),
                stack: stack.clone(),
            },
            Self::Timeout { message } => SerializedError {
                name: TIMEOUT_ERROR_NAME.to_string(),
                message: message.clone(),
                stack: None,
            },
        }
    }

    pub fn from_serialized(error: SerializedError) -> Self {
        if error.name == TIMEOUT_ERROR_NAME {
            return Self::Timeout { message: error.message };
        }
        Self::Fetch {
            name: error.name,
            message: error.message,
            stack: error.stack,
        }
    }
}

impl SerializedSlice {
    pub fn from_slice(slice: &ResourceSlice) -> Self {
        let recoverable_error = slice.error.as_ref().is_some_and(|e| !e.is_timeout());
        Self {
            data: slice.data.clone(),
            error: slice.error.as_ref().map(ResourceError::to_serialized),
            loading: slice.loading,
            expires_at: slice.expires_at.filter(|_| recoverable_error),
            accessed_at: None,
            promise: None,
        }
    }

    /// Rebuild a slice. Timed-out slices come back already expired so the
    /// next request retries instead of reviving the timeout.
    pub fn into_slice(self) -> ResourceSlice {
        let error = self.error.map(ResourceError::from_serialized);
        let expires_at = match &error {
            Some(e) if e.is_timeout() => Some(0),
            _ => self.expires_at,
        };
        ResourceSlice {
            data: self.data,
            error,
            loading: self.loading,
            expires_at,
            ..ResourceSlice::default()
        }
    }
}

pub(crate) fn snapshot(data: &SliceMap) -> SerializedData {
    data.iter()
        .map(|(resource_type, slices)| {
            let slices = slices
                .iter()
                .map(|(key, slice)| (key.clone(), SerializedSlice::from_slice(slice)))
                .collect();
            (resource_type.clone(), slices)
        })
        .collect()
}

/// Merge serialized slices into `data` without touching existing keys.
/// Returns the number of slices added.
pub(crate) fn merge(data: &mut SliceMap, incoming: SerializedData) -> usize {
    let mut added = 0;
    for (resource_type, slices) in incoming {
        let existing = data.entry(resource_type).or_default();
        for (key, slice) in slices {
            if let std::collections::hash_map::Entry::Vacant(entry) = existing.entry(key) {
                entry.insert(slice.into_slice());
                added += 1;
            }
        }
    }
    added
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_wire_shape() {
        let slice = ResourceSlice {
            data: Some(serde_json::json!({ "id": 1 })),
            loading: false,
            expires_at: Some(10),
            accessed_at: Some(5),
            ..ResourceSlice::default()
        };
        let json = serde_json::to_value(SerializedSlice::from_slice(&slice)).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "data": { "id": 1 },
                "error": null,
                "loading": false,
                "expiresAt": null,
                "accessedAt": null,
                "promise": null,
            })
        );
    }

    #[test]
    fn test_recoverable_error_keeps_expiry() {
        let slice = ResourceSlice {
            error: Some(ResourceError::fetch("boom")),
            expires_at: Some(99),
            ..ResourceSlice::default()
        };
        let serialized = SerializedSlice::from_slice(&slice);
        assert_eq!(serialized.expires_at, Some(99));
        assert_eq!(serialized.error.as_ref().unwrap().name, "Error");
    }

    #[test]
    fn test_timeout_hydrates_expired() {
        let slice = ResourceSlice {
            error: Some(ResourceError::timeout(Duration::from_millis(10))),
            loading: true,
            ..ResourceSlice::default()
        };
        let restored = SerializedSlice::from_slice(&slice).into_slice();
        assert!(restored.is_timed_out());
        assert_eq!(restored.expires_at, Some(0));
        assert!(!restored.should_use_cache(1));
    }

    #[test]
    fn test_merge_never_overwrites() {
        let mut data = SliceMap::new();
        data.entry("user".to_string()).or_default().insert(
            "1".to_string(),
            ResourceSlice {
                data: Some(Value::from("local")),
                ..ResourceSlice::default()
            },
        );

        let incoming: SerializedData = serde_json::from_value(serde_json::json!({
            "user": {
                "1": { "data": "remote", "loading": false },
                "2": { "data": "remote", "loading": false },
            }
        }))
        .unwrap();

        assert_eq!(merge(&mut data, incoming), 1);
        assert_eq!(data["user"]["1"].data, Some(Value::from("local")));
        assert_eq!(data["user"]["2"].data, Some(Value::from("remote")));
    }
}
