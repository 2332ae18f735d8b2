//! Cached resource slices and fetch errors.

use std::collections::BTreeMap;
use std::fmt;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use futures_util::future::{self, BoxFuture, FutureExt, Shared};
use serde::de::DeserializeOwned;
use serde_json::Value;
use thiserror::Error;

/// Error name carried by timed-out slices.
pub const TIMEOUT_ERROR_NAME: &str = "TimeoutError";

/// In-flight (or completed) fetch shared by every caller of one key.
pub type ResourcePromise = Shared<BoxFuture<'static, Result<Value, ResourceError>>>;

/// Errors stored in a resource slice.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ResourceError {
    /// The resource's data function failed.
    #[error("{name}: {message}")]
    Fetch {
        name: String,
        message: String,
        stack: Option<String>,
    },

    /// The fetch did not settle before its timeout guard fired.
    #[error("TimeoutError: {message}")]
    Timeout { message: String },
}

impl ResourceError {
    /// A plain fetch failure.
    pub fn fetch(message: impl Into<String>) -> Self {
        Self::Fetch {
            name: "Error".to_string(),
            message: message.into(),
            stack: None,
        }
    }

    pub fn timeout(after: Duration) -> Self {
        Self::Timeout {
            message: format!("Resource timed out after {}ms", after.as_millis()),
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Self::Fetch { name, .. } => name,
            Self::Timeout { .. } => TIMEOUT_ERROR_NAME,
        }
    }

    pub fn message(&self) -> &str {
        match self {
            Self::Fetch { message, .. } | Self::Timeout { message } => message,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}

impl From<serde_json::Error> for ResourceError {
    fn from(err: serde_json::Error) -> Self {
        Self::Fetch {
            name: "SerializationError".to_string(),
            message: err.to_string(),
            stack: None,
        }
    }
}

/// The cached state of one `(type, key)` resource.
///
/// Slices are replaced whole on every transition; readers always see a
/// consistent value.
#[derive(Clone, Default)]
pub struct ResourceSlice {
    pub data: Option<Value>,
    pub error: Option<ResourceError>,
    pub loading: bool,
    pub promise: Option<ResourcePromise>,
    /// Epoch millis after which the slice is stale.
    pub expires_at: Option<u64>,
    /// Epoch millis of the last read or write.
    pub accessed_at: Option<u64>,

    pub(crate) generation: u64,
    pub(crate) access_tick: u64,
    pub(crate) prefetched_at: Option<u64>,
    pub(crate) dependency_generations: BTreeMap<String, u64>,
}

impl ResourceSlice {
    /// Deserialize the cached data into a concrete type.
    pub fn data_as<T: DeserializeOwned>(&self) -> Result<Option<T>, serde_json::Error> {
        self.data.clone().map(serde_json::from_value).transpose()
    }

    pub fn is_timed_out(&self) -> bool {
        self.error.as_ref().is_some_and(ResourceError::is_timeout)
    }

    /// Whether `now` is past this slice's expiry.
    pub fn is_expired(&self, now: u64) -> bool {
        self.expires_at.is_some_and(|expires_at| now >= expires_at)
    }

    /// Slices hydrated from a server render carry neither a promise nor an
    /// expiry until first read.
    pub(crate) fn is_from_ssr(&self) -> bool {
        self.promise.is_none() && self.expires_at.is_none() && !self.loading
    }

    pub(crate) fn should_use_cache(&self, now: u64) -> bool {
        if self.is_timed_out() {
            return false;
        }
        if self.loading {
            return self.promise.is_some();
        }
        self.expires_at.is_some_and(|expires_at| now < expires_at)
    }

    /// A promise already resolved with this slice's outcome.
    pub(crate) fn settled_promise(&self) -> ResourcePromise {
        let outcome = match &self.error {
            Some(err) => Err(err.clone()),
            None => Ok(self.data.clone().unwrap_or(Value::Null)),
        };
        future::ready(outcome).boxed().shared()
    }
}

impl fmt::Debug for ResourceSlice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourceSlice")
            .field("data", &self.data)
            .field("error", &self.error)
            .field("loading", &self.loading)
            .field("promise", &self.promise.as_ref().map(|_| "<promise>"))
            .field("expires_at", &self.expires_at)
            .field("accessed_at", &self.accessed_at)
            .field("generation", &self.generation)
            .finish()
    }
}

/// Milliseconds since the Unix epoch.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Expiry timestamp for data written at `now` with the given max age.
pub(crate) fn expires_at(now: u64, max_age: Duration) -> u64 {
    let max_age = u64::try_from(max_age.as_millis()).unwrap_or(u64::MAX);
    now.saturating_add(max_age)
}
