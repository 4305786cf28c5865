//! Driver configuration.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::fetch::FetchTimeouts;
use crate::vfs::DEFAULT_FETCHED_FILE_CAPACITY;

/// Process-wide settings for the session and format drivers.
///
/// Durations are written as (fractional) seconds in JSON.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DriverConfig {
    /// Retry ceiling when the request does not set one.
    pub max_retries: u32,
    /// Timeout of whole-bundle fetches.
    #[serde(with = "secs")]
    pub bundle_timeout: Duration,
    /// Timeout of byte-range fetches.
    #[serde(with = "secs")]
    pub range_timeout: Duration,
    /// Timeout of package fetches.
    #[serde(with = "secs")]
    pub package_timeout: Duration,
    /// Capacity of the fetched-file cache.
    pub fetched_file_capacity: usize,
    /// Pending files in one bundle at which the whole bundle is fetched
    /// instead of individual ranges.
    pub whole_bundle_threshold: usize,
    /// Historical package releases, newest first.
    pub historical_versions: Vec<String>,
    /// Arity cap of generated shims.
    pub max_shim_args: usize,
    /// Wall-clock budget of one compile request, checked between retries.
    #[serde(with = "opt_secs")]
    pub compile_deadline: Option<Duration>,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            max_retries: 15,
            bundle_timeout: Duration::from_secs(60),
            range_timeout: Duration::from_secs(30),
            package_timeout: Duration::from_secs(60),
            fetched_file_capacity: DEFAULT_FETCHED_FILE_CAPACITY,
            whole_bundle_threshold: 3,
            historical_versions: vec!["2024".into(), "2023".into(), "2022".into()],
            max_shim_args: 9,
            compile_deadline: None,
        }
    }
}

impl DriverConfig {
    /// Load from a JSON file; missing fields keep their defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let bytes = std::fs::read(path)?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// Gateway timeouts.
    pub fn fetch_timeouts(&self) -> FetchTimeouts {
        FetchTimeouts {
            bundle: self.bundle_timeout,
            range: self.range_timeout,
            package: self.package_timeout,
        }
    }
}

mod secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(value.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
    }
}

mod opt_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        value: &Option<Duration>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(duration) => serializer.serialize_some(&duration.as_secs_f64()),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Duration>, D::Error> {
        Option::<f64>::deserialize(deserializer)?
            .map(|secs| Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom))
            .transpose()
    }
}
