//! Simulated backend instances.
//!
//! An [`Instance`] is the stored simulation record of one fake backend.
//! Error percentage and latency offset are optional: when absent they
//! are resolved at tick time from the live [`Tunables`], which is how
//! the runtime error-rate and latency-offset knobs reach every instance
//! that did not pin its own value.

use serde::{Deserialize, Serialize};

use crate::simulation::Tunables;

mod registry;

pub use self::registry::{InstanceRegistry, RegistryError, RegistrySnapshot};

/// Stored simulation parameters of one instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Instance {
    /// Error percentage, `None` to follow the global tunable.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_pct: Option<i64>,
    pub latency_min_ms: i64,
    /// Exclusive upper bound of the random latency delta.
    pub latency_max_ms: i64,
    /// Latency offset, `None` to follow the global tunable.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latency_offset_ms: Option<i64>,
}

impl Instance {
    /// Instance with the default latency bounds,
    /// following the global tunables for everything else.
    pub fn from_defaults(defaults: &InstanceDefaults) -> Self {
        Self {
            error_pct: None,
            latency_min_ms: defaults.latency_min_ms,
            latency_max_ms: defaults.latency_max_ms,
            latency_offset_ms: None,
        }
    }

    /// Fill in the values this instance does not carry itself.
    pub fn resolve(&self, tunables: &Tunables) -> ResolvedInstance {
        ResolvedInstance {
            error_pct: self.error_pct.unwrap_or(tunables.error_pct),
            latency_min_ms: self.latency_min_ms,
            latency_max_ms: self.latency_max_ms,
            latency_offset_ms: self.latency_offset_ms.unwrap_or(tunables.latency_offset_ms),
        }
    }
}

/// Fully resolved parameters used by the engine for a single tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedInstance {
    pub error_pct: i64,
    pub latency_min_ms: i64,
    pub latency_max_ms: i64,
    pub latency_offset_ms: i64,
}

impl ResolvedInstance {
    /// True if the latency draw has an empty range.
    #[inline(always)]
    pub fn has_degenerate_latency(&self) -> bool {
        self.latency_max_ms <= 0
    }

    /// True if the error percentage is outside of `0..=100`.
    #[inline(always)]
    pub fn has_degenerate_error_pct(&self) -> bool {
        !(0..=100).contains(&self.error_pct)
    }
}

/// Latency bounds given to instances that do not specify them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InstanceDefaults {
    pub latency_min_ms: i64,
    pub latency_max_ms: i64,
}

impl Default for InstanceDefaults {
    fn default() -> Self {
        Self {
            latency_min_ms: 100,
            latency_max_ms: 300,
        }
    }
}

/// Instance payload as received by the control surface.
///
/// Every field is optional, unknown fields are ignored.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
pub struct InstanceSpec {
    #[serde(default)]
    pub error_pct: Option<i64>,
    #[serde(default)]
    pub latency_min_ms: Option<i64>,
    #[serde(default)]
    pub latency_max_ms: Option<i64>,
    #[serde(default)]
    pub latency_offset_ms: Option<i64>,
}

impl InstanceSpec {
    /// Turn the payload into a full record, taking missing bounds from `defaults`.
    pub fn into_instance(self, defaults: &InstanceDefaults) -> Instance {
        Instance {
            error_pct: self.error_pct,
            latency_min_ms: self.latency_min_ms.unwrap_or(defaults.latency_min_ms),
            latency_max_ms: self.latency_max_ms.unwrap_or(defaults.latency_max_ms),
            latency_offset_ms: self.latency_offset_ms,
        }
    }
}

/// Name of the `index`-th startup instance: `A`..`Z`, then `AA`, `AB`, ...
pub fn startup_instance_name(index: usize) -> String {
    let mut n = index + 1;
    let mut name = Vec::new();
    while n > 0 {
        let rem = (n - 1) % 26;
        name.push(b'A' + rem as u8);
        n = (n - 1) / 26;
    }
    name.reverse();
    String::from_utf8_lossy(&name).into_owned()
}
