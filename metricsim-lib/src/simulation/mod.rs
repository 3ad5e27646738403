//! Simulation state, engine and the periodic ticker driving it.

use std::{sync::Arc, time::Duration};

use arc_swap::ArcSwap;
use rama::telemetry::tracing;
use serde::Serialize;

use crate::{
    instance::{
        Instance, InstanceDefaults, InstanceRegistry, ResolvedInstance, startup_instance_name,
    },
    metrics::SummaryConfig,
};

mod engine;
mod ticker;

pub use self::{
    engine::{Simulator, TickReport},
    ticker::run_ticker,
};

/// Name of the synthetic instance simulated in [`SimulationMode::Global`].
pub const GLOBAL_INSTANCE_NAME: &str = "default";

/// Which set of instances a tick simulates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SimulationMode {
    /// Every instance of the registry, the global rate split evenly over them.
    #[default]
    Instances,
    /// A single synthetic instance, ignoring the registry.
    Global,
}

/// Live tunables, changeable through the control surface.
///
/// They apply to every instance that does not carry its own value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Tunables {
    pub error_pct: i64,
    pub latency_offset_ms: i64,
}

impl Default for Tunables {
    fn default() -> Self {
        Self {
            error_pct: 1,
            latency_offset_ms: 0,
        }
    }
}

/// Startup configuration of a simulation.
#[derive(Debug, Clone)]
pub struct SimulationConfig {
    /// Period of the ticker.
    pub interval: Duration,
    /// Simulated requests per second, across all instances.
    pub request_rate: u32,
    pub mode: SimulationMode,
    pub defaults: InstanceDefaults,
    /// Initial value of the live tunables.
    pub tunables: Tunables,
    /// Amount of instances registered at startup.
    pub instance_count: usize,
    pub summary: SummaryConfig,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(1),
            request_rate: 100,
            mode: SimulationMode::default(),
            defaults: InstanceDefaults::default(),
            tunables: Tunables::default(),
            instance_count: 1,
            summary: SummaryConfig::default(),
        }
    }
}

impl SimulationConfig {
    /// Requests simulated by a single tick: the per-second rate
    /// scaled to the tick interval, rounded to the nearest integer.
    pub fn requests_per_tick(&self) -> u32 {
        let requests = (self.request_rate as f64 * self.interval.as_secs_f64()).round();
        // float to int casts saturate
        requests as u32
    }
}

/// State shared between the control surface and the ticker.
///
/// The registry is guarded by a reader/writer lock,
/// the tunables are swapped atomically as a whole.
#[derive(Debug, Clone)]
pub struct SimulationState {
    registry: InstanceRegistry,
    tunables: Arc<ArcSwap<Tunables>>,
    defaults: InstanceDefaults,
    mode: SimulationMode,
}

impl SimulationState {
    pub fn new(mode: SimulationMode, defaults: InstanceDefaults, tunables: Tunables) -> Self {
        Self {
            registry: InstanceRegistry::new(),
            tunables: Arc::new(ArcSwap::from_pointee(tunables)),
            defaults,
            mode,
        }
    }

    /// Create the state and register the startup instances.
    pub fn from_config(cfg: &SimulationConfig) -> Self {
        let state = Self::new(cfg.mode, cfg.defaults, cfg.tunables);
        tracing::info!("instance count is {}", cfg.instance_count);
        for index in 0..cfg.instance_count {
            let name = startup_instance_name(index);
            // names are unique by construction
            let _ = state
                .registry
                .add(name, Instance::from_defaults(&cfg.defaults));
        }
        tracing::info!("made {} instances", state.registry.len());
        state
    }

    #[inline(always)]
    pub fn registry(&self) -> &InstanceRegistry {
        &self.registry
    }

    #[inline(always)]
    pub fn defaults(&self) -> &InstanceDefaults {
        &self.defaults
    }

    #[inline(always)]
    pub fn mode(&self) -> SimulationMode {
        self.mode
    }

    pub fn tunables(&self) -> Tunables {
        **self.tunables.load()
    }

    /// Set the global error percentage, returning the previous value.
    pub fn set_error_pct(&self, error_pct: i64) -> i64 {
        let previous = self.tunables.rcu(|t| Tunables { error_pct, ..**t });
        tracing::info!(
            "global error percentage set to {error_pct} (was {})",
            previous.error_pct
        );
        previous.error_pct
    }

    /// Set the global latency offset, returning the previous value.
    pub fn set_latency_offset_ms(&self, latency_offset_ms: i64) -> i64 {
        let previous = self.tunables.rcu(|t| Tunables {
            latency_offset_ms,
            ..**t
        });
        tracing::info!(
            "global latency offset set to {latency_offset_ms}ms (was {}ms)",
            previous.latency_offset_ms
        );
        previous.latency_offset_ms
    }

    /// Parameters of the synthetic instance of [`SimulationMode::Global`].
    pub fn global_instance(&self, tunables: &Tunables) -> ResolvedInstance {
        Instance::from_defaults(&self.defaults).resolve(tunables)
    }
}
