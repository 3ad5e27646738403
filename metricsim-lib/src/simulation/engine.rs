use rand::{Rng, SeedableRng as _, rngs::SmallRng};
use rama::telemetry::tracing;

use super::{GLOBAL_INSTANCE_NAME, SimulationMode, SimulationState};
use crate::{
    instance::ResolvedInstance,
    metrics::{MetricsRecorder, Outcome},
};

/// What a single tick produced.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    pub instances: usize,
    pub requests: u64,
    pub errors: u64,
}

/// Turns the shared state into simulated requests, one tick at a time.
///
/// Every tick simulates `requests_per_tick` requests, split evenly over
/// the instances. It works on the registry snapshot and tunables
/// as they were when the tick started.
#[derive(Debug)]
pub struct Simulator<R> {
    state: SimulationState,
    recorder: R,
    requests_per_tick: u32,
    rng: SmallRng,
}

impl<R: MetricsRecorder> Simulator<R> {
    pub fn new(state: SimulationState, recorder: R, requests_per_tick: u32) -> Self {
        Self::with_rng(state, recorder, requests_per_tick, SmallRng::from_os_rng())
    }

    pub fn with_rng(
        state: SimulationState,
        recorder: R,
        requests_per_tick: u32,
        rng: SmallRng,
    ) -> Self {
        Self {
            state,
            recorder,
            requests_per_tick,
            rng,
        }
    }

    pub fn recorder(&self) -> &R {
        &self.recorder
    }

    pub fn tick(&mut self) -> TickReport {
        let tunables = self.state.tunables();

        match self.state.mode() {
            SimulationMode::Instances => {
                let snapshot = self.state.registry().snapshot();
                let Some(per_instance_rate) =
                    per_instance_rate(self.requests_per_tick, snapshot.len())
                else {
                    tracing::trace!("no instances registered: nothing to simulate");
                    return TickReport::default();
                };

                let mut report = TickReport {
                    instances: snapshot.len(),
                    ..Default::default()
                };
                for (name, instance) in snapshot.iter() {
                    let params = instance.resolve(&tunables);
                    tracing::trace!(instance.name = %name, ?params, "simulate instance");
                    report.errors += self.simulate_instance(name, &params, per_instance_rate);
                    report.requests += per_instance_rate;
                }
                report
            }
            SimulationMode::Global => {
                let params = self.state.global_instance(&tunables);
                let requests = self.requests_per_tick as u64;
                let errors = self.simulate_instance(GLOBAL_INSTANCE_NAME, &params, requests);
                TickReport {
                    instances: 1,
                    requests,
                    errors,
                }
            }
        }
    }

    /// Simulate `requests` requests for a single instance, returning the error count.
    fn simulate_instance(&mut self, name: &str, params: &ResolvedInstance, requests: u64) -> u64 {
        if requests > 0 && params.has_degenerate_latency() {
            tracing::debug!(
                instance.name = %name,
                "latency_max_ms is {} (<= 0): latency delta is fixed to 0",
                params.latency_max_ms,
            );
        }
        if requests > 0 && params.has_degenerate_error_pct() {
            tracing::debug!(
                instance.name = %name,
                "error_pct is {} (outside 0..=100): used as-is",
                params.error_pct,
            );
        }

        let mut errors = 0;
        for _ in 0..requests {
            let outcome = draw_outcome(&mut self.rng, params.error_pct);
            if outcome.is_error() {
                self.recorder.increment_errors(outcome, name);
                errors += 1;
            }
            let duration = draw_latency(&mut self.rng, params);
            self.recorder.record_latency(outcome, name, duration);
        }
        errors
    }
}

/// `None` when there are no instances to divide the rate over.
fn per_instance_rate(requests_per_tick: u32, instance_count: usize) -> Option<u64> {
    (requests_per_tick as u64).checked_div(instance_count as u64)
}

/// A roll in `0..100` at or below `error_pct` is an error,
/// so the error fraction converges to `(error_pct + 1) / 100`.
fn draw_outcome(rng: &mut impl Rng, error_pct: i64) -> Outcome {
    let roll: i64 = rng.random_range(0..100);
    if roll <= error_pct {
        Outcome::Error
    } else {
        Outcome::Ok
    }
}

fn draw_latency(rng: &mut impl Rng, params: &ResolvedInstance) -> i64 {
    let delta = if params.latency_max_ms > 0 {
        rng.random_range(0..params.latency_max_ms)
    } else {
        0
    };
    params
        .latency_min_ms
        .saturating_add(delta)
        .saturating_add(params.latency_offset_ms)
}
