use std::time::Duration;

use rama::{graceful::ShutdownGuard, telemetry::tracing};
use tokio::time::MissedTickBehavior;

use super::Simulator;
use crate::metrics::MetricsRecorder;

/// Run one simulation tick per `period` until shutdown is initiated.
///
/// A tick which runs late delays the ones after it,
/// missed ticks are never replayed as a burst.
pub async fn run_ticker<R: MetricsRecorder>(
    guard: ShutdownGuard,
    mut simulator: Simulator<R>,
    period: Duration,
) {
    let period = period.max(Duration::from_millis(1));
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    tracing::info!("simulation ticker started with a period of {period:?}");

    loop {
        tokio::select! {
            _ = guard.cancelled() => {
                tracing::debug!("shutdown initiated: stop simulation ticker");
                return;
            }

            tick_at = interval.tick() => {
                let report = simulator.tick();
                tracing::debug!(
                    instances = report.instances,
                    requests = report.requests,
                    errors = report.errors,
                    "tick at {tick_at:?}",
                );
            }
        }
    }
}
