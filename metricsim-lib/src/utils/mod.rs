pub mod env;
pub mod telemetry;
