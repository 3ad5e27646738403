//! Library for metricsim containing its core code.
//!
//! The binary crate only wires the command line, logging and the
//! listener around what is found here: the instance registry,
//! the metrics sink, the simulation engine with its ticker
//! and the HTTP control service.

#![cfg_attr(
    not(test),
    warn(clippy::print_stdout, clippy::dbg_macro),
    deny(clippy::unwrap_used, clippy::expect_used)
)]

pub mod control;
pub mod instance;
pub mod metrics;
pub mod simulation;
pub mod utils;
