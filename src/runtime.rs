//! Runtime glue shared by every task: configuration, fatal-fault capture,
//! telemetry and the process runner.

pub mod config;
pub mod fatal;
pub mod runner;
pub mod telemetry;
