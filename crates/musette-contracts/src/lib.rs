pub mod generation;
pub mod metrics;
pub mod models;
pub mod telemetry;
