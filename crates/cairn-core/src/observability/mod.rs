//! Observability
//!
//! - `events`: structured lifecycle events with consistent fields
//! - `metrics`: metric names, descriptions and recording helpers
//!
//! The core only records through the `metrics` facade; installing a recorder
//! and configuring the tracing subscriber is left to the host.

pub mod events;
pub mod metrics;
