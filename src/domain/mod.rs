//! Domain Layer
//!
//! Transport-free capture logic: the data model, settings, the rolling
//! buffer, spike detection and the capture orchestrator.

pub mod capture;
pub mod clock;
pub mod models;
pub mod rolling_buffer;
pub mod settings;
pub mod spike;
