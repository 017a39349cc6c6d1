//! Infrastructure Layer
//!
//! BLE plumbing, logging bootstrap and capture export.

pub mod bluetooth;
pub mod export;
pub mod logging;
