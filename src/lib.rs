//! Release capture for BLE sensor pods.
//!
//! Streams accelerometer, gyroscope, magnetometer and light readings from a
//! pod, keeps a short rolling history, and on a light edge, acceleration
//! spike or external request writes the surrounding window to disk.

pub mod application;
pub mod domain;
pub mod error;
pub mod infrastructure;
