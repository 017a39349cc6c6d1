//! Application Layer
//!
//! Session control on top of the domain pipeline and the BLE link.

pub mod capture_service;

pub use capture_service::CaptureService;
