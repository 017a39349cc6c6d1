//! Bluetooth Service Module
//!
//! Main service that coordinates scanning and the device link for the
//! sensor pod, including connect retries.

use crate::domain::models::{AppEvent, DeviceRef, MessageSeverity, StatusMessage};
use crate::domain::settings::{LinkSettings, SettingsService};
use crate::error::{LinkError, TransportError};
use crate::infrastructure::bluetooth::connection::{ConnectionConfig, DeviceLink, LinkEvent};
use crate::infrastructure::bluetooth::resolver::DeviceLinkHandle;
use crate::infrastructure::bluetooth::scanner::{BleScanner, ScanFilter};
use crate::infrastructure::bluetooth::transport::BleTransport;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::mpsc;
use tracing::{info, warn};

/// Main Bluetooth service coordinating all BLE operations
pub struct BluetoothService {
    scanner: BleScanner,
    link: Arc<DeviceLink>,
    event_sender: mpsc::UnboundedSender<AppEvent>,
    settings: Arc<Mutex<SettingsService>>,
}

impl BluetoothService {
    /// Link state changes and notifications go to `link_events`; user-facing
    /// messages go to `event_sender`.
    pub fn new(
        transport: Arc<dyn BleTransport>,
        event_sender: mpsc::UnboundedSender<AppEvent>,
        link_events: mpsc::UnboundedSender<LinkEvent>,
        settings: Arc<Mutex<SettingsService>>,
    ) -> Self {
        let config = {
            let settings = settings.lock().unwrap_or_else(PoisonError::into_inner);
            ConnectionConfig::from(&settings.get().link)
        };
        Self {
            scanner: BleScanner::new(transport.clone(), event_sender.clone()),
            link: Arc::new(DeviceLink::new(transport, config, link_events)),
            event_sender,
            settings,
        }
    }

    fn link_settings(&self) -> LinkSettings {
        self.settings
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get()
            .link
            .clone()
    }

    /// Scan for sensor pods using the configured timeout and filter.
    pub async fn scan(&self) -> Result<Vec<DeviceRef>, TransportError> {
        let settings = self.link_settings();
        self.scanner
            .scan(settings.scan_timeout(), &ScanFilter::from(&settings))
            .await
    }

    pub async fn stop_scan(&self) -> Result<(), TransportError> {
        self.scanner.stop().await
    }

    /// Connect, retrying the whole sequence on transport failures. Profile
    /// mismatches fail immediately.
    pub async fn connect(&self, device: &DeviceRef) -> Result<DeviceLinkHandle, LinkError> {
        let settings = self.link_settings();
        let attempts = settings.connect_attempts.max(1);

        let mut attempt = 1;
        loop {
            match self.link.connect(device).await {
                Ok(handle) => {
                    self.log(
                        format!("Connected to {} ({:?})", device.name, handle.profile),
                        MessageSeverity::Success,
                    );
                    self.remember(device);
                    return Ok(handle);
                }
                Err(e) if e.is_retryable() && attempt < attempts => {
                    warn!(
                        "Connect attempt {}/{} to {} failed: {}",
                        attempt, attempts, device.name, e
                    );
                    self.log(
                        format!("Connect attempt {attempt} failed, retrying..."),
                        MessageSeverity::Warning,
                    );
                    tokio::time::sleep(settings.connect_retry_delay()).await;
                    attempt += 1;
                }
                Err(e) => {
                    self.log(
                        format!("Could not connect to {}: {}", device.name, e),
                        MessageSeverity::Error,
                    );
                    return Err(e);
                }
            }
        }
    }

    /// Disconnect from the current device
    pub async fn disconnect(&self) -> Result<(), LinkError> {
        let was_connected = self.link.is_connected();
        let result = self.link.disconnect().await;
        if was_connected {
            info!("Disconnected from device");
            self.log("Disconnected from device".to_string(), MessageSeverity::Info);
        }
        result
    }

    pub fn link(&self) -> Arc<DeviceLink> {
        self.link.clone()
    }

    pub fn is_connected(&self) -> bool {
        self.link.is_connected()
    }

    fn remember(&self, device: &DeviceRef) {
        let mut settings = self.settings.lock().unwrap_or_else(PoisonError::into_inner);
        if let Err(e) = settings.remember_device(&device.id) {
            warn!("Could not save last connected device: {}", e);
        }
    }

    fn log(&self, message: String, severity: MessageSeverity) {
        let _ = self
            .event_sender
            .send(AppEvent::LogMessage(StatusMessage { message, severity }));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::bluetooth::protocol::ProfileKind;
    use crate::infrastructure::bluetooth::testing::{pod, FakeTransport};

    fn service(
        transport: Arc<FakeTransport>,
        name: &str,
    ) -> (BluetoothService, Arc<Mutex<SettingsService>>) {
        let path = std::env::temp_dir()
            .join(format!("release_capture_bt_{}_{}", std::process::id(), name))
            .join("settings.json");
        let _ = std::fs::remove_file(&path);
        let settings = Arc::new(Mutex::new(SettingsService::with_path(path)));
        let (tx, _rx) = mpsc::unbounded_channel();
        let (link_tx, _link_rx) = mpsc::unbounded_channel();
        (
            BluetoothService::new(transport, tx, link_tx, settings.clone()),
            settings,
        )
    }

    #[tokio::test(start_paused = true)]
    async fn transport_failures_are_retried() {
        let transport = Arc::new(FakeTransport::with_profile(ProfileKind::Watch));
        transport.fail_next_connects(2);
        let (service, settings) = service(transport.clone(), "retry");

        let handle = service.connect(&pod("a")).await.unwrap();
        assert_eq!(handle.profile, ProfileKind::Watch);
        let connects = transport
            .calls()
            .iter()
            .filter(|c| c.starts_with("connect:"))
            .count();
        assert_eq!(connects, 3);
        assert_eq!(
            settings.lock().unwrap().get().last_connected_device.as_deref(),
            Some("a")
        );
    }

    #[tokio::test(start_paused = true)]
    async fn retries_stop_at_the_configured_attempts() {
        let transport = Arc::new(FakeTransport::with_profile(ProfileKind::Watch));
        transport.fail_next_connects(10);
        let (service, _settings) = service(transport.clone(), "exhaust");

        let err = service.connect(&pod("a")).await.unwrap_err();
        assert!(matches!(err, LinkError::Transport(_)));
        let connects = transport
            .calls()
            .iter()
            .filter(|c| c.starts_with("connect:"))
            .count();
        assert_eq!(connects, 3);
        assert!(!service.is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn profile_mismatch_is_not_retried() {
        let transport = Arc::new(FakeTransport::new(vec![]));
        let (service, _settings) = service(transport.clone(), "mismatch");

        let err = service.connect(&pod("a")).await.unwrap_err();
        assert!(matches!(err, LinkError::ProfileMismatch(_)));
        assert_eq!(
            transport
                .calls()
                .iter()
                .filter(|c| c.starts_with("connect:"))
                .count(),
            1
        );
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_when_idle_is_a_no_op() {
        let transport = Arc::new(FakeTransport::with_profile(ProfileKind::Watch));
        let (service, _settings) = service(transport.clone(), "idle");
        service.disconnect().await.unwrap();
        service.disconnect().await.unwrap();
        assert!(transport.calls().is_empty());
    }
}
