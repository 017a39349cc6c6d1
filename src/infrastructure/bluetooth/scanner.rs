//! BLE Scanner Module
//!
//! Handles Bluetooth LE discovery of sensor pods.

use crate::domain::models::{AppEvent, DeviceRef, MessageSeverity, StatusMessage};
use crate::domain::settings::LinkSettings;
use crate::error::TransportError;
use crate::infrastructure::bluetooth::protocol::ProfileKind;
use crate::infrastructure::bluetooth::transport::{BleTransport, TransportEvent};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

/// Which discovered peripherals are worth showing.
#[derive(Debug, Clone, Default)]
pub struct ScanFilter {
    pub name_prefixes: Vec<String>,
    pub show_all: bool,
}

impl From<&LinkSettings> for ScanFilter {
    fn from(settings: &LinkSettings) -> Self {
        Self {
            name_prefixes: settings.device_name_prefixes.clone(),
            show_all: settings.show_all_devices,
        }
    }
}

impl ScanFilter {
    /// Advertises a known profile service, or has a known name prefix.
    pub fn matches(&self, device: &DeviceRef) -> bool {
        if self.show_all {
            return true;
        }
        let advertises_profile = ProfileKind::PREFERENCE
            .iter()
            .any(|p| device.services.contains(&p.service_uuid()));
        advertises_profile
            || self
                .name_prefixes
                .iter()
                .any(|prefix| device.name.starts_with(prefix.as_str()))
    }
}

/// BLE Scanner for discovering sensor pods
pub struct BleScanner {
    transport: Arc<dyn BleTransport>,
    event_sender: mpsc::UnboundedSender<AppEvent>,
}

impl BleScanner {
    pub fn new(
        transport: Arc<dyn BleTransport>,
        event_sender: mpsc::UnboundedSender<AppEvent>,
    ) -> Self {
        Self {
            transport,
            event_sender,
        }
    }

    /// Scan until the stack ends the scan or `timeout` elapses, whichever
    /// comes first, then return the matching devices.
    ///
    /// The timeout is enforced here because some stacks never report the
    /// end of a scan.
    pub async fn scan(
        &self,
        timeout: Duration,
        filter: &ScanFilter,
    ) -> Result<Vec<DeviceRef>, TransportError> {
        // Stop any existing scan
        self.stop().await?;

        info!("Starting BLE scan ({} ms)", timeout.as_millis());
        self.log("Scanning for sensor pods...", MessageSeverity::Info);

        let mut events = self.transport.events();
        self.transport.start_scan().await?;

        tokio::select! {
            _ = tokio::time::sleep(timeout) => {
                debug!("Scan hit its hard timeout");
            }
            _ = wait_for_scan_end(&mut events) => {
                debug!("Stack ended the scan early");
            }
        }

        if let Err(e) = self.stop().await {
            warn!("Failed to stop scan: {}", e);
        }

        let devices: Vec<DeviceRef> = self
            .transport
            .discovered()
            .await?
            .into_iter()
            .filter(|d| filter.matches(d))
            .collect();

        info!("Scan finished, {} matching devices", devices.len());
        for device in &devices {
            let _ = self.event_sender.send(AppEvent::DeviceFound(device.clone()));
        }
        Ok(devices)
    }

    /// Stop scanning
    pub async fn stop(&self) -> Result<(), TransportError> {
        if self.transport.is_scanning() {
            info!("Stopping BLE scan...");
            self.transport.stop_scan().await?;
            self.log("Scan stopped.", MessageSeverity::Info);
        }
        Ok(())
    }

    pub fn is_scanning(&self) -> bool {
        self.transport.is_scanning()
    }

    fn log(&self, message: &str, severity: MessageSeverity) {
        let _ = self.event_sender.send(AppEvent::LogMessage(StatusMessage {
            message: message.to_string(),
            severity,
        }));
    }
}

async fn wait_for_scan_end(events: &mut broadcast::Receiver<TransportEvent>) {
    loop {
        match events.recv().await {
            Ok(TransportEvent::ScanStopped) => return,
            Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
            // No more events will come; leave it to the timeout.
            Err(broadcast::error::RecvError::Closed) => std::future::pending::<()>().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::bluetooth::testing::{pod, FakeTransport};

    fn devices() -> Vec<DeviceRef> {
        let mut watch = DeviceRef::new("w", "Pixel");
        watch.services = vec![ProfileKind::Watch.service_uuid()];
        vec![pod("a"), DeviceRef::new("h", "Headphones"), watch]
    }

    fn filter() -> ScanFilter {
        ScanFilter::from(&LinkSettings::default())
    }

    #[test]
    fn filter_accepts_profile_services_and_prefixes() {
        let filter = filter();
        let found: Vec<_> = devices().into_iter().filter(|d| filter.matches(d)).collect();
        assert_eq!(found.len(), 2);
        assert!(found.iter().all(|d| d.id != "h"));

        let all = ScanFilter {
            show_all: true,
            ..filter
        };
        assert!(devices().iter().all(|d| all.matches(d)));
    }

    #[tokio::test(start_paused = true)]
    async fn hard_timeout_ends_a_silent_scan() {
        let transport = Arc::new(FakeTransport::with_profile(ProfileKind::MetaWear));
        transport.set_devices(devices());
        let (tx, mut rx) = mpsc::unbounded_channel();
        let scanner = BleScanner::new(transport.clone(), tx);

        let started = tokio::time::Instant::now();
        let found = scanner.scan(Duration::from_secs(10), &filter()).await.unwrap();

        assert!(started.elapsed() >= Duration::from_secs(10));
        assert_eq!(found.len(), 2);
        assert!(!scanner.is_scanning());
        assert_eq!(transport.calls(), vec!["start_scan", "stop_scan"]);

        let mut announced = 0;
        while let Ok(event) = rx.try_recv() {
            if matches!(event, AppEvent::DeviceFound(_)) {
                announced += 1;
            }
        }
        assert_eq!(announced, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn stack_scan_end_returns_early() {
        let transport = Arc::new(FakeTransport::with_profile(ProfileKind::MetaWear));
        transport.set_devices(devices());
        transport.end_scans_early();
        let (tx, _rx) = mpsc::unbounded_channel();
        let scanner = BleScanner::new(transport.clone(), tx);

        let started = tokio::time::Instant::now();
        scanner.scan(Duration::from_secs(10), &filter()).await.unwrap();
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn running_scan_is_stopped_before_a_new_one() {
        let transport = Arc::new(FakeTransport::with_profile(ProfileKind::MetaWear));
        transport.set_scanning(true);
        let (tx, _rx) = mpsc::unbounded_channel();
        let scanner = BleScanner::new(transport.clone(), tx);

        scanner.scan(Duration::from_millis(100), &filter()).await.unwrap();
        assert_eq!(
            transport.calls(),
            vec!["stop_scan", "start_scan", "stop_scan"]
        );
    }
}
