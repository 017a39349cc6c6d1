//! BLE Device Link
//!
//! Owns the connect/disconnect state machine for one sensor pod:
//!
//! ```text
//! Disconnected → Connecting → ServiceDiscovery → CharacteristicDiscovery
//!     → NotificationsEnabling → Connected → Disconnecting → Disconnected
//! ```
//!
//! Any failure passes through `Failed`, performs a best-effort transport
//! disconnect and lands back in `Disconnected`. `connect`, `disconnect` and
//! `send` are serialized through one sequencer. A device-initiated
//! disconnect is picked up by the link monitor and forces `Disconnected`
//! whatever step was running.

use crate::domain::models::{ConnectionStatus, DeviceRef};
use crate::domain::settings::LinkSettings;
use crate::error::{LinkError, TransportError};
use crate::infrastructure::bluetooth::protocol::{ProfileKind, SensorCommand};
use crate::infrastructure::bluetooth::resolver::{CharacteristicResolver, DeviceLinkHandle};
use crate::infrastructure::bluetooth::transport::{BleTransport, ConnectParams, TransportEvent};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Timing knobs for the connect sequence.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    pub connect_timeout: Duration,
    /// Settle time between connect and GATT discovery.
    pub stabilization_delay: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self::from(&LinkSettings::default())
    }
}

impl From<&LinkSettings> for ConnectionConfig {
    fn from(settings: &LinkSettings) -> Self {
        Self {
            connect_timeout: settings.connect_timeout(),
            stabilization_delay: settings.stabilization_delay(),
        }
    }
}

/// Internal link state. Only `Connected` carries a usable handle.
#[derive(Debug, Clone)]
pub enum LinkState {
    Disconnected,
    Connecting(DeviceRef),
    ServiceDiscovery(DeviceRef),
    CharacteristicDiscovery(DeviceRef),
    NotificationsEnabling(DeviceLinkHandle),
    Connected(DeviceLinkHandle),
    Disconnecting(DeviceLinkHandle),
    Failed,
}

impl LinkState {
    pub fn status(&self) -> ConnectionStatus {
        match self {
            Self::Disconnected => ConnectionStatus::Disconnected,
            Self::Connecting(_) => ConnectionStatus::Connecting,
            Self::ServiceDiscovery(_) => ConnectionStatus::ServiceDiscovery,
            Self::CharacteristicDiscovery(_) => ConnectionStatus::CharacteristicDiscovery,
            Self::NotificationsEnabling(_) => ConnectionStatus::NotificationsEnabling,
            Self::Connected(_) => ConnectionStatus::Connected,
            Self::Disconnecting(_) => ConnectionStatus::Disconnecting,
            Self::Failed => ConnectionStatus::Failed,
        }
    }
}

/// What the link reports to its owner.
#[derive(Debug, Clone, PartialEq)]
pub enum LinkEvent {
    StateChanged(ConnectionStatus),
    /// Raw payload from the notify characteristic.
    Notification { profile: ProfileKind, value: Vec<u8> },
    Disconnected { device_initiated: bool },
}

/// State shared between the link and its monitor task.
struct LinkShared {
    state: Mutex<LinkState>,
    /// Bumped on every connect attempt, explicit disconnect and
    /// device-initiated drop. Steps of an older attempt are discarded.
    epoch: AtomicU64,
    events: mpsc::UnboundedSender<LinkEvent>,
}

impl LinkShared {
    fn state(&self) -> MutexGuard<'_, LinkState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, event: LinkEvent) {
        let _ = self.events.send(event);
    }

    fn set(&self, next: LinkState) {
        let status = next.status();
        *self.state() = next;
        self.emit(LinkEvent::StateChanged(status));
    }

    /// Move to `next` only if no disconnect or newer attempt has happened
    /// since `epoch` was issued.
    fn advance(&self, epoch: u64, next: LinkState) -> bool {
        let status = next.status();
        {
            let mut state = self.state();
            if self.epoch.load(Ordering::SeqCst) != epoch {
                return false;
            }
            *state = next;
        }
        self.emit(LinkEvent::StateChanged(status));
        true
    }

    /// Device went away. Returns true if this changed the link state.
    fn drop_if_current(&self, epoch: u64) -> bool {
        {
            let mut state = self.state();
            if self.epoch.load(Ordering::SeqCst) != epoch {
                return false;
            }
            self.epoch.fetch_add(1, Ordering::SeqCst);
            *state = LinkState::Disconnected;
        }
        self.emit(LinkEvent::StateChanged(ConnectionStatus::Disconnected));
        self.emit(LinkEvent::Disconnected {
            device_initiated: true,
        });
        true
    }
}

pub struct DeviceLink {
    transport: Arc<dyn BleTransport>,
    resolver: CharacteristicResolver,
    config: ConnectionConfig,
    shared: Arc<LinkShared>,
    sequencer: tokio::sync::Mutex<()>,
    monitor: Mutex<Option<JoinHandle<()>>>,
}

impl DeviceLink {
    pub fn new(
        transport: Arc<dyn BleTransport>,
        config: ConnectionConfig,
        events: mpsc::UnboundedSender<LinkEvent>,
    ) -> Self {
        Self {
            transport,
            resolver: CharacteristicResolver::new(),
            config,
            shared: Arc::new(LinkShared {
                state: Mutex::new(LinkState::Disconnected),
                epoch: AtomicU64::new(0),
                events,
            }),
            sequencer: tokio::sync::Mutex::new(()),
            monitor: Mutex::new(None),
        }
    }

    pub fn status(&self) -> ConnectionStatus {
        self.shared.state().status()
    }

    pub fn is_connected(&self) -> bool {
        matches!(*self.shared.state(), LinkState::Connected(_))
    }

    pub fn handle(&self) -> Option<DeviceLinkHandle> {
        match &*self.shared.state() {
            LinkState::Connected(handle) => Some(handle.clone()),
            _ => None,
        }
    }

    /// Connect to `device`, resolve its profile and enable notifications.
    pub async fn connect(&self, device: &DeviceRef) -> Result<DeviceLinkHandle, LinkError> {
        let _turn = self.sequencer.lock().await;

        if let LinkState::Connected(handle) = &*self.shared.state() {
            return Err(LinkError::AlreadyConnected(handle.device.name.clone()));
        }

        // Most stacks cannot scan and connect at the same time.
        if self.transport.is_scanning() {
            info!("Stopping scan before connecting");
            if let Err(e) = self.transport.stop_scan().await {
                warn!("Could not stop scan before connecting: {}", e);
            }
        }

        let epoch = self.shared.epoch.fetch_add(1, Ordering::SeqCst) + 1;
        info!("Connecting to {} ({})", device.name, device.id);
        self.shared.advance(epoch, LinkState::Connecting(device.clone()));

        // Subscribe before connecting so an early drop is not missed.
        let transport_events = self.transport.events();

        let params = ConnectParams::default();
        match tokio::time::timeout(
            self.config.connect_timeout,
            self.transport.connect(device, params),
        )
        .await
        {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(self.fail(device, e.into()).await),
            Err(_) => {
                let e = TransportError::Timeout {
                    operation: "connect",
                    millis: self.config.connect_timeout.as_millis() as u64,
                };
                return Err(self.fail(device, e.into()).await);
            }
        }
        self.spawn_monitor(device.clone(), transport_events, epoch);

        tokio::time::sleep(self.config.stabilization_delay).await;

        if !self
            .shared
            .advance(epoch, LinkState::ServiceDiscovery(device.clone()))
        {
            return Err(self.fail(device, LinkError::DisconnectedDuringConnect).await);
        }
        let services = match self
            .resolver
            .discover_services(self.transport.as_ref(), device)
            .await
        {
            Ok(services) => services,
            Err(e) => return Err(self.fail(device, e.into()).await),
        };

        if !self
            .shared
            .advance(epoch, LinkState::CharacteristicDiscovery(device.clone()))
        {
            return Err(self.fail(device, LinkError::DisconnectedDuringConnect).await);
        }
        let handle = match self
            .resolver
            .select_service(&services)
            .and_then(|(profile, service)| {
                self.resolver
                    .resolve_characteristics(device, profile, service)
            }) {
            Ok(handle) => handle,
            Err(e) => return Err(self.fail(device, e.into()).await),
        };

        if !self
            .shared
            .advance(epoch, LinkState::NotificationsEnabling(handle.clone()))
        {
            return Err(self.fail(device, LinkError::DisconnectedDuringConnect).await);
        }
        if let Err(e) = self.transport.subscribe(device, &handle.notify).await {
            return Err(self.fail(device, e.into()).await);
        }

        if !self
            .shared
            .advance(epoch, LinkState::Connected(handle.clone()))
        {
            return Err(self.fail(device, LinkError::DisconnectedDuringConnect).await);
        }
        info!("Connected to {} using the {:?} profile", device.name, handle.profile);
        Ok(handle)
    }

    /// Unsubscribe, then drop the transport connection. Safe to call in any
    /// state; a no-op when nothing is connected.
    pub async fn disconnect(&self) -> Result<(), LinkError> {
        let _turn = self.sequencer.lock().await;

        let handle = {
            let mut state = self.shared.state();
            let handle = match &*state {
                LinkState::Connected(handle) => handle.clone(),
                _ => {
                    debug!("disconnect() called while not connected");
                    return Ok(());
                }
            };
            self.shared.epoch.fetch_add(1, Ordering::SeqCst);
            *state = LinkState::Disconnecting(handle.clone());
            handle
        };
        self.shared
            .emit(LinkEvent::StateChanged(ConnectionStatus::Disconnecting));
        info!("Disconnecting from {}", handle.device.name);

        // Stop notifications first so none race the teardown.
        if let Err(e) = self.transport.unsubscribe(&handle.device, &handle.notify).await {
            warn!("Unsubscribe during disconnect failed: {}", e);
        }
        self.stop_monitor();

        let result = self.transport.disconnect(&handle.device).await;
        if let Err(e) = &result {
            error!("Transport disconnect failed: {}", e);
        }

        self.shared.set(LinkState::Disconnected);
        self.shared.emit(LinkEvent::Disconnected {
            device_initiated: false,
        });
        result.map_err(LinkError::from)
    }

    /// Write raw bytes to the command characteristic.
    pub async fn send(&self, bytes: &[u8]) -> Result<(), LinkError> {
        let _turn = self.sequencer.lock().await;
        let handle = self.handle().ok_or(LinkError::NotConnected)?;
        self.transport
            .write(
                &handle.device,
                &handle.command,
                bytes,
                handle.profile.write_kind(),
            )
            .await?;
        Ok(())
    }

    /// Encode a sensor start/stop for the connected profile and send it.
    pub async fn send_sensor_command(&self, command: SensorCommand) -> Result<(), LinkError> {
        let profile = self.handle().ok_or(LinkError::NotConnected)?.profile;
        for write in command.encode(profile) {
            self.send(&write).await?;
        }
        Ok(())
    }

    /// Record the failure, release the transport and return to
    /// `Disconnected`. Hands the original error back to the caller.
    async fn fail(&self, device: &DeviceRef, err: LinkError) -> LinkError {
        error!("Connecting to {} failed: {}", device.name, err);
        self.shared.epoch.fetch_add(1, Ordering::SeqCst);
        self.shared.set(LinkState::Failed);
        self.stop_monitor();
        if let Err(e) = self.transport.disconnect(device).await {
            warn!("Cleanup disconnect after failure also failed: {}", e);
        }
        self.shared.set(LinkState::Disconnected);
        err
    }

    fn spawn_monitor(
        &self,
        device: DeviceRef,
        mut transport_events: broadcast::Receiver<TransportEvent>,
        epoch: u64,
    ) {
        let shared = self.shared.clone();
        let task = tokio::spawn(async move {
            loop {
                match transport_events.recv().await {
                    Ok(TransportEvent::Notification {
                        device_id,
                        characteristic,
                        value,
                    }) if device_id == device.id => {
                        let profile = match &*shared.state() {
                            LinkState::Connected(handle)
                            | LinkState::NotificationsEnabling(handle)
                                if handle.notify.uuid == characteristic =>
                            {
                                Some(handle.profile)
                            }
                            _ => None,
                        };
                        if let Some(profile) = profile {
                            shared.emit(LinkEvent::Notification { profile, value });
                        }
                    }
                    Ok(TransportEvent::DeviceDisconnected(id)) if id == device.id => {
                        if shared.drop_if_current(epoch) {
                            warn!("{} disconnected from the device side", device.name);
                        }
                        break;
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!("Link monitor lagged, {} transport events dropped", skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        let previous = self
            .monitor
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(task);
        if let Some(previous) = previous {
            previous.abort();
        }
    }

    fn stop_monitor(&self) {
        let task = self
            .monitor
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(task) = task {
            task.abort();
        }
    }
}

impl Drop for DeviceLink {
    fn drop(&mut self) {
        self.stop_monitor();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::Channel;
    use crate::error::ResolveError;
    use crate::infrastructure::bluetooth::testing::{pod, FakeTransport};
    use crate::infrastructure::bluetooth::transport::GattService;

    fn link_with(
        transport: Arc<FakeTransport>,
    ) -> (DeviceLink, mpsc::UnboundedReceiver<LinkEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let config = ConnectionConfig {
            connect_timeout: Duration::from_secs(2),
            stabilization_delay: Duration::from_millis(500),
        };
        (DeviceLink::new(transport, config, tx), rx)
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<LinkEvent>) -> Vec<LinkEvent> {
        let mut out = Vec::new();
        while let Ok(ev) = rx.try_recv() {
            out.push(ev);
        }
        out
    }

    #[tokio::test(start_paused = true)]
    async fn connect_walks_every_state_in_order() {
        let transport = Arc::new(FakeTransport::with_profile(ProfileKind::MetaWear));
        let (link, mut rx) = link_with(transport.clone());

        let handle = link.connect(&pod("a")).await.unwrap();
        assert_eq!(handle.profile, ProfileKind::MetaWear);
        assert!(link.is_connected());

        let states: Vec<_> = drain(&mut rx)
            .into_iter()
            .filter_map(|e| match e {
                LinkEvent::StateChanged(s) => Some(s),
                _ => None,
            })
            .collect();
        assert_eq!(
            states,
            vec![
                ConnectionStatus::Connecting,
                ConnectionStatus::ServiceDiscovery,
                ConnectionStatus::CharacteristicDiscovery,
                ConnectionStatus::NotificationsEnabling,
                ConnectionStatus::Connected,
            ]
        );
        let calls = transport.calls();
        assert_eq!(calls[0], "connect:a:false");
        assert_eq!(calls[1], "services");
        assert!(calls[2].starts_with("subscribe:"));
    }

    #[tokio::test(start_paused = true)]
    async fn connect_stops_a_running_scan_first() {
        let transport = Arc::new(FakeTransport::with_profile(ProfileKind::Watch));
        transport.set_scanning(true);
        let (link, _rx) = link_with(transport.clone());

        link.connect(&pod("a")).await.unwrap();
        assert_eq!(transport.calls()[0], "stop_scan");
        assert!(!transport.is_scanning());
    }

    #[tokio::test(start_paused = true)]
    async fn profile_mismatch_disconnects_and_restores_disconnected() {
        let transport = Arc::new(FakeTransport::new(vec![GattService {
            uuid: uuid::Uuid::from_u128(0x180f),
            characteristics: vec![],
        }]));
        let (link, mut rx) = link_with(transport.clone());

        let err = link.connect(&pod("a")).await.unwrap_err();
        assert!(matches!(
            err,
            LinkError::ProfileMismatch(ResolveError::ServiceNotFound)
        ));
        assert!(!err.is_retryable());
        assert_eq!(link.status(), ConnectionStatus::Disconnected);
        assert!(transport.calls().contains(&"disconnect:a".to_string()));

        let events = drain(&mut rx);
        let failed = events
            .iter()
            .position(|e| *e == LinkEvent::StateChanged(ConnectionStatus::Failed))
            .unwrap();
        assert_eq!(
            events.last(),
            Some(&LinkEvent::StateChanged(ConnectionStatus::Disconnected))
        );
        assert!(failed < events.len() - 1);
    }

    #[tokio::test(start_paused = true)]
    async fn connect_timeout_is_a_retryable_transport_error() {
        let transport = Arc::new(FakeTransport::with_profile(ProfileKind::Watch));
        transport.set_connect_delay(Duration::from_secs(30));
        let (link, _rx) = link_with(transport.clone());

        let err = link.connect(&pod("a")).await.unwrap_err();
        assert!(matches!(
            err,
            LinkError::Transport(TransportError::Timeout { .. })
        ));
        assert!(err.is_retryable());
        assert_eq!(link.status(), ConnectionStatus::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_is_idempotent() {
        let transport = Arc::new(FakeTransport::with_profile(ProfileKind::Watch));
        let (link, _rx) = link_with(transport.clone());

        link.disconnect().await.unwrap();
        assert_eq!(link.status(), ConnectionStatus::Disconnected);

        link.connect(&pod("a")).await.unwrap();
        link.disconnect().await.unwrap();
        link.disconnect().await.unwrap();
        assert_eq!(link.status(), ConnectionStatus::Disconnected);

        let calls = transport.calls();
        let unsubscribe = calls.iter().position(|c| c.starts_with("unsubscribe")).unwrap();
        let disconnect = calls.iter().position(|c| c == "disconnect:a").unwrap();
        assert!(unsubscribe < disconnect);
        assert_eq!(calls.iter().filter(|c| *c == "disconnect:a").count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn send_requires_a_connection() {
        let transport = Arc::new(FakeTransport::with_profile(ProfileKind::Watch));
        let (link, _rx) = link_with(transport.clone());

        assert!(matches!(link.send(b"x").await, Err(LinkError::NotConnected)));

        link.connect(&pod("a")).await.unwrap();
        link.send_sensor_command(SensorCommand::start(Channel::Accel))
            .await
            .unwrap();
        assert_eq!(transport.writes(), vec![b"START:A\n".to_vec()]);
    }

    #[tokio::test(start_paused = true)]
    async fn notifications_are_forwarded_with_the_resolved_profile() {
        let transport = Arc::new(FakeTransport::with_profile(ProfileKind::Watch));
        let (link, mut rx) = link_with(transport.clone());
        let device = pod("a");
        link.connect(&device).await.unwrap();
        drain(&mut rx);

        transport.notify(&device, ProfileKind::Watch.notify_uuid(), vec![b'L', 0, 0, 0, 0]);
        transport.notify(&pod("other"), ProfileKind::Watch.notify_uuid(), vec![1]);
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(
            drain(&mut rx),
            vec![LinkEvent::Notification {
                profile: ProfileKind::Watch,
                value: vec![b'L', 0, 0, 0, 0],
            }]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn device_initiated_disconnect_forces_disconnected() {
        let transport = Arc::new(FakeTransport::with_profile(ProfileKind::Watch));
        let (link, mut rx) = link_with(transport.clone());
        let device = pod("a");
        link.connect(&device).await.unwrap();
        drain(&mut rx);

        transport.drop_link(&device);
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(link.status(), ConnectionStatus::Disconnected);
        assert!(drain(&mut rx).contains(&LinkEvent::Disconnected {
            device_initiated: true
        }));
        assert!(matches!(link.send(b"x").await, Err(LinkError::NotConnected)));
        link.disconnect().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn drop_during_stabilization_aborts_the_connect() {
        let transport = Arc::new(FakeTransport::with_profile(ProfileKind::Watch));
        let (link, _rx) = link_with(transport.clone());
        let link = Arc::new(link);
        let device = pod("a");

        let connecting = {
            let link = link.clone();
            let device = device.clone();
            tokio::spawn(async move { link.connect(&device).await })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;
        transport.drop_link(&device);

        let err = connecting.await.unwrap().unwrap_err();
        assert!(matches!(err, LinkError::DisconnectedDuringConnect));
        assert_eq!(link.status(), ConnectionStatus::Disconnected);
        assert!(!transport.calls().contains(&"services".to_string()));
    }
}
