//! Capture Service
//!
//! Wires the device link to the capture pipeline and exposes the calls the
//! UI makes: scan, connect, start/stop session, disconnect.
//!
//! ```text
//! DeviceLink ──LinkEvent──▶ router ──▶ TelemetryDemuxer ──▶ RollingBuffer
//!                                                   │            ▲ eviction timer
//!                                                   ├──▶ SpikeDetector
//!                                                   └──▶ light edge
//!                                                            │ trigger
//!                                   accumulation timer ──▶ CaptureOrchestrator ──▶ CaptureSink
//! ```
//!
//! Buffer, detector and orchestrator each sit behind their own mutex and no
//! two of them are ever held at once.

use crate::domain::capture::{CaptureConfig, CaptureOrchestrator, TickOutcome};
use crate::domain::clock::Clock;
use crate::domain::models::{
    AppEvent, Channel, DeviceRef, MessageSeverity, SensorSample, StatusMessage, Timestamp,
    TriggerSource,
};
use crate::domain::rolling_buffer::RollingBuffer;
use crate::domain::settings::{CaptureSettings, Settings, SettingsService};
use crate::domain::spike::SpikeDetector;
use crate::error::{CaptureError, LinkError, TransportError};
use crate::infrastructure::bluetooth::connection::{DeviceLink, LinkEvent};
use crate::infrastructure::bluetooth::protocol::SensorCommand;
use crate::infrastructure::bluetooth::resolver::DeviceLinkHandle;
use crate::infrastructure::bluetooth::telemetry::{DemuxStats, TelemetryDemuxer};
use crate::infrastructure::bluetooth::transport::BleTransport;
use crate::infrastructure::bluetooth::BluetoothService;
use crate::infrastructure::export::CaptureSink;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Default)]
struct SessionTimers {
    eviction: Option<JoinHandle<()>>,
    accumulation: Option<JoinHandle<()>>,
}

impl SessionTimers {
    fn cancel(&mut self) {
        for task in [self.eviction.take(), self.accumulation.take()].into_iter().flatten() {
            task.abort();
        }
    }
}

/// Everything the router and timers touch.
#[derive(Clone)]
struct Pipeline {
    demuxer: Arc<TelemetryDemuxer>,
    buffer: Arc<Mutex<RollingBuffer>>,
    detector: Arc<Mutex<SpikeDetector>>,
    orchestrator: Arc<Mutex<CaptureOrchestrator>>,
    config: Arc<Mutex<CaptureSettings>>,
    timers: Arc<Mutex<SessionTimers>>,
    live_sent: Arc<Mutex<HashMap<Channel, Timestamp>>>,
    active: Arc<AtomicBool>,
    sink: Arc<dyn CaptureSink>,
    clock: Arc<dyn Clock>,
    events: mpsc::UnboundedSender<AppEvent>,
}

impl Pipeline {
    fn new(
        settings: &Settings,
        sink: Arc<dyn CaptureSink>,
        clock: Arc<dyn Clock>,
        events: mpsc::UnboundedSender<AppEvent>,
    ) -> Self {
        let capture = settings.capture.clone();
        Self {
            demuxer: Arc::new(TelemetryDemuxer::new()),
            buffer: Arc::new(Mutex::new(RollingBuffer::new(
                capture.buffer_window_ms as i64,
                capture.dedup_tolerance_ms,
            ))),
            detector: Arc::new(Mutex::new(SpikeDetector::new(settings.spike.clone()))),
            orchestrator: Arc::new(Mutex::new(CaptureOrchestrator::new(CaptureConfig::from(
                &capture,
            )))),
            config: Arc::new(Mutex::new(capture)),
            timers: Arc::new(Mutex::new(SessionTimers::default())),
            live_sent: Arc::new(Mutex::new(HashMap::new())),
            active: Arc::new(AtomicBool::new(false)),
            sink,
            clock,
            events,
        }
    }

    fn emit(&self, event: AppEvent) {
        let _ = self.events.send(event);
    }

    fn message(&self, message: String, severity: MessageSeverity) {
        self.emit(AppEvent::LogMessage(StatusMessage { message, severity }));
    }

    /// Rebuild the pipeline state from current settings.
    fn reset(&self, settings: &Settings) {
        let capture = settings.capture.clone();
        *lock(&self.buffer) =
            RollingBuffer::new(capture.buffer_window_ms as i64, capture.dedup_tolerance_ms);
        *lock(&self.detector) = SpikeDetector::new(settings.spike.clone());
        *lock(&self.orchestrator) = CaptureOrchestrator::new(CaptureConfig::from(&capture));
        lock(&self.live_sent).clear();
        *lock(&self.config) = capture;
    }

    fn handle_link_event(&self, event: LinkEvent) {
        match event {
            LinkEvent::StateChanged(status) => self.emit(AppEvent::ConnectionState(status)),
            LinkEvent::Disconnected { device_initiated } => {
                if device_initiated {
                    warn!("Sensor pod dropped the connection");
                    self.message(
                        "Sensor pod disconnected".to_string(),
                        MessageSeverity::Warning,
                    );
                    self.link_lost();
                }
            }
            LinkEvent::Notification { profile, value } => {
                let now = self.clock.now_ms();
                if let Some(sample) = self.demuxer.demux(profile, &value, now) {
                    self.publish_live(&sample);
                    if self.active.load(Ordering::SeqCst) {
                        self.ingest(sample);
                    }
                }
            }
        }
    }

    /// Deactivate the session, cancel its timers and discard any running
    /// capture. Returns `(was_active, was_capturing)`.
    fn end_session(&self) -> (bool, bool) {
        if !self.active.swap(false, Ordering::SeqCst) {
            return (false, false);
        }
        lock(&self.timers).cancel();
        let mut orchestrator = lock(&self.orchestrator);
        let was_capturing = orchestrator.is_triggered();
        orchestrator.reset();
        (true, was_capturing)
    }

    /// The pod went away on its own. There is no link left to switch
    /// sensors off on, so only the local session state is torn down.
    fn link_lost(&self) {
        let (was_active, was_capturing) = self.end_session();
        if !was_active {
            return;
        }
        if was_capturing {
            warn!("Capture abandoned, link lost");
            self.emit(AppEvent::CaptureError(
                "Sensor pod disconnected during capture".to_string(),
            ));
        }
        info!("Capture session ended by link loss");
        self.message(
            "Capture session ended: sensor pod disconnected".to_string(),
            MessageSeverity::Warning,
        );
    }

    /// Display feed, at most one sample per channel per interval.
    fn publish_live(&self, sample: &SensorSample) {
        let interval = lock(&self.config).live_sample_interval_ms as i64;
        let mut sent = lock(&self.live_sent);
        let due = sent
            .get(&sample.channel)
            .map_or(true, |last| sample.timestamp - last >= interval);
        if due {
            sent.insert(sample.channel, sample.timestamp);
            drop(sent);
            self.emit(AppEvent::LiveSample(*sample));
        }
    }

    fn ingest(&self, sample: SensorSample) {
        lock(&self.buffer).ingest(&sample);

        let mut trigger = None;
        match sample.channel {
            Channel::Accel => {
                let spike = lock(&self.detector).process(&sample);
                if spike.is_some() && lock(&self.config).trigger_on_spike {
                    trigger = Some(TriggerSource::Spike);
                }
            }
            Channel::Light => {
                if let Some(lux) = sample.as_scalar() {
                    if lock(&self.orchestrator).observe_light(lux) {
                        trigger = Some(TriggerSource::Light);
                    }
                }
            }
            Channel::Gyro | Channel::Mag => {}
        }

        if let Some(source) = trigger {
            self.start_capture(source, sample.timestamp);
        }
    }

    /// Open a capture seeded from the buffer and start its accumulation
    /// timer. False if one is already running.
    fn start_capture(&self, source: TriggerSource, now: Timestamp) -> bool {
        let snapshot = lock(&self.buffer).snapshot();
        if !lock(&self.orchestrator).trigger(source, now, &snapshot) {
            return false;
        }
        self.emit(AppEvent::CaptureStarted { source, at: now });

        let pipeline = self.clone();
        let period = lock(&self.config).accumulation_period();
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let now = pipeline.clock.now_ms();
                let snapshot = lock(&pipeline.buffer).snapshot();
                let outcome = lock(&pipeline.orchestrator).tick(now, &snapshot);
                match outcome {
                    TickOutcome::Accumulating { added } => {
                        if added > 0 {
                            debug!("Accumulated {} new points", added);
                        }
                    }
                    TickOutcome::Due => {
                        pipeline.finalize().await;
                        break;
                    }
                    TickOutcome::Idle => break,
                }
            }
        });
        if let Some(previous) = lock(&self.timers).accumulation.replace(task) {
            previous.abort();
        }
        true
    }

    async fn finalize(&self) {
        let (derivatives, trigger_timestamps) = {
            let detector = lock(&self.detector);
            (
                detector.derivatives().to_vec(),
                detector.trigger_timestamps().to_vec(),
            )
        };
        let result = lock(&self.orchestrator).finalize(derivatives, trigger_timestamps);
        let bundle = match result {
            Ok(bundle) => bundle,
            Err(CaptureError::NotActive) => return,
            Err(e) => {
                warn!("Capture failed: {}", e);
                self.emit(AppEvent::CaptureError(e.to_string()));
                return;
            }
        };

        let sink = self.sink.clone();
        let delivered = tokio::task::spawn_blocking(move || sink.deliver(&bundle)).await;
        lock(&self.orchestrator).finish();

        match delivered {
            Ok(Ok(handle)) => {
                info!("Capture ready: {}", handle.path.display());
                self.emit(AppEvent::CaptureReady(handle));
            }
            Ok(Err(e)) => {
                let e = CaptureError::from(e);
                error!("{}", e);
                self.emit(AppEvent::CaptureError(e.to_string()));
            }
            Err(e) => {
                error!("Capture export task failed: {}", e);
                self.emit(AppEvent::CaptureError(e.to_string()));
            }
        }
    }

    fn start_eviction(&self) {
        let pipeline = self.clone();
        let period = lock(&self.config).eviction_period();
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let now = pipeline.clock.now_ms();
                let evicted = lock(&pipeline.buffer).evict(now);
                if evicted > 0 {
                    debug!("Evicted {} points", evicted);
                }
            }
        });
        if let Some(previous) = lock(&self.timers).eviction.replace(task) {
            previous.abort();
        }
    }
}

pub struct CaptureService {
    bluetooth: BluetoothService,
    link: Arc<DeviceLink>,
    pipeline: Pipeline,
    settings: Arc<Mutex<SettingsService>>,
    router: JoinHandle<()>,
}

impl CaptureService {
    /// Must be called inside a tokio runtime; spawns the event router.
    pub fn new(
        transport: Arc<dyn BleTransport>,
        sink: Arc<dyn CaptureSink>,
        clock: Arc<dyn Clock>,
        settings: Arc<Mutex<SettingsService>>,
        event_sender: mpsc::UnboundedSender<AppEvent>,
    ) -> Self {
        let (link_tx, mut link_rx) = mpsc::unbounded_channel();
        let bluetooth =
            BluetoothService::new(transport, event_sender.clone(), link_tx, settings.clone());
        let pipeline = {
            let settings = lock(&settings);
            Pipeline::new(settings.get(), sink, clock, event_sender)
        };

        let router_pipeline = pipeline.clone();
        let router = tokio::spawn(async move {
            while let Some(event) = link_rx.recv().await {
                router_pipeline.handle_link_event(event);
            }
        });

        Self {
            link: bluetooth.link(),
            bluetooth,
            pipeline,
            settings,
            router,
        }
    }

    pub async fn scan(&self) -> Result<Vec<DeviceRef>, TransportError> {
        self.bluetooth.scan().await
    }

    pub async fn connect(&self, device: &DeviceRef) -> Result<DeviceLinkHandle, LinkError> {
        self.bluetooth.connect(device).await
    }

    /// Stops a running session first so no timer fires against a link that
    /// is going away.
    pub async fn disconnect(&self) -> Result<(), LinkError> {
        if self.is_session_active() {
            self.stop_session().await;
        }
        self.bluetooth.disconnect().await
    }

    /// Reset the pipeline, start the eviction timer and switch the
    /// configured sensors on. Sensor start failures are logged, not fatal.
    pub async fn start_session(&self) -> Result<(), LinkError> {
        if self.is_session_active() {
            debug!("start_session() called while a session is running");
            return Ok(());
        }
        if !self.link.is_connected() {
            return Err(LinkError::NotConnected);
        }

        let settings = lock(&self.settings).get().clone();
        self.pipeline.reset(&settings);
        self.pipeline.active.store(true, Ordering::SeqCst);
        self.pipeline.start_eviction();

        for channel in &settings.capture.channels {
            if let Err(e) = self
                .link
                .send_sensor_command(SensorCommand::start(*channel))
                .await
            {
                warn!("Could not start {:?} stream: {}", channel, e);
                self.pipeline.message(
                    format!("{channel:?} sensor unavailable: {e}"),
                    MessageSeverity::Warning,
                );
            }
        }

        info!("Capture session started");
        self.pipeline
            .message("Capture session started".to_string(), MessageSeverity::Info);
        Ok(())
    }

    /// Cancel timers, drop any in-progress capture and switch sensors off.
    pub async fn stop_session(&self) {
        if !self.pipeline.end_session().0 {
            return;
        }

        let channels = lock(&self.pipeline.config).channels.clone();
        if self.link.is_connected() {
            for channel in channels {
                if let Err(e) = self
                    .link
                    .send_sensor_command(SensorCommand::stop(channel))
                    .await
                {
                    warn!("Could not stop {:?} stream: {}", channel, e);
                }
            }
        }

        let stats = self.pipeline.demuxer.stats();
        info!(
            "Capture session stopped ({} frames decoded, {} dropped)",
            stats.decoded,
            stats.dropped()
        );
        self.pipeline
            .message("Capture session stopped".to_string(), MessageSeverity::Info);
    }

    /// Start a capture from outside the pipeline, e.g. a UI button.
    pub fn trigger_external(&self) -> bool {
        if !self.is_session_active() {
            return false;
        }
        let now = self.pipeline.clock.now_ms();
        self.pipeline.start_capture(TriggerSource::External, now)
    }

    pub fn is_session_active(&self) -> bool {
        self.pipeline.active.load(Ordering::SeqCst)
    }

    pub fn is_capturing(&self) -> bool {
        lock(&self.pipeline.orchestrator).is_triggered()
    }

    pub fn demux_stats(&self) -> DemuxStats {
        self.pipeline.demuxer.stats()
    }

    /// Stop the session and release the link.
    pub async fn shutdown(&self) {
        self.stop_session().await;
        if let Err(e) = self.bluetooth.disconnect().await {
            warn!("Disconnect during shutdown failed: {}", e);
        }
    }
}

impl Drop for CaptureService {
    fn drop(&mut self) {
        lock(&self.pipeline.timers).cancel();
        self.router.abort();
    }
}
