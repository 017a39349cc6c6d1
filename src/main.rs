use anyhow::Context;
use release_capture::application::CaptureService;
use release_capture::domain::clock::SystemClock;
use release_capture::domain::models::{AppEvent, DeviceRef, MessageSeverity};
use release_capture::domain::settings::SettingsService;
use release_capture::infrastructure::bluetooth::btleplug_transport::BtleplugTransport;
use release_capture::infrastructure::export::JsonFileExporter;
use release_capture::infrastructure::logging::init_logger;
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::{info, warn};

/// Usage: `release-capture [device name or id]`
///
/// Type `t` + Enter to trigger a capture by hand, `q` + Enter or Ctrl-C to quit.
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let settings_service = SettingsService::new().context("Failed to load settings")?;

    let _logging_guard = init_logger(&settings_service.get().log_settings)
        .map_err(|e| eprintln!("Failed to initialize logging: {:#}", e))
        .ok();

    info!("Starting release capture");

    let exporter = JsonFileExporter::from_settings(&settings_service.get().export)?;
    let last_device = settings_service.get().last_connected_device.clone();
    let settings = Arc::new(Mutex::new(settings_service));

    let transport = Arc::new(
        BtleplugTransport::new()
            .await
            .context("Bluetooth is not available")?,
    );
    let (event_tx, mut event_rx) = mpsc::unbounded_channel();
    let service = CaptureService::new(
        transport,
        Arc::new(exporter),
        Arc::new(SystemClock),
        settings,
        event_tx,
    );

    println!("Scanning for sensor pods...");
    let devices = service.scan().await?;
    let wanted = std::env::args().nth(1);
    let device = pick_device(&devices, wanted.as_deref(), last_device.as_deref())
        .context("No sensor pod found")?;

    println!("Connecting to {} ({})", device.name, device.id);
    service.connect(&device).await?;
    service.start_session().await?;

    let mut stdin = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            line = stdin.next_line() => match line {
                Ok(Some(line)) => match line.trim() {
                    "t" => {
                        if !service.trigger_external() {
                            println!("A capture is already running");
                        }
                    }
                    "q" => break,
                    _ => {}
                },
                Ok(None) => break,
                Err(e) => {
                    warn!("Could not read stdin: {}", e);
                    break;
                }
            },
            Some(event) = event_rx.recv() => report(&event),
        }
    }

    println!("Shutting down...");
    service.shutdown().await;
    Ok(())
}

/// Explicit name/id match first, then the last connected pod, then the
/// strongest signal.
fn pick_device(
    devices: &[DeviceRef],
    wanted: Option<&str>,
    last: Option<&str>,
) -> Option<DeviceRef> {
    if let Some(wanted) = wanted {
        return devices
            .iter()
            .find(|d| d.id == wanted || d.name.contains(wanted))
            .cloned();
    }
    if let Some(device) = last.and_then(|id| devices.iter().find(|d| d.id == id)) {
        return Some(device.clone());
    }
    devices.iter().max_by_key(|d| d.rssi.unwrap_or(i16::MIN)).cloned()
}

fn report(event: &AppEvent) {
    match event {
        AppEvent::DeviceFound(device) => println!("  found {} ({})", device.name, device.id),
        AppEvent::ConnectionState(status) => println!("Link: {:?}", status),
        AppEvent::LiveSample(_) => {}
        AppEvent::CaptureStarted { source, at } => {
            println!("Capture started by {:?} at {}", source, at)
        }
        AppEvent::CaptureReady(handle) => println!(
            "Capture saved: {} ({} points)",
            handle.path.display(),
            handle.point_count
        ),
        AppEvent::CaptureError(message) => println!("Capture failed: {}", message),
        AppEvent::LogMessage(message) => match message.severity {
            MessageSeverity::Error | MessageSeverity::Warning => {
                println!("! {}", message.message)
            }
            MessageSeverity::Info | MessageSeverity::Success => println!("{}", message.message),
        },
    }
}
