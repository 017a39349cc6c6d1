use crate::domain::models::Channel;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogSettings {
    #[serde(default = "default_level")]
    pub level: String, // "trace", "debug", "info", "warn", "error"
    #[serde(default = "default_true")]
    pub file_logging_enabled: bool,
    #[serde(default = "default_true")]
    pub console_logging_enabled: bool,
    #[serde(default = "default_log_dir")]
    pub log_dir: String,
    #[serde(default = "default_prefix")]
    pub file_name_prefix: String,
    #[serde(default = "default_true")]
    pub show_file_line: bool,
    #[serde(default = "default_false")]
    pub show_thread_ids: bool,
    #[serde(default = "default_true")]
    pub show_target: bool,
    #[serde(default = "default_true")]
    pub ansi_colors: bool,
    #[serde(default = "default_rotation")]
    pub rotation: String, // "daily", "hourly", "minutely", "never"
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            level: default_level(),
            file_logging_enabled: default_true(),
            console_logging_enabled: default_true(),
            log_dir: default_log_dir(),
            file_name_prefix: default_prefix(),
            show_file_line: default_true(),
            show_thread_ids: default_false(),
            show_target: default_true(),
            ansi_colors: default_true(),
            rotation: default_rotation(),
        }
    }
}

fn default_level() -> String {
    "info".to_string()
}
fn default_true() -> bool {
    true
}
fn default_false() -> bool {
    false
}
fn default_log_dir() -> String {
    "logs".to_string()
}
fn default_prefix() -> String {
    "release_capture".to_string()
}
fn default_rotation() -> String {
    "daily".to_string()
}

/// Scan and connect behaviour of the device link.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkSettings {
    /// Hard upper bound on a scan, enforced even if the stack never reports
    /// that its own scan ended.
    pub scan_timeout_ms: u64,
    pub connect_timeout_ms: u64,
    /// Pause between a successful connect and GATT discovery.
    pub stabilization_delay_ms: u64,
    pub connect_attempts: u32,
    pub connect_retry_delay_ms: u64,
    pub device_name_prefixes: Vec<String>,
    pub show_all_devices: bool,
}

impl Default for LinkSettings {
    fn default() -> Self {
        Self {
            scan_timeout_ms: 10_000,
            connect_timeout_ms: 10_000,
            stabilization_delay_ms: 1_000,
            connect_attempts: 3,
            connect_retry_delay_ms: 1_000,
            device_name_prefixes: vec!["MetaWear".to_string(), "Watch".to_string()],
            show_all_devices: false,
        }
    }
}

impl LinkSettings {
    pub fn scan_timeout(&self) -> Duration {
        Duration::from_millis(self.scan_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn stabilization_delay(&self) -> Duration {
        Duration::from_millis(self.stabilization_delay_ms)
    }

    pub fn connect_retry_delay(&self) -> Duration {
        Duration::from_millis(self.connect_retry_delay_ms)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LightEdge {
    /// Fire when the light level climbs to or above the threshold.
    Rising,
    /// Fire when the light level drops to or below the threshold.
    Falling,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureSettings {
    pub buffer_window_ms: u64,
    pub eviction_period_ms: u64,
    pub extended_capture_ms: u64,
    pub accumulation_period_ms: u64,
    pub dedup_tolerance_ms: i64,
    pub light_threshold: f32,
    pub light_edge: LightEdge,
    pub trigger_on_spike: bool,
    pub live_sample_interval_ms: u64,
    /// Sensor streams switched on when a session starts.
    pub channels: Vec<Channel>,
}

impl Default for CaptureSettings {
    fn default() -> Self {
        Self {
            buffer_window_ms: 3_000,
            eviction_period_ms: 200,
            extended_capture_ms: 4_000,
            accumulation_period_ms: 100,
            dedup_tolerance_ms: 10,
            light_threshold: 50.0,
            light_edge: LightEdge::Rising,
            trigger_on_spike: false,
            live_sample_interval_ms: 100,
            channels: Channel::ALL.to_vec(),
        }
    }
}

impl CaptureSettings {
    pub fn eviction_period(&self) -> Duration {
        Duration::from_millis(self.eviction_period_ms.max(1))
    }

    pub fn accumulation_period(&self) -> Duration {
        Duration::from_millis(self.accumulation_period_ms.max(1))
    }
}

/// Adaptive spike detection parameters.
///
/// `fallback_threshold` is used until `window_size` derivative magnitudes
/// have been seen; afterwards the threshold is
/// `max(average * spike_multiplier, minimum_threshold)`. The two thresholds
/// are tuned separately.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SpikeSettings {
    pub window_size: usize,
    pub spike_multiplier: f64,
    pub minimum_threshold: f64,
    pub fallback_threshold: f64,
}

impl Default for SpikeSettings {
    fn default() -> Self {
        Self {
            window_size: 10,
            spike_multiplier: 3.0,
            minimum_threshold: 15.0,
            fallback_threshold: 40.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExportSettings {
    /// Defaults to the platform data directory when unset.
    pub output_dir: Option<String>,
    pub pretty: bool,
}

impl Default for ExportSettings {
    fn default() -> Self {
        Self {
            output_dir: None,
            pretty: true,
        }
    }
}

impl ExportSettings {
    pub fn resolve_output_dir(&self) -> anyhow::Result<PathBuf> {
        if let Some(dir) = &self.output_dir {
            return Ok(PathBuf::from(dir));
        }
        let mut path = dirs::data_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not determine data directory"))?;
        path.push("ReleaseCapture");
        path.push("captures");
        Ok(path)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub log_settings: LogSettings,
    #[serde(default)]
    pub link: LinkSettings,
    #[serde(default)]
    pub capture: CaptureSettings,
    #[serde(default)]
    pub spike: SpikeSettings,
    #[serde(default)]
    pub export: ExportSettings,
    #[serde(default)]
    pub last_connected_device: Option<String>,
}

pub struct SettingsService {
    settings: Settings,
    settings_path: PathBuf,
}

impl SettingsService {
    pub fn new() -> anyhow::Result<Self> {
        let settings_path = Self::get_settings_path()?;
        Ok(Self::with_path(settings_path))
    }

    /// Load from an explicit path, falling back to defaults when the file is
    /// missing or unreadable.
    pub fn with_path(settings_path: PathBuf) -> Self {
        let settings = Self::load_from_file(&settings_path).unwrap_or_default();
        Self {
            settings,
            settings_path,
        }
    }

    fn get_settings_path() -> anyhow::Result<PathBuf> {
        let mut path = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not determine config directory"))?;
        path.push("ReleaseCapture");
        fs::create_dir_all(&path)?;
        path.push("settings.json");
        Ok(path)
    }

    fn load_from_file(path: &Path) -> anyhow::Result<Settings> {
        let contents = fs::read_to_string(path)?;
        let settings = serde_json::from_str(&contents)?;
        Ok(settings)
    }

    pub fn save(&self) -> anyhow::Result<()> {
        if let Some(parent) = self.settings_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(&self.settings)?;
        fs::write(&self.settings_path, json)?;
        Ok(())
    }

    pub fn get(&self) -> &Settings {
        &self.settings
    }

    pub fn get_mut(&mut self) -> &mut Settings {
        &mut self.settings
    }

    pub fn path(&self) -> &Path {
        &self.settings_path
    }

    pub fn remember_device(&mut self, device_id: &str) -> anyhow::Result<()> {
        if self.settings.last_connected_device.as_deref() != Some(device_id) {
            self.settings.last_connected_device = Some(device_id.to_string());
            self.save()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_json_falls_back_to_defaults() {
        let json =
            r#"{ "capture": { "extended_capture_ms": 5000 }, "spike": { "window_size": 4 } }"#;
        let settings: Settings = serde_json::from_str(json).unwrap();
        assert_eq!(settings.capture.extended_capture_ms, 5000);
        assert_eq!(settings.capture.buffer_window_ms, 3000);
        assert_eq!(settings.spike.window_size, 4);
        assert_eq!(settings.spike.spike_multiplier, 3.0);
        assert_eq!(settings.link.connect_attempts, 3);
        assert_eq!(settings.log_settings.level, "info");
    }

    #[test]
    fn settings_round_trip_through_file() {
        let path = std::env::temp_dir()
            .join(format!("release_capture_settings_{}", std::process::id()))
            .join("settings.json");
        let mut service = SettingsService::with_path(path.clone());
        service.get_mut().capture.light_edge = LightEdge::Falling;
        service.remember_device("AA:BB:CC:DD:EE:FF").unwrap();

        let reloaded = SettingsService::with_path(path.clone());
        assert_eq!(reloaded.get().capture.light_edge, LightEdge::Falling);
        assert_eq!(
            reloaded.get().last_connected_device.as_deref(),
            Some("AA:BB:CC:DD:EE:FF")
        );
        let _ = fs::remove_dir_all(path.parent().unwrap());
    }
}
