//! Capture export.
//!
//! The JSON document has exactly four top-level fields: `sensorSamples`,
//! `derivativeRecords`, `triggerTimestamps` and `counts`. Downstream tools
//! read these names, so they are fixed.

use crate::domain::models::{
    CaptureBundle, CaptureHandle, CompositeDataPoint, DerivativeRecord, Timestamp,
};
use crate::domain::settings::ExportSettings;
use crate::error::ExportError;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use tracing::info;

/// Receives finished captures. Storage location and format are its call.
pub trait CaptureSink: Send + Sync + 'static {
    fn deliver(&self, bundle: &CaptureBundle) -> Result<CaptureHandle, ExportError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CaptureCounts {
    pub sensor_samples: usize,
    pub derivative_records: usize,
    pub trigger_timestamps: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CaptureDocument {
    pub sensor_samples: Vec<CompositeDataPoint>,
    pub derivative_records: Vec<DerivativeRecord>,
    pub trigger_timestamps: Vec<Timestamp>,
    pub counts: CaptureCounts,
}

impl From<&CaptureBundle> for CaptureDocument {
    fn from(bundle: &CaptureBundle) -> Self {
        Self {
            sensor_samples: bundle.points.clone(),
            derivative_records: bundle.derivatives.clone(),
            trigger_timestamps: bundle.trigger_timestamps.clone(),
            counts: CaptureCounts {
                sensor_samples: bundle.points.len(),
                derivative_records: bundle.derivatives.len(),
                trigger_timestamps: bundle.trigger_timestamps.len(),
            },
        }
    }
}

/// Writes `capture_<startMillis>.json` into a directory.
#[derive(Debug, Clone)]
pub struct JsonFileExporter {
    output_dir: PathBuf,
    pretty: bool,
}

impl JsonFileExporter {
    pub fn new(output_dir: impl Into<PathBuf>, pretty: bool) -> Self {
        Self {
            output_dir: output_dir.into(),
            pretty,
        }
    }

    pub fn from_settings(settings: &ExportSettings) -> anyhow::Result<Self> {
        Ok(Self::new(settings.resolve_output_dir()?, settings.pretty))
    }

    pub fn file_name(started_at: Timestamp) -> String {
        format!("capture_{started_at}.json")
    }
}

impl CaptureSink for JsonFileExporter {
    fn deliver(&self, bundle: &CaptureBundle) -> Result<CaptureHandle, ExportError> {
        fs::create_dir_all(&self.output_dir)?;
        let document = CaptureDocument::from(bundle);
        let json = if self.pretty {
            serde_json::to_vec_pretty(&document)?
        } else {
            serde_json::to_vec(&document)?
        };

        // Write then rename, so readers never see a half-written capture.
        let path = self.output_dir.join(Self::file_name(bundle.started_at));
        let partial = path.with_extension("json.partial");
        fs::write(&partial, json)?;
        fs::rename(&partial, &path)?;

        info!(
            "Capture written to {} ({} points, {} derivatives)",
            path.display(),
            document.counts.sensor_samples,
            document.counts.derivative_records
        );
        Ok(CaptureHandle {
            path,
            started_at: bundle.started_at,
            point_count: bundle.points.len(),
        })
    }
}
