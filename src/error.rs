use std::path::PathBuf;
use std::process::ExitStatus;

use crate::config::TargetRange;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid target range {min}..={max}: min must be below max")]
    InvalidTargetRange { min: f64, max: f64 },
    #[error("invalid quality domain {low}..={high}: low must be below high")]
    InvalidQualityDomain { low: f64, high: f64 },
    #[error("starting quality {quality} is outside {low}..={high}")]
    QualityOutOfDomain { quality: f64, low: f64, high: f64 },
    #[error("sample count must be at least 1")]
    NoSamples,
    #[error("sample duration must be at least one second")]
    SampleTooShort,
    #[error("max iterations must be at least 1")]
    NoIterations,
    #[error("invalid increment table entry '{0}', expected THRESHOLD:STEP")]
    IncrementEntry(String),
    #[error("increment steps must be at least 1 (got {0})")]
    IncrementStep(f64),
    #[error("failed to read preset '{}'", .path.display())]
    PresetRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse preset '{}'", .path.display())]
    PresetParse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("preset '{}' contains no presets", .path.display())]
    EmptyPreset { path: PathBuf },
}

#[derive(Debug, thiserror::Error)]
pub enum ProbeError {
    #[error("failed to run {tool}")]
    Spawn {
        tool: &'static str,
        #[source]
        source: std::io::Error,
    },
    #[error("{tool} failed on '{}': {stderr}", .path.display())]
    Failed {
        tool: &'static str,
        path: PathBuf,
        stderr: String,
    },
    #[error("failed to parse {tool} output for '{}'", .path.display())]
    Parse {
        tool: &'static str,
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to stat '{}'", .path.display())]
    Metadata {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("'{}' has no video track", .path.display())]
    NoVideoTrack { path: PathBuf },
    #[error("could not determine the duration of '{}'", .path.display())]
    NoDuration { path: PathBuf },
}

#[derive(Debug, thiserror::Error)]
pub enum EncodeError {
    #[error("failed to run {tool}")]
    Spawn {
        tool: &'static str,
        #[source]
        source: std::io::Error,
    },
    #[error("{tool} exited with {status} while writing '{}': {stderr}", .output.display())]
    Failed {
        tool: &'static str,
        output: PathBuf,
        status: ExitStatus,
        stderr: String,
    },
}

/// A failure while measuring one sample; `index` is the zero-based sample point.
#[derive(Debug, thiserror::Error)]
pub enum SampleError {
    #[error("sample {index}: failed to create artifact")]
    Artifact {
        index: usize,
        #[source]
        source: async_tempfile::Error,
    },
    #[error("sample {index}: encode failed")]
    Encode {
        index: usize,
        #[source]
        source: EncodeError,
    },
    #[error("sample {index}: probe failed")]
    Probe {
        index: usize,
        #[source]
        source: ProbeError,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum SearchError {
    #[error("failed to probe source '{}'", .path.display())]
    Source {
        path: PathBuf,
        #[source]
        source: ProbeError,
    },
    #[error(
        "sampling '{}' at quality {quality} failed after {iterations} iterations (target {target}, last metric {})",
        .path.display(),
        fmt_metric(.last_metric)
    )]
    Sample {
        path: PathBuf,
        quality: f64,
        target: TargetRange,
        iterations: u32,
        last_metric: Option<f64>,
        #[source]
        source: SampleError,
    },
}

fn fmt_metric(metric: &Option<f64>) -> String {
    match metric {
        Some(m) => format!("{m:.2} MB/min"),
        None => "none".to_string(),
    }
}
