//! Deterministic encoder and prober doubles.
//!
//! The stub encoder writes the requested quality into the artifact and the stub
//! prober turns it back into a size through a metric function, so a sample's
//! MB/min is exactly `metric(quality)`.

use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};
use std::process::ExitStatus;
use std::sync::{Arc, Mutex};

use crate::config::Preset;
use crate::encoder::{EncodeRequest, Encoder};
use crate::error::{EncodeError, ProbeError};
use crate::media::{MediaInfo, Prober};
use crate::sampler::ARTIFACT_SUFFIX;

const MB: f64 = 1024.0 * 1024.0;
const SAMPLE_MINUTES: f64 = 0.5;

pub type Metric = Arc<dyn Fn(f64) -> f64 + Send + Sync>;

pub fn linear(intercept: f64, slope: f64) -> Metric {
    Arc::new(move |q| intercept + slope * q)
}

pub fn constant(value: f64) -> Metric {
    Arc::new(move |_| value)
}

pub fn preset() -> Preset {
    Preset {
        path: PathBuf::from("preset.json"),
        name: "Test".to_string(),
        quality: 22.0,
        extension: "mp4",
    }
}

pub fn source(dir: &Path, duration_minutes: f64, natural: f64) -> MediaInfo {
    MediaInfo {
        path: dir.join("source.mkv"),
        size_bytes: (natural * duration_minutes * MB).round() as u64,
        duration_minutes,
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Recorded {
    pub quality: f64,
    pub start_seconds: Option<f64>,
    pub output: PathBuf,
}

#[derive(Debug, Clone, Default)]
pub struct StubEncoder {
    requests: Arc<Mutex<Vec<Recorded>>>,
    fail_at: Option<usize>,
}

impl StubEncoder {
    /// Fails the `call`th invocation (zero-based), after writing a partial file.
    pub fn failing_at(call: usize) -> Self {
        Self {
            fail_at: Some(call),
            ..Self::default()
        }
    }

    pub fn requests(&self) -> Vec<Recorded> {
        self.requests.lock().unwrap().clone()
    }
}

impl Encoder for StubEncoder {
    fn name(&self) -> &'static str {
        "stub"
    }

    async fn invoke(&self, request: &EncodeRequest<'_>) -> Result<(), EncodeError> {
        let call = {
            let mut requests = self.requests.lock().unwrap();
            requests.push(Recorded {
                quality: request.quality,
                start_seconds: request.window.map(|w| w.start_seconds),
                output: request.output.to_path_buf(),
            });
            requests.len() - 1
        };

        std::fs::write(request.output, request.quality.to_string()).unwrap();
        if self.fail_at == Some(call) {
            return Err(EncodeError::Failed {
                tool: "stub",
                output: request.output.to_path_buf(),
                status: ExitStatus::from_raw(256),
                stderr: "boom".to_string(),
            });
        }
        Ok(())
    }
}

#[derive(Clone)]
pub struct StubProber {
    metric: Metric,
    natural: f64,
    duration_minutes: f64,
    fail_samples: bool,
    fail_source: bool,
}

impl StubProber {
    pub fn new(metric: Metric, natural: f64) -> Self {
        Self {
            metric,
            natural,
            duration_minutes: 45.0,
            fail_samples: false,
            fail_source: false,
        }
    }

    pub fn failing_samples(self) -> Self {
        Self {
            fail_samples: true,
            ..self
        }
    }

    pub fn failing_source(self) -> Self {
        Self {
            fail_source: true,
            ..self
        }
    }
}

impl Prober for StubProber {
    async fn inspect(&self, path: &Path) -> Result<MediaInfo, ProbeError> {
        let is_sample = path
            .file_name()
            .is_some_and(|n| n.to_string_lossy().contains(ARTIFACT_SUFFIX));

        if !is_sample {
            if self.fail_source {
                return Err(ProbeError::NoVideoTrack {
                    path: path.to_path_buf(),
                });
            }
            return Ok(MediaInfo {
                path: path.to_path_buf(),
                size_bytes: (self.natural * self.duration_minutes * MB).round() as u64,
                duration_minutes: self.duration_minutes,
            });
        }

        if self.fail_samples {
            return Err(ProbeError::NoDuration {
                path: path.to_path_buf(),
            });
        }
        let quality: f64 = std::fs::read_to_string(path).unwrap().parse().unwrap();
        let ratio = (self.metric)(quality);
        Ok(MediaInfo {
            path: path.to_path_buf(),
            size_bytes: (ratio * SAMPLE_MINUTES * MB).round() as u64,
            duration_minutes: SAMPLE_MINUTES,
        })
    }
}
