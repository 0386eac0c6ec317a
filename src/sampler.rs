use std::path::{Path, PathBuf};

use async_tempfile::TempFile;
use educe::Educe;
use tracing::{debug, info};

use crate::config::{Preset, SamplingConfig};
use crate::encoder::{EncodeRequest, EncodeWindow, Encoder};
use crate::error::SampleError;
use crate::media::{MediaInfo, Prober};

/// Suffix shared by every sample artifact, `<uuid>-tmp.<ext>`.
pub const ARTIFACT_SUFFIX: &str = "-tmp";

/// Interior start points, in seconds, for `count` samples over the source.
///
/// The source is split into `count + 1` equal parts and a sample starts at each
/// inner boundary, so neither the first nor the last instant is used.
pub fn sample_offsets(duration_minutes: f64, count: usize) -> Vec<f64> {
    let step = duration_minutes / (count + 1) as f64;
    (0..count).map(|i| step * (i + 1) as f64 * 60.0).collect()
}

/// Estimates a source's MB/min at a given quality from short encodes.
#[derive(Educe)]
#[educe(Debug)]
pub struct Sampler<E, P> {
    #[educe(Debug(ignore))]
    encoder: E,
    #[educe(Debug(ignore))]
    prober: P,
    preset: Preset,
    config: SamplingConfig,
}

impl<E: Encoder, P: Prober> Sampler<E, P> {
    pub fn new(encoder: E, prober: P, preset: Preset, config: SamplingConfig) -> Self {
        Self {
            encoder,
            prober,
            preset,
            config,
        }
    }

    pub fn encoder(&self) -> &E {
        &self.encoder
    }

    pub fn prober(&self) -> &P {
        &self.prober
    }

    pub fn preset(&self) -> &Preset {
        &self.preset
    }

    fn scratch_dir(&self, source: &Path) -> PathBuf {
        self.config
            .scratch_dir
            .clone()
            .or_else(|| source.parent().map(Path::to_path_buf))
            .unwrap_or_else(std::env::temp_dir)
    }

    /// Mean MB/min over all samples at `quality`, plus the configured bias.
    ///
    /// Every artifact is removed before this returns, whether or not it
    /// succeeded.
    #[tracing::instrument(skip_all, fields(quality = quality))]
    pub async fn measure(&self, source: &MediaInfo, quality: f64) -> Result<f64, SampleError> {
        let offsets = sample_offsets(source.duration_minutes, self.config.count);
        let dir = self.scratch_dir(&source.path);
        let mut total = 0.0;

        for (index, start_seconds) in offsets.iter().copied().enumerate() {
            let name = format!(
                "{}{ARTIFACT_SUFFIX}.{}",
                uuid::Uuid::new_v4(),
                self.preset.extension
            );
            let artifact = TempFile::new_with_name_in(name, dir.clone())
                .await
                .map_err(|source| SampleError::Artifact { index, source })?;

            debug!(
                index,
                start_seconds,
                artifact = %artifact.file_path().display(),
                "encoding sample"
            );
            let request = EncodeRequest {
                input: &source.path,
                output: artifact.file_path(),
                quality,
                window: Some(EncodeWindow {
                    start_seconds,
                    duration: self.config.duration,
                }),
                preset: &self.preset,
            };
            self.encoder
                .invoke(&request)
                .await
                .map_err(|source| SampleError::Encode { index, source })?;

            let sample = self
                .prober
                .inspect(artifact.file_path())
                .await
                .map_err(|source| SampleError::Probe { index, source })?;
            let ratio = sample.mb_per_min();
            debug!(index, ratio, "sample measured");
            total += ratio;

            drop(artifact);
        }

        let metric = total / offsets.len() as f64 + self.config.bias;
        info!("Quality {quality} averages {metric:.2} MB/min");
        Ok(metric)
    }
}
