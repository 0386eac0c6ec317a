use std::path::{Path, PathBuf};

use serde::Deserialize;
use tokio::process::Command;
use tracing::debug;

use crate::error::ProbeError;

const BYTES_PER_MB: f64 = 1024.0 * 1024.0;

/// Size and playable duration of a media file.
#[derive(Debug, Clone, PartialEq)]
pub struct MediaInfo {
    pub path: PathBuf,
    pub size_bytes: u64,
    pub duration_minutes: f64,
}

impl MediaInfo {
    pub fn size_mb(&self) -> f64 {
        self.size_bytes as f64 / BYTES_PER_MB
    }

    /// Size-efficiency in MB per minute of playback.
    pub fn mb_per_min(&self) -> f64 {
        self.size_mb() / self.duration_minutes
    }
}

#[allow(async_fn_in_trait)]
pub trait Prober {
    async fn inspect(&self, path: &Path) -> Result<MediaInfo, ProbeError>;
}

/// Probes with `ffprobe`, falling back to `mediainfo` when no duration can be
/// read from the ffprobe report.
#[derive(Debug, Clone)]
pub struct FfprobeProber {
    ffprobe: PathBuf,
    mediainfo: PathBuf,
}

impl FfprobeProber {
    pub fn new(ffprobe: impl Into<PathBuf>, mediainfo: impl Into<PathBuf>) -> Self {
        Self {
            ffprobe: ffprobe.into(),
            mediainfo: mediainfo.into(),
        }
    }

    async fn ffprobe_report(&self, path: &Path) -> Result<FfprobeOutput, ProbeError> {
        let mut cmd = Command::new(&self.ffprobe);
        #[rustfmt::skip]
        cmd.args([
            "-v", "quiet",
            "-print_format", "json",
            "-show_format",
            "-show_streams",
        ]);
        cmd.arg(path);

        let output = cmd.output().await.map_err(|source| ProbeError::Spawn {
            tool: "ffprobe",
            source,
        })?;
        if !output.status.success() {
            return Err(ProbeError::Failed {
                tool: "ffprobe",
                path: path.to_path_buf(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        serde_json::from_slice(&output.stdout).map_err(|source| ProbeError::Parse {
            tool: "ffprobe",
            path: path.to_path_buf(),
            source,
        })
    }

    /// Last-resort duration lookup, in minutes.
    async fn mediainfo_duration(&self, path: &Path) -> Result<Option<f64>, ProbeError> {
        let mut cmd = Command::new(&self.mediainfo);
        cmd.arg("--Output=JSON");
        cmd.arg(path);

        let output = cmd.output().await.map_err(|source| ProbeError::Spawn {
            tool: "mediainfo",
            source,
        })?;
        if !output.status.success() {
            return Err(ProbeError::Failed {
                tool: "mediainfo",
                path: path.to_path_buf(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        let report: MediaInfoReport =
            serde_json::from_slice(&output.stdout).map_err(|source| ProbeError::Parse {
                tool: "mediainfo",
                path: path.to_path_buf(),
                source,
            })?;
        Ok(report.duration_minutes())
    }
}

impl Prober for FfprobeProber {
    #[tracing::instrument(level = "debug", skip_all, fields(path = %path.display()))]
    async fn inspect(&self, path: &Path) -> Result<MediaInfo, ProbeError> {
        let size_bytes = tokio::fs::metadata(path)
            .await
            .map_err(|source| ProbeError::Metadata {
                path: path.to_path_buf(),
                source,
            })?
            .len();

        let report = self.ffprobe_report(path).await?;
        let duration_minutes = match report.duration_minutes(path)? {
            Some(minutes) => minutes,
            None => {
                debug!("ffprobe reported no duration, asking mediainfo");
                self.mediainfo_duration(path)
                    .await?
                    .ok_or_else(|| ProbeError::NoDuration {
                        path: path.to_path_buf(),
                    })?
            }
        };

        Ok(MediaInfo {
            path: path.to_path_buf(),
            size_bytes,
            duration_minutes,
        })
    }
}

#[derive(Debug, Deserialize)]
struct FfprobeOutput {
    #[serde(default)]
    format: FfprobeFormat,
    #[serde(default)]
    streams: Vec<FfprobeStream>,
}

#[derive(Debug, Default, Deserialize)]
struct FfprobeFormat {
    duration: Option<String>,
}

#[derive(Debug, Deserialize)]
struct FfprobeStream {
    codec_type: Option<String>,
    duration: Option<String>,
    #[serde(default)]
    tags: FfprobeTags,
}

#[derive(Debug, Default, Deserialize)]
struct FfprobeTags {
    #[serde(rename = "DURATION", alias = "duration")]
    duration: Option<String>,
}

impl FfprobeOutput {
    /// Video stream duration, then container duration, then the stream's
    /// `DURATION` tag (Matroska writes it as `HH:MM:SS.fffffffff`).
    fn duration_minutes(&self, path: &Path) -> Result<Option<f64>, ProbeError> {
        let video = self
            .streams
            .iter()
            .find(|s| s.codec_type.as_deref() == Some("video"))
            .ok_or_else(|| ProbeError::NoVideoTrack {
                path: path.to_path_buf(),
            })?;

        let seconds = video
            .duration
            .as_deref()
            .and_then(parse_seconds)
            .or_else(|| self.format.duration.as_deref().and_then(parse_seconds));
        if let Some(seconds) = seconds {
            return Ok(Some(seconds / 60.0));
        }

        Ok(video.tags.duration.as_deref().and_then(parse_timestamp_minutes))
    }
}

#[derive(Debug, Deserialize)]
struct MediaInfoReport {
    media: Option<MediaInfoMedia>,
}

#[derive(Debug, Deserialize)]
struct MediaInfoMedia {
    #[serde(default)]
    track: Vec<MediaInfoTrack>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct MediaInfoTrack {
    #[serde(rename = "@type")]
    track_type: String,
    duration: Option<String>,
}

impl MediaInfoReport {
    fn duration_minutes(&self) -> Option<f64> {
        let tracks = &self.media.as_ref()?.track;
        ["Video", "General"].iter().find_map(|kind| {
            tracks
                .iter()
                .filter(|t| t.track_type == *kind)
                .find_map(|t| t.duration.as_deref().and_then(parse_seconds))
                .map(|seconds| seconds / 60.0)
        })
    }
}

fn parse_seconds(raw: &str) -> Option<f64> {
    raw.trim().parse::<f64>().ok().filter(|s| s.is_finite() && *s > 0.0)
}

/// Parses `HH:MM:SS(.fraction)` into minutes.
fn parse_timestamp_minutes(raw: &str) -> Option<f64> {
    let mut parts = raw.trim().splitn(3, ':');
    let hours: f64 = parts.next()?.parse().ok()?;
    let minutes: f64 = parts.next()?.parse().ok()?;
    let seconds: f64 = parts.next()?.parse().ok()?;
    Some(hours * 60.0 + minutes + seconds / 60.0).filter(|m| *m > 0.0)
}
