use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use strum::{Display, EnumString};
use tokio::process::Command;
use tracing::{debug, info};

use crate::config::Preset;
use crate::error::EncodeError;

/// Portion of the input to encode, used for sampling.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EncodeWindow {
    pub start_seconds: f64,
    pub duration: Duration,
}

#[derive(Debug, Clone, Copy)]
pub struct EncodeRequest<'a> {
    pub input: &'a Path,
    pub output: &'a Path,
    pub quality: f64,
    /// `None` encodes the whole input.
    pub window: Option<EncodeWindow>,
    pub preset: &'a Preset,
}

#[allow(async_fn_in_trait)]
pub trait Encoder {
    fn name(&self) -> &'static str;

    /// Writes a playable file at `request.output`.
    async fn invoke(&self, request: &EncodeRequest<'_>) -> Result<(), EncodeError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Display, EnumString)]
#[strum(serialize_all = "lowercase")]
pub enum EncoderKind {
    #[default]
    Handbrake,
    Ffmpeg,
}

/// Drives `HandBrakeCLI` with an imported preset.
#[derive(Debug, Clone)]
pub struct HandbrakeEncoder {
    program: PathBuf,
}

impl HandbrakeEncoder {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }

    fn command(&self, request: &EncodeRequest<'_>) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.arg("-i").arg(request.input);
        cmd.arg("-o").arg(request.output);
        cmd.arg("--preset-import-file").arg(&request.preset.path);
        cmd.arg("--preset").arg(&request.preset.name);
        cmd.arg("-q").arg(request.quality.to_string());

        if let Some(window) = request.window {
            cmd.arg("--start-at")
                .arg(format!("seconds:{}", window.start_seconds.round()));
            cmd.arg("--stop-at")
                .arg(format!("seconds:{}", window.duration.as_secs_f64().round()));
        }
        cmd
    }
}

impl Encoder for HandbrakeEncoder {
    fn name(&self) -> &'static str {
        "HandBrakeCLI"
    }

    #[tracing::instrument(skip_all, fields(output = %request.output.display(), quality = request.quality))]
    async fn invoke(&self, request: &EncodeRequest<'_>) -> Result<(), EncodeError> {
        run(self.name(), self.command(request), request.output).await
    }
}

/// HEVC through VAAPI with constant QP.
#[derive(Debug, Clone)]
pub struct FfmpegEncoder {
    program: PathBuf,
    device: PathBuf,
}

impl FfmpegEncoder {
    pub fn new(program: impl Into<PathBuf>, device: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            device: device.into(),
        }
    }

    fn command(&self, request: &EncodeRequest<'_>) -> Command {
        let mut cmd = Command::new(&self.program);

        #[rustfmt::skip]
        cmd.args([
            "-y",
            "-hide_banner",
            "-hwaccel", "vaapi",
        ]);
        cmd.arg("-hwaccel_device").arg(&self.device);
        cmd.args(["-hwaccel_output_format", "vaapi"]);

        if let Some(window) = request.window {
            cmd.arg("-ss").arg(format!("{:.3}", window.start_seconds));
            cmd.arg("-t").arg(format!("{:.3}", window.duration.as_secs_f64()));
        }
        cmd.arg("-i").arg(request.input);

        #[rustfmt::skip]
        cmd.args([
            "-c:a", "copy",
            "-vf", "scale_vaapi=format=p010",
            "-c:v", "hevc_vaapi",
            "-rc_mode", "CQP",
        ]);
        cmd.arg("-qp").arg(format!("{}", request.quality.round()));
        if request.preset.extension == "mkv" {
            cmd.args(["-c:s", "copy"]);
        }

        cmd.arg(request.output);
        cmd
    }
}

impl Encoder for FfmpegEncoder {
    fn name(&self) -> &'static str {
        "ffmpeg"
    }

    #[tracing::instrument(skip_all, fields(output = %request.output.display(), quality = request.quality))]
    async fn invoke(&self, request: &EncodeRequest<'_>) -> Result<(), EncodeError> {
        run(self.name(), self.command(request), request.output).await
    }
}

async fn run(tool: &'static str, mut cmd: Command, output: &Path) -> Result<(), EncodeError> {
    debug!(?cmd, "spawning encoder");
    let started = Instant::now();

    let result = cmd
        .output()
        .await
        .map_err(|source| EncodeError::Spawn { tool, source })?;
    if !result.status.success() {
        tokio::fs::remove_file(output).await.ok();
        return Err(EncodeError::Failed {
            tool,
            output: output.to_path_buf(),
            status: result.status,
            stderr: String::from_utf8_lossy(&result.stderr).trim().to_string(),
        });
    }

    let elapsed = Duration::from_secs(started.elapsed().as_secs());
    info!("Encoded in {}", humantime::format_duration(elapsed));
    Ok(())
}
