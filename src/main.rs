use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use bytesize::ByteSize;
use clap::{Parser, Subcommand};
use indicatif::ProgressStyle;
use tracing::{debug, error, info, info_span, warn, Span};
use tracing_indicatif::{span_ext::IndicatifSpanExt, IndicatifLayer};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

mod config;
mod discovery;
mod encoder;
mod engine;
mod error;
mod media;
mod sampler;
mod strategy;
#[cfg(test)]
mod testing;

use config::{
    IncrementTable, Polarity, Preset, QualityDomain, SamplingConfig, SearchConfig, StrategyKind,
    TargetRange,
};
use encoder::{EncodeRequest, Encoder, EncoderKind, FfmpegEncoder, HandbrakeEncoder};
use engine::{ConvergenceEngine, SearchOutcome};
use error::ConfigError;
use media::{FfprobeProber, Prober};

#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

#[derive(Parser)]
#[command(version, about = "Encode videos at a quality that lands in a target MB/min band")]
struct Args {
    #[command(subcommand)]
    command: Cmd,
}

#[derive(Subcommand)]
enum Cmd {
    /// Find a quality for each file and encode it
    Process(ProcessArgs),
    /// Print the MB/min of each file
    Info(InfoArgs),
}

#[derive(clap::Args)]
struct Tools {
    #[arg(long, env = "HANDBRAKE_PATH", default_value = "HandBrakeCLI")]
    handbrake: PathBuf,
    #[arg(long, env = "FFMPEG_PATH", default_value = "ffmpeg")]
    ffmpeg: PathBuf,
    #[arg(long, env = "FFPROBE_PATH", default_value = "ffprobe")]
    ffprobe: PathBuf,
    #[arg(long, env = "MEDIAINFO_PATH", default_value = "mediainfo")]
    mediainfo: PathBuf,
    /// Render node used by the ffmpeg encoder
    #[arg(long, default_value = "/dev/dri/renderD128")]
    vaapi_device: PathBuf,
}

impl Tools {
    fn prober(&self) -> FfprobeProber {
        FfprobeProber::new(&self.ffprobe, &self.mediainfo)
    }
}

#[derive(clap::Args)]
struct SearchArgs {
    /// Lower bound of the target band, in MB/min
    #[arg(long, default_value_t = 12.0)]
    min: f64,
    /// Upper bound of the target band, in MB/min
    #[arg(long, default_value_t = 14.5)]
    max: f64,
    /// HandBrake preset export supplying the encoder settings
    #[arg(long, env = "PRESET_FILE", default_value = "preset.json")]
    preset: PathBuf,
    #[arg(long, default_value_t = EncoderKind::Handbrake)]
    encoder: EncoderKind,
    #[arg(long, default_value_t = StrategyKind::Increment)]
    strategy: StrategyKind,
    /// The encoder's quality slider grows the output when raised
    #[arg(long)]
    inverted: bool,
    /// Starting quality; defaults to the preset's
    #[arg(short, long)]
    quality: Option<f64>,
    #[arg(long, default_value_t = 20.0)]
    quality_low: f64,
    #[arg(long, default_value_t = 70.0)]
    quality_high: f64,
    #[arg(long, default_value_t = 6)]
    max_iterations: u32,
    /// Samples encoded per candidate quality
    #[arg(long, default_value_t = 7)]
    samples: usize,
    #[arg(long, value_parser = humantime::parse_duration, default_value = "30s")]
    sample_duration: Duration,
    /// Added to the sampled MB/min to predict the full encode
    #[arg(long, default_value_t = 0.5, allow_negative_numbers = true)]
    bias: f64,
    /// THRESHOLD:STEP pairs for the increment strategy
    #[arg(long, default_value = "10:10,5:7,3:5,1:3")]
    increments: IncrementTable,
    #[arg(long, default_value_t = 1.0)]
    default_step: f64,
    /// Width of the band used when the source is already below the target
    #[arg(long, default_value_t = 2.0)]
    narrowing: f64,
    /// Directory for sample encodes; defaults to the source's directory
    #[arg(long)]
    scratch_dir: Option<PathBuf>,
}

impl SearchArgs {
    fn to_config(&self, preset: &Preset) -> Result<SearchConfig, ConfigError> {
        let config = SearchConfig {
            target: TargetRange::new(self.min, self.max)?,
            domain: QualityDomain::new(self.quality_low, self.quality_high)?,
            start_quality: self.quality.unwrap_or(preset.quality),
            strategy: self.strategy,
            polarity: Polarity::from_inverted(self.inverted),
            max_iterations: self.max_iterations,
            increments: self.increments.clone().with_default_step(self.default_step)?,
            narrowing_width: self.narrowing,
            sampling: SamplingConfig {
                count: self.samples,
                duration: self.sample_duration,
                bias: self.bias,
                scratch_dir: self.scratch_dir.as_deref().map(expand),
            },
        };
        config.validate()?;
        Ok(config)
    }
}

#[derive(clap::Args)]
struct ProcessArgs {
    #[arg(required = true)]
    paths: Vec<PathBuf>,
    #[arg(short, long, env = "OUTPUT_DIR", required_unless_present = "write_to")]
    output: Option<PathBuf>,
    /// Write a single input straight to this file
    #[arg(short, long)]
    write_to: Option<PathBuf>,
    #[arg(short = 'O', long)]
    overwrite: bool,
    /// Start each search from the quality found for the previous file
    #[arg(long)]
    carry_quality: bool,
    /// Search for a quality but skip the full encode
    #[arg(long)]
    dry_run: bool,
    #[command(flatten)]
    search: SearchArgs,
    #[command(flatten)]
    tools: Tools,
}

#[derive(clap::Args)]
struct InfoArgs {
    #[arg(required = true)]
    paths: Vec<PathBuf>,
    /// Files above this MB/min are reported as errors
    #[arg(long, default_value_t = 14.5)]
    max: f64,
    #[command(flatten)]
    tools: Tools,
}

fn expand(path: &Path) -> PathBuf {
    shellexpand::path::tilde(path).into_owned()
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> Result<()> {
    human_panic::setup_panic!();

    let indicatif_layer = IndicatifLayer::new();
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().with_writer(indicatif_layer.get_stderr_writer()))
        .with(indicatif_layer)
        .init();

    match Args::parse().command {
        Cmd::Process(args) => process(args).await,
        Cmd::Info(args) => info(args).await,
    }
}

async fn process(args: ProcessArgs) -> Result<()> {
    let preset = Preset::load(expand(&args.search.preset))?;
    let config = args.search.to_config(&preset)?;
    info!(
        preset = %preset.name,
        encoder = %args.search.encoder,
        "Targeting {} starting at quality {}",
        config.target,
        config.start_quality
    );

    let prober = args.tools.prober();
    match args.search.encoder {
        EncoderKind::Handbrake => {
            let encoder = HandbrakeEncoder::new(&args.tools.handbrake);
            process_files(ConvergenceEngine::new(encoder, prober, preset, config), &args).await
        }
        EncoderKind::Ffmpeg => {
            let encoder = FfmpegEncoder::new(&args.tools.ffmpeg, &args.tools.vaapi_device);
            process_files(ConvergenceEngine::new(encoder, prober, preset, config), &args).await
        }
    }
}

async fn process_files<E: Encoder, P: Prober>(
    mut engine: ConvergenceEngine<E, P>,
    args: &ProcessArgs,
) -> Result<()> {
    info!("Discovering files to transcode...");
    let roots = args.paths.iter().map(|p| expand(p)).collect();
    let (stale, files): (Vec<_>, Vec<_>) = discovery::find_videos(roots)
        .await?
        .into_iter()
        .partition(|p| discovery::is_stale_artifact(p));

    for artifact in stale {
        match tokio::fs::remove_file(&artifact).await {
            Ok(()) => info!("Deleted stale sample '{}'", artifact.display()),
            Err(e) => warn!("Failed to delete stale sample '{}': {e}", artifact.display()),
        }
    }

    if args.write_to.is_some() && files.len() != 1 {
        anyhow::bail!(
            "--write-to needs exactly one input file, found {}",
            files.len()
        );
    }
    let output_dir = args.output.as_deref().map(expand);

    let media_count = files.len();
    info!("Found {media_count} files to transcode");

    let header_span = info_span!("header");
    header_span.pb_set_style(&ProgressStyle::default_bar());
    header_span.pb_set_length(media_count as u64);
    let header_span_enter = header_span.enter();

    for source in files {
        let output = match (&args.write_to, &output_dir) {
            (Some(write_to), _) => expand(write_to),
            (None, Some(dir)) => discovery::output_path(dir, &source, &engine.preset().extension),
            (None, None) => anyhow::bail!("no output directory given"),
        };

        if output.exists() && !args.overwrite {
            debug!("Skipping '{}', output exists", source.display());
            Span::current().pb_inc(1);
            continue;
        }

        info!(input = %source.display(), output = %output.display(), "Transcoding");
        match transcode(&engine, &source, &output, args.dry_run).await {
            Ok(outcome) if args.carry_quality && outcome.converged() => {
                engine.carry_forward(outcome.quality);
                debug!(quality = engine.config().start_quality, "Carrying quality forward");
            }
            Ok(_) => {}
            Err(e) => error!(path = %source.display(), "Failed to transcode: {e:?}"),
        }

        Span::current().pb_inc(1);
    }

    std::mem::drop(header_span_enter);
    std::mem::drop(header_span);
    Ok(())
}

async fn transcode<E: Encoder, P: Prober>(
    engine: &ConvergenceEngine<E, P>,
    source: &Path,
    output: &Path,
    dry_run: bool,
) -> Result<SearchOutcome> {
    let outcome = engine.run(source).await?;
    debug!(
        natural = outcome.natural_ratio,
        probes = outcome.probes,
        "Search finished: {}",
        outcome.status
    );
    if dry_run {
        info!("Dry run, skipping encode at quality {}", outcome.quality);
        return Ok(outcome);
    }

    if let Some(parent) = output.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("create output directory '{}'", parent.display()))?;
    }

    let partial = discovery::partial_path(output);
    let request = EncodeRequest {
        input: source,
        output: &partial,
        quality: outcome.quality,
        window: None,
        preset: engine.preset(),
    };
    engine.encoder().invoke(&request).await.context("run full encode")?;
    tokio::fs::rename(&partial, output)
        .await
        .context("move encode into place")?;

    let encoded = engine
        .prober()
        .inspect(output)
        .await
        .context("probe encoded file")?;
    info!(
        "{} -> {:.2} MB/min ({})",
        output.display(),
        encoded.mb_per_min(),
        ByteSize::b(encoded.size_bytes)
    );
    Ok(outcome)
}

async fn info(args: InfoArgs) -> Result<()> {
    let prober = args.tools.prober();
    let roots = args.paths.iter().map(|p| expand(p)).collect();
    let files = discovery::find_videos(roots).await?;

    let mut previous_dir: Option<PathBuf> = None;
    for file in files {
        let dir = file.parent().map(Path::to_path_buf);
        if dir != previous_dir {
            if let Some(dir) = &dir {
                info!("{}", dir.display());
            }
            previous_dir = dir;
        }

        let name = file.file_name().unwrap_or_default().to_string_lossy();
        match prober.inspect(&file).await {
            Ok(media) if media.mb_per_min() > args.max => {
                error!("{:.2} MB/min -> {name}", media.mb_per_min())
            }
            Ok(media) => info!("{:.2} MB/min -> {name}", media.mb_per_min()),
            Err(e) => error!(path = %file.display(), "Failed to probe: {e}"),
        }
    }
    Ok(())
}
