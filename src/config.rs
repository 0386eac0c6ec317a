use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::Deserialize;
use strum::{Display, EnumString};

use crate::error::ConfigError;

/// Inclusive MB/min band the search drives the sampled metric into.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TargetRange {
    min: f64,
    max: f64,
}

impl TargetRange {
    pub fn new(min: f64, max: f64) -> Result<Self, ConfigError> {
        if !(min.is_finite() && max.is_finite()) || min >= max {
            return Err(ConfigError::InvalidTargetRange { min, max });
        }
        Ok(Self { min, max })
    }

    pub fn min(&self) -> f64 {
        self.min
    }

    pub fn max(&self) -> f64 {
        self.max
    }

    pub fn contains(&self, metric: f64) -> bool {
        self.min <= metric && metric <= self.max
    }

    /// Band that ends at `natural` and is `width` wide, floored at zero.
    ///
    /// Used when the source already sits at or below the requested band, so
    /// the requested band could only be reached by inflating the file.
    pub fn narrowed_to(&self, natural: f64, width: f64) -> Option<Self> {
        if natural > self.max {
            return None;
        }
        Self::new((natural - width).max(0.0), natural).ok()
    }
}

impl fmt::Display for TargetRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.2}-{:.2} MB/min", self.min, self.max)
    }
}

/// Inclusive bounds every candidate quality is clamped into.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct QualityDomain {
    low: f64,
    high: f64,
}

impl QualityDomain {
    pub fn new(low: f64, high: f64) -> Result<Self, ConfigError> {
        if !(low.is_finite() && high.is_finite()) || low >= high {
            return Err(ConfigError::InvalidQualityDomain { low, high });
        }
        Ok(Self { low, high })
    }

    pub fn low(&self) -> f64 {
        self.low
    }

    pub fn high(&self) -> f64 {
        self.high
    }

    pub fn clamp(&self, quality: f64) -> f64 {
        quality.clamp(self.low, self.high)
    }

    pub fn contains(&self, quality: f64) -> bool {
        self.low <= quality && quality <= self.high
    }
}

/// Which way a quality change moves on the encoder's slider.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Up,
    Down,
}

impl Direction {
    pub fn flip(self) -> Self {
        match self {
            Self::Up => Self::Down,
            Self::Down => Self::Up,
        }
    }
}

/// Encoder/platform dependent relationship between the quality slider and
/// output size.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Polarity {
    #[default]
    Normal,
    Inverted,
}

impl Polarity {
    pub fn from_inverted(inverted: bool) -> Self {
        if inverted {
            Self::Inverted
        } else {
            Self::Normal
        }
    }

    /// Maps a strategy's normal-polarity direction onto this polarity.
    pub fn orient(self, direction: Direction) -> Direction {
        match self {
            Self::Normal => direction,
            Self::Inverted => direction.flip(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Display, EnumString)]
#[strum(serialize_all = "lowercase")]
pub enum StrategyKind {
    #[default]
    Increment,
    #[strum(to_string = "bisect", serialize = "bisection")]
    Bisect,
}

/// Ordered `(threshold, step)` pairs mapping a distance from the target band
/// to a quality step.
#[derive(Debug, Clone, PartialEq)]
pub struct IncrementTable {
    entries: Vec<(f64, f64)>,
    default_step: f64,
}

impl IncrementTable {
    pub fn new(mut entries: Vec<(f64, f64)>, default_step: f64) -> Result<Self, ConfigError> {
        if let Some(&(_, step)) = entries.iter().find(|(_, step)| !(*step >= 1.0)) {
            return Err(ConfigError::IncrementStep(step));
        }
        if !(default_step >= 1.0) {
            return Err(ConfigError::IncrementStep(default_step));
        }
        entries.sort_by(|a, b| b.0.total_cmp(&a.0));
        Ok(Self {
            entries,
            default_step,
        })
    }

    pub fn with_default_step(self, default_step: f64) -> Result<Self, ConfigError> {
        Self::new(self.entries, default_step)
    }

    pub fn step_for(&self, distance: f64) -> f64 {
        self.entries
            .iter()
            .find(|(threshold, _)| distance > *threshold)
            .map(|&(_, step)| step)
            .unwrap_or(self.default_step)
    }
}

impl Default for IncrementTable {
    fn default() -> Self {
        Self {
            entries: vec![(10.0, 10.0), (5.0, 7.0), (3.0, 5.0), (1.0, 3.0)],
            default_step: 1.0,
        }
    }
}

impl FromStr for IncrementTable {
    type Err = ConfigError;

    /// Parses `THRESHOLD:STEP[,THRESHOLD:STEP...]`, e.g. `10:10,5:7,3:5,1:3`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let entries = s
            .split(',')
            .map(str::trim)
            .filter(|e| !e.is_empty())
            .map(|entry| {
                let parsed = entry
                    .split_once(':')
                    .and_then(|(t, i)| Some((t.trim().parse().ok()?, i.trim().parse().ok()?)));
                parsed.ok_or_else(|| ConfigError::IncrementEntry(entry.to_string()))
            })
            .collect::<Result<Vec<(f64, f64)>, _>>()?;
        Self::new(entries, 1.0)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SamplingConfig {
    pub count: usize,
    pub duration: Duration,
    /// Added to the averaged sample metric to account for the gap between short
    /// samples and the full file.
    pub bias: f64,
    /// Where sample artifacts are written; the source's directory when unset.
    pub scratch_dir: Option<PathBuf>,
}

impl Default for SamplingConfig {
    fn default() -> Self {
        Self {
            count: 7,
            duration: Duration::from_secs(30),
            bias: 0.5,
            scratch_dir: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SearchConfig {
    pub target: TargetRange,
    pub domain: QualityDomain,
    pub start_quality: f64,
    pub strategy: StrategyKind,
    pub polarity: Polarity,
    pub max_iterations: u32,
    pub increments: IncrementTable,
    pub narrowing_width: f64,
    pub sampling: SamplingConfig,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            target: TargetRange {
                min: 12.0,
                max: 14.5,
            },
            domain: QualityDomain {
                low: 20.0,
                high: 70.0,
            },
            start_quality: DEFAULT_QUALITY,
            strategy: StrategyKind::default(),
            polarity: Polarity::default(),
            max_iterations: 6,
            increments: IncrementTable::default(),
            narrowing_width: 2.0,
            sampling: SamplingConfig::default(),
        }
    }
}

impl SearchConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.domain.contains(self.start_quality) {
            return Err(ConfigError::QualityOutOfDomain {
                quality: self.start_quality,
                low: self.domain.low,
                high: self.domain.high,
            });
        }
        if self.max_iterations == 0 {
            return Err(ConfigError::NoIterations);
        }
        if self.sampling.count == 0 {
            return Err(ConfigError::NoSamples);
        }
        if self.sampling.duration < Duration::from_secs(1) {
            return Err(ConfigError::SampleTooShort);
        }
        Ok(())
    }

    /// Same configuration starting from `quality`, clamped into the domain.
    pub fn starting_at(&self, quality: f64) -> Self {
        Self {
            start_quality: self.domain.clamp(quality),
            ..self.clone()
        }
    }
}

/// Used when neither the caller nor the preset provide a quality.
pub const DEFAULT_QUALITY: f64 = 22.0;

/// Baseline encoder settings read once from a HandBrake preset export.
#[derive(Debug, Clone, PartialEq)]
pub struct Preset {
    pub path: PathBuf,
    pub name: String,
    pub quality: f64,
    pub extension: &'static str,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct PresetFile {
    #[serde(default)]
    preset_list: Vec<PresetEntry>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct PresetEntry {
    preset_name: String,
    video_quality_slider: Option<f64>,
    file_format: Option<String>,
}

impl Preset {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref().to_path_buf();
        let raw = std::fs::read_to_string(&path).map_err(|source| ConfigError::PresetRead {
            path: path.clone(),
            source,
        })?;
        Self::parse(path, &raw)
    }

    fn parse(path: PathBuf, raw: &str) -> Result<Self, ConfigError> {
        let file: PresetFile =
            serde_json::from_str(raw).map_err(|source| ConfigError::PresetParse {
                path: path.clone(),
                source,
            })?;
        let Some(entry) = file.preset_list.into_iter().next() else {
            return Err(ConfigError::EmptyPreset { path });
        };
        let extension = match entry.file_format.as_deref() {
            Some("av_mkv") => "mkv",
            Some("av_webm") => "webm",
            _ => "mp4",
        };
        Ok(Self {
            path,
            name: entry.preset_name,
            quality: entry
                .video_quality_slider
                .filter(|q| *q > 0.0)
                .unwrap_or(DEFAULT_QUALITY),
            extension,
        })
    }
}
