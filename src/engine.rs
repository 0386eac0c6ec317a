use std::path::Path;

use tracing::{info, warn};

use crate::config::{Preset, SearchConfig, TargetRange};
use crate::encoder::Encoder;
use crate::error::SearchError;
use crate::media::Prober;
use crate::sampler::Sampler;
use crate::strategy::{self, Proposal, Verdict};

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum Convergence {
    Converged,
    /// The iteration budget ran out.
    Exhausted,
    /// The search could not move any further before reaching the target.
    Collapsed,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Measurement {
    pub quality: f64,
    pub metric: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SearchOutcome {
    pub quality: f64,
    pub status: Convergence,
    /// Requested target, possibly narrowed to the source's natural ratio.
    pub target: TargetRange,
    pub natural_ratio: f64,
    pub last: Option<Measurement>,
    pub iterations: u32,
    pub probes: u32,
}

impl SearchOutcome {
    pub fn converged(&self) -> bool {
        self.status == Convergence::Converged
    }
}

enum Phase {
    Init,
    Sampling(f64),
    Evaluating(Measurement),
    Done(Convergence, f64),
}

/// Finds a quality whose sampled MB/min falls inside the configured target.
///
/// ```mermaid
/// stateDiagram-v2
///     [*] --> Init
///     Init --> Sampling
///     Sampling --> Evaluating: metric measured
///     Sampling --> Failed: encode or probe error
///     Evaluating --> Converged: in range
///     Evaluating --> Sampling: out of range
///     Evaluating --> Exhausted: budget spent or collapsed
///     Converged --> [*]
///     Exhausted --> [*]
///     Failed --> [*]
/// ```
#[aquamarine::aquamarine]
pub struct ConvergenceEngine<E, P> {
    sampler: Sampler<E, P>,
    config: SearchConfig,
}

impl<E: Encoder, P: Prober> ConvergenceEngine<E, P> {
    pub fn new(encoder: E, prober: P, preset: Preset, config: SearchConfig) -> Self {
        let sampler = Sampler::new(encoder, prober, preset, config.sampling.clone());
        Self { sampler, config }
    }

    pub fn encoder(&self) -> &E {
        self.sampler.encoder()
    }

    pub fn prober(&self) -> &P {
        self.sampler.prober()
    }

    pub fn preset(&self) -> &Preset {
        self.sampler.preset()
    }

    pub fn config(&self) -> &SearchConfig {
        &self.config
    }

    /// Starts later runs from `quality`.
    pub fn carry_forward(&mut self, quality: f64) {
        self.config = self.config.starting_at(quality);
    }

    #[tracing::instrument(skip_all, fields(path = %path.display()))]
    pub async fn run(&self, path: &Path) -> Result<SearchOutcome, SearchError> {
        let source = self
            .sampler
            .prober()
            .inspect(path)
            .await
            .map_err(|source| SearchError::Source {
                path: path.to_path_buf(),
                source,
            })?;

        let natural_ratio = source.mb_per_min();
        let target = match self
            .config
            .target
            .narrowed_to(natural_ratio, self.config.narrowing_width)
        {
            Some(narrowed) => {
                info!(
                    "Source is already {natural_ratio:.2} MB/min, narrowing target {} to {narrowed}",
                    self.config.target
                );
                narrowed
            }
            None => self.config.target,
        };

        let mut strategy = strategy::build(&self.config);
        info!(strategy = strategy.name(), "Searching for {target}");

        let mut last: Option<Measurement> = None;
        let mut probes = 0;
        let mut phase = Phase::Init;

        let (status, quality) = loop {
            phase = match phase {
                Phase::Init => match strategy.propose() {
                    Proposal::Probe(quality) => Phase::Sampling(quality),
                    Proposal::Halt { best } => Phase::Done(Convergence::Exhausted, best),
                },
                Phase::Sampling(quality) => {
                    probes += 1;
                    let metric = self.sampler.measure(&source, quality).await.map_err(|source| {
                        SearchError::Sample {
                            path: path.to_path_buf(),
                            quality,
                            target,
                            iterations: strategy.iterations(),
                            last_metric: last.map(|m| m.metric),
                            source,
                        }
                    })?;
                    let measurement = Measurement { quality, metric };
                    last = Some(measurement);
                    Phase::Evaluating(measurement)
                }
                Phase::Evaluating(measurement) => {
                    match strategy.observe(measurement.metric, &target) {
                        Verdict::Converged => Phase::Done(Convergence::Converged, measurement.quality),
                        Verdict::Collapsed => Phase::Done(Convergence::Collapsed, strategy.best()),
                        Verdict::Continue => match strategy.propose() {
                            Proposal::Probe(quality) => Phase::Sampling(quality),
                            Proposal::Halt { best } => Phase::Done(Convergence::Exhausted, best),
                        },
                    }
                }
                Phase::Done(status, quality) => break (status, quality),
            };
        };

        let outcome = SearchOutcome {
            quality,
            status,
            target,
            natural_ratio,
            last,
            iterations: strategy.iterations(),
            probes,
        };
        match outcome.status {
            Convergence::Converged => info!(
                quality,
                iterations = outcome.iterations,
                "Found quality {quality} for {target}"
            ),
            status => warn!(
                %status,
                quality,
                iterations = outcome.iterations,
                last_metric = ?last.map(|m| m.metric),
                "No quality reached {target}, best candidate is {quality}"
            ),
        }
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{IncrementTable, Polarity, QualityDomain, SamplingConfig, StrategyKind};
    use crate::error::SampleError;
    use crate::testing::{constant, linear, preset, Metric, StubEncoder, StubProber};
    use std::path::PathBuf;
    use std::time::Duration;

    struct Setup {
        _dir: tempfile::TempDir,
        source: PathBuf,
        engine: ConvergenceEngine<StubEncoder, StubProber>,
    }

    fn config(min: f64, max: f64) -> SearchConfig {
        SearchConfig {
            target: TargetRange::new(min, max).unwrap(),
            domain: QualityDomain::new(0.0, 100.0).unwrap(),
            start_quality: 22.0,
            strategy: StrategyKind::Increment,
            polarity: Polarity::Normal,
            max_iterations: 8,
            increments: IncrementTable::default(),
            narrowing_width: 2.0,
            sampling: SamplingConfig {
                count: 2,
                duration: Duration::from_secs(30),
                bias: 0.0,
                scratch_dir: None,
            },
        }
    }

    fn setup(config: SearchConfig, prober: StubProber, encoder: StubEncoder) -> Setup {
        let dir = tempfile::tempdir().unwrap();
        let config = SearchConfig {
            sampling: SamplingConfig {
                scratch_dir: Some(dir.path().to_path_buf()),
                ..config.sampling.clone()
            },
            ..config
        };
        Setup {
            source: dir.path().join("episode.mkv"),
            _dir: dir,
            engine: ConvergenceEngine::new(encoder, prober, preset(), config),
        }
    }

    async fn run(config: SearchConfig, metric: Metric, natural: f64) -> SearchOutcome {
        let s = setup(config, StubProber::new(metric, natural), StubEncoder::default());
        s.engine.run(&s.source).await.unwrap()
    }

    fn close(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-4
    }

    #[tokio::test]
    async fn increment_scenario_exhausts_budget() {
        let mut config = config(9.5, 11.0);
        config.sampling.count = 10;
        let outcome = run(config, linear(30.0, -0.2), 30.0).await;

        assert_eq!(outcome.status, Convergence::Exhausted);
        assert_eq!(outcome.iterations, 8);
        assert_eq!(outcome.probes, 8);
        assert_eq!(outcome.quality, 83.0);
        let last = outcome.last.unwrap();
        assert_eq!(last.quality, 78.0);
        assert!(close(last.metric, 14.4));
        assert!(!outcome.target.contains(last.metric));
    }

    #[tokio::test]
    async fn increment_converges_with_normal_polarity() {
        let outcome = run(config(9.5, 11.2), linear(40.0, -0.5), 30.0).await;
        assert!(outcome.converged());
        assert_eq!(outcome.quality, 58.0);
        assert_eq!(outcome.iterations, 6);
        assert!(outcome.target.contains(outcome.last.unwrap().metric));
    }

    #[tokio::test]
    async fn increment_converges_with_inverted_polarity() {
        let mut config = config(9.5, 11.2);
        config.polarity = Polarity::Inverted;
        let outcome = run(config, linear(10.0, 0.5), 30.0).await;
        assert!(outcome.converged());
        assert_eq!(outcome.quality, 2.0);
        assert!(close(outcome.last.unwrap().metric, 11.0));
    }

    #[tokio::test]
    async fn bisection_converges_with_normal_polarity() {
        let mut config = config(9.5, 11.0);
        config.strategy = StrategyKind::Bisect;
        config.domain = QualityDomain::new(20.0, 70.0).unwrap();
        let outcome = run(config, linear(0.0, 0.25), 30.0).await;
        assert!(outcome.converged());
        assert_eq!(outcome.quality, 39.0);
        assert_eq!(outcome.iterations, 3);
    }

    #[tokio::test]
    async fn bisection_converges_with_inverted_polarity() {
        let mut config = config(9.5, 11.0);
        config.strategy = StrategyKind::Bisect;
        config.polarity = Polarity::Inverted;
        config.domain = QualityDomain::new(20.0, 100.0).unwrap();
        let outcome = run(config, linear(30.0, -0.25), 30.0).await;
        assert!(outcome.converged());
        assert_eq!(outcome.quality, 81.0);
        assert_eq!(outcome.iterations, 2);
    }

    #[tokio::test]
    async fn bisection_collapse_reports_in_domain_candidate() {
        let mut config = config(9.5, 11.0);
        config.strategy = StrategyKind::Bisect;
        config.domain = QualityDomain::new(20.0, 22.0).unwrap();
        config.max_iterations = 10;
        let outcome = run(config, constant(50.0), 30.0).await;
        assert_eq!(outcome.status, Convergence::Collapsed);
        assert!((20.0..=22.0).contains(&outcome.quality));
        assert!(!outcome.converged());
    }

    #[tokio::test]
    async fn narrows_target_for_small_sources() {
        let outcome = run(config(9.5, 11.0), linear(12.0, -0.2), 8.0).await;
        assert_eq!(outcome.target, TargetRange::new(6.0, 8.0).unwrap());
        assert!(close(outcome.natural_ratio, 8.0));
        assert!(outcome.converged());
        assert_eq!(outcome.quality, 22.0);
        assert!(outcome.target.contains(outcome.last.unwrap().metric));
    }

    #[tokio::test]
    async fn keeps_target_for_large_sources() {
        let outcome = run(config(9.5, 11.0), linear(12.0, -0.2), 20.0).await;
        assert_eq!(outcome.target, TargetRange::new(9.5, 11.0).unwrap());
    }

    #[tokio::test]
    async fn terminates_for_monotonic_metrics() {
        let metrics = [
            linear(30.0, -0.2),
            linear(0.0, 0.3),
            linear(100.0, -1.5),
            linear(2.0, 0.05),
        ];
        let targets = [(9.5, 11.0), (1.0, 1.5), (40.0, 60.0)];
        for metric in &metrics {
            for &(min, max) in &targets {
                for strategy in [StrategyKind::Increment, StrategyKind::Bisect] {
                    for polarity in [Polarity::Normal, Polarity::Inverted] {
                        let mut config = config(min, max);
                        config.strategy = strategy;
                        config.polarity = polarity;
                        config.sampling.count = 1;
                        let max_iterations = config.max_iterations;
                        let outcome = run(config, metric.clone(), 500.0).await;
                        assert!(outcome.iterations <= max_iterations);
                        assert!((0.0..=100.0).contains(&outcome.quality));
                        let in_range = outcome
                            .last
                            .is_some_and(|m| m.quality == outcome.quality && outcome.target.contains(m.metric));
                        assert_eq!(outcome.converged(), in_range);
                    }
                }
            }
        }
    }

    #[tokio::test]
    async fn carried_quality_starts_next_run() {
        let mut s = setup(
            config(9.5, 11.2),
            StubProber::new(linear(40.0, -0.5), 30.0),
            StubEncoder::default(),
        );
        let first = s.engine.run(&s.source).await.unwrap();
        s.engine.carry_forward(first.quality);
        assert_eq!(s.engine.config().start_quality, 58.0);

        let second = s.engine.run(&s.source).await.unwrap();
        assert!(second.converged());
        assert_eq!(second.probes, 1);
    }

    #[tokio::test]
    async fn sample_failure_carries_context() {
        let s = setup(
            config(9.5, 11.0),
            StubProber::new(linear(30.0, -0.2), 30.0),
            StubEncoder::failing_at(3),
        );
        let err = s.engine.run(&s.source).await.unwrap_err();
        let SearchError::Sample {
            path,
            quality,
            target,
            iterations,
            last_metric,
            source,
        } = err
        else {
            panic!("expected a sample failure");
        };
        assert_eq!(path, s.source);
        assert_eq!(quality, 32.0);
        assert_eq!(target, TargetRange::new(9.5, 11.0).unwrap());
        assert_eq!(iterations, 1);
        assert!(close(last_metric.unwrap(), 25.6));
        assert!(matches!(source, SampleError::Encode { index: 1, .. }));
    }

    #[tokio::test]
    async fn source_probe_failure_is_fatal() {
        let s = setup(
            config(9.5, 11.0),
            StubProber::new(linear(30.0, -0.2), 30.0).failing_source(),
            StubEncoder::default(),
        );
        let err = s.engine.run(&s.source).await.unwrap_err();
        assert!(matches!(err, SearchError::Source { .. }));
    }
}
