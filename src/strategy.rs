//! Quality search strategies.
//!
//! A strategy proposes the next quality to sample and digests the measured
//! metric. It never touches the encoder itself; the engine does the sampling.
//!
//! The two strategies do not agree on what "normal" polarity means. With
//! [`Polarity::Normal`] the increment strategy raises the quality to shrink the
//! output, while bisection searches lower qualities for the same effect. They
//! also count iterations differently: increment only counts the branch where
//! the metric is above the band, bisection counts every observation. Both are
//! kept as-is so existing polarity settings keep working.

use crate::config::{
    Direction, IncrementTable, Polarity, QualityDomain, SearchConfig, StrategyKind, TargetRange,
};

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Proposal {
    Probe(f64),
    Halt { best: f64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Converged,
    Continue,
    /// The search can no longer move: the interval emptied or the quality is
    /// pinned at the edge of its domain.
    Collapsed,
}

pub trait SearchStrategy {
    fn name(&self) -> &'static str;

    /// Next quality to sample, or the best candidate once the iteration
    /// budget is spent.
    fn propose(&mut self) -> Proposal;

    /// Digests the metric measured at the last proposed quality.
    fn observe(&mut self, metric: f64, target: &TargetRange) -> Verdict;

    fn iterations(&self) -> u32;

    /// Most recent candidate, always inside the quality domain.
    fn best(&self) -> f64;
}

pub fn build(config: &SearchConfig) -> Box<dyn SearchStrategy> {
    match config.strategy {
        StrategyKind::Increment => Box::new(IncrementStrategy::new(
            config.start_quality,
            config.domain,
            config.polarity,
            config.max_iterations,
            config.increments.clone(),
        )),
        StrategyKind::Bisect => Box::new(BisectionStrategy::new(
            config.domain,
            config.polarity,
            config.max_iterations,
        )),
    }
}

/// Moves the quality by a step sized to how far the metric misses the band.
#[derive(Debug, Clone)]
pub struct IncrementStrategy {
    quality: f64,
    domain: QualityDomain,
    polarity: Polarity,
    max_iterations: u32,
    iterations: u32,
    table: IncrementTable,
}

impl IncrementStrategy {
    /// Quality direction that lowers the metric under normal polarity.
    const SHRINK: Direction = Direction::Up;

    pub fn new(
        quality: f64,
        domain: QualityDomain,
        polarity: Polarity,
        max_iterations: u32,
        table: IncrementTable,
    ) -> Self {
        Self {
            quality: domain.clamp(quality),
            domain,
            polarity,
            max_iterations,
            iterations: 0,
            table,
        }
    }
}

impl SearchStrategy for IncrementStrategy {
    fn name(&self) -> &'static str {
        "increment"
    }

    fn propose(&mut self) -> Proposal {
        if self.iterations >= self.max_iterations {
            return Proposal::Halt { best: self.quality };
        }
        Proposal::Probe(self.quality)
    }

    fn observe(&mut self, metric: f64, target: &TargetRange) -> Verdict {
        if target.contains(metric) {
            return Verdict::Converged;
        }

        let (bound, direction) = if metric < target.min() {
            (target.min(), Self::SHRINK.flip())
        } else {
            self.iterations += 1;
            (target.max(), Self::SHRINK)
        };
        let step = self.table.step_for((metric - bound).abs());
        let next = match self.polarity.orient(direction) {
            Direction::Up => self.quality + step,
            Direction::Down => self.quality - step,
        };
        let next = self.domain.clamp(next);

        if next == self.quality {
            return Verdict::Collapsed;
        }
        self.quality = next;
        Verdict::Continue
    }

    fn iterations(&self) -> u32 {
        self.iterations
    }

    fn best(&self) -> f64 {
        self.quality
    }
}

/// Halves an integer quality interval after every sample.
#[derive(Debug, Clone)]
pub struct BisectionStrategy {
    low: i64,
    high: i64,
    domain: QualityDomain,
    polarity: Polarity,
    max_iterations: u32,
    iterations: u32,
    last: Option<f64>,
}

impl BisectionStrategy {
    /// Interval half to keep when the metric is too high, under normal
    /// polarity.
    const SHRINK: Direction = Direction::Down;

    pub fn new(domain: QualityDomain, polarity: Polarity, max_iterations: u32) -> Self {
        Self {
            low: domain.low().ceil() as i64,
            high: domain.high().floor() as i64,
            domain,
            polarity,
            max_iterations,
            iterations: 0,
            last: None,
        }
    }

    fn midpoint(&self) -> f64 {
        let mid = ((self.low + self.high) as f64 / 2.0).round();
        self.domain.clamp(mid)
    }
}

impl SearchStrategy for BisectionStrategy {
    fn name(&self) -> &'static str {
        "bisect"
    }

    fn propose(&mut self) -> Proposal {
        if self.iterations >= self.max_iterations {
            return Proposal::Halt {
                best: self.midpoint(),
            };
        }
        let candidate = self.midpoint();
        self.last = Some(candidate);
        Proposal::Probe(candidate)
    }

    fn observe(&mut self, metric: f64, target: &TargetRange) -> Verdict {
        self.iterations += 1;
        if target.contains(metric) {
            return Verdict::Converged;
        }

        let candidate = self.last.unwrap_or_else(|| self.midpoint()) as i64;
        let direction = if metric > target.max() {
            Self::SHRINK
        } else {
            Self::SHRINK.flip()
        };
        match self.polarity.orient(direction) {
            Direction::Down => self.high = candidate - 1,
            Direction::Up => self.low = candidate + 1,
        }

        if self.low > self.high {
            return Verdict::Collapsed;
        }
        Verdict::Continue
    }

    fn iterations(&self) -> u32 {
        self.iterations
    }

    fn best(&self) -> f64 {
        self.last.unwrap_or_else(|| self.midpoint())
    }
}
