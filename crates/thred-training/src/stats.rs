//! Step statistics between two reporting points.

use crate::context::StepStats;
use std::time::Duration;

/// Perplexities above this are treated as divergence.
pub const OVERFLOW_PPL: f64 = 1e20;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct StatsAccumulator {
    step_time: Duration,
    /// Sum of per-example losses.
    loss: f64,
    predict_count: u64,
    word_count: u64,
    grad_norm: f64,
    steps: u64,
}

/// Averages computed at a reporting point.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StatsReport {
    pub avg_step_time: f64,
    pub avg_grad_norm: f64,
    pub train_ppl: f64,
    /// Thousands of words per second.
    pub speed: f64,
}

impl StatsReport {
    #[must_use]
    pub fn is_overflow(&self) -> bool {
        !self.train_ppl.is_finite() || self.train_ppl > OVERFLOW_PPL
    }
}

impl StatsAccumulator {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, stats: &StepStats, elapsed: Duration) {
        self.step_time += elapsed;
        self.loss += stats.loss * f64::from(stats.batch_size);
        self.predict_count += stats.predict_count;
        self.word_count += stats.word_count;
        self.grad_norm += stats.grad_norm;
        self.steps += 1;
    }

    #[must_use]
    pub fn report(&self) -> StatsReport {
        let steps = self.steps.max(1) as f64;
        let secs = self.step_time.as_secs_f64();
        let train_ppl = if self.predict_count == 0 {
            f64::INFINITY
        } else {
            (self.loss / self.predict_count as f64).exp()
        };
        let speed = if secs > 0.0 { self.word_count as f64 / (1000.0 * secs) } else { 0.0 };

        StatsReport {
            avg_step_time: secs / steps,
            avg_grad_norm: self.grad_norm / steps,
            train_ppl,
            speed,
        }
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}
