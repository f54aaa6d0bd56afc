//! Target-tracking model of the inference autoscaling group.
//!
//! Used to reason about a scaling configuration without an account: feed
//! per-instance metric samples, read back the capacity after each
//! evaluation.

use skyforge_common::{Capacity, ConfigError, ScalingPolicy};

/// Capacity after one evaluation.
///
/// Scale-out jumps straight to `ceil(current * metric / target)`; scale-in
/// removes at most one instance per evaluation. Both are clamped to
/// `[min, max]`.
pub fn next_capacity(current: u32, metric: f64, policy: &ScalingPolicy, bounds: &Capacity) -> u32 {
    let current = current.max(bounds.min).min(bounds.max);
    if current == 0 || !metric.is_finite() || policy.target <= 0.0 {
        return current;
    }
    let wanted = (f64::from(current) * metric / policy.target).ceil();
    let wanted = if wanted >= f64::from(bounds.max) {
        bounds.max
    } else {
        (wanted.max(0.0) as u32).max(bounds.min)
    };

    if wanted >= current {
        wanted
    } else if policy.disable_scale_in {
        current
    } else {
        (current - 1).max(wanted)
    }
}

#[derive(Debug, Clone)]
pub struct ScalingSimulator {
    policy: ScalingPolicy,
    bounds: Capacity,
    current: u32,
}

impl ScalingSimulator {
    pub fn new(policy: ScalingPolicy, bounds: Capacity) -> Result<Self, ConfigError> {
        bounds.validate()?;
        Ok(Self {
            current: bounds.desired,
            policy,
            bounds,
        })
    }

    pub fn current(&self) -> u32 {
        self.current
    }

    pub fn step(&mut self, metric: f64) -> u32 {
        let next = next_capacity(self.current, metric, &self.policy, &self.bounds);
        if next != self.current {
            tracing::debug!(from = self.current, to = next, metric, "capacity change");
        }
        self.current = next;
        next
    }

    /// Capacity after each sample.
    pub fn run(&mut self, samples: &[f64]) -> Vec<u32> {
        samples.iter().map(|m| self.step(*m)).collect()
    }
}
