use std::f64::consts::PI;

use crate::config::{DecayKind, LearningRateConfig};

/// Learning-rate schedule as a pure function of the 0-based step index:
/// linear warmup to the base rate, then the configured decay over the
/// remaining steps. Being stateless, resume just evaluates it at the
/// restored step.
#[derive(Debug, Clone)]
pub struct Schedule {
    base: f64,
    warmup_steps: u64,
    decay: DecayKind,
    end_lr: f64,
    total_steps: u64,
}

impl Schedule {
    pub fn new(config: &LearningRateConfig, total_steps: u64) -> Self {
        Self {
            base: config.base,
            warmup_steps: config.warmup_steps.min(total_steps),
            decay: config.decay,
            end_lr: config.end_lr,
            total_steps,
        }
    }

    pub fn lr_at(&self, step: u64) -> f64 {
        if self.warmup_steps > 0 && step < self.warmup_steps {
            return self.base * (step + 1) as f64 / self.warmup_steps as f64;
        }
        let decay_steps = self.total_steps.saturating_sub(self.warmup_steps);
        if decay_steps == 0 {
            return self.base;
        }
        let progress =
            (step.saturating_sub(self.warmup_steps)) as f64 / decay_steps as f64;
        let progress = progress.clamp(0.0, 1.0);
        match self.decay {
            DecayKind::Constant => self.base,
            DecayKind::Cosine => {
                self.end_lr + 0.5 * (self.base - self.end_lr) * (1.0 + (PI * progress).cos())
            }
            DecayKind::Linear => self.base + (self.end_lr - self.base) * progress,
        }
    }
}
