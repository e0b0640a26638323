use std::time::Instant;

use crate::measurements::MeasurementWriter;

/// Wall-clock bookkeeping for the training loop. Tracks time spent actually
/// training, excluding paused spans (checkpoint writes, evaluation passes),
/// and carries accumulated time across restarts via the checkpoint.
pub struct Chronometer {
    total_steps: u64,
    batch_size: usize,
    accumulated: f64,
    active_since: Option<Instant>,
    last_tick: Option<(u64, f64)>,
}

impl Chronometer {
    pub fn new(total_steps: u64, batch_size: usize) -> Self {
        Self {
            total_steps,
            batch_size,
            accumulated: 0.0,
            active_since: None,
            last_tick: None,
        }
    }

    /// Seeds the accumulated training time from a restored checkpoint.
    pub fn set_accumulated(&mut self, seconds: f64) {
        self.accumulated = seconds.max(0.0);
    }

    /// Training seconds so far, including the currently running span.
    pub fn accumulated_seconds(&self) -> f64 {
        let running = self
            .active_since
            .map(|since| since.elapsed().as_secs_f64())
            .unwrap_or(0.0);
        self.accumulated + running
    }

    pub fn resume(&mut self) {
        if self.active_since.is_none() {
            self.active_since = Some(Instant::now());
        }
    }

    pub fn pause(&mut self) {
        if let Some(since) = self.active_since.take() {
            self.accumulated += since.elapsed().as_secs_f64();
        }
    }

    /// Emits throughput measurements for the span since the previous tick
    /// and returns a progress note for the lifecycle log.
    pub fn tick(&mut self, step: u64, writer: &mut MeasurementWriter) -> Option<String> {
        let now = self.accumulated_seconds();
        let note = match self.last_tick {
            Some((last_step, last_time)) if now > last_time && step > last_step => {
                let dt = now - last_time;
                let steps_per_sec = (step - last_step) as f64 / dt;
                let examples_per_sec = steps_per_sec * self.batch_size as f64;
                writer.measure(step, "steps_per_sec", steps_per_sec);
                writer.measure(step, "examples_per_sec", examples_per_sec);
                writer.measure(step, "uptime_secs", now);
                let remaining = self.total_steps.saturating_sub(step);
                let eta = remaining as f64 / steps_per_sec;
                Some(format!(
                    "step {}/{}: {:.2} steps/s, eta {}",
                    step,
                    self.total_steps,
                    steps_per_sec,
                    human_duration(eta)
                ))
            }
            _ => None,
        };
        self.last_tick = Some((step, now));
        note
    }
}

fn human_duration(seconds: f64) -> String {
    let total = seconds.max(0.0) as u64;
    let hours = total / 3600;
    let minutes = (total % 3600) / 60;
    let secs = total % 60;
    if hours > 0 {
        format!("{}h{:02}m", hours, minutes)
    } else if minutes > 0 {
        format!("{}m{:02}s", minutes, secs)
    } else {
        format!("{}s", secs)
    }
}
