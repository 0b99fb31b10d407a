//! Learning rate schedules applied once per optimizer step.

/// A step-indexed learning rate schedule
pub trait LRScheduler {
    /// Learning rate for the current step
    fn get_lr(&self) -> f64;

    /// Advance one optimizer step
    fn step(&mut self);

    fn current_step(&self) -> usize;

    /// Jump to `step`, e.g. when resuming from a checkpoint
    fn set_step(&mut self, step: usize);
}

/// Linear warmup from zero to `base_lr`, then linear decay to zero at
/// `total_steps`.
#[derive(Debug, Clone)]
pub struct LinearScheduler {
    base_lr: f64,
    warmup_steps: usize,
    total_steps: usize,
    current_step: usize,
}

impl LinearScheduler {
    pub fn new(base_lr: f64, warmup_steps: usize, total_steps: usize) -> Self {
        Self {
            base_lr,
            warmup_steps,
            total_steps,
            current_step: 0,
        }
    }
}

impl LRScheduler for LinearScheduler {
    fn get_lr(&self) -> f64 {
        let step = self.current_step;
        if step < self.warmup_steps {
            return self.base_lr * step as f64 / self.warmup_steps.max(1) as f64;
        }
        let remaining = self.total_steps.saturating_sub(step);
        let decay_steps = self.total_steps.saturating_sub(self.warmup_steps).max(1);
        self.base_lr * (remaining as f64 / decay_steps as f64).min(1.0)
    }

    fn step(&mut self) {
        self.current_step += 1;
    }

    fn current_step(&self) -> usize {
        self.current_step
    }

    fn set_step(&mut self, step: usize) {
        self.current_step = step;
    }
}
