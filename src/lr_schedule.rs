use tracing::info;

/// Reduce-on-plateau learning-rate control driven by validation loss.
///
/// An epoch improves when its metric is below `best * (1 - threshold)`. After more than
/// `patience` consecutive non-improving epochs the rate is multiplied by `factor`,
/// floored at `min_lr`, and the counter resets.
#[derive(Clone, Debug)]
pub struct ReduceOnPlateau {
    factor: f64,
    patience: usize,
    min_lr: f64,
    threshold: f64,
    best: f64,
    bad_epochs: usize,
}

impl ReduceOnPlateau {
    pub fn new(factor: f64, patience: usize, min_lr: f64) -> Self {
        Self {
            factor,
            patience,
            min_lr,
            threshold: 1e-4,
            best: f64::INFINITY,
            bad_epochs: 0,
        }
    }

    pub fn best(&self) -> f64 {
        self.best
    }

    /// Records one validation metric and returns the new learning rate when it changes.
    pub fn step(&mut self, metric: f64, current_lr: f64) -> Option<f64> {
        if metric < self.best * (1.0 - self.threshold) {
            self.best = metric;
            self.bad_epochs = 0;
            return None;
        }

        self.bad_epochs += 1;
        if self.bad_epochs <= self.patience {
            return None;
        }
        self.bad_epochs = 0;

        let new_lr = (current_lr * self.factor).max(self.min_lr);
        if current_lr - new_lr > 1e-8 {
            info!("Reducing learning rate: {:.2e} -> {:.2e}", current_lr, new_lr);
            Some(new_lr)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reduces_after_patience_exceeded() {
        let mut sched = ReduceOnPlateau::new(0.5, 2, 1e-6);
        let mut lr = 5e-4;
        assert_eq!(sched.step(1.0, lr), None);
        assert_eq!(sched.step(1.0, lr), None);
        assert_eq!(sched.step(1.0, lr), None);
        // third non-improving epoch exceeds patience 2
        let reduced = sched.step(1.0, lr).unwrap();
        assert!((reduced - 2.5e-4).abs() < 1e-12);
        lr = reduced;

        // counter was reset
        assert_eq!(sched.step(1.0, lr), None);
        assert_eq!(sched.step(0.5, lr), None);
        assert_eq!(sched.best(), 0.5);
    }

    #[test]
    fn test_respects_min_lr() {
        let mut sched = ReduceOnPlateau::new(0.5, 0, 1e-6);
        assert_eq!(sched.step(1.0, 1.5e-6), None);
        let reduced = sched.step(1.0, 1.5e-6).unwrap();
        assert_eq!(reduced, 1e-6);
        assert_eq!(sched.step(1.0, 1e-6), None);
    }
}
