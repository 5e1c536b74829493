//! Consecutive failure tracking per stage

use std::fmt::Display;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::error;

/// Counts back-to-back failures of one stage or worker.
///
/// A success resets the count. Reaching the ceiling raises the shared stop
/// flag so the whole pipeline winds down instead of spinning on a broken
/// collaborator.
#[derive(Debug)]
pub struct ErrorBudget {
    stage: String,
    consecutive: u32,
    ceiling: u32,
}

impl ErrorBudget {
    pub fn new(stage: impl Into<String>, ceiling: u32) -> Self {
        Self {
            stage: stage.into(),
            consecutive: 0,
            ceiling: ceiling.max(1),
        }
    }

    pub fn success(&mut self) {
        self.consecutive = 0;
    }

    /// Log a failure. Returns true when the ceiling is reached and the stage
    /// must exit.
    pub fn failure(&mut self, err: &dyn Display, stop: &AtomicBool) -> bool {
        self.consecutive += 1;
        error!(
            "{} error ({}/{}): {}",
            self.stage, self.consecutive, self.ceiling, err
        );

        if self.consecutive >= self.ceiling {
            error!(
                fatal = true,
                "{}: {} consecutive errors, stopping pipeline", self.stage, self.consecutive
            );
            stop.store(true, Ordering::SeqCst);
            return true;
        }
        false
    }

    pub fn consecutive(&self) -> u32 {
        self.consecutive
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_success_resets() {
        let stop = AtomicBool::new(false);
        let mut budget = ErrorBudget::new("capture", 3);
        assert!(!budget.failure(&"boom", &stop));
        assert!(!budget.failure(&"boom", &stop));
        budget.success();
        assert_eq!(budget.consecutive(), 0);
        assert!(!budget.failure(&"boom", &stop));
        assert!(!stop.load(Ordering::SeqCst));
    }

    #[test]
    fn test_ceiling_raises_stop() {
        let stop = AtomicBool::new(false);
        let mut budget = ErrorBudget::new("detection", 10);
        for _ in 0..9 {
            assert!(!budget.failure(&"model failed", &stop));
        }
        assert!(budget.failure(&"model failed", &stop));
        assert!(stop.load(Ordering::SeqCst));
    }
}
