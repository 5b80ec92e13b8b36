use std::sync::atomic::{AtomicBool, Ordering};

/// Global "background jobs enabled" switch consumed at admission.
pub trait BackgroundJobsFlag: Send + Sync {
    fn background_jobs_enabled(&self) -> bool;
}

/// Flag held in memory; flipped by config reload or tests.
#[derive(Debug)]
pub struct StaticFlag(AtomicBool);

impl StaticFlag {
    pub fn new(enabled: bool) -> Self {
        Self(AtomicBool::new(enabled))
    }

    pub fn set(&self, enabled: bool) {
        self.0.store(enabled, Ordering::SeqCst);
    }
}

impl Default for StaticFlag {
    fn default() -> Self {
        Self::new(true)
    }
}

impl BackgroundJobsFlag for StaticFlag {
    fn background_jobs_enabled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}
