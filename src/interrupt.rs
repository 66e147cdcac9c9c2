//! Cooperative interruption shared by the pipeline loops and rate waits

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Set once (usually by Ctrl-C); checked between items and while waiting
#[derive(Debug, Clone, Default)]
pub struct InterruptFlag(Arc<AtomicBool>);

impl InterruptFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn interrupt(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_interrupted(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}
