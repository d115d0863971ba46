use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Liveness flag for whoever started a fetch. Responses arriving after the
/// scope closes are dropped instead of committed.
#[derive(Debug, Clone)]
pub struct Scope {
    open: Arc<AtomicBool>,
}

impl Scope {
    pub fn new() -> Self {
        Self {
            open: Arc::new(AtomicBool::new(true)),
        }
    }

    /// A scope that never closes.
    pub fn root() -> Self {
        Self::new()
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    pub fn close(&self) {
        self.open.store(false, Ordering::Release);
    }
}

impl Default for Scope {
    fn default() -> Self {
        Self::new()
    }
}
