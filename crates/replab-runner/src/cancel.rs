use crate::lock::LockRegistry;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Shared interrupt state, tripped by the CLI's signal handler. Carries the
/// registry of held locks so the handler can release them on a hard exit.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
    locks: LockRegistry,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    pub fn locks(&self) -> &LockRegistry {
        &self.locks
    }
}
