use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};

const RUNNING: u8 = 0;
const STOP: u8 = 1;
const FORCE: u8 = 2;

/// Cooperative stop flag shared between a pipeline and whoever drives it.
///
/// A plain stop lets pipelines finish retrieving work already on the device;
/// a forced stop abandons it.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicU8>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        let _ = self
            .0
            .compare_exchange(RUNNING, STOP, Ordering::SeqCst, Ordering::SeqCst);
    }

    pub fn force(&self) {
        self.0.store(FORCE, Ordering::SeqCst);
    }

    /// First call stops, any later call forces.
    pub fn escalate(&self) {
        if self.is_cancelled() {
            self.force();
        } else {
            self.cancel();
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst) != RUNNING
    }

    pub fn is_forced(&self) -> bool {
        self.0.load(Ordering::SeqCst) == FORCE
    }
}
