use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Run-level cancellation flag, shared between the orchestrator and any
/// in-flight transfers. Checked between streamed chunks, so a transfer stops
/// within one chunk of the flag being raised.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
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
}
