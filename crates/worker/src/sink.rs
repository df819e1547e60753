//! Tracing-backed message sink for CLI runs

use std::sync::atomic::{AtomicUsize, Ordering};

use membersync_billing::{MessageLevel, MessageSink};
use tracing::{error, info, warn};

/// Forwards run messages to tracing and counts warnings/errors so the run
/// can close with a summary line.
#[derive(Default)]
pub struct TracingSink {
    warnings: AtomicUsize,
    errors: AtomicUsize,
}

impl TracingSink {
    pub fn warnings(&self) -> usize {
        self.warnings.load(Ordering::SeqCst)
    }

    pub fn errors(&self) -> usize {
        self.errors.load(Ordering::SeqCst)
    }
}

impl MessageSink for TracingSink {
    fn emit(&self, level: MessageLevel, message: &str) {
        match level {
            MessageLevel::Status => info!("{message}"),
            MessageLevel::Warning => {
                self.warnings.fetch_add(1, Ordering::SeqCst);
                warn!("{message}");
            }
            MessageLevel::Error => {
                self.errors.fetch_add(1, Ordering::SeqCst);
                error!("{message}");
            }
        }
    }
}
