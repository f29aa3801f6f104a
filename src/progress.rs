//! Progress reporting capability.
//!
//! The core streams downloads without caring how progress is presented; a
//! front-end may plug in a richer reporter. The default implementation just
//! logs the start and end of each transfer.

use log::info;

pub(crate) trait ProgressReporter {
    fn start(&self, description: &str, total_bytes: Option<u64>);
    fn advance(&self, _bytes: u64) {}
    fn finish(&self, description: &str);
}

/// Reporter used when no UI is attached.
#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct LogReporter;

impl ProgressReporter for LogReporter {
    fn start(&self, description: &str, total_bytes: Option<u64>) {
        match total_bytes {
            Some(total) => info!("{} ({} bytes)", description, total),
            None => info!("{}", description),
        }
    }

    fn finish(&self, description: &str) {
        info!("{} done", description);
    }
}
