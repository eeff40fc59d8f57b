use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::task::AbortHandle;
use tracing::trace;

/// The one-shot unanswered-call timer.
///
/// Armed timers are counted in a shared gauge; dropping the timer cancels
/// it and releases its slot, whether or not it already fired.
pub(crate) struct ExpiryTimer {
    task: AbortHandle,
    gauge: Arc<AtomicUsize>,
}

impl ExpiryTimer {
    pub(crate) fn arm<F>(after: Duration, gauge: &Arc<AtomicUsize>, on_fire: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        gauge.fetch_add(1, Ordering::SeqCst);
        let task = tokio::spawn(async move {
            tokio::time::sleep(after).await;
            on_fire();
        })
        .abort_handle();
        trace!(after_ms = after.as_millis() as u64, "Expiry timer armed");

        Self {
            task,
            gauge: gauge.clone(),
        }
    }
}

impl Drop for ExpiryTimer {
    fn drop(&mut self) {
        self.task.abort();
        self.gauge.fetch_sub(1, Ordering::SeqCst);
        trace!("Expiry timer released");
    }
}
