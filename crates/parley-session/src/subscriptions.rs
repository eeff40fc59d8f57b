use std::future::Future;

use parley_store::Subscription;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tracing::trace;

use crate::event::SessionEvent;

/// Every forwarding task registered for one attempt, released together.
///
/// A forwarder owns its store [`Subscription`], so aborting the task also
/// deregisters the watch.
#[derive(Default)]
pub(crate) struct SubscriptionSet {
    tasks: Vec<AbortHandle>,
}

impl SubscriptionSet {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn spawn<F>(&mut self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.tasks.push(tokio::spawn(task).abort_handle());
    }

    /// Forward every item of `sub` into the session, wrapped by `wrap`.
    pub(crate) fn forward<T, W>(
        &mut self,
        mut sub: Subscription<T>,
        events: &mpsc::UnboundedSender<SessionEvent>,
        wrap: W,
    ) where
        T: Send + 'static,
        W: Fn(T) -> SessionEvent + Send + 'static,
    {
        let events = events.clone();
        self.spawn(async move {
            while let Some(item) = sub.next().await {
                if events.send(wrap(item)).is_err() {
                    break;
                }
            }
        });
    }

    /// Same as [`forward`](Self::forward) for a plain channel receiver.
    pub(crate) fn forward_channel<T, W>(
        &mut self,
        mut rx: mpsc::UnboundedReceiver<T>,
        events: &mpsc::UnboundedSender<SessionEvent>,
        wrap: W,
    ) where
        T: Send + 'static,
        W: Fn(T) -> SessionEvent + Send + 'static,
    {
        let events = events.clone();
        self.spawn(async move {
            while let Some(item) = rx.recv().await {
                if events.send(wrap(item)).is_err() {
                    break;
                }
            }
        });
    }

    pub(crate) fn len(&self) -> usize {
        self.tasks.len()
    }

    #[cfg(test)]
    pub(crate) fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub(crate) fn cancel_all(&mut self) {
        if !self.tasks.is_empty() {
            trace!(count = self.tasks.len(), "Cancelling subscriptions");
        }
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }
}

impl Drop for SubscriptionSet {
    fn drop(&mut self) {
        self.cancel_all();
    }
}
