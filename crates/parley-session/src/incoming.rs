use std::sync::Arc;

use chrono::Utc;
use parley_shared::{CallStatus, ConversationId, PartyId};
use parley_store::{CallFilter, SignalingChannel, StoreError};
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tracing::debug;

use crate::event::SessionEvent;

/// Standing watch for calls other parties place in this conversation.
///
/// Live only while the session is idle or previewing. Each start gets a
/// fresh epoch; the session ignores events from any other epoch, so nothing
/// a stopped watcher already queued can be acted on.
pub(crate) struct IncomingWatcher {
    epoch: u64,
    task: AbortHandle,
}

impl IncomingWatcher {
    pub(crate) async fn start(
        channel: &Arc<dyn SignalingChannel>,
        conversation: &ConversationId,
        local: &PartyId,
        stale_after: chrono::Duration,
        epoch: u64,
        events: &mpsc::UnboundedSender<SessionEvent>,
    ) -> Result<Self, StoreError> {
        let filter = CallFilter::new(conversation.clone(), &[CallStatus::Ringing, CallStatus::Active])
            .excluding(local.clone());
        let mut sub = channel.watch_calls(filter).await?;

        let events = events.clone();
        let task = tokio::spawn(async move {
            while let Some(record) = sub.next().await {
                if record.is_stale_ringing(Utc::now(), stale_after) {
                    debug!(call = %record.id.short(), "Ignoring stale ringing call");
                    continue;
                }
                if events.send(SessionEvent::Incoming { epoch, record }).is_err() {
                    break;
                }
            }
        })
        .abort_handle();

        debug!(epoch, "Incoming watcher started");
        Ok(Self { epoch, task })
    }

    pub(crate) fn epoch(&self) -> u64 {
        self.epoch
    }
}

impl Drop for IncomingWatcher {
    fn drop(&mut self) {
        self.task.abort();
        debug!(epoch = self.epoch, "Incoming watcher stopped");
    }
}
