use parley_shared::{CandidateBlob, CandidateItem};
use tracing::trace;

/// Exactly-once, in-order delivery of counterpart candidates to the peer
/// connection.
///
/// Items at or below the `seq` watermark are redeliveries and dropped.
/// Until the remote description is applied, items are held back and
/// released in append order by [`remote_applied`](Self::remote_applied).
#[derive(Debug, Default)]
pub(crate) struct CandidateRelay {
    next_seq: u64,
    applied: bool,
    pending: Vec<CandidateBlob>,
}

impl CandidateRelay {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Accept one delivered item. Returns the blob to hand to the engine
    /// now, if any.
    pub(crate) fn receive(&mut self, item: CandidateItem) -> Option<CandidateBlob> {
        if item.seq < self.next_seq {
            trace!(seq = item.seq, "Duplicate candidate dropped");
            return None;
        }
        self.next_seq = item.seq + 1;

        if self.applied {
            Some(item.candidate)
        } else {
            trace!(seq = item.seq, "Candidate queued until remote description");
            self.pending.push(item.candidate);
            None
        }
    }

    /// The remote description is now set. Returns the queued blobs in the
    /// order they were appended. Later calls return nothing.
    pub(crate) fn remote_applied(&mut self) -> Vec<CandidateBlob> {
        self.applied = true;
        std::mem::take(&mut self.pending)
    }

    #[cfg(test)]
    pub(crate) fn pending(&self) -> usize {
        self.pending.len()
    }
}
