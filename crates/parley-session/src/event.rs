//! Everything that can wake the session task besides a user command.
//!
//! Each event carries the tag of whatever produced it (an attempt id or a
//! watcher epoch) so late deliveries from torn-down sources are dropped.

use parley_media::{DeviceCapabilities, LocalStream, MediaError, PeerEvent};
use parley_shared::{CallRecord, CandidateItem};

/// Identifies one call attempt (or one incoming offer) within a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub(crate) struct AttemptId(pub u64);

impl std::fmt::Display for AttemptId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug)]
pub(crate) enum SessionEvent {
    /// Media acquisition finished. `attempt` is `None` for the acquisition
    /// started with the session, otherwise the start or accept awaiting it.
    MediaReady {
        attempt: Option<AttemptId>,
        caps: DeviceCapabilities,
        result: Result<LocalStream, MediaError>,
    },
    /// The incoming watcher of epoch `epoch` saw a candidate call.
    Incoming { epoch: u64, record: CallRecord },
    /// A new snapshot of the attempt's call record.
    RecordChanged { attempt: AttemptId, record: CallRecord },
    /// A counterpart candidate was appended.
    RemoteCandidate { attempt: AttemptId, item: CandidateItem },
    /// The attempt's peer connection reported something.
    Peer { attempt: AttemptId, event: PeerEvent },
    /// The unanswered-call timer expired.
    TimerFired { attempt: AttemptId },
    /// Another party's ringing record appeared while we are calling.
    Glare { attempt: AttemptId, record: CallRecord },
}
