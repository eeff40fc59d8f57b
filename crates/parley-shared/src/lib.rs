pub mod constants;
pub mod error;
pub mod protocol;
pub mod types;

pub use error::CallError;
pub use protocol::{
    CallRecord, CallStatus, CallUpdate, CandidateBlob, CandidateItem, CandidateSide, SdpType,
    SessionDescription,
};
pub use types::{CallId, ConversationId, PartyId, TrackKind};
