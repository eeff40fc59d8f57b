use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ParseStatusError;
use crate::types::{CallId, ConversationId, PartyId};

/// Lifecycle of one call attempt as persisted in the shared record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CallStatus {
    Ringing,
    Active,
    Ended,
    Rejected,
    NotAnswered,
}

impl CallStatus {
    pub const TERMINAL: [CallStatus; 3] = [Self::Ended, Self::Rejected, Self::NotAnswered];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ringing => "ringing",
            Self::Active => "active",
            Self::Ended => "ended",
            Self::Rejected => "rejected",
            Self::NotAnswered => "not-answered",
        }
    }

    pub fn is_terminal(&self) -> bool {
        Self::TERMINAL.contains(self)
    }

    /// `ringing` may move anywhere, `active` only to `ended`, terminal
    /// states never move again.
    pub fn can_transition_to(&self, next: CallStatus) -> bool {
        match self {
            Self::Ringing => next != Self::Ringing,
            Self::Active => next == Self::Ended,
            Self::Ended | Self::Rejected | Self::NotAnswered => false,
        }
    }
}

impl std::fmt::Display for CallStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for CallStatus {
    type Err = ParseStatusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ringing" => Ok(Self::Ringing),
            "active" => Ok(Self::Active),
            "ended" => Ok(Self::Ended),
            "rejected" => Ok(Self::Rejected),
            "not-answered" => Ok(Self::NotAnswered),
            other => Err(ParseStatusError(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Answer,
}

/// Session description produced by the media engine. Opaque to signaling.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub sdp_type: SdpType,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Answer,
            sdp: sdp.into(),
        }
    }
}

/// Connectivity candidate, forwarded verbatim between the two engines.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CandidateBlob(pub String);

impl CandidateBlob {
    pub fn new(payload: impl Into<String>) -> Self {
        Self(payload.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// The two append-only candidate sequences hanging off a call record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CandidateSide {
    /// Written by the creator (`offerCandidates`).
    Offer,
    /// Written by the accepting party (`answerCandidates`).
    Answer,
}

impl CandidateSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Offer => "offer",
            Self::Answer => "answer",
        }
    }

    /// The sequence the other party writes.
    pub fn counterpart(&self) -> Self {
        match self {
            Self::Offer => Self::Answer,
            Self::Answer => Self::Offer,
        }
    }
}

/// One appended candidate together with its position in its sequence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CandidateItem {
    /// Zero-based, strictly increasing within one sequence.
    pub seq: u64,
    pub candidate: CandidateBlob,
}

/// The shared call record both parties read and merge-update.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallRecord {
    pub id: CallId,
    pub conversation_id: ConversationId,
    pub created_by: PartyId,
    pub status: CallStatus,
    pub offer: Option<SessionDescription>,
    pub answer: Option<SessionDescription>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl CallRecord {
    /// A fresh ringing record with no descriptions yet.
    pub fn ringing(conversation_id: ConversationId, created_by: PartyId, now: DateTime<Utc>) -> Self {
        Self {
            id: CallId::new(),
            conversation_id,
            created_by,
            status: CallStatus::Ringing,
            offer: None,
            answer: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Deterministic glare order: the earlier record wins, ids break ties.
    pub fn precedes(&self, other: &CallRecord) -> bool {
        (self.created_at, self.id) < (other.created_at, other.id)
    }

    /// A ringing record whose creator never got to write a terminal status.
    pub fn is_stale_ringing(&self, now: DateTime<Utc>, max_age: Duration) -> bool {
        self.status == CallStatus::Ringing && now - self.created_at > max_age
    }
}

/// Partial, field-granular update. `None` fields are left untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CallUpdate {
    pub status: Option<CallStatus>,
    pub offer: Option<SessionDescription>,
    pub answer: Option<SessionDescription>,
}

impl CallUpdate {
    pub fn status(status: CallStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    pub fn offer(offer: SessionDescription) -> Self {
        Self {
            offer: Some(offer),
            ..Default::default()
        }
    }

    /// The accepting party's write: its answer plus `active`.
    pub fn answered(answer: SessionDescription) -> Self {
        Self {
            status: Some(CallStatus::Active),
            answer: Some(answer),
            ..Default::default()
        }
    }
}
