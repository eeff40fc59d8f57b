/// Application name
pub const APP_NAME: &str = "parley";

/// How long a ringing call waits for an answer before it is marked
/// `not-answered` (milliseconds)
pub const DEFAULT_UNANSWERED_TIMEOUT_MS: u64 = 30_000;

/// Default STUN server handed to the media engine
pub const DEFAULT_STUN_URL: &str = "stun:stun.l.google.com:19302";

/// Status strings shown after an attempt ends
pub const STATUS_DECLINED: &str = "Call declined";
pub const STATUS_NOT_ANSWERED: &str = "Call not answered";
pub const STATUS_CANCELLED: &str = "Call cancelled";
pub const STATUS_ENDED: &str = "Call ended";
