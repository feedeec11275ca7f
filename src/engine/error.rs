use ulid::Ulid;

use crate::ids::encode_id;
use crate::model::{Ms, ReservationInfo, Span, HOUR_MS};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TimespanError {
    /// `end <= start`
    NotPositive,
    TooLong { max_ms: Ms },
    OutOfRange,
}

#[derive(Debug)]
pub enum EngineError {
    NotFound(Ulid),
    InvalidTimespan(TimespanError),
    /// Carries the first conflicting reservation, credential stripped.
    Collision(Box<ReservationInfo>),
    Forbidden,
    InvalidInput(String),
    LimitExceeded(&'static str),
    WalError(String),
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::NotFound(id) => write!(f, "not found: {}", encode_id(*id)),
            EngineError::InvalidTimespan(TimespanError::NotPositive) => {
                write!(f, "invalid timespan: end_at must be after start_at")
            }
            EngineError::InvalidTimespan(TimespanError::TooLong { max_ms }) => {
                write!(
                    f,
                    "invalid timespan: could not be over {} hours",
                    max_ms / HOUR_MS
                )
            }
            EngineError::InvalidTimespan(TimespanError::OutOfRange) => {
                write!(f, "invalid timespan: timestamp out of range")
            }
            EngineError::Collision(other) => write!(
                f,
                "collides with reservation {} ({} by {})",
                encode_id(other.id),
                Span::new(other.start, other.end).display(),
                other.name
            ),
            EngineError::Forbidden => write!(f, "permission denied"),
            EngineError::InvalidInput(msg) => write!(f, "invalid input: {msg}"),
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::WalError(e) => write!(f, "WAL error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}
