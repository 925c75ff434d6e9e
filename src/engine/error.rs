use ulid::Ulid;

use crate::model::{BookingStatus, CardId, CoachId, StudentId};

/// Identifies the row an error refers to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RowRef {
    Booking(Ulid),
    Coach(CoachId),
    Student(StudentId),
    Card(CardId),
    Membership(Ulid),
}

impl std::fmt::Display for RowRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RowRef::Booking(id) => write!(f, "booking {id}"),
            RowRef::Coach(id) => write!(f, "coach {id}"),
            RowRef::Student(id) => write!(f, "student {id}"),
            RowRef::Card(id) => write!(f, "card {id}"),
            RowRef::Membership(id) => write!(f, "membership {id}"),
        }
    }
}

/// Which side of a booking already holds the slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Party {
    Coach,
    Student,
}

impl std::fmt::Display for Party {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Party::Coach => f.write_str("slot already booked"),
            Party::Student => f.write_str("you already have a booking then"),
        }
    }
}

/// Coarse classes callers branch on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Conflict,
    PolicyViolation,
    ConcurrencyLost,
    NotFound,
    InvalidState,
    Storage,
}

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("{0} not found")]
    NotFound(RowRef),

    #[error("booking {booking} is {status}; cannot {action}")]
    InvalidState {
        booking: Ulid,
        status: BookingStatus,
        action: &'static str,
    },

    #[error("{party} (booking {existing})")]
    Conflict { party: Party, existing: Ulid },

    #[error("student {0} has no usable course credit")]
    InsufficientCredit(StudentId),

    #[error("booking {booking} starts within {cutoff_minutes} minutes; cancellation closed")]
    CancelWindow { booking: Ulid, cutoff_minutes: u64 },

    #[error("unknown or inactive energy rule: {0}")]
    UnknownRule(String),

    #[error("rate limited: {0}")]
    RateLimited(String),

    #[error("insufficient energy: balance {balance}, requested {requested}")]
    InsufficientBalance { balance: i64, requested: i64 },

    #[error("reference {kind}:{id} already posted as {posting}")]
    DuplicateReference {
        kind: String,
        id: String,
        posting: &'static str,
    },

    #[error("gave up after {attempts} concurrent update attempts")]
    ConcurrencyExhausted { attempts: u32 },

    #[error("timed out waiting for lock on {0}")]
    LockTimeout(RowRef),

    #[error("invalid input: {0}")]
    InvalidInput(&'static str),

    #[error("WAL error: {0}")]
    WalError(String),
}

impl EngineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            EngineError::Conflict { .. } => ErrorKind::Conflict,
            EngineError::InsufficientCredit(_)
            | EngineError::CancelWindow { .. }
            | EngineError::UnknownRule(_)
            | EngineError::RateLimited(_)
            | EngineError::InsufficientBalance { .. }
            | EngineError::DuplicateReference { .. }
            | EngineError::InvalidInput(_) => ErrorKind::PolicyViolation,
            EngineError::ConcurrencyExhausted { .. } | EngineError::LockTimeout(_) => {
                ErrorKind::ConcurrencyLost
            }
            EngineError::NotFound(_) => ErrorKind::NotFound,
            EngineError::InvalidState { .. } => ErrorKind::InvalidState,
            EngineError::WalError(_) => ErrorKind::Storage,
        }
    }

    /// Transient failures a caller may simply try again.
    pub fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::ConcurrencyLost
    }

    /// Metrics label.
    pub fn label(&self) -> &'static str {
        match self {
            EngineError::NotFound(_) => "not_found",
            EngineError::InvalidState { .. } => "invalid_state",
            EngineError::Conflict { .. } => "conflict",
            EngineError::InsufficientCredit(_) => "insufficient_credit",
            EngineError::CancelWindow { .. } => "cancel_window",
            EngineError::UnknownRule(_) => "unknown_rule",
            EngineError::RateLimited(_) => "rate_limited",
            EngineError::InsufficientBalance { .. } => "insufficient_balance",
            EngineError::DuplicateReference { .. } => "duplicate_reference",
            EngineError::ConcurrencyExhausted { .. } => "concurrency_exhausted",
            EngineError::LockTimeout(_) => "lock_timeout",
            EngineError::InvalidInput(_) => "invalid_input",
            EngineError::WalError(_) => "wal_error",
        }
    }
}
