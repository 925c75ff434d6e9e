use std::collections::BTreeMap;

use chrono::{DateTime, NaiveDate, NaiveTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Platform-assigned identifiers. Rows owned by the ledger itself use `Ulid`.
pub type StudentId = u64;
pub type CoachId = u64;
pub type CardId = u64;
pub type OperatorId = u64;

/// Half-open wall-clock interval `[start, end)` within a single day.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub start: NaiveTime,
    pub end: NaiveTime,
}

impl Span {
    pub fn new(start: NaiveTime, end: NaiveTime) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    pub fn duration(&self) -> TimeDelta {
        self.end - self.start
    }

    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }
}

/// One active reservation on a coach's or student's calendar.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Slot {
    pub booking_id: Ulid,
    pub span: Span,
}

/// Active (pending or confirmed) bookings of one party, bucketed by date.
/// Each day's slots are kept sorted by `span.start`.
#[derive(Debug, Clone, Default)]
pub struct Schedule {
    days: BTreeMap<NaiveDate, Vec<Slot>>,
}

impl Schedule {
    pub fn insert(&mut self, date: NaiveDate, slot: Slot) {
        let day = self.days.entry(date).or_default();
        let pos = day.partition_point(|s| s.span.start <= slot.span.start);
        day.insert(pos, slot);
    }

    pub fn remove(&mut self, date: NaiveDate, booking_id: Ulid) -> Option<Slot> {
        let day = self.days.get_mut(&date)?;
        let pos = day.iter().position(|s| s.booking_id == booking_id)?;
        let slot = day.remove(pos);
        if day.is_empty() {
            self.days.remove(&date);
        }
        Some(slot)
    }

    pub fn day(&self, date: NaiveDate) -> &[Slot] {
        self.days.get(&date).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Slots on `date` overlapping `query`. Binary search skips slots
    /// starting at or after `query.end`.
    pub fn overlapping(&self, date: NaiveDate, query: &Span) -> impl Iterator<Item = &Slot> {
        let day = self.day(date);
        let right_bound = day.partition_point(|s| s.span.start < query.end);
        day[..right_bound]
            .iter()
            .filter(move |s| s.span.end > query.start)
    }

    pub fn len(&self) -> usize {
        self.days.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.days.is_empty()
    }
}

// ── Bookings ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BookingStatus {
    Pending,
    Confirmed,
    Completed,
    Cancelled,
    NoShow,
}

impl BookingStatus {
    /// Active bookings hold their slot on both calendars.
    pub fn is_active(self) -> bool {
        matches!(self, BookingStatus::Pending | BookingStatus::Confirmed)
    }

    pub fn is_terminal(self) -> bool {
        !self.is_active()
    }

    /// Allowed lifecycle edges.
    pub fn can_transition(self, to: BookingStatus) -> bool {
        use BookingStatus::*;
        matches!(
            (self, to),
            (Pending, Confirmed)
                | (Confirmed, Completed)
                | (Pending, Cancelled)
                | (Confirmed, Cancelled)
                | (Confirmed, NoShow)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            BookingStatus::Pending => "pending",
            BookingStatus::Confirmed => "confirmed",
            BookingStatus::Completed => "completed",
            BookingStatus::Cancelled => "cancelled",
            BookingStatus::NoShow => "no_show",
        }
    }
}

impl std::fmt::Display for BookingStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Booking {
    pub id: Ulid,
    pub student_id: StudentId,
    pub coach_id: CoachId,
    pub schedule_id: Option<u64>,
    pub date: NaiveDate,
    pub span: Span,
    pub course_type: String,
    pub status: BookingStatus,
    /// Membership charged for this booking, if any.
    pub membership_id: Option<Ulid>,
    pub cancel_reason: Option<String>,
    pub cancelled_at: Option<DateTime<Utc>>,
    pub cancelled_by: Option<OperatorId>,
    pub remark: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Booking {
    pub fn start_time(&self) -> NaiveTime {
        self.span.start
    }

    pub fn end_time(&self) -> NaiveTime {
        self.span.end
    }

    pub fn slot(&self) -> Slot {
        Slot {
            booking_id: self.id,
            span: self.span,
        }
    }
}

/// Input to `Engine::create_booking`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BookingRequest {
    pub student_id: StudentId,
    pub coach_id: CoachId,
    pub schedule_id: Option<u64>,
    pub date: NaiveDate,
    pub start: NaiveTime,
    pub end: NaiveTime,
    pub course_type: String,
    pub remark: Option<String>,
}

// ── Course credits ───────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MembershipStatus {
    Active,
    Exhausted,
    Expired,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Membership {
    pub id: Ulid,
    pub student_id: StudentId,
    pub card_id: CardId,
    pub remaining_times: u32,
    pub expire_date: Option<NaiveDate>,
    pub status: MembershipStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Membership {
    /// Can this membership pay for a booking today?
    pub fn is_chargeable(&self, today: NaiveDate) -> bool {
        self.status == MembershipStatus::Active
            && self.remaining_times > 0
            && self.expire_date.is_none_or(|d| d >= today)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CreditKind {
    Consume,
    Refund,
    Purchase,
    Manual,
}

/// Append-only audit row for one movement of `remaining_times`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreditTransaction {
    pub id: Ulid,
    pub membership_id: Ulid,
    pub student_id: StudentId,
    pub kind: CreditKind,
    pub times_change: i64,
    pub booking_id: Option<Ulid>,
    pub operator_id: Option<OperatorId>,
    pub created_at: DateTime<Utc>,
}

/// A purchasable plan. `duration_days` dates a new membership's expiry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Card {
    pub id: CardId,
    pub name: String,
    pub times: u32,
    pub duration_days: Option<u32>,
    pub active: bool,
}

// ── Parties ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Default)]
pub struct CoachRow {
    pub id: CoachId,
    pub name: Option<String>,
    pub schedule: Schedule,
}

#[derive(Debug, Clone, Default)]
pub struct StudentRow {
    pub id: StudentId,
    pub name: Option<String>,
    /// Mirror of the sum of this student's `remaining_times`.
    pub remaining_lessons: i64,
    pub schedule: Schedule,
    /// Membership ids in creation order.
    pub memberships: Vec<Ulid>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StudentInfo {
    pub id: StudentId,
    pub name: Option<String>,
    pub remaining_lessons: i64,
}

// ── Energy ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EnergyKind {
    Earn,
    Spend,
    Expire,
    Adjust,
    Refund,
}

/// The business event that triggered a posting, e.g. `("training", "812")`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Reference {
    pub kind: String,
    pub id: String,
}

impl Reference {
    pub fn new(kind: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            id: id.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnergyAccount {
    pub id: Ulid,
    pub student_id: StudentId,
    pub balance: i64,
    pub total_earned: i64,
    pub total_spent: i64,
    pub level: u32,
    /// Bumped on every write; the CAS token.
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl EnergyAccount {
    pub fn new(student_id: StudentId, now: DateTime<Utc>) -> Self {
        Self {
            id: Ulid::new(),
            student_id,
            balance: 0,
            total_earned: 0,
            total_spent: 0,
            level: 1,
            version: 0,
            created_at: now,
            updated_at: now,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnergyTransaction {
    pub id: Ulid,
    pub student_id: StudentId,
    pub kind: EnergyKind,
    /// Positive for credits, negative for debits.
    pub amount: i64,
    pub balance_after: i64,
    pub rule_id: Option<Ulid>,
    pub reference: Reference,
    pub description: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnergyRule {
    pub id: Ulid,
    pub code: String,
    pub name: String,
    pub points: i64,
    pub multiplier: f64,
    pub daily_limit: Option<i64>,
    pub weekly_limit: Option<i64>,
    pub monthly_limit: Option<i64>,
    pub active: bool,
}

impl EnergyRule {
    pub fn award(&self) -> i64 {
        (self.points as f64 * self.multiplier).floor() as i64
    }
}

/// An account together with its audit log, stored as one row so a
/// snapshot of both is a single read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnergyLedgerRow {
    pub account: EnergyAccount,
    pub log: Vec<EnergyTransaction>,
}

/// Result of an energy posting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Posting {
    pub amount: i64,
    pub balance: i64,
}

// ── WAL records ──────────────────────────────────────────────────

/// Row-level changes. A transaction is an ordered list of these.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Change {
    CoachRegistered {
        id: CoachId,
        name: Option<String>,
    },
    StudentRegistered {
        id: StudentId,
        name: Option<String>,
    },
    CardDefined(Card),
    RuleDefined(EnergyRule),
    /// Insert or overwrite a booking row; calendars follow its status.
    BookingWritten(Booking),
    MembershipWritten(Membership),
    CreditLogged(CreditTransaction),
    LessonCounterSet {
        student_id: StudentId,
        remaining_lessons: i64,
    },
    /// CAS-protected account write plus its audit row.
    EnergyPosted {
        account: EnergyAccount,
        entry: EnergyTransaction,
    },
    /// Restores an account and its full log; emitted by compaction only.
    EnergyRestored {
        account: EnergyAccount,
        log: Vec<EnergyTransaction>,
    },
}

/// One committed transaction: the WAL record format. Replay applies the
/// changes in order; a torn record is dropped whole.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Commit {
    pub changes: Vec<Change>,
}
