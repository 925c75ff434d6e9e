use std::time::Duration;

use chrono::{Local, NaiveDate, NaiveDateTime, NaiveTime, TimeDelta};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::{EngineError, Party};

/// Wall-clock now in the platform's local time, the frame bookings use.
pub(crate) fn local_now() -> NaiveDateTime {
    Local::now().naive_local()
}

pub(crate) fn local_today() -> NaiveDate {
    Local::now().date_naive()
}

pub(crate) fn validate_slot(start: NaiveTime, end: NaiveTime) -> Result<Span, EngineError> {
    if start >= end {
        return Err(EngineError::InvalidInput("slot must end after it starts"));
    }
    let span = Span::new(start, end);
    if span.duration() > TimeDelta::minutes(MAX_SLOT_MINUTES) {
        return Err(EngineError::InvalidInput("slot too long"));
    }
    Ok(span)
}

/// First active booking on `date` overlapping `span`, ignoring `exclude`.
pub fn find_conflict(
    schedule: &Schedule,
    date: NaiveDate,
    span: &Span,
    exclude: Option<Ulid>,
) -> Option<Ulid> {
    schedule
        .overlapping(date, span)
        .find(|slot| Some(slot.booking_id) != exclude)
        .map(|slot| slot.booking_id)
}

/// Coach first, then student: both are exclusive for the slot.
pub(crate) fn check_no_conflict(
    coach: &Schedule,
    student: &Schedule,
    date: NaiveDate,
    span: &Span,
    exclude: Option<Ulid>,
) -> Result<(), EngineError> {
    if let Some(existing) = find_conflict(coach, date, span, exclude) {
        return Err(EngineError::Conflict {
            party: Party::Coach,
            existing,
        });
    }
    if let Some(existing) = find_conflict(student, date, span, exclude) {
        return Err(EngineError::Conflict {
            party: Party::Student,
            existing,
        });
    }
    Ok(())
}

/// Cancellation closes `cutoff` before the booking starts.
pub(crate) fn check_cancel_window(
    booking: &Booking,
    cutoff: Duration,
    now: NaiveDateTime,
) -> Result<(), EngineError> {
    let cutoff_delta =
        TimeDelta::from_std(cutoff).map_err(|_| EngineError::InvalidInput("cancel cutoff out of range"))?;
    let starts_at = booking.date.and_time(booking.span.start);
    if now > starts_at - cutoff_delta {
        return Err(EngineError::CancelWindow {
            booking: booking.id,
            cutoff_minutes: cutoff.as_secs() / 60,
        });
    }
    Ok(())
}
