use chrono::{NaiveDate, NaiveDateTime, NaiveTime, Utc};
use tracing::{debug, info};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::observability::{BOOKING_OPS_TOTAL, outcome_label};

use super::conflict::{check_cancel_window, check_no_conflict, local_now, local_today, validate_slot};
use super::{Engine, EngineError, RowRef};

fn check_len(value: Option<&str>, max: usize, what: &'static str) -> Result<(), EngineError> {
    match value {
        Some(v) if v.len() > max => Err(EngineError::InvalidInput(what)),
        _ => Ok(()),
    }
}

fn record(op: &'static str, result: &Result<Booking, EngineError>) {
    metrics::counter!(BOOKING_OPS_TOTAL, "op" => op, "outcome" => outcome_label(result)).increment(1);
    if let Err(e) = result {
        debug!("{op} rejected: {e}");
    }
}

impl Engine {
    /// Reserve a coach and a student for a slot, charging one credit.
    pub async fn create_booking(&self, request: BookingRequest) -> Result<Booking, EngineError> {
        let result = self.create_booking_locked(request).await;
        record("create", &result);
        result
    }

    async fn create_booking_locked(&self, request: BookingRequest) -> Result<Booking, EngineError> {
        let span = validate_slot(request.start, request.end)?;
        if request.course_type.is_empty() || request.course_type.len() > MAX_COURSE_TYPE_LEN {
            return Err(EngineError::InvalidInput("invalid course type"));
        }
        check_len(request.remark.as_deref(), MAX_REMARK_LEN, "remark too long")?;

        let _locks = self.lock_parties(request.coach_id, request.student_id).await?;
        self.check_slot_free(request.coach_id, request.student_id, request.date, &span, None)?;

        let membership = self
            .select_active(request.student_id, local_today())
            .ok_or(EngineError::InsufficientCredit(request.student_id))?;

        let now = Utc::now();
        let booking = Booking {
            id: Ulid::new(),
            student_id: request.student_id,
            coach_id: request.coach_id,
            schedule_id: request.schedule_id,
            date: request.date,
            span,
            course_type: request.course_type,
            status: BookingStatus::Confirmed,
            membership_id: Some(membership.id),
            cancel_reason: None,
            cancelled_at: None,
            cancelled_by: None,
            remark: request.remark,
            created_at: now,
            updated_at: now,
        };

        let mut changes = vec![Change::BookingWritten(booking.clone())];
        changes.extend(self.debit_changes(&membership, booking.id, now)?);
        self.commit(changes).await?;

        info!(
            "booking {} confirmed: coach {} student {} on {} {}-{}, charged membership {}",
            booking.id, booking.coach_id, booking.student_id, booking.date, span.start, span.end, membership.id
        );
        Ok(booking)
    }

    /// Both parties must exist and be free over `span`. Callers hold both locks.
    fn check_slot_free(
        &self,
        coach_id: CoachId,
        student_id: StudentId,
        date: NaiveDate,
        span: &Span,
        exclude: Option<Ulid>,
    ) -> Result<(), EngineError> {
        let coach = self
            .tables
            .coaches
            .get(&coach_id)
            .ok_or(EngineError::NotFound(RowRef::Coach(coach_id)))?;
        let student = self
            .tables
            .students
            .get(&student_id)
            .ok_or(EngineError::NotFound(RowRef::Student(student_id)))?;
        check_no_conflict(&coach.schedule, &student.schedule, date, span, exclude)
    }

    /// Resolve the booking's parties, lock them, then re-read the row so a
    /// transition committed while we waited is seen.
    async fn lock_booking(&self, id: Ulid) -> Result<(super::PartyLocks<'_>, Booking), EngineError> {
        let (coach_id, student_id) = self
            .tables
            .bookings
            .get(&id)
            .map(|b| (b.coach_id, b.student_id))
            .ok_or(EngineError::NotFound(RowRef::Booking(id)))?;
        let locks = self.lock_parties(coach_id, student_id).await?;
        let booking = self
            .tables
            .bookings
            .get(&id)
            .map(|b| b.value().clone())
            .ok_or(EngineError::NotFound(RowRef::Booking(id)))?;
        Ok((locks, booking))
    }

    /// Cancel ahead of the cutoff and refund the charged credit.
    pub async fn cancel_booking(
        &self,
        booking_id: Ulid,
        actor_id: OperatorId,
        reason: &str,
    ) -> Result<Booking, EngineError> {
        self.cancel_booking_at(booking_id, actor_id, reason, local_now()).await
    }

    pub(crate) async fn cancel_booking_at(
        &self,
        booking_id: Ulid,
        actor_id: OperatorId,
        reason: &str,
        now_local: NaiveDateTime,
    ) -> Result<Booking, EngineError> {
        let result = self.cancel_locked(booking_id, actor_id, reason, now_local).await;
        record("cancel", &result);
        result
    }

    async fn cancel_locked(
        &self,
        booking_id: Ulid,
        actor_id: OperatorId,
        reason: &str,
        now_local: NaiveDateTime,
    ) -> Result<Booking, EngineError> {
        check_len(Some(reason), MAX_REASON_LEN, "reason too long")?;
        let (_locks, booking) = self.lock_booking(booking_id).await?;
        if !booking.status.can_transition(BookingStatus::Cancelled) {
            return Err(EngineError::InvalidState {
                booking: booking_id,
                status: booking.status,
                action: "cancel",
            });
        }
        check_cancel_window(&booking, self.config.cancel_cutoff, now_local)?;

        let now = Utc::now();
        let cancelled = Booking {
            status: BookingStatus::Cancelled,
            cancel_reason: Some(reason.to_string()),
            cancelled_at: Some(now),
            cancelled_by: Some(actor_id),
            updated_at: now,
            ..booking
        };
        let mut changes = vec![Change::BookingWritten(cancelled.clone())];
        if let Some(membership_id) = cancelled.membership_id {
            changes.extend(self.refund_changes(membership_id, booking_id, now)?);
        }
        self.commit(changes).await?;
        info!("booking {booking_id} cancelled by {actor_id}: {reason}");
        Ok(cancelled)
    }

    /// Move an active booking to a new slot. The charge stays as it was.
    pub async fn reschedule_booking(
        &self,
        booking_id: Ulid,
        new_date: NaiveDate,
        new_start: NaiveTime,
        new_end: NaiveTime,
    ) -> Result<Booking, EngineError> {
        let result = self.reschedule_locked(booking_id, new_date, new_start, new_end).await;
        record("reschedule", &result);
        result
    }

    async fn reschedule_locked(
        &self,
        booking_id: Ulid,
        new_date: NaiveDate,
        new_start: NaiveTime,
        new_end: NaiveTime,
    ) -> Result<Booking, EngineError> {
        let span = validate_slot(new_start, new_end)?;
        let (_locks, booking) = self.lock_booking(booking_id).await?;
        if !booking.status.is_active() {
            return Err(EngineError::InvalidState {
                booking: booking_id,
                status: booking.status,
                action: "reschedule",
            });
        }
        self.check_slot_free(booking.coach_id, booking.student_id, new_date, &span, Some(booking_id))?;

        let moved = Booking {
            date: new_date,
            span,
            updated_at: Utc::now(),
            ..booking
        };
        self.commit(vec![Change::BookingWritten(moved.clone())]).await?;
        info!("booking {booking_id} moved to {new_date} {new_start}-{new_end}");
        Ok(moved)
    }

    pub async fn complete_booking(&self, booking_id: Ulid) -> Result<Booking, EngineError> {
        let result = self.finish(booking_id, BookingStatus::Completed, "complete").await;
        record("complete", &result);
        result
    }

    pub async fn mark_no_show(&self, booking_id: Ulid) -> Result<Booking, EngineError> {
        let result = self.finish(booking_id, BookingStatus::NoShow, "mark no-show").await;
        record("no_show", &result);
        result
    }

    /// Terminal transitions without credit movement.
    async fn finish(
        &self,
        booking_id: Ulid,
        to: BookingStatus,
        action: &'static str,
    ) -> Result<Booking, EngineError> {
        let (_locks, booking) = self.lock_booking(booking_id).await?;
        if !booking.status.can_transition(to) {
            return Err(EngineError::InvalidState {
                booking: booking_id,
                status: booking.status,
                action,
            });
        }
        let finished = Booking {
            status: to,
            updated_at: Utc::now(),
            ..booking
        };
        self.commit(vec![Change::BookingWritten(finished.clone())]).await?;
        info!("booking {booking_id} {to}");
        Ok(finished)
    }
}
