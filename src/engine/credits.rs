use chrono::{DateTime, Days, NaiveDate, Utc};
use tracing::info;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::conflict::local_today;
use super::{Engine, EngineError, RowRef};

fn expiry_from(card: &Card, today: NaiveDate) -> Option<NaiveDate> {
    card.duration_days
        .and_then(|d| today.checked_add_days(Days::new(u64::from(d))))
}

/// Status after `remaining_times` changes. Expired rows stay expired.
fn status_for(current: MembershipStatus, remaining: u32) -> MembershipStatus {
    match (current, remaining) {
        (MembershipStatus::Expired, _) => MembershipStatus::Expired,
        (_, 0) => MembershipStatus::Exhausted,
        _ => MembershipStatus::Active,
    }
}

impl Engine {
    /// The membership a booking should be charged to: chargeable today,
    /// soonest expiry first, open-ended last, oldest first on ties.
    /// Callers hold the student lock.
    pub(super) fn select_active(&self, student_id: StudentId, today: NaiveDate) -> Option<Membership> {
        let ids = self.tables.students.get(&student_id)?.memberships.clone();
        ids.iter()
            .filter_map(|id| self.tables.memberships.get(id).map(|m| m.value().clone()))
            .filter(|m| m.is_chargeable(today))
            .min_by_key(|m| (m.expire_date.is_none(), m.expire_date))
    }

    /// Changes moving `delta` credits on `current`: the membership row, the
    /// audit row and the student's mirrored counter. Callers hold the
    /// student lock and commit the result as part of their transaction.
    pub(super) fn credit_changes(
        &self,
        current: &Membership,
        delta: i64,
        kind: CreditKind,
        booking_id: Option<Ulid>,
        operator_id: Option<OperatorId>,
        now: DateTime<Utc>,
    ) -> Result<(Membership, Vec<Change>), EngineError> {
        let remaining = u32::try_from(i64::from(current.remaining_times) + delta)
            .map_err(|_| EngineError::InsufficientCredit(current.student_id))?;

        let counter = self
            .tables
            .students
            .get(&current.student_id)
            .map(|s| s.remaining_lessons)
            .ok_or(EngineError::NotFound(RowRef::Student(current.student_id)))?;

        let mut next = current.clone();
        next.remaining_times = remaining;
        next.status = status_for(current.status, remaining);
        next.updated_at = now;

        let txn = CreditTransaction {
            id: Ulid::new(),
            membership_id: current.id,
            student_id: current.student_id,
            kind,
            times_change: delta,
            booking_id,
            operator_id,
            created_at: now,
        };

        metrics::counter!(crate::observability::CREDIT_MOVEMENTS_TOTAL, "kind" => credit_label(kind))
            .increment(1);

        let changes = vec![
            Change::MembershipWritten(next.clone()),
            Change::CreditLogged(txn),
            Change::LessonCounterSet {
                student_id: current.student_id,
                remaining_lessons: counter + delta,
            },
        ];
        Ok((next, changes))
    }

    pub(super) fn debit_changes(
        &self,
        membership: &Membership,
        booking_id: Ulid,
        now: DateTime<Utc>,
    ) -> Result<Vec<Change>, EngineError> {
        self.credit_changes(membership, -1, CreditKind::Consume, Some(booking_id), None, now)
            .map(|(_, changes)| changes)
    }

    pub(super) fn refund_changes(
        &self,
        membership_id: Ulid,
        booking_id: Ulid,
        now: DateTime<Utc>,
    ) -> Result<Vec<Change>, EngineError> {
        let membership = self
            .tables
            .memberships
            .get(&membership_id)
            .map(|m| m.value().clone())
            .ok_or(EngineError::NotFound(RowRef::Membership(membership_id)))?;
        self.credit_changes(&membership, 1, CreditKind::Refund, Some(booking_id), None, now)
            .map(|(_, changes)| changes)
    }

    /// Administrative top-up of a student's membership on `card_id`.
    pub async fn recharge_membership(
        &self,
        student_id: StudentId,
        card_id: CardId,
        times: u32,
        operator_id: OperatorId,
    ) -> Result<Membership, EngineError> {
        self.top_up(student_id, card_id, Some(times), CreditKind::Manual, Some(operator_id))
            .await
    }

    /// Grant a card's standard allotment, recorded as a purchase.
    pub async fn purchase_membership(
        &self,
        student_id: StudentId,
        card_id: CardId,
        operator_id: Option<OperatorId>,
    ) -> Result<Membership, EngineError> {
        self.top_up(student_id, card_id, None, CreditKind::Purchase, operator_id)
            .await
    }

    async fn top_up(
        &self,
        student_id: StudentId,
        card_id: CardId,
        times: Option<u32>,
        kind: CreditKind,
        operator_id: Option<OperatorId>,
    ) -> Result<Membership, EngineError> {
        let card = self
            .tables
            .cards
            .get(&card_id)
            .filter(|c| c.active)
            .map(|c| c.value().clone())
            .ok_or(EngineError::NotFound(RowRef::Card(card_id)))?;
        let times = times.unwrap_or(card.times);
        if times == 0 {
            return Err(EngineError::InvalidInput("times must be positive"));
        }
        if times > MAX_RECHARGE_TIMES {
            return Err(EngineError::InvalidInput("times too large"));
        }

        let _student = self.lock_student(student_id).await?;
        let existing_ids = self
            .tables
            .students
            .get(&student_id)
            .map(|s| s.memberships.clone())
            .ok_or(EngineError::NotFound(RowRef::Student(student_id)))?;

        let today = local_today();
        let now = Utc::now();
        let existing = existing_ids
            .iter()
            .filter_map(|id| self.tables.memberships.get(id).map(|m| m.value().clone()))
            .find(|m| m.card_id == card_id);

        // A lapsed row restarts its validity when new lessons are bought.
        let base = match existing {
            Some(m)
                if m.status == MembershipStatus::Expired || m.expire_date.is_some_and(|d| d < today) =>
            {
                Membership {
                    status: MembershipStatus::Active,
                    expire_date: expiry_from(&card, today),
                    ..m
                }
            }
            Some(m) => m,
            None => Membership {
                id: Ulid::new(),
                student_id,
                card_id,
                remaining_times: 0,
                expire_date: expiry_from(&card, today),
                status: MembershipStatus::Exhausted,
                created_at: now,
                updated_at: now,
            },
        };

        let (next, changes) =
            self.credit_changes(&base, i64::from(times), kind, None, operator_id, now)?;
        self.commit(changes).await?;
        info!(
            "membership {} for student {student_id} on card {card_id}: +{times} ({:?}), {} remaining",
            next.id, kind, next.remaining_times
        );
        Ok(next)
    }

    /// Active memberships whose expiry date is before `today`.
    pub fn collect_expired_memberships(&self, today: NaiveDate) -> Vec<Ulid> {
        self.tables
            .memberships
            .iter()
            .filter(|m| {
                m.status == MembershipStatus::Active && m.expire_date.is_some_and(|d| d < today)
            })
            .map(|m| m.id)
            .collect()
    }

    /// Flip a past-due active membership to expired. Returns false if the
    /// row no longer qualifies (recharged or already expired meanwhile).
    pub async fn expire_membership(&self, membership_id: Ulid, today: NaiveDate) -> Result<bool, EngineError> {
        let student_id = self
            .tables
            .memberships
            .get(&membership_id)
            .map(|m| m.student_id)
            .ok_or(EngineError::NotFound(RowRef::Membership(membership_id)))?;

        let _student = self.lock_student(student_id).await?;
        let Some(mut membership) = self.tables.memberships.get(&membership_id).map(|m| m.value().clone()) else {
            return Err(EngineError::NotFound(RowRef::Membership(membership_id)));
        };
        let past_due = membership.expire_date.is_some_and(|d| d < today);
        if membership.status != MembershipStatus::Active || !past_due {
            return Ok(false);
        }

        membership.status = MembershipStatus::Expired;
        membership.updated_at = Utc::now();
        self.commit(vec![Change::MembershipWritten(membership)]).await?;
        metrics::counter!(crate::observability::MEMBERSHIPS_EXPIRED_TOTAL).increment(1);
        Ok(true)
    }
}

fn credit_label(kind: CreditKind) -> &'static str {
    match kind {
        CreditKind::Consume => "consume",
        CreditKind::Refund => "refund",
        CreditKind::Purchase => "purchase",
        CreditKind::Manual => "manual",
    }
}
