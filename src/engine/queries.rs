use chrono::{NaiveDate, Utc};
use ulid::Ulid;

use crate::model::*;

use super::{Engine, EngineError, RowRef};

impl Engine {
    pub fn get_booking(&self, id: &Ulid) -> Option<Booking> {
        self.tables.bookings.get(id).map(|b| b.value().clone())
    }

    /// Active bookings on the coach's calendar for `date`, by start time.
    pub fn coach_schedule(&self, coach_id: CoachId, date: NaiveDate) -> Result<Vec<Booking>, EngineError> {
        let slots = self
            .tables
            .coaches
            .get(&coach_id)
            .map(|c| c.schedule.day(date).to_vec())
            .ok_or(EngineError::NotFound(RowRef::Coach(coach_id)))?;
        Ok(self.resolve(&slots))
    }

    pub fn student_schedule(&self, student_id: StudentId, date: NaiveDate) -> Result<Vec<Booking>, EngineError> {
        let slots = self
            .tables
            .students
            .get(&student_id)
            .map(|s| s.schedule.day(date).to_vec())
            .ok_or(EngineError::NotFound(RowRef::Student(student_id)))?;
        Ok(self.resolve(&slots))
    }

    fn resolve(&self, slots: &[Slot]) -> Vec<Booking> {
        slots
            .iter()
            .filter_map(|slot| self.get_booking(&slot.booking_id))
            .collect()
    }

    /// Every booking the student has held, any status, oldest first.
    pub fn student_bookings(&self, student_id: StudentId) -> Vec<Booking> {
        let mut out: Vec<Booking> = self
            .tables
            .bookings
            .iter()
            .filter(|b| b.student_id == student_id)
            .map(|b| b.value().clone())
            .collect();
        out.sort_by_key(|b| b.id);
        out
    }

    pub fn student(&self, id: StudentId) -> Option<StudentInfo> {
        self.tables.students.get(&id).map(|s| StudentInfo {
            id: s.id,
            name: s.name.clone(),
            remaining_lessons: s.remaining_lessons,
        })
    }

    /// The student's memberships in creation order.
    pub fn memberships(&self, student_id: StudentId) -> Vec<Membership> {
        let Some(ids) = self.tables.students.get(&student_id).map(|s| s.memberships.clone()) else {
            return Vec::new();
        };
        ids.iter()
            .filter_map(|id| self.tables.memberships.get(id).map(|m| m.value().clone()))
            .collect()
    }

    pub fn membership(&self, id: &Ulid) -> Option<Membership> {
        self.tables.memberships.get(id).map(|m| m.value().clone())
    }

    pub fn credit_transactions(&self, membership_id: &Ulid) -> Vec<CreditTransaction> {
        self.tables
            .credit_log
            .get(membership_id)
            .map(|log| log.value().clone())
            .unwrap_or_default()
    }

    /// The student's account. Students with no postings yet read as a
    /// fresh level-1 account.
    pub fn energy_account(&self, student_id: StudentId) -> EnergyAccount {
        self.tables
            .energy
            .get(&student_id)
            .map(|row| row.account.clone())
            .unwrap_or_else(|| EnergyAccount::new(student_id, Utc::now()))
    }

    /// Energy postings in commit order.
    pub fn energy_transactions(&self, student_id: StudentId) -> Vec<EnergyTransaction> {
        self.tables
            .energy
            .get(&student_id)
            .map(|row| row.log.clone())
            .unwrap_or_default()
    }

    pub fn postings_for_reference(&self, student_id: StudentId, reference: &Reference) -> Vec<EnergyTransaction> {
        self.tables
            .energy
            .get(&student_id)
            .map(|row| {
                row.log
                    .iter()
                    .filter(|t| t.reference == *reference)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn rule(&self, code: &str) -> Option<EnergyRule> {
        self.tables.rules.get(code).map(|r| r.value().clone())
    }

    pub fn card(&self, id: CardId) -> Option<Card> {
        self.tables.cards.get(&id).map(|c| c.value().clone())
    }
}
