use dashmap::DashMap;
use ulid::Ulid;

use crate::model::*;

/// Row tables. Every mutation goes through `apply`, both for live commits
/// and for WAL replay, so the two can never disagree.
#[derive(Default)]
pub struct Tables {
    pub(super) coaches: DashMap<CoachId, CoachRow>,
    pub(super) students: DashMap<StudentId, StudentRow>,
    pub(super) bookings: DashMap<Ulid, Booking>,
    pub(super) memberships: DashMap<Ulid, Membership>,
    /// Credit ledger keyed by membership id, in commit order.
    pub(super) credit_log: DashMap<Ulid, Vec<CreditTransaction>>,
    pub(super) cards: DashMap<CardId, Card>,
    /// Energy rules keyed by code.
    pub(super) rules: DashMap<String, EnergyRule>,
    pub(super) energy: DashMap<StudentId, EnergyLedgerRow>,
}

impl Tables {
    pub fn apply(&self, change: &Change) {
        match change {
            Change::CoachRegistered { id, name } => {
                self.coaches
                    .entry(*id)
                    .and_modify(|c| c.name = name.clone())
                    .or_insert_with(|| CoachRow {
                        id: *id,
                        name: name.clone(),
                        schedule: Schedule::default(),
                    });
            }
            Change::StudentRegistered { id, name } => {
                self.students
                    .entry(*id)
                    .and_modify(|s| s.name = name.clone())
                    .or_insert_with(|| StudentRow {
                        id: *id,
                        name: name.clone(),
                        ..StudentRow::default()
                    });
            }
            Change::CardDefined(card) => {
                self.cards.insert(card.id, card.clone());
            }
            Change::RuleDefined(rule) => {
                self.rules.insert(rule.code.clone(), rule.clone());
            }
            Change::BookingWritten(booking) => self.write_booking(booking),
            Change::MembershipWritten(membership) => {
                let is_new = self
                    .memberships
                    .insert(membership.id, membership.clone())
                    .is_none();
                if is_new
                    && let Some(mut student) = self.students.get_mut(&membership.student_id) {
                        student.memberships.push(membership.id);
                    }
            }
            Change::CreditLogged(txn) => {
                self.credit_log
                    .entry(txn.membership_id)
                    .or_default()
                    .push(txn.clone());
            }
            Change::LessonCounterSet {
                student_id,
                remaining_lessons,
            } => {
                if let Some(mut student) = self.students.get_mut(student_id) {
                    student.remaining_lessons = *remaining_lessons;
                }
            }
            Change::EnergyPosted { account, entry } => {
                let mut row = self
                    .energy
                    .entry(account.student_id)
                    .or_insert_with(|| EnergyLedgerRow {
                        account: account.clone(),
                        log: Vec::new(),
                    });
                row.account = account.clone();
                row.log.push(entry.clone());
            }
            Change::EnergyRestored { account, log } => {
                self.energy.insert(
                    account.student_id,
                    EnergyLedgerRow {
                        account: account.clone(),
                        log: log.clone(),
                    },
                );
            }
        }
    }

    /// Overwrite a booking row and move its slot on both calendars.
    fn write_booking(&self, booking: &Booking) {
        let previous = self.bookings.insert(booking.id, booking.clone());
        let vacate = previous
            .as_ref()
            .filter(|p| p.status.is_active())
            .map(|p| p.date);

        if let Some(mut coach) = self.coaches.get_mut(&booking.coach_id) {
            if let Some(date) = vacate {
                coach.schedule.remove(date, booking.id);
            }
            if booking.status.is_active() {
                coach.schedule.insert(booking.date, booking.slot());
            }
        }
        if let Some(mut student) = self.students.get_mut(&booking.student_id) {
            if let Some(date) = vacate {
                student.schedule.remove(date, booking.id);
            }
            if booking.status.is_active() {
                student.schedule.insert(booking.date, booking.slot());
            }
        }
    }

    /// A single commit that recreates the current state from empty.
    /// The caller must keep other commits out while this runs.
    pub fn snapshot(&self) -> Commit {
        let mut changes = Vec::new();

        for coach in self.coaches.iter() {
            changes.push(Change::CoachRegistered {
                id: coach.id,
                name: coach.name.clone(),
            });
        }
        let mut counters = Vec::new();
        let mut membership_ids = Vec::new();
        for student in self.students.iter() {
            changes.push(Change::StudentRegistered {
                id: student.id,
                name: student.name.clone(),
            });
            counters.push((student.id, student.remaining_lessons));
            membership_ids.extend(student.memberships.iter().copied());
        }
        for card in self.cards.iter() {
            changes.push(Change::CardDefined(card.clone()));
        }
        for rule in self.rules.iter() {
            changes.push(Change::RuleDefined(rule.clone()));
        }
        // Per-student creation order is preserved so selector tie-breaks survive.
        for id in membership_ids {
            if let Some(m) = self.memberships.get(&id) {
                changes.push(Change::MembershipWritten(m.clone()));
            }
            if let Some(log) = self.credit_log.get(&id) {
                changes.extend(log.iter().cloned().map(Change::CreditLogged));
            }
        }
        for (student_id, remaining_lessons) in counters {
            changes.push(Change::LessonCounterSet {
                student_id,
                remaining_lessons,
            });
        }
        for booking in self.bookings.iter() {
            changes.push(Change::BookingWritten(booking.clone()));
        }
        for row in self.energy.iter() {
            // Untouched lazily-created accounts have nothing durable yet.
            if row.account.version == 0 && row.log.is_empty() {
                continue;
            }
            changes.push(Change::EnergyRestored {
                account: row.account.clone(),
                log: row.log.clone(),
            });
        }

        Commit { changes }
    }
}
