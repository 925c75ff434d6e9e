//! Point balances under optimistic concurrency.
//!
//! An attempt reads the account and its log without locking, plans the
//! posting against that snapshot, then commits only if the account version
//! is unchanged. A lost race re-reads and re-plans, so rate limits,
//! balance checks and duplicate detection always see the state the write
//! is applied to.

use chrono::{DateTime, Datelike, Local, NaiveDate, Utc};
use tracing::{debug, warn};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::conflict::local_today;
use super::{Engine, EngineError};

/// `total_earned` needed for each level; level N starts at index N-1.
pub const LEVEL_THRESHOLDS: [i64; 10] = [0, 100, 300, 600, 1_000, 1_500, 2_200, 3_000, 4_000, 5_500];

pub fn level_for(total_earned: i64) -> u32 {
    LEVEL_THRESHOLDS
        .partition_point(|&t| t <= total_earned)
        .max(1) as u32
}

/// The account state one attempt intends to write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Draft {
    amount: i64,
    balance: i64,
    total_earned: i64,
    total_spent: i64,
    level: u32,
    rule_id: Option<Ulid>,
}

fn overflow() -> EngineError {
    EngineError::InvalidInput("energy total out of range")
}

impl Draft {
    fn earned(account: &EnergyAccount, amount: i64, rule_id: Option<Ulid>) -> Result<Self, EngineError> {
        let total_earned = account.total_earned.checked_add(amount).ok_or_else(overflow)?;
        Ok(Self {
            amount,
            balance: account.balance.checked_add(amount).ok_or_else(overflow)?,
            total_earned,
            total_spent: account.total_spent,
            level: level_for(total_earned).max(account.level),
            rule_id,
        })
    }

    fn debited(account: &EnergyAccount, amount: i64) -> Result<Self, EngineError> {
        if account.balance < amount {
            return Err(EngineError::InsufficientBalance {
                balance: account.balance,
                requested: amount,
            });
        }
        Ok(Self {
            amount: -amount,
            balance: account.balance - amount,
            total_earned: account.total_earned,
            total_spent: account.total_spent.checked_add(amount).ok_or_else(overflow)?,
            level: account.level,
            rule_id: None,
        })
    }

    fn refunded(account: &EnergyAccount, amount: i64) -> Result<Self, EngineError> {
        if amount > account.total_spent {
            return Err(EngineError::InvalidInput("refund exceeds total spent"));
        }
        Ok(Self {
            amount,
            balance: account.balance.checked_add(amount).ok_or_else(overflow)?,
            total_earned: account.total_earned,
            total_spent: account.total_spent - amount,
            level: account.level,
            rule_id: None,
        })
    }
}

fn posting_label(kind: EnergyKind) -> &'static str {
    match kind {
        EnergyKind::Earn => "earn",
        EnergyKind::Spend => "spend",
        EnergyKind::Expire => "expire",
        EnergyKind::Adjust => "adjust",
        EnergyKind::Refund => "refund",
    }
}

/// Count a refused posting and hand the error back.
fn rejected(kind: EnergyKind, e: EngineError) -> EngineError {
    metrics::counter!(crate::observability::ENERGY_POSTINGS_TOTAL,
        "kind" => posting_label(kind), "outcome" => e.label())
    .increment(1);
    e
}

fn local_date(at: DateTime<Utc>) -> NaiveDate {
    at.with_timezone(&Local).date_naive()
}

/// Points already earned under `rule` today, this ISO week and this month.
fn window_totals(rule: &EnergyRule, log: &[EnergyTransaction], today: NaiveDate) -> (i64, i64, i64) {
    let week = today.iso_week();
    let week_start = today - chrono::Days::new(u64::from(today.weekday().num_days_from_monday()));
    let horizon = week_start.min(today.with_day(1).unwrap_or(today));

    let (mut day, mut this_week, mut month) = (0, 0, 0);
    // The log is in commit order, so walk back until past both windows.
    for entry in log.iter().rev() {
        let date = local_date(entry.created_at);
        if date < horizon {
            break;
        }
        if entry.kind != EnergyKind::Earn || entry.rule_id != Some(rule.id) {
            continue;
        }
        if date == today {
            day += entry.amount;
        }
        if date.iso_week() == week {
            this_week += entry.amount;
        }
        if date.year() == today.year() && date.month() == today.month() {
            month += entry.amount;
        }
    }
    (day, this_week, month)
}

pub(crate) fn check_rate_limits(
    rule: &EnergyRule,
    log: &[EnergyTransaction],
    today: NaiveDate,
) -> Result<(), EngineError> {
    let (day, week, month) = window_totals(rule, log, today);
    let windows = [
        ("daily", rule.daily_limit, day),
        ("weekly", rule.weekly_limit, week),
        ("monthly", rule.monthly_limit, month),
    ];
    for (window, cap, used) in windows {
        match cap {
            Some(cap) if used >= cap => {
                return Err(EngineError::RateLimited(format!(
                    "{window} limit of {cap} points reached for rule {}",
                    rule.code
                )));
            }
            _ => {}
        }
    }
    Ok(())
}

/// A reference may back at most one posting of each kind per student.
fn check_duplicate(log: &[EnergyTransaction], kind: EnergyKind, reference: &Reference) -> Result<(), EngineError> {
    if reference.id.is_empty() {
        return Ok(());
    }
    if log.iter().any(|t| t.kind == kind && t.reference == *reference) {
        return Err(EngineError::DuplicateReference {
            kind: reference.kind.clone(),
            id: reference.id.clone(),
            posting: posting_label(kind),
        });
    }
    Ok(())
}

fn validate_reference(reference: &Reference) -> Result<(), EngineError> {
    if reference.kind.len() > MAX_REFERENCE_LEN || reference.id.len() > MAX_REFERENCE_LEN {
        return Err(EngineError::InvalidInput("reference too long"));
    }
    Ok(())
}

fn validate_amount(amount: i64) -> Result<(), EngineError> {
    if amount <= 0 {
        return Err(EngineError::InvalidInput("amount must be positive"));
    }
    if amount > MAX_ENERGY_AMOUNT {
        return Err(EngineError::InvalidInput("amount too large"));
    }
    Ok(())
}

impl Engine {
    /// Award points for `rule_code`.
    pub async fn earn(
        &self,
        student_id: StudentId,
        rule_code: &str,
        reference: Reference,
        description: Option<String>,
    ) -> Result<Posting, EngineError> {
        validate_reference(&reference)?;
        let rule = self
            .tables
            .rules
            .get(rule_code)
            .filter(|r| r.active)
            .map(|r| r.value().clone())
            .ok_or_else(|| EngineError::UnknownRule(rule_code.to_string()))?;

        let dedupe = reference.clone();
        self.post(student_id, EnergyKind::Earn, reference, description, move |row, today| {
            check_duplicate(&row.log, EnergyKind::Earn, &dedupe)?;
            check_rate_limits(&rule, &row.log, today)?;
            Draft::earned(&row.account, rule.award(), Some(rule.id))
        })
        .await
    }

    pub async fn spend(
        &self,
        student_id: StudentId,
        amount: i64,
        reference: Reference,
        description: Option<String>,
    ) -> Result<Posting, EngineError> {
        validate_amount(amount)?;
        validate_reference(&reference)?;
        let dedupe = reference.clone();
        self.post(student_id, EnergyKind::Spend, reference, description, move |row, _| {
            check_duplicate(&row.log, EnergyKind::Spend, &dedupe)?;
            Draft::debited(&row.account, amount)
        })
        .await
    }

    /// Reverse a spend whose downstream effect failed.
    pub async fn refund(
        &self,
        student_id: StudentId,
        amount: i64,
        reference: Reference,
        description: Option<String>,
    ) -> Result<Posting, EngineError> {
        validate_amount(amount)?;
        validate_reference(&reference)?;
        let dedupe = reference.clone();
        self.post(student_id, EnergyKind::Refund, reference, description, move |row, _| {
            check_duplicate(&row.log, EnergyKind::Refund, &dedupe)?;
            Draft::refunded(&row.account, amount)
        })
        .await
    }

    /// Retire points, e.g. at the end of a season.
    pub async fn expire(
        &self,
        student_id: StudentId,
        amount: i64,
        reason: Option<String>,
    ) -> Result<Posting, EngineError> {
        validate_amount(amount)?;
        let reference = Reference::new("expire", "");
        self.post(student_id, EnergyKind::Expire, reference, reason, move |row, _| {
            Draft::debited(&row.account, amount)
        })
        .await
    }

    /// Manual correction by an operator. Positive deltas count as earned.
    pub async fn adjust(
        &self,
        student_id: StudentId,
        delta: i64,
        operator_id: OperatorId,
        reason: Option<String>,
    ) -> Result<Posting, EngineError> {
        if delta == 0 {
            return Err(EngineError::InvalidInput("adjustment must be non-zero"));
        }
        validate_amount(delta.abs())?;
        let reference = Reference::new("operator", operator_id.to_string());
        self.post(student_id, EnergyKind::Adjust, reference, reason, move |row, _| {
            if delta > 0 {
                Draft::earned(&row.account, delta, None)
            } else {
                Draft::debited(&row.account, -delta)
            }
        })
        .await
    }

    /// The bounded CAS loop shared by every posting kind.
    async fn post<F>(
        &self,
        student_id: StudentId,
        kind: EnergyKind,
        reference: Reference,
        description: Option<String>,
        plan: F,
    ) -> Result<Posting, EngineError>
    where
        F: Fn(&EnergyLedgerRow, NaiveDate) -> Result<Draft, EngineError>,
    {
        let max_attempts = self.config.energy_max_retries.max(1);
        for attempt in 1..=max_attempts {
            let (version, draft) = self.plan_attempt(student_id, &plan);
            let draft = match draft {
                Ok(d) => d,
                Err(e) => return Err(rejected(kind, e)),
            };

            if let Some(posting) = self
                .compare_and_swap(student_id, version, kind, draft, &reference, &description)
                .await?
            {
                metrics::counter!(crate::observability::ENERGY_POSTINGS_TOTAL,
                    "kind" => posting_label(kind), "outcome" => "ok")
                .increment(1);
                return Ok(posting);
            }

            metrics::counter!(crate::observability::ENERGY_CAS_RETRIES_TOTAL).increment(1);
            debug!("energy CAS lost for student {student_id} at version {version} (attempt {attempt})");
            if attempt < max_attempts {
                tokio::time::sleep(self.config.energy_backoff_delay(attempt)).await;
            }
        }

        // The winners may have moved the account to a state that refuses
        // this posting outright; that answer outranks the lost races.
        if let (_, Err(e)) = self.plan_attempt(student_id, &plan) {
            return Err(rejected(kind, e));
        }
        warn!("energy {} for student {student_id} gave up after {max_attempts} attempts", posting_label(kind));
        metrics::counter!(crate::observability::ENERGY_POSTINGS_TOTAL,
            "kind" => posting_label(kind), "outcome" => "concurrency_exhausted")
        .increment(1);
        Err(EngineError::ConcurrencyExhausted {
            attempts: max_attempts,
        })
    }

    /// Plan against the current account and its version. A student with no
    /// postings yet plans against a fresh account at version 0 that is not
    /// stored until the first posting commits.
    fn plan_attempt<F>(&self, student_id: StudentId, plan: &F) -> (u64, Result<Draft, EngineError>)
    where
        F: Fn(&EnergyLedgerRow, NaiveDate) -> Result<Draft, EngineError>,
    {
        let today = local_today();
        match self.tables.energy.get(&student_id) {
            Some(row) => (row.account.version, plan(row.value(), today)),
            None => {
                let fresh = EnergyLedgerRow {
                    account: EnergyAccount::new(student_id, Utc::now()),
                    log: Vec::new(),
                };
                (fresh.account.version, plan(&fresh, today))
            }
        }
    }

    /// `UPDATE ... WHERE version = expected`: `None` when another writer
    /// got there first.
    async fn compare_and_swap(
        &self,
        student_id: StudentId,
        expected_version: u64,
        kind: EnergyKind,
        draft: Draft,
        reference: &Reference,
        description: &Option<String>,
    ) -> Result<Option<Posting>, EngineError> {
        let _latch = self.lock_energy(student_id).await;
        let now = Utc::now();
        let current = self
            .tables
            .energy
            .get(&student_id)
            .map(|row| row.account.clone())
            .unwrap_or_else(|| EnergyAccount::new(student_id, now));
        if current.version != expected_version {
            return Ok(None);
        }

        let account = EnergyAccount {
            balance: draft.balance,
            total_earned: draft.total_earned,
            total_spent: draft.total_spent,
            level: draft.level,
            version: expected_version + 1,
            updated_at: now,
            ..current
        };
        let entry = EnergyTransaction {
            id: Ulid::new(),
            student_id,
            kind,
            amount: draft.amount,
            balance_after: account.balance,
            rule_id: draft.rule_id,
            reference: reference.clone(),
            description: description.clone(),
            created_at: now,
        };
        let posting = Posting {
            amount: draft.amount,
            balance: account.balance,
        };
        self.commit(vec![Change::EnergyPosted { account, entry }]).await?;
        Ok(Some(posting))
    }
}
