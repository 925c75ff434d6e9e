use tracing::info;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::{Engine, EngineError};

/// Input to `Engine::define_rule`. Redefining an existing code replaces
/// its settings and keeps its id, so past postings still count against
/// the new limits.
#[derive(Debug, Clone, PartialEq)]
pub struct RuleDefinition {
    pub code: String,
    pub name: String,
    pub points: i64,
    pub multiplier: f64,
    pub daily_limit: Option<i64>,
    pub weekly_limit: Option<i64>,
    pub monthly_limit: Option<i64>,
}

fn check_name(name: Option<&str>) -> Result<(), EngineError> {
    match name {
        Some(n) if n.len() > MAX_NAME_LEN => Err(EngineError::InvalidInput("name too long")),
        _ => Ok(()),
    }
}

impl Engine {
    /// Create the coach row, or rename it. Existing calendars are kept.
    pub async fn register_coach(&self, id: CoachId, name: Option<String>) -> Result<(), EngineError> {
        check_name(name.as_deref())?;
        self.commit(vec![Change::CoachRegistered { id, name }]).await?;
        info!("coach {id} registered");
        Ok(())
    }

    pub async fn register_student(&self, id: StudentId, name: Option<String>) -> Result<(), EngineError> {
        check_name(name.as_deref())?;
        self.commit(vec![Change::StudentRegistered { id, name }]).await?;
        info!("student {id} registered");
        Ok(())
    }

    /// Add or replace a card. Deactivated cards can no longer be sold or
    /// recharged; memberships already issued on them are unaffected.
    pub async fn define_card(&self, card: Card) -> Result<(), EngineError> {
        if card.name.is_empty() || card.name.len() > MAX_NAME_LEN {
            return Err(EngineError::InvalidInput("invalid card name"));
        }
        if card.times == 0 || card.times > MAX_RECHARGE_TIMES {
            return Err(EngineError::InvalidInput("card times out of range"));
        }
        if card.duration_days == Some(0) {
            return Err(EngineError::InvalidInput("card duration must be positive"));
        }
        let id = card.id;
        self.commit(vec![Change::CardDefined(card)]).await?;
        info!("card {id} defined");
        Ok(())
    }

    pub async fn define_rule(&self, def: RuleDefinition) -> Result<EnergyRule, EngineError> {
        if def.code.is_empty() || def.code.len() > MAX_RULE_CODE_LEN {
            return Err(EngineError::InvalidInput("invalid rule code"));
        }
        check_name(Some(&def.name))?;
        if def.points <= 0 || def.points > MAX_ENERGY_AMOUNT {
            return Err(EngineError::InvalidInput("rule points out of range"));
        }
        if !def.multiplier.is_finite() || def.multiplier <= 0.0 {
            return Err(EngineError::InvalidInput("rule multiplier must be positive"));
        }
        let limits = [def.daily_limit, def.weekly_limit, def.monthly_limit];
        if limits.iter().flatten().any(|&cap| cap <= 0) {
            return Err(EngineError::InvalidInput("rule limits must be positive"));
        }

        let id = self
            .tables
            .rules
            .get(&def.code)
            .map(|r| r.id)
            .unwrap_or_else(Ulid::new);
        let rule = EnergyRule {
            id,
            code: def.code,
            name: def.name,
            points: def.points,
            multiplier: def.multiplier,
            daily_limit: def.daily_limit,
            weekly_limit: def.weekly_limit,
            monthly_limit: def.monthly_limit,
            active: true,
        };
        if rule.award() <= 0 {
            return Err(EngineError::InvalidInput("rule awards no points"));
        }
        if rule.award() > MAX_ENERGY_AMOUNT {
            return Err(EngineError::InvalidInput("rule award too large"));
        }
        self.commit(vec![Change::RuleDefined(rule.clone())]).await?;
        info!("energy rule {} defined: {} points", rule.code, rule.award());
        Ok(rule)
    }

    pub async fn deactivate_rule(&self, code: &str) -> Result<(), EngineError> {
        let mut rule = self
            .tables
            .rules
            .get(code)
            .map(|r| r.value().clone())
            .ok_or_else(|| EngineError::UnknownRule(code.to_string()))?;
        rule.active = false;
        self.commit(vec![Change::RuleDefined(rule)]).await?;
        info!("energy rule {code} deactivated");
        Ok(())
    }
}
