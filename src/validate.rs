// ===============================
// src/validate.rs
// ===============================
//
// Validator chain run against every prospective state before commit.
// Each validator sees the committed state and the draft; the first failure
// wins and the draft is thrown away.
//
use rust_decimal::Decimal;

use crate::domain::StateSnapshot;
use crate::error::{EngineError, EngineResult};

pub trait Validator: Send + Sync {
    fn name(&self) -> &'static str;
    fn check(&self, prev: &StateSnapshot, next: &StateSnapshot) -> EngineResult<()>;
}

pub struct NonNegativeBalance;

impl Validator for NonNegativeBalance {
    fn name(&self) -> &'static str { "non_negative_balance" }

    fn check(&self, _prev: &StateSnapshot, next: &StateSnapshot) -> EngineResult<()> {
        if next.balance < Decimal::ZERO {
            return Err(EngineError::validation("balance", format!("would become negative ({})", next.balance)));
        }
        Ok(())
    }
}

/// Decimals cannot be NaN/inf, so "finite" here means every quantity is in
/// its legal range.
pub struct NumericBounds;

impl Validator for NumericBounds {
    fn name(&self) -> &'static str { "numeric_bounds" }

    fn check(&self, _prev: &StateSnapshot, next: &StateSnapshot) -> EngineResult<()> {
        if next.price < Decimal::ZERO {
            return Err(EngineError::validation("price", "negative"));
        }
        if let Some(p) = &next.position {
            if p.entry_price <= Decimal::ZERO {
                return Err(EngineError::validation("entry_price", "must be > 0"));
            }
            if p.amount <= Decimal::ZERO || p.amount > p.entry_amount {
                return Err(EngineError::validation(
                    "position.amount",
                    format!("{} outside (0, {}]", p.amount, p.entry_amount),
                ));
            }
            if p.closed_lots.iter().any(|l| l.amount < Decimal::ZERO || l.payout < Decimal::ZERO) {
                return Err(EngineError::validation("closed_lots", "negative lot"));
            }
        }
        if let Some(sb) = &next.side_bet {
            if sb.amount <= Decimal::ZERO {
                return Err(EngineError::validation("side_bet.amount", "must be > 0"));
            }
            if sb.expiry_tick < sb.placed_at_tick {
                return Err(EngineError::validation("side_bet.expiry_tick", "before placement"));
            }
        }
        Ok(())
    }
}

/// At most one open position and one live side bet: a draft may keep the
/// existing one, drop it, or create one where none existed, never swap it.
pub struct SingleActive;

impl Validator for SingleActive {
    fn name(&self) -> &'static str { "single_active" }

    fn check(&self, prev: &StateSnapshot, next: &StateSnapshot) -> EngineResult<()> {
        if let (Some(a), Some(b)) = (&prev.position, &next.position) {
            if a.opened_at_tick != b.opened_at_tick || a.entry_price != b.entry_price {
                return Err(EngineError::validation("position", "a position is already open"));
            }
        }
        if let (Some(a), Some(b)) = (&prev.side_bet, &next.side_bet) {
            if a.placed_at_tick != b.placed_at_tick || a.amount != b.amount {
                return Err(EngineError::validation("side_bet", "a side bet is already active"));
            }
        }
        if next.side_bet.as_ref().map(|s| s.resolved).unwrap_or(false) {
            return Err(EngineError::validation("side_bet", "resolved bet left active"));
        }
        Ok(())
    }
}

pub fn default_chain() -> Vec<Box<dyn Validator>> {
    vec![Box::new(NonNegativeBalance), Box::new(NumericBounds), Box::new(SingleActive)]
}

pub fn run_chain(chain: &[Box<dyn Validator>], prev: &StateSnapshot, next: &StateSnapshot) -> EngineResult<()> {
    for v in chain {
        v.check(prev, next)?;
    }
    Ok(())
}
