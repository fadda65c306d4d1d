// ===============================
// src/strategy.rs
// ===============================
//
// Decision functions yang bisa dipasang ke DecisionExecutor:
// 1) Passive         -> selalu NoOp (default; useful for pure replay)
// 2) MeanReversion   -> open saat harga < fair - edge, close saat > fair + edge
//
// The heuristics here are illustrative; anything implementing `DecisionFn`
// (closures included) can be plugged in.
//
use std::collections::VecDeque;

use rust_decimal::Decimal;
use thiserror::Error;

use crate::domain::{Action, Decision, DecisionInput};

#[derive(Debug, Error)]
pub enum DecisionError {
    #[error("decision failed: {0}")]
    Failed(String),
    #[error("not enough data: {0}")]
    Warmup(&'static str),
}

pub trait DecisionFn: Send + 'static {
    fn name(&self) -> &'static str { "anonymous" }
    fn decide(&mut self, input: &DecisionInput) -> Result<Decision, DecisionError>;
}

impl<F> DecisionFn for F
where
    F: FnMut(&DecisionInput) -> Result<Decision, DecisionError> + Send + 'static,
{
    fn decide(&mut self, input: &DecisionInput) -> Result<Decision, DecisionError> {
        self(input)
    }
}

pub struct Passive;

impl DecisionFn for Passive {
    fn name(&self) -> &'static str { "passive" }

    fn decide(&mut self, _input: &DecisionInput) -> Result<Decision, DecisionError> {
        Ok(Decision::noop("passive"))
    }
}

// -----------------------------------------------------------------------------
// MEAN-REVERSION
//    Ide: rata-rata N tick terakhir = fair.
//         harga < fair - edge -> OpenPosition(stake)
//         harga > fair + edge -> ClosePosition(1.0)
//    Window di-reset tiap ganti session.
// -----------------------------------------------------------------------------
pub struct MeanReversion {
    window: VecDeque<Decimal>,
    sum: Decimal,
    w: usize,
    edge: Decimal,
    stake: Decimal,
    session: Option<String>,
    last_tick: Option<u64>,
}

impl MeanReversion {
    pub fn new(w: usize, edge: Decimal, stake: Decimal) -> Self {
        let w = w.max(1);
        Self { window: VecDeque::with_capacity(w), sum: Decimal::ZERO, w, edge, stake, session: None, last_tick: None }
    }

    fn fair(&self) -> Option<Decimal> {
        if self.window.len() >= self.w { Some(self.sum / Decimal::from(self.w as u64)) } else { None }
    }

    fn push(&mut self, px: Decimal) {
        if self.window.len() == self.w {
            if let Some(x) = self.window.pop_front() { self.sum -= x; }
        }
        self.window.push_back(px);
        self.sum += px;
    }
}

impl Default for MeanReversion {
    fn default() -> Self {
        // window 16 tick, edge 0.05, stake 0.005
        Self::new(16, Decimal::new(5, 2), Decimal::new(5, 3))
    }
}

impl DecisionFn for MeanReversion {
    fn name(&self) -> &'static str { "mean_reversion" }

    fn decide(&mut self, input: &DecisionInput) -> Result<Decision, DecisionError> {
        let snap = &input.snapshot;
        if snap.session_id != self.session {
            self.window.clear();
            self.sum = Decimal::ZERO;
            self.session = snap.session_id.clone();
            self.last_tick = None;
        }
        // same tick seen twice (e.g. after an action commit): don't double count
        if snap.current_tick.is_some() && snap.current_tick != self.last_tick {
            self.push(snap.price);
            self.last_tick = snap.current_tick;
        }
        let fair = self.fair().ok_or(DecisionError::Warmup("window not full"))?;
        let px = snap.price;

        if input.can_open_position && px < fair - self.edge && snap.balance >= self.stake {
            return Ok(Decision {
                action: Action::OpenPosition(self.stake),
                rationale: format!("price {px} below fair {fair} - {}", self.edge),
            });
        }
        if snap.position.is_some() && px > fair + self.edge {
            return Ok(Decision {
                action: Action::ClosePosition(Decimal::ONE),
                rationale: format!("price {px} above fair {fair} + {}", self.edge),
            });
        }
        Ok(Decision::noop("inside band"))
    }
}
