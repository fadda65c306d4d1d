// ===============================
// src/domain.rs
// ===============================
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::EngineError;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Phase {
    #[default]
    Presale,
    Active,
    Cooldown,
    Rugged,
}

/// One immutable timestep of a session. `timestamp` is epoch milliseconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tick {
    pub session_id: String,
    pub sequence_number: u64,
    pub price: Decimal,
    pub phase: Phase,
    #[serde(default)]
    pub is_terminal: bool,
    #[serde(default)]
    pub timestamp: i64,
}

impl Tick {
    /// Structural checks that do not need any state (session id, price sign).
    pub fn validate(&self) -> Result<(), EngineError> {
        if self.session_id.trim().is_empty() {
            return Err(EngineError::Malformed { reason: "empty session_id".into() });
        }
        if self.price.is_sign_negative() && !self.price.is_zero() {
            return Err(EngineError::Malformed {
                reason: format!("negative price {}", self.price),
            });
        }
        Ok(())
    }
}

/// A slice of a position that has been closed. Append-only per position.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClosedLot {
    pub fraction: Decimal,
    pub amount: Decimal,
    pub exit_price: Decimal,
    pub exit_tick: u64,
    pub payout: Decimal,
    pub pnl: Decimal,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Position {
    pub entry_price: Decimal,
    /// Stake at open; never changes.
    pub entry_amount: Decimal,
    /// Stake still open.
    pub amount: Decimal,
    pub opened_at_tick: u64,
    pub closed_lots: Vec<ClosedLot>,
}

impl Position {
    pub fn realized_pnl(&self) -> Decimal {
        self.closed_lots.iter().map(|l| l.pnl).sum()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SideBet {
    pub amount: Decimal,
    pub placed_at_tick: u64,
    pub expiry_tick: u64,
    pub resolved: bool,
}

/// Immutable, fully committed copy of the trading state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateSnapshot {
    /// Commit counter, bumped by every successful mutation.
    pub version: u64,
    pub session_id: Option<String>,
    pub balance: Decimal,
    pub current_tick: Option<u64>,
    pub price: Decimal,
    pub phase: Phase,
    pub position: Option<Position>,
    pub side_bet: Option<SideBet>,
    pub terminal_detected: bool,
}

impl StateSnapshot {
    pub fn can_open_position(&self) -> bool {
        self.phase == Phase::Active
            && !self.terminal_detected
            && self.position.is_none()
            && self.balance > Decimal::ZERO
    }

    pub fn can_place_side_bet(&self) -> bool {
        self.phase == Phase::Active
            && !self.terminal_detected
            && self.side_bet.is_none()
            && self.balance > Decimal::ZERO
    }
}

// ---- Decision function contract ----

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value")]
pub enum Action {
    OpenPosition(Decimal),
    /// Fraction of the remaining stake; `>= 1` closes everything.
    ClosePosition(Decimal),
    PlaceSideBet(Decimal),
    NoOp,
}

impl Action {
    pub fn label(&self) -> &'static str {
        match self {
            Action::OpenPosition(_) => "open_position",
            Action::ClosePosition(_) => "close_position",
            Action::PlaceSideBet(_) => "place_side_bet",
            Action::NoOp => "noop",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Decision {
    pub action: Action,
    pub rationale: String,
}

impl Decision {
    pub fn noop(rationale: impl Into<String>) -> Self {
        Self { action: Action::NoOp, rationale: rationale.into() }
    }
}

/// What a decision function sees: the snapshot plus derived flags.
#[derive(Debug, Clone)]
pub struct DecisionInput {
    pub snapshot: std::sync::Arc<StateSnapshot>,
    pub can_open_position: bool,
    pub can_place_side_bet: bool,
}

impl DecisionInput {
    pub fn from_snapshot(snapshot: std::sync::Arc<StateSnapshot>) -> Self {
        let can_open_position = snapshot.can_open_position();
        let can_place_side_bet = snapshot.can_place_side_bet();
        Self { snapshot, can_open_position, can_place_side_bet }
    }
}

// ---- Dispatcher / recorder ----

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PlaybackState { Stopped, Playing, Paused, Live }

impl PlaybackState {
    pub fn as_gauge(&self) -> i64 {
        match self {
            PlaybackState::Stopped => 0,
            PlaybackState::Playing => 1,
            PlaybackState::Paused => 2,
            PlaybackState::Live => 3,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordingSummary {
    pub session_id: String,
    pub path: String,
    pub tick_count: u64,
    pub byte_count: u64,
}

// ---- Events ----

/// Everything the engine advertises on the bus. Payloads are explicit structs,
/// so consumers never go looking for keys that might not be there.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", content = "payload")]
pub enum EngineEvent {
    TickApplied { tick: Tick, snapshot: StateSnapshot },
    TickRejected { session_id: Option<String>, sequence_number: Option<u64>, reason: String },
    PositionOpened { snapshot: StateSnapshot },
    PositionPartiallyClosed { lot: ClosedLot, snapshot: StateSnapshot },
    PositionClosed { lot: ClosedLot, snapshot: StateSnapshot },
    /// Forced settlement at a terminal tick or session end.
    PositionSettled { lot: ClosedLot, snapshot: StateSnapshot },
    SideBetPlaced { snapshot: StateSnapshot },
    SideBetResolved { won: bool, payout: Decimal, snapshot: StateSnapshot },
    BalanceUpdated { delta: Decimal, snapshot: StateSnapshot },
    SessionStarted { session_id: String, start_tick: u64 },
    SessionEnded { session_id: String, ticks: u64, snapshot: StateSnapshot },
    StateReset { previous_session: Option<String>, snapshot: StateSnapshot },
    PlaybackChanged { from: PlaybackState, to: PlaybackState },
    Progress { position: u64, total: Option<u64> },
    SourceError { message: String },
    DecisionMade { version: u64, action: Action, rationale: String, applied: bool, error: Option<String> },
    DecisionFailed { version: u64, reason: String },
    RecordingStopped { summary: RecordingSummary },
}

impl EngineEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            EngineEvent::TickApplied { .. } => "TickApplied",
            EngineEvent::TickRejected { .. } => "TickRejected",
            EngineEvent::PositionOpened { .. } => "PositionOpened",
            EngineEvent::PositionPartiallyClosed { .. } => "PositionPartiallyClosed",
            EngineEvent::PositionClosed { .. } => "PositionClosed",
            EngineEvent::PositionSettled { .. } => "PositionSettled",
            EngineEvent::SideBetPlaced { .. } => "SideBetPlaced",
            EngineEvent::SideBetResolved { .. } => "SideBetResolved",
            EngineEvent::BalanceUpdated { .. } => "BalanceUpdated",
            EngineEvent::SessionStarted { .. } => "SessionStarted",
            EngineEvent::SessionEnded { .. } => "SessionEnded",
            EngineEvent::StateReset { .. } => "StateReset",
            EngineEvent::PlaybackChanged { .. } => "PlaybackChanged",
            EngineEvent::Progress { .. } => "Progress",
            EngineEvent::SourceError { .. } => "SourceError",
            EngineEvent::DecisionMade { .. } => "DecisionMade",
            EngineEvent::DecisionFailed { .. } => "DecisionFailed",
            EngineEvent::RecordingStopped { .. } => "RecordingStopped",
        }
    }

    /// Snapshot carried by state mutation events, if any.
    pub fn snapshot(&self) -> Option<&StateSnapshot> {
        match self {
            EngineEvent::TickApplied { snapshot, .. }
            | EngineEvent::PositionOpened { snapshot }
            | EngineEvent::PositionPartiallyClosed { snapshot, .. }
            | EngineEvent::PositionClosed { snapshot, .. }
            | EngineEvent::PositionSettled { snapshot, .. }
            | EngineEvent::SideBetPlaced { snapshot }
            | EngineEvent::SideBetResolved { snapshot, .. }
            | EngineEvent::BalanceUpdated { snapshot, .. }
            | EngineEvent::SessionEnded { snapshot, .. }
            | EngineEvent::StateReset { snapshot, .. } => Some(snapshot),
            _ => None,
        }
    }
}
