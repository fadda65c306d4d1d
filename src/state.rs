// ===============================
// src/state.rs (StateStore)
// ===============================
//
// Satu-satunya state yang di-mutasi dari banyak task.
// - Every mutator: lock -> build draft -> validator chain -> commit or drop.
// - A mutator may commit several drafts (tick, side bet, settle). They are
//   staged and only become visible, in history and to readers, when the
//   whole mutation succeeds; any failure rolls back to where it started.
// - Events are collected while locked and published only after the lock is
//   released, so a subscriber never runs under the state lock.
// - Readers take `get_snapshot()`, an Arc out of a watch channel, and never
//   touch the mutation lock.
//
use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use tokio::sync::watch;
use tokio::time::Duration;
use tracing::{debug, info};

use crate::bus::{self, EventBus};
use crate::config::StoreConfig;
use crate::domain::{
    Action, ClosedLot, EngineEvent, Phase, Position, SideBet, StateSnapshot, Tick,
};
use crate::error::{EngineError, EngineResult};
use crate::metrics::{BALANCE_MILLI, MUTATIONS_REJECTED, TICKS_APPLIED};
use crate::validate::{self, Validator};

/// One transaction-log entry.
#[derive(Debug, Clone)]
pub struct HistoryEntry {
    pub version: u64,
    pub op: &'static str,
    pub snapshot: Arc<StateSnapshot>,
}

struct Inner {
    state: StateSnapshot,
    session_ticks: u64,
    history: VecDeque<HistoryEntry>,
    staged: Vec<HistoryEntry>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CloseKind { Partial, Full, Forced }

pub struct StateStore {
    cfg: StoreConfig,
    inner: Mutex<Inner>,
    validators: Vec<Box<dyn Validator>>,
    snap_tx: watch::Sender<Arc<StateSnapshot>>,
    bus: Option<Arc<EventBus>>,
}

impl StateStore {
    pub fn new(cfg: StoreConfig, bus: Option<Arc<EventBus>>) -> Self {
        Self::with_validators(cfg, bus, validate::default_chain())
    }

    pub fn with_validators(cfg: StoreConfig, bus: Option<Arc<EventBus>>, validators: Vec<Box<dyn Validator>>) -> Self {
        let state = StateSnapshot { balance: cfg.initial_balance, ..Default::default() };
        let (snap_tx, _) = watch::channel(Arc::new(state.clone()));
        let history = VecDeque::with_capacity(cfg.history_capacity.min(1024));
        Self {
            cfg,
            inner: Mutex::new(Inner { state, session_ticks: 0, history, staged: Vec::new() }),
            validators,
            snap_tx,
            bus,
        }
    }

    // ---------------------------------------------------------------------
    // Readers
    // ---------------------------------------------------------------------

    /// Latest committed snapshot. Safe from any thread, including callbacks.
    pub fn get_snapshot(&self) -> Arc<StateSnapshot> {
        self.snap_tx.borrow().clone()
    }

    pub fn subscribe_snapshots(&self) -> watch::Receiver<Arc<StateSnapshot>> {
        self.snap_tx.subscribe()
    }

    pub fn history(&self) -> EngineResult<Vec<HistoryEntry>> {
        Ok(self.lock()?.history.iter().cloned().collect())
    }

    pub fn history_len(&self) -> EngineResult<usize> {
        Ok(self.lock()?.history.len())
    }

    pub fn config(&self) -> &StoreConfig { &self.cfg }

    // ---------------------------------------------------------------------
    // Mutators
    // ---------------------------------------------------------------------

    pub fn apply_tick(&self, tick: &Tick) -> EngineResult<Arc<StateSnapshot>> {
        let snap = self.run("apply_tick", |inner, events| self.apply_tick_locked(inner, tick, events))?;
        TICKS_APPLIED.inc();
        Ok(snap)
    }

    pub fn open_position(&self, amount: Decimal) -> EngineResult<Arc<StateSnapshot>> {
        self.run("open_position", |inner, events| self.open_position_locked(inner, amount, events))
    }

    pub fn close_position(&self) -> EngineResult<Arc<StateSnapshot>> {
        self.run("close_position", |inner, events| {
            self.close_locked(inner, Decimal::ONE, CloseKind::Full, events)
        })
    }

    /// Close `fraction` (0 < f < 1) of the remaining stake against the
    /// original entry price.
    pub fn partial_close(&self, fraction: Decimal) -> EngineResult<Arc<StateSnapshot>> {
        self.run("partial_close", |inner, events| {
            if fraction <= Decimal::ZERO || fraction >= Decimal::ONE {
                return Err(EngineError::validation("fraction", format!("{fraction} not in (0, 1)")));
            }
            self.close_locked(inner, fraction, CloseKind::Partial, events)
        })
    }

    pub fn place_side_bet(&self, amount: Decimal) -> EngineResult<Arc<StateSnapshot>> {
        self.run("place_side_bet", |inner, events| self.place_side_bet_locked(inner, amount, events))
    }

    pub fn resolve_side_bet(&self, won: bool) -> EngineResult<Arc<StateSnapshot>> {
        self.run("resolve_side_bet", |inner, events| self.resolve_side_bet_locked(inner, won, events))
    }

    /// Signed balance adjustment.
    pub fn update_balance(&self, delta: Decimal) -> EngineResult<Arc<StateSnapshot>> {
        self.run("update_balance", |inner, events| {
            let mut draft = inner.state.clone();
            draft.balance += delta;
            let snap = self.commit(inner, "update_balance", draft)?;
            events.push(EngineEvent::BalanceUpdated { delta, snapshot: (*snap).clone() });
            Ok(snap)
        })
    }

    /// Maps a decision onto the matching mutator. `NoOp` returns the current
    /// snapshot and publishes nothing.
    pub fn apply_action(&self, action: &Action) -> EngineResult<Arc<StateSnapshot>> {
        match *action {
            Action::OpenPosition(amount) => self.open_position(amount),
            Action::ClosePosition(fraction) if fraction >= Decimal::ONE => self.close_position(),
            Action::ClosePosition(fraction) => self.partial_close(fraction),
            Action::PlaceSideBet(amount) => self.place_side_bet(amount),
            Action::NoOp => Ok(self.get_snapshot()),
        }
    }

    /// End of session: force-settle anything still open at the last price
    /// (an unresolved side bet is lost), then announce `SessionEnded`.
    /// Returns `None` when there is no session.
    pub fn end_session(&self) -> EngineResult<Option<Arc<StateSnapshot>>> {
        self.run("end_session", |inner, events| self.end_session_locked(inner, events))
    }

    /// Clear every per-session field. Balance (and the commit counter) carry
    /// over.
    pub fn reset_session(&self) -> EngineResult<Arc<StateSnapshot>> {
        self.run("reset_session", |inner, events| {
            let previous_session = inner.state.session_id.clone();
            let draft = StateSnapshot {
                version: inner.state.version,
                balance: inner.state.balance,
                ..Default::default()
            };
            let snap = self.commit(inner, "reset_session", draft)?;
            inner.session_ticks = 0;
            debug!(previous = ?previous_session, "state reset");
            events.push(EngineEvent::StateReset { previous_session, snapshot: (*snap).clone() });
            Ok(snap)
        })
    }

    // ---------------------------------------------------------------------
    // Internals
    // ---------------------------------------------------------------------

    fn lock_for(&self, op: &'static str) -> EngineResult<MutexGuard<'_, Inner>> {
        if bus::in_callback() {
            return Err(EngineError::Reentrant { op });
        }
        self.lock()
    }

    fn lock(&self) -> EngineResult<MutexGuard<'_, Inner>> {
        let wait = Duration::from_millis(self.cfg.lock_timeout_ms);
        self.inner
            .try_lock_for(wait)
            .ok_or(EngineError::Timeout { what: "state lock", waited_ms: self.cfg.lock_timeout_ms })
    }

    /// Lock, run `f` as one transaction, unlock, then publish whatever `f`
    /// collected. On error nothing `f` committed survives and no event goes
    /// out.
    fn run<T, F>(&self, op: &'static str, f: F) -> EngineResult<T>
    where
        F: FnOnce(&mut Inner, &mut Vec<EngineEvent>) -> EngineResult<T>,
    {
        let mut events = Vec::new();
        let res = {
            let mut inner = self.lock_for(op)?;
            let saved_state = inner.state.clone();
            let saved_ticks = inner.session_ticks;
            let res = f(&mut inner, &mut events);
            if res.is_ok() {
                self.publish_staged(&mut inner);
            } else {
                inner.staged.clear();
                inner.state = saved_state;
                inner.session_ticks = saved_ticks;
            }
            res
        };
        match &res {
            Ok(_) => self.emit(events),
            Err(e) => {
                MUTATIONS_REJECTED.with_label_values(&[e.label()]).inc();
                debug!(op, error = %e, dropped_events = events.len(), "mutation rejected");
            }
        }
        res
    }

    fn emit(&self, events: Vec<EngineEvent>) {
        if let Some(bus) = &self.bus {
            for ev in events {
                bus.publish(ev);
            }
        }
    }

    /// Validate and stage one draft. Readers see it after `publish_staged`.
    fn commit(&self, inner: &mut Inner, op: &'static str, mut draft: StateSnapshot) -> EngineResult<Arc<StateSnapshot>> {
        validate::run_chain(&self.validators, &inner.state, &draft)?;
        draft.version = inner.state.version + 1;
        let snap = Arc::new(draft.clone());
        inner.state = draft;
        inner.staged.push(HistoryEntry { version: snap.version, op, snapshot: snap.clone() });
        Ok(snap)
    }

    fn publish_staged(&self, inner: &mut Inner) {
        let staged = std::mem::take(&mut inner.staged);
        let Some(last) = staged.last().map(|e| e.snapshot.clone()) else { return };
        if self.cfg.history_capacity > 0 {
            for entry in staged {
                if inner.history.len() >= self.cfg.history_capacity {
                    inner.history.pop_front();
                }
                inner.history.push_back(entry);
            }
        }
        if let Some(milli) = (last.balance * Decimal::from(1000)).to_i64() {
            BALANCE_MILLI.set(milli);
        }
        self.snap_tx.send_replace(last);
    }

    fn end_session_locked(&self, inner: &mut Inner, events: &mut Vec<EngineEvent>) -> EngineResult<Option<Arc<StateSnapshot>>> {
        let Some(session_id) = inner.state.session_id.clone() else {
            return Ok(None);
        };
        if inner.state.position.is_some() {
            self.close_locked(inner, Decimal::ONE, CloseKind::Forced, events)?;
        }
        if inner.state.side_bet.is_some() {
            self.resolve_side_bet_locked(inner, false, events)?;
        }
        let snap = Arc::new(inner.state.clone());
        events.push(EngineEvent::SessionEnded {
            session_id: session_id.clone(),
            ticks: inner.session_ticks,
            snapshot: (*snap).clone(),
        });
        info!(session = %session_id, ticks = inner.session_ticks, balance = %snap.balance, "session ended");
        Ok(Some(snap))
    }

    fn apply_tick_locked(&self, inner: &mut Inner, tick: &Tick, events: &mut Vec<EngineEvent>) -> EngineResult<Arc<StateSnapshot>> {
        tick.validate()?;
        if let Some(active) = &inner.state.session_id {
            if active != &tick.session_id {
                return Err(EngineError::validation(
                    "session_id",
                    format!("tick for {} while {} is active; reset first", tick.session_id, active),
                ));
            }
            if let Some(last) = inner.state.current_tick {
                if tick.sequence_number <= last {
                    return Err(EngineError::Sequence {
                        session_id: tick.session_id.clone(),
                        last,
                        got: tick.sequence_number,
                    });
                }
            }
        }

        let mut draft = inner.state.clone();
        draft.session_id = Some(tick.session_id.clone());
        draft.current_tick = Some(tick.sequence_number);
        draft.price = tick.price;
        draft.phase = tick.phase;
        let mut snap = self.commit(inner, "apply_tick", draft)?;
        inner.session_ticks += 1;
        events.push(EngineEvent::TickApplied { tick: tick.clone(), snapshot: (*snap).clone() });

        // side bet: expiry first, then terminal
        if let Some(sb) = inner.state.side_bet.clone() {
            if tick.sequence_number > sb.expiry_tick {
                snap = self.resolve_side_bet_locked(inner, false, events)?;
            } else if tick.is_terminal {
                snap = self.resolve_side_bet_locked(inner, true, events)?;
            }
        }

        if tick.is_terminal && !inner.state.terminal_detected {
            let mut draft = inner.state.clone();
            draft.terminal_detected = true;
            snap = self.commit(inner, "terminal", draft)?;
            if inner.state.position.is_some() {
                snap = self.close_locked(inner, Decimal::ONE, CloseKind::Forced, events)?;
            }
            info!(session = %tick.session_id, tick = tick.sequence_number, price = %tick.price, "terminal tick");
        }
        Ok(snap)
    }

    fn open_position_locked(&self, inner: &mut Inner, amount: Decimal, events: &mut Vec<EngineEvent>) -> EngineResult<Arc<StateSnapshot>> {
        let st = &inner.state;
        if amount <= Decimal::ZERO {
            return Err(EngineError::validation("amount", "must be > 0"));
        }
        if let Some(cap) = self.cfg.max_position_amount {
            if amount > cap {
                return Err(EngineError::validation("amount", format!("exceeds cap {cap}")));
            }
        }
        let tick = st.current_tick.ok_or_else(|| EngineError::validation("current_tick", "no tick applied yet"))?;
        if st.phase != Phase::Active || st.terminal_detected {
            return Err(EngineError::validation("phase", format!("cannot open in {:?}", st.phase)));
        }
        if st.price <= Decimal::ZERO {
            return Err(EngineError::validation("price", "cannot open at zero price"));
        }
        if st.position.is_some() {
            return Err(EngineError::validation("position", "a position is already open"));
        }

        let mut draft = st.clone();
        draft.balance -= amount;
        draft.position = Some(Position {
            entry_price: st.price,
            entry_amount: amount,
            amount,
            opened_at_tick: tick,
            closed_lots: Vec::new(),
        });
        let snap = self.commit(inner, "open_position", draft)?;
        events.push(EngineEvent::PositionOpened { snapshot: (*snap).clone() });
        Ok(snap)
    }

    fn close_locked(&self, inner: &mut Inner, fraction: Decimal, kind: CloseKind, events: &mut Vec<EngineEvent>) -> EngineResult<Arc<StateSnapshot>> {
        let st = &inner.state;
        let pos = st.position.as_ref().ok_or_else(|| EngineError::validation("position", "no open position"))?;
        let price = st.price;
        let exit_tick = st.current_tick.unwrap_or(pos.opened_at_tick);

        let closed_amount = match kind {
            CloseKind::Partial => pos
                .amount
                .checked_mul(fraction)
                .ok_or_else(|| EngineError::validation("amount", "overflow"))?,
            CloseKind::Full | CloseKind::Forced => pos.amount,
        };
        if closed_amount <= Decimal::ZERO {
            return Err(EngineError::validation("fraction", "closes nothing"));
        }
        // every lot is valued against the original entry
        let payout = closed_amount
            .checked_mul(price)
            .and_then(|v| v.checked_div(pos.entry_price))
            .ok_or_else(|| EngineError::validation("payout", "overflow"))?;
        let lot = ClosedLot {
            fraction: if kind == CloseKind::Partial { fraction } else { Decimal::ONE },
            amount: closed_amount,
            exit_price: price,
            exit_tick,
            payout,
            pnl: payout - closed_amount,
        };

        let mut draft = st.clone();
        draft.balance += payout;
        let remaining = pos.amount - closed_amount;
        let fully_closed = kind != CloseKind::Partial || remaining <= Decimal::ZERO;
        if fully_closed {
            draft.position = None;
        } else if let Some(p) = draft.position.as_mut() {
            p.amount = remaining;
            p.closed_lots.push(lot.clone());
        }

        let op = match kind {
            CloseKind::Partial => "partial_close",
            CloseKind::Full => "close_position",
            CloseKind::Forced => "settle_position",
        };
        let snap = self.commit(inner, op, draft)?;
        let snapshot = (*snap).clone();
        events.push(match (kind, fully_closed) {
            (CloseKind::Forced, _) => EngineEvent::PositionSettled { lot, snapshot },
            (_, true) => EngineEvent::PositionClosed { lot, snapshot },
            (_, false) => EngineEvent::PositionPartiallyClosed { lot, snapshot },
        });
        Ok(snap)
    }

    fn place_side_bet_locked(&self, inner: &mut Inner, amount: Decimal, events: &mut Vec<EngineEvent>) -> EngineResult<Arc<StateSnapshot>> {
        let st = &inner.state;
        if amount <= Decimal::ZERO {
            return Err(EngineError::validation("amount", "must be > 0"));
        }
        let tick = st.current_tick.ok_or_else(|| EngineError::validation("current_tick", "no tick applied yet"))?;
        if st.phase != Phase::Active || st.terminal_detected {
            return Err(EngineError::validation("phase", format!("cannot place side bet in {:?}", st.phase)));
        }
        if st.side_bet.is_some() {
            return Err(EngineError::validation("side_bet", "a side bet is already active"));
        }
        let mut draft = st.clone();
        draft.balance -= amount;
        draft.side_bet = Some(SideBet {
            amount,
            placed_at_tick: tick,
            expiry_tick: tick + self.cfg.sidebet_window_ticks,
            resolved: false,
        });
        let snap = self.commit(inner, "place_side_bet", draft)?;
        events.push(EngineEvent::SideBetPlaced { snapshot: (*snap).clone() });
        Ok(snap)
    }

    fn resolve_side_bet_locked(&self, inner: &mut Inner, won: bool, events: &mut Vec<EngineEvent>) -> EngineResult<Arc<StateSnapshot>> {
        let sb = inner
            .state
            .side_bet
            .as_ref()
            .ok_or_else(|| EngineError::validation("side_bet", "no active side bet"))?;
        let payout = if won {
            sb.amount
                .checked_mul(self.cfg.sidebet_payout_multiplier)
                .ok_or_else(|| EngineError::validation("payout", "overflow"))?
        } else {
            Decimal::ZERO
        };
        let mut draft = inner.state.clone();
        draft.balance += payout;
        draft.side_bet = None;
        let snap = self.commit(inner, "resolve_side_bet", draft)?;
        if won {
            info!(payout = %payout, "side bet won");
        } else {
            debug!("side bet lost");
        }
        events.push(EngineEvent::SideBetResolved { won, payout, snapshot: (*snap).clone() });
        Ok(snap)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn tick(session: &str, seq: u64, price: Decimal) -> Tick {
        Tick { session_id: session.into(), sequence_number: seq, price, phase: Phase::Active, is_terminal: false, timestamp: 0 }
    }

    fn store() -> StateStore {
        StateStore::new(StoreConfig::default(), None)
    }

    #[test]
    fn open_then_full_close_realizes_price_ratio() {
        let s = store();
        let initial = s.get_snapshot().balance;
        s.apply_tick(&tick("g", 1, dec!(1.00))).unwrap();
        s.open_position(dec!(0.01)).unwrap();
        assert_eq!(s.get_snapshot().balance, initial - dec!(0.01));
        s.apply_tick(&tick("g", 2, dec!(2.00))).unwrap();
        let snap = s.close_position().unwrap();
        assert_eq!(snap.balance, initial + dec!(0.01));
        assert!(snap.position.is_none());
    }

    #[test]
    fn partial_closes_use_original_entry() {
        let s = store();
        s.apply_tick(&tick("g", 1, dec!(1))).unwrap();
        s.open_position(dec!(0.04)).unwrap();
        s.apply_tick(&tick("g", 2, dec!(2))).unwrap();
        let snap = s.partial_close(dec!(0.5)).unwrap();
        let p = snap.position.clone().unwrap();
        assert_eq!(p.amount, dec!(0.02));
        assert_eq!(p.entry_price, dec!(1));
        assert_eq!(p.closed_lots.len(), 1);
        assert_eq!(p.closed_lots[0].payout, dec!(0.04));

        s.apply_tick(&tick("g", 3, dec!(3))).unwrap();
        let snap = s.partial_close(dec!(0.5)).unwrap();
        let p = snap.position.clone().unwrap();
        assert_eq!(p.amount, dec!(0.01));
        assert_eq!(p.entry_amount, dec!(0.04));
        assert_eq!(p.closed_lots[1].payout, dec!(0.03));
        assert_eq!(p.realized_pnl(), dec!(0.02) + dec!(0.02));
    }

    #[test]
    fn rejected_mutation_leaves_state_unchanged() {
        let s = store();
        s.apply_tick(&tick("g", 1, dec!(1))).unwrap();
        let before = s.get_snapshot();
        let err = s.open_position(dec!(5)).unwrap_err();
        assert!(matches!(err, EngineError::ValidationFailed { field: "balance", .. }));
        assert_eq!(*s.get_snapshot(), *before);

        s.open_position(dec!(0.01)).unwrap();
        let err = s.open_position(dec!(0.01)).unwrap_err();
        assert!(matches!(err, EngineError::ValidationFailed { field: "position", .. }));
        assert!(s.partial_close(dec!(1.5)).is_err());
        assert!(s.update_balance(dec!(-10)).is_err());
    }

    #[test]
    fn sequence_must_increase_but_gaps_are_fine() {
        let s = store();
        s.apply_tick(&tick("g", 5, dec!(1))).unwrap();
        assert!(matches!(s.apply_tick(&tick("g", 5, dec!(1))), Err(EngineError::Sequence { last: 5, got: 5, .. })));
        assert!(matches!(s.apply_tick(&tick("g", 3, dec!(1))), Err(EngineError::Sequence { .. })));
        assert!(s.apply_tick(&tick("g", 9, dec!(1))).is_ok());
    }

    #[test]
    fn foreign_session_needs_reset() {
        let s = store();
        s.apply_tick(&tick("a", 1, dec!(1))).unwrap();
        assert!(matches!(
            s.apply_tick(&tick("b", 1, dec!(1))),
            Err(EngineError::ValidationFailed { field: "session_id", .. })
        ));
        s.update_balance(dec!(0.5)).unwrap();
        let snap = s.reset_session().unwrap();
        assert_eq!(snap.session_id, None);
        assert_eq!(snap.balance, dec!(0.6));
        s.apply_tick(&tick("b", 1, dec!(1))).unwrap();
    }

    #[test]
    fn terminal_tick_settles_position_and_wins_side_bet() {
        let s = store();
        s.apply_tick(&tick("g", 1, dec!(1))).unwrap();
        s.open_position(dec!(0.02)).unwrap();
        s.place_side_bet(dec!(0.01)).unwrap();
        assert_eq!(s.get_snapshot().balance, dec!(0.07));

        let mut t = tick("g", 2, dec!(0.5));
        t.is_terminal = true;
        t.phase = Phase::Rugged;
        let snap = s.apply_tick(&t).unwrap();
        assert!(snap.terminal_detected);
        assert!(snap.position.is_none());
        assert!(snap.side_bet.is_none());
        // 0.07 + 0.02 * 0.5 + 0.01 * 5
        assert_eq!(snap.balance, dec!(0.13));
        assert!(s.open_position(dec!(0.01)).is_err());
    }

    struct BalanceCap(Decimal);

    impl Validator for BalanceCap {
        fn name(&self) -> &'static str { "balance_cap" }

        fn check(&self, _prev: &StateSnapshot, next: &StateSnapshot) -> EngineResult<()> {
            if next.balance > self.0 {
                return Err(EngineError::validation("balance", "above cap"));
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn failing_settle_step_rolls_back_the_whole_tick() {
        let bus = EventBus::new(crate::config::BusConfig::default());
        let (_, mut rx) = bus.subscribe_channel("test", 64);
        bus.start().unwrap();
        let mut chain = validate::default_chain();
        chain.push(Box::new(BalanceCap(dec!(0.12))));
        let s = StateStore::with_validators(StoreConfig::default(), Some(bus.clone()), chain);

        s.apply_tick(&tick("g", 1, dec!(1))).unwrap();
        s.place_side_bet(dec!(0.01)).unwrap();
        let before = s.get_snapshot();
        let history_before = s.history_len().unwrap();

        // winning the side bet would lift the balance to 0.14
        let mut t = tick("g", 2, dec!(1));
        t.is_terminal = true;
        assert!(s.apply_tick(&t).is_err());

        assert_eq!(*s.get_snapshot(), *before);
        assert_eq!(s.history_len().unwrap(), history_before);
        assert!(!s.get_snapshot().terminal_detected);
        assert!(s.get_snapshot().side_bet.is_some());

        assert!(bus.flush(Duration::from_secs(1)).await);
        let mut kinds = Vec::new();
        while let Ok(ev) = rx.try_recv() {
            kinds.push(ev.kind());
        }
        assert_eq!(kinds, vec!["TickApplied", "SideBetPlaced"]);

        // the same tick number is still free
        t.is_terminal = false;
        assert_eq!(s.apply_tick(&t).unwrap().current_tick, Some(2));
        bus.stop().await.unwrap();
    }

    #[test]
    fn side_bet_expires_as_lost() {
        let cfg = StoreConfig { sidebet_window_ticks: 2, ..Default::default() };
        let s = StateStore::new(cfg, None);
        s.apply_tick(&tick("g", 1, dec!(1))).unwrap();
        s.place_side_bet(dec!(0.01)).unwrap();
        s.apply_tick(&tick("g", 3, dec!(1))).unwrap();
        assert!(s.get_snapshot().side_bet.is_some());
        let snap = s.apply_tick(&tick("g", 4, dec!(1))).unwrap();
        assert!(snap.side_bet.is_none());
        assert_eq!(snap.balance, dec!(0.09));
        assert!(s.resolve_side_bet(true).is_err());
    }

    #[test]
    fn end_session_force_settles_at_last_price() {
        let s = store();
        s.apply_tick(&tick("g", 1, dec!(2))).unwrap();
        s.open_position(dec!(0.02)).unwrap();
        s.apply_tick(&tick("g", 2, dec!(3))).unwrap();
        let snap = s.end_session().unwrap().unwrap();
        assert!(snap.position.is_none());
        assert_eq!(snap.balance, dec!(0.08) + dec!(0.03));
        assert!(store().end_session().unwrap().is_none());
    }

    #[test]
    fn history_is_bounded() {
        let cfg = StoreConfig { history_capacity: 3, ..Default::default() };
        let s = StateStore::new(cfg, None);
        for i in 1..=10 {
            s.apply_tick(&tick("g", i, dec!(1))).unwrap();
        }
        let h = s.history().unwrap();
        assert_eq!(h.len(), 3);
        assert_eq!(h.first().unwrap().version, 8);
        assert_eq!(h.last().unwrap().snapshot.current_tick, Some(10));
    }

    #[test]
    fn apply_action_maps_close_fraction() {
        let s = store();
        s.apply_tick(&tick("g", 1, dec!(1))).unwrap();
        s.apply_action(&Action::OpenPosition(dec!(0.02))).unwrap();
        let snap = s.apply_action(&Action::ClosePosition(dec!(0.5))).unwrap();
        assert_eq!(snap.position.as_ref().unwrap().amount, dec!(0.01));
        let snap = s.apply_action(&Action::ClosePosition(dec!(1.0))).unwrap();
        assert!(snap.position.is_none());
        let v = snap.version;
        assert_eq!(s.apply_action(&Action::NoOp).unwrap().version, v);
    }
}
