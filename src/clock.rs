//! # Local clock reconciliation
//!
//! ## Responsibility
//! Keeps a locally ticking counter (a study timer or a video position)
//! consistent with a remote [`ClockSnapshot`] that only arrives sporadically.
//! Small drifts are ignored so the displayed value never jumps; large drifts
//! are corrected by hard-setting the local value to the reconciled remote one.
//!
//! ## Guarantees
//! - Wall-clock driven: the value advances by the elapsed time between ticks,
//!   not by the number of ticks, so a suspended task catches up on resume.
//! - Ordered: a snapshot whose `seq` is lower than the last applied one is
//!   rejected as stale. Re-applying the same `seq` is idempotent.
//! - Pure: every operation takes `now_ms` explicitly; nothing reads the clock.
//!
//! ## NOT Responsible For
//! - Transport or retries (a missed snapshot is corrected by the next one)
//! - Deciding who may write (the hub enforces ownership)

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Interval between local ticks.
pub const DEFAULT_TICK_MS: u64 = 1_000;

/// Interval at which an owning client pushes its value back to the hub.
pub const DEFAULT_PUSH_INTERVAL_MS: u64 = 5_000;

/// Playback tolerates a few seconds of drift before seeking.
pub const PLAYBACK_TOLERANCE_MS: u64 = 3_000;

/// A running study timer free-runs locally and adopts any differing snapshot.
pub const TIMER_TOLERANCE_MS: u64 = 0;

// ---------------------------------------------------------------------------
// Snapshot
// ---------------------------------------------------------------------------

/// A point-in-time record of a shared counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClockSnapshot {
    /// Counter value when the snapshot was recorded.
    pub value_ms: u64,
    pub running: bool,
    /// Hub wall-clock time of the authoritative update.
    pub recorded_at_ms: u64,
    /// Hub-assigned ordering token, monotonically increasing per room.
    pub seq: u64,
}

impl ClockSnapshot {
    /// Value implied by this snapshot at `now_ms`.
    pub fn value_at(&self, now_ms: u64) -> u64 {
        if self.running {
            self.value_ms
                .saturating_add(now_ms.saturating_sub(self.recorded_at_ms))
        } else {
            self.value_ms
        }
    }
}

// ---------------------------------------------------------------------------
// State and outcomes
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClockState {
    Stopped,
    Running,
}

impl ClockState {
    pub fn from_running(running: bool) -> Self {
        if running {
            ClockState::Running
        } else {
            ClockState::Stopped
        }
    }
}

/// What applying a remote snapshot did to the local clock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reconciliation {
    /// The snapshot is older than one already applied; nothing changed.
    Stale { seq: u64, last_seq: u64 },
    /// Drift is inside the tolerance; local ticking continues untouched.
    WithinTolerance { drift_ms: i64 },
    /// Drift exceeded the tolerance; the local value was hard-set.
    Corrected { from_ms: u64, to_ms: u64 },
    /// The remote clock is running and the local one was stopped.
    Started { at_ms: u64 },
    /// The remote clock is stopped and the local one was running.
    Stopped { at_ms: u64 },
}

impl Reconciliation {
    /// True when the local value or state was changed.
    pub fn changed(&self) -> bool {
        matches!(
            self,
            Reconciliation::Corrected { .. }
                | Reconciliation::Started { .. }
                | Reconciliation::Stopped { .. }
        )
    }
}

/// `a - b` as a signed value, saturating at the `i64` range.
pub fn signed_diff(a: u64, b: u64) -> i64 {
    if a >= b {
        i64::try_from(a - b).unwrap_or(i64::MAX)
    } else {
        i64::try_from(b - a).map(|d| -d).unwrap_or(i64::MIN)
    }
}

// ---------------------------------------------------------------------------
// ClockReconciler
// ---------------------------------------------------------------------------

/// A locally ticking counter reconciled against remote snapshots.
///
/// The counter is stored as `(value at anchor, anchor time, state)`; its
/// current value is always derived from wall-clock time.
#[derive(Debug, Clone)]
pub struct ClockReconciler {
    value_ms: u64,
    anchor_ms: u64,
    state: ClockState,
    tolerance_ms: u64,
    last_seq: Option<u64>,
}

impl ClockReconciler {
    /// A stopped clock at zero.
    pub fn new(tolerance_ms: u64, now_ms: u64) -> Self {
        Self {
            value_ms: 0,
            anchor_ms: now_ms,
            state: ClockState::Stopped,
            tolerance_ms,
            last_seq: None,
        }
    }

    pub fn for_playback(now_ms: u64) -> Self {
        Self::new(PLAYBACK_TOLERANCE_MS, now_ms)
    }

    pub fn for_timer(now_ms: u64) -> Self {
        Self::new(TIMER_TOLERANCE_MS, now_ms)
    }

    /// A clock seeded directly from a snapshot.
    pub fn from_snapshot(snapshot: &ClockSnapshot, tolerance_ms: u64, now_ms: u64) -> Self {
        Self {
            value_ms: snapshot.value_at(now_ms),
            anchor_ms: now_ms,
            state: ClockState::from_running(snapshot.running),
            tolerance_ms,
            last_seq: Some(snapshot.seq),
        }
    }

    pub fn state(&self) -> ClockState {
        self.state
    }

    pub fn is_running(&self) -> bool {
        self.state == ClockState::Running
    }

    pub fn tolerance_ms(&self) -> u64 {
        self.tolerance_ms
    }

    pub fn last_seq(&self) -> Option<u64> {
        self.last_seq
    }

    /// Current value, derived from the anchor and wall-clock delta.
    pub fn value_at(&self, now_ms: u64) -> u64 {
        match self.state {
            ClockState::Running => self
                .value_ms
                .saturating_add(now_ms.saturating_sub(self.anchor_ms)),
            ClockState::Stopped => self.value_ms,
        }
    }

    /// Advance by the wall-clock delta since the last tick and return the
    /// value to render.
    pub fn tick(&mut self, now_ms: u64) -> u64 {
        let value = self.value_at(now_ms);
        if self.is_running() && now_ms > self.anchor_ms {
            self.value_ms = value;
            self.anchor_ms = now_ms;
        }
        value
    }

    /// Signed drift of the local value from the value implied by `snapshot`.
    pub fn drift_from(&self, snapshot: &ClockSnapshot, now_ms: u64) -> i64 {
        signed_diff(self.value_at(now_ms), snapshot.value_at(now_ms))
    }

    /// Reconcile against a remote snapshot received at `now_ms`.
    pub fn apply(&mut self, snapshot: &ClockSnapshot, now_ms: u64) -> Reconciliation {
        if let Some(last_seq) = self.last_seq {
            if snapshot.seq < last_seq {
                return Reconciliation::Stale {
                    seq: snapshot.seq,
                    last_seq,
                };
            }
        }
        self.last_seq = Some(snapshot.seq);

        let local = self.value_at(now_ms);
        let target = snapshot.value_at(now_ms);
        let remote_state = ClockState::from_running(snapshot.running);

        if remote_state != self.state {
            self.hard_set(target, now_ms);
            self.state = remote_state;
            return match remote_state {
                ClockState::Running => Reconciliation::Started { at_ms: target },
                ClockState::Stopped => Reconciliation::Stopped { at_ms: target },
            };
        }

        let drift_ms = signed_diff(local, target);
        if drift_ms.unsigned_abs() <= self.tolerance_ms {
            return Reconciliation::WithinTolerance { drift_ms };
        }

        self.hard_set(target, now_ms);
        Reconciliation::Corrected {
            from_ms: local,
            to_ms: target,
        }
    }

    // -- owner-side operations ----------------------------------------------

    /// Returns `false` if the clock was already running.
    pub fn start(&mut self, now_ms: u64) -> bool {
        if self.is_running() {
            return false;
        }
        self.anchor_ms = now_ms;
        self.state = ClockState::Running;
        true
    }

    /// Returns `false` if the clock was already stopped.
    pub fn pause(&mut self, now_ms: u64) -> bool {
        if !self.is_running() {
            return false;
        }
        let value = self.value_at(now_ms);
        self.hard_set(value, now_ms);
        self.state = ClockState::Stopped;
        true
    }

    pub fn reset(&mut self, now_ms: u64) {
        self.hard_set(0, now_ms);
        self.state = ClockState::Stopped;
    }

    pub fn seek(&mut self, value_ms: u64, now_ms: u64) {
        self.hard_set(value_ms, now_ms);
    }

    /// The local value as a snapshot, e.g. for pushing back to the hub.
    pub fn snapshot(&self, now_ms: u64, seq: u64) -> ClockSnapshot {
        ClockSnapshot {
            value_ms: self.value_at(now_ms),
            running: self.is_running(),
            recorded_at_ms: now_ms,
            seq,
        }
    }

    fn hard_set(&mut self, value_ms: u64, now_ms: u64) {
        self.value_ms = value_ms;
        self.anchor_ms = now_ms;
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
