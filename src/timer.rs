//! Per-participant study timers shared with the rest of a room.
//!
//! Every participant owns at most one timer. Commands only ever address the
//! sender's own timer, so other members observe it read-only.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::clock::ClockSnapshot;
use crate::error::{Result, RoomError};

/// Longest subject label kept on a timer.
pub const MAX_SUBJECT_LEN: usize = 80;

/// Authoritative state of one participant's timer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimerSnapshot {
    pub owner_id: String,
    pub owner_name: String,
    pub room: String,
    /// Elapsed time at `updated_at_ms`.
    pub elapsed_ms: u64,
    pub is_running: bool,
    pub subject: String,
    pub updated_at_ms: u64,
    pub seq: u64,
}

impl TimerSnapshot {
    fn new(room: &str, owner_id: &str, owner_name: &str, now_ms: u64) -> Self {
        Self {
            owner_id: owner_id.to_string(),
            owner_name: owner_name.to_string(),
            room: room.to_string(),
            elapsed_ms: 0,
            is_running: false,
            subject: String::new(),
            updated_at_ms: now_ms,
            seq: 0,
        }
    }

    /// Elapsed time implied by this snapshot at `now_ms`.
    pub fn elapsed_at(&self, now_ms: u64) -> u64 {
        self.as_clock().value_at(now_ms)
    }

    pub fn as_clock(&self) -> ClockSnapshot {
        ClockSnapshot {
            value_ms: self.elapsed_ms,
            running: self.is_running,
            recorded_at_ms: self.updated_at_ms,
            seq: self.seq,
        }
    }

    /// Fold elapsed running time into `elapsed_ms` and re-anchor at `now_ms`.
    fn settle(&mut self, now_ms: u64) {
        self.elapsed_ms = self.elapsed_at(now_ms);
        self.updated_at_ms = now_ms.max(self.updated_at_ms);
    }

    fn finish(&self, now_ms: u64) -> Option<StudySession> {
        let elapsed_ms = self.elapsed_at(now_ms);
        (elapsed_ms > 0).then(|| StudySession {
            room: self.room.clone(),
            owner_name: self.owner_name.clone(),
            subject: self.subject.clone(),
            elapsed_ms,
            ended_at_ms: now_ms,
        })
    }
}

/// A completed stretch of study time, archived when a timer is reset or removed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StudySession {
    pub room: String,
    pub owner_name: String,
    pub subject: String,
    pub elapsed_ms: u64,
    pub ended_at_ms: u64,
}

/// A command a participant issues against their own timer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TimerCommand {
    Start { subject: Option<String> },
    Pause,
    Reset,
    SetSubject { subject: String },
    /// Periodic push of the owner's locally ticked value.
    Sync { elapsed_ms: u64 },
}

/// Result of applying a [`TimerCommand`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TimerUpdate {
    /// The command had no effect; nothing to broadcast.
    Unchanged,
    Updated(TimerSnapshot),
    Reset {
        snapshot: TimerSnapshot,
        finished: Option<StudySession>,
    },
}

/// Normalise a subject label: trimmed and capped at [`MAX_SUBJECT_LEN`] chars.
pub fn clean_subject(subject: &str) -> String {
    subject.trim().chars().take(MAX_SUBJECT_LEN).collect()
}

/// All timers of one room, keyed by owner id.
#[derive(Debug, Default)]
pub struct TimerBoard {
    timers: HashMap<String, TimerSnapshot>,
}

impl TimerBoard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, owner_id: &str) -> Option<&TimerSnapshot> {
        self.timers.get(owner_id)
    }

    pub fn len(&self) -> usize {
        self.timers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.timers.is_empty()
    }

    /// Timers ordered by owner name for stable output.
    pub fn snapshots(&self) -> Vec<TimerSnapshot> {
        let mut all: Vec<TimerSnapshot> = self.timers.values().cloned().collect();
        all.sort_by(|a, b| a.owner_name.cmp(&b.owner_name).then(a.owner_id.cmp(&b.owner_id)));
        all
    }

    /// Apply `cmd` to the timer owned by `owner_id`, creating it on first use.
    ///
    /// `seq` is stamped on the snapshot only when the command changes it.
    pub fn apply(
        &mut self,
        room: &str,
        owner_id: &str,
        owner_name: &str,
        cmd: TimerCommand,
        now_ms: u64,
        seq: u64,
    ) -> Result<TimerUpdate> {
        if let TimerCommand::SetSubject { subject } = &cmd {
            if subject.trim().is_empty() {
                return Err(RoomError::invalid("subject must not be empty"));
            }
        }

        let existed = self.timers.contains_key(owner_id);
        let timer = self
            .timers
            .entry(owner_id.to_string())
            .or_insert_with(|| TimerSnapshot::new(room, owner_id, owner_name, now_ms));
        timer.owner_name = owner_name.to_string();

        let update = match cmd {
            TimerCommand::Start { subject } => {
                if timer.is_running {
                    return Ok(TimerUpdate::Unchanged);
                }
                if let Some(subject) = subject.as_deref().map(clean_subject) {
                    if !subject.is_empty() {
                        timer.subject = subject;
                    }
                }
                timer.settle(now_ms);
                timer.is_running = true;
                None
            }
            TimerCommand::Pause => {
                if !timer.is_running {
                    return Ok(TimerUpdate::Unchanged);
                }
                timer.settle(now_ms);
                timer.is_running = false;
                None
            }
            TimerCommand::Reset => {
                if existed && !timer.is_running && timer.elapsed_ms == 0 {
                    return Ok(TimerUpdate::Unchanged);
                }
                let finished = timer.finish(now_ms);
                timer.elapsed_ms = 0;
                timer.is_running = false;
                timer.updated_at_ms = now_ms;
                Some(finished)
            }
            TimerCommand::SetSubject { subject } => {
                let subject = clean_subject(&subject);
                if subject == timer.subject {
                    return Ok(TimerUpdate::Unchanged);
                }
                timer.settle(now_ms);
                timer.subject = subject;
                None
            }
            TimerCommand::Sync { elapsed_ms } => {
                // Only a running timer accepts pushes, and only forward.
                if !timer.is_running || elapsed_ms <= timer.elapsed_at(now_ms) {
                    return Ok(TimerUpdate::Unchanged);
                }
                timer.elapsed_ms = elapsed_ms;
                timer.updated_at_ms = now_ms.max(timer.updated_at_ms);
                None
            }
        };

        timer.seq = seq;
        let snapshot = timer.clone();
        Ok(match update {
            Some(finished) => TimerUpdate::Reset { snapshot, finished },
            None => TimerUpdate::Updated(snapshot),
        })
    }

    /// Drop the owner's timer, returning the finished session if it had time on it.
    pub fn remove(&mut self, owner_id: &str, now_ms: u64) -> Option<(TimerSnapshot, Option<StudySession>)> {
        let timer = self.timers.remove(owner_id)?;
        let finished = timer.finish(now_ms);
        Some((timer, finished))
    }

    /// Keep owner names in step with participant renames.
    pub fn rename_owner(&mut self, owner_id: &str, owner_name: &str) -> Option<TimerSnapshot> {
        let timer = self.timers.get_mut(owner_id)?;
        timer.owner_name = owner_name.to_string();
        Some(timer.clone())
    }
}
