//! Client-side view of a room, driven by hub messages and a local tick.
//!
//! One [`ClockReconciler`] is kept per shared timer and one for playback.
//! All reconcilers run on the hub's timebase: local wall-clock readings are
//! shifted by an offset estimated from `server_time_ms` in `welcome`/`pong`.

use std::collections::HashMap;

use crate::clock::{ClockReconciler, Reconciliation, PLAYBACK_TOLERANCE_MS, TIMER_TOLERANCE_MS};
use crate::collab::Participant;
use crate::playback::PlaybackSnapshot;
use crate::protocol::ServerMessage;
use crate::timer::TimerSnapshot;

#[derive(Debug, Clone)]
struct FollowedTimer {
    owner_name: String,
    subject: String,
    clock: ClockReconciler,
}

#[derive(Debug, Clone)]
struct FollowedPlayback {
    video_url: Option<String>,
    clock: ClockReconciler,
}

/// Something worth telling the user about after observing a message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FollowerEvent {
    Welcomed { room: String, participant: String },
    Member { name: String, joined: bool },
    Chat { author: String, text: String },
    Timer { owner: String, outcome: Reconciliation },
    TimerRemoved { owner: String },
    Playback { outcome: Reconciliation },
    Closed,
    Error(String),
    Quiet,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimerLine {
    pub owner_id: String,
    pub owner_name: String,
    pub subject: String,
    pub elapsed_ms: u64,
    pub running: bool,
    pub mine: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlaybackLine {
    pub video_url: Option<String>,
    pub position_ms: u64,
    pub playing: bool,
}

/// What to render on one tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FollowerView {
    pub room: String,
    pub participants: usize,
    pub timers: Vec<TimerLine>,
    pub playback: Option<PlaybackLine>,
    pub closed: bool,
}

#[derive(Debug, Clone)]
pub struct RoomFollower {
    me: Option<Participant>,
    room_code: String,
    participants: HashMap<String, Participant>,
    timers: HashMap<String, FollowedTimer>,
    playback: Option<FollowedPlayback>,
    timer_tolerance_ms: u64,
    playback_tolerance_ms: u64,
    /// Hub clock minus local clock.
    offset_ms: i64,
    ping_sent_at: Option<u64>,
    closed: bool,
}

impl Default for RoomFollower {
    fn default() -> Self {
        Self::new(TIMER_TOLERANCE_MS, PLAYBACK_TOLERANCE_MS)
    }
}

impl RoomFollower {
    pub fn new(timer_tolerance_ms: u64, playback_tolerance_ms: u64) -> Self {
        Self {
            me: None,
            room_code: String::new(),
            participants: HashMap::new(),
            timers: HashMap::new(),
            playback: None,
            timer_tolerance_ms,
            playback_tolerance_ms,
            offset_ms: 0,
            ping_sent_at: None,
            closed: false,
        }
    }

    pub fn me(&self) -> Option<&Participant> {
        self.me.as_ref()
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn offset_ms(&self) -> i64 {
        self.offset_ms
    }

    /// Number of live tick handles (timers plus playback).
    pub fn clock_count(&self) -> usize {
        self.timers.len() + usize::from(self.playback.is_some())
    }

    /// Translate a local wall-clock reading onto the hub's timebase.
    pub fn hub_now(&self, local_ms: u64) -> u64 {
        if self.offset_ms >= 0 {
            local_ms.saturating_add(self.offset_ms as u64)
        } else {
            local_ms.saturating_sub(self.offset_ms.unsigned_abs())
        }
    }

    /// Remember when a ping left so the pong can halve the round trip.
    pub fn note_ping_sent(&mut self, local_ms: u64) {
        self.ping_sent_at = Some(local_ms);
    }

    fn estimate_offset(&mut self, server_time_ms: u64, local_ms: u64) {
        let midpoint = match self.ping_sent_at.take() {
            Some(sent) if sent <= local_ms => sent + (local_ms - sent) / 2,
            _ => local_ms,
        };
        self.offset_ms = crate::clock::signed_diff(server_time_ms, midpoint);
    }

    /// Our own timer's current value, for pushing back to the hub.
    pub fn own_elapsed(&self, local_ms: u64) -> Option<u64> {
        let me = self.me.as_ref()?;
        let timer = self.timers.get(&me.id)?;
        timer
            .clock
            .is_running()
            .then(|| timer.clock.value_at(self.hub_now(local_ms)))
    }

    /// Fold one hub message into the local state.
    pub fn observe(&mut self, msg: ServerMessage, local_ms: u64) -> FollowerEvent {
        match msg {
            ServerMessage::Welcome {
                participant,
                room,
                server_time_ms,
            } => {
                self.estimate_offset(server_time_ms, local_ms);
                let now = self.hub_now(local_ms);
                self.timers.clear();
                self.participants = room
                    .participants
                    .into_iter()
                    .map(|p| (p.id.clone(), p))
                    .collect();
                for timer in &room.timers {
                    self.track_timer(timer, now);
                }
                self.playback = None;
                self.track_playback(&room.playback, now);
                self.room_code = room.code.clone();
                self.closed = false;
                let event = FollowerEvent::Welcomed {
                    room: format!("{} ({})", room.name, room.code),
                    participant: participant.name.clone(),
                };
                self.me = Some(participant);
                event
            }
            ServerMessage::ParticipantJoin { participant } => {
                let name = participant.name.clone();
                let is_me = self.me.as_ref().is_some_and(|m| m.id == participant.id);
                self.participants.insert(participant.id.clone(), participant);
                if is_me {
                    FollowerEvent::Quiet
                } else {
                    FollowerEvent::Member { name, joined: true }
                }
            }
            ServerMessage::ParticipantUpdate { participant } => {
                if let Some(me) = self.me.as_mut().filter(|m| m.id == participant.id) {
                    *me = participant.clone();
                }
                self.participants.insert(participant.id.clone(), participant);
                FollowerEvent::Quiet
            }
            ServerMessage::ParticipantLeave {
                participant_id,
                name,
            } => {
                self.participants.remove(&participant_id);
                FollowerEvent::Member {
                    name,
                    joined: false,
                }
            }
            ServerMessage::Chat { message } => FollowerEvent::Chat {
                author: message.author_name,
                text: match message.image_path {
                    Some(path) if message.text.is_empty() => format!("[image {path}]"),
                    _ => message.text,
                },
            },
            ServerMessage::ChatDeleted { .. } => FollowerEvent::Quiet,
            ServerMessage::Pong { server_time_ms } => {
                self.estimate_offset(server_time_ms, local_ms);
                FollowerEvent::Quiet
            }
            ServerMessage::Timer { timer } => {
                let now = self.hub_now(local_ms);
                let owner = timer.owner_name.clone();
                let outcome = self.track_timer(&timer, now);
                FollowerEvent::Timer { owner, outcome }
            }
            ServerMessage::TimerRemoved { owner_id } => match self.timers.remove(&owner_id) {
                Some(t) => FollowerEvent::TimerRemoved {
                    owner: t.owner_name,
                },
                None => FollowerEvent::Quiet,
            },
            ServerMessage::Playback { playback } => {
                let now = self.hub_now(local_ms);
                let outcome = self.track_playback(&playback, now);
                FollowerEvent::Playback { outcome }
            }
            ServerMessage::RoomClosed => {
                self.timers.clear();
                self.playback = None;
                self.closed = true;
                FollowerEvent::Closed
            }
            ServerMessage::Error { message } => FollowerEvent::Error(message),
        }
    }

    fn track_timer(&mut self, timer: &TimerSnapshot, hub_now: u64) -> Reconciliation {
        let snapshot = timer.as_clock();
        match self.timers.get_mut(&timer.owner_id) {
            Some(followed) => {
                let outcome = followed.clock.apply(&snapshot, hub_now);
                if !matches!(outcome, Reconciliation::Stale { .. }) {
                    followed.owner_name = timer.owner_name.clone();
                    followed.subject = timer.subject.clone();
                }
                outcome
            }
            None => {
                let clock =
                    ClockReconciler::from_snapshot(&snapshot, self.timer_tolerance_ms, hub_now);
                let to_ms = clock.value_at(hub_now);
                self.timers.insert(
                    timer.owner_id.clone(),
                    FollowedTimer {
                        owner_name: timer.owner_name.clone(),
                        subject: timer.subject.clone(),
                        clock,
                    },
                );
                Reconciliation::Corrected { from_ms: 0, to_ms }
            }
        }
    }

    fn track_playback(&mut self, playback: &PlaybackSnapshot, hub_now: u64) -> Reconciliation {
        let snapshot = playback.as_clock();
        match self.playback.as_mut() {
            Some(followed) => {
                let new_video = followed.video_url != playback.video_url;
                let outcome = followed.clock.apply(&snapshot, hub_now);
                if matches!(outcome, Reconciliation::Stale { .. }) {
                    return outcome;
                }
                if new_video {
                    // A different video always starts from the hub's position.
                    followed.video_url = playback.video_url.clone();
                    followed.clock = ClockReconciler::from_snapshot(
                        &snapshot,
                        self.playback_tolerance_ms,
                        hub_now,
                    );
                    return Reconciliation::Corrected {
                        from_ms: 0,
                        to_ms: followed.clock.value_at(hub_now),
                    };
                }
                outcome
            }
            None => {
                let clock =
                    ClockReconciler::from_snapshot(&snapshot, self.playback_tolerance_ms, hub_now);
                let to_ms = clock.value_at(hub_now);
                self.playback = Some(FollowedPlayback {
                    video_url: playback.video_url.clone(),
                    clock,
                });
                Reconciliation::Corrected { from_ms: 0, to_ms }
            }
        }
    }

    /// Advance every clock to `local_ms` and build the view to render.
    pub fn tick(&mut self, local_ms: u64) -> FollowerView {
        let now = self.hub_now(local_ms);
        let my_id = self.me.as_ref().map(|m| m.id.clone());
        let mut timers: Vec<TimerLine> = self
            .timers
            .iter_mut()
            .map(|(owner_id, t)| TimerLine {
                owner_id: owner_id.clone(),
                owner_name: t.owner_name.clone(),
                subject: t.subject.clone(),
                elapsed_ms: t.clock.tick(now),
                running: t.clock.is_running(),
                mine: my_id.as_deref() == Some(owner_id.as_str()),
            })
            .collect();
        timers.sort_by(|a, b| a.owner_name.cmp(&b.owner_name).then(a.owner_id.cmp(&b.owner_id)));

        let playback = self.playback.as_mut().map(|p| PlaybackLine {
            video_url: p.video_url.clone(),
            position_ms: p.clock.tick(now),
            playing: p.clock.is_running(),
        });

        FollowerView {
            room: self.room_code.clone(),
            participants: self.participants.len(),
            timers,
            playback,
            closed: self.closed,
        }
    }
}

/// `h:mm:ss` for durations of an hour or more, `m:ss` otherwise.
pub fn format_clock(ms: u64) -> String {
    let secs = ms / 1_000;
    let (h, m, s) = (secs / 3_600, (secs / 60) % 60, secs % 60);
    if h > 0 {
        format!("{h}:{m:02}:{s:02}")
    } else {
        format!("{m}:{s:02}")
    }
}
