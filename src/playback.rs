//! Shared video playback state of a room.

use serde::{Deserialize, Serialize};

use crate::clock::{signed_diff, ClockSnapshot};
use crate::error::{Result, RoomError};

/// Authoritative playback state, broadcast to every member of the room.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlaybackSnapshot {
    pub room: String,
    pub video_url: Option<String>,
    /// Position at `broadcast_at_ms`.
    pub position_ms: u64,
    pub is_playing: bool,
    pub last_broadcaster: Option<String>,
    pub broadcast_at_ms: u64,
    pub seq: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlaybackCommand {
    Load { video_url: String },
    Play { position_ms: u64 },
    Pause { position_ms: u64 },
    Seek { position_ms: u64 },
    /// Periodic position push from whoever is driving playback.
    Sync { position_ms: u64 },
}

impl PlaybackSnapshot {
    pub fn new(room: &str, now_ms: u64) -> Self {
        Self {
            room: room.to_string(),
            video_url: None,
            position_ms: 0,
            is_playing: false,
            last_broadcaster: None,
            broadcast_at_ms: now_ms,
            seq: 0,
        }
    }

    pub fn position_at(&self, now_ms: u64) -> u64 {
        self.as_clock().value_at(now_ms)
    }

    pub fn as_clock(&self) -> ClockSnapshot {
        ClockSnapshot {
            value_ms: self.position_ms,
            running: self.is_playing,
            recorded_at_ms: self.broadcast_at_ms,
            seq: self.seq,
        }
    }

    /// Apply a command from participant `actor_id`.
    ///
    /// Returns `Ok(false)` when the command is a no-op and nothing should be
    /// broadcast. `tolerance_ms` bounds how far a redundant `Play` may be from
    /// the current position and still count as a no-op.
    pub fn apply(
        &mut self,
        actor_id: &str,
        actor_is_host: bool,
        cmd: PlaybackCommand,
        now_ms: u64,
        seq: u64,
        tolerance_ms: u64,
    ) -> Result<bool> {
        match cmd {
            PlaybackCommand::Load { video_url } => {
                if !actor_is_host {
                    return Err(RoomError::NotAuthorized { action: "load a video" });
                }
                let video_url = video_url.trim();
                if !(video_url.starts_with("https://") || video_url.starts_with("http://")) {
                    return Err(RoomError::invalid("video_url must be an http(s) URL"));
                }
                self.video_url = Some(video_url.to_string());
                self.position_ms = 0;
                self.is_playing = false;
            }
            PlaybackCommand::Play { position_ms } => {
                self.require_video()?;
                if self.is_playing
                    && signed_diff(self.position_at(now_ms), position_ms).unsigned_abs()
                        <= tolerance_ms
                {
                    return Ok(false);
                }
                self.position_ms = position_ms;
                self.is_playing = true;
            }
            PlaybackCommand::Pause { position_ms } => {
                self.require_video()?;
                if !self.is_playing && self.position_ms == position_ms {
                    return Ok(false);
                }
                self.position_ms = position_ms;
                self.is_playing = false;
            }
            PlaybackCommand::Seek { position_ms } => {
                self.require_video()?;
                self.position_ms = position_ms;
            }
            PlaybackCommand::Sync { position_ms } => {
                self.require_video()?;
                let is_driver = self.last_broadcaster.as_deref() == Some(actor_id);
                if !(actor_is_host || is_driver) {
                    return Err(RoomError::NotAuthorized { action: "sync playback" });
                }
                if !self.is_playing {
                    return Ok(false);
                }
                self.position_ms = position_ms;
            }
        }
        self.last_broadcaster = Some(actor_id.to_string());
        self.broadcast_at_ms = now_ms;
        self.seq = seq;
        Ok(true)
    }

    fn require_video(&self) -> Result<()> {
        if self.video_url.is_none() {
            return Err(RoomError::invalid("no video loaded"));
        }
        Ok(())
    }
}
