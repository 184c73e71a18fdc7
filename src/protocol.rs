//! JSON wire protocol between room members and the hub.
//!
//! Frames are internally tagged by `"type"`, e.g.
//! `{"type":"timer_start","subject":"Chemistry"}`.

use serde::{Deserialize, Serialize};

use crate::collab::{ChatMessage, Participant};
use crate::error::{Result, RoomError};
use crate::playback::{PlaybackCommand, PlaybackSnapshot};
use crate::timer::{TimerCommand, TimerSnapshot};

/// Longest chat message accepted, in characters.
pub const MAX_CHAT_LEN: usize = 2_000;

/// Longest display name accepted, in characters.
pub const MAX_NAME_LEN: usize = 40;

// ---------------------------------------------------------------------------
// Client → hub
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    SetName {
        name: String,
    },
    Chat {
        text: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        image_path: Option<String>,
    },
    DeleteChat {
        id: String,
    },
    TimerStart {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        subject: Option<String>,
    },
    TimerPause,
    TimerReset,
    TimerSubject {
        subject: String,
    },
    TimerSync {
        elapsed_ms: u64,
    },
    PlaybackLoad {
        video_url: String,
    },
    PlaybackPlay {
        position_ms: u64,
    },
    PlaybackPause {
        position_ms: u64,
    },
    PlaybackSeek {
        position_ms: u64,
    },
    PlaybackSync {
        position_ms: u64,
    },
    CloseRoom {
        host_token: String,
    },
    Ping,
}

impl ClientMessage {
    /// Parse and validate one text frame.
    pub fn parse(text: &str) -> Result<Self> {
        let msg: ClientMessage = serde_json::from_str(text)
            .map_err(|e| RoomError::invalid(format!("unrecognised frame: {e}")))?;
        msg.validate()?;
        Ok(msg)
    }

    fn validate(&self) -> Result<()> {
        match self {
            ClientMessage::SetName { name } => {
                let len = name.trim().chars().count();
                if len == 0 || len > MAX_NAME_LEN {
                    return Err(RoomError::invalid(format!(
                        "name must be 1-{MAX_NAME_LEN} characters"
                    )));
                }
            }
            ClientMessage::Chat { text, image_path } => {
                if text.trim().is_empty() && image_path.is_none() {
                    return Err(RoomError::invalid("empty chat message"));
                }
                if text.chars().count() > MAX_CHAT_LEN {
                    return Err(RoomError::invalid(format!(
                        "chat message longer than {MAX_CHAT_LEN} characters"
                    )));
                }
            }
            _ => {}
        }
        Ok(())
    }

    pub fn timer_command(&self) -> Option<TimerCommand> {
        Some(match self {
            ClientMessage::TimerStart { subject } => TimerCommand::Start {
                subject: subject.clone(),
            },
            ClientMessage::TimerPause => TimerCommand::Pause,
            ClientMessage::TimerReset => TimerCommand::Reset,
            ClientMessage::TimerSubject { subject } => TimerCommand::SetSubject {
                subject: subject.clone(),
            },
            ClientMessage::TimerSync { elapsed_ms } => TimerCommand::Sync {
                elapsed_ms: *elapsed_ms,
            },
            _ => return None,
        })
    }

    pub fn playback_command(&self) -> Option<PlaybackCommand> {
        Some(match self {
            ClientMessage::PlaybackLoad { video_url } => PlaybackCommand::Load {
                video_url: video_url.clone(),
            },
            ClientMessage::PlaybackPlay { position_ms } => PlaybackCommand::Play {
                position_ms: *position_ms,
            },
            ClientMessage::PlaybackPause { position_ms } => PlaybackCommand::Pause {
                position_ms: *position_ms,
            },
            ClientMessage::PlaybackSeek { position_ms } => PlaybackCommand::Seek {
                position_ms: *position_ms,
            },
            ClientMessage::PlaybackSync { position_ms } => PlaybackCommand::Sync {
                position_ms: *position_ms,
            },
            _ => return None,
        })
    }
}

// ---------------------------------------------------------------------------
// Hub → client
// ---------------------------------------------------------------------------

/// Full state of a room as sent to a joining member.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomState {
    pub code: String,
    pub name: String,
    pub host_id: String,
    pub participants: Vec<Participant>,
    pub chat_log: Vec<ChatMessage>,
    pub timers: Vec<TimerSnapshot>,
    pub playback: PlaybackSnapshot,
    pub seq: u64,
    pub created_at_ms: u64,
}

/// One line of the room directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomSummary {
    pub code: String,
    pub name: String,
    pub participant_count: usize,
    pub is_playing: bool,
    pub created_at_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Welcome {
        participant: Participant,
        room: RoomState,
        /// Hub wall-clock time, lets followers estimate clock offset.
        server_time_ms: u64,
    },
    ParticipantJoin {
        participant: Participant,
    },
    ParticipantUpdate {
        participant: Participant,
    },
    ParticipantLeave {
        participant_id: String,
        name: String,
    },
    Chat {
        message: ChatMessage,
    },
    ChatDeleted {
        id: String,
    },
    Timer {
        timer: TimerSnapshot,
    },
    TimerRemoved {
        owner_id: String,
    },
    Playback {
        playback: PlaybackSnapshot,
    },
    RoomClosed,
    Error {
        message: String,
    },
    Pong {
        server_time_ms: u64,
    },
}

impl ServerMessage {
    pub fn error(err: &RoomError) -> Self {
        ServerMessage::Error {
            message: err.to_string(),
        }
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}
