//! Study rooms: room state, participant management, WebSocket handling.
//!
//! ## Design
//! - RoomStore: Arc<Mutex<HashMap<String, Room>>>, shared across all connections
//! - Each Room has a broadcast channel (tokio::sync::broadcast) for real-time fan-out
//! - Each WS client subscribes to the room's broadcast sender
//! - Every timer or playback change takes the room's next `seq`, so members
//!   can discard snapshots that arrive out of order
//!
//! ## Room lifecycle
//! 1. Host calls POST /room/create → gets a 6-char code and a host token
//! 2. Host connects to WS /ws/CODE?token=… → is assigned the host role
//! 3. Guests connect to WS /ws/CODE → get the guest role
//! 4. Members run their own study timers, chat, and drive shared playback
//! 5. Host sends close_room with the token → everyone receives room_closed

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{SystemTime, UNIX_EPOCH};

use base64::Engine;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use subtle::ConstantTimeEq;
use tokio::sync::broadcast;
use tokio_tungstenite::tungstenite::Message as WsMessage;

use crate::error::{Result, RoomError};
use crate::playback::{PlaybackCommand, PlaybackSnapshot};
use crate::protocol::{ClientMessage, RoomState, RoomSummary, ServerMessage, MAX_NAME_LEN};
use crate::timer::{StudySession, TimerBoard, TimerCommand, TimerSnapshot, TimerUpdate};
use crate::web::HubState;

/// Shared room store: room code → Room.
pub type RoomStore = Arc<Mutex<HashMap<String, Room>>>;

/// Colors assigned to participants in round-robin order.
pub const PARTICIPANT_COLORS: &[&str] = &[
    "#58a6ff", "#f0883e", "#a371f7", "#3fb950", "#e3b341", "#f85149",
];

/// Chat messages kept in memory per room; older ones live in the archive.
pub const MAX_CHAT_HISTORY: usize = 200;

/// Capacity of each room's broadcast channel.
pub const ROOM_CHANNEL_CAP: usize = 256;

/// A connected participant in a room.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Participant {
    pub id: String,
    pub name: String,
    pub color: String,
    pub joined_at_ms: u64,
    pub is_host: bool,
}

/// A chat message from a participant, optionally carrying an uploaded image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: String,
    pub room: String,
    pub author_id: String,
    pub author_name: String,
    pub author_color: String,
    pub text: String,
    pub image_path: Option<String>,
    pub timestamp_ms: u64,
}

/// Returned to whoever creates a room.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomTicket {
    pub code: String,
    pub name: String,
    pub host_token: String,
    pub created_at_ms: u64,
}

/// What changed when a participant left.
#[derive(Debug)]
pub struct Departure {
    pub participant: Participant,
    pub removed_timer: Option<TimerSnapshot>,
    pub finished: Option<StudySession>,
}

/// A study room.
pub struct Room {
    pub code: String,
    pub name: String,
    pub host_id: String,
    host_token: String,
    pub participants: Vec<Participant>,
    pub chat_log: VecDeque<ChatMessage>,
    pub timers: TimerBoard,
    pub playback: PlaybackSnapshot,
    /// Last ordering token handed out in this room.
    pub seq: u64,
    pub created_at_ms: u64,
    /// Broadcast sender; clone to get a Receiver for a new subscriber.
    pub broadcast_tx: broadcast::Sender<ServerMessage>,
}

impl Room {
    fn new(code: String, name: String, host_token: String, created_at_ms: u64) -> Self {
        let (tx, _rx) = broadcast::channel(ROOM_CHANNEL_CAP);
        Self {
            playback: PlaybackSnapshot::new(&code, created_at_ms),
            code,
            name,
            host_id: String::new(),
            host_token,
            participants: Vec::new(),
            chat_log: VecDeque::new(),
            timers: TimerBoard::new(),
            seq: 0,
            created_at_ms,
            broadcast_tx: tx,
        }
    }

    fn next_seq(&mut self) -> u64 {
        self.seq = self.seq.saturating_add(1);
        self.seq
    }

    fn participant(&self, id: &str) -> Result<&Participant> {
        self.participants
            .iter()
            .find(|p| p.id == id)
            .ok_or_else(|| RoomError::ParticipantNotFound { id: id.to_string() })
    }

    fn token_matches(&self, token: &str) -> bool {
        !self.host_token.is_empty()
            && bool::from(self.host_token.as_bytes().ct_eq(token.as_bytes()))
    }

    fn push_chat(&mut self, msg: ChatMessage) {
        if self.chat_log.len() >= MAX_CHAT_HISTORY {
            self.chat_log.pop_front();
        }
        self.chat_log.push_back(msg);
    }

    fn send(&self, msg: ServerMessage) {
        // No subscribers is not an error.
        let _ = self.broadcast_tx.send(msg);
    }

    fn state(&self) -> RoomState {
        RoomState {
            code: self.code.clone(),
            name: self.name.clone(),
            host_id: self.host_id.clone(),
            participants: self.participants.clone(),
            chat_log: self.chat_log.iter().cloned().collect(),
            timers: self.timers.snapshots(),
            playback: self.playback.clone(),
            seq: self.seq,
            created_at_ms: self.created_at_ms,
        }
    }
}

// ---------------------------------------------------------------------------
// Constructor helpers
// ---------------------------------------------------------------------------

/// Create a new empty RoomStore.
pub fn new_room_store() -> RoomStore {
    Arc::new(Mutex::new(HashMap::new()))
}

fn lock(store: &RoomStore) -> MutexGuard<'_, HashMap<String, Room>> {
    store.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Generate a random 6-character uppercase alphanumeric room code.
pub fn generate_code() -> String {
    use rand::Rng;
    const CHARS: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";
    let mut rng = rand::thread_rng();
    (0..6)
        .map(|_| CHARS[rng.gen_range(0..CHARS.len())] as char)
        .collect()
}

/// Canonical form of a room code as typed by a user.
pub fn normalize_code(code: &str) -> String {
    code.trim().to_ascii_uppercase()
}

/// Generate an unguessable URL-safe host token.
pub fn generate_host_token() -> String {
    use rand::RngCore;
    let mut bytes = [0u8; 24];
    rand::thread_rng().fill_bytes(&mut bytes);
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(bytes)
}

/// Current Unix epoch in milliseconds.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Trim and bound a display name, falling back to `fallback` when empty.
pub fn clean_name(name: &str, fallback: &str) -> String {
    let name: String = name.trim().chars().take(MAX_NAME_LEN).collect();
    if name.is_empty() {
        fallback.to_string()
    } else {
        name
    }
}

// ---------------------------------------------------------------------------
// Room operations
// ---------------------------------------------------------------------------

/// Create a new room in the store.
pub fn create_room(store: &RoomStore, name: &str) -> RoomTicket {
    let mut guard = lock(store);
    let mut code = generate_code();
    while guard.contains_key(&code) {
        code = generate_code();
    }
    let ticket = RoomTicket {
        code: code.clone(),
        name: clean_name(name, "Study Room"),
        host_token: generate_host_token(),
        created_at_ms: now_ms(),
    };
    guard.insert(
        code.clone(),
        Room::new(
            code,
            ticket.name.clone(),
            ticket.host_token.clone(),
            ticket.created_at_ms,
        ),
    );
    ticket
}

/// Re-insert a room loaded from the archive, with its recent chat.
pub fn restore_room(store: &RoomStore, ticket: RoomTicket, chat: Vec<ChatMessage>) {
    let mut room = Room::new(
        ticket.code.clone(),
        ticket.name,
        ticket.host_token,
        ticket.created_at_ms,
    );
    for msg in chat {
        room.push_chat(msg);
    }
    lock(store).insert(ticket.code, room);
}

pub fn room_exists(store: &RoomStore, code: &str) -> bool {
    lock(store).contains_key(code)
}

/// Add a participant to a room.
///
/// The participant becomes host when `host_token` matches the room's token.
/// Returns the participant and a receiver subscribed to the room channel.
pub fn join_room(
    store: &RoomStore,
    code: &str,
    name: &str,
    host_token: Option<&str>,
) -> Result<(Participant, broadcast::Receiver<ServerMessage>)> {
    let mut guard = lock(store);
    let room = guard
        .get_mut(code)
        .ok_or_else(|| RoomError::room_not_found(code))?;

    let is_host = host_token.is_some_and(|t| room.token_matches(t));
    let color_idx = room.participants.len() % PARTICIPANT_COLORS.len();

    let participant = Participant {
        id: uuid::Uuid::new_v4().to_string(),
        name: clean_name(name, if is_host { "Host" } else { "Guest" }),
        color: PARTICIPANT_COLORS[color_idx].to_string(),
        joined_at_ms: now_ms(),
        is_host,
    };

    if is_host {
        room.host_id = participant.id.clone();
    }

    let rx = room.broadcast_tx.subscribe();
    room.participants.push(participant.clone());

    Ok((participant, rx))
}

/// Remove a participant and their timer from a room.
///
/// Broadcasts the departure. Returns `None` if the room or participant was not found.
pub fn leave_room(store: &RoomStore, code: &str, participant_id: &str) -> Option<Departure> {
    let mut guard = lock(store);
    let room = guard.get_mut(code)?;
    let idx = room.participants.iter().position(|p| p.id == participant_id)?;
    let participant = room.participants.remove(idx);
    if room.host_id == participant.id {
        room.host_id.clear();
    }

    let (removed_timer, finished) = match room.timers.remove(participant_id, now_ms()) {
        Some((timer, finished)) => (Some(timer), finished),
        None => (None, None),
    };

    room.send(ServerMessage::ParticipantLeave {
        participant_id: participant.id.clone(),
        name: participant.name.clone(),
    });
    if removed_timer.is_some() {
        room.send(ServerMessage::TimerRemoved {
            owner_id: participant.id.clone(),
        });
    }

    Some(Departure {
        participant,
        removed_timer,
        finished,
    })
}

/// Broadcast a message to every subscriber of the room's channel.
pub fn broadcast(store: &RoomStore, code: &str, msg: ServerMessage) {
    if let Some(room) = lock(store).get(code) {
        room.send(msg);
    }
}

/// Change a participant's display name and broadcast the update.
pub fn rename_participant(
    store: &RoomStore,
    code: &str,
    participant_id: &str,
    new_name: &str,
) -> Result<Participant> {
    let mut guard = lock(store);
    let room = guard
        .get_mut(code)
        .ok_or_else(|| RoomError::room_not_found(code))?;
    let p = room
        .participants
        .iter_mut()
        .find(|p| p.id == participant_id)
        .ok_or_else(|| RoomError::ParticipantNotFound {
            id: participant_id.to_string(),
        })?;
    p.name = clean_name(new_name, &p.name);
    let updated = p.clone();

    room.send(ServerMessage::ParticipantUpdate {
        participant: updated.clone(),
    });
    if let Some(timer) = room.timers.rename_owner(participant_id, &updated.name) {
        room.send(ServerMessage::Timer { timer });
    }
    Ok(updated)
}

/// Record and broadcast a chat message written by `author_id`.
pub fn add_chat(
    store: &RoomStore,
    code: &str,
    author_id: &str,
    text: &str,
    image_path: Option<String>,
) -> Result<ChatMessage> {
    let mut guard = lock(store);
    let room = guard
        .get_mut(code)
        .ok_or_else(|| RoomError::room_not_found(code))?;
    let author = room.participant(author_id)?;
    let msg = ChatMessage {
        id: uuid::Uuid::new_v4().to_string(),
        room: code.to_string(),
        author_id: author.id.clone(),
        author_name: author.name.clone(),
        author_color: author.color.clone(),
        text: text.trim().to_string(),
        image_path,
        timestamp_ms: now_ms(),
    };
    room.push_chat(msg.clone());
    room.send(ServerMessage::Chat {
        message: msg.clone(),
    });
    Ok(msg)
}

/// Delete a chat message. Only its author or the host may do so.
pub fn delete_chat(store: &RoomStore, code: &str, requester_id: &str, message_id: &str) -> Result<()> {
    let mut guard = lock(store);
    let room = guard
        .get_mut(code)
        .ok_or_else(|| RoomError::room_not_found(code))?;
    let requester = room.participant(requester_id)?;
    let is_host = requester.is_host;
    let idx = room
        .chat_log
        .iter()
        .position(|m| m.id == message_id)
        .ok_or_else(|| RoomError::invalid(format!("message '{message_id}' not found")))?;
    if !(is_host || room.chat_log[idx].author_id == requester_id) {
        return Err(RoomError::NotAuthorized {
            action: "delete this message",
        });
    }
    room.chat_log.remove(idx);
    room.send(ServerMessage::ChatDeleted {
        id: message_id.to_string(),
    });
    Ok(())
}

/// Apply a command to the sender's own timer and broadcast any change.
pub fn timer_command(
    store: &RoomStore,
    code: &str,
    participant_id: &str,
    cmd: TimerCommand,
    now_ms: u64,
) -> Result<TimerUpdate> {
    let mut guard = lock(store);
    let room = guard
        .get_mut(code)
        .ok_or_else(|| RoomError::room_not_found(code))?;
    let owner_name = room.participant(participant_id)?.name.clone();
    let seq = room.seq.saturating_add(1);
    let update = room
        .timers
        .apply(code, participant_id, &owner_name, cmd, now_ms, seq)?;
    match &update {
        TimerUpdate::Updated(timer) | TimerUpdate::Reset { snapshot: timer, .. } => {
            room.next_seq();
            room.send(ServerMessage::Timer {
                timer: timer.clone(),
            });
        }
        TimerUpdate::Unchanged => {}
    }
    Ok(update)
}

/// Apply a playback command and broadcast the new snapshot if it changed.
pub fn playback_command(
    store: &RoomStore,
    code: &str,
    participant_id: &str,
    cmd: PlaybackCommand,
    now_ms: u64,
    tolerance_ms: u64,
) -> Result<Option<PlaybackSnapshot>> {
    let mut guard = lock(store);
    let room = guard
        .get_mut(code)
        .ok_or_else(|| RoomError::room_not_found(code))?;
    let is_host = room.participant(participant_id)?.is_host;
    let seq = room.seq.saturating_add(1);
    if !room
        .playback
        .apply(participant_id, is_host, cmd, now_ms, seq, tolerance_ms)?
    {
        return Ok(None);
    }
    room.next_seq();
    let playback = room.playback.clone();
    room.send(ServerMessage::Playback {
        playback: playback.clone(),
    });
    Ok(Some(playback))
}

/// Close a room. Requires the host token.
///
/// Broadcasts `room_closed`, drops the room (ending every subscriber once
/// drained) and returns the study sessions of timers still holding time.
pub fn close_room(store: &RoomStore, code: &str, host_token: &str) -> Result<Vec<StudySession>> {
    let mut guard = lock(store);
    let room = guard
        .get(code)
        .ok_or_else(|| RoomError::room_not_found(code))?;
    if !room.token_matches(host_token) {
        return Err(RoomError::NotAuthorized {
            action: "close the room",
        });
    }
    room.send(ServerMessage::RoomClosed);
    let mut room = guard
        .remove(code)
        .ok_or_else(|| RoomError::room_not_found(code))?;
    let now = now_ms();
    let owners: Vec<String> = room.timers.snapshots().into_iter().map(|t| t.owner_id).collect();
    Ok(owners
        .iter()
        .filter_map(|owner| room.timers.remove(owner, now).and_then(|(_, finished)| finished))
        .collect())
}

/// Snapshot the room state.
pub fn room_state(store: &RoomStore, code: &str) -> Option<RoomState> {
    lock(store).get(code).map(Room::state)
}

/// Directory of open rooms, newest first.
pub fn list_rooms(store: &RoomStore) -> Vec<RoomSummary> {
    let mut rooms: Vec<RoomSummary> = lock(store)
        .values()
        .map(|room| RoomSummary {
            code: room.code.clone(),
            name: room.name.clone(),
            participant_count: room.participants.len(),
            is_playing: room.playback.is_playing,
            created_at_ms: room.created_at_ms,
        })
        .collect();
    rooms.sort_by(|a, b| b.created_at_ms.cmp(&a.created_at_ms).then(a.code.cmp(&b.code)));
    rooms
}

// ---------------------------------------------------------------------------
// WebSocket handler
// ---------------------------------------------------------------------------

/// Handle an established WebSocket connection for room `code`.
///
/// `ws_stream`  : the tokio-tungstenite WebSocketStream
/// `hub`        : shared hub state (rooms, archive, config)
/// `code`       : the room code
/// `name`       : requested display name
/// `host_token` : proves host rights when it matches the room's token
pub async fn handle_ws(
    ws_stream: tokio_tungstenite::WebSocketStream<tokio::net::TcpStream>,
    hub: HubState,
    code: String,
    name: String,
    host_token: Option<String>,
) {
    let store = hub.rooms.clone();
    let (participant, mut room_rx) = match join_room(&store, &code, &name, host_token.as_deref()) {
        Ok(pair) => pair,
        Err(err) => {
            // Unknown room: report and hang up.
            let (mut sink, _) = ws_stream.split();
            if let Ok(text) = ServerMessage::error(&err).to_json() {
                let _ = sink.send(WsMessage::Text(text)).await;
            }
            return;
        }
    };

    let participant_id = participant.id.clone();
    tracing::info!(room = %code, participant = %participant_id, host = participant.is_host, "joined");
    hub.with_archive(|a| a.record_join(&code, &participant));

    let (mut ws_sink, mut ws_stream) = ws_stream.split();

    // Send welcome message to this client.
    if let Some(room) = room_state(&store, &code) {
        let welcome = ServerMessage::Welcome {
            participant: participant.clone(),
            room,
            server_time_ms: now_ms(),
        };
        if let Ok(text) = welcome.to_json() {
            if ws_sink.send(WsMessage::Text(text)).await.is_err() {
                finish_departure(&hub, &code, &participant_id);
                return;
            }
        }
    }

    // Notify all participants about the new joiner.
    broadcast(
        &store,
        &code,
        ServerMessage::ParticipantJoin { participant },
    );

    // Main loop: multiplex incoming WS frames and broadcast messages.
    loop {
        tokio::select! {
            // Message from this client.
            msg = ws_stream.next() => {
                match msg {
                    Some(Ok(WsMessage::Text(text))) => {
                        let reply = match ClientMessage::parse(&text) {
                            Ok(client_msg) => dispatch(&hub, &code, &participant_id, client_msg),
                            Err(err) => Some(ServerMessage::error(&err)),
                        };
                        if let Some(reply) = reply {
                            if let Ok(text) = reply.to_json() {
                                if ws_sink.send(WsMessage::Text(text)).await.is_err() {
                                    break;
                                }
                            }
                        }
                    }
                    Some(Ok(_)) => {} // Ignore binary / ping / pong frames
                    Some(Err(_)) | None => break, // Connection closed or error
                }
            }

            // Broadcast message from the room channel.
            bcast = room_rx.recv() => {
                match bcast {
                    Ok(msg) => {
                        let closing = matches!(msg, ServerMessage::RoomClosed);
                        if let Ok(text) = msg.to_json() {
                            if ws_sink.send(WsMessage::Text(text)).await.is_err() {
                                break;
                            }
                        }
                        if closing {
                            let _ = ws_sink.send(WsMessage::Close(None)).await;
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        // The next snapshot corrects whatever was missed.
                        tracing::debug!(room = %code, skipped, "subscriber lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        }
    }

    // Client disconnected: clean up and notify others.
    finish_departure(&hub, &code, &participant_id);
}

/// Handle one parsed client message; returns a reply for the sender only.
///
/// State changes reach the sender through the room broadcast like everyone else.
fn dispatch(hub: &HubState, code: &str, participant_id: &str, msg: ClientMessage) -> Option<ServerMessage> {
    let store = &hub.rooms;
    let now = now_ms();

    if let Some(cmd) = msg.timer_command() {
        return match timer_command(store, code, participant_id, cmd, now) {
            Ok(TimerUpdate::Reset {
                finished: Some(session),
                ..
            }) => {
                hub.with_archive(|a| a.save_session(&session));
                None
            }
            Ok(_) => None,
            Err(err) => Some(ServerMessage::error(&err)),
        };
    }

    if let Some(cmd) = msg.playback_command() {
        let tolerance = hub.config.sync.playback_tolerance_ms;
        return playback_command(store, code, participant_id, cmd, now, tolerance)
            .err()
            .map(|err| ServerMessage::error(&err));
    }

    let result = match msg {
        ClientMessage::SetName { name } => {
            rename_participant(store, code, participant_id, &name).map(|p| {
                hub.with_archive(|a| a.rename_member(code, &p.id, &p.name));
            })
        }
        ClientMessage::Chat { text, image_path } => {
            add_chat(store, code, participant_id, &text, image_path).map(|m| {
                hub.with_archive(|a| a.save_message(&m));
            })
        }
        ClientMessage::DeleteChat { id } => {
            delete_chat(store, code, participant_id, &id).map(|()| {
                hub.with_archive(|a| a.delete_message(&id));
            })
        }
        ClientMessage::CloseRoom { host_token } => {
            close_room(store, code, &host_token).map(|sessions| {
                tracing::info!(room = %code, "room closed by host");
                hub.with_archive(|a| {
                    for session in &sessions {
                        a.save_session(session)?;
                    }
                    a.close_room(code, now)
                });
            })
        }
        ClientMessage::Ping => {
            return Some(ServerMessage::Pong {
                server_time_ms: now,
            })
        }
        other => Err(RoomError::invalid(format!("unhandled message {other:?}"))),
    };

    result.err().map(|err| {
        tracing::debug!(room = %code, participant = %participant_id, error = %err, "rejected message");
        ServerMessage::error(&err)
    })
}

fn finish_departure(hub: &HubState, code: &str, participant_id: &str) {
    if let Some(departure) = leave_room(&hub.rooms, code, participant_id) {
        tracing::info!(room = %code, participant = %participant_id, "left");
        hub.with_archive(|a| {
            if let Some(session) = &departure.finished {
                a.save_session(session)?;
            }
            a.record_leave(code, participant_id, now_ms())
        });
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    const T0: u64 = 1_700_000_000_000;

    fn room_with_host() -> (RoomStore, RoomTicket, Participant) {
        let store = new_room_store();
        let ticket = create_room(&store, "Calculus");
        let (host, _rx) = join_room(&store, &ticket.code, "Ada", Some(&ticket.host_token)).unwrap();
        (store, ticket, host)
    }

    // -- generate_code / tokens ---------------------------------------------

    #[test]
    fn test_normalize_code_trims_and_uppercases() {
        assert_eq!(normalize_code(" ab12cd "), "AB12CD");
        let code = generate_code();
        assert_eq!(normalize_code(&code), code);
    }

    #[test]
    fn test_generate_code_length_is_six() {
        assert_eq!(generate_code().len(), 6);
    }

    #[test]
    fn test_generate_code_all_uppercase_alphanumeric() {
        let code = generate_code();
        assert!(
            code.chars().all(|c| c.is_ascii_uppercase() || c.is_ascii_digit()),
            "code '{}' contains non-uppercase-alphanumeric chars",
            code
        );
    }

    #[test]
    fn test_host_token_is_url_safe_and_unique() {
        let a = generate_host_token();
        let b = generate_host_token();
        assert_ne!(a, b);
        assert_eq!(a.len(), 32);
        assert!(a.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_'));
    }

    #[test]
    fn test_now_ms_plausible_epoch() {
        // Must be after 2024-01-01 in milliseconds
        assert!(now_ms() > 1_704_067_200_000, "now_ms() appears to predate 2024");
    }

    #[test]
    fn test_clean_name_fallback_and_trim() {
        assert_eq!(clean_name("   ", "Guest"), "Guest");
        assert_eq!(clean_name("  Ada ", "Guest"), "Ada");
        assert_eq!(clean_name(&"x".repeat(100), "Guest").len(), MAX_NAME_LEN);
    }

    // -- create_room ----------------------------------------------------------

    #[test]
    fn test_create_room_inserts_into_store() {
        let store = new_room_store();
        let ticket = create_room(&store, "Physics");
        assert!(room_exists(&store, &ticket.code));
        assert_eq!(ticket.name, "Physics");
    }

    #[test]
    fn test_create_room_default_name() {
        let store = new_room_store();
        let ticket = create_room(&store, "");
        assert_eq!(ticket.name, "Study Room");
    }

    #[test]
    fn test_create_room_starts_empty() {
        let store = new_room_store();
        let ticket = create_room(&store, "x");
        let state = room_state(&store, &ticket.code).unwrap();
        assert!(state.participants.is_empty());
        assert!(state.chat_log.is_empty());
        assert!(state.timers.is_empty());
        assert!(state.playback.video_url.is_none());
        assert_eq!(state.seq, 0);
    }

    // -- join_room ------------------------------------------------------------

    #[test]
    fn test_join_with_token_becomes_host() {
        let (store, ticket, host) = room_with_host();
        assert!(host.is_host);
        assert_eq!(room_state(&store, &ticket.code).unwrap().host_id, host.id);
    }

    #[test]
    fn test_join_with_wrong_token_is_guest() {
        let (store, ticket, host) = room_with_host();
        let (guest, _rx) = join_room(&store, &ticket.code, "Bob", Some("forged")).unwrap();
        assert!(!guest.is_host);
        assert_eq!(room_state(&store, &ticket.code).unwrap().host_id, host.id);
    }

    #[test]
    fn test_join_room_colors_cycle_through_palette() {
        let store = new_room_store();
        let ticket = create_room(&store, "x");
        for (i, expected) in PARTICIPANT_COLORS.iter().enumerate() {
            let (p, _) = join_room(&store, &ticket.code, &format!("P{i}"), None).unwrap();
            assert_eq!(&p.color, expected);
        }
    }

    #[test]
    fn test_join_room_error_on_nonexistent_code() {
        let store = new_room_store();
        let err = join_room(&store, "XXXXXX", "Alice", None).unwrap_err();
        assert!(err.to_string().contains("XXXXXX"), "error should mention the code: {}", err);
    }

    // -- leave_room -----------------------------------------------------------

    #[test]
    fn test_leave_room_removes_participant_and_timer() {
        let (store, ticket, host) = room_with_host();
        timer_command(&store, &ticket.code, &host.id, TimerCommand::Start { subject: None }, T0).unwrap();
        let departure = leave_room(&store, &ticket.code, &host.id).unwrap();
        assert_eq!(departure.participant.id, host.id);
        assert!(departure.removed_timer.is_some());
        let state = room_state(&store, &ticket.code).unwrap();
        assert!(state.participants.is_empty());
        assert!(state.timers.is_empty());
        assert!(state.host_id.is_empty());
    }

    #[test]
    fn test_leave_room_unknown_participant_returns_none() {
        let (store, ticket, _host) = room_with_host();
        assert!(leave_room(&store, &ticket.code, "nonexistent-id").is_none());
        assert!(leave_room(&store, "XXXXXX", "some-id").is_none());
    }

    #[test]
    fn test_leave_room_broadcasts_leave_and_timer_removed() {
        let (store, ticket, host) = room_with_host();
        let (_guest, mut rx) = join_room(&store, &ticket.code, "Bob", None).unwrap();
        timer_command(&store, &ticket.code, &host.id, TimerCommand::Start { subject: None }, T0).unwrap();
        leave_room(&store, &ticket.code, &host.id);
        assert!(matches!(rx.try_recv().unwrap(), ServerMessage::Timer { .. }));
        assert!(matches!(rx.try_recv().unwrap(), ServerMessage::ParticipantLeave { .. }));
        assert_eq!(
            rx.try_recv().unwrap(),
            ServerMessage::TimerRemoved { owner_id: host.id }
        );
    }

    // -- broadcast ------------------------------------------------------------

    #[test]
    fn test_broadcast_to_existing_room_sends_to_subscriber() {
        let (store, ticket, _host) = room_with_host();
        let (_guest, mut rx) = join_room(&store, &ticket.code, "Bob", None).unwrap();
        broadcast(&store, &ticket.code, ServerMessage::RoomClosed);
        assert_eq!(rx.try_recv().unwrap(), ServerMessage::RoomClosed);
    }

    #[test]
    fn test_broadcast_to_nonexistent_room_is_noop() {
        let store = new_room_store();
        // Must not panic
        broadcast(&store, "XXXXXX", ServerMessage::RoomClosed);
    }

    // -- chat -----------------------------------------------------------------

    #[test]
    fn test_add_chat_uses_author_identity() {
        let (store, ticket, host) = room_with_host();
        let msg = add_chat(&store, &ticket.code, &host.id, "  hello  ", None).unwrap();
        assert_eq!(msg.author_name, "Ada");
        assert_eq!(msg.author_color, host.color);
        assert_eq!(msg.text, "hello");
        assert_eq!(msg.room, ticket.code);
    }

    #[test]
    fn test_add_chat_from_stranger_fails() {
        let (store, ticket, _host) = room_with_host();
        let err = add_chat(&store, &ticket.code, "ghost", "hi", None).unwrap_err();
        assert!(matches!(err, RoomError::ParticipantNotFound { .. }));
    }

    #[test]
    fn test_chat_log_is_capped() {
        let (store, ticket, host) = room_with_host();
        for i in 0..(MAX_CHAT_HISTORY + 5) {
            add_chat(&store, &ticket.code, &host.id, &format!("msg {i}"), None).unwrap();
        }
        let state = room_state(&store, &ticket.code).unwrap();
        assert_eq!(state.chat_log.len(), MAX_CHAT_HISTORY);
        assert_eq!(state.chat_log[0].text, "msg 5");
    }

    #[test]
    fn test_delete_chat_by_author_and_host_only() {
        let (store, ticket, host) = room_with_host();
        let (bob, _rx1) = join_room(&store, &ticket.code, "Bob", None).unwrap();
        let (eve, _rx2) = join_room(&store, &ticket.code, "Eve", None).unwrap();
        let m1 = add_chat(&store, &ticket.code, &bob.id, "one", None).unwrap();
        let m2 = add_chat(&store, &ticket.code, &bob.id, "two", None).unwrap();

        let err = delete_chat(&store, &ticket.code, &eve.id, &m1.id).unwrap_err();
        assert!(matches!(err, RoomError::NotAuthorized { .. }));
        delete_chat(&store, &ticket.code, &bob.id, &m1.id).unwrap();
        delete_chat(&store, &ticket.code, &host.id, &m2.id).unwrap();
        assert!(room_state(&store, &ticket.code).unwrap().chat_log.is_empty());
    }

    // -- rename ---------------------------------------------------------------

    #[test]
    fn test_rename_updates_participant_and_timer() {
        let (store, ticket, host) = room_with_host();
        timer_command(&store, &ticket.code, &host.id, TimerCommand::Start { subject: None }, T0).unwrap();
        let p = rename_participant(&store, &ticket.code, &host.id, "Ada L.").unwrap();
        assert_eq!(p.name, "Ada L.");
        let state = room_state(&store, &ticket.code).unwrap();
        assert_eq!(state.timers[0].owner_name, "Ada L.");
    }

    // -- timers and sequencing -------------------------------------------------

    #[test]
    fn test_timer_changes_take_increasing_seq() {
        let (store, ticket, host) = room_with_host();
        let mut last = 0;
        for cmd in [
            TimerCommand::Start { subject: Some("Algebra".into()) },
            TimerCommand::Pause,
            TimerCommand::Start { subject: None },
            TimerCommand::Reset,
        ] {
            let update = timer_command(&store, &ticket.code, &host.id, cmd, T0).unwrap();
            let seq = match update {
                TimerUpdate::Updated(t) | TimerUpdate::Reset { snapshot: t, .. } => t.seq,
                TimerUpdate::Unchanged => panic!("expected a change"),
            };
            assert!(seq > last);
            last = seq;
        }
        assert_eq!(room_state(&store, &ticket.code).unwrap().seq, last);
    }

    #[test]
    fn test_unchanged_timer_command_does_not_consume_seq() {
        let (store, ticket, host) = room_with_host();
        let update = timer_command(&store, &ticket.code, &host.id, TimerCommand::Pause, T0).unwrap();
        assert_eq!(update, TimerUpdate::Unchanged);
        assert_eq!(room_state(&store, &ticket.code).unwrap().seq, 0);
    }

    #[test]
    fn test_timers_are_per_owner() {
        let (store, ticket, host) = room_with_host();
        let (bob, _rx) = join_room(&store, &ticket.code, "Bob", None).unwrap();
        timer_command(&store, &ticket.code, &host.id, TimerCommand::Start { subject: None }, T0).unwrap();
        // Bob pausing only touches Bob's timer.
        let update = timer_command(&store, &ticket.code, &bob.id, TimerCommand::Pause, T0 + 5).unwrap();
        assert_eq!(update, TimerUpdate::Unchanged);
        let state = room_state(&store, &ticket.code).unwrap();
        let host_timer = state.timers.iter().find(|t| t.owner_id == host.id).unwrap();
        assert!(host_timer.is_running);
    }

    // -- playback --------------------------------------------------------------

    #[test]
    fn test_playback_flow_and_seq() {
        let (store, ticket, host) = room_with_host();
        let (bob, _rx) = join_room(&store, &ticket.code, "Bob", None).unwrap();
        let load = PlaybackCommand::Load {
            video_url: "https://v.example.com/a.mp4".into(),
        };
        assert!(playback_command(&store, &ticket.code, &bob.id, load.clone(), T0, 3_000).is_err());
        let loaded = playback_command(&store, &ticket.code, &host.id, load, T0, 3_000)
            .unwrap()
            .unwrap();
        let played = playback_command(
            &store,
            &ticket.code,
            &bob.id,
            PlaybackCommand::Play { position_ms: 0 },
            T0 + 10,
            3_000,
        )
        .unwrap()
        .unwrap();
        assert!(played.seq > loaded.seq);
        let noop = playback_command(
            &store,
            &ticket.code,
            &host.id,
            PlaybackCommand::Play { position_ms: 100 },
            T0 + 20,
            3_000,
        )
        .unwrap();
        assert!(noop.is_none());
    }

    // -- close_room ------------------------------------------------------------

    #[test]
    fn test_close_room_requires_token() {
        let (store, ticket, _host) = room_with_host();
        let err = close_room(&store, &ticket.code, "wrong").unwrap_err();
        assert!(matches!(err, RoomError::NotAuthorized { .. }));
        assert!(room_exists(&store, &ticket.code));
    }

    #[test]
    fn test_close_room_broadcasts_and_returns_sessions() {
        let (store, ticket, host) = room_with_host();
        let (_bob, mut rx) = join_room(&store, &ticket.code, "Bob", None).unwrap();
        timer_command(&store, &ticket.code, &host.id, TimerCommand::Start { subject: None }, 1).unwrap();
        let sessions = close_room(&store, &ticket.code, &ticket.host_token).unwrap();
        assert_eq!(sessions.len(), 1);
        assert!(!room_exists(&store, &ticket.code));
        assert!(matches!(rx.try_recv().unwrap(), ServerMessage::Timer { .. }));
        assert_eq!(rx.try_recv().unwrap(), ServerMessage::RoomClosed);
    }

    // -- restore / list ----------------------------------------------------------

    #[test]
    fn test_restore_room_keeps_token_and_chat() {
        let store = new_room_store();
        let ticket = RoomTicket {
            code: "ABC123".into(),
            name: "Restored".into(),
            host_token: "tok".into(),
            created_at_ms: 5,
        };
        let msg = ChatMessage {
            id: "m1".into(),
            room: "ABC123".into(),
            author_id: "p1".into(),
            author_name: "Ada".into(),
            author_color: "#58a6ff".into(),
            text: "earlier".into(),
            image_path: None,
            timestamp_ms: 1,
        };
        restore_room(&store, ticket, vec![msg]);
        let (p, _rx) = join_room(&store, "ABC123", "Ada", Some("tok")).unwrap();
        assert!(p.is_host);
        assert_eq!(room_state(&store, "ABC123").unwrap().chat_log.len(), 1);
    }

    #[test]
    fn test_list_rooms_reports_counts() {
        let (store, ticket, _host) = room_with_host();
        create_room(&store, "Empty");
        let rooms = list_rooms(&store);
        assert_eq!(rooms.len(), 2);
        let mine = rooms.iter().find(|r| r.code == ticket.code).unwrap();
        assert_eq!(mine.participant_count, 1);
        assert_eq!(mine.name, "Calculus");
    }

    // -- serialization -----------------------------------------------------------

    #[test]
    fn test_participant_serializes_all_fields() {
        let p = Participant {
            id: "abc".to_string(),
            name: "Alice".to_string(),
            color: "#58a6ff".to_string(),
            joined_at_ms: 9999,
            is_host: true,
        };
        let json = serde_json::to_string(&p).unwrap();
        assert!(json.contains("\"id\":\"abc\""));
        assert!(json.contains("\"color\":\"#58a6ff\""));
        assert!(json.contains("\"is_host\":true"));
    }

    #[test]
    fn test_chat_message_null_image_serializes() {
        let msg = ChatMessage {
            id: "m2".to_string(),
            room: "R".to_string(),
            author_id: "p1".to_string(),
            author_name: "Frank".to_string(),
            author_color: "#f0883e".to_string(),
            text: "general comment".to_string(),
            image_path: None,
            timestamp_ms: 0,
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("\"image_path\":null"));
    }
}
