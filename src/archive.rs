//! SQLite write-through archive of rooms, members, chat, study sessions and media.
//!
//! The live hub never reads from the archive except at startup (to restore
//! open rooms) and for history endpoints. All writes are synchronous and
//! short; the connection is guarded by a `std::sync::Mutex`.

use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};

use rusqlite::{params, Connection, OptionalExtension};

use crate::collab::{ChatMessage, Participant, RoomTicket};
use crate::error::Result;
use crate::media::StoredMedia;
use crate::timer::StudySession;

/// Default number of messages returned by a history page.
pub const DEFAULT_PAGE: usize = 50;
/// Largest history page served.
pub const MAX_PAGE: usize = 200;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS rooms (
    code          TEXT PRIMARY KEY,
    name          TEXT NOT NULL,
    host_token    TEXT NOT NULL,
    created_at_ms INTEGER NOT NULL,
    closed_at_ms  INTEGER
);
CREATE TABLE IF NOT EXISTS members (
    room          TEXT NOT NULL,
    id            TEXT NOT NULL,
    name          TEXT NOT NULL,
    color         TEXT NOT NULL,
    is_host       INTEGER NOT NULL,
    joined_at_ms  INTEGER NOT NULL,
    left_at_ms    INTEGER,
    PRIMARY KEY (room, id)
);
CREATE TABLE IF NOT EXISTS messages (
    id            TEXT PRIMARY KEY,
    room          TEXT NOT NULL,
    author_id     TEXT NOT NULL,
    author_name   TEXT NOT NULL,
    author_color  TEXT NOT NULL,
    text          TEXT NOT NULL,
    image_path    TEXT,
    timestamp_ms  INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS messages_room_ts ON messages (room, timestamp_ms);
CREATE TABLE IF NOT EXISTS study_sessions (
    id            INTEGER PRIMARY KEY AUTOINCREMENT,
    room          TEXT NOT NULL,
    owner_name    TEXT NOT NULL,
    subject       TEXT NOT NULL,
    elapsed_ms    INTEGER NOT NULL,
    ended_at_ms   INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS media (
    path          TEXT PRIMARY KEY,
    content_type  TEXT NOT NULL,
    size          INTEGER NOT NULL,
    created_at_ms INTEGER NOT NULL
);
";

#[derive(Debug)]
pub struct Archive {
    conn: Mutex<Connection>,
}

impl Archive {
    /// Open (or create) the archive database at `path`.
    pub fn open(path: &Path) -> Result<Self> {
        Self::init(Connection::open(path)?)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // -- rooms ---------------------------------------------------------------

    pub fn save_room(&self, ticket: &RoomTicket) -> Result<()> {
        self.conn().execute(
            "INSERT INTO rooms (code, name, host_token, created_at_ms)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(code) DO UPDATE SET
               name = excluded.name,
               host_token = excluded.host_token,
               closed_at_ms = NULL",
            params![
                ticket.code,
                ticket.name,
                ticket.host_token,
                clamp_i64(ticket.created_at_ms)
            ],
        )?;
        Ok(())
    }

    pub fn close_room(&self, code: &str, closed_at_ms: u64) -> Result<()> {
        self.conn().execute(
            "UPDATE rooms SET closed_at_ms = ?2 WHERE code = ?1",
            params![code, clamp_i64(closed_at_ms)],
        )?;
        Ok(())
    }

    /// Rooms that were never closed, oldest first.
    pub fn open_rooms(&self) -> Result<Vec<RoomTicket>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT code, name, host_token, created_at_ms
             FROM rooms WHERE closed_at_ms IS NULL
             ORDER BY created_at_ms, code",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(RoomTicket {
                code: row.get(0)?,
                name: row.get(1)?,
                host_token: row.get(2)?,
                created_at_ms: to_u64(row.get(3)?),
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Whether the room was ever archived, open or closed.
    pub fn knows_room(&self, code: &str) -> Result<bool> {
        let found: Option<String> = self
            .conn()
            .query_row("SELECT code FROM rooms WHERE code = ?1", params![code], |row| {
                row.get(0)
            })
            .optional()?;
        Ok(found.is_some())
    }

    // -- members -------------------------------------------------------------

    pub fn record_join(&self, room: &str, participant: &Participant) -> Result<()> {
        self.conn().execute(
            "INSERT OR REPLACE INTO members (room, id, name, color, is_host, joined_at_ms)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                room,
                participant.id,
                participant.name,
                participant.color,
                participant.is_host,
                clamp_i64(participant.joined_at_ms)
            ],
        )?;
        Ok(())
    }

    pub fn rename_member(&self, room: &str, id: &str, name: &str) -> Result<()> {
        self.conn().execute(
            "UPDATE members SET name = ?3 WHERE room = ?1 AND id = ?2",
            params![room, id, name],
        )?;
        Ok(())
    }

    pub fn record_leave(&self, room: &str, id: &str, left_at_ms: u64) -> Result<()> {
        self.conn().execute(
            "UPDATE members SET left_at_ms = ?3 WHERE room = ?1 AND id = ?2",
            params![room, id, clamp_i64(left_at_ms)],
        )?;
        Ok(())
    }

    // -- messages ------------------------------------------------------------

    pub fn save_message(&self, msg: &ChatMessage) -> Result<()> {
        self.conn().execute(
            "INSERT OR REPLACE INTO messages
             (id, room, author_id, author_name, author_color, text, image_path, timestamp_ms)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                msg.id,
                msg.room,
                msg.author_id,
                msg.author_name,
                msg.author_color,
                msg.text,
                msg.image_path,
                clamp_i64(msg.timestamp_ms)
            ],
        )?;
        Ok(())
    }

    pub fn delete_message(&self, id: &str) -> Result<()> {
        self.conn()
            .execute("DELETE FROM messages WHERE id = ?1", params![id])?;
        Ok(())
    }

    /// Up to `limit` messages of `room` strictly older than `before_ms`
    /// (or the newest ones when `None`), returned oldest first.
    pub fn load_messages(
        &self,
        room: &str,
        before_ms: Option<u64>,
        limit: usize,
    ) -> Result<Vec<ChatMessage>> {
        let limit = limit.clamp(1, MAX_PAGE);
        let before = before_ms.map(clamp_i64).unwrap_or(i64::MAX);
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT id, room, author_id, author_name, author_color, text, image_path, timestamp_ms
             FROM messages
             WHERE room = ?1 AND timestamp_ms < ?2
             ORDER BY timestamp_ms DESC, rowid DESC
             LIMIT ?3",
        )?;
        let rows = stmt.query_map(params![room, before, limit as i64], |row| {
            Ok(ChatMessage {
                id: row.get(0)?,
                room: row.get(1)?,
                author_id: row.get(2)?,
                author_name: row.get(3)?,
                author_color: row.get(4)?,
                text: row.get(5)?,
                image_path: row.get(6)?,
                timestamp_ms: to_u64(row.get(7)?),
            })
        })?;
        let mut messages = rows.collect::<rusqlite::Result<Vec<_>>>()?;
        messages.reverse();
        Ok(messages)
    }

    // -- study sessions --------------------------------------------------------

    pub fn save_session(&self, session: &StudySession) -> Result<()> {
        self.conn().execute(
            "INSERT INTO study_sessions (room, owner_name, subject, elapsed_ms, ended_at_ms)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                session.room,
                session.owner_name,
                session.subject,
                clamp_i64(session.elapsed_ms),
                clamp_i64(session.ended_at_ms)
            ],
        )?;
        Ok(())
    }

    /// Most recent sessions of `room`, newest first.
    pub fn load_sessions(&self, room: &str, limit: usize) -> Result<Vec<StudySession>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT room, owner_name, subject, elapsed_ms, ended_at_ms
             FROM study_sessions WHERE room = ?1
             ORDER BY ended_at_ms DESC, id DESC
             LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![room, limit.clamp(1, MAX_PAGE) as i64], |row| {
            Ok(StudySession {
                room: row.get(0)?,
                owner_name: row.get(1)?,
                subject: row.get(2)?,
                elapsed_ms: to_u64(row.get(3)?),
                ended_at_ms: to_u64(row.get(4)?),
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    // -- media ----------------------------------------------------------------

    pub fn record_media(&self, media: &StoredMedia, created_at_ms: u64) -> Result<()> {
        self.conn().execute(
            "INSERT OR IGNORE INTO media (path, content_type, size, created_at_ms)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                media.path,
                media.content_type,
                clamp_i64(media.size),
                clamp_i64(created_at_ms)
            ],
        )?;
        Ok(())
    }
}

fn clamp_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

fn to_u64(value: i64) -> u64 {
    u64::try_from(value).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn media_rows(archive: &Archive) -> u64 {
        let n: i64 = archive
            .conn()
            .query_row("SELECT COUNT(*) FROM media", [], |row| row.get(0))
            .unwrap();
        to_u64(n)
    }

    fn ticket(code: &str, created_at_ms: u64) -> RoomTicket {
        RoomTicket {
            code: code.into(),
            name: format!("Room {code}"),
            host_token: "secret".into(),
            created_at_ms,
        }
    }

    fn message(id: &str, room: &str, ts: u64) -> ChatMessage {
        ChatMessage {
            id: id.into(),
            room: room.into(),
            author_id: "p1".into(),
            author_name: "Ada".into(),
            author_color: "#58a6ff".into(),
            text: format!("text {id}"),
            image_path: None,
            timestamp_ms: ts,
        }
    }

    #[test]
    fn test_open_rooms_excludes_closed() {
        let archive = Archive::open_in_memory().unwrap();
        archive.save_room(&ticket("AAAAAA", 1)).unwrap();
        archive.save_room(&ticket("BBBBBB", 2)).unwrap();
        archive.close_room("AAAAAA", 10).unwrap();
        let open = archive.open_rooms().unwrap();
        assert_eq!(open, vec![ticket("BBBBBB", 2)]);
        assert!(archive.knows_room("AAAAAA").unwrap());
        assert!(!archive.knows_room("CCCCCC").unwrap());
    }

    #[test]
    fn test_load_messages_pages_backwards() {
        let archive = Archive::open_in_memory().unwrap();
        for i in 0..10u64 {
            archive.save_message(&message(&format!("m{i}"), "R", 100 + i)).unwrap();
        }
        archive.save_message(&message("other", "S", 105)).unwrap();

        let newest = archive.load_messages("R", None, 3).unwrap();
        let ids: Vec<&str> = newest.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, vec!["m7", "m8", "m9"]);

        let older = archive.load_messages("R", Some(107), 3).unwrap();
        let ids: Vec<&str> = older.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, vec!["m4", "m5", "m6"]);
    }

    #[test]
    fn test_delete_message() {
        let archive = Archive::open_in_memory().unwrap();
        archive.save_message(&message("m1", "R", 1)).unwrap();
        archive.delete_message("m1").unwrap();
        assert!(archive.load_messages("R", None, DEFAULT_PAGE).unwrap().is_empty());
    }

    #[test]
    fn test_sessions_newest_first() {
        let archive = Archive::open_in_memory().unwrap();
        for (i, subject) in ["Algebra", "Biology"].iter().enumerate() {
            archive
                .save_session(&StudySession {
                    room: "R".into(),
                    owner_name: "Ada".into(),
                    subject: subject.to_string(),
                    elapsed_ms: 60_000,
                    ended_at_ms: 1_000 + i as u64,
                })
                .unwrap();
        }
        let sessions = archive.load_sessions("R", 10).unwrap();
        assert_eq!(sessions[0].subject, "Biology");
        assert_eq!(sessions.len(), 2);
    }

    #[test]
    fn test_record_media_is_idempotent() {
        let archive = Archive::open_in_memory().unwrap();
        let media = StoredMedia {
            path: "avatar/p1/abcd.png".into(),
            content_type: "image/png".into(),
            size: 42,
        };
        archive.record_media(&media, 1).unwrap();
        archive.record_media(&media, 2).unwrap();
        assert_eq!(media_rows(&archive), 1);
    }

    #[test]
    fn test_member_lifecycle() {
        let archive = Archive::open_in_memory().unwrap();
        let p = Participant {
            id: "p1".into(),
            name: "Ada".into(),
            color: "#58a6ff".into(),
            joined_at_ms: 5,
            is_host: true,
        };
        archive.record_join("R", &p).unwrap();
        archive.rename_member("R", "p1", "Ada L.").unwrap();
        archive.record_leave("R", "p1", 9).unwrap();
        let (name, left): (String, Option<i64>) = archive
            .conn()
            .query_row(
                "SELECT name, left_at_ms FROM members WHERE id = 'p1'",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .unwrap();
        assert_eq!(name, "Ada L.");
        assert_eq!(left, Some(9));
    }

    #[test]
    fn test_file_backed_archive_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rooms.db");
        {
            let archive = Archive::open(&path).unwrap();
            archive.save_room(&ticket("AAAAAA", 1)).unwrap();
        }
        let reopened = Archive::open(&path).unwrap();
        assert_eq!(reopened.open_rooms().unwrap().len(), 1);
    }
}
