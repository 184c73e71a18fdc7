//! Hand-rolled HTTP front door of the hub.
//!
//! Every connection is peeked first: WebSocket upgrades to `/ws/{code}` are
//! handed to [`crate::collab::handle_ws`]; everything else is parsed with
//! `httparse`, routed, answered and closed.

use std::collections::HashMap;
use std::sync::Arc;

use colored::*;
use serde::Serialize;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use crate::archive::{Archive, DEFAULT_PAGE, MAX_PAGE};
use crate::coach::{Coach, CoachRequest};
use crate::collab::{self, RoomStore, MAX_CHAT_HISTORY};
use crate::config::ServerConfig;
use crate::error::{Result, RoomError};
use crate::media::{MediaKind, MediaStore};

const MAX_HEADER_BYTES: usize = 16 * 1024;
const MAX_HEADERS: usize = 32;
const MIN_BODY_LIMIT: usize = 64 * 1024;

// ---------------------------------------------------------------------------
// Shared hub state
// ---------------------------------------------------------------------------

/// Everything a connection handler needs. Cheap to clone.
#[derive(Clone)]
pub struct HubState {
    pub rooms: RoomStore,
    pub archive: Option<Arc<Archive>>,
    pub config: Arc<ServerConfig>,
    pub media: Arc<MediaStore>,
    pub coach: Option<Arc<Coach>>,
}

impl HubState {
    /// Build the hub from configuration: opens the archive when persistence
    /// is on and enables the coach when its API key is present.
    pub fn new(config: ServerConfig) -> Result<Self> {
        let archive = if config.server.persist {
            std::fs::create_dir_all(&config.server.data_dir)?;
            Some(Arc::new(Archive::open(&config.archive_path())?))
        } else {
            None
        };
        let coach = match Coach::from_env(config.coach.clone()) {
            Ok(coach) => Some(Arc::new(coach)),
            Err(e) => {
                tracing::warn!(error = %e, "coach disabled");
                None
            }
        };
        let mut hub = Self::in_memory(config);
        hub.archive = archive;
        hub.coach = coach;
        Ok(hub)
    }

    /// A hub with no archive and no coach.
    pub fn in_memory(config: ServerConfig) -> Self {
        let media = MediaStore::new(config.media_root(), config.media.max_bytes);
        Self {
            rooms: collab::new_room_store(),
            archive: None,
            config: Arc::new(config),
            media: Arc::new(media),
            coach: None,
        }
    }

    pub fn with_archive_store(mut self, archive: Archive) -> Self {
        self.archive = Some(Arc::new(archive));
        self
    }

    pub fn with_coach(mut self, coach: Coach) -> Self {
        self.coach = Some(Arc::new(coach));
        self
    }

    /// Run a write against the archive, if any. Failures are logged only.
    pub fn with_archive<F>(&self, write: F)
    where
        F: FnOnce(&Archive) -> Result<()>,
    {
        if let Some(archive) = &self.archive {
            if let Err(e) = write(archive) {
                tracing::warn!(error = %e, "archive write failed");
            }
        }
    }

    /// Re-open rooms the archive still lists as open. Returns how many.
    pub fn restore(&self) -> Result<usize> {
        let Some(archive) = &self.archive else {
            return Ok(0);
        };
        let tickets = archive.open_rooms()?;
        let count = tickets.len();
        for ticket in tickets {
            let chat = archive.load_messages(&ticket.code, None, MAX_CHAT_HISTORY)?;
            collab::restore_room(&self.rooms, ticket, chat);
        }
        Ok(count)
    }
}

// ---------------------------------------------------------------------------
// Request / response
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub method: String,
    pub path: String,
    pub query: HashMap<String, String>,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl Request {
    pub fn new(method: &str, target: &str) -> Self {
        let (path, query) = split_target(target);
        Self {
            method: method.to_ascii_uppercase(),
            path: path.to_string(),
            query: parse_query(query),
            headers: Vec::new(),
            body: Vec::new(),
        }
    }

    pub fn with_body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = body.into();
        self
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub status: u16,
    pub content_type: &'static str,
    pub body: Vec<u8>,
}

impl Response {
    pub fn text(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            content_type: "text/plain; charset=utf-8",
            body: body.into().into_bytes(),
        }
    }

    pub fn json<T: Serialize>(status: u16, value: &T) -> Self {
        match serde_json::to_vec(value) {
            Ok(body) => Self {
                status,
                content_type: "application/json",
                body,
            },
            Err(e) => Self::error(&e.into()),
        }
    }

    pub fn error(err: &RoomError) -> Self {
        let status = err.status_code();
        if status >= 500 {
            tracing::warn!(status, error = %err, "request failed");
        }
        Self::json(status, &serde_json::json!({ "error": err.to_string() }))
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let head = format!(
            "HTTP/1.1 {} {}\r\nContent-Type: {}\r\nContent-Length: {}\r\nAccess-Control-Allow-Origin: *\r\nAccess-Control-Allow-Headers: Content-Type\r\nConnection: close\r\n\r\n",
            self.status,
            reason(self.status),
            self.content_type,
            self.body.len()
        );
        let mut out = head.into_bytes();
        out.extend_from_slice(&self.body);
        out
    }
}

fn reason(status: u16) -> &'static str {
    match status {
        200 => "OK",
        201 => "Created",
        204 => "No Content",
        400 => "Bad Request",
        403 => "Forbidden",
        404 => "Not Found",
        405 => "Method Not Allowed",
        413 => "Payload Too Large",
        500 => "Internal Server Error",
        502 => "Bad Gateway",
        503 => "Service Unavailable",
        _ => "Unknown",
    }
}

/// Simple percent-decoding for URL query parameters.
pub fn url_decode(s: &str) -> String {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'+' => out.push(b' '),
            b'%' => {
                let hex = s.get(i + 1..i + 3).unwrap_or("");
                match u8::from_str_radix(hex, 16) {
                    Ok(byte) => {
                        out.push(byte);
                        i += 2;
                    }
                    Err(_) => out.push(b'%'),
                }
            }
            b => out.push(b),
        }
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// Parse query string into key-value pairs.
pub fn parse_query(query: &str) -> HashMap<String, String> {
    query
        .split('&')
        .filter(|pair| !pair.is_empty())
        .filter_map(|pair| {
            let mut parts = pair.splitn(2, '=');
            let key = parts.next()?;
            let val = parts.next().unwrap_or("");
            Some((url_decode(key), url_decode(val)))
        })
        .collect()
}

fn split_target(target: &str) -> (&str, &str) {
    match target.find('?') {
        Some(idx) => (&target[..idx], &target[idx + 1..]),
        None => (target, ""),
    }
}

/// Read one HTTP request. `Ok(None)` means the peer closed before sending one.
pub async fn read_request<S>(stream: &mut S, max_body: usize) -> Result<Option<Request>>
where
    S: tokio::io::AsyncRead + Unpin,
{
    let mut buf = Vec::with_capacity(4096);
    let mut chunk = [0u8; 4096];

    let (mut request, header_len, content_length) = loop {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            if buf.is_empty() {
                return Ok(None);
            }
            return Err(RoomError::invalid("connection closed mid-request"));
        }
        buf.extend_from_slice(&chunk[..n]);

        let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut parsed = httparse::Request::new(&mut headers);
        match parsed.parse(&buf) {
            Ok(httparse::Status::Complete(header_len)) => {
                let mut request = Request::new(
                    parsed.method.unwrap_or("GET"),
                    parsed.path.unwrap_or("/"),
                );
                request.headers = parsed
                    .headers
                    .iter()
                    .map(|h| {
                        (
                            h.name.to_string(),
                            String::from_utf8_lossy(h.value).into_owned(),
                        )
                    })
                    .collect();
                let content_length = request
                    .header("content-length")
                    .map(|v| {
                        v.trim()
                            .parse::<usize>()
                            .map_err(|_| RoomError::invalid("bad Content-Length"))
                    })
                    .transpose()?
                    .unwrap_or(0);
                break (request, header_len, content_length);
            }
            Ok(httparse::Status::Partial) => {
                if buf.len() > MAX_HEADER_BYTES {
                    return Err(RoomError::invalid("request headers too large"));
                }
            }
            Err(e) => return Err(RoomError::invalid(format!("malformed request: {e}"))),
        }
    };

    if content_length > max_body {
        return Err(RoomError::PayloadTooLarge {
            size: content_length,
            limit: max_body,
        });
    }

    let mut body = buf.split_off(header_len);
    body.truncate(content_length);
    while body.len() < content_length {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Err(RoomError::invalid("body shorter than Content-Length"));
        }
        let take = n.min(content_length - body.len());
        body.extend_from_slice(&chunk[..take]);
    }
    request.body = body;
    Ok(Some(request))
}

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

/// Answer one plain HTTP request.
pub async fn route(hub: &HubState, req: &Request) -> Response {
    match dispatch(hub, req).await {
        Ok(response) => response,
        Err(err) => Response::error(&err),
    }
}

async fn dispatch(hub: &HubState, req: &Request) -> Result<Response> {
    if req.method == "OPTIONS" {
        return Ok(Response::text(204, ""));
    }
    let segments: Vec<&str> = req
        .path
        .trim_matches('/')
        .split('/')
        .filter(|s| !s.is_empty())
        .collect();

    match (req.method.as_str(), segments.as_slice()) {
        ("GET", ["health"]) => Ok(Response::text(200, "ok")),
        ("GET", ["rooms"]) => Ok(Response::json(200, &collab::list_rooms(&hub.rooms))),
        ("POST", ["room", "create"]) => {
            let name = req.query.get("name").map(String::as_str).unwrap_or("");
            let ticket = collab::create_room(&hub.rooms, name);
            hub.with_archive(|a| a.save_room(&ticket));
            tracing::info!(room = %ticket.code, name = %ticket.name, "room created");
            Ok(Response::json(
                200,
                &serde_json::json!({
                    "code": ticket.code,
                    "name": ticket.name,
                    "ws_url": format!("/ws/{}", ticket.code),
                    "host_token": ticket.host_token,
                }),
            ))
        }
        ("GET", ["room", code]) => {
            let code = collab::normalize_code(code);
            collab::room_state(&hub.rooms, &code)
                .map(|state| Response::json(200, &state))
                .ok_or_else(|| RoomError::room_not_found(code))
        }
        ("GET", ["room", code, "messages"]) => {
            let code = collab::normalize_code(code);
            let code = code.as_str();
            let before = query_u64(req, "before")?;
            let limit = query_u64(req, "limit")?
                .map_or(DEFAULT_PAGE, |l| (l as usize).clamp(1, MAX_PAGE));
            let messages = match &hub.archive {
                Some(archive) => {
                    require_known_room(hub, code)?;
                    archive.load_messages(code, before, limit)?
                }
                None => {
                    let state = collab::room_state(&hub.rooms, code)
                        .ok_or_else(|| RoomError::room_not_found(code))?;
                    let older: Vec<_> = state
                        .chat_log
                        .into_iter()
                        .filter(|m| before.map_or(true, |b| m.timestamp_ms < b))
                        .collect();
                    older[older.len().saturating_sub(limit)..].to_vec()
                }
            };
            Ok(Response::json(200, &messages))
        }
        ("GET", ["room", code, "sessions"]) => {
            let code = collab::normalize_code(code);
            let code = code.as_str();
            require_known_room(hub, code)?;
            let sessions = match &hub.archive {
                Some(archive) => archive.load_sessions(code, MAX_PAGE)?,
                None => Vec::new(),
            };
            Ok(Response::json(200, &sessions))
        }
        ("POST", ["coach"]) => {
            let coach = hub.coach.as_ref().ok_or_else(|| {
                RoomError::MissingApiKey(hub.config.coach.provider.key_env())
            })?;
            let request: CoachRequest = serde_json::from_slice(&req.body)?;
            let reply = coach.ask(&request).await?;
            Ok(Response::json(200, &reply))
        }
        ("POST", ["media", kind, owner]) => {
            let kind = MediaKind::parse(kind)
                .ok_or_else(|| RoomError::invalid(format!("unknown media kind '{kind}'")))?;
            let stored = hub.media.store(kind, owner, &req.body).await?;
            hub.with_archive(|a| a.record_media(&stored, collab::now_ms()));
            Ok(Response::json(201, &stored))
        }
        ("GET", ["media", rest @ ..]) if !rest.is_empty() => {
            let (bytes, content_type) = hub.media.load(&rest.join("/")).await?;
            Ok(Response {
                status: 200,
                content_type,
                body: bytes,
            })
        }
        (_, ["health"] | ["rooms"] | ["coach"] | ["room", ..] | ["media", ..]) => {
            Ok(Response::text(405, "Method Not Allowed"))
        }
        _ => Err(RoomError::NotFound(req.path.clone())),
    }
}

fn query_u64(req: &Request, key: &str) -> Result<Option<u64>> {
    req.query
        .get(key)
        .filter(|v| !v.is_empty())
        .map(|v| {
            v.parse::<u64>()
                .map_err(|_| RoomError::invalid(format!("'{key}' must be a number")))
        })
        .transpose()
}

fn require_known_room(hub: &HubState, code: &str) -> Result<()> {
    if collab::room_exists(&hub.rooms, code) {
        return Ok(());
    }
    match &hub.archive {
        Some(archive) if archive.knows_room(code)? => Ok(()),
        _ => Err(RoomError::room_not_found(code)),
    }
}

// ---------------------------------------------------------------------------
// Server loop
// ---------------------------------------------------------------------------

/// Bind the configured address and serve forever.
pub async fn serve(hub: HubState) -> Result<()> {
    let listener = TcpListener::bind(hub.config.listen_addr()).await?;
    let addr = listener.local_addr()?;

    eprintln!(
        "{}",
        format!("  Study room hub listening on http://{addr}").bright_green()
    );
    eprintln!("{}", "  Press Ctrl+C to stop.".bright_blue());
    tracing::info!(%addr, persist = hub.archive.is_some(), coach = hub.coach.is_some(), "hub started");

    serve_on(listener, hub).await
}

/// Serve on an already bound listener.
pub async fn serve_on(listener: TcpListener, hub: HubState) -> Result<()> {
    loop {
        let (stream, peer) = listener.accept().await?;
        let hub = hub.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_connection(stream, hub).await {
                tracing::debug!(%peer, error = %e, "connection error");
            }
        });
    }
}

async fn handle_connection(mut stream: TcpStream, hub: HubState) -> Result<()> {
    // Peek at the first bytes to detect WebSocket upgrade requests.
    let mut peek_buf = [0u8; 2048];
    let peek_n = stream.peek(&mut peek_buf).await.unwrap_or(0);
    let peek_str = String::from_utf8_lossy(&peek_buf[..peek_n]);
    let peek_first_line = peek_str.lines().next().unwrap_or("").to_string();

    if peek_str.to_ascii_lowercase().contains("upgrade: websocket") {
        let target = peek_first_line
            .split_whitespace()
            .nth(1)
            .unwrap_or("/")
            .to_string();
        let (path, query) = split_target(&target);
        if let Some(code) = path.strip_prefix("/ws/") {
            let params = parse_query(query);
            let code = collab::normalize_code(code.trim_matches('/'));
            let name = params.get("name").cloned().unwrap_or_default();
            let token = params.get("token").cloned().filter(|t| !t.is_empty());

            match tokio_tungstenite::accept_async(stream).await {
                Ok(ws_stream) => {
                    collab::handle_ws(ws_stream, hub, code, name, token).await;
                }
                Err(e) => {
                    tracing::debug!(error = %e, "websocket handshake failed");
                }
            }
            return Ok(());
        }
    }

    let max_body = hub.config.media.max_bytes.max(MIN_BODY_LIMIT);
    let response = match read_request(&mut stream, max_body).await {
        Ok(Some(request)) => {
            let response = route(&hub, &request).await;
            tracing::debug!(method = %request.method, path = %request.path, status = response.status, "http");
            response
        }
        Ok(None) => return Ok(()),
        Err(e) => Response::error(&e),
    };
    stream.write_all(&response.to_bytes()).await?;
    stream.shutdown().await?;
    Ok(())
}
