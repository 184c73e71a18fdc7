//! `study-room watch`: follow a room from the terminal.

use std::io::Write;
use std::time::Duration;

use colored::*;
use futures_util::{Sink, SinkExt, StreamExt};
use tokio::time::{interval, MissedTickBehavior};
use tokio_tungstenite::tungstenite::{self, Message as WsMessage};

use crate::cli::WatchArgs;
use crate::clock::Reconciliation;
use crate::collab::now_ms;
use crate::config::{ServerConfig, SyncSection};
use crate::error::Result;
use crate::follower::{format_clock, FollowerEvent, FollowerView, RoomFollower};
use crate::protocol::{ClientMessage, ServerMessage};

const MIN_TICK_MS: u64 = 50;

async fn send<S>(sink: &mut S, msg: &ClientMessage) -> Result<()>
where
    S: Sink<WsMessage, Error = tungstenite::Error> + Unpin,
{
    let text = serde_json::to_string(msg)?;
    sink.send(WsMessage::Text(text)).await?;
    Ok(())
}

/// A follower using the configured drift tolerances.
pub fn follower_for(sync: &SyncSection) -> RoomFollower {
    RoomFollower::new(sync.timer_tolerance_ms, sync.playback_tolerance_ms)
}

/// Connect to the hub and render the room until it closes or Ctrl+C.
pub async fn run_watch(args: &WatchArgs) -> Result<()> {
    let mut sync = ServerConfig::load(&args.config)?.sync;
    args.apply_to(&mut sync);

    let url = args.ws_url();
    tracing::info!(%url, ?sync, "connecting");
    let (ws, _response) = tokio_tungstenite::connect_async(url.as_str()).await?;
    let (mut sink, mut stream) = ws.split();

    let mut follower = follower_for(&sync);
    let mut tick = interval(Duration::from_millis(sync.tick_ms.max(MIN_TICK_MS)));
    tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut push = interval(Duration::from_millis(sync.push_interval_ms.max(MIN_TICK_MS)));
    push.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            frame = stream.next() => {
                match frame {
                    Some(Ok(WsMessage::Text(text))) => {
                        let msg: ServerMessage = match serde_json::from_str(&text) {
                            Ok(msg) => msg,
                            Err(e) => {
                                tracing::warn!(error = %e, "unrecognised frame from hub");
                                continue;
                            }
                        };
                        let event = follower.observe(msg, now_ms());
                        print_event(&event);
                        if matches!(event, FollowerEvent::Welcomed { .. }) {
                            if let Some(subject) = &args.study {
                                send(&mut sink, &ClientMessage::TimerStart {
                                    subject: Some(subject.clone()),
                                }).await?;
                            }
                        }
                        if follower.is_closed() {
                            break;
                        }
                    }
                    Some(Ok(WsMessage::Close(_))) | None => {
                        println!();
                        println!("{}", "  connection closed by hub".bright_yellow());
                        break;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => return Err(e.into()),
                }
            }

            _ = tick.tick() => {
                render(&follower.tick(now_ms()));
            }

            _ = push.tick() => {
                if let Some(elapsed_ms) = follower.own_elapsed(now_ms()) {
                    send(&mut sink, &ClientMessage::TimerSync { elapsed_ms }).await?;
                }
                follower.note_ping_sent(now_ms());
                send(&mut sink, &ClientMessage::Ping).await?;
            }

            _ = tokio::signal::ctrl_c() => {
                if args.study.is_some() {
                    send(&mut sink, &ClientMessage::TimerPause).await?;
                }
                let _ = sink.send(WsMessage::Close(None)).await;
                println!();
                break;
            }
        }
    }
    Ok(())
}

fn print_event(event: &FollowerEvent) {
    let line = match event {
        FollowerEvent::Welcomed { room, participant } => format!(
            "  joined {} as {}",
            room.bright_cyan(),
            participant.bright_green()
        ),
        FollowerEvent::Member { name, joined: true } => format!("  + {name} joined").dimmed().to_string(),
        FollowerEvent::Member { name, joined: false } => format!("  - {name} left").dimmed().to_string(),
        FollowerEvent::Chat { author, text } => format!("  {}: {}", author.bright_blue(), text),
        FollowerEvent::Timer {
            owner,
            outcome: Reconciliation::Corrected { from_ms, to_ms },
        } if from_ms != to_ms => format!(
            "  {owner}'s timer resynced {} → {}",
            format_clock(*from_ms),
            format_clock(*to_ms)
        )
        .yellow()
        .to_string(),
        FollowerEvent::Playback {
            outcome: Reconciliation::Corrected { to_ms, .. },
        } => format!("  playback seek to {}", format_clock(*to_ms))
            .yellow()
            .to_string(),
        FollowerEvent::TimerRemoved { owner } => format!("  {owner}'s timer stopped").dimmed().to_string(),
        FollowerEvent::Closed => "  room closed by host".bright_red().to_string(),
        FollowerEvent::Error(message) => format!("  hub error: {message}").red().to_string(),
        _ => return,
    };
    println!("\r\x1b[2K{line}");
}

/// One status line, redrawn in place.
pub fn status_line(view: &FollowerView) -> String {
    let mut parts = vec![format!("[{}] {} here", view.room, view.participants)];
    if let Some(pb) = &view.playback {
        if pb.video_url.is_some() {
            let icon = if pb.playing { "▶" } else { "⏸" };
            parts.push(format!("{icon} {}", format_clock(pb.position_ms)));
        }
    }
    for t in &view.timers {
        let marker = if t.running { "●" } else { "○" };
        let who = if t.mine { "you" } else { t.owner_name.as_str() };
        if t.subject.is_empty() {
            parts.push(format!("{marker} {who} {}", format_clock(t.elapsed_ms)));
        } else {
            parts.push(format!(
                "{marker} {who} ({}) {}",
                t.subject,
                format_clock(t.elapsed_ms)
            ));
        }
    }
    parts.join("  │  ")
}

fn render(view: &FollowerView) {
    print!("\r\x1b[2K{}", status_line(view).bright_white());
    let _ = std::io::stdout().flush();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::follower::{PlaybackLine, TimerLine};
    use crate::playback::PlaybackSnapshot;
    use crate::protocol::RoomState;

    #[test]
    fn test_status_line_lists_timers_and_playback() {
        let view = FollowerView {
            room: "ROOM01".into(),
            participants: 3,
            timers: vec![
                TimerLine {
                    owner_id: "a".into(),
                    owner_name: "Ada".into(),
                    subject: "Calculus".into(),
                    elapsed_ms: 125_000,
                    running: true,
                    mine: false,
                },
                TimerLine {
                    owner_id: "b".into(),
                    owner_name: "Bob".into(),
                    subject: String::new(),
                    elapsed_ms: 0,
                    running: false,
                    mine: true,
                },
            ],
            playback: Some(PlaybackLine {
                video_url: Some("https://v.example.com/x.mp4".into()),
                position_ms: 61_000,
                playing: true,
            }),
            closed: false,
        };
        let line = status_line(&view);
        assert!(line.starts_with("[ROOM01] 3 here"));
        assert!(line.contains("▶ 1:01"));
        assert!(line.contains("● Ada (Calculus) 2:05"));
        assert!(line.contains("○ you 0:00"));
    }

    #[test]
    fn test_status_line_hides_unloaded_playback() {
        let view = FollowerView {
            room: "R".into(),
            participants: 1,
            timers: vec![],
            playback: Some(PlaybackLine {
                video_url: None,
                position_ms: 0,
                playing: false,
            }),
            closed: false,
        };
        assert_eq!(status_line(&view), "[R] 1 here");
    }

    #[test]
    fn test_follower_for_uses_configured_playback_tolerance() {
        const T0: u64 = 1_700_000_000_000;
        let cfg = ServerConfig::from_toml_str("[sync]\nplayback_tolerance_ms = 500\n").unwrap();
        let mut follower = follower_for(&cfg.sync);

        let mut playback = PlaybackSnapshot::new("R", T0);
        playback.video_url = Some("https://v.example.com/x.mp4".into());
        playback.is_playing = true;
        playback.seq = 1;
        let me = crate::collab::Participant {
            id: "me".into(),
            name: "Me".into(),
            color: "#58a6ff".into(),
            joined_at_ms: T0,
            is_host: false,
        };
        follower.observe(
            ServerMessage::Welcome {
                participant: me.clone(),
                room: RoomState {
                    code: "R".into(),
                    name: "R".into(),
                    host_id: String::new(),
                    participants: vec![me],
                    chat_log: vec![],
                    timers: vec![],
                    playback: playback.clone(),
                    seq: 1,
                    created_at_ms: T0,
                },
                server_time_ms: T0,
            },
            T0,
        );

        // 1 s of drift: inside the 3 s default, outside the configured 500 ms.
        playback.position_ms = 2_000;
        playback.broadcast_at_ms = T0 + 1_000;
        playback.seq = 2;
        let event = follower.observe(ServerMessage::Playback { playback }, T0 + 1_000);
        assert!(matches!(
            event,
            FollowerEvent::Playback {
                outcome: Reconciliation::Corrected { to_ms: 2_000, .. }
            }
        ));
    }
}
