use std::path::PathBuf;

use clap::{Parser, Subcommand};
use clap_complete::Shell;

use crate::config::{ServerConfig, SyncSection};

#[derive(Parser, Debug)]
#[command(name = "study-room")]
#[command(version)]
#[command(about = "Shared study timers and synchronized video playback for small rooms")]
pub struct Args {
    /// Verbose logging (debug level unless STUDYROOM_LOG / RUST_LOG is set)
    #[arg(long, short, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the room hub (HTTP + WebSocket)
    Serve(ServeArgs),
    /// Join a room from the terminal and follow its timers and playback
    Watch(WatchArgs),
    /// Print shell completions to stdout
    Completions {
        #[arg(value_enum)]
        shell: Shell,
    },
}

#[derive(clap::Args, Debug, Clone)]
pub struct ServeArgs {
    /// TOML config file; missing file means defaults
    #[arg(long, short, default_value = "studyroom.toml")]
    pub config: PathBuf,

    /// Address to bind (overrides [server].bind)
    #[arg(long)]
    pub bind: Option<String>,

    /// Port to listen on (overrides [server].port)
    #[arg(long)]
    pub port: Option<u16>,

    /// Directory for the archive and media (overrides [server].data_dir)
    #[arg(long)]
    pub data_dir: Option<PathBuf>,

    /// Keep everything in memory; no archive is written
    #[arg(long)]
    pub memory: bool,
}

impl ServeArgs {
    /// Layer command-line overrides on top of the file configuration.
    pub fn apply_to(&self, config: &mut ServerConfig) {
        if let Some(bind) = &self.bind {
            config.server.bind = bind.clone();
        }
        if let Some(port) = self.port {
            config.server.port = port;
        }
        if let Some(dir) = &self.data_dir {
            config.server.data_dir = dir.clone();
        }
        if self.memory {
            config.server.persist = false;
        }
    }
}

#[derive(clap::Args, Debug, Clone)]
pub struct WatchArgs {
    /// Room code to join
    pub code: String,

    /// Hub base URL
    #[arg(long, default_value = "ws://127.0.0.1:8888")]
    pub url: String,

    /// Display name in the room
    #[arg(long, default_value = "Terminal")]
    pub name: String,

    /// Host token, if you created the room
    #[arg(long)]
    pub token: Option<String>,

    /// Start your own study timer with this subject and keep it pushed
    #[arg(long)]
    pub study: Option<String>,

    /// TOML config whose [sync] section supplies the defaults below
    #[arg(long, short, default_value = "studyroom.toml")]
    pub config: PathBuf,

    /// Local tick interval in milliseconds (overrides [sync].tick_ms)
    #[arg(long)]
    pub tick_ms: Option<u64>,

    /// How often to push your own timer back to the hub, in milliseconds
    /// (overrides [sync].push_interval_ms)
    #[arg(long)]
    pub push_ms: Option<u64>,

    /// Drift allowed on study timers before snapping (overrides [sync].timer_tolerance_ms)
    #[arg(long)]
    pub timer_tolerance_ms: Option<u64>,

    /// Drift allowed on playback before seeking (overrides [sync].playback_tolerance_ms)
    #[arg(long)]
    pub playback_tolerance_ms: Option<u64>,
}

impl WatchArgs {
    /// WebSocket URL for this room, with query parameters encoded.
    pub fn ws_url(&self) -> String {
        let base = self.url.trim_end_matches('/');
        let mut url = format!(
            "{base}/ws/{}?name={}",
            self.code.trim().to_uppercase(),
            url_encode(&self.name)
        );
        if let Some(token) = &self.token {
            url.push_str("&token=");
            url.push_str(&url_encode(token));
        }
        url
    }

    /// Layer command-line overrides on top of the file's `[sync]` section.
    pub fn apply_to(&self, sync: &mut SyncSection) {
        if let Some(tick_ms) = self.tick_ms {
            sync.tick_ms = tick_ms;
        }
        if let Some(push_ms) = self.push_ms {
            sync.push_interval_ms = push_ms;
        }
        if let Some(tol) = self.timer_tolerance_ms {
            sync.timer_tolerance_ms = tol;
        }
        if let Some(tol) = self.playback_tolerance_ms {
            sync.playback_tolerance_ms = tol;
        }
    }
}

/// Percent-encode everything outside the unreserved set.
pub fn url_encode(s: &str) -> String {
    s.bytes()
        .map(|b| match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                (b as char).to_string()
            }
            _ => format!("%{b:02X}"),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_args_parse_serve_defaults() {
        let args = Args::parse_from(["study-room", "serve"]);
        let Command::Serve(serve) = args.command else {
            panic!("expected serve");
        };
        assert_eq!(serve.config, PathBuf::from("studyroom.toml"));
        assert!(serve.port.is_none());
        assert!(!serve.memory);
        assert!(!args.verbose);
    }

    #[test]
    fn test_serve_overrides_layer_on_config() {
        let args = Args::parse_from([
            "study-room",
            "serve",
            "--port",
            "9100",
            "--bind",
            "0.0.0.0",
            "--memory",
        ]);
        let Command::Serve(serve) = args.command else {
            panic!("expected serve");
        };
        let mut cfg = ServerConfig::default();
        serve.apply_to(&mut cfg);
        assert_eq!(cfg.server.port, 9100);
        assert_eq!(cfg.server.bind, "0.0.0.0");
        assert!(!cfg.server.persist);
    }

    #[test]
    fn test_serve_without_flags_keeps_file_values() {
        let args = Args::parse_from(["study-room", "serve"]);
        let Command::Serve(serve) = args.command else {
            panic!("expected serve");
        };
        let mut cfg = ServerConfig::default();
        cfg.server.port = 7000;
        serve.apply_to(&mut cfg);
        assert_eq!(cfg.server.port, 7000);
        assert!(cfg.server.persist);
    }

    #[test]
    fn test_args_parse_watch() {
        let args = Args::parse_from([
            "study-room",
            "watch",
            "abc123",
            "--name",
            "Ada Lovelace",
            "--study",
            "Calculus",
            "-v",
        ]);
        assert!(args.verbose);
        let Command::Watch(watch) = args.command else {
            panic!("expected watch");
        };
        assert_eq!(watch.study.as_deref(), Some("Calculus"));
        assert!(watch.tick_ms.is_none());
        assert!(watch.push_ms.is_none());
        assert_eq!(watch.config, PathBuf::from("studyroom.toml"));
        assert_eq!(
            watch.ws_url(),
            "ws://127.0.0.1:8888/ws/ABC123?name=Ada%20Lovelace"
        );
    }

    #[test]
    fn test_ws_url_includes_token() {
        let args = Args::parse_from([
            "study-room",
            "watch",
            "ROOM01",
            "--url",
            "ws://hub:9000/",
            "--token",
            "a+b",
        ]);
        let Command::Watch(watch) = args.command else {
            panic!("expected watch");
        };
        assert_eq!(
            watch.ws_url(),
            "ws://hub:9000/ws/ROOM01?name=Terminal&token=a%2Bb"
        );
    }

    #[test]
    fn test_watch_without_flags_keeps_sync_section() {
        let args = Args::parse_from(["study-room", "watch", "ROOM01"]);
        let Command::Watch(watch) = args.command else {
            panic!("expected watch");
        };
        let mut sync = SyncSection {
            tick_ms: 250,
            push_interval_ms: 2_000,
            playback_tolerance_ms: 1_500,
            timer_tolerance_ms: 400,
        };
        let before = sync.clone();
        watch.apply_to(&mut sync);
        assert_eq!(sync, before);
    }

    #[test]
    fn test_watch_overrides_layer_on_sync_section() {
        let args = Args::parse_from([
            "study-room",
            "watch",
            "ROOM01",
            "--tick-ms",
            "200",
            "--push-ms",
            "1000",
            "--timer-tolerance-ms",
            "750",
            "--playback-tolerance-ms",
            "5000",
        ]);
        let Command::Watch(watch) = args.command else {
            panic!("expected watch");
        };
        let mut sync = SyncSection::default();
        watch.apply_to(&mut sync);
        assert_eq!(sync.tick_ms, 200);
        assert_eq!(sync.push_interval_ms, 1_000);
        assert_eq!(sync.timer_tolerance_ms, 750);
        assert_eq!(sync.playback_tolerance_ms, 5_000);
    }

    #[test]
    fn test_args_parse_completions() {
        let args = Args::parse_from(["study-room", "completions", "bash"]);
        assert!(matches!(args.command, Command::Completions { shell: Shell::Bash }));
    }

    #[test]
    fn test_url_encode_unreserved_passthrough() {
        assert_eq!(url_encode("abc-_.~XYZ09"), "abc-_.~XYZ09");
        assert_eq!(url_encode("a b&c"), "a%20b%26c");
    }
}
