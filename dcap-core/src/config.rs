//! Load client config from file and environment.

use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// What the door should do when the pool hits an error mid-transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OnError {
    #[default]
    Default,
    Retry,
    Fail,
}

impl OnError {
    pub fn as_str(self) -> &'static str {
        match self {
            OnError::Default => "default",
            OnError::Retry => "retry",
            OnError::Fail => "fail",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "default" => Some(OnError::Default),
            "retry" => Some(OnError::Retry),
            "fail" => Some(OnError::Fail),
            _ => None,
        }
    }
}

/// Client configuration. File: ~/.config/dcap/config.toml or /etc/dcap/config.toml.
/// Env overrides: DCACHE_DOOR (or DCACHE_HOST), DCACHE_REPLY, DCACHE_CBPORT,
/// DCACHE_CLIENT_ACTIVE, DCACHE_IO_TUNNEL, DCACHE_IO_TUNNEL_TYPE,
/// DCACHE_DOOR_CONFIG, DCACHE_OPEN_TIMEOUT, DCACHE_ONERROR.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Door used when a path carries no URL host: `[type@]host[:port[:provider[:type]]]`.
    #[serde(default)]
    pub door: Option<String>,
    /// File listing candidate doors, one per line.
    #[serde(default)]
    pub door_config: Option<PathBuf>,
    /// Host name the mover should call back (default: this host's name).
    #[serde(default)]
    pub reply_host: Option<String>,
    /// First callback port to try; 0 lets the OS pick.
    #[serde(default)]
    pub callback_port: u16,
    /// Number of consecutive ports tried starting at `callback_port`.
    #[serde(default = "default_callback_port_range")]
    pub callback_port_range: u16,
    /// Client dials the mover instead of waiting for it.
    #[serde(default)]
    pub client_active: bool,
    /// Tunnel provider for control lines.
    #[serde(default)]
    pub tunnel: Option<String>,
    /// Required tunnel type; doors announcing another type are skipped.
    #[serde(default)]
    pub tunnel_type: Option<String>,
    /// Seconds the door may spend preparing a transfer (`-timeout=`); -1 is the door default.
    #[serde(default = "default_open_timeout")]
    pub open_timeout: i64,
    #[serde(default)]
    pub on_error: OnError,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    /// Deadline for each data-channel step; expiry starts recovery.
    #[serde(default = "default_io_timeout_ms")]
    pub io_timeout_ms: u64,
    #[serde(default = "default_ping_timeout_ms")]
    pub ping_timeout_ms: u64,
    /// Deadline for door replies (open, stat, close confirmation).
    #[serde(default = "default_reply_timeout_ms")]
    pub reply_timeout_ms: u64,
    /// Wait per round while the door list is locked for maintenance.
    #[serde(default = "default_lock_wait_ms")]
    pub lock_wait_ms: u64,
    /// Kernel buffer sizes for data sockets, also announced to the door
    /// as `-send=`/`-receive=` (0: leave to the OS / door).
    #[serde(default)]
    pub tcp_send_buffer: u32,
    #[serde(default)]
    pub tcp_receive_buffer: u32,
    /// Appended verbatim to every open command.
    #[serde(default)]
    pub extra_options: Vec<String>,
    /// Failed data-channel attempts tolerated within one call.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

fn default_callback_port_range() -> u16 {
    1
}
fn default_open_timeout() -> i64 {
    -1
}
fn default_connect_timeout_ms() -> u64 {
    20_000
}
fn default_io_timeout_ms() -> u64 {
    60_000
}
fn default_ping_timeout_ms() -> u64 {
    10_000
}
fn default_reply_timeout_ms() -> u64 {
    3_600_000
}
fn default_lock_wait_ms() -> u64 {
    60_000
}
fn default_max_retries() -> u32 {
    3
}

impl Default for Config {
    fn default() -> Self {
        Self {
            door: None,
            door_config: None,
            reply_host: None,
            callback_port: 0,
            callback_port_range: default_callback_port_range(),
            client_active: false,
            tunnel: None,
            tunnel_type: None,
            open_timeout: default_open_timeout(),
            on_error: OnError::default(),
            connect_timeout_ms: default_connect_timeout_ms(),
            io_timeout_ms: default_io_timeout_ms(),
            ping_timeout_ms: default_ping_timeout_ms(),
            reply_timeout_ms: default_reply_timeout_ms(),
            lock_wait_ms: default_lock_wait_ms(),
            tcp_send_buffer: 0,
            tcp_receive_buffer: 0,
            extra_options: Vec::new(),
            max_retries: default_max_retries(),
        }
    }
}

impl Config {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
    pub fn io_timeout(&self) -> Duration {
        Duration::from_millis(self.io_timeout_ms)
    }
    pub fn ping_timeout(&self) -> Duration {
        Duration::from_millis(self.ping_timeout_ms)
    }
    pub fn reply_timeout(&self) -> Duration {
        Duration::from_millis(self.reply_timeout_ms)
    }
    pub fn lock_wait(&self) -> Duration {
        Duration::from_millis(self.lock_wait_ms)
    }

    /// Apply environment overrides from `lookup` (normally `std::env::var`).
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(door) = lookup("DCACHE_DOOR").or_else(|| lookup("DCACHE_HOST")) {
            self.door = Some(door);
        }
        if let Some(s) = lookup("DCACHE_REPLY") {
            self.reply_host = Some(s);
        }
        if let Some(s) = lookup("DCACHE_CBPORT") {
            if let Some((first, range)) = parse_port_range(&s) {
                self.callback_port = first;
                self.callback_port_range = range;
            }
        }
        if let Some(s) = lookup("DCACHE_CLIENT_ACTIVE") {
            self.client_active = s != "false";
        }
        if let Some(s) = lookup("DCACHE_IO_TUNNEL") {
            self.tunnel = Some(s);
        }
        if let Some(s) = lookup("DCACHE_IO_TUNNEL_TYPE") {
            self.tunnel_type = Some(s);
        }
        if let Some(s) = lookup("DCACHE_DOOR_CONFIG") {
            self.door_config = Some(PathBuf::from(s));
        }
        if let Some(s) = lookup("DCACHE_OPEN_TIMEOUT") {
            if let Ok(t) = s.parse() {
                self.open_timeout = t;
            }
        }
        if let Some(s) = lookup("DCACHE_ONERROR") {
            if let Some(mode) = OnError::parse(&s) {
                self.on_error = mode;
            }
        }
    }
}

/// `first[:last]` -> (first, count).
fn parse_port_range(s: &str) -> Option<(u16, u16)> {
    let (first, last) = match s.split_once(':') {
        Some((a, b)) => (a.parse::<u16>().ok()?, b.parse::<u16>().ok()?),
        None => {
            let p = s.parse::<u16>().ok()?;
            (p, p)
        }
    };
    if last < first {
        return None;
    }
    let count = u32::from(last) - u32::from(first) + 1;
    Some((first, u16::try_from(count).unwrap_or(u16::MAX)))
}

/// Load config: merge default, then config file (if present), then env vars.
pub fn load() -> Config {
    let mut c = load_file().unwrap_or_default();
    c.apply_env(|k| std::env::var(k).ok());
    c
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/dcap/config.toml"));
    }
    out.push(PathBuf::from("/etc/dcap/config.toml"));
    out
}

fn load_file() -> Option<Config> {
    for p in config_paths() {
        if p.exists() {
            if let Ok(s) = std::fs::read_to_string(&p) {
                match toml::from_str::<Config>(&s) {
                    Ok(c) => return Some(c),
                    Err(e) => tracing::warn!(path = %p.display(), error = %e, "ignoring config file"),
                }
            }
            break;
        }
    }
    None
}
