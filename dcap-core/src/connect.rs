//! Door selection, control-line dial and hello, the open conversation, and
//! data-channel establishment (passive callback or active connect to the mover).

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use rand::Rng;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::client::Context;
use crate::codec::{self, Command, Reply};
use crate::error::{DcapError, Result};
use crate::mqueue::Wait;
use crate::poll::{ControlLine, LineReader};
use crate::protocol::{DataChannel, PROTOCOL_VERSION};
use crate::reconnect::ping_pong;
use crate::session::{AsciiCommand, Node};
use crate::transport::{self, timed, Tunnel};
use crate::url::DcapUrl;

pub const DEFAULT_DOOR_PORT: u16 = 22125;
/// Maintenance flag placed next to the door list.
pub const LOCK_FILE: &str = "dcap.LOCK";

/// One door line: `[tunnelType@]host[:port[:tunnelProvider[:tunnelType]]]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DoorSpec {
    pub host: String,
    pub port: u16,
    pub tunnel: Option<String>,
    pub tunnel_type: Option<String>,
}

impl DoorSpec {
    pub fn parse(line: &str) -> Option<Self> {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            return None;
        }
        let mut fields = line.split(':');
        let first = fields.next()?;
        let (prefix_type, host) = match first.split_once('@') {
            Some((t, h)) => (Some(t), h),
            None => (None, first),
        };
        if host.is_empty() {
            return None;
        }
        let port = match fields.next() {
            Some(p) => p.trim().parse().ok()?,
            None => DEFAULT_DOOR_PORT,
        };
        let non_empty = |s: Option<&str>| s.filter(|v| !v.is_empty()).map(str::to_string);
        let tunnel = non_empty(fields.next());
        let tunnel_type = non_empty(prefix_type).or_else(|| non_empty(fields.next()));
        Some(Self {
            host: host.to_string(),
            port,
            tunnel,
            tunnel_type,
        })
    }

    pub fn from_url(url: &DcapUrl) -> Self {
        Self {
            host: url.host.clone(),
            port: url.port.unwrap_or(DEFAULT_DOOR_PORT),
            tunnel: None,
            tunnel_type: None,
        }
    }

    /// Control-line registry key.
    pub fn key(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

enum DoorSource {
    Single(DoorSpec),
    List(PathBuf),
}

fn door_source(ctx: &Context, url: Option<&DcapUrl>) -> Result<DoorSource> {
    if let Some(url) = url {
        return Ok(DoorSource::Single(DoorSpec::from_url(url)));
    }
    if let Some(door) = &ctx.config.door {
        return DoorSpec::parse(door)
            .map(DoorSource::Single)
            .ok_or_else(|| DcapError::Config(format!("bad door {door:?}")));
    }
    match &ctx.config.door_config {
        Some(path) => Ok(DoorSource::List(path.clone())),
        None => Err(DcapError::Config("no door configured".into())),
    }
}

/// Tunnel for `door`: the configured provider wins over the door line's.
/// `None` means the door announces a tunnel type other than the one required.
fn select_tunnel(ctx: &Context, door: &DoorSpec) -> Option<Option<Arc<dyn Tunnel>>> {
    let Some(provider) = ctx.config.tunnel.as_ref().or(door.tunnel.as_ref()) else {
        return Some(None);
    };
    if let Some(wanted) = &ctx.config.tunnel_type {
        if door.tunnel_type.as_ref() != Some(wanted) {
            info!(door = %door.key(), wanted = %wanted, offered = ?door.tunnel_type, "tunnel type mismatch, skipping door");
            return None;
        }
    }
    match ctx.tunnels.get(provider) {
        Some(t) => Some(Some(t)),
        None => {
            info!(provider = %provider, door = %door.key(), "tunnel unavailable, using plain");
            Some(None)
        }
    }
}

/// Wait while the maintenance lock exists. Returns whether it was ever seen.
async fn wait_for_unlock(ctx: &Context, list: &Path) -> bool {
    let lock = list.parent().unwrap_or(Path::new(".")).join(LOCK_FILE);
    let mut locked = false;
    while lock.exists() {
        if !locked {
            info!(lock = %lock.display(), "doors locked, waiting");
            locked = true;
        }
        tokio::time::sleep(ctx.config.lock_wait()).await;
    }
    if locked {
        info!("doors unlocked");
    }
    locked
}

pub fn read_door_list(path: &Path) -> Result<Vec<DoorSpec>> {
    let text = std::fs::read_to_string(path)
        .map_err(|e| DcapError::Config(format!("door list {}: {e}", path.display())))?;
    Ok(text.lines().filter_map(DoorSpec::parse).collect())
}

/// A live control line for the session's doors: reuse one when possible,
/// otherwise dial a randomly chosen candidate.
pub(crate) async fn control_line(ctx: &Context, url: Option<&DcapUrl>) -> Result<Arc<ControlLine>> {
    match door_source(ctx, url)? {
        DoorSource::Single(door) => {
            if let Some(line) = ctx.lines.get(&door.key()).filter(|l| l.is_alive()) {
                debug!(door = %door.key(), "reusing control line");
                return Ok(line);
            }
            let tunnel = select_tunnel(ctx, &door).ok_or(DcapError::NoDoors)?;
            dial(ctx, &door, tunnel).await
        }
        DoorSource::List(path) => {
            let locked = wait_for_unlock(ctx, &path).await;
            let mut candidates = Vec::new();
            for door in read_door_list(&path)? {
                let Some(tunnel) = select_tunnel(ctx, &door) else {
                    continue;
                };
                if let Some(line) = ctx.lines.get(&door.key()).filter(|l| l.is_alive()) {
                    if locked && !ping_pong(ctx, &line).await {
                        continue;
                    }
                    debug!(door = %door.key(), "reusing control line");
                    return Ok(line);
                }
                candidates.push((door, tunnel));
            }
            if candidates.is_empty() {
                warn!(list = %path.display(), "no doors available");
                return Err(DcapError::NoDoors);
            }
            let mut last = DcapError::NoDoors;
            while !candidates.is_empty() {
                let i = rand::thread_rng().gen_range(0..candidates.len());
                let (door, tunnel) = candidates.swap_remove(i);
                match dial(ctx, &door, tunnel).await {
                    Ok(line) => return Ok(line),
                    Err(e) => {
                        info!(door = %door.key(), error = %e, "door unreachable");
                        last = e;
                    }
                }
            }
            Err(last)
        }
    }
}

async fn resolve(door: &DoorSpec) -> Result<Vec<SocketAddr>> {
    let addrs: Vec<SocketAddr> = tokio::net::lookup_host((door.host.as_str(), door.port))
        .await
        .map_err(|_| DcapError::Resolve(door.host.clone()))?
        .collect();
    if addrs.is_empty() {
        return Err(DcapError::Resolve(door.host.clone()));
    }
    Ok(addrs)
}

async fn connect_any(addrs: &[SocketAddr], key: &str, ctx: &Context) -> Result<TcpStream> {
    let mut last = std::io::Error::from(std::io::ErrorKind::NotConnected);
    for addr in addrs {
        match tokio::time::timeout(ctx.config.connect_timeout(), TcpStream::connect(addr)).await {
            Ok(Ok(s)) => return Ok(s),
            Ok(Err(e)) => last = e,
            Err(_) => last = std::io::ErrorKind::TimedOut.into(),
        }
    }
    Err(DcapError::Connect {
        addr: key.to_string(),
        source: last,
    })
}

/// Dial `door`, say hello, and hand the line to the poller.
async fn dial(
    ctx: &Context,
    door: &DoorSpec,
    tunnel: Option<Arc<dyn Tunnel>>,
) -> Result<Arc<ControlLine>> {
    let key = door.key();
    info!(door = %key, tunnel = ?tunnel.as_ref().map(|t| t.name()), "creating control line");
    let stream = connect_any(&resolve(door).await?, &key, ctx).await?;
    let _ = stream.set_nodelay(true);
    let hello_failed = |reason: String| DcapError::Hello {
        door: key.clone(),
        reason,
    };
    let (reader, writer) = timed(ctx.config.connect_timeout(), "tunnel handshake", async {
        Ok(transport::open(stream, tunnel.as_ref()).await?)
    })
    .await
    .map_err(|e| hello_failed(e.to_string()))?;

    let mut reader = LineReader::new(reader);
    let line = Arc::new(ControlLine::new(ctx.lines.next_id(), key.clone(), writer));
    let (major, minor) = PROTOCOL_VERSION;
    let ids = &ctx.ids;
    line.send(
        &codec::hello(major, minor, ids.uid, ids.pid, ids.gid),
        ctx.config.connect_timeout(),
    )
    .await
    .map_err(|e| hello_failed(e.to_string()))?;
    let answer = timed(ctx.config.connect_timeout(), "welcome", async {
        loop {
            match reader.next_line().await? {
                Some(bytes) => {
                    if let Some(msg) = codec::decode_line(&bytes) {
                        return Ok(msg.reply);
                    }
                }
                None => {
                    return Err(DcapError::Io(std::io::ErrorKind::UnexpectedEof.into()));
                }
            }
        }
    })
    .await
    .map_err(|e| hello_failed(e.to_string()))?;
    match answer {
        Reply::Welcome { major, minor } => {
            info!(door = %key, major, minor, "control line established");
        }
        Reply::Rejected(reason) => return Err(hello_failed(format!("rejected: {reason}"))),
        other => return Err(hello_failed(format!("unexpected {other:?}"))),
    }

    let registered = ctx.lines.insert_or_existing(line.clone());
    if !Arc::ptr_eq(&registered, &line) {
        debug!(door = %key, "lost dial race, using the existing line");
        line.close().await;
        return Ok(registered);
    }
    ctx.poller.add(line.clone(), reader);
    Ok(line)
}

/// Render the open command for `node` under queue `qid`.
pub(crate) fn open_command(ctx: &Context, node: &Node, qid: u32, data_port: u16) -> Result<String> {
    let cfg = &ctx.config;
    let mut cmd = Command::new(qid, node.command.verb()).quoted(&node.target.ident);
    match &node.command {
        AsciiCommand::Open {
            access,
            create_mode,
            truncate,
        } => {
            cmd = cmd.arg(access.as_str());
            if let (Some(mode), Some(_)) = (create_mode, &node.target.url) {
                cmd = cmd.option("mode", format!("0{mode:o}"));
            }
            if *truncate {
                cmd = cmd.flag("truncate");
            }
            cmd = cmd
                .arg(ctx.reply_host.as_str())
                .arg(data_port.to_string())
                .option("timeout", cfg.open_timeout)
                .option("onerror", cfg.on_error.as_str());
            // Named from the mover's side.
            if cfg.tcp_receive_buffer != 0 {
                cmd = cmd.option("send", cfg.tcp_receive_buffer);
            }
            if cfg.tcp_send_buffer != 0 {
                cmd = cmd.option("receive", cfg.tcp_send_buffer);
            }
            if cfg.client_active {
                cmd = cmd.flag("passive");
            }
        }
        AsciiCommand::Opendir => {
            cmd = cmd.arg(ctx.reply_host.as_str()).arg(data_port.to_string());
            if cfg.client_active {
                cmd = cmd.flag("passive");
            }
        }
        AsciiCommand::Stage {
            stage_time,
            location,
        }
        | AsciiCommand::Check {
            stage_time,
            location,
        } => {
            cmd = cmd
                .option("stagetime", stage_time)
                .option("location", location.as_deref().unwrap_or(&ctx.reply_host));
        }
        AsciiCommand::Mkdir { mode } | AsciiCommand::Chmod { mode } => {
            cmd = cmd.option("mode", mode);
        }
        AsciiCommand::Chown { uid, gid } => {
            cmd = cmd.option("owner", format!("{uid}:{gid}"));
        }
        AsciiCommand::Rename { to } => {
            if codec::name_invalid(to) {
                return Err(DcapError::InvalidName(to.clone()));
            }
            cmd = cmd.quoted(to);
        }
        AsciiCommand::Stat
        | AsciiCommand::Lstat
        | AsciiCommand::Fstat
        | AsciiCommand::Unlink
        | AsciiCommand::Rmdir => {}
    }
    for extra in &cfg.extra_options {
        cmd = cmd.arg(extra.as_str());
    }
    Ok(cmd.option("uid", ctx.ids.uid).render())
}

/// First open of a session: control line, queue, then the open conversation.
pub(crate) async fn start(ctx: &Context, node: &mut Node) -> Result<()> {
    let line = control_line(ctx, node.target.url.as_ref()).await?;
    node.queue = Some(ctx.queues.create(ctx.next_queue_id(), line.id));
    node.line = Some(line);
    open_conversation(ctx, node).await
}

/// Send the open command on the session's line and collect the answer: a data
/// channel for open/opendir, otherwise the door's reply.
pub(crate) async fn open_conversation(ctx: &Context, node: &mut Node) -> Result<()> {
    let (Some(line), Some(qid)) = (node.line.clone(), node.queue_id()) else {
        return Err(DcapError::ControlLineDown("session has no control line".into()));
    };
    let passive = node.command.needs_data() && !ctx.config.client_active;
    let (port, pending) = if passive {
        let cb = ctx.callback().await?;
        (cb.port(), Some(cb.expect(qid)))
    } else {
        (0, None)
    };
    let text = open_command(ctx, node, qid, port)?;
    line.send(&text, ctx.config.ping_timeout()).await?;

    if node.command.needs_data() {
        let channel = data_hello(ctx, node, pending).await;
        if channel.is_err() {
            if let Some(cb) = ctx.callback.get() {
                cb.forget(qid);
            }
        }
        let channel = channel?;
        debug!(session = node.id.0, mover = channel.peer(), "data channel open");
        node.data = Some(channel);
        return Ok(());
    }

    let Some(queue) = node.queue.as_mut() else {
        return Err(DcapError::ControlLineDown("session has no queue".into()));
    };
    let limit = ctx.config.reply_timeout();
    loop {
        let Some(msg) = queue.dequeue(Wait::HaveTo(limit)).await? else {
            continue;
        };
        match msg.reply {
            Reply::Ok => return Ok(()),
            Reply::Stat(st) => {
                node.stat = Some(st);
                return Ok(());
            }
            Reply::Failed {
                code,
                message,
                errno,
            } => {
                return Err(DcapError::Server {
                    code,
                    message,
                    errno,
                })
            }
            other => debug!(reply = ?other, "ignoring control reply to {}", node.command.verb()),
        }
    }
}

/// Wait for the mover: its callback connection (passive) or the door's
/// `connect` instruction (active). A `failed` from the door ends the wait.
async fn data_hello(
    ctx: &Context,
    node: &mut Node,
    pending: Option<oneshot::Receiver<TcpStream>>,
) -> Result<DataChannel> {
    let Some(queue) = node.queue.as_mut() else {
        return Err(DcapError::ControlLineDown("session has no queue".into()));
    };
    let qid = queue.id();
    let limit = ctx.config.reply_timeout();
    timed(limit, "mover connection", async {
        let mut pending = pending;
        loop {
            let msg = match pending.as_mut() {
                Some(rx) => tokio::select! {
                    stream = rx => {
                        let stream = stream.map_err(|_| {
                            DcapError::Protocol("callback listener went away".into())
                        })?;
                        return data_channel(ctx, stream);
                    }
                    msg = queue.dequeue(Wait::HaveTo(limit)) => msg?,
                },
                None => queue.dequeue(Wait::HaveTo(limit)).await?,
            };
            let Some(msg) = msg else {
                continue;
            };
            match msg.reply {
                Reply::Connect {
                    host,
                    port,
                    challenge,
                } if pending.is_none() => {
                    return dial_mover(ctx, qid, &host, port, &challenge).await;
                }
                Reply::Failed {
                    code,
                    message,
                    errno,
                } => {
                    return Err(DcapError::Server {
                        code,
                        message,
                        errno,
                    })
                }
                other => debug!(reply = ?other, "ignoring control reply while waiting for mover"),
            }
        }
    })
    .await
}

/// Active mode: dial the mover and identify with `i32 qid, i32 len, challenge`.
async fn dial_mover(
    ctx: &Context,
    qid: u32,
    host: &str,
    port: u16,
    challenge: &str,
) -> Result<DataChannel> {
    let key = format!("{host}:{port}");
    let door = DoorSpec {
        host: host.to_string(),
        port,
        tunnel: None,
        tunnel_type: None,
    };
    let mut stream = connect_any(&resolve(&door).await?, &key, ctx).await?;
    let mut greeting = Vec::with_capacity(8 + challenge.len());
    greeting.extend_from_slice(&(qid as i32).to_be_bytes());
    greeting.extend_from_slice(&(challenge.len() as i32).to_be_bytes());
    greeting.extend_from_slice(challenge.as_bytes());
    stream.write_all(&greeting).await?;
    info!(mover = %key, session = qid, "connected to mover");
    data_channel(ctx, stream)
}

fn data_channel(ctx: &Context, stream: TcpStream) -> Result<DataChannel> {
    transport::tune(&stream, ctx.config.tcp_send_buffer, ctx.config.tcp_receive_buffer)?;
    Ok(DataChannel::new(stream))
}
