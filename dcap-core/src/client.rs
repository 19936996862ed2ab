//! Process-wide client state and the descriptor-level API.
//!
//! A [`Dcap`] handle owns one [`Context`]: the control-line registry, the
//! message queues, the poller, the session arena, the callback listener and
//! the tunnel providers. Clones share it.

use std::sync::atomic::{AtomicI32, AtomicU32, Ordering};
use std::sync::Arc;

use tokio::sync::{OnceCell, OwnedMutexGuard};
use tracing::{debug, info};

use crate::callback::CallbackListener;
use crate::codec::StatInfo;
use crate::config::{self, Config};
use crate::connect;
use crate::error::{DcapError, Result};
use crate::mqueue::MessageQueues;
use crate::poll::{ControlLines, Poller};
use crate::protocol::{Checksum, Whence};
use crate::reconnect::ping_pong;
use crate::registry::{Fd, Registry, SessionId};
use crate::session::{AsciiCommand, IoVec, Node, OpenOptions, Target};
use crate::tunnel::TunnelRegistry;

/// First descriptor handed out; keeps clear of real descriptors in hosts that mix both.
const FIRST_FD: i32 = 1024;

/// Identity announced in `hello` and `-uid=`.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Ids {
    pub uid: u32,
    pub gid: u32,
    pub pid: u32,
}

impl Ids {
    fn current() -> Self {
        // SAFETY: these calls have no preconditions and cannot fail.
        unsafe {
            Self {
                uid: libc::getuid(),
                gid: libc::getgid(),
                pid: libc::getpid() as u32,
            }
        }
    }
}

fn local_hostname() -> String {
    let mut buf = [0u8; 256];
    // SAFETY: buf is writable for its full length.
    let rc = unsafe { libc::gethostname(buf.as_mut_ptr().cast(), buf.len()) };
    if rc != 0 {
        return "localhost".into();
    }
    let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    String::from_utf8_lossy(&buf[..end]).into_owned()
}

pub(crate) struct Context {
    pub(crate) config: Config,
    pub(crate) lines: Arc<ControlLines>,
    pub(crate) queues: Arc<MessageQueues>,
    pub(crate) poller: Poller,
    pub(crate) nodes: Registry<Node>,
    pub(crate) callback: OnceCell<CallbackListener>,
    pub(crate) tunnels: TunnelRegistry,
    /// Host name movers are told to call back.
    pub(crate) reply_host: String,
    pub(crate) ids: Ids,
    next_queue: AtomicU32,
    next_fd: AtomicI32,
}

impl Context {
    pub(crate) fn next_queue_id(&self) -> u32 {
        self.next_queue.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn next_fd(&self) -> Fd {
        Fd(self.next_fd.fetch_add(1, Ordering::Relaxed))
    }

    /// The passive-mode listener, bound on first use.
    pub(crate) async fn callback(&self) -> Result<&CallbackListener> {
        self.callback
            .get_or_try_init(|| {
                CallbackListener::bind(self.config.callback_port, self.config.callback_port_range)
            })
            .await
    }
}

/// Handle to a DCAP client. Cheap to clone; all clones share control lines and sessions.
#[derive(Clone)]
pub struct Dcap {
    ctx: Arc<Context>,
}

impl Dcap {
    /// Client with `config` and the built-in tunnel providers. Must be called
    /// inside a Tokio runtime: the control-line poller is spawned here.
    pub fn new(config: Config) -> Result<Self> {
        Self::with_tunnels(config, TunnelRegistry::default())
    }

    /// Client configured from the config file and `DCACHE_*` environment.
    pub fn from_env() -> Result<Self> {
        Self::new(config::load())
    }

    pub fn with_tunnels(config: Config, tunnels: TunnelRegistry) -> Result<Self> {
        if tokio::runtime::Handle::try_current().is_err() {
            return Err(DcapError::Config("no Tokio runtime".into()));
        }
        let queues = Arc::new(MessageQueues::new());
        let lines = Arc::new(ControlLines::default());
        let poller = Poller::spawn(queues.clone(), lines.clone());
        let reply_host = config.reply_host.clone().unwrap_or_else(local_hostname);
        info!(reply_host = %reply_host, active = config.client_active, "dcap client ready");
        Ok(Self {
            ctx: Arc::new(Context {
                config,
                lines,
                queues,
                poller,
                nodes: Registry::new(),
                callback: OnceCell::new(),
                tunnels,
                reply_host,
                ids: Ids::current(),
                next_queue: AtomicU32::new(0),
                next_fd: AtomicI32::new(FIRST_FD),
            }),
        })
    }

    async fn session(&self, fd: Fd) -> Result<OwnedMutexGuard<Node>> {
        self.ctx
            .nodes
            .lookup_by_fd(fd)
            .await
            .ok_or(DcapError::BadFd(fd.0))
    }

    /// Create a session, run its open conversation, and hand out a descriptor.
    async fn open_session(&self, target: Target, command: AsciiCommand) -> Result<Fd> {
        let ctx = &*self.ctx;
        let (id, mut node) = ctx.nodes.create(|id| Node::new(id, target, command)).await;
        if let Err(e) = connect::start(ctx, &mut node).await {
            debug!(session = id.0, error = %e, "open failed");
            node.teardown(ctx).await;
            retire(ctx, id, node);
            return Err(e);
        }
        node.command.for_reopen();
        let fd = ctx.next_fd();
        ctx.nodes.attach_fd(id, fd);
        info!(session = id.0, %fd, name = %node.target.ident, verb = node.command.verb(), "session open");
        Ok(fd)
    }

    /// One-shot metadata request: a session that never gets a descriptor.
    async fn request(&self, target: Target, command: AsciiCommand) -> Result<Option<StatInfo>> {
        let ctx = &*self.ctx;
        let (id, mut node) = ctx.nodes.create(|id| Node::new(id, target, command)).await;
        let result = connect::start(ctx, &mut node).await;
        node.teardown(ctx).await;
        let stat = node.stat.take();
        retire(ctx, id, node);
        result.map(|()| stat)
    }

    async fn stat_request(&self, target: Target, command: AsciiCommand) -> Result<StatInfo> {
        self.request(target, command)
            .await?
            .ok_or_else(|| DcapError::Protocol("door answered stat without a stat block".into()))
    }

    pub async fn open(&self, path: &str, options: &OpenOptions) -> Result<Fd> {
        let target = Target::new(path)?;
        let command = options.command()?;
        self.open_session(target, command).await
    }

    pub async fn read(&self, fd: Fd, buf: &mut [u8]) -> Result<usize> {
        self.session(fd).await?.read(&self.ctx, buf).await
    }

    pub async fn write(&self, fd: Fd, buf: &[u8]) -> Result<usize> {
        self.session(fd).await?.write(&self.ctx, buf).await
    }

    pub async fn lseek(&self, fd: Fd, offset: i64, whence: Whence) -> Result<u64> {
        self.session(fd).await?.lseek(&self.ctx, offset, whence).await
    }

    pub async fn readv(&self, fd: Fd, iov: &mut [IoVec<'_>]) -> Result<usize> {
        self.session(fd).await?.readv(&self.ctx, iov).await
    }

    /// File size and the mover's current offset.
    pub async fn locate(&self, fd: Fd) -> Result<(u64, u64)> {
        self.session(fd).await?.locate(&self.ctx).await
    }

    /// Drop `fd`. The session is closed with the mover and the door only when
    /// this was its last alias.
    pub async fn close(&self, fd: Fd) -> Result<()> {
        let ctx = &*self.ctx;
        let (id, remaining) = ctx.nodes.detach_fd(fd).ok_or(DcapError::BadFd(fd.0))?;
        if remaining > 0 {
            debug!(session = id.0, %fd, remaining, "alias closed");
            return Ok(());
        }
        let Some(node) = ctx.nodes.unplug(id) else {
            return Ok(());
        };
        let mut node = node.lock_owned().await;
        let result = node.close(ctx).await;
        ctx.nodes.destroy(id, node);
        info!(session = id.0, %fd, ok = result.is_ok(), "session closed");
        result
    }

    /// New descriptor for the session behind `fd`.
    pub fn dup(&self, fd: Fd) -> Result<Fd> {
        let ctx = &*self.ctx;
        let id = ctx.nodes.session_of(fd).ok_or(DcapError::BadFd(fd.0))?;
        let alias = ctx.next_fd();
        if !ctx.nodes.attach_fd(id, alias) {
            return Err(DcapError::BadFd(fd.0));
        }
        debug!(session = id.0, %fd, %alias, "descriptor duplicated");
        Ok(alias)
    }

    pub async fn stat(&self, path: &str) -> Result<StatInfo> {
        self.stat_request(Target::new(path)?, AsciiCommand::Stat).await
    }

    pub async fn lstat(&self, path: &str) -> Result<StatInfo> {
        self.stat_request(Target::new(path)?, AsciiCommand::Lstat).await
    }

    /// Stat of an open file. For a file open for writing the size comes from
    /// the mover, which knows about bytes the door has not seen yet.
    pub async fn fstat(&self, fd: Fd) -> Result<StatInfo> {
        let mut node = self.session(fd).await?;
        let mut st = self
            .stat_request(node.target.clone(), AsciiCommand::Fstat)
            .await?;
        if node.command.writable() && node.data.is_some() && !node.failed {
            let (size, _) = node.locate(&self.ctx).await?;
            st.size = size;
        }
        Ok(st)
    }

    pub async fn unlink(&self, path: &str) -> Result<()> {
        self.request(Target::new(path)?, AsciiCommand::Unlink).await.map(drop)
    }

    pub async fn rmdir(&self, path: &str) -> Result<()> {
        self.request(Target::new(path)?, AsciiCommand::Rmdir).await.map(drop)
    }

    pub async fn mkdir(&self, path: &str, mode: u32) -> Result<()> {
        self.request(Target::new(path)?, AsciiCommand::Mkdir { mode })
            .await
            .map(drop)
    }

    pub async fn chmod(&self, path: &str, mode: u32) -> Result<()> {
        self.request(Target::new(path)?, AsciiCommand::Chmod { mode })
            .await
            .map(drop)
    }

    pub async fn chown(&self, path: &str, uid: u32, gid: u32) -> Result<()> {
        self.request(Target::new(path)?, AsciiCommand::Chown { uid, gid })
            .await
            .map(drop)
    }

    pub async fn rename(&self, from: &str, to: &str) -> Result<()> {
        let command = AsciiCommand::Rename { to: to.to_string() };
        self.request(Target::new(from)?, command).await.map(drop)
    }

    /// Ask the door to bring `path` online within `stage_time` seconds.
    pub async fn stage(&self, path: &str, stage_time: i64, location: Option<&str>) -> Result<()> {
        let command = AsciiCommand::Stage {
            stage_time,
            location: location.map(str::to_string),
        };
        self.request(Target::new(path)?, command).await.map(drop)
    }

    /// Whether `path` is online. A door refusal means "no", not an error.
    pub async fn check(&self, path: &str, location: Option<&str>) -> Result<bool> {
        let command = AsciiCommand::Check {
            stage_time: 0,
            location: location.map(str::to_string),
        };
        match self.request(Target::new(path)?, command).await {
            Ok(_) => Ok(true),
            Err(DcapError::Server { .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }

    pub async fn opendir(&self, path: &str) -> Result<Fd> {
        self.open_session(Target::new(path)?, AsciiCommand::Opendir).await
    }

    /// Next entry name; `None` at the end of the listing.
    pub async fn readdir(&self, fd: Fd) -> Result<Option<String>> {
        self.session(fd).await?.readdir(&self.ctx).await
    }

    pub async fn closedir(&self, fd: Fd) -> Result<()> {
        self.close(fd).await
    }

    /// Stream consecutive writes into one transaction instead of confirming
    /// each. Turning it off finalizes the open transaction.
    pub async fn set_unsafe_write(&self, fd: Fd, on: bool) -> Result<()> {
        let mut node = self.session(fd).await?;
        node.unsafe_write = on;
        if !on {
            node.finish_write(&self.ctx).await?;
        }
        Ok(())
    }

    /// Checksum sent to the mover with CLOSE.
    pub async fn set_checksum(&self, fd: Fd, checksum: Option<Checksum>) -> Result<()> {
        self.session(fd).await?.checksum = checksum;
        Ok(())
    }

    /// Probe the control line behind `fd`. A line that fails is retired.
    pub async fn ping(&self, fd: Fd) -> Result<bool> {
        let line = self.session(fd).await?.line.clone();
        match line {
            Some(line) if line.is_alive() => Ok(ping_pong(&self.ctx, &line).await),
            _ => Ok(false),
        }
    }
}

fn retire(ctx: &Context, id: SessionId, node: OwnedMutexGuard<Node>) {
    ctx.nodes.unplug(id);
    ctx.nodes.destroy(id, node);
}
