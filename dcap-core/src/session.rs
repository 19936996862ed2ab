//! One open remote file, directory, or metadata request, and its data-channel I/O.
//!
//! `pos` plus the pending `seek` is always the offset the next data command
//! asks for. `SET`/`CURRENT` seeks are folded into the next READ or WRITE; only
//! `END` costs a round trip. Failures that reconnecting can cure go through
//! [`Node::recover`] under a per-call retry budget.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, warn};

use crate::client::Context;
use crate::codec::{Reply, StatInfo};
use crate::error::{DcapError, Result};
use crate::mqueue::{MessageQueue, Wait};
use crate::poll::ControlLine;
use crate::protocol::{Checksum, ConfirmationBlock, DataChannel, IoCommand, Opcode, Whence};
use crate::reconnect::Resume;
use crate::registry::SessionId;
use crate::transport::timed;
use crate::url::DcapUrl;

/// Block size used when listing a directory through the read path.
const DIR_BLOCK: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    Read,
    Write,
    ReadWrite,
}

impl Access {
    pub fn as_str(self) -> &'static str {
        match self {
            Access::Read => "r",
            Access::Write => "w",
            Access::ReadWrite => "rw",
        }
    }
}

/// Open request, like `std::fs::OpenOptions`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenOptions {
    read: bool,
    write: bool,
    create: bool,
    truncate: bool,
    mode: u32,
}

impl Default for OpenOptions {
    fn default() -> Self {
        Self {
            read: false,
            write: false,
            create: false,
            truncate: false,
            mode: 0o644,
        }
    }
}

impl OpenOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn read(&mut self, yes: bool) -> &mut Self {
        self.read = yes;
        self
    }

    pub fn write(&mut self, yes: bool) -> &mut Self {
        self.write = yes;
        self
    }

    pub fn create(&mut self, yes: bool) -> &mut Self {
        self.create = yes;
        self
    }

    pub fn truncate(&mut self, yes: bool) -> &mut Self {
        self.truncate = yes;
        self
    }

    /// Permission bits sent when the open creates the file.
    pub fn mode(&mut self, mode: u32) -> &mut Self {
        self.mode = mode;
        self
    }

    /// From POSIX `open(2)` flags.
    pub fn from_flags(flags: i32, mode: u32) -> Result<Self> {
        let (read, write) = match flags & libc::O_ACCMODE {
            libc::O_RDONLY => (true, false),
            libc::O_WRONLY => (false, true),
            libc::O_RDWR => (true, true),
            _ => return Err(DcapError::Flags),
        };
        Ok(Self {
            read,
            write,
            create: flags & libc::O_CREAT != 0,
            truncate: flags & libc::O_TRUNC != 0,
            mode,
        })
    }

    pub(crate) fn access(&self) -> Result<Access> {
        match (self.read, self.write) {
            (true, false) => Ok(Access::Read),
            (false, true) => Ok(Access::Write),
            (true, true) => Ok(Access::ReadWrite),
            (false, false) => Err(DcapError::Flags),
        }
    }

    pub(crate) fn command(&self) -> Result<AsciiCommand> {
        Ok(AsciiCommand::Open {
            access: self.access()?,
            create_mode: self.create.then_some(self.mode),
            truncate: self.truncate,
        })
    }
}

/// What the session asks the door for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AsciiCommand {
    Open {
        access: Access,
        create_mode: Option<u32>,
        truncate: bool,
    },
    Opendir,
    Stat,
    Lstat,
    Fstat,
    Unlink,
    Rmdir,
    Mkdir { mode: u32 },
    Chmod { mode: u32 },
    Chown { uid: u32, gid: u32 },
    Rename { to: String },
    Stage { stage_time: i64, location: Option<String> },
    Check { stage_time: i64, location: Option<String> },
}

impl AsciiCommand {
    pub fn verb(&self) -> &'static str {
        match self {
            AsciiCommand::Open { .. } => "open",
            AsciiCommand::Opendir => "opendir",
            AsciiCommand::Stat => "stat",
            AsciiCommand::Lstat => "lstat",
            AsciiCommand::Fstat => "fstat",
            AsciiCommand::Unlink => "unlink",
            AsciiCommand::Rmdir => "rmdir",
            AsciiCommand::Mkdir { .. } => "mkdir",
            AsciiCommand::Chmod { .. } => "chmod",
            AsciiCommand::Chown { .. } => "chown",
            AsciiCommand::Rename { .. } => "rename",
            AsciiCommand::Stage { .. } => "stage",
            AsciiCommand::Check { .. } => "check",
        }
    }

    /// Commands answered with a data channel rather than a control reply.
    pub fn needs_data(&self) -> bool {
        matches!(self, AsciiCommand::Open { .. } | AsciiCommand::Opendir)
    }

    pub fn writable(&self) -> bool {
        matches!(
            self,
            AsciiCommand::Open {
                access: Access::Write | Access::ReadWrite,
                ..
            }
        )
    }

    /// A reopen after a broken data channel must not create or truncate again.
    pub(crate) fn for_reopen(&mut self) {
        if let AsciiCommand::Open {
            create_mode,
            truncate,
            ..
        } = self
        {
            *create_mode = None;
            *truncate = false;
        }
    }
}

/// The name the door is asked about: the URL verbatim, or a plain path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub ident: String,
    pub url: Option<DcapUrl>,
}

impl Target {
    pub fn new(path: &str) -> Result<Self> {
        if crate::codec::name_invalid(path) {
            return Err(DcapError::InvalidName(path.to_string()));
        }
        let url = DcapUrl::parse(path);
        Ok(Self {
            ident: url.as_ref().map_or(path, |u| u.as_str()).to_string(),
            url,
        })
    }
}

/// Caller buffer for a vectored read at `offset`.
#[derive(Debug)]
pub struct IoVec<'a> {
    pub offset: u64,
    pub buf: &'a mut [u8],
}

#[derive(Debug, Default)]
pub(crate) struct DirState {
    buf: Vec<u8>,
    eof: bool,
}

pub(crate) struct Node {
    pub(crate) id: SessionId,
    pub(crate) target: Target,
    pub(crate) command: AsciiCommand,
    pub(crate) line: Option<Arc<ControlLine>>,
    pub(crate) queue: Option<MessageQueue>,
    pub(crate) data: Option<DataChannel>,
    pub(crate) pos: u64,
    pub(crate) seek: Option<u64>,
    pub(crate) unsafe_write: bool,
    /// A WRITE transaction is streaming and not yet closed with FIN.
    pub(crate) write_open: bool,
    pub(crate) failed: bool,
    pub(crate) stat: Option<StatInfo>,
    pub(crate) checksum: Option<Checksum>,
    dir: DirState,
}

/// The data channel and queue of a session, borrowed together.
macro_rules! channels {
    ($node:expr) => {
        match ($node.data.as_mut(), $node.queue.as_mut()) {
            (Some(d), Some(q)) => (d, q),
            _ => {
                return Err($crate::error::DcapError::Protocol(
                    "session has no data channel".into(),
                ))
            }
        }
    };
}
pub(crate) use channels;

impl Node {
    pub fn new(id: SessionId, target: Target, command: AsciiCommand) -> Self {
        Self {
            id,
            target,
            command,
            line: None,
            queue: None,
            data: None,
            pos: 0,
            seek: None,
            unsafe_write: false,
            write_open: false,
            failed: false,
            stat: None,
            checksum: None,
            dir: DirState::default(),
        }
    }

    pub fn queue_id(&self) -> Option<u32> {
        self.queue.as_ref().map(|q| q.id())
    }

    /// Offset the next data command will ask for.
    pub fn position(&self) -> u64 {
        self.seek.unwrap_or(self.pos)
    }

    fn usable(&self) -> Result<()> {
        if self.failed {
            return Err(DcapError::SessionFailed);
        }
        Ok(())
    }

    /// Count a failed attempt and reconnect. Errors that reconnecting cannot
    /// cure, an exhausted budget, or a failed recovery end the call.
    pub(crate) async fn on_failure(
        &mut self,
        ctx: &Context,
        err: DcapError,
        attempts: &mut u32,
        resume: Resume,
    ) -> Result<()> {
        if !err.is_recoverable() {
            return Err(err);
        }
        let mut last = err;
        loop {
            *attempts += 1;
            if *attempts >= ctx.config.max_retries {
                error!(session = self.id.0, attempts = *attempts, error = %last, "retry budget exhausted");
                self.failed = true;
                return Err(DcapError::RetriesExhausted {
                    attempts: *attempts,
                    last: Box::new(last),
                });
            }
            warn!(session = self.id.0, attempt = *attempts, error = %last, "data channel failed, recovering");
            match self.recover(ctx, resume).await {
                Ok(()) => return Ok(()),
                Err(e) if e.is_recoverable() => last = e,
                Err(e) => {
                    error!(session = self.id.0, error = %e, "recovery failed");
                    self.failed = true;
                    return Err(DcapError::RecoveryFailed(Box::new(e)));
                }
            }
        }
    }

    pub async fn read(&mut self, ctx: &Context, buf: &mut [u8]) -> Result<usize> {
        self.usable()?;
        self.finish_write(ctx).await?;
        if buf.is_empty() {
            return Ok(0);
        }
        let mut done = 0;
        let mut streaming = false;
        let mut attempts = 0;
        loop {
            match self.read_attempt(ctx, buf, &mut done, &mut streaming).await {
                Ok(()) => return Ok(done),
                Err(e) => {
                    let remaining = (buf.len() - done) as u64;
                    if remaining == 0 {
                        // Every byte arrived; only the FIN went missing.
                        self.on_failure(ctx, e, &mut attempts, Resume::ConnectOnly).await?;
                        return Ok(done);
                    }
                    let resume = Resume::PositionAndRead {
                        offset: self.pos,
                        size: remaining,
                    };
                    self.on_failure(ctx, e, &mut attempts, resume).await?;
                    streaming = true;
                }
            }
        }
    }

    /// Issue READ (or SEEK_READ) unless a stream is already set up, then drain
    /// chunks into `buf[done..]`, advancing `pos` byte by byte of progress.
    async fn read_attempt(
        &mut self,
        ctx: &Context,
        buf: &mut [u8],
        done: &mut usize,
        streaming: &mut bool,
    ) -> Result<()> {
        let limit = ctx.config.io_timeout();
        let (data, queue) = channels!(self);
        if !*streaming {
            let size = (buf.len() - *done) as u64;
            let cmd = match self.seek.take() {
                Some(target) => {
                    self.pos = target;
                    IoCommand::SeekRead {
                        offset: offset_field(target)?,
                        whence: Whence::Set,
                        size,
                    }
                }
                None => IoCommand::Read { size },
            };
            let op = cmd.opcode();
            timed(limit, "data command", data.send(&cmd)).await?;
            let block = confirm(data, queue, limit).await?;
            expect_ack(&block, op)?;
            expect_data(&confirm(data, queue, limit).await?)?;
            *streaming = true;
        }
        loop {
            let Some(len) = watched(queue, limit, "data chunk", data.chunk_len()).await? else {
                break;
            };
            let room = buf.len() - *done;
            if len > room {
                return Err(DcapError::Protocol(format!(
                    "mover sent a {len}-byte chunk with {room} bytes left to read"
                )));
            }
            let chunk = &mut buf[*done..*done + len];
            let got = watched(queue, limit, "data chunk", data.payload(chunk)).await?;
            *done += got;
            self.pos += got as u64;
            if got < len {
                return Err(DcapError::Io(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    format!("data channel closed after {got} of {len} chunk bytes"),
                )));
            }
        }
        *streaming = false;
        expect_fin(&confirm(data, queue, limit).await?)
    }

    pub async fn write(&mut self, ctx: &Context, buf: &[u8]) -> Result<usize> {
        self.usable()?;
        if buf.is_empty() {
            return Ok(0);
        }
        if self.write_open && self.seek.is_some() {
            self.finish_write(ctx).await?;
        }
        let start = self.position();
        // Bytes already streamed without confirmation die with the channel.
        let unconfirmed = self.write_open;
        let mut attempts = 0;
        loop {
            match self.write_attempt(ctx, buf).await {
                Ok(()) => return Ok(buf.len()),
                Err(e) => {
                    self.on_failure(ctx, e, &mut attempts, Resume::Position { offset: start })
                        .await?;
                    if unconfirmed {
                        return Err(unsafe_write_lost());
                    }
                }
            }
        }
    }

    async fn write_attempt(&mut self, ctx: &Context, buf: &[u8]) -> Result<()> {
        let limit = ctx.config.io_timeout();
        let (data, queue) = channels!(self);
        if !self.write_open {
            let cmd = match self.seek.take() {
                Some(target) => {
                    self.pos = target;
                    IoCommand::SeekWrite {
                        offset: offset_field(target)?,
                        whence: Whence::Set,
                    }
                }
                None => IoCommand::Write,
            };
            let op = cmd.opcode();
            timed(limit, "data command", data.send(&cmd)).await?;
            expect_ack(&confirm(data, queue, limit).await?, op)?;
            timed(limit, "data header", data.send_data_header()).await?;
            self.write_open = true;
        }
        timed(limit, "data chunk", data.send_chunk(buf)).await?;
        self.pos += buf.len() as u64;
        if !self.unsafe_write {
            self.write_open = false;
            end_write(data, queue, limit).await?;
        }
        Ok(())
    }

    /// Close an open unsafe-write transaction. On failure the data channel is
    /// re-established and the error still reported: the streamed bytes are gone.
    pub(crate) async fn finish_write(&mut self, ctx: &Context) -> Result<()> {
        if !self.write_open {
            return Ok(());
        }
        self.write_open = false;
        let limit = ctx.config.io_timeout();
        let result = {
            let (data, queue) = channels!(self);
            end_write(data, queue, limit).await
        };
        if let Err(e) = result {
            warn!(session = self.id.0, error = %e, "unsafe write could not be finalized");
            let mut attempts = 0;
            self.on_failure(ctx, e, &mut attempts, Resume::ConnectOnly).await?;
            return Err(unsafe_write_lost());
        }
        Ok(())
    }

    pub async fn lseek(&mut self, ctx: &Context, offset: i64, whence: Whence) -> Result<u64> {
        self.usable()?;
        let target = match whence {
            Whence::Set => u64::try_from(offset)
                .map_err(|_| DcapError::InvalidArgument(format!("seek to {offset}")))?,
            Whence::Current => self
                .position()
                .checked_add_signed(offset)
                .ok_or_else(|| DcapError::InvalidArgument(format!("seek by {offset}")))?,
            Whence::End => return self.seek_end(ctx, offset).await,
        };
        self.seek = (target != self.pos).then_some(target);
        Ok(target)
    }

    async fn seek_end(&mut self, ctx: &Context, offset: i64) -> Result<u64> {
        self.finish_write(ctx).await?;
        let mut attempts = 0;
        loop {
            let limit = ctx.config.io_timeout();
            let result = async {
                let (data, queue) = channels!(self);
                timed(
                    limit,
                    "data command",
                    data.send(&IoCommand::Seek {
                        offset,
                        whence: Whence::End,
                    }),
                )
                .await?;
                let block = confirm(data, queue, limit).await?;
                expect_ack(&block, Opcode::Seek)?;
                u64::try_from(block.lseek)
                    .map_err(|_| DcapError::Protocol(format!("mover seeked to {}", block.lseek)))
            }
            .await;
            match result {
                Ok(pos) => {
                    self.pos = pos;
                    self.seek = None;
                    return Ok(pos);
                }
                Err(e) => self.on_failure(ctx, e, &mut attempts, Resume::ConnectOnly).await?,
            }
        }
    }

    /// Vectored read. The file position is left where it was.
    pub async fn readv(&mut self, ctx: &Context, iov: &mut [IoVec<'_>]) -> Result<usize> {
        self.usable()?;
        self.finish_write(ctx).await?;
        if iov.is_empty() {
            return Ok(0);
        }
        let mut blocks = Vec::with_capacity(iov.len());
        for v in iov.iter() {
            let len = u32::try_from(v.buf.len())
                .map_err(|_| DcapError::InvalidArgument("readv block too large".into()))?;
            blocks.push((v.offset, len));
        }
        let cmd = IoCommand::ReadV { blocks };
        let mut attempts = 0;
        loop {
            match self.readv_attempt(ctx, &cmd, iov).await {
                Ok(n) => return Ok(n),
                Err(e) => self.on_failure(ctx, e, &mut attempts, Resume::ConnectOnly).await?,
            }
        }
    }

    async fn readv_attempt(
        &mut self,
        ctx: &Context,
        cmd: &IoCommand,
        iov: &mut [IoVec<'_>],
    ) -> Result<usize> {
        let limit = ctx.config.io_timeout();
        let (data, queue) = channels!(self);
        timed(limit, "data command", data.send(cmd)).await?;
        expect_ack(&confirm(data, queue, limit).await?, Opcode::ReadV)?;
        expect_data(&confirm(data, queue, limit).await?)?;
        let (mut block, mut filled, mut total) = (0usize, 0usize, 0usize);
        while let Some(mut len) = timed(limit, "data chunk", data.chunk_len()).await? {
            while len > 0 {
                while block < iov.len() && filled == iov[block].buf.len() {
                    block += 1;
                    filled = 0;
                }
                let Some(v) = iov.get_mut(block) else {
                    return Err(DcapError::Protocol("mover sent more readv data than asked".into()));
                };
                let take = len.min(v.buf.len() - filled);
                let got =
                    timed(limit, "data chunk", data.payload(&mut v.buf[filled..filled + take])).await?;
                if got < take {
                    return Err(DcapError::Io(std::io::ErrorKind::UnexpectedEof.into()));
                }
                filled += got;
                total += got;
                len -= got;
            }
        }
        expect_fin(&confirm(data, queue, limit).await?)?;
        Ok(total)
    }

    /// File size and mover-side offset.
    pub async fn locate(&mut self, ctx: &Context) -> Result<(u64, u64)> {
        self.usable()?;
        self.finish_write(ctx).await?;
        let mut attempts = 0;
        loop {
            let limit = ctx.config.io_timeout();
            let result = async {
                let (data, queue) = channels!(self);
                timed(limit, "data command", data.send(&IoCommand::Locate)).await?;
                let block = confirm(data, queue, limit).await?;
                expect_ack(&block, Opcode::Locate)?;
                Ok::<_, DcapError>((block.fsize.max(0) as u64, block.lseek.max(0) as u64))
            }
            .await;
            match result {
                Ok(r) => return Ok(r),
                Err(e) => self.on_failure(ctx, e, &mut attempts, Resume::ConnectOnly).await?,
            }
        }
    }

    /// Finalize any unsafe write, CLOSE the mover, and wait for the door's verdict.
    pub async fn close(&mut self, ctx: &Context) -> Result<()> {
        if self.data.is_none() || self.failed {
            self.teardown(ctx).await;
            return Ok(());
        }
        let finished = self.finish_write(ctx).await;
        let limit = ctx.config.io_timeout();
        let reply_limit = ctx.config.reply_timeout();
        let cmd = IoCommand::Close {
            checksum: self.checksum.clone(),
        };
        let closed = async {
            let (data, queue) = channels!(self);
            timed(limit, "data command", data.send(&cmd)).await?;
            expect_ack(&confirm(data, queue, limit).await?, Opcode::Close)?;
            await_door_ok(queue, reply_limit).await
        }
        .await;
        self.teardown(ctx).await;
        finished.and(closed)
    }

    /// Release the data channel and the message queue. The control line stays shared.
    pub(crate) async fn teardown(&mut self, ctx: &Context) {
        if let Some(mut data) = self.data.take() {
            data.shutdown().await;
        }
        if let Some(q) = self.queue.take() {
            ctx.queues.delete(q.id());
            if let Some(cb) = ctx.callback.get() {
                cb.forget(q.id());
            }
        }
        self.write_open = false;
    }

    /// Next directory entry; `None` once the listing is exhausted.
    pub async fn readdir(&mut self, ctx: &Context) -> Result<Option<String>> {
        loop {
            if let Some(i) = self.dir.buf.iter().position(|&b| b == b'\n') {
                let mut line: Vec<u8> = self.dir.buf.drain(..=i).collect();
                line.pop();
                if line.is_empty() {
                    continue;
                }
                return Ok(Some(String::from_utf8_lossy(&line).into_owned()));
            }
            if self.dir.eof {
                if self.dir.buf.is_empty() {
                    return Ok(None);
                }
                let rest = std::mem::take(&mut self.dir.buf);
                return Ok(Some(String::from_utf8_lossy(&rest).into_owned()));
            }
            let mut block = vec![0u8; DIR_BLOCK];
            let n = self.read(ctx, &mut block).await?;
            if n == 0 {
                self.dir.eof = true;
            }
            self.dir.buf.extend_from_slice(&block[..n]);
        }
    }
}

fn unsafe_write_lost() -> DcapError {
    DcapError::Io(std::io::Error::new(
        std::io::ErrorKind::Other,
        "unsafe write lost on a broken data channel",
    ))
}

fn offset_field(v: u64) -> Result<i64> {
    i64::try_from(v).map_err(|_| DcapError::InvalidArgument(format!("offset {v} too large")))
}

/// Next confirmation block, unless the door interrupts the transfer first.
pub(crate) async fn confirm(
    data: &mut DataChannel,
    queue: &mut MessageQueue,
    limit: Duration,
) -> Result<ConfirmationBlock> {
    watched(queue, limit, "mover reply", data.reply()).await
}

/// Run one data-channel step under `limit`. A `retry` or `failed` from the
/// door abandons the step; ordinary replies stay queued.
async fn watched<T, F>(
    queue: &mut MessageQueue,
    limit: Duration,
    what: &'static str,
    step: F,
) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    let step = timed(limit, what, step);
    tokio::pin!(step);
    tokio::select! {
        out = &mut step => out,
        interrupt = queue.interrupt() => Err(interrupted(interrupt)),
    }
}

fn interrupted(r: Result<Reply>) -> DcapError {
    match r {
        Ok(Reply::Retry) => DcapError::Protocol("door requested a retry".into()),
        Ok(Reply::Failed {
            code,
            message,
            errno,
        }) => DcapError::Server {
            code,
            message,
            errno,
        },
        Ok(other) => DcapError::ControlLineDown(format!("door sent {other:?} during transfer")),
        Err(e) => e,
    }
}

pub(crate) fn expect_ack(block: &ConfirmationBlock, op: Opcode) -> Result<()> {
    if block.code != Opcode::Ack as i32 {
        return Err(DcapError::Protocol(format!(
            "expected ACK for {}, got code {}",
            op.name(),
            block.code
        )));
    }
    if block.in_response != op as i32 || block.result != 0 {
        return Err(DcapError::Refused {
            command: op.name(),
            result: block.result,
            message: block.message.clone().unwrap_or_default(),
        });
    }
    Ok(())
}

pub(crate) fn expect_data(block: &ConfirmationBlock) -> Result<()> {
    if block.code != Opcode::Data as i32 {
        return Err(DcapError::Protocol(format!(
            "expected DATA, got code {}",
            block.code
        )));
    }
    Ok(())
}

fn expect_fin(block: &ConfirmationBlock) -> Result<()> {
    if block.code != Opcode::Fin as i32 {
        return Err(DcapError::Protocol(format!(
            "expected FIN, got code {}",
            block.code
        )));
    }
    if block.result != 0 {
        return Err(DcapError::Refused {
            command: "FIN",
            result: block.result,
            message: block.message.clone().unwrap_or_default(),
        });
    }
    Ok(())
}

pub(crate) async fn end_write(
    data: &mut DataChannel,
    queue: &mut MessageQueue,
    limit: Duration,
) -> Result<()> {
    timed(limit, "data chunk", data.send_end_of_data()).await?;
    expect_fin(&confirm(data, queue, limit).await?)
}

/// Door's answer to a finished request: `ok`, `failed`, or a stat block.
pub(crate) async fn await_door_ok(queue: &mut MessageQueue, limit: Duration) -> Result<()> {
    loop {
        let Some(msg) = queue.dequeue(Wait::HaveTo(limit)).await? else {
            continue;
        };
        match msg.reply {
            Reply::Ok => return Ok(()),
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
            other => debug!(reply = ?other, "ignoring control reply while closing"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_flags_map_to_access() {
        let o = OpenOptions::from_flags(libc::O_WRONLY | libc::O_CREAT | libc::O_TRUNC, 0o600)
            .unwrap();
        assert_eq!(
            o.command().unwrap(),
            AsciiCommand::Open {
                access: Access::Write,
                create_mode: Some(0o600),
                truncate: true,
            }
        );
        let rw = OpenOptions::from_flags(libc::O_RDWR, 0).unwrap();
        assert_eq!(rw.access().unwrap(), Access::ReadWrite);
        assert!(matches!(
            OpenOptions::from_flags(libc::O_ACCMODE, 0),
            Err(DcapError::Flags)
        ));
        assert!(matches!(OpenOptions::new().command(), Err(DcapError::Flags)));
    }

    #[test]
    fn reopen_drops_create_and_truncate() {
        let mut c = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .command()
            .unwrap();
        assert!(c.writable());
        c.for_reopen();
        assert_eq!(
            c,
            AsciiCommand::Open {
                access: Access::Write,
                create_mode: None,
                truncate: false,
            }
        );
    }

    #[test]
    fn target_prefers_url_form() {
        let t = Target::new("dcap://door:22125/pnfs/f").unwrap();
        assert_eq!(t.ident, "dcap://door:22125/pnfs/f");
        assert_eq!(t.url.as_ref().map(|u| u.host.as_str()), Some("door"));
        assert!(Target::new("/pnfs/plain").unwrap().url.is_none());
        assert!(matches!(Target::new("/a\"b"), Err(DcapError::InvalidName(_))));
    }

    fn block(code: Opcode, in_response: Opcode, result: i32) -> ConfirmationBlock {
        ConfirmationBlock {
            code: code as i32,
            in_response: in_response as i32,
            result,
            ..Default::default()
        }
    }

    #[test]
    fn ack_checks() {
        assert!(expect_ack(&block(Opcode::Ack, Opcode::Read, 0), Opcode::Read).is_ok());
        assert!(matches!(
            expect_ack(&block(Opcode::Ack, Opcode::Seek, 0), Opcode::Read),
            Err(DcapError::Refused { .. })
        ));
        assert!(matches!(
            expect_ack(&block(Opcode::Fin, Opcode::Read, 0), Opcode::Read),
            Err(DcapError::Protocol(_))
        ));
        assert!(expect_fin(&block(Opcode::Fin, Opcode::Write, 0)).is_ok());
        assert!(expect_fin(&block(Opcode::Fin, Opcode::Write, 5)).is_err());
    }

    #[test]
    fn lazy_seek_bookkeeping() {
        let mut n = Node::new(
            SessionId(1),
            Target::new("/f").unwrap(),
            AsciiCommand::Stat,
        );
        n.pos = 100;
        n.seek = Some(200);
        assert_eq!(n.position(), 200);
        n.seek = None;
        assert_eq!(n.position(), 100);
    }
}
