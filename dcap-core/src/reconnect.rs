//! Liveness probes and data-channel recovery.
//!
//! Recovery order: force-finalize any open unsafe write, drop the data
//! channel, probe the control line (replacing it when the probe fails), reopen
//! under a fresh queue ID, then put the mover back at the session's offset.

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::client::Context;
use crate::codec::{self, Reply};
use crate::connect;
use crate::error::{DcapError, Result};
use crate::mqueue::Wait;
use crate::poll::ControlLine;
use crate::protocol::{IoCommand, Opcode, Whence};
use crate::session::{channels, confirm, end_write, expect_ack, expect_data, Node};
use crate::transport::timed;

/// Where the mover should be left after reconnecting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resume {
    /// Restore `pos`; a pending lazy seek stays pending.
    ConnectOnly,
    /// Seek to `offset` and make it the session position.
    Position { offset: u64 },
    /// Seek to `offset` and start streaming `size` bytes; the DATA header is
    /// consumed so the caller continues with chunks.
    PositionAndRead { offset: u64, size: u64 },
}

/// Send `ping` and wait for `pong`. A line that does not answer within the
/// ping timeout is retired at once so nobody picks it up again.
pub(crate) async fn ping_pong(ctx: &Context, line: &Arc<ControlLine>) -> bool {
    let limit = ctx.config.ping_timeout();
    let qid = ctx.next_queue_id();
    let mut queue = ctx.queues.create(qid, line.id);
    let probe = timed(limit, "pong", async {
        line.send(&codec::ping(qid), limit).await?;
        loop {
            match queue.dequeue(Wait::HaveTo(limit)).await? {
                Some(m) if m.reply == Reply::Pong => return Ok(()),
                Some(m) => debug!(reply = ?m.reply, "unexpected reply to ping"),
                None => {}
            }
        }
    })
    .await;
    ctx.queues.delete(qid);
    match probe {
        Ok(()) => true,
        Err(e) => {
            warn!(door = %line.door, error = %e, "control line failed ping");
            line.mark_dead();
            ctx.lines.remove(line.id);
            ctx.poller.remove(line.id);
            false
        }
    }
}

/// Retire the session's control line and dial a new one to the same door set.
pub(crate) async fn replace_control_line(ctx: &Context, node: &mut Node) -> Result<()> {
    if let Some(old) = node.line.take() {
        old.mark_dead();
        ctx.lines.remove(old.id);
        ctx.poller.remove(old.id);
    }
    let line = connect::control_line(ctx, node.target.url.as_ref()).await?;
    info!(door = %line.door, session = node.id.0, "control line replaced");
    node.line = Some(line);
    Ok(())
}

impl Node {
    pub(crate) async fn recover(&mut self, ctx: &Context, resume: Resume) -> Result<()> {
        info!(session = self.id.0, ?resume, "re-establishing data channel");
        if self.write_open {
            self.write_open = false;
            let limit = ctx.config.io_timeout();
            if let (Some(data), Some(queue)) = (self.data.as_mut(), self.queue.as_mut()) {
                if let Err(e) = end_write(data, queue, limit).await {
                    debug!(error = %e, "forced finalize of unsafe write failed");
                }
            }
        }
        if let Some(mut data) = self.data.take() {
            data.shutdown().await;
        }

        let alive = match &self.line {
            Some(line) if line.is_alive() => ping_pong(ctx, line).await,
            _ => false,
        };
        if !alive {
            replace_control_line(ctx, self).await?;
        }

        if let Some(old) = self.queue.take() {
            ctx.queues.delete(old.id());
            if let Some(cb) = ctx.callback.get() {
                cb.forget(old.id());
            }
        }
        let line = self
            .line
            .clone()
            .ok_or_else(|| DcapError::ControlLineDown("no control line".into()))?;
        self.queue = Some(ctx.queues.create(ctx.next_queue_id(), line.id));
        connect::open_conversation(ctx, self).await?;

        self.set_pos(ctx, resume).await?;
        info!(session = self.id.0, pos = self.pos, "data channel recovered");
        Ok(())
    }

    /// Put a freshly opened mover at the right offset.
    pub(crate) async fn set_pos(&mut self, ctx: &Context, resume: Resume) -> Result<()> {
        let limit = ctx.config.io_timeout();
        let (offset, read) = match resume {
            Resume::ConnectOnly => (self.pos, None),
            Resume::Position { offset } => (offset, None),
            Resume::PositionAndRead { offset, size } => (offset, Some(size)),
        };
        let offset_field = i64::try_from(offset)
            .map_err(|_| DcapError::InvalidArgument(format!("offset {offset} too large")))?;
        let (data, queue) = channels!(self);
        let cmd = match read {
            Some(size) => IoCommand::SeekRead {
                offset: offset_field,
                whence: Whence::Set,
                size,
            },
            None => IoCommand::Seek {
                offset: offset_field,
                whence: Whence::Set,
            },
        };
        timed(limit, "data command", data.send(&cmd)).await?;
        let block = confirm(data, queue, limit).await?;
        expect_ack(&block, cmd.opcode())?;
        if cmd.opcode() == Opcode::Seek && block.lseek != offset_field {
            return Err(DcapError::Protocol(format!(
                "mover landed at {} instead of {offset}",
                block.lseek
            )));
        }
        if read.is_some() {
            expect_data(&confirm(data, queue, limit).await?)?;
        }
        self.pos = offset;
        if resume != Resume::ConnectOnly {
            self.seek = None;
        }
        Ok(())
    }
}
