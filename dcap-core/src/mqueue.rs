//! Per-session message queues for replies arriving on shared control lines.
//!
//! The table (queue ID -> sender) sits behind one lock held only for map
//! updates; each queue is its own channel, so delivery never contends with
//! table mutation beyond the lookup.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::debug;

use crate::codec::{AsciiMessage, Reply};
use crate::error::{DcapError, Result};

/// Identifies one control line for the lifetime of the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LineId(pub u64);

#[derive(Debug)]
pub(crate) enum Delivery {
    Message(AsciiMessage),
    LineDown(LineId),
}

struct Slot {
    line: LineId,
    tx: mpsc::UnboundedSender<Delivery>,
}

/// How long `dequeue` is prepared to wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Wait {
    /// Block until a message arrives, the line dies, or the deadline passes.
    HaveTo(Duration),
    /// Return at once, possibly with nothing.
    Maybe,
}

#[derive(Default)]
pub struct MessageQueues {
    table: Mutex<HashMap<u32, Slot>>,
}

impl MessageQueues {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register queue `id` for replies arriving on `line`.
    pub fn create(&self, id: u32, line: LineId) -> MessageQueue {
        let (tx, rx) = mpsc::unbounded_channel();
        if let Ok(mut table) = self.table.lock() {
            table.insert(id, Slot { line, tx });
        }
        MessageQueue {
            id,
            line,
            rx,
            held: VecDeque::new(),
        }
    }

    pub fn delete(&self, id: u32) {
        if let Ok(mut table) = self.table.lock() {
            table.remove(&id);
        }
    }

    /// Deliver `msg` to its destination queue. Returns `false` (and drops the
    /// message) when nobody holds that queue.
    pub fn enqueue(&self, msg: AsciiMessage) -> bool {
        let destination = msg.destination;
        let Ok(table) = self.table.lock() else {
            return false;
        };
        match table.get(&destination) {
            Some(slot) if slot.tx.send(Delivery::Message(msg)).is_ok() => true,
            _ => {
                debug!(destination, "no queue for control message, dropped");
                false
            }
        }
    }

    /// Tell every queue bound to `line` that it is gone.
    pub fn line_down(&self, line: LineId) {
        if let Ok(table) = self.table.lock() {
            for slot in table.values().filter(|s| s.line == line) {
                let _ = slot.tx.send(Delivery::LineDown(line));
            }
        }
    }

    pub fn len(&self) -> usize {
        self.table.lock().map(|t| t.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Receiving end owned by one session.
pub struct MessageQueue {
    id: u32,
    line: LineId,
    rx: mpsc::UnboundedReceiver<Delivery>,
    /// Replies set aside while watching for transfer interrupts.
    held: VecDeque<AsciiMessage>,
}

impl MessageQueue {
    pub fn id(&self) -> u32 {
        self.id
    }

    fn line_down(&self) -> DcapError {
        DcapError::ControlLineDown(format!("line {}", self.line.0))
    }

    pub async fn dequeue(&mut self, wait: Wait) -> Result<Option<AsciiMessage>> {
        if let Some(m) = self.held.pop_front() {
            return Ok(Some(m));
        }
        let delivery = match wait {
            Wait::Maybe => match self.rx.try_recv() {
                Ok(d) => d,
                Err(_) => return Ok(None),
            },
            Wait::HaveTo(limit) => match tokio::time::timeout(limit, self.rx.recv()).await {
                Ok(Some(d)) => d,
                Ok(None) => return Err(self.line_down()),
                Err(_) => return Err(DcapError::Timeout("control reply")),
            },
        };
        match delivery {
            Delivery::Message(m) => Ok(Some(m)),
            Delivery::LineDown(_) => Err(self.line_down()),
        }
    }

    /// Wait for a reply that aborts or redirects a transfer. Other replies
    /// are kept for later `dequeue`. Cancel-safe.
    pub async fn interrupt(&mut self) -> Result<Reply> {
        loop {
            match self.rx.recv().await {
                Some(Delivery::Message(m)) if m.reply.interrupts_transfer() => return Ok(m.reply),
                Some(Delivery::Message(m)) => self.held.push_back(m),
                Some(Delivery::LineDown(_)) | None => return Err(self.line_down()),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msg(destination: u32, reply: Reply) -> AsciiMessage {
        AsciiMessage {
            destination,
            priority: 0,
            who: "server".into(),
            reply,
        }
    }

    #[tokio::test]
    async fn routes_by_destination_in_order() {
        let queues = MessageQueues::new();
        let mut a = queues.create(1, LineId(1));
        let mut b = queues.create(2, LineId(1));
        assert!(queues.enqueue(msg(2, Reply::Pong)));
        assert!(queues.enqueue(msg(1, Reply::Ok)));
        assert!(queues.enqueue(msg(1, Reply::Retry)));

        let wait = Wait::HaveTo(Duration::from_millis(100));
        assert_eq!(a.dequeue(wait).await.unwrap().unwrap().reply, Reply::Ok);
        assert_eq!(a.dequeue(wait).await.unwrap().unwrap().reply, Reply::Retry);
        assert!(a.dequeue(Wait::Maybe).await.unwrap().is_none());
        assert_eq!(b.dequeue(wait).await.unwrap().unwrap().reply, Reply::Pong);
        assert!(b.dequeue(Wait::Maybe).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn stale_destination_is_dropped_without_growth() {
        let queues = MessageQueues::new();
        let mut live = queues.create(7, LineId(3));
        let closed = queues.create(8, LineId(3));
        queues.delete(closed.id());
        assert_eq!(queues.len(), 1);
        assert!(!queues.enqueue(msg(8, Reply::Ok)));
        assert_eq!(queues.len(), 1);
        assert!(queues.enqueue(msg(7, Reply::Ok)));
        assert_eq!(live.dequeue(Wait::Maybe).await.unwrap().unwrap().reply, Reply::Ok);
    }

    #[tokio::test]
    async fn line_down_fails_waiters_on_that_line_only() {
        let queues = MessageQueues::new();
        let mut on_dead = queues.create(1, LineId(1));
        let mut other = queues.create(2, LineId(2));
        queues.line_down(LineId(1));
        let wait = Wait::HaveTo(Duration::from_millis(50));
        assert!(matches!(
            on_dead.dequeue(wait).await,
            Err(DcapError::ControlLineDown(_))
        ));
        assert!(matches!(other.dequeue(wait).await, Err(DcapError::Timeout(_))));
    }

    #[tokio::test]
    async fn interrupt_holds_ordinary_replies() {
        let queues = MessageQueues::new();
        let mut q = queues.create(4, LineId(1));
        queues.enqueue(msg(4, Reply::Ok));
        queues.enqueue(msg(4, Reply::Retry));
        assert_eq!(q.interrupt().await.unwrap(), Reply::Retry);
        assert_eq!(q.dequeue(Wait::Maybe).await.unwrap().unwrap().reply, Reply::Ok);
    }
}
