//! Control lines and the event loop that reads them.
//!
//! One task owns the read side of every control line. It decodes each
//! arriving line and routes it to the destination's message queue. Lines that
//! hang up, error out, or announce `shutdown`/`byebye` are retired: removed
//! from the door registry, marked dead, and every queue bound to them is told.

use std::collections::HashMap;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::stream::{self, Stream};
use tokio::sync::mpsc;
use tokio_stream::{StreamExt, StreamMap};
use tracing::{debug, info, trace, warn};

use crate::codec::{self, Reply};
use crate::error::{DcapError, Result};
use crate::mqueue::{LineId, MessageQueues};
use crate::transport::{self, timed, ReadHalf, WriteHalf};

/// Lines longer than this are not a control message anyone sends.
const MAX_LINE: usize = 64 * 1024;

/// Buffered newline splitter over a transport read half.
pub struct LineReader {
    inner: ReadHalf,
    buf: Vec<u8>,
}

impl LineReader {
    pub fn new(inner: ReadHalf) -> Self {
        Self {
            inner,
            buf: Vec::new(),
        }
    }

    /// Next line without its terminator; `None` on EOF.
    pub async fn next_line(&mut self) -> io::Result<Option<Vec<u8>>> {
        loop {
            if let Some(i) = self.buf.iter().position(|&b| b == b'\n') {
                let mut line: Vec<u8> = self.buf.drain(..=i).collect();
                line.pop();
                if line.last() == Some(&b'\r') {
                    line.pop();
                }
                return Ok(Some(line));
            }
            if self.buf.len() > MAX_LINE {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "control line exceeds maximum length",
                ));
            }
            let mut chunk = [0u8; 4096];
            let n = self.inner.read(&mut chunk).await?;
            if n == 0 {
                return Ok(None);
            }
            self.buf.extend_from_slice(&chunk[..n]);
        }
    }
}

/// Write side of a connection to one door, shared by every session using it.
pub struct ControlLine {
    pub id: LineId,
    /// `host:port` registry key.
    pub door: String,
    writer: tokio::sync::Mutex<WriteHalf>,
    alive: AtomicBool,
}

impl ControlLine {
    pub fn new(id: LineId, door: String, writer: WriteHalf) -> Self {
        Self {
            id,
            door,
            writer: tokio::sync::Mutex::new(writer),
            alive: AtomicBool::new(true),
        }
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    pub fn mark_dead(&self) {
        self.alive.store(false, Ordering::Release);
    }

    /// Send one rendered command. A line that cannot take the write within
    /// `limit` is reported dead.
    pub async fn send(&self, text: &str, limit: Duration) -> Result<()> {
        if !self.is_alive() {
            return Err(DcapError::ControlLineDown(self.door.clone()));
        }
        debug!(door = %self.door, line = text.trim_end(), "sending control message");
        let result = timed(limit, "control line write", async {
            let mut w = self.writer.lock().await;
            transport::write_all(&mut w, text.as_bytes()).await?;
            Ok(())
        })
        .await;
        if result.is_err() {
            self.mark_dead();
            return Err(DcapError::ControlLineDown(self.door.clone()));
        }
        Ok(())
    }

    pub async fn close(&self) {
        self.mark_dead();
        let _ = self.writer.lock().await.shutdown().await;
    }
}

/// Door `host:port` -> live control line.
#[derive(Default)]
pub struct ControlLines {
    by_door: Mutex<HashMap<String, Arc<ControlLine>>>,
    next_id: AtomicU64,
}

impl ControlLines {
    pub fn next_id(&self) -> LineId {
        LineId(self.next_id.fetch_add(1, Ordering::Relaxed) + 1)
    }

    pub fn get(&self, door: &str) -> Option<Arc<ControlLine>> {
        self.by_door.lock().ok()?.get(door).cloned()
    }

    /// Register `line` unless a live line to the same door won a race; the
    /// returned line is the one to use.
    pub fn insert_or_existing(&self, line: Arc<ControlLine>) -> Arc<ControlLine> {
        let Ok(mut map) = self.by_door.lock() else {
            return line;
        };
        if let Some(existing) = map.get(&line.door) {
            if existing.is_alive() {
                return existing.clone();
            }
        }
        map.insert(line.door.clone(), line.clone());
        line
    }

    /// Remove the entry for `id`, leaving any newer line to the same door alone.
    pub fn remove(&self, id: LineId) {
        if let Ok(mut map) = self.by_door.lock() {
            map.retain(|_, l| l.id != id);
        }
    }

    pub fn len(&self) -> usize {
        self.by_door.lock().map(|m| m.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

enum LineEvent {
    Line(Vec<u8>),
    Closed(Option<io::Error>),
}

type LineStream = Pin<Box<dyn Stream<Item = LineEvent> + Send>>;

fn line_stream(reader: LineReader) -> LineStream {
    Box::pin(stream::unfold(Some(reader), |state| async move {
        let mut reader = state?;
        match reader.next_line().await {
            Ok(Some(line)) => Some((LineEvent::Line(line), Some(reader))),
            Ok(None) => Some((LineEvent::Closed(None), None)),
            Err(e) => Some((LineEvent::Closed(Some(e)), None)),
        }
    }))
}

enum PollerCommand {
    Add {
        line: Arc<ControlLine>,
        reader: LineReader,
    },
    Remove(LineId),
}

/// Handle to the control-line event loop.
#[derive(Clone)]
pub struct Poller {
    tx: mpsc::UnboundedSender<PollerCommand>,
}

impl Poller {
    /// Start the loop on the current Tokio runtime. It ends when every handle is dropped.
    pub fn spawn(queues: Arc<MessageQueues>, lines: Arc<ControlLines>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(run(rx, queues, lines));
        Self { tx }
    }

    pub fn add(&self, line: Arc<ControlLine>, reader: LineReader) {
        let _ = self.tx.send(PollerCommand::Add { line, reader });
    }

    /// Stop reading `id` and retire it.
    pub fn remove(&self, id: LineId) {
        let _ = self.tx.send(PollerCommand::Remove(id));
    }
}

fn retire(line: &ControlLine, queues: &MessageQueues, lines: &ControlLines) {
    line.mark_dead();
    lines.remove(line.id);
    queues.line_down(line.id);
}

async fn run(
    mut commands: mpsc::UnboundedReceiver<PollerCommand>,
    queues: Arc<MessageQueues>,
    lines: Arc<ControlLines>,
) {
    let mut streams: StreamMap<LineId, LineStream> = StreamMap::new();
    let mut known: HashMap<LineId, Arc<ControlLine>> = HashMap::new();
    loop {
        tokio::select! {
            command = commands.recv() => match command {
                Some(PollerCommand::Add { line, reader }) => {
                    debug!(door = %line.door, id = line.id.0, "control line added to poller");
                    streams.insert(line.id, line_stream(reader));
                    known.insert(line.id, line);
                }
                Some(PollerCommand::Remove(id)) => {
                    streams.remove(&id);
                    if let Some(line) = known.remove(&id) {
                        info!(door = %line.door, "control line removed");
                        retire(&line, &queues, &lines);
                    }
                }
                None => break,
            },
            Some((id, event)) = streams.next(), if !streams.is_empty() => match event {
                LineEvent::Line(bytes) => {
                    trace!(line = %String::from_utf8_lossy(&bytes), "control line in");
                    let Some(msg) = codec::decode_line(&bytes) else {
                        continue;
                    };
                    if matches!(msg.reply, Reply::Shutdown | Reply::ByeBye) {
                        streams.remove(&id);
                        if let Some(line) = known.remove(&id) {
                            warn!(door = %line.door, "door closed the control line");
                            retire(&line, &queues, &lines);
                        }
                        continue;
                    }
                    queues.enqueue(msg);
                }
                LineEvent::Closed(err) => {
                    if let Some(line) = known.remove(&id) {
                        match err {
                            Some(e) => warn!(door = %line.door, error = %e, "control line failed"),
                            None => warn!(door = %line.door, "control line closed by door"),
                        }
                        retire(&line, &queues, &lines);
                    }
                }
            }
        }
    }
    debug!("poller stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mqueue::Wait;
    use tokio::io::AsyncWriteExt;
    use tokio::net::{TcpListener, TcpStream};

    async fn wired_line(lines: &Arc<ControlLines>, poller: &Poller) -> (Arc<ControlLine>, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (client, server) = tokio::join!(TcpStream::connect(addr), listener.accept());
        let (r, w) = transport::open(client.unwrap(), None).await.unwrap();
        let line = Arc::new(ControlLine::new(lines.next_id(), addr.to_string(), w));
        let line = lines.insert_or_existing(line);
        poller.add(line.clone(), LineReader::new(r));
        (line, server.unwrap().0)
    }

    #[tokio::test]
    async fn routes_lines_and_skips_garbage() {
        let queues = Arc::new(MessageQueues::new());
        let lines = Arc::new(ControlLines::default());
        let poller = Poller::spawn(queues.clone(), lines.clone());
        let (line, mut door) = wired_line(&lines, &poller).await;
        let mut q1 = queues.create(1, line.id);
        let mut q2 = queues.create(2, line.id);

        door.write_all(b"2 0 server pong\n\xff\xfe garbage\n9 0 server ok\n1 0 server ok\n")
            .await
            .unwrap();
        let wait = Wait::HaveTo(Duration::from_secs(2));
        assert_eq!(q1.dequeue(wait).await.unwrap().unwrap().reply, Reply::Ok);
        assert_eq!(q2.dequeue(wait).await.unwrap().unwrap().reply, Reply::Pong);
        assert!(line.is_alive());
    }

    #[tokio::test]
    async fn hangup_retires_line_and_fails_waiters() {
        let queues = Arc::new(MessageQueues::new());
        let lines = Arc::new(ControlLines::default());
        let poller = Poller::spawn(queues.clone(), lines.clone());
        let (line, door) = wired_line(&lines, &poller).await;
        let mut q = queues.create(5, line.id);
        assert_eq!(lines.len(), 1);
        drop(door);
        let r = q.dequeue(Wait::HaveTo(Duration::from_secs(2))).await;
        assert!(matches!(r, Err(DcapError::ControlLineDown(_))));
        assert!(!line.is_alive());
        assert!(lines.is_empty());
    }

    #[tokio::test]
    async fn shutdown_message_retires_line() {
        let queues = Arc::new(MessageQueues::new());
        let lines = Arc::new(ControlLines::default());
        let poller = Poller::spawn(queues.clone(), lines.clone());
        let (line, mut door) = wired_line(&lines, &poller).await;
        let mut q = queues.create(3, line.id);
        door.write_all(b"0 0 server shutdown\n").await.unwrap();
        let r = q.dequeue(Wait::HaveTo(Duration::from_secs(2))).await;
        assert!(matches!(r, Err(DcapError::ControlLineDown(_))));
        assert!(lines.get(&line.door).is_none());
        assert!(matches!(
            line.send("3 0 client ping\n", Duration::from_secs(1)).await,
            Err(DcapError::ControlLineDown(_))
        ));
    }

    #[tokio::test]
    async fn newer_line_survives_removal_of_older() {
        let lines = ControlLines::default();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let mut halves = Vec::new();
        for _ in 0..2 {
            let (client, _server) = tokio::join!(TcpStream::connect(addr), listener.accept());
            let (_r, w) = transport::open(client.unwrap(), None).await.unwrap();
            halves.push(w);
        }
        let door = "door.example.org:22125".to_string();
        let old = Arc::new(ControlLine::new(lines.next_id(), door.clone(), halves.remove(0)));
        assert!(Arc::ptr_eq(&lines.insert_or_existing(old.clone()), &old));

        let racing = Arc::new(ControlLine::new(lines.next_id(), door.clone(), halves.remove(0)));
        assert!(Arc::ptr_eq(&lines.insert_or_existing(racing.clone()), &old));

        old.mark_dead();
        let newer = lines.insert_or_existing(racing.clone());
        assert!(Arc::ptr_eq(&newer, &racing));
        lines.remove(old.id);
        assert_eq!(lines.get(&door).map(|l| l.id), Some(racing.id));
    }
}
