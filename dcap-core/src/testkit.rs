//! In-process door and mover for tests. Speaks the control-line protocol and
//! the binary data-channel protocol, keeps files in memory, and can misbehave
//! on request.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

use crate::codec::{self, Token};
use crate::config::Config;
use crate::poll::LineReader;
use crate::protocol::Opcode;
use crate::transport::{self, ReadHalf, WriteHalf};
use crate::tunnel;

type Shared = Arc<Mutex<State>>;
type Control = Arc<tokio::sync::Mutex<WriteHalf>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Cut {
    /// Drop the data connection.
    Close,
    /// Keep the connection open but send nothing more.
    Stall,
}

#[derive(Debug, Default)]
pub(crate) struct Faults {
    /// Next read sends this many payload bytes, then cuts. One-shot.
    pub cut_read: Option<(usize, Cut)>,
    /// Next write transaction keeps this many payload bytes, then drops the
    /// connection. One-shot.
    pub cut_write: Option<usize>,
    pub ignore_ping: bool,
    /// Answer this many data commands with a garbage confirmation block.
    pub malformed_replies: usize,
    pub reject_open: bool,
}

#[derive(Default)]
pub(crate) struct State {
    pub files: HashMap<String, Vec<u8>>,
    pub dirs: HashMap<String, Vec<String>>,
    /// Data commands seen by movers: opcode, effective offset, size.
    pub ops: Vec<(Opcode, u64, u64)>,
    pub commands: Vec<String>,
    /// Queue id and name of every open/opendir.
    pub opens: Vec<(u32, String)>,
    /// `(session id, challenge)` presented by clients dialing a mover.
    pub greetings: Vec<(i32, String)>,
    pub connections: usize,
    pub faults: Faults,
    writers: Vec<Control>,
}

pub(crate) struct FakeDoor {
    addr: SocketAddr,
    state: Shared,
    task: JoinHandle<()>,
}

impl FakeDoor {
    pub async fn start() -> Self {
        Self::spawn(false).await
    }

    /// Door whose control lines run through the sealed tunnel.
    pub async fn sealed() -> Self {
        Self::spawn(true).await
    }

    async fn spawn(sealed: bool) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let state: Shared = Arc::default();
        let shared = state.clone();
        let task = tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                tokio::spawn(serve_control(stream, sealed, shared.clone()));
            }
        });
        Self { addr, state, task }
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    /// Door line for this door.
    pub fn spec(&self) -> String {
        format!("127.0.0.1:{}", self.port())
    }

    pub fn url(&self, path: &str) -> String {
        format!("dcap://127.0.0.1:{}{path}", self.port())
    }

    /// Client config pointed at this door with short deadlines.
    pub fn config(&self) -> Config {
        Config {
            door: Some(self.spec()),
            reply_host: Some("127.0.0.1".into()),
            connect_timeout_ms: 2_000,
            io_timeout_ms: 2_000,
            ping_timeout_ms: 500,
            reply_timeout_ms: 5_000,
            lock_wait_ms: 20,
            ..Config::default()
        }
    }

    pub fn state(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap()
    }

    pub fn put_file(&self, name: &str, data: Vec<u8>) {
        self.state().files.insert(name.to_string(), data);
    }

    pub fn file(&self, name: &str) -> Option<Vec<u8>> {
        self.state().files.get(name).cloned()
    }

    pub fn put_dir(&self, name: &str, entries: &[&str]) {
        let entries = entries.iter().map(|e| e.to_string()).collect();
        self.state().dirs.insert(name.to_string(), entries);
    }

    pub fn ops(&self) -> Vec<(Opcode, u64, u64)> {
        self.state().ops.clone()
    }

    pub fn clear_ops(&self) {
        self.state().ops.clear();
    }

    pub fn opens(&self) -> Vec<(u32, String)> {
        self.state().opens.clone()
    }

    pub fn connections(&self) -> usize {
        self.state().connections
    }

    pub fn faults(&self, f: impl FnOnce(&mut Faults)) {
        f(&mut self.state().faults);
    }

    /// Write `line` on every control connection the door has accepted.
    pub async fn broadcast(&self, line: &str) {
        let writers = self.state().writers.clone();
        for w in writers {
            say(&w, line).await;
        }
    }
}

impl Drop for FakeDoor {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Byte pattern used for test files.
pub(crate) fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

async fn say(w: &Control, line: &str) {
    let mut w = w.lock().await;
    let _ = transport::write_all(&mut w, line.as_bytes()).await;
}

struct Request {
    qid: u32,
    words: Vec<String>,
    options: HashMap<String, String>,
}

impl Request {
    fn parse(bytes: &[u8]) -> Option<Self> {
        let mut words = Vec::new();
        let mut options = HashMap::new();
        for t in codec::tokenize(bytes)? {
            match t {
                Token::Word(w) => words.push(w),
                Token::Option { key, value } => {
                    options.insert(key, value.unwrap_or_default());
                }
            }
        }
        if words.len() < 4 {
            return None;
        }
        Some(Self {
            qid: words[0].parse().ok()?,
            words,
            options,
        })
    }

    fn verb(&self) -> &str {
        &self.words[3]
    }

    fn word(&self, i: usize) -> &str {
        self.words.get(4 + i).map(String::as_str).unwrap_or("")
    }
}

enum Answer {
    Line(String),
    Silent,
    Mover(MoverJob),
}

struct MoverJob {
    qid: u32,
    name: String,
    listing: Option<Vec<u8>>,
    /// Where to call back; `None` when the client dials us.
    callback: Option<(String, u16)>,
}

async fn serve_control(stream: TcpStream, sealed: bool, state: Shared) {
    let (reader, writer) = if sealed {
        match tunnel::accept_sealed(stream).await {
            Ok((r, w)) => (ReadHalf::Tunneled(r), WriteHalf::Tunneled(w)),
            Err(_) => return,
        }
    } else {
        let (r, w) = stream.into_split();
        (ReadHalf::Plain(r), WriteHalf::Plain(w))
    };
    let writer: Control = Arc::new(tokio::sync::Mutex::new(writer));
    {
        let mut s = state.lock().unwrap();
        s.connections += 1;
        s.writers.push(writer.clone());
    }
    let mut lines = LineReader::new(reader);
    while let Ok(Some(bytes)) = lines.next_line().await {
        state
            .lock()
            .unwrap()
            .commands
            .push(String::from_utf8_lossy(&bytes).into_owned());
        let Some(req) = Request::parse(&bytes) else {
            continue;
        };
        match answer(&req, &state) {
            Answer::Line(line) => say(&writer, &line).await,
            Answer::Silent => {}
            Answer::Mover(job) => {
                tokio::spawn(run_mover(job, state.clone(), writer.clone()));
            }
        }
    }
}

fn stat_line(qid: u32, size: usize, dir: bool) -> String {
    let mode = if dir { "drwxr-xr-x" } else { "-rw-r--r--" };
    format!(
        "{qid} 0 server stat -st_size={size} -st_uid=100 -st_gid=200 -st_mode={mode} -st_nlink=1 -st_mtime=1700000000\n"
    )
}

fn answer(req: &Request, state: &Shared) -> Answer {
    let qid = req.qid;
    let ok = Answer::Line(format!("{qid} 0 server ok\n"));
    let missing = Answer::Line(format!(
        "{qid} 0 server failed 2 \"No such file or directory\" ENOENT\n"
    ));
    let mut s = state.lock().unwrap();
    let name = req.word(0).to_string();
    let exists = s.files.contains_key(&name) || s.dirs.contains_key(&name);
    match req.verb() {
        "hello" => Answer::Line("0 0 server welcome 2 47\n".into()),
        "ping" if s.faults.ignore_ping => Answer::Silent,
        "ping" => Answer::Line(format!("{qid} 2 server pong\n")),
        "stat" | "lstat" | "fstat" => match (s.files.get(&name), s.dirs.contains_key(&name)) {
            (Some(f), _) => Answer::Line(stat_line(qid, f.len(), false)),
            (None, true) => Answer::Line(stat_line(qid, 512, true)),
            (None, false) => missing,
        },
        "unlink" => match s.files.remove(&name) {
            Some(_) => ok,
            None => missing,
        },
        "rmdir" => match s.dirs.remove(&name) {
            Some(_) => ok,
            None => missing,
        },
        "mkdir" => {
            s.dirs.insert(name, Vec::new());
            ok
        }
        "chmod" | "chown" | "stage" if exists => ok,
        "check" if s.files.contains_key(&name) => ok,
        "chmod" | "chown" | "stage" | "check" => missing,
        "rename" => {
            let to = req.word(1).to_string();
            match s.files.remove(&name) {
                Some(data) => {
                    s.files.insert(to, data);
                    ok
                }
                None => missing,
            }
        }
        "open" | "opendir" => {
            if s.faults.reject_open {
                return Answer::Line(format!(
                    "{qid} 0 server failed 13 \"Permission denied\" EACCES\n"
                ));
            }
            let opendir = req.verb() == "opendir";
            let listing = if opendir {
                let Some(entries) = s.dirs.get(&name) else {
                    return missing;
                };
                Some(entries.iter().flat_map(|e| format!("{e}\n").into_bytes()).collect())
            } else {
                let writing = req.word(1).contains('w');
                if !s.files.contains_key(&name) {
                    if !writing {
                        return missing;
                    }
                    s.files.insert(name.clone(), Vec::new());
                } else if writing && req.options.contains_key("truncate") {
                    if let Some(f) = s.files.get_mut(&name) {
                        f.clear();
                    }
                }
                None
            };
            let (host, port) = if opendir {
                (req.word(1), req.word(2))
            } else {
                (req.word(2), req.word(3))
            };
            let callback = (!req.options.contains_key("passive"))
                .then(|| (host.to_string(), port.parse().unwrap_or(0)));
            s.opens.push((qid, name.clone()));
            Answer::Mover(MoverJob {
                qid,
                name,
                listing,
                callback,
            })
        }
        _ => Answer::Line(format!("{qid} 0 server failed 22 \"unsupported\" EINVAL\n")),
    }
}

async fn run_mover(job: MoverJob, state: Shared, control: Control) {
    let stream = match &job.callback {
        Some((host, port)) => {
            let Ok(mut s) = TcpStream::connect((host.as_str(), *port)).await else {
                return;
            };
            let challenge = format!("pool-{}", job.qid);
            let mut greeting = Vec::new();
            greeting.extend_from_slice(&(job.qid as i32).to_be_bytes());
            greeting.extend_from_slice(&(challenge.len() as i32).to_be_bytes());
            greeting.extend_from_slice(challenge.as_bytes());
            if s.write_all(&greeting).await.is_err() {
                return;
            }
            s
        }
        None => {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            let port = listener.local_addr().unwrap().port();
            let line = format!("{} 0 server connect 127.0.0.1 {port} chal-{}\n", job.qid, job.qid);
            say(&control, &line).await;
            let Ok((mut s, _)) = listener.accept().await else {
                return;
            };
            let Ok(id) = s.read_i32().await else { return };
            let Ok(len) = s.read_i32().await else { return };
            let mut challenge = vec![0u8; len.max(0) as usize];
            if s.read_exact(&mut challenge).await.is_err() {
                return;
            }
            state
                .lock()
                .unwrap()
                .greetings
                .push((id, String::from_utf8_lossy(&challenge).into_owned()));
            s
        }
    };
    let (r, w) = stream.into_split();
    serve_data(r, w, job, state, control).await;
}

fn be_i32(b: &[u8]) -> i32 {
    i32::from_be_bytes(b[..4].try_into().unwrap())
}

fn be_i64(b: &[u8]) -> i64 {
    i64::from_be_bytes(b[..8].try_into().unwrap())
}

fn block(words: &[i32], tail: &[u8]) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(&((words.len() * 4 + tail.len()) as i32).to_be_bytes());
    for w in words {
        out.extend_from_slice(&w.to_be_bytes());
    }
    out.extend_from_slice(tail);
    out
}

fn ack(op: i32) -> Vec<u8> {
    block(&[Opcode::Ack as i32, op, 0], &[])
}

fn fin(op: i32) -> Vec<u8> {
    block(&[Opcode::Fin as i32, op, 0], &[])
}

fn data_marker() -> Vec<u8> {
    block(&[Opcode::Data as i32], &[])
}

fn refusal(op: i32, rc: i32, message: &str) -> Vec<u8> {
    let mut tail = (message.len() as u16).to_be_bytes().to_vec();
    tail.extend_from_slice(message.as_bytes());
    block(&[Opcode::Ack as i32, op, rc], &tail)
}

/// Offset a SEEK-style body (`offset i64, whence i32` after the opcode) lands on.
fn seek_target(body: &[u8], pos: u64, len: u64) -> u64 {
    let offset = be_i64(&body[4..]);
    let base = match be_i32(&body[12..]) {
        0 => 0,
        1 => pos as i64,
        _ => len as i64,
    };
    (base + offset).max(0) as u64
}

fn content(state: &Shared, job: &MoverJob, offset: u64, size: u64) -> Vec<u8> {
    let s = state.lock().unwrap();
    let data = match &job.listing {
        Some(l) => l.as_slice(),
        None => s.files.get(&job.name).map(Vec::as_slice).unwrap_or(&[]),
    };
    let start = (offset as usize).min(data.len());
    let end = start.saturating_add(size as usize).min(data.len());
    data[start..end].to_vec()
}

fn file_len(state: &Shared, job: &MoverJob) -> u64 {
    let s = state.lock().unwrap();
    match &job.listing {
        Some(l) => l.len() as u64,
        None => s.files.get(&job.name).map_or(0, |f| f.len() as u64),
    }
}

async fn send_chunks(w: &mut OwnedWriteHalf, bytes: &[u8]) -> std::io::Result<()> {
    for chunk in bytes.chunks(1024) {
        w.write_all(&(chunk.len() as i32).to_be_bytes()).await?;
        w.write_all(chunk).await?;
    }
    w.write_all(&(-1i32).to_be_bytes()).await
}

async fn serve_data(
    mut r: OwnedReadHalf,
    mut w: OwnedWriteHalf,
    job: MoverJob,
    state: Shared,
    control: Control,
) {
    let mut pos: u64 = 0;
    loop {
        let Ok(len) = r.read_i32().await else { return };
        if len < 4 {
            return;
        }
        let mut body = vec![0u8; len as usize];
        if r.read_exact(&mut body).await.is_err() {
            return;
        }
        let op = be_i32(&body);
        let malformed = {
            let mut s = state.lock().unwrap();
            let hit = s.faults.malformed_replies > 0;
            if hit {
                s.faults.malformed_replies -= 1;
            }
            hit
        };
        if malformed {
            let _ = w.write_all(&block(&[99, op, 0], &[])).await;
            return;
        }
        let record = |code: Opcode, offset: u64, size: u64| {
            state.lock().unwrap().ops.push((code, offset, size));
        };
        let result: std::io::Result<()> = async {
            match Opcode::from_i32(op) {
                Some(code @ (Opcode::Write | Opcode::SeekWrite)) => {
                    if code == Opcode::SeekWrite {
                        pos = seek_target(&body, pos, file_len(&state, &job));
                    }
                    record(code, pos, 0);
                    w.write_all(&ack(op)).await?;
                    let _header_len = r.read_i32().await?;
                    let _data = r.read_i32().await?;
                    let mut cut = state.lock().unwrap().faults.cut_write.take();
                    loop {
                        let n = r.read_i32().await?;
                        if n < 0 {
                            break;
                        }
                        let keep = cut.map_or(n as usize, |left| left.min(n as usize));
                        let mut chunk = vec![0u8; keep];
                        r.read_exact(&mut chunk).await?;
                        if let Some(left) = cut.as_mut() {
                            *left -= keep;
                        }
                        let mut s = state.lock().unwrap();
                        let f = s.files.entry(job.name.clone()).or_default();
                        let end = pos as usize + chunk.len();
                        if f.len() < end {
                            f.resize(end, 0);
                        }
                        f[pos as usize..end].copy_from_slice(&chunk);
                        pos = end as u64;
                        drop(s);
                        if keep < n as usize {
                            return Err(std::io::ErrorKind::ConnectionAborted.into());
                        }
                    }
                    w.write_all(&fin(op)).await?;
                }
                Some(code @ (Opcode::Read | Opcode::SeekRead)) => {
                    let size = if code == Opcode::Read {
                        be_i64(&body[4..])
                    } else {
                        pos = seek_target(&body, pos, file_len(&state, &job));
                        be_i64(&body[16..])
                    };
                    let size = size.max(0) as u64;
                    record(code, pos, size);
                    let bytes = content(&state, &job, pos, size);
                    w.write_all(&ack(op)).await?;
                    w.write_all(&data_marker()).await?;
                    let cut = state.lock().unwrap().faults.cut_read.take();
                    if let Some((after, mode)) = cut {
                        w.write_all(&(bytes.len() as i32).to_be_bytes()).await?;
                        w.write_all(&bytes[..after.min(bytes.len())]).await?;
                        w.flush().await?;
                        if mode == Cut::Stall {
                            std::future::pending::<()>().await;
                        }
                        return Err(std::io::ErrorKind::ConnectionAborted.into());
                    }
                    send_chunks(&mut w, &bytes).await?;
                    pos += bytes.len() as u64;
                    w.write_all(&fin(op)).await?;
                }
                Some(Opcode::Seek) => {
                    pos = seek_target(&body, pos, file_len(&state, &job));
                    record(Opcode::Seek, pos, 0);
                    let tail = (pos as i64).to_be_bytes();
                    w.write_all(&block(&[Opcode::Ack as i32, op, 0], &tail)).await?;
                }
                Some(Opcode::Locate) => {
                    record(Opcode::Locate, pos, 0);
                    let mut tail = (file_len(&state, &job) as i64).to_be_bytes().to_vec();
                    tail.extend_from_slice(&(pos as i64).to_be_bytes());
                    w.write_all(&block(&[Opcode::Ack as i32, op, 0], &tail)).await?;
                }
                Some(Opcode::ReadV) => {
                    let count = be_i32(&body[4..]) as usize;
                    let mut out = Vec::new();
                    for i in 0..count {
                        let at = 8 + i * 12;
                        let offset = be_i64(&body[at..]) as u64;
                        let size = be_i32(&body[at + 8..]) as u64;
                        record(Opcode::ReadV, offset, size);
                        out.extend(content(&state, &job, offset, size));
                    }
                    w.write_all(&ack(op)).await?;
                    w.write_all(&data_marker()).await?;
                    send_chunks(&mut w, &out).await?;
                    w.write_all(&fin(op)).await?;
                }
                Some(Opcode::Close) => {
                    record(Opcode::Close, pos, 0);
                    w.write_all(&ack(op)).await?;
                    say(&control, &format!("{} 0 server ok\n", job.qid)).await;
                    return Err(std::io::ErrorKind::ConnectionAborted.into());
                }
                _ => w.write_all(&refusal(op, 666, "unsupported")).await?,
            }
            Ok(())
        }
        .await;
        if result.is_err() {
            return;
        }
    }
}
