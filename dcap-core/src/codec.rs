//! Control-line codec: tokenizer, verb dispatch for door replies, command rendering.
//!
//! A line reads `<destination> <priority> <who> <verb> [args...]`. Tokens are
//! whitespace separated; a double-quoted token may contain whitespace; a token
//! starting with `-` is an option (`-key` or `-key=value`).

use std::fmt::Display;

use tracing::{debug, warn};

use crate::error::errno_from_name;

/// Legacy token buffer size. Longer tokens are cut to this length rather than rejected.
pub const MAX_TOKEN_LEN: usize = 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Token {
    Word(String),
    Option { key: String, value: Option<String> },
}

/// Arguments following the verb.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Args {
    pub words: Vec<String>,
    pub options: Vec<(String, Option<String>)>,
}

impl Args {
    pub fn word(&self, i: usize) -> Option<&str> {
        self.words.get(i).map(String::as_str)
    }

    pub fn option(&self, key: &str) -> Option<&str> {
        self.options
            .iter()
            .find(|(k, _)| k == key)
            .and_then(|(_, v)| v.as_deref())
    }
}

fn is_separator(b: u8) -> bool {
    matches!(b, b' ' | b'\t' | b'\r' | b'\n')
}

/// Collect one value starting at `*i`: quoted up to the closing quote (or end
/// of line), bare up to the next separator. Characters past `MAX_TOKEN_LEN` are dropped.
fn take_value(line: &[u8], i: &mut usize, stop_at_eq: bool) -> String {
    fn push(out: &mut String, b: u8) {
        if out.len() < MAX_TOKEN_LEN {
            out.push(b as char);
        }
    }
    let mut out = String::new();
    if *i < line.len() && line[*i] == b'"' {
        *i += 1;
        while *i < line.len() && line[*i] != b'"' {
            push(&mut out, line[*i]);
            *i += 1;
        }
        if *i < line.len() {
            *i += 1;
        }
        return out;
    }
    while *i < line.len() && !is_separator(line[*i]) && !(stop_at_eq && line[*i] == b'=') {
        push(&mut out, line[*i]);
        *i += 1;
    }
    out
}

/// Split a line into tokens. `None` if the line carries non-ASCII bytes.
pub fn tokenize(line: &[u8]) -> Option<Vec<Token>> {
    if !line.is_ascii() {
        return None;
    }
    let mut tokens = Vec::new();
    let mut i = 0;
    loop {
        while i < line.len() && is_separator(line[i]) {
            i += 1;
        }
        if i >= line.len() {
            break;
        }
        let option_start =
            line[i] == b'-' && i + 1 < line.len() && !is_separator(line[i + 1]);
        if option_start {
            i += 1;
            let key = take_value(line, &mut i, true);
            let value = if i < line.len() && line[i] == b'=' {
                i += 1;
                Some(take_value(line, &mut i, false))
            } else {
                None
            };
            tokens.push(Token::Option { key, value });
        } else {
            tokens.push(Token::Word(take_value(line, &mut i, false)));
        }
    }
    Some(tokens)
}

/// Unix mode and timestamps reported by a `stat` reply.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StatInfo {
    pub size: u64,
    pub uid: u32,
    pub gid: u32,
    pub atime: i64,
    pub mtime: i64,
    pub ctime: i64,
    pub mode: u32,
    pub ino: u64,
    pub nlink: u32,
}

pub const S_IFMT: u32 = 0o170000;
pub const S_IFDIR: u32 = 0o040000;
pub const S_IFREG: u32 = 0o100000;
pub const S_IFLNK: u32 = 0o120000;

impl StatInfo {
    pub fn is_dir(&self) -> bool {
        self.mode & S_IFMT == S_IFDIR
    }

    pub fn is_file(&self) -> bool {
        self.mode & S_IFMT == S_IFREG
    }
}

/// Parse `-rwxr-xr-x` style modes; plain octal numbers are accepted too.
fn parse_mode(s: &str) -> Option<u32> {
    let b = s.as_bytes();
    if b.len() != 10 {
        return u32::from_str_radix(s, 8).ok();
    }
    let mut mode = match b[0] {
        b'd' => S_IFDIR,
        b'l' => S_IFLNK,
        b'-' => S_IFREG,
        _ => 0,
    };
    const BITS: [u32; 9] = [
        0o400, 0o200, 0o100, 0o040, 0o020, 0o010, 0o004, 0o002, 0o001,
    ];
    for (c, bit) in b[1..].iter().zip(BITS) {
        match c {
            b'r' | b'w' | b'x' => mode |= bit,
            b's' | b't' => mode |= bit | special_bit(bit),
            b'S' | b'T' => mode |= special_bit(bit),
            b'-' => {}
            _ => return None,
        }
    }
    Some(mode)
}

fn special_bit(exec_bit: u32) -> u32 {
    match exec_bit {
        0o100 => 0o4000,
        0o010 => 0o2000,
        _ => 0o1000,
    }
}

/// Typed door reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Welcome { major: u32, minor: u32 },
    Rejected(String),
    ByeBye,
    Ok,
    Failed { code: i32, message: String, errno: i32 },
    Retry,
    Pong,
    Stat(StatInfo),
    Shutdown,
    Connect { host: String, port: u16, challenge: String },
}

impl Reply {
    /// Replies that abort or redirect an in-flight data transfer.
    pub fn interrupts_transfer(&self) -> bool {
        matches!(
            self,
            Reply::Retry | Reply::Failed { .. } | Reply::Shutdown | Reply::ByeBye
        )
    }
}

/// One decoded control-line message, routed by `destination` (the queue ID).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AsciiMessage {
    pub destination: u32,
    pub priority: i32,
    pub who: String,
    pub reply: Reply,
}

type ReplyParser = fn(&Args) -> Option<Reply>;

const DISPATCH: &[(&str, ReplyParser)] = &[
    ("welcome", welcome),
    ("rejected", rejected),
    ("byebye", byebye),
    ("ok", ok),
    ("failed", failed),
    ("retry", retry),
    ("pong", pong),
    ("stat", stat),
    ("shutdown", shutdown),
    ("connect", connect),
];

fn byebye(_: &Args) -> Option<Reply> {
    Some(Reply::ByeBye)
}

fn ok(_: &Args) -> Option<Reply> {
    Some(Reply::Ok)
}

fn retry(_: &Args) -> Option<Reply> {
    Some(Reply::Retry)
}

fn pong(_: &Args) -> Option<Reply> {
    Some(Reply::Pong)
}

fn shutdown(_: &Args) -> Option<Reply> {
    Some(Reply::Shutdown)
}

fn welcome(args: &Args) -> Option<Reply> {
    Some(Reply::Welcome {
        major: args.word(0)?.parse().ok()?,
        minor: args.word(1)?.parse().ok()?,
    })
}

fn rejected(args: &Args) -> Option<Reply> {
    Some(Reply::Rejected(args.words.join(" ")))
}

fn failed(args: &Args) -> Option<Reply> {
    let code = args.word(0).and_then(|c| c.parse().ok()).unwrap_or(-1);
    let message = args.word(1).unwrap_or("").to_string();
    let errno = args.word(2).map(errno_from_name).unwrap_or(libc::EIO);
    Some(Reply::Failed {
        code,
        message,
        errno,
    })
}

fn stat(args: &Args) -> Option<Reply> {
    fn num<T: std::str::FromStr>(args: &Args, key: &str) -> Option<T> {
        args.option(key).and_then(|v| v.parse().ok())
    }
    Some(Reply::Stat(StatInfo {
        size: num(args, "st_size").unwrap_or(0),
        uid: num(args, "st_uid").unwrap_or(0),
        gid: num(args, "st_gid").unwrap_or(0),
        atime: num(args, "st_atime").unwrap_or(0),
        mtime: num(args, "st_mtime").unwrap_or(0),
        ctime: num(args, "st_ctime").unwrap_or(0),
        mode: args.option("st_mode").and_then(parse_mode).unwrap_or(S_IFREG | 0o644),
        ino: num(args, "st_ino").unwrap_or(0),
        nlink: num(args, "st_nlink").unwrap_or(1),
    }))
}

fn connect(args: &Args) -> Option<Reply> {
    Some(Reply::Connect {
        host: args.word(0)?.to_string(),
        port: args.word(1)?.parse().ok()?,
        challenge: args.word(2).unwrap_or("").to_string(),
    })
}

/// Decode one control line. Malformed lines and unknown verbs are logged and yield `None`.
pub fn decode_line(line: &[u8]) -> Option<AsciiMessage> {
    let Some(tokens) = tokenize(line) else {
        warn!("dropping control line with non-ASCII bytes");
        return None;
    };
    let mut head = Vec::with_capacity(4);
    let mut args = Args::default();
    for token in tokens {
        match token {
            Token::Word(w) if head.len() < 4 => head.push(w),
            Token::Word(w) => args.words.push(w),
            Token::Option { key, value } => args.options.push((key, value)),
        }
    }
    if head.len() < 4 {
        debug!(line = %String::from_utf8_lossy(line), "short control line");
        return None;
    }
    let destination: u32 = head[0].parse().ok()?;
    let priority = head[1].parse().unwrap_or(0);
    let verb = head[3].as_str();
    let Some((_, parse)) = DISPATCH.iter().find(|(v, _)| *v == verb) else {
        warn!(verb, destination, "unknown control verb, message dropped");
        return None;
    };
    match parse(&args) {
        Some(reply) => Some(AsciiMessage {
            destination,
            priority,
            who: head[2].clone(),
            reply,
        }),
        None => {
            warn!(verb, destination, "malformed control reply, message dropped");
            None
        }
    }
}

/// Names with a newline or double quote cannot be framed on the control line.
pub fn name_invalid(name: &str) -> bool {
    name.contains('\n') || name.contains('"')
}

/// Client-to-door command line builder.
#[derive(Debug, Clone)]
pub struct Command {
    queue_id: u32,
    command_id: u32,
    verb: &'static str,
    args: Vec<String>,
}

impl Command {
    pub fn new(queue_id: u32, verb: &'static str) -> Self {
        Self {
            queue_id,
            command_id: 0,
            verb,
            args: Vec::new(),
        }
    }

    pub fn command_id(mut self, id: u32) -> Self {
        self.command_id = id;
        self
    }

    pub fn arg(mut self, a: impl Into<String>) -> Self {
        self.args.push(a.into());
        self
    }

    pub fn quoted(mut self, a: &str) -> Self {
        self.args.push(format!("\"{a}\""));
        self
    }

    pub fn option(mut self, key: &str, value: impl Display) -> Self {
        self.args.push(format!("-{key}={value}"));
        self
    }

    pub fn flag(mut self, key: &str) -> Self {
        self.args.push(format!("-{key}"));
        self
    }

    /// Newline-terminated wire form.
    pub fn render(&self) -> String {
        let mut line = format!("{} {} client {}", self.queue_id, self.command_id, self.verb);
        for a in &self.args {
            line.push(' ');
            line.push_str(a);
        }
        line.push('\n');
        line
    }
}

pub fn hello(major: u32, minor: u32, uid: u32, pid: u32, gid: u32) -> String {
    Command::new(0, "hello")
        .arg("0")
        .arg("0")
        .arg(major.to_string())
        .arg(minor.to_string())
        .option("uid", uid)
        .option("pid", pid)
        .option("gid", gid)
        .render()
}

pub fn ping(queue_id: u32) -> String {
    Command::new(queue_id, "ping").command_id(2).render()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tokenizer_handles_quotes_and_options() {
        let t = tokenize(br#"7 0 server failed 2 "No such file or directory" ENOENT -x=1 -flag"#)
            .unwrap();
        assert_eq!(t[5], Token::Word("No such file or directory".into()));
        assert_eq!(
            t[7],
            Token::Option {
                key: "x".into(),
                value: Some("1".into())
            }
        );
        assert_eq!(
            t[8],
            Token::Option {
                key: "flag".into(),
                value: None
            }
        );
    }

    #[test]
    fn tokenizer_rejects_non_ascii() {
        assert!(tokenize("1 0 server ok \u{e9}".as_bytes()).is_none());
    }

    #[test]
    fn overlong_token_is_truncated() {
        let mut line = b"1 0 server rejected ".to_vec();
        line.extend(std::iter::repeat(b'a').take(MAX_TOKEN_LEN + 100));
        line.extend_from_slice(b" tail");
        let msg = decode_line(&line).unwrap();
        match msg.reply {
            Reply::Rejected(reason) => {
                let (first, rest) = reason.split_once(' ').unwrap();
                assert_eq!(first.len(), MAX_TOKEN_LEN);
                assert_eq!(rest, "tail");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn unterminated_quote_closes_at_end_of_line() {
        let t = tokenize(br#"1 0 server failed 5 "broken"#).unwrap();
        assert_eq!(t.last(), Some(&Token::Word("broken".into())));
    }

    #[test]
    fn decodes_failed_with_errno() {
        let m = decode_line(br#"12 0 server failed 2 "not found" ENOENT"#).unwrap();
        assert_eq!(m.destination, 12);
        assert_eq!(
            m.reply,
            Reply::Failed {
                code: 2,
                message: "not found".into(),
                errno: libc::ENOENT
            }
        );
        assert!(m.reply.interrupts_transfer());
    }

    #[test]
    fn decodes_stat_reply() {
        let m = decode_line(
            b"3 0 server stat -st_size=4096 -st_uid=10 -st_gid=20 -st_atime=1 -st_mtime=2 \
              -st_ctime=3 -st_mode=drwxr-xr-x -st_ino=99",
        )
        .unwrap();
        let Reply::Stat(st) = m.reply else {
            panic!("expected stat")
        };
        assert_eq!(st.size, 4096);
        assert_eq!((st.uid, st.gid, st.ino), (10, 20, 99));
        assert!(st.is_dir());
        assert_eq!(st.mode & 0o777, 0o755);
    }

    #[test]
    fn stat_reply_fields_are_optional() {
        let m = decode_line(b"3 0 server stat -st_uid=10 -st_gid=20 -st_mode=drwxr-xr-x -st_ino=99")
            .unwrap();
        let Reply::Stat(st) = m.reply else {
            panic!("expected stat")
        };
        assert_eq!(st.size, 0);
        assert_eq!((st.uid, st.gid, st.ino), (10, 20, 99));
        assert!(st.is_dir());

        let m = decode_line(b"4 0 server stat").unwrap();
        let Reply::Stat(st) = m.reply else {
            panic!("expected stat")
        };
        assert_eq!((st.size, st.nlink), (0, 1));
        assert!(!st.is_dir());
    }

    #[test]
    fn decodes_connect_and_welcome() {
        let m = decode_line(b"5 0 server connect pool.example.org 33115 Y2hhbGxlbmdl").unwrap();
        assert_eq!(
            m.reply,
            Reply::Connect {
                host: "pool.example.org".into(),
                port: 33115,
                challenge: "Y2hhbGxlbmdl".into()
            }
        );
        let w = decode_line(b"0 0 server welcome 2 47").unwrap();
        assert_eq!(w.reply, Reply::Welcome { major: 2, minor: 47 });
    }

    #[test]
    fn unknown_verb_and_short_lines_are_dropped() {
        assert!(decode_line(b"1 0 server frobnicate").is_none());
        assert!(decode_line(b"1 0 server").is_none());
        assert!(decode_line(b"x 0 server ok").is_none());
        assert!(decode_line(b"1 0 server welcome two").is_none());
    }

    #[test]
    fn setuid_mode_bits() {
        assert_eq!(parse_mode("-rwsr-x--T"), Some(S_IFREG | 0o4000 | 0o1000 | 0o750));
        assert_eq!(parse_mode("644"), Some(0o644));
        assert_eq!(parse_mode("-rwxq-----"), None);
    }

    #[test]
    fn renders_commands() {
        assert_eq!(
            hello(2, 47, 1000, 42, 100),
            "0 0 client hello 0 0 2 47 -uid=1000 -pid=42 -gid=100\n"
        );
        assert_eq!(ping(9), "9 2 client ping\n");
        let open = Command::new(4, "open")
            .quoted("dcap://door/pnfs/f")
            .arg("r")
            .flag("passive")
            .render();
        assert_eq!(open, "4 0 client open \"dcap://door/pnfs/f\" r -passive\n");
    }

    #[test]
    fn invalid_names() {
        assert!(name_invalid("a\"b"));
        assert!(name_invalid("a\nb"));
        assert!(!name_invalid("/pnfs/some file"));
    }
}
