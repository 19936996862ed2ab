//! Data-channel wire protocol: opcodes, command framing, confirmation blocks.
//!
//! Every command is big-endian `{length, opcode, fields...}` where `length`
//! counts the bytes after itself. Replies use the same layout. Payload travels
//! as `[i32 len][bytes]` chunks closed by a length of -1.

use bincode::Options;
use serde::{Deserialize, Serialize};
use tokio::net::TcpStream;
use tracing::trace;

use crate::error::{DcapError, Result};
use crate::transport::{self, ReadHalf, WriteHalf};

/// Client protocol version announced in `hello`.
pub const PROTOCOL_VERSION: (u32, u32) = (2, 47);

/// Checksum sub-block type carried by CLOSE.
pub const DCAP_DATA_SUM: i32 = 1;

/// Error code a mover answers with for commands it does not understand.
pub const INVALID_COMMAND: i32 = 666;

/// Upper bound on a confirmation block body.
const MAX_REPLY_LEN: usize = 64 * 1024;

/// Upper bound on one outgoing data chunk.
pub const MAX_CHUNK: usize = 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum Opcode {
    Write = 1,
    Read = 2,
    Seek = 3,
    Close = 4,
    Interrupt = 5,
    Ack = 6,
    Fin = 7,
    Data = 8,
    Locate = 9,
    SeekRead = 11,
    SeekWrite = 12,
    ReadV = 13,
}

impl Opcode {
    pub fn from_i32(v: i32) -> Option<Self> {
        Some(match v {
            1 => Opcode::Write,
            2 => Opcode::Read,
            3 => Opcode::Seek,
            4 => Opcode::Close,
            5 => Opcode::Interrupt,
            6 => Opcode::Ack,
            7 => Opcode::Fin,
            8 => Opcode::Data,
            9 => Opcode::Locate,
            11 => Opcode::SeekRead,
            12 => Opcode::SeekWrite,
            13 => Opcode::ReadV,
            _ => return None,
        })
    }

    pub fn name(self) -> &'static str {
        match self {
            Opcode::Write => "WRITE",
            Opcode::Read => "READ",
            Opcode::Seek => "SEEK",
            Opcode::Close => "CLOSE",
            Opcode::Interrupt => "INTERRUPT",
            Opcode::Ack => "ACK",
            Opcode::Fin => "FIN",
            Opcode::Data => "DATA",
            Opcode::Locate => "LOCATE",
            Opcode::SeekRead => "SEEK_READ",
            Opcode::SeekWrite => "SEEK_WRITE",
            Opcode::ReadV => "READV",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum Whence {
    Set = 0,
    Current = 1,
    End = 2,
}

/// Checksum attached to CLOSE: algorithm id and raw digest bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Checksum {
    pub kind: i32,
    pub value: Vec<u8>,
}

/// One data-channel command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IoCommand {
    /// Start a write transaction; data chunks follow after the ACK.
    Write,
    Read { size: u64 },
    Seek { offset: i64, whence: Whence },
    /// Seek merged into a read: one round trip instead of two.
    SeekRead { offset: i64, whence: Whence, size: u64 },
    SeekWrite { offset: i64, whence: Whence },
    /// Vectored read of `(offset, len)` blocks; file position is untouched.
    ReadV { blocks: Vec<(u64, u32)> },
    Close { checksum: Option<Checksum> },
    Locate,
}

// Fixed-layout pieces, serialized big-endian with fixed-width integers.
#[derive(Serialize, Deserialize)]
struct Head {
    len: i32,
    opcode: i32,
}

#[derive(Serialize)]
struct SeekFields {
    offset: i64,
    whence: i32,
}

#[derive(Serialize)]
struct ReadvBlock {
    offset: i64,
    len: i32,
}

#[derive(Serialize)]
struct SumHead {
    len: i32,
    kind: i32,
    sum_type: i32,
}

#[derive(Deserialize)]
struct ReplyHead {
    code: i32,
    in_response: i32,
    result: i32,
}

fn wire() -> impl Options {
    bincode::DefaultOptions::new()
        .with_big_endian()
        .with_fixint_encoding()
        .allow_trailing_bytes()
}

fn put<T: Serialize>(out: &mut Vec<u8>, v: &T) -> Result<()> {
    wire()
        .serialize_into(out, v)
        .map_err(|e| DcapError::Protocol(format!("encode: {e}")))
}

fn size_field(v: u64) -> Result<i64> {
    i64::try_from(v).map_err(|_| DcapError::InvalidArgument(format!("size {v} too large")))
}

impl IoCommand {
    pub fn opcode(&self) -> Opcode {
        match self {
            IoCommand::Write => Opcode::Write,
            IoCommand::Read { .. } => Opcode::Read,
            IoCommand::Seek { .. } => Opcode::Seek,
            IoCommand::SeekRead { .. } => Opcode::SeekRead,
            IoCommand::SeekWrite { .. } => Opcode::SeekWrite,
            IoCommand::ReadV { .. } => Opcode::ReadV,
            IoCommand::Close { .. } => Opcode::Close,
            IoCommand::Locate => Opcode::Locate,
        }
    }

    /// Wire bytes including the leading length field.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut body = Vec::with_capacity(32);
        put(&mut body, &(self.opcode() as i32))?;
        match self {
            IoCommand::Write | IoCommand::Locate => {}
            IoCommand::Read { size } => put(&mut body, &size_field(*size)?)?,
            IoCommand::Seek { offset, whence } | IoCommand::SeekWrite { offset, whence } => {
                put(
                    &mut body,
                    &SeekFields {
                        offset: *offset,
                        whence: *whence as i32,
                    },
                )?;
            }
            IoCommand::SeekRead {
                offset,
                whence,
                size,
            } => {
                put(
                    &mut body,
                    &SeekFields {
                        offset: *offset,
                        whence: *whence as i32,
                    },
                )?;
                put(&mut body, &size_field(*size)?)?;
            }
            IoCommand::ReadV { blocks } => {
                put(&mut body, &(blocks.len() as i32))?;
                for (offset, len) in blocks {
                    let len = i32::try_from(*len).map_err(|_| {
                        DcapError::InvalidArgument(format!("readv block of {len} bytes"))
                    })?;
                    put(
                        &mut body,
                        &ReadvBlock {
                            offset: size_field(*offset)?,
                            len,
                        },
                    )?;
                }
            }
            IoCommand::Close { checksum } => {
                if let Some(sum) = checksum {
                    put(
                        &mut body,
                        &SumHead {
                            len: 8 + sum.value.len() as i32,
                            kind: DCAP_DATA_SUM,
                            sum_type: sum.kind,
                        },
                    )?;
                    body.extend_from_slice(&sum.value);
                }
            }
        }
        let mut out = Vec::with_capacity(4 + body.len());
        put(&mut out, &(body.len() as i32))?;
        out.extend_from_slice(&body);
        Ok(out)
    }
}

/// Reply header read after every command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConfirmationBlock {
    pub code: i32,
    pub in_response: i32,
    pub result: i32,
    pub lseek: i64,
    pub fsize: i64,
    pub message: Option<String>,
}

fn be_i64(b: &[u8]) -> Option<i64> {
    wire().deserialize::<i64>(b).ok()
}

/// Decode a reply body (everything after the length field).
pub fn decode_reply(body: &[u8]) -> Result<ConfirmationBlock> {
    if body.len() < 4 {
        return Err(DcapError::Protocol(format!(
            "reply of {} bytes carries no code",
            body.len()
        )));
    }
    let code = wire()
        .deserialize::<i32>(body)
        .map_err(|e| DcapError::Protocol(format!("reply code: {e}")))?;
    if code == Opcode::Data as i32 {
        return Ok(ConfirmationBlock {
            code,
            ..Default::default()
        });
    }
    let head: ReplyHead = wire()
        .deserialize(body)
        .map_err(|_| DcapError::Protocol(format!("reply of {} bytes is truncated", body.len())))?;
    let mut block = ConfirmationBlock {
        code: head.code,
        in_response: head.in_response,
        result: head.result,
        ..Default::default()
    };
    let rest = &body[12..];
    if block.result == 0 {
        if block.in_response == Opcode::Seek as i32 {
            block.lseek = be_i64(rest).unwrap_or(0);
        } else if block.in_response == Opcode::Locate as i32 {
            block.fsize = be_i64(rest).unwrap_or(0);
            block.lseek = rest.get(8..).and_then(be_i64).unwrap_or(0);
        }
    } else if rest.len() > 2 {
        let len = u16::from_be_bytes([rest[0], rest[1]]) as usize;
        let text = &rest[2..rest.len().min(2 + len)];
        block.message = Some(String::from_utf8_lossy(text).into_owned());
    }
    Ok(block)
}

/// Exclusive per-session connection to a mover.
pub struct DataChannel {
    reader: ReadHalf,
    writer: WriteHalf,
    peer: String,
}

impl DataChannel {
    pub fn new(stream: TcpStream) -> Self {
        let peer = stream
            .peer_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| "unknown".into());
        let (r, w) = stream.into_split();
        Self {
            reader: ReadHalf::Plain(r),
            writer: WriteHalf::Plain(w),
            peer,
        }
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub async fn send(&mut self, cmd: &IoCommand) -> Result<()> {
        trace!(peer = %self.peer, op = cmd.opcode().name(), "data command");
        let bytes = cmd.encode()?;
        transport::write_all(&mut self.writer, &bytes).await?;
        Ok(())
    }

    async fn read_exact(&mut self, buf: &mut [u8]) -> Result<()> {
        let got = transport::read_all(&mut self.reader, buf).await?;
        if got < buf.len() {
            return Err(DcapError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                format!("data channel closed after {got} of {} bytes", buf.len()),
            )));
        }
        Ok(())
    }

    async fn read_i32(&mut self) -> Result<i32> {
        let mut b = [0u8; 4];
        self.read_exact(&mut b).await?;
        Ok(i32::from_be_bytes(b))
    }

    /// Next confirmation block.
    pub async fn reply(&mut self) -> Result<ConfirmationBlock> {
        let len = self.read_i32().await?;
        if len <= 0 || len as usize > MAX_REPLY_LEN {
            return Err(DcapError::Protocol(format!("reply length {len}")));
        }
        let mut body = vec![0u8; len as usize];
        self.read_exact(&mut body).await?;
        decode_reply(&body)
    }

    /// Length of the next incoming chunk; `None` at the -1 terminator.
    pub async fn chunk_len(&mut self) -> Result<Option<usize>> {
        match self.read_i32().await? {
            -1 => Ok(None),
            n if n < 0 => Err(DcapError::Protocol(format!("chunk length {n}"))),
            n => Ok(Some(n as usize)),
        }
    }

    /// Fill `buf` from the current chunk. Returns bytes obtained; short means EOF.
    pub async fn payload(&mut self, buf: &mut [u8]) -> Result<usize> {
        Ok(transport::read_all(&mut self.reader, buf).await?)
    }

    pub async fn send_data_header(&mut self) -> Result<()> {
        let mut out = Vec::with_capacity(8);
        put(
            &mut out,
            &Head {
                len: 4,
                opcode: Opcode::Data as i32,
            },
        )?;
        transport::write_all(&mut self.writer, &out).await?;
        Ok(())
    }

    pub async fn send_chunk(&mut self, data: &[u8]) -> Result<()> {
        for part in data.chunks(MAX_CHUNK) {
            transport::write_all(&mut self.writer, &(part.len() as i32).to_be_bytes()).await?;
            transport::write_all(&mut self.writer, part).await?;
        }
        Ok(())
    }

    pub async fn send_end_of_data(&mut self) -> Result<()> {
        transport::write_all(&mut self.writer, &(-1i32).to_be_bytes()).await?;
        Ok(())
    }

    pub async fn shutdown(&mut self) {
        let _ = self.writer.shutdown().await;
    }
}
