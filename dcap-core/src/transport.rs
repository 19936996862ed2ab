//! Byte transports: plain TCP or tunnel-wrapped, with exact-length read/write and per-call deadlines.

use std::future::Future;
use std::io;
use std::os::fd::AsRawFd;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;

use crate::error::{DcapError, Result};

/// Receiving side of a tunnel.
#[async_trait]
pub trait TunnelRead: Send {
    async fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;
}

/// Sending side of a tunnel.
#[async_trait]
pub trait TunnelWrite: Send {
    async fn write(&mut self, buf: &[u8]) -> io::Result<usize>;
    async fn shutdown(&mut self) -> io::Result<()>;
}

/// Pluggable transport wrapper. `init` runs the tunnel handshake on a fresh
/// connection; dropping the returned halves tears the tunnel down.
#[async_trait]
pub trait Tunnel: Send + Sync + std::fmt::Debug {
    fn name(&self) -> &str;
    async fn init(
        &self,
        stream: TcpStream,
    ) -> io::Result<(Box<dyn TunnelRead>, Box<dyn TunnelWrite>)>;
}

pub enum ReadHalf {
    Plain(OwnedReadHalf),
    Tunneled(Box<dyn TunnelRead>),
}

pub enum WriteHalf {
    Plain(OwnedWriteHalf),
    Tunneled(Box<dyn TunnelWrite>),
}

impl ReadHalf {
    pub async fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            ReadHalf::Plain(r) => r.read(buf).await,
            ReadHalf::Tunneled(t) => t.read(buf).await,
        }
    }
}

impl WriteHalf {
    pub async fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            WriteHalf::Plain(w) => w.write(buf).await,
            WriteHalf::Tunneled(t) => t.write(buf).await,
        }
    }

    pub async fn shutdown(&mut self) -> io::Result<()> {
        match self {
            WriteHalf::Plain(w) => w.shutdown().await,
            WriteHalf::Tunneled(t) => t.shutdown().await,
        }
    }
}

/// Split `stream` into transport halves, running the tunnel handshake when one is given.
pub async fn open(
    stream: TcpStream,
    tunnel: Option<&Arc<dyn Tunnel>>,
) -> io::Result<(ReadHalf, WriteHalf)> {
    match tunnel {
        Some(t) => {
            let (r, w) = t.init(stream).await?;
            Ok((ReadHalf::Tunneled(r), WriteHalf::Tunneled(w)))
        }
        None => {
            let (r, w) = stream.into_split();
            Ok((ReadHalf::Plain(r), WriteHalf::Plain(w)))
        }
    }
}

/// Prepare a data socket: no Nagle delay, and the requested kernel buffer
/// sizes (0 leaves the OS default). Failures are `DcapError::Socket`.
pub fn tune(stream: &TcpStream, send_buffer: u32, receive_buffer: u32) -> Result<()> {
    stream.set_nodelay(true).map_err(DcapError::Socket)?;
    if send_buffer != 0 {
        set_buffer(stream, libc::SO_SNDBUF, send_buffer)?;
    }
    if receive_buffer != 0 {
        set_buffer(stream, libc::SO_RCVBUF, receive_buffer)?;
    }
    Ok(())
}

fn set_buffer(stream: &TcpStream, option: libc::c_int, size: u32) -> Result<()> {
    let value = libc::c_int::try_from(size).unwrap_or(libc::c_int::MAX);
    // SAFETY: the descriptor is owned by `stream` and stays open for the call;
    // `value` is a live c_int and the length passed matches it.
    let rc = unsafe {
        libc::setsockopt(
            stream.as_raw_fd(),
            libc::SOL_SOCKET,
            option,
            (&value as *const libc::c_int).cast(),
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if rc != 0 {
        return Err(DcapError::Socket(io::Error::last_os_error()));
    }
    Ok(())
}

/// Read until `buf` is full or the peer closes. A return below `buf.len()` means EOF.
pub async fn read_all(r: &mut ReadHalf, buf: &mut [u8]) -> io::Result<usize> {
    let mut got = 0;
    while got < buf.len() {
        let n = r.read(&mut buf[got..]).await?;
        if n == 0 {
            break;
        }
        got += n;
    }
    Ok(got)
}

/// Write all of `buf` or fail.
pub async fn write_all(w: &mut WriteHalf, buf: &[u8]) -> io::Result<()> {
    let mut sent = 0;
    while sent < buf.len() {
        let n = w.write(&buf[sent..]).await?;
        if n == 0 {
            return Err(io::ErrorKind::WriteZero.into());
        }
        sent += n;
    }
    Ok(())
}

/// Run `fut` under a deadline; expiry becomes `DcapError::Timeout(what)`.
pub async fn timed<T, F>(limit: Duration, what: &'static str, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(r) => r,
        Err(_) => Err(DcapError::Timeout(what)),
    }
}
