//! Tunnel providers: registry by name and the built-in `sealed` tunnel
//! (X25519 key agreement, per-direction keys, ChaCha20-Poly1305 records).

use std::collections::HashMap;
use std::io;
use std::sync::Arc;

use async_trait::async_trait;
use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::ChaCha20Poly1305;
use rand::rngs::OsRng;
use sha2::{Digest, Sha256};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use x25519_dalek::{PublicKey as X25519PublicKey, StaticSecret};

use crate::transport::{Tunnel, TunnelRead, TunnelWrite};

pub const SEALED: &str = "sealed";

/// Largest plaintext carried in one record.
const MAX_RECORD: usize = 16 * 1024;
/// Poly1305 tag.
const TAG_LEN: usize = 16;

/// Tunnel providers known to this process, looked up by the name given in
/// the door list or `DCACHE_IO_TUNNEL`.
#[derive(Debug, Clone)]
pub struct TunnelRegistry {
    providers: HashMap<String, Arc<dyn Tunnel>>,
}

impl Default for TunnelRegistry {
    fn default() -> Self {
        let mut providers: HashMap<String, Arc<dyn Tunnel>> = HashMap::new();
        providers.insert(SEALED.to_string(), Arc::new(SealedTunnel));
        Self { providers }
    }
}

impl TunnelRegistry {
    pub fn register(&mut self, tunnel: Arc<dyn Tunnel>) {
        self.providers.insert(tunnel.name().to_string(), tunnel);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tunnel>> {
        self.providers.get(name).cloned()
    }
}

#[derive(Clone, Copy)]
enum Role {
    Initiator,
    Responder,
}

/// Client side of the sealed tunnel.
#[derive(Debug, Default)]
pub struct SealedTunnel;

#[async_trait]
impl Tunnel for SealedTunnel {
    fn name(&self) -> &str {
        SEALED
    }

    async fn init(
        &self,
        stream: TcpStream,
    ) -> io::Result<(Box<dyn TunnelRead>, Box<dyn TunnelWrite>)> {
        handshake(stream, Role::Initiator).await
    }
}

/// Server side of the sealed tunnel, for doors and test harnesses.
pub async fn accept_sealed(
    stream: TcpStream,
) -> io::Result<(Box<dyn TunnelRead>, Box<dyn TunnelWrite>)> {
    handshake(stream, Role::Responder).await
}

/// Directional key from the shared secret. Each direction gets its own key so
/// nonce counters never collide.
fn derive_key(shared: &[u8; 32], label: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(b"dcap-sealed-v1");
    hasher.update(label);
    hasher.update(shared);
    hasher.finalize().into()
}

async fn handshake(
    mut stream: TcpStream,
    role: Role,
) -> io::Result<(Box<dyn TunnelRead>, Box<dyn TunnelWrite>)> {
    let secret = StaticSecret::random_from_rng(OsRng);
    let public = X25519PublicKey::from(&secret);
    stream.write_all(public.as_bytes()).await?;
    let mut peer = [0u8; 32];
    stream.read_exact(&mut peer).await?;
    let shared = secret.diffie_hellman(&X25519PublicKey::from(peer)).to_bytes();

    let forward = derive_key(&shared, b"initiator->responder");
    let backward = derive_key(&shared, b"responder->initiator");
    let (send_key, recv_key) = match role {
        Role::Initiator => (forward, backward),
        Role::Responder => (backward, forward),
    };
    let (r, w) = stream.into_split();
    Ok((
        Box::new(SealedReader {
            inner: r,
            cipher: ChaCha20Poly1305::new(&recv_key.into()),
            nonce: 0,
            plain: Vec::new(),
            offset: 0,
        }),
        Box::new(SealedWriter {
            inner: w,
            cipher: ChaCha20Poly1305::new(&send_key.into()),
            nonce: 0,
        }),
    ))
}

/// 96-bit nonce: 64-bit record counter, never reused within a direction.
fn nonce_bytes(counter: u64) -> [u8; 12] {
    let mut n = [0u8; 12];
    n[4..12].copy_from_slice(&counter.to_le_bytes());
    n
}

fn crypto_error(what: &str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, format!("sealed tunnel: {what}"))
}

struct SealedWriter {
    inner: OwnedWriteHalf,
    cipher: ChaCha20Poly1305,
    nonce: u64,
}

#[async_trait]
impl TunnelWrite for SealedWriter {
    async fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let take = buf.len().min(MAX_RECORD);
        let sealed = self
            .cipher
            .encrypt(&nonce_bytes(self.nonce).into(), &buf[..take])
            .map_err(|_| crypto_error("encryption failed"))?;
        self.nonce += 1;
        let mut record = Vec::with_capacity(4 + sealed.len());
        record.extend_from_slice(&(sealed.len() as u32).to_be_bytes());
        record.extend_from_slice(&sealed);
        self.inner.write_all(&record).await?;
        Ok(take)
    }

    async fn shutdown(&mut self) -> io::Result<()> {
        self.inner.shutdown().await
    }
}

struct SealedReader {
    inner: OwnedReadHalf,
    cipher: ChaCha20Poly1305,
    nonce: u64,
    plain: Vec<u8>,
    offset: usize,
}

impl SealedReader {
    /// Pull and open the next record. `false` on clean EOF at a record boundary.
    async fn fill(&mut self) -> io::Result<bool> {
        let mut len = [0u8; 4];
        if self.inner.read(&mut len[..1]).await? == 0 {
            return Ok(false);
        }
        self.inner.read_exact(&mut len[1..]).await?;
        let len = u32::from_be_bytes(len) as usize;
        if !(TAG_LEN..=MAX_RECORD + TAG_LEN).contains(&len) {
            return Err(crypto_error("bad record length"));
        }
        let mut sealed = vec![0u8; len];
        self.inner.read_exact(&mut sealed).await?;
        self.plain = self
            .cipher
            .decrypt(&nonce_bytes(self.nonce).into(), sealed.as_slice())
            .map_err(|_| crypto_error("decryption failed"))?;
        self.nonce += 1;
        self.offset = 0;
        Ok(true)
    }
}

#[async_trait]
impl TunnelRead for SealedReader {
    async fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        while self.offset >= self.plain.len() {
            if !self.fill().await? {
                return Ok(0);
            }
        }
        let n = buf.len().min(self.plain.len() - self.offset);
        buf[..n].copy_from_slice(&self.plain[self.offset..self.offset + n]);
        self.offset += n;
        Ok(n)
    }
}
