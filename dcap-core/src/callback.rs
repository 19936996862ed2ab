//! Passive-mode callback listener: one per process, movers connect back to it.
//!
//! Each incoming connection opens with `i32 session id, i32 challenge length,
//! challenge`. The accept task hands the stream to the session waiting for that
//! id, or parks it until that session asks.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{DcapError, Result};

/// How long a mover may take to identify itself after connecting.
const GREETING_TIMEOUT: Duration = Duration::from_secs(30);
/// Challenges longer than this are not something a mover sends.
const MAX_CHALLENGE: usize = 4096;

#[derive(Default)]
struct Pending {
    waiters: HashMap<u32, oneshot::Sender<TcpStream>>,
    parked: HashMap<u32, TcpStream>,
}

pub struct CallbackListener {
    port: u16,
    pending: Arc<Mutex<Pending>>,
    task: JoinHandle<()>,
}

impl CallbackListener {
    /// Bind the first free port in `first..first + range` (any port when `first` is 0).
    pub async fn bind(first: u16, range: u16) -> Result<Self> {
        let listener = if first == 0 {
            TcpListener::bind(("0.0.0.0", 0)).await.map_err(DcapError::Bind)?
        } else {
            let mut last_err = None;
            let mut bound = None;
            for port in first..=first.saturating_add(range.max(1) - 1) {
                match TcpListener::bind(("0.0.0.0", port)).await {
                    Ok(l) => {
                        bound = Some(l);
                        break;
                    }
                    Err(e) => last_err = Some(e),
                }
            }
            match (bound, last_err) {
                (Some(l), _) => l,
                (None, Some(e)) => return Err(DcapError::Bind(e)),
                (None, None) => {
                    return Err(DcapError::Bind(std::io::ErrorKind::AddrNotAvailable.into()))
                }
            }
        };
        let port = listener.local_addr().map_err(DcapError::Bind)?.port();
        info!(port, "callback listener bound");
        let pending = Arc::new(Mutex::new(Pending::default()));
        let task = tokio::spawn(accept_loop(listener, pending.clone()));
        Ok(Self {
            port,
            pending,
            task,
        })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Register interest in the mover connection for session `id`.
    pub fn expect(&self, id: u32) -> oneshot::Receiver<TcpStream> {
        let (tx, rx) = oneshot::channel();
        if let Ok(mut p) = self.pending.lock() {
            match p.parked.remove(&id) {
                Some(stream) => {
                    let _ = tx.send(stream);
                }
                None => {
                    p.waiters.insert(id, tx);
                }
            }
        }
        rx
    }

    /// Drop any waiter or parked connection for `id`.
    pub fn forget(&self, id: u32) {
        if let Ok(mut p) = self.pending.lock() {
            p.waiters.remove(&id);
            p.parked.remove(&id);
        }
    }

    pub fn parked(&self) -> usize {
        self.pending.lock().map(|p| p.parked.len()).unwrap_or(0)
    }
}

impl Drop for CallbackListener {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn accept_loop(listener: TcpListener, pending: Arc<Mutex<Pending>>) {
    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(s) => s,
            Err(e) => {
                warn!(error = %e, "callback accept failed");
                continue;
            }
        };
        let pending = pending.clone();
        tokio::spawn(async move {
            let mut stream = stream;
            let id = match tokio::time::timeout(GREETING_TIMEOUT, greeting(&mut stream)).await {
                Ok(Ok(id)) => id,
                Ok(Err(e)) => {
                    warn!(%peer, error = %e, "bad mover greeting");
                    return;
                }
                Err(_) => {
                    warn!(%peer, "mover never identified itself");
                    return;
                }
            };
            debug!(%peer, session = id, "mover connected back");
            route(&pending, id, stream);
        });
    }
}

async fn greeting(stream: &mut TcpStream) -> std::io::Result<u32> {
    let id = stream.read_i32().await?;
    let len = stream.read_i32().await?;
    if len < 0 || len as usize > MAX_CHALLENGE {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("challenge length {len}"),
        ));
    }
    let mut challenge = vec![0u8; len as usize];
    stream.read_exact(&mut challenge).await?;
    Ok(id as u32)
}

fn route(pending: &Mutex<Pending>, id: u32, stream: TcpStream) {
    let Ok(mut p) = pending.lock() else {
        return;
    };
    match p.waiters.remove(&id) {
        Some(tx) => {
            if let Err(stream) = tx.send(stream) {
                debug!(session = id, "waiter gone, parking mover connection");
                p.parked.insert(id, stream);
            }
        }
        None => {
            p.parked.insert(id, stream);
        }
    }
}
