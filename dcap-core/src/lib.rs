//! DCAP (dCache Access Protocol) client core.
//! Shared control lines to doors, per-session data channels to movers,
//! transparent recovery of broken transfers.

pub mod callback;
pub mod client;
pub mod codec;
pub mod config;
pub mod connect;
pub mod error;
pub mod logging;
pub mod mqueue;
pub mod poll;
pub mod protocol;
pub mod reconnect;
pub mod registry;
pub mod session;
pub mod transport;
pub mod tunnel;
pub mod url;

#[cfg(test)]
mod testkit;

pub use client::Dcap;
pub use codec::StatInfo;
pub use config::{Config, OnError};
pub use error::{DcapError, ErrorKind, Result};
pub use protocol::{Checksum, Whence, PROTOCOL_VERSION};
pub use registry::Fd;
pub use session::{IoVec, OpenOptions};
pub use transport::{Tunnel, TunnelRead, TunnelWrite};
pub use tunnel::TunnelRegistry;
pub use url::DcapUrl;
