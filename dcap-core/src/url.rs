//! `dcap://` and `pnfs://` URLs naming a door and a file.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
    Dcap,
    Pnfs,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DcapUrl {
    pub scheme: Scheme,
    pub host: String,
    pub port: Option<u16>,
    /// Path on the door, always starting with `/`.
    pub path: String,
    raw: String,
}

impl DcapUrl {
    /// `None` when `s` is not a URL this client understands.
    pub fn parse(s: &str) -> Option<Self> {
        let (scheme, rest) = if let Some(rest) = s.strip_prefix("dcap://") {
            (Scheme::Dcap, rest)
        } else if let Some(rest) = s.strip_prefix("pnfs://") {
            (Scheme::Pnfs, rest)
        } else {
            return None;
        };
        let (authority, path) = match rest.find('/') {
            Some(i) => (&rest[..i], &rest[i..]),
            None => (rest, "/"),
        };
        if authority.is_empty() {
            return None;
        }
        let (host, port) = match authority.rsplit_once(':') {
            Some((h, p)) => (h, Some(p.parse().ok()?)),
            None => (authority, None),
        };
        if host.is_empty() {
            return None;
        }
        Some(Self {
            scheme,
            host: host.to_string(),
            port,
            path: path.to_string(),
            raw: s.to_string(),
        })
    }

    /// The URL as the caller gave it; this is what the door is told to open.
    pub fn as_str(&self) -> &str {
        &self.raw
    }
}
