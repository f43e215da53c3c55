//! The HTTP side of a WebSocket connection: just enough to hand a channel over to the relay.
//!
//! The relay itself starts after the `101 Switching Protocols` response. The component that
//! proxies the handshake uses these helpers to read both HTTP heads off blocking sockets,
//! validate the exchange per RFC 6455 §4, and build the [`HandshakeRecord`] that
//! [`ChannelRegistry::add_channel`](crate::registry::ChannelRegistry::add_channel) expects.
//!
//! Whatever a peer sends after the blank line that ends its head already belongs to the
//! WebSocket stream. [`HttpHead::read`] returns those bytes so they can be passed on as the
//! channel's prefetched bytes.

use base64::Engine;
use sha1::Digest;
use std::io::Read;
use std::sync::{Arc, OnceLock};

/// RFC 6455 §1.3.
const ACCEPT_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// Heads larger than this are rejected rather than buffered.
pub const MAX_HEAD_LEN: usize = 64 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
    #[error("connection closed before the HTTP head was complete")]
    ConnectionClosed,
    #[error("HTTP head exceeds {MAX_HEAD_LEN} bytes")]
    HeadTooLarge,
    #[error("malformed HTTP head: {0}")]
    Malformed(String),
    #[error("handshake was not accepted: {0}")]
    NotSwitchingProtocols(String),
    #[error("handshake is missing the {0} header")]
    MissingHeader(&'static str),
    #[error("Sec-WebSocket-Accept does not match Sec-WebSocket-Key")]
    AcceptMismatch,
}

/// A parsed HTTP/1.1 request or response head.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpHead {
    start_line: String,
    headers: Vec<(String, String)>,
}

impl HttpHead {
    /// Reads a head from `stream`, returning it together with any bytes read past its end.
    pub fn read<R: Read + ?Sized>(stream: &mut R) -> Result<(HttpHead, Vec<u8>), Error> {
        let mut buf = Vec::new();
        let mut chunk = [0u8; 1024];
        loop {
            if let Some(end) = head_end(&buf) {
                let head = HttpHead::parse(&buf[..end])?;
                return Ok((head, buf.split_off(end)));
            }
            if buf.len() > MAX_HEAD_LEN {
                return Err(Error::HeadTooLarge);
            }
            match stream.read(&mut chunk) {
                Ok(0) => return Err(Error::ConnectionClosed),
                Ok(read) => buf.extend_from_slice(&chunk[..read]),
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Parses a complete head, blank line optional.
    pub fn parse(bytes: &[u8]) -> Result<HttpHead, Error> {
        let text = std::str::from_utf8(bytes)
            .map_err(|_| Error::Malformed("head is not valid UTF-8".to_string()))?;
        let mut lines = text
            .split('\n')
            .map(|line| line.strip_suffix('\r').unwrap_or(line))
            .take_while(|line| !line.is_empty());
        let start_line = match lines.next() {
            Some(line) if line.split(' ').count() >= 3 => line.to_string(),
            Some(line) => return Err(Error::Malformed(format!("invalid start line: {line}"))),
            None => return Err(Error::Malformed("no start line found".to_string())),
        };
        let mut headers = Vec::new();
        for line in lines {
            let Some((name, value)) = line.split_once(':') else {
                return Err(Error::Malformed(format!("invalid header line: {line}")));
            };
            headers.push((name.trim().to_string(), value.trim().to_string()));
        }
        Ok(HttpHead {
            start_line,
            headers,
        })
    }

    pub fn start_line(&self) -> &str {
        &self.start_line
    }

    /// The first value of header `name`, compared case-insensitively.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    pub fn headers(&self) -> &[(String, String)] {
        &self.headers
    }

    /// The request target, for a request head.
    pub fn target(&self) -> Option<&str> {
        self.start_line.split(' ').nth(1)
    }

    /// The status code, for a response head.
    pub fn status(&self) -> Option<u16> {
        if !self.start_line.starts_with("HTTP/") {
            return None;
        }
        self.start_line.split(' ').nth(1)?.parse().ok()
    }

    /// Serializes the head back to wire form, including the terminating blank line.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = String::with_capacity(256);
        out.push_str(&self.start_line);
        out.push_str("\r\n");
        for (name, value) in &self.headers {
            out.push_str(name);
            out.push_str(": ");
            out.push_str(value);
            out.push_str("\r\n");
        }
        out.push_str("\r\n");
        out.into_bytes()
    }
}

/// Offset just past the blank line ending the head, if the buffer holds one.
fn head_end(buf: &[u8]) -> Option<usize> {
    let mut start = 0;
    for (i, byte) in buf.iter().enumerate() {
        if *byte != b'\n' {
            continue;
        }
        let line = &buf[start..i];
        if line.is_empty() || line == b"\r" {
            return Some(i + 1);
        }
        start = i + 1;
    }
    None
}

/// Computes the `Sec-WebSocket-Accept` value for a `Sec-WebSocket-Key`.
pub fn accept_key(key: &str) -> String {
    let mut hasher = sha1::Sha1::default();
    hasher.update(key.trim().as_bytes());
    hasher.update(ACCEPT_GUID.as_bytes());
    base64::prelude::BASE64_STANDARD.encode(hasher.finalize())
}

/// A shared slot holding the storage id of a handshake record once it is durably stored.
///
/// The storage collaborator calls [`HandshakeRef::mark_stored`]; the registry waits for it before
/// it activates the channel.
#[derive(Debug, Clone, Default)]
pub struct HandshakeRef(Arc<OnceLock<u64>>);

impl HandshakeRef {
    pub fn pending() -> HandshakeRef {
        HandshakeRef::default()
    }

    pub fn stored(id: u64) -> HandshakeRef {
        let reference = HandshakeRef::pending();
        reference.mark_stored(id);
        reference
    }

    /// Records the storage id. Only the first call has an effect; returns whether it did.
    pub fn mark_stored(&self, id: u64) -> bool {
        self.0.set(id).is_ok()
    }

    pub fn get(&self) -> Option<u64> {
        self.0.get().copied()
    }

    pub fn is_stored(&self) -> bool {
        self.get().is_some()
    }
}

/// What the relay needs to know about a completed WebSocket handshake.
#[derive(Debug, Clone)]
pub struct HandshakeRecord {
    pub url: String,
    pub host: String,
    pub port: u16,
    /// The negotiated `Sec-WebSocket-Version`.
    pub version: String,
    pub subprotocol: Option<String>,
    /// Extensions as negotiated. The relay passes their data through uninterpreted.
    pub extensions: Vec<String>,
    pub reference: HandshakeRef,
}

impl HandshakeRecord {
    /// A version 13 record for `url`, with a fresh pending reference.
    pub fn new(url: &str, host: &str, port: u16) -> HandshakeRecord {
        HandshakeRecord {
            url: url.to_string(),
            host: host.to_string(),
            port,
            version: "13".to_string(),
            subprotocol: None,
            extensions: Vec::new(),
            reference: HandshakeRef::pending(),
        }
    }

    /// Validates an upgrade exchange and extracts the record.
    ///
    /// The response must be a `101` whose accept key matches the request's key.
    pub fn from_exchange(request: &HttpHead, response: &HttpHead) -> Result<HandshakeRecord, Error> {
        if response.status() != Some(101) {
            return Err(Error::NotSwitchingProtocols(response.start_line().to_string()));
        }
        let key = request
            .header("Sec-WebSocket-Key")
            .ok_or(Error::MissingHeader("Sec-WebSocket-Key"))?;
        let accept = response
            .header("Sec-WebSocket-Accept")
            .ok_or(Error::MissingHeader("Sec-WebSocket-Accept"))?;
        if accept != accept_key(key) {
            return Err(Error::AcceptMismatch);
        }
        let version = request
            .header("Sec-WebSocket-Version")
            .ok_or(Error::MissingHeader("Sec-WebSocket-Version"))?
            .to_string();
        let target = request
            .target()
            .ok_or_else(|| Error::Malformed(request.start_line().to_string()))?;

        let (url, authority) = match target.split_once("://") {
            Some((scheme, rest)) => {
                let authority = rest.split('/').next().unwrap_or(rest);
                (format!("{scheme}://{rest}"), authority.to_string())
            }
            None => {
                let authority = request.header("Host").ok_or(Error::MissingHeader("Host"))?;
                (format!("ws://{authority}{target}"), authority.to_string())
            }
        };
        let secure = url.starts_with("wss://") || url.starts_with("https://");
        let (host, port) = split_authority(&authority, if secure { 443 } else { 80 })?;

        let extensions = response
            .header("Sec-WebSocket-Extensions")
            .map(|value| {
                value
                    .split(',')
                    .map(str::trim)
                    .filter(|extension| !extension.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();

        Ok(HandshakeRecord {
            url,
            host,
            port,
            version,
            subprotocol: response.header("Sec-WebSocket-Protocol").map(str::to_string),
            extensions,
            reference: HandshakeRef::pending(),
        })
    }
}

fn split_authority(authority: &str, default_port: u16) -> Result<(String, u16), Error> {
    let malformed = || Error::Malformed(format!("invalid host: {authority}"));
    if let Some(rest) = authority.strip_prefix('[') {
        let (host, tail) = rest.split_once(']').ok_or_else(malformed)?;
        let port = match tail.strip_prefix(':') {
            Some(port) => port.parse().map_err(|_| malformed())?,
            None => default_port,
        };
        return Ok((host.to_string(), port));
    }
    match authority.rsplit_once(':') {
        Some((host, port)) => Ok((host.to_string(), port.parse().map_err(|_| malformed())?)),
        None => Ok((authority.to_string(), default_port)),
    }
}
