//! One relayed WebSocket connection.
//!
//! A [`Channel`] owns the two sockets of an upgraded connection: the *local* one to the client
//! and the *remote* one to the server. Once [`Channel::start_listeners`] runs, two listeners
//! block on reads, one per direction, and every frame they read goes through
//! [`Channel::process_frame`]:
//!
//! 1. the header is decoded by the channel's [`Protocol`],
//! 2. the frame is fed to that direction's [`MessageAssembler`],
//! 3. observers are notified, unless the channel is forward-only,
//! 4. the frame's original bytes are written to the opposite peer.
//!
//! The relay never re-frames or re-masks. The only exception is a frame an observer rewrote.
//!
//! # Lifecycle
//!
//! ```text
//! CONNECTING -> OPEN -> CLOSING -> CLOSED
//! ```
//!
//! The state only moves forward. `EXCLUDED` and `INCLUDED` are notifications sent when
//! forward-only mode is toggled; they never replace the state.
//!
//! Shutdown takes two phases. [`Channel::shutdown`] moves to `CLOSING` and shuts down the read
//! half of both sockets, which wakes both listeners. Each listener reports back as it exits, and
//! the one that exits last closes both sockets and moves to `CLOSED`. Neither socket is closed
//! while a listener may still read from it, and `CLOSED` is announced exactly once.

use crate::countdown::Countdown;
use crate::frame::{self, Frame, FrameHeader, Opcode};
use crate::handshake::{HandshakeRecord, HandshakeRef};
use crate::listener::Listener;
use crate::message::{Assembled, Direction, Message, MessageAssembler};
use crate::observer::ObserverRegistry;
use crate::pool::WorkerPool;
use serde::{Deserialize, Serialize};
use std::fmt::Debug;
use std::io::{Cursor, Read, Write};
use std::net::{Shutdown, TcpStream};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("unsupported WebSocket version {0:?}")]
    UnsupportedVersion(String),
    #[error("channel is not connected")]
    NotConnected,
    #[error("listeners were already started")]
    AlreadyStarted,
    #[error("channel is closed")]
    Closed,
    #[error("socket is not usable: {0}")]
    Socket(#[source] std::io::Error),
    #[error("frame error: {0}")]
    Frame(#[from] frame::Error),
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChannelState {
    Connecting,
    Open,
    Closing,
    Closed,
    /// The channel became forward-only.
    Excluded,
    /// The channel stopped being forward-only.
    Included,
}

impl ChannelState {
    /// Position in the primary chain, `None` for the forward-only notifications.
    fn rank(self) -> Option<u8> {
        match self {
            ChannelState::Connecting => Some(0),
            ChannelState::Open => Some(1),
            ChannelState::Closing => Some(2),
            ChannelState::Closed => Some(3),
            ChannelState::Excluded | ChannelState::Included => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            ChannelState::Connecting => "CONNECTING",
            ChannelState::Open => "OPEN",
            ChannelState::Closing => "CLOSING",
            ChannelState::Closed => "CLOSED",
            ChannelState::Excluded => "EXCLUDED",
            ChannelState::Included => "INCLUDED",
        }
    }
}

/// A snapshot of a channel, for observers and storage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelInfo {
    pub id: u64,
    pub host: String,
    pub port: u16,
    pub url: String,
    /// Milliseconds since the Unix epoch when the channel reached `OPEN`.
    pub start_timestamp: Option<u64>,
    /// Milliseconds since the Unix epoch when the channel reached `CLOSED`.
    pub end_timestamp: Option<u64>,
    pub handshake_ref: Option<u64>,
    pub state: ChannelState,
    pub forward_only: bool,
}

/// A WebSocket protocol version.
///
/// Chosen once per channel from the negotiated `Sec-WebSocket-Version`. Only version 13
/// (RFC 6455) exists; [`protocol_for`] is where another version would be added.
pub trait Protocol: Send + Sync + Debug {
    fn version(&self) -> &'static str;

    /// Decodes a frame header whose first byte was already read.
    fn read_header(&self, first: u8, reader: &mut dyn Read) -> Result<FrameHeader, frame::Error>;

    /// Reads the payload belonging to `header`.
    fn read_frame(&self, header: FrameHeader, reader: &mut dyn Read) -> Result<Frame, frame::Error>;

    /// Builds a single-frame message to inject in `direction`.
    fn encode(&self, direction: Direction, opcode: Opcode, payload: &[u8]) -> Frame;
}

/// RFC 6455.
#[derive(Debug, Clone, Copy, Default)]
pub struct Version13;

impl Protocol for Version13 {
    fn version(&self) -> &'static str {
        "13"
    }

    fn read_header(&self, first: u8, reader: &mut dyn Read) -> Result<FrameHeader, frame::Error> {
        FrameHeader::read(first, reader)
    }

    fn read_frame(&self, header: FrameHeader, reader: &mut dyn Read) -> Result<Frame, frame::Error> {
        Frame::read_payload(header, reader)
    }

    fn encode(&self, direction: Direction, opcode: Opcode, payload: &[u8]) -> Frame {
        // clients must mask, servers must not
        let mask_key = direction.is_outgoing().then(rand::random::<[u8; 4]>);
        Frame::encode(true, 0, opcode, mask_key, payload)
    }
}

/// Looks up the protocol for a negotiated version string.
pub fn protocol_for(version: &str) -> Result<Box<dyn Protocol>, Error> {
    match version.trim() {
        "13" => Ok(Box::new(Version13)),
        other => Err(Error::UnsupportedVersion(other.to_string())),
    }
}

const LOCAL: usize = 0;
const REMOTE: usize = 1;

/// One side of the connection.
#[derive(Debug)]
///
/// Every handle is `None` once the channel has closed.
struct Peer {
    /// Used for socket options and shutdown.
    control: Mutex<Option<TcpStream>>,
    /// Written by the listener of the opposite direction and by injected messages.
    output: Mutex<Option<TcpStream>>,
    /// Handed to this side's listener when it starts.
    input: Mutex<Option<TcpStream>>,
}

impl Peer {
    fn new(stream: TcpStream) -> std::io::Result<Peer> {
        Ok(Peer {
            control: Mutex::new(Some(stream.try_clone()?)),
            output: Mutex::new(Some(stream.try_clone()?)),
            input: Mutex::new(Some(stream)),
        })
    }

    fn prepare(&self) -> Result<(), Error> {
        let control = lock(&self.control);
        let control = control.as_ref().ok_or(Error::Closed)?;
        control.peer_addr().map_err(Error::Socket)?;
        control.set_read_timeout(None).map_err(Error::Socket)?;
        control.set_nodelay(true).map_err(Error::Socket)
    }

    fn shutdown(&self, how: Shutdown) -> std::io::Result<()> {
        match lock(&self.control).as_ref() {
            Some(control) => control.shutdown(how),
            None => Ok(()),
        }
    }

    /// Shuts the socket down and drops every handle still held here.
    ///
    /// Returns false if an earlier call already did.
    fn release(&self) -> std::io::Result<bool> {
        let Some(control) = lock(&self.control).take() else {
            return Ok(false);
        };
        let shutdown = control.shutdown(Shutdown::Both);
        // a blocked writer holds the lock until the shutdown above fails its write
        drop(lock(&self.output).take());
        drop(lock(&self.input).take());
        shutdown.map(|_| true)
    }

    #[cfg(test)]
    fn open_handles(&self) -> usize {
        [
            lock(&self.control).is_some(),
            lock(&self.output).is_some(),
            lock(&self.input).is_some(),
        ]
        .into_iter()
        .filter(|open| *open)
        .count()
    }

    fn take_input(&self) -> Result<TcpStream, Error> {
        lock(&self.input).take().ok_or(Error::AlreadyStarted)
    }
}

#[derive(Debug)]
struct Lifecycle {
    state: ChannelState,
    forward_only: bool,
    listeners_started: bool,
    start_timestamp: Option<u64>,
    end_timestamp: Option<u64>,
}

impl Lifecycle {
    /// Moves forward along the primary chain. Returns whether the state changed.
    fn advance(&mut self, to: ChannelState) -> bool {
        if to.rank() <= self.state.rank() {
            return false;
        }
        self.state = to;
        match to {
            ChannelState::Open => self.start_timestamp = Some(crate::unix_millis()),
            // a channel that never opened has no session to end
            ChannelState::Closed if self.start_timestamp.is_some() => {
                self.end_timestamp = Some(crate::unix_millis())
            }
            _ => {}
        }
        true
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct Channel {
    id: u64,
    host: String,
    port: u16,
    url: String,
    subprotocol: Option<String>,
    extensions: Vec<String>,
    handshake: HandshakeRef,
    protocol: Box<dyn Protocol>,
    peers: [Peer; 2],
    lifecycle: Mutex<Lifecycle>,
    listeners: Countdown,
    observers: Arc<ObserverRegistry>,
    next_message_id: AtomicU64,
    max_frame_payload: u64,
}

impl Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("id", &self.id)
            .field("url", &self.url)
            .field("protocol", &self.protocol.version())
            .field("lifecycle", &*lock(&self.lifecycle))
            .finish()
    }
}

impl Channel {
    /// Creates a channel for an upgraded connection.
    ///
    /// Fails with [`Error::UnsupportedVersion`] before touching either socket if the handshake
    /// negotiated a version other than 13. The channel does nothing until
    /// [`Channel::start_listeners`] is called.
    ///
    /// # Arguments
    ///
    /// * `id` - The channel id, unique within the process
    /// * `handshake` - The completed handshake; supplies url, version, subprotocol and extensions
    /// * `local` - The socket to the client
    /// * `remote` - The socket to the server
    /// * `observers` - Notified of every frame and state change
    /// * `max_frame_payload` - Frames with a larger payload are streamed through unobserved
    pub fn create(
        id: u64,
        handshake: &HandshakeRecord,
        local: TcpStream,
        remote: TcpStream,
        observers: Arc<ObserverRegistry>,
        max_frame_payload: u64,
    ) -> Result<Arc<Channel>, Error> {
        let protocol = protocol_for(&handshake.version)?;
        Channel::with_protocol(protocol, id, handshake, local, remote, observers, max_frame_payload)
    }

    pub(crate) fn with_protocol(
        protocol: Box<dyn Protocol>,
        id: u64,
        handshake: &HandshakeRecord,
        local: TcpStream,
        remote: TcpStream,
        observers: Arc<ObserverRegistry>,
        max_frame_payload: u64,
    ) -> Result<Arc<Channel>, Error> {
        let peers = [
            Peer::new(local).map_err(Error::Socket)?,
            Peer::new(remote).map_err(Error::Socket)?,
        ];
        Ok(Arc::new(Channel {
            id,
            host: handshake.host.clone(),
            port: handshake.port,
            url: handshake.url.clone(),
            subprotocol: handshake.subprotocol.clone(),
            extensions: handshake.extensions.clone(),
            handshake: handshake.reference.clone(),
            protocol,
            peers,
            lifecycle: Mutex::new(Lifecycle {
                state: ChannelState::Connecting,
                forward_only: false,
                listeners_started: false,
                start_timestamp: None,
                end_timestamp: None,
            }),
            listeners: Countdown::new(2),
            observers,
            next_message_id: AtomicU64::new(1),
            max_frame_payload,
        }))
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn subprotocol(&self) -> Option<&str> {
        self.subprotocol.as_deref()
    }

    pub fn extensions(&self) -> &[String] {
        &self.extensions
    }

    pub fn protocol_version(&self) -> &'static str {
        self.protocol.version()
    }

    /// The storage id of the handshake record, once stored.
    pub fn handshake_ref(&self) -> Option<u64> {
        self.handshake.get()
    }

    pub fn state(&self) -> ChannelState {
        lock(&self.lifecycle).state
    }

    /// True iff the channel is `OPEN`.
    pub fn is_connected(&self) -> bool {
        self.state() == ChannelState::Open
    }

    /// True once shutdown has begun.
    pub fn is_closing(&self) -> bool {
        matches!(self.state(), ChannelState::Closing | ChannelState::Closed)
    }

    pub fn is_forward_only(&self) -> bool {
        lock(&self.lifecycle).forward_only
    }

    pub fn info(&self) -> ChannelInfo {
        let lifecycle = lock(&self.lifecycle);
        ChannelInfo {
            id: self.id,
            host: self.host.clone(),
            port: self.port,
            url: self.url.clone(),
            start_timestamp: lifecycle.start_timestamp,
            end_timestamp: lifecycle.end_timestamp,
            handshake_ref: self.handshake.get(),
            state: lifecycle.state,
            forward_only: lifecycle.forward_only,
        }
    }

    /// Ids are per channel and start at 1.
    pub(crate) fn next_message_id(&self) -> u64 {
        self.next_message_id.fetch_add(1, Ordering::AcqRel)
    }

    fn notify_state(&self, state: ChannelState) {
        logwise::debuginternal_sync!(
            "channel {channel} -> {state}",
            channel = self.id,
            state = logwise::privacy::LogIt(&state)
        );
        self.observers.notify_state_change(state, &self.info());
    }

    fn advance(&self, to: ChannelState) -> bool {
        let moved = lock(&self.lifecycle).advance(to);
        if moved {
            self.notify_state(to);
        }
        moved
    }

    /// Switches forward-only mode, announcing `EXCLUDED` or `INCLUDED` if it changed.
    pub fn set_forward_only(&self, forward_only: bool) {
        {
            let mut lifecycle = lock(&self.lifecycle);
            if lifecycle.forward_only == forward_only {
                return;
            }
            lifecycle.forward_only = forward_only;
        }
        self.notify_state(if forward_only {
            ChannelState::Excluded
        } else {
            ChannelState::Included
        });
    }

    /// Starts relaying.
    ///
    /// `prefetched` holds bytes the handshake component already read from the remote socket
    /// past the end of the `101` response; they are relayed before anything else from that side.
    ///
    /// Both sockets are checked and configured first. The channel announces `CONNECTING`, builds
    /// both listeners, moves to `OPEN`, and only then hands the listeners to `pool`, so no
    /// observer can see a frame before it has seen `OPEN`.
    pub fn start_listeners(self: &Arc<Self>, pool: &WorkerPool, prefetched: Vec<u8>) -> Result<(), Error> {
        for peer in &self.peers {
            peer.prepare()?;
        }
        {
            let mut lifecycle = lock(&self.lifecycle);
            if lifecycle.listeners_started {
                return Err(Error::AlreadyStarted);
            }
            if lifecycle.state != ChannelState::Connecting {
                return Err(Error::Closed);
            }
            lifecycle.listeners_started = true;
        }
        self.notify_state(ChannelState::Connecting);

        let local = match self.peers[LOCAL].take_input() {
            Ok(local) => local,
            Err(e) => {
                self.abort_listeners(2);
                return Err(e);
            }
        };
        let remote = match self.peers[REMOTE].take_input() {
            Ok(remote) => remote,
            Err(e) => {
                self.abort_listeners(2);
                return Err(e);
            }
        };
        let outgoing = Listener::new(self.clone(), Direction::Outgoing, Box::new(local));
        let incoming = Listener::new(
            self.clone(),
            Direction::Incoming,
            Box::new(Cursor::new(prefetched).chain(remote)),
        );
        self.advance(ChannelState::Open);

        if let Err(e) = pool.spawn(outgoing.thread_name(), move || outgoing.run()) {
            self.abort_listeners(2);
            return Err(Error::Socket(e));
        }
        if let Err(e) = pool.spawn(incoming.thread_name(), move || incoming.run()) {
            self.abort_listeners(1);
            return Err(Error::Socket(e));
        }
        Ok(())
    }

    /// Stands in for listeners that will never run.
    fn abort_listeners(&self, missing: usize) {
        self.shutdown();
        for _ in 0..missing {
            if self.listeners.arrive() {
                self.close();
            }
        }
    }

    /// Requests shutdown. Safe to call any number of times, from any thread.
    ///
    /// Returns immediately; the channel reaches `CLOSED` once both listeners have exited.
    pub fn shutdown(&self) {
        let (moved, started) = {
            let mut lifecycle = lock(&self.lifecycle);
            (lifecycle.advance(ChannelState::Closing), lifecycle.listeners_started)
        };
        if !moved {
            return;
        }
        self.notify_state(ChannelState::Closing);
        if !started {
            self.close();
            return;
        }
        for peer in &self.peers {
            if let Err(e) = peer.shutdown(Shutdown::Read) {
                logwise::debuginternal_sync!(
                    "channel {channel}: shutting down reads failed: {error}",
                    channel = self.id,
                    error = logwise::privacy::LogIt(&e)
                );
            }
        }
    }

    /// Called by each listener exactly once, as it exits.
    pub(crate) fn listener_finished(&self, direction: Direction) {
        logwise::debuginternal_sync!(
            "channel {channel}: {direction} listener finished",
            channel = self.id,
            direction = logwise::privacy::LogIt(&direction)
        );
        self.shutdown();
        if self.listeners.arrive() {
            self.close();
        }
    }

    /// Releases both sockets and moves to `CLOSED`.
    ///
    /// Returns how many sockets this call released; racing callers release each one once.
    fn close(&self) -> usize {
        let mut released = 0;
        for peer in &self.peers {
            match peer.release() {
                Ok(true) => released += 1,
                Ok(false) => {}
                Err(e) => {
                    released += 1;
                    // already gone on the other end
                    logwise::debuginternal_sync!(
                        "channel {channel}: closing socket: {error}",
                        channel = self.id,
                        error = logwise::privacy::LogIt(&e)
                    );
                }
            }
        }
        self.advance(ChannelState::Closed);
        released
    }

    pub(crate) fn max_frame_payload(&self) -> u64 {
        self.max_frame_payload
    }

    #[cfg(test)]
    fn open_handles(&self) -> usize {
        self.peers.iter().map(Peer::open_handles).sum()
    }

    fn sink(&self, direction: Direction) -> &Peer {
        match direction {
            Direction::Outgoing => &self.peers[REMOTE],
            Direction::Incoming => &self.peers[LOCAL],
        }
    }

    fn forward(&self, direction: Direction, bytes: &[u8]) -> Result<(), Error> {
        let mut output = lock(&self.sink(direction).output);
        let output = output.as_mut().ok_or(Error::NotConnected)?;
        output.write_all(bytes)?;
        output.flush()?;
        Ok(())
    }

    /// Decodes, observes and forwards one frame read from `direction`'s input.
    pub(crate) fn process_frame(
        &self,
        direction: Direction,
        first: u8,
        input: &mut dyn Read,
        assembler: &mut MessageAssembler,
    ) -> Result<(), Error> {
        let header = self.protocol.read_header(first, input)?;
        for anomaly in header.anomalies() {
            logwise::warn_sync!(
                "channel {channel} ({direction}): protocol anomaly {anomaly} in {opcode} frame; relaying it anyway",
                channel = self.id,
                direction = logwise::privacy::LogIt(&direction),
                anomaly = logwise::privacy::LogIt(&anomaly),
                opcode = logwise::privacy::LogIt(&header.opcode())
            );
        }

        if header.payload_len() > self.max_frame_payload {
            logwise::warn_sync!(
                "channel {channel} ({direction}): {length} byte frame exceeds the {limit} byte limit; streaming it unobserved",
                channel = self.id,
                direction = logwise::privacy::LogIt(&direction),
                length = header.payload_len(),
                limit = self.max_frame_payload
            );
            assembler.on_oversized(&header);
            let mut output = lock(&self.sink(direction).output);
            let output = output.as_mut().ok_or(Error::NotConnected)?;
            output.write_all(header.as_bytes())?;
            frame::copy_payload(header.payload_len(), input, output)?;
            output.flush()?;
            return Ok(());
        }

        let frame = self.protocol.read_frame(header, input)?;
        let forward_only = self.is_forward_only();
        match assembler.on_frame(frame, || self.next_message_id()) {
            Assembled::PassThrough(frame) => self.forward(direction, frame.raw()),
            Assembled::Orphan(mut message) => {
                if !forward_only {
                    // forwarded whatever the observers say
                    self.observers.notify_frame(self.id, &mut message);
                }
                self.forward(direction, &message.wire_bytes())
            }
            Assembled::Partial(message) => self.deliver(direction, message, forward_only),
            Assembled::Complete(mut message) => self.deliver(direction, &mut message, forward_only),
        }
    }

    fn deliver(&self, direction: Direction, message: &mut Message, forward_only: bool) -> Result<(), Error> {
        if !forward_only && !self.observers.notify_frame(self.id, message) {
            logwise::debuginternal_sync!(
                "channel {channel}: observer dropped a frame of message {message}",
                channel = self.id,
                message = message.message_id()
            );
            return Ok(());
        }
        self.forward(direction, &message.wire_bytes())
    }

    /// Injects a new single-frame message.
    ///
    /// Outgoing messages are masked with a fresh random key. The frame is written between
    /// relayed frames, never inside one. Observers are told about it unless the channel is
    /// forward-only, but cannot stop it.
    pub fn send_and_notify(&self, direction: Direction, opcode: Opcode, payload: &[u8]) -> Result<Message, Error> {
        if !self.is_connected() {
            return Err(Error::NotConnected);
        }
        let frame = self.protocol.encode(direction, opcode, payload);
        self.forward(direction, frame.raw())?;
        let mut message = Message::start(self.id, self.next_message_id(), direction, frame);
        if !self.is_forward_only() {
            self.observers.notify_frame(self.id, &mut message);
        }
        Ok(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::observer::Observer;
    use std::net::TcpListener;

    fn socket_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (server, _) = listener.accept().unwrap();
        (client, server)
    }

    struct States(Mutex<Vec<ChannelState>>);

    impl Observer for States {
        fn observing_order(&self) -> i32 {
            0
        }

        fn on_message_frame(&self, _channel_id: u64, _message: &mut Message) -> bool {
            true
        }

        fn on_state_change(&self, state: ChannelState, _channel: &ChannelInfo) {
            self.0.lock().unwrap().push(state);
        }
    }

    fn channel(observers: Arc<ObserverRegistry>) -> (Arc<Channel>, TcpStream, TcpStream) {
        let (client, local) = socket_pair();
        let (remote, server) = socket_pair();
        let record = HandshakeRecord::new("ws://localhost/ws", "localhost", 80);
        let channel = Channel::create(7, &record, local, remote, observers, 1024).unwrap();
        (channel, client, server)
    }

    #[test]
    fn only_version_13_is_supported() {
        assert_eq!(protocol_for("13").unwrap().version(), "13");
        assert!(matches!(protocol_for("8"), Err(Error::UnsupportedVersion(v)) if v == "8"));
    }

    #[test]
    fn injected_frames_mask_towards_the_server_only() {
        let outgoing = Version13.encode(Direction::Outgoing, Opcode::Text, b"hey");
        assert!(outgoing.header().masked());
        assert_eq!(outgoing.payload(), b"hey");
        let incoming = Version13.encode(Direction::Incoming, Opcode::Text, b"hey");
        assert!(!incoming.header().masked());
        assert_eq!(incoming.raw(), &[0x81, 0x03, b'h', b'e', b'y']);
    }

    #[test]
    fn state_only_moves_forward() {
        let mut lifecycle = Lifecycle {
            state: ChannelState::Connecting,
            forward_only: false,
            listeners_started: false,
            start_timestamp: None,
            end_timestamp: None,
        };
        assert!(lifecycle.advance(ChannelState::Open));
        assert!(lifecycle.start_timestamp.is_some());
        assert!(lifecycle.advance(ChannelState::Closed));
        assert!(!lifecycle.advance(ChannelState::Closing));
        assert!(!lifecycle.advance(ChannelState::Open));
        assert!(!lifecycle.advance(ChannelState::Excluded));
        assert_eq!(lifecycle.state, ChannelState::Closed);
        assert!(lifecycle.end_timestamp >= lifecycle.start_timestamp);
    }

    #[test]
    fn closing_without_opening_has_no_end_time() {
        let mut lifecycle = Lifecycle {
            state: ChannelState::Connecting,
            forward_only: false,
            listeners_started: false,
            start_timestamp: None,
            end_timestamp: None,
        };
        assert!(lifecycle.advance(ChannelState::Closed));
        assert_eq!(lifecycle.start_timestamp, None);
        assert_eq!(lifecycle.end_timestamp, None);
    }

    #[test]
    fn shutdown_before_start_closes_once() {
        let states = Arc::new(States(Mutex::new(Vec::new())));
        let observers = Arc::new(ObserverRegistry::new());
        observers.add_observer(states.clone());
        let (channel, _client, _server) = channel(observers);
        channel.shutdown();
        channel.shutdown();
        assert_eq!(channel.state(), ChannelState::Closed);
        assert_eq!(channel.info().start_timestamp, None);
        assert_eq!(channel.info().end_timestamp, None);
        assert_eq!(channel.open_handles(), 0);
        assert_eq!(
            *states.0.lock().unwrap(),
            vec![ChannelState::Closing, ChannelState::Closed]
        );
        assert!(matches!(
            channel.start_listeners(&WorkerPool::new(), Vec::new()),
            Err(Error::Closed)
        ));
    }

    #[test]
    fn close_releases_every_socket_once() {
        let (channel, mut client, mut server) = channel(Arc::new(ObserverRegistry::new()));
        assert_eq!(channel.open_handles(), 6);
        let released: usize = std::thread::scope(|scope| {
            let closers: Vec<_> = (0..8).map(|_| scope.spawn(|| channel.close())).collect();
            closers.into_iter().map(|closer| closer.join().unwrap()).sum()
        });
        assert_eq!(released, 2);
        assert_eq!(channel.close(), 0);
        assert_eq!(channel.open_handles(), 0);
        assert_eq!(channel.state(), ChannelState::Closed);

        let mut rest = Vec::new();
        assert_eq!(client.read_to_end(&mut rest).unwrap(), 0);
        assert_eq!(server.read_to_end(&mut rest).unwrap(), 0);
        assert!(matches!(
            channel.forward(Direction::Outgoing, b"late"),
            Err(Error::NotConnected)
        ));
    }

    #[test]
    fn forward_only_toggle_is_idempotent() {
        let states = Arc::new(States(Mutex::new(Vec::new())));
        let observers = Arc::new(ObserverRegistry::new());
        observers.add_observer(states.clone());
        let (channel, _client, _server) = channel(observers);
        channel.set_forward_only(true);
        channel.set_forward_only(true);
        channel.set_forward_only(false);
        channel.set_forward_only(false);
        assert_eq!(
            *states.0.lock().unwrap(),
            vec![ChannelState::Excluded, ChannelState::Included]
        );
        assert_eq!(channel.state(), ChannelState::Connecting);
    }

    #[test]
    fn injection_requires_an_open_channel() {
        let (channel, _client, _server) = channel(Arc::new(ObserverRegistry::new()));
        assert!(matches!(
            channel.send_and_notify(Direction::Incoming, Opcode::Text, b"x"),
            Err(Error::NotConnected)
        ));
    }
}
