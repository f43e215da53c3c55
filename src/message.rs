//! Logical WebSocket messages and their reassembly from frames.
//!
//! A [`Message`] is one or more frames sharing an opcode, delimited by the FIN bit of the last
//! frame. Each listener owns one [`MessageAssembler`], which holds at most one unfinished data
//! message for its direction. Control frames are always standalone messages and may arrive
//! between the frames of a fragmented data message without disturbing it.
//!
//! Observers see an unfinished message on every frame it receives, so they get a frame-accurate
//! view of the traffic. Only [`Message::is_finished`] tells them a message is complete.

use crate::frame::{Frame, FrameHeader, Opcode};
use base64::Engine;
use serde::{Deserialize, Serialize};
use std::borrow::Cow;

/// Shown in place of a text payload that is not valid UTF-8.
pub const INVALID_UTF8: &str = "<invalid UTF-8>";

/// Which way a message travels through the relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    /// From the client (the browser side) to the server.
    Outgoing,
    /// From the server to the client.
    Incoming,
}

impl Direction {
    pub fn is_outgoing(self) -> bool {
        self == Direction::Outgoing
    }

    pub fn opposite(self) -> Direction {
        match self {
            Direction::Outgoing => Direction::Incoming,
            Direction::Incoming => Direction::Outgoing,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Direction::Outgoing => "outgoing",
            Direction::Incoming => "incoming",
        }
    }
}

/// A decoded payload, chosen by opcode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload<'a> {
    Text(Cow<'a, str>),
    Binary(&'a [u8]),
}

/// One logical message, possibly still being assembled.
#[derive(Debug, Clone)]
pub struct Message {
    channel_id: u64,
    message_id: u64,
    direction: Direction,
    opcode: Opcode,
    /// Headers of every frame received so far, in order.
    frames: Vec<FrameHeader>,
    /// Unmasked payload accumulated over all frames.
    payload: Vec<u8>,
    /// The frame most recently added, with its wire bytes.
    current: Frame,
    /// How many bytes at the end of `payload` belong to `current`.
    current_span: usize,
    /// Replacement payload for `current`, set by an observer.
    rewrite: Option<Vec<u8>>,
    finished: bool,
    timestamp: Option<u64>,
}

impl Message {
    pub(crate) fn start(channel_id: u64, message_id: u64, direction: Direction, frame: Frame) -> Message {
        let fin = frame.fin();
        let mut message = Message {
            channel_id,
            message_id,
            direction,
            opcode: frame.opcode(),
            frames: vec![frame.header().clone()],
            payload: frame.payload().to_vec(),
            current_span: frame.payload().len(),
            current: frame,
            rewrite: None,
            finished: false,
            timestamp: None,
        };
        if fin {
            message.finish();
        }
        message
    }

    /// A message that stands alone no matter what its FIN bit says.
    fn standalone(channel_id: u64, message_id: u64, direction: Direction, frame: Frame) -> Message {
        let mut message = Message::start(channel_id, message_id, direction, frame);
        message.finish();
        message
    }

    fn append(&mut self, frame: Frame) {
        self.rewrite = None;
        self.frames.push(frame.header().clone());
        self.payload.extend_from_slice(frame.payload());
        self.current_span = frame.payload().len();
        let fin = frame.fin();
        self.current = frame;
        if fin {
            self.finish();
        }
    }

    fn finish(&mut self) {
        self.finished = true;
        self.timestamp = Some(crate::unix_millis());
    }

    pub fn channel_id(&self) -> u64 {
        self.channel_id
    }

    /// Monotonic within a channel.
    pub fn message_id(&self) -> u64 {
        self.message_id
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn is_outgoing(&self) -> bool {
        self.direction.is_outgoing()
    }

    /// The opcode of the first frame. Fixed for the whole message.
    pub fn opcode(&self) -> Opcode {
        self.opcode
    }

    /// True iff the last frame added had FIN set.
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Milliseconds since the Unix epoch at which the message completed.
    pub fn timestamp(&self) -> Option<u64> {
        self.timestamp
    }

    pub fn frames(&self) -> &[FrameHeader] {
        &self.frames
    }

    /// The frame that triggered the current notification.
    pub fn current_frame(&self) -> &Frame {
        &self.current
    }

    pub fn payload_bytes(&self) -> &[u8] {
        &self.payload
    }

    pub fn payload_len(&self) -> usize {
        self.payload.len()
    }

    /// The payload decoded according to the opcode.
    ///
    /// Text messages decode as UTF-8; invalid sequences yield [`INVALID_UTF8`] rather than an
    /// error. Everything else is raw bytes.
    pub fn payload(&self) -> Payload<'_> {
        match self.opcode {
            Opcode::Text => Payload::Text(match std::str::from_utf8(&self.payload) {
                Ok(text) => Cow::Borrowed(text),
                Err(_) => Cow::Owned(INVALID_UTF8.to_owned()),
            }),
            _ => Payload::Binary(&self.payload),
        }
    }

    /// A best-effort textual view, for display.
    pub fn readable_payload(&self) -> Cow<'_, str> {
        match self.payload() {
            Payload::Text(text) => text,
            Payload::Binary(bytes) => String::from_utf8_lossy(bytes),
        }
    }

    /// The status code of a close message, if it carries one.
    pub fn close_code(&self) -> Option<u16> {
        if self.opcode != Opcode::Close || self.payload.len() < 2 {
            return None;
        }
        Some(u16::from_be_bytes([self.payload[0], self.payload[1]]))
    }

    /// Replaces the payload of the current frame.
    ///
    /// The relay then forwards a re-encoded copy of the current frame (same FIN, RSV, opcode
    /// and mask key) carrying `payload`. Earlier frames of a fragmented message have already
    /// been forwarded and are not affected.
    pub fn replace_frame_payload(&mut self, payload: Vec<u8>) {
        let keep = self.payload.len() - self.current_span;
        self.payload.truncate(keep);
        self.payload.extend_from_slice(&payload);
        self.current_span = payload.len();
        self.rewrite = Some(payload);
    }

    /// Whether an observer rewrote the current frame.
    pub fn is_rewritten(&self) -> bool {
        self.rewrite.is_some()
    }

    /// The bytes to forward for the current frame.
    pub(crate) fn wire_bytes(&self) -> Cow<'_, [u8]> {
        match &self.rewrite {
            Some(payload) => Cow::Owned(self.current.with_payload(payload).raw().to_vec()),
            None => Cow::Borrowed(self.current.raw()),
        }
    }

    /// A serializable snapshot, for storage.
    pub fn to_record(&self) -> MessageRecord {
        let (payload, encoding) = match self.payload() {
            Payload::Text(text) => (text.into_owned(), PayloadEncoding::Utf8),
            Payload::Binary(bytes) => (
                base64::prelude::BASE64_STANDARD.encode(bytes),
                PayloadEncoding::Base64,
            ),
        };
        MessageRecord {
            channel_id: self.channel_id,
            message_id: self.message_id,
            timestamp: self.timestamp,
            opcode: self.opcode.as_u8(),
            readable_opcode: self.opcode.name().to_owned(),
            outgoing: self.is_outgoing(),
            finished: self.finished,
            payload_length: self.payload.len() as u64,
            payload,
            payload_encoding: encoding,
        }
    }
}

/// How [`MessageRecord::payload`] is encoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PayloadEncoding {
    Utf8,
    Base64,
}

/// A flattened, serializable view of a [`Message`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageRecord {
    pub channel_id: u64,
    pub message_id: u64,
    pub timestamp: Option<u64>,
    pub opcode: u8,
    pub readable_opcode: String,
    pub outgoing: bool,
    pub finished: bool,
    pub payload_length: u64,
    pub payload: String,
    pub payload_encoding: PayloadEncoding,
}

/// What the assembler made of a frame.
#[derive(Debug)]
pub enum Assembled<'a> {
    /// The frame extended (or started) a message that is still unfinished. The message stays
    /// in the assembler.
    Partial(&'a mut Message),
    /// The frame completed a message, or was a standalone control frame.
    Complete(Message),
    /// A continuation frame with nothing to continue. Always forwarded.
    Orphan(Message),
    /// The frame belongs to a message too large to assemble; forward it untouched.
    PassThrough(Frame),
}

impl Assembled<'_> {
    /// The message to notify observers about, if any.
    pub fn message_mut(&mut self) -> Option<&mut Message> {
        match self {
            Assembled::Partial(message) => Some(message),
            Assembled::Complete(message) | Assembled::Orphan(message) => Some(message),
            Assembled::PassThrough(_) => None,
        }
    }
}

/// Reassembles messages for one direction of one channel.
#[derive(Debug)]
pub struct MessageAssembler {
    channel_id: u64,
    direction: Direction,
    current: Option<Message>,
    /// Set while the frames of an oversized message are streaming past.
    pass_through: bool,
    /// Largest payload a message may accumulate before it is passed through instead.
    max_payload: u64,
}

impl MessageAssembler {
    pub fn new(channel_id: u64, direction: Direction, max_payload: u64) -> MessageAssembler {
        MessageAssembler {
            channel_id,
            direction,
            current: None,
            pass_through: false,
            max_payload,
        }
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// Whether an unfinished data message is in progress.
    pub fn is_assembling(&self) -> bool {
        self.current.is_some()
    }

    /// Feeds one frame.
    ///
    /// `next_id` is called once for every new message the frame starts.
    pub fn on_frame(&mut self, frame: Frame, next_id: impl FnOnce() -> u64) -> Assembled<'_> {
        let opcode = frame.opcode();
        if opcode.is_control() {
            return Assembled::Complete(Message::standalone(
                self.channel_id,
                next_id(),
                self.direction,
                frame,
            ));
        }

        if opcode == Opcode::Continuation {
            if self.pass_through {
                self.pass_through = !frame.fin();
                return Assembled::PassThrough(frame);
            }
            return match self.current.take() {
                Some(message)
                    if message.payload_len() as u64 + frame.payload().len() as u64 > self.max_payload =>
                {
                    logwise::warn_sync!(
                        "Message {message} on channel {channel} grew past {limit} bytes; relaying the rest untouched",
                        message = message.message_id(),
                        channel = self.channel_id,
                        limit = self.max_payload
                    );
                    self.pass_through = !frame.fin();
                    Assembled::PassThrough(frame)
                }
                Some(mut message) => {
                    message.append(frame);
                    if message.is_finished() {
                        Assembled::Complete(message)
                    } else {
                        Assembled::Partial(self.current.insert(message))
                    }
                }
                None => {
                    let message_id = next_id();
                    logwise::warn_sync!(
                        "Continuation frame without a message to continue on channel {channel} ({direction}); relaying it as message {message}",
                        channel = self.channel_id,
                        direction = logwise::privacy::LogIt(&self.direction),
                        message = message_id
                    );
                    Assembled::Orphan(Message::standalone(
                        self.channel_id,
                        message_id,
                        self.direction,
                        frame,
                    ))
                }
            };
        }

        if let Some(abandoned) = self.current.take() {
            logwise::warn_sync!(
                "New {opcode} message on channel {channel} ({direction}) before message {abandoned} finished; discarding it",
                opcode = logwise::privacy::LogIt(&opcode),
                channel = self.channel_id,
                direction = logwise::privacy::LogIt(&self.direction),
                abandoned = abandoned.message_id()
            );
        }
        self.pass_through = false;
        let message = Message::start(self.channel_id, next_id(), self.direction, frame);
        if message.is_finished() {
            Assembled::Complete(message)
        } else {
            Assembled::Partial(self.current.insert(message))
        }
    }

    /// Records that a frame too large to buffer is streaming past.
    ///
    /// A data message containing such a frame can't be reassembled, so the rest of it is
    /// passed through as well.
    pub fn on_oversized(&mut self, header: &FrameHeader) {
        if header.opcode().is_control() {
            return;
        }
        if let Some(abandoned) = self.current.take() {
            logwise::warn_sync!(
                "Message {message} on channel {channel} grew too large to assemble; relaying the rest untouched",
                message = abandoned.message_id(),
                channel = self.channel_id
            );
        }
        self.pass_through = !header.fin();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(fin: bool, opcode: Opcode, payload: &[u8]) -> Frame {
        Frame::encode(fin, 0, opcode, Some([9, 8, 7, 6]), payload)
    }

    struct Ids(u64);

    impl Ids {
        fn next(&mut self) -> impl FnOnce() -> u64 + '_ {
            move || {
                self.0 += 1;
                self.0
            }
        }
    }

    #[test]
    fn single_frame_text() {
        let mut assembler = MessageAssembler::new(1, Direction::Outgoing, u64::MAX);
        let mut ids = Ids(0);
        match assembler.on_frame(frame(true, Opcode::Text, b"hi"), ids.next()) {
            Assembled::Complete(message) => {
                assert_eq!(message.payload(), Payload::Text("hi".into()));
                assert_eq!(message.opcode(), Opcode::Text);
                assert!(message.is_outgoing());
                assert!(message.is_finished());
                assert!(message.timestamp().is_some());
                assert_eq!(message.message_id(), 1);
            }
            other => panic!("expected a complete message, got {other:?}"),
        }
        assert!(!assembler.is_assembling());
    }

    #[test]
    fn fragmented_message_reassembles() {
        let mut assembler = MessageAssembler::new(1, Direction::Incoming, u64::MAX);
        let mut ids = Ids(0);
        let chunks: [&[u8]; 4] = [b"The ", b"quick ", b"brown ", b"fox"];
        let mut finished = Vec::new();
        for (i, chunk) in chunks.iter().enumerate() {
            let opcode = if i == 0 { Opcode::Text } else { Opcode::Continuation };
            let fin = i == chunks.len() - 1;
            match assembler.on_frame(frame(fin, opcode, chunk), ids.next()) {
                Assembled::Partial(message) => {
                    assert!(!message.is_finished());
                    assert_eq!(message.frames().len(), i + 1);
                    assert_eq!(message.current_frame().payload(), *chunk);
                }
                Assembled::Complete(message) => finished.push(message),
                other => panic!("unexpected {other:?}"),
            }
        }
        assert_eq!(finished.len(), 1);
        let message = &finished[0];
        assert_eq!(message.readable_payload(), "The quick brown fox");
        assert_eq!(message.frames().len(), 4);
        assert_eq!(message.opcode(), Opcode::Text);
        assert_eq!(ids.0, 1);
        assert!(!assembler.is_assembling());
    }

    #[test]
    fn ping_between_continuations() {
        let mut assembler = MessageAssembler::new(3, Direction::Outgoing, u64::MAX);
        let mut ids = Ids(0);
        assert!(matches!(
            assembler.on_frame(frame(false, Opcode::Text, b"hel"), ids.next()),
            Assembled::Partial(_)
        ));
        match assembler.on_frame(frame(true, Opcode::Ping, b"are you there"), ids.next()) {
            Assembled::Complete(ping) => {
                assert_eq!(ping.opcode(), Opcode::Ping);
                assert_eq!(ping.message_id(), 2);
                assert_eq!(ping.payload_bytes(), b"are you there");
            }
            other => panic!("expected the ping on its own, got {other:?}"),
        }
        assert!(assembler.is_assembling());
        match assembler.on_frame(frame(true, Opcode::Continuation, b"lo"), ids.next()) {
            Assembled::Complete(text) => {
                assert_eq!(text.message_id(), 1);
                assert_eq!(text.payload(), Payload::Text("hello".into()));
            }
            other => panic!("expected the text to complete, got {other:?}"),
        }
    }

    #[test]
    fn continuation_without_start_is_an_orphan() {
        let mut assembler = MessageAssembler::new(1, Direction::Incoming, u64::MAX);
        let mut ids = Ids(0);
        match assembler.on_frame(frame(false, Opcode::Continuation, b"??"), ids.next()) {
            Assembled::Orphan(message) => {
                assert!(message.is_finished());
                assert_eq!(message.opcode(), Opcode::Continuation);
            }
            other => panic!("expected an orphan, got {other:?}"),
        }
        assert!(!assembler.is_assembling());
    }

    #[test]
    fn new_message_abandons_unfinished_one() {
        let mut assembler = MessageAssembler::new(1, Direction::Incoming, u64::MAX);
        let mut ids = Ids(0);
        let _ = assembler.on_frame(frame(false, Opcode::Binary, &[1, 2]), ids.next());
        match assembler.on_frame(frame(true, Opcode::Text, b"fresh"), ids.next()) {
            Assembled::Complete(message) => {
                assert_eq!(message.message_id(), 2);
                assert_eq!(message.readable_payload(), "fresh");
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(!assembler.is_assembling());
    }

    #[test]
    fn oversized_frames_switch_to_pass_through() {
        let mut assembler = MessageAssembler::new(1, Direction::Incoming, u64::MAX);
        let mut ids = Ids(0);
        let _ = assembler.on_frame(frame(false, Opcode::Binary, &[1]), ids.next());
        let big = Frame::encode(false, 0, Opcode::Continuation, None, &[0; 10]);
        assembler.on_oversized(big.header());
        assert!(!assembler.is_assembling());
        assert!(matches!(
            assembler.on_frame(frame(false, Opcode::Continuation, &[2]), ids.next()),
            Assembled::PassThrough(_)
        ));
        assert!(matches!(
            assembler.on_frame(frame(true, Opcode::Continuation, &[3]), ids.next()),
            Assembled::PassThrough(_)
        ));
        assert!(matches!(
            assembler.on_frame(frame(true, Opcode::Continuation, &[4]), ids.next()),
            Assembled::Orphan(_)
        ));
    }

    #[test]
    fn fragments_stop_assembling_at_the_limit() {
        let mut assembler = MessageAssembler::new(1, Direction::Outgoing, 16);
        let mut ids = Ids(0);
        assert!(matches!(
            assembler.on_frame(frame(false, Opcode::Binary, &[0; 10]), ids.next()),
            Assembled::Partial(_)
        ));
        assert!(matches!(
            assembler.on_frame(frame(false, Opcode::Continuation, &[1; 6]), ids.next()),
            Assembled::Partial(message) if message.payload_len() == 16
        ));
        for _ in 0..100 {
            assert!(matches!(
                assembler.on_frame(frame(false, Opcode::Continuation, &[2; 10]), ids.next()),
                Assembled::PassThrough(_)
            ));
            assert!(!assembler.is_assembling());
        }
        assert!(matches!(
            assembler.on_frame(frame(true, Opcode::Continuation, &[3; 10]), ids.next()),
            Assembled::PassThrough(_)
        ));
        assert!(matches!(
            assembler.on_frame(frame(true, Opcode::Text, b"next"), ids.next()),
            Assembled::Complete(message) if message.readable_payload() == "next"
        ));
    }

    #[test]
    fn invalid_utf8_text_uses_sentinel() {
        let message = Message::start(1, 1, Direction::Incoming, frame(true, Opcode::Text, &[0xff, 0xfe]));
        assert_eq!(message.payload(), Payload::Text(INVALID_UTF8.into()));
        let binary = Message::start(1, 2, Direction::Incoming, frame(true, Opcode::Binary, b"ok\xff"));
        assert_eq!(binary.payload(), Payload::Binary(b"ok\xff"));
        assert_eq!(binary.readable_payload(), "ok\u{FFFD}");
    }

    #[test]
    fn rewrite_replaces_only_current_frame() {
        let mut assembler = MessageAssembler::new(1, Direction::Outgoing, u64::MAX);
        let mut ids = Ids(0);
        let _ = assembler.on_frame(frame(false, Opcode::Text, b"abc"), ids.next());
        let original = frame(true, Opcode::Continuation, b"def");
        match assembler.on_frame(original.clone(), ids.next()) {
            Assembled::Complete(mut message) => {
                message.replace_frame_payload(b"XY".to_vec());
                message.replace_frame_payload(b"XYZW".to_vec());
                assert_eq!(message.readable_payload(), "abcXYZW");
                let wire = message.wire_bytes().into_owned();
                let mut rest = &wire[1..];
                let rewritten = Frame::read(wire[0], &mut rest).unwrap();
                assert_eq!(rewritten.payload(), b"XYZW");
                assert!(rewritten.fin());
                assert_eq!(rewritten.opcode(), Opcode::Continuation);
                assert_eq!(rewritten.header().mask_key(), original.header().mask_key());
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn records_encode_binary_as_base64() {
        let message = Message::start(4, 9, Direction::Incoming, frame(true, Opcode::Binary, &[0, 1, 2]));
        let record = message.to_record();
        assert_eq!(record.payload, "AAEC");
        assert_eq!(record.payload_encoding, PayloadEncoding::Base64);
        assert_eq!(record.readable_opcode, "BINARY");
        assert!(!record.outgoing);

        let close = Message::start(4, 10, Direction::Incoming, frame(true, Opcode::Close, &[0x03, 0xE8]));
        assert_eq!(close.close_code(), Some(1000));
    }
}
