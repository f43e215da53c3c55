//! RFC 6455 frame codec.
//!
//! This module reads and writes single WebSocket frames. It performs no buffering of its own:
//! a frame header is decoded from a blocking stream by reading exactly the bytes its length
//! fields call for, and the payload is read (or streamed) separately so that the caller can
//! decide what to do with very large frames before any of the payload is pulled off the wire.
//!
//! # Wire format
//!
//! ```text
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-------+-+-------------+-------------------------------+
//! |F|R|R|R| opcode|M| Payload len |    Extended payload length    |
//! |I|S|S|S|  (4)  |A|     (7)     |             (16/64)           |
//! |N|V|V|V|       |S|             |   (if payload len==126/127)   |
//! | |1|2|3|       |K|             |                               |
//! +-+-+-+-+-------+-+-------------+ - - - - - - - - - - - - - - - +
//! |     Extended payload length continued, if payload len == 127  |
//! + - - - - - - - - - - - - - - - +-------------------------------+
//! |                               |Masking-key, if MASK set to 1  |
//! +-------------------------------+-------------------------------+
//! | Masking-key (continued)       |          Payload Data         |
//! +-------------------------------- - - - - - - - - - - - - - - - +
//! ```
//!
//! # Transparency
//!
//! Every decoded [`Frame`] retains the exact bytes it was decoded from ([`Frame::raw`]), so the
//! relay can forward a frame without re-encoding or re-masking it. RSV bits and reserved opcodes
//! are kept as-is; this codec does not interpret extensions.

use serde::{Deserialize, Serialize};
use std::io::{Read, Write};

const FIN: u8 = 0b1000_0000;
const RSV: u8 = 0b0111_0000;
const OPCODE: u8 = 0b0000_1111;
const MASK_ON: u8 = 0b1000_0000;
const LENGTH: u8 = 0b0111_1111;
/// 7-bit length value announcing a 16-bit extended length.
const LENGTH_16: u8 = 126;
/// 7-bit length value announcing a 64-bit extended length.
const LENGTH_64: u8 = 127;
/// Largest payload a control frame may carry.
pub const MAX_CONTROL_PAYLOAD: u64 = 125;

/// The 4-bit frame opcode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Opcode {
    Continuation,
    Text,
    Binary,
    Close,
    Ping,
    Pong,
    /// Opcodes 0x3-0x7 and 0xB-0xF. Relayed uninterpreted.
    Reserved(u8),
}

impl Opcode {
    /// Decodes the low four bits of `value`.
    pub fn from_u8(value: u8) -> Opcode {
        match value & OPCODE {
            0x0 => Opcode::Continuation,
            0x1 => Opcode::Text,
            0x2 => Opcode::Binary,
            0x8 => Opcode::Close,
            0x9 => Opcode::Ping,
            0xA => Opcode::Pong,
            other => Opcode::Reserved(other),
        }
    }

    pub fn as_u8(self) -> u8 {
        match self {
            Opcode::Continuation => 0x0,
            Opcode::Text => 0x1,
            Opcode::Binary => 0x2,
            Opcode::Close => 0x8,
            Opcode::Ping => 0x9,
            Opcode::Pong => 0xA,
            Opcode::Reserved(value) => value & OPCODE,
        }
    }

    /// Control opcodes are `0x8`-`0xF`. They are never fragmented but may interleave with the
    /// frames of a fragmented data message.
    pub fn is_control(self) -> bool {
        self.as_u8() & 0x8 != 0
    }

    /// A human-readable name, as shown in traffic views.
    pub fn name(self) -> &'static str {
        match self {
            Opcode::Continuation => "CONTINUATION",
            Opcode::Text => "TEXT",
            Opcode::Binary => "BINARY",
            Opcode::Close => "CLOSE",
            Opcode::Ping => "PING",
            Opcode::Pong => "PONG",
            Opcode::Reserved(_) => "RESERVED",
        }
    }
}

/// Errors raised while reading frames.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The underlying stream failed or ended mid-frame.
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
    /// The announced payload does not fit in memory on this platform.
    #[error("frame payload of {0} bytes cannot be buffered")]
    TooLarge(u64),
}

/// A protocol violation noticed while decoding a header.
///
/// Anomalies are reported, never enforced: the frame is still relayed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Anomaly {
    /// An extended length field was used for a length that fits a shorter encoding.
    NonMinimalLength,
    /// The most significant bit of a 64-bit length was set.
    LengthHighBitSet,
    /// A control frame without FIN.
    FragmentedControl,
    /// A control frame with more than 125 bytes of payload.
    ControlTooLong,
}

/// A decoded frame header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameHeader {
    fin: bool,
    rsv: u8,
    opcode: Opcode,
    mask_key: Option<[u8; 4]>,
    payload_len: u64,
    /// The exact header bytes as they appeared on the wire.
    bytes: Vec<u8>,
}

impl FrameHeader {
    /// Decodes a header whose first byte has already been consumed.
    ///
    /// Reads one length byte, then 0, 2 or 8 extended length bytes, then the 4 byte mask key
    /// if the mask bit is set. `read_exact` loops over partial reads, so a slow peer simply
    /// makes this call block longer.
    pub fn read<R: Read + ?Sized>(first: u8, reader: &mut R) -> Result<FrameHeader, Error> {
        let mut bytes = Vec::with_capacity(14);
        bytes.push(first);
        let mut second = [0u8; 1];
        reader.read_exact(&mut second)?;
        bytes.push(second[0]);

        let masked = second[0] & MASK_ON != 0;
        let payload_len = match second[0] & LENGTH {
            LENGTH_16 => {
                let mut len = [0u8; 2];
                reader.read_exact(&mut len)?;
                bytes.extend_from_slice(&len);
                u16::from_be_bytes(len) as u64
            }
            LENGTH_64 => {
                let mut len = [0u8; 8];
                reader.read_exact(&mut len)?;
                bytes.extend_from_slice(&len);
                u64::from_be_bytes(len)
            }
            short => short as u64,
        };
        let mask_key = if masked {
            let mut key = [0u8; 4];
            reader.read_exact(&mut key)?;
            bytes.extend_from_slice(&key);
            Some(key)
        } else {
            None
        };

        Ok(FrameHeader {
            fin: first & FIN != 0,
            rsv: (first & RSV) >> 4,
            opcode: Opcode::from_u8(first),
            mask_key,
            payload_len,
            bytes,
        })
    }

    /// Builds a header using the minimal length encoding.
    fn encode(fin: bool, rsv: u8, opcode: Opcode, mask_key: Option<[u8; 4]>, len: u64) -> FrameHeader {
        let mut bytes = Vec::with_capacity(14);
        let fin_bit = if fin { FIN } else { 0 };
        bytes.push(fin_bit | ((rsv << 4) & RSV) | opcode.as_u8());
        let mask_bit = if mask_key.is_some() { MASK_ON } else { 0 };
        if len < LENGTH_16 as u64 {
            bytes.push(mask_bit | len as u8);
        } else if len <= u16::MAX as u64 {
            bytes.push(mask_bit | LENGTH_16);
            bytes.extend_from_slice(&(len as u16).to_be_bytes());
        } else {
            bytes.push(mask_bit | LENGTH_64);
            bytes.extend_from_slice(&len.to_be_bytes());
        }
        if let Some(key) = mask_key {
            bytes.extend_from_slice(&key);
        }
        FrameHeader {
            fin,
            rsv: rsv & 0b111,
            opcode,
            mask_key,
            payload_len: len,
            bytes,
        }
    }

    pub fn fin(&self) -> bool {
        self.fin
    }

    /// RSV1-RSV3 as a 3-bit value (RSV1 is the high bit).
    pub fn rsv(&self) -> u8 {
        self.rsv
    }

    pub fn opcode(&self) -> Opcode {
        self.opcode
    }

    pub fn masked(&self) -> bool {
        self.mask_key.is_some()
    }

    pub fn mask_key(&self) -> Option<[u8; 4]> {
        self.mask_key
    }

    pub fn payload_len(&self) -> u64 {
        self.payload_len
    }

    /// The header exactly as it was read (or encoded).
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Protocol violations visible in this header.
    pub fn anomalies(&self) -> Vec<Anomaly> {
        let mut anomalies = Vec::new();
        match self.bytes.get(1).map(|b| b & LENGTH) {
            Some(LENGTH_16) if self.payload_len < LENGTH_16 as u64 => {
                anomalies.push(Anomaly::NonMinimalLength)
            }
            Some(LENGTH_64) => {
                if self.payload_len >> 63 != 0 {
                    anomalies.push(Anomaly::LengthHighBitSet);
                } else if self.payload_len <= u16::MAX as u64 {
                    anomalies.push(Anomaly::NonMinimalLength);
                }
            }
            _ => {}
        }
        if self.opcode.is_control() {
            if !self.fin {
                anomalies.push(Anomaly::FragmentedControl);
            }
            if self.payload_len > MAX_CONTROL_PAYLOAD {
                anomalies.push(Anomaly::ControlTooLong);
            }
        }
        anomalies
    }
}

/// One complete frame: header, payload, and the wire bytes it came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    header: FrameHeader,
    /// Header followed by the payload exactly as sent (still masked, if it was masked).
    raw: Vec<u8>,
    /// Unmasked payload.
    payload: Vec<u8>,
}

impl Frame {
    /// Reads a whole frame whose first byte has already been consumed.
    pub fn read<R: Read + ?Sized>(first: u8, reader: &mut R) -> Result<Frame, Error> {
        let header = FrameHeader::read(first, reader)?;
        Frame::read_payload(header, reader)
    }

    /// Reads the payload announced by `header`.
    ///
    /// The payload is read through `take` rather than into a buffer pre-sized from the header,
    /// so a peer that announces a huge length and then stalls does not cost us the allocation.
    pub fn read_payload<R: Read + ?Sized>(header: FrameHeader, reader: &mut R) -> Result<Frame, Error> {
        let len = usize::try_from(header.payload_len).map_err(|_| Error::TooLarge(header.payload_len))?;
        let mut raw = Vec::with_capacity(header.bytes.len() + len.min(64 * 1024));
        raw.extend_from_slice(&header.bytes);
        let read = reader.take(header.payload_len).read_to_end(&mut raw)?;
        if read != len {
            return Err(Error::IoError(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                format!("frame ended after {read} of {len} payload bytes"),
            )));
        }
        let mut payload = raw[header.bytes.len()..].to_vec();
        if let Some(key) = header.mask_key {
            apply_mask(&mut payload, key, 0);
        }
        Ok(Frame {
            header,
            raw,
            payload,
        })
    }

    /// Encodes a new frame around `payload`.
    ///
    /// `payload` is given unmasked; when `mask_key` is present the wire copy is masked with it.
    pub fn encode(fin: bool, rsv: u8, opcode: Opcode, mask_key: Option<[u8; 4]>, payload: &[u8]) -> Frame {
        let header = FrameHeader::encode(fin, rsv, opcode, mask_key, payload.len() as u64);
        let mut raw = Vec::with_capacity(header.bytes.len() + payload.len());
        raw.extend_from_slice(&header.bytes);
        let start = raw.len();
        raw.extend_from_slice(payload);
        if let Some(key) = mask_key {
            apply_mask(&mut raw[start..], key, 0);
        }
        Frame {
            header,
            raw,
            payload: payload.to_vec(),
        }
    }

    /// Re-encodes this frame with a different payload, keeping FIN, RSV, opcode and mask key.
    pub fn with_payload(&self, payload: &[u8]) -> Frame {
        Frame::encode(
            self.header.fin,
            self.header.rsv,
            self.header.opcode,
            self.header.mask_key,
            payload,
        )
    }

    pub fn header(&self) -> &FrameHeader {
        &self.header
    }

    pub fn fin(&self) -> bool {
        self.header.fin
    }

    pub fn opcode(&self) -> Opcode {
        self.header.opcode
    }

    /// The unmasked payload.
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// The exact wire bytes of this frame.
    pub fn raw(&self) -> &[u8] {
        &self.raw
    }
}

/// XORs `data` with `key`, as if `data` started `offset` bytes into the payload.
///
/// Masking and unmasking are the same operation.
pub fn apply_mask(data: &mut [u8], key: [u8; 4], offset: usize) {
    for (i, byte) in data.iter_mut().enumerate() {
        *byte ^= key[(offset + i) % 4];
    }
}

/// Copies exactly `len` payload bytes from `reader` to `writer` without buffering them.
///
/// Used for frames too large to hold in memory.
pub fn copy_payload<R: Read + ?Sized, W: Write + ?Sized>(
    len: u64,
    reader: &mut R,
    writer: &mut W,
) -> std::io::Result<()> {
    let copied = std::io::copy(&mut reader.take(len), writer)?;
    if copied != len {
        return Err(std::io::Error::new(
            std::io::ErrorKind::UnexpectedEof,
            format!("frame ended after {copied} of {len} payload bytes"),
        ));
    }
    Ok(())
}
