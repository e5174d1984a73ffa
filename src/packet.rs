//! Wire-level message types for the Gearman binary protocol.
//!
//! A frame is a 12-byte header (magic, packet-type code, argument-section
//! length) followed by NUL-separated arguments. The final argument of a
//! packet is sized by the frame length rather than a terminator, so it may
//! carry arbitrary bytes; every other argument must be NUL-free. The
//! per-type argument counts defined here drive that split in the codec.

use std::fmt;

use bytes::Bytes;

use crate::error::ProtocolError;

/// Frame direction marker, the first four bytes of every frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketMagic {
    /// `\0REQ` — client/worker to server
    Request,
    /// `\0RES` — server to client/worker
    Response,
}

impl PacketMagic {
    pub(crate) const REQUEST: [u8; 4] = *b"\0REQ";
    pub(crate) const RESPONSE: [u8; 4] = *b"\0RES";

    /// The literal bytes this marker puts on the wire.
    pub fn as_bytes(self) -> [u8; 4] {
        match self {
            PacketMagic::Request => Self::REQUEST,
            PacketMagic::Response => Self::RESPONSE,
        }
    }

    /// Parse the leading four bytes of a frame.
    pub fn from_bytes(bytes: [u8; 4]) -> Result<Self, ProtocolError> {
        match bytes {
            Self::REQUEST => Ok(PacketMagic::Request),
            Self::RESPONSE => Ok(PacketMagic::Response),
            other => Err(ProtocolError::BadMagic(other)),
        }
    }
}

/// Packet types, with their canonical wire codes.
///
/// The full numbering is kept for decoding completeness even where this
/// implementation never emits a type (for example `ResetAbilities`, which
/// the worker expresses as per-function `CantDo` packets).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum PacketType {
    CanDo = 1,
    CantDo = 2,
    ResetAbilities = 3,
    PreSleep = 4,
    Noop = 6,
    SubmitJob = 7,
    JobCreated = 8,
    GrabJob = 9,
    NoJob = 10,
    JobAssign = 11,
    WorkStatus = 12,
    WorkComplete = 13,
    WorkFail = 14,
    GetStatus = 15,
    EchoReq = 16,
    EchoRes = 17,
    SubmitJobBg = 18,
    Error = 19,
    StatusRes = 20,
    SubmitJobHigh = 21,
    SetClientId = 22,
    CanDoTimeout = 23,
    AllYours = 24,
    WorkException = 25,
    OptionReq = 26,
    OptionRes = 27,
    WorkData = 28,
    WorkWarning = 29,
    GrabJobUniq = 30,
    JobAssignUniq = 31,
    SubmitJobHighBg = 32,
    SubmitJobLow = 33,
    SubmitJobLowBg = 34,
}

impl PacketType {
    /// The big-endian code this type puts on the wire.
    pub fn code(self) -> u32 {
        self as u32
    }

    /// Look up a type by wire code.
    pub fn from_code(code: u32) -> Result<Self, ProtocolError> {
        use PacketType::*;
        Ok(match code {
            1 => CanDo,
            2 => CantDo,
            3 => ResetAbilities,
            4 => PreSleep,
            6 => Noop,
            7 => SubmitJob,
            8 => JobCreated,
            9 => GrabJob,
            10 => NoJob,
            11 => JobAssign,
            12 => WorkStatus,
            13 => WorkComplete,
            14 => WorkFail,
            15 => GetStatus,
            16 => EchoReq,
            17 => EchoRes,
            18 => SubmitJobBg,
            19 => Error,
            20 => StatusRes,
            21 => SubmitJobHigh,
            22 => SetClientId,
            23 => CanDoTimeout,
            24 => AllYours,
            25 => WorkException,
            26 => OptionReq,
            27 => OptionRes,
            28 => WorkData,
            29 => WorkWarning,
            30 => GrabJobUniq,
            31 => JobAssignUniq,
            32 => SubmitJobHighBg,
            33 => SubmitJobLow,
            34 => SubmitJobLowBg,
            other => return Err(ProtocolError::UnknownType(other)),
        })
    }

    /// Number of arguments this packet type carries.
    ///
    /// The codec splits the argument section on NUL exactly
    /// `arg_count() - 1` times; the remainder, NULs and all, is the final
    /// argument.
    pub fn arg_count(self) -> usize {
        use PacketType::*;
        match self {
            ResetAbilities | PreSleep | Noop | GrabJob | NoJob | GrabJobUniq | AllYours => 0,
            CanDo | CantDo | JobCreated | WorkFail | GetStatus | EchoReq | EchoRes
            | SetClientId | OptionReq | OptionRes => 1,
            CanDoTimeout | WorkComplete | WorkData | WorkWarning | WorkException | Error => 2,
            SubmitJob | SubmitJobBg | SubmitJobHigh | SubmitJobHighBg | SubmitJobLow
            | SubmitJobLowBg | JobAssign | WorkStatus => 3,
            JobAssignUniq => 4,
            StatusRes => 5,
        }
    }
}

/// One decoded protocol frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    /// Direction marker
    pub magic: PacketMagic,

    /// Packet type
    pub kind: PacketType,

    /// Arguments in wire order; length must match `kind.arg_count()`
    pub args: Vec<Bytes>,
}

impl Packet {
    /// Build a request frame (client/worker to server).
    pub fn request(kind: PacketType, args: impl IntoIterator<Item = Bytes>) -> Self {
        Packet {
            magic: PacketMagic::Request,
            kind,
            args: args.into_iter().collect(),
        }
    }

    /// Build a response frame (server to client/worker).
    pub fn response(kind: PacketType, args: impl IntoIterator<Item = Bytes>) -> Self {
        Packet {
            magic: PacketMagic::Response,
            kind,
            args: args.into_iter().collect(),
        }
    }

    /// Argument by position.
    pub fn arg(&self, index: usize) -> Option<&Bytes> {
        self.args.get(index)
    }

    /// Argument by position, decoded as UTF-8 (handles, function names,
    /// decimal counters are all ASCII on the wire).
    pub(crate) fn arg_utf8(&self, index: usize) -> Result<&str, ProtocolError> {
        let bytes = self.args.get(index).ok_or(ProtocolError::ArgumentCount {
            kind: self.kind,
            expected: self.kind.arg_count(),
            got: self.args.len(),
        })?;
        std::str::from_utf8(bytes).map_err(|_| ProtocolError::MalformedArgument {
            kind: self.kind,
            index,
        })
    }

    /// Argument by position, parsed as an unsigned decimal counter.
    pub(crate) fn arg_u64(&self, index: usize) -> Result<u64, ProtocolError> {
        self.arg_utf8(index)?
            .parse()
            .map_err(|_| ProtocolError::MalformedArgument {
                kind: self.kind,
                index,
            })
    }
}

/// How received payload bytes are surfaced to the caller.
///
/// Encoding is chosen per submission (client side) and per registration
/// (worker side); the two sides of an exchange are independent. The tag
/// travels with the value from the point of creation — it is never
/// inferred later from context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Encoding {
    /// Deliver payloads as raw bytes
    #[default]
    Raw,
    /// Decode payloads as UTF-8 text; invalid UTF-8 is an explicit error
    Utf8,
}

/// A payload value together with its representation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    /// Raw bytes
    Bytes(Bytes),
    /// UTF-8 text
    Text(String),
}

impl Payload {
    /// The wire bytes of this payload.
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Payload::Bytes(b) => b,
            Payload::Text(s) => s.as_bytes(),
        }
    }

    /// Consume into wire bytes.
    pub fn into_bytes(self) -> Bytes {
        match self {
            Payload::Bytes(b) => b,
            Payload::Text(s) => Bytes::from(s),
        }
    }

    /// The text form, if this payload is text.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Payload::Bytes(_) => None,
            Payload::Text(s) => Some(s),
        }
    }

    /// True when the payload carries zero bytes.
    pub fn is_empty(&self) -> bool {
        self.as_bytes().is_empty()
    }

    /// Surface received wire bytes under the configured encoding.
    pub(crate) fn decode(raw: Bytes, encoding: Encoding) -> Result<Self, ProtocolError> {
        match encoding {
            Encoding::Raw => Ok(Payload::Bytes(raw)),
            Encoding::Utf8 => String::from_utf8(raw.to_vec())
                .map(Payload::Text)
                .map_err(|_| ProtocolError::InvalidUtf8),
        }
    }
}

impl From<&str> for Payload {
    fn from(s: &str) -> Self {
        Payload::Text(s.to_owned())
    }
}

impl From<String> for Payload {
    fn from(s: String) -> Self {
        Payload::Text(s)
    }
}

impl From<Vec<u8>> for Payload {
    fn from(b: Vec<u8>) -> Self {
        Payload::Bytes(Bytes::from(b))
    }
}

impl From<&[u8]> for Payload {
    fn from(b: &[u8]) -> Self {
        Payload::Bytes(Bytes::copy_from_slice(b))
    }
}

impl<const N: usize> From<&[u8; N]> for Payload {
    fn from(b: &[u8; N]) -> Self {
        Payload::Bytes(Bytes::copy_from_slice(b))
    }
}

impl From<Bytes> for Payload {
    fn from(b: Bytes) -> Self {
        Payload::Bytes(b)
    }
}

impl fmt::Display for Payload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Payload::Text(s) => f.write_str(s),
            Payload::Bytes(b) => write!(f, "0x{}", hex::encode(b)),
        }
    }
}
