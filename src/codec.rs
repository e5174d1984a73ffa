//! Framed codec for the Gearman wire format.
//!
//! Implements `tokio_util::codec::{Decoder, Encoder}` over `BytesMut` so a
//! connection can wrap its TCP stream in `Framed`. Pure framing: no I/O,
//! no protocol state. Decoding is pull-based — only complete frames are
//! consumed, and a trailing partial frame stays in the buffer for the next
//! read.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::{Error, ProtocolError};
use crate::packet::{Packet, PacketMagic, PacketType};

/// Upper bound on a frame's argument section.
///
/// Guards against reading gigabytes off a corrupt or hostile stream; real
/// job payloads sit far below this.
pub const MAX_FRAME_LEN: usize = 64 * 1024 * 1024;

const HEADER_LEN: usize = 12;

/// Stateless encoder/decoder for Gearman frames.
#[derive(Debug, Default)]
pub struct PacketCodec;

impl Decoder for PacketCodec {
    type Item = Packet;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Packet>, Error> {
        if src.len() < HEADER_LEN {
            return Ok(None);
        }

        let magic = PacketMagic::from_bytes([src[0], src[1], src[2], src[3]])?;
        let code = u32::from_be_bytes([src[4], src[5], src[6], src[7]]);
        let len = u32::from_be_bytes([src[8], src[9], src[10], src[11]]) as usize;

        if len > MAX_FRAME_LEN {
            return Err(ProtocolError::FrameTooLarge {
                size: len,
                max: MAX_FRAME_LEN,
            }
            .into());
        }

        if src.len() < HEADER_LEN + len {
            // Partial frame; reserve what the rest needs and wait
            src.reserve(HEADER_LEN + len - src.len());
            return Ok(None);
        }

        let kind = PacketType::from_code(code)?;
        src.advance(HEADER_LEN);
        let body = src.split_to(len).freeze();
        let args = split_args(kind, body)?;

        tracing::trace!(kind = ?kind, ?magic, len, "decoded frame");
        Ok(Some(Packet { magic, kind, args }))
    }
}

impl Encoder<Packet> for PacketCodec {
    type Error = Error;

    fn encode(&mut self, packet: Packet, dst: &mut BytesMut) -> Result<(), Error> {
        let expected = packet.kind.arg_count();
        if packet.args.len() != expected {
            return Err(ProtocolError::ArgumentCount {
                kind: packet.kind,
                expected,
                got: packet.args.len(),
            }
            .into());
        }

        // NUL is the separator, so only the final argument may contain it
        for (index, arg) in packet.args.iter().enumerate() {
            if index + 1 < packet.args.len() && arg.contains(&0) {
                return Err(ProtocolError::EmbeddedNul {
                    kind: packet.kind,
                    index,
                }
                .into());
            }
        }

        let body_len: usize =
            packet.args.iter().map(Bytes::len).sum::<usize>() + packet.args.len().saturating_sub(1);
        if body_len > MAX_FRAME_LEN {
            return Err(ProtocolError::FrameTooLarge {
                size: body_len,
                max: MAX_FRAME_LEN,
            }
            .into());
        }

        tracing::trace!(kind = ?packet.kind, magic = ?packet.magic, len = body_len, "encoding frame");

        dst.reserve(HEADER_LEN + body_len);
        dst.put_slice(&packet.magic.as_bytes());
        dst.put_u32(packet.kind.code());
        dst.put_u32(body_len as u32);
        for (index, arg) in packet.args.iter().enumerate() {
            if index > 0 {
                dst.put_u8(0);
            }
            dst.put_slice(arg);
        }
        Ok(())
    }
}

/// Split an argument section on NUL, `arg_count - 1` times; the remainder
/// (embedded NULs included) is the final argument.
fn split_args(kind: PacketType, body: Bytes) -> Result<Vec<Bytes>, ProtocolError> {
    let expected = kind.arg_count();
    if expected == 0 {
        if !body.is_empty() {
            return Err(ProtocolError::ArgumentCount {
                kind,
                expected,
                got: 1,
            });
        }
        return Ok(Vec::new());
    }

    let mut args = Vec::with_capacity(expected);
    let mut rest = body;
    for _ in 0..expected - 1 {
        let sep = rest
            .iter()
            .position(|&b| b == 0)
            .ok_or(ProtocolError::ArgumentCount {
                kind,
                expected,
                got: args.len() + 1,
            })?;
        args.push(rest.split_to(sep));
        rest.advance(1);
    }
    args.push(rest);
    Ok(args)
}
