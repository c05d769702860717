//! The 24-byte fixed header and the `framing_extras || extras || key ||
//! value` body that follows it.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

pub const HEADER_LENGTH: usize = 24;

/// Datatype bits that travel in header byte 5.
pub mod datatype {
    pub const JSON: u8 = 0x01;
    pub const SNAPPY: u8 = 0x02;
    pub const XATTR: u8 = 0x04;
}

/// The four magic bytes this codec recognizes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Magic {
    ClassicRequest,
    ClassicResponse,
    AltRequest,
    AltResponse,
    ServerPush,
}

impl Magic {
    pub fn is_alt_framing(self) -> bool {
        matches!(self, Magic::AltRequest | Magic::AltResponse)
    }

    fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0x80 => Some(Magic::ClassicRequest),
            0x81 => Some(Magic::ClassicResponse),
            0x08 => Some(Magic::AltRequest),
            0x18 => Some(Magic::AltResponse),
            0x82 | 0x83 => Some(Magic::ServerPush),
            _ => None,
        }
    }

    fn to_byte(self) -> u8 {
        match self {
            Magic::ClassicRequest => 0x80,
            Magic::ClassicResponse => 0x81,
            Magic::AltRequest => 0x08,
            Magic::AltResponse => 0x18,
            Magic::ServerPush => 0x82,
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("invalid magic byte {0:#04x}, stream is unrecoverable")]
    InvalidMagic(u8),
    #[error("need {needed} more bytes, have {have}")]
    Incomplete { needed: usize, have: usize },
}

/// The fixed-size portion of a frame, decoded but still referencing the
/// header's raw status/vbucket union field by position.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FrameHeader {
    pub magic: Magic,
    pub opcode: u8,
    pub framing_extras_length: u8,
    pub key_length: u16,
    pub extras_length: u8,
    pub datatype: u8,
    pub status_or_partition: u16,
    pub total_body_length: u32,
    pub opaque: u32,
    pub cas: u64,
}

impl FrameHeader {
    pub fn is_snappy(&self) -> bool {
        self.datatype & datatype::SNAPPY != 0
    }

    pub fn is_json(&self) -> bool {
        self.datatype & datatype::JSON != 0
    }

    /// Length of the value section once `framing_extras`, `extras`, and
    /// `key` are accounted for.
    pub fn value_length(&self) -> usize {
        (self.total_body_length as usize)
            .saturating_sub(self.framing_extras_length as usize)
            .saturating_sub(self.extras_length as usize)
            .saturating_sub(self.key_length as usize)
    }

    fn decode(buf: &[u8]) -> Result<Self, DecodeError> {
        if buf.len() < HEADER_LENGTH {
            return Err(DecodeError::Incomplete {
                needed: HEADER_LENGTH,
                have: buf.len(),
            });
        }
        let magic = Magic::from_byte(buf[0]).ok_or(DecodeError::InvalidMagic(buf[0]))?;
        let opcode = buf[1];
        let (framing_extras_length, key_length) = if magic.is_alt_framing() {
            (buf[2], buf[3] as u16)
        } else {
            (0, u16::from_be_bytes([buf[2], buf[3]]))
        };
        let extras_length = buf[4];
        let datatype = buf[5];
        let status_or_partition = u16::from_be_bytes([buf[6], buf[7]]);
        let total_body_length = u32::from_be_bytes([buf[8], buf[9], buf[10], buf[11]]);
        let opaque = u32::from_be_bytes([buf[12], buf[13], buf[14], buf[15]]);
        let cas = u64::from_be_bytes([
            buf[16], buf[17], buf[18], buf[19], buf[20], buf[21], buf[22], buf[23],
        ]);
        Ok(Self {
            magic,
            opcode,
            framing_extras_length,
            key_length,
            extras_length,
            datatype,
            status_or_partition,
            total_body_length,
            opaque,
            cas,
        })
    }

    fn encode(&self, out: &mut BytesMut) {
        out.put_u8(self.magic.to_byte());
        out.put_u8(self.opcode);
        if self.magic.is_alt_framing() {
            out.put_u8(self.framing_extras_length);
            out.put_u8(self.key_length as u8);
        } else {
            out.put_u16(self.key_length);
        }
        out.put_u8(self.extras_length);
        out.put_u8(self.datatype);
        out.put_u16(self.status_or_partition);
        out.put_u32(self.total_body_length);
        out.put_u32(self.opaque);
        out.put_u64(self.cas);
    }
}

/// A fully decoded frame: header plus the four body sections in wire
/// order. `value` has already been Snappy-decompressed if the datatype
/// bit was set.
#[derive(Clone, Debug, PartialEq)]
pub struct Frame {
    pub header: FrameHeader,
    pub framing_extras: Bytes,
    pub extras: Bytes,
    pub key: Bytes,
    pub value: Bytes,
}

impl Frame {
    /// Decode exactly one frame from the front of `src`, returning
    /// `None` if fewer than a full frame's worth of bytes are buffered.
    /// On an invalid magic byte the caller must discard the whole
    /// buffer: the stream is unrecoverable at frame boundaries.
    pub fn try_decode(src: &mut BytesMut) -> Result<Option<Frame>, DecodeError> {
        if src.len() < HEADER_LENGTH {
            return Ok(None);
        }
        let header = FrameHeader::decode(&src[..HEADER_LENGTH])?;
        let total_len = HEADER_LENGTH + header.total_body_length as usize;
        if src.len() < total_len {
            return Ok(None);
        }

        let mut frame = src.split_to(total_len);
        frame.advance(HEADER_LENGTH);

        let framing_extras = frame.split_to(header.framing_extras_length as usize).freeze();
        let extras = frame.split_to(header.extras_length as usize).freeze();
        let key = frame.split_to(header.key_length as usize).freeze();
        let value_raw = frame.freeze();

        let value = if header.is_snappy() {
            crate::compression::decompress(&value_raw)
        } else {
            value_raw
        };

        Ok(Some(Frame {
            header,
            framing_extras,
            extras,
            key,
            value,
        }))
    }

    /// Encode a request frame. `value` is compressed in place per the
    /// negotiated Snappy policy before the body length is
    /// computed, so the returned buffer's length fields are always
    /// accurate.
    #[allow(clippy::too_many_arguments)]
    pub fn encode_request(
        magic: Magic,
        opcode: u8,
        opaque: u32,
        cas: u64,
        partition: u16,
        framing_extras: &[u8],
        extras: &[u8],
        key: &[u8],
        value: &[u8],
        snappy_enabled: bool,
    ) -> BytesMut {
        let (value_out, datatype) = if snappy_enabled {
            match crate::compression::try_compress(value) {
                Some(compressed) => (compressed, datatype::SNAPPY),
                None => (value.to_vec(), 0u8),
            }
        } else {
            (value.to_vec(), 0u8)
        };

        let total_body_length =
            framing_extras.len() + extras.len() + key.len() + value_out.len();

        let header = FrameHeader {
            magic,
            opcode,
            framing_extras_length: framing_extras.len() as u8,
            key_length: key.len() as u16,
            extras_length: extras.len() as u8,
            datatype,
            status_or_partition: partition,
            total_body_length: total_body_length as u32,
            opaque,
            cas,
        };

        let mut out = BytesMut::with_capacity(HEADER_LENGTH + total_body_length);
        header.encode(&mut out);
        out.put_slice(framing_extras);
        out.put_slice(extras);
        out.put_slice(key);
        out.put_slice(&value_out);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classic_request_round_trips_through_decode() {
        let encoded = Frame::encode_request(
            Magic::ClassicRequest,
            0x00,
            42,
            0,
            7,
            &[],
            &[1, 2],
            b"hello",
            b"world",
            false,
        );
        let mut buf = BytesMut::from(&encoded[..]);
        let frame = Frame::try_decode(&mut buf).unwrap().unwrap();
        assert_eq!(frame.header.opaque, 42);
        assert_eq!(frame.header.status_or_partition, 7);
        assert_eq!(&frame.extras[..], &[1, 2]);
        assert_eq!(&frame.key[..], b"hello");
        assert_eq!(&frame.value[..], b"world");
        assert!(buf.is_empty());
    }

    #[test]
    fn alt_framing_carries_framing_extras() {
        let encoded = Frame::encode_request(
            Magic::AltRequest,
            0x00,
            1,
            0,
            0,
            b"\x02\x05",
            &[],
            b"k",
            b"",
            false,
        );
        let mut buf = BytesMut::from(&encoded[..]);
        let frame = Frame::try_decode(&mut buf).unwrap().unwrap();
        assert_eq!(&frame.framing_extras[..], b"\x02\x05");
        assert_eq!(frame.header.magic, Magic::AltRequest);
    }

    #[test]
    fn incomplete_buffer_yields_none_not_error() {
        let mut buf = BytesMut::from(&[0x80u8, 0x00][..]);
        assert_eq!(Frame::try_decode(&mut buf).unwrap(), None);
    }

    #[test]
    fn invalid_magic_is_reported_not_panicked() {
        let mut buf = BytesMut::from(&[0xffu8; HEADER_LENGTH][..]);
        assert_eq!(Frame::try_decode(&mut buf), Err(DecodeError::InvalidMagic(0xff)));
    }

    #[test]
    fn snappy_flagged_value_is_transparently_decompressed() {
        let raw_value = vec![b'x'; 64];
        let encoded = Frame::encode_request(
            Magic::ClassicRequest,
            0x01,
            1,
            0,
            0,
            &[],
            &[],
            b"k",
            &raw_value,
            true,
        );
        let mut buf = BytesMut::from(&encoded[..]);
        let frame = Frame::try_decode(&mut buf).unwrap().unwrap();
        assert!(frame.header.is_snappy());
        assert_eq!(&frame.value[..], &raw_value[..]);
    }
}
