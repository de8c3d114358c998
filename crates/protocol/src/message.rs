//! Packet framing and the command vocabulary of the reader protocol.
//!
//! Every packet is a 12-byte [`Header`] followed by `count` payload bytes.
//! Requests carry `[command, unit, args...]`; `args` is a TLV stream except
//! for [`Command::Transact`], which carries the raw APDU.

use crate::buffer::Buffer;
use crate::error::{Error, Result};

/// Byte order used for the multi-byte header fields on one connection.
///
/// Local Unix-domain peers share the daemon's byte order; anything else
/// is spoken in network order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ByteOrder {
    #[default]
    Native,
    Network,
}

/// Fixed packet header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Header {
    /// Transaction id, echoed in the reply.
    pub xid: u32,
    /// Zero for requests, non-zero for replies.
    pub dest: u32,
    /// Error code of a reply; zero on success.
    pub error: i16,
    /// Number of payload bytes following the header.
    pub count: u16,
}

impl Header {
    /// Size of the header on the wire.
    pub const SIZE: usize = 12;

    #[must_use]
    pub const fn request(xid: u32, count: u16) -> Self {
        Self {
            xid,
            dest: 0,
            error: 0,
            count,
        }
    }

    #[must_use]
    pub const fn reply(xid: u32, error: i16, count: u16) -> Self {
        Self {
            xid,
            dest: 1,
            error,
            count,
        }
    }

    #[must_use]
    pub const fn is_reply(&self) -> bool {
        self.dest != 0
    }

    #[must_use]
    pub fn to_bytes(&self, order: ByteOrder) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        buf[0..4].copy_from_slice(&self.xid.to_ne_bytes());
        buf[4..8].copy_from_slice(&self.dest.to_ne_bytes());
        match order {
            ByteOrder::Native => {
                buf[8..10].copy_from_slice(&self.error.to_ne_bytes());
                buf[10..12].copy_from_slice(&self.count.to_ne_bytes());
            }
            ByteOrder::Network => {
                buf[8..10].copy_from_slice(&self.error.to_be_bytes());
                buf[10..12].copy_from_slice(&self.count.to_be_bytes());
            }
        }
        buf
    }

    /// Parse a header; returns `None` if fewer than [`Header::SIZE`] bytes.
    #[must_use]
    pub fn from_bytes(buf: &[u8], order: ByteOrder) -> Option<Self> {
        if buf.len() < Self::SIZE {
            return None;
        }
        let error = buf[8..10].try_into().ok()?;
        let count = buf[10..12].try_into().ok()?;
        let (error, count) = match order {
            ByteOrder::Native => (i16::from_ne_bytes(error), u16::from_ne_bytes(count)),
            ByteOrder::Network => (i16::from_be_bytes(error), u16::from_be_bytes(count)),
        };
        Some(Self {
            xid: u32::from_ne_bytes(buf[0..4].try_into().ok()?),
            dest: u32::from_ne_bytes(buf[4..8].try_into().ok()?),
            error,
            count,
        })
    }
}

/// Packet framing on top of a ring [`Buffer`].
#[derive(Debug, Clone)]
pub struct FramedMessage;

impl FramedMessage {
    /// Largest payload a packet can declare.
    pub const MAX_PAYLOAD: usize = u16::MAX as usize;

    /// Append header and payload to `ring`, compacting if needed.
    pub fn put(ring: &mut Buffer, header: &Header, payload: &[u8], order: ByteOrder) -> Result<()> {
        if payload.len() > Self::MAX_PAYLOAD {
            return Err(Error::PacketTooLarge(payload.len()));
        }
        let need = Header::SIZE + payload.len();
        if ring.tailroom() < need {
            ring.compact();
        }
        if ring.tailroom() < need {
            return Err(Error::InsufficientSpace);
        }
        let header = Header {
            count: payload.len() as u16,
            ..*header
        };
        ring.put(&header.to_bytes(order))?;
        ring.put(payload)?;
        Ok(())
    }

    /// Frame a packet into a fresh vector.
    pub fn frame(header: &Header, payload: &[u8], order: ByteOrder) -> Result<Vec<u8>> {
        let mut ring = Buffer::new(Header::SIZE + payload.len());
        Self::put(&mut ring, header, payload, order)?;
        Ok(ring.take())
    }

    /// Take one complete packet from the head of `ring`.
    ///
    /// Returns `Ok(None)` while the packet is still incomplete; the ring is
    /// left untouched in that case. A packet that could never fit in the
    /// ring is fatal.
    pub fn take(ring: &mut Buffer, order: ByteOrder) -> Result<Option<(Header, Vec<u8>)>> {
        let Some(header) = Header::from_bytes(ring.head(), order) else {
            return Ok(None);
        };
        let total = Header::SIZE + header.count as usize;
        if total > ring.size() {
            return Err(Error::PacketTooLarge(total));
        }
        if ring.avail() < total {
            return Ok(None);
        }
        let payload = ring.head()[Header::SIZE..total].to_vec();
        ring.advance_head(total)?;
        Ok(Some((header, payload)))
    }
}

/// Reader unit used to address the reader itself rather than a slot.
pub const UNIT_READER: u8 = 0xFF;

/// Commands understood by the reader daemon. Byte codes are a wire contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Command {
    Status = 0x00,
    Lock = 0x01,
    Unlock = 0x02,
    Reset = 0x10,
    RequestIcc = 0x11,
    EjectIcc = 0x12,
    Output = 0x13,
    PerformVerify = 0x14,
    Transact = 0x20,
    SetProtocol = 0x22,
    MemoryRead = 0x30,
    MemoryWrite = 0x31,
}

impl TryFrom<u8> for Command {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        Ok(match value {
            0x00 => Self::Status,
            0x01 => Self::Lock,
            0x02 => Self::Unlock,
            0x10 => Self::Reset,
            0x11 => Self::RequestIcc,
            0x12 => Self::EjectIcc,
            0x13 => Self::Output,
            0x14 => Self::PerformVerify,
            0x20 => Self::Transact,
            0x22 => Self::SetProtocol,
            0x30 => Self::MemoryRead,
            0x31 => Self::MemoryWrite,
            _ => return Err(Error::InvalidCmd),
        })
    }
}

/// TLV tags. Values are a wire contract.
pub mod tag {
    pub const READER_NAME: u8 = 0x00;
    pub const READER_UNITS: u8 = 0x01;
    pub const CARD_STATUS: u8 = 0x02;
    pub const ATR: u8 = 0x03;
    pub const LOCK: u8 = 0x04;
    pub const CARD_RESPONSE: u8 = 0x05;
    pub const ADDRESS: u8 = 0x06;
    pub const DATA: u8 = 0x07;
    pub const COUNT: u8 = 0x08;
    pub const READER_FLAGS: u8 = 0x09;

    pub const TIMEOUT: u8 = 0x80;
    pub const MESSAGE: u8 = 0x81;
    pub const LOCK_TYPE: u8 = 0x82;
    pub const PIN_DATA: u8 = 0x83;
    pub const PROTOCOL: u8 = 0x84;
}

/// Kind of lock requested with [`Command::Lock`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum LockType {
    Shared = 0,
    Exclusive = 1,
}

impl TryFrom<u32> for LockType {
    type Error = Error;

    fn try_from(value: u32) -> Result<Self> {
        match value {
            0 => Ok(Self::Shared),
            1 => Ok(Self::Exclusive),
            _ => Err(Error::InvalidArg),
        }
    }
}

/// A decoded request payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request<'a> {
    pub command: Command,
    pub unit: u8,
    /// TLV arguments, or the raw APDU for [`Command::Transact`].
    pub args: &'a [u8],
}

impl<'a> Request<'a> {
    /// Split a request payload into command, unit and argument bytes.
    pub fn from_bytes(payload: &'a [u8]) -> Result<Self> {
        let [command, unit, args @ ..] = payload else {
            return Err(Error::InvalidMsg);
        };
        Ok(Self {
            command: Command::try_from(*command)?,
            unit: *unit,
            args,
        })
    }

    /// Encode `[command, unit, args...]`.
    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(2 + self.args.len());
        out.push(self.command as u8);
        out.push(self.unit);
        out.extend_from_slice(self.args);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_size() {
        assert_eq!(Header::SIZE, 12);
        assert_eq!(Header::request(1, 0).to_bytes(ByteOrder::Native).len(), 12);
    }

    #[test]
    fn test_packet_roundtrip() {
        let payload = [0x00, 0x00, 0x03, 0x02, 0x41, 0x42];
        let framed =
            FramedMessage::frame(&Header::request(0xdead_beef, 0), &payload, ByteOrder::Native)
                .unwrap();

        let mut ring = Buffer::from_slice(&framed);
        let (header, body) = FramedMessage::take(&mut ring, ByteOrder::Native)
            .unwrap()
            .unwrap();
        assert_eq!(header.xid, 0xdead_beef);
        assert_eq!(header.dest, 0);
        assert_eq!(header.count as usize, payload.len());
        assert_eq!(body, payload);
        assert_eq!(ring.avail(), 0);
    }

    #[test]
    fn test_network_order_swaps_error_and_count() {
        let header = Header::reply(7, -7, 0x0102);
        let bytes = header.to_bytes(ByteOrder::Network);
        assert_eq!(&bytes[8..10], &(-7i16).to_be_bytes());
        assert_eq!(&bytes[10..12], &[0x01, 0x02]);
        assert_eq!(Header::from_bytes(&bytes, ByteOrder::Network), Some(header));
    }

    #[test]
    fn test_short_payload_leaves_ring_intact() {
        let framed =
            FramedMessage::frame(&Header::request(3, 0), &[1, 2, 3, 4], ByteOrder::Native).unwrap();
        let mut ring = Buffer::new(64);
        ring.put(&framed[..Header::SIZE + 2]).unwrap();

        assert!(FramedMessage::take(&mut ring, ByteOrder::Native).unwrap().is_none());
        assert_eq!(ring.avail(), Header::SIZE + 2);

        ring.put(&framed[Header::SIZE + 2..]).unwrap();
        let (_, body) = FramedMessage::take(&mut ring, ByteOrder::Native)
            .unwrap()
            .unwrap();
        assert_eq!(body, [1, 2, 3, 4]);
    }

    #[test]
    fn test_oversized_packet_is_fatal() {
        let mut ring = Buffer::new(32);
        ring.put(&Header::request(1, 100).to_bytes(ByteOrder::Native))
            .unwrap();
        assert!(matches!(
            FramedMessage::take(&mut ring, ByteOrder::Native),
            Err(Error::PacketTooLarge(112))
        ));
    }

    #[test]
    fn test_two_packets_drain_in_order() {
        let mut ring = Buffer::new(64);
        FramedMessage::put(&mut ring, &Header::request(1, 0), b"a", ByteOrder::Native).unwrap();
        FramedMessage::put(&mut ring, &Header::request(2, 0), b"bc", ByteOrder::Native).unwrap();

        let (first, _) = FramedMessage::take(&mut ring, ByteOrder::Native).unwrap().unwrap();
        let (second, body) = FramedMessage::take(&mut ring, ByteOrder::Native).unwrap().unwrap();
        assert_eq!((first.xid, second.xid), (1, 2));
        assert_eq!(body, b"bc");
    }

    #[test]
    fn test_request_parse() {
        let req = Request::from_bytes(&[0x01, 0x00, 0x82, 0x01, 0x01]).unwrap();
        assert_eq!(req.command, Command::Lock);
        assert_eq!(req.unit, 0);
        assert_eq!(req.args, &[0x82, 0x01, 0x01]);
        assert_eq!(req.to_bytes(), vec![0x01, 0x00, 0x82, 0x01, 0x01]);

        assert_eq!(Request::from_bytes(&[0x7f, 0x00]), Err(Error::InvalidCmd));
        assert_eq!(Request::from_bytes(&[0x00]), Err(Error::InvalidMsg));
    }

    #[test]
    fn test_lock_type() {
        assert_eq!(LockType::try_from(0).unwrap(), LockType::Shared);
        assert_eq!(LockType::try_from(1).unwrap(), LockType::Exclusive);
        assert_eq!(LockType::try_from(2), Err(Error::InvalidArg));
    }
}
