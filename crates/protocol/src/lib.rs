//! OpenCT Protocol - Shared types for IPC between reader daemons and clients.
//!
//! This crate provides:
//! - [`Error`] with the stable error codes carried in reply headers
//! - [`Buffer`], the fixed-capacity byte FIFO used for socket rings
//! - [`TlvParser`] and [`TlvBuilder`] for request arguments and replies
//! - [`Header`], [`FramedMessage`] and the [`Command`] vocabulary
//! - The shared status file ([`StatusFile`], [`StatusFileMut`])
//! - Socket path helpers via [`get_socket_dir`]
//!
//! # Wire Format
//!
//! Each packet is a 12-byte header (`xid`, `dest`, `error`, `count`)
//! followed by `count` payload bytes. A request payload starts with
//! `[command, unit]`; the rest is a TLV stream, or a raw APDU for
//! [`Command::Transact`].
//!
//! # Example
//!
//! ```rust
//! use openct_protocol::{Buffer, ByteOrder, Command, FramedMessage, Header, Request, TlvBuilder, tag};
//!
//! // LOCK slot 0 exclusively
//! let mut args = Buffer::new(16);
//! TlvBuilder::new(&mut args).put_int(tag::LOCK_TYPE, 1);
//! let request = Request { command: Command::Lock, unit: 0, args: args.head() };
//!
//! let packet = FramedMessage::frame(&Header::request(1, 0), &request.to_bytes(), ByteOrder::Native).unwrap();
//! assert_eq!(packet.len(), Header::SIZE + 5);
//! ```

pub mod buffer;
pub mod error;
mod message;
mod socket;
pub mod status;
pub mod tlv;

// Re-export main types at crate root
pub use buffer::Buffer;
pub use error::{Error, Result};
pub use message::{
    ByteOrder, Command, FramedMessage, Header, LockType, Request, UNIT_READER, tag,
};
pub use socket::{
    DEFAULT_SOCKET_DIR, MASTER_SOCKET_NAME, SOCKET_DIR_ENV_VAR, STATUS_FILE_NAME, get_socket_dir,
    master_socket_path, reader_socket_path, status_file_path,
};
pub use status::{CardStatus, MAX_SLOTS, ReaderFlags, StatusFile, StatusFileMut, StatusRecord};
pub use tlv::{TlvBuilder, TlvParser};

/// Size of the per-socket receive and send rings.
///
/// Large enough for a maximum-size packet.
pub const RING_SIZE: usize = Header::SIZE + FramedMessage::MAX_PAYLOAD;
