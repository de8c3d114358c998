//! Error kinds shared by the daemon, the reader core and clients.
//!
//! Every variant maps onto a stable `i16` code that travels in the `error`
//! field of a reply header. Several internal kinds collapse onto the same
//! public code; [`Error::from_code`] always yields the public kind.

use thiserror::Error;

/// Result type used across the OpenCT crates.
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for reader, protocol and IPC operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    #[error("generic error")]
    Generic,
    #[error("timed out")]
    Timeout,
    #[error("invalid slot")]
    InvalidSlot,
    #[error("operation not supported")]
    NotSupported,
    #[error("communication error")]
    CommError,
    #[error("no card present")]
    NoCard,
    #[error("slot is locked")]
    Locked,
    #[error("no matching lock")]
    NoLock,
    #[error("invalid argument")]
    InvalidArg,
    #[error("out of memory")]
    NoMemory,
    #[error("buffer too small")]
    BufferTooSmall,
    #[error("user input timed out")]
    UserTimeout,
    #[error("aborted by user")]
    UserAbort,
    #[error("PIN mismatch")]
    PinMismatch,
    #[error("invalid ATR")]
    InvalidAtr,
    #[error("incompatible device")]
    IncompatibleDevice,
    #[error("device disconnected")]
    DeviceDisconnected,
    #[error("invalid message")]
    InvalidMsg,
    #[error("invalid command")]
    InvalidCmd,
    #[error("missing argument")]
    MissingArg,
    #[error("not connected")]
    NotConnected,

    /// A buffer read or write exceeded the available data or room.
    #[error("insufficient buffer space")]
    InsufficientSpace,
    /// TLV or APDU bytes do not follow the expected layout.
    #[error("malformed data")]
    Malformed,
    /// A packet header announced more payload than the receive ring holds.
    #[error("packet too large ({0} bytes)")]
    PacketTooLarge(usize),
    /// The card kept sending null procedure bytes.
    #[error("card is mute")]
    CardMute,
    /// The card violated the transmission protocol.
    #[error("protocol error: {0}")]
    ProtocolError(&'static str),
    /// The card aborted a T=1 chain.
    #[error("card aborted the transfer")]
    CardAborted,
    /// The request is well-formed but outside what the protocol can carry.
    #[error("unsupported request")]
    Unsupported,
    /// The slot has no ATR to work with.
    #[error("no ATR available")]
    NoAtr,
}

impl Error {
    pub const SUCCESS: i16 = 0;

    /// The code placed in the reply header for this error.
    #[must_use]
    pub const fn code(&self) -> i16 {
        match self {
            Self::Generic => -1,
            Self::Timeout | Self::CardMute => -2,
            Self::InvalidSlot => -3,
            Self::NotSupported | Self::Unsupported => -4,
            Self::CommError | Self::ProtocolError(_) | Self::CardAborted => -5,
            Self::NoCard => -6,
            Self::Locked => -7,
            Self::NoLock => -8,
            Self::InvalidArg => -9,
            Self::NoMemory => -10,
            Self::BufferTooSmall | Self::InsufficientSpace => -11,
            Self::UserTimeout => -12,
            Self::UserAbort => -13,
            Self::PinMismatch => -14,
            Self::InvalidAtr | Self::NoAtr => -15,
            Self::IncompatibleDevice => -16,
            Self::DeviceDisconnected => -17,
            Self::InvalidMsg | Self::Malformed | Self::PacketTooLarge(_) => -100,
            Self::InvalidCmd => -101,
            Self::MissingArg => -102,
            Self::NotConnected => -103,
        }
    }

    /// Map a wire code back onto its public kind.
    ///
    /// Returns `None` for [`Error::SUCCESS`]; unknown codes become `Generic`.
    #[must_use]
    pub const fn from_code(code: i16) -> Option<Self> {
        let err = match code {
            0 => return None,
            -2 => Self::Timeout,
            -3 => Self::InvalidSlot,
            -4 => Self::NotSupported,
            -5 => Self::CommError,
            -6 => Self::NoCard,
            -7 => Self::Locked,
            -8 => Self::NoLock,
            -9 => Self::InvalidArg,
            -10 => Self::NoMemory,
            -11 => Self::BufferTooSmall,
            -12 => Self::UserTimeout,
            -13 => Self::UserAbort,
            -14 => Self::PinMismatch,
            -15 => Self::InvalidAtr,
            -16 => Self::IncompatibleDevice,
            -17 => Self::DeviceDisconnected,
            -100 => Self::InvalidMsg,
            -101 => Self::InvalidCmd,
            -102 => Self::MissingArg,
            -103 => Self::NotConnected,
            _ => Self::Generic,
        };
        Some(err)
    }

    /// Turn a reply code into a `Result`.
    pub fn check(code: i16) -> Result<()> {
        match Self::from_code(code) {
            None => Ok(()),
            Some(err) => Err(err),
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock => Self::Timeout,
            std::io::ErrorKind::OutOfMemory => Self::NoMemory,
            _ => Self::CommError,
        }
    }
}
