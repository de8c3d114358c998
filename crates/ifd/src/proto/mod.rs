//! Transmission protocols spoken between the host and a card (or reader).
//!
//! A slot owns at most one [`Handle`]. While the handle is active it wraps
//! a [`Protocol`] engine; once an exchange leaves the engine in an
//! unknown state the handle becomes [`Handle::Lost`], which has no engine
//! left to talk to. Only a card reset installs a fresh handle.

pub mod gbp;
pub mod sync;
pub mod t0;
pub mod t1;

use crate::atr::AtrInfo;
use crate::driver::Driver;
use openct_protocol::{Error, Result};
use std::fmt;

pub use gbp::Gbp;
pub use sync::MemoryKind;
pub use t0::T0;
pub use t1::T1;

/// Protocol identifiers. Values are exchanged with clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ProtocolId {
    T0 = 0,
    T1 = 1,
    I2cShort = 16,
    I2cLong = 17,
    Gbp = 19,
    Eurochip = 20,
    Escape = 22,
    TwoWire = 23,
    ThreeWire = 24,
    Transparent = 128,
}

impl TryFrom<u32> for ProtocolId {
    type Error = Error;

    fn try_from(value: u32) -> Result<Self> {
        Ok(match value {
            0 => Self::T0,
            1 => Self::T1,
            16 => Self::I2cShort,
            17 => Self::I2cLong,
            19 => Self::Gbp,
            20 => Self::Eurochip,
            22 => Self::Escape,
            23 => Self::TwoWire,
            24 => Self::ThreeWire,
            128 => Self::Transparent,
            _ => return Err(Error::NotSupported),
        })
    }
}

impl ProtocolId {
    /// Whether this is a memory-card protocol.
    #[must_use]
    pub const fn is_sync(self) -> bool {
        matches!(
            self,
            Self::I2cShort | Self::I2cLong | Self::Eurochip | Self::TwoWire | Self::ThreeWire
        )
    }
}

impl fmt::Display for ProtocolId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::T0 => "T=0",
            Self::T1 => "T=1",
            Self::I2cShort => "I2C-short",
            Self::I2cLong => "I2C-long",
            Self::Gbp => "GBP",
            Self::Eurochip => "Eurochip",
            Self::Escape => "escape",
            Self::TwoWire => "2-wire",
            Self::ThreeWire => "3-wire",
            Self::Transparent => "transparent",
        };
        f.write_str(name)
    }
}

/// Why an exchange failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fault {
    /// The request was refused; the engine is still in sync with the card.
    Failed(Error),
    /// The engine lost track of the card; the handle must be discarded.
    Lost(Error),
}

impl Fault {
    #[must_use]
    pub fn error(&self) -> &Error {
        match self {
            Self::Failed(err) | Self::Lost(err) => err,
        }
    }
}

impl From<Error> for Fault {
    fn from(err: Error) -> Self {
        Self::Failed(err)
    }
}

/// A protocol engine bound to one slot.
#[derive(Debug, Clone)]
pub enum Protocol {
    T0(T0),
    T1(T1),
    Gbp(Gbp),
    /// The reader exchanges whole APDUs itself.
    Transparent,
    /// Memory card; only memory reads and writes are possible.
    Sync(MemoryKind),
    /// Vendor escape channel to the reader.
    Escape,
}

impl Protocol {
    /// Default engine for `id`, addressing node `dad`.
    #[must_use]
    pub fn new(id: ProtocolId, dad: u8) -> Self {
        match id {
            ProtocolId::T0 => Self::T0(T0::new(dad)),
            ProtocolId::T1 => Self::T1(T1::new(dad)),
            ProtocolId::Gbp => Self::Gbp(Gbp::new(dad)),
            ProtocolId::Transparent => Self::Transparent,
            ProtocolId::Escape => Self::Escape,
            ProtocolId::I2cShort => Self::Sync(MemoryKind::I2cShort),
            ProtocolId::I2cLong => Self::Sync(MemoryKind::I2cLong),
            ProtocolId::Eurochip => Self::Sync(MemoryKind::Eurochip),
            ProtocolId::TwoWire => Self::Sync(MemoryKind::TwoWire),
            ProtocolId::ThreeWire => Self::Sync(MemoryKind::ThreeWire),
        }
    }

    #[must_use]
    pub fn id(&self) -> ProtocolId {
        match self {
            Self::T0(_) => ProtocolId::T0,
            Self::T1(_) => ProtocolId::T1,
            Self::Gbp(_) => ProtocolId::Gbp,
            Self::Transparent => ProtocolId::Transparent,
            Self::Escape => ProtocolId::Escape,
            Self::Sync(kind) => kind.protocol_id(),
        }
    }

    /// Adopt card parameters announced in the ATR.
    pub fn configure(&mut self, atr: &AtrInfo) {
        if let Self::T1(t1) = self {
            t1.configure(atr);
        }
    }

    /// Exchange one APDU with the card in `slot`.
    pub fn transceive(
        &mut self,
        driver: &mut dyn Driver,
        slot: usize,
        apdu: &[u8],
    ) -> std::result::Result<Vec<u8>, Fault> {
        match self {
            Self::T0(t0) => t0.transceive(driver, apdu),
            Self::T1(t1) => t1.transceive(driver, apdu),
            Self::Gbp(gbp) => gbp.transceive(driver, apdu),
            Self::Transparent => Ok(driver.transparent(slot, apdu)?),
            Self::Escape => Ok(driver.escape(slot, apdu)?),
            Self::Sync(_) => Err(Fault::Failed(Error::NotSupported)),
        }
    }
}

/// A slot's protocol state.
#[derive(Debug, Clone)]
pub enum Handle {
    Active(Protocol),
    /// Left behind by an exchange that desynchronised the engine.
    Lost(ProtocolId),
}

impl Handle {
    #[must_use]
    pub fn id(&self) -> ProtocolId {
        match self {
            Self::Active(proto) => proto.id(),
            Self::Lost(id) => *id,
        }
    }

    #[must_use]
    pub fn is_lost(&self) -> bool {
        matches!(self, Self::Lost(_))
    }

    #[must_use]
    pub fn protocol(&self) -> Option<&Protocol> {
        match self {
            Self::Active(proto) => Some(proto),
            Self::Lost(_) => None,
        }
    }

    pub fn protocol_mut(&mut self) -> Option<&mut Protocol> {
        match self {
            Self::Active(proto) => Some(proto),
            Self::Lost(_) => None,
        }
    }

    /// Run one exchange, retiring the engine if it loses synchronisation.
    pub fn transceive(&mut self, driver: &mut dyn Driver, slot: usize, apdu: &[u8]) -> Result<Vec<u8>> {
        let Self::Active(proto) = self else {
            return Err(Error::CommError);
        };
        match proto.transceive(driver, slot, apdu) {
            Ok(resp) => Ok(resp),
            Err(Fault::Failed(err)) => Err(err),
            Err(Fault::Lost(err)) => {
                let id = proto.id();
                tracing::warn!(slot, protocol = %id, error = %err, "Protocol lost sync, card reset required");
                *self = Self::Lost(id);
                Err(err)
            }
        }
    }
}
