//! OpenCT IFD - The reader side of the card terminal stack.
//!
//! This crate provides:
//! - [`apdu`] and [`atr`] for classifying commands and reading the card's ATR
//! - The protocol engines in [`proto`] (T=0, T=1, GBP, memory cards)
//! - The [`Driver`] contract and the driver [`Registry`]
//! - [`Reader`], which owns a driver and the protocol state of its slots
//! - The built-in `virtual` driver ([`VirtualDriver`])
//!
//! # Example
//!
//! ```rust
//! use openct_ifd::{Reader, Registry};
//!
//! let driver = Registry::with_builtin().open("virtual", "").unwrap();
//! let mut reader = Reader::open(driver).unwrap();
//! reader.card_status(0).unwrap();
//! reader.card_reset(0).unwrap();
//!
//! let resp = reader.transceive(0, &[0x00, 0xA4, 0x00, 0x00]).unwrap();
//! assert_eq!(resp, [0x90, 0x00]);
//! ```

pub mod apdu;
pub mod atr;
pub mod checksum;
pub mod driver;
pub mod proto;
pub mod reader;
pub mod virt;

#[cfg(test)]
mod testing;

pub use atr::{Atr, AtrInfo};
pub use driver::{Driver, Registry, ReaderInfo, Transport};
pub use proto::{Handle, Protocol, ProtocolId};
pub use reader::{Reader, Slot};
pub use virt::VirtualDriver;
