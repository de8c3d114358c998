//! The contract between the reader core and a hardware driver.
//!
//! A driver implements [`Driver`]; every hook except identification,
//! open, status and reset has a default, so a driver only overrides what
//! its hardware can do. Defaults answer [`Error::NotSupported`].

use crate::atr::Atr;
use crate::proto::{Protocol, ProtocolId};
use openct_protocol::{CardStatus, Error, ReaderFlags, Result};
use std::collections::BTreeMap;
use std::os::fd::RawFd;
use std::time::Duration;

/// Destination addresses used on the driver's byte channel.
pub mod dad {
    /// First card slot.
    pub const ICC1: u8 = 0x00;
    /// The reader itself.
    pub const READER: u8 = 0x02;
    /// Second card slot.
    pub const ICC2: u8 = 0x32;
}

/// What `open` tells the core about the device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReaderInfo {
    pub name: String,
    pub slots: usize,
    pub flags: ReaderFlags,
    /// Destination address for each slot, indexed by slot number.
    pub dads: Vec<u8>,
    /// IFSD announced to T=1 cards once the protocol is selected.
    pub ifsd: Option<usize>,
}

impl ReaderInfo {
    #[must_use]
    pub fn new(name: impl Into<String>, slots: usize) -> Self {
        let dads = (0..slots)
            .map(|slot| if slot == 0 { dad::ICC1 } else { dad::ICC2 })
            .collect();
        Self {
            name: name.into(),
            slots,
            flags: ReaderFlags::empty(),
            dads,
            ifsd: None,
        }
    }

    #[must_use]
    pub fn with_flags(mut self, flags: ReaderFlags) -> Self {
        self.flags = flags;
        self
    }

    #[must_use]
    pub fn with_ifsd(mut self, ifsd: usize) -> Self {
        self.ifsd = Some(ifsd);
        self
    }
}

/// Serial parity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Parity {
    None,
    Odd,
    Even,
}

/// Raw byte channel to the reader, used by the block protocol engines.
pub trait Transport {
    /// Send `data` to node `dad`.
    fn send(&mut self, dad: u8, data: &[u8]) -> Result<()> {
        let _ = (dad, data);
        Err(Error::NotSupported)
    }

    /// Receive up to `buf.len()` bytes from node `dad`.
    ///
    /// Returns the number of bytes stored. Character-mode transports may
    /// return fewer bytes than asked; block-mode transports return one
    /// whole block.
    fn recv(&mut self, dad: u8, buf: &mut [u8], timeout: Duration) -> Result<usize> {
        let _ = (dad, buf, timeout);
        Err(Error::NotSupported)
    }
}

/// Fill `buf` completely, issuing as many receives as needed.
pub fn recv_exact<T: Transport + ?Sized>(
    transport: &mut T,
    dad: u8,
    buf: &mut [u8],
    timeout: Duration,
) -> Result<()> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = transport.recv(dad, &mut buf[filled..], timeout)?;
        if n == 0 {
            return Err(Error::CommError);
        }
        filled += n;
    }
    Ok(())
}

/// A reader driver.
pub trait Driver: Transport + Send {
    /// Driver name as registered.
    fn name(&self) -> &str;

    /// Open the device and describe it.
    fn open(&mut self) -> Result<ReaderInfo>;

    fn close(&mut self) -> Result<()> {
        Ok(())
    }

    fn activate(&mut self) -> Result<()> {
        Ok(())
    }

    fn deactivate(&mut self) -> Result<()> {
        Ok(())
    }

    fn change_parity(&mut self, parity: Parity) -> Result<()> {
        let _ = parity;
        Err(Error::NotSupported)
    }

    fn change_speed(&mut self, baud: u32) -> Result<()> {
        let _ = baud;
        Err(Error::NotSupported)
    }

    /// Current presence of a card in `slot`.
    ///
    /// Drivers that cannot see removals between calls report
    /// [`CardStatus::CHANGED`] themselves.
    fn card_status(&mut self, slot: usize) -> Result<CardStatus>;

    /// Reset the card and return its ATR.
    fn card_reset(&mut self, slot: usize) -> Result<Atr>;

    /// Ask the user to insert a card, then reset it.
    fn card_request(&mut self, slot: usize, timeout: Duration, message: Option<&str>) -> Result<Atr> {
        let _ = (slot, timeout, message);
        Err(Error::NotSupported)
    }

    fn card_eject(&mut self, slot: usize, timeout: Duration, message: Option<&str>) -> Result<()> {
        let _ = (slot, timeout, message);
        Err(Error::NotSupported)
    }

    /// Show `message` on the reader's display.
    fn output(&mut self, message: &str) -> Result<()> {
        let _ = message;
        Err(Error::NotSupported)
    }

    /// Collect a PIN on the reader's keypad and send the verify command.
    fn perform_verify(
        &mut self,
        slot: usize,
        timeout: Duration,
        prompt: Option<&str>,
        data: &[u8],
    ) -> Result<Vec<u8>> {
        let _ = (slot, timeout, prompt, data);
        Err(Error::NotSupported)
    }

    /// Take over protocol handling for `slot`.
    ///
    /// `Ok(None)` lets the core build the engine itself; `Ok(Some(_))`
    /// installs the driver's own.
    fn set_protocol(&mut self, slot: usize, protocol: ProtocolId) -> Result<Option<Protocol>> {
        let _ = (slot, protocol);
        Ok(None)
    }

    /// Exchange a whole APDU with the reader doing the framing.
    fn transparent(&mut self, slot: usize, apdu: &[u8]) -> Result<Vec<u8>> {
        let _ = (slot, apdu);
        Err(Error::NotSupported)
    }

    fn sync_read(&mut self, slot: usize, protocol: ProtocolId, addr: u16, len: usize) -> Result<Vec<u8>> {
        let _ = (slot, protocol, addr, len);
        Err(Error::NotSupported)
    }

    fn sync_write(&mut self, slot: usize, protocol: ProtocolId, addr: u16, data: &[u8]) -> Result<()> {
        let _ = (slot, protocol, addr, data);
        Err(Error::NotSupported)
    }

    /// Vendor-specific command to the reader.
    fn escape(&mut self, slot: usize, data: &[u8]) -> Result<Vec<u8>> {
        let _ = (slot, data);
        Err(Error::NotSupported)
    }

    /// Descriptor that becomes readable when the device has events.
    fn get_eventfd(&self) -> Option<RawFd> {
        None
    }

    /// Drain pending events into `status`, one entry per slot.
    fn event(&mut self, status: &mut [CardStatus]) -> Result<()> {
        let _ = status;
        Ok(())
    }

    /// The event descriptor reported an error or hangup.
    fn error(&mut self) -> Result<()> {
        Err(Error::DeviceDisconnected)
    }

    fn before_command(&mut self) -> Result<()> {
        Ok(())
    }

    fn after_command(&mut self) -> Result<()> {
        Ok(())
    }

    /// Whether the device is still attached.
    fn is_present(&mut self) -> bool {
        true
    }
}

/// Builds a driver for a device address.
pub type Factory = fn(device: &str) -> Result<Box<dyn Driver>>;

/// Drivers known by name.
#[derive(Debug, Default, Clone)]
pub struct Registry {
    factories: BTreeMap<String, Factory>,
}

impl Registry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry holding the drivers shipped with this crate.
    #[must_use]
    pub fn with_builtin() -> Self {
        let mut registry = Self::new();
        registry.register("virtual", crate::virt::VirtualDriver::factory);
        registry
    }

    pub fn register(&mut self, name: impl Into<String>, factory: Factory) {
        let name = name.into();
        tracing::debug!(driver = %name, "Registered driver");
        self.factories.insert(name, factory);
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.factories.keys().map(String::as_str)
    }

    /// Instantiate driver `name` for `device`.
    pub fn open(&self, name: &str, device: &str) -> Result<Box<dyn Driver>> {
        let Some(factory) = self.factories.get(name) else {
            tracing::error!(driver = name, "Unknown driver");
            return Err(Error::NotSupported);
        };
        factory(device)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Chunked {
        chunks: Vec<Vec<u8>>,
    }

    impl Transport for Chunked {
        fn recv(&mut self, _dad: u8, buf: &mut [u8], _timeout: Duration) -> Result<usize> {
            if self.chunks.is_empty() {
                return Err(Error::Timeout);
            }
            let chunk = self.chunks.remove(0);
            buf[..chunk.len()].copy_from_slice(&chunk);
            Ok(chunk.len())
        }
    }

    #[test]
    fn test_recv_exact_gathers_chunks() {
        let mut transport = Chunked {
            chunks: vec![vec![1, 2], vec![3]],
        };
        let mut buf = [0u8; 3];
        recv_exact(&mut transport, 0, &mut buf, Duration::from_millis(10)).unwrap();
        assert_eq!(buf, [1, 2, 3]);
    }

    #[test]
    fn test_recv_exact_times_out() {
        let mut transport = Chunked {
            chunks: vec![vec![1]],
        };
        let mut buf = [0u8; 2];
        assert_eq!(
            recv_exact(&mut transport, 0, &mut buf, Duration::from_millis(10)),
            Err(Error::Timeout)
        );
    }

    #[test]
    fn test_reader_info_dads() {
        let info = ReaderInfo::new("two slots", 2);
        assert_eq!(info.dads, vec![dad::ICC1, dad::ICC2]);
        assert!(info.flags.is_empty());
    }

    #[test]
    fn test_registry_lookup() {
        let registry = Registry::with_builtin();
        assert_eq!(registry.names().collect::<Vec<_>>(), vec!["virtual"]);
        assert!(registry.open("virtual", "").is_ok());
        assert_eq!(registry.open("towitoko", "/dev/ttyS0").err(), Some(Error::NotSupported));
    }
}
