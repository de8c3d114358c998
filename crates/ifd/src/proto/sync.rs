//! Synchronous memory cards (I2C, 2-wire, 3-wire, Eurochip).
//!
//! The driver moves the bytes; this module splits writes into page-sized
//! chunks and reads every chunk back before moving on.

use super::ProtocolId;
use crate::driver::Driver;
use openct_protocol::{Error, Result};

/// Writes never cross a boundary of this many bytes.
pub const PAGE_SIZE: usize = 256;

/// Attempts per chunk before the write is abandoned.
const WRITE_ATTEMPTS: usize = 2;

/// Memory card family.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryKind {
    I2cShort,
    I2cLong,
    Eurochip,
    TwoWire,
    ThreeWire,
}

impl MemoryKind {
    #[must_use]
    pub const fn protocol_id(self) -> ProtocolId {
        match self {
            Self::I2cShort => ProtocolId::I2cShort,
            Self::I2cLong => ProtocolId::I2cLong,
            Self::Eurochip => ProtocolId::Eurochip,
            Self::TwoWire => ProtocolId::TwoWire,
            Self::ThreeWire => ProtocolId::ThreeWire,
        }
    }
}

/// Read `len` bytes at `addr`.
pub fn read_memory(
    driver: &mut dyn Driver,
    slot: usize,
    kind: MemoryKind,
    addr: u16,
    len: usize,
) -> Result<Vec<u8>> {
    check_range(addr, len)?;
    let data = driver.sync_read(slot, kind.protocol_id(), addr, len)?;
    if data.len() != len {
        tracing::debug!(addr, len, got = data.len(), "Short memory read");
        return Err(Error::CommError);
    }
    Ok(data)
}

/// Write `data` at `addr`, verifying each chunk.
pub fn write_memory(
    driver: &mut dyn Driver,
    slot: usize,
    kind: MemoryKind,
    addr: u16,
    data: &[u8],
) -> Result<()> {
    check_range(addr, data.len())?;
    let mut offset = 0;
    while offset < data.len() {
        let at = addr as usize + offset;
        let room = PAGE_SIZE - at % PAGE_SIZE;
        let n = room.min(data.len() - offset);
        write_chunk(driver, slot, kind, at as u16, &data[offset..offset + n])?;
        offset += n;
    }
    Ok(())
}

fn write_chunk(driver: &mut dyn Driver, slot: usize, kind: MemoryKind, addr: u16, chunk: &[u8]) -> Result<()> {
    let protocol = kind.protocol_id();
    for attempt in 1..=WRITE_ATTEMPTS {
        driver.sync_write(slot, protocol, addr, chunk)?;
        let readback = driver.sync_read(slot, protocol, addr, chunk.len())?;
        if readback == chunk {
            return Ok(());
        }
        tracing::debug!(addr, len = chunk.len(), attempt, "Memory write did not verify");
    }
    Err(Error::CommError)
}

fn check_range(addr: u16, len: usize) -> Result<()> {
    if addr as usize + len > usize::from(u16::MAX) + 1 {
        return Err(Error::InvalidArg);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::atr::Atr;
    use crate::driver::{ReaderInfo, Transport};
    use openct_protocol::CardStatus;

    /// A memory card whose first `flaky` writes store corrupted data.
    struct Eeprom {
        mem: Vec<u8>,
        writes: Vec<(u16, usize)>,
        flaky: usize,
    }

    impl Eeprom {
        fn new(size: usize) -> Self {
            Self {
                mem: vec![0xFF; size],
                writes: Vec::new(),
                flaky: 0,
            }
        }
    }

    impl Transport for Eeprom {}

    impl Driver for Eeprom {
        fn name(&self) -> &str {
            "eeprom"
        }

        fn open(&mut self) -> Result<ReaderInfo> {
            Ok(ReaderInfo::new("eeprom", 1))
        }

        fn card_status(&mut self, _slot: usize) -> Result<CardStatus> {
            Ok(CardStatus::PRESENT)
        }

        fn card_reset(&mut self, _slot: usize) -> Result<Atr> {
            Ok(Atr::None)
        }

        fn sync_read(&mut self, _slot: usize, _protocol: ProtocolId, addr: u16, len: usize) -> Result<Vec<u8>> {
            let start = addr as usize;
            self.mem.get(start..start + len).map(<[u8]>::to_vec).ok_or(Error::InvalidArg)
        }

        fn sync_write(&mut self, _slot: usize, _protocol: ProtocolId, addr: u16, data: &[u8]) -> Result<()> {
            let start = addr as usize;
            self.writes.push((addr, data.len()));
            let target = self.mem.get_mut(start..start + data.len()).ok_or(Error::InvalidArg)?;
            target.copy_from_slice(data);
            if self.flaky > 0 {
                self.flaky -= 1;
                target[0] ^= 0xFF;
            }
            Ok(())
        }
    }

    #[test]
    fn test_write_splits_on_page_boundaries() {
        let mut card = Eeprom::new(1024);
        let data: Vec<u8> = (0..300u32).map(|i| i as u8).collect();

        write_memory(&mut card, 0, MemoryKind::I2cLong, 200, &data).unwrap();

        assert_eq!(card.writes, vec![(200, 56), (256, 244)]);
        assert_eq!(&card.mem[200..500], data.as_slice());
    }

    #[test]
    fn test_write_retries_once_on_mismatch() {
        let mut card = Eeprom::new(256);
        card.flaky = 1;
        write_memory(&mut card, 0, MemoryKind::I2cShort, 0, &[1, 2, 3]).unwrap();
        assert_eq!(card.writes.len(), 2);
        assert_eq!(&card.mem[..3], &[1, 2, 3]);

        let mut card = Eeprom::new(256);
        card.flaky = 2;
        assert_eq!(
            write_memory(&mut card, 0, MemoryKind::I2cShort, 0, &[1, 2, 3]),
            Err(Error::CommError)
        );
    }

    #[test]
    fn test_read_memory() {
        let mut card = Eeprom::new(256);
        card.mem[10] = 0x42;
        assert_eq!(read_memory(&mut card, 0, MemoryKind::TwoWire, 10, 1).unwrap(), vec![0x42]);
        assert_eq!(
            read_memory(&mut card, 0, MemoryKind::TwoWire, 0xFFFF, 2),
            Err(Error::InvalidArg)
        );
    }

    #[test]
    fn test_protocol_ids() {
        assert_eq!(MemoryKind::Eurochip.protocol_id(), ProtocolId::Eurochip);
        assert!(MemoryKind::ThreeWire.protocol_id().is_sync());
    }
}
