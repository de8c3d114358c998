//! A reader: one driver instance and the slots it serves.

use crate::atr::{self, Atr, AtrInfo};
use crate::driver::{Driver, recv_exact};
use crate::proto::{Handle, Protocol, ProtocolId, sync};
use openct_protocol::{CardStatus, Error, MAX_SLOTS, ReaderFlags, Result};
use std::os::fd::RawFd;
use std::time::Duration;

const PTS_TIMEOUT: Duration = Duration::from_secs(1);

/// Per-slot card state.
#[derive(Debug, Default)]
pub struct Slot {
    /// Destination address of the card on the driver's byte channel.
    pub dad: u8,
    pub status: CardStatus,
    pub atr: Atr,
    handle: Option<Handle>,
}

impl Slot {
    /// Protocol currently selected, if any.
    #[must_use]
    pub fn protocol(&self) -> Option<ProtocolId> {
        self.handle.as_ref().map(Handle::id)
    }

    #[must_use]
    pub fn handle(&self) -> Option<&Handle> {
        self.handle.as_ref()
    }

    fn forget_card(&mut self) {
        self.handle = None;
        self.atr = Atr::None;
    }
}

pub struct Reader {
    name: String,
    flags: ReaderFlags,
    driver: Box<dyn Driver>,
    slots: Vec<Slot>,
    ifsd: Option<usize>,
}

impl std::fmt::Debug for Reader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reader")
            .field("name", &self.name)
            .field("driver", &self.driver.name())
            .field("flags", &self.flags)
            .field("slots", &self.slots)
            .finish()
    }
}

impl Reader {
    /// Open `driver` and set up its slots.
    pub fn open(mut driver: Box<dyn Driver>) -> Result<Self> {
        let info = driver.open()?;
        if info.slots == 0 || info.slots > MAX_SLOTS || info.dads.len() != info.slots {
            tracing::error!(driver = driver.name(), slots = info.slots, "Unusable slot layout");
            return Err(Error::IncompatibleDevice);
        }
        tracing::info!(reader = %info.name, driver = driver.name(), slots = info.slots, "Reader opened");

        let slots = info
            .dads
            .iter()
            .map(|&dad| Slot {
                dad,
                ..Slot::default()
            })
            .collect();
        Ok(Self {
            name: info.name,
            flags: info.flags,
            driver,
            slots,
            ifsd: info.ifsd,
        })
    }

    pub fn close(&mut self) -> Result<()> {
        tracing::info!(reader = %self.name, "Closing reader");
        for slot in &mut self.slots {
            slot.forget_card();
        }
        self.driver.close()
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn flags(&self) -> ReaderFlags {
        self.flags
    }

    #[must_use]
    pub fn slot_count(&self) -> usize {
        self.slots.len()
    }

    pub fn slot(&self, slot: usize) -> Result<&Slot> {
        self.slots.get(slot).ok_or(Error::InvalidSlot)
    }

    /// Last known status of every slot.
    #[must_use]
    pub fn statuses(&self) -> Vec<CardStatus> {
        self.slots.iter().map(|slot| slot.status).collect()
    }

    /// Query the driver for the card status of `slot`.
    pub fn card_status(&mut self, slot: usize) -> Result<CardStatus> {
        self.slot(slot)?;
        self.guarded(|reader| {
            let reported = reader.driver.card_status(slot)?;
            Ok(reader.apply_status(slot, reported))
        })
    }

    /// Reset the card and select its default protocol.
    pub fn card_reset(&mut self, slot: usize) -> Result<Atr> {
        self.slot(slot)?;
        self.guarded(|reader| {
            reader.slots[slot].forget_card();
            let atr = reader.driver.card_reset(slot)?;
            reader.adopt_atr(slot, atr)
        })
    }

    /// Have the user insert a card, then treat it like a reset.
    pub fn card_request(&mut self, slot: usize, timeout: Duration, message: Option<&str>) -> Result<Atr> {
        self.slot(slot)?;
        self.guarded(|reader| {
            reader.slots[slot].forget_card();
            let atr = reader.driver.card_request(slot, timeout, message)?;
            reader.adopt_atr(slot, atr)
        })
    }

    pub fn card_eject(&mut self, slot: usize, timeout: Duration, message: Option<&str>) -> Result<()> {
        self.slot(slot)?;
        self.guarded(|reader| {
            reader.driver.card_eject(slot, timeout, message)?;
            reader.slots[slot].forget_card();
            Ok(())
        })
    }

    /// Show a message on the reader's display.
    pub fn output(&mut self, message: &str) -> Result<()> {
        if !self.flags.contains(ReaderFlags::DISPLAY) {
            return Err(Error::NotSupported);
        }
        self.guarded(|reader| reader.driver.output(message))
    }

    /// Verify a PIN entered on the reader's keypad.
    pub fn perform_verify(
        &mut self,
        slot: usize,
        timeout: Duration,
        prompt: Option<&str>,
        data: &[u8],
    ) -> Result<Vec<u8>> {
        self.slot(slot)?;
        if !self.flags.contains(ReaderFlags::KEYPAD) {
            return Err(Error::NotSupported);
        }
        self.guarded(|reader| reader.driver.perform_verify(slot, timeout, prompt, data))
    }

    /// Switch `slot` to `protocol`, negotiating with the card first when needed.
    ///
    /// A card that cannot switch stays on its default protocol; the
    /// protocol actually selected is returned.
    pub fn set_protocol(&mut self, slot: usize, protocol: ProtocolId) -> Result<ProtocolId> {
        self.slot(slot)?;
        self.guarded(|reader| {
            let info = match reader.slots[slot].atr.as_bytes() {
                Some(bytes) => Some(atr::parse(bytes)?),
                None => None,
            };
            reader.select_protocol(slot, protocol, info.as_ref(), true)
        })
    }

    /// Exchange an APDU with the card in `slot`.
    pub fn transceive(&mut self, slot: usize, apdu: &[u8]) -> Result<Vec<u8>> {
        let entry = self.slot(slot)?;
        if !entry.status.contains(CardStatus::PRESENT) {
            return Err(Error::NoCard);
        }
        if entry.handle.is_none() {
            return Err(Error::NotConnected);
        }
        self.guarded(|reader| {
            let Reader { driver, slots, .. } = reader;
            let Some(handle) = slots[slot].handle.as_mut() else {
                return Err(Error::NotConnected);
            };
            handle.transceive(driver.as_mut(), slot, apdu)
        })
    }

    /// Read from a memory card.
    pub fn read_memory(&mut self, slot: usize, addr: u16, len: usize) -> Result<Vec<u8>> {
        let kind = self.memory_kind(slot)?;
        self.guarded(|reader| sync::read_memory(reader.driver.as_mut(), slot, kind, addr, len))
    }

    /// Write to a memory card.
    pub fn write_memory(&mut self, slot: usize, addr: u16, data: &[u8]) -> Result<()> {
        let kind = self.memory_kind(slot)?;
        self.guarded(|reader| sync::write_memory(reader.driver.as_mut(), slot, kind, addr, data))
    }

    /// Refresh every slot; returns whether any slot changed.
    pub fn poll(&mut self) -> Result<bool> {
        if !self.driver.is_present() {
            tracing::warn!(reader = %self.name, "Reader detached");
            return Err(Error::DeviceDisconnected);
        }
        let mut changed = false;
        for slot in 0..self.slots.len() {
            match self.card_status(slot) {
                Ok(status) => changed |= status.contains(CardStatus::CHANGED),
                Err(Error::DeviceDisconnected) => return Err(Error::DeviceDisconnected),
                Err(err) => tracing::debug!(reader = %self.name, slot, error = %err, "Status poll failed"),
            }
        }
        Ok(changed)
    }

    /// Descriptor to watch for driver events.
    #[must_use]
    pub fn eventfd(&self) -> Option<RawFd> {
        self.driver.get_eventfd()
    }

    /// The event descriptor is readable; returns whether any slot changed.
    pub fn handle_event(&mut self) -> Result<bool> {
        let mut statuses = self.statuses();
        self.driver.event(&mut statuses)?;
        let mut changed = false;
        for (slot, reported) in statuses.into_iter().enumerate() {
            changed |= self.apply_status(slot, reported).contains(CardStatus::CHANGED);
        }
        Ok(changed)
    }

    /// The event descriptor reported an error or hangup.
    pub fn handle_error(&mut self) -> Result<()> {
        self.driver.error()
    }

    fn guarded<T>(&mut self, op: impl FnOnce(&mut Self) -> Result<T>) -> Result<T> {
        self.driver.before_command()?;
        let result = op(self);
        let after = self.driver.after_command();
        match (result, after) {
            (Err(err), after) => {
                if let Err(after) = after {
                    tracing::debug!(error = %after, "after_command failed");
                }
                Err(err)
            }
            (Ok(_), Err(err)) => Err(err),
            (Ok(value), Ok(())) => Ok(value),
        }
    }

    fn apply_status(&mut self, slot: usize, reported: CardStatus) -> CardStatus {
        let entry = &mut self.slots[slot];
        let was_present = entry.status.contains(CardStatus::PRESENT);
        let present = reported.contains(CardStatus::PRESENT);

        let mut status = reported & CardStatus::PRESENT;
        if present != was_present || reported.contains(CardStatus::CHANGED) {
            status |= CardStatus::CHANGED;
            entry.forget_card();
            tracing::info!(reader = %self.name, slot, present, "Card status changed");
        }
        entry.status = status;
        status
    }

    fn adopt_atr(&mut self, slot: usize, atr: Atr) -> Result<Atr> {
        self.slots[slot].status |= CardStatus::PRESENT;
        self.slots[slot].atr = atr.clone();

        let Some(bytes) = atr.as_bytes() else {
            tracing::debug!(reader = %self.name, slot, "Card has no ATR, protocol left unselected");
            return Ok(atr);
        };
        let info = atr::parse(bytes)?;
        self.select_protocol(slot, default_protocol(&info), Some(&info), false)?;
        Ok(atr)
    }

    fn select_protocol(
        &mut self,
        slot: usize,
        protocol: ProtocolId,
        info: Option<&AtrInfo>,
        negotiate: bool,
    ) -> Result<ProtocolId> {
        let mut engine = match self.driver.set_protocol(slot, protocol)? {
            Some(engine) => engine,
            None => {
                let mut chosen = protocol;
                if negotiate && let Some(info) = info {
                    match self.negotiate(slot, protocol, info) {
                        Ok(()) => {}
                        Err(Error::NotSupported) => {
                            chosen = default_protocol(info);
                            tracing::info!(
                                reader = %self.name,
                                slot,
                                requested = %protocol,
                                protocol = %chosen,
                                "Card cannot switch, keeping default protocol"
                            );
                        }
                        Err(err) => return Err(err),
                    }
                }
                Protocol::new(chosen, self.slots[slot].dad)
            }
        };
        if let Some(info) = info {
            engine.configure(info);
        }
        if let (Protocol::T1(t1), Some(ifsd)) = (&mut engine, self.ifsd)
            && let Err(err) = t1.negotiate_ifsd(self.driver.as_mut(), ifsd)
        {
            tracing::warn!(reader = %self.name, slot, ifsd, error = %err, "Card kept the default IFSD");
        }

        let id = engine.id();
        tracing::debug!(reader = %self.name, slot, protocol = %id, "Protocol selected");
        self.slots[slot].handle = Some(Handle::Active(engine));
        Ok(id)
    }

    /// Run a PTS exchange if the card would otherwise talk its default protocol.
    fn negotiate(&mut self, slot: usize, protocol: ProtocolId, info: &AtrInfo) -> Result<()> {
        let id = protocol as u8;
        if id > 15 || id == info.default_protocol {
            return Ok(());
        }
        if !info.supports(id) {
            return Err(Error::NotSupported);
        }
        if info.specific_mode() {
            return Err(Error::NotSupported);
        }

        let dad = self.slots[slot].dad;
        let request = atr::build_pts(info, id);
        tracing::debug!(reader = %self.name, slot, pts = ?request, "Sending PTS");
        self.driver.send(dad, &request)?;

        let mut response = vec![0u8; 2];
        recv_exact(self.driver.as_mut(), dad, &mut response, PTS_TIMEOUT)?;
        let optional = (response[1] & 0x70).count_ones() as usize;
        response.resize(2 + optional + 1, 0);
        recv_exact(self.driver.as_mut(), dad, &mut response[2..], PTS_TIMEOUT)?;

        let selected = atr::verify_pts(&request, &response)?;
        tracing::debug!(reader = %self.name, slot, protocol = selected, "PTS accepted");
        Ok(())
    }

    fn memory_kind(&self, slot: usize) -> Result<sync::MemoryKind> {
        let entry = self.slot(slot)?;
        match entry.handle.as_ref().and_then(Handle::protocol) {
            Some(Protocol::Sync(kind)) => Ok(*kind),
            Some(_) => Err(Error::NotSupported),
            None if entry.status.contains(CardStatus::PRESENT) => Err(Error::NotConnected),
            None => Err(Error::NoCard),
        }
    }
}

/// Protocol a card talks right after reset.
fn default_protocol(info: &AtrInfo) -> ProtocolId {
    ProtocolId::try_from(u32::from(info.default_protocol)).unwrap_or(ProtocolId::T0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checksum::Checksum;
    use crate::proto::t1::Block;
    use crate::testing::Scripted;
    use crate::virt::VirtualDriver;
    use hex_literal::hex;

    fn virtual_reader(device: &str) -> Reader {
        Reader::open(VirtualDriver::factory(device).unwrap()).unwrap()
    }

    #[test]
    fn test_open_virtual_reader() {
        let reader = virtual_reader("");
        assert_eq!(reader.name(), "Virtual reader");
        assert_eq!(reader.slot_count(), 1);
        assert!(reader.flags().contains(ReaderFlags::DISPLAY | ReaderFlags::KEYPAD));
        assert_eq!(reader.slot(1).err(), Some(Error::InvalidSlot));
    }

    #[test]
    fn test_reset_selects_protocol_and_transceives() {
        let mut reader = virtual_reader("");
        assert!(reader.card_status(0).unwrap().contains(CardStatus::PRESENT));

        let atr = reader.card_reset(0).unwrap();
        assert_eq!(atr.as_bytes(), Some(&hex!("3B 80 80 01 01")[..]));
        assert_eq!(reader.slot(0).unwrap().protocol(), Some(ProtocolId::Transparent));

        let resp = reader.transceive(0, &hex!("00 A4 04 00 02 3F 00")).unwrap();
        assert_eq!(resp, hex!("90 00"));
    }

    #[test]
    fn test_removal_drops_handle() {
        let mut reader = virtual_reader("");
        reader.card_status(0).unwrap();
        reader.card_reset(0).unwrap();

        reader.card_eject(0, Duration::from_secs(1), None).unwrap();
        assert!(reader.slot(0).unwrap().handle().is_none());

        assert!(reader.poll().unwrap());
        let status = reader.slot(0).unwrap().status;
        assert_eq!(status, CardStatus::CHANGED);
        assert_eq!(reader.transceive(0, &hex!("00 A4 00 00")), Err(Error::NoCard));

        assert!(!reader.poll().unwrap());
        assert_eq!(reader.slot(0).unwrap().status, CardStatus::empty());
    }

    #[test]
    fn test_card_request_inserts_card() {
        let mut reader = virtual_reader("absent");
        assert_eq!(reader.card_status(0).unwrap(), CardStatus::empty());
        assert_eq!(reader.card_reset(0), Err(Error::NoCard));

        let atr = reader
            .card_request(0, Duration::from_secs(5), Some("Insert card"))
            .unwrap();
        assert!(!atr.is_none());
        assert!(reader.slot(0).unwrap().status.contains(CardStatus::PRESENT));
    }

    #[test]
    fn test_memory_card_has_no_atr() {
        let mut reader = virtual_reader("memory");
        reader.card_status(0).unwrap();
        assert_eq!(reader.card_reset(0).unwrap(), Atr::None);
        assert_eq!(reader.slot(0).unwrap().protocol(), None);
        assert_eq!(reader.transceive(0, &hex!("00 A4 00 00")), Err(Error::NotConnected));
        assert_eq!(reader.read_memory(0, 0, 4), Err(Error::NotConnected));

        reader.set_protocol(0, ProtocolId::I2cShort).unwrap();
        reader.write_memory(0, 100, &[0xAB; 10]).unwrap();
        assert_eq!(reader.read_memory(0, 100, 10).unwrap(), vec![0xAB; 10]);
    }

    #[test]
    fn test_output_and_verify() {
        let mut reader = virtual_reader("pin=4321");
        reader.card_status(0).unwrap();
        reader.card_reset(0).unwrap();
        reader.output("Hello").unwrap();
        let resp = reader
            .perform_verify(0, Duration::from_secs(5), Some("PIN?"), &hex!("00 20 00 80"))
            .unwrap();
        assert_eq!(resp, hex!("90 00"));
    }

    #[test]
    fn test_t0_card_over_scripted_driver() {
        let mut driver = Scripted::new();
        driver.reply(&hex!("90 00"));
        let mut reader = Reader::open(Box::new(driver)).unwrap();
        reader.card_status(0).unwrap();
        reader.card_reset(0).unwrap();
        assert_eq!(reader.slot(0).unwrap().protocol(), Some(ProtocolId::T0));
        assert_eq!(reader.transceive(0, &hex!("00 A4 00 00")).unwrap(), hex!("90 00"));

        // T=0-only card: no PTS is attempted.
        assert_eq!(reader.set_protocol(0, ProtocolId::T1), Ok(ProtocolId::T0));
        assert_eq!(reader.slot(0).unwrap().protocol(), Some(ProtocolId::T0));
    }

    #[test]
    fn test_specific_mode_card_keeps_default_protocol() {
        // TA2 present: the card is fixed to T=0 although it lists T=1.
        let mut driver = Scripted::new();
        driver.atr = hex!("3B 80 90 00 01 11").to_vec();
        driver.reply(&hex!("90 00"));
        let mut reader = Reader::open(Box::new(driver)).unwrap();
        reader.card_status(0).unwrap();
        reader.card_reset(0).unwrap();

        assert_eq!(reader.set_protocol(0, ProtocolId::T1), Ok(ProtocolId::T0));
        assert_eq!(reader.slot(0).unwrap().protocol(), Some(ProtocolId::T0));
        assert_eq!(reader.transceive(0, &hex!("00 A4 00 00")).unwrap(), hex!("90 00"));
    }

    #[test]
    fn test_lost_protocol_needs_reset() {
        let mut reader = Reader::open(Box::new(Scripted::new())).unwrap();
        reader.card_status(0).unwrap();
        reader.card_reset(0).unwrap();

        assert_eq!(reader.transceive(0, &hex!("00 A4 00 00")), Err(Error::Timeout));
        assert!(reader.slot(0).unwrap().handle().unwrap().is_lost());
        assert_eq!(reader.transceive(0, &hex!("00 A4 00 00")), Err(Error::CommError));

        reader.card_reset(0).unwrap();
        assert!(!reader.slot(0).unwrap().handle().unwrap().is_lost());
    }

    fn t1_block(pcb: u8, info: &[u8]) -> Vec<u8> {
        Block::encode(0, pcb, info, Checksum::Lrc)
    }

    #[test]
    fn test_set_protocol_sends_pts() {
        let mut driver = Scripted::new();
        driver.atr = hex!("3B 80 80 01 01").to_vec();
        driver.reply(&hex!("FF 01 FE"));
        driver.reply(&t1_block(0x00, &hex!("90 00")));
        let mut reader = Reader::open(Box::new(driver)).unwrap();
        reader.card_status(0).unwrap();
        reader.card_reset(0).unwrap();
        assert_eq!(reader.slot(0).unwrap().protocol(), Some(ProtocolId::T0));

        assert_eq!(reader.set_protocol(0, ProtocolId::T1), Ok(ProtocolId::T1));
        assert_eq!(reader.slot(0).unwrap().protocol(), Some(ProtocolId::T1));
        assert_eq!(reader.transceive(0, &hex!("00 A4 00 00")).unwrap(), hex!("90 00"));
    }

    #[test]
    fn test_t1_selection_announces_ifsd() {
        let mut driver = Scripted::new();
        driver.atr = hex!("3B 80 80 01 01").to_vec();
        driver.ifsd = Some(254);
        driver.reply(&hex!("FF 01 FE"));
        driver.reply(&t1_block(0xE1, &[0xFE]));
        let mut reader = Reader::open(Box::new(driver)).unwrap();
        reader.card_status(0).unwrap();
        reader.card_reset(0).unwrap();

        reader.set_protocol(0, ProtocolId::T1).unwrap();
        let Some(Protocol::T1(t1)) = reader.slot(0).unwrap().handle().and_then(Handle::protocol) else {
            panic!("T=1 not selected");
        };
        assert_eq!(t1.ifsd, 254);
    }

    #[test]
    fn test_t1_abort_reaches_caller() {
        let mut driver = Scripted::new();
        driver.atr = hex!("3B 80 80 01 01").to_vec();
        driver.reply(&hex!("FF 01 FE"));
        driver.reply(&t1_block(0xC2, &[]));
        driver.reply(&t1_block(0x00, &hex!("90 00")));
        let mut reader = Reader::open(Box::new(driver)).unwrap();
        reader.card_status(0).unwrap();
        reader.card_reset(0).unwrap();
        reader.set_protocol(0, ProtocolId::T1).unwrap();

        assert_eq!(reader.transceive(0, &hex!("00 A4 00 00")), Err(Error::CardAborted));
        assert!(!reader.slot(0).unwrap().handle().unwrap().is_lost());
        assert_eq!(reader.transceive(0, &hex!("00 A4 00 00")).unwrap(), hex!("90 00"));
    }

    #[test]
    fn test_set_protocol_refused() {
        let mut driver = Scripted::new();
        driver.atr = hex!("3B 80 80 01 01").to_vec();
        driver.reply(&hex!("FF 00 FF"));
        let mut reader = Reader::open(Box::new(driver)).unwrap();
        reader.card_status(0).unwrap();
        reader.card_reset(0).unwrap();

        assert!(reader.set_protocol(0, ProtocolId::T1).is_err());
        assert_eq!(reader.slot(0).unwrap().protocol(), Some(ProtocolId::T0));
        assert_eq!(reader.set_protocol(0, ProtocolId::Gbp), Ok(ProtocolId::Gbp));
    }
}
