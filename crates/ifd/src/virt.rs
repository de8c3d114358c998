//! The `virtual` driver: a one-slot reader with display and keypad,
//! holding either an emulated ISO card or a 256-byte memory card.
//!
//! Device string options, comma separated:
//!
//! - `absent`: start without a card
//! - `memory`: the card is a synchronous memory card
//! - `pin=XXXX`: PIN the card expects (default `1234`)
//! - `entry=XXXX`: PIN "typed" on the keypad (defaults to the expected PIN)

use crate::apdu::{self, ApduCase};
use crate::atr::Atr;
use crate::driver::{Driver, ReaderInfo, Transport};
use crate::proto::{Protocol, ProtocolId};
use openct_protocol::{CardStatus, Error, ReaderFlags, Result};
use std::time::Duration;

const ATR: [u8; 5] = [0x3B, 0x80, 0x80, 0x01, 0x01];
const MEMORY_SIZE: usize = 256;
const FILE_SIZE: usize = 256;

const SW_OK: [u8; 2] = [0x90, 0x00];
const SW_WRONG_LENGTH: [u8; 2] = [0x67, 0x00];
const SW_WRONG_OFFSET: [u8; 2] = [0x6B, 0x00];
const SW_PIN_FAILED: [u8; 2] = [0x63, 0xC0];
const SW_UNKNOWN_INS: [u8; 2] = [0x6D, 0x00];

/// Emulated ISO 7816-4 card with one transparent file.
#[derive(Debug, Clone)]
struct IsoCard {
    pin: Vec<u8>,
    file: Vec<u8>,
    challenge: u8,
}

impl IsoCard {
    fn process(&mut self, command: &[u8]) -> Vec<u8> {
        let Ok(info) = apdu::classify(command) else {
            return SW_WRONG_LENGTH.to_vec();
        };
        let body = &command[info.data_offset().min(command.len())..];
        let data = &body[..info.lc.min(body.len())];
        let offset = usize::from(u16::from_be_bytes([command[2], command[3]]) & 0x7FFF);

        let mut resp = match (command[1], info.case) {
            (0xA4, _) => Vec::new(),
            (0x84, ApduCase::Case2Short) => (0..info.le)
                .map(|_| {
                    self.challenge = self.challenge.wrapping_mul(37).wrapping_add(11);
                    self.challenge
                })
                .collect(),
            (0xB0, ApduCase::Case2Short) => {
                let Some(bytes) = self.file.get(offset..offset + info.le) else {
                    return SW_WRONG_OFFSET.to_vec();
                };
                bytes.to_vec()
            }
            (0xD6, ApduCase::Case3Short) => {
                let Some(target) = self.file.get_mut(offset..offset + data.len()) else {
                    return SW_WRONG_OFFSET.to_vec();
                };
                target.copy_from_slice(data);
                Vec::new()
            }
            (0x20, ApduCase::Case3Short) => {
                if data != self.pin {
                    return SW_PIN_FAILED.to_vec();
                }
                Vec::new()
            }
            (0x84 | 0xB0 | 0xD6 | 0x20, _) => return SW_WRONG_LENGTH.to_vec(),
            _ => return SW_UNKNOWN_INS.to_vec(),
        };
        resp.extend_from_slice(&SW_OK);
        resp
    }
}

/// Software reader for tests and local development.
#[derive(Debug)]
pub struct VirtualDriver {
    present: bool,
    memory_card: bool,
    card: IsoCard,
    memory: Vec<u8>,
    keypad_entry: Vec<u8>,
    /// Messages shown on the display, oldest first.
    pub display: Vec<String>,
}

impl VirtualDriver {
    /// Build from a device option string.
    pub fn new(device: &str) -> Result<Self> {
        let mut present = true;
        let mut memory_card = false;
        let mut pin = b"1234".to_vec();
        let mut entry = None;

        for option in device.split(',').map(str::trim).filter(|o| !o.is_empty()) {
            match option.split_once('=') {
                None if option == "absent" => present = false,
                None if option == "memory" => memory_card = true,
                Some(("pin", value)) => pin = value.as_bytes().to_vec(),
                Some(("entry", value)) => entry = Some(value.as_bytes().to_vec()),
                _ => {
                    tracing::error!(option, "Unknown virtual reader option");
                    return Err(Error::InvalidArg);
                }
            }
        }

        Ok(Self {
            present,
            memory_card,
            keypad_entry: entry.unwrap_or_else(|| pin.clone()),
            card: IsoCard {
                pin,
                file: vec![0; FILE_SIZE],
                challenge: 0x5A,
            },
            memory: vec![0xFF; MEMORY_SIZE],
            display: Vec::new(),
        })
    }

    /// Registry entry point.
    pub fn factory(device: &str) -> Result<Box<dyn Driver>> {
        Ok(Box::new(Self::new(device)?))
    }

    fn require_card(&self) -> Result<()> {
        if self.present { Ok(()) } else { Err(Error::NoCard) }
    }

    fn require_memory(&self, addr: u16, len: usize) -> Result<std::ops::Range<usize>> {
        self.require_card()?;
        if !self.memory_card {
            return Err(Error::NotSupported);
        }
        let start = addr as usize;
        if start + len > MEMORY_SIZE {
            return Err(Error::InvalidArg);
        }
        Ok(start..start + len)
    }
}

impl Transport for VirtualDriver {}

impl Driver for VirtualDriver {
    fn name(&self) -> &str {
        "virtual"
    }

    fn open(&mut self) -> Result<ReaderInfo> {
        Ok(ReaderInfo::new("Virtual reader", 1).with_flags(ReaderFlags::DISPLAY | ReaderFlags::KEYPAD))
    }

    fn card_status(&mut self, _slot: usize) -> Result<CardStatus> {
        Ok(if self.present {
            CardStatus::PRESENT
        } else {
            CardStatus::empty()
        })
    }

    fn card_reset(&mut self, _slot: usize) -> Result<Atr> {
        self.require_card()?;
        if self.memory_card {
            return Ok(Atr::None);
        }
        Ok(Atr::Bytes(ATR.to_vec()))
    }

    fn card_request(&mut self, slot: usize, timeout: Duration, message: Option<&str>) -> Result<Atr> {
        if let Some(message) = message {
            self.display.push(message.to_owned());
        }
        tracing::debug!(slot, timeout_secs = timeout.as_secs(), "Virtual card inserted");
        self.present = true;
        self.card_reset(slot)
    }

    fn card_eject(&mut self, slot: usize, _timeout: Duration, message: Option<&str>) -> Result<()> {
        if let Some(message) = message {
            self.display.push(message.to_owned());
        }
        tracing::debug!(slot, "Virtual card ejected");
        self.present = false;
        Ok(())
    }

    fn output(&mut self, message: &str) -> Result<()> {
        tracing::info!(message, "Virtual display");
        self.display.push(message.to_owned());
        Ok(())
    }

    fn perform_verify(
        &mut self,
        _slot: usize,
        _timeout: Duration,
        prompt: Option<&str>,
        data: &[u8],
    ) -> Result<Vec<u8>> {
        self.require_card()?;
        let &[cla, ins, p1, p2, ..] = data else {
            return Err(Error::InvalidArg);
        };
        if let Some(prompt) = prompt {
            self.display.push(prompt.to_owned());
        }
        let mut command = vec![cla, ins, p1, p2, self.keypad_entry.len() as u8];
        command.extend_from_slice(&self.keypad_entry);
        Ok(self.card.process(&command))
    }

    fn set_protocol(&mut self, _slot: usize, protocol: ProtocolId) -> Result<Option<Protocol>> {
        match protocol {
            ProtocolId::T0 | ProtocolId::T1 | ProtocolId::Transparent if !self.memory_card => {
                Ok(Some(Protocol::Transparent))
            }
            ProtocolId::Escape => Ok(Some(Protocol::Escape)),
            id if id.is_sync() && self.memory_card => Ok(None),
            _ => Err(Error::NotSupported),
        }
    }

    fn transparent(&mut self, _slot: usize, apdu: &[u8]) -> Result<Vec<u8>> {
        self.require_card()?;
        Ok(self.card.process(apdu))
    }

    fn sync_read(&mut self, _slot: usize, _protocol: ProtocolId, addr: u16, len: usize) -> Result<Vec<u8>> {
        let range = self.require_memory(addr, len)?;
        Ok(self.memory[range].to_vec())
    }

    fn sync_write(&mut self, _slot: usize, _protocol: ProtocolId, addr: u16, data: &[u8]) -> Result<()> {
        let range = self.require_memory(addr, data.len())?;
        self.memory[range].copy_from_slice(data);
        Ok(())
    }

    fn escape(&mut self, _slot: usize, data: &[u8]) -> Result<Vec<u8>> {
        Ok(data.to_vec())
    }
}
