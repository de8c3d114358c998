//! Request dispatch for reader and master sockets.
//!
//! A request payload is `[command, unit, args...]`. Replies are TLV streams;
//! errors travel in the reply header and leave the payload empty.

use crate::locks::LockManager;
use crate::server::{Peer, Service};
use crate::status::StatusSlot;
use openct_ifd::{Atr, ProtocolId, Reader};
use openct_protocol::{
    Buffer, CardStatus, Command, Error, FramedMessage, LockType, Request, Result, StatusFile,
    TlvBuilder, TlvParser, UNIT_READER, tag,
};
use std::os::fd::RawFd;
use std::path::PathBuf;
use std::time::Duration;

/// Wait applied to REQUEST_ICC, EJECT_ICC and PERFORM_VERIFY without TIMEOUT.
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Largest memory read answered in one DATA item.
const MAX_MEMORY_READ: u32 = 254;

/// Message length limit for display and prompt strings.
const MESSAGE_SIZE: usize = 128;

/// Where a request is directed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Unit {
    Reader,
    Slot(usize),
}

impl Unit {
    fn slot(self) -> Result<usize> {
        match self {
            Self::Slot(slot) => Ok(slot),
            Self::Reader => Err(Error::InvalidSlot),
        }
    }
}

/// Serves one reader: dispatch, locks and status publishing.
pub struct ReaderService {
    reader: Reader,
    locks: LockManager,
    status: Option<StatusSlot>,
    published: Vec<CardStatus>,
}

impl ReaderService {
    pub fn new(reader: Reader, status: Option<StatusSlot>) -> Self {
        let mut service = Self {
            reader,
            locks: LockManager::new(),
            status,
            published: Vec::new(),
        };
        service.publish();
        service
    }

    /// Shut the reader down and release the status record.
    pub fn close(mut self) -> Result<()> {
        self.status = None;
        self.reader.close()
    }

    fn unit(&self, unit: u8) -> Result<Unit> {
        if unit == UNIT_READER {
            return Ok(Unit::Reader);
        }
        let slot = usize::from(unit);
        if slot >= self.reader.slot_count() {
            return Err(Error::InvalidSlot);
        }
        Ok(Unit::Slot(slot))
    }

    /// A slot the caller may use to talk to the card.
    fn card_slot(&self, peer: &Peer, unit: Unit) -> Result<usize> {
        let slot = unit.slot()?;
        self.locks.check_access(peer.id, slot)?;
        Ok(slot)
    }

    fn dispatch(&mut self, peer: &Peer, request: &Request<'_>) -> Result<Vec<u8>> {
        let unit = self.unit(request.unit)?;

        if request.command == Command::Transact {
            let slot = self.card_slot(peer, unit)?;
            return self.reader.transceive(slot, request.args);
        }

        let args = TlvParser::parse(request.args)?;
        let mut out = Buffer::new(FramedMessage::MAX_PAYLOAD);
        let mut resp = TlvBuilder::new(&mut out);

        match request.command {
            Command::Status => match unit {
                Unit::Reader => {
                    let units: Vec<u8> = (0..self.reader.slot_count() as u8).collect();
                    resp.put_string(tag::READER_NAME, self.reader.name())
                        .put_bytes(tag::READER_UNITS, &units)
                        .put_int(tag::READER_FLAGS, self.reader.flags().bits());
                }
                Unit::Slot(slot) => {
                    let status = self.reader.card_status(slot)?;
                    resp.put_int(tag::CARD_STATUS, u32::from(status.bits()));
                }
            },
            Command::Lock => {
                let slot = unit.slot()?;
                let kind = LockType::try_from(required_int(&args, tag::LOCK_TYPE)?)?;
                let handle = self.locks.lock(peer.id, peer.uid, slot, kind)?;
                resp.put_int(tag::LOCK, handle);
            }
            Command::Unlock => {
                let slot = unit.slot()?;
                let handle = required_int(&args, tag::LOCK)?;
                self.locks.unlock(peer.id, slot, handle)?;
            }
            Command::Reset => {
                let slot = self.card_slot(peer, unit)?;
                let atr = self.reader.card_reset(slot)?;
                put_atr(&mut resp, &atr);
            }
            Command::RequestIcc => {
                let slot = self.card_slot(peer, unit)?;
                let message = args.get_string(tag::MESSAGE, MESSAGE_SIZE);
                let atr = self
                    .reader
                    .card_request(slot, timeout(&args)?, message.as_deref())?;
                put_atr(&mut resp, &atr);
            }
            Command::EjectIcc => {
                let slot = self.card_slot(peer, unit)?;
                let message = args.get_string(tag::MESSAGE, MESSAGE_SIZE);
                self.reader
                    .card_eject(slot, timeout(&args)?, message.as_deref())?;
            }
            Command::Output => {
                let message = args
                    .get_string(tag::MESSAGE, MESSAGE_SIZE)
                    .ok_or(Error::MissingArg)?;
                self.reader.output(&message)?;
            }
            Command::PerformVerify => {
                let slot = self.card_slot(peer, unit)?;
                let message = args.get_string(tag::MESSAGE, MESSAGE_SIZE);
                let pin_data = args.get(tag::PIN_DATA).ok_or(Error::MissingArg)?;
                let response =
                    self.reader
                        .perform_verify(slot, timeout(&args)?, message.as_deref(), pin_data)?;
                resp.put_bytes(tag::CARD_RESPONSE, &response);
            }
            Command::SetProtocol => {
                let slot = self.card_slot(peer, unit)?;
                let protocol = ProtocolId::try_from(required_int(&args, tag::PROTOCOL)?)?;
                let selected = self.reader.set_protocol(slot, protocol)?;
                resp.put_int(tag::PROTOCOL, selected as u32);
            }
            Command::MemoryRead => {
                let slot = self.card_slot(peer, unit)?;
                let addr = address(&args)?;
                let count = required_int(&args, tag::COUNT)?;
                if count > MAX_MEMORY_READ {
                    return Err(Error::InvalidArg);
                }
                let data = self.reader.read_memory(slot, addr, count as usize)?;
                resp.put_bytes(tag::DATA, &data);
            }
            Command::MemoryWrite => {
                let slot = self.card_slot(peer, unit)?;
                let addr = address(&args)?;
                let data = args.get(tag::DATA).ok_or(Error::MissingArg)?;
                self.reader.write_memory(slot, addr, data)?;
            }
            Command::Transact => return Err(Error::InvalidCmd),
        }

        resp.finish()?;
        Ok(out.take())
    }

    /// Push slot states to the status file when they moved.
    fn publish(&mut self) {
        let statuses = self.reader.statuses();
        if statuses == self.published {
            return;
        }
        if let Some(status) = self.status.as_mut()
            && let Err(e) = status.publish(&self.reader)
        {
            tracing::warn!(error = %e, "Failed to publish reader status");
            return;
        }
        self.published = statuses;
    }
}

impl Service for ReaderService {
    fn process(&mut self, peer: &Peer, payload: &[u8]) -> Result<Vec<u8>> {
        let request = Request::from_bytes(payload)?;
        tracing::trace!(
            client = ?peer.id,
            command = ?request.command,
            unit = request.unit,
            "Request"
        );

        let result = self.dispatch(peer, &request);
        if let Err(err) = &result {
            tracing::debug!(
                client = ?peer.id,
                command = ?request.command,
                unit = request.unit,
                error = %err,
                "Request failed"
            );
        }
        self.publish();
        result
    }

    fn closed(&mut self, peer: &Peer) {
        if self.locks.release_all_for(peer.id) > 0 {
            tracing::debug!(held = self.locks.len(), "Locks remaining");
        }
    }

    fn tick(&mut self) -> Result<()> {
        if self.reader.poll()? {
            self.publish();
        }
        Ok(())
    }

    fn event_fd(&self) -> Option<RawFd> {
        self.reader.eventfd()
    }

    fn event(&mut self) -> Result<()> {
        if self.reader.handle_event()? {
            self.publish();
        }
        Ok(())
    }

    fn event_error(&mut self) -> Result<()> {
        self.reader.handle_error()?;
        Err(Error::DeviceDisconnected)
    }
}

/// Serves the master socket: enumeration of running readers.
pub struct MasterService {
    status_path: PathBuf,
}

impl MasterService {
    pub fn new(status_path: PathBuf) -> Self {
        Self { status_path }
    }
}

impl Service for MasterService {
    fn process(&mut self, _peer: &Peer, payload: &[u8]) -> Result<Vec<u8>> {
        let request = Request::from_bytes(payload)?;
        if request.command != Command::Status {
            return Err(Error::InvalidCmd);
        }
        if request.unit != UNIT_READER {
            return Err(Error::InvalidSlot);
        }

        let file = StatusFile::open(&self.status_path)?;
        let units: Vec<u8> = file
            .readers()
            .filter_map(|(index, _)| u8::try_from(index).ok())
            .collect();

        let mut out = Buffer::new(FramedMessage::MAX_PAYLOAD);
        TlvBuilder::new(&mut out)
            .put_bytes(tag::READER_UNITS, &units)
            .finish()?;
        Ok(out.take())
    }
}

fn required_int(args: &TlvParser<'_>, tag: u8) -> Result<u32> {
    args.get_int(tag)?.ok_or(Error::MissingArg)
}

fn timeout(args: &TlvParser<'_>) -> Result<Duration> {
    Ok(args
        .get_int(tag::TIMEOUT)?
        .map_or(DEFAULT_TIMEOUT, |secs| Duration::from_secs(u64::from(secs))))
}

fn address(args: &TlvParser<'_>) -> Result<u16> {
    u16::try_from(required_int(args, tag::ADDRESS)?).map_err(|_| Error::InvalidArg)
}

/// A card without ATR answers with no ATR item at all.
fn put_atr(resp: &mut TlvBuilder<'_>, atr: &Atr) {
    if let Some(bytes) = atr.as_bytes() {
        resp.put_bytes(tag::ATR, bytes);
    }
}
