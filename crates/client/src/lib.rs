//! OpenCT client library.
//!
//! Blocking access to a reader daemon over its Unix domain socket, plus a
//! read-only view of the shared status file.
//!
//! ```no_run
//! use openct_client::{Client, LockType};
//!
//! let mut client = Client::connect(0)?;
//! let lock = client.lock(0, LockType::Exclusive)?;
//! let atr = client.reset(0)?;
//! let answer = client.transact(0, &[0x00, 0xA4, 0x04, 0x00])?;
//! client.unlock(0, lock)?;
//! # Ok::<(), openct_client::Error>(())
//! ```

use openct_protocol::{
    Buffer, ByteOrder, Command, FramedMessage, Header, Request, StatusFile, TlvBuilder, TlvParser,
    UNIT_READER, get_socket_dir, master_socket_path, reader_socket_path, status_file_path, tag,
};
use std::io::{Read, Write};
use std::os::unix::net::UnixStream;
use std::path::Path;
use std::time::Duration;

pub use openct_protocol::{CardStatus, Error, LockType, ReaderFlags, Result};

/// Default wait for a reply. Keypad and insertion prompts can take a while.
const REPLY_TIMEOUT: Duration = Duration::from_secs(120);
const WRITE_TIMEOUT: Duration = Duration::from_secs(10);

/// Size hint for the reader name.
const NAME_SIZE: usize = 64;

/// A reader published in the status file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReaderEntry {
    /// Reader index; also the name of its socket.
    pub index: usize,
    pub name: String,
    pub flags: ReaderFlags,
    /// Card status of each slot.
    pub slots: Vec<CardStatus>,
}

/// Readers with a running daemon, from the default socket directory.
pub fn readers() -> Result<Vec<ReaderEntry>> {
    readers_in(&get_socket_dir())
}

/// Readers with a running daemon, from the status file in `dir`.
pub fn readers_in(dir: &Path) -> Result<Vec<ReaderEntry>> {
    let file = StatusFile::open(&status_file_path(dir))?;
    Ok(file
        .readers()
        .map(|(index, rec)| ReaderEntry {
            index,
            name: rec.name(),
            flags: rec.flags(),
            slots: (0..rec.slot_count as usize).map(|s| rec.card_status(s)).collect(),
        })
        .collect())
}

/// Answer to a reader-level STATUS.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReaderStatus {
    /// Empty when asked of the master socket.
    pub name: String,
    /// Slot units of a reader, or reader indices from the master socket.
    pub units: Vec<u8>,
    pub flags: ReaderFlags,
}

/// A connection to one reader daemon (or to the master socket).
#[derive(Debug)]
pub struct Client {
    stream: UnixStream,
    next_xid: u32,
}

impl Client {
    /// Connect to reader `index` in the default socket directory.
    pub fn connect(index: usize) -> Result<Self> {
        Self::connect_path(&reader_socket_path(&get_socket_dir(), index))
    }

    /// Connect to the master socket in `dir`.
    pub fn connect_master(dir: &Path) -> Result<Self> {
        Self::connect_path(&master_socket_path(dir))
    }

    pub fn connect_path(path: &Path) -> Result<Self> {
        let stream = UnixStream::connect(path).map_err(|e| {
            tracing::debug!(socket = %path.display(), error = %e, "Connect failed");
            Error::NotConnected
        })?;
        stream.set_read_timeout(Some(REPLY_TIMEOUT))?;
        stream.set_write_timeout(Some(WRITE_TIMEOUT))?;
        Ok(Self { stream, next_xid: 1 })
    }

    /// Change how long to wait for each reply.
    pub fn set_timeout(&mut self, timeout: Duration) -> Result<()> {
        self.stream.set_read_timeout(Some(timeout))?;
        Ok(())
    }

    /// Name, units and capability flags.
    pub fn status(&mut self) -> Result<ReaderStatus> {
        let body = self.call(Command::Status, UNIT_READER, &[])?;
        let tlv = TlvParser::parse(&body)?;
        Ok(ReaderStatus {
            name: tlv.get_string(tag::READER_NAME, NAME_SIZE).unwrap_or_default(),
            units: tlv.get(tag::READER_UNITS).map(<[u8]>::to_vec).unwrap_or_default(),
            flags: ReaderFlags::from_bits_truncate(tlv.get_int(tag::READER_FLAGS)?.unwrap_or(0)),
        })
    }

    pub fn card_status(&mut self, slot: u8) -> Result<CardStatus> {
        let body = self.call(Command::Status, slot, &[])?;
        let bits = TlvParser::parse(&body)?
            .get_int(tag::CARD_STATUS)?
            .ok_or(Error::InvalidMsg)?;
        Ok(CardStatus::from_bits_truncate(bits as u8))
    }

    /// Lock `slot`; returns the handle to pass to [`Client::unlock`].
    pub fn lock(&mut self, slot: u8, kind: LockType) -> Result<u32> {
        let body = self.call_tlv(Command::Lock, slot, |args| {
            args.put_int(tag::LOCK_TYPE, kind as u32);
        })?;
        TlvParser::parse(&body)?.get_int(tag::LOCK)?.ok_or(Error::InvalidMsg)
    }

    pub fn unlock(&mut self, slot: u8, handle: u32) -> Result<()> {
        self.call_tlv(Command::Unlock, slot, |args| {
            args.put_int(tag::LOCK, handle);
        })?;
        Ok(())
    }

    /// Reset the card; `None` for cards that have no ATR.
    pub fn reset(&mut self, slot: u8) -> Result<Option<Vec<u8>>> {
        let body = self.call(Command::Reset, slot, &[])?;
        atr(&body)
    }

    /// Ask the user to insert a card, then reset it.
    pub fn request_icc(
        &mut self,
        slot: u8,
        timeout: Option<Duration>,
        message: Option<&str>,
    ) -> Result<Option<Vec<u8>>> {
        let timeout = timeout_secs(timeout)?;
        let body = self.call_tlv(Command::RequestIcc, slot, |args| {
            put_prompt(args, timeout, message);
        })?;
        atr(&body)
    }

    pub fn eject_icc(&mut self, slot: u8, timeout: Option<Duration>, message: Option<&str>) -> Result<()> {
        let timeout = timeout_secs(timeout)?;
        self.call_tlv(Command::EjectIcc, slot, |args| {
            put_prompt(args, timeout, message);
        })?;
        Ok(())
    }

    /// Show `message` on the reader's display.
    pub fn output(&mut self, message: &str) -> Result<()> {
        self.call_tlv(Command::Output, UNIT_READER, |args| {
            args.put_string(tag::MESSAGE, message);
        })?;
        Ok(())
    }

    /// Have the reader collect a PIN on its keypad and send `command` with it.
    pub fn perform_verify(
        &mut self,
        slot: u8,
        timeout: Option<Duration>,
        prompt: Option<&str>,
        command: &[u8],
    ) -> Result<Vec<u8>> {
        let timeout = timeout_secs(timeout)?;
        let body = self.call_tlv(Command::PerformVerify, slot, |args| {
            put_prompt(args, timeout, prompt);
            args.put_bytes(tag::PIN_DATA, command);
        })?;
        TlvParser::parse(&body)?
            .get(tag::CARD_RESPONSE)
            .map(<[u8]>::to_vec)
            .ok_or(Error::InvalidMsg)
    }

    /// Exchange an APDU with the card.
    pub fn transact(&mut self, slot: u8, apdu: &[u8]) -> Result<Vec<u8>> {
        self.call(Command::Transact, slot, apdu)
    }

    /// Select a protocol by its numeric id, returning the one the card ended up on.
    pub fn set_protocol(&mut self, slot: u8, protocol: u32) -> Result<u32> {
        let body = self.call_tlv(Command::SetProtocol, slot, |args| {
            args.put_int(tag::PROTOCOL, protocol);
        })?;
        Ok(TlvParser::parse(&body)?.get_int(tag::PROTOCOL)?.unwrap_or(protocol))
    }

    pub fn memory_read(&mut self, slot: u8, addr: u16, count: usize) -> Result<Vec<u8>> {
        let count = u32::try_from(count).map_err(|_| Error::InvalidArg)?;
        let body = self.call_tlv(Command::MemoryRead, slot, |args| {
            args.put_int(tag::ADDRESS, u32::from(addr)).put_int(tag::COUNT, count);
        })?;
        TlvParser::parse(&body)?
            .get(tag::DATA)
            .map(<[u8]>::to_vec)
            .ok_or(Error::InvalidMsg)
    }

    pub fn memory_write(&mut self, slot: u8, addr: u16, data: &[u8]) -> Result<()> {
        self.call_tlv(Command::MemoryWrite, slot, |args| {
            args.put_int(tag::ADDRESS, u32::from(addr)).put_bytes(tag::DATA, data);
        })?;
        Ok(())
    }

    fn call_tlv(&mut self, command: Command, unit: u8, build: impl FnOnce(&mut TlvBuilder<'_>)) -> Result<Vec<u8>> {
        let mut args = Buffer::new(FramedMessage::MAX_PAYLOAD - 2);
        let mut builder = TlvBuilder::new(&mut args);
        build(&mut builder);
        builder.finish()?;
        self.call(command, unit, args.head())
    }

    /// Send one request and wait for the reply carrying its xid.
    fn call(&mut self, command: Command, unit: u8, args: &[u8]) -> Result<Vec<u8>> {
        let xid = self.next_xid;
        self.next_xid = self.next_xid.wrapping_add(1).max(1);

        let request = Request { command, unit, args };
        let packet = FramedMessage::frame(&Header::request(xid, 0), &request.to_bytes(), ByteOrder::Native)?;
        self.stream.write_all(&packet)?;

        loop {
            let (header, body) = self.read_packet()?;
            if header.xid != xid {
                tracing::debug!(expected = xid, got = header.xid, "Discarding stale reply");
                continue;
            }
            Error::check(header.error)?;
            return Ok(body);
        }
    }

    fn read_packet(&mut self) -> Result<(Header, Vec<u8>)> {
        let mut head = [0u8; Header::SIZE];
        self.stream.read_exact(&mut head)?;
        let header = Header::from_bytes(&head, ByteOrder::Native).ok_or(Error::InvalidMsg)?;
        let mut body = vec![0u8; header.count as usize];
        self.stream.read_exact(&mut body)?;
        Ok((header, body))
    }
}

fn atr(body: &[u8]) -> Result<Option<Vec<u8>>> {
    Ok(TlvParser::parse(body)?.get(tag::ATR).map(<[u8]>::to_vec))
}

/// Timeouts travel as whole seconds in a 32-bit field.
fn timeout_secs(timeout: Option<Duration>) -> Result<Option<u32>> {
    timeout
        .map(|t| u32::try_from(t.as_secs()).map_err(|_| Error::InvalidArg))
        .transpose()
}

fn put_prompt(args: &mut TlvBuilder<'_>, timeout: Option<u32>, message: Option<&str>) {
    if let Some(timeout) = timeout {
        args.put_int(tag::TIMEOUT, timeout);
    }
    if let Some(message) = message {
        args.put_string(tag::MESSAGE, message);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hex_literal::hex;
    use openct_protocol::{StatusFileMut, StatusRecord};
    use std::os::unix::net::UnixListener;
    use std::thread;

    /// Serves one connection, answering each request with the next canned
    /// `(extra replies, error, body)`. Extra replies go out first with a
    /// bogus xid. Returns the request payloads seen.
    fn serve(
        listener: UnixListener,
        replies: Vec<(i16, Vec<u8>)>,
        stale_first: bool,
    ) -> thread::JoinHandle<Vec<Vec<u8>>> {
        thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let mut seen = Vec::new();
            for (i, (error, body)) in replies.into_iter().enumerate() {
                let mut head = [0u8; Header::SIZE];
                stream.read_exact(&mut head).unwrap();
                let header = Header::from_bytes(&head, ByteOrder::Native).unwrap();
                let mut payload = vec![0u8; header.count as usize];
                stream.read_exact(&mut payload).unwrap();
                seen.push(payload);

                if stale_first && i == 0 {
                    let stale = FramedMessage::frame(&Header::reply(0xFFFF, -5, 0), &[], ByteOrder::Native).unwrap();
                    stream.write_all(&stale).unwrap();
                }
                let reply = FramedMessage::frame(&Header::reply(header.xid, error, 0), &body, ByteOrder::Native).unwrap();
                stream.write_all(&reply).unwrap();
            }
            seen
        })
    }

    fn tlv(build: impl FnOnce(&mut TlvBuilder<'_>)) -> Vec<u8> {
        let mut buf = Buffer::new(256);
        let mut builder = TlvBuilder::new(&mut buf);
        build(&mut builder);
        builder.finish().unwrap();
        buf.take()
    }

    fn setup() -> (tempfile::TempDir, UnixListener, std::path::PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("0");
        let listener = UnixListener::bind(&path).unwrap();
        (dir, listener, path)
    }

    #[test]
    fn test_status_and_lock() {
        let (_dir, listener, path) = setup();
        let server = serve(
            listener,
            vec![
                (
                    0,
                    tlv(|b| {
                        b.put_string(tag::READER_NAME, "Desk reader")
                            .put_bytes(tag::READER_UNITS, &[0, 1])
                            .put_int(tag::READER_FLAGS, 2);
                    }),
                ),
                (0, tlv(|b| {
                    b.put_int(tag::LOCK, 7);
                })),
            ],
            false,
        );

        let mut client = Client::connect_path(&path).unwrap();
        let status = client.status().unwrap();
        assert_eq!(status.name, "Desk reader");
        assert_eq!(status.units, vec![0, 1]);
        assert_eq!(status.flags, ReaderFlags::KEYPAD);
        assert_eq!(client.lock(1, LockType::Exclusive).unwrap(), 7);

        let seen = server.join().unwrap();
        assert_eq!(seen[0], vec![Command::Status as u8, UNIT_READER]);
        assert_eq!(seen[1], hex!("01 01 82 01 01"));
    }

    #[test]
    fn test_error_codes_and_stale_replies() {
        let (_dir, listener, path) = setup();
        let server = serve(
            listener,
            vec![(Error::Locked.code(), Vec::new()), (0, hex!("90 00").to_vec())],
            true,
        );

        let mut client = Client::connect_path(&path).unwrap();
        assert_eq!(client.transact(0, &hex!("00 A4 00 00")), Err(Error::Locked));
        assert_eq!(client.transact(0, &hex!("00 B0 00 00 00")).unwrap(), hex!("90 00"));

        let seen = server.join().unwrap();
        assert_eq!(seen[0], hex!("20 00 00 A4 00 00"));
    }

    #[test]
    fn test_reset_without_atr() {
        let (_dir, listener, path) = setup();
        let server = serve(
            listener,
            vec![(0, Vec::new()), (0, tlv(|b| {
                b.put_bytes(tag::ATR, &hex!("3B 00"));
            }))],
            false,
        );

        let mut client = Client::connect_path(&path).unwrap();
        assert_eq!(client.reset(0).unwrap(), None);
        assert_eq!(
            client.request_icc(0, Some(Duration::from_secs(5)), Some("Insert")).unwrap(),
            Some(hex!("3B 00").to_vec())
        );

        let seen = server.join().unwrap();
        let args = TlvParser::parse(&seen[1][2..]).unwrap();
        assert_eq!(args.get_int(tag::TIMEOUT).unwrap(), Some(5));
        assert_eq!(args.get_string(tag::MESSAGE, 64).unwrap(), "Insert");
    }

    #[test]
    fn test_oversized_timeout_and_protocol_fallback() {
        let (_dir, listener, path) = setup();
        let server = serve(
            listener,
            vec![(0, tlv(|b| {
                b.put_int(tag::PROTOCOL, 0);
            }))],
            false,
        );

        let mut client = Client::connect_path(&path).unwrap();
        let forever = Some(Duration::from_secs(u64::MAX));
        assert_eq!(client.request_icc(0, forever, None), Err(Error::InvalidArg));
        assert_eq!(client.eject_icc(0, forever, None), Err(Error::InvalidArg));
        // The card stayed on T=0 although T=1 was asked for.
        assert_eq!(client.set_protocol(0, 1).unwrap(), 0);

        let seen = server.join().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0][0], Command::SetProtocol as u8);
    }

    #[test]
    fn test_connect_failure() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(
            Client::connect_path(&dir.path().join("missing")).unwrap_err(),
            Error::NotConnected
        );
    }

    #[test]
    fn test_readers_from_status_file() {
        let dir = tempfile::tempdir().unwrap();
        let mut file = StatusFileMut::create(&status_file_path(dir.path()), 2).unwrap();
        file.claim(Some(1)).unwrap();
        file.update(1, |rec: &mut StatusRecord| {
            rec.set_name("Virtual reader");
            rec.slot_count = 1;
            rec.set_card_status(0, CardStatus::PRESENT);
        })
        .unwrap();

        let readers = readers_in(dir.path()).unwrap();
        assert_eq!(readers.len(), 1);
        assert_eq!(readers[0].index, 1);
        assert_eq!(readers[0].name, "Virtual reader");
        assert_eq!(readers[0].slots, vec![CardStatus::PRESENT]);
    }
}
