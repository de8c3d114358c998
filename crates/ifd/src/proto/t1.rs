//! ISO 7816-3 T=1, the half-duplex block transmission protocol.
//!
//! Every block is `NAD PCB LEN [INFO] EDC`. Command APDUs longer than the
//! card's IFSC are chained over several I-blocks; the card's answer may be
//! chained the same way. Transmission errors are first repaired with
//! R-blocks, then with a RESYNCH; when that fails too the engine gives up
//! and the slot needs a card reset.

use super::Fault;
use crate::atr::AtrInfo;
use crate::checksum::Checksum;
use crate::driver::{Driver, recv_exact};
use openct_protocol::{Error, Result};
use std::time::Duration;

type Exchange = std::result::Result<Vec<u8>, Fault>;

/// Largest information field either side may announce.
pub const MAX_INFO: usize = 254;
/// Information field size assumed until negotiated.
pub const DEFAULT_IFS: usize = 32;

const HEADER_LEN: usize = 3;

/// PCB bits.
pub(crate) mod pcb {
    pub const I_MORE: u8 = 0x20;
    pub const R_BLOCK: u8 = 0x80;
    pub const S_BLOCK: u8 = 0xC0;
    pub const S_RESPONSE: u8 = 0x20;

    pub const RESYNCH: u8 = 0x00;
    pub const IFS: u8 = 0x01;
    pub const ABORT: u8 = 0x02;
    pub const WTX: u8 = 0x03;

    pub const R_OK: u8 = 0x00;
    pub const R_EDC_ERROR: u8 = 0x01;
    pub const R_OTHER_ERROR: u8 = 0x02;
}

/// Block type decoded from a PCB.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Kind {
    I { ns: u8, more: bool },
    R { nr: u8, error: u8 },
    S { kind: u8, response: bool },
}

impl Kind {
    pub(crate) fn from_pcb(pcb: u8) -> Self {
        match pcb & 0xC0 {
            0x80 => Self::R {
                nr: (pcb >> 4) & 1,
                error: pcb & 0x0F,
            },
            0xC0 => Self::S {
                kind: pcb & 0x0F,
                response: pcb & pcb::S_RESPONSE != 0,
            },
            _ => Self::I {
                ns: (pcb >> 6) & 1,
                more: pcb & pcb::I_MORE != 0,
            },
        }
    }
}

/// A decoded block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Block {
    pub pcb: u8,
    pub info: Vec<u8>,
}

impl Block {
    pub(crate) fn kind(&self) -> Kind {
        Kind::from_pcb(self.pcb)
    }

    pub(crate) fn encode(nad: u8, pcb: u8, info: &[u8], checksum: Checksum) -> Vec<u8> {
        let mut block = Vec::with_capacity(HEADER_LEN + info.len() + checksum.len());
        block.extend_from_slice(&[nad, pcb, info.len() as u8]);
        block.extend_from_slice(info);
        checksum.append(&mut block);
        block
    }

    /// Check framing and EDC. A bad EDC is reported as [`Error::CommError`].
    pub(crate) fn decode(bytes: &[u8], checksum: Checksum, expected_nad: u8) -> Result<Self> {
        if bytes.len() < HEADER_LEN + checksum.len() {
            return Err(Error::ProtocolError("short block"));
        }
        let len = bytes[2] as usize;
        if len > MAX_INFO || bytes.len() != HEADER_LEN + len + checksum.len() {
            return Err(Error::ProtocolError("bad block length"));
        }
        if !checksum.verify(bytes) {
            return Err(Error::CommError);
        }
        if bytes[0] != expected_nad {
            return Err(Error::ProtocolError("unexpected NAD"));
        }
        Ok(Self {
            pcb: bytes[1],
            info: bytes[HEADER_LEN..HEADER_LEN + len].to_vec(),
        })
    }
}

/// NAD the other side answers with: source and destination swapped.
pub(crate) const fn reply_nad(nad: u8) -> u8 {
    nad.rotate_left(4)
}

/// Read one raw block from the transport.
pub(crate) fn recv_block(
    driver: &mut dyn Driver,
    dad: u8,
    checksum: Checksum,
    timeout: Duration,
    block_oriented: bool,
) -> Result<Vec<u8>> {
    if block_oriented {
        let mut buf = vec![0u8; HEADER_LEN + MAX_INFO + checksum.len()];
        let n = driver.recv(dad, &mut buf, timeout)?;
        buf.truncate(n);
        return Ok(buf);
    }

    let mut buf = vec![0u8; HEADER_LEN];
    recv_exact(driver, dad, &mut buf, timeout)?;
    let len = buf[2] as usize;
    if len > MAX_INFO {
        return Err(Error::ProtocolError("bad block length"));
    }
    buf.resize(HEADER_LEN + len + checksum.len(), 0);
    recv_exact(driver, dad, &mut buf[HEADER_LEN..], timeout)?;
    Ok(buf)
}

/// Failures the transport can recover from by asking for a repeat.
fn recoverable(err: &Error) -> bool {
    matches!(err, Error::Timeout | Error::CommError | Error::ProtocolError(_))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Alive,
    Resynching,
}

/// Why an exchange was abandoned.
enum Abandon {
    Resync,
    Fault(Fault),
}

impl From<Fault> for Abandon {
    fn from(fault: Fault) -> Self {
        Self::Fault(fault)
    }
}

fn spend(retries: &mut u32) -> std::result::Result<(), Abandon> {
    if *retries == 0 {
        return Err(Abandon::Resync);
    }
    *retries -= 1;
    Ok(())
}

/// T=1 engine state for one slot.
#[derive(Debug, Clone)]
pub struct T1 {
    nad: u8,
    ns: u8,
    nr: u8,
    /// Largest INFO field the card accepts.
    pub ifsc: usize,
    /// Largest INFO field we accept.
    pub ifsd: usize,
    pub checksum: Checksum,
    /// R-block repairs per exchange before resynchronising.
    pub retries: u32,
    /// RESYNCH attempts before giving up on the card.
    pub resyncs: u32,
    pub timeout: Duration,
    pub block_oriented: bool,
    state: State,
}

impl T1 {
    #[must_use]
    pub fn new(nad: u8) -> Self {
        Self {
            nad,
            ns: 0,
            nr: 0,
            ifsc: DEFAULT_IFS,
            ifsd: DEFAULT_IFS,
            checksum: Checksum::Lrc,
            retries: 3,
            resyncs: 3,
            timeout: Duration::from_millis(3000),
            block_oriented: false,
            state: State::Alive,
        }
    }

    /// Take IFSC and the EDC method from the card's ATR.
    pub fn configure(&mut self, atr: &AtrInfo) {
        if let Some(ifsc) = atr.t1_ifsc() {
            self.ifsc = (ifsc as usize).min(MAX_INFO);
        }
        self.checksum = if atr.t1_uses_crc() {
            Checksum::Crc
        } else {
            Checksum::Lrc
        };
        tracing::debug!(ifsc = self.ifsc, checksum = ?self.checksum, "T=1 configured from ATR");
    }

    /// Exchange one APDU, resynchronising as needed.
    pub fn transceive(&mut self, driver: &mut dyn Driver, apdu: &[u8]) -> Exchange {
        let mut resyncs = self.resyncs;
        loop {
            match self.exchange(driver, apdu) {
                Ok(resp) => return Ok(resp),
                Err(Abandon::Fault(fault)) => return Err(fault),
                Err(Abandon::Resync) => {}
            }

            self.state = State::Resynching;
            loop {
                if resyncs == 0 {
                    tracing::warn!(nad = self.nad, state = ?self.state, "T=1 resynchronisation failed");
                    return Err(Fault::Lost(Error::CommError));
                }
                resyncs -= 1;
                match self.resync(driver) {
                    Ok(()) => break,
                    Err(err) => tracing::debug!(error = %err, "RESYNCH attempt failed"),
                }
            }
        }
    }

    /// Announce the largest INFO field we accept.
    pub fn negotiate_ifsd(&mut self, driver: &mut dyn Driver, ifsd: usize) -> Result<()> {
        if !(1..=MAX_INFO).contains(&ifsd) {
            return Err(Error::InvalidArg);
        }
        let request = self.s_block(pcb::IFS, &[ifsd as u8]);
        for _ in 0..=self.retries {
            self.send(driver, &request)?;
            let reply = match self.receive(driver, self.timeout) {
                Ok(reply) => reply,
                Err(err) if recoverable(&err) => continue,
                Err(err) => return Err(err),
            };
            if reply.kind() == (Kind::S { kind: pcb::IFS, response: true }) && reply.info == [ifsd as u8] {
                self.ifsd = ifsd;
                tracing::debug!(ifsd, "IFSD negotiated");
                return Ok(());
            }
        }
        Err(Error::ProtocolError("IFSD negotiation failed"))
    }

    fn exchange(&mut self, driver: &mut dyn Driver, apdu: &[u8]) -> std::result::Result<Vec<u8>, Abandon> {
        let mut offset = 0;
        let mut chunk = self.ifsc.min(apdu.len());
        let mut current = self.i_block(&apdu[..chunk], chunk < apdu.len());
        let mut sending = true;
        let mut next = current.clone();
        let mut resp = Vec::new();
        let mut retries = self.retries;
        let mut wtx = 1;

        loop {
            self.send(driver, &next).map_err(Fault::Lost)?;
            let timeout = self.timeout * wtx;
            wtx = 1;

            let block = match self.receive(driver, timeout) {
                Ok(block) => block,
                Err(err) if recoverable(&err) => {
                    spend(&mut retries)?;
                    let code = if err == Error::CommError {
                        pcb::R_EDC_ERROR
                    } else {
                        pcb::R_OTHER_ERROR
                    };
                    tracing::debug!(error = %err, retries, "Bad block, requesting repeat");
                    next = self.r_block(code);
                    continue;
                }
                Err(err) => return Err(Fault::Lost(err).into()),
            };

            match block.kind() {
                Kind::R { nr, error } => {
                    let chaining = offset + chunk < apdu.len();
                    if sending && nr != self.ns && chaining {
                        self.ns ^= 1;
                        offset += chunk;
                        chunk = self.ifsc.min(apdu.len() - offset);
                        let more = offset + chunk < apdu.len();
                        current = self.i_block(&apdu[offset..offset + chunk], more);
                        retries = self.retries;
                    } else {
                        spend(&mut retries)?;
                        tracing::debug!(error, retries, "Card requested a repeat");
                    }
                    next = if sending { current.clone() } else { self.r_block(pcb::R_OK) };
                }
                Kind::I { ns, more } => {
                    if sending {
                        if offset + chunk < apdu.len() {
                            spend(&mut retries)?;
                            next = self.r_block(pcb::R_OTHER_ERROR);
                            continue;
                        }
                        sending = false;
                        self.ns ^= 1;
                    }
                    if ns != self.nr {
                        spend(&mut retries)?;
                        next = self.r_block(pcb::R_OTHER_ERROR);
                        continue;
                    }
                    resp.extend_from_slice(&block.info);
                    self.nr ^= 1;
                    retries = self.retries;
                    if !more {
                        return Ok(resp);
                    }
                    next = self.r_block(pcb::R_OK);
                }
                Kind::S { kind: pcb::WTX, response: false } => {
                    let factor = block.info.first().copied().unwrap_or(1).max(1);
                    tracing::debug!(factor, "Card requested waiting time extension");
                    wtx = u32::from(factor);
                    next = self.s_block(pcb::WTX | pcb::S_RESPONSE, &[factor]);
                }
                Kind::S { kind: pcb::IFS, response: false } => {
                    if let Some(&size) = block.info.first()
                        && (1..=MAX_INFO).contains(&(size as usize))
                    {
                        self.ifsc = size as usize;
                        tracing::debug!(ifsc = self.ifsc, "Card changed IFSC");
                    }
                    next = self.s_block(pcb::IFS | pcb::S_RESPONSE, &block.info);
                }
                Kind::S { kind: pcb::ABORT, response: false } => {
                    tracing::debug!("Card aborted the exchange");
                    let ack = self.s_block(pcb::ABORT | pcb::S_RESPONSE, &[]);
                    self.send(driver, &ack).map_err(Fault::Lost)?;
                    return Err(Fault::Failed(Error::CardAborted).into());
                }
                Kind::S { .. } => {
                    spend(&mut retries)?;
                    next = self.r_block(pcb::R_OTHER_ERROR);
                }
            }
        }
    }

    fn resync(&mut self, driver: &mut dyn Driver) -> Result<()> {
        let request = self.s_block(pcb::RESYNCH, &[]);
        self.send(driver, &request)?;
        let reply = self.receive(driver, self.timeout)?;
        if reply.kind() != (Kind::S { kind: pcb::RESYNCH, response: true }) {
            return Err(Error::ProtocolError("expected RESYNCH response"));
        }
        self.ns = 0;
        self.nr = 0;
        self.state = State::Alive;
        tracing::debug!(nad = self.nad, "T=1 resynchronised");
        Ok(())
    }

    fn send(&self, driver: &mut dyn Driver, block: &[u8]) -> Result<()> {
        tracing::trace!(block = ?block, "T=1 send");
        driver.send(self.nad, block)
    }

    fn receive(&self, driver: &mut dyn Driver, timeout: Duration) -> Result<Block> {
        let raw = recv_block(driver, self.nad, self.checksum, timeout, self.block_oriented)?;
        tracing::trace!(block = ?raw, "T=1 recv");
        let block = Block::decode(&raw, self.checksum, reply_nad(self.nad))?;
        if block.info.len() > self.ifsd {
            return Err(Error::ProtocolError("block exceeds IFSD"));
        }
        Ok(block)
    }

    fn i_block(&self, info: &[u8], more: bool) -> Vec<u8> {
        let mut pcb = self.ns << 6;
        if more {
            pcb |= pcb::I_MORE;
        }
        Block::encode(self.nad, pcb, info, self.checksum)
    }

    fn r_block(&self, error: u8) -> Vec<u8> {
        Block::encode(self.nad, pcb::R_BLOCK | (self.nr << 4) | error, &[], self.checksum)
    }

    fn s_block(&self, kind: u8, info: &[u8]) -> Vec<u8> {
        Block::encode(self.nad, pcb::S_BLOCK | kind, info, self.checksum)
    }
}
