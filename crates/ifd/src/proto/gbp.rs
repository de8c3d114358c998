//! Gemplus Block Protocol, spoken between the host and some Gemplus readers.
//!
//! Blocks are laid out like T=1 blocks with an LRC, but every request and
//! answer fits in a single I-block; there is no chaining.

use super::Fault;
use super::t1::{Block, Kind, MAX_INFO, pcb, recv_block, reply_nad};
use crate::checksum::Checksum;
use crate::driver::Driver;
use openct_protocol::Error;
use std::time::Duration;

/// Host-to-reader node address.
const NAD: u8 = 0x42;

/// GBP engine state.
#[derive(Debug, Clone)]
pub struct Gbp {
    dad: u8,
    ns: u8,
    nr: u8,
    pub retries: u32,
    pub timeout: Duration,
}

impl Gbp {
    #[must_use]
    pub fn new(dad: u8) -> Self {
        Self {
            dad,
            ns: 0,
            nr: 0,
            retries: 3,
            timeout: Duration::from_secs(2),
        }
    }

    /// Send one command to the reader and return its answer.
    pub fn transceive(&mut self, driver: &mut dyn Driver, data: &[u8]) -> Result<Vec<u8>, Fault> {
        if data.len() > MAX_INFO {
            return Err(Fault::Failed(Error::InvalidArg));
        }

        let mut resynced = false;
        let mut retries = self.retries;
        let mut next = self.i_block(data);

        loop {
            driver.send(self.dad, &next).map_err(Fault::Lost)?;
            let reply = recv_block(driver, self.dad, Checksum::Lrc, self.timeout, false)
                .and_then(|raw| Block::decode(&raw, Checksum::Lrc, reply_nad(NAD)));

            let retry_with = match reply {
                Ok(block) => match block.kind() {
                    Kind::I { ns, .. } if ns == self.nr => {
                        self.ns ^= 1;
                        self.nr ^= 1;
                        return Ok(block.info);
                    }
                    Kind::R { .. } => self.i_block(data),
                    _ => self.r_block(pcb::R_OTHER_ERROR),
                },
                Err(Error::CommError) => self.r_block(pcb::R_EDC_ERROR),
                Err(Error::Timeout | Error::ProtocolError(_)) => self.r_block(pcb::R_OTHER_ERROR),
                Err(err) => return Err(Fault::Lost(err)),
            };

            if retries > 0 {
                retries -= 1;
                next = retry_with;
                continue;
            }
            if resynced {
                tracing::warn!("GBP link lost");
                return Err(Fault::Lost(Error::CommError));
            }
            self.resync(driver)?;
            resynced = true;
            retries = self.retries;
            next = self.i_block(data);
        }
    }

    fn resync(&mut self, driver: &mut dyn Driver) -> Result<(), Fault> {
        tracing::debug!("Resynchronising GBP link");
        let request = Block::encode(NAD, pcb::S_BLOCK | pcb::RESYNCH, &[], Checksum::Lrc);
        driver.send(self.dad, &request).map_err(Fault::Lost)?;
        let reply = recv_block(driver, self.dad, Checksum::Lrc, self.timeout, false)
            .and_then(|raw| Block::decode(&raw, Checksum::Lrc, reply_nad(NAD)))
            .map_err(|_| Fault::Lost(Error::CommError))?;
        if reply.kind() != (Kind::S { kind: pcb::RESYNCH, response: true }) {
            return Err(Fault::Lost(Error::CommError));
        }
        self.ns = 0;
        self.nr = 0;
        Ok(())
    }

    fn i_block(&self, data: &[u8]) -> Vec<u8> {
        Block::encode(NAD, self.ns << 6, data, Checksum::Lrc)
    }

    fn r_block(&self, error: u8) -> Vec<u8> {
        Block::encode(NAD, pcb::R_BLOCK | (self.nr << 4) | error, &[], Checksum::Lrc)
    }
}
