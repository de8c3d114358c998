//! Scripted driver for exercising the protocol engines.

use crate::atr::Atr;
use crate::driver::{Driver, ReaderInfo, Transport};
use openct_protocol::{CardStatus, Error, Result};
use std::collections::VecDeque;
use std::time::Duration;

/// Records everything sent and replays canned card output.
#[derive(Debug, Default)]
pub struct Scripted {
    pub sent: Vec<Vec<u8>>,
    replies: VecDeque<Vec<u8>>,
    pub atr: Vec<u8>,
    pub timeouts: Vec<Duration>,
    /// IFSD the reader asks T=1 cards for.
    pub ifsd: Option<usize>,
}

impl Scripted {
    pub fn new() -> Self {
        Self {
            atr: vec![0x3B, 0x00],
            ..Self::default()
        }
    }

    /// Queue `bytes` as one unit of card output.
    pub fn reply(&mut self, bytes: &[u8]) -> &mut Self {
        self.replies.push_back(bytes.to_vec());
        self
    }

    pub fn pending(&self) -> usize {
        self.replies.len()
    }
}

impl Transport for Scripted {
    fn send(&mut self, _dad: u8, data: &[u8]) -> Result<()> {
        self.sent.push(data.to_vec());
        Ok(())
    }

    fn recv(&mut self, _dad: u8, buf: &mut [u8], timeout: Duration) -> Result<usize> {
        self.timeouts.push(timeout);
        let Some(mut chunk) = self.replies.pop_front() else {
            return Err(Error::Timeout);
        };
        let n = chunk.len().min(buf.len());
        buf[..n].copy_from_slice(&chunk[..n]);
        if n < chunk.len() {
            chunk.drain(..n);
            self.replies.push_front(chunk);
        }
        Ok(n)
    }
}

impl Driver for Scripted {
    fn name(&self) -> &str {
        "scripted"
    }

    fn open(&mut self) -> Result<ReaderInfo> {
        let info = ReaderInfo::new("Scripted reader", 1);
        Ok(match self.ifsd {
            Some(ifsd) => info.with_ifsd(ifsd),
            None => info,
        })
    }

    fn card_status(&mut self, _slot: usize) -> Result<CardStatus> {
        Ok(CardStatus::PRESENT)
    }

    fn card_reset(&mut self, _slot: usize) -> Result<Atr> {
        Ok(Atr::Bytes(self.atr.clone()))
    }
}
