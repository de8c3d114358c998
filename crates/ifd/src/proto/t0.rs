//! ISO 7816-3 T=0, the character protocol driven by procedure bytes.

use super::Fault;
use crate::apdu::{self, ApduCase};
use crate::driver::{Driver, recv_exact};
use openct_protocol::Error;
use std::time::Duration;

type Exchange = std::result::Result<Vec<u8>, Fault>;

const NULL_BYTE: u8 = 0x60;
const GET_RESPONSE: u8 = 0xC0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Idle,
    Sending,
    Receiving,
}

/// T=0 engine state for one slot.
#[derive(Debug, Clone)]
pub struct T0 {
    dad: u8,
    state: State,
    pub timeout: Duration,
    /// Null procedure bytes tolerated before the card counts as mute.
    pub max_nulls: u32,
    /// The reader handles procedure bytes and exchanges whole TPDUs.
    pub block_oriented: bool,
}

impl Default for T0 {
    fn default() -> Self {
        Self::new(0)
    }
}

impl T0 {
    #[must_use]
    pub fn new(dad: u8) -> Self {
        Self {
            dad,
            state: State::Idle,
            timeout: Duration::from_secs(2),
            max_nulls: 50,
            block_oriented: false,
        }
    }

    /// Exchange one command APDU.
    pub fn transceive(&mut self, driver: &mut dyn Driver, apdu: &[u8]) -> Exchange {
        let info = apdu::classify(apdu)?;
        if info.is_extended() {
            return Err(Error::Unsupported.into());
        }

        let resp = match info.case {
            ApduCase::Case1 => {
                let mut header = [0u8; 5];
                header[..4].copy_from_slice(apdu);
                self.tpdu(driver, header, &[], 0)?
            }
            ApduCase::Case2Short => self.case2(driver, header_of(apdu), info.le)?,
            ApduCase::Case3Short => self.tpdu(driver, header_of(apdu), &apdu[5..], 0)?,
            ApduCase::Case4Short => {
                let resp = self.tpdu(driver, header_of(apdu), &apdu[5..apdu.len() - 1], 0)?;
                match resp.as_slice() {
                    [0x61, available] => {
                        let le = if *available == 0 { 256 } else { *available as usize };
                        let le = le.min(info.le);
                        tracing::trace!(le, "Fetching response with GET RESPONSE");
                        // A P3 of zero asks for 256 bytes.
                        let header = [0x00, GET_RESPONSE, 0x00, 0x00, le as u8];
                        self.case2(driver, header, le)?
                    }
                    _ => resp,
                }
            }
            _ => return Err(Error::Unsupported.into()),
        };
        Ok(resp)
    }

    /// Case 2 exchange, re-issued once when the card corrects Le with 6Cxx.
    fn case2(&mut self, driver: &mut dyn Driver, mut header: [u8; 5], le: usize) -> Exchange {
        let resp = self.tpdu(driver, header, &[], le)?;
        if let [0x6C, corrected] = resp.as_slice() {
            header[4] = *corrected;
            let le = if *corrected == 0 { 256 } else { *corrected as usize };
            tracing::debug!(le, "Card corrected Le, resending");
            return self.tpdu(driver, header, &[], le);
        }
        Ok(resp)
    }

    /// One command header with its data phase.
    fn tpdu(&mut self, driver: &mut dyn Driver, header: [u8; 5], data: &[u8], expect: usize) -> Exchange {
        if self.block_oriented {
            return self.tpdu_block(driver, header, data, expect);
        }

        tracing::trace!(header = ?header, "T=0 send header");
        driver.send(self.dad, &header).map_err(Fault::Lost)?;
        self.state = if data.is_empty() {
            State::Receiving
        } else {
            State::Sending
        };

        let ins = header[1];
        let mut sent = 0;
        let mut resp = Vec::with_capacity(expect + 2);
        let mut nulls = 0;

        loop {
            let byte = self.recv_byte(driver)?;

            if byte == NULL_BYTE {
                nulls += 1;
                if nulls > self.max_nulls {
                    return Err(self.lost(Error::CardMute));
                }
                continue;
            }

            if matches!(byte & 0xF0, 0x60 | 0x90) {
                let sw2 = self.recv_byte(driver)?;
                resp.extend_from_slice(&[byte, sw2]);
                self.state = State::Idle;
                return Ok(resp);
            }

            let count = if (byte ^ ins) & 0xFE == 0 {
                None
            } else if (byte ^ !ins) & 0xFE == 0 {
                Some(1)
            } else {
                return Err(self.lost(Error::ProtocolError("unexpected procedure byte")));
            };

            match self.state {
                State::Sending => {
                    let remaining = data.len() - sent;
                    let n = count.unwrap_or(remaining).min(remaining);
                    if n == 0 {
                        return Err(self.lost(Error::ProtocolError("card asked for more data")));
                    }
                    driver
                        .send(self.dad, &data[sent..sent + n])
                        .map_err(|err| self.lost(err))?;
                    sent += n;
                }
                State::Receiving => {
                    let remaining = expect - resp.len();
                    let n = count.unwrap_or(remaining).min(remaining);
                    if n == 0 {
                        return Err(self.lost(Error::ProtocolError("card sent too much data")));
                    }
                    let start = resp.len();
                    resp.resize(start + n, 0);
                    recv_exact(driver, self.dad, &mut resp[start..], self.timeout)
                        .map_err(|err| self.lost(err))?;
                }
                State::Idle => {
                    return Err(self.lost(Error::ProtocolError("no transfer pending")));
                }
            }
        }
    }

    /// TPDU exchange with a reader that handles procedure bytes itself.
    fn tpdu_block(&mut self, driver: &mut dyn Driver, header: [u8; 5], data: &[u8], expect: usize) -> Exchange {
        let mut tpdu = Vec::with_capacity(5 + data.len());
        tpdu.extend_from_slice(&header);
        tpdu.extend_from_slice(data);
        driver.send(self.dad, &tpdu).map_err(Fault::Lost)?;

        let mut resp = vec![0u8; expect + 2];
        let n = driver
            .recv(self.dad, &mut resp, self.timeout)
            .map_err(Fault::Lost)?;
        if n < 2 {
            return Err(Fault::Lost(Error::ProtocolError("short T=0 response")));
        }
        resp.truncate(n);
        Ok(resp)
    }

    fn recv_byte(&mut self, driver: &mut dyn Driver) -> std::result::Result<u8, Fault> {
        let mut byte = [0u8; 1];
        recv_exact(driver, self.dad, &mut byte, self.timeout).map_err(|err| self.lost(err))?;
        Ok(byte[0])
    }

    fn lost(&mut self, err: Error) -> Fault {
        tracing::debug!(state = ?self.state, error = %err, "T=0 exchange failed");
        self.state = State::Idle;
        Fault::Lost(err)
    }
}

fn header_of(apdu: &[u8]) -> [u8; 5] {
    let mut header = [0u8; 5];
    header.copy_from_slice(&apdu[..5]);
    header
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::Scripted;
    use hex_literal::hex;

    #[test]
    fn test_case1_appends_zero_p3() {
        let mut driver = Scripted::new();
        driver.reply(&hex!("90 00"));
        let resp = T0::new(0).transceive(&mut driver, &hex!("00 A4 00 00")).unwrap();
        assert_eq!(resp, hex!("90 00"));
        assert_eq!(driver.sent, vec![hex!("00 A4 00 00 00").to_vec()]);
    }

    #[test]
    fn test_case2_with_ack() {
        let mut driver = Scripted::new();
        driver.reply(&hex!("B0 01 02 03 04 90 00"));
        let resp = T0::new(0)
            .transceive(&mut driver, &hex!("00 B0 00 00 04"))
            .unwrap();
        assert_eq!(resp, hex!("01 02 03 04 90 00"));
    }

    #[test]
    fn test_case3_with_byte_by_byte_transfer() {
        let mut driver = Scripted::new();
        // ~INS twice, then ACK for the rest.
        driver.reply(&hex!("29 29 D6 90 00"));
        let resp = T0::new(0)
            .transceive(&mut driver, &hex!("00 D6 00 00 03 AA BB CC"))
            .unwrap();
        assert_eq!(resp, hex!("90 00"));
        assert_eq!(
            driver.sent,
            vec![
                hex!("00 D6 00 00 03").to_vec(),
                vec![0xAA],
                vec![0xBB],
                vec![0xCC],
            ]
        );
    }

    #[test]
    fn test_case4_issues_get_response() {
        let mut driver = Scripted::new();
        driver.reply(&hex!("88 61 10"));
        driver.reply(&[0xC0]);
        driver.reply(&[0x5A; 16]);
        driver.reply(&hex!("90 00"));

        let resp = T0::new(0)
            .transceive(&mut driver, &hex!("00 88 00 00 02 AA BB 10"))
            .unwrap();

        assert_eq!(
            driver.sent,
            vec![
                hex!("00 88 00 00 02").to_vec(),
                hex!("AA BB").to_vec(),
                hex!("00 C0 00 00 10").to_vec(),
            ]
        );
        assert_eq!(resp.len(), 18);
        assert_eq!(&resp[..16], &[0x5A; 16]);
        assert_eq!(&resp[16..], &hex!("90 00"));
    }

    #[test]
    fn test_case4_get_response_limited_by_le() {
        let mut driver = Scripted::new();
        driver.reply(&hex!("88 61 20 C0"));
        driver.reply(&[0x11; 8]);
        driver.reply(&hex!("90 00"));

        T0::new(0)
            .transceive(&mut driver, &hex!("00 88 00 00 01 AA 08"))
            .unwrap();
        assert_eq!(driver.sent[2], hex!("00 C0 00 00 08"));
    }

    #[test]
    fn test_case4_refusal_returns_status() {
        let mut driver = Scripted::new();
        driver.reply(&hex!("6A 82"));
        let resp = T0::new(0)
            .transceive(&mut driver, &hex!("00 88 00 00 01 AA 08"))
            .unwrap();
        assert_eq!(resp, hex!("6A 82"));
        assert_eq!(driver.sent.len(), 1);
    }

    #[test]
    fn test_wrong_le_is_corrected() {
        let mut driver = Scripted::new();
        driver.reply(&hex!("6C 02 B0 01 02 90 00"));
        let resp = T0::new(0)
            .transceive(&mut driver, &hex!("00 B0 00 00 08"))
            .unwrap();
        assert_eq!(resp, hex!("01 02 90 00"));
        assert_eq!(driver.sent[1], hex!("00 B0 00 00 02"));
    }

    #[test]
    fn test_null_bytes_then_mute() {
        let mut driver = Scripted::new();
        driver.reply(&hex!("60 60 90 00"));
        let mut t0 = T0::new(0);
        assert_eq!(
            t0.transceive(&mut driver, &hex!("00 A4 00 00")).unwrap(),
            hex!("90 00")
        );

        let mut driver = Scripted::new();
        driver.reply(&[NULL_BYTE; 4]);
        t0.max_nulls = 3;
        assert_eq!(
            t0.transceive(&mut driver, &hex!("00 A4 00 00")),
            Err(Fault::Lost(Error::CardMute))
        );
    }

    #[test]
    fn test_bad_procedure_byte() {
        let mut driver = Scripted::new();
        driver.reply(&[0x12]);
        let err = T0::new(0)
            .transceive(&mut driver, &hex!("00 A4 00 00"))
            .unwrap_err();
        assert!(matches!(err, Fault::Lost(Error::ProtocolError(_))));
    }

    #[test]
    fn test_extended_apdu_rejected() {
        let mut driver = Scripted::new();
        assert_eq!(
            T0::new(0).transceive(&mut driver, &hex!("00 B0 00 00 00 01 00")),
            Err(Fault::Failed(Error::Unsupported))
        );
        assert!(driver.sent.is_empty());
    }

    #[test]
    fn test_block_oriented_exchange() {
        let mut driver = Scripted::new();
        driver.reply(&hex!("01 02 90 00"));
        let mut t0 = T0::new(0);
        t0.block_oriented = true;
        let resp = t0.transceive(&mut driver, &hex!("00 B0 00 00 02")).unwrap();
        assert_eq!(resp, hex!("01 02 90 00"));
        assert_eq!(driver.sent, vec![hex!("00 B0 00 00 02").to_vec()]);
    }
}
