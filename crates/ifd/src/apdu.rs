//! ISO 7816-4 command APDU classification.

use openct_protocol::{Error, Result};

/// The four ISO 7816-4 command cases, short and extended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApduCase {
    /// No command data, no response data.
    Case1,
    /// Response data only.
    Case2Short,
    /// Command data only.
    Case3Short,
    /// Command and response data.
    Case4Short,
    Case2Extended,
    Case3Extended,
    Case4Extended,
}

/// Result of classifying a command APDU.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Apdu {
    pub case: ApduCase,
    /// Length of the command data field.
    pub lc: usize,
    /// Expected response length; a zero Le byte means 256 (65536 extended).
    pub le: usize,
}

impl Apdu {
    /// Offset of the command data in the APDU.
    #[must_use]
    pub const fn data_offset(&self) -> usize {
        if self.is_extended() { 7 } else { 5 }
    }

    #[must_use]
    pub const fn is_extended(&self) -> bool {
        matches!(
            self.case,
            ApduCase::Case2Extended | ApduCase::Case3Extended | ApduCase::Case4Extended
        )
    }
}

fn short_le(byte: u8) -> usize {
    if byte == 0 { 256 } else { byte as usize }
}

fn extended_len(hi: u8, lo: u8) -> usize {
    u16::from_be_bytes([hi, lo]) as usize
}

/// Classify `bytes` as a command APDU.
pub fn classify(bytes: &[u8]) -> Result<Apdu> {
    let n = bytes.len();
    let apdu = |case, lc, le| Ok(Apdu { case, lc, le });

    if n < 4 {
        return Err(Error::Malformed);
    }
    if n == 4 {
        return apdu(ApduCase::Case1, 0, 0);
    }
    if n == 5 {
        return apdu(ApduCase::Case2Short, 0, short_le(bytes[4]));
    }

    let p3 = bytes[4] as usize;
    if p3 != 0 {
        if n == 5 + p3 {
            return apdu(ApduCase::Case3Short, p3, 0);
        }
        if n == 5 + p3 + 1 {
            return apdu(ApduCase::Case4Short, p3, short_le(bytes[n - 1]));
        }
        return Err(Error::Malformed);
    }

    // A zero P3 followed by more bytes introduces the extended form.
    if n < 7 {
        return Err(Error::Malformed);
    }
    let len = extended_len(bytes[5], bytes[6]);
    if n == 7 {
        let le = if len == 0 { 65536 } else { len };
        return apdu(ApduCase::Case2Extended, 0, le);
    }
    if len == 0 {
        return Err(Error::Malformed);
    }
    if n == 7 + len {
        return apdu(ApduCase::Case3Extended, len, 0);
    }
    if n == 7 + len + 2 {
        let le = extended_len(bytes[n - 2], bytes[n - 1]);
        return apdu(ApduCase::Case4Extended, len, if le == 0 { 65536 } else { le });
    }
    Err(Error::Malformed)
}

/// Status word at the end of a response APDU.
#[must_use]
pub fn status_word(response: &[u8]) -> Option<u16> {
    let [.., sw1, sw2] = response else {
        return None;
    };
    Some(u16::from_be_bytes([*sw1, *sw2]))
}
