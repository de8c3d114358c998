//! Error detection codes for block protocols.

/// Longitudinal redundancy check: XOR of all bytes.
#[must_use]
pub fn lrc(data: &[u8]) -> u8 {
    data.iter().fold(0, |acc, &b| acc ^ b)
}

/// ISO 3309 CRC (CCITT polynomial, bit-reflected, initial value 0xFFFF).
#[must_use]
pub fn crc16(data: &[u8]) -> u16 {
    let mut crc: u16 = 0xFFFF;
    for &byte in data {
        crc ^= u16::from(byte);
        for _ in 0..8 {
            crc = if crc & 1 != 0 {
                (crc >> 1) ^ 0x8408
            } else {
                crc >> 1
            };
        }
    }
    crc
}

/// Checksum method negotiated for a T=1 style link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Checksum {
    #[default]
    Lrc,
    Crc,
}

impl Checksum {
    /// Number of EDC bytes this method appends.
    #[must_use]
    pub const fn len(self) -> usize {
        match self {
            Self::Lrc => 1,
            Self::Crc => 2,
        }
    }

    /// Append the EDC over `block` to `block`.
    pub fn append(self, block: &mut Vec<u8>) {
        match self {
            Self::Lrc => block.push(lrc(block)),
            Self::Crc => block.extend_from_slice(&crc16(block).to_be_bytes()),
        }
    }

    /// Verify the trailing EDC of `block`.
    #[must_use]
    pub fn verify(self, block: &[u8]) -> bool {
        let Some(split) = block.len().checked_sub(self.len()) else {
            return false;
        };
        let (body, edc) = block.split_at(split);
        match self {
            Self::Lrc => edc[0] == lrc(body),
            Self::Crc => edc == crc16(body).to_be_bytes(),
        }
    }
}
