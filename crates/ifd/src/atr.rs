//! Answer-To-Reset parsing and protocol type selection (PTS).

use openct_protocol::{Error, Result};

/// Longest ATR a card may send.
pub const MAX_ATR_LEN: usize = 33;

/// The ATR held by a slot.
///
/// Synchronous memory cards do not answer to reset the ISO way; their slot
/// holds [`Atr::None`] rather than an empty byte string.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Atr {
    #[default]
    None,
    Bytes(Vec<u8>),
}

impl Atr {
    #[must_use]
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Self::None => None,
            Self::Bytes(bytes) => Some(bytes),
        }
    }

    #[must_use]
    pub fn is_none(&self) -> bool {
        matches!(self, Self::None)
    }
}

/// Bit convention announced by TS.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Convention {
    Direct,
    Inverse,
}

/// Parsed interface and historical bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AtrInfo {
    pub convention: Convention,
    /// TA1..TA4; `None` when absent.
    pub ta: [Option<u8>; 4],
    pub tb: [Option<u8>; 4],
    pub tc: [Option<u8>; 4],
    /// Bit `n` set when the card offers T=n.
    pub supported_protocols: u32,
    /// First protocol offered.
    pub default_protocol: u8,
    pub historical: Vec<u8>,
}

impl AtrInfo {
    #[must_use]
    pub fn supports(&self, protocol: u8) -> bool {
        protocol < 32 && self.supported_protocols & (1 << protocol) != 0
    }

    /// TA2 present means the card runs in specific mode and refuses PTS.
    #[must_use]
    pub fn specific_mode(&self) -> bool {
        self.ta[1].is_some()
    }

    /// Card's maximum information field size for T=1 (TA3).
    #[must_use]
    pub fn t1_ifsc(&self) -> Option<u8> {
        self.ta[2].filter(|&ifsc| ifsc != 0 && ifsc != 0xFF)
    }

    /// Whether the card asks for CRC instead of LRC in T=1 (TC3 bit 0).
    #[must_use]
    pub fn t1_uses_crc(&self) -> bool {
        self.tc[2].is_some_and(|tc| tc & 0x01 != 0)
    }
}

/// Parse raw ATR bytes.
pub fn parse(atr: &[u8]) -> Result<AtrInfo> {
    if atr.len() < 2 || atr.len() > MAX_ATR_LEN {
        return Err(Error::InvalidAtr);
    }
    let convention = match atr[0] {
        0x3B => Convention::Direct,
        0x3F => Convention::Inverse,
        _ => return Err(Error::InvalidAtr),
    };

    let t0 = atr[1];
    let historical_len = (t0 & 0x0F) as usize;
    let mut presence = t0 >> 4;
    let mut info = AtrInfo {
        convention,
        ta: [None; 4],
        tb: [None; 4],
        tc: [None; 4],
        supported_protocols: 0,
        default_protocol: 0,
        historical: Vec::new(),
    };

    let mut pos = 2;
    let mut group = 0;
    let mut saw_td = false;
    let next = |pos: &mut usize| -> Result<u8> {
        let byte = *atr.get(*pos).ok_or(Error::InvalidAtr)?;
        *pos += 1;
        Ok(byte)
    };

    loop {
        if presence & 0x01 != 0 {
            let byte = next(&mut pos)?;
            if group < 4 {
                info.ta[group] = Some(byte);
            }
        }
        if presence & 0x02 != 0 {
            let byte = next(&mut pos)?;
            if group < 4 {
                info.tb[group] = Some(byte);
            }
        }
        if presence & 0x04 != 0 {
            let byte = next(&mut pos)?;
            if group < 4 {
                info.tc[group] = Some(byte);
            }
        }
        if presence & 0x08 == 0 {
            break;
        }

        let td = next(&mut pos)?;
        let protocol = td & 0x0F;
        if !saw_td {
            info.default_protocol = protocol;
            saw_td = true;
        }
        info.supported_protocols |= 1 << protocol;
        presence = td >> 4;
        group += 1;
    }

    if !saw_td {
        info.supported_protocols = 1 << 0;
        info.default_protocol = 0;
    }

    let hist_end = pos + historical_len;
    if hist_end > atr.len() {
        return Err(Error::InvalidAtr);
    }
    info.historical = atr[pos..hist_end].to_vec();

    let needs_tck = info.supported_protocols & !1 != 0;
    let trailing = atr.len() - hist_end;
    match (needs_tck, trailing) {
        (true, 1) => {
            if atr[1..].iter().fold(0u8, |acc, &b| acc ^ b) != 0 {
                return Err(Error::InvalidAtr);
            }
        }
        (true, _) => return Err(Error::InvalidAtr),
        // Some T=0 cards append a TCK anyway; it carries no obligation.
        (false, 0 | 1) => {}
        (false, _) => return Err(Error::InvalidAtr),
    }

    Ok(info)
}

/// Build the PTS request selecting `protocol`.
///
/// PTS1 and PTS3 echo TA1 and TC1 when the card sent them.
#[must_use]
pub fn build_pts(info: &AtrInfo, protocol: u8) -> Vec<u8> {
    let mut pts = vec![0xFF, protocol & 0x0F];
    if let Some(ta1) = info.ta[0] {
        pts.push(ta1);
        pts[1] |= 0x10;
    }
    if let Some(tc1) = info.tc[0] {
        pts.push(tc1);
        pts[1] |= 0x20;
    }
    let pck = pts.iter().fold(0u8, |acc, &b| acc ^ b);
    pts.push(pck);
    pts
}

/// Parameters confirmed by a PTS response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pts {
    pub protocol: u8,
    pub pts1: Option<u8>,
    pub pts2: Option<u8>,
    pub pts3: Option<u8>,
}

/// Decode a PTS message (request or card echo).
pub fn parse_pts(pts: &[u8]) -> Result<Pts> {
    let [0xFF, pts0, rest @ ..] = pts else {
        return Err(Error::ProtocolError("bad PTS header"));
    };
    if pts.iter().fold(0u8, |acc, &b| acc ^ b) != 0 {
        return Err(Error::ProtocolError("bad PTS checksum"));
    }
    let mut rest = rest.iter().copied();
    let mut optional = |bit: u8| {
        if pts0 & bit != 0 { rest.next() } else { None }
    };
    let pts1 = optional(0x10);
    let pts2 = optional(0x20);
    let pts3 = optional(0x40);
    Ok(Pts {
        protocol: pts0 & 0x0F,
        pts1,
        pts2,
        pts3,
    })
}

/// Check the card's answer to `request`.
///
/// An identical echo confirms everything; an answer that keeps the protocol
/// but drops optional bytes confirms the protocol at default parameters.
pub fn verify_pts(request: &[u8], response: &[u8]) -> Result<u8> {
    let asked = parse_pts(request)?;
    if request == response {
        return Ok(asked.protocol);
    }
    let answered = parse_pts(response)?;
    if answered.protocol != asked.protocol {
        return Err(Error::ProtocolError("PTS refused"));
    }
    Ok(answered.protocol)
}
