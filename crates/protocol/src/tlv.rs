//! Tag-length-value codec used for request arguments and replies.
//!
//! Items are `[tag, len, value...]`. The short form limits `len` to 0..=254;
//! the large form lets a length byte of `0xFF` escape to a two-byte
//! big-endian length. Tags are unique within a message; if a tag repeats
//! the last occurrence wins.

use crate::buffer::Buffer;
use crate::error::{Error, Result};

/// Length byte that escapes to a two-byte length in the large form.
const LARGE_ESCAPE: u8 = 0xFF;
const SHORT_MAX: usize = 254;
const LARGE_MAX: usize = u16::MAX as usize;

/// Index of a parsed TLV stream, borrowing the underlying bytes.
pub struct TlvParser<'a> {
    data: &'a [u8],
    index: [Option<(usize, usize)>; 256],
}

impl<'a> TlvParser<'a> {
    /// Parse a short-form stream.
    pub fn parse(data: &'a [u8]) -> Result<Self> {
        Self::parse_with(data, false)
    }

    /// Parse a stream that may contain large-form lengths.
    pub fn parse_large(data: &'a [u8]) -> Result<Self> {
        Self::parse_with(data, true)
    }

    fn parse_with(data: &'a [u8], large: bool) -> Result<Self> {
        let mut index = [None; 256];
        let mut pos = 0;

        while pos < data.len() {
            if pos + 2 > data.len() {
                return Err(Error::Malformed);
            }
            let tag = data[pos];
            let mut len = data[pos + 1] as usize;
            pos += 2;

            if data[pos - 1] == LARGE_ESCAPE {
                if !large {
                    return Err(Error::Malformed);
                }
                if pos + 2 > data.len() {
                    return Err(Error::Malformed);
                }
                len = u16::from_be_bytes([data[pos], data[pos + 1]]) as usize;
                pos += 2;
            }

            if pos + len > data.len() {
                return Err(Error::Malformed);
            }
            index[tag as usize] = Some((pos, len));
            pos += len;
        }

        Ok(Self { data, index })
    }

    /// Raw value of `tag`.
    #[must_use]
    pub fn get(&self, tag: u8) -> Option<&'a [u8]> {
        let data: &'a [u8] = self.data;
        self.index[tag as usize].map(|(off, len)| &data[off..off + len])
    }

    #[must_use]
    pub fn contains(&self, tag: u8) -> bool {
        self.index[tag as usize].is_some()
    }

    /// Opaque slice view of `tag`.
    #[must_use]
    pub fn get_opaque(&self, tag: u8) -> Option<&'a [u8]> {
        self.get(tag)
    }

    /// String value of `tag`, truncated so it fits a `size`-byte C buffer
    /// (i.e. at most `size - 1` bytes, leaving room for a terminator).
    #[must_use]
    pub fn get_string(&self, tag: u8, size: usize) -> Option<String> {
        let value = self.get(tag)?;
        let value = value.split(|&b| b == 0).next().unwrap_or_default();
        let n = value.len().min(size.saturating_sub(1));
        Some(String::from_utf8_lossy(&value[..n]).into_owned())
    }

    /// Big-endian unsigned integer of 0 to 4 bytes.
    pub fn get_int(&self, tag: u8) -> Result<Option<u32>> {
        let Some(value) = self.get(tag) else {
            return Ok(None);
        };
        if value.len() > 4 {
            return Err(Error::Malformed);
        }
        Ok(Some(value.iter().fold(0u32, |acc, &b| (acc << 8) | u32::from(b))))
    }

    /// Copy at most `out.len()` bytes of `tag` into `out`.
    #[must_use]
    pub fn get_bytes(&self, tag: u8, out: &mut [u8]) -> Option<usize> {
        let value = self.get(tag)?;
        let n = value.len().min(out.len());
        out[..n].copy_from_slice(&value[..n]);
        Some(n)
    }

    /// Tags present in the stream, in ascending order.
    pub fn tags(&self) -> impl Iterator<Item = u8> + '_ {
        (0..=255u8).filter(|&tag| self.contains(tag))
    }
}

/// Incremental TLV writer on top of a [`Buffer`].
///
/// Errors are sticky: after an overflow every later call is a no-op and
/// [`TlvBuilder::finish`] reports the first failure.
pub struct TlvBuilder<'b> {
    buf: &'b mut Buffer,
    large: bool,
    len_at: Option<usize>,
    len: usize,
    error: Option<Error>,
}

impl<'b> TlvBuilder<'b> {
    pub fn new(buf: &'b mut Buffer) -> Self {
        Self {
            buf,
            large: false,
            len_at: None,
            len: 0,
            error: None,
        }
    }

    pub fn new_large(buf: &'b mut Buffer) -> Self {
        Self {
            large: true,
            ..Self::new(buf)
        }
    }

    fn fail(&mut self, err: Error) {
        if self.error.is_none() {
            self.error = Some(err);
        }
    }

    fn write(&mut self, data: &[u8]) -> bool {
        if self.error.is_some() {
            return false;
        }
        if let Err(err) = self.buf.put(data) {
            self.fail(err);
            return false;
        }
        true
    }

    /// Start a new item; its length is patched as value bytes are added.
    pub fn put_tag(&mut self, tag: u8) -> &mut Self {
        let header = [tag, if self.large { LARGE_ESCAPE } else { 0 }, 0, 0];
        let header_len = if self.large { 4 } else { 2 };
        let start = self.buf.tail_offset();
        if self.write(&header[..header_len]) {
            self.len_at = Some(start + 1);
            self.len = 0;
        }
        self
    }

    /// Append value bytes to the current item.
    pub fn add_bytes(&mut self, data: &[u8]) -> &mut Self {
        let Some(len_at) = self.len_at else {
            self.fail(Error::InvalidArg);
            return self;
        };
        let max = if self.large { LARGE_MAX } else { SHORT_MAX };
        if self.len + data.len() > max {
            self.fail(Error::BufferTooSmall);
            return self;
        }
        if !self.write(data) {
            return self;
        }
        self.len += data.len();

        let patched = if self.large {
            let [hi, lo] = (self.len as u16).to_be_bytes();
            self.buf.patch(len_at + 1, &[hi, lo])
        } else {
            self.buf.patch(len_at, &[self.len as u8])
        };
        if let Err(err) = patched {
            self.fail(err);
        }
        self
    }

    /// Append one big-endian integer to the current item, using as few
    /// bytes as possible (at least one).
    pub fn add_int(&mut self, value: u32) -> &mut Self {
        let bytes = value.to_be_bytes();
        let skip = bytes.iter().take(3).take_while(|&&b| b == 0).count();
        self.add_bytes(&bytes[skip..])
    }

    pub fn put_bytes(&mut self, tag: u8, data: &[u8]) -> &mut Self {
        self.put_tag(tag).add_bytes(data)
    }

    pub fn put_int(&mut self, tag: u8, value: u32) -> &mut Self {
        self.put_tag(tag).add_int(value)
    }

    pub fn put_string(&mut self, tag: u8, value: &str) -> &mut Self {
        self.put_tag(tag).add_bytes(value.as_bytes())
    }

    pub fn put_opaque(&mut self, tag: u8, value: &[u8]) -> &mut Self {
        self.put_bytes(tag, value)
    }

    /// First error hit while building, if any.
    pub fn finish(&mut self) -> Result<()> {
        match self.error.take() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}
