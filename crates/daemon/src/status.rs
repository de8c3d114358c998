//! Publishing reader state into the shared status file.

use openct_ifd::Reader;
use openct_protocol::{MAX_SLOTS, StatusFileMut};
use std::io;
use std::path::Path;

/// A status record claimed by this daemon; released on drop.
pub struct StatusSlot {
    file: StatusFileMut,
    index: usize,
}

impl StatusSlot {
    /// Claim record `index` of the file at `path`, creating the file with
    /// `capacity` records when it does not exist yet.
    pub fn claim(path: &Path, index: usize, capacity: usize) -> io::Result<Self> {
        let mut file = match StatusFileMut::open(path) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                StatusFileMut::create(path, capacity.max(index + 1))?
            }
            Err(e) => return Err(e),
        };
        let index = file.claim(Some(index))?;
        tracing::debug!(path = %path.display(), index, "Claimed status record");
        Ok(Self { file, index })
    }

    pub fn index(&self) -> usize {
        self.index
    }

    /// Copy the reader's name, flags and slot states into the record.
    pub fn publish(&mut self, reader: &Reader) -> io::Result<()> {
        let statuses = reader.statuses();
        self.file.update(self.index, |rec| {
            rec.set_name(reader.name());
            rec.flags = reader.flags().bits();
            rec.slot_count = statuses.len().min(MAX_SLOTS) as u32;
            for (slot, status) in statuses.iter().enumerate().take(MAX_SLOTS) {
                rec.set_card_status(slot, *status);
            }
        })
    }
}

impl Drop for StatusSlot {
    fn drop(&mut self) {
        if let Err(e) = self.file.release(self.index) {
            tracing::warn!(index = self.index, error = %e, "Failed to release status record");
        }
    }
}
