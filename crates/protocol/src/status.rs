//! Shared reader status file.
//!
//! The file is an array of fixed-size [`StatusRecord`]s, one per reader,
//! memory-mapped by the owning daemons (read-write, through
//! [`StatusFileMut`]) and by clients (read-only, through [`StatusFile`]).
//! Record `n` lives at offset `n * StatusRecord::SIZE`.

use bitflags::bitflags;
use std::fs::OpenOptions;
use std::io;
use std::os::fd::AsRawFd;
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;
use std::ptr::NonNull;

/// Maximum number of slots per reader.
pub const MAX_SLOTS: usize = 8;

/// Maximum reader name length stored in a record.
pub const NAME_LEN: usize = 64;

bitflags! {
    /// Card status bits, per slot.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct CardStatus: u8 {
        /// A card is inserted.
        const PRESENT = 0x01;
        /// The card was inserted or removed since the last query.
        const CHANGED = 0x02;
    }
}

bitflags! {
    /// Reader capability bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct ReaderFlags: u32 {
        /// The reader has a display.
        const DISPLAY = 0x01;
        /// The reader has a PIN pad.
        const KEYPAD = 0x02;
    }
}

/// One reader's entry in the status file.
///
/// Plain integers only, so any bit pattern in the mapping is a valid value.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusRecord {
    /// Pid of the owning daemon, or zero when unused.
    pub pid: u32,
    /// [`ReaderFlags`] bits.
    pub flags: u32,
    /// NUL-padded reader name.
    pub name: [u8; NAME_LEN],
    /// Number of slots in use.
    pub slot_count: u32,
    /// [`CardStatus`] bits per slot.
    pub card: [u8; MAX_SLOTS],
}

impl StatusRecord {
    /// Size of a record in the file.
    pub const SIZE: usize = std::mem::size_of::<Self>();

    #[must_use]
    pub const fn empty() -> Self {
        Self {
            pid: 0,
            flags: 0,
            name: [0; NAME_LEN],
            slot_count: 0,
            card: [0; MAX_SLOTS],
        }
    }

    #[must_use]
    pub fn name(&self) -> String {
        let end = self.name.iter().position(|&b| b == 0).unwrap_or(NAME_LEN);
        String::from_utf8_lossy(&self.name[..end]).into_owned()
    }

    /// Store `name`, truncated to leave room for a terminator.
    pub fn set_name(&mut self, name: &str) {
        self.name = [0; NAME_LEN];
        let bytes = name.as_bytes();
        let n = bytes.len().min(NAME_LEN - 1);
        self.name[..n].copy_from_slice(&bytes[..n]);
    }

    #[must_use]
    pub fn flags(&self) -> ReaderFlags {
        ReaderFlags::from_bits_truncate(self.flags)
    }

    #[must_use]
    pub fn card_status(&self, slot: usize) -> CardStatus {
        self.card
            .get(slot)
            .map(|&bits| CardStatus::from_bits_truncate(bits))
            .unwrap_or_default()
    }

    pub fn set_card_status(&mut self, slot: usize, status: CardStatus) {
        if let Some(bits) = self.card.get_mut(slot) {
            *bits = status.bits();
        }
    }

    /// Whether the record is owned by a process that still exists.
    #[must_use]
    pub fn is_alive(&self) -> bool {
        self.pid != 0 && process_exists(self.pid)
    }
}

impl Default for StatusRecord {
    fn default() -> Self {
        Self::empty()
    }
}

fn process_exists(pid: u32) -> bool {
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return false;
    };
    // SAFETY: signal 0 only checks existence and permission.
    if unsafe { libc::kill(pid, 0) } == 0 {
        return true;
    }
    io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

/// A shared mapping of the whole file.
struct Mapping {
    ptr: NonNull<StatusRecord>,
    count: usize,
}

impl Mapping {
    fn new(path: &Path, writable: bool) -> io::Result<Self> {
        let file = OpenOptions::new().read(true).write(writable).open(path)?;
        let len = file.metadata()?.len() as usize;
        let count = len / StatusRecord::SIZE;
        if count == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "status file holds no records",
            ));
        }

        let prot = if writable {
            libc::PROT_READ | libc::PROT_WRITE
        } else {
            libc::PROT_READ
        };
        // SAFETY: fd is valid for the duration of the call; the mapping
        // stays valid after the file is closed.
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                count * StatusRecord::SIZE,
                prot,
                libc::MAP_SHARED,
                file.as_raw_fd(),
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }
        let ptr = NonNull::new(ptr.cast::<StatusRecord>())
            .ok_or_else(|| io::Error::other("mmap returned null"))?;
        Ok(Self { ptr, count })
    }

    fn records(&self) -> &[StatusRecord] {
        // SAFETY: the mapping is page aligned, spans `count` records and
        // every bit pattern is a valid StatusRecord.
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.count) }
    }

    fn records_mut(&mut self) -> &mut [StatusRecord] {
        // SAFETY: as above; only a writable mapping hands out this view.
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.count) }
    }

    fn sync(&self) -> io::Result<()> {
        // SAFETY: ptr/len describe exactly the mapping created in `new`.
        let rc = unsafe {
            libc::msync(
                self.ptr.as_ptr().cast(),
                self.count * StatusRecord::SIZE,
                libc::MS_SYNC,
            )
        };
        if rc == 0 {
            Ok(())
        } else {
            Err(io::Error::last_os_error())
        }
    }
}

impl Drop for Mapping {
    fn drop(&mut self) {
        // SAFETY: unmapping the region mapped in `new`; no views outlive self.
        unsafe {
            libc::munmap(self.ptr.as_ptr().cast(), self.count * StatusRecord::SIZE);
        }
    }
}

// SAFETY: the mapping is plain shared memory owned by this handle.
unsafe impl Send for Mapping {}

/// Read-only view used by clients.
pub struct StatusFile {
    map: Mapping,
}

impl StatusFile {
    pub fn open(path: &Path) -> io::Result<Self> {
        Ok(Self {
            map: Mapping::new(path, false)?,
        })
    }

    #[must_use]
    pub fn records(&self) -> &[StatusRecord] {
        self.map.records()
    }

    #[must_use]
    pub fn get(&self, index: usize) -> Option<StatusRecord> {
        self.records().get(index).copied()
    }

    /// Records owned by a running daemon, with their reader index.
    pub fn readers(&self) -> impl Iterator<Item = (usize, &StatusRecord)> {
        self.records()
            .iter()
            .enumerate()
            .filter(|(_, rec)| rec.is_alive())
    }
}

/// Read-write view, held only by reader daemons and the init command.
pub struct StatusFileMut {
    map: Mapping,
}

impl StatusFileMut {
    /// Unlink and recreate the file with `count` zeroed records.
    pub fn create(path: &Path, count: usize) -> io::Result<Self> {
        match std::fs::remove_file(path) {
            Err(err) if err.kind() != io::ErrorKind::NotFound => return Err(err),
            _ => {}
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .mode(0o644)
            .open(path)?;
        file.set_len((count.max(1) * StatusRecord::SIZE) as u64)?;
        drop(file);

        tracing::debug!(path = %path.display(), count, "Status file created");
        Self::open(path)
    }

    pub fn open(path: &Path) -> io::Result<Self> {
        Ok(Self {
            map: Mapping::new(path, true)?,
        })
    }

    #[must_use]
    pub fn records(&self) -> &[StatusRecord] {
        self.map.records()
    }

    pub fn records_mut(&mut self) -> &mut [StatusRecord] {
        self.map.records_mut()
    }

    /// Claim a record for the calling process.
    ///
    /// With `Some(index)` only that record is considered; otherwise the
    /// first record that is unused or owned by a vanished process is taken.
    pub fn claim(&mut self, index: Option<usize>) -> io::Result<usize> {
        let pid = std::process::id();
        let free = |rec: &StatusRecord| rec.pid == 0 || rec.pid == pid || !rec.is_alive();

        let found = match index {
            Some(n) => self.records().get(n).filter(|&rec| free(rec)).map(|_| n),
            None => self.records().iter().position(free),
        };
        let Some(n) = found else {
            return Err(io::Error::new(
                io::ErrorKind::AddrInUse,
                "no free status record",
            ));
        };

        let rec = &mut self.records_mut()[n];
        *rec = StatusRecord::empty();
        rec.pid = pid;
        self.publish()?;
        Ok(n)
    }

    /// Clear a record owned by this process.
    pub fn release(&mut self, index: usize) -> io::Result<()> {
        if let Some(rec) = self.records_mut().get_mut(index) {
            *rec = StatusRecord::empty();
        }
        self.publish()
    }

    /// Modify record `index` in place and publish it.
    pub fn update(&mut self, index: usize, f: impl FnOnce(&mut StatusRecord)) -> io::Result<()> {
        let rec = self
            .records_mut()
            .get_mut(index)
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "no such status record"))?;
        f(rec);
        self.publish()
    }

    /// Flush the mapping so readers see a consistent record.
    pub fn publish(&self) -> io::Result<()> {
        self.map.sync()
    }
}
