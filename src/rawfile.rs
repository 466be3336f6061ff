//! A handle over one backing object with positional I/O and a cached size.

use crate::error::Result;
use crate::store::{BackingStore, StoreHandle};

pub struct RawFile {
    handle: Box<dyn StoreHandle>,
    size: u64,
}

impl RawFile {
    pub fn open(
        store: &dyn BackingStore,
        path: &str,
        writable: bool,
        create: bool,
    ) -> Result<RawFile> {
        let mut handle = store.open(path, writable, create)?;
        let size = handle.size()?;
        Ok(RawFile { handle, size })
    }

    /// Reads at `off`; short only at EOF.
    pub fn read_at(&mut self, off: u64, buf: &mut [u8]) -> Result<usize> {
        self.handle.read_at(off, buf)
    }

    /// Writes all of `data` at `off`; partial writes surface as errors from
    /// the store layer.
    pub fn write_at(&mut self, off: u64, data: &[u8]) -> Result<()> {
        self.handle.write_at(off, data)?;
        self.size = self.size.max(off + data.len() as u64);
        Ok(())
    }

    /// Grows or shrinks the object; growth zero-fills at the store level.
    pub fn truncate(&mut self, size: u64) -> Result<()> {
        self.handle.truncate(size)?;
        self.size = size;
        Ok(())
    }

    /// Last known size. Kept current by this handle's own writes and
    /// truncates; [`RawFile::refresh_size`] re-stats the object.
    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn refresh_size(&mut self) -> Result<u64> {
        self.size = self.handle.size()?;
        Ok(self.size)
    }

    pub fn sync(&mut self, datasync: bool) -> Result<()> {
        self.handle.sync(datasync)
    }
}
