//! Byte-granular I/O on top of aligned block I/O.
//!
//! [`BlockFile`] turns arbitrary offset/length reads and writes into whole-
//! block operations against a [`BlockIo`] below it: full blocks move
//! directly between the caller's buffer and the lower layer, partial head
//! and tail blocks go through a scratch block (read-modify-write on the
//! write path). Writing past EOF fills the gap with zero blocks written
//! through the lower layer, so holes land encrypted on disk.

use crate::error::Result;

/// Aligned block I/O as implemented by the cipher layer.
///
/// Invariants for callers: `data.len() <= block_size()` on writes, only the
/// final block of a file may be short, and block `n` covers plaintext bytes
/// `[n * block_size(), (n + 1) * block_size())`.
pub trait BlockIo: Send {
    fn block_size(&self) -> usize;

    /// Reads one block into `buf` (which holds at least `block_size()`
    /// bytes), returning the number of payload bytes; short only at EOF.
    fn read_block(&mut self, block: u64, buf: &mut [u8]) -> Result<usize>;

    /// Writes one whole or final-partial block.
    fn write_block(&mut self, block: u64, data: &[u8]) -> Result<()>;

    /// Current plaintext length.
    fn plain_size(&self) -> u64;

    /// Cuts the underlying storage to exactly `plain_size` plaintext bytes.
    /// A tail that lands mid-block must be rewritten by the caller.
    fn truncate(&mut self, plain_size: u64) -> Result<()>;

    fn sync(&mut self, datasync: bool) -> Result<()>;
}

pub struct BlockFile<B: BlockIo> {
    io: B,
    scratch: Vec<u8>,
}

impl<B: BlockIo> BlockFile<B> {
    pub fn new(io: B) -> Self {
        let bs = io.block_size();
        BlockFile {
            io,
            scratch: vec![0u8; bs],
        }
    }

    pub fn size(&self) -> u64 {
        self.io.plain_size()
    }

    pub fn sync(&mut self, datasync: bool) -> Result<()> {
        self.io.sync(datasync)
    }

    pub fn io_mut(&mut self) -> &mut B {
        &mut self.io
    }

    /// Reads `buf.len()` bytes at `off`; returns how many were produced,
    /// short only at EOF.
    pub fn read(&mut self, off: u64, buf: &mut [u8]) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let bs = self.io.block_size();
        let mut produced = 0usize;
        let mut pos = off;
        let end = off + buf.len() as u64;

        while pos < end {
            let block = pos / bs as u64;
            let boff = (pos % bs as u64) as usize;
            let want = ((end - pos) as usize).min(bs - boff);

            if boff == 0 && want == bs {
                let got = self.io.read_block(block, &mut buf[produced..produced + bs])?;
                produced += got;
                if got < bs {
                    break;
                }
            } else {
                let got = self.io.read_block(block, &mut self.scratch)?;
                if got <= boff {
                    break;
                }
                let take = (got - boff).min(want);
                buf[produced..produced + take].copy_from_slice(&self.scratch[boff..boff + take]);
                produced += take;
                if take < want {
                    break;
                }
            }
            pos += want as u64;
        }
        Ok(produced)
    }

    /// Writes all of `data` at `off`, extending the file as needed.
    pub fn write(&mut self, off: u64, data: &[u8]) -> Result<()> {
        if data.is_empty() {
            return Ok(());
        }
        let size = self.io.plain_size();
        if off > size {
            self.zero_fill(size, off)?;
        }
        self.write_span(off, data)
    }

    fn write_span(&mut self, off: u64, data: &[u8]) -> Result<()> {
        let bs = self.io.block_size();
        let mut pos = off;
        let mut rem = data;

        while !rem.is_empty() {
            let block = pos / bs as u64;
            let boff = (pos % bs as u64) as usize;
            let n = rem.len().min(bs - boff);

            if boff == 0 && n == bs {
                self.io.write_block(block, &rem[..bs])?;
            } else {
                let have = self.io.read_block(block, &mut self.scratch)?;
                if have < boff {
                    self.scratch[have..boff].fill(0);
                }
                self.scratch[boff..boff + n].copy_from_slice(&rem[..n]);
                let len = have.max(boff + n);
                self.io.write_block(block, &self.scratch[..len])?;
            }
            pos += n as u64;
            rem = &rem[n..];
        }
        Ok(())
    }

    /// Fills `[from, to)` with zeros written through the lower layer.
    fn zero_fill(&mut self, mut from: u64, to: u64) -> Result<()> {
        let bs = self.io.block_size();
        let zeros = vec![0u8; bs];
        while from < to {
            let boff = (from % bs as u64) as usize;
            let n = ((to - from) as usize).min(bs - boff);
            self.write_span(from, &zeros[..n])?;
            from += n as u64;
        }
        Ok(())
    }

    pub fn truncate(&mut self, new_size: u64) -> Result<()> {
        let bs = self.io.block_size() as u64;
        let cur = self.io.plain_size();
        if new_size == cur {
            return Ok(());
        }
        if new_size > cur {
            return self.zero_fill(cur, new_size);
        }

        let tail = (new_size % bs) as usize;
        if tail == 0 {
            return self.io.truncate(new_size);
        }
        // Shrinking inside a block: the surviving prefix has to be
        // re-encrypted at its new (stream) length.
        let block = new_size / bs;
        let got = self.io.read_block(block, &mut self.scratch)?;
        self.io.truncate(new_size)?;
        let keep = tail.min(got);
        if keep > 0 {
            self.io.write_block(block, &self.scratch[..keep])?;
        }
        Ok(())
    }
}
