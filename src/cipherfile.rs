//! Block encryption over the MAC framing, plus the per-file IV header.
//!
//! Implements [`BlockIo`] for the block pipeline above it: full blocks are
//! block-encrypted, a short tail is stream-encrypted so its stored length
//! equals its plaintext length. When the volume uses per-file IVs, a random
//! 64-bit value is kept (encrypted) in the first 8 bytes of the raw object
//! and folded into every block IV:
//!
//! ```text
//! block_iv(n) = external_iv ^ file_iv ^ n
//! ```
//!
//! The external IV comes from the name layer (the IV chain at the file's
//! path). When a rename changes it, [`CipherFile::set_external_iv`] re-bases
//! the stored file IV so `external_iv ^ file_iv` is invariant: block IVs
//! stay valid and only the header is rewritten.

use std::sync::Arc;

use crate::blockfile::BlockIo;
use crate::crypto::{self, Cipher};
use crate::error::{Error, Result};
use crate::macfile::MacFile;
use crate::store::BackingStore;

/// Width of the encrypted per-file IV header.
pub const HEADER_LEN: u64 = 8;

pub struct CipherFile {
    io: MacFile,
    cipher: Arc<Cipher>,
    block_size: usize,
    unique_iv: bool,
    header_seed: u64,
    external_iv: u64,
    file_iv: u64,
    header_loaded: bool,
    scratch: Vec<u8>,
}

impl CipherFile {
    /// Wraps an opened MAC layer. Reads the IV header of an existing file;
    /// a new file gets its header lazily on first write so empty files
    /// occupy no space.
    pub fn new(
        mut io: MacFile,
        cipher: Arc<Cipher>,
        block_size: usize,
        unique_iv: bool,
        header_seed: u64,
        external_iv: u64,
    ) -> Result<Self> {
        let mut file_iv = 0;
        let mut header_loaded = false;
        if unique_iv && io.raw_mut().size() > 0 {
            file_iv = read_header(&mut io, &cipher, header_seed)?;
            header_loaded = true;
        }
        Ok(CipherFile {
            io,
            cipher,
            block_size,
            unique_iv,
            header_seed,
            external_iv,
            file_iv,
            header_loaded,
            scratch: vec![0u8; block_size],
        })
    }

    fn block_iv(&self, block: u64) -> u64 {
        self.external_iv ^ self.file_iv ^ block
    }

    fn ensure_header(&mut self) -> Result<()> {
        if !self.unique_iv || self.header_loaded {
            return Ok(());
        }
        self.file_iv = crypto::random_u64();
        write_header(&mut self.io, &self.cipher, self.header_seed, self.file_iv)?;
        self.header_loaded = true;
        Ok(())
    }

    pub fn external_iv(&self) -> u64 {
        self.external_iv
    }

    /// Installs a new external IV. If the file already has an IV header the
    /// stored file IV is re-based so every block IV is unchanged, and the
    /// header is rewritten in place.
    pub fn set_external_iv(&mut self, new_iv: u64) -> Result<()> {
        if new_iv == self.external_iv {
            return Ok(());
        }
        if self.unique_iv && self.header_loaded {
            self.file_iv ^= self.external_iv ^ new_iv;
            write_header(&mut self.io, &self.cipher, self.header_seed, self.file_iv)?;
        }
        self.external_iv = new_iv;
        Ok(())
    }

    /// Records an external IV change whose header rewrite already happened
    /// out of band (see [`rebase_file_iv`]); adjusts only the in-memory IV
    /// state.
    pub fn note_external_iv(&mut self, new_iv: u64) {
        if self.unique_iv && self.header_loaded {
            self.file_iv ^= self.external_iv ^ new_iv;
        }
        self.external_iv = new_iv;
    }
}

fn read_header(io: &mut MacFile, cipher: &Cipher, seed: u64) -> Result<u64> {
    let mut hdr = [0u8; HEADER_LEN as usize];
    let got = io.raw_mut().read_at(0, &mut hdr)?;
    if got != hdr.len() {
        return Err(Error::CryptoFailure(format!(
            "truncated IV header: {got} of {HEADER_LEN} bytes"
        )));
    }
    cipher.stream_decrypt(&mut hdr, seed)?;
    Ok(u64::from_le_bytes(hdr))
}

fn write_header(io: &mut MacFile, cipher: &Cipher, seed: u64, file_iv: u64) -> Result<()> {
    let mut hdr = file_iv.to_le_bytes();
    cipher.stream_encrypt(&mut hdr, seed)?;
    io.raw_mut().write_at(0, &hdr)
}

/// Re-bases the IV header of a file that is not currently open, after a
/// rename changed the external IV its path derives. No-op for empty files,
/// which have no header yet.
pub fn rebase_file_iv(
    store: &dyn BackingStore,
    cipher_path: &str,
    cipher: &Cipher,
    header_seed: u64,
    old_external: u64,
    new_external: u64,
) -> Result<()> {
    if old_external == new_external {
        return Ok(());
    }
    let mut handle = store.open(cipher_path, true, false)?;
    if handle.size()? == 0 {
        return Ok(());
    }
    let mut hdr = [0u8; HEADER_LEN as usize];
    let got = handle.read_at(0, &mut hdr)?;
    if got != hdr.len() {
        return Err(Error::CryptoFailure(format!(
            "truncated IV header in {cipher_path}"
        )));
    }
    cipher.stream_decrypt(&mut hdr, header_seed)?;
    let file_iv = u64::from_le_bytes(hdr) ^ old_external ^ new_external;
    let mut hdr = file_iv.to_le_bytes();
    cipher.stream_encrypt(&mut hdr, header_seed)?;
    handle.write_at(0, &hdr)
}

impl BlockIo for CipherFile {
    fn block_size(&self) -> usize {
        self.block_size
    }

    fn read_block(&mut self, block: u64, buf: &mut [u8]) -> Result<usize> {
        let (payload, hole) = self.io.read_block(block, buf)?;
        if payload == 0 || hole {
            return Ok(payload);
        }
        let seed = self.block_iv(block);
        if payload == self.block_size {
            self.cipher.block_decrypt(&mut buf[..payload], seed)?;
        } else {
            self.cipher.stream_decrypt(&mut buf[..payload], seed)?;
        }
        Ok(payload)
    }

    fn write_block(&mut self, block: u64, data: &[u8]) -> Result<()> {
        self.ensure_header()?;
        let seed = self.block_iv(block);
        self.scratch[..data.len()].copy_from_slice(data);
        if data.len() == self.block_size {
            self.cipher.block_encrypt(&mut self.scratch[..data.len()], seed)?;
        } else {
            self.cipher.stream_encrypt(&mut self.scratch[..data.len()], seed)?;
        }
        self.io.write_block(block, &self.scratch[..data.len()])
    }

    fn plain_size(&self) -> u64 {
        self.io.payload_size()
    }

    fn truncate(&mut self, plain_size: u64) -> Result<()> {
        self.io.truncate_payload(plain_size)
    }

    fn sync(&mut self, datasync: bool) -> Result<()> {
        self.io.sync(datasync)
    }
}
