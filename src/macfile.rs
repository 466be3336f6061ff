//! Per-block integrity framing between the cipher layer and the raw file.
//!
//! Each on-disk block is `mac ∥ rand ∥ payload`: `mac` bytes of truncated
//! keyed MAC over everything after the MAC prefix, `rand` bytes of noise
//! that randomize the MAC input, then the stored payload (ciphertext from
//! the layer above). With `mac == rand == 0` the framing degenerates to a
//! plain block layout. The first `base` bytes of the raw object are
//! reserved for the per-file IV header owned by the cipher layer.

use std::sync::Arc;

use log::warn;

use crate::crypto::{self, Cipher};
use crate::error::{Error, Result};
use crate::rawfile::RawFile;

pub struct MacFile {
    raw: RawFile,
    cipher: Arc<Cipher>,
    block_payload: usize,
    mac_bytes: usize,
    rand_bytes: usize,
    base: u64,
    allow_holes: bool,
    force_decode: bool,
    scratch: Vec<u8>,
    short_block_warned: bool,
}

/// Plaintext-equivalent size of a raw object: strip the IV header and the
/// per-block overhead. Encryption above this layer is length-preserving, so
/// the payload total is the plaintext total.
pub fn plaintext_size(raw_size: u64, base: u64, block_payload: usize, overhead: usize) -> u64 {
    if raw_size <= base {
        return 0;
    }
    let body = raw_size - base;
    let disk_block = (block_payload + overhead) as u64;
    let full = body / disk_block;
    let rem = body % disk_block;
    let mut size = full * block_payload as u64;
    if rem > overhead as u64 {
        size += rem - overhead as u64;
    }
    size
}

impl MacFile {
    pub fn new(
        raw: RawFile,
        cipher: Arc<Cipher>,
        block_payload: usize,
        mac_bytes: usize,
        rand_bytes: usize,
        base: u64,
        allow_holes: bool,
        force_decode: bool,
    ) -> Self {
        let disk_block = block_payload + mac_bytes + rand_bytes;
        MacFile {
            raw,
            cipher,
            block_payload,
            mac_bytes,
            rand_bytes,
            base,
            allow_holes,
            force_decode,
            scratch: vec![0u8; disk_block],
            short_block_warned: false,
        }
    }

    fn overhead(&self) -> usize {
        self.mac_bytes + self.rand_bytes
    }

    fn disk_block(&self) -> usize {
        self.block_payload + self.overhead()
    }

    fn block_offset(&self, block: u64) -> u64 {
        self.base + block * self.disk_block() as u64
    }

    /// Reads one block's payload into `buf`. Returns the payload length and
    /// whether the block was an on-disk hole (all zero, MAC skipped); a hole
    /// decodes to a zero plaintext block in the layer above.
    pub fn read_block(&mut self, block: u64, buf: &mut [u8]) -> Result<(usize, bool)> {
        debug_assert!(buf.len() >= self.block_payload);
        let off = self.block_offset(block);
        let disk_block = self.disk_block();
        let got = {
            let scratch = &mut self.scratch[..disk_block];
            self.raw.read_at(off, scratch)?
        };
        if got == 0 {
            return Ok((0, false));
        }

        let overhead = self.overhead();
        if self.allow_holes && self.scratch[..got].iter().all(|&b| b == 0) {
            let payload = got.saturating_sub(overhead);
            buf[..payload].iter_mut().for_each(|b| *b = 0);
            return Ok((payload, true));
        }

        if overhead == 0 {
            buf[..got].copy_from_slice(&self.scratch[..got]);
            return Ok((got, false));
        }
        if got <= overhead {
            if !self.short_block_warned {
                warn!("block {block}: {got} bytes on disk, shorter than the {overhead}-byte block overhead");
                self.short_block_warned = true;
            }
            return Ok((0, false));
        }

        let payload = got - overhead;
        let calc = self.cipher.mac_64(&self.scratch[self.mac_bytes..got], 0);
        let stored = &self.scratch[..self.mac_bytes];
        if stored != &calc.to_le_bytes()[..self.mac_bytes] {
            if !self.force_decode {
                return Err(Error::CryptoFailure(format!("MAC mismatch in block {block}")));
            }
            warn!("block {block}: MAC mismatch, decoding anyway");
        }
        buf[..payload].copy_from_slice(&self.scratch[overhead..got]);
        Ok((payload, false))
    }

    /// Frames and writes one block's payload.
    pub fn write_block(&mut self, block: u64, payload: &[u8]) -> Result<()> {
        debug_assert!(!payload.is_empty() && payload.len() <= self.block_payload);
        let off = self.block_offset(block);
        let overhead = self.overhead();
        if overhead == 0 {
            return self.raw.write_at(off, payload);
        }

        let total = overhead + payload.len();
        let frame = &mut self.scratch[..total];
        crypto::random_bytes(&mut frame[self.mac_bytes..overhead]);
        frame[overhead..].copy_from_slice(payload);
        let mac = self.cipher.mac_64(&frame[self.mac_bytes..], 0);
        let mac_bytes = self.mac_bytes;
        frame[..mac_bytes].copy_from_slice(&mac.to_le_bytes()[..mac_bytes]);
        let frame = &self.scratch[..total];
        self.raw.write_at(off, frame)
    }

    pub fn payload_size(&self) -> u64 {
        plaintext_size(
            self.raw.size(),
            self.base,
            self.block_payload,
            self.overhead(),
        )
    }

    /// Truncates the raw object so it holds exactly `total` payload bytes
    /// (plus header and per-block overhead).
    pub fn truncate_payload(&mut self, total: u64) -> Result<()> {
        let bp = self.block_payload as u64;
        let target = if total == 0 {
            self.raw.size().min(self.base)
        } else {
            let full = total / bp;
            let tail = total % bp;
            let mut t = self.base + full * self.disk_block() as u64;
            if tail > 0 {
                t += self.overhead() as u64 + tail;
            }
            t
        };
        self.raw.truncate(target)
    }

    pub fn sync(&mut self, datasync: bool) -> Result<()> {
        self.raw.sync(datasync)
    }

    /// Raw access for the cipher layer's IV header, which lives below the
    /// block framing at offset zero.
    pub fn raw_mut(&mut self) -> &mut RawFile {
        &mut self.raw
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::crypto::CipherAlg;
    use crate::store::PosixStore;

    fn mac_file(mac: usize, rand: usize, base: u64) -> (tempfile::TempDir, MacFile) {
        let dir = tempfile::tempdir().unwrap();
        let store = PosixStore::new(dir.path()).unwrap();
        let raw = RawFile::open(&store, "/obj", true, true).unwrap();
        let cipher = Arc::new(Cipher::generate(CipherAlg::Aes256));
        let mf = MacFile::new(raw, cipher, 64, mac, rand, base, false, false);
        (dir, mf)
    }

    #[test]
    fn frame_round_trip() {
        let (_d, mut mf) = mac_file(8, 4, 0);
        mf.write_block(0, &[0xAB; 64]).unwrap();
        mf.write_block(1, &[0xCD; 10]).unwrap();

        let mut buf = [0u8; 64];
        assert_eq!(mf.read_block(0, &mut buf).unwrap(), (64, false));
        assert_eq!(buf, [0xAB; 64]);
        assert_eq!(mf.read_block(1, &mut buf).unwrap(), (10, false));
        assert_eq!(&buf[..10], &[0xCD; 10]);
        assert_eq!(mf.read_block(2, &mut buf).unwrap(), (0, false));

        // 64 + 8 + 4 for the full block, 10 + 8 + 4 for the tail.
        assert_eq!(mf.raw_mut().size(), 76 + 22);
        assert_eq!(mf.payload_size(), 74);
    }

    #[test]
    fn corruption_is_detected() {
        let (_d, mut mf) = mac_file(8, 0, 0);
        mf.write_block(0, &[0x55; 64]).unwrap();
        // Flip one payload bit behind the MAC prefix.
        let mut byte = [0u8; 1];
        mf.raw_mut().read_at(20, &mut byte).unwrap();
        byte[0] ^= 0x01;
        mf.raw_mut().write_at(20, &byte).unwrap();

        let mut buf = [0u8; 64];
        match mf.read_block(0, &mut buf) {
            Err(Error::CryptoFailure(_)) => {}
            other => panic!("expected CryptoFailure, got {other:?}"),
        }
    }

    #[test]
    fn force_decode_overrides_mismatch() {
        let (_d, mut mf) = mac_file(8, 0, 0);
        mf.write_block(0, &[0x55; 64]).unwrap();
        let mut byte = [0u8; 1];
        mf.raw_mut().read_at(20, &mut byte).unwrap();
        byte[0] ^= 0x01;
        mf.raw_mut().write_at(20, &byte).unwrap();

        let mut forced = MacFile { force_decode: true, ..mf };
        let mut buf = [0u8; 64];
        let (n, hole) = forced.read_block(0, &mut buf).unwrap();
        assert_eq!((n, hole), (64, false));
    }

    #[test]
    fn zero_block_is_a_hole_when_allowed() {
        let (_d, mut mf) = mac_file(8, 0, 0);
        mf.allow_holes = true;
        // Simulate a hole: raw block full of zeros, as store-level growth
        // leaves behind.
        mf.raw_mut().write_at(0, &[0u8; 72]).unwrap();
        let mut buf = [0xFFu8; 64];
        assert_eq!(mf.read_block(0, &mut buf).unwrap(), (64, true));
        assert_eq!(buf, [0u8; 64]);
    }

    #[test]
    fn passthrough_without_overhead() {
        let (_d, mut mf) = mac_file(0, 0, 8);
        mf.write_block(0, &[1; 64]).unwrap();
        mf.write_block(1, &[2; 3]).unwrap();
        assert_eq!(mf.raw_mut().size(), 8 + 64 + 3);
        assert_eq!(mf.payload_size(), 67);

        mf.truncate_payload(64).unwrap();
        assert_eq!(mf.raw_mut().size(), 8 + 64);
        mf.truncate_payload(0).unwrap();
        assert_eq!(mf.raw_mut().size(), 8);
    }
}
