//! Filename encryption: one path component at a time.
//!
//! Three codecs share one shape: a 2-byte keyed checksum over the (padded)
//! plaintext name, seeded by the directory's IV chain; encryption of the
//! name with the checksum folded into the IV seed; then a filesystem-safe
//! alphabet over `checksum ∥ ciphertext`. The checksum doubles as the
//! per-name IV tweak and as the decoder's validity test, so undecodable
//! directory entries are detected instead of producing garbage names.
//!
//! With chained IVs, the IV for a component is derived from its parent
//! chain (`iv_child = MAC-64(component, iv_parent)`, root 0), which makes
//! every encoded path deterministic from the root and identical names
//! encode differently in different directories.

use std::fmt;
use std::sync::Arc;

use data_encoding::{Encoding, BASE32_NOPAD, BASE64URL_NOPAD};

use crate::crypto::{Cipher, AES_BLOCK};
use crate::error::{Error, Result};

/// Checksum prefix length inside the encoded blob.
const CSUM_LEN: usize = 2;

/// Longest encoded component the backing store is assumed to accept.
const NAME_MAX: usize = 255;

pub trait NameCodec: Send + Sync {
    fn algorithm(&self) -> &'static str;

    /// Encodes one non-empty path component under the given IV.
    fn encode_component(&self, iv: u64, plain: &[u8]) -> Result<String>;

    /// Decodes one component; malformed or corrupt input is an error.
    fn decode_component(&self, iv: u64, encoded: &str) -> Result<Vec<u8>>;

    /// Advances the IV chain past a (plaintext) component.
    fn chain_iv(&self, plain: &[u8], parent_iv: u64) -> u64;

    /// Exact upper bound on the encoded length of an `n`-byte name.
    fn max_encoded_len(&self, n: usize) -> usize;

    /// Exact upper bound on the decoded length of an `n`-byte encoded name.
    fn max_decoded_len(&self, n: usize) -> usize;
}

impl fmt::Debug for dyn NameCodec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NameCodec")
            .field("algorithm", &self.algorithm())
            .finish()
    }
}

fn alphabet(case_insensitive: bool) -> Encoding {
    // Base32 survives case-folding stores; the base64 variant is denser and
    // never emits '/' or NUL either.
    if case_insensitive {
        BASE32_NOPAD
    } else {
        BASE64URL_NOPAD
    }
}

/// Largest decodable byte count for an `n`-char encoded name. Steps down to
/// the nearest valid encoded length so the bound stays monotonic.
fn decoded_cap(enc: &Encoding, mut n: usize) -> usize {
    loop {
        match enc.decode_len(n) {
            Ok(v) => return v,
            Err(_) if n > 0 => n -= 1,
            Err(_) => return 0,
        }
    }
}

fn check_decoded(name: &[u8]) -> Result<()> {
    if name.is_empty() {
        return Err(Error::CryptoFailure("decoded name is empty".into()));
    }
    if name.iter().any(|&b| b == b'/' || b == 0) {
        return Err(Error::CryptoFailure(
            "decoded name contains '/' or NUL".into(),
        ));
    }
    Ok(())
}

/// Block codec: pads to the cipher block size, so encoded names leak only
/// a rounded length.
pub struct BlockNames {
    cipher: Arc<Cipher>,
    alphabet: Encoding,
}

impl BlockNames {
    pub fn new(cipher: Arc<Cipher>, case_insensitive: bool) -> Self {
        BlockNames {
            cipher,
            alphabet: alphabet(case_insensitive),
        }
    }
}

impl NameCodec for BlockNames {
    fn algorithm(&self) -> &'static str {
        "names/block"
    }

    fn encode_component(&self, iv: u64, plain: &[u8]) -> Result<String> {
        if plain.is_empty() {
            return Err(Error::InvalidArgument("empty name component".into()));
        }
        let pad = AES_BLOCK - plain.len() % AES_BLOCK;
        let mut padded = Vec::with_capacity(plain.len() + pad);
        padded.extend_from_slice(plain);
        padded.resize(plain.len() + pad, pad as u8);

        let csum = self.cipher.mac_16(&padded, iv);
        self.cipher.block_encrypt(&mut padded, iv ^ u64::from(csum))?;

        let mut blob = Vec::with_capacity(CSUM_LEN + padded.len());
        blob.extend_from_slice(&csum.to_le_bytes());
        blob.extend_from_slice(&padded);
        Ok(self.alphabet.encode(&blob))
    }

    fn decode_component(&self, iv: u64, encoded: &str) -> Result<Vec<u8>> {
        let blob = self
            .alphabet
            .decode(encoded.as_bytes())
            .map_err(|_| Error::InvalidArgument(format!("undecodable name: {encoded}")))?;
        if blob.len() < CSUM_LEN + AES_BLOCK || (blob.len() - CSUM_LEN) % AES_BLOCK != 0 {
            return Err(Error::InvalidArgument(format!(
                "bad encoded name length: {}",
                blob.len()
            )));
        }
        let csum = u16::from_le_bytes([blob[0], blob[1]]);
        let mut body = blob[CSUM_LEN..].to_vec();
        self.cipher.block_decrypt(&mut body, iv ^ u64::from(csum))?;
        if self.cipher.mac_16(&body, iv) != csum {
            return Err(Error::CryptoFailure("name checksum mismatch".into()));
        }

        let pad = body[body.len() - 1] as usize;
        if pad == 0 || pad > AES_BLOCK || pad >= body.len() {
            return Err(Error::CryptoFailure("bad name padding".into()));
        }
        body.truncate(body.len() - pad);
        check_decoded(&body)?;
        Ok(body)
    }

    fn chain_iv(&self, plain: &[u8], parent_iv: u64) -> u64 {
        self.cipher.mac_64(plain, parent_iv)
    }

    fn max_encoded_len(&self, n: usize) -> usize {
        let padded = n - n % AES_BLOCK + AES_BLOCK;
        self.alphabet.encode_len(CSUM_LEN + padded)
    }

    fn max_decoded_len(&self, n: usize) -> usize {
        decoded_cap(&self.alphabet, n).saturating_sub(CSUM_LEN + 1)
    }
}

/// Stream codec: length-preserving, no padding overhead.
pub struct StreamNames {
    cipher: Arc<Cipher>,
    alphabet: Encoding,
}

impl StreamNames {
    pub fn new(cipher: Arc<Cipher>, case_insensitive: bool) -> Self {
        StreamNames {
            cipher,
            alphabet: alphabet(case_insensitive),
        }
    }
}

impl NameCodec for StreamNames {
    fn algorithm(&self) -> &'static str {
        "names/stream"
    }

    fn encode_component(&self, iv: u64, plain: &[u8]) -> Result<String> {
        if plain.is_empty() {
            return Err(Error::InvalidArgument("empty name component".into()));
        }
        let csum = self.cipher.mac_16(plain, iv);
        let mut body = plain.to_vec();
        self.cipher.stream_encrypt(&mut body, iv ^ u64::from(csum))?;

        let mut blob = Vec::with_capacity(CSUM_LEN + body.len());
        blob.extend_from_slice(&csum.to_le_bytes());
        blob.extend_from_slice(&body);
        Ok(self.alphabet.encode(&blob))
    }

    fn decode_component(&self, iv: u64, encoded: &str) -> Result<Vec<u8>> {
        let blob = self
            .alphabet
            .decode(encoded.as_bytes())
            .map_err(|_| Error::InvalidArgument(format!("undecodable name: {encoded}")))?;
        if blob.len() <= CSUM_LEN {
            return Err(Error::InvalidArgument(format!(
                "bad encoded name length: {}",
                blob.len()
            )));
        }
        let csum = u16::from_le_bytes([blob[0], blob[1]]);
        let mut body = blob[CSUM_LEN..].to_vec();
        self.cipher.stream_decrypt(&mut body, iv ^ u64::from(csum))?;
        if self.cipher.mac_16(&body, iv) != csum {
            return Err(Error::CryptoFailure("name checksum mismatch".into()));
        }
        check_decoded(&body)?;
        Ok(body)
    }

    fn chain_iv(&self, plain: &[u8], parent_iv: u64) -> u64 {
        self.cipher.mac_64(plain, parent_iv)
    }

    fn max_encoded_len(&self, n: usize) -> usize {
        self.alphabet.encode_len(CSUM_LEN + n)
    }

    fn max_decoded_len(&self, n: usize) -> usize {
        decoded_cap(&self.alphabet, n).saturating_sub(CSUM_LEN)
    }
}

/// Identity codec for debugging a volume layout without name encryption.
pub struct NullNames;

impl NameCodec for NullNames {
    fn algorithm(&self) -> &'static str {
        "names/null"
    }

    fn encode_component(&self, _iv: u64, plain: &[u8]) -> Result<String> {
        if plain.is_empty() {
            return Err(Error::InvalidArgument("empty name component".into()));
        }
        String::from_utf8(plain.to_vec())
            .map_err(|_| Error::InvalidArgument("non-UTF-8 name".into()))
    }

    fn decode_component(&self, _iv: u64, encoded: &str) -> Result<Vec<u8>> {
        if encoded.is_empty() {
            return Err(Error::InvalidArgument("empty name component".into()));
        }
        Ok(encoded.as_bytes().to_vec())
    }

    fn chain_iv(&self, _plain: &[u8], parent_iv: u64) -> u64 {
        parent_iv
    }

    fn max_encoded_len(&self, n: usize) -> usize {
        n
    }

    fn max_decoded_len(&self, n: usize) -> usize {
        n
    }
}

/// Encodes a full plaintext path, component by component, threading the IV
/// chain when enabled. Returns the cipher path and the IV the chain ends
/// on, which callers use as the external IV for files (and as the decode IV
/// for directory entries).
pub fn encode_path(codec: &dyn NameCodec, chained: bool, plain: &str) -> Result<(String, u64)> {
    let mut iv = 0u64;
    let mut out = String::new();
    for comp in plain.split('/').filter(|c| !c.is_empty()) {
        let enc = codec.encode_component(if chained { iv } else { 0 }, comp.as_bytes())?;
        if enc.len() > NAME_MAX {
            return Err(Error::NameTooLong(enc.len()));
        }
        out.push('/');
        out.push_str(&enc);
        if chained {
            iv = codec.chain_iv(comp.as_bytes(), iv);
        }
    }
    if out.is_empty() {
        out.push('/');
    }
    Ok((out, iv))
}

/// Inverse of [`encode_path`].
pub fn decode_path(codec: &dyn NameCodec, chained: bool, cipher: &str) -> Result<(String, u64)> {
    let mut iv = 0u64;
    let mut out = String::new();
    for comp in cipher.split('/').filter(|c| !c.is_empty()) {
        let plain = codec.decode_component(if chained { iv } else { 0 }, comp)?;
        out.push('/');
        out.push_str(
            std::str::from_utf8(&plain)
                .map_err(|_| Error::InvalidArgument("non-UTF-8 decoded name".into()))?,
        );
        if chained {
            iv = codec.chain_iv(&plain, iv);
        }
    }
    if out.is_empty() {
        out.push('/');
    }
    Ok((out, iv))
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::crypto::CipherAlg;

    fn cipher() -> Arc<Cipher> {
        Arc::new(Cipher::generate(CipherAlg::Aes256))
    }

    fn codecs() -> Vec<Box<dyn NameCodec>> {
        let c = cipher();
        vec![
            Box::new(BlockNames::new(c.clone(), false)),
            Box::new(BlockNames::new(c.clone(), true)),
            Box::new(StreamNames::new(c.clone(), false)),
            Box::new(StreamNames::new(c, true)),
            Box::new(NullNames),
        ]
    }

    #[test]
    fn component_round_trip_every_codec() {
        for codec in codecs() {
            for name in ["a", "file.txt", "longer name with spaces", "émoji-名前"] {
                let enc = codec.encode_component(42, name.as_bytes()).unwrap();
                assert!(!enc.contains('/'), "{}: {enc}", codec.algorithm());
                assert!(!enc.contains('\0'));
                assert!(enc.len() <= codec.max_encoded_len(name.len()));
                let dec = codec.decode_component(42, &enc).unwrap();
                assert_eq!(dec, name.as_bytes(), "{}", codec.algorithm());
                assert!(name.len() <= codec.max_decoded_len(enc.len()));
            }
        }
    }

    #[test]
    fn empty_component_is_rejected() {
        for codec in codecs() {
            assert!(codec.encode_component(0, b"").is_err());
        }
    }

    #[test]
    fn stream_codec_output_tracks_input_length() {
        let codec = StreamNames::new(cipher(), false);
        let short = codec.encode_component(0, b"ab").unwrap();
        let long = codec.encode_component(0, b"abcdefgh").unwrap();
        assert!(short.len() < long.len());
        assert_eq!(short.len(), codec.max_encoded_len(2));
    }

    #[test]
    fn decode_with_wrong_iv_fails() {
        let codec = BlockNames::new(cipher(), false);
        let enc = codec.encode_component(1, b"secret").unwrap();
        assert!(codec.decode_component(2, &enc).is_err());
    }

    #[test]
    fn corrupt_name_fails_to_decode() {
        let codec = BlockNames::new(cipher(), true);
        let enc = codec.encode_component(0, b"somename").unwrap();
        let mut chars: Vec<char> = enc.chars().collect();
        chars[3] = if chars[3] == 'A' { 'B' } else { 'A' };
        let tampered: String = chars.into_iter().collect();
        assert!(codec.decode_component(0, &tampered).is_err());
        assert!(codec.decode_component(0, "!!notbase32!!").is_err());
    }

    #[test]
    fn encoded_len_bound_is_monotonic() {
        for codec in codecs() {
            let mut prev = 0;
            for n in 1..200 {
                let e = codec.max_encoded_len(n);
                assert!(e >= prev);
                prev = e;
            }
        }
    }

    #[test]
    fn path_round_trip_with_chaining() {
        let c = cipher();
        let codec = BlockNames::new(c, false);
        let (enc, iv) = encode_path(&codec, true, "/a/b/c.txt").unwrap();
        assert_ne!(iv, 0);
        let (dec, div) = decode_path(&codec, true, &enc).unwrap();
        assert_eq!(dec, "/a/b/c.txt");
        assert_eq!(div, iv);
    }

    #[test]
    fn chaining_makes_identical_names_differ_by_parent() {
        let codec = BlockNames::new(cipher(), false);
        let (p1, _) = encode_path(&codec, true, "/one/same").unwrap();
        let (p2, _) = encode_path(&codec, true, "/two/same").unwrap();
        let last1 = p1.rsplit('/').next().unwrap();
        let last2 = p2.rsplit('/').next().unwrap();
        assert_ne!(last1, last2);

        // Without chaining the same component encodes identically anywhere.
        let (q1, _) = encode_path(&codec, false, "/one/same").unwrap();
        let (q2, _) = encode_path(&codec, false, "/two/same").unwrap();
        assert_eq!(
            q1.rsplit('/').next().unwrap(),
            q2.rsplit('/').next().unwrap()
        );
    }

    #[test]
    fn reencoding_is_stable_iff_parents_unchanged() {
        let codec = BlockNames::new(cipher(), false);
        let (a, iva) = encode_path(&codec, true, "/p/q/r").unwrap();
        let (b, ivb) = encode_path(&codec, true, "/p/q/r").unwrap();
        assert_eq!(a, b);
        assert_eq!(iva, ivb);

        let (c, _) = encode_path(&codec, true, "/p/x/r").unwrap();
        assert_ne!(
            a.rsplit('/').next().unwrap(),
            c.rsplit('/').next().unwrap()
        );
    }

    #[test]
    fn root_encodes_to_root() {
        let codec = NullNames;
        assert_eq!(encode_path(&codec, false, "/").unwrap(), ("/".into(), 0));
        assert_eq!(decode_path(&codec, false, "/").unwrap(), ("/".into(), 0));
    }
}
