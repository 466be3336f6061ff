//! The symmetric cipher primitive underneath the file and name layers.
//!
//! A [`Cipher`] owns one key's worth of material: the AES key itself plus a
//! 16-byte IV base that seeds per-block IV derivation. The same material
//! keys the MAC. Two encryption modes are exposed: CBC for whole cipher
//! blocks (length is a multiple of 16) and CFB for arbitrary-length tails,
//! which is bit-exact length-preserving so that on-disk sizes track
//! plaintext sizes.
//!
//! Key material never leaves a zeroize-on-drop container except through
//! [`Cipher::wrap_key`], which produces a checksummed, encrypted blob
//! suitable for persisting in the volume config.

use std::fmt;
use std::time::{Duration, Instant};

use aes::cipher::block_padding::NoPadding;
use aes::cipher::{
    AsyncStreamCipher, BlockCipher, BlockDecryptMut, BlockEncryptMut, KeyInit, KeyIvInit,
};
use aes::{Aes128, Aes192, Aes256};
use hmac::{Hmac, Mac};
use pbkdf2::pbkdf2_hmac;
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::Sha256;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::{Error, Result};

type HmacSha256 = Hmac<Sha256>;

/// AES cipher block width in bytes.
pub const AES_BLOCK: usize = 16;

/// Extra key material carried beyond the AES key, seeding IV derivation.
pub const IV_BASE_LEN: usize = 16;

/// Constant overhead of a wrapped key blob over the raw key material.
pub const KEY_CHECKSUM_LEN: usize = 8;

/// Salt width used for password-based key derivation.
pub const SALT_LEN: usize = 20;

const MIN_KDF_ITERATIONS: u32 = 10_000;
const MAX_KDF_ITERATIONS: u32 = 5_000_000;

// AES key sizes are distinct types in the cipher crates; route each call
// through the matching monomorphization.
macro_rules! dispatch_aes {
    ($alg:expr, $f:ident, $key:expr, $iv:expr, $buf:expr) => {
        match $alg {
            CipherAlg::Aes128 => $f::<Aes128>($key, $iv, $buf),
            CipherAlg::Aes192 => $f::<Aes192>($key, $iv, $buf),
            CipherAlg::Aes256 => $f::<Aes256>($key, $iv, $buf),
        }
    };
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum CipherAlg {
    Aes128,
    Aes192,
    Aes256,
}

impl CipherAlg {
    pub fn key_len(self) -> usize {
        match self {
            CipherAlg::Aes128 => 16,
            CipherAlg::Aes192 => 24,
            CipherAlg::Aes256 => 32,
        }
    }

    pub fn key_bits(self) -> u32 {
        self.key_len() as u32 * 8
    }

    pub fn from_key_bits(bits: u32) -> Result<Self> {
        match bits {
            128 => Ok(CipherAlg::Aes128),
            192 => Ok(CipherAlg::Aes192),
            256 => Ok(CipherAlg::Aes256),
            _ => Err(Error::ConfigCorrupt(format!("unknown key size: {bits}"))),
        }
    }

    /// Total key material length: AES key plus the IV base.
    pub fn material_len(self) -> usize {
        self.key_len() + IV_BASE_LEN
    }

    pub fn name(self) -> &'static str {
        "aes"
    }
}

/// Byte buffer that wipes itself on drop.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct SecretBytes(Vec<u8>);

impl SecretBytes {
    pub fn new(bytes: Vec<u8>) -> Self {
        SecretBytes(bytes)
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.0
    }
}

/// One symmetric key and every primitive operation the stack needs from it.
///
/// Safe for concurrent use: all state is immutable after construction.
pub struct Cipher {
    alg: CipherAlg,
    material: SecretBytes,
}

impl fmt::Debug for Cipher {
    // Never let key bytes leak through a Debug format.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Cipher(aes{})", self.alg.key_bits())
    }
}

impl Cipher {
    /// Generates a fresh random key.
    pub fn generate(alg: CipherAlg) -> Self {
        let mut material = vec![0u8; alg.material_len()];
        OsRng.fill_bytes(&mut material);
        Cipher {
            alg,
            material: SecretBytes::new(material),
        }
    }

    /// Derives a key from a password with the iterated KDF. Deterministic
    /// for fixed password, salt, and iteration count.
    pub fn from_password(alg: CipherAlg, password: &[u8], salt: &[u8], iterations: u32) -> Self {
        let mut material = vec![0u8; alg.material_len()];
        pbkdf2_hmac::<Sha256>(password, salt, iterations.max(1), &mut material);
        Cipher {
            alg,
            material: SecretBytes::new(material),
        }
    }

    /// Reconstructs a key from persisted key bytes.
    pub fn reload(alg: CipherAlg, material: &[u8]) -> Result<Self> {
        if material.len() != alg.material_len() {
            return Err(Error::CryptoFailure(format!(
                "key material length {} does not fit aes{}",
                material.len(),
                alg.key_bits()
            )));
        }
        Ok(Cipher {
            alg,
            material: SecretBytes::new(material.to_vec()),
        })
    }

    pub fn alg(&self) -> CipherAlg {
        self.alg
    }

    fn aes_key(&self) -> &[u8] {
        &self.material.as_slice()[..self.alg.key_len()]
    }

    fn iv_base(&self) -> &[u8] {
        &self.material.as_slice()[self.alg.key_len()..]
    }

    /// Keyed 64-bit MAC over `data`, mixed with a 64-bit seed. Deterministic
    /// for fixed key, data, and seed.
    pub fn mac_64(&self, data: &[u8], seed: u64) -> u64 {
        let mut mac = <HmacSha256 as Mac>::new_from_slice(self.material.as_slice())
            .expect("HMAC-SHA256 accepts any key length");
        mac.update(data);
        mac.update(&seed.to_le_bytes());
        let digest = mac.finalize().into_bytes();
        let mut out = [0u8; 8];
        out.copy_from_slice(&digest[..8]);
        u64::from_le_bytes(out)
    }

    /// 16-bit fold of [`Cipher::mac_64`], used as the name checksum.
    pub fn mac_16(&self, data: &[u8], seed: u64) -> u16 {
        let m = self.mac_64(data, seed);
        (m ^ (m >> 16) ^ (m >> 32) ^ (m >> 48)) as u16
    }

    /// Expands a 64-bit IV seed into a full AES IV.
    fn iv_for_seed(&self, seed: u64) -> [u8; AES_BLOCK] {
        let mut mac = <HmacSha256 as Mac>::new_from_slice(self.aes_key())
            .expect("HMAC-SHA256 accepts any key length");
        mac.update(self.iv_base());
        mac.update(&seed.to_le_bytes());
        let digest = mac.finalize().into_bytes();
        let mut iv = [0u8; AES_BLOCK];
        iv.copy_from_slice(&digest[..AES_BLOCK]);
        iv
    }

    /// Encrypts a whole number of cipher blocks in place (CBC).
    pub fn block_encrypt(&self, buf: &mut [u8], seed: u64) -> Result<()> {
        if buf.is_empty() || buf.len() % AES_BLOCK != 0 {
            return Err(Error::InvalidArgument(format!(
                "block encrypt of {} bytes",
                buf.len()
            )));
        }
        let iv = self.iv_for_seed(seed);
        dispatch_aes!(self.alg, cbc_encrypt, self.aes_key(), &iv, buf)
    }

    /// Inverse of [`Cipher::block_encrypt`].
    pub fn block_decrypt(&self, buf: &mut [u8], seed: u64) -> Result<()> {
        if buf.is_empty() || buf.len() % AES_BLOCK != 0 {
            return Err(Error::InvalidArgument(format!(
                "block decrypt of {} bytes",
                buf.len()
            )));
        }
        let iv = self.iv_for_seed(seed);
        dispatch_aes!(self.alg, cbc_decrypt, self.aes_key(), &iv, buf)
    }

    /// Length-preserving encryption (CFB) for partial tail blocks and
    /// name streams.
    pub fn stream_encrypt(&self, buf: &mut [u8], seed: u64) -> Result<()> {
        if buf.is_empty() {
            return Err(Error::InvalidArgument("stream encrypt of 0 bytes".into()));
        }
        let iv = self.iv_for_seed(seed);
        dispatch_aes!(self.alg, cfb_encrypt, self.aes_key(), &iv, buf)
    }

    /// Inverse of [`Cipher::stream_encrypt`].
    pub fn stream_decrypt(&self, buf: &mut [u8], seed: u64) -> Result<()> {
        if buf.is_empty() {
            return Err(Error::InvalidArgument("stream decrypt of 0 bytes".into()));
        }
        let iv = self.iv_for_seed(seed);
        dispatch_aes!(self.alg, cfb_decrypt, self.aes_key(), &iv, buf)
    }

    /// Seals another key's material under this key. The blob is the key
    /// material stream-encrypted with the checksum as IV seed, prefixed by
    /// the checksum itself; total length exceeds the material by
    /// [`KEY_CHECKSUM_LEN`].
    pub fn wrap_key(&self, other: &Cipher) -> Result<Vec<u8>> {
        let checksum = self.mac_64(other.material.as_slice(), 0);
        let mut blob = other.material.as_slice().to_vec();
        self.stream_encrypt(&mut blob, checksum)?;
        let mut out = Vec::with_capacity(KEY_CHECKSUM_LEN + blob.len());
        out.extend_from_slice(&checksum.to_le_bytes());
        out.extend_from_slice(&blob);
        blob.zeroize();
        Ok(out)
    }

    /// Opens a blob produced by [`Cipher::wrap_key`]. A checksum mismatch
    /// means the wrapping key is wrong, which at mount time means the
    /// password is wrong.
    pub fn unwrap_key(&self, alg: CipherAlg, wrapped: &[u8]) -> Result<Cipher> {
        if wrapped.len() != KEY_CHECKSUM_LEN + alg.material_len() {
            return Err(Error::ConfigCorrupt(format!(
                "wrapped key is {} bytes, expected {}",
                wrapped.len(),
                KEY_CHECKSUM_LEN + alg.material_len()
            )));
        }
        let mut checksum = [0u8; KEY_CHECKSUM_LEN];
        checksum.copy_from_slice(&wrapped[..KEY_CHECKSUM_LEN]);
        let checksum = u64::from_le_bytes(checksum);

        let mut blob = wrapped[KEY_CHECKSUM_LEN..].to_vec();
        self.stream_decrypt(&mut blob, checksum)?;
        if self.mac_64(&blob, 0) != checksum {
            blob.zeroize();
            return Err(Error::BadPassword);
        }
        let key = Cipher::reload(alg, &blob);
        blob.zeroize();
        key
    }
}

/// Picks a PBKDF2 iteration count whose derivation takes roughly `target`
/// wall-clock time on this machine, clamped to a sane range.
pub fn derive_iterations(target: Duration) -> u32 {
    const PROBE: u32 = 50_000;
    let mut out = [0u8; 32];
    let start = Instant::now();
    pbkdf2_hmac::<Sha256>(b"timing probe", b"cloakfs probe salt..", PROBE, &mut out);
    let elapsed = start.elapsed().as_millis().max(1);
    let scaled = u128::from(PROBE) * target.as_millis().max(1) / elapsed;
    scaled.clamp(u128::from(MIN_KDF_ITERATIONS), u128::from(MAX_KDF_ITERATIONS)) as u32
}

/// Fills `buf` from the system CSPRNG.
pub fn random_bytes(buf: &mut [u8]) {
    OsRng.fill_bytes(buf);
}

pub fn random_u64() -> u64 {
    OsRng.next_u64()
}

fn cbc_encrypt<C>(key: &[u8], iv: &[u8; AES_BLOCK], buf: &mut [u8]) -> Result<()>
where
    C: BlockCipher + BlockEncryptMut + KeyInit,
{
    let len = buf.len();
    cbc::Encryptor::<C>::new_from_slices(key, iv)
        .map_err(|_| Error::CryptoFailure("invalid key or IV length".into()))?
        .encrypt_padded_mut::<NoPadding>(buf, len)
        .map_err(|_| Error::CryptoFailure("input not block aligned".into()))?;
    Ok(())
}

fn cbc_decrypt<C>(key: &[u8], iv: &[u8; AES_BLOCK], buf: &mut [u8]) -> Result<()>
where
    C: BlockCipher + BlockDecryptMut + KeyInit,
{
    cbc::Decryptor::<C>::new_from_slices(key, iv)
        .map_err(|_| Error::CryptoFailure("invalid key or IV length".into()))?
        .decrypt_padded_mut::<NoPadding>(buf)
        .map_err(|_| Error::CryptoFailure("input not block aligned".into()))?;
    Ok(())
}

fn cfb_encrypt<C>(key: &[u8], iv: &[u8; AES_BLOCK], buf: &mut [u8]) -> Result<()>
where
    C: BlockCipher + BlockEncryptMut + KeyInit,
{
    cfb_mode::Encryptor::<C>::new_from_slices(key, iv)
        .map_err(|_| Error::CryptoFailure("invalid key or IV length".into()))?
        .encrypt(buf);
    Ok(())
}

fn cfb_decrypt<C>(key: &[u8], iv: &[u8; AES_BLOCK], buf: &mut [u8]) -> Result<()>
where
    C: BlockCipher + BlockEncryptMut + KeyInit,
{
    cfb_mode::Decryptor::<C>::new_from_slices(key, iv)
        .map_err(|_| Error::CryptoFailure("invalid key or IV length".into()))?
        .decrypt(buf);
    Ok(())
}
