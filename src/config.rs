//! Volume configuration: creation, persistence, and key management.
//!
//! The config file lives in the backing root under [`CONFIG_FILENAME`] and
//! carries every public volume parameter plus the data key wrapped under
//! the password-derived volume key. The current on-disk format (version 7)
//! is a magic/version prefix followed by a length-prefixed protobuf record;
//! versions 6, 5, 4 and a prehistoric raw layout remain readable. Saves
//! always write the current format, through a temporary name renamed over
//! the original so a torn write cannot destroy the old config.

use std::sync::Arc;
use std::time::Duration;

use log::{debug, info};
use prost::Message;
use serde::{Deserialize, Serialize};

use crate::cipherfile::HEADER_LEN;
use crate::crypto::{self, Cipher, CipherAlg, SALT_LEN};
use crate::error::{Error, Result};
use crate::nameio::{BlockNames, NameCodec, NullNames, StreamNames};
use crate::store::BackingStore;

pub const CONFIG_FILENAME: &str = ".cloakfs";
const CONFIG_TMP: &str = ".cloakfs.tmp";

const CONFIG_MAGIC: &[u8; 4] = b"CKFS";
pub const CURRENT_VERSION: u8 = 7;

/// Volumes from before salted configs derive with this salt.
const LEGACY_SALT: [u8; SALT_LEN] = [
    0x1c, 0x3a, 0x55, 0x90, 0x27, 0x6e, 0xb1, 0x44, 0x02, 0xf8, 0x33, 0x79, 0xc5, 0x0d, 0x61,
    0xaa, 0x4b, 0x12, 0xe6, 0x98,
];
const LEGACY_KDF_ITERATIONS: u32 = 5_000;

const VOLUME_ID_LEN: usize = 16;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum NameAlg {
    Block,
    Stream,
    Null,
}

impl NameAlg {
    pub fn as_str(self) -> &'static str {
        match self {
            NameAlg::Block => "names/block",
            NameAlg::Stream => "names/stream",
            NameAlg::Null => "names/null",
        }
    }

    pub fn from_str(s: &str) -> Result<Self> {
        match s {
            "names/block" => Ok(NameAlg::Block),
            "names/stream" => Ok(NameAlg::Stream),
            "names/null" => Ok(NameAlg::Null),
            _ => Err(Error::ConfigCorrupt(format!("unknown name codec: {s}"))),
        }
    }
}

/// Everything chosen at volume creation time.
#[derive(Clone, Debug)]
pub struct VolumeParams {
    pub cipher: CipherAlg,
    pub block_size: usize,
    pub names: NameAlg,
    pub case_insensitive: bool,
    pub unique_iv: bool,
    pub chained_name_iv: bool,
    pub mac_bytes: usize,
    pub rand_bytes: usize,
    pub allow_holes: bool,
    pub kdf_target: Duration,
}

impl VolumeParams {
    pub fn standard() -> Self {
        VolumeParams {
            cipher: CipherAlg::Aes256,
            block_size: 1024,
            names: NameAlg::Block,
            case_insensitive: false,
            unique_iv: true,
            chained_name_iv: false,
            mac_bytes: 0,
            rand_bytes: 0,
            allow_holes: true,
            kdf_target: Duration::from_millis(500),
        }
    }

    pub fn paranoia() -> Self {
        VolumeParams {
            chained_name_iv: true,
            mac_bytes: 8,
            allow_holes: false,
            ..VolumeParams::standard()
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.block_size == 0 || self.block_size % 16 != 0 || self.block_size > 65536 {
            return Err(Error::InvalidArgument(format!(
                "block size {} is not a multiple of 16 in (0, 65536]",
                self.block_size
            )));
        }
        if self.mac_bytes > 8 {
            return Err(Error::InvalidArgument(format!(
                "MAC bytes {} exceed 8",
                self.mac_bytes
            )));
        }
        if self.rand_bytes > 8 {
            return Err(Error::InvalidArgument(format!(
                "random bytes {} exceed 8",
                self.rand_bytes
            )));
        }
        if self.chained_name_iv && !self.unique_iv {
            return Err(Error::InvalidArgument(
                "chained name IVs require per-file IVs".into(),
            ));
        }
        Ok(())
    }
}

/// The persisted record, independent of on-disk format version.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct VolumeConfig {
    pub version: u8,
    pub cipher_name: String,
    pub key_bits: u32,
    pub block_size: u32,
    pub name_alg: String,
    pub case_insensitive: bool,
    pub wrapped_key: Vec<u8>,
    pub salt: Vec<u8>,
    pub kdf_iterations: u32,
    pub unique_iv: bool,
    pub chained_name_iv: bool,
    pub block_mac_bytes: u32,
    pub block_mac_rand_bytes: u32,
    pub allow_holes: bool,
    pub unique_volume_id: Vec<u8>,
}

/// Reference schema of the current (protobuf) config format.
#[derive(Clone, PartialEq, Message)]
struct ConfigRecord {
    #[prost(string, tag = "1")]
    cipher_name: String,
    #[prost(uint32, tag = "2")]
    key_bits: u32,
    #[prost(uint32, tag = "3")]
    block_size: u32,
    #[prost(string, tag = "4")]
    name_alg: String,
    #[prost(bool, tag = "5")]
    case_insensitive: bool,
    #[prost(bytes = "vec", tag = "6")]
    wrapped_key: Vec<u8>,
    #[prost(bytes = "vec", tag = "7")]
    salt: Vec<u8>,
    #[prost(uint32, tag = "8")]
    kdf_iterations: u32,
    #[prost(bool, tag = "9")]
    unique_iv: bool,
    #[prost(bool, tag = "10")]
    chained_name_iv: bool,
    #[prost(uint32, tag = "11")]
    block_mac_bytes: u32,
    #[prost(uint32, tag = "12")]
    block_mac_rand_bytes: u32,
    #[prost(bool, tag = "13")]
    allow_holes: bool,
    #[prost(bytes = "vec", tag = "14")]
    unique_volume_id: Vec<u8>,
}

#[derive(Serialize, Deserialize)]
struct LegacyV6 {
    cipher_name: String,
    key_bits: u32,
    block_size: u32,
    name_alg: String,
    case_insensitive: bool,
    wrapped_key: Vec<u8>,
    salt: Vec<u8>,
    kdf_iterations: u32,
    unique_iv: bool,
    chained_name_iv: bool,
    block_mac_bytes: u32,
    block_mac_rand_bytes: u32,
    unique_volume_id: Vec<u8>,
}

#[derive(Serialize, Deserialize)]
struct LegacyV5 {
    cipher_name: String,
    key_bits: u32,
    block_size: u32,
    name_alg: String,
    wrapped_key: Vec<u8>,
    salt: Vec<u8>,
    kdf_iterations: u32,
    unique_iv: bool,
    chained_name_iv: bool,
    block_mac_bytes: u32,
}

#[derive(Serialize, Deserialize)]
struct LegacyV4 {
    cipher_name: String,
    key_bits: u32,
    block_size: u32,
    wrapped_key: Vec<u8>,
}

/// Runtime mount policy that is not part of the persisted config.
#[derive(Clone, Copy, Debug, Default)]
pub struct MountOptions {
    pub force_decode: bool,
}

/// Immutable post-mount view consumed by every other component.
#[derive(Clone, Debug)]
pub struct FsConfig {
    pub cipher: Arc<Cipher>,
    pub names: Arc<dyn NameCodec>,
    pub block_size: usize,
    pub unique_iv: bool,
    pub chained_name_iv: bool,
    pub block_mac_bytes: usize,
    pub block_mac_rand_bytes: usize,
    pub allow_holes: bool,
    pub force_decode: bool,
    pub unique_id: [u8; VOLUME_ID_LEN],
    pub header_seed: u64,
}

impl FsConfig {
    fn build(cfg: &VolumeConfig, data_key: Cipher, force_decode: bool) -> Result<FsConfig> {
        if cfg.chained_name_iv && !cfg.unique_iv {
            return Err(Error::ConfigCorrupt(
                "chained name IVs require per-file IVs".into(),
            ));
        }
        let unique_id: [u8; VOLUME_ID_LEN] = cfg
            .unique_volume_id
            .as_slice()
            .try_into()
            .map_err(|_| Error::ConfigCorrupt("unique volume id is not 16 bytes".into()))?;
        let header_seed = data_key.mac_64(&unique_id, 0);
        let cipher = Arc::new(data_key);
        let names: Arc<dyn NameCodec> = match NameAlg::from_str(&cfg.name_alg)? {
            NameAlg::Block => Arc::new(BlockNames::new(cipher.clone(), cfg.case_insensitive)),
            NameAlg::Stream => Arc::new(StreamNames::new(cipher.clone(), cfg.case_insensitive)),
            NameAlg::Null => Arc::new(NullNames),
        };
        Ok(FsConfig {
            cipher,
            names,
            block_size: cfg.block_size as usize,
            unique_iv: cfg.unique_iv,
            chained_name_iv: cfg.chained_name_iv,
            block_mac_bytes: cfg.block_mac_bytes as usize,
            block_mac_rand_bytes: cfg.block_mac_rand_bytes as usize,
            allow_holes: cfg.allow_holes,
            force_decode,
            unique_id,
            header_seed,
        })
    }

    pub fn header_len(&self) -> u64 {
        if self.unique_iv {
            HEADER_LEN
        } else {
            0
        }
    }

    pub fn block_overhead(&self) -> usize {
        self.block_mac_bytes + self.block_mac_rand_bytes
    }
}

/// Initializes a volume in an empty backing root: fresh data key, salted
/// password derivation, config written in the current format.
pub fn create_volume(
    store: &dyn BackingStore,
    password: &[u8],
    params: &VolumeParams,
) -> Result<FsConfig> {
    params.validate()?;
    let config_path = format!("/{CONFIG_FILENAME}");
    if store.stat(&config_path).is_ok() {
        return Err(Error::Exists(config_path));
    }

    let iterations = crypto::derive_iterations(params.kdf_target);
    info!("creating volume: kdf iterations = {iterations}");

    let mut salt = vec![0u8; SALT_LEN];
    crypto::random_bytes(&mut salt);
    let mut unique_volume_id = vec![0u8; VOLUME_ID_LEN];
    crypto::random_bytes(&mut unique_volume_id);

    let volume_key = Cipher::from_password(params.cipher, password, &salt, iterations);
    let data_key = Cipher::generate(params.cipher);
    let wrapped_key = volume_key.wrap_key(&data_key)?;

    let cfg = VolumeConfig {
        version: CURRENT_VERSION,
        cipher_name: params.cipher.name().to_string(),
        key_bits: params.cipher.key_bits(),
        block_size: params.block_size as u32,
        name_alg: params.names.as_str().to_string(),
        case_insensitive: params.case_insensitive,
        wrapped_key,
        salt,
        kdf_iterations: iterations,
        unique_iv: params.unique_iv,
        chained_name_iv: params.chained_name_iv,
        block_mac_bytes: params.mac_bytes as u32,
        block_mac_rand_bytes: params.rand_bytes as u32,
        allow_holes: params.allow_holes,
        unique_volume_id,
    };
    save_config(store, &cfg)?;
    FsConfig::build(&cfg, data_key, false)
}

/// Mounts an existing volume: load the config, derive the volume key from
/// the password, unwrap the data key. A wrong password surfaces as
/// [`Error::BadPassword`].
pub fn load_volume(
    store: &dyn BackingStore,
    password: &[u8],
    opts: MountOptions,
) -> Result<FsConfig> {
    let cfg = load_config(store)?;
    debug!(
        "loaded config: version = {}, cipher = {}{}, blocks = {}",
        cfg.version, cfg.cipher_name, cfg.key_bits, cfg.block_size
    );
    let alg = CipherAlg::from_key_bits(cfg.key_bits)?;
    let volume_key = Cipher::from_password(alg, password, &cfg.salt, cfg.kdf_iterations);
    let data_key = volume_key.unwrap_key(alg, &cfg.wrapped_key)?;
    FsConfig::build(&cfg, data_key, opts.force_decode)
}

/// Reads and parses the config file, trying the current format first and
/// the legacy formats in reverse chronological order.
pub fn load_config(store: &dyn BackingStore) -> Result<VolumeConfig> {
    let config_path = format!("/{CONFIG_FILENAME}");
    let mut handle = match store.open(&config_path, false, false) {
        Ok(h) => h,
        Err(Error::NotFound(_)) => return Err(Error::ConfigMissing),
        Err(e) => return Err(e),
    };
    let size = handle.size()?;
    let mut bytes = vec![0u8; size as usize];
    let got = handle.read_at(0, &mut bytes)?;
    bytes.truncate(got);
    parse_config(&bytes)
}

fn parse_config(bytes: &[u8]) -> Result<VolumeConfig> {
    let parsers: [fn(&[u8]) -> Result<VolumeConfig>; 5] = [
        parse_current,
        parse_v6,
        parse_v5,
        parse_v4,
        parse_prehistoric,
    ];
    for parse in parsers {
        if let Ok(cfg) = parse(bytes) {
            return Ok(cfg);
        }
    }
    Err(Error::ConfigCorrupt("no readable config format".into()))
}

/// Writes the config in the current format, atomically at the store level.
pub fn save_config(store: &dyn BackingStore, cfg: &VolumeConfig) -> Result<()> {
    let bytes = serialize_current(cfg);
    let tmp = format!("/{CONFIG_TMP}");
    {
        let mut handle = store.open(&tmp, true, true)?;
        handle.truncate(0)?;
        handle.write_at(0, &bytes)?;
        handle.sync(false)?;
    }
    store.rename(&tmp, &format!("/{CONFIG_FILENAME}"))
}

fn body(bytes: &[u8], version: u8) -> Result<&[u8]> {
    if bytes.len() < CONFIG_MAGIC.len() + 1
        || &bytes[..CONFIG_MAGIC.len()] != CONFIG_MAGIC
        || bytes[CONFIG_MAGIC.len()] != version
    {
        return Err(Error::ConfigCorrupt(format!(
            "not a version {version} config"
        )));
    }
    Ok(&bytes[CONFIG_MAGIC.len() + 1..])
}

fn serialize_current(cfg: &VolumeConfig) -> Vec<u8> {
    let record = ConfigRecord {
        cipher_name: cfg.cipher_name.clone(),
        key_bits: cfg.key_bits,
        block_size: cfg.block_size,
        name_alg: cfg.name_alg.clone(),
        case_insensitive: cfg.case_insensitive,
        wrapped_key: cfg.wrapped_key.clone(),
        salt: cfg.salt.clone(),
        kdf_iterations: cfg.kdf_iterations,
        unique_iv: cfg.unique_iv,
        chained_name_iv: cfg.chained_name_iv,
        block_mac_bytes: cfg.block_mac_bytes,
        block_mac_rand_bytes: cfg.block_mac_rand_bytes,
        allow_holes: cfg.allow_holes,
        unique_volume_id: cfg.unique_volume_id.clone(),
    };
    let mut out = Vec::with_capacity(CONFIG_MAGIC.len() + 1 + record.encoded_len() + 4);
    out.extend_from_slice(CONFIG_MAGIC);
    out.push(CURRENT_VERSION);
    out.extend_from_slice(&record.encode_length_delimited_to_vec());
    out
}

fn parse_current(bytes: &[u8]) -> Result<VolumeConfig> {
    let body = body(bytes, CURRENT_VERSION)?;
    let record = ConfigRecord::decode_length_delimited(body)
        .map_err(|e| Error::ConfigCorrupt(e.to_string()))?;
    Ok(VolumeConfig {
        version: CURRENT_VERSION,
        cipher_name: record.cipher_name,
        key_bits: record.key_bits,
        block_size: record.block_size,
        name_alg: record.name_alg,
        case_insensitive: record.case_insensitive,
        wrapped_key: record.wrapped_key,
        salt: record.salt,
        kdf_iterations: record.kdf_iterations,
        unique_iv: record.unique_iv,
        chained_name_iv: record.chained_name_iv,
        block_mac_bytes: record.block_mac_bytes,
        block_mac_rand_bytes: record.block_mac_rand_bytes,
        allow_holes: record.allow_holes,
        unique_volume_id: record.unique_volume_id,
    })
}

fn parse_v6(bytes: &[u8]) -> Result<VolumeConfig> {
    let v6: LegacyV6 =
        bincode::deserialize(body(bytes, 6)?).map_err(|e| Error::ConfigCorrupt(e.to_string()))?;
    Ok(VolumeConfig {
        version: 6,
        cipher_name: v6.cipher_name,
        key_bits: v6.key_bits,
        block_size: v6.block_size,
        name_alg: v6.name_alg,
        case_insensitive: v6.case_insensitive,
        wrapped_key: v6.wrapped_key,
        salt: v6.salt,
        kdf_iterations: v6.kdf_iterations,
        unique_iv: v6.unique_iv,
        chained_name_iv: v6.chained_name_iv,
        block_mac_bytes: v6.block_mac_bytes,
        block_mac_rand_bytes: v6.block_mac_rand_bytes,
        allow_holes: false,
        unique_volume_id: v6.unique_volume_id,
    })
}

fn parse_v5(bytes: &[u8]) -> Result<VolumeConfig> {
    let v5: LegacyV5 =
        bincode::deserialize(body(bytes, 5)?).map_err(|e| Error::ConfigCorrupt(e.to_string()))?;
    let salt = if v5.salt.is_empty() {
        LEGACY_SALT.to_vec()
    } else {
        v5.salt
    };
    Ok(VolumeConfig {
        version: 5,
        cipher_name: v5.cipher_name,
        key_bits: v5.key_bits,
        block_size: v5.block_size,
        name_alg: v5.name_alg,
        case_insensitive: false,
        wrapped_key: v5.wrapped_key,
        salt,
        kdf_iterations: v5.kdf_iterations.max(1),
        unique_iv: v5.unique_iv,
        chained_name_iv: v5.chained_name_iv,
        block_mac_bytes: v5.block_mac_bytes,
        block_mac_rand_bytes: 0,
        allow_holes: false,
        unique_volume_id: vec![0u8; VOLUME_ID_LEN],
    })
}

fn parse_v4(bytes: &[u8]) -> Result<VolumeConfig> {
    let v4: LegacyV4 =
        bincode::deserialize(body(bytes, 4)?).map_err(|e| Error::ConfigCorrupt(e.to_string()))?;
    Ok(VolumeConfig {
        version: 4,
        cipher_name: v4.cipher_name,
        key_bits: v4.key_bits,
        block_size: v4.block_size,
        name_alg: NameAlg::Block.as_str().to_string(),
        case_insensitive: false,
        wrapped_key: v4.wrapped_key,
        salt: LEGACY_SALT.to_vec(),
        kdf_iterations: LEGACY_KDF_ITERATIONS,
        unique_iv: false,
        chained_name_iv: false,
        block_mac_bytes: 0,
        block_mac_rand_bytes: 0,
        allow_holes: false,
        unique_volume_id: vec![0u8; VOLUME_ID_LEN],
    })
}

/// The oldest layout has no magic: three little-endian u32 fields (key
/// bits, block size, wrapped key length) followed by the wrapped key.
fn parse_prehistoric(bytes: &[u8]) -> Result<VolumeConfig> {
    if bytes.len() < 12 {
        return Err(Error::ConfigCorrupt("too short for any format".into()));
    }
    let key_bits = u32::from_le_bytes(bytes[0..4].try_into().expect("4-byte slice"));
    let block_size = u32::from_le_bytes(bytes[4..8].try_into().expect("4-byte slice"));
    let key_len = u32::from_le_bytes(bytes[8..12].try_into().expect("4-byte slice")) as usize;
    if bytes.len() != 12 + key_len {
        return Err(Error::ConfigCorrupt("bad prehistoric key length".into()));
    }
    CipherAlg::from_key_bits(key_bits)?;
    Ok(VolumeConfig {
        version: 0,
        cipher_name: "aes".into(),
        key_bits,
        block_size,
        name_alg: NameAlg::Block.as_str().to_string(),
        case_insensitive: false,
        wrapped_key: bytes[12..].to_vec(),
        salt: LEGACY_SALT.to_vec(),
        kdf_iterations: LEGACY_KDF_ITERATIONS,
        unique_iv: false,
        chained_name_iv: false,
        block_mac_bytes: 0,
        block_mac_rand_bytes: 0,
        allow_holes: false,
        unique_volume_id: vec![0u8; VOLUME_ID_LEN],
    })
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::store::PosixStore;

    fn fast_params() -> VolumeParams {
        VolumeParams {
            kdf_target: Duration::from_millis(1),
            ..VolumeParams::standard()
        }
    }

    fn store() -> (tempfile::TempDir, PosixStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = PosixStore::new(dir.path()).unwrap();
        (dir, store)
    }

    #[test]
    fn create_then_mount() {
        let (_d, store) = store();
        let created = create_volume(&store, b"hunter2", &fast_params()).unwrap();
        let mounted = load_volume(&store, b"hunter2", MountOptions::default()).unwrap();

        // Same data key on both sides: ciphertext produced by one decrypts
        // under the other.
        let mut buf = [0x77u8; 16];
        created.cipher.block_encrypt(&mut buf, 12).unwrap();
        mounted.cipher.block_decrypt(&mut buf, 12).unwrap();
        assert_eq!(buf, [0x77u8; 16]);
        assert_eq!(created.header_seed, mounted.header_seed);
        assert_eq!(created.unique_id, mounted.unique_id);
    }

    #[test]
    fn wrong_password_is_bad_password() {
        let (_d, store) = store();
        create_volume(&store, b"right", &fast_params()).unwrap();
        match load_volume(&store, b"wrong", MountOptions::default()) {
            Err(Error::BadPassword) => {}
            other => panic!("expected BadPassword, got {other:?}"),
        }
    }

    #[test]
    fn missing_config_is_config_missing() {
        let (_d, store) = store();
        match load_volume(&store, b"pw", MountOptions::default()) {
            Err(Error::ConfigMissing) => {}
            other => panic!("expected ConfigMissing, got {other:?}"),
        }
    }

    #[test]
    fn garbage_config_is_config_corrupt() {
        let (_d, store) = store();
        let mut h = store.open(&format!("/{CONFIG_FILENAME}"), true, true).unwrap();
        h.write_at(0, b"CKFS\x07this is not a protobuf record at all")
            .unwrap();
        drop(h);
        match load_volume(&store, b"pw", MountOptions::default()) {
            Err(Error::ConfigCorrupt(_)) => {}
            other => panic!("expected ConfigCorrupt, got {other:?}"),
        }
    }

    #[test]
    fn create_refuses_existing_volume() {
        let (_d, store) = store();
        create_volume(&store, b"pw", &fast_params()).unwrap();
        assert!(matches!(
            create_volume(&store, b"pw", &fast_params()),
            Err(Error::Exists(_))
        ));
    }

    #[test]
    fn chained_names_require_unique_iv() {
        let params = VolumeParams {
            unique_iv: false,
            chained_name_iv: true,
            ..fast_params()
        };
        assert!(params.validate().is_err());
        assert!(VolumeParams::standard().validate().is_ok());
        assert!(VolumeParams::paranoia().validate().is_ok());
    }

    fn round_trip_password(store: &PosixStore, cfg: &VolumeConfig, password: &[u8]) {
        let mounted = load_volume(store, password, MountOptions::default()).unwrap();
        assert_eq!(mounted.block_size, cfg.block_size as usize);
    }

    fn legacy_wrapped_key(password: &[u8], alg: CipherAlg) -> (Vec<u8>, Vec<u8>, u32) {
        let salt = LEGACY_SALT.to_vec();
        let iterations = LEGACY_KDF_ITERATIONS;
        let volume_key = Cipher::from_password(alg, password, &salt, iterations);
        let data_key = Cipher::generate(alg);
        (volume_key.wrap_key(&data_key).unwrap(), salt, iterations)
    }

    #[test]
    fn v6_config_is_readable() {
        let (_d, store) = store();
        let (wrapped_key, salt, kdf_iterations) = legacy_wrapped_key(b"pw", CipherAlg::Aes192);
        let v6 = LegacyV6 {
            cipher_name: "aes".into(),
            key_bits: 192,
            block_size: 2048,
            name_alg: "names/stream".into(),
            case_insensitive: true,
            wrapped_key,
            salt,
            kdf_iterations,
            unique_iv: true,
            chained_name_iv: false,
            block_mac_bytes: 4,
            block_mac_rand_bytes: 2,
            unique_volume_id: vec![9u8; VOLUME_ID_LEN],
        };
        let mut bytes = CONFIG_MAGIC.to_vec();
        bytes.push(6);
        bytes.extend_from_slice(&bincode::serialize(&v6).unwrap());
        store
            .open(&format!("/{CONFIG_FILENAME}"), true, true)
            .unwrap()
            .write_at(0, &bytes)
            .unwrap();

        let cfg = load_config(&store).unwrap();
        assert_eq!(cfg.version, 6);
        assert_eq!(cfg.block_mac_bytes, 4);
        round_trip_password(&store, &cfg, b"pw");
    }

    #[test]
    fn v5_config_is_readable_with_fixed_salt() {
        let (_d, store) = store();
        let (wrapped_key, _, _) = legacy_wrapped_key(b"pw", CipherAlg::Aes256);
        let v5 = LegacyV5 {
            cipher_name: "aes".into(),
            key_bits: 256,
            block_size: 512,
            name_alg: "names/block".into(),
            wrapped_key,
            salt: vec![],
            kdf_iterations: LEGACY_KDF_ITERATIONS,
            unique_iv: false,
            chained_name_iv: false,
            block_mac_bytes: 0,
        };
        let mut bytes = CONFIG_MAGIC.to_vec();
        bytes.push(5);
        bytes.extend_from_slice(&bincode::serialize(&v5).unwrap());
        store
            .open(&format!("/{CONFIG_FILENAME}"), true, true)
            .unwrap()
            .write_at(0, &bytes)
            .unwrap();

        let cfg = load_config(&store).unwrap();
        assert_eq!(cfg.version, 5);
        assert_eq!(cfg.salt, LEGACY_SALT.to_vec());
        round_trip_password(&store, &cfg, b"pw");
    }

    #[test]
    fn v4_and_prehistoric_configs_are_readable() {
        let (_d, store) = store();
        let (wrapped_key, _, _) = legacy_wrapped_key(b"pw", CipherAlg::Aes128);

        let v4 = LegacyV4 {
            cipher_name: "aes".into(),
            key_bits: 128,
            block_size: 1024,
            wrapped_key: wrapped_key.clone(),
        };
        let mut bytes = CONFIG_MAGIC.to_vec();
        bytes.push(4);
        bytes.extend_from_slice(&bincode::serialize(&v4).unwrap());
        let cfg = parse_config(&bytes).unwrap();
        assert_eq!(cfg.version, 4);
        assert!(!cfg.unique_iv);

        let mut raw = Vec::new();
        raw.extend_from_slice(&128u32.to_le_bytes());
        raw.extend_from_slice(&1024u32.to_le_bytes());
        raw.extend_from_slice(&(wrapped_key.len() as u32).to_le_bytes());
        raw.extend_from_slice(&wrapped_key);
        let cfg = parse_config(&raw).unwrap();
        assert_eq!(cfg.version, 0);
        assert_eq!(cfg.key_bits, 128);

        store
            .open(&format!("/{CONFIG_FILENAME}"), true, true)
            .unwrap()
            .write_at(0, &raw)
            .unwrap();
        round_trip_password(&store, &cfg, b"pw");
    }

    #[test]
    fn save_is_atomic_and_rereadable() {
        let (_d, store) = store();
        create_volume(&store, b"pw", &fast_params()).unwrap();
        let mut cfg = load_config(&store).unwrap();
        cfg.block_size = 4096;
        save_config(&store, &cfg).unwrap();

        assert!(store.stat(&format!("/{CONFIG_TMP}")).is_err());
        let reread = load_config(&store).unwrap();
        assert_eq!(reread.block_size, 4096);
        assert_eq!(reread.version, CURRENT_VERSION);
    }
}
