pub mod blockfile;
pub mod cipherfile;
pub mod config;
pub mod crypto;
pub mod error;
pub mod macfile;
pub mod nameio;
pub mod node;
pub mod rawfile;
pub mod store;
pub mod tree;

pub use config::{FsConfig, MountOptions, NameAlg, VolumeConfig, VolumeParams, CONFIG_FILENAME};
pub use error::{Error, Result};
pub use node::FileHandle;
pub use store::{BackingStore, Capabilities, FileType, Metadata, PosixStore, StoreHandle};
pub use tree::{CloakFs, DirIter};
