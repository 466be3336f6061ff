//! Live file nodes and the handles the public API hands out.
//!
//! A [`FileNode`] is the single in-process identity of one open plaintext
//! path: the layered I/O stack plus the node's current plain and cipher
//! paths, all behind one mutex so truncate can never race a concurrent
//! read or write. [`FileHandle`]s are strong references to the node; the
//! tree controller holds only weak ones, so the node dies with its last
//! handle.

use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};

use crate::blockfile::BlockFile;
use crate::cipherfile::CipherFile;
use crate::config::FsConfig;
use crate::error::{Error, Result};
use crate::macfile::MacFile;
use crate::rawfile::RawFile;
use crate::store::BackingStore;

pub(crate) struct NodeState {
    pub plain_path: String,
    pub cipher_path: String,
    pub io: BlockFile<CipherFile>,
    pub writable: bool,
    pub unlinked: bool,
}

pub struct FileNode {
    pub(crate) state: Mutex<NodeState>,
}

fn build_stack(
    store: &dyn BackingStore,
    config: &FsConfig,
    cipher_path: &str,
    external_iv: u64,
    writable: bool,
    create: bool,
) -> Result<BlockFile<CipherFile>> {
    let raw = RawFile::open(store, cipher_path, writable, create)?;
    let mac = MacFile::new(
        raw,
        config.cipher.clone(),
        config.block_size,
        config.block_mac_bytes,
        config.block_mac_rand_bytes,
        config.header_len(),
        config.allow_holes,
        config.force_decode,
    );
    let cf = CipherFile::new(
        mac,
        config.cipher.clone(),
        config.block_size,
        config.unique_iv,
        config.header_seed,
        external_iv,
    )?;
    Ok(BlockFile::new(cf))
}

impl FileNode {
    pub(crate) fn open(
        store: &dyn BackingStore,
        config: &FsConfig,
        plain_path: &str,
        cipher_path: &str,
        external_iv: u64,
        writable: bool,
        create: bool,
    ) -> Result<Arc<FileNode>> {
        let io = build_stack(store, config, cipher_path, external_iv, writable, create)?;
        Ok(Arc::new(FileNode {
            state: Mutex::new(NodeState {
                plain_path: plain_path.to_string(),
                cipher_path: cipher_path.to_string(),
                io,
                writable,
                unlinked: false,
            }),
        }))
    }

    /// Reopens the backing object read-write if this node was first opened
    /// read-only. The per-file IV state is re-read from the header, which
    /// cannot have changed while the node was live. An unlinked node cannot
    /// be reopened: its cipher path is gone.
    pub(crate) fn upgrade(&self, store: &dyn BackingStore, config: &FsConfig) -> Result<()> {
        let mut st = self.state.lock();
        if st.writable {
            return Ok(());
        }
        if st.unlinked {
            return Err(Error::NotFound(st.plain_path.clone()));
        }
        let external_iv = st.io.io_mut().external_iv();
        st.io = build_stack(store, config, &st.cipher_path, external_iv, true, false)?;
        st.writable = true;
        Ok(())
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, NodeState> {
        self.state.lock()
    }

    pub fn plain_path(&self) -> String {
        self.state.lock().plain_path.clone()
    }

    pub fn cipher_path(&self) -> String {
        self.state.lock().cipher_path.clone()
    }
}

/// One open file as seen by the caller: positional read/write, truncate,
/// size, sync. Dropping the last handle for a path releases the node.
pub struct FileHandle {
    pub(crate) node: Arc<FileNode>,
    writable: bool,
}

impl FileHandle {
    pub(crate) fn new(node: Arc<FileNode>, writable: bool) -> Self {
        FileHandle { node, writable }
    }

    pub fn read(&self, off: u64, buf: &mut [u8]) -> Result<usize> {
        self.node.state.lock().io.read(off, buf)
    }

    pub fn write(&self, off: u64, data: &[u8]) -> Result<()> {
        if !self.writable {
            return Err(Error::AccessDenied(self.node.plain_path()));
        }
        self.node.state.lock().io.write(off, data)
    }

    pub fn truncate(&self, size: u64) -> Result<()> {
        if !self.writable {
            return Err(Error::AccessDenied(self.node.plain_path()));
        }
        self.node.state.lock().io.truncate(size)
    }

    /// Plaintext size as the caller sees it.
    pub fn stat(&self) -> Result<u64> {
        Ok(self.node.state.lock().io.size())
    }

    pub fn sync(&self, datasync: bool) -> Result<()> {
        self.node.state.lock().io.sync(datasync)
    }

    pub fn path(&self) -> String {
        self.node.plain_path()
    }

    pub fn is_writable(&self) -> bool {
        self.writable
    }
}
