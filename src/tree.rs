//! The directory-tree controller: plaintext paths in, cipher paths out.
//!
//! [`CloakFs`] owns the open-node map (plaintext path → weak node
//! reference), translates every caller path through the name codec, and
//! orchestrates the operations that touch more than one object: directory
//! iteration with invalid-entry collection, unlink tombstoning, and rename.
//!
//! Renames are trivial until IV chaining is on: then every descendant's
//! encoded name depends on the renamed ancestors, so the controller walks
//! the plaintext subtree, journals `(old cipher, new cipher)` pairs, applies
//! them deepest-first with the top-level target last, and compensates in
//! reverse order if anything fails. Files whose external IV changes get
//! their IV headers re-based; live nodes additionally have their stored
//! paths rewritten in place so open handles survive the rename.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use log::{debug, error, warn};
use umask::Mode;

use crate::cipherfile;
use crate::config::{self, FsConfig, MountOptions, VolumeParams, CONFIG_FILENAME};
use crate::error::{Error, Result};
use crate::macfile;
use crate::nameio::{self, NameCodec};
use crate::node::{FileHandle, FileNode};
use crate::store::{BackingStore, Capabilities, FileType, Metadata};

use parking_lot::Mutex;

pub struct CloakFs {
    store: Arc<dyn BackingStore>,
    config: Arc<FsConfig>,
    nodes: Mutex<HashMap<String, Weak<FileNode>>>,
}

fn validate_path(path: &str) -> Result<()> {
    if !path.starts_with('/') || path.contains('\0') {
        return Err(Error::InvalidArgument(path.into()));
    }
    if path.len() > 1 && path.ends_with('/') {
        return Err(Error::InvalidArgument(path.into()));
    }
    if path.len() > 1 {
        for comp in path[1..].split('/') {
            if comp.is_empty() || comp == "." || comp == ".." {
                return Err(Error::InvalidArgument(path.into()));
            }
        }
    }
    Ok(())
}

fn join_path(parent: &str, name: &str) -> String {
    if parent == "/" {
        format!("/{name}")
    } else {
        format!("{parent}/{name}")
    }
}

fn split_path(path: &str) -> (&str, &str) {
    let idx = path.rfind('/').unwrap_or(0);
    let parent = if idx == 0 { "/" } else { &path[..idx] };
    (parent, &path[idx + 1..])
}

struct RenameEntry {
    plain_old: String,
    plain_new: String,
    /// Full cipher path valid at the moment this entry is applied (all
    /// ancestors still under their old names).
    old_cipher: String,
    /// Rename destination at apply time: same parent directory with the
    /// re-encoded final component, except for the top-level target which
    /// moves to its real destination.
    new_cipher: String,
    /// Full cipher path once the whole cascade has run.
    final_cipher: String,
    is_dir: bool,
    old_ext: u64,
    new_ext: u64,
}

impl CloakFs {
    pub fn new(store: Arc<dyn BackingStore>, config: FsConfig) -> Self {
        CloakFs {
            store,
            config: Arc::new(config),
            nodes: Mutex::new(HashMap::new()),
        }
    }

    /// Creates a volume in the backing root and returns it mounted.
    pub fn create(
        store: Arc<dyn BackingStore>,
        password: &[u8],
        params: &VolumeParams,
    ) -> Result<Self> {
        let config = config::create_volume(store.as_ref(), password, params)?;
        Ok(CloakFs::new(store, config))
    }

    /// Mounts an existing volume.
    pub fn mount(
        store: Arc<dyn BackingStore>,
        password: &[u8],
        opts: MountOptions,
    ) -> Result<Self> {
        let config = config::load_volume(store.as_ref(), password, opts)?;
        Ok(CloakFs::new(store, config))
    }

    pub fn config(&self) -> &FsConfig {
        &self.config
    }

    pub fn capabilities(&self) -> Capabilities {
        self.store.capabilities()
    }

    fn codec(&self) -> &dyn NameCodec {
        self.config.names.as_ref()
    }

    /// Translates a plaintext path, returning the cipher path and the IV
    /// the name chain ends on.
    fn cipher_path(&self, plain: &str) -> Result<(String, u64)> {
        validate_path(plain)?;
        nameio::encode_path(self.codec(), self.config.chained_name_iv, plain)
    }

    fn live_node(&self, path: &str) -> Option<Arc<FileNode>> {
        let mut map = self.nodes.lock();
        match map.get(path) {
            Some(weak) => match weak.upgrade() {
                Some(node) => Some(node),
                None => {
                    map.remove(path);
                    None
                }
            },
            None => None,
        }
    }

    fn tombstone(&self, path: &str) {
        if let Some(node) = self
            .nodes
            .lock()
            .remove(path)
            .and_then(|weak| weak.upgrade())
        {
            node.lock().unlinked = true;
        }
    }

    /// Opens (or creates) a file, returning a handle to the unique live
    /// node for that plaintext path.
    pub fn open_file(&self, path: &str, writable: bool, create: bool) -> Result<FileHandle> {
        debug!("open: path = {path}, writable = {writable}, create = {create}");
        validate_path(path)?;

        if let Some(node) = self.live_node(path) {
            if writable {
                node.upgrade(self.store.as_ref(), &self.config)?;
            }
            return Ok(FileHandle::new(node, writable));
        }

        let (cpath, iv) = self.cipher_path(path)?;
        let external_iv = if self.config.chained_name_iv { iv } else { 0 };
        let node = FileNode::open(
            self.store.as_ref(),
            &self.config,
            path,
            &cpath,
            external_iv,
            writable,
            create,
        )?;

        // Another thread may have created the node for this path while ours
        // was being built; the map decides which one lives.
        let node = {
            let mut map = self.nodes.lock();
            match map.get(path).and_then(Weak::upgrade) {
                Some(existing) => existing,
                None => {
                    map.insert(path.to_string(), Arc::downgrade(&node));
                    node
                }
            }
        };
        if writable {
            node.upgrade(self.store.as_ref(), &self.config)?;
        }
        Ok(FileHandle::new(node, writable))
    }

    /// Plaintext-view metadata: sizes are reported net of the IV header and
    /// per-block overhead.
    pub fn stat(&self, path: &str) -> Result<Metadata> {
        let (cpath, _) = self.cipher_path(path)?;
        let mut meta = self.store.stat(&cpath)?;
        if meta.ftype == FileType::File {
            meta.size = match self.live_node(path) {
                Some(node) => node.lock().io.size(),
                None => macfile::plaintext_size(
                    meta.size,
                    self.config.header_len(),
                    self.config.block_size,
                    self.config.block_overhead(),
                ),
            };
        }
        Ok(meta)
    }

    pub fn mkdir(&self, path: &str, mode: u32) -> Result<()> {
        debug!("mkdir: path = {path}, mode = {}", Mode::from(mode));
        let (cpath, _) = self.cipher_path(path)?;
        if path == "/" {
            return Err(Error::Exists(path.into()));
        }
        self.store.mkdir(&cpath, mode)
    }

    pub fn rmdir(&self, path: &str) -> Result<()> {
        debug!("rmdir: path = {path}");
        if path == "/" {
            return Err(Error::InvalidArgument(path.into()));
        }
        let (cpath, _) = self.cipher_path(path)?;
        self.store.rmdir(&cpath)
    }

    pub fn unlink(&self, path: &str) -> Result<()> {
        debug!("unlink: path = {path}");
        let (cpath, _) = self.cipher_path(path)?;
        self.store.unlink(&cpath)?;
        self.tombstone(path);
        Ok(())
    }

    pub fn set_times(&self, path: &str, atime: i64, mtime: i64) -> Result<()> {
        if !self.store.capabilities().times {
            return Err(Error::Unsupported("set_times"));
        }
        let (cpath, _) = self.cipher_path(path)?;
        self.store.set_times(&cpath, atime, mtime)
    }

    pub fn chmod(&self, path: &str, mode: u32) -> Result<()> {
        debug!("chmod: path = {path}, mode = {}", Mode::from(mode));
        if !self.store.capabilities().posix_perms {
            return Err(Error::Unsupported("chmod"));
        }
        let (cpath, _) = self.cipher_path(path)?;
        self.store.chmod(&cpath, mode)
    }

    pub fn chown(&self, path: &str, uid: u32, gid: u32) -> Result<()> {
        debug!("chown: path = {path}, uid = {uid}, gid = {gid}");
        if !self.store.capabilities().posix_perms {
            return Err(Error::Unsupported("chown"));
        }
        let (cpath, _) = self.cipher_path(path)?;
        self.store.chown(&cpath, uid, gid)
    }

    /// Creates a symlink whose target string is stored encrypted as a
    /// single codec component (targets may be relative, so they are not
    /// path-translated).
    pub fn symlink(&self, target: &str, link: &str) -> Result<()> {
        debug!("symlink: target = {target}, link = {link}");
        if !self.store.capabilities().symlinks {
            return Err(Error::Unsupported("symlink"));
        }
        let (link_c, _) = self.cipher_path(link)?;
        let enc_target = self.codec().encode_component(0, target.as_bytes())?;
        self.store.symlink(&enc_target, &link_c)
    }

    pub fn readlink(&self, path: &str) -> Result<String> {
        if !self.store.capabilities().symlinks {
            return Err(Error::Unsupported("readlink"));
        }
        let (cpath, _) = self.cipher_path(path)?;
        let enc = self.store.readlink(&cpath)?;
        let plain = self.codec().decode_component(0, &enc)?;
        String::from_utf8(plain).map_err(|_| Error::InvalidArgument("non-UTF-8 link target".into()))
    }

    /// Hard links share one object under two paths, which cannot coexist
    /// with per-path external IVs.
    pub fn link(&self, from: &str, to: &str) -> Result<()> {
        debug!("link: from = {from}, to = {to}");
        if !self.store.capabilities().hardlinks {
            return Err(Error::Unsupported("link"));
        }
        if self.config.chained_name_iv {
            return Err(Error::Unsupported("link with chained name IVs"));
        }
        let (from_c, _) = self.cipher_path(from)?;
        let (to_c, _) = self.cipher_path(to)?;
        self.store.link(&from_c, &to_c)
    }

    /// Iterates a directory's decoded names; undecodable entries are
    /// collected instead of surfaced.
    pub fn readdir(&self, path: &str) -> Result<DirIter> {
        debug!("readdir: path = {path}");
        let (cpath, iv) = self.cipher_path(path)?;
        let entries = self.store.readdir(&cpath)?;
        Ok(DirIter {
            entries,
            names: self.config.names.clone(),
            iv: if self.config.chained_name_iv { iv } else { 0 },
            skip_config: path == "/",
            invalid: Vec::new(),
        })
    }

    pub fn rename(&self, from: &str, to: &str) -> Result<()> {
        debug!("rename: from = {from}, to = {to}");
        validate_path(from)?;
        validate_path(to)?;
        if from == "/" || to == "/" {
            return Err(Error::InvalidArgument("cannot rename the root".into()));
        }
        if from == to {
            return Ok(());
        }
        if to.starts_with(&format!("{from}/")) {
            return Err(Error::InvalidArgument(format!(
                "cannot rename {from} into its own subtree"
            )));
        }
        let meta = self.stat(from)?;
        let is_dir = meta.ftype == FileType::Dir;

        if !self.config.chained_name_iv {
            let (from_c, _) = self.cipher_path(from)?;
            let (to_c, _) = self.cipher_path(to)?;
            self.store.rename(&from_c, &to_c)?;
            self.tombstone(to);
            self.rekey_simple(from, to, &from_c, &to_c);
            return Ok(());
        }
        self.rename_chained(from, to, is_dir)
    }

    /// Without chained IVs only the renamed prefix changes; descendants
    /// keep their cipher names and no IV moves.
    fn rekey_simple(&self, from: &str, to: &str, from_c: &str, to_c: &str) {
        let mut map = self.nodes.lock();
        let prefix = format!("{from}/");
        let keys: Vec<String> = map
            .keys()
            .filter(|k| k.as_str() == from || k.starts_with(&prefix))
            .cloned()
            .collect();
        for key in keys {
            let weak = match map.remove(&key) {
                Some(weak) => weak,
                None => continue,
            };
            let new_key = format!("{to}{}", &key[from.len()..]);
            if let Some(node) = weak.upgrade() {
                let mut st = node.lock();
                st.plain_path = new_key.clone();
                st.cipher_path = format!("{to_c}{}", &st.cipher_path[from_c.len()..]);
                drop(st);
                map.insert(new_key, weak);
            }
        }
    }

    /// Builds the rename journal for a subtree, post-order so every entry
    /// is applied before its parent and the top-level target comes last.
    fn plan_renames(
        &self,
        plain_old: &str,
        plain_new: &str,
        is_dir: bool,
        is_top: bool,
        plan: &mut Vec<RenameEntry>,
    ) -> Result<()> {
        if is_dir {
            let names: Vec<String> = self.readdir(plain_old)?.collect();
            for name in names {
                let child_old = join_path(plain_old, &name);
                let child_new = join_path(plain_new, &name);
                let child_is_dir = self.stat(&child_old)?.ftype == FileType::Dir;
                self.plan_renames(&child_old, &child_new, child_is_dir, false, plan)?;
            }
        }

        let codec = self.codec();
        let (old_cipher, old_ext) = nameio::encode_path(codec, true, plain_old)?;
        let (final_cipher, new_ext) = nameio::encode_path(codec, true, plain_new)?;
        let (new_parent, new_comp) = split_path(plain_new);
        let (new_parent_cipher, parent_chain) = nameio::encode_path(codec, true, new_parent)?;
        let enc_comp = codec.encode_component(parent_chain, new_comp.as_bytes())?;
        let new_cipher = if is_top {
            join_path(&new_parent_cipher, &enc_comp)
        } else {
            let (old_parent_cipher, _) = split_path(&old_cipher);
            join_path(old_parent_cipher, &enc_comp)
        };
        plan.push(RenameEntry {
            plain_old: plain_old.to_string(),
            plain_new: plain_new.to_string(),
            old_cipher,
            new_cipher,
            final_cipher,
            is_dir,
            old_ext,
            new_ext,
        });
        Ok(())
    }

    fn rollback(&self, applied: &[RenameEntry]) {
        for e in applied.iter().rev() {
            if let Err(err) = self.store.rename(&e.new_cipher, &e.old_cipher) {
                error!(
                    "rename rollback failed: {} -> {}: {err}",
                    e.new_cipher, e.old_cipher
                );
            }
        }
    }

    fn revert_external_ivs(&self, adjusted: &[(Arc<FileNode>, u64)]) {
        for (node, old_ext) in adjusted {
            let mut st = node.lock();
            if let Err(err) = st.io.io_mut().set_external_iv(*old_ext) {
                error!(
                    "rename rollback: failed to restore file IV for {}: {err}",
                    st.plain_path
                );
            }
        }
    }

    fn rename_chained(&self, from: &str, to: &str, is_dir: bool) -> Result<()> {
        let mut plan = Vec::new();
        self.plan_renames(from, to, is_dir, true, &mut plan)?;
        let top = plan.len() - 1;

        for i in 0..top {
            if let Err(err) = self.store.rename(&plan[i].old_cipher, &plan[i].new_cipher) {
                warn!("rename: descendant rename failed, rolling back: {err}");
                self.rollback(&plan[..i]);
                return Err(err);
            }
        }

        // Live writable nodes rewrite their IV headers before the rename
        // commits; their open descriptors are unaffected by the path moves.
        let mut adjusted: Vec<(Arc<FileNode>, u64)> = Vec::new();
        for e in plan.iter().filter(|e| !e.is_dir && e.old_ext != e.new_ext) {
            if let Some(node) = self.live_node(&e.plain_old) {
                let mut st = node.lock();
                if st.writable {
                    if let Err(err) = st.io.io_mut().set_external_iv(e.new_ext) {
                        drop(st);
                        self.revert_external_ivs(&adjusted);
                        self.rollback(&plan[..top]);
                        return Err(err);
                    }
                    drop(st);
                    adjusted.push((node, e.old_ext));
                }
            }
        }

        if let Err(err) = self.store.rename(&plan[top].old_cipher, &plan[top].new_cipher) {
            warn!("rename: top-level rename failed, rolling back: {err}");
            self.revert_external_ivs(&adjusted);
            self.rollback(&plan[..top]);
            return Err(err);
        }

        self.tombstone(to);

        // Closed files whose external IV moved get their headers re-based
        // at their final locations.
        let mut first_err = None;
        for e in plan.iter().filter(|e| !e.is_dir && e.old_ext != e.new_ext) {
            if self.live_node(&e.plain_old).is_some() {
                continue;
            }
            if let Err(err) = cipherfile::rebase_file_iv(
                self.store.as_ref(),
                &e.final_cipher,
                &self.config.cipher,
                self.config.header_seed,
                e.old_ext,
                e.new_ext,
            ) {
                error!("rename: IV header fix failed for {}: {err}", e.plain_new);
                if first_err.is_none() {
                    first_err = Some(err);
                }
            }
        }

        // Rekey the open map and patch live nodes' stored paths (and, for
        // read-only nodes, their in-memory IVs after the on-disk re-base).
        {
            let mut map = self.nodes.lock();
            for e in &plan {
                let weak = match map.remove(&e.plain_old) {
                    Some(weak) => weak,
                    None => continue,
                };
                let node = match weak.upgrade() {
                    Some(node) => node,
                    None => {
                        // Died after the closed-file pass looked at it; its
                        // header still needs the re-base.
                        if !e.is_dir && e.old_ext != e.new_ext {
                            if let Err(err) = cipherfile::rebase_file_iv(
                                self.store.as_ref(),
                                &e.final_cipher,
                                &self.config.cipher,
                                self.config.header_seed,
                                e.old_ext,
                                e.new_ext,
                            ) {
                                error!(
                                    "rename: IV header fix failed for {}: {err}",
                                    e.plain_new
                                );
                                if first_err.is_none() {
                                    first_err = Some(err);
                                }
                            }
                        }
                        continue;
                    }
                };
                let mut st = node.lock();
                if !e.is_dir && e.old_ext != e.new_ext && !st.writable {
                    match cipherfile::rebase_file_iv(
                        self.store.as_ref(),
                        &e.final_cipher,
                        &self.config.cipher,
                        self.config.header_seed,
                        e.old_ext,
                        e.new_ext,
                    ) {
                        Ok(()) => st.io.io_mut().note_external_iv(e.new_ext),
                        Err(err) => {
                            error!("rename: IV header fix failed for {}: {err}", e.plain_new);
                            if first_err.is_none() {
                                first_err = Some(err);
                            }
                        }
                    }
                }
                st.plain_path = e.plain_new.clone();
                st.cipher_path = e.final_cipher.clone();
                drop(st);
                map.insert(e.plain_new.clone(), weak);
            }
        }

        match first_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

/// One pass over a directory: yields decoded plaintext names; cipher names
/// that fail to decode are collected for [`DirIter::invalid_names`].
pub struct DirIter {
    entries: Box<dyn Iterator<Item = String> + Send>,
    names: Arc<dyn NameCodec>,
    iv: u64,
    skip_config: bool,
    invalid: Vec<String>,
}

impl DirIter {
    /// Cipher names seen so far that did not decode.
    pub fn invalid_names(&self) -> &[String] {
        &self.invalid
    }
}

impl Iterator for DirIter {
    type Item = String;

    fn next(&mut self) -> Option<String> {
        loop {
            let cipher_name = self.entries.next()?;
            if self.skip_config && cipher_name.starts_with(CONFIG_FILENAME) {
                continue;
            }
            match self
                .names
                .decode_component(self.iv, &cipher_name)
                .and_then(|bytes| {
                    String::from_utf8(bytes)
                        .map_err(|_| Error::InvalidArgument("non-UTF-8 name".into()))
                }) {
                Ok(name) => return Some(name),
                Err(_) => self.invalid.push(cipher_name),
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::store::PosixStore;
    use std::time::Duration;

    fn fast(mut params: VolumeParams) -> VolumeParams {
        params.kdf_target = Duration::from_millis(1);
        params
    }

    fn volume(params: VolumeParams) -> (tempfile::TempDir, Arc<PosixStore>, CloakFs) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(PosixStore::new(dir.path()).unwrap());
        let fs = CloakFs::create(store.clone(), b"pw", &fast(params)).unwrap();
        (dir, store, fs)
    }

    fn write_file(fs: &CloakFs, path: &str, data: &[u8]) {
        let h = fs.open_file(path, true, true).unwrap();
        h.write(0, data).unwrap();
    }

    fn read_file(fs: &CloakFs, path: &str) -> Vec<u8> {
        let h = fs.open_file(path, false, false).unwrap();
        let size = h.stat().unwrap() as usize;
        let mut buf = vec![0u8; size];
        assert_eq!(h.read(0, &mut buf).unwrap(), size);
        buf
    }

    #[test]
    fn hello_world_survives_reopen_and_remount() {
        let (_d, store, fs) = volume(VolumeParams::standard());
        write_file(&fs, "/a", b"hello world");
        assert_eq!(read_file(&fs, "/a"), b"hello world");
        drop(fs);

        let fs = CloakFs::mount(store, b"pw", MountOptions::default()).unwrap();
        assert_eq!(read_file(&fs, "/a"), b"hello world");
    }

    #[test]
    fn wrong_password_fails_to_mount() {
        let (_d, store, fs) = volume(VolumeParams::standard());
        drop(fs);
        match CloakFs::mount(store, b"not it", MountOptions::default()) {
            Err(Error::BadPassword) => {}
            other => panic!("expected BadPassword, got {:?}", other.err()),
        }
    }

    #[test]
    fn overlay_write_reads_back_merged() {
        let (_d, _s, fs) = volume(VolumeParams::standard());
        let h = fs.open_file("/f", true, true).unwrap();
        h.write(0, b"abc").unwrap();
        h.write(1, b"Z").unwrap();
        let mut buf = [0u8; 3];
        assert_eq!(h.read(0, &mut buf).unwrap(), 3);
        assert_eq!(&buf, b"aZc");
    }

    #[test]
    fn stat_reports_plaintext_sizes() {
        let mut params = VolumeParams::standard();
        params.mac_bytes = 8;
        let (_d, store, fs) = volume(params);
        write_file(&fs, "/f", &[0xAA; 3000]);

        assert_eq!(fs.stat("/f").unwrap().size, 3000);
        let (cpath, _) = fs.cipher_path("/f").unwrap();
        assert_eq!(store.stat(&cpath).unwrap().size, 8 + 2 * 1032 + 960);

        // Size fidelity through truncates, open and closed.
        let h = fs.open_file("/f", true, false).unwrap();
        h.truncate(100).unwrap();
        assert_eq!(fs.stat("/f").unwrap().size, 100);
        drop(h);
        assert_eq!(fs.stat("/f").unwrap().size, 100);
    }

    #[test]
    fn open_nodes_are_unique_per_path() {
        let (_d, _s, fs) = volume(VolumeParams::standard());
        write_file(&fs, "/f", b"x");

        let handles: Vec<FileHandle> = std::thread::scope(|scope| {
            let workers: Vec<_> = (0..8)
                .map(|_| scope.spawn(|| fs.open_file("/f", false, false).unwrap()))
                .collect();
            workers.into_iter().map(|w| w.join().unwrap()).collect()
        });
        for h in &handles[1..] {
            assert!(Arc::ptr_eq(&handles[0].node, &h.node));
        }
    }

    #[test]
    fn idempotence_of_repeated_operations() {
        let (_d, _s, fs) = volume(VolumeParams::standard());
        fs.mkdir("/d", 0o755).unwrap();
        assert!(matches!(fs.mkdir("/d", 0o755), Err(Error::Exists(_))));
        assert!(matches!(fs.unlink("/nope"), Err(Error::NotFound(_))));

        write_file(&fs, "/f", b"data");
        let h = fs.open_file("/f", false, false).unwrap();
        h.sync(false).unwrap();
        h.sync(false).unwrap();
        h.sync(true).unwrap();
        assert_eq!(read_file(&fs, "/f"), b"data");
    }

    #[test]
    fn unlinked_open_file_stays_readable() {
        let (_d, _s, fs) = volume(VolumeParams::standard());
        write_file(&fs, "/f", b"still here");
        let h = fs.open_file("/f", false, false).unwrap();
        fs.unlink("/f").unwrap();
        assert!(fs.stat("/f").is_err());

        let mut buf = [0u8; 10];
        assert_eq!(h.read(0, &mut buf).unwrap(), 10);
        assert_eq!(&buf, b"still here");

        // The path is free again for a fresh file.
        write_file(&fs, "/f", b"new");
        assert_eq!(read_file(&fs, "/f"), b"new");
    }

    #[test]
    fn readdir_decodes_and_collects_invalid_entries() {
        let (_d, store, fs) = volume(VolumeParams::standard());
        write_file(&fs, "/one", b"1");
        write_file(&fs, "/two", b"2");
        fs.mkdir("/sub", 0o755).unwrap();
        // An entry nobody encoded: must surface as invalid, not as garbage.
        store.open("/plainly-wrong", true, true).unwrap();

        let mut iter = fs.readdir("/").unwrap();
        let mut names: Vec<String> = iter.by_ref().collect();
        names.sort();
        assert_eq!(names, ["one", "sub", "two"]);
        assert_eq!(iter.invalid_names(), ["plainly-wrong".to_string()]);
    }

    #[test]
    fn config_file_is_hidden_from_root_listing() {
        let (_d, _s, fs) = volume(VolumeParams::standard());
        let mut iter = fs.readdir("/").unwrap();
        assert_eq!(iter.by_ref().count(), 0);
        assert!(iter.invalid_names().is_empty());
    }

    #[test]
    fn rename_file_and_directory_unchained() {
        let (_d, _s, fs) = volume(VolumeParams::standard());
        write_file(&fs, "/old", b"contents");
        fs.rename("/old", "/new").unwrap();
        assert!(fs.stat("/old").is_err());
        assert_eq!(read_file(&fs, "/new"), b"contents");

        fs.mkdir("/dir", 0o755).unwrap();
        write_file(&fs, "/dir/inner", b"deep");
        let h = fs.open_file("/dir/inner", false, false).unwrap();
        fs.rename("/dir", "/moved").unwrap();
        assert_eq!(h.path(), "/moved/inner");
        assert_eq!(read_file(&fs, "/moved/inner"), b"deep");
    }

    #[test]
    fn chained_rename_cascades_and_remains_mountable() {
        let (_d, store, fs) = volume(VolumeParams::paranoia());
        fs.mkdir("/dir1", 0o755).unwrap();
        write_file(&fs, "/dir1/f1", b"first");
        write_file(&fs, "/dir1/f2", b"second");
        let (old_dir_c, _) = fs.cipher_path("/dir1").unwrap();

        fs.rename("/dir1", "/dir2").unwrap();

        assert!(store.stat(&old_dir_c).is_err());
        assert!(fs.stat("/dir1").is_err());
        assert_eq!(read_file(&fs, "/dir2/f1"), b"first");
        assert_eq!(read_file(&fs, "/dir2/f2"), b"second");
        let mut names: Vec<String> = fs.readdir("/dir2").unwrap().collect();
        names.sort();
        assert_eq!(names, ["f1", "f2"]);

        drop(fs);
        let fs = CloakFs::mount(store, b"pw", MountOptions::default()).unwrap();
        assert_eq!(read_file(&fs, "/dir2/f1"), b"first");
        assert_eq!(read_file(&fs, "/dir2/f2"), b"second");
    }

    #[test]
    fn chained_rename_keeps_open_handles_working() {
        let (_d, _s, fs) = volume(VolumeParams::paranoia());
        fs.mkdir("/dir1", 0o755).unwrap();
        write_file(&fs, "/dir1/f", b"tracked");
        let h = fs.open_file("/dir1/f", true, false).unwrap();

        fs.rename("/dir1", "/dir2").unwrap();
        assert_eq!(h.path(), "/dir2/f");
        let mut buf = [0u8; 7];
        assert_eq!(h.read(0, &mut buf).unwrap(), 7);
        assert_eq!(&buf, b"tracked");

        h.write(7, b" along").unwrap();
        drop(h);
        assert_eq!(read_file(&fs, "/dir2/f"), b"tracked along");
    }

    #[test]
    fn failed_chained_rename_rolls_back() {
        let (_d, _s, fs) = volume(VolumeParams::paranoia());
        fs.mkdir("/dir1", 0o755).unwrap();
        write_file(&fs, "/dir1/f1", b"first");
        write_file(&fs, "/dir1/f2", b"second");

        // Destination parent does not exist, so the final (top-level)
        // rename fails after the descendants were already journaled.
        assert!(fs.rename("/dir1", "/absent/dir2").is_err());

        assert_eq!(read_file(&fs, "/dir1/f1"), b"first");
        assert_eq!(read_file(&fs, "/dir1/f2"), b"second");
        let mut names: Vec<String> = fs.readdir("/dir1").unwrap().collect();
        names.sort();
        assert_eq!(names, ["f1", "f2"]);
    }

    #[test]
    fn mac_corruption_fails_reads_unless_forced() {
        let mut params = VolumeParams::standard();
        params.mac_bytes = 8;
        params.allow_holes = false;
        let (_d, store, fs) = volume(params);
        write_file(&fs, "/f", &[0x5A; 600]);
        let (cpath, _) = fs.cipher_path("/f").unwrap();
        drop(fs);

        let mut h = store.open(&cpath, true, false).unwrap();
        let mut byte = [0u8; 1];
        h.read_at(50, &mut byte).unwrap();
        byte[0] ^= 0x10;
        h.write_at(50, &byte).unwrap();
        drop(h);

        let fs = CloakFs::mount(store.clone(), b"pw", MountOptions::default()).unwrap();
        let handle = fs.open_file("/f", false, false).unwrap();
        let mut buf = vec![0u8; 600];
        match handle.read(0, &mut buf) {
            Err(Error::CryptoFailure(_)) => {}
            other => panic!("expected CryptoFailure, got {other:?}"),
        }
        drop(handle);
        drop(fs);

        let fs = CloakFs::mount(store, b"pw", MountOptions { force_decode: true }).unwrap();
        let handle = fs.open_file("/f", false, false).unwrap();
        assert_eq!(handle.read(0, &mut buf).unwrap(), 600);
    }

    #[test]
    fn symlink_targets_are_encrypted_and_round_trip() {
        let (_d, store, fs) = volume(VolumeParams::standard());
        fs.symlink("/somewhere/else", "/l").unwrap();
        assert_eq!(fs.readlink("/l").unwrap(), "/somewhere/else");

        let (cpath, _) = fs.cipher_path("/l").unwrap();
        let raw_target = store.readlink(&cpath).unwrap();
        assert_ne!(raw_target, "/somewhere/else");
    }

    #[test]
    fn hard_links_are_rejected_under_chaining() {
        let (_d, _s, fs) = volume(VolumeParams::paranoia());
        write_file(&fs, "/f", b"x");
        assert!(matches!(
            fs.link("/f", "/g"),
            Err(Error::Unsupported(_))
        ));

        let (_d2, _s2, fs2) = volume(VolumeParams::standard());
        write_file(&fs2, "/f", b"shared");
        fs2.link("/f", "/g").unwrap();
        assert_eq!(read_file(&fs2, "/g"), b"shared");
    }

    #[test]
    fn path_validation_rejects_malformed_paths() {
        let (_d, _s, fs) = volume(VolumeParams::standard());
        for bad in ["relative", "/a/", "/a//b", "/a/./b", "/a/../b", "/nul\0"] {
            assert!(
                matches!(fs.stat(bad), Err(Error::InvalidArgument(_))),
                "{bad:?} should be rejected"
            );
        }
    }

    #[test]
    fn write_past_eof_then_read_back() {
        let (_d, _s, fs) = volume(VolumeParams::standard());
        let h = fs.open_file("/sparse", true, true).unwrap();
        h.write(0, b"head").unwrap();
        h.write(5000, b"tail").unwrap();
        assert_eq!(h.stat().unwrap(), 5004);

        let mut buf = vec![0xFFu8; 5004];
        assert_eq!(h.read(0, &mut buf).unwrap(), 5004);
        assert_eq!(&buf[..4], b"head");
        assert!(buf[4..5000].iter().all(|&b| b == 0));
        assert_eq!(&buf[5000..], b"tail");
    }
}
