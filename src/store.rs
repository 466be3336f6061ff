//! The narrow, path-addressed object store the core runs against.
//!
//! Everything above this module speaks [`BackingStore`] and [`StoreHandle`];
//! the one concrete realization here is [`PosixStore`], which maps store
//! paths onto a root directory. POSIX-only operations (ownership, links,
//! symlinks) sit behind [`Capabilities`] so the tree controller can reject
//! them cleanly on stores that cannot advertise them.

use std::ffi::CString;
use std::fmt;
use std::fs::{self, DirBuilder, File};
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::{DirBuilderExt, FileExt, MetadataExt, PermissionsExt};
use std::path::{Path, PathBuf};

use log::debug;

use crate::error::{Error, Result};

#[derive(Clone, Copy, Debug, Default)]
pub struct Capabilities {
    pub posix_perms: bool,
    pub hardlinks: bool,
    pub symlinks: bool,
    pub times: bool,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum FileType {
    File,
    Dir,
    Symlink,
    Other,
}

#[derive(Clone, Copy, Debug)]
pub struct PosixMeta {
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
}

#[derive(Clone, Debug)]
pub struct Metadata {
    pub ftype: FileType,
    pub size: u64,
    pub mtime: i64,
    pub posix: Option<PosixMeta>,
}

/// One open backing object. Positional reads return short counts only at
/// EOF; writes either complete or fail.
pub trait StoreHandle: Send {
    fn read_at(&mut self, off: u64, buf: &mut [u8]) -> Result<usize>;
    fn write_at(&mut self, off: u64, data: &[u8]) -> Result<()>;
    fn truncate(&mut self, size: u64) -> Result<()>;
    fn sync(&mut self, datasync: bool) -> Result<()>;
    fn size(&mut self) -> Result<u64>;
}

impl fmt::Debug for dyn StoreHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StoreHandle").finish()
    }
}

/// Path-addressed object store consumed by the core. Paths are absolute,
/// `/`-separated, and opaque to the store.
pub trait BackingStore: Send + Sync {
    fn capabilities(&self) -> Capabilities;

    fn open(&self, path: &str, writable: bool, create: bool) -> Result<Box<dyn StoreHandle>>;
    fn rename(&self, from: &str, to: &str) -> Result<()>;
    fn unlink(&self, path: &str) -> Result<()>;
    fn mkdir(&self, path: &str, mode: u32) -> Result<()>;
    fn rmdir(&self, path: &str) -> Result<()>;
    fn readdir(&self, path: &str) -> Result<Box<dyn Iterator<Item = String> + Send>>;
    fn stat(&self, path: &str) -> Result<Metadata>;
    fn set_times(&self, path: &str, atime: i64, mtime: i64) -> Result<()>;

    // POSIX extensions; only valid when the matching capability is set.
    fn chmod(&self, _path: &str, _mode: u32) -> Result<()> {
        Err(Error::Unsupported("chmod"))
    }
    fn chown(&self, _path: &str, _uid: u32, _gid: u32) -> Result<()> {
        Err(Error::Unsupported("chown"))
    }
    fn symlink(&self, _target: &str, _link: &str) -> Result<()> {
        Err(Error::Unsupported("symlink"))
    }
    fn readlink(&self, _path: &str) -> Result<String> {
        Err(Error::Unsupported("readlink"))
    }
    fn link(&self, _from: &str, _to: &str) -> Result<()> {
        Err(Error::Unsupported("link"))
    }
}

/// Backing store over a local directory.
pub struct PosixStore {
    root: PathBuf,
}

impl PosixStore {
    pub fn new(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        if !root.is_dir() {
            return Err(Error::NotFound(root.to_string_lossy().into_owned()));
        }
        Ok(PosixStore { root })
    }

    /// Maps a store path under the root. Store paths never contain `.` or
    /// `..` components; reject them rather than escape the root.
    fn resolve(&self, path: &str) -> Result<PathBuf> {
        if !path.starts_with('/') {
            return Err(Error::InvalidArgument(path.into()));
        }
        let mut out = self.root.clone();
        for comp in path.split('/').filter(|c| !c.is_empty()) {
            if comp == "." || comp == ".." {
                return Err(Error::InvalidArgument(path.into()));
            }
            out.push(comp);
        }
        Ok(out)
    }
}

impl BackingStore for PosixStore {
    fn capabilities(&self) -> Capabilities {
        Capabilities {
            posix_perms: true,
            hardlinks: true,
            symlinks: true,
            times: true,
        }
    }

    fn open(&self, path: &str, writable: bool, create: bool) -> Result<Box<dyn StoreHandle>> {
        let real = self.resolve(path)?;
        let file = File::options()
            .read(true)
            .write(writable)
            .create(create && writable)
            .open(&real)
            .map_err(|e| Error::from_store(e, path))?;
        Ok(Box::new(PosixHandle {
            file,
            path: path.to_string(),
        }))
    }

    fn rename(&self, from: &str, to: &str) -> Result<()> {
        debug!("store rename: from = {from}, to = {to}");
        fs::rename(self.resolve(from)?, self.resolve(to)?)
            .map_err(|e| Error::from_store(e, from))
    }

    fn unlink(&self, path: &str) -> Result<()> {
        fs::remove_file(self.resolve(path)?).map_err(|e| Error::from_store(e, path))
    }

    fn mkdir(&self, path: &str, mode: u32) -> Result<()> {
        DirBuilder::new()
            .mode(mode)
            .create(self.resolve(path)?)
            .map_err(|e| Error::from_store(e, path))
    }

    fn rmdir(&self, path: &str) -> Result<()> {
        fs::remove_dir(self.resolve(path)?).map_err(|e| Error::from_store(e, path))
    }

    fn readdir(&self, path: &str) -> Result<Box<dyn Iterator<Item = String> + Send>> {
        let iter = fs::read_dir(self.resolve(path)?).map_err(|e| Error::from_store(e, path))?;
        let names: Vec<String> = iter
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.file_name().to_string_lossy().into_owned())
            .collect();
        Ok(Box::new(names.into_iter()))
    }

    fn stat(&self, path: &str) -> Result<Metadata> {
        let meta =
            fs::symlink_metadata(self.resolve(path)?).map_err(|e| Error::from_store(e, path))?;
        let ftype = if meta.is_dir() {
            FileType::Dir
        } else if meta.is_file() {
            FileType::File
        } else if meta.file_type().is_symlink() {
            FileType::Symlink
        } else {
            FileType::Other
        };
        Ok(Metadata {
            ftype,
            size: meta.len(),
            mtime: meta.mtime(),
            posix: Some(PosixMeta {
                mode: meta.mode(),
                uid: meta.uid(),
                gid: meta.gid(),
            }),
        })
    }

    fn set_times(&self, path: &str, atime: i64, mtime: i64) -> Result<()> {
        let real = self.resolve(path)?;
        let cpath = CString::new(real.as_os_str().as_bytes())
            .map_err(|_| Error::InvalidArgument(path.into()))?;
        let times = [
            libc::timespec {
                tv_sec: atime,
                tv_nsec: 0,
            },
            libc::timespec {
                tv_sec: mtime,
                tv_nsec: 0,
            },
        ];
        let rc = unsafe {
            libc::utimensat(
                libc::AT_FDCWD,
                cpath.as_ptr(),
                times.as_ptr(),
                libc::AT_SYMLINK_NOFOLLOW,
            )
        };
        if rc != 0 {
            return Err(Error::from_store(io::Error::last_os_error(), path));
        }
        Ok(())
    }

    fn chmod(&self, path: &str, mode: u32) -> Result<()> {
        fs::set_permissions(self.resolve(path)?, fs::Permissions::from_mode(mode))
            .map_err(|e| Error::from_store(e, path))
    }

    fn chown(&self, path: &str, uid: u32, gid: u32) -> Result<()> {
        let real = self.resolve(path)?;
        let cpath = CString::new(real.as_os_str().as_bytes())
            .map_err(|_| Error::InvalidArgument(path.into()))?;
        let rc = unsafe { libc::lchown(cpath.as_ptr(), uid, gid) };
        if rc != 0 {
            return Err(Error::from_store(io::Error::last_os_error(), path));
        }
        Ok(())
    }

    fn symlink(&self, target: &str, link: &str) -> Result<()> {
        std::os::unix::fs::symlink(target, self.resolve(link)?)
            .map_err(|e| Error::from_store(e, link))
    }

    fn readlink(&self, path: &str) -> Result<String> {
        let target =
            fs::read_link(self.resolve(path)?).map_err(|e| Error::from_store(e, path))?;
        Ok(target.to_string_lossy().into_owned())
    }

    fn link(&self, from: &str, to: &str) -> Result<()> {
        fs::hard_link(self.resolve(from)?, self.resolve(to)?)
            .map_err(|e| Error::from_store(e, from))
    }
}

struct PosixHandle {
    file: File,
    path: String,
}

impl StoreHandle for PosixHandle {
    fn read_at(&mut self, off: u64, buf: &mut [u8]) -> Result<usize> {
        let mut filled = 0;
        while filled < buf.len() {
            match self.file.read_at(&mut buf[filled..], off + filled as u64) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(Error::from_store(e, &self.path)),
            }
        }
        Ok(filled)
    }

    fn write_at(&mut self, off: u64, data: &[u8]) -> Result<()> {
        self.file
            .write_all_at(data, off)
            .map_err(|e| Error::from_store(e, &self.path))
    }

    fn truncate(&mut self, size: u64) -> Result<()> {
        self.file
            .set_len(size)
            .map_err(|e| Error::from_store(e, &self.path))
    }

    fn sync(&mut self, datasync: bool) -> Result<()> {
        let res = if datasync {
            self.file.sync_data()
        } else {
            self.file.sync_all()
        };
        res.map_err(|e| Error::from_store(e, &self.path))
    }

    fn size(&mut self) -> Result<u64> {
        let meta = self
            .file
            .metadata()
            .map_err(|e| Error::from_store(e, &self.path))?;
        Ok(meta.len())
    }
}
