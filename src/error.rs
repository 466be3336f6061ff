use std::io;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("access denied: {0}")]
    AccessDenied(String),

    #[error(transparent)]
    Io(#[from] io::Error),

    #[error("resource busy: {0}")]
    Busy(String),

    #[error("already exists: {0}")]
    Exists(String),

    #[error("directory not empty: {0}")]
    NotEmpty(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("name too long: {0} bytes encoded")]
    NameTooLong(usize),

    #[error("bad password")]
    BadPassword,

    #[error("volume config missing")]
    ConfigMissing,

    #[error("volume config corrupt: {0}")]
    ConfigCorrupt(String),

    #[error("crypto failure: {0}")]
    CryptoFailure(String),

    #[error("unsupported operation: {0}")]
    Unsupported(&'static str),

    #[error("{0}")]
    Generic(String),
}

impl Error {
    /// Maps a backing-store I/O error onto the error taxonomy, tagging it
    /// with the path it occurred on. Everything without a better home stays
    /// an `Io`.
    pub fn from_store(err: io::Error, path: &str) -> Self {
        match err.kind() {
            io::ErrorKind::NotFound => Error::NotFound(path.into()),
            io::ErrorKind::PermissionDenied => Error::AccessDenied(path.into()),
            io::ErrorKind::AlreadyExists => Error::Exists(path.into()),
            io::ErrorKind::InvalidInput => Error::InvalidArgument(path.into()),
            _ => match err.raw_os_error() {
                Some(libc::ENOTEMPTY) => Error::NotEmpty(path.into()),
                Some(libc::EBUSY) => Error::Busy(path.into()),
                Some(libc::ENAMETOOLONG) => Error::NameTooLong(path.len()),
                Some(libc::EISDIR) | Some(libc::ENOTDIR) => {
                    Error::InvalidArgument(path.into())
                }
                _ => Error::Io(err),
            },
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
