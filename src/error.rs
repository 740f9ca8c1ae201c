use std::io;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Io(#[from] io::Error),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("not a directory: {0}")]
    NotADirectory(String),

    #[error("directory not empty: {0}")]
    DirectoryNotEmpty(String),

    #[error("invalid path: {0}")]
    InvalidPath(String),

    #[error("malformed database: {0}")]
    Format(String),

    #[error("authentication failure (wrong password or corrupted database)")]
    Auth,
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Negative errno as expected at the FUSE boundary.
    pub fn errno(&self) -> i32 {
        match self {
            Error::NotFound(_) => -libc::ENOENT,
            Error::AlreadyExists(_) => -libc::EEXIST,
            Error::NotADirectory(_) => -libc::ENOTDIR,
            Error::DirectoryNotEmpty(_) => -libc::ENOTEMPTY,
            Error::InvalidPath(_) => -libc::EINVAL,
            Error::Io(err) => -err.raw_os_error().unwrap_or(libc::EIO),
            Error::Format(_) | Error::Auth => -libc::EIO,
        }
    }
}
