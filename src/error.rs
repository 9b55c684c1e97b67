use std::io;
use std::path::PathBuf;

use crate::archive::Compression;

/// Error type for every mount, staging, and unmount operation.
#[derive(Debug, thiserror::Error)]
pub enum WimError {
    #[error("no such file or directory")]
    NotFound,

    #[error("not a directory")]
    NotDirectory,

    #[error("is a directory")]
    IsDirectory,

    #[error("directory not empty")]
    NotEmpty,

    #[error("file exists")]
    Exists,

    #[error("operation not permitted")]
    Permission,

    #[error("filesystem mounted read-only")]
    ReadOnly,

    #[error("bad file handle")]
    BadHandle,

    #[error("too many open handles for one stream")]
    TooManyHandles,

    #[error("offset past end of resource")]
    Overflow,

    #[error("invalid argument")]
    Invalid,

    #[error("name not representable in the archive encoding")]
    BadName,

    #[error("operation not supported")]
    Unsupported,

    #[error("unsupported compression type {0:?}")]
    UnsupportedCompression(Compression),

    #[error("corrupt archive: {0}")]
    Format(String),

    #[error("archive I/O at {path}: {source}")]
    Archive {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("staging I/O: {source}")]
    Staging {
        #[source]
        source: io::Error,
        /// Failure closing the staging file after `source` already struck.
        close: Option<io::Error>,
    },

    #[error("message queue: {0}")]
    Mqueue(#[source] nix::Error),

    #[error("failed to run fusermount: {0}")]
    Fusermount(#[source] io::Error),

    #[error("fusermount exited with status {0}")]
    FusermountStatus(i32),

    #[error("timed out waiting for the {0} message")]
    Timeout(&'static str),

    #[error("unmount daemon reported status {0}")]
    UnmountStatus(u8),
}

impl WimError {
    pub fn staging(source: io::Error) -> Self {
        WimError::Staging {
            source,
            close: None,
        }
    }

    pub fn staging_errno(errno: nix::Error) -> Self {
        Self::staging(io::Error::from_raw_os_error(errno as i32))
    }

    pub fn archive(path: impl Into<PathBuf>, source: io::Error) -> Self {
        WimError::Archive {
            path: path.into(),
            source,
        }
    }

    /// errno reported at the FUSE boundary.
    pub fn errno(&self) -> libc::c_int {
        match self {
            WimError::NotFound => libc::ENOENT,
            WimError::NotDirectory => libc::ENOTDIR,
            WimError::IsDirectory => libc::EISDIR,
            WimError::NotEmpty => libc::ENOTEMPTY,
            WimError::Exists => libc::EEXIST,
            WimError::Permission => libc::EPERM,
            WimError::ReadOnly => libc::EROFS,
            WimError::BadHandle => libc::EBADF,
            WimError::TooManyHandles => libc::EMFILE,
            WimError::Overflow => libc::EOVERFLOW,
            WimError::Invalid => libc::EINVAL,
            WimError::BadName => libc::EILSEQ,
            WimError::Unsupported => libc::EOPNOTSUPP,
            WimError::UnsupportedCompression(_) => libc::EOPNOTSUPP,
            WimError::Staging { source, .. } => {
                source.raw_os_error().unwrap_or(libc::EIO)
            }
            WimError::Archive { source, .. } => {
                source.raw_os_error().unwrap_or(libc::EIO)
            }
            _ => libc::EIO,
        }
    }

    /// Status byte sent back to the unmount driver (0 means success).
    pub fn status_code(&self) -> u8 {
        match self {
            WimError::Staging { .. } => 2,
            WimError::Archive { .. } | WimError::Format(_) => 3,
            WimError::Mqueue(_) => 4,
            WimError::Timeout(_) => 5,
            WimError::UnsupportedCompression(_) => 6,
            _ => 1,
        }
    }
}

impl From<WimError> for fuse3::Errno {
    fn from(err: WimError) -> Self {
        fuse3::Errno::from(err.errno())
    }
}

pub type Result<T> = std::result::Result<T, WimError>;

/// Wraps io errors with the archive path for context.
pub trait IoResultExt<T> {
    fn with_path(self, path: impl Into<PathBuf>) -> Result<T>;
}

impl<T> IoResultExt<T> for io::Result<T> {
    fn with_path(self, path: impl Into<PathBuf>) -> Result<T> {
        self.map_err(|source| WimError::Archive {
            path: path.into(),
            source,
        })
    }
}
