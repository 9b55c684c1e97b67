//! Scratch directory backing streams that diverged from the archive.
//!
//! The directory is created under the daemon's initial working directory
//! before the FUSE loop starts, and removed recursively when the filesystem
//! is destroyed, whether or not the commit succeeded.

use std::fs::{self, File, OpenOptions};
use std::io;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};

use nix::sys::stat::Mode;
use rand::distributions::Alphanumeric;
use rand::Rng;
use tracing::debug;

use crate::error::{Result, WimError};
use crate::hash::HASH_SIZE;

const STAGING_PREFIX: &str = "wimfs-staging-";
const DIR_SUFFIX_LEN: usize = 10;
const FILE_NAME_LEN: usize = HASH_SIZE;
const CREATE_ATTEMPTS: usize = 16;

fn random_suffix(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

#[derive(Debug)]
pub struct StagingDir {
    path: PathBuf,
}

impl StagingDir {
    /// Creates `wimfs-staging-<random>` under `parent`, mode 0700.
    pub fn create(parent: &Path) -> Result<Self> {
        for _ in 0..CREATE_ATTEMPTS {
            let name = format!("{STAGING_PREFIX}{}", random_suffix(DIR_SUFFIX_LEN));
            let path = parent.join(name);
            match nix::unistd::mkdir(&path, Mode::S_IRWXU) {
                Ok(()) => {
                    debug!(path = %path.display(), "created staging directory");
                    return Ok(Self { path });
                }
                Err(nix::errno::Errno::EEXIST) => continue,
                Err(err) => return Err(WimError::staging_errno(err)),
            }
        }
        Err(WimError::staging(io::Error::from_raw_os_error(
            libc::EEXIST,
        )))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// New private staging file with a hash-width random name, mode 0600,
    /// opened for writing. Retries on name collision.
    pub fn create_file(&self) -> Result<(PathBuf, File)> {
        for _ in 0..CREATE_ATTEMPTS {
            let path = self.path.join(random_suffix(FILE_NAME_LEN));
            match OpenOptions::new()
                .write(true)
                .create_new(true)
                .mode(0o600)
                .open(&path)
            {
                Ok(file) => {
                    debug!(path = %path.display(), "created staging file");
                    return Ok((path, file));
                }
                Err(err) if err.kind() == io::ErrorKind::AlreadyExists => continue,
                Err(err) => return Err(WimError::staging(err)),
            }
        }
        Err(WimError::staging(io::Error::from_raw_os_error(
            libc::EEXIST,
        )))
    }

    /// Deletes the directory and everything staged in it.
    pub fn remove(&self) -> Result<()> {
        fs::remove_dir_all(&self.path).map_err(WimError::staging)
    }
}
