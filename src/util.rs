use std::fs::File;
use std::os::fd::IntoRawFd;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use fuse3::path::reply::FileAttr;
use fuse3::{FileType, Timestamp};
use nix::errno::Errno as NixErrno;

use crate::dentry::{FILE_ATTRIBUTE_DIRECTORY, FILE_ATTRIBUTE_REPARSE_POINT};
use crate::ops::Stat;

pub fn flags_writable(flags: u32) -> bool {
    flags as i32 & (libc::O_WRONLY | libc::O_RDWR) != 0
}

pub fn retry_eintr<T, F>(mut op: F) -> Result<T, nix::Error>
where
    F: FnMut() -> Result<T, nix::Error>,
{
    loop {
        match op() {
            Err(NixErrno::EINTR) => continue,
            other => return other,
        }
    }
}

/// Explicit close so the error is observable, unlike a plain drop.
pub fn close_file(file: File) -> Result<(), nix::Error> {
    nix::unistd::close(file.into_raw_fd())
}

pub fn file_type_from_attributes(attributes: u32, symlink: bool) -> FileType {
    if attributes & FILE_ATTRIBUTE_DIRECTORY != 0 {
        FileType::Directory
    } else if attributes & FILE_ATTRIBUTE_REPARSE_POINT != 0 && symlink {
        FileType::Symlink
    } else {
        FileType::RegularFile
    }
}

pub fn system_time_from_timestamp(t: Timestamp) -> SystemTime {
    if t.sec < 0 {
        return UNIX_EPOCH;
    }
    UNIX_EPOCH + Duration::new(t.sec as u64, t.nsec)
}

const BLOCK_SIZE: u32 = 4096;

pub fn file_attr_from_stat(stat: &Stat, uid: u32, gid: u32) -> FileAttr {
    let kind = file_type_from_attributes(stat.attributes, stat.is_symlink);
    let mode = match kind {
        FileType::Directory => libc::S_IFDIR | 0o755,
        FileType::Symlink => libc::S_IFLNK | 0o777,
        _ => libc::S_IFREG | 0o644,
    };
    let perm = fuse3::perm_from_mode_and_kind(kind, mode as libc::mode_t);

    FileAttr {
        size: stat.size,
        blocks: stat.size.div_ceil(u64::from(BLOCK_SIZE)),
        atime: stat.times.accessed,
        mtime: stat.times.written,
        ctime: stat.times.changed,
        kind,
        perm,
        nlink: stat.nlink,
        uid,
        gid,
        rdev: 0,
        blksize: BLOCK_SIZE,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dentry::{Timestamps, FILE_ATTRIBUTE_NORMAL};

    #[test]
    fn writable_flag_detection() {
        assert!(flags_writable(libc::O_WRONLY as u32));
        assert!(flags_writable(libc::O_RDWR as u32));
        assert!(!flags_writable(libc::O_RDONLY as u32));
    }

    #[test]
    fn attr_kind_follows_attributes() {
        let stat = Stat {
            attributes: FILE_ATTRIBUTE_NORMAL,
            is_symlink: false,
            size: 5,
            nlink: 1,
            times: Timestamps::now(),
        };
        let attr = file_attr_from_stat(&stat, 0, 0);
        assert_eq!(attr.kind, FileType::RegularFile);
        assert_eq!(attr.size, 5);

        let dir = Stat {
            attributes: FILE_ATTRIBUTE_DIRECTORY,
            ..stat
        };
        assert_eq!(file_attr_from_stat(&dir, 0, 0).kind, FileType::Directory);
    }
}
