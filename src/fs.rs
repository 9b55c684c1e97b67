//! fuse3 front-end: maps the path-based callback surface onto the ops core.
//!
//! Every callback locks the mount context for its whole duration, so requests
//! are serviced one at a time; the model needs no finer locking (and the
//! archive file position makes that mandatory anyway).

use std::ffi::{OsStr, OsString};
use std::num::NonZeroU32;
use std::time::Duration;

use bytes::Bytes;
use fuse3::path::prelude::*;
use fuse3::path::reply::DirectoryEntryPlus;
use fuse3::path::reply::ReplyXAttr;
use fuse3::{FileType, SetAttr};
use parking_lot::Mutex;

use crate::handle_table::NULL_FH;
use crate::ops::MountContext;
use crate::unmount;
use crate::util::{file_attr_from_stat, file_type_from_attributes, system_time_from_timestamp};

const ATTR_TTL: Duration = Duration::from_secs(1);
const MAX_WRITE: u32 = 128 * 1024;

pub fn make_child_path(parent: &OsStr, name: &OsStr) -> OsString {
    if parent == OsStr::new("/") {
        let mut composed = OsString::from("/");
        composed.push(name);
        composed
    } else {
        let mut composed = OsString::from(parent);
        composed.push(OsStr::new("/"));
        composed.push(name);
        composed
    }
}

pub struct WimFs {
    ctx: Mutex<MountContext>,
    uid: u32,
    gid: u32,
}

impl WimFs {
    pub fn new(ctx: MountContext) -> Self {
        Self {
            ctx: Mutex::new(ctx),
            uid: nix::unistd::getuid().as_raw(),
            gid: nix::unistd::getgid().as_raw(),
        }
    }

    fn attr_reply(&self, ctx: &MountContext, path: &OsStr) -> Result<ReplyAttr, fuse3::Errno> {
        let stat = ctx.stat_path(path)?;
        Ok(ReplyAttr {
            ttl: ATTR_TTL,
            attr: file_attr_from_stat(&stat, self.uid, self.gid),
        })
    }

    fn entry_reply(&self, ctx: &MountContext, path: &OsStr) -> Result<ReplyEntry, fuse3::Errno> {
        let stat = ctx.stat_path(path)?;
        Ok(ReplyEntry {
            ttl: ATTR_TTL,
            attr: file_attr_from_stat(&stat, self.uid, self.gid),
        })
    }
}

impl PathFilesystem for WimFs {
    async fn init(&self, _req: Request) -> Result<ReplyInit, fuse3::Errno> {
        let max_write = match NonZeroU32::new(MAX_WRITE) {
            Some(v) => v,
            None => NonZeroU32::MIN,
        };
        Ok(ReplyInit { max_write })
    }

    async fn destroy(&self, _req: Request) {
        let mut ctx = self.ctx.lock();
        unmount::daemon_finish(&mut ctx);
    }

    async fn lookup(
        &self,
        _req: Request,
        parent: &OsStr,
        name: &OsStr,
    ) -> Result<ReplyEntry, fuse3::Errno> {
        let path = make_child_path(parent, name);
        let ctx = self.ctx.lock();
        self.entry_reply(&ctx, &path)
    }

    async fn getattr(
        &self,
        _req: Request,
        path: Option<&OsStr>,
        fh: Option<u64>,
        _flags: u32,
    ) -> Result<ReplyAttr, fuse3::Errno> {
        let ctx = self.ctx.lock();
        if let Some(fh) = fh {
            if fh != NULL_FH {
                if let Ok(stat) = ctx.stat_handle(fh) {
                    return Ok(ReplyAttr {
                        ttl: ATTR_TTL,
                        attr: file_attr_from_stat(&stat, self.uid, self.gid),
                    });
                }
            }
        }
        let path = path.ok_or_else(fuse3::Errno::new_not_exist)?;
        self.attr_reply(&ctx, path)
    }

    async fn setattr(
        &self,
        _req: Request,
        path: Option<&OsStr>,
        fh: Option<u64>,
        set_attr: SetAttr,
    ) -> Result<ReplyAttr, fuse3::Errno> {
        let mut ctx = self.ctx.lock();

        if let Some(size) = set_attr.size {
            let by_handle = match fh {
                Some(fh) if fh != NULL_FH => ctx.ftruncate(fh, size).is_ok(),
                _ => false,
            };
            if !by_handle {
                let path = path.ok_or_else(|| fuse3::Errno::from(libc::EBADF))?;
                ctx.truncate(path, size)?;
            }
        }

        if set_attr.atime.is_some() || set_attr.mtime.is_some() {
            if let Some(path) = path {
                ctx.set_times(
                    path,
                    set_attr.atime.map(system_time_from_timestamp),
                    set_attr.mtime.map(system_time_from_timestamp),
                )?;
            }
        }

        match path {
            Some(path) => self.attr_reply(&ctx, path),
            None => {
                let fh = fh.ok_or_else(fuse3::Errno::new_not_exist)?;
                let stat = ctx.stat_handle(fh)?;
                Ok(ReplyAttr {
                    ttl: ATTR_TTL,
                    attr: file_attr_from_stat(&stat, self.uid, self.gid),
                })
            }
        }
    }

    async fn readlink(&self, _req: Request, path: &OsStr) -> Result<ReplyData, fuse3::Errno> {
        let mut ctx = self.ctx.lock();
        let target = ctx.readlink(path)?;
        let bytes = std::os::unix::ffi::OsStringExt::into_vec(target);
        Ok(Bytes::from(bytes).into())
    }

    async fn symlink(
        &self,
        _req: Request,
        parent: &OsStr,
        name: &OsStr,
        link_path: &OsStr,
    ) -> Result<ReplyEntry, fuse3::Errno> {
        let path = make_child_path(parent, name);
        let mut ctx = self.ctx.lock();
        ctx.symlink(link_path, &path)?;
        self.entry_reply(&ctx, &path)
    }

    async fn mknod(
        &self,
        _req: Request,
        parent: &OsStr,
        name: &OsStr,
        _mode: u32,
        _rdev: u32,
    ) -> Result<ReplyEntry, fuse3::Errno> {
        let path = make_child_path(parent, name);
        let mut ctx = self.ctx.lock();
        ctx.mknod(&path)?;
        self.entry_reply(&ctx, &path)
    }

    async fn mkdir(
        &self,
        _req: Request,
        parent: &OsStr,
        name: &OsStr,
        _mode: u32,
        _umask: u32,
    ) -> Result<ReplyEntry, fuse3::Errno> {
        let path = make_child_path(parent, name);
        let mut ctx = self.ctx.lock();
        ctx.mkdir(&path)?;
        self.entry_reply(&ctx, &path)
    }

    async fn unlink(&self, _req: Request, parent: &OsStr, name: &OsStr) -> Result<(), fuse3::Errno> {
        let path = make_child_path(parent, name);
        let mut ctx = self.ctx.lock();
        ctx.unlink(&path)?;
        Ok(())
    }

    async fn rmdir(&self, _req: Request, parent: &OsStr, name: &OsStr) -> Result<(), fuse3::Errno> {
        let path = make_child_path(parent, name);
        let mut ctx = self.ctx.lock();
        ctx.rmdir(&path)?;
        Ok(())
    }

    async fn rename(
        &self,
        _req: Request,
        origin_parent: &OsStr,
        origin_name: &OsStr,
        parent: &OsStr,
        name: &OsStr,
    ) -> Result<(), fuse3::Errno> {
        let from = make_child_path(origin_parent, origin_name);
        let to = make_child_path(parent, name);
        let mut ctx = self.ctx.lock();
        ctx.rename(&from, &to)?;
        Ok(())
    }

    async fn link(
        &self,
        _req: Request,
        path: &OsStr,
        new_parent: &OsStr,
        new_name: &OsStr,
    ) -> Result<ReplyEntry, fuse3::Errno> {
        let dest = make_child_path(new_parent, new_name);
        let mut ctx = self.ctx.lock();
        ctx.link(path, &dest)?;
        self.entry_reply(&ctx, &dest)
    }

    async fn open(&self, _req: Request, path: &OsStr, flags: u32) -> Result<ReplyOpen, fuse3::Errno> {
        let mut ctx = self.ctx.lock();
        let fh = ctx.open(path, flags)?;
        Ok(ReplyOpen { fh, flags: 0 })
    }

    async fn read(
        &self,
        _req: Request,
        _path: Option<&OsStr>,
        fh: u64,
        offset: u64,
        size: u32,
    ) -> Result<ReplyData, fuse3::Errno> {
        let mut ctx = self.ctx.lock();
        let data = ctx.read(fh, offset, size as usize)?;
        Ok(Bytes::from(data).into())
    }

    async fn write(
        &self,
        _req: Request,
        _path: Option<&OsStr>,
        fh: u64,
        offset: u64,
        data: &[u8],
        _write_flags: u32,
        _flags: u32,
    ) -> Result<ReplyWrite, fuse3::Errno> {
        let mut ctx = self.ctx.lock();
        let written = ctx.write(fh, offset, data)?;
        Ok(ReplyWrite {
            written: written as u32,
        })
    }

    async fn release(
        &self,
        _req: Request,
        _path: Option<&OsStr>,
        fh: u64,
        _flags: u32,
        _lock_owner: u64,
        _flush: bool,
    ) -> Result<(), fuse3::Errno> {
        let mut ctx = self.ctx.lock();
        ctx.release(fh)?;
        Ok(())
    }

    async fn access(&self, _req: Request, _path: &OsStr, _mask: u32) -> Result<(), fuse3::Errno> {
        // permissions are not enforced on the mounted image
        Ok(())
    }

    async fn opendir(
        &self,
        _req: Request,
        path: &OsStr,
        flags: u32,
    ) -> Result<ReplyOpen, fuse3::Errno> {
        let mut ctx = self.ctx.lock();
        let fh = ctx.opendir(path)?;
        Ok(ReplyOpen { fh, flags })
    }

    type DirEntryStream<'a>
        = futures_util::stream::Iter<std::vec::IntoIter<fuse3::Result<DirectoryEntry>>>
    where
        Self: 'a;
    type DirEntryPlusStream<'a>
        = futures_util::stream::Iter<std::vec::IntoIter<fuse3::Result<DirectoryEntryPlus>>>
    where
        Self: 'a;

    async fn readdir<'a>(
        &'a self,
        _req: Request,
        _path: &'a OsStr,
        fh: u64,
        offset: i64,
    ) -> Result<ReplyDirectory<Self::DirEntryStream<'a>>, fuse3::Errno> {
        let ctx = self.ctx.lock();
        let children = ctx.readdir(fh)?;
        let mut entries: Vec<fuse3::Result<DirectoryEntry>> =
            Vec::with_capacity(children.len() + 2);

        let mut idx: i64 = 0;
        entries.push(Ok(DirectoryEntry {
            kind: FileType::Directory,
            name: OsString::from("."),
            offset: idx + 1,
        }));
        idx += 1;
        entries.push(Ok(DirectoryEntry {
            kind: FileType::Directory,
            name: OsString::from(".."),
            offset: idx + 1,
        }));
        idx += 1;

        for child in children {
            idx += 1;
            entries.push(Ok(DirectoryEntry {
                kind: file_type_from_attributes(child.attributes, child.is_symlink),
                name: child.name,
                offset: idx,
            }));
        }

        let skip = offset.max(0) as usize;
        let entries: Vec<_> = entries.into_iter().skip(skip).collect();
        Ok(ReplyDirectory {
            entries: futures_util::stream::iter(entries),
        })
    }

    async fn readdirplus<'a>(
        &'a self,
        _req: Request,
        parent: &'a OsStr,
        fh: u64,
        offset: u64,
        _lock_owner: u64,
    ) -> Result<ReplyDirectoryPlus<Self::DirEntryPlusStream<'a>>, fuse3::Errno> {
        let ctx = self.ctx.lock();
        let children = ctx.readdir(fh)?;
        let mut entries: Vec<fuse3::Result<DirectoryEntryPlus>> =
            Vec::with_capacity(children.len() + 2);

        let dir_stat = ctx.stat_path(parent)?;
        let dir_attr = file_attr_from_stat(&dir_stat, self.uid, self.gid);

        let mut idx: i64 = 0;
        entries.push(Ok(DirectoryEntryPlus {
            kind: FileType::Directory,
            name: OsString::from("."),
            offset: idx + 1,
            attr: dir_attr,
            entry_ttl: ATTR_TTL,
            attr_ttl: ATTR_TTL,
        }));
        idx += 1;
        entries.push(Ok(DirectoryEntryPlus {
            kind: FileType::Directory,
            name: OsString::from(".."),
            offset: idx + 1,
            attr: dir_attr,
            entry_ttl: ATTR_TTL,
            attr_ttl: ATTR_TTL,
        }));
        idx += 1;

        for child in children {
            idx += 1;
            let child_path = make_child_path(parent, &child.name);
            let attr = match ctx.stat_path(&child_path) {
                Ok(stat) => file_attr_from_stat(&stat, self.uid, self.gid),
                Err(err) => {
                    entries.push(Err(err.into()));
                    continue;
                }
            };
            entries.push(Ok(DirectoryEntryPlus {
                kind: attr.kind,
                name: child.name,
                offset: idx,
                attr,
                entry_ttl: ATTR_TTL,
                attr_ttl: ATTR_TTL,
            }));
        }

        let skip = offset as usize;
        let entries: Vec<_> = entries.into_iter().skip(skip).collect();
        Ok(ReplyDirectoryPlus {
            entries: futures_util::stream::iter(entries),
        })
    }

    async fn releasedir(
        &self,
        _req: Request,
        _path: &OsStr,
        fh: u64,
        _flags: u32,
    ) -> Result<(), fuse3::Errno> {
        let mut ctx = self.ctx.lock();
        ctx.releasedir(fh)?;
        Ok(())
    }

    async fn statfs(&self, _req: Request, _path: &OsStr) -> Result<ReplyStatFs, fuse3::Errno> {
        let ctx = self.ctx.lock();
        let bsize = 4096u32;
        let blocks = ctx.image.total_bytes.div_ceil(u64::from(bsize));
        Ok(ReplyStatFs {
            blocks,
            bfree: 0,
            bavail: 0,
            files: ctx.image.file_count + ctx.image.dir_count,
            ffree: 0,
            bsize,
            namelen: 255,
            frsize: bsize,
        })
    }

    async fn getxattr(
        &self,
        _req: Request,
        path: &OsStr,
        name: &OsStr,
        size: u32,
    ) -> Result<ReplyXAttr, fuse3::Errno> {
        let mut ctx = self.ctx.lock();
        let data = ctx.read_stream_xattr(path, name)?;
        if size == 0 {
            return Ok(ReplyXAttr::Size(data.len() as u32));
        }
        if data.len() > size as usize {
            return Err(fuse3::Errno::from(libc::ERANGE));
        }
        Ok(ReplyXAttr::Data(Bytes::from(data)))
    }

    async fn listxattr(
        &self,
        _req: Request,
        path: &OsStr,
        size: u32,
    ) -> Result<ReplyXAttr, fuse3::Errno> {
        let ctx = self.ctx.lock();
        let names = ctx.list_streams(path)?;
        let mut list = Vec::new();
        for name in names {
            list.extend_from_slice(std::os::unix::ffi::OsStrExt::as_bytes(name.as_os_str()));
            list.push(0);
        }
        if size == 0 {
            return Ok(ReplyXAttr::Size(list.len() as u32));
        }
        if list.len() > size as usize {
            return Err(fuse3::Errno::from(libc::ERANGE));
        }
        Ok(ReplyXAttr::Data(Bytes::from(list)))
    }
}
