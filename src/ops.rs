//! Core mount operations over the dentry tree, catalog, and staging store.
//!
//! Everything the FUSE front-end does lands here, on a single `MountContext`
//! owning all mutable state for one mounted image. The front-end is a thin
//! adapter; these operations are what the tests drive directly.

use std::ffi::{OsStr, OsString};
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::Path;
use std::time::SystemTime;

use nix::sys::uio::{pread, pwrite};
use tracing::{debug, warn};

use crate::archive::{ResourceSpec, WimArchive};
use crate::catalog::{Catalog, EntryId, FdId, LookupEntry, StreamBacking};
use crate::commit;
use crate::dentry::{
    AdsEntry, DentryId, DentryTree, LinkRole, StreamSel, Timestamps, FILE_ATTRIBUTE_NORMAL,
    FILE_ATTRIBUTE_REPARSE_POINT,
};
use crate::error::{Result, WimError};
use crate::handle_table::{Handle, HandleTable, StreamFd, NULL_FH};
use crate::hash::StreamHash;
use crate::names;
use crate::reparse::{self, IO_REPARSE_TAG_SYMLINK};
use crate::staging::StagingDir;
use crate::util::{close_file, flags_writable, retry_eintr};

const COPY_CHUNK: usize = 64 * 1024;

/// How alternate data streams are addressed on the mount.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum StreamInterface {
    /// ADS are not exposed at all.
    None,
    /// ADS appear as `user.<stream>` extended attributes.
    #[default]
    Xattr,
    /// ADS are addressed as `path:streamname` paths.
    Windows,
}

#[derive(Clone, Debug)]
pub struct MountConfig {
    pub read_write: bool,
    pub stream_interface: StreamInterface,
    pub mountpoint: std::path::PathBuf,
    pub image_index: usize,
}

/// Attribute snapshot handed to the FUSE boundary.
#[derive(Clone, Copy, Debug)]
pub struct Stat {
    pub attributes: u32,
    pub is_symlink: bool,
    pub size: u64,
    pub nlink: u32,
    pub times: Timestamps,
}

#[derive(Clone, Debug)]
pub struct DirEntryInfo {
    pub name: OsString,
    pub attributes: u32,
    pub is_symlink: bool,
}

pub struct MountContext {
    pub archive: WimArchive,
    pub tree: DentryTree,
    pub catalog: Catalog,
    pub handles: HandleTable,
    pub staging: Option<StagingDir>,
    pub image: crate::archive::ImageInfo,
    pub config: MountConfig,
}

impl MountContext {
    /// Loads the selected image and seeds the catalog with one lookup entry
    /// per unique content hash referenced by the tree.
    pub fn new(mut archive: WimArchive, config: MountConfig) -> Result<Self> {
        let loaded = archive.select_image(config.image_index)?;
        if config.read_write {
            archive.mark_modified(config.image_index)?;
        }
        let tree = loaded.tree;

        let mut catalog = Catalog::new();
        for (_, dentry) in tree.iter() {
            for (_, hash) in dentry.effective_streams() {
                if hash.is_zero() {
                    continue;
                }
                match catalog.lookup(hash) {
                    Some(id) => {
                        if let Some(entry) = catalog.get_mut(id) {
                            entry.refcount += 1;
                        }
                    }
                    None => {
                        let spec = archive.resource_spec(hash).ok_or_else(|| {
                            WimError::Format(format!("no resource for stream {hash}"))
                        })?;
                        let mut entry = LookupEntry::new_archive(hash, spec.original_size, spec);
                        entry.refcount = 1;
                        catalog.insert(entry);
                    }
                }
            }
        }

        let staging = if config.read_write {
            let cwd = std::env::current_dir().map_err(WimError::staging)?;
            Some(StagingDir::create(&cwd)?)
        } else {
            None
        };

        Ok(Self {
            archive,
            tree,
            catalog,
            handles: HandleTable::new(),
            staging,
            image: loaded.info,
            config,
        })
    }

    fn ads_ok(&self) -> bool {
        self.config.stream_interface == StreamInterface::Windows
    }

    fn require_rw(&self) -> Result<()> {
        if self.config.read_write {
            Ok(())
        } else {
            Err(WimError::ReadOnly)
        }
    }

    fn resolve(&self, path: &OsStr) -> Result<(DentryId, StreamSel)> {
        self.tree.resolve(path, self.ads_ok())
    }

    // ---- attributes -----------------------------------------------------

    fn stat_dentry(&self, did: DentryId) -> Result<Stat> {
        let dentry = self.tree.get(did)?;
        let size = if dentry.is_directory() {
            0
        } else {
            self.stream_size(dentry.hash)
        };
        let nlink = if dentry.is_directory() {
            2
        } else {
            self.tree.group_size(dentry.link_group).max(1)
        };
        Ok(Stat {
            attributes: dentry.attributes,
            is_symlink: dentry.is_symlink(),
            size,
            nlink,
            times: dentry.times,
        })
    }

    fn stream_size(&self, hash: StreamHash) -> u64 {
        self.catalog
            .lookup(hash)
            .and_then(|id| self.catalog.get(id))
            .map(|entry| entry.original_size)
            .unwrap_or(0)
    }

    pub fn stat_path(&self, path: &OsStr) -> Result<Stat> {
        let (did, sel) = self.resolve(path)?;
        match sel {
            StreamSel::Primary => self.stat_dentry(did),
            StreamSel::Ads(i) => {
                let dentry = self.tree.get(did)?;
                Ok(Stat {
                    attributes: FILE_ATTRIBUTE_NORMAL,
                    is_symlink: false,
                    size: self.stream_size(dentry.ads[i].hash),
                    nlink: 1,
                    times: dentry.times,
                })
            }
        }
    }

    pub fn stat_handle(&self, fh: u64) -> Result<Stat> {
        let fd = self.handles.stream(fh).ok_or(WimError::BadHandle)?;
        match fd.dentry {
            Some(did) => self.stat_dentry(did),
            None => {
                // unlinked while open; only the stream itself remains
                let entry = self.catalog.get(fd.entry).ok_or(WimError::BadHandle)?;
                Ok(Stat {
                    attributes: FILE_ATTRIBUTE_NORMAL,
                    is_symlink: false,
                    size: entry.original_size,
                    nlink: 0,
                    times: Timestamps::now(),
                })
            }
        }
    }

    pub fn set_times(
        &mut self,
        path: &OsStr,
        atime: Option<SystemTime>,
        mtime: Option<SystemTime>,
    ) -> Result<()> {
        let did = self.tree.resolve_dentry(path)?;
        let dentry = self.tree.get_mut(did)?;
        if let Some(t) = atime {
            dentry.times.accessed = t;
        }
        if let Some(t) = mtime {
            dentry.times.written = t;
        }
        Ok(())
    }

    // ---- staging divergence ---------------------------------------------

    fn copy_prefix(
        &mut self,
        spec: &ResourceSpec,
        len: u64,
        file: &mut fs::File,
    ) -> Result<()> {
        let mut skip = 0u64;
        let mut buf = vec![0u8; COPY_CHUNK];
        while skip < len {
            let want = COPY_CHUNK.min((len - skip) as usize);
            let n = self.archive.read_resource(spec, skip, &mut buf[..want])?;
            if n == 0 {
                break;
            }
            file.write_all(&buf[..n]).map_err(WimError::staging)?;
            skip += n as u64;
        }
        Ok(())
    }

    /// Materializes a stream into the staging directory so it can be mutated
    /// without disturbing other consumers of the same content.
    ///
    /// `old` is the archive-backed entry being diverged, or `None` for a
    /// brand-new empty stream. `size` is how many leading bytes to keep.
    /// Handles whose link-group snapshot matches the diverging dentry are
    /// transferred onto the new entry; the rest stay behind.
    fn diverge(
        &mut self,
        did: DentryId,
        sel: StreamSel,
        old: Option<EntryId>,
        size: u64,
    ) -> Result<EntryId> {
        let staging = self.staging.as_ref().ok_or(WimError::ReadOnly)?;
        let (staging_path, mut file) = staging.create_file()?;

        let copy_result = match old {
            Some(old_id) => {
                let spec = self
                    .catalog
                    .get(old_id)
                    .and_then(|e| e.backing.resource().cloned())
                    .ok_or(WimError::Invalid);
                match spec {
                    Ok(spec) => {
                        let copy_len = size.min(spec.original_size);
                        let mut result = self.copy_prefix(&spec, copy_len, &mut file);
                        if result.is_ok() && size > copy_len {
                            result = file.set_len(size).map_err(WimError::staging);
                        }
                        result
                    }
                    Err(err) => Err(err),
                }
            }
            None => Ok(()),
        };
        let close_result = close_file(file);

        match (copy_result, close_result) {
            (Ok(()), Ok(())) => {}
            (Err(err), close) => {
                let _ = fs::remove_file(&staging_path);
                let err = match (err, close) {
                    (WimError::Staging { source, .. }, Err(errno)) => WimError::Staging {
                        source,
                        close: Some(io::Error::from_raw_os_error(errno as i32)),
                    },
                    (err, Err(errno)) => {
                        warn!(?errno, "failed to close staging file after copy error");
                        err
                    }
                    (err, Ok(())) => err,
                };
                return Err(err);
            }
            (Ok(()), Err(errno)) => {
                let _ = fs::remove_file(&staging_path);
                return Err(WimError::staging_errno(errno));
            }
        }

        let (group, stream_name) = {
            let dentry = self.tree.get(did)?;
            let name = match sel {
                StreamSel::Primary => None,
                StreamSel::Ads(i) => Some(dentry.ads[i].name.clone()),
            };
            (dentry.link_group, name)
        };

        let (new_id, link_refs, old_hash) = match old {
            Some(old_id) => {
                let (old_hash, old_refcount) = {
                    let entry = self.catalog.get(old_id).ok_or(WimError::BadHandle)?;
                    (entry.hash, entry.refcount)
                };
                let link_refs =
                    self.tree
                        .link_group_refs(group, stream_name.as_deref(), old_hash);
                if link_refs == old_refcount {
                    // the whole refcount belongs to this link group: keep the
                    // entry and its fd table, swap the backing
                    debug!(%old_hash, "re-using lookup entry for divergence");
                    self.catalog.unindex(old_id);
                    let entry = self.catalog.get_mut(old_id).ok_or(WimError::BadHandle)?;
                    entry.backing = StreamBacking::Staging(staging_path);
                    (old_id, link_refs, old_hash)
                } else {
                    assert!(
                        old_refcount > link_refs,
                        "entry refcount {old_refcount} below link group share {link_refs}"
                    );
                    debug!(
                        %old_hash,
                        link_refs, old_refcount, "splitting lookup entry for diverging link group"
                    );
                    let transfers: Vec<(u16, FdId)> = {
                        let entry = self.catalog.get(old_id).ok_or(WimError::BadHandle)?;
                        let handles = &self.handles;
                        entry
                            .open_slots()
                            .filter(|(_, fd)| {
                                handles
                                    .stream(*fd)
                                    .map(|h| h.link_group == group)
                                    .unwrap_or(false)
                            })
                            .collect()
                    };

                    let mut new_entry =
                        LookupEntry::new_staged(StreamHash::ZERO, size, staging_path);
                    let mut new_slots = Vec::with_capacity(transfers.len());
                    for (_, fd) in &transfers {
                        new_slots.push((*fd, new_entry.push_transferred(*fd)));
                    }
                    let new_id = self.catalog.insert_detached(new_entry);

                    for (old_slot, fd) in &transfers {
                        if let Some(entry) = self.catalog.get_mut(old_id) {
                            entry.clear_slot(*old_slot, *fd);
                        }
                    }
                    for (fd, slot) in new_slots {
                        if let Some(handle) = self.handles.stream_mut(fd) {
                            handle.entry = new_id;
                            handle.slot = slot;
                        }
                    }
                    if let Some(entry) = self.catalog.get_mut(old_id) {
                        entry.refcount -= link_refs;
                    }
                    (new_id, link_refs, old_hash)
                }
            }
            None => {
                let link_refs = self
                    .tree
                    .link_group_refs(group, stream_name.as_deref(), StreamHash::ZERO)
                    .max(1);
                let new_id = self.catalog.insert_detached(LookupEntry::new_staged(
                    StreamHash::ZERO,
                    size,
                    staging_path,
                ));
                (new_id, link_refs, StreamHash::ZERO)
            }
        };

        let placeholder = self.catalog.unique_placeholder();
        if let Some(entry) = self.catalog.get_mut(new_id) {
            entry.original_size = size;
            entry.refcount = link_refs;
        }
        self.catalog.index(new_id, placeholder);

        // every member of the diverging group follows the stream to its new
        // identity; other groups keep resolving to the old entry
        for member in self.tree.group_members(group) {
            let dentry = self.tree.get_mut(member)?;
            match &stream_name {
                None => {
                    if dentry.hash == old_hash {
                        dentry.hash = placeholder;
                    }
                }
                Some(name) => {
                    if let Some(i) = dentry.ads_index(name) {
                        if dentry.ads[i].hash == old_hash {
                            dentry.ads[i].hash = placeholder;
                        }
                    }
                }
            }
        }

        Ok(new_id)
    }

    // ---- open / io / close ----------------------------------------------

    pub fn open(&mut self, path: &OsStr, flags: u32) -> Result<u64> {
        let writable = flags_writable(flags);
        if writable {
            self.require_rw()?;
        }
        let (did, sel) = self.resolve(path)?;
        if self.tree.get(did)?.is_directory() {
            return Err(WimError::IsDirectory);
        }

        let hash = self.tree.get(did)?.stream_hash(sel);
        let mut entry_id = match self.catalog.lookup(hash) {
            Some(id) => id,
            None => {
                // empty stream: fine without an entry on a read-only mount,
                // otherwise materialize one so an fd table can exist
                if !self.config.read_write {
                    return Ok(NULL_FH);
                }
                self.diverge(did, sel, None, 0)?
            }
        };

        let (is_staged, original_size) = {
            let entry = self.catalog.get(entry_id).ok_or(WimError::BadHandle)?;
            (entry.backing.is_staging(), entry.original_size)
        };
        if writable && !is_staged {
            entry_id = self.diverge(did, sel, Some(entry_id), original_size)?;
        }

        let staging_file = {
            let entry = self.catalog.get(entry_id).ok_or(WimError::BadHandle)?;
            match entry.backing.staging_path() {
                Some(path) => Some(
                    OpenOptions::new()
                        .read(true)
                        .write(writable)
                        .open(path)
                        .map_err(WimError::staging)?,
                ),
                None => None,
            }
        };

        let link_group = self.tree.get(did)?.link_group;
        let fh = self.handles.insert_stream(StreamFd {
            entry: entry_id,
            slot: 0,
            dentry: Some(did),
            link_group,
            staging: staging_file,
            writable,
        });
        let slot = {
            let entry = self.catalog.get_mut(entry_id).ok_or(WimError::BadHandle)?;
            entry.alloc_slot(fh)
        };
        match slot {
            Ok(slot) => {
                if let Some(fd) = self.handles.stream_mut(fh) {
                    fd.slot = slot;
                }
                Ok(fh)
            }
            Err(err) => {
                self.handles.remove(fh);
                Err(err)
            }
        }
    }

    pub fn read(&mut self, fh: u64, offset: u64, size: usize) -> Result<Vec<u8>> {
        if fh == NULL_FH {
            return Ok(Vec::new());
        }
        let fd = self.handles.stream(fh).ok_or(WimError::BadHandle)?;
        let (backing, original_size) = {
            let entry = self.catalog.get(fd.entry).ok_or(WimError::BadHandle)?;
            (entry.backing.clone(), entry.original_size)
        };
        match backing {
            StreamBacking::Staging(path) => {
                // a handle opened before this stream diverged has no native
                // descriptor yet; acquire one now
                if fd.staging.is_none() {
                    let file = OpenOptions::new()
                        .read(true)
                        .open(&path)
                        .map_err(WimError::staging)?;
                    if let Some(fd) = self.handles.stream_mut(fh) {
                        fd.staging = Some(file);
                    }
                }
                let fd = self.handles.stream(fh).ok_or(WimError::BadHandle)?;
                let file = fd.staging.as_ref().ok_or(WimError::BadHandle)?;
                let mut buf = vec![0u8; size];
                let n = retry_eintr(|| pread(file, &mut buf, offset as i64))
                    .map_err(WimError::staging_errno)?;
                buf.truncate(n);
                Ok(buf)
            }
            StreamBacking::Archive(spec) => {
                if offset > original_size {
                    return Err(WimError::Overflow);
                }
                let len = size.min((original_size - offset) as usize);
                let mut buf = vec![0u8; len];
                let n = self.archive.read_resource(&spec, offset, &mut buf)?;
                buf.truncate(n);
                Ok(buf)
            }
        }
    }

    /// Writes always land on a staged stream: opening for write diverged it.
    pub fn write(&mut self, fh: u64, offset: u64, data: &[u8]) -> Result<usize> {
        let fd = self.handles.stream(fh).ok_or(WimError::BadHandle)?;
        let file = fd.staging.as_ref().ok_or(WimError::BadHandle)?;
        let n =
            retry_eintr(|| pwrite(file, data, offset as i64)).map_err(WimError::staging_errno)?;
        let entry_id = fd.entry;
        if let Some(entry) = self.catalog.get_mut(entry_id) {
            entry.original_size = entry.original_size.max(offset + n as u64);
        }
        Ok(n)
    }

    pub fn release(&mut self, fh: u64) -> Result<()> {
        if fh == NULL_FH {
            return Ok(());
        }
        if self.handles.stream(fh).is_none() {
            return Err(WimError::BadHandle);
        }
        let Some(Handle::Stream(fd)) = self.handles.remove(fh) else {
            return Err(WimError::BadHandle);
        };

        if fd.writable {
            if let Some(did) = fd.dentry {
                if let Ok(dentry) = self.tree.get_mut(did) {
                    dentry.times.touch_accessed_written();
                }
            }
        }

        let mut close_err = None;
        if let Some(file) = fd.staging {
            if let Err(errno) = close_file(file) {
                close_err = Some(errno);
            }
        }

        if let Some(entry) = self.catalog.get_mut(fd.entry) {
            entry.clear_slot(fd.slot, fh);
            if entry.refcount == 0 && entry.opened_fds() == 0 {
                self.destroy_entry(fd.entry);
            }
        }

        match close_err {
            Some(errno) => Err(WimError::staging_errno(errno)),
            None => Ok(()),
        }
    }

    fn destroy_entry(&mut self, id: EntryId) {
        if let Some(entry) = self.catalog.remove(id) {
            if let Some(path) = entry.backing.staging_path() {
                if let Err(err) = fs::remove_file(path) {
                    if err.kind() != io::ErrorKind::NotFound {
                        debug!(path = %path.display(), %err, "failed to remove staging file");
                    }
                }
            }
        }
    }

    // ---- directories ----------------------------------------------------

    pub fn opendir(&mut self, path: &OsStr) -> Result<u64> {
        let did = self.tree.resolve_dentry(path)?;
        if !self.tree.get(did)?.is_directory() {
            return Err(WimError::NotDirectory);
        }
        self.tree.get_mut(did)?.open_count += 1;
        Ok(self.handles.insert_dir(did))
    }

    pub fn readdir(&self, fh: u64) -> Result<Vec<DirEntryInfo>> {
        let did = self.handles.dir(fh).ok_or(WimError::BadHandle)?;
        let dentry = self.tree.get(did)?;
        let mut entries = Vec::with_capacity(dentry.children.len());
        for &child in &dentry.children {
            let c = self.tree.get(child)?;
            entries.push(DirEntryInfo {
                name: c.name.clone(),
                attributes: c.attributes,
                is_symlink: c.is_symlink(),
            });
        }
        Ok(entries)
    }

    pub fn releasedir(&mut self, fh: u64) -> Result<()> {
        let did = match self.handles.remove(fh) {
            Some(Handle::Dir(did)) => did,
            _ => return Err(WimError::BadHandle),
        };
        let (open_count, orphaned) = {
            let dentry = self.tree.get_mut(did)?;
            dentry.open_count = dentry.open_count.saturating_sub(1);
            (dentry.open_count, dentry.parent.is_none())
        };
        if open_count == 0 && orphaned && did != self.tree.root() {
            self.tree.remove(did);
        }
        Ok(())
    }

    pub fn mkdir(&mut self, path: &OsStr) -> Result<()> {
        self.require_rw()?;
        let (parent, basename) = self.tree.parent_of(path)?;
        if self.tree.child_by_name(parent, &basename).is_some() {
            return Err(WimError::Exists);
        }
        let id = self
            .tree
            .new_node(&basename, crate::dentry::FILE_ATTRIBUTE_DIRECTORY)?;
        self.tree.link_child(parent, id)?;
        Ok(())
    }

    /// Creates an empty regular file, or a new ADS on an existing file when
    /// the final component carries a `:stream` qualifier in windows mode.
    pub fn mknod(&mut self, path: &OsStr) -> Result<()> {
        self.require_rw()?;
        let (parent, basename) = self.tree.parent_of(path)?;

        if self.ads_ok() {
            if let Some((file, stream)) = names::split_stream(&basename) {
                let did = self
                    .tree
                    .child_by_name(parent, &file)
                    .ok_or(WimError::NotFound)?;
                let dentry = self.tree.get_mut(did)?;
                if !dentry.is_regular_file() {
                    return Err(WimError::NotFound);
                }
                if dentry.ads_index(&stream).is_some() {
                    return Err(WimError::Exists);
                }
                let (name, name_utf16) = names::name_pair(&stream)?;
                dentry.ads.push(AdsEntry {
                    name,
                    name_utf16,
                    hash: StreamHash::ZERO,
                });
                return Ok(());
            }
        }

        if self.tree.child_by_name(parent, &basename).is_some() {
            return Err(WimError::Exists);
        }
        let id = self.tree.new_node(&basename, FILE_ATTRIBUTE_NORMAL)?;
        self.tree.link_child(parent, id)?;
        Ok(())
    }

    // ---- unlink / rename / link -----------------------------------------

    fn decrement_stream(&mut self, did: DentryId, hash: StreamHash) {
        let Some(id) = self.catalog.lookup(hash) else {
            return;
        };
        let open_fds: Vec<FdId> = match self.catalog.get_mut(id) {
            Some(entry) => {
                entry.refcount = entry.refcount.saturating_sub(1);
                entry.open_slots().map(|(_, fd)| fd).collect()
            }
            None => return,
        };
        // any handle still pointing at the vanishing dentry keeps working,
        // but loses its dentry back-pointer
        for fd_id in open_fds {
            if let Some(fd) = self.handles.stream_mut(fd_id) {
                if fd.dentry == Some(did) {
                    fd.dentry = None;
                }
            }
        }
        let destroy = self
            .catalog
            .get(id)
            .map(|e| e.refcount == 0 && e.opened_fds() == 0)
            .unwrap_or(false);
        if destroy {
            self.destroy_entry(id);
        }
    }

    /// Removes a dentry and drops one reference on each effective stream.
    fn remove_dentry(&mut self, did: DentryId) -> Result<()> {
        let streams: Vec<StreamHash> = self
            .tree
            .get(did)?
            .effective_streams()
            .into_iter()
            .map(|(_, hash)| hash)
            .collect();
        for hash in streams {
            self.decrement_stream(did, hash);
        }
        self.tree.unlink_child(did)?;
        if self.tree.get(did)?.open_count == 0 {
            self.tree.remove(did);
        }
        Ok(())
    }

    pub fn unlink(&mut self, path: &OsStr) -> Result<()> {
        self.require_rw()?;
        let (did, sel) = self.resolve(path)?;
        match sel {
            StreamSel::Ads(i) => {
                let hash = {
                    let dentry = self.tree.get_mut(did)?;
                    dentry.ads.remove(i).hash
                };
                self.decrement_stream(did, hash);
                Ok(())
            }
            StreamSel::Primary => {
                if self.tree.get(did)?.is_directory() {
                    return Err(WimError::IsDirectory);
                }
                self.remove_dentry(did)
            }
        }
    }

    pub fn rmdir(&mut self, path: &OsStr) -> Result<()> {
        self.require_rw()?;
        let did = self.tree.resolve_dentry(path)?;
        if did == self.tree.root() {
            return Err(WimError::Invalid);
        }
        if !self.tree.is_empty_dir(did)? {
            return Err(WimError::NotEmpty);
        }
        self.tree.unlink_child(did)?;
        if self.tree.get(did)?.open_count == 0 {
            self.tree.remove(did);
        }
        Ok(())
    }

    /// Only primary streams can be renamed; an ADS-qualified path is
    /// rejected outright.
    pub fn rename(&mut self, from: &OsStr, to: &OsStr) -> Result<()> {
        self.require_rw()?;
        if self.ads_ok() {
            for path in [from, to] {
                if let Some(base) = Path::new(path).file_name() {
                    if names::split_stream(base).is_some() {
                        return Err(WimError::Invalid);
                    }
                }
            }
        }

        let src = self.tree.resolve_dentry(from)?;
        if src == self.tree.root() {
            return Err(WimError::Invalid);
        }
        let dst = match self.tree.resolve_dentry(to) {
            Ok(id) => Some(id),
            Err(WimError::NotFound) => None,
            Err(err) => return Err(err),
        };

        let (dst_parent, new_name) = match dst {
            Some(dst_id) => {
                if dst_id == src {
                    return Ok(());
                }
                let src_is_dir = self.tree.get(src)?.is_directory();
                let dst_is_dir = self.tree.get(dst_id)?.is_directory();
                if !src_is_dir && dst_is_dir {
                    return Err(WimError::IsDirectory);
                }
                if src_is_dir {
                    if !dst_is_dir {
                        return Err(WimError::NotDirectory);
                    }
                    if !self.tree.is_empty_dir(dst_id)? {
                        return Err(WimError::NotEmpty);
                    }
                }
                let parent = self.tree.get(dst_id)?.parent.ok_or(WimError::Invalid)?;
                let name = self.tree.get(dst_id)?.name.clone();
                if dst_is_dir {
                    self.tree.unlink_child(dst_id)?;
                    if self.tree.get(dst_id)?.open_count == 0 {
                        self.tree.remove(dst_id);
                    }
                } else {
                    self.remove_dentry(dst_id)?;
                }
                (parent, name)
            }
            None => self.tree.parent_of(to)?,
        };

        self.tree.unlink_child(src)?;
        let (name, name_utf16) = names::name_pair(&new_name)?;
        {
            let dentry = self.tree.get_mut(src)?;
            dentry.name = name;
            dentry.name_utf16 = name_utf16;
        }
        self.tree.link_child(dst_parent, src)?;
        Ok(())
    }

    /// Hard link: clone the source dentry, sharing every stream hash. The
    /// clone is a slave so the group master stays stable.
    pub fn link(&mut self, existing: &OsStr, new_path: &OsStr) -> Result<()> {
        self.require_rw()?;
        let src = self.tree.resolve_dentry(existing)?;
        if !self.tree.get(src)?.is_regular_file() {
            return Err(WimError::Permission);
        }
        let (parent, basename) = self.tree.parent_of(new_path)?;
        if self.tree.child_by_name(parent, &basename).is_some() {
            return Err(WimError::Exists);
        }

        let source = self.tree.get(src)?.clone();
        let id = self.tree.new_node(&basename, source.attributes)?;
        {
            let clone = self.tree.get_mut(id)?;
            clone.reparse_tag = source.reparse_tag;
            clone.times = source.times;
            clone.hash = source.hash;
            clone.ads = source.ads.clone();
            clone.link_role = LinkRole::Slave;
        }
        self.tree.link_child(parent, id)?;

        let streams = self.tree.get(id)?.effective_streams();
        for (_, hash) in streams {
            if let Some(entry_id) = self.catalog.lookup(hash) {
                if let Some(entry) = self.catalog.get_mut(entry_id) {
                    entry.refcount += 1;
                }
            }
        }
        Ok(())
    }

    // ---- symlinks -------------------------------------------------------

    pub fn symlink(&mut self, target: &OsStr, link_path: &OsStr) -> Result<()> {
        self.require_rw()?;
        let (parent, basename) = self.tree.parent_of(link_path)?;
        if self.tree.child_by_name(parent, &basename).is_some() {
            return Err(WimError::Exists);
        }

        let blob = reparse::encode(target)?;
        let placeholder = self.stage_bytes(&blob)?;

        let id = self
            .tree
            .new_node(&basename, FILE_ATTRIBUTE_REPARSE_POINT)?;
        {
            let dentry = self.tree.get_mut(id)?;
            dentry.reparse_tag = IO_REPARSE_TAG_SYMLINK;
            dentry.hash = placeholder;
        }
        self.tree.link_child(parent, id)?;
        Ok(())
    }

    /// Stages `bytes` as a fresh single-reference stream.
    fn stage_bytes(&mut self, bytes: &[u8]) -> Result<StreamHash> {
        let staging = self.staging.as_ref().ok_or(WimError::ReadOnly)?;
        let (path, mut file) = staging.create_file()?;
        let write_result = file.write_all(bytes);
        let close_result = close_file(file);
        match (write_result, close_result) {
            (Ok(()), Ok(())) => {}
            (Err(source), close) => {
                let _ = fs::remove_file(&path);
                return Err(WimError::Staging {
                    source,
                    close: close
                        .err()
                        .map(|errno| io::Error::from_raw_os_error(errno as i32)),
                });
            }
            (Ok(()), Err(errno)) => {
                let _ = fs::remove_file(&path);
                return Err(WimError::staging_errno(errno));
            }
        }

        let placeholder = self.catalog.unique_placeholder();
        let mut entry = LookupEntry::new_staged(placeholder, bytes.len() as u64, path);
        entry.refcount = 1;
        self.catalog.insert(entry);
        Ok(placeholder)
    }

    pub fn readlink(&mut self, path: &OsStr) -> Result<OsString> {
        let did = self.tree.resolve_dentry(path)?;
        let (is_symlink, hash) = {
            let dentry = self.tree.get(did)?;
            (dentry.is_symlink(), dentry.hash)
        };
        if !is_symlink {
            return Err(WimError::Invalid);
        }
        let entry_id = self.catalog.lookup(hash).ok_or(WimError::Invalid)?;
        let blob = self.read_stream_to_vec(entry_id)?;
        reparse::decode(&blob)
    }

    fn read_stream_to_vec(&mut self, id: EntryId) -> Result<Vec<u8>> {
        let backing = self
            .catalog
            .get(id)
            .ok_or(WimError::BadHandle)?
            .backing
            .clone();
        match backing {
            StreamBacking::Staging(path) => fs::read(&path).map_err(WimError::staging),
            StreamBacking::Archive(spec) => self.archive.read_resource_to_vec(&spec),
        }
    }

    // ---- truncate -------------------------------------------------------

    pub fn truncate(&mut self, path: &OsStr, size: u64) -> Result<()> {
        self.require_rw()?;
        let (did, sel) = self.resolve(path)?;
        let hash = self.tree.get(did)?.stream_hash(sel);
        let Some(entry_id) = self.catalog.lookup(hash) else {
            // already a zero-length stream
            return Ok(());
        };

        let (staging_path, original_size) = {
            let entry = self.catalog.get(entry_id).ok_or(WimError::BadHandle)?;
            (
                entry.backing.staging_path().map(Path::to_path_buf),
                entry.original_size,
            )
        };
        if size != original_size {
            match staging_path {
                Some(spath) => {
                    nix::unistd::truncate(&spath, size as i64)
                        .map_err(WimError::staging_errno)?;
                    if let Some(entry) = self.catalog.get_mut(entry_id) {
                        entry.original_size = size;
                    }
                }
                None => {
                    self.diverge(did, sel, Some(entry_id), size)?;
                }
            }
        }
        self.tree.get_mut(did)?.times.touch_all();
        Ok(())
    }

    pub fn ftruncate(&mut self, fh: u64, size: u64) -> Result<()> {
        let fd = self.handles.stream(fh).ok_or(WimError::BadHandle)?;
        let file = fd.staging.as_ref().ok_or(WimError::BadHandle)?;
        nix::unistd::ftruncate(file, size as i64).map_err(WimError::staging_errno)?;
        let (entry_id, dentry) = (fd.entry, fd.dentry);
        if let Some(entry) = self.catalog.get_mut(entry_id) {
            entry.original_size = size;
        }
        if let Some(did) = dentry {
            if let Ok(d) = self.tree.get_mut(did) {
                d.times.touch_all();
            }
        }
        Ok(())
    }

    // ---- ADS as extended attributes -------------------------------------

    pub fn list_streams(&self, path: &OsStr) -> Result<Vec<OsString>> {
        if self.config.stream_interface != StreamInterface::Xattr {
            return Err(WimError::Unsupported);
        }
        let did = self.tree.resolve_dentry(path)?;
        Ok(self
            .tree
            .get(did)?
            .ads
            .iter()
            .map(|ads| {
                let mut name = OsString::from("user.");
                name.push(&ads.name);
                name
            })
            .collect())
    }

    pub fn read_stream_xattr(&mut self, path: &OsStr, name: &OsStr) -> Result<Vec<u8>> {
        if self.config.stream_interface != StreamInterface::Xattr {
            return Err(WimError::Unsupported);
        }
        let stream = name
            .to_str()
            .and_then(|n| n.strip_prefix("user."))
            .ok_or(WimError::NotFound)?;
        let did = self.tree.resolve_dentry(path)?;
        let hash = {
            let dentry = self.tree.get(did)?;
            let i = dentry
                .ads_index(OsStr::new(stream))
                .ok_or(WimError::NotFound)?;
            dentry.ads[i].hash
        };
        match self.catalog.lookup(hash) {
            None => Ok(Vec::new()),
            Some(entry_id) => self.read_stream_to_vec(entry_id),
        }
    }

    // ---- shutdown -------------------------------------------------------

    /// Commits (when asked) and always tears the staging store down.
    pub fn shutdown(&mut self, commit: bool, check_integrity: bool) -> Result<()> {
        let mut status = Ok(());
        if self.config.read_write {
            if commit {
                status = commit::rebuild_archive(self, check_integrity);
            }
            if let Some(staging) = self.staging.take() {
                if let Err(err) = staging.remove() {
                    warn!(%err, "failed to delete the staging directory");
                    if status.is_ok() {
                        status = Err(err);
                    }
                }
            }
        }
        status
    }

    /// Checks the cross-structure invariants; test support.
    pub fn verify_invariants(&self) -> std::result::Result<(), String> {
        for (id, entry) in self.catalog.iter() {
            let mut expected = 0u32;
            for (_, dentry) in self.tree.iter() {
                for (_, hash) in dentry.effective_streams() {
                    if self.catalog.lookup(hash) == Some(id) {
                        expected += 1;
                    }
                }
            }
            if entry.refcount != expected {
                return Err(format!(
                    "entry {id:?} refcount {} but {expected} tree references",
                    entry.refcount
                ));
            }
            let mut opened = 0;
            for (slot, fd_id) in entry.open_slots() {
                opened += 1;
                match self.handles.stream(fd_id) {
                    Some(fd) if fd.entry == id && fd.slot == slot => {}
                    _ => return Err(format!("entry {id:?} slot {slot} points at a bad handle")),
                }
            }
            if opened != entry.opened_fds() {
                return Err(format!(
                    "entry {id:?} opened_fds {} but {opened} live slots",
                    entry.opened_fds()
                ));
            }
            if entry.refcount == 0 && entry.opened_fds() == 0 {
                return Err(format!("entry {id:?} should have been destroyed"));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn test_config() -> MountConfig {
        MountConfig {
            read_write: true,
            stream_interface: StreamInterface::Windows,
            mountpoint: PathBuf::from("/mnt/wim"),
            image_index: 1,
        }
    }

    /// Fresh read-write context with staging kept under the test dir.
    fn rw_context(dir: &Path) -> MountContext {
        let archive = WimArchive::create(&dir.join("test.wim"), "img").unwrap();
        with_local_staging(MountContext::new(archive, test_config()).unwrap(), dir)
    }

    fn with_local_staging(mut ctx: MountContext, dir: &Path) -> MountContext {
        if let Some(old) = ctx.staging.take() {
            old.remove().unwrap();
        }
        ctx.staging = Some(StagingDir::create(dir).unwrap());
        ctx
    }

    /// Writes `files`, commits, and remounts so every stream is
    /// archive-backed again.
    fn committed_context(dir: &Path, files: &[(&str, &[u8])]) -> MountContext {
        let mut ctx = rw_context(dir);
        for (path, data) in files {
            write_file(&mut ctx, path, data);
        }
        ctx.shutdown(true, true).unwrap();

        let archive = WimArchive::open(&dir.join("test.wim")).unwrap();
        with_local_staging(MountContext::new(archive, test_config()).unwrap(), dir)
    }

    fn write_file(ctx: &mut MountContext, path: &str, data: &[u8]) {
        ctx.mknod(OsStr::new(path)).unwrap();
        let fh = ctx.open(OsStr::new(path), libc::O_WRONLY as u32).unwrap();
        assert_eq!(ctx.write(fh, 0, data).unwrap(), data.len());
        ctx.release(fh).unwrap();
    }

    fn read_path(ctx: &mut MountContext, path: &str, len: usize) -> Vec<u8> {
        let fh = ctx.open(OsStr::new(path), libc::O_RDONLY as u32).unwrap();
        let data = ctx.read(fh, 0, len).unwrap();
        ctx.release(fh).unwrap();
        data
    }

    #[test]
    fn write_then_read_through_staging() {
        let dir = tempfile::tempdir().unwrap();
        let mut ctx = rw_context(dir.path());

        write_file(&mut ctx, "/a", b"hello");
        assert_eq!(read_path(&mut ctx, "/a", 16), b"hello");
        assert_eq!(ctx.stat_path(OsStr::new("/a")).unwrap().size, 5);
        ctx.verify_invariants().unwrap();
    }

    #[test]
    fn divergence_splits_linked_groups() {
        let dir = tempfile::tempdir().unwrap();
        let mut ctx = committed_context(dir.path(), &[("/a", b"hello")]);

        ctx.link(OsStr::new("/a"), OsStr::new("/b")).unwrap();
        assert_eq!(ctx.catalog.len(), 1);
        ctx.verify_invariants().unwrap();

        // opening /a for write diverges only /a's link group
        let fh = ctx.open(OsStr::new("/a"), libc::O_WRONLY as u32).unwrap();
        ctx.write(fh, 0, b"H").unwrap();
        ctx.release(fh).unwrap();

        assert_eq!(ctx.catalog.len(), 2);
        assert_eq!(read_path(&mut ctx, "/a", 16), b"Hello");
        assert_eq!(read_path(&mut ctx, "/b", 16), b"hello");
        ctx.verify_invariants().unwrap();
    }

    #[test]
    fn split_transfers_open_handles() {
        let dir = tempfile::tempdir().unwrap();
        let mut ctx = committed_context(dir.path(), &[("/a", b"shared")]);
        ctx.link(OsStr::new("/a"), OsStr::new("/b")).unwrap();

        // a handle open on /a must follow /a onto the new entry when the
        // write-open splits the shared entry
        let read_fh = ctx.open(OsStr::new("/a"), libc::O_RDONLY as u32).unwrap();
        let write_fh = ctx.open(OsStr::new("/a"), libc::O_WRONLY as u32).unwrap();
        ctx.write(write_fh, 0, b"SHARED").unwrap();
        ctx.verify_invariants().unwrap();

        assert_eq!(ctx.read(read_fh, 0, 16).unwrap(), b"SHARED");
        assert_eq!(read_path(&mut ctx, "/b", 16), b"shared");
        ctx.release(read_fh).unwrap();
        ctx.release(write_fh).unwrap();
        ctx.verify_invariants().unwrap();
    }

    #[test]
    fn whole_group_divergence_reuses_entry() {
        let dir = tempfile::tempdir().unwrap();
        let mut ctx = committed_context(dir.path(), &[("/a", b"hello")]);

        // open keeps its slot across the archive-to-staging transition
        let read_fh = ctx.open(OsStr::new("/a"), libc::O_RDONLY as u32).unwrap();
        let write_fh = ctx.open(OsStr::new("/a"), libc::O_WRONLY as u32).unwrap();
        assert_eq!(ctx.catalog.len(), 1);
        ctx.write(write_fh, 0, b"J").unwrap();
        ctx.release(write_fh).unwrap();
        ctx.release(read_fh).unwrap();

        assert_eq!(ctx.catalog.len(), 1);
        assert_eq!(read_path(&mut ctx, "/a", 16), b"Jello");
        ctx.verify_invariants().unwrap();
    }

    #[test]
    fn unlink_defers_entry_destruction() {
        let dir = tempfile::tempdir().unwrap();
        let mut ctx = rw_context(dir.path());

        write_file(&mut ctx, "/a", b"content");
        let fh = ctx.open(OsStr::new("/a"), libc::O_RDONLY as u32).unwrap();
        ctx.unlink(OsStr::new("/a")).unwrap();

        assert!(ctx.stat_path(OsStr::new("/a")).is_err());
        assert_eq!(ctx.read(fh, 0, 16).unwrap(), b"content");
        assert_eq!(ctx.catalog.len(), 1);

        ctx.release(fh).unwrap();
        assert_eq!(ctx.catalog.len(), 0);
    }

    #[test]
    fn truncate_of_empty_stream_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let mut ctx = rw_context(dir.path());
        write_file(&mut ctx, "/a", b"12345");

        ctx.mknod(OsStr::new("/empty")).unwrap();
        ctx.truncate(OsStr::new("/empty"), 0).unwrap();
        assert_eq!(ctx.catalog.len(), 1, "no entry materialized");
    }

    #[test]
    fn ads_create_write_unlink() {
        let dir = tempfile::tempdir().unwrap();
        let mut ctx = rw_context(dir.path());

        write_file(&mut ctx, "/f", b"primary");
        ctx.mknod(OsStr::new("/f:meta")).unwrap();
        let fh = ctx.open(OsStr::new("/f:meta"), libc::O_WRONLY as u32).unwrap();
        ctx.write(fh, 0, b"side").unwrap();
        ctx.release(fh).unwrap();
        ctx.verify_invariants().unwrap();

        assert_eq!(read_path(&mut ctx, "/f:meta", 16), b"side");
        assert_eq!(read_path(&mut ctx, "/f", 16), b"primary");

        ctx.unlink(OsStr::new("/f:meta")).unwrap();
        assert!(ctx.open(OsStr::new("/f:meta"), libc::O_RDONLY as u32).is_err());
        assert_eq!(read_path(&mut ctx, "/f", 16), b"primary");
        ctx.verify_invariants().unwrap();
    }

    #[test]
    fn symlink_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let mut ctx = rw_context(dir.path());

        ctx.symlink(OsStr::new("/target/elsewhere"), OsStr::new("/ln"))
            .unwrap();
        assert_eq!(
            ctx.readlink(OsStr::new("/ln")).unwrap(),
            OsString::from("/target/elsewhere")
        );
        let stat = ctx.stat_path(OsStr::new("/ln")).unwrap();
        assert!(stat.is_symlink);
        ctx.verify_invariants().unwrap();
    }

    #[test]
    fn rename_over_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        let mut ctx = rw_context(dir.path());

        write_file(&mut ctx, "/a", b"old");
        write_file(&mut ctx, "/c", b"xyz");
        ctx.rename(OsStr::new("/c"), OsStr::new("/a")).unwrap();

        assert_eq!(read_path(&mut ctx, "/a", 16), b"xyz");
        assert!(ctx.stat_path(OsStr::new("/c")).is_err());
        assert_eq!(ctx.catalog.len(), 1);
        ctx.verify_invariants().unwrap();
    }

    #[test]
    fn rename_directory_rules() {
        let dir = tempfile::tempdir().unwrap();
        let mut ctx = rw_context(dir.path());

        ctx.mkdir(OsStr::new("/d")).unwrap();
        ctx.mkdir(OsStr::new("/e")).unwrap();
        write_file(&mut ctx, "/e/inner", b"x");
        write_file(&mut ctx, "/f", b"y");

        assert!(matches!(
            ctx.rename(OsStr::new("/f"), OsStr::new("/d")),
            Err(WimError::IsDirectory)
        ));
        assert!(matches!(
            ctx.rename(OsStr::new("/d"), OsStr::new("/f")),
            Err(WimError::NotDirectory)
        ));
        assert!(matches!(
            ctx.rename(OsStr::new("/d"), OsStr::new("/e")),
            Err(WimError::NotEmpty)
        ));
        // self-rename is a no-op
        ctx.rename(OsStr::new("/d"), OsStr::new("/d")).unwrap();
    }

    #[test]
    fn orphaned_directory_survives_until_released() {
        let dir = tempfile::tempdir().unwrap();
        let mut ctx = rw_context(dir.path());

        ctx.mkdir(OsStr::new("/d")).unwrap();
        let fh = ctx.opendir(OsStr::new("/d")).unwrap();
        ctx.rmdir(OsStr::new("/d")).unwrap();

        assert!(ctx.tree.resolve_dentry(OsStr::new("/d")).is_err());
        assert!(ctx.readdir(fh).unwrap().is_empty());
        ctx.releasedir(fh).unwrap();
    }
}
