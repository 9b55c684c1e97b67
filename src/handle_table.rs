use std::collections::HashMap;
use std::fs::File;

use crate::catalog::EntryId;
use crate::dentry::DentryId;

/// Handle id 0 is the null handle: an empty file opened on a read-only
/// mount, with no lookup entry behind it.
pub const NULL_FH: u64 = 0;

/// One open stream, anchored on a lookup entry's fd slot.
#[derive(Debug)]
pub struct StreamFd {
    pub entry: EntryId,
    pub slot: u16,
    /// Cleared when the dentry is removed while this handle stays open.
    pub dentry: Option<DentryId>,
    /// Hard-link group snapshot taken at open time; the divergence split
    /// tests membership against this instead of walking the group.
    pub link_group: u64,
    /// Native descriptor onto the staging file; `None` while the stream is
    /// still read from the archive.
    pub staging: Option<File>,
    pub writable: bool,
}

#[derive(Debug)]
pub enum Handle {
    Stream(StreamFd),
    Dir(DentryId),
}

#[derive(Debug, Default)]
pub struct HandleTable {
    next_id: u64,
    entries: HashMap<u64, Handle>,
}

impl HandleTable {
    pub fn new() -> Self {
        Self {
            next_id: NULL_FH + 1,
            entries: HashMap::new(),
        }
    }

    pub fn insert_stream(&mut self, fd: StreamFd) -> u64 {
        self.insert(Handle::Stream(fd))
    }

    pub fn insert_dir(&mut self, dentry: DentryId) -> u64 {
        self.insert(Handle::Dir(dentry))
    }

    fn insert(&mut self, handle: Handle) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        self.entries.insert(id, handle);
        id
    }

    pub fn stream(&self, id: u64) -> Option<&StreamFd> {
        match self.entries.get(&id) {
            Some(Handle::Stream(fd)) => Some(fd),
            _ => None,
        }
    }

    pub fn stream_mut(&mut self, id: u64) -> Option<&mut StreamFd> {
        match self.entries.get_mut(&id) {
            Some(Handle::Stream(fd)) => Some(fd),
            _ => None,
        }
    }

    pub fn dir(&self, id: u64) -> Option<DentryId> {
        match self.entries.get(&id) {
            Some(Handle::Dir(dentry)) => Some(*dentry),
            _ => None,
        }
    }

    pub fn remove(&mut self, id: u64) -> Option<Handle> {
        self.entries.remove(&id)
    }

    pub fn iter_streams_mut(&mut self) -> impl Iterator<Item = (u64, &mut StreamFd)> {
        self.entries.iter_mut().filter_map(|(&id, handle)| match handle {
            Handle::Stream(fd) => Some((id, fd)),
            Handle::Dir(_) => None,
        })
    }
}
