//! Resource catalog: one lookup entry per unique content stream.
//!
//! Entries are keyed by a stable id so a stream can change identity (archive
//! resource to staging file, placeholder hash to real hash) without breaking
//! the open handles anchored on it. The hash index tracks the catalog's
//! public domain; a deferred entry whose refcount dropped to zero lives on,
//! still indexed, until its last handle closes.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::archive::ResourceSpec;
use crate::error::{Result, WimError};
use crate::hash::StreamHash;

pub const FDS_PER_ALLOC: usize = 8;
pub const MAX_FDS: usize = 0xffff;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct EntryId(pub u64);

/// FUSE-visible handle id; key into the handle table.
pub type FdId = u64;

/// Where a stream's bytes live. Exactly one of the two by construction.
#[derive(Debug, Clone)]
pub enum StreamBacking {
    Archive(ResourceSpec),
    Staging(PathBuf),
}

impl StreamBacking {
    pub fn is_staging(&self) -> bool {
        matches!(self, StreamBacking::Staging(_))
    }

    pub fn staging_path(&self) -> Option<&Path> {
        match self {
            StreamBacking::Staging(path) => Some(path),
            StreamBacking::Archive(_) => None,
        }
    }

    pub fn resource(&self) -> Option<&ResourceSpec> {
        match self {
            StreamBacking::Archive(spec) => Some(spec),
            StreamBacking::Staging(_) => None,
        }
    }
}

#[derive(Debug)]
pub struct LookupEntry {
    pub hash: StreamHash,
    pub refcount: u32,
    pub original_size: u64,
    pub backing: StreamBacking,
    fds: Vec<Option<FdId>>,
    num_opened_fds: usize,
}

impl LookupEntry {
    pub fn new_archive(hash: StreamHash, original_size: u64, spec: ResourceSpec) -> Self {
        Self {
            hash,
            refcount: 0,
            original_size,
            backing: StreamBacking::Archive(spec),
            fds: Vec::new(),
            num_opened_fds: 0,
        }
    }

    pub fn new_staged(hash: StreamHash, original_size: u64, path: PathBuf) -> Self {
        Self {
            hash,
            refcount: 0,
            original_size,
            backing: StreamBacking::Staging(path),
            fds: Vec::new(),
            num_opened_fds: 0,
        }
    }

    pub fn opened_fds(&self) -> usize {
        self.num_opened_fds
    }

    pub fn allocated_fds(&self) -> usize {
        self.fds.len()
    }

    pub fn slots(&self) -> &[Option<FdId>] {
        &self.fds
    }

    pub fn open_slots(&self) -> impl Iterator<Item = (u16, FdId)> + '_ {
        self.fds
            .iter()
            .enumerate()
            .filter_map(|(i, slot)| slot.map(|fd| (i as u16, fd)))
    }

    /// Lowest free slot, growing the array eight slots at a time up to the
    /// cap. The returned index is stable for the handle's lifetime.
    pub fn alloc_slot(&mut self, fd: FdId) -> Result<u16> {
        if self.num_opened_fds == self.fds.len() {
            if self.fds.len() == MAX_FDS {
                return Err(WimError::TooManyHandles);
            }
            let grow = FDS_PER_ALLOC.min(MAX_FDS - self.fds.len());
            self.fds.extend(std::iter::repeat(None).take(grow));
        }
        for (i, slot) in self.fds.iter_mut().enumerate() {
            if slot.is_none() {
                *slot = Some(fd);
                self.num_opened_fds += 1;
                return Ok(i as u16);
            }
        }
        unreachable!("fd slot array full after growth");
    }

    pub fn clear_slot(&mut self, idx: u16, fd: FdId) {
        let slot = &mut self.fds[idx as usize];
        assert_eq!(*slot, Some(fd), "fd slot does not match closing handle");
        *slot = None;
        self.num_opened_fds -= 1;
    }

    /// Compact append used when the link-group split relocates a handle.
    pub fn push_transferred(&mut self, fd: FdId) -> u16 {
        let idx = self.fds.len() as u16;
        self.fds.push(Some(fd));
        self.num_opened_fds += 1;
        idx
    }
}

pub struct Catalog {
    next_id: u64,
    entries: HashMap<EntryId, LookupEntry>,
    by_hash: HashMap<StreamHash, EntryId>,
}

impl Catalog {
    pub fn new() -> Self {
        Self {
            next_id: 1,
            entries: HashMap::new(),
            by_hash: HashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Inserts a fully formed entry and indexes it under its hash.
    pub fn insert(&mut self, entry: LookupEntry) -> EntryId {
        let id = EntryId(self.next_id);
        self.next_id += 1;
        self.by_hash.insert(entry.hash, id);
        self.entries.insert(id, entry);
        id
    }

    /// Inserts an entry without a hash index; `index` binds it later.
    pub fn insert_detached(&mut self, entry: LookupEntry) -> EntryId {
        let id = EntryId(self.next_id);
        self.next_id += 1;
        self.entries.insert(id, entry);
        id
    }

    pub fn get(&self, id: EntryId) -> Option<&LookupEntry> {
        self.entries.get(&id)
    }

    pub fn get_mut(&mut self, id: EntryId) -> Option<&mut LookupEntry> {
        self.entries.get_mut(&id)
    }

    /// Hash lookup; the zero hash never has an entry.
    pub fn lookup(&self, hash: StreamHash) -> Option<EntryId> {
        if hash.is_zero() {
            return None;
        }
        self.by_hash.get(&hash).copied()
    }

    /// Drops the hash index for `id`, keeping the entry alive.
    pub fn unindex(&mut self, id: EntryId) {
        if let Some(entry) = self.entries.get(&id) {
            if self.by_hash.get(&entry.hash) == Some(&id) {
                self.by_hash.remove(&entry.hash);
            }
        }
    }

    /// Rebinds `id` under `hash` and updates the entry to match.
    pub fn index(&mut self, id: EntryId, hash: StreamHash) {
        if let Some(entry) = self.entries.get_mut(&id) {
            entry.hash = hash;
            self.by_hash.insert(hash, id);
        }
    }

    pub fn remove(&mut self, id: EntryId) -> Option<LookupEntry> {
        let entry = self.entries.remove(&id)?;
        if self.by_hash.get(&entry.hash) == Some(&id) {
            self.by_hash.remove(&entry.hash);
        }
        Some(entry)
    }

    /// A random hash not yet present in the catalog.
    pub fn unique_placeholder(&self) -> StreamHash {
        loop {
            let hash = StreamHash::random();
            if !self.by_hash.contains_key(&hash) {
                return hash;
            }
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (EntryId, &LookupEntry)> {
        self.entries.iter().map(|(&id, e)| (id, e))
    }

    pub fn ids(&self) -> Vec<EntryId> {
        self.entries.keys().copied().collect()
    }
}

impl Default for Catalog {
    fn default() -> Self {
        Self::new()
    }
}
