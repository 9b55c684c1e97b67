//! In-memory directory tree for one mounted image.
//!
//! Dentries live in an id-keyed arena. A dentry is either reachable from the
//! root or an orphan awaiting its last directory handle (`open_count > 0`);
//! orphans stay in the arena with no parent until released.

use std::collections::HashMap;
use std::ffi::{OsStr, OsString};
use std::os::unix::ffi::OsStrExt;
use std::time::SystemTime;

use crate::error::{Result, WimError};
use crate::hash::StreamHash;
use crate::names;
use crate::reparse::IO_REPARSE_TAG_SYMLINK;

pub const FILE_ATTRIBUTE_DIRECTORY: u32 = 0x0000_0010;
pub const FILE_ATTRIBUTE_NORMAL: u32 = 0x0000_0080;
pub const FILE_ATTRIBUTE_REPARSE_POINT: u32 = 0x0000_0400;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DentryId(pub u64);

pub const ROOT_DENTRY: DentryId = DentryId(1);

/// Which stream of a dentry an operation addresses.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StreamSel {
    Primary,
    Ads(usize),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LinkRole {
    Master,
    Slave,
}

/// The four archive timestamps carried by every dentry.
#[derive(Clone, Copy, Debug)]
pub struct Timestamps {
    pub created: SystemTime,
    pub accessed: SystemTime,
    pub written: SystemTime,
    pub changed: SystemTime,
}

impl Timestamps {
    pub fn now() -> Self {
        let now = SystemTime::now();
        Self {
            created: now,
            accessed: now,
            written: now,
            changed: now,
        }
    }

    pub fn touch_all(&mut self) {
        let now = SystemTime::now();
        self.accessed = now;
        self.written = now;
        self.changed = now;
        self.created = self.created.min(now);
    }

    pub fn touch_accessed_written(&mut self) {
        let now = SystemTime::now();
        self.accessed = now;
        self.written = now;
    }
}

/// Named alternate data stream attached to a regular file.
#[derive(Clone, Debug)]
pub struct AdsEntry {
    pub name: OsString,
    pub name_utf16: Vec<u8>,
    pub hash: StreamHash,
}

#[derive(Clone, Debug)]
pub struct Dentry {
    pub name: OsString,
    pub name_utf16: Vec<u8>,
    pub parent: Option<DentryId>,
    pub children: Vec<DentryId>,
    pub attributes: u32,
    pub reparse_tag: u32,
    pub times: Timestamps,
    pub hash: StreamHash,
    pub ads: Vec<AdsEntry>,
    pub link_group: u64,
    pub link_role: LinkRole,
    /// Directory handles currently holding this dentry open; defers deletion.
    pub open_count: u32,
}

impl Dentry {
    pub fn is_directory(&self) -> bool {
        self.attributes & FILE_ATTRIBUTE_DIRECTORY != 0
    }

    pub fn is_symlink(&self) -> bool {
        self.attributes & FILE_ATTRIBUTE_REPARSE_POINT != 0
            && self.reparse_tag == IO_REPARSE_TAG_SYMLINK
    }

    pub fn is_regular_file(&self) -> bool {
        self.attributes & (FILE_ATTRIBUTE_DIRECTORY | FILE_ATTRIBUTE_REPARSE_POINT) == 0
    }

    pub fn stream_hash(&self, sel: StreamSel) -> StreamHash {
        match sel {
            StreamSel::Primary => self.hash,
            StreamSel::Ads(i) => self.ads[i].hash,
        }
    }

    pub fn set_stream_hash(&mut self, sel: StreamSel, hash: StreamHash) {
        match sel {
            StreamSel::Primary => self.hash = hash,
            StreamSel::Ads(i) => self.ads[i].hash = hash,
        }
    }

    pub fn ads_index(&self, name: &OsStr) -> Option<usize> {
        self.ads.iter().position(|entry| entry.name == name)
    }

    /// Primary stream plus every ADS.
    pub fn effective_streams(&self) -> Vec<(StreamSel, StreamHash)> {
        let mut streams = Vec::with_capacity(1 + self.ads.len());
        streams.push((StreamSel::Primary, self.hash));
        for (i, entry) in self.ads.iter().enumerate() {
            streams.push((StreamSel::Ads(i), entry.hash));
        }
        streams
    }
}

pub struct DentryTree {
    next_id: u64,
    next_group: u64,
    entries: HashMap<DentryId, Dentry>,
}

impl DentryTree {
    pub fn new() -> Self {
        let mut tree = Self {
            next_id: ROOT_DENTRY.0 + 1,
            next_group: 1,
            entries: HashMap::new(),
        };
        let root = Dentry {
            name: OsString::new(),
            name_utf16: Vec::new(),
            parent: None,
            children: Vec::new(),
            attributes: FILE_ATTRIBUTE_DIRECTORY,
            reparse_tag: 0,
            times: Timestamps::now(),
            hash: StreamHash::ZERO,
            ads: Vec::new(),
            link_group: tree.alloc_group(),
            link_role: LinkRole::Master,
            open_count: 0,
        };
        tree.entries.insert(ROOT_DENTRY, root);
        tree
    }

    pub fn root(&self) -> DentryId {
        ROOT_DENTRY
    }

    pub fn alloc_group(&mut self) -> u64 {
        let group = self.next_group;
        self.next_group += 1;
        group
    }

    pub fn get(&self, id: DentryId) -> Result<&Dentry> {
        self.entries.get(&id).ok_or(WimError::NotFound)
    }

    pub fn get_mut(&mut self, id: DentryId) -> Result<&mut Dentry> {
        self.entries.get_mut(&id).ok_or(WimError::NotFound)
    }

    /// Allocates an unlinked dentry with a fresh hard-link group.
    pub fn new_node(&mut self, name: &OsStr, attributes: u32) -> Result<DentryId> {
        let (name, name_utf16) = names::name_pair(name)?;
        let id = DentryId(self.next_id);
        self.next_id += 1;
        let link_group = self.alloc_group();
        self.entries.insert(
            id,
            Dentry {
                name,
                name_utf16,
                parent: None,
                children: Vec::new(),
                attributes,
                reparse_tag: 0,
                times: Timestamps::now(),
                hash: StreamHash::ZERO,
                ads: Vec::new(),
                link_group,
                link_role: LinkRole::Master,
                open_count: 0,
            },
        );
        Ok(id)
    }

    /// Used by the archive loader to rebuild a tree from serialized form.
    /// Keeps the group allocator ahead of every loaded group id.
    pub fn insert_loaded(&mut self, dentry: Dentry) -> DentryId {
        let id = DentryId(self.next_id);
        self.next_id += 1;
        self.next_group = self.next_group.max(dentry.link_group + 1);
        self.entries.insert(id, dentry);
        id
    }

    pub fn child_by_name(&self, parent: DentryId, name: &OsStr) -> Option<DentryId> {
        let dir = self.entries.get(&parent)?;
        dir.children
            .iter()
            .copied()
            .find(|&child| self.entries.get(&child).map(|d| d.name.as_os_str()) == Some(name))
    }

    /// Attaches `child` under `parent`; sibling names must stay distinct.
    pub fn link_child(&mut self, parent: DentryId, child: DentryId) -> Result<()> {
        let name = self.get(child)?.name.clone();
        let dir = self.get(parent)?;
        if !dir.is_directory() {
            return Err(WimError::NotDirectory);
        }
        if self.child_by_name(parent, &name).is_some() {
            return Err(WimError::Exists);
        }
        self.get_mut(parent)?.children.push(child);
        self.get_mut(child)?.parent = Some(parent);
        Ok(())
    }

    /// Detaches `id` from its parent, leaving it as an orphan in the arena.
    pub fn unlink_child(&mut self, id: DentryId) -> Result<()> {
        let parent = self.get(id)?.parent.ok_or(WimError::Invalid)?;
        let dir = self.get_mut(parent)?;
        dir.children.retain(|&child| child != id);
        self.get_mut(id)?.parent = None;
        Ok(())
    }

    /// Drops an orphan from the arena.
    pub fn remove(&mut self, id: DentryId) -> Option<Dentry> {
        self.entries.remove(&id)
    }

    pub fn is_empty_dir(&self, id: DentryId) -> Result<bool> {
        let dentry = self.get(id)?;
        if !dentry.is_directory() {
            return Err(WimError::NotDirectory);
        }
        Ok(dentry.children.is_empty())
    }

    /// Walks `path` from the root. With `ads_ok`, a trailing `:stream` on the
    /// final component addresses an alternate data stream.
    pub fn resolve(&self, path: &OsStr, ads_ok: bool) -> Result<(DentryId, StreamSel)> {
        let mut current = ROOT_DENTRY;
        let bytes = path.as_bytes();
        let components: Vec<&[u8]> = bytes.split(|&b| b == b'/').filter(|c| !c.is_empty()).collect();

        for (depth, component) in components.iter().enumerate() {
            let dir = self.get(current)?;
            if !dir.is_directory() {
                return Err(WimError::NotDirectory);
            }
            let is_last = depth == components.len() - 1;
            let component = OsStr::from_bytes(component);

            if is_last && ads_ok {
                if let Some((file, stream)) = names::split_stream(component) {
                    let id = self
                        .child_by_name(current, &file)
                        .ok_or(WimError::NotFound)?;
                    let dentry = self.get(id)?;
                    if !dentry.is_regular_file() {
                        return Err(WimError::NotFound);
                    }
                    let ads = dentry.ads_index(&stream).ok_or(WimError::NotFound)?;
                    return Ok((id, StreamSel::Ads(ads)));
                }
            }

            current = self
                .child_by_name(current, component)
                .ok_or(WimError::NotFound)?;
        }

        Ok((current, StreamSel::Primary))
    }

    pub fn resolve_dentry(&self, path: &OsStr) -> Result<DentryId> {
        let (id, _) = self.resolve(path, false)?;
        Ok(id)
    }

    /// Resolves everything but the final component; returns the parent
    /// directory and the basename.
    pub fn parent_of(&self, path: &OsStr) -> Result<(DentryId, OsString)> {
        let bytes = path.as_bytes();
        let components: Vec<&[u8]> = bytes.split(|&b| b == b'/').filter(|c| !c.is_empty()).collect();
        let (basename, dirs) = components.split_last().ok_or(WimError::Invalid)?;

        let mut current = ROOT_DENTRY;
        for component in dirs {
            let dir = self.get(current)?;
            if !dir.is_directory() {
                return Err(WimError::NotDirectory);
            }
            current = self
                .child_by_name(current, OsStr::from_bytes(component))
                .ok_or(WimError::NotFound)?;
        }
        if !self.get(current)?.is_directory() {
            return Err(WimError::NotDirectory);
        }
        Ok((current, OsStr::from_bytes(basename).to_os_string()))
    }

    pub fn group_members(&self, group: u64) -> Vec<DentryId> {
        self.entries
            .iter()
            .filter(|(_, d)| d.link_group == group)
            .map(|(&id, _)| id)
            .collect()
    }

    pub fn group_size(&self, group: u64) -> u32 {
        self.entries.values().filter(|d| d.link_group == group).count() as u32
    }

    /// Members of `group` referencing `hash` at the given stream position:
    /// the primary stream, or the ADS with the given name.
    pub fn link_group_refs(
        &self,
        group: u64,
        stream_name: Option<&OsStr>,
        hash: StreamHash,
    ) -> u32 {
        self.entries
            .values()
            .filter(|d| d.link_group == group)
            .filter(|d| match stream_name {
                None => d.hash == hash,
                Some(name) => d
                    .ads_index(name)
                    .map(|i| d.ads[i].hash == hash)
                    .unwrap_or(false),
            })
            .count() as u32
    }

    pub fn iter(&self) -> impl Iterator<Item = (DentryId, &Dentry)> {
        self.entries.iter().map(|(&id, d)| (id, d))
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (DentryId, &mut Dentry)> {
        self.entries.iter_mut().map(|(&id, d)| (id, d))
    }

    /// Preorder walk of everything reachable from `from`.
    pub fn walk(&self, from: DentryId) -> Vec<DentryId> {
        let mut out = Vec::new();
        let mut stack = vec![from];
        while let Some(id) = stack.pop() {
            out.push(id);
            if let Some(dentry) = self.entries.get(&id) {
                stack.extend(dentry.children.iter().rev().copied());
            }
        }
        out
    }

    /// (directories, files) reachable from the root, root excluded.
    pub fn counts(&self) -> (u64, u64) {
        let mut dirs = 0;
        let mut files = 0;
        for id in self.walk(ROOT_DENTRY) {
            if id == ROOT_DENTRY {
                continue;
            }
            if let Ok(dentry) = self.get(id) {
                if dentry.is_directory() {
                    dirs += 1;
                } else {
                    files += 1;
                }
            }
        }
        (dirs, files)
    }
}

impl Default for DentryTree {
    fn default() -> Self {
        Self::new()
    }
}
