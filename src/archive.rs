//! Archive container and the resource collaborators.
//!
//! On disk an archive is a compact binary container: header, resource region,
//! table of contents keyed by content hash, then per-image metadata with a
//! serialized dentry tree. Resources tagged `Xpress` or `Lzx` are recognized
//! but their decompressors live outside this crate; the codecs implemented
//! here are `None` and `Zstd`.

use std::fs::{self, File};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tracing::debug;

use crate::dentry::{Dentry, DentryId, DentryTree, LinkRole, Timestamps, ROOT_DENTRY};
use crate::error::{IoResultExt, Result, WimError};
use crate::hash::{sha1_bytes, StreamHash, HASH_SIZE};

const MAGIC: &[u8; 4] = b"WMFS";
const VERSION: u32 = 1;
const HEADER_LEN: usize = 4 + 4 + 8 + 8 + 4;
const ZSTD_LEVEL: i32 = 3;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Compression {
    None,
    Zstd,
    Xpress,
    Lzx,
}

impl Compression {
    fn to_u8(self) -> u8 {
        match self {
            Compression::None => 0,
            Compression::Zstd => 1,
            Compression::Xpress => 2,
            Compression::Lzx => 3,
        }
    }

    fn from_u8(raw: u8) -> Result<Self> {
        match raw {
            0 => Ok(Compression::None),
            1 => Ok(Compression::Zstd),
            2 => Ok(Compression::Xpress),
            3 => Ok(Compression::Lzx),
            other => Err(WimError::Format(format!("unknown compression tag {other}"))),
        }
    }
}

/// Where one stream's bytes live in the backing file.
#[derive(Clone, Debug)]
pub struct ResourceSpec {
    pub offset: u64,
    pub stored_size: u64,
    pub original_size: u64,
    pub compression: Compression,
}

#[derive(Clone, Debug)]
pub struct ImageInfo {
    pub name: String,
    pub dir_count: u64,
    pub file_count: u64,
    pub total_bytes: u64,
    pub modified: bool,
}

#[derive(Clone, Debug)]
struct ImageRecord {
    info: ImageInfo,
    tree_blob: Vec<u8>,
}

/// One image decoded out of the archive: the catalog loader's output.
pub struct LoadedImage {
    pub info: ImageInfo,
    pub tree: DentryTree,
}

/// A stream the commit pipeline hands to the overwriter.
pub struct CommitStream {
    pub hash: StreamHash,
    pub original_size: u64,
    pub source: StreamSource,
}

pub enum StreamSource {
    InArchive(ResourceSpec),
    StagedFile(PathBuf),
}

pub struct WimArchive {
    path: PathBuf,
    file: File,
    images: Vec<ImageRecord>,
    toc: Vec<(StreamHash, ResourceSpec)>,
}

impl WimArchive {
    /// Creates a new archive holding one empty image.
    pub fn create(path: &Path, image_name: &str) -> Result<Self> {
        let tree = DentryTree::new();
        let record = ImageRecord {
            info: ImageInfo {
                name: image_name.to_string(),
                dir_count: 0,
                file_count: 0,
                total_bytes: 0,
                modified: false,
            },
            tree_blob: encode_tree(&tree),
        };
        let images = vec![record];
        let toc: Vec<(StreamHash, ResourceSpec)> = Vec::new();

        let mut file = File::create(path).with_path(path)?;
        file.write_all(&[0u8; HEADER_LEN]).with_path(path)?;
        write_container_tail(&mut file, HEADER_LEN as u64, &toc, &images, path)?;
        file.sync_all().with_path(path)?;

        let file = File::open(path).with_path(path)?;
        Ok(Self {
            path: path.to_path_buf(),
            file,
            images,
            toc,
        })
    }

    pub fn open(path: &Path) -> Result<Self> {
        let mut file = File::open(path).with_path(path)?;

        let mut header = [0u8; HEADER_LEN];
        file.read_exact(&mut header).with_path(path)?;
        if &header[..4] != MAGIC {
            return Err(WimError::Format("bad magic".into()));
        }
        let mut r = Reader::new(&header[4..]);
        let version = r.u32()?;
        if version != VERSION {
            return Err(WimError::Format(format!("unsupported version {version}")));
        }
        let toc_offset = r.u64()?;
        let images_offset = r.u64()?;
        let image_count = r.u32()? as usize;

        let toc = {
            let bytes = read_region(&mut file, toc_offset, images_offset, path)?;
            decode_toc(&bytes)?
        };
        let images = {
            file.seek(SeekFrom::Start(images_offset)).with_path(path)?;
            let mut bytes = Vec::new();
            file.read_to_end(&mut bytes).with_path(path)?;
            decode_images(&bytes, image_count)?
        };

        Ok(Self {
            path: path.to_path_buf(),
            file,
            images,
            toc,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn image_count(&self) -> usize {
        self.images.len()
    }

    pub fn image_info(&self, index: usize) -> Result<&ImageInfo> {
        self.record(index).map(|r| &r.info)
    }

    pub fn mark_modified(&mut self, index: usize) -> Result<()> {
        let record = self
            .images
            .get_mut(index.checked_sub(1).ok_or(WimError::Invalid)?)
            .ok_or(WimError::Invalid)?;
        record.info.modified = true;
        Ok(())
    }

    fn record(&self, index: usize) -> Result<&ImageRecord> {
        index
            .checked_sub(1)
            .and_then(|i| self.images.get(i))
            .ok_or(WimError::Invalid)
    }

    /// Catalog loader collaborator: decode image `index` (1-based).
    pub fn select_image(&self, index: usize) -> Result<LoadedImage> {
        let record = self.record(index)?;
        let tree = decode_tree(&record.tree_blob)?;
        Ok(LoadedImage {
            info: record.info.clone(),
            tree,
        })
    }

    pub fn resource_spec(&self, hash: StreamHash) -> Option<ResourceSpec> {
        self.toc
            .iter()
            .find(|(h, _)| *h == hash)
            .map(|(_, spec)| spec.clone())
    }

    fn read_stored(&mut self, spec: &ResourceSpec) -> Result<Vec<u8>> {
        self.file
            .seek(SeekFrom::Start(spec.offset))
            .with_path(&self.path)?;
        let mut bytes = vec![0u8; spec.stored_size as usize];
        self.file.read_exact(&mut bytes).with_path(&self.path)?;
        Ok(bytes)
    }

    /// Resource reader collaborator: decompressed bytes at `skip` into the
    /// resource, clamped to the end. The caller owns offset validation.
    pub fn read_resource(
        &mut self,
        spec: &ResourceSpec,
        skip: u64,
        buf: &mut [u8],
    ) -> Result<usize> {
        if skip >= spec.original_size {
            return Ok(0);
        }
        let len = buf.len().min((spec.original_size - skip) as usize);
        match spec.compression {
            Compression::None => {
                self.file
                    .seek(SeekFrom::Start(spec.offset + skip))
                    .with_path(&self.path)?;
                self.file
                    .read_exact(&mut buf[..len])
                    .with_path(&self.path)?;
                Ok(len)
            }
            Compression::Zstd => {
                let stored = self.read_stored(spec)?;
                let decoded = zstd::stream::decode_all(&stored[..])
                    .map_err(|e| WimError::archive(&self.path, e))?;
                if decoded.len() as u64 != spec.original_size {
                    return Err(WimError::Format("resource size mismatch".into()));
                }
                buf[..len].copy_from_slice(&decoded[skip as usize..skip as usize + len]);
                Ok(len)
            }
            other @ (Compression::Xpress | Compression::Lzx) => {
                Err(WimError::UnsupportedCompression(other))
            }
        }
    }

    pub fn read_resource_to_vec(&mut self, spec: &ResourceSpec) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; spec.original_size as usize];
        let n = self.read_resource(spec, 0, &mut buf)?;
        buf.truncate(n);
        Ok(buf)
    }

    /// Archive overwriter collaborator: serializes image `index` from the
    /// given tree and stream set, then atomically replaces the backing file.
    pub fn overwrite(
        &mut self,
        index: usize,
        info: &ImageInfo,
        tree: &DentryTree,
        streams: &[CommitStream],
        check_integrity: bool,
    ) -> Result<()> {
        self.record(index)?;
        let mut images = self.images.clone();
        images[index - 1] = ImageRecord {
            info: info.clone(),
            tree_blob: encode_tree(tree),
        };

        // Every resource already in the archive is carried over verbatim so
        // other images stay intact; staged streams append under their fresh
        // content hashes.
        let mut order: Vec<(StreamHash, Option<&Path>)> = self
            .toc
            .iter()
            .map(|(hash, _)| (*hash, None))
            .collect();
        for stream in streams {
            if let StreamSource::StagedFile(path) = &stream.source {
                if !order.iter().any(|(h, _)| *h == stream.hash) {
                    order.push((stream.hash, Some(path.as_path())));
                }
            }
        }

        let parent = self
            .path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or(Path::new("."))
            .to_path_buf();
        let mut tmp = tempfile::NamedTempFile::new_in(&parent)
            .map_err(|e| WimError::archive(&self.path, e))?;

        let mut new_toc = Vec::with_capacity(order.len());
        {
            let out = tmp.as_file_mut();
            out.write_all(&[0u8; HEADER_LEN]).with_path(&self.path)?;
            let mut offset = HEADER_LEN as u64;
            for (hash, staged) in order {
                let (stored, compression, original_size) = match staged {
                    None => {
                        let spec = self
                            .resource_spec(hash)
                            .ok_or_else(|| WimError::Format("resource vanished".into()))?;
                        (self.read_stored(&spec)?, spec.compression, spec.original_size)
                    }
                    Some(path) => {
                        let data = fs::read(path).map_err(WimError::staging)?;
                        let stored = zstd::stream::encode_all(&data[..], ZSTD_LEVEL)
                            .map_err(|e| WimError::archive(&self.path, e))?;
                        (stored, Compression::Zstd, data.len() as u64)
                    }
                };
                out.write_all(&stored).with_path(&self.path)?;
                new_toc.push((
                    hash,
                    ResourceSpec {
                        offset,
                        stored_size: stored.len() as u64,
                        original_size,
                        compression,
                    },
                ));
                offset += stored.len() as u64;
            }
            write_container_tail(out, offset, &new_toc, &images, &self.path)?;
            out.sync_all().with_path(&self.path)?;
        }

        tmp.persist(&self.path)
            .map_err(|e| WimError::archive(&self.path, e.error))?;
        if let Ok(dir) = File::open(&parent) {
            let _ = dir.sync_all();
        }

        self.file = File::open(&self.path).with_path(&self.path)?;
        self.toc = new_toc;
        self.images = images;
        debug!(path = %self.path.display(), "archive rewritten");

        if check_integrity {
            self.verify()?;
        }
        Ok(())
    }

    /// Re-reads every decodable resource and checks it against its hash.
    pub fn verify(&mut self) -> Result<()> {
        for (hash, spec) in self.toc.clone() {
            if matches!(spec.compression, Compression::Xpress | Compression::Lzx) {
                continue;
            }
            let bytes = self.read_resource_to_vec(&spec)?;
            if sha1_bytes(&bytes) != hash {
                return Err(WimError::Format(format!(
                    "integrity check failed for resource {hash}"
                )));
            }
        }
        Ok(())
    }
}

fn read_region(file: &mut File, start: u64, end: u64, path: &Path) -> Result<Vec<u8>> {
    if end < start {
        return Err(WimError::Format("regions out of order".into()));
    }
    file.seek(SeekFrom::Start(start)).with_path(path)?;
    let mut bytes = vec![0u8; (end - start) as usize];
    file.read_exact(&mut bytes).with_path(path)?;
    Ok(bytes)
}

/// Writes toc + images + final header onto `out`, whose resource region ends
/// at `toc_offset`.
fn write_container_tail(
    out: &mut File,
    toc_offset: u64,
    toc: &[(StreamHash, ResourceSpec)],
    images: &[ImageRecord],
    path: &Path,
) -> Result<()> {
    let toc_bytes = encode_toc(toc);
    out.write_all(&toc_bytes).with_path(path)?;
    let images_offset = toc_offset + toc_bytes.len() as u64;
    out.write_all(&encode_images(images)).with_path(path)?;

    let mut header = Vec::with_capacity(HEADER_LEN);
    header.extend_from_slice(MAGIC);
    header.extend_from_slice(&VERSION.to_le_bytes());
    header.extend_from_slice(&toc_offset.to_le_bytes());
    header.extend_from_slice(&images_offset.to_le_bytes());
    header.extend_from_slice(&(images.len() as u32).to_le_bytes());
    out.seek(SeekFrom::Start(0)).with_path(path)?;
    out.write_all(&header).with_path(path)?;
    out.seek(SeekFrom::End(0)).with_path(path)?;
    Ok(())
}

fn encode_toc(toc: &[(StreamHash, ResourceSpec)]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(4 + toc.len() * (HASH_SIZE + 25));
    buf.extend_from_slice(&(toc.len() as u32).to_le_bytes());
    for (hash, spec) in toc {
        buf.extend_from_slice(hash.as_bytes());
        buf.extend_from_slice(&spec.offset.to_le_bytes());
        buf.extend_from_slice(&spec.stored_size.to_le_bytes());
        buf.extend_from_slice(&spec.original_size.to_le_bytes());
        buf.push(spec.compression.to_u8());
    }
    buf
}

fn decode_toc(bytes: &[u8]) -> Result<Vec<(StreamHash, ResourceSpec)>> {
    let mut r = Reader::new(bytes);
    let count = r.u32()? as usize;
    let mut toc = Vec::with_capacity(count);
    for _ in 0..count {
        let hash = r.hash()?;
        let offset = r.u64()?;
        let stored_size = r.u64()?;
        let original_size = r.u64()?;
        let compression = Compression::from_u8(r.u8()?)?;
        toc.push((
            hash,
            ResourceSpec {
                offset,
                stored_size,
                original_size,
                compression,
            },
        ));
    }
    Ok(toc)
}

fn encode_images(images: &[ImageRecord]) -> Vec<u8> {
    let mut buf = Vec::new();
    for record in images {
        put_str(&mut buf, &record.info.name);
        buf.extend_from_slice(&record.info.dir_count.to_le_bytes());
        buf.extend_from_slice(&record.info.file_count.to_le_bytes());
        buf.extend_from_slice(&record.info.total_bytes.to_le_bytes());
        buf.push(record.info.modified as u8);
        buf.extend_from_slice(&(record.tree_blob.len() as u32).to_le_bytes());
        buf.extend_from_slice(&record.tree_blob);
    }
    buf
}

fn decode_images(bytes: &[u8], count: usize) -> Result<Vec<ImageRecord>> {
    let mut r = Reader::new(bytes);
    let mut images = Vec::with_capacity(count);
    for _ in 0..count {
        let name = r.string()?;
        let dir_count = r.u64()?;
        let file_count = r.u64()?;
        let total_bytes = r.u64()?;
        let modified = r.u8()? != 0;
        let blob_len = r.u32()? as usize;
        let tree_blob = r.bytes(blob_len)?.to_vec();
        images.push(ImageRecord {
            info: ImageInfo {
                name,
                dir_count,
                file_count,
                total_bytes,
                modified,
            },
            tree_blob,
        });
    }
    Ok(images)
}

fn nanos_since_epoch(t: SystemTime) -> u64 {
    t.duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos().min(u64::MAX as u128) as u64)
        .unwrap_or(0)
}

fn time_from_nanos(nanos: u64) -> SystemTime {
    UNIX_EPOCH + Duration::from_nanos(nanos)
}

fn encode_tree(tree: &DentryTree) -> Vec<u8> {
    let mut buf = Vec::new();
    encode_dentry(&mut buf, tree, ROOT_DENTRY);
    buf
}

fn encode_dentry(buf: &mut Vec<u8>, tree: &DentryTree, id: DentryId) {
    let dentry = match tree.get(id) {
        Ok(d) => d,
        Err(_) => return,
    };
    put_str(buf, dentry.name.to_string_lossy().as_ref());
    put_bytes16(buf, &dentry.name_utf16);
    buf.extend_from_slice(&dentry.attributes.to_le_bytes());
    buf.extend_from_slice(&dentry.reparse_tag.to_le_bytes());
    for t in [
        dentry.times.created,
        dentry.times.accessed,
        dentry.times.written,
        dentry.times.changed,
    ] {
        buf.extend_from_slice(&nanos_since_epoch(t).to_le_bytes());
    }
    buf.extend_from_slice(dentry.hash.as_bytes());
    buf.extend_from_slice(&dentry.link_group.to_le_bytes());
    buf.push(matches!(dentry.link_role, LinkRole::Slave) as u8);
    buf.extend_from_slice(&(dentry.ads.len() as u16).to_le_bytes());
    for ads in &dentry.ads {
        put_str(buf, ads.name.to_string_lossy().as_ref());
        put_bytes16(buf, &ads.name_utf16);
        buf.extend_from_slice(ads.hash.as_bytes());
    }
    buf.extend_from_slice(&(dentry.children.len() as u32).to_le_bytes());
    for &child in &dentry.children {
        encode_dentry(buf, tree, child);
    }
}

fn decode_tree(blob: &[u8]) -> Result<DentryTree> {
    let mut tree = DentryTree::new();
    let mut r = Reader::new(blob);
    decode_dentry(&mut r, &mut tree, None)?;
    Ok(tree)
}

fn decode_dentry(r: &mut Reader<'_>, tree: &mut DentryTree, parent: Option<DentryId>) -> Result<()> {
    let name = r.string()?;
    let name_utf16 = {
        let len = r.u16()? as usize;
        r.bytes(len)?.to_vec()
    };
    let attributes = r.u32()?;
    let reparse_tag = r.u32()?;
    let times = Timestamps {
        created: time_from_nanos(r.u64()?),
        accessed: time_from_nanos(r.u64()?),
        written: time_from_nanos(r.u64()?),
        changed: time_from_nanos(r.u64()?),
    };
    let hash = r.hash()?;
    let link_group = r.u64()?;
    let link_role = if r.u8()? != 0 {
        LinkRole::Slave
    } else {
        LinkRole::Master
    };
    let ads_count = r.u16()? as usize;
    let mut ads = Vec::with_capacity(ads_count);
    for _ in 0..ads_count {
        let ads_name = r.string()?;
        let ads_len = r.u16()? as usize;
        let ads_utf16 = r.bytes(ads_len)?.to_vec();
        let ads_hash = r.hash()?;
        ads.push(crate::dentry::AdsEntry {
            name: ads_name.into(),
            name_utf16: ads_utf16,
            hash: ads_hash,
        });
    }
    let child_count = r.u32()? as usize;

    let id = match parent {
        None => {
            // the root record overwrites the pre-seeded root dentry
            let root = tree.get_mut(ROOT_DENTRY)?;
            root.attributes = attributes;
            root.times = times;
            root.hash = hash;
            root.ads = ads;
            root.link_group = link_group;
            ROOT_DENTRY
        }
        Some(parent) => {
            let id = tree.insert_loaded(Dentry {
                name: std::ffi::OsString::from(name),
                name_utf16,
                parent: None,
                children: Vec::new(),
                attributes,
                reparse_tag,
                times,
                hash,
                ads,
                link_group,
                link_role,
                open_count: 0,
            });
            tree.link_child(parent, id)?;
            id
        }
    };

    for _ in 0..child_count {
        decode_dentry(r, tree, Some(id))?;
    }
    Ok(())
}

fn put_str(buf: &mut Vec<u8>, s: &str) {
    buf.extend_from_slice(&(s.len() as u16).to_le_bytes());
    buf.extend_from_slice(s.as_bytes());
}

fn put_bytes16(buf: &mut Vec<u8>, bytes: &[u8]) {
    buf.extend_from_slice(&(bytes.len() as u16).to_le_bytes());
    buf.extend_from_slice(bytes);
}

struct Reader<'a> {
    buf: &'a [u8],
    off: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, off: 0 }
    }

    fn bytes(&mut self, len: usize) -> Result<&'a [u8]> {
        if self.buf.len() < self.off + len {
            return Err(WimError::Format("truncated archive region".into()));
        }
        let out = &self.buf[self.off..self.off + len];
        self.off += len;
        Ok(out)
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.bytes(1)?[0])
    }

    fn u16(&mut self) -> Result<u16> {
        let b = self.bytes(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    fn u32(&mut self) -> Result<u32> {
        let b = self.bytes(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn u64(&mut self) -> Result<u64> {
        let b = self.bytes(8)?;
        let mut raw = [0u8; 8];
        raw.copy_from_slice(b);
        Ok(u64::from_le_bytes(raw))
    }

    fn string(&mut self) -> Result<String> {
        let len = self.u16()? as usize;
        let raw = self.bytes(len)?;
        String::from_utf8(raw.to_vec()).map_err(|_| WimError::Format("bad name encoding".into()))
    }

    fn hash(&mut self) -> Result<StreamHash> {
        let raw = self.bytes(HASH_SIZE)?;
        let mut bytes = [0u8; HASH_SIZE];
        bytes.copy_from_slice(raw);
        Ok(StreamHash::from_bytes(bytes))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dentry::{FILE_ATTRIBUTE_DIRECTORY, FILE_ATTRIBUTE_NORMAL};
    use std::ffi::OsStr;

    fn staged(dir: &Path, name: &str, data: &[u8]) -> (PathBuf, StreamHash) {
        let path = dir.join(name);
        let mut file = File::create(&path).unwrap();
        file.write_all(data).unwrap();
        (path, sha1_bytes(data))
    }

    #[test]
    fn create_then_open_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty.wim");
        WimArchive::create(&path, "base").unwrap();

        let archive = WimArchive::open(&path).unwrap();
        assert_eq!(archive.image_count(), 1);
        assert_eq!(archive.image_info(1).unwrap().name, "base");
        let loaded = archive.select_image(1).unwrap();
        assert!(loaded.tree.get(ROOT_DENTRY).unwrap().children.is_empty());
    }

    #[test]
    fn overwrite_persists_tree_and_resources() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.wim");
        let mut archive = WimArchive::create(&path, "img").unwrap();

        let mut tree = DentryTree::new();
        let sub = tree
            .new_node(OsStr::new("docs"), FILE_ATTRIBUTE_DIRECTORY)
            .unwrap();
        tree.link_child(ROOT_DENTRY, sub).unwrap();
        let file = tree
            .new_node(OsStr::new("readme"), FILE_ATTRIBUTE_NORMAL)
            .unwrap();
        let (staged_path, hash) = staged(dir.path(), "blob", b"archive me");
        tree.get_mut(file).unwrap().hash = hash;
        tree.link_child(sub, file).unwrap();

        let info = ImageInfo {
            name: "img".into(),
            dir_count: 1,
            file_count: 1,
            total_bytes: 10,
            modified: true,
        };
        let streams = vec![CommitStream {
            hash,
            original_size: 10,
            source: StreamSource::StagedFile(staged_path),
        }];
        archive.overwrite(1, &info, &tree, &streams, true).unwrap();

        let mut reopened = WimArchive::open(&path).unwrap();
        let loaded = reopened.select_image(1).unwrap();
        assert_eq!(loaded.info.file_count, 1);
        let (id, _) = loaded.tree.resolve(OsStr::new("/docs/readme"), false).unwrap();
        let spec = reopened
            .resource_spec(loaded.tree.get(id).unwrap().hash)
            .unwrap();
        assert_eq!(spec.compression, Compression::Zstd);
        assert_eq!(reopened.read_resource_to_vec(&spec).unwrap(), b"archive me");
    }

    #[test]
    fn read_resource_clamps_and_skips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.wim");
        let mut archive = WimArchive::create(&path, "img").unwrap();

        let mut tree = DentryTree::new();
        let file = tree
            .new_node(OsStr::new("f"), FILE_ATTRIBUTE_NORMAL)
            .unwrap();
        let (staged_path, hash) = staged(dir.path(), "blob", b"0123456789");
        tree.get_mut(file).unwrap().hash = hash;
        tree.link_child(ROOT_DENTRY, file).unwrap();
        let info = archive.image_info(1).unwrap().clone();
        archive
            .overwrite(
                1,
                &info,
                &tree,
                &[CommitStream {
                    hash,
                    original_size: 10,
                    source: StreamSource::StagedFile(staged_path),
                }],
                false,
            )
            .unwrap();

        let spec = archive.resource_spec(hash).unwrap();
        let mut buf = [0u8; 4];
        assert_eq!(archive.read_resource(&spec, 8, &mut buf).unwrap(), 2);
        assert_eq!(&buf[..2], b"89");
        assert_eq!(archive.read_resource(&spec, 10, &mut buf).unwrap(), 0);
    }

    #[test]
    fn foreign_compression_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.wim");
        let mut archive = WimArchive::create(&path, "img").unwrap();
        let spec = ResourceSpec {
            offset: 0,
            stored_size: 4,
            original_size: 4,
            compression: Compression::Lzx,
        };
        let mut buf = [0u8; 4];
        assert!(matches!(
            archive.read_resource(&spec, 0, &mut buf),
            Err(WimError::UnsupportedCompression(Compression::Lzx))
        ));
    }

    #[test]
    fn bad_magic_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("junk");
        fs::write(&path, b"not an archive at all........").unwrap();
        assert!(matches!(
            WimArchive::open(&path),
            Err(WimError::Format(_))
        ));
    }
}
