use std::fmt;
use std::fs::File;
use std::io::{self, Read};
use std::path::Path;

use rand::RngCore;
use sha1::{Digest, Sha1};

pub const HASH_SIZE: usize = 20;

/// SHA-1 content hash keying the resource catalog.
///
/// The all-zero hash is reserved for empty streams, which have no catalog
/// entry at all.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StreamHash([u8; HASH_SIZE]);

impl StreamHash {
    pub const ZERO: StreamHash = StreamHash([0u8; HASH_SIZE]);

    pub fn from_bytes(bytes: [u8; HASH_SIZE]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; HASH_SIZE] {
        &self.0
    }

    pub fn is_zero(&self) -> bool {
        *self == Self::ZERO
    }

    /// Placeholder identity for a staged stream; replaced by the real
    /// content hash when the mount commits.
    pub fn random() -> Self {
        let mut bytes = [0u8; HASH_SIZE];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self(bytes)
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for StreamHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl fmt::Debug for StreamHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "StreamHash({})", &self.to_hex()[..12])
    }
}

pub fn sha1_bytes(data: &[u8]) -> StreamHash {
    let digest = Sha1::digest(data);
    StreamHash(digest.into())
}

/// Content hasher collaborator: SHA-1 over the contents of a named file.
pub fn sha1_file(path: &Path) -> io::Result<StreamHash> {
    let mut file = File::open(path)?;
    let mut hasher = Sha1::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(StreamHash(hasher.finalize().into()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn zero_hash_is_zero() {
        assert!(StreamHash::ZERO.is_zero());
        assert!(!sha1_bytes(b"").is_zero());
    }

    #[test]
    fn bytes_hash_deterministic() {
        assert_eq!(sha1_bytes(b"hello"), sha1_bytes(b"hello"));
        assert_ne!(sha1_bytes(b"hello"), sha1_bytes(b"world"));
    }

    #[test]
    fn file_hash_matches_bytes_hash() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data");
        let mut file = File::create(&path).unwrap();
        file.write_all(b"some stream contents").unwrap();
        drop(file);

        assert_eq!(
            sha1_file(&path).unwrap(),
            sha1_bytes(b"some stream contents")
        );
    }

    #[test]
    fn random_placeholders_distinct() {
        let a = StreamHash::random();
        let b = StreamHash::random();
        assert_ne!(a, b);
        assert!(!a.is_zero());
    }

    #[test]
    fn hex_display() {
        let h = sha1_bytes(b"abc");
        assert_eq!(h.to_hex().len(), HASH_SIZE * 2);
        assert_eq!(format!("{h}"), h.to_hex());
    }
}
