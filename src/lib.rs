//! wimfs - mount an image from a WIM archive as a live filesystem.
//!
//! A content-addressed, deduplicated archive is projected as a directory
//! tree through FUSE. Read-only mounts serve bytes straight out of the
//! archive; read-write mounts stage diverging streams in a private scratch
//! directory and commit them back into the archive on unmount.

pub mod archive;
pub mod catalog;
pub mod commit;
pub mod dentry;
pub mod error;
pub mod fs;
pub mod handle_table;
pub mod hash;
pub mod names;
pub mod ops;
pub mod reparse;
pub mod staging;
pub mod unmount;
pub mod util;

pub use archive::WimArchive;
pub use error::{Result, WimError};
pub use hash::StreamHash;
pub use ops::{MountConfig, MountContext, StreamInterface};
