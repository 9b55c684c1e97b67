//! Reparse-point codec for symlink dentries.
//!
//! A symlink's target is serialized into its primary stream as a symlink
//! reparse buffer: tag, length header, substitute/print name table, then the
//! UTF-16LE path buffer holding the target once.

use std::ffi::{OsStr, OsString};

use crate::error::{Result, WimError};
use crate::names;

pub const IO_REPARSE_TAG_SYMLINK: u32 = 0xA000_000C;

/// Relative-target flag in the symlink reparse data.
const SYMLINK_FLAG_RELATIVE: u32 = 0x0000_0001;

const HEADER_LEN: usize = 4 + 2 + 2;
const DATA_HEADER_LEN: usize = 2 + 2 + 2 + 2 + 4;

pub fn encode(target: &OsStr) -> Result<Vec<u8>> {
    let path = names::encode_utf16le(target)?;
    if path.len() > u16::MAX as usize {
        return Err(WimError::BadName);
    }
    let flags = if target.to_string_lossy().starts_with('/') {
        0
    } else {
        SYMLINK_FLAG_RELATIVE
    };

    let data_len = DATA_HEADER_LEN + path.len();
    let mut buf = Vec::with_capacity(HEADER_LEN + data_len);
    buf.extend_from_slice(&IO_REPARSE_TAG_SYMLINK.to_le_bytes());
    buf.extend_from_slice(&(data_len as u16).to_le_bytes());
    buf.extend_from_slice(&0u16.to_le_bytes());
    // substitute name offset/len, print name offset/len
    buf.extend_from_slice(&0u16.to_le_bytes());
    buf.extend_from_slice(&(path.len() as u16).to_le_bytes());
    buf.extend_from_slice(&0u16.to_le_bytes());
    buf.extend_from_slice(&(path.len() as u16).to_le_bytes());
    buf.extend_from_slice(&flags.to_le_bytes());
    buf.extend_from_slice(&path);
    Ok(buf)
}

pub fn decode(blob: &[u8]) -> Result<OsString> {
    if blob.len() < HEADER_LEN + DATA_HEADER_LEN {
        return Err(WimError::Format("short reparse buffer".into()));
    }
    let tag = u32::from_le_bytes([blob[0], blob[1], blob[2], blob[3]]);
    if tag != IO_REPARSE_TAG_SYMLINK {
        return Err(WimError::Format(format!(
            "unexpected reparse tag {tag:#010x}"
        )));
    }
    let sub_off = u16::from_le_bytes([blob[8], blob[9]]) as usize;
    let sub_len = u16::from_le_bytes([blob[10], blob[11]]) as usize;
    let path_buffer = &blob[HEADER_LEN + DATA_HEADER_LEN..];
    if sub_off + sub_len > path_buffer.len() {
        return Err(WimError::Format("reparse name out of bounds".into()));
    }
    names::decode_utf16le(&path_buffer[sub_off..sub_off + sub_len])
}
