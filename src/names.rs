//! Paired native / archive name encodings.
//!
//! The archive stores names as UTF-16LE while the mounted tree speaks native
//! `OsStr`. Every dentry and ADS entry carries both forms; they are produced
//! together so they can never drift apart.

use std::ffi::{OsStr, OsString};
use std::os::unix::ffi::{OsStrExt, OsStringExt};

use crate::error::{Result, WimError};

pub fn encode_utf16le(name: &OsStr) -> Result<Vec<u8>> {
    let utf8 = name.to_str().ok_or(WimError::BadName)?;
    let mut out = Vec::with_capacity(utf8.len() * 2);
    for unit in utf8.encode_utf16() {
        out.extend_from_slice(&unit.to_le_bytes());
    }
    Ok(out)
}

pub fn decode_utf16le(raw: &[u8]) -> Result<OsString> {
    if raw.len() % 2 != 0 {
        return Err(WimError::BadName);
    }
    let units: Vec<u16> = raw
        .chunks_exact(2)
        .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
        .collect();
    let decoded = String::from_utf16(&units).map_err(|_| WimError::BadName)?;
    Ok(OsString::from(decoded))
}

/// Character-encoding converter collaborator: one name in both encodings.
pub fn name_pair(name: &OsStr) -> Result<(OsString, Vec<u8>)> {
    let encoded = encode_utf16le(name)?;
    Ok((name.to_os_string(), encoded))
}

/// Splits a `file:streamname` component into file part and stream name.
///
/// Returns `None` when the component carries no stream qualifier. Only
/// meaningful in the windows stream-interface mode; other modes treat the
/// colon as an ordinary name byte.
pub fn split_stream(component: &OsStr) -> Option<(OsString, OsString)> {
    let bytes = component.as_bytes();
    let colon = bytes.iter().position(|&b| b == b':')?;
    if colon == 0 || colon == bytes.len() - 1 {
        return None;
    }
    let file = OsString::from_vec(bytes[..colon].to_vec());
    let stream = OsString::from_vec(bytes[colon + 1..].to_vec());
    Some((file, stream))
}
