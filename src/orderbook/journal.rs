//! Confirmation journal framing.
//!
//! One framed record per event, little-endian:
//! `u32 seq | u16 len | u16 sub_account_id | u8 exec_type | body | '\0' | '\n'`
//! where `len` counts only the body.

use crate::core::{Error, Result};

pub const HEADER_LEN: usize = 4 + 2 + 2 + 1;

#[derive(Debug, Clone, PartialEq)]
pub struct RawRecord<'a> {
    pub seq: u32,
    pub sub_account_id: u16,
    pub exec_type: u8,
    pub body: &'a str,
}

pub fn encode(seq: u32, sub_account_id: u16, exec_type: u8, body: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(HEADER_LEN + body.len() + 2);
    out.extend_from_slice(&seq.to_le_bytes());
    out.extend_from_slice(&(body.len() as u16).to_le_bytes());
    out.extend_from_slice(&sub_account_id.to_le_bytes());
    out.push(exec_type);
    out.extend_from_slice(body.as_bytes());
    out.push(0);
    out.push(b'\n');
    out
}

/// Scan every record in `bytes`. A truncated or malformed tail is a
/// corruption error; the operator must fix the file before retry.
pub fn scan(bytes: &[u8]) -> Result<Vec<RawRecord<'_>>> {
    let mut records = vec![];
    let mut pos = 0usize;
    while pos < bytes.len() {
        if bytes.len() - pos < HEADER_LEN {
            return Err(Error::Journal(format!(
                "truncated record header at offset {}",
                pos
            )));
        }
        let seq = u32::from_le_bytes(bytes[pos..pos + 4].try_into().unwrap());
        let len = u16::from_le_bytes(bytes[pos + 4..pos + 6].try_into().unwrap()) as usize;
        let sub_account_id = u16::from_le_bytes(bytes[pos + 6..pos + 8].try_into().unwrap());
        let exec_type = bytes[pos + 8];
        let body_start = pos + HEADER_LEN;
        let record_end = body_start + len + 2;
        if record_end > bytes.len() {
            return Err(Error::Journal(format!(
                "truncated record body at offset {}",
                pos
            )));
        }
        if bytes[record_end - 2] != 0 || bytes[record_end - 1] != b'\n' {
            return Err(Error::Journal(format!(
                "bad record terminator at offset {}",
                pos
            )));
        }
        let body = std::str::from_utf8(&bytes[body_start..body_start + len])
            .map_err(|_| Error::Journal(format!("non-utf8 body at offset {}", pos)))?;
        records.push(RawRecord {
            seq,
            sub_account_id,
            exec_type,
            body,
        });
        pos = record_end;
    }
    Ok(records)
}

/// Split `body` into `n` leading whitespace tokens plus the rest of the
/// line (free text may itself contain spaces).
pub fn split_tokens(body: &str, n: usize) -> Option<(Vec<&str>, &str)> {
    let mut tokens = Vec::with_capacity(n);
    let mut rest = body;
    for _ in 0..n {
        let trimmed = rest.trim_start();
        let end = trimmed
            .find(char::is_whitespace)
            .unwrap_or(trimmed.len());
        if trimmed.is_empty() {
            return None;
        }
        tokens.push(&trimmed[..end]);
        rest = &trimmed[end..];
    }
    Some((tokens, rest.trim_start()))
}
