//! Clock helpers shared by the journals, throttles, and session handling.

use std::time::{SystemTime, UNIX_EPOCH};

pub const SECONDS_PER_DAY: i64 = 24 * 3600;

/// UTC now in whole seconds since the epoch.
pub fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// UTC now in microseconds since the epoch. Transaction times are carried
/// in this resolution end to end.
pub fn now_utc_micros() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as i64)
        .unwrap_or(0)
}

/// Seconds since midnight in a zone `utc_offset` seconds east of UTC.
pub fn seconds_since_midnight(utc_offset: i32) -> i32 {
    let n = unix_now() % SECONDS_PER_DAY;
    ((n + i64::from(utc_offset) + SECONDS_PER_DAY) % SECONDS_PER_DAY) as i32
}

/// Hex-encoded SHA-1 digest, used for password hashes and the reference
/// checksum.
pub fn sha1_hex(input: &str) -> String {
    use sha1::{Digest, Sha1};
    let mut h = Sha1::new();
    h.update(input.as_bytes());
    let out = h.finalize();
    let mut s = String::with_capacity(out.len() * 2);
    for b in out {
        s.push_str(&format!("{:02x}", b));
    }
    s
}
