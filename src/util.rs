use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

/// Wall-clock seconds since the epoch. The queue key formula and all retry
/// arithmetic work on this value, so it is funnelled through one place.
pub fn now() -> i64 {
    match SystemTime::now().duration_since(UNIX_EPOCH) {
        Ok(d) => d.as_secs() as i64,
        Err(_) => 0,
    }
}

/// Hard link count of a directory. The monitor throttles the message
/// generator when the outgoing directory approaches LINK_MAX.
pub fn link_count(path: &Path) -> u64 {
    use std::os::unix::fs::MetadataExt;
    match std::fs::metadata(path) {
        Ok(md) => md.nlink(),
        Err(_) => 0,
    }
}

/// Copy a str into a fixed-size NUL padded buffer, truncating if needed.
/// The last byte is always left as NUL.
pub fn set_fixed_str(buf: &mut [u8], s: &str) {
    let bytes = s.as_bytes();
    let n = bytes.len().min(buf.len().saturating_sub(1));
    buf[..n].copy_from_slice(&bytes[..n]);
    for b in &mut buf[n..] {
        *b = 0;
    }
}

/// Read a NUL terminated str back out of a fixed-size buffer.
pub fn fixed_str(buf: &[u8]) -> &str {
    let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    std::str::from_utf8(&buf[..end]).unwrap_or("")
}
