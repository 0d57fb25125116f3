use std::path::{Path, PathBuf};

use crate::fsa::MAX_HOSTNAME_LENGTH;
use crate::region::{Region, RegionEntry};
use crate::util::{fixed_str, set_fixed_str};

pub const MDB_VERSION: u8 = 5;
pub const MDB_CHUNK: usize = 50;

/// Persistent per-job descriptor in the message cache. Appended the first
/// time an unknown job id shows up on the message FIFO; refreshed when the
/// periodic scan notices the message file changed on disk.
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct CachedJob {
    pub job_id: u32,
    pub fsa_pos: i32,
    /// `Protocol` bits of the send protocol
    pub protocol: u32,
    pub port: i32,
    /// seconds a queued job may wait before it is discarded, 0 = forever
    pub age_limit: u32,
    /// index into the aging table
    pub ageing: u8,
    pub in_current_fsa: u8,
    pub no_archive: u8,
    pub _pad: u8,
    pub last_transfer_time: i64,
    /// mtime of the message file when the descriptor was (re)loaded
    pub msg_time: i64,
    pub host_alias: [u8; MAX_HOSTNAME_LENGTH],
}

impl RegionEntry for CachedJob {
    const VERSION: u8 = MDB_VERSION;
}

impl CachedJob {
    pub fn alias(&self) -> &str {
        fixed_str(&self.host_alias)
    }
}

/// Path of the on-disk message file for a job id.
pub fn message_path(messages_dir: &Path, job_id: u32) -> PathBuf {
    messages_dir.join(format!("{:x}", job_id))
}

/// Resolve `job_id` to a cache position. The last hit is memoized by the
/// caller (LRU-1); this is the linear fallback scan.
pub fn lookup(mdb: &Region<CachedJob>, job_id: u32) -> Option<usize> {
    let count = mdb.count();
    mdb.entries()[..count].iter().position(|j| j.job_id == job_id)
}

/// Append a descriptor for a job id seen for the first time.
#[allow(clippy::too_many_arguments)]
pub fn append(
    mdb: &mut Region<CachedJob>,
    job_id: u32,
    fsa_pos: i32,
    host_alias: &str,
    protocol: u32,
    port: i32,
    age_limit: u32,
    ageing: u8,
    msg_time: i64,
) -> anyhow::Result<usize> {
    let mut entry: CachedJob = unsafe { std::mem::zeroed() };
    entry.job_id = job_id;
    entry.fsa_pos = fsa_pos;
    entry.protocol = protocol;
    entry.port = port;
    entry.age_limit = age_limit;
    entry.ageing = ageing.min(9);
    entry.in_current_fsa = 1;
    entry.msg_time = msg_time;
    set_fixed_str(&mut entry.host_alias, host_alias);
    mdb.push(entry, MDB_CHUNK)
}

/// Parse the small option block of an on-disk message file. Only the two
/// scheduler-relevant overrides are interpreted here; the rest of the file
/// belongs to the worker.
pub fn parse_message_options(text: &str) -> (Option<u32>, Option<u8>) {
    let mut age_limit = None;
    let mut ageing = None;
    for line in text.lines() {
        let line = line.trim();
        if let Some(v) = line.strip_prefix("age-limit ") {
            age_limit = v.trim().parse::<u32>().ok();
        } else if let Some(v) = line.strip_prefix("ageing ") {
            ageing = v.trim().parse::<u8>().ok().map(|a| a.min(9));
        }
    }
    (age_limit, ageing)
}
