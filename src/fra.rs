use bitflags::bitflags;

use crate::fsa::Protocol;
use crate::region::{Region, RegionEntry};
use crate::util::{fixed_str, set_fixed_str};

pub const MAX_DIR_ALIAS_LENGTH: usize = 40;
pub const MAX_TIME_ENTRIES: usize = 4;

pub const FRA_VERSION: u8 = 2;
const FRA_CHUNK: usize = 16;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct DirFlags: u32 {
        const DIR_DISABLED = 0x01;
        const DIR_STOPPED  = 0x02;
    }
}

/// One scan window: between `begin_hour` and `end_hour` (inclusive,
/// wall-clock hours) the source is polled every `interval` seconds. The
/// full schedule grammar lives with the external configurator; this is the
/// evaluated form.
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct TimeEntry {
    pub begin_hour: u8,
    pub end_hour: u8,
    pub _pad: [u8; 2],
    pub interval: i32,
}

/// One remote source directory in the fileretrieve status area.
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct RetrieveDir {
    pub dir_alias: [u8; MAX_DIR_ALIAS_LENGTH],
    /// alias of the host the files come from, for position re-derivation
    pub host_alias: [u8; crate::fsa::MAX_HOSTNAME_LENGTH],
    pub dir_id: u32,
    pub fsa_pos: i32,
    /// `Protocol` bits of the fetch protocol
    pub protocol: u32,
    /// ASCII priority digit used for the synthesized queue key
    pub priority: u8,
    /// 1 while a fetch queue entry for this dir exists (audited)
    pub queued: u8,
    pub _pad0: [u8; 2],
    pub dir_flag: u32,
    pub no_of_time_entries: i32,
    pub te: [TimeEntry; MAX_TIME_ENTRIES],
    pub next_check_time: i64,
    pub last_retrieval: i64,
    pub error_counter: i32,
    pub _pad1: [u8; 4],
}

impl RegionEntry for RetrieveDir {
    const VERSION: u8 = FRA_VERSION;
}

impl RetrieveDir {
    pub fn alias(&self) -> &str {
        fixed_str(&self.dir_alias)
    }

    pub fn flags(&self) -> DirFlags {
        DirFlags::from_bits_truncate(self.dir_flag)
    }

    /// Whether the schedule permits a scan right now, and if not, when the
    /// next window opens. No time entries means "scan on every interval
    /// tick".
    pub fn scan_allowed(&self, now: i64) -> bool {
        if self.no_of_time_entries == 0 {
            return true;
        }
        self.next_check_time <= now
    }

    /// Earliest time any window permits the next scan after `now`.
    pub fn compute_next_check(&self, now: i64) -> i64 {
        if self.no_of_time_entries == 0 {
            return now;
        }
        let hour_of = |t: i64| (t % 86_400) / 3_600;
        let n = (self.no_of_time_entries as usize).min(MAX_TIME_ENTRIES);
        let mut best = i64::MAX;
        for te in &self.te[..n] {
            let interval = te.interval.max(1) as i64;
            let hour = hour_of(now);
            let candidate = if hour >= te.begin_hour as i64 && hour <= te.end_hour as i64 {
                // inside the window: next interval boundary
                now + (interval - (now % interval)) % interval.max(1)
            } else {
                // wait for the window to open
                let mut t = now - (now % 3_600) + 3_600;
                while !(hour_of(t) >= te.begin_hour as i64 && hour_of(t) <= te.end_hour as i64) {
                    t += 3_600;
                }
                t
            };
            best = best.min(candidate);
        }
        best
    }
}

/// Append a retrieve directory record; production tables come from the
/// external configurator.
#[allow(clippy::too_many_arguments)]
pub fn add_dir(
    fra: &mut Region<RetrieveDir>,
    alias: &str,
    host_alias: &str,
    dir_id: u32,
    fsa_pos: i32,
    protocol: Protocol,
    priority: u8,
) -> anyhow::Result<usize> {
    let mut entry: RetrieveDir = unsafe { std::mem::zeroed() };
    set_fixed_str(&mut entry.dir_alias, alias);
    set_fixed_str(&mut entry.host_alias, host_alias);
    entry.dir_id = dir_id;
    entry.fsa_pos = fsa_pos;
    entry.protocol = protocol as u32;
    entry.priority = priority;
    fra.push(entry, FRA_CHUNK)
}

pub fn find_dir(fra: &Region<RetrieveDir>, dir_id: u32) -> Option<usize> {
    let count = fra.count();
    fra.entries()[..count].iter().position(|d| d.dir_id == dir_id)
}
