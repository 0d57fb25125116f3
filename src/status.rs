use std::path::Path;

use owo_colors::OwoColorize;
use serde::{Deserialize, Serialize};

use crate::config::WorkDirs;
use crate::fsa::HostStatus;
use crate::queue::QueueEntry;
use crate::region::{Region, RegionEntry, RegionView};

pub const STATUS_VERSION: u8 = 1;

/// Global flag bits in the daemon status record.
pub const STATUS_DISABLE_RETRIEVE: u32 = 0x01;
pub const STATUS_AMG_PAUSED: u32 = 0x02;

/// Single-entry region with the daemon's global counters. Because the
/// record is memory-mapped, a crash loses at most the not-yet-flushed page;
/// the monitor additionally snapshots it as JSON on clean shutdown so the
/// numbers survive a region format bump.
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct DaemonStatus {
    /// incremented once per engine tick, watched by the monitor
    pub heartbeat: u32,
    pub flags: u32,
    pub no_of_transfers: i32,
    pub max_queue_length: u32,
    pub burst2_counter: u64,
    pub files_send: u64,
    pub bytes_send: u64,
    pub files_retrieved: u64,
    pub jobs_removed: u64,
    pub fork_counter: u64,
    pub start_time: i64,
}

impl RegionEntry for DaemonStatus {
    const VERSION: u8 = STATUS_VERSION;
}

pub fn open_status(path: &Path) -> anyhow::Result<Region<DaemonStatus>> {
    let mut region = Region::open_active(path, 1)?;
    if region.count() == 0 {
        let mut entry: DaemonStatus = unsafe { std::mem::zeroed() };
        entry.start_time = crate::util::now();
        region.push(entry, 1)?;
    }
    Ok(region)
}

/// Machine-independent snapshot written by the monitor on shutdown.
#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct StatusSnapshot {
    pub heartbeat: u32,
    pub no_of_transfers: i32,
    pub max_queue_length: u32,
    pub burst2_counter: u64,
    pub files_send: u64,
    pub bytes_send: u64,
    pub files_retrieved: u64,
    pub jobs_removed: u64,
    pub fork_counter: u64,
    pub start_time: i64,
    pub stop_time: i64,
}

impl StatusSnapshot {
    pub fn from_region(status: &DaemonStatus) -> Self {
        StatusSnapshot {
            heartbeat: status.heartbeat,
            no_of_transfers: status.no_of_transfers,
            max_queue_length: status.max_queue_length,
            burst2_counter: status.burst2_counter,
            files_send: status.files_send,
            bytes_send: status.bytes_send,
            files_retrieved: status.files_retrieved,
            jobs_removed: status.jobs_removed,
            fork_counter: status.fork_counter,
            start_time: status.start_time,
            stop_time: crate::util::now(),
        }
    }

    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        let text = serde_json::to_string_pretty(self)?;
        std::fs::write(path, text)?;
        Ok(())
    }
}

/// Lifetime byte counters grow without bound, so the report scales them
/// through the IEC ladder instead of printing raw digits.
fn fmt_byte_counter(bytes: u64) -> String {
    if bytes < 1024 {
        return format!("{} B", bytes);
    }
    let mut value = bytes as f64 / 1024.0;
    let mut unit = "KiB";
    for next in ["MiB", "GiB", "TiB"] {
        if value < 1024.0 {
            break;
        }
        value /= 1024.0;
        unit = next;
    }
    format!("{:.2} {}", value, unit)
}

/// One-shot console report over passive attachments; never blocks or
/// resizes anything the daemon owns.
pub fn print_report(dirs: &WorkDirs) -> anyhow::Result<()> {
    let stat: RegionView<DaemonStatus> = RegionView::attach_passive(&dirs.daemon_status_file())?;
    let s = stat.entries()[0];
    println!(
        "{}  transfers:{}  queued-max:{}  bursts:{}  forks:{}",
        "fdist".green().bold(),
        s.no_of_transfers,
        s.max_queue_length,
        s.burst2_counter,
        s.fork_counter,
    );
    println!(
        "files sent: {}  bytes sent: {}  retrieved: {}  removed: {}",
        s.files_send,
        fmt_byte_counter(s.bytes_send),
        s.files_retrieved,
        s.jobs_removed,
    );

    let queued = match RegionView::<QueueEntry>::attach_passive(&dirs.queue_file()) {
        Ok(qb) => qb.count(),
        Err(_) => 0,
    };
    println!("queue depth: {}", queued);

    let fsa: RegionView<HostStatus> = match RegionView::attach_passive(&dirs.fsa_file()) {
        Ok(v) => v,
        Err(_) => {
            println!("(no host table yet)");
            return Ok(());
        }
    };
    let count = fsa.count();
    if count == 0 {
        println!("(host table empty)");
        return Ok(());
    }
    println!(
        "{:<20} {:>6} {:>7} {:>7} {:>7}  {}",
        "HOST".cyan(),
        "ACTIVE".cyan(),
        "ALLOW".cyan(),
        "QUEUED".cyan(),
        "ERRORS".cyan(),
        "STATUS".cyan()
    );
    for host in &fsa.entries()[..count] {
        let flags = host.flags();
        let mut state = String::new();
        if flags.contains(crate::fsa::HostFlags::HOST_DISABLED) {
            state.push_str("disabled ");
        }
        if flags.contains(crate::fsa::HostFlags::STOP_TRANSFER) {
            state.push_str("stopped ");
        }
        if flags.contains(crate::fsa::HostFlags::PAUSE_QUEUE) {
            state.push_str("paused ");
        }
        if flags.contains(crate::fsa::HostFlags::HOST_OFFLINE) {
            state.push_str("offline ");
        }
        if flags.contains(crate::fsa::HostFlags::ERROR_QUEUE_SET) {
            state.push_str("error-queue ");
        }
        if state.is_empty() {
            state.push_str("ok");
        }
        println!(
            "{:<20} {:>6} {:>7} {:>7} {:>7}  {}",
            host.alias(),
            host.active_transfers,
            host.allowed_transfers,
            host.jobs_queued,
            host.error_counter,
            state.trim_end()
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn byte_counter_climbs_the_unit_ladder() {
        assert_eq!(fmt_byte_counter(512), "512 B");
        assert_eq!(fmt_byte_counter(2048), "2.00 KiB");
        assert_eq!(fmt_byte_counter(3 * 1024 * 1024), "3.00 MiB");
        assert_eq!(fmt_byte_counter(5 * 1024 * 1024 * 1024), "5.00 GiB");
        assert_eq!(fmt_byte_counter(2 * 1024 * 1024 * 1024 * 1024), "2.00 TiB");
    }
}
