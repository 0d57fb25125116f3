use bitflags::bitflags;

use crate::msg::MAX_MSG_NAME_LENGTH;
use crate::region::{Region, RegionEntry};

pub const QB_VERSION: u8 = 4;
/// Queue region growth chunk, in entries.
pub const MSG_QUE_BUF_SIZE: usize = 1000;

/// `pid` sentinel: entry waits for dispatch.
pub const PID_PENDING: i32 = -2;
/// `pid` sentinel: entry is dead and awaits compaction.
pub const PID_REMOVED: i32 = -3;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SpecialFlags: u8 {
        const FETCH_JOB        = 0x01;
        const HELPER_JOB       = 0x02;
        const RESEND_JOB       = 0x04;
        const QUEUED_FOR_BURST = 0x08;
    }
}

/// What the raw `pid` field means right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcState {
    Pending,
    Removed,
    Running(i32),
}

/// One pending or running work item in the queue buffer.
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct QueueEntry {
    pub msg_name: [u8; MAX_MSG_NAME_LENGTH],
    /// sort key; lower dispatches first
    pub msg_number: f64,
    pub creation_time: i64,
    pub file_size_to_send: u64,
    /// index into the message cache (send) or the retrieve table (fetch)
    pub pos: i32,
    pub pid: i32,
    /// connection table slot while running, -1 otherwise
    pub connect_pos: i32,
    pub retries: u32,
    pub files_to_send: u32,
    pub special_flag: u8,
    pub _pad: [u8; 3],
}

impl RegionEntry for QueueEntry {
    const VERSION: u8 = QB_VERSION;
}

impl QueueEntry {
    pub fn state(&self) -> ProcState {
        match self.pid {
            PID_PENDING => ProcState::Pending,
            PID_REMOVED => ProcState::Removed,
            p => ProcState::Running(p),
        }
    }

    pub fn set_pending(&mut self) {
        self.pid = PID_PENDING;
        self.connect_pos = -1;
    }

    pub fn flags(&self) -> SpecialFlags {
        SpecialFlags::from_bits_truncate(self.special_flag)
    }

    pub fn set_flag(&mut self, flag: SpecialFlags, on: bool) {
        let mut f = self.flags();
        f.set(flag, on);
        self.special_flag = f.bits();
    }

    pub fn is_fetch(&self) -> bool {
        self.flags().contains(SpecialFlags::FETCH_JOB)
    }
}

/// Queue key. Priority is one ASCII digit; subtracting `'/'` keeps even the
/// highest priority (`'0'`) strictly positive so aging can still raise it.
pub fn msg_number(priority: u8, creation_time: i64, unique_number: u32, split_job_counter: u32) -> f64 {
    let pri = (priority as i32 - '/' as i32) as f64;
    pri * ((creation_time as f64) * 10_000.0 + unique_number as f64 + split_job_counter as f64)
}

/// Synthetic key for retrieve jobs; no unique/split component exists, the
/// dir priority and synthesis time alone yield age-weighted order.
pub fn fetch_msg_number(priority: u8, now: i64) -> f64 {
    let pri = (priority as i32 - '/' as i32) as f64;
    pri * (now as f64) * 10_000.0
}

#[derive(Debug, Clone, Copy)]
pub struct AgeingEntry {
    pub before_threshold: f64,
    pub after_threshold: f64,
    pub retry_threshold: u32,
}

/// Aging lookup indexed by the job's `ageing` value. Index 0 disables
/// aging entirely; higher indices penalize repeat offenders harder.
pub const AGEING_TABLE: [AgeingEntry; 10] = [
    AgeingEntry { before_threshold: 0.0, after_threshold: 0.0, retry_threshold: 0 },
    AgeingEntry { before_threshold: 1.0e4, after_threshold: 1.0e-5, retry_threshold: 10 },
    AgeingEntry { before_threshold: 1.0e5, after_threshold: 1.0e-4, retry_threshold: 10 },
    AgeingEntry { before_threshold: 1.0e6, after_threshold: 1.0e-3, retry_threshold: 8 },
    AgeingEntry { before_threshold: 1.0e7, after_threshold: 1.0e-2, retry_threshold: 8 },
    AgeingEntry { before_threshold: 1.0e8, after_threshold: 1.0e-1, retry_threshold: 6 },
    AgeingEntry { before_threshold: 1.0e9, after_threshold: 1.0, retry_threshold: 6 },
    AgeingEntry { before_threshold: 1.0e10, after_threshold: 10.0, retry_threshold: 4 },
    AgeingEntry { before_threshold: 1.0e11, after_threshold: 100.0, retry_threshold: 4 },
    AgeingEntry { before_threshold: 1.0e12, after_threshold: 1000.0, retry_threshold: 2 },
];

/// Sorted insertion. Four cases by queue length: empty, single-entry
/// compare, endpoint, binary search with a suffix shift.
pub fn insert(qb: &mut Region<QueueEntry>, entry: QueueEntry) -> anyhow::Result<usize> {
    let count = qb.count();
    if count == qb.capacity() {
        qb.grow(MSG_QUE_BUF_SIZE)?;
    }
    let key = entry.msg_number;
    let entries = qb.entries_mut();
    let idx = if count == 0 {
        0
    } else if count == 1 {
        if key < entries[0].msg_number { 0 } else { 1 }
    } else if key < entries[0].msg_number {
        0
    } else if key >= entries[count - 1].msg_number {
        count
    } else {
        entries[..count].partition_point(|e| e.msg_number <= key)
    };
    entries.copy_within(idx..count, idx + 1);
    entries[idx] = entry;
    qb.set_count(count + 1);
    Ok(idx)
}

/// Left-shift removal keeps the sort order; swap-with-last would not.
/// Queue positions are never persisted elsewhere, callers re-derive them
/// from `pid` when needed.
pub fn remove(qb: &mut Region<QueueEntry>, pos: usize) {
    let count = qb.count();
    if pos >= count {
        return;
    }
    let entries = qb.entries_mut();
    entries.copy_within(pos + 1..count, pos);
    qb.set_count(count - 1);
}

/// Apply the aging penalty after a retryable failure and re-sort the entry
/// in place by sliding it right. Returns the entry's new position.
pub fn age_entry(qb: &mut Region<QueueEntry>, pos: usize, ageing: u8, now: i64) -> usize {
    let count = qb.count();
    if pos >= count || ageing == 0 {
        return pos;
    }
    let table = &AGEING_TABLE[(ageing as usize).min(AGEING_TABLE.len() - 1)];
    let entries = qb.entries_mut();
    let e = &mut entries[pos];
    if e.retries < table.retry_threshold {
        e.msg_number += table.before_threshold;
    } else {
        e.msg_number += e.creation_time as f64
            * table.after_threshold
            * (e.retries + 1 - table.retry_threshold) as f64;
    }
    let ceiling = now as f64 * 2.0e5;
    if e.msg_number > ceiling {
        e.msg_number = ceiling;
    }
    let mut i = pos;
    while i + 1 < count && entries[i + 1].msg_number < entries[i].msg_number {
        entries.swap(i, i + 1);
        i += 1;
    }
    i
}

/// Re-derive a queue position from a live child pid (linear scan).
pub fn find_by_pid(qb: &Region<QueueEntry>, pid: i32) -> Option<usize> {
    let count = qb.count();
    qb.entries()[..count].iter().position(|e| e.pid == pid)
}

/// Find the pending fetch entry for a retrieve dir, for the queue audit.
pub fn find_fetch(qb: &Region<QueueEntry>, fra_pos: i32) -> Option<usize> {
    let count = qb.count();
    qb.entries()[..count]
        .iter()
        .position(|e| e.is_fetch() && e.pos == fra_pos && e.pid != PID_REMOVED)
}

pub fn is_sorted(qb: &Region<QueueEntry>) -> bool {
    let count = qb.count();
    qb.entries()[..count].windows(2).all(|w| w[0].msg_number <= w[1].msg_number)
}

/// Blank entry with the pending sentinel and no connection.
pub fn blank_entry() -> QueueEntry {
    let mut e: QueueEntry = unsafe { std::mem::zeroed() };
    e.pid = PID_PENDING;
    e.connect_pos = -1;
    e
}
