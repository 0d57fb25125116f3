use bitflags::bitflags;

use crate::msg::MAX_MSG_NAME_LENGTH;
use crate::region::{Region, RegionEntry};
use crate::util::{fixed_str, set_fixed_str};

pub const MAX_HOSTNAME_LENGTH: usize = 40;
pub const MAX_REAL_HOSTNAME_LENGTH: usize = 64;
/// Upper bound on parallel transfers a single host may be configured for.
pub const MAX_NO_PARALLEL_JOBS: usize = 9;
/// Ring of the most recent worker exit codes per host.
pub const ERROR_HISTORY_LENGTH: usize = 5;

pub const FSA_VERSION: u8 = 3;
const FSA_CHUNK: usize = 16;

/// Transfer protocols the dispatcher knows worker binaries for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum Protocol {
    Ftp = 1,
    Sftp = 2,
    Http = 4,
    Smtp = 8,
    Scp = 16,
    Loc = 32,
    Exec = 64,
}

impl Protocol {
    pub fn from_bits(bits: u32) -> Option<Protocol> {
        use Protocol::*;
        [Ftp, Sftp, Http, Smtp, Scp, Loc, Exec].into_iter().find(|p| *p as u32 == bits)
    }

    pub fn name(self) -> &'static str {
        match self {
            Protocol::Ftp => "ftp",
            Protocol::Sftp => "sftp",
            Protocol::Http => "http",
            Protocol::Smtp => "smtp",
            Protocol::Scp => "scp",
            Protocol::Loc => "loc",
            Protocol::Exec => "exec",
        }
    }
}

bitflags! {
    /// Host level state bits mirrored to the control UI and the workers.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct HostFlags: u32 {
        const PAUSE_QUEUE       = 0x01;
        const STOP_TRANSFER     = 0x02;
        const HOST_DISABLED     = 0x04;
        const HOST_OFFLINE      = 0x08;
        const ERROR_QUEUE_SET   = 0x10;
        const AUTO_PAUSE_QUEUE  = 0x20;
        const SIMULATE_SEND     = 0x40;
        const DO_NOT_DELETE     = 0x80;
    }
}

bitflags! {
    /// Per-host scheduling options.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ProtocolOptions: u32 {
        const DISABLE_BURSTING   = 0x01;
        const NO_AGEING_JOBS     = 0x02;
        const KEEP_CON_NO_SEND   = 0x04;
        const KEEP_CON_NO_FETCH  = 0x08;
        const FILE_WHEN_LOCAL    = 0x10;
        const USE_HW_CRC         = 0x20;
    }
}

/// Published state of one per-host worker slot. The worker owns the slot
/// while running and flips `state` to signal the burst handshake; the core
/// writes the slot only when assigning or tearing down work.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SlotState {
    Idle = 0,
    Running = 1,
    ReadyForMoreWork = 5,
    RestartRequested = 6,
}

impl SlotState {
    pub fn from_u8(v: u8) -> SlotState {
        match v {
            1 => SlotState::Running,
            5 => SlotState::ReadyForMoreWork,
            6 => SlotState::RestartRequested,
            _ => SlotState::Idle,
        }
    }
}

/// Shared handoff area between the core and one worker process.
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct JobStatus {
    /// pid of the worker owning this slot, -1 when free
    pub proc_id: i32,
    /// `SlotState` byte, the burst handshake
    pub state: u8,
    /// worker sets this once its file list is published and it can take
    /// handed-off work without a rescan
    pub name_in_use: u8,
    pub _pad: [u8; 2],
    pub job_id: u32,
    pub unique_name: [u8; MAX_MSG_NAME_LENGTH],
    pub file_size_in_use: u64,
    pub bytes_send: u64,
}

impl JobStatus {
    pub fn clear(&mut self) {
        self.proc_id = -1;
        self.state = SlotState::Idle as u8;
        self.name_in_use = 0;
        self.job_id = 0;
        self.unique_name = [0; MAX_MSG_NAME_LENGTH];
        self.file_size_in_use = 0;
        self.bytes_send = 0;
    }

    pub fn slot_state(&self) -> SlotState {
        SlotState::from_u8(self.state)
    }
}

/// One destination host in the filetransfer status area.
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct HostStatus {
    pub host_alias: [u8; MAX_HOSTNAME_LENGTH],
    /// real hostnames; two entries when a failover twin is configured
    pub real_hostname: [[u8; MAX_REAL_HOSTNAME_LENGTH]; 2],
    pub host_id: u32,
    /// 1-based index into `real_hostname` currently dispatched to
    pub host_toggle: u8,
    /// original toggle before an automatic switch, 0 when not switched
    pub original_toggle_pos: u8,
    pub auto_toggle: u8,
    pub _pad0: u8,
    /// bitset of protocols configured for this host (`Protocol` bits)
    pub protocol: u32,
    pub port: i32,
    pub allowed_transfers: i32,
    pub active_transfers: i32,
    pub jobs_queued: u32,
    pub error_counter: i32,
    pub error_history: [u8; ERROR_HISTORY_LENGTH],
    pub _pad1: [u8; 3],
    pub first_error_time: i64,
    pub last_retry_time: i64,
    pub retry_interval: i64,
    pub max_successful_retries: i32,
    pub successful_retries: i32,
    pub transfer_rate_limit: i64,
    pub trl_per_process: i64,
    pub host_status: u32,
    pub protocol_options: u32,
    pub job_status: [JobStatus; MAX_NO_PARALLEL_JOBS],
}

impl RegionEntry for HostStatus {
    const VERSION: u8 = FSA_VERSION;
}

impl HostStatus {
    pub fn alias(&self) -> &str {
        fixed_str(&self.host_alias)
    }

    pub fn flags(&self) -> HostFlags {
        HostFlags::from_bits_truncate(self.host_status)
    }

    pub fn set_flag(&mut self, flag: HostFlags, on: bool) {
        let mut f = self.flags();
        f.set(flag, on);
        self.host_status = f.bits();
    }

    pub fn options(&self) -> ProtocolOptions {
        ProtocolOptions::from_bits_truncate(self.protocol_options)
    }

    /// The hostname transfers currently go to, honouring the toggle.
    pub fn active_hostname(&self) -> &str {
        let idx = if self.host_toggle == 2 { 1 } else { 0 };
        fixed_str(&self.real_hostname[idx])
    }

    pub fn allowed(&self) -> usize {
        (self.allowed_transfers.clamp(0, MAX_NO_PARALLEL_JOBS as i32)) as usize
    }

    /// Push the latest exit code into the history ring (newest first).
    pub fn record_exit(&mut self, code: u8) {
        for i in (1..ERROR_HISTORY_LENGTH).rev() {
            self.error_history[i] = self.error_history[i - 1];
        }
        self.error_history[0] = code;
    }

    /// Split the configured transfer rate limit across active processes.
    pub fn recalc_trl(&mut self) {
        self.trl_per_process = if self.active_transfers > 0 {
            self.transfer_rate_limit / self.active_transfers as i64
        } else {
            self.transfer_rate_limit
        };
    }
}

/// Append a new host record; used by tests and the bootstrap path, the
/// production table is written by the external configurator.
pub fn add_host(
    fsa: &mut Region<HostStatus>,
    alias: &str,
    real: &str,
    protocol: Protocol,
    allowed_transfers: i32,
) -> anyhow::Result<usize> {
    let mut entry: HostStatus = unsafe { std::mem::zeroed() };
    set_fixed_str(&mut entry.host_alias, alias);
    set_fixed_str(&mut entry.real_hostname[0], real);
    entry.host_id = host_id_of(alias);
    entry.host_toggle = 1;
    entry.protocol = protocol as u32;
    entry.allowed_transfers = allowed_transfers.clamp(1, MAX_NO_PARALLEL_JOBS as i32);
    entry.retry_interval = 120;
    entry.max_successful_retries = 3;
    for slot in entry.job_status.iter_mut() {
        slot.clear();
    }
    fsa.push(entry, FSA_CHUNK)
}

/// Stable id derived from the alias, used to correlate across regions when
/// positions shift under a resize.
pub fn host_id_of(alias: &str) -> u32 {
    // FNV-1a, the same everywhere an alias needs a compact id
    let mut h: u32 = 0x811c_9dc5;
    for b in alias.as_bytes() {
        h ^= *b as u32;
        h = h.wrapping_mul(0x0100_0193);
    }
    h
}

/// Find a host by alias, for position re-derivation after a resize.
pub fn find_host(fsa: &Region<HostStatus>, alias: &str) -> Option<usize> {
    let count = fsa.count();
    fsa.entries()[..count].iter().position(|h| h.alias() == alias)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_history_shifts_right() {
        let mut h: HostStatus = unsafe { std::mem::zeroed() };
        h.record_exit(21);
        h.record_exit(22);
        assert_eq!(h.error_history[0], 22);
        assert_eq!(h.error_history[1], 21);
    }

    #[test]
    fn trl_split_per_process() {
        let mut h: HostStatus = unsafe { std::mem::zeroed() };
        h.transfer_rate_limit = 9000;
        h.active_transfers = 3;
        h.recalc_trl();
        assert_eq!(h.trl_per_process, 3000);
        h.active_transfers = 0;
        h.recalc_trl();
        assert_eq!(h.trl_per_process, 9000);
    }

    #[test]
    fn host_id_is_stable_and_distinct() {
        assert_eq!(host_id_of("alpha"), host_id_of("alpha"));
        assert_ne!(host_id_of("alpha"), host_id_of("beta"));
    }

    #[test]
    fn toggle_selects_second_hostname() {
        let mut h: HostStatus = unsafe { std::mem::zeroed() };
        crate::util::set_fixed_str(&mut h.real_hostname[0], "primary.example");
        crate::util::set_fixed_str(&mut h.real_hostname[1], "backup.example");
        h.host_toggle = 1;
        assert_eq!(h.active_hostname(), "primary.example");
        h.host_toggle = 2;
        assert_eq!(h.active_hostname(), "backup.example");
    }
}
