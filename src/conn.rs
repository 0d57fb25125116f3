use crate::fsa::{HostStatus, Protocol};
use crate::msg::MAX_MSG_NAME_LENGTH;

/// One running worker child. A slot is free iff `hostname` is empty.
#[derive(Debug, Clone)]
pub struct Connection {
    pub hostname: String,
    pub host_id: u32,
    pub fsa_pos: i32,
    /// -1 for send jobs
    pub fra_pos: i32,
    pub protocol: Option<Protocol>,
    /// remote port for send jobs, -1 for fetch
    pub port: i32,
    /// per-host parallel slot index, -1 when unassigned
    pub job_no: i32,
    pub msg_name: [u8; MAX_MSG_NAME_LENGTH],
    pub dir_alias: String,
    pub pid: i32,
    pub resend: bool,
    pub helper: bool,
    pub temp_toggle: bool,
    /// when the worker was forked, for the stuck-transfer sweep
    pub started: i64,
}

impl Connection {
    fn empty() -> Self {
        Connection {
            hostname: String::new(),
            host_id: 0,
            fsa_pos: -1,
            fra_pos: -1,
            protocol: None,
            port: -1,
            job_no: -1,
            msg_name: [0; MAX_MSG_NAME_LENGTH],
            dir_alias: String::new(),
            pid: 0,
            resend: false,
            helper: false,
            temp_toggle: false,
            started: 0,
        }
    }

    pub fn is_free(&self) -> bool {
        self.hostname.is_empty()
    }
}

/// Fixed-capacity table mapping running children to (host, protocol,
/// job slot, queue entry). Sized once at startup from `max_connections`.
pub struct ConnectionTable {
    slots: Vec<Connection>,
}

impl ConnectionTable {
    pub fn new(max_connections: usize) -> Self {
        ConnectionTable { slots: vec![Connection::empty(); max_connections.max(1)] }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn get(&self, pos: usize) -> Option<&Connection> {
        self.slots.get(pos)
    }

    pub fn get_mut(&mut self, pos: usize) -> Option<&mut Connection> {
        self.slots.get_mut(pos)
    }

    /// Linear scan for a free slot.
    pub fn alloc(&mut self) -> Option<usize> {
        self.slots.iter().position(Connection::is_free)
    }

    pub fn find_by_pid(&self, pid: i32) -> Option<usize> {
        self.slots.iter().position(|c| !c.is_free() && c.pid == pid)
    }

    pub fn live(&self) -> impl Iterator<Item = (usize, &Connection)> {
        self.slots.iter().enumerate().filter(|(_, c)| !c.is_free() && c.pid > 0)
    }

    pub fn live_count(&self) -> usize {
        self.slots.iter().filter(|c| !c.is_free()).count()
    }

    /// Tear down a slot and zero the host's matching job_status area.
    pub fn release(&mut self, pos: usize, host: Option<&mut HostStatus>) {
        if let Some(slot) = self.slots.get_mut(pos) {
            if let (Some(h), true) = (host, slot.job_no >= 0) {
                if let Some(js) = h.job_status.get_mut(slot.job_no as usize) {
                    js.clear();
                }
            }
            *slot = Connection::empty();
        }
    }
}

/// Free per-host parallel slot: the first job_status index whose owner pid
/// is -1, within the host's allowed window.
pub fn free_job_slot(host: &HostStatus) -> Option<usize> {
    (0..host.allowed()).find(|&i| host.job_status[i].proc_id == -1)
}

/// The single-retrieve rule: refuse a second fetch against a dir a running
/// child already holds.
pub fn retrieve_in_progress(host: &HostStatus, dir_id: u32) -> bool {
    (0..host.allowed()).any(|i| {
        host.job_status[i].proc_id != -1 && host.job_status[i].job_id == dir_id
    })
}
