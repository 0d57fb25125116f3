use std::os::fd::BorrowedFd;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{Context, Result};
use nix::poll::{PollFd, PollFlags, PollTimeout};
use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;

use crate::config::{FdConfig, WorkDirs};
use crate::conn::ConnectionTable;
use crate::dellog::DeleteLog;
use crate::dispatch::burst::AckPending;
use crate::dispatch::{self, StartOutcome};
use crate::errqueue::ErrorQueue;
use crate::fifo::{
    CMD_CHECK_FSA_ENTRIES, CMD_FLUSH_MSG_FIFO_DUMP_QUEUE, CMD_FORCE_REMOTE_DIR_CHECK,
    CMD_FSA_ABOUT_TO_CHANGE, CMD_QUICK_STOP, CMD_REREAD_LOC_INTERFACE_FILE, CMD_SAVE_STOP,
    CMD_STOP, Fifo,
};
use crate::fra::RetrieveDir;
use crate::fsa::HostStatus;
use crate::ingest;
use crate::maintenance;
use crate::mdb::{CachedJob, MDB_CHUNK};
use crate::msg::MAX_MSG_NAME_LENGTH;
use crate::queue::{self, MSG_QUE_BUF_SIZE, ProcState, QueueEntry, SpecialFlags};
use crate::reaper::{self, Zombie};
use crate::region::Region;
use crate::status::{DaemonStatus, open_status};

/// At most this many queue entries are examined per tick; with a longer
/// queue the walk rotates its start offset so the tail cannot starve.
pub const DISPATCH_BATCH: usize = 200;

/// Soft shutdown waits this long for running transfers to finish.
pub const FD_TIMEOUT: i64 = 600;
/// Hard shutdown escalates to SIGKILL after this bound.
pub const FD_QUICK_TIMEOUT: i64 = 20;

const FRA_QUEUE_CHECK_TIME: i64 = 300;
const ABNORMAL_TERM_CHECK_INTERVAL: i64 = 45;
const MESSAGE_RESCAN_TIME: i64 = 600;
const ACK_EXPIRE_CHECK_TIME: i64 = 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Running,
    /// stop admitting work, wait for children
    SaveStop { since: i64 },
    /// interrupt children, bounded wait, then kill
    QuickStop { since: i64, interrupted: bool },
}

/// The distribution core: all shared tables, the connection table, FIFOs
/// and the per-tick bookkeeping of the single-threaded event loop.
pub struct Engine {
    pub cfg: FdConfig,
    pub dirs: WorkDirs,
    pub debug: bool,

    pub fsa: Region<HostStatus>,
    pub fra: Region<RetrieveDir>,
    pub qb: Region<QueueEntry>,
    pub mdb: Region<CachedJob>,
    pub ack: Region<AckPending>,
    pub stat: Region<DaemonStatus>,

    pub conns: ConnectionTable,
    pub errq: ErrorQueue,
    pub zombies: Vec<Zombie>,
    pub dellog: DeleteLog,
    pub local_interfaces: Vec<String>,

    pub command_fifo: Fifo,
    pub msg_fifo: Fifo,
    pub finish_fifo: Fifo,
    pub retry_fifo: Fifo,
    pub delete_fifo: Fifo,
    pub trl_fifo: Fifo,
    pub ack_fifo: Fifo,

    /// LRU-1 cache of the last job-id lookup
    pub mdb_memo: Option<(u32, usize)>,
    pub max_connections_reached: bool,
    pub dispatch_offset: usize,
    pub state: RunState,
    pub last_fsa_generation: u8,

    next_remote_check: i64,
    next_fra_audit: i64,
    next_abnormal_check: i64,
    next_msg_rescan: i64,
    next_ack_expire: i64,

    term_flag: Arc<AtomicBool>,
    int_flag: Arc<AtomicBool>,
    hup_flag: Arc<AtomicBool>,
}

impl Engine {
    pub fn new(cfg: FdConfig, dirs: WorkDirs, debug: bool) -> Result<Engine> {
        dirs.ensure()?;
        let fsa = Region::open_active(&dirs.fsa_file(), 16)?;
        let fra = Region::open_active(&dirs.fra_file(), 16)?;
        let qb = Region::open_active(&dirs.queue_file(), MSG_QUE_BUF_SIZE)?;
        let mdb = Region::open_active(&dirs.mdb_file(), MDB_CHUNK)?;
        let ack = Region::open_active(&dirs.ack_file(), 50)?;
        let stat = open_status(&dirs.daemon_status_file())?;

        let command_fifo = Fifo::open(&dirs.command_fifo())?;
        let msg_fifo = Fifo::open(&dirs.msg_fifo())?;
        let finish_fifo = Fifo::open(&dirs.finish_fifo())?;
        let retry_fifo = Fifo::open(&dirs.retry_fifo())?;
        let delete_fifo = Fifo::open(&dirs.delete_fifo())?;
        let trl_fifo = Fifo::open(&dirs.trl_fifo())?;
        let ack_fifo = Fifo::open(&dirs.ack_fifo())?;

        let dellog = DeleteLog::new(dirs.delete_log());
        let local_interfaces = load_local_interfaces(&dirs);
        let conns = ConnectionTable::new(cfg.max_connections);
        let last_fsa_generation = fsa.generation();

        let now = crate::util::now();
        let mut engine = Engine {
            cfg,
            dirs,
            debug,
            fsa,
            fra,
            qb,
            mdb,
            ack,
            stat,
            conns,
            errq: ErrorQueue::new(),
            zombies: Vec::new(),
            dellog,
            local_interfaces,
            command_fifo,
            msg_fifo,
            finish_fifo,
            retry_fifo,
            delete_fifo,
            trl_fifo,
            ack_fifo,
            mdb_memo: None,
            max_connections_reached: false,
            dispatch_offset: 0,
            state: RunState::Running,
            last_fsa_generation,
            next_remote_check: now,
            next_fra_audit: now + FRA_QUEUE_CHECK_TIME,
            next_abnormal_check: now + ABNORMAL_TERM_CHECK_INTERVAL,
            next_msg_rescan: now + MESSAGE_RESCAN_TIME,
            next_ack_expire: now + ACK_EXPIRE_CHECK_TIME,
            term_flag: Arc::new(AtomicBool::new(false)),
            int_flag: Arc::new(AtomicBool::new(false)),
            hup_flag: Arc::new(AtomicBool::new(false)),
        };
        engine.recover_after_restart();
        Ok(engine)
    }

    pub fn status(&self) -> &DaemonStatus {
        &self.stat.entries()[0]
    }

    pub fn status_mut(&mut self) -> &mut DaemonStatus {
        &mut self.stat.entries_mut()[0]
    }

    /// A previous instance may have died with children recorded as running.
    /// None of those pids are ours, so every running entry reverts to
    /// pending and all derived counters restart from zero.
    fn recover_after_restart(&mut self) {
        let mut recovered = 0usize;
        let mut pos = 0;
        while pos < self.qb.count() {
            let entry = &mut self.qb.entries_mut()[pos];
            match entry.state() {
                ProcState::Running(_) => {
                    entry.set_pending();
                    entry.set_flag(SpecialFlags::QUEUED_FOR_BURST, false);
                    recovered += 1;
                    pos += 1;
                }
                ProcState::Removed => {
                    queue::remove(&mut self.qb, pos);
                }
                ProcState::Pending => pos += 1,
            }
        }
        let fsa_count = self.fsa.count();
        for pos in 0..fsa_count {
            let host = &mut self.fsa.entries_mut()[pos];
            host.active_transfers = 0;
            host.recalc_trl();
            for js in host.job_status.iter_mut() {
                js.clear();
            }
        }
        self.status_mut().no_of_transfers = 0;
        self.ack.set_count(0);
        if recovered > 0 {
            tracing::info!("recovered {} entries from an unclean shutdown", recovered);
        }
        maintenance::check_fsa_entries(self);
    }

    fn register_signals(&self) -> Result<()> {
        signal_hook::flag::register(signal_hook::consts::SIGTERM, Arc::clone(&self.term_flag))?;
        signal_hook::flag::register(signal_hook::consts::SIGINT, Arc::clone(&self.int_flag))?;
        signal_hook::flag::register(signal_hook::consts::SIGHUP, Arc::clone(&self.hup_flag))?;
        Ok(())
    }

    /// The main loop: a timed poll over all control FIFOs, then a fixed
    /// service order, timers, and one dispatch pass per tick.
    pub fn run(&mut self) -> Result<()> {
        self.register_signals()?;
        tracing::info!(
            "distribution core up, {} hosts, {} queued, max {} connections",
            self.fsa.count(),
            self.qb.count(),
            self.conns.capacity()
        );
        loop {
            self.wait_for_events()?;
            let now = crate::util::now();
            self.handle_signals(now);
            self.service_tick(now);
            if self.shutdown_step(now) {
                break;
            }
            let heartbeat = self.status().heartbeat.wrapping_add(1);
            self.status_mut().heartbeat = heartbeat;
        }
        self.sync_all();
        tracing::info!("distribution core down");
        Ok(())
    }

    fn wait_for_events(&mut self) -> Result<()> {
        let fds: Vec<std::os::fd::RawFd> = vec![
            self.command_fifo.raw_fd(),
            self.finish_fifo.raw_fd(),
            self.ack_fifo.raw_fd(),
            self.retry_fifo.raw_fd(),
            self.msg_fifo.raw_fd(),
            self.delete_fifo.raw_fd(),
            self.trl_fifo.raw_fd(),
        ];
        let mut poll_fds: Vec<PollFd> = fds
            .iter()
            .map(|fd| PollFd::new(unsafe { BorrowedFd::borrow_raw(*fd) }, PollFlags::POLLIN))
            .collect();
        match nix::poll::poll(&mut poll_fds, PollTimeout::from(1000u16)) {
            Ok(_) => Ok(()),
            Err(nix::errno::Errno::EINTR) => Ok(()),
            Err(e) => Err(e).context("poll on control fifos"),
        }
    }

    fn handle_signals(&mut self, now: i64) {
        if self.hup_flag.swap(false, Ordering::Relaxed) {
            match FdConfig::load(&self.dirs.conf_file()) {
                Ok(cfg) => {
                    if cfg.max_connections != self.conns.capacity() {
                        tracing::warn!(
                            "MAX_CONNECTIONS changed {} -> {}, effective on restart",
                            self.conns.capacity(),
                            cfg.max_connections
                        );
                    }
                    self.cfg = cfg;
                    tracing::info!("configuration reloaded");
                }
                Err(err) => tracing::error!("config reload failed: {}", err),
            }
        }
        if self.int_flag.swap(false, Ordering::Relaxed) {
            self.enter_quick_stop(now);
        }
        if self.term_flag.swap(false, Ordering::Relaxed) && self.state == RunState::Running {
            tracing::info!("termination requested, draining transfers");
            self.state = RunState::SaveStop { since: now };
        }
    }

    fn enter_quick_stop(&mut self, now: i64) {
        if !matches!(self.state, RunState::QuickStop { .. }) {
            tracing::info!("quick stop requested");
            self.state = RunState::QuickStop { since: now, interrupted: false };
        }
    }

    fn service_tick(&mut self, now: i64) {
        // fixed service order: command, termination, burst ack, retry,
        // new messages, delete, trl recalc
        self.service_command_fifo(now);
        reaper::service_finish_fifo(self, now);
        self.service_ack_fifo();
        maintenance::service_retry_fifo(self, now);
        if self.state == RunState::Running {
            ingest::service_msg_fifo(self, now);
        }
        maintenance::service_delete_fifo(self, now);
        maintenance::service_trl_fifo(self);

        maintenance::resync_fsa(self);

        if self.state == RunState::Running && now >= self.next_remote_check {
            ingest::synth_fetch_jobs(self, now);
            self.next_remote_check = now + self.cfg.remote_file_check_interval;
        }
        if now >= self.next_fra_audit {
            maintenance::audit_fra_queue(self);
            self.next_fra_audit = now + FRA_QUEUE_CHECK_TIME;
        }
        if now >= self.next_abnormal_check {
            reaper::zombie_check(self, now);
            maintenance::reconcile_empty_queue(self);
            maintenance::interrupt_stuck_transfers(self, now);
            self.errq.expire(now);
            self.sync_all();
            self.next_abnormal_check = now + ABNORMAL_TERM_CHECK_INTERVAL;
        }
        if now >= self.next_msg_rescan {
            maintenance::rescan_message_files(self);
            self.next_msg_rescan = now + MESSAGE_RESCAN_TIME;
        }
        if self.cfg.burst_ack_queue && now >= self.next_ack_expire {
            maintenance::expire_stale_acks(self, now);
            self.next_ack_expire = now + ACK_EXPIRE_CHECK_TIME;
        }

        if self.state == RunState::Running {
            dispatch_walk(self, now);
        }
    }

    fn service_command_fifo(&mut self, now: i64) {
        for byte in self.command_fifo.drain_bytes() {
            match byte {
                CMD_SAVE_STOP | CMD_STOP => {
                    if self.state == RunState::Running {
                        tracing::info!("stop command received, draining transfers");
                        self.state = RunState::SaveStop { since: now };
                    }
                }
                CMD_QUICK_STOP => self.enter_quick_stop(now),
                CMD_CHECK_FSA_ENTRIES => maintenance::check_fsa_entries(self),
                CMD_FORCE_REMOTE_DIR_CHECK => {
                    self.next_remote_check = now;
                }
                CMD_FLUSH_MSG_FIFO_DUMP_QUEUE => {
                    ingest::service_msg_fifo(self, now);
                    self.sync_all();
                }
                CMD_FSA_ABOUT_TO_CHANGE => {
                    // sync so the configurator sees our latest counters; the
                    // generation bump afterwards triggers the resync
                    tracing::info!("host table about to change");
                    self.sync_all();
                }
                CMD_REREAD_LOC_INTERFACE_FILE => {
                    self.local_interfaces = load_local_interfaces(&self.dirs);
                    tracing::info!("local interface list reloaded ({})", self.local_interfaces.len());
                }
                other => {
                    tracing::warn!("unknown command byte {} ignored", other);
                }
            }
        }
    }

    /// Worker acks on the dedicated FIFO confirm a burst assimilation; the
    /// handed entry can finally leave the queue.
    fn service_ack_fifo(&mut self) {
        let (records, _) = self.ack_fifo.drain_records::<MAX_MSG_NAME_LENGTH>();
        for name in records {
            if !crate::dispatch::burst::ack_remove(&mut self.ack, &name) {
                tracing::debug!(
                    "ack for unknown handoff {}",
                    crate::msg::msg_name_str(&name)
                );
                continue;
            }
            let count = self.qb.count();
            if let Some(pos) = self.qb.entries()[..count].iter().position(|q| {
                q.msg_name == name && q.flags().contains(SpecialFlags::QUEUED_FOR_BURST)
            }) {
                queue::remove(&mut self.qb, pos);
            }
        }
    }

    /// Progress the shutdown state machine; true once the loop may exit.
    fn shutdown_step(&mut self, now: i64) -> bool {
        match self.state {
            RunState::Running => false,
            RunState::SaveStop { since } => {
                if self.status().no_of_transfers == 0 {
                    return true;
                }
                if now - since > FD_TIMEOUT {
                    tracing::warn!(
                        "{} transfers still running after {}s, escalating",
                        self.status().no_of_transfers,
                        FD_TIMEOUT
                    );
                    self.enter_quick_stop(now);
                }
                false
            }
            RunState::QuickStop { since, interrupted } => {
                if !interrupted {
                    for (_, conn) in self.conns.live() {
                        let _ = kill(Pid::from_raw(conn.pid), Signal::SIGINT);
                    }
                    self.state = RunState::QuickStop { since, interrupted: true };
                    return false;
                }
                if self.status().no_of_transfers == 0 {
                    return true;
                }
                if now - since > FD_QUICK_TIMEOUT {
                    for (_, conn) in self.conns.live() {
                        tracing::warn!("killing straggler {}", conn.pid);
                        let _ = kill(Pid::from_raw(conn.pid), Signal::SIGKILL);
                    }
                    reaper::zombie_check(self, now);
                    return true;
                }
                false
            }
        }
    }

    pub fn sync_all(&self) {
        for r in [self.fsa.sync(), self.fra.sync(), self.qb.sync(), self.mdb.sync(), self.ack.sync(), self.stat.sync()] {
            if let Err(err) = r {
                tracing::warn!("region sync failed: {}", err);
            }
        }
    }
}

fn load_local_interfaces(dirs: &WorkDirs) -> Vec<String> {
    match std::fs::read_to_string(dirs.local_interface_file()) {
        Ok(text) => text
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty() && !l.starts_with('#'))
            .map(str::to_string)
            .collect(),
        Err(_) => Vec::new(),
    }
}

/// One dispatch pass: walk the queue in key order and hand every pending
/// entry to the dispatcher. Short queues always start at the head; past
/// `DISPATCH_BATCH` entries the start offset rotates between ticks.
pub fn dispatch_walk(e: &mut Engine, now: i64) {
    let count = e.qb.count();
    if count == 0 {
        e.dispatch_offset = 0;
        return;
    }
    let rotating = count > DISPATCH_BATCH;
    let mut pos = if rotating { e.dispatch_offset % count } else { 0 };
    let mut examined = 0usize;
    let mut wrapped = false;
    while examined < DISPATCH_BATCH {
        let count = e.qb.count();
        if count == 0 {
            break;
        }
        if pos >= count {
            if wrapped || !rotating {
                break;
            }
            pos = 0;
            wrapped = true;
            continue;
        }
        examined += 1;
        let entry = e.qb.entries()[pos];
        match entry.state() {
            ProcState::Removed => {
                queue::remove(&mut e.qb, pos);
                // the shift pulled the next entry into this position
            }
            ProcState::Running(_) => pos += 1,
            ProcState::Pending => {
                if entry.flags().contains(SpecialFlags::QUEUED_FOR_BURST) {
                    pos += 1;
                    continue;
                }
                match dispatch::start_process(e, pos, now, false) {
                    StartOutcome::Removed => queue::remove(&mut e.qb, pos),
                    StartOutcome::Bursted(_) => {
                        if e.cfg.burst_ack_queue {
                            pos += 1;
                        } else {
                            queue::remove(&mut e.qb, pos);
                        }
                    }
                    StartOutcome::Started(_) | StartOutcome::Pending => pos += 1,
                }
            }
        }
    }
    e.dispatch_offset = if rotating { pos } else { 0 };
}

/// Dispatch everything queued for one host right now, bypassing the retry
/// window; answers the retry FIFO.
pub fn dispatch_host(e: &mut Engine, fsa_pos: i32, now: i64) {
    let mut pos = 0;
    while pos < e.qb.count() {
        let entry = e.qb.entries()[pos];
        if entry.state() != ProcState::Pending
            || entry.flags().contains(SpecialFlags::QUEUED_FOR_BURST)
        {
            pos += 1;
            continue;
        }
        let entry_fsa = if entry.is_fetch() {
            e.fra.entries().get(entry.pos as usize).map(|d| d.fsa_pos).unwrap_or(-1)
        } else {
            e.mdb.entries().get(entry.pos as usize).map(|j| j.fsa_pos).unwrap_or(-1)
        };
        if entry_fsa != fsa_pos {
            pos += 1;
            continue;
        }
        match dispatch::start_process(e, pos, now, true) {
            StartOutcome::Removed => queue::remove(&mut e.qb, pos),
            StartOutcome::Bursted(_) => {
                if e.cfg.burst_ack_queue {
                    pos += 1;
                } else {
                    queue::remove(&mut e.qb, pos);
                }
            }
            StartOutcome::Started(_) | StartOutcome::Pending => pos += 1,
        }
    }
}
