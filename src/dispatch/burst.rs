use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;

use crate::engine::Engine;
use crate::fsa::{ProtocolOptions, SlotState};
use crate::msg::MAX_MSG_NAME_LENGTH;
use crate::queue::SpecialFlags;
use crate::region::{Region, RegionEntry};

pub const ACK_VERSION: u8 = 1;
const ACK_CHUNK: usize = 50;
/// An unacknowledged burst handoff older than this is considered lost and
/// its queue entry is restored to pending.
pub const ACK_QUE_TIMEOUT: i64 = 120;

/// One outstanding burst handoff awaiting the worker's assimilation ack.
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct AckPending {
    pub msg_name: [u8; MAX_MSG_NAME_LENGTH],
    pub insert_time: i64,
}

impl RegionEntry for AckPending {
    const VERSION: u8 = ACK_VERSION;
}

pub fn ack_add(ack: &mut Region<AckPending>, msg_name: [u8; MAX_MSG_NAME_LENGTH], now: i64) {
    let entry = AckPending { msg_name, insert_time: now };
    if let Err(e) = ack.push(entry, ACK_CHUNK) {
        tracing::warn!("ack queue grow failed: {}", e);
    }
}

/// Remove the ack entry matching a worker's assimilation report. Unknown
/// names are stale-expired handoffs whose entry was already restored.
pub fn ack_remove(ack: &mut Region<AckPending>, msg_name: &[u8; MAX_MSG_NAME_LENGTH]) -> bool {
    let count = ack.count();
    let entries = ack.entries_mut();
    if let Some(pos) = entries[..count].iter().position(|a| a.msg_name == *msg_name) {
        entries.copy_within(pos + 1..count, pos);
        ack.set_count(count - 1);
        true
    } else {
        false
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BurstAttempt {
    /// Second job handed to the open worker with this pid
    Handed(i32),
    /// No slot matched; one busy worker was asked to restart
    RestartRequested,
    /// Nothing to hand off to
    NoCandidate,
}

/// Try to hand the queue entry at `qb_pos` to a still-open worker on the
/// same host instead of forking. A slot is a candidate once the worker has
/// published its ready-for-more handshake; type matching is fetch↔fetch on
/// the same protocol, send↔send on matching cache type and port.
/// Candidates are taken in slot index order, first match wins.
pub fn try_burst(e: &mut Engine, qb_pos: usize, fsa_pos: usize, now: i64) -> BurstAttempt {
    let entry = e.qb.entries()[qb_pos];
    let is_fetch = entry.flags().contains(SpecialFlags::FETCH_JOB);
    let host = e.fsa.entries()[fsa_pos];

    if host.original_toggle_pos != 0
        || host.options().contains(ProtocolOptions::DISABLE_BURSTING)
        || host.active_transfers <= 0
        || host.jobs_queued == 0
        || entry.flags().contains(SpecialFlags::HELPER_JOB)
    {
        return BurstAttempt::NoCandidate;
    }
    if is_fetch && host.options().contains(ProtocolOptions::KEEP_CON_NO_FETCH) {
        return BurstAttempt::NoCandidate;
    }
    if !is_fetch && host.options().contains(ProtocolOptions::KEEP_CON_NO_SEND) {
        return BurstAttempt::NoCandidate;
    }

    // what the new job needs from the open session
    let (want_protocol, want_port, want_job_id) = if is_fetch {
        let dir = e.fra.entries()[entry.pos as usize];
        (dir.protocol, -1, dir.dir_id)
    } else {
        let job = e.mdb.entries()[entry.pos as usize];
        (job.protocol, job.port, job.job_id)
    };

    let mut ready_slot: Option<usize> = None;
    for slot in 0..host.allowed() {
        let js = &host.job_status[slot];
        if js.proc_id == -1
            || js.slot_state() != SlotState::ReadyForMoreWork
            || js.name_in_use != 1
        {
            continue;
        }
        if ready_slot.is_none() {
            ready_slot = Some(slot);
        }
        let Some(conn_pos) = e
            .conns
            .live()
            .find(|(_, c)| c.fsa_pos == fsa_pos as i32 && c.job_no == slot as i32)
            .map(|(i, _)| i)
        else {
            continue;
        };
        let conn = e.conns.get(conn_pos).unwrap();
        let type_match = if is_fetch {
            conn.fra_pos >= 0 && conn.protocol.map(|p| p as u32) == Some(want_protocol)
        } else {
            conn.fra_pos < 0
                && conn.protocol.map(|p| p as u32) == Some(want_protocol)
                && conn.port == want_port
        };
        if !type_match {
            continue;
        }

        // hand over: publish the new work in the shared slot, then wake the
        // worker if its handshake still shows ready
        let pid = conn.pid;
        let msg_name = entry.msg_name;
        let prev_name;
        let prev_job_id;
        {
            let js = &mut e.fsa.entries_mut()[fsa_pos].job_status[slot];
            prev_name = js.unique_name;
            prev_job_id = js.job_id;
            js.unique_name = msg_name;
            js.job_id = want_job_id;
            if js.slot_state() == SlotState::ReadyForMoreWork
                && kill(Pid::from_raw(pid), Signal::SIGUSR1).is_err()
            {
                // the worker died between its last handshake and our wakeup;
                // undo and let the fork path take this entry
                js.unique_name = prev_name;
                js.job_id = prev_job_id;
                return BurstAttempt::NoCandidate;
            }
        }
        e.conns.get_mut(conn_pos).unwrap().msg_name = msg_name;
        {
            let qe = &mut e.qb.entries_mut()[qb_pos];
            qe.pid = pid;
            qe.set_flag(SpecialFlags::QUEUED_FOR_BURST, true);
        }
        let host_mut = &mut e.fsa.entries_mut()[fsa_pos];
        host_mut.jobs_queued = host_mut.jobs_queued.saturating_sub(1);
        e.status_mut().burst2_counter += 1;
        if e.cfg.burst_ack_queue {
            ack_add(&mut e.ack, msg_name, now);
        }
        return BurstAttempt::Handed(pid);
    }

    // no type match; if the host has no free slot either, ask one open
    // worker to restart so capacity frees up for this job
    if crate::conn::free_job_slot(&host).is_none() {
        if let Some(slot) = ready_slot {
            let host_mut = &mut e.fsa.entries_mut()[fsa_pos];
            let js = &mut host_mut.job_status[slot];
            let pid = js.proc_id;
            js.state = SlotState::RestartRequested as u8;
            if pid > 0 {
                let _ = kill(Pid::from_raw(pid), Signal::SIGUSR1);
            }
            return BurstAttempt::RestartRequested;
        }
    }
    BurstAttempt::NoCandidate
}
