use nix::errno::Errno;
use nix::sys::signal::{Signal, kill};
use nix::sys::wait::{WaitPidFlag, WaitStatus, waitpid};
use nix::unistd::Pid;

use crate::dellog::DeleteReason;
use crate::dispatch::burst::{self, BurstAttempt};
use crate::engine::Engine;
use crate::error::{ExitClass, TransferCode};
use crate::fsa::{HostFlags, ProtocolOptions, SlotState};
use crate::msg::msg_name_str;
use crate::queue::{self, ProcState, SpecialFlags};

/// How long a not-yet-reapable child stays on the zombie-wait list before
/// we log it as stuck (it stays listed, the sweep keeps trying).
const ZOMBIE_COMPLAIN_AFTER: i64 = 60;

/// Outcome of classifying one terminated worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Faulty {
    /// done, entry leaves the queue
    No,
    /// failed, entry requeues and ages
    Yes,
    /// not the host's fault, entry requeues without penalty
    NotFaulty,
    /// child not yet reaped, revisit later
    Neither,
}

#[derive(Debug, Clone, Copy)]
pub struct Zombie {
    pub pid: i32,
    pub since: i64,
    pub complained: bool,
}

/// Service the finish FIFO. Workers write their pid on exit; a negated pid
/// means the worker is alive and soliciting more burst work.
pub fn service_finish_fifo(e: &mut Engine, now: i64) {
    let (records, _) = e.finish_fifo.drain_records::<4>();
    for rec in records {
        let pid = i32::from_le_bytes(rec);
        if pid == 0 {
            continue;
        }
        if pid < 0 {
            solicit_more_work(e, -pid, now);
        } else {
            reap_pid(e, pid, now);
        }
    }
}

/// A still-open worker asked for more work. Hand it a matching queue entry
/// if one exists; with queued work it cannot take, tell it to exit so the
/// fork path gets the capacity.
fn solicit_more_work(e: &mut Engine, pid: i32, now: i64) {
    let Some(conn_pos) = e.conns.find_by_pid(pid) else {
        tracing::debug!("burst solicitation from unknown pid {}", pid);
        return;
    };
    let conn = e.conns.get(conn_pos).unwrap().clone();
    let fsa_pos = conn.fsa_pos;
    if fsa_pos < 0 || fsa_pos as usize >= e.fsa.count() {
        return;
    }

    // first pending entry bound for this host, in key order
    let count = e.qb.count();
    let mut candidate = None;
    for pos in 0..count {
        let entry = e.qb.entries()[pos];
        if entry.state() != ProcState::Pending
            || entry.flags().contains(SpecialFlags::QUEUED_FOR_BURST)
        {
            continue;
        }
        let entry_fsa = if entry.is_fetch() {
            e.fra.entries().get(entry.pos as usize).map(|d| d.fsa_pos)
        } else {
            e.mdb.entries().get(entry.pos as usize).map(|j| j.fsa_pos)
        };
        if entry_fsa == Some(fsa_pos) {
            candidate = Some(pos);
            break;
        }
    }

    match candidate {
        Some(qb_pos) => match burst::try_burst(e, qb_pos, fsa_pos as usize, now) {
            BurstAttempt::Handed(_) => {
                if !e.cfg.burst_ack_queue {
                    queue::remove(&mut e.qb, qb_pos);
                }
            }
            _ => release_waiting_worker(e, fsa_pos as usize, conn.job_no, pid),
        },
        None => {
            // quiescent host, or the soliciting worker is a helper fetch:
            // let it sit until its own force-disconnect fires
            let quiescent = e.fsa.entries()[fsa_pos as usize].jobs_queued == 0;
            if !(quiescent || conn.helper) {
                release_waiting_worker(e, fsa_pos as usize, conn.job_no, pid);
            }
        }
    }
}

/// Empty `unique_name` plus SIGUSR1 is the "no more work, exit cleanly"
/// answer to a soliciting worker.
fn release_waiting_worker(e: &mut Engine, fsa_pos: usize, job_no: i32, pid: i32) {
    if job_no < 0 {
        return;
    }
    if let Some(js) = e.fsa.entries_mut()[fsa_pos].job_status.get_mut(job_no as usize) {
        js.unique_name = [0; crate::msg::MAX_MSG_NAME_LENGTH];
        js.state = SlotState::Running as u8;
    }
    let _ = kill(Pid::from_raw(pid), Signal::SIGUSR1);
}

/// Reap one terminated worker, classify its exit and feed the result back
/// into the queue and host state.
pub fn reap_pid(e: &mut Engine, pid: i32, now: i64) {
    match waitpid(Pid::from_raw(pid), Some(WaitPidFlag::WNOHANG)) {
        Ok(WaitStatus::Exited(_, code)) => process_exit(e, pid, Some(code), None, now),
        Ok(WaitStatus::Signaled(_, sig, _)) => process_exit(e, pid, None, Some(sig), now),
        Ok(WaitStatus::StillAlive) => {
            // termination message raced the actual death; revisit
            if e.zombies.iter().all(|z| z.pid != pid) {
                e.zombies.push(Zombie { pid, since: now, complained: false });
            }
        }
        Ok(_) => {}
        Err(Errno::ECHILD) => {
            // already reaped elsewhere; still tear down our bookkeeping
            if e.conns.find_by_pid(pid).is_some() {
                tracing::warn!("pid {} vanished without a reapable status", pid);
                process_exit(e, pid, Some(TransferCode::GotKilled as i32), None, now);
            }
        }
        Err(err) => {
            tracing::warn!("waitpid({}) failed: {}", pid, err);
        }
    }
}

/// Periodic abnormal-termination sweep: catch children whose finish-FIFO
/// record was lost (the SIGKILL case), retry the zombie-wait list, and
/// drain strays when nothing is supposed to be running.
pub fn zombie_check(e: &mut Engine, now: i64) {
    let live: Vec<i32> = e.conns.live().map(|(_, c)| c.pid).collect();
    for pid in live {
        // skip pids already parked on the zombie list, reap_pid handles them
        if e.zombies.iter().any(|z| z.pid == pid) {
            continue;
        }
        match waitpid(Pid::from_raw(pid), Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::Exited(_, code)) => {
                tracing::warn!("child {} died without a termination message", pid);
                process_exit(e, pid, Some(code), None, now);
            }
            Ok(WaitStatus::Signaled(_, sig, _)) => {
                tracing::warn!("child {} killed by {:?} without a termination message", pid, sig);
                process_exit(e, pid, None, Some(sig), now);
            }
            Ok(_) => {}
            Err(Errno::ECHILD) => {
                tracing::warn!("child {} gone entirely, releasing its slot", pid);
                process_exit(e, pid, Some(TransferCode::GotKilled as i32), None, now);
            }
            Err(_) => {}
        }
    }

    let mut zombies = std::mem::take(&mut e.zombies);
    zombies.retain_mut(|z| {
        match waitpid(Pid::from_raw(z.pid), Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::Exited(_, code)) => {
                process_exit(e, z.pid, Some(code), None, now);
                false
            }
            Ok(WaitStatus::Signaled(_, sig, _)) => {
                process_exit(e, z.pid, None, Some(sig), now);
                false
            }
            Err(Errno::ECHILD) => {
                process_exit(e, z.pid, Some(TransferCode::GotKilled as i32), None, now);
                false
            }
            _ => {
                if !z.complained && now - z.since > ZOMBIE_COMPLAIN_AFTER {
                    tracing::warn!("pid {} unreapable for {}s", z.pid, now - z.since);
                    z.complained = true;
                }
                true
            }
        }
    });
    e.zombies = zombies;

    // with no transfers supposed to be running, collect anything left over
    if e.status().no_of_transfers == 0 {
        loop {
            match waitpid(Pid::from_raw(-1), Some(WaitPidFlag::WNOHANG)) {
                Ok(WaitStatus::Exited(..)) | Ok(WaitStatus::Signaled(..)) => continue,
                _ => break,
            }
        }
    }
}

/// Classify a terminal exit and apply all bookkeeping: error history,
/// error queue, aging, counters, toggle revert, queue feedback, slot
/// teardown.
fn process_exit(e: &mut Engine, pid: i32, code: Option<i32>, sig: Option<Signal>, now: i64) {
    let Some(conn_pos) = e.conns.find_by_pid(pid) else {
        orphan_exit(e, pid, now);
        return;
    };
    let conn = e.conns.get(conn_pos).unwrap().clone();
    if conn.fsa_pos < 0 || conn.fsa_pos as usize >= e.fsa.count() {
        e.conns.release(conn_pos, None);
        let st = e.status_mut();
        st.no_of_transfers = (st.no_of_transfers - 1).max(0);
        return;
    }
    let fsa_pos = conn.fsa_pos as usize;
    // the slot's own entry first; in ack mode handed-off entries share the
    // pid but never the connect_pos
    let qb_pos = {
        let count = e.qb.count();
        e.qb.entries()[..count]
            .iter()
            .position(|q| q.pid == pid && q.connect_pos == conn_pos as i32)
            .or_else(|| queue::find_by_pid(&e.qb, pid))
    };
    let is_fetch = conn.fra_pos >= 0;

    // classification: a killing signal counts as an abnormal but retryable
    // termination, an unknown exit code as terminal
    let (class, history_code) = match (code, sig) {
        (Some(c), None) => match TransferCode::from_code(c) {
            Some(tc) => (tc.classify(), c.clamp(0, 255) as u8),
            None => {
                tracing::warn!("pid {} exited with unknown code {}", pid, c);
                (ExitClass::Fatal, c.clamp(0, 255) as u8)
            }
        },
        (None, Some(s)) => {
            tracing::warn!("pid {} terminated by signal {:?}", pid, s);
            (ExitClass::Transient, (128 + s as i32).clamp(0, 255) as u8)
        }
        _ => (ExitClass::Killed, 0),
    };

    let still_files = code
        .and_then(TransferCode::from_code)
        .map(TransferCode::files_remain)
        .unwrap_or(false);

    let err_id = if is_fetch {
        e.fra.entries().get(conn.fra_pos as usize).map(|d| d.dir_id).unwrap_or(0)
    } else {
        qb_pos
            .and_then(|p| {
                let entry = e.qb.entries()[p];
                e.mdb.entries().get(entry.pos as usize).map(|j| j.job_id)
            })
            .or_else(|| {
                e.fsa.entries()[fsa_pos]
                    .job_status
                    .get(conn.job_no.max(0) as usize)
                    .map(|js| js.job_id)
            })
            .unwrap_or(0)
    };

    let faulty = match class {
        ExitClass::Success => {
            {
                let host = &mut e.fsa.entries_mut()[fsa_pos];
                host.error_counter = 0;
                host.first_error_time = 0;
                if conn.temp_toggle && host.original_toggle_pos != 0 {
                    host.successful_retries += 1;
                    if host.successful_retries >= host.max_successful_retries {
                        let back = host.original_toggle_pos;
                        host.host_toggle = back;
                        host.original_toggle_pos = 0;
                        host.successful_retries = 0;
                        tracing::info!(
                            "host {} switched back to its primary address",
                            host.alias()
                        );
                    }
                }
            }
            e.errq.remove(e.fsa.entries()[fsa_pos].host_id, err_id);
            sync_error_queue_flag(e, fsa_pos);
            if let Some(pos) = qb_pos {
                let entry = e.qb.entries()[pos];
                let st = e.status_mut();
                if is_fetch {
                    st.files_retrieved += entry.files_to_send as u64;
                } else {
                    st.files_send += entry.files_to_send as u64;
                    st.bytes_send += entry.file_size_to_send;
                }
            }
            if still_files { Faulty::NotFaulty } else { Faulty::No }
        }
        ExitClass::SuccessNoFiles => {
            let host = &mut e.fsa.entries_mut()[fsa_pos];
            if host.flags().contains(HostFlags::AUTO_PAUSE_QUEUE) && host.active_transfers <= 1 {
                host.error_counter = 0;
                host.set_flag(HostFlags::AUTO_PAUSE_QUEUE, false);
                host.set_flag(HostFlags::PAUSE_QUEUE, false);
            }
            Faulty::No
        }
        ExitClass::Fatal => {
            let msg = msg_name_str(&conn.msg_name).to_string();
            tracing::error!("pid {} failed terminally with {:?} for {}", pid, code, msg);
            if !is_fetch {
                if let Some(pos) = qb_pos {
                    let entry = e.qb.entries()[pos];
                    let stale = e
                        .mdb
                        .entries()
                        .get(entry.pos as usize)
                        .map(|j| j.in_current_fsa == 0)
                        .unwrap_or(true);
                    if stale && e.cfg.delete_stale_error_jobs {
                        crate::dispatch::delete_job_files(
                            e,
                            &msg,
                            DeleteReason::StaleErrorJob,
                            entry.files_to_send,
                            entry.file_size_to_send,
                        );
                    }
                }
            }
            Faulty::No
        }
        ExitClass::Killed => Faulty::NotFaulty,
        ExitClass::Transient => {
            let (host_id, retry_interval) = {
                let host = &mut e.fsa.entries_mut()[fsa_pos];
                host.error_counter += 1;
                if host.first_error_time == 0 {
                    host.first_error_time = now;
                }
                (host.host_id, host.retry_interval)
            };
            e.errq.upsert(host_id, err_id, now + retry_interval);
            sync_error_queue_flag(e, fsa_pos);
            if let Some(pos) = qb_pos {
                apply_aging(e, pos, fsa_pos, is_fetch, now);
            }
            Faulty::Yes
        }
    };

    // history ring gets the exit code, or 0 while the host is flagged offline
    {
        let host = &mut e.fsa.entries_mut()[fsa_pos];
        let recorded =
            if host.flags().contains(HostFlags::HOST_OFFLINE) { 0 } else { history_code };
        host.record_exit(recorded);
    }

    // queue feedback
    if let Some(pos) = qb_pos {
        match faulty {
            Faulty::No => {
                if !restore_if_burst_raced(e, pos, fsa_pos) {
                    if is_fetch {
                        if let Some(dir) = e.fra.entries_mut().get_mut(conn.fra_pos as usize) {
                            dir.queued = 0;
                            dir.last_retrieval = now;
                        }
                    }
                    queue::remove(&mut e.qb, pos);
                }
            }
            Faulty::Yes | Faulty::NotFaulty => {
                let qe = &mut e.qb.entries_mut()[pos];
                qe.set_pending();
                qe.set_flag(SpecialFlags::QUEUED_FOR_BURST, false);
                let host = &mut e.fsa.entries_mut()[fsa_pos];
                host.jobs_queued += 1;
            }
            Faulty::Neither => {}
        }
    }

    // any burst handoffs still pinned to this pid (ack mode) either raced
    // the death and come back, or are gone with the worker
    recover_handed_entries(e, pid, fsa_pos, now);

    // slot teardown
    {
        let host = &mut e.fsa.entries_mut()[fsa_pos];
        host.active_transfers = (host.active_transfers - 1).max(0);
        host.recalc_trl();
    }
    let host_ptr = fsa_pos;
    {
        let hosts = e.fsa.entries_mut();
        let (slot_host, _) = hosts.split_at_mut(host_ptr + 1);
        e.conns.release(conn_pos, Some(&mut slot_host[host_ptr]));
    }
    let capacity = e.conns.capacity();
    let st = e.status_mut();
    st.no_of_transfers = (st.no_of_transfers - 1).max(0);
    if (st.no_of_transfers as usize) < capacity {
        e.max_connections_reached = false;
    }
}

/// Increment the retry count and inflate the queue key, unless the host or
/// the job opted out of aging.
fn apply_aging(e: &mut Engine, qb_pos: usize, fsa_pos: usize, is_fetch: bool, now: i64) {
    {
        let qe = &mut e.qb.entries_mut()[qb_pos];
        qe.retries += 1;
    }
    let host = e.fsa.entries()[fsa_pos];
    if host.options().contains(ProtocolOptions::NO_AGEING_JOBS) {
        return;
    }
    let ageing = if is_fetch {
        e.cfg.default_ageing
    } else {
        let entry = e.qb.entries()[qb_pos];
        e.mdb.entries().get(entry.pos as usize).map(|j| j.ageing).unwrap_or(0)
    };
    if ageing == 0 {
        return;
    }
    queue::age_entry(&mut e.qb, qb_pos, ageing, now);
}

/// Keep the host's error-queue status bit aligned with actual membership.
fn sync_error_queue_flag(e: &mut Engine, fsa_pos: usize) {
    let host_id = e.fsa.entries()[fsa_pos].host_id;
    let has = e.errq.host_has_entries(host_id);
    e.fsa.entries_mut()[fsa_pos].set_flag(HostFlags::ERROR_QUEUE_SET, has);
}

/// Burst-miss recovery: an entry flagged as handed off whose file directory
/// still exists lost the race against the worker's termination. Restore it
/// instead of removing.
fn restore_if_burst_raced(e: &mut Engine, qb_pos: usize, fsa_pos: usize) -> bool {
    let entry = e.qb.entries()[qb_pos];
    if !entry.flags().contains(SpecialFlags::QUEUED_FOR_BURST) {
        return false;
    }
    let name = msg_name_str(&entry.msg_name).to_string();
    if !e.dirs.job_files(&name).exists() {
        return false;
    }
    tracing::info!("burst handoff of {} raced a termination, requeueing", name);
    let qe = &mut e.qb.entries_mut()[qb_pos];
    qe.set_pending();
    qe.set_flag(SpecialFlags::QUEUED_FOR_BURST, false);
    let host = &mut e.fsa.entries_mut()[fsa_pos];
    host.jobs_queued += 1;
    true
}

/// In ack mode a dead worker may still own handed-off entries waiting for
/// assimilation. Each either comes back (files still on disk) or is gone.
fn recover_handed_entries(e: &mut Engine, pid: i32, fsa_pos: usize, _now: i64) {
    loop {
        let count = e.qb.count();
        let Some(pos) = e.qb.entries()[..count]
            .iter()
            .position(|q| q.pid == pid && q.flags().contains(SpecialFlags::QUEUED_FOR_BURST))
        else {
            break;
        };
        let name_buf = e.qb.entries()[pos].msg_name;
        burst::ack_remove(&mut e.ack, &name_buf);
        if !restore_if_burst_raced(e, pos, fsa_pos) {
            queue::remove(&mut e.qb, pos);
        }
    }
}

/// Exit of a pid no connection slot knows: either an ack-mode handoff whose
/// owner slot already closed, or a stray. Clean up what the queue still
/// references.
fn orphan_exit(e: &mut Engine, pid: i32, _now: i64) {
    let count = e.qb.count();
    let has_entries = e.qb.entries()[..count].iter().any(|q| q.pid == pid);
    if !has_entries {
        tracing::debug!("exit of unknown pid {}", pid);
        return;
    }
    // best effort: restore racing handoffs, drop the rest
    let mut pos = 0;
    while pos < e.qb.count() {
        let entry = e.qb.entries()[pos];
        if entry.pid != pid {
            pos += 1;
            continue;
        }
        let fsa_pos = if entry.is_fetch() {
            e.fra.entries().get(entry.pos as usize).map(|d| d.fsa_pos).unwrap_or(-1)
        } else {
            e.mdb.entries().get(entry.pos as usize).map(|j| j.fsa_pos).unwrap_or(-1)
        };
        if fsa_pos >= 0 && restore_if_burst_raced(e, pos, fsa_pos as usize) {
            pos += 1;
        } else {
            let name_buf = e.qb.entries()[pos].msg_name;
            burst::ack_remove(&mut e.ack, &name_buf);
            queue::remove(&mut e.qb, pos);
        }
    }
}
