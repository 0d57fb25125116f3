use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;

use crate::dellog::DeleteReason;
use crate::dispatch::burst::ACK_QUE_TIMEOUT;
use crate::engine::Engine;
use crate::fsa;
use crate::mdb;
use crate::msg::msg_name_str;
use crate::queue::{self, ProcState, SpecialFlags};

/// Re-stat every cached job's message file; a descriptor edited on disk
/// invalidates the cache and is reloaded in place.
pub fn rescan_message_files(e: &mut Engine) {
    let count = e.mdb.count();
    for pos in 0..count {
        let job = e.mdb.entries()[pos];
        let path = mdb::message_path(&e.dirs.messages, job.job_id);
        let Ok(meta) = std::fs::metadata(&path) else { continue };
        let mtime = meta
            .modified()
            .ok()
            .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0);
        if mtime <= job.msg_time {
            continue;
        }
        let Ok(text) = std::fs::read_to_string(&path) else { continue };
        let (age_limit, ageing) = mdb::parse_message_options(&text);
        let entry = &mut e.mdb.entries_mut()[pos];
        if let Some(a) = age_limit {
            entry.age_limit = a;
        }
        if let Some(a) = ageing {
            entry.ageing = a;
        }
        entry.msg_time = mtime;
        tracing::debug!("reloaded message descriptor for job {:x}", job.job_id);
    }
}

/// A sibling rewrote the host table (generation bump): re-derive every
/// position that indexes into it by host alias, and flag cache entries
/// whose host no longer exists. Their queue entries are dropped with a
/// warning on their next dispatch attempt.
pub fn resync_fsa(e: &mut Engine) {
    let generation = e.fsa.generation();
    if generation == e.last_fsa_generation {
        return;
    }
    tracing::info!("host table generation {} -> {}, resyncing", e.last_fsa_generation, generation);
    e.last_fsa_generation = generation;
    e.mdb_memo = None;

    let mdb_count = e.mdb.count();
    for pos in 0..mdb_count {
        let alias = e.mdb.entries()[pos].alias().to_string();
        let found = fsa::find_host(&e.fsa, &alias);
        let entry = &mut e.mdb.entries_mut()[pos];
        match found {
            Some(fsa_pos) => {
                entry.fsa_pos = fsa_pos as i32;
                entry.in_current_fsa = 1;
            }
            None => {
                entry.fsa_pos = -1;
                entry.in_current_fsa = 0;
                tracing::warn!("host '{}' left the table, jobs for it will be dropped", alias);
            }
        }
    }

    let fra_count = e.fra.count();
    for pos in 0..fra_count {
        let alias = crate::util::fixed_str(&e.fra.entries()[pos].host_alias).to_string();
        let found = fsa::find_host(&e.fsa, &alias);
        e.fra.entries_mut()[pos].fsa_pos = found.map(|p| p as i32).unwrap_or(-1);
    }

    for pos in 0..e.conns.capacity() {
        let Some(conn) = e.conns.get(pos) else { continue };
        if conn.is_free() {
            continue;
        }
        let host_id = conn.host_id;
        let fsa_count = e.fsa.count();
        let found = e.fsa.entries()[..fsa_count].iter().position(|h| h.host_id == host_id);
        if let Some(slot) = e.conns.get_mut(pos) {
            slot.fsa_pos = found.map(|p| p as i32).unwrap_or(-1);
        }
    }
}

/// Audit the retrieve table's `queued` markers against the queue. A marker
/// with no matching fetch entry leaks a dir out of scheduling forever, so
/// it is cleared here.
pub fn audit_fra_queue(e: &mut Engine) {
    let count = e.fra.count();
    for pos in 0..count {
        if e.fra.entries()[pos].queued == 0 {
            continue;
        }
        if queue::find_fetch(&e.qb, pos as i32).is_none() {
            tracing::warn!(
                "retrieve dir {} marked queued without a queue entry, clearing",
                e.fra.entries()[pos].alias()
            );
            e.fra.entries_mut()[pos].queued = 0;
        }
    }
}

/// With an empty queue no host can have queued work; force the counters.
pub fn reconcile_empty_queue(e: &mut Engine) {
    if e.qb.count() != 0 {
        return;
    }
    let count = e.fsa.count();
    for pos in 0..count {
        let host = &mut e.fsa.entries_mut()[pos];
        if host.jobs_queued != 0 {
            tracing::debug!("host {} jobs_queued {} -> 0 (queue empty)", host.alias(), host.jobs_queued);
            host.jobs_queued = 0;
        }
    }
}

/// Recount per-host counters from the ground truth (connection table and
/// queue); answers the CHECK_FSA_ENTRIES command.
pub fn check_fsa_entries(e: &mut Engine) {
    let fsa_count = e.fsa.count();
    let mut active = vec![0i32; fsa_count];
    for (_, conn) in e.conns.live() {
        if conn.fsa_pos >= 0 && (conn.fsa_pos as usize) < fsa_count {
            active[conn.fsa_pos as usize] += 1;
        }
    }
    let mut queued = vec![0u32; fsa_count];
    let qb_count = e.qb.count();
    for pos in 0..qb_count {
        let entry = e.qb.entries()[pos];
        if entry.state() != ProcState::Pending {
            continue;
        }
        let fsa_pos = if entry.is_fetch() {
            e.fra.entries().get(entry.pos as usize).map(|d| d.fsa_pos).unwrap_or(-1)
        } else {
            e.mdb.entries().get(entry.pos as usize).map(|j| j.fsa_pos).unwrap_or(-1)
        };
        if fsa_pos >= 0 && (fsa_pos as usize) < fsa_count {
            queued[fsa_pos as usize] += 1;
        }
    }
    for pos in 0..fsa_count {
        let host = &mut e.fsa.entries_mut()[pos];
        if host.active_transfers != active[pos] {
            tracing::warn!(
                "host {} active_transfers {} != {} observed, fixing",
                host.alias(),
                host.active_transfers,
                active[pos]
            );
            host.active_transfers = active[pos];
            host.recalc_trl();
        }
        if host.jobs_queued != queued[pos] {
            tracing::debug!(
                "host {} jobs_queued {} -> {}",
                host.alias(),
                host.jobs_queued,
                queued[pos]
            );
            host.jobs_queued = queued[pos];
        }
    }
}

/// Restore queue entries whose burst handoff was never acknowledged in
/// time; the handoff is considered lost.
pub fn expire_stale_acks(e: &mut Engine, now: i64) {
    let mut pos = 0;
    while pos < e.ack.count() {
        let ack = e.ack.entries()[pos];
        if now - ack.insert_time <= ACK_QUE_TIMEOUT {
            pos += 1;
            continue;
        }
        let name = msg_name_str(&ack.msg_name).to_string();
        tracing::info!("burst handoff of {} unacknowledged for {}s, restoring", name, now - ack.insert_time);
        let qb_count = e.qb.count();
        let qb_pos = e.qb.entries()[..qb_count].iter().position(|q| {
            q.msg_name == ack.msg_name && q.flags().contains(SpecialFlags::QUEUED_FOR_BURST)
        });
        if let Some(qpos) = qb_pos {
            let entry = e.qb.entries()[qpos];
            let fsa_pos = if entry.is_fetch() {
                e.fra.entries().get(entry.pos as usize).map(|d| d.fsa_pos).unwrap_or(-1)
            } else {
                e.mdb.entries().get(entry.pos as usize).map(|j| j.fsa_pos).unwrap_or(-1)
            };
            let qe = &mut e.qb.entries_mut()[qpos];
            qe.set_pending();
            qe.set_flag(SpecialFlags::QUEUED_FOR_BURST, false);
            if fsa_pos >= 0 && (fsa_pos as usize) < e.fsa.count() {
                e.fsa.entries_mut()[fsa_pos as usize].jobs_queued += 1;
            }
        }
        // remove the ack entry (left shift keeps order by insert time)
        let count = e.ack.count();
        let entries = e.ack.entries_mut();
        entries.copy_within(pos + 1..count, pos);
        e.ack.set_count(count - 1);
    }
}

/// Interrupt children that outlived their whole retry-and-transfer budget.
/// Workers are expected to exit on SIGINT; reaping is the normal path.
pub fn interrupt_stuck_transfers(e: &mut Engine, now: i64) {
    const GRACE: i64 = 60;
    let mut to_kill = Vec::new();
    for (_, conn) in e.conns.live() {
        if conn.fsa_pos < 0 || conn.fsa_pos as usize >= e.fsa.count() {
            continue;
        }
        let force = if conn.fra_pos >= 0 { e.cfg.gf_force_disconnect } else { e.cfg.sf_force_disconnect };
        if force <= 0 {
            continue;
        }
        let host = e.fsa.entries()[conn.fsa_pos as usize];
        let budget = host.retry_interval + force + GRACE;
        if conn.started > 0 && now - conn.started > budget {
            to_kill.push((conn.pid, msg_name_str(&conn.msg_name).to_string(), now - conn.started));
        }
    }
    for (pid, name, age) in to_kill {
        tracing::warn!("pid {} ({}) stuck for {}s, interrupting", pid, name, age);
        let _ = kill(Pid::from_raw(pid), Signal::SIGINT);
    }
}

/// Service the transfer-rate-limit recalc FIFO: each record names a host
/// position whose per-process share must be recomputed.
pub fn service_trl_fifo(e: &mut Engine) {
    let (records, _) = e.trl_fifo.drain_records::<4>();
    for rec in records {
        let pos = i32::from_le_bytes(rec);
        if pos < 0 || pos as usize >= e.fsa.count() {
            tracing::warn!("trl recalc for invalid host position {}", pos);
            continue;
        }
        e.fsa.entries_mut()[pos as usize].recalc_trl();
    }
}

/// Retry FIFO: a host position whose queued work should be dispatched now,
/// bypassing the retry window.
pub fn service_retry_fifo(e: &mut Engine, now: i64) {
    let (records, _) = e.retry_fifo.drain_records::<4>();
    for rec in records {
        let fsa_pos = i32::from_le_bytes(rec);
        if fsa_pos < 0 || fsa_pos as usize >= e.fsa.count() {
            tracing::warn!("retry request for invalid host position {}", fsa_pos);
            continue;
        }
        crate::engine::dispatch_host(e, fsa_pos, now);
    }
}

/// Delete FIFO: `{kind, pad, id}`; kind 1 drops all send jobs of a job id,
/// kind 2 everything queued for a host id.
pub fn service_delete_fifo(e: &mut Engine, _now: i64) {
    const DELETE_JOB_ID: u8 = 1;
    const DELETE_HOST_ID: u8 = 2;
    let (records, _) = e.delete_fifo.drain_records::<8>();
    for rec in records {
        let kind = rec[0];
        let id = u32::from_le_bytes(rec[4..8].try_into().unwrap());
        let mut pos = 0;
        while pos < e.qb.count() {
            let entry = e.qb.entries()[pos];
            if entry.state() != ProcState::Pending {
                pos += 1;
                continue;
            }
            let (matches, fsa_pos) = match kind {
                DELETE_JOB_ID => {
                    if entry.is_fetch() {
                        (false, -1)
                    } else {
                        let job = e.mdb.entries().get(entry.pos as usize);
                        (job.map(|j| j.job_id == id).unwrap_or(false),
                         job.map(|j| j.fsa_pos).unwrap_or(-1))
                    }
                }
                DELETE_HOST_ID => {
                    let fsa_pos = if entry.is_fetch() {
                        e.fra.entries().get(entry.pos as usize).map(|d| d.fsa_pos).unwrap_or(-1)
                    } else {
                        e.mdb.entries().get(entry.pos as usize).map(|j| j.fsa_pos).unwrap_or(-1)
                    };
                    let hit = fsa_pos >= 0
                        && (fsa_pos as usize) < e.fsa.count()
                        && e.fsa.entries()[fsa_pos as usize].host_id == id;
                    (hit, fsa_pos)
                }
                _ => {
                    tracing::warn!("delete request with unknown kind {}", kind);
                    (false, -1)
                }
            };
            if !matches {
                pos += 1;
                continue;
            }
            let name = msg_name_str(&entry.msg_name).to_string();
            if entry.is_fetch() {
                if let Some(dir) = e.fra.entries_mut().get_mut(entry.pos as usize) {
                    dir.queued = 0;
                }
            } else {
                crate::dispatch::delete_job_files(
                    e,
                    &name,
                    DeleteReason::UserRequested,
                    entry.files_to_send,
                    entry.file_size_to_send,
                );
            }
            if fsa_pos >= 0 && (fsa_pos as usize) < e.fsa.count() {
                let host = &mut e.fsa.entries_mut()[fsa_pos as usize];
                host.jobs_queued = host.jobs_queued.saturating_sub(1);
            }
            queue::remove(&mut e.qb, pos);
            e.status_mut().jobs_removed += 1;
        }
    }
}
