pub mod burst;
pub mod workers;

use crate::conn;
use crate::dellog::DeleteReason;
use crate::engine::Engine;
use crate::fsa::{HostFlags, Protocol, ProtocolOptions, SlotState};
use crate::msg::msg_name_str;
use crate::queue::{PID_REMOVED, SpecialFlags};
use crate::status::STATUS_DISABLE_RETRIEVE;

use self::burst::BurstAttempt;
use self::workers::{WorkerJob, apply_priority, build_argv, resolve_worker, spawn_worker, worker_binary};

/// What the dispatcher decided for one queue entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    /// Entry is dead; the caller removes it from the queue.
    Removed,
    /// Entry stays queued, nothing started this tick.
    Pending,
    /// A fresh worker was forked with this pid.
    Started(i32),
    /// The entry was handed to an already-open worker.
    Bursted(i32),
}

/// Remove the file set of a queued job from the outgoing area.
pub fn delete_job_files(e: &mut Engine, msg_name: &str, reason: DeleteReason, files: u32, size: u64) {
    let dir = e.dirs.job_files(msg_name);
    if dir.exists() {
        if let Err(err) = std::fs::remove_dir_all(&dir) {
            tracing::warn!("purge {} failed: {}", dir.display(), err);
        }
    }
    e.dellog.record(msg_name, reason, files, size);
}

/// Decide whether the pending entry at `qb_pos` may start now, and start it.
///
/// Preconditions run in a fixed order; the first hard failure marks the
/// entry removed and returns [`StartOutcome::Removed`] (the caller compacts
/// the queue), soft failures leave it pending. A burst handoff is always
/// attempted before paying for a fork.
pub fn start_process(e: &mut Engine, qb_pos: usize, now: i64, retry_hint: bool) -> StartOutcome {
    let entry = e.qb.entries()[qb_pos];
    let is_fetch = entry.is_fetch();

    // resolve the host this entry points at; a resync may have invalidated it
    let fsa_pos = if is_fetch {
        match e.fra.entries().get(entry.pos as usize) {
            Some(dir) if (entry.pos as usize) < e.fra.count() => dir.fsa_pos,
            _ => -1,
        }
    } else {
        match e.mdb.entries().get(entry.pos as usize) {
            Some(job) if (entry.pos as usize) < e.mdb.count() => job.fsa_pos,
            _ => -1,
        }
    };
    if fsa_pos < 0 || fsa_pos as usize >= e.fsa.count() {
        tracing::warn!(
            "queue entry {} references a host that no longer exists, dropping",
            msg_name_str(&entry.msg_name)
        );
        if !is_fetch {
            let name = msg_name_str(&entry.msg_name).to_string();
            delete_job_files(e, &name, DeleteReason::HostDisappeared, entry.files_to_send, entry.file_size_to_send);
        }
        e.qb.entries_mut()[qb_pos].pid = PID_REMOVED;
        e.status_mut().jobs_removed += 1;
        return StartOutcome::Removed;
    }
    let fsa_pos = fsa_pos as usize;

    // 1. send jobs past their age limit are discarded, host permitting
    if !is_fetch {
        let job = e.mdb.entries()[entry.pos as usize];
        let age_limit = if job.age_limit > 0 { job.age_limit } else { e.cfg.default_age_limit };
        let host = e.fsa.entries()[fsa_pos];
        if age_limit > 0
            && now - entry.creation_time > age_limit as i64
            && !host.flags().contains(HostFlags::DO_NOT_DELETE)
        {
            let name = msg_name_str(&entry.msg_name).to_string();
            delete_job_files(e, &name, DeleteReason::AgeOutput, entry.files_to_send, entry.file_size_to_send);
            let h = &mut e.fsa.entries_mut()[fsa_pos];
            h.jobs_queued = h.jobs_queued.saturating_sub(1);
            e.qb.entries_mut()[qb_pos].pid = PID_REMOVED;
            e.status_mut().jobs_removed += 1;
            return StartOutcome::Removed;
        }
    }

    // 2. retrieval can be switched off globally
    if is_fetch && e.status().flags & STATUS_DISABLE_RETRIEVE != 0 {
        e.fra.entries_mut()[entry.pos as usize].queued = 0;
        let h = &mut e.fsa.entries_mut()[fsa_pos];
        h.jobs_queued = h.jobs_queued.saturating_sub(1);
        e.qb.entries_mut()[qb_pos].pid = PID_REMOVED;
        e.dellog.record(msg_name_str(&entry.msg_name), DeleteReason::RetrieveDisabled, 0, 0);
        return StartOutcome::Removed;
    }

    // 3. stopped or paused hosts keep their work queued
    let host = e.fsa.entries()[fsa_pos];
    if host
        .flags()
        .intersects(HostFlags::STOP_TRANSFER | HostFlags::PAUSE_QUEUE | HostFlags::HOST_DISABLED)
    {
        return StartOutcome::Pending;
    }

    // 4. retry admission; error-queue membership is consulted once per call
    let err_id = if is_fetch {
        e.fra.entries()[entry.pos as usize].dir_id
    } else {
        e.mdb.entries()[entry.pos as usize].job_id
    };
    let in_error_queue = e.errq.holds(host.host_id, err_id, now);
    let admit = retry_hint
        || (host.error_counter == 0 && !in_error_queue)
        || now - (host.last_retry_time + host.retry_interval) >= 0;
    if !admit {
        return StartOutcome::Pending;
    }

    // 5. reuse an open session before paying for a fork
    match burst::try_burst(e, qb_pos, fsa_pos, now) {
        BurstAttempt::Handed(pid) => return StartOutcome::Bursted(pid),
        BurstAttempt::RestartRequested => return StartOutcome::Pending,
        BurstAttempt::NoCandidate => {}
    }

    // 6. global and per-host caps
    if e.status().no_of_transfers as usize >= e.conns.capacity() {
        if !e.max_connections_reached {
            tracing::info!("maximum connections ({}) reached", e.conns.capacity());
            e.max_connections_reached = true;
        }
        return StartOutcome::Pending;
    }
    if host.active_transfers >= host.allowed_transfers {
        return StartOutcome::Pending;
    }
    if is_fetch && !entry.flags().contains(SpecialFlags::HELPER_JOB) {
        let dir_id = e.fra.entries()[entry.pos as usize].dir_id;
        if conn::retrieve_in_progress(&host, dir_id) {
            // a child already fetches this dir; fra.queued stays set, the
            // running child covers the work
            let h = &mut e.fsa.entries_mut()[fsa_pos];
            h.jobs_queued = h.jobs_queued.saturating_sub(1);
            e.qb.entries_mut()[qb_pos].pid = PID_REMOVED;
            return StartOutcome::Removed;
        }
    }
    let Some(conn_pos) = e.conns.alloc() else {
        return StartOutcome::Pending;
    };
    let Some(job_no) = conn::free_job_slot(&host) else {
        return StartOutcome::Pending;
    };

    // 7. pick the worker binary and build its argv
    let proto_bits = if is_fetch {
        e.fra.entries()[entry.pos as usize].protocol
    } else {
        e.mdb.entries()[entry.pos as usize].protocol
    };
    let Some(protocol) = Protocol::from_bits(proto_bits) else {
        tracing::warn!(
            "entry {} carries unknown protocol bits {:#x}, dropping",
            msg_name_str(&entry.msg_name),
            proto_bits
        );
        let h = &mut e.fsa.entries_mut()[fsa_pos];
        h.jobs_queued = h.jobs_queued.saturating_sub(1);
        e.qb.entries_mut()[qb_pos].pid = PID_REMOVED;
        return StartOutcome::Removed;
    };
    let local_match = host.options().contains(ProtocolOptions::FILE_WHEN_LOCAL)
        && e.local_interfaces.iter().any(|i| i == host.active_hostname());
    let binary_name = worker_binary(protocol, is_fetch, e.debug, local_match);
    let binary = match resolve_worker(&e.dirs, &binary_name) {
        Ok(p) => p,
        Err(err) => {
            tracing::warn!("{}; leaving {} queued", err, msg_name_str(&entry.msg_name));
            return StartOutcome::Pending;
        }
    };
    let age_limit = if is_fetch {
        0
    } else {
        let job = e.mdb.entries()[entry.pos as usize];
        if job.age_limit > 0 { job.age_limit } else { e.cfg.default_age_limit }
    };
    let no_archive = !is_fetch && e.mdb.entries()[entry.pos as usize].no_archive != 0;
    let temp_toggle = host.original_toggle_pos != 0;
    let job = WorkerJob {
        msg_name: msg_name_str(&entry.msg_name),
        job_no,
        fsa_id: e.fsa.generation(),
        fsa_pos,
        fetch: is_fetch,
        fra_pos: if is_fetch { entry.pos } else { -1 },
        resend: entry.flags().contains(SpecialFlags::RESEND_JOB),
        helper: entry.flags().contains(SpecialFlags::HELPER_JOB),
        age_limit,
        no_archive,
        simulate: e.cfg.simulate_send_mode || host.flags().contains(HostFlags::SIMULATE_SEND),
        temp_toggle,
        smtp: protocol == Protocol::Smtp,
        http: protocol == Protocol::Http,
        retries: entry.retries,
        hw_crc: host.options().contains(ProtocolOptions::USE_HW_CRC),
    };
    let argv = build_argv(&e.cfg, &e.dirs, &job);

    // reserve the shared slot so the child finds its area clean
    {
        let h = &mut e.fsa.entries_mut()[fsa_pos];
        let js = &mut h.job_status[job_no];
        js.clear();
        js.state = SlotState::Running as u8;
        js.job_id = err_id;
        js.unique_name = entry.msg_name;
    }

    // 8. fork; on failure release the reservation and stay pending
    let pid = match spawn_worker(&binary, &argv) {
        Ok(pid) => pid,
        Err(err) => {
            tracing::error!("fork of {} failed: {}", binary_name, err);
            e.fsa.entries_mut()[fsa_pos].job_status[job_no].clear();
            return StartOutcome::Pending;
        }
    };

    // 9. stamp the slot, the queue entry and the counters
    {
        let port = if is_fetch { -1 } else { e.mdb.entries()[entry.pos as usize].port };
        let dir_alias = if is_fetch {
            e.fra.entries()[entry.pos as usize].alias().to_string()
        } else {
            String::new()
        };
        let slot = e.conns.get_mut(conn_pos).expect("allocated slot");
        slot.hostname = host.active_hostname().to_string();
        slot.host_id = host.host_id;
        slot.fsa_pos = fsa_pos as i32;
        slot.fra_pos = if is_fetch { entry.pos } else { -1 };
        slot.protocol = Some(protocol);
        slot.port = port;
        slot.job_no = job_no as i32;
        slot.msg_name = entry.msg_name;
        slot.dir_alias = dir_alias;
        slot.pid = pid;
        slot.resend = job.resend;
        slot.helper = job.helper;
        slot.temp_toggle = temp_toggle;
        slot.started = now;
    }
    {
        let h = &mut e.fsa.entries_mut()[fsa_pos];
        h.job_status[job_no].proc_id = pid;
        h.active_transfers += 1;
        h.recalc_trl();
        h.jobs_queued = h.jobs_queued.saturating_sub(1);
        h.last_retry_time = now;
    }
    {
        let qe = &mut e.qb.entries_mut()[qb_pos];
        qe.pid = pid;
        qe.connect_pos = conn_pos as i32;
    }
    {
        let st = e.status_mut();
        st.no_of_transfers += 1;
        st.fork_counter += 1;
    }
    apply_priority(&e.cfg, pid);
    tracing::debug!(
        "started {} [{}] for {} as pid {}",
        binary_name,
        job_no,
        msg_name_str(&entry.msg_name),
        pid
    );
    StartOutcome::Started(pid)
}
