use crate::dellog::DeleteReason;
use crate::engine::Engine;
use crate::error::FdError;
use crate::fra::DirFlags;
use crate::fsa::{self, HostFlags};
use crate::mdb;
use crate::msg::{MSG_FIFO_RECORD_SIZE, MsgFifoRecord, ORIGIN_RESEND, fetch_msg_name, msg_name_str};
use crate::queue::{self, SpecialFlags};

/// Drain the message FIFO and queue every well-formed record. A drain that
/// hits the buffer cap leaves the rest for the next tick (backpressure).
pub fn service_msg_fifo(e: &mut Engine, now: i64) {
    let (records, backpressure) = e.msg_fifo.drain_records::<MSG_FIFO_RECORD_SIZE>();
    for bytes in records {
        match MsgFifoRecord::from_bytes(&bytes) {
            Ok(rec) => {
                if let Err(err) = queue_send_job(e, &rec, now) {
                    tracing::warn!("message for job {:#x} not queued: {}", rec.job_id, err);
                }
            }
            Err(err) => {
                tracing::warn!("{}", err);
            }
        }
    }
    if backpressure {
        tracing::debug!("{}", FdError::Backpressure("msg"));
    }
}

/// Resolve the record's job id against the message cache (memoized last
/// lookup, then a linear scan, then the on-disk message file) and insert a
/// queue entry. A job nobody knows gets its files purged via the delete
/// log instead of lingering forever.
pub fn queue_send_job(e: &mut Engine, rec: &MsgFifoRecord, now: i64) -> anyhow::Result<()> {
    let mdb_pos = match lookup_job(e, rec.job_id)? {
        Some(pos) => pos,
        None => {
            let name_buf = rec.msg_name();
            let name = msg_name_str(&name_buf).to_string();
            crate::dispatch::delete_job_files(
                e,
                &name,
                DeleteReason::UnknownJob,
                rec.files_to_send,
                rec.file_size_to_send,
            );
            return Err(FdError::LookupFailure(rec.job_id).into());
        }
    };

    let mut entry = queue::blank_entry();
    entry.msg_name = rec.msg_name();
    entry.msg_number = queue::msg_number(
        rec.priority,
        rec.creation_time,
        rec.unique_number,
        rec.split_job_counter,
    );
    entry.creation_time = rec.creation_time;
    entry.pos = mdb_pos as i32;
    entry.retries = 0;
    entry.files_to_send = rec.files_to_send;
    entry.file_size_to_send = rec.file_size_to_send;
    if rec.originator == ORIGIN_RESEND {
        entry.set_flag(SpecialFlags::RESEND_JOB, true);
    }
    queue::insert(&mut e.qb, entry)?;

    let fsa_pos = e.mdb.entries()[mdb_pos].fsa_pos;
    if fsa_pos >= 0 && (fsa_pos as usize) < e.fsa.count() {
        e.fsa.entries_mut()[fsa_pos as usize].jobs_queued += 1;
    }
    let depth = e.qb.count() as u32;
    let st = e.status_mut();
    if depth > st.max_queue_length {
        st.max_queue_length = depth;
    }
    Ok(())
}

/// LRU-1 memoized job lookup with the linear scan fallback; a complete miss
/// tries to load the descriptor from the on-disk message file.
fn lookup_job(e: &mut Engine, job_id: u32) -> anyhow::Result<Option<usize>> {
    if let Some((memo_id, memo_pos)) = e.mdb_memo {
        if memo_id == job_id
            && memo_pos < e.mdb.count()
            && e.mdb.entries()[memo_pos].job_id == job_id
        {
            return Ok(Some(memo_pos));
        }
    }
    if let Some(pos) = mdb::lookup(&e.mdb, job_id) {
        e.mdb_memo = Some((job_id, pos));
        return Ok(Some(pos));
    }
    match load_job_descriptor(e, job_id)? {
        Some(pos) => {
            e.mdb_memo = Some((job_id, pos));
            Ok(Some(pos))
        }
        None => Ok(None),
    }
}

/// First sighting of a job id: read its message file and append a cache
/// entry. The file is a small key-value block; only the scheduler-relevant
/// keys are interpreted here.
fn load_job_descriptor(e: &mut Engine, job_id: u32) -> anyhow::Result<Option<usize>> {
    let path = mdb::message_path(&e.dirs.messages, job_id);
    let text = match std::fs::read_to_string(&path) {
        Ok(t) => t,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(err.into()),
    };
    let mtime = std::fs::metadata(&path)
        .and_then(|m| m.modified())
        .map(|t| {
            t.duration_since(std::time::UNIX_EPOCH).map(|d| d.as_secs() as i64).unwrap_or(0)
        })
        .unwrap_or(0);

    let mut destination = None;
    let mut protocol = 0u32;
    let mut port = -1i32;
    for line in text.lines() {
        let line = line.trim();
        if let Some(v) = line.strip_prefix("destination ") {
            destination = Some(v.trim().to_string());
        } else if let Some(v) = line.strip_prefix("protocol ") {
            protocol = match v.trim() {
                "ftp" => crate::fsa::Protocol::Ftp as u32,
                "sftp" => crate::fsa::Protocol::Sftp as u32,
                "http" => crate::fsa::Protocol::Http as u32,
                "smtp" => crate::fsa::Protocol::Smtp as u32,
                "scp" => crate::fsa::Protocol::Scp as u32,
                "loc" => crate::fsa::Protocol::Loc as u32,
                "exec" => crate::fsa::Protocol::Exec as u32,
                other => {
                    tracing::warn!("message {:x} names unknown protocol '{}'", job_id, other);
                    0
                }
            };
        } else if let Some(v) = line.strip_prefix("port ") {
            port = v.trim().parse().unwrap_or(-1);
        }
    }
    let Some(alias) = destination else {
        tracing::warn!("message file {} has no destination", path.display());
        return Ok(None);
    };
    let Some(fsa_pos) = fsa::find_host(&e.fsa, &alias) else {
        tracing::warn!("message {:x} names unknown host '{}'", job_id, alias);
        return Ok(None);
    };
    let (age_limit, ageing) = mdb::parse_message_options(&text);
    let pos = mdb::append(
        &mut e.mdb,
        job_id,
        fsa_pos as i32,
        &alias,
        protocol,
        port,
        age_limit.unwrap_or(e.cfg.default_age_limit),
        ageing.unwrap_or(e.cfg.default_ageing),
        mtime,
    )?;
    Ok(Some(pos))
}

/// Synthesize fetch jobs for every retrieve dir whose schedule is due and
/// that is not already queued, disabled, stopped, or on a paused host.
pub fn synth_fetch_jobs(e: &mut Engine, now: i64) {
    let count = e.fra.count();
    for pos in 0..count {
        let dir = e.fra.entries()[pos];
        if dir.queued != 0
            || dir.flags().intersects(DirFlags::DIR_DISABLED | DirFlags::DIR_STOPPED)
        {
            continue;
        }
        if dir.fsa_pos < 0 || dir.fsa_pos as usize >= e.fsa.count() {
            continue;
        }
        let host = e.fsa.entries()[dir.fsa_pos as usize];
        if host
            .flags()
            .intersects(HostFlags::HOST_DISABLED | HostFlags::PAUSE_QUEUE | HostFlags::STOP_TRANSFER)
        {
            continue;
        }
        if !dir.scan_allowed(now) {
            continue;
        }

        let priority = if dir.priority.is_ascii_digit() { dir.priority } else { b'9' };
        let mut entry = queue::blank_entry();
        entry.msg_name = fetch_msg_name(dir.dir_id, priority);
        entry.msg_number = queue::fetch_msg_number(priority, now);
        entry.creation_time = now;
        entry.pos = pos as i32;
        entry.set_flag(SpecialFlags::FETCH_JOB, true);
        if let Err(err) = queue::insert(&mut e.qb, entry) {
            tracing::warn!("fetch job for {} not queued: {}", dir.alias(), err);
            continue;
        }
        {
            let d = &mut e.fra.entries_mut()[pos];
            d.queued = 1;
            d.next_check_time = d.compute_next_check(now + 1);
        }
        e.fsa.entries_mut()[dir.fsa_pos as usize].jobs_queued += 1;
        let depth = e.qb.count() as u32;
        let st = e.status_mut();
        if depth > st.max_queue_length {
            st.max_queue_length = depth;
        }
    }
}
