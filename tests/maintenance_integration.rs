use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use fdist::config::{FdConfig, WorkDirs};
use fdist::dispatch::burst;
use fdist::engine::Engine;
use fdist::fra;
use fdist::fsa::{self, Protocol};
use fdist::ingest;
use fdist::maintenance;
use fdist::mdb;
use fdist::msg::{MsgFifoRecord, ORIGIN_MSG_GENERATOR};
use fdist::queue::{self, ProcState, SpecialFlags};

static TEST_COUNTER: AtomicU64 = AtomicU64::new(1);

fn unique_work_dir(tag: &str) -> PathBuf {
    let now_ns = SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_nanos();
    let pid = std::process::id();
    let cnt = TEST_COUNTER.fetch_add(1, Ordering::Relaxed);
    std::env::temp_dir().join(format!("fdist_mtest_{}_{}_{}_{}", tag, now_ns, pid, cnt))
}

fn make_engine(tag: &str, cfg: FdConfig) -> Engine {
    let dirs = WorkDirs::at(unique_work_dir(tag));
    Engine::new(cfg, dirs, false).expect("engine")
}

fn enqueue_send(e: &mut Engine, job_id: u32, unique: u32, now: i64) {
    let rec = MsgFifoRecord {
        creation_time: now,
        file_size_to_send: 10,
        dev: 0,
        job_id,
        split_job_counter: 0,
        files_to_send: 1,
        dir_no: 0,
        unique_number: unique,
        priority: b'5',
        originator: ORIGIN_MSG_GENERATOR,
    };
    ingest::queue_send_job(e, &rec, now).expect("queue");
}

// A queued marker without a queue entry is a leak; the audit clears it.
#[test]
fn fra_audit_clears_orphaned_marker() {
    let mut e = make_engine("audit", FdConfig::default());
    let host = fsa::add_host(&mut e.fsa, "pisa", "pisa.example", Protocol::Ftp, 1).expect("host");
    fra::add_dir(&mut e.fra, "pisa-in", "pisa", 0x31, host as i32, Protocol::Ftp, b'5')
        .expect("dir");

    let now = fdist::util::now();
    ingest::synth_fetch_jobs(&mut e, now);
    assert_eq!(e.fra.entries()[0].queued, 1);
    // audit with the entry present keeps the marker
    maintenance::audit_fra_queue(&mut e);
    assert_eq!(e.fra.entries()[0].queued, 1);
    // drop the entry behind the marker's back
    queue::remove(&mut e.qb, 0);
    maintenance::audit_fra_queue(&mut e);
    assert_eq!(e.fra.entries()[0].queued, 0, "orphaned marker must clear");
    let _ = std::fs::remove_dir_all(&e.dirs.root);
}

// With an empty queue every per-host queued counter is forced to zero.
#[test]
fn empty_queue_forces_host_counters() {
    let mut e = make_engine("reconcile", FdConfig::default());
    let host = fsa::add_host(&mut e.fsa, "metz", "metz.example", Protocol::Ftp, 1).expect("host");
    e.fsa.entries_mut()[host].jobs_queued = 9;
    maintenance::reconcile_empty_queue(&mut e);
    assert_eq!(e.fsa.entries()[host].jobs_queued, 0);
    let _ = std::fs::remove_dir_all(&e.dirs.root);
}

// CHECK_FSA_ENTRIES recounts from the connection table and the queue.
#[test]
fn fsa_consistency_check_recounts() {
    let mut e = make_engine("recount", FdConfig::default());
    let host = fsa::add_host(&mut e.fsa, "nice", "nice.example", Protocol::Loc, 2).expect("host");
    let alias = e.fsa.entries()[host].alias().to_string();
    mdb::append(&mut e.mdb, 0x8, host as i32, &alias, Protocol::Loc as u32, 0, 0, 0, 0)
        .expect("mdb");
    let now = fdist::util::now();
    enqueue_send(&mut e, 0x8, 1, now);
    enqueue_send(&mut e, 0x8, 2, now);

    // skew the counters
    {
        let h = &mut e.fsa.entries_mut()[host];
        h.active_transfers = 5;
        h.jobs_queued = 40;
    }
    maintenance::check_fsa_entries(&mut e);
    let h = e.fsa.entries()[host];
    assert_eq!(h.active_transfers, 0, "no live connections");
    assert_eq!(h.jobs_queued, 2, "two pending entries");
    let _ = std::fs::remove_dir_all(&e.dirs.root);
}

// After a host-table rewrite, positions re-derive by alias; vanished hosts
// leave their jobs flagged for the drop path.
#[test]
fn generation_bump_triggers_position_resync() {
    let mut e = make_engine("resync", FdConfig::default());
    let h0 = fsa::add_host(&mut e.fsa, "lund", "lund.example", Protocol::Ftp, 1).expect("host");
    let _h1 = fsa::add_host(&mut e.fsa, "umea", "umea.example", Protocol::Ftp, 1).expect("host");
    let alias0 = e.fsa.entries()[h0].alias().to_string();
    // cache entry deliberately pointing at the wrong slot
    let mpos = mdb::append(&mut e.mdb, 0x9, 1, &alias0, Protocol::Ftp as u32, 0, 0, 0, 0)
        .expect("mdb");
    // and one for a host that will not exist
    let gpos = mdb::append(&mut e.mdb, 0xA, 0, "ghost", Protocol::Ftp as u32, 0, 0, 0, 0)
        .expect("mdb");
    fra::add_dir(&mut e.fra, "umea-in", "umea", 0x41, 0, Protocol::Ftp, b'5').expect("dir");

    e.fsa.bump_generation();
    maintenance::resync_fsa(&mut e);

    assert_eq!(e.mdb.entries()[mpos].fsa_pos, h0 as i32);
    assert_eq!(e.mdb.entries()[mpos].in_current_fsa, 1);
    assert_eq!(e.mdb.entries()[gpos].fsa_pos, -1);
    assert_eq!(e.mdb.entries()[gpos].in_current_fsa, 0);
    assert_eq!(e.fra.entries()[0].fsa_pos, 1, "fra re-derives by host alias");
    assert_eq!(e.last_fsa_generation, e.fsa.generation());
    let _ = std::fs::remove_dir_all(&e.dirs.root);
}

// An entry whose host vanished is dropped with a warning on its next
// dispatch attempt.
#[test]
fn vanished_host_drops_entry_on_dispatch() {
    let mut e = make_engine("vanish", FdConfig::default());
    let host = fsa::add_host(&mut e.fsa, "kemi", "kemi.example", Protocol::Ftp, 1).expect("host");
    let alias = e.fsa.entries()[host].alias().to_string();
    let mpos =
        mdb::append(&mut e.mdb, 0xB, host as i32, &alias, Protocol::Ftp as u32, 0, 0, 0, 0)
            .expect("mdb");
    let now = fdist::util::now();
    enqueue_send(&mut e, 0xB, 1, now);
    // the configurator dropped the host
    e.mdb.entries_mut()[mpos].fsa_pos = -1;
    e.mdb.entries_mut()[mpos].in_current_fsa = 0;

    let outcome = fdist::dispatch::start_process(&mut e, 0, now, false);
    assert_eq!(outcome, fdist::dispatch::StartOutcome::Removed);
    queue::remove(&mut e.qb, 0);
    assert_eq!(e.qb.count(), 0);
    let _ = std::fs::remove_dir_all(&e.dirs.root);
}

// A burst handoff that was never acknowledged comes back as pending.
#[test]
fn stale_ack_restores_handoff() {
    let mut cfg = FdConfig::default();
    cfg.burst_ack_queue = true;
    let mut e = make_engine("staleack", cfg);
    let host = fsa::add_host(&mut e.fsa, "brno", "brno.example", Protocol::Loc, 1).expect("host");
    let alias = e.fsa.entries()[host].alias().to_string();
    mdb::append(&mut e.mdb, 0xC, host as i32, &alias, Protocol::Loc as u32, 0, 0, 0, 0)
        .expect("mdb");
    let now = fdist::util::now();
    enqueue_send(&mut e, 0xC, 1, now);

    // simulate the handoff bookkeeping: entry pinned to a worker pid and an
    // ack recorded well past the timeout
    let name = {
        let entry = &mut e.qb.entries_mut()[0];
        entry.pid = 55_555;
        entry.set_flag(SpecialFlags::QUEUED_FOR_BURST, true);
        entry.msg_name
    };
    e.fsa.entries_mut()[host].jobs_queued = 0;
    burst::ack_add(&mut e.ack, name, now - burst::ACK_QUE_TIMEOUT - 5);

    maintenance::expire_stale_acks(&mut e, now);

    assert_eq!(e.ack.count(), 0, "stale ack entry is dropped");
    let entry = e.qb.entries()[0];
    assert_eq!(entry.state(), ProcState::Pending);
    assert!(!entry.flags().contains(SpecialFlags::QUEUED_FOR_BURST));
    assert_eq!(e.fsa.entries()[host].jobs_queued, 1, "restored entry counts as queued");
    let _ = std::fs::remove_dir_all(&e.dirs.root);
}

// Message descriptor reload: a touched message file refreshes the cached
// age limit and ageing.
#[test]
fn changed_message_file_reloads_descriptor() {
    let mut e = make_engine("rescan", FdConfig::default());
    let host = fsa::add_host(&mut e.fsa, "linkoping", "l.example", Protocol::Ftp, 1).expect("host");
    let alias = e.fsa.entries()[host].alias().to_string();
    let mpos = mdb::append(&mut e.mdb, 0xD, host as i32, &alias, Protocol::Ftp as u32, 0, 600, 1, 5)
        .expect("mdb");
    // message file carries newer options and a newer mtime than recorded
    let path = mdb::message_path(&e.dirs.messages, 0xD);
    std::fs::write(&path, "age-limit 1200\nageing 4\n").expect("message file");

    maintenance::rescan_message_files(&mut e);
    let job = e.mdb.entries()[mpos];
    assert_eq!(job.age_limit, 1200);
    assert_eq!(job.ageing, 4);
    assert!(job.msg_time > 5);
    let _ = std::fs::remove_dir_all(&e.dirs.root);
}
