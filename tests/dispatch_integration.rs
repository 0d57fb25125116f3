use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use fdist::config::{FdConfig, WorkDirs};
use fdist::dispatch::{self, StartOutcome};
use fdist::engine::Engine;
use fdist::fra;
use fdist::fsa::{self, Protocol, SlotState};
use fdist::ingest;
use fdist::mdb;
use fdist::msg::{MsgFifoRecord, ORIGIN_MSG_GENERATOR};
use fdist::queue::{self, ProcState};

static TEST_COUNTER: AtomicU64 = AtomicU64::new(1);

fn unique_work_dir(tag: &str) -> PathBuf {
    let now_ns = SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_nanos();
    let pid = std::process::id();
    let cnt = TEST_COUNTER.fetch_add(1, Ordering::Relaxed);
    std::env::temp_dir().join(format!("fdist_dtest_{}_{}_{}_{}", tag, now_ns, pid, cnt))
}

fn make_engine(tag: &str, cfg: FdConfig) -> Engine {
    let dirs = WorkDirs::at(unique_work_dir(tag));
    Engine::new(cfg, dirs, false).expect("engine")
}

fn seed_send_job(e: &mut Engine, host_pos: usize, job_id: u32, ageing: u8, age_limit: u32) -> usize {
    let alias = e.fsa.entries()[host_pos].alias().to_string();
    mdb::append(
        &mut e.mdb,
        job_id,
        host_pos as i32,
        &alias,
        Protocol::Loc as u32,
        0,
        age_limit,
        ageing,
        0,
    )
    .expect("mdb append")
}

fn enqueue_send(e: &mut Engine, job_id: u32, creation: i64, unique: u32) -> MsgFifoRecord {
    let rec = MsgFifoRecord {
        creation_time: creation,
        file_size_to_send: 4096,
        dev: 0,
        job_id,
        split_job_counter: 0,
        files_to_send: 2,
        dir_no: 1,
        unique_number: unique,
        priority: b'5',
        originator: ORIGIN_MSG_GENERATOR,
    };
    ingest::queue_send_job(e, &rec, creation).expect("queue job");
    rec
}

fn cleanup(e: &Engine) {
    let _ = std::fs::remove_dir_all(&e.dirs.root);
}

// A running fetch for a dir blocks a second one; the dir stays marked.
#[test]
fn single_retrieve_guard_removes_duplicate_fetch() {
    let mut e = make_engine("guard", FdConfig::default());
    let host_pos =
        fsa::add_host(&mut e.fsa, "oslo", "oslo.example", Protocol::Ftp, 2).expect("host");
    fra::add_dir(&mut e.fra, "obs", "oslo", 0x77, host_pos as i32, Protocol::Ftp, b'3')
        .expect("dir");

    // pretend slot 0 already fetches dir 0x77
    {
        let host = &mut e.fsa.entries_mut()[host_pos];
        host.active_transfers = 1;
        host.job_status[0].proc_id = 99_999;
        host.job_status[0].job_id = 0x77;
    }

    let now = fdist::util::now();
    ingest::synth_fetch_jobs(&mut e, now);
    assert_eq!(e.qb.count(), 1);
    assert_eq!(e.fra.entries()[0].queued, 1);

    let outcome = dispatch::start_process(&mut e, 0, now, false);
    assert_eq!(outcome, StartOutcome::Removed);
    queue::remove(&mut e.qb, 0);
    assert_eq!(e.qb.count(), 0);
    assert_eq!(e.fra.entries()[0].queued, 1, "the running child still covers the dir");
    assert_eq!(e.fsa.entries()[host_pos].jobs_queued, 0);
    cleanup(&e);
}

// An expired send job is purged through the delete log.
#[test]
fn age_limit_purges_job_with_delete_log_record() {
    let mut e = make_engine("ageout", FdConfig::default());
    let host_pos =
        fsa::add_host(&mut e.fsa, "kiel", "kiel.example", Protocol::Loc, 1).expect("host");
    seed_send_job(&mut e, host_pos, 0x51, 0, 60);

    let now = fdist::util::now();
    let rec = enqueue_send(&mut e, 0x51, now - 120, 9);
    let name_buf = rec.msg_name();
    let name = fdist::msg::msg_name_str(&name_buf).to_string();
    let job_dir = e.dirs.job_files(&name);
    std::fs::create_dir_all(&job_dir).expect("job dir");
    std::fs::write(job_dir.join("payload.dat"), b"abc").expect("payload");

    let outcome = dispatch::start_process(&mut e, 0, now, false);
    assert_eq!(outcome, StartOutcome::Removed);
    queue::remove(&mut e.qb, 0);

    assert!(!job_dir.exists(), "files must be gone");
    assert_eq!(e.fsa.entries()[host_pos].jobs_queued, 0);
    let log = std::fs::read_to_string(e.dirs.delete_log()).expect("delete log");
    assert!(log.contains("AGE_OUTPUT"), "log was: {}", log);
    assert!(log.contains(&name));
    cleanup(&e);
}

// A worker that published its ready-handshake absorbs the second job
// without a fork.
#[test]
fn burst_hands_job_to_open_worker() {
    let mut e = make_engine("burst", FdConfig::default());
    let host_pos =
        fsa::add_host(&mut e.fsa, "gent", "gent.example", Protocol::Loc, 2).expect("host");
    seed_send_job(&mut e, host_pos, 0x42, 0, 0);

    // a live process standing in for an open worker
    let mut child = std::process::Command::new("sh")
        .arg("-c")
        .arg("sleep 30")
        .spawn()
        .expect("sleeper");
    let pid = child.id() as i32;

    {
        let host = &mut e.fsa.entries_mut()[host_pos];
        host.active_transfers = 1;
        let js = &mut host.job_status[0];
        js.proc_id = pid;
        js.state = SlotState::ReadyForMoreWork as u8;
        js.name_in_use = 1;
        js.job_id = 0x42;
    }
    let conn_pos = e.conns.alloc().expect("slot");
    {
        let slot = e.conns.get_mut(conn_pos).unwrap();
        slot.hostname = "gent.example".to_string();
        slot.host_id = e.fsa.entries()[host_pos].host_id;
        slot.fsa_pos = host_pos as i32;
        slot.fra_pos = -1;
        slot.protocol = Some(Protocol::Loc);
        slot.port = 0;
        slot.job_no = 0;
        slot.pid = pid;
    }
    e.status_mut().no_of_transfers = 1;

    let now = fdist::util::now();
    enqueue_send(&mut e, 0x42, now, 11);
    let forks_before = e.status().fork_counter;

    let outcome = dispatch::start_process(&mut e, 0, now, false);
    assert_eq!(outcome, StartOutcome::Bursted(pid));
    assert_eq!(e.status().burst2_counter, 1);
    assert_eq!(e.status().fork_counter, forks_before, "no fork on a burst");
    assert_eq!(e.qb.entries()[0].pid, pid, "entry rides on the open worker");
    assert_eq!(e.fsa.entries()[host_pos].jobs_queued, 0);
    // ack queue disabled: the engine removes the handed entry
    queue::remove(&mut e.qb, 0);
    assert_eq!(e.qb.count(), 0);
    // the worker slot now shows the handed-off name
    let js = e.fsa.entries()[host_pos].job_status[0];
    assert_eq!(js.unique_name, e.conns.get(conn_pos).unwrap().msg_name);

    unsafe {
        libc::kill(pid, libc::SIGKILL);
    }
    let _ = child.wait();
    cleanup(&e);
}

// A host whose bursting is disabled always takes the fork path decision,
// never a handoff.
#[test]
fn burst_disabled_option_skips_handoff() {
    let mut e = make_engine("noburst", FdConfig::default());
    let host_pos =
        fsa::add_host(&mut e.fsa, "lyon", "lyon.example", Protocol::Loc, 2).expect("host");
    seed_send_job(&mut e, host_pos, 0x43, 0, 0);
    {
        let host = &mut e.fsa.entries_mut()[host_pos];
        host.protocol_options = fdist::fsa::ProtocolOptions::DISABLE_BURSTING.bits();
        host.active_transfers = 1;
        let js = &mut host.job_status[0];
        js.proc_id = 77_777;
        js.state = SlotState::ReadyForMoreWork as u8;
        js.name_in_use = 1;
    }
    let now = fdist::util::now();
    enqueue_send(&mut e, 0x43, now, 3);
    // no sf_loc stub installed: the fork path reports Pending rather than
    // a burst to the ready slot
    let outcome = dispatch::start_process(&mut e, 0, now, false);
    assert_eq!(outcome, StartOutcome::Pending);
    assert_eq!(e.status().burst2_counter, 0);
    cleanup(&e);
}

// A stopped host keeps its work pending, whatever the retry state says.
#[test]
fn stopped_host_leaves_entry_pending() {
    let mut e = make_engine("stopped", FdConfig::default());
    let host_pos =
        fsa::add_host(&mut e.fsa, "riga", "riga.example", Protocol::Loc, 1).expect("host");
    seed_send_job(&mut e, host_pos, 0x99, 0, 0);
    e.fsa.entries_mut()[host_pos].set_flag(fdist::fsa::HostFlags::STOP_TRANSFER, true);

    let now = fdist::util::now();
    enqueue_send(&mut e, 0x99, now, 1);
    let outcome = dispatch::start_process(&mut e, 0, now, false);
    assert_eq!(outcome, StartOutcome::Pending);
    assert_eq!(e.qb.entries()[0].state(), ProcState::Pending);
    assert_eq!(e.fsa.entries()[host_pos].jobs_queued, 1);
    cleanup(&e);
}

// Retry admission: a host inside its retry window stays queued until the
// window opens or a retry hint bypasses it.
#[test]
fn retry_window_gates_admission() {
    let mut e = make_engine("retrywin", FdConfig::default());
    let host_pos =
        fsa::add_host(&mut e.fsa, "turin", "turin.example", Protocol::Loc, 1).expect("host");
    seed_send_job(&mut e, host_pos, 0x55, 0, 0);
    let now = fdist::util::now();
    {
        let host = &mut e.fsa.entries_mut()[host_pos];
        host.error_counter = 2;
        host.last_retry_time = now;
        host.retry_interval = 600;
    }
    enqueue_send(&mut e, 0x55, now, 1);
    assert_eq!(dispatch::start_process(&mut e, 0, now, false), StartOutcome::Pending);
    // the same call with the hint set gets past admission (and then parks
    // on the missing worker binary)
    assert_eq!(dispatch::start_process(&mut e, 0, now, true), StartOutcome::Pending);
    // once the window elapses, plain admission passes too
    let later = now + 601;
    assert_eq!(dispatch::start_process(&mut e, 0, later, false), StartOutcome::Pending);
    cleanup(&e);
}
