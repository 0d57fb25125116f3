use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use fdist::config::{FdConfig, WorkDirs};
use fdist::engine::{self, Engine};
use fdist::fsa::{self, HostFlags, Protocol};
use fdist::ingest;
use fdist::mdb;
use fdist::msg::{MsgFifoRecord, ORIGIN_MSG_GENERATOR};
use fdist::queue::{ProcState, SpecialFlags};
use fdist::reaper;

static TEST_COUNTER: AtomicU64 = AtomicU64::new(1);

fn unique_work_dir(tag: &str) -> PathBuf {
    let now_ns = SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_nanos();
    let pid = std::process::id();
    let cnt = TEST_COUNTER.fetch_add(1, Ordering::Relaxed);
    std::env::temp_dir().join(format!("fdist_reap_{}_{}_{}_{}", tag, now_ns, pid, cnt))
}

struct Rig {
    e: Engine,
    host_pos: usize,
}

fn build_rig(tag: &str, exit_code: i32, ageing: u8) -> Rig {
    let dirs = WorkDirs::at(unique_work_dir(tag));
    let mut e = Engine::new(FdConfig::default(), dirs, false).expect("engine");
    let stub = e.dirs.sbin.join("sf_loc");
    std::fs::write(&stub, format!("#!/bin/sh\nexit {}\n", exit_code)).expect("stub");
    let mut perm = std::fs::metadata(&stub).expect("stat").permissions();
    perm.set_mode(0o755);
    std::fs::set_permissions(&stub, perm).expect("chmod");

    let host_pos =
        fsa::add_host(&mut e.fsa, "mainz", "mainz.example", Protocol::Loc, 1).expect("host");
    let alias = e.fsa.entries()[host_pos].alias().to_string();
    mdb::append(&mut e.mdb, 0xA1, host_pos as i32, &alias, Protocol::Loc as u32, 0, 0, ageing, 0)
        .expect("mdb");
    Rig { e, host_pos }
}

fn enqueue_and_run(rig: &mut Rig) -> f64 {
    let now = fdist::util::now();
    let rec = MsgFifoRecord {
        creation_time: now,
        file_size_to_send: 512,
        dev: 0,
        job_id: 0xA1,
        split_job_counter: 0,
        files_to_send: 1,
        dir_no: 1,
        unique_number: 4,
        priority: b'5',
        originator: ORIGIN_MSG_GENERATOR,
    };
    ingest::queue_send_job(&mut rig.e, &rec, now).expect("queue");
    let key_before = rig.e.qb.entries()[0].msg_number;
    engine::dispatch_walk(&mut rig.e, now);
    assert_eq!(rig.e.status().no_of_transfers, 1, "worker must fork");
    key_before
}

fn wait_reaped(rig: &mut Rig) {
    for _ in 0..200 {
        reaper::zombie_check(&mut rig.e, fdist::util::now());
        if rig.e.conns.live_count() == 0 && rig.e.zombies.is_empty() {
            return;
        }
        std::thread::sleep(Duration::from_millis(25));
    }
    panic!("worker never reaped");
}

// All exit classification paths, driven through real forked stubs. Cases
// run sequentially inside one test so reaping stays deterministic.
#[test]
fn exit_code_classification_feeds_back_into_queue_and_host() {
    // TIMEOUT_ERROR: transient, entry requeues with one retry and an aged key
    {
        let mut rig = build_rig("timeout", 21, 2);
        let key_before = enqueue_and_run(&mut rig);
        wait_reaped(&mut rig);
        let e = &rig.e;
        assert_eq!(e.qb.count(), 1, "transient failure keeps the entry");
        let entry = e.qb.entries()[0];
        assert_eq!(entry.state(), ProcState::Pending);
        assert_eq!(entry.connect_pos, -1);
        assert_eq!(entry.retries, 1);
        assert_eq!(entry.msg_number, key_before + 1.0e5, "ageing index 2, first retry");
        let host = e.fsa.entries()[rig.host_pos];
        assert_eq!(host.error_counter, 1);
        assert!(host.first_error_time > 0);
        assert_eq!(host.error_history[0], 21);
        assert_eq!(host.jobs_queued, 1);
        assert!(host.flags().contains(HostFlags::ERROR_QUEUE_SET));
        // admission now sits behind the retry window
        let now = fdist::util::now();
        let outcome = fdist::dispatch::start_process(&mut rig.e, 0, now, false);
        assert_eq!(outcome, fdist::dispatch::StartOutcome::Pending);
        let _ = std::fs::remove_dir_all(&rig.e.dirs.root);
    }

    // SYNTAX_ERROR: terminal, entry leaves the queue without a retry
    {
        let mut rig = build_rig("syntax", 10, 0);
        enqueue_and_run(&mut rig);
        wait_reaped(&mut rig);
        let e = &rig.e;
        assert_eq!(e.qb.count(), 0, "fatal exit removes the entry");
        let host = e.fsa.entries()[rig.host_pos];
        assert_eq!(host.error_counter, 0);
        assert_eq!(host.error_history[0], 10);
        assert_eq!(host.jobs_queued, 0);
        let _ = std::fs::remove_dir_all(&rig.e.dirs.root);
    }

    // GOT_KILLED: not the host's fault, entry requeues without a penalty
    {
        let mut rig = build_rig("killed", 70, 2);
        let key_before = enqueue_and_run(&mut rig);
        wait_reaped(&mut rig);
        let e = &rig.e;
        assert_eq!(e.qb.count(), 1);
        let entry = e.qb.entries()[0];
        assert_eq!(entry.state(), ProcState::Pending);
        assert_eq!(entry.msg_number, key_before, "no ageing on a kill");
        let host = e.fsa.entries()[rig.host_pos];
        assert_eq!(host.error_counter, 0);
        assert_eq!(host.error_history[0], 70);
        assert!(!host.flags().contains(HostFlags::ERROR_QUEUE_SET));
        let _ = std::fs::remove_dir_all(&rig.e.dirs.root);
    }

    // NO_FILES_TO_SEND on an auto-paused host resumes the queue
    {
        let mut rig = build_rig("nofiles", 2, 0);
        {
            let host = &mut rig.e.fsa.entries_mut()[rig.host_pos];
            host.error_counter = 3;
        }
        enqueue_and_run(&mut rig);
        {
            // pause arrives while the worker runs; the empty result clears it
            let host = &mut rig.e.fsa.entries_mut()[rig.host_pos];
            host.set_flag(HostFlags::AUTO_PAUSE_QUEUE, true);
            host.set_flag(HostFlags::PAUSE_QUEUE, true);
        }
        wait_reaped(&mut rig);
        let e = &rig.e;
        assert_eq!(e.qb.count(), 0);
        let host = e.fsa.entries()[rig.host_pos];
        assert_eq!(host.error_counter, 0);
        assert!(!host.flags().contains(HostFlags::AUTO_PAUSE_QUEUE));
        assert!(!host.flags().contains(HostFlags::PAUSE_QUEUE));
        assert_eq!(host.error_history[0], 2);
        let _ = std::fs::remove_dir_all(&rig.e.dirs.root);
    }

    // STILL_FILES_TO_SEND: success for the host, but the entry stays to
    // cover the remaining files
    {
        let mut rig = build_rig("stillfiles", 1, 0);
        enqueue_and_run(&mut rig);
        wait_reaped(&mut rig);
        let e = &rig.e;
        assert_eq!(e.qb.count(), 1, "remaining files keep the entry queued");
        assert_eq!(e.qb.entries()[0].state(), ProcState::Pending);
        let host = e.fsa.entries()[rig.host_pos];
        assert_eq!(host.error_counter, 0);
        assert_eq!(host.first_error_time, 0);
        assert_eq!(host.error_history[0], 1);
        assert_eq!(host.jobs_queued, 1);
        let _ = std::fs::remove_dir_all(&rig.e.dirs.root);
    }

    // burst-miss recovery: a handed-off entry whose files still exist when
    // the worker dies comes back as pending instead of vanishing
    {
        let mut rig = build_rig("burstmiss", 0, 0);
        enqueue_and_run(&mut rig);
        let (qb_name, job_dir) = {
            let entry = &mut rig.e.qb.entries_mut()[0];
            entry.set_flag(SpecialFlags::QUEUED_FOR_BURST, true);
            let name_buf = entry.msg_name;
            let name = fdist::msg::msg_name_str(&name_buf).to_string();
            let dir = rig.e.dirs.job_files(&name);
            (name, dir)
        };
        std::fs::create_dir_all(&job_dir).expect("job dir");
        std::fs::write(job_dir.join("leftover.dat"), b"x").expect("leftover");
        wait_reaped(&mut rig);
        let e = &rig.e;
        assert_eq!(e.qb.count(), 1, "{} must survive the raced handoff", qb_name);
        let entry = e.qb.entries()[0];
        assert_eq!(entry.state(), ProcState::Pending);
        assert!(!entry.flags().contains(SpecialFlags::QUEUED_FOR_BURST));
        assert_eq!(e.fsa.entries()[rig.host_pos].jobs_queued, 1);
        let _ = std::fs::remove_dir_all(&rig.e.dirs.root);
    }

    // and last: the zombie-wait list (sequential with the cases above so
    // the stray-reap sweep cannot steal another case's child)
    unreapable_pid_joins_zombie_list();
}

// A termination record for a pid that has not become reapable yet parks it
// on the zombie-wait list instead of losing it.
fn unreapable_pid_joins_zombie_list() {
    let dirs = WorkDirs::at(unique_work_dir("zombie"));
    let mut e = Engine::new(FdConfig::default(), dirs, false).expect("engine");
    let mut child = std::process::Command::new("sh")
        .arg("-c")
        .arg("sleep 20")
        .spawn()
        .expect("sleeper");
    let pid = child.id() as i32;

    let now = fdist::util::now();
    reaper::reap_pid(&mut e, pid, now);
    assert_eq!(e.zombies.len(), 1, "still-alive child waits on the zombie list");
    assert_eq!(e.zombies[0].pid, pid);
    // a second record for the same pid does not duplicate the entry
    reaper::reap_pid(&mut e, pid, now);
    assert_eq!(e.zombies.len(), 1);

    unsafe {
        libc::kill(pid, libc::SIGKILL);
    }
    let _ = child.wait();
    // the child is gone; the sweep clears the list
    for _ in 0..100 {
        reaper::zombie_check(&mut e, fdist::util::now());
        if e.zombies.is_empty() {
            break;
        }
        std::thread::sleep(Duration::from_millis(20));
    }
    assert!(e.zombies.is_empty());
    let _ = std::fs::remove_dir_all(&e.dirs.root);
}
