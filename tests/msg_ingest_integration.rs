use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use fdist::config::{FdConfig, WorkDirs};
use fdist::engine::Engine;
use fdist::fra;
use fdist::fsa::{self, Protocol};
use fdist::ingest;
use fdist::msg::{MSG_FIFO_RECORD_SIZE, MsgFifoRecord, ORIGIN_MSG_GENERATOR};

static TEST_COUNTER: AtomicU64 = AtomicU64::new(1);

fn unique_work_dir(tag: &str) -> PathBuf {
    let now_ns = SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_nanos();
    let pid = std::process::id();
    let cnt = TEST_COUNTER.fetch_add(1, Ordering::Relaxed);
    std::env::temp_dir().join(format!("fdist_itest_{}_{}_{}_{}", tag, now_ns, pid, cnt))
}

fn make_engine(tag: &str) -> Engine {
    let dirs = WorkDirs::at(unique_work_dir(tag));
    Engine::new(FdConfig::default(), dirs, false).expect("engine")
}

fn sample_record(job_id: u32, now: i64) -> MsgFifoRecord {
    MsgFifoRecord {
        creation_time: now,
        file_size_to_send: 2048,
        dev: 0,
        job_id,
        split_job_counter: 0,
        files_to_send: 1,
        dir_no: 3,
        unique_number: 21,
        priority: b'4',
        originator: ORIGIN_MSG_GENERATOR,
    }
}

// Records travel through the real FIFO and end up as sorted queue entries;
// garbage on the FIFO is skipped without derailing the drain.
#[test]
fn fifo_records_become_queue_entries() {
    let mut e = make_engine("fifo");
    let host_pos =
        fsa::add_host(&mut e.fsa, "basel", "basel.example", Protocol::Sftp, 1).expect("host");

    let now = fdist::util::now();
    // on-disk message file lets the first sighting resolve the descriptor
    let msg_path = fdist::mdb::message_path(&e.dirs.messages, 0x2a);
    std::fs::write(&msg_path, "destination basel\nprotocol sftp\nport 22\nage-limit 900\n")
        .expect("message file");

    let good = sample_record(0x2a, now);
    e.msg_fifo.write_record(&good.to_bytes()).expect("write record");
    let mut garbage = sample_record(0x2a, now).to_bytes();
    garbage[44] = b'Z'; // invalid priority byte
    e.msg_fifo.write_record(&garbage).expect("write garbage");
    let second = MsgFifoRecord { unique_number: 22, priority: b'2', ..good };
    e.msg_fifo.write_record(&second.to_bytes()).expect("write record");

    ingest::service_msg_fifo(&mut e, now);

    assert_eq!(e.qb.count(), 2, "two good records, one garbage skipped");
    assert!(fdist::queue::is_sorted(&e.qb));
    // the '2'-priority record sorts ahead of the '4' one
    assert_eq!(fdist::msg::msg_name_priority(&e.qb.entries()[0].msg_name), b'2');
    assert_eq!(e.fsa.entries()[host_pos].jobs_queued, 2);

    // descriptor got cached with the message file's options
    let pos = fdist::mdb::lookup(&e.mdb, 0x2a).expect("cached");
    let job = e.mdb.entries()[pos];
    assert_eq!(job.age_limit, 900);
    assert_eq!(job.port, 22);
    assert_eq!(job.fsa_pos, host_pos as i32);

    let _ = std::fs::remove_dir_all(&e.dirs.root);
}

// An unknown job id cannot be queued; its files are purged and accounted
// for in the delete log.
#[test]
fn unknown_job_is_purged_not_queued() {
    let mut e = make_engine("unknown");
    fsa::add_host(&mut e.fsa, "bern", "bern.example", Protocol::Ftp, 1).expect("host");

    let now = fdist::util::now();
    let rec = sample_record(0xBEEF, now);
    let name_buf = rec.msg_name();
    let name = fdist::msg::msg_name_str(&name_buf).to_string();
    let job_dir = e.dirs.job_files(&name);
    std::fs::create_dir_all(&job_dir).expect("job dir");

    let res = ingest::queue_send_job(&mut e, &rec, now);
    assert!(res.is_err(), "unknown job must fail the lookup");
    assert_eq!(e.qb.count(), 0);
    assert!(!job_dir.exists(), "files of the unknown job are purged");
    let log = std::fs::read_to_string(e.dirs.delete_log()).expect("delete log");
    assert!(log.contains("UNKNOWN_JOB"));

    let _ = std::fs::remove_dir_all(&e.dirs.root);
}

// The LRU-1 memo answers repeated lookups for the same job without a scan.
#[test]
fn repeated_job_ids_hit_the_memo() {
    let mut e = make_engine("memo");
    let host_pos =
        fsa::add_host(&mut e.fsa, "linz", "linz.example", Protocol::Ftp, 1).expect("host");
    let alias = e.fsa.entries()[host_pos].alias().to_string();
    fdist::mdb::append(&mut e.mdb, 0x7, host_pos as i32, &alias, Protocol::Ftp as u32, 21, 0, 0, 0)
        .expect("mdb");

    let now = fdist::util::now();
    for unique in 0..4u32 {
        let rec = MsgFifoRecord { unique_number: unique, ..sample_record(0x7, now) };
        ingest::queue_send_job(&mut e, &rec, now).expect("queue");
    }
    assert_eq!(e.qb.count(), 4);
    assert_eq!(e.mdb_memo, Some((0x7, 0)));
    assert_eq!(e.mdb.count(), 1, "no duplicate cache entries");
    let _ = std::fs::remove_dir_all(&e.dirs.root);
}

// Fetch synthesis queues one entry per due dir and marks it; paused hosts
// and already-queued dirs are skipped.
#[test]
fn fetch_synthesis_respects_queued_and_host_state() {
    let mut e = make_engine("fetch");
    let h_ok = fsa::add_host(&mut e.fsa, "graz", "graz.example", Protocol::Ftp, 1).expect("host");
    let h_paused =
        fsa::add_host(&mut e.fsa, "wien", "wien.example", Protocol::Ftp, 1).expect("host");
    e.fsa.entries_mut()[h_paused].set_flag(fdist::fsa::HostFlags::PAUSE_QUEUE, true);

    fra::add_dir(&mut e.fra, "graz-in", "graz", 0x11, h_ok as i32, Protocol::Ftp, b'6')
        .expect("dir");
    fra::add_dir(&mut e.fra, "wien-in", "wien", 0x12, h_paused as i32, Protocol::Ftp, b'6')
        .expect("dir");

    let now = fdist::util::now();
    ingest::synth_fetch_jobs(&mut e, now);
    assert_eq!(e.qb.count(), 1, "only the unpaused host's dir is queued");
    assert!(e.qb.entries()[0].is_fetch());
    assert_eq!(e.fra.entries()[0].queued, 1);
    assert_eq!(e.fra.entries()[1].queued, 0);
    assert_eq!(e.fsa.entries()[h_ok].jobs_queued, 1);

    // a second pass must not duplicate the queued dir
    ingest::synth_fetch_jobs(&mut e, now + 1);
    assert_eq!(e.qb.count(), 1);

    let _ = std::fs::remove_dir_all(&e.dirs.root);
}

// Wire format sanity directly against the byte layout.
#[test]
fn record_size_is_the_wire_contract() {
    assert_eq!(MSG_FIFO_RECORD_SIZE, 48);
    let now = 1_700_000_000i64;
    let rec = sample_record(0x77, now);
    let bytes = rec.to_bytes();
    assert_eq!(bytes.len(), MSG_FIFO_RECORD_SIZE);
    assert_eq!(MsgFifoRecord::from_bytes(&bytes).expect("parse"), rec);
}
