use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::{Context, Result};
use nix::fcntl::{Flock, FlockArg};
use nix::sys::signal::{Signal, kill};
use nix::sys::wait::{WaitPidFlag, WaitStatus, waitpid};
use nix::unistd::Pid;

use crate::config::WorkDirs;
use crate::error::FdError;
use crate::fifo::{CMD_AMG_START, CMD_AMG_STOP, send_oneshot};
use crate::status::{STATUS_AMG_PAUSED, StatusSnapshot, open_status};
use crate::util::link_count;

/// Bounded wait between SIGINT and SIGKILL during shutdown.
pub const MAX_SHUTDOWN_TIME: i64 = 60;

/// Outgoing-dir link headroom: the generator is stopped when fewer than
/// this many links remain before LINK_MAX, and resumed with three times
/// the headroom back.
const STOP_AMG_THRESHOLD: u64 = 100;
const START_AMG_THRESHOLD: u64 = 300;

/// Heartbeat checks happen every sweep; this many frozen checks in a row
/// restart the core.
const HEARTBEAT_STALL_LIMIT: u32 = 3;
const HEARTBEAT_CHECK_EVERY: u64 = 10;

/// Restart storm damping: after this many restarts inside the window the
/// child waits out a hold-off before the next attempt.
const RESTART_WINDOW: i64 = 60;
const RESTART_LIMIT: usize = 5;
const RESTART_HOLDOFF: i64 = 30;

struct Monitored {
    name: &'static str,
    argv: Vec<String>,
    binary: PathBuf,
    child: Option<Child>,
    must_restart: bool,
    restarts: Vec<i64>,
    holdoff_until: i64,
}

impl Monitored {
    fn pid(&self) -> Option<i32> {
        self.child.as_ref().map(|c| c.id() as i32)
    }

    fn spawn(&mut self) -> Result<()> {
        let child = Command::new(&self.binary)
            .args(&self.argv)
            .stdin(Stdio::null())
            .spawn()
            .with_context(|| format!("spawn {}", self.name))?;
        tracing::info!("started {} as pid {}", self.name, child.id());
        self.child = Some(child);
        Ok(())
    }
}

/// The supervisor parent: owns the active lock, starts the core and its
/// siblings in order, restarts what must not die, watches the core's
/// heartbeat, throttles the message generator near LINK_MAX, and runs the
/// shutdown ordering.
pub fn run_monitor(dirs: WorkDirs, debug: bool) -> Result<()> {
    dirs.ensure()?;
    let lock_path = dirs.active_lock();
    let lock_file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(&lock_path)
        .with_context(|| format!("open {}", lock_path.display()))?;
    let mut lock = match Flock::lock(lock_file, FlockArg::LockExclusiveNonblock) {
        Ok(l) => l,
        Err((_, _)) => return Err(FdError::DuplicateInstance(lock_path).into()),
    };

    let mut stat = open_status(&dirs.daemon_status_file())?;

    // start order: log shippers first so nothing logs into the void, the
    // core last among the required set, optional extras after
    let mut table = build_process_table(&dirs, debug)?;
    for entry in table.iter_mut() {
        if let Err(err) = entry.spawn() {
            if entry.must_restart {
                return Err(err);
            }
            tracing::info!("optional process {} not started: {}", entry.name, err);
        }
    }
    write_active_file(&mut lock, &table)?;

    let term = Arc::new(AtomicBool::new(false));
    signal_hook::flag::register(signal_hook::consts::SIGTERM, Arc::clone(&term))?;
    signal_hook::flag::register(signal_hook::consts::SIGINT, Arc::clone(&term))?;

    let mut last_heartbeat = 0u32;
    let mut stalled_checks = 0u32;
    let mut amg_paused = false;
    let mut sweep = 0u64;

    while !term.load(Ordering::Relaxed) {
        std::thread::sleep(Duration::from_secs(1));
        sweep += 1;
        let now = crate::util::now();

        reap_and_restart(&mut table, now, &term)?;
        write_active_file(&mut lock, &table)?;

        if sweep % HEARTBEAT_CHECK_EVERY == 0 {
            let heartbeat = stat.entries()[0].heartbeat;
            if heartbeat == last_heartbeat {
                stalled_checks += 1;
                if stalled_checks >= HEARTBEAT_STALL_LIMIT {
                    restart_core(&mut table, now)?;
                    stalled_checks = 0;
                }
            } else {
                stalled_checks = 0;
            }
            last_heartbeat = heartbeat;
        }

        amg_paused = throttle_amg(&dirs, &mut stat, amg_paused);
    }

    shutdown(&mut table, &dirs, &stat)?;
    drop(lock);
    let _ = std::fs::remove_file(&lock_path);
    Ok(())
}

fn build_process_table(dirs: &WorkDirs, debug: bool) -> Result<Vec<Monitored>> {
    let self_exe = std::env::current_exe().context("resolve own binary")?;
    let mut core_argv = vec![
        "run".to_string(),
        "--work-dir".to_string(),
        dirs.root.display().to_string(),
    ];
    if debug {
        core_argv.push("--debug".to_string());
    }
    let mut table = Vec::new();
    // sibling daemons ship separately; present in sbin/ means wanted
    for (name, must_restart) in [
        ("fdist_system_log", true),
        ("fdist_transfer_log", true),
        ("fdist_archive_watch", false),
        ("fdist_amg", false),
    ] {
        let binary = dirs.sbin.join(name);
        if binary.is_file() {
            table.push(Monitored {
                name,
                argv: vec![dirs.root.display().to_string()],
                binary,
                child: None,
                must_restart,
                restarts: Vec::new(),
                holdoff_until: 0,
            });
        } else {
            tracing::info!("sibling {} not installed, skipping", name);
        }
    }
    table.push(Monitored {
        name: "fdist_core",
        argv: core_argv,
        binary: self_exe,
        child: None,
        must_restart: true,
        restarts: Vec::new(),
        holdoff_until: 0,
    });
    Ok(table)
}

fn write_active_file(lock: &mut Flock<std::fs::File>, table: &[Monitored]) -> Result<()> {
    let pids: serde_json::Map<String, serde_json::Value> = table
        .iter()
        .map(|p| {
            (p.name.to_string(), serde_json::Value::from(p.pid().unwrap_or(0)))
        })
        .collect();
    let obj = serde_json::json!({
        "monitor_pid": std::process::id(),
        "children": pids,
    });
    use std::io::Seek;
    lock.set_len(0)?;
    lock.rewind()?;
    writeln!(lock, "{}", serde_json::to_string_pretty(&obj)?)?;
    Ok(())
}

/// Collect exited children and restart the ones that must not die, with
/// storm damping.
fn reap_and_restart(table: &mut Vec<Monitored>, now: i64, term: &AtomicBool) -> Result<()> {
    loop {
        let (pid, status) = match waitpid(Pid::from_raw(-1), Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::Exited(pid, code)) => (pid.as_raw(), code),
            Ok(WaitStatus::Signaled(pid, sig, _)) => (pid.as_raw(), 128 + sig as i32),
            _ => break,
        };
        let Some(entry) = table.iter_mut().find(|p| p.pid() == Some(pid)) else {
            continue;
        };
        tracing::warn!("{} (pid {}) exited with {}", entry.name, pid, status);
        entry.child = None;
        if !entry.must_restart || term.load(Ordering::Relaxed) {
            continue;
        }
        entry.restarts.retain(|t| now - t < RESTART_WINDOW);
        if entry.restarts.len() >= RESTART_LIMIT {
            if entry.holdoff_until <= now {
                tracing::error!(
                    "{} restarting too fast, holding off {}s",
                    entry.name,
                    RESTART_HOLDOFF
                );
                entry.holdoff_until = now + RESTART_HOLDOFF;
            }
            continue;
        }
        entry.restarts.push(now);
        entry.spawn()?;
    }
    // children past their hold-off get another chance
    for entry in table.iter_mut() {
        if entry.child.is_none()
            && entry.must_restart
            && entry.holdoff_until != 0
            && entry.holdoff_until <= now
            && !term.load(Ordering::Relaxed)
        {
            entry.holdoff_until = 0;
            entry.restarts.clear();
            entry.spawn()?;
        }
    }
    Ok(())
}

/// The core stopped ticking: kill and respawn it.
fn restart_core(table: &mut [Monitored], now: i64) -> Result<()> {
    let Some(core) = table.iter_mut().find(|p| p.name == "fdist_core") else {
        return Ok(());
    };
    if let Some(pid) = core.pid() {
        tracing::error!("core heartbeat frozen, killing pid {}", pid);
        let _ = kill(Pid::from_raw(pid), Signal::SIGKILL);
        if let Some(mut child) = core.child.take() {
            let _ = child.wait();
        }
    }
    core.restarts.push(now);
    core.spawn()
}

/// Hysteresis throttle on the generator: stop it when the outgoing dir
/// runs out of link headroom, start it again once enough is back.
fn throttle_amg(
    dirs: &WorkDirs,
    stat: &mut crate::region::Region<crate::status::DaemonStatus>,
    paused: bool,
) -> bool {
    let link_max = path_link_max(&dirs.outgoing);
    let links = link_count(&dirs.outgoing);
    let next = if !paused && links + STOP_AMG_THRESHOLD >= link_max {
        tracing::warn!("outgoing dir at {} links (max {}), pausing generator", links, link_max);
        let _ = send_oneshot(&dirs.amg_fifo(), &[CMD_AMG_STOP]);
        true
    } else if paused && links + START_AMG_THRESHOLD < link_max {
        tracing::info!("outgoing dir back to {} links, resuming generator", links);
        let _ = send_oneshot(&dirs.amg_fifo(), &[CMD_AMG_START]);
        false
    } else {
        paused
    };
    let entry = &mut stat.entries_mut()[0];
    if next {
        entry.flags |= STATUS_AMG_PAUSED;
    } else {
        entry.flags &= !STATUS_AMG_PAUSED;
    }
    next
}

fn path_link_max(path: &std::path::Path) -> u64 {
    use std::os::unix::ffi::OsStrExt;
    let Ok(cpath) = std::ffi::CString::new(path.as_os_str().as_bytes()) else {
        return 32_000;
    };
    let v = unsafe { libc::pathconf(cpath.as_ptr(), libc::_PC_LINK_MAX) };
    if v <= 0 { 32_000 } else { v as u64 }
}

/// Shutdown ordering: SIGINT everything, poll up to the bound, SIGKILL
/// stragglers, persist the status snapshot, release the active file.
fn shutdown(
    table: &mut [Monitored],
    dirs: &WorkDirs,
    stat: &crate::region::Region<crate::status::DaemonStatus>,
) -> Result<()> {
    tracing::info!("shutting down");
    for entry in table.iter() {
        if let Some(pid) = entry.pid() {
            let _ = kill(Pid::from_raw(pid), Signal::SIGINT);
        }
    }
    let deadline = crate::util::now() + MAX_SHUTDOWN_TIME;
    loop {
        let mut alive = 0usize;
        for entry in table.iter_mut() {
            let done = match entry.child.as_mut() {
                Some(child) => matches!(child.try_wait(), Ok(Some(_))),
                None => continue,
            };
            if done {
                entry.child = None;
            } else {
                alive += 1;
            }
        }
        if alive == 0 {
            break;
        }
        if crate::util::now() >= deadline {
            for entry in table.iter_mut() {
                if let Some(pid) = entry.pid() {
                    tracing::warn!("killing straggler {} (pid {})", entry.name, pid);
                    let _ = kill(Pid::from_raw(pid), Signal::SIGKILL);
                }
                if let Some(mut child) = entry.child.take() {
                    let _ = child.wait();
                }
            }
            break;
        }
        std::thread::sleep(Duration::from_millis(200));
    }
    let snapshot = StatusSnapshot::from_region(&stat.entries()[0]);
    if let Err(err) = snapshot.save(&dirs.status_snapshot()) {
        tracing::warn!("status snapshot not written: {}", err);
    }
    Ok(())
}
