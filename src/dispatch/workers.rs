use std::path::PathBuf;
use std::process::{Command, Stdio};

use anyhow::{Context, Result};

use crate::config::{FdConfig, WorkDirs};
use crate::fsa::Protocol;

/// Worker binary for a (protocol, direction, debug, local-interface) key.
/// Senders are `sf_*`, fetchers `gf_*`; a host that resolves onto a local
/// interface with the file-when-local option gets the plain copy worker.
/// Debug builds of the workers carry a `_trace` suffix.
pub fn worker_binary(protocol: Protocol, fetch: bool, debug: bool, local_match: bool) -> String {
    let proto = if local_match && !fetch { "loc" } else { protocol.name() };
    let prefix = if fetch { "gf" } else { "sf" };
    let mut name = format!("{}_{}", prefix, proto);
    if debug {
        name.push_str("_trace");
    }
    name
}

/// Resolve a worker binary: the work dir's `sbin/` wins over PATH so a
/// deployment can pin its own builds.
pub fn resolve_worker(dirs: &WorkDirs, name: &str) -> Result<PathBuf> {
    let local = dirs.sbin.join(name);
    if local.is_file() {
        return Ok(local);
    }
    which::which(name).with_context(|| format!("worker binary '{}' not found", name))
}

/// Everything the argv contract needs beyond the fixed head.
pub struct WorkerJob<'a> {
    pub msg_name: &'a str,
    pub job_no: usize,
    pub fsa_id: u8,
    pub fsa_pos: usize,
    pub fetch: bool,
    pub fra_pos: i32,
    pub resend: bool,
    pub helper: bool,
    pub age_limit: u32,
    pub no_archive: bool,
    pub simulate: bool,
    pub temp_toggle: bool,
    pub smtp: bool,
    pub http: bool,
    pub retries: u32,
    pub hw_crc: bool,
}

/// Fixed positional arguments followed by the optional flags in their
/// contractual order. Workers parse positionally first, then flags.
pub fn build_argv(cfg: &FdConfig, dirs: &WorkDirs, job: &WorkerJob<'_>) -> Vec<String> {
    let mut argv = vec![
        dirs.root.display().to_string(),
        job.job_no.to_string(),
        job.fsa_id.to_string(),
        job.fsa_pos.to_string(),
        job.msg_name.to_string(),
    ];
    if job.no_archive {
        argv.push("-A".to_string());
    }
    if job.resend {
        argv.push("-r".to_string());
    }
    if job.age_limit > 0 {
        argv.push("-a".to_string());
        argv.push(job.age_limit.to_string());
    }
    let force_disconnect = if job.fetch { cfg.gf_force_disconnect } else { cfg.sf_force_disconnect };
    if force_disconnect > 0 {
        argv.push("-e".to_string());
        argv.push(force_disconnect.to_string());
    }
    if job.simulate {
        argv.push("-S".to_string());
    }
    if !job.fetch && cfg.create_target_dir && cfg.create_target_dir_mode != 0 {
        argv.push("-m".to_string());
        argv.push(format!("{:o}", cfg.create_target_dir_mode));
    }
    if job.fetch && cfg.create_remote_source_dir && cfg.create_source_dir_mode != 0 {
        argv.push("-m".to_string());
        argv.push(format!("{:o}", cfg.create_source_dir_mode));
    }
    if job.fetch {
        argv.push(job.fra_pos.to_string());
        if job.helper {
            argv.push("-d".to_string());
        }
        argv.push("-i".to_string());
        argv.push(cfg.remote_file_check_interval.to_string());
    }
    if job.temp_toggle {
        argv.push("-t".to_string());
    }
    if job.smtp {
        if !cfg.default_smtp_from.is_empty() {
            argv.push("-f".to_string());
            argv.push(cfg.default_smtp_from.clone());
        }
        if !cfg.default_smtp_reply_to.is_empty() {
            argv.push("-R".to_string());
            argv.push(cfg.default_smtp_reply_to.clone());
        }
        if !cfg.default_charset.is_empty() {
            argv.push("-C".to_string());
            argv.push(cfg.default_charset.clone());
        }
        if !cfg.default_smtp_server.is_empty() {
            argv.push("-s".to_string());
            argv.push(cfg.default_smtp_server.clone());
        }
        if !cfg.default_group_mail_domain.is_empty() {
            argv.push("-g".to_string());
            argv.push(cfg.default_group_mail_domain.clone());
        }
        if !cfg.default_de_mail_sender.is_empty() {
            argv.push("-D".to_string());
            argv.push(cfg.default_de_mail_sender.clone());
        }
    }
    if job.http && !cfg.default_http_proxy.is_empty() {
        argv.push("-h".to_string());
        argv.push(cfg.default_http_proxy.clone());
    }
    if job.retries > 0 {
        argv.push("-o".to_string());
        argv.push(job.retries.to_string());
    }
    if job.hw_crc {
        argv.push("-c".to_string());
    }
    argv
}

/// Fork a worker. The child runs detached from the engine's stdio; its
/// exit code comes back over the finish FIFO and the reaper.
pub fn spawn_worker(binary: &PathBuf, argv: &[String]) -> std::io::Result<i32> {
    let child = Command::new(binary)
        .args(argv)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()?;
    Ok(child.id() as i32)
}

/// Lower (or raise, root only) a freshly forked worker's scheduling
/// priority per configuration.
pub fn apply_priority(cfg: &FdConfig, pid: i32) {
    if cfg.fd_priority == 0 && !cfg.add_afd_priority {
        return;
    }
    let mut nice = cfg.fd_priority;
    if cfg.add_afd_priority {
        nice += unsafe { libc::getpriority(libc::PRIO_PROCESS, 0) };
    }
    let nice = nice.clamp(cfg.min_nice_value, cfg.max_nice_value);
    let rc = unsafe { libc::setpriority(libc::PRIO_PROCESS, pid as libc::id_t, nice) };
    if rc != 0 {
        tracing::debug!("setpriority({}, {}) refused", pid, nice);
    }
}
