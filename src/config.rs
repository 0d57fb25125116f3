use std::path::{Path, PathBuf};

use anyhow::Result;

pub const MAX_CONFIGURABLE_CONNECTIONS: usize = 512;
pub const DEFAULT_MAX_CONNECTIONS: usize = 50;
pub const DEFAULT_REMOTE_FILE_CHECK_INTERVAL: i64 = 150;

/// Runtime configuration of the distribution core, read from
/// `<work_dir>/etc/fdist.conf` at startup and on SIGHUP. Two parses of the
/// same file yield an equal struct, reload is idempotent.
#[derive(Debug, Clone, PartialEq)]
pub struct FdConfig {
    pub max_connections: usize,
    pub remote_file_check_interval: i64,
    pub default_age_limit: u32,
    pub default_ageing: u8,
    pub create_target_dir: bool,
    pub create_target_dir_mode: u32,
    pub create_source_dir_mode: u32,
    pub create_remote_source_dir: bool,
    pub sf_force_disconnect: i64,
    pub gf_force_disconnect: i64,
    pub simulate_send_mode: bool,
    pub default_http_proxy: String,
    pub default_smtp_server: String,
    pub default_charset: String,
    pub default_smtp_from: String,
    pub default_smtp_reply_to: String,
    pub default_group_mail_domain: String,
    pub default_de_mail_sender: String,
    pub delete_stale_error_jobs: bool,
    pub fd_priority: i32,
    pub add_afd_priority: bool,
    pub max_nice_value: i32,
    pub min_nice_value: i32,
    pub burst_ack_queue: bool,
}

impl Default for FdConfig {
    fn default() -> Self {
        FdConfig {
            max_connections: DEFAULT_MAX_CONNECTIONS,
            remote_file_check_interval: DEFAULT_REMOTE_FILE_CHECK_INTERVAL,
            default_age_limit: 0,
            default_ageing: 0,
            create_target_dir: false,
            create_target_dir_mode: 0,
            create_source_dir_mode: 0,
            create_remote_source_dir: false,
            sf_force_disconnect: 0,
            gf_force_disconnect: 0,
            simulate_send_mode: false,
            default_http_proxy: String::new(),
            default_smtp_server: String::new(),
            default_charset: String::new(),
            default_smtp_from: String::new(),
            default_smtp_reply_to: String::new(),
            default_group_mail_domain: String::new(),
            default_de_mail_sender: String::new(),
            delete_stale_error_jobs: false,
            fd_priority: 0,
            add_afd_priority: false,
            max_nice_value: 19,
            min_nice_value: -20,
            burst_ack_queue: false,
        }
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.to_ascii_uppercase().as_str() {
        "YES" => Some(true),
        "NO" => Some(false),
        _ => None,
    }
}

/// `YES`, `NO`, or an octal mode; `YES` means "create with default mode".
fn parse_mode(value: &str) -> (bool, u32) {
    if let Some(b) = parse_bool(value) {
        return (b, 0);
    }
    match u32::from_str_radix(value.trim_start_matches("0o").trim_start_matches('0'), 8) {
        Ok(mode) if mode != 0 => (true, mode),
        _ => (false, 0),
    }
}

/// Expand `%h` (short) and `%H` (fully qualified) hostname placeholders.
fn expand_hostname(value: &str) -> String {
    if !value.contains('%') {
        return value.to_string();
    }
    let full = nix::unistd::gethostname()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "localhost".to_string());
    let short = full.split('.').next().unwrap_or(&full).to_string();
    value.replace("%H", &full).replace("%h", &short)
}

impl FdConfig {
    pub fn load(path: &Path) -> Result<Self> {
        match std::fs::read_to_string(path) {
            Ok(text) => Ok(Self::parse(&text)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(FdConfig::default()),
            Err(e) => Err(e.into()),
        }
    }

    pub fn parse(text: &str) -> Self {
        let mut cfg = FdConfig::default();
        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let mut parts = line.splitn(2, char::is_whitespace);
            let key = parts.next().unwrap_or("");
            let value = parts.next().unwrap_or("").trim();
            match key {
                "MAX_CONNECTIONS" => {
                    // out-of-range values fall back to the default
                    cfg.max_connections = match value.parse::<usize>() {
                        Ok(n) if (1..=MAX_CONFIGURABLE_CONNECTIONS).contains(&n) => n,
                        _ => DEFAULT_MAX_CONNECTIONS,
                    };
                }
                "REMOTE_FILE_CHECK_INTERVAL" => {
                    cfg.remote_file_check_interval =
                        value.parse::<i64>().unwrap_or(DEFAULT_REMOTE_FILE_CHECK_INTERVAL).max(1);
                }
                "DEFAULT_AGE_LIMIT" => {
                    cfg.default_age_limit = value.parse().unwrap_or(0);
                }
                "DEFAULT_AGEING" => {
                    cfg.default_ageing = value.parse::<u8>().unwrap_or(0).min(9);
                }
                "CREATE_TARGET_DIR" => {
                    let (on, mode) = parse_mode(value);
                    cfg.create_target_dir = on;
                    if mode != 0 {
                        cfg.create_target_dir_mode = mode;
                    }
                }
                "CREATE_TARGET_DIR_MODE" => {
                    let (_, mode) = parse_mode(value);
                    cfg.create_target_dir_mode = mode;
                }
                "CREATE_SOURCE_DIR_MODE" => {
                    let (_, mode) = parse_mode(value);
                    cfg.create_source_dir_mode = mode;
                }
                "CREATE_REMOTE_SOURCE_DIR" => {
                    cfg.create_remote_source_dir = parse_bool(value).unwrap_or(false);
                }
                "SF_FORCE_DISCONNECT" => {
                    cfg.sf_force_disconnect = value.parse().unwrap_or(0);
                }
                "GF_FORCE_DISCONNECT" => {
                    cfg.gf_force_disconnect = value.parse().unwrap_or(0);
                }
                "SIMULATE_SEND_MODE" => {
                    cfg.simulate_send_mode = parse_bool(value).unwrap_or(false);
                }
                "DEFAULT_HTTP_PROXY" => cfg.default_http_proxy = expand_hostname(value),
                "DEFAULT_SMTP_SERVER" => cfg.default_smtp_server = expand_hostname(value),
                "DEFAULT_CHARSET" => cfg.default_charset = value.to_string(),
                "DEFAULT_SMTP_FROM" => cfg.default_smtp_from = expand_hostname(value),
                "DEFAULT_SMTP_REPLY_TO" => cfg.default_smtp_reply_to = expand_hostname(value),
                "DEFAULT_GROUP_MAIL_DOMAIN" => {
                    cfg.default_group_mail_domain = expand_hostname(value)
                }
                "DEFAULT_DE_MAIL_SENDER" => cfg.default_de_mail_sender = expand_hostname(value),
                "DELETE_STALE_ERROR_JOBS" => {
                    cfg.delete_stale_error_jobs = parse_bool(value).unwrap_or(false);
                }
                "FD_PRIORITY" => cfg.fd_priority = value.parse().unwrap_or(0),
                "ADD_AFD_PRIORITY" => {
                    cfg.add_afd_priority = parse_bool(value).unwrap_or(false);
                }
                "MAX_NICE_VALUE" => {
                    cfg.max_nice_value = value.parse::<i32>().unwrap_or(19).clamp(-20, 19)
                }
                "MIN_NICE_VALUE" => {
                    cfg.min_nice_value = value.parse::<i32>().unwrap_or(-20).clamp(-20, 19)
                }
                "BURST_ACK_QUEUE" => {
                    cfg.burst_ack_queue = parse_bool(value).unwrap_or(false);
                }
                _ => {
                    tracing::warn!("unknown config key '{}' skipped", key);
                }
            }
        }
        cfg
    }
}

/// Directory layout under one work dir. Everything the daemon touches
/// lives below this root.
#[derive(Debug, Clone)]
pub struct WorkDirs {
    pub root: PathBuf,
    pub state: PathBuf,
    pub fifo: PathBuf,
    pub logs: PathBuf,
    pub etc: PathBuf,
    /// ready-to-send file sets, one subdir per message name
    pub outgoing: PathBuf,
    /// on-disk message files, one per job id
    pub messages: PathBuf,
    /// protocol worker binaries, searched before PATH
    pub sbin: PathBuf,
}

impl WorkDirs {
    /// Resolve the work dir: explicit flag, then `FDIST_WORK_DIR`, then
    /// `~/.fdist`.
    pub fn resolve(flag: Option<PathBuf>) -> Result<Self> {
        let root = match flag {
            Some(p) => p,
            None => match std::env::var_os("FDIST_WORK_DIR") {
                Some(v) => PathBuf::from(v),
                None => match dirs::home_dir() {
                    Some(home) => home.join(".fdist"),
                    None => {
                        return Err(crate::error::FdError::WorkDirUnusable(
                            PathBuf::from("~"),
                            "cannot determine home directory".to_string(),
                        )
                        .into());
                    }
                },
            },
        };
        Ok(Self::at(root))
    }

    pub fn at(root: PathBuf) -> Self {
        WorkDirs {
            state: root.join("state"),
            fifo: root.join("fifo"),
            logs: root.join("logs"),
            etc: root.join("etc"),
            outgoing: root.join("outgoing"),
            messages: root.join("messages"),
            sbin: root.join("sbin"),
            root,
        }
    }

    pub fn ensure(&self) -> Result<()> {
        for dir in [
            &self.root,
            &self.state,
            &self.fifo,
            &self.logs,
            &self.etc,
            &self.outgoing,
            &self.messages,
            &self.sbin,
        ] {
            std::fs::create_dir_all(dir).map_err(|e| {
                crate::error::FdError::WorkDirUnusable(dir.clone(), e.to_string())
            })?;
        }
        Ok(())
    }

    pub fn conf_file(&self) -> PathBuf {
        self.etc.join("fdist.conf")
    }

    pub fn local_interface_file(&self) -> PathBuf {
        self.etc.join("local_interfaces")
    }

    pub fn active_lock(&self) -> PathBuf {
        self.state.join("active.lock")
    }

    pub fn status_snapshot(&self) -> PathBuf {
        self.state.join("status.json")
    }

    pub fn fsa_file(&self) -> PathBuf {
        self.state.join("fsa.stat")
    }

    pub fn fra_file(&self) -> PathBuf {
        self.state.join("fra.stat")
    }

    pub fn queue_file(&self) -> PathBuf {
        self.state.join("queue.stat")
    }

    pub fn mdb_file(&self) -> PathBuf {
        self.state.join("msgcache.stat")
    }

    pub fn ack_file(&self) -> PathBuf {
        self.state.join("ack.stat")
    }

    pub fn daemon_status_file(&self) -> PathBuf {
        self.state.join("daemon.stat")
    }

    pub fn command_fifo(&self) -> PathBuf {
        self.fifo.join("command.fifo")
    }

    pub fn msg_fifo(&self) -> PathBuf {
        self.fifo.join("msg.fifo")
    }

    pub fn finish_fifo(&self) -> PathBuf {
        self.fifo.join("finish.fifo")
    }

    pub fn retry_fifo(&self) -> PathBuf {
        self.fifo.join("retry.fifo")
    }

    pub fn delete_fifo(&self) -> PathBuf {
        self.fifo.join("delete.fifo")
    }

    pub fn trl_fifo(&self) -> PathBuf {
        self.fifo.join("trl.fifo")
    }

    pub fn ack_fifo(&self) -> PathBuf {
        self.fifo.join("ack.fifo")
    }

    pub fn amg_fifo(&self) -> PathBuf {
        self.fifo.join("amg.fifo")
    }

    pub fn delete_log(&self) -> PathBuf {
        self.logs.join("delete.jsonl")
    }

    /// Directory holding the files of one queued job.
    pub fn job_files(&self, msg_name: &str) -> PathBuf {
        self.outgoing.join(msg_name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_applied_on_empty() {
        let cfg = FdConfig::parse("");
        assert_eq!(cfg.max_connections, DEFAULT_MAX_CONNECTIONS);
        assert_eq!(cfg.remote_file_check_interval, DEFAULT_REMOTE_FILE_CHECK_INTERVAL);
    }

    #[test]
    fn out_of_range_connections_fall_back() {
        let cfg = FdConfig::parse("MAX_CONNECTIONS 100000\n");
        assert_eq!(cfg.max_connections, DEFAULT_MAX_CONNECTIONS);
        let cfg = FdConfig::parse("MAX_CONNECTIONS 0\n");
        assert_eq!(cfg.max_connections, DEFAULT_MAX_CONNECTIONS);
        let cfg = FdConfig::parse("MAX_CONNECTIONS 8\n");
        assert_eq!(cfg.max_connections, 8);
    }

    #[test]
    fn check_interval_floors_at_one_second() {
        let cfg = FdConfig::parse("REMOTE_FILE_CHECK_INTERVAL 0\n");
        assert_eq!(cfg.remote_file_check_interval, 1);
    }

    #[test]
    fn modes_accept_octal_and_yes_no() {
        let cfg = FdConfig::parse("CREATE_TARGET_DIR 0755\n");
        assert!(cfg.create_target_dir);
        assert_eq!(cfg.create_target_dir_mode, 0o755);
        let cfg = FdConfig::parse("CREATE_TARGET_DIR YES\n");
        assert!(cfg.create_target_dir);
        assert_eq!(cfg.create_target_dir_mode, 0);
        let cfg = FdConfig::parse("CREATE_TARGET_DIR NO\n");
        assert!(!cfg.create_target_dir);
    }

    #[test]
    fn parse_is_idempotent() {
        let text = "MAX_CONNECTIONS 12\nDEFAULT_AGEING 3\nSIMULATE_SEND_MODE YES\n";
        assert_eq!(FdConfig::parse(text), FdConfig::parse(text));
    }

    #[test]
    fn unknown_keys_are_skipped() {
        let cfg = FdConfig::parse("NO_SUCH_KEY 42\nMAX_CONNECTIONS 4\n");
        assert_eq!(cfg.max_connections, 4);
    }
}
