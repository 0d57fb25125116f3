use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;

use chrono::Utc;

/// Why a queued job's files were purged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteReason {
    AgeOutput,
    UnknownJob,
    StaleErrorJob,
    HostDisappeared,
    RetrieveDisabled,
    UserRequested,
}

impl DeleteReason {
    pub fn as_str(self) -> &'static str {
        match self {
            DeleteReason::AgeOutput => "AGE_OUTPUT",
            DeleteReason::UnknownJob => "UNKNOWN_JOB",
            DeleteReason::StaleErrorJob => "STALE_ERROR_JOB",
            DeleteReason::HostDisappeared => "HOST_DISAPPEARED",
            DeleteReason::RetrieveDisabled => "RETRIEVE_DISABLED",
            DeleteReason::UserRequested => "USER_REQUESTED",
        }
    }
}

/// Append-only JSON Lines delete log. Every purged job leaves one signed
/// record so downstream tooling can account for files that never arrived.
pub struct DeleteLog {
    path: Option<PathBuf>,
}

impl DeleteLog {
    pub fn new(path: PathBuf) -> Self {
        if let Some(parent) = path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        DeleteLog { path: Some(path) }
    }

    /// A log that swallows records, for tests that don't care.
    pub fn disabled() -> Self {
        DeleteLog { path: None }
    }

    pub fn record(&mut self, msg_name: &str, reason: DeleteReason, files: u32, size: u64) {
        let Some(path) = &self.path else { return };
        let obj = serde_json::json!({
            "msg_name": msg_name,
            "reason": reason.as_str(),
            "files": files,
            "size": size,
            "time": Utc::now().format("%Y%m%dT%H%M%SZ").to_string(),
        });
        match OpenOptions::new().create(true).append(true).open(path) {
            Ok(mut f) => {
                if let Ok(line) = serde_json::to_string(&obj) {
                    let _ = writeln!(f, "{}", line);
                }
            }
            Err(e) => {
                tracing::warn!("delete log {} unavailable: {}", path.display(), e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_append_as_jsonl() {
        let path = std::env::temp_dir().join(format!(
            "fdist_dellog_{}_{}.jsonl",
            std::process::id(),
            Utc::now().timestamp_nanos_opt().unwrap_or(0)
        ));
        let mut log = DeleteLog::new(path.clone());
        log.record("deadbe/7/1_2_3", DeleteReason::AgeOutput, 4, 4096);
        log.record("deadbe/7/4_5_6", DeleteReason::UnknownJob, 1, 10);
        let text = std::fs::read_to_string(&path).expect("read log");
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        let first: serde_json::Value = serde_json::from_str(lines[0]).expect("json");
        assert_eq!(first["reason"], "AGE_OUTPUT");
        assert_eq!(first["files"], 4);
        let _ = std::fs::remove_file(&path);
    }
}
