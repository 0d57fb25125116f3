use std::fs::{File, OpenOptions};
use std::io::{ErrorKind, Read, Write};
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use nix::sys::stat::Mode;

/// Per-tick byte cap for one FIFO drain. A drain that fills the cap leaves
/// the rest in the pipe and reports backpressure; the next tick picks it up.
pub const FIFO_DRAIN_CAP: usize = 16 * 4096;

/// Command bytes accepted on the command FIFO.
pub const CMD_SAVE_STOP: u8 = 1;
pub const CMD_STOP: u8 = 2;
pub const CMD_QUICK_STOP: u8 = 3;
pub const CMD_CHECK_FSA_ENTRIES: u8 = 4;
pub const CMD_FORCE_REMOTE_DIR_CHECK: u8 = 5;
pub const CMD_FLUSH_MSG_FIFO_DUMP_QUEUE: u8 = 6;
pub const CMD_FSA_ABOUT_TO_CHANGE: u8 = 7;
pub const CMD_REREAD_LOC_INTERFACE_FILE: u8 = 8;
/// Monitor-to-generator throttle bytes (shared command alphabet).
pub const CMD_AMG_STOP: u8 = 20;
pub const CMD_AMG_START: u8 = 21;

/// A named FIFO opened read+write and non-blocking. Opening RDWR means the
/// open never blocks waiting for a peer and reads never see EOF when the
/// last writer goes away. Writers send fixed-size records; a partial
/// record at the drain boundary is carried over to the next drain.
pub struct Fifo {
    file: File,
    path: PathBuf,
    carry: Vec<u8>,
}

impl Fifo {
    pub fn open(path: &Path) -> Result<Self> {
        match nix::unistd::mkfifo(path, Mode::from_bits_truncate(0o600)) {
            Ok(()) => {}
            Err(nix::errno::Errno::EEXIST) => {}
            Err(e) => return Err(e).with_context(|| format!("mkfifo {}", path.display())),
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_NONBLOCK)
            .open(path)
            .with_context(|| format!("open fifo {}", path.display()))?;
        Ok(Fifo { file, path: path.to_path_buf(), carry: Vec::new() })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn raw_fd(&self) -> RawFd {
        self.file.as_raw_fd()
    }

    /// Drain complete `N`-byte records. Returns the records plus a
    /// backpressure flag when the cap was hit with data still pending.
    pub fn drain_records<const N: usize>(&mut self) -> (Vec<[u8; N]>, bool) {
        let mut buf = [0u8; 4096];
        let mut hit_cap = false;
        let mut total = self.carry.len();
        loop {
            match self.file.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    self.carry.extend_from_slice(&buf[..n]);
                    total += n;
                    if total >= FIFO_DRAIN_CAP {
                        hit_cap = true;
                        break;
                    }
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => {
                    tracing::warn!("fifo {} read error: {}", self.path.display(), e);
                    break;
                }
            }
        }
        let complete = self.carry.len() / N;
        let mut records = Vec::with_capacity(complete);
        for chunk in self.carry.chunks_exact(N) {
            records.push(<[u8; N]>::try_from(chunk).unwrap());
        }
        self.carry.drain(..complete * N);
        (records, hit_cap)
    }

    /// Single bytes, for the command FIFO.
    pub fn drain_bytes(&mut self) -> Vec<u8> {
        let (records, _) = self.drain_records::<1>();
        records.into_iter().map(|r| r[0]).collect()
    }

    pub fn write_record(&mut self, record: &[u8]) -> std::io::Result<()> {
        self.file.write_all(record)
    }
}

/// Write one record to a FIFO without keeping it open; used by `stop` and
/// the monitor side.
pub fn send_oneshot(path: &Path, record: &[u8]) -> Result<()> {
    let mut file = OpenOptions::new()
        .write(true)
        .custom_flags(libc::O_NONBLOCK)
        .open(path)
        .with_context(|| format!("open fifo {} for write", path.display()))?;
    file.write_all(record).with_context(|| format!("write fifo {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fifo_path(tag: &str) -> PathBuf {
        std::env::temp_dir().join(format!(
            "fdist_fifo_{}_{}_{}",
            tag,
            std::process::id(),
            chrono::Utc::now().timestamp_nanos_opt().unwrap_or(0)
        ))
    }

    #[test]
    fn records_roundtrip_in_order() {
        let path = fifo_path("roundtrip");
        let mut fifo = Fifo::open(&path).expect("open fifo");
        fifo.write_record(&7i32.to_le_bytes()).unwrap();
        fifo.write_record(&(-3i32).to_le_bytes()).unwrap();
        let (records, cap) = fifo.drain_records::<4>();
        assert!(!cap);
        let pids: Vec<i32> = records.iter().map(|r| i32::from_le_bytes(*r)).collect();
        assert_eq!(pids, vec![7, -3]);
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn partial_record_is_carried_over() {
        let path = fifo_path("carry");
        let mut fifo = Fifo::open(&path).expect("open fifo");
        fifo.write_record(&[1, 2, 3]).unwrap();
        let (records, _) = fifo.drain_records::<4>();
        assert!(records.is_empty());
        fifo.write_record(&[4]).unwrap();
        let (records, _) = fifo.drain_records::<4>();
        assert_eq!(records, vec![[1, 2, 3, 4]]);
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn empty_drain_is_clean() {
        let path = fifo_path("empty");
        let mut fifo = Fifo::open(&path).expect("open fifo");
        let (records, cap) = fifo.drain_records::<8>();
        assert!(records.is_empty() && !cap);
        let _ = std::fs::remove_file(&path);
    }
}
