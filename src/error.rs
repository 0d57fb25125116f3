/// Repository-wide structured errors for the distribution core.
///
/// Worker exit codes are a stable integer contract shared with the
/// per-protocol sender/fetcher binaries; keep the numeric values frozen.
#[derive(Debug, Clone)]
pub enum FdError {
    /// 区域文件版本不符，拒绝挂载 — Region file carries an unknown version, refuse to attach
    RegionVersion(std::path::PathBuf, u8, u8),
    /// Region entry size hash mismatch (struct changed across builds)
    RegionSizeHash(std::path::PathBuf, u16, u16),
    /// Region file shorter than its own header claims
    RegionTruncated(std::path::PathBuf),
    /// A FIFO delivered a record that does not parse
    FifoGarbage(&'static str, usize),
    /// Message references a job id the cache does not know
    LookupFailure(u32),
    /// A FIFO drain hit the per-tick buffer cap; remainder stays queued
    Backpressure(&'static str),
    /// Another monitor already holds the active lock
    DuplicateInstance(std::path::PathBuf),
    /// Connection table has no free slot
    SlotStarvation,
    WorkDirUnusable(std::path::PathBuf, String),
}

impl std::fmt::Display for FdError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        use FdError::*;
        match self {
            RegionVersion(p, got, want) => {
                write!(f, "region {} has version {} (expected {})", p.display(), got, want)
            }
            RegionSizeHash(p, got, want) => {
                write!(f, "region {} entry size hash {:#x} != {:#x}", p.display(), got, want)
            }
            RegionTruncated(p) => write!(f, "region {} is truncated", p.display()),
            FifoGarbage(name, len) => {
                write!(f, "fifo {} delivered a malformed record ({} bytes)", name, len)
            }
            LookupFailure(id) => write!(f, "job id {:#x} not found in message cache", id),
            Backpressure(name) => write!(f, "fifo {} drain hit the buffer cap", name),
            DuplicateInstance(p) => {
                write!(f, "another instance already holds the lock on {}", p.display())
            }
            SlotStarvation => write!(f, "no free connection slot"),
            WorkDirUnusable(p, msg) => {
                write!(f, "work dir {} unusable: {}", p.display(), msg)
            }
        }
    }
}

impl std::error::Error for FdError {}

/// Exit codes returned by the sender/fetcher worker binaries.
///
/// The discriminants are the on-the-wire contract; a worker compiled last
/// year must still classify the same way.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum TransferCode {
    TransferSuccess = 0,
    StillFilesToSend = 1,
    NoFilesToSend = 2,

    SyntaxError = 10,
    NoMessageFile = 11,
    JidNumberError = 12,

    OpenFileDirError = 20,
    TimeoutError = 21,
    ConnectionResetError = 22,
    PipeClosedError = 23,
    ConnectError = 24,
    ConnectionRefusedError = 25,
    UserError = 26,
    PasswordError = 27,
    RemoteUserError = 28,
    ChdirError = 29,
    MkdirError = 30,
    StatTargetError = 31,
    StatRemoteError = 32,
    WriteRemoteError = 33,
    MoveRemoteError = 34,
    OpenRemoteError = 35,
    DeleteRemoteError = 36,
    ListError = 37,
    ExecError = 38,
    MailError = 39,
    AuthError = 40,
    TypeError = 41,
    DataError = 42,
    ReadLocalError = 43,
    WriteLocalError = 44,
    ReadRemoteError = 45,
    SizeError = 46,
    DateError = 47,
    OpenLocalError = 48,
    WriteLockError = 49,
    RemoveLockfileError = 50,
    QuitError = 51,
    RenameError = 52,
    SelectError = 53,
    StatError = 54,
    LockRegionError = 55,
    UnlockRegionError = 56,
    AllocError = 57,
    FileSizeMatchError = 58,

    GotKilled = 70,
    ProcessNeedsRestart = 71,
}

/// Broad classes the reaper acts on. Classification is total over the
/// enumerated codes; anything outside the enumeration is "unknown" and
/// handled by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitClass {
    /// Transfer done (possibly with more files queued on disk)
    Success,
    /// Nothing to do; may clear an auto-paused host
    SuccessNoFiles,
    /// Message/descriptor is broken, the entry can never succeed
    Fatal,
    /// Worker was deliberately terminated; not the host's fault
    Killed,
    /// Network/credentials/remote filesystem trouble, worth retrying
    Transient,
}

impl TransferCode {
    pub fn from_code(code: i32) -> Option<Self> {
        use TransferCode::*;
        let all = [
            TransferSuccess,
            StillFilesToSend,
            NoFilesToSend,
            SyntaxError,
            NoMessageFile,
            JidNumberError,
            OpenFileDirError,
            TimeoutError,
            ConnectionResetError,
            PipeClosedError,
            ConnectError,
            ConnectionRefusedError,
            UserError,
            PasswordError,
            RemoteUserError,
            ChdirError,
            MkdirError,
            StatTargetError,
            StatRemoteError,
            WriteRemoteError,
            MoveRemoteError,
            OpenRemoteError,
            DeleteRemoteError,
            ListError,
            ExecError,
            MailError,
            AuthError,
            TypeError,
            DataError,
            ReadLocalError,
            WriteLocalError,
            ReadRemoteError,
            SizeError,
            DateError,
            OpenLocalError,
            WriteLockError,
            RemoveLockfileError,
            QuitError,
            RenameError,
            SelectError,
            StatError,
            LockRegionError,
            UnlockRegionError,
            AllocError,
            FileSizeMatchError,
            GotKilled,
            ProcessNeedsRestart,
        ];
        all.into_iter().find(|c| *c as i32 == code)
    }

    pub fn classify(self) -> ExitClass {
        use TransferCode::*;
        match self {
            TransferSuccess | StillFilesToSend => ExitClass::Success,
            NoFilesToSend => ExitClass::SuccessNoFiles,
            SyntaxError | NoMessageFile | JidNumberError => ExitClass::Fatal,
            GotKilled => ExitClass::Killed,
            // everything else is a transient network/credentials/remote-fs
            // condition that retry aging is designed for
            _ => ExitClass::Transient,
        }
    }

    /// Whether a success-class exit still leaves files queued on disk for
    /// this job, meaning the entry must not be removed yet.
    pub fn files_remain(self) -> bool {
        matches!(self, TransferCode::StillFilesToSend)
    }
}

impl std::fmt::Display for TransferCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}({})", self, *self as i32)
    }
}
