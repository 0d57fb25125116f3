use crate::error::FdError;

/// Fixed size of the canonical message name buffer. The final byte carries
/// the numeric priority (offset from `'0'`) so the scheduler can read it in
/// constant time without re-parsing the name.
pub const MAX_MSG_NAME_LENGTH: usize = 64;

/// On-the-wire size of one record on the message FIFO.
pub const MSG_FIFO_RECORD_SIZE: usize = 48;

/// Record written by the message generator for every ready-to-send job.
/// Little-endian, fixed layout:
///
/// ```text
///  0  creation_time      i64
///  8  file_size_to_send  u64
/// 16  dev                u64   (filesystem id, 0 when unused)
/// 24  job_id             u32
/// 28  split_job_counter  u32
/// 32  files_to_send      u32
/// 36  dir_no             u32
/// 40  unique_number      u32
/// 44  priority           u8    (ASCII '0'..'9')
/// 45  originator         u8
/// 46  pad                2B
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MsgFifoRecord {
    pub creation_time: i64,
    pub file_size_to_send: u64,
    pub dev: u64,
    pub job_id: u32,
    pub split_job_counter: u32,
    pub files_to_send: u32,
    pub dir_no: u32,
    pub unique_number: u32,
    pub priority: u8,
    pub originator: u8,
}

/// Originator values carried in the record.
pub const ORIGIN_MSG_GENERATOR: u8 = 0;
pub const ORIGIN_RESEND: u8 = 1;

impl MsgFifoRecord {
    pub fn from_bytes(buf: &[u8; MSG_FIFO_RECORD_SIZE]) -> Result<Self, FdError> {
        let rec = MsgFifoRecord {
            creation_time: i64::from_le_bytes(buf[0..8].try_into().unwrap()),
            file_size_to_send: u64::from_le_bytes(buf[8..16].try_into().unwrap()),
            dev: u64::from_le_bytes(buf[16..24].try_into().unwrap()),
            job_id: u32::from_le_bytes(buf[24..28].try_into().unwrap()),
            split_job_counter: u32::from_le_bytes(buf[28..32].try_into().unwrap()),
            files_to_send: u32::from_le_bytes(buf[32..36].try_into().unwrap()),
            dir_no: u32::from_le_bytes(buf[36..40].try_into().unwrap()),
            unique_number: u32::from_le_bytes(buf[40..44].try_into().unwrap()),
            priority: buf[44],
            originator: buf[45],
        };
        if !rec.priority.is_ascii_digit() {
            return Err(FdError::FifoGarbage("msg", MSG_FIFO_RECORD_SIZE));
        }
        Ok(rec)
    }

    pub fn to_bytes(&self) -> [u8; MSG_FIFO_RECORD_SIZE] {
        let mut buf = [0u8; MSG_FIFO_RECORD_SIZE];
        buf[0..8].copy_from_slice(&self.creation_time.to_le_bytes());
        buf[8..16].copy_from_slice(&self.file_size_to_send.to_le_bytes());
        buf[16..24].copy_from_slice(&self.dev.to_le_bytes());
        buf[24..28].copy_from_slice(&self.job_id.to_le_bytes());
        buf[28..32].copy_from_slice(&self.split_job_counter.to_le_bytes());
        buf[32..36].copy_from_slice(&self.files_to_send.to_le_bytes());
        buf[36..40].copy_from_slice(&self.dir_no.to_le_bytes());
        buf[40..44].copy_from_slice(&self.unique_number.to_le_bytes());
        buf[44] = self.priority;
        buf[45] = self.originator;
        buf
    }

    /// Canonical message name:
    /// `[<dev_hex>/]<job_id_hex>/<dir_no_hex>/<creation_hex>_<unique_hex>_<split_hex>`
    /// packed into the fixed buffer, priority digit stored in the last byte.
    pub fn msg_name(&self) -> [u8; MAX_MSG_NAME_LENGTH] {
        let mut name = String::with_capacity(40);
        if self.dev != 0 {
            name.push_str(&format!("{:x}/", self.dev));
        }
        name.push_str(&format!(
            "{:x}/{:x}/{:x}_{:x}_{:x}",
            self.job_id, self.dir_no, self.creation_time, self.unique_number, self.split_job_counter
        ));
        let mut buf = [0u8; MAX_MSG_NAME_LENGTH];
        crate::util::set_fixed_str(&mut buf[..MAX_MSG_NAME_LENGTH - 1], &name);
        buf[MAX_MSG_NAME_LENGTH - 1] = self.priority - b'0';
        buf
    }
}

/// Message name for a retrieve job is the hex dir id; priority still rides
/// in the final byte.
pub fn fetch_msg_name(dir_id: u32, priority: u8) -> [u8; MAX_MSG_NAME_LENGTH] {
    let mut buf = [0u8; MAX_MSG_NAME_LENGTH];
    crate::util::set_fixed_str(&mut buf[..MAX_MSG_NAME_LENGTH - 1], &format!("{:x}", dir_id));
    buf[MAX_MSG_NAME_LENGTH - 1] = priority - b'0';
    buf
}

/// The printable part of a message name buffer.
pub fn msg_name_str(buf: &[u8; MAX_MSG_NAME_LENGTH]) -> &str {
    crate::util::fixed_str(&buf[..MAX_MSG_NAME_LENGTH - 1])
}

/// Constant-time priority read from the name buffer tail.
pub fn msg_name_priority(buf: &[u8; MAX_MSG_NAME_LENGTH]) -> u8 {
    buf[MAX_MSG_NAME_LENGTH - 1] + b'0'
}
