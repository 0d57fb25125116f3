use std::collections::HashMap;

/// Per-host set of (job/dir) ids that failed recently, each with the time
/// its next retry becomes admissible. Dispatch skips members until expiry;
/// the host's `ERROR_QUEUE_SET` bit mirrors non-emptiness so the control
/// surface can show it without scanning.
#[derive(Debug, Default)]
pub struct ErrorQueue {
    entries: HashMap<(u32, u32), i64>,
}

impl ErrorQueue {
    pub fn new() -> Self {
        ErrorQueue { entries: HashMap::new() }
    }

    /// Add or refresh an id with a new retry time.
    pub fn upsert(&mut self, host_id: u32, id: u32, next_retry: i64) {
        self.entries.insert((host_id, id), next_retry);
    }

    pub fn remove(&mut self, host_id: u32, id: u32) {
        self.entries.remove(&(host_id, id));
    }

    /// Membership check used by retry admission; `true` while the id has an
    /// unexpired hold.
    pub fn holds(&self, host_id: u32, id: u32, now: i64) -> bool {
        match self.entries.get(&(host_id, id)) {
            Some(expiry) => *expiry > now,
            None => false,
        }
    }

    pub fn host_has_entries(&self, host_id: u32) -> bool {
        self.entries.keys().any(|(h, _)| *h == host_id)
    }

    /// Drop expired holds; returns how many were purged.
    pub fn expire(&mut self, now: i64) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, expiry| *expiry > now);
        before - self.entries.len()
    }

    pub fn clear_host(&mut self, host_id: u32) {
        self.entries.retain(|(h, _), _| *h != host_id);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
