use crate::{AppendOutcome, Capture, PayloadClass};
use avtool_core::codec::{classify_line_ending, hash, new_id, text_count, to_ascii, to_hex};
use avtool_core::{monotonic_ms, AvError, AvResult};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};

pub const DEFAULT_CAPACITY: usize = 160;
/// Identical payloads from one source within this window merge into one entry.
pub const DEDUP_WINDOW_MS: u64 = 1500;
/// Minimum share of text bytes, in percent, for a payload to count as ascii.
const ASCII_THRESHOLD_PCT: usize = 85;

fn classify_payload(bytes: &[u8]) -> PayloadClass {
    if !bytes.is_empty() && text_count(bytes) * 100 >= bytes.len() * ASCII_THRESHOLD_PCT {
        PayloadClass::Ascii
    } else {
        PayloadClass::Binary
    }
}

/// Bounded FIFO of captures shared by the passive collector and the relay.
///
/// `append` is the only mutation path for the ring itself, and it does the
/// merge-or-evict-then-push under a single lock.
#[derive(Debug, Clone)]
pub struct CaptureStore {
    entries: Arc<Mutex<VecDeque<Capture>>>,
    capacity: usize,
}

impl Default for CaptureStore {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }
}

impl CaptureStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        CaptureStore { entries: Arc::new(Mutex::new(VecDeque::with_capacity(capacity))), capacity }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<Capture>> {
        self.entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Record a received chunk, stamped with the current monotonic time.
    pub fn append(&self, source_address: &str, source_port: u16, local_port: u16, bytes: &[u8]) -> AppendOutcome {
        self.append_at(monotonic_ms(), source_address, source_port, local_port, bytes)
    }

    /// Like [`CaptureStore::append`] with an explicit timestamp.
    pub fn append_at(
        &self,
        now_ms: u64,
        source_address: &str,
        source_port: u16,
        local_port: u16,
        bytes: &[u8],
    ) -> AppendOutcome {
        let bytes_hex = to_hex(bytes);
        let content_hash = hash(&format!("{}:{}|{}", source_address, source_port, bytes_hex));
        let payload_class = classify_payload(bytes);
        let capture = Capture {
            id: new_id(),
            timestamp: now_ms,
            last_timestamp: now_ms,
            source_address: source_address.to_string(),
            source_port,
            local_port,
            bytes_ascii: to_ascii(bytes),
            bytes_hex,
            payload_class,
            line_ending_hint: classify_line_ending(bytes),
            content_hash,
            pinned: false,
            repeat_count: 1,
        };

        let mut entries = self.lock();
        // Only the newest entry is a merge candidate.
        if let Some(last) = entries.back_mut() {
            if last.content_hash == capture.content_hash && now_ms.saturating_sub(last.last_timestamp) < DEDUP_WINDOW_MS {
                last.repeat_count += 1;
                last.last_timestamp = now_ms;
                return AppendOutcome::Merged(last.id.clone());
            }
        }
        // Eviction ignores the pinned flag.
        while entries.len() >= self.capacity {
            entries.pop_front();
        }
        let id = capture.id.clone();
        entries.push_back(capture);
        AppendOutcome::Stored(id)
    }

    pub fn get(&self, id: &str) -> Option<Capture> {
        self.lock().iter().find(|c| c.id == id).cloned()
    }

    /// Most recent first, optionally filtered by a substring of the source
    /// address and/or to pinned entries only.
    pub fn list(&self, source_filter: Option<&str>, pinned_only: bool) -> Vec<Capture> {
        let filter = source_filter.filter(|f| !f.is_empty());
        self.lock()
            .iter()
            .rev()
            .filter(|c| !pinned_only || c.pinned)
            .filter(|c| filter.map_or(true, |f| c.source_address.contains(f)))
            .cloned()
            .collect()
    }

    pub fn set_pinned(&self, id: &str, pinned: bool) -> AvResult<()> {
        let mut entries = self.lock();
        match entries.iter_mut().find(|c| c.id == id) {
            Some(c) => {
                c.pinned = pinned;
                Ok(())
            }
            None => Err(AvError::NotFound(format!("capture {}", id))),
        }
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}
