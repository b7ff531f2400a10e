//! Per-channel scrollback buffers
//!
//! Each channel (stream id) owns a bounded FIFO of elements. The manager is
//! shared between the ingestion pipeline (writer) and any number of readers,
//! so every operation goes through one internal lock.

use super::element::Element;
use chrono::{DateTime, Local};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

/// Name of the default channel (everything not routed elsewhere)
pub const MAIN_CHANNEL: &str = "main";

/// Default per-channel entry limit
pub const DEFAULT_MAX_ENTRIES: usize = 10_000;

/// One stored element with its arrival time
#[derive(Clone, Debug, Serialize)]
pub struct BufferEntry {
    pub element: Arc<Element>,
    pub received_at: DateTime<Local>,
    /// Buffer generation at the time of the append
    pub sequence: u64,
}

/// Bounded ring buffer for a single channel
#[derive(Clone, Debug)]
pub struct StreamBuffer {
    /// Stored entries, oldest first
    pub entries: VecDeque<BufferEntry>,
    /// Maximum entries to keep
    pub max_entries: usize,
    /// Entries appended since the channel was last viewed
    pub unread: usize,
    /// Generation counter - increments on every append
    /// Lets readers detect changes even when the length stays at max_entries
    pub generation: u64,
}

impl StreamBuffer {
    pub fn new(max_entries: usize) -> Self {
        let max_entries = max_entries.max(1);
        Self {
            entries: VecDeque::with_capacity(max_entries.min(1024)),
            max_entries,
            unread: 0,
            generation: 0,
        }
    }

    pub fn push(&mut self, mut entry: BufferEntry) {
        self.generation = self.generation.wrapping_add(1);
        entry.sequence = self.generation;
        self.entries.push_back(entry);
        if self.entries.len() > self.max_entries {
            self.entries.pop_front();
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[derive(Debug)]
struct Inner {
    buffers: HashMap<String, StreamBuffer>,
    /// Channel currently shown to the user (appends to it are not unread)
    active: Option<String>,
}

/// Thread-safe set of channel buffers
#[derive(Debug)]
pub struct BufferManager {
    inner: Mutex<Inner>,
    max_entries: usize,
}

impl BufferManager {
    pub fn new(max_entries: usize) -> Self {
        let mut buffers = HashMap::new();
        buffers.insert(MAIN_CHANNEL.to_string(), StreamBuffer::new(max_entries));
        Self {
            inner: Mutex::new(Inner {
                buffers,
                active: Some(MAIN_CHANNEL.to_string()),
            }),
            max_entries,
        }
    }

    // A poisoned lock only means a reader panicked mid-snapshot; the data is
    // still consistent because every mutation is a single push/pop.
    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Append an element to a channel, creating the channel on first use
    pub fn append(&self, element: Arc<Element>, channel: &str) {
        let mut inner = self.lock();
        let is_active = inner.active.as_deref() == Some(channel);
        let max_entries = self.max_entries;
        let buffer = inner
            .buffers
            .entry(channel.to_string())
            .or_insert_with(|| {
                tracing::debug!("Creating buffer for channel '{}'", channel);
                StreamBuffer::new(max_entries)
            });

        buffer.push(BufferEntry {
            element,
            received_at: Local::now(),
            sequence: 0,
        });
        if !is_active {
            buffer.unread += 1;
        }
    }

    /// Ordered copy of a channel's entries (oldest first)
    pub fn snapshot(&self, channel: &str) -> Vec<BufferEntry> {
        self.lock()
            .buffers
            .get(channel)
            .map(|b| b.entries.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn unread_count(&self, channel: &str) -> usize {
        self.lock()
            .buffers
            .get(channel)
            .map(|b| b.unread)
            .unwrap_or(0)
    }

    pub fn mark_read(&self, channel: &str) {
        if let Some(buffer) = self.lock().buffers.get_mut(channel) {
            buffer.unread = 0;
        }
    }

    /// Mark a channel as the one being viewed; it is read as a side effect
    pub fn set_active(&self, channel: Option<&str>) {
        let mut inner = self.lock();
        inner.active = channel.map(|c| c.to_string());
        if let Some(channel) = channel {
            if let Some(buffer) = inner.buffers.get_mut(channel) {
                buffer.unread = 0;
            }
        }
    }

    pub fn active(&self) -> Option<String> {
        self.lock().active.clone()
    }

    /// Entries appended after generation `after`, plus the current
    /// generation to pass on the next call
    pub fn entries_since(&self, channel: &str, after: u64) -> (Vec<BufferEntry>, u64) {
        let inner = self.lock();
        match inner.buffers.get(channel) {
            Some(buffer) => (
                buffer
                    .entries
                    .iter()
                    .filter(|e| e.sequence > after)
                    .cloned()
                    .collect(),
                buffer.generation,
            ),
            None => (Vec::new(), after),
        }
    }

    /// Drop a channel's accumulated content (clearStream)
    pub fn clear(&self, channel: &str) {
        if let Some(buffer) = self.lock().buffers.get_mut(channel) {
            buffer.entries.clear();
            buffer.unread = 0;
            buffer.generation = buffer.generation.wrapping_add(1);
            tracing::debug!("Cleared buffer for channel '{}'", channel);
        }
    }

    pub fn len(&self, channel: &str) -> usize {
        self.lock()
            .buffers
            .get(channel)
            .map(|b| b.len())
            .unwrap_or(0)
    }

    pub fn generation(&self, channel: &str) -> u64 {
        self.lock()
            .buffers
            .get(channel)
            .map(|b| b.generation)
            .unwrap_or(0)
    }

    /// Known channel names, sorted
    pub fn channels(&self) -> Vec<String> {
        let mut names: Vec<String> = self.lock().buffers.keys().cloned().collect();
        names.sort();
        names
    }
}

impl Default for BufferManager {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_ENTRIES)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn line(text: &str) -> Arc<Element> {
        Arc::new(Element::text_run(text, None))
    }

    #[test]
    fn test_buffer_bound_evicts_oldest() {
        let manager = BufferManager::new(3);
        for i in 0..5 {
            manager.append(line(&format!("line {}", i)), "speech");
        }

        let entries = manager.snapshot("speech");
        assert_eq!(entries.len(), 3);
        let texts: Vec<String> = entries.iter().map(|e| e.element.plain_text()).collect();
        assert_eq!(texts, vec!["line 2", "line 3", "line 4"]);
        assert_eq!(manager.generation("speech"), 5);
    }

    #[test]
    fn test_unread_only_counts_inactive_channels() {
        let manager = BufferManager::new(10);
        manager.append(line("a"), MAIN_CHANNEL);
        manager.append(line("b"), "thoughts");
        manager.append(line("c"), "thoughts");

        assert_eq!(manager.unread_count(MAIN_CHANNEL), 0);
        assert_eq!(manager.unread_count("thoughts"), 2);

        manager.mark_read("thoughts");
        assert_eq!(manager.unread_count("thoughts"), 0);

        manager.set_active(Some("thoughts"));
        manager.append(line("d"), "thoughts");
        manager.append(line("e"), MAIN_CHANNEL);
        assert_eq!(manager.unread_count("thoughts"), 0);
        assert_eq!(manager.unread_count(MAIN_CHANNEL), 1);
    }

    #[test]
    fn test_clear_keeps_channel() {
        let manager = BufferManager::new(10);
        manager.append(line("old room"), "room");
        manager.clear("room");

        assert!(manager.snapshot("room").is_empty());
        assert!(manager.channels().contains(&"room".to_string()));
        // Clearing an unknown channel is harmless
        manager.clear("nope");
    }

    #[test]
    fn test_entries_since_returns_only_new() {
        let manager = BufferManager::new(2);
        manager.append(line("a"), MAIN_CHANNEL);
        let (first, generation) = manager.entries_since(MAIN_CHANNEL, 0);
        assert_eq!(first.len(), 1);
        assert_eq!(generation, 1);

        manager.append(line("b"), MAIN_CHANNEL);
        manager.append(line("c"), MAIN_CHANNEL);
        let (next, generation) = manager.entries_since(MAIN_CHANNEL, generation);
        let texts: Vec<String> = next.iter().map(|e| e.element.plain_text()).collect();
        assert_eq!(texts, vec!["b", "c"]);
        assert_eq!(generation, 3);

        let (none, _) = manager.entries_since("room", 7);
        assert!(none.is_empty());
    }

    #[test]
    fn test_unknown_channel_reads_empty() {
        let manager = BufferManager::default();
        assert!(manager.snapshot("logons").is_empty());
        assert_eq!(manager.unread_count("logons"), 0);
        assert_eq!(manager.channels(), vec![MAIN_CHANNEL.to_string()]);
    }

    #[test]
    fn test_concurrent_append_and_snapshot() {
        let manager = Arc::new(BufferManager::new(100));
        let writer = {
            let manager = Arc::clone(&manager);
            std::thread::spawn(move || {
                for i in 0..1000 {
                    manager.append(line(&i.to_string()), "combat");
                }
            })
        };
        for _ in 0..50 {
            assert!(manager.snapshot("combat").len() <= 100);
        }
        writer.join().expect("writer thread");

        assert_eq!(manager.len("combat"), 100);
        assert_eq!(manager.unread_count("combat"), 1000);
    }
}
