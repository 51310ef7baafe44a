//! Log record ring
//!
//! Records are copied into fixed-size [`LogEntry`] slots of a
//! `thingbuf` ring, so logging never allocates and never takes a lock.
//! That matters here because records are produced from inside DRQ
//! handlers and the timer path with scheduler locks held.
//!
//! A full ring drops the new record and counts it in
//! [`RingStats::dropped`].

use core::fmt;
use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use thingbuf::StaticThingBuf;

/// Bytes kept of a record's target.
pub const TARGET_CAPACITY: usize = 32;

/// Bytes kept of a record's formatted message.
pub const MESSAGE_CAPACITY: usize = 200;

/// Number of slots in the ring.
pub const RING_SLOTS: usize = 256;

/// Fixed-capacity UTF-8 text. Writing past the capacity truncates on a
/// character boundary.
#[derive(Clone, Copy)]
pub struct FixedText<const N: usize> {
    bytes: [u8; N],
    len: usize,
}

impl<const N: usize> FixedText<N> {
    pub const fn new() -> Self {
        Self { bytes: [0; N], len: 0 }
    }

    pub fn truncated(s: &str) -> Self {
        let mut t = Self::new();
        t.push_str(s);
        t
    }

    pub fn push_str(&mut self, s: &str) {
        let mut n = s.len().min(N - self.len);
        while !s.is_char_boundary(n) {
            n -= 1;
        }
        self.bytes[self.len..self.len + n].copy_from_slice(&s.as_bytes()[..n]);
        self.len += n;
    }

    pub fn as_str(&self) -> &str {
        // Only whole characters are ever copied in.
        core::str::from_utf8(&self.bytes[..self.len]).unwrap_or_default()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl<const N: usize> Default for FixedText<N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const N: usize> fmt::Write for FixedText<N> {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        self.push_str(s);
        Ok(())
    }
}

/// One log record.
#[derive(Clone, Default)]
pub struct LogEntry {
    /// Arch counter in microseconds.
    pub time_us: u64,
    /// Producing CPU, `None` outside any CPU.
    pub cpu: Option<u8>,
    /// `None` only in an empty slot.
    pub level: Option<log::Level>,
    pub target: FixedText<TARGET_CAPACITY>,
    pub message: FixedText<MESSAGE_CAPACITY>,
}

impl LogEntry {
    pub fn new(time_us: u64, cpu: usize, level: log::Level, target: &str, message: &str) -> Self {
        Self {
            time_us,
            cpu: u8::try_from(cpu).ok(),
            level: Some(level),
            target: FixedText::truncated(target),
            message: FixedText::truncated(message),
        }
    }

    pub fn level(&self) -> log::Level {
        self.level.unwrap_or(log::Level::Trace)
    }
}

impl fmt::Debug for LogEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}us ", self.time_us)?;
        match self.cpu {
            Some(c) => write!(f, "c{c}")?,
            None => f.write_str("--")?,
        }
        write!(f, " {}] {}: {}", self.level(), self.target.as_str(), self.message.as_str())
    }
}

/// Occupancy of the ring.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RingStats {
    pub queued: usize,
    pub capacity: usize,
    /// Records lost to a full ring since boot.
    pub dropped: u64,
}

/// The record ring plus its switches.
pub struct LogRing {
    slots: StaticThingBuf<LogEntry, RING_SLOTS>,
    recording: AtomicBool,
    console: AtomicBool,
    dropped: AtomicU64,
}

impl LogRing {
    const fn new() -> Self {
        Self {
            slots: StaticThingBuf::new(),
            recording: AtomicBool::new(false),
            console: AtomicBool::new(true),
            dropped: AtomicU64::new(0),
        }
    }

    pub fn start_recording(&self) {
        self.recording.store(true, Ordering::Release);
    }

    pub fn set_console(&self, on: bool) {
        self.console.store(on, Ordering::Release);
    }

    pub fn console(&self) -> bool {
        self.console.load(Ordering::Acquire)
    }

    /// Queue `entry`. Returns false if recording is off or the ring is full.
    pub fn record(&self, entry: LogEntry) -> bool {
        if !self.recording.load(Ordering::Acquire) {
            return false;
        }
        if self.slots.push(entry).is_err() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            return false;
        }
        true
    }

    /// Hand every queued record to `f`, oldest first. Returns how many.
    pub fn drain(&self, mut f: impl FnMut(&LogEntry)) -> usize {
        let mut n = 0;
        while let Some(entry) = self.slots.pop() {
            f(&entry);
            n += 1;
        }
        n
    }

    pub fn stats(&self) -> RingStats {
        RingStats {
            queued: self.slots.len(),
            capacity: self.slots.capacity(),
            dropped: self.dropped.load(Ordering::Relaxed),
        }
    }
}

pub static RING: LogRing = LogRing::new();
