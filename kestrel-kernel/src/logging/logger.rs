//! `log` backend
//!
//! Every record is formatted on the stack, recorded in [`RING`] and,
//! unless the console was switched off, echoed to the arch console as
//!
//! ```text
//! [     12.000345 c1 DEBUG] kestrel::sched: cpu 1: C3 -> C7
//! ```

use core::fmt::Write;

use kestrel_arch::console;
use log::{LevelFilter, Log, Metadata, Record};

use super::buffer::{FixedText, LogEntry, RingStats, MESSAGE_CAPACITY, RING};

/// Width of a console line.
const LINE_CAPACITY: usize = 320;

struct KernelLogger;

impl Log for KernelLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }

        let now = kestrel_arch::timer::now_us();
        let cpu = kestrel_arch::cpu_id();
        let mut message = FixedText::<MESSAGE_CAPACITY>::new();
        let _ = write!(message, "{}", record.args());

        let entry = LogEntry::new(now, cpu, record.level(), record.target(), message.as_str());
        if RING.console() {
            let mut line = FixedText::<LINE_CAPACITY>::new();
            let _ = write!(line, "[{:>8}.{:06} ", now / 1_000_000, now % 1_000_000);
            match entry.cpu {
                Some(c) => {
                    let _ = write!(line, "c{c}");
                }
                None => line.push_str("--"),
            }
            let _ = write!(line, " {:>5}] {}: {}", record.level(), record.target(), message.as_str());
            console::putln(line.as_str());
        }
        RING.record(entry);
    }

    fn flush(&self) {}
}

static LOGGER: KernelLogger = KernelLogger;

/// Install the kernel logger and start recording.
///
/// Every boot calls this; only the first call installs the logger, later
/// ones just change the level.
pub fn init(level: LevelFilter) {
    RING.start_recording();
    let _ = log::set_logger(&LOGGER);
    log::set_max_level(level);
}

/// Stop echoing records to the console. They are still recorded.
pub fn disable_console() {
    RING.set_console(false);
}

/// Hand every recorded entry to `f`, oldest first.
pub fn drain(f: impl FnMut(&LogEntry)) -> usize {
    RING.drain(f)
}

pub fn stats() -> RingStats {
    RING.stats()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_records_reach_the_ring() {
        init(LevelFilter::Warn);
        disable_console();
        drain(|_| {});
        log::warn!(target: "kestrel::test", "ring {}", 7);

        let mut found = false;
        drain(|e| found |= e.target.as_str() == "kestrel::test" && e.message.as_str() == "ring 7");
        assert!(found);
        assert_eq!(stats().capacity, crate::logging::buffer::RING_SLOTS);
    }
}
