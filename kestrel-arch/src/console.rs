//! Diagnostic console
//!
//! Output goes to the host's standard error.

use std::io::Write;

/// Write a string to the console.
pub fn puts(s: &str) {
    let mut err = std::io::stderr().lock();
    let _ = err.write_all(s.as_bytes());
}

/// Write a string and a line break.
pub fn putln(s: &str) {
    let mut err = std::io::stderr().lock();
    let _ = err.write_all(s.as_bytes());
    let _ = err.write_all(b"\n");
}
