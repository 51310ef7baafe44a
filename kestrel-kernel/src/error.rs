//! Kernel error types
//!
//! IPC failures are never reported through this type: they travel to the
//! caller as an [`L4Error`](kestrel_abi::L4Error) in its UTCB. `KernelError`
//! covers the kernel-internal operations around IPC: creating contexts,
//! changing scheduling parameters, installing helping relations and
//! bringing CPUs on- and offline.

use core::fmt;

/// Errors of kernel-internal operations.
///
/// The variants mirror the classic L4 error numbers.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[must_use = "kernel errors must be handled"]
pub enum KernelError {
    /// Invalid argument.
    ///
    /// Returned for malformed scheduling parameters (zero WFQ weight or
    /// quantum) and out-of-range CPU numbers.
    EInval,

    /// Object not found.
    ///
    /// A context handle is stale (its slot was reused) or names no slot.
    ENoent,

    /// Out of memory or table slots.
    ENomem,

    /// Resource busy.
    ///
    /// A helping relation would close a cycle, or a CPU is offline.
    EBusy,

    /// Operation not permitted on this object.
    EPerm,
}

impl KernelError {
    /// Get a short description of the error.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::EInval => "invalid argument",
            Self::ENoent => "object not found",
            Self::ENomem => "out of memory or table slots",
            Self::EBusy => "resource busy",
            Self::EPerm => "operation not permitted",
        }
    }
}

impl fmt::Display for KernelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Result type for kernel-internal operations.
pub type KernelResult<T> = Result<T, KernelError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        assert_eq!(KernelError::EBusy.to_string(), "resource busy");
        assert_eq!(KernelError::ENoent.as_str(), "object not found");
    }
}
