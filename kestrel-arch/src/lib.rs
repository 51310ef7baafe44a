//! # kestrel-arch
//!
//! Hosted platform layer for the kestrel kernel core.
//!
//! The kernel core runs on ordinary host threads: a host thread that enters
//! a CPU with [`cpu::enter_cpu`] behaves as that physical CPU until the
//! returned guard is dropped. This crate provides the few per-CPU machine
//! facilities the core relies on:
//!
//! - [`cpu`]: CPU id register, interrupt mask, spin hints
//! - [`sync`]: Interrupt-safe spin mutex
//! - [`smp`]: Inter-processor interrupt mailbox
//! - [`timer`]: Monotonic microsecond counter
//! - [`console`]: Diagnostic output sink

#![deny(unsafe_op_in_unsafe_fn)]

pub mod console;
pub mod cpu;
pub mod smp;
pub mod sync;
pub mod timer;

pub use cpu::{cpu_id, enter_cpu, CpuGuard, INVALID_CPU};
pub use smp::{Ipi, IpiMailbox, IpiSet, MAX_CPUS};
pub use sync::IrqSpinMutex;
