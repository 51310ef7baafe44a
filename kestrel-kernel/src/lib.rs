//! # kestrel-kernel
//!
//! Scheduling, IPC, DRQ, RCU and migration core of the kestrel
//! capability microkernel.
//!
//! Every thread of control is a [`Context`]. Contexts talk through
//! synchronous rendezvous IPC, are scheduled per CPU by a fixed-priority or
//! weighted-fair-queueing policy, reach other CPUs through deferred
//! requests (DRQs) and can be migrated between CPUs. Objects are reclaimed
//! only after an RCU grace period.
//!
//! # Execution model
//!
//! Blocking kernel paths are `async` functions. A context's in-kernel
//! activity is a future polled by the dispatcher of its CPU
//! ([`sched::dispatch`]); waiting is a suspension point after which the
//! context resumes once it is picked again. The host thread driving a CPU
//! acts as that CPU ([`kestrel_arch::enter_cpu`]).
//!
//! # Modules
//!
//! - [`context`]: Contexts, thread state, DRQs, helping locks
//! - [`sched`]: Ready queues, dispatch, scheduling primitives, migration
//! - [`ipc`]: Rendezvous IPC, message transfer, gates, fault IPC
//! - [`rcu`]: Grace-period based reclamation
//! - [`thread`]: Thread creation parameters, kill and halt
//! - [`kernel`]: The kernel instance and its driver

#![cfg_attr(not(test), no_std)]
#![deny(unsafe_op_in_unsafe_fn)]

extern crate alloc;

pub mod clock;
pub mod config;
pub mod context;
pub mod cpu;
pub mod error;
pub mod ipc;
pub mod kernel;
pub mod logging;
pub mod rcu;
pub mod sched;
pub mod space;
pub mod task;
pub mod thread;
pub mod timeout;

pub use config::{ClockSource, KernelConfig};
pub use context::{Context, ContextRef, ThreadState};
pub use error::{KernelError, KernelResult};
pub use ipc::{IpcGate, IpcOp};
pub use kernel::Kernel;
pub use sched::{CpuRun, SchedParams};
pub use space::Space;
pub use thread::ThreadConfig;
