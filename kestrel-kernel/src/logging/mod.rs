//! Kernel logging
//!
//! Every kernel module logs through the `log` facade. Records are kept in
//! a lock-free ring ([`buffer`]) and echoed to the arch console until
//! [`disable_console`] is called.
//!
//! # Targets
//!
//! | Target             | Events                                     |
//! |--------------------|--------------------------------------------|
//! | `kestrel::ipc`     | rendezvous, transfers, aborts              |
//! | `kestrel::drq`     | remote requests and state changes          |
//! | `kestrel::sched`   | timeslices, switches, helping              |
//! | `kestrel::rcu`     | grace periods and callback batches         |
//! | `kestrel::migrate` | context migration between CPUs             |

pub mod buffer;
pub mod logger;

pub use buffer::{LogEntry, RingStats};
pub use logger::{disable_console, drain, init, stats};
