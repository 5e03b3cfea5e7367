#![cfg_attr(not(any(test, feature = "user")), no_std)]

//! Types and hook logic shared by the kernel programs and the userspace agent.
//!
//! The hook bodies live here rather than in `oncpu-ebpf` so they can be
//! exercised on the host: the eBPF crate only adapts maps and helpers to the
//! [`accounting::TimeTable`], [`multiplex::UserMemory`] and
//! [`multiplex::EventSink`] traits.

pub mod accounting;
pub mod multiplex;
pub mod record;

#[cfg(feature = "user")]
pub mod event;

pub use accounting::{account_switch, TaskIds, TimeTable};
pub use multiplex::{EventSink, ProcIds, UserMemory};
pub use record::{EventKind, ExecRecord, TaskLayout};

#[cfg(feature = "user")]
pub use event::{DecodeError, LifecycleEvent};

/// Upper bound (exclusive) of a single accepted on-cpu slice, in ns.
/// The loader may override it per load through the `INTERVAL_NS` global.
pub const DEFAULT_INTERVAL_NS: u64 = 1_000_000_000;

/// Capacity of the task and group tables when the loader does not resize them.
pub const PID_MAX: u32 = 4_194_304;

/// argv slots inspected per execve, the path included.
pub const MAXARGS: usize = 8;

/// Size of the text buffer carried by every record.
pub const ARGSIZE: usize = 128;

pub const TASK_COMM_LEN: usize = 16;

// map and global names, shared so userspace and kernelspace agree
pub const START_TIME_MAP: &str = "START_TIME";
pub const ONCPU_MAP: &str = "ONCPU";
pub const EVENTS_MAP: &str = "EVENTS";
pub const INTERVAL_GLOBAL: &str = "INTERVAL_NS";
pub const LAYOUT_GLOBAL: &str = "TASK_LAYOUT";
