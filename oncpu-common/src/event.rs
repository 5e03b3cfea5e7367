//! Userspace view of [`ExecRecord`]s: one enum variant per kind, with the
//! overloaded `value` and `arg` fields given their per-kind meaning.

use serde::Serialize;
use thiserror::Error;

use crate::record::{EventKind, ExecRecord};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("record is {0} bytes, expected {}", core::mem::size_of::<ExecRecord>())]
    Size(usize),
    #[error("unknown event kind {0}")]
    Kind(u32),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum LifecycleEvent {
    Init { pid: u32, ppid: u32, cgroup: u32, path: String },
    Args { pid: u32, ppid: u32, cgroup: u32, arg: String },
    Exec { pid: u32, ppid: u32, ret: i32 },
    Exit { pid: u32, ppid: u32, status: u32, comm: String },
    Fork { pid: u32, ppid: u32, cgroup: u32 },
}

impl LifecycleEvent {
    /// Decode one ring buffer item.
    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        if bytes.len() != core::mem::size_of::<ExecRecord>() {
            return Err(DecodeError::Size(bytes.len()));
        }
        // a byte slice carries no alignment guarantee
        let record: ExecRecord = unsafe { std::ptr::read_unaligned(bytes.as_ptr() as *const ExecRecord) };
        Self::from_record(&record)
    }

    pub fn from_record(record: &ExecRecord) -> Result<Self, DecodeError> {
        let kind = record.kind().ok_or(DecodeError::Kind(record.kind))?;
        let (pid, ppid) = (record.pid, record.ppid);
        let text = || String::from_utf8_lossy(record.text()).into_owned();
        Ok(match kind {
            EventKind::Init => Self::Init { pid, ppid, cgroup: record.value, path: text() },
            EventKind::Args => Self::Args { pid, ppid, cgroup: record.value, arg: text() },
            EventKind::Exec => Self::Exec { pid, ppid, ret: record.value as i32 },
            EventKind::Exit => Self::Exit { pid, ppid, status: record.value, comm: text() },
            EventKind::Fork => Self::Fork { pid, ppid, cgroup: record.value },
        })
    }

    pub fn kind(&self) -> EventKind {
        match self {
            Self::Init { .. } => EventKind::Init,
            Self::Args { .. } => EventKind::Args,
            Self::Exec { .. } => EventKind::Exec,
            Self::Exit { .. } => EventKind::Exit,
            Self::Fork { .. } => EventKind::Fork,
        }
    }

    pub fn pid(&self) -> u32 {
        match *self {
            Self::Init { pid, .. }
            | Self::Args { pid, .. }
            | Self::Exec { pid, .. }
            | Self::Exit { pid, .. }
            | Self::Fork { pid, .. } => pid,
        }
    }
}
