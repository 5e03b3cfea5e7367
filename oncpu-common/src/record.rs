use crate::ARGSIZE;

/// Which lifecycle transition an [`ExecRecord`] describes.
///
/// The tag decides how `value` and `arg` are read:
///
/// | kind | `value`            | `arg`            |
/// |------|--------------------|------------------|
/// | Init | cgroup id          | executable path  |
/// | Args | cgroup id          | one argv string  |
/// | Exec | execve return code | unused           |
/// | Exit | exit status        | comm             |
/// | Fork | cgroup id          | unused           |
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Init = 0,
    Args = 1,
    Exec = 2,
    Exit = 3,
    Fork = 4,
}

impl EventKind {
    /// Convert from the wire tag
    pub const fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            0 => Some(Self::Init),
            1 => Some(Self::Args),
            2 => Some(Self::Exec),
            3 => Some(Self::Exit),
            4 => Some(Self::Fork),
            _ => None,
        }
    }

    pub const fn name(&self) -> &'static str {
        match self {
            Self::Init => "init",
            Self::Args => "args",
            Self::Exec => "exec",
            Self::Exit => "exit",
            Self::Fork => "fork",
        }
    }
}

/// This is a lifecycle event.
///
/// This structure is how we pass process lifecycle data
/// from kernelspace to userspace via the ring buffer
/// and is thus shared by both kernelspace and userspace.
/// Every kind uses the same layout; `kind` is kept as a raw
/// `u32` so that a garbage tag read off the wire is not UB.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecRecord {
    pub kind: u32,
    pub pid: u32,
    pub ppid: u32,
    pub value: u32,
    pub arg: [u8; ARGSIZE],
}

impl ExecRecord {
    pub const fn new(kind: EventKind, pid: u32, ppid: u32, value: u32) -> Self {
        Self {
            kind: kind as u32,
            pid,
            ppid,
            value,
            arg: [0; ARGSIZE],
        }
    }

    pub const fn kind(&self) -> Option<EventKind> {
        EventKind::from_raw(self.kind)
    }

    /// Text carried in `arg`, up to the first NUL or the end of the buffer.
    pub fn text(&self) -> &[u8] {
        let end = self
            .arg
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(ARGSIZE);
        &self.arg[..end]
    }
}

/// Byte offsets of the `task_struct` fields the hooks read.
///
/// aya programs get no CO-RE relocations, so userspace resolves these
/// (from BTF or a layout file) and writes them into the `TASK_LAYOUT`
/// global before load. Zero means unknown and disables the dependent read.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "user", derive(serde::Serialize, serde::Deserialize))]
pub struct TaskLayout {
    pub pid: u32,
    pub tgid: u32,
    pub real_parent: u32,
    pub exit_code: u32,
}

impl TaskLayout {
    pub const UNSET: Self = Self {
        pid: 0,
        tgid: 0,
        real_parent: 0,
        exit_code: 0,
    };

    /// Whether the switch hook can identify the outgoing task.
    pub const fn can_account(&self) -> bool {
        self.pid != 0 && self.tgid != 0
    }
}

#[cfg(feature = "user")]
unsafe impl aya::Pod for TaskLayout {}
