//! Process lifecycle events.
//!
//! Each hook turns one lifecycle transition into one or more [`ExecRecord`]s.
//! No state is kept between hooks: a consumer rebuilds a process from the
//! INIT, ARGS and EXEC records sharing its pid, in submission order.

use crate::{
    accounting::TaskIds,
    record::{EventKind, ExecRecord},
    ARGSIZE, MAXARGS, TASK_COMM_LEN,
};

/// Read access to the calling process' memory.
pub trait UserMemory {
    /// Read a pointer-sized word at `addr`.
    fn read_ptr(&self, addr: u64) -> Option<u64>;

    /// Copy the NUL-terminated string at `addr` into `dest`.
    ///
    /// At most `dest.len() - 1` bytes are copied and a NUL is always
    /// written after them. Returns the number of bytes copied, NUL excluded.
    fn read_str(&self, addr: u64, dest: &mut [u8]) -> Option<usize>;
}

/// Where records go. Publishing never blocks and never fails loudly: a
/// full channel drops the record.
pub trait EventSink {
    fn publish(&self, record: &ExecRecord);
}

/// The process a record is about, and its parent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcIds {
    pub pid: u32,
    pub ppid: u32,
}

/// execve entry: one INIT with the path, then one ARGS per non-empty
/// argument from `argv[1]` on. `argv[0]` is not sent, it repeats the path.
#[inline(always)]
pub fn on_exec_enter<M, S>(mem: &M, sink: &S, ids: ProcIds, cgroup: u32, filename: u64, argv: u64)
where
    M: UserMemory + ?Sized,
    S: EventSink + ?Sized,
{
    let mut record = ExecRecord::new(EventKind::Init, ids.pid, ids.ppid, cgroup);
    // an unreadable path still announces the exec, with an empty buffer
    let _ = mem.read_str(filename, &mut record.arg);
    sink.publish(&record);

    record.kind = EventKind::Args as u32;
    for i in 1..MAXARGS {
        let slot = argv.wrapping_add((i * core::mem::size_of::<u64>()) as u64);
        if !submit_arg(mem, sink, slot, &mut record) {
            break;
        }
    }
}

/// Publish the argument `slot` points to. Returns false at the end of argv.
///
/// An empty (or unreadable) string yields no record but does not end argv,
/// so a consumer sees a gap it cannot tell apart from a dropped record.
#[inline(always)]
fn submit_arg<M, S>(mem: &M, sink: &S, slot: u64, record: &mut ExecRecord) -> bool
where
    M: UserMemory + ?Sized,
    S: EventSink + ?Sized,
{
    let argp = match mem.read_ptr(slot) {
        Some(p) if p != 0 => p,
        _ => return false,
    };
    record.arg = [0; ARGSIZE];
    if mem.read_str(argp, &mut record.arg).is_some() && record.arg[0] != 0 {
        sink.publish(record);
    }
    true
}

/// execve return: the return code travels in `value`.
#[inline(always)]
pub fn on_exec_return<S: EventSink + ?Sized>(sink: &S, ids: ProcIds, ret: i64) {
    let record = ExecRecord::new(EventKind::Exec, ids.pid, ids.ppid, ret as u32);
    sink.publish(&record);
}

/// sched_process_fork
#[inline(always)]
pub fn on_fork<S: EventSink + ?Sized>(sink: &S, child_pid: u32, parent_pid: u32, cgroup: u32) {
    let record = ExecRecord::new(EventKind::Fork, child_pid, parent_pid, cgroup);
    sink.publish(&record);
}

/// sched_process_exit. Fires for every exiting thread; only the group
/// leader ends the process, the others are dropped here.
///
/// `exit_code` is the raw `task_struct::exit_code`, the status is its
/// upper byte.
#[inline(always)]
pub fn on_exit<S: EventSink + ?Sized>(
    sink: &S,
    task: TaskIds,
    ppid: u32,
    exit_code: i32,
    comm: &[u8; TASK_COMM_LEN],
) {
    if task.pid != task.tgid {
        return;
    }
    let mut record = ExecRecord::new(EventKind::Exit, task.tgid, ppid, (exit_code >> 8) as u32);
    record.arg[..TASK_COMM_LEN].copy_from_slice(comm);
    sink.publish(&record);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::collections::HashMap;

    /// A fake caller address space: pointer slots and strings.
    #[derive(Default)]
    struct FakeMemory {
        words: HashMap<u64, u64>,
        strings: HashMap<u64, Vec<u8>>,
    }

    impl FakeMemory {
        /// Lay out `argv` at 0x1000 with string bodies from 0x8000 on.
        /// `None` writes a NULL slot; slots past the list are unmapped.
        fn with_argv(argv: &[Option<&str>]) -> Self {
            let mut mem = Self::default();
            for (i, arg) in argv.iter().enumerate() {
                let slot = 0x1000 + 8 * i as u64;
                match arg {
                    Some(s) => {
                        let addr = 0x8000 + 0x100 * i as u64;
                        mem.words.insert(slot, addr);
                        mem.strings.insert(addr, s.as_bytes().to_vec());
                    }
                    None => {
                        mem.words.insert(slot, 0);
                    }
                }
            }
            mem
        }

        fn with_path(mut self, addr: u64, path: &str) -> Self {
            self.strings.insert(addr, path.as_bytes().to_vec());
            self
        }
    }

    impl UserMemory for FakeMemory {
        fn read_ptr(&self, addr: u64) -> Option<u64> {
            self.words.get(&addr).copied()
        }

        fn read_str(&self, addr: u64, dest: &mut [u8]) -> Option<usize> {
            let src = self.strings.get(&addr)?;
            let n = src.len().min(dest.len() - 1);
            dest[..n].copy_from_slice(&src[..n]);
            dest[n] = 0;
            Some(n)
        }
    }

    #[derive(Default)]
    struct VecSink(RefCell<Vec<ExecRecord>>);

    impl EventSink for VecSink {
        fn publish(&self, record: &ExecRecord) {
            self.0.borrow_mut().push(*record);
        }
    }

    impl VecSink {
        fn records(&self) -> Vec<ExecRecord> {
            self.0.borrow().clone()
        }
        fn summary(&self) -> Vec<(EventKind, String)> {
            self.records()
                .iter()
                .map(|r| {
                    let text = String::from_utf8(r.text().to_vec()).unwrap();
                    (r.kind().unwrap(), text)
                })
                .collect()
        }
    }

    const IDS: ProcIds = ProcIds { pid: 300, ppid: 200 };
    const PATH: u64 = 0x4000;
    const ARGV: u64 = 0x1000;

    #[test]
    fn test_exec_enter_skips_empty_and_stops_at_null() {
        let mem = FakeMemory::with_argv(&[
            Some("/bin/echo"),
            Some("hi"),
            Some(""),
            None,
            Some("never"),
        ])
        .with_path(PATH, "/bin/echo");
        let sink = VecSink::default();

        on_exec_enter(&mem, &sink, IDS, 77, PATH, ARGV);

        assert_eq!(
            sink.summary(),
            vec![
                (EventKind::Init, "/bin/echo".to_string()),
                (EventKind::Args, "hi".to_string()),
            ]
        );
        for rec in sink.records() {
            assert_eq!((rec.pid, rec.ppid, rec.value), (300, 200, 77));
        }
    }

    #[test]
    fn test_exec_enter_does_not_resend_argv0() {
        let mem = FakeMemory::with_argv(&[Some("ls"), Some("-la"), None]).with_path(PATH, "/usr/bin/ls");
        let sink = VecSink::default();

        on_exec_enter(&mem, &sink, IDS, 1, PATH, ARGV);

        assert_eq!(
            sink.summary(),
            vec![
                (EventKind::Init, "/usr/bin/ls".to_string()),
                (EventKind::Args, "-la".to_string()),
            ]
        );
    }

    #[test]
    fn test_exec_enter_caps_argument_count() {
        let args: Vec<String> = (0..20).map(|i| format!("a{i}")).collect();
        let argv: Vec<Option<&str>> = args.iter().map(|s| Some(s.as_str())).collect();
        let mem = FakeMemory::with_argv(&argv).with_path(PATH, "/bin/many");
        let sink = VecSink::default();

        on_exec_enter(&mem, &sink, IDS, 1, PATH, ARGV);

        let summary = sink.summary();
        assert_eq!(summary.len(), MAXARGS);
        assert_eq!(summary[1], (EventKind::Args, "a1".to_string()));
        assert_eq!(summary[MAXARGS - 1], (EventKind::Args, format!("a{}", MAXARGS - 1)));
    }

    #[test]
    fn test_exec_enter_unreadable_path_still_sends_init() {
        let mem = FakeMemory::with_argv(&[Some("x"), None]);
        let sink = VecSink::default();

        on_exec_enter(&mem, &sink, IDS, 1, 0xdead, ARGV);

        assert_eq!(sink.summary(), vec![(EventKind::Init, String::new())]);
    }

    #[test]
    fn test_exec_enter_unreadable_argv_ends_sequence() {
        // argv itself points nowhere
        let mem = FakeMemory::default().with_path(PATH, "/bin/true");
        let sink = VecSink::default();

        on_exec_enter(&mem, &sink, IDS, 1, PATH, 0);

        assert_eq!(sink.summary(), vec![(EventKind::Init, "/bin/true".to_string())]);
    }

    #[test]
    fn test_exec_enter_unreadable_string_is_a_gap() {
        let mut mem = FakeMemory::with_argv(&[Some("a"), Some("b"), Some("c"), None]).with_path(PATH, "/p");
        // argv[1] points to unmapped memory
        mem.words.insert(ARGV + 8, 0xbad0);
        let sink = VecSink::default();

        on_exec_enter(&mem, &sink, IDS, 1, PATH, ARGV);

        assert_eq!(
            sink.summary(),
            vec![(EventKind::Init, "/p".to_string()), (EventKind::Args, "c".to_string())]
        );
    }

    #[test]
    fn test_long_argument_is_truncated_and_not_leaked_into_next() {
        let long = "x".repeat(300);
        let mem = FakeMemory::with_argv(&[Some("p"), Some(long.as_str()), Some("y"), None]).with_path(PATH, "p");
        let sink = VecSink::default();

        on_exec_enter(&mem, &sink, IDS, 1, PATH, ARGV);

        let records = sink.records();
        assert_eq!(records.len(), 3);
        assert_eq!(records[1].text(), "x".repeat(ARGSIZE - 1).as_bytes());
        // the short argument after it carries no tail of the long one
        assert_eq!(records[2].text(), b"y");
        assert!(records[2].arg[1..].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_exec_return_carries_return_code() {
        let sink = VecSink::default();

        on_exec_return(&sink, IDS, 0);
        on_exec_return(&sink, IDS, -2);

        let records = sink.records();
        assert_eq!(records[0].kind(), Some(EventKind::Exec));
        assert_eq!(records[0].value, 0);
        assert_eq!(records[1].value as i32, -2);
        assert!(records[1].text().is_empty());
    }

    #[test]
    fn test_fork_record() {
        let sink = VecSink::default();

        on_fork(&sink, 501, 500, 9);

        let rec = sink.records()[0];
        assert_eq!(rec.kind(), Some(EventKind::Fork));
        assert_eq!((rec.pid, rec.ppid, rec.value), (501, 500, 9));
        assert!(rec.text().is_empty());
    }

    #[test]
    fn test_exit_suppressed_for_non_leader_thread() {
        let sink = VecSink::default();
        let comm = *b"worker\0\0\0\0\0\0\0\0\0\0";

        on_exit(&sink, TaskIds { pid: 601, tgid: 600 }, 1, 0, &comm);

        assert!(sink.records().is_empty());
    }

    #[test]
    fn test_exit_for_leader_carries_status_and_comm() {
        let sink = VecSink::default();
        let comm = *b"worker\0\0\0\0\0\0\0\0\0\0";
        let exit_code = 3 << 8;

        on_exit(&sink, TaskIds { pid: 600, tgid: 600 }, 1, exit_code, &comm);

        let records = sink.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].kind(), Some(EventKind::Exit));
        assert_eq!(records[0].value, (exit_code >> 8) as u32);
        assert_eq!(records[0].value, 3);
        assert_eq!((records[0].pid, records[0].ppid), (600, 1));
        assert_eq!(records[0].text(), b"worker");
    }

    #[test]
    fn test_exit_status_of_signalled_process() {
        let sink = VecSink::default();
        let comm = [0u8; TASK_COMM_LEN];

        // killed by SIGKILL: low byte is the signal, status byte is 0
        on_exit(&sink, TaskIds { pid: 7, tgid: 7 }, 1, 9, &comm);

        assert_eq!(sink.records()[0].value, 0);
    }
}
