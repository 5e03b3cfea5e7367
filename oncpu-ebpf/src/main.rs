#![no_std]
#![no_main]

use core::{
    ptr::{addr_of, read_volatile},
    sync::atomic::{AtomicU64, Ordering},
};

use aya_ebpf::{
    bindings::BPF_NOEXIST,
    helpers::{
        bpf_get_current_cgroup_id, bpf_get_current_comm, bpf_get_current_pid_tgid,
        bpf_get_current_task, bpf_ktime_get_ns, bpf_probe_read_kernel, bpf_probe_read_user,
        bpf_probe_read_user_str_bytes,
    },
    macros::{kprobe, map, tracepoint},
    maps::{ring_buf::RingBuf, HashMap},
    programs::{ProbeContext, TracePointContext},
};
use aya_log_ebpf::debug;
use oncpu_common::{
    accounting, multiplex, EventSink, ExecRecord, ProcIds, TaskIds, TaskLayout, TimeTable,
    UserMemory, DEFAULT_INTERVAL_NS, PID_MAX, TASK_COMM_LEN,
};

// ============================== COLLECTIONS =================================

/// Start of the slice each task is running (key=pid, val=ktime ns)
#[map(name = "START_TIME")]
static mut START_TIME: HashMap<u32, u64> = HashMap::with_max_entries(PID_MAX, 0);

/// Bounded on-cpu time per thread group (key=tgid, val=ns). Userspace drains it
#[map(name = "ONCPU")]
static mut ONCPU: HashMap<u32, u64> = HashMap::with_max_entries(PID_MAX, 0);

/// Lifecycle records, one ExecRecord per item
#[map(name = "EVENTS")]
static mut EVENTS: RingBuf = RingBuf::with_byte_size(4096 * 64, 0); // multiple of page size

// ============================== GLOBALS =====================================
// written by the loader before load, read-only afterwards

#[unsafe(no_mangle)]
static INTERVAL_NS: u64 = DEFAULT_INTERVAL_NS;

#[unsafe(no_mangle)]
static TASK_LAYOUT: TaskLayout = TaskLayout::UNSET;

#[inline(always)]
fn interval_ns() -> u64 {
    unsafe { read_volatile(&INTERVAL_NS) }
}

#[inline(always)]
fn task_layout() -> TaskLayout {
    unsafe { read_volatile(&TASK_LAYOUT) }
}

// ================================ KPROBES ===================================

// finish_task_switch(struct task_struct *prev) runs on the cpu right after
// the switch: `current` is already the incoming task
#[kprobe]
pub fn finish_task_switch(ctx: ProbeContext) -> u32 {
    let layout = task_layout();
    let prev = match ctx.arg::<*const u8>(0) {
        Some(task) if layout.can_account() => task_ids(task, &layout),
        _ => TaskIds::IDLE,
    };
    let next_pid = bpf_get_current_pid_tgid() as u32;

    accounting::account_switch(
        &Table(start_time()),
        &Table(oncpu()),
        prev,
        next_pid,
        interval_ns(),
        || unsafe { bpf_ktime_get_ns() },
    );
    0
}

// ================================ TRACEPOINTS ===============================

// NOTE: to check offsets run
// cat /sys/kernel/debug/tracing/events/<category>/<name>/format
// on your kernel

// syscalls:sys_enter_execve: __syscall_nr @ +8, filename @ +16, argv @ +24, envp @ +32
const EXECVE_FILENAME_OFFSET: usize = 16;
const EXECVE_ARGV_OFFSET: usize = 24;
// syscalls:sys_exit_execve: __syscall_nr @ +8, ret @ +16 (long)
const EXECVE_RET_OFFSET: usize = 16;
// sched:sched_process_fork: parent_comm @ +8, parent_pid @ +24, child_comm @ +28, child_pid @ +44
const FORK_PARENT_PID_OFFSET: usize = 24;
const FORK_CHILD_PID_OFFSET: usize = 44;

#[tracepoint(category = "syscalls", name = "sys_enter_execve")]
pub fn sys_enter_execve(ctx: TracePointContext) -> u32 {
    let filename = unsafe { ctx.read_at::<u64>(EXECVE_FILENAME_OFFSET) }.unwrap_or(0);
    let argv = unsafe { ctx.read_at::<u64>(EXECVE_ARGV_OFFSET) }.unwrap_or(0);

    multiplex::on_exec_enter(
        &CallerMemory,
        &Events,
        current_proc(),
        current_cgroup(),
        filename,
        argv,
    );
    0
}

#[tracepoint(category = "syscalls", name = "sys_exit_execve")]
pub fn sys_exit_execve(ctx: TracePointContext) -> u32 {
    let Ok(ret) = (unsafe { ctx.read_at::<i64>(EXECVE_RET_OFFSET) }) else {
        return 0;
    };
    let ids = current_proc();
    if ret != 0 {
        debug!(&ctx, "execve failed pid={} ret={}", ids.pid, ret);
    }
    multiplex::on_exec_return(&Events, ids, ret);
    0
}

#[tracepoint(category = "sched", name = "sched_process_fork")]
pub fn sched_process_fork(ctx: TracePointContext) -> u32 {
    let (parent_pid, child_pid) = read_sched_fork_pids(&ctx);
    multiplex::on_fork(&Events, child_pid, parent_pid, current_cgroup());
    0
}

#[tracepoint(category = "sched", name = "sched_process_exit")]
pub fn sched_process_exit(_ctx: TracePointContext) -> u32 {
    let layout = task_layout();
    let task = current_task();
    let exit_code = read_field::<i32>(task, layout.exit_code).unwrap_or(0);
    let comm = bpf_get_current_comm().unwrap_or([0; TASK_COMM_LEN]);

    multiplex::on_exit(
        &Events,
        current_ids(),
        parent_tgid(task, &layout),
        exit_code,
        &comm,
    );
    0
}

// ========================== ADAPTERS ========================================

#[inline(always)]
fn start_time() -> &'static HashMap<u32, u64> {
    unsafe { &*addr_of!(START_TIME) }
}

#[inline(always)]
fn oncpu() -> &'static HashMap<u32, u64> {
    unsafe { &*addr_of!(ONCPU) }
}

#[inline(always)]
fn events() -> &'static RingBuf {
    unsafe { &*addr_of!(EVENTS) }
}

struct Table(&'static HashMap<u32, u64>);

impl TimeTable for Table {
    #[inline(always)]
    fn lookup(&self, key: u32) -> Option<u64> {
        unsafe { self.0.get(&key).copied() }
    }

    #[inline(always)]
    fn update(&self, key: u32, value: u64) {
        let _ = self.0.insert(&key, &value, 0);
    }

    // atomic add on the map value, so concurrent cpus never lose a slice
    #[inline(always)]
    fn accumulate(&self, key: u32, delta: u64) {
        if add_in_place(self.0, key, delta) {
            return;
        }
        if self.0.insert(&key, &delta, BPF_NOEXIST as u64).is_err() {
            // another cpu created the entry first
            let _ = add_in_place(self.0, key, delta);
        }
    }
}

#[inline(always)]
fn add_in_place(map: &HashMap<u32, u64>, key: u32, delta: u64) -> bool {
    match map.get_ptr_mut(&key) {
        Some(value) => {
            unsafe { AtomicU64::from_ptr(value) }.fetch_add(delta, Ordering::Relaxed);
            true
        }
        None => false,
    }
}

struct CallerMemory;

impl UserMemory for CallerMemory {
    #[inline(always)]
    fn read_ptr(&self, addr: u64) -> Option<u64> {
        unsafe { bpf_probe_read_user(addr as *const u64) }.ok()
    }

    #[inline(always)]
    fn read_str(&self, addr: u64, dest: &mut [u8]) -> Option<usize> {
        unsafe { bpf_probe_read_user_str_bytes(addr as *const u8, dest) }
            .ok()
            .map(|s| s.len())
    }
}

struct Events;

impl EventSink for Events {
    // full ring buffer: the record is dropped
    #[inline(always)]
    fn publish(&self, record: &ExecRecord) {
        let _ = events().output(record, 0);
    }
}

// ========================== HELPERS =========================================

#[inline(always)]
fn current_task() -> *const u8 {
    unsafe { bpf_get_current_task() as *const u8 }
}

#[inline(always)]
fn current_ids() -> TaskIds {
    // high 32 bits = TGID (process id from userspace perspective)
    // low 32 bits = PID (thread id from userspace perspective)
    let pid_tgid = bpf_get_current_pid_tgid();
    TaskIds {
        pid: pid_tgid as u32,
        tgid: (pid_tgid >> 32) as u32,
    }
}

#[inline(always)]
fn current_proc() -> ProcIds {
    let layout = task_layout();
    ProcIds {
        pid: current_ids().tgid,
        ppid: parent_tgid(current_task(), &layout),
    }
}

#[inline(always)]
fn current_cgroup() -> u32 {
    unsafe { bpf_get_current_cgroup_id() as u32 }
}

/// Read a `task_struct` field; a zero offset was never resolved.
#[inline(always)]
fn read_field<T>(task: *const u8, offset: u32) -> Option<T> {
    if task.is_null() || offset == 0 {
        return None;
    }
    unsafe { bpf_probe_read_kernel(task.add(offset as usize) as *const T) }.ok()
}

#[inline(always)]
fn task_ids(task: *const u8, layout: &TaskLayout) -> TaskIds {
    match (
        read_field::<i32>(task, layout.pid),
        read_field::<i32>(task, layout.tgid),
    ) {
        (Some(pid), Some(tgid)) => TaskIds {
            pid: pid as u32,
            tgid: tgid as u32,
        },
        _ => TaskIds::IDLE,
    }
}

// task->real_parent->tgid, 0 when unknown
#[inline(always)]
fn parent_tgid(task: *const u8, layout: &TaskLayout) -> u32 {
    read_field::<*const u8>(task, layout.real_parent)
        .and_then(|parent| read_field::<i32>(parent, layout.tgid))
        .map(|tgid| tgid as u32)
        .unwrap_or(0)
}

#[inline(always)]
fn read_sched_fork_pids(ctx: &TracePointContext) -> (u32, u32) {
    let parent = unsafe { ctx.read_at::<i32>(FORK_PARENT_PID_OFFSET).unwrap_or(0) } as u32;
    let child = unsafe { ctx.read_at::<i32>(FORK_CHILD_PID_OFFSET).unwrap_or(0) } as u32;
    (parent, child)
}

// =========== BOILERPLATE ===============

#[cfg(not(test))]
#[panic_handler]
fn panic(_info: &core::panic::PanicInfo) -> ! {
    loop {}
}

#[unsafe(link_section = "license")]
#[unsafe(no_mangle)]
static LICENSE: [u8; 13] = *b"Dual MIT/GPL\0";
