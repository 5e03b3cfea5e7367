//! On-cpu time accounting.
//!
//! Two tables keyed by kernel ids: the start time of the slice each task
//! is currently running (`pid` -> ns) and the bounded cumulative on-cpu time
//! of each thread group (`tgid` -> ns). Every scheduler switch closes the
//! outgoing task's slice into its group and opens one for the incoming task.

/// A `u32 -> u64` table shared by every cpu.
///
/// A single `update` is atomic, a `lookup` followed by an `update` is not.
pub trait TimeTable {
    fn lookup(&self, key: u32) -> Option<u64>;

    fn update(&self, key: u32, value: u64);

    /// Add `delta` to the value under `key`, starting from 0.
    ///
    /// The default is a plain read-modify-write: two cpus adding to the same
    /// key at once can lose one of the two contributions. Tables backed by
    /// memory that supports an atomic add should override it.
    #[inline(always)]
    fn accumulate(&self, key: u32, delta: u64) {
        let total = self.lookup(key).unwrap_or(0).saturating_add(delta);
        self.update(key, total);
    }
}

/// Kernel ids of a task: `pid` is the thread, `tgid` its process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskIds {
    pub pid: u32,
    pub tgid: u32,
}

impl TaskIds {
    /// idle, or a task we failed to read
    pub const IDLE: Self = Self { pid: 0, tgid: 0 };
}

/// Length of the slice `start..now` if it is worth accounting.
///
/// Zero and backwards slices are clock anomalies; slices at or above
/// `interval_ns` mean the task was not observed for a whole interval and
/// the recorded start is stale.
#[inline(always)]
pub fn accepted_delta(start: u64, now: u64, interval_ns: u64) -> Option<u64> {
    match now.checked_sub(start) {
        Some(delta) if delta > 0 && delta < interval_ns => Some(delta),
        _ => None,
    }
}

/// Charge the slice `prev` just finished to its thread group.
#[inline(always)]
pub fn close_slice<S, G>(start_time: &S, oncpu: &G, prev: TaskIds, now: u64, interval_ns: u64)
where
    S: TimeTable + ?Sized,
    G: TimeTable + ?Sized,
{
    if prev.tgid == 0 {
        return;
    }
    let Some(start) = start_time.lookup(prev.pid) else {
        return;
    };
    if let Some(delta) = accepted_delta(start, now, interval_ns) {
        oncpu.accumulate(prev.tgid, delta);
    }
}

/// Remember when `next_pid` was put on cpu.
#[inline(always)]
pub fn open_slice<S: TimeTable + ?Sized>(start_time: &S, next_pid: u32, now: u64) {
    start_time.update(next_pid, now);
}

/// One scheduler switch: `prev` leaves the cpu, `next_pid` takes it.
///
/// `clock` is sampled once to close the outgoing slice and once more to open
/// the incoming one. Nothing is reported back; every failure just skips the
/// update it concerns.
#[inline(always)]
pub fn account_switch<S, G, C>(
    start_time: &S,
    oncpu: &G,
    prev: TaskIds,
    next_pid: u32,
    interval_ns: u64,
    clock: C,
) where
    S: TimeTable + ?Sized,
    G: TimeTable + ?Sized,
    C: Fn() -> u64,
{
    close_slice(start_time, oncpu, prev, clock(), interval_ns);
    open_slice(start_time, next_pid, clock());
}
