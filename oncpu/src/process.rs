//! Userspace process table, fed by lifecycle events.
//!
//! Only processes that went through a successful exec (or were already
//! running at startup) are tracked; everything else is dropped silently,
//! since events for short-lived clones arrive out of order all the time.

use std::{
    collections::{HashMap, HashSet},
    fs,
    path::{Path, PathBuf},
};

use anyhow::{anyhow, Context, Result};
use log::{debug, warn};
use oncpu_common::LifecycleEvent;

use crate::cgroup::{CgroupNames, CGROUP_ROOT, ROOT_CGROUP};

#[derive(Debug, Clone, PartialEq)]
pub struct Process {
    pub pid: u32,
    pub ppid: u32,
    pub cgroup: u32,
    pub argv: Vec<String>,
    /// seconds relative to agent start, `None` until the exec returned
    pub start: Option<f64>,
    pub exit_status: Option<u32>,
}

impl Process {
    pub fn argv0(&self) -> &str {
        self.argv.first().map(String::as_str).unwrap_or("?")
    }
}

/// Something that can describe a live process by pid.
pub trait ProcSource {
    fn pids(&self) -> Vec<u32>;
    fn scan(&self, pid: u32) -> Result<Process>;
    /// Thread group of `pid`, `None` once the task is gone.
    fn tgid(&self, pid: u32) -> Option<u32>;
}

#[derive(Default)]
pub struct ProcessTable {
    procs: HashMap<u32, Process>,
    // pids whose descriptor was already written out
    described: HashSet<u32>,
}

impl ProcessTable {
    /// Load every process visible at startup, skipping the root cgroup
    /// (kernel threads and early boot helpers).
    pub fn scan_all(&mut self, source: &impl ProcSource) {
        for pid in source.pids() {
            match source.scan(pid) {
                Ok(proc) if proc.cgroup == ROOT_CGROUP => {}
                Ok(proc) => {
                    self.procs.insert(pid, proc);
                }
                Err(e) => debug!("[scan] {pid}: {e:#}"),
            }
        }
        debug!("[scan] {} processes", self.procs.len());
    }

    /// `now` is seconds since agent start.
    pub fn apply(&mut self, event: LifecycleEvent, now: f64, source: &impl ProcSource) {
        match event {
            LifecycleEvent::Fork { pid, ppid, .. } => {
                // the fork tracepoint also fires for new threads, which never
                // report an exit of their own
                match source.tgid(pid) {
                    Some(tgid) if tgid == pid => {}
                    Some(tgid) => {
                        debug!("[fork] {pid} is a thread of {tgid}");
                        return;
                    }
                    None => {
                        debug!("[fork] {pid} already gone");
                        return;
                    }
                }
                let child = match self.procs.get(&ppid) {
                    Some(parent) => Process {
                        pid,
                        ppid,
                        cgroup: parent.cgroup,
                        argv: parent.argv.clone(),
                        start: Some(now),
                        exit_status: None,
                    },
                    None => match source.scan(pid) {
                        Ok(proc) => proc,
                        Err(e) => {
                            debug!("[fork] {pid} already gone: {e:#}");
                            return;
                        }
                    },
                };
                debug!("[fork] {pid} <- {ppid} {:?}", child.argv);
                // a recycled pid needs a fresh descriptor
                self.described.remove(&pid);
                self.procs.insert(pid, child);
            }
            LifecycleEvent::Init {
                pid,
                ppid,
                cgroup,
                path,
            } => {
                // execve("", ...) happens, nothing useful to track
                if path.is_empty() {
                    return;
                }
                self.procs.insert(
                    pid,
                    Process {
                        pid,
                        ppid,
                        cgroup,
                        argv: vec![path],
                        start: None,
                        exit_status: None,
                    },
                );
            }
            LifecycleEvent::Args { pid, arg, .. } => {
                if let Some(proc) = self.procs.get_mut(&pid) {
                    proc.argv.push(arg);
                }
            }
            LifecycleEvent::Exec { pid, ret, .. } => {
                // inherited behaviour: the whole entry goes, even when INIT
                // replaced a process that was already tracked
                if ret != 0 {
                    self.procs.remove(&pid);
                    return;
                }
                if let Some(proc) = self.procs.get_mut(&pid) {
                    proc.start = Some(now);
                    debug!("[exec] {pid} {:?}", proc.argv);
                    self.described.remove(&pid);
                }
            }
            LifecycleEvent::Exit { pid, status, .. } => {
                if let Some(proc) = self.procs.get_mut(&pid) {
                    debug!("[exit] {pid} status={status}");
                    proc.exit_status = Some(status);
                }
            }
        }
    }

    pub fn get(&self, pid: u32) -> Option<&Process> {
        self.procs.get(&pid)
    }

    pub fn contains(&self, pid: u32) -> bool {
        self.procs.contains_key(&pid)
    }

    pub fn len(&self) -> usize {
        self.procs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.procs.is_empty()
    }

    pub fn is_described(&self, pid: u32) -> bool {
        self.described.contains(&pid)
    }

    pub fn mark_described(&mut self, pid: u32) {
        self.described.insert(pid);
    }

    /// `pid` followed by its not yet described ancestors, nearest first.
    /// Stops at the first unknown parent or on a pid/ppid cycle.
    pub fn undescribed_lineage(&self, pid: u32) -> Vec<u32> {
        let mut chain = Vec::new();
        let mut seen = HashSet::new();
        let mut cur = pid;
        while let Some(proc) = self.procs.get(&cur) {
            if !seen.insert(cur) {
                warn!("circular pid/ppid at {cur} ({chain:?})");
                break;
            }
            chain.push(cur);
            if !self.procs.contains_key(&proc.ppid) || self.described.contains(&proc.ppid) {
                break;
            }
            cur = proc.ppid;
        }
        chain
    }

    /// Forget processes that have exited. Call after their final cpu
    /// sample was reported.
    pub fn prune_exited(&mut self) {
        let gone: Vec<u32> = self
            .procs
            .values()
            .filter(|p| p.exit_status.is_some())
            .map(|p| p.pid)
            .collect();
        for pid in gone {
            self.procs.remove(&pid);
            self.described.remove(&pid);
        }
    }
}

/// Reads process details from a procfs mount.
pub struct ProcFs {
    proc_root: PathBuf,
    cgroup_root: PathBuf,
    boot_time: u64,
    clock_ticks: u64,
    started_unix: f64,
}

impl ProcFs {
    /// The host's `/proc`; `started_unix` anchors relative start times.
    pub fn new(started_unix: f64) -> Result<Self> {
        let proc_root = PathBuf::from("/proc");
        let boot_time = read_boot_time(&proc_root)?;
        let clock_ticks = match unsafe { libc::sysconf(libc::_SC_CLK_TCK) } {
            ticks if ticks > 0 => ticks as u64,
            _ => 100,
        };
        Ok(Self::with_roots(
            proc_root,
            CGROUP_ROOT,
            boot_time,
            clock_ticks,
            started_unix,
        ))
    }

    pub fn with_roots(
        proc_root: impl Into<PathBuf>,
        cgroup_root: impl Into<PathBuf>,
        boot_time: u64,
        clock_ticks: u64,
        started_unix: f64,
    ) -> Self {
        Self {
            proc_root: proc_root.into(),
            cgroup_root: cgroup_root.into(),
            boot_time,
            clock_ticks,
            started_unix,
        }
    }

    fn read(&self, pid: u32, file: &str) -> Result<String> {
        let path = self.proc_root.join(pid.to_string()).join(file);
        fs::read_to_string(&path).with_context(|| format!("reading {}", path.display()))
    }
}

impl ProcSource for ProcFs {
    fn pids(&self) -> Vec<u32> {
        let Ok(entries) = fs::read_dir(&self.proc_root) else {
            return Vec::new();
        };
        entries
            .flatten()
            .filter_map(|e| e.file_name().to_str()?.parse().ok())
            .collect()
    }

    fn scan(&self, pid: u32) -> Result<Process> {
        let status = self.read(pid, "status")?;
        let ppid = parse_status_id(&status, "PPid:").ok_or_else(|| anyhow!("no PPid in status of {pid}"))?;

        let exe_link = self.proc_root.join(pid.to_string()).join("exe");
        let exe = fs::read_link(&exe_link)
            .with_context(|| format!("reading {}", exe_link.display()))?;
        let mut argv = vec![exe.to_string_lossy().into_owned()];
        argv.extend(parse_cmdline_args(&self.read(pid, "cmdline")?));

        let cgroup_path = parse_cgroup_path(&self.read(pid, "cgroup")?)
            .ok_or_else(|| anyhow!("no cgroup for {pid}"))?;
        let cgroup = CgroupNames::id_of(&self.cgroup_root, &cgroup_path)
            .ok_or_else(|| anyhow!("cgroup {cgroup_path} of {pid} not found"))?;

        let ticks = parse_start_ticks(&self.read(pid, "stat")?)
            .ok_or_else(|| anyhow!("malformed stat for {pid}"))?;
        let start = (ticks as f64 / self.clock_ticks as f64) + self.boot_time as f64
            - self.started_unix;

        Ok(Process {
            pid,
            ppid,
            cgroup,
            argv,
            start: Some(start),
            exit_status: None,
        })
    }

    fn tgid(&self, pid: u32) -> Option<u32> {
        parse_status_id(&self.read(pid, "status").ok()?, "Tgid:")
    }
}

fn read_boot_time(proc_root: &Path) -> Result<u64> {
    let stat = fs::read_to_string(proc_root.join("stat")).context("reading /proc/stat")?;
    stat.lines()
        .find_map(|l| l.strip_prefix("btime")?.trim().parse().ok())
        .ok_or_else(|| anyhow!("no btime in /proc/stat"))
}

fn parse_status_id(status: &str, key: &str) -> Option<u32> {
    status
        .lines()
        .find_map(|l| l.strip_prefix(key))?
        .trim()
        .parse()
        .ok()
}

// argv[0] comes from the exe link, empty strings are dropped
fn parse_cmdline_args(cmdline: &str) -> impl Iterator<Item = String> + '_ {
    cmdline
        .split('\0')
        .skip(1)
        .filter(|a| !a.is_empty())
        .map(str::to_string)
}

// last hierarchy line, e.g. `0::/system.slice/sshd.service`
fn parse_cgroup_path(cgroup: &str) -> Option<String> {
    let line = cgroup.lines().filter(|l| !l.is_empty()).last()?;
    let (_, path) = line.split_once('/')?;
    Some(format!("/{path}"))
}

// starttime is field 22; the comm field may itself contain spaces or ')'
fn parse_start_ticks(stat: &str) -> Option<u64> {
    let (_, rest) = stat.rsplit_once(')')?;
    rest.split_whitespace().nth(19)?.parse().ok()
}
