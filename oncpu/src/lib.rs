pub mod btf;
pub mod cgroup;
pub mod cli;
pub mod process;
pub mod report;

use std::{
    fs,
    path::{Path, PathBuf},
};

use anyhow::{anyhow, Context, Result};
use aya::{
    maps::{HashMap as AyaHashMap, MapData, RingBuf},
    programs::{KProbe, TracePoint},
    Ebpf, EbpfLoader,
};
use log::{debug, info, warn};
use oncpu_common::{
    TaskLayout, DEFAULT_INTERVAL_NS, EVENTS_MAP, INTERVAL_GLOBAL, LAYOUT_GLOBAL, ONCPU_MAP,
    START_TIME_MAP,
};

use crate::cli::Cli;

pub const PID_MAX_PATH: &str = "/proc/sys/kernel/pid_max";

// the switch hook is often only reachable under its IPA-SRA clone name
pub const SWITCH_SYMBOLS: &[&str] = &["finish_task_switch", "finish_task_switch.isra.0"];

/// Everything the kernel side is parameterised with at load time.
#[derive(Debug, Clone)]
pub struct Settings {
    pub object: PathBuf,
    /// `None` disables cpu accounting
    pub interval_ns: Option<u64>,
    pub layout: TaskLayout,
    pub max_tasks: u32,
}

impl Settings {
    pub fn from_cli(cli: &Cli) -> Result<Self> {
        let layout = resolve_task_layout(cli.task_layout.as_deref(), Path::new(btf::VMLINUX_BTF))?;
        let max_tasks = match cli.max_tasks {
            Some(n) => n,
            None => read_pid_max(Path::new(PID_MAX_PATH))?,
        };
        Ok(Self {
            object: cli.object.clone(),
            interval_ns: cli.interval_ns(),
            layout,
            max_tasks,
        })
    }
}

/// An explicit layout file wins; otherwise ask the kernel's BTF. Without
/// either the hooks still run, minus accounting and parent pids.
pub fn resolve_task_layout(file: Option<&Path>, vmlinux: &Path) -> Result<TaskLayout> {
    if let Some(path) = file {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("reading task layout {}", path.display()))?;
        return serde_json::from_str(&raw)
            .with_context(|| format!("parsing task layout {}", path.display()));
    }
    match btf::load_task_layout(vmlinux) {
        Ok(layout) => {
            debug!("[btf] {layout:?}");
            Ok(layout)
        }
        Err(e) => {
            warn!("no task_struct layout ({e:#}), cpu accounting and parent pids disabled");
            Ok(TaskLayout::UNSET)
        }
    }
}

pub fn read_pid_max(path: &Path) -> Result<u32> {
    fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?
        .trim()
        .parse()
        .with_context(|| format!("parsing {}", path.display()))
}

pub fn remove_locked_mem_limit() -> Result<()> {
    // rlimit bump, kernels before 5.11 charge maps against it
    let rlim = libc::rlimit {
        rlim_cur: libc::RLIM_INFINITY,
        rlim_max: libc::RLIM_INFINITY,
    };
    let ret = unsafe { libc::setrlimit(libc::RLIMIT_MEMLOCK, &rlim) };
    if ret != 0 {
        debug!("remove limit on locked memory failed, ret is: {ret}");
    }
    Ok(())
}

pub fn setup_ebpf(settings: &Settings) -> Result<Ebpf> {
    let interval_ns = settings.interval_ns.unwrap_or(DEFAULT_INTERVAL_NS);
    // load BPF
    let mut ebpf = EbpfLoader::new()
        .set_global(INTERVAL_GLOBAL, &interval_ns, true)
        .set_global(LAYOUT_GLOBAL, &settings.layout, true)
        .set_max_entries(START_TIME_MAP, settings.max_tasks)
        .set_max_entries(ONCPU_MAP, settings.max_tasks)
        .load_file(&settings.object)
        .with_context(|| format!("loading eBPF object {}", settings.object.display()))?;
    if let Err(e) = aya_log::EbpfLogger::init(&mut ebpf) {
        warn!("failed to initialize eBPF logger: {e}");
    }
    Ok(ebpf)
}

pub fn attach_tp(ebpf: &mut Ebpf, prog_name: &str, cat: &str, evt: &str) -> Result<()> {
    info!("[attach-tp] {prog_name} -> {cat}:{evt}");
    let prog: &mut TracePoint = ebpf
        .program_mut(prog_name)
        .ok_or_else(|| anyhow!("program not found: {prog_name}"))?
        .try_into()?;
    prog.load()?;
    prog.attach(cat, evt)?;
    Ok(())
}

/// Attach to the first of `symbols` the kernel knows.
pub fn attach_kprobe(ebpf: &mut Ebpf, prog_name: &str, symbols: &[&str]) -> Result<()> {
    let prog: &mut KProbe = ebpf
        .program_mut(prog_name)
        .ok_or_else(|| anyhow!("program not found: {prog_name}"))?
        .try_into()?;
    prog.load()?;
    let mut last_err = None;
    for symbol in symbols {
        match prog.attach(symbol, 0) {
            Ok(_) => {
                info!("[attach-kprobe] {prog_name} -> {symbol}");
                return Ok(());
            }
            Err(e) => {
                debug!("[attach-kprobe] {symbol}: {e}");
                last_err = Some(e);
            }
        }
    }
    match last_err {
        Some(e) => Err(anyhow::Error::from(e).context(format!("attaching {prog_name}"))),
        None => Err(anyhow!("no symbol given for {prog_name}")),
    }
}

pub fn attach_probes(ebpf: &mut Ebpf, cpu_accounting: bool) -> Result<()> {
    // attach programs
    attach_tp(ebpf, "sys_enter_execve", "syscalls", "sys_enter_execve")?;
    attach_tp(ebpf, "sys_exit_execve", "syscalls", "sys_exit_execve")?;
    attach_tp(ebpf, "sched_process_fork", "sched", "sched_process_fork")?;
    attach_tp(ebpf, "sched_process_exit", "sched", "sched_process_exit")?;
    if cpu_accounting {
        attach_kprobe(ebpf, "finish_task_switch", SWITCH_SYMBOLS)?;
    }
    Ok(())
}

pub fn connect_events_ringbuf(ebpf: &mut Ebpf) -> Result<RingBuf<MapData>> {
    // open EVENTS ring buffer
    info!("[map] opening {EVENTS_MAP} ring buffer");
    let events_map = ebpf
        .take_map(EVENTS_MAP)
        .ok_or_else(|| anyhow!("map not found: {EVENTS_MAP}"))?;
    Ok(RingBuf::try_from(events_map)?)
}

pub fn connect_oncpu_table(ebpf: &mut Ebpf) -> Result<AyaHashMap<MapData, u32, u64>> {
    info!("[map] opening {ONCPU_MAP}");
    let oncpu_map = ebpf
        .take_map(ONCPU_MAP)
        .ok_or_else(|| anyhow!("map not found: {ONCPU_MAP}"))?;
    Ok(AyaHashMap::try_from(oncpu_map)?)
}

/// Read and delete every entry of the group table.
pub fn drain_oncpu(table: &mut AyaHashMap<MapData, u32, u64>) -> Vec<(u32, u64)> {
    let tgids: Vec<u32> = table.keys().filter_map(Result::ok).collect();
    let mut drained = Vec::with_capacity(tgids.len());
    for tgid in tgids {
        // time added between get and remove is lost
        if let Ok(ns) = table.get(&tgid, 0) {
            drained.push((tgid, ns));
        }
        if let Err(e) = table.remove(&tgid) {
            debug!("[drain] remove {tgid}: {e}");
        }
    }
    drained
}
