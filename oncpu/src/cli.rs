use std::path::PathBuf;

use clap::Parser;

/// Where `cargo build` in oncpu-ebpf leaves the object
pub const DEFAULT_OBJECT: &str = "target/bpfel-unknown-none/release/oncpu";

#[derive(Parser, Debug)]
#[command(
    name = "oncpu",
    version = env!("CARGO_PKG_VERSION"),
    about = "Per-process CPU time and exec/fork/exit telemetry"
)]
pub struct Cli {
    /// report period in msec, 0 disables cpu accounting
    #[arg(long, default_value_t = 1000)]
    pub interval: u64,

    /// hide processes that spent less than this (msec) in an interval
    #[arg(long)]
    pub min_cpu: Option<f64>,

    /// emit JSON lines instead of text
    #[arg(long)]
    pub json: bool,

    /// write the report here instead of stdout
    #[arg(long, env = "ONCPU_OUTPUT")]
    pub output: Option<PathBuf>,

    /// stop once --output grows past this many MB
    #[arg(long, default_value_t = 256)]
    pub output_limit: u64,

    /// compiled eBPF object
    #[arg(long, env = "ONCPU_OBJECT", default_value = DEFAULT_OBJECT)]
    pub object: PathBuf,

    /// JSON file with task_struct offsets, read from kernel BTF when absent
    #[arg(long)]
    pub task_layout: Option<PathBuf>,

    /// size of the per-task tables, defaults to kernel.pid_max
    #[arg(long)]
    pub max_tasks: Option<u32>,
}

impl Cli {
    /// Slice bound handed to the kernel, `None` when accounting is off.
    pub fn interval_ns(&self) -> Option<u64> {
        (self.interval != 0).then(|| self.interval.saturating_mul(1_000_000))
    }

    /// The limit only applies to a file output.
    pub fn output_limit_bytes(&self) -> Option<u64> {
        self.output
            .as_ref()
            .map(|_| self.output_limit.saturating_mul(1_000_000))
    }
}
