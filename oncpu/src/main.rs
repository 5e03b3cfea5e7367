use std::{
    fs::File,
    io::{self, BufWriter, Write},
    time::{Duration, Instant},
};

use anyhow::{Context, Result};
use aya::maps::{HashMap as AyaHashMap, MapData, RingBuf};
use clap::Parser;
use log::{debug, info, warn};
use oncpu::{
    attach_probes,
    cgroup::{CgroupNames, CGROUP_ROOT},
    cli::Cli,
    connect_events_ringbuf, connect_oncpu_table, drain_oncpu,
    process::{ProcFs, ProcessTable},
    remove_locked_mem_limit,
    report::{select_samples, Reporter},
    setup_ebpf, Settings,
};
use oncpu_common::LifecycleEvent;
use tokio::{
    io::unix::AsyncFd,
    signal::unix::{signal, SignalKind},
    time::MissedTickBehavior,
};

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    remove_locked_mem_limit()?;

    let settings = Settings::from_cli(&cli)?;
    let mut ebpf = setup_ebpf(&settings)?;
    attach_probes(&mut ebpf, settings.interval_ns.is_some())?;

    let events = AsyncFd::new(connect_events_ringbuf(&mut ebpf)?)?;
    let oncpu = match settings.interval_ns {
        Some(_) => Some(connect_oncpu_table(&mut ebpf)?),
        None => None,
    };

    // probes are live: whatever the scan misses shows up as events
    let started = Instant::now();
    let started_unix = chrono::Utc::now();
    let procfs = ProcFs::new(started_unix.timestamp_millis() as f64 / 1000.0)?;
    let mut procs = ProcessTable::default();
    procs.scan_all(&procfs);
    let mut cgroups = CgroupNames::new(CGROUP_ROOT);
    cgroups.scan();
    info!("tracking {} processes", procs.len());

    let out: Box<dyn Write> = match &cli.output {
        Some(path) => Box::new(BufWriter::new(
            File::create(path).with_context(|| format!("creating {}", path.display()))?,
        )),
        None => Box::new(io::stdout()),
    };
    let mut reporter = Reporter::new(out, cli.json, cgroups);
    reporter.header(cli.interval, started_unix.timestamp())?;

    let agent = Agent {
        procs,
        procfs,
        reporter,
        oncpu,
        min_cpu: cli.min_cpu,
        started,
        output_limit: cli.output_limit_bytes(),
    };
    let period = settings
        .interval_ns
        .map(|_| Duration::from_millis(cli.interval));
    run(agent, events, period).await
}

struct Agent<W: Write> {
    procs: ProcessTable,
    procfs: ProcFs,
    reporter: Reporter<W>,
    oncpu: Option<AyaHashMap<MapData, u32, u64>>,
    min_cpu: Option<f64>,
    started: Instant,
    output_limit: Option<u64>,
}

impl<W: Write> Agent<W> {
    fn now(&self) -> f64 {
        self.started.elapsed().as_secs_f64()
    }

    fn handle_record(&mut self, bytes: &[u8]) {
        match LifecycleEvent::decode(bytes) {
            Ok(event) => {
                debug!("{event:?}");
                let now = self.now();
                self.procs.apply(event, now, &self.procfs);
            }
            Err(e) => warn!("dropping record: {e}"),
        }
    }

    fn report(&mut self) -> Result<()> {
        let Some(table) = self.oncpu.as_mut() else {
            return Ok(());
        };
        let samples = select_samples(drain_oncpu(table), self.min_cpu, &self.procs);
        let now = self.now();
        self.reporter
            .tick(&mut self.procs, samples, now, chrono::Local::now())?;
        // their last slice was just reported
        self.procs.prune_exited();
        Ok(())
    }

    fn over_limit(&self) -> bool {
        self.output_limit
            .is_some_and(|limit| self.reporter.written() > limit)
    }

    fn finish(&mut self) -> Result<()> {
        self.report()?;
        let now = self.now();
        self.reporter.end(now)?;
        Ok(())
    }
}

async fn run<W: Write>(
    mut agent: Agent<W>,
    mut events: AsyncFd<RingBuf<MapData>>,
    period: Option<Duration>,
) -> Result<()> {
    // never ticks when accounting is off, see the select guard
    let mut ticker = tokio::time::interval(period.unwrap_or(Duration::from_secs(3600)));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // the first tick completes immediately
    ticker.tick().await;
    let mut sigterm = signal(SignalKind::terminate())?;

    loop {
        tokio::select! {
            guard = events.readable_mut() => {
                let mut guard = guard?;
                let ring_buf = guard.get_inner_mut();
                while let Some(item) = ring_buf.next() {
                    agent.handle_record(&item);
                }
                guard.clear_ready();
                if agent.oncpu.is_none() {
                    agent.procs.prune_exited();
                }
            }
            _ = ticker.tick(), if period.is_some() => agent.report()?,
            _ = tokio::signal::ctrl_c() => {
                info!("interrupted");
                break;
            }
            _ = sigterm.recv() => {
                info!("terminated");
                break;
            }
        }

        if agent.over_limit() {
            warn!("Reached output size limit");
            break;
        }
    }

    agent.finish()
}
