use std::{
    path::Path,
    process::Command,
    time::{Duration, Instant},
};

use anyhow::{anyhow, Result};
use oncpu::{
    attach_probes, cli::DEFAULT_OBJECT, connect_events_ringbuf, connect_oncpu_table, drain_oncpu,
    remove_locked_mem_limit, resolve_task_layout, setup_ebpf, Settings,
};
use oncpu_common::LifecycleEvent;
use tokio::{io::unix::AsyncFd, time::timeout};

fn settings() -> Result<Settings> {
    // relative to the workspace root
    let object = Path::new(env!("CARGO_MANIFEST_DIR")).join("..").join(DEFAULT_OBJECT);
    Ok(Settings {
        object,
        interval_ns: Some(1_000_000_000),
        layout: resolve_task_layout(None, Path::new(oncpu::btf::VMLINUX_BTF))?,
        max_tasks: 65_536,
    })
}

/// Needs root and a built oncpu-ebpf object. Runs `/bin/echo` and expects
/// the full INIT, ARGS, EXEC sequence for it on the ring buffer.
#[tokio::test]
#[ignore]
async fn test_exec_events_reach_userspace() -> Result<()> {
    env_logger::try_init().ok();
    remove_locked_mem_limit()?;

    let mut ebpf = setup_ebpf(&settings()?)?;
    attach_probes(&mut ebpf, true)?;
    let mut async_fd = AsyncFd::new(connect_events_ringbuf(&mut ebpf)?)?;

    let mut child = Command::new("/bin/echo").arg("oncpu-probe").spawn()?;
    let child_pid = child.id();

    let mut seen = Vec::new();
    timeout(Duration::from_secs(5), async {
        loop {
            let mut guard = async_fd.readable_mut().await?;
            let ring_buf = guard.get_inner_mut();
            while let Some(item) = ring_buf.next() {
                let event = LifecycleEvent::decode(&item)?;
                // the fork record for the child may come first
                if event.pid() == child_pid && !matches!(event, LifecycleEvent::Fork { .. }) {
                    seen.push(event);
                }
            }
            guard.clear_ready();
            if seen.iter().any(|e| matches!(e, LifecycleEvent::Exec { .. })) {
                return Ok::<(), anyhow::Error>(());
            }
        }
    })
    .await
    .map_err(|_| anyhow!("no exec event for {child_pid} within 5s"))??;
    child.wait()?;

    assert!(matches!(&seen[0], LifecycleEvent::Init { path, .. } if path == "/bin/echo"));
    assert!(seen
        .iter()
        .any(|e| matches!(e, LifecycleEvent::Args { arg, .. } if arg == "oncpu-probe")));
    assert!(seen
        .iter()
        .any(|e| matches!(e, LifecycleEvent::Exec { ret: 0, .. })));
    Ok(())
}

/// Needs root. A busy loop in this process must show up in the group table.
#[tokio::test]
#[ignore]
async fn test_cpu_time_is_accounted() -> Result<()> {
    env_logger::try_init().ok();
    remove_locked_mem_limit()?;

    let settings = settings()?;
    if !settings.layout.can_account() {
        return Err(anyhow!("kernel BTF unavailable"));
    }
    let mut ebpf = setup_ebpf(&settings)?;
    attach_probes(&mut ebpf, true)?;
    let mut oncpu = connect_oncpu_table(&mut ebpf)?;
    drain_oncpu(&mut oncpu);

    let spin_until = Instant::now() + Duration::from_millis(300);
    let mut x = 0u64;
    while Instant::now() < spin_until {
        x = x.wrapping_add(1);
    }
    std::hint::black_box(x);
    tokio::time::sleep(Duration::from_millis(50)).await;

    let me = std::process::id();
    let drained = drain_oncpu(&mut oncpu);
    let ns = drained
        .iter()
        .find(|(tgid, _)| *tgid == me)
        .map(|(_, ns)| *ns)
        .ok_or_else(|| anyhow!("no cpu time recorded for {me}"))?;
    assert!(ns > 0);
    Ok(())
}
