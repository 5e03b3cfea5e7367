use std::{
    collections::HashSet,
    io::{self, Write},
};

use chrono::{DateTime, Local};
use serde::Serialize;

use crate::{cgroup::CgroupNames, process::ProcessTable};

/// Processes younger than this (seconds) are left out of JSON reports.
pub const MIN_AGE_SECS: f64 = 0.5;

/// CPU time one process group spent during the last interval.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Sample {
    pub pid: u32,
    pub ms: f64,
}

/// Turn drained `(tgid, ns)` pairs into samples, dropping the ones below
/// `min_cpu` (ms) and the ones for processes we never saw exec.
pub fn select_samples(
    drained: impl IntoIterator<Item = (u32, u64)>,
    min_cpu: Option<f64>,
    procs: &ProcessTable,
) -> Vec<Sample> {
    drained
        .into_iter()
        .map(|(pid, ns)| Sample {
            pid,
            ms: ns as f64 / 1e6,
        })
        .filter(|s| min_cpu.map_or(true, |min| s.ms >= min))
        .filter(|s| procs.contains(s.pid))
        .collect()
}

#[derive(Serialize)]
#[serde(untagged)]
enum JsonLine<'a> {
    Interval {
        interval: u64,
    },
    Start {
        start: i64,
    },
    Cgroup {
        cgr: u32,
        v: &'a str,
    },
    Process {
        pid: u32,
        ppid: u32,
        t: f64,
        cg: u32,
        v: &'a [String],
    },
    Tick {
        ts: f64,
    },
    Cpu {
        cpu: u32,
        v: f64,
    },
    End {
        end: u64,
    },
}

/// Counts what goes through, for the output size limit.
pub struct CountingWriter<W> {
    inner: W,
    written: u64,
}

impl<W: Write> Write for CountingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

pub struct Reporter<W: Write> {
    out: CountingWriter<W>,
    json: bool,
    cgroups: CgroupNames,
    described_cgroups: HashSet<u32>,
}

impl<W: Write> Reporter<W> {
    pub fn new(out: W, json: bool, cgroups: CgroupNames) -> Self {
        Self {
            out: CountingWriter {
                inner: out,
                written: 0,
            },
            json,
            cgroups,
            described_cgroups: HashSet::new(),
        }
    }

    pub fn written(&self) -> u64 {
        self.out.written
    }

    pub fn into_inner(self) -> W {
        self.out.inner
    }

    /// JSON only: report period (ms) and agent start (unix seconds).
    pub fn header(&mut self, interval_ms: u64, start_unix: i64) -> io::Result<()> {
        if !self.json {
            return Ok(());
        }
        self.line(&JsonLine::Interval {
            interval: interval_ms,
        })?;
        self.line(&JsonLine::Start { start: start_unix })?;
        self.out.flush()
    }

    /// One report interval. `relnow` is seconds since agent start.
    pub fn tick(
        &mut self,
        procs: &mut ProcessTable,
        samples: Vec<Sample>,
        relnow: f64,
        wall: DateTime<Local>,
    ) -> io::Result<()> {
        if self.json {
            self.json_tick(procs, samples, relnow)?;
        } else {
            self.text_tick(procs, samples, wall)?;
        }
        self.out.flush()
    }

    fn text_tick(
        &mut self,
        procs: &ProcessTable,
        mut samples: Vec<Sample>,
        wall: DateTime<Local>,
    ) -> io::Result<()> {
        if samples.is_empty() {
            return Ok(());
        }
        writeln!(self.out, "[{}]", wall.format("%H:%M:%S"))?;
        samples.sort_by(|a, b| a.ms.total_cmp(&b.ms));
        for sample in &samples {
            let Some(proc) = procs.get(sample.pid) else {
                continue;
            };
            let cgroup = self.cgroups.name(proc.cgroup);
            writeln!(
                self.out,
                "{cgroup}:\t{}[{}] spent {:.3}ms",
                proc.argv0(),
                sample.pid,
                sample.ms
            )?;
        }
        Ok(())
    }

    fn json_tick(
        &mut self,
        procs: &mut ProcessTable,
        samples: Vec<Sample>,
        relnow: f64,
    ) -> io::Result<()> {
        self.line(&JsonLine::Tick {
            ts: round(relnow, 2),
        })?;
        for sample in samples {
            let Some(start) = procs.get(sample.pid).and_then(|p| p.start) else {
                continue;
            };
            if relnow - start < MIN_AGE_SECS {
                continue;
            }
            if !procs.is_described(sample.pid) {
                self.describe(procs, sample.pid)?;
            }
            self.line(&JsonLine::Cpu {
                cpu: sample.pid,
                v: round(sample.ms, 3),
            })?;
        }
        Ok(())
    }

    // ancestors first, each preceded by its cgroup when that is new
    fn describe(&mut self, procs: &mut ProcessTable, pid: u32) -> io::Result<()> {
        for pid in procs.undescribed_lineage(pid).into_iter().rev() {
            let Some(proc) = procs.get(pid) else {
                continue;
            };
            if self.described_cgroups.insert(proc.cgroup) {
                let name = self.cgroups.name(proc.cgroup).to_string();
                self.line(&JsonLine::Cgroup {
                    cgr: proc.cgroup,
                    v: &name,
                })?;
            }
            self.line(&JsonLine::Process {
                pid,
                ppid: proc.ppid,
                t: round(proc.start.unwrap_or(-1.0), 2),
                cg: proc.cgroup,
                v: &proc.argv,
            })?;
            procs.mark_described(pid);
        }
        Ok(())
    }

    pub fn end(&mut self, relnow: f64) -> io::Result<()> {
        if self.json {
            self.line(&JsonLine::End {
                end: relnow as u64,
            })?;
        } else {
            writeln!(self.out, "Done.")?;
        }
        self.out.flush()
    }

    fn line(&mut self, line: &JsonLine) -> io::Result<()> {
        serde_json::to_writer(&mut self.out, line)?;
        self.out.write_all(b"\n")
    }
}

fn round(v: f64, places: i32) -> f64 {
    let scale = 10f64.powi(places);
    (v * scale).round() / scale
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::{Process, ProcSource};
    use anyhow::{anyhow, Result};
    use chrono::TimeZone;
    use oncpu_common::LifecycleEvent;
    use serde_json::{json, Value};

    struct NoProc;

    impl ProcSource for NoProc {
        fn pids(&self) -> Vec<u32> {
            Vec::new()
        }

        fn scan(&self, _pid: u32) -> Result<Process> {
            Err(anyhow!("not found"))
        }

        fn tgid(&self, _pid: u32) -> Option<u32> {
            None
        }
    }

    fn exec(table: &mut ProcessTable, pid: u32, ppid: u32, argv: &[&str], now: f64) {
        table.apply(
            LifecycleEvent::Init {
                pid,
                ppid,
                cgroup: 7,
                path: argv[0].into(),
            },
            now,
            &NoProc,
        );
        for arg in &argv[1..] {
            table.apply(
                LifecycleEvent::Args {
                    pid,
                    ppid,
                    cgroup: 7,
                    arg: arg.to_string(),
                },
                now,
                &NoProc,
            );
        }
        table.apply(LifecycleEvent::Exec { pid, ppid, ret: 0 }, now, &NoProc);
    }

    fn reporter(json: bool) -> Reporter<Vec<u8>> {
        // an empty hierarchy: every id resolves to "unknown"
        Reporter::new(Vec::new(), json, CgroupNames::new("/nonexistent/cgroup"))
    }

    fn wall() -> DateTime<Local> {
        Local.with_ymd_and_hms(2024, 5, 1, 13, 4, 5).unwrap()
    }

    fn lines(out: Vec<u8>) -> Vec<Value> {
        String::from_utf8(out)
            .unwrap()
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect()
    }

    #[test]
    fn test_select_samples_filters() {
        let mut table = ProcessTable::default();
        exec(&mut table, 10, 1, &["/bin/a"], 0.0);
        exec(&mut table, 20, 1, &["/bin/b"], 0.0);

        let samples = select_samples([(10, 2_500_000), (20, 400_000), (30, 9_000_000)], Some(1.0), &table);
        assert_eq!(samples, vec![Sample { pid: 10, ms: 2.5 }]);

        let all = select_samples([(10, 1), (20, 2)], None, &table);
        assert_eq!(all.len(), 2);
    }

    #[test]
    fn test_text_report_sorted_by_time() {
        let mut table = ProcessTable::default();
        exec(&mut table, 10, 1, &["/usr/bin/make", "-j8"], 0.0);
        exec(&mut table, 20, 1, &["/usr/bin/cc"], 0.0);
        let mut rep = reporter(false);

        let samples = vec![Sample { pid: 10, ms: 12.0 }, Sample { pid: 20, ms: 0.5 }];
        rep.tick(&mut table, samples, 1.0, wall()).unwrap();
        rep.end(1.0).unwrap();

        let out = String::from_utf8(rep.into_inner()).unwrap();
        assert_eq!(
            out,
            "[13:04:05]\n\
             unknown:\t/usr/bin/cc[20] spent 0.500ms\n\
             unknown:\t/usr/bin/make[10] spent 12.000ms\n\
             Done.\n"
        );
    }

    #[test]
    fn test_text_report_skips_empty_interval() {
        let mut rep = reporter(false);
        rep.tick(&mut ProcessTable::default(), Vec::new(), 1.0, wall())
            .unwrap();
        assert_eq!(rep.written(), 0);
    }

    #[test]
    fn test_json_report() {
        let mut table = ProcessTable::default();
        exec(&mut table, 10, 1, &["/bin/sh", "-c", "make"], 1.0);
        exec(&mut table, 20, 10, &["/usr/bin/make"], 1.0);
        exec(&mut table, 30, 10, &["/usr/bin/cc"], 1.8);
        let mut rep = reporter(true);

        rep.header(1000, 1_700_000_000).unwrap();
        let samples = vec![Sample { pid: 20, ms: 1.23456 }, Sample { pid: 30, ms: 4.0 }];
        rep.tick(&mut table, samples, 2.0, wall()).unwrap();
        // descriptors are only written once
        rep.tick(&mut table, vec![Sample { pid: 20, ms: 2.0 }], 3.0, wall())
            .unwrap();
        rep.end(3.4).unwrap();

        assert_eq!(
            lines(rep.into_inner()),
            vec![
                json!({"interval": 1000}),
                json!({"start": 1_700_000_000}),
                json!({"ts": 2.0}),
                json!({"cgr": 7, "v": "unknown"}),
                json!({"pid": 10, "ppid": 1, "t": 1.0, "cg": 7, "v": ["/bin/sh", "-c", "make"]}),
                json!({"pid": 20, "ppid": 10, "t": 1.0, "cg": 7, "v": ["/usr/bin/make"]}),
                json!({"cpu": 20, "v": 1.235}),
                json!({"ts": 3.0}),
                json!({"cpu": 20, "v": 2.0}),
                json!({"end": 3}),
            ]
        );
        assert!(table.is_described(10));
        assert!(!table.is_described(30), "too young to be reported");
    }

    #[test]
    fn test_written_counts_bytes() {
        let mut rep = reporter(true);
        rep.end(0.0).unwrap();
        assert_eq!(rep.written(), "{\"end\":0}\n".len() as u64);
    }

    #[test]
    fn test_round() {
        assert_eq!(round(1.23456, 3), 1.235);
        assert_eq!(round(2.0, 2), 2.0);
    }
}
