//! Scheduler benchmarks. Boots a kernel and measures turnaround of mixed workloads.
//!
//! usage: testsched [rr|lottery|mlfq] [ncpu]

use std::env;
use std::process;
use std::sync::mpsc;

use kernel::param::NCPU;
use kernel::policy::SchedPolicy;
use kernel::proc::Pid;
use kernel::pstat::PStat;
use kernel::syscall::Syscalls;
use kernel::{Config, Kernel, println};

/// Start and end tick of every measured process.
#[derive(Default)]
struct PTime {
    records: Vec<(Pid, usize, Option<usize>)>,
}

impl PTime {
    fn start(&mut self, pid: Pid, ticks: usize) {
        self.records.push((pid, ticks, None));
    }

    fn end(&mut self, pid: Pid, ticks: usize) {
        match self.records.iter_mut().find(|(p, _, _)| *p == pid) {
            Some((_, _, end)) => *end = Some(ticks),
            None => println!("ptime: no record of pid {}", pid),
        }
    }

    fn print(&self) {
        println!("process summary");

        let mut total = 0;
        for &(pid, start, end) in &self.records {
            let end = end.unwrap_or(start);
            let turnaround = end - start;
            total += turnaround;
            println!(
                "pid = {}, start = {}, end = {}, turnaround = {}",
                pid, start, end, turnaround
            );
        }

        if !self.records.is_empty() {
            println!(
                "average turnaround time = {}",
                total / self.records.len()
            );
        }
    }
}

fn print_proc_info(pstat: &PStat) {
    println!("pid\tprio\ttickets\tstate\tready\trun\tsleep");
    for slot in 0..pstat.inuse.len() {
        if pstat.inuse[slot] == 0 {
            continue;
        }
        let [ready, run, sleep] = pstat.ticks[slot];
        println!(
            "{}\t{}\t{}\t{}\t{}\t{}\t{}",
            pstat.pid[slot],
            pstat.priority[slot],
            pstat.tickets[slot],
            pstat.state[slot],
            ready,
            run,
            sleep
        );
    }
}

fn create_loop_proc(sys: &Syscalls, units: usize) -> Option<Pid> {
    match sys.fork(move |sys| sys.compute(units)) {
        Ok(pid) => Some(pid),
        Err(e) => {
            println!("testsched: create_loop_proc failed: {}", e);
            None
        }
    }
}

fn create_sleep_proc(sys: &Syscalls, period: usize, n: usize) -> Option<Pid> {
    let child = move |sys: &Syscalls| {
        for _ in 0..n {
            let _ = sys.sleep(period);
        }
    };

    match sys.fork(child) {
        Ok(pid) => Some(pid),
        Err(e) => {
            println!("testsched: create_sleep_proc failed: {}", e);
            None
        }
    }
}

/// Reaps `n` children, recording when each one ended.
fn reap(sys: &Syscalls, ptime: &mut PTime, n: usize) {
    for _ in 0..n {
        match sys.wait() {
            Ok(pid) => ptime.end(pid, sys.uptime()),
            Err(_) => {
                println!("wait stopped early");
                break;
            }
        }
    }
    println!("all children terminated");
    print_proc_info(&sys.pinfo());
    ptime.print();
}

/// Concurrent processes with the same work.
fn benchmark1(sys: &Syscalls, nprocs: usize, units: usize) {
    println!("{}", "-".repeat(72));
    println!(
        "Concurrent Proc Test: num processes = {}, num loops = {}",
        nprocs, units
    );

    let mut ptime = PTime::default();
    for _ in 0..nprocs {
        if let Some(pid) = create_loop_proc(sys, units) {
            ptime.start(pid, sys.uptime());
        }
    }

    let n = ptime.records.len();
    reap(sys, &mut ptime, n);
}

/// Short processes arrive while long ones are running.
fn benchmark2(sys: &Syscalls, longs: usize, long_units: usize, shorts: usize, short_units: usize) {
    println!("{}", "-".repeat(72));
    println!(
        "Long/Short Proc Test: num processes = {} longs, {} shorts, num loops = {} for long, {} for short",
        longs, shorts, long_units, short_units
    );

    let mut ptime = PTime::default();
    for _ in 0..longs {
        if let Some(pid) = create_loop_proc(sys, long_units) {
            ptime.start(pid, sys.uptime());
        }
    }

    let _ = sys.sleep(20);

    for _ in 0..shorts {
        if let Some(pid) = create_loop_proc(sys, short_units) {
            ptime.start(pid, sys.uptime());
        }
    }

    let n = ptime.records.len();
    reap(sys, &mut ptime, n);
}

/// CPU bound processes next to periodic sleepers.
fn benchmark3(sys: &Syscalls, nprocs: usize, units: usize, period: usize, repeat: usize) {
    println!("{}", "-".repeat(72));
    println!(
        "Sleep Mix Test: num processes = {}, num repeats = {}",
        nprocs, repeat
    );

    let mut ptime = PTime::default();
    for _ in 0..nprocs {
        if let Some(pid) = create_loop_proc(sys, units) {
            ptime.start(pid, sys.uptime());
        }
        if let Some(pid) = create_sleep_proc(sys, period, repeat) {
            ptime.start(pid, sys.uptime());
        }
    }

    let n = ptime.records.len();
    reap(sys, &mut ptime, n);
}

/// Averages ready, running and sleeping time of cpu bound, yielding and sleeping jobs.
fn test1(sys: &Syscalls) {
    const KINDS: [&str; 3] = ["Large Job", "Short Job", "Simulated I/O"];
    let n = 6;

    let mut kinds = Vec::new();
    for i in 0..n {
        let kind = i % 3;
        let child = move |sys: &Syscalls| match kind {
            0 => sys.compute(2_000),
            1 => {
                for _ in 0..100 {
                    sys.compute(10);
                    sys.r#yield();
                }
            }
            _ => {
                for _ in 0..100 {
                    let _ = sys.sleep(1);
                }
            }
        };

        match sys.fork(child) {
            Ok(pid) => kinds.push((pid, kind)),
            Err(e) => println!("testsched: fork failed: {}", e),
        }
    }

    let mut sums = [[0usize; 3]; 3];
    let mut counts = [0usize; 3];
    for _ in 0..kinds.len() {
        let Ok((pid, times)) = sys.wait_times() else {
            break;
        };
        let Some(&(_, kind)) = kinds.iter().find(|(p, _)| *p == pid) else {
            continue;
        };

        println!(
            "{}, pid: {}, ready: {}, running: {}, sleeping: {}, turnaround: {}",
            KINDS[kind],
            pid,
            times.retime,
            times.rutime,
            times.stime,
            times.retime + times.rutime + times.stime
        );
        sums[kind][0] += times.retime;
        sums[kind][1] += times.rutime;
        sums[kind][2] += times.stime;
        counts[kind] += 1;
    }

    for kind in 0..3 {
        let count = counts[kind].max(1);
        let [ready, running, sleeping] = sums[kind].map(|sum| sum / count);
        println!();
        println!("{}s:", KINDS[kind]);
        println!("Average ready time: {}", ready);
        println!("Average running time: {}", running);
        println!("Average sleeping time: {}", sleeping);
        println!("Average turnaround time: {}", ready + running + sleeping);
    }
}

fn usage() -> ! {
    eprintln!("usage: testsched [rr|lottery|mlfq] [ncpu]");
    process::exit(1)
}

fn main() {
    let mut args = env::args().skip(1);

    let policy = match args.next() {
        Some(name) => name.parse::<SchedPolicy>().unwrap_or_else(|_| usage()),
        None => SchedPolicy::default(),
    };
    let ncpu = match args.next() {
        Some(n) => match n.parse::<usize>() {
            Ok(n) if (1..=NCPU).contains(&n) => n,
            _ => usage(),
        },
        None => 1,
    };

    let config = Config {
        ncpu,
        policy,
        ..Config::default()
    };

    let (done, finished) = mpsc::channel();
    let kernel = Kernel::boot(config, move |sys| {
        benchmark1(sys, 5, 2_000);
        benchmark1(sys, 20, 500);
        benchmark2(sys, 5, 2_000, 5, 50);
        benchmark3(sys, 3, 1_000, 2, 10);
        test1(sys);
        let _ = done.send(());

        loop {
            let _ = sys.sleep(100);
        }
    });

    if finished.recv().is_err() {
        eprintln!("testsched: init died");
        process::exit(1);
    }
    kernel.halt();
}
