#![cfg_attr(not(test), no_std)]

use core::sync::atomic::{AtomicBool, Ordering};

use alloc::boxed::Box;
use alloc::sync::Arc;

extern crate alloc;

#[macro_use]
pub mod printf;
#[macro_use]
pub mod error;
pub mod arch;
pub mod file;
pub mod fs;
pub mod kalloc;
pub mod param;
pub mod policy;
pub mod proc;
pub mod pstat;
pub mod rand;
pub mod sched;
pub mod spinlock;
pub mod sync;
pub mod syscall;
pub mod sysfile;
pub mod sysproc;
pub mod trap;
pub mod vm;

#[cfg(test)]
mod testing;

use crate::file::FileTable;
use crate::fs::Icache;
use crate::kalloc::Kmem;
use crate::param::{BOOST_TICKS, NCPU, NPAGES, NPROC, PHYSBASE, TICK_INTERVAL};
use crate::policy::SchedPolicy;
use crate::proc::{ProcTable, Program};
use crate::sched::{CpuTable, current_hart_id};
use crate::spinlock::SpinLock;
use crate::sync::OnceLock;
use crate::syscall::Syscalls;
use crate::vm::PA;

/// Machine and kernel parameters, fixed at boot.
#[derive(Debug, Clone)]
pub struct Config {
    /// Number of harts
    pub ncpu: usize,
    /// Number of process slots
    pub nproc: usize,
    /// Physical pages under the allocator
    pub npages: usize,
    pub policy: SchedPolicy,
    /// Timer interrupt interval, in microseconds
    pub tick_interval: u64,
    /// Ticks between feedback queue boosts, or None to never boost
    pub boost_interval: Option<usize>,
    /// Lottery seed
    pub seed: u64,
    /// Print the boot log
    pub verbose: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            ncpu: 2,
            nproc: NPROC,
            npages: NPAGES,
            policy: SchedPolicy::default(),
            tick_interval: TICK_INTERVAL,
            boost_interval: Some(BOOST_TICKS),
            seed: 0x5eed,
            verbose: true,
        }
    }
}

/// A running kernel: the harts and every table they share.
pub struct Kernel {
    config: Config,
    pub(crate) cpus: CpuTable,
    pub(crate) kmem: Kmem,
    pub(crate) procs: ProcTable,
    /// Timer ticks since boot
    pub(crate) ticks: SpinLock<usize>,
    pub(crate) files: FileTable,
    pub(crate) icache: Icache,
    /// Slot of the first process, which inherits orphans
    pub(crate) init_proc: OnceLock<usize>,
    started: AtomicBool,
    halted: AtomicBool,
}

impl Kernel {
    /// Sets up the tables of a machine that has not been powered on yet.
    pub(crate) fn new(config: Config) -> Kernel {
        assert!((1..=NCPU).contains(&config.ncpu), "boot: ncpu");
        assert!((1..=NPROC).contains(&config.nproc), "boot: nproc");

        let kmem = Kmem::new(
            PA::from(PHYSBASE),
            PA::from(PHYSBASE + config.npages * arch::PGSIZE),
        );
        let policy = config.policy.build(config.ncpu, config.seed);

        Kernel {
            cpus: CpuTable::new(config.ncpu),
            kmem,
            procs: ProcTable::new(config.nproc, policy),
            ticks: SpinLock::new(0, "time"),
            files: FileTable::new(),
            icache: Icache::new(),
            init_proc: OnceLock::new(),
            started: AtomicBool::new(false),
            halted: AtomicBool::new(false),
            config,
        }
    }

    /// Powers on a machine and runs `init` as the first process.
    ///
    /// The kernel is never freed; [`Kernel::halt`] stops its harts.
    pub fn boot<F>(config: Config, init: F) -> &'static Kernel
    where
        F: Fn(&Syscalls) + Send + Sync + 'static,
    {
        let kernel: &'static Kernel = Box::leak(Box::new(Kernel::new(config)));

        let init: Program = Arc::new(init);
        for id in 0..kernel.config.ncpu {
            let init = (id == 0).then(|| Arc::clone(&init));
            arch::start_hart(id, move || unsafe {
                kernel.cpus.bind(id);
                kernel.main(init)
            });
        }

        kernel
    }

    /// Boot sequence of every hart. Hart 0 sets up the shared state and creates the first
    /// process; the others wait for it.
    unsafe fn main(&'static self, init: Option<Program>) -> ! {
        let id = current_hart_id().expect("main: unbound hart");

        if let Some(init) = init {
            if self.config.verbose {
                println!("");
                println!("octopos kernel is booting");
                println!("");
                let (base, end) = self.kmem.range();
                println!(
                    "kmem: {} pages at {:#x}..{:#x}",
                    self.kmem.npages(),
                    base.as_usize(),
                    end.as_usize()
                );
                println!("scheduler: {}", self.procs.table.lock().policy.name());
            }

            self.kmem.enable_locking();
            self.userinit(init);

            if self.config.verbose {
                println!("hart {} is starting", id);
            }
            self.started.store(true, Ordering::SeqCst);
        } else {
            while !self.started.load(Ordering::SeqCst) {
                if self.is_halted() {
                    arch::halt();
                }
                arch::wait_for_interrupt();
            }

            if self.config.verbose {
                println!("hart {} is starting", id);
            }
        }

        self.timerinit();
        unsafe { self.scheduler() }
    }

    /// Stops every hart at its next pass through the scheduler. Processes are left where they are.
    pub fn halt(&self) {
        self.halted.store(true, Ordering::SeqCst);
    }

    pub fn is_halted(&self) -> bool {
        self.halted.load(Ordering::SeqCst)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }
}
