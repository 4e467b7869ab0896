use crate::Kernel;
use crate::arch::{interrupts, timer};
use crate::proc::Channel;
use crate::sched::{current_cpu, lock_current_cpu};
use crate::syscall::Syscalls;

impl Kernel {
    /// Arms this hart's timer.
    pub(crate) fn timerinit(&self) {
        let _lock = lock_current_cpu();
        let cpu = unsafe { current_cpu() };
        cpu.mtimecmp = timer::now() + self.config.tick_interval;
    }

    /// Number of timer ticks since boot.
    pub fn uptime(&self) -> usize {
        *self.ticks.lock()
    }

    /// Interrupts from kernel code go here. The scheduler polls it while it has interrupts on.
    pub(crate) fn kerneltrap(&self) {
        if !interrupts::get() {
            return;
        }

        interrupts::disable();
        self.devintr();
        interrupts::enable();
    }

    /// An interrupt taken while in user mode. Gives up the cpu on a timer tick, and exits if
    /// killed meanwhile.
    pub(crate) fn usertrap_intr(&self) {
        interrupts::disable();
        let timer = self.devintr();
        interrupts::enable();

        if timer {
            self.r#yield();
        }

        self.exit_if_killed();
    }

    /// Kill is cooperative: a process notices at its next kernel entry or exit.
    pub(crate) fn exit_if_killed(&self) {
        if self.current_killed() {
            self.exit();
        }
    }

    /// Checks whether this hart's timer went off, and handles it.
    /// Returns true if it was a timer interrupt.
    fn devintr(&self) -> bool {
        let hart = {
            let _lock = lock_current_cpu();
            let cpu = unsafe { current_cpu() };

            let now = timer::now();
            if now < cpu.mtimecmp {
                return false;
            }

            // ask for the next timer interrupt
            cpu.mtimecmp = now + self.config.tick_interval;
            cpu.id
        };

        if hart == 0 {
            self.clockintr();
        }

        true
    }

    fn clockintr(&self) {
        let mut ticks = self.ticks.lock();
        *ticks += 1;

        // charge the tick before waking the ones sleeping on it
        let mut table = self.procs.table.lock();
        table.account_tick();

        if self.config.boost_interval.is_some_and(|n| *ticks % n == 0) {
            table.boost();
        }

        table.wakeup(Channel::Ticks);
    }

    /// Returns to user space. On the hosted machine that means running the process's program,
    /// whose end is an implicit `exit`.
    pub(crate) fn usertrapret(&'static self) -> ! {
        let (_slot, data) = self.current_data_mut();

        let program = data
            .trapframe
            .epc
            .clone()
            .expect("usertrapret: no user program");
        let sys = Syscalls::new(self, data.trapframe.a0);

        // user mode runs with interrupts on
        interrupts::enable();
        program(&sys);

        self.exit()
    }
}

#[cfg(test)]
mod tests {
    use crate::Config;
    use crate::param::PRIORITY_MAX;
    use crate::policy::SchedPolicy;
    use crate::testing::{Machine, TIMEOUT};

    fn config(policy: SchedPolicy) -> Config {
        Config {
            ncpu: 1,
            policy,
            boost_interval: None,
            verbose: false,
            ..Config::default()
        }
    }

    #[test]
    fn ticks_advance_while_sleeping() {
        let (machine, rx) = Machine::boot(config(SchedPolicy::RoundRobin), |sys, tx| {
            let start = sys.uptime();
            sys.sleep(5).unwrap();
            tx.send(sys.uptime() - start).unwrap();
        });

        assert!(rx.recv_timeout(TIMEOUT).unwrap() >= 5);
        drop(machine);
    }

    #[test]
    fn yielding_sinks_to_lowest_level() {
        let (machine, rx) = Machine::boot(config(SchedPolicy::Mlfq), |sys, tx| {
            let child_tx = tx.clone();
            sys.fork(move |sys| {
                let mut levels = vec![sys.getpri()];
                for _ in 0..5 {
                    sys.r#yield();
                    levels.push(sys.getpri());
                }
                child_tx.send(levels).unwrap();
            })
            .unwrap();
            sys.wait().unwrap();
        });

        assert_eq!(
            rx.recv_timeout(TIMEOUT).unwrap(),
            vec![0, 1, 2, PRIORITY_MAX, PRIORITY_MAX, PRIORITY_MAX]
        );
        drop(machine);
    }

    #[test]
    fn preempted_compute_loses_priority() {
        let (machine, rx) = Machine::boot(config(SchedPolicy::Mlfq), |sys, tx| {
            let start = sys.uptime();
            // long enough to take a few timer ticks
            while sys.uptime() - start < 3 {
                sys.compute(10);
            }
            tx.send(sys.getpri()).unwrap();
        });

        assert_eq!(rx.recv_timeout(TIMEOUT).unwrap(), PRIORITY_MAX);
        drop(machine);
    }

    #[test]
    fn sleeping_is_charged_as_sleep() {
        let (machine, rx) = Machine::boot(config(SchedPolicy::RoundRobin), |sys, tx| {
            sys.fork(|sys| {
                for _ in 0..20 {
                    sys.sleep(1).unwrap();
                }
            })
            .unwrap();
            let (_, times) = sys.wait_times().unwrap();
            tx.send(times).unwrap();
        });

        // every sleep(1) spans at least the tick that ends it
        let times = rx.recv_timeout(TIMEOUT).unwrap();
        assert!(times.stime >= 20, "{times:?}");
        drop(machine);
    }

    #[test]
    fn every_tick_is_charged_once() {
        let (machine, rx) = Machine::boot(config(SchedPolicy::RoundRobin), |sys, tx| {
            sys.fork(|sys| {
                sys.sleep(5).unwrap();
                sys.compute(100);
            })
            .unwrap();
            let before = sys.uptime();
            let (_, times) = sys.wait_times().unwrap();
            let lived = sys.uptime() - before;
            tx.send((times, lived)).unwrap();
        });

        let (times, lived) = rx.recv_timeout(TIMEOUT).unwrap();
        let charged = times.retime + times.rutime + times.stime;
        assert!(charged >= 4, "{times:?}");
        assert!(charged <= lived + 1, "{times:?} {lived}");
        drop(machine);
    }
}
