use alloc::boxed::Box;
use core::cell::UnsafeCell;
use core::mem;

use crate::Kernel;
use crate::arch::{self, Context, interrupts, registers::tp, swtch, swtch_exit};
use crate::proc::{Channel, ProcState, TableInner};
use crate::spinlock::{SpinLock, SpinLockGuard};
use crate::vm::Kvm;

/// Per-CPU state
pub struct Cpu {
    pub id: usize,
    /// Slot of the process running on this cpu, or None.
    pub proc: Option<usize>,
    /// swtch() here to enter scheduler()
    pub context: Context,
    /// Depth of `lock_current_cpu` nesting.
    pub num_off: isize,
    /// Were interrupts enabled before the outermost `lock_current_cpu`?
    pub interrupts_enabled: bool,
    /// Next timer interrupt, in host microseconds.
    pub mtimecmp: u64,
}

impl Cpu {
    pub fn new(id: usize) -> Self {
        Self {
            id,
            proc: None,
            context: Context::new(),
            num_off: 0,
            interrupts_enabled: false,
            mtimecmp: u64::MAX,
        }
    }

    /// Locks this CPU by disabling interrupts.
    fn lock(&mut self, old_state: bool) -> InterruptLock {
        if self.num_off == 0 {
            self.interrupts_enabled = old_state;
        }
        self.num_off += 1;
        InterruptLock
    }

    /// Unlocks this CPU by enabling interrupts if appropriate.
    pub fn unlock(&mut self) {
        assert!(!interrupts::get(), "cpu unlock - interruptible");
        assert!(self.num_off >= 1, "cpu unlock");

        self.num_off -= 1;
        if self.num_off == 0 && self.interrupts_enabled {
            interrupts::enable();
        }
    }
}

/// Table of CPUs
pub struct CpuTable(Box<[UnsafeCell<Cpu>]>);

impl CpuTable {
    pub fn new(ncpu: usize) -> Self {
        Self((0..ncpu).map(|id| UnsafeCell::new(Cpu::new(id))).collect())
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Makes the calling thread hart `id`.
    ///
    /// # Safety
    /// The table must outlive the thread and no other thread may be bound to the same hart.
    pub unsafe fn bind(&self, id: usize) {
        unsafe { tp::write(self.0[id].get() as usize) }
    }
}

unsafe impl Sync for CpuTable {}

/// A lock that releases the CPU lock when dropped.
#[derive(Debug)]
pub struct InterruptLock;

impl Drop for InterruptLock {
    fn drop(&mut self) {
        // # Safety: we are still holding the CPU lock
        unsafe { current_cpu().unlock() }
    }
}

/// Returns a mutable pointer to the current CPU's [`Cpu`] struct.
///
/// # Safety
/// Must be called with interrupts disabled to prevent race with process being moved to a
/// different CPU.
pub unsafe fn current_cpu() -> &'static mut Cpu {
    assert!(!interrupts::get(), "mycpu interrupts enabled");
    let cpu = tp::read();
    assert_ne!(cpu, 0, "mycpu no hart");
    unsafe { &mut *(cpu as *mut Cpu) }
}

/// Locks this CPU by disabling interrupts.
/// Returns an [`InterruptLock`] as the ownership and lifetime of the lock.
pub fn lock_current_cpu() -> InterruptLock {
    let old_state = interrupts::get();
    interrupts::disable();

    unsafe { current_cpu().lock(old_state) }
}

/// Returns the id of the hart this thread runs on, if any.
pub fn current_hart_id() -> Option<usize> {
    let cpu = tp::read() as *const Cpu;
    // id never changes after boot
    (!cpu.is_null()).then(|| unsafe { (*cpu).id })
}

impl Kernel {
    /// Per-CPU process scheduler.
    /// Each CPU calls `scheduler` after setting itself up.
    /// Scheduler never returns. It loops, doing:
    ///     - choose a process to run.
    ///     - swtch to start running that process.
    ///     - eventually that process transfers control via swtch back to the scheduler.
    ///
    /// # Safety
    /// Must be called with interrupts disabled, on a bound hart.
    pub(crate) unsafe fn scheduler(&'static self) -> ! {
        // cpu does not change throughout the lifetime of the scheduler
        let cpu: *mut Cpu = unsafe { current_cpu() };
        let hart = unsafe { (*cpu).id };

        unsafe { (*cpu).proc = None };

        loop {
            if self.is_halted() {
                arch::halt();
            }

            // The most recent process to run may have had interrupts turned off; enable them to
            // avoid a deadlock if all processes are waiting, and take a pending timer interrupt.
            interrupts::enable();
            self.kerneltrap();
            interrupts::disable();

            let mut table = self.procs.table.lock();
            let picked = table.pick(hart);

            if let Some(slot) = picked {
                // Switch to chosen process. It is the process's job to release the table lock and
                // then reacquire it before jumping back to us.
                let data = self.procs.data(slot);
                data.pagetable().activate();
                table.procs[slot].state = ProcState::Running;

                unsafe {
                    (*cpu).proc = Some(slot);
                    swtch(&(*cpu).context, &data.context);
                }

                // Process is done running for now.
                // It should have changed its state before coming back.
                Kvm::activate();
                unsafe { (*cpu).proc = None };
            }

            drop(table);

            if picked.is_none() {
                // nothing to run; stop running on this core until an interrupt.
                arch::wait_for_interrupt();
            }
        }
    }

    /// Switch to scheduler.
    ///
    /// Must hold only the table lock and have changed the state of `slot`.
    ///
    /// Saves and restores `interrupts_enabled` because `interrupts_enabled` is a property of this
    /// kernel thread, not this CPU.
    pub(crate) fn sched<'a>(
        &self,
        table: SpinLockGuard<'a, TableInner>,
        slot: usize,
    ) -> SpinLockGuard<'a, TableInner> {
        let cpu = self.check_sched(&table, slot);

        let interrupts_enabled = cpu.interrupts_enabled;
        unsafe { swtch(&self.procs.data(slot).context, &cpu.context) };

        // get current cpu again since the process may have been moved to a different cpu.
        let cpu = unsafe { current_cpu() };
        cpu.interrupts_enabled = interrupts_enabled;

        table
    }

    /// Last switch of an exiting process. The scheduler releases the table lock once it has the
    /// hart back.
    pub(crate) fn sched_exit(&self, table: SpinLockGuard<'_, TableInner>, slot: usize) -> ! {
        let cpu = self.check_sched(&table, slot);
        assert_eq!(table.procs[slot].state, ProcState::Zombie, "zombie exit");

        mem::forget(table);
        unsafe { swtch_exit(&cpu.context) }
    }

    fn check_sched(&self, table: &TableInner, slot: usize) -> &'static mut Cpu {
        // make sure that interrupts are disabled in the hardware.
        // this is to verify the software check done with num_off.
        assert!(!interrupts::get(), "sched interruptable");

        let cpu = unsafe { current_cpu() };

        // make sure the table lock is held by this cpu and there are no other locks.
        assert!(
            unsafe { self.procs.table.holding() },
            "sched table lock not held"
        );
        assert_eq!(cpu.num_off, 1, "sched locks");
        // make sure the process is not running before switch.
        assert_ne!(table.procs[slot].state, ProcState::Running, "sched running");

        cpu
    }

    /// Gives up the CPU for one scheduling round.
    pub fn r#yield(&self) {
        let slot = self.current_slot();

        // table lock will be held until after the call to the sched.
        let mut table = self.procs.table.lock();
        table.preempt(slot);

        let _table = self.sched(table, slot);
    }

    /// Entry point for a new process, run on its kernel thread the first time it is scheduled.
    pub(crate) fn fork_ret(&'static self) -> ! {
        // Still holding the table lock from scheduler.
        unsafe { self.procs.table.force_unlock() };

        // return to user space, mimicking `usertrap()`'s return
        self.usertrapret()
    }

    /// Atomically releases a condition's lock and sleeps on channel.
    /// Reacquires the condition's lock when awakened.
    ///
    /// Use [`Kernel::sleep_table`] when the condition is guarded by the table lock itself.
    pub fn sleep<'a, T>(
        &self,
        channel: Channel,
        condition_lock: SpinLockGuard<'a, T>,
    ) -> SpinLockGuard<'a, T> {
        // To make sure the condition is not resolved before we sleep, we acquire the table lock
        // before unlocking the condition's lock. `wakeup()` must also acquire the table lock to
        // resolve the condition, which it cannot do before we release it.
        let condition_mutex;
        {
            let mut table = self.procs.table.lock();

            condition_mutex = SpinLock::unlock(condition_lock);

            table = self.sleep_table(channel, table);
            drop(table);
        }

        // reacquire original lock.
        condition_mutex.lock()
    }

    /// [`Kernel::sleep`] for a caller already holding the table lock.
    pub fn sleep_table<'a>(
        &self,
        channel: Channel,
        mut table: SpinLockGuard<'a, TableInner>,
    ) -> SpinLockGuard<'a, TableInner> {
        let slot = self.current_slot();

        // go to sleep.
        table.procs[slot].channel = Some(channel);
        table.procs[slot].state = ProcState::Sleeping;

        // this is where we switch to scheduler (to another proc).
        table = self.sched(table, slot);
        // this is where we switch back to the original proc.

        table.procs[slot].channel = None;
        table
    }

    /// Wakes up all processes sleeping on channel.
    /// Must be called without holding the table lock.
    pub fn wakeup(&self, channel: Channel) {
        self.procs.table.lock().wakeup(channel);
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::Config;
    use crate::testing::{Machine, TIMEOUT};
    use core::mem::ManuallyDrop;
    use core::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn interrupt_lock_nesting() {
        testing::bind_hart();
        interrupts::enable();

        let a = lock_current_cpu();
        let b = lock_current_cpu();
        assert_eq!(unsafe { current_cpu() }.num_off, 2);
        drop(b);
        assert!(!interrupts::get());
        drop(a);
        assert!(interrupts::get());
        interrupts::disable();
    }

    fn idle_kernel() -> Kernel {
        testing::bind_hart();
        Kernel::new(Config {
            ncpu: 1,
            verbose: false,
            ..Config::default()
        })
    }

    #[test]
    #[should_panic(expected = "sched table lock not held")]
    fn sched_without_table_lock() {
        let kernel = idle_kernel();
        let table = unsafe { kernel.procs.table.get_mut_unchecked() };
        kernel.check_sched(table, 0);
    }

    #[test]
    #[should_panic(expected = "sched locks")]
    fn sched_holding_another_lock() {
        let kernel = idle_kernel();
        let other = SpinLock::new((), "other");

        let _other = other.lock();
        let table = kernel.procs.table.lock();
        kernel.sched(table, 0);
    }

    #[test]
    #[should_panic(expected = "sched running")]
    fn sched_while_running() {
        let kernel = idle_kernel();

        let mut table = kernel.procs.table.lock();
        table.procs[0].state = ProcState::Running;
        kernel.sched(table, 0);
    }

    #[test]
    #[should_panic(expected = "sched interruptable")]
    fn sched_with_interrupts_on() {
        let kernel = idle_kernel();

        // never released, the panic leaves interrupts on
        let table = ManuallyDrop::new(kernel.procs.table.lock());
        interrupts::enable();
        kernel.check_sched(&table, 0);
    }

    #[test]
    #[should_panic(expected = "cpu unlock")]
    fn unbalanced_unlock() {
        testing::bind_hart();
        let _l = lock_current_cpu();
        unsafe { current_cpu() }.num_off = 0;
    }

    #[test]
    fn one_wakeup_wakes_every_sleeper() {
        struct Shared {
            done: SpinLock<bool>,
            asleep: AtomicUsize,
            woken: AtomicUsize,
        }

        let shared = Arc::new(Shared {
            done: SpinLock::new(false, "done"),
            asleep: AtomicUsize::new(0),
            woken: AtomicUsize::new(0),
        });

        let config = Config {
            ncpu: 1,
            verbose: false,
            ..Config::default()
        };

        let (machine, rx) = Machine::boot(config, move |sys, tx| {
            let kernel = sys.kernel();
            let channel = Channel::of(&shared.done);

            for _ in 0..2 {
                let shared = Arc::clone(&shared);
                sys.fork(move |sys| {
                    let kernel = sys.kernel();
                    let mut done = shared.done.lock();
                    while !*done {
                        shared.asleep.fetch_add(1, Ordering::SeqCst);
                        done = kernel.sleep(channel, done);
                        shared.woken.fetch_add(1, Ordering::SeqCst);
                    }
                })
                .unwrap();
            }

            while shared.asleep.load(Ordering::SeqCst) < 2 {
                sys.r#yield();
            }

            // holding the condition lock, both sleepers are past the check
            let done = shared.done.lock();
            kernel.wakeup(channel);
            drop(done);

            while shared.woken.load(Ordering::SeqCst) < 2 {
                sys.r#yield();
            }
            tx.send(shared.woken.load(Ordering::SeqCst)).unwrap();

            *shared.done.lock() = true;
            kernel.wakeup(channel);
            sys.wait().unwrap();
            sys.wait().unwrap();
            tx.send(shared.woken.load(Ordering::SeqCst)).unwrap();
        });

        assert_eq!(rx.recv_timeout(TIMEOUT).unwrap(), 2);
        assert_eq!(rx.recv_timeout(TIMEOUT).unwrap(), 4);
        drop(machine);
    }
}
