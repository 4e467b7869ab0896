//! Hosted machine.
//!
//! The kernel core only needs a handful of things from the hardware: the per-hart thread pointer,
//! the address space register, the interrupt-enable bit, a timer, a console and a way to switch
//! between kernel threads. On the host every kernel thread (each hart's scheduler and each
//! process) is an OS thread. `swtch` hands the hart's registers to the thread being resumed and
//! parks the caller until someone switches back to it.

extern crate std;

use alloc::boxed::Box;
use alloc::string::String;
use alloc::sync::Arc;
use core::cell::Cell;

use std::io::{self, Write};
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Condvar, Mutex, OnceLock, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

/// number of bits to offset within a page
pub const PGSHIFT: usize = 12;
/// number of bytes per page
pub const PGSIZE: usize = 1 << PGSHIFT;

pub const fn pg_round_up(size: usize) -> usize {
    (size + PGSIZE - 1) & !(PGSIZE - 1)
}

pub const fn pg_round_down(addr: usize) -> usize {
    addr & !(PGSIZE - 1)
}

/// Registers that belong to a hart rather than to the thread running on it.
#[derive(Debug, Clone, Copy, Default)]
struct HartRegs {
    tp: usize,
    satp: usize,
}

std::thread_local! {
    static REGS: Cell<HartRegs> = const { Cell::new(HartRegs { tp: 0, satp: 0 }) };
    static SIE: Cell<bool> = const { Cell::new(false) };
}

pub mod registers {
    /// Thread pointer, holds the address of this hart's `Cpu`.
    pub mod tp {
        use super::super::REGS;

        #[inline]
        pub fn read() -> usize {
            REGS.with(|r| r.get().tp)
        }

        /// # Safety
        /// `value` must be zero or point to a `Cpu` that outlives every use of this hart.
        #[inline]
        pub unsafe fn write(value: usize) {
            REGS.with(|r| {
                let mut regs = r.get();
                regs.tp = value;
                r.set(regs);
            })
        }
    }

    /// Address translation register, holds the token of the installed address space.
    /// Zero means the kernel address space.
    pub mod satp {
        use super::super::REGS;

        #[inline]
        pub fn read() -> usize {
            REGS.with(|r| r.get().satp)
        }

        #[inline]
        pub fn write(value: usize) {
            REGS.with(|r| {
                let mut regs = r.get();
                regs.satp = value;
                r.set(regs);
            })
        }
    }
}

pub mod interrupts {
    use super::SIE;

    #[inline]
    pub fn enable() {
        SIE.with(|s| s.set(true));
    }

    #[inline]
    pub fn disable() {
        SIE.with(|s| s.set(false));
    }

    #[inline]
    pub fn get() -> bool {
        SIE.with(|s| s.get())
    }
}

pub mod timer {
    use super::{Instant, OnceLock};

    /// Microseconds since the machine was powered on.
    pub fn now() -> u64 {
        static POWER_ON: OnceLock<Instant> = OnceLock::new();
        POWER_ON.get_or_init(Instant::now).elapsed().as_micros() as u64
    }
}

pub mod uart {
    use super::{Write, io};

    pub fn puts(s: &str) {
        let _ = io::stderr().write_all(s.as_bytes());
    }
}

/// Idles the hart until something may have changed.
pub fn wait_for_interrupt() {
    thread::sleep(Duration::from_micros(100));
}

/// Panic payload used to retire a kernel thread that will never be resumed.
struct Retired;

/// Powers off the current hart.
pub fn halt() -> ! {
    REGS.with(|r| r.set(HartRegs::default()));
    panic::resume_unwind(Box::new(Retired))
}

enum Handoff {
    Run(HartRegs),
    Retire,
}

/// Rendezvous point of one kernel thread: whoever resumes the thread leaves the hart here.
struct Baton {
    slot: Mutex<Option<Handoff>>,
    ready: Condvar,
}

impl Baton {
    fn new() -> Self {
        Self {
            slot: Mutex::new(None),
            ready: Condvar::new(),
        }
    }

    fn pass(&self, handoff: Handoff) {
        let mut slot = self.slot.lock().unwrap_or_else(PoisonError::into_inner);
        assert!(slot.is_none(), "swtch: context already resumed");
        *slot = Some(handoff);
        self.ready.notify_one();
    }

    /// Blocks until the thread is resumed. Returns `None` if it was retired instead.
    fn take(&self) -> Option<HartRegs> {
        let mut slot = self.slot.lock().unwrap_or_else(PoisonError::into_inner);
        loop {
            match slot.take() {
                Some(Handoff::Run(regs)) => return Some(regs),
                Some(Handoff::Retire) => return None,
                None => slot = self.ready.wait(slot).unwrap_or_else(PoisonError::into_inner),
            }
        }
    }
}

/// Saved kernel thread. `swtch` here to run it.
pub struct Context {
    baton: Arc<Baton>,
}

impl Context {
    /// A context for the thread that saves into it, e.g. a hart's scheduler.
    pub fn new() -> Self {
        Self {
            baton: Arc::new(Baton::new()),
        }
    }

    /// A context that runs `entry` on a fresh kernel thread the first time it is switched to.
    ///
    /// Dropping the context before that retires the thread without running `entry`.
    pub fn with_entry<F>(name: String, entry: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        let baton = Arc::new(Baton::new());
        let resume = Arc::clone(&baton);

        thread::Builder::new()
            .name(name)
            .spawn(move || {
                let Some(regs) = resume.take() else { return };
                adopt(regs);
                run_retirable(entry);
            })
            .expect("kernel thread spawn");

        Self { baton }
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::new()
    }
}

impl core::fmt::Debug for Context {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Context").finish_non_exhaustive()
    }
}

impl Drop for Context {
    fn drop(&mut self) {
        let mut slot = self.baton.slot.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.is_none() {
            *slot = Some(Handoff::Retire);
            self.baton.ready.notify_one();
        }
    }
}

fn adopt(regs: HartRegs) {
    REGS.with(|r| r.set(regs));
    // interrupts are always off across a switch
    interrupts::disable();
}

fn run_retirable<F: FnOnce()>(entry: F) {
    if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(entry)) {
        if !payload.is::<Retired>() {
            panic::resume_unwind(payload);
        }
    }
}

/// Starts a hart. `entry` runs on a new OS thread with no `Cpu` bound yet.
pub fn start_hart<F>(id: usize, entry: F)
where
    F: FnOnce() + Send + 'static,
{
    thread::Builder::new()
        .name(alloc::format!("hart{id}"))
        .spawn(move || run_retirable(entry))
        .expect("hart spawn");
}

/// Saves the current kernel thread in `old` and resumes `new` on this hart.
/// Returns when another thread switches back to `old`, possibly on another hart.
///
/// # Safety
/// Interrupts must be disabled, `new` must be a suspended context and `old` must be the context
/// of the calling thread.
pub unsafe fn swtch(old: &Context, new: &Context) {
    new.baton.pass(Handoff::Run(REGS.with(Cell::get)));

    match old.baton.take() {
        Some(regs) => adopt(regs),
        None => panic!("swtch: resumed context was retired"),
    }
}

/// Gives this hart to `new` and retires the calling thread.
///
/// # Safety
/// Same as [`swtch`]. No lock guard may be live on the caller's stack.
pub unsafe fn swtch_exit(new: &Context) -> ! {
    new.baton.pass(Handoff::Run(REGS.with(Cell::get)));
    REGS.with(|r| r.set(HartRegs::default()));
    panic::resume_unwind(Box::new(Retired))
}
