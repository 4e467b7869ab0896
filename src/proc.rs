use core::cell::UnsafeCell;
use core::fmt;

use alloc::boxed::Box;
use alloc::format;
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;

use crate::Kernel;
use crate::arch::{Context, PGSIZE};
use crate::error::KernelError;
use crate::file::File;
use crate::fs::Inode;
use crate::kalloc::Kmem;
use crate::param::{DEFAULT_TICKETS, MAX_TICKETS, NKSTACK_PAGES, NOFILE, PRIORITY_MAX};
use crate::policy::Policy;
use crate::sched::{current_cpu, lock_current_cpu};
use crate::spinlock::SpinLock;
use crate::syscall::Syscalls;
use crate::vm::{PA, PteFlags, Uvm, VA, VmError};

/// A user program. It runs in user mode on the process's kernel thread and reaches the kernel only
/// through the [`Syscalls`] handle it is given.
pub type Program = Arc<dyn Fn(&Syscalls) + Send + Sync>;

/// Wrapper around usize to represent process IDs.
/// Allocated under the table lock, so every live process has a distinct one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Pid(usize);

impl Pid {
    pub const fn from_usize(value: usize) -> Self {
        Pid(value)
    }
}

impl core::ops::Deref for Pid {
    type Target = usize;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl fmt::Display for Pid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Channel type for `sleep`/`wakeup`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Channel {
    /// Process slot, for `wait()` / `exit()`.
    Proc(usize),
    /// System ticks
    Ticks,
    /// Any other kernel object, identified by its address.
    Addr(usize),
}

impl Channel {
    pub fn of<T>(object: &T) -> Self {
        Channel::Addr(object as *const T as usize)
    }
}

/// The state of a process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProcState {
    #[default]
    Unused,
    Embryo,
    Sleeping,
    Runnable,
    Running,
    Zombie,
}

impl ProcState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProcState::Unused => "unused",
            ProcState::Embryo => "embryo",
            ProcState::Sleeping => "sleep ",
            ProcState::Runnable => "runble",
            ProcState::Running => "run   ",
            ProcState::Zombie => "zombie",
        }
    }
}

/// Time spent by a process in each scheduling state, in ticks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ProcTimes {
    /// Tick the process was created at.
    pub ctime: usize,
    pub retime: usize,
    pub rutime: usize,
    pub stime: usize,
}

/// Public fields of a process slot.
///
/// Table lock must be held when accessing these.
#[derive(Debug, Default)]
pub struct ProcInner {
    /// Process state
    pub state: ProcState,
    /// Process ID
    pub pid: Pid,
    /// Slot of the parent process
    pub parent: Option<usize>,
    /// If Some, sleeping on chan
    pub channel: Option<Channel>,
    /// If true, have been killed
    pub killed: bool,
    /// Lottery tickets
    pub tickets: usize,
    /// Feedback queue level, 0 is the highest
    pub priority: usize,
    pub times: ProcTimes,
}

impl ProcInner {
    pub fn new() -> Self {
        Self::default()
    }
}

/// Everything the table lock guards: the slots' public fields and the ready structures.
pub struct TableInner {
    pub procs: Box<[ProcInner]>,
    pub policy: Box<dyn Policy>,
    next_pid: usize,
}

impl TableInner {
    pub fn new(nproc: usize, policy: Box<dyn Policy>) -> Self {
        Self {
            procs: (0..nproc).map(|_| ProcInner::new()).collect(),
            policy,
            next_pid: 1,
        }
    }

    fn alloc_pid(&mut self) -> Pid {
        let pid = Pid(self.next_pid);
        self.next_pid += 1;
        pid
    }

    /// Picks the next process for `hart` to run.
    pub fn pick(&mut self, hart: usize) -> Option<usize> {
        let slot = self.policy.pick(hart, &self.procs)?;
        assert_eq!(self.procs[slot].state, ProcState::Runnable, "pick not runnable");
        Some(slot)
    }

    /// EMBRYO -> RUNNABLE.
    pub fn admit(&mut self, slot: usize) {
        self.procs[slot].state = ProcState::Runnable;
        self.policy.admit(&mut self.procs, slot);
    }

    /// RUNNING -> RUNNABLE.
    pub fn preempt(&mut self, slot: usize) {
        self.procs[slot].state = ProcState::Runnable;
        self.policy.preempt(&mut self.procs, slot);
    }

    /// SLEEPING -> RUNNABLE.
    fn wake(&mut self, slot: usize) {
        debug_assert_eq!(self.procs[slot].state, ProcState::Sleeping);
        self.procs[slot].state = ProcState::Runnable;
        self.policy.wake(&mut self.procs, slot);
    }

    /// Wakes up all processes sleeping on channel.
    pub fn wakeup(&mut self, channel: Channel) {
        for slot in 0..self.procs.len() {
            let proc = &self.procs[slot];
            if proc.state == ProcState::Sleeping && proc.channel == Some(channel) {
                self.wake(slot);
            }
        }
    }

    /// Charges one tick to every live process according to its state.
    pub fn account_tick(&mut self) {
        for proc in self.procs.iter_mut() {
            match proc.state {
                ProcState::Sleeping => proc.times.stime += 1,
                ProcState::Runnable => proc.times.retime += 1,
                ProcState::Running => proc.times.rutime += 1,
                _ => {}
            }
        }
    }

    /// Returns every process to the highest feedback queue level.
    pub fn boost(&mut self) {
        self.policy.boost(&mut self.procs);
    }

    fn find(&self, pid: Pid) -> Option<usize> {
        self.procs
            .iter()
            .position(|p| p.state != ProcState::Unused && p.pid == pid)
    }
}

/// Per-process data for the trap handling code.
/// The return value register and the program counter, which on the hosted machine is the user
/// program itself.
#[derive(Clone, Default)]
pub struct TrapFrame {
    /// saved user program counter
    pub epc: Option<Program>,
    /// user stack pointer
    pub sp: usize,
    pub a0: usize,
}

impl fmt::Debug for TrapFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TrapFrame")
            .field("epc", &self.epc.as_ref().map(Arc::as_ptr))
            .field("sp", &self.sp)
            .field("a0", &self.a0)
            .finish()
    }
}

/// Private fields for a process slot.
#[derive(Debug, Default)]
pub struct ProcData {
    /// Physical page backing the kernel stack
    pub kstack: Option<PA>,
    /// Size of process memory (bytes)
    pub size: usize,
    /// User page table
    pub pagetable: Option<Uvm>,
    pub trapframe: TrapFrame,
    /// swtch() here to run process
    pub context: Context,
    /// Open files
    pub open_files: [Option<File>; NOFILE],
    /// Current directory
    pub cwd: Option<Inode>,
    /// Process name
    pub name: String,
}

impl ProcData {
    /// Returns a reference to the user page table.
    pub fn pagetable(&self) -> &Uvm {
        self.pagetable.as_ref().expect("no pagetable")
    }

    /// Returns a mutable reference to the user page table.
    pub fn pagetable_mut(&mut self) -> &mut Uvm {
        self.pagetable.as_mut().expect("no pagetable")
    }
}

/// Table of processes
pub struct ProcTable {
    pub table: SpinLock<TableInner>,
    data: Box<[UnsafeCell<ProcData>]>,
}

impl ProcTable {
    pub fn new(nproc: usize, policy: Box<dyn Policy>) -> Self {
        Self {
            table: SpinLock::new(TableInner::new(nproc, policy), "ptable"),
            data: (0..nproc)
                .map(|_| UnsafeCell::new(ProcData::default()))
                .collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn data(&self, slot: usize) -> &ProcData {
        unsafe { &*self.data[slot].get() }
    }

    /// Returns a mutable reference to the process's data.
    ///
    /// # Safety
    /// The caller must ensure they have exclusive access to the slot. This is true if either
    ///     1. it's the current proc (most cases) or
    ///     2. the slot hasn't been made runnable yet (fork, allocproc) or
    ///     3. the slot is a zombie whose parent holds the table lock (wait).
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn data_mut(&self, slot: usize) -> &mut ProcData {
        unsafe { &mut *self.data[slot].get() }
    }
}

unsafe impl Sync for ProcTable {}

impl Kernel {
    /// Returns the slot of the process running on this hart.
    /// Panics if there is no current process.
    pub(crate) fn current_slot(&self) -> usize {
        let _lock = lock_current_cpu();
        unsafe { current_cpu() }.proc.expect("no current process")
    }

    /// Returns the current slot and exclusive reference to its underlying [`ProcData`].
    #[allow(clippy::mut_from_ref)]
    pub(crate) fn current_data_mut(&self) -> (usize, &mut ProcData) {
        let slot = self.current_slot();
        // # Safety: we are the current proc
        (slot, unsafe { self.procs.data_mut(slot) })
    }

    /// Returns the pid of the current process.
    pub fn current_pid(&self) -> Pid {
        let slot = self.current_slot();
        self.procs.table.lock().procs[slot].pid
    }

    /// Returns true if the current process has been killed.
    ///
    /// Acquires and releases the table lock.
    pub fn current_killed(&self) -> bool {
        let slot = self.current_slot();
        self.procs.table.lock().procs[slot].killed
    }

    /// Searches the table for an `Unused` slot. If found, initializes the state required to run in
    /// the kernel and returns it in the `Embryo` state.
    fn allocproc(&'static self) -> Result<(usize, Pid), KernelError> {
        let now = *self.ticks.lock();

        let (slot, pid) = {
            let mut table = self.procs.table.lock();
            let Some(slot) = table
                .procs
                .iter()
                .position(|p| p.state == ProcState::Unused)
            else {
                err!(KernelError::OutOfProc);
            };

            let pid = table.alloc_pid();
            table.procs[slot] = ProcInner {
                state: ProcState::Embryo,
                pid,
                tickets: DEFAULT_TICKETS,
                times: ProcTimes {
                    ctime: now,
                    ..ProcTimes::default()
                },
                ..ProcInner::default()
            };
            (slot, pid)
        };

        // # Safety: the slot is an embryo, nobody else touches it
        let data = unsafe { self.procs.data_mut(slot) };

        // Allocate kernel stack.
        match log!(self.kmem.kalloc()) {
            Ok(pa) => data.kstack = Some(pa),
            Err(e) => {
                self.procs.table.lock().procs[slot] = ProcInner::new();
                return Err(e);
            }
        }

        // Set up new context to start executing at fork_ret, which returns to user space.
        data.context = Context::with_entry(format!("pid{pid}"), move || self.fork_ret());

        Ok((slot, pid))
    }

    /// Frees a slot and the data attached to it (including user pages).
    fn freeproc(&self, table: &mut TableInner, slot: usize) {
        // # Safety: the slot is unreachable by anyone else
        let data = unsafe { self.procs.data_mut(slot) };

        if let Some(kstack) = data.kstack.take() {
            for page in 0..NKSTACK_PAGES {
                self.kmem.kfree(kstack + page * PGSIZE);
            }
        }

        if let Some(uvm) = data.pagetable.take() {
            uvm.free(&self.kmem, data.size);
        }

        data.size = 0;
        data.trapframe = TrapFrame::default();
        data.context = Context::new();
        data.name.clear();
        table.procs[slot] = ProcInner::new();
    }

    /// Sets up the first user process.
    pub(crate) fn userinit(&'static self, init: Program) {
        let (slot, _pid) = log!(self.allocproc()).expect("userinit");
        self.init_proc.initialize(|| Ok::<_, ()>(slot));

        // # Safety: during initialization, we are the only ones with access to this proc
        let data = unsafe { self.procs.data_mut(slot) };

        let mut uvm = Uvm::new();
        log!(uvm.alloc(&self.kmem, 0, PGSIZE, PteFlags::W)).expect("userinit memory");
        data.pagetable = Some(uvm);
        data.size = PGSIZE;

        data.trapframe = TrapFrame {
            epc: Some(init),
            sp: PGSIZE,
            a0: 0,
        };
        data.name = String::from("initcode");
        data.cwd = Some(log!(self.icache.namei("/")).expect("root path to exist"));

        self.procs.table.lock().admit(slot);
    }

    /// Returns the slot of the root process.
    fn init_slot(&self) -> usize {
        *self.init_proc.get().expect("no init process")
    }

    /// Grows or shrinks user memory by `n` bytes.
    /// The new size is reflected in `data.size` and returned.
    pub fn grow(&self, n: isize) -> Result<usize, KernelError> {
        let (_slot, data) = self.current_data_mut();

        let mut size = data.size;

        if n > 0 {
            size = try_log!(data.pagetable_mut().alloc(
                &self.kmem,
                size,
                size + n as usize,
                PteFlags::W
            ));
        } else if n < 0 {
            let shrink = n.unsigned_abs();
            if shrink > size {
                err!(KernelError::InvalidArgument);
            }

            size = data.pagetable_mut().dealloc(&self.kmem, size, size - shrink);
        }

        data.size = size;
        Ok(size)
    }

    /// Creates a new process, copying the parent. The child starts in user mode at `child`, with
    /// the return value register cleared.
    pub fn fork(&'static self, child: Program) -> Result<Pid, KernelError> {
        let (parent, data) = self.current_data_mut();

        // allocate process
        let (slot, pid) = try_log!(self.allocproc());
        // # Safety: the child is not yet runnable, so we are the only ones with access to it
        let new_data = unsafe { self.procs.data_mut(slot) };

        // share user memory with the child, copy-on-write
        let size = data.size;
        match log!(data.pagetable_mut().copy_cow(&self.kmem, size)) {
            Ok(uvm) => new_data.pagetable = Some(uvm),
            Err(e) => {
                self.freeproc(&mut self.procs.table.lock(), slot);
                return Err(e.into());
            }
        }
        new_data.size = size;

        // copy saved user registers
        new_data.trapframe.clone_from(&data.trapframe);
        new_data.trapframe.epc = Some(child);

        // cause fork to return 0 in the child
        new_data.trapframe.a0 = 0;

        // increment reference counts on open file descriptors
        for (i, file) in data.open_files.iter().enumerate() {
            if let Some(file) = file {
                new_data.open_files[i] = Some(self.files.dup(file));
            }
        }
        new_data.cwd = data.cwd.as_ref().map(|cwd| self.icache.dup(cwd));

        new_data.name = data.name.clone();

        let mut table = self.procs.table.lock();
        table.procs[slot].parent = Some(parent);
        table.admit(slot);

        Ok(pid)
    }

    /// Passes `slot`'s abandoned children to init.
    fn reparent(&self, table: &mut TableInner, slot: usize) {
        let init = self.init_slot();

        for child in 0..table.procs.len() {
            if table.procs[child].parent == Some(slot) {
                table.procs[child].parent = Some(init);

                if table.procs[child].state == ProcState::Zombie {
                    table.wakeup(Channel::Proc(init));
                }
            }
        }
    }

    /// Exits the current process and does not return.
    ///
    /// An exited process remains in the zombie state until its parent calls `wait`.
    pub fn exit(&self) -> ! {
        let (slot, data) = self.current_data_mut();
        assert_ne!(slot, self.init_slot(), "init exiting");

        // close all open files
        for file in &mut data.open_files {
            if let Some(file) = file.take() {
                self.files.close(file);
            }
        }

        if let Some(cwd) = data.cwd.take() {
            self.icache.put(cwd);
        }

        let mut table = self.procs.table.lock();

        // parent might be sleeping in `wait`
        let parent = table.procs[slot].parent.expect("exit no parent");
        table.wakeup(Channel::Proc(parent));

        // give any children to init
        self.reparent(&mut table, slot);

        table.procs[slot].state = ProcState::Zombie;

        self.sched_exit(table, slot)
    }

    /// Waits for a child process to exit and returns its pid and scheduling times.
    pub fn wait(&self) -> Result<(Pid, ProcTimes), KernelError> {
        let me = self.current_slot();

        let mut table = self.procs.table.lock();

        loop {
            let mut have_kids = false;

            // Scan through table looking for exited children.
            for child in 0..table.procs.len() {
                if table.procs[child].parent != Some(me) {
                    continue;
                }

                have_kids = true;

                if table.procs[child].state == ProcState::Zombie {
                    let pid = table.procs[child].pid;
                    let times = table.procs[child].times;
                    self.freeproc(&mut table, child);
                    return Ok((pid, times));
                }
            }

            // No point waiting if we don't have any children.
            if !have_kids || table.procs[me].killed {
                err!(KernelError::NoChildren);
            }

            // Wait for a child to exit.
            table = self.sleep_table(Channel::Proc(me), table);
        }
    }

    /// Kills the process with the given pid.
    ///
    /// The victim won't exit until it tries to return to user space (see `Syscalls`).
    pub fn kill(&self, pid: Pid) -> Result<(), KernelError> {
        let mut table = self.procs.table.lock();

        let Some(slot) = table.find(pid) else {
            err!(KernelError::NoProcess);
        };

        table.procs[slot].killed = true;

        if table.procs[slot].state == ProcState::Sleeping {
            // wakeup process from `sleep()`
            table.wake(slot);
        }

        Ok(())
    }

    /// Sets the lottery tickets of the current process.
    pub fn set_tickets(&self, tickets: usize) -> Result<usize, KernelError> {
        if !(1..=MAX_TICKETS).contains(&tickets) {
            err!(KernelError::InvalidArgument);
        }

        let slot = self.current_slot();
        self.procs.table.lock().procs[slot].tickets = tickets;
        Ok(tickets)
    }

    /// Sets the lottery tickets of the process with the given pid.
    pub fn change_tickets(&self, pid: Pid, tickets: usize) -> Result<(), KernelError> {
        if !(1..=MAX_TICKETS).contains(&tickets) {
            err!(KernelError::InvalidArgument);
        }

        let mut table = self.procs.table.lock();
        let Some(slot) = table.find(pid) else {
            err!(KernelError::NoProcess);
        };

        table.procs[slot].tickets = tickets;
        Ok(())
    }

    /// Moves the current process to feedback queue level `priority`. It takes effect the next time
    /// the process is queued.
    pub fn nice(&self, priority: usize) -> Result<(), KernelError> {
        if priority > PRIORITY_MAX {
            err!(KernelError::InvalidArgument);
        }

        let slot = self.current_slot();
        self.procs.table.lock().procs[slot].priority = priority;
        Ok(())
    }

    /// Returns the feedback queue level of the current process.
    pub fn priority(&self) -> usize {
        let slot = self.current_slot();
        self.procs.table.lock().procs[slot].priority
    }

    /// Copies from kernel to user space, taking copy-on-write faults as needed.
    pub fn copy_to_user(&self, src: &[u8], dst: VA) -> Result<(), KernelError> {
        let (_slot, data) = self.current_data_mut();
        check_user_range(data.size, dst, src.len())?;
        log!(data.pagetable_mut().copy_out(&self.kmem, dst, src)).map_err(|e| e.into())
    }

    /// Copies from user to kernel space.
    pub fn copy_from_user(&self, src: VA, dst: &mut [u8]) -> Result<(), KernelError> {
        let (_slot, data) = self.current_data_mut();
        check_user_range(data.size, src, dst.len())?;
        log!(data.pagetable().copy_in(&self.kmem, src, dst)).map_err(|e| e.into())
    }

    /// Prints a process listing to the console.
    /// For debugging only, it does not lock to avoid creating more problems.
    pub fn procdump(&self) {
        println!();

        let table = unsafe { self.procs.table.get_mut_unchecked() };
        for (slot, proc) in table.procs.iter().enumerate() {
            if proc.state == ProcState::Unused {
                continue;
            }

            println!(
                "{} {} {}",
                proc.pid,
                proc.state.as_str(),
                self.procs.data(slot).name
            );
        }
    }

    /// Writes a detailed process listing: ancestry, killed flag, priority and scheduling times.
    /// Lock-free like `procdump`.
    pub fn pdump_to(&self, out: &mut dyn fmt::Write) -> fmt::Result {
        let table = unsafe { self.procs.table.get_mut_unchecked() };

        for (slot, proc) in table.procs.iter().enumerate() {
            if proc.state == ProcState::Unused {
                continue;
            }

            writeln!(
                out,
                "pid {} {} {}",
                proc.pid,
                proc.state.as_str(),
                self.procs.data(slot).name
            )?;

            let mut ancestors = Vec::new();
            let mut parent = proc.parent;
            // parent links may be mid-update, bound the walk
            while let Some(p) = parent {
                if ancestors.len() == table.procs.len() {
                    break;
                }
                ancestors.push(self.procs.data(p).name.as_str());
                parent = table.procs[p].parent;
            }

            if ancestors.is_empty() {
                writeln!(out, "  ancestors: none")?;
            } else {
                writeln!(out, "  ancestors: {}", ancestors.join(" <- "))?;
            }

            writeln!(
                out,
                "  killed {} priority {} tickets {}",
                proc.killed, proc.priority, proc.tickets
            )?;
            writeln!(
                out,
                "  ctime {} stime {} retime {} rutime {}",
                proc.times.ctime, proc.times.stime, proc.times.retime, proc.times.rutime
            )?;
        }

        Ok(())
    }

    /// Prints [`Kernel::pdump_to`] to the console.
    pub fn pdump(&self) {
        let mut listing = String::new();
        let _ = self.pdump_to(&mut listing);
        print!("{listing}");
    }

    /// Number of free physical pages.
    pub fn free_pages(&self) -> usize {
        self.kmem.free_pages()
    }

    pub fn kmem(&self) -> &Kmem {
        &self.kmem
    }
}

fn check_user_range(size: usize, va: VA, len: usize) -> Result<(), KernelError> {
    match va.as_usize().checked_add(len) {
        Some(end) if end <= size => Ok(()),
        _ => err!(VmError::BadAddress),
    }
}
