use core::fmt::Display;

use crate::Kernel;
use crate::error::KernelError;
use crate::fs::FsError;
use crate::proc::{Pid, ProcTimes};
use crate::pstat::PStat;
use crate::sysfile::*;
use crate::sysproc::*;
use crate::vm::{VA, VmError};

/// Syscall error codes using POSIX-standard numeric values.
///
/// `as_code` gives the value a C user space would see negated in `a0`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum SysError {
    NoEntry = 2,
    NoProcess = 3,
    Interrupted = 4,
    BadDescriptor = 9,
    NoChildren = 10,
    ResourceUnavailable = 11,
    OutOfMemory = 12,
    BadAddress = 14,
    InvalidArgument = 22,
    FileTableFull = 23,
    TooManyFiles = 24,
    NoSpace = 28,
    NameTooLong = 36,
}

impl SysError {
    /// Returns the error code for this error.
    pub fn as_code(self) -> u16 {
        self as u16
    }

    /// Decodes an error code into a `SysError` variant.
    pub fn from_code(code: u16) -> Self {
        match code {
            2 => Self::NoEntry,
            3 => Self::NoProcess,
            4 => Self::Interrupted,
            9 => Self::BadDescriptor,
            10 => Self::NoChildren,
            11 => Self::ResourceUnavailable,
            12 => Self::OutOfMemory,
            14 => Self::BadAddress,
            23 => Self::FileTableFull,
            24 => Self::TooManyFiles,
            28 => Self::NoSpace,
            36 => Self::NameTooLong,
            _ => Self::InvalidArgument,
        }
    }
}

impl Display for SysError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            SysError::NoEntry => write!(f, "no such file or directory"),
            SysError::NoProcess => write!(f, "no such process"),
            SysError::Interrupted => write!(f, "interrupted"),
            SysError::BadDescriptor => write!(f, "bad file descriptor"),
            SysError::NoChildren => write!(f, "no child processes"),
            SysError::ResourceUnavailable => write!(f, "resource temporarily unavailable"),
            SysError::OutOfMemory => write!(f, "cannot allocate memory"),
            SysError::BadAddress => write!(f, "bad address"),
            SysError::InvalidArgument => write!(f, "invalid argument"),
            SysError::FileTableFull => write!(f, "too many open files in system"),
            SysError::TooManyFiles => write!(f, "too many open files"),
            SysError::NoSpace => write!(f, "no space left on device"),
            SysError::NameTooLong => write!(f, "file name too long"),
        }
    }
}

impl From<FsError> for SysError {
    fn from(e: FsError) -> Self {
        match e {
            FsError::OutOfInode => SysError::NoSpace,
            FsError::OutOfFile => SysError::FileTableFull,
            FsError::Resolve => SysError::NoEntry,
            FsError::NameTooLong => SysError::NameTooLong,
        }
    }
}

impl From<KernelError> for SysError {
    fn from(e: KernelError) -> Self {
        match e {
            KernelError::Alloc | KernelError::Vm(VmError::Alloc) => SysError::OutOfMemory,
            KernelError::InvalidArgument => SysError::InvalidArgument,
            KernelError::OutOfProc => SysError::ResourceUnavailable,
            KernelError::NoChildren => SysError::NoChildren,
            KernelError::NoProcess => SysError::NoProcess,
            KernelError::Killed => SysError::Interrupted,
            KernelError::Vm(VmError::BadAddress | VmError::NotMapped) => SysError::BadAddress,
            KernelError::Fs(e) => e.into(),
        }
    }
}

/// Work done by one unit of [`Syscalls::compute`].
const COMPUTE_UNIT: usize = 10_000;

/// The trap interface of a process. A user program holds one while it runs and every system call
/// goes through it.
///
/// Each call is a trap: the process exits instead of entering or leaving the kernel once it has
/// been killed.
pub struct Syscalls {
    kernel: &'static Kernel,
    /// Return value register at the time the program was entered.
    a0: usize,
}

impl Syscalls {
    pub(crate) fn new(kernel: &'static Kernel, a0: usize) -> Self {
        Self { kernel, a0 }
    }

    /// The kernel this process runs on. Kernel calls made directly skip the trap checks.
    pub fn kernel(&self) -> &'static Kernel {
        self.kernel
    }

    /// Return value register at program entry: 0 in a fork child.
    pub fn a0(&self) -> usize {
        self.a0
    }

    /// Runs `call` as a system call.
    fn trap<T>(&self, call: impl FnOnce(&'static Kernel) -> T) -> T {
        self.kernel.exit_if_killed();
        let result = call(self.kernel);
        self.kernel.exit_if_killed();
        result
    }

    /// Runs `call` as a system call that may fail, reporting failures on the console.
    fn syscall<T>(
        &self,
        name: &str,
        call: impl FnOnce(&'static Kernel) -> Result<T, SysError>,
    ) -> Result<T, SysError> {
        self.trap(|kernel| {
            let result = call(kernel);

            #[cfg(debug_assertions)]
            if let Err(error) = &result {
                println!(
                    "! syscall {} error ({}) from proc {}",
                    name,
                    error,
                    kernel.current_pid()
                );
            }
            #[cfg(not(debug_assertions))]
            let _ = name;

            result
        })
    }

    pub fn fork<F>(&self, child: F) -> Result<Pid, SysError>
    where
        F: Fn(&Syscalls) + Send + Sync + 'static,
    {
        self.syscall("fork", |k| sys_fork(k, alloc::sync::Arc::new(child)))
    }

    pub fn exit(&self) -> ! {
        self.kernel.exit_if_killed();
        sys_exit(self.kernel)
    }

    /// Waits for a child to exit and returns its pid.
    pub fn wait(&self) -> Result<Pid, SysError> {
        self.syscall("wait", sys_wait)
    }

    /// Like `wait`, also returning the child's scheduling times.
    pub fn wait_times(&self) -> Result<(Pid, ProcTimes), SysError> {
        self.syscall("testwait", sys_testwait)
    }

    pub fn kill(&self, pid: Pid) -> Result<(), SysError> {
        self.syscall("kill", |k| sys_kill(k, pid))
    }

    pub fn getpid(&self) -> Pid {
        self.trap(sys_getpid)
    }

    pub fn r#yield(&self) {
        self.trap(sys_yield)
    }

    /// Sleeps for `n` ticks.
    pub fn sleep(&self, n: usize) -> Result<(), SysError> {
        self.syscall("sleep", |k| sys_sleep(k, n))
    }

    pub fn uptime(&self) -> usize {
        self.trap(sys_uptime)
    }

    /// Grows or shrinks user memory by `n` bytes and returns the old size.
    pub fn sbrk(&self, n: isize) -> Result<usize, SysError> {
        self.syscall("sbrk", |k| sys_sbrk(k, n))
    }

    pub fn set_tickets(&self, tickets: usize) -> Result<usize, SysError> {
        self.syscall("settickets", |k| sys_settickets(k, tickets))
    }

    pub fn change_tickets(&self, pid: Pid, tickets: usize) -> Result<(), SysError> {
        self.syscall("chtickets", |k| sys_chtickets(k, pid, tickets))
    }

    pub fn nice(&self, priority: usize) -> Result<(), SysError> {
        self.syscall("nice", |k| sys_nice(k, priority))
    }

    pub fn getpri(&self) -> usize {
        self.trap(sys_getpri)
    }

    pub fn free_pages(&self) -> usize {
        self.trap(sys_free_pages)
    }

    /// Copies a [`PStat`] snapshot to user address `addr`.
    pub fn getpinfo(&self, addr: VA) -> Result<(), SysError> {
        self.syscall("getpinfo", |k| sys_getpinfo(k, addr))
    }

    /// [`Syscalls::getpinfo`] without the trip through user memory.
    pub fn pinfo(&self) -> PStat {
        self.trap(|k| k.pinfo())
    }

    pub fn pdump(&self) {
        self.trap(sys_pdump)
    }

    pub fn procdump(&self) {
        self.trap(|k| k.procdump())
    }

    pub fn open_console(&self) -> Result<usize, SysError> {
        self.syscall("open", sys_open_console)
    }

    pub fn dup(&self, fd: usize) -> Result<usize, SysError> {
        self.syscall("dup", |k| sys_dup(k, fd))
    }

    pub fn close(&self, fd: usize) -> Result<(), SysError> {
        self.syscall("close", |k| sys_close(k, fd))
    }

    /// Stores `src` at user address `dst`. A shared page takes a copy-on-write fault.
    pub fn store(&self, dst: VA, src: &[u8]) -> Result<(), SysError> {
        self.syscall("store", |k| Ok(try_log!(k.copy_to_user(src, dst))))
    }

    /// Loads user memory at `src` into `dst`.
    pub fn load(&self, src: VA, dst: &mut [u8]) -> Result<(), SysError> {
        self.syscall("load", |k| Ok(try_log!(k.copy_from_user(src, dst))))
    }

    /// Burns `units` of user-mode cpu time. The timer may preempt between units.
    pub fn compute(&self, units: usize) {
        for _ in 0..units {
            for i in 0..COMPUTE_UNIT {
                core::hint::black_box(i);
            }
            self.kernel.usertrap_intr();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Config;
    use crate::arch::PGSIZE;
    use crate::testing::{Machine, TIMEOUT};

    #[test]
    fn error_codes_round_trip() {
        for error in [
            SysError::NoProcess,
            SysError::NoChildren,
            SysError::ResourceUnavailable,
            SysError::BadAddress,
        ] {
            assert_eq!(SysError::from_code(error.as_code()), error);
        }
        assert_eq!(SysError::from_code(999), SysError::InvalidArgument);
    }

    #[test]
    fn kernel_errors_map_to_posix() {
        assert_eq!(SysError::from(KernelError::Alloc), SysError::OutOfMemory);
        assert_eq!(
            SysError::from(KernelError::Vm(VmError::NotMapped)),
            SysError::BadAddress
        );
        assert_eq!(
            SysError::from(KernelError::Fs(FsError::OutOfFile)),
            SysError::FileTableFull
        );
    }

    #[test]
    fn user_memory_bounds() {
        let config = Config {
            ncpu: 1,
            verbose: false,
            ..Config::default()
        };

        let (machine, rx) = Machine::boot(config, |sys, tx| {
            let size = sys.sbrk(0).unwrap();
            let edge = sys.store(VA::from(size - 2), b"ab");
            let past = sys.store(VA::from(size - 1), b"ab");
            let mut buf = [0u8; 4];
            let read_past = sys.load(VA::from(usize::MAX - 1), &mut buf);
            tx.send((size, edge, past, read_past)).unwrap();
        });

        let (size, edge, past, read_past) = rx.recv_timeout(TIMEOUT).unwrap();
        assert_eq!(size, PGSIZE);
        assert_eq!(edge, Ok(()));
        assert_eq!(past, Err(SysError::BadAddress));
        assert_eq!(read_past, Err(SysError::BadAddress));
        drop(machine);
    }
}
