use core::fmt::Display;

use crate::fs::FsError;
use crate::vm::VmError;

/// Kernel error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KernelError {
    /// No free physical page.
    Alloc,
    InvalidArgument,
    /// Every process slot is in use.
    OutOfProc,
    /// `wait` found no children, or the caller was killed.
    NoChildren,
    /// No process with the requested pid.
    NoProcess,
    /// The calling process was killed while blocked.
    Killed,
    Vm(VmError),
    Fs(FsError),
}

impl From<VmError> for KernelError {
    fn from(value: VmError) -> Self {
        match value {
            VmError::Alloc => Self::Alloc,
            other => Self::Vm(other),
        }
    }
}

impl From<FsError> for KernelError {
    fn from(value: FsError) -> Self {
        Self::Fs(value)
    }
}

impl Display for KernelError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            KernelError::Alloc => write!(f, "alloc error"),
            KernelError::InvalidArgument => write!(f, "invalid argument"),
            KernelError::OutOfProc => write!(f, "out of proc"),
            KernelError::NoChildren => write!(f, "no children"),
            KernelError::NoProcess => write!(f, "no such process"),
            KernelError::Killed => write!(f, "killed"),
            KernelError::Vm(e) => write!(f, "vm error: {}", e),
            KernelError::Fs(e) => write!(f, "filesystem error {}", e),
        }
    }
}

/// Return an error, logging file:line. Use instead of `return Err(...)`.
#[macro_export]
macro_rules! err {
    ($e:expr) => {{
        #[cfg(debug_assertions)]
        {
            match $crate::sched::current_hart_id() {
                Some(id) => $crate::println!(
                    "! hart {} errored at {}:{}: {}",
                    id,
                    file!(),
                    line!(),
                    $e
                ),
                None => $crate::println!("! errored at {}:{}: {}", file!(), line!(), $e),
            }
        }
        return Err($e.into());
    }};
}

/// Log error.
#[macro_export]
macro_rules! log {
    ($e:expr) => {
        match $e {
            Ok(v) => Ok(v),
            Err(e) => {
                #[cfg(debug_assertions)]
                $crate::println!("  at {}:{}", file!(), line!());
                Err(e)
            }
        }
    };
}

/// Propagate error with location logging. Use instead of `?`.
#[macro_export]
macro_rules! try_log {
    ($e:expr) => {
        match $e {
            Ok(v) => v,
            Err(e) => {
                #[cfg(debug_assertions)]
                $crate::println!("  at {}:{}", file!(), line!());
                return Err(e.into());
            }
        }
    };
}
