//! Booting throwaway machines from unit tests.

use core::ops::Deref;
use core::time::Duration;
use std::sync::mpsc::{self, Receiver, Sender};

use crate::proc::ProcState;
use crate::syscall::Syscalls;
use crate::{Config, Kernel};

/// How long a test waits on a simulated process before giving up.
pub const TIMEOUT: Duration = Duration::from_secs(10);

/// A booted kernel that is halted when dropped.
pub struct Machine {
    kernel: &'static Kernel,
}

impl Machine {
    /// Boots a kernel whose first process runs `body`, then keeps reaping orphans forever.
    /// Results come back over the returned channel.
    pub fn boot<T, F>(config: Config, body: F) -> (Machine, Receiver<T>)
    where
        T: Send + 'static,
        F: Fn(&Syscalls, &Sender<T>) + Send + Sync + 'static,
    {
        let (tx, rx) = mpsc::channel();

        let kernel = Kernel::boot(config, move |sys| {
            body(sys, &tx);

            // init never exits
            let kernel = sys.kernel();
            let me = kernel.current_slot();
            loop {
                let zombies = kernel
                    .procs
                    .table
                    .lock()
                    .procs
                    .iter()
                    .any(|p| p.parent == Some(me) && p.state == ProcState::Zombie);

                if zombies {
                    let _ = sys.wait();
                } else {
                    let _ = sys.sleep(1);
                }
            }
        });

        (Machine { kernel }, rx)
    }
}

impl Deref for Machine {
    type Target = Kernel;

    fn deref(&self) -> &Self::Target {
        self.kernel
    }
}

impl Drop for Machine {
    fn drop(&mut self) {
        self.kernel.halt();
    }
}
