//! Process table snapshot handed to user space by `getpinfo`.

use bytemuck::{Pod, Zeroable};

use crate::Kernel;
use crate::param::NPROC;
use crate::proc::{Pid, ProcState};

/// One row per process slot. Plain `i32` arrays so user space can read it as bytes.
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct PStat {
    /// Whether this slot of the process table is in use (1 or 0)
    pub inuse: [i32; NPROC],
    pub pid: [i32; NPROC],
    /// Feedback queue level
    pub priority: [i32; NPROC],
    pub tickets: [i32; NPROC],
    /// [`ProcState::code`] of each slot
    pub state: [i32; NPROC],
    /// Ticks spent runnable, running and sleeping
    pub ticks: [[i32; 3]; NPROC],
}

impl PStat {
    fn slot_of(&self, pid: Pid) -> Option<usize> {
        (0..NPROC).find(|&slot| self.inuse[slot] == 1 && self.pid[slot] as usize == *pid)
    }

    pub fn state_of(&self, pid: Pid) -> Option<ProcState> {
        ProcState::from_code(self.state[self.slot_of(pid)?])
    }

    pub fn priority_of(&self, pid: Pid) -> Option<usize> {
        self.slot_of(pid).map(|slot| self.priority[slot] as usize)
    }

    pub fn tickets_of(&self, pid: Pid) -> Option<usize> {
        self.slot_of(pid).map(|slot| self.tickets[slot] as usize)
    }
}

impl ProcState {
    /// Numeric state, as user space sees it.
    pub fn code(self) -> i32 {
        match self {
            ProcState::Unused => 0,
            ProcState::Embryo => 1,
            ProcState::Sleeping => 2,
            ProcState::Runnable => 3,
            ProcState::Running => 4,
            ProcState::Zombie => 5,
        }
    }

    pub fn from_code(code: i32) -> Option<Self> {
        Some(match code {
            0 => ProcState::Unused,
            1 => ProcState::Embryo,
            2 => ProcState::Sleeping,
            3 => ProcState::Runnable,
            4 => ProcState::Running,
            5 => ProcState::Zombie,
            _ => return None,
        })
    }
}

impl Kernel {
    /// Fills a [`PStat`] from the process table.
    /// Does not lock, like `procdump`, so a row may be mid-update.
    pub fn pinfo(&self) -> PStat {
        let mut pstat = PStat::zeroed();

        let table = unsafe { self.procs.table.get_mut_unchecked() };
        for (slot, proc) in table.procs.iter().enumerate().take(NPROC) {
            if proc.state == ProcState::Unused {
                continue;
            }

            pstat.inuse[slot] = 1;
            pstat.pid[slot] = *proc.pid as i32;
            pstat.priority[slot] = proc.priority as i32;
            pstat.tickets[slot] = proc.tickets as i32;
            pstat.state[slot] = proc.state.code();
            pstat.ticks[slot] = [
                proc.times.retime as i32,
                proc.times.rutime as i32,
                proc.times.stime as i32,
            ];
        }

        pstat
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_codes() {
        for state in [
            ProcState::Unused,
            ProcState::Embryo,
            ProcState::Sleeping,
            ProcState::Runnable,
            ProcState::Running,
            ProcState::Zombie,
        ] {
            assert_eq!(ProcState::from_code(state.code()), Some(state));
        }
        assert_eq!(ProcState::from_code(6), None);
    }

    #[test]
    fn lookup_ignores_free_slots() {
        let mut pstat = PStat::zeroed();
        pstat.pid[3] = 9;
        pstat.state[3] = ProcState::Zombie.code();
        assert_eq!(pstat.state_of(Pid::from_usize(9)), None);

        pstat.inuse[3] = 1;
        pstat.tickets[3] = 4;
        assert_eq!(pstat.state_of(Pid::from_usize(9)), Some(ProcState::Zombie));
        assert_eq!(pstat.tickets_of(Pid::from_usize(9)), Some(4));
        assert_eq!(pstat.priority_of(Pid::from_usize(9)), Some(0));
    }
}
