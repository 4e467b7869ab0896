//! Scheduling policies.
//!
//! The dispatch loop asks the policy which runnable process to run next. Every call happens with
//! the table lock held, so a policy keeps its ready structures without any locking of its own.

use alloc::boxed::Box;
use alloc::collections::VecDeque;
use alloc::vec;
use alloc::vec::Vec;
use core::str::FromStr;

use rand_core::SeedableRng;

use crate::error::KernelError;
use crate::param::{NPRIO, PRIORITY_MAX};
use crate::proc::{ProcInner, ProcState};
use crate::rand::{XorShift64Star, below};

pub trait Policy: Send {
    fn name(&self) -> &'static str;

    /// A new process became runnable.
    fn admit(&mut self, _procs: &mut [ProcInner], _slot: usize) {}

    /// The running process gave up the cpu, voluntarily or on a timer tick.
    fn preempt(&mut self, _procs: &mut [ProcInner], _slot: usize) {}

    /// A sleeping process became runnable, woken up or killed.
    fn wake(&mut self, _procs: &mut [ProcInner], _slot: usize) {}

    /// Chooses a runnable slot for `hart` to run, removing it from the ready structures.
    fn pick(&mut self, hart: usize, procs: &[ProcInner]) -> Option<usize>;

    /// Periodic priority boost.
    fn boost(&mut self, _procs: &mut [ProcInner]) {}
}

#[cfg(all(feature = "lottery", feature = "mlfq"))]
compile_error!("features `lottery` and `mlfq` are mutually exclusive");

/// Policy selection, fixed at boot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedPolicy {
    RoundRobin,
    Lottery,
    Mlfq,
}

impl Default for SchedPolicy {
    fn default() -> Self {
        if cfg!(feature = "lottery") {
            SchedPolicy::Lottery
        } else if cfg!(feature = "mlfq") {
            SchedPolicy::Mlfq
        } else {
            SchedPolicy::RoundRobin
        }
    }
}

impl FromStr for SchedPolicy {
    type Err = KernelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "rr" | "round-robin" => Ok(SchedPolicy::RoundRobin),
            "lottery" => Ok(SchedPolicy::Lottery),
            "mlfq" => Ok(SchedPolicy::Mlfq),
            _ => Err(KernelError::InvalidArgument),
        }
    }
}

impl SchedPolicy {
    pub fn build(self, ncpu: usize, seed: u64) -> Box<dyn Policy> {
        match self {
            SchedPolicy::RoundRobin => Box::new(RoundRobin::new(ncpu)),
            SchedPolicy::Lottery => Box::new(Lottery::new(seed)),
            SchedPolicy::Mlfq => Box::new(Mlfq::new()),
        }
    }
}

/// Scans the table in slot order. Each hart resumes its scan after the slot it ran last.
pub struct RoundRobin {
    cursors: Vec<usize>,
}

impl RoundRobin {
    pub fn new(ncpu: usize) -> Self {
        Self {
            cursors: vec![0; ncpu],
        }
    }
}

impl Policy for RoundRobin {
    fn name(&self) -> &'static str {
        "round robin"
    }

    fn pick(&mut self, hart: usize, procs: &[ProcInner]) -> Option<usize> {
        let n = procs.len();
        let start = self.cursors[hart];

        let slot = (start..start + n)
            .map(|i| i % n)
            .find(|&slot| procs[slot].state == ProcState::Runnable)?;

        self.cursors[hart] = (slot + 1) % n;
        Some(slot)
    }
}

/// Draws a winning ticket among the runnable processes.
pub struct Lottery {
    rng: XorShift64Star,
}

impl Lottery {
    pub fn new(seed: u64) -> Self {
        Self {
            rng: XorShift64Star::seed_from_u64(seed),
        }
    }
}

impl Policy for Lottery {
    fn name(&self) -> &'static str {
        "lottery"
    }

    fn pick(&mut self, _hart: usize, procs: &[ProcInner]) -> Option<usize> {
        let runnable = || {
            procs
                .iter()
                .enumerate()
                .filter(|(_, p)| p.state == ProcState::Runnable)
        };

        let total: u64 = runnable().map(|(_, p)| p.tickets as u64).sum();
        if total == 0 {
            return None;
        }

        let winner = below(&mut self.rng, total);

        let mut counter = 0;
        for (slot, proc) in runnable() {
            counter += proc.tickets as u64;
            if winner < counter {
                return Some(slot);
            }
        }

        unreachable!("lottery: no winner");
    }
}

/// Multi-level feedback queue. Level 0 runs first; a process that uses up its turn drops a level.
pub struct Mlfq {
    queues: [VecDeque<usize>; NPRIO],
}

impl Mlfq {
    pub fn new() -> Self {
        Self {
            queues: core::array::from_fn(|_| VecDeque::new()),
        }
    }

    fn push(&mut self, procs: &[ProcInner], slot: usize) {
        let level = procs[slot].priority.min(PRIORITY_MAX);
        self.queues[level].push_back(slot);
    }

    /// Slots queued at `level`, head first.
    pub fn level(&self, level: usize) -> impl Iterator<Item = usize> + '_ {
        self.queues[level].iter().copied()
    }
}

impl Default for Mlfq {
    fn default() -> Self {
        Self::new()
    }
}

impl Policy for Mlfq {
    fn name(&self) -> &'static str {
        "mlfq"
    }

    fn admit(&mut self, procs: &mut [ProcInner], slot: usize) {
        self.push(procs, slot);
    }

    fn preempt(&mut self, procs: &mut [ProcInner], slot: usize) {
        let priority = &mut procs[slot].priority;
        *priority = (*priority + 1).min(PRIORITY_MAX);
        self.push(procs, slot);
    }

    fn wake(&mut self, procs: &mut [ProcInner], slot: usize) {
        self.push(procs, slot);
    }

    fn pick(&mut self, _hart: usize, _procs: &[ProcInner]) -> Option<usize> {
        self.queues.iter_mut().find_map(VecDeque::pop_front)
    }

    fn boost(&mut self, procs: &mut [ProcInner]) {
        for proc in procs.iter_mut() {
            proc.priority = 0;
        }

        let (top, rest) = self.queues.split_at_mut(1);
        for queue in rest {
            top[0].extend(queue.drain(..));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proc::ProcState::{Runnable, Sleeping};

    fn table(procs: &[(ProcState, usize)]) -> Vec<ProcInner> {
        procs
            .iter()
            .map(|&(state, tickets)| ProcInner {
                state,
                tickets,
                ..ProcInner::default()
            })
            .collect()
    }

    #[test]
    fn round_robin_scans_in_order() {
        let procs = table(&[(Runnable, 1), (Sleeping, 1), (Runnable, 1), (Runnable, 1)]);
        let mut rr = RoundRobin::new(2);

        let picks: Vec<_> = (0..4).map(|_| rr.pick(0, &procs).unwrap()).collect();
        assert_eq!(picks, [0, 2, 3, 0]);
        // other harts keep their own place
        assert_eq!(rr.pick(1, &procs), Some(0));
    }

    #[test]
    fn round_robin_idle() {
        let procs = table(&[(Sleeping, 1), (Sleeping, 1)]);
        assert_eq!(RoundRobin::new(1).pick(0, &procs), None);
    }

    #[test]
    fn lottery_share_follows_tickets() {
        let procs = table(&[(Runnable, 1), (Runnable, 2), (Runnable, 7), (Sleeping, 50)]);
        let mut lottery = Lottery::new(1234);

        let draws = 100_000;
        let mut wins = [0usize; 4];
        for _ in 0..draws {
            wins[lottery.pick(0, &procs).unwrap()] += 1;
        }

        assert_eq!(wins[3], 0);
        for (slot, expected) in [(0, 0.1), (1, 0.2), (2, 0.7)] {
            let share = wins[slot] as f64 / draws as f64;
            assert!((share - expected).abs() < 0.01, "slot {slot}: {share}");
        }
    }

    #[test]
    fn lottery_without_runnable() {
        let procs = table(&[(Sleeping, 5)]);
        assert_eq!(Lottery::new(0).pick(0, &procs), None);
    }

    #[test]
    fn mlfq_is_fifo_per_level() {
        let mut procs = table(&[(Runnable, 1), (Runnable, 1), (Runnable, 1)]);
        let mut mlfq = Mlfq::new();
        for slot in [2, 0, 1] {
            mlfq.admit(&mut procs, slot);
        }

        assert_eq!(mlfq.pick(0, &procs), Some(2));
        mlfq.preempt(&mut procs, 2);
        assert_eq!(procs[2].priority, 1);

        // level 0 drains before level 1
        assert_eq!(mlfq.pick(0, &procs), Some(0));
        assert_eq!(mlfq.pick(0, &procs), Some(1));
        assert_eq!(mlfq.pick(0, &procs), Some(2));
        assert_eq!(mlfq.pick(0, &procs), None);
    }

    #[test]
    fn mlfq_yielding_sinks_to_bottom() {
        let mut procs = table(&[(Runnable, 1)]);
        let mut mlfq = Mlfq::new();
        mlfq.admit(&mut procs, 0);

        for _ in 0..10 {
            assert_eq!(mlfq.pick(0, &procs), Some(0));
            mlfq.preempt(&mut procs, 0);
        }

        assert_eq!(procs[0].priority, PRIORITY_MAX);
        assert_eq!(mlfq.level(PRIORITY_MAX).collect::<Vec<_>>(), [0]);
    }

    #[test]
    fn mlfq_wake_keeps_level() {
        let mut procs = table(&[(Runnable, 1)]);
        procs[0].priority = 1;
        let mut mlfq = Mlfq::new();

        mlfq.wake(&mut procs, 0);
        assert_eq!(mlfq.level(1).collect::<Vec<_>>(), [0]);
        assert_eq!(procs[0].priority, 1);
    }

    #[test]
    fn mlfq_boost_flattens_in_order() {
        let mut procs = table(&[(Runnable, 1), (Runnable, 1), (Runnable, 1), (Sleeping, 1)]);
        procs[0].priority = 2;
        procs[1].priority = 1;
        procs[3].priority = 2;

        let mut mlfq = Mlfq::new();
        for slot in [0, 1, 2] {
            mlfq.admit(&mut procs, slot);
        }

        mlfq.boost(&mut procs);
        assert!(procs.iter().all(|p| p.priority == 0));
        assert_eq!(mlfq.level(0).collect::<Vec<_>>(), [2, 1, 0]);
        assert_eq!(mlfq.level(2).count(), 0);
    }

    #[test]
    fn parse_policy_names() {
        assert_eq!("mlfq".parse(), Ok(SchedPolicy::Mlfq));
        assert_eq!("rr".parse(), Ok(SchedPolicy::RoundRobin));
        assert_eq!(
            "fifo".parse::<SchedPolicy>(),
            Err(KernelError::InvalidArgument)
        );
    }
}
