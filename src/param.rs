/// maximum number of CPUs
pub const NCPU: usize = 8;
/// maximum number of processes
pub const NPROC: usize = 64;
/// open files per process
pub const NOFILE: usize = 16;
/// open files per system
pub const NFILE: usize = 100;
/// maximum number of active inodes
pub const NINODE: usize = 50;
/// maximum file path name
pub const MAXPATH: usize = 128;
/// kernel stack pages per process
pub const NKSTACK_PAGES: usize = 1;
/// physical pages managed by default
pub const NPAGES: usize = 1024;
/// first physical address handed to the page allocator
pub const PHYSBASE: usize = 0x8020_0000;
/// lottery tickets every new process starts with
pub const DEFAULT_TICKETS: usize = 1;
/// most lottery tickets one process may hold
pub const MAX_TICKETS: usize = 100_000;
/// number of feedback queue levels, 0 is the highest
pub const NPRIO: usize = 3;
/// lowest feedback queue level
pub const PRIORITY_MAX: usize = NPRIO - 1;
/// ticks between feedback queue priority boosts
pub const BOOST_TICKS: usize = 100;
/// host microseconds per timer tick
pub const TICK_INTERVAL: u64 = 1_000;
