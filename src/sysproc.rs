use crate::Kernel;
use crate::error::KernelError;
use crate::proc::{Channel, Pid, Program, ProcTimes};
use crate::syscall::SysError;
use crate::vm::VA;

pub fn sys_exit(kernel: &'static Kernel) -> ! {
    kernel.exit()
}

pub fn sys_getpid(kernel: &'static Kernel) -> Pid {
    kernel.current_pid()
}

pub fn sys_fork(kernel: &'static Kernel, child: Program) -> Result<Pid, SysError> {
    Ok(try_log!(kernel.fork(child)))
}

pub fn sys_wait(kernel: &'static Kernel) -> Result<Pid, SysError> {
    let (pid, _times) = try_log!(kernel.wait());
    Ok(pid)
}

pub fn sys_testwait(kernel: &'static Kernel) -> Result<(Pid, ProcTimes), SysError> {
    Ok(try_log!(kernel.wait()))
}

pub fn sys_sbrk(kernel: &'static Kernel, n: isize) -> Result<usize, SysError> {
    let addr = kernel.procs.data(kernel.current_slot()).size;
    try_log!(kernel.grow(n));
    Ok(addr)
}

pub fn sys_sleep(kernel: &'static Kernel, n: usize) -> Result<(), SysError> {
    let mut ticks = kernel.ticks.lock();
    let ticks0 = *ticks;

    while *ticks - ticks0 < n {
        if kernel.current_killed() {
            err!(KernelError::Killed);
        }

        ticks = kernel.sleep(Channel::Ticks, ticks);
    }

    Ok(())
}

pub fn sys_kill(kernel: &'static Kernel, pid: Pid) -> Result<(), SysError> {
    Ok(try_log!(kernel.kill(pid)))
}

pub fn sys_yield(kernel: &'static Kernel) {
    kernel.r#yield()
}

pub fn sys_uptime(kernel: &'static Kernel) -> usize {
    kernel.uptime()
}

pub fn sys_settickets(kernel: &'static Kernel, tickets: usize) -> Result<usize, SysError> {
    Ok(try_log!(kernel.set_tickets(tickets)))
}

pub fn sys_chtickets(kernel: &'static Kernel, pid: Pid, tickets: usize) -> Result<(), SysError> {
    Ok(try_log!(kernel.change_tickets(pid, tickets)))
}

pub fn sys_nice(kernel: &'static Kernel, priority: usize) -> Result<(), SysError> {
    Ok(try_log!(kernel.nice(priority)))
}

pub fn sys_getpri(kernel: &'static Kernel) -> usize {
    kernel.priority()
}

pub fn sys_free_pages(kernel: &'static Kernel) -> usize {
    kernel.free_pages()
}

pub fn sys_getpinfo(kernel: &'static Kernel, addr: VA) -> Result<(), SysError> {
    let pstat = kernel.pinfo();
    Ok(try_log!(
        kernel.copy_to_user(bytemuck::bytes_of(&pstat), addr)
    ))
}

pub fn sys_pdump(kernel: &'static Kernel) {
    kernel.pdump()
}
