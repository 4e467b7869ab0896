use crate::Kernel;
use crate::file::{File, FileType};
use crate::syscall::SysError;

/// Allocates a file descriptor for the given file.
/// Takes over file reference from caller on success.
fn fd_alloc(kernel: &Kernel, file: File) -> Result<usize, SysError> {
    let (_slot, data) = kernel.current_data_mut();

    for (fd, open_file) in data.open_files.iter_mut().enumerate() {
        if open_file.is_none() {
            *open_file = Some(file);
            return Ok(fd);
        }
    }

    kernel.files.close(file);
    err!(SysError::TooManyFiles)
}

/// Fetches the open file behind `fd`.
fn get_file(kernel: &Kernel, fd: usize) -> Result<&File, SysError> {
    let (_slot, data) = kernel.current_data_mut();

    match data.open_files.get(fd) {
        Some(Some(file)) => Ok(file),
        _ => err!(SysError::BadDescriptor),
    }
}

pub fn sys_open_console(kernel: &'static Kernel) -> Result<usize, SysError> {
    let file = try_log!(kernel.files.alloc(FileType::Console, true, true));
    fd_alloc(kernel, file)
}

pub fn sys_dup(kernel: &'static Kernel, fd: usize) -> Result<usize, SysError> {
    let file = kernel.files.dup(try_log!(get_file(kernel, fd)));
    fd_alloc(kernel, file)
}

pub fn sys_close(kernel: &'static Kernel, fd: usize) -> Result<(), SysError> {
    try_log!(get_file(kernel, fd));

    let (_slot, data) = kernel.current_data_mut();
    if let Some(file) = data.open_files[fd].take() {
        kernel.files.close(file);
    }

    Ok(())
}
