mod fd;
mod socket;

pub use fd::FileDesc;
pub use socket::{
    connect_stream, multicast_listener, multicast_sender, nonblocking_listener,
};

use std::io;

/// Classic double-fork daemonization: detach from the controlling terminal
/// and point stdio at `/dev/null`.
pub fn daemonize() -> io::Result<()> {
    unsafe {
        match libc::fork() {
            -1 => return Err(io::Error::last_os_error()),
            0 => {}
            _ => libc::_exit(0),
        }

        if libc::setsid() == -1 {
            return Err(io::Error::last_os_error());
        }

        match libc::fork() {
            -1 => return Err(io::Error::last_os_error()),
            0 => {}
            _ => libc::_exit(0),
        }
    }

    let devnull = syscall!(open(c"/dev/null".as_ptr(), libc::O_RDWR))?;
    for fd in 0..3 {
        syscall!(dup2(devnull, fd))?;
    }
    if devnull > 2 {
        unsafe {
            libc::close(devnull);
        }
    }

    Ok(())
}

pub fn would_block(err: &io::Error) -> bool {
    err.kind() == io::ErrorKind::WouldBlock
}

pub fn interrupted(err: &io::Error) -> bool {
    err.kind() == io::ErrorKind::Interrupted
}
