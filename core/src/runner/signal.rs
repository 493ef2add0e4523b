//! Thin wrappers over `kill(2)`/`killpg(2)`. Candidates are spawned as
//! process-group leaders, so the group id equals the child's pid.

use std::io;

#[cfg(unix)]
fn check(ret: libc::c_int) -> io::Result<()> {
    if ret == 0 {
        return Ok(());
    }
    let e = io::Error::last_os_error();
    // already gone
    if e.raw_os_error() == Some(libc::ESRCH) {
        Ok(())
    } else {
        Err(e)
    }
}

#[cfg(unix)]
pub fn suspend(pid: u32) -> io::Result<()> {
    check(unsafe { libc::kill(pid as libc::pid_t, libc::SIGSTOP) })
}

#[cfg(unix)]
pub fn resume(pid: u32) -> io::Result<()> {
    check(unsafe { libc::kill(pid as libc::pid_t, libc::SIGCONT) })
}

#[cfg(unix)]
pub fn kill_group(pid: u32) -> io::Result<()> {
    check(unsafe { libc::killpg(pid as libc::pid_t, libc::SIGKILL) })
}

#[cfg(not(unix))]
pub fn suspend(_pid: u32) -> io::Result<()> {
    Err(io::ErrorKind::Unsupported.into())
}

#[cfg(not(unix))]
pub fn resume(_pid: u32) -> io::Result<()> {
    Err(io::ErrorKind::Unsupported.into())
}

#[cfg(not(unix))]
pub fn kill_group(_pid: u32) -> io::Result<()> {
    Ok(())
}

/// True when the process was stopped by an interrupt/terminate request
/// that did not come from us.
pub fn is_interrupt(status: &std::process::ExitStatus) -> bool {
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        matches!(status.signal(), Some(libc::SIGINT) | Some(libc::SIGTERM))
    }
    #[cfg(not(unix))]
    {
        let _ = status;
        false
    }
}
