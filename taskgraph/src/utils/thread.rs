use std::io;

/// Sets the nice value of the calling thread.
///
/// Linux schedules threads individually, so `setpriority` on the thread id only
/// affects the caller. Raising priority (negative values) usually requires
/// `CAP_SYS_NICE`, callers should treat failures as best effort.
#[cfg(target_os = "linux")]
pub(crate) fn set_current_thread_nice(nice: i32) -> io::Result<()> {
    let tid = unsafe { libc::syscall(libc::SYS_gettid) } as libc::id_t;
    let ret = unsafe { libc::setpriority(libc::PRIO_PROCESS, tid, nice) };

    if ret != 0 {
        return Err(io::Error::last_os_error());
    }

    Ok(())
}

#[cfg(not(target_os = "linux"))]
pub(crate) fn set_current_thread_nice(_nice: i32) -> io::Result<()> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "per-thread nice values are only supported on linux",
    ))
}

/// Returns the nice value of the calling thread.
#[cfg(all(test, target_os = "linux"))]
pub(crate) fn current_thread_nice() -> io::Result<i32> {
    let tid = unsafe { libc::syscall(libc::SYS_gettid) } as libc::id_t;

    // -1 is a valid priority, errno is the only way to tell.
    unsafe { *libc::__errno_location() = 0 };
    let ret = unsafe { libc::getpriority(libc::PRIO_PROCESS, tid) };

    match io::Error::last_os_error().raw_os_error() {
        Some(0) | None => Ok(ret),
        Some(_) => Err(io::Error::last_os_error()),
    }
}
