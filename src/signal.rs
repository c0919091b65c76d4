//! Operator-interrupt handling.
//!
//! SIGINT and SIGTERM are installed without `SA_RESTART` so a blocking
//! poll returns `EINTR` and the event loop re-checks its shutdown flag.
//! The handler itself only sets the flag and wakes the poll, both of
//! which are async-signal-safe.

use crate::runtime::ShutdownHandle;
use std::io;
use std::sync::OnceLock;

static SHUTDOWN_HANDLE: OnceLock<ShutdownHandle> = OnceLock::new();

/// Install SIGINT/SIGTERM handlers that request shutdown through `handle`.
///
/// May only be called once per process.
pub fn install(handle: ShutdownHandle) -> io::Result<()> {
    if SHUTDOWN_HANDLE.set(handle).is_err() {
        return Err(io::Error::new(
            io::ErrorKind::AlreadyExists,
            "signal handlers already installed",
        ));
    }

    let handler: extern "C" fn(libc::c_int) = on_signal;

    unsafe {
        let mut action: libc::sigaction = std::mem::zeroed();
        action.sa_sigaction = handler as libc::sighandler_t;
        libc::sigemptyset(&mut action.sa_mask);
        action.sa_flags = 0;

        for sig in [libc::SIGINT, libc::SIGTERM] {
            if libc::sigaction(sig, &action, std::ptr::null_mut()) != 0 {
                return Err(io::Error::last_os_error());
            }
        }
    }

    Ok(())
}

extern "C" fn on_signal(_sig: libc::c_int) {
    if let Some(handle) = SHUTDOWN_HANDLE.get() {
        handle.request();
    }
}
