//! SIGINT drain: workers finish their current unit and stop.
//!
//! The handler only flips an atomic; everything else polls.  Output already
//! on stdout stays (stream semantics); `--outfile` output is never persisted
//! after an interrupt because the run no longer counts as a full success.

use std::sync::atomic::{AtomicBool, Ordering};

static INTERRUPTED: AtomicBool = AtomicBool::new(false);

#[cfg(unix)]
extern "C" fn on_sigint(_: libc::c_int) {
    INTERRUPTED.store(true, Ordering::SeqCst);
}

/// Install the SIGINT handler.  Call once from the binary entry point.
#[cfg(unix)]
pub fn install() {
    unsafe {
        libc::signal(libc::SIGINT, on_sigint as libc::sighandler_t);
    }
}

#[cfg(not(unix))]
pub fn install() {}

/// True once the user has interrupted; workers drain instead of starting
/// new work.
pub fn interrupted() -> bool {
    INTERRUPTED.load(Ordering::SeqCst)
}
