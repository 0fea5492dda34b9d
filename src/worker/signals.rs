use std::sync::atomic::{AtomicBool, Ordering};

use nix::sys::signal::{SaFlags, SigAction, SigHandler, SigSet, Signal, sigaction};

static EXIT_FLAG: AtomicBool = AtomicBool::new(false);
static QUIT_FLAG: AtomicBool = AtomicBool::new(false);

extern "C" fn on_terminate(_sig: libc::c_int) {
    EXIT_FLAG.store(true, Ordering::SeqCst);
}

extern "C" fn on_quit(_sig: libc::c_int) {
    QUIT_FLAG.store(true, Ordering::SeqCst);
    EXIT_FLAG.store(true, Ordering::SeqCst);
}

/// Install the worker's termination handlers: INT/TERM/HUP request a clean
/// stop at the next safe point (between chunks), QUIT marks the run as
/// abnormal. SEGV/BUS keep their default disposition — the kernel releases
/// our byte-range locks and the dispatcher reaps the slot, which is the
/// whole crash-safety story.
pub fn install_worker_handlers() {
    let term = SigAction::new(SigHandler::Handler(on_terminate), SaFlags::empty(), SigSet::empty());
    let quit = SigAction::new(SigHandler::Handler(on_quit), SaFlags::empty(), SigSet::empty());
    unsafe {
        let _ = sigaction(Signal::SIGINT, &term);
        let _ = sigaction(Signal::SIGTERM, &term);
        let _ = sigaction(Signal::SIGHUP, &term);
        let _ = sigaction(Signal::SIGQUIT, &quit);
    }
}

/// Checked between chunks and files; a set flag unwinds the engine through
/// its normal cleanup path.
pub fn exit_requested() -> bool {
    EXIT_FLAG.load(Ordering::SeqCst)
}

pub fn quit_requested() -> bool {
    QUIT_FLAG.load(Ordering::SeqCst)
}

/// Test hook; also used by the engine when a burst continuation re-arms a
/// worker that already saw a (handled) stop request.
pub fn reset_flags() {
    EXIT_FLAG.store(false, Ordering::SeqCst);
    QUIT_FLAG.store(false, Ordering::SeqCst);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_report_and_reset() {
        reset_flags();
        assert!(!exit_requested());
        on_terminate(libc::SIGTERM);
        assert!(exit_requested());
        assert!(!quit_requested());
        on_quit(libc::SIGQUIT);
        assert!(quit_requested());
        reset_flags();
        assert!(!exit_requested());
    }
}
