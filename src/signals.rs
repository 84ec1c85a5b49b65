//! Signal bridge: termination and broken-pipe signals become a byte on
//! the wake pipe plus, for termination, a flag the loop checks between
//! iterations (spec §4.6).

use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::Mutex;

use lazy_static::lazy_static;
use nix::sys::signal::{self, SaFlags, SigAction, SigHandler, SigSet, Signal};
use nix::unistd::write;

use crate::error::{Error, Result};

static SHOULD_QUIT: AtomicBool = AtomicBool::new(false);
static WAKE_WRITE_FD: AtomicI32 = AtomicI32::new(-1);

/// The handlers `install` replaced, saved so `uninstall` can put them
/// back, mirroring `notifier_install`/`notifier_uninstall`'s
/// `g_old_int`/`g_old_term`/`g_old_pipe` in the original.
struct PriorHandlers {
    sigint: SigAction,
    sigterm: SigAction,
    sigpipe: SigAction,
}

lazy_static! {
    static ref PRIOR_HANDLERS: Mutex<Option<PriorHandlers>> = Mutex::new(None);
}

pub fn should_quit() -> bool {
    SHOULD_QUIT.load(Ordering::SeqCst)
}

pub fn reset_should_quit() {
    SHOULD_QUIT.store(false, Ordering::SeqCst);
}

fn wake() {
    let fd = WAKE_WRITE_FD.load(Ordering::SeqCst);
    if fd >= 0 {
        let _ = write(fd, &[0u8]);
    }
}

extern "C" fn handle_termination(_: libc::c_int) {
    SHOULD_QUIT.store(true, Ordering::SeqCst);
    wake();
}

extern "C" fn handle_broken_pipe(_: libc::c_int) {
    wake();
}

/// Installs SIGINT/SIGTERM/SIGPIPE handlers. `wake_write_fd` is the
/// write end of the self-pipe the event loop polls; handlers only ever
/// set an atomic flag and perform one `write(2)`, both signal-safe.
pub fn install(wake_write_fd: RawFd) -> Result<()> {
    WAKE_WRITE_FD.store(wake_write_fd, Ordering::SeqCst);

    let term_action = SigAction::new(
        SigHandler::Handler(handle_termination),
        SaFlags::empty(),
        SigSet::empty(),
    );
    let pipe_action = SigAction::new(
        SigHandler::Handler(handle_broken_pipe),
        SaFlags::empty(),
        SigSet::empty(),
    );

    let (old_sigint, old_sigterm, old_sigpipe) = unsafe {
        let old_sigint = signal::sigaction(Signal::SIGINT, &term_action)
            .map_err(|e| Error::Protocol(format!("sigaction(SIGINT): {}", e)))?;
        let old_sigterm = signal::sigaction(Signal::SIGTERM, &term_action)
            .map_err(|e| Error::Protocol(format!("sigaction(SIGTERM): {}", e)))?;
        let old_sigpipe = signal::sigaction(Signal::SIGPIPE, &pipe_action)
            .map_err(|e| Error::Protocol(format!("sigaction(SIGPIPE): {}", e)))?;
        (old_sigint, old_sigterm, old_sigpipe)
    };

    *PRIOR_HANDLERS.lock().unwrap() = Some(PriorHandlers {
        sigint: old_sigint,
        sigterm: old_sigterm,
        sigpipe: old_sigpipe,
    });
    Ok(())
}

/// Restores whatever SIGINT/SIGTERM/SIGPIPE handlers were in place
/// before `install`, and clears the wake fd so a stray signal after
/// uninstall can't write to a descriptor that's about to close.
pub fn uninstall() -> Result<()> {
    let prior = PRIOR_HANDLERS.lock().unwrap().take();
    if let Some(prior) = prior {
        unsafe {
            signal::sigaction(Signal::SIGINT, &prior.sigint)
                .map_err(|e| Error::Protocol(format!("sigaction(SIGINT): {}", e)))?;
            signal::sigaction(Signal::SIGTERM, &prior.sigterm)
                .map_err(|e| Error::Protocol(format!("sigaction(SIGTERM): {}", e)))?;
            signal::sigaction(Signal::SIGPIPE, &prior.sigpipe)
                .map_err(|e| Error::Protocol(format!("sigaction(SIGPIPE): {}", e)))?;
        }
    }
    WAKE_WRITE_FD.store(-1, Ordering::SeqCst);
    Ok(())
}
