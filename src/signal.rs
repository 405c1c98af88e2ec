//! Ctrl-C handling
//!
//! The first SIGINT requests cancellation: the current step finishes and its
//! result is recorded before the run stops. The handler then restores the
//! default disposition, so a second Ctrl-C terminates immediately.

use anyhow::Result;
use converge::CancelToken;
use std::sync::OnceLock;

static CANCEL: OnceLock<CancelToken> = OnceLock::new();

/// Route SIGINT to `token`
pub fn install(token: &CancelToken) -> Result<()> {
    if CANCEL.set(token.clone()).is_err() {
        anyhow::bail!("interrupt handler already installed");
    }
    install_handler()
}

#[cfg(unix)]
extern "C" fn on_sigint(_signal: libc::c_int) {
    if let Some(token) = CANCEL.get() {
        token.cancel();
    }
    // SAFETY: signal() is async-signal-safe
    unsafe {
        libc::signal(libc::SIGINT, libc::SIG_DFL);
    }
}

#[cfg(unix)]
fn install_handler() -> Result<()> {
    let handler = on_sigint as extern "C" fn(libc::c_int);
    // SAFETY: the handler only touches atomics and signal(); both are async-signal-safe
    let previous = unsafe { libc::signal(libc::SIGINT, handler as libc::sighandler_t) };
    if previous == libc::SIG_ERR {
        anyhow::bail!(
            "failed to install SIGINT handler: {}",
            std::io::Error::last_os_error()
        );
    }
    log::debug!("SIGINT handler installed");
    Ok(())
}

#[cfg(not(unix))]
fn install_handler() -> Result<()> {
    log::debug!("Interrupt handling not supported on this platform");
    Ok(())
}
