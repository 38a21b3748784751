//! Process hardening applied before any key material is loaded.
//!
//! - [`disable_core_dumps`] sets `RLIMIT_CORE` to 0 so a crash never writes
//!   the master key, keyring KEKs or in-flight plaintext to disk.
//! - [`lock_memory`] pins every current and future page with `mlockall` so
//!   none of it is swapped out.
//!
//! Both are no-ops off Unix.

use std::io;

/// # Errors
///
/// Returns the OS error if `setrlimit` fails.
#[cfg(unix)]
pub fn disable_core_dumps() -> io::Result<()> {
    let limit = libc::rlimit {
        rlim_cur: 0,
        rlim_max: 0,
    };
    // SAFETY: `setrlimit` reads a valid, fully initialised `rlimit` and only
    // changes this process's core-dump limit.
    #[allow(unsafe_code)]
    let rc = unsafe { libc::setrlimit(libc::RLIMIT_CORE, &limit) };
    if rc == 0 { Ok(()) } else { Err(io::Error::last_os_error()) }
}

#[cfg(not(unix))]
pub fn disable_core_dumps() -> io::Result<()> {
    Ok(())
}

/// Needs `CAP_IPC_LOCK` or root on Linux. Set `TOKENVAULT_DISABLE_MLOCK=true`
/// to skip in development.
///
/// # Errors
///
/// Returns the OS error if `mlockall` fails.
#[cfg(unix)]
pub fn lock_memory() -> io::Result<()> {
    // SAFETY: `mlockall` takes only flag bits and touches no Rust-visible
    // memory.
    #[allow(unsafe_code)]
    let rc = unsafe { libc::mlockall(libc::MCL_CURRENT | libc::MCL_FUTURE) };
    if rc == 0 { Ok(()) } else { Err(io::Error::last_os_error()) }
}

#[cfg(not(unix))]
pub fn lock_memory() -> io::Result<()> {
    Ok(())
}

/// Apply every hardening step. Failures do not stop startup; they come back
/// as warnings for the caller to log once logging is up.
#[must_use]
pub fn apply(disable_mlock: bool) -> Vec<String> {
    let mut warnings = Vec::new();
    if let Err(e) = disable_core_dumps() {
        warnings.push(format!("failed to disable core dumps: {e}"));
    }
    if disable_mlock {
        warnings.push("mlock disabled via TOKENVAULT_DISABLE_MLOCK, keys may be swapped to disk".to_owned());
    } else if let Err(e) = lock_memory() {
        warnings.push(format!(
            "failed to lock memory: {e} (set TOKENVAULT_DISABLE_MLOCK=true for dev)"
        ));
    }
    warnings
}
