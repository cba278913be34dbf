//! Process hardening: memory pinning and core dump prevention.
//!
//! On Unix systems this module provides two measures:
//!
//! 1. **`disable_core_dumps`**: sets `RLIMIT_CORE` to 0 so the OS never
//!    writes a core file that could contain the root key or unseal shares.
//!
//! 2. **`lock_memory`**: calls `mlockall(MCL_CURRENT | MCL_FUTURE)` to pin
//!    every page, so keyring terms are never swapped to disk.
//!
//! Both functions are no-ops on non-Unix platforms.

/// Disable core dumps by setting `RLIMIT_CORE` to 0.
///
/// Call this early in `main()` before any key is loaded into memory.
///
/// # Errors
///
/// Returns an error string if the `setrlimit` syscall fails.
#[cfg(unix)]
pub fn disable_core_dumps() -> Result<(), String> {
    // SAFETY: `setrlimit` only changes this process's resource limits. The
    // `rlimit` struct is fully initialized and outlives the call.
    #[allow(unsafe_code)]
    let result = unsafe {
        let rlim = libc::rlimit {
            rlim_cur: 0,
            rlim_max: 0,
        };
        libc::setrlimit(libc::RLIMIT_CORE, &rlim)
    };

    if result == 0 {
        Ok(())
    } else {
        Err(format!(
            "setrlimit(RLIMIT_CORE, 0) failed: {}",
            std::io::Error::last_os_error()
        ))
    }
}

/// No-op on non-Unix platforms.
#[cfg(not(unix))]
pub fn disable_core_dumps() -> Result<(), String> {
    Ok(())
}

/// Pin all current and future memory pages with `mlockall`.
///
/// Requires `CAP_IPC_LOCK` on Linux or running as root. In development, set
/// `CELLAR_DISABLE_MLOCK=true` to skip this step.
///
/// # Errors
///
/// Returns an error string if the `mlockall` syscall fails.
#[cfg(unix)]
pub fn lock_memory() -> Result<(), String> {
    // SAFETY: `mlockall` takes plain flags and touches no Rust-visible
    // memory; it only tells the kernel to keep pages resident.
    #[allow(unsafe_code)]
    let result = unsafe { libc::mlockall(libc::MCL_CURRENT | libc::MCL_FUTURE) };

    if result == 0 {
        Ok(())
    } else {
        Err(format!(
            "mlockall(MCL_CURRENT | MCL_FUTURE) failed: {}",
            std::io::Error::last_os_error()
        ))
    }
}

/// No-op on non-Unix platforms.
#[cfg(not(unix))]
pub fn lock_memory() -> Result<(), String> {
    Ok(())
}
