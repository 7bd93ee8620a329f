//! Process lockdown.
//!
//! A secrets server must not leak key material through the operating
//! system: core dump files can contain the keyring, and swapped-out pages
//! can land unseal keys on disk. [`Hardening`] bundles the countermeasures
//! and applies them once in `main()`, before any key exists in memory.
//!
//! Everything here degrades to a warning rather than a hard failure —
//! development boxes rarely grant `CAP_IPC_LOCK` — and the operator
//! decides how loudly to react. On non-Unix platforms the lockdown is a
//! no-op.

use crate::config::ServerConfig;

/// The lockdown steps derived from server configuration.
#[derive(Debug, Clone, Copy)]
pub struct Hardening {
    /// Memory pinning can be opted out of for development
    /// (`disable_mlock` in the config file).
    skip_mlock: bool,
}

impl Hardening {
    /// Derive the lockdown plan from the loaded configuration.
    #[must_use]
    pub fn from_config(config: &ServerConfig) -> Self {
        Self {
            skip_mlock: config.disable_mlock,
        }
    }

    /// Apply every step, collecting warnings for anything that could not
    /// be enforced. Logging is not initialized when this runs, so the
    /// caller reports the warnings itself.
    #[must_use]
    pub fn apply(self) -> Vec<String> {
        let mut warnings = Vec::new();

        if let Some(problem) = forbid_core_dumps() {
            warnings.push(problem);
        }

        if self.skip_mlock {
            warnings
                .push("memory pinning disabled by config; key material may reach swap".to_owned());
        } else if let Some(problem) = pin_memory() {
            warnings.push(format!(
                "{problem} (set 'disable_mlock' for development without CAP_IPC_LOCK)"
            ));
        }

        warnings
    }
}

/// Zero `RLIMIT_CORE` so the kernel never writes a dump of this process.
/// Returns a warning string on failure.
#[cfg(unix)]
fn forbid_core_dumps() -> Option<String> {
    let zeroed = libc::rlimit {
        rlim_cur: 0,
        rlim_max: 0,
    };
    // SAFETY: `setrlimit` only adjusts this process's resource limits;
    // the struct passed is fully initialized and the call has no memory
    // safety implications.
    #[allow(unsafe_code)]
    let rc = unsafe { libc::setrlimit(libc::RLIMIT_CORE, &zeroed) };
    (rc != 0).then(|| {
        format!(
            "could not zero RLIMIT_CORE: {}",
            std::io::Error::last_os_error()
        )
    })
}

/// Pin all current and future pages so key material cannot be swapped
/// out. Returns a warning string on failure (usually missing
/// `CAP_IPC_LOCK`).
#[cfg(unix)]
fn pin_memory() -> Option<String> {
    // SAFETY: `mlockall` instructs the kernel to keep this process's
    // pages resident; the flags are well-defined constants and failure is
    // reported via errno.
    #[allow(unsafe_code)]
    let rc = unsafe { libc::mlockall(libc::MCL_CURRENT | libc::MCL_FUTURE) };
    (rc != 0).then(|| {
        format!(
            "could not pin process memory: {}",
            std::io::Error::last_os_error()
        )
    })
}

#[cfg(not(unix))]
fn forbid_core_dumps() -> Option<String> {
    None
}

#[cfg(not(unix))]
fn pin_memory() -> Option<String> {
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn skipping_mlock_is_reported() {
        let mut config = ServerConfig::dev_default();
        config.disable_mlock = true;
        let warnings = Hardening::from_config(&config).apply();
        assert!(
            warnings
                .iter()
                .any(|w| w.contains("memory pinning disabled"))
        );
    }
}
