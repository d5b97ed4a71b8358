use std::sync::{LazyLock, Mutex};

/// Serializes tests that mutate `AGENTQ_*` variables.
pub(crate) static ENV_LOCK: LazyLock<Mutex<()>> = LazyLock::new(|| Mutex::new(()));

/// Sets or clears one variable, restoring the previous value on drop.
pub(crate) struct EnvVarGuard {
    key: &'static str,
    previous: Option<String>,
}

impl EnvVarGuard {
    pub(crate) fn set(key: &'static str, value: &str) -> Self {
        let previous = std::env::var(key).ok();
        // SAFETY: callers hold ENV_LOCK, so no other test touches the
        // process environment concurrently.
        unsafe {
            std::env::set_var(key, value);
        }
        Self { key, previous }
    }

    pub(crate) fn unset(key: &'static str) -> Self {
        let previous = std::env::var(key).ok();
        // SAFETY: as in `set`; ENV_LOCK is held by the caller.
        unsafe {
            std::env::remove_var(key);
        }
        Self { key, previous }
    }
}

impl Drop for EnvVarGuard {
    fn drop(&mut self) {
        if let Some(value) = &self.previous {
            // SAFETY: the guard drops before the test releases ENV_LOCK.
            unsafe {
                std::env::set_var(self.key, value);
            }
        } else {
            // SAFETY: as above.
            unsafe {
                std::env::remove_var(self.key);
            }
        }
    }
}
