pub mod log;
pub mod noop;
pub mod traits;

pub use self::log::LogObserver;
pub use noop::NoopObserver;
pub use traits::{Observer, WorkerEvent};

use crate::config::ObservabilityConfig;

/// Factory: create the right observer from config
pub fn create_observer(config: &ObservabilityConfig) -> Box<dyn Observer> {
    match config.backend.as_str() {
        "log" => Box::new(LogObserver::new()),
        "none" | "noop" => Box::new(NoopObserver),
        _ => {
            tracing::warn!(
                "Unknown observability backend '{}', falling back to noop",
                config.backend
            );
            Box::new(NoopObserver)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn factory_selects_backend() {
        let observer = |backend: &str| {
            create_observer(&ObservabilityConfig {
                backend: backend.into(),
            })
        };
        assert_eq!(observer("log").name(), "log");
        assert_eq!(observer("none").name(), "noop");
        assert_eq!(observer("noop").name(), "noop");
        assert_eq!(observer("prometheus").name(), "noop");
    }
}
