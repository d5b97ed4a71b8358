use super::traits::{Observer, WorkerEvent};

/// Observer that drops every event
pub struct NoopObserver;

impl Observer for NoopObserver {
    #[inline(always)]
    fn record_event(&self, _event: &WorkerEvent) {}

    fn name(&self) -> &str {
        "noop"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn noop_name() {
        assert_eq!(NoopObserver.name(), "noop");
    }

    #[test]
    fn noop_record_event_does_not_panic() {
        let obs = NoopObserver;
        obs.record_event(&WorkerEvent::ShutdownRequested {
            worker_id: "w".into(),
        });
        obs.flush();
    }
}
