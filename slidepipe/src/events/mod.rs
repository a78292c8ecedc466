//! Event sinks for pipeline observability.
//!
//! The orchestrator emits `pipeline.started`, `stage.started`,
//! `stage.completed`, `stage.skipped`, `stage.failed`, `pipeline.aborted`
//! and `pipeline.finished` to an [`EventSink`].

mod sink;

pub use sink::{
    CollectingEventSink, CompositeEventSink, EventSink, JsonlEventSink, LoggingEventSink,
    NoOpEventSink,
};

use parking_lot::RwLock;
use std::sync::Arc;

static GLOBAL_EVENT_SINK: RwLock<Option<Arc<dyn EventSink>>> = RwLock::new(None);

/// Sets the process-wide default event sink.
pub fn set_event_sink(sink: Arc<dyn EventSink>) {
    *GLOBAL_EVENT_SINK.write() = Some(sink);
}

/// Clears the process-wide default event sink.
pub fn clear_event_sink() {
    *GLOBAL_EVENT_SINK.write() = None;
}

/// Gets the process-wide default event sink.
///
/// Returns a `NoOpEventSink` if no sink is set.
pub fn get_event_sink() -> Arc<dyn EventSink> {
    GLOBAL_EVENT_SINK
        .read()
        .clone()
        .unwrap_or_else(|| Arc::new(NoOpEventSink))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_global_sink_round_trip() {
        let collecting = Arc::new(CollectingEventSink::new());
        set_event_sink(collecting.clone());
        get_event_sink().try_emit("stage.started", None);
        clear_event_sink();
        get_event_sink().try_emit("stage.completed", None);

        assert_eq!(collecting.len(), 1);
    }
}
