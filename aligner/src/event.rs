use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};

use crate::axis::{DisplayMode, OverlapMode};
use crate::pipeline::StageId;
use crate::session::SliceDisplayMode;
use crate::slice::SliceId;

#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    SliceCreated {
        slice_id: SliceId,
    },
    SliceDeleted {
        slice_id: SliceId,
    },
    PositionChanged {
        slice_id: SliceId,
        axis_position: f64,
    },
    VisibilityChanged {
        slice_id: SliceId,
        visible: bool,
    },
    SelectionChanged {
        slice_id: SliceId,
        selected: bool,
    },
    CurrentSlice {
        slice_id: SliceId,
    },
    ModeChanged {
        old: DisplayMode,
        new: DisplayMode,
    },
    SliceDisplayModeChanged {
        old: SliceDisplayMode,
        new: SliceDisplayMode,
    },
    OverlapModeChanged {
        old: OverlapMode,
        new: OverlapMode,
    },
    StageApplied {
        slice_id: SliceId,
        stage_id: StageId,
        name: String,
    },
    StageFailed {
        slice_id: SliceId,
        stage_id: StageId,
        name: String,
    },
    StageCancelled {
        slice_id: SliceId,
        stage_id: StageId,
        name: String,
    },
    ExportRequested {
        slice_id: SliceId,
        target: String,
    },
    Warning {
        title: String,
        message: String,
    },
}

/// Fan-out of session events to any number of subscribers.
///
/// Closed receivers are pruned on the next emit.
#[derive(Debug, Clone, Default)]
pub struct EventBus {
    subscribers: Arc<Mutex<Vec<UnboundedSender<SessionEvent>>>>,
}

impl EventBus {
    pub fn subscribe(&self) -> UnboundedReceiver<SessionEvent> {
        let (tx, rx) = unbounded_channel();
        self.subscribers.lock().push(tx);
        rx
    }

    pub fn emit(&self, event: SessionEvent) {
        tracing::trace!(?event, "session event");
        self.subscribers
            .lock()
            .retain(|tx| tx.send(event.clone()).is_ok());
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_subscriber_receives_events() {
        let bus = EventBus::default();
        let mut first = bus.subscribe();
        let mut second = bus.subscribe();

        let slice_id = SliceId::unique();
        bus.emit(SessionEvent::SliceCreated { slice_id });

        assert_eq!(
            first.try_recv().unwrap(),
            SessionEvent::SliceCreated { slice_id }
        );
        assert_eq!(
            second.try_recv().unwrap(),
            SessionEvent::SliceCreated { slice_id }
        );
    }

    #[test]
    fn dropped_subscribers_are_pruned() {
        let bus = EventBus::default();
        let kept = bus.subscribe();
        drop(bus.subscribe());
        assert_eq!(bus.subscriber_count(), 2);

        bus.emit(SessionEvent::Warning {
            title: "t".into(),
            message: "m".into(),
        });
        assert_eq!(bus.subscriber_count(), 1);
        drop(kept);
    }
}
