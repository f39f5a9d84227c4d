use crate::point::PointRecord;
use crossbeam_channel::{Receiver, Sender};
use log::trace;
use std::sync::{Arc, Mutex};

/// Max number of undelivered events per subscriber, before point batches and progress reports
/// are dropped for that subscriber. All other events are always delivered.
pub const MAX_PENDING_EVENTS: usize = 256;

/// Notifications sent by the editor and its worker thread.
#[derive(Debug, Clone)]
pub enum EditorEvent {
    /// A dataset was opened, removed or changed its visibility.
    DatasetsChanged,

    /// Points of the running viewport query.
    ViewportPoints(Arc<Vec<PointRecord>>),

    /// The viewport query returned all of its points.
    ViewportFinished { nr_points: u64 },

    ActionProgress { action: String, progress: f64 },
    ActionFinished { action: String },

    /// The action was stopped before it finished, because another task replaced it
    /// or the worker was cancelled.
    ActionCancelled { action: String },

    /// Some background work failed and was stopped.
    Error(String),
}

/// Fans events out to all subscribers.
#[derive(Clone, Default)]
pub struct EventBus {
    subscribers: Arc<Mutex<Vec<Sender<EditorEvent>>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a receiver for all events emitted from now on.
    /// Dropping the receiver unsubscribes.
    pub fn subscribe(&self) -> Receiver<EditorEvent> {
        let (sender, receiver) = crossbeam_channel::unbounded();
        self.subscribers.lock().unwrap().push(sender);
        receiver
    }

    /// Sends the event to all subscribers. Point batches and progress reports are skipped for
    /// subscribers that lag behind by [MAX_PENDING_EVENTS] or more events.
    pub fn emit(&self, event: EditorEvent) {
        let droppable = matches!(
            event,
            EditorEvent::ViewportPoints(_) | EditorEvent::ActionProgress { .. }
        );
        let mut subscribers = self.subscribers.lock().unwrap();
        subscribers.retain(|s| {
            if droppable && s.len() >= MAX_PENDING_EVENTS {
                trace!("Subscriber is full, dropping an event.");
                return true;
            }
            s.send(event.clone()).is_ok()
        });
    }

    pub fn nr_subscribers(&self) -> usize {
        self.subscribers.lock().unwrap().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fan_out_and_unsubscribe() {
        let bus = EventBus::new();
        let a = bus.subscribe();
        let b = bus.subscribe();
        bus.emit(EditorEvent::DatasetsChanged);
        assert!(matches!(a.try_recv(), Ok(EditorEvent::DatasetsChanged)));
        assert!(matches!(b.try_recv(), Ok(EditorEvent::DatasetsChanged)));

        drop(a);
        bus.emit(EditorEvent::Error("x".to_string()));
        assert_eq!(bus.nr_subscribers(), 1);
        assert!(matches!(b.try_recv(), Ok(EditorEvent::Error(m)) if m == "x"));
        assert!(b.try_recv().is_err());
    }

    #[test]
    fn idle_subscriber_does_not_accumulate_points() {
        let bus = EventBus::new();
        let idle = bus.subscribe();
        let reader = bus.subscribe();
        let batch = Arc::new(Vec::new());
        let mut received = 0;
        for i in 0..5000 {
            bus.emit(EditorEvent::ViewportPoints(Arc::clone(&batch)));
            if i % 1000 == 0 {
                bus.emit(EditorEvent::ActionProgress {
                    action: "a".to_string(),
                    progress: i as f64 / 5000.0,
                });
            }
            received += reader.try_iter().count();
        }
        bus.emit(EditorEvent::ViewportFinished { nr_points: 5000 });

        // a subscriber that keeps up gets everything
        received += reader.try_iter().count();
        assert_eq!(received, 5000 + 5 + 1);

        // the idle one is capped, but stays subscribed and still gets the final event
        assert_eq!(bus.nr_subscribers(), 2);
        let pending = idle.try_iter().collect::<Vec<_>>();
        assert_eq!(pending.len(), MAX_PENDING_EVENTS + 1);
        let nr_progress = pending
            .iter()
            .filter(|e| matches!(e, EditorEvent::ActionProgress { .. }))
            .count();
        assert_eq!(nr_progress, 1);
        assert!(matches!(
            pending.last(),
            Some(EditorEvent::ViewportFinished { nr_points: 5000 })
        ));
    }
}
