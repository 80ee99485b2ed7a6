//! Observer registry and event dispatch.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::frame::Frame;

/// Pattern matching every event name.
pub const WILDCARD: &str = "*";

/// Handle identifying a single observer registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObserverId(u64);

type Callback = Arc<dyn Fn(&Frame) -> Result<()> + Send + Sync>;

enum Pattern {
    Exact(String),
    Any,
}

impl Pattern {
    fn matches(&self, event_name: &str) -> bool {
        match self {
            Pattern::Any => true,
            Pattern::Exact(name) => name.eq_ignore_ascii_case(event_name),
        }
    }
}

struct Registration {
    id: u64,
    pattern: Pattern,
    callback: Callback,
}

/// Routes event frames to registered observers.
///
/// Registrations are kept in registration order and dispatch calls every
/// matching observer in that order: exact-name matches and wildcard
/// registrations alike. Observer failures (an `Err` return or a panic)
/// are logged and isolated; they never reach the frame loop and never
/// prevent delivery to later observers.
pub struct EventRouter {
    registrations: Mutex<Vec<Registration>>,
    next_id: AtomicU64,
}

impl EventRouter {
    /// Create an empty router.
    pub fn new() -> Self {
        Self {
            registrations: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Register an observer for `event`: an event name such as
    /// `CHANNEL_HANGUP` (compared case-insensitively) or [`WILDCARD`] to
    /// observe every event.
    pub fn subscribe<F>(&self, event: &str, callback: F) -> ObserverId
    where
        F: Fn(&Frame) -> Result<()> + Send + Sync + 'static,
    {
        let pattern = if event == WILDCARD {
            Pattern::Any
        } else {
            Pattern::Exact(event.to_string())
        };
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.lock().push(Registration {
            id,
            pattern,
            callback: Arc::new(callback),
        });
        ObserverId(id)
    }

    /// Remove a registration. Returns `false` if the id was not found.
    pub fn unsubscribe(&self, id: ObserverId) -> bool {
        let mut registrations = self.lock();
        let before = registrations.len();
        registrations.retain(|r| r.id != id.0);
        registrations.len() != before
    }

    /// Number of live registrations.
    pub fn observer_count(&self) -> usize {
        self.lock().len()
    }

    /// Deliver an event frame to every matching observer, in registration
    /// order. Fire-and-forget: failures are logged per observer and the
    /// remaining observers still run.
    pub(crate) fn dispatch(&self, frame: &Frame) {
        let Some(event_name) = frame.event_name().map(str::to_string) else {
            return;
        };

        // Callbacks run outside the lock so an observer may unsubscribe
        // (itself included) during dispatch.
        let matching: Vec<Callback> = self
            .lock()
            .iter()
            .filter(|r| r.pattern.matches(&event_name))
            .map(|r| Arc::clone(&r.callback))
            .collect();

        debug!(event = %event_name, observers = matching.len(), "dispatching event");
        for callback in matching {
            match catch_unwind(AssertUnwindSafe(|| callback(frame))) {
                Ok(Ok(())) => {}
                Ok(Err(error)) => {
                    warn!(event = %event_name, %error, "observer failed");
                }
                Err(panic) => {
                    let error = Error::observer(panic_message(panic));
                    warn!(event = %event_name, %error, "observer panicked");
                }
            }
        }
    }

    fn lock(&self) -> MutexGuard<'_, Vec<Registration>> {
        self.registrations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for EventRouter {
    fn default() -> Self {
        Self::new()
    }
}

fn panic_message(panic: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::HeaderMap;

    fn event(name: &str) -> Frame {
        let mut headers = HeaderMap::new();
        headers.insert("Content-Type", "text/event-plain");
        Frame::new(headers, format!("Event-Name: {name}\n"))
    }

    fn recorder(log: &Arc<Mutex<Vec<String>>>, tag: &str) -> impl Fn(&Frame) -> Result<()> {
        let log = Arc::clone(log);
        let tag = tag.to_string();
        move |_frame| {
            log.lock().unwrap().push(tag.clone());
            Ok(())
        }
    }

    #[test]
    fn test_exact_and_wildcard_in_registration_order() {
        let router = EventRouter::new();
        let log = Arc::new(Mutex::new(Vec::new()));

        router.subscribe("CHANNEL_ANSWER", recorder(&log, "exact"));
        router.subscribe(WILDCARD, recorder(&log, "wildcard"));
        router.subscribe("channel_answer", recorder(&log, "lowercase"));

        router.dispatch(&event("CHANNEL_ANSWER"));
        assert_eq!(
            *log.lock().unwrap(),
            vec!["exact", "wildcard", "lowercase"]
        );
    }

    #[test]
    fn test_non_matching_observers_not_called() {
        let router = EventRouter::new();
        let log = Arc::new(Mutex::new(Vec::new()));

        router.subscribe("CHANNEL_HANGUP", recorder(&log, "hangup"));
        router.dispatch(&event("HEARTBEAT"));
        assert!(log.lock().unwrap().is_empty());
    }

    #[test]
    fn test_unsubscribe() {
        let router = EventRouter::new();
        let log = Arc::new(Mutex::new(Vec::new()));

        let id = router.subscribe("DTMF", recorder(&log, "first"));
        router.subscribe("DTMF", recorder(&log, "second"));

        assert!(router.unsubscribe(id));
        assert!(!router.unsubscribe(id));
        assert_eq!(router.observer_count(), 1);

        router.dispatch(&event("DTMF"));
        assert_eq!(*log.lock().unwrap(), vec!["second"]);
    }

    #[test]
    fn test_failing_observer_does_not_block_later_ones() {
        let router = EventRouter::new();
        let log = Arc::new(Mutex::new(Vec::new()));

        router.subscribe(WILDCARD, |_frame| {
            Err(Error::observer("deliberate failure"))
        });
        router.subscribe(WILDCARD, recorder(&log, "after-error"));

        router.dispatch(&event("HEARTBEAT"));
        assert_eq!(*log.lock().unwrap(), vec!["after-error"]);
    }

    #[test]
    fn test_panicking_observer_is_isolated() {
        let router = EventRouter::new();
        let log = Arc::new(Mutex::new(Vec::new()));

        router.subscribe(WILDCARD, |_frame| panic!("observer exploded"));
        router.subscribe(WILDCARD, recorder(&log, "survivor"));

        router.dispatch(&event("HEARTBEAT"));
        router.dispatch(&event("HEARTBEAT"));
        assert_eq!(*log.lock().unwrap(), vec!["survivor", "survivor"]);
    }

    #[test]
    fn test_observer_can_unsubscribe_itself_during_dispatch() {
        let router = Arc::new(EventRouter::new());
        let slot: Arc<Mutex<Option<ObserverId>>> = Arc::new(Mutex::new(None));

        let router2 = Arc::clone(&router);
        let slot2 = Arc::clone(&slot);
        let id = router.subscribe("HEARTBEAT", move |_frame| {
            if let Some(id) = slot2.lock().unwrap().take() {
                router2.unsubscribe(id);
            }
            Ok(())
        });
        *slot.lock().unwrap() = Some(id);

        router.dispatch(&event("HEARTBEAT"));
        assert_eq!(router.observer_count(), 0);
    }

    #[test]
    fn test_dispatch_ignores_frames_without_event_name() {
        let router = EventRouter::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        router.subscribe(WILDCARD, recorder(&log, "any"));

        let frame = Frame::new(HeaderMap::new(), "plain text".to_string());
        router.dispatch(&frame);
        assert!(log.lock().unwrap().is_empty());
    }
}
