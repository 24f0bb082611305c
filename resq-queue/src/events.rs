//! Lifecycle hooks.
//!
//! Listeners are plain closures registered per [`Event`]. They run
//! synchronously, in registration order, on the task that fires the event. A
//! listener can veto the operation in progress by returning
//! [`Hook::DontCreate`] (from `beforeEnqueue`) or [`Hook::DontPerform`] (from
//! `beforePerform`); the first veto short-circuits the remaining listeners.
//! Any other answer is ignored and dispatch continues.

use dashmap::DashMap;
use resq_log::debug;
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::QueueError;
use crate::job::Job;
use crate::worker::Worker;

/// Points in the job lifecycle where listeners are invoked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Event {
    /// Before a job is pushed. May return [`Hook::DontCreate`].
    BeforeEnqueue,
    /// After a job has been pushed.
    AfterEnqueue,
    /// Once per worker, before the first reservation.
    BeforeFirstFork,
    /// Before a reserved job is handed to its isolated task.
    BeforeFork,
    /// Inside the isolated task, before the job runs.
    AfterFork,
    /// Before the handler runs. May return [`Hook::DontPerform`].
    BeforePerform,
    /// After the handler and its tear-down completed.
    AfterPerform,
    /// When a job is marked as failed.
    OnFailure,
}

impl Event {
    /// Every event, in lifecycle order.
    pub const ALL: [Event; 8] = [
        Event::BeforeEnqueue,
        Event::AfterEnqueue,
        Event::BeforeFirstFork,
        Event::BeforeFork,
        Event::AfterFork,
        Event::BeforePerform,
        Event::AfterPerform,
        Event::OnFailure,
    ];

    /// Canonical event name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Event::BeforeEnqueue => "beforeEnqueue",
            Event::AfterEnqueue => "afterEnqueue",
            Event::BeforeFirstFork => "beforeFirstFork",
            Event::BeforeFork => "beforeFork",
            Event::AfterFork => "afterFork",
            Event::BeforePerform => "beforePerform",
            Event::AfterPerform => "afterPerform",
            Event::OnFailure => "onFailure",
        }
    }

    /// The answer that vetoes this event, if it can be vetoed.
    pub fn veto(&self) -> Option<Hook> {
        match self {
            Event::BeforeEnqueue => Some(Hook::DontCreate),
            Event::BeforePerform => Some(Hook::DontPerform),
            _ => None,
        }
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Event {
    type Err = QueueError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Event::ALL
            .into_iter()
            .find(|event| event.as_str() == s)
            .ok_or_else(|| QueueError::Other(format!("Unknown event: {}", s)))
    }
}

/// What a listener asks of the operation that fired it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Hook {
    /// Carry on.
    #[default]
    Continue,
    /// Skip running the job. The job is not failed.
    DontPerform,
    /// Do not put the job on the queue.
    DontCreate,
}

/// Parameters of an enqueue, passed to `beforeEnqueue` and `afterEnqueue`.
#[derive(Debug, Clone)]
pub struct EnqueueParams {
    pub class: String,
    pub args: Option<Value>,
    pub queue: String,
    pub id: String,
}

/// Data handed to listeners.
pub enum EventData<'a> {
    /// `beforeEnqueue`, `afterEnqueue`
    Enqueue(&'a EnqueueParams),
    /// `beforeFork`, `afterFork`, `beforePerform`, `afterPerform`
    Job(&'a Job),
    /// `beforeFirstFork`
    Worker(&'a Worker),
    /// `onFailure`
    Failure { error: &'a QueueError, job: &'a Job },
}

impl EventData<'_> {
    /// The job this event concerns, if any.
    pub fn job(&self) -> Option<&Job> {
        match self {
            EventData::Job(job) | EventData::Failure { job, .. } => Some(*job),
            _ => None,
        }
    }
}

/// Handle returned by [`EventBus::listen`], used to unregister.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

type Listener = Arc<dyn Fn(&EventData<'_>) -> Hook + Send + Sync>;

/// Registry of lifecycle listeners.
///
/// Cloning is cheap and clones share the same registry.
#[derive(Clone, Default)]
pub struct EventBus {
    listeners: Arc<DashMap<Event, Vec<(ListenerId, Listener)>>>,
    next_id: Arc<AtomicU64>,
}

impl EventBus {
    /// Create an empty bus.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `listener` at the end of `event`'s listener list.
    ///
    /// # Examples
    ///
    /// ```
    /// use resq_queue::{Event, EventBus, EventData, Hook};
    ///
    /// let bus = EventBus::new();
    /// let id = bus.listen(Event::BeforePerform, |data| match data.job() {
    ///     Some(job) if job.class() == "Maintenance" => Hook::DontPerform,
    ///     _ => Hook::Continue,
    /// });
    /// assert_eq!(bus.listener_count(Event::BeforePerform), 1);
    ///
    /// bus.stop_listening(Event::BeforePerform, id);
    /// assert_eq!(bus.listener_count(Event::BeforePerform), 0);
    /// ```
    pub fn listen<F>(&self, event: Event, listener: F) -> ListenerId
    where
        F: Fn(&EventData<'_>) -> Hook + Send + Sync + 'static,
    {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.listeners
            .entry(event)
            .or_default()
            .push((id, Arc::new(listener)));

        debug!("Registered listener {:?} for {}", id, event);
        id
    }

    /// Remove a registration. Returns whether it was present.
    pub fn stop_listening(&self, event: Event, id: ListenerId) -> bool {
        let Some(mut listeners) = self.listeners.get_mut(&event) else {
            return false;
        };
        match listeners.iter().position(|(registered, _)| *registered == id) {
            Some(index) => {
                listeners.remove(index);
                true
            }
            None => false,
        }
    }

    /// Invoke every listener for `event` in registration order.
    ///
    /// Returns the event's veto as soon as a listener answers with it,
    /// skipping the listeners after it, or `Continue` when nobody objected.
    pub fn trigger(&self, event: Event, data: &EventData<'_>) -> Hook {
        // Snapshot so listeners may (un)register without deadlocking the map
        let listeners: Vec<Listener> = match self.listeners.get(&event) {
            Some(registered) => registered.iter().map(|(_, l)| l.clone()).collect(),
            None => return Hook::Continue,
        };

        let veto = event.veto();
        for listener in listeners {
            let hook = listener(data);
            if Some(hook) == veto {
                debug!("Listener for {} returned {:?}", event, hook);
                return hook;
            }
            if hook != Hook::Continue {
                debug!("Ignoring {:?} returned for {}", hook, event);
            }
        }
        Hook::Continue
    }

    /// Remove every listener for every event.
    pub fn clear_listeners(&self) {
        self.listeners.clear();
    }

    /// Number of listeners registered for `event`.
    pub fn listener_count(&self, event: Event) -> usize {
        self.listeners.get(&event).map(|l| l.len()).unwrap_or(0)
    }
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBus")
            .field("events", &self.listeners.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    fn params() -> EnqueueParams {
        EnqueueParams {
            class: "Echo".to_string(),
            args: None,
            queue: "jobs".to_string(),
            id: "abc".to_string(),
        }
    }

    #[test]
    fn test_event_names_round_trip() {
        for event in Event::ALL {
            assert_eq!(event.as_str().parse::<Event>().unwrap(), event);
        }
        assert!("beforeSomething".parse::<Event>().is_err());
    }

    #[test]
    fn test_listeners_run_in_registration_order() {
        let bus = EventBus::new();
        let calls = Arc::new(Mutex::new(Vec::new()));

        for n in 1..=3 {
            let calls = calls.clone();
            bus.listen(Event::AfterEnqueue, move |_| {
                calls.lock().push(n);
                Hook::Continue
            });
        }

        let params = params();
        assert_eq!(
            bus.trigger(Event::AfterEnqueue, &EventData::Enqueue(&params)),
            Hook::Continue
        );
        assert_eq!(*calls.lock(), vec![1, 2, 3]);
    }

    #[test]
    fn test_veto_short_circuits() {
        let bus = EventBus::new();
        let later = Arc::new(Mutex::new(false));

        bus.listen(Event::BeforeEnqueue, |_| Hook::DontCreate);
        {
            let later = later.clone();
            bus.listen(Event::BeforeEnqueue, move |_| {
                *later.lock() = true;
                Hook::Continue
            });
        }

        let params = params();
        assert_eq!(
            bus.trigger(Event::BeforeEnqueue, &EventData::Enqueue(&params)),
            Hook::DontCreate
        );
        assert!(!*later.lock());
    }

    #[test]
    fn test_foreign_veto_is_ignored() {
        let bus = EventBus::new();
        let later = Arc::new(Mutex::new(false));

        bus.listen(Event::BeforeEnqueue, |_| Hook::DontPerform);
        bus.listen(Event::AfterPerform, |_| Hook::DontCreate);
        {
            let later = later.clone();
            bus.listen(Event::BeforeEnqueue, move |_| {
                *later.lock() = true;
                Hook::Continue
            });
        }

        let params = params();
        assert_eq!(
            bus.trigger(Event::BeforeEnqueue, &EventData::Enqueue(&params)),
            Hook::Continue
        );
        assert!(*later.lock());
        assert_eq!(
            bus.trigger(Event::AfterPerform, &EventData::Enqueue(&params)),
            Hook::Continue
        );
    }

    #[test]
    fn test_stop_listening_is_idempotent() {
        let bus = EventBus::new();
        let id = bus.listen(Event::OnFailure, |_| Hook::Continue);

        assert!(bus.stop_listening(Event::OnFailure, id));
        assert!(!bus.stop_listening(Event::OnFailure, id));
        assert!(!bus.stop_listening(Event::AfterFork, id));
    }

    #[test]
    fn test_stop_listening_removes_only_that_listener() {
        let bus = EventBus::new();
        let first = bus.listen(Event::AfterPerform, |_| Hook::Continue);
        let _second = bus.listen(Event::AfterPerform, |_| Hook::Continue);

        bus.stop_listening(Event::AfterPerform, first);
        assert_eq!(bus.listener_count(Event::AfterPerform), 1);
    }

    #[test]
    fn test_clear_listeners() {
        let bus = EventBus::new();
        bus.listen(Event::BeforeFork, |_| Hook::Continue);
        bus.listen(Event::AfterFork, |_| Hook::Continue);

        bus.clear_listeners();
        assert_eq!(bus.listener_count(Event::BeforeFork), 0);
        assert_eq!(bus.listener_count(Event::AfterFork), 0);
    }

    #[test]
    fn test_clones_share_registry() {
        let bus = EventBus::new();
        let clone = bus.clone();
        clone.listen(Event::BeforeFirstFork, |_| Hook::Continue);
        assert_eq!(bus.listener_count(Event::BeforeFirstFork), 1);
    }

    #[test]
    fn test_listener_may_register_during_trigger() {
        let bus = EventBus::new();
        let inner = bus.clone();
        bus.listen(Event::AfterEnqueue, move |_| {
            inner.listen(Event::AfterEnqueue, |_| Hook::Continue);
            Hook::Continue
        });

        let params = params();
        bus.trigger(Event::AfterEnqueue, &EventData::Enqueue(&params));
        assert_eq!(bus.listener_count(Event::AfterEnqueue), 2);
    }
}
