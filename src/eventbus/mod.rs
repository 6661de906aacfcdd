//! In-process event bus.
//!
//! Producers call one of the `broadcast_*` helpers; every registered
//! [`Listener`] and then every [`Forwarder`] receives the event synchronously,
//! in registration order. A consumer that fails or panics is logged and
//! skipped, the producer never sees it.
//!
//! Consumers must not call back into the bus from `on_event`/`broadcast`: the
//! bus lock is held for the whole delivery pass.

pub mod amqp;
pub mod events;
pub mod forwarder;
pub mod topics;

use std::any::Any;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::{debug, error};

use crate::error::DeliveryError;

pub use events::{
    Event, FarmStatus, FarmStatusReport, JobUpdate, LastRenderedUpdate, LifeCycleEvent,
    LifeCycleType, TaskLogUpdate, TaskUpdate, WorkerTagUpdate, WorkerUpdate,
};
pub use amqp::AmqpPublisher;
pub use forwarder::{BrokerForwarder, MessagePublisher, QueueRunner};
pub use topics::Topic;

/// In-process component reacting to events.
pub trait Listener: Send + Sync {
    fn on_event(&self, topic: &Topic, event: &Event) -> Result<(), DeliveryError>;
}

/// Component passing events on to an external system.
pub trait Forwarder: Send + Sync {
    fn broadcast(&self, topic: &Topic, event: &Event) -> Result<(), DeliveryError>;
}

#[derive(Default)]
struct Consumers {
    listeners: Vec<Arc<dyn Listener>>,
    forwarders: Vec<Arc<dyn Forwarder>>,
}

#[derive(Default)]
pub struct EventBus {
    consumers: Mutex<Consumers>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_listener(&self, listener: Arc<dyn Listener>) {
        self.lock().listeners.push(listener);
    }

    pub fn add_forwarder(&self, forwarder: Arc<dyn Forwarder>) {
        self.lock().forwarders.push(forwarder);
    }

    /// Deliver the event to every consumer. Without consumers this does
    /// nothing.
    pub fn broadcast(&self, topic: &Topic, event: &Event) {
        let consumers = self.lock();

        for (index, listener) in consumers.listeners.iter().enumerate() {
            deliver("listener", index, topic, || listener.on_event(topic, event));
        }
        for (index, forwarder) in consumers.forwarders.iter().enumerate() {
            deliver("forwarder", index, topic, || forwarder.broadcast(topic, event));
        }
    }

    fn lock(&self) -> MutexGuard<'_, Consumers> {
        // Consumer panics are caught inside the pass, so a poisoned lock still
        // holds consistent lists.
        self.consumers.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn deliver(
    kind: &'static str,
    index: usize,
    topic: &Topic,
    send: impl FnOnce() -> Result<(), DeliveryError>,
) {
    match catch_unwind(AssertUnwindSafe(send)) {
        Ok(Ok(())) => {}
        Ok(Err(e)) => {
            error!(consumer = kind, index, topic = %topic, error = %e, "Event delivery failed");
        }
        Err(panic) => {
            error!(
                consumer = kind,
                index,
                topic = %topic,
                panic = panic_message(panic.as_ref()),
                "Event consumer panicked"
            );
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.as_str()
    } else {
        "non-string panic payload"
    }
}

/// Writes every event to the debug log.
pub struct TracingListener;

impl Listener for TracingListener {
    fn on_event(&self, topic: &Topic, event: &Event) -> Result<(), DeliveryError> {
        debug!(topic = %topic, ?event, "Event");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Appends "{name}:{topic}" to a shared log.
    struct Recording {
        name: &'static str,
        log: Arc<Mutex<Vec<String>>>,
        behaviour: Behaviour,
    }

    #[derive(Clone, Copy)]
    enum Behaviour {
        Ok,
        Fail,
        Panic,
    }

    impl Recording {
        fn new(name: &'static str, log: &Arc<Mutex<Vec<String>>>, behaviour: Behaviour) -> Arc<Self> {
            Arc::new(Self {
                name,
                log: log.clone(),
                behaviour,
            })
        }

        fn record(&self, topic: &Topic) -> Result<(), DeliveryError> {
            self.log.lock().unwrap().push(format!("{}:{}", self.name, topic));
            match self.behaviour {
                Behaviour::Ok => Ok(()),
                Behaviour::Fail => Err(DeliveryError::Rejected {
                    topic: topic.to_string(),
                    reason: "test".to_string(),
                }),
                Behaviour::Panic => panic!("consumer {} exploded", self.name),
            }
        }
    }

    impl Listener for Recording {
        fn on_event(&self, topic: &Topic, _event: &Event) -> Result<(), DeliveryError> {
            self.record(topic)
        }
    }

    impl Forwarder for Recording {
        fn broadcast(&self, topic: &Topic, _event: &Event) -> Result<(), DeliveryError> {
            self.record(topic)
        }
    }

    fn lifecycle() -> Event {
        Event::LifeCycle(LifeCycleEvent::new(LifeCycleType::ManagerStartup))
    }

    #[test]
    fn broadcast_without_consumers_is_noop() {
        let bus = EventBus::new();
        bus.broadcast(&Topic::lifecycle(), &lifecycle());
    }

    #[test]
    fn delivers_to_listeners_then_forwarders_in_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let bus = EventBus::new();
        // Forwarder registered first still runs after the listeners.
        bus.add_forwarder(Recording::new("f1", &log, Behaviour::Ok));
        bus.add_listener(Recording::new("l1", &log, Behaviour::Ok));
        bus.add_listener(Recording::new("l2", &log, Behaviour::Ok));
        bus.add_forwarder(Recording::new("f2", &log, Behaviour::Ok));

        bus.broadcast(&Topic::lifecycle(), &lifecycle());

        assert_eq!(
            *log.lock().unwrap(),
            vec![
                "l1:/lifecycle",
                "l2:/lifecycle",
                "f1:/lifecycle",
                "f2:/lifecycle"
            ]
        );
    }

    #[test]
    fn faulty_consumers_do_not_stop_delivery() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let bus = EventBus::new();
        bus.add_listener(Recording::new("panics", &log, Behaviour::Panic));
        bus.add_listener(Recording::new("fails", &log, Behaviour::Fail));
        bus.add_listener(Recording::new("ok", &log, Behaviour::Ok));
        bus.add_forwarder(Recording::new("fwd", &log, Behaviour::Ok));

        bus.broadcast(&Topic::workers(), &lifecycle());
        bus.broadcast(&Topic::jobs(), &lifecycle());

        let log = log.lock().unwrap();
        assert_eq!(log.len(), 8);
        assert_eq!(log[3], "fwd:/workers");
        assert_eq!(log[7], "fwd:/jobs");
    }

    #[test]
    fn last_rendered_goes_to_both_topics() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let bus = EventBus::new();
        bus.add_listener(Recording::new("l", &log, Behaviour::Ok));

        let job = uuid::Uuid::new_v4();
        bus.broadcast_last_rendered(LastRenderedUpdate::new(job));

        assert_eq!(
            *log.lock().unwrap(),
            vec![format!("l:/jobs/{job}/last-rendered"), "l:/last-rendered".to_string()]
        );
    }
}
