//! End-to-end lifecycle scenarios driven through the public surface only,
//! with the background sweeper running on its real schedule under a paused
//! clock.

use async_trait::async_trait;
use event_bus::{ErrFunc, Message, MessageListener, SubscriptionHandle, Transport, TransportError};
use futures::StreamExt;
use owner_cache::{
    registration_subject, DeviceDirectory, DeviceStream, DirectoryError, EventCallback,
    OwnerCache, RegistrationEvent,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

const EXPIRATION: Duration = Duration::from_secs(60);

#[derive(Default)]
struct CallCounts {
    subscribe: HashMap<String, usize>,
    unsubscribe: HashMap<String, usize>,
}

struct FakeBus {
    calls: Arc<StdMutex<CallCounts>>,
    listeners: StdMutex<HashMap<String, Arc<dyn MessageListener>>>,
}

impl FakeBus {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            calls: Arc::new(StdMutex::new(CallCounts::default())),
            listeners: StdMutex::new(HashMap::new()),
        })
    }

    fn unsubscribe_calls(&self, owner: &str) -> usize {
        self.calls
            .lock()
            .expect("lock call counts")
            .unsubscribe
            .get(&registration_subject(owner))
            .copied()
            .unwrap_or(0)
    }

    async fn publish(&self, owner: &str, event: &RegistrationEvent) {
        let subject = registration_subject(owner);
        let listener = self
            .listeners
            .lock()
            .expect("lock listeners")
            .get(&subject)
            .cloned();
        if let Some(listener) = listener {
            listener.on_message(Message::new(subject, event.encode())).await;
        }
    }
}

struct FakeSubscription {
    subject: String,
    calls: Arc<StdMutex<CallCounts>>,
}

#[async_trait]
impl SubscriptionHandle for FakeSubscription {
    fn subject(&self) -> &str {
        &self.subject
    }

    async fn unsubscribe(&self) -> Result<(), TransportError> {
        let mut calls = self.calls.lock().expect("lock call counts");
        *calls.unsubscribe.entry(self.subject.clone()).or_insert(0) += 1;
        Ok(())
    }
}

#[async_trait]
impl Transport for FakeBus {
    async fn subscribe(
        &self,
        subject: &str,
        listener: Arc<dyn MessageListener>,
    ) -> Result<Box<dyn SubscriptionHandle>, TransportError> {
        {
            let mut calls = self.calls.lock().expect("lock call counts");
            *calls.subscribe.entry(subject.to_string()).or_insert(0) += 1;
        }
        self.listeners
            .lock()
            .expect("lock listeners")
            .insert(subject.to_string(), listener);
        Ok(Box::new(FakeSubscription {
            subject: subject.to_string(),
            calls: Arc::clone(&self.calls),
        }))
    }
}

struct ScriptedDirectory {
    devices: StdMutex<Vec<String>>,
    calls: AtomicUsize,
}

impl ScriptedDirectory {
    fn new(devices: &[&str]) -> Arc<Self> {
        Arc::new(Self {
            devices: StdMutex::new(devices.iter().map(ToString::to_string).collect()),
            calls: AtomicUsize::new(0),
        })
    }

    fn set_devices(&self, devices: &[&str]) {
        *self.devices.lock().expect("lock devices") =
            devices.iter().map(ToString::to_string).collect();
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DeviceDirectory for ScriptedDirectory {
    async fn get_devices(&self, _owner: &str) -> Result<DeviceStream, DirectoryError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let devices = self.devices.lock().expect("lock devices").clone();
        Ok(futures::stream::iter(devices.into_iter().map(Ok)).boxed())
    }
}

fn noop_err_func() -> ErrFunc {
    Arc::new(|_| {})
}

fn recording_callback() -> (EventCallback, Arc<StdMutex<Vec<RegistrationEvent>>>) {
    let events = Arc::new(StdMutex::new(Vec::new()));
    let sink = Arc::clone(&events);
    let callback: EventCallback = Arc::new(move |event| {
        sink.lock().expect("lock events").push(event.clone());
    });
    (callback, events)
}

fn registered(device_ids: &[&str]) -> RegistrationEvent {
    RegistrationEvent::DevicesRegistered {
        device_ids: device_ids.iter().map(ToString::to_string).collect(),
    }
}

#[tokio::test]
async fn basic_lifecycle_from_empty_directory_to_first_device() {
    let bus = FakeBus::new();
    let directory = ScriptedDirectory::new(&[]);
    let cache = OwnerCache::new(EXPIRATION, bus.clone(), directory.clone(), noop_err_func());

    let (callback, events) = recording_callback();
    let sub = cache.subscribe("a", Some(callback)).await.expect("subscribe");

    let (added, removed) = cache.update("a").await.expect("update");
    assert!(added.is_empty());
    assert!(removed.is_empty());

    bus.publish("a", &registered(&["d1"])).await;

    assert_eq!(cache.get_devices("a").await.expect("get"), vec!["d1"]);
    assert_eq!(*events.lock().expect("lock"), vec![registered(&["d1"])]);

    sub.close().await;
    cache.close().await;
}

#[tokio::test(start_paused = true)]
async fn two_listeners_one_closes_then_entry_expires_after_the_last_close() {
    let bus = FakeBus::new();
    let directory = ScriptedDirectory::new(&[]);
    let cache = OwnerCache::new(EXPIRATION, bus.clone(), directory.clone(), noop_err_func());

    let (callback_a, events_a) = recording_callback();
    let (callback_b, events_b) = recording_callback();
    let sub_a = cache.subscribe("a", Some(callback_a)).await.expect("subscribe a");
    let sub_b = cache.subscribe("a", Some(callback_b)).await.expect("subscribe b");

    cache.update("a").await.expect("update");
    bus.publish("a", &registered(&["d1"])).await;
    assert_eq!(*events_a.lock().expect("lock"), vec![registered(&["d1"])]);
    assert_eq!(*events_b.lock().expect("lock"), vec![registered(&["d1"])]);

    sub_a.close().await;
    bus.publish("a", &registered(&["d2"])).await;
    assert_eq!(events_a.lock().expect("lock").len(), 1, "closed listener got no event");
    assert_eq!(events_b.lock().expect("lock").len(), 2);

    sub_b.close().await;
    let resyncs_before_expiry = directory.calls();

    // The background sweeper evicts the now idle entry once the extended
    // expiration window elapses.
    tokio::time::sleep(EXPIRATION * 3).await;
    assert_eq!(bus.unsubscribe_calls("a"), 1);

    // The next read finds no cached entry and resynchronizes from scratch.
    directory.set_devices(&["d1", "d2"]);
    assert_eq!(cache.get_devices("a").await.expect("get"), vec!["d1", "d2"]);
    assert_eq!(directory.calls(), resyncs_before_expiry + 1);

    cache.close().await;
}

#[tokio::test]
async fn notifications_before_the_first_resync_are_dropped() {
    let bus = FakeBus::new();
    let directory = ScriptedDirectory::new(&["d1"]);
    let cache = OwnerCache::new(EXPIRATION, bus.clone(), directory.clone(), noop_err_func());

    let (callback, events) = recording_callback();
    let sub = cache.subscribe("a", Some(callback)).await.expect("subscribe");

    // The listener observes the event, but the unsynced cache drops the
    // mutation; the update below must report the device as newly added.
    bus.publish("a", &registered(&["d1"])).await;
    assert_eq!(events.lock().expect("lock").len(), 1);

    let (added, removed) = cache.update("a").await.expect("update");
    assert_eq!(added, vec!["d1"]);
    assert!(removed.is_empty());

    sub.close().await;
    cache.close().await;
}
