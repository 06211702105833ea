//! Owner device cache fed by bus registration events.

use crate::directory::{DeviceDirectory, DirectoryError};
use crate::events::{registration_subject, RegistrationEvent};
use crate::sorted_set::SortedSet;
use async_trait::async_trait;
use event_bus::{
    ErrFunc, LockMap, LockedEntry, Message, MessageListener, SubscriptionHandle, Transport,
    TransportError,
};
use futures::StreamExt;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

const COMPONENT: &str = "owner_cache";

/// Callback invoked for every registration event observed for an owner.
pub type EventCallback = Arc<dyn Fn(&RegistrationEvent) + Send + Sync>;

#[derive(Debug, Error)]
pub enum OwnerCacheError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Directory(#[from] DirectoryError),
}

#[derive(Debug, Error)]
#[error("cannot unsubscribe owner('{owner}'): {source}")]
struct SweepUnsubscribeError {
    owner: String,
    source: TransportError,
}

struct OwnerEntry {
    handlers: HashMap<u64, EventCallback>,
    subscription: Option<Box<dyn SubscriptionHandle>>,
    devices: SortedSet,
    valid_until: Instant,
    synced: bool,
}

impl OwnerEntry {
    fn new(valid_until: Instant) -> Self {
        Self {
            handlers: HashMap::new(),
            subscription: None,
            devices: SortedSet::new(),
            valid_until,
            synced: false,
        }
    }

    fn snapshot_handlers(&self) -> Vec<EventCallback> {
        self.handlers.values().cloned().collect()
    }

    fn apply(&mut self, event: &RegistrationEvent) {
        match event {
            RegistrationEvent::DevicesRegistered { device_ids } => {
                self.devices.insert(device_ids.iter().cloned());
            }
            RegistrationEvent::DevicesUnregistered { device_ids } => {
                self.devices.remove(device_ids.iter().cloned());
            }
        }
    }
}

struct OwnerListener {
    entry: Arc<Mutex<OwnerEntry>>,
    err_func: ErrFunc,
}

#[async_trait]
impl MessageListener for OwnerListener {
    async fn on_message(&self, msg: Message) {
        let event = match RegistrationEvent::decode(&msg.payload) {
            Ok(event) => event,
            Err(err) => {
                (self.err_func)(Box::new(err));
                return;
            }
        };
        let handlers = {
            let mut entry = self.entry.lock().await;
            // An unsynced entry must not apply partial updates; the next
            // resynchronization fetches the true state.
            if entry.synced {
                entry.apply(&event);
            }
            entry.snapshot_handlers()
        };
        for handler in handlers {
            handler(&event);
        }
    }
}

struct Inner {
    owners: LockMap<OwnerEntry>,
    transport: Arc<dyn Transport>,
    directory: Arc<dyn DeviceDirectory>,
    expiration: Duration,
    err_func: ErrFunc,
    handler_id: AtomicU64,
}

impl Inner {
    fn next_handler_id(&self) -> u64 {
        self.handler_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    async fn lock_owner(&self, owner: &str) -> LockedEntry<OwnerEntry> {
        let deadline = Instant::now() + self.expiration;
        self.owners
            .lock_or_create(owner, || OwnerEntry::new(deadline))
            .await
    }

    async fn ensure_subscribed(
        &self,
        owner: &str,
        entry: &mut LockedEntry<OwnerEntry>,
    ) -> Result<(), TransportError> {
        if entry.subscription.is_some() {
            return Ok(());
        }
        let listener = Arc::new(OwnerListener {
            entry: entry.cell(),
            err_func: Arc::clone(&self.err_func),
        });
        let subscription = self
            .transport
            .subscribe(&registration_subject(owner), listener)
            .await?;
        debug!(component = COMPONENT, owner, "subscribed to registration events");
        entry.subscription = Some(subscription);
        Ok(())
    }

    async fn fetch_owner_devices(&self, owner: &str) -> Result<Vec<String>, DirectoryError> {
        let mut stream = self.directory.get_devices(owner).await?;
        let mut devices = Vec::with_capacity(32);
        while let Some(device) = stream.next().await {
            devices.push(device?);
        }
        Ok(devices)
    }

    /// Full resynchronization against the directory; the caller holds the
    /// entry lock. On failure the previous cache state is left untouched.
    async fn sync_devices(
        &self,
        owner: &str,
        entry: &mut LockedEntry<OwnerEntry>,
    ) -> Result<(Vec<String>, Vec<String>), OwnerCacheError> {
        self.ensure_subscribed(owner, entry).await?;
        let now = Instant::now();
        let fetched = SortedSet::make(self.fetch_owner_devices(owner).await?);
        let added = fetched.difference(&entry.devices).into_vec();
        let removed = entry.devices.difference(&fetched).into_vec();
        entry.devices = fetched;
        entry.synced = true;
        entry.valid_until = now + self.expiration;
        Ok((added, removed))
    }

    async fn check_expiration(&self) {
        let now = Instant::now();
        let mut expired = Vec::new();
        for (owner, cell) in self.owners.snapshot().await {
            let mut entry = cell.lock().await;
            if !entry.handlers.is_empty() {
                if entry.valid_until <= now {
                    // Active listeners keep the entry and its subscription
                    // alive; collapsing the set forces a resynchronization
                    // before the next read is trusted.
                    entry.devices.clear();
                    entry.synced = false;
                    debug!(
                        component = COMPONENT,
                        owner = %owner,
                        "expired cached devices of actively observed owner"
                    );
                }
            } else if entry.valid_until <= now {
                expired.push(owner);
            }
        }
        for owner in expired {
            // Revalidated under the registry lock: a subscribe that won the
            // race keeps the entry alive.
            let subscription = self
                .owners
                .remove_if(&owner, |entry| {
                    if !entry.handlers.is_empty() {
                        return (false, None);
                    }
                    if entry.valid_until <= now {
                        (true, entry.subscription.take())
                    } else {
                        (false, None)
                    }
                })
                .await
                .flatten();
            if let Some(subscription) = subscription {
                debug!(component = COMPONENT, owner = %owner, "evicted idle owner entry");
                if let Err(err) = subscription.unsubscribe().await {
                    (self.err_func)(Box::new(SweepUnsubscribeError { owner, source: err }));
                }
            }
        }
    }
}

fn spawn_sweeper(inner: Arc<Inner>, shutdown: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        let period = inner.expiration / 2;
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return,
                _ = ticker.tick() => inner.check_expiration().await,
            }
        }
    })
}

/// Reference-counted, time-expiring cache of per-owner device sets.
///
/// Entries are created lazily on first access and expire once idle past
/// their deadline; a background sweeper runs at half the expiration
/// interval. Call [`OwnerCache::close`] to stop the sweeper.
pub struct OwnerCache {
    inner: Arc<Inner>,
    shutdown: CancellationToken,
    sweeper: StdMutex<Option<JoinHandle<()>>>,
}

impl OwnerCache {
    /// `expiration` must be positive; failures of background activity are
    /// reported through `err_func`.
    pub fn new(
        expiration: Duration,
        transport: Arc<dyn Transport>,
        directory: Arc<dyn DeviceDirectory>,
        err_func: ErrFunc,
    ) -> Self {
        assert!(!expiration.is_zero(), "expiration must be positive");
        let inner = Arc::new(Inner {
            owners: LockMap::new(),
            transport,
            directory,
            expiration,
            err_func,
            handler_id: AtomicU64::new(0),
        });
        let shutdown = CancellationToken::new();
        let sweeper = spawn_sweeper(Arc::clone(&inner), shutdown.clone());
        Self {
            inner,
            shutdown,
            sweeper: StdMutex::new(Some(sweeper)),
        }
    }

    /// Registers `on_event` for the owner's registration events and ensures
    /// the owner's transport subscription exists. Call
    /// [`OwnerSubscription::close`] to unregister.
    pub async fn subscribe(
        &self,
        owner: &str,
        on_event: Option<EventCallback>,
    ) -> Result<OwnerSubscription, OwnerCacheError> {
        let inner = &self.inner;
        let mut entry = inner.lock_owner(owner).await;
        let mut handler_id = None;
        if let Some(on_event) = on_event {
            let id = inner.next_handler_id();
            entry.handlers.insert(id, on_event);
            handler_id = Some(id);
        }
        if let Err(err) = inner.ensure_subscribed(owner, &mut entry).await {
            if let Some(id) = handler_id {
                entry.handlers.remove(&id);
                if entry.handlers.is_empty() {
                    let now = Instant::now();
                    if entry.valid_until > now {
                        entry.valid_until = now + inner.expiration;
                    }
                }
            }
            return Err(err.into());
        }
        Ok(OwnerSubscription {
            inner: Arc::clone(inner),
            owner: owner.to_string(),
            id: handler_id,
        })
    }

    /// Forces a full resynchronization against the directory and returns the
    /// device IDs added to and removed from the cached set.
    pub async fn update(&self, owner: &str) -> Result<(Vec<String>, Vec<String>), OwnerCacheError> {
        let mut entry = self.inner.lock_owner(owner).await;
        self.inner.sync_devices(owner, &mut entry).await
    }

    /// Returns a copy of the owner's device IDs, resynchronizing first when
    /// the cached set is not trustworthy. A synced read extends the entry's
    /// expiration.
    pub async fn get_devices(&self, owner: &str) -> Result<Vec<String>, OwnerCacheError> {
        let mut entry = self.inner.lock_owner(owner).await;
        if entry.synced {
            entry.valid_until = Instant::now() + self.inner.expiration;
        } else {
            self.inner.sync_devices(owner, &mut entry).await?;
        }
        Ok(entry.devices.to_vec())
    }

    /// Succeeds only when every requested device ID is owned by the owner.
    pub async fn owns_devices(
        &self,
        owner: &str,
        device_ids: &[String],
    ) -> Result<bool, OwnerCacheError> {
        let requested = SortedSet::make(device_ids.iter().cloned());
        let mut entry = self.inner.lock_owner(owner).await;
        if !entry.synced {
            self.inner.sync_devices(owner, &mut entry).await?;
        }
        Ok(entry.devices.is_superset_of(&requested))
    }

    pub async fn owns_device(&self, owner: &str, device_id: &str) -> Result<bool, OwnerCacheError> {
        let device_ids = [device_id.to_string()];
        self.owns_devices(owner, &device_ids).await
    }

    /// Returns the requested device IDs that are owned by the owner.
    pub async fn get_selected_devices(
        &self,
        owner: &str,
        device_ids: &[String],
    ) -> Result<Vec<String>, OwnerCacheError> {
        let requested = SortedSet::make(device_ids.iter().cloned());
        let mut entry = self.inner.lock_owner(owner).await;
        if !entry.synced {
            self.inner.sync_devices(owner, &mut entry).await?;
        }
        Ok(entry.devices.intersection(&requested).into_vec())
    }

    /// Stops the expiration sweeper and waits for it to exit; no sweep runs
    /// after `close` returns.
    pub async fn close(&self) {
        self.shutdown.cancel();
        let handle = self
            .sweeper
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            if let Err(err) = handle.await {
                warn!(component = COMPONENT, error = %err, "sweeper task ended abnormally");
            }
        }
    }
}

/// Live registration of one owner-event listener. Closing unregisters the
/// listener; the cached entry itself stays until the sweeper evicts it.
#[must_use = "dropping an OwnerSubscription without calling close leaks the listener registration"]
pub struct OwnerSubscription {
    inner: Arc<Inner>,
    owner: String,
    id: Option<u64>,
}

impl OwnerSubscription {
    pub fn owner(&self) -> &str {
        &self.owner
    }

    /// Unregisters the listener. When no listeners remain the entry's
    /// expiration is extended so cache reads survive briefly, unless the
    /// deadline has already passed.
    pub async fn close(self) {
        let Some(id) = self.id else { return };
        let expiration = self.inner.expiration;
        self.inner
            .owners
            .remove_if(&self.owner, |entry| {
                entry.handlers.remove(&id);
                if entry.handlers.is_empty() {
                    let now = Instant::now();
                    if entry.valid_until > now {
                        entry.valid_until = now + expiration;
                    }
                }
                (false, ())
            })
            .await;
    }
}
