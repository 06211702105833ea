/********************************************************************************
 * Copyright (c) 2024 Contributors to the Eclipse Foundation
 *
 * See the NOTICE file(s) distributed with this work for additional
 * information regarding copyright ownership.
 *
 * This program and the accompanying materials are made available under the
 * terms of the Apache License Version 2.0 which is available at
 * https://www.apache.org/licenses/LICENSE-2.0
 *
 * SPDX-License-Identifier: Apache-2.0
 ********************************************************************************/

//! # subscription-cache
//!
//! Shares one transport-level subscription per distinct subject among any
//! number of logical listeners, and tears the subscription down exactly when
//! the last listener detaches.
//!
//! Registration and removal are atomic with respect to each other: a
//! concurrent "last handler removed, delete subject" and "new handler added"
//! can never both win, because the subject entry is locked underneath the
//! registry lock for both operations. Fan-out snapshots the handler map
//! under the entry lock and invokes callbacks outside it, so handlers may
//! subscribe or close during dispatch without racing the iteration.

use async_trait::async_trait;
use event_bus::{
    ErrFunc, LockMap, Message, MessageListener, SubscriptionHandle, Transport, TransportError,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, warn};

const COMPONENT: &str = "subscriptions_cache";

/// Callback invoked for every message delivered on a subscribed subject.
pub type RawMessageFunc = Arc<dyn Fn(&Message) + Send + Sync>;

struct SubjectEntry {
    handlers: HashMap<u64, RawMessageFunc>,
    subscription: Option<Box<dyn SubscriptionHandle>>,
}

impl SubjectEntry {
    fn new() -> Self {
        Self {
            handlers: HashMap::new(),
            subscription: None,
        }
    }

    fn snapshot_handlers(&self) -> Vec<RawMessageFunc> {
        self.handlers.values().cloned().collect()
    }
}

struct FanoutListener {
    entry: Arc<Mutex<SubjectEntry>>,
}

#[async_trait]
impl MessageListener for FanoutListener {
    async fn on_message(&self, msg: Message) {
        let handlers = self.entry.lock().await.snapshot_handlers();
        for handler in handlers {
            handler(&msg);
        }
    }
}

/// Multiplexes many logical listeners onto at most one transport
/// subscription per subject.
pub struct SubscriptionsCache {
    subjects: Arc<LockMap<SubjectEntry>>,
    transport: Arc<dyn Transport>,
    err_func: ErrFunc,
    handler_id: AtomicU64,
}

impl SubscriptionsCache {
    /// Asynchronous unsubscribe failures are reported through `err_func`.
    pub fn new(transport: Arc<dyn Transport>, err_func: ErrFunc) -> Self {
        Self {
            subjects: Arc::new(LockMap::new()),
            transport,
            err_func,
            handler_id: AtomicU64::new(0),
        }
    }

    /// Registers `on_message` for `subject`, creating the transport
    /// subscription when this is the subject's first listener.
    ///
    /// A failed transport subscribe unwinds the registration completely; no
    /// partial subscription leaks.
    pub async fn subscribe(
        &self,
        subject: &str,
        on_message: RawMessageFunc,
    ) -> Result<SubjectSubscription, TransportError> {
        let id = self.handler_id.fetch_add(1, Ordering::Relaxed) + 1;
        let mut entry = self.subjects.lock_or_create(subject, SubjectEntry::new).await;
        entry.handlers.insert(id, on_message);
        if entry.subscription.is_none() {
            let listener = Arc::new(FanoutListener { entry: entry.cell() });
            match self.transport.subscribe(subject, listener).await {
                Ok(subscription) => {
                    debug!(component = COMPONENT, subject, "created transport subscription");
                    entry.subscription = Some(subscription);
                }
                Err(err) => {
                    warn!(
                        component = COMPONENT,
                        subject,
                        error = %err,
                        "unable to subscribe, unwinding handler registration"
                    );
                    entry.handlers.remove(&id);
                    let unwind_entry = entry.handlers.is_empty();
                    drop(entry);
                    if unwind_entry {
                        self.subjects
                            .remove_if(subject, |entry| {
                                (entry.handlers.is_empty() && entry.subscription.is_none(), ())
                            })
                            .await;
                    }
                    return Err(err);
                }
            }
        }
        drop(entry);
        Ok(SubjectSubscription {
            subjects: Arc::clone(&self.subjects),
            err_func: Arc::clone(&self.err_func),
            subject: subject.to_string(),
            id,
        })
    }
}

/// Live registration of one logical listener on a subject.
#[must_use = "dropping a SubjectSubscription without calling close leaks the handler registration"]
pub struct SubjectSubscription {
    subjects: Arc<LockMap<SubjectEntry>>,
    err_func: ErrFunc,
    subject: String,
    id: u64,
}

impl SubjectSubscription {
    pub fn subject(&self) -> &str {
        &self.subject
    }

    /// Removes this listener. The last removal for a subject atomically
    /// deletes the subject entry and unsubscribes the transport
    /// subscription; unsubscribe failures go to the error sink.
    pub async fn close(self) {
        let subscription = self
            .subjects
            .remove_if(&self.subject, |entry| {
                entry.handlers.remove(&self.id);
                if entry.handlers.is_empty() {
                    (true, entry.subscription.take())
                } else {
                    (false, None)
                }
            })
            .await
            .flatten();
        if let Some(subscription) = subscription {
            debug!(
                component = COMPONENT,
                subject = %self.subject,
                "last listener closed, unsubscribing"
            );
            if let Err(err) = subscription.unsubscribe().await {
                (self.err_func)(Box::new(err));
            }
        }
    }
}
