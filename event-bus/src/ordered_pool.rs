//! Ordered, pooled event dispatch.
//!
//! Events sharing a stream key (`group_id.aggregate_id`) are handed to the
//! wrapped handler strictly in arrival order and never concurrently; events
//! of different streams fan out to an injectable worker pool. Without a
//! pool, drains run inline on the calling task.

use crate::event::{stream_key, DynEvent, EventHandler};
use crate::transport::{BoxError, ErrFunc};
use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::FutureExt;
use std::collections::HashMap;
use std::mem;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, trace};
use uuid::Uuid;

const COMPONENT: &str = "ordered_pool";

/// Upper bound on events per handler invocation; longer same-stream runs
/// are split into several pushes to bound memory.
const MAX_BATCH: usize = 128;

/// Submits a unit of work to a worker pool.
pub type GoFunc = Arc<dyn Fn(BoxFuture<'static, ()>) -> Result<(), BoxError> + Send + Sync>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

struct StreamQueue {
    pending: Vec<DynEvent>,
    active: bool,
}

impl StreamQueue {
    fn new() -> Self {
        Self {
            pending: Vec::new(),
            active: false,
        }
    }

    /// Appends `events` and reports whether this push must schedule a
    /// drain: true only when the queue was idle until now.
    fn push(&mut self, events: Vec<DynEvent>) -> bool {
        self.pending.extend(events);
        if self.active {
            return false;
        }
        self.active = true;
        true
    }

    /// Swaps out everything pending; marks the queue idle when empty.
    fn pop(&mut self) -> Option<Vec<DynEvent>> {
        if self.pending.is_empty() {
            self.active = false;
            return None;
        }
        Some(mem::take(&mut self.pending))
    }

    fn set_idle(&mut self) {
        self.active = false;
    }

    fn removable(&self) -> bool {
        !self.active && self.pending.is_empty()
    }
}

type StreamQueues = Arc<Mutex<HashMap<String, Arc<Mutex<StreamQueue>>>>>;

/// Wraps an [`EventHandler`] with per-stream serialization on top of an
/// injectable work-submission function.
pub struct OrderedPoolHandler {
    go: Option<GoFunc>,
    handler: Arc<dyn EventHandler>,
    err_func: ErrFunc,
    queues: StreamQueues,
}

impl OrderedPoolHandler {
    /// `go` submits drain work to a pool; `None` runs drains inline on the
    /// calling task. Handler failures are reported through `err_func`.
    pub fn new(go: Option<GoFunc>, handler: Arc<dyn EventHandler>, err_func: ErrFunc) -> Self {
        Self {
            go,
            handler,
            err_func,
            queues: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn drain(&self, key: String, queue: Arc<Mutex<StreamQueue>>) -> BoxFuture<'static, ()> {
        let handler = Arc::clone(&self.handler);
        let err_func = Arc::clone(&self.err_func);
        let queues = Arc::clone(&self.queues);
        let worker_id = Uuid::new_v4();
        async move {
            loop {
                let batch = lock(&queue).pop();
                let Some(batch) = batch else { break };
                trace!(
                    component = COMPONENT,
                    worker = %worker_id,
                    stream = %key,
                    count = batch.len(),
                    "draining batch"
                );
                if let Err(err) = handler.handle(batch).await {
                    // The failed batch is not retried; events pushed while
                    // the handler ran stay queued and the next push
                    // schedules a fresh worker.
                    lock(&queue).set_idle();
                    err_func(err);
                    break;
                }
            }
            let mut queues = lock(&queues);
            let removable = queues
                .get(&key)
                .map(|queue| lock(queue).removable())
                .unwrap_or(false);
            if removable {
                queues.remove(&key);
                debug!(component = COMPONENT, stream = %key, "removed idle stream queue");
            }
        }
        .boxed()
    }

    async fn dispatch(&self, key: String, batch: Vec<DynEvent>) -> Result<(), BoxError> {
        let (queue, spawn) = {
            let mut queues = lock(&self.queues);
            let queue = queues
                .entry(key.clone())
                .or_insert_with(|| Arc::new(Mutex::new(StreamQueue::new())))
                .clone();
            let spawn = lock(&queue).push(batch);
            (queue, spawn)
        };
        if !spawn {
            return Ok(());
        }
        let drain = self.drain(key, Arc::clone(&queue));
        match &self.go {
            Some(go) => {
                if let Err(err) = go(drain) {
                    lock(&queue).set_idle();
                    return Err(err);
                }
                Ok(())
            }
            None => {
                drain.await;
                Ok(())
            }
        }
    }
}

#[async_trait]
impl EventHandler for OrderedPoolHandler {
    async fn handle(&self, events: Vec<DynEvent>) -> Result<(), BoxError> {
        let mut batch: Vec<DynEvent> = Vec::new();
        let mut batch_key = String::new();
        for event in events {
            let event_key = stream_key(event.as_ref());
            if !batch.is_empty() && (event_key != batch_key || batch.len() >= MAX_BATCH) {
                let flushed = mem::take(&mut batch);
                self.dispatch(mem::take(&mut batch_key), flushed).await?;
            }
            batch_key = event_key;
            batch.push(event);
        }
        if !batch.is_empty() {
            self.dispatch(batch_key, batch).await?;
        }
        Ok(())
    }
}
