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

//! # event-bus
//!
//! Core abstractions shared by the hub's caching and event-dispatch layer:
//! the pub/sub transport interface, the typed event model, a keyed registry
//! of independently lockable entries, and the ordered pooled event
//! dispatcher.
//!
//! The transport itself (connect, publish, raw subscribe/unsubscribe,
//! reconnection) is an external collaborator behind [`Transport`]; this
//! crate only assumes at-least-once delivery with no ordering guarantee
//! across subjects.
//!
//! ## Ordered dispatch
//!
//! [`OrderedPoolHandler`] wraps any [`EventHandler`] and guarantees that
//! events sharing a stream key are handled serially and in order, while
//! separate streams fan out to an injectable worker pool:
//!
//! ```
//! use std::sync::Arc;
//! use event_bus::{BoxError, DynEvent, Event, EventHandler, OrderedPoolHandler};
//!
//! struct DeviceEvent {
//!     device: String,
//! }
//!
//! impl Event for DeviceEvent {
//!     fn group_id(&self) -> &str {
//!         "devices"
//!     }
//!     fn aggregate_id(&self) -> &str {
//!         &self.device
//!     }
//!     fn event_type(&self) -> &str {
//!         "device.updated"
//!     }
//! }
//!
//! struct CountingHandler;
//!
//! #[async_trait::async_trait]
//! impl EventHandler for CountingHandler {
//!     async fn handle(&self, events: Vec<DynEvent>) -> Result<(), BoxError> {
//!         assert!(!events.is_empty());
//!         Ok(())
//!     }
//! }
//!
//! # tokio::runtime::Runtime::new().unwrap().block_on(async {
//! let pool = OrderedPoolHandler::new(None, Arc::new(CountingHandler), Arc::new(|_| {}));
//! let event: DynEvent = Arc::new(DeviceEvent {
//!     device: "d1".to_string(),
//! });
//! pool.handle(vec![event]).await.unwrap();
//! # });
//! ```
//!
//! ## Internal architecture map
//!
//! - `message` / `transport`: collaborator-facing surface
//! - `event`: typed events and the handler seam dispatchers plug into
//! - `lock_map`: load-or-store / conditional-delete registry primitive
//! - `ordered_pool`: per-stream serialized, cross-stream pooled dispatch
//!
//! ## Observability model
//!
//! The workspace uses `tracing` for logs/events. Library code emits
//! events/spans and does not unconditionally initialize a global subscriber.
//! Binaries and tests are responsible for one-time `tracing_subscriber`
//! initialization at process boundaries.

mod event;
mod lock_map;
mod message;
mod ordered_pool;
mod transport;

pub use event::{stream_key, DynEvent, Event, EventHandler};
pub use lock_map::{LockMap, LockedEntry};
pub use message::Message;
pub use ordered_pool::{GoFunc, OrderedPoolHandler};
pub use transport::{
    BoxError, ErrFunc, MessageListener, SubscriptionHandle, Transport, TransportError,
};
