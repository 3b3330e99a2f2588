//! Client connection multiplexer.
//!
//! Any number of components may subscribe to `(room, event type)` pairs;
//! the multiplexer keeps exactly one physical stream per room for as long
//! as at least one subscription to that room is alive. The stream is opened
//! by the first subscription and closed when the last one is released.
//!
//! Each room's stream is driven by its own task, which decodes frames,
//! fans them out to the handlers registered for the frame's event type and
//! reconnects with backoff when the stream fails or goes silent.

use std::collections::HashMap;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use futures_util::StreamExt;
use parking_lot::{Mutex, RwLock};
use relay_common::{kinds, EmitRequest, Envelope, RealtimeEvent, Role, StreamParams, Timestamp, User};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::backoff::Backoff;
use crate::config::ClientConfig;
use crate::error::ClientError;
use crate::frame::RawFrame;
use crate::identity::IdentityStore;
use crate::transport::{FrameStream, HttpTransport, Transport};

/// Subscribe to every event type of a room
pub const ANY_EVENT: &str = "*";

/// Health of one room's stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// First attempt in flight
    Connecting,
    Connected,
    /// Waiting to retry after a failure
    Reconnecting,
    /// Retries exhausted; the next `subscribe` to the room reopens it
    Error,
}

/// A decoded frame as handed to subscribers
#[derive(Debug, Clone, PartialEq)]
pub struct Incoming {
    pub room: String,
    /// Event type name
    pub kind: String,
    /// Sender, absent for broker-synthesized frames
    pub sender: Option<User>,
    pub ts: Option<Timestamp>,
    pub event: RealtimeEvent,
}

impl Incoming {
    /// Decode a raw frame. Only unparseable JSON is an error; payloads that
    /// do not match their type decode as `RealtimeEvent::Other`.
    pub fn decode(room: &str, frame: &RawFrame) -> Result<Self, serde_json::Error> {
        let value: Value = serde_json::from_str(&frame.data)?;
        let kind = frame.event.clone();

        let synthesized = matches!(kind.as_str(), kinds::PRESENCE | kinds::READY | kinds::PING);
        if !synthesized {
            if let Ok(envelope) = Envelope::deserialize(&value) {
                return Ok(Self {
                    room: room.to_string(),
                    event: RealtimeEvent::decode(&kind, envelope.payload),
                    kind,
                    sender: Some(envelope.user),
                    ts: Some(envelope.ts),
                });
            }
        }

        Ok(Self {
            room: room.to_string(),
            event: RealtimeEvent::decode(&kind, value),
            kind,
            sender: None,
            ts: None,
        })
    }
}

/// Partial identity update for `Multiplexer::set_user`
#[derive(Debug, Clone, Default)]
pub struct UserPatch {
    pub id: Option<String>,
    pub name: Option<String>,
    pub role: Option<Role>,
}

type Handler = Arc<dyn Fn(&Incoming) + Send + Sync>;

struct HandlerEntry {
    id: u64,
    kind: String,
    handler: Handler,
}

impl HandlerEntry {
    fn matches(&self, kind: &str) -> bool {
        self.kind == kind || self.kind == ANY_EVENT
    }
}

struct RoomSlot {
    /// One entry per live subscription; the room closes when it empties
    handlers: Vec<HandlerEntry>,
    state: watch::Sender<ConnectionState>,
    task: JoinHandle<()>,
}

struct Inner {
    transport: Arc<dyn Transport>,
    config: ClientConfig,
    user: RwLock<User>,
    rooms: Mutex<HashMap<String, RoomSlot>>,
    next_handler: AtomicU64,
    stopped: AtomicBool,
}

impl Inner {
    fn dispatch(&self, room: &str, frame: &RawFrame) {
        let incoming = match Incoming::decode(room, frame) {
            Ok(incoming) => incoming,
            Err(e) => {
                warn!(%room, event = %frame.event, error = %e, "Dropping malformed frame");
                return;
            }
        };

        let handlers: Vec<Handler> = {
            let rooms = self.rooms.lock();
            rooms
                .get(room)
                .map(|slot| {
                    slot.handlers
                        .iter()
                        .filter(|h| h.matches(&incoming.kind))
                        .map(|h| Arc::clone(&h.handler))
                        .collect()
                })
                .unwrap_or_default()
        };

        for handler in handlers {
            if catch_unwind(AssertUnwindSafe(|| handler(&incoming))).is_err() {
                error!(%room, event = %incoming.kind, "Subscriber panicked while handling frame");
            }
        }
    }

    fn release(&self, room: &str, handler_id: u64) {
        let closed = {
            let mut rooms = self.rooms.lock();
            let Some(slot) = rooms.get_mut(room) else {
                return;
            };
            slot.handlers.retain(|h| h.id != handler_id);
            if !slot.handlers.is_empty() {
                return;
            }
            rooms.remove(room)
        };

        if let Some(slot) = closed {
            slot.task.abort();
            info!(%room, "Closed stream after last subscriber left");
        }
    }
}

/// Shared handle to the client's streams
#[derive(Clone)]
pub struct Multiplexer {
    inner: Arc<Inner>,
}

impl fmt::Debug for Multiplexer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Multiplexer")
            .field("user", &*self.inner.user.read())
            .field("rooms", &self.rooms())
            .finish()
    }
}

impl Multiplexer {
    pub fn new(transport: Arc<dyn Transport>, user: User, config: ClientConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                transport,
                config,
                user: RwLock::new(user),
                rooms: Mutex::new(HashMap::new()),
                next_handler: AtomicU64::new(1),
                stopped: AtomicBool::new(false),
            }),
        }
    }

    /// Multiplexer over HTTP
    pub fn connect(config: ClientConfig, user: User) -> Result<Self, ClientError> {
        let transport = HttpTransport::new(&config)?;
        Ok(Self::new(Arc::new(transport), user, config))
    }

    /// Multiplexer whose user id comes from `store`, so every session of
    /// this client reconnects as the same user
    pub fn with_identity(
        transport: Arc<dyn Transport>,
        store: &IdentityStore,
        name: impl Into<String>,
        role: Role,
        config: ClientConfig,
    ) -> Result<Self, ClientError> {
        let id = store.load_or_create()?;
        Ok(Self::new(transport, User::new(id, name, role), config))
    }

    /// `with_identity` over HTTP
    pub fn connect_with_identity(
        config: ClientConfig,
        store: &IdentityStore,
        name: impl Into<String>,
        role: Role,
    ) -> Result<Self, ClientError> {
        let transport = HttpTransport::new(&config)?;
        Self::with_identity(Arc::new(transport), store, name, role, config)
    }

    pub fn user(&self) -> User {
        self.inner.user.read().clone()
    }

    /// Merge a partial identity. Applies to emits and to streams opened
    /// afterwards; open streams keep the identity they connected with.
    pub fn set_user(&self, patch: UserPatch) {
        let mut user = self.inner.user.write();
        if let Some(id) = patch.id {
            user.id = id;
        }
        if let Some(name) = patch.name {
            user.name = name;
        }
        if let Some(role) = patch.role {
            user.role = role;
        }
    }

    /// Register `handler` for frames of type `kind` (or `ANY_EVENT`) on
    /// `room`. Must be called from within a Tokio runtime.
    pub fn subscribe<F>(&self, room: &str, kind: &str, handler: F) -> Subscription
    where
        F: Fn(&Incoming) + Send + Sync + 'static,
    {
        let id = self.inner.next_handler.fetch_add(1, Ordering::Relaxed);
        let entry = HandlerEntry {
            id,
            kind: kind.to_string(),
            handler: Arc::new(handler),
        };

        if self.inner.stopped.load(Ordering::Acquire) {
            warn!(%room, event = %kind, "Subscribe after shutdown ignored");
            return Subscription::inert(room);
        }

        let mut rooms = self.inner.rooms.lock();
        match rooms.get_mut(room) {
            Some(slot) => {
                slot.handlers.push(entry);
                let gave_up = *slot.state.borrow() == ConnectionState::Error;
                if gave_up || slot.task.is_finished() {
                    slot.task.abort();
                    slot.state.send_replace(ConnectionState::Connecting);
                    slot.task = self.spawn_connection(room, slot.state.clone());
                    info!(%room, "Reopening stream that had given up");
                }
            }
            None => {
                let (state, _) = watch::channel(ConnectionState::Connecting);
                let task = self.spawn_connection(room, state.clone());
                debug!(%room, "Opening stream for first subscriber");
                rooms.insert(
                    room.to_string(),
                    RoomSlot {
                        handlers: vec![entry],
                        state,
                        task,
                    },
                );
            }
        }

        Subscription {
            inner: Arc::downgrade(&self.inner),
            room: room.to_string(),
            handler_id: id,
            active: true,
        }
    }

    fn spawn_connection(&self, room: &str, state: watch::Sender<ConnectionState>) -> JoinHandle<()> {
        tokio::spawn(run_connection(Arc::downgrade(&self.inner), room.to_string(), state))
    }

    /// Publish an event to `room` as the current user
    pub async fn trigger(&self, room: &str, kind: &str, payload: Value) -> Result<(), ClientError> {
        if self.inner.stopped.load(Ordering::Acquire) {
            return Err(ClientError::NotRunning);
        }
        let request = EmitRequest {
            room: room.to_string(),
            event: kind.to_string(),
            payload,
            user: self.user(),
        };
        self.inner.transport.emit(&request).await
    }

    /// `trigger` with a typed payload
    pub async fn trigger_json<T: Serialize>(&self, room: &str, kind: &str, payload: &T) -> Result<(), ClientError> {
        let payload = serde_json::to_value(payload)?;
        self.trigger(room, kind, payload).await
    }

    pub fn state(&self, room: &str) -> Option<ConnectionState> {
        self.inner.rooms.lock().get(room).map(|slot| *slot.state.borrow())
    }

    /// Follow a room's connection state; `None` when the room is not open
    pub fn watch_state(&self, room: &str) -> Option<watch::Receiver<ConnectionState>> {
        self.inner.rooms.lock().get(room).map(|slot| slot.state.subscribe())
    }

    /// Rooms with a live stream
    pub fn rooms(&self) -> Vec<String> {
        let mut rooms: Vec<String> = self.inner.rooms.lock().keys().cloned().collect();
        rooms.sort();
        rooms
    }

    pub fn subscriber_count(&self, room: &str) -> usize {
        self.inner.rooms.lock().get(room).map_or(0, |slot| slot.handlers.len())
    }

    /// Close every stream. Outstanding subscriptions become no-ops.
    pub fn shutdown(&self) {
        self.inner.stopped.store(true, Ordering::Release);
        let slots: Vec<(String, RoomSlot)> = self.inner.rooms.lock().drain().collect();
        for (room, slot) in slots {
            slot.task.abort();
            debug!(%room, "Stream closed on shutdown");
        }
    }
}

/// Handle of one registered handler; releases it when dropped
#[must_use = "dropping a Subscription unsubscribes immediately"]
pub struct Subscription {
    inner: Weak<Inner>,
    room: String,
    handler_id: u64,
    active: bool,
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("room", &self.room)
            .field("active", &self.active)
            .finish()
    }
}

impl Subscription {
    fn inert(room: &str) -> Self {
        Self {
            inner: Weak::new(),
            room: room.to_string(),
            handler_id: 0,
            active: false,
        }
    }

    pub fn room(&self) -> &str {
        &self.room
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Release the handler; later calls do nothing
    pub fn unsubscribe(&mut self) {
        if !std::mem::take(&mut self.active) {
            return;
        }
        if let Some(inner) = self.inner.upgrade() {
            inner.release(&self.room, self.handler_id);
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

async fn run_connection(inner: Weak<Inner>, room: String, state: watch::Sender<ConnectionState>) {
    let Some(config) = inner.upgrade().map(|i| i.config.clone()) else {
        return;
    };
    let mut backoff = Backoff::new(config.backoff.clone());

    loop {
        let Some((transport, params)) = inner
            .upgrade()
            .map(|i| (Arc::clone(&i.transport), StreamParams::new(room.as_str(), &i.user.read())))
        else {
            return;
        };

        match transport.open_stream(&params).await {
            Ok(frames) => {
                backoff.reset();
                state.send_replace(ConnectionState::Connected);
                info!(%room, user = %params.id, "Stream connected");
                let reason = pump(&inner, &room, frames, config.stale_after).await;
                warn!(%room, reason, "Stream interrupted");
            }
            Err(e) => warn!(%room, error = %e, "Failed to open stream"),
        }

        match backoff.next_delay() {
            Some(delay) => {
                state.send_replace(ConnectionState::Reconnecting);
                debug!(%room, attempt = backoff.attempts(), ?delay, "Reconnecting");
                tokio::time::sleep(delay).await;
            }
            None => {
                state.send_replace(ConnectionState::Error);
                error!(%room, attempts = backoff.attempts(), "Giving up on stream");
                return;
            }
        }
    }
}

async fn pump(inner: &Weak<Inner>, room: &str, mut frames: FrameStream, stale_after: Option<Duration>) -> &'static str {
    loop {
        let next = match stale_after {
            Some(limit) => match tokio::time::timeout(limit, frames.next()).await {
                Ok(next) => next,
                Err(_) => return "no traffic within heartbeat window",
            },
            None => frames.next().await,
        };

        match next {
            Some(Ok(frame)) => {
                let Some(inner) = inner.upgrade() else {
                    return "client dropped";
                };
                inner.dispatch(room, &frame);
            }
            Some(Err(e)) => {
                warn!(%room, error = %e, "Stream error");
                return "transport error";
            }
            None => return "closed by server",
        }
    }
}
