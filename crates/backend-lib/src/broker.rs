// ============================
// relay-backend-lib/src/broker.rs
// ============================
//! Event broker.
//!
//! Fans published events out to every connection registered for a room
//! and synthesizes presence notifications when connections open and close.
//!
//! Delivery is at-most-once. Each connection owns a bounded queue and a
//! push never waits on it: a full queue drops the frame for that one
//! connection, a closed queue unregisters the connection on the spot.

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures_util::Stream;
use metrics::{counter, gauge, histogram};
use relay_common::{kinds, Envelope, Presence, Ready, User};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, info, warn};

use crate::config::Settings;
use crate::error::AppError;
use crate::metrics::{
    CONNECTION_PRUNED, EVENT_PUBLISHED, FANOUT_SIZE, FRAME_DELIVERED, FRAME_DROPPED,
    STREAM_ACTIVE, STREAM_CLOSED, STREAM_OPENED,
};
use crate::registry::{ConnectionHandle, ConnectionId, RoomRegistry};

/// A named frame, serialized once and shared by every recipient
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub event: Arc<str>,
    pub data: Arc<str>,
}

impl Frame {
    pub fn new(event: &str, data: &str) -> Self {
        Self {
            event: Arc::from(event),
            data: Arc::from(data),
        }
    }

    /// Serialize `data` as the JSON body of an `event` frame
    pub fn json<T: Serialize>(event: &str, data: &T) -> Result<Self, serde_json::Error> {
        let data = serde_json::to_string(data)?;
        Ok(Self {
            event: Arc::from(event),
            data: Arc::from(data),
        })
    }

    pub fn envelope(envelope: &Envelope) -> Result<Self, serde_json::Error> {
        Self::json(&envelope.kind, envelope)
    }

    pub fn presence(presence: &Presence) -> Result<Self, serde_json::Error> {
        Self::json(kinds::PRESENCE, presence)
    }
}

/// Fan-out options
#[derive(Debug, Clone)]
pub struct BrokerOptions {
    /// Deliver events back to connections of the publishing user
    pub echo_to_sender: bool,
    /// Queue depth of each connection
    pub buffer: usize,
}

impl Default for BrokerOptions {
    fn default() -> Self {
        Self {
            echo_to_sender: false,
            buffer: 64,
        }
    }
}

impl From<&Settings> for BrokerOptions {
    fn from(settings: &Settings) -> Self {
        Self {
            echo_to_sender: settings.broker.echo_to_sender,
            buffer: settings.stream.buffer,
        }
    }
}

/// What happened to one fan-out
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PublishReport {
    /// Connections the frame was offered to
    pub recipients: usize,
    /// Frames queued
    pub delivered: usize,
    /// Frames dropped because a queue was full
    pub dropped: usize,
    /// Connections found closed and unregistered
    pub pruned: usize,
}

/// Pushes events to the connections of a room
#[derive(Debug)]
pub struct Broker {
    registry: Arc<RoomRegistry>,
    options: BrokerOptions,
}

impl Broker {
    pub fn new(registry: Arc<RoomRegistry>, options: BrokerOptions) -> Self {
        Self { registry, options }
    }

    pub fn registry(&self) -> &Arc<RoomRegistry> {
        &self.registry
    }

    /// Publish an event to every connection of `room`.
    ///
    /// A room without connections makes this a silent no-op.
    pub fn publish(
        &self,
        room: &str,
        kind: &str,
        payload: Value,
        user: User,
    ) -> Result<PublishReport, AppError> {
        let envelope = Envelope::new(kind, user, payload);
        let frame = Frame::envelope(&envelope)?;
        let sender = envelope.user.id.as_str();
        let echo = self.options.echo_to_sender;

        let report = self.fan_out(room, &frame, |conn| echo || conn.user.id != sender);

        counter!(EVENT_PUBLISHED).increment(1);
        histogram!(FANOUT_SIZE).record(report.recipients as f64);
        debug!(
            room,
            event = kind,
            user_id = sender,
            delivered = report.delivered,
            dropped = report.dropped,
            "event published"
        );
        Ok(report)
    }

    /// Open a connection to `room` for `user`.
    ///
    /// The returned subscription starts with a `presence` state snapshot
    /// followed by a `ready` frame. Other members are told about the user
    /// when this is the user's first connection to the room. Dropping the
    /// subscription closes the connection.
    pub fn connect(self: &Arc<Self>, room: &str, user: User) -> Result<Subscription, AppError> {
        // room for the snapshot and ready frames
        let (tx, rx) = mpsc::channel(self.options.buffer.max(2));
        let conn = ConnectionHandle::new(user.clone(), tx);
        let id = conn.id;

        let mut greeting_error = None;
        let mut join_report = PublishReport::default();
        let mut closed = Vec::new();
        self.registry.register_with(room, conn, |admitted| {
            let conn = admitted.conn;
            let greeting = Frame::presence(&Presence::State {
                members: admitted.members.to_vec(),
            })
            .and_then(|state| {
                let ready = Frame::json(
                    kinds::READY,
                    &Ready {
                        connection_id: conn.id.to_string(),
                        room: room.to_string(),
                    },
                )?;
                Ok((state, ready))
            });
            match greeting {
                Ok((state, ready)) => {
                    let _ = conn.sink.try_send(state);
                    let _ = conn.sink.try_send(ready);
                },
                Err(e) => {
                    greeting_error = Some(e);
                    return;
                },
            }

            // join and leave of one user are queued under the same room lock
            if admitted.first_for_user {
                match Frame::presence(&Presence::Join { user: conn.user.clone() }) {
                    Ok(join) => {
                        join_report = offer(room, &join, admitted.connections, |other| other.id != id, &mut closed);
                    },
                    Err(e) => warn!(room, error = %e, "failed to encode join notification"),
                }
            }
        });

        let guard = ConnectionGuard {
            broker: Arc::clone(self),
            room: room.to_string(),
            id,
        };
        if let Some(e) = greeting_error {
            // guard unregisters on the way out
            return Err(e.into());
        }

        counter!(STREAM_OPENED).increment(1);
        gauge!(STREAM_ACTIVE).increment(1.0);
        info!(room, user_id = %user.id, connection_id = %id, "stream opened");
        self.settle(room, &mut join_report, closed);

        Ok(Subscription {
            id,
            room: room.to_string(),
            user,
            rx,
            _guard: guard,
        })
    }

    /// Close a connection. Safe to call more than once.
    ///
    /// Returns false when the connection was not registered.
    pub fn disconnect(&self, room: &str, id: ConnectionId) -> bool {
        let mut leave_report = PublishReport::default();
        let mut closed = Vec::new();
        let gone = self.registry.unregister_with(room, id, |gone, remaining| {
            if !gone.last_for_user {
                return;
            }
            match Frame::presence(&Presence::Leave { user: gone.user.clone() }) {
                Ok(leave) => leave_report = offer(room, &leave, remaining, |_| true, &mut closed),
                Err(e) => warn!(room, error = %e, "failed to encode leave notification"),
            }
        });
        let Some(gone) = gone else {
            debug!(room, connection_id = %id, "disconnect for unknown connection ignored");
            return false;
        };

        counter!(STREAM_CLOSED).increment(1);
        gauge!(STREAM_ACTIVE).decrement(1.0);
        info!(room, user_id = %gone.user.id, connection_id = %id, "stream closed");
        self.settle(room, &mut leave_report, closed);
        true
    }

    fn fan_out<F>(&self, room: &str, frame: &Frame, include: F) -> PublishReport
    where
        F: Fn(&ConnectionHandle) -> bool,
    {
        let mut closed = Vec::new();
        let mut report = offer(room, frame, &self.registry.recipients(room), include, &mut closed);
        self.settle(room, &mut report, closed);
        report
    }

    /// Record delivery metrics and unregister connections found closed
    fn settle(&self, room: &str, report: &mut PublishReport, closed: Vec<ConnectionId>) {
        counter!(FRAME_DELIVERED).increment(report.delivered as u64);
        if report.dropped > 0 {
            counter!(FRAME_DROPPED).increment(report.dropped as u64);
        }

        for id in closed {
            warn!(room, connection_id = %id, "connection gone, unregistering");
            if self.disconnect(room, id) {
                report.pruned += 1;
                counter!(CONNECTION_PRUNED).increment(1);
            }
        }
    }
}

/// Push `frame` to every included connection without waiting. Closed
/// connections are collected into `closed` for the caller to unregister
/// once the room lock is released.
fn offer<F>(
    room: &str,
    frame: &Frame,
    connections: &[ConnectionHandle],
    include: F,
    closed: &mut Vec<ConnectionId>,
) -> PublishReport
where
    F: Fn(&ConnectionHandle) -> bool,
{
    let mut report = PublishReport::default();
    for conn in connections {
        if !include(conn) {
            continue;
        }
        report.recipients += 1;
        match conn.sink.try_send(frame.clone()) {
            Ok(()) => report.delivered += 1,
            Err(TrySendError::Full(_)) => {
                report.dropped += 1;
                warn!(room, connection_id = %conn.id, event = %frame.event, "connection queue full, frame dropped");
            },
            Err(TrySendError::Closed(_)) => closed.push(conn.id),
        }
    }
    report
}

/// Unregisters a connection when dropped
#[derive(Debug)]
struct ConnectionGuard {
    broker: Arc<Broker>,
    room: String,
    id: ConnectionId,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.broker.disconnect(&self.room, self.id);
    }
}

/// Receiving side of one open connection
#[derive(Debug)]
pub struct Subscription {
    pub id: ConnectionId,
    pub room: String,
    pub user: User,
    rx: mpsc::Receiver<Frame>,
    _guard: ConnectionGuard,
}

impl Subscription {
    /// Next frame, or `None` once the connection was unregistered
    pub async fn recv(&mut self) -> Option<Frame> {
        self.rx.recv().await
    }

    /// Next queued frame without waiting
    pub fn try_recv(&mut self) -> Option<Frame> {
        self.rx.try_recv().ok()
    }
}

impl Stream for Subscription {
    type Item = Frame;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}
