// ==============
// crates/backend-lib/src/metrics.rs

//! Central place for metric keys, recorded through the `metrics` facade
pub const STREAM_OPENED: &str = "stream.opened";
pub const STREAM_CLOSED: &str = "stream.closed";
pub const STREAM_ACTIVE: &str = "stream.active";
pub const EVENT_PUBLISHED: &str = "event.published";
pub const FRAME_DELIVERED: &str = "frame.delivered";
pub const FRAME_DROPPED: &str = "frame.dropped";
pub const CONNECTION_PRUNED: &str = "connection.pruned";
pub const FANOUT_SIZE: &str = "fanout.size";
pub const EMIT_REJECTED: &str = "emit.rejected";
