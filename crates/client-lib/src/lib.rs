// ============================
// relay-client-lib/src/lib.rs
// ============================
//! Client side of the relay.
//!
//! `Multiplexer` shares one event stream per room among any number of
//! subscribers and publishes through the emit endpoint. `TeamSync` builds
//! a team roster, typing indicators and unread counters on top of it.

pub mod backoff;
pub mod config;
pub mod error;
pub mod frame;
pub mod identity;
pub mod multiplexer;
pub mod sync;
pub mod transport;

pub use config::{BackoffConfig, ClientConfig};
pub use error::ClientError;
pub use identity::IdentityStore;
pub use multiplexer::{ConnectionState, Incoming, Multiplexer, Subscription, UserPatch, ANY_EVENT};
pub use sync::{LogNotifier, Notification, Notifier, SyncConfig, TeamMember, TeamSync};
pub use transport::{HttpTransport, Transport};
