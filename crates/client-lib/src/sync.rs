//! Team synchronization engine.
//!
//! Consumes the frames of a team's main room and of the current user's
//! personal channel and folds them into a roster with presence, typing
//! indicators and unread direct-message counters. Commands publish through
//! the multiplexer; the engine never talks to the wire directly.
//!
//! `SyncState` holds the state machine and is driven with explicit
//! instants so it can be tested without a runtime. `TeamSync` wires it to
//! a `Multiplexer` and runs the periodic sweep (typing expiry, idle away).

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use relay_common::{
    dm_key, kinds, now_millis, parse_dm_key, user_channel, ChatMessage, Presence, PresenceStatus,
    RealtimeEvent, StatusChange, Timestamp, TypingSignal, TypingState, User,
};
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::ClientError;
use crate::multiplexer::{Incoming, Multiplexer, Subscription, ANY_EVENT};

/// Message ids remembered for deduplication
const SEEN_CAPACITY: usize = 512;

#[derive(Debug, Clone, PartialEq)]
pub struct SyncConfig {
    /// Shared broadcast room of the team
    pub main_room: String,
    /// Local inactivity after which the user's own status turns away
    pub idle_after: Duration,
    /// Typing indicators lapse without a refresh after this long
    pub typing_expiry: Duration,
    pub sweep_interval: Duration,
}

impl SyncConfig {
    pub fn new(main_room: impl Into<String>) -> Self {
        Self {
            main_room: main_room.into(),
            idle_after: Duration::from_secs(5 * 60),
            typing_expiry: Duration::from_secs(4),
            sweep_interval: Duration::from_secs(1),
        }
    }
}

/// One roster entry
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TeamMember {
    pub user: User,
    pub status: PresenceStatus,
    /// Epoch milliseconds of the last frame seen from this user
    pub last_seen: Timestamp,
    pub is_typing: bool,
    /// Room the user was last seen joining
    pub current_room: Option<String>,
}

/// Something the user should be told about while looking elsewhere
#[derive(Debug, Clone, PartialEq)]
pub struct Notification {
    /// Event type name
    pub kind: String,
    pub room: String,
    pub from: User,
    pub preview: String,
}

/// Receives notifications for message-like events while unfocused
pub trait Notifier: Send + Sync {
    fn notify(&self, notification: Notification);
}

/// Notifier that only logs
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&self, notification: Notification) {
        info!(
            kind = %notification.kind,
            room = %notification.room,
            from = %notification.from.id,
            "{}",
            notification.preview
        );
    }
}

/// Result of applying one frame
#[derive(Debug, Default, PartialEq)]
pub struct Applied {
    pub changed: bool,
    pub notification: Option<Notification>,
}

/// Result of a sweep
#[derive(Debug, Default, PartialEq)]
pub struct Sweep {
    /// Users whose typing indicator lapsed
    pub expired_typing: Vec<String>,
    /// The current user just turned away through inactivity
    pub went_away: bool,
}

impl Sweep {
    pub fn changed(&self) -> bool {
        self.went_away || !self.expired_typing.is_empty()
    }
}

#[derive(Debug, Default)]
struct SeenIds {
    order: VecDeque<String>,
    ids: HashSet<String>,
}

impl SeenIds {
    /// False when the id was already seen
    fn insert(&mut self, id: &str) -> bool {
        if self.ids.contains(id) {
            return false;
        }
        if self.order.len() == SEEN_CAPACITY {
            if let Some(oldest) = self.order.pop_front() {
                self.ids.remove(&oldest);
            }
        }
        self.order.push_back(id.to_string());
        self.ids.insert(id.to_string());
        true
    }
}

#[derive(Debug, Clone)]
struct Typing {
    since: Instant,
    room: String,
}

#[derive(Debug)]
pub struct SyncState {
    me: User,
    my_status: PresenceStatus,
    away_is_automatic: bool,
    last_activity: Instant,
    members: HashMap<String, TeamMember>,
    typing: HashMap<String, Typing>,
    unread: HashMap<String, u32>,
    seen: SeenIds,
    focused: bool,
}

impl SyncState {
    pub fn new(me: User, now: Instant) -> Self {
        Self {
            me,
            my_status: PresenceStatus::Online,
            away_is_automatic: false,
            last_activity: now,
            members: HashMap::new(),
            typing: HashMap::new(),
            unread: HashMap::new(),
            seen: SeenIds::default(),
            focused: true,
        }
    }

    pub fn me(&self) -> &User {
        &self.me
    }

    pub fn my_status(&self) -> PresenceStatus {
        self.my_status
    }

    /// Fold one frame into the state
    pub fn apply(&mut self, incoming: &Incoming, now: Instant) -> Applied {
        let room = incoming.room.as_str();
        match &incoming.event {
            RealtimeEvent::Presence(presence) => {
                self.apply_presence(room, presence);
                return Applied {
                    changed: true,
                    notification: None,
                };
            }
            RealtimeEvent::Ready(_) | RealtimeEvent::Ping => return Applied::default(),
            _ => {}
        }

        let Some(sender) = &incoming.sender else {
            return Applied::default();
        };
        if sender.id == self.me.id {
            return Applied::default();
        }
        self.touch(sender, incoming.ts.unwrap_or_else(now_millis));

        let notification = match &incoming.event {
            RealtimeEvent::Typing(signal) => {
                match signal.state {
                    TypingState::Start => {
                        let typing = Typing {
                            since: now,
                            room: signal.room.clone().unwrap_or_else(|| room.to_string()),
                        };
                        self.typing.insert(sender.id.clone(), typing);
                    }
                    TypingState::Stop => {
                        self.typing.remove(&sender.id);
                    }
                }
                None
            }
            RealtimeEvent::UserStatus(change) => {
                if let Some(member) = self.members.get_mut(&sender.id) {
                    member.status = change.status;
                }
                if change.status == PresenceStatus::Offline {
                    self.typing.remove(&sender.id);
                }
                None
            }
            RealtimeEvent::Chat(message) => {
                self.typing.remove(&sender.id);
                if !self.seen.insert(&message.id) {
                    return Applied::default();
                }
                self.notification(incoming, room, sender, &message.text)
            }
            RealtimeEvent::Dm(message) => {
                if message.to.as_deref().is_some_and(|to| to != self.me.id) {
                    return Applied::default();
                }
                self.typing.remove(&sender.id);
                if !self.seen.insert(&message.id) {
                    return Applied::default();
                }
                *self.unread.entry(sender.id.clone()).or_default() += 1;
                self.notification(incoming, room, sender, &message.text)
            }
            RealtimeEvent::File(payload) | RealtimeEvent::Task(payload) => {
                let preview = ["name", "title", "text"]
                    .iter()
                    .find_map(|key| payload.get(key).and_then(|v| v.as_str()))
                    .unwrap_or(incoming.kind.as_str())
                    .to_string();
                self.notification(incoming, room, sender, &preview)
            }
            _ => None,
        };

        Applied {
            changed: true,
            notification,
        }
    }

    fn apply_presence(&mut self, room: &str, presence: &Presence) {
        match presence {
            Presence::State { members } => {
                let present: HashSet<&str> = members.iter().map(|u| u.id.as_str()).collect();
                let departed: Vec<String> = self
                    .members
                    .values()
                    .filter(|m| m.current_room.as_deref() == Some(room))
                    .filter(|m| !present.contains(m.user.id.as_str()))
                    .map(|m| m.user.id.clone())
                    .collect();
                for id in departed {
                    self.mark_offline(&id);
                }
                for user in members {
                    self.mark_online(room, user);
                }
            }
            Presence::Join { user } => self.mark_online(room, user),
            Presence::Leave { user } => self.mark_offline(&user.id),
        }
    }

    fn upsert(&mut self, user: &User) -> &mut TeamMember {
        let member = self
            .members
            .entry(user.id.clone())
            .or_insert_with(|| TeamMember {
                user: user.clone(),
                status: PresenceStatus::Offline,
                last_seen: 0,
                is_typing: false,
                current_room: None,
            });
        if !user.name.is_empty() {
            member.user.name = user.name.clone();
        }
        member.user.role = user.role;
        member
    }

    fn touch(&mut self, user: &User, ts: Timestamp) {
        let member = self.upsert(user);
        if member.status == PresenceStatus::Offline {
            member.status = PresenceStatus::Online;
        }
        member.last_seen = member.last_seen.max(ts);
    }

    fn mark_online(&mut self, room: &str, user: &User) {
        if user.id == self.me.id {
            return;
        }
        let member = self.upsert(user);
        if member.status == PresenceStatus::Offline {
            member.status = PresenceStatus::Online;
        }
        member.current_room = Some(room.to_string());
        member.last_seen = now_millis();
    }

    fn mark_offline(&mut self, user_id: &str) {
        if let Some(member) = self.members.get_mut(user_id) {
            member.status = PresenceStatus::Offline;
            member.current_room = None;
        }
        self.typing.remove(user_id);
    }

    fn notification(&self, incoming: &Incoming, room: &str, from: &User, preview: &str) -> Option<Notification> {
        let wanted = incoming.event.is_message_like() && !self.focused;
        wanted.then(|| Notification {
            kind: incoming.kind.clone(),
            room: room.to_string(),
            from: from.clone(),
            preview: preview.to_string(),
        })
    }

    /// Lapse stale typing indicators and turn idle self away
    pub fn sweep(&mut self, now: Instant, idle_after: Duration, typing_expiry: Duration) -> Sweep {
        let mut expired_typing = Vec::new();
        self.typing.retain(|id, typing| {
            let alive = now.saturating_duration_since(typing.since) < typing_expiry;
            if !alive {
                expired_typing.push(id.clone());
            }
            alive
        });

        let idle = now.saturating_duration_since(self.last_activity) >= idle_after;
        let went_away = idle && self.my_status == PresenceStatus::Online;
        if went_away {
            self.my_status = PresenceStatus::Away;
            self.away_is_automatic = true;
        }

        Sweep {
            expired_typing,
            went_away,
        }
    }

    /// Note local input; returns true when this ends an automatic away
    pub fn record_activity(&mut self, now: Instant) -> bool {
        self.last_activity = now;
        if self.away_is_automatic && self.my_status == PresenceStatus::Away {
            self.my_status = PresenceStatus::Online;
            self.away_is_automatic = false;
            return true;
        }
        false
    }

    /// Explicit status choice; never overridden by the idle sweep unless online
    pub fn set_status(&mut self, status: PresenceStatus) {
        self.my_status = status;
        self.away_is_automatic = false;
    }

    pub fn set_focused(&mut self, focused: bool) {
        self.focused = focused;
    }

    pub fn mark_read(&mut self, user_id: &str) -> bool {
        self.unread.remove(user_id).is_some()
    }

    /// Current user first, then others by status and name
    pub fn roster(&self) -> Vec<TeamMember> {
        let mut others: Vec<TeamMember> = self
            .members
            .values()
            .map(|member| TeamMember {
                is_typing: self.typing.contains_key(&member.user.id),
                ..member.clone()
            })
            .collect();
        others.sort_by(|a, b| {
            status_rank(a.status)
                .cmp(&status_rank(b.status))
                .then_with(|| a.user.name.cmp(&b.user.name))
                .then_with(|| a.user.id.cmp(&b.user.id))
        });

        let me = TeamMember {
            user: self.me.clone(),
            status: self.my_status,
            last_seen: now_millis(),
            is_typing: false,
            current_room: None,
        };
        std::iter::once(me).chain(others).collect()
    }

    pub fn member(&self, user_id: &str) -> Option<TeamMember> {
        self.members.get(user_id).map(|member| TeamMember {
            is_typing: self.typing.contains_key(user_id),
            ..member.clone()
        })
    }

    /// Users typing, optionally restricted to one room
    pub fn typing_users(&self, room: Option<&str>) -> Vec<User> {
        let mut users: Vec<User> = self
            .typing
            .iter()
            .filter(|(_, typing)| room.is_none_or(|r| typing.room == r))
            .filter_map(|(id, _)| self.members.get(id).map(|m| m.user.clone()))
            .collect();
        users.sort_by(|a, b| a.id.cmp(&b.id));
        users
    }

    pub fn unread_count(&self, user_id: &str) -> u32 {
        self.unread.get(user_id).copied().unwrap_or(0)
    }

    pub fn unread_counts(&self) -> HashMap<String, u32> {
        self.unread.clone()
    }

    pub fn total_unread(&self) -> u32 {
        self.unread.values().sum()
    }
}

fn status_rank(status: PresenceStatus) -> u8 {
    match status {
        PresenceStatus::Online => 0,
        PresenceStatus::Busy => 1,
        PresenceStatus::Away => 2,
        PresenceStatus::Offline => 3,
    }
}

struct Shared {
    state: Mutex<SyncState>,
    notifier: Arc<dyn Notifier>,
    revision: watch::Sender<u64>,
}

impl Shared {
    fn handle(&self, incoming: &Incoming) {
        let applied = self.state.lock().apply(incoming, Instant::now());
        if let Some(notification) = applied.notification {
            self.notifier.notify(notification);
        }
        if applied.changed {
            self.bump();
        }
    }

    fn bump(&self) {
        self.revision.send_modify(|rev| *rev += 1);
    }
}

/// Running engine bound to one multiplexer
pub struct TeamSync {
    mux: Multiplexer,
    config: SyncConfig,
    shared: Arc<Shared>,
    subscriptions: Mutex<Vec<Subscription>>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl TeamSync {
    /// Subscribe to the main room and the personal channel of the
    /// multiplexer's user. Must be called from within a Tokio runtime.
    pub fn start(mux: Multiplexer, config: SyncConfig, notifier: Arc<dyn Notifier>) -> Self {
        let me = mux.user();
        let (revision, _) = watch::channel(0);
        let shared = Arc::new(Shared {
            state: Mutex::new(SyncState::new(me.clone(), Instant::now())),
            notifier,
            revision,
        });

        let subscriptions = [config.main_room.clone(), user_channel(&me.id)]
            .into_iter()
            .map(|room| {
                let shared = Arc::clone(&shared);
                mux.subscribe(&room, ANY_EVENT, move |incoming| shared.handle(incoming))
            })
            .collect();

        let sweeper = tokio::spawn(sweep_loop(
            Arc::downgrade(&shared),
            mux.clone(),
            config.clone(),
        ));
        info!(room = %config.main_room, user = %me.id, "Team sync started");

        Self {
            mux,
            config,
            shared,
            subscriptions: Mutex::new(subscriptions),
            sweeper: Mutex::new(Some(sweeper)),
        }
    }

    pub fn me(&self) -> User {
        self.shared.state.lock().me().clone()
    }

    pub fn my_status(&self) -> PresenceStatus {
        self.shared.state.lock().my_status()
    }

    pub fn roster(&self) -> Vec<TeamMember> {
        self.shared.state.lock().roster()
    }

    pub fn member(&self, user_id: &str) -> Option<TeamMember> {
        self.shared.state.lock().member(user_id)
    }

    pub fn typing_users(&self, room: Option<&str>) -> Vec<User> {
        self.shared.state.lock().typing_users(room)
    }

    pub fn unread_count(&self, user_id: &str) -> u32 {
        self.shared.state.lock().unread_count(user_id)
    }

    pub fn unread_counts(&self) -> HashMap<String, u32> {
        self.shared.state.lock().unread_counts()
    }

    pub fn total_unread(&self) -> u32 {
        self.shared.state.lock().total_unread()
    }

    /// Revision counter bumped after every state change
    pub fn changes(&self) -> watch::Receiver<u64> {
        self.shared.revision.subscribe()
    }

    /// Post to the main room; returns the message as sent
    pub async fn send_public_message(&self, text: &str) -> Result<ChatMessage, ClientError> {
        self.record_activity().await?;
        let message = ChatMessage {
            id: new_message_id(),
            text: text.to_string(),
            reply_to: None,
            to: None,
            conversation: None,
        };
        self.mux
            .trigger_json(&self.config.main_room, kinds::CHAT, &message)
            .await?;
        Ok(message)
    }

    /// Deliver a direct message to `to`'s personal channel
    pub async fn send_private_message(&self, to: &str, text: &str) -> Result<ChatMessage, ClientError> {
        self.record_activity().await?;
        let me = self.me();
        let message = ChatMessage {
            id: new_message_id(),
            text: text.to_string(),
            reply_to: None,
            to: Some(to.to_string()),
            conversation: Some(dm_key(&me.id, to)),
        };
        self.mux
            .trigger_json(&user_channel(to), kinds::DM, &message)
            .await?;
        Ok(message)
    }

    /// Announce typing in `room` (the main room by default). Typing in a
    /// DM conversation goes to the other participant's personal channel.
    pub async fn set_typing(&self, is_typing: bool, room: Option<&str>) -> Result<(), ClientError> {
        let room = room.unwrap_or(&self.config.main_room);
        let target = match parse_dm_key(room) {
            Some((a, b)) => {
                let me = self.me();
                user_channel(if a == me.id { b } else { a })
            }
            None => room.to_string(),
        };
        let signal = TypingSignal {
            state: if is_typing {
                TypingState::Start
            } else {
                TypingState::Stop
            },
            room: Some(room.to_string()),
        };
        self.mux.trigger_json(&target, kinds::TYPING, &signal).await
    }

    pub async fn change_status(&self, status: PresenceStatus) -> Result<(), ClientError> {
        self.shared.state.lock().set_status(status);
        self.shared.bump();
        self.broadcast_status(status).await
    }

    pub fn mark_dm_as_read(&self, user_id: &str) {
        if self.shared.state.lock().mark_read(user_id) {
            self.shared.bump();
        }
    }

    /// Note local input; returns from an automatic away if needed
    pub async fn record_activity(&self) -> Result<(), ClientError> {
        let back = self.shared.state.lock().record_activity(Instant::now());
        if back {
            self.shared.bump();
            debug!("Back from idle");
            self.broadcast_status(PresenceStatus::Online).await?;
        }
        Ok(())
    }

    /// Notifications are raised only while unfocused
    pub fn set_focused(&self, focused: bool) {
        self.shared.state.lock().set_focused(focused);
    }

    async fn broadcast_status(&self, status: PresenceStatus) -> Result<(), ClientError> {
        self.mux
            .trigger_json(&self.config.main_room, kinds::USER_STATUS, &StatusChange { status })
            .await
    }

    /// Stop sweeping and release both subscriptions
    pub fn shutdown(&self) {
        if let Some(sweeper) = self.sweeper.lock().take() {
            sweeper.abort();
        }
        let released = std::mem::take(&mut *self.subscriptions.lock());
        if !released.is_empty() {
            info!(room = %self.config.main_room, "Team sync stopped");
        }
    }
}

impl Drop for TeamSync {
    fn drop(&mut self) {
        self.shutdown();
    }
}

async fn sweep_loop(shared: Weak<Shared>, mux: Multiplexer, config: SyncConfig) {
    let mut ticker = tokio::time::interval(config.sweep_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;
        let Some(shared) = shared.upgrade() else {
            return;
        };
        let sweep = shared
            .state
            .lock()
            .sweep(Instant::now(), config.idle_after, config.typing_expiry);

        if sweep.went_away {
            info!("Marking self away after inactivity");
            let change = StatusChange {
                status: PresenceStatus::Away,
            };
            if let Err(e) = mux
                .trigger_json(&config.main_room, kinds::USER_STATUS, &change)
                .await
            {
                warn!(error = %e, "Failed to announce away status");
            }
        }
        if sweep.changed() {
            shared.bump();
        }
    }
}

fn new_message_id() -> String {
    Uuid::new_v4().to_string()
}
