//! In-process pub/sub with per-channel replay buffers.
//!
//! The realtime bus is the status backbone of the orchestrator: every agent
//! lifecycle change, workflow phase, chat chunk, and error is broadcast here
//! so external subscribers (a WebSocket layer or equivalent) can stream it to
//! users.  The bus itself knows nothing about transports; subscribers are
//! opaque [`Subscriber`] handles.
//!
//! # Delivery semantics
//!
//! - Per-channel event order is preserved for every live subscriber.
//! - Delivery is best-effort and **never blocks the producer**: a subscriber
//!   whose [`Subscriber::deliver`] returns `false` (closed, or too slow to
//!   drain its queue) is dropped from the bus rather than stalling it.
//! - Every channel keeps a fixed-size ring buffer (default 50) so late
//!   joiners can [`replay`](RealtimeBus::replay) recent history.
//!
//! # Channels
//!
//! `"global"` receives every broadcast.  Scoped channels follow the
//! `chat:{session_id}` / `agent:{agent_id}` / `workflow:{workflow_id}`
//! scheme; see [`chat_channel`], [`agent_channel`], [`workflow_channel`].
//!
//! # Example
//!
//! ```rust
//! use agentry::realtime::{ChannelSubscriber, EventKind, RealtimeBus};
//!
//! let bus = RealtimeBus::new();
//! let (subscriber, mut rx) = ChannelSubscriber::bounded(16);
//! let sub_id = bus.subscribe(subscriber);
//!
//! bus.broadcast("chat:demo", EventKind::ChatStream, serde_json::json!({"chunk": "hi"}));
//!
//! // The greeting plus the broadcast (the new subscriber listens on "global").
//! assert!(rx.try_recv().is_ok());
//! assert!(rx.try_recv().is_ok());
//! bus.unsubscribe(sub_id);
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

/// Channel that receives every broadcast regardless of its target channel.
pub const GLOBAL_CHANNEL: &str = "global";

/// Default number of events retained per channel for late joiners.
pub const DEFAULT_BUFFER_SIZE: usize = 50;

/// `chat:{session_id}`
pub fn chat_channel(session_id: &str) -> String {
    format!("chat:{}", session_id)
}

/// `agent:{agent_id}`
pub fn agent_channel(agent_id: &str) -> String {
    format!("agent:{}", agent_id)
}

/// `workflow:{workflow_id}`
pub fn workflow_channel(workflow_id: &str) -> String {
    format!("workflow:{}", workflow_id)
}

/// The closed set of event kinds the bus carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    ConnectionEstablished,
    ChatMessage,
    ChatStream,
    ChatResponse,
    AgentCreated,
    AgentUpdated,
    AgentDeleted,
    AgentStatusChanged,
    AgentLog,
    AgentMessage,
    WorkflowUpdate,
    AgentCollaboration,
    Error,
    Pong,
}

/// One broadcast event.
#[derive(Debug, Clone, Serialize)]
pub struct RealtimeEvent {
    /// Channel the event was broadcast on.
    pub channel: String,
    /// Event classification, one of the closed [`EventKind`] set.
    pub kind: EventKind,
    /// When the event was created.
    pub timestamp: DateTime<Utc>,
    /// Event-specific body.
    pub payload: serde_json::Value,
}

/// A delivery endpoint registered with the bus.
///
/// `deliver` must be **non-blocking**: implementations should hand the event
/// to an internal queue (`try_send`) and return immediately.  Returning
/// `false` signals a dead or saturated endpoint; the bus responds by
/// unsubscribing it.
pub trait Subscriber: Send + Sync {
    fn deliver(&self, event: &RealtimeEvent) -> bool;
}

/// Reference [`Subscriber`] over a bounded tokio channel.
///
/// `deliver` uses `try_send`, so a receiver that stops draining causes the
/// subscriber to be dropped from the bus instead of blocking producers.
pub struct ChannelSubscriber {
    tx: mpsc::Sender<RealtimeEvent>,
}

impl ChannelSubscriber {
    /// Create a subscriber with an internal queue of `capacity` events,
    /// returning the handle to register plus the receiving end.
    pub fn bounded(capacity: usize) -> (Arc<Self>, mpsc::Receiver<RealtimeEvent>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Arc::new(Self { tx }), rx)
    }
}

impl Subscriber for ChannelSubscriber {
    fn deliver(&self, event: &RealtimeEvent) -> bool {
        self.tx.try_send(event.clone()).is_ok()
    }
}

/// Opaque handle identifying one subscription.
pub type SubscriptionId = u64;

struct SubscriberEntry {
    handle: Arc<dyn Subscriber>,
    channels: HashSet<String>,
}

struct BusState {
    next_id: SubscriptionId,
    subscribers: HashMap<SubscriptionId, SubscriberEntry>,
    buffers: HashMap<String, VecDeque<RealtimeEvent>>,
}

/// The pub/sub hub.  Cheap to share via `Arc`; all operations are
/// short critical sections over a plain mutex and never await.
pub struct RealtimeBus {
    state: Mutex<BusState>,
    buffer_size: usize,
}

impl Default for RealtimeBus {
    fn default() -> Self {
        Self::new()
    }
}

impl RealtimeBus {
    pub fn new() -> Self {
        Self::with_buffer_size(DEFAULT_BUFFER_SIZE)
    }

    /// Create a bus retaining `buffer_size` events per channel.
    pub fn with_buffer_size(buffer_size: usize) -> Self {
        Self {
            state: Mutex::new(BusState {
                next_id: 1,
                subscribers: HashMap::new(),
                buffers: HashMap::new(),
            }),
            buffer_size,
        }
    }

    /// Register a subscriber.  New subscribers listen on [`GLOBAL_CHANNEL`]
    /// and immediately receive a `connection_established` greeting.
    pub fn subscribe(&self, handle: Arc<dyn Subscriber>) -> SubscriptionId {
        let mut state = self.state.lock().expect("bus state poisoned");
        let id = state.next_id;
        state.next_id += 1;

        let greeting = RealtimeEvent {
            channel: GLOBAL_CHANNEL.to_string(),
            kind: EventKind::ConnectionEstablished,
            timestamp: Utc::now(),
            payload: serde_json::json!({ "subscription_id": id }),
        };
        handle.deliver(&greeting);

        let mut channels = HashSet::new();
        channels.insert(GLOBAL_CHANNEL.to_string());
        state.subscribers.insert(id, SubscriberEntry { handle, channels });
        log::debug!("subscriber {} connected ({} total)", id, state.subscribers.len());
        id
    }

    pub fn unsubscribe(&self, id: SubscriptionId) {
        let mut state = self.state.lock().expect("bus state poisoned");
        if state.subscribers.remove(&id).is_some() {
            log::debug!("subscriber {} disconnected ({} left)", id, state.subscribers.len());
        }
    }

    /// Add `channel` to the subscription's channel set.
    pub fn subscribe_channel(&self, id: SubscriptionId, channel: &str) {
        let mut state = self.state.lock().expect("bus state poisoned");
        if let Some(entry) = state.subscribers.get_mut(&id) {
            entry.channels.insert(channel.to_string());
        }
    }

    /// Remove `channel` from the subscription's channel set.
    pub fn unsubscribe_channel(&self, id: SubscriptionId, channel: &str) {
        let mut state = self.state.lock().expect("bus state poisoned");
        if let Some(entry) = state.subscribers.get_mut(&id) {
            entry.channels.remove(channel);
        }
    }

    /// Broadcast an event on `channel`.
    ///
    /// The event is appended to the channel's ring buffer and fanned out to
    /// every subscriber of `channel` plus every subscriber of `global`.
    /// Subscribers whose delivery fails are unsubscribed.
    pub fn broadcast(&self, channel: &str, kind: EventKind, payload: serde_json::Value) -> RealtimeEvent {
        let event = RealtimeEvent {
            channel: channel.to_string(),
            kind,
            timestamp: Utc::now(),
            payload,
        };

        let mut state = self.state.lock().expect("bus state poisoned");

        let buffer = state.buffers.entry(channel.to_string()).or_default();
        buffer.push_back(event.clone());
        while buffer.len() > self.buffer_size {
            buffer.pop_front();
        }

        let mut dead: Vec<SubscriptionId> = Vec::new();
        for (id, entry) in &state.subscribers {
            if entry.channels.contains(channel) || entry.channels.contains(GLOBAL_CHANNEL) {
                if !entry.handle.deliver(&event) {
                    dead.push(*id);
                }
            }
        }
        for id in dead {
            state.subscribers.remove(&id);
            log::warn!("dropped unresponsive subscriber {}", id);
        }

        event
    }

    /// Deliver an event to a single subscriber, bypassing channel fan-out
    /// and the ring buffers.  Used for request/response frames like `pong`.
    /// Returns `false` when the subscription is gone or delivery failed.
    pub fn send_to(&self, id: SubscriptionId, kind: EventKind, payload: serde_json::Value) -> bool {
        let event = RealtimeEvent {
            channel: GLOBAL_CHANNEL.to_string(),
            kind,
            timestamp: Utc::now(),
            payload,
        };
        let state = self.state.lock().expect("bus state poisoned");
        state
            .subscribers
            .get(&id)
            .map(|entry| entry.handle.deliver(&event))
            .unwrap_or(false)
    }

    /// Send the buffered history of `channel` to one subscriber, in original
    /// order.  Returns how many events were replayed.
    pub fn replay(&self, id: SubscriptionId, channel: &str) -> usize {
        let state = self.state.lock().expect("bus state poisoned");
        let Some(entry) = state.subscribers.get(&id) else {
            return 0;
        };
        let Some(buffer) = state.buffers.get(channel) else {
            return 0;
        };
        let mut sent = 0;
        for event in buffer {
            if !entry.handle.deliver(event) {
                break;
            }
            sent += 1;
        }
        sent
    }

    /// Snapshot of a channel's ring buffer, oldest first.
    pub fn buffered(&self, channel: &str) -> Vec<RealtimeEvent> {
        let state = self.state.lock().expect("bus state poisoned");
        state
            .buffers
            .get(channel)
            .map(|b| b.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Number of live subscribers.
    pub fn subscriber_count(&self) -> usize {
        let state = self.state.lock().expect("bus state poisoned");
        state.subscribers.len()
    }
}

/// Frames a client can send over the subscription protocol (a WebSocket or
/// equivalent).  Parsed from JSON by tag: `{"type": "ping"}`,
/// `{"type": "subscribe_agent", "agent_id": "..."}`, and so on.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientRequest {
    Ping,
    SubscribeAgent { agent_id: String },
    UnsubscribeAgent { agent_id: String },
    GetBuffered { channel: String },
    Chat { session_id: String, message: String },
}
