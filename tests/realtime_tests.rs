use agentry::realtime::{
    chat_channel, ChannelSubscriber, EventKind, RealtimeBus, RealtimeEvent, Subscriber,
};
use std::sync::{Arc, Mutex};

/// Subscriber that records everything it receives.
struct Collector {
    events: Mutex<Vec<RealtimeEvent>>,
}

impl Collector {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            events: Mutex::new(Vec::new()),
        })
    }

    fn kinds(&self) -> Vec<EventKind> {
        self.events.lock().unwrap().iter().map(|e| e.kind).collect()
    }

    fn payloads(&self) -> Vec<serde_json::Value> {
        self.events.lock().unwrap().iter().map(|e| e.payload.clone()).collect()
    }
}

impl Subscriber for Collector {
    fn deliver(&self, event: &RealtimeEvent) -> bool {
        self.events.lock().unwrap().push(event.clone());
        true
    }
}

#[test]
fn subscriber_greeting_then_broadcasts_in_order() {
    let bus = RealtimeBus::new();
    let collector = Collector::new();
    bus.subscribe(collector.clone());

    for i in 0..3 {
        bus.broadcast("chat:s", EventKind::ChatStream, serde_json::json!({ "i": i }));
    }

    let kinds = collector.kinds();
    assert_eq!(kinds[0], EventKind::ConnectionEstablished);
    assert_eq!(kinds[1..], [EventKind::ChatStream; 3]);
    let payloads = collector.payloads();
    assert_eq!(payloads[1]["i"], 0);
    assert_eq!(payloads[3]["i"], 2);
}

#[test]
fn global_subscribers_see_every_channel() {
    let bus = RealtimeBus::new();
    let collector = Collector::new();
    bus.subscribe(collector.clone());

    bus.broadcast("agent:a1", EventKind::AgentLog, serde_json::json!({}));
    bus.broadcast("workflow:w1", EventKind::WorkflowUpdate, serde_json::json!({}));

    // Greeting + both broadcasts, despite no explicit channel subscription.
    assert_eq!(collector.kinds().len(), 3);
}

#[test]
fn channel_scoping_after_leaving_global() {
    let bus = RealtimeBus::new();
    let collector = Collector::new();
    let id = bus.subscribe(collector.clone());
    bus.unsubscribe_channel(id, "global");
    bus.subscribe_channel(id, "agent:a1");

    bus.broadcast("agent:a1", EventKind::AgentLog, serde_json::json!({ "seen": true }));
    bus.broadcast("agent:other", EventKind::AgentLog, serde_json::json!({ "seen": false }));

    let events: Vec<EventKind> = collector
        .kinds()
        .into_iter()
        .filter(|k| *k == EventKind::AgentLog)
        .collect();
    assert_eq!(events.len(), 1);
}

#[test]
fn late_joiner_replays_buffered_history_in_order() {
    let bus = RealtimeBus::new();
    let channel = chat_channel("S6");

    // Three events broadcast before anyone subscribes.
    for i in 0..3 {
        bus.broadcast(&channel, EventKind::ChatStream, serde_json::json!({ "chunk": i }));
    }

    let collector = Collector::new();
    let id = bus.subscribe(collector.clone());
    let replayed = bus.replay(id, &channel);
    assert_eq!(replayed, 3);

    // One live event after the replay.
    bus.broadcast(&channel, EventKind::ChatStream, serde_json::json!({ "chunk": 99 }));

    let streamed: Vec<serde_json::Value> = collector
        .events
        .lock()
        .unwrap()
        .iter()
        .filter(|e| e.kind == EventKind::ChatStream)
        .map(|e| e.payload.clone())
        .collect();
    assert_eq!(streamed.len(), 4);
    assert_eq!(streamed[0]["chunk"], 0);
    assert_eq!(streamed[1]["chunk"], 1);
    assert_eq!(streamed[2]["chunk"], 2);
    assert_eq!(streamed[3]["chunk"], 99);
}

#[test]
fn replay_for_unknown_channel_or_subscriber_is_empty() {
    let bus = RealtimeBus::new();
    let collector = Collector::new();
    let id = bus.subscribe(collector);
    assert_eq!(bus.replay(id, "chat:nothing"), 0);
    assert_eq!(bus.replay(9999, "chat:nothing"), 0);
}

#[test]
fn saturated_channel_subscriber_is_dropped_not_blocking() {
    let bus = RealtimeBus::new();
    let (subscriber, rx) = ChannelSubscriber::bounded(2);
    bus.subscribe(subscriber);
    assert_eq!(bus.subscriber_count(), 1);

    // Receiver never drains; the greeting took one slot.  The second
    // broadcast fills the queue, the third fails and drops the subscriber.
    bus.broadcast("c", EventKind::AgentLog, serde_json::json!({}));
    bus.broadcast("c", EventKind::AgentLog, serde_json::json!({}));
    assert_eq!(bus.subscriber_count(), 0);
    drop(rx);
}

#[test]
fn send_to_targets_one_subscriber() {
    let bus = RealtimeBus::new();
    let a = Collector::new();
    let b = Collector::new();
    let id_a = bus.subscribe(a.clone());
    bus.subscribe(b.clone());

    assert!(bus.send_to(id_a, EventKind::Pong, serde_json::json!({})));

    assert!(a.kinds().contains(&EventKind::Pong));
    assert!(!b.kinds().contains(&EventKind::Pong));
}
