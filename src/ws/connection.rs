//! Per-connection actor (§3 `Connection`, §4.I state machine and
//! backpressure policy).
//!
//! Grounded on the teacher's `ClientSubscriptions` (per-client
//! `mpsc::UnboundedSender` + activity timestamp) in
//! `integration/mcp/subscriptions.rs`, generalized per §9's Design Note:
//! "Per-connection timers and promise-based backpressure retries: model as
//! a per-connection actor/task consuming an outbound queue; the write loop
//! implements threshold/backoff/close deterministically." One task owns
//! the socket's read half and processes inbound client frames and outbound
//! delivery commands from a single `tokio::select!` loop, so outbound
//! frames on a connection are strictly serialized (§5 ordering guarantee)
//! without needing a lock around the socket itself. A second, simple
//! writer task drains the outbound queue so a slow socket write never
//! blocks command processing.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{CloseFrame, Message, WebSocket};
use chrono::Utc;
use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::auth::resolver::AuthContext;
use crate::events::{Event, EventType};
use crate::ws::filter::{self, NormalizedFilter, RawFilter};
use crate::ws::hub::WsHub;

/// §4.I backpressure policy.
pub const BACKPRESSURE_THRESHOLD_BYTES: usize = 512 * 1024;
pub const BACKPRESSURE_RETRY_DELAY: Duration = Duration::from_millis(100);
pub const BACKPRESSURE_MAX_RETRIES: u32 = 5;

pub const KEEPALIVE_GRACE: Duration = Duration::from_secs(15);
pub const IDLE_DISCONNECT: Duration = Duration::from_secs(30);
pub const SWEEP_IDLE_DISCONNECT: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
pub struct Subscription {
    pub id: String,
    pub event: EventType,
    pub raw_filter: Option<Value>,
    pub normalized_filter: NormalizedFilter,
}

/// Commands the hub (or the connection's own keepalive logic) pushes into
/// a connection's mailbox.
pub enum ConnectionCommand {
    Deliver(Event),
    Ping,
    Shutdown,
}

enum SendOutcome {
    Sent,
    Disconnect,
}

pub struct ConnectionHandle {
    pub id: String,
    pub ip: String,
    pub user_agent: String,
    pub auth: AuthContext,
    pub command_tx: mpsc::UnboundedSender<ConnectionCommand>,
    pub last_activity_epoch_ms: Arc<AtomicI64>,
    pub throttle_count: Arc<AtomicU64>,
}

impl ConnectionHandle {
    fn touch(&self) {
        self.last_activity_epoch_ms
            .store(Utc::now().timestamp_millis(), Ordering::Relaxed);
    }

    pub fn idle_for(&self) -> Duration {
        let last = self.last_activity_epoch_ms.load(Ordering::Relaxed);
        let now = Utc::now().timestamp_millis();
        Duration::from_millis((now - last).max(0) as u64)
    }
}

/// Spawn the actor for one accepted upgrade. Registers itself with `hub`
/// on entry and unregisters (across all shared registries) on exit, so a
/// caller only needs to call this once per accepted socket.
pub async fn run(hub: Arc<WsHub>, socket: WebSocket, ip: String, user_agent: String, auth: AuthContext) {
    let id = Uuid::new_v4().to_string();
    let (mut sink, mut stream) = socket.split();

    let (command_tx, mut command_rx) = mpsc::unbounded_channel::<ConnectionCommand>();
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<(Message, usize)>();
    let pending_bytes = Arc::new(AtomicUsize::new(0));

    let writer_pending = pending_bytes.clone();
    let writer = tokio::spawn(async move {
        while let Some((msg, len)) = out_rx.recv().await {
            if sink.send(msg).await.is_err() {
                break;
            }
            writer_pending.fetch_sub(len, Ordering::SeqCst);
        }
        let _ = sink.close().await;
    });

    let handle = Arc::new(ConnectionHandle {
        id: id.clone(),
        ip: ip.clone(),
        user_agent: user_agent.clone(),
        auth,
        command_tx,
        last_activity_epoch_ms: Arc::new(AtomicI64::new(Utc::now().timestamp_millis())),
        throttle_count: Arc::new(AtomicU64::new(0)),
    });
    hub.register(handle.clone()).await;

    let mut subscriptions: HashMap<String, Subscription> = HashMap::new();
    let mut subscription_counter: u64 = 0;

    'outer: loop {
        tokio::select! {
            incoming = stream.next() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => {
                        handle.touch();
                        handle_client_message(&hub, &handle, &mut subscriptions, &mut subscription_counter, &out_tx, &pending_bytes, &text).await;
                    }
                    Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => {
                        handle.touch();
                    }
                    Some(Ok(Message::Close(_))) | None => break 'outer,
                    Some(Ok(_)) => {}
                    Some(Err(err)) => {
                        warn!(connection_id = %id, error = %err, "websocket read error");
                        break 'outer;
                    }
                }
            }
            command = command_rx.recv() => {
                match command {
                    Some(ConnectionCommand::Deliver(event)) => {
                        deliver(&handle, &subscriptions, &out_tx, &pending_bytes, &event).await;
                    }
                    Some(ConnectionCommand::Ping) => {
                        let _ = send_control(&out_tx, &pending_bytes, &json!({"type": "ping"}));
                    }
                    Some(ConnectionCommand::Shutdown) | None => {
                        let _ = send_control(&out_tx, &pending_bytes, &json!({"type": "shutdown"}));
                        break 'outer;
                    }
                }
            }
        }

        if handle.idle_for() >= IDLE_DISCONNECT {
            debug!(connection_id = %id, "disconnecting idle websocket connection");
            break 'outer;
        }
    }

    drop(out_tx);
    let _ = writer.await;
    hub.unregister(&id).await;
}

async fn handle_client_message(
    hub: &Arc<WsHub>,
    handle: &Arc<ConnectionHandle>,
    subscriptions: &mut HashMap<String, Subscription>,
    subscription_counter: &mut u64,
    out_tx: &mpsc::UnboundedSender<(Message, usize)>,
    pending_bytes: &Arc<AtomicUsize>,
    text: &str,
) {
    let parsed: Result<Value, _> = serde_json::from_str(text);
    let Ok(parsed) = parsed else {
        let _ = send_control(
            out_tx,
            pending_bytes,
            &json!({"type": "error", "error": {"code": "INVALID_MESSAGE", "message": "message must be a JSON object"}}),
        );
        return;
    };

    let message_type = parsed.get("type").and_then(Value::as_str).unwrap_or("");

    match message_type {
        "subscribe" => {
            let event_raw = parsed
                .get("event")
                .or_else(|| parsed.get("channel"))
                .and_then(Value::as_str);

            let Some(event_raw) = event_raw else {
                let _ = send_control(
                    out_tx,
                    pending_bytes,
                    &json!({"type": "error", "error": {"code": "INVALID_SUBSCRIPTION", "message": "subscribe requires an 'event' field"}}),
                );
                return;
            };

            let Some(event_type) = EventType::parse(event_raw) else {
                let _ = send_control(
                    out_tx,
                    pending_bytes,
                    &json!({"type": "error", "error": {"code": "INVALID_SUBSCRIPTION", "message": format!("unknown event type '{}'", event_raw)}}),
                );
                return;
            };

            let raw_filter_value = parsed.get("filter").cloned();
            let raw_filter: RawFilter = raw_filter_value
                .clone()
                .map(|v| serde_json::from_value(v).unwrap_or_default())
                .unwrap_or_default();
            let normalized = filter::normalize_filter(&raw_filter);

            let subscription_id = parsed
                .get("subscriptionId")
                .and_then(Value::as_str)
                .map(|s| s.to_string())
                .unwrap_or_else(|| {
                    *subscription_counter += 1;
                    format!("sub-{}", subscription_counter)
                });

            let is_replace = subscriptions.contains_key(&subscription_id);
            if !is_replace {
                hub.index_subscribe(event_type, handle.id.clone()).await;
            }
            subscriptions.insert(
                subscription_id.clone(),
                Subscription {
                    id: subscription_id.clone(),
                    event: event_type,
                    raw_filter: raw_filter_value.clone(),
                    normalized_filter: normalized.clone(),
                },
            );

            let _ = send_control(
                out_tx,
                pending_bytes,
                &json!({
                    "type": "subscribed",
                    "event": event_type.as_wire_str(),
                    "subscriptionId": subscription_id,
                    "data": {"filter": raw_filter_value},
                }),
            );

            if let Some(last) = hub.last_event(event_type) {
                if filter::matches_event(&normalized, &last) {
                    deliver_one(out_tx, pending_bytes, &handle.throttle_count, &last).await;
                }
            }
        }
        "unsubscribe" => {
            let mut removed = 0usize;
            if let Some(sub_id) = parsed.get("subscriptionId").and_then(Value::as_str) {
                if let Some(sub) = subscriptions.remove(sub_id) {
                    hub.index_unsubscribe(sub.event, &handle.id, subscriptions).await;
                    removed = 1;
                }
            } else if let Some(event_raw) = parsed
                .get("event")
                .or_else(|| parsed.get("channel"))
                .and_then(Value::as_str)
            {
                if let Some(event_type) = EventType::parse(event_raw) {
                    let ids: Vec<String> = subscriptions
                        .iter()
                        .filter(|(_, s)| s.event == event_type)
                        .map(|(id, _)| id.clone())
                        .collect();
                    for id in ids {
                        subscriptions.remove(&id);
                        removed += 1;
                    }
                    hub.index_unsubscribe(event_type, &handle.id, subscriptions).await;
                }
            }
            let _ = send_control(
                out_tx,
                pending_bytes,
                &json!({
                    "type": "unsubscribed",
                    "data": {"removedSubscriptions": removed, "totalSubscriptions": subscriptions.len()},
                }),
            );
        }
        "unsubscribe_all" => {
            let events: Vec<EventType> = subscriptions.values().map(|s| s.event).collect();
            let removed = subscriptions.len();
            subscriptions.clear();
            for event_type in events {
                hub.index_unsubscribe(event_type, &handle.id, subscriptions).await;
            }
            let _ = send_control(
                out_tx,
                pending_bytes,
                &json!({
                    "type": "unsubscribed",
                    "data": {"removedSubscriptions": removed, "totalSubscriptions": 0},
                }),
            );
        }
        "ping" => {
            let _ = send_control(
                out_tx,
                pending_bytes,
                &json!({"type": "pong", "data": {"timestamp": Utc::now()}}),
            );
        }
        "list_subscriptions" => {
            let events: Vec<&str> = subscriptions.values().map(|s| s.event.as_wire_str()).collect();
            let details: Vec<Value> = subscriptions
                .values()
                .map(|s| json!({"id": s.id, "event": s.event.as_wire_str(), "filter": s.raw_filter}))
                .collect();
            let _ = send_control(
                out_tx,
                pending_bytes,
                &json!({"type": "subscriptions", "data": events, "details": details}),
            );
        }
        other => {
            let _ = send_control(
                out_tx,
                pending_bytes,
                &json!({"type": "error", "error": {"code": "UNKNOWN_MESSAGE_TYPE", "message": format!("unrecognized message type '{}'", other)}}),
            );
        }
    }
}

/// Build the outbound `event` frame per §4.I: for `file_change` the inner
/// `type` stays the change kind; for entity/relationship topics the
/// payload's `type` is relocated to `entityType` so the envelope's `type`
/// can remain the event topic.
fn build_event_frame(event: &Event) -> Value {
    let mut data = event.data.clone();
    if let Value::Object(map) = &mut data {
        if event.event_type.is_entity() || event.event_type.is_relationship() {
            if let Some(inner_type) = map.remove("type") {
                map.insert("entityType".to_string(), inner_type);
            }
        }
        map.insert("type".to_string(), json!(event.event_type.as_wire_str()));
        map.insert("timestamp".to_string(), json!(event.timestamp));
        if let Some(source) = &event.source {
            map.insert("source".to_string(), json!(source));
        }
    }
    json!({"type": "event", "data": data})
}

async fn deliver(
    handle: &Arc<ConnectionHandle>,
    subscriptions: &HashMap<String, Subscription>,
    out_tx: &mpsc::UnboundedSender<(Message, usize)>,
    pending_bytes: &Arc<AtomicUsize>,
    event: &Event,
) {
    let matches: Vec<&Subscription> = subscriptions
        .values()
        .filter(|s| s.event == event.event_type && filter::matches_event(&s.normalized_filter, event))
        .collect();
    if matches.is_empty() {
        return;
    }
    deliver_one(out_tx, pending_bytes, &handle.throttle_count, event).await;
}

async fn deliver_one(
    out_tx: &mpsc::UnboundedSender<(Message, usize)>,
    pending_bytes: &Arc<AtomicUsize>,
    throttle_count: &Arc<AtomicU64>,
    event: &Event,
) {
    let frame = build_event_frame(event);
    match send_with_backpressure(out_tx, pending_bytes, throttle_count, &frame).await {
        SendOutcome::Sent => {}
        SendOutcome::Disconnect => {
            let close = Message::Close(Some(CloseFrame {
                code: 1013,
                reason: "Backpressure threshold exceeded".into(),
            }));
            let _ = out_tx.send((close, 0));
        }
    }
}

/// Enqueue `value` unconditionally (protocol acks, errors, pongs — small
/// control frames that must reach the client even mid-backpressure).
fn send_control(
    out_tx: &mpsc::UnboundedSender<(Message, usize)>,
    pending_bytes: &Arc<AtomicUsize>,
    value: &Value,
) -> Result<(), ()> {
    let text = value.to_string();
    let len = text.len();
    pending_bytes.fetch_add(len, Ordering::SeqCst);
    out_tx
        .send((Message::Text(text), len))
        .map_err(|_| ())
}

/// §4.I backpressure algorithm: if the software outbound queue already
/// holds more than the threshold, emit a `throttled` frame and retry after
/// the fixed delay, up to the retry cap, then give up and signal the
/// caller to close the connection.
async fn send_with_backpressure(
    out_tx: &mpsc::UnboundedSender<(Message, usize)>,
    pending_bytes: &Arc<AtomicUsize>,
    throttle_count: &Arc<AtomicU64>,
    value: &Value,
) -> SendOutcome {
    let text = value.to_string();
    let len = text.len();
    let mut attempts = 0u32;

    loop {
        let current = pending_bytes.load(Ordering::SeqCst);
        if current + len <= BACKPRESSURE_THRESHOLD_BYTES {
            pending_bytes.fetch_add(len, Ordering::SeqCst);
            if out_tx.send((Message::Text(text), len)).is_err() {
                return SendOutcome::Disconnect;
            }
            return SendOutcome::Sent;
        }

        attempts += 1;
        throttle_count.fetch_add(1, Ordering::Relaxed);
        let _ = send_control(
            out_tx,
            pending_bytes,
            &json!({
                "type": "throttled",
                "data": {
                    "reason": "backpressure",
                    "buffered": current,
                    "threshold": BACKPRESSURE_THRESHOLD_BYTES,
                    "retryAfterMs": BACKPRESSURE_RETRY_DELAY.as_millis(),
                    "attempts": attempts,
                },
            }),
        );

        if attempts > BACKPRESSURE_MAX_RETRIES {
            return SendOutcome::Disconnect;
        }
        tokio::time::sleep(BACKPRESSURE_RETRY_DELAY).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn file_change_frame_preserves_change_kind() {
        let event = Event::new(EventType::FileChange, json!({"type": "created", "path": "/a.rs"}));
        let frame = build_event_frame(&event);
        assert_eq!(frame["type"], "event");
        assert_eq!(frame["data"]["type"], "created");
        assert_eq!(frame["data"]["path"], "/a.rs");
    }

    #[test]
    fn entity_frame_relocates_inner_type() {
        let event = Event::new(EventType::EntityCreated, json!({"type": "function", "name": "f"}));
        let frame = build_event_frame(&event);
        assert_eq!(frame["data"]["type"], "entity_created");
        assert_eq!(frame["data"]["entityType"], "function");
        assert_eq!(frame["data"]["name"], "f");
    }

    #[tokio::test]
    async fn send_with_backpressure_succeeds_under_threshold() {
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<(Message, usize)>();
        let pending = Arc::new(AtomicUsize::new(0));
        let throttle = Arc::new(AtomicU64::new(0));
        let outcome = send_with_backpressure(&out_tx, &pending, &throttle, &json!({"x": 1})).await;
        assert!(matches!(outcome, SendOutcome::Sent));
        assert!(out_rx.try_recv().is_ok());
    }

    #[tokio::test]
    async fn send_with_backpressure_disconnects_after_max_retries() {
        let (out_tx, _out_rx) = mpsc::unbounded_channel::<(Message, usize)>();
        let pending = Arc::new(AtomicUsize::new(BACKPRESSURE_THRESHOLD_BYTES + 1));
        let throttle = Arc::new(AtomicU64::new(0));
        let outcome = send_with_backpressure(&out_tx, &pending, &throttle, &json!({"x": 1})).await;
        assert!(matches!(outcome, SendOutcome::Disconnect));
        assert_eq!(throttle.load(Ordering::Relaxed), (BACKPRESSURE_MAX_RETRIES + 1) as u64);
    }
}
