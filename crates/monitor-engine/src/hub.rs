//! Subscriber registry and broadcast fan-out with per-client buffering,
//! plus the SSE wire framing the transport layer writes.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use watchtower_core::event::{Event, EventPayload, EventType};

/// Response headers a transport sends before streaming frames.
pub const SSE_HEADERS: [(&str, &str); 3] = [
    ("Content-Type", "text/event-stream"),
    ("Cache-Control", "no-cache"),
    ("Connection", "keep-alive"),
];

/// Render one event as an SSE frame.
///
/// Heartbeats omit the `id:` line; every other event carries its
/// hub-assigned id for client-side resume bookkeeping.
pub fn sse_frame(event: &Event) -> String {
    let data = serde_json::to_string(&event.data).unwrap_or_else(|_| "null".to_string());
    match event.event_type {
        EventType::Ping => format!("event: ping\ndata: {data}\n\n"),
        ty => format!("event: {ty}\ndata: {data}\nid: {}\n\n", event.id),
    }
}

pub(crate) enum HubCommand {
    Subscribe {
        filter: Option<HashSet<EventType>>,
        reply: oneshot::Sender<Subscription>,
    },
    Unsubscribe {
        subscriber_id: u64,
    },
    Broadcast {
        payload: EventPayload,
    },
    Shutdown,
}

/// Handle to the hub coordination loop.
#[derive(Clone)]
pub(crate) struct HubHandle {
    tx: mpsc::UnboundedSender<HubCommand>,
}

impl HubHandle {
    /// Stamp and fan out an event. Never blocks the caller.
    pub(crate) fn broadcast(&self, payload: EventPayload) {
        let _ = self.tx.send(HubCommand::Broadcast { payload });
    }

    /// Register a subscriber; `None` once the hub has shut down.
    pub(crate) async fn subscribe(
        &self,
        filter: Option<HashSet<EventType>>,
    ) -> Option<Subscription> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(HubCommand::Subscribe { filter, reply }).ok()?;
        rx.await.ok()
    }

    /// Close every subscriber channel and end the coordination loop.
    pub(crate) fn shutdown(&self) {
        let _ = self.tx.send(HubCommand::Shutdown);
    }
}

/// A live event subscription.
///
/// Events arrive in hub id order. The stream ends when the hub shuts down
/// or when this subscriber is evicted for not draining its queue.
pub struct Subscription {
    id: u64,
    rx: mpsc::Receiver<Event>,
    hub_tx: mpsc::UnboundedSender<HubCommand>,
}

impl Subscription {
    /// Receive the next event, or `None` once the channel is closed.
    pub async fn recv(&mut self) -> Option<Event> {
        self.rx.recv().await
    }

    /// Hub-assigned subscriber channel id.
    pub fn id(&self) -> u64 {
        self.id
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        let _ = self.hub_tx.send(HubCommand::Unsubscribe {
            subscriber_id: self.id,
        });
    }
}

/// Event entry point that outlives engine runs.
///
/// The result callback is installed before `start`, when no hub exists
/// yet; a `Broadcaster` routes into whichever hub is currently attached
/// and drops events while the engine is stopped.
#[derive(Clone, Default)]
pub struct Broadcaster {
    inner: Arc<RwLock<Option<mpsc::UnboundedSender<HubCommand>>>>,
}

impl Broadcaster {
    /// Fan out an event through the hub of the current run, if any.
    pub fn send(&self, payload: EventPayload) {
        if let Ok(guard) = self.inner.read() {
            if let Some(tx) = guard.as_ref() {
                let _ = tx.send(HubCommand::Broadcast { payload });
            }
        }
    }

    pub(crate) fn attach(&self, handle: &HubHandle) {
        if let Ok(mut guard) = self.inner.write() {
            *guard = Some(handle.tx.clone());
        }
    }

    pub(crate) fn detach(&self) {
        if let Ok(mut guard) = self.inner.write() {
            *guard = None;
        }
    }
}

struct Subscriber {
    tx: mpsc::Sender<Event>,
    filter: Option<HashSet<EventType>>,
}

struct Hub {
    subscribers: HashMap<u64, Subscriber>,
    next_subscriber_id: u64,
    next_event_id: u64,
    buffer: usize,
    self_tx: mpsc::UnboundedSender<HubCommand>,
}

/// Spawn the hub coordination loop.
pub(crate) fn spawn(
    buffer: usize,
    ping_interval: Duration,
) -> (HubHandle, tokio::task::JoinHandle<()>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let hub = Hub {
        subscribers: HashMap::new(),
        next_subscriber_id: 1,
        next_event_id: 1,
        buffer: buffer.max(1),
        self_tx: tx.clone(),
    };
    let join = tokio::spawn(hub.run(rx, ping_interval));
    (HubHandle { tx }, join)
}

impl Hub {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<HubCommand>, ping_interval: Duration) {
        let mut ping = tokio::time::interval_at(
            tokio::time::Instant::now() + ping_interval,
            ping_interval,
        );
        ping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                cmd = rx.recv() => {
                    match cmd {
                        None | Some(HubCommand::Shutdown) => break,
                        Some(HubCommand::Subscribe { filter, reply }) => {
                            let _ = reply.send(self.subscribe(filter));
                        }
                        Some(HubCommand::Unsubscribe { subscriber_id }) => {
                            self.subscribers.remove(&subscriber_id);
                        }
                        Some(HubCommand::Broadcast { payload }) => self.deliver(payload),
                    }
                }
                _ = ping.tick() => {
                    self.deliver(EventPayload::ping(Utc::now()));
                }
            }
        }
        // Dropping the subscriber map closes every send channel exactly
        // once; stragglers observe end-of-stream.
        debug!(subscribers = self.subscribers.len(), "hub loop exited");
    }

    fn subscribe(&mut self, filter: Option<HashSet<EventType>>) -> Subscription {
        let id = self.next_subscriber_id;
        self.next_subscriber_id += 1;
        let (tx, rx) = mpsc::channel(self.buffer);
        self.subscribers.insert(id, Subscriber { tx, filter });
        debug!(subscriber = id, "subscriber registered");
        Subscription {
            id,
            rx,
            hub_tx: self.self_tx.clone(),
        }
    }

    /// Stamp the payload and enqueue it for every matching subscriber.
    /// A subscriber with a full queue is evicted on the spot; everyone
    /// else is unaffected.
    fn deliver(&mut self, payload: EventPayload) {
        let event = Event {
            id: self.next_event_id,
            event_type: payload.event_type,
            timestamp: Utc::now(),
            data: payload.data,
        };
        self.next_event_id += 1;

        let mut dropped = Vec::new();
        for (id, subscriber) in &self.subscribers {
            if let Some(filter) = &subscriber.filter {
                if !filter.contains(&event.event_type) {
                    continue;
                }
            }
            match subscriber.tx.try_send(event.clone()) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!(subscriber = *id, "evicting slow subscriber");
                    dropped.push(*id);
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    dropped.push(*id);
                }
            }
        }
        for id in dropped {
            self.subscribers.remove(&id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn payload(n: u64) -> EventPayload {
        EventPayload {
            event_type: EventType::ProbeResult,
            data: json!({ "seq": n }),
        }
    }

    #[tokio::test]
    async fn a_slow_subscriber_is_evicted_without_disturbing_others() {
        let (hub, _join) = spawn(8, Duration::from_secs(3600));
        let mut slow = hub.subscribe(None).await.expect("slow subscriber");
        let mut live = hub.subscribe(None).await.expect("live subscriber");

        // The slow subscriber never reads. Its queue holds 8 events, the
        // ninth evicts it; the live subscriber must see all 30 in order.
        let mut last_id = 0;
        for n in 0..30 {
            hub.broadcast(payload(n));
            let event = live.recv().await.expect("live event");
            assert!(event.id > last_id, "ids must strictly increase");
            last_id = event.id;
            assert_eq!(event.data["seq"], json!(n));
        }

        // The evicted subscriber can drain what was buffered, then hits
        // end-of-stream.
        let mut drained = 0;
        while slow.recv().await.is_some() {
            drained += 1;
        }
        assert_eq!(drained, 8);
    }

    #[tokio::test]
    async fn topic_filters_apply_at_enqueue_time() {
        let (hub, _join) = spawn(16, Duration::from_secs(3600));
        let mut incidents_only = hub
            .subscribe(Some(HashSet::from([EventType::IncidentOpened])))
            .await
            .expect("subscriber");

        hub.broadcast(payload(1));
        hub.broadcast(EventPayload {
            event_type: EventType::IncidentOpened,
            data: json!({ "incident": true }),
        });

        let event = incidents_only.recv().await.expect("event");
        assert_eq!(event.event_type, EventType::IncidentOpened);
        // The skipped probe-result still consumed an id.
        assert_eq!(event.id, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn pings_keep_idle_subscribers_alive() {
        let (hub, _join) = spawn(16, Duration::from_secs(30));
        let mut sub = hub.subscribe(None).await.expect("subscriber");

        let first = sub.recv().await.expect("first ping");
        assert_eq!(first.event_type, EventType::Ping);
        let second = sub.recv().await.expect("second ping");
        assert_eq!(second.event_type, EventType::Ping);
        assert!(second.id > first.id);
        assert!(first.data.get("ts").is_some());
    }

    #[tokio::test]
    async fn shutdown_closes_every_subscriber_exactly_once() {
        let (hub, join) = spawn(16, Duration::from_secs(3600));
        let mut sub = hub.subscribe(None).await.expect("subscriber");

        hub.shutdown();
        assert!(sub.recv().await.is_none());
        join.await.expect("hub task");
        assert!(hub.subscribe(None).await.is_none());
    }

    #[test]
    fn frames_follow_the_sse_wire_format() {
        let event = Event {
            id: 42,
            event_type: EventType::IncidentOpened,
            timestamp: Utc::now(),
            data: json!({ "incident": "abc" }),
        };
        assert_eq!(
            sse_frame(&event),
            "event: incident-opened\ndata: {\"incident\":\"abc\"}\nid: 42\n\n"
        );

        let ping = Event {
            id: 43,
            event_type: EventType::Ping,
            timestamp: Utc::now(),
            data: json!({ "ts": "2026-01-01T00:00:00+00:00" }),
        };
        assert_eq!(
            sse_frame(&ping),
            "event: ping\ndata: {\"ts\":\"2026-01-01T00:00:00+00:00\"}\n\n"
        );
    }

    #[test]
    fn transport_headers_announce_an_event_stream() {
        assert!(SSE_HEADERS.contains(&("Content-Type", "text/event-stream")));
        assert!(SSE_HEADERS.contains(&("Cache-Control", "no-cache")));
        assert!(SSE_HEADERS.contains(&("Connection", "keep-alive")));
    }
}
