//! # Call Status Feeds
//!
//! After a call is initiated, its progress arrives as a stream of status
//! events for its call id.
//!
//! ## Implementations:
//! - **WebhookStatusFeed**: events pushed by the telephony backend over HTTP
//! - **SimulatedStatusFeed**: a timer that reports the call answered after a
//!   fixed delay; every event it emits is tagged [`StatusOrigin::Simulated`]

use crate::call::state::StatusOrigin;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Carrier-side progress of a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallEventKind {
    Answered,
    Completed,
    Busy,
    NoAnswer,
    Failed,
}

impl CallEventKind {
    /// No further events follow these.
    pub fn is_final(&self) -> bool {
        !matches!(self, CallEventKind::Answered)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallStatusEvent {
    pub kind: CallEventKind,
    pub origin: StatusOrigin,
    pub reason: Option<String>,
}

impl CallStatusEvent {
    pub fn carrier(kind: CallEventKind, reason: Option<String>) -> Self {
        Self {
            kind,
            origin: StatusOrigin::Carrier,
            reason,
        }
    }
}

pub trait CallStatusFeed: Send + Sync {
    /// Start receiving events for a call. The subscription ends when the
    /// receiver is dropped.
    fn subscribe(&self, call_sid: &str) -> mpsc::UnboundedReceiver<CallStatusEvent>;
}

/// Routes events posted by the carrier to the subscriber of each call id.
#[derive(Debug, Default)]
pub struct WebhookStatusFeed {
    subscribers: Mutex<HashMap<String, mpsc::UnboundedSender<CallStatusEvent>>>,
}

impl WebhookStatusFeed {
    pub fn new() -> Self {
        Self::default()
    }

    /// Deliver a carrier event. Returns false when nobody is listening for
    /// that call id.
    pub fn publish(&self, call_sid: &str, kind: CallEventKind, reason: Option<String>) -> bool {
        let mut subscribers = self.subscribers.lock().unwrap_or_else(PoisonError::into_inner);

        let Some(sender) = subscribers.get(call_sid) else {
            debug!(call_sid, ?kind, "No subscriber for call status event");
            return false;
        };

        let delivered = sender
            .send(CallStatusEvent::carrier(kind, reason))
            .is_ok();
        if !delivered {
            warn!(call_sid, "Call status subscriber went away");
        }
        if !delivered || kind.is_final() {
            subscribers.remove(call_sid);
        }
        delivered
    }

    /// Calls with a live listener.
    pub fn subscriber_count(&self) -> usize {
        let mut subscribers = self.subscribers.lock().unwrap_or_else(PoisonError::into_inner);
        prune_closed(&mut subscribers);
        subscribers.len()
    }
}

fn prune_closed(subscribers: &mut HashMap<String, mpsc::UnboundedSender<CallStatusEvent>>) {
    subscribers.retain(|call_sid, sender| {
        let open = !sender.is_closed();
        if !open {
            debug!(call_sid = %call_sid, "Dropping closed call status subscription");
        }
        open
    });
}

impl CallStatusFeed for WebhookStatusFeed {
    fn subscribe(&self, call_sid: &str) -> mpsc::UnboundedReceiver<CallStatusEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut subscribers = self.subscribers.lock().unwrap_or_else(PoisonError::into_inner);
        prune_closed(&mut subscribers);
        subscribers.insert(call_sid.to_string(), tx);
        rx
    }
}

/// Stand-in for a carrier without a status callback. Must be called from
/// within a tokio runtime.
#[derive(Debug, Clone)]
pub struct SimulatedStatusFeed {
    answer_after: Duration,
}

impl SimulatedStatusFeed {
    pub fn new(answer_after: Duration) -> Self {
        Self { answer_after }
    }
}

impl CallStatusFeed for SimulatedStatusFeed {
    fn subscribe(&self, call_sid: &str) -> mpsc::UnboundedReceiver<CallStatusEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        let delay = self.answer_after;
        let call_sid = call_sid.to_string();

        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            debug!(call_sid = %call_sid, "Simulating answered call");
            let _ = tx.send(CallStatusEvent {
                kind: CallEventKind::Answered,
                origin: StatusOrigin::Simulated,
                reason: None,
            });
        });
        rx
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_publish_without_subscriber_is_reported() {
        let feed = WebhookStatusFeed::new();
        assert!(!feed.publish("CA1", CallEventKind::Answered, None));
    }

    #[test]
    fn test_publish_routes_by_call_sid_and_drops_after_final_event() {
        let feed = WebhookStatusFeed::new();
        let mut first = feed.subscribe("CA1");
        let mut second = feed.subscribe("CA2");

        assert!(feed.publish("CA1", CallEventKind::Answered, None));
        assert!(feed.publish("CA1", CallEventKind::Completed, None));
        assert!(!feed.publish("CA1", CallEventKind::Completed, None));

        assert_eq!(first.try_recv().unwrap().kind, CallEventKind::Answered);
        let completed = first.try_recv().unwrap();
        assert_eq!(completed.kind, CallEventKind::Completed);
        assert_eq!(completed.origin, StatusOrigin::Carrier);
        assert!(second.try_recv().is_err());
        assert_eq!(feed.subscriber_count(), 1);
    }

    #[test]
    fn test_dropped_receiver_unsubscribes() {
        let feed = WebhookStatusFeed::new();
        drop(feed.subscribe("CA1"));

        assert!(!feed.publish("CA1", CallEventKind::Answered, None));
        assert_eq!(feed.subscriber_count(), 0);
    }

    #[test]
    fn test_abandoned_subscriptions_are_pruned_without_events() {
        let feed = WebhookStatusFeed::new();
        let live = feed.subscribe("CA1");
        for call_sid in ["CA2", "CA3", "CA4"] {
            drop(feed.subscribe(call_sid));
        }

        assert_eq!(feed.subscriber_count(), 1);
        drop(live);
        assert_eq!(feed.subscriber_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_simulated_feed_marks_origin() {
        let feed = SimulatedStatusFeed::new(Duration::from_millis(1500));
        let mut events = feed.subscribe("CA1");

        let event = events.recv().await.unwrap();
        assert_eq!(event.kind, CallEventKind::Answered);
        assert_eq!(event.origin, StatusOrigin::Simulated);
    }

    #[test]
    fn test_event_kind_wire_names() {
        let kind: CallEventKind = serde_json::from_str(r#""no_answer""#).unwrap();
        assert_eq!(kind, CallEventKind::NoAnswer);
        assert!(kind.is_final());
        assert!(!CallEventKind::Answered.is_final());
    }
}
