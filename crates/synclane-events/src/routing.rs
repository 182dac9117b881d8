//! Event bus routing helpers.
//!
//! # Design
//! - `tokio::broadcast` fan-out with a bounded replay ring so late subscribers
//!   (a scheduler attached after the first pointer event) can catch up.
//! - When the channel overflows the oldest events are dropped; activity
//!   signals are idempotent so lagging receivers simply skip ahead.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::Utc;
use tokio::sync::broadcast;
use tokio::sync::broadcast::{Receiver, Sender};

use crate::error::{EventBusError, EventBusResult};
use crate::payloads::{ClientEvent, DEFAULT_REPLAY_CAPACITY, EventEnvelope, EventId};

/// Shared event bus built on top of `tokio::broadcast`.
#[derive(Clone)]
pub struct EventBus {
    sender: Sender<EventEnvelope>,
    replay: Arc<Mutex<VecDeque<EventEnvelope>>>,
    replay_capacity: usize,
    next_id: Arc<Mutex<EventId>>,
}

impl EventBus {
    /// Construct a bus with a custom replay capacity.
    ///
    /// # Panics
    ///
    /// Panics if `replay_capacity` is zero.
    #[must_use]
    pub fn with_capacity(replay_capacity: usize) -> Self {
        assert!(replay_capacity > 0, "event bus capacity must be positive");
        let (sender, _) = broadcast::channel(replay_capacity);
        Self {
            sender,
            replay: Arc::new(Mutex::new(VecDeque::with_capacity(replay_capacity))),
            replay_capacity,
            next_id: Arc::new(Mutex::new(1)),
        }
    }

    /// Construct a bus with the default replay capacity.
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_REPLAY_CAPACITY)
    }

    /// Subscribe to the bus, replaying buffered events newer than `since_id`.
    #[must_use]
    pub fn subscribe(&self, since_id: Option<EventId>) -> EventStream {
        let backlog = since_id.map_or_else(VecDeque::new, |since| {
            self.backlog_since(since).into_iter().collect()
        });
        EventStream {
            backlog,
            receiver: self.sender.subscribe(),
        }
    }

    /// Publish a new event to all subscribers, returning its identifier.
    pub fn publish(&self, event: ClientEvent) -> EventId {
        self.record(event).0
    }

    /// Publish an event and report whether any live subscriber received it.
    ///
    /// # Errors
    ///
    /// Returns [`EventBusError::NoSubscribers`] when the event was only stored
    /// in the replay ring.
    pub fn try_publish(&self, event: ClientEvent) -> EventBusResult<EventId> {
        let event_kind = event.kind();
        let (event_id, delivered) = self.record(event);
        if delivered {
            Ok(event_id)
        } else {
            Err(EventBusError::NoSubscribers {
                event_id,
                event_kind,
            })
        }
    }

    /// Last event id observed in the replay buffer.
    #[must_use]
    pub fn last_event_id(&self) -> Option<EventId> {
        self.lock_replay().back().map(|env| env.id)
    }

    /// Collect a backlog of events emitted after the specified id.
    #[must_use]
    pub fn backlog_since(&self, id: EventId) -> Vec<EventEnvelope> {
        let replay = self.lock_replay();
        replay.iter().filter(|env| env.id > id).cloned().collect()
    }

    fn record(&self, event: ClientEvent) -> (EventId, bool) {
        let mut next = self
            .next_id
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let id = *next;
        *next = next.saturating_add(1);
        drop(next);

        let envelope = EventEnvelope {
            id,
            timestamp: Utc::now(),
            event,
        };
        {
            let mut replay = self.lock_replay();
            if replay.len() == self.replay_capacity {
                let _ = replay.pop_front();
            }
            replay.push_back(envelope.clone());
        }
        let delivered = self.sender.send(envelope).is_ok();
        (id, delivered)
    }

    fn lock_replay(&self) -> MutexGuard<'_, VecDeque<EventEnvelope>> {
        self.replay
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Stream wrapper that yields events either from the replay backlog or from the
/// live broadcast channel.
pub struct EventStream {
    backlog: VecDeque<EventEnvelope>,
    receiver: Receiver<EventEnvelope>,
}

impl EventStream {
    /// Receive the next event, respecting the replay backlog first.
    ///
    /// Returns `None` once every bus handle has been dropped.
    pub async fn next(&mut self) -> Option<EventEnvelope> {
        if let Some(event) = self.backlog.pop_front() {
            return Some(event);
        }

        loop {
            match self.receiver.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}
