//! Scripted transport standing in for the network.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use synclane_client::{OutboundRequest, Transport, TransportError, TransportResponse};
use tokio::sync::watch;

/// What the transport does for one call.
#[derive(Debug, Clone)]
pub enum Reply {
    /// Settle with a response.
    Respond(TransportResponse),
    /// Settle with a connection-level failure.
    Fail(TransportError),
    /// Never settle.
    Hang,
}

impl From<TransportResponse> for Reply {
    fn from(response: TransportResponse) -> Self {
        Self::Respond(response)
    }
}

/// Transport replying from a script: path routes first, then the FIFO
/// queue, then the fallback.
#[derive(Debug)]
pub struct ScriptedTransport {
    routes: Mutex<Vec<(String, Reply)>>,
    queue: Mutex<VecDeque<Reply>>,
    fallback: Mutex<Option<Reply>>,
    calls: Mutex<Vec<OutboundRequest>>,
    delay: Mutex<Option<Duration>>,
    gate: watch::Sender<bool>,
}

impl Default for ScriptedTransport {
    fn default() -> Self {
        Self::new()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl ScriptedTransport {
    /// Transport with an empty script and an open gate.
    #[must_use]
    pub fn new() -> Self {
        let (gate, _) = watch::channel(true);
        Self {
            routes: Mutex::new(Vec::new()),
            queue: Mutex::new(VecDeque::new()),
            fallback: Mutex::new(None),
            calls: Mutex::new(Vec::new()),
            delay: Mutex::new(None),
            gate,
        }
    }

    /// Queue one reply.
    pub fn push(&self, reply: impl Into<Reply>) -> &Self {
        lock(&self.queue).push_back(reply.into());
        self
    }

    /// Reply to every call whose URL ends with `suffix`.
    pub fn route(&self, suffix: &str, reply: impl Into<Reply>) -> &Self {
        lock(&self.routes).push((suffix.to_string(), reply.into()));
        self
    }

    /// Reply used once the queue is empty.
    pub fn always(&self, reply: impl Into<Reply>) -> &Self {
        *lock(&self.fallback) = Some(reply.into());
        self
    }

    /// Sleep before every reply.
    pub fn delay(&self, delay: Duration) -> &Self {
        *lock(&self.delay) = Some(delay);
        self
    }

    /// Hold every call until [`ScriptedTransport::open`].
    pub fn close(&self) {
        self.gate.send_replace(false);
    }

    /// Release held calls.
    pub fn open(&self) {
        self.gate.send_replace(true);
    }

    /// Calls received so far.
    #[must_use]
    pub fn call_count(&self) -> usize {
        lock(&self.calls).len()
    }

    /// Copies of every received request.
    #[must_use]
    pub fn calls(&self) -> Vec<OutboundRequest> {
        lock(&self.calls).clone()
    }

    fn next_reply(&self, url: &str) -> Reply {
        if let Some((_, reply)) = lock(&self.routes)
            .iter()
            .find(|(suffix, _)| url.ends_with(suffix.as_str()))
        {
            return reply.clone();
        }
        if let Some(reply) = lock(&self.queue).pop_front() {
            return reply;
        }
        lock(&self.fallback)
            .clone()
            .unwrap_or_else(|| Reply::Fail(TransportError::new("no scripted reply")))
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn send(&self, request: &OutboundRequest) -> Result<TransportResponse, TransportError> {
        lock(&self.calls).push(request.clone());
        let reply = self.next_reply(&request.url);

        let mut gate = self.gate.subscribe();
        let _ = gate.wait_for(|open| *open).await;
        let delay = *lock(&self.delay);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        match reply {
            Reply::Respond(response) => Ok(response),
            Reply::Fail(error) => Err(error),
            Reply::Hang => std::future::pending().await,
        }
    }
}
