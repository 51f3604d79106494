//! Process-wide publish/subscribe hub.
//!
//! Delivery is fire-and-collect: all handlers matching a message run
//! concurrently and are joined before `publish` returns. A handler error is
//! caught and logged per handler and never reaches the publisher or sibling
//! handlers. History is a bounded FIFO ring, process-local by design.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use chrono::Utc;
use futures::future::join_all;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tracing::{debug, warn};
use uuid::Uuid;

use super::message::{Message, MessageDraft, MessageType};
use crate::error::Result;

pub const DEFAULT_MAX_HISTORY: usize = 1000;

pub type HandlerFuture = Pin<Box<dyn Future<Output = Result<()>> + Send>>;
type Handler = Arc<dyn Fn(Message) -> HandlerFuture + Send + Sync>;

struct HandlerEntry {
    id: u64,
    agent_filter: Option<String>,
    handler: Handler,
}

struct BusInner {
    max_history: usize,
    next_handler_id: AtomicU64,
    total_published: AtomicU64,
    handlers: RwLock<HashMap<MessageType, Vec<HandlerEntry>>>,
    history: Mutex<VecDeque<Message>>,
}

#[derive(Clone)]
pub struct MessageBus {
    inner: Arc<BusInner>,
}

impl MessageBus {
    pub fn new() -> Self {
        Self::with_max_history(DEFAULT_MAX_HISTORY)
    }

    pub fn with_max_history(max_history: usize) -> Self {
        Self {
            inner: Arc::new(BusInner {
                max_history: max_history.max(1),
                next_handler_id: AtomicU64::new(1),
                total_published: AtomicU64::new(0),
                handlers: RwLock::new(HashMap::new()),
                history: Mutex::new(VecDeque::new()),
            }),
        }
    }

    /// Publish a message. Assigns id and timestamp, appends to history, then
    /// fans out to every matching handler, joining them before returning.
    pub async fn publish(&self, draft: MessageDraft) -> Message {
        let message = Message {
            id: Uuid::new_v4().to_string(),
            message_type: draft.message_type,
            source_agent: draft.source_agent,
            target_agent: draft.target_agent,
            payload: draft.payload,
            timestamp: Utc::now(),
            context: draft.context,
        };

        self.inner.total_published.fetch_add(1, Ordering::Relaxed);

        {
            let mut history = self.inner.history.lock();
            if history.len() == self.inner.max_history {
                history.pop_front();
            }
            history.push_back(message.clone());
        }

        let matched: Vec<(u64, Handler)> = {
            let handlers = self.inner.handlers.read();
            handlers
                .get(&message.message_type)
                .map(|entries| {
                    entries
                        .iter()
                        .filter(|e| match &e.agent_filter {
                            Some(agent) => message.involves(agent),
                            None => true,
                        })
                        .map(|e| (e.id, Arc::clone(&e.handler)))
                        .collect()
                })
                .unwrap_or_default()
        };

        if matched.is_empty() {
            return message;
        }

        debug!(
            message_id = %message.id,
            message_type = %message.message_type,
            handlers = matched.len(),
            "Dispatching message"
        );

        let futures: Vec<_> = matched
            .iter()
            .map(|(id, handler)| {
                let id = *id;
                let fut = handler(message.clone());
                async move { (id, fut.await) }
            })
            .collect();

        for (handler_id, result) in join_all(futures).await {
            if let Err(e) = result {
                warn!(
                    handler_id,
                    message_id = %message.id,
                    message_type = %message.message_type,
                    error = %e,
                    "Bus handler failed"
                );
            }
        }

        message
    }

    /// Subscribe a handler to one message type.
    pub fn subscribe<F>(&self, message_type: MessageType, handler: F) -> Subscription
    where
        F: Fn(Message) -> HandlerFuture + Send + Sync + 'static,
    {
        let id = self.inner.next_handler_id.fetch_add(1, Ordering::Relaxed);
        let handler: Handler = Arc::new(handler);

        self.inner
            .handlers
            .write()
            .entry(message_type.clone())
            .or_default()
            .push(HandlerEntry {
                id,
                agent_filter: None,
                handler,
            });

        Subscription {
            inner: Arc::downgrade(&self.inner),
            keys: vec![(message_type, id)],
        }
    }

    /// Subscribe a handler to every known message type, filtered to messages
    /// whose source or target is `agent_id`. Custom-typed messages are not
    /// covered; subscribe to those explicitly.
    pub fn subscribe_to_agent<F>(&self, agent_id: impl Into<String>, handler: F) -> Subscription
    where
        F: Fn(Message) -> HandlerFuture + Send + Sync + 'static,
    {
        let agent_id = agent_id.into();
        let id = self.inner.next_handler_id.fetch_add(1, Ordering::Relaxed);
        let handler: Handler = Arc::new(handler);

        let mut handlers = self.inner.handlers.write();
        let mut keys = Vec::with_capacity(MessageType::KNOWN.len());
        for message_type in MessageType::KNOWN {
            handlers
                .entry(message_type.clone())
                .or_default()
                .push(HandlerEntry {
                    id,
                    agent_filter: Some(agent_id.clone()),
                    handler: Arc::clone(&handler),
                });
            keys.push((message_type, id));
        }

        Subscription {
            inner: Arc::downgrade(&self.inner),
            keys,
        }
    }

    pub fn get_history(&self, filter: &MessageFilter) -> Vec<Message> {
        let history = self.inner.history.lock();
        let mut matched: Vec<Message> = history
            .iter()
            .filter(|m| {
                filter
                    .message_type
                    .as_ref()
                    .is_none_or(|t| &m.message_type == t)
            })
            .filter(|m| filter.agent.as_deref().is_none_or(|a| m.involves(a)))
            .cloned()
            .collect();

        if let Some(limit) = filter.limit
            && matched.len() > limit
        {
            matched.drain(..matched.len() - limit);
        }
        matched
    }

    pub fn history_len(&self) -> usize {
        self.inner.history.lock().len()
    }

    pub fn stats(&self) -> BusStats {
        let history = self.inner.history.lock();
        let mut by_type: HashMap<String, usize> = HashMap::new();
        for message in history.iter() {
            *by_type
                .entry(message.message_type.as_str().to_string())
                .or_default() += 1;
        }

        let handlers = self.inner.handlers.read();
        let mut ids = std::collections::HashSet::new();
        for entries in handlers.values() {
            for entry in entries {
                ids.insert(entry.id);
            }
        }

        BusStats {
            total_published: self.inner.total_published.load(Ordering::Relaxed),
            history_len: history.len(),
            max_history: self.inner.max_history,
            subscriber_count: ids.len(),
            by_type,
        }
    }

    /// Clear history and subscriptions. Part of the documented lifecycle:
    /// construct at startup, `reset()` at shutdown or between test runs.
    pub fn reset(&self) {
        self.inner.history.lock().clear();
        self.inner.handlers.write().clear();
        self.inner.total_published.store(0, Ordering::Relaxed);
    }
}

impl Default for MessageBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Handle to an active subscription. Dropping the handle keeps the
/// subscription alive; call `unsubscribe` to remove it.
pub struct Subscription {
    inner: Weak<BusInner>,
    keys: Vec<(MessageType, u64)>,
}

impl Subscription {
    pub fn unsubscribe(self) {
        let Some(inner) = self.inner.upgrade() else {
            return;
        };
        let mut handlers = inner.handlers.write();
        for (message_type, id) in &self.keys {
            if let Some(entries) = handlers.get_mut(message_type) {
                entries.retain(|e| e.id != *id);
                if entries.is_empty() {
                    handlers.remove(message_type);
                }
            }
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct MessageFilter {
    pub message_type: Option<MessageType>,
    pub agent: Option<String>,
    pub limit: Option<usize>,
}

impl MessageFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_type(mut self, message_type: MessageType) -> Self {
        self.message_type = Some(message_type);
        self
    }

    pub fn with_agent(mut self, agent: impl Into<String>) -> Self {
        self.agent = Some(agent.into());
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct BusStats {
    pub total_published: u64,
    pub history_len: usize,
    pub max_history: usize,
    pub subscriber_count: usize,
    pub by_type: HashMap<String, usize>,
}
