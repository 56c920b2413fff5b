// src/connection/subscription.rs
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use log::error;

use crate::message::Message;

// Generate unique subscription IDs
static NEXT_SUB_ID: AtomicU64 = AtomicU64::new(1);

/// Unique identifier for a subscription. Stands in for handler identity on
/// unsubscribe, since closures cannot be compared.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

impl SubscriptionId {
    pub fn new() -> Self {
        Self(NEXT_SUB_ID.fetch_add(1, Ordering::SeqCst))
    }
}

impl Default for SubscriptionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub_{}", self.0)
    }
}

/// Which messages a subscription wants.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventFilter {
    /// Messages of a single `type` discriminant.
    Type(String),
    /// Every message regardless of type.
    All,
}

impl EventFilter {
    pub fn matches(&self, message: &Message) -> bool {
        match self {
            EventFilter::Type(kind) => kind == &message.kind,
            EventFilter::All => true,
        }
    }
}

/// Consumer callback for messages delivered on a subscription.
pub struct SubscriptionHandler {
    // Using a string description for better debug output
    description: String,
    #[allow(clippy::type_complexity)]
    handler: Box<dyn Fn(Message) -> anyhow::Result<()> + Send + Sync>,
}

impl SubscriptionHandler {
    pub fn new<F, S>(description: S, handler: F) -> Self
    where
        F: Fn(Message) -> anyhow::Result<()> + Send + Sync + 'static,
        S: Into<String>,
    {
        Self {
            description: description.into(),
            handler: Box::new(handler),
        }
    }

    pub fn handle(&self, message: Message) -> anyhow::Result<()> {
        (self.handler)(message)
    }
}

impl fmt::Debug for SubscriptionHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriptionHandler")
            .field("description", &self.description)
            .finish()
    }
}

/// A registered consumer: filter plus handler.
#[derive(Debug)]
pub struct Subscription {
    pub id: SubscriptionId,
    pub filter: EventFilter,
    pub handler: SubscriptionHandler,
}

impl Subscription {
    pub fn new<F, S>(filter: EventFilter, description: S, handler: F) -> Self
    where
        F: Fn(Message) -> anyhow::Result<()> + Send + Sync + 'static,
        S: Into<String>,
    {
        Self {
            id: SubscriptionId::new(),
            filter,
            handler: SubscriptionHandler::new(description, handler),
        }
    }
}

/// Insertion-ordered registry of consumers.
///
/// Dispatch runs the matching per-type list first, then the wildcard list.
/// Each handler call sits inside a fault barrier: a failing consumer is
/// logged and never blocks delivery to the others.
#[derive(Debug, Default)]
pub struct SubscriptionRegistry {
    by_type: HashMap<String, Vec<Subscription>>,
    wildcard: Vec<Subscription>,
}

impl SubscriptionRegistry {
    pub fn insert(&mut self, subscription: Subscription) {
        match &subscription.filter {
            EventFilter::Type(kind) => self
                .by_type
                .entry(kind.clone())
                .or_default()
                .push(subscription),
            EventFilter::All => self.wildcard.push(subscription),
        }
    }

    /// Remove a subscription by its id. Returns false when no such
    /// subscription is registered.
    pub fn remove(&mut self, id: SubscriptionId) -> bool {
        for subs in self.by_type.values_mut() {
            if let Some(pos) = subs.iter().position(|s| s.id == id) {
                subs.remove(pos);
                return true;
            }
        }
        if let Some(pos) = self.wildcard.iter().position(|s| s.id == id) {
            self.wildcard.remove(pos);
            return true;
        }
        false
    }

    pub fn len(&self) -> usize {
        self.by_type.values().map(Vec::len).sum::<usize>() + self.wildcard.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Invoke every matching handler for the message.
    pub fn dispatch(&self, message: &Message) {
        if let Some(subs) = self.by_type.get(&message.kind) {
            for subscription in subs {
                Self::invoke(subscription, message);
            }
        }
        for subscription in &self.wildcard {
            Self::invoke(subscription, message);
        }
    }

    fn invoke(subscription: &Subscription, message: &Message) {
        if let Err(e) = subscription.handler.handle(message.clone()) {
            error!(
                "Handler {} failed on {} message #{}: {:#}",
                subscription.id, message.kind, message.sequence_number, e
            );
        }
    }
}
