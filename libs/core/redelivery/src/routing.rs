//! Republish routing
//!
//! Maps a decoded envelope to where it should go back to: the queue's
//! original exchange and the envelope routing key, optionally rewritten.
//! Event types listed as discarded are dropped instead.

use crate::envelope::Envelope;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// Where a republished message lands
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Destination {
    pub exchange: String,
    pub routing_key: String,
}

impl Destination {
    pub fn new(exchange: impl Into<String>, routing_key: impl Into<String>) -> Self {
        Self {
            exchange: exchange.into(),
            routing_key: routing_key.into(),
        }
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.exchange, self.routing_key)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    Republish(Destination),
    Discard,
}

/// Per-queue routing table
#[derive(Debug, Clone, Default)]
pub struct RoutingTable {
    exchange: String,
    rewrites: BTreeMap<String, String>,
    discard_event_types: BTreeSet<String>,
}

impl RoutingTable {
    pub fn new(exchange: impl Into<String>) -> Self {
        Self {
            exchange: exchange.into(),
            ..Default::default()
        }
    }

    /// Replace routing key `from` with `to` on republish
    pub fn with_rewrite(mut self, from: impl Into<String>, to: impl Into<String>) -> Self {
        self.rewrites.insert(from.into(), to.into());
        self
    }

    pub fn with_rewrites<I, K, V>(mut self, rewrites: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.rewrites
            .extend(rewrites.into_iter().map(|(k, v)| (k.into(), v.into())));
        self
    }

    /// Drop messages of this event type instead of republishing them
    pub fn with_discard<I, S>(mut self, event_types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.discard_event_types
            .extend(event_types.into_iter().map(Into::into));
        self
    }

    pub fn exchange(&self) -> &str {
        &self.exchange
    }

    pub fn resolve(&self, envelope: &Envelope) -> Route {
        if self.discard_event_types.contains(&envelope.event_type) {
            return Route::Discard;
        }

        let routing_key = self
            .rewrites
            .get(&envelope.routing_key)
            .cloned()
            .unwrap_or_else(|| envelope.routing_key.clone());

        Route::Republish(Destination::new(self.exchange.clone(), routing_key))
    }
}
