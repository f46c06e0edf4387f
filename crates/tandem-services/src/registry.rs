//! Tag-keyed handler registry used by the protocol engine.
//!
//! A tag may carry any number of handlers, including the same handler
//! registered twice. Every registration gets its own [`HandlerHandle`], and
//! removal is by handle so it only ever removes that one registration.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;

use tandem_core::Envelope;

use crate::network::Replier;

/// Reaction to an inbound envelope. Handlers run on the dispatch path and
/// must not block; long work should be spawned.
pub trait MessageHandler: Send + Sync {
    fn handle(&self, envelope: &Envelope, replier: &Replier);
}

impl<F> MessageHandler for F
where
    F: Fn(&Envelope, &Replier) + Send + Sync,
{
    fn handle(&self, envelope: &Envelope, replier: &Replier) {
        self(envelope, replier)
    }
}

/// Identity of one registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerHandle(u64);

type Entry = (HandlerHandle, Arc<dyn MessageHandler>);

#[derive(Default)]
pub struct HandlerRegistry {
    buckets: DashMap<String, Vec<Entry>>,
    next_id: AtomicU64,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, tag: &str, handler: Arc<dyn MessageHandler>) -> HandlerHandle {
        let handle = HandlerHandle(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.buckets
            .entry(tag.to_string())
            .or_default()
            .push((handle, handler));
        handle
    }

    /// Remove one registration. Returns false if the handle was unknown.
    pub fn forget(&self, tag: &str, handle: HandlerHandle) -> bool {
        let removed = match self.buckets.get_mut(tag) {
            Some(mut bucket) => {
                let before = bucket.len();
                bucket.retain(|(h, _)| *h != handle);
                before != bucket.len()
            }
            None => false,
        };
        // The shard guard above must be released before remove_if locks it.
        if removed {
            self.buckets.remove_if(tag, |_, bucket| bucket.is_empty());
        }
        removed
    }

    /// Handlers registered under `tag` at this instant. Dispatch iterates
    /// the copy so handlers may register or forget while being called.
    pub fn snapshot(&self, tag: &str) -> Vec<Arc<dyn MessageHandler>> {
        self.buckets
            .get(tag)
            .map(|bucket| bucket.iter().map(|(_, h)| h.clone()).collect())
            .unwrap_or_default()
    }

    pub fn handler_count(&self, tag: &str) -> usize {
        self.buckets.get(tag).map(|b| b.len()).unwrap_or(0)
    }

    /// Registrations across all tags.
    pub fn total(&self) -> usize {
        self.buckets.iter().map(|b| b.len()).sum()
    }

    pub fn clear(&self) {
        self.buckets.clear();
    }
}
