//! Fixed-capacity table routing inbound publishes to in-process callbacks
//!
//! Owned and mutated by the agent task only, so it needs no locking.

use super::command::IncomingPublishCallback;
use crate::protocol::{topic_matches, PublishInfo};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, trace};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SubscriptionError {
    #[error("topic filter cannot be empty")]
    EmptyFilter,
    #[error("subscription table is full ({capacity} entries)")]
    TableFull { capacity: usize },
}

#[derive(Clone)]
pub struct SubscriptionEntry {
    filter: Arc<str>,
    callback: IncomingPublishCallback,
}

impl SubscriptionEntry {
    pub fn filter(&self) -> &str {
        &self.filter
    }

    fn is_same(&self, filter: &str, callback: &IncomingPublishCallback) -> bool {
        *self.filter == *filter && Arc::ptr_eq(&self.callback, callback)
    }
}

impl fmt::Debug for SubscriptionEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriptionEntry")
            .field("filter", &self.filter)
            .finish_non_exhaustive()
    }
}

/// Filter to callback table
///
/// An entry is identified by its filter together with the identity of its
/// callback `Arc`. Adding the same pair twice keeps one entry; different
/// callbacks on the same filter are separate entries.
#[derive(Debug)]
pub struct SubscriptionTable {
    slots: Box<[Option<SubscriptionEntry>]>,
}

impl SubscriptionTable {
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: (0..capacity).map(|_| None).collect(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn len(&self) -> usize {
        self.slots.iter().filter(|slot| slot.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.iter().all(Option::is_none)
    }

    /// Register `callback` for `filter`.
    ///
    /// Scans from the end for a free slot while looking for an identical
    /// entry; a duplicate succeeds without adding anything.
    pub fn add(
        &mut self,
        filter: impl Into<Arc<str>>,
        callback: IncomingPublishCallback,
    ) -> Result<(), SubscriptionError> {
        let filter = filter.into();
        if filter.is_empty() {
            return Err(SubscriptionError::EmptyFilter);
        }

        let mut free_slot = None;
        for index in (0..self.slots.len()).rev() {
            match &self.slots[index] {
                None => {
                    free_slot.get_or_insert(index);
                }
                Some(entry) if entry.is_same(&filter, &callback) => {
                    debug!(filter = %filter, "Subscription already registered");
                    return Ok(());
                }
                Some(_) => {}
            }
        }

        let index = free_slot.ok_or(SubscriptionError::TableFull {
            capacity: self.capacity(),
        })?;
        debug!(filter = %filter, slot = index, "Registered subscription");
        self.slots[index] = Some(SubscriptionEntry { filter, callback });
        Ok(())
    }

    /// Remove every entry whose filter equals `filter` byte for byte.
    ///
    /// Wildcards are compared literally. Returns the number of entries removed.
    pub fn remove(&mut self, filter: &str) -> usize {
        let mut removed = 0;
        for slot in self.slots.iter_mut() {
            if slot.as_ref().is_some_and(|entry| *entry.filter == *filter) {
                *slot = None;
                removed += 1;
            }
        }
        if removed > 0 {
            debug!(filter, removed, "Removed subscription");
        }
        removed
    }

    /// Invoke the callback of every entry matching the publish topic.
    ///
    /// Returns whether any callback ran.
    pub fn route_incoming(&self, publish: &PublishInfo<'_>) -> bool {
        let mut delivered = false;
        for entry in self.slots.iter().flatten() {
            if topic_matches(&entry.filter, publish.topic) {
                trace!(filter = %entry.filter, topic = publish.topic, "Routing publish");
                (entry.callback)(publish);
                delivered = true;
            }
        }
        delivered
    }

    pub fn contains(&self, filter: &str) -> bool {
        self.entries().any(|entry| entry.filter() == filter)
    }

    pub fn entries(&self) -> impl Iterator<Item = &SubscriptionEntry> {
        self.slots.iter().flatten()
    }

    /// Each registered filter once, in table order
    pub fn distinct_filters(&self) -> Vec<Arc<str>> {
        let mut filters: Vec<Arc<str>> = Vec::with_capacity(self.slots.len());
        for entry in self.entries() {
            if !filters.iter().any(|f| *f == entry.filter) {
                filters.push(entry.filter.clone());
            }
        }
        filters
    }
}
