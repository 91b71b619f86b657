//! Bounded FIFO cache of ingested items
//!
//! Remembers the most recent item ids of a job for duplicate suppression.
//! At capacity the oldest id (and its row) is evicted, so an id that was
//! evicted long ago is treated as new if the broker redelivers it.

use crate::protocol::{CrawlRow, ItemId};
use std::collections::{HashMap, VecDeque};

/// Outcome of [`ItemCache::insert`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Insertion {
    Inserted { evicted: Option<ItemId> },
    Duplicate,
}

#[derive(Debug, Clone)]
pub struct ItemCache {
    capacity: usize,
    order: VecDeque<ItemId>,
    rows: HashMap<ItemId, CrawlRow>,
}

impl Default for ItemCache {
    fn default() -> Self {
        Self::new(Self::DEFAULT_CAPACITY)
    }
}

impl ItemCache {
    pub const DEFAULT_CAPACITY: usize = 1000;

    /// A zero capacity is raised to one
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            order: VecDeque::with_capacity(capacity.min(Self::DEFAULT_CAPACITY)),
            rows: HashMap::new(),
        }
    }

    pub fn insert(&mut self, id: ItemId, row: CrawlRow) -> Insertion {
        if self.rows.contains_key(&id) {
            return Insertion::Duplicate;
        }

        let evicted = if self.order.len() >= self.capacity {
            let oldest = self.order.pop_front();
            if let Some(oldest) = &oldest {
                self.rows.remove(oldest);
            }
            oldest
        } else {
            None
        };

        self.order.push_back(id.clone());
        self.rows.insert(id, row);
        Insertion::Inserted { evicted }
    }

    pub fn contains(&self, id: &ItemId) -> bool {
        self.rows.contains_key(id)
    }

    pub fn get(&self, id: &ItemId) -> Option<&CrawlRow> {
        self.rows.get(id)
    }

    /// Rows in arrival order, oldest first
    pub fn rows(&self) -> impl Iterator<Item = &CrawlRow> {
        self.order.iter().filter_map(|id| self.rows.get(id))
    }

    pub fn ids(&self) -> impl Iterator<Item = &ItemId> {
        self.order.iter()
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn clear(&mut self) {
        self.order.clear();
        self.rows.clear();
    }
}
