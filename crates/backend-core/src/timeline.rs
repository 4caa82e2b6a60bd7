use std::{cmp::Ordering, collections::HashSet};

use tracing::{debug, trace};

use crate::types::MessageRecord;

/// Ordered, deduplicated message sequence for one room with bounded retention.
#[derive(Debug, Clone)]
pub struct TimelineBuffer {
    items: Vec<MessageRecord>,
    ids: HashSet<String>,
    max_items: usize,
}

impl TimelineBuffer {
    /// Create a timeline buffer with an item cap (`max_items >= 1`).
    pub fn new(max_items: usize) -> Self {
        Self {
            items: Vec::new(),
            ids: HashSet::new(),
            max_items: max_items.max(1),
        }
    }

    /// Current timeline items, oldest first.
    pub fn items(&self) -> &[MessageRecord] {
        &self.items
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.ids.contains(id)
    }

    /// Seed the buffer from a chronological snapshot (oldest first).
    ///
    /// Snapshot order is kept as given. Items already in the buffer that the
    /// snapshot does not contain (live arrivals that raced the fetch) are kept
    /// after it, in their arrival order.
    pub fn load_snapshot(&mut self, snapshot: Vec<MessageRecord>) {
        let previous = std::mem::take(&mut self.items);
        self.ids.clear();

        for item in snapshot {
            self.push_unique(item);
        }
        let mut carried = 0_usize;
        for item in previous {
            if self.push_unique(item) {
                carried += 1;
            }
        }
        self.trim_to_max();

        debug!(
            items = self.items.len(),
            carried_live = carried,
            "timeline snapshot loaded"
        );
    }

    /// Append one live item in arrival order.
    ///
    /// Returns `false` (and leaves the sequence untouched) when an item with
    /// the same ID is already present.
    pub fn append(&mut self, item: MessageRecord) -> bool {
        if self.ids.contains(&item.id) {
            trace!(event_id = %item.id, "dropping duplicate timeline item");
            return false;
        }
        if let Some(last) = self.items.last()
            && item.ordering_cmp(last) == Ordering::Less
        {
            debug!(
                event_id = %item.id,
                last_event_id = %last.id,
                "live item older than timeline tail; keeping arrival order"
            );
        }
        self.push_unique(item);
        self.trim_to_max();
        true
    }

    /// Drop every item; used when the owning room is discarded.
    pub fn clear(&mut self) {
        self.items.clear();
        self.ids.clear();
    }

    /// Clamp a requested snapshot size against safety and server caps.
    ///
    /// The result is always in `1..=100`.
    pub fn bounded_fetch_limit(requested: u16, server_cap: u16) -> u16 {
        let safe_requested = requested.max(1);
        let safe_cap = server_cap.max(1);
        safe_requested.min(safe_cap).min(100)
    }

    fn push_unique(&mut self, item: MessageRecord) -> bool {
        if !self.ids.insert(item.id.clone()) {
            return false;
        }
        self.items.push(item);
        true
    }

    fn trim_to_max(&mut self) {
        if self.items.len() <= self.max_items {
            return;
        }

        let excess = self.items.len() - self.max_items;
        for dropped in self.items.drain(0..excess) {
            self.ids.remove(&dropped.id);
        }
    }
}
