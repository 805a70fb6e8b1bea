use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio_util::sync::CancellationToken;

use crate::heap::{ready_order, OrderedSubQueue};
use crate::item::Item;

struct GroupQueue {
    queue: Arc<OrderedSubQueue>,
    in_use: usize,
}

/// Partitions the ready sub-queue by reserve group, creating a group's
/// queue lazily on first use and dropping it once both its heap is empty
/// and no caller is still blocked inside a `pop` against it.
///
/// The `in_use` guard (absent from the teacher's single-tube model) is
/// what makes it safe to evict an empty group's queue without racing a
/// concurrent waiter that still holds a reference to it: eviction only
/// happens once the guard count returns to zero.
pub struct ReadyDispatcher {
    groups: Mutex<HashMap<String, GroupQueue>>,
}

impl ReadyDispatcher {
    pub fn new() -> Self {
        ReadyDispatcher {
            groups: Mutex::new(HashMap::new()),
        }
    }

    /// Fetches or lazily creates `group`'s queue. Callers hold `groups`
    /// for the remainder of whatever operation the queue is fetched for,
    /// so a concurrent `drop_if_idle_locked` can never observe the group
    /// as idle mid-operation.
    fn queue_for_locked(groups: &mut HashMap<String, GroupQueue>, group: &str) -> Arc<OrderedSubQueue> {
        groups
            .entry(group.to_owned())
            .or_insert_with(|| GroupQueue {
                queue: Arc::new(OrderedSubQueue::new(ready_order)),
                in_use: 0,
            })
            .queue
            .clone()
    }

    fn drop_if_idle_locked(groups: &mut HashMap<String, GroupQueue>, group: &str) {
        if let Some(entry) = groups.get(group) {
            if entry.in_use == 0 && entry.queue.is_empty() {
                groups.remove(group);
            }
        }
    }

    /// Fetch-or-create and insert happen under one critical section, per
    /// SPEC_FULL.md §4.4's "the push is synchronous" rationale: nothing
    /// can observe the group as idle and evict it between the two.
    pub fn push(&self, item: Arc<Item>) {
        let group = item.reserve_group();
        let mut groups = self.groups.lock().unwrap();
        let queue = Self::queue_for_locked(&mut groups, &group);
        let owner = Arc::downgrade(&queue);
        queue.push(item, owner);
    }

    pub async fn pop(&self, cancel: &CancellationToken, group: &str) -> Option<Arc<Item>> {
        let queue = {
            let mut groups = self.groups.lock().unwrap();
            let queue = Self::queue_for_locked(&mut groups, group);
            if let Some(entry) = groups.get_mut(group) {
                entry.in_use += 1;
            }
            queue
        };
        let got = queue.pop(cancel).await;
        {
            let mut groups = self.groups.lock().unwrap();
            if let Some(entry) = groups.get_mut(group) {
                entry.in_use -= 1;
            }
            Self::drop_if_idle_locked(&mut groups, group);
        }
        got
    }

    pub fn remove(&self, item: &Arc<Item>) {
        let group = item.reserve_group();
        let mut groups = self.groups.lock().unwrap();
        let queue = Self::queue_for_locked(&mut groups, &group);
        queue.remove(item);
        Self::drop_if_idle_locked(&mut groups, &group);
    }

    /// Moves `item` from its current reserve group's queue to `new_group`.
    /// A no-op if the groups are identical. The whole remove-then-push
    /// runs under one lock acquisition so the item is never briefly
    /// unreachable from either group's live queue.
    pub fn change_reserve_group(&self, item: &Arc<Item>, new_group: &str) {
        let current = item.reserve_group();
        if current == new_group {
            return;
        }
        let mut groups = self.groups.lock().unwrap();
        let old_queue = Self::queue_for_locked(&mut groups, &current);
        old_queue.remove(item);
        Self::drop_if_idle_locked(&mut groups, &current);

        item.set_reserve_group(new_group);
        let new_queue = Self::queue_for_locked(&mut groups, new_group);
        let owner = Arc::downgrade(&new_queue);
        new_queue.push(item.clone(), owner);
    }

    pub fn num_items(&self) -> usize {
        self.groups
            .lock()
            .unwrap()
            .values()
            .map(|g| g.queue.len())
            .sum()
    }
}

impl Default for ReadyDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::time::Instant;

    use super::*;
    use crate::item::Item;

    fn item(key: &str, group: &str) -> Arc<Item> {
        Item::new_cyclic(
            key.into(),
            group.into(),
            Arc::new(()),
            0,
            0,
            Duration::ZERO,
            Duration::ZERO,
            Instant::now(),
        )
    }

    #[tokio::test]
    async fn groups_are_isolated() {
        let d = ReadyDispatcher::new();
        let cancel = CancellationToken::new();

        d.push(item("a", "1"));
        d.push(item("b", "2"));

        // Group "" has nothing pushed to it: pre-cancel so the "expect
        // None" assertion doesn't block forever waiting for a push.
        let empty_group = CancellationToken::new();
        empty_group.cancel();
        assert!(d.pop(&empty_group, "").await.is_none());
        assert_eq!(d.pop(&cancel, "1").await.unwrap().key(), "a");
        assert_eq!(d.pop(&cancel, "2").await.unwrap().key(), "b");
    }

    #[tokio::test]
    async fn change_reserve_group_redirects_dispatch() {
        let d = ReadyDispatcher::new();
        let cancel = CancellationToken::new();

        let a = item("a", "1");
        let b = item("b", "2");
        d.push(a.clone());
        d.push(b.clone());

        d.change_reserve_group(&a, "2");

        let drained_group = CancellationToken::new();
        drained_group.cancel();
        assert!(d.pop(&drained_group, "1").await.is_none());
        let mut got = vec![
            d.pop(&cancel, "2").await.unwrap().key().to_owned(),
            d.pop(&cancel, "2").await.unwrap().key().to_owned(),
        ];
        got.sort();
        assert_eq!(got, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn empty_groups_are_dropped_but_waiters_still_get_served() {
        let d = Arc::new(ReadyDispatcher::new());
        let cancel = CancellationToken::new();

        let d2 = d.clone();
        let cancel2 = cancel.clone();
        let waiter = tokio::spawn(async move { d2.pop(&cancel2, "g").await });

        tokio::task::yield_now().await;
        tokio::task::yield_now().await;

        d.push(item("only", "g"));
        assert_eq!(waiter.await.unwrap().unwrap().key(), "only");
        assert_eq!(d.num_items(), 0);
    }
}
