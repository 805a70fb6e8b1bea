use std::any::Any;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use crate::dispatcher::ReadyDispatcher;
use crate::expiring::ExpiringSubQueue;
use crate::item::{Item, ItemState};

/// Parameters for a single `Queue::add` call. Zero `delay`/`ttr` resolve
/// to the 5 second defaults described on [`crate::item::DEFAULT_DELAY`]
/// and [`crate::item::DEFAULT_TTR`].
#[derive(Clone)]
pub struct AddParams {
    pub key: String,
    pub reserve_group: String,
    pub data: Arc<dyn Any + Send + Sync>,
    pub priority: u8,
    pub size: u8,
    pub delay: Duration,
    pub ttr: Duration,
}

impl AddParams {
    pub fn new(key: impl Into<String>, data: Arc<dyn Any + Send + Sync>) -> Self {
        AddParams {
            key: key.into(),
            reserve_group: String::new(),
            data,
            priority: 0,
            size: 0,
            delay: Duration::ZERO,
            ttr: Duration::ZERO,
        }
    }

    pub fn reserve_group(mut self, group: impl Into<String>) -> Self {
        self.reserve_group = group.into();
        self
    }

    pub fn priority(mut self, priority: u8) -> Self {
        self.priority = priority;
        self
    }

    pub fn size(mut self, size: u8) -> Self {
        self.size = size;
        self
    }

    pub fn delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn ttr(mut self, ttr: Duration) -> Self {
        self.ttr = ttr;
        self
    }
}

/// The result of a `Queue::add` call: how many of the supplied records
/// were newly inserted versus rejected as duplicate keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AddReport {
    pub added: usize,
    pub duplicates: usize,
}

/// The top-level façade over an item registry, a multi-group ready
/// dispatcher, and the run/delay expiring sub-queues. Wires TTR and
/// delay expiry directly into the item state machine so that a reserved
/// item which is never touched, released, or removed eventually becomes
/// ready again on its own.
pub struct Queue {
    items: Mutex<HashMap<String, Arc<Item>>>,
    ready: Arc<ReadyDispatcher>,
    run: Arc<ExpiringSubQueue>,
    delay: Arc<ExpiringSubQueue>,
    close: CancellationToken,
}

impl Queue {
    pub fn new() -> Self {
        let close = CancellationToken::new();
        let ready = Arc::new(ReadyDispatcher::new());

        let ready_for_delay = ready.clone();
        let delay = ExpiringSubQueue::new(
            Item::ready_at,
            move |item| match item.switch_state(ItemState::Ready) {
                Ok(()) => ready_for_delay.push(item),
                Err(err) => {
                    error!(key = %err.key, from = %err.from, to = %err.to, "delay expiry hit an invalid transition");
                }
            },
            close.clone(),
        );

        let delay_for_run = delay.clone();
        let run = ExpiringSubQueue::new(
            Item::release_at,
            move |item| match item.switch_state(ItemState::Delay) {
                Ok(()) => delay_for_run.push(item),
                Err(err) => {
                    error!(key = %err.key, from = %err.from, to = %err.to, "ttr expiry hit an invalid transition");
                }
            },
            close.clone(),
        );

        debug!("queue constructed");

        Queue {
            items: Mutex::new(HashMap::new()),
            ready,
            run,
            delay,
            close,
        }
    }

    /// Adds each record, skipping (and counting as a duplicate) any whose
    /// key already exists.
    pub fn add(&self, params: impl IntoIterator<Item = AddParams>) -> AddReport {
        let mut report = AddReport::default();
        let mut items = self.items.lock().unwrap();
        for p in params {
            if items.contains_key(&p.key) {
                report.duplicates += 1;
                continue;
            }
            let key = p.key.clone();
            let item = Item::new_cyclic(
                p.key,
                p.reserve_group,
                p.data,
                p.priority,
                p.size,
                p.delay,
                p.ttr,
                Instant::now(),
            );
            items.insert(key, item.clone());
            report.added += 1;
            self.ready.push(item);
        }
        report
    }

    pub fn get(&self, key: &str) -> Option<Arc<Item>> {
        self.items.lock().unwrap().get(key).cloned()
    }

    /// Pops the highest-ordered ready item in `group`, moving it to `Run`
    /// and arming its TTR deadline. Blocks until an item is available or
    /// `cancel` fires.
    pub async fn reserve(&self, cancel: &CancellationToken, group: &str) -> Option<Arc<Item>> {
        let item = self.ready.pop(cancel, group).await?;
        match item.switch_state(ItemState::Run) {
            Ok(()) => {
                self.run.push(item.clone());
                Some(item)
            }
            Err(err) => {
                error!(key = %err.key, from = %err.from, to = %err.to, "reserve hit an invalid transition");
                None
            }
        }
    }

    /// Removes `key` from the registry and detaches it from whichever
    /// sub-queue currently owns it, regardless of its current state.
    /// Returns whether an item was actually present.
    pub fn remove(&self, key: &str) -> bool {
        let item = match self.items.lock().unwrap().remove(key) {
            Some(item) => item,
            None => return false,
        };
        match item.state() {
            ItemState::Ready => self.ready.remove(&item),
            ItemState::Run => self.run.remove(&item),
            ItemState::Delay => self.delay.remove(&item),
            ItemState::Bury | ItemState::Dependent | ItemState::Removed => {}
        }
        item.force_remove();
        true
    }

    /// Moves `key` to `new_group`'s ready queue; a no-op (returning
    /// `false`) if the item is unknown or not currently `Ready`.
    pub fn change_reserve_group(&self, key: &str, new_group: &str) -> bool {
        let item = match self.items.lock().unwrap().get(key).cloned() {
            Some(item) => item,
            None => return false,
        };
        if item.state() != ItemState::Ready {
            return false;
        }
        self.ready.change_reserve_group(&item, new_group);
        true
    }

    /// Number of live (non-removed) items tracked by the queue.
    pub fn len(&self) -> usize {
        self.items.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stops the run and delay sub-queues' background driver tasks.
    /// Further use of the queue after `close` is not recommended.
    pub fn close(&self) {
        self.close.cancel();
    }
}

impl Default for Queue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn payload() -> Arc<dyn Any + Send + Sync> {
        Arc::new(())
    }

    #[tokio::test]
    async fn duplicate_add_is_counted_not_replaced() {
        let q = Queue::new();
        let report = q.add([AddParams::new("a", payload())]);
        assert_eq!(report, AddReport { added: 1, duplicates: 0 });

        let report = q.add([AddParams::new("a", payload())]);
        assert_eq!(report, AddReport { added: 0, duplicates: 1 });
        assert_eq!(q.len(), 1);
    }

    #[tokio::test]
    async fn priority_then_size_then_age_ordering() {
        let q = Queue::new();
        let cancel = CancellationToken::new();

        q.add([
            AddParams::new("a", payload()).priority(0).size(0),
            AddParams::new("b", payload()).priority(0).size(0),
            AddParams::new("c", payload()).priority(0).size(0),
            AddParams::new("d", payload()).priority(3).size(4),
            AddParams::new("e", payload()).priority(3).size(5),
        ]);

        let mut order = Vec::new();
        for _ in 0..5 {
            order.push(q.reserve(&cancel, "").await.unwrap().key().to_owned());
        }
        assert_eq!(order, vec!["e", "d", "a", "b", "c"]);
    }

    #[tokio::test]
    async fn remove_works_on_a_reserved_item() {
        let q = Queue::new();
        let cancel = CancellationToken::new();
        q.add([AddParams::new("a", payload())]);
        let reserved = q.reserve(&cancel, "").await.unwrap();
        assert_eq!(reserved.state(), ItemState::Run);

        assert!(q.remove("a"));
        assert_eq!(reserved.state(), ItemState::Removed);
        assert!(!q.remove("a"));
        assert_eq!(q.len(), 0);
    }

    #[tokio::test]
    async fn change_reserve_group_only_applies_while_ready() {
        let q = Queue::new();
        let cancel = CancellationToken::new();
        q.add([AddParams::new("a", payload()).reserve_group("1")]);

        assert!(q.change_reserve_group("a", "2"));
        assert_eq!(q.reserve(&cancel, "2").await.unwrap().key(), "a");

        // No longer Ready (now Run): a further change is a no-op.
        assert!(!q.change_reserve_group("a", "3"));
    }

    #[tokio::test(start_paused = true)]
    async fn ttr_expiry_moves_run_to_delay_then_ready() {
        let q = Queue::new();
        let cancel = CancellationToken::new();
        q.add([AddParams::new("a", payload())
            .ttr(Duration::from_millis(5))
            .delay(Duration::from_millis(5))]);

        let item = q.reserve(&cancel, "").await.unwrap();
        assert_eq!(item.state(), ItemState::Run);

        tokio::time::advance(Duration::from_millis(10)).await;
        tokio::task::yield_now().await;
        assert_eq!(item.state(), ItemState::Delay);

        tokio::time::advance(Duration::from_millis(10)).await;
        tokio::task::yield_now().await;
        assert_eq!(item.state(), ItemState::Ready);

        let reserved_again = q.reserve(&cancel, "").await.unwrap();
        assert_eq!(reserved_again.key(), "a");
        q.close();
    }
}
