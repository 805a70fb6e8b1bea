use std::any::Any;
use std::fmt;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use tokio::time::Instant;

use crate::error::ItemTransitionError;

/// Zero `delay`/`ttr` on [`crate::queue::AddParams`] resolve to these.
pub const DEFAULT_DELAY: Duration = Duration::from_secs(5);
pub const DEFAULT_TTR: Duration = Duration::from_secs(5);

/// Sentinel recorded as an item's sub-queue index while it is unattached.
pub(crate) const NO_INDEX: usize = usize::MAX;

/// Whatever sub-queue currently owns an [`Item`] implements this so the
/// item can ask it to rebalance after a field mutation, without the item
/// needing to know whether it's sitting in a plain ordered queue or an
/// expiring one.
pub trait SubQueueHandle: Send + Sync {
    /// Re-validates heap order for `item` after one of its ordering fields
    /// (priority, size, or a deadline) changed.
    fn update(&self, item: &Arc<Item>);
}

/// The item lifecycle. See the allowed-transition table enforced by
/// [`Item::switch_state`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ItemState {
    Ready,
    Run,
    Delay,
    Bury,
    Dependent,
    Removed,
}

impl ItemState {
    fn can_transition_to(self, to: ItemState) -> bool {
        use ItemState::*;
        matches!(
            (self, to),
            (Ready, Run)
                | (Ready, Dependent)
                | (Ready, Removed)
                | (Run, Delay)
                | (Run, Bury)
                | (Run, Dependent)
                | (Delay, Ready)
                | (Delay, Dependent)
                | (Delay, Removed)
                | (Bury, Ready)
                | (Bury, Dependent)
                | (Bury, Removed)
                | (Dependent, Ready)
                | (Dependent, Removed)
        )
    }
}

impl fmt::Display for ItemState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ItemState::Ready => "ready",
            ItemState::Run => "run",
            ItemState::Delay => "delay",
            ItemState::Bury => "bury",
            ItemState::Dependent => "dependent",
            ItemState::Removed => "removed",
        };
        f.write_str(s)
    }
}

struct Inner {
    reserve_group: String,
    data: Arc<dyn Any + Send + Sync>,
    priority: u8,
    size: u8,
    delay: Duration,
    ttr: Duration,
    ready_at: Option<Instant>,
    release_at: Option<Instant>,
    state: ItemState,
    sub_queue: Option<Weak<dyn SubQueueHandle>>,
    sub_queue_index: usize,
}

/// A single unit of work tracked by a [`crate::queue::Queue`].
///
/// All mutable fields live behind one lock; ordering-affecting mutators
/// (`set_priority`, `set_size`, `touch`) release that lock before asking
/// the item's current sub-queue to rebalance, so the item's own lock is
/// never held across a sub-queue lock acquisition.
pub struct Item {
    key: String,
    created: Instant,
    self_ref: Weak<Item>,
    inner: Mutex<Inner>,
}

impl Item {
    /// Builds a new item in the `Ready` state. Must be constructed through
    /// `Arc::new_cyclic` so the item can hand a `Weak<Item>` to itself to
    /// collaborators that need to look it back up (sub-queue `update`
    /// forwarding).
    pub(crate) fn new_cyclic(
        key: String,
        reserve_group: String,
        data: Arc<dyn Any + Send + Sync>,
        priority: u8,
        size: u8,
        delay: Duration,
        ttr: Duration,
        created: Instant,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak_self| Item {
            key,
            created,
            self_ref: weak_self.clone(),
            inner: Mutex::new(Inner {
                reserve_group,
                data,
                priority,
                size,
                delay: if delay.is_zero() { DEFAULT_DELAY } else { delay },
                ttr: if ttr.is_zero() { DEFAULT_TTR } else { ttr },
                ready_at: None,
                release_at: None,
                state: ItemState::Ready,
                sub_queue: None,
                sub_queue_index: NO_INDEX,
            }),
        })
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn created(&self) -> Instant {
        self.created
    }

    pub fn reserve_group(&self) -> String {
        self.inner.lock().unwrap().reserve_group.clone()
    }

    /// Always accepted. Whether it has any observable effect on dispatch
    /// depends on the item's current state: see
    /// `Queue::change_reserve_group`, which is the only path that actually
    /// moves a live item between reserve groups.
    pub fn set_reserve_group(&self, group: impl Into<String>) {
        self.inner.lock().unwrap().reserve_group = group.into();
    }

    pub fn data(&self) -> Arc<dyn Any + Send + Sync> {
        self.inner.lock().unwrap().data.clone()
    }

    pub fn set_data(&self, data: Arc<dyn Any + Send + Sync>) {
        self.inner.lock().unwrap().data = data;
    }

    pub fn priority(&self) -> u8 {
        self.inner.lock().unwrap().priority
    }

    pub fn set_priority(&self, priority: u8) {
        let handle = {
            let mut inner = self.inner.lock().unwrap();
            inner.priority = priority;
            inner.sub_queue.as_ref().and_then(Weak::upgrade)
        };
        self.notify_update(handle);
    }

    pub fn size(&self) -> u8 {
        self.inner.lock().unwrap().size
    }

    pub fn set_size(&self, size: u8) {
        let handle = {
            let mut inner = self.inner.lock().unwrap();
            inner.size = size;
            inner.sub_queue.as_ref().and_then(Weak::upgrade)
        };
        self.notify_update(handle);
    }

    pub fn ready_at(&self) -> Option<Instant> {
        self.inner.lock().unwrap().ready_at
    }

    pub fn release_at(&self) -> Option<Instant> {
        self.inner.lock().unwrap().release_at
    }

    pub fn state(&self) -> ItemState {
        self.inner.lock().unwrap().state
    }

    /// No-op unless the item is currently `Run`. Re-arms the release
    /// deadline and asks the run sub-queue to rebalance, which retargets
    /// its background expiry timer.
    pub fn touch(&self) {
        let handle = {
            let mut inner = self.inner.lock().unwrap();
            if inner.state != ItemState::Run {
                return;
            }
            inner.release_at = Some(Instant::now() + inner.ttr);
            inner.sub_queue.as_ref().and_then(Weak::upgrade)
        };
        self.notify_update(handle);
    }

    /// No-op unless the item is currently `Delay`. Re-arms the ready
    /// deadline and asks the delay sub-queue to rebalance.
    pub(crate) fn restart(&self) {
        let handle = {
            let mut inner = self.inner.lock().unwrap();
            if inner.state != ItemState::Delay {
                return;
            }
            inner.ready_at = Some(Instant::now() + inner.delay);
            inner.sub_queue.as_ref().and_then(Weak::upgrade)
        };
        self.notify_update(handle);
    }

    /// Validates and applies a state transition, including the deadline
    /// side effects described for each target state. Does not move the
    /// item between sub-queues; the caller (the ready dispatcher, an
    /// expiring sub-queue's expiry callback, or `Queue`) is responsible
    /// for attaching/detaching afterward.
    pub fn switch_state(&self, to: ItemState) -> Result<(), ItemTransitionError> {
        let mut inner = self.inner.lock().unwrap();
        if !inner.state.can_transition_to(to) {
            return Err(ItemTransitionError {
                key: self.key.clone(),
                from: inner.state,
                to,
            });
        }
        match to {
            ItemState::Run => inner.release_at = Some(Instant::now() + inner.ttr),
            ItemState::Delay => inner.ready_at = Some(Instant::now() + inner.delay),
            _ => {
                inner.release_at = None;
                inner.ready_at = None;
            }
        }
        inner.state = to;
        Ok(())
    }

    /// Unconditionally marks the item `Removed` and clears its sub-queue
    /// back-reference, bypassing the transition table. `Remove` has no
    /// entry reaching `Removed` from `Run` in the allowed-transition
    /// table, yet must work from any live state; see DESIGN.md.
    pub(crate) fn force_remove(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.state = ItemState::Removed;
        inner.release_at = None;
        inner.ready_at = None;
        inner.sub_queue = None;
        inner.sub_queue_index = NO_INDEX;
    }

    /// Records that the item has been attached to `handle` at `index`.
    pub(crate) fn attach(&self, handle: Weak<dyn SubQueueHandle>, index: usize) {
        let mut inner = self.inner.lock().unwrap();
        inner.sub_queue = Some(handle);
        inner.sub_queue_index = index;
    }

    /// Clears the item's sub-queue back-reference without touching state.
    pub(crate) fn detach(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.sub_queue = None;
        inner.sub_queue_index = NO_INDEX;
    }

    /// Updates the item's recorded position within whichever sub-queue
    /// currently owns it.
    pub(crate) fn set_index(&self, index: usize) {
        self.inner.lock().unwrap().sub_queue_index = index;
    }

    pub(crate) fn index(&self) -> usize {
        self.inner.lock().unwrap().sub_queue_index
    }

    fn notify_update(&self, handle: Option<Arc<dyn SubQueueHandle>>) {
        let Some(handle) = handle else { return };
        let Some(me) = self.self_ref.upgrade() else {
            return;
        };
        handle.update(&me);
    }
}

impl fmt::Debug for Item {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock().unwrap();
        f.debug_struct("Item")
            .field("key", &self.key)
            .field("reserve_group", &inner.reserve_group)
            .field("state", &inner.state)
            .field("priority", &inner.priority)
            .field("size", &inner.size)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_item(priority: u8, size: u8) -> Arc<Item> {
        Item::new_cyclic(
            "k".into(),
            String::new(),
            Arc::new(()),
            priority,
            size,
            Duration::ZERO,
            Duration::ZERO,
            Instant::now(),
        )
    }

    #[test]
    fn zero_delay_and_ttr_resolve_to_defaults() {
        let item = new_item(0, 0);
        let inner = item.inner.lock().unwrap();
        assert_eq!(inner.delay, DEFAULT_DELAY);
        assert_eq!(inner.ttr, DEFAULT_TTR);
    }

    #[test]
    fn allowed_transitions_match_the_table() {
        let item = new_item(0, 0);
        assert!(item.switch_state(ItemState::Run).is_ok());
        assert!(item.switch_state(ItemState::Ready).is_err());
        assert!(item.switch_state(ItemState::Delay).is_ok());
        assert!(item.switch_state(ItemState::Ready).is_ok());
        assert!(item.switch_state(ItemState::Removed).is_ok());
        assert!(item.switch_state(ItemState::Ready).is_err());
    }

    #[test]
    fn run_sets_release_at_and_clears_on_exit() {
        let item = new_item(0, 0);
        item.switch_state(ItemState::Run).unwrap();
        assert!(item.release_at().is_some());
        item.switch_state(ItemState::Dependent).unwrap();
        assert!(item.release_at().is_none());
    }

    #[test]
    fn touch_is_a_no_op_outside_run() {
        let item = new_item(0, 0);
        item.touch();
        assert!(item.release_at().is_none());
    }

    #[test]
    fn restart_is_a_no_op_outside_delay() {
        let item = new_item(0, 0);
        item.restart();
        assert!(item.ready_at().is_none());
    }

    #[test]
    fn force_remove_is_unconditional() {
        let item = new_item(0, 0);
        item.switch_state(ItemState::Run).unwrap();
        item.force_remove();
        assert_eq!(item.state(), ItemState::Removed);
        assert_eq!(item.index(), NO_INDEX);
    }
}
