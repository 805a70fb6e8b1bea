use std::cmp::Ordering;
use std::sync::{Arc, Mutex, Weak};

use tokio::sync::Notify;
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::heap::{remove_at, sift_down, sift_up};
use crate::heap::heap_push;
use crate::item::{Item, SubQueueHandle, NO_INDEX};

fn deadline_cmp(deadline_of: fn(&Item) -> Option<Instant>, a: &Item, b: &Item) -> Ordering {
    deadline_of(a).cmp(&deadline_of(b))
}

struct State {
    heap: Vec<Arc<Item>>,
}

struct Shared {
    state: Mutex<State>,
    changed: Notify,
    deadline_of: fn(&Item) -> Option<Instant>,
    on_expire: Box<dyn Fn(Arc<Item>) + Send + Sync>,
}

/// A heap ordered by a deadline carried by each item (`readyAt` for the
/// delay sub-queue, `releaseAt` for the run sub-queue), backed by one
/// long-running task that sleeps exactly until the head's deadline and
/// hands the item to `on_expire` when it passes.
///
/// Grounded on the purge-task pattern in a Redis-like in-memory store:
/// one background task per expiring structure, woken by either a timer
/// or a coalescing "something changed" notification, never by polling.
pub struct ExpiringSubQueue {
    shared: Arc<Shared>,
    self_ref: Weak<ExpiringSubQueue>,
}

impl ExpiringSubQueue {
    /// Spawns the background driver task and returns a handle to the
    /// queue. The driver exits once `close` is cancelled.
    pub fn new(
        deadline_of: fn(&Item) -> Option<Instant>,
        on_expire: impl Fn(Arc<Item>) + Send + Sync + 'static,
        close: CancellationToken,
    ) -> Arc<Self> {
        let queue = Arc::new_cyclic(|weak_self| ExpiringSubQueue {
            shared: Arc::new(Shared {
                state: Mutex::new(State { heap: Vec::new() }),
                changed: Notify::new(),
                deadline_of,
                on_expire: Box::new(on_expire),
            }),
            self_ref: weak_self.clone(),
        });

        let shared = queue.shared.clone();
        tokio::spawn(drive(shared, close));
        queue
    }

    fn less(&self, a: &Item, b: &Item) -> bool {
        deadline_cmp(self.shared.deadline_of, a, b) == Ordering::Less
    }

    /// Pushes `item`, attaching it to this queue for future `update`
    /// calls, and wakes the driver task if the head may have changed.
    pub fn push(&self, item: Arc<Item>) {
        let idx = {
            let mut state = self.shared.state.lock().unwrap();
            let less = |a: &Item, b: &Item| self.less(a, b);
            heap_push(&mut state.heap, item.clone(), &less)
        };
        let owner: Weak<dyn SubQueueHandle> = self.self_ref.clone();
        item.attach(owner, idx);
        self.shared.changed.notify_one();
    }

    /// Removes `item` if it is currently attached to this queue; a no-op
    /// otherwise.
    pub fn remove(&self, item: &Arc<Item>) {
        {
            let mut state = self.shared.state.lock().unwrap();
            let idx = item.index();
            if idx == NO_INDEX || idx >= state.heap.len() || !Arc::ptr_eq(&state.heap[idx], item) {
                return;
            }
            let less = |a: &Item, b: &Item| self.less(a, b);
            remove_at(&mut state.heap, idx, &less);
        }
        self.shared.changed.notify_one();
    }

    pub fn len(&self) -> usize {
        self.shared.state.lock().unwrap().heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl SubQueueHandle for ExpiringSubQueue {
    fn update(&self, item: &Arc<Item>) {
        {
            let mut state = self.shared.state.lock().unwrap();
            let idx = item.index();
            if idx == NO_INDEX || idx >= state.heap.len() || !Arc::ptr_eq(&state.heap[idx], item) {
                return;
            }
            let less = |a: &Item, b: &Item| self.less(a, b);
            let moved = sift_up(&mut state.heap, idx, &less);
            if moved == idx {
                sift_down(&mut state.heap, idx, &less);
            }
        }
        self.shared.changed.notify_one();
    }
}

async fn drive(shared: Arc<Shared>, close: CancellationToken) {
    loop {
        let next_deadline = {
            let state = shared.state.lock().unwrap();
            state.heap.first().and_then(|item| (shared.deadline_of)(item))
        };

        match next_deadline {
            None => {
                tokio::select! {
                    _ = shared.changed.notified() => {},
                    _ = close.cancelled() => {
                        debug!("expiring sub-queue driver shutting down");
                        return;
                    }
                }
            }
            Some(deadline) => {
                tokio::select! {
                    _ = sleep_until(deadline) => {
                        let expired = {
                            let mut state = shared.state.lock().unwrap();
                            let due = state
                                .heap
                                .first()
                                .map(|item| (shared.deadline_of)(item) <= Some(Instant::now()))
                                .unwrap_or(false);
                            if due {
                                let less = |a: &Item, b: &Item| {
                                    deadline_cmp(shared.deadline_of, a, b) == Ordering::Less
                                };
                                Some(remove_at(&mut state.heap, 0, &less))
                            } else {
                                None
                            }
                        };
                        if let Some(item) = expired {
                            (shared.on_expire)(item);
                        }
                    }
                    _ = shared.changed.notified() => {}
                    _ = close.cancelled() => {
                        debug!("expiring sub-queue driver shutting down");
                        return;
                    }
                }
            }
        }
    }
}
