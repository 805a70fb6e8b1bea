use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, Weak};

use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::item::{Item, SubQueueHandle, NO_INDEX};

/// Orders items by descending priority, then descending size, then
/// ascending age (earliest `created` first). Used by every reserve
/// group's ready queue.
pub fn ready_order(a: &Item, b: &Item) -> Ordering {
    b.priority()
        .cmp(&a.priority())
        .then_with(|| b.size().cmp(&a.size()))
        .then_with(|| a.created().cmp(&b.created()))
}

/// Sifts `heap[idx]` up toward the root while it's "less than" its
/// parent, swapping and updating each moved item's recorded index.
/// Returns the index the item ends up at.
pub(crate) fn sift_up(
    heap: &mut [Arc<Item>],
    mut idx: usize,
    less: &dyn Fn(&Item, &Item) -> bool,
) -> usize {
    while idx > 0 {
        let parent = (idx - 1) / 2;
        if less(&heap[idx], &heap[parent]) {
            heap.swap(idx, parent);
            heap[idx].set_index(idx);
            heap[parent].set_index(parent);
            idx = parent;
        } else {
            break;
        }
    }
    idx
}

/// Sifts `heap[idx]` down toward the leaves while either child is "less
/// than" it, swapping and updating each moved item's recorded index.
pub(crate) fn sift_down(heap: &mut [Arc<Item>], mut idx: usize, less: &dyn Fn(&Item, &Item) -> bool) {
    let len = heap.len();
    loop {
        let left = 2 * idx + 1;
        let right = 2 * idx + 2;
        let mut smallest = idx;
        if left < len && less(&heap[left], &heap[smallest]) {
            smallest = left;
        }
        if right < len && less(&heap[right], &heap[smallest]) {
            smallest = right;
        }
        if smallest == idx {
            break;
        }
        heap.swap(idx, smallest);
        heap[idx].set_index(idx);
        heap[smallest].set_index(smallest);
        idx = smallest;
    }
}

/// Appends `item` to `heap` and sifts it up to its resting position,
/// returning that final index. Does not attach the item to an owner;
/// the caller does that once it knows the final index.
pub(crate) fn heap_push(
    heap: &mut Vec<Arc<Item>>,
    item: Arc<Item>,
    less: &dyn Fn(&Item, &Item) -> bool,
) -> usize {
    heap.push(item);
    let idx = heap.len() - 1;
    sift_up(heap, idx, less)
}

/// Removes and returns the item at `idx`, swapping the last element into
/// its place and restoring heap order. Detaches the removed item.
pub(crate) fn remove_at(
    heap: &mut Vec<Arc<Item>>,
    idx: usize,
    less: &dyn Fn(&Item, &Item) -> bool,
) -> Arc<Item> {
    let last = heap.len() - 1;
    heap.swap(idx, last);
    let removed = heap.pop().expect("idx was in bounds");
    removed.detach();
    if idx < heap.len() {
        heap[idx].set_index(idx);
        let moved = sift_up(heap, idx, less);
        if moved == idx {
            sift_down(heap, idx, less);
        }
    }
    removed
}

struct HeapState {
    heap: Vec<Arc<Item>>,
    waiters: BTreeMap<u64, oneshot::Sender<Arc<Item>>>,
    next_waiter_id: u64,
}

/// A heap of items ordered by an injected comparator, with cancellation-
/// safe blocking pops: a `pop` on an empty heap registers a waiter and
/// suspends until either a push hands it an item directly, or its
/// cancellation token fires. A handed-off item is never lost to a race
/// with cancellation.
pub struct OrderedSubQueue {
    state: Mutex<HeapState>,
    compare: Box<dyn Fn(&Item, &Item) -> Ordering + Send + Sync>,
}

impl OrderedSubQueue {
    pub fn new(compare: impl Fn(&Item, &Item) -> Ordering + Send + Sync + 'static) -> Self {
        OrderedSubQueue {
            state: Mutex::new(HeapState {
                heap: Vec::new(),
                waiters: BTreeMap::new(),
                next_waiter_id: 0,
            }),
            compare: Box::new(compare),
        }
    }

    fn less(&self, a: &Item, b: &Item) -> bool {
        (self.compare)(a, b) == Ordering::Less
    }

    /// Pushes `item`, attaching it to `owner` for future `update` calls.
    /// If a waiter is already registered, the item is handed directly to
    /// the oldest one and never enters the heap.
    pub fn push(&self, item: Arc<Item>, owner: Weak<dyn SubQueueHandle>) {
        let mut state = self.state.lock().unwrap();
        if let Some((&id, _)) = state.waiters.iter().next() {
            let tx = state.waiters.remove(&id).expect("id came from this map");
            let _ = tx.send(item);
            return;
        }
        let less = |a: &Item, b: &Item| self.less(a, b);
        let idx = heap_push(&mut state.heap, item, &less);
        let item = state.heap[idx].clone();
        item.attach(owner, idx);
    }

    /// Pops the head item, blocking until one is pushed or `cancel` fires.
    pub async fn pop(&self, cancel: &CancellationToken) -> Option<Arc<Item>> {
        let (id, mut rx) = {
            let mut state = self.state.lock().unwrap();
            if !state.heap.is_empty() {
                let less = |a: &Item, b: &Item| self.less(a, b);
                return Some(remove_at(&mut state.heap, 0, &less));
            }
            let id = state.next_waiter_id;
            state.next_waiter_id += 1;
            let (tx, rx) = oneshot::channel();
            state.waiters.insert(id, tx);
            (id, rx)
        };

        tokio::select! {
            biased;
            res = &mut rx => return res.ok(),
            _ = cancel.cancelled() => {},
        }

        // Cancelled (or already cancelled on entry). If our registration
        // is still present, nobody claimed it; remove it and give up.
        // Otherwise a push already consumed it and is in flight on `rx`.
        let still_registered = self.state.lock().unwrap().waiters.remove(&id).is_some();
        if still_registered {
            None
        } else {
            rx.await.ok()
        }
    }

    /// Returns the head item without removing it.
    pub fn peek(&self) -> Option<Arc<Item>> {
        self.state.lock().unwrap().heap.first().cloned()
    }

    /// Removes `item` if it is currently attached to this heap; a no-op
    /// otherwise (already removed, or owned by a different sub-queue).
    pub fn remove(&self, item: &Arc<Item>) {
        let mut state = self.state.lock().unwrap();
        let idx = item.index();
        if idx == NO_INDEX || idx >= state.heap.len() || !Arc::ptr_eq(&state.heap[idx], item) {
            return;
        }
        let less = |a: &Item, b: &Item| self.less(a, b);
        remove_at(&mut state.heap, idx, &less);
    }

    pub fn len(&self) -> usize {
        self.state.lock().unwrap().heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl SubQueueHandle for OrderedSubQueue {
    fn update(&self, item: &Arc<Item>) {
        let mut state = self.state.lock().unwrap();
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
}
