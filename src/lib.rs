//! A concurrent, poll-free, in-memory job queue.
//!
//! Items move between a priority/size/age-ordered ready dispatcher (one
//! sub-queue per reserve group), a run sub-queue (expiring by a
//! time-to-release deadline), and a delay sub-queue (expiring by a
//! ready-at deadline). Reservers that find their group's ready queue
//! empty suspend cooperatively rather than polling, and are served in
//! registration order as items are pushed.
//!
//! See [`Queue`] for the public surface.

mod dispatcher;
mod error;
mod expiring;
mod heap;
mod item;
mod queue;

pub use error::ItemTransitionError;
pub use item::{Item, ItemState, DEFAULT_DELAY, DEFAULT_TTR};
pub use queue::{AddParams, AddReport, Queue};
