use thiserror::Error;

use crate::item::ItemState;

/// Returned by [`crate::item::Item::switch_state`] when the requested
/// transition is not in the allowed-transition table.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("item {key}: cannot transition from {from} to {to}")]
pub struct ItemTransitionError {
    pub key: String,
    pub from: ItemState,
    pub to: ItemState,
}
