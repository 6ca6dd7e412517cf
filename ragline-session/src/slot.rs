use std::ops::Deref;
use std::sync::{Arc, Mutex, PoisonError};

use dashmap::DashMap;
use ragline_graph::RunHandle;
use tokio_util::sync::CancellationToken;

/// Per-conversation coordination: the run lock plus the cancel switch of the
/// activation currently holding it.
#[derive(Default)]
pub(crate) struct RunSlot {
    pub(crate) gate: tokio::sync::Mutex<SlotState>,
    cancel: Mutex<Option<CancellationToken>>,
}

#[derive(Default)]
pub(crate) struct SlotState {
    pub(crate) handle: Option<RunHandle>,
}

impl SlotState {
    /// A run with no committed step cannot be found through the store's
    /// conversation index, so only this slot remembers it.
    fn pins_run(&self) -> bool {
        matches!(&self.handle, Some(handle) if handle.last_step == 0)
    }
}

impl RunSlot {
    pub(crate) fn arm(&self) -> Armed<'_> {
        let token = CancellationToken::new();
        *self.cancel.lock().unwrap_or_else(PoisonError::into_inner) = Some(token.clone());
        Armed { slot: self, token }
    }

    /// Signals the running activation, if any.
    pub(crate) fn cancel(&self) -> bool {
        match self
            .cancel
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
        {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    fn is_idle(&self) -> bool {
        self.gate
            .try_lock()
            .map(|state| !state.pins_run())
            .unwrap_or(false)
    }
}

/// Cancel switch for one activation; disarms the slot when dropped.
pub(crate) struct Armed<'a> {
    slot: &'a RunSlot,
    token: CancellationToken,
}

impl Armed<'_> {
    pub(crate) fn token(&self) -> &CancellationToken {
        &self.token
    }
}

impl Drop for Armed<'_> {
    fn drop(&mut self) {
        *self.slot.cancel.lock().unwrap_or_else(PoisonError::into_inner) = None;
    }
}

/// Slots of the conversations that currently need in-memory state.
#[derive(Default)]
pub(crate) struct SlotMap {
    slots: DashMap<String, Arc<RunSlot>>,
}

impl SlotMap {
    pub(crate) fn lease(&self, conversation_id: &str) -> SlotLease<'_> {
        let slot = Arc::clone(
            self.slots
                .entry(conversation_id.to_string())
                .or_default()
                .value(),
        );
        SlotLease {
            map: self,
            key: conversation_id.to_string(),
            slot,
        }
    }

    /// Like `lease`, but never creates a slot.
    pub(crate) fn existing(&self, conversation_id: &str) -> Option<SlotLease<'_>> {
        let slot = Arc::clone(self.slots.get(conversation_id)?.value());
        Some(SlotLease {
            map: self,
            key: conversation_id.to_string(),
            slot,
        })
    }

    pub(crate) fn cancel(&self, conversation_id: &str) -> bool {
        self.slots
            .get(conversation_id)
            .map(|slot| slot.value().cancel())
            .unwrap_or(false)
    }

    pub(crate) fn len(&self) -> usize {
        self.slots.len()
    }
}

/// Shared use of one slot. The last lease to go drops the slot from the map
/// unless it still pins an uncommitted run.
pub(crate) struct SlotLease<'a> {
    map: &'a SlotMap,
    key: String,
    slot: Arc<RunSlot>,
}

impl Deref for SlotLease<'_> {
    type Target = RunSlot;

    fn deref(&self) -> &RunSlot {
        &self.slot
    }
}

impl Drop for SlotLease<'_> {
    fn drop(&mut self) {
        // The map holds one reference and this lease the other.
        self.map.slots.remove_if(&self.key, |_, slot| {
            Arc::ptr_eq(slot, &self.slot) && Arc::strong_count(slot) == 2 && slot.is_idle()
        });
    }
}
