//! Single-cursor tracker.
//!
//! A table allows at most one live traversal cursor. The tracker is a
//! flag inside the table; `try_acquire` hands out a guard that clears the
//! flag on drop. The check runs in every build profile.

use core::cell::Cell;
use core::marker::PhantomData;

/// Per-table cursor flag. Embed in a struct and call
/// `let _g = self.cursor_slot.try_acquire()?;` to claim it.
#[derive(Debug)]
pub(crate) struct CursorSlot {
    active: Cell<bool>,
    // Keep !Send + !Sync in line with single-threaded design.
    _nosend: PhantomData<*mut ()>,
}

/// Returned when the slot is already held.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) struct SlotBusy;

impl CursorSlot {
    pub(crate) const fn new() -> Self {
        Self {
            active: Cell::new(false),
            _nosend: PhantomData,
        }
    }

    pub(crate) fn is_active(&self) -> bool {
        self.active.get()
    }

    /// Claim the slot; fails if a guard from this slot is still alive.
    #[inline]
    pub(crate) fn try_acquire(&self) -> Result<CursorSlotGuard<'_>, SlotBusy> {
        if self.active.replace(true) {
            return Err(SlotBusy);
        }
        Ok(CursorSlotGuard { owner: self })
    }
}

impl Default for CursorSlot {
    fn default() -> Self {
        Self::new()
    }
}

/// RAII guard returned by `CursorSlot::try_acquire`.
#[derive(Debug)]
pub(crate) struct CursorSlotGuard<'a> {
    owner: &'a CursorSlot,
}

impl Drop for CursorSlotGuard<'_> {
    fn drop(&mut self) {
        debug_assert!(self.owner.active.get());
        self.owner.active.set(false);
    }
}
